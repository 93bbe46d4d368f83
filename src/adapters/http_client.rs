use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;

use crate::ports::http_client::{FetchFuture, FetchedResponse, HttpClient, HttpClientError};

/// Plain-HTTP client used to probe the proxy's challenge location on loopback.
pub struct HyperHttpClient {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HyperHttpClient {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HyperHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for HyperHttpClient {
    fn fetch<'a>(&'a self, url: &'a str, limit: Duration) -> FetchFuture<'a> {
        Box::pin(async move {
            let req = Request::builder()
                .method("GET")
                .uri(url)
                .body(Empty::<Bytes>::new())
                .map_err(|e| HttpClientError::InvalidRequestError(e.to_string()))?;

            tracing::debug!(url, "Fetching");

            let exchange = async {
                let response = self
                    .client
                    .request(req)
                    .await
                    .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?;
                let status = response.status().as_u16();
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?
                    .to_bytes();
                Ok(FetchedResponse {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                })
            };

            match timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(url, ?limit, "Fetch timed out");
                    Err(HttpClientError::TimeoutError(limit))
                }
            }
        })
    }
}
