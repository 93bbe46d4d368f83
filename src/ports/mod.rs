pub mod acquirer;
pub mod http_client;
pub mod proxy;

pub use acquirer::{AcquireError, AcquireFuture, AcquireResult, CertificateAcquirer};
pub use http_client::{FetchedResponse, HttpClient, HttpClientError};
pub use proxy::{ProxyController, ProxyError, ProxyResult};
