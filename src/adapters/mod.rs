pub mod acme;
pub mod http;
pub mod http_client;
pub mod nginx;

pub use acme::{AcmeAcquirer, AcmeSettings};
pub use http::StatusServer;
pub use http_client::HyperHttpClient;
pub use nginx::{NginxController, NginxSettings};
