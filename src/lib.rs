/// certgate - TLS bootstrap and renewal supervisor for an nginx reverse proxy
///
/// This crate starts nginx in front of a backend service and:
/// - obtains a certificate over ACME with HTTP-01 challenges
/// - switches nginx from plaintext to HTTPS once the certificate is installed
/// - renews the certificate inside its renewal window and reloads nginx
pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::adapters::{AcmeAcquirer, HyperHttpClient, NginxController, StatusServer};
pub use crate::core::{BootstrapError, BootstrapOrchestrator};
