pub mod certificate;
pub mod clock;
pub mod hostname;
pub mod orchestrator;
pub mod renderer;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub mod testing;

pub use certificate::{CertificateRecord, CertificateStatus, CertificateStore, RenewalWindow};
pub use clock::{Clock, SystemClock};
pub use hostname::Hostname;
pub use orchestrator::{BootstrapError, BootstrapOrchestrator, BootstrapSettings, Bootstrapped, Collaborators};
pub use renderer::{ConfigRenderer, ProxyMode, RenderSettings};
pub use scheduler::{RenewalScheduler, RenewalStatus, RenewalTrigger, SchedulerSettings};
