pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigError, load_config, load_config_or_default};
pub use models::AppConfig;
pub use validation::{ConfigValidator, ValidationError};
