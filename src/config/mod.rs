pub mod loader;
pub mod models;
pub mod settings;
pub mod validation;

pub use loader::{ConfigFormat, load_configuration, load_settings};
pub use models::*;
pub use settings::*;
pub use validation::{ConfigurationValidator, ValidationError, ValidationResult, validate_settings};
