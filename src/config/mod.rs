//! Configuration module
//!
//! Loads and validates the YAML file that declares the clicker, alert,
//! key pressers and notification delivery.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{ConfigLimits, ConfigLoader, LoadResult, LoadWarning, LoaderOptions};
pub use schema::*;
pub use validation::{ValidationResult, Validator};
