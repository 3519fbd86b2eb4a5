pub mod config;
pub mod error;
pub mod event_bus;
pub mod steps;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{CadenceError, CadenceResult};
