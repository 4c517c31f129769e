pub mod checksum;
pub mod config;
pub mod errors;
pub mod executor_registry;
pub mod models;
pub mod traits;

pub use checksum::*;
pub use self::config::AppConfig;
pub use errors::*;
pub use executor_registry::ExecutorRegistry;
pub use models::*;
pub use traits::*;
