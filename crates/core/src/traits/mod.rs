pub mod audit;
pub mod config_client;
pub mod executor;
pub mod heartbeat;
pub mod store;
pub mod work_source;

pub use audit::*;
pub use config_client::*;
pub use executor::*;
pub use heartbeat::*;
pub use store::*;
pub use work_source::*;
