//! 工作队列的消费端：拉取、执行并上报工作项

pub mod consumer;
pub mod executors;
pub mod remote;

pub use consumer::{WorkConsumer, WorkConsumerConfig};
pub use executors::{ShellExecutor, ShellItemParams};
pub use remote::HttpWorkSource;
