//! 分布式工作队列：按需拉取、优先级出队和孤儿回收

pub mod priority;
pub mod producer;

pub use priority::PriorityTable;
pub use producer::{WorkQueueConfig, WorkQueueProducer};
