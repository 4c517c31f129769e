//! 进程监督：崩溃重启、重启预算和统一停机

pub mod budget;
pub mod shutdown;
pub mod supervisor;

pub use budget::RestartBudget;
pub use shutdown::ShutdownManager;
pub use supervisor::{Alarm, ProcessInfo, ProcessState, SupervisionPolicy, Supervisor};
