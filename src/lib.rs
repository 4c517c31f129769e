pub mod app;

pub use app::{node_descriptor, Application};
