pub mod config;
pub mod health;
pub mod items;
pub mod system;
pub mod topology;
