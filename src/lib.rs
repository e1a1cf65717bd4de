pub mod cluster;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod worker;
