pub mod availability;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod node;
pub mod partition;
pub mod shutdown;
pub mod worker;
