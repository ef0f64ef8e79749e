// Broadcast Bench - Library root for testing

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod mock_broker;
pub mod payload;
pub mod report;
pub mod stall;
pub mod subscriber;
pub mod transport;

pub use error::{BenchError, Result};
