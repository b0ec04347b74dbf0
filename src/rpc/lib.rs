pub mod client;
pub mod envelope;
pub mod hash;

pub use client::{ConnectionPool, PsClient};
pub use envelope::{PartitionData, WireError};
