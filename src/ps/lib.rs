pub mod admin;
pub mod engine;
pub mod partition;
pub mod sn;

pub use admin::{AdminHandlers, PsAdminServer};
pub use engine::{IndexStatus, MemoryEngine, PartitionInfo, Reader};
pub use partition::{ConsensusGroup, LocalPartition, PartitionTable, SingleNodeConsensus};
pub use sn::SnFile;
