//! Persistence and event-bus collaborators for femrelay.

pub mod bus;
pub mod memory;
pub mod repository;

pub use bus::{BroadcastBus, BusMessage, EventPublisher};
pub use memory::{MemoryStore, StoreData};
pub use repository::{FileRepository, JobRepository, NodeRepository, StoreError};
