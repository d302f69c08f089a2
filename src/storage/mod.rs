pub mod jobs;
pub mod memory_queue;
pub mod mongo;
pub mod queue;

// Re-export common types
pub use jobs::{FileJobStore, JobStore, JobStoreFactory, MemoryJobStore};
pub use memory_queue::MemoryBroker;
pub use mongo::MongoJobStore;
pub use queue::{RedisBroker, TaskBroker};
