//! Export pipeline services and their storage and messaging backends.

pub mod assembler;
pub mod kafka;
pub mod lifecycle;
pub mod message_bus;
pub mod object_store;
pub mod publisher;
pub mod s3;

pub use assembler::{Assembler, AssemblyError};
pub use kafka::KafkaMessageBus;
pub use lifecycle::{LifecycleController, LifecycleError};
pub use message_bus::{MemoryMessageBus, MessageBus, MessageBusError, OutboundMessage};
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use publisher::{PublishError, Publisher, PublisherTask, PublisherWorker};
pub use s3::S3ObjectStore;
