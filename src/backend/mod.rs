//! The object store as consumed by the replication core, plus an in-memory reference
//! implementation and the write queue that orders all write transactions.
mod entry;
mod in_memory;
mod object_store;
mod write_queue;

pub use entry::Attribute;
pub use entry::DirectoryEntry;
pub use entry::Dn;
pub use entry::EntryId;
pub use entry::ModOp;
pub use entry::Modification;
pub use entry::LOG_ENTRY_EID_PREFIX;
pub use in_memory::InMemoryObjectStore;
pub use object_store::BackendError;
pub use object_store::Filter;
pub use object_store::ObjectStore;
pub use object_store::SearchScope;
pub use object_store::Transaction;
pub use object_store::TxnMode;
pub use write_queue::QueuedWrite;
pub use write_queue::WriteQueue;
pub use write_queue::WriteQueueError;
