mod log_entry;
mod store;

pub use log_entry::CodecError;
pub use log_entry::RaftLogEntry;
pub use log_entry::RequestCode;
pub use log_entry::LOG_ENTRY_HEADER_LEN;
pub use store::LogSegments;
pub use store::LogStore;
pub use store::LogStoreError;
