mod api;
mod backend;
mod commitlog;
mod replica;
mod replication;
mod server;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_directory_node;
pub use api::CampaignResult;
pub use api::DirectoryNode;
pub use api::DirectoryNodeConfig;
pub use api::DirectoryWriteError;
pub use api::MemberInfo;
pub use api::NodeCreationError;
pub use api::RaftOptions;
pub use api::WriteOutput;
pub use backend::Attribute;
pub use backend::BackendError;
pub use backend::DirectoryEntry;
pub use backend::Dn;
pub use backend::EntryId;
pub use backend::Filter;
pub use backend::InMemoryObjectStore;
pub use backend::ModOp;
pub use backend::Modification;
pub use backend::ObjectStore;
pub use backend::SearchScope;
pub use backend::Transaction;
pub use backend::TxnMode;
pub use backend::WriteQueueError;
pub use commitlog::CodecError;
pub use commitlog::LogStoreError;
pub use commitlog::RaftLogEntry;
pub use commitlog::RequestCode;
pub use replica::LocalError;
pub use replica::PeerId;
pub use replica::PersistentState;
pub use replica::Role;
pub use replica::StateError;
pub use replica::Term;
pub use replication::Applied;
pub use replication::ApplyError;
pub use replication::AttributeMetadata;
pub use replication::ChangeRecordError;
pub use replication::ConflictKind;
pub use replication::ConflictRecord;
pub use replication::OperationKind;
pub use replication::Usn;
pub use replication::ValueMetadata;
pub use replication::ValueOp;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
