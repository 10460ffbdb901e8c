//! Multi-master replication: version vectors, conflict resolution, and applying inbound changes to
//! the local object store.
mod applier;
mod attr_names;
mod conflict;
mod metadata;
mod reconcile;
mod update;

pub use applier::is_tombstone;
pub use applier::Applied;
pub use applier::ApplyError;
pub use applier::ApplyTxn;
pub use applier::ReplicationApplier;
pub use attr_names::OBJECT_GUID;
pub use conflict::resolve;
pub use conflict::ConflictResolver;
pub use conflict::Winner;
pub use metadata::AttributeMetadata;
pub use metadata::MetadataParseError;
pub use metadata::Usn;
pub use metadata::ValueMetadata;
pub use metadata::ValueOp;
pub use reconcile::ConflictKind;
pub use reconcile::ConflictRecord;
pub use reconcile::ReconciliationQueue;
pub use update::ChangeRecordError;
pub use update::OperationKind;
pub use update::ReplicationUpdate;
