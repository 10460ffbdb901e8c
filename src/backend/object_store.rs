use crate::backend::{DirectoryEntry, Dn, EntryId, Modification};
use crate::replication::Usn;
use bytes::Bytes;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

/// Indexed-attribute filters. This is all the core needs from the search planner: point lookups
/// (log entry by index, object by GUID) and a numeric range (log entries at/after an index).
#[derive(Clone, Debug)]
pub enum Filter {
    All,
    Equal(String, Bytes),
    /// Attribute value parsed as a decimal u64.
    GreaterOrEqual(String, u64),
}

impl Filter {
    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::All => true,
            Filter::Equal(name, expected) => entry
                .attribute(name)
                .map(|attr| attr.has_value(expected))
                .unwrap_or(false),
            Filter::GreaterOrEqual(name, min) => entry
                .attribute(name)
                .map(|attr| {
                    attr.values.iter().any(|v| {
                        std::str::from_utf8(v)
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(|n| n >= *min)
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    #[error("parent of {0} does not exist")]
    NoSuchParent(String),
    #[error("operation not allowed on non-leaf entry {0}")]
    NotAllowedOnNonLeaf(String),
    #[error("write attempted in a read transaction")]
    ReadOnlyTransaction,
    #[error("backend failure: {0}")]
    Internal(String),
}

/// ObjectStore is the storage engine as seen by the replication core. Everything, including the
/// raft log and raft state, is persisted as directory objects through this interface.
pub trait ObjectStore: Send + Sync {
    fn txn_begin(&self, mode: TxnMode) -> Result<Box<dyn Transaction + '_>, BackendError>;

    /// Allocate the next update sequence number. Callers go through [crate::backend::WriteQueue]
    /// so numbers are handed out in commit order.
    fn next_usn(&self) -> Result<Usn, BackendError>;
}

/// A backend transaction. Dropping a transaction without calling `commit` aborts it.
pub trait Transaction {
    fn mode(&self) -> TxnMode;

    /// Add a new entry. Assigns an ordinary id when `entry.id` is unassigned.
    fn entry_add(&mut self, entry: DirectoryEntry) -> Result<EntryId, BackendError>;

    fn entry_modify(&mut self, id: EntryId, mods: &[Modification]) -> Result<(), BackendError>;

    /// Physically remove a leaf entry.
    fn entry_delete(&mut self, id: EntryId) -> Result<(), BackendError>;

    fn dn_to_entry_id(&self, dn: &Dn) -> Result<EntryId, BackendError>;

    fn id_to_entry(&self, id: EntryId) -> Result<DirectoryEntry, BackendError>;

    /// Highest id assigned to an ordinary (non log entry) object.
    fn max_entry_id(&self) -> Result<EntryId, BackendError>;

    fn search(&self, base: &Dn, scope: SearchScope, filter: &Filter) -> Result<Vec<DirectoryEntry>, BackendError>;

    fn commit(self: Box<Self>) -> Result<(), BackendError>;

    fn abort(self: Box<Self>);
}
