use crate::backend::Dn;
use crate::replication::attr_names::OBJECT_GUID;
use crate::replication::{AttributeMetadata, OperationKind, ReplicationUpdate};
use parking_lot::Mutex;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// Replicated add of a name that already exists locally.
    AlreadyExists,
    /// Replicated add whose parent does not exist locally.
    MissingParent,
    /// Replicated modify or delete of an object that does not exist locally.
    MissingObject,
    /// Replicated delete of an object that still has children.
    NonLeaf,
}

/// A replicated change that could not be applied and will not be retried. Enough context is kept
/// to diagnose why replicas diverged.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    pub operation: OperationKind,
    pub dn: Dn,
    pub object_guid: Option<String>,
    pub attribute: Option<String>,
    pub metadata: Option<AttributeMetadata>,
    pub partner_id: String,
    pub partner_usn: u64,
}

impl ConflictRecord {
    pub fn from_update(kind: ConflictKind, operation: OperationKind, update: &ReplicationUpdate) -> Self {
        // The first attribute that carries metadata identifies which change this was.
        let first = update
            .entry
            .attributes
            .iter()
            .find_map(|a| update.metadata_for(&a.name).map(|md| (a.name.clone(), md.clone())));

        ConflictRecord {
            kind,
            operation,
            dn: update.entry.dn.clone(),
            object_guid: update.entry.first_value_str(OBJECT_GUID).map(str::to_string),
            attribute: first.as_ref().map(|(name, _)| name.clone()),
            metadata: first.map(|(_, md)| md),
            partner_id: update.partner_id.clone(),
            partner_usn: update.partner_usn,
        }
    }
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on {:?} of {} (guid {:?}), attr {:?} meta {}, from partner {} usn {}",
            self.kind,
            self.operation,
            self.dn,
            self.object_guid,
            self.attribute,
            self.metadata.as_ref().map(|md| md.to_string()).unwrap_or_default(),
            self.partner_id,
            self.partner_usn
        )
    }
}

/// Conflicts waiting for a reconciliation pass or an operator.
pub struct ReconciliationQueue {
    logger: slog::Logger,
    pending: Mutex<Vec<ConflictRecord>>,
}

impl ReconciliationQueue {
    pub fn new(logger: slog::Logger) -> Self {
        ReconciliationQueue {
            logger,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, record: ConflictRecord) {
        slog::warn!(
            self.logger,
            "NOT resolving possible replication conflict, system may not converge for this object: {}",
            record
        );
        self.pending.lock().push(record);
    }

    pub fn snapshot(&self) -> Vec<ConflictRecord> {
        self.pending.lock().clone()
    }

    pub fn drain(&self) -> Vec<ConflictRecord> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Attribute, DirectoryEntry};

    fn record(name: &str) -> ConflictRecord {
        let update = ReplicationUpdate::new(
            DirectoryEntry::new(Dn::new(format!("cn={}", name)), vec![Attribute::single("cn", name.to_string())]),
            "peer",
        );
        ConflictRecord::from_update(ConflictKind::AlreadyExists, OperationKind::Add, &update)
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = ReconciliationQueue::new(slog::Logger::root(slog::Discard, slog::o!()));
        queue.push(record("a"));
        queue.push(record("b"));
        assert_eq!(queue.snapshot().len(), 2);
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(
            drained.iter().map(|r| r.dn.as_str()).collect::<Vec<_>>(),
            vec!["cn=a", "cn=b"]
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
