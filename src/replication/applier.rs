use crate::backend::{
    Attribute, BackendError, DirectoryEntry, Dn, EntryId, Filter, ModOp, Modification, QueuedWrite, SearchScope,
    Transaction, WriteQueue, WriteQueueError,
};
use crate::replication::attr_names::{
    self, CN, DELETED_OBJECTS_DN, IS_DELETED, IS_DELETED_TRUE, LAST_KNOWN_DN, OBJECT_CLASS, OBJECT_GUID,
    USN_CHANGED, USN_CREATED, VALUE_META_DATA,
};
use crate::replication::{
    AttributeMetadata, ConflictKind, ConflictRecord, ConflictResolver, OperationKind, ReconciliationQueue,
    ReplicationUpdate, Usn, ValueMetadata, ValueOp,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("replication conflict: {0}")]
    Conflict(ConflictRecord),
    #[error("no such object: {0}")]
    NotFound(Dn),
    #[error("object {0} is not a leaf")]
    NonLeaf(Dn),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    WriteQueue(#[from] WriteQueueError),
}

impl ApplyError {
    /// Backend and queue failures may succeed if retried. Everything else is a property of the
    /// change itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Backend(_) | ApplyError::WriteQueue(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub id: EntryId,
    pub dn: Dn,
    pub usn: Usn,
}

/// A write transaction opened for applying replicated changes: the schema lock, then the head of
/// the write queue. Dropping it without committing aborts everything done through it.
pub struct ApplyTxn<'a> {
    // Released before the schema lock.
    write: QueuedWrite<'a>,
    _schema: MutexGuard<'a, ()>,
}

impl<'a> ApplyTxn<'a> {
    pub fn usn(&self) -> Usn {
        self.write.usn()
    }

    pub fn txn(&mut self) -> &mut (dyn Transaction + 'a) {
        self.write.txn()
    }

    pub fn commit(self) -> Result<(), BackendError> {
        self.write.commit()
    }

    pub fn commit_then<F: FnOnce()>(self, on_commit: F) -> Result<(), BackendError> {
        self.write.commit_then(on_commit)
    }
}

/// ReplicationApplier turns a [ReplicationUpdate] into local adds, modifies and deletes.
///
/// Failures for a single update (conflicts, missing objects, non-leaf deletes) are logged, recorded
/// in the [ReconciliationQueue] and returned. The applier stays usable for the next update.
pub struct ReplicationApplier {
    logger: slog::Logger,
    queue: Arc<WriteQueue>,
    schema_lock: Mutex<()>,
    invocation_id: String,
    resolver: ConflictResolver,
    reconciliation: ReconciliationQueue,
}

impl ReplicationApplier {
    pub fn new(logger: slog::Logger, queue: Arc<WriteQueue>, invocation_id: String) -> Self {
        ReplicationApplier {
            resolver: ConflictResolver::new(logger.new(slog::o!("component" => "conflict-resolver"))),
            reconciliation: ReconciliationQueue::new(logger.new(slog::o!("component" => "reconciliation"))),
            logger,
            queue,
            schema_lock: Mutex::new(()),
            invocation_id,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn reconciliation(&self) -> &ReconciliationQueue {
        &self.reconciliation
    }

    /// Lock order: schema, then the write queue (and with it the backend write transaction).
    pub fn begin(&self) -> Result<ApplyTxn<'_>, ApplyError> {
        let schema = self.schema_lock.lock();
        let write = self.queue.begin_write()?;

        Ok(ApplyTxn { write, _schema: schema })
    }

    /// Apply `update` in its own transaction.
    pub fn apply(&self, update: &ReplicationUpdate, kind: OperationKind) -> Result<Applied, ApplyError> {
        let mut txn = self.begin()?;
        let applied = self.apply_in(&mut txn, update, kind)?;
        txn.commit()?;

        Ok(applied)
    }

    /// Apply `update` inside a transaction owned by the caller, so the caller can persist more
    /// state before committing. On error the caller must drop `txn` instead of committing it.
    pub fn apply_in(
        &self,
        txn: &mut ApplyTxn<'_>,
        update: &ReplicationUpdate,
        kind: OperationKind,
    ) -> Result<Applied, ApplyError> {
        let result = match kind {
            OperationKind::Add => self.add(txn, update),
            OperationKind::Modify => self.modify(txn, update),
            OperationKind::Delete => self.delete(txn, update),
        };

        match &result {
            Ok(applied) => slog::debug!(
                self.logger,
                "Applied replicated {:?} of {} at usn {:?}",
                kind,
                applied.dn,
                applied.usn
            ),
            Err(ApplyError::Conflict(record)) => self.reconciliation.push(record.clone()),
            Err(ApplyError::NotFound(_)) => {
                self.reconciliation
                    .push(ConflictRecord::from_update(ConflictKind::MissingObject, kind, update));
            }
            Err(ApplyError::NonLeaf(_)) => {
                self.reconciliation
                    .push(ConflictRecord::from_update(ConflictKind::NonLeaf, kind, update));
            }
            Err(e) => slog::error!(
                self.logger,
                "Failed to apply replicated {:?} of {}: {}",
                kind,
                update.entry.dn,
                e
            ),
        }

        result
    }

    fn add(&self, txn: &mut ApplyTxn<'_>, update: &ReplicationUpdate) -> Result<Applied, ApplyError> {
        let usn = txn.usn();
        let mut entry = DirectoryEntry::new(update.entry.dn.clone(), Vec::new());

        for attr in update.entry.attributes.iter() {
            if attr_names::is_locally_maintained(&attr.name) {
                continue;
            }
            let metadata = match update.metadata_for(&attr.name) {
                Some(supplied) => supplied.clone().stamped(usn),
                None => AttributeMetadata::new_local(usn, &self.invocation_id),
            };
            entry
                .attributes
                .push(Attribute::new(attr.name.as_str(), attr.values.clone()).with_metadata(metadata));
        }

        // Attributes described only by metadata, as sent for a tombstone.
        for (name, supplied) in update.attribute_metadata.iter() {
            if entry.attribute(name).is_none() && !attr_names::is_locally_maintained(name) {
                entry
                    .attributes
                    .push(Attribute::new(name.as_str(), Vec::new()).with_metadata(supplied.clone().stamped(usn)));
            }
        }

        entry.attributes.push(self.local_usn_attribute(USN_CREATED, usn));
        entry.attributes.push(self.local_usn_attribute(USN_CHANGED, usn));
        if !update.value_metadata.is_empty() {
            let values = update
                .value_metadata
                .iter()
                .map(|vm| stamp_value(vm, usn).to_bytes())
                .collect();
            entry.attributes.push(Attribute::new(VALUE_META_DATA, values));
        }

        if is_tombstone(&entry) {
            self.ensure_deleted_objects_container(txn.txn(), usn)?;
        }

        let dn = entry.dn.clone();
        match txn.txn().entry_add(entry) {
            Ok(id) => Ok(Applied { id, dn, usn }),
            Err(BackendError::AlreadyExists(_)) => Err(ApplyError::Conflict(ConflictRecord::from_update(
                ConflictKind::AlreadyExists,
                OperationKind::Add,
                update,
            ))),
            Err(BackendError::NoSuchParent(_)) => Err(ApplyError::Conflict(ConflictRecord::from_update(
                ConflictKind::MissingParent,
                OperationKind::Add,
                update,
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn modify(&self, txn: &mut ApplyTxn<'_>, update: &ReplicationUpdate) -> Result<Applied, ApplyError> {
        let usn = txn.usn();
        let target = self.resolve_target(txn.txn(), update)?;

        let mut mods = self.resolver.resolve_attributes(update, &target, usn);
        mods.push(Modification::replace(self.local_usn_attribute(USN_CHANGED, usn)));
        txn.txn().entry_modify(target.id, &mods)?;

        let value_mods = self.resolver.resolve_values(update, &target, usn);
        if !value_mods.is_empty() {
            txn.txn().entry_modify(target.id, &value_mods)?;
        }

        Ok(Applied {
            id: target.id,
            dn: target.dn,
            usn,
        })
    }

    /// A delete is a modify that sets the tombstone markers, followed by a move under the deleted
    /// objects container.
    fn delete(&self, txn: &mut ApplyTxn<'_>, update: &ReplicationUpdate) -> Result<Applied, ApplyError> {
        let usn = txn.usn();
        let target = self.resolve_target(txn.txn(), update)?;
        if is_tombstone(&target) {
            return Err(ApplyError::NotFound(target.dn));
        }
        if !txn
            .txn()
            .search(&target.dn, SearchScope::OneLevel, &Filter::All)?
            .is_empty()
        {
            return Err(ApplyError::NonLeaf(target.dn));
        }

        let update = self.with_tombstone_markers(update, &target);
        let mut mods = self.resolver.resolve_attributes(&update, &target, usn);
        mods.push(Modification::replace(self.local_usn_attribute(USN_CHANGED, usn)));
        txn.txn().entry_modify(target.id, &mods)?;

        let mut tombstone = txn.txn().id_to_entry(target.id)?;
        if !is_tombstone(&tombstone) {
            slog::warn!(
                self.logger,
                "Replicated delete of {} lost to a newer local {}, object is kept",
                target.dn,
                IS_DELETED
            );
            return Ok(Applied {
                id: target.id,
                dn: target.dn,
                usn,
            });
        }

        self.ensure_deleted_objects_container(txn.txn(), usn)?;
        txn.txn().entry_delete(target.id)?;
        tombstone.dn = tombstone_dn(&tombstone);
        let dn = tombstone.dn.clone();
        let id = txn.txn().entry_add(tombstone)?;

        Ok(Applied { id, dn, usn })
    }

    /// Find the local object an update is about. The object GUID is tried first since replicas may
    /// disagree about the name.
    fn resolve_target(&self, txn: &dyn Transaction, update: &ReplicationUpdate) -> Result<DirectoryEntry, ApplyError> {
        if let Some(guid) = update.entry.first_value(OBJECT_GUID) {
            let found = txn.search(
                &Dn::new(""),
                SearchScope::Subtree,
                &Filter::Equal(OBJECT_GUID.to_string(), guid.clone()),
            )?;
            if let Some(local) = found.into_iter().next() {
                if local.dn != update.entry.dn {
                    slog::info!(
                        self.logger,
                        "Fixed up target of replicated change from {} to {}",
                        update.entry.dn,
                        local.dn
                    );
                }
                return Ok(local);
            }
        }

        self.lookup_in(txn, &update.entry.dn)
    }

    fn lookup_in(&self, txn: &dyn Transaction, dn: &Dn) -> Result<DirectoryEntry, ApplyError> {
        match txn.dn_to_entry_id(dn) {
            Ok(id) => Ok(txn.id_to_entry(id)?),
            Err(BackendError::NoSuchObject(_)) => Err(ApplyError::NotFound(dn.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn with_tombstone_markers(&self, update: &ReplicationUpdate, target: &DirectoryEntry) -> ReplicationUpdate {
        let mut update = update.clone();
        let markers = [
            (IS_DELETED, IS_DELETED_TRUE.to_string()),
            (LAST_KNOWN_DN, target.dn.as_str().to_string()),
        ];
        for (name, value) in markers.iter() {
            if update.metadata_for(name).is_none() {
                update.entry.attributes.retain(|a| !a.is_named(name));
                update.entry.attributes.push(Attribute::single(*name, value.clone()));
                update
                    .attribute_metadata
                    .insert(name.to_string(), self.next_version(target, name));
            }
        }

        update
    }

    fn ensure_deleted_objects_container(&self, txn: &mut dyn Transaction, usn: Usn) -> Result<(), ApplyError> {
        let dn = Dn::new(DELETED_OBJECTS_DN);
        match txn.dn_to_entry_id(&dn) {
            Ok(_) => Ok(()),
            Err(BackendError::NoSuchObject(_)) => {
                txn.entry_add(DirectoryEntry::new(
                    dn,
                    vec![
                        self.local_attribute(OBJECT_CLASS, "container", usn),
                        self.local_attribute(CN, "Deleted Objects", usn),
                    ],
                ))?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_attribute(&self, name: &str, value: &str, usn: Usn) -> Attribute {
        Attribute::single(name, value.to_string()).with_metadata(AttributeMetadata::new_local(usn, &self.invocation_id))
    }

    fn local_usn_attribute(&self, name: &str, usn: Usn) -> Attribute {
        self.local_attribute(name, &usn.as_u64().to_string(), usn)
    }

    fn next_version(&self, local: &DirectoryEntry, name: &str) -> AttributeMetadata {
        match local.attribute(name).and_then(|a| a.metadata.as_ref()) {
            Some(current) => current.next_local_version(&self.invocation_id),
            None => AttributeMetadata::first_local_version(&self.invocation_id),
        }
    }

    /// Describe a new object originated on this server. Assigns an object GUID if there is none.
    pub fn originate_add(&self, mut entry: DirectoryEntry) -> ReplicationUpdate {
        if entry.attribute(OBJECT_GUID).is_none() {
            entry
                .attributes
                .push(Attribute::single(OBJECT_GUID, Uuid::new_v4().to_string()));
        }
        entry.attributes.retain(|a| !attr_names::is_locally_maintained(&a.name));

        let mut update = ReplicationUpdate::new(entry, self.invocation_id.clone());
        for attr in update.entry.attributes.iter() {
            update.attribute_metadata.insert(
                attr.name.clone(),
                AttributeMetadata::first_local_version(&self.invocation_id),
            );
        }

        update
    }

    /// Describe a modification originated on this server. Replacing an attribute (or deleting all
    /// of its values) is an attribute level change. Adding or deleting specific values is a value
    /// level change.
    pub fn originate_modify(&self, dn: &Dn, mods: &[Modification]) -> Result<ReplicationUpdate, ApplyError> {
        let local = {
            let txn = self.queue.read()?;
            self.lookup_in(txn.as_ref(), dn)?
        };
        let local_values = value_metadata_of(&local);

        let mut update = ReplicationUpdate::new(self.identity_of(&local), self.invocation_id.clone());
        for m in mods {
            let name = m.attribute.name.as_str();
            if name.eq_ignore_ascii_case(OBJECT_GUID) || attr_names::is_locally_maintained(name) {
                slog::warn!(self.logger, "Ignoring modification of {} on {}", name, dn);
                continue;
            }

            match (m.op, m.attribute.values.is_empty()) {
                (ModOp::Replace, _) | (ModOp::Delete, true) => {
                    update.entry.attributes.retain(|a| !a.is_named(name));
                    if m.op == ModOp::Replace && !m.attribute.values.is_empty() {
                        update
                            .entry
                            .attributes
                            .push(Attribute::new(name, m.attribute.values.clone()));
                    }
                    update
                        .attribute_metadata
                        .insert(name.to_string(), self.next_version(&local, name));
                }
                (ModOp::Add, true) => {}
                (op, false) => {
                    let value_op = if op == ModOp::Add { ValueOp::Add } else { ValueOp::Delete };
                    for value in m.attribute.values.iter() {
                        let metadata = match local_values.iter().find(|vm| vm.is_for(name, value)) {
                            Some(current) => current.metadata.next_local_version(&self.invocation_id),
                            None => AttributeMetadata::first_local_version(&self.invocation_id),
                        };
                        update.value_metadata.push(ValueMetadata {
                            attr_name: name.to_string(),
                            metadata,
                            op: value_op,
                            value: value.clone(),
                        });
                    }
                }
            }
        }

        Ok(update)
    }

    /// Describe a delete originated on this server.
    pub fn originate_delete(&self, dn: &Dn) -> Result<ReplicationUpdate, ApplyError> {
        let local = {
            let txn = self.queue.read()?;
            self.lookup_in(txn.as_ref(), dn)?
        };

        let mut update = ReplicationUpdate::new(self.identity_of(&local), self.invocation_id.clone());
        update.entry.attributes.push(Attribute::single(IS_DELETED, IS_DELETED_TRUE));
        update
            .entry
            .attributes
            .push(Attribute::single(LAST_KNOWN_DN, local.dn.as_str().to_string()));
        update
            .attribute_metadata
            .insert(IS_DELETED.to_string(), self.next_version(&local, IS_DELETED));
        update
            .attribute_metadata
            .insert(LAST_KNOWN_DN.to_string(), self.next_version(&local, LAST_KNOWN_DN));

        Ok(update)
    }

    fn identity_of(&self, local: &DirectoryEntry) -> DirectoryEntry {
        let mut entry = DirectoryEntry::new(local.dn.clone(), Vec::new());
        if let Some(guid) = local.attribute(OBJECT_GUID) {
            entry.attributes.push(Attribute::new(OBJECT_GUID, guid.values.clone()));
        }
        entry
    }
}

pub fn is_tombstone(entry: &DirectoryEntry) -> bool {
    entry
        .first_value_str(IS_DELETED)
        .map(|v| v.eq_ignore_ascii_case(IS_DELETED_TRUE))
        .unwrap_or(false)
}

fn tombstone_dn(entry: &DirectoryEntry) -> Dn {
    let name = match entry.first_value_str(OBJECT_GUID) {
        Some(guid) => guid.to_string(),
        None => entry.id.as_u64().to_string(),
    };
    Dn::new(DELETED_OBJECTS_DN).child(&format!("cn={}", name))
}

fn stamp_value(vm: &ValueMetadata, usn: Usn) -> ValueMetadata {
    ValueMetadata {
        metadata: vm.metadata.clone().stamped(usn),
        ..vm.clone()
    }
}

fn value_metadata_of(entry: &DirectoryEntry) -> Vec<ValueMetadata> {
    entry
        .attribute(VALUE_META_DATA)
        .map(|attr| {
            attr.values
                .iter()
                .filter_map(|raw| ValueMetadata::from_bytes(raw).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryObjectStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn applier(invocation_id: &str) -> ReplicationApplier {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let queue = Arc::new(WriteQueue::new(
            logger.clone(),
            Arc::new(InMemoryObjectStore::new()),
            Duration::from_secs(1),
        ));
        let applier = ReplicationApplier::new(logger, queue, invocation_id.to_string());
        let root = applier.originate_add(DirectoryEntry::new(
            Dn::new("dc=example"),
            vec![Attribute::single(OBJECT_CLASS, "domain")],
        ));
        applier.apply(&root, OperationKind::Add).unwrap();
        applier
    }

    fn read(applier: &ReplicationApplier, dn: &str) -> Option<DirectoryEntry> {
        let txn = applier.queue.read().unwrap();
        applier.lookup_in(txn.as_ref(), &Dn::new(dn)).ok()
    }

    fn person(dn: &str, title: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            Dn::new(dn),
            vec![
                Attribute::single(OBJECT_CLASS, "person"),
                Attribute::single("title", title.to_string()),
            ],
        )
    }

    #[test]
    fn add_stamps_local_usn_and_metadata() {
        let a = applier("inv-a");
        let update = a.originate_add(person("cn=alice,dc=example", "engineer"));
        assert!(update.entry.first_value(OBJECT_GUID).is_some());

        let applied = a.apply(&update, OperationKind::Add).unwrap();
        let entry = read(&a, "cn=alice,dc=example").unwrap();

        let usn = applied.usn.as_u64().to_string();
        assert_eq!(entry.first_value_str(USN_CREATED), Some(usn.as_str()));
        assert_eq!(entry.first_value_str(USN_CHANGED), Some(usn.as_str()));
        let title = entry.attribute("title").unwrap().metadata.clone().unwrap();
        assert_eq!(title.version, 1);
        assert_eq!(title.local_usn, applied.usn);
        assert_eq!(title.originating_usn, applied.usn);
        assert_eq!(title.originating_server_id, "inv-a");
    }

    #[test]
    fn replicated_add_conflicts_are_recorded_not_retried() {
        let a = applier("inv-a");
        let update = a.originate_add(person("cn=alice,dc=example", "engineer"));
        a.apply(&update, OperationKind::Add).unwrap();

        match a.apply(&update, OperationKind::Add) {
            Err(ApplyError::Conflict(record)) => {
                assert_eq!(record.kind, ConflictKind::AlreadyExists);
                assert_eq!(record.dn, Dn::new("cn=alice,dc=example"));
                assert_eq!(record.partner_id, "inv-a");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let orphan = a.originate_add(person("cn=bob,ou=missing,dc=example", "engineer"));
        match a.apply(&orphan, OperationKind::Add) {
            Err(e @ ApplyError::Conflict(_)) => assert!(!e.is_transient()),
            other => panic!("expected conflict, got {:?}", other),
        }

        let recorded = a.reconciliation().drain();
        assert_eq!(
            recorded.iter().map(|r| r.kind).collect::<Vec<_>>(),
            vec![ConflictKind::AlreadyExists, ConflictKind::MissingParent]
        );
        assert!(a.reconciliation().is_empty());
    }

    #[test]
    fn replicas_converge_on_concurrent_modifies() {
        let a = applier("inv-a");
        let b = applier("inv-b");
        let add = a.originate_add(person("cn=alice,dc=example", "engineer"));
        a.apply(&add, OperationKind::Add).unwrap();
        b.apply(&add, OperationKind::Add).unwrap();

        let dn = Dn::new("cn=alice,dc=example");
        let replace = |title: &str| vec![Modification::replace(Attribute::single("title", title.to_string()))];
        let from_a = a.originate_modify(&dn, &replace("manager")).unwrap();
        let from_b = b.originate_modify(&dn, &replace("director")).unwrap();

        // Each replica sees its own change first.
        a.apply(&from_a, OperationKind::Modify).unwrap();
        a.apply(&from_b, OperationKind::Modify).unwrap();
        b.apply(&from_b, OperationKind::Modify).unwrap();
        b.apply(&from_a, OperationKind::Modify).unwrap();

        let on_a = read(&a, "cn=alice,dc=example").unwrap();
        let on_b = read(&b, "cn=alice,dc=example").unwrap();
        // Same version, "inv-b" > "inv-a".
        assert_eq!(on_a.first_value_str("title"), Some("director"));
        assert_eq!(on_b.first_value_str("title"), Some("director"));
    }

    #[test]
    fn modify_finds_target_by_guid() {
        let a = applier("inv-a");
        let add = a.originate_add(person("cn=alice,dc=example", "engineer"));
        a.apply(&add, OperationKind::Add).unwrap();

        let mut update = a
            .originate_modify(
                &Dn::new("cn=alice,dc=example"),
                &[Modification::replace(Attribute::single("title", "manager"))],
            )
            .unwrap();
        update.entry.dn = Dn::new("cn=alice-renamed,dc=example");

        let applied = a.apply(&update, OperationKind::Modify).unwrap();
        assert_eq!(applied.dn, Dn::new("cn=alice,dc=example"));
        assert_eq!(
            read(&a, "cn=alice,dc=example").unwrap().first_value_str("title"),
            Some("manager")
        );
    }

    #[test]
    fn modify_of_missing_object_is_reported() {
        let a = applier("inv-a");
        let update = ReplicationUpdate::new(DirectoryEntry::new(Dn::new("cn=ghost,dc=example"), vec![]), "peer");

        match a.apply(&update, OperationKind::Modify) {
            Err(ApplyError::NotFound(dn)) => assert_eq!(dn, Dn::new("cn=ghost,dc=example")),
            other => panic!("expected not found, got {:?}", other),
        }
        assert_eq!(a.reconciliation().snapshot()[0].kind, ConflictKind::MissingObject);

        // Still usable.
        let add = a.originate_add(person("cn=alice,dc=example", "engineer"));
        assert!(a.apply(&add, OperationKind::Add).is_ok());
    }

    #[test]
    fn value_changes() {
        let a = applier("inv-a");
        let dn = Dn::new("cn=group,dc=example");
        let add = a.originate_add(DirectoryEntry::new(
            dn.clone(),
            vec![Attribute::single(OBJECT_CLASS, "group")],
        ));
        a.apply(&add, OperationKind::Add).unwrap();

        let members = |op: fn(Attribute) -> Modification, values: &[&str]| {
            vec![op(Attribute::new(
                "member",
                values.iter().map(|v| Bytes::from(v.to_string())).collect(),
            ))]
        };
        let update = a
            .originate_modify(&dn, &members(Modification::add, &["cn=x", "cn=y"]))
            .unwrap();
        assert_eq!(update.value_metadata.len(), 2);
        a.apply(&update, OperationKind::Modify).unwrap();

        let update = a.originate_modify(&dn, &members(Modification::delete, &["cn=x"])).unwrap();
        assert_eq!(update.value_metadata[0].metadata.version, 2);
        a.apply(&update, OperationKind::Modify).unwrap();

        let group = read(&a, "cn=group,dc=example").unwrap();
        assert_eq!(group.attribute("member").unwrap().values, vec![Bytes::from("cn=y")]);
        assert_eq!(value_metadata_of(&group).len(), 2);
    }

    #[test]
    fn delete_moves_object_to_tombstone() {
        let a = applier("inv-a");
        let add = a.originate_add(person("cn=alice,dc=example", "engineer"));
        let guid = add.entry.first_value_str(OBJECT_GUID).unwrap().to_string();
        a.apply(&add, OperationKind::Add).unwrap();

        let delete = a.originate_delete(&Dn::new("cn=alice,dc=example")).unwrap();
        let applied = a.apply(&delete, OperationKind::Delete).unwrap();

        assert!(read(&a, "cn=alice,dc=example").is_none());
        let tombstone = read(&a, applied.dn.as_str()).unwrap();
        assert_eq!(applied.dn, Dn::new(format!("cn={},{}", guid, DELETED_OBJECTS_DN)));
        assert!(is_tombstone(&tombstone));
        assert_eq!(tombstone.first_value_str(LAST_KNOWN_DN), Some("cn=alice,dc=example"));

        // The tombstone is found by GUID, and is already deleted.
        assert!(matches!(
            a.apply(&delete, OperationKind::Delete),
            Err(ApplyError::NotFound(_))
        ));
    }

    #[test]
    fn delete_of_non_leaf_changes_nothing() {
        let a = applier("inv-a");
        let ou = a.originate_add(DirectoryEntry::new(
            Dn::new("ou=people,dc=example"),
            vec![Attribute::single(OBJECT_CLASS, "organizationalUnit")],
        ));
        a.apply(&ou, OperationKind::Add).unwrap();
        let alice = a.originate_add(person("cn=alice,ou=people,dc=example", "engineer"));
        a.apply(&alice, OperationKind::Add).unwrap();

        let delete = a.originate_delete(&Dn::new("ou=people,dc=example")).unwrap();
        assert!(matches!(
            a.apply(&delete, OperationKind::Delete),
            Err(ApplyError::NonLeaf(_))
        ));
        let ou = read(&a, "ou=people,dc=example").unwrap();
        assert!(!is_tombstone(&ou));
        assert_eq!(a.reconciliation().snapshot()[0].kind, ConflictKind::NonLeaf);
    }

    #[test]
    fn replicated_tombstone_add_keeps_metadata_only_attributes() {
        let a = applier("inv-a");
        let b = applier("inv-b");
        let add = a.originate_add(person("cn=alice,dc=example", "engineer"));
        a.apply(&add, OperationKind::Add).unwrap();
        a.apply(
            &a.originate_modify(
                &Dn::new("cn=alice,dc=example"),
                &[Modification::delete(Attribute::new("title", vec![]))],
            )
            .unwrap(),
            OperationKind::Modify,
        )
        .unwrap();
        let applied = a
            .apply(
                &a.originate_delete(&Dn::new("cn=alice,dc=example")).unwrap(),
                OperationKind::Delete,
            )
            .unwrap();

        // Rebuild the tombstone as a supplier would send it to a replica that never saw it.
        let tombstone = read(&a, applied.dn.as_str()).unwrap();
        let mut update = ReplicationUpdate::new(
            DirectoryEntry::new(tombstone.dn.clone(), vec![]),
            "inv-a",
        );
        for attr in tombstone.attributes.iter() {
            if attr_names::is_locally_maintained(&attr.name) {
                continue;
            }
            if !attr.values.is_empty() {
                update.entry.attributes.push(Attribute::new(attr.name.as_str(), attr.values.clone()));
            }
            if let Some(md) = attr.metadata.clone() {
                update.attribute_metadata.insert(attr.name.clone(), md);
            }
        }

        let replicated = b.apply(&update, OperationKind::Add).unwrap();
        let copy = read(&b, replicated.dn.as_str()).unwrap();
        assert!(is_tombstone(&copy));
        let title = copy.attribute("title").unwrap();
        assert!(title.values.is_empty());
        assert_eq!(title.metadata.as_ref().map(|md| md.version), Some(2));
    }
}
