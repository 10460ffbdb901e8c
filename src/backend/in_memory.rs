use crate::backend::{
    BackendError, DirectoryEntry, Dn, EntryId, Filter, Modification, ObjectStore, SearchScope, Transaction, TxnMode,
};
use crate::replication::Usn;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Reference object store. Readers get a snapshot of the last committed state; a single writer works
// on a copy-on-write clone which replaces the committed state on commit. It does not persist
// anything across restarts of the process.
pub struct InMemoryObjectStore {
    committed: RwLock<Arc<Objects>>,
    writer: Mutex<()>,
    last_usn: AtomicU64,
}

#[derive(Clone, Default)]
struct Objects {
    entries: BTreeMap<EntryId, DirectoryEntry>,
    by_dn: HashMap<String, EntryId>,
    max_entry_id: u64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        InMemoryObjectStore {
            committed: RwLock::new(Arc::new(Objects::default())),
            writer: Mutex::new(()),
            last_usn: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn txn_begin(&self, mode: TxnMode) -> Result<Box<dyn Transaction + '_>, BackendError> {
        // Lock order: writer, then committed.
        let writer = match mode {
            TxnMode::Read => None,
            TxnMode::Write => Some(self.writer.lock()),
        };
        let objects = self.committed.read().clone();

        Ok(Box::new(InMemoryTxn {
            store: self,
            mode,
            objects,
            _writer: writer,
        }))
    }

    fn next_usn(&self) -> Result<Usn, BackendError> {
        Ok(Usn::new(self.last_usn.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

struct InMemoryTxn<'a> {
    store: &'a InMemoryObjectStore,
    mode: TxnMode,
    objects: Arc<Objects>,
    _writer: Option<MutexGuard<'a, ()>>,
}

impl<'a> InMemoryTxn<'a> {
    fn writable(&mut self) -> Result<&mut Objects, BackendError> {
        match self.mode {
            TxnMode::Read => Err(BackendError::ReadOnlyTransaction),
            TxnMode::Write => Ok(Arc::make_mut(&mut self.objects)),
        }
    }

    fn lookup(&self, id: EntryId) -> Result<&DirectoryEntry, BackendError> {
        self.objects
            .entries
            .get(&id)
            .ok_or_else(|| BackendError::NoSuchObject(format!("{:?}", id)))
    }

    // An empty base is the root: its one-level children are the root-level entries.
    fn in_scope(base: &str, scope: SearchScope, entry: &DirectoryEntry) -> bool {
        let dn = entry.dn.normalized();
        match scope {
            SearchScope::Base => dn == base,
            SearchScope::OneLevel => match entry.dn.parent() {
                Some(parent) => parent.normalized() == base,
                None => base.is_empty(),
            },
            SearchScope::Subtree => base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base)),
        }
    }

    fn has_children(objects: &Objects, dn: &Dn) -> bool {
        let normalized = dn.normalized();
        objects
            .entries
            .values()
            .any(|e| e.dn.parent().map(|p| p.normalized() == normalized).unwrap_or(false))
    }
}

impl<'a> Transaction for InMemoryTxn<'a> {
    fn mode(&self) -> TxnMode {
        self.mode
    }

    fn entry_add(&mut self, mut entry: DirectoryEntry) -> Result<EntryId, BackendError> {
        let objects = self.writable()?;

        let normalized = entry.dn.normalized();
        if objects.by_dn.contains_key(&normalized) {
            return Err(BackendError::AlreadyExists(entry.dn.to_string()));
        }
        if let Some(parent) = entry.dn.parent() {
            if !objects.by_dn.contains_key(&parent.normalized()) {
                return Err(BackendError::NoSuchParent(entry.dn.to_string()));
            }
        }

        if entry.id.is_unassigned() {
            objects.max_entry_id += 1;
            entry.id = EntryId::new(objects.max_entry_id);
        } else if objects.entries.contains_key(&entry.id) {
            return Err(BackendError::AlreadyExists(format!("{:?}", entry.id)));
        } else if !entry.id.is_log_entry() && entry.id.as_u64() > objects.max_entry_id {
            objects.max_entry_id = entry.id.as_u64();
        }

        let id = entry.id;
        objects.by_dn.insert(normalized, id);
        objects.entries.insert(id, entry);

        Ok(id)
    }

    fn entry_modify(&mut self, id: EntryId, mods: &[Modification]) -> Result<(), BackendError> {
        let objects = self.writable()?;
        let entry = objects
            .entries
            .get_mut(&id)
            .ok_or_else(|| BackendError::NoSuchObject(format!("{:?}", id)))?;

        for modification in mods {
            entry.apply(modification);
        }

        Ok(())
    }

    fn entry_delete(&mut self, id: EntryId) -> Result<(), BackendError> {
        let objects = self.writable()?;
        let dn = match objects.entries.get(&id) {
            Some(entry) => entry.dn.clone(),
            None => return Err(BackendError::NoSuchObject(format!("{:?}", id))),
        };
        if Self::has_children(objects, &dn) {
            return Err(BackendError::NotAllowedOnNonLeaf(dn.to_string()));
        }

        objects.entries.remove(&id);
        objects.by_dn.remove(&dn.normalized());

        Ok(())
    }

    fn dn_to_entry_id(&self, dn: &Dn) -> Result<EntryId, BackendError> {
        self.objects
            .by_dn
            .get(&dn.normalized())
            .copied()
            .ok_or_else(|| BackendError::NoSuchObject(dn.to_string()))
    }

    fn id_to_entry(&self, id: EntryId) -> Result<DirectoryEntry, BackendError> {
        self.lookup(id).map(|e| e.clone())
    }

    fn max_entry_id(&self) -> Result<EntryId, BackendError> {
        Ok(EntryId::new(self.objects.max_entry_id))
    }

    fn search(&self, base: &Dn, scope: SearchScope, filter: &Filter) -> Result<Vec<DirectoryEntry>, BackendError> {
        let base = base.normalized();
        Ok(self
            .objects
            .entries
            .values()
            .filter(|e| Self::in_scope(&base, scope, e) && filter.matches(e))
            .cloned()
            .collect())
    }

    fn commit(self: Box<Self>) -> Result<(), BackendError> {
        if self.mode == TxnMode::Write {
            *self.store.committed.write() = self.objects.clone();
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
