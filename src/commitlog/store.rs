use crate::backend::{
    Attribute, BackendError, DirectoryEntry, Dn, Filter, SearchScope, Transaction, WriteQueue, WriteQueueError,
};
use crate::commitlog::{CodecError, RaftLogEntry};
use crate::replica::{raft_context_dn, PersistentStateStore, StateDelta, StateError, Term};
use std::sync::Arc;

const ATTR_LOG_INDEX: &str = "raftLogIndex";
const ATTR_LOG_TERM: &str = "raftTerm";
const ATTR_LOG_ENTRIES: &str = "raftLogEntries";

/// Which log segment containers are live. Only the current segment is appended to; the previous
/// one is kept for lookups until the next rotation purges it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogSegments {
    pub current: u32,
    pub has_previous: bool,
}

impl LogSegments {
    pub fn previous(&self) -> Option<u32> {
        if self.has_previous && self.current > 1 {
            Some(self.current - 1)
        } else {
            None
        }
    }

    /// Live segments, current first.
    fn probe_order(&self) -> impl Iterator<Item = u32> {
        std::iter::once(self.current).chain(self.previous())
    }

    pub(crate) fn container_dn(segment: u32) -> Dn {
        raft_context_dn().child(&format!("cn=logs{}", segment))
    }

    pub(crate) fn container_entry(segment: u32) -> DirectoryEntry {
        DirectoryEntry::new(
            Self::container_dn(segment),
            vec![Attribute::single("objectClass", "raftLogContainer")],
        )
    }

    fn entry_dn(segment: u32, index: u64) -> Dn {
        Self::container_dn(segment).child(&format!("cn={}", index))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    #[error("refusing to delete log from index {start}: entries at or below last applied {last_applied} must be kept")]
    UnsafeDelete { start: u64, last_applied: u64 },
    #[error("log entry {index} has no change record attribute")]
    MissingChangeRecord { index: u64 },
    #[error("log entry {index} is corrupt: {source}")]
    Corrupt {
        index: u64,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    WriteQueue(#[from] WriteQueueError),
}

impl LogStoreError {
    pub fn is_fatal(&self) -> bool {
        match self {
            LogStoreError::UnsafeDelete { .. }
            | LogStoreError::MissingChangeRecord { .. }
            | LogStoreError::Corrupt { .. } => true,
            LogStoreError::State(e) => e.is_fatal(),
            LogStoreError::Backend(_) | LogStoreError::WriteQueue(_) => false,
        }
    }
}

/// LogStore keeps raft log entries as objects under `cn=logs<N>,cn=raftcontext`.
///
/// Mutating methods take the caller's write transaction so that the matching persistent state
/// change can be staged in the same transaction.
pub struct LogStore {
    logger: slog::Logger,
    queue: Arc<WriteQueue>,
    state: Arc<PersistentStateStore>,
}

impl LogStore {
    pub fn new(logger: slog::Logger, queue: Arc<WriteQueue>, state: Arc<PersistentStateStore>) -> Self {
        LogStore { logger, queue, state }
    }

    /// Write `entry` into the current segment.
    pub fn append(&self, txn: &mut dyn Transaction, entry: &RaftLogEntry) -> Result<(), LogStoreError> {
        let segment = self.state.snapshot().log_segment;

        let mut object = DirectoryEntry::new(
            LogSegments::entry_dn(segment, entry.index),
            vec![
                Attribute::single("objectClass", "raftLogEntry"),
                Attribute::single(ATTR_LOG_INDEX, entry.index.to_string()),
                Attribute::single(ATTR_LOG_TERM, entry.term.as_u32().to_string()),
                Attribute::single(ATTR_LOG_ENTRIES, entry.pack()),
            ],
        );
        object.id = entry.entry_id;
        txn.entry_add(object)?;

        Ok(())
    }

    pub fn fetch(&self, index: u64) -> Result<Option<RaftLogEntry>, LogStoreError> {
        let txn = self.queue.read()?;
        self.fetch_in(txn.as_ref(), index)
    }

    /// Point lookup in the current segment, then the previous one if there is one.
    pub fn fetch_in(&self, txn: &dyn Transaction, index: u64) -> Result<Option<RaftLogEntry>, LogStoreError> {
        let segments = self.state.snapshot().segments();
        for segment in segments.probe_order() {
            let id = match txn.dn_to_entry_id(&LogSegments::entry_dn(segment, index)) {
                Ok(id) => id,
                Err(BackendError::NoSuchObject(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            return Self::decode(index, &txn.id_to_entry(id)?).map(Some);
        }

        Ok(None)
    }

    /// Delete every entry at or after `start`, highest index first.
    ///
    /// Refuses to delete anything if `start` or any entry found is at or below last applied. The
    /// deletes are part of the caller's transaction, so a refusal leaves the log untouched.
    pub fn delete_from(&self, txn: &mut dyn Transaction, start: u64) -> Result<Vec<u64>, LogStoreError> {
        let state = self.state.snapshot();
        if start <= state.last_applied {
            slog::error!(
                self.logger,
                "Attempted to delete applied log entries from index {} (last applied {})",
                start,
                state.last_applied
            );
            return Err(LogStoreError::UnsafeDelete {
                start,
                last_applied: state.last_applied,
            });
        }

        let mut doomed = Vec::new();
        for segment in state.segments().probe_order() {
            let found = txn.search(
                &LogSegments::container_dn(segment),
                SearchScope::OneLevel,
                &Filter::GreaterOrEqual(ATTR_LOG_INDEX.to_string(), start),
            )?;
            for object in found {
                let index = Self::index_of(&object)?;
                if index <= state.last_applied {
                    return Err(LogStoreError::UnsafeDelete {
                        start,
                        last_applied: state.last_applied,
                    });
                }
                doomed.push((index, object.id));
            }
        }

        doomed.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in doomed.iter() {
            txn.entry_delete(*id)?;
        }
        if !doomed.is_empty() {
            slog::info!(
                self.logger,
                "Deleted {} log entries from index {} onward",
                doomed.len(),
                start
            );
        }

        Ok(doomed.into_iter().map(|(index, _)| index).collect())
    }

    pub fn max_index(&self) -> Result<u64, LogStoreError> {
        let txn = self.queue.read()?;
        self.max_index_in(txn.as_ref())
    }

    pub fn max_index_in(&self, txn: &dyn Transaction) -> Result<u64, LogStoreError> {
        let mut max = 0;
        for segment in self.state.snapshot().segments().probe_order() {
            for object in txn.search(&LogSegments::container_dn(segment), SearchScope::OneLevel, &Filter::All)? {
                max = max.max(Self::index_of(&object)?);
            }
        }

        Ok(max)
    }

    /// Walk down from `before - 1` to the nearest entry that still exists. Returns `(0, 0)` when
    /// nothing at or above `floor` is left.
    pub fn prev_log_args(&self, txn: &dyn Transaction, before: u64, floor: u64) -> Result<(u64, Term), LogStoreError> {
        let floor = floor.max(1);
        let mut index = before;
        while index > floor {
            index -= 1;
            if let Some(entry) = self.fetch_in(txn, index)? {
                return Ok((entry.index, entry.term));
            }
        }

        Ok((0, Term::new(0)))
    }

    /// First entry at or after `start` and at or below `end`.
    pub fn next_log(&self, txn: &dyn Transaction, start: u64, end: u64) -> Result<Option<RaftLogEntry>, LogStoreError> {
        for index in start..=end {
            if let Some(entry) = self.fetch_in(txn, index)? {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Up to `limit` entries from `start` to `end`, in index order, skipping gaps.
    pub fn entries_between(
        &self,
        txn: &dyn Transaction,
        start: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<RaftLogEntry>, LogStoreError> {
        let mut entries = Vec::new();
        let mut cursor = start;
        while entries.len() < limit && cursor <= end {
            match self.next_log(txn, cursor, end)? {
                Some(entry) => {
                    cursor = entry.index + 1;
                    entries.push(entry);
                }
                None => break,
            }
        }

        Ok(entries)
    }

    /// Number of entries in the current segment at or below last applied.
    pub fn applied_in_current_segment(&self) -> Result<usize, LogStoreError> {
        let state = self.state.snapshot();
        let txn = self.queue.read()?;
        let found = txn.search(
            &LogSegments::container_dn(state.log_segment),
            SearchScope::OneLevel,
            &Filter::All,
        )?;

        let mut applied = 0;
        for object in found.iter() {
            if Self::index_of(object)? <= state.last_applied {
                applied += 1;
            }
        }

        Ok(applied)
    }

    /// Purge the previous segment, demote the current one, and start a new current segment.
    pub fn rotate(&self) -> Result<LogSegments, LogStoreError> {
        let mut write = self.queue.begin_write()?;
        let state = self.state.snapshot();
        let txn = write.txn();

        if let Some(previous) = state.segments().previous() {
            let container = LogSegments::container_dn(previous);
            let mut purged = 0;
            for object in txn.search(&container, SearchScope::OneLevel, &Filter::All)? {
                txn.entry_delete(object.id)?;
                purged += 1;
            }
            let container_id = txn.dn_to_entry_id(&container)?;
            txn.entry_delete(container_id)?;
            slog::info!(self.logger, "Purged {} entries with log segment {}", purged, previous);
        }

        let mut first_retained = None;
        for object in txn.search(
            &LogSegments::container_dn(state.log_segment),
            SearchScope::OneLevel,
            &Filter::All,
        )? {
            let index = Self::index_of(&object)?;
            first_retained = Some(first_retained.map_or(index, |first: u64| first.min(index)));
        }

        let next = state.log_segment + 1;
        txn.entry_add(LogSegments::container_entry(next))?;

        let delta = StateDelta {
            log_segment: Some(next),
            has_prev_log: Some(true),
            first_log_index: Some(first_retained.unwrap_or(state.last_log_index + 1)),
            ..StateDelta::default()
        };
        self.state.stage(txn, &delta)?;
        write.commit_then(|| self.state.publish(&delta))?;
        slog::info!(self.logger, "Rotated log to segment {}: {:?}", next, delta);

        Ok(LogSegments {
            current: next,
            has_previous: true,
        })
    }

    fn index_of(object: &DirectoryEntry) -> Result<u64, LogStoreError> {
        object
            .first_value_str(ATTR_LOG_INDEX)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                BackendError::Internal(format!("log object {} has no valid {}", object.dn, ATTR_LOG_INDEX)).into()
            })
    }

    fn decode(index: u64, object: &DirectoryEntry) -> Result<RaftLogEntry, LogStoreError> {
        let packed = object
            .first_value(ATTR_LOG_ENTRIES)
            .ok_or(LogStoreError::MissingChangeRecord { index })?;
        RaftLogEntry::unpack(packed).map_err(|source| LogStoreError::Corrupt { index, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EntryId, InMemoryObjectStore, Modification};
    use crate::commitlog::RequestCode;
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<WriteQueue>,
        state: Arc<PersistentStateStore>,
        log: LogStore,
    }

    fn fixture() -> Fixture {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let queue = Arc::new(WriteQueue::new(
            logger.clone(),
            Arc::new(InMemoryObjectStore::new()),
            Duration::from_secs(1),
        ));
        PersistentStateStore::bootstrap(&logger, &queue).unwrap();
        let state = Arc::new(PersistentStateStore::load(logger.clone(), queue.clone()).unwrap());
        let log = LogStore::new(logger, queue.clone(), state.clone());
        Fixture { queue, state, log }
    }

    fn entry(index: u64) -> RaftLogEntry {
        RaftLogEntry::new(index, Term::new(1), RequestCode::ADD, Bytes::from(format!("record {}", index)))
    }

    impl Fixture {
        fn append_all(&self, indices: impl IntoIterator<Item = u64>) {
            let mut write = self.queue.begin_write().unwrap();
            let mut last = None;
            for index in indices {
                self.log.append(write.txn(), &entry(index)).unwrap();
                last = Some(index);
            }
            let delta = StateDelta {
                last_log_index: last,
                last_log_term: Some(Term::new(1)),
                ..StateDelta::default()
            };
            self.state.stage(write.txn(), &delta).unwrap();
            write.commit_then(|| self.state.publish(&delta)).unwrap();
        }

        fn set_last_applied(&self, last_applied: u64) {
            self.state
                .save(StateDelta {
                    commit_index: Some(last_applied),
                    last_applied: Some(last_applied),
                    ..StateDelta::default()
                })
                .unwrap();
        }
    }

    #[test]
    fn append_and_fetch() {
        let f = fixture();
        f.append_all(1..=3);

        assert_eq!(f.log.fetch(2).unwrap(), Some(entry(2)));
        assert_eq!(f.log.fetch(4).unwrap(), None);
        assert_eq!(f.log.max_index().unwrap(), 3);
        assert_eq!(f.state.snapshot().last_log_index, 3);
    }

    #[test]
    fn aborted_append_is_invisible() {
        let f = fixture();
        {
            let mut write = f.queue.begin_write().unwrap();
            f.log.append(write.txn(), &entry(1)).unwrap();
        }
        assert_eq!(f.log.fetch(1).unwrap(), None);
        assert_eq!(f.log.max_index().unwrap(), 0);
    }

    #[test]
    fn max_index_is_monotonic_over_appends() {
        let f = fixture();
        let mut previous = 0;
        for index in 1..=5 {
            f.append_all(vec![index]);
            let max = f.log.max_index().unwrap();
            assert!(max >= previous);
            assert_eq!(max, index);
            previous = max;
        }
    }

    #[test]
    fn fetch_falls_back_to_previous_segment() {
        let f = fixture();
        f.append_all(1..=3);
        f.set_last_applied(3);

        let segments = f.log.rotate().unwrap();
        assert_eq!(
            segments,
            LogSegments {
                current: 2,
                has_previous: true
            }
        );
        f.append_all(vec![4]);

        let state = f.state.snapshot();
        assert!(state.has_prev_log);
        assert_eq!(state.first_log_index, 1);
        assert_eq!(f.log.fetch(2).unwrap(), Some(entry(2)));
        assert_eq!(f.log.fetch(4).unwrap(), Some(entry(4)));
        assert_eq!(f.log.fetch(9).unwrap(), None);
    }

    #[test]
    fn second_rotation_purges_oldest_segment() {
        let f = fixture();
        f.append_all(1..=3);
        f.set_last_applied(3);
        f.log.rotate().unwrap();
        f.append_all(4..=5);
        f.set_last_applied(5);
        f.log.rotate().unwrap();

        assert_eq!(f.log.fetch(2).unwrap(), None);
        assert_eq!(f.log.fetch(5).unwrap(), Some(entry(5)));
        assert_eq!(f.state.snapshot().first_log_index, 4);
        let txn = f.queue.read().unwrap();
        assert!(txn.dn_to_entry_id(&LogSegments::container_dn(1)).is_err());
    }

    #[test]
    fn delete_from_removes_tail() {
        let f = fixture();
        f.append_all(1..=6);
        f.set_last_applied(2);

        let mut write = f.queue.begin_write().unwrap();
        let deleted = f.log.delete_from(write.txn(), 4).unwrap();
        write.commit().unwrap();

        assert_eq!(deleted, vec![6, 5, 4]);
        assert_eq!(f.log.max_index().unwrap(), 3);
        assert_eq!(f.log.fetch(3).unwrap(), Some(entry(3)));
    }

    #[test]
    fn delete_at_or_below_last_applied_is_fatal_and_deletes_nothing() {
        let f = fixture();
        f.append_all(vec![50, 100, 150]);
        f.set_last_applied(100);

        for start in vec![100, 50] {
            let mut write = f.queue.begin_write().unwrap();
            let err = f.log.delete_from(write.txn(), start).unwrap_err();
            assert!(err.is_fatal(), "{:?}", err);
            assert!(matches!(err, LogStoreError::UnsafeDelete { .. }));
        }

        for index in vec![50, 100, 150] {
            assert!(f.log.fetch(index).unwrap().is_some(), "index {} was deleted", index);
        }
    }

    #[test]
    fn walks_over_gaps() {
        let f = fixture();
        f.append_all(vec![1, 2, 5, 6]);
        let txn = f.queue.read().unwrap();

        assert_eq!(f.log.prev_log_args(txn.as_ref(), 5, 1).unwrap(), (2, Term::new(1)));
        assert_eq!(f.log.prev_log_args(txn.as_ref(), 1, 1).unwrap(), (0, Term::new(0)));
        assert_eq!(f.log.next_log(txn.as_ref(), 3, 6).unwrap().map(|e| e.index), Some(5));
        assert_eq!(f.log.next_log(txn.as_ref(), 7, 9).unwrap(), None);

        let between = f.log.entries_between(txn.as_ref(), 2, 6, 10).unwrap();
        assert_eq!(between.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 5, 6]);
        let limited = f.log.entries_between(txn.as_ref(), 1, 6, 2).unwrap();
        assert_eq!(limited.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn missing_change_record_is_fatal() {
        let f = fixture();
        f.append_all(vec![1]);
        {
            let mut write = f.queue.begin_write().unwrap();
            let txn = write.txn();
            txn.entry_modify(
                EntryId::for_log_index(1),
                &[Modification::delete(Attribute::new(ATTR_LOG_ENTRIES, vec![]))],
            )
            .unwrap();
            write.commit().unwrap();
        }

        let err = f.log.fetch(1).unwrap_err();
        assert!(matches!(err, LogStoreError::MissingChangeRecord { index: 1 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn applied_entries_in_current_segment() {
        let f = fixture();
        f.append_all(1..=4);
        f.set_last_applied(3);
        assert_eq!(f.log.applied_in_current_segment().unwrap(), 3);
    }
}
