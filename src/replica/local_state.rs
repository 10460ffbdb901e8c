use crate::backend::{
    Attribute, BackendError, DirectoryEntry, Dn, Modification, Transaction, WriteQueue, WriteQueueError,
};
use crate::commitlog::LogSegments;
use crate::replica::PeerId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default)]
pub struct Term(u32);

impl Term {
    pub fn new(term: u32) -> Self {
        Term(term)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) const RAFT_CONTEXT_DN: &str = "cn=raftcontext";
const PERSISTENT_STATE_RDN: &str = "cn=persiststate";

const ATTR_CURRENT_TERM: &str = "raftCurrentTerm";
const ATTR_VOTED_FOR_TERM: &str = "raftVotedForTerm";
const ATTR_VOTED_FOR: &str = "raftVotedFor";
const ATTR_COMMIT_INDEX: &str = "raftCommitIndex";
const ATTR_COMMIT_INDEX_TERM: &str = "raftCommitIndexTerm";
const ATTR_LAST_APPLIED: &str = "raftLastApplied";
const ATTR_FIRST_LOG_INDEX: &str = "raftFirstLogIndex";
const ATTR_LAST_LOG_INDEX: &str = "raftLastLogIndex";
const ATTR_LAST_LOG_TERM: &str = "raftLastLogTerm";
const ATTR_LOG_SEGMENT: &str = "raftLogSegment";
const ATTR_HAS_PREV_LOG: &str = "raftHasPrevLog";

pub(crate) fn raft_context_dn() -> Dn {
    Dn::new(RAFT_CONTEXT_DN)
}

fn persistent_state_dn() -> Dn {
    raft_context_dn().child(PERSISTENT_STATE_RDN)
}

/// Raft state that must survive a restart.
///
/// Once a log exists: `first_log_index <= last_applied <= commit_index <= last_log_index` and
/// `current_term >= commit_index_term`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for_term: Term,
    pub voted_for: Option<PeerId>,
    pub commit_index: u64,
    pub commit_index_term: Term,
    pub last_applied: u64,
    pub first_log_index: u64,
    pub last_log_index: u64,
    pub last_log_term: Term,
    pub log_segment: u32,
    pub has_prev_log: bool,
}

impl PersistentState {
    fn initial() -> Self {
        PersistentState {
            current_term: Term::new(1),
            voted_for_term: Term::new(0),
            voted_for: None,
            commit_index: 0,
            commit_index_term: Term::new(0),
            last_applied: 0,
            first_log_index: 1,
            last_log_index: 0,
            last_log_term: Term::new(0),
            log_segment: 1,
            has_prev_log: false,
        }
    }

    pub fn segments(&self) -> LogSegments {
        LogSegments {
            current: self.log_segment,
            has_previous: self.has_prev_log,
        }
    }
}

/// A partial update of [PersistentState]. Only `Some` fields are written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDelta {
    pub current_term: Option<Term>,
    pub vote: Option<(Term, PeerId)>,
    pub commit_index: Option<u64>,
    pub commit_index_term: Option<Term>,
    pub last_applied: Option<u64>,
    pub first_log_index: Option<u64>,
    pub last_log_index: Option<u64>,
    pub last_log_term: Option<Term>,
    pub log_segment: Option<u32>,
    pub has_prev_log: Option<bool>,
}

impl StateDelta {
    fn apply_to(&self, state: &mut PersistentState) {
        if let Some(term) = self.current_term {
            state.current_term = term;
        }
        if let Some((term, peer)) = &self.vote {
            state.voted_for_term = *term;
            state.voted_for = Some(peer.clone());
        }
        if let Some(v) = self.commit_index {
            state.commit_index = v;
        }
        if let Some(v) = self.commit_index_term {
            state.commit_index_term = v;
        }
        if let Some(v) = self.last_applied {
            state.last_applied = v;
        }
        if let Some(v) = self.first_log_index {
            state.first_log_index = v;
        }
        if let Some(v) = self.last_log_index {
            state.last_log_index = v;
        }
        if let Some(v) = self.last_log_term {
            state.last_log_term = v;
        }
        if let Some(v) = self.log_segment {
            state.log_segment = v;
        }
        if let Some(v) = self.has_prev_log {
            state.has_prev_log = v;
        }
    }

    fn modifications(&self) -> Vec<Modification> {
        let mut mods = Vec::new();
        let mut put = |name: &str, value: String| mods.push(Modification::replace(Attribute::single(name, value)));

        if let Some(term) = self.current_term {
            put(ATTR_CURRENT_TERM, term.as_u32().to_string());
        }
        if let Some((term, peer)) = &self.vote {
            put(ATTR_VOTED_FOR_TERM, term.as_u32().to_string());
            put(ATTR_VOTED_FOR, peer.as_str().to_string());
        }
        if let Some(v) = self.commit_index {
            put(ATTR_COMMIT_INDEX, v.to_string());
        }
        if let Some(v) = self.commit_index_term {
            put(ATTR_COMMIT_INDEX_TERM, v.as_u32().to_string());
        }
        if let Some(v) = self.last_applied {
            put(ATTR_LAST_APPLIED, v.to_string());
        }
        if let Some(v) = self.first_log_index {
            put(ATTR_FIRST_LOG_INDEX, v.to_string());
        }
        if let Some(v) = self.last_log_index {
            put(ATTR_LAST_LOG_INDEX, v.to_string());
        }
        if let Some(v) = self.last_log_term {
            put(ATTR_LAST_LOG_TERM, v.as_u32().to_string());
        }
        if let Some(v) = self.log_segment {
            put(ATTR_LOG_SEGMENT, v.to_string());
        }
        if let Some(v) = self.has_prev_log {
            put(ATTR_HAS_PREV_LOG, if v { "TRUE" } else { "FALSE" }.to_string());
        }

        mods
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("persistent raft state has not been initialized")]
    NotInitialized,
    #[error("persistent raft state attribute {0} is missing or malformed")]
    Corrupt(&'static str),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    WriteQueue(#[from] WriteQueueError),
}

impl StateError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::NotInitialized | StateError::Corrupt(_))
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a durable
/// store to guarantee safety.
///
/// Store methods are implemented atomically via a CAS like operation. Similar to most CAS method
/// signatures, the CAS store methods return true if we have mutated state.
pub(crate) trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    fn store_term_if_increased(&self, new_term: Term) -> Result<bool, StateError>;

    /// Store our vote for the latest term iff the latest term is the same term as the one provided,
    /// and we have not stored a vote for the latest term.
    fn store_vote_for_term_if_unvoted(&self, expected_current_term: Term, vote: PeerId) -> Result<bool, StateError>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&self, me: &PeerId) -> Result<Term, StateError>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<PeerId>);
}

/// PersistentStateStore owns the single persistent state record. The in-memory copy is only ever
/// changed after the write transaction carrying the same change has committed, and always while
/// that write still holds the head of the write queue, so it reflects commit order.
pub struct PersistentStateStore {
    logger: slog::Logger,
    queue: Arc<WriteQueue>,
    state: Mutex<PersistentState>,
}

impl PersistentStateStore {
    /// Create the raft context and the persistent state record. Idempotent: returns `Ok(false)`
    /// without touching anything if the record already exists.
    pub fn bootstrap(logger: &slog::Logger, queue: &WriteQueue) -> Result<bool, StateError> {
        let mut write = queue.begin_write()?;
        let txn = write.txn();

        match txn.dn_to_entry_id(&persistent_state_dn()) {
            Ok(_) => return Ok(false),
            Err(BackendError::NoSuchObject(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(BackendError::NoSuchObject(_)) = txn.dn_to_entry_id(&raft_context_dn()) {
            txn.entry_add(DirectoryEntry::new(
                raft_context_dn(),
                vec![Attribute::single("objectClass", "raftContext")],
            ))?;
        }

        let initial = PersistentState::initial();
        let mut attributes = vec![Attribute::single("objectClass", "raftPersistState")];
        attributes.extend(
            Self::full_delta(&initial)
                .modifications()
                .into_iter()
                .map(|m| m.attribute),
        );
        txn.entry_add(DirectoryEntry::new(persistent_state_dn(), attributes))?;
        txn.entry_add(LogSegments::container_entry(initial.log_segment))?;

        write.commit()?;
        slog::info!(logger, "Bootstrapped persistent raft state: {:?}", initial);

        Ok(true)
    }

    /// Load the persistent state record. A missing record means the store was never bootstrapped,
    /// which is a fatal configuration error.
    pub fn load(logger: slog::Logger, queue: Arc<WriteQueue>) -> Result<Self, StateError> {
        let state = {
            let txn = queue.read()?;
            let id = match txn.dn_to_entry_id(&persistent_state_dn()) {
                Ok(id) => id,
                Err(BackendError::NoSuchObject(_)) => return Err(StateError::NotInitialized),
                Err(e) => return Err(e.into()),
            };
            Self::parse(&txn.id_to_entry(id)?)?
        };
        slog::info!(logger, "Loaded persistent raft state: {:?}", state);

        Ok(PersistentStateStore {
            logger,
            queue,
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> PersistentState {
        self.state.lock().clone()
    }

    /// Write `delta` into the caller's transaction. Call [Self::publish] once it commits.
    pub fn stage(&self, txn: &mut dyn Transaction, delta: &StateDelta) -> Result<(), StateError> {
        let id = match txn.dn_to_entry_id(&persistent_state_dn()) {
            Ok(id) => id,
            Err(BackendError::NoSuchObject(_)) => return Err(StateError::NotInitialized),
            Err(e) => return Err(e.into()),
        };
        txn.entry_modify(id, &delta.modifications())?;

        Ok(())
    }

    pub fn publish(&self, delta: &StateDelta) {
        let mut state = self.state.lock();
        delta.apply_to(&mut state);
        slog::debug!(self.logger, "Persistent state updated: {:?}", delta);
    }

    /// Save `delta` in its own write transaction.
    pub fn save(&self, delta: StateDelta) -> Result<(), StateError> {
        let mut write = self.queue.begin_write()?;
        self.stage(write.txn(), &delta)?;
        write.commit_then(|| self.publish(&delta))?;

        Ok(())
    }

    /// Run `decide` against the current state while holding the write queue head. If it returns a
    /// delta, persist and publish it.
    fn compare_and_save<F>(&self, decide: F) -> Result<Option<StateDelta>, StateError>
    where
        F: FnOnce(&PersistentState) -> Option<StateDelta>,
    {
        let mut write = self.queue.begin_write()?;
        let delta = match decide(&self.state.lock()) {
            Some(delta) => delta,
            None => return Ok(None),
        };
        self.stage(write.txn(), &delta)?;
        write.commit_then(|| self.publish(&delta))?;

        Ok(Some(delta))
    }

    fn full_delta(state: &PersistentState) -> StateDelta {
        StateDelta {
            current_term: Some(state.current_term),
            vote: None,
            commit_index: Some(state.commit_index),
            commit_index_term: Some(state.commit_index_term),
            last_applied: Some(state.last_applied),
            first_log_index: Some(state.first_log_index),
            last_log_index: Some(state.last_log_index),
            last_log_term: Some(state.last_log_term),
            log_segment: Some(state.log_segment),
            has_prev_log: Some(state.has_prev_log),
        }
    }

    fn parse(entry: &DirectoryEntry) -> Result<PersistentState, StateError> {
        fn num<T: std::str::FromStr>(entry: &DirectoryEntry, attr: &'static str) -> Result<T, StateError> {
            entry
                .first_value_str(attr)
                .and_then(|v| v.parse::<T>().ok())
                .ok_or(StateError::Corrupt(attr))
        }

        let voted_for_term = match entry.first_value_str(ATTR_VOTED_FOR_TERM) {
            Some(v) => Term::new(v.parse().map_err(|_| StateError::Corrupt(ATTR_VOTED_FOR_TERM))?),
            None => Term::new(0),
        };
        let voted_for = entry
            .first_value_str(ATTR_VOTED_FOR)
            .filter(|v| !v.is_empty())
            .map(PeerId::new);
        let has_prev_log = match entry.first_value_str(ATTR_HAS_PREV_LOG) {
            Some("TRUE") => true,
            Some("FALSE") => false,
            _ => return Err(StateError::Corrupt(ATTR_HAS_PREV_LOG)),
        };

        Ok(PersistentState {
            current_term: Term::new(num(entry, ATTR_CURRENT_TERM)?),
            voted_for_term,
            voted_for,
            commit_index: num(entry, ATTR_COMMIT_INDEX)?,
            commit_index_term: Term::new(num(entry, ATTR_COMMIT_INDEX_TERM)?),
            last_applied: num(entry, ATTR_LAST_APPLIED)?,
            first_log_index: num(entry, ATTR_FIRST_LOG_INDEX)?,
            last_log_index: num(entry, ATTR_LAST_LOG_INDEX)?,
            last_log_term: Term::new(num(entry, ATTR_LAST_LOG_TERM)?),
            log_segment: num(entry, ATTR_LOG_SEGMENT)?,
            has_prev_log,
        })
    }
}

impl PersistentLocalState for PersistentStateStore {
    fn store_term_if_increased(&self, new_term: Term) -> Result<bool, StateError> {
        if new_term <= self.current_term() {
            return Ok(false);
        }

        let saved = self.compare_and_save(|state| {
            if new_term <= state.current_term {
                None
            } else {
                Some(StateDelta {
                    current_term: Some(new_term),
                    ..StateDelta::default()
                })
            }
        })?;

        Ok(saved.is_some())
    }

    fn store_vote_for_term_if_unvoted(&self, expected_term: Term, vote: PeerId) -> Result<bool, StateError> {
        let saved = self.compare_and_save(|state| {
            if state.current_term == expected_term && state.voted_for_term < expected_term {
                Some(StateDelta {
                    vote: Some((expected_term, vote)),
                    ..StateDelta::default()
                })
            } else {
                None
            }
        })?;

        Ok(saved.is_some())
    }

    fn increment_term_and_vote_for_self(&self, me: &PeerId) -> Result<Term, StateError> {
        let saved = self.compare_and_save(|state| {
            let new_term = state.current_term.next();
            Some(StateDelta {
                current_term: Some(new_term),
                vote: Some((new_term, me.clone())),
                ..StateDelta::default()
            })
        })?;

        // The closure always produces a delta.
        match saved.and_then(|delta| delta.current_term) {
            Some(term) => Ok(term),
            None => Ok(self.current_term()),
        }
    }

    fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<PeerId>) {
        let state = self.state.lock();
        if state.voted_for_term == state.current_term {
            (state.current_term, state.voted_for.clone())
        } else {
            (state.current_term, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryObjectStore;
    use std::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn queue() -> Arc<WriteQueue> {
        Arc::new(WriteQueue::new(
            logger(),
            Arc::new(InMemoryObjectStore::new()),
            Duration::from_secs(1),
        ))
    }

    fn bootstrapped() -> (Arc<WriteQueue>, PersistentStateStore) {
        let queue = queue();
        assert!(PersistentStateStore::bootstrap(&logger(), &queue).unwrap());
        let store = PersistentStateStore::load(logger(), queue.clone()).unwrap();
        (queue, store)
    }

    #[test]
    fn load_before_bootstrap_is_fatal() {
        match PersistentStateStore::load(logger(), queue()) {
            Err(e) => assert!(matches!(e, StateError::NotInitialized) && e.is_fatal()),
            Ok(_) => panic!("load must fail on an uninitialized store"),
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let (queue, store) = bootstrapped();
        store
            .save(StateDelta {
                last_applied: Some(9),
                ..StateDelta::default()
            })
            .unwrap();

        assert!(!PersistentStateStore::bootstrap(&logger(), &queue).unwrap());
        let reloaded = PersistentStateStore::load(logger(), queue).unwrap();
        assert_eq!(reloaded.snapshot().last_applied, 9);
    }

    #[test]
    fn initial_state() {
        let (_, store) = bootstrapped();
        let state = store.snapshot();
        assert_eq!(state.current_term, Term::new(1));
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.first_log_index, 1);
        assert_eq!(state.last_applied, 0);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn save_persists_only_given_fields() {
        let (queue, store) = bootstrapped();
        store
            .save(StateDelta {
                commit_index: Some(4),
                commit_index_term: Some(Term::new(1)),
                last_log_index: Some(6),
                ..StateDelta::default()
            })
            .unwrap();

        let reloaded = PersistentStateStore::load(logger(), queue).unwrap().snapshot();
        assert_eq!(reloaded.commit_index, 4);
        assert_eq!(reloaded.last_log_index, 6);
        assert_eq!(reloaded.first_log_index, 1);
        assert_eq!(reloaded, store.snapshot());
    }

    #[test]
    fn staged_delta_is_not_visible_when_transaction_aborts() {
        let (queue, store) = bootstrapped();
        {
            let mut write = queue.begin_write().unwrap();
            store
                .stage(
                    write.txn(),
                    &StateDelta {
                        last_applied: Some(3),
                        ..StateDelta::default()
                    },
                )
                .unwrap();
        }

        assert_eq!(store.snapshot().last_applied, 0);
        let reloaded = PersistentStateStore::load(logger(), queue).unwrap().snapshot();
        assert_eq!(reloaded.last_applied, 0);
    }

    #[test]
    fn term_and_vote_cas() {
        let (queue, store) = bootstrapped();
        let a = PeerId::new("a");
        let b = PeerId::new("b");

        assert!(!store.store_term_if_increased(Term::new(1)).unwrap());
        assert!(store.store_term_if_increased(Term::new(3)).unwrap());
        assert_eq!(store.voted_for_current_term(), (Term::new(3), None));

        assert!(!store.store_vote_for_term_if_unvoted(Term::new(2), a.clone()).unwrap());
        assert!(store.store_vote_for_term_if_unvoted(Term::new(3), a.clone()).unwrap());
        assert!(!store.store_vote_for_term_if_unvoted(Term::new(3), b.clone()).unwrap());
        assert_eq!(store.voted_for_current_term(), (Term::new(3), Some(a.clone())));

        let new_term = store.increment_term_and_vote_for_self(&b).unwrap();
        assert_eq!(new_term, Term::new(4));
        assert_eq!(store.voted_for_current_term(), (Term::new(4), Some(b.clone())));

        let reloaded = PersistentStateStore::load(logger(), queue).unwrap();
        assert_eq!(reloaded.voted_for_current_term(), (Term::new(4), Some(b)));
    }
}
