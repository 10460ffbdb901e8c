use crate::backend::{BackendError, WriteQueueError};
use crate::commitlog::{CodecError, LogStoreError};
use crate::replica::local_state::{StateError, Term};
use crate::replica::peers::PeerId;
use crate::replication::{Applied, ApplyError, ChangeRecordError};
use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct ReplicateOutput {
    pub(crate) index: u64,
    pub(crate) term: Term,
    pub(crate) outcome: ApplyOutcome,
}

/// What happened when the replicated entry was applied on the leader.
#[derive(Debug)]
pub(crate) enum ApplyOutcome {
    Applied(Applied),
    /// Committed, but the change could not be applied (a conflict, a missing object...). Every
    /// replica reaches the same verdict.
    Rejected(ApplyError),
    /// Committed, not applied yet because applying hit a transient failure. It will be applied by
    /// a later round.
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplicateError {
    #[error("I'm not leader")]
    NotLeader { leader: Option<PeerId> },
    // The entry stays in the log uncommitted. A later leader either commits it or truncates it.
    #[error("entry {index} was acknowledged by {acks} of the {needed} members needed")]
    NoConsensus { index: u64, acks: usize, needed: usize },
    #[error("lost leadership while replicating, term {0:?} is newer")]
    StaleTerm(Term),
    #[error(transparent)]
    Local(#[from] LocalError),
}

/// Failures of this node's own storage while running a raft operation.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error(transparent)]
    Log(#[from] LogStoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("committed log entry {index} does not hold a valid change record: {source}")]
    ChangeRecord {
        index: u64,
        #[source]
        source: ChangeRecordError,
    },
    #[error("committed log entry {index} is not a usable batch: {source}")]
    Codec {
        index: u64,
        #[source]
        source: CodecError,
    },
    #[error("committed log entry {0} is missing")]
    MissingCommittedEntry(u64),
    #[error("blocking storage task failed: {0}")]
    TaskFailed(String),
}

impl LocalError {
    pub fn is_fatal(&self) -> bool {
        match self {
            LocalError::Log(e) => e.is_fatal(),
            LocalError::State(e) => e.is_fatal(),
            LocalError::Apply(_) => false,
            LocalError::ChangeRecord { .. } | LocalError::Codec { .. } | LocalError::MissingCommittedEntry(_) => true,
            LocalError::TaskFailed(_) => false,
        }
    }
}

impl From<BackendError> for LocalError {
    fn from(e: BackendError) -> Self {
        LocalError::Log(e.into())
    }
}

impl From<WriteQueueError> for LocalError {
    fn from(e: WriteQueueError) -> Self {
        LocalError::Log(e.into())
    }
}

impl From<tokio::task::JoinError> for LocalError {
    fn from(e: tokio::task::JoinError) -> Self {
        LocalError::TaskFailed(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: PeerId,
    // (0, 0) for an empty log.
    pub(crate) candidate_last_log_entry: (Term, u64),
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    pub(crate) current_term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) failed to persist our vote: {0}")]
    ServerFault(#[from] LocalError),
}

#[derive(Clone, Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: PeerId,
    // "Previous log entry" is the log entry immediately preceding the new ones. Index 0 means the
    // new entries start the log.
    pub(crate) previous_log_entry: (Term, u64),
    pub(crate) leader_commit_index: u64,
    /// A packed single entry or batch entry. Empty for a heartbeat.
    pub(crate) packed_entries: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) last_log_index: u64,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry, our log is good up to {last_log_index}")]
    ServerMissingPreviousLogEntry { last_log_index: u64 },
    #[error("Packed entries are corrupt: {0}")]
    MalformedEntries(#[from] CodecError),
    #[error("We (server) had a local failure: {0}")]
    ServerFault(#[from] LocalError),
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

/// A peer's answer to AppendEntries, as seen by the leader.
#[derive(Debug, PartialEq)]
pub(crate) enum AppendEntriesReply {
    Ok { last_log_index: u64 },
    StaleTerm { current_term: Term },
    MissingLog { last_log_index: u64 },
    ServerFault(String),
    NotInCluster,
}

#[derive(Debug, PartialEq)]
pub(crate) enum RequestVoteReply {
    Vote { granted: bool, current_term: Term },
    ServerFault(String),
}

#[derive(Debug)]
pub(crate) struct CampaignOutput {
    pub(crate) term: Term,
    pub(crate) won: bool,
    pub(crate) votes: usize,
}
