use crate::api::types::{CampaignResult, WriteOutput};
use crate::backend::{BackendError, DirectoryEntry, Dn, Modification, WriteQueue};
use crate::replica::{
    ApplyOutcome, LocalError, PeerId, PersistentState, Replica, ReplicateError, ReplicateOutput, Role, Term,
};
use crate::replication::{ApplyError, ConflictRecord, OperationKind, ReplicationApplier, ReplicationUpdate};
use crate::server::RpcServerShutdownHandle;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryWriteError {
    #[error("Not leader. Leader is {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("Entry {index} was acknowledged by {acks} of the {needed} members needed")]
    NoConsensus { index: u64, acks: usize, needed: usize },
    #[error("Lost leadership to term {0:?}")]
    LostLeadership(Term),
    /// The change could not be described against local state, e.g. the target doesn't exist.
    #[error("Invalid change: {0}")]
    InvalidChange(ApplyError),
    /// Committed to the log, but applying it failed the same way on every replica. The conflict is
    /// also in [DirectoryNode::unresolved_conflicts].
    #[error("Change committed but rejected: {0}")]
    Rejected(ApplyError),
    #[error(transparent)]
    Local(#[from] LocalError),
}

impl From<ReplicateError> for DirectoryWriteError {
    fn from(e: ReplicateError) -> Self {
        match e {
            ReplicateError::NotLeader { leader } => DirectoryWriteError::NotLeader {
                leader: leader.map(|id| id.into_inner()),
            },
            ReplicateError::NoConsensus { index, acks, needed } => {
                DirectoryWriteError::NoConsensus { index, acks, needed }
            }
            ReplicateError::StaleTerm(term) => DirectoryWriteError::LostLeadership(term),
            ReplicateError::Local(e) => DirectoryWriteError::Local(e),
        }
    }
}

/// DirectoryNode is one member of a replicated directory. Writes go through the leader's log and
/// are applied on every member; reads are served from the local store.
pub struct DirectoryNode {
    logger: slog::Logger,
    replica: Arc<Replica>,
    applier: Arc<ReplicationApplier>,
    queue: Arc<WriteQueue>,
    server_shutdown: Mutex<RpcServerShutdownHandle>,
}

impl DirectoryNode {
    pub(super) fn new(
        logger: slog::Logger,
        replica: Arc<Replica>,
        applier: Arc<ReplicationApplier>,
        queue: Arc<WriteQueue>,
        server_shutdown: RpcServerShutdownHandle,
    ) -> Self {
        DirectoryNode {
            logger,
            replica,
            applier,
            queue,
            server_shutdown: Mutex::new(server_shutdown),
        }
    }

    pub fn server_id(&self) -> &str {
        self.replica.me().as_str()
    }

    pub fn invocation_id(&self) -> &str {
        self.applier.invocation_id()
    }

    pub fn role(&self) -> Role {
        self.replica.role()
    }

    pub fn persistent_state(&self) -> PersistentState {
        self.replica.persistent_state()
    }

    /// Changes that committed but could not be applied, oldest first.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.applier.reconciliation().snapshot()
    }

    /// Hand over the unresolved conflicts and forget them.
    pub fn take_unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.applier.reconciliation().drain()
    }

    /// Take `server_id` out of this node's view of the cluster. Every member has to be told.
    /// Returns false for unknown or already removed members, and for this node itself.
    pub fn remove_peer(&self, server_id: &str) -> bool {
        self.replica.remove_peer(&PeerId::new(server_id))
    }

    /// Ask the other members to elect this node for a new term.
    pub async fn campaign(&self) -> Result<CampaignResult, DirectoryWriteError> {
        let output = self.replica.campaign().await?;

        Ok(CampaignResult {
            term: output.term,
            won: output.won,
            votes: output.votes,
        })
    }

    pub async fn add(&self, entry: DirectoryEntry) -> Result<WriteOutput, DirectoryWriteError> {
        self.ensure_leader()?;
        let update = self.applier.originate_add(entry);
        self.write(update, OperationKind::Add).await
    }

    pub async fn modify(&self, dn: Dn, mods: Vec<Modification>) -> Result<WriteOutput, DirectoryWriteError> {
        self.ensure_leader()?;
        let update = self
            .originate(move |applier| applier.originate_modify(&dn, &mods))
            .await?;
        self.write(update, OperationKind::Modify).await
    }

    pub async fn delete(&self, dn: Dn) -> Result<WriteOutput, DirectoryWriteError> {
        self.ensure_leader()?;
        let update = self.originate(move |applier| applier.originate_delete(&dn)).await?;
        self.write(update, OperationKind::Delete).await
    }

    /// Read `dn` from the local store. Followers may lag behind the leader.
    pub fn lookup(&self, dn: &Dn) -> Result<Option<DirectoryEntry>, BackendError> {
        let txn = self.queue.read()?;
        match txn.dn_to_entry_id(dn) {
            Ok(id) => Ok(Some(txn.id_to_entry(id)?)),
            Err(BackendError::NoSuchObject(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stop serving peer RPCs. Idempotent.
    pub fn shutdown(&self) {
        slog::info!(self.logger, "Shutting down peer RPC server");
        self.server_shutdown.lock().shutdown();
    }

    fn ensure_leader(&self) -> Result<(), DirectoryWriteError> {
        match self.replica.role() {
            Role::Leader { .. } => Ok(()),
            Role::Follower { leader } => Err(DirectoryWriteError::NotLeader {
                leader: leader.map(|id| id.into_inner()),
            }),
            Role::Candidate { .. } => Err(DirectoryWriteError::NotLeader { leader: None }),
        }
    }

    async fn originate<F>(&self, f: F) -> Result<ReplicationUpdate, DirectoryWriteError>
    where
        F: FnOnce(&ReplicationApplier) -> Result<ReplicationUpdate, ApplyError> + Send + 'static,
    {
        let applier = self.applier.clone();
        match tokio::task::spawn_blocking(move || f(&applier)).await {
            Ok(Ok(update)) => Ok(update),
            Ok(Err(e)) if e.is_transient() => Err(LocalError::from(e).into()),
            Ok(Err(e)) => Err(DirectoryWriteError::InvalidChange(e)),
            Err(join_error) => Err(LocalError::from(join_error).into()),
        }
    }

    async fn write(&self, update: ReplicationUpdate, kind: OperationKind) -> Result<WriteOutput, DirectoryWriteError> {
        let dn = update.entry.dn.clone();
        let ReplicateOutput { index, term, outcome } = self.replica.replicate(update, kind).await?;

        match outcome {
            ApplyOutcome::Applied(applied) => Ok(WriteOutput {
                index,
                term,
                applied: Some(applied),
            }),
            ApplyOutcome::Pending => {
                slog::warn!(self.logger, "{:?} of {} committed at {} but not applied yet", kind, dn, index);
                Ok(WriteOutput {
                    index,
                    term,
                    applied: None,
                })
            }
            ApplyOutcome::Rejected(e) => Err(DirectoryWriteError::Rejected(e)),
        }
    }
}
