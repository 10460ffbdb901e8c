use crate::backend::WriteQueue;
use crate::commitlog::{LogStore, RaftLogEntry, RequestCode};
use crate::replica::election::{ElectionState, Role};
use crate::replica::local_state::{PersistentLocalState, PersistentState, PersistentStateStore, StateDelta, Term};
use crate::replica::peer_client::{PeerTransport, TransportError};
use crate::replica::peers::{PeerId, PeerProxy, PeerProxyRegistry, ProxyState};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReply, ApplyOutcome, CampaignOutput,
    LocalError, ReplicateError, ReplicateOutput, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    RequestVoteReply, TermOutOfDateInfo,
};
use crate::replication::{Applied, ApplyError, OperationKind, ReplicationApplier, ReplicationUpdate};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::cmp;
use std::sync::Arc;
use std::time::Duration;

// Max entries packed into one catch-up batch.
const CATCH_UP_BATCH_LIMIT: usize = 64;
// Max AppendEntries calls spent walking a lagging peer forward within one round.
const MAX_CATCH_UP_CALLS: usize = 16;

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) me: PeerId,
    pub(crate) queue: Arc<WriteQueue>,
    pub(crate) state: Arc<PersistentStateStore>,
    pub(crate) log: Arc<LogStore>,
    pub(crate) applier: Arc<ReplicationApplier>,
    pub(crate) peers: Arc<PeerProxyRegistry>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) consensus_retries: u32,
    pub(crate) consensus_retry_backoff: Duration,
    pub(crate) log_rotation_threshold: usize,
}

/// Replica is the raft role logic of one node.
///
/// Leader side: append a change locally, push it to followers, commit it once a majority has it,
/// then apply it. Follower side: accept entries from the leader, commit what the leader says is
/// committed, and apply it. Both sides apply through the same [ReplicationApplier].
///
/// Blocking storage work runs on `spawn_blocking` threads. No lock is held across an await.
pub(crate) struct Replica {
    logger: slog::Logger,
    me: PeerId,
    queue: Arc<WriteQueue>,
    state: Arc<PersistentStateStore>,
    log: Arc<LogStore>,
    applier: Arc<ReplicationApplier>,
    peers: Arc<PeerProxyRegistry>,
    transport: Arc<dyn PeerTransport>,
    election_state: Mutex<ElectionState>,
    // One replication round at a time.
    round_lock: tokio::sync::Mutex<()>,
    // One thread applying committed entries at a time.
    apply_lock: Mutex<()>,
    append_entries_timeout: Duration,
    consensus_retries: u32,
    consensus_retry_backoff: Duration,
    log_rotation_threshold: usize,
}

#[derive(Debug, thiserror::Error)]
enum PeerReplicationError {
    #[error("peer has a newer term {0:?}")]
    StaleTerm(Term),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer reported: {0}")]
    Remote(String),
    #[error("peer needs entries from {needed}, but the log starts at {first_log_index}")]
    TooFarBehind { needed: u64, first_log_index: u64 },
    #[error("peer still behind after {0} catch-up calls")]
    CatchUpIncomplete(usize),
    #[error(transparent)]
    Local(#[from] LocalError),
}

impl Replica {
    pub(crate) fn new(config: ReplicaConfig) -> Self {
        Replica {
            election_state: Mutex::new(ElectionState::new_follower(
                config.logger.new(slog::o!("component" => "election")),
            )),
            logger: config.logger,
            me: config.me,
            queue: config.queue,
            state: config.state,
            log: config.log,
            applier: config.applier,
            peers: config.peers,
            transport: config.transport,
            round_lock: tokio::sync::Mutex::new(()),
            apply_lock: Mutex::new(()),
            append_entries_timeout: config.append_entries_timeout,
            consensus_retries: config.consensus_retries,
            consensus_retry_backoff: config.consensus_retry_backoff,
            log_rotation_threshold: config.log_rotation_threshold,
        }
    }

    pub(crate) fn me(&self) -> &PeerId {
        &self.me
    }

    pub(crate) fn role(&self) -> Role {
        self.election_state.lock().role().clone()
    }

    pub(crate) fn persistent_state(&self) -> PersistentState {
        self.state.snapshot()
    }

    pub(crate) fn applier(&self) -> &ReplicationApplier {
        &self.applier
    }

    /// Take a peer out of the cluster. It stops counting towards consensus at once; its slot is
    /// dropped before the next replication round.
    pub(crate) fn remove_peer(&self, peer_id: &PeerId) -> bool {
        if *peer_id == self.me {
            slog::warn!(self.logger, "Refusing to remove myself from the cluster");
            return false;
        }
        self.peers.remove(peer_id)
    }

    /// Run `f` on a blocking thread with this replica.
    async fn blocking<F, T, E>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Replica) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<LocalError> + Send + 'static,
    {
        let replica = self.clone();
        match tokio::task::spawn_blocking(move || f(&replica)).await {
            Ok(result) => result,
            Err(join_error) => Err(LocalError::from(join_error).into()),
        }
    }

    /// Apply whatever was committed but not applied before the last shutdown.
    pub(crate) async fn recover(self: &Arc<Self>) -> Result<(), LocalError> {
        let state = self.state.snapshot();
        if state.last_applied < state.commit_index {
            slog::info!(
                self.logger,
                "Applying committed entries {}..={} left over from before restart",
                state.last_applied + 1,
                state.commit_index
            );
        }
        self.blocking(|replica| replica.apply_committed(None).map(|_| ()))
            .await
    }

    // ---------- Leader ----------

    /// Replicate a change originated on this node. Returns once the entry is committed and the
    /// leader has applied it.
    pub(crate) async fn replicate(
        self: &Arc<Self>,
        update: ReplicationUpdate,
        kind: OperationKind,
    ) -> Result<ReplicateOutput, ReplicateError> {
        self.replicate_entry(RequestCode::for_operation(kind), update.encode()).await
    }

    async fn replicate_entry(
        self: &Arc<Self>,
        request_code: RequestCode,
        payload: Bytes,
    ) -> Result<ReplicateOutput, ReplicateError> {
        let _round = self.round_lock.lock().await;

        let leader_term = self.election_state.lock().leader_term();
        let term = match leader_term {
            Some(term) => term,
            None => {
                let leader = self.election_state.lock().known_leader();
                return Err(ReplicateError::NotLeader { leader });
            }
        };

        // 1. Append to my own log.
        let entry = self
            .blocking(move |replica| replica.append_local(term, request_code, payload))
            .await?;
        let index = entry.index;
        slog::debug!(self.logger, "Appended {:?}", entry);

        // 2. Push to followers until a majority has it.
        self.replicate_round(term, index).await?;

        // 3. Commit and apply.
        let outcome = self
            .blocking(move |replica| replica.commit_and_apply(term, index))
            .await?;

        // Tell followers about the new commit index so they apply too.
        self.broadcast_heartbeat(term).await;

        Ok(ReplicateOutput { index, term, outcome })
    }

    fn append_local(&self, term: Term, request_code: RequestCode, payload: Bytes) -> Result<RaftLogEntry, LocalError> {
        let mut write = self.queue.begin_write()?;
        let state = self.state.snapshot();

        let entry = RaftLogEntry::new(state.last_log_index + 1, term, request_code, payload);
        self.log.append(write.txn(), &entry)?;
        let delta = StateDelta {
            last_log_index: Some(entry.index),
            last_log_term: Some(term),
            ..StateDelta::default()
        };
        self.state.stage(write.txn(), &delta)?;
        write.commit_then(|| self.state.publish(&delta))?;

        Ok(entry)
    }

    async fn replicate_round(self: &Arc<Self>, term: Term, index: u64) -> Result<(), ReplicateError> {
        let compacted = self.peers.compact();
        if compacted > 0 {
            slog::debug!(self.logger, "Dropped {} removed peers", compacted);
        }
        self.peers.clear_replicated_flags();
        let mut needed = PeerProxyRegistry::majority(self.peers.cluster_size());
        let mut acks = self.peers.consensus_count();

        for attempt in 0..=self.consensus_retries {
            if acks >= needed {
                return Ok(());
            }
            if attempt > 0 {
                let backoff_ms = self.consensus_retry_backoff.as_millis() as u64;
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff_ms);
                let delay = self.consensus_retry_backoff * attempt + Duration::from_millis(jitter_ms);
                slog::info!(
                    self.logger,
                    "Entry {} has {}/{} acks. Retrying in {:?}",
                    index,
                    acks,
                    needed,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let mut calls = Vec::new();
            for peer in self.peers.active_peers().into_iter().filter(|p| !p.log_replicated) {
                let replica = self.clone();
                calls.push(tokio::task::spawn(async move {
                    let result = replica.replicate_to_peer(&peer, term, index).await;
                    (peer.peer_id, result)
                }));
            }

            let mut newer_term = None;
            for call in calls {
                match call.await {
                    Ok((peer_id, Ok(()))) => self.peers.mark_replicated(&peer_id),
                    Ok((_, Err(PeerReplicationError::StaleTerm(peer_term)))) => {
                        newer_term = cmp::max(newer_term, Some(peer_term));
                    }
                    Ok((peer_id, Err(e))) => {
                        slog::warn!(self.logger, "Failed to replicate entry {} to {:?}: {}", index, peer_id, e);
                    }
                    Err(e) => slog::error!(self.logger, "Replication task failed: {:?}", e),
                }
            }

            if let Some(newer_term) = newer_term {
                self.observe_newer_term(newer_term).await?;
                return Err(ReplicateError::StaleTerm(newer_term));
            }
            // Peers removed during the attempt no longer count towards the majority.
            needed = PeerProxyRegistry::majority(self.peers.cluster_size());
            acks = self.peers.consensus_count();
        }

        if acks >= needed {
            return Ok(());
        }

        slog::warn!(
            self.logger,
            "No consensus for entry {} ({}/{} acks). Stepping down.",
            index,
            acks,
            needed
        );
        self.election_state.lock().transition_to_follower(None);
        Err(ReplicateError::NoConsensus { index, acks, needed })
    }

    async fn replicate_to_peer(
        self: &Arc<Self>,
        peer: &PeerProxy,
        term: Term,
        index: u64,
    ) -> Result<(), PeerReplicationError> {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer.peer_id)));
        self.peers.set_state(&peer.peer_id, ProxyState::Connected);

        let mut start = index;
        for _ in 0..MAX_CATCH_UP_CALLS {
            let input = self
                .blocking(move |replica| replica.append_entries_input(term, start, index))
                .await?;
            let input = match input {
                Some(input) => input,
                None => {
                    let first_log_index = self.state.snapshot().first_log_index;
                    slog::warn!(
                        logger,
                        "Peer needs log entries from {} but my log starts at {}. It cannot catch up from the log.",
                        start,
                        first_log_index
                    );
                    self.peers.set_state(&peer.peer_id, ProxyState::Idle);
                    return Err(PeerReplicationError::TooFarBehind {
                        needed: start,
                        first_log_index,
                    });
                }
            };

            let reply = match self.call_append_entries(peer, input).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.peers.set_state(&peer.peer_id, ProxyState::Disconnected);
                    return Err(e.into());
                }
            };

            match reply {
                AppendEntriesReply::Ok { last_log_index } if last_log_index >= index => {
                    self.peers.set_state(&peer.peer_id, ProxyState::Idle);
                    return Ok(());
                }
                AppendEntriesReply::Ok { last_log_index } => {
                    slog::debug!(logger, "Peer caught up to {}, continuing", last_log_index);
                    start = last_log_index + 1;
                }
                AppendEntriesReply::MissingLog { last_log_index } => {
                    slog::info!(logger, "Peer is missing previous log entry. Its log is good up to {}", last_log_index);
                    start = last_log_index + 1;
                }
                AppendEntriesReply::StaleTerm { current_term } => {
                    self.peers.set_state(&peer.peer_id, ProxyState::Idle);
                    return Err(PeerReplicationError::StaleTerm(current_term));
                }
                AppendEntriesReply::ServerFault(message) => {
                    self.peers.set_state(&peer.peer_id, ProxyState::Idle);
                    return Err(PeerReplicationError::Remote(message));
                }
                AppendEntriesReply::NotInCluster => {
                    self.peers.set_state(&peer.peer_id, ProxyState::Idle);
                    return Err(PeerReplicationError::Remote("Peer doesn't think we're in the cluster".into()));
                }
            }
        }

        self.peers.set_state(&peer.peer_id, ProxyState::Idle);
        Err(PeerReplicationError::CatchUpIncomplete(MAX_CATCH_UP_CALLS))
    }

    async fn call_append_entries(
        &self,
        peer: &PeerProxy,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError> {
        match tokio::time::timeout(self.append_entries_timeout, self.transport.append_entries(peer, input)).await {
            Ok(reply) => reply,
            Err(_elapsed) => Err(TransportError::Timeout(self.append_entries_timeout)),
        }
    }

    /// Request carrying entries `start..=end`, at most [CATCH_UP_BATCH_LIMIT] of them. None when
    /// `start` (or the entry before it) has already been purged by rotation.
    fn append_entries_input(&self, term: Term, start: u64, end: u64) -> Result<Option<AppendEntriesInput>, LocalError> {
        let state = self.state.snapshot();
        if start < state.first_log_index || (start == state.first_log_index && start > 1) {
            return Ok(None);
        }

        let txn = self.queue.read()?;
        let (previous_index, previous_term) = self.log.prev_log_args(txn.as_ref(), start, state.first_log_index)?;
        let entries = self.log.entries_between(txn.as_ref(), start, end, CATCH_UP_BATCH_LIMIT)?;
        let packed_entries = match entries.len() {
            0 => Bytes::new(),
            1 => entries[0].pack(),
            _ => RaftLogEntry::pack_batch(&entries)
                .map_err(|source| LocalError::Codec { index: start, source })?
                .pack(),
        };

        Ok(Some(AppendEntriesInput {
            leader_term: term,
            leader_id: self.me.clone(),
            previous_log_entry: (previous_term, previous_index),
            leader_commit_index: state.commit_index,
            packed_entries,
        }))
    }

    fn commit_and_apply(&self, term: Term, index: u64) -> Result<ApplyOutcome, LocalError> {
        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        if index > self.state.snapshot().commit_index {
            self.state.save(StateDelta {
                commit_index: Some(index),
                commit_index_term: Some(term),
                ..StateDelta::default()
            })?;
            slog::debug!(self.logger, "Committed up to {}", index);
        }

        self.apply_committed(Some(index))
    }

    /// Best effort. Failures are only logged; the next round carries the commit index again.
    async fn broadcast_heartbeat(self: &Arc<Self>, term: Term) {
        let state = self.state.snapshot();
        let input = AppendEntriesInput {
            leader_term: term,
            leader_id: self.me.clone(),
            previous_log_entry: (state.last_log_term, state.last_log_index),
            leader_commit_index: state.commit_index,
            packed_entries: Bytes::new(),
        };

        let mut calls = Vec::new();
        for peer in self.peers.active_peers() {
            let replica = self.clone();
            let input = input.clone();
            calls.push(tokio::task::spawn(async move {
                let reply = replica.call_append_entries(&peer, input).await;
                (peer.peer_id, reply)
            }));
        }

        let mut newer_term = None;
        for call in calls {
            match call.await {
                Ok((_, Ok(AppendEntriesReply::StaleTerm { current_term }))) => {
                    newer_term = cmp::max(newer_term, Some(current_term));
                }
                Ok((_, Ok(_))) => {}
                Ok((peer_id, Err(e))) => {
                    slog::debug!(self.logger, "Heartbeat to {:?} failed: {}", peer_id, e);
                    self.peers.set_state(&peer_id, ProxyState::Disconnected);
                }
                Err(e) => slog::error!(self.logger, "Heartbeat task failed: {:?}", e),
            }
        }

        if let Some(newer_term) = newer_term {
            if let Err(e) = self.observe_newer_term(newer_term).await {
                slog::error!(self.logger, "Failed to store newer term {:?}: {}", newer_term, e);
            }
        }
    }

    async fn observe_newer_term(self: &Arc<Self>, term: Term) -> Result<(), LocalError> {
        let increased = self
            .blocking(move |replica| replica.state.store_term_if_increased(term).map_err(LocalError::from))
            .await?;
        if increased {
            slog::info!(self.logger, "Observed newer term {:?}", term);
        }
        self.election_state.lock().transition_to_follower(None);

        Ok(())
    }

    // ---------- Both ----------

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    ///
    /// Returns the outcome for `watch` if that entry was applied by this call.
    fn apply_committed(&self, watch: Option<u64>) -> Result<ApplyOutcome, LocalError> {
        let _applying = self.apply_lock.lock();
        let mut outcome = ApplyOutcome::Pending;

        loop {
            let state = self.state.snapshot();
            if state.last_applied >= state.commit_index {
                break;
            }

            let index = state.last_applied + 1;
            let entry = match self.log.fetch(index)? {
                Some(entry) => entry,
                None => {
                    slog::error!(self.logger, "Committed log entry {} is missing", index);
                    return Err(LocalError::MissingCommittedEntry(index));
                }
            };

            match self.apply_entry(entry) {
                Ok(result) => {
                    if watch == Some(index) {
                        outcome = match result {
                            Some(Ok(applied)) => ApplyOutcome::Applied(applied),
                            Some(Err(rejected)) => ApplyOutcome::Rejected(rejected),
                            None => ApplyOutcome::Pending,
                        };
                    }
                }
                Err(LocalError::Apply(e)) if e.is_transient() => {
                    slog::warn!(self.logger, "Failed to apply log entry {}, will retry later: {}", index, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.maybe_rotate()?;

        Ok(outcome)
    }

    /// Apply one committed entry and advance lastApplied in the same transaction. A change that is
    /// rejected (already recorded for reconciliation) still advances lastApplied, so the log is not
    /// blocked behind it. None for entries without a change record.
    fn apply_entry(&self, entry: RaftLogEntry) -> Result<Option<Result<Applied, ApplyError>>, LocalError> {
        let index = entry.index;
        let delta = StateDelta {
            last_applied: Some(index),
            ..StateDelta::default()
        };
        let sections = entry
            .into_entries()
            .map_err(|source| LocalError::Codec { index, source })?;

        let mut txn = self.applier.begin()?;
        let mut last_applied = None;
        for section in sections.iter() {
            let kind = match section.request_code.operation() {
                Some(kind) => kind,
                None => continue,
            };
            let update = ReplicationUpdate::decode(&section.payload)
                .map_err(|source| LocalError::ChangeRecord { index, source })?;

            match self.applier.apply_in(&mut txn, &update, kind) {
                Ok(applied) => last_applied = Some(applied),
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    drop(txn);
                    self.state.save(delta)?;
                    return Ok(Some(Err(e)));
                }
            }
        }

        self.state.stage(txn.txn(), &delta)?;
        txn.commit_then(|| self.state.publish(&delta))?;

        Ok(last_applied.map(Ok))
    }

    /// Rotate once everything is applied and the current segment holds enough applied entries.
    fn maybe_rotate(&self) -> Result<(), LocalError> {
        if self.log_rotation_threshold == 0 {
            return Ok(());
        }
        let state = self.state.snapshot();
        if state.last_applied != state.last_log_index {
            return Ok(());
        }
        if self.log.applied_in_current_segment()? < self.log_rotation_threshold {
            return Ok(());
        }

        let segments = self.log.rotate()?;
        slog::info!(self.logger, "Log rotated, now appending to segment {}", segments.current);

        Ok(())
    }

    // ---------- Follower ----------

    pub(crate) async fn handle_append_entries(
        self: &Arc<Self>,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.blocking(move |replica| replica.server_handle_append_entries(input))
            .await
    }

    fn server_handle_append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // Ensure leader is known member.
        if !self.peers.contains(&input.leader_id) {
            return Err(AppendEntriesError::ClientNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .state
            .store_term_if_increased(input.leader_term)
            .map_err(LocalError::from)?;
        {
            let mut election_state = self.election_state.lock();
            if increased || !matches!(election_state.role(), Role::Follower { .. }) {
                election_state.transition_to_follower(Some(input.leader_id.clone()));
            } else {
                election_state.set_leader_if_unknown(&input.leader_id);
            }
        }

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        //
        // Committed entries always match the leader's, so only check above the commit index.
        let state = self.state.snapshot();
        let (previous_term, previous_index) = input.previous_log_entry;
        if previous_index > state.commit_index {
            match self.log.fetch(previous_index).map_err(LocalError::from)? {
                Some(entry) if entry.term == previous_term => {}
                Some(_) => {
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                        last_log_index: state.commit_index,
                    })
                }
                None => {
                    let last_log_index = if state.last_log_index < previous_index {
                        state.last_log_index
                    } else {
                        state.commit_index
                    };
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index });
                }
            }
        }

        let new_entries = if input.packed_entries.is_empty() {
            Vec::new()
        } else {
            match RaftLogEntry::unpack(&input.packed_entries).and_then(RaftLogEntry::into_entries) {
                Ok(entries) => entries,
                Err(e) => {
                    slog::error!(self.logger, "Discarding corrupt entries from {:?}: {}", input.leader_id, e);
                    return Err(e.into());
                }
            }
        };

        let matched_index = self.store_new_entries(&input, new_entries)?;
        self.apply_committed(None)?;

        Ok(AppendEntriesOutput {
            last_log_index: matched_index,
        })
    }

    /// Steps 3 to 5 of AppendEntries in one write transaction. Returns the index up to which my log
    /// now matches the leader's.
    fn store_new_entries(&self, input: &AppendEntriesInput, new_entries: Vec<RaftLogEntry>) -> Result<u64, LocalError> {
        let (_, previous_index) = input.previous_log_entry;
        let last_new_index = new_entries.last().map(|e| e.index).unwrap_or(previous_index);

        let mut write = self.queue.begin_write()?;
        let state = self.state.snapshot();
        let mut delta = StateDelta::default();

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        for new_entry in new_entries {
            if new_entry.index <= state.commit_index {
                continue;
            }

            match self.log.fetch_in(write.txn(), new_entry.index)? {
                Some(existing) if existing.term == new_entry.term => continue,
                Some(existing) => {
                    let deleted = self.log.delete_from(write.txn(), new_entry.index)?;
                    slog::warn!(
                        self.logger,
                        "Entry {} from term {:?} conflicts with leader's term {:?}. Truncated {} entries.",
                        new_entry.index,
                        existing.term,
                        new_entry.term,
                        deleted.len()
                    );
                }
                None => {}
            }

            self.log.append(write.txn(), &new_entry)?;
            delta.last_log_index = Some(new_entry.index);
            delta.last_log_term = Some(new_entry.term);
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let new_commit_index = cmp::min(input.leader_commit_index, last_new_index);
        if new_commit_index > state.commit_index {
            match self.log.fetch_in(write.txn(), new_commit_index)? {
                Some(entry) => {
                    delta.commit_index = Some(new_commit_index);
                    delta.commit_index_term = Some(entry.term);
                }
                None => slog::warn!(self.logger, "Cannot commit up to {}, entry is missing", new_commit_index),
            }
        }

        if delta != StateDelta::default() {
            self.state.stage(write.txn(), &delta)?;
            write.commit_then(|| self.state.publish(&delta))?;
        }

        Ok(last_new_index)
    }

    // ---------- Election ----------

    pub(crate) async fn handle_request_vote(
        self: &Arc<Self>,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        self.blocking(move |replica| replica.server_handle_request_vote(input))
            .await
    }

    fn server_handle_request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.peers.contains(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        let (current_term, mut opt_voted_for) = self.state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .state
            .store_term_if_increased(input.candidate_term)
            .map_err(LocalError::from)?;
        if increased {
            self.election_state.lock().transition_to_follower(None);
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let current_term = input.candidate_term;

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput {
                    vote_granted: false,
                    current_term,
                });
            }
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
        let cas_success = self
            .state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(LocalError::from)?;
        if cas_success {
            return Ok(RequestVoteOutput {
                vote_granted: true,
                current_term,
            });
        }

        // We lost a CAS race. Grant only if the winner made the same vote we would have.
        let (reread_term, reread_voted_for) = self.state.voted_for_current_term();
        let vote_granted = reread_term == input.candidate_term && reread_voted_for.as_ref() == Some(&input.candidate_id);
        Ok(RequestVoteOutput {
            vote_granted,
            current_term: reread_term,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: (Term, u64)) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        let state = self.state.snapshot();
        let (candidate_term, candidate_index) = candidate_last_entry;
        if candidate_term != state.last_log_term {
            return candidate_term > state.last_log_term;
        }

        candidate_index >= state.last_log_index
    }

    /// Stand for election in a new term. There are no election timers; an operator or the
    /// embedding process decides when to campaign. On winning, a no-op entry of the new term is
    /// replicated so earlier entries commit.
    pub(crate) async fn campaign(self: &Arc<Self>) -> Result<CampaignOutput, LocalError> {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let me = self.me.clone();
        let term = self
            .blocking(move |replica| replica.state.increment_term_and_vote_for_self(&me).map_err(LocalError::from))
            .await?;
        self.election_state.lock().transition_to_candidate(term);

        let state = self.state.snapshot();
        let input = RequestVoteInput {
            candidate_term: term,
            candidate_id: self.me.clone(),
            candidate_last_log_entry: (state.last_log_term, state.last_log_index),
        };

        let mut calls = Vec::new();
        for peer in self.peers.active_peers() {
            let replica = self.clone();
            let input = input.clone();
            calls.push(tokio::task::spawn(async move {
                replica.peers.set_state(&peer.peer_id, ProxyState::Connected);
                let reply = tokio::time::timeout(
                    replica.append_entries_timeout,
                    replica.transport.request_vote(&peer, input),
                )
                .await;
                (peer.peer_id, reply)
            }));
        }

        let mut votes = 1;
        let mut newer_term = None;
        for call in calls {
            let (peer_id, reply) = match call.await {
                Ok(call) => call,
                Err(e) => {
                    slog::error!(self.logger, "RequestVote task failed: {:?}", e);
                    continue;
                }
            };

            match reply {
                Ok(Ok(RequestVoteReply::Vote { granted, current_term })) => {
                    self.peers.set_state(&peer_id, ProxyState::Idle);
                    if granted {
                        votes += 1;
                    } else if current_term > term {
                        newer_term = cmp::max(newer_term, Some(current_term));
                    } else {
                        slog::info!(self.logger, "Vote not granted from {:?} for term {:?}", peer_id, term);
                    }
                }
                Ok(Ok(RequestVoteReply::ServerFault(message))) => {
                    self.peers.set_state(&peer_id, ProxyState::Idle);
                    slog::warn!(self.logger, "RequestVote Service Fault from {:?}: {}", peer_id, message);
                }
                Ok(Err(e)) => {
                    self.peers.set_state(&peer_id, ProxyState::Disconnected);
                    slog::warn!(self.logger, "RequestVote to {:?} failed: {}", peer_id, e);
                }
                Err(_elapsed) => {
                    self.peers.set_state(&peer_id, ProxyState::Disconnected);
                    slog::warn!(self.logger, "Timed out calling RequestVote on {:?}", peer_id);
                }
            }
        }

        if let Some(newer_term) = newer_term {
            self.observe_newer_term(newer_term).await?;
            return Ok(CampaignOutput {
                term,
                won: false,
                votes,
            });
        }

        let needed = PeerProxyRegistry::majority(self.peers.cluster_size());
        slog::info!(self.logger, "Received {}/{} votes for term {:?}", votes, needed, term);
        let became_leader = votes >= needed && self.election_state.lock().transition_to_leader(term);
        if !became_leader {
            return Ok(CampaignOutput {
                term,
                won: false,
                votes,
            });
        }

        let won = match self.replicate_entry(RequestCode::NO_OP, Bytes::new()).await {
            Ok(output) => {
                slog::info!(self.logger, "Leader for term {:?}, no-op committed at {}", term, output.index);
                true
            }
            Err(ReplicateError::Local(e)) => return Err(e),
            Err(e) => {
                slog::warn!(self.logger, "Failed to commit no-op for term {:?}: {}", term, e);
                false
            }
        };

        Ok(CampaignOutput { term, won, votes })
    }
}
