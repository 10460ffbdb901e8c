use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// PeerId is the server id of a cluster member. Also what a vote is cast for.
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct PeerAddress {
    pub ip_addr: Ipv4Addr,
    pub rpc_port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// Configured, never contacted.
    PendingAdd,
    Disconnected,
    Idle,
    /// A call to the peer is in flight.
    Connected,
}

impl ProxyState {
    fn can_transition_to(self, next: ProxyState) -> bool {
        use ProxyState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (PendingAdd, Connected) | (Disconnected, Connected) => true,
            (Connected, Idle) | (Idle, Connected) => true,
            (a, b) => a == b,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerProxy {
    pub peer_id: PeerId,
    pub address: PeerAddress,
    pub state: ProxyState,
    pub log_replicated: bool,
    pub is_deleted: bool,
}

/// PeerProxyRegistry tracks every other member of the cluster, and which of them acknowledged the
/// current replication round.
///
/// Removal is logical. A removed peer keeps its slot until [PeerProxyRegistry::compact] runs
/// between rounds, so positions handed out during a round stay valid.
pub struct PeerProxyRegistry {
    logger: slog::Logger,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    proxies: Vec<PeerProxy>,
    positions: HashMap<PeerId, usize>,
}

impl PeerProxyRegistry {
    pub fn new(logger: slog::Logger) -> Self {
        PeerProxyRegistry {
            logger,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Panics if `peer_id` is already registered and not deleted.
    pub fn add_peer(&self, peer_id: PeerId, address: PeerAddress) {
        let mut inner = self.inner.lock();
        if let Some(&position) = inner.positions.get(&peer_id) {
            assert!(
                inner.proxies[position].is_deleted,
                "Peer {:?} is already registered",
                peer_id
            );
            // Re-adding a removed peer reuses its slot.
            inner.proxies[position] = PeerProxy {
                peer_id,
                address,
                state: ProxyState::PendingAdd,
                log_replicated: false,
                is_deleted: false,
            };
            return;
        }

        let position = inner.proxies.len();
        inner.positions.insert(peer_id.clone(), position);
        inner.proxies.push(PeerProxy {
            peer_id,
            address,
            state: ProxyState::PendingAdd,
            log_replicated: false,
            is_deleted: false,
        });
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        let inner = self.inner.lock();
        match inner.positions.get(peer_id) {
            Some(&position) => !inner.proxies[position].is_deleted,
            None => false,
        }
    }

    /// Returns false (and changes nothing) for unknown or removed peers and invalid transitions.
    pub fn set_state(&self, peer_id: &PeerId, next: ProxyState) -> bool {
        let mut inner = self.inner.lock();
        let position = match inner.positions.get(peer_id) {
            Some(&position) => position,
            None => return false,
        };
        let proxy = &mut inner.proxies[position];
        if proxy.is_deleted {
            return false;
        }
        if !proxy.state.can_transition_to(next) {
            slog::warn!(
                self.logger,
                "Ignoring invalid peer state transition {:?} -> {:?} for {:?}",
                proxy.state,
                next,
                peer_id
            );
            return false;
        }
        if proxy.state != next {
            slog::debug!(self.logger, "Peer {:?}: {:?} -> {:?}", peer_id, proxy.state, next);
        }
        proxy.state = next;

        true
    }

    pub fn mark_replicated(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(&position) = inner.positions.get(peer_id) {
            inner.proxies[position].log_replicated = true;
        }
    }

    /// Start of an append-entries round.
    pub fn clear_replicated_flags(&self) {
        let mut inner = self.inner.lock();
        for proxy in inner.proxies.iter_mut() {
            proxy.log_replicated = false;
        }
    }

    /// Self plus every live peer that acknowledged this round.
    pub fn consensus_count(&self) -> usize {
        let inner = self.inner.lock();
        1 + inner
            .proxies
            .iter()
            .filter(|p| !p.is_deleted && p.log_replicated)
            .count()
    }

    pub fn connected_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .proxies
            .iter()
            .filter(|p| !p.is_deleted && p.state != ProxyState::Disconnected && p.state != ProxyState::PendingAdd)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .proxies
            .iter()
            .filter(|p| !p.is_deleted && p.state == ProxyState::Idle)
            .count()
    }

    /// Copies of every non-deleted proxy, in registration order.
    pub fn active_peers(&self) -> Vec<PeerProxy> {
        let inner = self.inner.lock();
        inner.proxies.iter().filter(|p| !p.is_deleted).cloned().collect()
    }

    /// Members including self.
    pub fn cluster_size(&self) -> usize {
        let inner = self.inner.lock();
        1 + inner.proxies.iter().filter(|p| !p.is_deleted).count()
    }

    /// Soft delete. The peer stops counting immediately and is dropped at the next compaction.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let mut inner = self.inner.lock();
        let position = match inner.positions.get(peer_id) {
            Some(&position) => position,
            None => return false,
        };
        let proxy = &mut inner.proxies[position];
        if proxy.is_deleted {
            return false;
        }
        proxy.state = ProxyState::Disconnected;
        proxy.log_replicated = false;
        proxy.is_deleted = true;
        slog::info!(self.logger, "Removed peer {:?}", peer_id);

        true
    }

    /// Physically drop soft-deleted peers. Only call between replication rounds.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.proxies.len();
        inner.proxies.retain(|p| !p.is_deleted);
        let positions = inner
            .proxies
            .iter()
            .enumerate()
            .map(|(position, p)| (p.peer_id.clone(), position))
            .collect();
        inner.positions = positions;

        before - inner.proxies.len()
    }

    pub fn majority(cluster_size: usize) -> usize {
        (cluster_size / 2) + 1
    }
}
