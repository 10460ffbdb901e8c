mod election;
mod local_state;
mod peer_client;
mod peers;
mod replica;
mod replica_api;

pub use election::Role;
pub use local_state::PersistentState;
pub use local_state::PersistentStateStore;
pub use local_state::StateDelta;
pub use local_state::StateError;
pub use local_state::Term;
pub use peers::PeerAddress;
pub use peers::PeerId;
pub use peers::PeerProxy;
pub use peers::PeerProxyRegistry;
pub use peers::ProxyState;
pub use replica_api::LocalError;

pub(crate) use local_state::raft_context_dn;
pub(crate) use peer_client::GrpcPeerTransport;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::AppendEntriesError;
pub(crate) use replica_api::AppendEntriesInput;
pub(crate) use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::ApplyOutcome;
pub(crate) use replica_api::CampaignOutput;
pub(crate) use replica_api::ReplicateError;
pub(crate) use replica_api::ReplicateOutput;
pub(crate) use replica_api::RequestVoteError;
pub(crate) use replica_api::RequestVoteInput;
pub(crate) use replica_api::RequestVoteOutput;
