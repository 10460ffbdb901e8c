use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_request_vote_error, proto_request_vote_result,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::local_state::Term;
use crate::replica::peers::{PeerId, PeerProxy};
use crate::replica::replica_api::{AppendEntriesInput, AppendEntriesReply, RequestVoteInput, RequestVoteReply};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("invalid peer uri {uri}: {message}")]
    InvalidUri { uri: String, message: String },
    #[error("failed to connect to {0:?}")]
    ConnectFailure(PeerId),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),
}

/// The channel used to push log entries to followers and to ask for votes.
#[async_trait::async_trait]
pub(crate) trait PeerTransport: Send + Sync {
    async fn append_entries(
        &self,
        peer: &PeerProxy,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn request_vote(&self, peer: &PeerProxy, input: RequestVoteInput) -> Result<RequestVoteReply, TransportError>;
}

/// gRPC implementation of [PeerTransport]. Connections are made on first use and dropped after a
/// failed call, so the next call reconnects.
pub(crate) struct GrpcPeerTransport {
    logger: slog::Logger,
    connect_timeout: Duration,
    clients: Mutex<HashMap<PeerId, GrpcRaftClient<Channel>>>,
}

impl GrpcPeerTransport {
    pub(crate) fn new(logger: slog::Logger, connect_timeout: Duration) -> Self {
        GrpcPeerTransport {
            logger,
            connect_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, peer: &PeerProxy) -> Result<GrpcRaftClient<Channel>, TransportError> {
        if let Some(client) = self.clients.lock().await.get(&peer.peer_id) {
            return Ok(client.clone());
        }

        let ip_octets = peer.address.ip_addr.octets();
        let uri = format!(
            "http://{}.{}.{}.{}:{}",
            ip_octets[0], ip_octets[1], ip_octets[2], ip_octets[3], peer.address.rpc_port
        );
        slog::info!(self.logger, "Connecting to {:?} at {} ...", peer.peer_id, uri);
        let endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| TransportError::InvalidUri {
            uri,
            message: e.to_string(),
        })?;

        let channel = match tokio::time::timeout(self.connect_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                slog::warn!(self.logger, "Failed to connect to {:?}: {:?}", peer.peer_id, e);
                return Err(TransportError::ConnectFailure(peer.peer_id.clone()));
            }
            Err(_elapsed) => return Err(TransportError::Timeout(self.connect_timeout)),
        };

        let client = GrpcRaftClient::new(channel);
        self.clients.lock().await.insert(peer.peer_id.clone(), client.clone());

        Ok(client)
    }

    async fn forget(&self, peer_id: &PeerId) {
        self.clients.lock().await.remove(peer_id);
    }
}

#[async_trait::async_trait]
impl PeerTransport for GrpcPeerTransport {
    async fn append_entries(
        &self,
        peer: &PeerProxy,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError> {
        let mut client = self.client(peer).await?;
        let request = ProtoAppendEntriesReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u32(),
            previous_log_entry_index: input.previous_log_entry.1,
            previous_log_entry_term: input.previous_log_entry.0.as_u32(),
            commit_index: input.leader_commit_index,
            packed_entries: input.packed_entries.to_vec(),
        };

        slog::debug!(self.logger, "ClientWire - {:?} entries bytes: {}", peer.peer_id, request.packed_entries.len());
        match client.append_entries(request).await {
            Ok(reply) => convert_append_entries_reply(reply.into_inner()),
            Err(status) => {
                self.forget(&peer.peer_id).await;
                Err(status.into())
            }
        }
    }

    async fn request_vote(&self, peer: &PeerProxy, input: RequestVoteInput) -> Result<RequestVoteReply, TransportError> {
        let mut client = self.client(peer).await?;
        let (last_log_entry_term, last_log_entry_index) = input.candidate_last_log_entry;
        let request = ProtoRequestVoteReq {
            candidate_id: input.candidate_id.into_inner(),
            term: input.candidate_term.as_u32(),
            last_log_entry_index,
            last_log_entry_term: last_log_entry_term.as_u32(),
        };

        slog::debug!(self.logger, "ClientWire - {:?}", request);
        match client.request_vote(request).await {
            Ok(reply) => convert_request_vote_reply(reply.into_inner()),
            Err(status) => {
                self.forget(&peer.peer_id).await;
                Err(status.into())
            }
        }
    }
}

fn convert_append_entries_reply(reply: ProtoAppendEntriesResult) -> Result<AppendEntriesReply, TransportError> {
    match reply.result {
        Some(proto_append_entries_result::Result::Ok(ok)) => Ok(AppendEntriesReply::Ok {
            last_log_index: ok.last_log_index,
        }),
        Some(proto_append_entries_result::Result::Err(err)) => match err.err {
            Some(proto_append_entries_error::Err::ServerFault(payload)) => {
                Ok(AppendEntriesReply::ServerFault(payload.message))
            }
            Some(proto_append_entries_error::Err::StaleTerm(payload)) => Ok(AppendEntriesReply::StaleTerm {
                current_term: Term::new(payload.current_term),
            }),
            Some(proto_append_entries_error::Err::MissingLog(payload)) => Ok(AppendEntriesReply::MissingLog {
                last_log_index: payload.last_log_index,
            }),
            Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => Ok(AppendEntriesReply::NotInCluster),
            None => Err(TransportError::MalformedReply("Malformed AppendEntries Err")),
        },
        None => Err(TransportError::MalformedReply("Malformed AppendEntries Result")),
    }
}

fn convert_request_vote_reply(reply: ProtoRequestVoteResult) -> Result<RequestVoteReply, TransportError> {
    match reply.result {
        Some(proto_request_vote_result::Result::Ok(ok)) => Ok(RequestVoteReply::Vote {
            granted: ok.vote_granted,
            current_term: Term::new(ok.current_term),
        }),
        Some(proto_request_vote_result::Result::Err(err)) => match err.err {
            Some(proto_request_vote_error::Err::ServerFault(fault)) => Ok(RequestVoteReply::ServerFault(fault.message)),
            None => Err(TransportError::MalformedReply("Malformed RequestVote Err")),
        },
        None => Err(TransportError::MalformedReply("Malformed RequestVote Result")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{
        ProtoAppendEntriesError, ProtoAppendEntriesSuccess, ProtoClientStaleTerm, ProtoServerMissingPreviousLog,
    };

    #[test]
    fn append_entries_replies() {
        fn run(result: Option<proto_append_entries_result::Result>, expected: Option<AppendEntriesReply>) {
            let converted = convert_append_entries_reply(ProtoAppendEntriesResult { result }).ok();
            assert_eq!(converted, expected);
        }

        run(
            Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                last_log_index: 7,
            })),
            Some(AppendEntriesReply::Ok { last_log_index: 7 }),
        );
        run(
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: 4,
                })),
            })),
            Some(AppendEntriesReply::StaleTerm {
                current_term: Term::new(4),
            }),
        );
        run(
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: 2,
                })),
            })),
            Some(AppendEntriesReply::MissingLog { last_log_index: 2 }),
        );
        run(
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: None })),
            None,
        );
        run(None, None);
    }
}
