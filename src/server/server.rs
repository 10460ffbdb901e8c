use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_request_vote_error, proto_request_vote_result,
    ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess,
    ProtoClientNotInCluster, ProtoClientStaleTerm, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult,
    ProtoRequestVoteSuccess, ProtoServerFault, ProtoServerMissingPreviousLog,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, PeerId, Replica, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, Term,
};
use crate::server::RpcServerShutdownSignal;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: Arc<Replica>,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: Arc<Replica>) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.handle_request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: PeerId::new(rpc_request.candidate_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        match app_result {
            Ok(ok) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: ok.vote_granted,
                    current_term: ok.current_term.as_u32(),
                })),
            },
            Err(RequestVoteError::CandidateNotInCluster) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: false,
                    current_term: 0,
                })),
            },
            Err(RequestVoteError::RequestTermOutOfDate(term_info)) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: false,
                    current_term: term_info.current_term.as_u32(),
                })),
            },
            Err(RequestVoteError::ServerFault(e)) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                    err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                        message: e.to_string(),
                    })),
                })),
            },
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.handle_append_entries(app_input).await;
        if let Err(AppendEntriesError::ServerFault(e)) = &app_result {
            if e.is_fatal() {
                slog::error!(self.logger, "Fatal local failure handling AppendEntries: {}", e);
            }
        }
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: PeerId::new(rpc_request.leader_id),
            previous_log_entry,
            leader_commit_index: rpc_request.commit_index,
            packed_entries: Bytes::from(rpc_request.packed_entries),
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u32, log_entry_index: u64) -> Result<(Term, u64), Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok((Term::new(0), 0)),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok((Term::new(term), index)),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        last_log_index: ok.last_log_index,
                    })),
                }
            }
            Err(AppendEntriesError::ClientNotInCluster) => {
                proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u32(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog { last_log_index })
            }
            Err(e) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries from {} term {} prev ({}, {}) commit {} bytes {}",
            rpc_request.leader_id,
            rpc_request.term,
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
            rpc_request.commit_index,
            rpc_request.packed_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::LocalError;

    #[test]
    fn log_entry_metadata() {
        fn run(term: u32, index: u64, expected: Option<(Term, u64)>) {
            let converted = RpcServer::convert_log_entry_metadata(term, index).ok();
            assert_eq!(converted, expected, "({}, {})", term, index);
        }

        run(0, 0, Some((Term::new(0), 0)));
        run(3, 7, Some((Term::new(3), 7)));
        run(0, 7, None);
        run(3, 0, None);
    }

    #[test]
    fn append_entries_errors_map_to_proto() {
        fn run(app_error: AppendEntriesError, check: fn(&proto_append_entries_error::Err) -> bool) {
            let reply = RpcServer::convert_append_entries_result(Err(app_error));
            match reply.result {
                Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })) => {
                    assert!(check(&err), "{:?}", err)
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }

        run(AppendEntriesError::ClientNotInCluster, |err| {
            matches!(err, proto_append_entries_error::Err::ClientNotInCluster(_))
        });
        run(
            AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index: 4 },
            |err| matches!(err, proto_append_entries_error::Err::MissingLog(p) if p.last_log_index == 4),
        );
        run(
            AppendEntriesError::ServerFault(LocalError::MissingCommittedEntry(9)),
            |err| matches!(err, proto_append_entries_error::Err::ServerFault(p) if p.message.contains('9')),
        );
    }
}
