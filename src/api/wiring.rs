use crate::api::node::DirectoryNode;
use crate::api::options::RaftOptionsValidated;
use crate::api::types::MemberInfo;
use crate::backend::{InMemoryObjectStore, ObjectStore, WriteQueue};
use crate::commitlog::LogStore;
use crate::replica::{
    GrpcPeerTransport, LocalError, PeerId, PeerProxyRegistry, PersistentStateStore, Replica, ReplicaConfig, StateError,
};
use crate::replication::ReplicationApplier;
use crate::server::RpcServer;
use crate::{server, RaftOptions};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::sync::Arc;
use uuid::Uuid;

pub struct DirectoryNodeConfig {
    pub my_server_id: String,
    pub cluster_members: Vec<MemberInfo>,
    /// Identifies this server in replication metadata. A random one is generated when unset.
    pub invocation_id: Option<String>,
    /// Defaults to a fresh in-memory store.
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("my server ID not in cluster config")]
    MeNotInCluster,
    #[error("Persistent raft state initialization failure: {0}")]
    StateInitialization(#[from] StateError),
    #[error("Failed to apply committed entries on startup: {0}")]
    Recovery(#[from] LocalError),
}

/// Build a node, start its peer RPC server, and apply anything committed before a restart. The
/// node starts as a follower; call [DirectoryNode::campaign] to elect it.
pub async fn try_create_directory_node(config: DirectoryNodeConfig) -> Result<DirectoryNode, NodeCreationError> {
    let root_logger = config.info_logger;

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;

    validate_cluster(&config.cluster_members)?;
    let my_member_info = my_info(&config.my_server_id, &config.cluster_members)
        .ok_or(NodeCreationError::MeNotInCluster)?
        .clone();

    let object_store: Arc<dyn ObjectStore> = match config.object_store {
        Some(object_store) => object_store,
        None => Arc::new(InMemoryObjectStore::new()),
    };
    let queue = Arc::new(WriteQueue::new(
        root_logger.new(slog::o!("component" => "write-queue")),
        object_store,
        options.write_queue_timeout,
    ));

    let (state, log) = {
        let logger = root_logger.clone();
        let queue = queue.clone();
        tokio::task::spawn_blocking(move || -> Result<_, StateError> {
            PersistentStateStore::bootstrap(&logger, &queue)?;
            let state = Arc::new(PersistentStateStore::load(
                logger.new(slog::o!("component" => "persistent-state")),
                queue.clone(),
            )?);
            let log = Arc::new(LogStore::new(
                logger.new(slog::o!("component" => "log-store")),
                queue,
                state.clone(),
            ));
            Ok((state, log))
        })
        .await
        .map_err(LocalError::from)??
    };

    let invocation_id = config
        .invocation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    slog::info!(root_logger, "Server {} has invocation id {}", config.my_server_id, invocation_id);
    let applier = Arc::new(ReplicationApplier::new(
        root_logger.new(slog::o!("component" => "applier")),
        queue.clone(),
        invocation_id,
    ));

    let peers = Arc::new(PeerProxyRegistry::new(root_logger.new(slog::o!("component" => "peers"))));
    for member in config.cluster_members.iter() {
        if member.server_id != config.my_server_id {
            peers.add_peer(member.peer_id(), member.peer_address());
        }
    }

    let transport = Arc::new(GrpcPeerTransport::new(
        root_logger.new(slog::o!("component" => "peer-transport")),
        options.connect_timeout,
    ));

    let replica = Arc::new(Replica::new(ReplicaConfig {
        logger: root_logger.new(slog::o!("component" => "replica")),
        me: PeerId::new(config.my_server_id),
        queue: queue.clone(),
        state,
        log,
        applier: applier.clone(),
        peers,
        transport,
        append_entries_timeout: options.append_entries_timeout,
        consensus_retries: options.consensus_retries,
        consensus_retry_backoff: options.consensus_retry_backoff,
        log_rotation_threshold: options.log_rotation_threshold,
    }));
    replica.recover().await?;

    let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();
    let rpc_server = RpcServer::new(root_logger.new(slog::o!("component" => "rpc-server")), replica.clone());
    tokio::spawn(rpc_server.run(my_member_info.rpc_socket_addr(), server_shutdown_signal));

    Ok(DirectoryNode::new(
        root_logger,
        replica,
        applier,
        queue,
        server_shutdown_handle,
    ))
}

fn validate_cluster(cluster_members: &[MemberInfo]) -> Result<(), NodeCreationError> {
    let mut seen = HashSet::with_capacity(cluster_members.len());
    for member in cluster_members {
        if member.server_id.is_empty() {
            return Err(NodeCreationError::InvalidClusterInfo("empty server id".to_string()));
        }
        if !seen.insert(member.server_id.as_str()) {
            return Err(NodeCreationError::InvalidClusterInfo(format!(
                "duplicate server id {}",
                member.server_id
            )));
        }
    }

    Ok(())
}

fn my_info<'a>(my_server_id: &'_ str, cluster_members: &'a [MemberInfo]) -> Option<&'a MemberInfo> {
    cluster_members.iter().find(|member| member.server_id == my_server_id)
}
