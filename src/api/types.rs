use crate::replica::{PeerAddress, PeerId, Term};
use crate::replication::Applied;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub server_id: String,
    pub ip_addr: Ipv4Addr,
    pub rpc_port: u16,
}

impl MemberInfo {
    pub(crate) fn peer_id(&self) -> PeerId {
        PeerId::new(self.server_id.as_str())
    }

    pub(crate) fn peer_address(&self) -> PeerAddress {
        PeerAddress {
            ip_addr: self.ip_addr,
            rpc_port: self.rpc_port,
        }
    }

    pub(crate) fn rpc_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.rpc_port))
    }
}

/// Where a change landed in the replicated log.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteOutput {
    pub index: u64,
    pub term: Term,
    /// None when the entry is committed but applying it locally is still pending after a transient
    /// backend failure.
    pub applied: Option<Applied>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignResult {
    pub term: Term,
    pub won: bool,
    /// Including our own.
    pub votes: usize,
}
