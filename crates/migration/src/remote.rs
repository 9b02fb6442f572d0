//! Client interface of the destination daemon
//!
//! The RPC machinery (transport, auth, keepalive) lives in the daemon's
//! client library; the coordinator only sees these calls. Every method maps
//! onto one remote migration entry point of the peer.
use crate::MigrationError;
use crate::tunnel::TunnelStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::flags::MigrateFlags;
use std::sync::Arc;
use uuid::Uuid;

/// Feature bits a peer daemon may advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFeature {
    Peer2Peer,
    /// 5-step Begin/Prepare/Perform/Finish/Confirm protocol
    V3,
    /// Extensible-parameter flavour of the v3 entry points
    MigrationParams,
    OfflineMigration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub cookie: Option<Vec<u8>>,
    pub uri: Option<String>,
    pub flags: MigrateFlags,
    pub dname: Option<String>,
    pub bandwidth_mib: u64,
    /// Transportable guest definition produced by Begin
    pub def_payload: String,
    pub v3: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareReply {
    pub cookie: Option<Vec<u8>>,
    /// Where the source should point the hypervisor; absent for tunnelled
    /// migrations
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub dname: String,
    pub cookie: Option<Vec<u8>>,
    pub flags: MigrateFlags,
    /// Whether the source failed to send all migration data
    pub cancelled: bool,
    pub v3: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishReply {
    pub cookie: Option<Vec<u8>>,
    /// Handle of the now-running guest; absent when the destination could
    /// not complete the migration
    pub domain: Option<Uuid>,
}

/// Connection to the destination daemon
#[async_trait]
pub trait PeerDaemon: Send + Sync {
    fn supports(&self, feature: PeerFeature) -> bool;

    /// Liveness probe used while the migration byte stream is in flight
    async fn is_alive(&self) -> bool;

    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareReply, MigrationError>;

    /// Prepare with the migration data carried over a new stream on this
    /// connection
    async fn prepare_tunnel(
        &self,
        request: PrepareRequest,
    ) -> Result<(PrepareReply, Arc<dyn TunnelStream>), MigrationError>;

    async fn finish(&self, request: FinishRequest) -> Result<FinishReply, MigrationError>;
}

/// Opens peer connections for peer-to-peer migrations
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn PeerDaemon>, MigrationError>;
}
