//! Mock collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use migration::coordinator::{Coordinator, DriverConfig};
use migration::domain::{Domain, DomainEvent, DomainRegistry, DomainState};
use migration::lock::NopLockManager;
use migration::ports::PortService;
use migration::process::{IncomingTransport, ProcessManager};
use migration::remote::{
    FinishReply, FinishRequest, PeerConnector, PeerDaemon, PeerFeature, PrepareReply,
    PrepareRequest,
};
use migration::tunnel::TunnelStream;
use migration::vport::VportManager;
use migration::MigrationError;
use monitor_sdk::dto::{
    BlockJobInfo, GraphicsRelocation, MigrateCapability, MigrateStepFlags, MigrationStats,
    MigrationStatus, MirrorFlags, MonitorFeature,
};
use monitor_sdk::{Monitor, MonitorError};
use shared::cookie::LocalIdentity;
use shared::def::{
    CacheMode, DiskDef, DiskSource, DomainDef, FilesystemKind, GraphicsDef, GraphicsKind, NetDef,
    NetKind,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Scriptable stand-in for the hypervisor control channel
pub struct MockMonitor {
    features: Vec<MonitorFeature>,
    /// Every command issued, in order, as loggable strings
    pub commands: Mutex<Vec<String>>,
    /// How many `query-migrate` calls report Active before Completed
    pub active_polls: AtomicI64,
    /// Bytes pushed into descriptor-based migrations
    pub ram_bytes: usize,
    /// `query-migrate` reports Error instead of completing
    pub fail_migration: AtomicBool,
    cancel_requested: AtomicBool,
    polls_done: AtomicI64,
    writer_done: Arc<AtomicBool>,
    /// `block-job-info` calls until a mirror reports cur == end
    pub mirror_steps: u64,
    block_jobs: Mutex<HashMap<String, u64>>,
    pub xbzrle_supported: bool,
}

impl MockMonitor {
    pub fn new(features: &[MonitorFeature]) -> Arc<Self> {
        Arc::new(MockMonitor {
            features: features.to_vec(),
            commands: Mutex::new(Vec::new()),
            active_polls: AtomicI64::new(2),
            ram_bytes: 0,
            fail_migration: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            polls_done: AtomicI64::new(0),
            writer_done: Arc::new(AtomicBool::new(true)),
            mirror_steps: 1,
            block_jobs: Mutex::new(HashMap::new()),
            xbzrle_supported: true,
        })
    }

    pub fn with_ram(features: &[MonitorFeature], ram_bytes: usize) -> Arc<Self> {
        let mut monitor = MockMonitor {
            features: features.to_vec(),
            commands: Mutex::new(Vec::new()),
            active_polls: AtomicI64::new(1),
            ram_bytes,
            fail_migration: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            polls_done: AtomicI64::new(0),
            writer_done: Arc::new(AtomicBool::new(true)),
            mirror_steps: 1,
            block_jobs: Mutex::new(HashMap::new()),
            xbzrle_supported: true,
        };
        if ram_bytes > 0 {
            monitor.writer_done = Arc::new(AtomicBool::new(false));
        }
        Arc::new(monitor)
    }

    fn log(&self, command: String) {
        self.commands.lock().unwrap().push(command);
    }

    /// Whether any issued command starts with the given prefix
    pub fn took(&self, prefix: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|command| command.starts_with(prefix))
    }

    pub fn commands_snapshot(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Monitor for MockMonitor {
    fn supports(&self, feature: MonitorFeature) -> bool {
        self.features.contains(&feature)
    }

    async fn migrate_to_host(
        &self,
        flags: MigrateStepFlags,
        host: &str,
        port: u16,
    ) -> Result<(), MonitorError> {
        self.log(format!("migrate-to-host {host}:{port} flags={flags:?}"));
        Ok(())
    }

    async fn migrate_to_fd(
        &self,
        flags: MigrateStepFlags,
        fd: OwnedFd,
    ) -> Result<(), MonitorError> {
        self.log(format!("migrate-to-fd flags={flags:?}"));
        let total = self.ram_bytes;
        let done = self.writer_done.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = std::fs::File::from(fd);
            let chunk = vec![0xabu8; 8192];
            let mut written = 0;
            while written < total {
                let n = chunk.len().min(total - written);
                if sink.write_all(&chunk[..n]).is_err() {
                    break;
                }
                written += n;
            }
            done.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn migrate_to_unix(
        &self,
        flags: MigrateStepFlags,
        path: &str,
    ) -> Result<(), MonitorError> {
        self.log(format!("migrate-to-unix {path} flags={flags:?}"));
        let total = self.ram_bytes;
        let done = self.writer_done.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let Ok(mut sock) = tokio::net::UnixStream::connect(&path).await else {
                return;
            };
            let chunk = vec![0xcdu8; 8192];
            let mut written = 0;
            while written < total {
                let n = chunk.len().min(total - written);
                if sock.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
                written += n;
            }
            done.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn migrate_cancel(&self) -> Result<(), MonitorError> {
        self.log("migrate-cancel".into());
        self.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn query_migration(&self) -> Result<(MigrationStatus, MigrationStats), MonitorError> {
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Ok((MigrationStatus::Cancelled, MigrationStats::default()));
        }
        if self.fail_migration.load(Ordering::SeqCst) {
            return Ok((MigrationStatus::Error, MigrationStats::default()));
        }
        let remaining = self.active_polls.fetch_sub(1, Ordering::SeqCst);
        if remaining > 0 || !self.writer_done.load(Ordering::SeqCst) {
            let polled = self.polls_done.fetch_add(1, Ordering::SeqCst) + 1;
            let stats = MigrationStats {
                ram_transferred: 4096u64.saturating_mul(polled.unsigned_abs()),
                ram_remaining: 8192,
                ram_total: self.ram_bytes as u64,
                ..MigrationStats::default()
            };
            return Ok((MigrationStatus::Active, stats));
        }
        Ok((MigrationStatus::Completed, MigrationStats::default()))
    }

    async fn set_migration_speed(&self, bandwidth_mib: u64) -> Result<(), MonitorError> {
        self.log(format!("migrate-set-speed {bandwidth_mib}"));
        Ok(())
    }

    async fn query_migrate_capability(
        &self,
        cap: MigrateCapability,
    ) -> Result<bool, MonitorError> {
        self.log(format!("query-capability {cap:?}"));
        Ok(self.xbzrle_supported)
    }

    async fn set_migrate_capability(
        &self,
        cap: MigrateCapability,
        enabled: bool,
    ) -> Result<(), MonitorError> {
        self.log(format!("set-capability {cap:?}={enabled}"));
        Ok(())
    }

    async fn nbd_server_start(&self, host: &str, port: u16) -> Result<(), MonitorError> {
        self.log(format!("nbd-server-start {host}:{port}"));
        Ok(())
    }

    async fn nbd_server_add(&self, device: &str, writable: bool) -> Result<(), MonitorError> {
        self.log(format!("nbd-server-add {device} writable={writable}"));
        Ok(())
    }

    async fn nbd_server_stop(&self) -> Result<(), MonitorError> {
        self.log("nbd-server-stop".into());
        Ok(())
    }

    async fn drive_mirror(
        &self,
        device: &str,
        target: &str,
        speed_mib: u64,
        flags: MirrorFlags,
    ) -> Result<(), MonitorError> {
        self.log(format!("drive-mirror {device} -> {target} speed={speed_mib} flags={flags:?}"));
        self.block_jobs.lock().unwrap().insert(device.to_string(), 0);
        Ok(())
    }

    async fn block_job_info(&self, device: &str) -> Result<BlockJobInfo, MonitorError> {
        let mut jobs = self.block_jobs.lock().unwrap();
        let calls = jobs.entry(device.to_string()).or_insert(0);
        *calls += 1;
        Ok(BlockJobInfo {
            cur: (*calls).min(self.mirror_steps),
            end: self.mirror_steps,
        })
    }

    async fn block_job_abort(&self, device: &str) -> Result<(), MonitorError> {
        self.log(format!("block-job-abort {device}"));
        Ok(())
    }

    async fn cont(&self) -> Result<(), MonitorError> {
        self.log("cont".into());
        Ok(())
    }

    async fn stop(&self) -> Result<(), MonitorError> {
        self.log("stop".into());
        Ok(())
    }

    async fn graphics_relocate(&self, info: GraphicsRelocation) -> Result<(), MonitorError> {
        self.log(format!("client-migrate-info {} -> {}", info.protocol, info.hostname));
        Ok(())
    }

    async fn query_display_migrated(&self) -> Result<bool, MonitorError> {
        self.log("query-display-migrated".into());
        Ok(true)
    }
}

/// Process driver that launches mock monitors and counts tunnelled bytes
pub struct MockProcessManager {
    features: Vec<MonitorFeature>,
    /// `-incoming` values of every launch
    pub launched: Mutex<Vec<String>>,
    pub monitors: Mutex<Vec<Arc<MockMonitor>>>,
    pub killed: Mutex<Vec<Uuid>>,
    /// Bytes guests read from their standard input
    pub stdio_bytes: Arc<AtomicUsize>,
}

impl MockProcessManager {
    pub fn new(features: &[MonitorFeature]) -> Arc<Self> {
        Arc::new(MockProcessManager {
            features: features.to_vec(),
            launched: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            stdio_bytes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    fn hypervisor_supports(&self, feature: MonitorFeature) -> bool {
        self.features.contains(&feature)
    }

    async fn launch_incoming(
        &self,
        _def: &DomainDef,
        incoming: IncomingTransport,
    ) -> Result<Arc<dyn Monitor>, MigrationError> {
        self.launched.lock().unwrap().push(incoming.uri());

        if let IncomingTransport::Stdio { source } = incoming {
            let counter = self.stdio_bytes.clone();
            tokio::task::spawn_blocking(move || {
                let mut stdin = std::fs::File::from(source);
                let mut buf = [0u8; 8192];
                while let Ok(n) = stdin.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    counter.fetch_add(n, Ordering::SeqCst);
                }
            });
        }

        let monitor = MockMonitor::new(&self.features);
        self.monitors.lock().unwrap().push(monitor.clone());
        Ok(monitor)
    }

    async fn kill(&self, uuid: Uuid) -> Result<(), MigrationError> {
        self.killed.lock().unwrap().push(uuid);
        Ok(())
    }
}

/// Switch stand-in recording profile bindings in call order
pub struct MockVportManager {
    pub events: Mutex<Vec<String>>,
    fail_ifname: Mutex<Option<String>>,
}

impl MockVportManager {
    pub fn new() -> Arc<Self> {
        Arc::new(MockVportManager {
            events: Mutex::new(Vec::new()),
            fail_ifname: Mutex::new(None),
        })
    }

    /// Refuse the association of one interface
    pub fn fail_on(&self, ifname: &str) {
        *self.fail_ifname.lock().unwrap() = Some(ifname.to_string());
    }

    pub fn events_snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl VportManager for MockVportManager {
    async fn associate(
        &self,
        ifname: &str,
        _vport_type: &str,
        _guest: Uuid,
    ) -> Result<(), MigrationError> {
        self.events.lock().unwrap().push(format!("associate {ifname}"));
        if self.fail_ifname.lock().unwrap().as_deref() == Some(ifname) {
            return Err(MigrationError::OperationFailed(format!(
                "switch refused port profile for {ifname}"
            )));
        }
        Ok(())
    }

    async fn disassociate(
        &self,
        ifname: &str,
        _vport_type: &str,
        _guest: Uuid,
    ) -> Result<(), MigrationError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("disassociate {ifname}"));
        Ok(())
    }
}

/// Tunnel stream backed by one half of an in-memory duplex pipe
pub struct DuplexTunnelStream {
    writer: tokio::sync::Mutex<Option<DuplexStream>>,
    pub sent: AtomicUsize,
    pub finished: AtomicBool,
    pub aborted: AtomicBool,
}

impl DuplexTunnelStream {
    pub fn new(writer: DuplexStream) -> Arc<Self> {
        Arc::new(DuplexTunnelStream {
            writer: tokio::sync::Mutex::new(Some(writer)),
            sent: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TunnelStream for DuplexTunnelStream {
    async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("stream already closed"))?;
        writer.write_all(data).await?;
        self.sent.fetch_add(data.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> std::io::Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) -> std::io::Result<()> {
        self.writer.lock().await.take();
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer daemon bridged straight onto a destination coordinator
pub struct PeerBridge {
    pub dest: Arc<Coordinator>,
    pub features: Vec<PeerFeature>,
    pub alive: AtomicBool,
    /// Cookies the source sent with Prepare
    pub prepare_cookies: Mutex<Vec<Vec<u8>>>,
    /// Cookies the destination answered with
    pub reply_cookies: Mutex<Vec<Vec<u8>>>,
    /// Stream handle of the last tunnelled prepare
    pub tunnel_stream: Mutex<Option<Arc<DuplexTunnelStream>>>,
}

impl PeerBridge {
    pub fn new(dest: Arc<Coordinator>, features: &[PeerFeature]) -> Arc<Self> {
        Arc::new(PeerBridge {
            dest,
            features: features.to_vec(),
            alive: AtomicBool::new(true),
            prepare_cookies: Mutex::new(Vec::new()),
            reply_cookies: Mutex::new(Vec::new()),
            tunnel_stream: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PeerDaemon for PeerBridge {
    fn supports(&self, feature: PeerFeature) -> bool {
        self.features.contains(&feature)
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareReply, MigrationError> {
        if let Some(cookie) = &request.cookie {
            self.prepare_cookies.lock().unwrap().push(cookie.clone());
        }
        let output = self
            .dest
            .prepare_direct(
                request.cookie.as_deref(),
                request.uri.as_deref(),
                &request.def_payload,
                request.dname.as_deref(),
                request.flags,
            )
            .await?;
        if let Some(cookie) = &output.cookie {
            self.reply_cookies.lock().unwrap().push(cookie.clone());
        }
        Ok(PrepareReply {
            cookie: output.cookie,
            uri: output.uri,
        })
    }

    async fn prepare_tunnel(
        &self,
        request: PrepareRequest,
    ) -> Result<(PrepareReply, Arc<dyn TunnelStream>), MigrationError> {
        if let Some(cookie) = &request.cookie {
            self.prepare_cookies.lock().unwrap().push(cookie.clone());
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let cookie = self
            .dest
            .prepare_tunnel(
                request.cookie.as_deref(),
                Box::new(remote),
                &request.def_payload,
                request.dname.as_deref(),
                request.flags,
            )
            .await?;
        if let Some(cookie) = &cookie {
            self.reply_cookies.lock().unwrap().push(cookie.clone());
        }
        let stream = DuplexTunnelStream::new(local);
        *self.tunnel_stream.lock().unwrap() = Some(stream.clone());
        Ok((
            PrepareReply { cookie, uri: None },
            stream as Arc<dyn TunnelStream>,
        ))
    }

    async fn finish(&self, request: FinishRequest) -> Result<FinishReply, MigrationError> {
        let domain = self
            .dest
            .registry()
            .lookup_by_name(&request.dname)
            .await
            .ok_or_else(|| {
                MigrationError::OperationFailed(format!(
                    "no domain named '{}' on the destination",
                    request.dname
                ))
            })?;
        let output = self
            .dest
            .finish(
                &domain,
                request.cookie.as_deref(),
                request.flags,
                request.cancelled,
                request.v3,
            )
            .await?;
        Ok(FinishReply {
            cookie: output.cookie,
            domain: output.domain.map(|domain| domain.uuid),
        })
    }
}

pub struct BridgeConnector {
    pub bridge: Mutex<Option<Arc<PeerBridge>>>,
}

impl BridgeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(BridgeConnector {
            bridge: Mutex::new(None),
        })
    }

    pub fn set(&self, bridge: Arc<PeerBridge>) {
        *self.bridge.lock().unwrap() = Some(bridge);
    }
}

#[async_trait]
impl PeerConnector for BridgeConnector {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn PeerDaemon>, MigrationError> {
        self.bridge
            .lock()
            .unwrap()
            .clone()
            .map(|bridge| bridge as Arc<dyn PeerDaemon>)
            .ok_or_else(|| MigrationError::OperationFailed("no peer configured".into()))
    }
}

/// One daemon's worth of services wired around a coordinator
pub struct TestDaemon {
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<DomainRegistry>,
    pub ports: Arc<PortService>,
    pub process: Arc<MockProcessManager>,
    pub vports: Arc<MockVportManager>,
    pub connector: Arc<BridgeConnector>,
}

pub fn daemon(hostname: &str, hypervisor_features: &[MonitorFeature]) -> TestDaemon {
    daemon_with_config(hostname, hypervisor_features, DriverConfig::default())
}

pub fn daemon_with_config(
    hostname: &str,
    hypervisor_features: &[MonitorFeature],
    config: DriverConfig,
) -> TestDaemon {
    let registry = DomainRegistry::new();
    let ports = Arc::new(PortService::default());
    let process = MockProcessManager::new(hypervisor_features);
    let vports = MockVportManager::new();
    let connector = BridgeConnector::new();
    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        ports.clone(),
        Arc::new(NopLockManager),
        process.clone(),
        vports.clone(),
        connector.clone(),
        config,
        LocalIdentity {
            hostname: hostname.to_string(),
            host_uuid: Uuid::new_v4(),
        },
    ));
    TestDaemon {
        coordinator,
        registry,
        ports,
        process,
        vports,
        connector,
    }
}

pub fn spice_guest(name: &str) -> DomainDef {
    DomainDef {
        name: name.to_string(),
        uuid: Uuid::new_v4(),
        memory_kib: 2 * 1024 * 1024,
        vcpus: 2,
        disks: vec![],
        nets: vec![],
        graphics: vec![GraphicsDef {
            kind: GraphicsKind::Spice,
            port: 5901,
            tls_port: None,
            listen: "0.0.0.0".into(),
        }],
        hostdevs: vec![],
    }
}

pub fn disk_guest(name: &str) -> DomainDef {
    let mut def = spice_guest(name);
    def.disks.push(DiskDef {
        alias: "ide0-0-0".into(),
        source: Some(DiskSource::File {
            path: "/var/lib/guests/disk.qcow2".into(),
            filesystem: FilesystemKind::Local,
        }),
        shared: false,
        readonly: false,
        cache: CacheMode::Disabled,
    });
    def
}

pub fn direct_nic_guest(name: &str) -> DomainDef {
    let mut def = spice_guest(name);
    def.nets.push(NetDef {
        kind: NetKind::Direct,
        ifname: Some("vnet0".into()),
        mac: Some("52:54:00:aa:bb:01".into()),
        vport_type: Some("openvswitch".into()),
        portdata: Some("{\"profileid\":\"guest-a\"}".into()),
    });
    def.nets.push(NetDef {
        kind: NetKind::Direct,
        ifname: Some("vnet1".into()),
        mac: Some("52:54:00:aa:bb:02".into()),
        vport_type: Some("openvswitch".into()),
        portdata: None,
    });
    def
}

/// Register a running domain backed by the given monitor
pub async fn running_domain(
    daemon: &TestDaemon,
    def: DomainDef,
    monitor: Arc<MockMonitor>,
) -> Arc<Domain> {
    let domain = Domain::new(def, DomainState::Running, true);
    domain.lock().await.monitor = Some(monitor);
    daemon.registry.insert(domain.clone());
    domain
}

/// Collect everything a receiver has seen so far
pub fn drain_events(rx: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
