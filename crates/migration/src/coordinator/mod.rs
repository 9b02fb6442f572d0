//! The migration coordinator
//!
//! `source` holds the Begin/Perform/Confirm side, `dest` the
//! Prepare/Finish side; this module owns the pieces both share: the driver
//! configuration, the transport descriptor and the Run step that issues
//! `migrate` and supervises it.
mod dest;
mod source;

pub use dest::{FinishOutput, PrepareOutput};
pub use source::BeginOutput;

use crate::MigrationError;
use crate::cookie as mig_cookie;
use crate::domain::{
    Domain, DomainEventKind, DomainRegistry, DomainState, PausedReason, ResumedDetail,
    StoppedDetail, SuspendedDetail,
};
use crate::lock::LockManager;
use crate::ports::PortService;
use crate::process::ProcessManager;
use crate::progress;
use crate::remote::{PeerConnector, PeerDaemon};
use crate::storage;
use crate::tunnel::{self, TunnelStream};
use crate::vport::VportManager;
use monitor_sdk::dto::{
    GraphicsRelocation, MigrateCapability, MigrateStepFlags, MonitorFeature,
};
use serde::{Deserialize, Serialize};
use shared::cookie::{Cookie, CookieFlags, LocalIdentity};
use shared::flags::MigrateFlags;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::UnixListener;

/// Driver-level migration settings, injected at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Transfer-rate cap used when the caller passes no bandwidth, MiB/s
    pub default_bandwidth_mib: u64,
    /// Where source-side tunnel sockets are created for hypervisors that
    /// cannot take a pre-opened descriptor
    pub tunnel_socket_dir: PathBuf,
    pub spice_tls: bool,
    /// Subject of the x509 certificate the destination display presents
    pub spice_tls_subject: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            default_bandwidth_mib: crate::constants::DEFAULT_MIGRATION_BANDWIDTH_MIB,
            tunnel_socket_dir: PathBuf::from("/var/lib/hypervisor"),
            spice_tls: false,
            spice_tls_subject: None,
        }
    }
}

/// Where the hypervisor should send the migration byte stream
pub enum MigrationDestination {
    /// The hypervisor connects out itself
    Host { name: String, port: u16 },
    /// The daemon connects and hands the socket over as a descriptor
    ConnectHost { name: String, port: u16 },
    /// The hypervisor writes into a unix socket the daemon listens on
    Unix { path: PathBuf, listener: UnixListener },
    /// Pre-opened descriptor pair: one end for the hypervisor, one kept
    /// locally for the relay
    Fd {
        hypervisor: Option<OwnedFd>,
        local: Option<Box<dyn AsyncRead + Send + Unpin>>,
    },
}

/// Whether bytes go to the peer directly or through the tunnel relay
pub enum MigrationForward {
    Direct,
    Stream(Arc<dyn TunnelStream>),
}

pub struct MigrationSpec {
    pub dest: MigrationDestination,
    pub forward: MigrationForward,
}

impl MigrationSpec {
    /// Destination hostname for transports that expose one; the storage
    /// mirror needs it to build NBD URLs
    fn dest_host(&self) -> Option<&str> {
        match &self.dest {
            MigrationDestination::Host { name, .. }
            | MigrationDestination::ConnectHost { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub struct Coordinator {
    registry: Arc<DomainRegistry>,
    ports: Arc<PortService>,
    lock_manager: Arc<dyn LockManager>,
    process: Arc<dyn ProcessManager>,
    vports: Arc<dyn VportManager>,
    connector: Arc<dyn PeerConnector>,
    config: DriverConfig,
    identity: LocalIdentity,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DomainRegistry>,
        ports: Arc<PortService>,
        lock_manager: Arc<dyn LockManager>,
        process: Arc<dyn ProcessManager>,
        vports: Arc<dyn VportManager>,
        connector: Arc<dyn PeerConnector>,
        config: DriverConfig,
        identity: LocalIdentity,
    ) -> Self {
        Coordinator {
            registry,
            ports,
            lock_manager,
            process,
            vports,
            connector,
            config,
            identity,
        }
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortService> {
        &self.ports
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub(crate) async fn eat_cookie(
        &self,
        domain: &Arc<Domain>,
        bytes: Option<&[u8]>,
        requested: CookieFlags,
    ) -> Result<Cookie, MigrationError> {
        mig_cookie::eat(domain, &self.identity, &self.lock_manager, bytes, requested).await
    }

    pub(crate) async fn bake_cookie(
        &self,
        domain: &Arc<Domain>,
        flags: CookieFlags,
    ) -> Result<Vec<u8>, MigrationError> {
        mig_cookie::bake(
            domain,
            &self.identity,
            &self.lock_manager,
            &self.config,
            flags,
        )
        .await
    }

    /// Flag combinations rejected before any side effect
    pub(crate) fn validate_offline_flags(flags: MigrateFlags) -> Result<(), MigrationError> {
        if !flags.contains(MigrateFlags::OFFLINE) {
            return Ok(());
        }
        if flags.wants_storage_copy() {
            return Err(MigrationError::OperationInvalid(
                "offline migration cannot handle non-shared storage".into(),
            ));
        }
        if !flags.contains(MigrateFlags::PERSIST_DEST) {
            return Err(MigrationError::OperationInvalid(
                "offline migration must be specified with the persistent flag set".into(),
            ));
        }
        if flags.contains(MigrateFlags::TUNNELLED) {
            return Err(MigrationError::OperationInvalid(
                "tunnelled offline migration does not make sense".into(),
            ));
        }
        Ok(())
    }

    /// Pause the guest for a non-live transfer or the v3 handover window
    pub(crate) async fn set_offline(&self, domain: &Arc<Domain>) -> Result<(), MigrationError> {
        let (monitor, name) = {
            let inner = domain.lock().await;
            (inner.monitor()?, inner.def.name.clone())
        };
        monitor.stop().await?;
        domain.lock().await.state = DomainState::Paused(PausedReason::Migration);
        self.registry.emit(
            domain.uuid,
            &name,
            DomainEventKind::Suspended(SuspendedDetail::Migrated),
        );
        Ok(())
    }

    /// Resume guest CPUs; the caller decides which event to emit
    pub(crate) async fn start_cpus(&self, domain: &Arc<Domain>) -> Result<(), MigrationError> {
        let monitor = { domain.lock().await.monitor()? };
        monitor.cont().await?;
        let mut inner = domain.lock().await;
        inner.state = DomainState::Running;
        // leases are re-acquired by the running process
        inner.lock_state = None;
        Ok(())
    }

    /// Restart CPUs after a failed Perform; the guest stays paused if even
    /// that fails
    pub(crate) async fn resume_after_failure(&self, domain: &Arc<Domain>) {
        let (paused, name) = {
            let inner = domain.lock().await;
            (inner.state.is_paused() && inner.is_active(), inner.def.name.clone())
        };
        if !paused {
            return;
        }
        match self.start_cpus(domain).await {
            Ok(()) => self.registry.emit(
                domain.uuid,
                &name,
                DomainEventKind::Resumed(ResumedDetail::Migrated),
            ),
            Err(err) => {
                tracing::error!(domain = %name, "failed to resume guest after failure: {err}");
            }
        }
    }

    /// Kill the guest process and account for it
    pub(crate) async fn process_stop(&self, domain: &Arc<Domain>, detail: StoppedDetail) {
        let name = { domain.lock().await.def.name.clone() };
        if let Err(err) = self.process.kill(domain.uuid).await {
            tracing::warn!(domain = %name, "unable to kill guest process: {err}");
        }
        {
            let mut inner = domain.lock().await;
            inner.monitor = None;
            inner.state = DomainState::Shutoff;
            if inner.prepare_cleanup {
                inner.prepare_cleanup = false;
                inner.job = None;
            }
        }
        tracing::info!(domain = %name, result = ?detail, "guest stopped");
        self.registry
            .emit(domain.uuid, &name, DomainEventKind::Stopped(detail));
    }

    /// Negotiate and enable stream compression on one side
    pub(crate) async fn set_compression(
        &self,
        domain: &Arc<Domain>,
        incoming: bool,
    ) -> Result<(), MigrationError> {
        let monitor = { domain.lock().await.monitor()? };
        if !monitor
            .query_migrate_capability(MigrateCapability::Xbzrle)
            .await?
        {
            let side = if incoming { "target" } else { "source" };
            return Err(MigrationError::ArgumentUnsupported(format!(
                "compressed migration is not supported by the {side} hypervisor"
            )));
        }
        monitor
            .set_migrate_capability(MigrateCapability::Xbzrle, true)
            .await?;
        Ok(())
    }

    /// Point the display server at its new home so clients can follow
    pub(crate) async fn graphics_relocate(
        &self,
        domain: &Arc<Domain>,
        cookie: &Cookie,
    ) -> Result<(), MigrationError> {
        let Some(graphics) = &cookie.graphics else {
            return Ok(());
        };
        if graphics.kind != "spice" {
            return Ok(());
        }
        let Some(hostname) = &cookie.remote_hostname else {
            return Ok(());
        };
        let monitor = { domain.lock().await.monitor()? };
        monitor
            .graphics_relocate(GraphicsRelocation {
                protocol: graphics.kind.clone(),
                hostname: hostname.clone(),
                port: Some(graphics.port),
                tls_port: graphics.tls_port,
                tls_subject: graphics.tls_subject.clone(),
            })
            .await?;
        Ok(())
    }

    /// Open the TCP connection ourselves and turn a ConnectHost spec into
    /// a descriptor handover
    async fn migration_connect(&self, host: &str, port: u16) -> Result<OwnedFd, MigrationError> {
        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|err| {
                MigrationError::OperationFailed(format!(
                    "unable to connect to destination host {host}:{port}: {err}"
                ))
            })?;
        let stream = stream.into_std()?;
        // the hypervisor expects a blocking descriptor
        stream.set_nonblocking(false)?;
        Ok(OwnedFd::from(stream))
    }

    /// The shared Perform step: storage pre-copy, `migrate`, supervision,
    /// rollback and the reply cookie. The first error always wins; cleanup
    /// failures are logged only.
    pub(crate) async fn run(
        &self,
        domain: &Arc<Domain>,
        cookie_in: Option<&[u8]>,
        want_cookie: bool,
        flags: MigrateFlags,
        bandwidth_mib: u64,
        mut spec: MigrationSpec,
        peer: Option<&Arc<dyn PeerDaemon>>,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        let mut monitor_flags = MigrateStepFlags::BACKGROUND;
        let mut cookie_flags = CookieFlags::empty();
        if flags.contains(MigrateFlags::NON_SHARED_DISK) {
            monitor_flags |= MigrateStepFlags::NON_SHARED_DISK;
            cookie_flags |= CookieFlags::NBD;
        }
        if flags.contains(MigrateFlags::NON_SHARED_INC) {
            monitor_flags |= MigrateStepFlags::NON_SHARED_INC;
            cookie_flags |= CookieFlags::NBD;
        }

        if self.lock_manager.uses_state() && !want_cookie {
            return Err(MigrationError::Internal(format!(
                "migration with lock driver {} requires cookie support",
                self.lock_manager.name()
            )));
        }

        let speed_mib = if bandwidth_mib != 0 {
            bandwidth_mib
        } else {
            self.config.default_bandwidth_mib
        };
        let abort_on_error = flags.contains(MigrateFlags::ABORT_ON_ERROR);
        let mirror_wanted = flags.wants_storage_copy();

        let mut cookie = self
            .eat_cookie(domain, cookie_in, cookie_flags | CookieFlags::GRAPHICS)
            .await?;

        if let Err(err) = self.graphics_relocate(domain, &cookie).await {
            tracing::warn!("unable to provide data for graphics client relocation: {err}");
        }

        // clears the NON_SHARED bits from monitor_flags when it copied
        // everything itself
        storage::drive_mirror(
            domain,
            &mut cookie,
            spec.dest_host(),
            speed_mib,
            &mut monitor_flags,
        )
        .await?;

        if !flags.contains(MigrateFlags::LIVE) && domain.lock().await.state.is_running() {
            self.set_offline(domain).await?;
        }

        if flags.contains(MigrateFlags::COMPRESSED) {
            self.set_compression(domain, false).await?;
        }

        let mut tunnel_handle = None;
        let mut result = self
            .run_transfer(
                domain,
                &mut spec,
                monitor_flags,
                speed_mib,
                peer,
                abort_on_error,
                &mut tunnel_handle,
            )
            .await;

        // rollback / teardown; the captured result survives all of it
        if mirror_wanted {
            storage::cancel_drive_mirror(domain).await;
        }
        if let Some(handle) = tunnel_handle {
            let stopped = handle.stop(result.is_err()).await;
            if result.is_ok()
                && let Err(err) = stopped
            {
                result = Err(err.into());
            }
        }

        result?;

        if !want_cookie {
            return Ok(None);
        }
        let mut out_flags = cookie_flags | CookieFlags::NETWORK;
        if flags.contains(MigrateFlags::PERSIST_DEST) {
            out_flags |= CookieFlags::PERSISTENT;
        }
        match self.bake_cookie(domain, out_flags).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) => {
                tracing::warn!("unable to encode migration cookie: {err}");
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        domain: &Arc<Domain>,
        spec: &mut MigrationSpec,
        monitor_flags: MigrateStepFlags,
        speed_mib: u64,
        peer: Option<&Arc<dyn PeerDaemon>>,
        abort_on_error: bool,
        tunnel_handle: &mut Option<tunnel::TunnelHandle>,
    ) -> Result<(), MigrationError> {
        let (monitor, abort) = {
            let mut inner = domain.lock().await;
            let monitor = inner.monitor()?;
            let abort = inner
                .job_mut()
                .map(|job| job.abort.clone())
                .ok_or_else(|| MigrationError::Internal("no migration job".into()))?;
            (monitor, abort)
        };

        // last check before the point of no return; a cancel observed here
        // needs no migrate_cancel since nothing was issued yet
        if abort.is_cancelled() {
            return Err(MigrationError::aborted_by_client("migration out job"));
        }

        monitor.set_migration_speed(speed_mib).await?;

        if let MigrationDestination::ConnectHost { name, port } = &spec.dest {
            let fd = self.migration_connect(name, *port).await?;
            spec.dest = MigrationDestination::Fd {
                hypervisor: Some(fd),
                local: None,
            };
        }

        match &mut spec.dest {
            MigrationDestination::Host { name, port } => {
                monitor.migrate_to_host(monitor_flags, name, *port).await?;
            }
            MigrationDestination::ConnectHost { .. } => {
                unreachable!("rewritten to a descriptor above");
            }
            MigrationDestination::Unix { path, .. } => {
                monitor
                    .migrate_to_unix(monitor_flags, &path.to_string_lossy())
                    .await?;
            }
            MigrationDestination::Fd { hypervisor, .. } => {
                let fd = hypervisor
                    .take()
                    .ok_or_else(|| MigrationError::Internal("migration fd already taken".into()))?;
                monitor.migrate_to_fd(monitor_flags, fd).await?;
            }
        }

        if !domain.lock().await.is_active() {
            return Err(MigrationError::Internal("guest unexpectedly quit".into()));
        }

        // from here on a failure must cancel the migration on the source
        let post_setup: Result<(), MigrationError> = async {
            let local_reader: Option<Box<dyn AsyncRead + Send + Unpin>> = match &mut spec.dest {
                MigrationDestination::Fd { local, .. } => local.take(),
                MigrationDestination::Unix { listener, .. } => {
                    // the migrate command may have failed late; look once
                    // before blocking on a connection that may never come
                    progress::update_job_status(domain, "migration job").await?;
                    let (sock, _) = listener.accept().await.map_err(|err| {
                        MigrationError::OperationFailed(format!(
                            "failed to accept connection from hypervisor: {err}"
                        ))
                    })?;
                    Some(Box::new(sock))
                }
                _ => None,
            };

            if let MigrationForward::Stream(stream) = &spec.forward {
                let reader = local_reader.ok_or_else(|| {
                    MigrationError::Internal("no local descriptor for tunnelled migration".into())
                })?;
                *tunnel_handle = Some(tunnel::start(reader, stream.clone()));
            }
            Ok(())
        }
        .await;

        if let Err(err) = post_setup {
            progress::cancel_migration(domain).await;
            return Err(err);
        }

        progress::wait_for_completion(domain, peer, abort_on_error).await?;

        // the hypervisor paused the CPUs on completion; account for it so
        // the lock state is released while we sit between Perform and
        // Confirm
        if domain.lock().await.state.is_running() {
            self.set_offline(domain).await?;
        }

        Ok(())
    }

    /// Native transport: point the hypervisor at the destination URI
    pub(crate) async fn do_native_migrate(
        &self,
        domain: &Arc<Domain>,
        uri: &str,
        cookie_in: Option<&[u8]>,
        want_cookie: bool,
        flags: MigrateFlags,
        bandwidth_mib: u64,
        peer: Option<&Arc<dyn PeerDaemon>>,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        let parsed = shared::uri::parse_migration_uri(uri)
            .map_err(|err| MigrationError::InvalidArgument(err.to_string()))?;
        let port = parsed.port.ok_or_else(|| {
            MigrationError::InvalidArgument(format!("missing port in migration URI: {uri}"))
        })?;

        let monitor = { domain.lock().await.monitor()? };
        let dest = if monitor.supports(MonitorFeature::FdMigration) {
            MigrationDestination::ConnectHost {
                name: parsed.host,
                port,
            }
        } else {
            MigrationDestination::Host {
                name: parsed.host,
                port,
            }
        };

        self.run(
            domain,
            cookie_in,
            want_cookie,
            flags,
            bandwidth_mib,
            MigrationSpec {
                dest,
                forward: MigrationForward::Direct,
            },
            peer,
        )
        .await
    }

    /// Tunnelled transport: the byte stream leaves through `stream`
    pub(crate) async fn do_tunnel_migrate(
        &self,
        domain: &Arc<Domain>,
        stream: Arc<dyn TunnelStream>,
        cookie_in: Option<&[u8]>,
        want_cookie: bool,
        flags: MigrateFlags,
        bandwidth_mib: u64,
        peer: Option<&Arc<dyn PeerDaemon>>,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        let (monitor, name) = {
            let inner = domain.lock().await;
            (inner.monitor()?, inner.def.name.clone())
        };

        let mut socket_path = None;
        let dest = if monitor.supports(MonitorFeature::FdMigration) {
            let (tx, rx) = tokio::net::unix::pipe::pipe().map_err(|err| {
                MigrationError::OperationFailed(format!(
                    "cannot create pipe for tunnelled migration: {err}"
                ))
            })?;
            let fd = tx.into_blocking_fd()?;
            MigrationDestination::Fd {
                hypervisor: Some(fd),
                local: Some(Box::new(rx)),
            }
        } else if monitor.supports(MonitorFeature::UnixMigration) {
            let path = self
                .config
                .tunnel_socket_dir
                .join(format!("tunnelmigrate.src.{name}"));
            let listener = UnixListener::bind(&path).map_err(|err| {
                MigrationError::OperationFailed(format!(
                    "cannot bind tunnel socket {}: {err}",
                    path.display()
                ))
            })?;
            socket_path = Some(path.clone());
            MigrationDestination::Unix { path, listener }
        } else {
            return Err(MigrationError::OperationFailed(
                "source hypervisor is too old to support tunnelled migration".into(),
            ));
        };

        let result = self
            .run(
                domain,
                cookie_in,
                want_cookie,
                flags,
                bandwidth_mib,
                MigrationSpec {
                    dest,
                    forward: MigrationForward::Stream(stream),
                },
                peer,
            )
            .await;

        if let Some(path) = socket_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }
}
