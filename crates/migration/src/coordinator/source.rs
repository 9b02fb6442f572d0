//! Source side: Begin, Perform and Confirm
use super::Coordinator;
use crate::MigrationError;
use crate::domain::{Domain, DomainEventKind, StoppedDetail};
use crate::job::{self, JobDirection, MigrationPhase};
use crate::progress;
use crate::remote::{FinishRequest, PeerDaemon, PeerFeature, PrepareRequest};
use crate::safety;
use crate::storage;
use monitor_sdk::dto::MonitorFeature;
use shared::cookie::CookieFlags;
use shared::def::{self, DomainDef};
use shared::flags::MigrateFlags;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What Begin hands back to the client for the Prepare step
#[derive(Debug, Clone)]
pub struct BeginOutput {
    pub cookie: Vec<u8>,
    /// Guest definition formatted for transmission
    pub def_payload: String,
}

impl Coordinator {
    /// First step of the v3 protocol on the source: safety checks plus the
    /// initial cookie. With CHANGE_PROTECTION the migration job stays held
    /// until Confirm; a dropped client connection then tears it down.
    pub async fn begin(
        &self,
        domain: &Arc<Domain>,
        replacement_payload: Option<&str>,
        dname: Option<&str>,
        flags: MigrateFlags,
        conn_close: Option<CancellationToken>,
    ) -> Result<BeginOutput, MigrationError> {
        {
            let mut inner = domain.lock().await;
            job::start(&mut inner, JobDirection::Out)?;
            if !inner.is_active() && !flags.contains(MigrateFlags::OFFLINE) {
                job::finish(&mut inner);
                return Err(MigrationError::OperationInvalid(
                    "domain is not running".into(),
                ));
            }
        }

        let result = self
            .begin_phase(domain, replacement_payload, dname, flags)
            .await;

        let mut inner = domain.lock().await;
        match result {
            Ok(output) if flags.contains(MigrateFlags::CHANGE_PROTECTION) => {
                // the job survives this API call; watch the connection so a
                // vanished client cannot leak it
                if let Some(token) = conn_close {
                    let watch = job::watch_connection(&self.registry, domain.uuid, token);
                    if let Some(job) = inner.job_mut() {
                        job.set_close_watch(watch);
                    }
                }
                Ok(output)
            }
            Ok(output) => {
                job::finish(&mut inner);
                Ok(output)
            }
            Err(err) => {
                job::finish(&mut inner);
                Err(err)
            }
        }
    }

    pub(crate) async fn begin_phase(
        &self,
        domain: &Arc<Domain>,
        replacement_payload: Option<&str>,
        _dname: Option<&str>,
        flags: MigrateFlags,
    ) -> Result<BeginOutput, MigrationError> {
        Self::validate_offline_flags(flags)?;

        let mut cookie_flags = CookieFlags::LOCKSTATE;
        {
            let mut inner = domain.lock().await;
            if let Some(job) = inner.job_mut()
                && job.direction == JobDirection::Out
            {
                job.set_phase(MigrationPhase::Begin3);
            }

            safety::is_allowed(&inner, true, flags.contains(MigrateFlags::ABORT_ON_ERROR))?;
            if !flags.contains(MigrateFlags::UNSAFE) {
                safety::is_safe(&inner.def)?;
            }

            if flags.wants_storage_copy() {
                let nbd_capable = inner
                    .monitor
                    .as_ref()
                    .is_some_and(|monitor| monitor.supports(MonitorFeature::NbdServer));
                if flags.contains(MigrateFlags::TUNNELLED) {
                    // TODO: support NBD storage copy through the tunnel
                    tracing::warn!("pre-copied storage is not supported for tunnelled migration");
                } else if nbd_capable {
                    cookie_flags |= CookieFlags::NBD;
                    inner.nbd_port = 0;
                }
            }
        }

        let def_payload = {
            let inner = domain.lock().await;
            match replacement_payload {
                Some(payload) => {
                    let replacement = DomainDef::from_payload(payload)?;
                    def::check_abi_stability(&inner.def, &replacement)?;
                    replacement.to_payload()?
                }
                None => inner.def.to_payload()?,
            }
        };

        let cookie = self.bake_cookie(domain, cookie_flags).await?;

        Ok(BeginOutput {
            cookie,
            def_payload,
        })
    }

    /// Perform, both modes: peer-to-peer (we drive the destination daemon)
    /// and direct (the client owns the remote side).
    #[allow(clippy::too_many_arguments)]
    pub async fn perform(
        &self,
        domain: &Arc<Domain>,
        replacement_payload: Option<&str>,
        dconn_uri: Option<&str>,
        uri: Option<&str>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        dname: Option<&str>,
        bandwidth_mib: u64,
        v3proto: bool,
        conn_close: Option<CancellationToken>,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        if flags.intersects(MigrateFlags::TUNNELLED | MigrateFlags::PEER2PEER) {
            if cookie_in.is_some_and(|cookie| !cookie.is_empty()) {
                return Err(MigrationError::OperationInvalid(
                    "received unexpected cookie with P2P migration".into(),
                ));
            }
            return self
                .perform_job(
                    domain,
                    replacement_payload,
                    dconn_uri,
                    uri,
                    None,
                    flags,
                    dname,
                    bandwidth_mib,
                    v3proto,
                )
                .await;
        }

        if dconn_uri.is_some() {
            return Err(MigrationError::Internal(
                "unexpected dconnuri parameter with non-peer2peer migration".into(),
            ));
        }

        if v3proto {
            self.perform_phase(domain, uri, cookie_in, flags, bandwidth_mib, conn_close)
                .await
        } else {
            self.perform_job(
                domain,
                replacement_payload,
                None,
                uri,
                cookie_in,
                flags,
                dname,
                bandwidth_mib,
                v3proto,
            )
            .await
        }
    }

    /// Perform as a self-contained job: peer-to-peer, or the v2 single
    /// step
    #[allow(clippy::too_many_arguments)]
    async fn perform_job(
        &self,
        domain: &Arc<Domain>,
        replacement_payload: Option<&str>,
        dconn_uri: Option<&str>,
        uri: Option<&str>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        dname: Option<&str>,
        bandwidth_mib: u64,
        mut v3proto: bool,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        {
            let mut inner = domain.lock().await;
            job::start(&mut inner, JobDirection::Out)?;
            if !inner.is_active() && !flags.contains(MigrateFlags::OFFLINE) {
                job::finish(&mut inner);
                return Err(MigrationError::OperationInvalid(
                    "domain is not running".into(),
                ));
            }
        }

        let precheck = {
            let inner = domain.lock().await;
            safety::is_allowed(&inner, true, flags.contains(MigrateFlags::ABORT_ON_ERROR))
                .and_then(|_| {
                    if flags.contains(MigrateFlags::UNSAFE) {
                        Ok(())
                    } else {
                        safety::is_safe(&inner.def)
                    }
                })
        };
        if let Err(err) = precheck {
            job::finish(&mut *domain.lock().await);
            return Err(err);
        }

        let resume_wanted = { domain.lock().await.state.is_running() };

        let result: Result<Option<Vec<u8>>, MigrationError> = async {
            if flags.intersects(MigrateFlags::TUNNELLED | MigrateFlags::PEER2PEER) {
                let dconn_uri = dconn_uri.ok_or_else(|| {
                    MigrationError::InvalidArgument(
                        "peer-to-peer migration requires a destination daemon URI".into(),
                    )
                })?;
                self.do_peer2peer(
                    domain,
                    replacement_payload,
                    dconn_uri,
                    uri,
                    flags,
                    dname,
                    bandwidth_mib,
                    &mut v3proto,
                )
                .await?;
                Ok(None)
            } else {
                job::set_phase(domain, MigrationPhase::Perform2).await;
                let uri = uri.ok_or_else(|| {
                    MigrationError::InvalidArgument("migration URI is required".into())
                })?;
                self.do_native_migrate(domain, uri, cookie_in, true, flags, bandwidth_mib, None)
                    .await
            }
        }
        .await;

        let success = result.is_ok();

        // v2 has no Confirm: the source guest dies right here on success
        if success && !v3proto {
            self.process_stop(domain, StoppedDetail::Migrated).await;
        }
        if !success && resume_wanted {
            self.resume_after_failure(domain).await;
        }

        job::finish(&mut *domain.lock().await);
        self.remove_finished_source(domain, success, flags).await;

        result
    }

    /// The perform phase of a client-driven v3 migration
    async fn perform_phase(
        &self,
        domain: &Arc<Domain>,
        uri: Option<&str>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        bandwidth_mib: u64,
        conn_close: Option<CancellationToken>,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        {
            let mut inner = domain.lock().await;
            // without change protection the job was not started at Begin
            if !flags.contains(MigrateFlags::CHANGE_PROTECTION) {
                job::start(&mut inner, JobDirection::Out)?;
            } else {
                job::is_active(&inner, JobDirection::Out)?;
            }
            if let Some(job) = inner.job_mut() {
                job.set_phase(MigrationPhase::Perform3);
                job.clear_close_watch();
            }
        }

        let resume_wanted = { domain.lock().await.state.is_running() };
        let uri = uri.ok_or_else(|| {
            MigrationError::InvalidArgument("migration URI is required".into())
        })?;

        let result = self
            .do_native_migrate(domain, uri, cookie_in, true, flags, bandwidth_mib, None)
            .await;

        match &result {
            Ok(_) => {
                let mut inner = domain.lock().await;
                if let Some(job) = inner.job_mut() {
                    job.set_phase(MigrationPhase::Perform3Done);
                    if let Some(token) = conn_close {
                        let watch = job::watch_connection(&self.registry, domain.uuid, token);
                        job.set_close_watch(watch);
                    }
                }
                // the job continues until Confirm
            }
            Err(_) => {
                if resume_wanted {
                    self.resume_after_failure(domain).await;
                }
                job::finish(&mut *domain.lock().await);
                self.registry.remove_if_inactive(domain).await;
            }
        }

        result
    }

    /// Drive the whole protocol against the destination daemon ourselves
    #[allow(clippy::too_many_arguments)]
    async fn do_peer2peer(
        &self,
        domain: &Arc<Domain>,
        replacement_payload: Option<&str>,
        dconn_uri: &str,
        uri: Option<&str>,
        flags: MigrateFlags,
        dname: Option<&str>,
        bandwidth_mib: u64,
        v3proto: &mut bool,
    ) -> Result<(), MigrationError> {
        // the destination side is completely set up before we touch the
        // source
        let peer = self.connector.connect(dconn_uri).await.map_err(|err| {
            MigrationError::OperationFailed(format!(
                "failed to connect to remote daemon {dconn_uri}: {err}"
            ))
        })?;

        if !peer.supports(PeerFeature::Peer2Peer) {
            return Err(MigrationError::OperationFailed(
                "destination daemon does not support peer-to-peer migration protocol".into(),
            ));
        }

        // regardless of which generation the caller spoke, the wire
        // protocol is picked from what the target supports
        *v3proto = peer.supports(PeerFeature::V3);
        let use_params = *v3proto && peer.supports(PeerFeature::MigrationParams);

        if flags.contains(MigrateFlags::OFFLINE) && !peer.supports(PeerFeature::OfflineMigration) {
            return Err(MigrationError::ArgumentUnsupported(
                "offline migration is not supported by the destination host".into(),
            ));
        }

        // the domain may have died while we talked to the remote daemon
        if !domain.lock().await.is_active() && !flags.contains(MigrateFlags::OFFLINE) {
            return Err(MigrationError::Internal("guest unexpectedly quit".into()));
        }

        // change protection only matters when begin and perform are
        // separate jobs; peer-to-peer is one job, and older destinations
        // would reject the flag
        let flags = flags - MigrateFlags::CHANGE_PROTECTION;

        if *v3proto {
            self.peer2peer3(
                domain,
                &peer,
                replacement_payload,
                dname,
                uri,
                bandwidth_mib,
                use_params,
                flags,
            )
            .await
        } else {
            self.peer2peer2(domain, &peer, flags, dname, bandwidth_mib)
                .await
        }
    }

    /// v2: Prepare / Perform / Finish with a single cookie hop
    async fn peer2peer2(
        &self,
        domain: &Arc<Domain>,
        peer: &Arc<dyn PeerDaemon>,
        flags: MigrateFlags,
        dname: Option<&str>,
        bandwidth_mib: u64,
    ) -> Result<(), MigrationError> {
        let (def_payload, guest_name, paused) = {
            let inner = domain.lock().await;
            (
                inner.def.to_payload()?,
                inner.def.name.clone(),
                inner.state.is_paused(),
            )
        };
        let flags = if paused {
            flags | MigrateFlags::PAUSED
        } else {
            flags
        };
        let destflags = flags - MigrateFlags::ABORT_ON_ERROR;

        let request = PrepareRequest {
            cookie: None,
            uri: None,
            flags: destflags,
            dname: dname.map(str::to_owned),
            bandwidth_mib,
            def_payload,
            v3: false,
        };

        // tunnelled v2 cannot carry cookies: the prepare entry point of
        // that generation has no room for them
        let (reply, stream) = if flags.contains(MigrateFlags::TUNNELLED) {
            let (reply, stream) = peer.prepare_tunnel(request).await?;
            (reply, Some(stream))
        } else {
            (peer.prepare(request).await?, None)
        };

        if !domain.lock().await.is_active() {
            return Err(MigrationError::Internal("guest unexpectedly quit".into()));
        }

        let mut orig_err = None;
        let mut cancelled = true;

        if !flags.contains(MigrateFlags::TUNNELLED) && reply.uri.is_none() {
            orig_err = Some(MigrationError::Internal(
                "prepare did not set the migration URI".into(),
            ));
        } else {
            job::set_phase(domain, MigrationPhase::Perform2).await;
            let performed = if flags.contains(MigrateFlags::TUNNELLED) {
                let stream = stream.expect("prepare_tunnel returned a stream");
                self.do_tunnel_migrate(
                    domain,
                    stream,
                    None,
                    false,
                    flags,
                    bandwidth_mib,
                    Some(peer),
                )
                .await
            } else {
                self.do_native_migrate(
                    domain,
                    reply.uri.as_deref().expect("checked above"),
                    reply.cookie.as_deref(),
                    false,
                    flags,
                    bandwidth_mib,
                    Some(peer),
                )
                .await
            };
            match performed {
                Ok(_) => cancelled = false,
                Err(err) => orig_err = Some(err),
            }
        }

        // the status code travels to the destination so it can clean up
        let finish = peer
            .finish(FinishRequest {
                dname: dname.map(str::to_owned).unwrap_or(guest_name),
                cookie: reply.cookie.clone(),
                flags: destflags,
                cancelled,
                v3: false,
            })
            .await;

        let ddomain = match finish {
            Ok(reply) => reply.domain,
            Err(err) => {
                if orig_err.is_none() {
                    orig_err = Some(err);
                }
                None
            }
        };

        if ddomain.is_some() {
            Ok(())
        } else {
            Err(orig_err.unwrap_or_else(|| {
                MigrationError::OperationFailed(
                    "destination was unable to complete migration".into(),
                )
            }))
        }
    }

    /// v3: Begin / Prepare / Perform / Finish / Confirm, cookies echoed at
    /// every hop
    #[allow(clippy::too_many_arguments)]
    async fn peer2peer3(
        &self,
        domain: &Arc<Domain>,
        peer: &Arc<dyn PeerDaemon>,
        replacement_payload: Option<&str>,
        dname: Option<&str>,
        uri: Option<&str>,
        bandwidth_mib: u64,
        use_params: bool,
        flags: MigrateFlags,
    ) -> Result<(), MigrationError> {
        tracing::debug!(
            use_params,
            tunnelled = flags.contains(MigrateFlags::TUNNELLED),
            "starting 3-phase peer-to-peer protocol"
        );

        let begin = self
            .begin_phase(domain, replacement_payload, dname, flags)
            .await?;

        let (guest_name, paused) = {
            let inner = domain.lock().await;
            (inner.def.name.clone(), inner.state.is_paused())
        };
        let flags = if paused {
            flags | MigrateFlags::PAUSED
        } else {
            flags
        };
        let destflags = flags - MigrateFlags::ABORT_ON_ERROR;

        let request = PrepareRequest {
            cookie: Some(begin.cookie),
            uri: uri.map(str::to_owned),
            flags: destflags,
            dname: dname.map(str::to_owned),
            bandwidth_mib,
            def_payload: begin.def_payload,
            v3: true,
        };
        let (reply, stream) = if flags.contains(MigrateFlags::TUNNELLED) {
            let (reply, stream) = peer.prepare_tunnel(request).await?;
            (reply, Some(stream))
        } else {
            (peer.prepare(request).await?, None)
        };

        let mut orig_err: Option<MigrationError> = None;
        let mut cancelled = true;
        let mut perform_cookie: Option<Vec<u8>> = None;

        if flags.contains(MigrateFlags::OFFLINE) {
            tracing::debug!("offline migration, skipping the perform phase");
            cancelled = false;
        } else {
            let uri_out = reply.uri.clone().or_else(|| uri.map(str::to_owned));
            if !flags.contains(MigrateFlags::TUNNELLED) && uri_out.is_none() {
                orig_err = Some(MigrationError::Internal(
                    "prepare did not set the migration URI".into(),
                ));
            } else {
                // the source stays paused after this step until the
                // destination confirms via Finish
                job::set_phase(domain, MigrationPhase::Perform3).await;
                let performed = if flags.contains(MigrateFlags::TUNNELLED) {
                    let stream = stream.expect("prepare_tunnel returned a stream");
                    self.do_tunnel_migrate(
                        domain,
                        stream,
                        reply.cookie.as_deref(),
                        true,
                        flags,
                        bandwidth_mib,
                        Some(peer),
                    )
                    .await
                } else {
                    self.do_native_migrate(
                        domain,
                        uri_out.as_deref().expect("checked above"),
                        reply.cookie.as_deref(),
                        true,
                        flags,
                        bandwidth_mib,
                        Some(peer),
                    )
                    .await
                };
                match performed {
                    Ok(cookie) => {
                        perform_cookie = cookie;
                        cancelled = false;
                        job::set_phase(domain, MigrationPhase::Perform3Done).await;
                    }
                    Err(err) => orig_err = Some(err),
                }
            }
        }

        let finish = peer
            .finish(FinishRequest {
                dname: dname.map(str::to_owned).unwrap_or(guest_name.clone()),
                cookie: perform_cookie,
                flags: destflags,
                cancelled,
                v3: true,
            })
            .await;

        let (finish_cookie, ddomain) = match finish {
            Ok(reply) => (reply.cookie, reply.domain),
            Err(err) => {
                // there is a small chance the guest actually runs on the
                // destination and only the RPC reply was lost; the lock
                // manager covers that scenario
                if orig_err.is_none() {
                    orig_err = Some(err);
                }
                (None, None)
            }
        };

        // no destination domain: restart the source guest instead of
        // killing it
        let cancelled = ddomain.is_none();
        if let Err(err) = self
            .confirm_phase(domain, finish_cookie.as_deref(), flags, cancelled)
            .await
        {
            tracing::warn!(
                domain = %guest_name,
                "guest probably left in 'paused' state on source: {err}"
            );
        }

        if ddomain.is_some() {
            Ok(())
        } else {
            Err(orig_err.unwrap_or_else(|| {
                MigrationError::OperationFailed(
                    "destination was unable to complete migration".into(),
                )
            }))
        }
    }

    /// Terminal disposition on the source for client-driven v3 protocols.
    ///
    /// Calling this again with `cancelled` after the job already ended is a
    /// no-op, so retrying a failed Perform's rollback is harmless.
    pub async fn confirm(
        &self,
        domain: &Arc<Domain>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        cancelled: bool,
    ) -> Result<(), MigrationError> {
        {
            let mut inner = domain.lock().await;
            if let Err(err) = job::is_active(&inner, JobDirection::Out) {
                if cancelled {
                    tracing::debug!("no active migration job, nothing to undo");
                    return Ok(());
                }
                return Err(err);
            }
            if let Some(job) = inner.job_mut() {
                job.set_phase(if cancelled {
                    MigrationPhase::Confirm3Cancelled
                } else {
                    MigrationPhase::Confirm3
                });
                job.clear_close_watch();
            }
        }

        let result = self.confirm_phase(domain, cookie_in, flags, cancelled).await;

        job::finish(&mut *domain.lock().await);
        self.remove_finished_source(domain, !cancelled && result.is_ok(), flags)
            .await;

        result
    }

    pub(crate) async fn confirm_phase(
        &self,
        domain: &Arc<Domain>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        cancelled: bool,
    ) -> Result<(), MigrationError> {
        job::set_phase(
            domain,
            if cancelled {
                MigrationPhase::Confirm3Cancelled
            } else {
                MigrationPhase::Confirm3
            },
        )
        .await;

        let _cookie = self
            .eat_cookie(domain, cookie_in, CookieFlags::empty())
            .await?;

        if flags.contains(MigrateFlags::OFFLINE) {
            return Ok(());
        }

        if !cancelled {
            // a seamless display is still moving its session; the guest
            // must not die under it
            if let Err(err) = progress::wait_for_display(domain).await {
                tracing::warn!("display handover wait failed: {err}");
            }
            self.process_stop(domain, StoppedDetail::Migrated).await;
        } else {
            storage::cancel_drive_mirror(domain).await;

            let name = { domain.lock().await.def.name.clone() };
            self.start_cpus(domain).await?;
            self.registry.emit(
                domain.uuid,
                &name,
                DomainEventKind::Resumed(crate::domain::ResumedDetail::Migrated),
            );
        }

        Ok(())
    }

    /// Drop a stopped source domain that has no definition left to keep it
    async fn remove_finished_source(
        &self,
        domain: &Arc<Domain>,
        success: bool,
        flags: MigrateFlags,
    ) {
        let mut inner = domain.lock().await;
        if inner.is_active() {
            return;
        }
        if success && flags.contains(MigrateFlags::UNDEFINE_SOURCE) {
            // the definition store drops its record along with ours
            inner.persistent = false;
        }
        if !inner.persistent {
            drop(inner);
            self.registry.remove(domain.uuid);
        }
    }
}
