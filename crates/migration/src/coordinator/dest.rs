//! Destination side: Prepare and Finish
use super::Coordinator;
use crate::MigrationError;
use crate::domain::{
    DefinedDetail, Domain, DomainEventKind, DomainState, PausedReason, ResumedDetail,
    StartedDetail, StoppedDetail, SuspendedDetail,
};
use crate::job::{self, JobDirection, MigrationPhase};
use crate::process::IncomingTransport;
use crate::storage;
use monitor_sdk::dto::MonitorFeature;
use shared::cookie::{Cookie, CookieFlags};
use shared::def::{DomainDef, NetKind};
use shared::flags::MigrateFlags;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// What Prepare hands back to the source
#[derive(Debug, Clone)]
pub struct PrepareOutput {
    pub cookie: Option<Vec<u8>>,
    /// URI the source should point its hypervisor at; only set when the
    /// destination picked or completed it
    pub uri: Option<String>,
}

/// What Finish hands back: the running guest on success plus the cookie
/// the source consumes in Confirm
pub struct FinishOutput {
    pub domain: Option<Arc<Domain>>,
    pub cookie: Option<Vec<u8>>,
}

impl Coordinator {
    /// Parse an incoming definition payload, applying the optional rename.
    /// The original name keeps validating cookies of the renamed guest.
    pub fn prepare_def(
        &self,
        def_payload: &str,
        dname: Option<&str>,
    ) -> Result<(DomainDef, Option<String>), MigrationError> {
        let mut def = DomainDef::from_payload(def_payload)?;
        let orig_name = dname.map(|name| std::mem::replace(&mut def.name, name.to_string()));
        Ok((def, orig_name))
    }

    /// Prepare with a native transport: pick a listen port, launch the
    /// hypervisor in incoming mode and answer with the cookie plus the URI
    /// the source should use.
    pub async fn prepare_direct(
        &self,
        cookie_in: Option<&[u8]>,
        uri_in: Option<&str>,
        def_payload: &str,
        dname: Option<&str>,
        flags: MigrateFlags,
    ) -> Result<PrepareOutput, MigrationError> {
        let (def, orig_name) = self.prepare_def(def_payload, dname)?;

        // either the caller supplied `tcp://host:port`, or we allocate a
        // port from the pool and advertise our own hostname
        let (port, uri_out) = match uri_in {
            None => {
                let port = self.ports.next_migration_port();
                let hostname = &self.identity.hostname;
                if hostname.starts_with("localhost") {
                    return Err(MigrationError::Internal(
                        "hostname on destination resolved to localhost, \
                         but migration requires an FQDN"
                            .into(),
                    ));
                }
                // the shorthand form, which old sources still expect
                (port, Some(format!("tcp:{hostname}:{port}")))
            }
            Some(uri_in) => {
                let parsed = shared::uri::parse_migration_uri(uri_in)
                    .map_err(|err| MigrationError::InvalidArgument(err.to_string()))?;
                match parsed.port {
                    Some(port) => (port, None),
                    None => {
                        let port = self.ports.next_migration_port();
                        (port, Some(format!("{uri_in}:{port}")))
                    }
                }
            }
        };

        if let Some(uri) = &uri_out {
            tracing::debug!(%uri, "generated migration URI");
        }

        let cookie = self
            .prepare_any(cookie_in, def, orig_name, None, port, flags)
            .await?;

        Ok(PrepareOutput {
            cookie,
            uri: uri_out,
        })
    }

    /// Prepare with the migration stream carried over the control
    /// connection; the hypervisor reads it from standard input
    pub async fn prepare_tunnel(
        &self,
        cookie_in: Option<&[u8]>,
        incoming: Box<dyn AsyncRead + Send + Unpin>,
        def_payload: &str,
        dname: Option<&str>,
        flags: MigrateFlags,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        let (def, orig_name) = self.prepare_def(def_payload, dname)?;
        self.prepare_any(cookie_in, def, orig_name, Some(incoming), 0, flags)
            .await
    }

    async fn prepare_any(
        &self,
        cookie_in: Option<&[u8]>,
        def: DomainDef,
        orig_name: Option<String>,
        incoming: Option<Box<dyn AsyncRead + Send + Unpin>>,
        port: u16,
        flags: MigrateFlags,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        Self::validate_offline_flags(flags)?;
        if incoming.is_some() && flags.contains(MigrateFlags::OFFLINE) {
            return Err(MigrationError::OperationInvalid(
                "tunnelled offline migration does not make sense".into(),
            ));
        }
        crate::safety::is_allowed_def(&def)?;

        let domain = self.registry.add_incoming(def, orig_name).await?;

        match self.prepare_incoming(&domain, cookie_in, incoming, port, flags).await {
            Ok(cookie) => Ok(cookie),
            Err(err) => {
                self.prepare_teardown(&domain).await;
                Err(err)
            }
        }
    }

    async fn prepare_incoming(
        &self,
        domain: &Arc<Domain>,
        cookie_in: Option<&[u8]>,
        incoming: Option<Box<dyn AsyncRead + Send + Unpin>>,
        port: u16,
        flags: MigrateFlags,
    ) -> Result<Option<Vec<u8>>, MigrationError> {
        let tunnel = incoming.is_some();
        let cookie = self
            .eat_cookie(
                domain,
                cookie_in,
                CookieFlags::LOCKSTATE | CookieFlags::NBD,
            )
            .await?;

        {
            let mut inner = domain.lock().await;
            job::start(&mut inner, JobDirection::In)?;
            if let Some(job) = inner.job_mut() {
                job.set_phase(MigrationPhase::Prepare);
            }
        }

        let mut listen_addr = None;
        if !flags.contains(MigrateFlags::OFFLINE) {
            let transport = if let Some(mut incoming) = incoming {
                let (mut tx, rx) = tokio::net::unix::pipe::pipe().map_err(|err| {
                    MigrationError::OperationFailed(format!(
                        "cannot create pipe for tunnelled migration: {err}"
                    ))
                })?;
                // the stream drains into the pipe for as long as the
                // source keeps sending
                tokio::spawn(async move {
                    if let Err(err) = tokio::io::copy(&mut incoming, &mut tx).await {
                        tracing::warn!("tunnelled migration stream ended early: {err}");
                    }
                });
                IncomingTransport::Stdio {
                    source: rx.into_blocking_fd()?,
                }
            } else {
                // listen on the IPv6 wildcard when the binary understands
                // it and the host has v6 connectivity
                let listen = if self.process.hypervisor_supports(MonitorFeature::Ipv6Migration)
                    && tokio::net::lookup_host(("::", 0u16)).await.is_ok()
                {
                    "[::]"
                } else {
                    "0.0.0.0"
                };
                listen_addr = Some(listen);
                IncomingTransport::Tcp {
                    listen: listen.to_string(),
                    port,
                }
            };

            let def = { domain.lock().await.def.clone() };
            tracing::debug!(incoming = %transport.uri(), domain = %def.name, "launching hypervisor");
            let monitor = self.process.launch_incoming(&def, transport).await?;
            {
                let mut inner = domain.lock().await;
                inner.monitor = Some(monitor);
                // incoming guests start paused and are torn down with the
                // daemon until Finish succeeds
                inner.state = DomainState::Paused(PausedReason::Migration);
                inner.auto_destroy = true;
            }

            if flags.contains(MigrateFlags::COMPRESSED) {
                self.set_compression(domain, true).await?;
            }

            match &cookie.lockstate {
                Some(lockstate) => {
                    tracing::debug!("received lockstate from source");
                    domain.lock().await.lock_state = lockstate.leases.clone();
                }
                None => tracing::debug!("received no lockstate"),
            }
        }

        let mut cookie_flags = if flags.contains(MigrateFlags::OFFLINE) {
            CookieFlags::empty()
        } else {
            CookieFlags::GRAPHICS
        };

        if cookie.nbd.is_some() && flags.wants_storage_copy() && !tunnel {
            let nbd_capable = {
                domain
                    .lock()
                    .await
                    .monitor
                    .as_ref()
                    .is_some_and(|monitor| monitor.supports(MonitorFeature::NbdServer))
            };
            if nbd_capable {
                storage::start_nbd_server(domain, &self.ports, listen_addr.unwrap_or("0.0.0.0"))
                    .await?;
                cookie_flags |= CookieFlags::NBD;
            }
        }

        // cookie data is non-critical so far; losing it only costs
        // features, not the migration
        let cookie_out = match self.bake_cookie(domain, cookie_flags).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!("unable to encode migration cookie: {err}");
                None
            }
        };

        {
            let mut inner = domain.lock().await;
            inner.prepare_cleanup = true;
        }

        if !flags.contains(MigrateFlags::OFFLINE) {
            let name = { domain.lock().await.def.name.clone() };
            tracing::info!(domain = %name, "incoming migration prepared");
            self.registry.emit(
                domain.uuid,
                &name,
                DomainEventKind::Started(StartedDetail::Migrated),
            );
        }

        // the job stays active until Finish so no other API can touch the
        // half-arrived guest
        Ok(cookie_out)
    }

    /// Undo a failed Prepare: free the NBD port, kill a started process
    /// and drop the half-created domain
    async fn prepare_teardown(&self, domain: &Arc<Domain>) {
        let (nbd_port, launched) = {
            let mut inner = domain.lock().await;
            let port = std::mem::take(&mut inner.nbd_port);
            (port, inner.monitor.is_some())
        };
        self.ports.release_nbd(nbd_port);
        if launched {
            self.process_stop(domain, StoppedDetail::Failed).await;
        }
        job::finish(&mut *domain.lock().await);
        self.registry.remove(domain.uuid);
    }

    /// Terminal disposition on the destination.
    ///
    /// `cancelled` carries the source's verdict about the Perform step; on
    /// success the guest is wired up and resumed, otherwise the empty
    /// process is cleaned away.
    pub async fn finish(
        &self,
        domain: &Arc<Domain>,
        cookie_in: Option<&[u8]>,
        flags: MigrateFlags,
        cancelled: bool,
        v3: bool,
    ) -> Result<FinishOutput, MigrationError> {
        {
            let mut inner = domain.lock().await;
            job::is_active(&inner, JobDirection::In)?;
            if let Some(job) = inner.job_mut() {
                job.set_phase(if v3 {
                    MigrationPhase::Finish3
                } else {
                    MigrationPhase::Finish2
                });
            }
            inner.prepare_cleanup = false;
        }

        let mut cookie_flags = CookieFlags::NETWORK | CookieFlags::NBD;
        if flags.contains(MigrateFlags::PERSIST_DEST) {
            cookie_flags |= CookieFlags::PERSISTENT;
        }

        let result = match self.eat_cookie(domain, cookie_in, cookie_flags).await {
            Ok(cookie) => self.finish_disposition(domain, &cookie, flags, cancelled, v3).await,
            Err(err) => Err(err),
        };

        // the reply cookie carries only our identity; Confirm eats it to
        // learn the migration's final state
        let cookie_out = match self.bake_cookie(domain, CookieFlags::empty()).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!("unable to encode migration cookie: {err}");
                None
            }
        };

        job::finish(&mut *domain.lock().await);
        self.registry.remove_if_inactive(domain).await;

        result.map(|domain| FinishOutput {
            domain,
            cookie: cookie_out,
        })
    }

    async fn finish_disposition(
        &self,
        domain: &Arc<Domain>,
        cookie: &Cookie,
        flags: MigrateFlags,
        cancelled: bool,
        v3: bool,
    ) -> Result<Option<Arc<Domain>>, MigrationError> {
        let offline = flags.contains(MigrateFlags::OFFLINE);
        let name = { domain.lock().await.def.name.clone() };

        if cancelled {
            // the source failed to send all migration data; clean up the
            // empty process
            if !offline {
                self.process_stop(domain, StoppedDetail::Failed).await;
            }
            return Ok(None);
        }

        if !domain.lock().await.is_active() && !offline {
            return Err(MigrationError::Internal("guest unexpectedly quit".into()));
        }

        if !offline {
            if let Err(err) = self.vport_associate(domain).await {
                self.process_stop(domain, StoppedDetail::Failed).await;
                return Err(err);
            }
            if cookie.network.is_some()
                && let Err(err) = self.portdata_relocate(domain, cookie).await
            {
                tracing::warn!("unable to provide network data for relocation: {err}");
            }
        }

        storage::stop_nbd_server(domain, &self.ports, cookie).await;

        if flags.contains(MigrateFlags::PERSIST_DEST) {
            let newly_defined = {
                let mut inner = domain.lock().await;
                let newly_defined = !inner.persistent;
                inner.persistent = true;
                if let Some(persistent) = &cookie.persistent {
                    inner.new_def = Some(persistent.clone());
                }
                newly_defined
            };
            self.registry.emit(
                domain.uuid,
                &name,
                DomainEventKind::Defined(if newly_defined {
                    DefinedDetail::Added
                } else {
                    DefinedDetail::Updated
                }),
            );
        }

        if !flags.contains(MigrateFlags::PAUSED) && !offline {
            if let Err(err) = self.start_cpus(domain).await {
                tracing::error!(domain = %name, "resume operation failed: {err}");
                // in v3 the source can still be restarted during Confirm,
                // so kill the half-landed guest now; in v2 the source is
                // already dead and a paused target is all that is left
                if v3 {
                    self.process_stop(domain, StoppedDetail::Failed).await;
                }
                return Err(err);
            }
        }

        if !offline {
            self.registry.emit(
                domain.uuid,
                &name,
                DomainEventKind::Resumed(ResumedDetail::Migrated),
            );
            let mut inner = domain.lock().await;
            if inner.state.is_paused() {
                inner.state = DomainState::Paused(PausedReason::User);
                drop(inner);
                self.registry.emit(
                    domain.uuid,
                    &name,
                    DomainEventKind::Suspended(SuspendedDetail::Paused),
                );
            }
        }

        // successfully landed; it no longer dies with the daemon
        domain.lock().await.auto_destroy = false;

        Ok(Some(domain.clone()))
    }

    /// Re-associate virtual port profiles of directly attached interfaces
    /// with this host's switch; bindings already made are undone in
    /// reverse order when one of them is refused
    async fn vport_associate(&self, domain: &Arc<Domain>) -> Result<(), MigrationError> {
        let nets: Vec<(Option<String>, String)> = {
            let inner = domain.lock().await;
            inner
                .def
                .nets
                .iter()
                .filter(|net| net.kind == NetKind::Direct)
                .filter_map(|net| {
                    net.vport_type
                        .as_ref()
                        .map(|vport_type| (net.ifname.clone(), vport_type.clone()))
                })
                .collect()
        };

        let mut associated: Vec<(String, String)> = Vec::new();
        for (ifname, vport_type) in nets {
            let Some(ifname) = ifname else {
                self.vport_rollback(&associated, domain.uuid).await;
                return Err(MigrationError::OperationFailed(
                    "port profile association failed: interface has no device name".into(),
                ));
            };
            if let Err(err) = self
                .vports
                .associate(&ifname, &vport_type, domain.uuid)
                .await
            {
                self.vport_rollback(&associated, domain.uuid).await;
                return Err(MigrationError::OperationFailed(format!(
                    "port profile association failed for {ifname}: {err}"
                )));
            }
            tracing::debug!(%ifname, "port profile association succeeded");
            associated.push((ifname, vport_type));
        }
        Ok(())
    }

    /// Best-effort release of profile bindings after a failed association
    async fn vport_rollback(&self, associated: &[(String, String)], guest: uuid::Uuid) {
        for (ifname, vport_type) in associated.iter().rev() {
            if let Err(err) = self.vports.disassociate(ifname, vport_type, guest).await {
                tracing::warn!(%ifname, "unable to disassociate port profile: {err}");
            }
        }
    }

    /// Hand the opaque per-port state carried in the cookie to the local
    /// switch ports
    async fn portdata_relocate(
        &self,
        domain: &Arc<Domain>,
        cookie: &Cookie,
    ) -> Result<(), MigrationError> {
        let Some(network) = &cookie.network else {
            return Ok(());
        };
        let mut inner = domain.lock().await;
        for interface in &network.interfaces {
            let Some(net) = inner.def.nets.get_mut(interface.index) else {
                return Err(MigrationError::OperationFailed(format!(
                    "no interface at index {} for port data relocation",
                    interface.index
                )));
            };
            net.portdata = interface.portdata.clone();
        }
        Ok(())
    }
}
