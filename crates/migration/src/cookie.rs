//! Baking and eating of migration cookies
//!
//! The document model and its wire form live in `shared::cookie`; this
//! module binds them to a domain and the driver's services. Bake collects
//! the requested sub-records from local state, eat parses a peer's bytes
//! and enforces the rules that need driver context.
use crate::MigrationError;
use crate::coordinator::DriverConfig;
use crate::domain::{Domain, DomainInner};
use crate::lock::LockManager;
use shared::cookie::{
    Cookie, CookieError, CookieFlags, GraphicsCookie, InterfaceCookie, LocalIdentity,
    LockStateCookie, NbdCookie, NetworkCookie,
};
use shared::def::GraphicsKind;
use std::sync::Arc;

/// Collect the requested features from the domain and serialise.
///
/// Accumulators run in a fixed order and each refuses to run twice on the
/// same cookie.
pub async fn bake(
    domain: &Arc<Domain>,
    local: &LocalIdentity,
    lock_manager: &Arc<dyn LockManager>,
    config: &DriverConfig,
    flags: CookieFlags,
) -> Result<Vec<u8>, MigrationError> {
    let mut inner = domain.lock().await;
    let mut cookie = Cookie::new(&inner.guest_identity(), local);

    if flags.contains(CookieFlags::GRAPHICS) {
        add_graphics(&mut cookie, &inner, config)?;
    }
    if flags.contains(CookieFlags::LOCKSTATE) {
        add_lockstate(&mut cookie, &mut inner, lock_manager).await?;
    }
    if flags.contains(CookieFlags::PERSISTENT) {
        add_persistent(&mut cookie, &inner)?;
    }
    if flags.contains(CookieFlags::NETWORK) {
        add_network(&mut cookie, &inner)?;
    }
    if flags.contains(CookieFlags::NBD) {
        add_nbd(&mut cookie, &inner);
    }

    Ok(cookie.encode()?)
}

/// Parse and validate a peer's cookie against this domain.
///
/// Missing input yields a fresh cookie carrying only the local identity,
/// which keeps the Begin path (no inbound cookie yet) uniform.
pub async fn eat(
    domain: &Arc<Domain>,
    local: &LocalIdentity,
    lock_manager: &Arc<dyn LockManager>,
    bytes: Option<&[u8]>,
    requested: CookieFlags,
) -> Result<Cookie, MigrationError> {
    let identity = { domain.lock().await.guest_identity() };

    let cookie = match bytes {
        Some(bytes) if !bytes.is_empty() => Cookie::decode(bytes, &identity, local, requested)?,
        _ => Cookie::new(&identity, local),
    };

    if cookie.flags.contains(CookieFlags::LOCKSTATE) {
        match &cookie.lockstate {
            Some(lockstate) if lockstate.driver != lock_manager.name() => {
                return Err(CookieError::LockDriverMismatch {
                    source_host: lockstate.driver.clone(),
                    target: lock_manager.name().to_string(),
                }
                .into());
            }
            None if lock_manager.uses_state() => {
                return Err(MigrationError::Internal(format!(
                    "missing {} lock state for migration cookie",
                    lock_manager.name()
                )));
            }
            _ => {}
        }
    }

    Ok(cookie)
}

fn ensure_fresh(cookie: &Cookie, flag: CookieFlags, what: &'static str) -> Result<(), CookieError> {
    if cookie.flags.contains(flag) {
        return Err(CookieError::DuplicateFeature(what));
    }
    Ok(())
}

pub(crate) fn add_graphics(
    cookie: &mut Cookie,
    inner: &DomainInner,
    config: &DriverConfig,
) -> Result<(), CookieError> {
    ensure_fresh(cookie, CookieFlags::GRAPHICS, "graphics")?;

    // only displays that can relocate their clients are recorded
    let Some(graphics) = inner
        .def
        .graphics
        .iter()
        .find(|g| g.kind == GraphicsKind::Spice)
    else {
        return Ok(());
    };

    let tls_subject = if graphics.tls_port.is_some() && config.spice_tls {
        match &config.spice_tls_subject {
            Some(subject) => Some(subject.clone()),
            None => {
                return Err(CookieError::GraphicsAllocFailed(
                    "no x509 certificate subject configured for the TLS display".into(),
                ));
            }
        }
    } else {
        None
    };

    cookie.graphics = Some(GraphicsCookie {
        kind: graphics.kind.as_str().to_string(),
        port: graphics.port,
        tls_port: graphics.tls_port,
        listen: graphics.listen.clone(),
        tls_subject,
    });
    cookie.flags |= CookieFlags::GRAPHICS;
    Ok(())
}

pub(crate) async fn add_lockstate(
    cookie: &mut Cookie,
    inner: &mut DomainInner,
    lock_manager: &Arc<dyn LockManager>,
) -> Result<(), CookieError> {
    ensure_fresh(cookie, CookieFlags::LOCKSTATE, "lockstate")?;

    // a paused guest holds no leases, so the token cached at pause time is
    // the authoritative one
    let leases = if inner.state.is_paused() {
        inner.lock_state.clone()
    } else {
        lock_manager
            .inquire(&inner.def)
            .await
            .map_err(|err| CookieError::LockInquireFailed(err.to_string()))?
    };

    cookie.lockstate = Some(LockStateCookie {
        driver: lock_manager.name().to_string(),
        leases,
    });
    cookie.flags |= CookieFlags::LOCKSTATE;
    cookie.mandatory |= CookieFlags::LOCKSTATE;
    Ok(())
}

pub(crate) fn add_persistent(
    cookie: &mut Cookie,
    inner: &DomainInner,
) -> Result<(), CookieError> {
    ensure_fresh(cookie, CookieFlags::PERSISTENT, "persistent")?;

    let Some(new_def) = &inner.new_def else {
        return Ok(());
    };
    cookie.persistent = Some(new_def.clone());
    cookie.flags |= CookieFlags::PERSISTENT;
    cookie.mandatory |= CookieFlags::PERSISTENT;
    Ok(())
}

pub(crate) fn add_network(cookie: &mut Cookie, inner: &DomainInner) -> Result<(), CookieError> {
    ensure_fresh(cookie, CookieFlags::NETWORK, "network")?;

    if inner.def.nets.is_empty() {
        return Ok(());
    }
    let interfaces = inner
        .def
        .nets
        .iter()
        .enumerate()
        .filter_map(|(index, net)| {
            net.vport_type.as_ref().map(|vport_type| InterfaceCookie {
                index,
                vport_type: vport_type.clone(),
                portdata: net.portdata.clone(),
            })
        })
        .collect();

    cookie.network = Some(NetworkCookie { interfaces });
    cookie.flags |= CookieFlags::NETWORK;
    Ok(())
}

pub(crate) fn add_nbd(cookie: &mut Cookie, inner: &DomainInner) {
    // replacing earlier NBD data is fine; the port shows up only once the
    // destination allocated it
    cookie.nbd = Some(NbdCookie {
        port: inner.nbd_port,
    });
    cookie.flags |= CookieFlags::NBD;
}
