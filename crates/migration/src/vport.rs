//! Virtual port profile manager interface
use crate::MigrationError;
use async_trait::async_trait;
use uuid::Uuid;

/// Switch-side management of virtual port profiles.
///
/// Directly attached interfaces carry a port profile owned by the switch.
/// When a guest lands on a new host every profile must be bound to the
/// local switch before its CPUs start, and unwound again if the landing
/// fails halfway through.
#[async_trait]
pub trait VportManager: Send + Sync {
    /// Bind an interface's port profile to this host's switch
    async fn associate(
        &self,
        ifname: &str,
        vport_type: &str,
        guest: Uuid,
    ) -> Result<(), MigrationError>;

    /// Release a binding made by [`VportManager::associate`]
    async fn disassociate(
        &self,
        ifname: &str,
        vport_type: &str,
        guest: Uuid,
    ) -> Result<(), MigrationError>;
}

/// Default for hosts whose switch keeps no per-port state
#[derive(Debug, Default, Clone, Copy)]
pub struct NopVportManager;

#[async_trait]
impl VportManager for NopVportManager {
    async fn associate(
        &self,
        _ifname: &str,
        _vport_type: &str,
        _guest: Uuid,
    ) -> Result<(), MigrationError> {
        Ok(())
    }

    async fn disassociate(
        &self,
        _ifname: &str,
        _vport_type: &str,
        _guest: Uuid,
    ) -> Result<(), MigrationError> {
        Ok(())
    }
}
