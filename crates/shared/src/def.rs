//! Transportable guest definition
//!
//! The full domain model (devices, firmware, numa topology, ...) belongs to
//! the definition store; migration only looks at the slices reproduced here
//! and ships the whole record opaquely between daemons.
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DefError {
    #[error("Target domain definition differs from source: {0}")]
    AbiMismatch(&'static str),

    #[error("Cannot parse domain definition payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Guest definition as carried across the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDef {
    pub name: String,
    pub uuid: Uuid,
    pub memory_kib: u64,
    pub vcpus: u32,
    #[serde(default)]
    pub disks: Vec<DiskDef>,
    #[serde(default)]
    pub nets: Vec<NetDef>,
    #[serde(default)]
    pub graphics: Vec<GraphicsDef>,
    #[serde(default)]
    pub hostdevs: Vec<HostdevDef>,
}

impl DomainDef {
    /// Serialise for transmission between daemons
    pub fn to_payload(&self) -> Result<String, DefError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, DefError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// First display the guest exposes, if any
    pub fn primary_graphics(&self) -> Option<&GraphicsDef> {
        self.graphics.first()
    }
}

/// Check that a replacement definition describes the same machine.
///
/// A guest cannot change shape mid-flight; only cosmetic properties may
/// differ between the definition used on the source and the one handed to
/// the destination.
pub fn check_abi_stability(current: &DomainDef, replacement: &DomainDef) -> Result<(), DefError> {
    if current.uuid != replacement.uuid {
        return Err(DefError::AbiMismatch("uuid"));
    }
    if current.memory_kib != replacement.memory_kib {
        return Err(DefError::AbiMismatch("memory size"));
    }
    if current.vcpus != replacement.vcpus {
        return Err(DefError::AbiMismatch("vcpu count"));
    }
    if current.disks.len() != replacement.disks.len() {
        return Err(DefError::AbiMismatch("disk count"));
    }
    for (a, b) in current.disks.iter().zip(&replacement.disks) {
        if a.alias != b.alias {
            return Err(DefError::AbiMismatch("disk aliases"));
        }
    }
    if current.nets.len() != replacement.nets.len() {
        return Err(DefError::AbiMismatch("network interface count"));
    }
    if current.hostdevs.len() != replacement.hostdevs.len() {
        return Err(DefError::AbiMismatch("host device count"));
    }
    Ok(())
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDef {
    /// Backend alias, e.g. `ide0-0-0`
    pub alias: String,
    pub source: Option<DiskSource>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub cache: CacheMode,
}

impl DiskDef {
    /// Shared, read-only and source-less disks never take part in a
    /// storage copy
    pub fn is_mirror_candidate(&self) -> bool {
        !self.shared && !self.readonly && self.source.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiskSource {
    File {
        path: String,
        filesystem: FilesystemKind,
    },
    Network {
        protocol: NetworkDiskProtocol,
        path: String,
    },
}

/// Where a file-backed disk image lives, as probed when the disk was
/// attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemKind {
    Local,
    Shared,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkDiskProtocol {
    Rbd,
    Nbd,
    Gluster,
    Iscsi,
    Sheepdog,
}

impl NetworkDiskProtocol {
    /// Protocols whose servers keep both ends coherent without relying on
    /// the host page cache
    pub fn is_self_coherent(&self) -> bool {
        matches!(self, NetworkDiskProtocol::Rbd)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    #[default]
    Default,
    Disabled,
    Writethrough,
    Writeback,
    DirectSync,
    Unsafe,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetDef {
    pub kind: NetKind,
    pub ifname: Option<String>,
    pub mac: Option<String>,
    /// Virtual port profile type, e.g. `openvswitch`
    pub vport_type: Option<String>,
    /// Opaque per-port state owned by the switch
    pub portdata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetKind {
    Bridge,
    Direct,
    User,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsDef {
    pub kind: GraphicsKind,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub listen: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphicsKind {
    Vnc,
    Spice,
}

impl GraphicsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicsKind::Vnc => "vnc",
            GraphicsKind::Spice => "spice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostdevDef {
    pub kind: HostdevKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostdevKind {
    Usb,
    Pci,
    Scsi,
}
