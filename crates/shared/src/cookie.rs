//! Migration cookie document
//!
//! The cookie is the side-channel blob exchanged alongside every step of the
//! migration protocol: a tagged text document, null terminated, rooted at
//! `<qemu-migration>`. Optional sub-records travel iff the matching feature
//! bit is set by the sender; features listed as `<feature name=.../>` are
//! mandatory and must be understood by the recipient.
use crate::def::DomainDef;
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use std::borrow::Cow;
use uuid::Uuid;

bitflags::bitflags! {
    /// Requested / present cookie feature bits
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CookieFlags: u32 {
        const GRAPHICS = 1 << 0;
        const LOCKSTATE = 1 << 1;
        const PERSISTENT = 1 << 2;
        const NETWORK = 1 << 3;
        const NBD = 1 << 4;
    }
}

/// Closed enumeration of cookie features; unknown names on the wire are a
/// protocol error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFeature {
    Graphics,
    Lockstate,
    Persistent,
    Network,
    Nbd,
}

impl CookieFeature {
    pub const ALL: [CookieFeature; 5] = [
        CookieFeature::Graphics,
        CookieFeature::Lockstate,
        CookieFeature::Persistent,
        CookieFeature::Network,
        CookieFeature::Nbd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CookieFeature::Graphics => "graphics",
            CookieFeature::Lockstate => "lockstate",
            CookieFeature::Persistent => "persistent",
            CookieFeature::Network => "network",
            CookieFeature::Nbd => "nbd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn flag(&self) -> CookieFlags {
        match self {
            CookieFeature::Graphics => CookieFlags::GRAPHICS,
            CookieFeature::Lockstate => CookieFlags::LOCKSTATE,
            CookieFeature::Persistent => CookieFlags::PERSISTENT,
            CookieFeature::Network => CookieFlags::NETWORK,
            CookieFeature::Nbd => CookieFlags::NBD,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("Migration cookie was not null terminated")]
    NotTerminated,

    #[error("Malformed migration cookie: {0}")]
    Malformed(String),

    #[error("Missing {0} element in migration data")]
    MissingElement(&'static str),

    #[error("Attempt to migrate guest to the same host {0}")]
    SameHost(String),

    #[error("Incoming cookie data had unexpected UUID {actual} vs {expected}")]
    GuestUuidMismatch { expected: Uuid, actual: Uuid },

    #[error("Unknown migration cookie feature {0}")]
    UnknownFeature(String),

    #[error("Unsupported migration cookie feature {0}")]
    UnsupportedFeature(&'static str),

    #[error("Migration {0} data already present")]
    DuplicateFeature(&'static str),

    #[error("Source host lock driver {source_host} different from target {target}")]
    LockDriverMismatch { source_host: String, target: String },

    #[error("Unable to inquire lock state: {0}")]
    LockInquireFailed(String),

    #[error("Unable to collect graphics migration data: {0}")]
    GraphicsAllocFailed(String),

    #[error("Xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid persistent definition in cookie: {0}")]
    Persistent(#[from] crate::def::DefError),
}

/// Identity of the daemon's own host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub hostname: String,
    pub host_uuid: Uuid,
}

/// Identity of the guest a cookie belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    pub name: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsCookie {
    /// Display protocol name, e.g. `spice`
    pub kind: String,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub listen: String,
    pub tls_subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStateCookie {
    /// Lock manager plugin name; must match on both ends
    pub driver: String,
    /// Opaque lease token, absent when the plugin keeps no state
    pub leases: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCookie {
    /// Position of the interface in the guest definition
    pub index: usize,
    pub vport_type: String,
    /// Opaque per-port state owned by the switch on the source
    pub portdata: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCookie {
    pub interfaces: Vec<InterfaceCookie>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NbdCookie {
    /// Destination NBD server port; zero when not yet allocated
    pub port: u16,
}

/// One direction of the cookie exchange.
///
/// `decode` fills the `remote_*` fields and the sub-records; `encode`
/// serialises the local identity and whichever sub-records carry a set
/// feature bit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    /// Features carried by this cookie
    pub flags: CookieFlags,
    /// Subset of `flags` the recipient is required to understand
    pub mandatory: CookieFlags,
    pub name: String,
    pub uuid: Uuid,
    pub local_hostname: String,
    pub local_host_uuid: Uuid,
    pub remote_hostname: Option<String>,
    pub remote_host_uuid: Option<Uuid>,
    pub graphics: Option<GraphicsCookie>,
    pub lockstate: Option<LockStateCookie>,
    pub persistent: Option<DomainDef>,
    pub network: Option<NetworkCookie>,
    pub nbd: Option<NbdCookie>,
}

impl Cookie {
    pub fn new(guest: &GuestIdentity, local: &LocalIdentity) -> Self {
        Cookie {
            flags: CookieFlags::empty(),
            mandatory: CookieFlags::empty(),
            name: guest.name.clone(),
            uuid: guest.uuid,
            local_hostname: local.hostname.clone(),
            local_host_uuid: local.host_uuid,
            remote_hostname: None,
            remote_host_uuid: None,
            graphics: None,
            lockstate: None,
            persistent: None,
            network: None,
            nbd: None,
        }
    }

    /// Serialise into the null-terminated wire form
    pub fn encode(&self) -> Result<Vec<u8>, CookieError> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Start(BytesStart::new("qemu-migration")))?;

        write_text_element(&mut writer, "name", &self.name)?;
        write_text_element(&mut writer, "uuid", &self.uuid.to_string())?;
        write_text_element(&mut writer, "hostname", &self.local_hostname)?;
        write_text_element(&mut writer, "hostuuid", &self.local_host_uuid.to_string())?;

        for feature in CookieFeature::ALL {
            if self.mandatory.contains(feature.flag()) {
                let mut el = BytesStart::new("feature");
                el.push_attribute(("name", feature.name()));
                writer.write_event(Event::Empty(el))?;
            }
        }

        if self.flags.contains(CookieFlags::GRAPHICS)
            && let Some(graphics) = &self.graphics
        {
            write_graphics(&mut writer, graphics)?;
        }

        if self.flags.contains(CookieFlags::LOCKSTATE)
            && let Some(lockstate) = &self.lockstate
        {
            let mut el = BytesStart::new("lockstate");
            el.push_attribute(("driver", lockstate.driver.as_str()));
            writer.write_event(Event::Start(el))?;
            write_text_element(&mut writer, "leases", lockstate.leases.as_deref().unwrap_or(""))?;
            writer.write_event(Event::End(BytesEnd::new("lockstate")))?;
        }

        if self.flags.contains(CookieFlags::PERSISTENT)
            && let Some(persistent) = &self.persistent
        {
            write_text_element(&mut writer, "domain", &persistent.to_payload()?)?;
        }

        if self.flags.contains(CookieFlags::NETWORK)
            && let Some(network) = &self.network
        {
            write_network(&mut writer, network)?;
        }

        if self.flags.contains(CookieFlags::NBD)
            && let Some(nbd) = &self.nbd
        {
            let mut el = BytesStart::new("nbd");
            if nbd.port != 0 {
                el.push_attribute(("port", nbd.port.to_string().as_str()));
            }
            writer.write_event(Event::Empty(el))?;
        }

        writer.write_event(Event::End(BytesEnd::new("qemu-migration")))?;

        let mut buf = writer.into_inner();
        buf.push(0);
        Ok(buf)
    }

    /// Parse and validate an incoming cookie.
    ///
    /// `requested` is the recipient's feature mask: sub-records outside it
    /// are skipped, and a mandatory feature outside it rejects the cookie.
    pub fn decode(
        bytes: &[u8],
        guest: &GuestIdentity,
        local: &LocalIdentity,
        requested: CookieFlags,
    ) -> Result<Self, CookieError> {
        let Some((0, doc)) = bytes.split_last().map(|(last, rest)| (*last, rest)) else {
            return Err(CookieError::NotTerminated);
        };
        let text = std::str::from_utf8(doc)
            .map_err(|_| CookieError::Malformed("cookie is not valid utf-8".into()))?;

        let mut cookie = Cookie::new(guest, local);
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut name = None;
        let mut uuid = None;
        let mut hostname = None;
        let mut hostuuid = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"qemu-migration" => {}
                    b"name" => name = Some(read_element_text(&mut reader, &e)?),
                    b"uuid" => uuid = Some(read_element_text(&mut reader, &e)?),
                    b"hostname" => hostname = Some(read_element_text(&mut reader, &e)?),
                    b"hostuuid" => hostuuid = Some(read_element_text(&mut reader, &e)?),
                    b"graphics" if requested.contains(CookieFlags::GRAPHICS) => {
                        cookie.graphics = Some(parse_graphics(&mut reader, &e, false)?);
                        cookie.flags |= CookieFlags::GRAPHICS;
                    }
                    b"lockstate" if requested.contains(CookieFlags::LOCKSTATE) => {
                        cookie.lockstate = Some(parse_lockstate(&mut reader, &e)?);
                        cookie.flags |= CookieFlags::LOCKSTATE;
                    }
                    b"domain" if requested.contains(CookieFlags::PERSISTENT) => {
                        let payload = read_element_text(&mut reader, &e)?;
                        cookie.persistent = Some(DomainDef::from_payload(&payload)?);
                        cookie.flags |= CookieFlags::PERSISTENT;
                    }
                    b"network" if requested.contains(CookieFlags::NETWORK) => {
                        cookie.network = Some(parse_network(&mut reader)?);
                        cookie.flags |= CookieFlags::NETWORK;
                    }
                    b"nbd" if requested.contains(CookieFlags::NBD) => {
                        cookie.nbd = Some(parse_nbd(&e)?);
                        cookie.flags |= CookieFlags::NBD;
                        reader.read_to_end(e.name())?;
                    }
                    other => {
                        // present but not requested, or simply unknown
                        let owned = other.to_vec();
                        reader.read_to_end(quick_xml::name::QName(&owned))?;
                    }
                },
                Event::Empty(e) => match e.name().as_ref() {
                    b"feature" => {
                        let feature = require_attr(&e, "name", "feature name")?;
                        let Some(known) = CookieFeature::from_name(&feature) else {
                            return Err(CookieError::UnknownFeature(feature));
                        };
                        if !requested.contains(known.flag()) {
                            return Err(CookieError::UnsupportedFeature(known.name()));
                        }
                        cookie.mandatory |= known.flag();
                        cookie.flags |= known.flag();
                    }
                    b"graphics" if requested.contains(CookieFlags::GRAPHICS) => {
                        cookie.graphics = Some(parse_graphics(&mut reader, &e, true)?);
                        cookie.flags |= CookieFlags::GRAPHICS;
                    }
                    b"nbd" if requested.contains(CookieFlags::NBD) => {
                        cookie.nbd = Some(parse_nbd(&e)?);
                        cookie.flags |= CookieFlags::NBD;
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let name = name.ok_or(CookieError::MissingElement("name"))?;
        if name != cookie.name {
            // Renamed guests legitimately disagree here (dname), so this is
            // only suspicious, not fatal.
            tracing::warn!(
                incoming = %name,
                local = %cookie.name,
                "cookie guest name does not match"
            );
        }

        let uuid = uuid.ok_or(CookieError::MissingElement("uuid"))?;
        let uuid: Uuid = uuid
            .parse()
            .map_err(|_| CookieError::Malformed("malformed uuid element".into()))?;
        if uuid != cookie.uuid {
            return Err(CookieError::GuestUuidMismatch {
                expected: cookie.uuid,
                actual: uuid,
            });
        }

        let hostname = hostname.ok_or(CookieError::MissingElement("hostname"))?;
        if hostname == cookie.local_hostname {
            return Err(CookieError::SameHost(hostname));
        }

        let hostuuid = hostuuid.ok_or(CookieError::MissingElement("hostuuid"))?;
        let hostuuid: Uuid = hostuuid
            .parse()
            .map_err(|_| CookieError::Malformed("malformed hostuuid element".into()))?;
        if hostuuid == cookie.local_host_uuid {
            return Err(CookieError::SameHost(hostname));
        }

        cookie.remote_hostname = Some(hostname);
        cookie.remote_host_uuid = Some(hostuuid);

        Ok(cookie)
    }
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    value: &str,
) -> Result<(), CookieError> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_graphics<W: std::io::Write>(
    writer: &mut Writer<W>,
    graphics: &GraphicsCookie,
) -> Result<(), CookieError> {
    let mut el = BytesStart::new("graphics");
    el.push_attribute(("type", graphics.kind.as_str()));
    el.push_attribute(("port", graphics.port.to_string().as_str()));
    el.push_attribute(("listen", graphics.listen.as_str()));
    if let Some(tls_port) = graphics.tls_port {
        el.push_attribute(("tlsPort", tls_port.to_string().as_str()));
    }

    if let Some(subject) = &graphics.tls_subject {
        writer.write_event(Event::Start(el))?;
        let mut cert = BytesStart::new("cert");
        cert.push_attribute(("info", "subject"));
        cert.push_attribute(("value", subject.as_str()));
        writer.write_event(Event::Empty(cert))?;
        writer.write_event(Event::End(BytesEnd::new("graphics")))?;
    } else {
        writer.write_event(Event::Empty(el))?;
    }
    Ok(())
}

fn write_network<W: std::io::Write>(
    writer: &mut Writer<W>,
    network: &NetworkCookie,
) -> Result<(), CookieError> {
    writer.write_event(Event::Start(BytesStart::new("network")))?;
    for interface in &network.interfaces {
        let mut el = BytesStart::new("interface");
        el.push_attribute(("index", interface.index.to_string().as_str()));
        el.push_attribute(("vporttype", interface.vport_type.as_str()));
        if let Some(portdata) = &interface.portdata {
            writer.write_event(Event::Start(el))?;
            write_text_element(writer, "portdata", portdata)?;
            writer.write_event(Event::End(BytesEnd::new("interface")))?;
        } else {
            writer.write_event(Event::Empty(el))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("network")))?;
    Ok(())
}

fn read_element_text(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<String, CookieError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::End(e) if e.name() == start.name() => break,
            Event::Start(e) => {
                // no known element nests markup here; skip it
                reader.read_to_end(e.name())?;
            }
            Event::Eof => {
                return Err(CookieError::Malformed("unclosed element".into()));
            }
            _ => {}
        }
    }
    Ok(text)
}

fn require_attr(
    el: &BytesStart<'_>,
    attr: &str,
    what: &'static str,
) -> Result<String, CookieError> {
    optional_attr(el, attr)?.ok_or(CookieError::MissingElement(what))
}

fn optional_attr(el: &BytesStart<'_>, attr: &str) -> Result<Option<String>, CookieError> {
    el.try_get_attribute(attr)
        .map_err(quick_xml::Error::from)?
        .map(|a| a.unescape_value().map(Cow::into_owned))
        .transpose()
        .map_err(CookieError::from)
}

fn parse_graphics(
    reader: &mut Reader<&[u8]>,
    el: &BytesStart<'_>,
    empty: bool,
) -> Result<GraphicsCookie, CookieError> {
    let kind = require_attr(el, "type", "graphics type")?;
    let listen = require_attr(el, "listen", "graphics listen")?;
    let port = require_attr(el, "port", "graphics port")?
        .parse()
        .map_err(|_| CookieError::Malformed("malformed graphics port".into()))?;
    let tls_port = optional_attr(el, "tlsPort")?
        .map(|p| p.parse::<u16>())
        .transpose()
        .map_err(|_| CookieError::Malformed("malformed graphics tlsPort".into()))?;

    let mut tls_subject = None;
    if !empty {
        loop {
            match reader.read_event()? {
                Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"cert" => {
                    if optional_attr(&e, "info")?.as_deref() == Some("subject") {
                        tls_subject = optional_attr(&e, "value")?;
                    }
                }
                Event::End(e) if e.name().as_ref() == b"graphics" => break,
                Event::Eof => return Err(CookieError::Malformed("unclosed graphics".into())),
                _ => {}
            }
        }
    }

    Ok(GraphicsCookie {
        kind,
        port,
        tls_port,
        listen,
        tls_subject,
    })
}

fn parse_lockstate(
    reader: &mut Reader<&[u8]>,
    el: &BytesStart<'_>,
) -> Result<LockStateCookie, CookieError> {
    let driver = require_attr(el, "driver", "lock driver name")?;
    let mut leases = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"leases" => {
                let text = read_element_text(reader, &e)?;
                if !text.is_empty() {
                    leases = Some(text);
                }
            }
            Event::End(e) if e.name().as_ref() == b"lockstate" => break,
            Event::Eof => return Err(CookieError::Malformed("unclosed lockstate".into())),
            _ => {}
        }
    }
    Ok(LockStateCookie { driver, leases })
}

fn parse_network(reader: &mut Reader<&[u8]>) -> Result<NetworkCookie, CookieError> {
    let mut network = NetworkCookie::default();
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.name().as_ref() == b"interface" => {
                network.interfaces.push(parse_interface(&e, None)?);
            }
            Event::Start(e) if e.name().as_ref() == b"interface" => {
                let mut portdata = None;
                loop {
                    match reader.read_event()? {
                        Event::Start(inner) if inner.name().as_ref() == b"portdata" => {
                            portdata = Some(read_element_text(reader, &inner)?);
                        }
                        Event::End(inner) if inner.name().as_ref() == b"interface" => break,
                        Event::Eof => {
                            return Err(CookieError::Malformed("unclosed interface".into()));
                        }
                        _ => {}
                    }
                }
                network.interfaces.push(parse_interface(&e, portdata)?);
            }
            Event::End(e) if e.name().as_ref() == b"network" => break,
            Event::Eof => return Err(CookieError::Malformed("unclosed network".into())),
            _ => {}
        }
    }
    Ok(network)
}

fn parse_interface(
    el: &BytesStart<'_>,
    portdata: Option<String>,
) -> Result<InterfaceCookie, CookieError> {
    let index = require_attr(el, "index", "interface index")?
        .parse()
        .map_err(|_| CookieError::Malformed("malformed interface index".into()))?;
    let vport_type = require_attr(el, "vporttype", "interface vporttype")?;
    Ok(InterfaceCookie {
        index,
        vport_type,
        portdata,
    })
}

fn parse_nbd(el: &BytesStart<'_>) -> Result<NbdCookie, CookieError> {
    let port = match optional_attr(el, "port")? {
        Some(port) => port
            .parse()
            .map_err(|_| CookieError::Malformed(format!("malformed nbd port '{port}'")))?,
        None => 0,
    };
    Ok(NbdCookie { port })
}
