//! Typed BGP messages.
//!
//! [`Message`] is the closed set of messages a session can receive. The
//! session loop matches on it exhaustively.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use beacon_core::{AddressFamily, Community, Origin, Prefix, SAFI_UNICAST};

pub const BGP_VERSION: u8 = 4;
pub const HEADER_LEN: usize = 19;
pub const MAX_MESSAGE_LEN: usize = 4096;

/// ASN placed in 2-octet fields when the real ASN does not fit (RFC 6793).
pub const AS_TRANS: u32 = 23456;

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::Open),
            2 => Some(MessageType::Update),
            3 => Some(MessageType::Notification),
            4 => Some(MessageType::Keepalive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    Keepalive,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::Keepalive => MessageType::Keepalive,
        }
    }
}

// ── OPEN ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// RFC 4760 multiprotocol extensions.
    Multiprotocol { afi: u16, safi: u8 },
    /// RFC 6793 4-octet AS number support, carrying the full ASN.
    FourOctetAs(u32),
    Unknown { code: u8, data: Vec<u8> },
}

impl Capability {
    pub const MULTIPROTOCOL: u8 = 1;
    pub const FOUR_OCTET_AS: u8 = 65;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    /// 2-octet "My Autonomous System" field.
    pub my_as: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    /// OPEN for an advertise-only speaker carrying one unicast family.
    pub fn new(local_as: u32, hold_time: u16, router_id: Ipv4Addr, family: AddressFamily) -> Self {
        let my_as = u16::try_from(local_as).unwrap_or(AS_TRANS as u16);
        Self {
            version: BGP_VERSION,
            my_as,
            hold_time,
            router_id,
            capabilities: vec![
                Capability::Multiprotocol {
                    afi: family.afi(),
                    safi: SAFI_UNICAST,
                },
                Capability::FourOctetAs(local_as),
            ],
        }
    }

    /// The sender's real ASN, preferring the 4-octet capability.
    pub fn peer_as(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|cap| match cap {
                Capability::FourOctetAs(asn) => Some(*asn),
                _ => None,
            })
            .unwrap_or(u32::from(self.my_as))
    }

    pub fn supports_four_octet_as(&self) -> bool {
        self.capabilities
            .iter()
            .any(|cap| matches!(cap, Capability::FourOctetAs(_)))
    }

    pub fn supports_family(&self, family: AddressFamily) -> bool {
        self.capabilities.iter().any(|cap| {
            matches!(cap, Capability::Multiprotocol { afi, safi }
                if *afi == family.afi() && *safi == SAFI_UNICAST)
        })
    }
}

// ── UPDATE ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAttribute {
    Origin(Origin),
    /// A single AS_SEQUENCE.
    AsPath(Vec<u32>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    Communities(Vec<Community>),
    MpReachNlri {
        family: AddressFamily,
        safi: u8,
        next_hop: IpAddr,
        nlri: Vec<Prefix>,
    },
    MpUnreachNlri {
        family: AddressFamily,
        safi: u8,
        withdrawn: Vec<Prefix>,
    },
    Unknown {
        flags: u8,
        code: u8,
        data: Vec<u8>,
    },
}

impl PathAttribute {
    pub const FLAG_OPTIONAL: u8 = 0x80;
    pub const FLAG_TRANSITIVE: u8 = 0x40;
    pub const FLAG_PARTIAL: u8 = 0x20;
    pub const FLAG_EXTENDED_LENGTH: u8 = 0x10;

    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MULTI_EXIT_DISC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const COMMUNITIES: u8 = 8;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;

    pub fn type_code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => Self::ORIGIN,
            PathAttribute::AsPath(_) => Self::AS_PATH,
            PathAttribute::NextHop(_) => Self::NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => Self::MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => Self::LOCAL_PREF,
            PathAttribute::Communities(_) => Self::COMMUNITIES,
            PathAttribute::MpReachNlri { .. } => Self::MP_REACH_NLRI,
            PathAttribute::MpUnreachNlri { .. } => Self::MP_UNREACH_NLRI,
            PathAttribute::Unknown { code, .. } => *code,
        }
    }

    /// Flags without the extended-length bit, which the encoder decides.
    pub fn flags(&self) -> u8 {
        match self {
            PathAttribute::Origin(_)
            | PathAttribute::AsPath(_)
            | PathAttribute::NextHop(_)
            | PathAttribute::LocalPref(_) => Self::FLAG_TRANSITIVE,
            PathAttribute::MultiExitDisc(_)
            | PathAttribute::MpReachNlri { .. }
            | PathAttribute::MpUnreachNlri { .. } => Self::FLAG_OPTIONAL,
            PathAttribute::Communities(_) => Self::FLAG_OPTIONAL | Self::FLAG_TRANSITIVE,
            PathAttribute::Unknown { flags, .. } => flags & !Self::FLAG_EXTENDED_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    /// IPv4 withdrawn routes field.
    pub withdrawn: Vec<Prefix>,
    pub attributes: Vec<PathAttribute>,
    /// IPv4 NLRI field.
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn attribute(&self, code: u8) -> Option<&PathAttribute> {
        self.attributes.iter().find(|a| a.type_code() == code)
    }

    /// Every prefix this message makes reachable.
    pub fn announced(&self) -> Vec<Prefix> {
        let mut out = self.nlri.clone();
        for attr in &self.attributes {
            if let PathAttribute::MpReachNlri { nlri, .. } = attr {
                out.extend_from_slice(nlri);
            }
        }
        out
    }

    /// Every prefix this message makes unreachable.
    pub fn withdrawn_prefixes(&self) -> Vec<Prefix> {
        let mut out = self.withdrawn.clone();
        for attr in &self.attributes {
            if let PathAttribute::MpUnreachNlri { withdrawn, .. } = attr {
                out.extend_from_slice(withdrawn);
            }
        }
        out
    }

    pub fn is_withdraw(&self) -> bool {
        self.announced().is_empty() && !self.withdrawn_prefixes().is_empty()
    }
}

// ── NOTIFICATION ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub const MESSAGE_HEADER_ERROR: u8 = 1;
    pub const OPEN_MESSAGE_ERROR: u8 = 2;
    pub const UPDATE_MESSAGE_ERROR: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM_ERROR: u8 = 5;
    pub const CEASE: u8 = 6;

    pub const OPEN_UNSUPPORTED_VERSION: u8 = 1;
    pub const OPEN_BAD_PEER_AS: u8 = 2;
    pub const OPEN_BAD_BGP_IDENTIFIER: u8 = 3;
    pub const OPEN_UNACCEPTABLE_HOLD_TIME: u8 = 6;

    pub const CEASE_ADMINISTRATIVE_SHUTDOWN: u8 = 2;

    pub fn new(code: u8, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn open_error(subcode: u8) -> Self {
        Self::new(Self::OPEN_MESSAGE_ERROR, subcode)
    }

    pub fn hold_timer_expired() -> Self {
        Self::new(Self::HOLD_TIMER_EXPIRED, 0)
    }

    pub fn fsm_error() -> Self {
        Self::new(Self::FSM_ERROR, 0)
    }

    pub fn administrative_shutdown() -> Self {
        Self::new(Self::CEASE, Self::CEASE_ADMINISTRATIVE_SHUTDOWN)
    }
}

impl fmt::Display for NotificationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.code {
            Self::MESSAGE_HEADER_ERROR => "message header error",
            Self::OPEN_MESSAGE_ERROR => "open message error",
            Self::UPDATE_MESSAGE_ERROR => "update message error",
            Self::HOLD_TIMER_EXPIRED => "hold timer expired",
            Self::FSM_ERROR => "finite state machine error",
            Self::CEASE => "cease",
            _ => "unknown error",
        };
        write!(f, "{name} ({}/{})", self.code, self.subcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_uses_as_trans_for_wide_asn() {
        let open = OpenMessage::new(4_200_000_000, 10, Ipv4Addr::new(192, 0, 2, 1), AddressFamily::Ipv6);
        assert_eq!(open.my_as, AS_TRANS as u16);
        assert_eq!(open.peer_as(), 4_200_000_000);
        assert!(open.supports_four_octet_as());
        assert!(open.supports_family(AddressFamily::Ipv6));
        assert!(!open.supports_family(AddressFamily::Ipv4));
    }

    #[test]
    fn peer_as_falls_back_to_two_octet_field() {
        let open = OpenMessage {
            version: 4,
            my_as: 65001,
            hold_time: 90,
            router_id: Ipv4Addr::new(10, 0, 0, 1),
            capabilities: vec![],
        };
        assert_eq!(open.peer_as(), 65001);
        assert!(!open.supports_four_octet_as());
    }

    #[test]
    fn update_collects_prefixes_from_mp_attributes() {
        let p: Prefix = "2001:db8::/48".parse().unwrap();
        let update = UpdateMessage {
            attributes: vec![PathAttribute::MpUnreachNlri {
                family: AddressFamily::Ipv6,
                safi: SAFI_UNICAST,
                withdrawn: vec![p],
            }],
            ..Default::default()
        };
        assert!(update.is_withdraw());
        assert!(update.announced().is_empty());
        assert_eq!(update.withdrawn_prefixes(), vec![p]);
    }

    #[test]
    fn notification_display() {
        let n = NotificationMessage::administrative_shutdown();
        assert_eq!(n.to_string(), "cease (6/2)");
    }
}
