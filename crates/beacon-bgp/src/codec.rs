//! BGP wire encoding (RFC 4271, 4760, 6793, 1997).
//!
//! `encode` produces a complete framed message. `decode` takes one complete
//! frame (header included), as returned by [`crate::read_frame`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

use beacon_core::{AddressFamily, Community, Origin, Prefix};

use crate::error::CodecError;
use crate::message::*;

const MARKER: [u8; 16] = [0xFF; 16];
const AS_SEQUENCE: u8 = 2;
const OPT_PARAM_CAPABILITIES: u8 = 2;

/// Per-session encoding choices fixed during OPEN negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecOptions {
    /// Both speakers advertised the 4-octet AS capability.
    pub four_octet_as: bool,
}

// ── Framing ────────────────────────────────────────────────────────

/// Validate a header and return the total frame length it announces.
pub fn frame_length(header: &[u8]) -> Result<usize, CodecError> {
    if header.len() < HEADER_LEN {
        return Err(CodecError::Truncated("header"));
    }
    if header[..16] != MARKER {
        return Err(CodecError::BadMarker);
    }
    let len = usize::from(u16::from_be_bytes([header[16], header[17]]));
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(CodecError::BadLength(len));
    }
    Ok(len)
}

pub fn encode(message: &Message, opts: CodecOptions) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&MARKER);
    buf.put_u16(0);
    buf.put_u8(message.message_type() as u8);

    match message {
        Message::Open(open) => encode_open(open, &mut buf)?,
        Message::Update(update) => encode_update(update, opts, &mut buf)?,
        Message::Notification(n) => {
            buf.put_u8(n.code);
            buf.put_u8(n.subcode);
            buf.put_slice(&n.data);
        }
        Message::Keepalive => {}
    }

    let len = buf.len();
    if len > MAX_MESSAGE_LEN {
        return Err(CodecError::TooLong(len));
    }
    buf[16..18].copy_from_slice(&(len as u16).to_be_bytes());
    Ok(buf.freeze())
}

pub fn decode(frame: &[u8], opts: CodecOptions) -> Result<Message, CodecError> {
    let len = frame_length(frame)?;
    if frame.len() != len {
        return Err(CodecError::BadLength(frame.len()));
    }
    let mut body = &frame[HEADER_LEN..];

    match MessageType::from_code(frame[18]) {
        Some(MessageType::Open) => Ok(Message::Open(decode_open(&mut body)?)),
        Some(MessageType::Update) => Ok(Message::Update(decode_update(&mut body, opts)?)),
        Some(MessageType::Notification) => {
            let code = get_u8(&mut body, "notification")?;
            let subcode = get_u8(&mut body, "notification")?;
            Ok(Message::Notification(NotificationMessage {
                code,
                subcode,
                data: body.to_vec(),
            }))
        }
        Some(MessageType::Keepalive) => {
            if !body.is_empty() {
                return Err(CodecError::BadLength(len));
            }
            Ok(Message::Keepalive)
        }
        None => Err(CodecError::UnknownType(frame[18])),
    }
}

// ── OPEN ───────────────────────────────────────────────────────────

fn encode_open(open: &OpenMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_u8(open.version);
    buf.put_u16(open.my_as);
    buf.put_u16(open.hold_time);
    buf.put_slice(&open.router_id.octets());

    let mut caps = BytesMut::new();
    for cap in &open.capabilities {
        match cap {
            Capability::Multiprotocol { afi, safi } => {
                caps.put_u8(Capability::MULTIPROTOCOL);
                caps.put_u8(4);
                caps.put_u16(*afi);
                caps.put_u8(0);
                caps.put_u8(*safi);
            }
            Capability::FourOctetAs(asn) => {
                caps.put_u8(Capability::FOUR_OCTET_AS);
                caps.put_u8(4);
                caps.put_u32(*asn);
            }
            Capability::Unknown { code, data } => {
                let len = u8::try_from(data.len()).map_err(|_| malformed("capability", "too long"))?;
                caps.put_u8(*code);
                caps.put_u8(len);
                caps.put_slice(data);
            }
        }
    }

    if caps.is_empty() {
        buf.put_u8(0);
    } else {
        let caps_len =
            u8::try_from(caps.len()).map_err(|_| malformed("open", "capabilities too long"))?;
        buf.put_u8(caps_len + 2);
        buf.put_u8(OPT_PARAM_CAPABILITIES);
        buf.put_u8(caps_len);
        buf.put_slice(&caps);
    }
    Ok(())
}

fn decode_open(body: &mut &[u8]) -> Result<OpenMessage, CodecError> {
    let version = get_u8(body, "open")?;
    let my_as = get_u16(body, "open")?;
    let hold_time = get_u16(body, "open")?;
    let router_id = Ipv4Addr::from(get_u32(body, "open")?);
    let params_len = usize::from(get_u8(body, "open")?);
    let mut params = take(body, params_len, "open parameters")?;
    if !body.is_empty() {
        return Err(malformed("open", "trailing bytes after parameters"));
    }

    let mut capabilities = Vec::new();
    while !params.is_empty() {
        let param_type = get_u8(&mut params, "open parameter")?;
        let param_len = usize::from(get_u8(&mut params, "open parameter")?);
        let mut value = take(&mut params, param_len, "open parameter")?;
        if param_type != OPT_PARAM_CAPABILITIES {
            continue;
        }
        while !value.is_empty() {
            let code = get_u8(&mut value, "capability")?;
            let len = usize::from(get_u8(&mut value, "capability")?);
            let mut data = take(&mut value, len, "capability")?;
            let cap = match (code, len) {
                (Capability::MULTIPROTOCOL, 4) => {
                    let afi = get_u16(&mut data, "capability")?;
                    let _reserved = get_u8(&mut data, "capability")?;
                    let safi = get_u8(&mut data, "capability")?;
                    Capability::Multiprotocol { afi, safi }
                }
                (Capability::FOUR_OCTET_AS, 4) => {
                    Capability::FourOctetAs(get_u32(&mut data, "capability")?)
                }
                _ => Capability::Unknown {
                    code,
                    data: data.to_vec(),
                },
            };
            capabilities.push(cap);
        }
    }

    Ok(OpenMessage {
        version,
        my_as,
        hold_time,
        router_id,
        capabilities,
    })
}

// ── UPDATE ─────────────────────────────────────────────────────────

fn encode_update(
    update: &UpdateMessage,
    opts: CodecOptions,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    let mut withdrawn = BytesMut::new();
    for prefix in &update.withdrawn {
        encode_prefix(prefix, &mut withdrawn);
    }
    let mut attrs = BytesMut::new();
    for attr in &update.attributes {
        encode_attribute(attr, opts, &mut attrs)?;
    }

    let withdrawn_len =
        u16::try_from(withdrawn.len()).map_err(|_| CodecError::TooLong(withdrawn.len()))?;
    let attrs_len = u16::try_from(attrs.len()).map_err(|_| CodecError::TooLong(attrs.len()))?;

    buf.put_u16(withdrawn_len);
    buf.put_slice(&withdrawn);
    buf.put_u16(attrs_len);
    buf.put_slice(&attrs);
    for prefix in &update.nlri {
        encode_prefix(prefix, buf);
    }
    Ok(())
}

fn encode_attribute(
    attr: &PathAttribute,
    opts: CodecOptions,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    let mut value = BytesMut::new();
    match attr {
        PathAttribute::Origin(origin) => value.put_u8(origin.code()),
        PathAttribute::AsPath(path) => {
            for segment in path.chunks(usize::from(u8::MAX)) {
                value.put_u8(AS_SEQUENCE);
                value.put_u8(segment.len() as u8);
                for asn in segment {
                    if opts.four_octet_as {
                        value.put_u32(*asn);
                    } else {
                        value.put_u16(u16::try_from(*asn).unwrap_or(AS_TRANS as u16));
                    }
                }
            }
        }
        PathAttribute::NextHop(addr) => value.put_slice(&addr.octets()),
        PathAttribute::MultiExitDisc(v) | PathAttribute::LocalPref(v) => value.put_u32(*v),
        PathAttribute::Communities(list) => {
            for community in list {
                value.put_u32(community.0);
            }
        }
        PathAttribute::MpReachNlri {
            family,
            safi,
            next_hop,
            nlri,
        } => {
            value.put_u16(family.afi());
            value.put_u8(*safi);
            match next_hop {
                IpAddr::V4(v4) => {
                    value.put_u8(4);
                    value.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    value.put_u8(16);
                    value.put_slice(&v6.octets());
                }
            }
            value.put_u8(0);
            for prefix in nlri {
                encode_prefix(prefix, &mut value);
            }
        }
        PathAttribute::MpUnreachNlri {
            family,
            safi,
            withdrawn,
        } => {
            value.put_u16(family.afi());
            value.put_u8(*safi);
            for prefix in withdrawn {
                encode_prefix(prefix, &mut value);
            }
        }
        PathAttribute::Unknown { data, .. } => value.put_slice(data),
    }

    let mut flags = attr.flags();
    if value.len() > usize::from(u8::MAX) {
        flags |= PathAttribute::FLAG_EXTENDED_LENGTH;
    }
    buf.put_u8(flags);
    buf.put_u8(attr.type_code());
    if flags & PathAttribute::FLAG_EXTENDED_LENGTH != 0 {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::TooLong(value.len()))?;
        buf.put_u16(len);
    } else {
        buf.put_u8(value.len() as u8);
    }
    buf.put_slice(&value);
    Ok(())
}

fn decode_update(body: &mut &[u8], opts: CodecOptions) -> Result<UpdateMessage, CodecError> {
    let withdrawn_len = usize::from(get_u16(body, "update")?);
    let mut withdrawn_bytes = take(body, withdrawn_len, "withdrawn routes")?;
    let withdrawn = decode_prefixes(&mut withdrawn_bytes, AddressFamily::Ipv4)?;

    let attrs_len = usize::from(get_u16(body, "update")?);
    let mut attr_bytes = take(body, attrs_len, "path attributes")?;
    let mut attributes = Vec::new();
    while !attr_bytes.is_empty() {
        attributes.push(decode_attribute(&mut attr_bytes, opts)?);
    }

    let nlri = decode_prefixes(body, AddressFamily::Ipv4)?;
    Ok(UpdateMessage {
        withdrawn,
        attributes,
        nlri,
    })
}

fn decode_attribute(buf: &mut &[u8], opts: CodecOptions) -> Result<PathAttribute, CodecError> {
    let flags = get_u8(buf, "attribute")?;
    let code = get_u8(buf, "attribute")?;
    let len = if flags & PathAttribute::FLAG_EXTENDED_LENGTH != 0 {
        usize::from(get_u16(buf, "attribute")?)
    } else {
        usize::from(get_u8(buf, "attribute")?)
    };
    let mut value = take(buf, len, "attribute value")?;

    let attr = match code {
        PathAttribute::ORIGIN => {
            let raw = get_u8(&mut value, "origin")?;
            let origin = Origin::from_code(raw)
                .ok_or_else(|| malformed("origin", format!("unknown code {raw}")))?;
            PathAttribute::Origin(origin)
        }
        PathAttribute::AS_PATH => {
            let mut path = Vec::new();
            while !value.is_empty() {
                let _segment_type = get_u8(&mut value, "as path")?;
                let count = get_u8(&mut value, "as path")?;
                for _ in 0..count {
                    let asn = if opts.four_octet_as {
                        get_u32(&mut value, "as path")?
                    } else {
                        u32::from(get_u16(&mut value, "as path")?)
                    };
                    path.push(asn);
                }
            }
            PathAttribute::AsPath(path)
        }
        PathAttribute::NEXT_HOP => {
            PathAttribute::NextHop(Ipv4Addr::from(get_u32(&mut value, "next hop")?))
        }
        PathAttribute::MULTI_EXIT_DISC => {
            PathAttribute::MultiExitDisc(get_u32(&mut value, "med")?)
        }
        PathAttribute::LOCAL_PREF => PathAttribute::LocalPref(get_u32(&mut value, "local pref")?),
        PathAttribute::COMMUNITIES => {
            if value.len() % 4 != 0 {
                return Err(malformed("communities", "length not a multiple of 4"));
            }
            let mut list = Vec::with_capacity(value.len() / 4);
            while !value.is_empty() {
                list.push(Community(get_u32(&mut value, "communities")?));
            }
            PathAttribute::Communities(list)
        }
        PathAttribute::MP_REACH_NLRI | PathAttribute::MP_UNREACH_NLRI => {
            let raw = value;
            match decode_mp_attribute(code, &mut value)? {
                Some(attr) => attr,
                None => PathAttribute::Unknown {
                    flags,
                    code,
                    data: raw.to_vec(),
                },
            }
        }
        _ => PathAttribute::Unknown {
            flags,
            code,
            data: value.to_vec(),
        },
    };
    Ok(attr)
}

/// Returns `None` for address families this speaker does not understand.
fn decode_mp_attribute(code: u8, value: &mut &[u8]) -> Result<Option<PathAttribute>, CodecError> {
    let afi = get_u16(value, "mp attribute")?;
    let safi = get_u8(value, "mp attribute")?;
    let family = match afi {
        1 => AddressFamily::Ipv4,
        2 => AddressFamily::Ipv6,
        _ => return Ok(None),
    };

    if code == PathAttribute::MP_UNREACH_NLRI {
        let withdrawn = decode_prefixes(value, family)?;
        return Ok(Some(PathAttribute::MpUnreachNlri {
            family,
            safi,
            withdrawn,
        }));
    }

    let nh_len = usize::from(get_u8(value, "mp next hop")?);
    let nh = take(value, nh_len, "mp next hop")?;
    let next_hop = match (family, nh_len) {
        (AddressFamily::Ipv4, 4) => IpAddr::V4(Ipv4Addr::new(nh[0], nh[1], nh[2], nh[3])),
        // Global address, optionally followed by a link-local one.
        (AddressFamily::Ipv6, 16 | 32) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&nh[..16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(malformed(
                "mp next hop",
                format!("length {nh_len} invalid for {family}"),
            ));
        }
    };
    let _reserved = get_u8(value, "mp attribute")?;
    let nlri = decode_prefixes(value, family)?;
    Ok(Some(PathAttribute::MpReachNlri {
        family,
        safi,
        next_hop,
        nlri,
    }))
}

// ── NLRI ───────────────────────────────────────────────────────────

fn encode_prefix(prefix: &Prefix, buf: &mut BytesMut) {
    buf.put_u8(prefix.prefix_len());
    buf.put_slice(&prefix.significant_octets());
}

fn decode_prefixes(buf: &mut &[u8], family: AddressFamily) -> Result<Vec<Prefix>, CodecError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let len = get_u8(buf, "prefix")?;
        let octets = take(buf, usize::from(len).div_ceil(8), "prefix")?;
        let addr = match family {
            AddressFamily::Ipv4 => {
                let mut full = [0u8; 4];
                if octets.len() > full.len() {
                    return Err(malformed("prefix", format!("length {len} too long")));
                }
                full[..octets.len()].copy_from_slice(octets);
                IpAddr::V4(Ipv4Addr::from(full))
            }
            AddressFamily::Ipv6 => {
                let mut full = [0u8; 16];
                if octets.len() > full.len() {
                    return Err(malformed("prefix", format!("length {len} too long")));
                }
                full[..octets.len()].copy_from_slice(octets);
                IpAddr::V6(Ipv6Addr::from(full))
            }
        };
        let prefix = Prefix::new(addr, len).map_err(|e| malformed("prefix", e.to_string()))?;
        out.push(prefix);
    }
    Ok(out)
}

// ── Byte helpers ───────────────────────────────────────────────────

fn malformed(what: &'static str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        what,
        reason: reason.into(),
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated(what));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, CodecError> {
    Ok(take(buf, 1, what)?[0])
}

fn get_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, CodecError> {
    let b = take(buf, 2, what)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, CodecError> {
    let b = take(buf, 4, what)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
