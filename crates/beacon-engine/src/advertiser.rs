//! UPDATE construction for advertise and withdraw.
//!
//! Both functions are pure: the same target and context always produce the
//! same messages. A target whose prefixes do not fit one UPDATE is split
//! across several, in prefix order, each carrying the full attribute set.

use std::net::{IpAddr, Ipv4Addr};

use beacon_bgp::codec::{self, CodecOptions};
use beacon_bgp::{MAX_MESSAGE_LEN, Message, PathAttribute, UpdateMessage};
use beacon_core::{AddressFamily, PeerSpec, Prefix, SAFI_UNICAST};

use crate::target::Target;

/// Per-peer values every UPDATE toward that peer depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerContext {
    pub local_as: u32,
    pub family: AddressFamily,
    /// Send NEXT_HOP 127.0.0.1 on IPv6 peers.
    pub legacy_next_hop: bool,
}

impl PeerContext {
    pub fn from_spec(spec: &PeerSpec) -> Self {
        Self {
            local_as: spec.local_as,
            family: spec.address_family,
            legacy_next_hop: spec.legacy_next_hop,
        }
    }
}

/// Announce the target's prefixes with its route attributes.
pub fn advertise(target: &Target, ctx: &PeerContext) -> Vec<UpdateMessage> {
    let build = |nlri| advertise_update(target, ctx, nlri);
    split(&target.spec().prefixes, build)
}

/// Withdraw the target's prefixes. Each UPDATE carries MP_UNREACH_NLRI and
/// nothing else.
pub fn withdraw(target: &Target, ctx: &PeerContext) -> Vec<UpdateMessage> {
    let build = |withdrawn| UpdateMessage {
        attributes: vec![PathAttribute::MpUnreachNlri {
            family: ctx.family,
            safi: SAFI_UNICAST,
            withdrawn,
        }],
        ..Default::default()
    };
    split(&target.spec().prefixes, build)
}

fn advertise_update(target: &Target, ctx: &PeerContext, nlri: Vec<Prefix>) -> UpdateMessage {
    let spec = target.spec();
    let mut attributes = vec![
        PathAttribute::Origin(spec.origin),
        PathAttribute::AsPath(vec![ctx.local_as]),
    ];
    if let Some(next_hop) = next_hop_attribute(spec.destination, ctx) {
        attributes.push(PathAttribute::NextHop(next_hop));
    }
    attributes.push(PathAttribute::MultiExitDisc(spec.med));
    attributes.push(PathAttribute::LocalPref(spec.local_pref));
    if !spec.communities.is_empty() {
        attributes.push(PathAttribute::Communities(spec.communities.clone()));
    }
    attributes.push(PathAttribute::MpReachNlri {
        family: ctx.family,
        safi: SAFI_UNICAST,
        next_hop: spec.destination,
        nlri,
    });

    UpdateMessage {
        attributes,
        ..Default::default()
    }
}

/// Pack `prefixes` greedily into UPDATEs built by `build`, each within
/// `MAX_MESSAGE_LEN`. Sizes are measured with 4-octet AS numbers, the larger
/// of the two encodings.
fn split<F>(prefixes: &[Prefix], build: F) -> Vec<UpdateMessage>
where
    F: Fn(Vec<Prefix>) -> UpdateMessage,
{
    let opts = CodecOptions { four_octet_as: true };
    // One spare octet for the MP attribute switching to an extended length.
    let budget = match codec::encode(&Message::Update(build(Vec::new())), opts) {
        Ok(empty) => MAX_MESSAGE_LEN.saturating_sub(empty.len() + 1),
        Err(_) => 0,
    };

    let mut updates = Vec::new();
    let mut chunk = Vec::new();
    let mut used = 0;
    for prefix in prefixes {
        let size = encoded_prefix_len(prefix);
        if !chunk.is_empty() && used + size > budget {
            updates.push(build(std::mem::take(&mut chunk)));
            used = 0;
        }
        chunk.push(*prefix);
        used += size;
    }
    if !chunk.is_empty() || updates.is_empty() {
        updates.push(build(chunk));
    }
    updates
}

/// Length octet plus the significant address octets.
fn encoded_prefix_len(prefix: &Prefix) -> usize {
    1 + usize::from(prefix.prefix_len()).div_ceil(8)
}

/// The classic NEXT_HOP attribute: the destination itself on IPv4 peers,
/// omitted on IPv6 peers unless `legacy_next_hop` asks for 127.0.0.1.
fn next_hop_attribute(destination: IpAddr, ctx: &PeerContext) -> Option<Ipv4Addr> {
    match (ctx.family, destination) {
        (AddressFamily::Ipv4, IpAddr::V4(v4)) => Some(v4),
        (AddressFamily::Ipv6, _) if ctx.legacy_next_hop => Some(Ipv4Addr::LOCALHOST),
        _ => None,
    }
}
