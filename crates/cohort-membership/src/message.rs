//! Messages exchanged between cluster nodes and their binary encoding.
//!
//! The encoding is compact and little-endian. It is private to the
//! shipped transports; other transports may carry [`ClusterMessage`]
//! values however they like.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::UniqueAddress;
use crate::gossip::{Gossip, GossipOverview};
use crate::member::{Member, MemberStatus};
use crate::reachability::{ObserverRow, Reachability, ReachabilityStatus};
use crate::vclock::VectorClock;

/// Upper bound for any encoded collection (members, clock entries, roles).
/// Prevents allocation bombs from crafted messages.
pub(crate) const MAX_COLLECTION_COUNT: usize = 1024;

/// Upper bound for a role name in bytes.
pub(crate) const MAX_STRING_LEN: usize = 256;

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u32_le(buf: &mut &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_u32_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64_le())
}

fn get_count(buf: &mut &[u8], what: &str) -> io::Result<usize> {
    let count = safe_get_u16_le(buf)? as usize;
    if count > MAX_COLLECTION_COUNT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{what} count {count} exceeds limit"),
        ));
    }
    Ok(count)
}

/// Writes a collection length, refusing to encode what the decoder would
/// reject.
fn put_count(buf: &mut BytesMut, count: usize, what: &str) -> io::Result<()> {
    if count > MAX_COLLECTION_COUNT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} count {count} exceeds limit"),
        ));
    }
    buf.put_u16_le(count as u16);
    Ok(())
}

/// A message between two cluster nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Request to be added to the cluster.
    Join {
        node: UniqueAddress,
        roles: BTreeSet<String>,
    },

    /// Answer to a join, carrying the contact node's state.
    Welcome { from: UniqueAddress, gossip: Gossip },

    /// A full gossip snapshot.
    Gossip {
        from: UniqueAddress,
        /// Intended recipient. Lets a restarted node ignore gossip that was
        /// meant for its previous incarnation.
        to: UniqueAddress,
        gossip: Gossip,
        /// True when this answers another gossip; replies are never
        /// answered themselves.
        reply: bool,
    },

    /// Liveness probe for the failure detector.
    Heartbeat { from: UniqueAddress, seq: u64 },

    /// Answer to a heartbeat.
    HeartbeatRsp { from: UniqueAddress, seq: u64 },
}

impl ClusterMessage {
    /// The unique address of the sending node.
    pub fn sender(&self) -> UniqueAddress {
        match self {
            ClusterMessage::Join { node, .. } => *node,
            ClusterMessage::Welcome { from, .. }
            | ClusterMessage::Gossip { from, .. }
            | ClusterMessage::Heartbeat { from, .. }
            | ClusterMessage::HeartbeatRsp { from, .. } => *from,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterMessage::Join { .. } => "join",
            ClusterMessage::Welcome { .. } => "welcome",
            ClusterMessage::Gossip { .. } => "gossip",
            ClusterMessage::Heartbeat { .. } => "heartbeat",
            ClusterMessage::HeartbeatRsp { .. } => "heartbeat-rsp",
        }
    }
}

const MSG_JOIN: u8 = 1;
const MSG_WELCOME: u8 = 2;
const MSG_GOSSIP: u8 = 3;
const MSG_HEARTBEAT: u8 = 4;
const MSG_HEARTBEAT_RSP: u8 = 5;

impl ClusterMessage {
    /// Serializes the message to bytes.
    ///
    /// Fails when a role name or a collection exceeds the codec limits.
    pub fn encode(&self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Serializes the message into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) -> io::Result<()> {
        match self {
            ClusterMessage::Join { node, roles } => {
                buf.put_u8(MSG_JOIN);
                encode_unique_address(buf, node);
                encode_roles(buf, roles)?;
            }
            ClusterMessage::Welcome { from, gossip } => {
                buf.put_u8(MSG_WELCOME);
                encode_unique_address(buf, from);
                encode_gossip(buf, gossip)?;
            }
            ClusterMessage::Gossip {
                from,
                to,
                gossip,
                reply,
            } => {
                buf.put_u8(MSG_GOSSIP);
                encode_unique_address(buf, from);
                encode_unique_address(buf, to);
                buf.put_u8(u8::from(*reply));
                encode_gossip(buf, gossip)?;
            }
            ClusterMessage::Heartbeat { from, seq } => {
                buf.put_u8(MSG_HEARTBEAT);
                encode_unique_address(buf, from);
                buf.put_u64_le(*seq);
            }
            ClusterMessage::HeartbeatRsp { from, seq } => {
                buf.put_u8(MSG_HEARTBEAT_RSP);
                encode_unique_address(buf, from);
                buf.put_u64_le(*seq);
            }
        }
        Ok(())
    }

    /// Deserializes a message from bytes.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty message",
            ));
        }

        let msg_type = safe_get_u8(&mut buf)?;
        let msg = match msg_type {
            MSG_JOIN => {
                let node = decode_unique_address(&mut buf)?;
                let roles = decode_roles(&mut buf)?;
                ClusterMessage::Join { node, roles }
            }
            MSG_WELCOME => {
                let from = decode_unique_address(&mut buf)?;
                let gossip = decode_gossip(&mut buf)?;
                ClusterMessage::Welcome { from, gossip }
            }
            MSG_GOSSIP => {
                let from = decode_unique_address(&mut buf)?;
                let to = decode_unique_address(&mut buf)?;
                let reply = safe_get_u8(&mut buf)? != 0;
                let gossip = decode_gossip(&mut buf)?;
                ClusterMessage::Gossip {
                    from,
                    to,
                    gossip,
                    reply,
                }
            }
            MSG_HEARTBEAT => {
                let from = decode_unique_address(&mut buf)?;
                let seq = safe_get_u64_le(&mut buf)?;
                ClusterMessage::Heartbeat { from, seq }
            }
            MSG_HEARTBEAT_RSP => {
                let from = decode_unique_address(&mut buf)?;
                let seq = safe_get_u64_le(&mut buf)?;
                ClusterMessage::HeartbeatRsp { from, seq }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type: {other}"),
                ))
            }
        };

        if !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after {}", buf.len(), msg.name()),
            ));
        }
        Ok(msg)
    }
}

fn encode_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16_le(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16_le(v6.port());
        }
    }
}

fn decode_socket_addr(buf: &mut &[u8]) -> io::Result<SocketAddr> {
    let addr_type = safe_get_u8(buf)?;
    match addr_type {
        4 => {
            if buf.len() < 6 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv4 address",
                ));
            }
            let mut octets = [0u8; 4];
            buf.read_exact(&mut octets)?;
            let port = buf.get_u16_le();
            Ok(SocketAddr::from((octets, port)))
        }
        6 => {
            if buf.len() < 18 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv6 address",
                ));
            }
            let mut octets = [0u8; 16];
            buf.read_exact(&mut octets)?;
            let port = buf.get_u16_le();
            Ok(SocketAddr::from((octets, port)))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown address type: {other}"),
        )),
    }
}

fn encode_unique_address(buf: &mut BytesMut, node: &UniqueAddress) {
    encode_socket_addr(buf, &node.address);
    buf.put_u64_le(node.uid);
}

fn decode_unique_address(buf: &mut &[u8]) -> io::Result<UniqueAddress> {
    let address = decode_socket_addr(buf)?;
    let uid = safe_get_u64_le(buf)?;
    Ok(UniqueAddress::new(address, uid))
}

fn encode_roles(buf: &mut BytesMut, roles: &BTreeSet<String>) -> io::Result<()> {
    put_count(buf, roles.len(), "role")?;
    for role in roles {
        let bytes = role.as_bytes();
        if bytes.len() > MAX_STRING_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("role name length {} exceeds limit", bytes.len()),
            ));
        }
        buf.put_u16_le(bytes.len() as u16);
        buf.put_slice(bytes);
    }
    Ok(())
}

fn decode_roles(buf: &mut &[u8]) -> io::Result<BTreeSet<String>> {
    let count = get_count(buf, "role")?;
    let mut roles = BTreeSet::new();
    for _ in 0..count {
        let len = safe_get_u16_le(buf)? as usize;
        if len > MAX_STRING_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("role name length {len} exceeds limit"),
            ));
        }
        if buf.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough bytes for role name",
            ));
        }
        let mut raw = vec![0u8; len];
        buf.read_exact(&mut raw)?;
        let role = String::from_utf8(raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "role name is not utf-8"))?;
        roles.insert(role);
    }
    Ok(roles)
}

fn status_to_u8(status: MemberStatus) -> u8 {
    match status {
        MemberStatus::Joining => 0,
        MemberStatus::WeaklyUp => 1,
        MemberStatus::Up => 2,
        MemberStatus::Leaving => 3,
        MemberStatus::Exiting => 4,
        MemberStatus::Down => 5,
        MemberStatus::Removed => 6,
    }
}

fn status_from_u8(raw: u8) -> io::Result<MemberStatus> {
    MemberStatus::ALL
        .get(raw as usize)
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown member status: {raw}")))
}

fn encode_member(buf: &mut BytesMut, member: &Member) -> io::Result<()> {
    encode_unique_address(buf, &member.unique_address);
    buf.put_u8(status_to_u8(member.status));
    buf.put_u32_le(member.up_number);
    encode_roles(buf, &member.roles)
}

fn decode_member(buf: &mut &[u8]) -> io::Result<Member> {
    let unique_address = decode_unique_address(buf)?;
    let status = status_from_u8(safe_get_u8(buf)?)?;
    let up_number = safe_get_u32_le(buf)?;
    let roles = decode_roles(buf)?;
    Ok(Member {
        unique_address,
        status,
        roles,
        up_number,
    })
}

/// Writes `(node, counter)` pairs, shared by the clock and the tombstones.
fn encode_counters<'a>(
    buf: &mut BytesMut,
    entries: impl ExactSizeIterator<Item = (&'a UniqueAddress, &'a u64)>,
    what: &str,
) -> io::Result<()> {
    put_count(buf, entries.len(), what)?;
    for (node, value) in entries {
        encode_unique_address(buf, node);
        buf.put_u64_le(*value);
    }
    Ok(())
}

fn decode_counters(buf: &mut &[u8], what: &str) -> io::Result<Vec<(UniqueAddress, u64)>> {
    let count = get_count(buf, what)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let node = decode_unique_address(buf)?;
        let value = safe_get_u64_le(buf)?;
        entries.push((node, value));
    }
    Ok(entries)
}

fn encode_gossip(buf: &mut BytesMut, gossip: &Gossip) -> io::Result<()> {
    let members: Vec<&Member> = gossip.members().collect();
    put_count(buf, members.len(), "member")?;
    for member in members {
        encode_member(buf, member)?;
    }

    let version: Vec<_> = gossip.version().iter().collect();
    encode_counters(buf, version.into_iter(), "clock entry")?;
    encode_counters(buf, gossip.tombstones().iter(), "tombstone")?;

    let seen = gossip.seen();
    put_count(buf, seen.len(), "seen")?;
    for node in seen {
        encode_unique_address(buf, node);
    }

    let rows: Vec<_> = gossip.reachability().rows().collect();
    put_count(buf, rows.len(), "reachability row")?;
    for (observer, row) in rows {
        encode_unique_address(buf, observer);
        buf.put_u64_le(row.version);
        put_count(buf, row.subjects.len(), "reachability subject")?;
        for (subject, status) in &row.subjects {
            encode_unique_address(buf, subject);
            buf.put_u8(match status {
                ReachabilityStatus::Reachable => 0,
                ReachabilityStatus::Unreachable => 1,
            });
        }
    }
    Ok(())
}

fn decode_gossip(buf: &mut &[u8]) -> io::Result<Gossip> {
    let count = get_count(buf, "member")?;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        members.push(decode_member(buf)?);
    }

    let version = VectorClock::from_entries(decode_counters(buf, "clock entry")?);
    let tombstones: BTreeMap<UniqueAddress, u64> =
        decode_counters(buf, "tombstone")?.into_iter().collect();

    let count = get_count(buf, "seen")?;
    let mut seen = BTreeSet::new();
    for _ in 0..count {
        seen.insert(decode_unique_address(buf)?);
    }

    let count = get_count(buf, "reachability row")?;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let observer = decode_unique_address(buf)?;
        let version = safe_get_u64_le(buf)?;
        let subject_count = get_count(buf, "reachability subject")?;
        let mut subjects = BTreeMap::new();
        for _ in 0..subject_count {
            let subject = decode_unique_address(buf)?;
            let status = match safe_get_u8(buf)? {
                0 => ReachabilityStatus::Reachable,
                1 => ReachabilityStatus::Unreachable,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown reachability status: {other}"),
                    ))
                }
            };
            subjects.insert(subject, status);
        }
        rows.push((observer, ObserverRow { version, subjects }));
    }

    Ok(Gossip::from_parts(
        members,
        version,
        tombstones,
        GossipOverview {
            seen,
            reachability: Reachability::from_rows(rows),
        },
    ))
}
