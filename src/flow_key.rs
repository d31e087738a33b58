use super::attr;
use super::ethernet::{self, Ethernet, MacAddress};
use super::header;
use super::ipv4::{self, IPv4};
use super::ipv6::{self, IPv6};
use super::mpls;
use super::packet::PacketBuf;
use super::tcp::TCP;
use super::udp::UDP;
use super::vlan::{self, Vlan};
use crate::error::DpError;

use std::hash::{Hash, Hasher};

// FLOW KEY
//
// The canonical tuple extracted from a packet by flow_extract, used both
// as the flow table's lookup key and, serialized, as the wire format
// exchanged with the control plane. Attribute type tags below are shared
// between a standalone key blob and a SET action's nested key attribute,
// the way OVS reuses OVS_KEY_ATTR_* in both places.

pub const ATTR_IN_PORT: u16 = 1;
pub const ATTR_ETH_SRC: u16 = 2;
pub const ATTR_ETH_DST: u16 = 3;
pub const ATTR_ETH_TYPE: u16 = 4;
pub const ATTR_VLAN_TCI: u16 = 5;
pub const ATTR_IPV4_SRC: u16 = 6;
pub const ATTR_IPV4_DST: u16 = 7;
pub const ATTR_IPV4_PROTO: u16 = 8;
pub const ATTR_IPV4_TOS: u16 = 9;
pub const ATTR_IPV4_TTL: u16 = 10;
pub const ATTR_IPV6_SRC: u16 = 11;
pub const ATTR_IPV6_DST: u16 = 12;
pub const ATTR_IPV6_PROTO: u16 = 13;
pub const ATTR_IPV6_TCLASS: u16 = 14;
pub const ATTR_IPV6_LABEL: u16 = 15;
pub const ATTR_IPV6_HLIMIT: u16 = 16;
pub const ATTR_TCP_SRC: u16 = 17;
pub const ATTR_TCP_DST: u16 = 18;
pub const ATTR_TCP_FLAGS: u16 = 19;
pub const ATTR_UDP_SRC: u16 = 20;
pub const ATTR_UDP_DST: u16 = 21;
pub const ATTR_MPLS_LSE: u16 = 22;
pub const ATTR_TUNNEL: u16 = 23;
pub const ATTR_PRIORITY: u16 = 24;
pub const ATTR_SKB_MARK: u16 = 25;

pub const ATTR_TUN_ID: u16 = 1;
pub const ATTR_TUN_SRC: u16 = 2;
pub const ATTR_TUN_DST: u16 = 3;
pub const ATTR_TUN_TOS: u16 = 4;
pub const ATTR_TUN_TTL: u16 = 5;
pub const ATTR_TUN_FLAGS: u16 = 6;

pub const TUNNEL_CSUM: u8 = 1 << 0;
pub const TUNNEL_KEY: u8 = 1 << 1;
pub const TUNNEL_SEQ: u8 = 1 << 2;
pub const TUNNEL_DONT_FRAGMENT: u8 = 1 << 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct TunnelKey {
    pub tun_id: u64,
    pub src: u32,
    pub dst: u32,
    pub tos: u8,
    pub ttl: u8,
    pub flags: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpKey {
    V4 { src: u32, dst: u32, proto: u8, tos: u8, ttl: u8 },
    V6 { src: [u8; 16], dst: [u8; 16], proto: u8, tclass: u8, label: u32, hlimit: u8 },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportKey {
    Tcp { src: u16, dst: u16, flags: u8 },
    Udp { src: u16, dst: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    pub in_port: u32,
    pub eth_src: MacAddress,
    pub eth_dst: MacAddress,
    pub eth_type: u16,
    pub vlan_tci: Option<u16>,
    pub ip: Option<IpKey>,
    pub transport: Option<TransportKey>,
    pub mpls_lse: Option<u32>,
    pub tunnel: Option<TunnelKey>,
}

// fmix64, the finalizer from MurmurHash3, used as the "stable user-supplied
// hash" the flow table keys on rather than the default (randomized)
// SipHash.
pub fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

#[derive(Default)]
pub struct FlowHasher {
    acc: u64,
}

impl Hasher for FlowHasher {
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.acc = fmix64(self.acc ^ u64::from_ne_bytes(buf));
        }
    }

    fn finish(&self) -> u64 {
        self.acc
    }
}

pub type FlowBuildHasher = std::hash::BuildHasherDefault<FlowHasher>;

// flow_hash(key, 0): seed 0, matching the original's default table seed.
pub fn flow_hash(key: &FlowKey, seed: u64) -> u64 {
    let mut h = FlowHasher { acc: seed };
    key.hash(&mut h);
    h.finish()
}

// Extract the canonical tuple from a captured frame. Rejects frames
// shorter than an Ethernet header. 'tunnel' carries the per-packet
// tunnel-key descriptor recovered by a vport's decap path, if any.
pub fn flow_extract(
    buf: &PacketBuf,
    in_port: u32,
    tunnel: Option<TunnelKey>,
) -> Result<FlowKey, DpError> {
    let data = buf.as_slice();
    if data.len() < header::size_of::<Ethernet>() {
        return Err(DpError::Invalid);
    }
    let mut scratch = data.to_vec();
    let eth = header::from_mem::<Ethernet>(&mut scratch);
    let mut key = FlowKey {
        in_port,
        eth_src: *eth.src(),
        eth_dst: *eth.dst(),
        eth_type: eth.ethertype(),
        tunnel,
        ..Default::default()
    };

    let mut offset = header::size_of::<Ethernet>();
    let mut ethertype = key.eth_type;

    if ethertype == vlan::TPID {
        if scratch.len() < offset + header::size_of::<Vlan>() {
            return Ok(key);
        }
        let tag = header::from_mem::<Vlan>(&mut scratch[offset..]);
        key.vlan_tci = Some(tag.tci());
        offset += header::size_of::<Vlan>();
        if scratch.len() < offset + 2 { return Ok(key); }
        ethertype = u16::from_be_bytes([scratch[offset], scratch[offset + 1]]);
        key.eth_type = ethertype;
        offset += 2;
    }

    if ethertype == ethernet::TYPE_IPV4 {
        if scratch.len() < offset + header::size_of::<IPv4>() { return Ok(key); }
        let ip = header::from_mem::<IPv4>(&mut scratch[offset..]);
        let proto = ip.protocol();
        key.ip = Some(IpKey::V4 {
            src: ip.src(), dst: ip.dst(), proto, tos: ip.tos(), ttl: ip.ttl(),
        });
        let l4_off = offset + (ip.ihl() as usize) * 4;
        extract_transport(&mut scratch, l4_off, proto, &mut key);
    } else if ethertype == ipv6::TYPE_IPV6 {
        if scratch.len() < offset + header::size_of::<IPv6>() { return Ok(key); }
        let ip6 = header::from_mem::<IPv6>(&mut scratch[offset..]);
        let proto = ip6.next_header();
        key.ip = Some(IpKey::V6 {
            src: ip6.src(), dst: ip6.dst(), proto,
            tclass: ip6.traffic_class(), label: ip6.flow_label(), hlimit: ip6.hop_limit(),
        });
        let l4_off = offset + header::size_of::<IPv6>();
        extract_transport(&mut scratch, l4_off, proto, &mut key);
    } else if ethertype == mpls::TYPE_MPLS_UNICAST {
        if scratch.len() >= offset + header::size_of::<mpls::Mpls>() {
            let lse = header::from_mem::<mpls::Mpls>(&mut scratch[offset..]);
            key.mpls_lse = Some(lse.raw());
        }
    }

    Ok(key)
}

fn extract_transport(scratch: &mut [u8], l4_off: usize, proto: u8, key: &mut FlowKey) {
    if proto == ipv4::PROTOCOL_TCP {
        if scratch.len() < l4_off + header::size_of::<TCP>() { return; }
        let tcp = header::from_mem::<TCP>(&mut scratch[l4_off..]);
        key.transport = Some(TransportKey::Tcp {
            src: tcp.src_port(), dst: tcp.dst_port(), flags: tcp.flags(),
        });
    } else if proto == ipv4::PROTOCOL_UDP {
        if scratch.len() < l4_off + header::size_of::<UDP>() { return; }
        let udp = header::from_mem::<UDP>(&mut scratch[l4_off..]);
        key.transport = Some(TransportKey::Udp { src: udp.src_port(), dst: udp.dst_port() });
    }
}

pub fn key_from_flow(key: &FlowKey) -> Vec<u8> {
    let mut buf = Vec::new();
    attr::put_u32(&mut buf, ATTR_IN_PORT, key.in_port);
    attr::put(&mut buf, ATTR_ETH_SRC, &key.eth_src);
    attr::put(&mut buf, ATTR_ETH_DST, &key.eth_dst);
    attr::put_u16(&mut buf, ATTR_ETH_TYPE, key.eth_type);
    if let Some(tci) = key.vlan_tci {
        attr::put_u16(&mut buf, ATTR_VLAN_TCI, tci);
    }
    match &key.ip {
        Some(IpKey::V4 { src, dst, proto, tos, ttl }) => {
            attr::put_u32(&mut buf, ATTR_IPV4_SRC, *src);
            attr::put_u32(&mut buf, ATTR_IPV4_DST, *dst);
            attr::put_u8(&mut buf, ATTR_IPV4_PROTO, *proto);
            attr::put_u8(&mut buf, ATTR_IPV4_TOS, *tos);
            attr::put_u8(&mut buf, ATTR_IPV4_TTL, *ttl);
        }
        Some(IpKey::V6 { src, dst, proto, tclass, label, hlimit }) => {
            attr::put(&mut buf, ATTR_IPV6_SRC, src);
            attr::put(&mut buf, ATTR_IPV6_DST, dst);
            attr::put_u8(&mut buf, ATTR_IPV6_PROTO, *proto);
            attr::put_u8(&mut buf, ATTR_IPV6_TCLASS, *tclass);
            attr::put_u32(&mut buf, ATTR_IPV6_LABEL, *label);
            attr::put_u8(&mut buf, ATTR_IPV6_HLIMIT, *hlimit);
        }
        None => {}
    }
    match &key.transport {
        Some(TransportKey::Tcp { src, dst, flags }) => {
            attr::put_u16(&mut buf, ATTR_TCP_SRC, *src);
            attr::put_u16(&mut buf, ATTR_TCP_DST, *dst);
            attr::put_u8(&mut buf, ATTR_TCP_FLAGS, *flags);
        }
        Some(TransportKey::Udp { src, dst }) => {
            attr::put_u16(&mut buf, ATTR_UDP_SRC, *src);
            attr::put_u16(&mut buf, ATTR_UDP_DST, *dst);
        }
        None => {}
    }
    if let Some(lse) = key.mpls_lse {
        attr::put_u32(&mut buf, ATTR_MPLS_LSE, lse);
    }
    if let Some(t) = &key.tunnel {
        attr::put_nested(&mut buf, ATTR_TUNNEL, |nested| {
            attr::put_u64(nested, ATTR_TUN_ID, t.tun_id);
            attr::put_u32(nested, ATTR_TUN_SRC, t.src);
            attr::put_u32(nested, ATTR_TUN_DST, t.dst);
            attr::put_u8(nested, ATTR_TUN_TOS, t.tos);
            attr::put_u8(nested, ATTR_TUN_TTL, t.ttl);
            attr::put_u8(nested, ATTR_TUN_FLAGS, t.flags);
        });
    }
    buf
}

pub fn key_to_flow(bytes: &[u8]) -> Result<FlowKey, DpError> {
    let mut key = FlowKey::default();
    let mut v4: Option<(u32, u32, u8, u8, u8)> = None;
    let mut v6: Option<([u8; 16], [u8; 16], u8, u8, u32, u8)> = None;
    let mut tcp: Option<(u16, u16, u8)> = None;
    let mut udp: Option<(u16, u16)> = None;

    for a in attr::iter(bytes) {
        match a.attr_type {
            ATTR_IN_PORT => key.in_port = a.as_u32().ok_or(DpError::Invalid)?,
            ATTR_ETH_SRC => {
                if a.payload.len() != 6 { return Err(DpError::Invalid); }
                key.eth_src.copy_from_slice(a.payload);
            }
            ATTR_ETH_DST => {
                if a.payload.len() != 6 { return Err(DpError::Invalid); }
                key.eth_dst.copy_from_slice(a.payload);
            }
            ATTR_ETH_TYPE => key.eth_type = a.as_u16().ok_or(DpError::Invalid)?,
            ATTR_VLAN_TCI => key.vlan_tci = Some(a.as_u16().ok_or(DpError::Invalid)?),
            ATTR_IPV4_SRC => v4.get_or_insert((0, 0, 0, 0, 0)).0 = a.as_u32().ok_or(DpError::Invalid)?,
            ATTR_IPV4_DST => v4.get_or_insert((0, 0, 0, 0, 0)).1 = a.as_u32().ok_or(DpError::Invalid)?,
            ATTR_IPV4_PROTO => v4.get_or_insert((0, 0, 0, 0, 0)).2 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_IPV4_TOS => v4.get_or_insert((0, 0, 0, 0, 0)).3 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_IPV4_TTL => v4.get_or_insert((0, 0, 0, 0, 0)).4 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_IPV6_SRC => {
                let mut s = [0u8; 16];
                if a.payload.len() != 16 { return Err(DpError::Invalid); }
                s.copy_from_slice(a.payload);
                v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).0 = s;
            }
            ATTR_IPV6_DST => {
                let mut s = [0u8; 16];
                if a.payload.len() != 16 { return Err(DpError::Invalid); }
                s.copy_from_slice(a.payload);
                v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).1 = s;
            }
            ATTR_IPV6_PROTO => v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).2 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_IPV6_TCLASS => v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).3 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_IPV6_LABEL => v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).4 = a.as_u32().ok_or(DpError::Invalid)?,
            ATTR_IPV6_HLIMIT => v6.get_or_insert(([0; 16], [0; 16], 0, 0, 0, 0)).5 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_TCP_SRC => tcp.get_or_insert((0, 0, 0)).0 = a.as_u16().ok_or(DpError::Invalid)?,
            ATTR_TCP_DST => tcp.get_or_insert((0, 0, 0)).1 = a.as_u16().ok_or(DpError::Invalid)?,
            ATTR_TCP_FLAGS => tcp.get_or_insert((0, 0, 0)).2 = a.as_u8().ok_or(DpError::Invalid)?,
            ATTR_UDP_SRC => udp.get_or_insert((0, 0)).0 = a.as_u16().ok_or(DpError::Invalid)?,
            ATTR_UDP_DST => udp.get_or_insert((0, 0)).1 = a.as_u16().ok_or(DpError::Invalid)?,
            ATTR_MPLS_LSE => key.mpls_lse = Some(a.as_u32().ok_or(DpError::Invalid)?),
            ATTR_TUNNEL => key.tunnel = Some(decode_tunnel(&a)?),
            ATTR_PRIORITY | ATTR_SKB_MARK => {}
            _ => return Err(DpError::Invalid),
        }
    }

    if let Some((src, dst, proto, tos, ttl)) = v4 {
        key.ip = Some(IpKey::V4 { src, dst, proto, tos, ttl });
    } else if let Some((src, dst, proto, tclass, label, hlimit)) = v6 {
        key.ip = Some(IpKey::V6 { src, dst, proto, tclass, label, hlimit });
    }
    if let Some((src, dst, flags)) = tcp {
        key.transport = Some(TransportKey::Tcp { src, dst, flags });
    } else if let Some((src, dst)) = udp {
        key.transport = Some(TransportKey::Udp { src, dst });
    }

    Ok(key)
}

pub fn decode_tunnel(a: &attr::Attr) -> Result<TunnelKey, DpError> {
    let mut t = TunnelKey::default();
    for n in a.nested() {
        match n.attr_type {
            ATTR_TUN_ID => t.tun_id = n.as_u64().ok_or(DpError::Invalid)?,
            ATTR_TUN_SRC => t.src = n.as_u32().ok_or(DpError::Invalid)?,
            ATTR_TUN_DST => t.dst = n.as_u32().ok_or(DpError::Invalid)?,
            ATTR_TUN_TOS => t.tos = n.as_u8().ok_or(DpError::Invalid)?,
            ATTR_TUN_TTL => t.ttl = n.as_u8().ok_or(DpError::Invalid)?,
            ATTR_TUN_FLAGS => t.flags = n.as_u8().ok_or(DpError::Invalid)?,
            _ => return Err(DpError::Invalid),
        }
    }
    Ok(t)
}

// Overlay every field present in 'attrs' onto 'key', used by
// Datapath::execute where the supplied key fully replaces the extracted
// one on a field-by-field basis.
pub fn overlay_from_attrs(key: &mut FlowKey, attrs: &[u8]) -> Result<(), DpError> {
    let supplied = key_to_flow(attrs)?;
    if supplied.in_port != 0 || has_attr(attrs, ATTR_IN_PORT) { key.in_port = supplied.in_port; }
    if has_attr(attrs, ATTR_ETH_SRC) { key.eth_src = supplied.eth_src; }
    if has_attr(attrs, ATTR_ETH_DST) { key.eth_dst = supplied.eth_dst; }
    if has_attr(attrs, ATTR_ETH_TYPE) { key.eth_type = supplied.eth_type; }
    if supplied.vlan_tci.is_some() { key.vlan_tci = supplied.vlan_tci; }
    if supplied.ip.is_some() { key.ip = supplied.ip; }
    if supplied.transport.is_some() { key.transport = supplied.transport; }
    if supplied.mpls_lse.is_some() { key.mpls_lse = supplied.mpls_lse; }
    if supplied.tunnel.is_some() { key.tunnel = supplied.tunnel; }
    Ok(())
}

fn has_attr(bytes: &[u8], attr_type: u16) -> bool {
    attr::iter(bytes).any(|a| a.attr_type == attr_type)
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn sample_key() -> FlowKey {
        FlowKey {
            in_port: 3,
            eth_src: [1, 2, 3, 4, 5, 6],
            eth_dst: [6, 5, 4, 3, 2, 1],
            eth_type: ethernet::TYPE_IPV4,
            vlan_tci: Some(0x1002),
            ip: Some(IpKey::V4 { src: 0x0a000001, dst: 0x0a000002, proto: ipv4::PROTOCOL_TCP, tos: 0, ttl: 64 }),
            transport: Some(TransportKey::Tcp { src: 1234, dst: 80, flags: 0x02 }),
            mpls_lse: None,
            tunnel: None,
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let k = sample_key();
        let bytes = key_from_flow(&k);
        let k2 = key_to_flow(&bytes).unwrap();
        assert_eq!(k, k2);
    }

    #[test]
    fn round_trip_with_tunnel() {
        let mut k = sample_key();
        k.tunnel = Some(TunnelKey { tun_id: 0x1_0000_0002, src: 1, dst: 2, tos: 0, ttl: 64, flags: TUNNEL_KEY | TUNNEL_SEQ });
        let bytes = key_from_flow(&k);
        let k2 = key_to_flow(&bytes).unwrap();
        assert_eq!(k, k2);
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let k = sample_key();
        assert_eq!(flow_hash(&k, 0), flow_hash(&k, 0));
    }

    #[test]
    fn unknown_attribute_is_invalid() {
        let mut buf = Vec::new();
        attr::put_u8(&mut buf, 200, 1);
        assert_eq!(key_to_flow(&buf), Err(DpError::Invalid));
    }
}
