use super::flow_key::TunnelKey;
use super::packet::PacketBuf;
use super::port::NetDev;
use crate::error::{DpError, DpResult};
use crate::util;

use once_cell::sync::Lazy;
use std::sync::Mutex;

// GRE VPORT (RFC 2784/2890)
//
// encap/decap only; route lookup, head expansion, and hardware VLAN
// de-acceleration are the NetDev/IP-stack collaborators' job and are out
// of scope here. Each send reads the per-packet tunnel-key descriptor
// off the flow key that produced the packet (threaded through
// ActionContext::output -> NetDev::send); a packet with no tunnel key
// attached is INVALID, matching the "require a per-packet tunnel-key
// descriptor" step of the send path.

pub const GRE_FLAG_CSUM: u16 = 0x8000;
pub const GRE_FLAG_KEY: u16 = 0x2000;
pub const GRE_FLAG_SEQ: u16 = 0x1000;

const ETHERTYPE_TRANSPARENT_ETHERNET_BRIDGING: u16 = 0x6558;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GreKind {
    Gre,
    Gre64,
}

// Keep only CSUM and KEY from the caller-supplied flags; GRE64 vports
// additionally always set SEQ.
pub fn filter_flags(kind: GreKind, flags: u8) -> u16 {
    let mut out = 0u16;
    if flags & super::flow_key::TUNNEL_CSUM != 0 { out |= GRE_FLAG_CSUM; }
    if flags & super::flow_key::TUNNEL_KEY != 0 { out |= GRE_FLAG_KEY; }
    if kind == GreKind::Gre64 { out |= GRE_FLAG_SEQ; }
    out
}

pub fn gre_hdr_len(flags: u16) -> usize {
    let mut len = 4; // flags/version + protocol
    if flags & GRE_FLAG_CSUM != 0 { len += 4; } // checksum + reserved1
    if flags & GRE_FLAG_KEY != 0 { len += 4; }
    if flags & GRE_FLAG_SEQ != 0 { len += 4; }
    len
}

// Build the GRE header and payload for one frame. DF is the caller's
// responsibility (the IP tunnel helper, out of scope); this returns just
// the GRE-encapsulated payload that goes inside the outer IP packet.
pub fn encap(kind: GreKind, tunnel: &TunnelKey, frame: &[u8]) -> Vec<u8> {
    let flags = filter_flags(kind, tunnel.flags);
    let mut out = Vec::with_capacity(gre_hdr_len(flags) + frame.len());

    out.extend_from_slice(&util::htons(flags).to_ne_bytes());
    out.extend_from_slice(&util::htons(ETHERTYPE_TRANSPARENT_ETHERNET_BRIDGING).to_ne_bytes());
    if flags & GRE_FLAG_CSUM != 0 {
        out.extend_from_slice(&[0u8; 4]); // checksum + reserved1, left zero
    }
    if flags & GRE_FLAG_KEY != 0 {
        let key = tunnel.tun_id as u32;
        out.extend_from_slice(&util::htonl(key).to_ne_bytes());
    }
    if flags & GRE_FLAG_SEQ != 0 {
        let seq = (tunnel.tun_id >> 32) as u32;
        out.extend_from_slice(&util::htonl(seq).to_ne_bytes());
    }
    out.extend_from_slice(frame);
    out
}

// Recover the tunnel key and inner frame from a GRE payload (the portion
// of the packet after the outer IP header). Which vport kind receives it
// is decided by the presence of both KEY and SEQ.
pub fn decap(wire: &[u8]) -> DpResult<(GreKind, TunnelKey, Vec<u8>)> {
    if wire.len() < 4 { return Err(DpError::Invalid); }
    let raw_flags = u16::from_ne_bytes([wire[0], wire[1]]);
    let flags = util::ntohs(raw_flags);
    let mut off = 4;

    if flags & GRE_FLAG_CSUM != 0 {
        if wire.len() < off + 4 { return Err(DpError::Invalid); }
        off += 4;
    }
    let mut key_low: u32 = 0;
    if flags & GRE_FLAG_KEY != 0 {
        if wire.len() < off + 4 { return Err(DpError::Invalid); }
        key_low = util::ntohl(u32::from_ne_bytes([wire[off], wire[off + 1], wire[off + 2], wire[off + 3]]));
        off += 4;
    }
    let mut key_high: u32 = 0;
    if flags & GRE_FLAG_SEQ != 0 {
        if wire.len() < off + 4 { return Err(DpError::Invalid); }
        key_high = util::ntohl(u32::from_ne_bytes([wire[off], wire[off + 1], wire[off + 2], wire[off + 3]]));
        off += 4;
    }

    let kind = if flags & GRE_FLAG_KEY != 0 && flags & GRE_FLAG_SEQ != 0 {
        GreKind::Gre64
    } else {
        GreKind::Gre
    };

    let mut tun_flags = 0u8;
    if flags & GRE_FLAG_CSUM != 0 { tun_flags |= super::flow_key::TUNNEL_CSUM; }
    if flags & GRE_FLAG_KEY != 0 { tun_flags |= super::flow_key::TUNNEL_KEY; }
    if flags & GRE_FLAG_SEQ != 0 { tun_flags |= super::flow_key::TUNNEL_SEQ; }

    let tunnel = TunnelKey {
        tun_id: ((key_high as u64) << 32) | key_low as u64,
        src: 0,
        dst: 0,
        tos: 0,
        ttl: 0,
        flags: tun_flags,
    };
    Ok((kind, tunnel, wire[off..].to_vec()))
}

// PER-NETWORK SINGLETON REGISTRATION
//
// At most one GRE and one GRE64 port may be live at a time (modeling
// "per network namespace" as a single process-wide namespace). create
// registers the protocol handler on first use of a kind; destroy
// unregisters on last use.
struct Refcounts {
    gre: u32,
    gre64: u32,
}

static GRE_PORTS: Lazy<Mutex<Refcounts>> = Lazy::new(|| Mutex::new(Refcounts { gre: 0, gre64: 0 }));

pub fn register(kind: GreKind) {
    let mut r = GRE_PORTS.lock().unwrap();
    match kind {
        GreKind::Gre => r.gre += 1,
        GreKind::Gre64 => r.gre64 += 1,
    }
}

pub fn unregister(kind: GreKind) {
    let mut r = GRE_PORTS.lock().unwrap();
    match kind {
        GreKind::Gre => r.gre = r.gre.saturating_sub(1),
        GreKind::Gre64 => r.gre64 = r.gre64.saturating_sub(1),
    }
}

pub fn registered(kind: GreKind) -> bool {
    let r = GRE_PORTS.lock().unwrap();
    match kind {
        GreKind::Gre => r.gre > 0,
        GreKind::Gre64 => r.gre64 > 0,
    }
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut r = GRE_PORTS.lock().unwrap();
    r.gre = 0;
    r.gre64 = 0;
}

// A GRE/GRE64 NetDev. send() wraps an Ethernet frame in GRE using the
// tunnel key carried by the packet's flow key; recv() does the inverse.
#[derive(Debug)]
pub struct GreVport {
    kind: GreKind,
    inbox: std::collections::VecDeque<Vec<u8>>,
    sent: std::collections::VecDeque<Vec<u8>>,
}

impl GreVport {
    pub fn create(kind: GreKind) -> DpResult<GreVport> {
        if registered(kind) {
            return Err(DpError::Exists);
        }
        register(kind);
        Ok(GreVport { kind, inbox: Default::default(), sent: Default::default() })
    }

    // Test/loopback hook: feed a GRE-encapsulated wire frame as if it had
    // just arrived from the IP stack.
    pub fn inject_wire(&mut self, wire: Vec<u8>) {
        self.inbox.push_back(wire);
    }

    pub fn take_sent_wire(&mut self) -> Option<Vec<u8>> {
        self.sent.pop_front()
    }
}

impl Drop for GreVport {
    fn drop(&mut self) {
        unregister(self.kind);
    }
}

impl NetDev for GreVport {
    fn get_type(&self) -> &str {
        match self.kind { GreKind::Gre => "gre", GreKind::Gre64 => "gre64" }
    }

    fn get_mtu(&self) -> usize { 1462 } // 1500 - typical GRE64 header overhead

    fn recv(&mut self) -> DpResult<PacketBuf> {
        let wire = self.inbox.pop_front().ok_or(DpError::Retry)?;
        let (_, _, frame) = decap(&wire)?;
        Ok(PacketBuf::from_bytes(&frame))
    }

    fn send(&mut self, buf: &PacketBuf, tunnel: Option<&TunnelKey>) -> DpResult<()> {
        let tunnel = tunnel.ok_or(DpError::Invalid)?;
        let wire = encap(self.kind, tunnel, buf.as_slice());
        self.sent.push_back(wire);
        Ok(())
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn tunnel(tun_id: u64, flags: u8) -> TunnelKey {
        TunnelKey { tun_id, src: 0x0a000001, dst: 0x0a000002, tos: 0, ttl: 64, flags }
    }

    #[test]
    fn gre64_header_carries_key_and_sequence() {
        let t = tunnel(0x00000001_00000002, super::super::flow_key::TUNNEL_KEY);
        let wire = encap(GreKind::Gre64, &t, b"hello");
        let flags = util::ntohs(u16::from_ne_bytes([wire[0], wire[1]]));
        assert_eq!(flags, GRE_FLAG_KEY | GRE_FLAG_SEQ);
        assert_eq!(gre_hdr_len(flags), 12);
    }

    #[test]
    fn round_trip_preserves_tun_id() {
        let t = tunnel(0x00000001_00000002, super::super::flow_key::TUNNEL_KEY);
        let wire = encap(GreKind::Gre64, &t, b"hello world");
        let (kind, decoded, frame) = decap(&wire).unwrap();
        assert_eq!(kind, GreKind::Gre64);
        assert_eq!(decoded.tun_id, t.tun_id);
        assert_eq!(frame, b"hello world");
    }

    #[test]
    fn only_one_gre64_port_at_a_time() {
        reset_for_test();
        let _first = GreVport::create(GreKind::Gre64).unwrap();
        assert_eq!(GreVport::create(GreKind::Gre64).unwrap_err(), DpError::Exists);
    }

    #[test]
    fn vport_send_then_recv_round_trip() {
        reset_for_test();
        let endpoint = tunnel(0x00000001_00000002, super::super::flow_key::TUNNEL_KEY);
        let mut vport = GreVport::create(GreKind::Gre64).unwrap();
        vport.send(&PacketBuf::from_bytes(b"ethernet frame goes here"), Some(&endpoint)).unwrap();
        let wire = vport.take_sent_wire().unwrap();
        vport.inject_wire(wire);
        let got = vport.recv().unwrap();
        assert_eq!(got.as_slice(), b"ethernet frame goes here");
    }

    #[test]
    fn send_without_tunnel_key_is_invalid() {
        reset_for_test();
        let mut vport = GreVport::create(GreKind::Gre64).unwrap();
        let err = vport.send(&PacketBuf::from_bytes(b"frame"), None).unwrap_err();
        assert_eq!(err, DpError::Invalid);
    }
}
