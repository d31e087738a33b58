use super::attr;
use super::ethernet::{self, Ethernet};
use super::flow_key::{self, FlowKey, IpKey, TransportKey};
use super::header;
use super::ipv4::IPv4;
use super::ipv6::IPv6;
use super::mpls::{self, Mpls};
use super::packet::PacketBuf;
use super::tcp::TCP;
use super::udp::UDP;

// ACTION ENGINE
//
// Interprets an action attribute stream against a packet and its flow
// key. Actions execute strictly in stream order; OUTPUT is synchronous.
// Unknown attribute types are a programmer error and panic, matching the
// "fail-fast" language that governs malformed action streams (as opposed
// to malformed *keys*, which are a protocol-level INVALID).

pub const ACTION_OUTPUT: u16 = 1;
pub const ACTION_USERSPACE: u16 = 2;
pub const ACTION_PUSH_VLAN: u16 = 3;
pub const ACTION_POP_VLAN: u16 = 4;
pub const ACTION_PUSH_MPLS: u16 = 5;
pub const ACTION_POP_MPLS: u16 = 6;
pub const ACTION_SET: u16 = 7;
pub const ACTION_SAMPLE: u16 = 8;

const USERSPACE_USERDATA: u16 = 1;
const PUSH_MPLS_ETHERTYPE: u16 = 1;
const PUSH_MPLS_LSE: u16 = 2;
const SAMPLE_PROBABILITY: u16 = 1;
const SAMPLE_ACTIONS: u16 = 2;

// Everything the action engine needs from its datapath, kept behind a
// trait so this module doesn't depend on Datapath's own definition.
pub trait ActionContext {
    fn output(&mut self, port_no: u32, key: &FlowKey, buf: &PacketBuf);
    fn enqueue_userspace(&mut self, key: &FlowKey, userdata: Option<&[u8]>, buf: &PacketBuf);
    fn random_u32(&mut self) -> u32;
}

pub fn execute(
    ctx: &mut dyn ActionContext,
    buf: &mut PacketBuf,
    key: &mut FlowKey,
    actions: &[u8],
) {
    for a in attr::iter(actions) {
        match a.attr_type {
            ACTION_OUTPUT => {
                let port = a.as_u32().expect("malformed OUTPUT action");
                ctx.output(port, key, buf);
            }
            ACTION_USERSPACE => {
                let mut userdata: Option<&[u8]> = None;
                for n in a.nested() {
                    if n.attr_type == USERSPACE_USERDATA {
                        userdata = Some(n.payload);
                    }
                }
                ctx.enqueue_userspace(key, userdata, buf);
            }
            ACTION_PUSH_VLAN => {
                let tci = a.as_u16().expect("malformed PUSH_VLAN action");
                push_vlan(buf, key, tci);
            }
            ACTION_POP_VLAN => {
                pop_vlan(buf, key);
            }
            ACTION_PUSH_MPLS => {
                let mut ethertype = mpls::TYPE_MPLS_UNICAST;
                let mut lse = 0u32;
                for n in a.nested() {
                    match n.attr_type {
                        PUSH_MPLS_ETHERTYPE => ethertype = n.as_u16().expect("malformed PUSH_MPLS"),
                        PUSH_MPLS_LSE => lse = n.as_u32().expect("malformed PUSH_MPLS"),
                        _ => panic!("unknown PUSH_MPLS sub-attribute"),
                    }
                }
                push_mpls(buf, key, ethertype, lse);
            }
            ACTION_POP_MPLS => {
                let ethertype = a.as_u16().expect("malformed POP_MPLS action");
                pop_mpls(buf, key, ethertype);
            }
            ACTION_SET => {
                for n in a.nested() {
                    apply_set(buf, key, n.attr_type, n.payload);
                }
            }
            ACTION_SAMPLE => {
                let mut probability: u32 = 0;
                let mut nested_actions: &[u8] = &[];
                for n in a.nested() {
                    match n.attr_type {
                        SAMPLE_PROBABILITY => probability = n.as_u32().expect("malformed SAMPLE"),
                        SAMPLE_ACTIONS => nested_actions = n.payload,
                        _ => panic!("unknown SAMPLE sub-attribute"),
                    }
                }
                if ctx.random_u32() < probability || probability == u32::MAX {
                    execute(ctx, buf, key, nested_actions);
                }
            }
            _ => panic!("unknown action attribute type {}", a.attr_type),
        }
    }
}

fn push_vlan(buf: &mut PacketBuf, key: &mut FlowKey, tci: u16) {
    // Insert the tag right after the Ethernet addresses, ahead of the
    // ethertype that is currently there. push_front only prepends at the
    // very front, so grow the headroom there first, then rotate the tag
    // past the addresses into place.
    let eth_len = header::size_of::<Ethernet>() - 2; // addrs only, minus ethertype
    let mut tag_bytes = [0u8; 4];
    tag_bytes[0..2].copy_from_slice(&super::vlan::TPID.to_be_bytes());
    tag_bytes[2..4].copy_from_slice(&tci.to_be_bytes());

    buf.push_front(&tag_bytes);
    let window = (eth_len + 4).min(buf.len());
    buf.as_mut_slice()[..window].rotate_left(4);

    key.vlan_tci = Some(tci);
    key.eth_type = super::vlan::TPID;
}

fn pop_vlan(buf: &mut PacketBuf, key: &mut FlowKey) {
    if key.vlan_tci.is_none() { return; }
    let eth_len = header::size_of::<Ethernet>() - 2;
    if buf.len() < eth_len + 4 { return; }
    let window = eth_len + 4;
    buf.as_mut_slice()[..window].rotate_right(4);
    buf.pull_front(4);

    key.vlan_tci = None;
    if buf.len() >= eth_len + 2 {
        let s = buf.as_slice();
        key.eth_type = u16::from_be_bytes([s[eth_len], s[eth_len + 1]]);
    }
}

fn l2_header_len(key: &FlowKey) -> usize {
    header::size_of::<Ethernet>() + if key.vlan_tci.is_some() { 4 } else { 0 }
}

fn push_mpls(buf: &mut PacketBuf, key: &mut FlowKey, ethertype: u16, lse: u32) {
    let l2_len = l2_header_len(key);
    if buf.len() < l2_len { return; }
    buf.push_front(&lse.to_be_bytes());
    let window = (l2_len + 4).min(buf.len());
    buf.as_mut_slice()[..window].rotate_left(4);

    key.eth_type = ethertype;
    key.mpls_lse = Some(lse);
}

fn pop_mpls(buf: &mut PacketBuf, key: &mut FlowKey, ethertype: u16) {
    if key.mpls_lse.is_none() { return; }
    let l2_len = l2_header_len(key);
    if buf.len() < l2_len + 4 { return; }
    let window = l2_len + 4;
    buf.as_mut_slice()[..window].rotate_right(4);
    buf.pull_front(4);

    key.mpls_lse = None;
    key.eth_type = ethertype;
}

// SET rewrites header fields in place; unlike OVS's execute_set_action it
// never recomputes checksums, matching the original's own behavior there.
fn apply_set(buf: &mut PacketBuf, key: &mut FlowKey, attr_type: u16, payload: &[u8]) {
    let scratch = buf.as_mut_slice();
    match attr_type {
        flow_key::ATTR_ETH_SRC if payload.len() == 6 => {
            let mut eth = header::from_mem::<Ethernet>(scratch);
            let mut mac = [0u8; 6];
            mac.copy_from_slice(payload);
            eth.set_src(&mac);
            key.eth_src = mac;
        }
        flow_key::ATTR_ETH_DST if payload.len() == 6 => {
            let mut eth = header::from_mem::<Ethernet>(scratch);
            let mut mac = [0u8; 6];
            mac.copy_from_slice(payload);
            eth.set_dst(&mac);
            key.eth_dst = mac;
        }
        flow_key::ATTR_IPV4_SRC | flow_key::ATTR_IPV4_DST
        | flow_key::ATTR_IPV4_TOS | flow_key::ATTR_IPV4_TTL => {
            let off = l2_header_len(key);
            if scratch.len() < off + header::size_of::<IPv4>() { return; }
            let mut ip = header::from_mem::<IPv4>(&mut scratch[off..]);
            match (&mut key.ip, attr_type) {
                (Some(IpKey::V4 { src, .. }), flow_key::ATTR_IPV4_SRC) => {
                    let v = u32_from(payload); ip.set_src(v); *src = v;
                }
                (Some(IpKey::V4 { dst, .. }), flow_key::ATTR_IPV4_DST) => {
                    let v = u32_from(payload); ip.set_dst(v); *dst = v;
                }
                (Some(IpKey::V4 { tos, .. }), flow_key::ATTR_IPV4_TOS) => {
                    let v = payload[0]; ip.set_tos(v); *tos = v;
                }
                (Some(IpKey::V4 { ttl, .. }), flow_key::ATTR_IPV4_TTL) => {
                    let v = payload[0]; ip.set_ttl(v); *ttl = v;
                }
                _ => {}
            }
        }
        flow_key::ATTR_IPV6_PROTO | flow_key::ATTR_IPV6_TCLASS
        | flow_key::ATTR_IPV6_LABEL | flow_key::ATTR_IPV6_HLIMIT
        | flow_key::ATTR_IPV6_SRC | flow_key::ATTR_IPV6_DST => {
            let off = l2_header_len(key);
            if scratch.len() < off + header::size_of::<IPv6>() { return; }
            let mut ip6 = header::from_mem::<IPv6>(&mut scratch[off..]);
            if let Some(IpKey::V6 { src, dst, proto, tclass, label, hlimit }) = &mut key.ip {
                match attr_type {
                    flow_key::ATTR_IPV6_PROTO => { ip6.set_next_header(payload[0]); *proto = payload[0]; }
                    flow_key::ATTR_IPV6_TCLASS => { ip6.set_traffic_class(payload[0]); *tclass = payload[0]; }
                    flow_key::ATTR_IPV6_LABEL => { let v = u32_from(payload); ip6.set_flow_label(v); *label = v; }
                    flow_key::ATTR_IPV6_HLIMIT => { ip6.set_hop_limit(payload[0]); *hlimit = payload[0]; }
                    flow_key::ATTR_IPV6_SRC if payload.len() == 16 => {
                        let mut a = [0u8; 16]; a.copy_from_slice(payload); ip6.set_src(a); *src = a;
                    }
                    flow_key::ATTR_IPV6_DST if payload.len() == 16 => {
                        let mut a = [0u8; 16]; a.copy_from_slice(payload); ip6.set_dst(a); *dst = a;
                    }
                    _ => {}
                }
            }
        }
        flow_key::ATTR_TCP_SRC | flow_key::ATTR_TCP_DST => {
            let off = transport_offset(key);
            if scratch.len() < off + header::size_of::<TCP>() { return; }
            let mut tcp = header::from_mem::<TCP>(&mut scratch[off..]);
            if let Some(TransportKey::Tcp { src, dst, .. }) = &mut key.transport {
                let v = u16_from(payload);
                if attr_type == flow_key::ATTR_TCP_SRC { tcp.set_src_port(v); *src = v; }
                else { tcp.set_dst_port(v); *dst = v; }
            }
        }
        flow_key::ATTR_UDP_SRC | flow_key::ATTR_UDP_DST => {
            let off = transport_offset(key);
            if scratch.len() < off + header::size_of::<UDP>() { return; }
            let mut udp = header::from_mem::<UDP>(&mut scratch[off..]);
            if let Some(TransportKey::Udp { src, dst }) = &mut key.transport {
                let v = u16_from(payload);
                if attr_type == flow_key::ATTR_UDP_SRC { udp.set_src_port(v); *src = v; }
                else { udp.set_dst_port(v); *dst = v; }
            }
        }
        flow_key::ATTR_MPLS_LSE => {
            let off = l2_header_len(key);
            if scratch.len() < off + header::size_of::<Mpls>() { return; }
            let mut lse = header::from_mem::<Mpls>(&mut scratch[off..]);
            let v = u32_from(payload);
            lse.set_raw(v);
            key.mpls_lse = Some(v);
        }
        flow_key::ATTR_PRIORITY | flow_key::ATTR_SKB_MARK | flow_key::ATTR_TUNNEL => {
            // Accepted and ignored, per the action engine's contract.
        }
        _ => panic!("unknown SET sub-attribute type {}", attr_type),
    }
}

fn transport_offset(key: &FlowKey) -> usize {
    let l2 = l2_header_len(key);
    match &key.ip {
        Some(IpKey::V4 { .. }) => l2 + header::size_of::<IPv4>(),
        Some(IpKey::V6 { .. }) => l2 + header::size_of::<IPv6>(),
        None => l2,
    }
}

fn u32_from(payload: &[u8]) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

fn u16_from(payload: &[u8]) -> u16 {
    u16::from_be_bytes([payload[0], payload[1]])
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::flow_key::flow_extract;

    struct Recorder {
        outputs: Vec<u32>,
        upcalls: usize,
        next_rand: u32,
    }

    impl ActionContext for Recorder {
        fn output(&mut self, port_no: u32, _key: &FlowKey, _buf: &PacketBuf) {
            self.outputs.push(port_no);
        }
        fn enqueue_userspace(&mut self, _key: &FlowKey, _userdata: Option<&[u8]>, _buf: &PacketBuf) {
            self.upcalls += 1;
        }
        fn random_u32(&mut self) -> u32 {
            self.next_rand
        }
    }

    fn eth_frame() -> Vec<u8> {
        let mut eth = header::new::<Ethernet>();
        eth.set_src(&[1, 2, 3, 4, 5, 6]);
        eth.set_dst(&[6, 5, 4, 3, 2, 1]);
        eth.set_ethertype(ethernet::TYPE_IPV4);
        let mut frame = vec![0u8; header::size_of::<Ethernet>() + 20];
        eth.copy(&mut frame);
        frame
    }

    #[test]
    fn output_records_port() {
        let mut buf = PacketBuf::from_bytes(&eth_frame());
        let mut key = flow_extract(&buf, 1, None).unwrap();
        let mut actions = Vec::new();
        attr::put_u32(&mut actions, ACTION_OUTPUT, 2);
        let mut ctx = Recorder { outputs: vec![], upcalls: 0, next_rand: 0 };
        execute(&mut ctx, &mut buf, &mut key, &actions);
        assert_eq!(ctx.outputs, vec![2]);
    }

    #[test]
    fn sample_zero_probability_never_fires() {
        let mut buf = PacketBuf::from_bytes(&eth_frame());
        let mut key = flow_extract(&buf, 1, None).unwrap();
        let mut actions = Vec::new();
        attr::put_nested(&mut actions, ACTION_SAMPLE, |nested| {
            attr::put_u32(nested, SAMPLE_PROBABILITY, 0);
            attr::put_nested(nested, SAMPLE_ACTIONS, |inner| {
                attr::put_u32(inner, ACTION_OUTPUT, 2);
            });
        });
        attr::put_u32(&mut actions, ACTION_OUTPUT, 3);
        let mut ctx = Recorder { outputs: vec![], upcalls: 0, next_rand: u32::MAX };
        execute(&mut ctx, &mut buf, &mut key, &actions);
        assert_eq!(ctx.outputs, vec![3]);
    }

    #[test]
    fn sample_max_probability_always_fires() {
        let mut buf = PacketBuf::from_bytes(&eth_frame());
        let mut key = flow_extract(&buf, 1, None).unwrap();
        let mut actions = Vec::new();
        attr::put_nested(&mut actions, ACTION_SAMPLE, |nested| {
            attr::put_u32(nested, SAMPLE_PROBABILITY, u32::MAX);
            attr::put_nested(nested, SAMPLE_ACTIONS, |inner| {
                attr::put_u32(inner, ACTION_OUTPUT, 2);
            });
        });
        attr::put_u32(&mut actions, ACTION_OUTPUT, 3);
        let mut ctx = Recorder { outputs: vec![], upcalls: 0, next_rand: 0 };
        execute(&mut ctx, &mut buf, &mut key, &actions);
        assert_eq!(ctx.outputs, vec![2, 3]);
    }

    #[test]
    fn set_eth_src_rewrites_header_and_key() {
        let mut buf = PacketBuf::from_bytes(&eth_frame());
        let mut key = flow_extract(&buf, 1, None).unwrap();
        let mut actions = Vec::new();
        attr::put_nested(&mut actions, ACTION_SET, |nested| {
            attr::put(nested, flow_key::ATTR_ETH_SRC, &[9, 9, 9, 9, 9, 9]);
        });
        let mut ctx = Recorder { outputs: vec![], upcalls: 0, next_rand: 0 };
        execute(&mut ctx, &mut buf, &mut key, &actions);
        assert_eq!(key.eth_src, [9, 9, 9, 9, 9, 9]);
    }
}
