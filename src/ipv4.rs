use super::util;
use super::header;

use std::net;
use std::str::FromStr;

// IPv4
//
// This module contains an IPv4 header definition, a type for IPv4 addresses,
// and some related utilities.
//
//   Address - u32 (in network byte order)
//   ntop(Address) -> String - return string representation of IPv4 address
//   pton(&str) -> Address - parse IPv4 address from string representation
//   IPv4 - struct for IPv4 headers
//   IPv4::new() -> Header<IPv4> - new header with defaults (version, IHL, ...)
//   Header<IPv4>.version() -> u16 - get 4-bit version (always 4)
//   Header<IPv4>.set_version(u16) - set 4-bit version (should always be 4)
//   Header<IPv4>.ihl() -> u16 - get 4-bit IHL (5 unless there are options)
//   Header<IPv4>.set_ihl(u16) - set 4-bit IHL (5 unless there are options)
//   Header<IPv4>.tos() -> u8 - get the 8-bit DSCP+ECN field
//   Header<IPv4>.set_tos(u8) - set the 8-bit DSCP+ECN field
//   Header<IPv4>.total_length() -> u16 - get IPv4 frame size including header
//   Header<IPv4>.set_total_length(u16) - set IPv4 frame size including header
//   Header<IPv4>.id() -> u16 - get flow identifier
//   Header<IPv4>.set_id(u16) - set flow identifier
//   Header<IPv4>.flags() -> u16 - get 3-bit fragment flags
//   Header<IPv4>.set_flags(u16) - set 3-bit fragment flags
//   Header<IPv4>.ttl() -> u8 - get Time-To-Live (max. hops)
//   Header<IPv4>.set_ttl(u8) - set Time-To-Live (max. hops)
//   Header<IPv4>.protocol() -> u8 - get protocol
//   Header<IPv4>.set_protocol(u8) - set protocol
//   Header<IPv4>.src() -> Address - get source address
//   Header<IPv4>.set_src(Address) - set source address
//   Header<IPv4>.dst() -> Address - get destination address
//   Header<IPv4>.set_dst(Address) - set destination address
//   Header<IPv4>.swap() - swap source and destination addresses
//   PROTOCOL_TCP - const u8 identifier for protocol TCP
//   PROTOCOL_UDP - const u8 identifier for protocol UDP

pub type Address = u32;

pub fn ntop(address: Address) -> String {
    net::Ipv4Addr::from(util::ntohl(address)).to_string()
}

pub fn pton(string: &str) -> Address {
    util::htonl(u32::from(net::Ipv4Addr::from_str(string).unwrap()))
}

#[repr(C, packed)]
#[derive(Default)]
pub struct IPv4 {
    ihl_v_tos: u16, // ihl:4, version:4, tos(dscp:6 + ecn:2)
    total_length: u16,
    id: u16,
    frag_off: u16, // flags:3, fragment_offset:13
    ttl: u8,
    protocol: u8,
    checksum: u16,
    src: Address,
    dst: Address
}

impl IPv4 {
    pub fn new() -> header::Header<IPv4> {
        let mut h = header::new::<IPv4>();
        h.set_version(4);
        h.set_ihl((header::size_of::<IPv4>()/4) as u16);
        h.set_total_length(header::size_of::<IPv4>() as u16);
        h
    }
}

impl header::Header<IPv4> {

    pub fn version(&self) -> u16 {
        (util::ntohs(self.header_ref().ihl_v_tos) >> 12) & 0xf
    }

    pub fn set_version(&mut self, version: u16) {
        let h = self.header_mut();
        h.ihl_v_tos &= util::htons(0x0fff);
        h.ihl_v_tos |= util::htons((version & 0xf) << 12);
    }

    pub fn ihl(&self) -> u16 {
        (util::ntohs(self.header_ref().ihl_v_tos) >> 8) & 0xf
    }

    pub fn set_ihl(&mut self, ihl: u16) {
        let h = self.header_mut();
        h.ihl_v_tos &= util::htons(0xf0ff);
        h.ihl_v_tos |= util::htons((ihl & 0xf) << 8);
    }

    pub fn tos(&self) -> u8 {
        (util::ntohs(self.header_ref().ihl_v_tos) & 0xff) as u8
    }

    pub fn set_tos(&mut self, tos: u8) {
        let h = self.header_mut();
        h.ihl_v_tos &= util::htons(0xff00);
        h.ihl_v_tos |= util::htons(tos as u16);
    }

    pub fn total_length(&self) -> u16 {
        util::ntohs(self.header_ref().total_length)
    }

    pub fn set_total_length(&mut self, total_length: u16) {
        self.header_mut().total_length = util::htons(total_length);
    }

    pub fn id(&self) -> u16 {
        util::ntohs(self.header_ref().id)
    }

    pub fn set_id(&mut self, id: u16) {
        self.header_mut().id = util::htons(id);
    }

    pub fn flags(&self) -> u16 {
        (util::ntohs(self.header_ref().frag_off) >> 13) & 0x7
    }

    pub fn set_flags(&mut self, flags: u16) {
        let h = self.header_mut();
        h.frag_off &= util::htons(0x1fff);
        h.frag_off |= util::htons((flags & 0x7) << 13);
    }

    pub fn ttl(&self) -> u8 {
        self.header_ref().ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.header_mut().ttl = ttl;
    }

    pub fn protocol(&self) -> u8 {
        self.header_ref().protocol
    }

    pub fn set_protocol(&mut self, protocol: u8) {
        self.header_mut().protocol = protocol;
    }

    pub fn checksum(&self) -> u16 {
        self.header_ref().checksum
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.header_mut().checksum = checksum;
    }

    pub fn src(&self) -> Address {
        self.header_ref().src
    }

    pub fn set_src(&mut self, address: Address) {
        self.header_mut().src = address;
    }

    pub fn dst(&self) -> Address {
        self.header_ref().dst
    }

    pub fn set_dst(&mut self, address: Address) {
        self.header_mut().dst = address;
    }

    pub fn swap(&mut self) {
        let h = self.header_mut();
        let src = h.src;
        h.src = h.dst;
        h.dst = src;
    }

}

pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn ipv4() {
        let mut ip = IPv4::new();
        ip.set_src(pton("127.1.2.3"));
        ip.set_protocol(PROTOCOL_UDP);
        let mut mem: [u8; 20] = [1; 20];
        let mut ip2 = header::from_mem::<IPv4>(&mut mem);
        ip2.set_dst(pton("127.4.5.6"));
        ip2.set_protocol(PROTOCOL_TCP);
        ip.set_dst(ip2.dst());
        ip.swap();
        assert_eq!(ip.dst(), pton("127.1.2.3"));
        assert_eq!(ip2.protocol(), PROTOCOL_TCP);
    }

    #[test]
    fn tos_survives_ihl_and_version() {
        let mut ip = IPv4::new();
        ip.set_tos(0x2e);
        assert_eq!(ip.version(), 4);
        assert_eq!(ip.ihl(), 5);
        assert_eq!(ip.tos(), 0x2e);
    }
}
