use super::flow_key::TunnelKey;
use super::packet::PacketBuf;
use crate::error::{DpError, DpResult};
use crate::util;

use std::collections::VecDeque;
use std::ffi;
use std::mem;

pub const MAX_PORTS: usize = 256;
pub const LOCAL_PORT_NO: u32 = 0;

// A netdev is whatever a port forwards packets through: a raw socket bound
// to a physical interface, a tunnel vport, or (in tests) an in-memory
// queue. recv/send return RETRY rather than blocking when nothing is
// available, matching the non-blocking discipline the worker's poll loop
// expects.
pub trait NetDev: Send {
    fn get_type(&self) -> &str;
    fn get_mtu(&self) -> usize { 1500 }
    fn poll_fd(&self) -> Option<i32> { None }
    fn recv(&mut self) -> DpResult<PacketBuf>;
    // `tunnel` is the per-packet tunnel-key descriptor off the flow key
    // that produced `buf`, when one is present. Most netdevs ignore it;
    // a tunnel vport (GRE) requires it.
    fn send(&mut self, buf: &PacketBuf, tunnel: Option<&TunnelKey>) -> DpResult<()>;
    fn recv_wait(&self) {}
    // Devices with no notion of promiscuous mode (a dummy queue, a GRE
    // vport) just accept it.
    fn turn_flags_on(&mut self, _promisc: bool) -> DpResult<()> { Ok(()) }
}

pub struct Port {
    pub port_no: u32,
    pub name: String,
    pub port_type: String,
    pub netdev: Box<dyn NetDev>,
}

impl Port {
    pub fn new(port_no: u32, name: String, port_type: String, netdev: Box<dyn NetDev>) -> Port {
        Port { port_no, name, port_type, netdev }
    }
}

// CHOOSE_PORT NUMBERING POLICY
//
// Only applied for a non-default class: a "br"-prefixed name starts the
// search at 100 (so tests can predict port numbers); the first run of
// ASCII digits anywhere in the name is then tried as an offset from that
// start. Only that one candidate is tried (matching the original's
// probe-then-break on the first digit found); if it's zero, taken, or out
// of range, or the class is the default one, the lowest free slot in
// [1, MAX_PORTS) is used instead. Port 0 is reserved for LOCAL and is
// never handed out here.
pub fn choose_port_number(name: &str, is_default_class: bool, is_free: impl Fn(u32) -> bool) -> Option<u32> {
    if !is_default_class {
        let start_no: u32 = if name.starts_with("br") { 100 } else { 0 };
        if let Some(digit_start) = name.find(|c: char| c.is_ascii_digit()) {
            let digits: String = name[digit_start..].chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<u32>() {
                let port_no = start_no + n;
                if port_no > 0 && (port_no as usize) < MAX_PORTS && is_free(port_no) {
                    return Some(port_no);
                }
            }
        }
    }
    (1..MAX_PORTS as u32).find(|&n| is_free(n))
}

// IN-MEMORY TEST DOUBLE

pub struct DummyNetDev {
    inbox: VecDeque<PacketBuf>,
    sent: VecDeque<PacketBuf>,
    mtu: usize,
}

impl DummyNetDev {
    pub fn new() -> DummyNetDev {
        DummyNetDev { inbox: VecDeque::new(), sent: VecDeque::new(), mtu: 1500 }
    }

    pub fn queue_rx(&mut self, buf: PacketBuf) {
        self.inbox.push_back(buf);
    }

    pub fn take_tx(&mut self) -> Option<PacketBuf> {
        self.sent.pop_front()
    }
}

impl NetDev for DummyNetDev {
    fn get_type(&self) -> &str { "dummy" }
    fn get_mtu(&self) -> usize { self.mtu }

    fn recv(&mut self) -> DpResult<PacketBuf> {
        self.inbox.pop_front().ok_or(DpError::Retry)
    }

    fn send(&mut self, buf: &PacketBuf, _tunnel: Option<&TunnelKey>) -> DpResult<()> {
        self.sent.push_back(buf.clone_buf());
        Ok(())
    }
}

// AF_PACKET RAW SOCKET, bound to a named Linux interface.

pub struct RawSocketNetDev {
    sock: i32,
    ifname: String,
}

impl RawSocketNetDev {
    pub fn open(ifname: &str) -> DpResult<RawSocketNetDev> {
        let index = unsafe { libc::if_nametoindex(cstr(ifname).as_ptr()) };
        if index == 0 {
            return Err(DpError::Invalid);
        }
        let proto_eth = util::htons(libc::ETH_P_ALL as u16) as i32;
        let sock = unsafe {
            libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_NONBLOCK, proto_eth)
        };
        if sock == -1 {
            return Err(DpError::Fatal);
        }
        unsafe {
            let addr = libc::sockaddr_ll {
                sll_family: libc::AF_PACKET as u16,
                sll_ifindex: index as i32,
                sll_protocol: proto_eth as u16,
                sll_addr: [0; 8],
                sll_hatype: 0,
                sll_halen: 0,
                sll_pkttype: 0,
            };
            let sa = &addr as *const libc::sockaddr_ll as *const libc::sockaddr;
            let addrlen = mem::size_of::<libc::sockaddr_ll>() as u32;
            if libc::bind(sock, sa, addrlen) == -1 {
                libc::close(sock);
                return Err(DpError::Fatal);
            }
        }
        Ok(RawSocketNetDev { sock, ifname: ifname.to_string() })
    }
}

impl NetDev for RawSocketNetDev {
    fn get_type(&self) -> &str { "system" }

    fn poll_fd(&self) -> Option<i32> { Some(self.sock) }

    fn recv(&mut self) -> DpResult<PacketBuf> {
        let mut scratch = [0u8; 1 << 16];
        let read = unsafe {
            libc::read(self.sock, scratch.as_mut_ptr() as *mut ffi::c_void, scratch.len())
        };
        if read < 0 {
            return Err(if errno() == libc::EAGAIN { DpError::Retry } else { DpError::TransientIo });
        }
        Ok(PacketBuf::from_bytes(&scratch[..read as usize]))
    }

    fn send(&mut self, buf: &PacketBuf, _tunnel: Option<&TunnelKey>) -> DpResult<()> {
        let bytes = buf.as_slice();
        let written = unsafe {
            libc::write(self.sock, bytes.as_ptr() as *const ffi::c_void, bytes.len())
        };
        if written as usize != bytes.len() {
            return Err(if errno() == libc::EAGAIN { DpError::Retry } else { DpError::TransientIo });
        }
        Ok(())
    }

    fn turn_flags_on(&mut self, promisc: bool) -> DpResult<()> {
        if promisc { set_promisc(self.sock, &self.ifname) } else { Ok(()) }
    }
}

impl Drop for RawSocketNetDev {
    fn drop(&mut self) {
        unsafe { libc::close(self.sock); }
    }
}

fn cstr(s: &str) -> ffi::CString {
    ffi::CString::new(s).expect("ifname contains NUL")
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

// ifreq is ifr_name[IFNAMSIZ] followed by a union whose largest member on
// Linux is a sockaddr (16 bytes); ifr_flags lives at the start of that
// union. A plain byte buffer of that size is enough for SIOCGIFFLAGS /
// SIOCSIFFLAGS, which only ever touch the name and the flags short.
const IFREQ_SIZE: usize = libc::IFNAMSIZ + 16;

fn set_promisc(sock: i32, ifname: &str) -> DpResult<()> {
    let mut req = [0u8; IFREQ_SIZE];
    let name = ifname.as_bytes();
    let n = name.len().min(libc::IFNAMSIZ - 1);
    req[..n].copy_from_slice(&name[..n]);

    if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS, req.as_mut_ptr()) } == -1 {
        return Err(DpError::Fatal);
    }
    let mut flags = i16::from_ne_bytes([req[libc::IFNAMSIZ], req[libc::IFNAMSIZ + 1]]);
    flags |= libc::IFF_PROMISC as i16;
    req[libc::IFNAMSIZ..libc::IFNAMSIZ + 2].copy_from_slice(&flags.to_ne_bytes());

    if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS, req.as_mut_ptr()) } == -1 {
        return Err(DpError::Fatal);
    }
    Ok(())
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn dummy_roundtrip() {
        let mut dev = DummyNetDev::new();
        dev.queue_rx(PacketBuf::from_bytes(&[1, 2, 3]));
        let got = dev.recv().unwrap();
        assert_eq!(got.as_slice(), &[1, 2, 3]);
        assert_eq!(dev.recv().unwrap_err(), DpError::Retry);

        dev.send(&PacketBuf::from_bytes(&[9, 9]), None).unwrap();
        assert_eq!(dev.take_tx().unwrap().as_slice(), &[9, 9]);
    }

    #[test]
    fn br_prefixed_name_adds_number_to_100() {
        let taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let n = choose_port_number("br5", false, |p| !taken.contains(&p));
        assert_eq!(n, Some(105));
    }

    #[test]
    fn br_policy_only_applies_to_non_default_class() {
        let taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let n = choose_port_number("br5", true, |p| !taken.contains(&p));
        assert_eq!(n, Some(1));
    }

    #[test]
    fn first_digit_run_preferred_when_free() {
        let taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let n = choose_port_number("eth7", false, |p| !taken.contains(&p));
        assert_eq!(n, Some(7));
    }

    #[test]
    fn first_digit_run_not_trailing_digit_run() {
        // The first digit run is "0", not the trailing "2"; port 0 is
        // reserved for LOCAL, so this falls through to the lowest free
        // slot rather than trying port 2.
        let taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let n = choose_port_number("eth0v2", false, |p| !taken.contains(&p));
        assert_eq!(n, Some(1));
    }

    #[test]
    fn falls_back_to_lowest_free_slot() {
        let taken: std::collections::HashSet<u32> = [1, 2, 3].iter().copied().collect();
        let n = choose_port_number("vethxyz", false, |p| !taken.contains(&p));
        assert_eq!(n, Some(4));
    }
}
