use super::util;
use super::header;

// 802.1Q VLAN tag, inserted between the Ethernet addresses and the
// ethertype by PUSH_VLAN and removed by POP_VLAN.
//
//   Vlan - struct for an 802.1Q tag (tpid + tci)
//   Header<Vlan>.tci() -> u16 - get tag control information
//   Header<Vlan>.set_tci(u16) - set tag control information
//   Header<Vlan>.tpid() -> u16 - get tag protocol id (0x8100)
//   TPID - const u16 the standard 802.1Q tag protocol id

pub const TPID: u16 = 0x8100;

#[repr(C, packed)]
#[derive(Default)]
pub struct Vlan {
    tpid: u16,
    tci: u16,
}

impl Vlan {
    pub fn new(tci: u16) -> header::Header<Vlan> {
        let mut h = header::new::<Vlan>();
        h.header_mut().tpid = util::htons(TPID);
        h.set_tci(tci);
        h
    }
}

impl header::Header<Vlan> {
    pub fn tpid(&self) -> u16 {
        util::ntohs(self.header_ref().tpid)
    }

    pub fn tci(&self) -> u16 {
        util::ntohs(self.header_ref().tci)
    }

    pub fn set_tci(&mut self, tci: u16) {
        self.header_mut().tci = util::htons(tci);
    }

    pub fn vid(&self) -> u16 {
        self.tci() & 0x0fff
    }

    pub fn pcp(&self) -> u16 {
        (self.tci() >> 13) & 0x7
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn vid_and_pcp() {
        let tag = Vlan::new((5 << 13) | 42);
        assert_eq!(tag.tpid(), TPID);
        assert_eq!(tag.vid(), 42);
        assert_eq!(tag.pcp(), 5);
    }
}
