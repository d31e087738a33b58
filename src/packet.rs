use super::util;

// PACKET BUFFER
//
// Owned byte region with a reserved headroom so that pushing a VLAN tag
// ahead of the Ethernet header, or any other small header, does not force
// a reallocation. Modeled on an ofpbuf-style buffer: 'base' is the backing
// allocation, 'data' is the current start offset into it, 'size' is the
// number of live bytes starting at 'data'.
//
//   DP_NETDEV_HEADROOM - minimum headroom reserved by new()
//   PacketBuf::new(capacity) - allocate with default headroom
//   PacketBuf::from_bytes(bytes) - wrap a captured frame with default headroom
//   .reserve(n) - grow the allocation so 'n' more bytes fit past 'size'
//   .push_front(bytes) - prepend into headroom (used by PUSH_VLAN/PUSH_MPLS)
//   .put(bytes) - append bytes after the live region
//   .put_zeros(n) - append n zero bytes
//   .clear() - reset to empty, keep the allocation
//   .as_slice()/.as_mut_slice() - the live region

pub const VLAN_HEADER_LEN: usize = 4;
pub const DP_NETDEV_HEADROOM: usize = 2 + VLAN_HEADER_LEN;

#[derive(Debug)]
pub struct PacketBuf {
    base: Vec<u8>,
    data: usize,
    size: usize,
}

impl PacketBuf {
    pub fn new(capacity: usize) -> PacketBuf {
        let base = vec![0u8; DP_NETDEV_HEADROOM + capacity];
        PacketBuf { base, data: DP_NETDEV_HEADROOM, size: 0 }
    }

    // Wrap a captured frame, as received from a NetDev, with the standard
    // headroom ahead of it so action processing can push tags without
    // reallocating. Captured length is authoritative for sizing.
    pub fn from_bytes(bytes: &[u8]) -> PacketBuf {
        let mut buf = PacketBuf::new(bytes.len());
        buf.put(bytes);
        buf
    }

    pub fn len(&self) -> usize { self.size }

    pub fn headroom_available(&self) -> usize { self.data }

    pub fn tailroom_available(&self) -> usize {
        self.base.len() - self.data - self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.base[self.data..self.data + self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.base[self.data..self.data + self.size]
    }

    // Ensure at least 'n' bytes of tailroom, growing the backing
    // allocation if necessary. Existing live bytes are preserved.
    pub fn reserve(&mut self, n: usize) {
        if self.tailroom_available() >= n { return; }
        let mut grown = vec![0u8; self.data + self.size + n];
        util::copy(&mut grown[self.data..], self.as_slice(), self.size);
        self.base = grown;
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        let at = self.data + self.size;
        util::copy(&mut self.base[at..], bytes, bytes.len());
        self.size += bytes.len();
    }

    pub fn put_zeros(&mut self, n: usize) {
        self.reserve(n);
        let at = self.data + self.size;
        util::fill(&mut self.base[at..at + n], n, 0);
        self.size += n;
    }

    // Prepend 'bytes' ahead of the current live region, consuming
    // headroom. Panics if there isn't enough headroom; callers that push
    // fixed-size tags (VLAN, MPLS) reserve headroom up front via new().
    pub fn push_front(&mut self, bytes: &[u8]) {
        assert!(self.data >= bytes.len(), "not enough headroom");
        self.data -= bytes.len();
        self.size += bytes.len();
        let at = self.data;
        util::copy(&mut self.base[at..], bytes, bytes.len());
    }

    // Remove 'n' bytes from the front of the live region (used by
    // POP_VLAN/POP_MPLS).
    pub fn pull_front(&mut self, n: usize) {
        assert!(n <= self.size);
        self.data += n;
        self.size -= n;
    }

    pub fn clear(&mut self) {
        self.data = DP_NETDEV_HEADROOM.min(self.base.len());
        self.size = 0;
    }

    pub fn clone_buf(&self) -> PacketBuf {
        PacketBuf::from_bytes(self.as_slice())
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn put_and_clear() {
        let mut p = PacketBuf::new(64);
        p.put(&[1, 2, 3, 4]);
        assert_eq!(p.as_slice(), &[1, 2, 3, 4]);
        p.clear();
        assert_eq!(p.len(), 0);
        assert_eq!(p.headroom_available(), DP_NETDEV_HEADROOM);
    }

    #[test]
    fn push_front_uses_headroom() {
        let mut p = PacketBuf::from_bytes(&[0xaa; 14]);
        p.push_front(&[1, 2, 3, 4]);
        assert_eq!(p.len(), 18);
        assert_eq!(&p.as_slice()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn reserve_grows_without_losing_data() {
        let mut p = PacketBuf::from_bytes(&[9u8; 8]);
        p.put(&vec![7u8; 1000]);
        assert_eq!(p.len(), 1008);
        assert_eq!(p.as_slice()[0], 9);
        assert_eq!(p.as_slice()[8], 7);
    }
}
