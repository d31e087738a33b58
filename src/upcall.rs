use super::flow_key::FlowKey;

// UPCALL QUEUE
//
// A fixed ring of MAX_QUEUE_LEN records per queue class. Grounded on the
// same head/tail wraparound discipline as a simple software ring buffer:
// push fails once full rather than overwriting, pop fails once empty.
// Structural mutation (push/pop/purge) is serialized by the datapath's
// table lock, which is why this type itself carries no internal lock.

pub const MAX_QUEUE_LEN: u32 = 128;
pub const QUEUE_MASK: u32 = MAX_QUEUE_LEN - 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueClass {
    Miss,
    Action,
}

pub struct UpcallRecord {
    pub class: QueueClass,
    pub key: FlowKey,
    pub userdata: Option<Vec<u8>>,
    pub packet: Vec<u8>,
}

pub struct UpcallQueue {
    slots: Vec<Option<UpcallRecord>>,
    head: u32,
    tail: u32,
}

impl UpcallQueue {
    pub fn new() -> UpcallQueue {
        let mut slots = Vec::with_capacity(MAX_QUEUE_LEN as usize);
        slots.resize_with(MAX_QUEUE_LEN as usize, || None);
        UpcallQueue { slots, head: 0, tail: 0 }
    }

    pub fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_QUEUE_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    // Returns Err(()) if the queue is full; caller maps that to NO_BUFFER
    // and bumps n_lost.
    pub fn push(&mut self, record: UpcallRecord) -> Result<(), ()> {
        if self.is_full() { return Err(()); }
        let idx = (self.head & QUEUE_MASK) as usize;
        self.slots[idx] = Some(record);
        self.head = self.head.wrapping_add(1);
        Ok(())
    }

    // Returns None if empty; caller maps that to RETRY.
    pub fn pop(&mut self) -> Option<UpcallRecord> {
        if self.is_empty() { return None; }
        let idx = (self.tail & QUEUE_MASK) as usize;
        let record = self.slots[idx].take();
        self.tail = self.tail.wrapping_add(1);
        record
    }

    pub fn purge(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn record() -> UpcallRecord {
        UpcallRecord { class: QueueClass::Miss, key: FlowKey::default(), userdata: None, packet: vec![] }
    }

    #[test]
    fn fifo_order() {
        let mut q = UpcallQueue::new();
        for i in 0..3 {
            let mut r = record();
            r.packet = vec![i as u8];
            q.push(r).unwrap();
        }
        assert_eq!(q.pop().unwrap().packet, vec![0]);
        assert_eq!(q.pop().unwrap().packet, vec![1]);
        assert_eq!(q.pop().unwrap().packet, vec![2]);
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_returns_err_without_growing() {
        let mut q = UpcallQueue::new();
        for _ in 0..MAX_QUEUE_LEN {
            q.push(record()).unwrap();
        }
        assert!(q.push(record()).is_err());
        assert_eq!(q.len(), MAX_QUEUE_LEN);
    }

    #[test]
    fn purge_drains_everything() {
        let mut q = UpcallQueue::new();
        for _ in 0..10 {
            q.push(record()).unwrap();
        }
        q.purge();
        assert!(q.is_empty());
    }
}
