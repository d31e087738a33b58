use super::actions::{self, ActionContext};
use super::flow_key::{self, FlowKey, TransportKey};
use super::flow_table::{FlowStats, FlowTable, PutResult};
use super::packet::PacketBuf;
use super::port::{self, NetDev, Port, MAX_PORTS};
use super::registry;
use super::upcall::{QueueClass, UpcallQueue, UpcallRecord};
use crate::error::{DpError, DpResult};

use std::ffi;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub const FP_CREATE: u32 = 1 << 0;
pub const FP_MODIFY: u32 = 1 << 1;
pub const FP_ZERO_STATS: u32 = 1 << 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub n_flows: usize,
    pub n_hit: u64,
    pub n_missed: u64,
    pub n_lost: u64,
}

#[derive(Clone, Debug)]
pub struct PortInfo {
    pub port_no: u32,
    pub name: String,
    pub port_type: String,
    pub mtu: usize,
}

struct PortSet {
    slots: Vec<Option<Port>>,
    list: Vec<u32>,
    serial: u64,
}

impl PortSet {
    fn new() -> PortSet {
        let mut slots = Vec::with_capacity(MAX_PORTS);
        slots.resize_with(MAX_PORTS, || None);
        PortSet { slots, list: Vec::new(), serial: 0 }
    }

    fn is_free(&self, n: u32) -> bool {
        (n as usize) < MAX_PORTS && self.slots[n as usize].is_none()
    }
}

// Each datapath is the sole owner of its ports and flow table; a handle
// (an Arc<Datapath> from registry::open) is a non-owning reference whose
// holder may cache a port-set serial for port_poll.
pub struct Datapath {
    name: String,
    class: String,
    open_cnt: AtomicU32,
    destroyed: AtomicBool,
    ports: Mutex<PortSet>,
    flow_table: FlowTable,
    queues: [Mutex<UpcallQueue>; 2],
    n_hit: AtomicU64,
    n_missed: AtomicU64,
    n_lost: AtomicU64,
    wake_read: i32,
    wake_write: i32,
}

impl Datapath {
    pub(crate) fn new(class: &str, name: &str) -> Datapath {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert!(rc == 0, "cannot create datapath wake-up pipe");

        let mut ports = PortSet::new();
        let local = Port::new(0, name.to_string(), "internal".to_string(), Box::new(port::DummyNetDev::new()));
        ports.slots[0] = Some(local);
        ports.list.push(0);
        ports.serial = 1;

        Datapath {
            name: name.to_string(),
            class: class.to_string(),
            open_cnt: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
            ports: Mutex::new(ports),
            flow_table: FlowTable::new(),
            queues: [Mutex::new(UpcallQueue::new()), Mutex::new(UpcallQueue::new())],
            n_hit: AtomicU64::new(0),
            n_missed: AtomicU64::new(0),
            n_lost: AtomicU64::new(0),
            wake_read: fds[0],
            wake_write: fds[1],
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn class(&self) -> &str { &self.class }

    pub(crate) fn bump_open_cnt(&self) {
        self.open_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        let remaining = self.open_cnt.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.destroyed.load(Ordering::SeqCst) {
            registry::forget(&self.name);
        }
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            n_flows: self.flow_table.count(),
            n_hit: self.n_hit.load(Ordering::Relaxed),
            n_missed: self.n_missed.load(Ordering::Relaxed),
            n_lost: self.n_lost.load(Ordering::Relaxed),
        }
    }

    fn serial(&self) -> u64 {
        self.ports.lock().unwrap().serial
    }

    // PORTS

    pub fn port_add(
        &self,
        name: &str,
        port_type: &str,
        mut netdev: Box<dyn NetDev>,
        requested: Option<u32>,
    ) -> DpResult<u32> {
        netdev.turn_flags_on(true)?;

        let is_default_class = self.class == registry::DEFAULT_CLASS;
        let mut ports = self.ports.lock().unwrap();
        let port_no = match requested {
            Some(n) => {
                if (n as usize) >= MAX_PORTS { return Err(DpError::TooBig); }
                if !ports.is_free(n) { return Err(DpError::Busy); }
                n
            }
            None => port::choose_port_number(name, is_default_class, |n| ports.is_free(n))
                .ok_or(DpError::TooBig)?,
        };
        ports.slots[port_no as usize] = Some(Port::new(port_no, name.to_string(), port_type.to_string(), netdev));
        ports.list.push(port_no);
        ports.list.sort_unstable();
        ports.serial += 1;
        Ok(port_no)
    }

    pub fn port_del(&self, port_no: u32) -> DpResult<()> {
        if port_no == port::LOCAL_PORT_NO {
            return Err(DpError::Invalid);
        }
        let mut ports = self.ports.lock().unwrap();
        if (port_no as usize) >= MAX_PORTS || ports.slots[port_no as usize].is_none() {
            return Err(DpError::NoEntry);
        }
        ports.slots[port_no as usize] = None;
        ports.list.retain(|&n| n != port_no);
        ports.serial += 1;
        Ok(())
    }

    pub fn port_query_by_number(&self, port_no: u32) -> DpResult<PortInfo> {
        let ports = self.ports.lock().unwrap();
        let port = ports.slots.get(port_no as usize).and_then(|p| p.as_ref()).ok_or(DpError::NoEntry)?;
        Ok(PortInfo {
            port_no: port.port_no,
            name: port.name.clone(),
            port_type: port.port_type.clone(),
            mtu: port.netdev.get_mtu(),
        })
    }

    pub fn port_query_by_name(&self, name: &str) -> DpResult<PortInfo> {
        let ports = self.ports.lock().unwrap();
        let port = ports.slots.iter().flatten().find(|p| p.name == name).ok_or(DpError::NoEntry)?;
        Ok(PortInfo {
            port_no: port.port_no,
            name: port.name.clone(),
            port_type: port.port_type.clone(),
            mtu: port.netdev.get_mtu(),
        })
    }

    pub fn port_dump_start(&self) -> PortCursor {
        let list = self.ports.lock().unwrap().list.clone();
        PortCursor { list, pos: 0 }
    }

    pub fn port_dump_next(&self, cursor: &mut PortCursor) -> Option<PortInfo> {
        while cursor.pos < cursor.list.len() {
            let no = cursor.list[cursor.pos];
            cursor.pos += 1;
            if let Ok(info) = self.port_query_by_number(no) {
                return Some(info);
            }
        }
        None
    }

    // Returns NoBuffer the first time this client observes a port-set
    // mutation since its last poll, Retry otherwise. Never an error in
    // the ordinary sense; this is OVS's notify-via-errno convention.
    pub fn port_poll(&self, client: &PortPollClient) -> DpError {
        let current = self.serial();
        let cached = client.cached_serial.swap(current, Ordering::SeqCst);
        if cached != current { DpError::NoBuffer } else { DpError::Retry }
    }

    fn output_port(&self, port_no: u32, key: &FlowKey, buf: &PacketBuf) {
        let mut ports = self.ports.lock().unwrap();
        if let Some(Some(port)) = ports.slots.get_mut(port_no as usize) {
            let _ = port.netdev.send(buf, key.tunnel.as_ref());
        }
        // Stale/absent slot: drop silently, per the tolerate-stale-OUTPUT
        // resolution rather than snapshotting ports per batch.
    }

    // FLOWS

    pub fn flow_get(&self, key_attrs: &[u8]) -> DpResult<(Vec<u8>, FlowStats)> {
        let key = flow_key::key_to_flow(key_attrs)?;
        let entry = self.flow_table.lookup(&key).ok_or(DpError::NoEntry)?;
        let actions = entry.actions.lock().unwrap().clone();
        Ok((actions, entry.snapshot()))
    }

    pub fn flow_put(&self, flags: u32, key_attrs: &[u8], action_attrs: Vec<u8>) -> DpResult<FlowStats> {
        let key = flow_key::key_to_flow(key_attrs)?;
        let create = flags & FP_CREATE != 0;
        let modify = flags & FP_MODIFY != 0;
        let result = self.flow_table.put(key, action_attrs, create, modify)?;
        let entry = match result {
            PutResult::Created(e) => e,
            PutResult::Modified(e) => e,
        };
        let stats = entry.snapshot();
        if flags & FP_ZERO_STATS != 0 {
            entry.zero_stats();
        }
        Ok(stats)
    }

    pub fn flow_del(&self, key_attrs: &[u8]) -> DpResult<FlowStats> {
        let key = flow_key::key_to_flow(key_attrs)?;
        let entry = self.flow_table.remove(&key).ok_or(DpError::NoEntry)?;
        Ok(entry.snapshot())
    }

    pub fn flow_dump_start(&self) -> FlowCursor {
        FlowCursor { inner: self.flow_table.dump_start() }
    }

    pub fn flow_dump_next(&self, cursor: &mut FlowCursor) -> Option<(Vec<u8>, Vec<u8>, FlowStats)> {
        let (key, entry) = cursor.inner.next(&self.flow_table)?;
        let key_bytes = flow_key::key_from_flow(&key);
        let actions = entry.actions.lock().unwrap().clone();
        Some((key_bytes, actions, entry.snapshot()))
    }

    // PACKET INGRESS

    pub fn port_input(&self, in_port: u32, buf: PacketBuf) {
        let mut key = match flow_key::flow_extract(&buf, in_port, None) {
            Ok(k) => k,
            Err(_) => return,
        };
        if let Some(entry) = self.flow_table.lookup(&key) {
            entry.record_hit(buf.len() as u64, tcp_flags_of(&key));
            let action_bytes = entry.actions.lock().unwrap().clone();
            let mut runner = ActionRunner { dp: self };
            let mut mbuf = buf;
            actions::execute(&mut runner, &mut mbuf, &mut key, &action_bytes);
            self.n_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.n_missed.fetch_add(1, Ordering::Relaxed);
            self.enqueue(QueueClass::Miss, key, None, buf.as_slice().to_vec());
        }
    }

    fn enqueue(&self, class: QueueClass, key: FlowKey, userdata: Option<Vec<u8>>, packet: Vec<u8>) {
        let idx = class as usize;
        let mut q = self.queues[idx].lock().unwrap();
        let record = UpcallRecord { class, key, userdata, packet };
        match q.push(record) {
            Ok(()) => self.wake(),
            Err(()) => { self.n_lost.fetch_add(1, Ordering::Relaxed); }
        }
    }

    fn wake(&self) {
        let byte = [0u8; 1];
        unsafe { libc::write(self.wake_write, byte.as_ptr() as *const ffi::c_void, 1); }
    }

    fn drain_wake(&self) {
        let mut byte = [0u8; 1];
        unsafe { libc::read(self.wake_read, byte.as_mut_ptr() as *mut ffi::c_void, 1); }
    }

    // recv(): pops the first nonempty queue in fixed class order.
    pub fn recv(&self) -> DpResult<UpcallRecord> {
        for class in [QueueClass::Miss, QueueClass::Action] {
            let mut q = self.queues[class as usize].lock().unwrap();
            if let Some(record) = q.pop() {
                drop(q);
                self.drain_wake();
                return Ok(record);
            }
        }
        Err(DpError::Retry)
    }

    pub fn recv_wait_fd(&self) -> i32 {
        self.wake_read
    }

    // CONTROL-PLANE EXECUTE
    //
    // Deep-copies the packet into a fresh DP_NETDEV_HEADROOM buffer,
    // extracts the canonical key, then overlays it with the supplied
    // attributes before running the action engine.
    pub fn execute(&self, packet: &[u8], key_attrs: &[u8], action_attrs: &[u8]) -> DpResult<()> {
        let mut buf = PacketBuf::from_bytes(packet);
        let mut key = flow_key::flow_extract(&buf, 0, None)?;
        flow_key::overlay_from_attrs(&mut key, key_attrs)?;
        let mut runner = ActionRunner { dp: self };
        actions::execute(&mut runner, &mut buf, &mut key, action_attrs);
        Ok(())
    }

    // Poll descriptor list for the I/O worker: (port_no, fd) for every
    // port whose netdev exposes one.
    pub(crate) fn pollable_ports(&self) -> Vec<(u32, i32)> {
        let ports = self.ports.lock().unwrap();
        ports.slots.iter().flatten()
            .filter_map(|p| p.netdev.poll_fd().map(|fd| (p.port_no, fd)))
            .collect()
    }

    pub(crate) fn recv_from_port(&self, port_no: u32) -> DpResult<PacketBuf> {
        let mut ports = self.ports.lock().unwrap();
        match ports.slots.get_mut(port_no as usize) {
            Some(Some(port)) => port.netdev.recv(),
            _ => Err(DpError::Retry),
        }
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

fn tcp_flags_of(key: &FlowKey) -> u8 {
    match &key.transport {
        Some(TransportKey::Tcp { flags, .. }) => *flags,
        _ => 0,
    }
}

pub struct PortPollClient {
    cached_serial: AtomicU64,
}

impl PortPollClient {
    pub fn new(dp: &Datapath) -> PortPollClient {
        PortPollClient { cached_serial: AtomicU64::new(dp.serial()) }
    }
}

pub struct PortCursor {
    list: Vec<u32>,
    pos: usize,
}

pub struct FlowCursor {
    inner: super::flow_table::Cursor,
}

// Binds the action engine to one Datapath for the duration of a single
// execute() call. A fresh value every call sidesteps the fact that
// Datapath itself is always shared (Arc<Datapath>) and so never handed
// out as &mut.
struct ActionRunner<'a> {
    dp: &'a Datapath,
}

impl<'a> ActionContext for ActionRunner<'a> {
    fn output(&mut self, port_no: u32, key: &FlowKey, buf: &PacketBuf) {
        self.dp.output_port(port_no, key, buf);
    }

    fn enqueue_userspace(&mut self, key: &FlowKey, userdata: Option<&[u8]>, buf: &PacketBuf) {
        self.dp.enqueue(
            QueueClass::Action,
            key.clone(),
            userdata.map(|u| u.to_vec()),
            buf.as_slice().to_vec(),
        );
    }

    fn random_u32(&mut self) -> u32 {
        rand::random()
    }
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::attr;
    use crate::ethernet::{self, Ethernet};
    use crate::header;
    use crate::port::DummyNetDev;

    fn frame(src: [u8; 6], dst: [u8; 6]) -> Vec<u8> {
        let mut eth = header::new::<Ethernet>();
        eth.set_src(&src);
        eth.set_dst(&dst);
        eth.set_ethertype(ethernet::TYPE_IPV4);
        let mut buf = vec![0u8; header::size_of::<Ethernet>() + 46];
        eth.copy(&mut buf);
        buf
    }

    #[test]
    fn miss_then_install_then_hit() {
        registry::register_dummy_class("dummy-test");
        let dp = Datapath::new(registry::DEFAULT_CLASS, "scenario-s1");
        dp.port_add("p1", "dummy", Box::new(DummyNetDev::new()), Some(1)).unwrap();

        let raw = frame([0, 1, 2, 3, 4, 5], [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        dp.port_input(1, PacketBuf::from_bytes(&raw));
        assert_eq!(dp.get_stats().n_missed, 1);

        let upcall = dp.recv().unwrap();
        assert_eq!(upcall.class, QueueClass::Miss);
        assert_eq!(upcall.key.in_port, 1);

        let mut actions = Vec::new();
        attr::put_u32(&mut actions, actions::ACTION_OUTPUT, 2);
        let key_bytes = flow_key::key_from_flow(&upcall.key);
        dp.flow_put(FP_CREATE, &key_bytes, actions).unwrap();

        dp.port_add("p2", "dummy", Box::new(DummyNetDev::new()), Some(2)).unwrap();
        dp.port_input(1, PacketBuf::from_bytes(&raw));
        assert_eq!(dp.get_stats().n_hit, 1);
        assert_eq!(dp.flow_get(&key_bytes).unwrap().1.packet_count, 1);
    }

    #[test]
    fn port_del_rejects_local() {
        let dp = Datapath::new(registry::DEFAULT_CLASS, "scenario-local");
        assert_eq!(dp.port_del(0).unwrap_err(), DpError::Invalid);
    }

    #[test]
    fn port_poll_fires_once_per_mutation() {
        let dp = Datapath::new(registry::DEFAULT_CLASS, "scenario-s4");
        let client = PortPollClient::new(&dp);
        assert_eq!(dp.port_poll(&client), DpError::Retry);
        dp.port_add("p1", "dummy", Box::new(DummyNetDev::new()), Some(1)).unwrap();
        assert_eq!(dp.port_poll(&client), DpError::NoBuffer);
        assert_eq!(dp.port_poll(&client), DpError::Retry);
    }

    #[test]
    fn upcall_overflow_counts_n_lost() {
        let dp = Datapath::new(registry::DEFAULT_CLASS, "scenario-s3");
        dp.port_add("p1", "dummy", Box::new(DummyNetDev::new()), Some(1)).unwrap();
        let raw = frame([0, 1, 2, 3, 4, 5], [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        for _ in 0..(super::super::upcall::MAX_QUEUE_LEN + 10) {
            dp.port_input(1, PacketBuf::from_bytes(&raw));
        }
        let stats = dp.get_stats();
        assert_eq!(stats.n_missed, (super::super::upcall::MAX_QUEUE_LEN + 10) as u64);
        assert_eq!(stats.n_lost, 10);
    }
}
