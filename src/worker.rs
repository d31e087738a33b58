use super::datapath::Datapath;
use super::registry;
use crate::util::RateLimit;

use signal_hook::consts::signal::{SIGALRM, SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_TIMEOUT_MS: i32 = 2_000;
const DISPATCH_BATCH: usize = 50;

static DISPATCH_ERROR_RL: RateLimit = RateLimit::new(1_000);

// ShutdownFlag masks TERM/INT/HUP/ALRM in the worker: the signal handler
// only flips an atomic, the worker observes it between datapaths and
// exits its loop, letting the main thread join it.
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn install() -> ShutdownFlag {
        let flag = Arc::new(AtomicBool::new(false));
        for sig in [SIGTERM, SIGINT, SIGHUP, SIGALRM] {
            signal_flag::register(sig, Arc::clone(&flag)).expect("cannot register signal handler");
        }
        ShutdownFlag { flag }
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn raise(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

// Spawns the dedicated I/O worker thread. The calling thread retains
// `shutdown` to request a stop and should join the returned handle.
pub fn spawn(shutdown: Arc<ShutdownFlag>) -> thread::JoinHandle<()> {
    thread::spawn(move || run(&shutdown))
}

fn run(shutdown: &ShutdownFlag) {
    while !shutdown.requested() {
        let datapaths = registry::snapshot();

        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut owners: Vec<(usize, u32)> = Vec::new(); // (datapath index, port_no)
        for (dp_idx, dp) in datapaths.iter().enumerate() {
            for (port_no, fd) in dp.pollable_ports() {
                fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
                owners.push((dp_idx, port_no));
            }
        }

        if fds.is_empty() {
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = unsafe { *libc::__errno_location() };
            if err == libc::EINTR { continue; }
            break; // any other poll() failure is fatal to the worker
        }
        if rc == 0 { continue; }

        for (i, pfd) in fds.iter().enumerate() {
            if pfd.revents & libc::POLLIN == 0 { continue; }
            let (dp_idx, port_no) = owners[i];
            let dp = &datapaths[dp_idx];
            dispatch_batch(dp, port_no);
            if shutdown.requested() { break; }
        }
    }
}

fn dispatch_batch(dp: &Datapath, port_no: u32) {
    for _ in 0..DISPATCH_BATCH {
        match dp.recv_from_port(port_no) {
            Ok(buf) => dp.port_input(port_no, buf),
            Err(crate::error::DpError::Retry) => break,
            Err(_) => {
                if DISPATCH_ERROR_RL.allow() {
                    log::warn!("dispatch error on port {}", port_no);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn shutdown_flag_starts_clear() {
        let s = ShutdownFlag::install();
        assert!(!s.requested());
        s.raise();
        assert!(s.requested());
    }
}
