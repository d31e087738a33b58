use std::cmp;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use core::ffi;

// Shared small helpers: byte copying, byte-order conversion, and a
// rate limiter for the "rate-limited logged" error paths.

pub fn fill(dst: &mut [u8], len: usize, val: u8) {
    unsafe {
        ptr::write_bytes(dst.as_mut_ptr(), val, cmp::min(len, dst.len()));
    }
}

pub fn copy(dst: &mut [u8], src: &[u8], len: usize) {
    unsafe {
        ptr::copy(src.as_ptr(), dst.as_mut_ptr(),
                  cmp::min(len, cmp::min(src.len(), dst.len())));
    }
}

#[cfg(target_endian = "little")] pub fn htonl(l: u32) -> u32 { l.swap_bytes() }
#[cfg(target_endian = "little")] pub fn ntohl(l: u32) -> u32 { l.swap_bytes() }
#[cfg(target_endian = "little")] pub fn htons(s: u16) -> u16 { s.swap_bytes() }
#[cfg(target_endian = "little")] pub fn ntohs(s: u16) -> u16 { s.swap_bytes() }
#[cfg(target_endian = "big"   )] pub fn htonl(l: u32) -> u32 { l }
#[cfg(target_endian = "big"   )] pub fn ntohl(l: u32) -> u32 { l }
#[cfg(target_endian = "big"   )] pub fn htons(s: u16) -> u16 { s }
#[cfg(target_endian = "big"   )] pub fn ntohs(s: u16) -> u16 { s }

// Fill slice with random bytes.
pub fn random_bytes(dst: &mut [u8], n: usize) {
    let n = cmp::min(n, dst.len());
    if unsafe {
        libc::getrandom(dst.as_mut_ptr() as *mut ffi::c_void, n, 0)
    } != n as isize { panic!("getrandom(2) failed"); }
}

// Monotonic milliseconds since an arbitrary epoch, for flow 'used' stamps.
pub fn now_msec() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts); }
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

// A crude token-bucket rate limiter guarding a single log call site,
// grounded on OVS's per-site VLOG_WARN_RL rate limiters: one site gets
// to fire at most once per `interval_msec`, everything in between is
// dropped rather than queued.
pub struct RateLimit {
    interval_msec: u64,
    last: AtomicU64,
}

impl RateLimit {
    pub const fn new(interval_msec: u64) -> RateLimit {
        RateLimit { interval_msec, last: AtomicU64::new(0) }
    }

    pub fn allow(&self) -> bool {
        let now = now_msec();
        let last = self.last.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.interval_msec {
            self.last.store(now, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn byte_order_roundtrip() {
        assert_eq!(ntohs(htons(0x1234)), 0x1234);
        assert_eq!(ntohl(htonl(0x1122_3344)), 0x1122_3344);
    }

    #[test]
    fn rate_limit_fires_once_then_throttles() {
        let rl = RateLimit::new(60_000);
        assert!(rl.allow());
        assert!(!rl.allow());
    }
}
