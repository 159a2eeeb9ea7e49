//! Per-thread perf-event call-stack sampler
//!
//! One sampler per kernel-launching thread: a software cpu-clock event with
//! callchain sampling, read through the perf mmap ring. Symbols are
//! resolved structurally (no backtrace-line string splitting) and demangled
//! before they reach the attribution engine.

use anyhow::{Context, Result};
use std::sync::atomic;
use tracing::debug;

// Stable perf ABI values (linux/perf_event.h).
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_TIME: u64 = 1 << 2;
const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
const PERF_RECORD_SAMPLE: u32 = 9;
const PERF_ATTR_FLAG_DISABLED: u64 = 1;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
/// Callchain context markers (PERF_CONTEXT_*) live at the top of the range,
/// from PERF_CONTEXT_MAX (-4095) upward.
const PERF_CONTEXT_FLOOR: u64 = 0xffff_ffff_ffff_f000;

/// perf_event_attr, sized to PERF_ATTR_SIZE_VER6 (120 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
    aux_sample_size: u32,
    reserved_3: u32,
}

/// Leading metadata page of the perf mmap region. Only `data_head` is
/// read; the rest pins the kernel ABI layout.
#[repr(C)]
#[allow(dead_code)]
struct PerfMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

fn perf_event_open(attr: &PerfEventAttr, pid: libc::pid_t) -> i32 {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            -1 as libc::c_int, // any cpu
            -1 as libc::c_int, // no group
            0 as libc::c_ulong,
        ) as i32
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// One collected call stack.
#[derive(Debug, Clone)]
pub struct CallStack {
    pub time: u64,
    pub pid: u32,
    pub tid: u32,
    /// Frames kept, after the depth cap
    pub depth: usize,
    /// Instruction pointers, innermost-first
    pub pcs: Vec<u64>,
    /// Resolved + demangled names, parallel to `pcs` (empty on miss)
    pub func_names: Vec<String>,
}

/// A perf-event sampler bound to one thread.
pub struct CpuSampler {
    fd: i32,
    mem: *mut libc::c_void,
    pages: u64,
    /// Consumed position within the data area
    offset: u64,
    page_size: usize,
}

// The mmap pointer is only dereferenced through &self/&mut self.
unsafe impl Send for CpuSampler {}

impl CpuSampler {
    /// Open a disabled cpu-clock sampler for `tid`.
    pub fn open(tid: libc::pid_t, period: u64, pages: u64) -> Result<Self> {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.config = PERF_COUNT_SW_CPU_CLOCK;
        attr.sample_period = period;
        attr.sample_type = PERF_SAMPLE_TIME | PERF_SAMPLE_TID | PERF_SAMPLE_CALLCHAIN;
        // Start disabled, notify on every overflow.
        attr.flags = PERF_ATTR_FLAG_DISABLED;
        attr.wakeup_events = 1;

        let fd = perf_event_open(&attr, tid);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("perf_event_open() failed");
        }

        let page_size = page_size();
        let len = (1 + pages as usize) * page_size;
        let mem = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(std::io::Error::last_os_error()).context("mmap() of perf ring failed");
        }

        debug!(tid, period, pages, "cpu sampler opened");
        Ok(Self {
            fd,
            mem,
            pages,
            offset: 0,
            page_size,
        })
    }

    pub fn enable(&self) {
        unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0) };
    }

    pub fn disable(&self) {
        unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0) };
    }

    fn meta(&self) -> *const PerfMmapPage {
        self.mem as *const PerfMmapPage
    }

    fn data_area(&self) -> *const u8 {
        unsafe { (self.mem as *const u8).add(self.page_size) }
    }

    fn data_size(&self) -> u64 {
        self.pages * self.page_size as u64
    }

    /// Copy `len` bytes at ring position `pos`, handling wrap-around.
    fn read_ring(&self, pos: u64, buf: &mut [u8]) {
        let size = self.data_size();
        let start = (pos % size) as usize;
        let len = buf.len();
        unsafe {
            if start + len <= size as usize {
                std::ptr::copy_nonoverlapping(self.data_area().add(start), buf.as_mut_ptr(), len);
            } else {
                let first = size as usize - start;
                std::ptr::copy_nonoverlapping(self.data_area().add(start), buf.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(
                    self.data_area(),
                    buf.as_mut_ptr().add(first),
                    len - first,
                );
            }
        }
    }

    /// Wait for and decode one sample record.
    ///
    /// Returns `Ok(None)` on poll timeout or when only non-sample records
    /// arrived; `timeout_ms < 0` waits indefinitely. Non-sample records are
    /// skipped; the consumed offset always catches up with the producer.
    pub fn collect_one(&mut self, timeout_ms: i32, max_depth: usize) -> Result<Option<CallStack>> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            return Err(std::io::Error::last_os_error()).context("poll() on perf fd failed");
        }
        if ready == 0 {
            return Ok(None);
        }

        let head = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.meta()).data_head)) };
        atomic::fence(atomic::Ordering::Acquire);
        if head == self.offset {
            return Ok(None);
        }

        let mut found = None;
        let mut pos = self.offset;
        while pos < head {
            let mut header_bytes = [0u8; std::mem::size_of::<PerfEventHeader>()];
            self.read_ring(pos, &mut header_bytes);
            let header: PerfEventHeader = unsafe { std::mem::transmute(header_bytes) };
            if header.size == 0 || header.size as u64 > self.data_size() {
                // Overwritten tail; resynchronize with the producer.
                break;
            }
            if header.type_ == PERF_RECORD_SAMPLE && found.is_none() {
                let body_len = header.size as usize - std::mem::size_of::<PerfEventHeader>();
                let mut body = vec![0u8; body_len];
                self.read_ring(pos + std::mem::size_of::<PerfEventHeader>() as u64, &mut body);
                found = decode_sample(&body, max_depth);
            }
            pos += header.size as u64;
        }

        self.offset = head;
        Ok(found)
    }
}

impl Drop for CpuSampler {
    fn drop(&mut self) {
        self.disable();
        unsafe {
            libc::munmap(self.mem, (1 + self.pages as usize) * self.page_size);
            libc::close(self.fd);
        }
    }
}

/// Decode a PERF_SAMPLE_TID | TIME | CALLCHAIN record body.
fn decode_sample(body: &[u8], max_depth: usize) -> Option<CallStack> {
    let read_u32 = |at: usize| -> Option<u32> {
        body.get(at..at + 4)
            .map(|b| u32::from_ne_bytes(b.try_into().expect("4-byte slice")))
    };
    let read_u64 = |at: usize| -> Option<u64> {
        body.get(at..at + 8)
            .map(|b| u64::from_ne_bytes(b.try_into().expect("8-byte slice")))
    };

    let pid = read_u32(0)?;
    let tid = read_u32(4)?;
    let time = read_u64(8)?;
    let nr = read_u64(16)? as usize;

    let mut pcs = Vec::new();
    for i in 0..nr {
        let pc = read_u64(24 + i * 8)?;
        // Skip PERF_CONTEXT_* markers separating kernel and user chains.
        if pc >= PERF_CONTEXT_FLOOR {
            continue;
        }
        pcs.push(pc);
        if pcs.len() >= max_depth {
            break;
        }
    }

    let func_names = pcs.iter().map(|pc| resolve_symbol(*pc)).collect();
    Some(CallStack {
        time,
        pid,
        tid,
        depth: pcs.len(),
        pcs,
        func_names,
    })
}

/// Resolve one pc to a demangled name; empty string when unknown.
fn resolve_symbol(pc: u64) -> String {
    let mut name = String::new();
    backtrace::resolve(pc as *mut libc::c_void, |symbol| {
        if name.is_empty() {
            if let Some(symbol_name) = symbol.name() {
                name = format!("{}", symbol_name);
            }
        }
    });
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    #[test]
    fn test_attr_layout_matches_ver6() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 120);
        assert_eq!(std::mem::size_of::<PerfEventHeader>(), 8);
    }

    #[test]
    fn test_mmap_page_data_head_offset() {
        assert_eq!(std::mem::offset_of!(PerfMmapPage, data_head), 1024);
    }

    #[test]
    fn test_decode_sample_skips_context_markers() {
        let mut body = Vec::new();
        body.extend_from_slice(&1234u32.to_ne_bytes()); // pid
        body.extend_from_slice(&1235u32.to_ne_bytes()); // tid
        body.extend_from_slice(&42u64.to_ne_bytes()); // time
        body.extend_from_slice(&3u64.to_ne_bytes()); // nr
        body.extend_from_slice(&0xffff_ffff_ffff_fe00u64.to_ne_bytes()); // PERF_CONTEXT_USER
        body.extend_from_slice(&0x4000_10u64.to_ne_bytes());
        body.extend_from_slice(&0x4000_20u64.to_ne_bytes());

        let stack = decode_sample(&body, 128).unwrap();
        assert_eq!(stack.pid, 1234);
        assert_eq!(stack.tid, 1235);
        assert_eq!(stack.time, 42);
        assert_eq!(stack.pcs, vec![0x4000_10, 0x4000_20]);
        assert_eq!(stack.depth, 2);
    }

    #[test]
    fn test_decode_sample_caps_depth() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_ne_bytes());
        body.extend_from_slice(&1u32.to_ne_bytes());
        body.extend_from_slice(&0u64.to_ne_bytes());
        body.extend_from_slice(&10u64.to_ne_bytes());
        for i in 0..10u64 {
            body.extend_from_slice(&(0x1000 + i).to_ne_bytes());
        }

        let stack = decode_sample(&body, 4).unwrap();
        assert_eq!(stack.depth, 4);
        assert_eq!(stack.pcs.len(), 4);
    }

    #[test]
    fn test_live_sampler_collects_own_thread() {
        // Needs perf_event_paranoid to permit self-profiling; skip quietly
        // in environments where it does not.
        let Ok(mut sampler) = CpuSampler::open(sys::current_tid(), 1_000_000, 8) else {
            eprintln!("perf_event_open unavailable, skipping live sampler test");
            return;
        };
        sampler.enable();

        // Burn cpu so the 1ms period fires a few times.
        let mut acc = 0u64;
        let start = std::time::Instant::now();
        while start.elapsed() < std::time::Duration::from_millis(50) {
            acc = acc.wrapping_mul(31).wrapping_add(7);
        }
        std::hint::black_box(acc);

        let collected = sampler.collect_one(200, 64);
        sampler.disable();

        if let Ok(Some(stack)) = collected {
            assert_eq!(stack.tid, sys::current_tid() as u32);
            assert!(!stack.pcs.is_empty());
            assert_eq!(stack.pcs.len(), stack.func_names.len());
        }
    }
}
