//! Linux bindings: the `bpf(2)` syscall surface, perf ring buffers,
//! and program loading.
//!
//! Everything unsafe in the crate lives here. The rest of the runtime
//! reaches the kernel through [`MapBackend`] and the ring walk in
//! [`crate::ring`]; this module supplies the real implementations on
//! top of raw file descriptors and shared memory.

#![allow(clippy::missing_safety_doc)]

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use libc::{c_int, c_ulong};
use rustc_hash::FxHashMap;

use dweave_dif::difo::MapRef;

use crate::maps::{MapBackend, MapKind, MapSpec, UpdateFlag};
use crate::ring::{walk, ConsumeStats};
use crate::{RtResult, RuntimeError};

// bpf(2) commands.
const BPF_MAP_CREATE: c_int = 0;
const BPF_MAP_LOOKUP_ELEM: c_int = 1;
const BPF_MAP_UPDATE_ELEM: c_int = 2;
const BPF_MAP_DELETE_ELEM: c_int = 3;
const BPF_MAP_GET_NEXT_KEY: c_int = 4;
const BPF_PROG_LOAD: c_int = 5;

// Map types, matching `MapKind`.
const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_MAP_TYPE_ARRAY: u32 = 2;
const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;
const BPF_MAP_TYPE_PERCPU_HASH: u32 = 5;
const BPF_MAP_TYPE_PERCPU_ARRAY: u32 = 6;

/// Program type for probe programs.
const BPF_PROG_TYPE_KPROBE: u32 = 2;

// perf_event_open(2) pieces for the output buffers.
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_SW_BPF_OUTPUT: u64 = 10;
const PERF_SAMPLE_RAW: u64 = 1 << 10;
const PERF_ATTR_SIZE: u32 = 112;
const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
const PERF_EVENT_IOC_SET_BPF: c_ulong = 0x4004_2408;

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

fn sys_err<T>(call: &'static str) -> RtResult<T> {
    Err(RuntimeError::Sys {
        call,
        errno: errno(),
    })
}

#[repr(C)]
#[derive(Copy, Clone)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct MapElemAttr {
    map_fd: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
}

unsafe fn sys_bpf<T>(cmd: c_int, attr: &mut T) -> c_int {
    libc::syscall(
        libc::SYS_bpf,
        cmd,
        attr as *mut T as *mut libc::c_void,
        mem::size_of::<T>(),
    ) as c_int
}

fn map_type(kind: MapKind) -> u32 {
    match kind {
        MapKind::Array => BPF_MAP_TYPE_ARRAY,
        MapKind::PerCpuArray => BPF_MAP_TYPE_PERCPU_ARRAY,
        MapKind::Hash => BPF_MAP_TYPE_HASH,
        MapKind::PerCpuHash => BPF_MAP_TYPE_PERCPU_HASH,
        MapKind::PerfEventArray => BPF_MAP_TYPE_PERF_EVENT_ARRAY,
    }
}

struct KernelMap {
    fd: c_int,
    spec: MapSpec,
}

impl Drop for KernelMap {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A [`MapBackend`] over real kernel maps.
pub struct KernelBackend {
    ncpus: u32,
    maps: FxHashMap<MapRef, KernelMap>,
}

impl KernelBackend {
    /// Create a backend for `ncpus` possible CPUs.
    pub fn new(ncpus: u32) -> Self {
        KernelBackend {
            ncpus: ncpus.max(1),
            maps: FxHashMap::default(),
        }
    }

    /// The kernel descriptor of a created map, for relocation.
    pub fn map_fd(&self, role: MapRef) -> RtResult<i32> {
        Ok(self.kmap(role)?.fd)
    }

    fn kmap(&self, role: MapRef) -> RtResult<&KernelMap> {
        self.maps.get(&role).ok_or(RuntimeError::NoSuchMap(role))
    }

    // Per-CPU values are read as one contiguous buffer with each
    // CPU's instance padded to 8 bytes.
    fn percpu_stride(&self, spec: &MapSpec) -> usize {
        (spec.value_size as usize + 7) & !7
    }
}

impl MapBackend for KernelBackend {
    fn create(&mut self, spec: &MapSpec) -> RtResult<()> {
        let mut attr = MapCreateAttr {
            map_type: map_type(spec.kind),
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: 0,
        };
        let fd = unsafe { sys_bpf(BPF_MAP_CREATE, &mut attr) };
        if fd < 0 {
            return sys_err("bpf(MAP_CREATE)");
        }
        log::debug!("map '{}' created as fd {fd}", spec.role);
        self.maps.insert(spec.role, KernelMap { fd, spec: *spec });
        Ok(())
    }

    fn spec(&self, role: MapRef) -> RtResult<&MapSpec> {
        Ok(&self.kmap(role)?.spec)
    }

    fn lookup(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<u8>>> {
        let m = self.kmap(role)?;
        let mut value = vec![0u8; m.spec.value_size as usize];
        let mut attr = MapElemAttr {
            map_fd: m.fd as u32,
            key: key.as_ptr() as u64,
            value_or_next_key: value.as_mut_ptr() as u64,
            flags: 0,
        };
        let rc = unsafe { sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr) };
        if rc < 0 {
            if errno() == libc::ENOENT {
                return Ok(None);
            }
            return sys_err("bpf(MAP_LOOKUP_ELEM)");
        }
        Ok(Some(value))
    }

    fn lookup_percpu(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<Vec<u8>>>> {
        let m = self.kmap(role)?;
        if !matches!(m.spec.kind, MapKind::PerCpuArray | MapKind::PerCpuHash) {
            return self.lookup(role, key).map(|v| v.map(|v| vec![v]));
        }
        let stride = self.percpu_stride(&m.spec);
        let mut raw = vec![0u8; stride * self.ncpus as usize];
        let mut attr = MapElemAttr {
            map_fd: m.fd as u32,
            key: key.as_ptr() as u64,
            value_or_next_key: raw.as_mut_ptr() as u64,
            flags: 0,
        };
        let rc = unsafe { sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr) };
        if rc < 0 {
            if errno() == libc::ENOENT {
                return Ok(None);
            }
            return sys_err("bpf(MAP_LOOKUP_ELEM)");
        }
        Ok(Some(
            raw.chunks_exact(stride)
                .map(|c| c[..m.spec.value_size as usize].to_vec())
                .collect(),
        ))
    }

    fn update(
        &mut self,
        role: MapRef,
        key: &[u8],
        value: &[u8],
        flag: UpdateFlag,
    ) -> RtResult<()> {
        let m = self.kmap(role)?;
        // Per-CPU maps take the full per-CPU buffer from user space;
        // replicate the value for every CPU.
        let percpu = matches!(m.spec.kind, MapKind::PerCpuArray | MapKind::PerCpuHash);
        let buf;
        let value_ptr = if percpu {
            let stride = self.percpu_stride(&m.spec);
            let mut raw = vec![0u8; stride * self.ncpus as usize];
            for chunk in raw.chunks_exact_mut(stride) {
                chunk[..value.len()].copy_from_slice(value);
            }
            buf = raw;
            buf.as_ptr()
        } else {
            value.as_ptr()
        };

        let mut attr = MapElemAttr {
            map_fd: m.fd as u32,
            key: key.as_ptr() as u64,
            value_or_next_key: value_ptr as u64,
            flags: match flag {
                UpdateFlag::Any => 0,
                UpdateFlag::NoExist => 1,
                UpdateFlag::Exist => 2,
            },
        };
        let rc = unsafe { sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr) };
        if rc < 0 {
            return match errno() {
                libc::EEXIST => Err(RuntimeError::Exists(role)),
                libc::ENOENT => Err(RuntimeError::NotFound(role)),
                libc::E2BIG => Err(RuntimeError::MapFull(role)),
                _ => sys_err("bpf(MAP_UPDATE_ELEM)"),
            };
        }
        Ok(())
    }

    fn delete(&mut self, role: MapRef, key: &[u8]) -> RtResult<()> {
        let m = self.kmap(role)?;
        let mut attr = MapElemAttr {
            map_fd: m.fd as u32,
            key: key.as_ptr() as u64,
            value_or_next_key: 0,
            flags: 0,
        };
        let rc = unsafe { sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr) };
        if rc < 0 && errno() != libc::ENOENT {
            return sys_err("bpf(MAP_DELETE_ELEM)");
        }
        Ok(())
    }

    fn keys(&self, role: MapRef) -> RtResult<Vec<Vec<u8>>> {
        let m = self.kmap(role)?;
        let ksize = m.spec.key_size as usize;
        let mut keys = Vec::new();
        let mut cur: Option<Vec<u8>> = None;
        loop {
            let mut next = vec![0u8; ksize];
            let mut attr = MapElemAttr {
                map_fd: m.fd as u32,
                key: cur.as_ref().map(|k| k.as_ptr() as u64).unwrap_or(0),
                value_or_next_key: next.as_mut_ptr() as u64,
                flags: 0,
            };
            let rc = unsafe { sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr) };
            if rc < 0 {
                if errno() == libc::ENOENT {
                    return Ok(keys);
                }
                return sys_err("bpf(MAP_GET_NEXT_KEY)");
            }
            keys.push(next.clone());
            cur = Some(next);
        }
    }
}

/// Load a program image, returning its descriptor. On verifier
/// rejection the log is surfaced through `log::warn` and the raw errno
/// is preserved for the caller.
pub fn load_program(image: &[u8]) -> RtResult<c_int> {
    let license = b"GPL\0";
    let mut log_buf = vec![0u8; 64 * 1024];
    let mut attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_KPROBE,
        insn_cnt: (image.len() / 8) as u32,
        insns: image.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 1,
        log_size: log_buf.len() as u32,
        log_buf: log_buf.as_mut_ptr() as u64,
        kern_version: 0,
    };
    let fd = unsafe { sys_bpf(BPF_PROG_LOAD, &mut attr) };
    if fd < 0 {
        let end = log_buf.iter().position(|&b| b == 0).unwrap_or(0);
        if end > 0 {
            log::warn!(
                "verifier rejected program:\n{}",
                String::from_utf8_lossy(&log_buf[..end])
            );
        }
        return sys_err("bpf(PROG_LOAD)");
    }
    Ok(fd)
}

// The layout of the shared header page, as the kernel defines it.
// Only the data-region fields are read; the rest exist for layout.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventMmapPage {
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
    reserved: [u8; 118 * 8 + 4],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

/// One mmap'd kernel ring bound to a CPU.
pub struct KernelRing {
    fd: c_int,
    base: *mut u8,
    mmap_len: usize,
    cpu: u32,
}

impl KernelRing {
    /// Open the output buffer for `cpu` with a data region of
    /// `data_pages` pages (a power of two), and register its descriptor
    /// in the `buffers` map.
    pub fn open(backend: &mut KernelBackend, cpu: u32, data_pages: usize) -> RtResult<Self> {
        assert!(data_pages.is_power_of_two());

        let mut attr = [0u8; PERF_ATTR_SIZE as usize];
        // type, size, config, sample_type, wakeup_events: everything
        // else stays zero.
        attr[0..4].copy_from_slice(&PERF_TYPE_SOFTWARE.to_le_bytes());
        attr[4..8].copy_from_slice(&PERF_ATTR_SIZE.to_le_bytes());
        attr[8..16].copy_from_slice(&PERF_COUNT_SW_BPF_OUTPUT.to_le_bytes());
        attr[24..32].copy_from_slice(&PERF_SAMPLE_RAW.to_le_bytes());
        attr[48..52].copy_from_slice(&1u32.to_le_bytes());

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr.as_ptr(),
                -1 as libc::pid_t,
                cpu as c_int,
                -1 as c_int,
                PERF_FLAG_FD_CLOEXEC,
            ) as c_int
        };
        if fd < 0 {
            return sys_err("perf_event_open");
        }

        let page = page_size();
        let mmap_len = page * (data_pages + 1);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return sys_err("mmap");
        }

        let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0) };
        if rc < 0 {
            unsafe {
                libc::munmap(base, mmap_len);
                libc::close(fd);
            }
            return sys_err("ioctl(PERF_EVENT_IOC_ENABLE)");
        }

        backend.update(
            MapRef::Buffers,
            &cpu.to_le_bytes(),
            &(fd as u32).to_le_bytes(),
            UpdateFlag::Any,
        )?;

        Ok(KernelRing {
            fd,
            base: base as *mut u8,
            mmap_len,
            cpu,
        })
    }

    /// The pollable descriptor.
    pub fn fd(&self) -> c_int {
        self.fd
    }

    /// The CPU this ring belongs to.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    fn page(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    /// Drain every complete record, delivering payloads exactly once.
    pub fn consume<F>(&mut self, linbuf: &mut Vec<u8>, deliver: F) -> ConsumeStats
    where
        F: FnMut(u32, &[u8]),
    {
        unsafe {
            let page = self.page();
            let head = ptr::read_volatile(&(*page).data_head);
            fence(Ordering::Acquire);
            let tail = ptr::read_volatile(&(*page).data_tail);

            let data_offset = ptr::read_volatile(&(*page).data_offset) as usize;
            let data_size = ptr::read_volatile(&(*page).data_size) as usize;
            let data = std::slice::from_raw_parts(self.base.add(data_offset), data_size);

            let (new_tail, stats) = walk(data, tail, head, linbuf, deliver);

            fence(Ordering::AcqRel);
            ptr::write_volatile(&mut (*page).data_tail, new_tail);
            stats
        }
    }
}

impl Drop for KernelRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
            libc::close(self.fd);
        }
    }
}

const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Attach a loaded program to the probe behind `perf_fd`.
pub fn attach_program(perf_fd: c_int, prog_fd: c_int) -> RtResult<()> {
    let rc = unsafe { libc::ioctl(perf_fd, PERF_EVENT_IOC_SET_BPF, prog_fd) };
    if rc < 0 {
        return sys_err("ioctl(PERF_EVENT_IOC_SET_BPF)");
    }
    let rc = unsafe { libc::ioctl(perf_fd, PERF_EVENT_IOC_ENABLE, 0) };
    if rc < 0 {
        return sys_err("ioctl(PERF_EVENT_IOC_ENABLE)");
    }
    Ok(())
}

/// Block until any of `fds` is readable or `timeout_ms` elapses.
/// Returns the indexes with pending data.
pub fn poll_ready(fds: &[c_int], timeout_ms: i32) -> RtResult<Vec<usize>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        if errno() == libc::EINTR {
            return Ok(Vec::new());
        }
        return sys_err("poll");
    }
    Ok(pollfds
        .iter()
        .enumerate()
        .filter(|(_, p)| p.revents & libc::POLLIN != 0)
        .map(|(i, _)| i)
        .collect())
}
