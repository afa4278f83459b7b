//! Lifecycle of the mapped segment and the endpoint-level API.

use crate::layout::{
    ControlBlock, SegmentLayout, ShmConfig, RECORD_HEADER_SIZE, SHM_MAGIC, SHM_VERSION,
};
use crate::mutex::{SharedMutex, DEFAULT_LOCK_TIMEOUT_MS};
use crate::ring::MultiReaderRing;
use anyhow::{bail, ensure, Context, Result};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// One process's attachment to a named shared-memory segment, acting as the
/// writer for messages it sends and as a registered reader at every peer
/// endpoint's ring.
pub struct SharedMemorySegment {
    name: String,
    local_endpoint: u32,
    layout: SegmentLayout,
    base: *mut u8,
    map_len: usize,
    fd: libc::c_int,
    running: AtomicBool,
}

// All shared state inside the mapping is accessed through atomics or the
// process-shared mutexes; the raw pointer itself is stable for the lifetime
// of the value.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentStats {
    pub ref_count: u32,
    pub active_readers: u32,
    pub available_write: u64,
    pub available_read: u64,
}

impl SharedMemorySegment {
    /// Opens (or creates and initialises) the named segment and joins it as
    /// `local_endpoint`: increments the attachment count and registers as a
    /// reader at every peer endpoint's ring.
    pub fn open(name: &str, local_endpoint: u32, cfg: ShmConfig) -> Result<SharedMemorySegment> {
        cfg.validate()?;
        ensure!(
            local_endpoint < cfg.max_endpoints,
            "endpoint {} out of range (max {})",
            local_endpoint,
            cfg.max_endpoints
        );

        let layout = SegmentLayout::new(cfg);
        let map_len = layout.total_size();
        let c_name = CString::new(name).context("segment name contains a NUL byte")?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            bail!(
                "shm_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            );
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("fstat on segment {} failed: {}", name, err);
        }
        let st_size = unsafe { stat.assume_init() }.st_size;
        let is_new = st_size == 0;
        if !is_new && (st_size as usize) < map_len {
            unsafe { libc::close(fd) };
            bail!(
                "segment {} is smaller than this configuration requires ({} < {})",
                name,
                st_size,
                map_len
            );
        }

        if is_new && unsafe { libc::ftruncate(fd, map_len as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("sizing segment {} to {} bytes failed: {}", name, map_len, err);
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("mapping segment {} failed: {}", name, err);
        }

        let segment = SharedMemorySegment {
            name: name.to_owned(),
            local_endpoint,
            layout,
            base: base as *mut u8,
            map_len,
            fd,
            running: AtomicBool::new(true),
        };

        if is_new {
            segment.init_segment()?;
            info!("created shared segment {} ({} bytes)", name, map_len);
        } else {
            segment.validate_segment()?;
            debug!("attached to existing shared segment {}", name);
        }

        segment
            .control()
            .ref_count
            .fetch_add(1, Ordering::AcqRel);
        segment.register_as_reader();

        Ok(segment)
    }

    fn control(&self) -> &ControlBlock {
        unsafe { &*(self.base as *const ControlBlock) }
    }

    fn config(&self) -> &ShmConfig {
        self.layout.config()
    }

    fn mutex(&self, endpoint: u32) -> SharedMutex {
        let offset = self.layout.mutex_offset(endpoint);
        unsafe { SharedMutex::from_raw(self.base.add(offset) as *mut libc::pthread_mutex_t) }
    }

    fn ring(&self, endpoint: u32) -> MultiReaderRing {
        unsafe {
            MultiReaderRing::from_parts(
                self.base.add(self.layout.ring_offset(endpoint)) as *mut _,
                self.base.add(self.layout.slots_offset(endpoint)) as *mut _,
                self.config().max_readers_per_endpoint as usize,
                self.base.add(self.layout.data_offset(endpoint)),
            )
        }
    }

    /// Writes the control block, the per-endpoint mutexes and the rings into
    /// the freshly zeroed mapping.
    fn init_segment(&self) -> Result<()> {
        let cfg = *self.config();
        let control = self.base as *mut ControlBlock;
        unsafe {
            (*control).magic = SHM_MAGIC;
            (*control).version = SHM_VERSION;
            (*control).buffer_size = cfg.buffer_size;
            (*control).max_endpoints = cfg.max_endpoints;
            (*control).max_readers_per_endpoint = cfg.max_readers_per_endpoint;
        }
        self.control().ref_count.store(0, Ordering::Relaxed);

        for endpoint in 0..cfg.max_endpoints {
            let raw = unsafe {
                self.base.add(self.layout.mutex_offset(endpoint)) as *mut libc::pthread_mutex_t
            };
            ensure!(
                unsafe { SharedMutex::init_at(raw) },
                "initialising the mutex of endpoint {} failed",
                endpoint
            );
            self.ring(endpoint)
                .init(cfg.buffer_size, cfg.max_readers_per_endpoint);
        }
        Ok(())
    }

    fn validate_segment(&self) -> Result<()> {
        let control = self.control();
        ensure!(
            control.magic == SHM_MAGIC && control.version == SHM_VERSION,
            "segment {} carries no valid control block",
            self.name
        );
        let cfg = self.config();
        ensure!(
            control.buffer_size == cfg.buffer_size
                && control.max_endpoints == cfg.max_endpoints
                && control.max_readers_per_endpoint == cfg.max_readers_per_endpoint,
            "segment {} was created with a different configuration",
            self.name
        );
        Ok(())
    }

    fn register_as_reader(&self) {
        for endpoint in 0..self.config().max_endpoints {
            if endpoint == self.local_endpoint {
                continue;
            }
            if !self.ring(endpoint).register_reader(self.local_endpoint, unix_now()) {
                warn!(
                    "no free reader slot at endpoint {} for endpoint {}",
                    endpoint, self.local_endpoint
                );
            }
        }
    }

    fn unregister_as_reader(&self) {
        for endpoint in 0..self.config().max_endpoints {
            if endpoint != self.local_endpoint {
                self.ring(endpoint).unregister_reader(self.local_endpoint);
            }
        }
    }

    pub fn local_endpoint(&self) -> u32 {
        self.local_endpoint
    }

    /// Largest message the ring can carry.
    pub fn mtu(&self) -> usize {
        self.config().buffer_size as usize - RECORD_HEADER_SIZE
    }

    pub fn is_connected(&self) -> bool {
        !self.base.is_null() && self.running.load(Ordering::Acquire)
    }

    /// Publishes `data` into `endpoint`'s ring under that endpoint's mutex.
    /// Fails (`false`) when the segment is closed, the endpoint is out of
    /// range, the mutex times out, or the ring lacks space for the record.
    pub fn write(&self, endpoint: u32, data: &[u8]) -> bool {
        if !self.is_connected() || endpoint >= self.config().max_endpoints {
            return false;
        }
        if data.len() > self.mtu() {
            return false;
        }

        let mutex = self.mutex(endpoint);
        let Some(_guard) = mutex.lock(DEFAULT_LOCK_TIMEOUT_MS) else {
            warn!("endpoint {} mutex unavailable - dropping write", endpoint);
            return false;
        };
        self.ring(endpoint).write(data, self.local_endpoint, unix_now())
    }

    /// Takes the next pending message from any peer endpoint's ring.
    pub fn read(&self) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }
        for endpoint in 0..self.config().max_endpoints {
            if endpoint == self.local_endpoint {
                continue;
            }
            if let Some(message) = self.ring(endpoint).read(self.local_endpoint, unix_now()) {
                return Some(message);
            }
        }
        None
    }

    /// Writes `data` into every peer endpoint's ring. Partial success is
    /// reported as `false` but does not roll back the completed writes.
    pub fn broadcast(&self, data: &[u8]) -> bool {
        let mut all_ok = true;
        for endpoint in 0..self.config().max_endpoints {
            if endpoint != self.local_endpoint {
                all_ok &= self.write(endpoint, data);
            }
        }
        all_ok
    }

    pub fn stats(&self) -> SegmentStats {
        if !self.is_connected() {
            return SegmentStats::default();
        }

        let mut stats = SegmentStats {
            ref_count: self.control().ref_count.load(Ordering::Acquire),
            ..SegmentStats::default()
        };
        for endpoint in 0..self.config().max_endpoints {
            let ring = self.ring(endpoint);
            stats.active_readers += ring.active_readers();
            stats.available_write += ring.available_write() as u64;
            stats.available_read += ring.available_read(self.local_endpoint) as u64;
        }
        stats
    }

    /// Detaches from the segment: unregisters everywhere, drops the
    /// attachment count (the last process destroys the mutexes), unmaps and
    /// releases the file descriptor. Idempotent.
    pub fn close(&mut self) {
        if self.base.is_null() {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.unregister_as_reader();

        let previous = self.control().ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            debug!("last detach from segment {} - destroying mutexes", self.name);
            for endpoint in 0..self.config().max_endpoints {
                unsafe { self.mutex(endpoint).destroy() };
            }
        }

        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
            libc::close(self.fd);
        }
        self.base = std::ptr::null_mut();
        self.fd = -1;
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes the segment name from the namespace. Existing mappings stay
/// valid; subsequent opens create a fresh segment.
pub fn unlink(name: &str) -> bool {
    let Ok(c_name) = CString::new(name) else {
        return false;
    };
    unsafe { libc::shm_unlink(c_name.as_ptr()) == 0 }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
