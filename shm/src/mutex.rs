//! Process-shared recursive mutex embedded in the mapped segment.

use std::mem::MaybeUninit;
use tracing::warn;

pub const DEFAULT_LOCK_TIMEOUT_MS: u32 = 1000;

/// A view of one `pthread_mutex_t` inside the shared mapping. The mutex
/// memory is owned by the segment; this type only borrows it.
pub struct SharedMutex {
    raw: *mut libc::pthread_mutex_t,
}

impl SharedMutex {
    /// # Safety
    /// `raw` must point at a properly aligned `pthread_mutex_t` inside a
    /// live mapping, initialised via [`SharedMutex::init_at`] by whichever
    /// process created the segment.
    pub unsafe fn from_raw(raw: *mut libc::pthread_mutex_t) -> SharedMutex {
        SharedMutex { raw }
    }

    /// Initialises the mutex memory as process-shared and recursive. Must be
    /// called exactly once per mutex, by the creating process, before any
    /// peer attaches.
    ///
    /// # Safety
    /// `raw` must point at aligned, writable, zeroed mutex-sized memory
    /// inside the mapping.
    pub unsafe fn init_at(raw: *mut libc::pthread_mutex_t) -> bool {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
            return false;
        }
        let attr_ptr = attr.as_mut_ptr();
        let ok = libc::pthread_mutexattr_setpshared(attr_ptr, libc::PTHREAD_PROCESS_SHARED) == 0
            && libc::pthread_mutexattr_settype(attr_ptr, libc::PTHREAD_MUTEX_RECURSIVE) == 0
            && libc::pthread_mutex_init(raw, attr_ptr) == 0;
        libc::pthread_mutexattr_destroy(attr_ptr);
        ok
    }

    /// Destroys the mutex. Only the last detaching process may call this.
    ///
    /// # Safety
    /// No other process may hold or subsequently use the mutex.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.raw);
    }

    /// Acquires the mutex, giving up after `timeout_ms`. Returns a guard on
    /// success and `None` on timeout or error - it never blocks forever.
    pub fn lock(&self, timeout_ms: u32) -> Option<SharedMutexGuard<'_>> {
        let mut deadline = MaybeUninit::<libc::timespec>::uninit();
        let rc = unsafe {
            if libc::clock_gettime(libc::CLOCK_REALTIME, deadline.as_mut_ptr()) != 0 {
                return None;
            }
            let deadline = deadline.assume_init_mut();
            deadline.tv_sec += (timeout_ms / 1000) as libc::time_t;
            deadline.tv_nsec += ((timeout_ms % 1000) as libc::c_long) * 1_000_000;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }
            libc::pthread_mutex_timedlock(self.raw, deadline)
        };

        if rc == 0 {
            Some(SharedMutexGuard { mutex: self })
        } else {
            warn!("shared mutex acquisition failed (rc {})", rc);
            None
        }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw) };
        debug_assert_eq!(rc, 0, "unlocking a mutex this thread holds cannot fail");
    }
}

pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
