use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Compile,
    Cpp,
    DesiredCompile,
}

pub const ALL_KINDS: [SlotKind; 3] = [SlotKind::Compile, SlotKind::Cpp, SlotKind::DesiredCompile];

impl SlotKind {
    fn suffix(self) -> &'static str {
        match self {
            SlotKind::Compile => "compile",
            SlotKind::Cpp => "cpp",
            SlotKind::DesiredCompile => "desired",
        }
    }

    pub fn name(self, config: &Config) -> String {
        format!("{}.{}", config.semaphore_prefix, self.suffix())
    }

    pub fn count(self, config: &Config) -> usize {
        match self {
            SlotKind::Compile => config.compile_slots,
            SlotKind::Cpp => config.cpp_slots,
            SlotKind::DesiredCompile => config.desired_compile_slots,
        }
    }
}

/// Semaphores currently held by this process. The fatal-signal handler
/// walks this instead of relying on unwinding, so it must be lock-free.
const MAX_HELD: usize = 4;
static HELD: [AtomicUsize; MAX_HELD] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

fn register(sem: *mut libc::sem_t) {
    for slot in &HELD {
        if slot
            .compare_exchange(0, sem as usize, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

fn deregister(sem: *mut libc::sem_t) -> bool {
    for slot in &HELD {
        if slot
            .compare_exchange(sem as usize, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
    false
}

/// Posts and closes every semaphore this process holds. Called from the
/// signal handler and the normal-exit path; only async-signal-safe calls.
pub fn release_all() {
    for slot in &HELD {
        let sem = slot.swap(0, Ordering::SeqCst) as *mut libc::sem_t;
        if !sem.is_null() {
            unsafe {
                libc::sem_post(sem);
                libc::sem_close(sem);
            }
        }
    }
}

fn open(kind: SlotKind, config: &Config) -> Option<*mut libc::sem_t> {
    let name = CString::new(kind.name(config)).ok()?;
    let sem = unsafe {
        libc::sem_open(
            name.as_ptr(),
            libc::O_CREAT,
            0o666 as libc::c_uint,
            kind.count(config) as libc::c_uint,
        )
    };
    if sem == libc::SEM_FAILED {
        error!(
            "Failed to open semaphore {} for {} slots: {}",
            kind.name(config),
            kind.count(config),
            std::io::Error::last_os_error()
        );
        return None;
    }
    Some(sem)
}

/// A held admission slot. Dropping posts the semaphore exactly once.
pub struct Slot {
    kind: SlotKind,
    sem: Option<*mut libc::sem_t>,
}

// The raw pointer is only ever passed to sem_post/sem_close, which are
// thread-safe; the watchdog thread may end up dropping a slot.
unsafe impl Send for Slot {}

impl Slot {
    pub fn kind(&self) -> SlotKind {
        self.kind
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(sem) = self.sem.take() {
            debug!("Dropping {} slot", self.kind.suffix());
            if deregister(sem) {
                unsafe {
                    libc::sem_post(sem);
                    libc::sem_close(sem);
                }
            }
        }
    }
}

/// Blocks until a slot of `kind` is available. A semaphore that cannot be
/// opened degrades to an unguarded slot rather than wedging the build.
pub fn acquire(kind: SlotKind, config: &Config) -> Slot {
    let Some(sem) = open(kind, config) else {
        return Slot { kind, sem: None };
    };
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            error!("sem_wait({}) failed: {}", kind.suffix(), err);
            unsafe { libc::sem_close(sem) };
            return Slot { kind, sem: None };
        }
    }
    debug!("Acquired {} slot", kind.suffix());
    register(sem);
    Slot {
        kind,
        sem: Some(sem),
    }
}

/// Non-blocking probe, used for the "preferred local" fast path.
pub fn try_acquire(kind: SlotKind, config: &Config) -> Option<Slot> {
    let sem = open(kind, config)?;
    if unsafe { libc::sem_trywait(sem) } == 0 {
        debug!("Acquired {} slot without waiting", kind.suffix());
        register(sem);
        return Some(Slot {
            kind,
            sem: Some(sem),
        });
    }
    unsafe { libc::sem_close(sem) };
    None
}

/// `--dump-semaphores`: current value / configured maximum per kind.
pub fn dump(config: &Config) {
    for kind in ALL_KINDS {
        match open(kind, config) {
            Some(sem) => {
                let mut value: libc::c_int = -1;
                unsafe {
                    libc::sem_getvalue(sem, &mut value);
                    libc::sem_close(sem);
                }
                println!("{} {}/{}", kind.name(config), value, kind.count(config));
            }
            None => {
                eprintln!("Failed to open semaphore {}", kind.name(config));
            }
        }
    }
}

/// `--clean-semaphores`: unlink all three names.
pub fn clean(config: &Config) {
    for kind in ALL_KINDS {
        let Ok(name) = CString::new(kind.name(config)) else {
            continue;
        };
        if unsafe { libc::sem_unlink(name.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                eprintln!("Failed to unlink semaphore {}: {}", kind.name(config), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(prefix: &str) -> Config {
        let mut config = Config::default();
        config.semaphore_prefix = format!("/fisk-test-{prefix}-{}", std::process::id());
        config.compile_slots = 2;
        config.cpp_slots = 2;
        config.desired_compile_slots = 1;
        config
    }

    fn value(kind: SlotKind, config: &Config) -> libc::c_int {
        let sem = open(kind, config).unwrap();
        let mut value = -1;
        unsafe {
            libc::sem_getvalue(sem, &mut value);
            libc::sem_close(sem);
        }
        value
    }

    // One test: the held-semaphore registry is process-global, and
    // parallel test threads would observe each other's slots.
    #[test]
    fn slot_lifecycle() {
        let config = test_config("lifecycle");

        // acquire/drop conserves the count
        assert_eq!(value(SlotKind::Compile, &config), 2);
        {
            let _one = acquire(SlotKind::Compile, &config);
            let _two = acquire(SlotKind::Compile, &config);
            assert_eq!(value(SlotKind::Compile, &config), 0);
        }
        assert_eq!(value(SlotKind::Compile, &config), 2);

        // try_acquire fails once exhausted, recovers on release
        let held = try_acquire(SlotKind::DesiredCompile, &config);
        assert!(held.is_some());
        assert!(try_acquire(SlotKind::DesiredCompile, &config).is_none());
        drop(held);
        assert!(try_acquire(SlotKind::DesiredCompile, &config).is_some());

        // release_all posts held semaphores; a later drop must not double-post
        let slot = acquire(SlotKind::Cpp, &config);
        assert_eq!(value(SlotKind::Cpp, &config), 1);
        release_all();
        assert_eq!(value(SlotKind::Cpp, &config), 2);
        drop(slot);
        assert_eq!(value(SlotKind::Cpp, &config), 2);

        clean(&config);
    }
}
