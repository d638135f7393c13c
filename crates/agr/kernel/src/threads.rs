//! Thread tiers.
//!
//! Every thread of a kernel is created here, in one of two tiers:
//!
//! * `Kernel`: control and link threads. Asks for a slightly higher
//!   priority and is joined at shutdown.
//! * `Agent`: one thread per agent. Slightly lower priority, detached.
//!
//! Priorities are a hint to the OS scheduler. Changing them is best effort
//! and a refused change only shows up in the debug log.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use agr_net::LinkThreads;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ThreadsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadTier {
    Kernel,
    Agent,
}

impl ThreadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadTier::Kernel => "kernel",
            ThreadTier::Agent => "agent",
        }
    }
}

impl fmt::Display for ThreadTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ThreadTierFactory {
    config: ThreadsConfig,
    spawned: AtomicU64,
    kernel_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadTierFactory {
    pub fn new(config: ThreadsConfig) -> Self {
        Self {
            config,
            spawned: AtomicU64::new(0),
            kernel_threads: Mutex::new(Vec::new()),
        }
    }

    pub fn nice(&self, tier: ThreadTier) -> i32 {
        match tier {
            ThreadTier::Kernel => self.config.kernel_nice,
            ThreadTier::Agent => self.config.agent_nice,
        }
    }

    /// Start `body` on a new thread of `tier`. `purpose` only shows up in
    /// logs. Returns the thread name, `<prefix>-<tier>-<n>`.
    pub fn spawn<F>(&self, tier: ThreadTier, purpose: &str, body: F) -> io::Result<String>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}-{}", self.config.name_prefix, tier, n);
        let nice = self.nice(tier);

        let handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(self.config.stack_size)
            .spawn(move || {
                apply_nice(nice);
                body()
            })?;
        trace!(thread = %name, purpose, "Thread started");

        if tier == ThreadTier::Kernel {
            let mut threads = self.kernel_threads.lock();
            threads.retain(|t| !t.is_finished());
            threads.push(handle);
        }
        Ok(name)
    }

    /// Kernel threads that have not finished yet.
    pub fn live_kernel_threads(&self) -> usize {
        self.kernel_threads
            .lock()
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Join every kernel thread, including ones started while joining.
    /// The calling thread is never joined. Returns how many were joined.
    pub fn join_kernel_threads(&self) -> usize {
        let me = thread::current().id();
        let mut joined = 0;
        loop {
            let threads = std::mem::take(&mut *self.kernel_threads.lock());
            if threads.is_empty() {
                return joined;
            }
            for handle in threads {
                if handle.thread().id() == me {
                    continue;
                }
                let name = handle.thread().name().map(str::to_string);
                if handle.join().is_err() {
                    debug!(thread = ?name, "Kernel thread panicked");
                }
                joined += 1;
            }
        }
    }
}

impl LinkThreads for ThreadTierFactory {
    fn spawn_link_thread(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        self.spawn(ThreadTier::Kernel, name, body).map(|_| ())
    }
}

impl fmt::Debug for ThreadTierFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTierFactory")
            .field("config", &self.config)
            .field("spawned", &self.spawned.load(Ordering::Relaxed))
            .finish()
    }
}

/// Set the nice value of the calling thread.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn apply_nice(nice: i32) {
    if nice == 0 {
        return;
    }
    // SAFETY: gettid has no preconditions; setpriority only reads its
    // arguments and reports failure through its return value.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if rc != 0 {
        debug!(nice, error = %io::Error::last_os_error(), "Thread priority unchanged");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_nice(_nice: i32) {}
