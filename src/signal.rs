use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signum: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Latch that flips once the process is asked to shut down.
#[derive(Clone, Copy)]
pub struct ShutdownSignal {
    flag: &'static AtomicBool,
}

impl ShutdownSignal {
    /// Route SIGINT, SIGTERM and SIGHUP into the process-wide latch.
    pub fn install() -> std::io::Result<Self> {
        let handler = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            let previous = unsafe { libc::signal(signum, handler) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(Self { flag: &TERMINATE })
    }

    /// A latch no OS signal can reach.
    #[cfg(test)]
    pub fn manual() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
