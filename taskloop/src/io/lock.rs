//! Exclusive advisory lock on an agent home.
//!
//! Every operation that writes loop state holds the lock from the moment it
//! reloads the committed state until its own commit, so a `reply` sent while
//! `run` is mid-cycle waits for that cycle instead of racing it.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use tracing::debug;

/// Held lock. Released when dropped (closing the file releases it, even on a crash).
#[derive(Debug)]
pub struct HomeLock {
    _file: File,
}

impl HomeLock {
    /// Block until the lock at `path` is free, then take it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        debug!(path = %path.display(), "acquiring home lock");
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_holder_waits_until_first_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop.lock");
        let first = HomeLock::acquire(&path).expect("first lock");

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _second = HomeLock::acquire(&path).expect("second lock");
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(first);
        waiter.join().expect("join waiter");
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn lock_can_be_taken_again_after_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop.lock");
        drop(HomeLock::acquire(&path).expect("first"));
        HomeLock::acquire(&path).expect("second");
        assert!(path.is_file());
    }
}
