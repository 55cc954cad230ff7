//! Lock file keeping one server per data root

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "locks/server.lock";

/// Held for as long as a server owns the data root
pub struct ServerLock {
    path: PathBuf,
    // flock lives as long as the descriptor
    _file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
pub struct LockContent {
    pub pid: u32,
    pub listen: Option<SocketAddr>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl ServerLock {
    /// Acquire the exclusive lock on `root`
    ///
    /// Fails when another live process holds it. A lock left behind by a dead
    /// process is removed and acquisition retried once.
    pub fn acquire(root: &Path, listen: Option<SocketAddr>) -> Result<Self> {
        Self::acquire_inner(root, listen, true)
    }

    fn acquire_inner(root: &Path, listen: Option<SocketAddr>, retry: bool) -> Result<Self> {
        let lock_path = root.join(LOCK_FILE);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create locks directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        if !try_flock_exclusive(&file)? {
            if retry && is_stale_lock(&mut file) {
                tracing::warn!("Removing stale server lock {}", lock_path.display());
                drop(file);
                std::fs::remove_file(&lock_path)?;
                return Self::acquire_inner(root, listen, false);
            }
            let holder = read_lock_content(&mut file)
                .map(|content| format!(" by pid {}", content.pid))
                .unwrap_or_default();
            anyhow::bail!(
                "Another server is using {} (lock held{})",
                root.display(),
                holder
            );
        }

        write_lock_content(&mut file, listen)?;

        Ok(Self {
            path: lock_path,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Who holds the lock on `root`, if anyone wrote one
    pub fn holder(root: &Path) -> Option<LockContent> {
        let mut file = File::open(root.join(LOCK_FILE)).ok()?;
        read_lock_content(&mut file).ok()
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale_lock(file: &mut File) -> bool {
    match read_lock_content(file) {
        Ok(content) => !is_process_alive(content.pid),
        // Unreadable content while flock is held means a writer is mid-way
        Err(_) => false,
    }
}

fn write_lock_content(file: &mut File, listen: Option<SocketAddr>) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        listen,
        started_at: chrono::Utc::now(),
    };

    let serialized =
        serde_json::to_string(&content).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_content(file: &mut File) -> Result<LockContent> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock content")
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal only checks existence
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
