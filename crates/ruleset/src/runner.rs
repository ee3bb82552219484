//! Uniform invocation of the external `iptables`/`ipset` binaries plus the
//! advisory file lock that serialises writers against the kernel tables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Result, RulesetError};

/// Distinguished outcome of a kernel-tool invocation. Exit code 1 on these
/// tools means "already exists" (on an add) or "does not exist" (on a
/// delete/check) rather than a genuine failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok { stdout: String },
    AlreadyExistsOrNotFound,
    Failed { stderr: String },
}

impl Default for CommandOutcome {
    fn default() -> Self {
        CommandOutcome::Ok { stdout: String::new() }
    }
}

/// Runs external binaries and captures their result. Implemented as a trait
/// so tests can substitute an in-memory fake rather than shelling out.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome>;
}

/// Default runner: spawns the real binary via `tokio::process::Command`.
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        debug!(program, ?args, "running kernel tool");
        let output = Command::new(program).args(args).output().await?;
        match output.status.code() {
            Some(0) => Ok(CommandOutcome::Ok {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            }),
            Some(1) => Ok(CommandOutcome::AlreadyExistsOrNotFound),
            _ => Ok(CommandOutcome::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}

/// Bounded-retry advisory lock over a well-known path (e.g.
/// `/run/xtables.lock`), held by an `O_EXCL`-style lock file for the
/// duration of a guard's lifetime.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(2),
        }
    }

    /// Polls every 200ms up to 2s; returns a retriable error on timeout.
    pub async fn acquire(&self) -> Result<FileLockGuard<'_>> {
        let mut attempts = 0u32;
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            attempts += 1;
            match try_lock(&self.path) {
                Ok(handle) => {
                    return Ok(FileLockGuard {
                        _handle: handle,
                        lock: self,
                    });
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    sleep(self.poll_interval).await;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), attempts, "lock acquisition timed out: {err}");
                    return Err(RulesetError::LockTimeout {
                        path: self.path.display().to_string(),
                        attempts,
                    });
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct FileLockGuard<'a> {
    _handle: std::fs::File,
    lock: &'a FileLock,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock.path);
    }
}

fn try_lock(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct FakeRunner {
        pub calls: Arc<AtomicUsize>,
        pub outcome: CommandOutcome,
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    #[tokio::test]
    async fn lock_released_on_drop_allows_reacquire() {
        let dir = std::env::temp_dir().join(format!("ruleset-lock-test-{}", std::process::id()));
        {
            let lock = FileLock::new(&dir);
            let _guard = lock.acquire().await.expect("first acquire succeeds");
        }
        let lock = FileLock::new(&dir);
        let _guard = lock.acquire().await.expect("second acquire succeeds after drop");
    }

    #[tokio::test]
    async fn concurrent_acquire_times_out() {
        let dir = std::env::temp_dir().join(format!("ruleset-lock-test-busy-{}", std::process::id()));
        let lock = FileLock::new(&dir);
        let _held = lock.acquire().await.expect("first holder succeeds");
        let contender = FileLock {
            path: dir.clone(),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        let err = contender.acquire().await.expect_err("should time out while held");
        assert!(matches!(err, RulesetError::LockTimeout { .. }));
    }
}
