//! Worker process launch.
//!
//! # Launch Contract
//! - `PORT`: loopback port the worker's delegated listener binds
//! - `HANDOFF_DESCRIPTOR_FD`: inherited descriptor channel end
//! - `HANDOFF_WORKER_INDEX`: position among sibling workers

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{WorkerPoolConfig, PORT_ENV, WORKER_INDEX_ENV};
use crate::handoff::unix::DESCRIPTOR_FD_ENV;

/// Everything a spawner needs to launch one worker.
#[derive(Debug)]
pub struct WorkerLaunch {
    pub index: usize,
    pub port: u16,
    /// Worker end of the descriptor channel. The spawner must let the child
    /// inherit it and close its own copy afterwards.
    pub descriptor: OwnedFd,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Launches the configured worker executable.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    die_with_parent: bool,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            die_with_parent: true,
        }
    }

    pub fn from_config(config: &WorkerPoolConfig) -> Self {
        Self::new(config.program.clone())
            .with_args(config.args.clone())
            .with_die_with_parent(config.die_with_parent)
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_die_with_parent(mut self, enabled: bool) -> Self {
        self.die_with_parent = enabled;
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: WorkerLaunch) -> Result<Child, SpawnError> {
        let fd = launch.descriptor.as_raw_fd();
        let die_with_parent = self.die_with_parent;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(PORT_ENV, launch.port.to_string())
            .env(DESCRIPTOR_FD_ENV, fd.to_string())
            .env(WORKER_INDEX_ENV, launch.index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe calls (fcntl, prctl) run between fork and exec.
        // PR_SET_PDEATHSIG tracks the forking thread, so spawn from a runtime
        // worker thread, never from a short-lived blocking thread.
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
                #[cfg(target_os = "linux")]
                if die_with_parent && libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(io::Error::last_os_error());
                }
                #[cfg(not(target_os = "linux"))]
                let _ = die_with_parent;
                Ok(())
            });
        }

        let child = command.spawn()?;
        tracing::debug!(
            program = %self.program.display(),
            worker = launch.index,
            port = launch.port,
            pid = ?child.id(),
            "Worker process spawned"
        );
        drop(launch.descriptor);
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::unix::channel_pair;

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let (_front, worker) = channel_pair().unwrap();
        let spawner = ProcessSpawner::new("/nonexistent/handoff-worker");
        let result = spawner.spawn(WorkerLaunch {
            index: 0,
            port: 1,
            descriptor: worker,
        });
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn worker_sees_launch_environment() {
        let (_front, worker) = channel_pair().unwrap();
        let spawner = ProcessSpawner::new("sh").with_args(vec![
            "-c".into(),
            r#"test "$PORT" = 4321 && test "$HANDOFF_WORKER_INDEX" = 3 && test -e "/dev/fd/$HANDOFF_DESCRIPTOR_FD""#.into(),
        ]);
        let mut child = spawner
            .spawn(WorkerLaunch {
                index: 3,
                port: 4321,
                descriptor: worker,
            })
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
