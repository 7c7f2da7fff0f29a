use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Loopback SOCKS endpoint the child is told to listen on.
pub const UPSTREAM_LISTEN: &str = "127.0.0.1:10790";

/// Grace period for a routine stop before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Longer terminal grace used once during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

struct ChildProc {
    child: Child,
    cancel: CancellationToken,
    started_at: Instant,
}

/// 子进程监督器
///
/// Owns the single upstream child. Every lifecycle transition happens under
/// one mutex, so observers never see two children alive. The installed
/// binary name lives here too because the updater swaps it atomically with
/// the process it belongs to.
pub struct Supervisor {
    slot: Mutex<Option<ChildProc>>,
    app_token: CancellationToken,
    base_path: PathBuf,
    binary: RwLock<String>,
    child_present: AtomicBool,
}

impl Supervisor {
    pub fn new(base_path: PathBuf, binary: String, app_token: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            app_token,
            base_path,
            binary: RwLock::new(binary),
            child_present: AtomicBool::new(false),
        }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    /// File name of the installed upstream binary.
    pub fn current_binary(&self) -> String {
        self.binary.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Lock-free liveness check for the hot connection path.
    pub fn child_running(&self) -> bool {
        self.child_present.load(Ordering::SeqCst)
    }

    /// Stop the current child (if any), then start one pointed at `target`.
    pub async fn restart(&self, target: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot, STOP_GRACE).await;
        self.start_locked(&mut slot, target).await
    }

    /// Terminal stop used by the shutdown controller.
    pub async fn stop(&self, grace: Duration) {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot, grace).await;
    }

    /// Swap in a freshly downloaded binary: stop the old child, delete the
    /// old file, retarget the binary pointer, start again at `target`.
    /// All one critical section, so a racing switch sees either world.
    pub async fn replace_binary_and_restart(&self, new_binary: String, target: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot, STOP_GRACE).await;

        let old = {
            let mut binary = self.binary.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *binary, new_binary.clone())
        };
        if !old.is_empty() && old != new_binary {
            if let Err(e) = std::fs::remove_file(self.base_path.join(&old)) {
                debug!(binary = %old, error = %e, "removing old binary failed");
            }
        }
        info!(binary = %new_binary, "upstream binary installed");

        self.start_locked(&mut slot, target).await
    }

    async fn stop_locked(&self, slot: &mut Option<ChildProc>, grace: Duration) {
        let Some(mut proc) = slot.take() else { return };
        self.child_present.store(false, Ordering::SeqCst);

        proc.cancel.cancel();
        kill_group(&mut proc.child, grace).await;
        debug!(
            uptime = ?proc.started_at.elapsed(),
            "upstream child stopped"
        );
    }

    async fn start_locked(&self, slot: &mut Option<ChildProc>, target: &str) -> Result<()> {
        // Never start a child once shutdown began; success without a child
        // lets the caller finish its teardown undisturbed.
        if self.app_token.is_cancelled() {
            debug!("shutting down, not starting upstream child");
            return Ok(());
        }

        let binary = self.current_binary();
        if binary.is_empty() {
            anyhow::bail!("no naive binary found");
        }
        if target.is_empty() {
            anyhow::bail!("no proxy target");
        }

        let cancel = self.app_token.child_token();
        let mut cmd = Command::new(self.base_path.join(&binary));
        cmd.arg(format!("--listen=socks://{}", UPSTREAM_LISTEN))
            .arg(format!("--proxy={}", target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group so the whole tree can be signalled as one unit.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                cancel.cancel();
                return Err(anyhow::Error::new(e).context(format!("starting {}", binary)));
            }
        };

        info!(
            binary = %binary,
            pid = child.id().unwrap_or_default(),
            server = %target,
            "upstream child started"
        );
        *slot = Some(ChildProc {
            child,
            cancel,
            started_at: Instant::now(),
        });
        self.child_present.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// POSIX termination protocol: SIGTERM to the process group (leader alone as
/// fallback), bounded wait, SIGKILL escalation, final reap.
#[cfg(unix)]
async fn kill_group(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id() else {
        // Already exited, just reap.
        let _ = child.wait().await;
        return;
    };
    let pid = Pid::from_raw(raw as i32);

    if let Err(e) = killpg(pid, Signal::SIGTERM) {
        debug!(pid = raw, error = %e, "SIGTERM to process group failed, signalling leader");
        let _ = kill(pid, Signal::SIGTERM);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid = raw, status = %status, "child exited"),
        Ok(Err(e)) => debug!(pid = raw, error = %e, "child wait failed"),
        Err(_) => {
            debug!(pid = raw, "child did not exit in time, sending SIGKILL to group");
            if let Err(e) = killpg(pid, Signal::SIGKILL) {
                debug!(pid = raw, error = %e, "SIGKILL to process group failed, killing leader");
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
        }
    }
}

/// Windows has no group signal; the child is spawned in its own process
/// group and force-killed directly.
#[cfg(windows)]
async fn kill_group(child: &mut Child, grace: Duration) {
    let _ = child.start_kill();
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.wait().await;
    }
}
