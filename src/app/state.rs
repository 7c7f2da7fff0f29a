use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::app::persist::PersistedState;

/// Penalty normalization kicks in once every tracked host has failed more
/// than this many times.
const PENALTY_NORMALIZE_THRESHOLD: u32 = 100;

/// 全局共享状态
///
/// Single mutating owner per field: the switch consumer writes the pool and
/// current server, the forwarder touches only the error counter, the admin
/// surface only the pause block. Everything else reads through snapshots.
pub struct GlobalState {
    /// Root of the cancellation tree. Cancelled on shutdown (signal or
    /// self-update); every child-process token derives from it.
    pub app_token: CancellationToken,

    /// host → accumulated failure count, the primary selection sort key.
    penalties: RwLock<HashMap<String, u32>>,

    /// Latest subscription pool, feed order preserved.
    pool: RwLock<Vec<String>>,

    /// The proxy URL the child is currently configured for.
    current: RwLock<String>,

    /// Consecutive-failure counter fed by the forwarder, clamped at 0.
    pub error_count: AtomicI32,

    /// At-most-one-in-flight flags for the two dispatcher arms.
    pub switching: AtomicBool,
    pub checking: AtomicBool,

    auto_switch: RwLock<AutoSwitch>,

    base_path: PathBuf,
    pub start_time: i64,
    started: Instant,
}

struct AutoSwitch {
    paused: bool,
    locked_server: String,
}

impl GlobalState {
    pub fn new(base_path: PathBuf, persisted: PersistedState) -> Self {
        Self {
            app_token: CancellationToken::new(),
            penalties: RwLock::new(HashMap::new()),
            pool: RwLock::new(Vec::new()),
            current: RwLock::new(String::new()),
            error_count: AtomicI32::new(0),
            switching: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            auto_switch: RwLock::new(AutoSwitch {
                paused: persisted.auto_switch_paused,
                locked_server: persisted.locked_server,
            }),
            base_path,
            start_time: chrono::Local::now().timestamp(),
            started: Instant::now(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    // ── pool ────────────────────────────────────────────────────────────

    pub fn pool(&self) -> Vec<String> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_pool(&self, urls: Vec<String>) {
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = urls;
    }

    pub fn pool_contains(&self, url: &str) -> bool {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|u| u == url)
    }

    /// Insert `node` when the pool is empty so selection always has at least
    /// one candidate.
    pub fn seed_pool_if_empty(&self, node: &str) {
        if node.is_empty() {
            return;
        }
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        if pool.is_empty() {
            pool.push(node.to_string());
        }
    }

    // ── current server ──────────────────────────────────────────────────

    pub fn current_server(&self) -> String {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_current_server(&self, url: &str) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = url.to_string();
    }

    // ── penalties ───────────────────────────────────────────────────────

    pub fn penalty_snapshot(&self) -> HashMap<String, u32> {
        self.penalties
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn increment_penalty(&self, host: &str) {
        let mut penalties = self.penalties.write().unwrap_or_else(|e| e.into_inner());
        *penalties.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Drop hosts that left the pool, then rebase all counters once the
    /// minimum exceeds the threshold. Relative order of surviving hosts is
    /// unchanged.
    pub fn normalize_penalties(&self, pool_hosts: &HashSet<String>) {
        let mut penalties = self.penalties.write().unwrap_or_else(|e| e.into_inner());
        penalties.retain(|host, _| pool_hosts.contains(host));

        if let Some(&min) = penalties.values().min() {
            if min > PENALTY_NORMALIZE_THRESHOLD {
                for value in penalties.values_mut() {
                    *value -= min;
                }
            }
        }
    }

    // ── error counter ───────────────────────────────────────────────────

    /// Decrement without going below zero.
    pub fn decrement_error_count(&self) {
        loop {
            let old = self.error_count.load(Ordering::SeqCst);
            if old <= 0 {
                return;
            }
            if self
                .error_count
                .compare_exchange(old, old - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    // ── auto switch / locked server ─────────────────────────────────────

    pub fn auto_switch_paused(&self) -> bool {
        self.auto_switch
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .paused
    }

    pub fn locked_server(&self) -> String {
        self.auto_switch
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .locked_server
            .clone()
    }

    /// Flip the pause flag. Pausing remembers the current server as the
    /// locked one; resuming forgets it. Returns the state to persist.
    pub fn set_auto_switch_paused(&self, paused: bool) -> PersistedState {
        let mut auto = self.auto_switch.write().unwrap_or_else(|e| e.into_inner());
        auto.paused = paused;
        if paused {
            let current = self.current_server();
            if !current.is_empty() {
                auto.locked_server = current;
            }
        } else {
            auto.locked_server.clear();
        }
        PersistedState {
            auto_switch_paused: auto.paused,
            locked_server: auto.locked_server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GlobalState {
        GlobalState::new(std::env::temp_dir(), PersistedState::default())
    }

    #[test]
    fn seed_only_when_empty() {
        let s = state();
        s.seed_pool_if_empty("https://u:p@boot.example:443");
        assert_eq!(s.pool().len(), 1);
        s.seed_pool_if_empty("https://u:p@other.example:443");
        assert_eq!(s.pool(), vec!["https://u:p@boot.example:443".to_string()]);
    }

    #[test]
    fn penalties_accumulate() {
        let s = state();
        s.increment_penalty("a.example");
        s.increment_penalty("a.example");
        s.increment_penalty("b.example");
        let snap = s.penalty_snapshot();
        assert_eq!(snap["a.example"], 2);
        assert_eq!(snap["b.example"], 1);
    }

    #[test]
    fn normalize_drops_hosts_outside_pool() {
        let s = state();
        s.increment_penalty("gone.example");
        s.increment_penalty("kept.example");
        let pool: HashSet<String> = ["kept.example".to_string()].into();
        s.normalize_penalties(&pool);
        let snap = s.penalty_snapshot();
        assert!(!snap.contains_key("gone.example"));
        assert!(snap.contains_key("kept.example"));
    }

    #[test]
    fn normalize_rebases_and_preserves_order() {
        let s = state();
        for _ in 0..150 {
            s.increment_penalty("a.example");
        }
        for _ in 0..120 {
            s.increment_penalty("b.example");
        }
        let pool: HashSet<String> =
            ["a.example".to_string(), "b.example".to_string()].into();
        s.normalize_penalties(&pool);
        let snap = s.penalty_snapshot();
        assert_eq!(snap["a.example"], 30);
        assert_eq!(snap["b.example"], 0);
        assert!(snap["b.example"] < snap["a.example"]);
    }

    #[test]
    fn normalize_below_threshold_is_noop() {
        let s = state();
        s.increment_penalty("a.example");
        let pool: HashSet<String> = ["a.example".to_string()].into();
        s.normalize_penalties(&pool);
        assert_eq!(s.penalty_snapshot()["a.example"], 1);
    }

    #[test]
    fn error_count_never_negative() {
        let s = state();
        s.decrement_error_count();
        assert_eq!(s.error_count.load(Ordering::SeqCst), 0);
        s.error_count.store(2, Ordering::SeqCst);
        s.decrement_error_count();
        s.decrement_error_count();
        s.decrement_error_count();
        assert_eq!(s.error_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pause_captures_and_resume_clears_lock() {
        let s = state();
        s.set_current_server("https://u:p@a.example:443");
        let ps = s.set_auto_switch_paused(true);
        assert!(ps.auto_switch_paused);
        assert_eq!(ps.locked_server, "https://u:p@a.example:443");
        assert_eq!(s.locked_server(), "https://u:p@a.example:443");

        let ps = s.set_auto_switch_paused(false);
        assert!(!ps.auto_switch_paused);
        assert!(ps.locked_server.is_empty());
        assert!(s.locked_server().is_empty());
    }

    #[test]
    fn pause_without_current_keeps_previous_lock() {
        let s = state();
        let ps = s.set_auto_switch_paused(true);
        assert!(ps.locked_server.is_empty());
    }
}
