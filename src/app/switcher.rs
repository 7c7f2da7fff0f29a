use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::selector;
use crate::app::state::GlobalState;
use crate::app::subscription;
use crate::app::supervisor::Supervisor;
use crate::config::Config;
use crate::dns::{self, Resolver};

/// 切换请求
#[derive(Debug, Clone)]
pub enum SwitchRequest {
    /// Re-select the fastest upstream.
    Auto,
    /// Re-select, penalizing and steering away from a server that was
    /// reported down.
    Avoid { server: String },
    /// Switch directly to a pool member chosen by the operator.
    Select { target: String },
}

/// 切换引擎
///
/// One consumer drains the switch channel; a compare-and-swap flag drops
/// requests that arrive while a switch is in flight, so bursts coalesce into
/// a single selection instead of queueing.
pub struct Switcher {
    state: Arc<GlobalState>,
    supervisor: Arc<Supervisor>,
    resolver: Arc<Resolver>,
    client: reqwest::Client,
    cfg: Arc<Config>,
}

impl Switcher {
    pub fn new(
        state: Arc<GlobalState>,
        supervisor: Arc<Supervisor>,
        resolver: Arc<Resolver>,
        client: reqwest::Client,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            state,
            supervisor,
            resolver,
            client,
            cfg,
        }
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SwitchRequest>) {
        while let Some(req) = rx.recv().await {
            if self
                .state
                .switching
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("already switching, skipping request");
                continue;
            }

            self.state.error_count.store(0, Ordering::SeqCst);
            debug!(request = ?req, "switch request");

            self.state.seed_pool_if_empty(&self.cfg.bootstrap_node);

            let result = match &req {
                SwitchRequest::Auto => self.handle_switch("").await,
                SwitchRequest::Avoid { server } => self.handle_switch(server).await,
                SwitchRequest::Select { target } => self.process_select(target).await,
            };
            if let Err(e) = result {
                debug!(error = %format_args!("{:#}", e), "switch failed");
            }

            self.state.error_count.store(0, Ordering::SeqCst);
            self.state.switching.store(false, Ordering::SeqCst);
            debug!("switching done");
        }
    }

    /// Refresh the pool, select, restart, publish.
    ///
    /// A non-empty `avoid` first earns that host a penalty point. The feed
    /// refresh commits before selection so a selector failure still leaves
    /// the newest pool in place; a failed refresh keeps the previous pool.
    pub async fn handle_switch(&self, avoid: &str) -> Result<()> {
        if !avoid.is_empty() {
            match dns::host_of(avoid) {
                Some(host) => self.state.increment_penalty(&host),
                None => debug!(url = %avoid, "cannot parse dead server URL"),
            }
        }

        let pool = match subscription::fetch(&self.client, self.cfg.subscribe_url()).await {
            Ok(new_pool) => {
                self.state.set_pool(new_pool.clone());
                new_pool
            }
            Err(e) => {
                debug!(
                    error = %format_args!("{:#}", e),
                    "subscription refresh failed, keeping previous pool"
                );
                self.state.pool()
            }
        };

        let chosen = selector::fastest(&self.resolver, &self.state, &pool, avoid).await?;

        if chosen == self.state.current_server() {
            anyhow::bail!("no change");
        }

        info!(server = %chosen, "fastest upstream selected");
        self.supervisor.restart(&chosen).await?;
        self.state.set_current_server(&chosen);
        Ok(())
    }

    /// Operator-directed switch: target must be a pool member and not the
    /// current server.
    async fn process_select(&self, target: &str) -> Result<()> {
        if target.is_empty() {
            anyhow::bail!("target server cannot be empty");
        }
        if !self.state.pool_contains(target) {
            anyhow::bail!("target server not found in available servers");
        }
        if self.state.current_server() == target {
            anyhow::bail!("already connected to target server");
        }

        info!(server = %target, "switching to selected server");
        self.supervisor.restart(target).await?;
        self.state.set_current_server(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::persist::PersistedState;
    use clap::Parser;

    fn switcher() -> Switcher {
        let cfg = Arc::new(Config::parse_from([
            "naiveswitch",
            // never reachable; tests exercise the offline paths only
            "-s",
            "http://127.0.0.1:1/sub",
        ]));
        let state = Arc::new(GlobalState::new(
            std::env::temp_dir(),
            PersistedState::default(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            std::path::PathBuf::from("/bin"),
            "sh".to_string(),
            state.app_token.clone(),
        ));
        let resolver = Arc::new(Resolver::new("127.0.0.1:1").unwrap());
        Switcher::new(state, supervisor, resolver, reqwest::Client::new(), cfg)
    }

    #[tokio::test]
    async fn select_rejects_empty_target() {
        let sw = switcher();
        let err = sw.process_select("").await.unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[tokio::test]
    async fn select_rejects_unknown_target() {
        let sw = switcher();
        sw.state.set_pool(vec!["https://u:p@a.example:443".to_string()]);
        let err = sw
            .process_select("https://u:p@unknown.example:443")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(sw.state.current_server().is_empty());
    }

    #[tokio::test]
    async fn select_rejects_current_server() {
        let sw = switcher();
        sw.state.set_pool(vec!["https://u:p@a.example:443".to_string()]);
        sw.state.set_current_server("https://u:p@a.example:443");
        let err = sw
            .process_select("https://u:p@a.example:443")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already connected"));
    }

    #[tokio::test]
    async fn avoid_penalizes_host_even_when_selection_fails() {
        let sw = switcher();
        // Empty pool + unreachable feed: selection fails, but the avoided
        // host keeps its penalty point.
        let err = sw
            .handle_switch("https://u:p@dead.example:443")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no valid hosts"));
        assert_eq!(sw.state.penalty_snapshot()["dead.example"], 1);
        assert!(sw.state.current_server().is_empty());
    }
}
