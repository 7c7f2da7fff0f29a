pub mod binaries;
pub mod persist;
pub mod selector;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod switcher;
pub mod updater;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, log_ring::LogRing};
use crate::config::Config;
use crate::dns::{ResolveAdapter, Resolver};

use state::GlobalState;
use supervisor::Supervisor;
use switcher::{SwitchRequest, Switcher};
use updater::Updater;

/// Switch requests buffer up to here; the consumer drops extras while busy.
const SWITCH_CHANNEL_CAPACITY: usize = 100;
const UPDATE_CHANNEL_CAPACITY: usize = 10;

pub struct App {
    cfg: Arc<Config>,
    state: Arc<GlobalState>,
    supervisor: Arc<Supervisor>,
    resolver: Arc<Resolver>,
    client: reqwest::Client,
    ring: Arc<LogRing>,
}

impl App {
    pub fn new(cfg: Config, ring: Arc<LogRing>) -> Result<Self> {
        let exe = std::env::current_exe().context("locating own executable")?;
        let base_path = exe
            .parent()
            .context("executable has no parent directory")?
            .to_path_buf();

        let binary = binaries::find_latest(&base_path)?;

        let persisted = match persist::load(&base_path) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "persisted state unreadable, starting fresh");
                Default::default()
            }
        };

        let state = Arc::new(GlobalState::new(base_path.clone(), persisted));
        let supervisor = Arc::new(Supervisor::new(
            base_path,
            binary,
            state.app_token.clone(),
        ));
        let resolver = Arc::new(Resolver::new(&cfg.dns_resolver)?);
        let client = reqwest::Client::builder()
            .user_agent(concat!("naiveswitch/", env!("CARGO_PKG_VERSION")))
            .dns_resolver(Arc::new(ResolveAdapter(resolver.clone())))
            .build()?;

        Ok(Self {
            cfg: Arc::new(cfg),
            state,
            supervisor,
            resolver,
            client,
            ring,
        })
    }

    pub async fn run(self) -> Result<()> {
        let App {
            cfg,
            state,
            supervisor,
            resolver,
            client,
            ring,
        } = self;

        info!(binary = %supervisor.current_binary(), "running with naive");

        let (switch_tx, switch_rx) = mpsc::channel::<SwitchRequest>(SWITCH_CHANNEL_CAPACITY);
        let (update_tx, update_rx) = mpsc::channel::<()>(UPDATE_CHANNEL_CAPACITY);

        let switcher = Arc::new(Switcher::new(
            state.clone(),
            supervisor.clone(),
            resolver.clone(),
            client.clone(),
            cfg.clone(),
        ));

        // Bootstrap before the listener binds. A paused restart reconnects
        // straight to its locked server; otherwise the bootstrap node seeds
        // the (still empty) pool and a full selection runs. Failure is not
        // fatal: the relay keeps nudging the switch channel until a
        // selection lands.
        let locked = state.locked_server();
        if state.auto_switch_paused() && !locked.is_empty() {
            state.seed_pool_if_empty(&locked);
            match supervisor.restart(&locked).await {
                Ok(()) => state.set_current_server(&locked),
                Err(e) => warn!(error = %e, server = %locked, "locked server restart failed"),
            }
        } else {
            state.seed_pool_if_empty(&cfg.bootstrap_node);
            if let Err(e) = switcher.handle_switch("").await {
                warn!(error = %e, "bootstrap selection failed");
            }
        }

        let listener = tokio::net::TcpListener::bind(&cfg.listen)
            .await
            .with_context(|| format!("binding relay listener on {}", cfg.listen))?;
        info!(addr = %cfg.listen, "relay listening");

        tokio::spawn(switcher.clone().run(switch_rx));

        let updater = Arc::new(Updater::new(
            state.clone(),
            supervisor.clone(),
            client.clone(),
            cfg.clone(),
        ));
        tokio::spawn(updater.run(update_rx));
        let _ = update_tx.send(()).await;

        spawn_ticker(
            state.clone(),
            switch_tx.clone(),
            update_tx.clone(),
            cfg.auto_switch_minutes,
        );

        tokio::spawn(crate::proxy::forwarder::serve(
            listener,
            state.clone(),
            supervisor.clone(),
            switch_tx.clone(),
        ));

        let _admin = api::start(
            api::AppState {
                state: state.clone(),
                supervisor: supervisor.clone(),
                resolver,
                client,
                cfg: cfg.clone(),
                ring,
                do_switch: switch_tx.clone(),
                do_update: update_tx.clone(),
            },
            cfg.web_listen.clone(),
        )?;

        shutdown_signal(&state.app_token).await;
        info!("shutting down");

        state.app_token.cancel();
        drop(switch_tx);
        drop(update_tx);
        // Let in-flight consumers observe the cancellation before the child
        // goes away under them.
        tokio::time::sleep(Duration::from_millis(500)).await;
        supervisor.stop(supervisor::SHUTDOWN_GRACE).await;

        info!("shutdown complete");
        Ok(())
    }
}

/// 周期性自动切换：暂停时静默
fn spawn_ticker(
    state: Arc<GlobalState>,
    switch_tx: mpsc::Sender<SwitchRequest>,
    update_tx: mpsc::Sender<()>,
    minutes: u64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
        ticker.tick().await; // 跳过首次立即触发
        loop {
            ticker.tick().await;
            if state.auto_switch_paused() {
                continue;
            }
            let _ = switch_tx.send(SwitchRequest::Auto).await;
            let _ = update_tx.send(()).await;
        }
    });
}

/// Resolve on SIGINT/SIGTERM or on app-context cancellation (self-update
/// requests shutdown through the token).
async fn shutdown_signal(app_token: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = app_token.cancelled() => {}
                }
            }
            Err(_) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = app_token.cancelled() => {}
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = app_token.cancelled() => {}
        }
    }
}
