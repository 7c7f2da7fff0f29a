use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::Json;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::api::log_ring::LogRing;
use crate::api::models::*;
use crate::app::persist;
use crate::app::state::GlobalState;
use crate::app::subscription;
use crate::app::supervisor::Supervisor;
use crate::app::switcher::SwitchRequest;
use crate::common::format_uptime;
use crate::config::Config;
use crate::dns;

/// 共享应用状态
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<GlobalState>,
    pub supervisor: Arc<Supervisor>,
    pub resolver: Arc<dns::Resolver>,
    pub client: reqwest::Client,
    pub cfg: Arc<Config>,
    pub ring: Arc<LogRing>,
    pub do_switch: mpsc::Sender<SwitchRequest>,
    pub do_update: mpsc::Sender<()>,
}

/// GET / - 内嵌管理界面
pub async fn get_index() -> Html<&'static str> {
    Html(include_str!("static/index.html"))
}

/// GET /api/status
pub async fn get_status(State(app): State<AppState>) -> Json<ApiResponse<StatusData>> {
    let data = StatusData {
        current_server: app.state.current_server(),
        error_count: app.state.error_count.load(Ordering::SeqCst),
        down_stats: app.state.penalty_snapshot(),
        naive_version: app.supervisor.current_binary(),
        switcher_version: env!("CARGO_PKG_VERSION").to_string(),
        auto_switch_paused: app.state.auto_switch_paused(),
        locked_server: app.state.locked_server(),
        available_servers: app.state.pool(),
        uptime: format_uptime(app.state.uptime()),
        start_time: app.state.start_time,
        worker_count: tokio::runtime::Handle::current().metrics().num_workers(),
        memory_usage_mb: memory_usage_mb(),
    };
    Json(ApiResponse::ok(data))
}

/// POST /api/switch - 发起切换请求
pub async fn post_switch(
    State(app): State<AppState>,
    Json(body): Json<SwitchBody>,
) -> impl IntoResponse {
    let request = match body.kind.as_str() {
        "auto" => SwitchRequest::Auto,
        "avoid" => SwitchRequest::Avoid {
            server: body.avoid_server,
        },
        "select" => SwitchRequest::Select {
            target: body.target_server,
        },
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<SwitchAccepted>::err(format!(
                    "unknown switch type '{}'",
                    other
                ))),
            );
        }
    };

    let _ = app.do_switch.send(request).await;

    (
        StatusCode::OK,
        Json(ApiResponse::ok(SwitchAccepted {
            message: "Switch request sent".to_string(),
            kind: body.kind,
        })),
    )
}

/// POST /api/auto-switch - 暂停/恢复自动切换
pub async fn post_auto_switch(
    State(app): State<AppState>,
    Json(body): Json<AutoSwitchBody>,
) -> impl IntoResponse {
    let paused = match body.action.as_str() {
        "pause" => true,
        "resume" => false,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<AutoSwitchChanged>::err(
                    "Invalid action. Use 'pause' or 'resume'",
                )),
            );
        }
    };

    let persisted = app.state.set_auto_switch_paused(paused);
    if let Err(e) = persist::save(app.state.base_path(), &persisted) {
        debug!(error = %format_args!("{:#}", e), "save persisted state failed");
    }

    (
        StatusCode::OK,
        Json(ApiResponse::ok(AutoSwitchChanged {
            message: format!("Auto switch {}d", body.action),
            paused,
        })),
    )
}

/// POST /api/update - 触发更新检查
pub async fn post_update(State(app): State<AppState>) -> Json<ApiResponse<UpdateAccepted>> {
    let _ = app.do_update.send(()).await;
    Json(ApiResponse::ok(UpdateAccepted {
        message: "Update check triggered".to_string(),
    }))
}

/// GET /api/logs - 日志环内容
pub async fn get_logs(State(app): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        app.ring.dump(),
    )
}

/// GET /api/subscription - 刷新订阅并列出池内主机与去重 IP
pub async fn get_subscription(State(app): State<AppState>) -> impl IntoResponse {
    let mut out = String::new();

    match subscription::fetch(&app.client, app.cfg.subscribe_url()).await {
        Ok(new_pool) => app.state.set_pool(new_pool),
        Err(e) => {
            let _ = writeln!(out, "{:#}", e);
        }
    }

    let pool = app.state.pool();
    let _ = writeln!(out, "{} servers in pool", pool.len());

    let host_ips = app.resolver.batch_lookup_urls(&pool).await;
    for (host, ips) in &host_ips {
        let _ = writeln!(out, "{}: {:?}", host, ips);
    }

    out.push_str("\n\n\n");

    for ip in dns::group_by_first_ip(&pool, &host_ips).keys() {
        let _ = writeln!(out, "{}", ip);
    }

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out)
}

/// GET /api/ping - 连通性探测（每个去重 IP 取一个代表主机）
pub async fn get_ping(State(app): State<AppState>) -> impl IntoResponse {
    let pool = app.state.pool();
    let host_ips = app.resolver.batch_lookup_urls(&pool).await;
    let groups = dns::group_by_first_ip(&pool, &host_ips);

    let mut targets: Vec<String> = Vec::new();
    {
        let mut rng = rand::thread_rng();
        for group in groups.values() {
            let url = &group[rng.gen_range(0..group.len())];
            if let Some(host) = dns::host_of(url) {
                if !targets.contains(&host) {
                    targets.push(host);
                }
            }
        }
    }

    let mut set = JoinSet::new();
    for host in targets {
        set.spawn(async move {
            let start = Instant::now();
            match tokio::time::timeout(
                Duration::from_secs(10),
                TcpStream::connect((host.as_str(), 443)),
            )
            .await
            {
                Ok(Ok(_)) => format!("{}, avg: {:?}, err: none", host, start.elapsed()),
                Ok(Err(e)) => format!("{}, avg: -, err: {}", host, e),
                Err(_) => format!("{}, avg: -, err: timeout", host),
            }
        });
    }

    let mut out = String::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(line) = joined {
            let _ = writeln!(out, "{}", line);
        }
    }

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out)
}

fn memory_usage_mb() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest
                        .trim()
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<f64>().ok())
                    {
                        return format!("{:.2}", kb / 1024.0);
                    }
                }
            }
        }
    }
    "0.00".to_string()
}
