use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Uniform admin API envelope: `{success, data}` or `{success, error}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// GET /api/status 响应数据
#[derive(Debug, Serialize)]
pub struct StatusData {
    pub current_server: String,
    pub error_count: i32,
    pub down_stats: HashMap<String, u32>,
    pub naive_version: String,
    pub switcher_version: String,
    pub auto_switch_paused: bool,
    pub locked_server: String,
    pub available_servers: Vec<String>,
    pub uptime: String,
    pub start_time: i64,
    pub worker_count: usize,
    pub memory_usage_mb: String,
}

/// POST /api/switch 请求体
#[derive(Debug, Deserialize)]
pub struct SwitchBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub target_server: String,
    #[serde(default)]
    pub avoid_server: String,
}

/// POST /api/auto-switch 请求体
#[derive(Debug, Deserialize)]
pub struct AutoSwitchBody {
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct SwitchAccepted {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct AutoSwitchChanged {
    pub message: String,
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct UpdateAccepted {
    pub message: String,
}
