use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

const STATE_FILE: &str = "switcher_state.json";

/// Pause/lock state that survives a supervisor restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub auto_switch_paused: bool,
    #[serde(default)]
    pub locked_server: String,
}

fn state_path(base: &Path) -> std::path::PathBuf {
    base.join(STATE_FILE)
}

/// Missing file yields the default state; a corrupt one is an error.
pub fn load(base: &Path) -> Result<PersistedState> {
    let path = state_path(base);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PersistedState::default())
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}

/// Write through a sibling `.tmp` then rename, mode 0600.
pub fn save(base: &Path, state: &PersistedState) -> Result<()> {
    let path = state_path(base);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec(state)?;
    std::fs::write(&tmp, &data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
