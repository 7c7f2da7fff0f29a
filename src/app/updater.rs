use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::binaries::{self, BinaryVersion};
use crate::app::state::GlobalState;
use crate::app::supervisor::Supervisor;
use crate::config::Config;

const GITHUB_API: &str = "https://api.github.com";
const UPSTREAM_OWNER: &str = "klzgrad";
const UPSTREAM_REPO: &str = "naiveproxy";

/// The slice of a GitHub release this crate cares about.
#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// 更新检查消费者
///
/// Each trigger runs the upstream-binary check and the self-update check
/// concurrently. One CAS flag covers both, so triggers that land while a
/// check is running are dropped rather than queued.
pub struct Updater {
    state: Arc<GlobalState>,
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
    cfg: Arc<Config>,
}

impl Updater {
    pub fn new(
        state: Arc<GlobalState>,
        supervisor: Arc<Supervisor>,
        client: reqwest::Client,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            state,
            supervisor,
            client,
            cfg,
        }
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            if self
                .state
                .checking
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("update check already running, skipping");
                continue;
            }

            let this = self.clone();
            tokio::spawn(async move {
                let (upstream, own) =
                    tokio::join!(this.check_upstream_update(), this.check_self_update());
                if let Err(e) = upstream {
                    debug!(error = %format_args!("{:#}", e), "upstream update check failed");
                }
                if let Err(e) = own {
                    debug!(error = %format_args!("{:#}", e), "self-update check failed");
                }
                this.state.checking.store(false, Ordering::SeqCst);
            });
        }
    }

    /// Download a newer upstream binary if the release feed has one, then
    /// swap it in under the supervisor mutex.
    async fn check_upstream_update(&self) -> Result<()> {
        if self.state.app_token.is_cancelled() {
            debug!("shutting down, skipping naive update check");
            return Ok(());
        }

        // Half the auto-switch period bounds the whole check + download.
        let limit = Duration::from_secs(self.cfg.auto_switch_minutes * 60 / 2);
        match tokio::time::timeout(limit, self.upstream_update()).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("upstream update timed out after {:?}", limit),
        }
    }

    async fn upstream_update(&self) -> Result<()> {
        debug!("checking for naive update");
        let current = self.supervisor.current_binary();

        let Some(asset_url) =
            check_latest_release(&self.client, GITHUB_API, UPSTREAM_OWNER, UPSTREAM_REPO, &current)
                .await?
        else {
            debug!("no new version");
            return Ok(());
        };

        let new_binary =
            download_upstream(&self.client, &asset_url, self.supervisor.base_path()).await?;

        if self.state.app_token.is_cancelled() {
            debug!("shutting down, skipping naive restart after update");
            return Ok(());
        }

        let current_server = self.state.current_server();
        self.supervisor
            .replace_binary_and_restart(new_binary.clone(), &current_server)
            .await?;
        info!(binary = %new_binary, "updated upstream binary");
        Ok(())
    }

    /// Replace our own executable when the release feed carries a strictly
    /// newer tag, then request a graceful shutdown so the service manager
    /// relaunches the new build.
    async fn check_self_update(&self) -> Result<()> {
        if self.state.app_token.is_cancelled() {
            debug!("shutting down, skipping self-update check");
            return Ok(());
        }

        let Some((owner, repo)) = self.cfg.update_repo.split_once('/') else {
            anyhow::bail!("invalid update repo '{}'", self.cfg.update_repo);
        };

        let release = latest_release(&self.client, GITHUB_API, owner, repo).await?;

        let current =
            BinaryVersion::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(BinaryVersion::zero);
        let Some(latest) = BinaryVersion::parse(&release.tag_name) else {
            anyhow::bail!("unparsable release tag '{}'", release.tag_name);
        };
        if latest <= current {
            debug!(
                version = env!("CARGO_PKG_VERSION"),
                "current binary is the latest version"
            );
            return Ok(());
        }

        let wanted = self_asset_name();
        let Some(asset) = release.assets.iter().find(|a| a.name == wanted) else {
            anyhow::bail!("no release asset named '{}'", wanted);
        };

        let bytes = self
            .client
            .get(&asset.browser_download_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        replace_executable(&bytes)?;

        info!(version = %release.tag_name, "updated, requesting graceful restart");
        if let Some(notes) = release.body {
            debug!(notes = %notes, "release notes");
        }
        self.state.app_token.cancel();
        Ok(())
    }
}

async fn latest_release(
    client: &reqwest::Client,
    api_base: &str,
    owner: &str,
    repo: &str,
) -> Result<Release> {
    let url = format!("{}/repos/{}/{}/releases/latest", api_base, owner, repo);
    let release = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<Release>()
        .await
        .context("parsing release feed")?;
    Ok(release)
}

/// Asset download URL of a newer upstream build matching the installed
/// binary's OS/arch suffix, or `None` when the installed binary already
/// carries the latest tag.
pub async fn check_latest_release(
    client: &reqwest::Client,
    api_base: &str,
    owner: &str,
    repo: &str,
    current_binary: &str,
) -> Result<Option<String>> {
    let release = latest_release(client, api_base, owner, repo).await?;

    if current_binary.contains(&release.tag_name) {
        return Ok(None);
    }

    let suffix = binaries::os_arch_suffix(current_binary)?;
    for asset in &release.assets {
        if asset.name.starts_with(binaries::BINARY_PREFIX) && asset.name.contains(&suffix) {
            return Ok(Some(asset.browser_download_url.clone()));
        }
    }
    anyhow::bail!("no asset found")
}

/// Download the release archive and unpack its single `naive` entry into
/// `base`, named after the asset, mode 0755.
pub async fn download_upstream(
    client: &reqwest::Client,
    url: &str,
    base: &Path,
) -> Result<String> {
    let binary_name = binaries::asset_binary_name(url);
    let bytes = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let dest = base.join(&binary_name);
    tokio::task::spawn_blocking(move || unpack_naive(&bytes, &dest)).await??;
    Ok(binary_name)
}

fn unpack_naive(archive: &[u8], dest: &Path) -> Result<()> {
    let decoder = xz2::read::XzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_naive = entry
            .path()?
            .file_name()
            .map(|name| name == "naive")
            .unwrap_or(false);
        if !is_naive {
            continue;
        }

        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o755);
        }
        let mut out = options.open(dest)?;
        std::io::copy(&mut entry, &mut out)?;
        return Ok(());
    }

    anyhow::bail!("no naive entry in archive")
}

/// Asset naming convention for this binary's own releases.
fn self_asset_name() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("naiveswitch-{}-{}", os, arch)
}

/// Swap the running executable for `data`: write beside it, back the old one
/// up, rename into place, restore on failure.
fn replace_executable(data: &[u8]) -> Result<()> {
    let current = std::env::current_exe()?;
    let tmp = current.with_extension("new");
    std::fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))?;
    }

    let backup = current.with_extension("bak");
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(&current, &backup)?;
    if let Err(e) = std::fs::rename(&tmp, &current) {
        let _ = std::fs::rename(&backup, &current);
        return Err(e.into());
    }
    Ok(())
}
