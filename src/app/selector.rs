use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::state::GlobalState;
use crate::dns::{self, Resolver};

/// Well-known speed-test object served by every upstream.
const PROBE_PATH: &str = "1Mb.dat";
/// Deadline shared by all concurrent probes.
const PROBE_DEADLINE: Duration = Duration::from_secs(5);
/// A probe body below this is a captive portal or an error page, not a
/// working upstream.
const PROBE_MIN_BODY: usize = 1024;
/// Stop collecting once this many candidates passed; caps tail latency.
const MAX_SURVIVORS: usize = 3;

/// Pick the best upstream out of `host_urls`.
///
/// Resolution collapses mirror entries sharing a first IP into one
/// representative, every representative is probed through itself as an HTTP
/// proxy, and survivors are ranked by accumulated penalty. A non-empty
/// `avoid` URL loses the top spot whenever a second survivor exists.
pub async fn fastest(
    resolver: &Arc<Resolver>,
    state: &GlobalState,
    host_urls: &[String],
    avoid: &str,
) -> Result<String> {
    let host_ips = resolver.batch_lookup_urls(host_urls).await;
    let groups = dns::group_by_first_ip(host_urls, &host_ips);

    let mut candidates: Vec<String> = Vec::new();
    {
        let mut rng = rand::thread_rng();
        for group in groups.values() {
            candidates.push(pick_candidate(group, avoid, &mut rng));
        }
    }

    if candidates.is_empty() {
        anyhow::bail!("no valid hosts found");
    }

    let deadline = tokio::time::Instant::now() + PROBE_DEADLINE;
    // Capacity equals the candidate count, so probe tasks never block on a
    // consumer that stopped early; a send after the receiver is gone is a
    // no-op.
    let (tx, mut rx) = mpsc::channel::<Option<String>>(candidates.len());
    for url in &candidates {
        let url = url.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout_at(deadline, probe(&url)).await {
                Ok(Ok(())) => Some(url),
                Ok(Err(e)) => {
                    debug!(host = %url, error = %e, "probe failed");
                    None
                }
                Err(_) => {
                    debug!(host = %url, "probe timed out");
                    None
                }
            };
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut survivors = Vec::new();
    let mut returned = 0usize;
    while let Some(result) = rx.recv().await {
        returned += 1;
        if let Some(url) = result {
            survivors.push(url);
            if survivors.len() >= MAX_SURVIVORS {
                break;
            }
        }
        if returned == candidates.len() {
            break;
        }
    }
    drop(rx);

    if survivors.is_empty() {
        anyhow::bail!("no valid hosts found");
    }

    let penalties = state.penalty_snapshot();

    let pool_hosts: HashSet<String> = host_urls.iter().filter_map(|u| dns::host_of(u)).collect();
    state.normalize_penalties(&pool_hosts);

    Ok(rank_survivors(survivors, &penalties, avoid))
}

/// One URL per first-IP group. Singleton groups are taken as-is; larger
/// groups draw uniformly, re-drawing on the avoid URL at most `group.len()`
/// times before falling through with whatever came up last.
fn pick_candidate<R: Rng>(group: &[String], avoid: &str, rng: &mut R) -> String {
    if group.len() == 1 {
        return group[0].clone();
    }
    let mut pick = group[rng.gen_range(0..group.len())].clone();
    let mut retries = 0;
    while pick == avoid && retries < group.len() {
        pick = group[rng.gen_range(0..group.len())].clone();
        retries += 1;
    }
    pick
}

/// Sort ascending by penalty (missing hosts count as 0, stable order breaks
/// ties) and apply the avoid fallback: a top survivor matching the avoided
/// host yields to the runner-up when one exists.
fn rank_survivors(
    mut survivors: Vec<String>,
    penalties: &HashMap<String, u32>,
    avoid: &str,
) -> String {
    survivors.sort_by_key(|url| {
        dns::host_of(url)
            .and_then(|host| penalties.get(&host).copied())
            .unwrap_or(0)
    });

    if !avoid.is_empty() && survivors.len() > 1 {
        if let (Some(top), Some(avoided)) = (dns::host_of(&survivors[0]), dns::host_of(avoid)) {
            if top == avoided {
                return survivors[1].clone();
            }
        }
    }
    survivors[0].clone()
}

/// GET the speed-test object through `url` acting as its own HTTP proxy.
async fn probe(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("no host in '{}'", url))?;
    let target = match parsed.port() {
        Some(port) => format!("{}://{}:{}/{}", parsed.scheme(), host, port, PROBE_PATH),
        None => format!("{}://{}/{}", parsed.scheme(), host, PROBE_PATH),
    };

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(url)?)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()?;

    let resp = client.get(&target).send().await?;
    let status = resp.status();
    let body = resp.bytes().await?;
    if body.len() < PROBE_MIN_BODY {
        anyhow::bail!(
            "invalid response, status code: {}, body length: {}",
            status,
            body.len()
        );
    }
    Ok(())
}
