use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::task::JoinSet;
use tracing::debug;

/// 基于 hickory-resolver 的 DNS 解析器
///
/// All lookups go through the resolver address from the CLI instead of the
/// system configuration, so the supervisor keeps working on hosts whose
/// default DNS is poisoned or unreachable.
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(address: &str) -> Result<Self> {
        let addr: SocketAddr = address
            .parse()
            .with_context(|| format!("invalid DNS resolver address '{}'", address))?;
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = std::time::Duration::from_secs(5);
        Ok(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        })
    }

    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self.inner.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = response.iter().collect();
        if addrs.is_empty() {
            anyhow::bail!("no addresses for {}", host);
        }
        debug!(host = host, count = addrs.len(), "resolved");
        Ok(addrs)
    }

    /// Resolve every unique host in `urls` in parallel.
    ///
    /// Returns a host → IPs map. Hosts that fail to resolve are simply
    /// absent; the caller treats them as non-candidates.
    pub async fn batch_lookup_urls(self: &Arc<Self>, urls: &[String]) -> HashMap<String, Vec<IpAddr>> {
        let mut hosts: Vec<String> = Vec::new();
        for url in urls {
            if let Some(host) = host_of(url) {
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }

        let mut set = JoinSet::new();
        for host in hosts {
            let resolver = self.clone();
            set.spawn(async move {
                let ips = resolver.lookup(&host).await.ok()?;
                Some((host, ips))
            });
        }

        let mut host_ips = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some((host, ips))) = joined {
                host_ips.insert(host, ips);
            }
        }
        host_ips
    }
}

/// Group URLs by the first IP their host resolved to.
///
/// URLs whose host did not resolve are dropped. The first-IP key is what
/// collapses mirror entries that point at the same machine.
pub fn group_by_first_ip(
    urls: &[String],
    host_ips: &HashMap<String, Vec<IpAddr>>,
) -> HashMap<IpAddr, Vec<String>> {
    let mut groups: HashMap<IpAddr, Vec<String>> = HashMap::new();
    for url in urls {
        let Some(host) = host_of(url) else { continue };
        let Some(first) = host_ips.get(&host).and_then(|ips| ips.first()) else {
            continue;
        };
        let group = groups.entry(*first).or_default();
        if !group.contains(url) {
            group.push(url.clone());
        }
    }
    groups
}

/// Host component of a proxy URL, lowercased by the URL parser.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_string())
}

/// reqwest DNS seam: routes the HTTP client's lookups through [`Resolver`],
/// mirroring the override the relay and selector already use.
pub struct ResolveAdapter(pub Arc<Resolver>);

impl reqwest::dns::Resolve for ResolveAdapter {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let resolver = self.0.clone();
        Box::pin(async move {
            match resolver.lookup(name.as_str()).await {
                Ok(ips) => {
                    let addrs: reqwest::dns::Addrs =
                        Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
                    Ok(addrs)
                }
                Err(e) => Err(Box::new(std::io::Error::other(e.to_string())) as _),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_full_url() {
        assert_eq!(
            host_of("https://u:p@a.example.com:443").as_deref(),
            Some("a.example.com")
        );
    }

    #[test]
    fn host_of_rejects_garbage() {
        assert!(host_of("not a url").is_none());
    }

    #[test]
    fn group_by_first_ip_collapses_mirrors() {
        let urls = vec![
            "https://u:p@a.example:443".to_string(),
            "https://u:p@b.example:443".to_string(),
            "https://u:p@c.example:443".to_string(),
        ];
        let mut host_ips = HashMap::new();
        host_ips.insert(
            "a.example".to_string(),
            vec!["10.0.0.1".parse().unwrap(), "10.0.0.9".parse().unwrap()],
        );
        // b shares a's first IP, c stands alone
        host_ips.insert("b.example".to_string(), vec!["10.0.0.1".parse().unwrap()]);
        host_ips.insert("c.example".to_string(), vec!["10.0.0.2".parse().unwrap()]);

        let groups = group_by_first_ip(&urls, &host_ips);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&"10.0.0.1".parse::<IpAddr>().unwrap()].len(), 2);
        assert_eq!(groups[&"10.0.0.2".parse::<IpAddr>().unwrap()].len(), 1);
    }

    #[test]
    fn group_by_first_ip_skips_unresolved() {
        let urls = vec!["https://u:p@gone.example:443".to_string()];
        let groups = group_by_first_ip(&urls, &HashMap::new());
        assert!(groups.is_empty());
    }
}
