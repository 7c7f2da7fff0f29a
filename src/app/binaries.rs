use std::cmp::Ordering;
use std::path::Path;

use anyhow::Result;

/// Version parsed from an upstream binary file name or a release tag.
///
/// Upstream tags carry four dotted components (`v130.0.6723.40-5`), so this
/// is deliberately looser than strict semver: any number of numeric
/// components, compared left to right, with an optional trailing build part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryVersion {
    parts: Vec<u64>,
    build: Option<String>,
}

impl BinaryVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let (numbers, build) = match s.split_once('-') {
            Some((n, b)) => (n, Some(b.to_string())),
            None => (s, None),
        };
        let parts: Option<Vec<u64>> = numbers.split('.').map(|p| p.parse().ok()).collect();
        let parts = parts?;
        if parts.is_empty() {
            return None;
        }
        Some(Self { parts, build })
    }

    pub fn zero() -> Self {
        Self {
            parts: vec![0],
            build: None,
        }
    }
}

impl PartialOrd for BinaryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinaryVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.build.cmp(&other.build)
    }
}

/// File-name prefix of upstream binaries, e.g.
/// `naiveproxy-v130.0.6723.40-5-linux-x64`.
pub const BINARY_PREFIX: &str = "naiveproxy";

/// Version embedded in a binary file name, `0` when absent or unparsable.
pub fn binary_version(file_name: &str) -> BinaryVersion {
    file_name
        .split('-')
        .nth(1)
        .and_then(BinaryVersion::parse)
        .unwrap_or_else(BinaryVersion::zero)
}

/// The OS/arch suffix of a binary file name (`linux-x64`, `mac-x64`, ...).
/// Everything after the third dash, joined back together.
pub fn os_arch_suffix(file_name: &str) -> Result<String> {
    let split: Vec<&str> = file_name.split('-').collect();
    if split.len() > 3 {
        Ok(split[3..].join("-"))
    } else {
        anyhow::bail!("no os arch suffix in '{}'", file_name)
    }
}

/// Recursively collect upstream binary file names under `base`.
fn binary_list(base: &Path) -> Vec<String> {
    let mut found = Vec::new();
    collect_binaries(base, &mut found);
    found
}

fn collect_binaries(dir: &Path, found: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_binaries(&path, found);
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with(BINARY_PREFIX) {
                found.push(name.to_string());
            }
        }
    }
}

/// The newest locally installed upstream binary, by embedded version.
pub fn find_latest(base: &Path) -> Result<String> {
    latest_of(binary_list(base))
}

fn latest_of(mut names: Vec<String>) -> Result<String> {
    if names.is_empty() {
        anyhow::bail!("no naive binary found");
    }
    names.sort_by(|a, b| binary_version(a).cmp(&binary_version(b)));
    Ok(names.pop().expect("non-empty list"))
}

/// Binary file name derived from a release asset URL: the base name with
/// `.tar.xz` (or a single extension) stripped.
pub fn asset_binary_name(url: &str) -> String {
    let file_name = url.rsplit('/').next().unwrap_or(url);
    if let Some(stripped) = file_name.strip_suffix(".tar.xz") {
        return stripped.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, _ext)) => stem.to_string(),
        None => file_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_of_orders_by_version() {
        let cases: Vec<(Vec<&str>, &str)> = vec![
            (vec!["naiveproxy-v0.0.1"], "naiveproxy-v0.0.1"),
            (
                vec!["naiveproxy-v0.0.1", "naiveproxy-v0.0.2"],
                "naiveproxy-v0.0.2",
            ),
            (
                vec!["naiveproxy-v0.0.2", "naiveproxy-v0.0.1"],
                "naiveproxy-v0.0.2",
            ),
            (
                vec!["naiveproxy-v0.0.1", "naiveproxy-v0.0.3", "naiveproxy-v0.0.1"],
                "naiveproxy-v0.0.3",
            ),
            (
                vec!["naiveproxy-v130.0.6723.40-5-linux-x64", "naiveproxy-v131.0.6778.86-1-linux-x64"],
                "naiveproxy-v131.0.6778.86-1-linux-x64",
            ),
        ];
        for (names, expected) in cases {
            let names: Vec<String> = names.into_iter().map(String::from).collect();
            assert_eq!(latest_of(names).unwrap(), expected);
        }
    }

    #[test]
    fn latest_of_empty_errors() {
        assert!(latest_of(Vec::new()).is_err());
    }

    #[test]
    fn four_component_versions_compare() {
        let old = BinaryVersion::parse("v130.0.6723.40").unwrap();
        let new = BinaryVersion::parse("v130.0.6723.41").unwrap();
        assert!(new > old);
        let major = BinaryVersion::parse("v131.0.0.1").unwrap();
        assert!(major > new);
    }

    #[test]
    fn unparsable_version_falls_back_to_zero() {
        assert_eq!(binary_version("naiveproxy"), BinaryVersion::zero());
        assert_eq!(binary_version("naiveproxy-garbage"), BinaryVersion::zero());
    }

    #[test]
    fn os_arch_suffix_cases() {
        assert_eq!(
            os_arch_suffix("naiveproxy-v0.0.1-5-mac-x64").unwrap(),
            "mac-x64"
        );
        assert_eq!(
            os_arch_suffix("naiveproxy-v0.0.1-5-mac-x64-1").unwrap(),
            "mac-x64-1"
        );
        assert!(os_arch_suffix("naiveproxy-v0.0.1").is_err());
    }

    #[test]
    fn asset_binary_name_strips_archive_extensions() {
        assert_eq!(asset_binary_name("https://github.com/a.tar.xz"), "a");
        assert_eq!(asset_binary_name("https://github.com/a.zip"), "a");
        assert_eq!(asset_binary_name("https://github.com/a"), "a");
        assert_eq!(
            asset_binary_name(
                "https://example.com/dl/naiveproxy-v131.0.6778.86-1-linux-x64.tar.xz"
            ),
            "naiveproxy-v131.0.6778.86-1-linux-x64"
        );
    }

    #[test]
    fn find_latest_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("naiveproxy-v0.0.1-5-linux-x64"), b"x").unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("naiveproxy-v0.0.2-5-linux-x64"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"x").unwrap();
        assert_eq!(
            find_latest(dir.path()).unwrap(),
            "naiveproxy-v0.0.2-5-linux-x64"
        );
    }
}
