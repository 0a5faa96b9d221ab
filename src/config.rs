use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::cache::CacheMap;
use crate::error::{Error, Result};

/// Per-host options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    pub speed_limit: Option<String>,
    pub expire: Option<String>,
    /// Regex matched against node names; matching nodes are dropped.
    pub exclude: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    /// Remaining traffic in bytes under which a renewal is requested.
    pub renew_below: Option<f64>,
    pub checkin: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl HostOptions {
    pub fn never_expires(&self) -> bool {
        self.expire.as_deref() == Some("never")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    pub opt: HostOptions,
    pub cache: CacheMap,
}

/// Hosts file: `{ "<host>": { "opt": {...}, "cache": {...} } }`. Hosts are
/// sorted by name and processed in that order.
pub type HostsFile = BTreeMap<String, HostEntry>;

pub fn parse_hosts(text: &str) -> Result<HostsFile> {
    serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
}

pub async fn load_hosts(path: &Path) -> Result<HostsFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    parse_hosts(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options_and_seed_cache() {
        let hosts = parse_hosts(
            r#"{
                "b.example": {},
                "a.example": {
                    "opt": {"expire": "never", "exclude": "HK", "checkin": true, "group": "x"},
                    "cache": {"sub_url": ["https://a.example/sub"]}
                }
            }"#,
        )
        .unwrap();

        let names: Vec<_> = hosts.keys().cloned().collect();
        assert_eq!(names, vec!["a.example", "b.example"]);

        let a = &hosts["a.example"];
        assert!(a.opt.never_expires());
        assert!(a.opt.checkin);
        assert_eq!(a.opt.exclude.as_deref(), Some("HK"));
        assert_eq!(a.opt.extra["group"], "x");
        assert_eq!(a.cache["sub_url"], vec!["https://a.example/sub"]);
        assert!(hosts["b.example"].cache.is_empty());
    }

    #[test]
    fn rejects_non_list_cache_values() {
        let err = parse_hosts(r#"{"h": {"cache": {"sub_url": "plain"}}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
