use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::cache::{Cache, CacheMap};
use crate::config::{HostEntry, HostsFile};
use crate::log::RunLog;
use crate::refresh::{get_and_save, new_panel_session};

pub const DEFAULT_WORKERS: usize = 4;

/// Refreshes every host with at most `workers` in flight, in submission order.
/// Returns the final cache of each host.
pub async fn run_all(
    client: &Client,
    hosts: HostsFile,
    workers: usize,
    out_dir: &Path,
    log: &RunLog,
) -> BTreeMap<String, CacheMap> {
    let jobs: Vec<(String, HostEntry, Cache)> = hosts
        .into_iter()
        .map(|(host, entry)| {
            let cache = Cache::from_map(entry.cache.clone());
            (host, entry, cache)
        })
        .collect();
    info!("refreshing {} hosts with {} workers", jobs.len(), workers);

    stream::iter(jobs.iter())
        .for_each_concurrent(workers.max(1), |(host, entry, cache)| async move {
            if let Some(session) = new_panel_session(client, host, cache, log).await {
                get_and_save(session.as_ref(), host, &entry.opt, cache, log, out_dir).await;
            }
        })
        .await;

    let mut caches = BTreeMap::new();
    for (host, _, cache) in jobs {
        caches.insert(host, cache.snapshot().await);
    }
    caches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{TYPE, SUB_INFO};
    use crate::config::parse_hosts;

    #[tokio::test]
    async fn unsupported_hosts_keep_their_cache() {
        let hosts = parse_hosts(
            r#"{
                "a.example": {"cache": {"type": ["mystery"], "sub_info": ["1B"]}},
                "b.example": {"cache": {"type": ["other"]}}
            }"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new();

        let caches = run_all(&Client::new(), hosts, DEFAULT_WORKERS, dir.path(), &log).await;

        assert_eq!(caches.len(), 2);
        assert_eq!(caches["a.example"][TYPE], vec!["mystery"]);
        assert_eq!(caches["a.example"][SUB_INFO], vec!["1B"]);
        assert!(log.contains("a.example unsupported type: mystery"));
        assert!(log.contains("b.example unsupported type: other"));
    }
}
