use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const UPDATE_OLD_SUB_FAILED: &str = "update old subscription failed";
pub const RENEW_FAILED: &str = "renew subscription failed";
pub const FETCH_SUB_FAILED: &str = "fetch subscription failed";
pub const SAVE_SUB_INFO_FAILED: &str = "save subscription info failed";
pub const SAVE_BASE64_CLASH_FAILED: &str = "save base64/clash failed";
pub const CHECKIN_FAILED: &str = "checkin failed";

pub const SUB_URL: &str = "sub_url";
pub const SUB_INFO: &str = "sub_info";
pub const NODE_N: &str = "node_n";
pub const TYPE: &str = "type";
pub const API_HOST: &str = "api_host";
pub const AUTH_PATH: &str = "auth_path";
pub const NAME: &str = "name";
pub const TOKEN: &str = "token";
pub const CHECKIN: &str = "checkin";

pub type CacheMap = HashMap<String, Vec<String>>;

/// Last-known state and last-known errors of one host.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: Arc<Mutex<CacheMap>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: CacheMap) -> Self {
        Self {
            entries: Arc::new(Mutex::new(map)),
        }
    }

    pub async fn pop(&self, key: &str) -> Option<Vec<String>> {
        self.entries.lock().await.remove(key)
    }

    /// Removes several keys under a single lock acquisition.
    pub async fn pop_all(&self, keys: &[&str]) {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
    }

    pub async fn set(&self, key: &str, values: Vec<String>) -> Option<Vec<String>> {
        self.entries.lock().await.insert(key.to_string(), values)
    }

    pub async fn set_one(&self, key: &str, value: impl Into<String>) -> Option<Vec<String>> {
        self.set(key, vec![value.into()]).await
    }

    pub async fn get(&self, key: &str) -> Option<Vec<String>> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn first(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(key)
            .and_then(|values| values.first().cloned())
    }

    pub async fn first_or(&self, key: &str, default: &str) -> String {
        self.first(key).await.unwrap_or_else(|| default.to_string())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn extend(&self, map: CacheMap) {
        self.entries.lock().await.extend(map);
    }

    pub async fn snapshot(&self) -> CacheMap {
        self.entries.lock().await.clone()
    }

    /// Runs `f` with exclusive access to the whole map.
    pub async fn with<R>(&self, f: impl FnOnce(&mut CacheMap) -> R) -> R {
        let mut entries = self.entries.lock().await;
        f(&mut entries)
    }
}
