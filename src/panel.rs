use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::cache::{Cache, CacheMap, API_HOST, TYPE};
use crate::config::HostOptions;
use crate::error::{Error, Result};
use crate::log::RunLog;
use crate::v2board::V2boardSession;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

fn build_user_agent() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers
}

pub fn build_client() -> Result<Client> {
    Client::builder()
        .default_headers(build_user_agent())
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(Error::from)
}

/// Outcome of the renewal decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Keep,
    Renew,
    ForceReg,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    /// `upload`, `download`, `total` and optionally `expire`.
    pub info: Option<Value>,
    pub base64: String,
    pub clash: String,
    pub base64_url: String,
    pub clash_url: String,
}

#[async_trait]
pub trait PanelSession: Send + Sync {
    fn host(&self) -> &str;

    /// Scheme and authority the panel API answers on.
    fn origin(&self) -> String;

    async fn should_turn(
        &self,
        opt: &HostOptions,
        cache: &Cache,
    ) -> Result<(Turn, Option<Subscription>)>;

    async fn do_turn(
        &self,
        opt: &HostOptions,
        cache: &Cache,
        log: &RunLog,
        force_reg: bool,
    ) -> Result<()>;

    async fn fetch_sub(&self, url: &str, opt: &HostOptions, cache: &Cache) -> Result<Subscription>;

    /// Returns the panel's check-in message, if it gave one.
    async fn checkin(&self, opt: &HostOptions, cache: &Cache) -> Result<Option<String>>;
}

/// Probes the known endpoint shapes of `host`.
///
/// `Ok(Some(info))` carries the keys to merge into the host cache,
/// `Ok(None)` means nothing recognizable answered.
pub async fn guess_panel(client: &Client, host: &str) -> Result<Option<CacheMap>> {
    let config_url = format!("https://{host}/api/v1/guest/comm/config");
    let response = client.get(&config_url).send().await?;
    if response.status().is_success() {
        let text = response.text().await?;
        if let Ok(json) = serde_json::from_str::<Value>(&text) {
            if json["data"].is_object() {
                debug!("{} answers v2board guest config", host);
                let mut info = CacheMap::new();
                info.insert(TYPE.to_string(), vec!["v2board".to_string()]);
                info.insert(API_HOST.to_string(), vec![host.to_string()]);
                return Ok(Some(info));
            }
        }
    }

    let home = client.get(format!("https://{host}/")).send().await?.text().await?;
    if looks_like_sspanel(&home) {
        return Err(Error::Panel(format!("unsupported panel type: sspanel ({host})")));
    }

    Ok(None)
}

fn looks_like_sspanel(html: &str) -> bool {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(r#"a[href="/auth/login"], form[action="/auth/login"]"#) else {
        return false;
    };
    document.select(&selector).next().is_some()
}

pub fn panel_class_map(
    client: &Client,
    panel_type: &str,
    api_host: &str,
    auth_path: Option<&str>,
) -> Option<Box<dyn PanelSession>> {
    match panel_type {
        "v2board" => Some(Box::new(V2boardSession::new(
            client.clone(),
            api_host,
            auth_path,
        ))),
        _ => None,
    }
}
