use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::cache::*;
use crate::config::HostOptions;
use crate::convert::{gen_base64_and_clash_config, OutputPaths};
use crate::error::{Error, Result};
use crate::log::RunLog;
use crate::panel::{guess_panel, panel_class_map, PanelSession, Subscription, Turn};
use crate::units::{as_number, duration2str, size2str, str2timestamp, timestamp2str};

const NEVER_EXPIRES: &str = "never expires";

/// Moves every `|`-separated part of `url` onto `origin`, keeping path and query.
pub fn rebase_url(url: &str, origin: &str) -> String {
    let Ok(origin) = Url::parse(origin) else {
        return url.to_string();
    };
    url.split('|')
        .map(|part| match Url::parse(part) {
            Ok(mut parsed) => {
                let _ = parsed.set_scheme(origin.scheme());
                let _ = parsed.set_host(origin.host_str());
                let _ = parsed.set_port(origin.port());
                parsed.to_string()
            }
            Err(_) => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub async fn get_sub(
    session: &dyn PanelSession,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
) -> Result<Subscription> {
    let url = cache
        .first(SUB_URL)
        .await
        .ok_or_else(|| Error::Subscription("no sub_url".to_string()))?;
    let mut suffix = format!(" - {}", cache.first_or(NAME, session.host()).await);
    if let Some(limit) = &opt.speed_limit {
        suffix.push_str(&format!(" (speed limit {limit})"));
    }

    log.push(format!("fetching subscription{suffix}: {url}"));
    match session.fetch_sub(&url, opt, cache).await {
        Ok(sub) => {
            log.push(format!("fetched subscription: {url}"));
            Ok(sub)
        }
        Err(e) if e.is_transport() => {
            log.warn(format!("subscription fetch {e}: {url}"));
            Err(e)
        }
        Err(e) => {
            log.warn(format!("subscription fetch failed: {url}, {e}"));
            let rebased = rebase_url(&url, &session.origin());
            if rebased != url {
                debug!("{} sub_url moved onto {}", session.host(), rebased);
                cache.set_one(SUB_URL, rebased).await;
            }
            Err(e)
        }
    }
}

/// Decides, renews and re-fetches. Each step fails on its own marker; the
/// newest subscription obtained so far is returned.
pub async fn try_turn(
    session: &dyn PanelSession,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
) -> Option<Subscription> {
    cache
        .pop_all(&[UPDATE_OLD_SUB_FAILED, RENEW_FAILED, FETCH_SUB_FAILED])
        .await;

    let host = session.host();
    log.push(format!("checking subscription: {host}"));
    let (turn, mut sub) = match session.should_turn(opt, cache).await {
        Ok(decision) => decision,
        Err(e) => {
            cache.set_one(UPDATE_OLD_SUB_FAILED, e.to_string()).await;
            log.warn(format!(
                "update old subscription failed ({host})({}): {e}",
                cache.first_or(SUB_URL, "").await
            ));
            return None;
        }
    };

    if turn != Turn::Keep {
        if let Err(e) = session
            .do_turn(opt, cache, log, turn == Turn::ForceReg)
            .await
        {
            cache.set_one(RENEW_FAILED, e.to_string()).await;
            log.warn(format!("renew subscription failed ({host}): {e}"));
            return sub;
        }
        log.push(format!("renewed subscription: {host}"));

        match get_sub(session, opt, cache, log).await {
            Ok(fresh) => {
                log.push(format!("fetched renewed subscription: {host}"));
                sub = Some(fresh);
            }
            Err(e) => {
                cache.set_one(FETCH_SUB_FAILED, e.to_string()).await;
                log.warn(format!(
                    "fetch subscription failed ({host})({}): {e}",
                    cache.first_or(SUB_URL, "").await
                ));
            }
        }
    }

    sub
}

fn is_empty_info(info: Option<&Value>) -> bool {
    match info {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn number_field(info: &Value, key: &str) -> Result<f64> {
    let value = info
        .get(key)
        .ok_or_else(|| Error::Subscription(format!("sub info missing key: {key}")))?;
    as_number(value).ok_or_else(|| Error::Subscription(format!("sub info invalid {key}: {value}")))
}

/// Builds the `sub_info` entry: used, total, expiry, remaining.
pub fn format_sub_info(info: &Value, opt: &HostOptions, now: i64) -> Result<Vec<String>> {
    let used = number_field(info, "upload")? + number_field(info, "download")?;
    let total = number_field(info, "total")?;
    let mut rest = format!("(remaining {}", size2str(total - used));

    let expire_value = info.get("expire").unwrap_or(&Value::Null);
    let no_expire = match expire_value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    };
    let expire = if opt.never_expires() || no_expire {
        NEVER_EXPIRES.to_string()
    } else {
        let ts = str2timestamp(expire_value)
            .map_err(|e| Error::Subscription(format!("sub info invalid expire: {e}")))?;
        if DateTime::from_timestamp(ts, 0).is_none() {
            return Err(Error::Subscription(format!("sub info invalid expire: {ts}")));
        }
        rest.push(' ');
        rest.push_str(&duration2str(ts.saturating_sub(now)));
        timestamp2str(ts)
    };
    rest.push(')');

    Ok(vec![size2str(used), size2str(total), expire, rest])
}

pub async fn cache_sub_info(
    info: Option<&Value>,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
) -> Result<()> {
    if is_empty_info(info) {
        log.warn("subscription info is empty");
        return Err(Error::Subscription("no sub info".to_string()));
    }
    let info = info.unwrap_or(&Value::Null);

    let entry = format_sub_info(info, opt, Utc::now().timestamp()).map_err(|e| {
        log.warn(format!("caching subscription info: {e}"));
        e
    })?;
    cache.set(SUB_INFO, entry).await;
    log.push("cached subscription info");
    Ok(())
}

pub async fn save_sub_base64_and_clash(
    sub: &Subscription,
    host: &str,
    opt: &HostOptions,
    out_dir: &Path,
    log: &RunLog,
) -> Result<usize> {
    log.push(format!("saving subscription files: {host}"));
    let paths = OutputPaths::for_host(out_dir, host);
    match gen_base64_and_clash_config(&paths, &sub.base64, &sub.clash, opt.exclude.as_deref())
        .await
    {
        Ok(n) => {
            log.push(format!("saved subscription files: {host}"));
            Ok(n)
        }
        Err(e) => {
            log.warn(format!("saving subscription files failed: {host}, {e}"));
            Err(e)
        }
    }
}

/// Caches the info and writes the files; one failing does not stop the other.
pub async fn save_sub(
    sub: &Subscription,
    host: &str,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
    out_dir: &Path,
) {
    cache
        .pop_all(&[SAVE_SUB_INFO_FAILED, SAVE_BASE64_CLASH_FAILED])
        .await;

    if let Err(e) = cache_sub_info(sub.info.as_ref(), opt, cache, log).await {
        cache.set_one(SAVE_SUB_INFO_FAILED, e.to_string()).await;
        log.warn(format!(
            "save subscription info failed ({host})({}): {e}",
            sub.clash_url
        ));
    }

    match save_sub_base64_and_clash(sub, host, opt, out_dir, log).await {
        Ok(node_n) => {
            let change = cache
                .with(|map| {
                    let previous = map
                        .get(NODE_N)
                        .and_then(|values| values.first())
                        .and_then(|n| n.parse::<i64>().ok())
                        .unwrap_or(0);
                    map.insert(NODE_N.to_string(), vec![node_n.to_string()]);
                    node_n as i64 - previous
                })
                .await;
            if change != 0 {
                let sign = if change > 0 { "+" } else { "" };
                log.push(format!("{host} nodes {sign}{change} ({node_n})"));
            }
        }
        Err(e) => {
            cache.set_one(SAVE_BASE64_CLASH_FAILED, e.to_string()).await;
            log.warn(format!(
                "save base64/clash failed ({host})({})({}): {e}",
                sub.base64_url, sub.clash_url
            ));
        }
    }
}

pub async fn try_checkin(
    session: &dyn PanelSession,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
) {
    if !opt.checkin {
        return;
    }
    cache.pop(CHECKIN_FAILED).await;

    match session.checkin(opt, cache).await {
        Ok(message) => {
            let message = message.unwrap_or_default();
            log.push(format!("{} checkin: {}", session.host(), message));
            cache
                .set(CHECKIN, vec![message, timestamp2str(Utc::now().timestamp())])
                .await;
        }
        Err(e) => {
            cache.set_one(CHECKIN_FAILED, e.to_string()).await;
            log.warn(format!("checkin failed ({}): {e}", session.host()));
        }
    }
}

pub async fn get_and_save(
    session: &dyn PanelSession,
    host: &str,
    opt: &HostOptions,
    cache: &Cache,
    log: &RunLog,
    out_dir: &Path,
) {
    log.push(format!("processing subscription: {host}"));
    try_checkin(session, opt, cache, log).await;
    if let Some(sub) = try_turn(session, opt, cache, log).await {
        save_sub(&sub, host, opt, cache, log, out_dir).await;
    }
    log.push(format!("finished subscription: {host}"));
}

/// Panel type detection.
#[async_trait]
pub trait PanelDetector: Send + Sync {
    async fn guess(&self, host: &str) -> Result<Option<CacheMap>>;
}

#[async_trait]
impl PanelDetector for Client {
    async fn guess(&self, host: &str) -> Result<Option<CacheMap>> {
        guess_panel(self, host).await
    }
}

pub async fn new_panel_session(
    client: &Client,
    host: &str,
    cache: &Cache,
    log: &RunLog,
) -> Option<Box<dyn PanelSession>> {
    new_panel_session_with(client, client, host, cache, log).await
}

pub async fn new_panel_session_with(
    client: &Client,
    detector: &dyn PanelDetector,
    host: &str,
    cache: &Cache,
    log: &RunLog,
) -> Option<Box<dyn PanelSession>> {
    if !cache.contains(TYPE).await {
        match detector.guess(host).await {
            Ok(Some(info)) => cache.extend(info).await,
            Ok(None) => {
                log.warn(format!("{host} unknown type"));
                return None;
            }
            Err(e) => {
                log.warn(format!("{host} type detection failed: {e}"));
                return None;
            }
        }
    }

    let panel_type = cache.first(TYPE).await.unwrap_or_default();
    let api_host = cache.first_or(API_HOST, host).await;
    let auth_path = cache.first(AUTH_PATH).await;
    let session = panel_class_map(client, &panel_type, &api_host, auth_path.as_deref());
    if session.is_none() {
        log.warn(format!("{host} unsupported type: {panel_type}"));
    }
    session
}
