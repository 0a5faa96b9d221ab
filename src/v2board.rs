use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use crate::cache::{Cache, SUB_URL, TOKEN};
use crate::config::HostOptions;
use crate::error::{Error, Result};
use crate::log::RunLog;
use crate::panel::{PanelSession, Subscription, Turn};
use crate::units::{as_number, str2timestamp};

const DEFAULT_AUTH_PATH: &str = "passport/auth";

lazy_static! {
    static ref USERINFO_FIELD: Regex = Regex::new(r"(upload|download|total|expire)=(\d+)").unwrap();
}

/// Session against a V2Board-style `/api/v1` panel.
pub struct V2boardSession {
    client: Client,
    host: String,
    auth_path: String,
}

impl V2boardSession {
    pub fn new(client: Client, api_host: &str, auth_path: Option<&str>) -> Self {
        let auth_path = auth_path
            .unwrap_or(DEFAULT_AUTH_PATH)
            .trim_matches('/')
            .to_string();
        Self {
            client,
            host: api_host.to_string(),
            auth_path,
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("https://{}/api/v1/{}", self.host, endpoint.trim_start_matches('/'))
    }

    async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        form: Option<&[(&str, &str)]>,
        token: Option<&str>,
    ) -> Result<Value> {
        let mut request = self.client.request(method, self.api_url(endpoint));
        if let Some(form) = form {
            request = request.form(form);
        }
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|json| json["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(status_error(status.as_u16(), &message));
        }

        Ok(serde_json::from_str(&text)?)
    }

    fn credentials<'a>(&self, opt: &'a HostOptions) -> Result<(&'a str, &'a str)> {
        match (opt.email.as_deref(), opt.password.as_deref()) {
            (Some(email), Some(password)) => Ok((email, password)),
            _ => Err(Error::Config(format!("{}: email/password not configured", self.host))),
        }
    }

    pub async fn register(&self, opt: &HostOptions) -> Result<()> {
        let (email, password) = self.credentials(opt)?;
        let endpoint = format!("{}/register", self.auth_path);
        self.make_request(
            Method::POST,
            &endpoint,
            Some(&[("email", email), ("password", password)][..]),
            None,
        )
        .await?;
        Ok(())
    }

    /// Logs in and stores the auth token in the cache.
    pub async fn login(&self, opt: &HostOptions, cache: &Cache) -> Result<String> {
        let (email, password) = self.credentials(opt)?;
        let endpoint = format!("{}/login", self.auth_path);
        let json = self
            .make_request(
                Method::POST,
                &endpoint,
                Some(&[("email", email), ("password", password)][..]),
                None,
            )
            .await?;

        let auth_data = json["data"]["auth_data"]
            .as_str()
            .ok_or_else(|| Error::Panel("login response has no auth_data".to_string()))?
            .to_string();
        debug!("{} login ok, token {}", self.host, json["data"]["token"]);
        cache.set_one(TOKEN, auth_data.clone()).await;
        Ok(auth_data)
    }

    /// Cached token if there is one, else a fresh login. The flag tells
    /// whether the token came from the cache.
    async fn token(&self, opt: &HostOptions, cache: &Cache) -> Result<(String, bool)> {
        match cache.first(TOKEN).await {
            Some(token) => Ok((token, true)),
            None => Ok((self.login(opt, cache).await?, false)),
        }
    }

    /// Authenticated call; a stale cached token is dropped and the call is
    /// retried once after a fresh login.
    async fn authed_request(
        &self,
        method: Method,
        endpoint: &str,
        opt: &HostOptions,
        cache: &Cache,
    ) -> Result<Value> {
        let (token, cached) = self.token(opt, cache).await?;
        match self
            .make_request(method.clone(), endpoint, None, Some(&token))
            .await
        {
            Err(e) if should_relogin(&e, cached) => {
                debug!("{} cached token rejected: {}", self.host, e);
                cache.pop(TOKEN).await;
                let token = self.login(opt, cache).await?;
                self.make_request(method, endpoint, None, Some(&token)).await
            }
            other => other,
        }
    }

    pub async fn get_subscribe(&self, token: &str) -> Result<Value> {
        let json = self
            .make_request(Method::GET, "user/getSubscribe", None, Some(token))
            .await?;
        Ok(json["data"].clone())
    }

    async fn fetch_text(&self, url: &str) -> Result<(String, Option<Value>)> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let info = response
            .headers()
            .get("subscription-userinfo")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_userinfo);
        Ok((response.text().await?, info))
    }
}

pub fn status_error(status: u16, message: &str) -> Error {
    let text = format!("HTTP {status}: {message}");
    match status {
        401 | 403 => Error::Unauthorized(text),
        _ => Error::Panel(text),
    }
}

pub fn should_relogin(err: &Error, token_was_cached: bool) -> bool {
    token_was_cached && err.is_unauthorized()
}

/// Outcome of the decision step once the current subscription was fetched.
/// A panel that rejects the old subscription (deleted or disabled account)
/// asks for a re-registration; transport failures stay errors.
pub fn turn_after_fetch(
    fetched: Result<Subscription>,
    opt: &HostOptions,
    now: i64,
) -> Result<(Turn, Option<Subscription>)> {
    match fetched {
        Ok(sub) => Ok((decide_turn(&sub, opt, now), Some(sub))),
        Err(e) if e.is_transport() => Err(e),
        Err(e) => {
            debug!("old subscription rejected: {}", e);
            Ok((Turn::ForceReg, None))
        }
    }
}

/// Parses `upload=1; download=2; total=3; expire=4`.
pub fn parse_userinfo(header: &str) -> Option<Value> {
    let mut info = Map::new();
    for cap in USERINFO_FIELD.captures_iter(header) {
        let value: u64 = cap[2].parse().ok()?;
        info.insert(cap[1].to_string(), json!(value));
    }
    if info.contains_key("upload") && info.contains_key("download") && info.contains_key("total") {
        Some(Value::Object(info))
    } else {
        None
    }
}

/// Maps the `user/getSubscribe` payload onto the info keys.
pub fn info_from_subscribe(data: &Value) -> Option<Value> {
    let upload = as_number(&data["u"])?;
    let download = as_number(&data["d"])?;
    let total = as_number(&data["transfer_enable"])?;
    let mut info = json!({ "upload": upload, "download": download, "total": total });
    if let Some(expire) = as_number(&data["expired_at"]) {
        info["expire"] = json!(expire as i64);
    }
    Some(info)
}

/// The clash variant of a subscribe URL is the same URL with `flag=clash`.
pub fn clash_url(base64_url: &str) -> String {
    match Url::parse(base64_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("flag", "clash");
            url.to_string()
        }
        Err(_) => base64_url.to_string(),
    }
}

/// Renewal is due when the payload lacks usable info, has expired, or is
/// about to run out of traffic.
pub fn decide_turn(sub: &Subscription, opt: &HostOptions, now: i64) -> Turn {
    let Some(info) = sub.info.as_ref() else {
        return Turn::Renew;
    };
    let (Some(upload), Some(download), Some(total)) = (
        as_number(&info["upload"]),
        as_number(&info["download"]),
        as_number(&info["total"]),
    ) else {
        return Turn::Renew;
    };

    if !opt.never_expires() && !info["expire"].is_null() {
        match str2timestamp(&info["expire"]) {
            Ok(ts) if ts > 0 && ts <= now => return Turn::Renew,
            Err(_) => return Turn::Renew,
            _ => {}
        }
    }

    let rest = total - upload - download;
    if rest <= 0.0 || opt.renew_below.is_some_and(|limit| rest < limit) {
        return Turn::Renew;
    }

    Turn::Keep
}

#[async_trait]
impl PanelSession for V2boardSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn origin(&self) -> String {
        format!("https://{}", self.host)
    }

    async fn should_turn(
        &self,
        opt: &HostOptions,
        cache: &Cache,
    ) -> Result<(Turn, Option<Subscription>)> {
        let Some(url) = cache.first(SUB_URL).await else {
            return Ok((Turn::ForceReg, None));
        };
        let fetched = self.fetch_sub(&url, opt, cache).await;
        turn_after_fetch(fetched, opt, Utc::now().timestamp())
    }

    async fn do_turn(
        &self,
        opt: &HostOptions,
        cache: &Cache,
        log: &RunLog,
        force_reg: bool,
    ) -> Result<()> {
        let data = if force_reg {
            if let Err(e) = self.register(opt).await {
                log.push(format!("{} register: {}", self.host, e));
            }
            let token = self.login(opt, cache).await?;
            self.get_subscribe(&token).await?
        } else {
            self.authed_request(Method::GET, "user/getSubscribe", opt, cache)
                .await?["data"]
                .clone()
        };

        let url = data["subscribe_url"]
            .as_str()
            .ok_or_else(|| Error::Panel("getSubscribe has no subscribe_url".to_string()))?;
        cache.set_one(SUB_URL, url).await;
        Ok(())
    }

    async fn fetch_sub(&self, url: &str, _opt: &HostOptions, cache: &Cache) -> Result<Subscription> {
        let mut parts = url.split('|');
        let base64_url = parts.next().unwrap_or_default().to_string();
        let clash_url = parts
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| clash_url(&base64_url));

        let (base64, mut info) = self.fetch_text(&base64_url).await?;
        let (clash, clash_info) = self.fetch_text(&clash_url).await?;
        info = info.or(clash_info);

        if info.is_none() {
            if let Some(token) = cache.first(TOKEN).await {
                info = self
                    .get_subscribe(&token)
                    .await
                    .ok()
                    .and_then(|data| info_from_subscribe(&data));
            }
        }

        Ok(Subscription {
            info,
            base64,
            clash,
            base64_url,
            clash_url,
        })
    }

    async fn checkin(&self, opt: &HostOptions, cache: &Cache) -> Result<Option<String>> {
        let json = self
            .authed_request(Method::POST, "user/checkin", opt, cache)
            .await?;
        Ok(json["data"]
            .as_str()
            .or_else(|| json["message"].as_str())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_with(info: Option<Value>) -> Subscription {
        Subscription {
            info,
            ..Default::default()
        }
    }

    #[test]
    fn userinfo_header() {
        let info = parse_userinfo("upload=10; download=20; total=100; expire=1700000000").unwrap();
        assert_eq!(info["upload"], 10);
        assert_eq!(info["total"], 100);
        assert_eq!(info["expire"], 1700000000u64);
        assert!(parse_userinfo("upload=1; total=2").is_none());
    }

    #[test]
    fn subscribe_payload_maps_to_info() {
        let info = info_from_subscribe(&json!({
            "u": 1, "d": "2", "transfer_enable": 10, "expired_at": null
        }))
        .unwrap();
        assert_eq!(info["download"], 2.0);
        assert!(info["expire"].is_null());
        assert!(info_from_subscribe(&json!({"u": 1})).is_none());
    }

    #[test]
    fn clash_flag_is_appended() {
        assert_eq!(
            clash_url("https://a.example/api/v1/client/subscribe?token=t"),
            "https://a.example/api/v1/client/subscribe?token=t&flag=clash"
        );
        assert_eq!(clash_url("not a url"), "not a url");
    }

    #[test]
    fn rejected_old_subscription_asks_for_registration() {
        let opt = HostOptions::default();
        let gone = Err(status_error(404, "account disabled"));
        assert_eq!(turn_after_fetch(gone, &opt, 0).unwrap(), (Turn::ForceReg, None));

        let http = Err(Error::Http("HTTP status client error (403 Forbidden)".to_string()));
        assert_eq!(turn_after_fetch(http, &opt, 0).unwrap(), (Turn::ForceReg, None));

        let timeout = Err(Error::Timeout("slow".to_string()));
        assert!(matches!(turn_after_fetch(timeout, &opt, 0), Err(Error::Timeout(_))));

        let fresh = Subscription {
            info: Some(json!({"upload": 1, "download": 1, "total": 100})),
            ..Default::default()
        };
        let (turn, sub) = turn_after_fetch(Ok(fresh.clone()), &opt, 0).unwrap();
        assert_eq!(turn, Turn::Keep);
        assert_eq!(sub, Some(fresh));
    }

    #[test]
    fn only_rejected_cached_tokens_trigger_relogin() {
        let expired = status_error(401, "token expired");
        assert!(expired.is_unauthorized());
        assert_eq!(expired.to_string(), "HTTP 401: token expired");
        assert!(should_relogin(&expired, true));
        assert!(should_relogin(&status_error(403, "forbidden"), true));

        // a token we just logged in with is not retried again
        assert!(!should_relogin(&expired, false));
        assert!(!should_relogin(&status_error(500, "oops"), true));
        assert!(!should_relogin(&Error::Timeout("slow".to_string()), true));
    }

    #[test]
    fn turn_decisions() {
        let opt = HostOptions::default();
        let now = 1_000_000;
        assert_eq!(decide_turn(&sub_with(None), &opt, now), Turn::Renew);

        let fresh = json!({"upload": 1, "download": 1, "total": 100, "expire": now + 10});
        assert_eq!(decide_turn(&sub_with(Some(fresh.clone())), &opt, now), Turn::Keep);

        let expired = json!({"upload": 1, "download": 1, "total": 100, "expire": now - 10});
        assert_eq!(decide_turn(&sub_with(Some(expired.clone())), &opt, now), Turn::Renew);

        let never = HostOptions {
            expire: Some("never".to_string()),
            ..Default::default()
        };
        assert_eq!(decide_turn(&sub_with(Some(expired)), &never, now), Turn::Keep);

        let not_a_number = json!({"upload": "NaN", "download": 1, "total": "inf"});
        assert_eq!(decide_turn(&sub_with(Some(not_a_number)), &opt, now), Turn::Renew);

        let used_up = json!({"upload": 60, "download": 40, "total": 100});
        assert_eq!(decide_turn(&sub_with(Some(used_up)), &opt, now), Turn::Renew);

        let low = HostOptions {
            renew_below: Some(50.0),
            ..Default::default()
        };
        assert_eq!(decide_turn(&sub_with(Some(fresh)), &low, now), Turn::Keep);
        let near = json!({"upload": 30, "download": 30, "total": 100});
        assert_eq!(decide_turn(&sub_with(Some(near)), &low, now), Turn::Renew);
    }
}
