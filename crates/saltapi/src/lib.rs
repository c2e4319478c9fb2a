//! Brine salt-api transport: authentication, lowstate execution and job
//! lookup against a SaltStack master's REST API (`rest_cherrypy`).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Which salt client executes a lowstate chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Run a module on targeted minions.
    Local,
    /// Run a runner on the master.
    Runner,
    /// Run a wheel function (key management and friends) on the master.
    Wheel,
}

/// One lowstate chunk as posted to salt-api.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LowRequest {
    pub client: ClientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tgt: Option<String>,
    pub fun: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Keyword arguments (`jid`, `id_`, `force`, ...), sent as top-level keys.
    #[serde(flatten)]
    pub kwargs: serde_json::Map<String, Json>,
}

impl LowRequest {
    fn with_client(client: ClientKind, fun: &str) -> Self {
        Self { client, tgt: None, fun: fun.to_string(), arg: None, timeout: None, kwargs: serde_json::Map::new() }
    }

    pub fn local(tgt: &str, fun: &str) -> Self {
        let mut req = Self::with_client(ClientKind::Local, fun);
        req.tgt = Some(tgt.to_string());
        req
    }

    pub fn runner(fun: &str) -> Self {
        Self::with_client(ClientKind::Runner, fun)
    }

    pub fn wheel(fun: &str) -> Self {
        Self::with_client(ClientKind::Wheel, fun)
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_arg(mut self, arg: Vec<String>) -> Self {
        self.arg = Some(arg);
        self
    }

    pub fn with_kwarg(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }
}

/// Envelope every salt-api call answers with: `{"return": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LowResponse {
    #[serde(rename = "return", default)]
    pub ret: Vec<Json>,
}

impl LowResponse {
    /// First payload element, one per posted chunk.
    pub fn first(&self) -> Option<&Json> {
        self.ret.first()
    }

    pub fn into_first(self) -> Json {
        self.ret.into_iter().next().unwrap_or(Json::Null)
    }
}

/// Login material for salt-api.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub username: String,
    pub password: String,
    /// External auth backend, `pam` unless configured otherwise.
    pub eauth: String,
}

impl Credentials {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        Self { url: url.to_string(), username: username.to_string(), password: password.to_string(), eauth: "pam".to_string() }
    }

    /// Read `BRINE_SALT_URL`, `BRINE_SALT_USER`, `BRINE_SALT_PASSWORD` and `BRINE_SALT_EAUTH`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("BRINE_SALT_URL").context("BRINE_SALT_URL is not set")?;
        let username = std::env::var("BRINE_SALT_USER").unwrap_or_default();
        let password = std::env::var("BRINE_SALT_PASSWORD").unwrap_or_default();
        let mut creds = Self::new(&url, &username, &password);
        if let Ok(eauth) = std::env::var("BRINE_SALT_EAUTH") {
            if !eauth.is_empty() {
                creds.eauth = eauth;
            }
        }
        Ok(creds)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("eauth", &self.eauth)
            .finish()
    }
}

/// Capability to talk to the control plane. Retries and backoff, if any,
/// belong to implementations; callers issue each call once.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Log in; subsequent calls reuse the resulting session.
    async fn authenticate(&self, creds: &Credentials) -> Result<()>;

    /// Execute lowstate chunks, one payload element per chunk.
    async fn low(&self, requests: &[LowRequest]) -> Result<LowResponse>;

    /// Fetch the per-minion result of a finished job.
    async fn lookup_jid(&self, jid: &str) -> Result<LowResponse> {
        self.low(&[LowRequest::runner("jobs.lookup_jid").with_kwarg("jid", jid)]).await
    }
}

fn http_timeout_secs() -> u64 {
    std::env::var("BRINE_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(90)
}

#[derive(Debug, Clone)]
struct Session {
    base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct LoginReturn {
    token: String,
    #[serde(default)]
    expire: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "return", default)]
    ret: Vec<LoginReturn>,
}

/// salt-api client over HTTP(S).
pub struct SaltApiClient {
    http: Client,
    session: RwLock<Option<Session>>,
}

impl SaltApiClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(http_timeout_secs()))
            .build()
            .context("building salt-api http client")?;
        Ok(Self { http, session: RwLock::new(None) })
    }

    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[async_trait::async_trait]
impl Transport for SaltApiClient {
    async fn authenticate(&self, creds: &Credentials) -> Result<()> {
        let t0 = Instant::now();
        let body = serde_json::json!({
            "username": creds.username,
            "password": creds.password,
            "eauth": creds.eauth,
        });
        let resp = self
            .http
            .post(Self::endpoint(&creds.url, "login"))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("connecting to salt-api at {}", creds.url))?;
        let status = resp.status();
        if !status.is_success() {
            counter!("saltapi_login_err", 1u64);
            return Err(anyhow!("salt-api login rejected with HTTP {}", status));
        }
        let login: LoginResponse = resp.json().await.context("decoding salt-api login response")?;
        let ret = login.ret.into_iter().next().ok_or_else(|| anyhow!("salt-api login returned no token"))?;
        if ret.token.is_empty() {
            return Err(anyhow!("salt-api login returned an empty token"));
        }
        *self.session.write().await = Some(Session { base: creds.url.clone(), token: ret.token });
        histogram!("saltapi_login_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(url = %creds.url, user = %creds.username, expire = ?ret.expire, "salt-api login ok");
        Ok(())
    }

    async fn low(&self, requests: &[LowRequest]) -> Result<LowResponse> {
        let t0 = Instant::now();
        let session = self.session.read().await.clone().ok_or_else(|| anyhow!("salt-api session not authenticated"))?;
        let funs: Vec<&str> = requests.iter().map(|r| r.fun.as_str()).collect();
        debug!(funs = ?funs, "salt-api low call");
        let resp = self
            .http
            .post(Self::endpoint(&session.base, ""))
            .header("Accept", "application/json")
            .header("X-Auth-Token", &session.token)
            .json(requests)
            .send()
            .await
            .context("sending lowstate to salt-api")?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.session.write().await = None;
            counter!("saltapi_low_err", 1u64);
            return Err(anyhow!("salt-api session expired (HTTP 401)"));
        }
        if !status.is_success() {
            counter!("saltapi_low_err", 1u64);
            return Err(anyhow!("salt-api call {:?} failed with HTTP {}", funs, status));
        }
        let out: LowResponse = resp.json().await.context("decoding salt-api response")?;
        histogram!("saltapi_low_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("saltapi_low_ok", 1u64);
        Ok(out)
    }
}

// ----------------- Mock implementation -----------------

/// Scripted in-memory transport for tests: answers each chunk by function name.
#[derive(Default)]
pub struct MockTransport {
    reject_login: bool,
    replies: HashMap<String, Json>,
    calls: Mutex<Vec<LowRequest>>,
    logins: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `fun` with `payload` as the first `return` element.
    pub fn reply(mut self, fun: &str, payload: Json) -> Self {
        self.replies.insert(fun.to_string(), payload);
        self
    }

    /// Answer `jobs.lookup_jid` for `jid`.
    pub fn job_result(mut self, jid: &str, payload: Json) -> Self {
        self.replies.insert(format!("jobs.lookup_jid:{}", jid), payload);
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// Every chunk received so far, in order.
    pub fn calls(&self) -> Vec<LowRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn reply_key(req: &LowRequest) -> String {
        match req.kwargs.get("jid").and_then(Json::as_str) {
            Some(jid) if req.fun == "jobs.lookup_jid" => format!("jobs.lookup_jid:{}", jid),
            _ => req.fun.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn authenticate(&self, creds: &Credentials) -> Result<()> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.reject_login {
            return Err(anyhow!("authentication failed for {}", creds.username));
        }
        Ok(())
    }

    async fn low(&self, requests: &[LowRequest]) -> Result<LowResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.extend(requests.iter().cloned());
        }
        let ret = requests
            .iter()
            .map(|req| self.replies.get(&Self::reply_key(req)).cloned().unwrap_or(Json::Null))
            .collect();
        Ok(LowResponse { ret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn low_request_serializes_like_salt_api_expects() {
        let req = LowRequest::local("*", "grains.items").with_timeout(60);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"client": "local", "tgt": "*", "fun": "grains.items", "timeout": 60})
        );

        let wheel = LowRequest::wheel("key.gen_accept").with_kwarg("id_", "web-01").with_kwarg("force", true);
        assert_eq!(
            serde_json::to_value(&wheel).unwrap(),
            json!({"client": "wheel", "fun": "key.gen_accept", "id_": "web-01", "force": true})
        );
    }

    #[test]
    fn low_request_parses_back_with_kwargs() {
        let raw = json!({"client": "runner", "fun": "jobs.lookup_jid", "jid": "2024"});
        let req: LowRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.client, ClientKind::Runner);
        assert_eq!(req.tgt, None);
        assert_eq!(req.kwargs.get("jid"), Some(&json!("2024")));
    }

    #[test]
    fn response_first_tolerates_missing_return() {
        let empty: LowResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.first().is_none());
        assert_eq!(empty.into_first(), Json::Null);

        let resp: LowResponse = serde_json::from_value(json!({"return": [{"h1": {}}, 7]})).unwrap();
        assert_eq!(resp.first(), Some(&json!({"h1": {}})));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("https://salt:8000", "admin", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hunter2"), "{}", shown);
        assert_eq!(creds.eauth, "pam");
    }

    #[tokio::test]
    async fn mock_routes_job_lookups_by_jid() {
        let mock = MockTransport::new().job_result("42", json!({"h1": {"ok": true}}));
        assert_eq!(mock.lookup_jid("42").await.unwrap().into_first(), json!({"h1": {"ok": true}}));
        assert_eq!(mock.lookup_jid("43").await.unwrap().into_first(), Json::Null);
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].fun, "jobs.lookup_jid");
        assert_eq!(calls[0].client, ClientKind::Runner);
    }

    #[tokio::test]
    async fn low_without_login_is_an_error() {
        let client = SaltApiClient::new().unwrap();
        let err = client.low(&[LowRequest::runner("manage.status")]).await.unwrap_err();
        assert!(err.to_string().contains("not authenticated"), "{}", err);
    }
}
