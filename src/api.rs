//! GraphQL transport with rate-limit detection and credential rotation.
//!
//! # Architecture
//!
//! The module mirrors a decorator design:
//! - [`PageSource`]: core trait, "post this query, give me the JSON body"
//! - [`SessionClient`]: one credential slot (cookies, headers, proxy)
//! - [`RotatingClient`]: wraps every slot and applies the
//!   [`RotationPolicy`] whenever a slot is throttled
//!
//! The paginator and the enricher only see a `PageSource`, which is what the
//! tests fake.
//!
//! # Response Classification
//!
//! | Observation | Result |
//! |-------------|--------|
//! | status in `rate_limit_statuses`, or a non-200 body with a marker | [`HarvestError::RateLimited`] |
//! | body is not JSON | [`HarvestError::InvalidResponse`] |
//! | non-2xx JSON | [`HarvestError::InvalidResponse`] |
//! | `error`/`errors` present, `data` missing or null | [`HarvestError::GraphQl`] |
//!
//! [`RotatingClient`] retries GraphQL errors and 401/403 bodies on the next
//! credential and drops a credential that keeps failing.

use crate::config::{JobConfig, RotationConfig};
use crate::error::{HarvestError, Result};
use crate::rotation::{AccountLedger, FailureDecision, RotationDecision, RotationPolicy};
use crate::session::{Credential, redact_proxy};
use crate::utils::truncate_for_log;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, instrument, warn};

/// One GraphQL call: persisted document id plus its variables.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub doc_id: String,
    pub friendly_name: Option<String>,
    pub variables: Value,
}

/// Anything that can answer a [`QueryRequest`] with a JSON document.
pub trait PageSource {
    async fn post(&self, query: &QueryRequest) -> Result<Value>;
}

/// Decides whether a response means "this credential is throttled".
#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    statuses: Vec<u16>,
    /// Lower-cased markers.
    indicators: Vec<String>,
}

impl RateLimitDetector {
    pub fn new(statuses: &[u16], indicators: &[String]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            indicators: indicators.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// A 200 is never a rate limit; configured statuses always are;
    /// anything else is decided by the body markers.
    pub fn is_rate_limited(&self, status: u16, body: &str) -> bool {
        if status == 200 {
            return false;
        }
        if self.statuses.contains(&status) {
            return true;
        }
        let lower = body.to_lowercase();
        self.indicators.iter().any(|marker| lower.contains(marker.as_str()))
    }
}

/// Parse a response body. Streamed responses carry several JSON documents,
/// one per line; the first one is the page.
///
/// # Arguments
///
/// * `status` - HTTP status, only used for the error
/// * `body` - Raw response text
///
/// # Returns
///
/// The whole body as JSON if it parses, else the first non-blank line that
/// does, else [`HarvestError::InvalidResponse`] with a truncated preview.
///
/// # Examples
///
/// ```ignore
/// let page = parse_body(200, "{\"data\":{}}\n{\"label\":\"x\"}\n")?;
/// assert!(page["data"].is_object());
/// assert!(parse_body(200, "<html>").is_err());
/// ```
pub fn parse_body(status: u16, body: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| serde_json::from_str::<Value>(line).ok())
        .ok_or_else(|| HarvestError::InvalidResponse {
            status,
            preview: truncate_for_log(body, 300),
        })
}

/// Reject documents carrying GraphQL errors or no `data`.
pub fn check_graphql_errors(response: &Value) -> Result<()> {
    let Some(obj) = response.as_object() else {
        return Err(HarvestError::GraphQl("response is not a JSON object".into()));
    };
    for key in ["error", "errors"] {
        if let Some(err) = obj.get(key) {
            return Err(HarvestError::GraphQl(truncate_for_log(&err.to_string(), 300)));
        }
    }
    match obj.get("data") {
        None => Err(HarvestError::GraphQl("response has no data field".into())),
        Some(Value::Null) => Err(HarvestError::GraphQl("response data is null".into())),
        Some(_) => Ok(()),
    }
}

/// A single credential slot.
pub struct SessionClient {
    credential: Credential,
    http: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    form: BTreeMap<String, String>,
    friendly_name_field: String,
    detector: RateLimitDetector,
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("credential", &self.credential.name)
            .field("endpoint", &self.endpoint)
            .field("proxy", &self.credential.proxy.as_deref().map(redact_proxy))
            .finish()
    }
}

impl SessionClient {
    /// Build the HTTP client for `credential`, routing through its proxy if it has one.
    pub fn new(config: &JobConfig, credential: Credential) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.pacing.timeout());
        if let Some(proxy) = &credential.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = builder.build()?;

        let mut merged = config.headers.clone();
        merged.extend(credential.headers.clone());
        let mut headers = HeaderMap::new();
        for (name, value) in &merged {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HarvestError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HarvestError::Config(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        let cookie = credential.cookie_header();
        if !cookie.is_empty() {
            let value = HeaderValue::from_str(&cookie).map_err(|e| {
                HarvestError::Config(format!("cookies of {}: {e}", credential.name))
            })?;
            headers.insert(COOKIE, value);
        }

        let mut form = config.form.clone();
        form.extend(credential.form.clone());

        Ok(Self {
            credential,
            http,
            endpoint: config.endpoint.clone(),
            headers,
            form,
            friendly_name_field: config.friendly_name_field.clone(),
            detector: RateLimitDetector::new(
                &config.rotation.rate_limit_statuses,
                &config.rotation.rate_limit_indicators,
            ),
        })
    }

    pub fn name(&self) -> &str {
        &self.credential.name
    }

    /// Form fields for `query`: static form, credential form, then the query itself.
    pub fn form_for(&self, query: &QueryRequest) -> Result<Vec<(String, String)>> {
        let mut form = self.form.clone();
        if let Some(friendly) = &query.friendly_name {
            form.insert(self.friendly_name_field.clone(), friendly.clone());
        }
        form.insert("doc_id".into(), query.doc_id.clone());
        form.insert("variables".into(), serde_json::to_string(&query.variables)?);
        Ok(form.into_iter().collect())
    }
}

impl PageSource for SessionClient {
    #[instrument(level = "debug", skip_all, fields(credential = %self.credential.name, doc_id = %query.doc_id))]
    async fn post(&self, query: &QueryRequest) -> Result<Value> {
        let t0 = Instant::now();
        let form = self.form_for(query)?;
        let resp = self
            .http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .form(&form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        if self.detector.is_rate_limited(status, &body) {
            warn!(status, elapsed_ms, "Rate limiting detected");
            return Err(HarvestError::RateLimited { status });
        }

        let value = parse_body(status, &body)?;
        if !(200..300).contains(&status) {
            return Err(HarvestError::InvalidResponse {
                status,
                preview: truncate_for_log(&body, 300),
            });
        }
        check_graphql_errors(&value)?;
        debug!(status, elapsed_ms, bytes = body.len(), "GraphQL call succeeded");
        Ok(value)
    }
}

/// Wraps every credential slot and rotates between them on throttling.
///
/// Safe to share between concurrent requests: the policy and ledger sit
/// behind async mutexes, and each request reports throttling against the
/// rotation epoch it was sent under, so a burst of failures from one slot
/// rotates once. While a backoff is running every request waits for it to
/// end before sending.
///
/// Session failures (GraphQL errors, 401/403) are retried on the next slot;
/// a slot failing `max_consecutive_failures` times in a row leaves the
/// rotation and the client only gives up once none is left.
pub struct RotatingClient<S = SessionClient> {
    slots: Vec<S>,
    names: Vec<String>,
    policy: Mutex<RotationPolicy>,
    ledger: Mutex<AccountLedger>,
    ledger_path: Option<PathBuf>,
    resume_at: Mutex<Option<Instant>>,
    requests: AtomicU64,
}

impl<S> fmt::Debug for RotatingClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatingClient")
            .field("slots", &self.names)
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl RotatingClient<SessionClient> {
    /// Build one [`SessionClient`] per credential and load the ledger.
    pub async fn from_credentials(config: &JobConfig, credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(HarvestError::Config("at least one credential is required".into()));
        }
        let slots = credentials
            .into_iter()
            .map(|c| SessionClient::new(config, c))
            .collect::<Result<Vec<_>>>()?;
        let names = slots.iter().map(|s| s.name().to_string()).collect();
        let ledger = AccountLedger::load(&config.paths.ledger).await;
        Ok(Self::new(slots, names, config.rotation.clone(), ledger)
            .with_ledger_path(config.paths.ledger.clone()))
    }
}

impl<S: PageSource> RotatingClient<S> {
    pub fn new(slots: Vec<S>, names: Vec<String>, rotation: RotationConfig, ledger: AccountLedger) -> Self {
        let policy = RotationPolicy::new(slots.len(), rotation);
        Self {
            slots,
            names,
            policy: Mutex::new(policy),
            ledger: Mutex::new(ledger),
            ledger_path: None,
            resume_at: Mutex::new(None),
            requests: AtomicU64::new(0),
        }
    }

    pub fn with_ledger_path(mut self, path: PathBuf) -> Self {
        self.ledger_path = Some(path);
        self
    }

    /// Requests issued so far, rotations and retries included.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub async fn ledger(&self) -> AccountLedger {
        self.ledger.lock().await.clone()
    }

    /// Mark the slot in use as available again; call once the job is over.
    pub async fn release(&self) {
        let slot = self.policy.lock().await.current();
        let name = self.slot_name(slot).to_string();
        self.update_ledger(|l| l.mark_available(&name)).await;
    }

    /// Sleep until a running backoff ends, if one is running.
    async fn wait_for_backoff(&self) {
        let until = *self.resume_at.lock().await;
        if let Some(until) = until.filter(|u| *u > Instant::now()) {
            debug!(remaining = ?(until - Instant::now()), "Waiting for backoff to end");
            sleep_until(until).await;
        }
    }

    fn slot_name(&self, slot: usize) -> &str {
        self.names.get(slot).map(String::as_str).unwrap_or("?")
    }

    async fn update_ledger(&self, update: impl FnOnce(&mut AccountLedger)) {
        let mut ledger = self.ledger.lock().await;
        update(&mut ledger);
        if let Some(path) = &self.ledger_path {
            if let Err(e) = ledger.save(path).await {
                warn!(error = %e, "Failed to save account ledger");
            }
        }
    }
}

impl<S: PageSource> PageSource for RotatingClient<S> {
    #[instrument(level = "debug", skip_all, fields(doc_id = %query.doc_id))]
    async fn post(&self, query: &QueryRequest) -> Result<Value> {
        loop {
            self.wait_for_backoff().await;
            let (slot, epoch) = {
                let policy = self.policy.lock().await;
                if policy.usable() == 0 {
                    return Err(HarvestError::CredentialsExhausted {
                        disabled: policy.disabled(),
                    });
                }
                (policy.current(), policy.epoch())
            };
            let count = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 {
                let name = self.slot_name(slot).to_string();
                self.update_ledger(|l| l.mark_busy(&name)).await;
            }

            match self.slots[slot].post(query).await {
                Ok(value) => {
                    if self.policy.lock().await.on_success(slot) {
                        let name = self.slot_name(slot).to_string();
                        self.update_ledger(|l| l.mark_recovered(&name)).await;
                    }
                    if count % 50 == 0 {
                        info!(requests = count, credential = self.slot_name(slot), "Request progress");
                    }
                    return Ok(value);
                }
                Err(HarvestError::RateLimited { status }) => {
                    let decision = {
                        let mut policy = self.policy.lock().await;
                        let Some(decision) = policy.report_rate_limited(epoch) else {
                            continue;
                        };
                        if let RotationDecision::Backoff { delay, .. } = &decision {
                            *self.resume_at.lock().await = Some(Instant::now() + *delay);
                        }
                        decision
                    };

                    let throttled = self.slot_name(slot).to_string();
                    let next = match &decision {
                        RotationDecision::Rotate { to } | RotationDecision::Backoff { to, .. } => {
                            Some(self.slot_name(*to).to_string())
                        }
                        RotationDecision::Abort { .. } => None,
                    };
                    self.update_ledger(|l| {
                        l.mark_rate_limited(&throttled);
                        if let Some(next) = &next {
                            l.mark_busy(next);
                        }
                    })
                    .await;

                    match decision {
                        RotationDecision::Rotate { to } => {
                            info!(from = %throttled, to = self.slot_name(to), status, "Rotated credential after rate limit");
                        }
                        RotationDecision::Backoff { delay, round, to } => {
                            warn!(
                                ?delay,
                                round,
                                next = self.slot_name(to),
                                status,
                                "Every credential throttled; backing off"
                            );
                            sleep(delay).await;
                            info!(round, "Resuming after backoff");
                        }
                        RotationDecision::Abort { rounds } => {
                            error!(rounds, "Giving up: persistent rate limiting");
                            return Err(HarvestError::RotationExhausted { attempts: rounds });
                        }
                    }
                }
                Err(e) if e.is_session_failure() => {
                    let decision = self.policy.lock().await.on_session_failure(slot);
                    let failed = self.slot_name(slot).to_string();
                    match decision {
                        FailureDecision::Retry { to, failures } => {
                            let next = self.slot_name(to).to_string();
                            self.update_ledger(|l| {
                                l.mark_failed(&failed, failures);
                                l.mark_busy(&next);
                            })
                            .await;
                            warn!(credential = %failed, failures, next = %next, error = %e, "Session failure; retrying");
                        }
                        FailureDecision::Removed { to } => {
                            let next = self.slot_name(to).to_string();
                            self.update_ledger(|l| {
                                l.mark_disabled(&failed);
                                l.mark_busy(&next);
                            })
                            .await;
                            warn!(credential = %failed, next = %next, error = %e, "Credential removed after repeated failures");
                        }
                        FailureDecision::Exhausted { disabled } => {
                            self.update_ledger(|l| l.mark_disabled(&failed)).await;
                            error!(credential = %failed, disabled, error = %e, "No usable credential left");
                            return Err(HarvestError::CredentialsExhausted { disabled });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcome of probing one credential.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Ok,
    RateLimited,
    Failed(String),
}

/// Issue `query` once per credential, without rotation.
#[instrument(level = "info", skip_all, fields(credentials = credentials.len()))]
pub async fn probe_credentials(
    config: &JobConfig,
    credentials: Vec<Credential>,
    query: &QueryRequest,
) -> Vec<(String, ProbeOutcome)> {
    let mut results = Vec::with_capacity(credentials.len());
    for credential in credentials {
        let name = credential.name.clone();
        let outcome = match SessionClient::new(config, credential) {
            Ok(client) => classify_probe(client.post(query).await),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        };
        match &outcome {
            ProbeOutcome::Ok => info!(credential = %name, "Credential works"),
            ProbeOutcome::RateLimited => warn!(credential = %name, "Credential is rate limited"),
            ProbeOutcome::Failed(reason) => warn!(credential = %name, %reason, "Credential failed"),
        }
        results.push((name, outcome));
    }
    results
}

fn classify_probe(result: Result<Value>) -> ProbeOutcome {
    match result {
        Ok(_) => ProbeOutcome::Ok,
        Err(HarvestError::RateLimited { .. }) => ProbeOutcome::RateLimited,
        Err(e) => ProbeOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays scripted results in order and records the queries it saw.
    pub(crate) struct ScriptedSource {
        pub responses: StdMutex<VecDeque<Result<Value>>>,
        pub seen: StdMutex<Vec<QueryRequest>>,
        latency: Option<std::time::Duration>,
    }

    impl ScriptedSource {
        pub(crate) fn new(responses: Vec<Result<Value>>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
                seen: StdMutex::new(Vec::new()),
                latency: None,
            }
        }

        /// Hold every answer for `latency` after picking it, so concurrent
        /// callers are in flight together.
        pub(crate) fn with_latency(mut self, latency: std::time::Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        pub(crate) fn seen(&self) -> Vec<QueryRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PageSource for ScriptedSource {
        async fn post(&self, query: &QueryRequest) -> Result<Value> {
            self.seen.lock().unwrap().push(query.clone());
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HarvestError::GraphQl("script exhausted".into())));
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            response
        }
    }

    fn query() -> QueryRequest {
        QueryRequest {
            doc_id: "1".into(),
            friendly_name: None,
            variables: json!({}),
        }
    }

    fn no_wait_rotation(max_attempts: u32) -> RotationConfig {
        RotationConfig {
            max_backoff_attempts: max_attempts,
            base_backoff_secs: 0,
            max_backoff_secs: 0,
            max_jitter_ms: 0,
            ..RotationConfig::default()
        }
    }

    fn rotating(slots: Vec<ScriptedSource>, max_attempts: u32) -> RotatingClient<ScriptedSource> {
        let names = (0..slots.len()).map(|i| format!("cred-{i}")).collect();
        RotatingClient::new(slots, names, no_wait_rotation(max_attempts), AccountLedger::default())
    }

    #[test]
    fn test_rate_limit_detection() {
        let detector = RateLimitDetector::new(&[429, 403, 503], &["Too many requests".to_string()]);
        assert!(!detector.is_rate_limited(200, "Too many requests"));
        assert!(detector.is_rate_limited(429, ""));
        assert!(detector.is_rate_limited(400, "<html>TOO MANY REQUESTS</html>"));
        assert!(!detector.is_rate_limited(500, "internal error"));
    }

    #[test]
    fn test_graphql_error_detection() {
        assert!(check_graphql_errors(&json!({"data": {"x": 1}})).is_ok());
        assert!(check_graphql_errors(&json!({"errors": [{"message": "bad"}]})).is_err());
        assert!(check_graphql_errors(&json!({"error": 1357001})).is_err());
        assert!(check_graphql_errors(&json!({"data": null})).is_err());
        assert!(check_graphql_errors(&json!({"extensions": {}})).is_err());
        assert!(check_graphql_errors(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_parse_body_streamed_and_invalid() {
        let streamed = "{\"data\":{\"page\":1}}\n{\"label\":\"deferred\"}\n";
        assert_eq!(parse_body(200, streamed).unwrap()["data"]["page"], 1);

        let err = parse_body(200, "<html>login</html>").unwrap_err();
        assert!(matches!(err, HarvestError::InvalidResponse { status: 200, .. }));
    }

    #[test]
    fn test_form_merges_layers() {
        let mut config = crate::config::parse_config(crate::config::tests::MINIMAL).unwrap();
        config.form.insert("token".into(), "static".into());
        config.form.insert("rev".into(), "1".into());
        let credential = Credential {
            name: "a".into(),
            form: [("token".to_string(), "mine".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let client = SessionClient::new(&config, credential).unwrap();
        let form: BTreeMap<String, String> = client
            .form_for(&QueryRequest {
                doc_id: "42".into(),
                friendly_name: Some("Search".into()),
                variables: json!({"cursor": "c"}),
            })
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(form["token"], "mine");
        assert_eq!(form["rev"], "1");
        assert_eq!(form["doc_id"], "42");
        assert_eq!(form["fb_api_req_friendly_name"], "Search");
        assert_eq!(form["variables"], "{\"cursor\":\"c\"}");
    }

    #[tokio::test]
    async fn test_rotating_client_moves_to_next_slot() {
        let slots = vec![
            ScriptedSource::new(vec![Err(HarvestError::RateLimited { status: 429 })]),
            ScriptedSource::new(vec![Ok(json!({"data": 1}))]),
        ];
        let client = rotating(slots, 1);
        assert_eq!(client.post(&query()).await.unwrap()["data"], 1);
        assert_eq!(client.requests(), 2);

        let ledger = client.ledger().await;
        assert_eq!(ledger.accounts["cred-0"].rate_limit_count, 1);
        assert_eq!(
            ledger.accounts["cred-1"].status,
            crate::rotation::AccountState::Busy
        );
    }

    #[tokio::test]
    async fn test_rotating_client_backs_off_then_succeeds() {
        let slots = vec![ScriptedSource::new(vec![
            Err(HarvestError::RateLimited { status: 429 }),
            Err(HarvestError::RateLimited { status: 429 }),
            Ok(json!({"data": "ok"})),
        ])];
        let client = rotating(slots, 2);
        assert_eq!(client.post(&query()).await.unwrap()["data"], "ok");
        assert_eq!(client.requests(), 3);
    }

    #[tokio::test]
    async fn test_rotating_client_aborts_when_exhausted() {
        let slots = vec![
            ScriptedSource::new(vec![
                Err(HarvestError::RateLimited { status: 429 }),
                Err(HarvestError::RateLimited { status: 429 }),
            ]),
            ScriptedSource::new(vec![
                Err(HarvestError::RateLimited { status: 503 }),
                Err(HarvestError::RateLimited { status: 503 }),
            ]),
        ];
        let client = rotating(slots, 1);
        let err = client.post(&query()).await.unwrap_err();
        assert!(matches!(err, HarvestError::RotationExhausted { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_concurrent_throttling_counts_one_backoff_round() {
        let throttled = || Err(HarvestError::RateLimited { status: 429 });
        let slot = ScriptedSource::new(vec![
            throttled(),
            throttled(),
            throttled(),
            throttled(),
            Ok(json!({"data": 1})),
            Ok(json!({"data": 2})),
            Ok(json!({"data": 3})),
            Ok(json!({"data": 4})),
        ])
        .with_latency(std::time::Duration::from_millis(20));
        let client = rotating(vec![slot], 1);

        let q = query();
        let results = futures::future::join_all((0..4).map(|_| client.post(&q))).await;
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
        assert_eq!(client.requests(), 8);
        assert_eq!(client.ledger().await.accounts["cred-0"].rate_limit_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_throttling_does_not_skip_slots() {
        let throttled = || Err(HarvestError::RateLimited { status: 429 });
        let slots = vec![
            ScriptedSource::new(vec![throttled(), throttled(), throttled()])
                .with_latency(std::time::Duration::from_millis(20)),
            ScriptedSource::new(vec![Ok(json!({"data": 1})), Ok(json!({"data": 2})), Ok(json!({"data": 3}))]),
            ScriptedSource::new(vec![]),
        ];
        let client = rotating(slots, 1);

        let q = query();
        let results = futures::future::join_all((0..3).map(|_| client.post(&q))).await;
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
        assert!(client.slots[2].seen().is_empty());
        assert_eq!(client.policy.lock().await.current(), 1);
    }

    #[tokio::test]
    async fn test_session_failure_retries_on_next_slot() {
        let slots = vec![
            ScriptedSource::new(vec![Err(HarvestError::GraphQl("bad session".into()))]),
            ScriptedSource::new(vec![Ok(json!({"data": 1}))]),
        ];
        let client = rotating(slots, 1);
        assert_eq!(client.post(&query()).await.unwrap()["data"], 1);
        assert_eq!(client.ledger().await.accounts["cred-0"].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_dead_credential_is_removed_and_job_continues() {
        let dead = || Err(HarvestError::InvalidResponse { status: 401, preview: "login".into() });
        let slots = vec![
            ScriptedSource::new(vec![dead(), dead(), dead()]),
            ScriptedSource::new(vec![
                Err(HarvestError::RateLimited { status: 429 }),
                Err(HarvestError::RateLimited { status: 429 }),
                Ok(json!({"data": "a"})),
            ]),
        ];
        let client = rotating(slots, 5);

        // slot 0 fails, slot 1 throttles back to slot 0 twice before slot 0 is removed
        assert_eq!(client.post(&query()).await.unwrap()["data"], "a");
        let policy = client.policy.lock().await;
        assert_eq!(policy.usable(), 1);
        assert_eq!(policy.current(), 1);
        drop(policy);

        let ledger = client.ledger().await;
        assert_eq!(ledger.accounts["cred-0"].status, crate::rotation::AccountState::Disabled);
        assert_eq!(client.slots[0].seen().len(), 3);
    }

    #[tokio::test]
    async fn test_all_credentials_failing_halts() {
        let bad = || Err(HarvestError::GraphQl("expired".into()));
        let client = rotating(vec![ScriptedSource::new(vec![bad(), bad(), bad()])], 1);
        let err = client.post(&query()).await.unwrap_err();
        assert!(matches!(err, HarvestError::CredentialsExhausted { disabled: 1 }));
        assert!(err.is_fatal());

        // later calls stop before sending anything
        let again = client.post(&query()).await.unwrap_err();
        assert!(matches!(again, HarvestError::CredentialsExhausted { .. }));
        assert_eq!(client.requests(), 3);
    }

    #[tokio::test]
    async fn test_rotating_client_passes_other_errors_through() {
        let slots = vec![
            ScriptedSource::new(vec![Err(HarvestError::InvalidResponse {
                status: 500,
                preview: "oops".into(),
            })]),
            ScriptedSource::new(vec![Ok(json!({"data": 1}))]),
        ];
        let client = rotating(slots, 1);
        assert!(matches!(
            client.post(&query()).await,
            Err(HarvestError::InvalidResponse { status: 500, .. })
        ));
        assert!(client.slots[1].seen().is_empty());
    }

    #[test]
    fn test_classify_probe() {
        assert_eq!(classify_probe(Ok(json!({}))), ProbeOutcome::Ok);
        assert_eq!(
            classify_probe(Err(HarvestError::RateLimited { status: 429 })),
            ProbeOutcome::RateLimited
        );
        assert!(matches!(
            classify_probe(Err(HarvestError::GraphQl("x".into()))),
            ProbeOutcome::Failed(_)
        ));
    }
}
