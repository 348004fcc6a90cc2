//! Auth manager.
//!
//! Sole owner of all [`Auth`] entries. Every other component receives clones
//! or snapshots; every mutation funnels through `mark_result`, `update`, or
//! the registry operations, which persist through the credential store and
//! publish terminal outcomes on the usage stream.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use credential::{
    merge_runtime_failure_state, Auth, AuthStore, Classification, Error,
};
use executor::{Executor, Options, Request, Response, StreamReceiver, STREAM_CHANNEL_CAPACITY};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};
use usage_events::{EventStreamManager, RequestEvent};

use crate::config::{ManagerConfig, RetryConfig};
use crate::cooldown::{apply_failure, apply_success};
use crate::drill::{
    proxy_failure_error, quota_exhausted_error, DrillFaults, SCENARIO_ACCOUNT_QUOTA_EXHAUSTED,
    SCENARIO_PROXY_FAILURE,
};
use crate::egress::{EgressMappingSnapshot, EgressTracker};
use crate::selector::Selector;

/// Terminal outcome of one executor attempt, ingested via `mark_result`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub error: Option<Error>,
}

struct StreamAttempt {
    auth_id: String,
    provider: String,
    rx: StreamReceiver,
}

/// The credential pool control plane.
pub struct Manager {
    auths: RwLock<HashMap<String, Auth>>,
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
    selector: Box<dyn Selector>,
    store: Option<Arc<dyn AuthStore>>,
    config: RwLock<ManagerConfig>,
    retry: RwLock<RetryConfig>,
    drill: DrillFaults,
    egress: AsyncMutex<EgressTracker>,
    usage: Option<Arc<EventStreamManager>>,
    /// Handle back to the owning Arc so streaming drivers can be spawned
    /// from `&self` methods.
    weak_self: Weak<Manager>,
}

/// Builder for [`Manager`]; the manager is always handed out as an `Arc`.
pub struct ManagerBuilder {
    selector: Box<dyn Selector>,
    store: Option<Arc<dyn AuthStore>>,
    usage: Option<Arc<EventStreamManager>>,
}

impl ManagerBuilder {
    pub fn with_store(mut self, store: Arc<dyn AuthStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_usage_stream(mut self, usage: Arc<EventStreamManager>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> Arc<Manager> {
        Arc::new_cyclic(|weak| Manager {
            auths: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            selector: self.selector,
            store: self.store,
            config: RwLock::new(ManagerConfig::default()),
            retry: RwLock::new(RetryConfig::default()),
            drill: DrillFaults::default(),
            egress: AsyncMutex::new(EgressTracker::default()),
            usage: self.usage,
            weak_self: weak.clone(),
        })
    }
}

impl Manager {
    pub fn builder(selector: Box<dyn Selector>) -> ManagerBuilder {
        ManagerBuilder {
            selector,
            store: None,
            usage: None,
        }
    }

    // --- registry ------------------------------------------------------

    pub async fn register(&self, mut auth: Auth) -> Result<Auth, Error> {
        if auth.id.trim().is_empty() {
            return Err(Error::new("invalid_auth", "auth id is required", 400));
        }
        self.persist(&mut auth).await;
        let stored = auth.clone();
        self.auths.write().await.insert(auth.id.clone(), auth);
        info!(auth_id = %stored.id, provider = %stored.provider, "auth registered");
        Ok(stored)
    }

    pub async fn update(&self, mut auth: Auth) -> Result<Auth, Error> {
        if !self.auths.read().await.contains_key(&auth.id) {
            return Err(Error::new(
                "auth_not_found",
                format!("auth {} is not registered", auth.id),
                404,
            ));
        }
        self.persist(&mut auth).await;
        let stored = auth.clone();
        self.auths.write().await.insert(auth.id.clone(), auth);
        Ok(stored)
    }

    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let removed = self.auths.write().await.remove(id);
        if removed.is_none() {
            return Err(Error::new(
                "auth_not_found",
                format!("auth {id} is not registered"),
                404,
            ));
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(id).await {
                warn!(auth_id = id, error = %e, "failed to delete credential file");
            }
        }
        info!(auth_id = id, "auth deleted");
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Auth> {
        self.auths.read().await.get(id).cloned()
    }

    pub async fn list_auths(&self) -> Vec<Auth> {
        let auths = self.auths.read().await;
        let mut out: Vec<Auth> = auths.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Load every credential from the store, merging still-active runtime
    /// blocks from entries already registered so a reload never resurrects a
    /// frozen account.
    pub async fn load_from_store(&self) -> Result<usize, Error> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store
            .list()
            .await
            .map_err(|e| Error::new("store_error", e.to_string(), 500))?;
        let now = Utc::now();
        let mut auths = self.auths.write().await;
        let count = loaded.len();
        for mut auth in loaded {
            if let Some(existing) = auths.get(&auth.id) {
                merge_runtime_failure_state(&mut auth, existing, now);
            }
            auths.insert(auth.id.clone(), auth);
        }
        Ok(count)
    }

    /// Replace a stored auth with a refreshed shape (runtime state already
    /// merged by the caller) and persist it.
    pub(crate) async fn replace_auth(&self, mut auth: Auth) {
        self.persist(&mut auth).await;
        self.auths.write().await.insert(auth.id.clone(), auth);
    }

    // --- configuration -------------------------------------------------

    pub async fn set_config(&self, config: ManagerConfig) {
        self.egress.lock().await.apply_config(&config.egress);
        *self.config.write().await = config;
    }

    pub async fn set_retry_config(&self, max_attempts: u32, max_wait: Duration) {
        *self.retry.write().await = RetryConfig {
            max_attempts,
            max_wait,
        };
    }

    pub async fn register_executor(&self, executor: Arc<dyn Executor>) {
        let id = executor.identifier().to_string();
        self.executors.write().await.insert(id.clone(), executor);
        debug!(provider = %id, "executor registered");
    }

    pub async fn executor_for(&self, provider: &str) -> Option<Arc<dyn Executor>> {
        self.executors.read().await.get(provider).cloned()
    }

    // --- drill faults --------------------------------------------------

    pub fn apply_internal_drill_fault(&self, scenario: &str, count: u32) -> Result<u32, Error> {
        self.drill.apply(scenario, count)
    }

    pub fn internal_drill_fault_snapshot(&self) -> HashMap<String, u32> {
        self.drill.snapshot()
    }

    // --- egress --------------------------------------------------------

    async fn observe_egress(&self, auth: &Auth, provider: &str, model: &str) {
        let mut egress = self.egress.lock().await;
        egress.observe(&auth.id, &auth.proxy_url, provider, model, Utc::now());
    }

    pub async fn egress_mapping_snapshot(&self) -> EgressMappingSnapshot {
        let providers: HashMap<String, String> = {
            let auths = self.auths.read().await;
            auths
                .values()
                .map(|a| (a.id.clone(), a.provider.clone()))
                .collect()
        };
        self.egress.lock().await.snapshot(&providers)
    }

    // --- result ingestion ----------------------------------------------

    /// Ingest a terminal attempt outcome: update runtime state, persist, and
    /// publish a usage event. Returns the classification for failures.
    pub async fn mark_result(&self, result: ExecutionResult) -> Option<Classification> {
        let now = Utc::now();
        let disable_fatal = self.config.read().await.disable_fatal_accounts;

        let (classification, snapshot) = {
            let mut auths = self.auths.write().await;
            let auth = auths.get_mut(&result.auth_id)?;
            let classification = if result.success {
                apply_success(auth, &result.model, now);
                None
            } else {
                let err = result
                    .error
                    .clone()
                    .unwrap_or_else(|| Error::new("", "unspecified failure", 0));
                Some(apply_failure(auth, &result.model, &err, disable_fatal, now))
            };
            (classification, auth.clone())
        };

        let mut persisted = snapshot.clone();
        self.persist(&mut persisted).await;

        if let Some(usage) = &self.usage {
            let auth_file = if snapshot.file_name.is_empty() {
                snapshot.id.clone()
            } else {
                snapshot.file_name.clone()
            };
            match &classification {
                None => {
                    usage.publish(RequestEvent {
                        event_type: "request".into(),
                        provider: result.provider.clone(),
                        model: result.model.clone(),
                        auth_file,
                        success: true,
                        ..RequestEvent::default()
                    });
                }
                Some(c) if c.kind.is_quota() => {
                    usage.publish_quota_exceeded(&result.provider, &result.model, &auth_file);
                }
                Some(c) => {
                    usage.publish_error(&result.provider, &result.model, &auth_file, &c.reason);
                }
            }
        }
        metrics::counter!(
            "pool_results_total",
            "outcome" => if result.success { "success" } else { "failure" }
        )
        .increment(1);
        classification
    }

    async fn persist(&self, auth: &mut Auth) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(auth).await {
            Ok(_) => {
                // save assigns the file name and rewrites runtime metadata;
                // fold both back into the registry copy.
                let mut auths = self.auths.write().await;
                if let Some(stored) = auths.get_mut(&auth.id) {
                    stored.file_name = auth.file_name.clone();
                    stored.metadata = auth.metadata.clone();
                }
            }
            Err(e) => {
                warn!(auth_id = %auth.id, error = %e, "failed to persist credential");
            }
        }
    }

    // --- dispatch ------------------------------------------------------

    async fn pick_next(
        &self,
        providers: &[String],
        model: &str,
        opts: &Options,
        tried: &HashSet<String>,
    ) -> Result<Auth, Error> {
        let proxy_constraint = self.config.read().await.account_proxy_constraint;
        let mixed = providers.len() != 1 || providers[0] == "mixed";
        let candidates: Vec<Auth> = {
            let auths = self.auths.read().await;
            let mut seen: HashSet<&str> = HashSet::new();
            let mut out = Vec::new();
            let wanted: Vec<&str> = if mixed && providers.iter().any(|p| p == "mixed") {
                vec!["mixed"]
            } else {
                providers.iter().map(String::as_str).collect()
            };
            for provider in wanted {
                for auth in auths.values() {
                    if provider != "mixed" && auth.provider != provider {
                        continue;
                    }
                    if tried.contains(&auth.id) || !seen.insert(auth.id.as_str()) {
                        continue;
                    }
                    if proxy_constraint && auth.proxy_url.trim().is_empty() {
                        continue;
                    }
                    out.push(auth.clone());
                }
            }
            out
        };
        let provider_label = if mixed {
            "mixed".to_string()
        } else {
            providers[0].clone()
        };
        self.selector
            .pick(&provider_label, model, opts, &candidates, Utc::now())
    }

    fn should_retry(&self, auth: &Auth, attempt: u32, max_attempts: u32) -> bool {
        // Per-auth override: request_retry = 0 disables retry entirely.
        let override_retry = auth
            .metadata
            .get("request_retry")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())));
        if override_retry == Some(0) {
            return false;
        }
        attempt < max_attempts
    }

    /// Non-streaming dispatch with failover across candidates and bounded
    /// retry waits. Fatal classifications move on to the next candidate
    /// without consuming the retry budget.
    pub async fn execute(
        &self,
        providers: &[String],
        req: Request,
        opts: Options,
    ) -> Result<Response, Error> {
        self.dispatch(providers, req, opts, false).await
    }

    /// Token counting follows the same failover loop without retry waits.
    pub async fn execute_count(
        &self,
        providers: &[String],
        req: Request,
        opts: Options,
    ) -> Result<Response, Error> {
        self.dispatch(providers, req, opts, true).await
    }

    async fn dispatch(
        &self,
        providers: &[String],
        req: Request,
        opts: Options,
        counting: bool,
    ) -> Result<Response, Error> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempt = 0u32;
        let retry = self.retry.read().await.clone();

        loop {
            let auth = self.pick_next(providers, &req.model, &opts, &tried).await?;
            let provider = auth.provider.clone();

            if self.drill.consume(SCENARIO_PROXY_FAILURE) {
                // Fail fast with no account penalty.
                metrics::counter!("pool_drill_injected_total", "scenario" => SCENARIO_PROXY_FAILURE)
                    .increment(1);
                return Err(proxy_failure_error());
            }
            if self.drill.consume(SCENARIO_ACCOUNT_QUOTA_EXHAUSTED) {
                metrics::counter!(
                    "pool_drill_injected_total",
                    "scenario" => SCENARIO_ACCOUNT_QUOTA_EXHAUSTED
                )
                .increment(1);
                self.mark_result(ExecutionResult {
                    auth_id: auth.id.clone(),
                    provider: provider.clone(),
                    model: req.model.clone(),
                    success: false,
                    error: Some(quota_exhausted_error()),
                })
                .await;
                tried.insert(auth.id.clone());
                continue;
            }

            let executor = self.executor_for(&provider).await.ok_or_else(|| {
                Error::new(
                    "executor_not_found",
                    format!("no executor registered for provider {provider}"),
                    500,
                )
            })?;
            self.observe_egress(&auth, &provider, &req.model).await;

            let outcome = if counting {
                executor.count_tokens(&auth, req.clone(), opts.clone()).await
            } else {
                executor.execute(&auth, req.clone(), opts.clone()).await
            };

            match outcome {
                Ok(resp) => {
                    self.mark_result(ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model: req.model.clone(),
                        success: true,
                        error: None,
                    })
                    .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let classification = self
                        .mark_result(ExecutionResult {
                            auth_id: auth.id.clone(),
                            provider: provider.clone(),
                            model: req.model.clone(),
                            success: false,
                            error: Some(err.clone()),
                        })
                        .await;
                    tried.insert(auth.id.clone());
                    metrics::counter!("pool_failover_total", "provider" => provider).increment(1);

                    let fatal = classification.as_ref().map(|c| c.fatal).unwrap_or(false);
                    if fatal {
                        // Other candidates may still exist; the retry budget
                        // is not consumed.
                        continue;
                    }
                    attempt += 1;
                    if !self.should_retry(&auth, attempt, retry.max_attempts) {
                        return Err(err);
                    }
                    if !counting {
                        let wait = classification
                            .and_then(|c| c.retry_after)
                            .unwrap_or(Duration::ZERO)
                            .min(retry.max_wait);
                        if !wait.is_zero() {
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
        }
    }

    // --- streaming -----------------------------------------------------

    /// Streaming dispatch with safe bootstrap retry: failures are
    /// re-dispatched on a fresh pick only while no payload byte has been
    /// delivered downstream and the bootstrap budget holds.
    pub async fn execute_stream(
        &self,
        providers: &[String],
        req: Request,
        opts: Options,
    ) -> Result<StreamReceiver, Error> {
        let budget = self.config.read().await.streaming.bootstrap_retries;
        let mut tried: HashSet<String> = HashSet::new();
        let mut retries_used = 0u32;
        let first = self
            .open_stream(providers, &req, &opts, &mut tried, &mut retries_used, budget)
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let Some(manager) = self.weak_self.upgrade() else {
            return Err(Error::new("manager_shutdown", "manager is shutting down", 500));
        };
        let providers = providers.to_vec();
        tokio::spawn(async move {
            manager
                .drive_stream(first, providers, req, opts, tried, retries_used, budget, tx)
                .await;
        });
        Ok(rx)
    }

    async fn open_stream(
        &self,
        providers: &[String],
        req: &Request,
        opts: &Options,
        tried: &mut HashSet<String>,
        retries_used: &mut u32,
        budget: u32,
    ) -> Result<StreamAttempt, Error> {
        loop {
            let auth = self.pick_next(providers, &req.model, opts, tried).await?;
            let provider = auth.provider.clone();

            if self.drill.consume(SCENARIO_PROXY_FAILURE) {
                metrics::counter!("pool_drill_injected_total", "scenario" => SCENARIO_PROXY_FAILURE)
                    .increment(1);
                return Err(proxy_failure_error());
            }
            if self.drill.consume(SCENARIO_ACCOUNT_QUOTA_EXHAUSTED) {
                metrics::counter!(
                    "pool_drill_injected_total",
                    "scenario" => SCENARIO_ACCOUNT_QUOTA_EXHAUSTED
                )
                .increment(1);
                self.mark_result(ExecutionResult {
                    auth_id: auth.id.clone(),
                    provider,
                    model: req.model.clone(),
                    success: false,
                    error: Some(quota_exhausted_error()),
                })
                .await;
                tried.insert(auth.id.clone());
                continue;
            }

            let executor = self.executor_for(&provider).await.ok_or_else(|| {
                Error::new(
                    "executor_not_found",
                    format!("no executor registered for provider {provider}"),
                    500,
                )
            })?;
            self.observe_egress(&auth, &provider, &req.model).await;

            match executor.execute_stream(&auth, req.clone(), opts.clone()).await {
                Ok(rx) => {
                    return Ok(StreamAttempt {
                        auth_id: auth.id.clone(),
                        provider,
                        rx,
                    });
                }
                Err(err) => {
                    self.mark_result(ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model: req.model.clone(),
                        success: false,
                        error: Some(err.clone()),
                    })
                    .await;
                    tried.insert(auth.id.clone());
                    if bootstrap_eligible(&err) && *retries_used < budget {
                        *retries_used += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        self: Arc<Self>,
        mut attempt: StreamAttempt,
        providers: Vec<String>,
        req: Request,
        opts: Options,
        mut tried: HashSet<String>,
        mut retries_used: u32,
        budget: u32,
        tx: mpsc::Sender<executor::StreamChunk>,
    ) {
        let mut delivered = false;
        loop {
            let mut terminal_err: Option<Error> = None;
            while let Some(chunk) = attempt.rx.recv().await {
                match chunk {
                    Ok(bytes) => {
                        delivered = true;
                        if tx.send(Ok(bytes)).await.is_err() {
                            // Downstream cancelled; stop the producer without
                            // a synthetic error.
                            return;
                        }
                    }
                    Err(err) => {
                        terminal_err = Some(err);
                        break;
                    }
                }
            }

            match terminal_err {
                None => {
                    self.mark_result(ExecutionResult {
                        auth_id: attempt.auth_id.clone(),
                        provider: attempt.provider.clone(),
                        model: req.model.clone(),
                        success: true,
                        error: None,
                    })
                    .await;
                    return;
                }
                Some(err) => {
                    self.mark_result(ExecutionResult {
                        auth_id: attempt.auth_id.clone(),
                        provider: attempt.provider.clone(),
                        model: req.model.clone(),
                        success: false,
                        error: Some(err.clone()),
                    })
                    .await;
                    tried.insert(attempt.auth_id.clone());

                    if !delivered && retries_used < budget && bootstrap_eligible(&err) {
                        retries_used += 1;
                        match self
                            .open_stream(
                                &providers,
                                &req,
                                &opts,
                                &mut tried,
                                &mut retries_used,
                                budget,
                            )
                            .await
                        {
                            Ok(next) => {
                                attempt = next;
                                continue;
                            }
                            Err(pick_err) => {
                                let _ = tx.send(Err(pick_err)).await;
                                return;
                            }
                        }
                    }
                    // After the first delivered byte, errors are forwarded
                    // but never retried.
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }
}

/// Whether a streaming error may be retried before any byte was delivered.
fn bootstrap_eligible(err: &Error) -> bool {
    err.http_status == 0
        || matches!(err.http_status, 401 | 402 | 403 | 408 | 429)
        || err.http_status >= 500
}
