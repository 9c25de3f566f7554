//! One fetch task: walk the pages of a (unit, key) pair, retrying transient
//! failures and handing every non-empty page to the landing writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::catalog::{IngestionUnit, PageCursor};
use crate::failures::{Activity, ErrorClass, FailureRecord};
use crate::landing::{RawLanding, RawRecord};
use crate::sources::{FetchError, PageRequest, PageResponse, Upstream};
use crate::warehouse::{AttemptRow, Warehouse};

#[derive(Debug, Clone)]
pub struct FetchTask {
    pub unit: Arc<IngestionUnit>,
    pub key: Option<String>,
}

impl FetchTask {
    pub fn label(&self) -> String {
        match &self.key {
            Some(key) => format!("{}[{key}]", self.unit.name),
            None => self.unit.name.clone(),
        }
    }

    fn failure(&self, activity: Activity, class: ErrorClass, run_id: &str) -> FailureRecord {
        FailureRecord::new(&self.unit.name, self.key.as_deref(), activity, class, run_id)
    }
}

/// Terminal state of a fetch task, sent back to the runner.
#[derive(Debug)]
pub struct TaskOutcome {
    pub unit: String,
    pub key: Option<String>,
    pub pages_landed: u64,
    pub failure: Option<FailureRecord>,
    pub duration_ms: u64,
}

/// Shared collaborators for every task of one run.
pub struct TaskContext {
    pub run_id: String,
    pub upstream: Arc<dyn Upstream>,
    pub landing: Arc<dyn RawLanding>,
    pub warehouse: Arc<Warehouse>,
    pub attempt_timeout: Duration,
    pub deadline: tokio::time::Instant,
    pub cancel: CancellationToken,
}

/// A failed page fetch plus how many attempts it took.
struct Exhausted {
    error: FetchError,
    attempts: u32,
}

impl TaskContext {
    fn past_deadline(&self) -> bool {
        tokio::time::Instant::now() >= self.deadline
    }

    /// Run `task` to a terminal state.
    pub async fn run(&self, task: FetchTask) -> TaskOutcome {
        let start = Instant::now();
        let mut pages_landed = 0u64;
        let failure = self.walk_pages(&task, &mut pages_landed).await.err();
        TaskOutcome {
            unit: task.unit.name.clone(),
            key: task.key.clone(),
            pages_landed,
            failure,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn walk_pages(&self, task: &FetchTask, pages_landed: &mut u64) -> Result<(), FailureRecord> {
        let unit = &task.unit;
        let bearer = unit.bearer_token_env.as_ref().and_then(|var| match std::env::var(var) {
            Ok(token) => Some(token),
            Err(_) => {
                tracing::warn!(unit = %unit.name, var = %var, "bearer token variable not set");
                None
            }
        });

        let mut cursor = PageCursor::First;
        let mut page: u64 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(task
                    .failure(Activity::Fetch, ErrorClass::Cancelled, &self.run_id)
                    .page(page)
                    .message("run cancelled before page was fetched"));
            }

            let url = unit.render_url(task.key.as_deref(), &cursor).map_err(|e| {
                task.failure(Activity::Fetch, ErrorClass::Permanent, &self.run_id)
                    .page(page)
                    .message(format!("cannot render endpoint: {e}"))
            })?;
            let request = PageRequest {
                method: unit.method.clone(),
                url,
                headers: unit.headers.clone(),
                bearer: bearer.clone(),
            };

            let (response, attempts) = match self.fetch_with_retry(task, page, &request).await {
                Ok(ok) => ok,
                Err(Exhausted { error, attempts }) => {
                    // Transient failures that ran out of attempts are terminal.
                    let class = match error.class {
                        ErrorClass::Transient => ErrorClass::Permanent,
                        other => other,
                    };
                    return Err(task
                        .failure(Activity::Fetch, class, &self.run_id)
                        .page(page)
                        .attempts(attempts)
                        .message(error.message));
                }
            };

            let body: Value = serde_json::from_slice(&response.body).map_err(|e| {
                task.failure(Activity::Fetch, ErrorClass::Permanent, &self.run_id)
                    .page(page)
                    .attempts(attempts)
                    .message(format!("undecodable page body: {e}"))
            })?;
            let item_count = match unit.items(&body) {
                Some(items) => items.len(),
                None if matches!(crate::catalog::value_at(&body, &unit.items_path), None | Some(Value::Null)) => 0,
                None => {
                    return Err(task
                        .failure(Activity::Fetch, ErrorClass::Permanent, &self.run_id)
                        .page(page)
                        .attempts(attempts)
                        .message(format!("'{}' is not an item array", unit.items_path)));
                }
            };
            if item_count == 0 {
                tracing::debug!(task = %task.label(), page, "empty page, pagination finished");
                return Ok(());
            }

            let record = RawRecord {
                unit: unit.name.clone(),
                landing_path: unit.landing_path.clone(),
                key: task.key.clone(),
                page,
                run_id: self.run_id.clone(),
                ingested_at: Utc::now(),
                payload: response.body,
            };
            match self.landing.append(record).await {
                Ok(source_ref) => {
                    *pages_landed += 1;
                    crate::metrics::inc_pages_landed(&unit.name);
                    tracing::debug!(task = %task.label(), page, items = item_count, source_ref = %source_ref, "page landed");
                }
                Err(e) => {
                    return Err(task
                        .failure(Activity::Land, ErrorClass::Permanent, &self.run_id)
                        .page(page)
                        .attempts(attempts)
                        .message(e.to_string()));
                }
            }

            if unit.max_pages.is_some_and(|max| page >= u64::from(max)) {
                tracing::debug!(task = %task.label(), page, "max pages reached");
                return Ok(());
            }
            match unit.next_cursor(&cursor, &body, item_count) {
                Some(next) => cursor = next,
                None => return Ok(()),
            }
            page += 1;
        }
    }

    /// Fetch one page, retrying transient failures per the unit's policy.
    ///
    /// Every attempt is logged to the warehouse. The attempt in flight when the
    /// run is cancelled is allowed to finish; the run deadline caps each attempt.
    async fn fetch_with_retry(
        &self,
        task: &FetchTask,
        page: u64,
        request: &PageRequest,
    ) -> Result<(PageResponse, u32), Exhausted> {
        let policy = &task.unit.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.past_deadline() {
                return Err(Exhausted { error: run_timeout(), attempts: attempt - 1 });
            }

            let budget = self
                .attempt_timeout
                .min(self.deadline.saturating_duration_since(tokio::time::Instant::now()));
            let start = Instant::now();
            let result = match tokio::time::timeout(budget, self.upstream.fetch(request)).await {
                Ok(result) => result,
                Err(_) if self.past_deadline() => Err(run_timeout()),
                Err(_) => Err(FetchError::transient(format!("attempt timed out after {budget:?}"))),
            };
            self.log_attempt(task, page, attempt, start.elapsed(), &result);

            let error = match result {
                Ok(response) => return Ok((response, attempt)),
                Err(error) => error,
            };
            if !error.is_transient() || !policy.allows_retry(attempt) {
                tracing::warn!(task = %task.label(), page, attempt, class = %error.class, error = %error.message, "fetch failed");
                return Err(Exhausted { error, attempts: attempt });
            }

            let delay = policy.backoff(attempt, error.retry_after);
            tracing::warn!(task = %task.label(), page, attempt, delay_ms = delay.as_millis() as u64, error = %error.message, "transient fetch failure, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    let error = FetchError { class: ErrorClass::Cancelled, ..error };
                    return Err(Exhausted { error, attempts: attempt });
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(Exhausted { error: run_timeout(), attempts: attempt });
                }
            }
        }
    }

    fn log_attempt(
        &self,
        task: &FetchTask,
        page: u64,
        attempt: u32,
        elapsed: Duration,
        result: &Result<PageResponse, FetchError>,
    ) {
        let (outcome, http_status, error) = match result {
            Ok(response) => ("success", Some(response.status), None),
            Err(e) => (e.class.as_str(), e.status, Some(e.message.clone())),
        };
        crate::metrics::inc_fetch_attempt(&task.unit.name, outcome);
        let row = AttemptRow {
            run_id: self.run_id.clone(),
            unit: task.unit.name.clone(),
            key: task.key.clone(),
            page,
            attempt,
            outcome: outcome.to_string(),
            http_status,
            duration_ms: elapsed.as_millis() as i64,
            error,
        };
        if let Err(e) = self.warehouse.insert_attempt(&row) {
            tracing::error!(task = %task.label(), error = %e, "failed to record fetch attempt");
        }
    }
}

fn run_timeout() -> FetchError {
    FetchError {
        class: ErrorClass::RunTimeout,
        status: None,
        message: "run deadline exceeded".into(),
        retry_after: None,
    }
}
