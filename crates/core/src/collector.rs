use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::load_configuration;
use crate::error::{ConfigurationError, FailureKind};
use crate::model::{AccountRoleBinding, CollectionResult, StorageDestination};
use crate::provider::{ConfigSource, IamEnumerator, ResultStore, RoleAssumer};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::summary::{AccountProgress, AccountState, RunStatus, RunSummary};

pub const DEFAULT_SESSION_NAME: &str = "IAMResourceCollector";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Accounts processed at once; keeps list calls under provider rate limits.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Upper bound on a whole run. Accounts still in flight are failed with a timeout.
    pub run_timeout: Duration,
    pub session_name: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            run_timeout: Duration::from_secs(540),
            session_name: DEFAULT_SESSION_NAME.to_string(),
        }
    }
}

impl CollectorSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables keep their default; malformed ones are logged and ignored.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring malformed setting");
                    None
                }
            }
        };

        let defaults = Self::default();
        Self {
            max_concurrency: parse("COLLECTOR_MAX_CONCURRENCY")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrency),
            retry: RetryPolicy {
                max_attempts: parse("COLLECTOR_MAX_ATTEMPTS")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: parse("COLLECTOR_BACKOFF_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: parse("COLLECTOR_BACKOFF_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
            run_timeout: parse("COLLECTOR_RUN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            session_name: lookup("COLLECTOR_SESSION_NAME").unwrap_or(defaults.session_name),
        }
    }
}

/// Runs one collection pass across every configured account.
pub struct Collector {
    config: Arc<dyn ConfigSource>,
    assumer: Arc<dyn RoleAssumer>,
    enumerator: Arc<dyn IamEnumerator>,
    store: Arc<dyn ResultStore>,
    settings: CollectorSettings,
}

#[derive(Clone)]
struct AccountJob {
    assumer: Arc<dyn RoleAssumer>,
    enumerator: Arc<dyn IamEnumerator>,
    store: Arc<dyn ResultStore>,
    retry: RetryPolicy,
    session_name: String,
    destination: Arc<StorageDestination>,
    run_timestamp: DateTime<Utc>,
}

impl Collector {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        assumer: Arc<dyn RoleAssumer>,
        enumerator: Arc<dyn IamEnumerator>,
        store: Arc<dyn ResultStore>,
        settings: CollectorSettings,
    ) -> Self {
        Self { config, assumer, enumerator, store, settings }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub async fn run(&self) -> Result<RunSummary, ConfigurationError> {
        self.run_at(Utc::now()).await
    }

    /// Only a configuration error escapes; per-account errors end up in the summary.
    pub async fn run_at(&self, run_timestamp: DateTime<Utc>) -> Result<RunSummary, ConfigurationError> {
        let run = load_configuration(self.config.as_ref()).await?;
        let span = info_span!("run", run_timestamp = %run_timestamp, accounts = run.bindings.len());
        let deadline = Instant::now() + self.settings.run_timeout;

        let summary = async {
            let job = AccountJob {
                assumer: Arc::clone(&self.assumer),
                enumerator: Arc::clone(&self.enumerator),
                store: Arc::clone(&self.store),
                retry: self.settings.retry.clone(),
                session_name: self.settings.session_name.clone(),
                destination: Arc::new(run.destination),
                run_timestamp,
            };
            let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
            let progress: Vec<Arc<Mutex<AccountProgress>>> =
                run.bindings.iter().map(|_| Arc::new(Mutex::new(AccountProgress::new()))).collect();

            let mut tasks = JoinSet::new();
            for (binding, slot) in run.bindings.iter().cloned().zip(&progress) {
                let job = job.clone();
                let slot = Arc::clone(slot);
                let permits = Arc::clone(&permits);
                let account_span = info_span!("account", account = %binding.account_name);
                tasks.spawn(
                    async move {
                        // Biased so an account woken at the deadline sees the deadline before its work.
                        tokio::select! {
                            biased;
                            _ = tokio::time::sleep_until(deadline) => time_out(&slot),
                            _ = async {
                                let _permit = permits.acquire_owned().await.ok();
                                if Instant::now() >= deadline {
                                    time_out(&slot);
                                    return;
                                }
                                job.process(&binding, &slot).await;
                            } => {}
                        }
                    }
                    .instrument(account_span),
                );
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "account task ended abnormally");
                }
            }

            let outcomes = run
                .bindings
                .into_iter()
                .zip(progress)
                .map(|(binding, slot)| {
                    let mut p = slot.lock().clone();
                    let stage = p.state();
                    if !stage.is_terminal() {
                        p.fail(stage.failure_kind(), format!("account task ended abnormally while {stage}"), 1);
                    }
                    p.into_outcome(binding.account_name, binding.role_arn)
                })
                .collect();
            RunSummary::new(run_timestamp, outcomes)
        }
        .instrument(span)
        .await;

        log_summary(&summary);
        Ok(summary)
    }
}

impl AccountJob {
    async fn process(&self, binding: &AccountRoleBinding, slot: &Mutex<AccountProgress>) {
        slot.lock().advance(AccountState::AssumingRole);
        info!(role_arn = %binding.role_arn, "assuming role");
        let credentials = match self.assumer.assume_role(&binding.role_arn, &self.session_name).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "assume role failed");
                slot.lock().fail(FailureKind::AssumeRoleError, e.to_string(), 1);
                return;
            }
        };

        slot.lock().advance(AccountState::Enumerating);
        let (listed, attempts) =
            retry_with_backoff(&self.retry, || self.enumerator.enumerate(&credentials), |e| e.retryable).await;
        let entities = match listed {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, attempts, "enumeration failed");
                slot.lock().fail(FailureKind::EnumerationError, e.to_string(), attempts);
                return;
            }
        };

        slot.lock().advance(AccountState::Persisting);
        let entity_count = entities.total();
        let result = CollectionResult {
            account_name: binding.account_name.clone(),
            account_id: binding.account_id.clone(),
            run_timestamp: self.run_timestamp,
            entities,
        };
        let key = self.destination.object_key(&binding.account_name, self.run_timestamp);
        let body = match result.to_json_bytes() {
            Ok(b) => b,
            Err(e) => {
                slot.lock().fail(FailureKind::StorageError, format!("serialize {key}: {e}"), 1);
                return;
            }
        };
        if let Err(e) = self.store.put_object(&self.destination, &key, body).await {
            warn!(error = %e, "persist failed");
            slot.lock().fail(FailureKind::StorageError, e.to_string(), 1);
            return;
        }

        info!(key = %key, entities = entity_count, "collected");
        slot.lock().complete(key, entity_count);
    }
}

fn time_out(slot: &Mutex<AccountProgress>) {
    let mut p = slot.lock();
    let stage = p.state();
    warn!(%stage, "run deadline reached");
    p.fail(FailureKind::TimeoutError, format!("run timeout elapsed while {stage}"), 1);
}

fn log_summary(summary: &RunSummary) {
    for (account, failure) in summary.failures() {
        warn!(account, kind = %failure.kind, stage = %failure.stage, attempts = failure.attempts, message = %failure.message, "account failed");
    }
    let (attempted, succeeded, failed) = (summary.attempted, summary.succeeded, summary.failed);
    match summary.status {
        RunStatus::Succeeded => info!(attempted, succeeded, failed, "run succeeded"),
        RunStatus::PartialSuccess => warn!(attempted, succeeded, failed, "run partially succeeded"),
        RunStatus::Failed => error!(attempted, succeeded, failed, "run failed: no account succeeded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAssumer, FakeEnumerator, MemoryStore, StaticConfigSource, Script};
    use chrono::TimeZone;
    use std::collections::HashMap;

    const ROLE: &str = "CrossAccountAuditRole";

    fn blob(ids: &[(&str, &str)]) -> String {
        let accounts: Vec<String> = ids
            .iter()
            .map(|(n, id)| format!(r#"{{"accountName":"{n}","accountId":"{id}"}}"#))
            .collect();
        format!(r#"{{"auditRoleName":"{ROLE}","bucket":"audit-bucket","accounts":[{}]}}"#, accounts.join(","))
    }

    struct Harness {
        assumer: Arc<FakeAssumer>,
        enumerator: Arc<FakeEnumerator>,
        store: Arc<MemoryStore>,
        collector: Collector,
    }

    fn harness(config: String, settings: CollectorSettings) -> Harness {
        let assumer = Arc::new(FakeAssumer::default());
        let enumerator = Arc::new(FakeEnumerator::default());
        let store = Arc::new(MemoryStore::default());
        let collector = Collector::new(
            Arc::new(StaticConfigSource::new(config)),
            assumer.clone(),
            enumerator.clone(),
            store.clone(),
            settings,
        );
        Harness { assumer, enumerator, store, collector }
    }

    fn ts(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, sec).unwrap()
    }

    #[tokio::test]
    async fn every_account_gets_exactly_one_outcome() {
        let h = harness(
            blob(&[("a1", "111111111111"), ("a2", "222222222222"), ("a3", "333333333333")]),
            CollectorSettings::default(),
        );
        let summary = h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.status, RunStatus::Succeeded);
        let names: Vec<_> = summary.outcomes.iter().map(|o| o.account_name.as_str()).collect();
        assert_eq!(names, ["a1", "a2", "a3"]);
        for o in &summary.outcomes {
            assert_eq!(
                o.history,
                vec![
                    AccountState::Pending,
                    AccountState::AssumingRole,
                    AccountState::Enumerating,
                    AccountState::Persisting,
                    AccountState::Done
                ]
            );
        }
        assert_eq!(h.store.len(), 3);
    }

    #[tokio::test]
    async fn assumes_the_bound_role_arn() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!(h.assumer.calls(), vec!["arn:aws:iam::111111111111:role/CrossAccountAuditRole".to_string()]);
    }

    #[tokio::test]
    async fn denied_assume_role_fails_only_that_account() {
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), CollectorSettings::default());
        h.assumer.deny("111111111111");
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        assert_eq!((summary.attempted, summary.succeeded, summary.failed), (2, 1, 1));
        assert_eq!(summary.status, RunStatus::PartialSuccess);
        let a1 = &summary.outcomes[0];
        assert_eq!(a1.history, vec![AccountState::Pending, AccountState::AssumingRole, AccountState::Failed]);
        assert_eq!(a1.failure.as_ref().unwrap().kind, FailureKind::AssumeRoleError);
        assert!(h.store.keys().iter().all(|k| !k.ends_with("/a1.json")));
        assert_eq!(h.enumerator.calls_for("111111111111"), 0);
    }

    #[tokio::test]
    async fn single_denied_account_reports_total_failure() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        h.assumer.deny("111111111111");
        let summary = h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!((summary.attempted, summary.succeeded, summary.failed), (1, 0, 1));
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.outcomes[0].failure.as_ref().unwrap().kind, FailureKind::AssumeRoleError);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn empty_configuration_never_reaches_accounts() {
        let h = harness(r#"{"auditRoleName":"R","bucket":"b","accounts":[]}"#.to_string(), CollectorSettings::default());
        let err = h.collector.run_at(ts(0)).await.unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyAccounts));
        assert!(h.assumer.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_enumeration_is_capped() {
        let settings = CollectorSettings {
            retry: RetryPolicy { max_attempts: 3, ..RetryPolicy::default() },
            ..CollectorSettings::default()
        };
        let h = harness(blob(&[("a1", "111111111111")]), settings);
        h.enumerator.script("111111111111", Script::Throttle(u32::MAX));
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        let failure = summary.outcomes[0].failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::EnumerationError);
        assert_eq!(failure.stage, AccountState::Enumerating);
        assert_eq!(failure.attempts, 3);
        assert_eq!(h.enumerator.calls_for("111111111111"), 3);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_throttling_recovers() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        h.enumerator.script("111111111111", Script::Throttle(2));
        let summary = h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.enumerator.calls_for("111111111111"), 3);
    }

    #[tokio::test]
    async fn access_denied_is_not_retried() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        h.enumerator.script("111111111111", Script::Deny);
        let summary = h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!(summary.outcomes[0].failure.as_ref().unwrap().attempts, 1);
        assert_eq!(h.enumerator.calls_for("111111111111"), 1);
    }

    #[tokio::test]
    async fn storage_failure_is_isolated() {
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), CollectorSettings::default());
        h.store.fail_keys_containing("/a2.json");
        let summary = h.collector.run_at(ts(0)).await.unwrap();
        assert!(summary.outcomes[0].succeeded());
        let a2 = summary.outcomes[1].failure.as_ref().unwrap();
        assert_eq!(a2.kind, FailureKind::StorageError);
        assert_eq!(a2.stage, AccountState::Persisting);
        assert_eq!(h.store.keys(), vec!["iam_collector/20240531_000000/a1.json".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_in_flight_accounts() {
        let settings = CollectorSettings { run_timeout: Duration::from_secs(1), ..CollectorSettings::default() };
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), settings);
        h.enumerator.script("222222222222", Script::Hang);
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        assert!(summary.outcomes[0].succeeded());
        let a2 = summary.outcomes[1].failure.as_ref().unwrap();
        assert_eq!(a2.kind, FailureKind::TimeoutError);
        assert_eq!(a2.stage, AccountState::Enumerating);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_accounts_time_out_from_pending() {
        let settings = CollectorSettings {
            max_concurrency: 1,
            run_timeout: Duration::from_secs(1),
            ..CollectorSettings::default()
        };
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), settings);
        h.enumerator.script("111111111111", Script::Hang);
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        assert_eq!(summary.failed, 2);
        let stages: Vec<_> = summary.outcomes.iter().map(|o| o.failure.as_ref().unwrap().stage).collect();
        assert_eq!(stages, vec![AccountState::Enumerating, AccountState::Pending]);
        assert!(summary.outcomes.iter().all(|o| o.failure.as_ref().unwrap().kind == FailureKind::TimeoutError));
        assert_eq!(summary.outcomes[1].history, vec![AccountState::Pending, AccountState::Failed]);
        // a2 got the permit only after the deadline and never started.
        assert_eq!(h.assumer.calls(), vec!["arn:aws:iam::111111111111:role/CrossAccountAuditRole".to_string()]);
        assert_eq!(h.enumerator.calls_for("222222222222"), 0);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_accounts_time_out_when_all_hang() {
        let settings = CollectorSettings {
            max_concurrency: 1,
            run_timeout: Duration::from_secs(1),
            ..CollectorSettings::default()
        };
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), settings);
        h.enumerator.script("111111111111", Script::Hang);
        h.enumerator.script("222222222222", Script::Hang);
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.outcomes[1].history, vec![AccountState::Pending, AccountState::Failed]);
        assert_eq!(h.assumer.calls().len(), 1);
    }

    #[tokio::test]
    async fn crashed_account_task_is_isolated() {
        let h = harness(blob(&[("a1", "111111111111"), ("a2", "222222222222")]), CollectorSettings::default());
        h.enumerator.script("111111111111", Script::Panic);
        let summary = h.collector.run_at(ts(0)).await.unwrap();

        assert_eq!(summary.status, RunStatus::PartialSuccess);
        let a1 = summary.outcomes[0].failure.as_ref().unwrap();
        assert_eq!(a1.kind, FailureKind::EnumerationError);
        assert_eq!(a1.stage, AccountState::Enumerating);
        assert_eq!(summary.outcomes[0].state, AccountState::Failed);
        assert!(summary.outcomes[1].succeeded());
        assert_eq!(h.store.keys(), vec!["iam_collector/20240531_000000/a2.json".to_string()]);
    }

    #[test]
    fn settings_read_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("COLLECTOR_MAX_CONCURRENCY", "8"),
            ("COLLECTOR_MAX_ATTEMPTS", " 3 "),
            ("COLLECTOR_BACKOFF_BASE_MS", "50"),
            ("COLLECTOR_RUN_TIMEOUT_SECS", "120"),
            ("COLLECTOR_SESSION_NAME", "Audit"),
        ]
        .into_iter()
        .collect();
        let s = CollectorSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.max_concurrency, 8);
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.retry.base_delay, Duration::from_millis(50));
        assert_eq!(s.retry.max_delay, RetryPolicy::default().max_delay);
        assert_eq!(s.run_timeout, Duration::from_secs(120));
        assert_eq!(s.session_name, "Audit");
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let env: HashMap<&str, &str> =
            [("COLLECTOR_MAX_CONCURRENCY", "four"), ("COLLECTOR_MAX_ATTEMPTS", "-1"), ("COLLECTOR_RUN_TIMEOUT_SECS", "")]
                .into_iter()
                .collect();
        let s = CollectorSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s, CollectorSettings::default());
    }

    #[tokio::test]
    async fn repeated_runs_write_new_keys_with_equal_content() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        let first = h.collector.run_at(ts(0)).await.unwrap();
        let second = h.collector.run_at(ts(1)).await.unwrap();

        let k1 = first.outcomes[0].object_key.clone().unwrap();
        let k2 = second.outcomes[0].object_key.clone().unwrap();
        assert_ne!(k1, k2);

        let r1: CollectionResult = serde_json::from_slice(&h.store.get(&k1).unwrap()).unwrap();
        let r2: CollectionResult = serde_json::from_slice(&h.store.get(&k2).unwrap()).unwrap();
        assert_ne!(r1.run_timestamp, r2.run_timestamp);
        assert_eq!(r1.entities, r2.entities);
        assert!(r1.entities.total() > 0);
    }

    #[tokio::test]
    async fn same_timestamp_never_overwrites() {
        let h = harness(blob(&[("a1", "111111111111")]), CollectorSettings::default());
        h.collector.run_at(ts(0)).await.unwrap();
        let again = h.collector.run_at(ts(0)).await.unwrap();
        assert_eq!(again.outcomes[0].failure.as_ref().unwrap().kind, FailureKind::StorageError);
        assert_eq!(h.store.len(), 1);
    }
}
