use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FailureKind;

/// Lifecycle of one account within a run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountState {
    Pending,
    AssumingRole,
    Enumerating,
    Persisting,
    Done,
    Failed,
}

impl AccountState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AccountState::Done | AccountState::Failed)
    }

    /// `Pending -> Failed` only happens when the run deadline passes before the account starts.
    pub fn can_transition_to(self, next: AccountState) -> bool {
        use AccountState::*;
        matches!(
            (self, next),
            (Pending, AssumingRole)
                | (AssumingRole, Enumerating)
                | (Enumerating, Persisting)
                | (Persisting, Done)
                | (Pending | AssumingRole | Enumerating | Persisting, Failed)
        )
    }

    /// Failure category for an account that stopped in this state without reporting an error itself.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            AccountState::Enumerating => FailureKind::EnumerationError,
            AccountState::Persisting => FailureKind::StorageError,
            _ => FailureKind::AssumeRoleError,
        }
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountState::Pending => "PENDING",
            AccountState::AssumingRole => "ASSUMING_ROLE",
            AccountState::Enumerating => "ENUMERATING",
            AccountState::Persisting => "PERSISTING",
            AccountState::Done => "DONE",
            AccountState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountFailure {
    pub kind: FailureKind,
    /// State the account was in when it failed.
    pub stage: AccountState,
    pub message: String,
    pub attempts: u32,
}

/// Mutable per-account record, shared with the run loop so a timed-out task still reports where it stopped.
#[derive(Debug, Clone)]
pub struct AccountProgress {
    history: Vec<AccountState>,
    failure: Option<AccountFailure>,
    object_key: Option<String>,
    entity_count: usize,
}

impl Default for AccountProgress {
    fn default() -> Self { Self::new() }
}

impl AccountProgress {
    pub fn new() -> Self {
        Self { history: vec![AccountState::Pending], failure: None, object_key: None, entity_count: 0 }
    }

    pub fn state(&self) -> AccountState {
        self.history.last().copied().unwrap_or(AccountState::Pending)
    }

    /// Records a transition; illegal transitions are ignored and reported as `false`.
    pub fn advance(&mut self, next: AccountState) -> bool {
        if !self.state().can_transition_to(next) {
            return false;
        }
        self.history.push(next);
        true
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>, attempts: u32) {
        let stage = self.state();
        if self.advance(AccountState::Failed) {
            self.failure = Some(AccountFailure { kind, stage, message: message.into(), attempts });
        }
    }

    pub fn complete(&mut self, object_key: String, entity_count: usize) {
        if self.advance(AccountState::Done) {
            self.object_key = Some(object_key);
            self.entity_count = entity_count;
        }
    }

    pub fn into_outcome(self, account_name: String, role_arn: String) -> AccountOutcome {
        AccountOutcome {
            account_name,
            role_arn,
            state: self.state(),
            history: self.history,
            object_key: self.object_key,
            entity_count: self.entity_count,
            failure: self.failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountOutcome {
    pub account_name: String,
    pub role_arn: String,
    pub state: AccountState,
    pub history: Vec<AccountState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    pub entity_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AccountFailure>,
}

impl AccountOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == AccountState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Some accounts failed; usually isolated per-account issues.
    PartialSuccess,
    /// Nothing succeeded; usually systemic (trust setup, permissions, storage).
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_timestamp: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status: RunStatus,
    pub outcomes: Vec<AccountOutcome>,
}

impl RunSummary {
    pub fn new(run_timestamp: DateTime<Utc>, outcomes: Vec<AccountOutcome>) -> Self {
        let attempted = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let failed = attempted - succeeded;
        let status = if failed == 0 {
            RunStatus::Succeeded
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartialSuccess
        };
        Self { run_timestamp, attempted, succeeded, failed, status, outcomes }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &AccountFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.failure.as_ref().map(|f| (o.account_name.as_str(), f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AccountState::*;

    #[test]
    fn no_state_is_skipped() {
        assert!(Pending.can_transition_to(AssumingRole));
        assert!(!Pending.can_transition_to(Enumerating));
        assert!(!AssumingRole.can_transition_to(Persisting));
        assert!(!Enumerating.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(AssumingRole));
    }

    #[test]
    fn failure_records_stage() {
        let mut p = AccountProgress::new();
        assert!(p.advance(AssumingRole));
        p.fail(FailureKind::AssumeRoleError, "denied", 1);
        let o = p.into_outcome("a1".into(), "arn".into());
        assert_eq!(o.history, vec![Pending, AssumingRole, Failed]);
        let f = o.failure.unwrap();
        assert_eq!(f.stage, AssumingRole);
        assert_eq!(f.kind, FailureKind::AssumeRoleError);
    }

    #[test]
    fn stage_maps_to_its_failure_kind() {
        assert_eq!(Pending.failure_kind(), FailureKind::AssumeRoleError);
        assert_eq!(AssumingRole.failure_kind(), FailureKind::AssumeRoleError);
        assert_eq!(Enumerating.failure_kind(), FailureKind::EnumerationError);
        assert_eq!(Persisting.failure_kind(), FailureKind::StorageError);
    }

    #[test]
    fn terminal_states_stick() {
        let mut p = AccountProgress::new();
        p.advance(AssumingRole);
        p.fail(FailureKind::AssumeRoleError, "denied", 1);
        p.fail(FailureKind::TimeoutError, "late", 1);
        assert!(!p.advance(Enumerating));
        let o = p.into_outcome("a1".into(), "arn".into());
        assert_eq!(o.failure.unwrap().kind, FailureKind::AssumeRoleError);
    }

    fn outcome(state: AccountState) -> AccountOutcome {
        AccountOutcome {
            account_name: "x".into(),
            role_arn: "arn".into(),
            state,
            history: vec![],
            object_key: None,
            entity_count: 0,
            failure: None,
        }
    }

    #[test]
    fn status_distinguishes_partial_from_total_failure() {
        let now = Utc::now();
        assert_eq!(RunSummary::new(now, vec![outcome(Done), outcome(Done)]).status, RunStatus::Succeeded);
        assert_eq!(RunSummary::new(now, vec![outcome(Done), outcome(Failed)]).status, RunStatus::PartialSuccess);
        let all_failed = RunSummary::new(now, vec![outcome(Failed), outcome(Failed)]);
        assert_eq!(all_failed.status, RunStatus::Failed);
        assert_eq!((all_failed.attempted, all_failed.succeeded, all_failed.failed), (2, 0, 2));
    }
}
