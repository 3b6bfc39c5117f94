//! Execution and task-run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an execution or task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Proposed but not yet started.
    Created,
    /// Actively running.
    Running,
    /// Paused, waiting for an external resume or an elapsed delay.
    Paused,
    /// Waiting for a retry attempt.
    Retrying,
    /// Terminated successfully.
    Success,
    /// Terminated successfully with warnings (or softened failure).
    Warning,
    /// Terminated in failure.
    Failed,
    /// Terminated by a kill signal.
    Killed,
}

impl StateType {
    /// Terminal states: no further transitions.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            StateType::Success | StateType::Warning | StateType::Failed | StateType::Killed
        )
    }

    /// Failure states.
    pub fn is_failed(self) -> bool {
        matches!(self, StateType::Failed | StateType::Killed)
    }

    pub fn is_created(self) -> bool {
        matches!(self, StateType::Created)
    }

    /// Actively progressing (not created, paused or terminal).
    pub fn is_running(self) -> bool {
        matches!(self, StateType::Running | StateType::Retrying)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, StateType::Paused)
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateType::Created => "CREATED",
            StateType::Running => "RUNNING",
            StateType::Paused => "PAUSED",
            StateType::Retrying => "RETRYING",
            StateType::Success => "SUCCESS",
            StateType::Warning => "WARNING",
            StateType::Failed => "FAILED",
            StateType::Killed => "KILLED",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistory {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Current state plus its append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub current: StateType,
    pub histories: Vec<StateHistory>,
}

impl State {
    /// Create a state with a single history entry.
    pub fn new(state: StateType) -> Self {
        Self {
            current: state,
            histories: vec![StateHistory {
                state,
                date: Utc::now(),
            }],
        }
    }

    /// Append a transition. The history is monotonic: entries are only ever
    /// added, never rewritten.
    pub fn with_state(&self, state: StateType) -> Self {
        let mut histories = self.histories.clone();
        histories.push(StateHistory {
            state,
            date: Utc::now(),
        });
        Self {
            current: state,
            histories,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    /// Date of the first entry (creation).
    pub fn created_date(&self) -> Option<DateTime<Utc>> {
        self.histories.first().map(|h| h.date)
    }

    /// Date of the first RUNNING entry.
    pub fn started_date(&self) -> Option<DateTime<Utc>> {
        self.histories
            .iter()
            .find(|h| h.state == StateType::Running)
            .map(|h| h.date)
    }

    /// Date of the most recent entry of the given type.
    pub fn last_date_of(&self, state: StateType) -> Option<DateTime<Utc>> {
        self.histories
            .iter()
            .rev()
            .find(|h| h.state == state)
            .map(|h| h.date)
    }

    /// Whether the history contains an entry of the given type.
    pub fn has_history(&self, state: StateType) -> bool {
        self.histories.iter().any(|h| h.state == state)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(StateType::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_predicate() {
        assert!(StateType::Success.is_terminated());
        assert!(StateType::Warning.is_terminated());
        assert!(StateType::Failed.is_terminated());
        assert!(StateType::Killed.is_terminated());
        assert!(!StateType::Running.is_terminated());
        assert!(!StateType::Paused.is_terminated());
        assert!(!StateType::Created.is_terminated());
        assert!(!StateType::Retrying.is_terminated());
    }

    #[test]
    fn test_failed_predicate() {
        assert!(StateType::Failed.is_failed());
        assert!(StateType::Killed.is_failed());
        assert!(!StateType::Warning.is_failed());
        assert!(!StateType::Success.is_failed());
    }

    #[test]
    fn test_history_is_appended() {
        let state = State::new(StateType::Created)
            .with_state(StateType::Running)
            .with_state(StateType::Success);
        assert_eq!(state.current, StateType::Success);
        assert_eq!(state.histories.len(), 3);
        assert_eq!(state.histories[0].state, StateType::Created);
        assert_eq!(state.histories[1].state, StateType::Running);
    }

    #[test]
    fn test_started_date_is_first_running() {
        let state = State::new(StateType::Created)
            .with_state(StateType::Running)
            .with_state(StateType::Paused)
            .with_state(StateType::Running);
        let started = state.started_date().unwrap();
        assert_eq!(started, state.histories[1].date);
        assert!(state.has_history(StateType::Paused));
    }

    #[test]
    fn test_serde_screaming_case() {
        let json = serde_json::to_string(&StateType::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
