//! Defines the lifecycle record of an asynchronous write.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// The state machine of a write transaction:
///
/// ```text
/// PENDING -> WRITING -> DONE | ERROR
/// ```
///
/// `Done` and `Error` are terminal. The only legal transitions move
/// forward; the single forward jump is `Pending -> Error`, used when
/// a queued write is cancelled before a worker ever picks it up.
/// `Pending -> Done` is illegal -- a write can't succeed without
/// being executed.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Pending,
    Writing,
    Done,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }

    /// Indicates whether a transition from `self` to `to` is legal.
    pub fn can_advance(self, to: State) -> bool {
        match (self, to) {
            (State::Pending, State::Writing) => true,
            (State::Pending, State::Error) => true,
            (State::Writing, State::Done) => true,
            (State::Writing, State::Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Pending => write!(f, "PENDING"),
            State::Writing => write!(f, "WRITING"),
            State::Done => write!(f, "DONE"),
            State::Error => write!(f, "ERROR"),
        }
    }
}

/// The tracked lifecycle of one asynchronous write, from submission
/// to terminal state. Transaction IDs are opaque to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub state: State,
    pub message: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Transaction {
    pub fn new(id: String) -> Transaction {
        let now = Utc::now();

        Transaction {
            id,
            state: State::Pending,
            message: String::new(),
            created: now,
            updated: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!State::Pending.is_terminal());
        assert!(!State::Writing.is_terminal());
        assert!(State::Done.is_terminal());
        assert!(State::Error.is_terminal());
    }

    // The transition matrix only moves forward. No state is
    // re-enterable and nothing leaves a terminal state.

    #[test]
    fn test_transitions() {
        let all =
            [State::Pending, State::Writing, State::Done, State::Error];

        assert!(State::Pending.can_advance(State::Writing));
        assert!(State::Pending.can_advance(State::Error));
        assert!(State::Writing.can_advance(State::Done));
        assert!(State::Writing.can_advance(State::Error));

        // A write can't complete without being executed.

        assert!(!State::Pending.can_advance(State::Done));

        for from in all {
            assert!(!from.can_advance(State::Pending));
            assert!(!from.can_advance(from));
        }

        for to in all {
            assert!(!State::Done.can_advance(to));
            assert!(!State::Error.can_advance(to));
        }
    }

    #[test]
    fn test_new_transaction() {
        let txn = Transaction::new("abc".into());

        assert_eq!(txn.state, State::Pending);
        assert_eq!(txn.created, txn.updated);
        assert!(txn.message.is_empty());
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(
            serde_json::to_string(&State::Pending).unwrap(),
            r#""PENDING""#
        );
        assert_eq!(
            serde_json::from_str::<State>(r#""DONE""#).unwrap(),
            State::Done
        );
    }
}
