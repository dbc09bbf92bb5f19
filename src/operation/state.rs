//! Operation lifecycle states
//!
//! Staleness is tracked separately from the state: an operation can be
//! `Available` and stale (needs work) or `Available` and fresh.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PercolatorError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Created, but its owner has never been persisted
    Naive,
    /// Eligible for claiming
    Available,
    /// Claimed by exactly one worker
    Held,
    /// Computation failed; skipped until revived
    Error,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Naive => "naive",
            OperationState::Available => "available",
            OperationState::Held => "held",
            OperationState::Error => "error",
        }
    }

    /// Apply `transition`, or fail if it is not legal from here.
    pub fn apply(self, transition: Transition) -> Result<OperationState> {
        use OperationState::*;
        use Transition::*;

        match (self, transition) {
            (Naive, Mature) => Ok(Available),
            (Available, Acquire) => Ok(Held),
            (Held, Release) => Ok(Available),
            (Held, Choke) => Ok(Error),
            (Error, Revive) => Ok(Available),
            (state, transition) => Err(PercolatorError::State(format!(
                "cannot {} an operation that is {}",
                transition, state
            ))),
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Mature,
    Acquire,
    Release,
    Choke,
    Revive,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Mature => "mature",
            Transition::Acquire => "acquire",
            Transition::Release => "release",
            Transition::Choke => "choke",
            Transition::Revive => "revive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationState::*;
    use Transition::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(Naive.apply(Mature).unwrap(), Available);
        assert_eq!(Available.apply(Acquire).unwrap(), Held);
        assert_eq!(Held.apply(Release).unwrap(), Available);
        assert_eq!(Held.apply(Choke).unwrap(), Error);
        assert_eq!(Error.apply(Revive).unwrap(), Available);
    }

    #[test]
    fn test_illegal_transitions() {
        for (state, transition) in [
            (Held, Acquire),
            (Naive, Acquire),
            (Available, Release),
            (Available, Mature),
            (Error, Acquire),
            (Available, Revive),
            (Naive, Choke),
        ] {
            assert!(matches!(
                state.apply(transition),
                Err(PercolatorError::State(_))
            ));
        }
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_value(Held).unwrap(), serde_json::json!("held"));
        assert_eq!(Available.to_string(), "available");
    }
}
