//! Asyncify execution state.
//!
//! The instrumented module keeps its state in a global that is read through
//! the `asyncify_get_state` export. This module decodes that raw value.

use std::fmt;

use crate::error::ProtocolStateError;

/// Execution state reported by an Asyncify-instrumented module.
///
/// Transitions only ever follow `None -> Unwinding -> None -> Rewinding -> None`,
/// repeated once per suspension point within a logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionState {
    /// No suspend/resume cycle is active.
    #[default]
    None,
    /// The module is capturing its call stack into the save area.
    Unwinding,
    /// The module is replaying a captured call stack from the save area.
    Rewinding,
}

impl ExecutionState {
    /// Raw value as stored by the instrumented module.
    pub const fn as_raw(self) -> i32 {
        match self {
            ExecutionState::None => 0,
            ExecutionState::Unwinding => 1,
            ExecutionState::Rewinding => 2,
        }
    }

    /// Returns `true` if no cycle is active.
    pub const fn is_idle(self) -> bool {
        matches!(self, ExecutionState::None)
    }

    /// Fail with [`ProtocolStateError::UnexpectedState`] unless `self == expected`.
    pub fn expect(
        self,
        expected: ExecutionState,
        operation: &'static str,
    ) -> Result<(), ProtocolStateError> {
        if self == expected {
            Ok(())
        } else {
            Err(ProtocolStateError::UnexpectedState {
                operation,
                expected,
                actual: self,
            })
        }
    }
}

impl TryFrom<i32> for ExecutionState {
    type Error = ProtocolStateError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ExecutionState::None),
            1 => Ok(ExecutionState::Unwinding),
            2 => Ok(ExecutionState::Rewinding),
            other => Err(ProtocolStateError::UnknownState(other)),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::None => write!(f, "none"),
            ExecutionState::Unwinding => write!(f, "unwinding"),
            ExecutionState::Rewinding => write!(f, "rewinding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_decoding() {
        assert_eq!(ExecutionState::try_from(0).unwrap(), ExecutionState::None);
        assert_eq!(
            ExecutionState::try_from(1).unwrap(),
            ExecutionState::Unwinding
        );
        assert_eq!(
            ExecutionState::try_from(2).unwrap(),
            ExecutionState::Rewinding
        );
        assert_eq!(
            ExecutionState::try_from(7).unwrap_err(),
            ProtocolStateError::UnknownState(7)
        );
    }

    #[test]
    fn test_raw_encoding_matches_decoding() {
        for state in [
            ExecutionState::None,
            ExecutionState::Unwinding,
            ExecutionState::Rewinding,
        ] {
            assert_eq!(ExecutionState::try_from(state.as_raw()).unwrap(), state);
        }
    }

    #[test]
    fn test_expect() {
        assert!(
            ExecutionState::None
                .expect(ExecutionState::None, "call")
                .is_ok()
        );

        let err = ExecutionState::Unwinding
            .expect(ExecutionState::None, "import")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid async state unwinding during import, expected none"
        );
    }

    #[test]
    fn test_default_is_idle() {
        assert!(ExecutionState::default().is_idle());
        assert!(!ExecutionState::Rewinding.is_idle());
    }
}
