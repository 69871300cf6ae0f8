use std::fmt::{self, Display};

use crate::{mapper::Identity, FailureKind};

const GENERIC_FAILURE_MESSAGE: &str = "Authentication failed. Please try signing in again.";

/// Steps a response goes through on the ACS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Parsed,
    SignatureVerified,
    Validated,
    Mapped,
    Emitted,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Parsed => "parsed",
            Stage::SignatureVerified => "signature_verified",
            Stage::Validated => "validated",
            Stage::Mapped => "mapped",
            Stage::Emitted => "emitted",
        };
        f.write_str(name)
    }
}

/// Final result of one ACS request, handed to the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcsOutcome {
    /// Echoed back untouched, on success and failure alike.
    pub relay_state: Option<String>,
    pub result: Result<Identity, FailureKind>,
}

impl AcsOutcome {
    pub fn success(identity: Identity, relay_state: Option<String>) -> Self {
        Self {
            relay_state,
            result: Ok(identity),
        }
    }

    pub fn failure(kind: FailureKind, relay_state: Option<String>) -> Self {
        Self {
            relay_state,
            result: Err(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.result.as_ref().ok()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().copied()
    }

    /// What to show the browser. Failures all read the same.
    pub fn user_message(&self) -> Option<&'static str> {
        self.failure_kind().map(|_| GENERIC_FAILURE_MESSAGE)
    }
}
