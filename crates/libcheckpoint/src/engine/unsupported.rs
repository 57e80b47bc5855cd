use nix::unistd::Pid;

use super::{Availability, Engine, EngineError, EngineOptions, Result};

/// Stand-in used when checkpoint/restore is switched off. Every call reports
/// the engine as unavailable so callers can degrade instead of failing hard.
#[derive(Debug, Clone)]
pub struct Unsupported {
    reason: String,
}

impl Unsupported {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable(&self) -> EngineError {
        EngineError::Unavailable {
            reason: self.reason.clone(),
        }
    }
}

impl Engine for Unsupported {
    fn availability(&self) -> Availability {
        Availability::Unavailable {
            reason: self.reason.clone(),
        }
    }

    fn dump(&self, _options: &EngineOptions) -> Result<()> {
        Err(self.unavailable())
    }

    fn restore(&self, _options: &EngineOptions) -> Result<Pid> {
        Err(self.unavailable())
    }
}
