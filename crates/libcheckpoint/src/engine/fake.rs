use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use nix::unistd::Pid;

use super::{Availability, Engine, EngineError, EngineOptions, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Dump,
    Restore,
}

/// Fake engine for testing the orchestration code.
///
/// Records every invocation with the options it was given. A successful dump
/// leaves an image file behind so callers see a non-empty image directory.
/// Clones share the recorded calls.
#[derive(Clone)]
pub struct FakeEngine {
    available: bool,
    failure: Option<String>,
    restored_pid: i32,
    calls: Rc<RefCell<Vec<(Call, EngineOptions)>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            available: true,
            failure: None,
            restored_pid: 4242,
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing<S: Into<String>>(mut self, message: S) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<(Call, EngineOptions)> {
        self.calls.borrow().clone()
    }

    fn invoke(&self, call: Call, options: &EngineOptions) -> Result<()> {
        self.calls.borrow_mut().push((call, options.clone()));
        if let Some(message) = &self.failure {
            return Err(EngineError::InvocationFailed {
                message: message.clone(),
                log_file: Some(options.log_path()),
            });
        }
        Ok(())
    }
}

impl Engine for FakeEngine {
    fn availability(&self) -> Availability {
        if self.available {
            Availability::Available {
                version: Some(31700),
            }
        } else {
            Availability::Unavailable {
                reason: "criu not installed".to_string(),
            }
        }
    }

    fn dump(&self, options: &EngineOptions) -> Result<()> {
        self.invoke(Call::Dump, options)?;
        fs::write(options.images_dir().path().join("inventory.img"), b"fake")?;
        Ok(())
    }

    fn restore(&self, options: &EngineOptions) -> Result<Pid> {
        self.invoke(Call::Restore, options)?;
        Ok(Pid::from_raw(self.restored_pid))
    }
}
