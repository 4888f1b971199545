// NON-REENTRANCY GUARD
// Per-component "in call" flag wrapped around every externally reachable mutator.
//
// SAFETY INVARIANTS:
// 1. A guarded mutator cannot be entered again before it returns
// 2. The flag is always cleared on return, on success and on error alike
// 3. The flag is never persisted (a decoded ledger always starts unlocked)

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("reentrant call into {component}")]
pub struct ReentrancyError {
    pub component: &'static str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonReentrant {
    #[serde(skip)]
    entered: bool,
}

impl NonReentrant {
    pub fn is_entered(&self) -> bool {
        self.entered
    }

    pub fn enter(&mut self, component: &'static str) -> Result<(), ReentrancyError> {
        if self.entered {
            return Err(ReentrancyError { component });
        }
        self.entered = true;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.entered = false;
    }
}

/// Implemented by components whose mutators must not be re-entered.
pub trait Guarded: Sized {
    const COMPONENT: &'static str;

    fn guard_mut(&mut self) -> &mut NonReentrant;

    /// Run `f` with the guard held.
    fn non_reentrant<R, E>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, E>) -> Result<R, E>
    where
        E: From<ReentrancyError>,
    {
        self.guard_mut().enter(Self::COMPONENT)?;
        let result = f(self);
        self.guard_mut().exit();
        result
    }
}
