//! Result of a call into best-effort infrastructure.

use std::fmt::Display;

/// Outcome of an operation whose dependency may be unavailable.
///
/// `Degraded` means the call was skipped or failed for infrastructure
/// reasons and was already logged; callers pick a safe default.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum BestEffort<T> {
    Ok(T),
    Degraded,
}

impl<T> BestEffort<T> {
    /// Log `err` at warn level under `what` and degrade.
    pub fn from_result<E: Display>(result: Result<T, E>, what: &'static str) -> Self {
        match result {
            Ok(value) => BestEffort::Ok(value),
            Err(err) => {
                tracing::warn!(error = %err, operation = what, "degraded: dependency unavailable");
                BestEffort::Degraded
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, BestEffort::Degraded)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Ok(value) => Some(value),
            BestEffort::Degraded => None,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.ok().unwrap_or(default)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BestEffort<U> {
        match self {
            BestEffort::Ok(value) => BestEffort::Ok(f(value)),
            BestEffort::Degraded => BestEffort::Degraded,
        }
    }
}

impl<T: Default> BestEffort<T> {
    pub fn unwrap_or_default(self) -> T {
        self.ok().unwrap_or_default()
    }
}
