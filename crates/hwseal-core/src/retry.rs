//! Bounded retry for mutating volume operations.

use crate::config::RetryCfg;
use crate::error::HwsealResult;
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Key installation: one retry after the first failure.
    pub const INSTALL: RetryPolicy = RetryPolicy { max_attempts: 2 };

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(cfg: &RetryCfg) -> Self {
        Self::new(cfg.install_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Call `op` until it succeeds or attempts run out; returns the last error.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> HwsealResult<T>
    where
        F: FnMut(u32) -> HwsealResult<T>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying",
                        self.max_attempts
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::INSTALL
    }
}
