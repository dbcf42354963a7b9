//! Runtime configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Tunable knobs of the runtime.
///
/// Note on TTL interplay: the state TTL dominates the lock and signal TTLs.
/// If the lock, the cancellation signal and the state all expire before a
/// suspended run is resumed, the run is lost; keep the state TTL at least an
/// order of magnitude above the lock TTL.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum active execution time per run. Time spent suspended does not
    /// count. Default 300 000 ms.
    pub agent_timeout: Duration,
    /// Cache lifetime of persisted agent state. Default 86 400 s.
    pub agent_state_ttl: Duration,
    /// Blob lifetime for offloaded binary message content. Default 259 200 s.
    pub agent_content_ttl: Duration,
    /// Run lock TTL; doubles as the crash-detection heartbeat. Default 600 s.
    pub agent_run_lock_ttl: Duration,
    /// Cancellation signal TTL; must be at least the lock TTL. Default 600 s.
    pub cancellation_signal_ttl: Duration,
    /// Cooperative cancellation poll period. Default 2 000 ms.
    pub cancellation_poll_interval: Duration,
    /// Lifetime of signed blob download URLs produced on state read.
    /// Default 3 600 s.
    pub download_url_expiry: Duration,
    /// Maximum corrective retries when structured output fails validation.
    /// Default 3.
    pub output_validation_max_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_millis(300_000),
            agent_state_ttl: Duration::from_secs(86_400),
            agent_content_ttl: Duration::from_secs(259_200),
            agent_run_lock_ttl: Duration::from_secs(600),
            cancellation_signal_ttl: Duration::from_secs(600),
            cancellation_poll_interval: Duration::from_millis(2_000),
            download_url_expiry: Duration::from_secs(3_600),
            output_validation_max_retries: 3,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-run active execution budget.
    #[must_use]
    pub const fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set the state TTL.
    #[must_use]
    pub const fn with_agent_state_ttl(mut self, ttl: Duration) -> Self {
        self.agent_state_ttl = ttl;
        self
    }

    /// Set the run lock TTL.
    #[must_use]
    pub const fn with_agent_run_lock_ttl(mut self, ttl: Duration) -> Self {
        self.agent_run_lock_ttl = ttl;
        self
    }

    /// Set the cancellation signal TTL.
    #[must_use]
    pub const fn with_cancellation_signal_ttl(mut self, ttl: Duration) -> Self {
        self.cancellation_signal_ttl = ttl;
        self
    }

    /// Set the cooperative cancellation poll period.
    #[must_use]
    pub const fn with_cancellation_poll_interval(mut self, interval: Duration) -> Self {
        self.cancellation_poll_interval = interval;
        self
    }

    /// Set the signed download URL lifetime.
    #[must_use]
    pub const fn with_download_url_expiry(mut self, expiry: Duration) -> Self {
        self.download_url_expiry = expiry;
        self
    }

    /// Set the structured-output retry cap.
    #[must_use]
    pub const fn with_output_validation_max_retries(mut self, retries: u32) -> Self {
        self.output_validation_max_retries = retries;
        self
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the signal TTL is below the lock TTL
    /// (a cancellation signal must outlive the lock heartbeat) or when any
    /// duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.cancellation_signal_ttl < self.agent_run_lock_ttl {
            return Err(Error::validation(
                "cancellation_signal_ttl must be at least agent_run_lock_ttl",
            ));
        }
        if self.agent_timeout.is_zero()
            || self.agent_state_ttl.is_zero()
            || self.agent_run_lock_ttl.is_zero()
        {
            return Err(Error::validation("durations must be non-zero"));
        }
        Ok(())
    }
}
