use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use wd_crypto::KdfParams;

use crate::error::{Result, TrustError};

pub const DEFAULT_LOCKOUT_THRESHOLD: u32 = 5;
pub const DEFAULT_LOCKOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_DESTRUCTION_THRESHOLD: u32 = 10;
pub const DEFAULT_DEVICE_REQUEST_TTL_SECS: u64 = 72 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ATTEMPT_LEASE_SECS: u64 = 60;
pub const DEFAULT_KEYRING_SERVICE: &str = "WardenChat";
/// Upper bound for any configured duration (100 years).
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// What a successful verification does to the lifetime failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifetimeFailurePolicy {
    /// Lifetime failures never decrease; destruction counts every wrong
    /// guess the account has ever seen.
    #[default]
    Accumulate,
    /// A successful verification clears the lifetime counter too.
    ResetOnSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub lockout_threshold: u32,
    pub lockout_duration_secs: u64,
    pub destruction_threshold: u32,
    pub lifetime_failure_policy: LifetimeFailurePolicy,
    /// How long a verification may hold its reserved attempt before the
    /// reservation is treated as abandoned.
    pub attempt_lease_secs: u64,
    /// Cost applied to new passcode digests and escrow blobs. Existing
    /// records keep the parameters they were created with.
    pub kdf: KdfParams,
    /// `null` disables expiry of pending device requests.
    pub device_request_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    pub keyring_service: String,
    /// Bound on compare-and-swap retries for contended profile updates.
    pub max_update_retries: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_duration_secs: DEFAULT_LOCKOUT_SECS,
            destruction_threshold: DEFAULT_DESTRUCTION_THRESHOLD,
            lifetime_failure_policy: LifetimeFailurePolicy::default(),
            attempt_lease_secs: DEFAULT_ATTEMPT_LEASE_SECS,
            kdf: KdfParams::interactive(),
            device_request_ttl_secs: Some(DEFAULT_DEVICE_REQUEST_TTL_SECS),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            keyring_service: DEFAULT_KEYRING_SERVICE.into(),
            max_update_retries: 8,
        }
    }
}

impl TrustConfig {
    /// Read a JSON config; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| TrustError::Config(format!("read {}: {e}", path.display())))?;
        let config: TrustConfig = serde_json::from_slice(&bytes)
            .map_err(|e| TrustError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lockout_threshold == 0 {
            return Err(TrustError::Config("lockout_threshold must be at least 1".into()));
        }
        if self.destruction_threshold <= self.lockout_threshold {
            return Err(TrustError::Config(format!(
                "destruction_threshold ({}) must exceed lockout_threshold ({})",
                self.destruction_threshold, self.lockout_threshold
            )));
        }
        if self.lockout_duration_secs == 0 {
            return Err(TrustError::Config("lockout_duration_secs must be positive".into()));
        }
        if self.attempt_lease_secs == 0 {
            return Err(TrustError::Config("attempt_lease_secs must be positive".into()));
        }
        if self.lockout_duration_secs > MAX_DURATION_SECS
            || self.attempt_lease_secs > MAX_DURATION_SECS
            || self.device_request_ttl_secs.is_some_and(|s| s > MAX_DURATION_SECS)
        {
            return Err(TrustError::Config("durations are capped at 100 years".into()));
        }
        if self.device_request_ttl_secs == Some(0) {
            return Err(TrustError::Config(
                "device_request_ttl_secs must be positive or null".into(),
            ));
        }
        self.kdf
            .check_bounds()
            .map_err(|reason| TrustError::Config(format!("kdf: {reason}")))?;
        if self.sweep_interval_secs == 0 {
            return Err(TrustError::Config("sweep_interval_secs must be positive".into()));
        }
        if self.max_update_retries == 0 {
            return Err(TrustError::Config("max_update_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn lockout_duration(&self) -> Duration {
        clamped_seconds(self.lockout_duration_secs)
    }

    pub fn attempt_lease(&self) -> Duration {
        clamped_seconds(self.attempt_lease_secs)
    }

    pub fn device_request_ttl(&self) -> Option<Duration> {
        self.device_request_ttl_secs.map(clamped_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

fn clamped_seconds(secs: u64) -> Duration {
    // Cannot truncate: MAX_DURATION_SECS fits in i64.
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let c = TrustConfig::default();
        assert_eq!(c.lockout_threshold, 5);
        assert_eq!(c.destruction_threshold, 10);
        assert_eq!(c.lockout_duration(), Duration::hours(1));
        assert_eq!(c.device_request_ttl(), Some(Duration::hours(72)));
        assert_eq!(c.lifetime_failure_policy, LifetimeFailurePolicy::Accumulate);
        c.validate().unwrap();
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        std::fs::write(
            &path,
            br#"{"lockout_threshold": 3, "device_request_ttl_secs": null, "lifetime_failure_policy": "reset_on_success"}"#,
        )
        .unwrap();
        let c = TrustConfig::load(&path).unwrap();
        assert_eq!(c.lockout_threshold, 3);
        assert_eq!(c.destruction_threshold, 10);
        assert_eq!(c.device_request_ttl(), None);
        assert_eq!(c.lifetime_failure_policy, LifetimeFailurePolicy::ResetOnSuccess);
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let c = TrustConfig {
            lockout_threshold: 10,
            destruction_threshold: 10,
            ..TrustConfig::default()
        };
        assert!(matches!(c.validate(), Err(TrustError::Config(_))));
    }

    #[test]
    fn runaway_kdf_cost_is_rejected() {
        let c = TrustConfig {
            kdf: KdfParams {
                memory_kib: 16 * 1024 * 1024,
                iterations: 2,
                parallelism: 1,
            },
            ..TrustConfig::default()
        };
        assert!(matches!(c.validate(), Err(TrustError::Config(_))));
    }
}
