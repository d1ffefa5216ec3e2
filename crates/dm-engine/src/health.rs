//! Debounced health state: consecutive-failure and consecutive-success
//! thresholds gate transitions so a single flapping probe never flips the
//! reported status.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebouncedHealth {
    /// Consecutive failures needed before marking unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes needed before marking healthy again.
    pub success_threshold: u32,
    pub current_status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl DebouncedHealth {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            current_status: HealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    /// Record one probe result. Returns the new status when this result
    /// caused a transition.
    pub fn record(&mut self, success: bool) -> Option<HealthStatus> {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.current_status == HealthStatus::Unhealthy
                && self.consecutive_successes >= self.success_threshold
            {
                self.current_status = HealthStatus::Healthy;
                return Some(HealthStatus::Healthy);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.current_status == HealthStatus::Healthy
                && self.consecutive_failures >= self.failure_threshold
            {
                self.current_status = HealthStatus::Unhealthy;
                return Some(HealthStatus::Unhealthy);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_does_not_flip() {
        let mut health = DebouncedHealth::new(3, 2);
        assert_eq!(health.record(false), None);
        assert_eq!(health.current_status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[test]
    fn test_transition_only_on_third_failure() {
        let mut health = DebouncedHealth::new(3, 2);
        assert_eq!(health.record(false), None);
        assert_eq!(health.record(false), None);
        // Exactly the third consecutive failure transitions
        assert_eq!(health.record(false), Some(HealthStatus::Unhealthy));
        // Further failures are not new transitions
        assert_eq!(health.record(false), None);
    }

    #[test]
    fn test_single_success_keeps_unhealthy() {
        let mut health = DebouncedHealth::new(3, 2);
        health.record(false);
        health.record(false);
        health.record(false);
        assert_eq!(health.current_status, HealthStatus::Unhealthy);

        // One success after three failures: counter moves, status holds
        assert_eq!(health.record(true), None);
        assert_eq!(health.consecutive_successes, 1);
        assert_eq!(health.current_status, HealthStatus::Unhealthy);

        // Second success completes the recovery
        assert_eq!(health.record(true), Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let mut health = DebouncedHealth::new(3, 2);
        health.record(false);
        health.record(false);
        health.record(false);
        health.record(true);
        health.record(false);
        assert_eq!(health.consecutive_successes, 0);
        assert_eq!(health.current_status, HealthStatus::Unhealthy);
    }
}
