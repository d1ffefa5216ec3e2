//! Wall-clock scheduler for periodic jobs: the daily update sweep, the
//! agent release check, and retention purges.
//!
//! Fire decisions compare timestamps, not dates: a job whose target passed
//! earlier today and which has not run since must fire today, even when the
//! service started after the target.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use dm_store::Store;
use dm_updates::UpdateChecker;
use tracing::{error, info, warn};

/// Time source, injected so tests control the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse `HH:MM`, returning minutes after local midnight.
fn parse_target(target: &str) -> Option<i32> {
    let time = NaiveTime::parse_from_str(target, "%H:%M").ok()?;
    Some(
        chrono::Timelike::hour(&time) as i32 * 60 + chrono::Timelike::minute(&time) as i32,
    )
}

/// Convert a local wall-clock target to minutes after UTC midnight:
/// `target_utc = (local_minutes − offset) mod 1440`.
pub fn target_utc_minutes(local_minutes: i32, offset_minutes: i32) -> i32 {
    (local_minutes - offset_minutes).rem_euclid(1440)
}

/// Latest occurrence of the target at or before `now`.
fn latest_occurrence(target_utc: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let today = midnight + TimeDelta::minutes(target_utc as i64);
    if today <= now {
        today
    } else {
        today - TimeDelta::days(1)
    }
}

/// Whether a job is due: its most recent occurrence is at or before `now`
/// and strictly after the last run.
pub fn should_run(
    target: &str,
    offset_minutes: i32,
    now: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
) -> bool {
    let Some(local_minutes) = parse_target(target) else {
        warn!(target, "Invalid schedule target");
        return false;
    };
    let occurrence = latest_occurrence(target_utc_minutes(local_minutes, offset_minutes), now);
    match last_run_at {
        Some(last_run) => occurrence > last_run,
        None => true,
    }
}

/// Seconds to sleep before the next check. Due jobs still wait the minimum
/// sleep to prevent tight loops.
pub fn sleep_until_next_check(
    target: &str,
    offset_minutes: i32,
    now: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    min_sleep: Duration,
) -> Duration {
    let Some(local_minutes) = parse_target(target) else {
        return min_sleep.max(Duration::from_secs(3600));
    };
    if should_run(target, offset_minutes, now, last_run_at) {
        return min_sleep;
    }
    let occurrence = latest_occurrence(target_utc_minutes(local_minutes, offset_minutes), now);
    let next = occurrence + TimeDelta::days(1);
    let until = (next - now).to_std().unwrap_or(Duration::ZERO);
    until.max(min_sleep)
}

struct JobState {
    name: &'static str,
    last_run_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    store: Store,
    checker: Arc<UpdateChecker>,
    clock: Arc<dyn Clock>,
    min_sleep: Duration,
    resolved_alert_retention_days: i64,
    event_retention_days: i64,
}

impl Scheduler {
    pub fn new(
        store: Store,
        checker: Arc<UpdateChecker>,
        clock: Arc<dyn Clock>,
        min_sleep: Duration,
        resolved_alert_retention_days: i64,
        event_retention_days: i64,
    ) -> Self {
        Self {
            store,
            checker,
            clock,
            min_sleep,
            resolved_alert_retention_days,
            event_retention_days,
        }
    }

    /// Main loop. All jobs share the daily update-check target from global
    /// settings; purges run alongside the sweep.
    pub async fn run(self) {
        info!("Scheduler started");
        let mut jobs = [
            JobState { name: "update_check", last_run_at: None },
            JobState { name: "purge_resolved_alerts", last_run_at: None },
            JobState { name: "purge_cached_events", last_run_at: None },
            JobState { name: "purge_expired_tokens", last_run_at: None },
        ];

        loop {
            let (target, offset) = match self.store.global_settings() {
                Ok(settings) => (settings.update_check_time, settings.timezone_offset_minutes),
                Err(e) => {
                    error!("Scheduler: failed to read settings: {e}");
                    ("04:00".to_string(), 0)
                }
            };
            let now = self.clock.now();

            for job in jobs.iter_mut() {
                if should_run(&target, offset, now, job.last_run_at) {
                    info!(job = job.name, "Running scheduled job");
                    self.run_job(job.name).await;
                    job.last_run_at = Some(self.clock.now());
                }
            }

            let earliest = jobs
                .iter()
                .map(|job| sleep_until_next_check(&target, offset, now, job.last_run_at, self.min_sleep))
                .min()
                .unwrap_or(self.min_sleep);
            tokio::time::sleep(earliest).await;
        }
    }

    async fn run_job(&self, name: &str) {
        match name {
            "update_check" => {
                let stats = self.checker.check_all_containers().await;
                info!(
                    checked = stats.checked,
                    updates = stats.updates_found,
                    "Update sweep done"
                );
            }
            "purge_resolved_alerts" => {
                match self
                    .store
                    .purge_resolved_alerts_older_than(self.resolved_alert_retention_days)
                {
                    Ok(purged) if purged > 0 => info!(purged, "Purged resolved alerts"),
                    Ok(_) => {}
                    Err(e) => error!("Alert purge failed: {e}"),
                }
            }
            "purge_cached_events" => {
                match self.store.purge_events_older_than(self.event_retention_days) {
                    Ok(purged) if purged > 0 => info!(purged, "Purged cached events"),
                    Ok(_) => {}
                    Err(e) => error!("Event purge failed: {e}"),
                }
            }
            "purge_expired_tokens" => {
                if let Err(e) = self.store.purge_expired_tokens() {
                    error!("Token purge failed: {e}");
                }
            }
            other => warn!(job = other, "Unknown scheduled job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_target_utc_conversion() {
        // 08:00 New York (UTC-5) is 13:00 UTC
        assert_eq!(target_utc_minutes(8 * 60, -300), 13 * 60);
        // 08:00 Paris (UTC+1) is 07:00 UTC
        assert_eq!(target_utc_minutes(8 * 60, 60), 7 * 60);
        // 02:00 Tokyo (UTC+9) wraps to the previous UTC day: 17:00
        assert_eq!(target_utc_minutes(2 * 60, 540), 17 * 60);
        // 23:00 at UTC-3 wraps forward: 02:00
        assert_eq!(target_utc_minutes(23 * 60, -180), 2 * 60);
        // Half-hour offset (UTC+5:30)
        assert_eq!(target_utc_minutes(9 * 60, 330), 3 * 60 + 30);
    }

    #[test]
    fn test_fires_same_day_after_target() {
        // Service started 07:00 UTC, target 08:00 UTC, check at 08:30 UTC:
        // must fire today, not tomorrow (timestamp comparison, not dates)
        let now = utc(2025, 11, 16, 8, 30);
        let last_run = Some(utc(2025, 11, 15, 8, 30));
        assert!(should_run("08:00", 0, now, last_run));
    }

    #[test]
    fn test_does_not_fire_before_target() {
        let now = utc(2025, 11, 16, 7, 30);
        let last_run = Some(utc(2025, 11, 15, 8, 30));
        // Latest occurrence is yesterday 08:00, which is before the last run
        assert!(!should_run("08:00", 0, now, last_run));
    }

    #[test]
    fn test_does_not_fire_twice_same_day() {
        let now = utc(2025, 11, 16, 9, 0);
        let last_run = Some(utc(2025, 11, 16, 8, 30));
        assert!(!should_run("08:00", 0, now, last_run));
    }

    #[test]
    fn test_never_ran_fires() {
        let now = utc(2025, 11, 16, 0, 5);
        assert!(should_run("08:00", 0, now, None));
    }

    #[test]
    fn test_sleep_until_tomorrow() {
        let now = utc(2025, 11, 16, 9, 0);
        let last_run = Some(utc(2025, 11, 16, 8, 0));
        let sleep = sleep_until_next_check("08:00", 0, now, last_run, Duration::from_secs(60));
        // Next occurrence is tomorrow 08:00, 23 h away
        assert_eq!(sleep, Duration::from_secs(23 * 3600));
    }

    #[test]
    fn test_minimum_sleep_enforced() {
        let now = utc(2025, 11, 16, 8, 30);
        // Due now: still sleeps the minimum to avoid a tight loop
        let sleep = sleep_until_next_check("08:00", 0, now, None, Duration::from_secs(60));
        assert_eq!(sleep, Duration::from_secs(60));
    }

    #[test]
    fn test_configurable_minimum_for_tests() {
        let now = utc(2025, 11, 16, 8, 30);
        let sleep = sleep_until_next_check("08:00", 0, now, None, Duration::ZERO);
        assert_eq!(sleep, Duration::ZERO);
    }

    #[test]
    fn test_smallest_instant_after_last_run() {
        // Property: next fire is the smallest occurrence > last_run_at
        let target = "12:00";
        let last_run = Some(utc(2025, 6, 1, 12, 0));
        // Just before the next occurrence
        assert!(!should_run(target, 0, utc(2025, 6, 2, 11, 59), last_run));
        // At the next occurrence
        assert!(should_run(target, 0, utc(2025, 6, 2, 12, 0), last_run));
    }

    #[test]
    fn test_timezone_day_wraparound_fire() {
        // Target 01:00 at UTC+9 is 16:00 UTC of the previous day
        let now = utc(2025, 11, 16, 16, 30);
        let last_run = Some(utc(2025, 11, 15, 16, 30));
        assert!(should_run("01:00", 540, now, last_run));
    }

    #[test]
    fn test_invalid_target_never_fires() {
        assert!(!should_run("25:99", 0, utc(2025, 1, 1, 0, 0), None));
    }
}
