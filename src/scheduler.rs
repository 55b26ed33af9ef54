//! Cron-driven runs for the default target day.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{ConfigError, TriggerError};
use crate::trigger::RunTrigger;

/// How often the ticker checks whether the schedule is due.
const TICK_INTERVAL: Duration = Duration::from_secs(15);

/// Parse a 6- or 7-field cron expression.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "INTAKE_CRON".into(),
        message: format!("invalid cron '{expr}': {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn the background ticker. Each fire triggers a run for yesterday.
pub fn spawn_cron_ticker(
    trigger: Arc<RunTrigger>,
    schedule: cron::Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = next_fire(&schedule, Utc::now());
        match next {
            Some(at) => info!(next_fire = %at, "Cron scheduler started"),
            None => {
                warn!("Cron schedule has no upcoming fire time, scheduler idle");
                return;
            }
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let Some(due) = next else { break };
            if now < due {
                continue;
            }
            next = next_fire(&schedule, now);

            match trigger.trigger(None).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    status = report.status.as_str(),
                    duration_ms = report.duration_ms,
                    "Scheduled run finished"
                ),
                Err(TriggerError::Busy) => warn!("Scheduled run skipped, another run is active"),
                Err(e) => error!(error = %e, "Scheduled run failed to start"),
            }
        }
        warn!("Cron schedule exhausted, scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_six_field_expression() {
        let schedule = parse_schedule("0 30 1 * * *").unwrap();
        let after: DateTime<Utc> = "2024-03-15T00:00:00Z".parse().unwrap();
        let next = next_fire(&schedule, after).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-15T01:30:00+00:00");
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let schedule = parse_schedule("0 0 * * * *").unwrap();
        let on_the_hour: DateTime<Utc> = "2024-03-15T05:00:00Z".parse().unwrap();
        let next = next_fire(&schedule, on_the_hour).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-15T06:00:00+00:00");
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_schedule("not a cron").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "INTAKE_CRON"));
    }
}
