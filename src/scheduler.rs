//! Background drain on a cron schedule.
//!
//! Polls once a minute instead of sleeping until the next fire time, so a
//! run missed during system sleep fires once on wake.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::PipelineError;
use crate::state::AppState;

/// Poll interval for scheduler loop (1 minute)
const POLL_INTERVAL_SECS: u64 = 60;

pub struct Scheduler {
    state: Arc<AppState>,
    schedule: Schedule,
    timezone: Tz,
}

impl Scheduler {
    /// `None` when `processing.schedule` is unset.
    pub fn from_config(state: Arc<AppState>) -> Result<Option<Self>, PipelineError> {
        let Some(expr) = state
            .config
            .processing
            .schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Ok(None);
        };
        let schedule = parse_cron(expr)?;
        let timezone = parse_timezone(&state.config.processing.timezone)?;
        Ok(Some(Self {
            state,
            schedule,
            timezone,
        }))
    }

    /// Run forever, draining every connection at each scheduled time.
    pub async fn run(&self) {
        let mut next = next_run_after(&self.schedule, self.timezone, Utc::now());
        match next {
            Some(at) => log::info!("scheduler: first drain at {}", at.to_rfc3339()),
            None => {
                log::warn!("scheduler: schedule has no upcoming time, not starting");
                return;
            }
        }

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();
            let Some(due) = next else {
                return;
            };
            if now < due {
                continue;
            }

            match self.state.orchestrator.drain(None).await {
                Ok(summary) => log::info!(
                    "scheduler: drain done ({} processed, {} rejected)",
                    summary.processed,
                    summary.rejected
                ),
                Err(e) => log::error!("scheduler: drain failed: {}", e),
            }
            next = next_run_after(&self.schedule, self.timezone, Utc::now());
        }
    }
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, PipelineError> {
    // The cron crate expects 6 fields (with seconds), but we use 5-field format
    // Add "0" for seconds at the start
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        PipelineError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, PipelineError> {
    name.parse()
        .map_err(|_| PipelineError::Configuration(format!("Invalid timezone: {}", name)))
}

/// Next fire time strictly after `after`, evaluated in `tz`.
pub fn next_run_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
}
