//! In-memory latency rollups per pipeline phase.
//!
//! Each phase keeps a bounded sample window so `/diagnostics/latency` can
//! report p50/p95/max and budget violations without persistent storage.

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

const MAX_SAMPLES_PER_PHASE: usize = 256;

/// Timed sections of the pipeline, each with a latency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Webhook,
    GmailApi,
    Datastore,
    Inference,
    Drain,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Webhook => "webhook",
            Phase::GmailApi => "gmail_api",
            Phase::Datastore => "datastore",
            Phase::Inference => "inference",
            Phase::Drain => "drain",
        }
    }

    pub fn budget_ms(&self) -> u64 {
        match self {
            Phase::Webhook => 10_000,
            Phase::GmailApi => 2_000,
            Phase::Datastore => 100,
            Phase::Inference => 15_000,
            Phase::Drain => 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRollup {
    pub phase: String,
    pub sample_count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
    pub budget_ms: u64,
    pub budget_violations: u64,
    pub failures: u64,
    pub last_recorded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRollups {
    pub generated_at: String,
    pub phases: Vec<PhaseRollup>,
}

#[derive(Debug, Clone, Default)]
struct PhaseWindow {
    samples_ms: VecDeque<u64>,
    budget_violations: u64,
    failures: u64,
    last_recorded_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct LatencyRecorder {
    windows: Mutex<HashMap<Phase, PhaseWindow>>,
}

impl LatencyRecorder {
    fn global() -> &'static Self {
        static RECORDER: OnceLock<LatencyRecorder> = OnceLock::new();
        RECORDER.get_or_init(Self::default)
    }

    fn record_sample(&self, phase: Phase, elapsed_ms: u64) {
        let mut windows = self.windows.lock();
        let window = windows.entry(phase).or_default();
        if elapsed_ms > phase.budget_ms() {
            window.budget_violations += 1;
        }
        if window.samples_ms.len() >= MAX_SAMPLES_PER_PHASE {
            window.samples_ms.pop_front();
        }
        window.samples_ms.push_back(elapsed_ms);
        window.last_recorded_at = Some(Utc::now());
    }

    fn increment_failure(&self, phase: Phase) {
        let mut windows = self.windows.lock();
        let window = windows.entry(phase).or_default();
        window.failures += 1;
        if window.last_recorded_at.is_none() {
            window.last_recorded_at = Some(Utc::now());
        }
    }

    fn snapshot(&self) -> LatencyRollups {
        let windows = self.windows.lock();
        let mut phases: Vec<PhaseRollup> = windows
            .iter()
            .map(|(phase, window)| {
                let mut values: Vec<u64> = window.samples_ms.iter().copied().collect();
                values.sort_unstable();
                PhaseRollup {
                    phase: phase.as_str().to_string(),
                    sample_count: values.len(),
                    p50_ms: percentile(&values, 50.0).unwrap_or(0),
                    p95_ms: percentile(&values, 95.0).unwrap_or(0),
                    max_ms: values.last().copied().unwrap_or(0),
                    budget_ms: phase.budget_ms(),
                    budget_violations: window.budget_violations,
                    failures: window.failures,
                    last_recorded_at: window.last_recorded_at.map(|dt| dt.to_rfc3339()),
                }
            })
            .collect();

        phases.sort_by(|a, b| b.p95_ms.cmp(&a.p95_ms).then(a.phase.cmp(&b.phase)));

        LatencyRollups {
            generated_at: Utc::now().to_rfc3339(),
            phases,
        }
    }
}

fn percentile(values: &[u64], p: f64) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(values[idx])
}

pub fn record_latency(phase: Phase, elapsed_ms: u64) {
    LatencyRecorder::global().record_sample(phase, elapsed_ms);
}

pub fn record_failure(phase: Phase) {
    LatencyRecorder::global().increment_failure(phase);
}

pub fn get_rollups() -> LatencyRollups {
    LatencyRecorder::global().snapshot()
}
