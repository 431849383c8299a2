//! Rate limiting and heuristic rejection before an event is counted (C4).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct AntifraudRules {
    pub max_events_per_hour: u32,
    pub max_events_per_day: u32,
    pub min_duration_ms: u64,
    pub burst_window_secs: u64,
    pub max_events_per_burst_window: u32,
}

impl Default for AntifraudRules {
    fn default() -> Self {
        Self {
            max_events_per_hour: 100,
            max_events_per_day: 1000,
            min_duration_ms: 100,
            burst_window_secs: 1,
            max_events_per_burst_window: 5,
        }
    }
}

/// Candidate fields the guard needs to evaluate, independent of the full
/// `EventRecord` shape so callers can check eligibility before constructing
/// a ledger row.
pub struct Candidate<'a> {
    pub miner: &'a str,
    pub request_duration_ms: u64,
    pub payload_hash: &'a str,
    pub now_unix: u64,
}

/// Per-miner rolling event timestamps, used to enforce the hour/day windows
/// and the same-second burst rule.
#[derive(Default)]
pub struct AntifraudGuard {
    history: HashMap<String, VecDeque<u64>>,
}

const DAY_SECS: u64 = 86_400;

impl AntifraudGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates `candidate` against `rules`, returning the set of
    /// violated rule names (empty means accepted). Does not mutate
    /// internal state for rejected candidates except where the caller
    /// calls `record` separately; see `check_and_record`.
    pub fn evaluate(&self, candidate: &Candidate, rules: &AntifraudRules) -> Vec<&'static str> {
        let mut violations = Vec::new();

        if candidate.payload_hash.trim().is_empty() {
            violations.push("missing_payload_hash");
        }
        if candidate.request_duration_ms < rules.min_duration_ms {
            violations.push("duration_below_minimum");
        }

        if let Some(times) = self.history.get(candidate.miner) {
            let day_count = times
                .iter()
                .filter(|t| candidate.now_unix.saturating_sub(**t) < DAY_SECS)
                .count() as u32;
            if day_count >= rules.max_events_per_day {
                violations.push("daily_rate_limit_exceeded");
            }

            let hour_count = times
                .iter()
                .filter(|t| candidate.now_unix.saturating_sub(**t) < 3600)
                .count() as u32;
            if hour_count >= rules.max_events_per_hour {
                violations.push("hourly_rate_limit_exceeded");
            }

            let burst_count = times
                .iter()
                .filter(|t| candidate.now_unix.saturating_sub(**t) < rules.burst_window_secs)
                .count() as u32;
            // Counts the candidate itself, so with the default limit of 5
            // the 6th event in the window is the one rejected, matching
            // "> 5 events in any 1-second window".
            if burst_count + 1 > rules.max_events_per_burst_window {
                violations.push("burst_pattern_detected");
            }
        }

        violations
    }

    /// Evaluates and, if accepted, records the event timestamp for future
    /// rate-limit checks. Trims history older than 24h.
    pub fn check_and_record(&mut self, candidate: &Candidate, rules: &AntifraudRules) -> Vec<&'static str> {
        let violations = self.evaluate(candidate, rules);
        if violations.is_empty() {
            let entry = self.history.entry(candidate.miner.to_string()).or_default();
            entry.push_back(candidate.now_unix);
            while let Some(front) = entry.front() {
                if candidate.now_unix.saturating_sub(*front) >= DAY_SECS {
                    entry.pop_front();
                } else {
                    break;
                }
            }
        }
        violations
    }
}

/// Point scoring per §4.3: base 0.4 + retry bonus (capped) + fallback bonus
/// - duration penalty, clamped and rounded to 3 decimals.
pub fn calculate_points(retries: u32, fallback_used: bool, duration: Duration, min_points: f64, max_points: f64) -> f64 {
    let base_points = 0.4;
    let retry_bonus = (0.1 * retries as f64).min(0.3);
    let fallback_bonus = if fallback_used { 0.2 } else { 0.0 };
    let duration_penalty = if duration.as_millis() < 100 { 0.1 } else { 0.0 };

    let raw = base_points + retry_bonus + fallback_bonus - duration_penalty;
    let clamped = raw.clamp(min_points, max_points);
    (clamped * 1000.0).round() / 1000.0
}
