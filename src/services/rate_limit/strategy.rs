//! Admission strategies and their per-domain state.
//!
//! A strategy is chosen once per domain from a [`StrategySpec`] and never
//! changes afterwards. The [`StrategySpec`] holds the parameters and
//! [`RateState`] the mutable part, so only the state is snapshotted.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::StrategySpec;
use crate::utils::duration;

/// Mutable admission state of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateState {
    FixedWindow {
        window_start: Option<DateTime<Utc>>,
        count: u32,
    },
    SlidingWindow {
        hits: VecDeque<DateTime<Utc>>,
    },
    AdaptiveWindow {
        limit: u32,
        window_start: Option<DateTime<Utc>>,
        count: u32,
        successes: u32,
        failures: u32,
        last_adjustment: DateTime<Utc>,
    },
    ExponentialBackoff {
        streak: u32,
        next_allowed: Option<DateTime<Utc>>,
    },
}

impl RateState {
    /// Fresh state for a strategy.
    pub fn new(spec: &StrategySpec, now: DateTime<Utc>) -> Self {
        match *spec {
            StrategySpec::FixedWindow { .. } => RateState::FixedWindow {
                window_start: None,
                count: 0,
            },
            StrategySpec::SlidingWindow { .. } => RateState::SlidingWindow {
                hits: VecDeque::new(),
            },
            StrategySpec::AdaptiveWindow { initial, .. } => RateState::AdaptiveWindow {
                limit: initial,
                window_start: None,
                count: 0,
                successes: 0,
                failures: 0,
                last_adjustment: now,
            },
            StrategySpec::ExponentialBackoff { .. } => RateState::ExponentialBackoff {
                streak: 0,
                next_allowed: None,
            },
        }
    }

    /// Whether this state belongs to the given strategy kind.
    pub fn fits(&self, spec: &StrategySpec) -> bool {
        matches!(
            (self, spec),
            (RateState::FixedWindow { .. }, StrategySpec::FixedWindow { .. })
                | (RateState::SlidingWindow { .. }, StrategySpec::SlidingWindow { .. })
                | (RateState::AdaptiveWindow { .. }, StrategySpec::AdaptiveWindow { .. })
                | (
                    RateState::ExponentialBackoff { .. },
                    StrategySpec::ExponentialBackoff { .. }
                )
        )
    }

    /// Admit one request if the strategy allows it. Admissions are counted.
    pub fn allow(&mut self, spec: &StrategySpec, now: DateTime<Utc>) -> bool {
        match (self, spec) {
            (
                RateState::FixedWindow {
                    window_start,
                    count,
                },
                &StrategySpec::FixedWindow {
                    max_requests,
                    window_secs,
                },
            ) => admit_fixed(
                window_start,
                count,
                max_requests,
                duration::from_secs(window_secs),
                now,
            ),
            (
                RateState::SlidingWindow { hits },
                &StrategySpec::SlidingWindow {
                    max_requests,
                    window_secs,
                },
            ) => {
                let window = duration::from_secs(window_secs);
                evict(hits, window, now);
                if hits.len() < max_requests as usize {
                    hits.push_back(now);
                    true
                } else {
                    false
                }
            }
            (
                RateState::AdaptiveWindow {
                    limit,
                    window_start,
                    count,
                    ..
                },
                &StrategySpec::AdaptiveWindow { window_secs, .. },
            ) => admit_fixed(
                window_start,
                count,
                *limit,
                duration::from_secs(window_secs),
                now,
            ),
            (RateState::ExponentialBackoff { next_allowed, .. }, _) => {
                next_allowed.is_none_or(|t| now >= t)
            }
            (state, spec) => {
                log::warn!(
                    "Rate state {:?} does not fit strategy {}; admitting",
                    state,
                    spec.kind()
                );
                true
            }
        }
    }

    /// Feed back the result of an admitted request.
    pub fn record(&mut self, spec: &StrategySpec, now: DateTime<Utc>, success: bool) {
        match (self, spec) {
            (
                RateState::AdaptiveWindow {
                    limit,
                    successes,
                    failures,
                    last_adjustment,
                    ..
                },
                &StrategySpec::AdaptiveWindow {
                    min,
                    max,
                    adjustment_interval_secs,
                    ..
                },
            ) => {
                if success {
                    *successes += 1;
                } else {
                    *failures += 1;
                }
                if now - *last_adjustment < duration::from_secs(adjustment_interval_secs) {
                    return;
                }

                let total = *successes + *failures;
                let ratio = *successes as f64 / total as f64;
                let current = *limit;
                let adjusted = if ratio > 0.95 {
                    let scaled = (current as f64 * 1.1).floor() as u32;
                    scaled.max(current.saturating_add(1))
                } else if ratio < 0.8 {
                    let scaled = (current as f64 * 0.8).floor() as u32;
                    scaled.min(current.saturating_sub(1))
                } else {
                    current
                };
                *limit = adjusted.clamp(min, max);
                if *limit != current {
                    log::debug!(
                        "Adaptive limit {} -> {} (success ratio {:.2})",
                        current,
                        *limit,
                        ratio
                    );
                }
                *successes = 0;
                *failures = 0;
                *last_adjustment = now;
            }
            (
                RateState::ExponentialBackoff {
                    streak,
                    next_allowed,
                },
                &StrategySpec::ExponentialBackoff {
                    base_secs,
                    cap_secs,
                    multiplier,
                },
            ) => {
                if success {
                    *streak = 0;
                    *next_allowed = Some(now + duration::from_secs_f64(base_secs));
                } else {
                    // The exponent counts this failure too.
                    *streak = streak.saturating_add(1);
                    let exponent = (*streak).min(i32::MAX as u32) as i32;
                    let delay = (base_secs * multiplier.powi(exponent)).min(cap_secs);
                    *next_allowed = Some(now + duration::from_secs_f64(delay));
                }
            }
            // Window strategies only count admissions.
            _ => {}
        }
    }

    /// Time until the next request would be admitted, zero if admissible now.
    pub fn wait_time(&self, spec: &StrategySpec, now: DateTime<Utc>) -> Duration {
        let wait = match (self, spec) {
            (
                RateState::FixedWindow {
                    window_start,
                    count,
                },
                &StrategySpec::FixedWindow {
                    max_requests,
                    window_secs,
                },
            ) => fixed_wait(*window_start, *count, max_requests, window_secs, now),
            (
                RateState::SlidingWindow { hits },
                &StrategySpec::SlidingWindow {
                    max_requests,
                    window_secs,
                },
            ) => {
                let window = duration::from_secs(window_secs);
                let live: Vec<_> = hits.iter().filter(|&&h| now - h < window).collect();
                if live.len() < max_requests as usize {
                    Duration::zero()
                } else {
                    // The oldest live hit has to leave the window first.
                    let excess = live.len() - max_requests as usize;
                    *live[excess] + window - now
                }
            }
            (
                RateState::AdaptiveWindow {
                    limit,
                    window_start,
                    count,
                    ..
                },
                &StrategySpec::AdaptiveWindow { window_secs, .. },
            ) => fixed_wait(*window_start, *count, *limit, window_secs, now),
            (RateState::ExponentialBackoff { next_allowed, .. }, _) => {
                next_allowed.map_or(Duration::zero(), |t| t - now)
            }
            _ => Duration::zero(),
        };
        wait.max(Duration::zero())
    }

    /// Effective request limit per window, if the strategy has one.
    pub fn current_limit(&self, spec: &StrategySpec) -> Option<u32> {
        match (self, spec) {
            (RateState::AdaptiveWindow { limit, .. }, _) => Some(*limit),
            (_, StrategySpec::FixedWindow { max_requests, .. })
            | (_, StrategySpec::SlidingWindow { max_requests, .. }) => Some(*max_requests),
            _ => None,
        }
    }

    /// Consecutive failures, for backoff strategies.
    pub fn failure_streak(&self) -> Option<u32> {
        match self {
            RateState::ExponentialBackoff { streak, .. } => Some(*streak),
            _ => None,
        }
    }
}

fn admit_fixed(
    window_start: &mut Option<DateTime<Utc>>,
    count: &mut u32,
    max: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> bool {
    if window_start.is_some_and(|start| now - start >= window) {
        *window_start = None;
        *count = 0;
    }
    if *count >= max {
        return false;
    }
    if window_start.is_none() {
        *window_start = Some(now);
    }
    *count += 1;
    true
}

fn fixed_wait(
    window_start: Option<DateTime<Utc>>,
    count: u32,
    max: u32,
    window_secs: u64,
    now: DateTime<Utc>,
) -> Duration {
    match window_start {
        Some(start) if count >= max => start + duration::from_secs(window_secs) - now,
        _ => Duration::zero(),
    }
}

fn evict(hits: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    while hits.front().is_some_and(|&h| now - h >= window) {
        hits.pop_front();
    }
}
