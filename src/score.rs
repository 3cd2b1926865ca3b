use tracing::warn;

use crate::types::Metrics;

pub const MAX_SUB_SCORE: u32 = 30;
pub const MAX_PRIORITY_SCORE: u32 = 90;

/// Impressions at which the traffic-potential score stops scaling up.
const FULL_IMPRESSION_VOLUME: f64 = 10_000.0;

/// Expected organic CTR by SERP position 1..=20.
const EXPECTED_CTR: [f64; 20] = [
    0.284, 0.157, 0.110, 0.080, 0.072, 0.051, 0.040, 0.032, 0.028, 0.025, // 1-10
    0.020, 0.018, 0.016, 0.014, 0.012, 0.011, 0.010, 0.009, 0.008, 0.007, // 11-20
];

/// Benchmark CTR for an average position.
///
/// The position is rounded to the nearest whole rank and clamped into
/// 1..=20, so every rank past 20 shares the rank-20 value. Non-finite
/// positions read as rank 20.
pub fn expected_ctr(position: f64) -> f64 {
    let rank = if position.is_finite() {
        position.round().clamp(1.0, EXPECTED_CTR.len() as f64) as usize
    } else {
        EXPECTED_CTR.len()
    };
    EXPECTED_CTR[rank - 1]
}

pub fn content_age_score(age_days: i64) -> u32 {
    match age_days {
        d if d > 365 => 30,
        d if d > 180 => 23,
        d if d > 90 => 15,
        d if d > 30 => 8,
        _ => 0,
    }
}

pub fn traffic_decline_score(current_clicks: u64, previous_clicks: u64) -> u32 {
    if previous_clicks == 0 {
        return 0;
    }
    let lost = previous_clicks.saturating_sub(current_clicks) as f64;
    let decline_pct = lost / previous_clicks as f64 * 100.0;
    match decline_pct {
        p if p >= 50.0 => 30,
        p if p >= 30.0 => 25,
        p if p >= 20.0 => 20,
        p if p >= 10.0 => 15,
        p if p > 0.0 => 10,
        _ => 0,
    }
}

/// Score the CTR gap against the benchmark for the item's position,
/// weighted by how much search volume the item sees.
pub fn traffic_potential_score(impressions: u64, ctr: f64, position: f64) -> u32 {
    if impressions == 0 {
        return 0;
    }
    let expected = expected_ctr(position);
    let ctr = if ctr.is_finite() { ctr } else { 0.0 };
    let gap = (expected - ctr).max(0.0);
    if gap == 0.0 {
        return 0;
    }
    let impression_factor = (impressions as f64 / FULL_IMPRESSION_VOLUME).min(1.0);
    let raw = (gap / expected * impression_factor * MAX_SUB_SCORE as f64).min(MAX_SUB_SCORE as f64);
    raw.round() as u32
}

/// The three sub-scores and their clamped sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreBreakdown {
    pub content_age: u32,
    pub traffic_decline: u32,
    pub traffic_potential: u32,
    pub priority: u32,
    /// True when the raw sum exceeded [`MAX_PRIORITY_SCORE`].
    pub clamped: bool,
}

pub fn compose(content_age: u32, traffic_decline: u32, traffic_potential: u32) -> ScoreBreakdown {
    let raw = content_age + traffic_decline + traffic_potential;
    let clamped = raw > MAX_PRIORITY_SCORE;
    if clamped {
        warn!(
            raw,
            content_age, traffic_decline, traffic_potential, "Priority score clamped to {}", MAX_PRIORITY_SCORE
        );
    }
    ScoreBreakdown {
        content_age,
        traffic_decline,
        traffic_potential,
        priority: raw.min(MAX_PRIORITY_SCORE),
        clamped,
    }
}

/// Full score for one item from its two measurement windows.
pub fn score_item(current: &Metrics, previous: &Metrics, age_days: i64) -> ScoreBreakdown {
    compose(
        content_age_score(age_days),
        traffic_decline_score(current.clicks, previous.clicks),
        traffic_potential_score(current.impressions, current.ctr, current.position),
    )
}
