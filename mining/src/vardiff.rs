//! VarDiff engine: decides whether a client's difficulty should change,
//! based on the rate of its recent accepted shares.

use kps_core::client::ShareTimestampRing;
use kps_core::vardiff::round_diff;
use kps_core::VarDiffConfig;

const MIN_SWING: f64 = 0.25;
const MAX_SWING: f64 = 4.0;

/// Evaluate whether `diff` should change given `timestamps` and `config`.
/// Returns `Some(new_diff)` only when all gates pass and the computed
/// change clears the configured variance band; callers are responsible for
/// applying the new difficulty and resetting the timestamp ring.
pub fn check_adjustment(
    config: &VarDiffConfig,
    diff: f64,
    timestamps: &ShareTimestampRing,
    last_update_ms: u64,
    now_ms: u64,
) -> Option<f64> {
    if !config.enabled {
        return None;
    }
    if timestamps.len() < 10 {
        return None;
    }
    let elapsed_since_update = now_ms.saturating_sub(last_update_ms) as f64 / 1000.0;
    if elapsed_since_update < config.retarget_time {
        return None;
    }

    let samples = timestamps.recent_ms(10);
    let span_ms = samples.last().copied()?.saturating_sub(*samples.first()?);
    if span_ms == 0 {
        return None;
    }
    let avg_interval = (span_ms as f64 / 1000.0) / (samples.len() - 1) as f64;
    if avg_interval <= 0.0 {
        return None;
    }

    let deviation = (avg_interval - config.target_share_time).abs() / config.target_share_time;
    if deviation <= config.variance_percent {
        return None;
    }

    let new_diff = if config.use_proportional {
        let ratio = (config.target_share_time / avg_interval).clamp(MIN_SWING, MAX_SWING);
        config.clamp(round_diff(diff * ratio))
    } else {
        let adjusted = if avg_interval < config.target_share_time {
            diff * config.adjustment_factor
        } else {
            diff / config.adjustment_factor
        };
        config.clamp(round_diff(adjusted))
    };

    if (new_diff - diff).abs() < f64::EPSILON {
        None
    } else {
        Some(new_diff)
    }
}
