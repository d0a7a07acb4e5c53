//! # Production — Points-Per-Day and Credit Calculation
//!
//! Pure functions over frame time, frame count and the project's bonus
//! parameters. Nothing here is stored; callers recompute from the recorded
//! frame history whenever they need a value.
//!
//! ## Bonus Multiplier
//!
//! `unit_days` is the unit's elapsed time in days under the chosen
//! [`BonusCalculation`] basis.
//!
//! | Condition | Multiplier |
//! |-----------|------------|
//! | unit time 0, `k <= 0`, or `unit_days > maximum` | 1 |
//! | `unit_days <= preferred` | `max(1, sqrt(k * maximum / unit_days))` |
//! | `preferred < unit_days <= maximum` | linear from the preferred value down to 1 |
//!
//! The multiplier never increases with unit time, so neither does PPD.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Which elapsed time the bonus is computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BonusCalculation {
    /// Frame time multiplied by the number of frames.
    FrameTime,
    /// Completion time minus download time.
    #[default]
    DownloadTime,
    /// No bonus.
    None,
}

/// Which frames the frame time is averaged over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PpdCalculation {
    LastFrame,
    #[default]
    LastThreeFrames,
    AllFrames,
    /// Elapsed time since download divided by frames complete.
    EffectiveRate,
}

/// Units per day at `frame_time` per frame.
pub fn get_upd(frame_time: Duration, frames: u32) -> f64 {
    let unit_secs = frame_time.as_secs_f64() * frames as f64;
    if unit_secs <= 0.0 {
        return 0.0;
    }
    SECONDS_PER_DAY / unit_secs
}

pub fn get_bonus_multiplier(
    k_factor: f64,
    preferred_days: f64,
    maximum_days: f64,
    unit_time: Duration,
) -> f64 {
    if unit_time.is_zero() || k_factor <= 0.0 || preferred_days <= 0.0 || maximum_days <= 0.0 {
        return 1.0;
    }
    let unit_days = unit_time.as_secs_f64() / SECONDS_PER_DAY;
    if unit_days > maximum_days {
        return 1.0;
    }
    let at = |days: f64| (k_factor * maximum_days / days).sqrt().max(1.0);
    if unit_days <= preferred_days {
        return at(unit_days);
    }
    let at_preferred = at(preferred_days);
    let span = maximum_days - preferred_days;
    let progress = (unit_days - preferred_days) / span;
    (at_preferred - (at_preferred - 1.0) * progress).max(1.0)
}

pub fn get_credit(
    base_credit: f64,
    k_factor: f64,
    preferred_days: f64,
    maximum_days: f64,
    unit_time: Duration,
) -> f64 {
    base_credit * get_bonus_multiplier(k_factor, preferred_days, maximum_days, unit_time)
}

#[allow(clippy::too_many_arguments)]
pub fn get_ppd(
    frame_time: Duration,
    frames: u32,
    base_credit: f64,
    k_factor: f64,
    preferred_days: f64,
    maximum_days: f64,
    unit_time: Duration,
) -> f64 {
    if frame_time.is_zero() {
        return 0.0;
    }
    get_upd(frame_time, frames)
        * get_credit(base_credit, k_factor, preferred_days, maximum_days, unit_time)
}

/// PPD without bonus (base credit only).
pub fn get_base_ppd(frame_time: Duration, frames: u32, base_credit: f64) -> f64 {
    get_upd(frame_time, frames) * base_credit
}

pub fn round_to(value: f64, decimal_places: u32) -> f64 {
    let factor = 10f64.powi(decimal_places as i32);
    (value * factor).round() / factor
}
