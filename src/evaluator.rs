//! Condition Evaluator.
//!
//! A `done_when` set is conjunctive: every signal must be present in the
//! fused snapshot and satisfy its tolerance-widened target. Absent signals
//! make the whole condition false.

use crate::driver::SignalValue;
use crate::error::{EngineError, ToleranceExceeded};
use crate::fusion::FusedSnapshot;
use crate::recipe::{ColorTarget, HsvBox, RgbBox, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalOutcome {
    Satisfied,
    Unsatisfied,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub satisfied: bool,
    pub signals: BTreeMap<String, SignalOutcome>,
}

pub fn evaluate(
    done_when: &BTreeMap<String, Target>,
    tolerance: &BTreeMap<String, f64>,
    snapshot: &FusedSnapshot,
) -> bool {
    done_when.iter().all(|(signal, target)| {
        check_signal(signal, target, tolerance, snapshot) == SignalOutcome::Satisfied
    })
}

/// Per-signal breakdown, for progress reporting.
pub fn evaluate_detailed(
    done_when: &BTreeMap<String, Target>,
    tolerance: &BTreeMap<String, f64>,
    snapshot: &FusedSnapshot,
) -> Evaluation {
    let signals: BTreeMap<String, SignalOutcome> = done_when
        .iter()
        .map(|(signal, target)| {
            (
                signal.clone(),
                check_signal(signal, target, tolerance, snapshot),
            )
        })
        .collect();
    let satisfied = signals.values().all(|o| *o == SignalOutcome::Satisfied);
    Evaluation { satisfied, signals }
}

fn check_signal(
    signal: &str,
    target: &Target,
    tolerance: &BTreeMap<String, f64>,
    snapshot: &FusedSnapshot,
) -> SignalOutcome {
    let Some(fused) = snapshot.get(signal) else {
        return SignalOutcome::Absent;
    };
    let tol = tolerance.get(signal).copied().unwrap_or(0.0).abs();
    if target_satisfied(target, tol, &fused.value) {
        SignalOutcome::Satisfied
    } else {
        SignalOutcome::Unsatisfied
    }
}

/// Inclusive match of one value against a target widened by `tol`.
pub fn target_satisfied(target: &Target, tol: f64, value: &SignalValue) -> bool {
    match (target, value) {
        (Target::AtLeast(t), SignalValue::Scalar(v)) => *v >= t - tol,
        (Target::Interval([min, max]), SignalValue::Scalar(v)) => {
            *v >= min - tol && *v <= max + tol
        }
        (Target::Bounds(b), SignalValue::Scalar(v)) => {
            b.min.map_or(true, |min| *v >= min - tol) && b.max.map_or(true, |max| *v <= max + tol)
        }
        (Target::Color(color), SignalValue::Rgb(rgb)) => color_matches(color, tol, *rgb),
        _ => false,
    }
}

/// OR across color spaces, AND within one.
fn color_matches(target: &ColorTarget, tol: f64, rgb: [f64; 3]) -> bool {
    let rgb_ok = target.rgb.map(|b| rgb_in_box(&b, tol, rgb));
    let hsv_ok = target.hsv.map(|b| hsv_in_box(&b, tol, rgb_to_hsv(rgb)));
    rgb_ok.unwrap_or(false) || hsv_ok.unwrap_or(false)
}

fn within(interval: [f64; 2], tol: f64, v: f64) -> bool {
    v >= interval[0] - tol && v <= interval[1] + tol
}

fn rgb_in_box(b: &RgbBox, tol: f64, [r, g, bl]: [f64; 3]) -> bool {
    within(b.r, tol, r) && within(b.g, tol, g) && within(b.b, tol, bl)
}

fn hsv_in_box(b: &HsvBox, tol: f64, [h, s, v]: [f64; 3]) -> bool {
    let [lo, hi] = b.h;
    let hue_ok = if lo <= hi {
        within(b.h, tol, h)
    } else {
        // wraps through 0
        h >= lo - tol || h <= hi + tol
    };
    hue_ok && within(b.s, tol, s) && within(b.v, tol, v)
}

/// RGB in 0..=255 to HSV with hue in degrees and s, v in 0..=1.
pub fn rgb_to_hsv([r, g, b]: [f64; 3]) -> [f64; 3] {
    let (r, g, b) = (r / 255.0, g / 255.0, b / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f64::EPSILON {
        0.0
    } else if (max - r).abs() <= f64::EPSILON {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if (max - g).abs() <= f64::EPSILON {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max <= f64::EPSILON { 0.0 } else { delta / max };
    [hue, saturation, max]
}

/// Signals whose guidance band is currently left. Absent signals are not
/// reported; they are a fusion concern.
pub fn guidance_violations(
    step_id: &str,
    guidance: &BTreeMap<String, Target>,
    tolerance: &BTreeMap<String, f64>,
    snapshot: &FusedSnapshot,
) -> Vec<ToleranceExceeded> {
    guidance
        .iter()
        .filter_map(|(signal, target)| {
            let fused = snapshot.get(signal)?;
            let tol = tolerance.get(signal).copied().unwrap_or(0.0).abs();
            if target_satisfied(target, tol, &fused.value) {
                return None;
            }
            Some(ToleranceExceeded {
                step: step_id.to_string(),
                signal: signal.clone(),
                value: fused.value.channels().first().copied().unwrap_or(f64::NAN),
            })
        })
        .collect()
}

/// Rejects a condition set that can only be met above a safety ceiling.
pub fn check_feasible<F>(
    step_id: &str,
    done_when: &BTreeMap<String, Target>,
    tolerance: &BTreeMap<String, f64>,
    ceiling: F,
) -> Result<(), EngineError>
where
    F: Fn(&str) -> Option<f64>,
{
    for (signal, target) in done_when {
        let (Some(lower), Some(limit)) = (target.lower_bound(), ceiling(signal)) else {
            continue;
        };
        let tol = tolerance.get(signal).copied().unwrap_or(0.0).abs();
        if lower - tol > limit {
            return Err(EngineError::Impossible {
                step: step_id.to_string(),
                detail: format!(
                    "'{signal}' must reach {:.2}, above safety ceiling {limit:.2}",
                    lower - tol
                ),
            });
        }
    }
    Ok(())
}
