//! Pure curve math: interpolation, slew-rate limiting, and validation.
//!
//! Nothing in this module touches the Adapter, the Safety Supervisor, or
//! the filesystem — every function here is a deterministic map from its
//! arguments to a result, which is what makes the invariants in the
//! design's testable-properties section checkable by direct unit tests.

use std::collections::HashSet;

use crate::model::{CurvePoint, FanCurve, InterpolationKind};

/// `Interpolate`/`InterpolateLinear`: map (curve, temperature, last_output)
/// to a fan percent, selecting the smoothing curve from
/// `curve.interpolation`.
pub fn interpolate(curve: &FanCurve, temperature: f32, last_output: Option<f32>) -> f32 {
    let raw = interpolate_raw(curve, temperature);

    let after_hysteresis = match (last_output, curve.hysteresis > 0.0) {
        (Some(last), true) if (raw - last).abs() < curve.hysteresis => last,
        _ => raw,
    };

    after_hysteresis.clamp(curve.min_percent, curve.max_percent)
}

fn interpolate_raw(curve: &FanCurve, temperature: f32) -> f32 {
    if curve.points.is_empty() {
        return curve.min_percent;
    }

    let mut points: Vec<CurvePoint> = curve.points.clone();
    points.sort_by(|a, b| a.temperature.partial_cmp(&b.temperature).unwrap());

    if points.len() == 1 {
        return points[0].fan_percent.clamp(curve.min_percent, curve.max_percent);
    }

    let first = points.first().unwrap();
    let last = points.last().unwrap();
    if temperature <= first.temperature {
        return first.fan_percent;
    }
    if temperature >= last.temperature {
        return last.fan_percent;
    }

    let idx = points
        .windows(2)
        .position(|w| temperature >= w[0].temperature && temperature <= w[1].temperature)
        .expect("temperature is strictly between first and last point, a bracket must exist");

    let (p0, p1) = (points[idx], points[idx + 1]);
    let t = (temperature - p0.temperature) / (p1.temperature - p0.temperature);
    let s = match curve.interpolation {
        InterpolationKind::Cosine => (1.0 - (t * std::f32::consts::PI).cos()) / 2.0,
        InterpolationKind::Linear => t,
    };

    p0.fan_percent + (p1.fan_percent - p0.fan_percent) * s
}

/// `ApplyResponseTime`: slew-rate limit a transition from `current` toward
/// `target`, bounded by `response_seconds` to cross the full [0,100] range.
/// Never overshoots: if the unclamped step would reach or pass `target`,
/// returns `target` exactly.
pub fn apply_response_time(current: f32, target: f32, response_seconds: f32, delta_seconds: f32) -> f32 {
    if response_seconds <= 0.0 {
        return target;
    }

    let max_change = 100.0 * delta_seconds / response_seconds;
    let diff = target - current;
    let step = diff.signum() * diff.abs().min(max_change);
    current + step
}

/// `ValidateCurve`: returns the first invariant violation as a message, or
/// `Ok(())` if the curve is valid.
pub fn validate_curve(curve: &FanCurve) -> Result<(), String> {
    if curve.points.len() < 2 {
        return Err("curve must have at least 2 points".to_string());
    }
    for p in &curve.points {
        if !(-40.0..=150.0).contains(&p.temperature) {
            return Err(format!("point temperature {} out of range [-40, 150]", p.temperature));
        }
        if !(0.0..=100.0).contains(&p.fan_percent) {
            return Err(format!("point percent {} out of range [0, 100]", p.fan_percent));
        }
    }
    if !(0.0..=100.0).contains(&curve.min_percent) {
        return Err(format!("min_percent {} out of range [0, 100]", curve.min_percent));
    }
    if !(0.0..=100.0).contains(&curve.max_percent) {
        return Err(format!("max_percent {} out of range [0, 100]", curve.max_percent));
    }
    if curve.min_percent > curve.max_percent {
        return Err(format!(
            "min_percent {} exceeds max_percent {}",
            curve.min_percent, curve.max_percent
        ));
    }
    let mut seen = HashSet::new();
    for p in &curve.points {
        if !seen.insert(p.temperature.to_bits()) {
            return Err(format!("duplicate temperature {}", p.temperature));
        }
    }
    Ok(())
}

/// `NormalizeCurve`: dedupe by temperature (first point per temperature
/// wins) and sort ascending. All other fields pass through unchanged.
pub fn normalize_curve(curve: &FanCurve) -> FanCurve {
    let mut seen = HashSet::new();
    let mut deduped: Vec<CurvePoint> = Vec::with_capacity(curve.points.len());
    for p in &curve.points {
        if seen.insert(p.temperature.to_bits()) {
            deduped.push(*p);
        }
    }
    deduped.sort_by(|a, b| a.temperature.partial_cmp(&b.temperature).unwrap());

    let mut normalized = curve.clone();
    normalized.points = deduped;
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FanCurve;

    fn curve(points: &[(f32, f32)]) -> FanCurve {
        let pts = points.iter().map(|&(t, p)| CurvePoint::new(t, p)).collect();
        FanCurve::new("c", "c", pts)
    }

    #[test]
    fn linear_bracket_matches_points() {
        let mut c = curve(&[(30.0, 30.0), (70.0, 70.0)]);
        c.interpolation = InterpolationKind::Linear;
        c.min_percent = 0.0;
        c.max_percent = 100.0;
        c.hysteresis = 0.0;
        for t in [30.0, 40.0, 50.0, 60.0, 70.0] {
            assert_eq!(interpolate(&c, t, None), t);
        }
    }

    #[test]
    fn cosine_midpoint_is_exact() {
        let c = curve(&[(30.0, 30.0), (60.0, 60.0)]);
        let out = interpolate(&c, 45.0, None);
        assert!((out - 45.0).abs() < 1.0, "got {out}");
    }

    #[test]
    fn clamp_below_minimum() {
        let mut c = curve(&[(30.0, 10.0), (60.0, 60.0)]);
        c.min_percent = 30.0;
        assert_eq!(interpolate(&c, 30.0, None), 30.0);
    }

    #[test]
    fn hysteresis_holds_last_output() {
        let mut c = curve(&[(30.0, 30.0), (60.0, 60.0)]);
        c.hysteresis = 5.0;
        assert_eq!(interpolate(&c, 45.0, Some(43.0)), 43.0);
    }

    #[test]
    fn hysteresis_releases_once_delta_exceeds_threshold() {
        let mut c = curve(&[(30.0, 30.0), (60.0, 60.0)]);
        c.hysteresis = 5.0;
        let out = interpolate(&c, 59.0, Some(43.0));
        assert_ne!(out, 43.0);
    }

    #[test]
    fn interpolate_stays_within_bounds() {
        let mut c = curve(&[(0.0, 10.0), (30.0, 90.0), (100.0, 20.0)]);
        c.min_percent = 0.0;
        c.max_percent = 100.0;
        for i in 0..200 {
            let t = -40.0 + i as f32;
            let out = interpolate(&c, t, None);
            assert!(out >= c.min_percent && out <= c.max_percent);
        }
    }

    #[test]
    fn response_time_never_overshoots() {
        let out = apply_response_time(20.0, 80.0, 10.0, 1.0);
        assert!(out <= 80.0);
        assert!(out >= 20.0);
    }

    #[test]
    fn response_time_reaches_target_exactly_within_budget() {
        let out = apply_response_time(79.5, 80.0, 10.0, 1.0);
        assert_eq!(out, 80.0);
    }

    #[test]
    fn response_time_converges_within_ceil_ticks() {
        let response_seconds = 10.0_f32;
        let delta = 1.0_f32;
        let ticks_needed = (response_seconds / delta).ceil() as usize;
        let mut current = 0.0_f32;
        let target = 100.0_f32;
        for _ in 0..ticks_needed {
            current = apply_response_time(current, target, response_seconds, delta);
        }
        assert_eq!(current, target);
    }

    #[test]
    fn zero_response_time_jumps_to_target() {
        assert_eq!(apply_response_time(0.0, 100.0, 0.0, 1.0), 100.0);
    }

    #[test]
    fn validate_rejects_single_point() {
        let c = curve(&[(30.0, 30.0)]);
        assert!(validate_curve(&c).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_temperature() {
        let c = curve(&[(30.0, 10.0), (30.0, 90.0)]);
        assert!(validate_curve(&c).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_curve() {
        let c = curve(&[(30.0, 20.0), (80.0, 100.0)]);
        assert!(validate_curve(&c).is_ok());
    }

    #[test]
    fn normalize_is_idempotent_and_sorted() {
        let c = curve(&[(60.0, 60.0), (30.0, 30.0), (60.0, 99.0)]);
        let once = normalize_curve(&c);
        let twice = normalize_curve(&once);
        assert_eq!(once.points, twice.points);
        assert_eq!(once.points, vec![CurvePoint::new(30.0, 30.0), CurvePoint::new(60.0, 60.0)]);
    }

    #[test]
    fn interpolate_is_monotonic_for_monotonic_points() {
        let c = curve(&[(0.0, 0.0), (50.0, 50.0), (100.0, 100.0)]);
        let mut prev = interpolate(&c, -40.0, None);
        for i in 0..280 {
            let t = -40.0 + i as f32;
            let out = interpolate(&c, t, None);
            assert!(out >= prev - 1e-4, "not monotonic at t={t}: {out} < {prev}");
            prev = out;
        }
    }

    #[test]
    fn normalize_then_validate_accepts() {
        let c = curve(&[(60.0, 60.0), (30.0, 30.0), (60.0, 99.0), (90.0, 90.0)]);
        let normalized = normalize_curve(&c);
        assert!(validate_curve(&normalized).is_ok());
    }
}
