//! Acceptance thresholds per iteration.

use std::str::FromStr;

use crate::error::{AbcError, Result};

/// How the tolerance decreases from its start value to its minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToleranceKind {
    /// Geometric interpolation.
    #[default]
    Exp,
    /// Arithmetic interpolation.
    Lin,
    /// Logarithmic decay: fast at first, then flattening towards the minimum.
    Log,
    /// The start value in every iteration.
    Const,
}

impl FromStr for ToleranceKind {
    type Err = AbcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exp" => Ok(Self::Exp),
            "lin" | "linear" => Ok(Self::Lin),
            "log" => Ok(Self::Log),
            "const" => Ok(Self::Const),
            other => Err(AbcError::Configuration(format!(
                "unknown tolerance type '{}', expected one of exp, lin, log, const",
                other
            ))),
        }
    }
}

/// Settings for the tolerance schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceSettings {
    /// Tolerance of the first iteration.
    pub start: f64,
    /// Floor of the schedule. Sampling stops once it is reached.
    pub min: f64,
    pub kind: ToleranceKind,
    /// Replace the scheduled value by a percentile of the accepted distances
    /// of the previous iteration.
    pub adaptive: bool,
    /// Percentile in `[0, 100]` used in adaptive mode.
    pub threshold: f64,
    /// An explicit non-increasing sequence. Overrides `start`, `min` and
    /// `kind` when set.
    pub values: Option<Vec<f64>>,
}

impl Default for ToleranceSettings {
    fn default() -> Self {
        Self {
            start: 1.,
            min: 1e-2,
            kind: ToleranceKind::Exp,
            adaptive: false,
            threshold: 75.,
            values: None,
        }
    }
}

/// The tolerance of every iteration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceSchedule {
    values: Box<[f64]>,
    min: f64,
    adaptive: bool,
    threshold: f64,
}

impl ToleranceSchedule {
    pub fn new(settings: &ToleranceSettings, num_iterations: usize) -> Result<Self> {
        if num_iterations == 0 {
            return Err(AbcError::Configuration(
                "at least one iteration is required".to_string(),
            ));
        }
        if !(0. ..=100.).contains(&settings.threshold) {
            return Err(AbcError::Configuration(format!(
                "adaptive threshold must be a percentile in [0, 100], got {}",
                settings.threshold
            )));
        }

        if let Some(values) = &settings.values {
            return Self::from_values(values, num_iterations, settings.adaptive, settings.threshold);
        }

        let ToleranceSettings {
            start, min, kind, ..
        } = *settings;
        if !(start.is_finite() && min.is_finite() && min > 0. && min <= start) {
            return Err(AbcError::Configuration(format!(
                "tolerance bounds must satisfy 0 < min <= start, got [{}, {}]",
                start, min
            )));
        }

        let last = (num_iterations - 1).max(1) as f64;
        let mut values: Box<[f64]> = (0..num_iterations)
            .map(|t| {
                let frac = t as f64 / last;
                match kind {
                    ToleranceKind::Exp => start * (min / start).powf(frac),
                    ToleranceKind::Lin => start + (min - start) * frac,
                    ToleranceKind::Log => {
                        start - (start - min) * (1. + t as f64).ln() / (1. + last).ln()
                    }
                    ToleranceKind::Const => start,
                }
            })
            .collect();

        if num_iterations > 1 && kind != ToleranceKind::Const {
            values[num_iterations - 1] = min;
        }

        Ok(Self {
            values,
            min,
            adaptive: settings.adaptive,
            threshold: settings.threshold,
        })
    }

    fn from_values(
        values: &[f64],
        num_iterations: usize,
        adaptive: bool,
        threshold: f64,
    ) -> Result<Self> {
        if values.len() < num_iterations {
            return Err(AbcError::Configuration(format!(
                "explicit tolerance sequence has {} values but {} iterations are requested",
                values.len(),
                num_iterations
            )));
        }
        let values = &values[..num_iterations];
        if values.iter().any(|&eps| !eps.is_finite() || eps <= 0.) {
            return Err(AbcError::Configuration(
                "tolerances must be finite and positive".to_string(),
            ));
        }
        if values.windows(2).any(|pair| pair[1] > pair[0]) {
            return Err(AbcError::Configuration(
                "explicit tolerance sequence must be non-increasing".to_string(),
            ));
        }
        Ok(Self {
            values: values.into(),
            min: values[num_iterations - 1],
            adaptive,
            threshold,
        })
    }

    pub fn initial(&self) -> f64 {
        self.values[0]
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn scheduled(&self, iteration: usize) -> Option<f64> {
        self.values.get(iteration).copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Tolerance of iteration `iteration + 1`, given the tolerance `current`
    /// of `iteration` and the distances accepted in it.
    ///
    /// The result never exceeds `current` and never drops below the floor.
    pub fn next(&self, iteration: usize, current: f64, distances: &[f64]) -> f64 {
        let proposed = if self.adaptive && !distances.is_empty() {
            quantile(distances, self.threshold)
        } else {
            self.scheduled(iteration + 1).unwrap_or(current)
        };
        proposed.min(current).max(self.min)
    }

    pub fn reached_floor(&self, tolerance: f64) -> bool {
        tolerance <= self.min
    }
}

/// Percentile `q` in `[0, 100]` with linear interpolation between the
/// order statistics.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = (q / 100.).clamp(0., 1.) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::{quantile, ToleranceKind, ToleranceSchedule, ToleranceSettings};

    fn settings(kind: ToleranceKind) -> ToleranceSettings {
        ToleranceSettings {
            start: 0.5,
            min: 0.002,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn parse_kind() {
        assert_eq!("exp".parse::<ToleranceKind>().unwrap(), ToleranceKind::Exp);
        assert_eq!("LIN".parse::<ToleranceKind>().unwrap(), ToleranceKind::Lin);
        assert_eq!("log".parse::<ToleranceKind>().unwrap(), ToleranceKind::Log);
        assert_eq!(
            "const".parse::<ToleranceKind>().unwrap(),
            ToleranceKind::Const
        );
        assert!("cubic".parse::<ToleranceKind>().is_err());
    }

    #[test]
    fn schedules_end_at_min() {
        for kind in [ToleranceKind::Exp, ToleranceKind::Lin, ToleranceKind::Log] {
            let schedule = ToleranceSchedule::new(&settings(kind), 20).unwrap();
            assert_eq!(schedule.len(), 20);
            assert_eq!(schedule.initial(), 0.5);
            assert_eq!(schedule.scheduled(19), Some(0.002));
            assert!(schedule.values().windows(2).all(|w| w[1] <= w[0]));
        }

        let exp = ToleranceSchedule::new(&settings(ToleranceKind::Exp), 3).unwrap();
        assert_relative_eq!(exp.values()[1], (0.5f64 * 0.002).sqrt(), epsilon = 1e-12);

        let lin = ToleranceSchedule::new(&settings(ToleranceKind::Lin), 3).unwrap();
        assert_relative_eq!(lin.values()[1], 0.251, epsilon = 1e-12);
    }

    #[test]
    fn const_schedule() {
        let schedule = ToleranceSchedule::new(&settings(ToleranceKind::Const), 10).unwrap();
        assert!(schedule.values().iter().all(|&eps| eps == 0.5));
        assert_eq!(schedule.next(3, 0.5, &[0.1, 0.2]), 0.5);
    }

    #[test]
    fn invalid_bounds() {
        let mut bad = settings(ToleranceKind::Exp);
        bad.min = 1.;
        assert!(ToleranceSchedule::new(&bad, 5).is_err());
        bad.min = 0.;
        assert!(ToleranceSchedule::new(&bad, 5).is_err());

        let mut bad = settings(ToleranceKind::Exp);
        bad.threshold = 120.;
        assert!(ToleranceSchedule::new(&bad, 5).is_err());

        let mut bad = settings(ToleranceKind::Exp);
        bad.values = Some(vec![1., 0.5, 0.7]);
        assert!(ToleranceSchedule::new(&bad, 3).is_err());
        bad.values = Some(vec![1., 0.5]);
        assert!(ToleranceSchedule::new(&bad, 3).is_err());
    }

    #[test]
    fn explicit_values() {
        let mut explicit = settings(ToleranceKind::Exp);
        explicit.values = Some(vec![2., 1., 0.5, 0.25]);
        let schedule = ToleranceSchedule::new(&explicit, 3).unwrap();
        assert_eq!(schedule.values(), &[2., 1., 0.5]);
        assert_eq!(schedule.min(), 0.5);
    }

    #[test]
    fn adaptive_quantile() {
        let mut adaptive = settings(ToleranceKind::Exp);
        adaptive.adaptive = true;
        let schedule = ToleranceSchedule::new(&adaptive, 10).unwrap();

        let distances = [0.1, 0.4, 0.2, 0.3, 0.05];
        assert_relative_eq!(schedule.next(0, 0.5, &distances), 0.3, epsilon = 1e-12);
        // Never above the current tolerance
        assert_eq!(schedule.next(0, 0.25, &distances), 0.25);
        // Never below the floor
        assert_eq!(schedule.next(0, 0.5, &[0.0001, 0.0002]), 0.002);
    }

    #[test]
    fn quantile_interpolates() {
        let values = [1., 2., 3., 4.];
        assert_relative_eq!(quantile(&values, 0.), 1., epsilon = 1e-12);
        assert_relative_eq!(quantile(&values, 100.), 4., epsilon = 1e-12);
        assert_relative_eq!(quantile(&values, 50.), 2.5, epsilon = 1e-12);
        assert_relative_eq!(quantile(&values, 75.), 3.25, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn next_is_monotone(
            distances in proptest::collection::vec(0f64..1f64, 1..50),
            current in 0.002f64..1f64,
            adaptive in any::<bool>(),
        ) {
            let mut s = settings(ToleranceKind::Exp);
            s.adaptive = adaptive;
            let schedule = ToleranceSchedule::new(&s, 10).unwrap();
            let next = schedule.next(2, current, &distances);
            prop_assert!(next <= current);
            prop_assert!(next >= schedule.min());
        }
    }
}
