//! calibration — measured width/distance table → continuous distance estimator
//!
//! A small lookup table of `(face pixel width, known distance)` samples is
//! turned into a function usable at arbitrary widths.  Two interchangeable
//! constructions are supported:
//!
//! - a single least-squares polynomial over the whole table, and
//! - a piecewise quadratic interpolant, exact at every sample.
//!
//! Both evaluate through the same interface, so the pipeline never knows
//! which one it is holding.  Queries outside the calibrated width range
//! extrapolate; accuracy degrades there but the result stays finite.

use std::cmp::Ordering;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::warn;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Default least-squares polynomial degree.
pub const DEFAULT_DEGREE: usize = 5;
/// Singular-value cutoff for the least-squares solve.
const LSTSQ_EPS: f64 = 1e-12;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Fatal calibration failures.  These abort startup; nothing here is
/// recoverable per frame.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration table needs at least {needed} samples, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("malformed calibration row at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("least-squares fit failed: {reason}")]
    Fit { reason: String },

    #[error("failed to read calibration table: {0}")]
    Io(#[from] std::io::Error),
}

// ── Table ────────────────────────────────────────────────────────────────────

/// One measured `(observed width, known distance)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    /// Face bounding-box width on screen, pixels.
    pub width: f64,
    /// Measured camera-to-face distance, meters.
    pub distance: f64,
}

/// The full measurement set, sorted by width ascending.
///
/// Sorting is required for interpolation validity.  Duplicate widths are
/// permitted; they degrade fit quality but are not rejected.
#[derive(Debug, Clone)]
pub struct CalibrationTable {
    samples: Vec<CalibrationSample>,
}

impl CalibrationTable {
    /// Load a table from a delimited text file: one `width,distance` record
    /// per line, no header.  Any malformed row fails the load.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_samples(parse(&content, true)?))
    }

    /// Like [`load`](Self::load), but malformed rows are skipped with a
    /// warning instead of failing the load.
    pub fn load_permissive<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_samples(parse(&content, false)?))
    }

    /// Build a table from in-memory samples.  Sorts by width.
    pub fn from_samples(mut samples: Vec<CalibrationSample>) -> Self {
        samples.sort_by(|a, b| a.width.partial_cmp(&b.width).unwrap_or(Ordering::Equal));
        Self { samples }
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Smallest and largest sampled width, if any.
    pub fn width_range(&self) -> Option<(f64, f64)> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some((first.width, last.width)),
            _ => None,
        }
    }
}

fn parse(content: &str, strict: bool) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let mut samples = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(line) {
            Ok(sample) => samples.push(sample),
            Err(reason) if strict => {
                return Err(CalibrationError::Malformed {
                    line: idx + 1,
                    reason,
                })
            }
            Err(reason) => {
                warn!(line = idx + 1, %reason, "skipping malformed calibration row");
            }
        }
    }
    Ok(samples)
}

fn parse_row(line: &str) -> Result<CalibrationSample, String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 2 {
        return Err(format!("expected 2 fields, found {}", fields.len()));
    }
    let mut values = [0.0f64; 2];
    for (slot, field) in values.iter_mut().zip(&fields) {
        let trimmed = field.trim();
        *slot = trimmed
            .parse::<f64>()
            .map_err(|_| format!("non-numeric field `{trimmed}`"))?;
        if !slot.is_finite() {
            return Err(format!("non-finite field `{trimmed}`"));
        }
    }
    Ok(CalibrationSample {
        width: values[0],
        distance: values[1],
    })
}

// ── Model ────────────────────────────────────────────────────────────────────

/// Which estimator to construct from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Ordinary least squares over the entire table.  Smooth, but can
    /// oscillate (Runge-type) when the degree approaches the sample count.
    Polynomial { degree: usize },
    /// Piecewise quadratic through every sample, extrapolated past the ends.
    Interpolate,
}

impl Default for FitMode {
    fn default() -> Self {
        FitMode::Polynomial {
            degree: DEFAULT_DEGREE,
        }
    }
}

/// An immutable width → distance estimator, built once at startup.
///
/// Evaluation is a pure function of the input: no interior mutability, safe
/// to share across threads, identical input always yields identical output.
#[derive(Debug, Clone)]
pub enum DistanceModel {
    Polynomial(PolynomialFit),
    Interpolated(QuadraticInterpolation),
}

impl DistanceModel {
    /// Construct an estimator from `table` per `mode`.
    ///
    /// Fails with [`CalibrationError::InsufficientData`] on an empty table,
    /// or when a degree-`d` polynomial is requested with fewer than `d + 1`
    /// samples.
    pub fn fit(table: &CalibrationTable, mode: FitMode) -> Result<Self, CalibrationError> {
        match mode {
            FitMode::Polynomial { degree } => Ok(Self::Polynomial(PolynomialFit::fit(table, degree)?)),
            FitMode::Interpolate => Ok(Self::Interpolated(QuadraticInterpolation::new(table)?)),
        }
    }

    /// Estimated distance for an on-screen face width.
    ///
    /// Never fails for finite input.  Outside [`calibrated_range`](Self::calibrated_range)
    /// the value is an extrapolation: finite, but with no accuracy guarantee.
    pub fn evaluate(&self, width: f64) -> f64 {
        match self {
            DistanceModel::Polynomial(p) => p.evaluate(width),
            DistanceModel::Interpolated(q) => q.evaluate(width),
        }
    }

    /// The width span actually covered by measurements.
    pub fn calibrated_range(&self) -> (f64, f64) {
        match self {
            DistanceModel::Polynomial(p) => p.range,
            DistanceModel::Interpolated(q) => q.range,
        }
    }

    /// Whether `width` falls inside the calibrated span.  Diagnostic only;
    /// out-of-range queries still evaluate.
    pub fn covers(&self, width: f64) -> bool {
        let (lo, hi) = self.calibrated_range();
        (lo..=hi).contains(&width)
    }

    /// Residuals of this model against a table, for fit inspection.
    pub fn fit_report(&self, table: &CalibrationTable) -> FitReport {
        let rows: Vec<FitRow> = table
            .samples()
            .iter()
            .map(|s| {
                let fitted = self.evaluate(s.width);
                FitRow {
                    width: s.width,
                    distance: s.distance,
                    fitted,
                    residual: fitted - s.distance,
                }
            })
            .collect();

        let mut mean = 0.0;
        let mut max = 0.0f64;
        for row in &rows {
            mean += row.residual.abs();
            max = max.max(row.residual.abs());
        }
        if !rows.is_empty() {
            mean /= rows.len() as f64;
        }

        FitReport {
            rows,
            mean_abs_residual: mean,
            max_abs_residual: max,
        }
    }
}

/// Round a distance for display, one decimal place.
pub fn round_display(distance: f64) -> f64 {
    (distance * 10.0).round() / 10.0
}

/// Per-sample fit diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct FitRow {
    pub width: f64,
    pub distance: f64,
    pub fitted: f64,
    pub residual: f64,
}

/// Fit quality summary over a whole table.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub rows: Vec<FitRow>,
    pub mean_abs_residual: f64,
    pub max_abs_residual: f64,
}

// ── Polynomial least squares ─────────────────────────────────────────────────

/// Single polynomial minimizing total squared residual over the table.
#[derive(Debug, Clone)]
pub struct PolynomialFit {
    /// Coefficients, ascending powers.
    coeffs: Vec<f64>,
    range: (f64, f64),
}

impl PolynomialFit {
    fn fit(table: &CalibrationTable, degree: usize) -> Result<Self, CalibrationError> {
        let samples = table.samples();
        let needed = degree + 1;
        if samples.len() < needed {
            return Err(CalibrationError::InsufficientData {
                needed,
                got: samples.len(),
            });
        }

        // Vandermonde design matrix: row i = [1, w_i, w_i², …, w_i^degree].
        let mut a = DMatrix::zeros(samples.len(), needed);
        for (i, s) in samples.iter().enumerate() {
            let mut power = 1.0;
            for j in 0..needed {
                a[(i, j)] = power;
                power *= s.width;
            }
        }
        let b = DVector::from_iterator(samples.len(), samples.iter().map(|s| s.distance));

        let coeffs = a
            .svd(true, true)
            .solve(&b, LSTSQ_EPS)
            .map_err(|reason| CalibrationError::Fit {
                reason: reason.to_string(),
            })?;

        // width_range is Some: len >= needed >= 1
        let range = table.width_range().unwrap_or((0.0, 0.0));

        Ok(Self {
            coeffs: coeffs.iter().copied().collect(),
            range,
        })
    }

    fn evaluate(&self, width: f64) -> f64 {
        let value = horner(&self.coeffs, width);
        if value.is_finite() {
            value
        } else {
            // High powers of an absurd query width overflowed; the nearest
            // calibrated endpoint is the best finite answer available.
            horner(&self.coeffs, width.clamp(self.range.0, self.range.1))
        }
    }
}

fn horner(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

// ── Piecewise quadratic interpolation ────────────────────────────────────────

/// Local quadratic through consecutive sample triples, exact at samples.
///
/// Queries past either end reuse the nearest end triple, so extrapolation is
/// the natural continuation of the boundary parabola.
#[derive(Debug, Clone)]
pub struct QuadraticInterpolation {
    samples: Vec<CalibrationSample>,
    range: (f64, f64),
}

impl QuadraticInterpolation {
    fn new(table: &CalibrationTable) -> Result<Self, CalibrationError> {
        if table.is_empty() {
            return Err(CalibrationError::InsufficientData { needed: 1, got: 0 });
        }
        let range = table.width_range().unwrap_or((0.0, 0.0));
        Ok(Self {
            samples: table.samples().to_vec(),
            range,
        })
    }

    fn evaluate(&self, width: f64) -> f64 {
        let pts = &self.samples;
        let n = pts.len();

        // Exact pass-through at sampled widths.
        if let Some(hit) = pts.iter().find(|s| s.width == width) {
            return hit.distance;
        }
        match n {
            1 => return pts[0].distance,
            2 => return linear(pts[0], pts[1], width),
            _ => {}
        }

        // Index of the first sample at or past the query, clamped so the
        // three-point stencil stays inside the table; queries past either
        // end land on the boundary triple.
        let i = pts.partition_point(|s| s.width < width);
        let k = i.clamp(1, n - 2);
        let value = lagrange3(pts[k - 1], pts[k], pts[k + 1], width);
        if value.is_finite() {
            value
        } else {
            // Quadratic terms overflow for absurd query widths; the nearest
            // calibrated endpoint is the best finite answer available.
            if width < self.range.0 {
                pts[0].distance
            } else {
                pts[n - 1].distance
            }
        }
    }
}

fn linear(p: CalibrationSample, q: CalibrationSample, x: f64) -> f64 {
    let run = q.width - p.width;
    if run == 0.0 {
        return p.distance;
    }
    p.distance + (q.distance - p.distance) * (x - p.width) / run
}

/// Quadratic through three points in Lagrange form.  A triple collapsed by
/// duplicate widths degrades to the line through its outermost distinct pair,
/// keeping the result finite.
fn lagrange3(p0: CalibrationSample, p1: CalibrationSample, p2: CalibrationSample, x: f64) -> f64 {
    let d01 = p0.width - p1.width;
    let d02 = p0.width - p2.width;
    let d12 = p1.width - p2.width;

    if d01 == 0.0 || d02 == 0.0 || d12 == 0.0 {
        if d02 != 0.0 {
            return linear(p0, p2, x);
        }
        if d01 != 0.0 {
            return linear(p0, p1, x);
        }
        if d12 != 0.0 {
            return linear(p1, p2, x);
        }
        return p1.distance;
    }

    let l0 = (x - p1.width) * (x - p2.width) / (d01 * d02);
    let l1 = (x - p0.width) * (x - p2.width) / (-d01 * d12);
    let l2 = (x - p0.width) * (x - p1.width) / (d02 * d12);
    p0.distance * l0 + p1.distance * l1 + p2.distance * l2
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(width: f64, distance: f64) -> CalibrationSample {
        CalibrationSample { width, distance }
    }

    fn reference_table() -> CalibrationTable {
        CalibrationTable::from_samples(vec![
            sample(50.0, 3.0),
            sample(100.0, 1.5),
            sample(150.0, 1.0),
        ])
    }

    #[test]
    fn empty_table_is_insufficient_for_both_modes() {
        let table = CalibrationTable::from_samples(Vec::new());
        for mode in [FitMode::Polynomial { degree: 2 }, FitMode::Interpolate] {
            let err = DistanceModel::fit(&table, mode).unwrap_err();
            assert!(matches!(err, CalibrationError::InsufficientData { .. }));
        }
    }

    #[test]
    fn polynomial_needs_degree_plus_one_samples() {
        let err = DistanceModel::fit(&reference_table(), FitMode::Polynomial { degree: 5 })
            .unwrap_err();
        match err {
            CalibrationError::InsufficientData { needed, got } => {
                assert_eq!(needed, 6);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn interpolation_passes_through_every_sample() {
        let table = reference_table();
        let model = DistanceModel::fit(&table, FitMode::Interpolate).unwrap();
        for s in table.samples() {
            assert_eq!(model.evaluate(s.width), s.distance);
        }
        // The worked example from the measurement notes.
        assert_eq!(model.evaluate(100.0), 1.5);
    }

    #[test]
    fn polynomial_is_close_but_not_asserted_exact() {
        // Degree 2 on three points is the interpolating quadratic, so the
        // residuals collapse to rounding noise.
        let table = reference_table();
        let model = DistanceModel::fit(&table, FitMode::Polynomial { degree: 2 }).unwrap();
        for s in table.samples() {
            assert!((model.evaluate(s.width) - s.distance).abs() < 1e-6);
        }
    }

    #[test]
    fn evaluation_is_deterministic_bit_for_bit() {
        let model = DistanceModel::fit(&reference_table(), FitMode::Interpolate).unwrap();
        for width in [0.0, 42.5, 100.0, 137.9, 400.0] {
            assert_eq!(
                model.evaluate(width).to_bits(),
                model.evaluate(width).to_bits()
            );
        }
    }

    #[test]
    fn interpolation_is_non_increasing_over_a_decreasing_table() {
        let model = DistanceModel::fit(&reference_table(), FitMode::Interpolate).unwrap();
        let mut prev = model.evaluate(50.0);
        let mut w = 51.0;
        while w <= 150.0 {
            let next = model.evaluate(w);
            assert!(next <= prev + 1e-9, "increase at width {w}: {prev} -> {next}");
            prev = next;
            w += 1.0;
        }
    }

    #[test]
    fn extrapolation_stays_finite() {
        let table = reference_table();
        for mode in [FitMode::Polynomial { degree: 2 }, FitMode::Interpolate] {
            let model = DistanceModel::fit(&table, mode).unwrap();
            for width in [0.0, 1.0, 500.0, 1.0e6, 1.0e300] {
                assert!(model.evaluate(width).is_finite(), "width {width}");
            }
        }
    }

    #[test]
    fn covers_reports_the_calibrated_span() {
        let model = DistanceModel::fit(&reference_table(), FitMode::Interpolate).unwrap();
        assert_eq!(model.calibrated_range(), (50.0, 150.0));
        assert!(model.covers(50.0));
        assert!(model.covers(100.0));
        assert!(model.covers(150.0));
        assert!(!model.covers(49.9));
        assert!(!model.covers(1.0e6));
    }

    #[test]
    fn concurrent_evaluation_does_not_cross_contaminate() {
        let model = DistanceModel::fit(&reference_table(), FitMode::Interpolate).unwrap();
        let widths: Vec<f64> = (0..256).map(|i| 40.0 + i as f64).collect();
        let expected: Vec<u64> = widths.iter().map(|w| model.evaluate(*w).to_bits()).collect();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for (w, want) in widths.iter().zip(&expected) {
                        assert_eq!(model.evaluate(*w).to_bits(), *want);
                    }
                });
            }
        });
    }

    #[test]
    fn two_sample_table_degrades_to_linear() {
        let table = CalibrationTable::from_samples(vec![sample(50.0, 2.0), sample(100.0, 1.0)]);
        let model = DistanceModel::fit(&table, FitMode::Interpolate).unwrap();
        assert_eq!(model.evaluate(75.0), 1.5);
        // Linear continuation past the end, still finite.
        assert_eq!(model.evaluate(150.0), 0.0);
    }

    #[test]
    fn single_sample_table_is_constant() {
        let table = CalibrationTable::from_samples(vec![sample(80.0, 2.0)]);
        let model = DistanceModel::fit(&table, FitMode::Interpolate).unwrap();
        assert_eq!(model.evaluate(10.0), 2.0);
        assert_eq!(model.evaluate(800.0), 2.0);
    }

    #[test]
    fn duplicate_widths_are_tolerated() {
        let table = CalibrationTable::from_samples(vec![
            sample(100.0, 1.0),
            sample(100.0, 2.0),
            sample(150.0, 1.0),
        ]);
        let model = DistanceModel::fit(&table, FitMode::Interpolate).unwrap();
        assert!(model.evaluate(120.0).is_finite());
        assert!(model.evaluate(100.0).is_finite());
    }

    #[test]
    fn strict_parse_rejects_malformed_rows() {
        let err = parse("50,3.0\nnot-a-number,1.5\n", true).unwrap_err();
        match err {
            CalibrationError::Malformed { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("non-numeric"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = parse("50,3.0,extra\n", true).unwrap_err();
        assert!(matches!(err, CalibrationError::Malformed { line: 1, .. }));
    }

    #[test]
    fn permissive_parse_skips_malformed_rows() {
        let samples = parse("50,3.0\nbad row\n100,1.5\n", false).unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn parse_rejects_non_finite_fields() {
        let err = parse("NaN,1.0\n", true).unwrap_err();
        assert!(matches!(err, CalibrationError::Malformed { line: 1, .. }));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let path = std::env::temp_dir().join(format!(
            "facerange-calib-{}.csv",
            std::process::id()
        ));
        std::fs::write(&path, "150, 1.0\n50,3.0\n100,1.5\n").unwrap();
        let table = CalibrationTable::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // Sorted by width ascending on load.
        assert_eq!(table.len(), 3);
        assert_eq!(table.samples()[0].width, 50.0);
        assert_eq!(table.width_range(), Some((50.0, 150.0)));
    }

    #[test]
    fn fit_report_residuals_vanish_for_interpolation() {
        let table = reference_table();
        let model = DistanceModel::fit(&table, FitMode::Interpolate).unwrap();
        let report = model.fit_report(&table);
        assert_eq!(report.rows.len(), 3);
        assert_eq!(report.mean_abs_residual, 0.0);
        assert_eq!(report.max_abs_residual, 0.0);
    }

    #[test]
    fn round_display_keeps_one_decimal() {
        assert_eq!(round_display(1.4999), 1.5);
        assert_eq!(round_display(1.44), 1.4);
        assert_eq!(round_display(0.0), 0.0);
    }
}
