//! Target programs and measured programs.
//!
//! A target program names sensor signals and gives, per second, a target
//! value and optionally a tolerance. Rows may leave a signal unconstrained;
//! gaps are filled by linear interpolation before execution.

use std::fmt::Write as _;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const TOLERANCE_SUFFIX: &str = ".tol";

/// Finest resampling step for a measured program.
pub const MIN_STEP_SECS: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgramColumn {
    pub signal: String,
    /// One entry per second; `None` leaves the row unconstrained.
    pub values: Vec<Option<f32>>,
    /// Per-second tolerance; the engine default applies when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tolerance: Option<Vec<Option<f32>>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetProgram {
    pub columns: Vec<ProgramColumn>,
}

impl TargetProgram {
    pub fn new(columns: Vec<ProgramColumn>) -> Self {
        Self { columns }
    }

    /// A single signal held at `target` for `secs` seconds.
    pub fn constant(signal: &str, target: f32, tolerance: f32, secs: usize) -> Self {
        Self::new(vec![ProgramColumn {
            signal: signal.to_string(),
            values: vec![Some(target); secs],
            tolerance: Some(vec![Some(tolerance); secs]),
        }])
    }

    pub fn length_secs(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    pub fn signals(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.signal.as_str())
    }

    /// Parse a whitespace or comma separated table. The first non-comment
    /// line names the columns; `<signal>.tol` columns give that signal's
    /// tolerance. `-`, `nan` or a negative number leaves a cell unconstrained.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        let header: Vec<&str> = match lines.next() {
            Some(h) => split_fields(h).collect(),
            None => return Err(EngineError::Program("program has no header".to_string())),
        };

        let mut values: Vec<Vec<Option<f32>>> = vec![Vec::new(); header.len()];
        for (row, line) in lines.enumerate() {
            let fields: Vec<&str> = split_fields(line).collect();
            if fields.len() != header.len() {
                return Err(EngineError::Program(format!(
                    "row {} has {} fields, header has {}",
                    row + 1,
                    fields.len(),
                    header.len()
                )));
            }
            for (col, field) in fields.iter().enumerate() {
                values[col].push(parse_cell(field, header[col], row + 1)?);
            }
        }

        let mut columns: Vec<ProgramColumn> = Vec::new();
        let mut tolerances: Vec<(String, Vec<Option<f32>>)> = Vec::new();
        for (name, vals) in header.iter().zip(values) {
            match name.strip_suffix(TOLERANCE_SUFFIX) {
                Some(signal) => tolerances.push((signal.to_string(), vals)),
                None => {
                    if vals.iter().flatten().any(|v| *v > 1.0) {
                        return Err(EngineError::Program(format!(
                            "signal '{name}' has targets outside [0,1]"
                        )));
                    }
                    columns.push(ProgramColumn {
                        signal: name.to_string(),
                        values: vals,
                        tolerance: None,
                    });
                }
            }
        }
        for (signal, tol) in tolerances {
            let Some(col) = columns.iter_mut().find(|c| c.signal == signal) else {
                return Err(EngineError::Program(format!(
                    "tolerance given for unknown column '{signal}'"
                )));
            };
            if tol.iter().flatten().any(|t| *t <= 0.0) {
                return Err(EngineError::Program(format!(
                    "tolerance for '{signal}' must be positive"
                )));
            }
            col.tolerance = Some(tol);
        }

        let program = Self::new(columns);
        if program.length_secs() == 0 {
            return Err(EngineError::Program("program has no rows".to_string()));
        }
        Ok(program)
    }

    /// Expand into a per-second table over the sensor's signals. Signals the
    /// program does not mention get an infinite tolerance.
    pub fn to_table(
        &self,
        signal_names: &[String],
        default_tolerance: f32,
    ) -> Result<ProgramTable, EngineError> {
        let length = self.length_secs();
        if length == 0 {
            return Err(EngineError::Program("program is empty".to_string()));
        }
        let n = signal_names.len();
        let mut rows = vec![
            TargetRow {
                target: vec![0.0; n],
                tolerance: vec![f32::INFINITY; n],
            };
            length
        ];

        for col in &self.columns {
            let Some(idx) = signal_names.iter().position(|s| *s == col.signal) else {
                return Err(EngineError::Program(format!(
                    "signal '{}' is not provided by the sensor",
                    col.signal
                )));
            };
            let Some(targets) = interpolate(&col.values, length) else {
                continue;
            };
            let tolerance = col
                .tolerance
                .as_ref()
                .and_then(|t| interpolate(t, length))
                .unwrap_or_else(|| vec![default_tolerance; length]);
            for (s, row) in rows.iter_mut().enumerate() {
                row.target[idx] = targets[s].clamp(0.0, 1.0);
                row.tolerance[idx] = tolerance[s].max(1e-6);
            }
        }
        Ok(ProgramTable { rows })
    }
}

fn split_fields(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty())
}

fn parse_cell(field: &str, column: &str, row: usize) -> Result<Option<f32>, EngineError> {
    if field == "-" || field.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let v: f32 = field.parse().map_err(|_| {
        EngineError::Program(format!("row {row}, column '{column}': bad value '{field}'"))
    })?;
    if !v.is_finite() || v < 0.0 {
        return Ok(None);
    }
    Ok(Some(v))
}

/// Fill `None` cells by linear interpolation between the nearest constrained
/// neighbours, holding the first/last value at the ends. Returns `None` when
/// nothing is constrained.
pub fn interpolate(values: &[Option<f32>], length: usize) -> Option<Vec<f32>> {
    let known: Vec<(usize, f32)> = values
        .iter()
        .take(length)
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    let (first, last) = (known.first()?, known.last()?);

    let mut out = Vec::with_capacity(length);
    let mut seg = 0usize;
    for i in 0..length {
        let v = if i <= first.0 {
            first.1
        } else if i >= last.0 {
            last.1
        } else {
            while known[seg + 1].0 < i {
                seg += 1;
            }
            let (i0, v0) = known[seg];
            let (i1, v1) = known[seg + 1];
            v0 + (v1 - v0) * (i - i0) as f32 / (i1 - i0) as f32
        };
        out.push(v);
    }
    Some(out)
}

/// Target and tolerance for every sensor signal at one program second.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub target: Vec<f32>,
    /// `INFINITY` marks a signal the program does not constrain.
    pub tolerance: Vec<f32>,
}

impl TargetRow {
    pub fn is_constrained(&self, signal: usize) -> bool {
        self.tolerance.get(signal).map(|t| t.is_finite()).unwrap_or(false)
    }

    pub fn constrained(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.tolerance.len()).filter(|i| self.is_constrained(*i))
    }

    /// Root-mean-square distance to `current` over the constrained signals.
    pub fn rms_error(&self, current: &[f32]) -> Option<f32> {
        let mut sum = 0.0f32;
        let mut n = 0usize;
        for i in self.constrained() {
            let d = self.target[i] - current.get(i).copied()?;
            sum += d * d;
            n += 1;
        }
        (n > 0).then(|| (sum / n as f32).sqrt())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramTable {
    rows: Vec<TargetRow>,
}

impl ProgramTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, second: usize) -> Option<&TargetRow> {
        self.rows.get(second)
    }
}

/// Readings recorded by `MeasureProgram`, resampled to the requested cadence.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasuredProgram {
    pub signals: Vec<String>,
    pub step_secs: f32,
    /// One row per step; columns follow `signals`.
    pub rows: Vec<Vec<f32>>,
}

impl MeasuredProgram {
    /// Resample whole-second readings (`None` where the sensor was away)
    /// onto `step_secs`, keeping only `columns` of each reading.
    pub fn resample(
        signals: Vec<String>,
        columns: &[usize],
        raw: &[Option<Vec<f32>>],
        length_secs: usize,
        step_secs: f32,
    ) -> Self {
        let step = if step_secs.is_finite() && step_secs > 0.0 {
            step_secs.max(MIN_STEP_SECS)
        } else {
            1.0
        };
        let length = length_secs.min(raw.len());
        let series: Option<Vec<Vec<f32>>> = columns
            .iter()
            .map(|&c| {
                let cells: Vec<Option<f32>> = raw
                    .iter()
                    .map(|r| r.as_ref().and_then(|v| v.get(c).copied()))
                    .collect();
                interpolate(&cells, length)
            })
            .collect();

        let mut rows = Vec::new();
        if let Some(series) = series.filter(|_| length > 0) {
            let steps = ((length as f32) / step).ceil() as usize;
            for k in 0..steps {
                let t = k as f32 * step;
                let i0 = (t.floor() as usize).min(length - 1);
                let i1 = (i0 + 1).min(length - 1);
                let frac = t - i0 as f32;
                rows.push(
                    series
                        .iter()
                        .map(|s| s[i0] + (s[i1] - s[i0]) * frac.clamp(0.0, 1.0))
                        .collect(),
                );
            }
        }
        Self {
            signals,
            step_secs: step,
            rows,
        }
    }

    /// Render as a program file (one row per step).
    pub fn to_text(&self) -> String {
        let mut out = format!("# measured, {}s per row\n{}\n", self.step_secs, self.signals.join(" "));
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
            let _ = writeln!(out, "{}", cells.join(" "));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_columns_tolerances_and_sentinels() {
        let text = "# demo\nalpha, alpha.tol, beta\n0.2 0.5 -\n- 0.5 0.8\n0.6 nan -1\n";
        let p = TargetProgram::parse(text).unwrap();
        assert_eq!(p.length_secs(), 3);
        assert_eq!(p.signals().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(p.columns[0].values, vec![Some(0.2), None, Some(0.6)]);
        assert_eq!(p.columns[1].values, vec![None, Some(0.8), None]);
        assert_eq!(
            p.columns[0].tolerance,
            Some(vec![Some(0.5), Some(0.5), None])
        );
    }

    #[test]
    fn rejects_ragged_rows_and_out_of_range_targets() {
        assert!(TargetProgram::parse("a b\n0.1\n").is_err());
        assert!(TargetProgram::parse("a\n1.5\n").is_err());
        assert!(TargetProgram::parse("a\n0.1 \n x.tol\n").is_err());
        assert!(TargetProgram::parse("").is_err());
        assert!(TargetProgram::parse("a\n").is_err());
    }

    #[test]
    fn interpolation_fills_gaps_and_holds_ends() {
        let v = interpolate(&[None, Some(0.2), None, None, Some(0.8), None], 6).unwrap();
        let expect = [0.2, 0.2, 0.4, 0.6, 0.8, 0.8];
        for (a, b) in v.iter().zip(expect) {
            assert!((a - b).abs() < 1e-6, "{v:?}");
        }
        assert!(interpolate(&[None, None], 2).is_none());
    }

    #[test]
    fn table_leaves_unnamed_signals_unconstrained() {
        let p = TargetProgram::constant("A", 0.9, 1.0, 5);
        let table = p.to_table(&names(&["A", "B"]), 0.3).unwrap();
        assert_eq!(table.len(), 5);
        let row = table.row(4).unwrap();
        assert_eq!(row.target[0], 0.9);
        assert_eq!(row.tolerance[0], 1.0);
        assert!(row.tolerance[1].is_infinite());
        assert_eq!(row.constrained().collect::<Vec<_>>(), vec![0]);
        assert!((row.rms_error(&[0.5, 0.0]).unwrap() - 0.4).abs() < 1e-6);
        assert!(table.row(5).is_none());
    }

    #[test]
    fn default_tolerance_applies_without_tol_column() {
        let p = TargetProgram::parse("B\n0.1\n0.3\n").unwrap();
        let table = p.to_table(&names(&["A", "B"]), 0.25).unwrap();
        assert_eq!(table.row(1).unwrap().tolerance[1], 0.25);
        assert!(!table.row(1).unwrap().is_constrained(0));
    }

    #[test]
    fn unknown_signal_is_an_error() {
        let p = TargetProgram::constant("gamma", 0.5, 1.0, 2);
        let err = p.to_table(&names(&["A"]), 1.0).unwrap_err();
        assert!(err.to_string().contains("gamma"));
    }

    #[test]
    fn measured_program_resamples_and_fills_gaps() {
        let raw = vec![
            Some(vec![0.0, 1.0]),
            None,
            Some(vec![0.4, 0.6]),
            Some(vec![0.6, 0.4]),
        ];
        let m = MeasuredProgram::resample(names(&["B"]), &[1], &raw, 4, 0.5);
        assert_eq!(m.rows.len(), 8);
        assert!((m.rows[0][0] - 1.0).abs() < 1e-6);
        // Second 1 interpolated to 0.8, half-way between it and second 0.
        assert!((m.rows[1][0] - 0.9).abs() < 1e-6);
        assert!((m.rows[2][0] - 0.8).abs() < 1e-6);
        assert!((m.rows[7][0] - 0.4).abs() < 1e-6);

        let text = m.to_text();
        let back = TargetProgram::parse(&text).unwrap();
        assert_eq!(back.length_secs(), 8);
    }

    #[test]
    fn measured_program_without_readings_is_empty() {
        let m = MeasuredProgram::resample(names(&["A"]), &[0], &[None, None], 2, 1.0);
        assert!(m.rows.is_empty());
    }

    #[test]
    fn resample_step_has_a_floor() {
        let raw = vec![Some(vec![0.2]), Some(vec![0.4])];
        let m = MeasuredProgram::resample(names(&["A"]), &[0], &raw, 2, 1e-9);
        assert_eq!(m.step_secs, MIN_STEP_SECS);
        assert!((200..=201).contains(&m.rows.len()), "rows={}", m.rows.len());
    }
}
