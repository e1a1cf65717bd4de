//! Optional instrumentation of job command lines.
//!
//! An [`Instrument`] contributes an argument prefix (for example
//! `/usr/bin/time -f ...`) and knows how to read back the trailer that
//! prefix leaves at the end of stderr. [`PerformanceRecorder`] stacks the
//! enabled instruments and turns a finished job's stderr into one
//! [`PerformanceSample`] row. Scheduling code never looks inside either.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::InstrumentConfig;

/// Where a wrapped command line will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// Spawned directly, one argv element per argument.
    Local,
    /// Joined with spaces into a bash submission script.
    Script,
}

/// One value in a performance row.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Field {
    /// Parse a counter value: integer, else float, else missing.
    pub fn parse_counter(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            Field::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            Field::Float(v)
        } else {
            Field::Missing
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{}", v),
            Field::Float(v) => write!(f, "{:.5}", v),
            Field::Text(s) => write!(f, "{}", s),
            Field::Missing => write!(f, "N/A"),
        }
    }
}

/// A named column of a performance row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: Field,
}

/// An instrumentation strategy: argument prefix plus trailer parser.
pub trait Instrument: Send + Sync + fmt::Debug {
    /// Short name used in row labels (`time`, `perf`).
    fn label(&self) -> &'static str;

    fn prefix(&self, context: ExecContext) -> Vec<String>;

    /// Upper bound on the stderr lines this instrument's trailer occupies.
    fn trailer_lines(&self) -> usize;

    /// Consume this instrument's trailer from the end of `lines`.
    fn parse_trailer(&self, lines: &mut Vec<String>) -> Vec<Column>;
}

const TIME_COLUMNS: [&str; 5] = ["Usr", "Sys", "Elpsd", "CPU", "Mem"];

/// GNU `time` emitting user, system, elapsed, CPU% and max RSS.
#[derive(Debug, Clone)]
pub struct TimeWrapper {
    binary: PathBuf,
}

impl TimeWrapper {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl Instrument for TimeWrapper {
    fn label(&self) -> &'static str {
        "time"
    }

    fn prefix(&self, context: ExecContext) -> Vec<String> {
        match context {
            ExecContext::Local => vec![
                self.binary.display().to_string(),
                "-f".to_string(),
                "%U\t%S\t%E\t%P\t%M".to_string(),
            ],
            ExecContext::Script => vec![
                format!("${{TIME_BINARY:={}}}", self.binary.display()),
                "-f".to_string(),
                "\"%U\\t%S\\t%E\\t%P\\t%M\"".to_string(),
            ],
        }
    }

    fn trailer_lines(&self) -> usize {
        3
    }

    fn parse_trailer(&self, lines: &mut Vec<String>) -> Vec<Column> {
        let mut values: Vec<Field> = lines
            .pop()
            .map(|line| {
                line.split('\t')
                    .map(|v| Field::Text(v.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        values.resize(TIME_COLUMNS.len(), Field::Missing);

        TIME_COLUMNS
            .iter()
            .zip(values)
            .map(|(name, value)| Column {
                name: name.to_string(),
                value,
            })
            .collect()
    }
}

/// `perf stat` in machine-readable mode, one `value<TAB>label` line per counter.
#[derive(Debug, Clone)]
pub struct PerfStatWrapper {
    binary: PathBuf,
    counter_lines: usize,
}

impl PerfStatWrapper {
    pub fn new(binary: PathBuf, counter_lines: usize) -> Self {
        Self {
            binary,
            counter_lines,
        }
    }
}

impl Instrument for PerfStatWrapper {
    fn label(&self) -> &'static str {
        "perf"
    }

    fn prefix(&self, context: ExecContext) -> Vec<String> {
        let (binary, separator) = match context {
            ExecContext::Local => (self.binary.display().to_string(), "\t".to_string()),
            ExecContext::Script => (
                format!("${{PERF_BINARY:={}}}", self.binary.display()),
                "$'\\t'".to_string(),
            ),
        };
        vec![
            binary,
            "stat".to_string(),
            "-x".to_string(),
            separator,
            "--log-fd".to_string(),
            "2".to_string(),
        ]
    }

    fn trailer_lines(&self) -> usize {
        self.counter_lines
    }

    fn parse_trailer(&self, lines: &mut Vec<String>) -> Vec<Column> {
        let counters = lines
            .iter()
            .rev()
            .take(self.counter_lines)
            .take_while(|line| line.contains('\t'))
            .count();
        let block = lines.split_off(lines.len() - counters);

        block
            .iter()
            .map(|line| {
                let tokens: Vec<&str> = line.split('\t').collect();
                let name = tokens
                    .iter()
                    .skip(1)
                    .find(|t| !t.trim().is_empty())
                    .map(|t| t.trim().to_string())
                    .unwrap_or_default();
                Column {
                    name,
                    value: Field::parse_counter(tokens[0]),
                }
            })
            .collect()
    }
}

/// One job's machine-parsable performance row.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSample {
    pub label: String,
    pub tag: String,
    /// Job start as seconds since the Unix epoch.
    pub started_at: f64,
    pub columns: Vec<Column>,
}

impl PerformanceSample {
    pub fn header(&self) -> String {
        let mut header = format!("{}_header\tJob\tt0", self.label);
        for column in &self.columns {
            header.push('\t');
            header.push_str(&column.name);
        }
        header
    }

    pub fn row(&self) -> String {
        let mut row = format!("{}_line\t{}\t{:.5}", self.label, self.tag, self.started_at);
        for column in &self.columns {
            row.push('\t');
            row.push_str(&column.value.to_string());
        }
        row
    }
}

/// Stack of enabled instruments, outermost first.
#[derive(Debug, Clone, Default)]
pub struct PerformanceRecorder {
    instruments: Vec<Arc<dyn Instrument>>,
}

impl PerformanceRecorder {
    pub fn new(instruments: Vec<Arc<dyn Instrument>>) -> Self {
        Self { instruments }
    }

    pub fn from_config(config: &InstrumentConfig) -> Self {
        let mut instruments: Vec<Arc<dyn Instrument>> = Vec::new();
        if config.time {
            instruments.push(Arc::new(TimeWrapper::new(config.time_binary.clone())));
        }
        if config.perf {
            instruments.push(Arc::new(PerfStatWrapper::new(
                config.perf_binary.clone(),
                config.perf_counter_lines,
            )));
        }
        Self { instruments }
    }

    pub fn is_enabled(&self) -> bool {
        !self.instruments.is_empty()
    }

    /// `args` preceded by every enabled instrument's prefix.
    pub fn wrap(&self, args: &[String], context: ExecContext) -> Vec<String> {
        let mut wrapped: Vec<String> = self
            .instruments
            .iter()
            .flat_map(|i| i.prefix(context))
            .collect();
        wrapped.extend_from_slice(args);
        wrapped
    }

    /// Row label: `time`, `time_perf`, and so on.
    fn label(&self) -> String {
        if self.instruments.is_empty() {
            return "time".to_string();
        }
        self.instruments
            .iter()
            .map(|i| i.label())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Build a performance row from the tail of a finished job's stderr.
    pub fn sample(&self, tag: &str, started_at: f64, stderr: Option<&str>) -> PerformanceSample {
        let tail_len: usize = self.instruments.iter().map(|i| i.trailer_lines()).sum();

        let mut lines: Vec<String> = match stderr {
            Some(text) => {
                let all: Vec<String> = text
                    .lines()
                    .map(|l| l.trim().replace('"', ""))
                    .filter(|l| !l.is_empty())
                    .collect();
                let start = all.len().saturating_sub(tail_len);
                all[start..].to_vec()
            }
            None => Vec::new(),
        };

        // The outermost wrapper exits last, so its trailer is at the very end.
        let columns = self
            .instruments
            .iter()
            .flat_map(|i| i.parse_trailer(&mut lines))
            .collect();

        PerformanceSample {
            label: self.label(),
            tag: tag.to_string(),
            started_at,
            columns,
        }
    }
}
