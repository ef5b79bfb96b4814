use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::prelude::*;

pub const DEFAULT_MAX_MEM: u64 = 2_000_000_000;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_TASK_OVERHEAD: u64 = 1024;
pub const DEFAULT_MAX_RECHUNK_STAGES: usize = 8;

/// Settings of a single run.
///
/// `max_mem` is a per-task ceiling: every task the scheduler dispatches is projected to
/// need at most this many bytes (including `task_overhead`). It is not a global limit
/// on concurrent memory use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub max_mem: u64,
    pub min_mem: u64,
    pub retries: u32,
    pub work_dir: Option<PathBuf>,
    pub task_overhead: u64,
    pub max_rechunk_stages: usize,
    pub optimize: bool,
    /// Skip nodes whose output chunks are all in the store already.
    pub resume: bool,
    /// Let the thread pool executor launch backup copies of straggling tasks.
    pub use_backups: bool,
    pub deadline: Option<Duration>,
    pub trace_file: Option<PathBuf>,
    pub num_threads: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_mem: DEFAULT_MAX_MEM,
            min_mem: 0,
            retries: DEFAULT_RETRIES,
            work_dir: None,
            task_overhead: DEFAULT_TASK_OVERHEAD,
            max_rechunk_stages: DEFAULT_MAX_RECHUNK_STAGES,
            optimize: true,
            resume: false,
            use_backups: false,
            deadline: None,
            trace_file: None,
            num_threads: 0,
        }
    }
}

impl RunConfig {
    pub fn new(max_mem: u64) -> Self {
        Self {
            max_mem,
            ..default()
        }
    }

    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(v) = parse_env("STRATUS_MAX_MEM", parse_bytes) {
            out.max_mem = v;
        }

        if let Some(v) = parse_env("STRATUS_MIN_MEM", parse_bytes) {
            out.min_mem = v;
        }

        if let Some(v) = parse_env("STRATUS_TASK_OVERHEAD", parse_bytes) {
            out.task_overhead = v;
        }

        if let Some(v) = parse_env("STRATUS_RETRIES", parse_value) {
            out.retries = v;
        }

        if let Some(v) = parse_env("STRATUS_MAX_STAGES", parse_value) {
            out.max_rechunk_stages = v;
        }

        if let Some(v) = parse_env("STRATUS_NUM_THREADS", parse_value) {
            out.num_threads = v;
        }

        if let Some(v) = parse_env("STRATUS_OPTIMIZE", parse_flag) {
            out.optimize = v;
        }

        if let Some(v) = parse_env("STRATUS_RESUME", parse_flag) {
            out.resume = v;
        }

        if let Some(v) = parse_env("STRATUS_USE_BACKUPS", parse_flag) {
            out.use_backups = v;
        }

        if let Some(secs) = parse_env("STRATUS_DEADLINE_SECS", parse_value::<f64>) {
            if secs.is_finite() && secs > 0.0 {
                out.deadline = Some(Duration::from_secs_f64(secs));
            } else {
                warn!("ignoring non-positive deadline {}", secs);
            }
        }

        if let Ok(dir) = env::var("STRATUS_WORK_DIR") {
            let dir = dir.trim();

            if !dir.is_empty() {
                out.work_dir = Some(dir.into());
            }
        }

        if let Ok(filename) = env::var("STRATUS_TRACE") {
            let filename = filename.trim();

            if !filename.is_empty() {
                info!("writing trace to {:?}", filename);
                out.trace_file = Some(filename.into());
            }
        }

        out
    }

    pub fn with_min_mem(mut self, min_mem: u64) -> Self {
        self.min_mem = min_mem;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_task_overhead(mut self, task_overhead: u64) -> Self {
        self.task_overhead = task_overhead;
        self
    }

    pub fn with_max_rechunk_stages(mut self, max_stages: usize) -> Self {
        self.max_rechunk_stages = max_stages;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_backups(mut self, use_backups: bool) -> Self {
        self.use_backups = use_backups;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_trace_file(mut self, trace_file: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(trace_file.into());
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn validate(&self) -> Result {
        if self.max_mem == 0 {
            return Err(Error::InvalidConfig("max_mem must be positive".into()));
        }

        if self.min_mem > self.max_mem {
            return Err(Error::InvalidConfig(format!(
                "min_mem ({}) exceeds max_mem ({})",
                self.min_mem, self.max_mem
            )));
        }

        if self.task_overhead >= self.max_mem {
            return Err(Error::InvalidConfig(format!(
                "task overhead ({}) leaves no room within max_mem ({})",
                self.task_overhead, self.max_mem
            )));
        }

        if self.max_rechunk_stages == 0 {
            return Err(Error::InvalidConfig(
                "at least one rechunk stage must be allowed".into(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T, F>(key: &str, parse: F) -> Option<T>
where
    F: FnOnce(&str) -> Result<T, String>,
{
    let value = env::var(key).ok()?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    match parse(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring invalid value {:?} for {}: {}", value, key, e);
            None
        }
    }
}

fn parse_value<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| e.to_string())
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match &*value.to_ascii_lowercase() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        s => Err(format!("expected a boolean, found {:?}", s)),
    }
}

/// Parses a byte count such as `"20000"`, `"500 KB"`, `"2GB"` or `"1.5GiB"`.
pub fn parse_bytes(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or_else(|| value.len());
    let (number, unit) = value.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid number in {:?}", value))?;

    let multiplier: u64 = match &*unit.trim().to_ascii_lowercase() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        u => return Err(format!("unknown unit {:?}", u)),
    };

    Ok((number * multiplier as f64).round() as u64)
}
