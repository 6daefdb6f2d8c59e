//! Run configuration
//!
//! [`RunConfig`] selects the grid, the backend and the per-unit scratchpad
//! size of one invocation, plus the tolerance used when float outputs of two
//! runs are compared.
//!
//! # Environment Variables
//!
//! - `NPUFORGE_CORES`: number of cores
//! - `NPUFORGE_THREADS`: threads per core
//! - `NPUFORGE_BACKEND`: "parallel" or "sequential"
//! - `NPUFORGE_SCRATCHPAD_BYTES`: scratchpad capacity per unit

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::config_error;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;
use crate::staging::DEFAULT_SCRATCHPAD_BYTES;

const CORES_ENV: &str = "NPUFORGE_CORES";
const THREADS_ENV: &str = "NPUFORGE_THREADS";
const BACKEND_ENV: &str = "NPUFORGE_BACKEND";
const SCRATCHPAD_ENV: &str = "NPUFORGE_SCRATCHPAD_BYTES";

/// Upper bound on `cores * threads`; every unit is an OS thread
pub const MAX_UNITS: usize = 4096;

/// Relative tolerance for float comparisons
pub const DEFAULT_TOLERANCE: f32 = 1e-5;

/// Backend implementation selected at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Parallel,
    Sequential,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Parallel => "parallel",
            BackendKind::Sequential => "sequential",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = NpuForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parallel" | "threaded" => Ok(BackendKind::Parallel),
            "sequential" | "reference" => Ok(BackendKind::Sequential),
            _ => Err(NpuForgeError::UnknownName {
                kind: "backend",
                name: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub cores: usize,
    pub threads: usize,
    pub backend: BackendKind,
    pub scratchpad_bytes: usize,
    pub tolerance: f32,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            cores: 1,
            threads: 1,
            backend: BackendKind::default(),
            scratchpad_bytes: DEFAULT_SCRATCHPAD_BYTES,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grid(mut self, cores: usize, threads: usize) -> Self {
        self.cores = cores;
        self.threads = threads;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_scratchpad_bytes(mut self, bytes: usize) -> Self {
        self.scratchpad_bytes = bytes;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Defaults overridden by the `NPUFORGE_*` environment
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(cores) = env_parse::<usize>(CORES_ENV) {
            config.cores = cores;
        }
        if let Some(threads) = env_parse::<usize>(THREADS_ENV) {
            config.threads = threads;
        }
        if let Some(backend) = env_parse::<BackendKind>(BACKEND_ENV) {
            config.backend = backend;
        }
        if let Some(bytes) = env_parse::<usize>(SCRATCHPAD_ENV) {
            config.scratchpad_bytes = bytes;
        }
        config
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.cores == 0 || self.threads == 0 {
            return Err(config_error!(
                "grid needs at least one core and one thread, got {}x{}",
                self.cores,
                self.threads
            ));
        }
        let units = self.cores.checked_mul(self.threads).unwrap_or(usize::MAX);
        if units > MAX_UNITS {
            return Err(config_error!(
                "{}x{} grid has {} units, at most {} are supported",
                self.cores,
                self.threads,
                units,
                MAX_UNITS
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(config_error!("tolerance must be a non-negative number"));
        }
        Ok(())
    }

    pub fn grid(&self) -> ForgeResult<Grid> {
        Grid::new(self.cores, self.threads)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
