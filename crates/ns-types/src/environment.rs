use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{ConfigError, NsResult};

/// Compute device a model is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Device {
    Cpu { index: usize },
    Gpu { index: usize },
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu { index } => write!(f, "/cpu:{index}"),
            Device::Gpu { index } => write!(f, "/gpu:{index}"),
        }
    }
}

/// First CPU.
pub fn default_device() -> Device {
    Device::Cpu { index: 0 }
}

/// Execution descriptor a trial runs under.
///
/// The environment only references `data_dir`; whoever created the
/// directory owns its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Parallelism degree for numeric work.
    pub n_jobs: usize,
    pub data_dir: PathBuf,
    pub devices: Vec<Device>,
}

impl Environment {
    /// CPU-only environment with `n_jobs` worker threads.
    pub fn cpu(n_jobs: usize, data_dir: impl AsRef<Path>) -> NsResult<Self> {
        let env = Self {
            n_jobs,
            data_dir: data_dir.as_ref().to_path_buf(),
            devices: vec![default_device()],
        };
        env.validate()?;
        Ok(env)
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn validate(&self) -> NsResult<()> {
        if self.n_jobs == 0 {
            return Err(ConfigError::InvalidExperiment {
                message: "environment n_jobs must be positive".to_string(),
            }
            .into());
        }
        if self.devices.is_empty() {
            return Err(ConfigError::InvalidExperiment {
                message: "environment has no devices".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// First device of the environment.
    pub fn primary_device(&self) -> Device {
        self.devices.first().copied().unwrap_or_else(default_device)
    }
}
