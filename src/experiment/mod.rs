pub mod barrier;
pub mod run;
pub mod slot;

pub use self::barrier::RestartBarrier;
pub use self::run::{
    RoleRun, catch_panic, drain_stream_topic, report_measurements, unwind_on_error,
};
pub use self::slot::{ExperimentSlot, SlotGuard};

use crate::protocol::TupleFormat;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Control,
    Source,
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Control => write!(f, "control"),
            Role::Source => write!(f, "source"),
            Role::Sink => write!(f, "sink"),
        }
    }
}

impl Role {
    /// Key the role's measurement bundle is stored under.
    pub fn result_key(&self, test_id: &str) -> String {
        format!("{}_{}", self, test_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Unikraft,
    Mirage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Filter,
    Map,
    Average,
    Identity,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framework::Unikraft => write!(f, "unikraft"),
            Framework::Mirage => write!(f, "mirage"),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Filter => write!(f, "filter"),
            Operator::Map => write!(f, "map"),
            Operator::Average => write!(f, "average"),
            Operator::Identity => write!(f, "identity"),
        }
    }
}

/// `<framework>-<operator>[-suffix]`, e.g. `unikraft-filter-json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub framework: Framework,
    pub operator: Operator,
    pub suffix: Option<String>,
}

impl FromStr for ImageName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        let framework = match parts.next() {
            Some("unikraft") => Framework::Unikraft,
            Some("mirage") => Framework::Mirage,
            _ => return Err(anyhow!("image {:?} names no known framework", s)),
        };
        let operator = match parts.next() {
            Some("filter") => Operator::Filter,
            Some("map") => Operator::Map,
            Some("average") => Operator::Average,
            Some("identity") => Operator::Identity,
            _ => return Err(anyhow!("image {:?} names no known operator", s)),
        };
        let suffix = match parts.next() {
            None => None,
            Some(suffix)
                if !suffix.is_empty()
                    && suffix.chars().all(|c| c.is_alphanumeric() || c == '_') =>
            {
                Some(suffix.to_string())
            }
            Some(suffix) => return Err(anyhow!("bad image suffix {:?}", suffix)),
        };
        Ok(Self {
            framework,
            operator,
            suffix,
        })
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.framework, self.operator)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{}", suffix)?;
        }
        Ok(())
    }
}

fn default_batch_size() -> u32 {
    1
}

/// Parameters of one experiment, fixed at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub test_id: String,
    pub image_name: String,
    pub dataset_id: String,
    #[serde(default)]
    pub evaluation_id: Option<String>,
    /// Initial inter-tuple delay in seconds.
    pub delay: f64,
    pub ramp_factor: f64,
    pub iterations: u32,
    pub sample_rate: u32,
    pub restarts: u32,
    pub tuple_format: TupleFormat,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    pub control_address: String,
    pub control_port: u16,
    pub source_address: String,
    pub source_port: u16,
    pub sink_address: String,
    pub sink_port: u16,
    #[serde(default)]
    pub force_rebuild: bool,
}

impl ExperimentConfig {
    pub fn image(&self) -> Result<ImageName> {
        self.image_name.parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.test_id.is_empty() {
            return Err("test_id is empty".into());
        }
        if self.dataset_id.is_empty() {
            return Err("dataset_id is empty".into());
        }
        self.stream_params().validate()?;
        self.image().map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            iterations: self.iterations,
            delay: self.delay,
            ramp_factor: self.ramp_factor,
            sample_rate: self.sample_rate,
            restarts: self.restarts,
            tuple_format: self.tuple_format,
            batch_size: self.batch_size,
        }
    }

    pub fn rounds(&self) -> u32 {
        self.restarts.saturating_add(1)
    }
}

/// The part of the configuration Source and Sink need to stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    pub iterations: u32,
    pub delay: f64,
    pub ramp_factor: f64,
    pub sample_rate: u32,
    pub restarts: u32,
    pub tuple_format: TupleFormat,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl StreamParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.iterations < 1 {
            return Err("iterations must be at least 1".into());
        }
        if self.sample_rate < 1 {
            return Err("sample_rate must be at least 1".into());
        }
        if self.batch_size < 1 {
            return Err("batch_size must be at least 1".into());
        }
        if !(self.ramp_factor > 0.0) {
            return Err(format!("ramp_factor must be positive, got {}", self.ramp_factor));
        }
        if !(self.delay >= 0.0) || !self.delay.is_finite() {
            return Err(format!("delay must be finite and not negative, got {}", self.delay));
        }
        if !self.ramp_factor.is_finite() {
            return Err(format!("ramp_factor must be finite, got {}", self.ramp_factor));
        }
        if self.restarts.checked_add(1).is_none() {
            return Err(format!("restarts out of range, got {}", self.restarts));
        }
        Ok(())
    }

    pub fn rounds(&self) -> u32 {
        self.restarts.saturating_add(1)
    }
}

#[cfg(test)]
pub(crate) fn sample_config(test_id: &str) -> ExperimentConfig {
    ExperimentConfig {
        test_id: test_id.to_string(),
        image_name: "unikraft-filter".to_string(),
        dataset_id: "ds".to_string(),
        evaluation_id: None,
        delay: 0.0,
        ramp_factor: 1.0,
        iterations: 1,
        sample_rate: 1,
        restarts: 0,
        tuple_format: TupleFormat::Binary,
        batch_size: 1,
        control_address: "127.0.0.1".to_string(),
        control_port: 8081,
        source_address: "127.0.0.1".to_string(),
        source_port: 8082,
        sink_address: "127.0.0.1".to_string(),
        sink_port: 8083,
        force_rebuild: false,
    }
}
