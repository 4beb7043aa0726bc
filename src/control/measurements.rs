use super::provision::Image;
use super::state::ControlState;
use crate::clock;
use crate::error::ExperimentError;
use crate::experiment::ExperimentConfig;
use crate::net::Beacon;
use crate::stats::{self, PacketStats};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ControlRound {
    pub round: u32,
    pub was_reset: bool,
    pub start_timestamp: f64,
    pub start_unix_timestamp: f64,
    pub boot_request_timestamp: Option<f64>,
    pub boot_packet_timestamp: Option<f64>,
    pub boot_packet_unix_timestamp: Option<f64>,
    pub serial_log: Option<String>,
    pub initial_stats: PacketStats,
    pub final_stats: PacketStats,
    pub diff_stats: PacketStats,
}

impl ControlRound {
    pub fn begin(round: u32, was_reset: bool) -> Self {
        Self {
            round,
            was_reset,
            start_timestamp: clock::monotonic(),
            start_unix_timestamp: clock::unix(),
            initial_stats: PacketStats::sample(),
            ..Self::default()
        }
    }

    pub fn boot_requested(&mut self) {
        self.boot_request_timestamp = Some(clock::monotonic());
    }

    pub fn booted(&mut self, beacon: &Beacon) {
        self.boot_packet_timestamp = Some(beacon.timestamp);
        self.boot_packet_unix_timestamp = Some(beacon.unix_timestamp);
    }

    pub fn finish(&mut self) {
        self.final_stats = PacketStats::sample();
        self.diff_stats = stats::diff(&self.initial_stats, &self.final_stats);
    }
}

/// Persisted as `control_<test_id>`.
#[derive(Debug, Clone, Serialize)]
pub struct ControlMeasurements {
    pub test_id: String,
    pub outcome: ControlState,
    pub error_or_aborted: bool,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub image_name: String,
    pub image: Option<Image>,
    pub configuration: ExperimentConfig,
    pub measurements: Vec<ControlRound>,
    pub source: Option<Value>,
    pub sink: Option<Value>,
}

impl ControlMeasurements {
    pub fn new(config: &ExperimentConfig) -> Self {
        Self {
            test_id: config.test_id.clone(),
            outcome: ControlState::Provisioning,
            error_or_aborted: false,
            error: None,
            error_kind: None,
            image_name: config.image_name.clone(),
            image: None,
            configuration: config.clone(),
            measurements: Vec::new(),
            source: None,
            sink: None,
        }
    }

    pub fn start_round(&mut self, round: u32, was_reset: bool) -> &mut ControlRound {
        self.measurements.push(ControlRound::begin(round, was_reset));
        // just pushed
        let last = self.measurements.len() - 1;
        &mut self.measurements[last]
    }

    pub fn current(&mut self) -> Option<&mut ControlRound> {
        self.measurements.last_mut()
    }

    pub fn fail(&mut self, err: &ExperimentError) {
        self.error_or_aborted = true;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
    }

    /// Folds in what Source and Sink reported. A role that reported an
    /// error marks the whole experiment.
    pub fn attach_responses(&mut self, source: Option<Value>, sink: Option<Value>) {
        for response in [&source, &sink].into_iter().flatten() {
            if response["error_or_aborted"].as_bool() == Some(true) {
                self.error_or_aborted = true;
            }
        }
        self.source = source;
        self.sink = sink;
    }
}
