use crate::clock;
use crate::error::ExperimentError;
use crate::stats::{self, PacketStats};
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Debug, Default, Clone, Serialize)]
pub struct SourceRound {
    pub round: u32,
    pub start_timestamp: f64,
    pub start_unix_timestamp: f64,
    pub first_tuple_timestamp: Option<f64>,
    pub last_tuple_timestamp: Option<f64>,
    pub done_timestamp: Option<f64>,
    pub ack_timestamp: Option<f64>,
    pub number_of_tuples_sent: u64,
    pub number_of_tuples_passing_the_filter: u64,
    pub tuples_passing_the_filter_timestamps: Vec<f64>,
    pub tuples_passing_the_filter_ids: Vec<i32>,
    /// `(BACK sent, ACK received)` pairs.
    pub backpressure_timestamps: Vec<(f64, f64)>,
    pub initial_stats: PacketStats,
    pub final_stats: PacketStats,
    pub diff_stats: PacketStats,
}

impl SourceRound {
    pub fn begin(round: u32) -> Self {
        Self {
            round,
            start_timestamp: clock::monotonic(),
            start_unix_timestamp: clock::unix(),
            initial_stats: PacketStats::sample(),
            ..Self::default()
        }
    }

    pub fn finish(&mut self) {
        self.final_stats = PacketStats::sample();
        self.diff_stats = stats::diff(&self.initial_stats, &self.final_stats);
    }

    /// Accounts one tuple that went out on the wire.
    pub fn record_sent(&mut self, id: i32, passes_filter: bool, sample_rate: u32, now: f64) {
        if self.first_tuple_timestamp.is_none() {
            self.first_tuple_timestamp = Some(now);
        }
        self.last_tuple_timestamp = Some(now);
        self.number_of_tuples_sent += 1;
        if passes_filter {
            if self.number_of_tuples_passing_the_filter % u64::from(sample_rate.max(1)) == 0 {
                self.tuples_passing_the_filter_timestamps.push(now);
            }
            self.number_of_tuples_passing_the_filter += 1;
            self.tuples_passing_the_filter_ids.push(id);
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SourceMeasurements {
    pub test_id: String,
    pub error_or_aborted: bool,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub measurements: Vec<SourceRound>,
}

impl SourceMeasurements {
    pub fn new(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            ..Self::default()
        }
    }

    pub fn fail(&mut self, err: &ExperimentError) {
        self.error_or_aborted = true;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
    }

    /// What travels back to Control; the full bundle lives in the store.
    pub fn summary(&self, result_key: &str) -> Value {
        json!({
            "error_or_aborted": self.error_or_aborted,
            "error": self.error,
            "result_key": result_key,
            "rounds": self.measurements.len(),
            "number_of_tuples_sent": self
                .measurements
                .iter()
                .map(|r| r.number_of_tuples_sent)
                .collect::<Vec<_>>(),
            "number_of_tuples_passing_the_filter": self
                .measurements
                .iter()
                .map(|r| r.number_of_tuples_passing_the_filter)
                .collect::<Vec<_>>(),
        })
    }
}
