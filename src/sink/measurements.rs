use crate::clock;
use crate::error::ExperimentError;
use crate::protocol::Tuple;
use crate::stats::{self, PacketStats};
use serde::Serialize;
use serde_json::{Value, json};

/// Why a sink round stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    Done,
    Stalled,
    Closed,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SinkRound {
    pub round: u32,
    pub start_timestamp: f64,
    pub start_unix_timestamp: f64,
    pub first_tuple_timestamp: Option<f64>,
    pub done_timestamp: Option<f64>,
    pub terminated_by: Option<Termination>,
    pub number_of_tuples_recv: u64,
    pub tuples_received_timestamps: Vec<f64>,
    /// Send timestamps stamped by the unit, JSON mode only.
    pub tuples_processing_timestamps: Vec<i64>,
    pub initial_stats: PacketStats,
    pub final_stats: PacketStats,
    pub diff_stats: PacketStats,
}

impl SinkRound {
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

    pub fn record_recv(&mut self, tuple: &Tuple, sample_rate: u32, now: f64) {
        if self.first_tuple_timestamp.is_none() {
            self.first_tuple_timestamp = Some(now);
        }
        if self.number_of_tuples_recv % u64::from(sample_rate.max(1)) == 0 {
            self.tuples_received_timestamps.push(now);
            if let Some(ts) = tuple.ts {
                self.tuples_processing_timestamps.push(ts);
            }
        }
        self.number_of_tuples_recv += 1;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SinkMeasurements {
    pub test_id: String,
    pub error_or_aborted: bool,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub measurements: Vec<SinkRound>,
}

impl SinkMeasurements {
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

    pub fn summary(&self, result_key: &str) -> Value {
        json!({
            "error_or_aborted": self.error_or_aborted,
            "error": self.error,
            "result_key": result_key,
            "rounds": self.measurements.len(),
            "number_of_tuples_recv": self
                .measurements
                .iter()
                .map(|r| r.number_of_tuples_recv)
                .collect::<Vec<_>>(),
            "terminated_by": self
                .measurements
                .iter()
                .map(|r| r.terminated_by)
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_timestamps_sampled() {
        let mut round = SinkRound::default();
        for i in 0..6 {
            let tuple = Tuple::from_fields([1, i, 0, 0, 0]).with_ts(100 + i as i64);
            round.record_recv(&tuple, 3, i as f64);
        }
        assert_eq!(round.number_of_tuples_recv, 6);
        assert_eq!(round.tuples_received_timestamps, vec![0.0, 3.0]);
        assert_eq!(round.tuples_processing_timestamps, vec![100, 103]);
    }

    #[test]
    fn test_summary_lists_termination() {
        let mut m = SinkMeasurements::new("t");
        m.measurements.push(SinkRound {
            terminated_by: Some(Termination::Stalled),
            ..SinkRound::default()
        });
        assert_eq!(m.summary("sink_t")["terminated_by"][0], "stalled");
    }
}
