use crate::error::MessageError;
use crate::experiment::{ExperimentConfig, Role, StreamParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_EXPERIMENT: &str = "START_EXPERIMENT";
pub const START_THROUGHPUT: &str = "START_THROUGHPUT";
pub const ABORT_EXPERIMENT: &str = "ABORT_EXPERIMENT";
pub const RESTART_EXPERIMENT: &str = "RESTART_EXPERIMENT";
pub const READY_FOR_RESTART: &str = "READY_FOR_RESTART";
pub const RESPONSE_MEASUREMENTS: &str = "RESPONSE_MEASUREMENTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStart {
    pub test_id: String,
    pub dataset_id: String,
    #[serde(flatten)]
    pub params: StreamParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortExperiment {
    /// `None` aborts whatever is running.
    #[serde(default)]
    pub test_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

impl AbortExperiment {
    pub fn matches(&self, test_id: &str) -> bool {
        self.test_id.as_deref().is_none_or(|id| id == test_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartExperiment {
    pub test_id: String,
    /// The round Source and Sink may start now.
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyForRestart {
    pub test_id: String,
    pub source_or_sink: Role,
    /// The round that just finished.
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeasurements {
    pub test_id: String,
    pub source_or_sink: Role,
    pub measurements: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StartExperiment(ExperimentConfig),
    ThroughputStart(ThroughputStart),
    AbortExperiment(AbortExperiment),
    RestartExperiment(RestartExperiment),
    ReadyForRestart(ReadyForRestart),
    ResponseMeasurements(ResponseMeasurements),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    service_type: String,
    #[serde(default)]
    data: Value,
}

fn decode<T: DeserializeOwned>(service_type: &str, data: Value) -> Result<T, MessageError> {
    serde_json::from_value(data).map_err(|source| MessageError::Malformed {
        service_type: service_type.to_string(),
        source,
    })
}

fn invalid(service_type: &str, reason: impl Into<String>) -> MessageError {
    MessageError::Invalid {
        service_type: service_type.to_string(),
        reason: reason.into(),
    }
}

fn peer_role(service_type: &str, role: Role) -> Result<Role, MessageError> {
    match role {
        Role::Source | Role::Sink => Ok(role),
        Role::Control => Err(invalid(service_type, "source_or_sink must be source or sink")),
    }
}

impl Message {
    pub fn service_type(&self) -> &'static str {
        match self {
            Message::StartExperiment(_) => START_EXPERIMENT,
            Message::ThroughputStart(_) => START_THROUGHPUT,
            Message::AbortExperiment(_) => ABORT_EXPERIMENT,
            Message::RestartExperiment(_) => RESTART_EXPERIMENT,
            Message::ReadyForRestart(_) => READY_FOR_RESTART,
            Message::ResponseMeasurements(_) => RESPONSE_MEASUREMENTS,
        }
    }

    pub fn test_id(&self) -> Option<&str> {
        match self {
            Message::StartExperiment(m) => Some(&m.test_id),
            Message::ThroughputStart(m) => Some(&m.test_id),
            Message::AbortExperiment(m) => m.test_id.as_deref(),
            Message::RestartExperiment(m) => Some(&m.test_id),
            Message::ReadyForRestart(m) => Some(&m.test_id),
            Message::ResponseMeasurements(m) => Some(&m.test_id),
        }
    }

    /// Builds a message from its dispatch attribute and JSON body, checking
    /// that every field is present, well typed and in range.
    pub fn from_parts(service_type: &str, data: Value) -> Result<Self, MessageError> {
        let message = match service_type {
            START_EXPERIMENT => {
                let config: ExperimentConfig = decode(service_type, data)?;
                config
                    .validate()
                    .map_err(|reason| invalid(service_type, reason))?;
                Message::StartExperiment(config)
            }
            START_THROUGHPUT => {
                let start: ThroughputStart = decode(service_type, data)?;
                start
                    .params
                    .validate()
                    .map_err(|reason| invalid(service_type, reason))?;
                Message::ThroughputStart(start)
            }
            ABORT_EXPERIMENT => Message::AbortExperiment(decode(service_type, data)?),
            RESTART_EXPERIMENT => Message::RestartExperiment(decode(service_type, data)?),
            READY_FOR_RESTART => {
                let ready: ReadyForRestart = decode(service_type, data)?;
                peer_role(service_type, ready.source_or_sink)?;
                Message::ReadyForRestart(ready)
            }
            RESPONSE_MEASUREMENTS => {
                let response: ResponseMeasurements = decode(service_type, data)?;
                peer_role(service_type, response.source_or_sink)?;
                Message::ResponseMeasurements(response)
            }
            other => return Err(MessageError::UnknownServiceType(other.to_string())),
        };
        Ok(message)
    }

    pub fn data(&self) -> Value {
        let data = match self {
            Message::StartExperiment(m) => serde_json::to_value(m),
            Message::ThroughputStart(m) => serde_json::to_value(m),
            Message::AbortExperiment(m) => serde_json::to_value(m),
            Message::RestartExperiment(m) => serde_json::to_value(m),
            Message::ReadyForRestart(m) => serde_json::to_value(m),
            Message::ResponseMeasurements(m) => serde_json::to_value(m),
        };
        // Plain data structs with string keys always serialize.
        data.unwrap_or(Value::Null)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            service_type: self.service_type().to_string(),
            data: self.data(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|source| MessageError::Malformed {
                service_type: "<envelope>".to_string(),
                source,
            })?;
        Self::from_parts(&envelope.service_type, envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::sample_config;
    use crate::protocol::TupleFormat;
    use serde_json::json;

    #[test]
    fn test_start_experiment_through_envelope() {
        let message = Message::StartExperiment(sample_config("t1"));
        let bytes = message.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["service_type"], START_EXPERIMENT);
        assert_eq!(value["data"]["tuple_format"], "binary");
        assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_throughput_start_is_flat() {
        let start = ThroughputStart {
            test_id: "t".into(),
            dataset_id: "d".into(),
            params: sample_config("t").stream_params(),
        };
        let data = Message::ThroughputStart(start).data();
        assert_eq!(data["iterations"], 1);
        assert_eq!(data["dataset_id"], "d");
    }

    #[test]
    fn test_unknown_service_type() {
        let err = Message::from_parts("REBOOT", json!({})).unwrap_err();
        assert!(matches!(err, MessageError::UnknownServiceType(s) if s == "REBOOT"));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = Message::from_parts(READY_FOR_RESTART, json!({"test_id": "t", "round": 0}))
            .unwrap_err();
        assert!(matches!(err, MessageError::Malformed { .. }));
    }

    #[test]
    fn test_wrong_type_is_malformed() {
        let err = Message::from_parts(
            RESTART_EXPERIMENT,
            json!({"test_id": "t", "round": "first"}),
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::Malformed { .. }));
    }

    #[test]
    fn test_out_of_range_is_invalid() {
        let mut data = serde_json::to_value(sample_config("t")).unwrap();
        data["sample_rate"] = json!(0);
        let err = Message::from_parts(START_EXPERIMENT, data).unwrap_err();
        assert!(matches!(err, MessageError::Invalid { .. }));

        let err = Message::from_parts(
            RESPONSE_MEASUREMENTS,
            json!({"test_id": "t", "source_or_sink": "control", "measurements": {}}),
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::Invalid { .. }));
    }

    #[test]
    fn test_abort_matching() {
        let all = AbortExperiment {
            test_id: None,
            reason: String::new(),
        };
        assert!(all.matches("anything"));
        let one: AbortExperiment = serde_json::from_value(json!({"test_id": "a"})).unwrap();
        assert!(one.matches("a"));
        assert!(!one.matches("b"));
    }

    #[test]
    fn test_json_format_tag() {
        let mut config = sample_config("t");
        config.tuple_format = TupleFormat::Json;
        let data = Message::StartExperiment(config).data();
        assert_eq!(data["tuple_format"], "json");
    }

    #[test]
    fn test_garbage_envelope() {
        assert!(matches!(
            Message::from_bytes(b"not json"),
            Err(MessageError::Malformed { .. })
        ));
    }
}
