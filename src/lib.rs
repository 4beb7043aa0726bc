pub mod bus;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod experiment;
pub mod net;
pub mod protocol;
pub mod sink;
pub mod source;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod uut;

pub use self::error::{ExperimentError, MessageError, RunResult};
