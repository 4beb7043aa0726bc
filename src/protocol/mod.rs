//! Streaming protocol spoken between Source, the unit under test and Sink.
//!
//! Tuples travel either as 20-byte frames of five big-endian `i32`s or as
//! JSON objects concatenated without a delimiter. Control tokens are bare
//! ASCII words in the same byte stream.
//!
//! Neither encoding escapes the tokens. A binary frame whose leading bytes
//! spell `DONE`, or a trailing remainder that happens to, is indistinguishable
//! from the sentinel. The decoders accept that weakness rather than guess.

pub mod binary;
pub mod handshake;
pub mod json;

pub use self::binary::BinaryDecoder;
pub use self::handshake::{expect_token, send_blocking};
pub use self::json::JsonDecoder;

use crate::error::RunResult;
use anyhow::anyhow;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SEND_TUPLES: &[u8] = b"SEND TUPLES!";
pub const DONE: &[u8] = b"DONE";
pub const BACK: &[u8] = b"BACK";
pub const ACK: &[u8] = b"ACK";
pub const TOKEN_LEN: usize = 4;
pub const FRAME_LEN: usize = 20;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TupleFormat {
    #[default]
    Binary,
    Json,
}

impl fmt::Display for TupleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleFormat::Binary => write!(f, "binary"),
            TupleFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for TupleFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(TupleFormat::Binary),
            "json" => Ok(TupleFormat::Json),
            other => Err(anyhow!("unknown tuple format {:?}", other)),
        }
    }
}

/// One data tuple. `a` is the filter value, `b` the sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
    pub e: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl Tuple {
    pub fn from_fields([a, b, c, d, e]: [i32; 5]) -> Self {
        Self {
            a,
            b,
            c,
            d,
            e,
            ts: None,
        }
    }

    pub fn fields(&self) -> [i32; 5] {
        [self.a, self.b, self.c, self.d, self.e]
    }

    /// The operator under test keeps tuples with a positive value.
    pub fn passes_filter(&self) -> bool {
        self.a > 0
    }

    pub fn with_id(mut self, id: i32) -> Self {
        self.b = id;
        self
    }

    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = Some(ts);
        self
    }

    pub fn encode(&self, format: TupleFormat, out: &mut Vec<u8>) {
        match format {
            TupleFormat::Binary => {
                for field in self.fields() {
                    out.put_i32(field);
                }
            }
            TupleFormat::Json => {
                // Serializing five integers and an optional integer cannot fail.
                if let Ok(bytes) = serde_json::to_vec(self) {
                    out.extend_from_slice(&bytes);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Tuple(Tuple),
    Back,
    Done,
}

/// Incremental decoder over an unaligned byte stream.
pub trait FrameDecoder: Send {
    fn feed(&mut self, bytes: &[u8]);
    /// Next complete frame, or `None` until more bytes arrive.
    fn next_frame(&mut self) -> RunResult<Option<Frame>>;
    /// True once `DONE` has been decoded.
    fn is_finished(&self) -> bool;
    /// Undecoded bytes currently held back.
    fn pending(&self) -> usize;
}

/// `require_ts` rejects JSON tuples without a send timestamp.
pub fn decoder(format: TupleFormat, require_ts: bool) -> Box<dyn FrameDecoder> {
    match format {
        TupleFormat::Binary => Box::new(BinaryDecoder::new()),
        TupleFormat::Json => Box::new(JsonDecoder::new(require_ts)),
    }
}
