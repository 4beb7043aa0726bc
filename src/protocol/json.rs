use super::{BACK, DONE, Frame, FrameDecoder, TOKEN_LEN, Tuple};
use crate::error::{ExperimentError, RunResult};
use serde_json::Deserializer;

/// Decodes concatenated JSON tuples. Bytes that do not yet form a whole
/// object are carried over to the next read.
#[derive(Debug, Default)]
pub struct JsonDecoder {
    overflow: Vec<u8>,
    pos: usize,
    require_ts: bool,
    finished: bool,
}

impl JsonDecoder {
    pub fn new(require_ts: bool) -> Self {
        Self {
            require_ts,
            ..Self::default()
        }
    }

    fn rest(&self) -> &[u8] {
        &self.overflow[self.pos..]
    }
}

impl FrameDecoder for JsonDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        if self.finished {
            return;
        }
        if self.pos > 0 {
            self.overflow.drain(..self.pos);
            self.pos = 0;
        }
        self.overflow.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> RunResult<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        let skip = self
            .rest()
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.pos += skip;

        let rest = self.rest();
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.starts_with(DONE) {
            self.pos += TOKEN_LEN;
            self.finished = true;
            return Ok(Some(Frame::Done));
        }
        if rest.starts_with(BACK) {
            self.pos += TOKEN_LEN;
            return Ok(Some(Frame::Back));
        }
        if rest.len() < TOKEN_LEN && (DONE.starts_with(rest) || BACK.starts_with(rest)) {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut stream = Deserializer::from_slice(rest).into_iter::<Tuple>();
            let next = stream.next();
            (next, stream.byte_offset())
        };
        match next {
            Some(Ok(tuple)) => {
                if self.require_ts && tuple.ts.is_none() {
                    return Err(ExperimentError::protocol(format!(
                        "tuple {} carries no ts",
                        tuple.b
                    )));
                }
                self.pos += consumed;
                Ok(Some(Frame::Tuple(tuple)))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(ExperimentError::protocol(format!(
                "undecodable json tuple: {}",
                e
            ))),
            None => Ok(None),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn pending(&self) -> usize {
        self.overflow.len() - self.pos
    }
}
