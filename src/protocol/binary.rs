use super::{BACK, DONE, FRAME_LEN, Frame, FrameDecoder, TOKEN_LEN, Tuple};
use crate::error::RunResult;
use bytes::{Buf, BytesMut};

/// Reassembles 20-byte frames. A misaligned remainder of exactly four bytes
/// is checked against the control tokens.
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    buf: BytesMut,
    finished: bool,
}

impl BinaryDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for BinaryDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        if !self.finished {
            self.buf.extend_from_slice(bytes);
        }
    }

    fn next_frame(&mut self) -> RunResult<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        if self.buf.len() >= FRAME_LEN {
            let mut frame = self.buf.split_to(FRAME_LEN);
            let fields = [
                frame.get_i32(),
                frame.get_i32(),
                frame.get_i32(),
                frame.get_i32(),
                frame.get_i32(),
            ];
            return Ok(Some(Frame::Tuple(Tuple::from_fields(fields))));
        }
        if self.buf.len() == TOKEN_LEN {
            if &self.buf[..] == DONE {
                self.buf.clear();
                self.finished = true;
                return Ok(Some(Frame::Done));
            }
            if &self.buf[..] == BACK {
                self.buf.clear();
                return Ok(Some(Frame::Back));
            }
        }
        Ok(None)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TupleFormat;

    fn frames(n: i32) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..n {
            Tuple::from_fields([i + 1, i, 0, 0, 0]).encode(TupleFormat::Binary, &mut out);
        }
        out
    }

    fn drain(dec: &mut BinaryDecoder) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(f) = dec.next_frame().unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_three_frames_then_done_in_one_read() {
        let mut bytes = frames(3);
        bytes.extend_from_slice(DONE);
        let mut dec = BinaryDecoder::new();
        dec.feed(&bytes);
        let out = drain(&mut dec);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], Frame::Done);
        assert!(dec.is_finished());
    }

    #[test]
    fn test_done_alone() {
        let mut dec = BinaryDecoder::new();
        dec.feed(&frames(2));
        assert_eq!(drain(&mut dec).len(), 2);
        dec.feed(DONE);
        assert_eq!(drain(&mut dec), vec![Frame::Done]);
    }

    #[test]
    fn test_done_split_across_reads() {
        let mut bytes = frames(2);
        bytes.extend_from_slice(b"DO");
        let mut dec = BinaryDecoder::new();
        dec.feed(&bytes);
        assert_eq!(drain(&mut dec).len(), 2);
        assert_eq!(dec.pending(), 2);
        dec.feed(b"NE");
        assert_eq!(drain(&mut dec), vec![Frame::Done]);
        // detected exactly once
        dec.feed(DONE);
        assert!(drain(&mut dec).is_empty());
    }

    #[test]
    fn test_frame_split_mid_field() {
        let bytes = frames(1);
        let mut dec = BinaryDecoder::new();
        dec.feed(&bytes[..7]);
        assert!(drain(&mut dec).is_empty());
        dec.feed(&bytes[7..]);
        assert_eq!(
            drain(&mut dec),
            vec![Frame::Tuple(Tuple::from_fields([1, 0, 0, 0, 0]))]
        );
    }

    #[test]
    fn test_back_between_frames() {
        let mut dec = BinaryDecoder::new();
        let mut bytes = frames(1);
        bytes.extend_from_slice(BACK);
        dec.feed(&bytes);
        let out = drain(&mut dec);
        assert_eq!(out[1], Frame::Back);
        assert!(!dec.is_finished());
        dec.feed(&frames(1));
        assert_eq!(drain(&mut dec).len(), 1);
    }
}
