use proptest::prelude::*;
use testbench::protocol::{self, BACK, DONE, Frame, FrameDecoder, Tuple, TupleFormat};

fn frame_tuple() -> impl Strategy<Value = Tuple> {
    let token = |t: &[u8]| i32::from_be_bytes([t[0], t[1], t[2], t[3]]);
    let (done, back) = (token(DONE), token(BACK));
    // a leading field equal to a token is the known ambiguity of the binary format
    any::<[i32; 5]>()
        .prop_filter("collides with a control token", move |f| f[0] != done && f[0] != back)
        .prop_map(Tuple::from_fields)
}

fn decode_in_chunks(
    dec: &mut dyn FrameDecoder,
    stream: &[u8],
    cuts: &[usize],
) -> Vec<Frame> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
    bounds.push(stream.len());
    bounds.sort_unstable();
    for end in bounds {
        dec.feed(&stream[start..end]);
        start = end;
        while let Some(frame) = dec.next_frame().unwrap() {
            out.push(frame);
        }
    }
    out
}

proptest! {
    #[test]
    fn binary_stream_survives_any_split(
        tuples in proptest::collection::vec(frame_tuple(), 0..20),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut stream = Vec::new();
        for t in &tuples {
            t.encode(TupleFormat::Binary, &mut stream);
        }
        stream.extend_from_slice(DONE);

        let mut dec = protocol::decoder(TupleFormat::Binary, false);
        let frames = decode_in_chunks(dec.as_mut(), &stream, &cuts);
        let mut expected: Vec<Frame> = tuples.into_iter().map(Frame::Tuple).collect();
        expected.push(Frame::Done);
        prop_assert_eq!(frames, expected);
        prop_assert!(dec.is_finished());
        prop_assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn json_stream_survives_any_split(
        fields in proptest::collection::vec(any::<[i32; 5]>(), 1..10),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
        back_at in any::<usize>(),
    ) {
        let tuples: Vec<Tuple> = fields
            .into_iter()
            .enumerate()
            .map(|(i, f)| Tuple::from_fields(f).with_ts(1_700_000_000_000 + i as i64))
            .collect();
        let back_at = back_at % tuples.len();
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for (i, t) in tuples.iter().enumerate() {
            t.encode(TupleFormat::Json, &mut stream);
            expected.push(Frame::Tuple(*t));
            if i == back_at {
                stream.extend_from_slice(BACK);
                expected.push(Frame::Back);
            }
        }
        stream.extend_from_slice(DONE);
        expected.push(Frame::Done);

        let mut dec = protocol::decoder(TupleFormat::Json, true);
        let frames = decode_in_chunks(dec.as_mut(), &stream, &cuts);
        prop_assert_eq!(frames, expected);
        prop_assert!(dec.is_finished());
    }
}

#[test]
fn json_split_at_every_byte() {
    let mut stream = Vec::new();
    for i in 0..3 {
        Tuple::from_fields([i - 1, i, 7, -8, 9])
            .with_ts(42 + i as i64)
            .encode(TupleFormat::Json, &mut stream);
    }
    stream.extend_from_slice(DONE);

    for cut in 0..=stream.len() {
        let mut dec = protocol::decoder(TupleFormat::Json, true);
        let frames = decode_in_chunks(dec.as_mut(), &stream, &[cut]);
        assert_eq!(frames.len(), 4, "split at {}", cut);
        assert_eq!(frames[3], Frame::Done);
        assert_eq!(frames[1], Frame::Tuple(Tuple::from_fields([0, 1, 7, -8, 9]).with_ts(43)));
    }
}

#[test]
fn json_without_ts_is_rejected_when_required() {
    let mut dec = protocol::decoder(TupleFormat::Json, true);
    dec.feed(br#"{"a":1,"b":2,"c":3,"d":4,"e":5}"#);
    assert!(dec.next_frame().is_err());
}

#[test]
fn binary_bytes_after_done_are_ignored() {
    let mut dec = protocol::decoder(TupleFormat::Binary, false);
    dec.feed(DONE);
    assert_eq!(dec.next_frame().unwrap(), Some(Frame::Done));
    dec.feed(&[0u8; 20]);
    assert_eq!(dec.next_frame().unwrap(), None);
}
