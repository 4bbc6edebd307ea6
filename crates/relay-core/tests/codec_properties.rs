//! Property tests for the two universal guarantees `spec.md` §8 makes about
//! the codec: a full round trip preserves `(span, type, args)` exactly, and
//! a partial prefix of an encoded message is reported as "need more bytes"
//! with no effect on the decoder until the rest of the bytes arrive.

use proptest::prelude::*;
use relay_core::codec::{Decoder, encode};

fn arb_args() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9]{0,12}", 0..6)
}

proptest! {
    #[test]
    fn round_trip_preserves_span_type_and_args(
        span in any::<u64>(),
        message_type in any::<u64>(),
        args in arb_args(),
    ) {
        let bytes = encode(span, message_type, &args).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        let message = decoder.decode_next().unwrap().expect("a full frame decodes in one call");

        prop_assert_eq!(message.span(), span);
        prop_assert_eq!(message.message_type(), message_type);
        prop_assert_eq!(message.arg_count(), args.len());
        for (i, expected) in args.iter().enumerate() {
            let got: String = message.arg(i).unwrap();
            prop_assert_eq!(&got, expected);
        }
        // No remaining bytes: a second call sees an empty buffer, not a
        // leftover partial frame.
        prop_assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn partial_prefix_reports_need_more_bytes_without_side_effects(
        span in any::<u64>(),
        message_type in any::<u64>(),
        args in arb_args(),
        cut_fraction in 0u32..100,
    ) {
        let bytes = encode(span, message_type, &args).unwrap();
        prop_assume!(bytes.len() > 1);
        let cut = ((bytes.len() - 1) as u32 * cut_fraction / 100) as usize;

        let mut decoder = Decoder::new();
        decoder.feed(&bytes[..cut]);
        // However the prefix is cut, the decoder must ask for more rather
        // than error or fabricate a message.
        prop_assert!(decoder.decode_next().unwrap().is_none());
        prop_assert!(decoder.decode_next().unwrap().is_none());

        decoder.feed(&bytes[cut..]);
        let message = decoder.decode_next().unwrap().expect("resumes cleanly once the rest arrives");
        prop_assert_eq!(message.span(), span);
        prop_assert_eq!(message.message_type(), message_type);
    }
}
