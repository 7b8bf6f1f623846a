
//! The run-length packet codec shared by the raster formats.
//!
//! A stream is a sequence of packets. Each packet starts with a count byte:
//! bit 7 set means the following single byte repeats `(count & 0x7f) + 1`
//! times, bit 7 clear means the following `count + 1` bytes are literal.
//! A run can never exceed 128 bytes.

use super::{Bytes, ByteVec};
use crate::error::{Error, Result};

/// Longest run a single packet can express.
const MAX_RUN_LENGTH: usize = 128;

/// Flag bit marking a repeat packet.
const REPEAT_FLAG: u8 = 0b1000_0000;

/// Encode the bytes into run-length packets.
///
/// `min_run` is the shortest repetition that is emitted as a repeat packet.
/// The formats disagree on when a repeat pays off: a repeat packet always
/// costs two bytes, but ending and restarting a literal packet costs an
/// extra count byte, so some formats only break a literal run for three or
/// more repetitions.
///
/// The choice of packet boundaries is greedy, not globally optimal,
/// for compatibility with the files other implementations produce.
pub fn encode(data: Bytes<'_>, min_run: usize) -> ByteVec {
    debug_assert!(min_run >= 2, "run of one byte is never worth a packet");

    let mut compressed = Vec::with_capacity(data.len() / 2 + 2);
    let mut index = 0;

    while index < data.len() {
        // measure the run of identical bytes starting here
        let mut run_length = 1;
        while run_length < MAX_RUN_LENGTH
            && index + run_length < data.len()
            && data[index + run_length] == data[index]
        {
            run_length += 1;
        }

        if run_length >= min_run {
            compressed.push(REPEAT_FLAG | (run_length - 1) as u8);
            compressed.push(data[index]);
            index += run_length;
        }
        else {
            // accumulate literal bytes until a worthwhile repeat starts
            let literal_start = index;
            let mut literal_length = 0;

            while literal_length < MAX_RUN_LENGTH && index < data.len() {
                let mut next_run = 1;
                while next_run < min_run
                    && index + next_run < data.len()
                    && data[index + next_run] == data[index]
                {
                    next_run += 1;
                }

                if next_run >= min_run { break; }

                // the whole short repetition becomes part of the literal run
                let consumed = next_run.min(MAX_RUN_LENGTH - literal_length);
                literal_length += consumed;
                index += consumed;
            }

            compressed.push((literal_length - 1) as u8);
            compressed.extend_from_slice(&data[literal_start .. literal_start + literal_length]);
        }
    }

    compressed
}

/// Decode run-length packets into exactly `expected_len` bytes.
///
/// Stops once the expected length is produced, leaving any surplus packet
/// bytes unconsumed. A stream that ends before producing the expected
/// length, or whose last packet would overshoot it, is corrupt.
pub fn decode(mut remaining: Bytes<'_>, expected_len: usize) -> Result<ByteVec> {
    decode_consuming(&mut remaining, expected_len)
}

/// Like `decode`, but advances the slice past the consumed packets.
/// Packet streams are self-delimiting, so several of them can be decoded
/// from one concatenated payload without explicit length fields.
pub fn decode_consuming(remaining: &mut Bytes<'_>, expected_len: usize) -> Result<ByteVec> {
    let mut decompressed = Vec::with_capacity(expected_len);

    while decompressed.len() < expected_len {
        let count = take_1(remaining)?;
        let run_length = (count & !REPEAT_FLAG) as usize + 1;

        if decompressed.len() + run_length > expected_len {
            return Err(Error::corrupt("run-length packet overshoots scan line"));
        }

        if count & REPEAT_FLAG != 0 {
            let value = take_1(remaining)?;
            decompressed.resize(decompressed.len() + run_length, value);
        }
        else {
            let values = take_n(remaining, run_length)?;
            decompressed.extend_from_slice(values);
        }
    }

    Ok(decompressed)
}

fn take_1(slice: &mut Bytes<'_>) -> Result<u8> {
    if let Some((&first, rest)) = slice.split_first() {
        *slice = rest;
        Ok(first)
    }
    else {
        Err(Error::corrupt("run-length data ends too soon"))
    }
}

fn take_n<'s>(slice: &mut Bytes<'s>, n: usize) -> Result<Bytes<'s>> {
    if n <= slice.len() {
        let (front, back) = slice.split_at(n);
        *slice = back;
        Ok(front)
    }
    else {
        Err(Error::corrupt("run-length data ends too soon"))
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(data: &[u8], min_run: usize) {
        let compressed = encode(data, min_run);
        let decompressed = decode(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn mixed_runs(){
        let data = [ 0, 23, 4, 4, 4, 4, 4, 4, 4, 4, 4, 5, 0, 0, 0, 1, 23, 43, 4 ];
        roundtrip(&data, 2);
        roundtrip(&data, 3);
    }

    #[test]
    fn empty_input(){
        assert_eq!(encode(&[], 3), Vec::<u8>::new());
        assert_eq!(decode(&[], 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn long_runs_split_at_max_length(){
        let data = vec![9_u8; 300];
        let compressed = encode(&data, 3);

        // three packets: 128 + 128 + 44
        assert_eq!(compressed, vec![ 0xff, 9,  0xff, 9,  0x80 | 43, 9 ]);
        assert_eq!(decode(&compressed, 300).unwrap(), data);
    }

    #[test]
    fn alternating_bytes_fall_back_to_literal(){
        let data: Vec<u8> = (0..200).map(|index| (index % 2) as u8).collect();
        let compressed = encode(&data, 2);

        // two literal packets, one count byte each
        assert_eq!(compressed.len(), data.len() + 2);
        assert_eq!(decode(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn min_run_controls_break_even(){
        let data = [ 1, 2, 3, 3, 4, 5 ];

        // a double byte pays off at min_run 2 but not at 3
        let eager = encode(&data, 2);
        assert_eq!(eager, vec![ 1, 1, 2,  0x80 | 1, 3,  1, 4, 5 ]);

        let lazy = encode(&data, 3);
        assert_eq!(lazy, vec![ 5, 1, 2, 3, 3, 4, 5 ]);
    }

    #[test]
    fn truncated_stream_is_detected(){
        let compressed = encode(&[7_u8; 50], 3);
        assert!(decode(&compressed[.. compressed.len() - 1], 50).is_err());
        assert!(decode(&[], 1).is_err());
    }

    #[test]
    fn overshooting_packet_is_detected(){
        // a repeat of 128 bytes into a 10 byte line
        let compressed = [ 0xff_u8, 42 ];
        assert!(decode(&compressed, 10).is_err());
    }

    #[test]
    fn decode_stops_exactly_at_expected_length(){
        let mut compressed = encode(&[1_u8, 2, 3, 4], 3);
        compressed.extend_from_slice(&[0xff, 9]); // trailing garbage packet

        let decompressed = decode(&compressed, 4).unwrap();
        assert_eq!(decompressed, &[1, 2, 3, 4]);
    }

    #[test]
    fn consuming_decode_splits_concatenated_streams(){
        let first = [7_u8; 20];
        let second = [1_u8, 2, 3, 4, 5];

        let mut concatenated = encode(&first, 3);
        concatenated.extend_from_slice(&encode(&second, 3));

        let mut remaining = concatenated.as_slice();
        assert_eq!(decode_consuming(&mut remaining, 20).unwrap(), first);
        assert_eq!(decode_consuming(&mut remaining, 5).unwrap(), second);
        assert!(remaining.is_empty());
    }
}
