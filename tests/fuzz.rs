
//! Randomized testing: run-length streams, compression methods,
//! and corrupted-file behavior.

extern crate pixio;

use std::io::Cursor;

use pixio::prelude::*;
use pixio::compress::rle;
use pixio::block::samples::interleaved_slices;
use pixio::format::rla::{RlaInput, RlaOutput, HEADER_SIZE};

use rand::Rng;

#[test]
fn rle_roundtrips_arbitrary_bytes() {
    let mut random = rand::rng();

    for _attempt in 0 .. 200 {
        let length = random.random_range(0 .. 600_usize);

        // vary the redundancy so both packet kinds are exercised
        let modulus = random.random_range(1 .. 16_u32);
        let data: Vec<u8> = (0 .. length)
            .map(|_| (random.random::<u32>() % modulus) as u8)
            .collect();

        for min_run in [2, 3] {
            let encoded = rle::encode(&data, min_run);
            let decoded = rle::decode(&encoded, data.len()).unwrap();
            assert_eq!(decoded, data);
        }
    }
}

#[test]
fn rle_decode_never_panics_on_garbage() {
    let mut random = rand::rng();

    for _attempt in 0 .. 500 {
        let length = random.random_range(0 .. 64_usize);
        let garbage: Vec<u8> = (0 .. length).map(|_| random.random()).collect();
        let expected = random.random_range(0 .. 256_usize);

        // must either decode to the exact length or report corruption
        if let Ok(decoded) = rle::decode(&garbage, expected) {
            assert_eq!(decoded.len(), expected);
        }
    }
}

#[test]
fn compression_methods_roundtrip_random_data() {
    let mut random = rand::rng();

    let methods = [
        Compression::Uncompressed, Compression::Rle,
        Compression::Zip1, Compression::Zip16,
    ];

    for _attempt in 0 .. 50 {
        let length = random.random_range(1 .. 2048_usize);
        let modulus = random.random_range(1 .. 64_u32);
        let data: Vec<u8> = (0 .. length)
            .map(|_| (random.random::<u32>() % modulus) as u8)
            .collect();

        for &method in &methods {
            let compressed = method.compress_bytes(data.clone()).unwrap();
            let decompressed = method.decompress_bytes(compressed, data.len()).unwrap();
            assert_eq!(decompressed, data, "{} failed", method);
        }
    }
}

/// Build an rla file in memory, return its bytes and the pixel data.
fn write_rla(size: Vec2<usize>) -> (Vec<u8>, Vec<u8>) {
    let channels = ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("R", SampleType::U8),
        ChannelDescription::new("G", SampleType::U8),
        ChannelDescription::new("B", SampleType::U8),
    ]);

    let header = Header::new(size, channels)
        .with_encoding(Compression::Rle, Blocks::ScanLines, LineOrder::Decreasing);

    let pixel_bytes: Vec<u8> = (0 .. size.area() * 3).map(|index| ((index * 13) % 251) as u8).collect();

    let mut file_bytes = Cursor::new(Vec::new());
    {
        let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
        let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(
            vec![Text::from("R"), Text::from("G"), Text::from("B")], SampleType::U8, size.width(),
        ));

        output.write_pixels(0 .. size.height(), &source).unwrap();
        output.close().unwrap();
    }

    (file_bytes.into_inner(), pixel_bytes)
}

#[test]
fn corrupting_one_chunk_leaves_the_others_readable() {
    let size = Vec2(24, 16);
    let (mut file_bytes, pixel_bytes) = write_rla(size);

    // locate the record of one scan line in the middle via the offset table
    let corrupt_line = 7_usize; // file line index, bottom-up
    let table_entry = HEADER_SIZE + corrupt_line * 4;
    let record_offset = u32::from_be_bytes([
        file_bytes[table_entry], file_bytes[table_entry + 1],
        file_bytes[table_entry + 2], file_bytes[table_entry + 3],
    ]) as usize;

    // corrupt the first plane's size prefix so the record cannot decode
    file_bytes[record_offset] = 0xff;
    file_bytes[record_offset + 1] = 0xff;

    let mut input = RlaInput::read(Cursor::new(file_bytes), ReadOptions::default()).unwrap();

    let mut decoded = vec![0_u8; pixel_bytes.len()];
    let result = {
        let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(
            vec![Text::from("R"), Text::from("G"), Text::from("B")], SampleType::U8, size.width(),
        ));

        input.read_pixels(0 .. size.height(), &mut target)
    };

    // the damaged line surfaces as an error for the whole call
    assert!(result.is_err(), "corruption must be reported");

    // every line except the damaged one matches a clean read byte for byte
    let visual_corrupt_line = size.height() - 1 - corrupt_line;
    let row_bytes = size.width() * 3;

    for y in 0 .. size.height() {
        if y == visual_corrupt_line { continue; }

        assert_eq!(
            &decoded[y * row_bytes .. (y + 1) * row_bytes],
            &pixel_bytes[y * row_bytes .. (y + 1) * row_bytes],
            "undamaged line {} must decode correctly", y
        );
    }
}

#[test]
fn truncated_files_error_instead_of_panicking() {
    let (file_bytes, _) = write_rla(Vec2(16, 8));

    for length in (0 .. file_bytes.len()).step_by(41) {
        let truncated = file_bytes[.. length].to_vec();

        // either opening or reading fails, but never a panic
        if let Ok(mut input) = RlaInput::read(Cursor::new(truncated), ReadOptions::default()) {
            let mut decoded = vec![0_u8; 16 * 8 * 3];
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(
                vec![Text::from("R"), Text::from("G"), Text::from("B")], SampleType::U8, 16,
            ));

            let _ = input.read_pixels(0 .. 8, &mut target);
        }
    }
}

#[test]
fn random_container_files_roundtrip_with_random_geometry() {
    use pixio::format::exr::{ExrInput, ExrOutput};

    let mut random = rand::rng();

    for _attempt in 0 .. 10 {
        let size = Vec2(
            random.random_range(1 .. 40_usize),
            random.random_range(1 .. 40_usize),
        );

        let compression = [Compression::Uncompressed, Compression::Rle, Compression::Zip1, Compression::Zip16]
            [random.random_range(0 .. 4_usize)];

        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("L", SampleType::F16),
        ]);

        let header = Header::new(size, channels)
            .with_encoding(compression, Blocks::ScanLines, LineOrder::Increasing);

        let values: Vec<u8> = (0 .. size.area() * 2).map(|_| random.random()).collect();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = ExrOutput::create(
                &mut file_bytes, smallvec::smallvec![header], WriteOptions::default(),
            ).unwrap();

            let source = FrameBuffer::new(&values, interleaved_slices(
                vec![Text::from("L")], SampleType::F16, size.width(),
            ));

            output.write_pixels(0 .. size.height(), &source).unwrap();
            output.close().unwrap();
        }

        file_bytes.set_position(0);
        let mut input = ExrInput::read(file_bytes, ReadOptions::default()).unwrap();

        let mut decoded = vec![0_u8; values.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(
                vec![Text::from("L")], SampleType::F16, size.width(),
            ));

            input.read_pixels(0 .. size.height(), &mut target).unwrap();
        }

        assert_eq!(decoded, values, "{} with size {:?} failed", compression, size);
    }
}
