
//! Deep data: sample count tables, payload consistency, raw chunk access.

extern crate pixio;

use std::io::Cursor;

use pixio::prelude::*;
use pixio::block::deep::{self, DeepChannelData};
use pixio::format::exr::{ExrInput, ExrOutput};

use rand::Rng;

fn deep_channels() -> ChannelList {
    ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("A", SampleType::F16),
        ChannelDescription::new("Z", SampleType::F32),
        ChannelDescription::new("id", SampleType::U32),
    ])
}

fn deep_header(size: Vec2<usize>, compression: Compression) -> Header {
    Header::new(size, deep_channels())
        .with_encoding(compression, Blocks::ScanLines, LineOrder::Increasing)
        .with_deep_data()
}

fn filled_buffer(channels: &ChannelList, size: Vec2<usize>, counts: &[u32]) -> DeepFrameBuffer {
    let mut buffer = DeepFrameBuffer::allocate(channels, size, counts).unwrap();
    let total: usize = counts.iter().sum::<u32>() as usize;

    buffer.channels[0] = DeepChannelData::F16(
        (0 .. total).map(|index| f16::from_f32((index % 64) as f32 / 64.0)).collect()
    );
    buffer.channels[1] = DeepChannelData::F32(
        (0 .. total).map(|index| index as f32 * 0.25 + 1.0).collect()
    );
    buffer.channels[2] = DeepChannelData::U32(
        (0 .. total).map(|index| index as u32 * 3).collect()
    );

    buffer
}

fn write_deep_to_memory(header: &Header, buffer: &DeepFrameBuffer) -> Vec<u8> {
    let mut file_bytes = Cursor::new(Vec::new());

    let mut output = ExrOutput::create(
        &mut file_bytes, smallvec::smallvec![header.clone()], WriteOptions::default(),
    ).unwrap();

    output.write_deep_pixels(0 .. header.data_size().height(), buffer).unwrap();
    output.close().unwrap();

    file_bytes.into_inner()
}

#[test]
fn random_sample_count_distributions_roundtrip() {
    let mut random = rand::rng();
    let channels = deep_channels();

    for &compression in &[Compression::Uncompressed, Compression::Rle, Compression::Zip1] {
        for _attempt in 0 .. 10 {
            let size = Vec2(random.random_range(1 .. 24_usize), random.random_range(1 .. 12_usize));

            let counts: Vec<u32> = (0 .. size.area())
                .map(|_| random.random_range(0 .. 9_u32))
                .collect();

            let header = deep_header(size, compression);
            let source = filled_buffer(&channels, size, &counts);
            let bytes = write_deep_to_memory(&header, &source);

            let mut input = ExrInput::read(Cursor::new(bytes), ReadOptions::default()).unwrap();

            let mut decoded_counts = vec![0_u32; size.area()];
            input.read_pixel_sample_counts(0 .. size.height(), &mut decoded_counts).unwrap();
            assert_eq!(decoded_counts, counts);

            let mut target = DeepFrameBuffer::allocate(&channels, size, &decoded_counts).unwrap();
            input.read_deep_pixels(0 .. size.height(), &mut target).unwrap();
            assert_eq!(target, source);
        }
    }
}

#[test]
fn all_zero_counts_roundtrip() {
    let channels = deep_channels();
    let size = Vec2(9, 4);
    let counts = vec![0_u32; size.area()];

    let header = deep_header(size, Compression::Rle);
    let source = filled_buffer(&channels, size, &counts);
    let bytes = write_deep_to_memory(&header, &source);

    let mut input = ExrInput::read(Cursor::new(bytes), ReadOptions::default()).unwrap();
    assert_eq!(input.header().max_samples_per_pixel, Some(0));

    let mut decoded_counts = vec![7_u32; size.area()];
    input.read_pixel_sample_counts(0 .. size.height(), &mut decoded_counts).unwrap();
    assert!(decoded_counts.iter().all(|&count| count == 0));

    let mut target = DeepFrameBuffer::allocate(&channels, size, &decoded_counts).unwrap();
    input.read_deep_pixels(0 .. size.height(), &mut target).unwrap();
    assert!(target.channels.iter().all(DeepChannelData::is_empty));
}

#[test]
fn payload_size_equals_count_sum_times_sample_size_per_chunk() {
    // decode every chunk of a written file and check the structural equation:
    // sum(counts) * bytes_per_deep_pixel == decompressed payload size
    let channels = deep_channels();
    let size = Vec2(16, 8);
    let counts: Vec<u32> = (0 .. size.area()).map(|index| (index % 7) as u32).collect();

    let header = deep_header(size, Compression::Zip1);
    let source = filled_buffer(&channels, size, &counts);
    let bytes = write_deep_to_memory(&header, &source);

    let mut input = ExrInput::read(Cursor::new(bytes), ReadOptions::default()).unwrap();

    let bytes_per_deep_pixel: u64 = channels.list.iter()
        .map(|channel| channel.sample_type.bytes_per_sample() as u64)
        .sum();

    // one chunk per scan line with this compression
    for line in 0 .. size.height() {
        let line_counts = &counts[line * size.width() .. (line + 1) * size.width()];
        let line_samples: u64 = line_counts.iter().map(|&count| count as u64).sum();

        let mut decoded = vec![0_u32; size.width()];
        input.read_pixel_sample_counts(line .. line + 1, &mut decoded).unwrap();
        assert_eq!(decoded, line_counts);

        let mut target = DeepFrameBuffer::allocate(&channels, Vec2(size.width(), 1), &decoded).unwrap();
        input.read_deep_pixels(line .. line + 1, &mut target).unwrap();

        let stored_bytes: u64 = target.channels.iter()
            .map(|channel| (channel.len() * channel.sample_type().bytes_per_sample()) as u64)
            .sum();

        assert_eq!(stored_bytes, line_samples * bytes_per_deep_pixel);
    }
}

#[test]
fn near_maximum_counts_are_rejected_at_write_time() {
    // a single scan line whose cumulative count overflows a signed 32-bit
    // integer cannot be represented in the table encoding
    let counts = [ u32::MAX / 2, u32::MAX / 2, 1 ];

    assert!(matches!(
        deep::compress_sample_count_table(Compression::Uncompressed, &counts, 3, 1),
        Err(Error::NotSupported(_))
    ));

    // one line below the limit is fine structurally
    let counts = [ 1000_u32, 2000, 3000 ];
    deep::compress_sample_count_table(Compression::Uncompressed, &counts, 3, 1).unwrap();
}

#[test]
fn raw_chunk_data_is_a_two_phase_copy() {
    let channels = deep_channels();
    let size = Vec2(6, 3);
    let counts: Vec<u32> = (0 .. size.area()).map(|index| (index % 3) as u32).collect();

    let header = deep_header(size, Compression::Rle);
    let source = filled_buffer(&channels, size, &counts);
    let bytes = write_deep_to_memory(&header, &source);

    let mut input = ExrInput::read(Cursor::new(bytes), ReadOptions::default()).unwrap();

    // phase one: query the size with an empty buffer
    let required = input.raw_chunk_data(0, &mut []).unwrap();
    assert!(required > 0);

    // a too-small buffer reports the size without writing anything
    let mut too_small = vec![0xaa_u8; required - 1];
    assert_eq!(input.raw_chunk_data(0, &mut too_small).unwrap(), required);
    assert!(too_small.iter().all(|&byte| byte == 0xaa));

    // phase two: fill a large enough buffer
    let mut raw = vec![0_u8; required];
    assert_eq!(input.raw_chunk_data(0, &mut raw).unwrap(), required);

    // the verbatim chunk starts with its scan line coordinate
    let y = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    assert_eq!(y, 0);
}

#[test]
fn incomplete_deep_file_reads_written_chunks_only() {
    let channels = deep_channels();
    let size = Vec2(5, 4);
    let counts: Vec<u32> = vec![1; size.area()];

    let header = deep_header(size, Compression::Rle);

    let mut file_bytes = Cursor::new(Vec::new());
    {
        let mut output = ExrOutput::create(
            &mut file_bytes, smallvec::smallvec![header], WriteOptions::default(),
        ).unwrap();

        // write only the first two of four scan lines, then close
        let partial_counts = counts[.. 2 * size.width()].to_vec();
        let partial = filled_buffer(&channels, Vec2(size.width(), 2), &partial_counts);

        output.write_deep_pixels(0 .. 2, &partial).unwrap();
        output.close().unwrap();
    }

    file_bytes.set_position(0);
    let mut input = ExrInput::read(file_bytes, ReadOptions::default()).unwrap();
    assert!(!input.is_complete());

    // the written range works
    let mut decoded_counts = vec![0_u32; 2 * size.width()];
    input.read_pixel_sample_counts(0 .. 2, &mut decoded_counts).unwrap();

    // the unwritten range reports the incompleteness
    let mut missing_counts = vec![0_u32; 2 * size.width()];
    assert!(matches!(
        input.read_pixel_sample_counts(2 .. 4, &mut missing_counts),
        Err(Error::IncompleteFile(_))
    ));
}
