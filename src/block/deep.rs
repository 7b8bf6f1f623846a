
//! The deep-data chunk engine.
//!
//! Deep images store a variable number of samples per pixel. Each deep chunk
//! carries two records: a sample count table, and the sample payload. The
//! payload cannot be addressed without the table, because every per-pixel
//! byte offset is a prefix sum over the counts of all preceding pixels in
//! the chunk. The table therefore always decodes first.
//!
//! On disk, the table stores one cumulative count per pixel column,
//! restarting at zero on each scan line of the chunk:
//!
//! ```text
//! per-pixel counts:  [2, 1, 3]  [0, 2, 1]
//! stored table:      [2, 3, 6,   0, 2, 3]
//! ```
//!
//! The payload groups the values of one channel together: for each channel,
//! for each pixel of the chunk in row-major order, that pixel's samples are
//! contiguous, as little endian bytes.

use half::f16;

use crate::math::Vec2;
use crate::meta::attribute::{ChannelList, SampleType};
use crate::compress::{self, rle, zip, Bytes, ByteVec, Compression};
use crate::io::{Data, Write};
use crate::error::{Error, Result, UnitResult};


/// Decode a chunk's sample count table into per-pixel counts,
/// in row-major chunk order.
///
/// The stored table is cumulative per scan line; a line whose cumulative
/// counts decrease is corrupt. Tables whose stored size equals the raw
/// size were stored uncompressed.
pub fn decompress_sample_count_table(
    compression: Compression,
    compressed_table: Bytes<'_>,
    width: usize, line_count: usize,
) -> Result<Vec<u32>>
{
    let raw_byte_size = width * line_count * i32::BYTE_SIZE;

    let table_bytes = if compressed_table.len() == raw_byte_size {
        compressed_table.to_vec()
    }
    else {
        decompress_table_bytes(compression, compressed_table, raw_byte_size)?
    };

    if table_bytes.len() != raw_byte_size {
        return Err(Error::corrupt("sample count table size mismatch"));
    }

    let mut counts = Vec::with_capacity(width * line_count);
    let mut remaining = table_bytes.as_slice();

    for _line in 0 .. line_count {
        let mut previous_cumulative = 0_i32;

        for _x in 0 .. width {
            let cumulative = i32::read_le(&mut remaining)?;

            if cumulative < previous_cumulative {
                return Err(Error::corrupt("sample count table is not monotonic"));
            }

            counts.push((cumulative - previous_cumulative) as u32);
            previous_cumulative = cumulative;
        }
    }

    Ok(counts)
}

/// Encode per-pixel counts into a chunk's cumulative sample count table,
/// compressed if that is smaller than the raw table.
///
/// Fails if the counts of one scan line sum to more than `i32::MAX`,
/// which the cumulative on-disk encoding cannot express.
pub fn compress_sample_count_table(
    compression: Compression,
    counts: &[u32],
    width: usize, line_count: usize,
) -> Result<ByteVec>
{
    debug_assert_eq!(counts.len(), width * line_count, "sample count table size bug");

    let mut table_bytes = Vec::with_capacity(counts.len() * i32::BYTE_SIZE);

    for line in 0 .. line_count {
        let mut cumulative = 0_i64;

        for x in 0 .. width {
            cumulative += counts[line * width + x] as i64;

            if cumulative > i32::MAX as i64 {
                return Err(Error::unsupported("scan line sample count exceeding integer maximum"));
            }

            (cumulative as i32).write_le(&mut table_bytes)?;
        }
    }

    let compressed = compress_table_bytes(compression, &table_bytes);
    if compressed.len() < table_bytes.len() { Ok(compressed) } else { Ok(table_bytes) }
}

// the table codecs skip the byte shuffling used for pixel payloads,
// as cumulative counts are already monotonically increasing integers
fn compress_table_bytes(compression: Compression, bytes: Bytes<'_>) -> ByteVec {
    match compression {
        Compression::Uncompressed => bytes.to_vec(),
        Compression::Rle => rle::encode(bytes, 3),
        Compression::Zip1 | Compression::Zip16 => zip::compress(bytes),
    }
}

fn decompress_table_bytes(compression: Compression, bytes: Bytes<'_>, expected_size: usize) -> Result<ByteVec> {
    match compression {
        Compression::Uncompressed => Err(Error::corrupt("sample count table size mismatch")),
        Compression::Rle => rle::decode(bytes, expected_size),
        Compression::Zip1 | Compression::Zip16 => zip::decompress(bytes, expected_size),
    }
}


/// Per-pixel sample start indices derived from a count table by prefix sum.
/// Contains one more entry than there are pixels; the samples of pixel `p`
/// occupy the index range `offsets[p] .. offsets[p + 1]`.
pub fn pixel_offsets(counts: &[u32]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut sum = 0_u64;

    offsets.push(0);
    for &count in counts {
        sum += count as u64;
        offsets.push(sum);
    }

    offsets
}

/// Total number of samples described by a count table.
pub fn total_samples(counts: &[u32]) -> u64 {
    counts.iter().map(|&count| count as u64).sum()
}


/// The decoded samples of one channel, as a flat array
/// indexed through the pixel offset table.
#[derive(Debug, Clone, PartialEq)]
pub enum DeepChannelData {

    /// Samples of a 16-bit float channel.
    F16(Vec<f16>),

    /// Samples of a 32-bit float channel.
    F32(Vec<f32>),

    /// Samples of a 32-bit unsigned integer channel.
    U32(Vec<u32>),
}

impl DeepChannelData {

    /// Allocate zeroed storage for the specified number of samples.
    pub fn allocate(sample_type: SampleType, sample_count: usize) -> Result<Self> {
        match sample_type {
            SampleType::F16 => Ok(DeepChannelData::F16(vec![f16::ZERO; sample_count])),
            SampleType::F32 => Ok(DeepChannelData::F32(vec![0.0; sample_count])),
            SampleType::U32 => Ok(DeepChannelData::U32(vec![0; sample_count])),
            SampleType::U8 | SampleType::U16 =>
                Err(Error::unsupported("integer channel type in deep data")),
        }
    }

    /// Number of samples in this channel.
    pub fn len(&self) -> usize {
        match self {
            DeepChannelData::F16(samples) => samples.len(),
            DeepChannelData::F32(samples) => samples.len(),
            DeepChannelData::U32(samples) => samples.len(),
        }
    }

    /// Whether this channel contains no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The storage type of this channel.
    pub fn sample_type(&self) -> SampleType {
        match self {
            DeepChannelData::F16(_) => SampleType::F16,
            DeepChannelData::F32(_) => SampleType::F32,
            DeepChannelData::U32(_) => SampleType::U32,
        }
    }

    /// Copy the sample range `source_range` of `source` into this channel
    /// starting at `target_start`. Both channels must have the same type.
    fn copy_range_from(&mut self, source: &DeepChannelData, source_range: std::ops::Range<usize>, target_start: usize) {
        match (self, source) {
            (DeepChannelData::F16(target), DeepChannelData::F16(source)) =>
                target[target_start .. target_start + source_range.len()].copy_from_slice(&source[source_range]),

            (DeepChannelData::F32(target), DeepChannelData::F32(source)) =>
                target[target_start .. target_start + source_range.len()].copy_from_slice(&source[source_range]),

            (DeepChannelData::U32(target), DeepChannelData::U32(source)) =>
                target[target_start .. target_start + source_range.len()].copy_from_slice(&source[source_range]),

            _ => panic!("deep channel type mismatch bug"),
        }
    }
}


/// Decode a deep chunk payload into one flat array per channel.
/// The byte size of the payload must agree exactly with the count table.
pub fn unpack_deep_samples(bytes: Bytes<'_>, channels: &ChannelList, counts: &[u32]) -> Result<Vec<DeepChannelData>> {
    let sample_count = total_samples(counts);

    let expected_bytes: u64 = channels.list.iter()
        .map(|channel| sample_count * channel.sample_type.bytes_per_sample() as u64)
        .sum();

    if bytes.len() as u64 != expected_bytes {
        return Err(Error::corrupt("deep sample data size disagrees with sample count table"));
    }

    let sample_count = sample_count as usize;
    let mut remaining = bytes;
    let mut decoded = Vec::with_capacity(channels.list.len());

    for channel in &channels.list {
        decoded.push(match channel.sample_type {
            SampleType::F16 => {
                let mut samples = vec![f16::ZERO; sample_count];
                f16::read_slice_le(&mut remaining, &mut samples)?;
                DeepChannelData::F16(samples)
            },

            SampleType::F32 => {
                let mut samples = vec![0.0_f32; sample_count];
                f32::read_slice_le(&mut remaining, &mut samples)?;
                DeepChannelData::F32(samples)
            },

            SampleType::U32 => {
                let mut samples = vec![0_u32; sample_count];
                u32::read_slice_le(&mut remaining, &mut samples)?;
                DeepChannelData::U32(samples)
            },

            SampleType::U8 | SampleType::U16 =>
                return Err(Error::unsupported("integer channel type in deep data")),
        });
    }

    Ok(decoded)
}

/// Encode one flat array per channel into a deep chunk payload.
pub fn pack_deep_samples(channels: &[DeepChannelData]) -> Result<ByteVec> {
    let byte_size: usize = channels.iter()
        .map(|channel| channel.len() * channel.sample_type().bytes_per_sample())
        .sum();

    let mut bytes = Vec::with_capacity(byte_size);

    for channel in channels {
        match channel {
            DeepChannelData::F16(samples) => f16::write_slice_le(&mut bytes, samples)?,
            DeepChannelData::F32(samples) => f32::write_slice_le(&mut bytes, samples)?,
            DeepChannelData::U32(samples) => u32::write_slice_le(&mut bytes, samples)?,
        }
    }

    Ok(bytes)
}


/// Caller-visible storage for a range of deep pixels.
///
/// Allocated from a sample count table, which makes the ordering contract
/// structural: the counts must have been read before pixel payloads can be
/// requested, because without them no per-pixel address exists.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepFrameBuffer {

    /// Width and line count of the pixel range this buffer covers.
    size: Vec2<usize>,

    /// Per-pixel sample counts, row-major.
    counts: Vec<u32>,

    /// Prefix sums over `counts`, one entry more than pixels.
    offsets: Vec<u64>,

    /// One flat sample array per channel, in header channel order.
    pub channels: Vec<DeepChannelData>,
}

impl DeepFrameBuffer {

    /// Allocate storage for the specified range from its sample counts.
    /// The counts slice must contain `size.area()` entries.
    pub fn allocate(channels: &ChannelList, size: Vec2<usize>, counts: &[u32]) -> Result<Self> {
        if counts.len() != size.area() {
            return Err(Error::type_mismatch("sample count slice does not cover the requested range"));
        }

        let offsets = pixel_offsets(counts);
        let sample_count = offsets[offsets.len() - 1] as usize;

        let channels = channels.list.iter()
            .map(|channel| DeepChannelData::allocate(channel.sample_type, sample_count))
            .collect::<Result<Vec<_>>>()?;

        Ok(DeepFrameBuffer {
            size,
            counts: counts.to_vec(),
            offsets,
            channels,
        })
    }

    /// Width and line count of the range this buffer covers.
    pub fn size(&self) -> Vec2<usize> { self.size }

    /// The per-pixel sample counts of this buffer.
    pub fn sample_counts(&self) -> &[u32] { &self.counts }

    /// Number of samples at the specified position, relative to the buffer.
    pub fn sample_count(&self, position: Vec2<usize>) -> u32 {
        self.counts[self.pixel_index(position)]
    }

    /// The index range of one pixel's samples within each channel's flat array.
    pub fn pixel_range(&self, position: Vec2<usize>) -> std::ops::Range<usize> {
        let pixel = self.pixel_index(position);
        self.offsets[pixel] as usize .. self.offsets[pixel + 1] as usize
    }

    fn pixel_index(&self, position: Vec2<usize>) -> usize {
        assert!(
            position.x() < self.size.width() && position.y() < self.size.height(),
            "deep pixel position ({}, {}) out of range", position.x(), position.y()
        );

        position.y() * self.size.width() + position.x()
    }

    /// Copy the decoded channels of one chunk into this buffer.
    ///
    /// `chunk_lines` is the line range of the chunk relative to this buffer;
    /// lines outside the buffer are skipped, so a chunk overlapping the
    /// requested range at either end fills exactly the overlap. The chunk's
    /// counts must equal the buffer's counts for the overlapping lines;
    /// this is the caller's contract and only verified with a debug assertion.
    pub(crate) fn insert_chunk_lines(
        &mut self,
        chunk_counts: &[u32], chunk_channels: &[DeepChannelData],
        chunk_first_line: i64, chunk_line_count: usize,
    ) -> UnitResult
    {
        let width = self.size.width();
        let chunk_offsets = pixel_offsets(chunk_counts);

        for chunk_line in 0 .. chunk_line_count {
            let buffer_line = chunk_first_line + chunk_line as i64;
            if buffer_line < 0 || buffer_line >= self.size.height() as i64 { continue; }
            let buffer_line = buffer_line as usize;

            debug_assert_eq!(
                &chunk_counts[chunk_line * width .. (chunk_line + 1) * width],
                &self.counts[buffer_line * width .. (buffer_line + 1) * width],
                "sample counts stale for inserted line"
            );

            let source_range =
                chunk_offsets[chunk_line * width] as usize
                .. chunk_offsets[(chunk_line + 1) * width] as usize;

            let target_start = self.offsets[buffer_line * width] as usize;

            for (target, source) in self.channels.iter_mut().zip(chunk_channels) {
                if target.sample_type() != source.sample_type() {
                    return Err(Error::corrupt("deep chunk channel type mismatch"));
                }

                target.copy_range_from(source, source_range.clone(), target_start);
            }
        }

        Ok(())
    }

    /// Extract the channels of one chunk line range from this buffer,
    /// for encoding. The inverse of `insert_chunk_lines`.
    pub(crate) fn extract_chunk_lines(&self, first_line: usize, line_count: usize) -> (Vec<u32>, Vec<DeepChannelData>) {
        let width = self.size.width();
        let last_line = (first_line + line_count).min(self.size.height());

        let counts = self.counts[first_line * width .. last_line * width].to_vec();

        let source_range =
            self.offsets[first_line * width] as usize
            .. self.offsets[last_line * width] as usize;

        let channels = self.channels.iter().map(|channel| {
            let mut extracted = DeepChannelData::allocate(channel.sample_type(), source_range.len())
                .expect("allocated channel type bug");

            extracted.copy_range_from(channel, source_range.clone(), 0);
            extracted
        }).collect();

        (counts, channels)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::attribute::ChannelDescription;

    fn deep_channels() -> ChannelList {
        ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("A", SampleType::F16),
            ChannelDescription::new("Z", SampleType::F32),
        ])
    }

    #[test]
    fn count_table_roundtrip(){
        let counts = [ 2_u32, 1, 3,  0, 2, 1 ];

        for &compression in &[Compression::Uncompressed, Compression::Rle, Compression::Zip1] {
            let table = compress_sample_count_table(compression, &counts, 3, 2).unwrap();
            let decoded = decompress_sample_count_table(compression, &table, 3, 2).unwrap();
            assert_eq!(decoded, counts);
        }
    }

    #[test]
    fn count_table_stores_cumulative_values_restarting_per_line(){
        let counts = [ 2_u32, 1, 3,  0, 2, 1 ];
        let table = compress_sample_count_table(Compression::Uncompressed, &counts, 3, 2).unwrap();

        let mut values = Vec::new();
        let mut remaining = table.as_slice();
        for _ in 0..6 { values.push(i32::read_le(&mut remaining).unwrap()); }

        assert_eq!(values, [ 2, 3, 6,  0, 2, 3 ]);
    }

    #[test]
    fn non_monotonic_count_table_is_corrupt(){
        let mut table = Vec::new();
        for value in [ 5_i32, 3, 6 ] { value.write_le(&mut table).unwrap(); }

        assert!(matches!(
            decompress_sample_count_table(Compression::Uncompressed, &table, 3, 1),
            Err(Error::CorruptData(_))
        ));
    }

    #[test]
    fn line_overflowing_counts_are_rejected(){
        let counts = [ u32::MAX / 2, u32::MAX / 2, 3 ];
        assert!(compress_sample_count_table(Compression::Uncompressed, &counts, 3, 1).is_err());
    }

    #[test]
    fn payload_size_must_agree_with_counts(){
        let channels = deep_channels();
        let counts = [ 1_u32, 0, 2 ];

        // 3 samples * (2 + 4) bytes = 18 bytes
        assert!(unpack_deep_samples(&[0_u8; 18], &channels, &counts).is_ok());
        assert!(unpack_deep_samples(&[0_u8; 17], &channels, &counts).is_err());
        assert!(unpack_deep_samples(&[0_u8; 19], &channels, &counts).is_err());
    }

    #[test]
    fn deep_payload_roundtrip(){
        let channels = deep_channels();
        let counts = [ 2_u32, 0, 1,  1, 1, 0 ];

        let alpha: Vec<f16> = (0..5).map(|index| f16::from_f32(index as f32 * 0.25)).collect();
        let depth: Vec<f32> = (0..5).map(|index| index as f32 + 0.5).collect();

        let packed = pack_deep_samples(&[
            DeepChannelData::F16(alpha.clone()),
            DeepChannelData::F32(depth.clone()),
        ]).unwrap();

        let unpacked = unpack_deep_samples(&packed, &channels, &counts).unwrap();
        assert_eq!(unpacked[0], DeepChannelData::F16(alpha));
        assert_eq!(unpacked[1], DeepChannelData::F32(depth));
    }

    #[test]
    fn frame_buffer_pixel_ranges(){
        let counts = [ 2_u32, 0, 1,  1, 1, 0 ];
        let buffer = DeepFrameBuffer::allocate(&deep_channels(), Vec2(3, 2), &counts).unwrap();

        assert_eq!(buffer.sample_count(Vec2(0, 0)), 2);
        assert_eq!(buffer.pixel_range(Vec2(0, 0)), 0..2);
        assert_eq!(buffer.pixel_range(Vec2(1, 0)), 2..2);
        assert_eq!(buffer.pixel_range(Vec2(2, 0)), 2..3);
        assert_eq!(buffer.pixel_range(Vec2(0, 1)), 3..4);
        assert_eq!(buffer.pixel_range(Vec2(2, 1)), 5..5);
        assert_eq!(buffer.channels[0].len(), 5);
    }

    #[test]
    fn insert_and_extract_chunk_lines_roundtrip(){
        let channels = deep_channels();
        let counts = [ 1_u32, 2,  0, 1,  3, 0 ];
        let mut buffer = DeepFrameBuffer::allocate(&channels, Vec2(2, 3), &counts).unwrap();

        // fill line 1 with recognizable values
        let line_counts = [ 0_u32, 1 ];
        let line_channels = vec![
            DeepChannelData::F16(vec![f16::from_f32(0.5)]),
            DeepChannelData::F32(vec![42.0]),
        ];

        buffer.insert_chunk_lines(&line_counts, &line_channels, 1, 1).unwrap();

        let (extracted_counts, extracted_channels) = buffer.extract_chunk_lines(1, 1);
        assert_eq!(extracted_counts, line_counts);
        assert_eq!(extracted_channels, line_channels);
    }
}
