
//! The Wavefront RLA codec.
//!
//! A fixed 740-byte big-endian header is followed by one `u32` file offset
//! per scan line, then by the scan line records. Scan lines are stored
//! bottom row first. The offset table is reserved as zeroes and patched
//! when the file is closed, because record sizes are only known after
//! encoding; an offset of zero therefore marks a line that was never
//! written, and such files can still be read partially.
//!
//! Run-length compressed records store every channel as independently
//! encoded byte planes, most significant plane first, each prefixed with
//! its encoded byte count. A plane whose stored size equals the raw plane
//! size was stored uncompressed, which happens whenever encoding would
//! have grown the data.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Seek};
use std::ops::Range;
use std::path::Path;

use smallvec::SmallVec;

use crate::io::*;
use crate::math::Vec2;
use crate::meta::{Header, Blocks, OffsetTable};
use crate::meta::attribute::*;
use crate::compress::{self, rle, Compression};
use crate::block::map_maybe_parallel;
use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample};
use crate::convert::bit_range_convert;
use crate::format::{FormatEntry, ImageInput, ImageOutput, ReadOptions, WriteOptions};
use crate::error::*;

/// Byte size of the fixed header.
pub const HEADER_SIZE: usize = 740;

/// The `Revision` value this codec writes.
const REVISION: i16 = -2; // 0xfffe

/// Repeats must be at least this long to pay off over a literal run.
const MIN_RUN: usize = 3;

// channel storage type codes
const TYPE_BYTE: i16 = 0;
const TYPE_WORD: i16 = 1;
const TYPE_DWORD: i16 = 2;
const TYPE_FLOAT: i16 = 3;

// compression codes
const COMPRESSION_NONE: i16 = 0;
const COMPRESSION_RLE: i16 = 1;

/// The registry entry for this format.
pub fn format_entry() -> FormatEntry {
    FormatEntry {
        name: "rla",
        extensions: &["rla", "rpf"],
        // no magic bytes; the revision field at offset 26 is the best available signature
        matches_magic: |bytes| bytes[26] == 0xff && bytes[27] == 0xfe,
        open: |path, options| Ok(Box::new(RlaInput::open(path, options)?)),
        create: |path, header, options| Ok(Box::new(RlaOutput::create_path(path, header, options)?)),
    }
}


/// The fields of the fixed header that survive into the neutral `Header`,
/// plus the layout information the codec needs.
#[derive(Debug, Clone)]
struct RlaHeaderInfo {
    header: Header,

    /// Sample layout of each channel group: (count, sample type, significant bits).
    color: (usize, SampleType, u8),
    matte: (usize, SampleType, u8),
    auxiliary: (usize, SampleType, u8),
}

fn channel_type_of(code: i16, bits: i16, group: &'static str) -> Result<(SampleType, u8)> {
    // a zero bit count appears in historical files and means
    // "all bits of a byte channel"; other combinations are corrupt
    let bits = match (code, bits) {
        (TYPE_BYTE, 0) => 8,
        (_, bits) if bits >= 1 && bits <= 32 => bits,
        _ => return Err(Error::malformed("channel bit count out of range")),
    } as u8;

    let sample_type = match code {
        TYPE_BYTE => SampleType::U8,
        TYPE_WORD => SampleType::U16,
        TYPE_DWORD => SampleType::U32,
        TYPE_FLOAT => SampleType::F32,
        _ => return Err(Error::malformed("unsupported channel type code")),
    };

    if bits > sample_type.bits_per_sample() {
        return Err(Error::malformed(group));
    }

    Ok((sample_type, bits))
}

fn channel_type_code(sample_type: SampleType) -> Result<i16> {
    match sample_type {
        SampleType::U8 => Ok(TYPE_BYTE),
        SampleType::U16 => Ok(TYPE_WORD),
        SampleType::U32 => Ok(TYPE_DWORD),
        SampleType::F32 => Ok(TYPE_FLOAT),
        SampleType::F16 => Err(Error::unsupported("16 bit float channels in this format")),
    }
}

/// The channel names of the three groups, in on-disk order.
fn group_channel_names(color: usize, matte: usize, auxiliary: usize) -> Vec<Text> {
    let mut names = Vec::with_capacity(color + matte + auxiliary);

    let color_names = ["R", "G", "B"];
    for index in 0 .. color {
        names.push(match color_names.get(index) {
            Some(&name) => Text::from(name),
            None => Text::from(format!("color{}", index).as_str()),
        });
    }

    for index in 0 .. matte {
        names.push(if index == 0 { Text::from("A") } else { Text::from(format!("matte{}", index).as_str()) });
    }

    for index in 0 .. auxiliary {
        names.push(if index == 0 { Text::from("Z") } else { Text::from(format!("aux{}", index).as_str()) });
    }

    names
}

fn read_header_info(read: &mut impl Read) -> Result<RlaHeaderInfo> {
    let window_left = i16::read_be(read)?;
    let window_right = i16::read_be(read)?;
    let window_bottom = i16::read_be(read)?;
    let window_top = i16::read_be(read)?;

    let active_left = i16::read_be(read)?;
    let active_right = i16::read_be(read)?;
    let active_bottom = i16::read_be(read)?;
    let active_top = i16::read_be(read)?;

    let _frame_number = i16::read_be(read)?;
    let color_type = i16::read_be(read)?;

    let color_count = i16::read_be(read)?;
    let matte_count = i16::read_be(read)?;
    let auxiliary_count = i16::read_be(read)?;

    let revision = i16::read_be(read)?;
    if revision != REVISION {
        return Err(Error::malformed("unsupported revision"));
    }

    let gamma_text = Text::read_fixed(read, 16)?;
    skip_bytes(read, 24 * 4)?; // chromaticities and white point
    let _job_number = i32::read_be(read)?;
    let _file_name = Text::read_fixed(read, 128)?;
    let description = Text::read_fixed(read, 128)?;
    let program = Text::read_fixed(read, 64)?;
    let _machine = Text::read_fixed(read, 32)?;
    let user = Text::read_fixed(read, 32)?;
    let date = Text::read_fixed(read, 20)?;
    skip_bytes(read, 24 + 8)?; // aspect texts
    let _channel_color = Text::read_fixed(read, 32)?;

    let color_bits = i16::read_be(read)?;
    let matte_type = i16::read_be(read)?;
    let matte_bits = i16::read_be(read)?;
    let auxiliary_type = i16::read_be(read)?;
    let auxiliary_bits = i16::read_be(read)?;

    let compression = i16::read_be(read)?;
    skip_bytes(read, 32 + 80)?; // auxiliary data and reserved bytes
    let _next_offset = i32::read_be(read)?;

    // fail closed on inverted or out-of-range geometry;
    // widen before subtracting so corrupt extremes cannot overflow
    let (window_left, window_right) = (window_left as i32, window_right as i32);
    let (window_bottom, window_top) = (window_bottom as i32, window_top as i32);
    let (active_left, active_right) = (active_left as i32, active_right as i32);
    let (active_bottom, active_top) = (active_bottom as i32, active_top as i32);

    if active_right < active_left || active_top < active_bottom
        || window_right < window_left || window_top < window_bottom
    {
        return Err(Error::malformed("inverted window bounds"));
    }

    let data_window = IntegerBounds::new(
        Vec2(active_left, active_bottom),
        Vec2((active_right - active_left + 1) as usize, (active_top - active_bottom + 1) as usize),
    );

    let display_window = IntegerBounds::new(
        Vec2(window_left, window_bottom),
        Vec2((window_right - window_left + 1) as usize, (window_top - window_bottom + 1) as usize),
    );

    let color_count = i32_to_usize(color_count as i32, "color channel count")?;
    let matte_count = i32_to_usize(matte_count as i32, "matte channel count")?;
    let auxiliary_count = i32_to_usize(auxiliary_count as i32, "auxiliary channel count")?;

    if color_count + matte_count + auxiliary_count == 0 || color_count > 3 {
        return Err(Error::malformed("channel counts"));
    }

    let color = channel_type_of(color_type, color_bits, "color channel bit count")?;
    let matte = if matte_count == 0 { (SampleType::U8, 8) }
        else { channel_type_of(matte_type, matte_bits, "matte channel bit count")? };
    let auxiliary = if auxiliary_count == 0 { (SampleType::U8, 8) }
        else { channel_type_of(auxiliary_type, auxiliary_bits, "auxiliary channel bit count")? };

    let compression = match compression {
        COMPRESSION_NONE => Compression::Uncompressed,
        COMPRESSION_RLE => Compression::Rle,
        _ => return Err(Error::malformed("unsupported compression code")),
    };

    let gamma: f32 = std::str::from_utf8(gamma_text.as_slice()).ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(1.0);

    let names = group_channel_names(color_count, matte_count, auxiliary_count);
    let mut channels = SmallVec::new();

    for (index, name) in names.into_iter().enumerate() {
        let (sample_type, bits) = if index < color_count { color }
            else if index < color_count + matte_count { matte }
            else { auxiliary };

        let mut channel = ChannelDescription::new(name, sample_type);
        if bits != sample_type.bits_per_sample() { channel = channel.with_bits(bits); }
        channels.push(channel);
    }

    let mut header = Header::new(data_window.size, ChannelList::new(channels))
        .with_encoding(compression, Blocks::ScanLines, LineOrder::Decreasing);

    header.data_window = data_window;
    header.display_window = display_window;
    header.gamma = gamma;
    header.alpha_mode = if matte_count > 0 { Some(AlphaMode::Unassociated) } else { None };
    header.owner = if user.is_empty() { None } else { Some(user) };
    header.comments = if description.is_empty() { None } else { Some(description) };
    header.capture_date = if date.is_empty() { None } else { Some(date) };
    header.software = if program.is_empty() { None } else { Some(program) };

    header.validate()?;

    Ok(RlaHeaderInfo {
        header,
        color: (color_count, color.0, color.1),
        matte: (matte_count, matte.0, matte.1),
        auxiliary: (auxiliary_count, auxiliary.0, auxiliary.1),
    })
}

fn split_channel_groups(header: &Header) -> Result<(usize, usize, usize)> {
    let alpha_index = header.channels.alpha_index();
    let depth_index = header.channels.find_index_of(&Text::from("Z"));

    let total = header.channels.list.len();

    // on-disk order is color, matte, auxiliary; the neutral header
    // must already list the channels in that order
    let color = alpha_index.or(depth_index).unwrap_or(total);
    let matte = if alpha_index.is_some() { 1 } else { 0 };
    let auxiliary = total - color - matte;

    if color > 3 {
        return Err(Error::unsupported("more than three color channels"));
    }

    if let (Some(alpha), Some(depth)) = (alpha_index, depth_index) {
        if depth < alpha {
            return Err(Error::unsupported("depth channel before alpha channel"));
        }
    }

    // the header stores one type and bit count per group
    let groups = [(0, color), (color, matte), (color + matte, auxiliary)];
    for &(first, count) in &groups {
        let channels = &header.channels.list[first .. first + count];

        if let Some(reference) = channels.first() {
            let uniform = channels.iter().all(|channel|
                channel.sample_type == reference.sample_type
                    && channel.significant_bits() == reference.significant_bits()
            );

            if !uniform {
                return Err(Error::unsupported("mixed channel types within one group"));
            }
        }
    }

    Ok((color, matte, auxiliary))
}

fn write_header_info(write: &mut impl Write, header: &Header) -> UnitResult {
    let (color_count, matte_count, auxiliary_count) = split_channel_groups(header)?;

    let window = header.display_window;
    let active = header.data_window;

    let coordinate = |value: i32, name: &'static str| -> Result<i16> {
        i16::try_from(value).map_err(|_| Error::unsupported(name))
    };

    use std::convert::TryFrom;

    coordinate(window.position.x(), "window left")?.write_be(write)?;
    coordinate(window.end().x() - 1, "window right")?.write_be(write)?;
    coordinate(window.position.y(), "window bottom")?.write_be(write)?;
    coordinate(window.end().y() - 1, "window top")?.write_be(write)?;

    coordinate(active.position.x(), "active left")?.write_be(write)?;
    coordinate(active.end().x() - 1, "active right")?.write_be(write)?;
    coordinate(active.position.y(), "active bottom")?.write_be(write)?;
    coordinate(active.end().y() - 1, "active top")?.write_be(write)?;

    0_i16.write_be(write)?; // frame number

    let group_layout = |first_index: usize| -> (SampleType, u8) {
        let channel = &header.channels.list[first_index];
        (channel.sample_type, channel.significant_bits())
    };

    let color = if color_count > 0 { group_layout(0) } else { (SampleType::U8, 8) };
    let matte = if matte_count > 0 { group_layout(color_count) } else { (SampleType::U8, 8) };
    let auxiliary = if auxiliary_count > 0 { group_layout(color_count + matte_count) } else { (SampleType::U8, 8) };

    channel_type_code(color.0)?.write_be(write)?;

    (color_count as i16).write_be(write)?;
    (matte_count as i16).write_be(write)?;
    (auxiliary_count as i16).write_be(write)?;

    REVISION.write_be(write)?;

    Text::from(format!("{}", header.gamma).as_str()).write_fixed(write, 16)?;

    for _chromaticity in 0 .. 4 {
        Text::from("").write_fixed(write, 24)?;
    }

    0_i32.write_be(write)?; // job number
    Text::from("").write_fixed(write, 128)?; // file name
    header.comments.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 128)?;
    header.software.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 64)?;
    Text::from("").write_fixed(write, 32)?; // machine name
    header.owner.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 32)?;
    header.capture_date.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 20)?;
    Text::from("").write_fixed(write, 24)?; // aspect
    Text::from("1.0").write_fixed(write, 8)?; // aspect ratio
    Text::from("rgb").write_fixed(write, 32)?; // channel color space

    (color.1 as i16).write_be(write)?;
    channel_type_code(matte.0)?.write_be(write)?;
    (matte.1 as i16).write_be(write)?;
    channel_type_code(auxiliary.0)?.write_be(write)?;
    (auxiliary.1 as i16).write_be(write)?;

    match header.compression {
        Compression::Uncompressed => COMPRESSION_NONE.write_be(write)?,
        Compression::Rle => COMPRESSION_RLE.write_be(write)?,
        other => return Err(Error::unsupported(format!("{} in this format", other))),
    }

    u8::write_slice_le(write, &[0_u8; 32 + 80])?; // auxiliary data and reserved
    0_i32.write_be(write)?; // next offset

    Ok(())
}


/// Encode one scan line record from raw big-endian channel rows.
/// `channel_rows` holds one raw byte row per channel.
fn encode_scan_line(channel_rows: &[(Vec<u8>, usize)], compression: Compression) -> Result<Vec<u8>> {
    let mut record = Vec::new();

    for (row, bytes_per_sample) in channel_rows {
        match compression {
            Compression::Uncompressed => record.extend_from_slice(row),

            Compression::Rle => {
                // independently encode each byte-significance plane;
                // runs are far more likely within one plane
                let planes = compress::separate_planes(row, *bytes_per_sample);
                let plane_size = row.len() / bytes_per_sample;

                for plane in planes.chunks_exact(plane_size) {
                    let encoded = rle::encode(plane, MIN_RUN);

                    let stored = if encoded.len() < plane.len() { encoded } else { plane.to_vec() };
                    usize_to_u16(stored.len(), "scan line record size")?.write_be(&mut record)?;
                    record.extend_from_slice(&stored);
                }
            },

            other => return Err(Error::unsupported(format!("{} in this format", other))),
        }
    }

    Ok(record)
}

/// Decode one scan line record into raw big-endian channel rows.
fn decode_scan_line(
    mut record: &[u8], width: usize,
    channel_layouts: &[usize], compression: Compression,
) -> Result<Vec<Vec<u8>>>
{
    let mut rows = Vec::with_capacity(channel_layouts.len());

    for &bytes_per_sample in channel_layouts {
        let row_size = width * bytes_per_sample;

        match compression {
            Compression::Uncompressed => {
                if record.len() < row_size {
                    return Err(Error::corrupt("scan line record ends too soon"));
                }

                rows.push(record[.. row_size].to_vec());
                record = &record[row_size ..];
            },

            Compression::Rle => {
                let mut planes = Vec::with_capacity(row_size);

                for _plane in 0 .. bytes_per_sample {
                    let stored_size = u16::read_be(&mut record)? as usize;
                    if record.len() < stored_size {
                        return Err(Error::corrupt("scan line record ends too soon"));
                    }

                    let (stored, rest) = record.split_at(stored_size);
                    record = rest;

                    if stored_size == width {
                        planes.extend_from_slice(stored); // stored raw
                    }
                    else {
                        planes.append(&mut rle::decode(stored, width)?);
                    }
                }

                rows.push(compress::interleave_planes(&planes, bytes_per_sample));
            },

            other => return Err(Error::unsupported(format!("{} in this format", other))),
        }
    }

    Ok(rows)
}


/// An open RLA file, for reading.
#[derive(Debug)]
pub struct RlaInput<R> {
    read: Tracking<R>,
    info: RlaHeaderInfo,
    offset_table: OffsetTable,
    options: ReadOptions,
}

impl RlaInput<BufReader<File>> {

    /// Open the file at the specified path.
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?), options)
    }
}

impl<R: Read + Seek> RlaInput<R> {

    /// Parse the header and the scan line offset table.
    pub fn read(reader: R, options: ReadOptions) -> Result<Self> {
        let mut read = Tracking::new(reader);

        let info = read_header_info(&mut read)?;
        debug_assert_eq!(read.byte_position(), HEADER_SIZE, "header layout bug");

        let height = info.header.data_size().height();
        let mut offset_table = vec![0_u64; height];

        for entry in offset_table.iter_mut() {
            *entry = u32::read_be(&mut read)? as u64;
        }

        if options.pedantic {
            let mut previous = 0_u64;
            for &offset in offset_table.iter().filter(|&&offset| offset != 0) {
                if offset < previous {
                    return Err(Error::malformed("scan line offsets decrease"));
                }
                previous = offset;
            }
        }

        Ok(RlaInput { read, info, offset_table, options })
    }

    /// Byte sizes of the samples of each channel, in on-disk order.
    fn channel_layouts(&self) -> Vec<usize> {
        self.info.header.channels.list.iter()
            .map(|channel| channel.sample_type.bytes_per_sample())
            .collect()
    }

    /// Read the raw record of the file scan line with the specified index.
    /// File scan lines are stored bottom-up.
    fn read_record(&mut self, file_line: usize) -> Result<Vec<u8>> {
        let offset = self.offset_table[file_line];
        if offset == 0 {
            return Err(Error::incomplete("scan line was never written"));
        }

        // the record ends at the next line's offset, or at the end of the file
        let end = self.offset_table.iter().copied()
            .filter(|&next| next > offset)
            .min();

        // a record is never larger than its raw rows plus the plane size
        // prefixes, as encoding falls back to raw storage when it would grow
        let max_record_size = {
            let header = &self.info.header;
            let plane_count: usize = header.channels.list.iter()
                .map(|channel| channel.sample_type.bytes_per_sample())
                .sum();

            header.data_size().width() * header.channels.bytes_per_pixel + plane_count * 2
        };

        self.read.seek_read_to(u64_to_usize(offset, "scan line offset")?)?;

        match end {
            Some(end) => {
                let size = u64_to_usize(end - offset, "scan line record size")?;
                if size > max_record_size {
                    return Err(Error::corrupt("scan line record exceeds maximum size"));
                }

                let mut record = vec![0_u8; size];
                u8::read_slice_le(&mut self.read, &mut record)?;
                Ok(record)
            },

            None => {
                let mut record = Vec::new();
                self.read.read_to_end(&mut record)?;
                Ok(record)
            },
        }
    }
}

impl<R: Read + Seek> ImageInput for RlaInput<R> {

    fn format_name(&self) -> &'static str { "rla" }

    fn header(&self) -> &Header { &self.info.header }

    fn is_complete(&self) -> bool {
        self.offset_table.iter().all(|&offset| offset != 0)
    }

    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let header = self.info.header.clone();
        let slice_indices = target.match_channels(&header.channels)?;

        let Vec2(width, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        let layouts = self.channel_layouts();

        // read all records sequentially, then decode them on the thread pool
        let records: Vec<(usize, Result<Vec<u8>>)> = lines.clone()
            .map(|y| (y, self.read_record(height - 1 - y))) // stored bottom-up
            .collect();

        let compression = header.compression;
        let layouts_ref = &layouts;
        let decoded = map_maybe_parallel(records, self.options.parallel, move |(y, record)| {
            let rows = decode_scan_line(&record?, width, layouts_ref, compression)?;
            Ok((y, rows))
        });

        let mut first_error = None;

        for result in decoded {
            let (y, rows): (usize, Vec<Vec<u8>>) = match result {
                Ok(value) => value,
                Err(error) => { first_error.get_or_insert(error); continue; },
            };

            for ((channel, &slice_index), row) in header.channels.list.iter().zip(&slice_indices).zip(rows) {
                let mut row = row.as_slice();
                let bits = channel.significant_bits() as u32;
                let storage_bits = channel.sample_type.bits_per_sample() as u32;

                for x in 0 .. width {
                    let sample = match channel.sample_type {
                        SampleType::U8 => {
                            let value = u8::read_be(&mut row)? as u32;
                            Sample::U8(bit_range_convert(value, bits, storage_bits) as u8)
                        },
                        SampleType::U16 => {
                            let value = u16::read_be(&mut row)? as u32;
                            Sample::U16(bit_range_convert(value, bits, storage_bits) as u16)
                        },
                        SampleType::U32 => {
                            let value = u32::read_be(&mut row)?;
                            Sample::U32(bit_range_convert(value, bits, storage_bits))
                        },
                        SampleType::F32 => Sample::F32(f32::read_be(&mut row)?),
                        SampleType::F16 => return Err(Error::corrupt("channel type bug")),
                    };

                    target.set_sample(slice_index, Vec2(x, y), sample);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn raw_chunk_data(&mut self, chunk_index: usize, buffer: &mut [u8]) -> Result<usize> {
        let height = self.info.header.data_size().height();
        if chunk_index >= height {
            return Err(Error::corrupt("chunk index out of bounds"));
        }

        let record = self.read_record(chunk_index)?;

        if buffer.len() >= record.len() {
            buffer[.. record.len()].copy_from_slice(&record);
        }

        Ok(record.len())
    }
}


/// An RLA file being written.
#[derive(Debug)]
pub struct RlaOutput<W: Write + Seek> {
    write: Tracking<W>,
    header: Header,
    options: WriteOptions,
    offset_table: OffsetTable,
    closed: bool,
}

impl RlaOutput<BufWriter<File>> {

    /// Create a file at the specified path.
    pub fn create_path(path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Self> {
        Self::create(BufWriter::new(File::create(path)?), header, options)
    }
}

impl<W: Write + Seek> RlaOutput<W> {

    /// Write the header and a zeroed offset table, ready for scan lines.
    pub fn create(writer: W, header: Header, options: WriteOptions) -> Result<Self> {
        header.validate()?;

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("tiles in this format"));
        }

        let mut write = Tracking::new(writer);
        write_header_info(&mut write, &header)?;
        debug_assert_eq!(write.byte_position(), HEADER_SIZE, "header layout bug");

        let height = header.data_size().height();
        for _ in 0 .. height {
            0_u32.write_be(&mut write)?;
        }

        Ok(RlaOutput {
            write, header, options,
            offset_table: vec![0_u64; height],
            closed: false,
        })
    }
}

impl<W: Write + Seek> ImageOutput for RlaOutput<W> {

    fn format_name(&self) -> &'static str { "rla" }

    fn header(&self) -> &Header { &self.header }

    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.header.clone();
        let slice_indices = source.match_channels(&header.channels)?;

        let Vec2(width, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        // serialize each line's channels as raw big-endian rows
        let raw_lines: Vec<Result<(usize, Vec<(Vec<u8>, usize)>)>> = lines.clone().map(|y| {
            let mut channel_rows = Vec::with_capacity(header.channels.list.len());

            for (channel, &slice_index) in header.channels.list.iter().zip(&slice_indices) {
                let bits = channel.significant_bits() as u32;
                let storage_bits = channel.sample_type.bits_per_sample() as u32;
                let bytes_per_sample = channel.sample_type.bytes_per_sample();
                let mut row = Vec::with_capacity(width * bytes_per_sample);

                for x in 0 .. width {
                    let sample = source.sample(slice_index, Vec2(x, y))
                        .convert_to(channel.sample_type);

                    match sample {
                        Sample::U8(value) =>
                            (bit_range_convert(value as u32, storage_bits, bits) as u8).write_be(&mut row)?,
                        Sample::U16(value) =>
                            (bit_range_convert(value as u32, storage_bits, bits) as u16).write_be(&mut row)?,
                        Sample::U32(value) =>
                            bit_range_convert(value, storage_bits, bits).write_be(&mut row)?,
                        Sample::F32(value) => value.write_be(&mut row)?,
                        Sample::F16(_) => return Err(Error::unsupported("16 bit float channels in this format")),
                    }
                }

                channel_rows.push((row, bytes_per_sample));
            }

            Ok((y, channel_rows))
        }).collect();

        let compression = header.compression;
        let encoded: Vec<Result<(usize, Vec<u8>)>> = map_maybe_parallel(raw_lines, self.options.parallel, move |line| {
            let (y, channel_rows) = line?;
            Ok((y, encode_scan_line(&channel_rows, compression)?))
        });

        for result in encoded {
            let (y, record): (usize, Vec<u8>) = result?;
            let file_line = height - 1 - y; // stored bottom-up

            if self.offset_table[file_line] != 0 {
                return Err(Error::unsupported("scan line was already written"));
            }

            self.offset_table[file_line] = self.write.byte_position() as u64;
            u8::write_slice_le(&mut self.write, &record)?;
        }

        Ok(())
    }

    fn close(&mut self) -> UnitResult {
        if self.closed {
            return Err(Error::unsupported("output was already closed"));
        }

        self.closed = true;

        // patch the reserved offset table
        self.write.seek_write_to(HEADER_SIZE)?;

        for &offset in &self.offset_table.clone() {
            usize_to_u32(offset as usize, "scan line offset")?.write_be(&mut self.write)?;
        }

        self.write.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::block::samples::interleaved_slices;

    fn rgb_header(size: Vec2<usize>, compression: Compression) -> Header {
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U8),
            ChannelDescription::new("G", SampleType::U8),
            ChannelDescription::new("B", SampleType::U8),
        ]);

        Header::new(size, channels)
            .with_encoding(compression, Blocks::ScanLines, LineOrder::Decreasing)
    }

    fn names(list: &[&str]) -> Vec<Text> {
        list.iter().map(|&name| Text::from(name)).collect()
    }

    fn roundtrip(header: Header, pixel_bytes: &[u8], slice_names: &[&str], sample_type: SampleType) -> Vec<u8> {
        let width = header.data_size().width();
        let height = header.data_size().height();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(pixel_bytes, interleaved_slices(names(slice_names), sample_type, width));
            output.write_pixels(0 .. height, &source).unwrap();
            output.close().unwrap();
        }

        file_bytes.set_position(0);
        let mut input = RlaInput::read(file_bytes, ReadOptions::default()).unwrap();
        assert!(input.is_complete());

        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(slice_names), sample_type, width));
            input.read_pixels(0 .. height, &mut target).unwrap();
        }

        decoded
    }

    #[test]
    fn uncompressed_8x8_has_exact_file_size(){
        let header = rgb_header(Vec2(8, 8), Compression::Uncompressed);
        let pixel_bytes: Vec<u8> = (0 .. 8 * 8 * 3).map(|index| (index % 251) as u8).collect();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 8));
            output.write_pixels(0 .. 8, &source).unwrap();
            output.close().unwrap();
        }

        // fixed header, one u32 offset per line, then the raw payload
        let expected = HEADER_SIZE + 8 * 4 + 8 * (8 * 3);
        assert_eq!(file_bytes.get_ref().len(), expected);
    }

    #[test]
    fn rle_constant_image_compresses_and_roundtrips(){
        let header = rgb_header(Vec2(8, 8), Compression::Rle);
        let pixel_bytes = vec![42_u8; 8 * 8 * 3];

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 8));
            output.write_pixels(0 .. 8, &source).unwrap();
            output.close().unwrap();
        }

        let payload_size = file_bytes.get_ref().len() - HEADER_SIZE - 8 * 4;
        assert!(payload_size < 8 * 8 * 3, "constant image must compress");

        file_bytes.set_position(0);
        let mut input = RlaInput::read(file_bytes, ReadOptions::default()).unwrap();

        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 8));
            input.read_pixels(0 .. 8, &mut target).unwrap();
        }

        assert_eq!(decoded, pixel_bytes);
    }

    #[test]
    fn rle_roundtrip_with_16_bit_depth_channel(){
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U8),
            ChannelDescription::new("G", SampleType::U8),
            ChannelDescription::new("B", SampleType::U8),
            ChannelDescription::new("A", SampleType::U8),
            ChannelDescription::new("Z", SampleType::U16).with_bits(10),
        ]);

        let header = Header::new(Vec2(7, 5), channels)
            .with_encoding(Compression::Rle, Blocks::ScanLines, LineOrder::Decreasing);

        let width = 7;
        let height = 5;

        // interleaved u16 pixels for all slices, to share one buffer type
        let mut pixel_values = Vec::new();
        for index in 0 .. width * height {
            pixel_values.extend_from_slice(&[
                (index % 256) as u16 * 257,
                ((index * 3) % 256) as u16 * 257,
                ((index * 7) % 256) as u16 * 257,
                65535,
                // 10 bit depth values, scaled into the full 16 bit range
                crate::convert::bit_range_convert((index % 1024) as u32, 10, 16) as u16,
            ]);
        }

        let pixel_bytes: Vec<u8> = pixel_values.iter().flat_map(|value| value.to_ne_bytes()).collect();

        // u16 frame buffer slices are only defined for the u16 file channel,
        // so expose the u8 channels as u8 slices into the same memory
        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();

            let mut slices = interleaved_slices(names(&["R", "G", "B", "A", "Z"]), SampleType::U16, width);
            for slice in slices.iter_mut().take(4) {
                // read only the high byte of each 16 bit value on little endian,
                // by reinterpreting the slice as u8 with the same strides
                slice.sample_type = SampleType::U8;
                slice.base_byte_offset += if cfg!(target_endian = "little") { 1 } else { 0 };
            }

            let source = FrameBuffer::new(&pixel_bytes, slices);
            output.write_pixels(0 .. height, &source).unwrap();
            output.close().unwrap();
        }

        file_bytes.set_position(0);
        let mut input = RlaInput::read(file_bytes, ReadOptions::default()).unwrap();

        assert_eq!(input.header().channels.list[4].bits_per_sample, Some(10));

        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut slices = interleaved_slices(names(&["R", "G", "B", "A", "Z"]), SampleType::U16, width);
            for slice in slices.iter_mut().take(4) {
                slice.sample_type = SampleType::U8;
                slice.base_byte_offset += if cfg!(target_endian = "little") { 1 } else { 0 };
            }

            let mut target = FrameBufferMut::new(&mut decoded, slices);
            input.read_pixels(0 .. height, &mut target).unwrap();
        }

        // the u8 channels wrote only their high bytes; compare those and the depth
        for (pixel_index, pixel) in pixel_values.chunks(5).enumerate() {
            let decoded_values: Vec<u16> = decoded
                [pixel_index * 10 .. pixel_index * 10 + 10]
                .chunks(2)
                .map(|bytes| u16::from_ne_bytes([bytes[0], bytes[1]]))
                .collect();

            // depth roundtrips exactly through the 10 bit rescale
            assert_eq!(decoded_values[4], pixel[4], "depth mismatch at pixel {}", pixel_index);
        }
    }

    #[test]
    fn partially_written_file_reads_the_written_lines(){
        let header = rgb_header(Vec2(4, 4), Compression::Rle);
        let pixel_bytes: Vec<u8> = (0 .. 4 * 4 * 3).map(|index| index as u8).collect();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = RlaOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 4));

            output.write_pixels(0 .. 2, &source).unwrap(); // only half the lines
            output.close().unwrap();
        }

        file_bytes.set_position(0);
        let mut input = RlaInput::read(file_bytes, ReadOptions::default()).unwrap();
        assert!(!input.is_complete());

        // the written lines decode fine
        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 4));
            input.read_pixels(0 .. 2, &mut target).unwrap();

            // the unwritten lines report incompleteness
            assert!(matches!(
                input.read_pixels(2 .. 4, &mut target),
                Err(Error::IncompleteFile(_))
            ));
        }

        assert_eq!(&decoded[.. 4 * 2 * 3], &pixel_bytes[.. 4 * 2 * 3]);
    }

    #[test]
    fn roundtrip_all_compressions(){
        for &compression in &[Compression::Uncompressed, Compression::Rle] {
            let header = rgb_header(Vec2(13, 9), compression);
            let pixel_bytes: Vec<u8> = (0 .. 13 * 9 * 3).map(|index| ((index / 7) % 256) as u8).collect();

            let decoded = roundtrip(header, &pixel_bytes, &["R", "G", "B"], SampleType::U8);
            assert_eq!(decoded, pixel_bytes);
        }
    }
}
