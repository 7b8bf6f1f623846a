
//! The deep scanline/tile container format.
//!
//! Files start with magic bytes and a version field, followed by one or
//! more headers as lists of named attributes, a chunk offset table of
//! absolute byte positions, and the chunks themselves. Deep chunks carry
//! a sample count table in front of their pixel payload; the payload
//! cannot be addressed without decoding the table first.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Seek};
use std::ops::Range;
use std::path::Path;

use bit_field::BitField;
use half::f16;
use smallvec::SmallVec;

use crate::io::*;
use crate::math::Vec2;
use crate::meta::*;
use crate::meta::attribute::*;
use crate::compress::Compression;
use crate::block::{BlockIndex, UncompressedBlock, map_maybe_parallel};
use crate::block::chunk::*;
use crate::block::deep::{self, DeepFrameBuffer, DeepChannelData};
use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample};
use crate::format::{FormatEntry, ImageInput, ImageOutput, ReadOptions, WriteOptions};
use crate::error::*;

/// The first four bytes of each file of this format.
pub mod magic_number {
    use super::*;

    /// The first four bytes of each file of this format.
    pub const BYTES: [u8; 4] = [0x76, 0x2f, 0x31, 0x01];

    /// Without validation, write the magic bytes.
    pub fn write(write: &mut impl Write) -> UnitResult {
        u8::write_slice_le(write, &self::BYTES)
    }

    /// Consume four bytes and check that they are the magic bytes.
    pub fn validate(read: &mut impl Read) -> UnitResult {
        let mut magic = [0_u8; 4];
        u8::read_slice_le(read, &mut magic)?;

        if magic == self::BYTES { Ok(()) }
        else { Err(Error::malformed("file identifier missing")) }
    }
}

/// A `0_u8` at the end of a sequence of attributes or headers.
mod sequence_end {
    use super::*;

    pub fn write(write: &mut impl Write) -> UnitResult {
        0_u8.write_le(write)
    }

    /// Peeks the next byte. If it is zero, consumes the byte and returns true.
    pub fn has_come(read: &mut PeekRead<impl Read>) -> Result<bool> {
        Ok(read.skip_if_eq(0)?)
    }
}

/// The names of the attributes this codec understands.
mod attribute_name {
    pub const CHANNELS: &[u8] = b"channels";
    pub const COMPRESSION: &[u8] = b"compression";
    pub const DATA_WINDOW: &[u8] = b"dataWindow";
    pub const DISPLAY_WINDOW: &[u8] = b"displayWindow";
    pub const LINE_ORDER: &[u8] = b"lineOrder";
    pub const PIXEL_ASPECT: &[u8] = b"pixelAspectRatio";
    pub const WINDOW_CENTER: &[u8] = b"screenWindowCenter";
    pub const WINDOW_WIDTH: &[u8] = b"screenWindowWidth";
    pub const TILES: &[u8] = b"tiles";
    pub const BLOCK_TYPE: &[u8] = b"type";
    pub const DEEP_DATA_VERSION: &[u8] = b"version";
    pub const CHUNK_COUNT: &[u8] = b"chunkCount";
    pub const MAX_SAMPLES: &[u8] = b"maxSamplesPerPixel";
    pub const OWNER: &[u8] = b"owner";
    pub const COMMENTS: &[u8] = b"comments";
    pub const CAPTURE_DATE: &[u8] = b"capDate";
    pub const SOFTWARE: &[u8] = b"software";
}

/// The values of the `type` attribute.
mod block_type {
    pub const SCAN_LINE: &[u8] = b"scanlineimage";
    pub const TILE: &[u8] = b"tiledimage";
    pub const DEEP_SCAN_LINE: &[u8] = b"deepscanline";
    pub const DEEP_TILE: &[u8] = b"deeptile";
}

const FORMAT_VERSION: i32 = 2;

// version field flag bits
const FLAG_SINGLE_TILED: usize = 9;
const FLAG_LONG_NAMES: usize = 10;
const FLAG_DEEP: usize = 11;
const FLAG_MULTIPART: usize = 12;

/// The registry entry for this format.
pub fn format_entry() -> FormatEntry {
    FormatEntry {
        name: "exr",
        extensions: &["exr"],
        matches_magic: |bytes| bytes[..4] == magic_number::BYTES,
        open: |path, options| Ok(Box::new(ExrInput::open(path, options)?)),
        create: |path, header, options| Ok(Box::new(ExrOutput::create_path(path, header, options)?)),
    }
}


/// Parse one header as a list of attributes, ending at the null byte.
/// Unknown attributes are skipped, structurally required ones are enforced.
fn read_header(read: &mut PeekRead<impl Read>) -> Result<Header> {
    let mut channels = None;
    let mut compression = None;
    let mut data_window = None;
    let mut display_window = None;
    let mut line_order = None;
    let mut pixel_aspect = 1.0_f32;
    let mut tiles = None;
    let mut kind: Option<Text> = None;
    let mut deep_data_version = None;
    let mut max_samples_per_pixel = None;
    let mut chunk_count_attribute = None;
    let mut owner = None;
    let mut comments = None;
    let mut capture_date = None;
    let mut software = None;

    while !sequence_end::has_come(read)? {
        let name = Text::read_null_terminated(read, 255)?;
        let _attribute_type = Text::read_null_terminated(read, 255)?;
        let value_size = i32_to_usize(i32::read_le(read)?, "attribute size")?;

        match name.as_slice() {
            attribute_name::CHANNELS => channels = Some(ChannelList::read_le(read)?),
            attribute_name::COMPRESSION => compression = Some(read_compression(read)?),
            attribute_name::DATA_WINDOW => data_window = Some(IntegerBounds::read_le(read)?),
            attribute_name::DISPLAY_WINDOW => display_window = Some(IntegerBounds::read_le(read)?),
            attribute_name::LINE_ORDER => line_order = Some(LineOrder::read_le(read)?),
            attribute_name::PIXEL_ASPECT => pixel_aspect = f32::read_le(read)?,
            attribute_name::TILES => tiles = Some(TileDescription::read_le(read)?),
            attribute_name::BLOCK_TYPE => kind = Some(Text::read_i32_sized_value(read, value_size)?),
            attribute_name::DEEP_DATA_VERSION => deep_data_version = Some(i32::read_le(read)?),
            attribute_name::CHUNK_COUNT => chunk_count_attribute = Some(i32::read_le(read)?),
            attribute_name::OWNER => owner = Some(Text::read_i32_sized_value(read, value_size)?),
            attribute_name::COMMENTS => comments = Some(Text::read_i32_sized_value(read, value_size)?),
            attribute_name::CAPTURE_DATE => capture_date = Some(Text::read_i32_sized_value(read, value_size)?),
            attribute_name::SOFTWARE => software = Some(Text::read_i32_sized_value(read, value_size)?),

            attribute_name::MAX_SAMPLES => {
                let value = i32::read_le(read)?;
                // -1 marks a value unknown because writing was interrupted
                max_samples_per_pixel = if value < 0 { None } else { Some(value as usize) };
            },

            // skip unknown attributes instead of rejecting the file
            _ => skip_bytes(read, value_size)?,
        }
    }

    let channels = channels.ok_or_else(|| Error::malformed("missing channels attribute"))?;
    let compression = compression.ok_or_else(|| Error::malformed("missing compression attribute"))?;
    let data_window = data_window.ok_or_else(|| Error::malformed("missing data window attribute"))?;
    let display_window = display_window.ok_or_else(|| Error::malformed("missing display window attribute"))?;
    let line_order = line_order.ok_or_else(|| Error::malformed("missing line order attribute"))?;

    // decode the declared structural kind
    let (mut declared_tiled, deep) = match kind.as_ref().map(Text::as_slice) {
        None => (tiles.is_some(), false),
        Some(block_type::SCAN_LINE) => (false, false),
        Some(block_type::TILE) => (true, false),
        Some(block_type::DEEP_SCAN_LINE) => (false, true),
        Some(block_type::DEEP_TILE) => (true, true),
        Some(_) => return Err(Error::malformed("unknown block type attribute")),
    };

    // a mislabeled type attribute is silently corrected to match the actual
    // structure, while any other structural mismatch stays fatal
    if declared_tiled && tiles.is_none() { declared_tiled = false; }
    else if !declared_tiled && tiles.is_some() && kind.is_some() { declared_tiled = true; }

    let blocks = if declared_tiled {
        Blocks::Tiles(tiles.expect("tile description presence bug"))
    } else {
        Blocks::ScanLines
    };

    if deep && !compression.supports_deep_data() {
        return Err(Error::malformed("compression method does not support deep data"));
    }

    let data_size = data_window.size;
    let header = Header {
        channels, compression, blocks, line_order,
        data_window, display_window, pixel_aspect,
        deep,
        deep_data_version: if deep { deep_data_version.or(Some(1)) } else { deep_data_version },
        max_samples_per_pixel,
        chunk_count: compute_chunk_count(compression, data_size, blocks),
        alpha_mode: Some(AlphaMode::Associated), // this container defines premultiplied alpha
        gamma: 1.0,
        owner, comments, capture_date, software,
    };

    if let Some(declared) = chunk_count_attribute {
        if i32_to_usize(declared, "chunk count attribute")? != header.chunk_count {
            return Err(Error::malformed("chunk count attribute disagrees with geometry"));
        }
    }

    header.validate()?;
    Ok(header)
}

impl Text {
    /// Read a string attribute value of the size declared by the attribute.
    fn read_i32_sized_value(read: &mut impl Read, value_size: usize) -> Result<Self> {
        let mut bytes = vec![0_u8; value_size.min(4096)];
        u8::read_slice_le(read, &mut bytes)?;
        skip_bytes(read, value_size.saturating_sub(4096))?;
        Text::from_bytes(SmallVec::from_vec(bytes))
    }
}

fn read_compression(read: &mut impl Read) -> Result<Compression> {
    match u8::read_le(read)? {
        0 => Ok(Compression::Uncompressed),
        1 => Ok(Compression::Rle),
        2 => Ok(Compression::Zip1),
        3 => Ok(Compression::Zip16),
        _ => Err(Error::malformed("unsupported compression code")),
    }
}

fn compression_code(compression: Compression) -> u8 {
    match compression {
        Compression::Uncompressed => 0,
        Compression::Rle => 1,
        Compression::Zip1 => 2,
        Compression::Zip16 => 3,
    }
}

/// Serialize one header as a list of attributes ending with a null byte.
/// Returns the byte position of the `maxSamplesPerPixel` value relative to
/// the start of the header bytes, for deep headers, so it can be patched
/// once the actual maximum is known.
fn write_header(write: &mut impl Write, header: &Header, multilayer: bool) -> Result<Option<usize>> {
    let mut bytes = Cursor::new(Vec::<u8>::new());
    let mut max_samples_position = None;

    fn write_attribute(
        write: &mut Cursor<Vec<u8>>, name: &[u8], kind: &[u8],
        value: impl FnOnce(&mut Cursor<Vec<u8>>) -> UnitResult,
    ) -> UnitResult {
        u8::write_slice_le(write, name)?;
        0_u8.write_le(write)?;
        u8::write_slice_le(write, kind)?;
        0_u8.write_le(write)?;

        let size_position = write.position();
        0_i32.write_le(write)?;

        let value_start = write.position();
        value(write)?;
        let value_end = write.position();

        write.set_position(size_position);
        ((value_end - value_start) as i32).write_le(write)?;
        write.set_position(value_end);
        Ok(())
    }

    write_attribute(&mut bytes, attribute_name::CHANNELS, b"chlist",
        |write| header.channels.write_le(write))?;

    write_attribute(&mut bytes, attribute_name::COMPRESSION, b"compression",
        |write| compression_code(header.compression).write_le(write))?;

    write_attribute(&mut bytes, attribute_name::DATA_WINDOW, b"box2i",
        |write| header.data_window.write_le(write))?;

    write_attribute(&mut bytes, attribute_name::DISPLAY_WINDOW, b"box2i",
        |write| header.display_window.write_le(write))?;

    write_attribute(&mut bytes, attribute_name::LINE_ORDER, b"lineOrder",
        |write| header.line_order.write_le(write))?;

    write_attribute(&mut bytes, attribute_name::PIXEL_ASPECT, b"float",
        |write| header.pixel_aspect.write_le(write))?;

    write_attribute(&mut bytes, attribute_name::WINDOW_CENTER, b"v2f",
        |write| { 0.0_f32.write_le(write)?; 0.0_f32.write_le(write) })?;

    write_attribute(&mut bytes, attribute_name::WINDOW_WIDTH, b"float",
        |write| 1.0_f32.write_le(write))?;

    if let Blocks::Tiles(tiles) = header.blocks {
        write_attribute(&mut bytes, attribute_name::TILES, b"tiledesc",
            |write| tiles.write_le(write))?;
    }

    let kind: &[u8] = match (header.blocks.has_tiles(), header.deep) {
        (false, false) => block_type::SCAN_LINE,
        (true, false) => block_type::TILE,
        (false, true) => block_type::DEEP_SCAN_LINE,
        (true, true) => block_type::DEEP_TILE,
    };

    // the type attribute is required for deep and multilayer files
    if header.deep || multilayer {
        write_attribute(&mut bytes, attribute_name::BLOCK_TYPE, b"string",
            |write| u8::write_slice_le(write, kind))?;

        write_attribute(&mut bytes, attribute_name::CHUNK_COUNT, b"int",
            |write| usize_to_i32(header.chunk_count, "chunk count")?.write_le(write))?;
    }

    if header.deep {
        write_attribute(&mut bytes, attribute_name::DEEP_DATA_VERSION, b"int",
            |write| header.deep_data_version.unwrap_or(1).write_le(write))?;

        let mut recorded_position = 0;
        write_attribute(&mut bytes, attribute_name::MAX_SAMPLES, b"int", |write| {
            recorded_position = write.position() as usize;
            match header.max_samples_per_pixel {
                Some(max) => usize_to_i32(max, "max samples per pixel")?.write_le(write),
                None => (-1_i32).write_le(write), // unknown until the file is closed
            }
        })?;

        max_samples_position = Some(recorded_position);
    }

    if let Some(text) = &header.owner {
        write_attribute(&mut bytes, attribute_name::OWNER, b"string",
            |write| u8::write_slice_le(write, text.as_slice()))?;
    }

    if let Some(text) = &header.comments {
        write_attribute(&mut bytes, attribute_name::COMMENTS, b"string",
            |write| u8::write_slice_le(write, text.as_slice()))?;
    }

    if let Some(text) = &header.capture_date {
        write_attribute(&mut bytes, attribute_name::CAPTURE_DATE, b"string",
            |write| u8::write_slice_le(write, text.as_slice()))?;
    }

    if let Some(text) = &header.software {
        write_attribute(&mut bytes, attribute_name::SOFTWARE, b"string",
            |write| u8::write_slice_le(write, text.as_slice()))?;
    }

    sequence_end::write(&mut bytes)?;

    let header_bytes = bytes.into_inner();
    u8::write_slice_le(write, &header_bytes)?;

    Ok(max_samples_position)
}


/// Look up the increasing-y chunk index for each tile coordinate of a header.
fn chunk_index_lookup(header: &Header) -> HashMap<TileCoordinates, usize> {
    header.blocks_increasing_y_order().enumerate()
        .map(|(chunk_index, tile)| (tile.location, chunk_index))
        .collect()
}

/// The increasing-y chunk indices covering the specified scan lines at level zero.
///
/// Panics if the requested lines exceed the data window,
/// as that is a contract violation by the caller.
fn chunks_for_lines(header: &Header, lines: &Range<usize>) -> Range<usize> {
    assert!(lines.start < lines.end, "empty scan line range");
    assert!(
        lines.end <= header.data_size().height(),
        "scan line range {}..{} exceeds data window height {}",
        lines.start, lines.end, header.data_size().height()
    );

    let lines_per_chunk = header.scan_lines_per_chunk();
    let first_chunk_row = lines.start / lines_per_chunk;
    let last_chunk_row = (lines.end - 1) / lines_per_chunk;

    match header.blocks {
        Blocks::ScanLines => first_chunk_row .. last_chunk_row + 1,

        // level zero tiles form the first rows of the chunk list
        Blocks::Tiles(_) => {
            let tiles_x = header.tile_count(Vec2(0, 0)).x();
            first_chunk_row * tiles_x .. (last_chunk_row + 1) * tiles_x
        },
    }
}


/// An open file of this format, for reading.
#[derive(Debug)]
pub struct ExrInput<R> {
    read: PeekRead<Tracking<R>>,
    headers: Headers,
    multilayer: bool,
    offset_tables: Vec<OffsetTable>,
    current_layer: usize,
    options: ReadOptions,

    /// Decoded sample count tables, per layer and increasing-y chunk index.
    /// A chunk's pixel payload may only be read once its table is cached here.
    sample_count_cache: HashMap<(usize, usize), Vec<u32>>,
}

impl ExrInput<BufReader<File>> {

    /// Open the file at the specified path.
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?), options)
    }
}

impl<R: Read + Seek> ExrInput<R> {

    /// Parse the headers and offset tables of the file.
    pub fn read(reader: R, options: ReadOptions) -> Result<Self> {
        let mut read = PeekRead::new(Tracking::new(reader));

        magic_number::validate(&mut read)?;

        let version = i32::read_le(&mut read)?;
        if version & 0xff != FORMAT_VERSION {
            return Err(Error::unsupported("file format version"));
        }

        let multilayer = (version as u32).get_bit(FLAG_MULTIPART);
        let _single_tiled = (version as u32).get_bit(FLAG_SINGLE_TILED);
        let _long_names = (version as u32).get_bit(FLAG_LONG_NAMES);
        let _deep = (version as u32).get_bit(FLAG_DEEP);

        let headers: Headers = {
            if multilayer {
                let mut headers = SmallVec::new();
                while !sequence_end::has_come(&mut read)? {
                    headers.push(read_header(&mut read)?);

                    if headers.len() > 512 {
                        return Err(Error::malformed("too many layers"));
                    }
                }

                if headers.is_empty() {
                    return Err(Error::malformed("at least one layer is required"));
                }

                headers
            }
            else {
                smallvec::smallvec![ read_header(&mut read)? ]
            }
        };

        let mut offset_tables = Vec::with_capacity(headers.len());
        for header in &headers {
            // corrupt geometry must not inflate the table allocation
            if header.chunk_count > 1 << 24 {
                return Err(Error::unsupported("chunk count exceeds the decoder limit"));
            }

            offset_tables.push(u64::read_vec_le(
                &mut read, header.chunk_count,
                u16::MAX as usize, None, "chunk offset table"
            )?);
        }

        if options.pedantic {
            let chunks_start = read.byte_position() as u64;
            for table in &offset_tables {
                // zero offsets are tolerated here and reported per-chunk,
                // so an interrupted file can still be read partially
                if table.iter().any(|&offset| offset != 0 && offset < chunks_start) {
                    return Err(Error::malformed("chunk offset before chunk section"));
                }
            }
        }

        Ok(ExrInput {
            read, headers, multilayer, offset_tables,
            current_layer: 0,
            options,
            sample_count_cache: HashMap::new(),
        })
    }

    /// All layer headers of this file.
    pub fn headers(&self) -> &[Header] { &self.headers }

    fn current_header(&self) -> &Header { &self.headers[self.current_layer] }

    /// Read the chunk with the specified increasing-y index of the current layer.
    fn read_chunk(&mut self, chunk_index: usize) -> Result<Chunk> {
        let offset = *self.offset_tables[self.current_layer].get(chunk_index)
            .ok_or_else(|| Error::corrupt("chunk index out of bounds"))?;

        if offset == 0 {
            return Err(Error::incomplete("chunk was never written"));
        }

        self.read.skip_to(u64_to_usize(offset, "chunk offset")?)?;
        let chunk = Chunk::read(&mut self.read, &self.headers, self.multilayer)?;

        if chunk.layer_index != self.current_layer {
            return Err(Error::corrupt("chunk belongs to a different layer"));
        }

        Ok(chunk)
    }

    /// Read a tile of a flat tiled image at any resolution level.
    ///
    /// Panics for tile or level indices outside the declared counts.
    pub fn read_tile(&mut self, tile: TileCoordinates, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let header = self.current_header().clone();
        let slice_indices = target.match_channels(&header.channels)?;

        let bounds = header.tile_bounds(tile); // panics out of range
        let lines = i32_to_usize(bounds.position.y() - header.data_window.position.y(), "tile bounds")?
            .. i32_to_usize(bounds.end().y() - header.data_window.position.y(), "tile bounds")?;

        let chunk_index = *chunk_index_lookup(&header).get(&tile)
            .expect("tile coordinate range checked above");

        let chunk = self.read_chunk(chunk_index)?;
        let block = UncompressedBlock::decompress_chunk(chunk, &self.headers)?;
        copy_block_into_frame_buffer(&block, &header, &slice_indices, &lines, target)
    }

    // geometry of a deep scan line chunk; deep tiles go through `read_deep_tile`
    fn deep_chunk_geometry(&self, chunk_index: usize) -> (usize, usize) {
        let header = self.current_header();
        let lines_per_chunk = header.scan_lines_per_chunk();
        let first_line = chunk_index * lines_per_chunk;
        let line_count = (header.data_size().height() - first_line).min(lines_per_chunk);
        (first_line, line_count)
    }

    /// Read one tile of a deep tiled image, returning its sample counts and
    /// decoded channels. The per-tile sample count table is self-contained,
    /// so no prior `read_pixel_sample_counts` call is needed here.
    ///
    /// Panics for tile or level indices outside the declared counts.
    pub fn read_deep_tile(&mut self, tile: TileCoordinates) -> Result<(Vec<u32>, Vec<DeepChannelData>)> {
        let header = self.current_header().clone();

        if !header.deep || !header.blocks.has_tiles() {
            return Err(Error::type_mismatch("not a deep tiled image"));
        }

        let _ = header.tile_bounds(tile); // panics out of range

        let chunk_index = *chunk_index_lookup(&header).get(&tile)
            .expect("tile coordinate range checked above");

        let chunk = self.read_chunk(chunk_index)?;
        let (counts, _, _) = decode_chunk_sample_counts(&header, &chunk)?;

        let (compressed_data, declared_size) = match &chunk.block {
            CompressedBlock::DeepTile(block) =>
                (&block.compressed_sample_data, block.decompressed_sample_data_size),
            _ => return Err(Error::corrupt("scan line chunk in deep tiled image")),
        };

        let expected_bytes: u64 = header.channels.list.iter()
            .map(|channel| deep::total_samples(&counts) * channel.sample_type.bytes_per_sample() as u64)
            .sum();

        if declared_size as u64 != expected_bytes {
            return Err(Error::corrupt("deep chunk size disagrees with sample count table"));
        }

        let data = header.compression.decompress_bytes(compressed_data.clone(), declared_size)?;
        let channels = deep::unpack_deep_samples(&data, &header.channels, &counts)?;

        Ok((counts, channels))
    }
}

/// Decode the sample count table of one deep chunk,
/// returning the counts and the chunk's width.
fn decode_chunk_sample_counts(header: &Header, chunk: &Chunk) -> Result<(Vec<u32>, usize, usize)> {
    match &chunk.block {
        CompressedBlock::DeepScanLine(block) => {
            let y = i32_to_usize(block.y_coordinate - header.data_window.position.y(), "deep chunk y coordinate")?;
            if y >= header.data_size().height() {
                return Err(Error::corrupt("deep chunk y coordinate"));
            }

            let width = header.data_size().width();
            let line_count = (header.data_size().height() - y).min(header.scan_lines_per_chunk());

            let counts = deep::decompress_sample_count_table(
                header.compression, &block.compressed_sample_count_table, width, line_count,
            )?;

            Ok((counts, width, line_count))
        },

        CompressedBlock::DeepTile(block) => {
            let bounds = block.coordinates.to_data_indices(
                header.default_block_pixel_size(), header.data_size(),
            )?;

            let counts = deep::decompress_sample_count_table(
                header.compression, &block.compressed_sample_count_table,
                bounds.size.width(), bounds.size.height(),
            )?;

            Ok((counts, bounds.size.width(), bounds.size.height()))
        },

        _ => Err(Error::corrupt("flat chunk in deep image")),
    }
}

/// Copy the lines of a decompressed flat block that overlap the requested
/// range into the frame buffer, skipping the rest of the block's bytes.
fn copy_block_into_frame_buffer(
    block: &UncompressedBlock, header: &Header,
    slice_indices: &[usize], lines: &Range<usize>,
    target: &mut FrameBufferMut<'_>,
) -> UnitResult
{
    let mut remaining = block.data.as_slice();
    let width = block.index.pixel_size.width();
    let line_bytes = width * header.channels.bytes_per_pixel;

    for line in 0 .. block.index.pixel_size.height() {
        let y = block.index.pixel_position.y() + line;

        if y < lines.start || y >= lines.end {
            // chunk lines outside the requested range are not part of the
            // caller's frame buffer contract, skip their bytes
            remaining = &remaining[line_bytes ..];
            continue;
        }

        for (channel, &slice_index) in header.channels.list.iter().zip(slice_indices) {
            for x in 0 .. width {
                let position = Vec2(block.index.pixel_position.x() + x, y);

                let sample = match channel.sample_type {
                    SampleType::F16 => Sample::F16(f16::read_le(&mut remaining)?),
                    SampleType::F32 => Sample::F32(f32::read_le(&mut remaining)?),
                    SampleType::U32 => Sample::U32(u32::read_le(&mut remaining)?),
                    SampleType::U8 => Sample::U8(u8::read_le(&mut remaining)?),
                    SampleType::U16 => Sample::U16(u16::read_le(&mut remaining)?),
                };

                target.set_sample(slice_index, position, sample);
            }
        }
    }

    Ok(())
}

impl<R: Read + Seek> ImageInput for ExrInput<R> {

    fn format_name(&self) -> &'static str { "exr" }

    fn header(&self) -> &Header { self.current_header() }

    fn subimage_count(&self) -> usize { self.headers.len() }

    fn select_subimage(&mut self, index: usize) -> UnitResult {
        if index < self.headers.len() {
            self.current_layer = index;
            Ok(())
        }
        else {
            Err(Error::unsupported("layer index out of bounds"))
        }
    }

    fn is_complete(&self) -> bool {
        self.offset_tables.iter()
            .all(|table| table.iter().all(|&offset| offset != 0))
    }

    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let header = self.current_header().clone();

        if header.deep {
            return Err(Error::type_mismatch("deep image read as flat pixels"));
        }

        let slice_indices = target.match_channels(&header.channels)?;

        // read all chunks sequentially so no two tasks interleave a seek
        // and a read, then decompress them on the thread pool
        let chunks: Vec<Result<Chunk>> = chunks_for_lines(&header, &lines)
            .map(|chunk_index| self.read_chunk(chunk_index))
            .collect();

        let headers = self.headers.clone();
        let blocks = map_maybe_parallel(chunks, self.options.parallel, move |chunk| {
            UncompressedBlock::decompress_chunk(chunk?, &headers)
        });

        // a corrupt chunk must not discard the chunks that already decoded;
        // apply every successful block, then report the first failure
        let mut first_error = None;

        for block in blocks {
            match block {
                Ok(block) => copy_block_into_frame_buffer(&block, &header, &slice_indices, &lines, target)?,
                Err(error) => { first_error.get_or_insert(error); },
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn read_pixel_sample_counts(&mut self, lines: Range<usize>, counts: &mut [u32]) -> UnitResult {
        let header = self.current_header().clone();

        if !header.deep {
            return Err(Error::type_mismatch("flat image read as deep"));
        }

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("use read_deep_tile for deep tiled images"));
        }

        let width = header.data_size().width();
        assert_eq!(
            counts.len(), width * lines.len(),
            "sample count slice does not match the requested range"
        );

        let chunk_range = chunks_for_lines(&header, &lines);
        let mut first_error = None;

        for chunk_index in chunk_range {
            let decoded = match self.read_chunk(chunk_index)
                .and_then(|chunk| decode_chunk_sample_counts(&header, &chunk))
            {
                Ok(decoded) => decoded,
                Err(error) => { first_error.get_or_insert(error); continue; },
            };

            let (chunk_counts, chunk_width, line_count) = decoded;
            let (first_line, _) = self.deep_chunk_geometry(chunk_index);
            debug_assert_eq!(chunk_width, width, "deep tile width bug");

            // copy the overlap into the caller's slice
            for chunk_line in 0 .. line_count {
                let y = first_line + chunk_line;
                if y < lines.start || y >= lines.end { continue; }

                let target_start = (y - lines.start) * width;
                counts[target_start .. target_start + width]
                    .copy_from_slice(&chunk_counts[chunk_line * width .. (chunk_line + 1) * width]);
            }

            self.sample_count_cache.insert((self.current_layer, chunk_index), chunk_counts);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn read_deep_pixels(&mut self, lines: Range<usize>, target: &mut DeepFrameBuffer) -> UnitResult {
        let header = self.current_header().clone();

        if !header.deep {
            return Err(Error::type_mismatch("flat image read as deep"));
        }

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("use read_deep_tile for deep tiled images"));
        }

        assert_eq!(
            target.size(), Vec2(header.data_size().width(), lines.len()),
            "deep frame buffer does not match the requested range"
        );

        let chunk_range = chunks_for_lines(&header, &lines);

        // the sample counts must be valid before any offset can be computed
        for chunk_index in chunk_range.clone() {
            if !self.sample_count_cache.contains_key(&(self.current_layer, chunk_index)) {
                return Err(Error::corrupt("sample counts were not read before the pixel payload"));
            }
        }

        let chunks: Vec<(usize, Result<Chunk>)> = chunk_range
            .map(|chunk_index| (chunk_index, self.read_chunk(chunk_index)))
            .collect();

        let current_layer = self.current_layer;
        let cache = &self.sample_count_cache;
        let header_ref = &header;

        let decoded = map_maybe_parallel(
            chunks, self.options.parallel,
            move |(chunk_index, chunk)| -> Result<(usize, Vec<DeepChannelData>)> {
                let chunk = chunk?;
                let counts = &cache[&(current_layer, chunk_index)];

                let (compressed_data, declared_size) = match &chunk.block {
                    CompressedBlock::DeepScanLine(block) =>
                        (&block.compressed_sample_data, block.decompressed_sample_data_size),
                    CompressedBlock::DeepTile(block) =>
                        (&block.compressed_sample_data, block.decompressed_sample_data_size),
                    _ => return Err(Error::corrupt("flat chunk in deep image")),
                };

                let expected_bytes: u64 = header_ref.channels.list.iter()
                    .map(|channel| deep::total_samples(counts) * channel.sample_type.bytes_per_sample() as u64)
                    .sum();

                if declared_size as u64 != expected_bytes {
                    return Err(Error::corrupt("deep chunk size disagrees with sample count table"));
                }

                let data = header_ref.compression
                    .decompress_bytes(compressed_data.clone(), declared_size)?;

                let channels = deep::unpack_deep_samples(&data, &header_ref.channels, counts)?;
                Ok((chunk_index, channels))
            },
        );

        let mut first_error = None;

        for result in decoded {
            match result {
                Ok((chunk_index, channels)) => {
                    let (first_line, line_count) = self.deep_chunk_geometry(chunk_index);
                    let counts = &self.sample_count_cache[&(self.current_layer, chunk_index)];

                    target.insert_chunk_lines(
                        counts, &channels,
                        first_line as i64 - lines.start as i64, line_count,
                    )?;
                },

                Err(error) => { first_error.get_or_insert(error); },
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn raw_chunk_data(&mut self, chunk_index: usize, buffer: &mut [u8]) -> Result<usize> {
        let chunk = self.read_chunk(chunk_index)?;

        let layer_index_size = if self.multilayer { i32::BYTE_SIZE } else { 0 };
        let required_size = chunk.byte_size() + layer_index_size;

        if buffer.len() >= required_size {
            let mut cursor = Cursor::new(&mut buffer[.. required_size]);
            chunk.write(&mut cursor, self.headers.len())?;
        }

        Ok(required_size)
    }
}


/// A file of this format being written.
#[derive(Debug)]
pub struct ExrOutput<W: Write + Seek> {
    write: Tracking<W>,
    headers: Headers,
    options: WriteOptions,
    current_layer: usize,

    /// One offset table per layer, filled as chunks are committed.
    offset_tables: Vec<OffsetTable>,

    /// Byte position of the first offset table entry.
    table_position: usize,

    /// Byte position of the `maxSamplesPerPixel` value per deep layer.
    max_samples_positions: Vec<Option<usize>>,

    /// Largest per-pixel sample count written so far, per layer.
    max_samples_written: Vec<usize>,

    /// Chunk index lookup for tiled layers.
    tile_indices: Vec<Option<HashMap<TileCoordinates, usize>>>,

    closed: bool,
}

impl ExrOutput<BufWriter<File>> {

    /// Create a single-layer file at the specified path.
    pub fn create_path(path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Self> {
        Self::create(BufWriter::new(File::create(path)?), smallvec::smallvec![header], options)
    }
}

impl<W: Write + Seek> ExrOutput<W> {

    /// Write the headers and a zeroed offset table, ready for chunk data.
    pub fn create(writer: W, headers: Headers, options: WriteOptions) -> Result<Self> {
        if headers.is_empty() {
            return Err(Error::unsupported("at least one layer is required"));
        }

        for header in &headers {
            header.validate()?;

            if header.line_order == LineOrder::Decreasing {
                return Err(Error::unsupported("decreasing line order writing"));
            }
        }

        let multilayer = headers.len() > 1;
        let mut write = Tracking::new(writer);

        magic_number::write(&mut write)?;

        let mut version = FORMAT_VERSION as u32;
        let any_deep = headers.iter().any(|header| header.deep);
        version.set_bit(FLAG_DEEP, any_deep);
        version.set_bit(FLAG_MULTIPART, multilayer);
        version.set_bit(
            FLAG_SINGLE_TILED,
            !multilayer && !any_deep && headers[0].blocks.has_tiles(),
        );

        (version as i32).write_le(&mut write)?;

        let mut max_samples_positions = Vec::with_capacity(headers.len());
        for header in &headers {
            let header_start = write.byte_position();
            let relative_position = write_header(&mut write, header, multilayer)?;
            max_samples_positions.push(relative_position.map(|position| header_start + position));
        }

        if multilayer {
            sequence_end::write(&mut write)?;
        }

        let table_position = write.byte_position();

        // reserve the offset tables, patched as each chunk is committed
        for header in &headers {
            for _ in 0 .. header.chunk_count {
                0_u64.write_le(&mut write)?;
            }
        }

        let offset_tables = headers.iter()
            .map(|header| vec![0_u64; header.chunk_count])
            .collect();

        let tile_indices = headers.iter()
            .map(|header| {
                if header.blocks.has_tiles() { Some(chunk_index_lookup(header)) }
                else { None }
            })
            .collect();

        let max_samples_written = vec![0; headers.len()];

        Ok(ExrOutput {
            write, headers, options,
            current_layer: 0,
            offset_tables,
            table_position,
            max_samples_positions,
            max_samples_written,
            tile_indices,
            closed: false,
        })
    }

    /// Select the layer that subsequent write calls encode into.
    pub fn select_layer(&mut self, index: usize) -> UnitResult {
        if index < self.headers.len() {
            self.current_layer = index;
            Ok(())
        }
        else {
            Err(Error::unsupported("layer index out of bounds"))
        }
    }

    fn current_header(&self) -> &Header { &self.headers[self.current_layer] }

    /// Append one encoded chunk and record its offset.
    /// A chunk may never be written twice; its offset is committed once.
    fn commit_chunk(&mut self, chunk_index: usize, chunk: Chunk) -> UnitResult {
        let table = &mut self.offset_tables[self.current_layer];

        let entry = table.get_mut(chunk_index)
            .ok_or_else(|| Error::corrupt("chunk index out of bounds"))?;

        if *entry != 0 {
            return Err(Error::unsupported("chunk was already written"));
        }

        *entry = self.write.byte_position() as u64;
        chunk.write(&mut self.write, self.headers.len())
    }

    /// Write one tile of a flat tiled image at any resolution level.
    ///
    /// Panics for tile or level indices outside the declared counts.
    pub fn write_tile(&mut self, tile: TileCoordinates, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.current_header().clone();
        let slice_indices = source.match_channels(&header.channels)?;

        let bounds = header.tile_bounds(tile); // panics out of range
        let position = (bounds.position - header.data_window.position).to_usize("tile bounds")?;

        let index = BlockIndex {
            layer: self.current_layer,
            pixel_position: position,
            pixel_size: bounds.size,
            level: tile.level_index,
        };

        let data = extract_block_from_frame_buffer(&header, &slice_indices, index, source)?;
        let chunk = UncompressedBlock { index, data }.compress_to_chunk(&self.headers)?;

        let chunk_index = *self.tile_indices[self.current_layer]
            .as_ref().expect("tile lookup for tiled header bug")
            .get(&tile).expect("tile coordinate range checked above");

        self.commit_chunk(chunk_index, chunk)
    }
}

/// Serialize the block's pixel range from the frame buffer
/// into the flat chunk byte layout.
fn extract_block_from_frame_buffer(
    header: &Header, slice_indices: &[usize],
    index: BlockIndex, source: &FrameBuffer<'_>,
) -> Result<Vec<u8>>
{
    let mut data = Vec::with_capacity(index.pixel_size.area() * header.channels.bytes_per_pixel);

    for line in 0 .. index.pixel_size.height() {
        let y = index.pixel_position.y() + line;

        for (channel, &slice_index) in header.channels.list.iter().zip(slice_indices) {
            for x in 0 .. index.pixel_size.width() {
                let position = Vec2(index.pixel_position.x() + x, y);
                let sample = source.sample(slice_index, position)
                    .convert_to(channel.sample_type);

                match sample {
                    Sample::F16(value) => value.write_le(&mut data)?,
                    Sample::F32(value) => value.write_le(&mut data)?,
                    Sample::U32(value) => value.write_le(&mut data)?,
                    Sample::U8(value) => value.write_le(&mut data)?,
                    Sample::U16(value) => value.write_le(&mut data)?,
                }
            }
        }
    }

    Ok(data)
}

impl<W: Write + Seek> ImageOutput for ExrOutput<W> {

    fn format_name(&self) -> &'static str { "exr" }

    fn header(&self) -> &Header { self.current_header() }

    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.current_header().clone();

        if header.deep {
            return Err(Error::type_mismatch("deep image written as flat pixels"));
        }

        let slice_indices = source.match_channels(&header.channels)?;
        let lines_per_chunk = header.scan_lines_per_chunk();

        // chunks are encoded whole; the range must cover them exactly
        if lines.start % lines_per_chunk != 0
            || (lines.end % lines_per_chunk != 0 && lines.end != header.data_size().height())
        {
            return Err(Error::unsupported("scan line range splits a chunk"));
        }

        if let Blocks::Tiles(tiles) = header.blocks {
            if tiles.level_mode != LevelMode::Singular {
                return Err(Error::unsupported("use write_tile for images with levels"));
            }
        }

        // build all block indices covered by this range, at level zero
        let chunk_range = chunks_for_lines(&header, &lines);
        let indices: Vec<(usize, BlockIndex)> = match header.blocks {
            Blocks::ScanLines => chunk_range.clone().map(|chunk_index| {
                let first_line = chunk_index * lines_per_chunk;
                let height = (header.data_size().height() - first_line).min(lines_per_chunk);

                (chunk_index, BlockIndex {
                    layer: self.current_layer,
                    pixel_position: Vec2(0, first_line),
                    pixel_size: Vec2(header.data_size().width(), height),
                    level: Vec2(0, 0),
                })
            }).collect(),

            Blocks::Tiles(_) => {
                let tiles_x = header.tile_count(Vec2(0, 0)).x();

                chunk_range.clone().map(|chunk_index| {
                    let tile = TileCoordinates {
                        tile_index: Vec2(chunk_index % tiles_x, chunk_index / tiles_x),
                        level_index: Vec2(0, 0),
                    };

                    let bounds = header.tile_bounds(tile);
                    let position = (bounds.position - header.data_window.position)
                        .to_usize("tile bounds").expect("tile bounds sign bug");

                    (chunk_index, BlockIndex {
                        layer: self.current_layer,
                        pixel_position: position,
                        pixel_size: bounds.size,
                        level: Vec2(0, 0),
                    })
                }).collect()
            },
        };

        // extract all block bytes first, then compress on the thread pool,
        // then commit sequentially so every offset is written exactly once
        let blocks: Vec<Result<(usize, UncompressedBlock)>> = indices.into_iter()
            .map(|(chunk_index, index)| {
                let data = extract_block_from_frame_buffer(&header, &slice_indices, index, source)?;
                Ok((chunk_index, UncompressedBlock { index, data }))
            })
            .collect();

        let headers = self.headers.clone();
        let compressed: Vec<Result<(usize, Chunk)>> = map_maybe_parallel(blocks, self.options.parallel, move |block| {
            let (chunk_index, block) = block?;
            Ok((chunk_index, block.compress_to_chunk(&headers)?))
        });

        for result in compressed {
            let (chunk_index, chunk): (usize, Chunk) = result?;
            self.commit_chunk(chunk_index, chunk)?;
        }

        Ok(())
    }

    fn write_deep_pixels(&mut self, lines: Range<usize>, source: &DeepFrameBuffer) -> UnitResult {
        let header = self.current_header().clone();

        if !header.deep {
            return Err(Error::type_mismatch("flat image written as deep"));
        }

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("deep tile writing through the scan line interface"));
        }

        assert_eq!(
            source.size(), Vec2(header.data_size().width(), lines.len()),
            "deep frame buffer does not match the written range"
        );

        let width = header.data_size().width();
        let lines_per_chunk = header.scan_lines_per_chunk();

        if lines.start % lines_per_chunk != 0
            || (lines.end % lines_per_chunk != 0 && lines.end != header.data_size().height())
        {
            return Err(Error::unsupported("scan line range splits a chunk"));
        }

        let chunk_range = chunks_for_lines(&header, &lines);

        // extract and compress each chunk on the thread pool
        let extracted: Vec<(usize, Vec<u32>, Vec<DeepChannelData>)> = chunk_range
            .map(|chunk_index| {
                let first_line = chunk_index * lines_per_chunk;
                let line_count = (header.data_size().height() - first_line).min(lines_per_chunk);

                let (counts, channels) = source
                    .extract_chunk_lines(first_line - lines.start, line_count);

                (chunk_index, counts, channels)
            })
            .collect();

        for (_, counts, _) in &extracted {
            let max = counts.iter().map(|&count| count as usize).max().unwrap_or(0);
            let written = &mut self.max_samples_written[self.current_layer];
            *written = (*written).max(max);
        }

        let header_ref = &header;
        let compressed = map_maybe_parallel(
            extracted, self.options.parallel,
            move |(chunk_index, counts, channels)| -> Result<(usize, CompressedDeepScanLineBlock)> {
                let first_line = chunk_index * lines_per_chunk;
                let line_count = counts.len() / width;

                let table = deep::compress_sample_count_table(
                    header_ref.compression, &counts, width, line_count,
                )?;

                let data = deep::pack_deep_samples(&channels)?;
                let decompressed_sample_data_size = data.len();
                let compressed_data = header_ref.compression.compress_bytes(data)?;

                Ok((chunk_index, CompressedDeepScanLineBlock {
                    y_coordinate: usize_to_i32(first_line, "deep chunk y")?
                        + header_ref.data_window.position.y(),
                    decompressed_sample_data_size,
                    compressed_sample_count_table: table,
                    compressed_sample_data: compressed_data,
                }))
            },
        );

        for result in compressed {
            let (chunk_index, block) = result?;

            self.commit_chunk(chunk_index, Chunk {
                layer_index: self.current_layer,
                block: CompressedBlock::DeepScanLine(block),
            })?;
        }

        Ok(())
    }

    fn close(&mut self) -> UnitResult {
        if self.closed {
            return Err(Error::unsupported("output was already closed"));
        }

        self.closed = true;

        // patch the reserved offset tables with the actual chunk positions
        let mut entry_position = self.table_position;

        for table in &self.offset_tables {
            for &offset in table {
                self.write.seek_write_to(entry_position)?;
                offset.write_le(&mut self.write)?;
                entry_position += u64::BYTE_SIZE;
            }
        }

        // patch the maximum sample count of each deep layer
        for (layer, position) in self.max_samples_positions.clone().into_iter().enumerate() {
            if let Some(position) = position {
                self.write.seek_write_to(position)?;
                usize_to_i32(self.max_samples_written[layer], "max samples per pixel")?
                    .write_le(&mut self.write)?;
            }
        }

        self.write.flush()?;
        Ok(())
    }
}
