
//! The Maya IFF codec.
//!
//! The file is a tree of tagged chunks: a 4-byte tag followed by a big
//! endian `u32` payload length, padded to a 4-byte boundary. The root
//! `FOR4`/`CIMG` group holds a fixed `TBHD` bitmap header, optional
//! `AUTH` and `DATE` text chunks, and a nested `FOR4`/`TBMP` group with
//! one `RGBA` chunk per tile. Unknown chunks are skipped, a missing
//! `TBHD` is fatal.
//!
//! Tile payloads store rows bottom-up. Each channel is run-length
//! encoded per byte-significance plane; a tile whose encoding would have
//! grown is stored raw instead, which the reader detects by the chunk
//! length equaling the raw size.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek};
use std::ops::Range;
use std::path::Path;

use smallvec::SmallVec;

use crate::io::*;
use crate::math::{Vec2, RoundingMode};
use crate::meta::{Header, Blocks, TileIndices};
use crate::meta::attribute::*;
use crate::compress::{self, rle, Compression};
use crate::block::map_maybe_parallel;
use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample};
use crate::convert::flip_rows;
use crate::format::{FormatEntry, ImageInput, ImageOutput, ReadOptions, WriteOptions};
use crate::error::*;

/// Tile edge length. Partial tiles occur at the right and top edges.
pub const TILE_SIZE: usize = 64;

/// Repeats must be at least this long to pay off over a literal run.
const MIN_RUN: usize = 3;

// chunk tags
const TAG_FOR4: &[u8; 4] = b"FOR4";
const TAG_CIMG: &[u8; 4] = b"CIMG";
const TAG_TBHD: &[u8; 4] = b"TBHD";
const TAG_AUTH: &[u8; 4] = b"AUTH";
const TAG_DATE: &[u8; 4] = b"DATE";
const TAG_TBMP: &[u8; 4] = b"TBMP";
const TAG_RGBA: &[u8; 4] = b"RGBA";

// TBHD flags
const FLAG_RGB: u32 = 1;
const FLAG_ALPHA: u32 = 2;

// TBHD compression codes
const COMPRESSION_NONE: u32 = 0;
const COMPRESSION_RLE: u32 = 1;

/// The registry entry for this format.
pub fn format_entry() -> FormatEntry {
    FormatEntry {
        name: "iff",
        extensions: &["iff", "tdi"],
        matches_magic: |bytes| &bytes[.. 4] == TAG_FOR4 && &bytes[8 .. 12] == TAG_CIMG,
        open: |path, options| Ok(Box::new(IffInput::open(path, options)?)),
        create: |path, header, options| Ok(Box::new(IffOutput::create_path(path, header, options)?)),
    }
}


fn read_tag(read: &mut impl Read) -> Result<[u8; 4]> {
    let mut tag = [0_u8; 4];
    u8::read_slice_le(read, &mut tag)?;
    Ok(tag)
}

/// Byte count of the alignment padding after a chunk payload.
fn alignment_padding(payload_size: usize) -> usize {
    (4 - payload_size % 4) % 4
}

/// The fixed bitmap header chunk.
#[derive(Debug, Clone, Copy)]
struct BitmapHeader {
    width: usize,
    height: usize,
    has_alpha: bool,
    bytes_per_sample_flag: u16,
    tile_count: usize,
    compression: Compression,
}

impl BitmapHeader {
    fn read(read: &mut impl Read, payload_size: usize) -> Result<Self> {
        if payload_size != 24 && payload_size != 32 {
            return Err(Error::malformed("bitmap header chunk size"));
        }

        let width = u32::read_be(read)? as usize;
        let height = u32::read_be(read)? as usize;
        let _aspect_numerator = u16::read_be(read)?;
        let _aspect_denominator = u16::read_be(read)?;
        let flags = u32::read_be(read)?;
        let bytes_per_sample_flag = u16::read_be(read)?;
        let tile_count = u16::read_be(read)? as usize;
        let compression = u32::read_be(read)?;

        if payload_size == 32 {
            let _x_origin = u32::read_be(read)?;
            let _y_origin = u32::read_be(read)?;
        }

        if width == 0 || height == 0 || width > 65536 || height > 65536 {
            return Err(Error::malformed("image dimensions"));
        }

        if flags & FLAG_RGB == 0 {
            return Err(Error::unsupported("image without rgb channels"));
        }

        if bytes_per_sample_flag > 1 {
            return Err(Error::malformed("unsupported bit depth"));
        }

        let compression = match compression {
            COMPRESSION_NONE => Compression::Uncompressed,
            COMPRESSION_RLE => Compression::Rle,
            _ => return Err(Error::malformed("unsupported compression code")),
        };

        let expected_tiles =
            crate::meta::compute_block_count(width, TILE_SIZE)
            * crate::meta::compute_block_count(height, TILE_SIZE);

        if tile_count != expected_tiles {
            return Err(Error::malformed("tile count disagrees with image size"));
        }

        Ok(BitmapHeader {
            width, height,
            has_alpha: flags & FLAG_ALPHA != 0,
            bytes_per_sample_flag,
            tile_count,
            compression,
        })
    }

    fn write(&self, write: &mut impl Write) -> UnitResult {
        (self.width as u32).write_be(write)?;
        (self.height as u32).write_be(write)?;
        1_u16.write_be(write)?; // pixel aspect numerator
        1_u16.write_be(write)?; // pixel aspect denominator

        let mut flags = FLAG_RGB;
        if self.has_alpha { flags |= FLAG_ALPHA; }
        flags.write_be(write)?;

        self.bytes_per_sample_flag.write_be(write)?;
        (self.tile_count as u16).write_be(write)?;

        match self.compression {
            Compression::Uncompressed => COMPRESSION_NONE.write_be(write)?,
            Compression::Rle => COMPRESSION_RLE.write_be(write)?,
            other => return Err(Error::unsupported(format!("{} in this format", other))),
        }

        Ok(())
    }

    fn sample_type(&self) -> SampleType {
        if self.bytes_per_sample_flag == 0 { SampleType::U8 } else { SampleType::U16 }
    }

    fn to_header(&self, owner: Option<Text>, capture_date: Option<Text>) -> Result<Header> {
        let mut channels: SmallVec<[ChannelDescription; 5]> = smallvec::smallvec![
            ChannelDescription::new("R", self.sample_type()),
            ChannelDescription::new("G", self.sample_type()),
            ChannelDescription::new("B", self.sample_type()),
        ];

        if self.has_alpha {
            channels.push(ChannelDescription::new("A", self.sample_type()));
        }

        let mut header = Header::new(Vec2(self.width, self.height), ChannelList::new(channels))
            .with_encoding(
                self.compression,
                Blocks::Tiles(TileDescription {
                    tile_size: Vec2(TILE_SIZE, TILE_SIZE),
                    level_mode: LevelMode::Singular,
                    rounding_mode: RoundingMode::Down,
                }),
                LineOrder::Unspecified,
            );

        if self.has_alpha {
            header.alpha_mode = Some(AlphaMode::Unassociated);
        }

        header.owner = owner;
        header.capture_date = capture_date;
        header.validate()?;
        Ok(header)
    }
}


/// Location of one tile's chunk within the file.
#[derive(Debug, Clone, Copy)]
struct TileRecord {

    /// Pixel bounds relative to the data window, top-down rows.
    bounds_position: Vec2<usize>,
    bounds_size: Vec2<usize>,

    /// File position of the payload behind the tile bounds fields.
    payload_offset: usize,

    /// Payload byte count, excluding the bounds fields.
    payload_size: usize,
}

/// Encode one tile: rows bottom-up, each channel's byte planes
/// run-length encoded, raw fallback when encoding would grow the tile.
fn encode_tile(
    pixels: &[u8], size: Vec2<usize>,
    channels: usize, bytes_per_sample: usize,
    compression: Compression,
) -> Vec<u8>
{
    debug_assert_eq!(pixels.len(), size.area() * channels * bytes_per_sample, "tile byte count bug");

    let mut bottom_up = pixels.to_vec();
    flip_rows(&mut bottom_up, size.width() * channels * bytes_per_sample);

    if compression == Compression::Uncompressed {
        return bottom_up;
    }

    // one plane per channel and byte significance, most significant first
    let mut encoded = Vec::with_capacity(bottom_up.len() / 2);
    let pixel_stride = channels * bytes_per_sample;

    for channel in 0 .. channels {
        let channel_bytes: Vec<u8> = bottom_up
            .chunks_exact(pixel_stride)
            .flat_map(|pixel| &pixel[channel * bytes_per_sample .. (channel + 1) * bytes_per_sample])
            .copied()
            .collect();

        let planes = compress::separate_planes(&channel_bytes, bytes_per_sample);
        let plane_size = size.area();

        for plane in planes.chunks_exact(plane_size) {
            encoded.extend_from_slice(&rle::encode(plane, MIN_RUN));
        }
    }

    // store raw whenever compression does not pay off
    if encoded.len() < bottom_up.len() { encoded } else { bottom_up }
}

/// Decode one tile into interleaved top-down rows.
fn decode_tile(
    payload: &[u8], size: Vec2<usize>,
    channels: usize, bytes_per_sample: usize,
    compression: Compression,
) -> Result<Vec<u8>>
{
    let raw_size = size.area() * channels * bytes_per_sample;

    let mut bottom_up = if payload.len() == raw_size || compression == Compression::Uncompressed {
        if payload.len() != raw_size {
            return Err(Error::corrupt("tile payload size mismatch"));
        }

        payload.to_vec()
    }
    else {
        let mut remaining = payload;
        let plane_size = size.area();
        let pixel_stride = channels * bytes_per_sample;
        let mut pixels = vec![0_u8; raw_size];

        for channel in 0 .. channels {
            let mut planes = Vec::with_capacity(bytes_per_sample * plane_size);

            for _plane in 0 .. bytes_per_sample {
                planes.append(&mut rle::decode_consuming(&mut remaining, plane_size)?);
            }

            let channel_bytes = compress::interleave_planes(&planes, bytes_per_sample);

            for (pixel_index, sample) in channel_bytes.chunks_exact(bytes_per_sample).enumerate() {
                let start = pixel_index * pixel_stride + channel * bytes_per_sample;
                pixels[start .. start + bytes_per_sample].copy_from_slice(sample);
            }
        }

        pixels
    };

    flip_rows(&mut bottom_up, size.width() * channels * bytes_per_sample);
    Ok(bottom_up)
}


/// An open IFF file, for reading.
#[derive(Debug)]
pub struct IffInput<R> {
    read: Tracking<R>,
    header: Header,
    options: ReadOptions,

    /// One record per tile found in the bitmap group,
    /// ordered as they appear in the file.
    tiles: Vec<TileRecord>,

    /// Declared tile count from the bitmap header.
    declared_tile_count: usize,
}

impl IffInput<BufReader<File>> {

    /// Open the file at the specified path.
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?), options)
    }
}

impl<R: Read + Seek> IffInput<R> {

    /// Walk the chunk tree, collecting the bitmap header and tile locations.
    pub fn read(reader: R, options: ReadOptions) -> Result<Self> {
        let mut read = Tracking::new(reader);

        if &read_tag(&mut read)? != TAG_FOR4 {
            return Err(Error::malformed("file identifier missing"));
        }

        let root_size = u32::read_be(&mut read)? as usize;

        if &read_tag(&mut read)? != TAG_CIMG {
            return Err(Error::malformed("not a bitmap file"));
        }

        let root_end = read.byte_position() + root_size - 4;

        let mut bitmap: Option<BitmapHeader> = None;
        let mut owner = None;
        let mut capture_date = None;
        let mut tiles = Vec::new();

        // walk the chunk list: parse known tags, skip unknown ones,
        // re-align to a 4-byte boundary after every payload
        while read.byte_position() + 8 <= root_end {
            let tag = read_tag(&mut read)?;
            let payload_size = u32::read_be(&mut read)? as usize;
            let payload_end = read.byte_position() + payload_size;

            match &tag {
                TAG_TBHD => bitmap = Some(BitmapHeader::read(&mut read, payload_size)?),

                // absurdly long text chunks are skipped like unknown chunks
                TAG_AUTH if payload_size <= 4096 => {
                    let text = Text::read_fixed(&mut read, payload_size)?;
                    owner = if text.is_empty() { None } else { Some(text) };
                },

                TAG_DATE if payload_size <= 4096 => {
                    let text = Text::read_fixed(&mut read, payload_size)?;
                    capture_date = if text.is_empty() { None } else { Some(text) };
                },

                TAG_FOR4 => {
                    let group_tag = read_tag(&mut read)?;

                    if &group_tag == TAG_TBMP {
                        let bitmap = bitmap
                            .ok_or_else(|| Error::malformed("bitmap group before bitmap header"))?;

                        Self::collect_tiles(&mut read, payload_end, &bitmap, &mut tiles)?;
                    }
                    // unknown groups are skipped like any other chunk
                },

                // unknown chunks (for example z-buffer data) are skipped
                _ => {},
            }

            read.seek_read_to(payload_end + alignment_padding(payload_size))?;
        }

        // the bitmap header is structurally required
        let bitmap = bitmap.ok_or_else(|| Error::malformed("missing bitmap header chunk"))?;
        let header = bitmap.to_header(owner, capture_date)?;

        Ok(IffInput {
            read, header, options, tiles,
            declared_tile_count: bitmap.tile_count,
        })
    }

    /// Collect the tile chunks of the bitmap group.
    fn collect_tiles(
        read: &mut Tracking<R>, group_end: usize,
        bitmap: &BitmapHeader, tiles: &mut Vec<TileRecord>,
    ) -> UnitResult
    {
        while read.byte_position() + 8 <= group_end {
            let tag = read_tag(read)?;
            let payload_size = u32::read_be(read)? as usize;
            let payload_end = read.byte_position() + payload_size;

            if &tag == TAG_RGBA {
                if payload_size < 8 {
                    return Err(Error::corrupt("tile chunk too small"));
                }

                // a tile payload is never larger than its raw pixels,
                // as encoding falls back to raw storage when it would grow
                let max_payload = 8 + TILE_SIZE * TILE_SIZE * 4 * 2;
                if payload_size > max_payload {
                    return Err(Error::corrupt("tile chunk exceeds maximum size"));
                }

                // tile bounds: inclusive, y measured from the bottom row
                let x1 = u16::read_be(read)? as usize;
                let y1 = u16::read_be(read)? as usize;
                let x2 = u16::read_be(read)? as usize;
                let y2 = u16::read_be(read)? as usize;

                if x2 < x1 || y2 < y1 || x2 >= bitmap.width || y2 >= bitmap.height {
                    return Err(Error::corrupt("tile bounds out of image"));
                }

                let size = Vec2(x2 - x1 + 1, y2 - y1 + 1);

                tiles.push(TileRecord {
                    bounds_position: Vec2(x1, bitmap.height - 1 - y2), // flip to top-down
                    bounds_size: size,
                    payload_offset: read.byte_position(),
                    payload_size: payload_size - 8,
                });
            }

            read.seek_read_to(payload_end + alignment_padding(payload_size))?;
        }

        Ok(())
    }

    fn layout(&self) -> (usize, usize) {
        let channels = self.header.channels.list.len();
        let bytes_per_sample = self.header.channels.list[0].sample_type.bytes_per_sample();
        (channels, bytes_per_sample)
    }

    /// Read the payload bytes of one tile record.
    fn read_tile_payload(&mut self, record: TileRecord) -> Result<Vec<u8>> {
        self.read.seek_read_to(record.payload_offset)?;

        let mut payload = vec![0_u8; record.payload_size];
        u8::read_slice_le(&mut self.read, &mut payload)?;
        Ok(payload)
    }
}

impl<R: Read + Seek> ImageInput for IffInput<R> {

    fn format_name(&self) -> &'static str { "iff" }

    fn header(&self) -> &Header { &self.header }

    fn is_complete(&self) -> bool {
        self.tiles.len() >= self.declared_tile_count
    }

    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let header = self.header.clone();
        let slice_indices = target.match_channels(&header.channels)?;

        let Vec2(_, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        let (channels, bytes_per_sample) = self.layout();

        // all tiles overlapping the requested lines
        let covering: Vec<TileRecord> = self.tiles.iter().copied()
            .filter(|tile| {
                let top = tile.bounds_position.y();
                let bottom = top + tile.bounds_size.height();
                top < lines.end && bottom > lines.start
            })
            .collect();

        let payloads: Vec<(TileRecord, Result<Vec<u8>>)> = covering.into_iter()
            .map(|record| { let payload = self.read_tile_payload(record); (record, payload) })
            .collect();

        let compression = header.compression;
        let decoded = map_maybe_parallel(payloads, self.options.parallel, move |(record, payload)| {
            let pixels = decode_tile(&payload?, record.bounds_size, channels, bytes_per_sample, compression)?;
            Ok((record, pixels))
        });

        let mut first_error = None;

        for result in decoded {
            let (record, pixels): (TileRecord, Vec<u8>) = match result {
                Ok(value) => value,
                Err(error) => { first_error.get_or_insert(error); continue; },
            };

            let row_bytes = record.bounds_size.width() * channels * bytes_per_sample;

            for tile_line in 0 .. record.bounds_size.height() {
                let y = record.bounds_position.y() + tile_line;
                if y < lines.start || y >= lines.end { continue; }

                let mut row = &pixels[tile_line * row_bytes .. (tile_line + 1) * row_bytes];

                for x in 0 .. record.bounds_size.width() {
                    let position = Vec2(record.bounds_position.x() + x, y);

                    for &slice_index in &slice_indices {
                        let sample = match header.channels.list[0].sample_type {
                            SampleType::U8 => Sample::U8(u8::read_le(&mut row)?),
                            SampleType::U16 => Sample::U16(u16::read_be(&mut row)?),
                            _ => return Err(Error::corrupt("channel type bug")),
                        };

                        target.set_sample(slice_index, position, sample);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn raw_chunk_data(&mut self, chunk_index: usize, buffer: &mut [u8]) -> Result<usize> {
        let record = *self.tiles.get(chunk_index)
            .ok_or_else(|| Error::corrupt("chunk index out of bounds"))?;

        let payload = self.read_tile_payload(record)?;

        if buffer.len() >= payload.len() {
            buffer[.. payload.len()].copy_from_slice(&payload);
        }

        Ok(payload.len())
    }
}


/// An IFF file being written.
#[derive(Debug)]
pub struct IffOutput<W: Write + Seek> {
    write: Tracking<W>,
    header: Header,
    options: WriteOptions,

    /// Byte positions of the two group length fields, patched on close.
    root_size_position: usize,
    bitmap_size_position: usize,

    /// Which tiles have been written so far, indexed in increasing y order.
    written_tiles: Vec<bool>,

    closed: bool,
}

impl IffOutput<BufWriter<File>> {

    /// Create a file at the specified path.
    pub fn create_path(path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Self> {
        Self::create(BufWriter::new(File::create(path)?), header, options)
    }
}

impl<W: Write + Seek> IffOutput<W> {

    /// Write the chunk headers, ready for tile data.
    pub fn create(writer: W, mut header: Header, options: WriteOptions) -> Result<Self> {
        // this format is always tiled with a fixed tile size
        let header_compression = header.compression;
        header = header.with_encoding(
            header_compression,
            Blocks::Tiles(TileDescription {
                tile_size: Vec2(TILE_SIZE, TILE_SIZE),
                level_mode: LevelMode::Singular,
                rounding_mode: RoundingMode::Down,
            }),
            LineOrder::Unspecified,
        );

        header.validate()?;

        let (sample_type, has_alpha) = {
            let names: Vec<&[u8]> = header.channels.list.iter()
                .map(|channel| channel.name.as_slice()).collect();

            let sample_type = header.channels.list[0].sample_type;

            if !header.channels.list.iter().all(|channel| channel.sample_type == sample_type) {
                return Err(Error::unsupported("mixed channel types in this format"));
            }

            match names.as_slice() {
                [b"R", b"G", b"B"] => (sample_type, false),
                [b"R", b"G", b"B", b"A"] => (sample_type, true),
                _ => return Err(Error::unsupported("channel set in this format")),
            }
        };

        let bytes_per_sample_flag = match sample_type {
            SampleType::U8 => 0_u16,
            SampleType::U16 => 1,
            _ => return Err(Error::unsupported("channel type in this format")),
        };

        let Vec2(width, height) = header.data_size();

        if width > u16::MAX as usize || height > u16::MAX as usize {
            return Err(Error::unsupported("image dimensions exceed 16 bits"));
        }

        let tile_count = header.chunk_count;
        if tile_count > u16::MAX as usize {
            return Err(Error::unsupported("too many tiles"));
        }

        let bitmap = BitmapHeader {
            width, height, has_alpha,
            bytes_per_sample_flag,
            tile_count,
            compression: header.compression,
        };

        let mut write = Tracking::new(writer);

        u8::write_slice_le(&mut write, TAG_FOR4)?;
        let root_size_position = write.byte_position();
        0_u32.write_be(&mut write)?; // patched on close
        u8::write_slice_le(&mut write, TAG_CIMG)?;

        u8::write_slice_le(&mut write, TAG_TBHD)?;
        24_u32.write_be(&mut write)?;
        bitmap.write(&mut write)?;

        if let Some(owner) = &header.owner {
            u8::write_slice_le(&mut write, TAG_AUTH)?;
            (owner.len() as u32).write_be(&mut write)?;
            u8::write_slice_le(&mut write, owner.as_slice())?;
            pad_to_alignment(&mut write, owner.len(), 4)?;
        }

        if let Some(date) = &header.capture_date {
            u8::write_slice_le(&mut write, TAG_DATE)?;
            (date.len() as u32).write_be(&mut write)?;
            u8::write_slice_le(&mut write, date.as_slice())?;
            pad_to_alignment(&mut write, date.len(), 4)?;
        }

        u8::write_slice_le(&mut write, TAG_FOR4)?;
        let bitmap_size_position = write.byte_position();
        0_u32.write_be(&mut write)?; // patched on close
        u8::write_slice_le(&mut write, TAG_TBMP)?;

        Ok(IffOutput {
            write, header, options,
            root_size_position,
            bitmap_size_position,
            written_tiles: vec![false; tile_count],
            closed: false,
        })
    }

    /// The increasing-y tile list of this image.
    fn tile_list(&self) -> Vec<TileIndices> {
        self.header.blocks_increasing_y_order().collect()
    }
}

impl<W: Write + Seek> ImageOutput for IffOutput<W> {

    fn format_name(&self) -> &'static str { "iff" }

    fn header(&self) -> &Header { &self.header }

    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.header.clone();
        let slice_indices = source.match_channels(&header.channels)?;

        let Vec2(_, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        if lines.start % TILE_SIZE != 0 || (lines.end % TILE_SIZE != 0 && lines.end != height) {
            return Err(Error::unsupported("scan line range splits a tile row"));
        }

        let channels = header.channels.list.len();
        let bytes_per_sample = header.channels.list[0].sample_type.bytes_per_sample();

        // serialize all covered tiles, then encode them on the thread pool
        let covered: Vec<(usize, TileIndices)> = self.tile_list().into_iter().enumerate()
            .filter(|(_, tile)| {
                let top = tile.location.tile_index.y() * TILE_SIZE;
                top >= lines.start && top < lines.end
            })
            .collect();

        let extracted: Vec<Result<(usize, TileIndices, Vec<u8>)>> = covered.into_iter()
            .map(|(tile_index, tile)| {
                let position = Vec2(
                    tile.location.tile_index.x() * TILE_SIZE,
                    tile.location.tile_index.y() * TILE_SIZE,
                );

                let mut pixels = Vec::with_capacity(tile.size.area() * channels * bytes_per_sample);

                for y in position.y() .. position.y() + tile.size.height() {
                    for x in position.x() .. position.x() + tile.size.width() {
                        for (channel, &slice_index) in header.channels.list.iter().zip(&slice_indices) {
                            let sample = source.sample(slice_index, Vec2(x, y))
                                .convert_to(channel.sample_type);

                            match sample {
                                Sample::U8(value) => value.write_le(&mut pixels)?,
                                Sample::U16(value) => value.write_be(&mut pixels)?,
                                _ => return Err(Error::unsupported("channel type in this format")),
                            }
                        }
                    }
                }

                Ok((tile_index, tile, pixels))
            })
            .collect();

        let compression = header.compression;
        let encoded: Vec<Result<(usize, TileIndices, Vec<u8>)>> = map_maybe_parallel(extracted, self.options.parallel, move |tile| {
            let (tile_index, tile, pixels) = tile?;
            let payload = encode_tile(&pixels, tile.size, channels, bytes_per_sample, compression);
            Ok((tile_index, tile, payload))
        });

        let image_height = height;

        for result in encoded {
            let (tile_index, tile, payload): (usize, TileIndices, Vec<u8>) = result?;

            if self.written_tiles[tile_index] {
                return Err(Error::unsupported("tile was already written"));
            }

            self.written_tiles[tile_index] = true;

            let position = Vec2(
                tile.location.tile_index.x() * TILE_SIZE,
                tile.location.tile_index.y() * TILE_SIZE,
            );

            // bounds are inclusive, with y measured from the bottom row
            let x1 = position.x();
            let x2 = position.x() + tile.size.width() - 1;
            let y2 = image_height - 1 - position.y();
            let y1 = image_height - (position.y() + tile.size.height());

            u8::write_slice_le(&mut self.write, TAG_RGBA)?;
            ((payload.len() + 8) as u32).write_be(&mut self.write)?;

            usize_to_u16(x1, "tile bounds")?.write_be(&mut self.write)?;
            usize_to_u16(y1, "tile bounds")?.write_be(&mut self.write)?;
            usize_to_u16(x2, "tile bounds")?.write_be(&mut self.write)?;
            usize_to_u16(y2, "tile bounds")?.write_be(&mut self.write)?;

            u8::write_slice_le(&mut self.write, &payload)?;
            pad_to_alignment(&mut self.write, payload.len() + 8, 4)?;
        }

        Ok(())
    }

    fn close(&mut self) -> UnitResult {
        if self.closed {
            return Err(Error::unsupported("output was already closed"));
        }

        self.closed = true;

        let end = self.write.byte_position();

        // both group lengths cover everything behind their own length field
        let root_size = end - self.root_size_position - 4;
        let bitmap_size = end - self.bitmap_size_position - 4;

        self.write.seek_write_to(self.root_size_position)?;
        (root_size as u32).write_be(&mut self.write)?;

        self.write.seek_write_to(self.bitmap_size_position)?;
        (bitmap_size as u32).write_be(&mut self.write)?;

        self.write.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use crate::block::samples::interleaved_slices;

    fn names(list: &[&str]) -> Vec<Text> {
        list.iter().map(|&name| Text::from(name)).collect()
    }

    fn rgba_header(size: Vec2<usize>, compression: Compression) -> Header {
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U8),
            ChannelDescription::new("G", SampleType::U8),
            ChannelDescription::new("B", SampleType::U8),
            ChannelDescription::new("A", SampleType::U8),
        ]);

        Header::new(size, channels)
            .with_encoding(compression, Blocks::ScanLines, LineOrder::Unspecified)
    }

    fn roundtrip(header: Header, pixel_bytes: &[u8], slice_names: &[&str], sample_type: SampleType) -> (Header, Vec<u8>) {
        let width = header.data_size().width();
        let height = header.data_size().height();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = IffOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(pixel_bytes, interleaved_slices(names(slice_names), sample_type, width));
            output.write_pixels(0 .. height, &source).unwrap();
            output.close().unwrap();
        }

        file_bytes.set_position(0);
        let mut input = IffInput::read(file_bytes, ReadOptions::default()).unwrap();
        assert!(input.is_complete());

        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(slice_names), sample_type, width));
            input.read_pixels(0 .. height, &mut target).unwrap();
        }

        (input.header().clone(), decoded)
    }

    #[test]
    fn rgba_roundtrip_both_compressions_partial_tiles(){
        for &compression in &[Compression::Uncompressed, Compression::Rle] {
            // 70x70 forces partial tiles on both edges
            let header = rgba_header(Vec2(70, 70), compression);
            let pixel_bytes: Vec<u8> = (0 .. 70 * 70 * 4).map(|index| ((index / 11) % 256) as u8).collect();

            let (decoded_header, decoded) = roundtrip(header, &pixel_bytes, &["R", "G", "B", "A"], SampleType::U8);

            assert_eq!(decoded, pixel_bytes, "{} roundtrip failed", compression);
            assert_eq!(decoded_header.compression, compression);
            assert!(decoded_header.blocks.has_tiles());
        }
    }

    #[test]
    fn sixteen_bit_roundtrip(){
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U16),
            ChannelDescription::new("G", SampleType::U16),
            ChannelDescription::new("B", SampleType::U16),
        ]);

        let header = Header::new(Vec2(65, 3), channels)
            .with_encoding(Compression::Rle, Blocks::ScanLines, LineOrder::Unspecified);

        let pixel_values: Vec<u16> = (0 .. 65 * 3 * 3).map(|index| (index * 431 % 65536) as u16).collect();
        let pixel_bytes: Vec<u8> = pixel_values.iter().flat_map(|value| value.to_ne_bytes()).collect();

        let (_, decoded) = roundtrip(header, &pixel_bytes, &["R", "G", "B"], SampleType::U16);
        assert_eq!(decoded, pixel_bytes);
    }

    #[test]
    fn metadata_chunks_roundtrip(){
        let mut header = rgba_header(Vec2(8, 8), Compression::Rle);
        header.owner = Some(Text::from("someone"));
        header.capture_date = Some(Text::from("Fri Aug 7 2026"));

        let pixel_bytes = vec![128_u8; 8 * 8 * 4];
        let (decoded_header, _) = roundtrip(header, &pixel_bytes, &["R", "G", "B", "A"], SampleType::U8);

        assert_eq!(decoded_header.owner, Some(Text::from("someone")));
        assert_eq!(decoded_header.capture_date, Some(Text::from("Fri Aug 7 2026")));
    }

    #[test]
    fn missing_bitmap_header_is_fatal(){
        let mut bytes = Vec::new();
        u8::write_slice_le(&mut bytes, TAG_FOR4).unwrap();
        12_u32.write_be(&mut bytes).unwrap();
        u8::write_slice_le(&mut bytes, TAG_CIMG).unwrap();
        u8::write_slice_le(&mut bytes, TAG_AUTH).unwrap();
        0_u32.write_be(&mut bytes).unwrap();

        assert!(matches!(
            IffInput::read(Cursor::new(bytes), ReadOptions::default()),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn unknown_chunks_are_skipped(){
        // write a valid file, then splice an unknown chunk before the bitmap group
        let header = rgba_header(Vec2(4, 4), Compression::Uncompressed);
        let pixel_bytes: Vec<u8> = (0 .. 4 * 4 * 4).map(|index| index as u8).collect();

        let mut file_bytes = Cursor::new(Vec::new());
        {
            let mut output = IffOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
            let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B", "A"]), SampleType::U8, 4));
            output.write_pixels(0 .. 4, &source).unwrap();
            output.close().unwrap();
        }

        let mut bytes = file_bytes.into_inner();

        // splice after FOR4 + size + CIMG + TBHD chunk (12 + 8 + 24 bytes)
        let mut unknown = Vec::new();
        u8::write_slice_le(&mut unknown, b"XYZW").unwrap();
        5_u32.write_be(&mut unknown).unwrap();
        unknown.extend_from_slice(&[1, 2, 3, 4, 5, 0, 0, 0]); // payload and alignment

        let splice_at = 12 + 8 + 24;
        bytes.splice(splice_at .. splice_at, unknown.iter().copied());

        // patch the root group size
        let root_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let patched = (root_size as usize + unknown.len()) as u32;
        bytes[4 .. 8].copy_from_slice(&patched.to_be_bytes());

        let mut input = IffInput::read(Cursor::new(bytes), ReadOptions::default()).unwrap();

        let mut decoded = vec![0_u8; pixel_bytes.len()];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(&["R", "G", "B", "A"]), SampleType::U8, 4));
            input.read_pixels(0 .. 4, &mut target).unwrap();
        }

        assert_eq!(decoded, pixel_bytes);
    }
}
