
//! The Truevision TGA codec, including the 2.0 footer and extension area.
//!
//! An 18-byte little endian header is followed by an optional id string,
//! an optional colour map, and the pixel data, stored bottom row first
//! unless the top-down origin flag is set. Pixels are BGR(A) on disk.
//! 2.0 files append a 495-byte extension area and a 26-byte footer with
//! the `TRUEVISION-XFILE` signature.
//!
//! Run-length packets are encoded per scan line over the line's raw bytes.
//! Since packets cannot be addressed per line after the fact, the whole
//! pixel stream is decoded when the file is opened, and encoded when the
//! output is closed.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek};
use std::ops::Range;
use std::path::Path;

use bit_field::BitField;

use crate::io::*;
use crate::math::Vec2;
use crate::meta::{Header, Blocks};
use crate::meta::attribute::*;
use crate::compress::{rle, Compression};
use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample};
use crate::convert::{bit_range_convert, expand_palette, flip_rows, swap_first_and_third_channel};
use crate::format::{FormatEntry, ImageInput, ImageOutput, ReadOptions, WriteOptions};
use crate::error::*;

/// The signature in the last 18 bytes of every 2.0 file.
pub const FOOTER_SIGNATURE: &[u8; 18] = b"TRUEVISION-XFILE.\0";

/// Byte size of the 2.0 footer.
const FOOTER_SIZE: usize = 26;

/// Byte size of the 2.0 extension area.
const EXTENSION_SIZE: usize = 495;

/// Repeats pay off at two bytes already, as a repeat packet
/// costs exactly as much as one literal byte plus its count byte.
const MIN_RUN: usize = 2;

// image type codes; adding 8 marks run-length encoding
const TYPE_COLOR_MAPPED: u8 = 1;
const TYPE_TRUE_COLOR: u8 = 2;
const TYPE_GRAYSCALE: u8 = 3;
const TYPE_RLE_FLAG: u8 = 8;

// image descriptor bits
const DESCRIPTOR_RIGHT_TO_LEFT: usize = 4;
const DESCRIPTOR_TOP_DOWN: usize = 5;

// extension area alpha attribute codes
const ALPHA_UNASSOCIATED: u8 = 3;
const ALPHA_ASSOCIATED: u8 = 4;

/// The registry entry for this format.
pub fn format_entry() -> FormatEntry {
    FormatEntry {
        name: "tga",
        extensions: &["tga", "tpic"],
        // no leading magic exists; the signature lives in the footer,
        // so detection falls back to the file extension
        matches_magic: |_bytes| false,
        open: |path, options| Ok(Box::new(TgaInput::open(path, options)?)),
        create: |path, header, options| Ok(Box::new(TgaOutput::create_path(path, header, options)?)),
    }
}


#[derive(Debug, Clone)]
struct TgaHeader {
    id_length: u8,
    color_map_type: u8,
    image_type: u8,
    color_map_origin: u16,
    color_map_length: u16,
    color_map_bits: u8,
    x_origin: u16,
    y_origin: u16,
    width: u16,
    height: u16,
    bits_per_pixel: u8,
    descriptor: u8,
}

impl TgaHeader {
    fn read(read: &mut impl Read) -> Result<Self> {
        Ok(TgaHeader {
            id_length: u8::read_le(read)?,
            color_map_type: u8::read_le(read)?,
            image_type: u8::read_le(read)?,
            color_map_origin: u16::read_le(read)?,
            color_map_length: u16::read_le(read)?,
            color_map_bits: u8::read_le(read)?,
            x_origin: u16::read_le(read)?,
            y_origin: u16::read_le(read)?,
            width: u16::read_le(read)?,
            height: u16::read_le(read)?,
            bits_per_pixel: u8::read_le(read)?,
            descriptor: u8::read_le(read)?,
        })
    }

    fn write(&self, write: &mut impl Write) -> UnitResult {
        self.id_length.write_le(write)?;
        self.color_map_type.write_le(write)?;
        self.image_type.write_le(write)?;
        self.color_map_origin.write_le(write)?;
        self.color_map_length.write_le(write)?;
        self.color_map_bits.write_le(write)?;
        self.x_origin.write_le(write)?;
        self.y_origin.write_le(write)?;
        self.width.write_le(write)?;
        self.height.write_le(write)?;
        self.bits_per_pixel.write_le(write)?;
        self.descriptor.write_le(write)
    }
}

/// The optional trailing metadata of a 2.0 file.
#[derive(Debug, Clone, Default)]
struct ExtensionArea {
    author: Option<Text>,
    comments: Option<Text>,
    software: Option<Text>,
    gamma: Option<f32>,
    alpha_mode: Option<AlphaMode>,
}

impl ExtensionArea {

    /// Look for the footer signature and parse the extension area it points to.
    /// Files without the signature are original TGA files without metadata.
    fn read_from_end(read: &mut Tracking<impl Read + Seek>, file_size: usize) -> Result<Self> {
        if file_size < FOOTER_SIZE {
            return Ok(Self::default());
        }

        read.seek_read_to(file_size - FOOTER_SIZE)?;
        let extension_offset = u32::read_le(read)?;
        let _developer_offset = u32::read_le(read)?;

        let mut signature = [0_u8; 18];
        u8::read_slice_le(read, &mut signature)?;

        if &signature != FOOTER_SIGNATURE || extension_offset == 0 {
            return Ok(Self::default());
        }

        let extension_offset = extension_offset as usize;
        if extension_offset + EXTENSION_SIZE > file_size {
            return Err(Error::malformed("extension area out of bounds"));
        }

        read.seek_read_to(extension_offset)?;

        let declared_size = u16::read_le(read)?;
        if declared_size as usize != EXTENSION_SIZE {
            return Err(Error::malformed("extension area size"));
        }

        let author = Text::read_fixed(read, 41)?;
        let comments = Text::read_fixed(read, 324)?;
        skip_bytes(read, 12)?; // date and time stamp
        let _job_name = Text::read_fixed(read, 41)?;
        skip_bytes(read, 6)?; // job time
        let software = Text::read_fixed(read, 41)?;
        skip_bytes(read, 3)?; // software version
        let _key_color = u32::read_le(read)?;
        skip_bytes(read, 4)?; // pixel aspect ratio

        let gamma_numerator = u16::read_le(read)?;
        let gamma_denominator = u16::read_le(read)?;

        skip_bytes(read, 12)?; // color correction, postage stamp, scan line offsets
        let alpha_type = u8::read_le(read)?;

        let gamma = if gamma_denominator != 0 {
            Some(gamma_numerator as f32 / gamma_denominator as f32)
        } else { None };

        let alpha_mode = match alpha_type {
            ALPHA_UNASSOCIATED => Some(AlphaMode::Unassociated),
            ALPHA_ASSOCIATED => Some(AlphaMode::Associated),
            _ => None,
        };

        Ok(ExtensionArea {
            author: if author.is_empty() { None } else { Some(author) },
            comments: if comments.is_empty() { None } else { Some(comments) },
            software: if software.is_empty() { None } else { Some(software) },
            gamma,
            alpha_mode,
        })
    }

    /// Write the 495-byte extension area followed by the footer.
    fn write_with_footer(&self, write: &mut Tracking<impl Write + Seek>) -> UnitResult {
        let extension_offset = write.byte_position();

        (EXTENSION_SIZE as u16).write_le(write)?;
        self.author.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 41)?;
        self.comments.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 324)?;
        u8::write_slice_le(write, &[0_u8; 12])?; // date and time stamp
        Text::from("").write_fixed(write, 41)?; // job name
        u8::write_slice_le(write, &[0_u8; 6])?; // job time
        self.software.clone().unwrap_or_else(|| Text::from("")).write_fixed(write, 41)?;
        u8::write_slice_le(write, &[0_u8; 3])?; // software version
        0_u32.write_le(write)?; // key color

        1_u16.write_le(write)?; // pixel aspect numerator
        1_u16.write_le(write)?; // pixel aspect denominator

        match self.gamma {
            Some(gamma) => {
                ((gamma * 100.0).round() as u16).write_le(write)?;
                100_u16.write_le(write)?;
            },
            None => {
                0_u16.write_le(write)?;
                0_u16.write_le(write)?;
            },
        }

        0_u32.write_le(write)?; // color correction table offset
        0_u32.write_le(write)?; // postage stamp offset
        0_u32.write_le(write)?; // scan line table offset

        match self.alpha_mode {
            Some(AlphaMode::Unassociated) => ALPHA_UNASSOCIATED.write_le(write)?,
            Some(AlphaMode::Associated) => ALPHA_ASSOCIATED.write_le(write)?,
            None => 0_u8.write_le(write)?,
        }

        debug_assert_eq!(write.byte_position() - extension_offset, EXTENSION_SIZE, "extension layout bug");

        // the footer references the extension area
        (extension_offset as u32).write_le(write)?;
        0_u32.write_le(write)?; // developer directory offset
        u8::write_slice_le(write, FOOTER_SIGNATURE)
    }
}


/// The pixel layout variants this codec reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {

    /// 8 bit grayscale.
    Gray8,

    /// 16 bits per pixel, three 5-bit channels, highest bit unused.
    Rgb555,

    /// 24 bits per pixel, BGR byte order on disk.
    Rgb24,

    /// 32 bits per pixel, BGRA byte order on disk.
    Rgba32,
}

impl PixelLayout {
    fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb555 => 2,
            PixelLayout::Rgb24 => 3,
            PixelLayout::Rgba32 => 4,
        }
    }

    /// Number of interleaved 8-bit channels after decoding.
    fn decoded_channels(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb555 | PixelLayout::Rgb24 => 3,
            PixelLayout::Rgba32 => 4,
        }
    }
}

fn channels_of(layout: PixelLayout) -> ChannelList {
    let five_bits = |channel: ChannelDescription| match layout {
        PixelLayout::Rgb555 => channel.with_bits(5),
        _ => channel,
    };

    ChannelList::new(match layout {
        PixelLayout::Gray8 => smallvec::smallvec![
            ChannelDescription::new("Y", SampleType::U8),
        ],
        PixelLayout::Rgb555 | PixelLayout::Rgb24 => smallvec::smallvec![
            five_bits(ChannelDescription::new("R", SampleType::U8)),
            five_bits(ChannelDescription::new("G", SampleType::U8)),
            five_bits(ChannelDescription::new("B", SampleType::U8)),
        ],
        PixelLayout::Rgba32 => smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U8),
            ChannelDescription::new("G", SampleType::U8),
            ChannelDescription::new("B", SampleType::U8),
            ChannelDescription::new("A", SampleType::U8),
        ],
    })
}

fn layout_of(header: &Header) -> Result<PixelLayout> {
    let channels = &header.channels.list;
    let names: Vec<&[u8]> = channels.iter().map(|channel| channel.name.as_slice()).collect();

    match names.as_slice() {
        [b"Y"] => Ok(PixelLayout::Gray8),
        [b"R", b"G", b"B"] => {
            if channels.iter().all(|channel| channel.bits_per_sample == Some(5)) {
                Ok(PixelLayout::Rgb555)
            }
            else if channels.iter().all(|channel| channel.bits_per_sample.is_none()) {
                Ok(PixelLayout::Rgb24)
            }
            else {
                Err(Error::unsupported("mixed channel bit depths"))
            }
        },
        [b"R", b"G", b"B", b"A"] => Ok(PixelLayout::Rgba32),
        _ => Err(Error::unsupported("channel set in this format")),
    }
}


/// An open TGA file, for reading. The pixel stream is decoded eagerly,
/// as run-length packets cannot be addressed per scan line.
#[derive(Debug)]
pub struct TgaInput {
    header: Header,
    layout: PixelLayout,

    /// Decoded interleaved 8-bit rows, top-down, R(GB(A)) order.
    decoded: Vec<u8>,
}

impl TgaInput {

    /// Open the file at the specified path.
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?), options)
    }

    /// Parse the header and decode the whole pixel stream.
    pub fn read(reader: impl Read + Seek, _options: ReadOptions) -> Result<Self> {
        let mut read = Tracking::new(reader);

        let tga = TgaHeader::read(&mut read)?;

        if tga.descriptor.get_bit(DESCRIPTOR_RIGHT_TO_LEFT) {
            return Err(Error::unsupported("right-to-left pixel order"));
        }

        let rle = tga.image_type & TYPE_RLE_FLAG != 0;
        let base_type = tga.image_type & !TYPE_RLE_FLAG;

        let (layout, color_mapped) = match (base_type, tga.bits_per_pixel) {
            (TYPE_GRAYSCALE, 8) => (PixelLayout::Gray8, false),
            (TYPE_TRUE_COLOR, 15) | (TYPE_TRUE_COLOR, 16) => (PixelLayout::Rgb555, false),
            (TYPE_TRUE_COLOR, 24) => (PixelLayout::Rgb24, false),
            (TYPE_TRUE_COLOR, 32) => (PixelLayout::Rgba32, false),
            (TYPE_COLOR_MAPPED, 8) => {
                let layout = match tga.color_map_bits {
                    24 => PixelLayout::Rgb24,
                    32 => PixelLayout::Rgba32,
                    _ => return Err(Error::malformed("unsupported color map depth")),
                };
                (layout, true)
            },
            _ => return Err(Error::malformed("unsupported image type or bit depth")),
        };

        if color_mapped != (tga.color_map_type == 1) {
            return Err(Error::malformed("color map type disagrees with image type"));
        }

        if tga.width == 0 || tga.height == 0 {
            return Err(Error::malformed("empty image"));
        }

        let width = tga.width as usize;
        let height = tga.height as usize;

        if width * height > 1 << 26 {
            return Err(Error::unsupported("image larger than the decoder limit"));
        }

        skip_bytes(&mut read, tga.id_length as usize)?;

        // the optional colour map follows the id string
        let palette = if tga.color_map_type == 1 {
            let entry_bytes = (tga.color_map_bits as usize + 7) / 8;
            let mut palette = vec![0_u8; tga.color_map_length as usize * entry_bytes];
            u8::read_slice_le(&mut read, &mut palette)?;
            Some(palette)
        } else { None };

        // decode the pixel stream into interleaved on-disk-order bytes
        let stored_bytes_per_pixel = if color_mapped { 1 } else { layout.bytes_per_pixel() };
        let stored_size = width * height * stored_bytes_per_pixel;

        let stored = if rle {
            let mut packets = Vec::new();
            read.read_to_end(&mut packets)?;
            rle::decode(&packets, stored_size)?
        }
        else {
            let mut stored = vec![0_u8; stored_size];
            u8::read_slice_le(&mut read, &mut stored)?;
            stored
        };

        // expand palette indices, remap 5-bit channels, swap BGR to RGB
        let mut decoded = match (color_mapped, layout) {
            (true, _) => {
                let palette = palette.as_ref().expect("color map presence bug");
                let entry_bytes = layout.bytes_per_pixel();
                let mut expanded = expand_palette(&stored, palette, entry_bytes)?;
                swap_first_and_third_channel(&mut expanded, layout.decoded_channels(), 1);
                expanded
            },

            (false, PixelLayout::Gray8) => stored,

            (false, PixelLayout::Rgb555) => {
                let mut expanded = Vec::with_capacity(width * height * 3);

                for pixel in stored.chunks_exact(2) {
                    let bits = u16::from_le_bytes([pixel[0], pixel[1]]) as u32;

                    // layout is xRRRRRGG GGGBBBBB, stored little endian
                    expanded.push(bit_range_convert((bits >> 10) & 0x1f, 5, 8) as u8);
                    expanded.push(bit_range_convert((bits >> 5) & 0x1f, 5, 8) as u8);
                    expanded.push(bit_range_convert(bits & 0x1f, 5, 8) as u8);
                }

                expanded
            },

            (false, PixelLayout::Rgb24) | (false, PixelLayout::Rgba32) => {
                let mut pixels = stored;
                swap_first_and_third_channel(&mut pixels, layout.decoded_channels(), 1);
                pixels
            },
        };

        // scan line zero is the bottom row unless the top-down flag is set
        if !tga.descriptor.get_bit(DESCRIPTOR_TOP_DOWN) {
            flip_rows(&mut decoded, width * layout.decoded_channels());
        }

        let file_size = {
            // Tracking cannot seek past what it has read; measure directly
            let position = read.byte_position();
            position + {
                let mut rest = Vec::new();
                read.read_to_end(&mut rest)?;
                rest.len()
            }
        };

        let extension = ExtensionArea::read_from_end(&mut read, file_size)?;

        let mut header = Header::new(Vec2(width, height), channels_of(layout))
            .with_encoding(
                if rle { Compression::Rle } else { Compression::Uncompressed },
                Blocks::ScanLines, LineOrder::Decreasing,
            );

        if layout == PixelLayout::Rgba32 {
            header.alpha_mode = Some(extension.alpha_mode.unwrap_or(AlphaMode::Unassociated));
        }

        header.gamma = extension.gamma.unwrap_or(1.0);
        header.owner = extension.author;
        header.comments = extension.comments;
        header.software = extension.software;
        header.validate()?;

        Ok(TgaInput { header, layout, decoded })
    }
}

impl ImageInput for TgaInput {

    fn format_name(&self) -> &'static str { "tga" }

    fn header(&self) -> &Header { &self.header }

    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let header = &self.header;
        let slice_indices = target.match_channels(&header.channels)?;

        let Vec2(width, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        let channels = self.layout.decoded_channels();

        for y in lines {
            let row = &self.decoded[y * width * channels .. (y + 1) * width * channels];

            for x in 0 .. width {
                for (channel_index, &slice_index) in slice_indices.iter().enumerate() {
                    let value = row[x * channels + channel_index];
                    target.set_sample(slice_index, Vec2(x, y), Sample::U8(value));
                }
            }
        }

        Ok(())
    }
}


/// A TGA file being written. Rows are collected in memory and encoded on
/// `close`, because the bottom-up row order and the run-length stream both
/// need the complete image.
#[derive(Debug)]
pub struct TgaOutput<W: Write + Seek> {
    write: Tracking<W>,
    header: Header,
    layout: PixelLayout,

    /// Interleaved 8-bit rows, top-down, collected from write calls.
    pixels: Vec<u8>,

    /// Which lines have been written so far.
    written_lines: Vec<bool>,

    closed: bool,
}

impl TgaOutput<BufWriter<File>> {

    /// Create a file at the specified path.
    pub fn create_path(path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Self> {
        Self::create(BufWriter::new(File::create(path)?), header, options)
    }
}

impl<W: Write + Seek> TgaOutput<W> {

    /// Validate the header. Nothing is written until `close`.
    pub fn create(writer: W, header: Header, _options: WriteOptions) -> Result<Self> {
        header.validate()?;

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("tiles in this format"));
        }

        let layout = layout_of(&header)?;
        let Vec2(width, height) = header.data_size();

        if width > u16::MAX as usize || height > u16::MAX as usize {
            return Err(Error::unsupported("image dimensions exceed 16 bits"));
        }

        match header.compression {
            Compression::Uncompressed | Compression::Rle => {},
            other => return Err(Error::unsupported(format!("{} in this format", other))),
        }

        Ok(TgaOutput {
            write: Tracking::new(writer),
            layout,
            pixels: vec![0_u8; width * height * layout.decoded_channels()],
            written_lines: vec![false; height],
            header,
            closed: false,
        })
    }
}

impl<W: Write + Seek> ImageOutput for TgaOutput<W> {

    fn format_name(&self) -> &'static str { "tga" }

    fn header(&self) -> &Header { &self.header }

    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.header.clone();
        let slice_indices = source.match_channels(&header.channels)?;

        let Vec2(width, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        let channels = self.layout.decoded_channels();

        for y in lines {
            if self.written_lines[y] {
                return Err(Error::unsupported("scan line was already written"));
            }

            self.written_lines[y] = true;
            let row = &mut self.pixels[y * width * channels .. (y + 1) * width * channels];

            for x in 0 .. width {
                for (channel_index, &slice_index) in slice_indices.iter().enumerate() {
                    let sample = source.sample(slice_index, Vec2(x, y)).convert_to(SampleType::U8);

                    row[x * channels + channel_index] = match sample {
                        Sample::U8(value) => value,
                        _ => unreachable!("sample conversion bug"),
                    };
                }
            }
        }

        Ok(())
    }

    fn close(&mut self) -> UnitResult {
        if self.closed {
            return Err(Error::unsupported("output was already closed"));
        }

        self.closed = true;

        if self.written_lines.iter().any(|&written| !written) {
            return Err(Error::incomplete("not all scan lines were written"));
        }

        let header = &self.header;
        let Vec2(width, height) = header.data_size();
        let rle = header.compression == Compression::Rle;

        let base_type = match self.layout {
            PixelLayout::Gray8 => TYPE_GRAYSCALE,
            _ => TYPE_TRUE_COLOR,
        };

        let mut descriptor = 0_u8;
        if self.layout == PixelLayout::Rgba32 {
            descriptor |= 8; // eight attribute bits per pixel
        }

        let tga = TgaHeader {
            id_length: 0,
            color_map_type: 0,
            image_type: base_type | if rle { TYPE_RLE_FLAG } else { 0 },
            color_map_origin: 0,
            color_map_length: 0,
            color_map_bits: 0,
            x_origin: 0,
            y_origin: 0,
            width: width as u16,
            height: height as u16,
            bits_per_pixel: (self.layout.bytes_per_pixel() * 8) as u8,
            descriptor, // bottom-up origin
        };

        tga.write(&mut self.write)?;

        // convert the collected top-down rgb rows into the on-disk order
        let mut stored = self.pixels.clone();

        match self.layout {
            PixelLayout::Gray8 => {},

            PixelLayout::Rgb555 => {
                let mut packed = Vec::with_capacity(width * height * 2);

                for pixel in stored.chunks_exact(3) {
                    let red = bit_range_convert(pixel[0] as u32, 8, 5);
                    let green = bit_range_convert(pixel[1] as u32, 8, 5);
                    let blue = bit_range_convert(pixel[2] as u32, 8, 5);

                    let bits = ((red << 10) | (green << 5) | blue) as u16;
                    packed.extend_from_slice(&bits.to_le_bytes());
                }

                stored = packed;
            },

            PixelLayout::Rgb24 | PixelLayout::Rgba32 => {
                swap_first_and_third_channel(&mut stored, self.layout.decoded_channels(), 1);
            },
        }

        let row_bytes = width * match self.layout {
            PixelLayout::Rgb555 => 2,
            other => other.decoded_channels(),
        };

        flip_rows(&mut stored, row_bytes); // scan line zero is the bottom row

        if rle {
            for row in stored.chunks_exact(row_bytes) {
                let encoded = rle::encode(row, MIN_RUN);
                u8::write_slice_le(&mut self.write, &encoded)?;
            }
        }
        else {
            u8::write_slice_le(&mut self.write, &stored)?;
        }

        let extension = ExtensionArea {
            author: header.owner.clone(),
            comments: header.comments.clone(),
            software: header.software.clone(),
            gamma: if header.gamma != 1.0 { Some(header.gamma) } else { None },
            alpha_mode: if self.layout == PixelLayout::Rgba32 {
                Some(header.alpha_mode.unwrap_or(AlphaMode::Unassociated))
            } else { None },
        };

        extension.write_with_footer(&mut self.write)?;
        self.write.flush()?;
        Ok(())
    }
}
