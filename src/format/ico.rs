
//! The Windows ICO codec.
//!
//! A 6-byte file header is followed by one 16-byte directory entry per
//! subimage, each pointing at either an embedded PNG stream or a legacy
//! DIB: a 40-byte bitmap info header, an optional palette, the XOR colour
//! mask, and an AND transparency mask of one bit per pixel. Mask rows are
//! stored bottom-up and padded to 4-byte boundaries.
//!
//! The AND mask holds the only transparency information of the DIB path:
//! a set bit makes the pixel fully transparent, so decoded alpha is
//! always 0 or 255, and the alpha bytes of 32-bit XOR data are ignored.
//! On write, mask bits are derived from alpha values of 127 or less.

pub mod png;

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek};
use std::ops::Range;
use std::path::Path;

use crate::io::*;
use crate::math::Vec2;
use crate::meta::{Header, Blocks};
use crate::meta::attribute::*;
use crate::compress::Compression;
use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample};
use crate::convert::flip_rows;
use crate::format::{FormatEntry, ImageInput, ImageOutput, ReadOptions, WriteOptions};
use crate::error::*;

/// Byte size of the bitmap info header of the DIB path.
const INFO_HEADER_SIZE: usize = 40;

/// The largest dimension a directory entry can express.
const MAX_DIMENSION: usize = 256;

/// Alpha values up to this threshold become transparent mask bits.
const MASK_THRESHOLD: u8 = 127;

/// The registry entry for this format.
pub fn format_entry() -> FormatEntry {
    FormatEntry {
        name: "ico",
        extensions: &["ico", "cur"],
        matches_magic: |bytes| bytes[.. 4] == [0, 0, 1, 0] && (bytes[4] != 0 || bytes[5] != 0),
        open: |path, options| Ok(Box::new(IcoInput::open(path, options)?)),
        create: |path, header, options| Ok(Box::new(IcoOutput::create_path(path, header, options)?)),
    }
}

fn rgba_channels() -> ChannelList {
    ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("R", SampleType::U8),
        ChannelDescription::new("G", SampleType::U8),
        ChannelDescription::new("B", SampleType::U8),
        ChannelDescription::new("A", SampleType::U8),
    ])
}

fn subimage_header(size: Vec2<usize>) -> Header {
    let mut header = Header::new(size, rgba_channels())
        .with_encoding(Compression::Uncompressed, Blocks::ScanLines, LineOrder::Decreasing);

    header.alpha_mode = Some(AlphaMode::Unassociated);
    header
}

/// One 16-byte directory entry.
#[derive(Debug, Clone, Copy)]
struct DirectoryEntry {
    width: usize,
    height: usize,
    data_size: usize,
    data_offset: usize,
}

impl DirectoryEntry {
    fn read(read: &mut impl Read) -> Result<Self> {
        let width = u8::read_le(read)? as usize;
        let height = u8::read_le(read)? as usize;
        let _color_count = u8::read_le(read)?;
        let _reserved = u8::read_le(read)?;
        let _planes = u16::read_le(read)?;
        let _bits_per_pixel = u16::read_le(read)?;
        let data_size = u32::read_le(read)? as usize;
        let data_offset = u32::read_le(read)? as usize;

        Ok(DirectoryEntry {
            // zero means the largest expressible dimension
            width: if width == 0 { MAX_DIMENSION } else { width },
            height: if height == 0 { MAX_DIMENSION } else { height },
            data_size,
            data_offset,
        })
    }

    fn write(&self, write: &mut impl Write, bits_per_pixel: u16) -> UnitResult {
        let dimension_byte = |dimension: usize| -> Result<u8> {
            if dimension == MAX_DIMENSION { Ok(0) }
            else if dimension < MAX_DIMENSION { Ok(dimension as u8) }
            else { Err(Error::unsupported("subimage dimensions exceed 256")) }
        };

        dimension_byte(self.width)?.write_le(write)?;
        dimension_byte(self.height)?.write_le(write)?;
        0_u8.write_le(write)?; // no palette
        0_u8.write_le(write)?; // reserved
        1_u16.write_le(write)?; // colour planes
        bits_per_pixel.write_le(write)?;
        usize_to_u32(self.data_size, "subimage size")?.write_le(write)?;
        usize_to_u32(self.data_offset, "subimage offset")?.write_le(write)
    }
}

/// Decode one DIB subimage payload into interleaved top-down RGBA.
fn decode_dib(payload: &[u8], declared_size: Vec2<usize>) -> Result<Vec<u8>> {
    let mut read = payload;

    let info_size = u32::read_le(&mut read)? as usize;
    if info_size != INFO_HEADER_SIZE {
        return Err(Error::malformed("bitmap info header size"));
    }

    let width = i32::read_le(&mut read)?;
    let double_height = i32::read_le(&mut read)?;
    let planes = u16::read_le(&mut read)?;
    let bits_per_pixel = u16::read_le(&mut read)? as usize;
    let compression = u32::read_le(&mut read)?;
    let _image_size = u32::read_le(&mut read)?;
    let _pixels_per_meter_x = i32::read_le(&mut read)?;
    let _pixels_per_meter_y = i32::read_le(&mut read)?;
    let palette_size = u32::read_le(&mut read)? as usize;
    let _important_colors = u32::read_le(&mut read)?;

    if planes != 1 || compression != 0 {
        return Err(Error::malformed("bitmap compression or planes"));
    }

    // the stored height covers both the colour and the transparency mask
    let width = i32_to_usize(width, "bitmap width")?;
    let height = i32_to_usize(double_height, "bitmap height")? / 2;

    if Vec2(width, height) != declared_size {
        return Err(Error::malformed("bitmap size disagrees with directory entry"));
    }

    // palette entries are stored as four bytes each;
    // a zero count means the full range of the bit depth
    let palette = match bits_per_pixel {
        1 | 4 | 8 => {
            let entries = if palette_size == 0 { 1 << bits_per_pixel } else { palette_size };
            if entries > 256 {
                return Err(Error::malformed("palette entry count"));
            }

            let mut palette = vec![0_u8; entries * 4];
            u8::read_slice_le(&mut read, &mut palette)?;
            Some(palette)
        },

        24 | 32 => None,
        _ => return Err(Error::malformed("unsupported bitmap bit depth")),
    };

    // XOR mask: the colour rows, bottom-up, padded to four bytes
    let xor_row_bytes = (width * bits_per_pixel + 31) / 32 * 4;
    let mut xor_rows = vec![0_u8; xor_row_bytes * height];
    u8::read_slice_le(&mut read, &mut xor_rows)?;
    flip_rows(&mut xor_rows, xor_row_bytes);

    // AND mask: one transparency bit per pixel, bottom-up, padded to four bytes
    let and_row_bytes = (width + 31) / 32 * 4;
    let mut and_rows = vec![0_u8; and_row_bytes * height];
    u8::read_slice_le(&mut read, &mut and_rows)?;
    flip_rows(&mut and_rows, and_row_bytes);

    let mut pixels = Vec::with_capacity(width * height * 4);

    for y in 0 .. height {
        let xor_row = &xor_rows[y * xor_row_bytes .. (y + 1) * xor_row_bytes];
        let and_row = &and_rows[y * and_row_bytes .. (y + 1) * and_row_bytes];

        for x in 0 .. width {
            let (blue, green, red) = match bits_per_pixel {
                1 | 4 | 8 => {
                    let palette = palette.as_ref().expect("palette presence bug");

                    let index = match bits_per_pixel {
                        8 => xor_row[x],
                        4 => (xor_row[x / 2] >> (4 - x % 2 * 4)) & 0x0f,
                        _ => (xor_row[x / 8] >> (7 - x % 8)) & 1,
                    } as usize;

                    if index * 4 + 3 >= palette.len() {
                        return Err(Error::corrupt("palette index out of bounds"));
                    }

                    (palette[index * 4], palette[index * 4 + 1], palette[index * 4 + 2])
                },

                24 => (xor_row[x * 3], xor_row[x * 3 + 1], xor_row[x * 3 + 2]),
                _ => (xor_row[x * 4], xor_row[x * 4 + 1], xor_row[x * 4 + 2]),
            };

            // transparency comes from the mask alone; a one-bit mask
            // can only express fully transparent or fully opaque
            let masked = and_row[x / 8] >> (7 - x % 8) & 1 != 0;

            pixels.extend_from_slice(&[red, green, blue, if masked { 0 } else { 255 }]);
        }
    }

    Ok(pixels)
}

/// Encode interleaved top-down RGBA as a 32-bit DIB subimage payload.
fn encode_dib(pixels: &[u8], size: Vec2<usize>) -> Result<Vec<u8>> {
    let Vec2(width, height) = size;
    let mut payload = Vec::new();

    (INFO_HEADER_SIZE as u32).write_le(&mut payload)?;
    usize_to_i32(width, "bitmap width")?.write_le(&mut payload)?;
    usize_to_i32(height * 2, "bitmap height")?.write_le(&mut payload)?; // colour and mask
    1_u16.write_le(&mut payload)?; // planes
    32_u16.write_le(&mut payload)?; // bits per pixel
    0_u32.write_le(&mut payload)?; // no compression
    0_u32.write_le(&mut payload)?; // image size may be zero for uncompressed
    0_i32.write_le(&mut payload)?;
    0_i32.write_le(&mut payload)?;
    0_u32.write_le(&mut payload)?; // no palette
    0_u32.write_le(&mut payload)?;

    // XOR mask: bottom-up BGRA rows; the alpha byte carries no meaning,
    // transparency lives in the AND mask
    let xor_row_bytes = width * 4;

    for y in (0 .. height).rev() {
        let row = &pixels[y * width * 4 .. (y + 1) * width * 4];

        for pixel in row.chunks_exact(4) {
            payload.extend_from_slice(&[pixel[2], pixel[1], pixel[0], 0]);
        }

        pad_to_alignment(&mut payload, xor_row_bytes, 4)?;
    }

    // AND mask: one bit per pixel, set when the pixel is transparent
    let and_row_bytes = (width + 31) / 32 * 4;

    for y in (0 .. height).rev() {
        let row = &pixels[y * width * 4 .. (y + 1) * width * 4];
        let mut mask_row = vec![0_u8; and_row_bytes];

        for (x, pixel) in row.chunks_exact(4).enumerate() {
            if pixel[3] <= MASK_THRESHOLD {
                mask_row[x / 8] |= 1 << (7 - x % 8);
            }
        }

        payload.extend_from_slice(&mask_row);
    }

    Ok(payload)
}


/// One decoded subimage.
#[derive(Debug)]
struct Subimage {
    header: Header,

    /// Interleaved top-down RGBA rows.
    pixels: Vec<u8>,
}

/// An open ICO file, for reading. All subimages are decoded eagerly.
#[derive(Debug)]
pub struct IcoInput {
    subimages: Vec<Subimage>,
    current: usize,
}

impl IcoInput {

    /// Open the file at the specified path.
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?), options)
    }

    /// Parse the directory and decode every subimage.
    pub fn read(mut reader: impl Read + Seek, _options: ReadOptions) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let mut read = bytes.as_slice();

        let reserved = u16::read_le(&mut read)?;
        let file_type = u16::read_le(&mut read)?;
        let count = u16::read_le(&mut read)? as usize;

        // type 2 files are cursors, which share the layout
        if reserved != 0 || (file_type != 1 && file_type != 2) || count == 0 {
            return Err(Error::malformed("file identifier missing"));
        }

        let mut entries = Vec::with_capacity(count);
        for _index in 0 .. count {
            entries.push(DirectoryEntry::read(&mut read)?);
        }

        let mut subimages = Vec::with_capacity(count);

        for entry in entries {
            if entry.data_offset + entry.data_size > bytes.len() {
                return Err(Error::malformed("subimage data out of bounds"));
            }

            let payload = &bytes[entry.data_offset .. entry.data_offset + entry.data_size];
            let declared_size = Vec2(entry.width, entry.height);

            // each subimage is either an embedded png stream or a legacy dib
            let (size, pixels) = if png::is_png(payload) {
                let (size, channels, decoded) = png::decode(payload)?;

                let pixels = match channels {
                    4 => decoded,
                    _ => decoded.chunks_exact(3)
                        .flat_map(|pixel| [pixel[0], pixel[1], pixel[2], 255])
                        .collect(),
                };

                (size, pixels)
            }
            else {
                (declared_size, decode_dib(payload, declared_size)?)
            };

            subimages.push(Subimage {
                header: subimage_header(size),
                pixels,
            });
        }

        Ok(IcoInput { subimages, current: 0 })
    }
}

impl ImageInput for IcoInput {

    fn format_name(&self) -> &'static str { "ico" }

    fn header(&self) -> &Header { &self.subimages[self.current].header }

    fn subimage_count(&self) -> usize { self.subimages.len() }

    fn select_subimage(&mut self, index: usize) -> UnitResult {
        if index < self.subimages.len() {
            self.current = index;
            Ok(())
        }
        else {
            Err(Error::unsupported("subimage index out of bounds"))
        }
    }

    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult {
        let subimage = &self.subimages[self.current];
        let slice_indices = target.match_channels(&subimage.header.channels)?;

        let Vec2(width, height) = subimage.header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        for y in lines {
            let row = &subimage.pixels[y * width * 4 .. (y + 1) * width * 4];

            for x in 0 .. width {
                for (channel_index, &slice_index) in slice_indices.iter().enumerate() {
                    target.set_sample(slice_index, Vec2(x, y), Sample::U8(row[x * 4 + channel_index]));
                }
            }
        }

        Ok(())
    }
}


/// An ICO file being written. Pixels are collected in memory and the
/// directory is assembled on `close`, because entry offsets depend on
/// every subimage's encoded size.
#[derive(Debug)]
pub struct IcoOutput<W: Write + Seek> {
    write: Tracking<W>,
    header: Header,

    /// Interleaved top-down RGBA rows, collected from write calls.
    pixels: Vec<u8>,

    /// Which lines have been written so far.
    written_lines: Vec<bool>,

    closed: bool,
}

impl IcoOutput<BufWriter<File>> {

    /// Create a file at the specified path.
    pub fn create_path(path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Self> {
        Self::create(BufWriter::new(File::create(path)?), header, options)
    }
}

impl<W: Write + Seek> IcoOutput<W> {

    /// Validate the header. Nothing is written until `close`.
    pub fn create(writer: W, header: Header, _options: WriteOptions) -> Result<Self> {
        header.validate()?;

        if header.blocks.has_tiles() {
            return Err(Error::unsupported("tiles in this format"));
        }

        let names: Vec<&[u8]> = header.channels.list.iter()
            .map(|channel| channel.name.as_slice()).collect();

        if names != [b"R" as &[u8], b"G", b"B", b"A"]
            || header.channels.list.iter().any(|channel| channel.sample_type != SampleType::U8)
        {
            return Err(Error::unsupported("channel set in this format"));
        }

        let Vec2(width, height) = header.data_size();

        // png payloads lift the directory's 256 pixel limit
        if width > 65536 || height > 65536 {
            return Err(Error::unsupported("image dimensions"));
        }

        Ok(IcoOutput {
            write: Tracking::new(writer),
            pixels: vec![0_u8; width * height * 4],
            written_lines: vec![false; height],
            header,
            closed: false,
        })
    }
}

impl<W: Write + Seek> ImageOutput for IcoOutput<W> {

    fn format_name(&self) -> &'static str { "ico" }

    fn header(&self) -> &Header { &self.header }

    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult {
        let header = self.header.clone();
        let slice_indices = source.match_channels(&header.channels)?;

        let Vec2(width, height) = header.data_size();
        assert!(lines.start < lines.end && lines.end <= height, "scan line range out of bounds");

        for y in lines {
            if self.written_lines[y] {
                return Err(Error::unsupported("scan line was already written"));
            }

            self.written_lines[y] = true;
            let row = &mut self.pixels[y * width * 4 .. (y + 1) * width * 4];

            for x in 0 .. width {
                for (channel_index, &slice_index) in slice_indices.iter().enumerate() {
                    let sample = source.sample(slice_index, Vec2(x, y)).convert_to(SampleType::U8);

                    row[x * 4 + channel_index] = match sample {
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

        let size = self.header.data_size();

        // large images do not fit a directory entry's dimension byte;
        // store them as an embedded png stream instead of a dib
        let use_png = size.width() > MAX_DIMENSION || size.height() > MAX_DIMENSION;

        let payload = if use_png {
            png::encode(size, 4, &self.pixels)?
        } else {
            encode_dib(&self.pixels, size)?
        };

        0_u16.write_le(&mut self.write)?; // reserved
        1_u16.write_le(&mut self.write)?; // icon file type
        1_u16.write_le(&mut self.write)?; // one subimage

        DirectoryEntry {
            width: size.width().min(MAX_DIMENSION),
            height: size.height().min(MAX_DIMENSION),
            data_size: payload.len(),
            data_offset: 6 + 16,
        }.write(&mut self.write, 32)?;

        u8::write_slice_le(&mut self.write, &payload)?;
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

    fn write_to_memory(size: Vec2<usize>, pixel_bytes: &[u8]) -> Vec<u8> {
        let header = subimage_header(size);

        let mut file_bytes = Cursor::new(Vec::new());
        let mut output = IcoOutput::create(&mut file_bytes, header, WriteOptions::default()).unwrap();
        let source = FrameBuffer::new(pixel_bytes, interleaved_slices(names(&["R", "G", "B", "A"]), SampleType::U8, size.width()));
        output.write_pixels(0 .. size.height(), &source).unwrap();
        output.close().unwrap();

        file_bytes.into_inner()
    }

    fn read_from_memory(file_bytes: Vec<u8>) -> (Header, Vec<u8>) {
        let mut input = IcoInput::read(Cursor::new(file_bytes), ReadOptions::default()).unwrap();
        let size = input.header().data_size();

        let mut decoded = vec![0_u8; size.area() * 4];
        {
            let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(&["R", "G", "B", "A"]), SampleType::U8, size.width()));
            input.read_pixels(0 .. size.height(), &mut target).unwrap();
        }

        (input.header().clone(), decoded)
    }

    #[test]
    fn mask_is_derived_from_alpha_and_decodes_binary(){
        // a 48x48 32-bit subimage with alpha values on both sides of the threshold
        let size = Vec2(48, 48);
        let pixel_bytes: Vec<u8> = (0 .. size.area())
            .flat_map(|index| {
                let alpha = (index % 256) as u8;
                [ (index % 251) as u8, (index % 239) as u8, (index % 233) as u8, alpha ]
            })
            .collect();

        let file = write_to_memory(size, &pixel_bytes);
        let (header, decoded) = read_from_memory(file);

        assert_eq!(header.data_size(), size);

        for (pixel_index, (original, decoded)) in
            pixel_bytes.chunks_exact(4).zip(decoded.chunks_exact(4)).enumerate()
        {
            // the one-bit mask can only express fully transparent or opaque
            let expected_alpha = if original[3] <= MASK_THRESHOLD { 0 } else { 255 };
            assert_eq!(decoded[3], expected_alpha, "alpha at pixel {}", pixel_index);

            // colour survives only where the pixel is opaque
            if expected_alpha == 255 {
                assert_eq!(&decoded[.. 3], &original[.. 3], "colour at pixel {}", pixel_index);
            }
        }
    }

    #[test]
    fn opaque_roundtrip_is_lossless(){
        let size = Vec2(16, 9);
        let pixel_bytes: Vec<u8> = (0 .. size.area())
            .flat_map(|index| [ (index * 3) as u8, (index * 5) as u8, (index * 7) as u8, 255 ])
            .collect();

        let file = write_to_memory(size, &pixel_bytes);
        let (_, decoded) = read_from_memory(file);
        assert_eq!(decoded, pixel_bytes);
    }

    #[test]
    fn large_images_embed_png_streams(){
        let size = Vec2(300, 20);
        let pixel_bytes: Vec<u8> = (0 .. size.area())
            .flat_map(|index| [ index as u8, (index / 3) as u8, (index / 7) as u8, (index % 256) as u8 ])
            .collect();

        let file = write_to_memory(size, &pixel_bytes);

        // the payload behind the directory is a png stream
        assert!(png::is_png(&file[6 + 16 ..]));

        // png subimages keep full 8-bit alpha
        let (header, decoded) = read_from_memory(file);
        assert_eq!(header.data_size(), size);
        assert_eq!(decoded, pixel_bytes);
    }

    #[test]
    fn palette_dib_subimages_decode(){
        // hand-build a 4x2 8-bit palette dib subimage
        let mut payload = Vec::new();
        (INFO_HEADER_SIZE as u32).write_le(&mut payload).unwrap();
        4_i32.write_le(&mut payload).unwrap();
        4_i32.write_le(&mut payload).unwrap(); // doubled height
        1_u16.write_le(&mut payload).unwrap();
        8_u16.write_le(&mut payload).unwrap();
        0_u32.write_le(&mut payload).unwrap();
        0_u32.write_le(&mut payload).unwrap();
        0_i32.write_le(&mut payload).unwrap();
        0_i32.write_le(&mut payload).unwrap();
        2_u32.write_le(&mut payload).unwrap(); // two palette entries
        0_u32.write_le(&mut payload).unwrap();

        payload.extend_from_slice(&[ 10, 20, 30, 0,  40, 50, 60, 0 ]); // bgrx entries
        payload.extend_from_slice(&[ 0, 1, 0, 1 ]); // bottom xor row, already 4-aligned
        payload.extend_from_slice(&[ 1, 0, 1, 0 ]); // top xor row
        payload.extend_from_slice(&[ 0b0101_0000, 0, 0, 0 ]); // bottom and row
        payload.extend_from_slice(&[ 0b1010_0000, 0, 0, 0 ]); // top and row

        let mut file = Vec::new();
        0_u16.write_le(&mut file).unwrap();
        1_u16.write_le(&mut file).unwrap();
        1_u16.write_le(&mut file).unwrap();

        DirectoryEntry { width: 4, height: 2, data_size: payload.len(), data_offset: 6 + 16 }
            .write(&mut file, 8).unwrap();

        file.extend_from_slice(&payload);

        let (header, decoded) = read_from_memory(file);
        assert_eq!(header.data_size(), Vec2(4, 2));

        // top row of the buffer is the second stored row: indices 1, 0, 1, 0
        // palette entry 1 is bgr (40, 50, 60) -> rgb (60, 50, 40)
        assert_eq!(&decoded[.. 4], &[ 60, 50, 40, 0 ]); // and bit set -> transparent
        assert_eq!(&decoded[4 .. 8], &[ 30, 20, 10, 255 ]);
    }

    #[test]
    fn truncated_directory_is_malformed(){
        let mut file = Vec::new();
        0_u16.write_le(&mut file).unwrap();
        1_u16.write_le(&mut file).unwrap();
        3_u16.write_le(&mut file).unwrap(); // claims three subimages

        assert!(IcoInput::read(Cursor::new(file), ReadOptions::default()).is_err());
    }
}
