
//! Attribute data types shared by all format headers:
//! texts, bounding boxes, channel lists, tiling descriptors.

use smallvec::SmallVec;

use crate::io::*;
use crate::math::{Vec2, RoundingMode};
use crate::error::*;

/// A byte string used for channel names, layer names,
/// and the textual fields of the raster format headers.
/// Must not contain null bytes, as every format here
/// stores texts either null-terminated or zero-padded.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Text {
    bytes: SmallVec<[u8; 24]>,
}

impl Text {

    /// Create a text from bytes, returning an error if a null byte is found.
    pub fn from_bytes(bytes: impl Into<SmallVec<[u8; 24]>>) -> Result<Self> {
        let bytes = bytes.into();

        if bytes.contains(&0) {
            return Err(Error::malformed("text contains null byte"));
        }

        Ok(Text { bytes })
    }

    /// The raw bytes of this text.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Number of bytes in this text.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether this text contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read a text until a null byte is found, consuming the null byte.
    /// Refuses to read more than `max_len` bytes.
    pub fn read_null_terminated(read: &mut impl Read, max_len: usize) -> Result<Self> {
        let mut bytes = SmallVec::new();

        loop {
            let byte = u8::read_le(read)?;
            if byte == 0 { break; }

            if bytes.len() >= max_len {
                return Err(Error::malformed("text too long"));
            }

            bytes.push(byte);
        }

        Ok(Text { bytes })
    }

    /// Write the text bytes followed by a single null byte.
    pub fn write_null_terminated(&self, write: &mut impl Write) -> UnitResult {
        u8::write_slice_le(write, self.as_slice())?;
        0_u8.write_le(write)
    }

    /// Read a text prefixed with its little endian `i32` byte count.
    pub fn read_i32_sized(read: &mut impl Read, max_len: usize) -> Result<Self> {
        let bytes = u8::read_i32_sized_vec_le(read, max_len, Some(max_len), "text byte length")?;
        Text::from_bytes(SmallVec::from_vec(bytes))
    }

    /// Write the text prefixed with its little endian `i32` byte count.
    pub fn write_i32_sized(&self, write: &mut impl Write) -> UnitResult {
        u8::write_i32_sized_slice_le(write, self.as_slice())
    }

    /// Read a fixed-size text field, discarding the zero padding.
    /// Used by the headers that store texts in fixed character arrays.
    pub fn read_fixed(read: &mut impl Read, field_len: usize) -> Result<Self> {
        let mut bytes = vec![0_u8; field_len];
        u8::read_slice_le(read, &mut bytes)?;

        let text_len = bytes.iter().position(|&byte| byte == 0).unwrap_or(field_len);
        bytes.truncate(text_len);

        Text::from_bytes(SmallVec::from_vec(bytes))
    }

    /// Write this text into a fixed-size field, padded with zeroes.
    /// Texts longer than the field are truncated.
    pub fn write_fixed(&self, write: &mut impl Write, field_len: usize) -> UnitResult {
        let text_len = self.len().min(field_len);
        u8::write_slice_le(write, &self.as_slice()[.. text_len])?;

        for _ in text_len .. field_len {
            0_u8.write_le(write)?;
        }

        Ok(())
    }
}

impl<'s> From<&'s str> for Text {

    /// Panics if the string contains a null byte.
    fn from(string: &'s str) -> Self {
        Text::from_bytes(SmallVec::from_slice(string.as_bytes()))
            .expect("text must not contain null bytes")
    }
}

impl std::fmt::Display for Text {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", String::from_utf8_lossy(self.as_slice()))
    }
}

impl std::fmt::Debug for Text {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "\"{}\"", self)
    }
}

impl PartialEq<str> for Text {
    fn eq(&self, other: &str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}


/// A rectangular section anywhere in 2D integer space.
/// The position may be negative, the size may not.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
pub struct IntegerBounds {

    /// The top left position of the rectangle.
    pub position: Vec2<i32>,

    /// The width and height of the rectangle.
    pub size: Vec2<usize>,
}

impl IntegerBounds {

    /// Create bounds at position zero with the specified size.
    pub fn from_dimensions(size: impl Into<Vec2<usize>>) -> Self {
        Self::new(Vec2(0, 0), size)
    }

    /// Create bounds with the specified position and size.
    pub fn new(position: impl Into<Vec2<i32>>, size: impl Into<Vec2<usize>>) -> Self {
        Self { position: position.into(), size: size.into() }
    }

    /// The exclusive bottom right corner of the rectangle.
    pub fn end(self) -> Vec2<i32> {
        self.position + self.size.to_i32()
    }

    /// Returns the bounds, moved to the specified origin.
    pub fn with_origin(self, origin: Vec2<i32>) -> Self {
        IntegerBounds { position: self.position + origin, size: self.size }
    }

    /// Validate that this rectangle is not degenerate
    /// and fits into the optional maximum size.
    pub fn validate(&self, max_size: Option<Vec2<usize>>) -> UnitResult {
        if let Some(max) = max_size {
            if self.size.width() > max.width() || self.size.height() > max.height() {
                return Err(Error::malformed("window exceeds maximum size"));
            }
        }

        // checked in widened math, as `end` is only safe after validation
        let end_x = self.position.x() as i64 + self.size.width() as i64;
        let end_y = self.position.y() as i64 + self.size.height() as i64;

        if end_x > i32::MAX as i64 || end_y > i32::MAX as i64 {
            return Err(Error::malformed("window coordinates overflow"));
        }

        Ok(())
    }

    /// Read the rectangle from four little endian `i32` values,
    /// stored as inclusive minimum and maximum coordinates.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        let x_min = i32::read_le(read)?;
        let y_min = i32::read_le(read)?;
        let x_max = i32::read_le(read)?;
        let y_max = i32::read_le(read)?;

        if x_max < x_min || y_max < y_min {
            return Err(Error::malformed("inverted window bounds"));
        }

        // corrupt extreme coordinates must not overflow the size math
        let width = x_max as i64 - x_min as i64 + 1;
        let height = y_max as i64 - y_min as i64 + 1;

        if width > i32::MAX as i64 || height > i32::MAX as i64 {
            return Err(Error::malformed("window size exceeds integer maximum"));
        }

        Ok(IntegerBounds {
            position: Vec2(x_min, y_min),
            size: Vec2(width as usize, height as usize),
        })
    }

    /// Write the rectangle as four little endian `i32` values,
    /// stored as inclusive minimum and maximum coordinates.
    pub fn write_le(self, write: &mut impl Write) -> UnitResult {
        if self.size.area() == 0 {
            return Err(Error::unsupported("empty window"));
        }

        let end = self.end();
        self.position.x().write_le(write)?;
        self.position.y().write_le(write)?;
        (end.x() - 1).write_le(write)?;
        (end.y() - 1).write_le(write)
    }

    /// Whether the specified other rectangle is fully contained in this one.
    pub fn contains(self, other: Self) -> bool {
        other.position.x() >= self.position.x()
            && other.position.y() >= self.position.y()
            && other.end().x() <= self.end().x()
            && other.end().y() <= self.end().y()
    }
}


/// The storage type of a single sample value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SampleType {

    /// An 8-bit unsigned integer, used by the raster formats.
    U8,

    /// A 16-bit unsigned integer, used by the raster formats.
    U16,

    /// A 32-bit unsigned integer.
    U32,

    /// A 16-bit float.
    F16,

    /// A 32-bit float.
    F32,
}

impl SampleType {

    /// Number of bytes one sample of this type occupies.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 | SampleType::F16 => 2,
            SampleType::U32 | SampleType::F32 => 4,
        }
    }

    /// Number of bits one sample of this type occupies.
    pub fn bits_per_sample(self) -> u8 {
        (self.bytes_per_sample() * 8) as u8
    }

    /// Whether this is one of the two floating point types.
    pub fn is_floating_point(self) -> bool {
        match self {
            SampleType::F16 | SampleType::F32 => true,
            _ => false,
        }
    }

    /// Read the type from the deep container's little endian `i32` code.
    /// The container cannot express the 8 and 16-bit integer types.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        match i32::read_le(read)? {
            0 => Ok(SampleType::U32),
            1 => Ok(SampleType::F16),
            2 => Ok(SampleType::F32),
            _ => Err(Error::malformed("unsupported channel sample type code")),
        }
    }

    /// Write the type as the deep container's little endian `i32` code.
    pub fn write_le(self, write: &mut impl Write) -> UnitResult {
        match self {
            SampleType::U32 => 0_i32.write_le(write),
            SampleType::F16 => 1_i32.write_le(write),
            SampleType::F32 => 2_i32.write_le(write),
            SampleType::U8 | SampleType::U16 =>
                Err(Error::unsupported("integer channel type in deep container")),
        }
    }
}


/// Describes a single channel of an image: its name, storage type,
/// and, for formats that pack fewer significant bits into a wider
/// container, the actual bit depth of the stored values.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelDescription {

    /// The name that uniquely identifies the channel within its header.
    pub name: Text,

    /// The storage type of the channel's samples.
    pub sample_type: SampleType,

    /// The number of significant bits per sample, where it differs from
    /// the storage type. `None` means all bits of the storage type are used.
    /// Decoding rescales the stored range into the full storage range.
    pub bits_per_sample: Option<u8>,

    /// Whether the samples should be quantized linearly by lossy compressors.
    /// Round-tripped, but ignored by the lossless codecs in this crate.
    pub quantize_linearly: bool,
}

impl ChannelDescription {

    /// Create a channel that uses all bits of its storage type.
    pub fn new(name: impl Into<Text>, sample_type: SampleType) -> Self {
        Self {
            name: name.into(),
            sample_type,
            bits_per_sample: None,
            quantize_linearly: false,
        }
    }

    /// Set an explicit bit depth smaller than the storage type.
    pub fn with_bits(self, bits_per_sample: u8) -> Self {
        Self { bits_per_sample: Some(bits_per_sample), ..self }
    }

    /// The number of significant bits per sample.
    pub fn significant_bits(&self) -> u8 {
        self.bits_per_sample.unwrap_or_else(|| self.sample_type.bits_per_sample())
    }

    /// Read a channel from the deep container's channel list entry.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        let name = Text::read_null_terminated(read, 255)?;
        let sample_type = SampleType::read_le(read)?;

        let quantize_linearly = match u8::read_le(read)? {
            0 => false,
            1 => true,
            _ => return Err(Error::malformed("channel quantization flag")),
        };

        skip_bytes(read, 3)?; // reserved bytes

        let x_sampling = i32::read_le(read)?;
        let y_sampling = i32::read_le(read)?;
        if x_sampling != 1 || y_sampling != 1 {
            return Err(Error::unsupported("subsampled channels"));
        }

        Ok(ChannelDescription { name, sample_type, bits_per_sample: None, quantize_linearly })
    }

    /// Write a channel as the deep container's channel list entry.
    pub fn write_le(&self, write: &mut impl Write) -> UnitResult {
        if self.name.is_empty() {
            return Err(Error::unsupported("empty channel name"));
        }

        self.name.write_null_terminated(write)?;
        self.sample_type.write_le(write)?;
        u8::write_le(if self.quantize_linearly { 1 } else { 0 }, write)?;
        u8::write_slice_le(write, &[0_u8; 3])?; // reserved bytes
        1_i32.write_le(write)?; // x sampling
        1_i32.write_le(write) // y sampling
    }
}


/// The ordered list of channels in a header.
/// The order defines the on-disk interleaving of packed formats.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelList {

    /// The channels in this list.
    pub list: SmallVec<[ChannelDescription; 5]>,

    /// Number of bytes one flat pixel of all channels occupies.
    /// Derived from the list and cached here.
    pub bytes_per_pixel: usize,
}

impl ChannelList {

    /// Create a channel list and compute the byte size of one pixel.
    pub fn new(list: SmallVec<[ChannelDescription; 5]>) -> Self {
        let bytes_per_pixel = list.iter()
            .map(|channel| channel.sample_type.bytes_per_sample())
            .sum();

        ChannelList { list, bytes_per_pixel }
    }

    /// Find the index of the channel with the specified name.
    pub fn find_index_of(&self, name: &Text) -> Option<usize> {
        self.list.iter().position(|channel| &channel.name == name)
    }

    /// Index of the alpha channel, identified by its name being `A` or `a`.
    pub fn alpha_index(&self) -> Option<usize> {
        self.list.iter().position(|channel|
            channel.name == *"A" || channel.name == *"a" || channel.name == *"alpha"
        )
    }

    /// Read the deep container's channel list, ending at the null byte.
    pub fn read_le(read: &mut PeekRead<impl Read>) -> Result<Self> {
        let mut channels = SmallVec::new();

        while !read.skip_if_eq(0)? {
            channels.push(ChannelDescription::read_le(read)?);

            if channels.len() > 4096 {
                return Err(Error::malformed("too many channels"));
            }
        }

        if channels.is_empty() {
            return Err(Error::malformed("empty channel list"));
        }

        Ok(ChannelList::new(channels))
    }

    /// Write the deep container's channel list, ending with a null byte.
    pub fn write_le(&self, write: &mut impl Write) -> UnitResult {
        for channel in &self.list {
            channel.write_le(write)?;
        }

        0_u8.write_le(write)
    }
}


/// Whether an image stores one resolution or a pyramid of levels.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum LevelMode {

    /// Only the full resolution is stored.
    Singular,

    /// A chain of levels, each half the width and half the height of the previous.
    MipMap,

    /// A grid of levels varying width and height independently.
    RipMap,
}

/// Describes how a tiled image is split into tiles,
/// and whether it stores reduced resolution levels.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct TileDescription {

    /// Width and height of every tile, except those clipped by the image edge.
    pub tile_size: Vec2<usize>,

    /// Whether reduced resolution levels exist.
    pub level_mode: LevelMode,

    /// Whether level dimensions are computed rounding down or up.
    pub rounding_mode: RoundingMode,
}

impl TileDescription {

    /// Read the tiling descriptor from two little endian `u32` dimensions and a mode byte.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        let x_size = u32::read_le(read)? as usize;
        let y_size = u32::read_le(read)? as usize;

        if x_size == 0 || y_size == 0 || x_size > 65536 || y_size > 65536 {
            return Err(Error::malformed("tile size"));
        }

        let mode = u8::read_le(read)?;

        let level_mode = match mode & 0b0000_1111 {
            0 => LevelMode::Singular,
            1 => LevelMode::MipMap,
            2 => LevelMode::RipMap,
            _ => return Err(Error::malformed("tile level mode")),
        };

        let rounding_mode = match mode >> 4 {
            0 => RoundingMode::Down,
            1 => RoundingMode::Up,
            _ => return Err(Error::malformed("tile rounding mode")),
        };

        Ok(TileDescription { tile_size: Vec2(x_size, y_size), level_mode, rounding_mode })
    }

    /// Write the tiling descriptor as two little endian `u32` dimensions and a mode byte.
    pub fn write_le(&self, write: &mut impl Write) -> UnitResult {
        usize_to_u32(self.tile_size.width(), "tile width")?.write_le(write)?;
        usize_to_u32(self.tile_size.height(), "tile height")?.write_le(write)?;

        let level_mode = match self.level_mode {
            LevelMode::Singular => 0_u8,
            LevelMode::MipMap => 1,
            LevelMode::RipMap => 2,
        };

        let rounding_mode = match self.rounding_mode {
            RoundingMode::Down => 0_u8,
            RoundingMode::Up => 1,
        };

        ((rounding_mode << 4) | level_mode).write_le(write)
    }
}


/// In what order the chunks of an image appear in the file.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum LineOrder {

    /// Chunks appear top to bottom.
    Increasing,

    /// Chunks appear bottom to top.
    Decreasing,

    /// Chunks may appear in any order, each carrying its own coordinate.
    Unspecified,
}

impl LineOrder {

    /// Read the line order from its byte code.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        match u8::read_le(read)? {
            0 => Ok(LineOrder::Increasing),
            1 => Ok(LineOrder::Decreasing),
            2 => Ok(LineOrder::Unspecified),
            _ => Err(Error::malformed("line order code")),
        }
    }

    /// Write the line order as its byte code.
    pub fn write_le(self, write: &mut impl Write) -> UnitResult {
        match self {
            LineOrder::Increasing => 0_u8.write_le(write),
            LineOrder::Decreasing => 1_u8.write_le(write),
            LineOrder::Unspecified => 2_u8.write_le(write),
        }
    }
}


/// How the colour channels of an image relate to its alpha channel.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum AlphaMode {

    /// Colour channels are stored independently of alpha.
    /// Most raster formats store unassociated alpha.
    Unassociated,

    /// Colour channels are already multiplied by alpha.
    Associated,
}
