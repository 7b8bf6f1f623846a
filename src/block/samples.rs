
//! The sample value type and the strided frame buffer views.
//!
//! A frame buffer describes caller-owned memory that pixels are decoded
//! into or encoded from. Callers routinely pass negative or non-contiguous
//! strides, for example to flip an image or to write into a sub-rectangle,
//! so all index-to-address math lives in one checked helper here instead
//! of being repeated in every codec.

use smallvec::SmallVec;
use half::f16;

use crate::math::Vec2;
use crate::meta::attribute::{ChannelList, SampleType, Text};
use crate::error::{Error, Result, UnitResult};

/// A single sample value of any supported storage type.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Sample {

    /// An 8-bit unsigned integer sample.
    U8(u8),

    /// A 16-bit unsigned integer sample.
    U16(u16),

    /// A 32-bit unsigned integer sample.
    U32(u32),

    /// A 16-bit float sample.
    F16(f16),

    /// A 32-bit float sample.
    F32(f32),
}

impl Sample {

    /// The storage type of this sample.
    pub fn sample_type(self) -> SampleType {
        match self {
            Sample::U8(_) => SampleType::U8,
            Sample::U16(_) => SampleType::U16,
            Sample::U32(_) => SampleType::U32,
            Sample::F16(_) => SampleType::F16,
            Sample::F32(_) => SampleType::F32,
        }
    }

    /// Convert the sample to an f32 value.
    #[inline]
    pub fn to_f32(self) -> f32 {
        match self {
            Sample::U8(sample) => sample as f32,
            Sample::U16(sample) => sample as f32,
            Sample::U32(sample) => sample as f32,
            Sample::F16(sample) => sample.to_f32(),
            Sample::F32(sample) => sample,
        }
    }

    /// Whether a sample of this type can be stored as the specified type
    /// without an arbitrary scaling decision. The floating point types and
    /// `U32` convert freely into each other; the integer raster types only
    /// match themselves, because integer-to-integer scaling is the job of
    /// the bit-depth conversion in the pixel pipeline, not of the frame buffer.
    pub fn types_are_convertible(source: SampleType, target: SampleType) -> bool {
        use SampleType::*;

        match (source, target) {
            (a, b) if a == b => true,
            (F16 | F32 | U32, F16 | F32 | U32) => true,
            _ => false,
        }
    }

    /// Convert this sample into the specified storage type.
    ///
    /// Panics for conversions that `types_are_convertible` rejects.
    /// Codecs check convertibility once per call, before any pixel work.
    pub fn convert_to(self, target: SampleType) -> Sample {
        if self.sample_type() == target {
            return self;
        }

        assert!(
            Self::types_are_convertible(self.sample_type(), target),
            "no defined conversion from {:?} to {:?}", self.sample_type(), target
        );

        match target {
            SampleType::F32 => Sample::F32(self.to_f32()),
            SampleType::F16 => Sample::F16(f16::from_f32(self.to_f32())),
            SampleType::U32 => Sample::U32(match self {
                Sample::U32(value) => value,
                Sample::F16(value) => value.to_f32().max(0.0) as u32,
                Sample::F32(value) => value.max(0.0) as u32,
                _ => unreachable!("conversion checked above"),
            }),
            SampleType::U8 | SampleType::U16 => unreachable!("conversion checked above"),
        }
    }

    /// Read this sample from native-endian in-memory bytes.
    #[inline]
    fn from_ne_bytes(bytes: &[u8], sample_type: SampleType) -> Sample {
        use std::convert::TryInto;

        match sample_type {
            SampleType::U8 => Sample::U8(bytes[0]),
            SampleType::U16 => Sample::U16(u16::from_ne_bytes(bytes.try_into().expect("slice size bug"))),
            SampleType::U32 => Sample::U32(u32::from_ne_bytes(bytes.try_into().expect("slice size bug"))),
            SampleType::F16 => Sample::F16(f16::from_ne_bytes(bytes.try_into().expect("slice size bug"))),
            SampleType::F32 => Sample::F32(f32::from_ne_bytes(bytes.try_into().expect("slice size bug"))),
        }
    }

    /// Write this sample as native-endian in-memory bytes.
    #[inline]
    fn write_ne_bytes(self, bytes: &mut [u8]) {
        match self {
            Sample::U8(value) => bytes[0] = value,
            Sample::U16(value) => bytes.copy_from_slice(&value.to_ne_bytes()),
            Sample::U32(value) => bytes.copy_from_slice(&value.to_ne_bytes()),
            Sample::F16(value) => bytes.copy_from_slice(&value.to_ne_bytes()),
            Sample::F32(value) => bytes.copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

impl From<u8> for Sample { fn from(value: u8) -> Self { Sample::U8(value) } }
impl From<u16> for Sample { fn from(value: u16) -> Self { Sample::U16(value) } }
impl From<u32> for Sample { fn from(value: u32) -> Self { Sample::U32(value) } }
impl From<f16> for Sample { fn from(value: f16) -> Self { Sample::F16(value) } }
impl From<f32> for Sample { fn from(value: f32) -> Self { Sample::F32(value) } }


/// Describes where the samples of one channel live
/// inside the byte buffer of a frame buffer.
///
/// All offsets are in bytes. Strides may be negative and may leave gaps;
/// with a suitable base offset this addresses interleaved, planar,
/// and vertically flipped layouts alike.
#[derive(Clone, Debug)]
pub struct SliceDescription {

    /// Channel name, matched against the header's channel names.
    pub channel: Text,

    /// In-memory storage type of this slice.
    pub sample_type: SampleType,

    /// Byte offset of the sample at data window position `(0, 0)`.
    pub base_byte_offset: i64,

    /// Bytes between horizontally adjacent samples.
    pub x_stride: i64,

    /// Bytes between vertically adjacent samples.
    pub y_stride: i64,
}

impl SliceDescription {

    /// Byte position of the sample at the specified data window position.
    ///
    /// Panics if the position addresses bytes outside the buffer, as the
    /// slice description not covering the requested pixel range is a
    /// contract violation by the caller, not a property of the file.
    #[inline]
    fn byte_range(&self, position: Vec2<usize>, buffer_len: usize) -> std::ops::Range<usize> {
        let index = self.base_byte_offset
            + position.x() as i64 * self.x_stride
            + position.y() as i64 * self.y_stride;

        let size = self.sample_type.bytes_per_sample() as i64;

        assert!(
            index >= 0 && index + size <= buffer_len as i64,
            "frame buffer slice addresses byte {} outside of the {} byte buffer", index, buffer_len
        );

        index as usize .. (index + size) as usize
    }
}


/// An immutable view of caller memory that pixels are encoded from.
#[derive(Debug)]
pub struct FrameBuffer<'b> {
    bytes: &'b [u8],
    slices: SmallVec<[SliceDescription; 5]>,
}

/// A mutable view of caller memory that pixels are decoded into.
#[derive(Debug)]
pub struct FrameBufferMut<'b> {
    bytes: &'b mut [u8],
    slices: SmallVec<[SliceDescription; 5]>,
}

/// Build slice descriptions for the common case of pixel-interleaved
/// channels in top-down row-major order, one slice per channel name.
pub fn interleaved_slices(
    channel_names: impl IntoIterator<Item=Text>,
    sample_type: SampleType, image_width: usize,
) -> SmallVec<[SliceDescription; 5]>
{
    let channel_names: Vec<Text> = channel_names.into_iter().collect();
    let sample_size = sample_type.bytes_per_sample() as i64;
    let pixel_size = sample_size * channel_names.len() as i64;

    channel_names.into_iter().enumerate()
        .map(|(channel_index, channel)| SliceDescription {
            channel,
            sample_type,
            base_byte_offset: channel_index as i64 * sample_size,
            x_stride: pixel_size,
            y_stride: pixel_size * image_width as i64,
        })
        .collect()
}

impl<'b> FrameBuffer<'b> {

    /// Create a view of the specified memory.
    pub fn new(bytes: &'b [u8], slices: SmallVec<[SliceDescription; 5]>) -> Self {
        Self { bytes, slices }
    }

    /// The slice descriptions of this buffer.
    pub fn slices(&self) -> &[SliceDescription] { &self.slices }

    /// Read the sample of the specified slice at the specified data window position.
    #[inline]
    pub fn sample(&self, slice_index: usize, position: Vec2<usize>) -> Sample {
        let slice = &self.slices[slice_index];
        let range = slice.byte_range(position, self.bytes.len());
        Sample::from_ne_bytes(&self.bytes[range], slice.sample_type)
    }

    /// Match this buffer's slices against the channels of a header, in
    /// header channel order. Fails if a channel has no slice of a
    /// convertible type. Returns one slice index per channel.
    pub fn match_channels(&self, channels: &ChannelList) -> Result<SmallVec<[usize; 5]>> {
        match_slices(&self.slices, channels)
    }
}

impl<'b> FrameBufferMut<'b> {

    /// Create a mutable view of the specified memory.
    pub fn new(bytes: &'b mut [u8], slices: SmallVec<[SliceDescription; 5]>) -> Self {
        Self { bytes, slices }
    }

    /// The slice descriptions of this buffer.
    pub fn slices(&self) -> &[SliceDescription] { &self.slices }

    /// Read the sample of the specified slice at the specified data window position.
    #[inline]
    pub fn sample(&self, slice_index: usize, position: Vec2<usize>) -> Sample {
        let slice = &self.slices[slice_index];
        let range = slice.byte_range(position, self.bytes.len());
        Sample::from_ne_bytes(&self.bytes[range], slice.sample_type)
    }

    /// Store a sample in the specified slice at the specified data window
    /// position, converting it to the slice's storage type.
    #[inline]
    pub fn set_sample(&mut self, slice_index: usize, position: Vec2<usize>, sample: Sample) {
        let slice = &self.slices[slice_index];
        let range = slice.byte_range(position, self.bytes.len());
        sample.convert_to(slice.sample_type).write_ne_bytes(&mut self.bytes[range]);
    }

    /// Match this buffer's slices against the channels of a header, in
    /// header channel order. Fails if a channel has no slice of a
    /// convertible type. Returns one slice index per channel.
    pub fn match_channels(&self, channels: &ChannelList) -> Result<SmallVec<[usize; 5]>> {
        match_slices(&self.slices, channels)
    }
}

/// Find one slice per channel, by name, and check type convertibility once,
/// so that the per-pixel conversions cannot fail later.
fn match_slices(slices: &[SliceDescription], channels: &ChannelList) -> Result<SmallVec<[usize; 5]>> {
    let mut indices = SmallVec::with_capacity(channels.list.len());

    for channel in &channels.list {
        let slice_index = slices.iter()
            .position(|slice| slice.channel == channel.name)
            .ok_or_else(|| Error::type_mismatch(
                format!("no frame buffer slice for channel \"{}\"", channel.name)
            ))?;

        let slice = &slices[slice_index];
        if !Sample::types_are_convertible(channel.sample_type, slice.sample_type)
            || !Sample::types_are_convertible(slice.sample_type, channel.sample_type)
        {
            return Err(Error::type_mismatch(format!(
                "channel \"{}\" of type {:?} cannot be converted to frame buffer type {:?}",
                channel.name, channel.sample_type, slice.sample_type
            )));
        }

        indices.push(slice_index);
    }

    Ok(indices)
}

/// Check that a frame buffer covers all channels of a header, without
/// building the index list. Used by the write paths for early validation.
pub fn validate_slices(slices: &[SliceDescription], channels: &ChannelList) -> UnitResult {
    match_slices(slices, channels).map(|_| ())
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::attribute::ChannelDescription;

    #[test]
    fn interleaved_addressing(){
        let mut bytes = vec![0_u8; 4 * 2 * 3]; // 4x2 pixels, interleaved rgb u8

        let slices = interleaved_slices(
            vec![Text::from("R"), Text::from("G"), Text::from("B")],
            SampleType::U8, 4,
        );

        let mut buffer = FrameBufferMut::new(&mut bytes, slices);
        buffer.set_sample(2, Vec2(3, 1), Sample::U8(77)); // blue of last pixel

        assert_eq!(buffer.sample(2, Vec2(3, 1)), Sample::U8(77));
        assert_eq!(*buffer.bytes.last().unwrap(), 77);
    }

    #[test]
    fn negative_strides_flip_rows(){
        let width = 2;
        let height = 3;
        let mut bytes = vec![0_u8; width * height];

        // base at the last row, negative y stride
        let slices: SmallVec<[SliceDescription; 5]> = smallvec::smallvec![SliceDescription {
            channel: Text::from("Y"),
            sample_type: SampleType::U8,
            base_byte_offset: (width * (height - 1)) as i64,
            x_stride: 1,
            y_stride: -(width as i64),
        }];

        let mut buffer = FrameBufferMut::new(&mut bytes, slices);
        buffer.set_sample(0, Vec2(0, 0), Sample::U8(1));
        buffer.set_sample(0, Vec2(1, 2), Sample::U8(9));

        assert_eq!(bytes, vec![0, 9,  0, 0,  1, 0]);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_slice_panics(){
        let mut bytes = vec![0_u8; 4];
        let slices = interleaved_slices(vec![Text::from("Y")], SampleType::U8, 4);
        let mut buffer = FrameBufferMut::new(&mut bytes, slices);
        buffer.set_sample(0, Vec2(0, 1), Sample::U8(0));
    }

    #[test]
    fn type_matching(){
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::U8),
        ]);

        let compatible = interleaved_slices(vec![Text::from("R")], SampleType::U8, 1);
        assert!(validate_slices(&compatible, &channels).is_ok());

        let incompatible = interleaved_slices(vec![Text::from("R")], SampleType::U16, 1);
        assert!(matches!(
            validate_slices(&incompatible, &channels),
            Err(crate::error::Error::TypeMismatch(_))
        ));

        let missing = interleaved_slices(vec![Text::from("G")], SampleType::U8, 1);
        assert!(validate_slices(&missing, &channels).is_err());
    }
}
