
//! Specialized binary input and output.
//! Uses the error handling for this crate.

pub use ::std::io::{Read, Write};

use ::half::f16;
use lebe::prelude::*;
use crate::error::{Error, Result, UnitResult, IoResult, i32_to_usize, usize_to_i32};
use std::io::{Seek, SeekFrom};

/// Skip reading uninteresting bytes without allocating.
#[inline]
pub fn skip_bytes(read: &mut impl Read, count: usize) -> IoResult<()> {
    let skipped = std::io::copy(
        &mut read.by_ref().take(count as u64),
        &mut std::io::sink()
    )?;

    // the reader may have ended before the skip was complete
    if skipped < count as u64 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "skip out of bounds"));
    }

    Ok(())
}

/// Pad a write to the specified alignment by emitting zero bytes.
#[inline]
pub fn pad_to_alignment(write: &mut impl Write, written_bytes: usize, alignment: usize) -> IoResult<()> {
    let remainder = written_bytes % alignment;

    if remainder != 0 {
        let zeros = [0_u8; 8];
        write.write_all(&zeros[.. alignment - remainder])?;
    }

    Ok(())
}

/// Peek a single byte without consuming it.
#[derive(Debug)]
pub struct PeekRead<T> {

    /// Cannot be exposed as it will not contain peeked values anymore.
    inner: T,

    peeked: Option<IoResult<u8>>,
}

impl<T: Read> PeekRead<T> {

    /// Wrap a reader to make it peekable.
    #[inline]
    pub fn new(inner: T) -> Self {
        Self { inner, peeked: None }
    }

    /// Read a single byte and return that without consuming it.
    /// The next `read` call will include that byte.
    #[inline]
    pub fn peek_u8(&mut self) -> &IoResult<u8> {
        self.peeked = self.peeked.take().or_else(|| {
            let mut byte = [0_u8];
            Some(self.inner.read_exact(&mut byte).map(|()| byte[0]))
        });

        self.peeked.as_ref().unwrap() // unwrap cannot fail because we just set it
    }

    /// Skip a single byte if it equals the specified value.
    /// Returns whether the value was found.
    /// Consumes the peeked result if an error occurred.
    #[inline]
    pub fn skip_if_eq(&mut self, value: u8) -> IoResult<bool> {
        match self.peek_u8() {
            Ok(peeked) if *peeked == value => {
                self.peeked = None; // consume the byte
                Ok(true)
            },

            Ok(_) => Ok(false),

            // return the error otherwise.
            // unwrap is safe because this branch cannot be reached otherwise.
            // we need to take() from self because io errors cannot be cloned.
            Err(_) => Err(self.peeked.take().unwrap().err().unwrap())
        }
    }
}

impl<T: Read> Read for PeekRead<T> {
    fn read(&mut self, target_buffer: &mut [u8]) -> IoResult<usize> {
        if target_buffer.is_empty() {
            return Ok(0)
        }

        match self.peeked.take() {
            None => self.inner.read(target_buffer),
            Some(peeked) => {
                target_buffer[0] = peeked?;

                // indexing [1..] is safe because an empty buffer already returned ok
                Ok(1 + self.inner.read(&mut target_buffer[1..])?)
            }
        }
    }
}

impl<T: Read + Seek> PeekRead<Tracking<T>> {

    /// Seek this read to the specified byte position.
    /// Discards any previously peeked value.
    pub fn skip_to(&mut self, position: usize) -> IoResult<()> {
        self.inner.seek_read_to(position)?;
        self.peeked = None;
        Ok(())
    }

    /// Current number of bytes read.
    pub fn byte_position(&self) -> usize {
        self.inner.byte_position()
    }
}

/// Keep track of what byte we are at.
/// Used to skip back to a previous place after writing some information.
#[derive(Debug)]
pub struct Tracking<T> {

    /// Do not expose to prevent seeking without updating position.
    inner: T,

    position: usize,
}

impl<T: Read> Read for Tracking<T> {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        let count = self.inner.read(buffer)?;
        self.position += count;
        Ok(count)
    }
}

impl<T: Write> Write for Tracking<T> {
    fn write(&mut self, buffer: &[u8]) -> IoResult<usize> {
        let count = self.inner.write(buffer)?;
        self.position += count;
        Ok(count)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.flush()
    }
}

impl<T> Tracking<T> {

    /// If `inner` is a reference, it must never be seeked directly,
    /// but only through this `Tracking` instance.
    pub fn new(inner: T) -> Self {
        Tracking { inner, position: 0 }
    }

    /// Current number of bytes written or read.
    pub fn byte_position(&self) -> usize {
        self.position
    }
}

impl<T: Read + Seek> Tracking<T> {

    /// Set the reader to the specified byte position.
    /// If it is only a couple of bytes, no seek system call is performed.
    pub fn seek_read_to(&mut self, target_position: usize) -> IoResult<()> {
        let delta = target_position as i64 - self.position as i64;

        if delta > 0 && delta < 16 {
            skip_bytes(&mut self.inner, delta as usize)?;
            self.position += delta as usize;
        }
        else if delta != 0 {
            self.inner.seek(SeekFrom::Start(target_position as u64))?;
            self.position = target_position;
        }

        Ok(())
    }
}

impl<T: Write + Seek> Tracking<T> {

    /// Move the writing cursor to the specified target byte index.
    /// If seeking forward, this will write zeroes.
    pub fn seek_write_to(&mut self, target_position: usize) -> IoResult<()> {
        if target_position < self.position {
            self.inner.seek(SeekFrom::Start(target_position as u64))?;
        }
        else if target_position > self.position {
            std::io::copy(
                &mut std::io::repeat(0).take((target_position - self.position) as u64),
                self
            )?;
        }

        self.position = target_position;
        Ok(())
    }
}


/// Generic trait that defines common binary operations such as reading and writing for this type.
/// The formats in this crate are not uniform in their endianness, so each
/// operation exists once per byte order, named explicitly.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume in a file.
    const BYTE_SIZE: usize = ::std::mem::size_of::<Self>();

    /// Read a value of type `Self` from little endian bytes.
    fn read_le(read: &mut impl Read) -> Result<Self>;

    /// Read a value of type `Self` from big endian bytes.
    fn read_be(read: &mut impl Read) -> Result<Self>;

    /// Fill the slice with values read from little endian bytes.
    fn read_slice_le(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Fill the slice with values read from big endian bytes.
    fn read_slice_be(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write this value as little endian bytes.
    fn write_le(self, write: &mut impl Write) -> UnitResult;

    /// Write this value as big endian bytes.
    fn write_be(self, write: &mut impl Write) -> UnitResult;

    /// Write all values of the slice as little endian bytes.
    fn write_slice_le(write: &mut impl Write, slice: &[Self]) -> UnitResult;

    /// Write all values of the slice as big endian bytes.
    fn write_slice_be(write: &mut impl Write, slice: &[Self]) -> UnitResult;


    /// Read as many little endian values of type `Self` as specified with `data_size`.
    ///
    /// This method will not allocate more memory than `soft_max` at once.
    /// If `hard_max` is specified, it will never read any more than that.
    /// Returns `Error::CorruptData` if the reader does not contain the desired number of elements.
    #[inline]
    fn read_vec_le(read: &mut impl Read, data_size: usize, soft_max: usize, hard_max: Option<usize>, purpose: &'static str) -> Result<Vec<Self>> {
        let mut vec = Vec::with_capacity(data_size.min(soft_max));
        Self::read_into_vec_le(read, &mut vec, data_size, soft_max, hard_max, purpose)?;
        Ok(vec)
    }

    /// Read as many little endian values of type `Self` as specified with `data_size` into the provided vector.
    ///
    /// This method will not allocate more memory than `soft_max` at once.
    /// If `hard_max` is specified, it will never read any more than that.
    /// Returns `Error::CorruptData` if the reader does not contain the desired number of elements.
    #[inline]
    fn read_into_vec_le(read: &mut impl Read, data: &mut Vec<Self>, data_size: usize, soft_max: usize, hard_max: Option<usize>, purpose: &'static str) -> UnitResult {
        if let Some(max) = hard_max {
            if data_size > max {
                return Err(Error::corrupt(purpose))
            }
        }

        let soft_max = hard_max.unwrap_or(soft_max).min(soft_max);
        let end = data.len() + data_size;

        // do not allocate more than `soft_max` elements at once
        // (most of the time, this loop will run only once)
        while data.len() < end {
            let chunk_start = data.len();
            let chunk_end = (chunk_start + soft_max).min(end);

            data.resize(chunk_end, Self::default());
            Self::read_slice_le(read, &mut data[chunk_start .. chunk_end])?;
        }

        Ok(())
    }

    /// Write the length of the slice as a little endian `i32` and then the contents.
    #[inline]
    fn write_i32_sized_slice_le<W: Write>(write: &mut W, slice: &[Self]) -> UnitResult {
        usize_to_i32(slice.len(), "slice byte length")?.write_le(write)?;
        Self::write_slice_le(write, slice)
    }

    /// Read a little endian `i32` element count and then read that many items into a vector.
    ///
    /// This method will not allocate more memory than `soft_max` at once.
    /// If `hard_max` is specified, it will never read any more than that.
    /// Returns `Error::CorruptData` if the reader does not contain the desired number of elements.
    #[inline]
    fn read_i32_sized_vec_le(read: &mut impl Read, soft_max: usize, hard_max: Option<usize>, purpose: &'static str) -> Result<Vec<Self>> {
        let size = i32_to_usize(i32::read_le(read)?, purpose)?;
        Self::read_vec_le(read, size, soft_max, hard_max, purpose)
    }
}


macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            #[inline]
            fn read_le(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            #[inline]
            fn read_be(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_big_endian()?)
            }

            #[inline]
            fn write_le(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            #[inline]
            fn write_be(self, write: &mut impl Write) -> UnitResult {
                write.write_as_big_endian(&self)?;
                Ok(())
            }

            #[inline]
            fn read_slice_le(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            #[inline]
            fn read_slice_be(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_big_endian_into(slice)?;
                Ok(())
            }

            #[inline]
            fn write_slice_le(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }

            #[inline]
            fn write_slice_be(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_big_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);
implement_data_for_primitive!(f32);
implement_data_for_primitive!(f64);


impl Data for f16 {
    #[inline]
    fn read_le(read: &mut impl Read) -> Result<Self> {
        u16::read_le(read).map(f16::from_bits)
    }

    #[inline]
    fn read_be(read: &mut impl Read) -> Result<Self> {
        u16::read_be(read).map(f16::from_bits)
    }

    #[inline]
    fn read_slice_le(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
        for value in slice.iter_mut() { *value = f16::read_le(read)?; }
        Ok(())
    }

    #[inline]
    fn read_slice_be(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
        for value in slice.iter_mut() { *value = f16::read_be(read)?; }
        Ok(())
    }

    #[inline]
    fn write_le(self, write: &mut impl Write) -> UnitResult {
        self.to_bits().write_le(write)
    }

    #[inline]
    fn write_be(self, write: &mut impl Write) -> UnitResult {
        self.to_bits().write_be(write)
    }

    #[inline]
    fn write_slice_le(write: &mut impl Write, slice: &[Self]) -> UnitResult {
        for value in slice { value.write_le(write)?; }
        Ok(())
    }

    #[inline]
    fn write_slice_be(write: &mut impl Write, slice: &[Self]) -> UnitResult {
        for value in slice { value.write_be(write)?; }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn peek(){
        let buffer: &[u8] = &[0, 1, 2, 3];
        let mut peek = PeekRead::new(buffer);

        assert_eq!(peek.peek_u8().as_ref().unwrap(), &0);
        assert_eq!(peek.peek_u8().as_ref().unwrap(), &0);
        assert_eq!(u8::read_le(&mut peek).unwrap(), 0_u8);

        assert_eq!(peek.read(&mut [0, 0]).unwrap(), 2);

        assert_eq!(peek.peek_u8().as_ref().unwrap(), &3);
        assert_eq!(u8::read_le(&mut peek).unwrap(), 3_u8);

        assert!(peek.peek_u8().is_err());
        assert!(u8::read_le(&mut peek).is_err());
    }

    #[test]
    fn endian_symmetry(){
        let mut bytes = Vec::new();
        0x0102_0304_u32.write_be(&mut bytes).unwrap();
        0x0102_0304_u32.write_le(&mut bytes).unwrap();
        assert_eq!(bytes, &[1, 2, 3, 4,  4, 3, 2, 1]);

        let mut read = Cursor::new(bytes);
        assert_eq!(u32::read_be(&mut read).unwrap(), 0x0102_0304);
        assert_eq!(u32::read_le(&mut read).unwrap(), 0x0102_0304);
    }

    #[test]
    fn tracked_write_seeks_with_zero_fill(){
        let mut write = Tracking::new(Cursor::new(Vec::new()));
        u8::write_slice_le(&mut write, &[7; 4]).unwrap();

        write.seek_write_to(8).unwrap();
        assert_eq!(write.byte_position(), 8);

        1_u8.write_le(&mut write).unwrap();
        write.seek_write_to(0).unwrap();
        9_u8.write_le(&mut write).unwrap();

        let bytes = write.inner.into_inner();
        assert_eq!(bytes, &[9, 7, 7, 7, 0, 0, 0, 0, 1]);
    }
}
