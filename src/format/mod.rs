
//! The format codecs and the common input/output abstraction over them.
//!
//! Every codec is reachable directly through its module, or through a
//! `Registry` value that detects the format of a file by its magic bytes,
//! falling back to the file extension. The registry is an explicit value
//! passed to `open_input`, never a process-wide singleton, so applications
//! can restrict or extend the format set per call site.

pub mod exr;
pub mod rla;
pub mod targa;
pub mod iff;
pub mod ico;

use std::ops::Range;
use std::path::Path;

use crate::meta::Header;
use crate::block::samples::{FrameBuffer, FrameBufferMut};
use crate::block::deep::DeepFrameBuffer;
use crate::error::{Error, Result, UnitResult};

/// Options for reading images.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {

    /// Decompress the chunks of one read call on the thread pool.
    /// Ignored when the `rayon` feature is disabled.
    pub parallel: bool,

    /// Reject files with structural inconsistencies that could
    /// still be read, such as unordered offset tables.
    pub pedantic: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions { parallel: true, pedantic: false }
    }
}

/// Options for writing images.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {

    /// Compress the chunks of one write call on the thread pool.
    /// Ignored when the `rayon` feature is disabled.
    pub parallel: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { parallel: true }
    }
}


/// Reads pixels from one open image file.
///
/// All scan line ranges are relative to the top of the data window,
/// with exclusive upper bounds. Requesting lines outside the data window
/// panics, as that is a contract violation by the caller.
///
/// A failed range read reports an error but leaves the input usable:
/// lines decoded before the failure remain valid in the target buffer,
/// and unrelated ranges can still be read afterwards.
pub trait ImageInput {

    /// Short lowercase name of the format, for example `"rla"`.
    fn format_name(&self) -> &'static str;

    /// The header of the currently selected subimage.
    fn header(&self) -> &Header;

    /// Number of subimages in this file. Most formats store exactly one.
    fn subimage_count(&self) -> usize { 1 }

    /// Select the subimage that subsequent calls read from.
    fn select_subimage(&mut self, index: usize) -> UnitResult {
        if index == 0 { Ok(()) }
        else { Err(Error::unsupported("multiple subimages in this format")) }
    }

    /// Whether every declared chunk of the file was actually written.
    /// This is a cheap structural check of the offset table, not a checksum.
    fn is_complete(&self) -> bool { true }

    /// Read the specified scan lines of a flat image into the frame buffer.
    fn read_pixels(&mut self, lines: Range<usize>, target: &mut FrameBufferMut<'_>) -> UnitResult;

    /// Read the per-pixel sample counts of the specified scan lines of a
    /// deep image. The counts slice must hold one entry per pixel of the
    /// range, row-major. Must be called before `read_deep_pixels`, because
    /// sample addresses are prefix sums over these counts.
    fn read_pixel_sample_counts(&mut self, lines: Range<usize>, counts: &mut [u32]) -> UnitResult {
        let _ = (lines, counts);
        Err(Error::unsupported("deep data in a flat format"))
    }

    /// Read the specified scan lines of a deep image into a deep frame
    /// buffer previously allocated from the sample counts of that range.
    fn read_deep_pixels(&mut self, lines: Range<usize>, target: &mut DeepFrameBuffer) -> UnitResult {
        let _ = (lines, target);
        Err(Error::unsupported("deep data in a flat format"))
    }

    /// Copy the raw bytes of one chunk, compressed or not, including its
    /// size fields, without decoding. Supports file-to-file copies that
    /// skip the decode and re-encode round trip.
    ///
    /// Always returns the required byte count. The buffer is only filled
    /// if it is large enough; query with an empty buffer first.
    fn raw_chunk_data(&mut self, chunk_index: usize, buffer: &mut [u8]) -> Result<usize> {
        let _ = (chunk_index, buffer);
        Err(Error::unsupported("raw chunk access in this format"))
    }
}

/// Writes pixels into one image file.
///
/// Chunks are encoded as ranges arrive; formats with offset tables
/// reserve them at creation and patch them in `close`. A chunk is never
/// rewritten once its offset is committed.
pub trait ImageOutput {

    /// Short lowercase name of the format, for example `"rla"`.
    fn format_name(&self) -> &'static str;

    /// The header this file is being written with.
    fn header(&self) -> &Header;

    /// Encode the specified scan lines of a flat image from the frame buffer.
    fn write_pixels(&mut self, lines: Range<usize>, source: &FrameBuffer<'_>) -> UnitResult;

    /// Encode the specified scan lines of a deep image.
    fn write_deep_pixels(&mut self, lines: Range<usize>, source: &DeepFrameBuffer) -> UnitResult {
        let _ = (lines, source);
        Err(Error::unsupported("deep data in a flat format"))
    }

    /// Finish the file: flush buffered chunks and patch offset tables.
    /// Must be called exactly once; dropping an unclosed output
    /// leaves an incomplete file with a zeroed offset table.
    fn close(&mut self) -> UnitResult;
}


/// Everything the registry needs to know about one format.
#[derive(Clone)]
pub struct FormatEntry {

    /// Short lowercase format name.
    pub name: &'static str,

    /// File extensions this format claims, lowercase, without dots.
    pub extensions: &'static [&'static str],

    /// Whether the first bytes of a file identify this format.
    /// Receives 32 bytes, zero-padded for shorter files.
    pub matches_magic: fn(&[u8; 32]) -> bool,

    /// Open a file of this format for reading.
    pub open: fn(&Path, ReadOptions) -> Result<Box<dyn ImageInput>>,

    /// Create a file of this format for writing.
    pub create: fn(&Path, Header, WriteOptions) -> Result<Box<dyn ImageOutput>>,
}

impl std::fmt::Debug for FormatEntry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FormatEntry")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// An explicit collection of format codecs.
///
/// `Registry::default()` knows all formats in this crate. Use
/// `Registry::empty().with_format(...)` to build a restricted set.
#[derive(Debug, Clone)]
pub struct Registry {
    formats: Vec<FormatEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::empty()
            .with_format(exr::format_entry())
            .with_format(rla::format_entry())
            .with_format(targa::format_entry())
            .with_format(iff::format_entry())
            .with_format(ico::format_entry())
    }
}

impl Registry {

    /// A registry without any formats.
    pub fn empty() -> Self {
        Registry { formats: Vec::new() }
    }

    /// Add a format to this registry. Later entries win extension conflicts.
    pub fn with_format(mut self, entry: FormatEntry) -> Self {
        self.formats.insert(0, entry);
        self
    }

    /// The registered formats.
    pub fn formats(&self) -> &[FormatEntry] {
        &self.formats
    }

    /// Open an image file for reading, with default options.
    /// The format is detected from the file's magic bytes,
    /// falling back to the file extension.
    pub fn open_input(&self, path: impl AsRef<Path>) -> Result<Box<dyn ImageInput>> {
        self.open_input_with_options(path, ReadOptions::default())
    }

    /// Open an image file for reading.
    pub fn open_input_with_options(&self, path: impl AsRef<Path>, options: ReadOptions) -> Result<Box<dyn ImageInput>> {
        let path = path.as_ref();

        let mut magic = [0_u8; 32];
        {
            use std::io::Read;
            let mut file = std::fs::File::open(path)?;
            let mut filled = 0;

            while filled < magic.len() {
                let count = file.read(&mut magic[filled ..])?;
                if count == 0 { break; }
                filled += count;
            }
        }

        let by_magic = self.formats.iter()
            .find(|entry| (entry.matches_magic)(&magic));

        let entry = by_magic
            .or_else(|| self.find_by_extension(path))
            .ok_or_else(|| Error::unsupported("image format not recognized"))?;

        (entry.open)(path, options)
    }

    /// Create an image file for writing. The format is selected
    /// by the file extension.
    pub fn create_output(&self, path: impl AsRef<Path>, header: Header) -> Result<Box<dyn ImageOutput>> {
        self.create_output_with_options(path, header, WriteOptions::default())
    }

    /// Create an image file for writing, with options.
    pub fn create_output_with_options(&self, path: impl AsRef<Path>, header: Header, options: WriteOptions) -> Result<Box<dyn ImageOutput>> {
        let path = path.as_ref();

        let entry = self.find_by_extension(path)
            .ok_or_else(|| Error::unsupported("no format registered for this file extension"))?;

        (entry.create)(path, header, options)
    }

    fn find_by_extension(&self, path: &Path) -> Option<&FormatEntry> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();

        self.formats.iter().find(|entry|
            entry.extensions.iter().any(|&candidate| candidate == extension)
        )
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_registry_knows_all_formats(){
        let registry = Registry::default();
        let names: Vec<&str> = registry.formats().iter().map(|entry| entry.name).collect();

        for expected in ["exr", "rla", "tga", "iff", "ico"] {
            assert!(names.contains(&expected), "{} missing", expected);
        }
    }

    #[test]
    fn unknown_extension_is_rejected(){
        let registry = Registry::default();
        let channels = crate::meta::attribute::ChannelList::new(smallvec::smallvec![
            crate::meta::attribute::ChannelDescription::new("R", crate::meta::attribute::SampleType::U8),
        ]);

        let header = crate::meta::Header::new(crate::math::Vec2(4, 4), channels);
        assert!(registry.create_output("/tmp/image.unknown-extension", header).is_err());
    }
}
