
//! Compression methods and the byte-shuffling helpers
//! that prepare pixel data for compression.

pub mod rle;
pub mod zip;

use crate::error::{Error, Result};

/// A byte vector.
pub type ByteVec = Vec<u8>;

/// A byte slice.
pub type Bytes<'s> = &'s [u8];

/// Specifies which compression method to use for chunk payloads.
/// The raster formats each have a fixed method dictated by their layout;
/// the deep container may use any method that supports deep data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {

    /// Store uncompressed values.
    Uncompressed,

    /// Run-length encoding. Fast, works best on images with flat areas.
    /// This compression method is lossless.
    Rle,

    /// Zlib compression, one scan line at a time.
    /// Slower but smaller. This compression method is lossless.
    Zip1,

    /// Zlib compression of blocks of 16 scan lines.
    /// Slightly smaller than `Zip1` for most images. Lossless.
    Zip16,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} compression", match self {
            Compression::Uncompressed => "no",
            Compression::Rle => "rle",
            Compression::Zip1 => "zip line",
            Compression::Zip16 => "zip block",
        })
    }
}

impl Compression {

    /// Compress the bytes of one chunk.
    ///
    /// If the compressed result would not be smaller than the input, the
    /// input is stored instead. The decoder detects this by comparing the
    /// stored size against the expected uncompressed size.
    pub fn compress_bytes(self, uncompressed: ByteVec) -> Result<ByteVec> {
        let compressed = match self {
            Compression::Uncompressed => return Ok(uncompressed),

            Compression::Rle => {
                let mut shuffled = uncompressed.clone();
                separate_bytes_fragments(&mut shuffled);
                samples_to_differences(&mut shuffled);
                rle::encode(&shuffled, 3)
            },

            Compression::Zip1 | Compression::Zip16 => {
                let mut shuffled = uncompressed.clone();
                separate_bytes_fragments(&mut shuffled);
                samples_to_differences(&mut shuffled);
                zip::compress(&shuffled)
            },
        };

        // only store the compressed version if it actually is smaller than the raw data
        if compressed.len() < uncompressed.len() { Ok(compressed) }
        else { Ok(uncompressed) }
    }

    /// Decompress the bytes of one chunk into exactly `expected_size` bytes.
    ///
    /// A payload whose stored size equals the expected uncompressed size
    /// was stored raw and is returned as is.
    pub fn decompress_bytes(self, compressed: ByteVec, expected_size: usize) -> Result<ByteVec> {
        // note: always true where self == Uncompressed
        if compressed.len() == expected_size {
            return Ok(compressed);
        }

        let mut decompressed = match self {
            Compression::Uncompressed =>
                return Err(Error::corrupt("uncompressed chunk size mismatch")),

            Compression::Rle => rle::decode(&compressed, expected_size)?,
            Compression::Zip1 | Compression::Zip16 => zip::decompress(&compressed, expected_size)?,
        };

        if decompressed.len() != expected_size {
            return Err(Error::corrupt("decompressed chunk size mismatch"));
        }

        differences_to_samples(&mut decompressed);
        interleave_byte_blocks(&mut decompressed);
        Ok(decompressed)
    }

    /// For scan line images and deep scan line images, one or more scan lines
    /// may be stored together as one chunk. The number of scan lines per chunk
    /// depends on how the pixel data is compressed.
    pub fn scan_lines_per_block(self) -> usize {
        match self {
            Compression::Uncompressed | Compression::Rle | Compression::Zip1 => 1,
            Compression::Zip16 => 16,
        }
    }

    /// Deep data chunks interleave a sample count table with the payload,
    /// which only the single-line methods can address.
    pub fn supports_deep_data(self) -> bool {
        match self {
            Compression::Uncompressed | Compression::Rle | Compression::Zip1 => true,
            Compression::Zip16 => false,
        }
    }
}


/// Split interleaved multi-byte elements into one plane per byte position,
/// most significant byte first. Run lengths are far more likely within a
/// single byte-significance plane than across interleaved multi-byte samples,
/// so the raster formats compress each plane independently.
pub fn separate_planes(interleaved: Bytes<'_>, bytes_per_element: usize) -> ByteVec {
    debug_assert_eq!(interleaved.len() % bytes_per_element.max(1), 0, "partial element bug");

    if bytes_per_element <= 1 {
        return interleaved.to_vec();
    }

    let element_count = interleaved.len() / bytes_per_element;
    let mut planes = Vec::with_capacity(interleaved.len());

    for plane in 0 .. bytes_per_element {
        for element in 0 .. element_count {
            planes.push(interleaved[element * bytes_per_element + plane]);
        }
    }

    planes
}

/// Reassemble byte planes produced by `separate_planes`
/// into interleaved multi-byte elements.
pub fn interleave_planes(planes: Bytes<'_>, bytes_per_element: usize) -> ByteVec {
    debug_assert_eq!(planes.len() % bytes_per_element.max(1), 0, "partial element bug");

    if bytes_per_element <= 1 {
        return planes.to_vec();
    }

    let element_count = planes.len() / bytes_per_element;
    let mut interleaved = vec![0_u8; planes.len()];

    for plane in 0 .. bytes_per_element {
        for element in 0 .. element_count {
            interleaved[element * bytes_per_element + plane] = planes[plane * element_count + element];
        }
    }

    interleaved
}


/// Integrate over all differences to the previous value in order to reconstruct sample values.
pub(crate) fn differences_to_samples(buffer: &mut [u8]) {
    for index in 1..buffer.len() {
        buffer[index] = (buffer[index - 1] as i32 + buffer[index] as i32 - 128) as u8;
    }
}

/// Derive over all values in order to produce differences to the previous value.
pub(crate) fn samples_to_differences(buffer: &mut [u8]) {
    for index in (1..buffer.len()).rev() {
        buffer[index] = (buffer[index] as i32 - buffer[index - 1] as i32 + 128) as u8;
    }
}

/// Interleave the bytes such that the second half of the array is every other byte.
pub(crate) fn interleave_byte_blocks(separated: &mut [u8]) {
    let mut interleaved = Vec::with_capacity(separated.len());
    let (first_half, second_half) = separated.split_at((separated.len() + 1) / 2);

    let mut first = first_half.iter();
    let mut second = second_half.iter();

    while interleaved.len() < separated.len() {
        if let Some(&byte) = first.next() { interleaved.push(byte); }
        if interleaved.len() >= separated.len() { break; }
        if let Some(&byte) = second.next() { interleaved.push(byte); }
    }

    separated.copy_from_slice(interleaved.as_slice())
}

/// Separate the bytes such that the second half contains every other byte.
pub(crate) fn separate_bytes_fragments(source: &mut [u8]) {
    let mut first_half = Vec::with_capacity((source.len() + 1) / 2);
    let mut second_half = Vec::with_capacity(source.len() / 2);

    for (index, &byte) in source.iter().enumerate() {
        if index % 2 == 0 { first_half.push(byte); }
        else { second_half.push(byte); }
    }

    let mut result = first_half;
    result.append(&mut second_half);
    source.copy_from_slice(result.as_slice());
}


#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn roundtrip_interleave(){
        let source = vec![ 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10 ];
        let mut modified = source.clone();

        separate_bytes_fragments(&mut modified);
        interleave_byte_blocks(&mut modified);

        assert_eq!(source, modified);
    }

    #[test]
    fn roundtrip_derive(){
        let source = vec![ 0, 1, 2, 7, 4, 5, 6, 7, 13, 9, 10 ];
        let mut modified = source.clone();

        samples_to_differences(&mut modified);
        differences_to_samples(&mut modified);

        assert_eq!(source, modified);
    }

    #[test]
    fn roundtrip_planes(){
        let source: Vec<u8> = vec![ 0x12, 0x34,  0x56, 0x78,  0x9a, 0xbc ];

        let planes = separate_planes(&source, 2);
        assert_eq!(planes, vec![ 0x12, 0x56, 0x9a,  0x34, 0x78, 0xbc ]);

        assert_eq!(interleave_planes(&planes, 2), source);
    }

    #[test]
    fn roundtrip_all_methods(){
        let methods = [
            Compression::Uncompressed, Compression::Rle,
            Compression::Zip1, Compression::Zip16,
        ];

        let data: Vec<u8> = (0..473).map(|index| (index % 16) as u8).collect();

        for &method in &methods {
            let compressed = method.compress_bytes(data.clone()).unwrap();
            let decompressed = method.decompress_bytes(compressed, data.len()).unwrap();
            assert_eq!(decompressed, data, "{} roundtrip failed", method);
        }
    }

    #[test]
    fn incompressible_data_is_stored_raw(){
        // two bytes cannot be compressed by any method in this crate
        let data = vec![17_u8, 23];
        let compressed = Compression::Rle.compress_bytes(data.clone()).unwrap();
        assert_eq!(compressed, data);

        let decompressed = Compression::Rle.decompress_bytes(compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }
}
