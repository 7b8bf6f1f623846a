
//! Zlib compression wrappers. Compresses with `miniz_oxide`,
//! decompresses with the faster `zune-inflate`.

use super::{Bytes, ByteVec};
use crate::error::{Error, Result};

/// Compress the bytes into a zlib stream.
pub fn compress(data: Bytes<'_>) -> ByteVec {
    miniz_oxide::deflate::compress_to_vec_zlib(data, 4)
}

/// Decompress a zlib stream, expecting `expected_size` bytes of output.
/// The limit also protects against zip bombs in corrupt files.
pub fn decompress(data: Bytes<'_>, expected_size: usize) -> Result<ByteVec> {
    let options = zune_inflate::DeflateOptions::default()
        .set_limit(expected_size)
        .set_size_hint(expected_size);

    let mut decoder = zune_inflate::DeflateDecoder::new_with_options(data, options);

    decoder.decode_zlib()
        .map_err(|_| Error::corrupt("zlib-compressed data malformed"))
}


#[cfg(test)]
mod test {

    #[test]
    fn roundtrip(){
        let data: Vec<u8> = (0..2048).map(|index| (index % 96) as u8).collect();
        let compressed = super::compress(&data);
        assert!(compressed.len() < data.len());

        let decompressed = super::decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn rejects_garbage(){
        assert!(super::decompress(&[1, 2, 3, 4], 100).is_err());
    }
}
