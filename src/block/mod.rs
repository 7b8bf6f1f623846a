
//! Handle compressed and uncompressed pixel byte blocks of the deep container.
//! Includes compression and decompression of flat blocks,
//! and the fan-out helper used to run chunk codecs on the thread pool.

pub mod chunk;
pub mod deep;
pub mod samples;

use crate::compress::ByteVec;
use crate::math::Vec2;
use crate::meta::{Headers, Blocks};
use crate::error::{Result, Error, usize_to_i32};
use self::chunk::{Chunk, CompressedBlock, CompressedScanLineBlock, CompressedTileBlock, TileCoordinates};

/// Specifies where a block of pixel data should be placed in the actual image.
/// This is a globally unique identifier which
/// includes the layer, level index, and pixel location.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
pub struct BlockIndex {

    /// Index of the layer.
    pub layer: usize,

    /// Index of the top left pixel from the block, relative to the data window.
    pub pixel_position: Vec2<usize>,

    /// Number of pixels in this block.
    pub pixel_size: Vec2<usize>,

    /// Index of the mip or rip level in the image.
    pub level: Vec2<usize>,
}

/// Contains a block of uncompressed pixel data
/// and where that data should be placed in the actual image.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UncompressedBlock {

    /// Location of the data inside the image.
    pub index: BlockIndex,

    /// Uncompressed pixel values of the whole block, as little endian bytes.
    /// For each line in the block, for each channel, the row values are contiguous.
    pub data: ByteVec,
}

impl UncompressedBlock {

    /// Decompress the possibly compressed chunk and return an `UncompressedBlock`.
    ///
    /// Deep chunks are not handled here, as decoding them requires their
    /// sample count table; see the `deep` module.
    pub fn decompress_chunk(chunk: Chunk, headers: &Headers) -> Result<Self> {
        let header = headers.get(chunk.layer_index)
            .ok_or_else(|| Error::corrupt("chunk layer index"))?;

        match chunk.block {
            CompressedBlock::ScanLine(block) => {
                let y = block.y_coordinate - header.data_window.position.y();
                let y = crate::error::i32_to_usize(y, "scan line block y coordinate")?;

                if y >= header.data_size().height() {
                    return Err(Error::corrupt("scan line block y coordinate"));
                }

                let height = (header.data_size().height() - y).min(header.scan_lines_per_chunk());
                let pixel_size = Vec2(header.data_size().width(), height);
                let expected_byte_size = pixel_size.area() * header.channels.bytes_per_pixel;

                Ok(UncompressedBlock {
                    data: header.compression.decompress_bytes(block.compressed_pixels, expected_byte_size)?,
                    index: BlockIndex {
                        layer: chunk.layer_index,
                        pixel_position: Vec2(0, y),
                        pixel_size,
                        level: Vec2(0, 0),
                    },
                })
            },

            CompressedBlock::Tile(block) => {
                let tile_size = header.default_block_pixel_size();
                let level = block.coordinates.level_index;

                let level_count = header.level_count();
                if level.x() >= level_count.x() || level.y() >= level_count.y() {
                    return Err(Error::corrupt("tile level index"));
                }

                let data_indices = block.coordinates
                    .to_data_indices(tile_size, header.level_size(level))?;

                let expected_byte_size = data_indices.size.area() * header.channels.bytes_per_pixel;

                Ok(UncompressedBlock {
                    data: header.compression.decompress_bytes(block.compressed_pixels, expected_byte_size)?,
                    index: BlockIndex {
                        layer: chunk.layer_index,
                        pixel_position: data_indices.position.to_usize("tile position")?,
                        pixel_size: data_indices.size,
                        level,
                    },
                })
            },

            CompressedBlock::DeepScanLine(_) | CompressedBlock::DeepTile(_) =>
                Err(Error::unsupported("deep chunk in flat decompression")),
        }
    }

    /// Consume this block by compressing it, returning a `Chunk`.
    pub fn compress_to_chunk(self, headers: &Headers) -> Result<Chunk> {
        let UncompressedBlock { data, index } = self;

        let header = headers.get(index.layer).expect("block layer index bug");

        let expected_byte_size = header.channels.bytes_per_pixel * index.pixel_size.area();
        assert_eq!(expected_byte_size, data.len(), "block byte size bug");

        let compressed_data = header.compression.compress_bytes(data)?;

        Ok(Chunk {
            layer_index: index.layer,
            block: match header.blocks {
                Blocks::ScanLines => CompressedBlock::ScanLine(CompressedScanLineBlock {
                    compressed_pixels: compressed_data,
                    y_coordinate: usize_to_i32(index.pixel_position.y(), "scan line y")?
                        + header.data_window.position.y(),
                }),

                Blocks::Tiles(tiles) => CompressedBlock::Tile(CompressedTileBlock {
                    compressed_pixels: compressed_data,
                    coordinates: TileCoordinates {
                        tile_index: Vec2(
                            index.pixel_position.x() / tiles.tile_size.width(),
                            index.pixel_position.y() / tiles.tile_size.height(),
                        ),
                        level_index: index.level,
                    },
                }),
            },
        })
    }
}


/// Run the mapping function over all items, on the thread pool if the
/// `rayon` feature is enabled and `parallel` is requested, sequentially
/// otherwise. This is a barrier: all results are collected before
/// returning, preserving the input order.
///
/// Errors of individual items stay in the output, so a failed chunk does
/// not discard the chunks that decoded successfully.
#[cfg(feature = "rayon")]
pub(crate) fn map_maybe_parallel<I, O>(
    items: Vec<I>, parallel: bool,
    map: impl Fn(I) -> O + Sync + Send,
) -> Vec<O> where I: Send, O: Send
{
    if parallel && items.len() > 1 {
        use rayon::prelude::*;
        items.into_par_iter().map(map).collect()
    }
    else {
        items.into_iter().map(map).collect()
    }
}

/// Sequential fallback where the `rayon` feature is disabled.
#[cfg(not(feature = "rayon"))]
pub(crate) fn map_maybe_parallel<I, O>(
    items: Vec<I>, _parallel: bool,
    map: impl Fn(I) -> O + Sync + Send,
) -> Vec<O> where I: Send, O: Send
{
    items.into_iter().map(map).collect()
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::Header;
    use crate::meta::attribute::{ChannelList, ChannelDescription, SampleType, LineOrder};
    use crate::compress::Compression;

    fn headers() -> Headers {
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("R", SampleType::F32),
            ChannelDescription::new("G", SampleType::F32),
        ]);

        smallvec::smallvec![
            Header::new(Vec2(19, 10), channels)
                .with_encoding(Compression::Rle, Blocks::ScanLines, LineOrder::Increasing)
        ]
    }

    #[test]
    fn scan_line_block_roundtrip(){
        let headers = headers();
        // one scan line of 19 pixels, two f32 channels each
        let bytes: Vec<u8> = (0 .. 19 * 2).flat_map(|index: u32| index.to_le_bytes()).collect();

        let block = UncompressedBlock {
            index: BlockIndex {
                layer: 0,
                pixel_position: Vec2(0, 3),
                pixel_size: Vec2(19, 1),
                level: Vec2(0, 0),
            },
            data: bytes.clone(),
        };

        let chunk = block.clone().compress_to_chunk(&headers).unwrap();
        let decompressed = UncompressedBlock::decompress_chunk(chunk, &headers).unwrap();

        assert_eq!(decompressed, block);
    }

    #[test]
    fn out_of_bounds_scan_line_is_corrupt(){
        let headers = headers();

        let chunk = Chunk {
            layer_index: 0,
            block: CompressedBlock::ScanLine(CompressedScanLineBlock {
                y_coordinate: 10, // the data window covers lines 0..10
                compressed_pixels: vec![0; 4],
            }),
        };

        assert!(UncompressedBlock::decompress_chunk(chunk, &headers).is_err());
    }
}
