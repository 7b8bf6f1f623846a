
//! Format-neutral image headers and the scanline/tile geometry engine.
//!
//! Every format codec parses its own on-disk header layout and converts it
//! into the `Header` defined here, which the block machinery and the pixel
//! pipeline operate on.

pub mod attribute;

use smallvec::SmallVec;

use self::attribute::*;
use crate::math::*;
use crate::error::*;
use crate::compress::Compression;
use crate::block::chunk::TileCoordinates;

/// List of `Header`s, one per layer or subimage.
pub type Headers = SmallVec<[Header; 3]>;

/// The offset table is an ordered list of byte positions, one per chunk.
/// For reading, it locates each chunk in the file. For writing, it is
/// reserved as zeroes and patched once, after the chunk has been encoded.
/// An entry of zero means the chunk was never written.
pub type OffsetTable = Vec<u64>;

/// Describes a single image: its channels, its window geometry,
/// how its pixels are grouped into chunks, and the decode hints
/// (alpha association, gamma) that the pixel pipeline consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {

    /// The ordered list of channels.
    /// The order defines the on-disk interleaving of packed formats.
    pub channels: ChannelList,

    /// How the pixel data of all channels is compressed.
    pub compression: Compression,

    /// Describes how the pixels are divided into chunks:
    /// scan line groups, or tiles with an optional level pyramid.
    pub blocks: Blocks,

    /// In what order the chunks of this image occur in the file.
    pub line_order: LineOrder,

    /// The rectangle containing the stored pixels.
    pub data_window: IntegerBounds,

    /// The rectangle that clips all contents when displayed.
    /// Often equal to the data window.
    pub display_window: IntegerBounds,

    /// Aspect ratio of each pixel.
    pub pixel_aspect: f32,

    /// Whether each pixel stores a variable number of depth samples
    /// instead of one value per channel.
    pub deep: bool,

    /// Version of the deep data layout. This crate supports version 1.
    pub deep_data_version: Option<i32>,

    /// Maximum number of samples in a single pixel of a deep image.
    /// Unknown while a file is being written; patched on close.
    pub max_samples_per_pixel: Option<usize>,

    /// Number of chunks this image is divided into, across all levels.
    /// Calculated when the header is created, and relied upon.
    pub chunk_count: usize,

    /// How the colour channels relate to the alpha channel, if one exists.
    pub alpha_mode: Option<AlphaMode>,

    /// The gamma of the stored values. Alpha association happens in
    /// linear space when this is not `1.0`.
    pub gamma: f32,

    /// Name of the image owner or author, where the format stores one.
    pub owner: Option<Text>,

    /// Additional textual information.
    pub comments: Option<Text>,

    /// The creation date text, where the format stores one.
    pub capture_date: Option<Text>,

    /// The program that created the file, where the format stores one.
    pub software: Option<Text>,
}

/// How the image pixels are split up into separate chunks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Blocks {

    /// The image is divided into scan line groups.
    /// The number of scan lines in a group depends on the compression method.
    ScanLines,

    /// The image is divided into tiles,
    /// possibly storing multiple resolution levels.
    Tiles(TileDescription),
}

impl Blocks {

    /// Whether this image is tiled. If false, the image is divided into scan line groups.
    pub fn has_tiles(&self) -> bool {
        match self {
            Blocks::Tiles { .. } => true,
            _ => false,
        }
    }
}

/// Locates a rectangular section of pixels in an image.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct TileIndices {

    /// Index of the tile within its level.
    pub location: TileCoordinates,

    /// Pixel size of the tile, clipped at the image edge.
    pub size: Vec2<usize>,
}


/// Compute the number of chunks required to contain all values.
pub fn compute_block_count(full_res: usize, tile_size: usize) -> usize {
    // round up, because if the image is not evenly divisible by the tiles,
    // we add another tile at the end (which is only partially used)
    RoundingMode::Up.divide(full_res, tile_size)
}

/// Compute the start position and size of a block inside a dimension.
#[inline]
pub fn calculate_block_position_and_size(total_size: usize, block_size: usize, block_index: usize) -> Result<(usize, usize)> {
    let block_position = block_size * block_index;

    Ok((
        block_position,
        calculate_block_size(total_size, block_size, block_position)?
    ))
}

/// Calculate the size of a single block. If this is the last block,
/// this only returns the remaining size, which is smaller than the default block size.
#[inline]
pub fn calculate_block_size(total_size: usize, block_size: usize, block_position: usize) -> Result<usize> {
    if block_position >= total_size {
        return Err(Error::corrupt("block index out of bounds"))
    }

    if block_position + block_size <= total_size {
        Ok(block_size)
    }
    else {
        Ok(total_size - block_position)
    }
}

/// Calculate the number of mip levels for a given resolution.
pub fn compute_level_count(round: RoundingMode, full_res: usize) -> usize {
    round.log2(full_res) + 1
}

/// Calculate the dimension of a single level by index:
/// `max(1, round(full / 2^level))`.
pub fn compute_level_size(round: RoundingMode, full_res: usize, level_index: usize) -> usize {
    assert!(level_index < std::mem::size_of::<usize>() * 8, "largest level size exceeds maximum integer value");
    round.divide(full_res, 1 << level_index).max(1)
}

/// Iterates over all rip map level resolutions of a given size, including the indices of each level.
/// The order of iteration conforms to `LineOrder::Increasing`.
pub fn rip_map_levels(round: RoundingMode, max_resolution: Vec2<usize>) -> impl Iterator<Item=(Vec2<usize>, Vec2<usize>)> {
    rip_map_indices(round, max_resolution).map(move |level_indices|{
        let width = compute_level_size(round, max_resolution.width(), level_indices.x());
        let height = compute_level_size(round, max_resolution.height(), level_indices.y());
        (level_indices, Vec2(width, height))
    })
}

/// Iterates over all mip map level resolutions of a given size, including the indices of each level.
/// The order of iteration conforms to `LineOrder::Increasing`.
pub fn mip_map_levels(round: RoundingMode, max_resolution: Vec2<usize>) -> impl Iterator<Item=(usize, Vec2<usize>)> {
    mip_map_indices(round, max_resolution)
        .map(move |level_index|{
            let width = compute_level_size(round, max_resolution.width(), level_index);
            let height = compute_level_size(round, max_resolution.height(), level_index);
            (level_index, Vec2(width, height))
        })
}

/// Iterates over all rip map level indices of a given size.
pub fn rip_map_indices(round: RoundingMode, max_resolution: Vec2<usize>) -> impl Iterator<Item=Vec2<usize>> {
    let (width, height) = (
        compute_level_count(round, max_resolution.width()),
        compute_level_count(round, max_resolution.height())
    );

    (0..height).flat_map(move |y_level|{
        (0..width).map(move |x_level|{
            Vec2(x_level, y_level)
        })
    })
}

/// Iterates over all mip map level indices of a given size.
pub fn mip_map_indices(round: RoundingMode, max_resolution: Vec2<usize>) -> impl Iterator<Item=usize> {
    0..compute_level_count(round, max_resolution.width().max(max_resolution.height()))
}

/// Compute the number of chunks that an image is divided into,
/// summed across all resolution levels.
pub fn compute_chunk_count(compression: Compression, data_size: Vec2<usize>, blocks: Blocks) -> usize {

    if let Blocks::Tiles(tiles) = blocks {
        let round = tiles.rounding_mode;
        let Vec2(tile_width, tile_height) = tiles.tile_size;

        match tiles.level_mode {
            LevelMode::Singular => {
                let tiles_x = compute_block_count(data_size.width(), tile_width);
                let tiles_y = compute_block_count(data_size.height(), tile_height);
                tiles_x * tiles_y
            }

            LevelMode::MipMap => {
                mip_map_levels(round, data_size).map(|(_, Vec2(level_width, level_height))| {
                    compute_block_count(level_width, tile_width) * compute_block_count(level_height, tile_height)
                }).sum()
            },

            LevelMode::RipMap => {
                rip_map_levels(round, data_size).map(|(_, Vec2(level_width, level_height))| {
                    compute_block_count(level_width, tile_width) * compute_block_count(level_height, tile_height)
                }).sum()
            }
        }
    }

    // scan line groups never have reduced resolution levels
    else {
        compute_block_count(data_size.height(), compression.scan_lines_per_block())
    }
}


impl Header {

    /// Create a header with the specified size and channels.
    /// Uses scan line blocks, no compression, and a display window
    /// equal to the data window. Use the `with_` methods to customize.
    pub fn new(data_size: impl Into<Vec2<usize>>, channels: ChannelList) -> Self {
        let data_size: Vec2<usize> = data_size.into();
        let compression = Compression::Uncompressed;
        let blocks = Blocks::ScanLines;

        Self {
            channels,
            compression,
            blocks,
            line_order: LineOrder::Increasing,

            data_window: IntegerBounds::from_dimensions(data_size),
            display_window: IntegerBounds::from_dimensions(data_size),
            pixel_aspect: 1.0,

            deep: false,
            deep_data_version: None,
            max_samples_per_pixel: None,

            chunk_count: compute_chunk_count(compression, data_size, blocks),

            alpha_mode: None,
            gamma: 1.0,
            owner: None,
            comments: None,
            capture_date: None,
            software: None,
        }
    }

    /// Set compression, tiling, and line order. Recomputes the chunk count.
    pub fn with_encoding(self, compression: Compression, blocks: Blocks, line_order: LineOrder) -> Self {
        Self {
            chunk_count: compute_chunk_count(compression, self.data_window.size, blocks),
            compression, blocks, line_order,
            .. self
        }
    }

    /// Mark this header as describing deep data. Recomputes the chunk count.
    pub fn with_deep_data(self) -> Self {
        Self {
            deep: true,
            deep_data_version: Some(1),
            line_order: LineOrder::Increasing,
            .. self
        }
    }

    /// Set the alpha association and gamma hints for the pixel pipeline.
    pub fn with_alpha(self, alpha_mode: AlphaMode, gamma: f32) -> Self {
        Self { alpha_mode: Some(alpha_mode), gamma, .. self }
    }

    /// The resolution of this image, equal to the size of its data window.
    pub fn data_size(&self) -> Vec2<usize> {
        self.data_window.size
    }

    /// Number of resolution levels in each dimension.
    /// `(1, 1)` for untiled and one-level images. For mip maps,
    /// both components are equal.
    pub fn level_count(&self) -> Vec2<usize> {
        match self.blocks {
            Blocks::Tiles(tiles) => {
                let round = tiles.rounding_mode;
                match tiles.level_mode {
                    LevelMode::Singular => Vec2(1, 1),
                    LevelMode::MipMap => {
                        let count = compute_level_count(
                            round, self.data_size().width().max(self.data_size().height())
                        );
                        Vec2(count, count)
                    },
                    LevelMode::RipMap => Vec2(
                        compute_level_count(round, self.data_size().width()),
                        compute_level_count(round, self.data_size().height()),
                    ),
                }
            },
            Blocks::ScanLines => Vec2(1, 1),
        }
    }

    /// The dimensions of the specified resolution level.
    ///
    /// Panics for level indices outside `level_count`,
    /// as that is a contract violation, not an io failure.
    pub fn level_size(&self, level: Vec2<usize>) -> Vec2<usize> {
        let count = self.level_count();
        assert!(
            level.x() < count.x() && level.y() < count.y(),
            "level index ({}, {}) out of range", level.x(), level.y()
        );

        match self.blocks {
            Blocks::ScanLines => self.data_size(),
            Blocks::Tiles(tiles) => Vec2(
                compute_level_size(tiles.rounding_mode, self.data_size().width(), level.x()),
                compute_level_size(tiles.rounding_mode, self.data_size().height(), level.y()),
            ),
        }
    }

    /// Number of tiles in each dimension of the specified level.
    ///
    /// Panics for level indices outside `level_count`.
    pub fn tile_count(&self, level: Vec2<usize>) -> Vec2<usize> {
        let level_size = self.level_size(level);
        let tile_size = self.default_block_pixel_size();

        Vec2(
            compute_block_count(level_size.width(), tile_size.width()),
            compute_block_count(level_size.height(), tile_size.height()),
        )
    }

    /// The absolute pixel rectangle of the specified tile,
    /// anchored at the data window position and clipped to the level bounds.
    ///
    /// Panics for tile or level indices outside the declared counts.
    pub fn tile_bounds(&self, tile: TileCoordinates) -> IntegerBounds {
        let tile_count = self.tile_count(tile.level_index);
        assert!(
            tile.tile_index.x() < tile_count.x() && tile.tile_index.y() < tile_count.y(),
            "tile index ({}, {}) out of range", tile.tile_index.x(), tile.tile_index.y()
        );

        let data_bounds = tile
            .to_data_indices(self.default_block_pixel_size(), self.level_size(tile.level_index))
            .expect("tile bounds bug");

        data_bounds.with_origin(self.data_window.position)
    }

    /// Number of scan lines that one chunk of this image covers.
    pub fn scan_lines_per_chunk(&self) -> usize {
        match self.blocks {
            Blocks::ScanLines => self.compression.scan_lines_per_block(),
            Blocks::Tiles(tiles) => tiles.tile_size.height(),
        }
    }

    /// The first scan line of the chunk containing line `y`
    /// (both relative to the data window top).
    pub fn first_scan_line_of_chunk(&self, y: usize) -> usize {
        let lines = self.scan_lines_per_chunk();
        y / lines * lines
    }

    /// The last scan line (inclusive) of the chunk containing line `y`.
    pub fn last_scan_line_of_chunk(&self, y: usize) -> usize {
        (self.first_scan_line_of_chunk(y) + self.scan_lines_per_chunk() - 1)
            .min(self.data_size().height() - 1)
    }

    /// The dimensions of every chunk in this image. The blocks at the
    /// lower and right edge of an image may be smaller than this.
    pub fn default_block_pixel_size(&self) -> Vec2<usize> {
        match self.blocks {
            Blocks::ScanLines => Vec2(self.data_size().width(), self.compression.scan_lines_per_block()),
            Blocks::Tiles(tiles) => tiles.tile_size,
        }
    }

    /// The maximum number of pixels in any chunk of this image.
    pub fn max_block_pixel_size(&self) -> Vec2<usize> {
        let default = self.default_block_pixel_size();
        Vec2(
            default.width().min(self.data_size().width()),
            default.height().min(self.data_size().height()),
        )
    }

    /// A generous upper bound for the byte size of a single chunk,
    /// used to reject absurd sizes declared by corrupt files.
    /// Deep chunks are bounded by the declared maximum sample count,
    /// or by a fixed cap where that is not yet known.
    pub fn max_block_byte_size(&self) -> usize {
        let flat_bytes = self.max_block_pixel_size().area() * self.channels.bytes_per_pixel;

        if self.deep {
            match self.max_samples_per_pixel {
                Some(max_samples) => flat_bytes.saturating_mul(max_samples.max(1)),
                None => 1 << 31,
            }
        }
        else {
            flat_bytes
        }
    }

    /// Iterate over all chunk indices in this header in `LineOrder::Increasing` order.
    pub fn blocks_increasing_y_order(&self) -> impl Iterator<Item = TileIndices> + ExactSizeIterator + DoubleEndedIterator {
        fn tiles_of(image_size: Vec2<usize>, tile_size: Vec2<usize>, level_index: Vec2<usize>) -> impl Iterator<Item=TileIndices> {
            fn divide_and_rest(total_size: usize, block_size: usize) -> impl Iterator<Item=(usize, usize)> {
                let block_count = compute_block_count(total_size, block_size);
                (0..block_count).map(move |block_index| (
                    block_index, calculate_block_size(total_size, block_size, block_index * block_size).expect("block size calculation bug")
                ))
            }

            divide_and_rest(image_size.height(), tile_size.height()).flat_map(move |(y_index, tile_height)|{
                divide_and_rest(image_size.width(), tile_size.width()).map(move |(x_index, tile_width)|{
                    TileIndices {
                        size: Vec2(tile_width, tile_height),
                        location: TileCoordinates { tile_index: Vec2(x_index, y_index), level_index, },
                    }
                })
            })
        }

        let vec: Vec<TileIndices> = {
            if let Blocks::Tiles(tiles) = self.blocks {
                match tiles.level_mode {
                    LevelMode::Singular => {
                        tiles_of(self.data_size(), tiles.tile_size, Vec2(0, 0)).collect()
                    },
                    LevelMode::MipMap => {
                        mip_map_levels(tiles.rounding_mode, self.data_size())
                            .flat_map(move |(level_index, level_size)|{
                                tiles_of(level_size, tiles.tile_size, Vec2(level_index, level_index))
                            })
                            .collect()
                    },
                    LevelMode::RipMap => {
                        rip_map_levels(tiles.rounding_mode, self.data_size())
                            .flat_map(move |(level_index, level_size)| {
                                tiles_of(level_size, tiles.tile_size, level_index)
                            })
                            .collect()
                    }
                }
            }
            else {
                let block_size = Vec2(self.data_size().width(), self.compression.scan_lines_per_block());
                tiles_of(self.data_size(), block_size, Vec2(0, 0)).collect()
            }
        };

        vec.into_iter()
    }

    /// Iterate over all chunks in the order specified by this header's line
    /// order attribute, each paired with the index it would have in
    /// `LineOrder::Increasing` order.
    pub fn enumerate_ordered_blocks(&self) -> impl Iterator<Item = (usize, TileIndices)> + Send {
        let increasing_y = self.blocks_increasing_y_order().enumerate();

        let ordered: Box<dyn Send + Iterator<Item = (usize, TileIndices)>> = {
            if self.line_order == LineOrder::Decreasing {
                Box::new(increasing_y.rev())
            }
            else {
                Box::new(increasing_y)
            }
        };

        ordered
    }

    /// Validate this header.
    pub fn validate(&self) -> UnitResult {
        self.data_window.validate(None)?;
        self.display_window.validate(None)?;

        if self.data_window.size.area() == 0 {
            return Err(Error::malformed("empty data window"));
        }

        if self.channels.list.is_empty() {
            return Err(Error::malformed("no channels"));
        }

        if self.deep {
            if !self.compression.supports_deep_data() {
                return Err(Error::malformed("compression method does not support deep data"));
            }

            if self.deep_data_version != Some(1) {
                return Err(Error::unsupported("deep data version other than 1"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels.list {
            if !seen.insert(&channel.name) {
                return Err(Error::malformed("duplicate channel name"));
            }

            if let Some(bits) = channel.bits_per_sample {
                if bits == 0 || bits > channel.sample_type.bits_per_sample() {
                    return Err(Error::malformed("channel bit depth exceeds storage type"));
                }
            }
        }

        Ok(())
    }
}
