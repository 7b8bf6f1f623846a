
//! Read and write already compressed pixel data blocks of the deep container.
//! Does not include the process of compression and decompression.

use crate::io::*;
use crate::math::Vec2;
use crate::meta::{Headers, attribute::IntegerBounds};
use crate::error::{UnitResult, Result, Error, u64_to_usize, usize_to_i32};

/// A generic block of pixel information.
/// Contains pixel data and an index to the corresponding header.
/// All pixel data in a file is split into a list of chunks.
#[derive(Debug, Clone)]
pub struct Chunk {

    /// The index of the layer that the block belongs to.
    /// This is required as the pixel data can appear in any order in a file.
    pub layer_index: usize,

    /// The compressed pixel contents.
    pub block: CompressedBlock,
}

/// The raw, possibly compressed pixel data of one chunk.
/// Also contains positioning information that locates this
/// data block in the corresponding layer.
#[derive(Debug, Clone)]
pub enum CompressedBlock {

    /// Scan line blocks of flat data.
    ScanLine(CompressedScanLineBlock),

    /// Tiles of flat data.
    Tile(CompressedTileBlock),

    /// Scan line blocks of deep data.
    DeepScanLine(CompressedDeepScanLineBlock),

    /// Tiles of deep data.
    DeepTile(CompressedDeepTileBlock),
}

/// A chunk of possibly compressed flat scan lines.
#[derive(Debug, Clone)]
pub struct CompressedScanLineBlock {

    /// The block's y coordinate is the pixel space y coordinate of the top scan line in the block.
    /// The top scan line block in the image is aligned with the top edge of the data window.
    pub y_coordinate: i32,

    /// One or more scan lines may be stored together as a scan line block.
    /// For each line in the block, for each channel, the row values are contiguous.
    pub compressed_pixels: Vec<u8>,
}

/// A chunk containing one tile of flat data.
#[derive(Debug, Clone)]
pub struct CompressedTileBlock {

    /// The tile location.
    pub coordinates: TileCoordinates,

    /// For each line in the tile, for each channel, the row values are contiguous.
    pub compressed_pixels: Vec<u8>,
}

/// Indicates the position and resolution level of a tile chunk.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct TileCoordinates {

    /// Index of the tile, not pixel position.
    pub tile_index: Vec2<usize>,

    /// Index of the mip or rip level.
    pub level_index: Vec2<usize>,
}

/// A chunk of one or more deep scan lines.
/// The pixel payload cannot be addressed without
/// first decoding the sample count table.
#[derive(Debug, Clone)]
pub struct CompressedDeepScanLineBlock {

    /// The block's y coordinate is the pixel space y coordinate of the top scan line in the block.
    pub y_coordinate: i32,

    /// Byte size of the sample data after decompression.
    pub decompressed_sample_data_size: usize,

    /// The possibly compressed sample count table: one cumulative count per
    /// pixel column, restarting at zero on each scan line of the block.
    pub compressed_sample_count_table: Vec<u8>,

    /// The possibly compressed deep sample values.
    pub compressed_sample_data: Vec<u8>,
}

/// A chunk containing one tile of deep data.
#[derive(Debug, Clone)]
pub struct CompressedDeepTileBlock {

    /// The tile location.
    pub coordinates: TileCoordinates,

    /// Byte size of the sample data after decompression.
    pub decompressed_sample_data_size: usize,

    /// The possibly compressed sample count table: one cumulative count per
    /// pixel column, restarting at zero on each scan line of the tile.
    pub compressed_sample_count_table: Vec<u8>,

    /// The possibly compressed deep sample values.
    pub compressed_sample_data: Vec<u8>,
}


impl TileCoordinates {

    /// Without validation, write this instance to the byte stream.
    pub fn write_le<W: Write>(&self, write: &mut W) -> UnitResult {
        usize_to_i32(self.tile_index.x(), "tile x")?.write_le(write)?;
        usize_to_i32(self.tile_index.y(), "tile y")?.write_le(write)?;
        usize_to_i32(self.level_index.x(), "level x")?.write_le(write)?;
        usize_to_i32(self.level_index.y(), "level y")?.write_le(write)?;
        Ok(())
    }

    /// Read the value without validating.
    pub fn read_le(read: &mut impl Read) -> Result<Self> {
        let tile_x = i32::read_le(read)?;
        let tile_y = i32::read_le(read)?;

        let level_x = i32::read_le(read)?;
        let level_y = i32::read_le(read)?;

        if level_x > 31 || level_y > 31 {
            // there can be at most 31 levels, because the largest level
            // would have a size of 2^31, exceeding the maximum 32-bit integer value
            return Err(Error::corrupt("level index exceeding integer maximum"));
        }

        Ok(TileCoordinates {
            tile_index: Vec2(tile_x, tile_y).to_usize("tile coordinate index")?,
            level_index: Vec2(level_x, level_y).to_usize("tile coordinate level")?,
        })
    }

    /// The indices which can be used to index into the arrays of a data window.
    /// These coordinates are only valid inside the corresponding header.
    /// Will start at 0 and always be positive.
    pub fn to_data_indices(&self, tile_size: Vec2<usize>, max: Vec2<usize>) -> Result<IntegerBounds> {
        let x = self.tile_index.x() * tile_size.width();
        let y = self.tile_index.y() * tile_size.height();

        if x >= max.x() || y >= max.y() {
            Err(Error::corrupt("tile index out of bounds"))
        }
        else {
            Ok(IntegerBounds {
                position: Vec2(x, y).to_i32(),
                size: Vec2(
                    crate::meta::calculate_block_size(max.x(), tile_size.width(), x)?,
                    crate::meta::calculate_block_size(max.y(), tile_size.height(), y)?,
                ),
            })
        }
    }

    /// Absolute coordinates inside the global 2D space of a file, may be negative.
    pub fn to_absolute_indices(&self, tile_size: Vec2<usize>, data_window: IntegerBounds) -> Result<IntegerBounds> {
        let data = self.to_data_indices(tile_size, data_window.size)?;
        Ok(data.with_origin(data_window.position))
    }

    /// Returns if this is the original resolution or a smaller copy.
    pub fn is_largest_resolution_level(&self) -> bool {
        self.level_index == Vec2(0, 0)
    }
}


impl CompressedScanLineBlock {

    /// Without validation, write this instance to the byte stream.
    pub fn write<W: Write>(&self, write: &mut W) -> UnitResult {
        debug_assert_ne!(self.compressed_pixels.len(), 0, "empty blocks should not be put in the file bug");

        self.y_coordinate.write_le(write)?;
        u8::write_i32_sized_slice_le(write, &self.compressed_pixels)?;
        Ok(())
    }

    /// Read the value without validating.
    pub fn read(read: &mut impl Read, max_block_byte_size: usize) -> Result<Self> {
        let y_coordinate = i32::read_le(read)?;
        let compressed_pixels = u8::read_i32_sized_vec_le(read, max_block_byte_size, Some(max_block_byte_size), "scan line block sample count")?;
        Ok(CompressedScanLineBlock { y_coordinate, compressed_pixels })
    }

    /// Number of bytes this consumes in a file.
    pub fn byte_size(&self) -> usize {
        i32::BYTE_SIZE + i32::BYTE_SIZE + self.compressed_pixels.len()
    }
}

impl CompressedTileBlock {

    /// Without validation, write this instance to the byte stream.
    pub fn write<W: Write>(&self, write: &mut W) -> UnitResult {
        debug_assert_ne!(self.compressed_pixels.len(), 0, "empty blocks should not be put in the file bug");

        self.coordinates.write_le(write)?;
        u8::write_i32_sized_slice_le(write, &self.compressed_pixels)?;
        Ok(())
    }

    /// Read the value without validating.
    pub fn read(read: &mut impl Read, max_block_byte_size: usize) -> Result<Self> {
        let coordinates = TileCoordinates::read_le(read)?;
        let compressed_pixels = u8::read_i32_sized_vec_le(read, max_block_byte_size, Some(max_block_byte_size), "tile block sample count")?;
        Ok(CompressedTileBlock { coordinates, compressed_pixels })
    }

    /// Number of bytes this consumes in a file.
    pub fn byte_size(&self) -> usize {
        4 * i32::BYTE_SIZE + i32::BYTE_SIZE + self.compressed_pixels.len()
    }
}

impl CompressedDeepScanLineBlock {

    /// Without validation, write this instance to the byte stream.
    pub fn write<W: Write>(&self, write: &mut W) -> UnitResult {
        debug_assert_ne!(self.compressed_sample_count_table.len(), 0, "empty table should not be put in the file bug");

        self.y_coordinate.write_le(write)?;
        (self.compressed_sample_count_table.len() as u64).write_le(write)?;
        (self.compressed_sample_data.len() as u64).write_le(write)?;
        (self.decompressed_sample_data_size as u64).write_le(write)?;
        u8::write_slice_le(write, &self.compressed_sample_count_table)?;
        u8::write_slice_le(write, &self.compressed_sample_data)?;
        Ok(())
    }

    /// Read the value without validating.
    pub fn read(read: &mut impl Read, max_block_byte_size: usize) -> Result<Self> {
        let y_coordinate = i32::read_le(read)?;
        let compressed_sample_count_table_size = u64_to_usize(u64::read_le(read)?, "deep table size")?;
        let compressed_sample_data_size = u64_to_usize(u64::read_le(read)?, "deep data size")?;
        let decompressed_sample_data_size = u64_to_usize(u64::read_le(read)?, "raw deep data size")?;

        let compressed_sample_count_table = u8::read_vec_le(
            read, compressed_sample_count_table_size,
            6 * u16::MAX as usize, Some(max_block_byte_size),
            "deep scan line block table size"
        )?;

        let compressed_sample_data = u8::read_vec_le(
            read, compressed_sample_data_size,
            6 * u16::MAX as usize, Some(max_block_byte_size),
            "deep scan line block sample count"
        )?;

        Ok(CompressedDeepScanLineBlock {
            y_coordinate,
            decompressed_sample_data_size,
            compressed_sample_count_table,
            compressed_sample_data,
        })
    }

    /// Number of bytes this consumes in a file.
    pub fn byte_size(&self) -> usize {
        i32::BYTE_SIZE + 3 * u64::BYTE_SIZE
            + self.compressed_sample_count_table.len()
            + self.compressed_sample_data.len()
    }
}

impl CompressedDeepTileBlock {

    /// Without validation, write this instance to the byte stream.
    pub fn write<W: Write>(&self, write: &mut W) -> UnitResult {
        debug_assert_ne!(self.compressed_sample_count_table.len(), 0, "empty table should not be put in the file bug");

        self.coordinates.write_le(write)?;
        (self.compressed_sample_count_table.len() as u64).write_le(write)?;
        (self.compressed_sample_data.len() as u64).write_le(write)?;
        (self.decompressed_sample_data_size as u64).write_le(write)?;
        u8::write_slice_le(write, &self.compressed_sample_count_table)?;
        u8::write_slice_le(write, &self.compressed_sample_data)?;
        Ok(())
    }

    /// Read the value without validating.
    pub fn read(read: &mut impl Read, max_block_byte_size: usize) -> Result<Self> {
        let coordinates = TileCoordinates::read_le(read)?;
        let compressed_sample_count_table_size = u64_to_usize(u64::read_le(read)?, "deep table size")?;
        let compressed_sample_data_size = u64_to_usize(u64::read_le(read)?, "deep data size")?;
        let decompressed_sample_data_size = u64_to_usize(u64::read_le(read)?, "raw deep data size")?;

        let compressed_sample_count_table = u8::read_vec_le(
            read, compressed_sample_count_table_size,
            6 * u16::MAX as usize, Some(max_block_byte_size),
            "deep tile block table size"
        )?;

        let compressed_sample_data = u8::read_vec_le(
            read, compressed_sample_data_size,
            6 * u16::MAX as usize, Some(max_block_byte_size),
            "deep tile block sample count"
        )?;

        Ok(CompressedDeepTileBlock {
            coordinates,
            decompressed_sample_data_size,
            compressed_sample_count_table,
            compressed_sample_data,
        })
    }

    /// Number of bytes this consumes in a file.
    pub fn byte_size(&self) -> usize {
        4 * i32::BYTE_SIZE + 3 * u64::BYTE_SIZE
            + self.compressed_sample_count_table.len()
            + self.compressed_sample_data.len()
    }
}


/// Validation of chunks is done while reading and writing the actual data.
impl Chunk {

    /// Without validation, write this instance to the byte stream.
    pub fn write(&self, write: &mut impl Write, header_count: usize) -> UnitResult {
        debug_assert!(self.layer_index < header_count, "layer index bug");

        if header_count != 1 { usize_to_i32(self.layer_index, "layer index")?.write_le(write)?; }
        else { assert_eq!(self.layer_index, 0, "invalid layer index for single layer file"); }

        match self.block {
            CompressedBlock::ScanLine     (ref value) => value.write(write),
            CompressedBlock::Tile         (ref value) => value.write(write),
            CompressedBlock::DeepScanLine (ref value) => value.write(write),
            CompressedBlock::DeepTile     (ref value) => value.write(write),
        }
    }

    /// Read a chunk, looking up its block kind in the corresponding header.
    pub fn read(read: &mut impl Read, headers: &Headers, multilayer: bool) -> Result<Self> {
        let layer_index = {
            if multilayer { crate::error::i32_to_usize(i32::read_le(read)?, "chunk layer number")? }
            else { 0 } // reference the first header for single-layer images
        };

        let header = headers.get(layer_index)
            .ok_or_else(|| Error::corrupt("chunk layer number out of bounds"))?;

        let max_block_byte_size = header.max_block_byte_size();

        let block = match (header.blocks.has_tiles(), header.deep) {
            (false, false) => CompressedBlock::ScanLine(CompressedScanLineBlock::read(read, max_block_byte_size)?),
            (true, false) => CompressedBlock::Tile(CompressedTileBlock::read(read, max_block_byte_size)?),
            (false, true) => CompressedBlock::DeepScanLine(CompressedDeepScanLineBlock::read(read, max_block_byte_size)?),
            (true, true) => CompressedBlock::DeepTile(CompressedDeepTileBlock::read(read, max_block_byte_size)?),
        };

        Ok(Chunk { layer_index, block })
    }

    /// Number of bytes this chunk consumes in a file,
    /// excluding the optional multilayer index.
    pub fn byte_size(&self) -> usize {
        match self.block {
            CompressedBlock::ScanLine     (ref value) => value.byte_size(),
            CompressedBlock::Tile         (ref value) => value.byte_size(),
            CompressedBlock::DeepScanLine (ref value) => value.byte_size(),
            CompressedBlock::DeepTile     (ref value) => value.byte_size(),
        }
    }
}
