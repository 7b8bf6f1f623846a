
//! Read and write RLA, TGA, IFF, ICO and deep scanline/tile image files.
//!
//! Every format sits behind the `ImageInput` and `ImageOutput` traits.
//! Open a file through a `format::Registry` value, or use a format's
//! module directly when the format is known up front.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod io;
pub mod math;
pub mod error;
pub mod meta;
pub mod compress;
pub mod block;
pub mod convert;
pub mod format;

/// Export of the most commonly used names.
pub mod prelude {

    // main exports
    pub use crate::format::{Registry, ImageInput, ImageOutput, ReadOptions, WriteOptions};

    // core data types
    pub use crate::meta::{Header, Blocks};
    pub use crate::meta::attribute::{
        ChannelList, ChannelDescription, SampleType,
        Text, IntegerBounds, TileDescription, LevelMode, LineOrder, AlphaMode,
    };

    pub use crate::block::samples::{FrameBuffer, FrameBufferMut, Sample, SliceDescription};
    pub use crate::block::deep::DeepFrameBuffer;
    pub use crate::compress::Compression;
    pub use crate::math::{Vec2, RoundingMode};
    pub use crate::error::{Error, Result, UnitResult};

    // re-export external stuff
    pub use half::f16;
}
