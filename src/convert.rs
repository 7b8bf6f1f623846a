
//! Pixel packing and unpacking: bit-depth conversion, channel reordering,
//! alpha association, palette expansion, and row flipping.
//!
//! These operate on interleaved byte buffers in the layout the raster
//! codecs produce, between the run-length layer and the frame buffer.

use crate::error::{Error, Result, UnitResult};

/// Rescale a value of `from_bits` significant bits into `to_bits` bits,
/// mapping the full source range onto the full target range:
/// `value * (2^to - 1) / (2^from - 1)`, rounded.
///
/// A plain shift would map the maximum source value short of the maximum
/// target value; the division keeps both ends of the range exact.
#[inline]
pub fn bit_range_convert(value: u32, from_bits: u32, to_bits: u32) -> u32 {
    debug_assert!(from_bits >= 1 && from_bits <= 32 && to_bits >= 1 && to_bits <= 32, "bit count out of range");
    debug_assert!(from_bits == 32 || value < (1 << from_bits), "value exceeds declared bit count");

    if from_bits == to_bits {
        return value;
    }

    let from_max = if from_bits == 32 { u32::MAX as u64 } else { (1_u64 << from_bits) - 1 };
    let to_max = if to_bits == 32 { u32::MAX as u64 } else { (1_u64 << to_bits) - 1 };

    ((value as u64 * to_max + from_max / 2) / from_max) as u32
}

/// Swap the first and third channel of every pixel, converting between the
/// BGR(A) order many formats store and the RGB(A) order of this library.
/// Works for any channel byte size by swapping whole sample byte groups.
pub fn swap_first_and_third_channel(interleaved: &mut [u8], channel_count: usize, bytes_per_channel: usize) {
    debug_assert!(channel_count >= 3, "channel swap on image without three channels");

    let pixel_size = channel_count * bytes_per_channel;
    debug_assert_eq!(interleaved.len() % pixel_size, 0, "partial pixel bug");

    for pixel in interleaved.chunks_exact_mut(pixel_size) {
        for byte_index in 0 .. bytes_per_channel {
            pixel.swap(byte_index, 2 * bytes_per_channel + byte_index);
        }
    }
}

/// Flip the scan lines of an image upside down, in place.
/// Several formats store scan line zero as the bottom row,
/// while this library uses the top-down convention.
pub fn flip_rows(pixels: &mut [u8], row_bytes: usize) {
    if row_bytes == 0 { return; }
    debug_assert_eq!(pixels.len() % row_bytes, 0, "partial row bug");

    let row_count = pixels.len() / row_bytes;

    for row in 0 .. row_count / 2 {
        let (top, rest) = pixels.split_at_mut((row + 1) * row_bytes);
        let top_row = &mut top[row * row_bytes ..];

        let mirrored = row_count - 1 - row;
        let bottom_row_start = mirrored * row_bytes - (row + 1) * row_bytes;
        let bottom_row = &mut rest[bottom_row_start .. bottom_row_start + row_bytes];

        top_row.swap_with_slice(bottom_row);
    }
}

/// Expand palette indices into interleaved channel values.
/// The palette stores `channel_count` bytes per entry.
pub fn expand_palette(indices: &[u8], palette: &[u8], channel_count: usize) -> Result<Vec<u8>> {
    debug_assert_eq!(palette.len() % channel_count.max(1), 0, "partial palette entry bug");
    let entry_count = palette.len() / channel_count;

    let mut expanded = Vec::with_capacity(indices.len() * channel_count);

    for &index in indices {
        let index = index as usize;
        if index >= entry_count {
            return Err(Error::corrupt("palette index out of bounds"));
        }

        expanded.extend_from_slice(&palette[index * channel_count .. (index + 1) * channel_count]);
    }

    Ok(expanded)
}


/// Convert one non-linear value in `0..=1` to linear space.
/// A gamma of `2.2` approximates the sRGB curve closely enough
/// for alpha association, which is how the raster formats declare it.
#[inline]
fn to_linear(non_linear: f32, gamma: f32) -> f32 {
    non_linear.powf(gamma)
}

/// Convert one linear value in `0..=1` back to non-linear space.
#[inline]
fn to_non_linear(linear: f32, gamma: f32) -> f32 {
    linear.powf(1.0 / gamma)
}

/// Multiply the colour channels of every pixel by its alpha value,
/// converting unassociated into associated alpha.
///
/// For gamma-encoded images the multiplication happens in linear space,
/// because multiplying 8-bit sRGB values directly darkens colours visibly.
///
/// If alpha is zero across the whole image, the image predates alpha being
/// written and the channel is meaningless; association is skipped entirely
/// instead of zeroing all colour.
pub fn associate_alpha_u8(interleaved: &mut [u8], channel_count: usize, alpha_channel: usize, gamma: f32) -> UnitResult {
    process_alpha_u8(interleaved, channel_count, alpha_channel, gamma, false)
}

/// Divide the colour channels of every pixel by its alpha value,
/// converting associated into unassociated alpha. Pixels with zero alpha
/// keep their colour values, as the division is undefined there.
pub fn deassociate_alpha_u8(interleaved: &mut [u8], channel_count: usize, alpha_channel: usize, gamma: f32) -> UnitResult {
    process_alpha_u8(interleaved, channel_count, alpha_channel, gamma, true)
}

fn process_alpha_u8(interleaved: &mut [u8], channel_count: usize, alpha_channel: usize, gamma: f32, divide: bool) -> UnitResult {
    if alpha_channel >= channel_count {
        return Err(Error::type_mismatch("alpha channel index out of bounds"));
    }

    debug_assert_eq!(interleaved.len() % channel_count.max(1), 0, "partial pixel bug");

    // legacy single-version files: all-zero alpha means "no alpha written"
    let alpha_is_meaningless = interleaved
        .chunks_exact(channel_count)
        .all(|pixel| pixel[alpha_channel] == 0);

    if alpha_is_meaningless {
        return Ok(());
    }

    let linear_gamma = gamma == 1.0;

    for pixel in interleaved.chunks_exact_mut(channel_count) {
        let alpha = pixel[alpha_channel];
        if alpha == 255 { continue; }
        if divide && alpha == 0 { continue; }

        for channel in 0 .. channel_count {
            if channel == alpha_channel { continue; }

            pixel[channel] = if linear_gamma {
                // integer multiply with rounding, no gamma involved
                if divide {
                    (((pixel[channel] as u32 * 255) + alpha as u32 / 2) / alpha as u32).min(255) as u8
                }
                else {
                    ((pixel[channel] as u32 * alpha as u32 + 127) / 255) as u8
                }
            }
            else {
                let linear = to_linear(pixel[channel] as f32 / 255.0, gamma);
                let alpha = alpha as f32 / 255.0;

                let multiplied = if divide { (linear / alpha).min(1.0) } else { linear * alpha };
                (to_non_linear(multiplied, gamma) * 255.0 + 0.5) as u8
            };
        }
    }

    Ok(())
}
