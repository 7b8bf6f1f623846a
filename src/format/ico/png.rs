
//! A minimal PNG stream codec for icon subimages.
//!
//! Icon files may embed a complete PNG stream instead of a legacy DIB.
//! This module handles exactly the subset such subimages use: 8-bit
//! truecolour with or without alpha, no interlacing, with all five
//! scan line filters on decode and the null filter on encode.

use crate::math::Vec2;
use crate::io::*;
use crate::compress::zip;
use crate::error::*;

/// The signature starting every PNG stream.
pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Whether the bytes start with the PNG signature.
pub fn is_png(bytes: &[u8]) -> bool {
    bytes.len() >= SIGNATURE.len() && bytes[.. SIGNATURE.len()] == SIGNATURE
}

// scan line filter type codes
const FILTER_NONE: u8 = 0;
const FILTER_SUB: u8 = 1;
const FILTER_UP: u8 = 2;
const FILTER_AVERAGE: u8 = 3;
const FILTER_PAETH: u8 = 4;

/// The crc of a chunk covers its tag and payload.
fn crc32(bytes_groups: &[&[u8]]) -> u32 {
    let mut crc = u32::MAX;

    for bytes in bytes_groups {
        for &byte in *bytes {
            crc ^= byte as u32;

            for _bit in 0 .. 8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (0xedb8_8320 & mask);
            }
        }
    }

    !crc
}

/// Decode a PNG stream into interleaved 8-bit pixels.
/// Returns the image size, the channel count (3 or 4), and the pixels.
pub fn decode(bytes: &[u8]) -> Result<(Vec2<usize>, usize, Vec<u8>)> {
    if !is_png(bytes) {
        return Err(Error::malformed("png signature missing"));
    }

    let mut read = &bytes[SIGNATURE.len() ..];

    let mut size = Vec2(0_usize, 0_usize);
    let mut channels = 0_usize;
    let mut seen_header = false;
    let mut compressed = Vec::new();

    loop {
        let payload_size = u32::read_be(&mut read)? as usize;

        let mut tag = [0_u8; 4];
        u8::read_slice_le(&mut read, &mut tag)?;

        if read.len() < payload_size + 4 {
            return Err(Error::corrupt("png chunk ends too soon"));
        }

        let (payload, rest) = read.split_at(payload_size);
        read = &rest[4 ..]; // checksum is not verified on decode

        match &tag {
            b"IHDR" => {
                if payload.len() != 13 {
                    return Err(Error::malformed("png header chunk size"));
                }

                let mut header = payload;
                let width = u32::read_be(&mut header)? as usize;
                let height = u32::read_be(&mut header)? as usize;
                let bit_depth = u8::read_le(&mut header)?;
                let color_type = u8::read_le(&mut header)?;
                let compression = u8::read_le(&mut header)?;
                let filter_method = u8::read_le(&mut header)?;
                let interlace = u8::read_le(&mut header)?;

                if width == 0 || height == 0 || width > 65536 || height > 65536
                    || width * height > 1 << 26
                {
                    return Err(Error::malformed("png image dimensions"));
                }

                if compression != 0 || filter_method != 0 {
                    return Err(Error::malformed("png compression or filter method"));
                }

                if interlace != 0 {
                    return Err(Error::unsupported("interlaced png"));
                }

                channels = match (bit_depth, color_type) {
                    (8, 2) => 3,
                    (8, 6) => 4,
                    _ => return Err(Error::unsupported("png bit depth or colour type")),
                };

                size = Vec2(width, height);
                seen_header = true;
            },

            b"IDAT" => {
                if !seen_header {
                    return Err(Error::malformed("png pixel data before header"));
                }

                compressed.extend_from_slice(payload);
            },

            b"IEND" => break,

            // ancillary chunks are skipped
            _ => {},
        }
    }

    if !seen_header {
        return Err(Error::malformed("missing png header chunk"));
    }

    let row_bytes = size.width() * channels;
    let filtered = zip::decompress(&compressed, (row_bytes + 1) * size.height())?;

    if filtered.len() != (row_bytes + 1) * size.height() {
        return Err(Error::corrupt("png pixel data size mismatch"));
    }

    // undo the per-row filters; each row depends on the previous unfiltered row
    let mut pixels = vec![0_u8; row_bytes * size.height()];

    for y in 0 .. size.height() {
        let filter = filtered[y * (row_bytes + 1)];
        let row = &filtered[y * (row_bytes + 1) + 1 .. (y + 1) * (row_bytes + 1)];

        let (previous_rows, current) = pixels.split_at_mut(y * row_bytes);
        let current = &mut current[.. row_bytes];
        let previous = previous_rows.chunks_exact(row_bytes).last();

        unfilter_row(filter, row, previous, current, channels)?;
    }

    Ok((size, channels, pixels))
}

fn unfilter_row(
    filter: u8, filtered: &[u8], previous: Option<&[u8]>,
    current: &mut [u8], channels: usize,
) -> UnitResult
{
    let above = |index: usize| previous.map(|row| row[index]).unwrap_or(0);

    match filter {
        FILTER_NONE => current.copy_from_slice(filtered),

        FILTER_SUB => {
            for index in 0 .. filtered.len() {
                let left = if index >= channels { current[index - channels] } else { 0 };
                current[index] = filtered[index].wrapping_add(left);
            }
        },

        FILTER_UP => {
            for index in 0 .. filtered.len() {
                current[index] = filtered[index].wrapping_add(above(index));
            }
        },

        FILTER_AVERAGE => {
            for index in 0 .. filtered.len() {
                let left = if index >= channels { current[index - channels] } else { 0 };
                let average = ((left as u16 + above(index) as u16) / 2) as u8;
                current[index] = filtered[index].wrapping_add(average);
            }
        },

        FILTER_PAETH => {
            for index in 0 .. filtered.len() {
                let left = if index >= channels { current[index - channels] } else { 0 };
                let up = above(index);
                let up_left = if index >= channels { above(index - channels) } else { 0 };

                current[index] = filtered[index].wrapping_add(paeth(left, up, up_left));
            }
        },

        _ => return Err(Error::corrupt("png filter type")),
    }

    Ok(())
}

fn paeth(left: u8, up: u8, up_left: u8) -> u8 {
    let estimate = left as i16 + up as i16 - up_left as i16;
    let delta_left = (estimate - left as i16).abs();
    let delta_up = (estimate - up as i16).abs();
    let delta_up_left = (estimate - up_left as i16).abs();

    if delta_left <= delta_up && delta_left <= delta_up_left { left }
    else if delta_up <= delta_up_left { up }
    else { up_left }
}

/// Encode interleaved 8-bit pixels as a PNG stream,
/// using the null filter for every row.
pub fn encode(size: Vec2<usize>, channels: usize, pixels: &[u8]) -> Result<Vec<u8>> {
    debug_assert_eq!(pixels.len(), size.area() * channels, "pixel byte count bug");

    let color_type = match channels {
        3 => 2_u8,
        4 => 6_u8,
        _ => return Err(Error::unsupported("png channel count")),
    };

    let mut bytes = Vec::with_capacity(pixels.len() / 2 + 128);
    u8::write_slice_le(&mut bytes, &SIGNATURE)?;

    let mut header = Vec::with_capacity(13);
    usize_to_u32(size.width(), "png width")?.write_be(&mut header)?;
    usize_to_u32(size.height(), "png height")?.write_be(&mut header)?;
    8_u8.write_le(&mut header)?; // bit depth
    color_type.write_le(&mut header)?;
    0_u8.write_le(&mut header)?; // compression method
    0_u8.write_le(&mut header)?; // filter method
    0_u8.write_le(&mut header)?; // no interlacing
    write_chunk(&mut bytes, b"IHDR", &header)?;

    let row_bytes = size.width() * channels;
    let mut filtered = Vec::with_capacity((row_bytes + 1) * size.height());

    for row in pixels.chunks_exact(row_bytes) {
        filtered.push(FILTER_NONE);
        filtered.extend_from_slice(row);
    }

    write_chunk(&mut bytes, b"IDAT", &zip::compress(&filtered))?;
    write_chunk(&mut bytes, b"IEND", &[])?;

    Ok(bytes)
}

fn write_chunk(write: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) -> UnitResult {
    usize_to_u32(payload.len(), "png chunk size")?.write_be(write)?;
    u8::write_slice_le(write, tag)?;
    u8::write_slice_le(write, payload)?;
    crc32(&[&tag[..], payload]).write_be(write)?;
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_rgb_and_rgba(){
        for &channels in &[3_usize, 4] {
            let size = Vec2(13, 7);
            let pixels: Vec<u8> = (0 .. size.area() * channels)
                .map(|index| ((index * 31) % 256) as u8)
                .collect();

            let encoded = encode(size, channels, &pixels).unwrap();
            assert!(is_png(&encoded));

            let (decoded_size, decoded_channels, decoded) = decode(&encoded).unwrap();
            assert_eq!(decoded_size, size);
            assert_eq!(decoded_channels, channels);
            assert_eq!(decoded, pixels);
        }
    }

    #[test]
    fn crc_matches_reference_value(){
        // the well-known check value of the ieee polynomial
        assert_eq!(crc32(&[&b"123456789"[..]]), 0xcbf4_3926);
    }

    #[test]
    fn all_filters_decode(){
        // hand-filter a tiny rgba image with every filter type, then decode
        let size = Vec2(3, 5);
        let channels = 4;
        let row_bytes = size.width() * channels;

        let pixels: Vec<u8> = (0 .. size.area() * channels)
            .map(|index| ((index * 11) % 256) as u8)
            .collect();

        let mut filtered = Vec::new();
        let mut previous_row = vec![0_u8; row_bytes];

        for (y, row) in pixels.chunks_exact(row_bytes).enumerate() {
            let filter = [FILTER_NONE, FILTER_SUB, FILTER_UP, FILTER_AVERAGE, FILTER_PAETH][y];
            filtered.push(filter);

            for index in 0 .. row_bytes {
                let left = if index >= channels { row[index - channels] } else { 0 };
                let up = previous_row[index];
                let up_left = if index >= channels { previous_row[index - channels] } else { 0 };

                let prediction = match filter {
                    FILTER_NONE => 0,
                    FILTER_SUB => left,
                    FILTER_UP => up,
                    FILTER_AVERAGE => ((left as u16 + up as u16) / 2) as u8,
                    FILTER_PAETH => paeth(left, up, up_left),
                    _ => unreachable!(),
                };

                filtered.push(row[index].wrapping_sub(prediction));
            }

            previous_row = row.to_vec();
        }

        let mut bytes = Vec::new();
        u8::write_slice_le(&mut bytes, &SIGNATURE).unwrap();

        let mut header = Vec::new();
        (size.width() as u32).write_be(&mut header).unwrap();
        (size.height() as u32).write_be(&mut header).unwrap();
        header.extend_from_slice(&[8, 6, 0, 0, 0]);
        write_chunk(&mut bytes, b"IHDR", &header).unwrap();
        write_chunk(&mut bytes, b"IDAT", &zip::compress(&filtered)).unwrap();
        write_chunk(&mut bytes, b"IEND", &[]).unwrap();

        let (_, _, decoded) = decode(&bytes).unwrap();
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn garbage_is_rejected(){
        assert!(decode(&[0; 64]).is_err());

        let mut truncated = encode(Vec2(4, 4), 4, &[0; 64]).unwrap();
        truncated.truncate(truncated.len() / 2);
        assert!(decode(&truncated).is_err());
    }
}
