
//! Write images to disk through the registry and read them back,
//! across formats, channel sets, and compression methods.

extern crate pixio;

use std::path::PathBuf;

use pixio::prelude::*;
use pixio::block::samples::interleaved_slices;

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("pixio-roundtrip-{}-{}", std::process::id(), name));
    path
}

fn names(list: &[&str]) -> Vec<Text> {
    list.iter().map(|&name| Text::from(name)).collect()
}

fn rgb_u8_header(size: Vec2<usize>, compression: Compression) -> Header {
    let channels = ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("R", SampleType::U8),
        ChannelDescription::new("G", SampleType::U8),
        ChannelDescription::new("B", SampleType::U8),
    ]);

    Header::new(size, channels).with_encoding(compression, Blocks::ScanLines, LineOrder::Increasing)
}

fn rgba_u8_header(size: Vec2<usize>, compression: Compression) -> Header {
    let channels = ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("R", SampleType::U8),
        ChannelDescription::new("G", SampleType::U8),
        ChannelDescription::new("B", SampleType::U8),
        ChannelDescription::new("A", SampleType::U8),
    ]);

    let mut header = Header::new(size, channels)
        .with_encoding(compression, Blocks::ScanLines, LineOrder::Increasing);

    header.alpha_mode = Some(AlphaMode::Unassociated);
    header
}

/// Write with the registry, read with the registry, compare everything.
fn roundtrip_through_registry(
    file_name: &str, header: Header,
    channel_names: &[&str], pixel_bytes: &[u8],
) {
    let registry = Registry::default();
    let path = temp_path(file_name);

    let size = header.data_size();
    let slices = || interleaved_slices(names(channel_names), SampleType::U8, size.width());

    {
        let mut output = registry.create_output(&path, header).unwrap();
        let source = FrameBuffer::new(pixel_bytes, slices());
        output.write_pixels(0 .. size.height(), &source).unwrap();
        output.close().unwrap();
    }

    let mut decoded = vec![0_u8; pixel_bytes.len()];

    {
        let mut input = registry.open_input(&path).unwrap();
        assert!(input.is_complete());
        assert_eq!(input.header().data_size(), size);

        let mut target = FrameBufferMut::new(&mut decoded, slices());
        input.read_pixels(0 .. size.height(), &mut target).unwrap();
    }

    std::fs::remove_file(&path).ok();
    assert_eq!(decoded, pixel_bytes, "{} roundtrip failed", file_name);
}

fn gradient_bytes(byte_count: usize) -> Vec<u8> {
    (0 .. byte_count).map(|index| ((index * 7) % 256) as u8).collect()
}

#[test]
fn rla_roundtrip_through_registry() {
    for (index, &compression) in [Compression::Uncompressed, Compression::Rle].iter().enumerate() {
        roundtrip_through_registry(
            &format!("{}.rla", index),
            rgb_u8_header(Vec2(33, 17), compression),
            &["R", "G", "B"],
            &gradient_bytes(33 * 17 * 3),
        );
    }
}

#[test]
fn tga_roundtrip_through_registry() {
    for (index, &compression) in [Compression::Uncompressed, Compression::Rle].iter().enumerate() {
        roundtrip_through_registry(
            &format!("{}.tga", index),
            rgba_u8_header(Vec2(21, 10), compression),
            &["R", "G", "B", "A"],
            &gradient_bytes(21 * 10 * 4),
        );
    }
}

#[test]
fn iff_roundtrip_through_registry() {
    for (index, &compression) in [Compression::Uncompressed, Compression::Rle].iter().enumerate() {
        roundtrip_through_registry(
            &format!("{}.iff", index),
            rgba_u8_header(Vec2(100, 70), compression), // forces partial tiles
            &["R", "G", "B", "A"],
            &gradient_bytes(100 * 70 * 4),
        );
    }
}

#[test]
fn ico_roundtrip_through_registry() {
    // fully opaque, so the one-bit transparency mask loses nothing
    let pixel_bytes: Vec<u8> = (0 .. 24 * 24)
        .flat_map(|index| [ (index * 3) as u8, (index * 5) as u8, (index * 7) as u8, 255 ])
        .collect();

    roundtrip_through_registry(
        "icon.ico",
        rgba_u8_header(Vec2(24, 24), Compression::Uncompressed),
        &["R", "G", "B", "A"],
        &pixel_bytes,
    );
}

#[test]
fn deep_container_roundtrip_through_registry() {
    let registry = Registry::default();
    let path = temp_path("deep.exr");

    let channels = ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("A", SampleType::F16),
        ChannelDescription::new("Z", SampleType::F32),
    ]);

    let size = Vec2(11, 6);
    let header = Header::new(size, channels.clone())
        .with_encoding(Compression::Zip1, Blocks::ScanLines, LineOrder::Increasing)
        .with_deep_data();

    let counts: Vec<u32> = (0 .. size.area()).map(|index| (index % 5) as u32).collect();
    let total: usize = counts.iter().sum::<u32>() as usize;

    let mut source = DeepFrameBuffer::allocate(&channels, size, &counts).unwrap();
    source.channels[0] = pixio::block::deep::DeepChannelData::F16(
        (0 .. total).map(|index| f16::from_f32((index % 32) as f32 / 32.0)).collect()
    );
    source.channels[1] = pixio::block::deep::DeepChannelData::F32(
        (0 .. total).map(|index| index as f32 * 0.5).collect()
    );

    {
        let mut output = registry.create_output(&path, header).unwrap();
        output.write_deep_pixels(0 .. size.height(), &source).unwrap();
        output.close().unwrap();
    }

    {
        let mut input = registry.open_input(&path).unwrap();
        assert_eq!(input.format_name(), "exr");
        assert!(input.header().deep);

        let mut decoded_counts = vec![0_u32; size.area()];
        input.read_pixel_sample_counts(0 .. size.height(), &mut decoded_counts).unwrap();
        assert_eq!(decoded_counts, counts);

        let mut target = DeepFrameBuffer::allocate(&channels, size, &decoded_counts).unwrap();
        input.read_deep_pixels(0 .. size.height(), &mut target).unwrap();
        assert_eq!(target, source);
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn flat_container_roundtrip_all_compressions() {
    let registry = Registry::default();

    for (index, &compression) in
        [Compression::Uncompressed, Compression::Rle, Compression::Zip1, Compression::Zip16]
        .iter().enumerate()
    {
        let path = temp_path(&format!("flat-{}.exr", index));

        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("G", SampleType::F32),
            ChannelDescription::new("R", SampleType::F32),
        ]);

        let size = Vec2(19, 40);
        let header = Header::new(size, channels)
            .with_encoding(compression, Blocks::ScanLines, LineOrder::Increasing);

        let values: Vec<f32> = (0 .. size.area() * 2).map(|index| (index % 100) as f32 * 0.125).collect();
        let pixel_bytes: Vec<u8> = values.iter().flat_map(|value| value.to_ne_bytes()).collect();

        let slices = || interleaved_slices(names(&["G", "R"]), SampleType::F32, size.width());

        {
            let mut output = registry.create_output(&path, header).unwrap();
            let source = FrameBuffer::new(&pixel_bytes, slices());
            output.write_pixels(0 .. size.height(), &source).unwrap();
            output.close().unwrap();
        }

        let mut decoded = vec![0_u8; pixel_bytes.len()];

        {
            let mut input = registry.open_input(&path).unwrap();
            assert_eq!(input.header().compression, compression);

            let mut target = FrameBufferMut::new(&mut decoded, slices());
            input.read_pixels(0 .. size.height(), &mut target).unwrap();
        }

        std::fs::remove_file(&path).ok();
        assert_eq!(decoded, pixel_bytes, "{} roundtrip failed", compression);
    }
}

#[test]
fn header_metadata_survives_the_roundtrip() {
    let registry = Registry::default();
    let path = temp_path("metadata.tga");

    let mut header = rgb_u8_header(Vec2(4, 4), Compression::Rle);
    header.owner = Some(Text::from("roundtrip author"));
    header.comments = Some(Text::from("written by the roundtrip test"));
    header.gamma = 2.2;

    {
        let mut output = registry.create_output(&path, header).unwrap();
        let pixel_bytes = gradient_bytes(4 * 4 * 3);
        let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B"]), SampleType::U8, 4));
        output.write_pixels(0 .. 4, &source).unwrap();
        output.close().unwrap();
    }

    {
        let input = registry.open_input(&path).unwrap();
        assert_eq!(input.header().owner, Some(Text::from("roundtrip author")));
        assert_eq!(input.header().comments, Some(Text::from("written by the roundtrip test")));
        assert!((input.header().gamma - 2.2).abs() < 0.01);
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn registry_detects_formats_by_magic_regardless_of_extension() {
    let registry = Registry::default();

    // write an iff file with a lying extension; magic detection must win
    let path = temp_path("actually-iff.dat");
    let header = rgba_u8_header(Vec2(8, 8), Compression::Rle);

    {
        let mut output = pixio::format::iff::IffOutput::create_path(&path, header, WriteOptions::default()).unwrap();
        let pixel_bytes = gradient_bytes(8 * 8 * 4);
        let source = FrameBuffer::new(&pixel_bytes, interleaved_slices(names(&["R", "G", "B", "A"]), SampleType::U8, 8));
        output.write_pixels(0 .. 8, &source).unwrap();
        output.close().unwrap();
    }

    let input = registry.open_input(&path).unwrap();
    assert_eq!(input.format_name(), "iff");

    std::fs::remove_file(&path).ok();
}

#[test]
fn multilayer_container_roundtrip() {
    use pixio::format::exr::{ExrInput, ExrOutput};

    let path = temp_path("multilayer.exr");

    let layer = |name: &str| {
        let channels = ChannelList::new(smallvec::smallvec![
            ChannelDescription::new("Y", SampleType::F32),
        ]);

        let mut header = Header::new(Vec2(6, 4), channels)
            .with_encoding(Compression::Rle, Blocks::ScanLines, LineOrder::Increasing);

        header.owner = Some(Text::from(name));
        header
    };

    let values_a: Vec<f32> = (0 .. 24).map(|index| index as f32).collect();
    let values_b: Vec<f32> = (0 .. 24).map(|index| index as f32 * -1.0).collect();

    let bytes_a: Vec<u8> = values_a.iter().flat_map(|value| value.to_ne_bytes()).collect();
    let bytes_b: Vec<u8> = values_b.iter().flat_map(|value| value.to_ne_bytes()).collect();

    {
        let file = std::io::BufWriter::new(std::fs::File::create(&path).unwrap());
        let mut output = ExrOutput::create(
            file,
            smallvec::smallvec![ layer("first"), layer("second") ],
            WriteOptions::default(),
        ).unwrap();

        let slices = || interleaved_slices(names(&["Y"]), SampleType::F32, 6);

        output.write_pixels(0 .. 4, &FrameBuffer::new(&bytes_a, slices())).unwrap();
        output.select_layer(1).unwrap();
        output.write_pixels(0 .. 4, &FrameBuffer::new(&bytes_b, slices())).unwrap();
        output.close().unwrap();
    }

    {
        let file = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let mut input = ExrInput::read(file, ReadOptions::default()).unwrap();

        assert_eq!(input.subimage_count(), 2);
        assert!(input.is_complete());

        let slices = || interleaved_slices(names(&["Y"]), SampleType::F32, 6);

        let mut decoded = vec![0_u8; bytes_a.len()];
        input.read_pixels(0 .. 4, &mut FrameBufferMut::new(&mut decoded, slices())).unwrap();
        assert_eq!(decoded, bytes_a);

        input.select_subimage(1).unwrap();
        assert_eq!(input.header().owner, Some(Text::from("second")));

        let mut decoded = vec![0_u8; bytes_b.len()];
        input.read_pixels(0 .. 4, &mut FrameBufferMut::new(&mut decoded, slices())).unwrap();
        assert_eq!(decoded, bytes_b);
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn tiled_container_roundtrip_with_mip_levels() {
    use pixio::format::exr::{ExrInput, ExrOutput};
    use pixio::block::chunk::TileCoordinates;

    let path = temp_path("tiled.exr");

    let channels = ChannelList::new(smallvec::smallvec![
        ChannelDescription::new("Y", SampleType::F32),
    ]);

    let header = Header::new(Vec2(32, 32), channels)
        .with_encoding(
            Compression::Zip16,
            Blocks::Tiles(TileDescription {
                tile_size: Vec2(16, 16),
                level_mode: LevelMode::MipMap,
                rounding_mode: RoundingMode::Down,
            }),
            LineOrder::Increasing,
        );

    let level_count = header.level_count();
    assert_eq!(level_count, Vec2(6, 6)); // 32, 16, 8, 4, 2, 1

    {
        let file = std::io::BufWriter::new(std::fs::File::create(&path).unwrap());
        let mut output = ExrOutput::create(file, smallvec::smallvec![header.clone()], WriteOptions::default()).unwrap();

        // write every tile of every level with a level-dependent pattern
        for level in 0 .. 6 {
            let level_size = header.level_size(Vec2(level, level));
            let tile_count = header.tile_count(Vec2(level, level));

            let values: Vec<f32> = (0 .. level_size.area()).map(|index| (level * 1000 + index) as f32).collect();
            let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_ne_bytes()).collect();
            let source = FrameBuffer::new(&bytes, interleaved_slices(names(&["Y"]), SampleType::F32, level_size.width()));

            for tile_y in 0 .. tile_count.y() {
                for tile_x in 0 .. tile_count.x() {
                    output.write_tile(TileCoordinates {
                        tile_index: Vec2(tile_x, tile_y),
                        level_index: Vec2(level, level),
                    }, &source).unwrap();
                }
            }
        }

        output.close().unwrap();
    }

    {
        let file = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let mut input = ExrInput::read(file, ReadOptions::default()).unwrap();
        assert!(input.is_complete());

        for level in 0 .. 6 {
            let level_size = input.header().level_size(Vec2(level, level));
            let tile_count = input.header().tile_count(Vec2(level, level));

            let expected: Vec<f32> = (0 .. level_size.area()).map(|index| (level * 1000 + index) as f32).collect();
            let mut decoded = vec![0_u8; level_size.area() * 4];

            {
                let mut target = FrameBufferMut::new(&mut decoded, interleaved_slices(names(&["Y"]), SampleType::F32, level_size.width()));

                for tile_y in 0 .. tile_count.y() {
                    for tile_x in 0 .. tile_count.x() {
                        input.read_tile(TileCoordinates {
                            tile_index: Vec2(tile_x, tile_y),
                            level_index: Vec2(level, level),
                        }, &mut target).unwrap();
                    }
                }
            }

            let decoded_values: Vec<f32> = decoded.chunks_exact(4)
                .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .collect();

            assert_eq!(decoded_values, expected, "level {} mismatch", level);
        }
    }

    std::fs::remove_file(&path).ok();
}
