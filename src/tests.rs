// The reference kernel is a float implementation, while the JPEG encoder used to produce the
// inputs works in fixed point. Both round at slightly different places, so decoded pixels are only
// compared within a small tolerance.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure};
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

use crate::{
    frontend::{ComponentInfo, FrontEnd, ImageHeader},
    layout::{block_address, CoefficientBuffer, CHANNEL_STRIDE},
    BufferName, DevicePool, Error, ErrorKind, HostPool, JpegFrontEnd, MetadataRecord, PoolConfig,
    Program, Result, UnitCapacity,
};

const ABS_TOLERANCE: u8 = 3;
/// Subsampled chroma smears colour gradients across neighbouring pixels.
const SUBSAMPLED_TOLERANCE: u8 = 8;

/// Front-end serving 3-component images from an in-memory table.
///
/// Channel `c` of macroblock `mcu` is filled with `(mcu * 3 + c) % 256`. Paths missing from the
/// table fail to parse.
#[derive(Default)]
struct Synthetic {
    images: HashMap<PathBuf, (u32, u32)>,
    /// Paths whose coefficient fill fails after writing the samples.
    broken_fill: Vec<PathBuf>,
}

impl Synthetic {
    fn add(&mut self, path: impl Into<PathBuf>, width: u32, height: u32) -> PathBuf {
        let path = path.into();
        self.images.insert(path.clone(), (width, height));
        path
    }

    fn expected_pixel(header_width: u32, x: usize, y: usize) -> [u8; 3] {
        let mcu_width = (header_width as usize + 7) / 8;
        let mcu = (y / 8) * mcu_width + x / 8;
        [0, 1, 2].map(|c| ((mcu * 3 + c) % 256) as u8)
    }
}

impl FrontEnd for Synthetic {
    type Image = (PathBuf, ImageHeader);

    fn parse(&mut self, path: &Path) -> Result<Self::Image> {
        let &(w, h) = self
            .images
            .get(path)
            .ok_or_else(|| Error::from("not a JPEG file"))?;
        let component = ComponentInfo {
            h_sampling: 1,
            v_sampling: 1,
            qtable: 0,
        };
        let header = ImageHeader::new(w, h, vec![component; 3]);
        Ok((path.to_path_buf(), header))
    }

    fn header<'a>(&self, image: &'a Self::Image) -> &'a ImageHeader {
        &image.1
    }

    fn fill_coefficients(
        &mut self,
        (path, header): &Self::Image,
        units: &mut [CoefficientBuffer],
        unit_offset: usize,
        capacity: UnitCapacity,
    ) -> Result<()> {
        let w = header.mcu_width_real as usize;
        let h = header.mcu_height_real as usize;
        for mcu in 0..w * h {
            let addr = block_address(mcu, w, capacity);
            let unit = &mut units[unit_offset + addr.unit];
            for c in 0..3 {
                let start = addr.offset + c * CHANNEL_STRIDE;
                unit[start..start + 64].fill(((mcu * 3 + c) % 256) as i16);
            }
        }
        if self.broken_fill.contains(path) {
            return Err(Error::from("corrupt scan data"));
        }
        Ok(())
    }
}

fn passthrough(_: &MetadataRecord, _: &mut [i16]) {}

/// A scratch directory removed on drop.
struct TempDir(PathBuf);

impl TempDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("jpegpool-{}-{}", name, std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn join(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        fs::remove_dir_all(&self.0).ok();
    }
}

struct Bitmap {
    width: usize,
    height: usize,
    bytes: Vec<u8>,
}

impl Bitmap {
    fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)?;
        ensure!(bytes.len() >= 26, "truncated bitmap");
        let u32_at = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        let u16_at = |i: usize| u16::from_le_bytes(bytes[i..i + 2].try_into().unwrap());

        ensure!(&bytes[..2] == b"BM");
        ensure!(u32_at(2) as usize == bytes.len(), "size field mismatch");
        ensure!(u32_at(10) == 26);
        ensure!(u32_at(14) == 12);
        ensure!(u16_at(22) == 1);
        ensure!(u16_at(24) == 24);
        let (width, height) = (usize::from(u16_at(18)), usize::from(u16_at(20)));
        let stride = (3 * width + 3) / 4 * 4;
        ensure!(bytes.len() == 26 + stride * height);

        Ok(Self {
            width,
            height,
            bytes,
        })
    }

    fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let stride = (3 * self.width + 3) / 4 * 4;
        let i = 26 + (self.height - 1 - y) * stride + 3 * x;
        [self.bytes[i + 2], self.bytes[i + 1], self.bytes[i]]
    }
}

fn compare(rgb: &[u8], bmp: &Bitmap) -> anyhow::Result<()> {
    compare_within(rgb, bmp, ABS_TOLERANCE)
}

fn compare_within(rgb: &[u8], bmp: &Bitmap, tolerance: u8) -> anyhow::Result<()> {
    for y in 0..bmp.height {
        for x in 0..bmp.width {
            let mut ref_pixel = [0; 3];
            ref_pixel.copy_from_slice(&rgb[y * bmp.width * 3 + x * 3..][..3]);
            let actual = bmp.rgb(x, y);

            let max_diff = ref_pixel
                .iter()
                .zip(actual)
                .map(|(&a, b)| u8::abs_diff(a, b))
                .max()
                .unwrap();

            if max_diff > tolerance {
                bail!(
                    "image mismatch at {},{}: expected approx {:x?} got {:x?}",
                    x,
                    y,
                    ref_pixel,
                    actual,
                );
            }
        }
    }
    Ok(())
}

fn capacity(quad_groups: usize) -> UnitCapacity {
    UnitCapacity::from_quad_groups(quad_groups).unwrap()
}

#[test]
fn two_tiny_images_share_a_batch() {
    let dir = TempDir::new("share");
    let mut fe = Synthetic::default();
    let paths = vec![
        fe.add(dir.join("small.jpg"), 9, 9),
        fe.add(dir.join("square.jpg"), 16, 16),
    ];

    let mut pool = HostPool::with_kernel(4, capacity(4), passthrough).unwrap();
    let profile = crate::run(&paths, fe, &mut pool, &Program::builtin()).unwrap();
    assert_eq!(profile.offload.rounds, 1);
    assert_eq!(profile.assembly.batches, 1);
    assert_eq!(profile.offload.images_written, 2);

    for (name, w, h) in [("small.bmp", 9, 9), ("square.bmp", 16, 16)] {
        let bmp = Bitmap::read(&dir.join(name)).unwrap();
        assert_eq!((bmp.width, bmp.height), (w, h));
        for y in 0..h {
            for x in 0..w {
                assert_eq!(bmp.rgb(x, y), Synthetic::expected_pixel(w as u32, x, y));
            }
        }
    }
}

#[test]
fn batches_split_at_pool_size() {
    let dir = TempDir::new("split");
    let mut fe = Synthetic::default();
    let paths = vec![
        fe.add(dir.join("a.jpg"), 24, 24),    // 4 units
        fe.add(dir.join("b.jpg"), 9, 9),      // 1 unit
        fe.add(dir.join("c.jpg"), 17, 3),     // 2 units
        fe.add(dir.join("huge.jpg"), 40, 40), // 9 units
    ];

    let mut pool = HostPool::with_kernel(4, capacity(1), passthrough).unwrap();
    let profile = crate::run(&paths, fe, &mut pool, &Program::builtin()).unwrap();
    // [a], [b, c]
    assert_eq!(profile.offload.rounds, 2);
    assert_eq!(profile.offload.images_written, 3);
    assert_eq!(profile.assembly.skipped_oversized, 1);
    assert!(!dir.join("huge.bmp").exists());

    for (name, w, h) in [("a.bmp", 24, 24), ("b.bmp", 9, 9), ("c.bmp", 17, 3)] {
        let bmp = Bitmap::read(&dir.join(name)).unwrap();
        assert_eq!((bmp.width, bmp.height), (w, h));
        for y in 0..h {
            for x in 0..w {
                assert_eq!(
                    bmp.rgb(x, y),
                    Synthetic::expected_pixel(w as u32, x, y),
                    "{name} at {x},{y}"
                );
            }
        }
    }
}

#[test]
fn malformed_input_is_skipped() {
    let dir = TempDir::new("malformed");
    let mut fe = Synthetic::default();
    let broken = fe.add(dir.join("broken.jpg"), 16, 16);
    fe.broken_fill.push(broken.clone());
    let paths = vec![
        dir.join("garbage.jpg"),
        broken,
        fe.add(dir.join("fine.jpg"), 8, 8),
    ];

    let mut pool = HostPool::with_kernel(2, capacity(1), passthrough).unwrap();
    let profile = crate::run(&paths, fe, &mut pool, &Program::builtin()).unwrap();
    assert_eq!(profile.assembly.skipped_invalid, 2);
    assert_eq!(profile.offload.images_written, 1);
    assert!(!dir.join("garbage.bmp").exists());
    assert!(!dir.join("broken.bmp").exists());
    let bmp = Bitmap::read(&dir.join("fine.bmp")).unwrap();
    assert_eq!((bmp.width, bmp.height), (8, 8));
    assert_eq!(bmp.rgb(7, 7), Synthetic::expected_pixel(8, 7, 7));
}

/// A pool whose units stop responding on the second run.
struct FailingPool {
    runs: usize,
}

impl DevicePool for FailingPool {
    fn unit_count(&self) -> usize {
        1
    }

    fn unit_capacity(&self) -> UnitCapacity {
        capacity(1)
    }

    fn load_program(&mut self, _: &Program) -> Result<()> {
        Ok(())
    }

    fn copy_to_device(&mut self, _: BufferName, _: &[&[u8]]) -> Result<()> {
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.runs += 1;
        if self.runs > 1 {
            return Err(Error::device("unit 0 stopped responding"));
        }
        Ok(())
    }

    fn copy_from_device(&mut self, _: BufferName, _: &mut [&mut [u8]]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn device_failure_aborts_the_run() {
    let dir = TempDir::new("device-failure");
    let mut fe = Synthetic::default();
    let paths: Vec<_> = (0..20)
        .map(|i| fe.add(dir.join(&format!("{i}.jpg")), 8, 8))
        .collect();

    let mut pool = FailingPool { runs: 0 };
    let err = crate::run(&paths, fe, &mut pool, &Program::builtin()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert!(err.is_fatal());
    assert_eq!(pool.runs, 2);
    assert!(dir.join("0.bmp").exists());
    assert!(!dir.join("1.bmp").exists());
}

fn encode_jpeg(path: &Path, rgb: &[u8], width: u16, height: u16, variant: &Variant) {
    let mut out = Vec::new();
    let mut enc = Encoder::new(&mut out, 100);
    enc.set_sampling_factor(variant.sampling);
    enc.set_restart_interval(variant.restart_interval);
    let pixels: Vec<u8> = match variant.color {
        ColorType::Luma => rgb.chunks(3).map(|px| px[0]).collect(),
        _ => rgb.to_vec(),
    };
    enc.encode(&pixels, width, height, variant.color).unwrap();
    fs::write(path, out).unwrap();
}

struct Variant {
    name: &'static str,
    color: ColorType,
    sampling: SamplingFactor,
    restart_interval: u16,
    pattern: fn(usize, usize) -> [u8; 3],
    tolerance: u8,
}

fn solid(_: usize, _: usize) -> [u8; 3] {
    [200, 30, 90]
}

/// Red grows to the right and blue downwards, so every macroblock has distinct chroma.
fn color_gradient(x: usize, y: usize) -> [u8; 3] {
    [(40 + x * 5) as u8, 120, (40 + y * 6) as u8]
}

fn gray_gradient(x: usize, y: usize) -> [u8; 3] {
    let v = (x * 5 + y * 3) as u8;
    [v, v, v]
}

const VARIANTS: &[Variant] = &[
    Variant {
        name: "444",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_4_4,
        restart_interval: 0,
        pattern: solid,
        tolerance: ABS_TOLERANCE,
    },
    Variant {
        name: "422",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_2_2,
        restart_interval: 2,
        pattern: solid,
        tolerance: ABS_TOLERANCE,
    },
    Variant {
        name: "420",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_2_0,
        restart_interval: 0,
        pattern: solid,
        tolerance: ABS_TOLERANCE,
    },
    Variant {
        name: "440",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_4_0,
        restart_interval: 1,
        pattern: solid,
        tolerance: ABS_TOLERANCE,
    },
    Variant {
        name: "gray",
        color: ColorType::Luma,
        sampling: SamplingFactor::R_4_4_4,
        restart_interval: 3,
        pattern: gray_gradient,
        tolerance: ABS_TOLERANCE,
    },
    Variant {
        name: "422-gradient",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_2_2,
        restart_interval: 0,
        pattern: color_gradient,
        tolerance: SUBSAMPLED_TOLERANCE,
    },
    Variant {
        name: "420-gradient",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_2_0,
        restart_interval: 2,
        pattern: color_gradient,
        tolerance: SUBSAMPLED_TOLERANCE,
    },
    Variant {
        name: "440-gradient",
        color: ColorType::Rgb,
        sampling: SamplingFactor::R_4_4_0,
        restart_interval: 0,
        pattern: color_gradient,
        tolerance: SUBSAMPLED_TOLERANCE,
    },
];

fn check_jpeg_round_trip(pool: &mut dyn DevicePool, tag: &str) -> anyhow::Result<()> {
    let dir = TempDir::new(tag);
    let (width, height) = (35, 21);

    let mut inputs = Vec::new();
    for variant in VARIANTS {
        let rgb: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).flat_map(move |x| (variant.pattern)(x, y)))
            .collect();
        let path = dir.join(&format!("{}.jpg", variant.name));
        encode_jpeg(&path, &rgb, width as u16, height as u16, variant);
        inputs.push((path, rgb, variant.tolerance));
    }
    let paths: Vec<_> = inputs.iter().map(|(p, ..)| p.clone()).collect();

    let profile = crate::run(&paths, JpegFrontEnd::new(), pool, &Program::builtin())?;
    ensure!(profile.offload.images_written == VARIANTS.len());

    for (path, rgb, tolerance) in &inputs {
        let bmp = Bitmap::read(&path.with_extension("bmp"))?;
        ensure!((bmp.width, bmp.height) == (width, height));
        compare_within(rgb, &bmp, *tolerance)
            .map_err(|e| e.context(path.display().to_string()))?;
    }
    Ok(())
}

#[test]
fn jpeg_round_trip_on_host() {
    let mut pool = HostPool::new(3, capacity(4)).unwrap();
    check_jpeg_round_trip(&mut pool, "host").unwrap();
}

#[test]
#[ignore = "requires a GPU adapter"]
fn jpeg_round_trip_on_gpu() {
    env_logger::builder().is_test(true).try_init().ok();
    let config = PoolConfig {
        units: Some(8),
        unit_capacity: capacity(4),
        ..Default::default()
    };
    let mut pool = config.open().unwrap();
    check_jpeg_round_trip(&mut *pool, "gpu").unwrap();
}

#[test]
fn unreadable_jpeg_files() {
    let dir = TempDir::new("unreadable");
    let garbage = dir.join("garbage.jpg");
    fs::write(&garbage, b"definitely not a JPEG").unwrap();
    let good = dir.join("good.jpg");
    let rgb = vec![128; 8 * 8 * 3];
    encode_jpeg(&good, &rgb, 8, 8, &VARIANTS[0]);
    let paths = vec![dir.join("missing.jpg"), garbage, good];

    let mut pool = HostPool::new(1, capacity(1)).unwrap();
    let profile = crate::run(&paths, JpegFrontEnd::new(), &mut pool, &Program::builtin()).unwrap();
    assert_eq!(profile.assembly.skipped_invalid, 2);
    assert_eq!(profile.offload.images_written, 1);
    assert!(!dir.join("garbage.bmp").exists());
    let bmp = Bitmap::read(&dir.join("good.bmp")).unwrap();
    compare(&rgb, &bmp).unwrap();
}

#[test]
fn test_compare() {
    let bmp = |rgb: [u8; 3]| Bitmap {
        width: 1,
        height: 1,
        bytes: [vec![0; 26], vec![rgb[2], rgb[1], rgb[0], 0]].concat(),
    };
    compare(&[0, 0, 0], &bmp([0, 0, 0])).unwrap();
    compare(&[0, 0, 0], &bmp([ABS_TOLERANCE, 0, 0])).unwrap();
    compare(&[0, ABS_TOLERANCE, 0], &bmp([0, 0, 0])).unwrap();
    compare(&[ABS_TOLERANCE + 1, 0, 0], &bmp([0, 0, 0])).unwrap_err();
    compare(&[0, 0, 0], &bmp([0, 0, ABS_TOLERANCE + 1])).unwrap_err();
}

#[test]
fn profile_summary() {
    let mut profile = crate::Profile::default();
    profile.offload.rounds = 3;
    profile.offload.images_written = 5;
    profile.assembly.skipped_oversized = 1;
    let text = profile.to_string();
    assert!(text.contains("Offload rounds: 3"), "{text}");
    assert!(text.contains("Images written: 5 (skipped: 0 invalid, 1 oversized, 0 unwritable)"));
    assert!(text.contains("Queue waiting time"));
    assert!(text.contains("Device execution time"));
}
