//! Host implementation of the reconstruction kernel.
//!
//! Mirrors `reconstruct.wgsl` step for step: dequantize, inverse DCT, chroma upsampling and
//! YCbCr to RGB conversion, all in place on one unit's coefficient buffer. After it ran, channels
//! 0, 1 and 2 of every macroblock hold red, green and blue samples in `0..=255`.

use std::{f32::consts::PI, sync::OnceLock};

use crate::{
    layout::{BLOCK_SAMPLES, CHANNEL_STRIDE, QUAD_GROUP_STRIDE},
    metadata::MetadataRecord,
};

/// Runs the kernel over every quad-group of a unit.
///
/// Units carrying an unused (all-zero) record are left untouched.
pub fn reconstruct_unit(record: &MetadataRecord, mcus: &mut [i16]) {
    if record.is_unused() {
        return;
    }
    let groups = record.unit_capacity as usize / 4;
    for group in mcus.chunks_exact_mut(QUAD_GROUP_STRIDE).take(groups) {
        reconstruct_quad_group(record, group);
    }
}

/// `basis()[x][u]` is `C(u) / 2 * cos((2x + 1) * u * PI / 16)`.
fn basis() -> &'static [[f32; 8]; 8] {
    static BASIS: OnceLock<[[f32; 8]; 8]> = OnceLock::new();
    BASIS.get_or_init(|| {
        let mut table = [[0.0; 8]; 8];
        for (x, row) in table.iter_mut().enumerate() {
            for (u, value) in row.iter_mut().enumerate() {
                let c = if u == 0 { std::f32::consts::FRAC_1_SQRT_2 } else { 1.0 };
                *value = 0.5 * c * (((2 * x + 1) * u) as f32 * PI / 16.0).cos();
            }
        }
        table
    })
}

fn idct(coeffs: &[f32; 64], out: &mut [f32]) {
    let basis = basis();
    let mut tmp = [0.0f32; 64];
    for v in 0..8 {
        for x in 0..8 {
            tmp[v * 8 + x] = (0..8).map(|u| basis[x][u] * coeffs[v * 8 + u]).sum();
        }
    }
    for y in 0..8 {
        for x in 0..8 {
            out[y * 8 + x] = (0..8).map(|v| basis[y][v] * tmp[v * 8 + x]).sum();
        }
    }
}

#[inline]
fn to_sample(value: f32) -> i16 {
    (value + 0.5).floor().clamp(0.0, 255.0) as i16
}

fn reconstruct_quad_group(record: &MetadataRecord, group: &mut [i16]) {
    let components = (record.component_count as usize).min(3);

    let mut planes = [0.0f32; QUAD_GROUP_STRIDE];
    let mut coeffs = [0.0f32; 64];
    for c in 0..components {
        let qtable = &record.qtables[record.qtable_ids[c] as usize & 3].values;
        for s in 0..4 {
            let block = c * CHANNEL_STRIDE + s * BLOCK_SAMPLES;
            for (k, coeff) in coeffs.iter_mut().enumerate() {
                *coeff = f32::from(group[block + k]) * qtable[k] as f32;
            }
            idct(&coeffs, &mut planes[block..block + 64]);
        }
    }

    for s in 0..4 {
        for py in 0..8 {
            for px in 0..8 {
                let i = s * BLOCK_SAMPLES + py * 8 + px;
                let luma = planes[i] + 128.0;
                let [r, g, b] = if components < 3 {
                    let l = to_sample(luma);
                    [l, l, l]
                } else {
                    let ci = chroma_index(record, s, py, px);
                    let cb = planes[CHANNEL_STRIDE + ci];
                    let cr = planes[2 * CHANNEL_STRIDE + ci];
                    [
                        to_sample(luma + 1.402 * cr),
                        to_sample(luma - 0.344136 * cb - 0.714136 * cr),
                        to_sample(luma + 1.772 * cb),
                    ]
                };
                group[i] = r;
                group[CHANNEL_STRIDE + i] = g;
                group[2 * CHANNEL_STRIDE + i] = b;
            }
        }
    }
}

/// Index (within a channel region) of the chroma sample covering luma pixel `(px, py)` of
/// sub-block `s`.
fn chroma_index(record: &MetadataRecord, s: usize, py: usize, px: usize) -> usize {
    let (mut row, mut col) = (s >> 1, s & 1);
    let (mut cx, mut cy) = (px, py);
    if record.h_sampling == 2 {
        cx = (col * 8 + px) >> 1;
        col = 0;
    }
    if record.v_sampling == 2 {
        cy = (row * 8 + py) >> 1;
        row = 0;
    }
    (row * 2 + col) * BLOCK_SAMPLES + cy * 8 + cx
}
