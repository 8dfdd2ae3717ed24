//! Per-frame preprocessing of the device input buffer.
//!
//! Runs on each frame slab before upload: an optional clamp of every
//! feature value, then a separable box blur over the sample-intensity
//! slot. The blur divides by the true number of contributing samples, so
//! windows shrink at the image border instead of padding.

use crate::channels::{INPUT_INTENSITY, INPUT_NUM_CHANNELS};

/// Feature values are clamped to this magnitude before filtering.
pub const CLAMP_LIMIT: f32 = 1e8;

/// Clamp every float of one frame slab to `[-CLAMP_LIMIT, CLAMP_LIMIT]`.
pub fn clamp_frame(data: &mut [f32]) {
    for v in data.iter_mut() {
        *v = v.clamp(-CLAMP_LIMIT, CLAMP_LIMIT);
    }
}

/// Box-blur the intensity channel of one frame slab in place.
///
/// `data` is `width * height * 15` floats; only the intensity slot is
/// touched. A radius of 0 leaves the channel bit-identical.
pub fn blur_intensity(data: &mut [f32], width: usize, height: usize, radius: usize) {
    debug_assert_eq!(data.len(), width * height * INPUT_NUM_CHANNELS);

    let mut temp = vec![0.0f32; width * height];
    horizontal_pass(data, &mut temp, width, height, radius);
    vertical_pass(&temp, data, width, height, radius);
}

fn horizontal_pass(src: &[f32], dst: &mut [f32], width: usize, height: usize, radius: usize) {
    for y in 0..height {
        for x in 0..width {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(width);
            let mut sum = 0.0f32;
            for dx in x0..x1 {
                sum += src[INPUT_NUM_CHANNELS * (y * width + dx) + INPUT_INTENSITY];
            }
            dst[y * width + x] = sum / (x1 - x0) as f32;
        }
    }
}

fn vertical_pass(src: &[f32], dst: &mut [f32], width: usize, height: usize, radius: usize) {
    for y in 0..height {
        for x in 0..width {
            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius + 1).min(height);
            let mut sum = 0.0f32;
            for dy in y0..y1 {
                sum += src[dy * width + x];
            }
            dst[INPUT_NUM_CHANNELS * (y * width + x) + INPUT_INTENSITY] =
                sum / (y1 - y0) as f32;
        }
    }
}
