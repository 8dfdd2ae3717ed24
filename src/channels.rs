//! Canonical channel layout of the device buffers.
//!
//! The slot offsets are a wire contract with the filter kernel; the pass
//! names are the ones the renderer writes into its files.

/// Number of float channels per pixel in the device input buffer.
pub const INPUT_NUM_CHANNELS: usize = 15;

pub const INPUT_DEPTH: usize = 0;
pub const INPUT_NORMAL: usize = 1;
pub const INPUT_SHADOWING: usize = 4;
pub const INPUT_ALBEDO: usize = 5;
pub const INPUT_NOISY_IMAGE: usize = 8;
pub const INPUT_VARIANCE: usize = 11;
pub const INPUT_INTENSITY: usize = 14;

/// Number of float channels per pixel in a tile output buffer.
pub const OUTPUT_NUM_CHANNELS: usize = 3;

/// One required channel: the device slot it occupies and its
/// `"Pass.Component"` name as found in image files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    pub slot: usize,
    pub name: String,
}

fn fill_mapping(map: &mut Vec<ChannelMapping>, mut slot: usize, pass: &str, components: &str) {
    for c in components.chars() {
        map.push(ChannelMapping {
            slot,
            name: format!("{pass}.{c}"),
        });
        slot += 1;
    }
}

/// The ordered list of input channels the kernel expects.
pub fn input_channels() -> Vec<ChannelMapping> {
    let mut map = Vec::with_capacity(INPUT_NUM_CHANNELS);
    fill_mapping(&mut map, INPUT_DEPTH, "Denoising Depth", "Z");
    fill_mapping(&mut map, INPUT_NORMAL, "Denoising Normal", "XYZ");
    fill_mapping(&mut map, INPUT_SHADOWING, "Denoising Shadowing", "X");
    fill_mapping(&mut map, INPUT_ALBEDO, "Denoising Albedo", "RGB");
    fill_mapping(&mut map, INPUT_NOISY_IMAGE, "Noisy Image", "RGB");
    fill_mapping(&mut map, INPUT_VARIANCE, "Denoising Variance", "RGB");
    fill_mapping(&mut map, INPUT_INTENSITY, "Denoising Intensity", "X");
    map
}

/// The ordered list of output channels written back into the image.
pub fn output_channels() -> Vec<ChannelMapping> {
    let mut map = Vec::with_capacity(OUTPUT_NUM_CHANNELS);
    fill_mapping(&mut map, 0, "Combined", "RGB");
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_slots_are_dense_and_complete() {
        let map = input_channels();
        assert_eq!(map.len(), INPUT_NUM_CHANNELS);
        for (i, m) in map.iter().enumerate() {
            assert_eq!(m.slot, i);
        }
    }

    #[test]
    fn input_offsets_match_pass_boundaries() {
        let map = input_channels();
        assert_eq!(map[INPUT_DEPTH].name, "Denoising Depth.Z");
        assert_eq!(map[INPUT_NORMAL].name, "Denoising Normal.X");
        assert_eq!(map[INPUT_SHADOWING].name, "Denoising Shadowing.X");
        assert_eq!(map[INPUT_ALBEDO].name, "Denoising Albedo.R");
        assert_eq!(map[INPUT_NOISY_IMAGE].name, "Noisy Image.R");
        assert_eq!(map[INPUT_VARIANCE].name, "Denoising Variance.R");
        assert_eq!(map[INPUT_INTENSITY].name, "Denoising Intensity.X");
    }

    #[test]
    fn output_is_combined_rgb() {
        let map = output_channels();
        assert_eq!(map.len(), OUTPUT_NUM_CHANNELS);
        assert_eq!(map[0].name, "Combined.R");
        assert_eq!(map[1].name, "Combined.G");
        assert_eq!(map[2].name, "Combined.B");
    }
}
