//! Channel-name parsing and render-layer assembly.
//!
//! File channels arrive as `Layer.Pass.Channel` (or
//! `Layer.Pass.View.Channel` for multi-view files). Channels are grouped
//! by layer key; a layer survives only if it carries the complete input
//! and output channel sets, in which case its reshuffle tables map every
//! device slot to a file channel index.

use std::collections::BTreeMap;

use crate::channels::{
    INPUT_NUM_CHANNELS, OUTPUT_NUM_CHANNELS, ChannelMapping, input_channels, output_channels,
};
use crate::container::ImageSpec;
use crate::error::{QuellError, QuellResult};

#[derive(Clone, Debug)]
pub struct DenoiseLayer {
    pub name: String,
    /// `"Pass.Channel"` names in file discovery order.
    pub channels: Vec<String>,
    /// File channel index of each entry in `channels`.
    pub layer_to_image_channel: Vec<usize>,
    /// File channel index for each of the 15 device input slots.
    pub input_to_image_channel: Vec<usize>,
    /// File channel index for each of the 3 device output slots.
    pub output_to_image_channel: Vec<usize>,
    /// Per neighbor frame, the input remap into that neighbor's channel list.
    pub neighbor_input_to_image_channel: Vec<Vec<usize>>,
    pub samples: u32,
}

impl DenoiseLayer {
    /// Resolve, for one neighbor frame, the channel index carrying the
    /// same data as each center input slot. Returns false when the
    /// neighbor lacks any required channel.
    pub fn match_channels(
        &mut self,
        neighbor: usize,
        channel_names: &[String],
        neighbor_channel_names: &[String],
    ) -> bool {
        debug_assert_eq!(self.neighbor_input_to_image_channel.len(), neighbor);

        let mut mapping = Vec::with_capacity(self.input_to_image_channel.len());
        for &image_channel in &self.input_to_image_channel {
            let name = &channel_names[image_channel];
            match neighbor_channel_names.iter().position(|c| c == name) {
                Some(pos) => mapping.push(pos),
                None => return false,
            }
        }

        self.neighbor_input_to_image_channel.push(mapping);
        true
    }
}

fn split_last_dot(name: &str) -> Option<(&str, &str)> {
    let pos = name.rfind('.')?;
    Some((&name[..pos], &name[pos + 1..]))
}

/// Split a file channel name into its layer key and `"Pass.Channel"`
/// remainder. Names with too few components are passed through untouched
/// (returns `None`), not treated as errors.
fn parse_channel_name(name: &str, multi_view: bool) -> Option<(String, String)> {
    let (rest, channel) = split_last_dot(name)?;
    let (rest, view) = if multi_view {
        split_last_dot(rest)?
    } else {
        (rest, "")
    };
    let (layer, pass) = split_last_dot(rest)?;

    let key = if multi_view {
        format!("{layer}.{view}")
    } else {
        layer.to_string()
    };
    Some((key, format!("{pass}.{channel}")))
}

/// Build a slot → file-channel table, or `None` if any required channel
/// is absent from this layer.
fn detect_reshuffle(
    channels: &[String],
    layer_to_image_channel: &[usize],
    wanted: &[ChannelMapping],
    num_slots: usize,
) -> Option<Vec<usize>> {
    let mut table = vec![None; num_slots];
    for mapping in wanted {
        let layer_channel = channels.iter().position(|c| c == &mapping.name)?;
        table[mapping.slot] = Some(layer_to_image_channel[layer_channel]);
    }
    table.into_iter().collect()
}

/// Leading decimal run of `s`, so values with trailing annotations still
/// parse the way the original metadata writers expect.
fn parse_leading_u32(s: &str) -> Option<u32> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Group the file's channels into layers and keep the ones carrying the
/// full denoising channel set.
///
/// `samples_override` takes precedence when positive; otherwise each
/// layer's `cycles.<layer>.samples` attribute must supply the count.
pub fn parse_channels(spec: &ImageSpec, samples_override: u32) -> QuellResult<Vec<DenoiseLayer>> {
    let multi_view = spec.is_multi_view();

    #[derive(Default)]
    struct Provisional {
        channels: Vec<String>,
        layer_to_image_channel: Vec<usize>,
    }

    let mut file_layers: BTreeMap<String, Provisional> = BTreeMap::new();
    for (i, name) in spec.channels.iter().enumerate() {
        if let Some((key, pass_channel)) = parse_channel_name(name, multi_view) {
            let layer = file_layers.entry(key).or_default();
            layer.channels.push(pass_channel);
            layer.layer_to_image_channel.push(i);
        }
    }

    let input = input_channels();
    let output = output_channels();

    let mut layers = Vec::new();
    for (name, provisional) in file_layers {
        let Some(input_table) = detect_reshuffle(
            &provisional.channels,
            &provisional.layer_to_image_channel,
            &input,
            INPUT_NUM_CHANNELS,
        ) else {
            continue;
        };
        let Some(output_table) = detect_reshuffle(
            &provisional.channels,
            &provisional.layer_to_image_channel,
            &output,
            OUTPUT_NUM_CHANNELS,
        ) else {
            continue;
        };

        let mut samples = samples_override;
        if samples < 1 {
            let attribute = format!("cycles.{name}.samples");
            // An attribute stored as an empty string counts as absent.
            if let Some(value) = spec.attribute(&attribute).filter(|v| !v.is_empty()) {
                samples = parse_leading_u32(value).ok_or_else(|| {
                    QuellError::missing_samples(format!(
                        "Failed to parse samples metadata: {value}"
                    ))
                })?;
            }
        }
        if samples < 1 {
            return Err(QuellError::missing_samples(format!(
                "No sample number specified in the file for layer {name} or on the command line"
            )));
        }

        tracing::debug!(layer = %name, samples, "detected denoisable layer");
        layers.push(DenoiseLayer {
            name,
            channels: provisional.channels,
            layer_to_image_channel: provisional.layer_to_image_channel,
            input_to_image_channel: input_table,
            output_to_image_channel: output_table,
            neighbor_input_to_image_channel: Vec::new(),
            samples,
        });
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_channel_names(layer: &str) -> Vec<String> {
        let mut names: Vec<String> = input_channels()
            .into_iter()
            .map(|m| format!("{layer}.{}", m.name))
            .collect();
        names.extend(
            output_channels()
                .into_iter()
                .map(|m| format!("{layer}.{}", m.name)),
        );
        names
    }

    fn spec_with(channels: Vec<String>) -> ImageSpec {
        ImageSpec::new(4, 4, channels)
    }

    #[test]
    fn full_layer_is_detected_with_valid_tables() {
        let mut spec = spec_with(full_channel_names("RenderLayer"));
        spec.set_attribute("cycles.RenderLayer.samples", "16");

        let layers = parse_channels(&spec, 0).unwrap();
        assert_eq!(layers.len(), 1);
        let layer = &layers[0];
        assert_eq!(layer.name, "RenderLayer");
        assert_eq!(layer.samples, 16);
        assert_eq!(layer.input_to_image_channel.len(), INPUT_NUM_CHANNELS);
        assert_eq!(layer.output_to_image_channel.len(), OUTPUT_NUM_CHANNELS);
        // Channels were listed in slot order, so the tables are identity
        // up to the output block at the tail.
        assert_eq!(layer.input_to_image_channel, (0..15).collect::<Vec<_>>());
        assert_eq!(layer.output_to_image_channel, vec![15, 16, 17]);
    }

    #[test]
    fn reshuffle_follows_file_order() {
        let mut names = full_channel_names("L");
        names.reverse();
        let mut spec = spec_with(names);
        spec.set_attribute("cycles.L.samples", "8");

        let layers = parse_channels(&spec, 0).unwrap();
        let layer = &layers[0];
        assert_eq!(layer.input_to_image_channel, (3..18).rev().collect::<Vec<_>>());
        assert_eq!(layer.output_to_image_channel, vec![2, 1, 0]);
    }

    #[test]
    fn layer_missing_one_input_channel_is_dropped() {
        let names: Vec<String> = full_channel_names("L")
            .into_iter()
            .filter(|n| n != "L.Denoising Shadowing.X")
            .collect();
        let layers = parse_channels(&spec_with(names), 4).unwrap();
        assert!(layers.is_empty());
    }

    #[test]
    fn unparsable_names_pass_through_silently() {
        let mut names = full_channel_names("L");
        names.push("Shadow.R".into());
        names.push("Z".into());
        let layers = parse_channels(&spec_with(names), 4).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].channels.len(), 18);
    }

    #[test]
    fn multi_view_splits_into_one_layer_per_view() {
        let mut names = Vec::new();
        for view in ["left", "right"] {
            for m in input_channels().into_iter().chain(output_channels()) {
                let (pass, channel) = m.name.rsplit_once('.').unwrap();
                names.push(format!("RenderLayer.{pass}.{view}.{channel}"));
            }
        }
        let mut spec = spec_with(names);
        spec.views = vec!["left".into(), "right".into()];

        let layers = parse_channels(&spec, 4).unwrap();
        let keys: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(keys, vec!["RenderLayer.left", "RenderLayer.right"]);
    }

    #[test]
    fn a_single_view_is_not_multi_view() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.views = vec!["left".into()];
        assert!(!spec.is_multi_view());
        let layers = parse_channels(&spec, 4).unwrap();
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn samples_override_beats_metadata() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "16");
        let layers = parse_channels(&spec, 32).unwrap();
        assert_eq!(layers[0].samples, 32);
    }

    #[test]
    fn missing_samples_everywhere_is_an_error() {
        let err = parse_channels(&spec_with(full_channel_names("L")), 0).unwrap_err();
        assert!(matches!(err, QuellError::MissingSamples(_)));
        assert!(err.to_string().contains("layer L"));
    }

    #[test]
    fn empty_samples_metadata_counts_as_absent() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "");
        let err = parse_channels(&spec, 0).unwrap_err();
        assert!(matches!(err, QuellError::MissingSamples(_)));
        assert!(err.to_string().contains("No sample number specified"));
    }

    #[test]
    fn garbage_samples_metadata_is_an_error() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "lots");
        assert!(matches!(
            parse_channels(&spec, 0),
            Err(QuellError::MissingSamples(_))
        ));
    }

    #[test]
    fn samples_metadata_with_trailing_text_parses_its_leading_digits() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "24 (adaptive)");
        assert_eq!(parse_channels(&spec, 0).unwrap()[0].samples, 24);
    }

    #[test]
    fn match_channels_resolves_shuffled_neighbors() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "8");
        let mut layer = parse_channels(&spec, 0).unwrap().remove(0);

        let mut neighbor_names = full_channel_names("L");
        neighbor_names.rotate_left(5);
        assert!(layer.match_channels(0, &spec.channels, &neighbor_names));

        let mapping = &layer.neighbor_input_to_image_channel[0];
        assert_eq!(mapping.len(), INPUT_NUM_CHANNELS);
        for (slot, &neighbor_channel) in mapping.iter().enumerate() {
            let center_channel = layer.input_to_image_channel[slot];
            assert_eq!(
                neighbor_names[neighbor_channel],
                spec.channels[center_channel]
            );
        }
    }

    #[test]
    fn match_channels_fails_on_missing_neighbor_pass() {
        let mut spec = spec_with(full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "8");
        let mut layer = parse_channels(&spec, 0).unwrap().remove(0);

        let neighbor_names: Vec<String> = full_channel_names("L")
            .into_iter()
            .filter(|n| n != "L.Denoising Variance.G")
            .collect();
        assert!(!layer.match_channels(0, &spec.channels, &neighbor_names));
    }
}
