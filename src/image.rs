//! Per-frame image storage: the loaded center frame, lazily opened
//! neighbor readers, reshuffled reads into device layout, and safe
//! in-place write-back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::channels::INPUT_NUM_CHANNELS;
use crate::container::{ImageIo, ImageReader, ImageSpec, extension_of, unique_temp_suffix};
use crate::error::{QuellError, QuellResult};
use crate::layers::{DenoiseLayer, parse_channels};

/// Compile-time cap on total frames (center plus neighbors) the kernel
/// accepts.
pub const DENOISE_MAX_FRAMES: usize = 16;

/// Prefix of the sibling temp path used for in-place saving.
pub const TEMP_PREFIX: &str = ".denoise-tmp-";

pub struct DenoiseImage {
    pub width: usize,
    pub height: usize,
    pub num_channels: usize,
    /// Flat center-frame pixels, shared with the tile scheduler which
    /// scatters denoised rectangles back into it.
    pub pixels: Arc<Mutex<Vec<f32>>>,
    /// Input spec snapshot, preserved for write-back.
    pub in_spec: ImageSpec,
    pub layers: Vec<DenoiseLayer>,
    in_neighbors: Vec<Box<dyn ImageReader>>,
}

impl DenoiseImage {
    /// Open the center frame, detect its denoisable layers, and read all
    /// channels at once.
    pub fn load(io: &dyn ImageIo, path: &Path, samples_override: u32) -> QuellResult<Self> {
        if !io.is_regular_file(path) {
            return Err(QuellError::missing_file(path.display().to_string()));
        }

        let mut reader = io.open(path)?;
        let in_spec = reader.spec().clone();
        let (width, height) = (in_spec.width, in_spec.height);
        let num_channels = in_spec.num_channels();

        let layers = parse_channels(&in_spec, samples_override)?;
        if layers.is_empty() {
            return Err(QuellError::no_layers(format!(
                "could not find a render layer containing denoising info in {}",
                path.display()
            )));
        }

        // One interleaved read of every channel; per-channel reads are
        // slower against interleaved storage.
        let mut pixels = vec![0.0f32; width * height * num_channels];
        reader.read_pixels(&mut pixels)?;

        tracing::debug!(
            path = %path.display(),
            width,
            height,
            num_channels,
            num_layers = layers.len(),
            "loaded center frame"
        );

        Ok(Self {
            width,
            height,
            num_channels,
            pixels: Arc::new(Mutex::new(pixels)),
            in_spec,
            layers,
            in_neighbors: Vec::new(),
        })
    }

    /// Open the temporal neighbor frames for streaming reads, validating
    /// dimensions and channel coverage against every retained layer.
    pub fn load_neighbors(
        &mut self,
        io: &dyn ImageIo,
        filepaths: &[PathBuf],
        frames: &[usize],
    ) -> QuellResult<()> {
        if frames.len() > DENOISE_MAX_FRAMES - 1 {
            return Err(QuellError::frame_cap(format!(
                "maximum number of neighbors ({}) exceeded",
                DENOISE_MAX_FRAMES - 1
            )));
        }

        for (neighbor, &frame) in frames.iter().enumerate() {
            let filepath = &filepaths[frame];
            if !io.is_regular_file(filepath) {
                return Err(QuellError::missing_file(format!(
                    "neighbor frame {}",
                    filepath.display()
                )));
            }

            let reader = io.open(filepath)?;
            let neighbor_spec = reader.spec().clone();
            if neighbor_spec.width != self.width || neighbor_spec.height != self.height {
                return Err(QuellError::neighbor_mismatch(format!(
                    "neighbor frame has different dimensions: {}",
                    filepath.display()
                )));
            }

            for layer in &mut self.layers {
                if !layer.match_channels(neighbor, &self.in_spec.channels, &neighbor_spec.channels)
                {
                    return Err(QuellError::neighbor_mismatch(format!(
                        "neighbor frame misses denoising data passes: {}",
                        filepath.display()
                    )));
                }
            }

            self.in_neighbors.push(reader);
        }

        Ok(())
    }

    pub fn num_neighbors(&self) -> usize {
        self.in_neighbors.len()
    }

    pub fn lock_pixels(&self) -> std::sync::MutexGuard<'_, Vec<f32>> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy the loaded center frame into `dst` with channels reshuffled
    /// into the device input layout.
    pub fn read_pixels(&self, layer: &DenoiseLayer, dst: &mut [f32]) {
        let pixels = self.lock_pixels();
        let table = &layer.input_to_image_channel;
        for i in 0..self.width * self.height {
            for (j, &image_channel) in table.iter().enumerate() {
                dst[i * INPUT_NUM_CHANNELS + j] = pixels[i * self.num_channels + image_channel];
            }
        }
    }

    /// Read one neighbor frame and reshuffle it into the device input
    /// layout via the layer's per-neighbor remap.
    pub fn read_neighbor_pixels(
        &mut self,
        neighbor: usize,
        layer: &DenoiseLayer,
        dst: &mut [f32],
    ) -> QuellResult<()> {
        let reader = &mut self.in_neighbors[neighbor];
        let neighbor_channels = reader.spec().num_channels();

        let mut neighbor_pixels = vec![0.0f32; self.width * self.height * neighbor_channels];
        reader.read_pixels(&mut neighbor_pixels)?;

        let table = &layer.neighbor_input_to_image_channel[neighbor];
        for i in 0..self.width * self.height {
            for (j, &image_channel) in table.iter().enumerate() {
                dst[i * INPUT_NUM_CHANNELS + j] =
                    neighbor_pixels[i * neighbor_channels + image_channel];
            }
        }
        Ok(())
    }

    pub fn close_input(&mut self) {
        self.in_neighbors.clear();
    }

    /// Write the (partially rewritten) pixels back out, preserving the
    /// input's structure and metadata.
    ///
    /// The image goes to a sibling temp path first and is renamed over
    /// the target only after a complete write, so a failure mid-save
    /// never destroys the destination. The temp file is removed on any
    /// failure.
    pub fn save_output(&mut self, io: &dyn ImageIo, out_path: &Path) -> QuellResult<()> {
        let mut out_spec = self.in_spec.clone();

        // The output should carry sample information even if the input
        // didn't.
        for layer in &self.layers {
            let attribute = format!("cycles.{}.samples", layer.name);
            if out_spec.attribute(&attribute).is_none() {
                out_spec.set_attribute(attribute, layer.samples.to_string());
            }
        }

        // The input is no longer needed, and the target may be one of
        // the open files.
        self.close_input();

        let mut tmp = out_path.as_os_str().to_os_string();
        tmp.push(format!(
            "{TEMP_PREFIX}{}{}",
            unique_temp_suffix(),
            extension_of(out_path)
        ));
        let tmp_path = PathBuf::from(tmp);

        let result = (|| {
            let mut writer = io.create(&tmp_path, &out_spec)?;
            writer.write_pixels(&self.lock_pixels())?;
            writer.close()?;
            io.rename(&tmp_path, out_path)
        })();

        if result.is_err() {
            let _ = io.remove(&tmp_path);
        } else {
            tracing::debug!(path = %out_path.display(), "saved denoised frame");
        }
        result
    }
}
