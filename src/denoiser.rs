//! The outer loop over output frames, and the user-facing parameters.

use std::path::{Path, PathBuf};

use smallvec::SmallVec;

use crate::container::ImageIo;
use crate::device::Device;
use crate::error::{QuellError, QuellResult};
use crate::task::DenoiseTask;

/// Denoising configuration.
///
/// `samples_override = 0` means "use per-layer file metadata", and
/// `radius = 0` disables the intensity pre-blur.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DenoiseParams {
    /// Temporal half-window: frames within this distance of the center
    /// frame are supplied as filtering context.
    pub neighbor_frames: usize,
    /// Filter radius; the intensity pre-blur uses five times this value.
    pub radius: usize,
    /// Clamp every input feature to ±1e8 before filtering.
    pub clamp_input: bool,
    /// Tile width and height.
    pub tile_size: (usize, usize),
    /// Per-layer sample count override; 0 defers to file metadata.
    pub samples_override: u32,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            neighbor_frames: 2,
            radius: 8,
            clamp_input: true,
            tile_size: (64, 64),
            samples_override: 0,
        }
    }
}

impl DenoiseParams {
    pub fn validate(&self) -> QuellResult<()> {
        if self.tile_size.0 == 0 || self.tile_size.1 == 0 {
            return Err(QuellError::validation("tile_size must be positive"));
        }
        Ok(())
    }

    /// Load parameters from a JSON file; absent fields keep their
    /// defaults.
    pub fn from_path(path: impl AsRef<Path>) -> QuellResult<Self> {
        use anyhow::Context as _;

        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read params file '{}'", path.display()))?;
        let params: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse params file '{}'", path.display()))?;
        params.validate()?;
        Ok(params)
    }
}

/// Drives denoising across a sequence of frames, one task per output
/// frame.
#[derive(Debug)]
pub struct Denoiser {
    pub params: DenoiseParams,
    /// One input path per frame.
    pub input: Vec<PathBuf>,
    /// One output path per frame; an empty path skips that frame.
    pub output: Vec<PathBuf>,
}

impl Denoiser {
    pub fn new(
        params: DenoiseParams,
        input: Vec<PathBuf>,
        output: Vec<PathBuf>,
    ) -> QuellResult<Self> {
        params.validate()?;
        if input.len() != output.len() {
            return Err(QuellError::validation(format!(
                "got {} input frames but {} output frames",
                input.len(),
                output.len()
            )));
        }
        Ok(Self {
            params,
            input,
            output,
        })
    }

    /// Denoise every frame with a non-empty output path, in order. The
    /// first failing frame aborts the run; outputs already written stay
    /// on disk.
    #[tracing::instrument(level = "debug", skip_all, fields(frames = self.output.len()))]
    pub fn run(&self, device: &dyn Device, io: &dyn ImageIo) -> QuellResult<()> {
        let num_frames = self.output.len();

        for frame in 0..num_frames {
            if self.output[frame].as_os_str().is_empty() {
                continue;
            }

            let neighbor_frames =
                temporal_window(frame, num_frames, self.params.neighbor_frames);

            let mut task = DenoiseTask::load(
                device,
                io,
                &self.params,
                &self.input,
                frame,
                neighbor_frames.into_vec(),
                num_frames,
            )?;
            task.exec()?;
            task.save(&self.output[frame])?;
        }

        Ok(())
    }
}

/// Frames within `radius` of `frame`, clipped to the sequence, center
/// excluded.
fn temporal_window(frame: usize, num_frames: usize, radius: usize) -> SmallVec<[usize; 8]> {
    let lo = frame.saturating_sub(radius);
    let hi = (frame + radius).min(num_frames.saturating_sub(1));
    (lo..=hi).filter(|&f| f != frame).collect()
}
