//! Per-frame denoising task: input assembly, the tile queue, and the
//! neighborhood mapping callbacks driven by the device.

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::channels::{INPUT_NOISY_IMAGE, INPUT_NUM_CHANNELS, OUTPUT_NUM_CHANNELS};
use crate::container::ImageIo;
use crate::denoiser::DenoiseParams;
use crate::device::{Device, DeviceBuffer, DeviceTask, DeviceTaskParams, TileCallbacks};
use crate::error::{QuellError, QuellResult};
use crate::image::DenoiseImage;
use crate::layers::DenoiseLayer;
use crate::preprocess::{blur_intensity, clamp_frame};
use crate::tiles::{CENTER_SLOT, OUTPUT_SLOT, RenderTile, TileNeighborhood, build_tile_grid};

/// One frame's denoising unit: owns the image, the device input buffer,
/// and (per layer) the tile scheduler the device pulls work through.
pub struct DenoiseTask<'a> {
    device: &'a dyn Device,
    io: &'a dyn ImageIo,
    params: &'a DenoiseParams,
    frame: usize,
    num_frames: usize,
    neighbor_frames: Vec<usize>,
    image: DenoiseImage,
    input_pixels: DeviceBuffer,
    staging: Vec<f32>,
}

impl<'a> DenoiseTask<'a> {
    /// Load the center frame and its temporal neighbors, allocate the
    /// device input buffer, and upload the first layer's pixels.
    #[tracing::instrument(level = "debug", skip_all, fields(frame = frame))]
    pub fn load(
        device: &'a dyn Device,
        io: &'a dyn ImageIo,
        params: &'a DenoiseParams,
        input_paths: &[PathBuf],
        frame: usize,
        neighbor_frames: Vec<usize>,
        num_frames: usize,
    ) -> QuellResult<Self> {
        let mut image = DenoiseImage::load(io, &input_paths[frame], params.samples_override)?;
        image.load_neighbors(io, input_paths, &neighbor_frames)?;

        let frames = image.num_neighbors() + 1;
        let frame_stride = image.width * image.height * INPUT_NUM_CHANNELS;
        let input_pixels = DeviceBuffer::alloc(frame_stride * frames);

        let mut task = Self {
            device,
            io,
            params,
            frame,
            num_frames,
            neighbor_frames,
            image,
            input_pixels,
            staging: Vec::new(),
        };
        task.load_input_pixels(0)?;
        Ok(task)
    }

    /// Denoise every surviving layer, one device task per layer.
    #[tracing::instrument(level = "debug", skip_all, fields(frame = self.frame))]
    pub fn exec(&mut self) -> QuellResult<()> {
        for layer_index in 0..self.image.layers.len() {
            // Layer 0's pixels were uploaded by `load`.
            if layer_index > 0 {
                self.load_input_pixels(layer_index)?;
            }

            let scheduler = Arc::new(TileScheduler::new(
                &self.image,
                self.image.layers[layer_index].clone(),
                self.params.tile_size,
                &self.input_pixels,
                self.frame,
                self.num_frames,
            ));

            self.device.task_add(DeviceTask {
                params: self.device_task_params(),
                callbacks: scheduler.clone(),
            })?;
            self.device.task_wait()?;
            println!();

            debug_assert!(scheduler.outputs_empty(), "unmapped tile outputs remain");
        }
        Ok(())
    }

    /// Flush the denoised image to its output path.
    #[tracing::instrument(level = "debug", skip_all, fields(frame = self.frame))]
    pub fn save(&mut self, out_path: &Path) -> QuellResult<()> {
        self.image.save_output(self.io, out_path)
    }

    /// Fill the device input buffer for one layer: center frame followed
    /// by one slab per neighbor, each preprocessed in place.
    fn load_input_pixels(&mut self, layer_index: usize) -> QuellResult<()> {
        let layer = self.image.layers[layer_index].clone();
        let (width, height) = (self.image.width, self.image.height);
        let frame_stride = width * height * INPUT_NUM_CHANNELS;
        let num_frames = self.image.num_neighbors() + 1;

        self.staging.resize(frame_stride * num_frames, 0.0);
        let (center_slab, neighbor_slabs) = self.staging.split_at_mut(frame_stride);
        self.image.read_pixels(&layer, center_slab);
        for neighbor in 0..self.image.num_neighbors() {
            let slab = &mut neighbor_slabs[neighbor * frame_stride..(neighbor + 1) * frame_stride];
            self.image.read_neighbor_pixels(neighbor, &layer, slab)?;
        }

        for slab in self.staging.chunks_exact_mut(frame_stride) {
            if self.params.clamp_input {
                clamp_frame(slab);
            }
            blur_intensity(slab, width, height, 5 * self.params.radius);
        }

        self.input_pixels.copy_to_device(&self.staging);
        Ok(())
    }

    fn device_task_params(&self) -> DeviceTaskParams {
        DeviceTaskParams {
            pass_stride: INPUT_NUM_CHANNELS,
            target_pass_stride: OUTPUT_NUM_CHANNELS,
            pass_denoising_data: 0,
            pass_denoising_clean: -1,
            frame_stride: self.image.width * self.image.height * INPUT_NUM_CHANNELS,
            denoising_frames: self
                .neighbor_frames
                .iter()
                .map(|&f| f as i32 - self.frame as i32)
                .collect(),
            do_filter: true,
            write_passes: false,
            from_render: false,
        }
    }
}

/// The per-layer callback object registered with the device. Workers hit
/// these methods concurrently; the tile deque and the output-buffer map
/// each sit behind their own short-lived mutex.
pub(crate) struct TileScheduler {
    frame: usize,
    num_frames: usize,
    width: usize,
    height: usize,
    num_channels: usize,
    tile_w: usize,
    tile_h: usize,
    layer: DenoiseLayer,
    pixels: Arc<Mutex<Vec<f32>>>,
    tiles: Mutex<VecDeque<RenderTile>>,
    num_tiles: usize,
    outputs: Mutex<HashMap<usize, DeviceBuffer>>,
}

impl TileScheduler {
    pub(crate) fn new(
        image: &DenoiseImage,
        layer: DenoiseLayer,
        tile_size: (usize, usize),
        input: &DeviceBuffer,
        frame: usize,
        num_frames: usize,
    ) -> Self {
        let (tile_w, tile_h) = tile_size;
        let tiles = build_tile_grid(image.width, image.height, tile_w, tile_h, layer.samples, input);
        let num_tiles = tiles.len();

        Self {
            frame,
            num_frames,
            width: image.width,
            height: image.height,
            num_channels: image.num_channels,
            tile_w,
            tile_h,
            layer,
            pixels: image.pixels.clone(),
            tiles: Mutex::new(tiles),
            num_tiles,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn outputs_empty(&self) -> bool {
        self.lock_outputs().is_empty()
    }

    fn lock_pixels(&self) -> std::sync::MutexGuard<'_, Vec<f32>> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outputs(&self) -> std::sync::MutexGuard<'_, HashMap<usize, DeviceBuffer>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TileCallbacks for TileScheduler {
    fn acquire_tile(&self, device: &dyn Device) -> Option<RenderTile> {
        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tile = tiles.pop_front()?;
        print_progress(
            self.num_tiles - tiles.len(),
            self.num_tiles,
            self.frame,
            self.num_frames,
        );
        drop(tiles);

        device.map_tile(&mut tile);
        Some(tile)
    }

    /// Surrounding tiles share the frame-wide input buffer, so only
    /// their geometry needs synthesizing. The denoised result goes to a
    /// separate per-tile buffer to avoid rewriting a horizontal slice of
    /// the image, seeded with the noisy pass for pixels the kernel skips.
    fn map_neighboring_tiles(&self, neighborhood: &mut TileNeighborhood) -> QuellResult<()> {
        let center = neighborhood.tiles[CENTER_SLOT].clone();

        for i in 0..9 {
            if i == CENTER_SLOT {
                continue;
            }
            let dx = (i % 3) as i64 - 1;
            let dy = (i / 3) as i64 - 1;
            let (x, w) = clip_axis(center.x, dx, self.tile_w, self.width);
            let (y, h) = clip_axis(center.y, dy, self.tile_h, self.height);
            neighborhood.tiles[i] = RenderTile {
                x,
                y,
                w,
                h,
                offset: center.offset,
                stride: self.width,
                buffer: center.buffer.clone(),
                ..RenderTile::default()
            };
        }

        let output = DeviceBuffer::alloc(OUTPUT_NUM_CHANNELS * center.w * center.h);
        let mut seed = vec![0.0f32; OUTPUT_NUM_CHANNELS * center.w * center.h];
        {
            let pixels = self.lock_pixels();
            let table = &self.layer.input_to_image_channel;
            for y in 0..center.h {
                let row = (center.y + y) * self.width + center.x;
                for x in 0..center.w {
                    for k in 0..OUTPUT_NUM_CHANNELS {
                        seed[(y * center.w + x) * OUTPUT_NUM_CHANNELS + k] =
                            pixels[(row + x) * self.num_channels + table[INPUT_NOISY_IMAGE + k]];
                    }
                }
            }
        }
        output.copy_to_device(&seed);

        let mut out_tile = center.clone();
        out_tile.buffer = Some(output.clone());
        out_tile.stride = out_tile.w;
        out_tile.offset -= (out_tile.x + out_tile.y * out_tile.stride) as isize;
        neighborhood.tiles[OUTPUT_SLOT] = out_tile;

        let previous = self.lock_outputs().insert(center.tile_index, output);
        debug_assert!(previous.is_none(), "tile output buffer mapped twice");
        Ok(())
    }

    fn unmap_neighboring_tiles(&self, neighborhood: &mut TileNeighborhood) -> QuellResult<()> {
        let out_tile = neighborhood.tiles[OUTPUT_SLOT].clone();
        let tile_index = neighborhood.tiles[CENTER_SLOT].tile_index;

        let output = self.lock_outputs().remove(&tile_index).ok_or_else(|| {
            QuellError::validation(format!("no mapped output buffer for tile {tile_index}"))
        })?;

        // The device copy happens outside both locks.
        let result = output.copy_from_device();

        let table = &self.layer.output_to_image_channel;
        let mut pixels = self.lock_pixels();
        for y in 0..out_tile.h {
            let row = (out_tile.y + y) * self.width + out_tile.x;
            for x in 0..out_tile.w {
                for (k, &image_channel) in table.iter().enumerate() {
                    pixels[(row + x) * self.num_channels + image_channel] =
                        result[(y * out_tile.w + x) * OUTPUT_NUM_CHANNELS + k];
                }
            }
        }
        Ok(())
    }

    fn release_tile(&self) {}

    fn cancelled(&self) -> bool {
        false
    }
}

/// Clip one axis of a neighbor tile against the image bounds. `delta` is
/// the grid step (-1, 0, 1) relative to the center tile's origin.
fn clip_axis(center: usize, delta: i64, tile: usize, limit: usize) -> (usize, usize) {
    let lo = (center as i64 + delta * tile as i64).clamp(0, limit as i64) as usize;
    let hi = (center as i64 + (delta + 1) * tile as i64).clamp(0, limit as i64) as usize;
    (lo, hi - lo)
}

fn print_progress(num: usize, total: usize, frame: usize, num_frames: usize) {
    const BAR_WIDTH: usize = 40;
    let filled = if total == 0 {
        BAR_WIDTH
    } else {
        num * BAR_WIDTH / total
    };

    let mut bar = String::with_capacity(BAR_WIDTH);
    for _ in 0..filled {
        bar.push('=');
    }
    if filled < BAR_WIDTH {
        bar.push('>');
        for _ in filled + 1..BAR_WIDTH {
            bar.push(' ');
        }
    }

    let mut out = std::io::stdout().lock();
    let _ = if num_frames > 1 {
        write!(out, "\rDenoise Frame {frame} [{bar}] {num} / {total}")
    } else {
        write!(out, "\rDenoise Frame [{bar}] {num} / {total}")
    };
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{input_channels, output_channels};
    use crate::container::{ImageSpec, MemoryImageIo};

    struct NullDevice;

    impl Device for NullDevice {
        fn task_add(&self, _task: DeviceTask) -> QuellResult<()> {
            Ok(())
        }

        fn task_wait(&self) -> QuellResult<()> {
            Ok(())
        }
    }

    fn full_channel_names(layer: &str) -> Vec<String> {
        input_channels()
            .into_iter()
            .chain(output_channels())
            .map(|m| format!("{layer}.{}", m.name))
            .collect()
    }

    fn image_on(io: &MemoryImageIo, width: usize, height: usize) -> DenoiseImage {
        let mut spec = ImageSpec::new(width, height, full_channel_names("L"));
        spec.set_attribute("cycles.L.samples", "16");
        let pixels: Vec<f32> = (0..spec.num_pixel_floats()).map(|i| i as f32).collect();
        io.insert("center.exr", spec, pixels);
        DenoiseImage::load(io, Path::new("center.exr"), 0).unwrap()
    }

    fn scheduler_for(image: &DenoiseImage, tile: usize) -> TileScheduler {
        let input = DeviceBuffer::alloc(
            image.width * image.height * INPUT_NUM_CHANNELS,
        );
        TileScheduler::new(image, image.layers[0].clone(), (tile, tile), &input, 0, 1)
    }

    #[test]
    fn clip_axis_handles_interior_edge_and_off_image() {
        // Interior column of a 3-wide grid. The east window is one tile
        // step, even where the actual edge tile extends further.
        assert_eq!(clip_axis(64, -1, 64, 200), (0, 64));
        assert_eq!(clip_axis(64, 0, 64, 200), (64, 64));
        assert_eq!(clip_axis(64, 1, 64, 200), (128, 64));
        // Top-left corner: the west neighbor collapses to empty.
        assert_eq!(clip_axis(0, -1, 64, 200), (0, 0));
        // Right edge: the east neighbor is fully off-image.
        assert_eq!(clip_axis(192, 1, 64, 200), (200, 0));
    }

    #[test]
    fn acquire_drains_tiles_then_returns_none() {
        let io = MemoryImageIo::new();
        let image = image_on(&io, 10, 10);
        let scheduler = scheduler_for(&image, 4);

        let mut seen = Vec::new();
        while let Some(tile) = scheduler.acquire_tile(&NullDevice) {
            seen.push(tile.tile_index);
        }
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
        assert!(scheduler.acquire_tile(&NullDevice).is_none());
    }

    #[test]
    fn corner_tile_gets_clipped_neighbors_sharing_the_input_buffer() {
        let io = MemoryImageIo::new();
        let image = image_on(&io, 10, 10);
        let scheduler = scheduler_for(&image, 4);

        let center = scheduler.acquire_tile(&NullDevice).unwrap();
        let mut neighborhood = TileNeighborhood::new(center);
        scheduler.map_neighboring_tiles(&mut neighborhood).unwrap();

        // Top-left center: the row above and the column left are empty.
        for i in [0, 1, 2, 3, 6] {
            assert!(neighborhood.tiles[i].is_empty());
        }
        let east = &neighborhood.tiles[5];
        assert_eq!((east.x, east.y, east.w, east.h), (4, 0, 4, 4));
        let south_east = &neighborhood.tiles[8];
        assert_eq!(
            (south_east.x, south_east.y, south_east.w, south_east.h),
            (4, 4, 4, 4)
        );
        assert_eq!(east.stride, 10);

        scheduler.unmap_neighboring_tiles(&mut neighborhood).unwrap();
    }

    #[test]
    fn output_tile_is_rebased_to_its_own_buffer() {
        let io = MemoryImageIo::new();
        let image = image_on(&io, 10, 10);
        let scheduler = scheduler_for(&image, 4);

        // Skip to tile 4: the interior tile at (4, 4).
        for _ in 0..4 {
            scheduler.acquire_tile(&NullDevice).unwrap();
        }
        let center = scheduler.acquire_tile(&NullDevice).unwrap();
        assert_eq!((center.x, center.y), (4, 4));

        let mut neighborhood = TileNeighborhood::new(center);
        scheduler.map_neighboring_tiles(&mut neighborhood).unwrap();

        let out = neighborhood.output();
        assert_eq!(out.stride, out.w);
        // Pixel (x, y) of the output rect maps to index 0 of its buffer.
        assert_eq!(out.offset + (out.y * out.stride + out.x) as isize, 0);
        let buffer = out.buffer.as_ref().unwrap();
        assert_eq!(buffer.len(), OUTPUT_NUM_CHANNELS * out.w * out.h);

        scheduler.unmap_neighboring_tiles(&mut neighborhood).unwrap();
        assert!(scheduler.outputs_empty());
    }

    #[test]
    fn map_seeds_the_output_with_the_noisy_pass_and_unmap_scatters_back() {
        let io = MemoryImageIo::new();
        let image = image_on(&io, 6, 4);
        let scheduler = scheduler_for(&image, 64);

        let center = scheduler.acquire_tile(&NullDevice).unwrap();
        let mut neighborhood = TileNeighborhood::new(center);
        scheduler.map_neighboring_tiles(&mut neighborhood).unwrap();

        // The seed equals the noisy channels of the center rectangle.
        let layer = &image.layers[0];
        let seed = neighborhood.output().buffer.as_ref().unwrap().copy_from_device();
        {
            let pixels = image.lock_pixels();
            for i in 0..6 * 4 {
                for k in 0..OUTPUT_NUM_CHANNELS {
                    let channel = layer.input_to_image_channel[INPUT_NOISY_IMAGE + k];
                    assert_eq!(
                        seed[i * OUTPUT_NUM_CHANNELS + k],
                        pixels[i * image.num_channels + channel]
                    );
                }
            }
        }

        neighborhood.output().buffer.as_ref().unwrap().copy_to_device(&vec![
            -3.0;
            OUTPUT_NUM_CHANNELS * 6 * 4
        ]);
        scheduler.unmap_neighboring_tiles(&mut neighborhood).unwrap();

        let pixels = image.lock_pixels();
        for i in 0..6 * 4 {
            for c in 0..image.num_channels {
                let expected = if layer.output_to_image_channel.contains(&c) {
                    -3.0
                } else {
                    (i * image.num_channels + c) as f32
                };
                assert_eq!(pixels[i * image.num_channels + c], expected);
            }
        }
    }

    #[test]
    fn unmapping_an_unmapped_tile_is_an_error() {
        let io = MemoryImageIo::new();
        let image = image_on(&io, 6, 4);
        let scheduler = scheduler_for(&image, 64);

        let center = scheduler.acquire_tile(&NullDevice).unwrap();
        let mut neighborhood = TileNeighborhood::new(center);
        assert!(scheduler.unmap_neighboring_tiles(&mut neighborhood).is_err());
    }
}
