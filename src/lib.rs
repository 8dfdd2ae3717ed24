#![forbid(unsafe_code)]

mod channels;
mod container;
mod denoiser;
mod device;
mod error;
mod image;
mod layers;
mod preprocess;
mod task;
mod tiles;

pub use channels::{
    ChannelMapping, INPUT_ALBEDO, INPUT_DEPTH, INPUT_INTENSITY, INPUT_NOISY_IMAGE, INPUT_NORMAL,
    INPUT_NUM_CHANNELS, INPUT_SHADOWING, INPUT_VARIANCE, OUTPUT_NUM_CHANNELS, input_channels,
    output_channels,
};
pub use container::{
    ImageIo, ImageReader, ImageSpec, ImageWriter, MemoryImageIo, StoredImage, extension_of,
    unique_temp_suffix,
};
pub use denoiser::{DenoiseParams, Denoiser};
pub use device::{
    CpuDevice, Device, DeviceBuffer, DeviceTask, DeviceTaskParams, FilterKernel,
    PassthroughKernel, TileCallbacks,
};
pub use error::{QuellError, QuellResult};
pub use image::{DENOISE_MAX_FRAMES, DenoiseImage, TEMP_PREFIX};
pub use layers::{DenoiseLayer, parse_channels};
pub use preprocess::{CLAMP_LIMIT, blur_intensity, clamp_frame};
pub use task::DenoiseTask;
pub use tiles::{CENTER_SLOT, NEIGHBORHOOD_SLOTS, OUTPUT_SLOT, RenderTile, TileNeighborhood};
