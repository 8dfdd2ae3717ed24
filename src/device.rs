//! The compute-device protocol and a threaded CPU reference device.
//!
//! A device executes denoising work against tiles it pulls through the
//! callback set on [`DeviceTask`]. For every mapped neighborhood there is
//! exactly one unmap, issued after all kernel reads of the tile complete
//! and before `task_wait` returns. The filter math itself stays behind
//! [`FilterKernel`]; this crate only orchestrates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{QuellError, QuellResult};
use crate::tiles::{RenderTile, TileNeighborhood};

/// Shared float storage standing in for unified device memory.
#[derive(Clone, Debug)]
pub struct DeviceBuffer {
    data: Arc<RwLock<Vec<f32>>>,
}

impl DeviceBuffer {
    /// Allocate `len` floats, zeroed.
    pub fn alloc(len: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0.0; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_to_device(&self, host: &[f32]) {
        let mut data = self.write();
        data.clear();
        data.extend_from_slice(host);
    }

    pub fn copy_from_device(&self) -> Vec<f32> {
        self.read().clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed per-task parameters handed to the device alongside the
/// callbacks. Strides and pass offsets are part of the kernel's buffer
/// layout contract.
#[derive(Clone, Debug)]
pub struct DeviceTaskParams {
    pub pass_stride: usize,
    pub target_pass_stride: usize,
    pub pass_denoising_data: i32,
    pub pass_denoising_clean: i32,
    /// Floats per frame slab in the input buffer.
    pub frame_stride: usize,
    /// Neighbor frame offsets relative to the center frame.
    pub denoising_frames: Vec<i32>,
    pub do_filter: bool,
    pub write_passes: bool,
    pub from_render: bool,
}

/// The callback set a task registers with the device. Workers may invoke
/// these concurrently.
pub trait TileCallbacks: Send + Sync {
    /// Pop the next tile, or `None` when the queue is drained.
    fn acquire_tile(&self, device: &dyn Device) -> Option<RenderTile>;

    /// Fill in the surrounding-tile geometry and allocate the tile's
    /// output buffer.
    fn map_neighboring_tiles(&self, tiles: &mut TileNeighborhood) -> QuellResult<()>;

    /// Copy the tile's denoised result back into the image.
    fn unmap_neighboring_tiles(&self, tiles: &mut TileNeighborhood) -> QuellResult<()>;

    /// Called once per acquired tile after unmap.
    fn release_tile(&self);

    fn cancelled(&self) -> bool;
}

/// One unit of work for the device: the callback object plus parameters.
pub struct DeviceTask {
    pub params: DeviceTaskParams,
    pub callbacks: Arc<dyn TileCallbacks>,
}

/// The device abstraction the frame driver talks to.
pub trait Device: Send + Sync {
    fn task_add(&self, task: DeviceTask) -> QuellResult<()>;

    /// Run all queued tasks to completion. The only blocking point the
    /// pipeline exposes.
    fn task_wait(&self) -> QuellResult<()>;

    /// Hook for devices with per-device tile memory; unified-memory
    /// devices need nothing here.
    fn map_tile(&self, _tile: &mut RenderTile) {}
}

/// The denoising math, supplied by the caller.
pub trait FilterKernel: Send + Sync {
    fn filter(&self, params: &DeviceTaskParams, tiles: &TileNeighborhood) -> QuellResult<()>;
}

/// A kernel that keeps the output buffer's seed (the noisy image), i.e.
/// the identity filter. The seeding contract makes this well-defined for
/// every pixel.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughKernel;

impl FilterKernel for PassthroughKernel {
    fn filter(&self, _params: &DeviceTaskParams, _tiles: &TileNeighborhood) -> QuellResult<()> {
        Ok(())
    }
}

/// Reference device draining the tile queue from a pool of worker
/// threads.
pub struct CpuDevice {
    kernel: Arc<dyn FilterKernel>,
    num_threads: usize,
    queue: Mutex<Vec<DeviceTask>>,
}

impl CpuDevice {
    pub fn new(kernel: Arc<dyn FilterKernel>) -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(kernel, num_threads)
    }

    pub fn with_threads(kernel: Arc<dyn FilterKernel>, num_threads: usize) -> Self {
        Self {
            kernel,
            num_threads: num_threads.max(1),
            queue: Mutex::new(Vec::new()),
        }
    }

    fn run_task(&self, task: &DeviceTask) -> QuellResult<()> {
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<QuellError>> = Mutex::new(None);

        rayon::scope(|scope| {
            for _ in 0..self.num_threads {
                scope.spawn(|_| {
                    while !failed.load(Ordering::Relaxed) && !task.callbacks.cancelled() {
                        let Some(tile) = task.callbacks.acquire_tile(self) else {
                            break;
                        };
                        tracing::trace!(tile = tile.tile_index, "worker picked up tile");

                        let mut neighborhood = TileNeighborhood::new(tile);
                        if let Err(e) = task.callbacks.map_neighboring_tiles(&mut neighborhood) {
                            record_error(&failed, &first_error, e);
                            break;
                        }

                        // Unmap must run even if the kernel fails, so the
                        // map/unmap pairing holds.
                        let kernel_result = if task.params.do_filter {
                            self.kernel.filter(&task.params, &neighborhood)
                        } else {
                            Ok(())
                        };
                        let unmap_result =
                            task.callbacks.unmap_neighboring_tiles(&mut neighborhood);
                        task.callbacks.release_tile();

                        if let Err(e) = kernel_result.and(unmap_result) {
                            record_error(&failed, &first_error, e);
                            break;
                        }
                    }
                });
            }
        });

        match first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record_error(failed: &AtomicBool, slot: &Mutex<Option<QuellError>>, error: QuellError) {
    failed.store(true, Ordering::Relaxed);
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    slot.get_or_insert(error);
}

impl Device for CpuDevice {
    fn task_add(&self, task: DeviceTask) -> QuellResult<()> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }

    fn task_wait(&self) -> QuellResult<()> {
        let tasks = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            self.run_task(task)?;
        }
        Ok(())
    }
}
