//! Interface to the multi-channel image container.
//!
//! The pipeline never touches a codec directly; it consumes the small
//! operation set below. Production deployments plug an EXR-style codec in
//! behind [`ImageIo`]; the bundled [`MemoryImageIo`] keeps whole images in
//! a shared map and is what the test suite runs against.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{QuellError, QuellResult};

/// Dimensions, channel names, and metadata of one image file.
///
/// `views` renders the container's `multiView` string-array attribute;
/// `attributes` carries arbitrary string attributes such as
/// `cycles.<layer>.samples`. The spec is snapshotted on load and cloned
/// for write-back so output files keep the input's structure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageSpec {
    pub width: usize,
    pub height: usize,
    pub channels: Vec<String>,
    pub views: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ImageSpec {
    pub fn new(width: usize, height: usize, channels: Vec<String>) -> Self {
        Self {
            width,
            height,
            channels,
            views: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_pixel_floats(&self) -> usize {
        self.width * self.height * self.channels.len()
    }

    /// Multi-view mode requires at least two advertised views.
    pub fn is_multi_view(&self) -> bool {
        self.views.len() >= 2
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }
}

/// An open image, readable as one flat f32 buffer of all channels.
pub trait ImageReader: Send {
    fn spec(&self) -> &ImageSpec;

    /// Read every channel, interleaved, into `dst` (length
    /// `width * height * num_channels`). Readers stay open and may be
    /// read repeatedly.
    fn read_pixels(&mut self, dst: &mut [f32]) -> QuellResult<()>;
}

/// A created output image; the file only materializes once `write_pixels`
/// and `close` have both succeeded.
pub trait ImageWriter: Send {
    fn write_pixels(&mut self, pixels: &[f32]) -> QuellResult<()>;
    fn close(&mut self) -> QuellResult<()>;
}

/// The container operations the pipeline consumes.
pub trait ImageIo: Send + Sync {
    fn is_regular_file(&self, path: &Path) -> bool;
    fn open(&self, path: &Path) -> QuellResult<Box<dyn ImageReader>>;
    fn create(&self, path: &Path, spec: &ImageSpec) -> QuellResult<Box<dyn ImageWriter>>;
    fn rename(&self, from: &Path, to: &Path) -> QuellResult<()>;
    fn remove(&self, path: &Path) -> QuellResult<()>;
}

/// Extension of `path` including the leading dot, or `""`.
pub fn extension_of(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique suffix for sibling temp files.
pub fn unique_temp_suffix() -> String {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", std::process::id(), n)
}

#[derive(Clone, Debug)]
pub struct StoredImage {
    pub spec: ImageSpec,
    pub pixels: Vec<f32>,
}

/// In-memory container: a thread-safe path → image map.
///
/// Created files exist (empty) as soon as `create` returns, so the
/// remove-on-failure path of in-place saving is observable. `open_log`
/// records every successful `open` for assertions on which frames were
/// actually touched.
#[derive(Clone, Default)]
pub struct MemoryImageIo {
    files: Arc<Mutex<HashMap<PathBuf, StoredImage>>>,
    open_log: Arc<Mutex<Vec<PathBuf>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryImageIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, spec: ImageSpec, pixels: Vec<f32>) {
        debug_assert_eq!(pixels.len(), spec.num_pixel_floats());
        self.lock_files()
            .insert(path.into(), StoredImage { spec, pixels });
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<StoredImage> {
        self.lock_files().get(path.as_ref()).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock_files().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn open_log(&self) -> Vec<PathBuf> {
        self.open_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every subsequent `write_pixels` fail, for exercising the
    /// save-failure cleanup path.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, StoredImage>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageIo for MemoryImageIo {
    fn is_regular_file(&self, path: &Path) -> bool {
        self.lock_files().contains_key(path)
    }

    fn open(&self, path: &Path) -> QuellResult<Box<dyn ImageReader>> {
        let stored = self
            .lock_files()
            .get(path)
            .cloned()
            .ok_or_else(|| QuellError::open(path.display().to_string()))?;
        self.open_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());
        Ok(Box::new(MemoryReader {
            path: path.to_path_buf(),
            stored,
        }))
    }

    fn create(&self, path: &Path, spec: &ImageSpec) -> QuellResult<Box<dyn ImageWriter>> {
        self.lock_files().insert(
            path.to_path_buf(),
            StoredImage {
                spec: spec.clone(),
                pixels: Vec::new(),
            },
        );
        Ok(Box::new(MemoryWriter {
            io: self.clone(),
            path: path.to_path_buf(),
            spec: spec.clone(),
            pixels: None,
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> QuellResult<()> {
        let mut files = self.lock_files();
        let stored = files
            .remove(from)
            .ok_or_else(|| QuellError::rename(format!("{} does not exist", from.display())))?;
        files.insert(to.to_path_buf(), stored);
        Ok(())
    }

    fn remove(&self, path: &Path) -> QuellResult<()> {
        self.lock_files()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| QuellError::rename(format!("{} does not exist", path.display())))
    }
}

struct MemoryReader {
    path: PathBuf,
    stored: StoredImage,
}

impl ImageReader for MemoryReader {
    fn spec(&self) -> &ImageSpec {
        &self.stored.spec
    }

    fn read_pixels(&mut self, dst: &mut [f32]) -> QuellResult<()> {
        if dst.len() != self.stored.pixels.len() {
            return Err(QuellError::read(format!(
                "{}: expected {} floats, destination holds {}",
                self.path.display(),
                self.stored.pixels.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&self.stored.pixels);
        Ok(())
    }
}

struct MemoryWriter {
    io: MemoryImageIo,
    path: PathBuf,
    spec: ImageSpec,
    pixels: Option<Vec<f32>>,
}

impl ImageWriter for MemoryWriter {
    fn write_pixels(&mut self, pixels: &[f32]) -> QuellResult<()> {
        if self.io.fail_writes.load(Ordering::Relaxed) {
            return Err(QuellError::write(format!(
                "{}: injected write failure",
                self.path.display()
            )));
        }
        if pixels.len() != self.spec.num_pixel_floats() {
            return Err(QuellError::write(format!(
                "{}: expected {} floats, got {}",
                self.path.display(),
                self.spec.num_pixel_floats(),
                pixels.len()
            )));
        }
        self.pixels = Some(pixels.to_vec());
        Ok(())
    }

    fn close(&mut self) -> QuellResult<()> {
        let pixels = self.pixels.take().ok_or_else(|| {
            QuellError::write(format!("{}: closed before any pixels", self.path.display()))
        })?;
        self.io.insert(&self.path, self.spec.clone(), pixels);
        Ok(())
    }
}
