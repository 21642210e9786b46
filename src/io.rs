//! Image decode/encode at the crate boundary: batch sources and sinks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pipeline::ProtectedImage;

/// Something a batch unit can load an RGB image from.
pub trait ImageSource: Sync {
    /// Identifier recorded in metadata, if the source has a natural one.
    fn id(&self) -> Option<String> {
        None
    }

    /// Decode the image.
    ///
    /// # Errors
    ///
    /// Returns an I/O or image error if the source cannot be decoded.
    fn load(&self) -> Result<RgbImage>;
}

impl ImageSource for RgbImage {
    fn load(&self) -> Result<RgbImage> {
        Ok(self.clone())
    }
}

impl ImageSource for DynamicImage {
    fn load(&self) -> Result<RgbImage> {
        Ok(self.to_rgb8())
    }
}

impl ImageSource for PathBuf {
    fn id(&self) -> Option<String> {
        self.file_name().map(|name| name.to_string_lossy().into_owned())
    }

    fn load(&self) -> Result<RgbImage> {
        Ok(image::open(self)?.to_rgb8())
    }
}

/// Receives protected images as batch units complete.
///
/// Called concurrently from worker threads, in no particular order.
pub trait ProtectedSink: Sync {
    /// Store the result for the batch item at `index`.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the result cannot be stored; the
    /// batch records it as a failure of that item.
    fn store(&self, index: usize, protected: &ProtectedImage) -> Result<()>;
}

/// Writes `<name>_protected.png` plus a `<name>_protected.json` metadata
/// sidecar into a directory.
///
/// `<name>` is the source file name with its extension folded in
/// (`cat.jpg` becomes `cat_jpg`), or `image_<index>` for sources without an
/// id. A name already written by this sink is refused rather than
/// overwritten.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    claimed: Mutex<HashSet<String>>,
}

impl DirectorySink {
    /// Use `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            claimed: Mutex::new(HashSet::new()),
        })
    }

    /// The output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn name_for(index: usize, protected: &ProtectedImage) -> String {
        let Some(path) = protected.metadata.image_id.as_deref().map(Path::new) else {
            return format!("image_{index:05}");
        };
        let Some(stem) = path.file_stem() else {
            return format!("image_{index:05}");
        };
        let stem = stem.to_string_lossy();
        match path.extension() {
            Some(ext) => format!("{stem}_{}", ext.to_string_lossy()),
            None => stem.into_owned(),
        }
    }

    fn claim(&self, name: &str) -> Result<()> {
        if self.claimed.lock().insert(name.to_string()) {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("output name {name}_protected already written by this batch"),
            )))
        }
    }
}

impl ProtectedSink for DirectorySink {
    fn store(&self, index: usize, protected: &ProtectedImage) -> Result<()> {
        let stem = Self::name_for(index, protected);
        self.claim(&stem)?;
        save_image(
            &protected.image,
            &self.dir.join(format!("{stem}_protected.png")),
        )?;
        let sidecar = std::fs::File::create(self.dir.join(format!("{stem}_protected.json")))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(sidecar), &protected.metadata)?;
        Ok(())
    }
}

/// Keeps protected images in memory, tagged with their batch index.
#[derive(Debug, Default)]
pub struct MemorySink {
    items: Mutex<Vec<(usize, ProtectedImage)>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Stored images sorted by batch index.
    #[must_use]
    pub fn into_sorted(self) -> Vec<(usize, ProtectedImage)> {
        let mut items = self.items.into_inner();
        items.sort_by_key(|(index, _)| *index);
        items
    }
}

impl ProtectedSink for MemorySink {
    fn store(&self, index: usize, protected: &ProtectedImage) -> Result<()> {
        self.items.lock().push((index, protected.clone()));
        Ok(())
    }
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// All supported image files directly inside `dir`, sorted by path.
///
/// # Errors
///
/// Returns [`Error::Io`] if the directory cannot be read.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_supported_image(p))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Save an RGB image, choosing the encoder from the extension.
///
/// JPEG is written at quality 100; lossy encoding still weakens the
/// watermark, so PNG is preferred for protected output.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            img.save_with_format(path, format)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

/// Generate a default output path from an input path.
///
/// Example: `"photo.jpg"` becomes `"photo_protected.png"`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}_protected.png"))
}
