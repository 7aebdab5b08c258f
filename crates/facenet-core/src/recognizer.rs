//! FaceNet embedding extraction via ONNX Runtime.
//!
//! Each accepted face is cropped from the normalized image, resized to the
//! model input size and pre-whitened before inference. The model is loaded
//! lazily on first use behind a mutex, so one embedder can be shared by
//! concurrent detection calls.

use crate::area::RelativeArea;
use crate::face::{Face, Faces};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const FACENET_CHANNELS: usize = 3;
const ORT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image to tensor: width and height must be > 0, got {width}x{height}")]
    ImageToTensorSize { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding inference boundary: one face thumbnail in, embedding rows out.
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, thumb: &RgbImage) -> Result<Vec<Vec<f32>>, RecognizerError>;

    /// Load the underlying model ahead of the first call.
    fn load(&self) -> Result<(), RecognizerError> {
        Ok(())
    }
}

/// FaceNet model executed with ONNX Runtime.
pub struct OnnxEmbedder {
    model_path: PathBuf,
    input_size: u32,
    session: Mutex<Option<Session>>,
}

impl OnnxEmbedder {
    /// The model is not touched until [`load`](EmbeddingService::load) or the
    /// first embedding call.
    pub fn new(model_path: impl Into<PathBuf>, input_size: u32) -> Self {
        Self {
            model_path: model_path.into(),
            input_size,
            session: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn open(model_path: &Path) -> Result<Session, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(ORT_INTRA_THREADS)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(session)
    }
}

impl EmbeddingService for OnnxEmbedder {
    fn embed(&self, thumb: &RgbImage) -> Result<Vec<Vec<f32>>, RecognizerError> {
        let input = preprocess(thumb, self.input_size)?;

        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(Self::open(&self.model_path)?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| RecognizerError::InferenceFailed("model not loaded".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("no output".into()));
        }
        // Batch of one: the whole output is a single embedding row.
        Ok(vec![raw.to_vec()])
    }

    fn load(&self) -> Result<(), RecognizerError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(Self::open(&self.model_path)?);
        }
        Ok(())
    }
}

/// Resize a thumbnail to `size × size` and convert it to a pre-whitened NHWC
/// tensor of raw 0–255 channel values.
pub fn preprocess(thumb: &RgbImage, size: u32) -> Result<Array4<f32>, RecognizerError> {
    if size == 0 || thumb.width() == 0 || thumb.height() == 0 {
        return Err(RecognizerError::ImageToTensorSize {
            width: thumb.width(),
            height: thumb.height(),
        });
    }

    let resized;
    let img = if thumb.dimensions() == (size, size) {
        thumb
    } else {
        resized = image::imageops::resize(thumb, size, size, FilterType::Triangle);
        &resized
    };

    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, s, s, FACENET_CHANNELS));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..FACENET_CHANNELS {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32;
        }
    }

    prewhiten(&mut tensor);
    Ok(tensor)
}

/// `(x - mean) / max(std, 1/sqrt(n))` with the sample standard deviation.
fn prewhiten(tensor: &mut Array4<f32>) {
    let n = tensor.len();
    if n == 0 {
        return;
    }

    let mean = tensor.iter().map(|v| *v as f64).sum::<f64>() / n as f64;
    let var = tensor
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n.saturating_sub(1).max(1) as f64;
    let std = var.sqrt().max(1.0 / (n as f64).sqrt());

    tensor.mapv_inplace(|v| ((v as f64 - mean) / std) as f32);
}

/// Crop `area` out of `img` and resize it to a `size × size` RGB thumbnail.
pub fn thumb(img: &DynamicImage, area: &RelativeArea, size: u32) -> Result<RgbImage, RecognizerError> {
    let b = area.bounds(img.width(), img.height());
    if b.width == 0 || b.height == 0 || size == 0 {
        return Err(RecognizerError::ImageToTensorSize {
            width: b.width,
            height: b.height,
        });
    }

    Ok(img
        .crop_imm(b.x, b.y, b.width, b.height)
        .resize_exact(size, size, FilterType::Lanczos3)
        .to_rgb8())
}

/// Scale `img` so that its longer side equals `max_size`. Non-square images
/// already within bounds are kept. Squares are always resized to exactly
/// `max_size`, so squares larger than `max_size` are downscaled and smaller
/// ones are upscaled.
pub fn normalize_image(img: &DynamicImage, max_size: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let max = max_size as u64;
    let (nw, nh) = match w.cmp(&h) {
        std::cmp::Ordering::Greater if w > max_size => (max_size, (max * h as u64 / w as u64) as u32),
        std::cmp::Ordering::Less if h > max_size => ((max * w as u64 / h as u64) as u32, max_size),
        std::cmp::Ordering::Equal if w != max_size => (max_size, max_size),
        _ => return img.clone(),
    };

    tracing::trace!(from_w = w, from_h = h, to_w = nw, to_h = nh, "normalizing image");
    img.resize_exact(nw.max(1), nh.max(1), FilterType::Lanczos3)
}

/// Attaches embeddings to detected faces.
pub struct FaceRecognizer {
    service: Box<dyn EmbeddingService>,
    crop_size: u32,
}

impl FaceRecognizer {
    pub fn new(service: Box<dyn EmbeddingService>, crop_size: u32) -> Self {
        Self { service, crop_size }
    }

    /// Recognizer backed by an ONNX FaceNet model at `model_path`.
    pub fn onnx(model_path: impl Into<PathBuf>, crop_size: u32) -> Self {
        Self::new(Box::new(OnnxEmbedder::new(model_path, crop_size)), crop_size)
    }

    pub fn crop_size(&self) -> u32 {
        self.crop_size
    }

    pub fn load(&self) -> Result<(), RecognizerError> {
        self.service.load()
    }

    /// Embedding rows for one face of the normalized image `img`.
    pub fn embed_face(&self, img: &DynamicImage, face: &Face) -> Result<Vec<Vec<f32>>, RecognizerError> {
        let thumb = thumb(img, &face.crop_area(), self.crop_size)?;
        let rows = self.service.embed(&thumb)?;
        if rows.is_empty() {
            return Err(RecognizerError::InferenceFailed("no output".into()));
        }
        Ok(rows)
    }

    /// Embed every face in place. Faces that fail keep no embedding. Returns
    /// the number of faces embedded.
    pub fn embed_faces(&self, img: &DynamicImage, faces: &mut Faces) -> usize {
        let mut embedded = 0;
        for face in faces.iter_mut() {
            if face.area.is_degenerate() {
                continue;
            }
            match self.embed_face(img, face) {
                Ok(rows) => {
                    face.set_embeddings(rows);
                    embedded += 1;
                }
                Err(e) => tracing::warn!(
                    row = face.area.row,
                    col = face.area.col,
                    error = %e,
                    "face embedding failed"
                ),
            }
        }
        embedded
    }
}
