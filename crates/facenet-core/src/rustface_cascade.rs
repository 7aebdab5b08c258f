//! [`Cascade`] backed by the `rustface` crate (SeetaFace engine).

use crate::detector::{Cascade, CascadeParams, Detection, DetectorError, ImageParams};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Raw SeetaFace scores below this never reach the quality filter.
const SEETA_SCORE_THRESH: f64 = 2.0;

/// SeetaFace frontal face detector.
///
/// Overlapping windows are merged inside rustface, so the IoU threshold of
/// the cascade parameters is not used.
pub struct RustfaceCascade {
    model: rustface::Model,
}

impl RustfaceCascade {
    /// Load a SeetaFace model file (`seeta_fd_frontal_v1.0.bin`).
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let model_err = |source| DetectorError::CascadeModel {
            path: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(model_err)?;
        let model = rustface::read_model(BufReader::new(file)).map_err(model_err)?;
        tracing::info!(path = %path.display(), "loaded SeetaFace cascade");
        Ok(Self { model })
    }
}

impl Cascade for RustfaceCascade {
    fn detect(&self, image: &ImageParams<'_>, params: &CascadeParams) -> Vec<Detection> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        let step = ((params.shift_factor * params.min_size as f32) as u32).max(1);

        detector.set_min_face_size(params.min_size);
        detector.set_max_face_size(params.max_size.max(params.min_size));
        detector.set_score_thresh(SEETA_SCORE_THRESH);
        detector.set_pyramid_scale_factor(1.0 / params.scale_factor);
        detector.set_slide_window_step(step, step);

        let data = rustface::ImageData::new(image.pixels, image.cols as u32, image.rows as u32);
        detector
            .detect(&data)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                let (w, h) = (bbox.width() as i32, bbox.height() as i32);
                Detection {
                    row: bbox.y() + h / 2,
                    col: bbox.x() + w / 2,
                    scale: w.max(h),
                    q: face.score() as f32,
                }
            })
            .collect()
    }
}
