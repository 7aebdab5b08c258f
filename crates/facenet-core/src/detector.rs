//! Multi-scale face detection on top of a cascade primitive.
//!
//! The cascade itself (pixel evaluation, IoU clustering) sits behind the
//! [`Cascade`] trait. [`FaceExtractor`] drives it across a progression of
//! minimum face sizes, filters detections with a size-adaptive quality
//! threshold, optionally attaches pupils and fine landmarks, and drops
//! detections that overlap a larger face already accepted.

use crate::area::Area;
use crate::config::Config;
use crate::face::{Face, Faces};
use image::GrayImage;
use thiserror::Error;

/// Landmarks are only searched for on faces larger than this.
const LANDMARK_MIN_SCALE: i32 = 50;
/// Pixels kept free at the image border when sizing the cascade window.
const IMAGE_BORDER: u32 = 4;

/// Eye-corner landmark cascades, in priority order.
const EYE_CASCADES: [&str; 5] = ["lp46", "lp44", "lp42", "lp38", "lp312"];
/// Mouth-corner landmark cascades, in priority order.
const MOUTH_CASCADES: [&str; 4] = ["lp93", "lp84", "lp82", "lp81"];
/// Cascade used for the single general-purpose landmark.
const GENERAL_CASCADE: &str = "lp84";

// Pupil search offsets as fractions of the face scale.
const PUPIL_ROW_OFFSET: f32 = -0.075;
const LEFT_PUPIL_COL_OFFSET: f32 = -0.175;
const RIGHT_PUPIL_COL_OFFSET: f32 = 0.185;
const PUPIL_SEARCH_SCALE: f32 = 0.25;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image size {cols}x{rows} is too small")]
    ImageSizeTooSmall { cols: u32, rows: u32 },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("cannot load cascade model {path}: {source}")]
    CascadeModel {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Grayscale pixels handed to the cascade primitives.
#[derive(Debug, Clone, Copy)]
pub struct ImageParams<'a> {
    pub pixels: &'a [u8],
    pub rows: i32,
    pub cols: i32,
    /// Row stride in pixels.
    pub dim: i32,
}

impl<'a> ImageParams<'a> {
    pub fn from_gray(img: &'a GrayImage) -> Self {
        Self {
            pixels: img.as_raw(),
            rows: img.height() as i32,
            cols: img.width() as i32,
            dim: img.width() as i32,
        }
    }
}

/// Search parameters for one cascade pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    pub min_size: u32,
    pub max_size: u32,
    pub shift_factor: f32,
    pub scale_factor: f32,
    /// Detections whose IoU exceeds this are merged by the cascade.
    pub iou_threshold: f32,
}

/// A merged raw detection: center, square size and quality score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub row: i32,
    pub col: i32,
    pub scale: i32,
    pub q: f32,
}

/// Face cascade primitive.
pub trait Cascade: Send + Sync {
    /// Scan `image` and return detections already clustered at
    /// `params.iou_threshold`.
    fn detect(&self, image: &ImageParams<'_>, params: &CascadeParams) -> Vec<Detection>;
}

/// A pupil or landmark location. All-zero means "not found".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Puploc {
    pub row: i32,
    pub col: i32,
    pub scale: f32,
    pub perturbs: u32,
}

impl Puploc {
    pub fn is_degenerate(&self) -> bool {
        self.row <= 0 || self.col <= 0
    }

    fn to_area(self, name: impl Into<String>) -> Area {
        Area::new(name, self.row, self.col, self.scale as i32)
    }
}

/// Pupil and fine-landmark cascade primitive.
pub trait LandmarkCascade: Send + Sync {
    /// Refine a pupil position around `search`.
    fn locate_pupil(&self, search: &Puploc, image: &ImageParams<'_>) -> Puploc;

    /// Candidate points from every sub-cascade of `group`, in priority order.
    fn locate_landmark(
        &self,
        group: &str,
        left_eye: &Puploc,
        right_eye: &Puploc,
        image: &ImageParams<'_>,
        perturbs: u32,
        flipped: bool,
    ) -> Vec<Puploc>;
}

/// Multi-scale face detection aggregator.
pub struct FaceExtractor {
    cascade: Box<dyn Cascade>,
    landmarks: Option<Box<dyn LandmarkCascade>>,
    config: Config,
}

impl FaceExtractor {
    pub fn new(cascade: Box<dyn Cascade>, config: Config) -> Self {
        Self {
            cascade,
            landmarks: None,
            config,
        }
    }

    /// Enable pupil and landmark search.
    pub fn with_landmarks(mut self, landmarks: Box<dyn LandmarkCascade>) -> Self {
        self.landmarks = Some(landmarks);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_landmarks(&self) -> bool {
        self.landmarks.is_some()
    }

    /// Run detection passes with growing minimum face size and keep the first
    /// pass that finds anything.
    pub fn try_multiple(
        &self,
        img: &GrayImage,
        find_landmarks: bool,
        min_size: u32,
    ) -> Result<Faces, DetectorError> {
        let min_size = min_size.max(1);
        let steps = self.scale_steps(img.width(), img.height(), min_size);

        for i in 1..=steps {
            let size = min_size * i;
            match self.extract(img, find_landmarks, size) {
                Ok(faces) if !faces.is_empty() => {
                    tracing::debug!(size, faces = faces.len(), "multi-face pass succeeded");
                    return Ok(faces);
                }
                Ok(_) => {}
                Err(err) => tracing::trace!(size, error = %err, "detection pass failed"),
            }
        }

        Err(DetectorError::NoFaceDetected)
    }

    /// Run every detection pass in the size progression, keep passes that
    /// found exactly one face and return the highest-scoring of those.
    pub fn try_single(
        &self,
        img: &GrayImage,
        find_landmarks: bool,
        min_size: u32,
    ) -> Result<Face, DetectorError> {
        let min_size = min_size.max(1);
        let steps = self.scale_steps(img.width(), img.height(), min_size);

        // Winner is picked on the raw cascade quality, not the truncated score.
        let mut best: Option<(Face, f32)> = None;
        for i in 1..=steps {
            let size = min_size * i;
            let (faces, quality) = match self.extract_scored(img, find_landmarks, size) {
                Ok((faces, quality)) if faces.len() == 1 => (faces, quality),
                Ok(_) => continue,
                Err(err) => {
                    tracing::trace!(size, error = %err, "detection pass failed");
                    continue;
                }
            };
            let (Some(face), Some(&q)) = (faces.into_iter().next(), quality.first()) else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, best_q)| q > *best_q) {
                best = Some((face, q));
            }
        }

        let (face, q) = best.ok_or(DetectorError::NoFaceDetected)?;
        if face.area.row == 0 || face.area.col == 0 || face.area.scale == 0 {
            return Err(DetectorError::NoFaceDetected);
        }

        tracing::debug!(q, scale = face.area.scale, "single-face detection");
        Ok(face)
    }

    /// One detection pass with the given minimum face size.
    pub fn extract(
        &self,
        img: &GrayImage,
        find_landmarks: bool,
        min_size: u32,
    ) -> Result<Faces, DetectorError> {
        self.extract_scored(img, find_landmarks, min_size)
            .map(|(faces, _)| faces)
    }

    /// [`extract`](Self::extract) plus the raw quality of each accepted face,
    /// in the same order.
    fn extract_scored(
        &self,
        img: &GrayImage,
        find_landmarks: bool,
        min_size: u32,
    ) -> Result<(Faces, Vec<f32>), DetectorError> {
        let params = self.cascade_params(img.width(), img.height(), min_size)?;
        let image = ImageParams::from_gray(img);

        let detections = self.cascade.detect(&image, &params);
        tracing::trace!(
            min_size = params.min_size,
            max_size = params.max_size,
            raw = detections.len(),
            "cascade pass"
        );
        if detections.is_empty() {
            return Err(DetectorError::NoFaceDetected);
        }

        Ok(self.scored_faces(detections, &image, find_landmarks))
    }

    /// Turn merged raw detections into faces: threshold by quality, attach
    /// landmarks and reject overlaps. Larger detections are processed first.
    pub fn faces(
        &self,
        mut detections: Vec<Detection>,
        image: &ImageParams<'_>,
        find_landmarks: bool,
    ) -> Faces {
        self.scored_faces(detections, image, find_landmarks).0
    }

    fn scored_faces(
        &self,
        mut detections: Vec<Detection>,
        image: &ImageParams<'_>,
        find_landmarks: bool,
    ) -> (Faces, Vec<f32>) {
        detections.sort_by(|a, b| b.scale.cmp(&a.scale));

        let mut results = Faces::with_capacity(detections.len(), &self.config);
        let mut quality = Vec::with_capacity(detections.len());
        for det in &detections {
            let threshold = self.config.quality_threshold(det.scale);
            if det.q < threshold {
                tracing::trace!(q = det.q, scale = det.scale, threshold, "low quality detection");
                continue;
            }

            let (eyes, landmarks) = match &self.landmarks {
                Some(lm) if find_landmarks && det.scale > LANDMARK_MIN_SCALE => {
                    self.locate_landmarks(lm.as_ref(), det, image)
                }
                _ => (Vec::new(), Vec::new()),
            };

            let face = Face {
                rows: image.rows,
                cols: image.cols,
                score: det.q as i32,
                area: Area::new("face", det.row, det.col, det.scale),
                eyes,
                landmarks,
                ..Face::default()
            };

            if results.contains(&face) {
                tracing::trace!(row = det.row, col = det.col, scale = det.scale, "overlapping face");
                continue;
            }
            results.append(face);
            quality.push(det.q);
        }

        (results, quality)
    }

    fn cascade_params(
        &self,
        cols: u32,
        rows: u32,
        min_size: u32,
    ) -> Result<CascadeParams, DetectorError> {
        let floor = self.config.min_face_size;
        let min_size = min_size.max(floor);

        if cols < floor || rows < floor || cols < min_size || rows < min_size {
            return Err(DetectorError::ImageSizeTooSmall { cols, rows });
        }

        Ok(CascadeParams {
            min_size,
            max_size: cols.min(rows).saturating_sub(IMAGE_BORDER),
            shift_factor: self.config.shift_factor,
            scale_factor: self.config.scale_factor,
            iou_threshold: self.config.iou_threshold,
        })
    }

    /// Number of passes in the size progression: the configured maximum image
    /// size is scaled by the aspect ratio so the shorter side maps onto it.
    fn scale_steps(&self, width: u32, height: u32, min_size: u32) -> u32 {
        let base = self.config.max_image_size as u64;
        let (w, h) = (width.max(1) as u64, height.max(1) as u64);
        let max_size = match w.cmp(&h) {
            std::cmp::Ordering::Greater => base * h / w,
            std::cmp::Ordering::Less => base * w / h,
            std::cmp::Ordering::Equal => base,
        };
        (max_size / min_size.max(1) as u64) as u32
    }

    fn locate_landmarks(
        &self,
        lm: &dyn LandmarkCascade,
        det: &Detection,
        image: &ImageParams<'_>,
    ) -> (Vec<Area>, Vec<Area>) {
        let perturbs = self.config.perturbs;
        let scale = det.scale as f32;
        let search = |col_offset: f32| Puploc {
            row: det.row + (PUPIL_ROW_OFFSET * scale) as i32,
            col: det.col + (col_offset * scale) as i32,
            scale: scale * PUPIL_SEARCH_SCALE,
            perturbs,
        };

        let left = lm.locate_pupil(&search(LEFT_PUPIL_COL_OFFSET), image);
        let right = lm.locate_pupil(&search(RIGHT_PUPIL_COL_OFFSET), image);

        let mut eyes = Vec::with_capacity(2);
        for (name, eye) in [("eye_l", left), ("eye_r", right)] {
            if !eye.is_degenerate() {
                eyes.push(eye.to_area(name));
            }
        }

        // Fine cascades run even when a pupil is missing; bad points are
        // dropped per group.
        let mut landmarks = Vec::new();
        let mut locate = |name: String, group: &str, flipped: bool| {
            let found = lm
                .locate_landmark(group, &left, &right, image, perturbs, flipped)
                .into_iter()
                .find(|p| !p.is_degenerate());
            if let Some(point) = found {
                landmarks.push(point.to_area(name));
            }
        };

        for group in EYE_CASCADES {
            locate(group.to_string(), group, false);
            locate(format!("{group}_v"), group, true);
        }
        for group in MOUTH_CASCADES {
            locate(format!("mouth_{group}"), group, false);
        }
        locate(GENERAL_CASCADE.to_string(), GENERAL_CASCADE, true);

        (eyes, landmarks)
    }
}
