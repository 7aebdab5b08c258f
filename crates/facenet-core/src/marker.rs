//! Match outcomes per detected face, for reporting and rendering.

use crate::area::PixelBounds;
use crate::face::Face;
use crate::people::MatchError;
use crate::recognizer::{self, RecognizerError};
use image::{DynamicImage, GenericImageView, RgbImage};

/// A face paired with the identity it matched, or the reason it did not.
#[derive(Debug, Clone)]
pub struct FaceMarker {
    face: Face,
    label: String,
    distance: f64,
    error: Option<MatchError>,
}

impl FaceMarker {
    pub fn new(face: Face, label: impl Into<String>, distance: f64) -> Self {
        Self {
            face,
            label: label.into(),
            distance,
            error: None,
        }
    }

    /// Marker for a face that did not match anyone.
    pub fn failed(face: Face, error: MatchError) -> Self {
        let distance = error.distance();
        Self {
            face,
            label: String::new(),
            distance,
            error: Some(error),
        }
    }

    pub fn face(&self) -> &Face {
        &self.face
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn error(&self) -> Option<&MatchError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: MatchError) {
        self.error = Some(error);
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Face crop rectangle in an image of `width × height`.
    pub fn bounds(&self, width: u32, height: u32) -> PixelBounds {
        self.face.crop_area().bounds(width, height)
    }

    pub fn thumb(&self, img: &DynamicImage, crop_size: u32) -> Result<RgbImage, RecognizerError> {
        recognizer::thumb(img, &self.face.crop_area(), crop_size)
    }
}

/// Ordered markers for one processed image.
#[derive(Debug, Clone, Default)]
pub struct FaceMarkers {
    markers: Vec<FaceMarker>,
}

impl FaceMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, marker: FaceMarker) {
        self.markers.push(marker);
    }

    pub fn markers(&self) -> &[FaceMarker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn successful(&self) -> impl Iterator<Item = &FaceMarker> {
        self.markers.iter().filter(|m| m.is_success())
    }

    /// Thumbnails of every marked face, in marker order. Faces whose crop
    /// falls outside `img` are skipped.
    pub fn face_images(&self, img: &DynamicImage, crop_size: u32) -> Vec<RgbImage> {
        self.markers
            .iter()
            .filter_map(|m| match m.thumb(img, crop_size) {
                Ok(thumb) => Some(thumb),
                Err(e) => {
                    let (w, h) = img.dimensions();
                    tracing::debug!(label = m.label(), width = w, height = h, error = %e, "face thumbnail skipped");
                    None
                }
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a FaceMarkers {
    type Item = &'a FaceMarker;
    type IntoIter = std::slice::Iter<'a, FaceMarker>;

    fn into_iter(self) -> Self::IntoIter {
        self.markers.iter()
    }
}
