//! Thread-safe facade over detection, embedding and the identity store.
//!
//! Detection and embedding run without touching the store. Store reads take a
//! shared lock; every store mutation takes the exclusive lock.

use crate::config::Config;
use crate::detector::{DetectorError, FaceExtractor};
use crate::face::Face;
use crate::marker::{FaceMarker, FaceMarkers};
use crate::people::{MatchError, People, Person};
use crate::recognizer::{normalize_image, FaceRecognizer, RecognizerError};
use crate::storage::{Storage, StorageError};
use image::DynamicImage;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("embedding model not loaded")]
    ModelNotLoaded,
    #[error("no embedding extracted")]
    NoEmbedding,
}

pub struct Estimator {
    extractor: FaceExtractor,
    recognizer: Option<FaceRecognizer>,
    storage: RwLock<Storage>,
}

impl Estimator {
    pub fn new(extractor: FaceExtractor, storage: Storage) -> Self {
        Self {
            extractor,
            recognizer: None,
            storage: RwLock::new(storage),
        }
    }

    pub fn with_recognizer(mut self, recognizer: FaceRecognizer) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn config(&self) -> &Config {
        self.extractor.config()
    }

    /// Detect every face in `img`, embed it and match it against the store.
    pub fn detect_faces(&self, img: &DynamicImage, min_size: u32) -> Result<FaceMarkers, EstimatorError> {
        let recognizer = self.recognizer()?;
        let src = normalize_image(img, self.config().max_image_size);

        let mut faces = self
            .extractor
            .try_multiple(&src.to_luma8(), self.extractor.has_landmarks(), min_size)?;
        let embedded = recognizer.embed_faces(&src, &mut faces);

        let storage = self.read();
        let mut markers = FaceMarkers::new();
        for face in faces {
            markers.append(mark_face(storage.people(), face));
        }

        tracing::debug!(
            faces = markers.len(),
            embedded,
            matched = markers.successful().count(),
            "faces detected"
        );
        Ok(markers)
    }

    /// Detect the single face in a training image and return its embedding.
    pub fn extract_face(
        &self,
        name: &str,
        img: &DynamicImage,
        min_size: u32,
    ) -> Result<(Vec<f32>, FaceMarker), EstimatorError> {
        let recognizer = self.recognizer()?;
        let src = normalize_image(img, self.config().max_image_size);

        let mut face = self
            .extractor
            .try_single(&src.to_luma8(), self.extractor.has_landmarks(), min_size)?;
        match recognizer.embed_face(&src, &face) {
            Ok(rows) => face.set_embeddings(rows),
            Err(e) => tracing::warn!(name, error = %e, "face embedding failed"),
        }

        let embedding = face.embedding.clone().ok_or(EstimatorError::NoEmbedding)?;
        Ok((embedding, FaceMarker::new(face, name, 0.0)))
    }

    /// Build an identity from every image whose face extraction succeeds.
    pub fn train(&self, name: &str, images: &[DynamicImage], min_size: u32) -> Result<Person, EstimatorError> {
        let mut embeddings = Vec::with_capacity(images.len());
        for (i, img) in images.iter().enumerate() {
            match self.extract_face(name, img, min_size) {
                Ok((embedding, _)) => embeddings.push(embedding),
                Err(e) => tracing::warn!(name, image = i, error = %e, "training image skipped"),
            }
        }

        if embeddings.is_empty() {
            return Err(EstimatorError::NoEmbedding);
        }
        tracing::info!(name, samples = embeddings.len(), "identity trained");
        Ok(Person::new(name, embeddings))
    }

    /// Upsert identities by name.
    pub fn add_person(&self, persons: impl IntoIterator<Item = Person>) {
        self.write().people_mut().append(persons);
    }

    pub fn delete_person(&self, name: &str) -> bool {
        self.write().people_mut().delete(name)
    }

    /// Recompute all derived identity values.
    pub fn reload(&self) {
        self.write().people_mut().setup();
    }

    /// Replace the in-memory store with the one at `path`.
    pub fn load(&self, path: &Path) -> Result<(), EstimatorError> {
        let storage = Storage::load(path, self.config().match_dist)?;
        *self.write() = storage;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), EstimatorError> {
        self.read().save(path)?;
        Ok(())
    }

    /// Name and distance of the matching identity.
    pub fn match_embedding(&self, embedding: &[f32]) -> Result<(String, f64), MatchError> {
        let storage = self.read();
        let (person, dist) = storage.people().match_embedding(embedding)?;
        Ok((person.name.clone(), dist))
    }

    pub fn neighbour(&self, embedding: &[f32], excluding: &str) -> Option<(String, f64)> {
        let storage = self.read();
        storage
            .people()
            .neighbour(embedding, excluding)
            .map(|(p, d)| (p.name.clone(), d))
    }

    /// Run `f` against the identity store under the shared lock.
    pub fn with_people<R>(&self, f: impl FnOnce(&People) -> R) -> R {
        f(self.read().people())
    }

    fn recognizer(&self) -> Result<&FaceRecognizer, EstimatorError> {
        self.recognizer.as_ref().ok_or(EstimatorError::ModelNotLoaded)
    }

    fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marker for one face. Failed matches keep the nearest identity's name.
fn mark_face(people: &People, face: Face) -> FaceMarker {
    let Some(embedding) = face.embedding.clone() else {
        return FaceMarker::failed(face, MatchError::NothingMatch);
    };

    match people.match_embedding(&embedding) {
        Ok((person, dist)) => FaceMarker::new(face, person.name.clone(), dist),
        Err(err) => {
            let label = people
                .nearest(&embedding)
                .map(|(p, _)| p.name.clone())
                .unwrap_or_default();
            let mut marker = FaceMarker::new(face, label, err.distance());
            marker.set_error(err);
            marker
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Cascade, CascadeParams, Detection, ImageParams};
    use crate::recognizer::EmbeddingService;
    use image::{Rgb, RgbImage};

    /// Always reports the same detections.
    struct FixedCascade(Vec<Detection>);

    impl Cascade for FixedCascade {
        fn detect(&self, _image: &ImageParams<'_>, _params: &CascadeParams) -> Vec<Detection> {
            self.0.clone()
        }
    }

    /// Embeds a thumbnail as its mean red and green, failing on blue faces.
    struct ColorService;

    impl EmbeddingService for ColorService {
        fn embed(&self, thumb: &RgbImage) -> Result<Vec<Vec<f32>>, RecognizerError> {
            let n = (thumb.width() * thumb.height()) as f32 * 255.0;
            let channel = |c: usize| thumb.pixels().map(|p| p[c] as f32).sum::<f32>() / n;
            if channel(2) > 0.5 {
                return Err(RecognizerError::InferenceFailed("blue".into()));
            }
            Ok(vec![vec![channel(0), channel(1)]])
        }
    }

    fn config() -> Config {
        Config {
            max_image_size: 200,
            ..Config::default()
        }
    }

    fn det(row: i32, col: i32, scale: i32) -> Detection {
        Detection { row, col, scale, q: 50.0 }
    }

    fn estimator(dets: Vec<Detection>, people: Vec<Person>) -> Estimator {
        let config = config();
        let mut storage = Storage::new(config.match_dist);
        storage.people_mut().append(people);
        Estimator::new(FaceExtractor::new(Box::new(FixedCascade(dets)), config), storage)
            .with_recognizer(FaceRecognizer::new(Box::new(ColorService), 32))
    }

    /// 200×200 image with colored squares centered on the given detections.
    fn image(squares: &[(Detection, [u8; 3])]) -> DynamicImage {
        let mut img = RgbImage::new(200, 200);
        for (d, color) in squares {
            let half = d.scale / 2;
            for y in (d.row - half)..(d.row + half) {
                for x in (d.col - half)..(d.col + half) {
                    img.put_pixel(x as u32, y as u32, Rgb(*color));
                }
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn people() -> Vec<Person> {
        vec![
            Person::new("alice", vec![vec![1.0, 0.0]]),
            Person::new("bob", vec![vec![0.0, 1.0]]),
        ]
    }

    #[test]
    fn test_detect_faces_matches_each_face() {
        let (a, b) = (det(60, 60, 60), det(140, 140, 60));
        let est = estimator(vec![a, b], people());
        let img = image(&[(a, [255, 0, 0]), (b, [0, 255, 0])]);

        let markers = est.detect_faces(&img, 20).unwrap();
        let labels: Vec<&str> = markers.successful().map(|m| m.label()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        assert!(markers.markers().iter().all(|m| m.distance() < 0.05));
    }

    #[test]
    fn test_detect_faces_records_failures() {
        let (a, b, c) = (det(40, 40, 50), det(40, 160, 50), det(150, 100, 60));
        let est = estimator(vec![a, b, c], people());
        // Unknown gray face, and a face the embedder cannot handle.
        let img = image(&[(a, [255, 0, 0]), (b, [128, 128, 0]), (c, [0, 0, 255])]);

        let markers = est.detect_faces(&img, 20).unwrap();
        assert_eq!(markers.len(), 3);

        let by_col = |col: i32| {
            markers
                .markers()
                .iter()
                .find(|m| m.face().area.col == col)
                .unwrap()
        };
        assert!(by_col(40).is_success());
        assert!(matches!(by_col(160).error(), Some(MatchError::TooFar { .. })));
        assert_eq!(by_col(100).error(), Some(&MatchError::NothingMatch));
        assert!(by_col(100).face().embedding.is_none());
    }

    #[test]
    fn test_detect_faces_requires_model() {
        let config = config();
        let est = Estimator::new(
            FaceExtractor::new(Box::new(FixedCascade(vec![])), config.clone()),
            Storage::new(config.match_dist),
        );
        assert!(matches!(
            est.detect_faces(&DynamicImage::new_rgb8(100, 100), 20),
            Err(EstimatorError::ModelNotLoaded)
        ));
    }

    #[test]
    fn test_detect_faces_no_face() {
        let est = estimator(vec![], people());
        assert!(matches!(
            est.detect_faces(&DynamicImage::new_rgb8(200, 200), 20),
            Err(EstimatorError::Detector(DetectorError::NoFaceDetected))
        ));
    }

    #[test]
    fn test_train_skips_failed_images() {
        let face = det(100, 100, 80);
        let est = estimator(vec![face], vec![]);
        let good = image(&[(face, [0, 255, 0])]);
        // Wider than tall and below the detector minimum: never normalized up.
        let tiny = DynamicImage::new_rgb8(10, 5);

        let person = est.train("carol", &[good.clone(), tiny, good], 20).unwrap();
        assert_eq!(person.name, "carol");
        assert_eq!(person.embeddings.len(), 2);
        assert!((person.centroid[1] - 1.0).abs() < 0.02);

        assert!(matches!(
            est.train("nobody", &[DynamicImage::new_rgb8(10, 5)], 20),
            Err(EstimatorError::NoEmbedding)
        ));
    }

    #[test]
    fn test_extract_face_requires_embedding() {
        let face = det(100, 100, 80);
        let est = estimator(vec![face], vec![]);
        let blue = image(&[(face, [0, 0, 255])]);
        assert!(matches!(
            est.extract_face("dave", &blue, 20),
            Err(EstimatorError::NoEmbedding)
        ));

        let red = image(&[(face, [255, 0, 0])]);
        let (embedding, marker) = est.extract_face("dave", &red, 20).unwrap();
        assert!((embedding[0] - 1.0).abs() < 0.02);
        assert_eq!(marker.label(), "dave");
    }

    #[test]
    fn test_store_mutations_and_persistence() {
        let est = estimator(vec![], people());
        est.add_person(vec![Person::new("carol", vec![vec![5.0, 5.0]])]);
        assert_eq!(est.with_people(|p| p.len()), 3);

        let (name, _) = est.match_embedding(&[4.9, 5.0]).unwrap();
        assert_eq!(name, "carol");
        let (name, _) = est.neighbour(&[0.9, 0.0], "alice").unwrap();
        assert_eq!(name, "bob");

        assert!(est.delete_person("bob"));
        assert!(!est.delete_person("bob"));
        est.reload();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.json");
        est.save(&path).unwrap();

        let other = estimator(vec![], vec![]);
        other.load(&path).unwrap();
        let names = other.with_people(|p| p.iter().map(|x| x.name.clone()).collect::<Vec<_>>());
        assert_eq!(names, vec!["alice", "carol"]);
    }
}
