//! Detected faces and the deduplicated face set produced by one detection run.

use crate::area::{relative_areas, Area, RelativeArea};
use crate::config::{quality_threshold, Config};
use serde::{Deserialize, Serialize};

/// One accepted detection: geometry, quality score, landmarks and, once the
/// embedding service has run, its embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Face {
    /// Source image height in pixels.
    pub rows: i32,
    /// Source image width in pixels.
    pub cols: i32,
    /// Cascade quality score, truncated to an integer.
    pub score: i32,
    pub area: Area,
    /// Pupils, in left/right order. Either empty or two entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eyes: Vec<Area>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub landmarks: Vec<Area>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Every embedding attached to this face, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding_set: Vec<Vec<f32>>,
}

impl Face {
    /// Absolute face size in pixels.
    pub fn size(&self) -> i32 {
        self.area.scale
    }

    /// Relative square around the detection, used for cropping and overlap tests.
    pub fn crop_area(&self) -> RelativeArea {
        let rows = self.rows.max(1) as f32;
        let cols = self.cols.max(1) as f32;
        let half = self.area.scale / 2;

        RelativeArea::new(
            self.area.name.clone(),
            (self.area.col - half) as f32 / cols,
            (self.area.row - half) as f32 / rows,
            self.area.scale as f32 / cols,
            self.area.scale as f32 / rows,
        )
    }

    /// Point between the eyes, or the face area itself without two eyes.
    pub fn eyes_midpoint(&self) -> Area {
        match self.eyes.as_slice() {
            [left, right] => Area::new(
                "midpoint",
                (left.row + right.row) / 2,
                (left.col + right.col) / 2,
                (left.scale + right.scale) / 2,
            ),
            _ => Area::new("midpoint", self.area.row, self.area.col, self.area.scale),
        }
    }

    /// Landmarks followed by eyes, relative to the eyes midpoint.
    pub fn relative_landmarks(&self) -> Vec<RelativeArea> {
        let mid = self.eyes_midpoint();
        let rows = self.rows as f32;
        let cols = self.cols as f32;

        let mut out = relative_areas(&self.landmarks, &mid, rows, cols);
        out.extend(relative_areas(&self.eyes, &mid, rows, cols));
        out
    }

    /// [`relative_landmarks`](Self::relative_landmarks) as JSON, or an empty
    /// string when there are none.
    pub fn relative_landmarks_json(&self) -> String {
        let landmarks = self.relative_landmarks();
        if landmarks.is_empty() {
            return String::new();
        }
        serde_json::to_string(&landmarks).unwrap_or_default()
    }

    /// The embedding set as a JSON array of arrays.
    pub fn embeddings_json(&self) -> String {
        serde_json::to_string(&self.embedding_set).unwrap_or_default()
    }

    /// Attach the rows returned by the embedding service. The first row becomes
    /// the primary embedding.
    pub fn set_embeddings(&mut self, rows: Vec<Vec<f32>>) {
        self.embedding = rows.first().cloned();
        self.embedding_set = rows;
    }

    /// Append one more embedding to the history.
    pub fn push_embedding(&mut self, embedding: Vec<f32>) {
        if self.embedding.is_none() {
            self.embedding = Some(embedding.clone());
        }
        self.embedding_set.push(embedding);
    }
}

/// Ordered faces from one image, deduplicated by crop-area overlap.
#[derive(Debug, Clone)]
pub struct Faces {
    items: Vec<Face>,
    overlap_threshold: i32,
    score_threshold: f32,
}

impl Default for Faces {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl Faces {
    pub fn new(config: &Config) -> Self {
        Self::with_capacity(0, config)
    }

    pub fn with_capacity(capacity: usize, config: &Config) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            overlap_threshold: config.overlap_threshold,
            score_threshold: config.score_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Face> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Face> {
        self.items.iter_mut()
    }

    pub fn first(&self) -> Option<&Face> {
        self.items.first()
    }

    /// True when `face` overlaps an accepted face above the overlap threshold.
    pub fn contains(&self, face: &Face) -> bool {
        let crop = face.crop_area();
        self.items
            .iter()
            .any(|f| f.crop_area().overlap_percent(&crop) > self.overlap_threshold)
    }

    /// Append unconditionally. Use [`contains`](Self::contains) first to keep
    /// the set deduplicated.
    pub fn append(&mut self, face: Face) {
        self.items.push(face);
    }

    /// Detection uncertainty in percent; lower is more confident.
    ///
    /// 100 for an empty set. Otherwise driven by the face whose score is
    /// closest to its scale-adjusted threshold: `50 × threshold / score`.
    pub fn uncertainty(&self) -> i32 {
        let weakest = self
            .items
            .iter()
            .map(|f| {
                if f.score <= 0 {
                    return f32::INFINITY;
                }
                quality_threshold(self.score_threshold, f.area.scale) / f.score as f32
            })
            .fold(None, |acc: Option<f32>, ratio| {
                Some(acc.map_or(ratio, |a| a.max(ratio)))
            });

        match weakest {
            None => 100,
            Some(ratio) if !ratio.is_finite() => 100,
            Some(ratio) => ((50.0 * ratio).round() as i32).clamp(0, 100),
        }
    }

    pub fn into_vec(self) -> Vec<Face> {
        self.items
    }
}

impl<'a> IntoIterator for &'a Faces {
    type Item = &'a Face;
    type IntoIter = std::slice::Iter<'a, Face>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for Faces {
    type Item = Face;
    type IntoIter = std::vec::IntoIter<Face>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
