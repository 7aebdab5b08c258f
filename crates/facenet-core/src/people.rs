//! Identity store.
//!
//! Every [`Person`] keeps its raw embedding history plus three derived values:
//! the centroid, an acceptance radius around it and a collision radius. The
//! collision radius is the distance at which the identity has been seen to be
//! confusable with samples of another identity; matches beyond it are
//! rejected as ambiguous even when they fall inside the nominal radius.
//!
//! Derived values are recomputed by [`People::setup`] after every bulk
//! mutation: first all centroids and radii, then all pairwise collisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Margin added to the farthest own sample when computing the radius.
pub const RADIUS_MARGIN: f64 = 0.01;
/// Margin subtracted from a cross-identity match distance.
pub const COLLISION_MARGIN: f64 = 0.01;
/// Collision radii at or below this are treated as unset.
pub const COLLISION_RADIUS_FLOOR: f64 = 0.1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("negative match distance {dist}")]
    NegativeDistance { dist: f64 },
    #[error("too far: distance {dist:.4} exceeds {limit:.4}")]
    TooFar { dist: f64, limit: f64 },
    #[error("collision: distance {dist:.4} exceeds collision radius {collision_radius:.4}")]
    Collision { dist: f64, collision_radius: f64 },
    #[error("nothing matches")]
    NothingMatch,
}

impl MatchError {
    /// Distance of the rejected candidate, when there was one.
    pub fn distance(&self) -> f64 {
        match self {
            MatchError::NegativeDistance { dist }
            | MatchError::TooFar { dist, .. }
            | MatchError::Collision { dist, .. } => *dist,
            MatchError::NothingMatch => 0.0,
        }
    }
}

/// Euclidean distance, accumulated in `f64`. Extra components of the longer
/// vector are ignored.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// One known identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub centroid: Vec<f32>,
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub collision_radius: f64,
}

impl Person {
    pub fn new(name: impl Into<String>, embeddings: Vec<Vec<f32>>) -> Self {
        let mut person = Self {
            name: name.into(),
            embeddings,
            ..Self::default()
        };
        person.calc_center();
        person
    }

    pub fn add_embedding(&mut self, embedding: Vec<f32>) {
        self.embeddings.push(embedding);
        self.calc_center();
    }

    /// Recompute centroid and radius from the embedding history.
    pub fn calc_center(&mut self) {
        match self.embeddings.as_slice() {
            [] => {
                self.centroid.clear();
                self.radius = 0.0;
            }
            [only] => {
                self.centroid = only.clone();
                self.radius = 0.0;
            }
            all => {
                let dim = all[0].len();
                let mut sum = vec![0.0f64; dim];
                for emb in all {
                    for (acc, v) in sum.iter_mut().zip(emb) {
                        *acc += *v as f64;
                    }
                }
                let n = all.len() as f64;
                self.centroid = sum.into_iter().map(|s| (s / n) as f32).collect();

                let farthest = all
                    .iter()
                    .map(|emb| euclidean_distance(emb, &self.centroid))
                    .fold(0.0f64, f64::max);
                self.radius = farthest + RADIUS_MARGIN;
            }
        }
    }

    /// Smallest distance from `embedding` to any stored sample.
    pub fn nearest_distance(&self, embedding: &[f32]) -> Option<f64> {
        self.embeddings
            .iter()
            .map(|emb| euclidean_distance(emb, embedding))
            .min_by(f64::total_cmp)
    }

    /// Mean distance from `embedding` to the stored samples, skipping samples
    /// at exactly zero distance. Zero when nothing is left to average.
    pub fn average_distance(&self, embedding: &[f32]) -> f64 {
        let (sum, count) = self
            .embeddings
            .iter()
            .map(|emb| euclidean_distance(emb, embedding))
            .filter(|d| *d != 0.0)
            .fold((0.0, 0usize), |(sum, count), d| (sum + d, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Accept or reject a candidate at `dist` from this identity.
    pub fn check_distance(&self, dist: f64, match_dist: f64) -> Result<(), MatchError> {
        if dist < 0.0 {
            return Err(MatchError::NegativeDistance { dist });
        }
        let limit = self.radius + match_dist;
        if dist > limit {
            return Err(MatchError::TooFar { dist, limit });
        }
        if self.collision_radius > COLLISION_RADIUS_FLOOR && dist > self.collision_radius {
            return Err(MatchError::Collision {
                dist,
                collision_radius: self.collision_radius,
            });
        }
        Ok(())
    }

    /// Match against this identity alone, by nearest own sample.
    pub fn matches(&self, embedding: &[f32], match_dist: f64) -> (bool, f64) {
        match self.nearest_distance(embedding) {
            Some(dist) => (self.check_distance(dist, match_dist).is_ok(), dist),
            None => (false, f64::INFINITY),
        }
    }

    /// Tighten the collision radius with every sample of `other` that would
    /// be accepted by this identity.
    fn resolve_collision(&mut self, other: &Person, match_dist: f64) {
        for emb in &other.embeddings {
            let (matched, dist) = self.matches(emb, match_dist);
            if !matched {
                continue;
            }
            let candidate = dist - COLLISION_MARGIN;
            if self.collision_radius <= COLLISION_RADIUS_FLOOR || candidate > self.collision_radius {
                tracing::trace!(
                    person = %self.name,
                    other = %other.name,
                    collision_radius = candidate,
                    "collision radius updated"
                );
                self.collision_radius = candidate;
            }
        }
    }
}

/// Name-unique ordered collection of identities.
#[derive(Debug, Clone)]
pub struct People {
    list: Vec<Person>,
    match_dist: f64,
}

impl People {
    pub fn new(match_dist: f64) -> Self {
        Self {
            list: Vec::new(),
            match_dist,
        }
    }

    /// Build a store from persisted identities. Later duplicates of a name
    /// replace earlier ones. Runs [`setup`](Self::setup).
    pub fn from_persons(persons: Vec<Person>, match_dist: f64) -> Self {
        let mut people = Self::new(match_dist);
        people.append(persons);
        people
    }

    pub fn match_dist(&self) -> f64 {
        self.match_dist
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Person> {
        self.list.iter()
    }

    pub fn persons(&self) -> &[Person] {
        &self.list
    }

    pub fn get(&self, name: &str) -> Option<&Person> {
        self.list.iter().find(|p| p.name == name)
    }

    /// Recompute every centroid and radius, then resolve all collisions.
    pub fn setup(&mut self) {
        for person in &mut self.list {
            person.collision_radius = 0.0;
            person.calc_center();
        }
        self.resolve_collisions();
        tracing::debug!(people = self.list.len(), "identity store set up");
    }

    /// Run collision resolution over every ordered pair of identities.
    pub fn resolve_collisions(&mut self) {
        let n = self.list.len();
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let (person, other) = pair_mut(&mut self.list, i, j);
                person.resolve_collision(other, self.match_dist);
            }
        }
    }

    /// Upsert by name: known names are replaced in place, new names are
    /// appended in order. Runs [`setup`](Self::setup).
    pub fn append(&mut self, persons: impl IntoIterator<Item = Person>) {
        for person in persons {
            match self.list.iter_mut().find(|p| p.name == person.name) {
                Some(existing) => *existing = person,
                None => self.list.push(person),
            }
        }
        self.setup();
    }

    /// Remove the identity called `name` (surrounding whitespace ignored).
    /// Returns false when no such identity exists.
    pub fn delete(&mut self, name: &str) -> bool {
        let name = name.trim();
        let Some(idx) = self.list.iter().position(|p| p.name == name) else {
            return false;
        };
        self.list.remove(idx);
        self.setup();
        true
    }

    /// Identity owning the sample nearest to `embedding`.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(&Person, f64)> {
        self.list
            .iter()
            .filter_map(|p| p.nearest_distance(embedding).map(|d| (p, d)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Nearest identity, subject to its radius and collision radius.
    pub fn match_embedding(&self, embedding: &[f32]) -> Result<(&Person, f64), MatchError> {
        let (person, dist) = self.nearest(embedding).ok_or(MatchError::NothingMatch)?;
        person.check_distance(dist, self.match_dist)?;
        Ok((person, dist))
    }

    /// Identity other than `excluding` with the smallest average distance.
    pub fn neighbour(&self, embedding: &[f32], excluding: &str) -> Option<(&Person, f64)> {
        self.list
            .iter()
            .filter(|p| p.name != excluding && !p.embeddings.is_empty())
            .map(|p| (p, p.average_distance(embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl<'a> IntoIterator for &'a People {
    type Item = &'a Person;
    type IntoIter = std::slice::Iter<'a, Person>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

/// Mutable access to `list[i]` alongside shared access to `list[j]`, `i != j`.
fn pair_mut(list: &mut [Person], i: usize, j: usize) -> (&mut Person, &Person) {
    if i < j {
        let (head, tail) = list.split_at_mut(j);
        (&mut head[i], &tail[0])
    } else {
        let (head, tail) = list.split_at_mut(i);
        (&mut tail[0], &head[j])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MATCH_DIST;

    fn person(name: &str, embeddings: &[[f32; 2]]) -> Person {
        Person::new(name, embeddings.iter().map(|e| e.to_vec()).collect())
    }

    fn store(persons: Vec<Person>) -> People {
        People::from_persons(persons, DEFAULT_MATCH_DIST)
    }

    #[test]
    fn test_distance() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-9);
        assert_eq!(euclidean_distance(&[], &[]), 0.0);
    }

    #[test]
    fn test_calc_center_sizes() {
        let empty = person("a", &[]);
        assert!(empty.centroid.is_empty());
        assert_eq!(empty.radius, 0.0);

        let single = person("a", &[[0.3, 0.4]]);
        assert_eq!(single.centroid, vec![0.3, 0.4]);
        assert_eq!(single.radius, 0.0);

        let pair = person("a", &[[0.0, 0.0], [0.2, 0.0]]);
        assert!((pair.centroid[0] - 0.1).abs() < 1e-6);
        assert!((pair.radius - 0.11).abs() < 1e-6);
    }

    #[test]
    fn test_own_samples_within_radius() {
        let cases: Vec<Person> = vec![
            person("a", &[[0.1, 0.9], [0.3, -0.2], [-0.7, 0.05]]),
            person("b", &[[1.0, 1.0], [1.0, 1.0]]),
            person("c", &[[0.123, 0.456]]),
            person("d", &[[5.0, -3.0], [4.9, -3.1], [5.2, -2.7], [5.0, -3.4]]),
        ];
        for p in &cases {
            for emb in &p.embeddings {
                let d = euclidean_distance(emb, &p.centroid);
                assert!(d <= p.radius, "{}: {d} > {}", p.name, p.radius);
            }
        }
    }

    #[test]
    fn test_match_too_far_boundary() {
        let people = store(vec![person("a", &[[0.0, 0.0], [0.2, 0.0]])]);
        let limit = people.get("a").unwrap().radius + DEFAULT_MATCH_DIST;

        let far = [-(limit as f32 + 0.01), 0.0];
        match people.match_embedding(&far) {
            Err(MatchError::TooFar { dist, .. }) => assert!(dist > limit),
            other => panic!("expected TooFar, got {other:?}"),
        }

        let near = [-(limit as f32 - 0.01), 0.0];
        let (p, dist) = people.match_embedding(&near).unwrap();
        assert_eq!(p.name, "a");
        assert!(dist < limit);
    }

    #[test]
    fn test_collision_radius_scenario() {
        let people = store(vec![
            person("a", &[[0.0, 0.0], [0.49, 0.0], [-0.49, 0.0]]),
            person("b", &[[0.0, 0.3]]),
        ]);
        let a = people.get("a").unwrap();
        assert!((a.radius - 0.5).abs() < 1e-6);
        assert!((a.collision_radius - 0.29).abs() < 1e-6);

        // Inside A's radius but beyond its collision radius.
        let err = people.match_embedding(&[0.0, -0.31]).unwrap_err();
        assert!(matches!(err, MatchError::Collision { .. }));
        assert!((err.distance() - 0.31).abs() < 1e-6);

        let (p, _) = people.match_embedding(&[0.0, -0.2]).unwrap();
        assert_eq!(p.name, "a");
    }

    #[test]
    fn test_collision_is_resolved_both_ways() {
        let people = store(vec![
            person("a", &[[0.0, 0.0], [0.49, 0.0], [-0.49, 0.0]]),
            person("b", &[[0.0, 0.3]]),
        ]);
        let b = people.get("b").unwrap();
        assert!((b.collision_radius - 0.29).abs() < 1e-6);
    }

    #[test]
    fn test_match_empty_store() {
        let people = store(vec![]);
        assert_eq!(
            people.match_embedding(&[0.0, 0.0]).unwrap_err(),
            MatchError::NothingMatch
        );
    }

    #[test]
    fn test_negative_distance_rejected() {
        let p = person("a", &[[0.0, 0.0]]);
        assert!(matches!(
            p.check_distance(-0.5, DEFAULT_MATCH_DIST),
            Err(MatchError::NegativeDistance { .. })
        ));
    }

    #[test]
    fn test_match_uses_nearest_sample_not_centroid() {
        // Centroid sits far from the query, one sample is close.
        let people = store(vec![
            person("spread", &[[0.0, 0.0], [2.0, 0.0]]),
            person("tight", &[[1.0, 0.9]]),
        ]);
        let (p, dist) = people.nearest(&[1.95, 0.0]).unwrap();
        assert_eq!(p.name, "spread");
        assert!((dist - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_setup_idempotent() {
        let mut people = store(vec![
            person("a", &[[0.0, 0.0], [0.49, 0.0], [-0.49, 0.0]]),
            person("b", &[[0.0, 0.3], [0.1, 0.35]]),
            person("c", &[[3.0, 3.0]]),
        ]);
        let first = people.persons().to_vec();
        people.setup();
        assert_eq!(people.persons(), first.as_slice());
    }

    #[test]
    fn test_setup_ignores_stale_collision_radius() {
        let mut stale = person("a", &[[0.0, 0.0], [0.2, 0.0]]);
        stale.collision_radius = 0.7;
        let people = store(vec![stale, person("far", &[[9.0, 9.0]])]);
        assert_eq!(people.get("a").unwrap().collision_radius, 0.0);
    }

    #[test]
    fn test_append_upserts_in_order() {
        let mut people = store(vec![person("a", &[[0.0, 0.0]]), person("b", &[[1.0, 1.0]])]);
        people.append(vec![person("c", &[[2.0, 2.0]]), person("a", &[[5.0, 5.0]])]);

        let names: Vec<&str> = people.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(people.get("a").unwrap().centroid, vec![5.0, 5.0]);
    }

    #[test]
    fn test_delete() {
        let mut people = store(vec![
            person("a", &[[0.0, 0.0]]),
            person("b", &[[1.0, 1.0]]),
            person("c", &[[2.0, 2.0]]),
        ]);

        assert!(!people.delete("zed"));
        assert_eq!(people.len(), 3);

        assert!(people.delete(" b "));
        let names: Vec<&str> = people.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(!people.delete("b"));
    }

    #[test]
    fn test_average_distance_skips_exact_matches() {
        let p = person("a", &[[0.0, 0.0], [0.0, 0.2]]);
        assert!((p.average_distance(&[0.0, 0.0]) - 0.2).abs() < 1e-6);
        assert_eq!(person("b", &[[1.0, 1.0]]).average_distance(&[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_neighbour_excludes_name() {
        let people = store(vec![
            person("a", &[[0.0, 0.0], [0.0, 0.2]]),
            person("b", &[[1.0, 0.0]]),
            person("empty", &[]),
        ]);

        let (p, dist) = people.neighbour(&[0.1, 0.0], "").unwrap();
        assert_eq!(p.name, "a");
        assert!((dist - (0.1 + 0.05f64.sqrt()) / 2.0).abs() < 1e-6);

        let (p, dist) = people.neighbour(&[0.1, 0.0], "a").unwrap();
        assert_eq!(p.name, "b");
        assert!((dist - 0.9).abs() < 1e-6);

        assert!(store(vec![]).neighbour(&[0.0, 0.0], "a").is_none());
    }
}
