//! Identity store persistence as a single JSON file.

use crate::people::{People, Person};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Format version written to new store files.
pub const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("cannot read store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid store {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported store version {found} in {path}")]
    Version { path: PathBuf, found: u32 },
}

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    people: Vec<Person>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    people: &'a [Person],
}

/// In-memory identity store plus its persistence metadata.
#[derive(Debug, Clone)]
pub struct Storage {
    people: People,
    saved_at: Option<DateTime<Utc>>,
}

impl Storage {
    pub fn new(match_dist: f64) -> Self {
        Self {
            people: People::new(match_dist),
            saved_at: None,
        }
    }

    /// Read the store at `path`. A missing file yields an empty store.
    pub fn load(path: &Path, match_dist: f64) -> Result<Self, StorageError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no identity store, starting empty");
                return Ok(Self::new(match_dist));
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: StoreFile = serde_json::from_str(&text).map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if file.version != STORE_VERSION {
            return Err(StorageError::Version {
                path: path.to_path_buf(),
                found: file.version,
            });
        }

        let people = People::from_persons(file.people, match_dist);
        tracing::info!(path = %path.display(), people = people.len(), "loaded identity store");

        Ok(Self {
            people,
            saved_at: file.saved_at,
        })
    }

    /// Write the store to `path` through a sibling temp file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(write_error(dir))?;
        }

        let saved_at = Utc::now();
        let json = serde_json::to_vec_pretty(&StoreFileRef {
            version: STORE_VERSION,
            saved_at,
            people: self.people.persons(),
        })
        .map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(write_error(&temp_path))?;
        file.write_all(&json).map_err(write_error(&temp_path))?;
        file.sync_all().map_err(write_error(&temp_path))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(write_error(path))?;

        tracing::info!(
            path = %path.display(),
            people = self.people.len(),
            saved_at = %saved_at.to_rfc3339(),
            "saved identity store"
        );
        Ok(())
    }

    pub fn people(&self) -> &People {
        &self.people
    }

    pub fn people_mut(&mut self) -> &mut People {
        &mut self.people
    }

    /// Timestamp recorded in the file this store was loaded from.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError {
    let path = path.to_path_buf();
    move |source| StorageError::Write { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MATCH_DIST;

    fn sample() -> Storage {
        let mut storage = Storage::new(DEFAULT_MATCH_DIST);
        storage.people_mut().append(vec![
            Person::new("a", vec![vec![0.0, 0.0], vec![0.49, 0.0], vec![-0.49, 0.0]]),
            Person::new("b", vec![vec![0.0, 0.3]]),
            Person::new("c", vec![vec![2.0, 2.0], vec![2.1, 2.0]]),
        ]);
        storage
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::load(&dir.path().join("people.json"), DEFAULT_MATCH_DIST).unwrap();
        assert!(storage.people().is_empty());
        assert!(storage.saved_at().is_none());
    }

    #[test]
    fn test_round_trip_preserves_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("people.json");

        let storage = sample();
        storage.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = Storage::load(&path, DEFAULT_MATCH_DIST).unwrap();
        assert_eq!(loaded.people().persons(), storage.people().persons());
        assert!(loaded.saved_at().is_some());

        let probes: [[f32; 2]; 5] = [[0.0, -0.31], [0.0, -0.2], [2.05, 2.0], [9.0, 9.0], [0.0, 0.31]];
        for probe in &probes {
            let before = storage.people().match_embedding(probe).map(|(p, d)| (p.name.clone(), d));
            let after = loaded.people().match_embedding(probe).map(|(p, d)| (p.name.clone(), d));
            assert_eq!(before, after, "probe {probe:?}");
        }
    }

    #[test]
    fn test_load_runs_setup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.json");
        // Derived values on disk are stale and must be recomputed.
        fs::write(
            &path,
            r#"{"version":1,"saved_at":null,"people":[
                {"name":"a","embeddings":[[0.0,0.0],[0.2,0.0]],"centroid":[5.0,5.0],"radius":9.0,"collision_radius":3.0}
            ]}"#,
        )
        .unwrap();

        let storage = Storage::load(&path, DEFAULT_MATCH_DIST).unwrap();
        let a = storage.people().get("a").unwrap();
        assert!((a.centroid[0] - 0.1).abs() < 1e-6);
        assert!((a.radius - 0.11).abs() < 1e-6);
        assert_eq!(a.collision_radius, 0.0);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Storage::load(&path, DEFAULT_MATCH_DIST),
            Err(StorageError::Json { .. })
        ));
    }

    #[test]
    fn test_load_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.json");
        fs::write(&path, r#"{"version":7,"people":[]}"#).unwrap();
        assert!(matches!(
            Storage::load(&path, DEFAULT_MATCH_DIST),
            Err(StorageError::Version { found: 7, .. })
        ));
    }
}
