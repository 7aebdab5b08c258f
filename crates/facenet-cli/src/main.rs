use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facenet_core::{
    Config, Estimator, FaceExtractor, FaceMarkers, FaceRecognizer, Person, RustfaceCascade,
    Storage,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facenet", about = "Face detection and identity matching CLI")]
struct Cli {
    /// Identity store file (default: $XDG_DATA_HOME/facenet/people.json)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// FaceNet ONNX model
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    /// SeetaFace cascade model
    #[arg(long, global = true)]
    cascade: Option<PathBuf>,
    /// TOML file with detection and matching tunables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known identities
    Info,
    /// Delete identities
    Delete {
        /// Comma-separated names
        names: String,
    },
    /// Detect and identify faces in an image
    Detect {
        image: PathBuf,
        /// Directory for face thumbnails
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        min_size: u32,
    },
    /// Train identities from a directory with one sub-directory per label
    Train {
        dir: PathBuf,
        /// Only retrain these comma-separated labels
        #[arg(long)]
        update: Option<String>,
        /// Directory for face thumbnails, one sub-directory per label
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        min_size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::from_env(),
    };
    let db = cli.db.clone().unwrap_or_else(default_db_path);
    let mut storage = Storage::load(&db, config.match_dist)
        .with_context(|| format!("loading identity store {}", db.display()))?;

    match cli.command {
        Commands::Info => {
            let people = storage.people();
            println!("{} people in {}", people.len(), db.display());
            for person in people {
                println!(
                    "{}: embeddings={}, radius={:.4}, collision_radius={:.4}",
                    person.name,
                    person.embeddings.len(),
                    person.radius,
                    person.collision_radius
                );
            }
        }
        Commands::Delete { names } => {
            for name in split_names(&names) {
                if storage.people_mut().delete(&name) {
                    println!("{name}: deleted");
                } else {
                    println!("{name}: not found");
                }
            }
            storage.save(&db)?;
        }
        Commands::Detect {
            image,
            output,
            min_size,
        } => {
            let estimator = build_estimator(cli.model.as_deref(), cli.cascade.as_deref(), config, storage)?;
            detect(&estimator, &image, output.as_deref(), min_size)?;
        }
        Commands::Train {
            dir,
            update,
            output,
            min_size,
        } => {
            let estimator = build_estimator(cli.model.as_deref(), cli.cascade.as_deref(), config, storage)?;
            let update: HashSet<String> = update.as_deref().map(split_names).unwrap_or_default().into_iter().collect();
            train(Arc::new(estimator), &dir, &update, output, min_size, &db).await?;
        }
    }

    Ok(())
}

fn build_estimator(
    model: Option<&Path>,
    cascade: Option<&Path>,
    config: Config,
    storage: Storage,
) -> Result<Estimator> {
    let Some(model) = model else {
        bail!("--model is required");
    };
    let Some(cascade) = cascade else {
        bail!("--cascade is required");
    };

    let cascade = RustfaceCascade::load(cascade)?;
    let recognizer = FaceRecognizer::onnx(model, config.crop_size);
    recognizer.load().context("loading FaceNet model")?;

    let extractor = FaceExtractor::new(Box::new(cascade), config);
    Ok(Estimator::new(extractor, storage).with_recognizer(recognizer))
}

fn detect(estimator: &Estimator, path: &Path, output: Option<&Path>, min_size: u32) -> Result<()> {
    let img = image::open(path).with_context(|| format!("opening {}", path.display()))?;
    let markers = estimator.detect_faces(&img, min_size)?;

    for marker in &markers {
        match marker.error() {
            Some(err) => println!("label: {}, {err}", marker.label()),
            None => println!("label: {}, distance: {:.4}", marker.label(), marker.distance()),
        }
    }

    if let Some(dir) = output {
        write_thumbs(&markers, &img, dir, estimator.config().crop_size, path)?;
    }
    Ok(())
}

fn write_thumbs(
    markers: &FaceMarkers,
    img: &image::DynamicImage,
    dir: &Path,
    crop_size: u32,
    source: &Path,
) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "face".to_string());

    for (i, thumb) in markers.face_images(img, crop_size).iter().enumerate() {
        let path = dir.join(format!("{stem}_{i}.jpg"));
        thumb
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

async fn train(
    estimator: Arc<Estimator>,
    dir: &Path,
    update: &HashSet<String>,
    output: Option<PathBuf>,
    min_size: u32,
    db: &Path,
) -> Result<()> {
    let labels = label_dirs(dir, update)?;
    if labels.is_empty() {
        bail!("no label directories under {}", dir.display());
    }

    let mut tasks = JoinSet::new();
    for (index, (label, path)) in labels.into_iter().enumerate() {
        let estimator = Arc::clone(&estimator);
        let output = output.clone();
        tasks.spawn_blocking(move || {
            let person = train_label(&estimator, &label, &path, output.as_deref(), min_size);
            (index, person)
        });
    }

    let mut trained = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (index, person) = joined.context("training task failed")?;
        if let Some(person) = person {
            trained.push((index, person));
        }
    }
    trained.sort_by_key(|(index, _)| *index);

    let count = trained.len();
    estimator.add_person(trained.into_iter().map(|(_, person)| person));
    estimator.save(db)?;
    tracing::info!(trained = count, "training finished");
    Ok(())
}

/// Embed every image of one label directory. `None` when nothing was usable.
fn train_label(
    estimator: &Estimator,
    label: &str,
    dir: &Path,
    output: Option<&Path>,
    min_size: u32,
) -> Option<Person> {
    let files = match image_files(dir) {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(label, error = %e, "cannot list label directory");
            return None;
        }
    };

    let mut embeddings = Vec::with_capacity(files.len());
    for file in &files {
        let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let img = match image::open(file) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(label, file = %name, error = %e, "cannot load image");
                continue;
            }
        };
        let (embedding, marker) = match estimator.extract_face(label, &img, min_size) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(label, file = %name, error = %e, "no face extracted");
                continue;
            }
        };
        embeddings.push(embedding);

        if let Some(out) = output {
            let folder = out.join(label);
            let written = std::fs::create_dir_all(&folder)
                .map_err(anyhow::Error::from)
                .and_then(|_| Ok(marker.thumb(&img, estimator.config().crop_size)?))
                .and_then(|thumb| Ok(thumb.save(folder.join(&name))?));
            if let Err(e) = written {
                tracing::warn!(label, file = %name, error = %e, "cannot write thumbnail");
            }
        }
        tracing::debug!(label, file = %name, "face extracted");
    }

    println!("{label}: {} of {} images embedded", embeddings.len(), files.len());
    if embeddings.is_empty() {
        return None;
    }
    Some(Person::new(label, embeddings))
}

/// Sub-directories of `dir` as `(label, path)`, sorted by label. A non-empty
/// `update` set restricts the result to those labels.
fn label_dirs(dir: &Path, update: &HashSet<String>) -> Result<Vec<(String, PathBuf)>> {
    let mut labels = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let label = entry.file_name().to_string_lossy().trim().to_string();
        if !update.is_empty() && !update.contains(&label) {
            continue;
        }
        labels.push((label, entry.path()));
    }
    labels.sort();
    Ok(labels)
}

fn image_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn split_names(names: &str) -> Vec<String> {
    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facenet")
        .join("people.json")
}
