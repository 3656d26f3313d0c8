use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use likeness_core::{
    FaceImage, FaceRecognizer, Gallery, PersonId, RecognitionMode, RecognizerConfig,
    WholeFrameDetector,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod store;

use store::JsonGalleryStore;

#[derive(Parser)]
#[command(name = "likeness", about = "Handcrafted-feature face matching")]
struct Cli {
    /// Gallery file [default: $XDG_DATA_HOME/likeness/gallery.json]
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Recognition mode: fast, standard or ultra
    #[arg(long, global = true)]
    mode: Option<RecognitionMode>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image under a person's name
    Enroll {
        person: String,
        image: PathBuf,
    },
    /// Recognize a face image against the gallery
    Recognize {
        image: PathBuf,
    },
    /// Print quality and spoof heuristics for a face image
    Quality {
        image: PathBuf,
    },
    /// List enrolled samples
    List,
    /// Remove an enrolled sample
    Remove {
        /// Sample ID (from `list`)
        id: Uuid,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.mode)?;
    let gallery_path = cli.gallery.clone().unwrap_or_else(default_gallery_path);

    match cli.command {
        Commands::Enroll { person, image } => {
            let recognizer = FaceRecognizer::new(config);
            let face = open_image(&image)?;
            let mut store = JsonGalleryStore::open(&gallery_path)?;
            let person = PersonId::new(person);
            let embedding = recognizer
                .enroll_into(&person, &face, &mut store)
                .with_context(|| format!("failed to enroll {}", image.display()))?;
            let quality = recognizer.assess_quality(&face);
            if cli.json {
                print_json(&serde_json::json!({
                    "person": person,
                    "dim": embedding.len(),
                    "quality": quality,
                    "gallery": store.path(),
                }))?;
            } else {
                println!(
                    "Enrolled {person} ({} dims, quality {quality:.2}) into {}",
                    embedding.len(),
                    store.path().display()
                );
            }
        }
        Commands::Recognize { image } => {
            let recognizer = FaceRecognizer::new(config);
            let frame = open_image(&image)?;
            let store = JsonGalleryStore::open(&gallery_path)?;
            let gallery = Gallery::load(&store)?;
            let result = recognizer.recognize_frame(&frame, &WholeFrameDetector, &gallery);
            if cli.json {
                print_json(&result)?;
            } else {
                println!(
                    "{} (confidence {:.3}, quality {:.2}, {:?})",
                    result.label(),
                    result.confidence,
                    result.quality,
                    result.decision
                );
                if result.spoof_suspected {
                    println!("warning: input looks like a photo or screen replay");
                }
            }
        }
        Commands::Quality { image } => {
            let recognizer = FaceRecognizer::new(config);
            let face = open_image(&image)?;
            let quality = recognizer.quality_report(&face);
            let spoof = recognizer.spoof_report(&face);
            if cli.json {
                print_json(&serde_json::json!({ "quality": quality, "spoof": spoof }))?;
            } else {
                println!("quality      {:.3} ({})", quality.overall, quality.tier());
                println!("  size       {:.3}", quality.size);
                println!("  sharpness  {:.3}", quality.sharpness);
                println!("  lighting   {:.3}", quality.illumination);
                if let Some(spoof) = spoof {
                    println!(
                        "spoof        {} (variance {:.1}, edge ratio {:.3})",
                        if spoof.suspected() { "suspected" } else { "not suspected" },
                        spoof.variance,
                        spoof.edge_ratio
                    );
                }
            }
        }
        Commands::List => {
            let store = JsonGalleryStore::open(&gallery_path)?;
            if cli.json {
                print_json(&store.records())?;
            } else if store.records().is_empty() {
                println!("No samples enrolled");
            } else {
                for record in store.records() {
                    println!(
                        "{}  {:<20} {} dims  {}",
                        record.id,
                        record.person.as_str(),
                        record.embedding.len(),
                        record.created_at.to_rfc3339()
                    );
                }
            }
        }
        Commands::Remove { id } => {
            let mut store = JsonGalleryStore::open(&gallery_path)?;
            let removal = remove_sample(&mut store, id)?;
            if cli.json {
                print_json(&removal)?;
            } else {
                println!("Removed {id} ({} samples left)", removal.remaining);
            }
        }
    }

    Ok(())
}

/// Defaults, then the optional TOML file, then `LIKENESS_*`, then `--mode`.
fn load_config(path: Option<&Path>, mode: Option<RecognitionMode>) -> Result<RecognizerConfig> {
    let config = match path {
        Some(path) => RecognizerConfig::from_file(path)?,
        None => RecognizerConfig::default(),
    };
    let mut config = config.with_env_overrides().context("invalid LIKENESS_* environment")?;
    if let Some(mode) = mode {
        config.mode = mode;
    }
    Ok(config)
}

fn default_gallery_path() -> PathBuf {
    let data = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")));
    match data {
        Some(dir) => dir.join("likeness").join("gallery.json"),
        None => PathBuf::from("likeness-gallery.json"),
    }
}

fn open_image(path: &Path) -> Result<FaceImage> {
    FaceImage::open(path).with_context(|| format!("failed to read image {}", path.display()))
}

#[derive(Debug, Serialize)]
struct Removal {
    removed: Uuid,
    remaining: usize,
    gallery: PathBuf,
}

fn remove_sample(store: &mut JsonGalleryStore, id: Uuid) -> Result<Removal> {
    if !store.remove(id)? {
        anyhow::bail!("no enrolled sample with id {id}");
    }
    Ok(Removal {
        removed: id,
        remaining: store.records().len(),
        gallery: store.path().to_path_buf(),
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use likeness_core::{Embedding, GalleryStore};

    fn store_with(dir: &Path, people: &[&str]) -> JsonGalleryStore {
        let mut store = JsonGalleryStore::open(dir.join("gallery.json")).unwrap();
        for person in people {
            store
                .save_embedding(&PersonId::new(*person), &Embedding::new(vec![1.0, 0.0]))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_remove_reports_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(dir.path(), &["alice", "bob"]);
        let id = store.records()[0].id;

        let removal = remove_sample(&mut store, id).unwrap();
        let json = serde_json::to_value(&removal).unwrap();
        assert_eq!(json["removed"], serde_json::json!(id));
        assert_eq!(json["remaining"], 1);
        assert_eq!(json["gallery"], serde_json::json!(dir.path().join("gallery.json")));
    }

    #[test]
    fn test_remove_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(dir.path(), &["alice"]);
        assert!(remove_sample(&mut store, Uuid::new_v4()).is_err());
        assert_eq!(store.records().len(), 1);
    }
}
