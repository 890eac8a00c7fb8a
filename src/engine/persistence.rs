use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;
use tempfile::NamedTempFile;

use crate::{Document, Error, Result};

const EXTENSION: &str = "json";

/// On-disk layout of a [`MemStore`](crate::engine::MemStore): one
/// `<collection>.json` array per collection, in natural order.
///
/// Every save goes to its own temporary file in the data directory, which is
/// then renamed over the collection file. Readers never see a partial file.
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    /// Opens `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let data_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    /// Replaces the stored contents of `collection` with `documents`.
    pub fn save_collection(&self, collection: &str, documents: &[Document]) -> Result<()> {
        if collection.is_empty() || collection.contains(['/', '\\']) || collection.starts_with('.') {
            return Err(Error::Store(format!("invalid collection name: {}", collection)));
        }
        let target = self.data_dir.join(format!("{}.{}", collection, EXTENSION));

        let mut file = NamedTempFile::new_in(&self.data_dir)?;
        serde_json::to_writer_pretty(&mut file, documents)?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Reads every `*.json` collection in the data directory.
    ///
    /// Files that cannot be read or parsed are skipped with a warning, and
    /// empty collections are left out.
    pub fn load_all(&self) -> Result<HashMap<String, Vec<Document>>> {
        let mut collections = HashMap::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!("Skipping collection file with a non UTF-8 name: {:?}", path);
                continue;
            };
            match read_collection(&path) {
                Ok(documents) if documents.is_empty() => {}
                Ok(documents) => {
                    collections.insert(name.to_string(), documents);
                }
                Err(e) => warn!("Skipping collection file {:?}: {}", path, e),
            }
        }
        Ok(collections)
    }
}

fn read_collection(path: &Path) -> Result<Vec<Document>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        vec![
            json!({"id": "a", "title": "first"}).as_object().cloned().unwrap(),
            json!({"id": "b", "title": "second"}).as_object().cloned().unwrap(),
        ]
    }

    #[test]
    fn test_save_and_load_all() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path()).unwrap();

        persistence.save_collection("data_post", &docs()).unwrap();

        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let post = loaded.get("data_post").unwrap();
        assert_eq!(post.len(), 2);
        assert_eq!(post[0]["title"], json!("first"));
        assert_eq!(post[1]["title"], json!("second"));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path()).unwrap();

        persistence.save_collection("users", &docs()).unwrap();

        persistence.save_collection("users", &docs()[..1]).unwrap();

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(files, vec![std::ffi::OsString::from("users.json")]);
        assert_eq!(persistence.load_all().unwrap()["users"].len(), 1);
    }

    #[test]
    fn test_skips_malformed_and_empty_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("empty.json"), "[]").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let persistence = Persistence::new(dir.path()).unwrap();
        persistence.save_collection("sessions", &docs()[..1]).unwrap();

        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("sessions"));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path()).unwrap();
        assert!(persistence.save_collection("../escape", &docs()).is_err());
        assert!(persistence.save_collection(".hidden", &docs()).is_err());
    }
}
