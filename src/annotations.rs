//! Annotation-export parsing.
//!
//! The labeling tool exports a JSON array of entries pairing an image
//! reference with the chosen label. Image references carry the original file
//! path query-encoded behind a `d` parameter; only the base name is kept,
//! since relocated training images all live in one directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while reading an annotation export.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Failed to read annotation export {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed annotation export {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Annotation entry has no decodable image path: {image:?}")]
    MissingImagePath { image: String },
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    image: String,
    choice: String,
}

/// One `(file name, label)` pair from an annotation export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledFile {
    pub file_name: String,
    pub label: String,
}

/// Parse an annotation export file into `(file name, label)` pairs.
pub fn read_annotation_file(path: &Path) -> Result<Vec<LabeledFile>, AnnotationError> {
    let bytes = std::fs::read(path).map_err(|source| AnnotationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<RawEntry> =
        serde_json::from_slice(&bytes).map_err(|source| AnnotationError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    entries
        .into_iter()
        .map(|entry| {
            let file_name = file_name_from_image_ref(&entry.image).ok_or(
                AnnotationError::MissingImagePath {
                    image: entry.image,
                },
            )?;
            Ok(LabeledFile {
                file_name,
                label: entry.choice,
            })
        })
        .collect()
}

/// Extract the referenced file's base name from an `image` reference.
///
/// References look like `/data/local-files/?d=train_set%2Fdata%2Fimg_001.jpg`;
/// the `d` query parameter holds the percent-encoded original path.
fn file_name_from_image_ref(image: &str) -> Option<String> {
    let (_, query) = image.split_once('?')?;
    let decoded = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "d")
        .map(|(_, value)| value.into_owned())?;
    let name = Path::new(&decoded).file_name()?.to_str()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn decodes_percent_encoded_image_refs() {
        let name = file_name_from_image_ref(
            "/data/local-files/?d=train_set%2Fdata%2Fimg_001.jpg",
        );
        assert_eq!(name.as_deref(), Some("img_001.jpg"));
    }

    #[test]
    fn keeps_plain_query_paths() {
        let name = file_name_from_image_ref("http://localhost:8080/?d=/pool/img_2.jpg");
        assert_eq!(name.as_deref(), Some("img_2.jpg"));
    }

    #[test]
    fn rejects_refs_without_query() {
        assert_eq!(file_name_from_image_ref("/data/img_001.jpg"), None);
    }

    #[test]
    fn parses_export_into_labeled_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("annotation-0.json");
        std::fs::write(
            &path,
            r#"[
  {"image": "/data/local-files/?d=train_set%2Fdata%2Fimg_001.jpg", "choice": "track"},
  {"image": "/data/local-files/?d=train_set%2Fdata%2Fimg_002.jpg", "choice": "no track"}
]"#,
        )
        .unwrap();
        let labeled = read_annotation_file(&path).unwrap();
        assert_eq!(
            labeled,
            vec![
                LabeledFile {
                    file_name: "img_001.jpg".to_string(),
                    label: "track".to_string(),
                },
                LabeledFile {
                    file_name: "img_002.jpg".to_string(),
                    label: "no track".to_string(),
                },
            ]
        );
    }

    #[test]
    fn malformed_entry_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("annotation-0.json");
        std::fs::write(&path, r#"[{"image": "img.jpg"}]"#).unwrap();
        assert!(matches!(
            read_annotation_file(&path).unwrap_err(),
            AnnotationError::Json { .. }
        ));
    }
}
