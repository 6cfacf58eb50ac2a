use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{create_dir_all, read_to_string, rename, write};

/// Error while storing or loading state from a json file
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FileStoreError {
    /// Error while reading the json file
    #[error("error while reading {}: {:#}", path.display(), err)]
    Read { err: std::io::Error, path: PathBuf },
    /// Error while writing the json file
    #[error("error while writing {}: {:#}", path.display(), err)]
    Write { err: std::io::Error, path: PathBuf },
    /// Error when encoding or decoding the file contents
    #[error("error while parsing {}: {:#}", path.display(), err)]
    Json {
        err: serde_json::error::Error,
        path: PathBuf,
    },
    /// Error while creating the parent directory of the file
    #[error("error while creating directory {}: {:#}", path.display(), err)]
    DirCreation { err: std::io::Error, path: PathBuf },
}

/// Read and decode a json file, a missing file is `None`
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FileStoreError> {
    let raw = match read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(FileStoreError::Read {
                err,
                path: path.into(),
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| FileStoreError::Json {
            err,
            path: path.into(),
        })
}

/// Encode and write a json file
///
/// The contents are written to a sibling temporary file first and moved over the target,
/// so readers never observe a partially written file.
pub(crate) async fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), FileStoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        create_dir_all(parent)
            .await
            .map_err(|err| FileStoreError::DirCreation {
                err,
                path: parent.into(),
            })?;
    }

    let raw = serde_json::to_string(value).map_err(|err| FileStoreError::Json {
        err,
        path: path.into(),
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    write(&tmp, raw).await.map_err(|err| FileStoreError::Write {
        err,
        path: tmp.clone(),
    })?;
    rename(&tmp, path)
        .await
        .map_err(|err| FileStoreError::Write {
            err,
            path: path.into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<i64>> = read_json(&dir.path().join("missing.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        write_json(&path, &vec![1, 2, 3]).await.unwrap();

        let value: Option<Vec<i64>> = read_json(&path).await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert!(!dir.path().join("nested/deeper/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn garbage_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = read_json::<Vec<i64>>(&path).await.unwrap_err();
        assert!(matches!(err, FileStoreError::Json { .. }));
    }
}
