//! Guest-local resolution of artifact and folder requests.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use walkdir::WalkDir;

use crate::error::BridgeError;

/// Open the file at `path` for upload.
///
/// A missing path is [`BridgeError::ResourceNotFound`]; every other
/// failure, including `path` naming a directory, is an I/O error.
pub async fn open_artifact(path: &str) -> Result<File, BridgeError> {
    let metadata = tokio::fs::metadata(path).await.map_err(not_found_or_io)?;
    if metadata.is_dir() {
        return Err(io::Error::other(format!("{path} is a directory")).into());
    }
    File::open(path).await.map_err(not_found_or_io)
}

/// Every file below `root`, as absolute paths in a stable depth-first order.
///
/// Directories are walked but never listed. An empty directory yields an
/// empty list; a missing root is [`BridgeError::ResourceNotFound`].
pub async fn list_folder(root: &str) -> Result<Vec<String>, BridgeError> {
    let root = absolute(Path::new(root))?;
    tokio::task::spawn_blocking(move || walk(&root))
        .await
        .map_err(|e| io::Error::other(format!("listing task failed: {e}")))?
}

fn walk(root: &Path) -> Result<Vec<String>, BridgeError> {
    let metadata = std::fs::metadata(root).map_err(not_found_or_io)?;
    if !metadata.is_dir() {
        return Err(io::Error::other(format!("{} is not a directory", root.display())).into());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() {
            files.push(entry.path().to_string_lossy().into_owned());
        }
    }
    Ok(files)
}

fn absolute(path: &Path) -> Result<PathBuf, BridgeError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn not_found_or_io(err: io::Error) -> BridgeError {
    if err.kind() == io::ErrorKind::NotFound {
        BridgeError::ResourceNotFound
    } else {
        BridgeError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn artifact_bytes_are_exact() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        std::fs::write(&file, &data).unwrap();

        let mut read = Vec::new();
        open_artifact(&path_str(&file))
            .await
            .unwrap()
            .read_to_end(&mut read)
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_artifact(&path_str(&dir.path().join("nope"))).await.unwrap_err();
        assert!(matches!(err, BridgeError::ResourceNotFound));
    }

    #[tokio::test]
    async fn directory_artifact_is_not_resource_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_artifact(&path_str(dir.path())).await.unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[tokio::test]
    async fn listing_is_recursive_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub/deeper")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"b").unwrap();

        let files = list_folder(&path_str(root)).await.unwrap();
        assert_eq!(
            files,
            vec![path_str(&root.join("a.txt")), path_str(&root.join("sub/b.txt"))]
        );
    }

    #[tokio::test]
    async fn empty_and_missing_roots_differ() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_folder(&path_str(dir.path())).await.unwrap().is_empty());

        let err = list_folder(&path_str(&dir.path().join("missing"))).await.unwrap_err();
        assert!(matches!(err, BridgeError::ResourceNotFound));
    }
}
