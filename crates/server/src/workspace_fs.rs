//! Directory listing and file I/O against a workspace's local cache.
//!
//! Client paths are workspace-relative and forward-slash separated. They are
//! normalized to a canonical form with one leading `/` (`/src/app.js`); the
//! root is the empty string. `..` is rejected so nothing resolves outside the
//! cache root.
//!
//! Concurrent writers to the same path race and the last completed write
//! wins. A version check at this boundary would be the place to add
//! lost-update protection.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use replhost_protocol::FileNode;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Stable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "not_found",
            FsError::InvalidPath(_) => "invalid_path",
            FsError::Io { .. } => "io_error",
        }
    }

    fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            FsError::NotFound(path.to_string())
        } else {
            FsError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// A validated workspace-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelPath {
    segments: Vec<String>,
}

impl RelPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => return Err(FsError::InvalidPath(raw.to_string())),
                s if s.contains('\0') => return Err(FsError::InvalidPath(raw.to_string())),
                s => segments.push(s.to_string()),
            }
        }
        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// `/a/b` form; empty for the root
    pub fn canonical(&self) -> String {
        self.segments.iter().fold(String::new(), |mut acc, s| {
            acc.push('/');
            acc.push_str(s);
            acc
        })
    }

    pub fn resolve(&self, root: &Path) -> PathBuf {
        self.segments.iter().fold(root.to_path_buf(), |p, s| p.join(s))
    }

    fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

/// Immediate children of `relative` under `root`, sorted by path.
pub async fn list_directory(root: &Path, relative: &str) -> Result<Vec<FileNode>> {
    let rel = RelPath::parse(relative)?;
    let dir = rel.resolve(root);
    let base = rel.canonical();

    let meta = fs::metadata(&dir).await.map_err(|e| FsError::io(&base, e))?;
    if !meta.is_dir() {
        return Err(FsError::NotFound(base));
    }

    let mut entries = fs::read_dir(&dir).await.map_err(|e| FsError::io(&base, e))?;
    let mut nodes = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FsError::io(&base, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = format!("{base}/{name}");
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| FsError::io(&path, e))?;
        nodes.push(if file_type.is_dir() {
            FileNode::directory(name, path)
        } else {
            FileNode::file(name, path)
        });
    }
    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(nodes)
}

/// Full contents of a file. Directories and missing paths are `NotFound`.
pub async fn read_file(root: &Path, relative: &str) -> Result<Vec<u8>> {
    let rel = RelPath::parse(relative)?;
    let display = rel.canonical();
    if rel.is_root() {
        return Err(FsError::NotFound(display));
    }
    let path = rel.resolve(root);

    let meta = fs::metadata(&path)
        .await
        .map_err(|e| FsError::io(&display, e))?;
    if meta.is_dir() {
        return Err(FsError::NotFound(display));
    }
    fs::read(&path).await.map_err(|e| FsError::io(&display, e))
}

/// [`read_file`] for text. Content that is not UTF-8 is an `Io` error.
pub async fn read_text(root: &Path, relative: &str) -> Result<String> {
    let bytes = read_file(root, relative).await?;
    String::from_utf8(bytes).map_err(|e| FsError::Io {
        path: RelPath::parse(relative).map(|r| r.canonical()).unwrap_or_default(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

/// Create missing parents, then replace the file through a temp file and
/// rename so readers never observe a partial write.
pub async fn write_file(root: &Path, relative: &str, data: &[u8]) -> Result<()> {
    let rel = RelPath::parse(relative)?;
    let display = rel.canonical();
    let name = rel
        .file_name()
        .ok_or_else(|| FsError::InvalidPath(relative.to_string()))?;
    let path = rel.resolve(root);
    let parent = path
        .parent()
        .ok_or_else(|| FsError::InvalidPath(relative.to_string()))?;

    fs::create_dir_all(parent)
        .await
        .map_err(|e| FsError::io(&display, e))?;

    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    if let Err(e) = fs::write(&tmp, data).await {
        return Err(FsError::io(&display, e));
    }
    if let Err(e) = fs::rename(&tmp, &path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(FsError::io(&display, e));
    }
    Ok(())
}

/// Merge a listing into a set of known nodes keyed by path. A node seen again
/// replaces the earlier one.
pub fn merge_nodes(known: &mut BTreeMap<String, FileNode>, nodes: &[FileNode]) {
    for node in nodes {
        known.insert(node.path.clone(), node.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replhost_protocol::NodeKind;

    #[test]
    fn normalizes_paths() {
        assert_eq!(RelPath::parse("").unwrap().canonical(), "");
        assert_eq!(RelPath::parse("/").unwrap().canonical(), "");
        assert_eq!(RelPath::parse("src//app.js").unwrap().canonical(), "/src/app.js");
        assert_eq!(RelPath::parse("/./src/").unwrap().canonical(), "/src");
        assert!(RelPath::parse("../etc/passwd").is_err());
        assert!(RelPath::parse("/src/../../x").is_err());
    }

    #[tokio::test]
    async fn lists_immediate_children_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("index.js"), "x").unwrap();
        std::fs::write(dir.path().join("src/app.js"), "y").unwrap();

        let root = list_directory(dir.path(), "").await.unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root[0].path, "/index.js");
        assert_eq!(root[0].kind, NodeKind::File);
        assert_eq!(root[1].path, "/src");
        assert_eq!(root[1].kind, NodeKind::Directory);
        assert!(root.iter().all(|n| n.content.is_none()));

        let src = list_directory(dir.path(), "/src").await.unwrap();
        let paths: Vec<_> = src.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["/src/app.js", "/src/nested"]);
    }

    #[tokio::test]
    async fn listing_missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_directory(dir.path(), "nope").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn read_rejects_directories_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        assert!(matches!(
            read_file(dir.path(), "/src").await.unwrap_err(),
            FsError::NotFound(_)
        ));
        assert!(matches!(
            read_file(dir.path(), "/missing.js").await.unwrap_err(),
            FsError::NotFound(_)
        ));
        assert_eq!(
            read_file(dir.path(), "../x").await.unwrap_err().code(),
            "invalid_path"
        );
    }

    #[tokio::test]
    async fn write_then_read_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "/deep/er/index.js", b"console.log(1)")
            .await
            .unwrap();
        assert_eq!(
            read_file(dir.path(), "deep/er/index.js").await.unwrap(),
            b"console.log(1)"
        );

        write_file(dir.path(), "/deep/er/index.js", b"2").await.unwrap();
        assert_eq!(read_file(dir.path(), "/deep/er/index.js").await.unwrap(), b"2");

        // No temp files left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path().join("deep/er"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn write_to_root_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_file(dir.path(), "/", b"x").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
    }

    #[test]
    fn merge_keeps_last_seen_node_per_path() {
        let mut known = BTreeMap::new();
        merge_nodes(
            &mut known,
            &[FileNode::file("a", "/a"), FileNode::directory("src", "/src")],
        );
        let mut refreshed = FileNode::file("a", "/a");
        refreshed.content = Some("new".into());
        merge_nodes(&mut known, &[refreshed, FileNode::file("b.js", "/src/b.js")]);

        assert_eq!(known.len(), 3);
        assert_eq!(known["/a"].content.as_deref(), Some("new"));
    }
}
