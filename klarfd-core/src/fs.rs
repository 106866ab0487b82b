use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Async filesystem port used by the gate, the scanners and the executor.
///
/// Moves must be renames so a file is never visible in two directories (or
/// in none) at the same time.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Check whether a path exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Fetch lightweight file metadata.
    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata>;

    /// List the regular files directly inside `dir` (no recursion).
    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileEntry>>;

    /// Atomically move `from` to `to`.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Lightweight metadata needed by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    /// Last modified time if available
    pub modified: Option<SystemTime>,
    /// Device and inode number, where the platform exposes them. Changes when
    /// a directory is deleted and created again under the same path.
    pub identity: Option<(u64, u64)>,
}

/// A regular file found by [`FileSystem::list_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Real filesystem implementation backed by tokio::fs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for RealFs {
    async fn exists(&self, path: &Path) -> bool {
        // try_exists avoids errors for permission issues by returning false
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let md = tokio::fs::metadata(path).await?;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            modified: md.modified().ok(),
            identity: identity(&md),
        })
    }

    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
        let mut rd = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            // Entries can disappear between listing and stat; skip them.
            let Ok(md) = entry.metadata().await else {
                continue;
            };
            if !md.is_file() {
                continue;
            }
            files.push(FileEntry {
                path: entry.path(),
                len: md.len(),
                modified: md.modified().ok(),
            });
        }
        Ok(files)
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

#[cfg(unix)]
fn identity(md: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((md.dev(), md.ino()))
}

#[cfg(not(unix))]
fn identity(_md: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// In-memory filesystem for tests.
/// Note: Paths are treated literally; callers should use consistent absolute or relative paths.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFs {
    state: Arc<Mutex<MemState>>,
}

#[derive(Debug, Default)]
struct MemState {
    nodes: HashMap<PathBuf, Node>,
    // Logical clock so listings have a deterministic modification order.
    clock: u64,
}

#[derive(Debug, Clone)]
enum Node {
    /// Directories carry a generation so a recreated one is distinguishable.
    Dir(u64),
    File { len: u64, modified: SystemTime },
}

impl MemState {
    fn tick(&mut self) -> SystemTime {
        self.clock += 1;
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.clock)
    }

    fn new_dir(&mut self) -> Node {
        self.clock += 1;
        Node::Dir(self.clock)
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut current = path.parent();
        while let Some(parent) = current {
            if parent.as_os_str().is_empty() {
                break;
            }
            if !self.nodes.contains_key(parent) {
                let node = self.new_dir();
                self.nodes.insert(parent.to_path_buf(), node);
            }
            current = parent.parent();
        }
    }
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut state = self.state.lock();
        state.ensure_parents(&path);
        if !state.nodes.contains_key(&path) {
            let node = state.new_dir();
            state.nodes.insert(path, node);
        }
    }

    pub fn add_file<P: Into<PathBuf>>(&self, path: P, len: u64) {
        let path = path.into();
        let mut state = self.state.lock();
        state.ensure_parents(&path);
        let modified = state.tick();
        state.nodes.insert(path, Node::File { len, modified });
    }

    /// Change the length of an existing file, as a writer appending to it would.
    pub fn set_len(&self, path: &Path, len: u64) {
        let mut state = self.state.lock();
        let modified = state.tick();
        if let Some(Node::File { len: current, modified: stamp }) = state.nodes.get_mut(path) {
            *current = len;
            *stamp = modified;
        }
    }

    /// Remove a file or an entire directory subtree.
    pub fn remove(&self, path: &Path) {
        let mut state = self.state.lock();
        state.nodes.retain(|candidate, _| !candidate.starts_with(path));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Sorted file names directly inside `dir`.
    pub fn file_names(&self, dir: &Path) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .nodes
            .iter()
            .filter(|(path, node)| {
                matches!(node, Node::File { .. }) && path.parent() == Some(dir)
            })
            .filter_map(|(path, _)| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn exists(&self, path: &Path) -> bool {
        self.contains(path)
    }

    async fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        match self.state.lock().nodes.get(path) {
            Some(Node::Dir(generation)) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
                modified: None,
                identity: Some((0, *generation)),
            }),
            Some(Node::File { len, modified }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: *len,
                modified: Some(*modified),
                identity: None,
            }),
            None => Err(not_found(path)),
        }
    }

    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
        let state = self.state.lock();
        match state.nodes.get(dir) {
            Some(Node::Dir(_)) => {}
            Some(Node::File { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a directory: {}", dir.display()),
                ));
            }
            None => return Err(not_found(dir)),
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, node)| match node {
                Node::File { len, modified } => Some(FileEntry {
                    path: path.clone(),
                    len: *len,
                    modified: Some(*modified),
                }),
                Node::Dir(_) => None,
            })
            .collect())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        let parent_exists = to
            .parent()
            .is_none_or(|parent| matches!(state.nodes.get(parent), Some(Node::Dir(_))));
        if !parent_exists {
            return Err(not_found(to));
        }
        let node = state.nodes.remove(from).ok_or_else(|| not_found(from))?;
        state.nodes.insert(to.to_path_buf(), node);
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("is a directory: {}", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.add_dir(path);
        Ok(())
    }
}
