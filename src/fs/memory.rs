use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::values::stable_hash;
use super::{Dirent, FileStatus, FileSystem, FileType};

#[derive(Debug, Clone)]
enum Node {
    File { content: Vec<u8>, modified: u64 },
    Directory,
    Symlink(PathBuf),
}

/// A filesystem held in memory, for tests and sandboxed tooling.
///
/// Paths must be absolute. Writing a file creates its parent directories. Every mutation
/// advances a logical clock that stands in for modification times.
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
    clock: AtomicU64,
}

impl InMemoryFileSystem {
    /// An empty filesystem containing only `/`.
    pub fn new() -> Self {
        let fs = Self::default();
        fs.nodes.write().insert(PathBuf::from("/"), Node::Directory);
        fs
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            nodes.entry(ancestor.to_path_buf()).or_insert(Node::Directory);
        }
    }

    /// Create or overwrite a regular file.
    pub fn write_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        let modified = self.tick();
        let mut nodes = self.nodes.write();
        Self::insert_parents(&mut nodes, path);
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                content: content.into(),
                modified,
            },
        );
    }

    /// Create a directory and its parents.
    pub fn create_dir_all(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.tick();
        let mut nodes = self.nodes.write();
        Self::insert_parents(&mut nodes, path);
        nodes.insert(path.to_path_buf(), Node::Directory);
    }

    /// Create a symlink at `link` pointing to `target`.
    pub fn symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) {
        let link = link.as_ref();
        self.tick();
        let mut nodes = self.nodes.write();
        Self::insert_parents(&mut nodes, link);
        nodes.insert(link.to_path_buf(), Node::Symlink(target.as_ref().to_path_buf()));
    }

    /// Remove an entry and everything below it.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.tick();
        self.nodes
            .write()
            .retain(|existing, _| !existing.starts_with(path));
    }

    /// Returns true if something exists at `path`.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.read().contains_key(path.as_ref())
    }
}

impl FileSystem for InMemoryFileSystem {
    fn lstat(&self, path: &Path) -> io::Result<Option<FileStatus>> {
        let nodes = self.nodes.read();
        Ok(nodes.get(path).map(|node| match node {
            Node::File { content, modified } => FileStatus {
                file_type: FileType::File,
                size: content.len() as u64,
                modified: *modified,
                digest: Some(stable_hash(content.as_slice())),
            },
            Node::Directory => FileStatus {
                file_type: FileType::Directory,
                size: 0,
                modified: 0,
                digest: None,
            },
            Node::Symlink(target) => FileStatus {
                file_type: FileType::Symlink,
                size: target.as_os_str().len() as u64,
                modified: 0,
                digest: None,
            },
        }))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        match self.nodes.read().get(path) {
            Some(Node::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a symlink", path.display()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<Dirent>> {
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(Node::Directory) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", path.display()),
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                ))
            }
        }
        Ok(nodes
            .range(path.to_path_buf()..)
            .skip(1)
            .take_while(|(child, _)| child.starts_with(path))
            .filter(|(child, _)| child.parent() == Some(path))
            .filter_map(|(child, node)| {
                let name = child.file_name()?.to_str()?.to_string();
                let file_type = match node {
                    Node::File { .. } => FileType::File,
                    Node::Directory => FileType::Directory,
                    Node::Symlink(_) => FileType::Symlink,
                };
                Some(Dirent { name, file_type })
            })
            .collect())
    }
}
