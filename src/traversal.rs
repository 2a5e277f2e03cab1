//! Recursive filesystem traversal as a node function.
//!
//! A traversal of a directory requests one child traversal per directory entry and
//! aggregates their results into a [`NestedSet`] by reference. Changing one file
//! therefore recomputes only the traversal nodes on the path from that file up to the
//! root; sibling subtrees are verified clean and their sets are reused as-is.
//!
//! ```ignore
//! let request = TraversalRequest::new(RootedPath::new("/ws", "src"))
//!     .package_boundary(PackageBoundaryMode::DontCross)
//!     .error_info("filegroup //src:all");
//! let result = evaluator.evaluate(vec![request.key()], &options)?;
//! let files = result.get_as::<TraversalValue>(&request.key()).unwrap();
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::error::{ComputeError, Failure};
use crate::fs::{
    directory_listing_key, file_key, package_lookup_key, DirectoryListingValue, FileValue, PackageLookupValue,
    RootedPath,
};
use crate::function::{Environment, NodeFunction};
use crate::key::{FunctionKind, NodeKey};
use crate::nested_set::{NestedSet, NestedSetBuilder, Order};
use crate::value::{value, Value};

/// Kind of traversal nodes. Argument: [`TraversalRequest`]. Value: [`TraversalValue`].
pub const RECURSIVE_FILESYSTEM_TRAVERSAL: FunctionKind = FunctionKind::new("RECURSIVE_FILESYSTEM_TRAVERSAL");

/// What to do when a traversal reaches a directory that is a package of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackageBoundaryMode {
    /// Descend into the package, emitting a warning.
    Cross,
    /// Skip the package silently.
    DontCross,
    /// Fail the traversal.
    #[default]
    ReportError,
}

/// A regex that must match the whole root-relative path of a file for it to be included.
#[derive(Clone)]
pub struct TraversalPattern {
    source: String,
    regex: Regex,
}

impl TraversalPattern {
    /// Compile `pattern`. It is anchored at both ends.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the pattern matches all of `relative`.
    pub fn matches(&self, relative: &Path) -> bool {
        relative.to_str().is_some_and(|s| self.regex.is_match(s))
    }
}

impl PartialEq for TraversalPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TraversalPattern {}

impl Hash for TraversalPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl fmt::Debug for TraversalPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)
    }
}

/// The argument of a traversal node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraversalRequest {
    path: RootedPath,
    is_generated: bool,
    pattern: Option<TraversalPattern>,
    boundary: PackageBoundaryMode,
    skip_testing_for_subpackage: bool,
    error_info: String,
}

impl TraversalRequest {
    /// Traverse a source path, reporting an error at package boundaries.
    pub fn new(path: RootedPath) -> Self {
        let error_info = format!("traversal of {path}");
        Self {
            path,
            is_generated: false,
            pattern: None,
            boundary: PackageBoundaryMode::default(),
            skip_testing_for_subpackage: false,
            error_info,
        }
    }

    /// Mark the path as generated output rather than source.
    pub fn generated(mut self, is_generated: bool) -> Self {
        self.is_generated = is_generated;
        self
    }

    /// Only include files whose root-relative path matches `pattern`.
    pub fn pattern(mut self, pattern: TraversalPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Set the package boundary policy.
    pub fn package_boundary(mut self, mode: PackageBoundaryMode) -> Self {
        self.boundary = mode;
        self
    }

    /// Do not apply the boundary policy to the traversal root itself.
    pub fn skip_testing_for_subpackage(mut self, skip: bool) -> Self {
        self.skip_testing_for_subpackage = skip;
        self
    }

    /// Describe who asked for the traversal, for error messages.
    pub fn error_info(mut self, info: impl Into<String>) -> Self {
        self.error_info = info.into();
        self
    }

    /// The traversed path.
    pub fn path(&self) -> &RootedPath {
        &self.path
    }

    /// Whether the path is generated output.
    pub fn is_generated(&self) -> bool {
        self.is_generated
    }

    /// The package boundary policy.
    pub fn boundary(&self) -> PackageBoundaryMode {
        self.boundary
    }

    /// The node key of this traversal.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(RECURSIVE_FILESYSTEM_TRAVERSAL, self.clone())
    }

    /// The request for one directory entry. Boundary checks always apply to children.
    pub fn for_child_entry(&self, child: RootedPath) -> Self {
        Self {
            path: child,
            skip_testing_for_subpackage: false,
            ..self.clone()
        }
    }

    /// The same traversal under another package root.
    pub fn for_changed_root(&self, root: &Path) -> Self {
        Self {
            path: self.path.with_root(root),
            ..self.clone()
        }
    }
}

/// One entry found by a traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedFile {
    /// A regular file.
    RegularFile {
        /// Where it was found.
        path: RootedPath,
        /// Metadata hash of the file.
        metadata_hash: u64,
    },
    /// A directory. Only ever the root of a traversal value.
    Directory {
        /// The directory after symlink resolution.
        path: RootedPath,
    },
    /// A symlink whose target does not exist.
    DanglingSymlink {
        /// The link.
        link: RootedPath,
        /// The link text.
        target: PathBuf,
        /// Metadata hash of the missing target.
        metadata_hash: u64,
    },
    /// A symlink chain ending at a file.
    SymlinkToFile {
        /// The link.
        link: RootedPath,
        /// The file the chain ends at.
        real_path: RootedPath,
        /// The link text.
        target: PathBuf,
        /// Metadata hash of the file.
        metadata_hash: u64,
    },
    /// A symlink chain ending at a directory.
    SymlinkToDirectory {
        /// The link.
        link: RootedPath,
        /// The directory the chain ends at.
        real_path: RootedPath,
        /// The link text.
        target: PathBuf,
        /// Combined hash of everything below the directory.
        metadata_hash: u64,
    },
}

impl ResolvedFile {
    /// The path the entry was found at. For symlinks this is the link itself.
    pub fn path(&self) -> &RootedPath {
        match self {
            ResolvedFile::RegularFile { path, .. } | ResolvedFile::Directory { path } => path,
            ResolvedFile::DanglingSymlink { link, .. }
            | ResolvedFile::SymlinkToFile { link, .. }
            | ResolvedFile::SymlinkToDirectory { link, .. } => link,
        }
    }

    /// Where the entry resolves to. `None` for dangling symlinks.
    pub fn real_path(&self) -> Option<&RootedPath> {
        match self {
            ResolvedFile::RegularFile { path, .. } | ResolvedFile::Directory { path } => Some(path),
            ResolvedFile::SymlinkToFile { real_path, .. } | ResolvedFile::SymlinkToDirectory { real_path, .. } => {
                Some(real_path)
            }
            ResolvedFile::DanglingSymlink { .. } => None,
        }
    }

    /// The unresolved link text, for symlinks.
    pub fn link_target(&self) -> Option<&Path> {
        match self {
            ResolvedFile::DanglingSymlink { target, .. }
            | ResolvedFile::SymlinkToFile { target, .. }
            | ResolvedFile::SymlinkToDirectory { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Hash standing in for the content. Zero for directories.
    pub fn metadata_hash(&self) -> u64 {
        match self {
            ResolvedFile::Directory { .. } => 0,
            ResolvedFile::RegularFile { metadata_hash, .. }
            | ResolvedFile::DanglingSymlink { metadata_hash, .. }
            | ResolvedFile::SymlinkToFile { metadata_hash, .. }
            | ResolvedFile::SymlinkToDirectory { metadata_hash, .. } => *metadata_hash,
        }
    }

    /// Returns true for a symlink whose target does not exist.
    pub fn is_dangling(&self) -> bool {
        matches!(self, ResolvedFile::DanglingSymlink { .. })
    }

    /// The real path, or an error for a dangling symlink.
    pub fn resolve(&self) -> Result<&RootedPath, TraversalError> {
        self.real_path().ok_or_else(|| TraversalError::DanglingSymlink {
            path: self.path().to_string(),
            target: self
                .link_target()
                .map(|target| target.display().to_string())
                .unwrap_or_default(),
        })
    }
}

/// Result of a traversal: its root entry and every file found below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalValue {
    /// The traversed entry itself; `None` if nothing exists there.
    pub root: Option<ResolvedFile>,
    /// Every file found, children before the root.
    pub transitive_files: NestedSet<ResolvedFile>,
}

impl TraversalValue {
    /// Nothing found.
    pub fn empty() -> Self {
        Self {
            root: None,
            transitive_files: NestedSet::empty(Order::Stable),
        }
    }

    /// A single entry.
    pub fn of(file: ResolvedFile) -> Self {
        Self {
            transitive_files: NestedSet::singleton(Order::Stable, file.clone()),
            root: Some(file),
        }
    }

    /// Every file found, flattened.
    pub fn files(&self) -> Vec<ResolvedFile> {
        self.transitive_files.to_list()
    }
}

/// Failures of a traversal. All of them are persistent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TraversalError {
    /// Generated output sits at the root-relative path of a source package.
    #[error("Generated directory {path} conflicts with package under the same path. Additional info: {error_info}")]
    GeneratedPathConflict {
        /// The conflicting root-relative path.
        path: String,
        /// Origin of the traversal.
        error_info: String,
    },

    /// The traversal reached a package and its policy forbids entering it.
    #[error("{error_info} crosses package boundary into package rooted at {path}")]
    CannotCrossPackageBoundary {
        /// Root-relative path of the package.
        path: String,
        /// Origin of the traversal.
        error_info: String,
    },

    /// A dangling symlink was dereferenced.
    #[error("Found dangling symlink: {path}, unresolved path: \"{target}\"")]
    DanglingSymlink {
        /// The link.
        path: String,
        /// The link text.
        target: String,
    },

    /// The key does not hold a traversal request.
    #[error("{0} is not a traversal request")]
    InvalidArgument(NodeKey),
}

/// Traverses a [`TraversalRequest`]. Requires the filesystem functions and an injected
/// [`PackageLocator`](crate::fs::PackageLocator).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveFilesystemTraversalFunction;

impl NodeFunction for RecursiveFilesystemTraversalFunction {
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let request = key
            .argument::<TraversalRequest>()
            .ok_or_else(|| Failure::persistent(TraversalError::InvalidArgument(key.clone())))?;
        let file = env.get::<FileValue>(&file_key(request.path.clone()))?;

        if !file.exists() {
            return Ok(value(match &file.unresolved_link {
                Some(target) => TraversalValue::of(ResolvedFile::DanglingSymlink {
                    link: request.path.clone(),
                    target: target.clone(),
                    metadata_hash: file.real_state.metadata_hash(),
                }),
                None => TraversalValue::empty(),
            }));
        }

        if !file.is_directory() {
            let included = request
                .pattern
                .as_ref()
                .map_or(true, |pattern| pattern.matches(file.real_path.relative()));
            if !included {
                return Ok(value(TraversalValue::empty()));
            }
            return Ok(value(TraversalValue::of(resolved_file(&request.path, &file))));
        }

        let (request, file, is_package) = check_package(env, request, file)?;
        if is_package && !request.skip_testing_for_subpackage {
            let path = request.path.relative().display().to_string();
            match request.boundary {
                PackageBoundaryMode::Cross => env.warn(format!(
                    "{} crosses package boundary into package rooted at {path}",
                    request.error_info
                )),
                PackageBoundaryMode::DontCross => return Ok(value(TraversalValue::empty())),
                PackageBoundaryMode::ReportError => {
                    return Err(Failure::persistent(TraversalError::CannotCrossPackageBoundary {
                        path,
                        error_info: request.error_info.clone(),
                    })
                    .into())
                }
            }
        }

        // Children are named under the traversed path, even through a symlink.
        let listing = env.get::<DirectoryListingValue>(&directory_listing_key(request.path.clone()))?;
        let child_keys: Vec<NodeKey> = listing
            .dirents()
            .iter()
            .map(|dirent| request.for_child_entry(request.path.child(&dirent.name)).key())
            .collect();
        let children = env.get_all::<TraversalValue>(&child_keys)?;
        Ok(value(result_for_directory(&request, &file, &children)))
    }

    fn extract_tag(&self, key: &NodeKey) -> Option<String> {
        key.argument::<TraversalRequest>()
            .map(|request| request.error_info.clone())
    }
}

/// Look up whether the directory is a package. A package found under another package
/// root moves the traversal onto that root.
fn check_package(
    env: &mut Environment<'_>,
    request: &TraversalRequest,
    file: Arc<FileValue>,
) -> Result<(TraversalRequest, Arc<FileValue>, bool), ComputeError> {
    let lookup = env.get::<PackageLookupValue>(&package_lookup_key(request.path.relative()))?;
    let Some(package_root) = lookup.root() else {
        return Ok((request.clone(), file, false));
    };
    if request.is_generated {
        return Err(Failure::persistent(TraversalError::GeneratedPathConflict {
            path: request.path.relative().display().to_string(),
            error_info: request.error_info.clone(),
        })
        .into());
    }
    if package_root == request.path.root() {
        return Ok((request.clone(), file, true));
    }
    let moved = request.for_changed_root(package_root);
    let file = env.get::<FileValue>(&file_key(moved.path.clone()))?;
    Ok((moved, file, true))
}

fn resolved_file(path: &RootedPath, file: &FileValue) -> ResolvedFile {
    let metadata_hash = file.real_state.metadata_hash();
    match &file.unresolved_link {
        Some(target) => ResolvedFile::SymlinkToFile {
            link: path.clone(),
            real_path: file.real_path.clone(),
            target: target.clone(),
            metadata_hash,
        },
        None => ResolvedFile::RegularFile {
            path: path.clone(),
            metadata_hash,
        },
    }
}

fn result_for_directory(
    request: &TraversalRequest,
    file: &FileValue,
    children: &[Arc<TraversalValue>],
) -> TraversalValue {
    let paths = children
        .iter()
        .fold(NestedSetBuilder::stable_order(), |builder, child| {
            builder.add_transitive(child.transitive_files.clone())
        })
        .build();
    let Some(target) = &file.unresolved_link else {
        return TraversalValue {
            root: Some(ResolvedFile::Directory {
                path: file.real_path.clone(),
            }),
            transitive_files: paths,
        };
    };

    // The link's own metadata does not change with the directory's contents.
    let hash = paths
        .iter()
        .fold(0u64, |hash, child| hash.wrapping_mul(31).wrapping_add(child.metadata_hash()));
    let hash = hash
        .wrapping_mul(31)
        .wrapping_add(file.real_state.metadata_hash());
    let root = ResolvedFile::SymlinkToDirectory {
        link: request.path.clone(),
        real_path: file.real_path.clone(),
        target: target.clone(),
        metadata_hash: hash,
    };
    TraversalValue {
        transitive_files: NestedSetBuilder::stable_order()
            .add_transitive(paths)
            .add(root.clone())
            .build(),
        root: Some(root),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_whole_path() {
        let pattern = TraversalPattern::new(r".*\.txt").unwrap();
        assert!(pattern.matches(Path::new("d/a.txt")));
        assert!(!pattern.matches(Path::new("d/a.txt.bak")));
        assert_eq!(pattern, TraversalPattern::new(r".*\.txt").unwrap());
    }

    #[test]
    fn test_child_request_resets_skip_flag() {
        let request = TraversalRequest::new(RootedPath::new("/ws", "d"))
            .skip_testing_for_subpackage(true)
            .package_boundary(PackageBoundaryMode::DontCross);
        let child = request.for_child_entry(RootedPath::new("/ws", "d/e"));
        assert!(!child.skip_testing_for_subpackage);
        assert_eq!(child.boundary(), PackageBoundaryMode::DontCross);
        assert_ne!(child.key(), request.key());
    }

    #[test]
    fn test_dangling_symlink_message() {
        let file = ResolvedFile::DanglingSymlink {
            link: RootedPath::new("/ws", "d/bad"),
            target: PathBuf::from("missing"),
            metadata_hash: 0,
        };
        let err = file.resolve().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Found dangling symlink: /ws/d/bad, unresolved path: \"missing\""
        );
    }

    #[test]
    fn test_symlink_to_directory_hash_tracks_children() {
        let request = TraversalRequest::new(RootedPath::new("/ws", "link"));
        let dir_state = crate::fs::FileStateValue::Directory;
        let file = FileValue {
            path: RootedPath::new("/ws", "link"),
            state: crate::fs::FileStateValue::Symlink {
                target: PathBuf::from("dir"),
            },
            real_path: RootedPath::new("/ws", "dir"),
            real_state: dir_state,
            unresolved_link: Some(PathBuf::from("dir")),
        };
        let child = |hash| {
            Arc::new(TraversalValue::of(ResolvedFile::RegularFile {
                path: RootedPath::new("/ws", "link/a"),
                metadata_hash: hash,
            }))
        };
        let one = result_for_directory(&request, &file, &[child(1)]);
        let two = result_for_directory(&request, &file, &[child(2)]);
        assert_ne!(
            one.root.as_ref().map(ResolvedFile::metadata_hash),
            two.root.as_ref().map(ResolvedFile::metadata_hash)
        );
        assert_eq!(one.files().last(), one.root.as_ref());
    }
}
