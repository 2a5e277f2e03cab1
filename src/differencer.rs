//! Turning filesystem changes into graph invalidations.
//!
//! A [`FilesystemDiffer`] asks a [`DiffAwareness`] what changed under each package root
//! since the last build and produces a [`Diff`]. Roots with precise information get a
//! targeted re-stat of the reported paths. Everything else falls back to a full scan
//! of the graph's done values through [`DirtinessChecker`]s.
//!
//! ```ignore
//! let differ = FilesystemDiffer::new(fs.clone(), vec![root.clone()]);
//! let diff = differ.diff(evaluator.graph(), &awareness);
//! evaluator.apply_diff(diff);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::fs::{
    directory_listing_state_key, file_state_key, DirectoryListingStateValue, FileStateValue, FileSystem,
    FileType, RootedPath, DIRECTORY_LISTING_STATE, FILE_STATE,
};
use crate::graph::InMemoryGraph;
use crate::key::NodeKey;
use crate::value::{downcast_value, value, Value};

/// Keys to invalidate and values to inject before the next build.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Keys whose value must be recomputed.
    pub changed_without_new_value: BTreeSet<NodeKey>,
    /// Keys whose new value is already known.
    pub changed_with_new_value: BTreeMap<NodeKey, Value>,
}

impl Diff {
    /// An empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changed_without_new_value.is_empty() && self.changed_with_new_value.is_empty()
    }

    /// Number of changed keys.
    pub fn len(&self) -> usize {
        self.changed_without_new_value.len() + self.changed_with_new_value.len()
    }

    /// Record a key that must be recomputed.
    pub fn invalidate(&mut self, key: NodeKey) {
        self.changed_with_new_value.remove(&key);
        self.changed_without_new_value.insert(key);
    }

    /// Record a key with a known new value.
    pub fn inject(&mut self, key: NodeKey, new_value: Value) {
        if !self.changed_without_new_value.contains(&key) {
            self.changed_with_new_value.insert(key, new_value);
        }
    }

    fn apply(&mut self, key: NodeKey, result: DirtyResult) {
        match result {
            DirtyResult::NotDirty => {}
            DirtyResult::Dirty => self.invalidate(key),
            DirtyResult::DirtyWithNewValue(new_value) => self.inject(key, new_value),
        }
    }
}

/// Paths modified under one root since the previous query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifiedFileSet {
    /// Root-relative paths known to have changed.
    Paths(BTreeSet<PathBuf>),
    /// No precise information; anything may have changed.
    EverythingModified,
}

impl ModifiedFileSet {
    /// No changes.
    pub fn nothing() -> Self {
        ModifiedFileSet::Paths(BTreeSet::new())
    }
}

/// Source of per-root change information, such as a file watcher.
pub trait DiffAwareness: Send + Sync {
    /// What changed under `root` since the last call for that root.
    fn get_diff(&self, root: &Path) -> ModifiedFileSet;
}

/// Knows nothing: every root is rescanned.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEverythingModified;

impl DiffAwareness for AlwaysEverythingModified {
    fn get_diff(&self, _root: &Path) -> ModifiedFileSet {
        ModifiedFileSet::EverythingModified
    }
}

/// Collects paths reported by the caller and hands them out on the next query.
#[derive(Debug, Default)]
pub struct RecordingDiffAwareness {
    recorded: Mutex<BTreeMap<PathBuf, ModifiedFileSet>>,
}

impl RecordingDiffAwareness {
    /// An awareness with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `relative` changed under `root`.
    pub fn record(&self, root: impl Into<PathBuf>, relative: impl Into<PathBuf>) {
        let mut recorded = self.recorded.lock();
        let entry = recorded.entry(root.into()).or_insert_with(ModifiedFileSet::nothing);
        if let ModifiedFileSet::Paths(paths) = entry {
            paths.insert(relative.into());
        }
    }

    /// Give up precise tracking for `root` until the next query.
    pub fn record_everything(&self, root: impl Into<PathBuf>) {
        self.recorded
            .lock()
            .insert(root.into(), ModifiedFileSet::EverythingModified);
    }
}

impl DiffAwareness for RecordingDiffAwareness {
    fn get_diff(&self, root: &Path) -> ModifiedFileSet {
        self.recorded
            .lock()
            .remove(root)
            .unwrap_or_else(ModifiedFileSet::nothing)
    }
}

/// Verdict of a [`DirtinessChecker`] on one cached value.
#[derive(Debug, Clone)]
pub enum DirtyResult {
    /// The cached value is still accurate.
    NotDirty,
    /// The value changed and must be recomputed.
    Dirty,
    /// The value changed and the checker already knows the new one.
    DirtyWithNewValue(Value),
}

/// Decides whether a cached value is stale during a full scan.
pub trait DirtinessChecker: Send + Sync {
    /// Returns true if this checker handles `key`.
    fn applies(&self, key: &NodeKey) -> bool;

    /// Compare `old` against the current state of the world.
    fn check(&self, key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult;
}

fn compare<V: crate::value::NodeValue + PartialEq>(old: &Value, current: std::io::Result<V>) -> DirtyResult {
    match current {
        Ok(current) if downcast_value::<V>(old).is_some_and(|old| *old == current) => DirtyResult::NotDirty,
        Ok(current) => DirtyResult::DirtyWithNewValue(value(current)),
        Err(_) => DirtyResult::Dirty,
    }
}

fn check_file_state(key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult {
    match key.argument::<RootedPath>() {
        Some(path) => compare(old, FileStateValue::read(fs, &path.as_path())),
        None => DirtyResult::NotDirty,
    }
}

fn check_listing(key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult {
    match key.argument::<RootedPath>() {
        Some(path) => compare(old, fs.read_dir(&path.as_path()).map(DirectoryListingStateValue::new)),
        None => DirtyResult::NotDirty,
    }
}

fn rooted_under(key: &NodeKey, roots: &[PathBuf]) -> bool {
    key.argument::<RootedPath>()
        .is_some_and(|path| roots.iter().any(|root| root == path.root()))
}

/// Re-stats `FILE_STATE` nodes under the given roots.
#[derive(Debug, Clone)]
pub struct FileStateDirtinessChecker {
    roots: Vec<PathBuf>,
}

impl FileStateDirtinessChecker {
    /// A checker for `roots`.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl DirtinessChecker for FileStateDirtinessChecker {
    fn applies(&self, key: &NodeKey) -> bool {
        key.kind() == FILE_STATE && rooted_under(key, &self.roots)
    }

    fn check(&self, key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult {
        check_file_state(key, old, fs)
    }
}

/// Re-reads `DIRECTORY_LISTING_STATE` nodes under the given roots.
#[derive(Debug, Clone)]
pub struct DirectoryListingStateDirtinessChecker {
    roots: Vec<PathBuf>,
}

impl DirectoryListingStateDirtinessChecker {
    /// A checker for `roots`.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl DirtinessChecker for DirectoryListingStateDirtinessChecker {
    fn applies(&self, key: &NodeKey) -> bool {
        key.kind() == DIRECTORY_LISTING_STATE && rooted_under(key, &self.roots)
    }

    fn check(&self, key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult {
        check_listing(key, old, fs)
    }
}

/// How files outside every package root are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalFileAction {
    /// Re-stat them on every diff.
    #[default]
    CheckExternal,
    /// Never consider them changed.
    AssumeImmutable,
}

/// Handles file state and listing nodes rooted outside every package root.
#[derive(Debug, Clone)]
pub struct ExternalDirtinessChecker {
    package_roots: Vec<PathBuf>,
    action: ExternalFileAction,
}

impl ExternalDirtinessChecker {
    /// A checker treating everything outside `package_roots` according to `action`.
    pub fn new(package_roots: Vec<PathBuf>, action: ExternalFileAction) -> Self {
        Self {
            package_roots,
            action,
        }
    }
}

impl DirtinessChecker for ExternalDirtinessChecker {
    fn applies(&self, key: &NodeKey) -> bool {
        (key.kind() == FILE_STATE || key.kind() == DIRECTORY_LISTING_STATE)
            && key.argument::<RootedPath>().is_some()
            && !rooted_under(key, &self.package_roots)
    }

    fn check(&self, key: &NodeKey, old: &Value, fs: &dyn FileSystem) -> DirtyResult {
        match self.action {
            ExternalFileAction::AssumeImmutable => DirtyResult::NotDirty,
            ExternalFileAction::CheckExternal if key.kind() == FILE_STATE => check_file_state(key, old, fs),
            ExternalFileAction::CheckExternal => check_listing(key, old, fs),
        }
    }
}

/// Computes a [`Diff`] for the package roots of a workspace.
pub struct FilesystemDiffer {
    fs: Arc<dyn FileSystem>,
    package_roots: Vec<PathBuf>,
    external_action: ExternalFileAction,
    checkers: Vec<Arc<dyn DirtinessChecker>>,
}

impl FilesystemDiffer {
    /// A differ over `package_roots`.
    pub fn new(fs: Arc<dyn FileSystem>, package_roots: Vec<PathBuf>) -> Self {
        Self {
            fs,
            package_roots,
            external_action: ExternalFileAction::default(),
            checkers: Vec::new(),
        }
    }

    /// Set how files outside the package roots are treated.
    pub fn external_action(mut self, action: ExternalFileAction) -> Self {
        self.external_action = action;
        self
    }

    /// Add a checker consulted before the built-in ones on every full scan.
    pub fn checker(mut self, checker: impl DirtinessChecker + 'static) -> Self {
        self.checkers.push(Arc::new(checker));
        self
    }

    /// What changed since the last build, as seen by `awareness`.
    pub fn diff(&self, graph: &InMemoryGraph, awareness: &dyn DiffAwareness) -> Diff {
        let mut diff = Diff::new();
        let mut scan_roots = Vec::new();
        for root in &self.package_roots {
            match awareness.get_diff(root) {
                ModifiedFileSet::EverythingModified => {
                    info!(root = %root.display(), "DiffAwareness reported everything modified");
                    scan_roots.push(root.clone());
                }
                ModifiedFileSet::Paths(paths) => {
                    log_diff_info(root, &paths);
                    for relative in paths {
                        self.diff_path(graph, RootedPath::new(root.clone(), relative), &mut diff);
                    }
                }
            }
        }

        let mut checkers = self.checkers.clone();
        if !scan_roots.is_empty() {
            checkers.push(Arc::new(FileStateDirtinessChecker::new(scan_roots.clone())));
            checkers.push(Arc::new(DirectoryListingStateDirtinessChecker::new(scan_roots)));
        }
        if self.external_action == ExternalFileAction::CheckExternal {
            checkers.push(Arc::new(ExternalDirtinessChecker::new(
                self.package_roots.clone(),
                self.external_action,
            )));
        }
        if !checkers.is_empty() {
            self.full_scan(graph, &checkers, &mut diff);
        }
        debug!(
            invalidated = diff.changed_without_new_value.len(),
            injected = diff.changed_with_new_value.len(),
            "computed filesystem diff"
        );
        diff
    }

    /// Re-stat one reported path and decide what else its change touches.
    fn diff_path(&self, graph: &InMemoryGraph, path: RootedPath, diff: &mut Diff) {
        let key = file_state_key(path.clone());
        let old = cached::<FileStateValue>(graph, &key);
        let current = FileStateValue::read(self.fs.as_ref(), &path.as_path());
        if let (Some(old), Ok(current)) = (&old, &current) {
            if old.as_ref() == current {
                return;
            }
        }

        let parent_listing_changed = match &current {
            Err(_) => true,
            Ok(current) => {
                let type_changed = old.as_ref().is_some_and(|old| old.file_type() != current.file_type());
                type_changed || !self.listing_agrees(graph, &path, current)
            }
        };
        let was_directory = old.as_ref().is_some_and(|old| old.file_type() == Some(FileType::Directory));

        match current {
            Err(_) => diff.invalidate(key),
            Ok(current) => {
                if was_directory && current.file_type() != Some(FileType::Directory) {
                    diff.invalidate(directory_listing_state_key(path.clone()));
                }
                if old.is_some() {
                    diff.inject(key, value(current));
                }
            }
        }
        if parent_listing_changed {
            if let Some(parent) = path.parent() {
                diff.invalidate(directory_listing_state_key(parent));
            }
        }
    }

    /// Whether the parent's cached listing, if any, shows `path` with the type it has now.
    fn listing_agrees(&self, graph: &InMemoryGraph, path: &RootedPath, current: &FileStateValue) -> bool {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return true;
        };
        match cached::<DirectoryListingStateValue>(graph, &directory_listing_state_key(parent)) {
            Some(listing) => listing.get(name).map(|d| d.file_type) == current.file_type(),
            None => true,
        }
    }

    fn full_scan(&self, graph: &InMemoryGraph, checkers: &[Arc<dyn DirtinessChecker>], diff: &mut Diff) {
        let values = graph.done_values();
        let fs = self.fs.as_ref();
        let results: Vec<(NodeKey, DirtyResult)> = values
            .par_iter()
            .filter_map(|(key, old)| {
                let checker = checkers.iter().find(|c| c.applies(key))?;
                match checker.check(key, old, fs) {
                    DirtyResult::NotDirty => None,
                    result => Some((key.clone(), result)),
                }
            })
            .collect();
        debug!(scanned = values.len(), dirty = results.len(), "full dirtiness scan");
        for (key, result) in results {
            diff.apply(key, result);
        }
    }
}

/// The last stored value of `key`, even if the node is dirty.
fn cached<V: crate::value::NodeValue>(graph: &InMemoryGraph, key: &NodeKey) -> Option<Arc<V>> {
    let result = graph.get(key)?.last_result()?;
    downcast_value::<V>(&result.ok()?)
}

fn log_diff_info(root: &Path, paths: &BTreeSet<PathBuf>) {
    if paths.is_empty() {
        return;
    }
    const MAX_LOGGED: usize = 5;
    let mut listed: Vec<String> = paths
        .iter()
        .take(MAX_LOGGED)
        .map(|p| p.display().to_string())
        .collect();
    if paths.len() > MAX_LOGGED {
        listed.push("...".to_string());
    }
    info!(
        "DiffAwareness found {} modified source files and directory listings for {}: {}",
        paths.len(),
        root.display(),
        listed.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Dirent, InMemoryFileSystem};
    use crate::version::Version;

    fn setup() -> (Arc<InMemoryFileSystem>, InMemoryGraph) {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.write_file("/ws/a.txt", "a");
        let graph = InMemoryGraph::new();
        let a = RootedPath::new("/ws", "a.txt");
        let state = FileStateValue::read(fs.as_ref(), &a.as_path()).unwrap();
        graph.create_if_absent(&file_state_key(a)).inject(value(state), Version(1));
        graph.create_if_absent(&directory_listing_state_key(RootedPath::new("/ws", ""))).inject(
            value(DirectoryListingStateValue::new(vec![Dirent {
                name: "a.txt".into(),
                file_type: FileType::File,
            }])),
            Version(1),
        );
        (fs, graph)
    }

    fn differ(fs: &Arc<InMemoryFileSystem>) -> FilesystemDiffer {
        FilesystemDiffer::new(fs.clone(), vec![PathBuf::from("/ws")])
    }

    #[test]
    fn test_unchanged_path_yields_empty_diff() {
        let (fs, graph) = setup();
        let awareness = RecordingDiffAwareness::new();
        awareness.record("/ws", "a.txt");
        assert!(differ(&fs).diff(&graph, &awareness).is_empty());
    }

    #[test]
    fn test_modified_file_is_injected_without_listing_change() {
        let (fs, graph) = setup();
        fs.write_file("/ws/a.txt", "changed");
        let awareness = RecordingDiffAwareness::new();
        awareness.record("/ws", "a.txt");
        let diff = differ(&fs).diff(&graph, &awareness);
        assert!(diff
            .changed_with_new_value
            .contains_key(&file_state_key(RootedPath::new("/ws", "a.txt"))));
        assert!(diff.changed_without_new_value.is_empty());
    }

    #[test]
    fn test_created_file_invalidates_parent_listing() {
        let (fs, graph) = setup();
        fs.write_file("/ws/b.txt", "b");
        let awareness = RecordingDiffAwareness::new();
        awareness.record("/ws", "b.txt");
        let diff = differ(&fs).diff(&graph, &awareness);
        assert!(diff.changed_with_new_value.is_empty());
        assert!(diff
            .changed_without_new_value
            .contains(&directory_listing_state_key(RootedPath::new("/ws", ""))));
    }

    #[test]
    fn test_deleted_file_changes_type_and_listing() {
        let (fs, graph) = setup();
        fs.remove("/ws/a.txt");
        let awareness = RecordingDiffAwareness::new();
        awareness.record("/ws", "a.txt");
        let diff = differ(&fs).diff(&graph, &awareness);
        let key = file_state_key(RootedPath::new("/ws", "a.txt"));
        let injected = diff.changed_with_new_value.get(&key).and_then(downcast_value::<FileStateValue>);
        assert_eq!(injected.as_deref(), Some(&FileStateValue::NonExistent));
        assert_eq!(diff.changed_without_new_value.len(), 1);
    }

    #[test]
    fn test_full_scan_finds_changes() {
        let (fs, graph) = setup();
        fs.write_file("/ws/a.txt", "changed");
        fs.write_file("/ws/c.txt", "c");
        let diff = differ(&fs).diff(&graph, &AlwaysEverythingModified);
        assert_eq!(diff.changed_with_new_value.len(), 2);
    }

    #[test]
    fn test_external_files_assumed_immutable() {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.write_file("/ext/lib.txt", "one");
        let graph = InMemoryGraph::new();
        let path = RootedPath::absolute(Path::new("/ext/lib.txt"));
        let state = FileStateValue::read(fs.as_ref(), &path.as_path()).unwrap();
        graph.create_if_absent(&file_state_key(path)).inject(value(state), Version(1));
        fs.write_file("/ext/lib.txt", "two");

        let awareness = RecordingDiffAwareness::new();
        let immutable = differ(&fs).external_action(ExternalFileAction::AssumeImmutable);
        assert!(immutable.diff(&graph, &awareness).is_empty());
        assert_eq!(differ(&fs).diff(&graph, &awareness).len(), 1);
    }

    struct EverythingDirty;

    impl DirtinessChecker for EverythingDirty {
        fn applies(&self, key: &NodeKey) -> bool {
            key.kind() == FILE_STATE
        }

        fn check(&self, _key: &NodeKey, _old: &Value, _fs: &dyn FileSystem) -> DirtyResult {
            DirtyResult::Dirty
        }
    }

    #[test]
    fn test_custom_checker_runs_first() {
        let (fs, graph) = setup();
        let diff = differ(&fs)
            .checker(EverythingDirty)
            .diff(&graph, &RecordingDiffAwareness::new());
        assert_eq!(diff.changed_without_new_value.len(), 1);
    }
}
