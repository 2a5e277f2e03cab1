//! Differencer tests against the real filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memograph::differencer::{
    AlwaysEverythingModified, DirtinessChecker, DirtyResult, ExternalFileAction, RecordingDiffAwareness,
};
use memograph::fs::{
    file_key, file_state_key, filesystem_functions, package_locator_key, package_lookup_key, precomputed_key,
    FileSystem, PackageLocator, PackageLookupValue, RealFileSystem, RootedPath,
};
use memograph::traversal::{
    RecursiveFilesystemTraversalFunction, ResolvedFile, TraversalRequest, TraversalValue,
    RECURSIVE_FILESYSTEM_TRAVERSAL,
};
use memograph::{value, Diff, EngineConfig, FilesystemDiffer, MemoizingEvaluator, NodeKey, Transience, Value};
use tempfile::TempDir;

struct Checkout {
    dir: TempDir,
    evaluator: MemoizingEvaluator,
}

impl Checkout {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.txt"), "alpha").unwrap();
        fs::write(dir.path().join("src/b.txt"), "beta").unwrap();

        let evaluator = MemoizingEvaluator::builder()
            .functions(filesystem_functions(Arc::new(RealFileSystem)))
            .function(RECURSIVE_FILESYSTEM_TRAVERSAL, RecursiveFilesystemTraversalFunction)
            .config(EngineConfig::for_tests())
            .build();
        evaluator.inject([(package_locator_key(), value(PackageLocator::new(vec![dir.path().to_path_buf()])))]);
        Self { dir, evaluator }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn src(&self) -> TraversalRequest {
        TraversalRequest::new(RootedPath::new(self.root(), "src"))
    }

    fn files(&self) -> Vec<ResolvedFile> {
        let request = self.src();
        let options = self.evaluator.default_options();
        let result = self.evaluator.evaluate(&[request.key()], &options).unwrap();
        assert!(!result.has_error(), "{:?}", result.error_info());
        result.get_as::<TraversalValue>(&request.key()).unwrap().files()
    }

    fn differ(&self) -> FilesystemDiffer {
        FilesystemDiffer::new(Arc::new(RealFileSystem), vec![self.root()])
    }

    fn scan(&self) -> Diff {
        self.differ().diff(self.evaluator.graph(), &AlwaysEverythingModified)
    }
}

fn names(files: &[ResolvedFile]) -> Vec<String> {
    files
        .iter()
        .filter_map(|file| file.path().file_name().map(str::to_string))
        .collect()
}

// =============================================================================
// Full Scans
// =============================================================================

#[test]
fn test_full_scan_of_unchanged_tree_is_empty() {
    let checkout = Checkout::new();
    assert_eq!(names(&checkout.files()), vec!["a.txt", "b.txt"]);
    assert!(checkout.scan().is_empty());
}

#[test]
fn test_full_scan_injects_modified_file_state() {
    let checkout = Checkout::new();
    let before = checkout.files();

    fs::write(checkout.root().join("src/a.txt"), "alpha, now longer").unwrap();
    let diff = checkout.scan();
    let key = file_state_key(RootedPath::new(checkout.root(), "src/a.txt"));
    assert_eq!(diff.len(), 1);
    assert!(diff.changed_with_new_value.contains_key(&key));

    checkout.evaluator.apply_diff(diff);
    let after = checkout.files();
    assert_ne!(before[0].metadata_hash(), after[0].metadata_hash());
    assert_eq!(before[1], after[1]);
}

#[test]
fn test_full_scan_picks_up_created_file() {
    let checkout = Checkout::new();
    checkout.files();

    fs::write(checkout.root().join("src/c.txt"), "gamma").unwrap();
    let diff = checkout.scan();
    assert!(!diff.is_empty());
    checkout.evaluator.apply_diff(diff);
    assert_eq!(names(&checkout.files()), vec!["a.txt", "b.txt", "c.txt"]);
}

#[test]
fn test_reported_deletion_removes_file() {
    let checkout = Checkout::new();
    checkout.files();

    fs::remove_file(checkout.root().join("src/b.txt")).unwrap();
    let awareness = RecordingDiffAwareness::new();
    awareness.record(checkout.root(), "src/b.txt");
    let diff = checkout.differ().diff(checkout.evaluator.graph(), &awareness);
    checkout.evaluator.apply_diff(diff);
    assert_eq!(names(&checkout.files()), vec!["a.txt"]);
}

// =============================================================================
// External Files
// =============================================================================

fn read_external(checkout: &Checkout, path: &Path) -> NodeKey {
    let key = file_key(RootedPath::absolute(path));
    let options = checkout.evaluator.default_options();
    let result = checkout.evaluator.evaluate(&[key.clone()], &options).unwrap();
    assert!(!result.has_error());
    file_state_key(RootedPath::absolute(path))
}

#[test]
fn test_external_files_checked_by_default() {
    let checkout = Checkout::new();
    let external = tempfile::tempdir().unwrap();
    let path = external.path().join("tool.cfg");
    fs::write(&path, "v1").unwrap();
    let key = read_external(&checkout, &path);

    fs::write(&path, "version 2").unwrap();
    let diff = checkout.differ().diff(checkout.evaluator.graph(), &RecordingDiffAwareness::new());
    assert!(diff.changed_with_new_value.contains_key(&key));
}

#[test]
fn test_external_files_assumed_immutable() {
    let checkout = Checkout::new();
    let external = tempfile::tempdir().unwrap();
    let path = external.path().join("tool.cfg");
    fs::write(&path, "v1").unwrap();
    read_external(&checkout, &path);

    fs::write(&path, "version 2").unwrap();
    let diff = checkout
        .differ()
        .external_action(ExternalFileAction::AssumeImmutable)
        .diff(checkout.evaluator.graph(), &RecordingDiffAwareness::new());
    assert!(diff.is_empty());
}

// =============================================================================
// Custom Checkers
// =============================================================================

struct BuildStamp(u64);

impl DirtinessChecker for BuildStamp {
    fn applies(&self, key: &NodeKey) -> bool {
        key == &precomputed_key("build_stamp")
    }

    fn check(&self, _key: &NodeKey, old: &Value, _fs: &dyn FileSystem) -> DirtyResult {
        match memograph::downcast_value::<u64>(old) {
            Some(old) if *old == self.0 => DirtyResult::NotDirty,
            _ => DirtyResult::DirtyWithNewValue(value(self.0)),
        }
    }
}

#[test]
fn test_custom_checker_refreshes_precomputed_value() {
    let checkout = Checkout::new();
    let stamp = precomputed_key("build_stamp");
    checkout.evaluator.inject([(stamp.clone(), value(1u64))]);
    checkout.files();

    let unchanged = checkout
        .differ()
        .checker(BuildStamp(1))
        .diff(checkout.evaluator.graph(), &RecordingDiffAwareness::new());
    assert!(unchanged.is_empty());

    let diff = checkout
        .differ()
        .checker(BuildStamp(2))
        .diff(checkout.evaluator.graph(), &RecordingDiffAwareness::new());
    checkout.evaluator.apply_diff(diff);
    let options = checkout.evaluator.default_options();
    let result = checkout.evaluator.evaluate(&[stamp.clone()], &options).unwrap();
    assert_eq!(result.get_as::<u64>(&stamp).map(|v| *v), Some(2));
}

#[cfg(unix)]
#[test]
fn test_full_scan_sees_retargeted_symlink() {
    let checkout = Checkout::new();
    std::os::unix::fs::symlink("a.txt", checkout.root().join("src/link")).unwrap();
    let before = checkout.files();
    assert!(matches!(before.last(), Some(ResolvedFile::SymlinkToFile { .. })));

    fs::remove_file(checkout.root().join("src/link")).unwrap();
    std::os::unix::fs::symlink("b.txt", checkout.root().join("src/link")).unwrap();
    checkout.evaluator.apply_diff(checkout.scan());
    match checkout.files().last() {
        Some(ResolvedFile::SymlinkToFile { target, .. }) => assert_eq!(target, &PathBuf::from("b.txt")),
        other => panic!("expected symlink to file, got {other:?}"),
    }
}

// =============================================================================
// Package Roots
// =============================================================================

#[test]
fn test_package_lookup_skips_root_where_package_is_a_file() {
    let checkout = Checkout::new();
    let first = checkout.root().join("first");
    let second = checkout.root().join("second");
    fs::create_dir_all(first.join("pkg")).unwrap();
    fs::create_dir_all(&second).unwrap();
    fs::write(second.join("pkg"), "a file, not a package").unwrap();
    checkout
        .evaluator
        .inject([(package_locator_key(), value(PackageLocator::new(vec![first, second])))]);

    let key = package_lookup_key("pkg");
    let options = checkout.evaluator.default_options();
    let result = checkout.evaluator.evaluate(&[key.clone()], &options).unwrap();
    assert!(!result.has_error(), "{:?}", result.error_info());
    assert_eq!(result.get_as::<PackageLookupValue>(&key).as_deref(), Some(&PackageLookupValue::NoBuildFile));
}

#[test]
fn test_package_lookup_finds_build_file_in_later_root() {
    let checkout = Checkout::new();
    let first = checkout.root().join("first");
    let second = checkout.root().join("second");
    fs::create_dir_all(&first).unwrap();
    fs::write(first.join("pkg"), "").unwrap();
    fs::create_dir_all(second.join("pkg")).unwrap();
    fs::write(second.join("pkg/BUILD"), "").unwrap();
    checkout
        .evaluator
        .inject([(package_locator_key(), value(PackageLocator::new(vec![first, second.clone()])))]);

    let key = package_lookup_key("pkg");
    let options = checkout.evaluator.default_options();
    let result = checkout.evaluator.evaluate(&[key.clone()], &options).unwrap();
    assert_eq!(
        result.get_as::<PackageLookupValue>(&key).as_deref(),
        Some(&PackageLookupValue::Package { root: second })
    );
}

// =============================================================================
// Undecodable Names
// =============================================================================

#[cfg(unix)]
#[test]
fn test_traversal_fails_on_undecodable_entry_name() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let checkout = Checkout::new();
    if fs::write(checkout.root().join("src").join(OsStr::from_bytes(b"c\xfe.txt")), "gamma").is_err() {
        return;
    }
    let request = checkout.src();
    let options = checkout.evaluator.default_options();
    let result = checkout.evaluator.evaluate(&[request.key()], &options).unwrap();
    let error = result.get_error(&request.key()).expect("listing error reaches the traversal");
    assert_eq!(error.transience(), Transience::Persistent);
    assert!(error.to_string().contains("UTF-8"), "{error}");
}
