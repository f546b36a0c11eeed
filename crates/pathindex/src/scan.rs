//! Filesystem scanning.
//!
//! Resolves the configured roots into [`RootSpec`]s and enumerates the regular
//! files beneath them. Directories are walked in parallel with rayon; the
//! output is a flat, sorted list with no classification or tree structure.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::config::EngineConfig;

/// Whether a root is a directory tree or a single file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RootKind {
    Directory,
    File,
}

/// A resolved root: where to scan and which bucket its files land in.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RootSpec {
    pub path: PathBuf,
    pub kind: RootKind,
}

impl RootSpec {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: RootKind::Directory,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: RootKind::File,
        }
    }

    /// Stats `path` (following symlinks) and returns `None` if it is missing
    /// or neither a file nor a directory.
    pub fn probe(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        if metadata.is_dir() {
            Some(Self::directory(path))
        } else if metadata.is_file() {
            Some(Self::file(path))
        } else {
            None
        }
    }

    /// The bucket name. Directories use their own stem, file roots use the
    /// stem of their containing directory.
    pub fn name(&self) -> String {
        match self.kind {
            RootKind::Directory => stem_of(&self.path),
            RootKind::File => self
                .path
                .parent()
                .map(stem_of)
                .unwrap_or_else(|| stem_of(&self.path)),
        }
    }

    /// The directory that relative leaf paths are computed from.
    pub fn base_dir(&self) -> &Path {
        match self.kind {
            RootKind::Directory => &self.path,
            RootKind::File => self.path.parent().unwrap_or(&self.path),
        }
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// One enumerated file.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct ScannedFile {
    /// Absolute file path.
    pub path: PathBuf,
    /// Bucket name of the root it was found under.
    pub root: String,
    /// Directory relative paths are computed from.
    pub base_dir: PathBuf,
}

impl ScannedFile {
    /// Path segments below the root, ending with the file name.
    pub fn relative_segments(&self) -> Vec<String> {
        let relative = self
            .path
            .strip_prefix(&self.base_dir)
            .unwrap_or(self.path.as_path());
        relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect()
    }
}

/// Result of a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Files sorted by path.
    pub files: Vec<ScannedFile>,
    /// Roots that could not be read this cycle.
    pub skipped_roots: Vec<PathBuf>,
}

impl ScanOutcome {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Resolves the configured root lists in config order.
///
/// `paths` entries become roots themselves; each immediate child of a
/// `root_paths` entry becomes its own root. Missing paths are logged and
/// skipped.
pub fn resolve_roots(config: &EngineConfig) -> Vec<RootSpec> {
    let mut roots = Vec::new();
    for path in &config.paths {
        let path = absolute_root(path);
        match RootSpec::probe(&path) {
            Some(spec) => roots.push(spec),
            None => tracing::warn!("skipping missing root {}", path.display()),
        }
    }
    for path in &config.root_paths {
        roots.extend(expand_root_path(&absolute_root(path)));
    }
    roots
}

/// Anchors a configured path at the working directory. Symlinks are kept so
/// the root keeps its configured name.
pub fn absolute_root(path: &Path) -> PathBuf {
    match std::path::absolute(path) {
        Ok(absolute) => absolute,
        Err(error) => {
            tracing::warn!("failed to make {} absolute: {}", path.display(), error);
            path.to_path_buf()
        }
    }
}

/// Lists the immediate children of `path` as independent roots.
pub fn expand_root_path(path: &Path) -> Vec<RootSpec> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!("skipping root path {}: {}", path.display(), error);
            return Vec::new();
        }
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    children.sort();
    children
        .iter()
        .filter_map(|child| RootSpec::probe(child))
        .collect()
}

/// Scan counters, updated from rayon workers.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub num_files: AtomicUsize,
    pub num_dirs: AtomicUsize,
    pub errors: AtomicUsize,
}

/// Scans every root and merges the results.
pub fn scan_roots(roots: &[RootSpec]) -> ScanOutcome {
    let stats = ScanStats::default();
    let mut outcome = ScanOutcome::default();
    for spec in roots {
        match scan_root_with_stats(spec, &stats) {
            Some(files) => outcome.files.extend(files),
            None => outcome.skipped_roots.push(spec.path.clone()),
        }
    }
    outcome.files.sort();
    tracing::debug!(
        "scanned {} roots: files={} dirs={} errors={} skipped={}",
        roots.len(),
        stats.num_files.load(Ordering::Relaxed),
        stats.num_dirs.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed),
        outcome.skipped_roots.len()
    );
    outcome
}

/// Scans a single root. `None` if the root is gone or unreadable.
pub fn scan_root(spec: &RootSpec) -> Option<Vec<ScannedFile>> {
    let mut files = scan_root_with_stats(spec, &ScanStats::default())?;
    files.sort();
    Some(files)
}

fn scan_root_with_stats(spec: &RootSpec, stats: &ScanStats) -> Option<Vec<ScannedFile>> {
    let name = spec.name();
    let base_dir = spec.base_dir().to_path_buf();
    let to_scanned = |path: PathBuf| ScannedFile {
        path,
        root: name.clone(),
        base_dir: base_dir.clone(),
    };

    match spec.kind {
        RootKind::File => match fs::metadata(&spec.path) {
            Ok(metadata) if metadata.is_file() => {
                stats.num_files.fetch_add(1, Ordering::Relaxed);
                Some(vec![to_scanned(spec.path.clone())])
            }
            _ => {
                tracing::warn!("skipping missing file root {}", spec.path.display());
                None
            }
        },
        RootKind::Directory => {
            if !spec.path.is_dir() {
                tracing::warn!("skipping missing root {}", spec.path.display());
                return None;
            }
            let files = walk_dir(&spec.path, stats);
            Some(files.into_iter().map(to_scanned).collect())
        }
    }
}

/// Recursively collects regular files. Symlinks and special files are not
/// indexed and not followed; unreadable directories are counted and skipped.
fn walk_dir(path: &Path, stats: &ScanStats) -> Vec<PathBuf> {
    stats.num_dirs.fetch_add(1, Ordering::Relaxed);
    let read_dir = match fs::read_dir(path) {
        Ok(iter) => iter,
        Err(_) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
    };
    let entries: Vec<_> = read_dir.filter_map(|entry| entry.ok()).collect();

    entries
        .into_par_iter()
        .flat_map_iter(|entry| {
            let child_path = entry.path();
            // Does not follow symlinks.
            let Ok(file_type) = entry.file_type() else {
                return Vec::new();
            };
            if file_type.is_dir() {
                walk_dir(&child_path, stats)
            } else if file_type.is_file() {
                stats.num_files.fetch_add(1, Ordering::Relaxed);
                vec![child_path]
            } else {
                Vec::new()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn relative_roots_resolve_to_absolute_paths() {
        let cwd = std::env::current_dir().unwrap();
        let temp = tempfile::Builder::new()
            .prefix("relative-root")
            .tempdir_in(&cwd)
            .unwrap();
        let relative = temp.path().strip_prefix(&cwd).unwrap();
        assert!(relative.is_relative());
        let photos = relative.join("photos");
        let shows = relative.join("media/shows");
        fs::create_dir_all(&photos).unwrap();
        fs::create_dir_all(&shows).unwrap();
        File::create(photos.join("a.jpg")).unwrap();
        File::create(shows.join("b.mkv")).unwrap();

        let config = EngineConfig {
            paths: vec![photos.clone()],
            root_paths: vec![relative.join("media")],
            ..EngineConfig::default()
        };
        let roots = resolve_roots(&config);
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|spec| spec.path.is_absolute()), "{roots:?}");
        assert_eq!(roots[0].name(), "photos");
        assert_eq!(roots[1].name(), "shows");

        let outcome = scan_roots(&roots);
        assert_eq!(outcome.len(), 2);
        assert!(outcome.paths().all(Path::is_absolute));

        let event = cwd.join(&photos).join("new.jpg");
        assert!(crate::watcher::path_in_scope(&roots[0], &event));
    }

    fn names(outcome: &ScanOutcome) -> Vec<(String, Vec<String>)> {
        outcome
            .files
            .iter()
            .map(|file| (file.root.clone(), file.relative_segments()))
            .collect()
    }

    #[test]
    fn directory_root_lists_nested_files() {
        let temp = TempDir::new().unwrap();
        let photos = temp.path().join("photos");
        fs::create_dir_all(photos.join("2023/summer")).unwrap();
        File::create(photos.join("a.jpg")).unwrap();
        File::create(photos.join("2023/summer/b.jpg")).unwrap();

        let outcome = scan_roots(&[RootSpec::directory(&photos)]);
        assert_eq!(
            names(&outcome),
            vec![
                (
                    "photos".to_string(),
                    vec!["2023".into(), "summer".into(), "b.jpg".into()]
                ),
                ("photos".to_string(), vec!["a.jpg".into()]),
            ]
        );
        assert!(outcome.skipped_roots.is_empty());
    }

    #[test]
    fn empty_directories_produce_no_entries() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("docs/empty/deeper")).unwrap();

        let outcome = scan_roots(&[RootSpec::directory(temp.path().join("docs"))]);
        assert!(outcome.is_empty());
    }

    #[test]
    fn file_root_is_bucketed_under_parent_stem() {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs");
        fs::create_dir(&docs).unwrap();
        File::create(docs.join("notes.txt")).unwrap();

        let spec = RootSpec::probe(&docs.join("notes.txt")).unwrap();
        assert_eq!(spec.kind, RootKind::File);
        assert_eq!(spec.name(), "docs");

        let outcome = scan_roots(&[spec]);
        assert_eq!(
            names(&outcome),
            vec![("docs".to_string(), vec!["notes.txt".into()])]
        );
    }

    #[test]
    fn root_name_uses_stem() {
        assert_eq!(RootSpec::directory("/media/photos").name(), "photos");
        assert_eq!(RootSpec::directory("/media/archive.d").name(), "archive");
    }

    #[test]
    fn missing_root_is_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present");
        fs::create_dir(&present).unwrap();
        File::create(present.join("x.bin")).unwrap();
        let missing = temp.path().join("missing");

        let outcome = scan_roots(&[RootSpec::directory(&missing), RootSpec::directory(&present)]);
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome.skipped_roots, vec![missing]);
    }

    #[test]
    fn resolve_skips_missing_and_expands_root_paths() {
        let temp = TempDir::new().unwrap();
        let media = temp.path().join("media");
        fs::create_dir_all(media.join("shows")).unwrap();
        fs::create_dir_all(media.join("movies")).unwrap();
        File::create(media.join("readme.md")).unwrap();
        let photos = temp.path().join("photos");
        fs::create_dir(&photos).unwrap();

        let config = EngineConfig {
            paths: vec![photos.clone(), temp.path().join("nope")],
            root_paths: vec![media.clone()],
            ..EngineConfig::default()
        };
        let roots = resolve_roots(&config);
        let named: Vec<(String, RootKind)> =
            roots.iter().map(|spec| (spec.name(), spec.kind)).collect();
        assert_eq!(
            named,
            vec![
                ("photos".to_string(), RootKind::Directory),
                ("movies".to_string(), RootKind::Directory),
                ("media".to_string(), RootKind::File),
                ("shows".to_string(), RootKind::Directory),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_indexed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        File::create(root.join("real.txt")).unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let outcome = scan_roots(&[RootSpec::directory(&root)]);
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome.files[0].path, root.join("real.txt"));
    }
}
