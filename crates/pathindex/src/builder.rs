//! Tree construction from a scan.
//!
//! Two implementations sit behind [`TreeBuilder`]: the in-process builder,
//! which nests scanned paths itself, and the helper-process builder, which
//! delegates the hierarchy to an external program and only converts its
//! JSON output.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use rayon::ThreadPool;
use serde_json::Value;

use crate::classify::{self, ClassificationPolicy, Classifier, MimeClassifier, Verdict};
use crate::config::{EngineConfig, HelperConfig};
use crate::error::{IndexError, Result};
use crate::scan::{RootSpec, ScanOutcome};
use crate::tree::{prune_state, IndexState, Leaf, PathNode};

pub trait TreeBuilder: Send + Sync {
    /// Builds a fresh index. An error aborts the refresh cycle.
    fn build(&self, scan: &ScanOutcome, roots: &[RootSpec]) -> Result<IndexState>;

    fn name(&self) -> &'static str;
}

/// Picks the builder the config asks for.
pub fn builder_from_config(config: &EngineConfig) -> Result<Arc<dyn TreeBuilder>> {
    if let Some(helper) = &config.helper {
        return Ok(Arc::new(HelperProcessBuilder::new(helper.clone())));
    }
    let builder = if config.classify.enabled {
        InProcessBuilder::with_classifier(
            Arc::new(MimeClassifier),
            ClassificationPolicy::from_config(&config.classify),
            config.classify.workers,
        )?
    } else {
        InProcessBuilder::new()
    };
    Ok(Arc::new(builder))
}

struct Classification {
    classifier: Arc<dyn Classifier>,
    policy: ClassificationPolicy,
    pool: ThreadPool,
}

/// Nests scanned paths by root, optionally classifying each file first.
#[derive(Default)]
pub struct InProcessBuilder {
    classification: Option<Classification>,
}

impl InProcessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classifier(
        classifier: Arc<dyn Classifier>,
        policy: ClassificationPolicy,
        workers: usize,
    ) -> Result<Self> {
        Ok(Self {
            classification: Some(Classification {
                classifier,
                policy,
                pool: classify::build_pool(workers)?,
            }),
        })
    }
}

impl TreeBuilder for InProcessBuilder {
    fn build(&self, scan: &ScanOutcome, _roots: &[RootSpec]) -> Result<IndexState> {
        let verdicts = match &self.classification {
            Some(classification) => classify::classify_all(
                &scan.files,
                classification.classifier.as_ref(),
                &classification.policy,
                &classification.pool,
            ),
            None => vec![Verdict::Keep(None); scan.files.len()],
        };

        let mut state = IndexState::new();
        let mut dropped = 0usize;
        for (file, verdict) in scan.files.iter().zip(verdicts) {
            let Verdict::Keep(classification) = verdict else {
                dropped += 1;
                continue;
            };
            let segments = file.relative_segments();
            let leaf = Leaf::new(file.path.clone()).with_classification(classification);
            state
                .entry(file.root.clone())
                .or_insert_with(PathNode::directory)
                .insert(&segments, leaf);
        }
        prune_state(&mut state);

        tracing::debug!(
            "built index in-process: roots={} files={} dropped={}",
            state.len(),
            scan.files.len() - dropped,
            dropped
        );
        Ok(state)
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

/// Runs an external program that prints the whole hierarchy as JSON.
///
/// The program receives the configured `args` followed by every root path
/// and must print one object mapping root names to nested objects, with
/// absolute path strings as leaves. Roots may be keyed by their stem name
/// or by the root directory's full file name; see [`remap_helper_roots`].
#[derive(Debug, Clone)]
pub struct HelperProcessBuilder {
    config: HelperConfig,
}

impl HelperProcessBuilder {
    pub fn new(config: HelperConfig) -> Self {
        Self { config }
    }
}

impl TreeBuilder for HelperProcessBuilder {
    fn build(&self, _scan: &ScanOutcome, roots: &[RootSpec]) -> Result<IndexState> {
        let program = &self.config.program;
        let output = Command::new(program)
            .args(&self.config.args)
            .args(roots.iter().map(|spec| spec.path.as_os_str()))
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|error| {
                IndexError::Helper(format!("failed to run {}: {error}", program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IndexError::Helper(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let state = remap_helper_roots(parse_helper_payload(&output.stdout)?, roots);
        tracing::debug!(
            "built index via helper {}: roots={}",
            program.display(),
            state.len()
        );
        Ok(state)
    }

    fn name(&self) -> &'static str {
        "helper"
    }
}

/// Converts the helper's JSON payload into an index, pruning empty roots.
pub fn parse_helper_payload(stdout: &[u8]) -> Result<IndexState> {
    let value: Value = serde_json::from_slice(stdout)
        .map_err(|error| IndexError::Helper(format!("malformed helper payload: {error}")))?;
    let Value::Object(roots) = value else {
        return Err(IndexError::Helper(
            "helper payload must be a JSON object".to_string(),
        ));
    };

    let mut state = IndexState::new();
    for (name, value) in roots {
        let node = node_from_json(value, &name)?;
        if node.is_leaf() {
            return Err(IndexError::Helper(format!(
                "root {name} must be an object, not a path"
            )));
        }
        state.insert(name, node);
    }
    prune_state(&mut state);
    Ok(state)
}

/// Re-keys helper roots onto the names the scanner gives the same roots.
///
/// A key equal to a root's stem name is kept. A key equal to the file name of
/// a root's base directory, such as `photos.v2` for the root named `photos`,
/// moves to that root's name. Other keys are kept as printed. Keys that land
/// on the same name are merged.
pub fn remap_helper_roots(state: IndexState, roots: &[RootSpec]) -> IndexState {
    let mut remapped = IndexState::new();
    for (key, node) in state {
        let name = helper_root_name(&key, roots).unwrap_or(key);
        match remapped.get_mut(&name) {
            Some(existing) => existing.merge(node),
            None => {
                remapped.insert(name, node);
            }
        }
    }
    remapped
}

fn helper_root_name(key: &str, roots: &[RootSpec]) -> Option<String> {
    if roots.iter().any(|spec| spec.name() == key) {
        return None;
    }
    roots
        .iter()
        .find(|spec| spec.base_dir().file_name().is_some_and(|name| name == key))
        .map(RootSpec::name)
}

fn node_from_json(value: Value, context: &str) -> Result<PathNode> {
    match value {
        Value::String(path) => Ok(PathNode::Leaf(Leaf::new(PathBuf::from(path)))),
        Value::Object(entries) => {
            let mut children = std::collections::BTreeMap::new();
            for (name, child) in entries {
                let node = node_from_json(child, &name)?;
                children.insert(name, node);
            }
            Ok(PathNode::Directory(children))
        }
        other => Err(IndexError::Helper(format!(
            "unexpected value for {context}: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{scan_roots, RootSpec};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Vec<RootSpec>) {
        let temp = TempDir::new().unwrap();
        let photos = temp.path().join("photos");
        let docs = temp.path().join("docs");
        fs::create_dir_all(photos.join("trip")).unwrap();
        fs::create_dir_all(docs.join("empty")).unwrap();
        fs::write(photos.join("a.jpg"), [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).unwrap();
        fs::write(
            photos.join("trip/b.png"),
            [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
        )
        .unwrap();
        fs::write(docs.join("c.txt"), b"c").unwrap();
        let roots = vec![RootSpec::directory(photos), RootSpec::directory(docs)];
        (temp, roots)
    }

    #[test]
    fn in_process_nests_by_root() {
        let (_temp, roots) = fixture();
        let scan = scan_roots(&roots);
        let state = InProcessBuilder::new().build(&scan, &roots).unwrap();

        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["docs", "photos"]);
        let photos = &state["photos"];
        assert_eq!(photos.leaf_count(), 2);
        let nested = photos.get(&["trip", "b.png"]).unwrap();
        assert!(matches!(nested, PathNode::Leaf(leaf) if leaf.path.ends_with("photos/trip/b.png")));
        assert!(state["docs"].get(&["empty"]).is_none());
    }

    #[test]
    fn classification_drops_excluded_types_and_prunes_roots() {
        let (_temp, roots) = fixture();
        let scan = scan_roots(&roots);
        let builder = InProcessBuilder::with_classifier(
            Arc::new(MimeClassifier),
            ClassificationPolicy {
                exclude: vec!["text/".into()],
                keep_unclassified: true,
            },
            2,
        )
        .unwrap();
        let state = builder.build(&scan, &roots).unwrap();

        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["photos"]);
        let Some(PathNode::Leaf(leaf)) = state["photos"].get(&["a.jpg"]) else {
            panic!("a.jpg should be a leaf");
        };
        assert_eq!(leaf.classification.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn vanished_files_are_skipped() {
        let (_temp, roots) = fixture();
        let scan = scan_roots(&roots);
        fs::remove_file(roots[0].path.join("a.jpg")).unwrap();

        let builder = InProcessBuilder::with_classifier(
            Arc::new(MimeClassifier),
            ClassificationPolicy {
                exclude: Vec::new(),
                keep_unclassified: true,
            },
            1,
        )
        .unwrap();
        let state = builder.build(&scan, &roots).unwrap();
        assert!(state["photos"].get(&["a.jpg"]).is_none());
        assert_eq!(state["photos"].leaf_count(), 1);
    }

    #[test]
    fn parses_nested_helper_payload() {
        let payload = br#"{
            "photos": { "a.jpg": "/media/photos/a.jpg", "trip": { "b.jpg": "/media/photos/trip/b.jpg" } },
            "empty": { "nothing": {} }
        }"#;
        let state = parse_helper_payload(payload).unwrap();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["photos"]);
        assert_eq!(
            state["photos"].get(&["trip", "b.jpg"]),
            Some(&PathNode::Leaf(Leaf::new("/media/photos/trip/b.jpg")))
        );
    }

    #[test]
    fn rejects_malformed_helper_payloads() {
        let payloads: [&[u8]; 4] = [
            b"not json",
            br#"["/a"]"#,
            br#"{"photos": "/media/photos/a.jpg"}"#,
            br#"{"photos": {"a.jpg": 42}}"#,
        ];
        for payload in payloads {
            assert!(
                matches!(parse_helper_payload(payload), Err(IndexError::Helper(_))),
                "payload should be rejected: {}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn helper_process_receives_root_paths() {
        let helper = HelperProcessBuilder::new(HelperConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                r#"printf '{"root": {"arg": "%s"}}' "$1""#.into(),
                "helper".into(),
            ],
        });
        let roots = vec![RootSpec::directory("/media/photos")];
        let state = helper.build(&ScanOutcome::default(), &roots).unwrap();
        assert_eq!(
            state["root"].get(&["arg"]),
            Some(&PathNode::Leaf(Leaf::new(Path::new("/media/photos"))))
        );
    }

    #[test]
    fn helper_roots_keyed_by_file_name_take_the_root_name() {
        let roots = vec![
            RootSpec::directory("/media/photos.v2"),
            RootSpec::directory("/media/docs"),
        ];
        let payload = br#"{
            "photos.v2": { "a.jpg": "/media/photos.v2/a.jpg" },
            "photos": { "b.jpg": "/media/photos.v2/b.jpg" },
            "docs": { "c.txt": "/media/docs/c.txt" },
            "extra": { "d.txt": "/elsewhere/d.txt" }
        }"#;
        let state = remap_helper_roots(parse_helper_payload(payload).unwrap(), &roots);

        assert_eq!(
            state.keys().collect::<Vec<_>>(),
            vec!["docs", "extra", "photos"]
        );
        assert_eq!(state["photos"].leaf_count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn helper_keyed_by_directory_name_patches_under_root_name() {
        let temp = TempDir::new().unwrap();
        let photos = temp.path().join("photos.v2");
        fs::create_dir_all(&photos).unwrap();
        let helper = HelperProcessBuilder::new(HelperConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                r#"printf '{"photos.v2": {"a.jpg": "%s/a.jpg"}}' "$1""#.into(),
                "helper".into(),
            ],
        });
        let roots = vec![RootSpec::directory(&photos)];
        let mut state = helper.build(&ScanOutcome::default(), &roots).unwrap();

        assert_eq!(roots[0].name(), "photos");
        assert!(state.remove(&roots[0].name()).is_some());
        assert!(state.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn helper_failure_is_an_error() {
        let helper = HelperProcessBuilder::new(HelperConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
        });
        let error = helper.build(&ScanOutcome::default(), &[]).unwrap_err();
        match error {
            IndexError::Helper(message) => assert!(message.contains("boom"), "{message}"),
            other => panic!("expected helper error, got {other:?}"),
        }
    }

    #[test]
    fn missing_helper_program_is_an_error() {
        let helper = HelperProcessBuilder::new(HelperConfig {
            program: PathBuf::from("/definitely/not/a/helper"),
            args: Vec::new(),
        });
        assert!(matches!(
            helper.build(&ScanOutcome::default(), &[]),
            Err(IndexError::Helper(_))
        ));
    }
}
