//! Best-effort file type classification.
//!
//! Probes run on a bounded rayon pool; [`classify_all`] returns only after
//! every probe of the batch has resolved.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::ClassifyConfig;
use crate::error::{IndexError, Result};
use crate::scan::ScannedFile;

/// Result of probing one file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Probe {
    /// Type determined, as a MIME string.
    Classified(String),
    /// File exists but its type could not be determined.
    Unknown,
    /// File disappeared since it was enumerated.
    Vanished,
}

pub trait Classifier: Send + Sync {
    fn classify(&self, path: &Path) -> Probe;
}

/// Bytes read from the head of a file for sniffing.
const SNIFF_LEN: usize = 8192;

/// Sniffs MIME types from file content, falling back to the extension.
///
/// Magic numbers win over the extension. A file with no known signature whose
/// head is NUL-free UTF-8 is `text/plain`, unless the extension names a text
/// based type such as `text/csv` or `image/svg+xml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeClassifier;

impl Classifier for MimeClassifier {
    fn classify(&self, path: &Path) -> Probe {
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_file() => {}
            _ => return Probe::Vanished,
        }
        let header = match read_header(path) {
            Ok(header) => header,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Probe::Vanished,
            Err(error) => {
                tracing::debug!("failed to read {}: {}", path.display(), error);
                return Probe::Unknown;
            }
        };
        if let Some(kind) = infer::get(&header) {
            return Probe::Classified(kind.mime_type().to_string());
        }

        let looks_like_text = !header.is_empty() && is_text(&header);
        match mime_guess::from_path(path).first() {
            Some(mime) if looks_like_text && is_binary_media(&mime) => {
                Probe::Classified(TEXT_PLAIN.to_string())
            }
            Some(mime) => Probe::Classified(mime.essence_str().to_string()),
            None if looks_like_text => Probe::Classified(TEXT_PLAIN.to_string()),
            None => Probe::Unknown,
        }
    }
}

const TEXT_PLAIN: &str = "text/plain";

fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}

/// NUL-free and valid UTF-8, allowing a character cut off at the end.
fn is_text(header: &[u8]) -> bool {
    if header.contains(&0) {
        return false;
    }
    match std::str::from_utf8(header) {
        Ok(_) => true,
        Err(error) => error.error_len().is_none(),
    }
}

/// Types whose content is never plain text.
fn is_binary_media(mime: &mime_guess::Mime) -> bool {
    let binary_type = matches!(mime.type_().as_str(), "image" | "audio" | "video" | "font");
    binary_type && mime.suffix().is_none()
}

/// What happens to a leaf depending on its probe result.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ClassificationPolicy {
    /// MIME prefixes that exclude a file from the index.
    pub exclude: Vec<String>,
    /// Keep files whose probe returned [`Probe::Unknown`].
    pub keep_unclassified: bool,
}

/// Decision for one file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Verdict {
    Keep(Option<String>),
    Drop,
}

impl ClassificationPolicy {
    pub fn from_config(config: &ClassifyConfig) -> Self {
        Self {
            exclude: config.exclude.clone(),
            keep_unclassified: config.keep_unclassified,
        }
    }

    pub fn verdict(&self, probe: Probe) -> Verdict {
        match probe {
            Probe::Classified(mime) => {
                if self.exclude.iter().any(|prefix| mime.starts_with(prefix.as_str())) {
                    Verdict::Drop
                } else {
                    Verdict::Keep(Some(mime))
                }
            }
            Probe::Unknown if self.keep_unclassified => Verdict::Keep(None),
            Probe::Unknown | Probe::Vanished => Verdict::Drop,
        }
    }
}

/// Builds the probe worker pool.
pub fn build_pool(workers: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("pathindex-probe-{index}"))
        .build()
        .map_err(|error| IndexError::Internal(format!("failed to build probe pool: {error}")))
}

/// Classifies every file on `pool` and returns one verdict per input, in
/// input order.
pub fn classify_all(
    files: &[ScannedFile],
    classifier: &dyn Classifier,
    policy: &ClassificationPolicy,
    pool: &ThreadPool,
) -> Vec<Verdict> {
    pool.install(|| {
        files
            .par_iter()
            .map(|file| policy.verdict(classifier.classify(&file.path)))
            .collect()
    })
}
