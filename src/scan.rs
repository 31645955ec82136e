//! Source tree walking, content fingerprinting and change classification.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestionConfig;
use crate::error::{PipelineError, Result};
use crate::models::{DocumentStatus, IngestionStatus, ScanAction};

pub const DEFAULT_CATEGORY: &str = "general";

/// One file under the scan root that matched the include globs.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub abs_path: PathBuf,
    /// Root-relative path with `/` separators; the key of the ingestion record.
    pub rel_path: String,
}

impl SourceFile {
    /// Resolve `path` (absolute, or relative to `root`) against `root`.
    pub fn resolve(root: &Path, path: &Path) -> Result<Self> {
        let abs_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let relative = abs_path.strip_prefix(root).map_err(|_| {
            PipelineError::Configuration(format!(
                "{} is outside the source root {}",
                abs_path.display(),
                root.display()
            ))
        })?;
        Ok(Self {
            rel_path: normalize(relative),
            abs_path,
        })
    }

    /// First directory component of the relative path, `general` for files
    /// at the root.
    pub fn category(&self) -> String {
        match self.rel_path.split_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => DEFAULT_CATEGORY.to_string(),
        }
    }

    pub fn title(&self) -> String {
        Path::new(&self.rel_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.rel_path.clone())
    }
}

/// Content fingerprint plus the stat fields recorded with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub size: i64,
    pub modified_at: i64,
}

fn normalize(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `root` and return every file matching the configured globs, sorted
/// by relative path.
pub fn walk_tree(root: &Path, config: &IngestionConfig) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "source root does not exist or is not a directory: {}",
            root.display()
        )));
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/~$*".to_string(),
        "**/.~lock.*".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = normalize(relative);

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(SourceFile {
            abs_path: path.to_path_buf(),
            rel_path: rel_str,
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// SHA-256 of the file contents, streamed.
pub fn fingerprint(path: &Path) -> Result<Fingerprint> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;

    let metadata = std::fs::metadata(path)?;
    let modified_at = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    Ok(Fingerprint {
        hash: hex::encode(hasher.finalize()),
        size: metadata.len() as i64,
        modified_at,
    })
}

/// Decide what to do with a file given its stored record and current hash.
pub fn classify(existing: Option<&IngestionStatus>, current_hash: &str) -> ScanAction {
    match existing {
        None => ScanAction::Ingest,
        Some(record) if record.file_hash != current_hash => ScanAction::Reingest,
        Some(record) if record.status == DocumentStatus::Completed => ScanAction::Skip,
        // failed, partial, or interrupted mid-run (processing / pending)
        Some(_) => ScanAction::CleanupAndReingest,
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            PipelineError::Configuration(format!("invalid glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Configuration(e.to_string()))
}
