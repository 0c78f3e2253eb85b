//! Local filesystem uploads.
//!
//! Walks a directory with `walkdir`, filters paths through the
//! `ingest.include_globs` / `ingest.exclude_globs` sets, and turns each
//! matching file into a [`NewDocument`] for registration.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::models::{FileType, NewDocument};

/// A file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scan root, used for glob matching and ordering.
    pub relative: String,
    pub file_type: FileType,
}

/// Find every uploadable file under `root`, sorted by relative path.
///
/// Files whose extension is not a known [`FileType`] are skipped even if
/// they match an include glob.
pub fn scan_directory(root: &Path, config: &IngestConfig) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        bail!("Upload directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let Some(file_type) = FileType::from_filename(&rel_str) else {
            continue;
        };

        files.push(ScannedFile {
            path: path.to_path_buf(),
            relative: rel_str,
            file_type,
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(files)
}

/// Read a file into an upload. `file_type` overrides detection by extension.
pub fn load_upload(path: &Path, file_type: Option<FileType>) -> Result<NewDocument> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let file_type = match file_type {
        Some(ft) => ft,
        None => FileType::from_filename(&filename).with_context(|| {
            format!(
                "Cannot determine file type of {}; pass --type (pdf, docx, xlsx, csv, txt)",
                path.display()
            )
        })?,
    };

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(NewDocument {
        filename,
        file_type,
        bytes,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
