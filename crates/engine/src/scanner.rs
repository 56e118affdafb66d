//! Read-only vault walk that collects checklist items from every note.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::codec::parse_line;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Note extension without the dot.
    pub extension: String,
    /// Vault name used in deep links; defaults to the root directory name.
    pub vault_name: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extension: "md".to_string(),
            vault_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultTask {
    /// 1-indexed line in the note.
    pub line: usize,
    pub text: String,
    pub completed: bool,
    pub link: String,
}

/// Tasks grouped by note path relative to the vault root, `/`-separated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VaultTasks {
    pub vault: String,
    pub notes: BTreeMap<String, Vec<VaultTask>>,
}

impl VaultTasks {
    pub fn task_count(&self) -> usize {
        self.notes.values().map(Vec::len).sum()
    }

    pub fn open_count(&self) -> usize {
        self.notes
            .values()
            .flatten()
            .filter(|task| !task.completed)
            .count()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// `obsidian://open?vault=<vault>&file=<note path without extension>`.
pub fn deep_link(vault: &str, note: &str, extension: &str) -> String {
    let suffix = format!(".{extension}");
    let file = note.strip_suffix(suffix.as_str()).unwrap_or(note);
    format!(
        "obsidian://open?vault={}&file={}",
        utf8_percent_encode(vault, NON_ALPHANUMERIC),
        utf8_percent_encode(file, NON_ALPHANUMERIC)
    )
}

fn scan_note(text: &str, vault: &str, note: &str, extension: &str) -> Vec<VaultTask> {
    let link = deep_link(vault, note, extension);
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let parsed = parse_line(line.trim_start()).ok()?;
            Some(VaultTask {
                line: index + 1,
                text: parsed.text.to_string(),
                completed: parsed.completed,
                link: link.clone(),
            })
        })
        .collect()
}

/// Walk `root` and collect every checklist line from notes with the
/// configured extension.  Hidden files and directories are skipped; a note
/// that cannot be read is logged and left out.
pub fn scan_vault(root: &Path, options: &ScanOptions) -> Result<VaultTasks> {
    let root: PathBuf = root.to_path_buf();
    if !root.is_dir() {
        return Err(SyncError::invalid(
            root.display().to_string(),
            "vault root is not a directory",
        ));
    }
    let vault = options.vault_name.clone().unwrap_or_else(|| {
        root.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    let mut tasks = VaultTasks {
        vault: vault.clone(),
        notes: BTreeMap::new(),
    };
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable vault entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(options.extension.as_str()) {
            continue;
        }
        let Some(note) = relative_key(&root, path) else {
            continue;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable note");
                continue;
            }
        };
        let found = scan_note(&text, &vault, &note, &options.extension);
        if !found.is_empty() {
            debug!(%note, tasks = found.len(), "note scanned");
            tasks.notes.insert(note, found);
        }
    }
    Ok(tasks)
}
