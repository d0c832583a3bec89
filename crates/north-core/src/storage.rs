// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! File-backed Storage interface (spec.md §6).
//!
//! Per-repo-root state lives under `<repo_root>/.north/`; the saved model is
//! the one global exception (`~/.config/north/model.json`-equivalent, kept
//! alongside `north-config`'s own config directory). All reads are tolerant
//! of missing or malformed files — storage failures degrade to "feature
//! disabled for this session" (spec.md §7), never a hard error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Allowlist {
    #[serde(default)]
    allowed_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AutoAccept {
    #[serde(default)]
    edits_auto_accept: bool,
    #[serde(default)]
    shell_auto_approve: bool,
}

/// Per-repo-root persisted approval state.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self { dir: repo_root.as_ref().join(".north") }
    }

    fn allowlist_path(&self) -> PathBuf {
        self.dir.join("allowlist.json")
    }

    fn autoaccept_path(&self) -> PathBuf {
        self.dir.join("autoaccept.json")
    }

    fn read_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(?path, error = %e, "malformed storage file, treating as absent");
                T::default()
            }),
            Err(_) => T::default(),
        }
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(?path, error = %e, "failed to create .north directory, storage write skipped");
            return;
        }
        let mut text = match serde_json::to_string_pretty(value) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialize storage value");
                return;
            }
        };
        text.push('\n');
        if let Err(e) = std::fs::write(path, text) {
            warn!(?path, error = %e, "failed to write storage file");
        }
    }

    pub fn is_command_allowed(&self, command: &str) -> bool {
        let list: Allowlist = Self::read_json(&self.allowlist_path());
        list.allowed_commands.iter().any(|c| c == command)
    }

    pub fn allow_command(&self, command: &str) {
        let mut list: Allowlist = Self::read_json(&self.allowlist_path());
        if !list.allowed_commands.iter().any(|c| c == command) {
            list.allowed_commands.push(command.to_string());
        }
        self.write_json(&self.allowlist_path(), &list);
    }

    pub fn is_edits_auto_accept_enabled(&self) -> bool {
        let cfg: AutoAccept = Self::read_json(&self.autoaccept_path());
        cfg.edits_auto_accept
    }

    pub fn enable_edits_auto_accept(&self) {
        let mut cfg: AutoAccept = Self::read_json(&self.autoaccept_path());
        cfg.edits_auto_accept = true;
        self.write_json(&self.autoaccept_path(), &cfg);
    }

    pub fn is_shell_auto_approve_enabled(&self) -> bool {
        let cfg: AutoAccept = Self::read_json(&self.autoaccept_path());
        cfg.shell_auto_approve
    }

    pub fn enable_shell_auto_approve(&self) {
        let mut cfg: AutoAccept = Self::read_json(&self.autoaccept_path());
        cfg.shell_auto_approve = true;
        self.write_json(&self.autoaccept_path(), &cfg);
    }
}

/// Global saved-model preference, not scoped to a repo root.
pub struct GlobalStorage {
    path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SavedModel {
    model: Option<String>,
}

impl GlobalStorage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self { path: config_dir.as_ref().join("model.json") }
    }

    pub fn get_saved_model(&self) -> Option<String> {
        let saved: SavedModel = Storage::read_json(&self.path);
        saved.model
    }

    pub fn save_selected_model(&self, model: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create config directory, model save skipped");
                return;
            }
        }
        let mut text =
            serde_json::to_string_pretty(&SavedModel { model: Some(model.to_string()) }).unwrap_or_default();
        text.push('\n');
        if let Err(e) = std::fs::write(&self.path, text) {
            warn!(error = %e, "failed to persist saved model");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allowlist_starts_empty() {
        let dir = tempdir().unwrap();
        let s = Storage::new(dir.path());
        assert!(!s.is_command_allowed("cargo test"));
    }

    #[test]
    fn allow_command_persists() {
        let dir = tempdir().unwrap();
        let s = Storage::new(dir.path());
        s.allow_command("cargo test");
        assert!(s.is_command_allowed("cargo test"));
        // Re-open from a fresh handle to confirm it was actually written to disk.
        let s2 = Storage::new(dir.path());
        assert!(s2.is_command_allowed("cargo test"));
    }

    #[test]
    fn autoaccept_flags_default_false() {
        let dir = tempdir().unwrap();
        let s = Storage::new(dir.path());
        assert!(!s.is_edits_auto_accept_enabled());
        assert!(!s.is_shell_auto_approve_enabled());
    }

    #[test]
    fn enable_edits_auto_accept_persists_without_clobbering_shell_flag() {
        let dir = tempdir().unwrap();
        let s = Storage::new(dir.path());
        s.enable_shell_auto_approve();
        s.enable_edits_auto_accept();
        assert!(s.is_shell_auto_approve_enabled());
        assert!(s.is_edits_auto_accept_enabled());
    }

    #[test]
    fn malformed_allowlist_file_treated_as_absent() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".north")).unwrap();
        std::fs::write(dir.path().join(".north/allowlist.json"), "not json").unwrap();
        let s = Storage::new(dir.path());
        assert!(!s.is_command_allowed("anything"));
    }

    #[test]
    fn written_json_has_trailing_newline() {
        let dir = tempdir().unwrap();
        let s = Storage::new(dir.path());
        s.allow_command("ls");
        let text = std::fs::read_to_string(dir.path().join(".north/allowlist.json")).unwrap();
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn global_storage_round_trips_model() {
        let dir = tempdir().unwrap();
        let g = GlobalStorage::new(dir.path());
        assert!(g.get_saved_model().is_none());
        g.save_selected_model("claude-opus-4-5");
        assert_eq!(g.get_saved_model().as_deref(), Some("claude-opus-4-5"));
    }
}
