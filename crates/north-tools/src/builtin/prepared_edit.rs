// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared output shape for the write-category tools (`write_file`,
//! `edit_file`, `delete_file`).
//!
//! None of these tools touch the filesystem. Each computes the file content
//! it *would* produce and returns `{diffs_by_file, apply_payload, stats}` as
//! its `ToolOutput` content — the orchestrator applies `apply_payload`
//! atomically only once a review gate accepts it.

use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};

fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}

fn count_changed_lines(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    (added, removed)
}

/// Build the prepared-edit payload for a tool that writes `new` over `old`
/// (creating the file if `old` is empty because it didn't exist).
pub fn prepared_write(path: &str, old: &str, new: &str) -> Value {
    let (added, removed) = count_changed_lines(old, new);
    json!({
        "diffs_by_file": [{"path": path, "diff": unified_diff(path, old, new)}],
        "apply_payload": {"ops": [{"op": "write", "path": path, "content": new}]},
        "stats": {
            "files_changed": 1,
            "total_lines_added": added,
            "total_lines_removed": removed,
        }
    })
}

/// Build the prepared-edit payload for a tool that deletes a file whose
/// current content is `old`.
pub fn prepared_delete(path: &str, old: &str) -> Value {
    let (added, removed) = count_changed_lines(old, "");
    json!({
        "diffs_by_file": [{"path": path, "diff": unified_diff(path, old, "")}],
        "apply_payload": {"ops": [{"op": "delete", "path": path}]},
        "stats": {
            "files_changed": 1,
            "total_lines_added": added,
            "total_lines_removed": removed,
        }
    })
}
