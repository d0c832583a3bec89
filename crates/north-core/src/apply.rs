// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Atomic edit application (spec.md §4.8).
//!
//! A `diff_review` entry's `apply_payload` is opaque JSON until a gate
//! resolves to accept/always; only then does the orchestrator hand it here.
//! Every target path is resolved inside the repo root — `..` escapes and
//! absolute paths outside root are rejected — and every operation is
//! validated before any file is touched, so a single bad op in a multi-file
//! payload never leaves a partial write observable.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ApplyOp {
    Write { path: String, content: String },
    Delete { path: String },
}

#[derive(Debug, Deserialize)]
struct ApplyPayload {
    ops: Vec<ApplyOp>,
}

/// Resolve `raw` inside `repo_root`, rejecting absolute paths and `..`
/// components that would escape it.
fn resolve_in_root(repo_root: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        bail!("path '{raw}' is absolute; apply payloads must use repo-relative paths");
    }
    let mut resolved = repo_root.to_path_buf();
    for component in candidate.components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                bail!("path '{raw}' escapes the repo root via '..'");
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path '{raw}' is absolute; apply payloads must use repo-relative paths");
            }
        }
    }
    if !resolved.starts_with(repo_root) {
        bail!("path '{raw}' escapes the repo root");
    }
    Ok(resolved)
}

/// A validated, ready-to-perform operation against an absolute path.
enum StagedOp {
    Write { target: PathBuf, content: String },
    Delete { target: PathBuf },
}

fn stage(repo_root: &Path, ops: &[ApplyOp]) -> Result<Vec<StagedOp>> {
    ops.iter()
        .map(|op| match op {
            ApplyOp::Write { path, content } => Ok(StagedOp::Write {
                target: resolve_in_root(repo_root, path)?,
                content: content.clone(),
            }),
            ApplyOp::Delete { path } => Ok(StagedOp::Delete { target: resolve_in_root(repo_root, path)? }),
        })
        .collect()
}

async fn write_atomically(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating parent directories for {}", target.display()))?;
    }
    let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or("tmp");
    let tmp = target.with_file_name(format!("{file_name}.north-tmp"));
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("writing temp file for {}", target.display()))?;
    tokio::fs::rename(&tmp, target)
        .await
        .with_context(|| format!("renaming temp file into place for {}", target.display()))?;
    Ok(())
}

/// Parse and apply an `apply_payload` value against files under `repo_root`.
///
/// Validates every operation's target path before performing any filesystem
/// mutation. Returns `Err` describing the first problem found; on success all
/// operations have completed.
pub async fn apply(repo_root: &Path, payload: &serde_json::Value) -> Result<()> {
    let parsed: ApplyPayload =
        serde_json::from_value(payload.clone()).context("apply_payload did not match the expected shape")?;
    let staged = stage(repo_root, &parsed.ops)?;

    for op in &staged {
        match op {
            StagedOp::Write { target, content } => {
                debug!(target = %target.display(), "applying prepared write");
                write_atomically(target, content).await?;
            }
            StagedOp::Delete { target } => {
                debug!(target = %target.display(), "applying prepared delete");
                match tokio::fs::remove_file(target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("deleting {}", target.display())),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_op_creates_file_with_content() {
        let dir = tempdir().unwrap();
        let payload = json!({"ops": [{"op": "write", "path": "a.txt", "content": "hello\n"}]});
        apply(dir.path(), &payload).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn write_op_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let payload = json!({"ops": [{"op": "write", "path": "nested/deep/a.txt", "content": "x"}]});
        apply(dir.path(), &payload).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("nested/deep/a.txt")).unwrap(), "x");
    }

    #[tokio::test]
    async fn delete_op_removes_existing_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        let payload = json!({"ops": [{"op": "delete", "path": "gone.txt"}]});
        apply(dir.path(), &payload).await.unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn delete_op_on_missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let payload = json!({"ops": [{"op": "delete", "path": "never_existed.txt"}]});
        apply(dir.path(), &payload).await.unwrap();
    }

    #[tokio::test]
    async fn parent_dir_escape_is_rejected_and_nothing_is_written() {
        let dir = tempdir().unwrap();
        let payload = json!({"ops": [
            {"op": "write", "path": "safe.txt", "content": "ok"},
            {"op": "write", "path": "../escape.txt", "content": "bad"},
        ]});
        let err = apply(dir.path(), &payload).await.unwrap_err();
        assert!(err.to_string().contains(".."), "{err}");
        assert!(!dir.path().join("safe.txt").exists(), "earlier op must not have run");
    }

    #[tokio::test]
    async fn absolute_path_is_rejected() {
        let dir = tempdir().unwrap();
        let payload = json!({"ops": [{"op": "write", "path": "/etc/passwd", "content": "x"}]});
        let err = apply(dir.path(), &payload).await.unwrap_err();
        assert!(err.to_string().contains("absolute"), "{err}");
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let payload = json!({"ops": [{"op": "write", "path": "a.txt", "content": "new"}]});
        apply(dir.path(), &payload).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn multi_op_payload_applies_all_ops() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "x").unwrap();
        let payload = json!({"ops": [
            {"op": "write", "path": "new.txt", "content": "fresh"},
            {"op": "delete", "path": "old.txt"},
        ]});
        apply(dir.path(), &payload).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "fresh");
        assert!(!dir.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let payload = json!({"not_ops": []});
        let err = apply(dir.path(), &payload).await.unwrap_err();
        assert!(err.to_string().contains("apply_payload"));
    }
}
