// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable, repo-root-keyed shell service (spec.md §4.3).
//!
//! One persistent `sh` child per repo root, stdin/stdout piped, `exec 2>&1`
//! run once at session start so every subsequent command's stderr merges
//! into the same stream. Commands are framed with a random marker so the
//! reader knows exactly where a command's output ends and what its exit
//! code was, without waiting for EOF (the child never exits between
//! commands).
//!
//! No PTY allocation crate is available in this lineage, so a real terminal
//! is not attached; interactive/full-screen programs are out of scope, same
//! as the tool description already tells the model (one-shot commands only).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use north_tools::{ShellCommandResult, ShellDispatcher};

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

impl ShellSession {
    async fn spawn(repo_root: &str) -> anyhow::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-s")
            .current_dir(repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        // Drop the separate stderr pipe; we merge it into stdout ourselves
        // via `exec 2>&1` below so callers see one combined stream.
        drop(child.stderr.take());

        let mut session = Self { child, stdin, stdout: BufReader::new(stdout) };
        session.stdin.write_all(b"exec 2>&1\n").await?;
        Ok(session)
    }

    async fn run_framed(
        &mut self,
        command: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<ShellCommandResult> {
        let cmd_id = Uuid::new_v4().simple().to_string();
        let script = format!(
            "printf '__NORTH_CMD_START_{cmd_id}_START_\\n'\n{command}\nprintf '\\n__NORTH_CMD_END_{cmd_id}_EXIT_%d_END_\\n' \"$?\"\n"
        );
        self.stdin.write_all(script.as_bytes()).await?;
        self.stdin.flush().await?;

        let start_marker = format!("__NORTH_CMD_START_{cmd_id}_START_");
        let end_re = Regex::new(&format!(r"^__NORTH_CMD_END_{cmd_id}_EXIT_(-?\d+)_END_$")).unwrap();
        let mut output_lines = Vec::new();
        let mut seen_start = false;

        let read_loop = async {
            loop {
                let mut line = String::new();
                let n = self.stdout.read_line(&mut line).await?;
                if n == 0 {
                    anyhow::bail!("shell session exited unexpectedly");
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if !seen_start {
                    if trimmed == start_marker {
                        seen_start = true;
                    }
                    continue;
                }
                if let Some(caps) = end_re.captures(trimmed) {
                    let exit_code: i32 = caps[1].parse().unwrap_or(-1);
                    return Ok(exit_code);
                }
                output_lines.push(trimmed.to_string());
            }
        };

        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), read_loop).await {
            Ok(Ok(exit_code)) => Ok(ShellCommandResult {
                output: output_lines.join("\n"),
                exit_code,
                timed_out: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(%command, timeout_secs, "shell command timed out, killing session");
                let _ = self.child.kill().await;
                Ok(ShellCommandResult { output: output_lines.join("\n"), exit_code: -1, timed_out: true })
            }
        }
    }
}

/// Owns one [`ShellSession`] per repo root and serializes access to each.
#[derive(Default)]
pub struct ShellService {
    sessions: Mutex<HashMap<String, Arc<Mutex<Option<ShellSession>>>>>,
}

impl ShellService {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    async fn session_for(&self, repo_root: &str) -> Arc<Mutex<Option<ShellSession>>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(repo_root.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Tear down the session for one repo root, if any.
    pub async fn dispose(&self, repo_root: &str) {
        let slot = { self.sessions.lock().await.remove(repo_root) };
        if let Some(slot) = slot {
            if let Some(mut session) = slot.lock().await.take() {
                let _ = session.child.kill().await;
            }
        }
    }

    /// Tear down every session this service owns.
    pub async fn dispose_all(&self) {
        let keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for k in keys {
            self.dispose(&k).await;
        }
    }
}

#[async_trait]
impl ShellDispatcher for ShellService {
    async fn run(
        &self,
        repo_root: &str,
        command: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<ShellCommandResult> {
        let slot = self.session_for(repo_root).await;
        let mut guard = match slot.try_lock() {
            Ok(g) => g,
            Err(_) => anyhow::bail!("a command is already running in this shell session"),
        };

        if guard.is_none() {
            debug!(repo_root, "spawning shell session");
            *guard = Some(ShellSession::spawn(repo_root).await?);
        }

        let result = guard.as_mut().unwrap().run_framed(command, timeout_secs).await;
        match &result {
            Ok(r) if r.timed_out => {
                // run_framed already killed the child on timeout.
                *guard = None;
            }
            Err(_) => {
                // Unexpected exit; drop the dead session so the next call respawns.
                *guard = None;
            }
            _ => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_simple_command_and_captures_exit_code() {
        let service = ShellService::new();
        let result = service.run("/tmp", "echo hello", 5).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hello"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_captured() {
        let service = ShellService::new();
        let result = service.run("/tmp", "false", 5).await.unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn stderr_is_merged_into_output() {
        let service = ShellService::new();
        let result = service.run("/tmp", "echo err 1>&2", 5).await.unwrap();
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn session_persists_shell_state_across_commands() {
        let service = ShellService::new();
        service.run("/tmp", "FOO=bar", 5).await.unwrap();
        let result = service.run("/tmp", "echo $FOO", 5).await.unwrap();
        assert_eq!(result.output, "bar");
    }

    #[tokio::test]
    async fn concurrent_call_on_same_repo_root_fails_fast() {
        let service = Arc::new(ShellService::new());
        let s2 = service.clone();
        let slot = service.session_for("/tmp").await;
        let _held = slot.lock().await;
        let err = s2.run("/tmp", "echo hi", 5).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn timeout_kills_session_and_reports_timed_out() {
        let service = ShellService::new();
        let result = service.run("/tmp", "sleep 5", 1).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn dispose_removes_session_so_next_call_respawns() {
        let service = ShellService::new();
        service.run("/tmp", "FOO=bar", 5).await.unwrap();
        service.dispose("/tmp").await;
        let result = service.run("/tmp", "echo ${FOO:-unset}", 5).await.unwrap();
        assert_eq!(result.output, "unset");
    }
}
