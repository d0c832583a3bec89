// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The append-only transcript and session state snapshot.
//!
//! Mirrors the data model of the teacher's flat `Session`/`TurnRecord` pair,
//! but generalised to typed [`Entry`] variants so write/shell/command review
//! state lives directly in the transcript instead of a side log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// One tool invocation requested by the model within an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Per-file diff produced by a write-tool's prepared edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditStats {
    pub files_changed: usize,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteReviewStatus {
    Pending,
    Accepted,
    Always,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellReviewStatus {
    Pending,
    Ran,
    Always,
    Auto,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReviewStatus {
    Pending,
    Selected,
    Cancelled,
}

/// Captured result of a shell command, as recorded in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResult {
    pub output: String,
    pub exit_code: i32,
    /// Set on the synthetic result synthesised for a denied gate.
    #[serde(default)]
    pub denied: bool,
}

/// One append-only record in the conversation transcript.
///
/// Every variant carries a stable `id` (used by review gates, by
/// `assistantEntryId -> toolCalls` lookups, and by wire-message
/// reconstruction) and a `timestamp`. Entries are otherwise append-only,
/// with two exceptions: the three review-entry variants' `status` field
/// transitions exactly once per spec.md's gate state machines, and an
/// `Assistant` entry's `text`/`tool_calls`/`is_streaming` are finalized in
/// place once via [`Session::finish_assistant`] after being allocated
/// empty and streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    User {
        id: String,
        timestamp: DateTime<Utc>,
        text: String,
    },
    Assistant {
        id: String,
        timestamp: DateTime<Utc>,
        text: String,
        tool_calls: Vec<ToolCallRecord>,
        is_streaming: bool,
    },
    /// A completed, non-gated tool call (read-only tools, and write/shell
    /// calls once their gate has already resolved and been folded back).
    Tool {
        id: String,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    DiffReview {
        id: String,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        diffs_by_file: Vec<FileDiff>,
        apply_payload: serde_json::Value,
        stats: EditStats,
        status: WriteReviewStatus,
        applied: Option<bool>,
        reason: Option<String>,
    },
    ShellReview {
        id: String,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        command: String,
        status: ShellReviewStatus,
        result: Option<ShellResult>,
    },
    CommandReview {
        id: String,
        timestamp: DateTime<Utc>,
        name: String,
        prompt: String,
        options: Vec<String>,
        status: CommandReviewStatus,
        selected: Option<String>,
    },
    CommandExecuted {
        id: String,
        timestamp: DateTime<Utc>,
        name: String,
        args: Vec<String>,
        output: String,
    },
}

impl Entry {
    pub fn id(&self) -> &str {
        match self {
            Entry::User { id, .. }
            | Entry::Assistant { id, .. }
            | Entry::Tool { id, .. }
            | Entry::DiffReview { id, .. }
            | Entry::ShellReview { id, .. }
            | Entry::CommandReview { id, .. }
            | Entry::CommandExecuted { id, .. } => id,
        }
    }

    pub fn new_user(text: impl Into<String>) -> Self {
        Entry::User { id: new_id(), timestamp: now(), text: text.into() }
    }

    /// A finalized (non-streaming) assistant entry, for tests and callers
    /// that already know the full text and tool calls up front.
    pub fn new_assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Entry::Assistant { id: new_id(), timestamp: now(), text: text.into(), tool_calls, is_streaming: false }
    }

    /// Allocates the entry before the round's outcome is known: empty text,
    /// no tool calls yet, `is_streaming = true` (spec.md §4.6 step 2). The
    /// caller finalizes it in place via [`Session::finish_assistant`] once
    /// the round resolves, so its id never changes mid-turn.
    pub fn new_assistant_streaming() -> Self {
        Entry::Assistant { id: new_id(), timestamp: now(), text: String::new(), tool_calls: Vec::new(), is_streaming: true }
    }

    pub fn new_tool(tool_call_id: impl Into<String>, name: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Entry::Tool {
            id: new_id(),
            timestamp: now(),
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            output: output.into(),
            is_error,
        }
    }

    pub fn new_diff_review(
        tool_call_id: impl Into<String>,
        diffs_by_file: Vec<FileDiff>,
        apply_payload: serde_json::Value,
        stats: EditStats,
    ) -> Self {
        Entry::DiffReview {
            id: new_id(),
            timestamp: now(),
            tool_call_id: tool_call_id.into(),
            diffs_by_file,
            apply_payload,
            stats,
            status: WriteReviewStatus::Pending,
            applied: None,
            reason: None,
        }
    }

    pub fn new_shell_review(tool_call_id: impl Into<String>, command: impl Into<String>) -> Self {
        Entry::ShellReview {
            id: new_id(),
            timestamp: now(),
            tool_call_id: tool_call_id.into(),
            command: command.into(),
            status: ShellReviewStatus::Pending,
            result: None,
        }
    }

    pub fn new_command_review(name: impl Into<String>, prompt: impl Into<String>, options: Vec<String>) -> Self {
        Entry::CommandReview {
            id: new_id(),
            timestamp: now(),
            name: name.into(),
            prompt: prompt.into(),
            options,
            status: CommandReviewStatus::Pending,
            selected: None,
        }
    }

    pub fn new_command_executed(name: impl Into<String>, args: Vec<String>, output: impl Into<String>) -> Self {
        Entry::CommandExecuted { id: new_id(), timestamp: now(), name: name.into(), args, output: output.into() }
    }
}

/// Goal/decisions/constraints/open-tasks/important-files rolling summary
/// produced by compaction (spec.md §4.5). Replayed into the wire messages
/// as a synthetic user/assistant acknowledgment pair on every round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingSummary {
    pub goal: String,
    pub decisions: Vec<String>,
    pub constraints: Vec<String>,
    pub open_tasks: Vec<String>,
    pub important_files: Vec<String>,
}

/// What kind of review gate is currently suspending the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Write,
    Shell,
    Command,
}

/// Immutable snapshot of [`Session`] state, handed to the View.
///
/// `contextUsage` is `contextUsedTokens / contextLimitTokens`, pre-divided so
/// the View never has to guard against a zero denominator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub transcript: Vec<Entry>,
    pub is_processing: bool,
    pub pending_review_id: Option<String>,
    pub current_model: String,
    pub context_used_tokens: usize,
    pub context_limit_tokens: usize,
    pub context_usage: f32,
}

/// Durable fields needed to resume a session across a process restart.
/// Excludes the in-flight cancellation/streaming handles, which cannot
/// (and need not) survive a restart — a resumed session is never mid-turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub transcript: Vec<Entry>,
    pub rolling_summary: Option<RollingSummary>,
    pub current_model: String,
    pub context_limit_tokens: usize,
}

/// Owns the transcript and the bookkeeping the orchestrator needs to
/// reconstruct wire messages and route tool results back to their gates.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub transcript: Vec<Entry>,
    pub rolling_summary: Option<RollingSummary>,
    pub current_model: String,
    pub context_limit_tokens: usize,
    pub context_used_tokens: usize,
    pub is_processing: bool,
    pub stopped: bool,
    pub cancelled: bool,
    pub pending_review_id: Option<String>,
}

impl Session {
    pub fn new(current_model: impl Into<String>, context_limit_tokens: usize) -> Self {
        Self {
            id: new_id(),
            transcript: Vec::new(),
            rolling_summary: None,
            current_model: current_model.into(),
            context_limit_tokens,
            context_used_tokens: 0,
            is_processing: false,
            stopped: false,
            cancelled: false,
            pending_review_id: None,
        }
    }

    pub fn push(&mut self, entry: Entry) -> String {
        let id = entry.id().to_string();
        self.transcript.push(entry);
        id
    }

    /// Finalizes a streaming assistant entry in place: sets its final text
    /// and tool calls, clears `is_streaming`. The entry's id and position in
    /// the transcript never change, so a View following the stream doesn't
    /// need to reconcile a swap.
    pub fn finish_assistant(&mut self, id: &str, text: impl Into<String>, tool_calls: Vec<ToolCallRecord>) {
        if let Some(Entry::Assistant { text: t, tool_calls: tc, is_streaming, .. }) = self.find_mut(id) {
            *t = text.into();
            *tc = tool_calls;
            *is_streaming = false;
        }
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.transcript.iter_mut().find(|e| e.id() == id)
    }

    pub fn find(&self, id: &str) -> Option<&Entry> {
        self.transcript.iter().find(|e| e.id() == id)
    }

    /// Invariant check: `pendingReviewId = None` iff there is no pending gate.
    pub fn has_pending_gate(&self) -> bool {
        match &self.pending_review_id {
            None => false,
            Some(id) => matches!(
                self.find(id),
                Some(Entry::DiffReview { status: WriteReviewStatus::Pending, .. })
                    | Some(Entry::ShellReview { status: ShellReviewStatus::Pending, .. })
                    | Some(Entry::CommandReview { status: CommandReviewStatus::Pending, .. })
            ),
        }
    }

    pub fn context_usage(&self) -> f32 {
        if self.context_limit_tokens == 0 {
            0.0
        } else {
            self.context_used_tokens as f32 / self.context_limit_tokens as f32
        }
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState {
            transcript: self.transcript.clone(),
            is_processing: self.is_processing,
            pending_review_id: self.pending_review_id.clone(),
            current_model: self.current_model.clone(),
            context_used_tokens: self.context_used_tokens,
            context_limit_tokens: self.context_limit_tokens,
            context_usage: self.context_usage(),
        }
    }

    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transcript: self.transcript.clone(),
            rolling_summary: self.rolling_summary.clone(),
            current_model: self.current_model.clone(),
            context_limit_tokens: self.context_limit_tokens,
        }
    }

    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            id: new_id(),
            transcript: snapshot.transcript,
            rolling_summary: snapshot.rolling_summary,
            current_model: snapshot.current_model,
            context_limit_tokens: snapshot.context_limit_tokens,
            context_used_tokens: 0,
            is_processing: false,
            stopped: false,
            cancelled: false,
            pending_review_id: None,
        }
    }

    /// Trim the transcript to the last `keep_last` user/assistant entries,
    /// dropping `Tool`/`CommandExecuted` entries outside that window while
    /// always keeping resolved review entries (spec.md §4.5 step 3).
    pub fn trim_to_last(&mut self, keep_last: usize) {
        let mut turn_boundaries = 0usize;
        let mut cut = 0usize;
        for (idx, entry) in self.transcript.iter().enumerate().rev() {
            if matches!(entry, Entry::User { .. } | Entry::Assistant { .. }) {
                turn_boundaries += 1;
            }
            if turn_boundaries > keep_last {
                cut = idx + 1;
                break;
            }
        }
        if cut == 0 {
            return;
        }
        let mut kept: Vec<Entry> = self.transcript[..cut]
            .iter()
            .filter(|e| {
                !matches!(
                    e,
                    Entry::Tool { .. } | Entry::CommandExecuted { .. }
                )
            })
            .cloned()
            .collect();
        kept.extend(self.transcript[cut..].iter().cloned());
        self.transcript = kept;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_assigns_stable_id_and_returns_it() {
        let mut s = Session::new("claude-sonnet-4-5", 200_000);
        let id = s.push(Entry::new_user("hi"));
        assert_eq!(s.find(&id).unwrap().id(), id);
    }

    #[test]
    fn no_pending_gate_by_default() {
        let s = Session::new("m", 1000);
        assert!(!s.has_pending_gate());
    }

    #[test]
    fn pending_diff_review_is_a_pending_gate() {
        let mut s = Session::new("m", 1000);
        let id = s.push(Entry::new_diff_review("tc1", vec![], serde_json::json!({}), EditStats::default()));
        s.pending_review_id = Some(id);
        assert!(s.has_pending_gate());
    }

    #[test]
    fn resolved_review_is_not_a_pending_gate() {
        let mut s = Session::new("m", 1000);
        let id = s.push(Entry::new_shell_review("tc1", "ls"));
        s.pending_review_id = Some(id.clone());
        if let Some(Entry::ShellReview { status, .. }) = s.find_mut(&id) {
            *status = ShellReviewStatus::Ran;
        }
        assert!(!s.has_pending_gate());
    }

    #[test]
    fn context_usage_is_zero_when_limit_is_zero() {
        let s = Session::new("m", 0);
        assert_eq!(s.context_usage(), 0.0);
    }

    #[test]
    fn context_usage_divides_used_by_limit() {
        let mut s = Session::new("m", 1000);
        s.context_used_tokens = 920;
        assert!((s.context_usage() - 0.92).abs() < 1e-6);
    }

    #[test]
    fn trim_to_last_keeps_recent_turns_and_drops_old_tool_entries() {
        let mut s = Session::new("m", 1000);
        for i in 0..15 {
            s.push(Entry::new_user(format!("u{i}")));
            s.push(Entry::new_tool("tc", "read_file", "body", false));
            s.push(Entry::new_assistant(format!("a{i}"), vec![]));
        }
        s.trim_to_last(2);
        // Only the last 2 user/assistant turns (4 entries) remain, with their
        // Tool entries dropped — 4 user/assistant entries, 0 tool entries.
        let user_assistant = s
            .transcript
            .iter()
            .filter(|e| matches!(e, Entry::User { .. } | Entry::Assistant { .. }))
            .count();
        let tools = s.transcript.iter().filter(|e| matches!(e, Entry::Tool { .. })).count();
        assert_eq!(user_assistant, 4);
        assert_eq!(tools, 0);
    }

    #[test]
    fn trim_to_last_keeps_resolved_review_entries_in_window() {
        let mut s = Session::new("m", 1000);
        s.push(Entry::new_user("u0"));
        let rid = s.push(Entry::new_shell_review("tc1", "ls"));
        if let Some(Entry::ShellReview { status, result, .. }) = s.find_mut(&rid) {
            *status = ShellReviewStatus::Ran;
            *result = Some(ShellResult { output: "ok".into(), exit_code: 0, denied: false });
        }
        s.push(Entry::new_assistant("a0", vec![]));
        for i in 1..15 {
            s.push(Entry::new_user(format!("u{i}")));
            s.push(Entry::new_assistant(format!("a{i}"), vec![]));
        }
        s.trim_to_last(2);
        assert!(s.transcript.iter().any(|e| e.id() == rid));
    }

    #[test]
    fn snapshot_exposes_context_usage() {
        let mut s = Session::new("m", 1000);
        s.context_used_tokens = 500;
        let snap = s.snapshot();
        assert_eq!(snap.context_usage, 0.5);
        assert_eq!(snap.current_model, "m");
    }

    #[test]
    fn restore_resets_transient_flags() {
        let mut s = Session::new("m", 1000);
        s.push(Entry::new_user("hi"));
        s.is_processing = true;
        s.pending_review_id = Some("x".into());
        let snap = s.to_snapshot();
        let restored = Session::restore(snap);
        assert!(!restored.is_processing);
        assert!(restored.pending_review_id.is_none());
        assert_eq!(restored.transcript.len(), 1);
    }
}
