// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Conversation Orchestrator run loop (spec.md §4.6-§4.9).
//!
//! One `Orchestrator` owns one session end to end: it appends the user
//! message, drives Provider rounds, dispatches tool calls sequentially by
//! write/shell/other category, suspends the loop at a review gate, and
//! resumes it when an [`OrchestratorHandle`] (the View's side of the gate)
//! delivers a decision. The handle is a cheap `Clone` over the same shared
//! gate/cancellation state, so resolving a gate never needs `&mut` access to
//! the orchestrator that's parked awaiting it — only one `PendingGate` is
//! ever live at a time, mirroring the invariant in [`crate::review`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use north_config::{AgentConfig, AgentMode, ToolsConfig};
use north_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, ToolResultInput};
use north_tools::{ApprovalPolicy, Tool, ToolCall, ToolPolicy, ToolRegistry};

use crate::commands::{extract_leading_commands, CommandContext, CommandRegistry};
use crate::compact::{estimate_prompt_tokens, run_compaction, serialize_history, CompactionOutcome};
use crate::prompts::{system_prompt, PromptContext};
use crate::review::{open_shell_gate, open_write_gate, CommandDecision, GateHandle, PendingGate, ShellDecision, WriteDecision};
use crate::session::{
    EditStats, Entry, FileDiff, Session, ShellResult, ShellReviewStatus, ToolCallRecord, WriteReviewStatus,
};
use crate::storage::Storage;
use crate::wire::build_wire_messages;

const RETRY_BASE_MS: u64 = 500;
const MAX_RETRIES: u32 = 4;
const JITTER_MS_RANGE: u64 = 250;

fn classify(name: &str) -> ToolCategory {
    match name {
        "write_file" | "edit_file" | "delete_file" => ToolCategory::Write,
        "run_terminal_command" => ToolCategory::Shell,
        _ => ToolCategory::Other,
    }
}

enum ToolCategory {
    Write,
    Shell,
    Other,
}

enum RoundOutcome {
    Final(String),
    ToolCalls(String, Vec<ToolCallRecord>),
    /// Cancelled mid-round; carries whatever text had streamed in so far.
    Cancelled(String),
    /// Terminal provider error (retry cap exceeded or non-retryable).
    Errored(String),
}

enum DispatchOutcome {
    Completed,
    Suspended,
}

/// Shared handle to an in-flight [`Orchestrator`]'s gate and cancellation
/// state. Cloning is cheap; every clone resolves the same live gate.
#[derive(Clone)]
pub struct OrchestratorHandle {
    pending_gate: Arc<Mutex<Option<PendingGate>>>,
    cancel_notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl OrchestratorHandle {
    async fn take_gate_matching(&self, entry_id: &str) -> Result<PendingGate> {
        let mut guard = self.pending_gate.lock().await;
        match guard.take() {
            Some(gate) if gate.entry_id() == entry_id => Ok(gate),
            Some(other) => {
                let found = other.entry_id().to_string();
                *guard = Some(other);
                anyhow::bail!("pending gate is for entry '{found}', not '{entry_id}'")
            }
            None => anyhow::bail!("no review gate is pending"),
        }
    }

    /// Peek the entry id of whatever gate is currently open, if any, without
    /// taking it. Lets a View discover a freshly opened gate (e.g. to learn
    /// which `reviewId` to echo back) without needing `&mut Orchestrator` —
    /// the run loop may still be parked awaiting this very gate.
    pub async fn pending_review_id(&self) -> Option<String> {
        self.pending_gate.lock().await.as_ref().map(|g| g.entry_id().to_string())
    }

    pub async fn resolve_write(&self, entry_id: &str, decision: WriteDecision) -> Result<()> {
        match self.take_gate_matching(entry_id).await? {
            PendingGate::Write { resolve, .. } => {
                let _ = resolve.send(decision);
                Ok(())
            }
            other => {
                *self.pending_gate.lock().await = Some(other);
                anyhow::bail!("pending gate for '{entry_id}' is not a write gate")
            }
        }
    }

    pub async fn resolve_shell(&self, entry_id: &str, decision: ShellDecision) -> Result<()> {
        match self.take_gate_matching(entry_id).await? {
            PendingGate::Shell { resolve, .. } => {
                let _ = resolve.send(decision);
                Ok(())
            }
            other => {
                *self.pending_gate.lock().await = Some(other);
                anyhow::bail!("pending gate for '{entry_id}' is not a shell gate")
            }
        }
    }

    pub async fn resolve_command(&self, entry_id: &str, decision: CommandDecision) -> Result<()> {
        match self.take_gate_matching(entry_id).await? {
            PendingGate::Command { resolve, .. } => {
                let _ = resolve.send(decision);
                Ok(())
            }
            other => {
                *self.pending_gate.lock().await = Some(other);
                anyhow::bail!("pending gate for '{entry_id}' is not a command gate")
            }
        }
    }

    /// spec.md §4.9 `cancel()`: abort whatever is in flight — a pending gate
    /// resolves to its terminal-reject decision, and a live Provider/shell
    /// await racing `cancel_notify` is unblocked.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        if let Some(gate) = self.pending_gate.lock().await.take() {
            gate.resolve_to_terminal_reject();
        }
    }

    /// spec.md §4.9 `stop()`: cancel, then latch so future `sendMessage`
    /// calls are no-ops.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Drives one session's Provider rounds and tool dispatch to completion or
/// suspension (spec.md §4.6).
pub struct Orchestrator {
    pub session: Session,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn ModelProvider>,
    shell: Arc<dyn north_tools::ShellDispatcher>,
    storage: Storage,
    tool_policy: ToolPolicy,
    config: AgentConfig,
    repo_root: PathBuf,
    mode: AgentMode,
    command_registry: CommandRegistry,
    exit_requested: bool,
    pending_gate: Arc<Mutex<Option<PendingGate>>>,
    cancel_notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        session: Session,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn ModelProvider>,
        shell: Arc<dyn north_tools::ShellDispatcher>,
        tools_config: &ToolsConfig,
        config: AgentConfig,
        repo_root: impl Into<PathBuf>,
        mode: AgentMode,
    ) -> Self {
        let repo_root = repo_root.into();
        Self {
            session,
            registry,
            provider,
            shell,
            storage: Storage::new(&repo_root),
            tool_policy: ToolPolicy::from_config(tools_config),
            config,
            repo_root,
            mode,
            command_registry: CommandRegistry::with_builtins(),
            exit_requested: false,
            pending_gate: Arc::new(Mutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            pending_gate: self.pending_gate.clone(),
            cancel_notify: self.cancel_notify.clone(),
            cancelled: self.cancelled.clone(),
            stopped: self.stopped.clone(),
        }
    }

    /// spec.md §4.6 `sendMessage`: extract and execute any leading slash
    /// commands, then (if residual text remains) append the user turn and
    /// drive the run loop until it finishes the turn or suspends at a gate.
    /// A no-op once `stop()` has latched.
    pub async fn send_message(&mut self, text: impl Into<String>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.session.has_pending_gate() {
            anyhow::bail!("cannot send a message while a review gate is pending");
        }
        self.cancelled.store(false, Ordering::SeqCst);
        self.session.cancelled = false;

        let (commands, residual) = extract_leading_commands(&text.into());
        for (name, args) in commands {
            self.run_command(&name, args).await?;
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        if residual.is_empty() {
            return Ok(());
        }

        self.session.push(Entry::new_user(residual));
        self.session.is_processing = true;
        self.run_loop().await
    }

    /// Dispatch one parsed slash-command invocation through the Command
    /// Registry, appending a `command_executed` entry with its result
    /// (spec.md §4.6 step 2, §4.10).
    async fn run_command(&mut self, name: &str, args: Vec<String>) -> Result<()> {
        let output = match self.command_registry.get(name) {
            Some(cmd) => {
                let mut ctx = CommandContext {
                    session: &mut self.session,
                    provider: self.provider.clone(),
                    pending_gate: self.pending_gate.clone(),
                    cancel_notify: self.cancel_notify.clone(),
                    exit_requested: &mut self.exit_requested,
                };
                cmd.execute(args.clone(), &mut ctx).await?
            }
            None => format!("unknown command: /{name}"),
        };
        if self.exit_requested {
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.session.push(Entry::new_command_executed(name.to_string(), args, output));
        Ok(())
    }

    /// Resume the run loop after a suspended gate has been resolved and the
    /// corresponding entry's status updated by [`Self::apply_write_decision`]
    /// / [`Self::apply_shell_decision`].
    async fn run_loop(&mut self) -> Result<()> {
        let mut rounds: u32 = 0;
        loop {
            if self.cancelled.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
                self.session.is_processing = false;
                self.session.cancelled = true;
                return Ok(());
            }
            if rounds >= self.config.max_tool_rounds {
                warn!(rounds, "max_tool_rounds reached, stopping turn");
                self.session.is_processing = false;
                return Ok(());
            }
            rounds += 1;

            if self.maybe_compact().await? {
                self.session.is_processing = false;
                self.session.cancelled = true;
                return Ok(());
            }

            let system = self.system_prompt();
            let wire = self.build_wire();
            let tools: Vec<north_model::ToolSchema> = self
                .registry
                .schemas_for_mode(self.mode)
                .into_iter()
                .map(|s| north_model::ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
                .collect();
            let model = self.session.current_model.clone();

            // spec.md §4.6 step 2: allocate the assistant entry before the
            // round's outcome is known so a streaming View has somewhere to
            // attach partial text; finalized in place below.
            let entry_id = self.session.push(Entry::new_assistant_streaming());

            let outcome = self
                .run_round_with_retry(move || CompletionRequest {
                    messages: {
                        let mut m = vec![Message::system(system.clone())];
                        m.extend(wire.clone());
                        m
                    },
                    tools: tools.clone(),
                    stream: true,
                    system_dynamic_suffix: None,
                    model_override: Some(model.clone()),
                })
                .await?;

            match outcome {
                RoundOutcome::Final(text) => {
                    self.session.finish_assistant(&entry_id, text, vec![]);
                    self.session.is_processing = false;
                    return Ok(());
                }
                RoundOutcome::ToolCalls(text, calls) => {
                    self.session.finish_assistant(&entry_id, text, calls.clone());
                    for tc in calls {
                        match self.dispatch(&tc).await? {
                            DispatchOutcome::Suspended => {
                                self.session.is_processing = false;
                                return Ok(());
                            }
                            DispatchOutcome::Completed => {}
                        }
                    }
                    // loop continues to the next round with tool results folded in
                }
                RoundOutcome::Cancelled(text) => {
                    self.session.finish_assistant(&entry_id, format!("{text}[Cancelled]"), vec![]);
                    self.session.is_processing = false;
                    self.session.cancelled = true;
                    return Ok(());
                }
                RoundOutcome::Errored(message) => {
                    self.session.finish_assistant(&entry_id, format!("[Error: {message}]"), vec![]);
                    self.session.is_processing = false;
                    return Ok(());
                }
            }
        }
    }

    fn system_prompt(&self) -> String {
        system_prompt(self.mode, self.config.system_prompt.as_deref(), PromptContext::default())
    }

    fn build_wire(&self) -> Vec<Message> {
        build_wire_messages(&self.session.transcript, self.session.rolling_summary.as_ref(), &[], |results: &[ToolResultInput]| {
            self.provider.build_tool_result_message(results)
        })
    }

    /// spec.md §4.5: compact when projected usage crosses the configured
    /// threshold, minus the reserved schema/measurement-error margin.
    ///
    /// Returns `Ok(true)` if a cancel fired during the compaction request
    /// itself (spec.md line 287: cancel during compaction terminates within
    /// one scheduling quantum) — the caller treats this the same as any
    /// other mid-turn cancellation.
    async fn maybe_compact(&mut self) -> Result<bool> {
        let system = self.system_prompt();
        let wire = self.build_wire();
        let estimated = estimate_prompt_tokens(&system, &wire);
        self.session.context_used_tokens = estimated;

        let effective_threshold = (self.config.compaction_threshold - self.config.compaction_overhead_reserve).max(0.0);
        if self.session.context_usage() < effective_threshold {
            return Ok(false);
        }

        let history_text = serialize_history(&wire);
        let outcome = run_compaction(
            &mut self.session,
            self.provider.as_ref(),
            &history_text,
            self.config.compaction_keep_recent,
            &self.cancel_notify,
        )
        .await?;
        match outcome {
            CompactionOutcome::Cancelled => return Ok(true),
            CompactionOutcome::Compacted => {
                let wire_after = self.build_wire();
                self.session.context_used_tokens = estimate_prompt_tokens(&system, &wire_after);
            }
            CompactionOutcome::Skipped => {}
        }
        Ok(false)
    }

    /// One streamed Provider round: accumulates text and per-index tool
    /// calls, racing every event against the cancellation signal so an
    /// abandoned stream never blocks `cancel()`.
    async fn stream_round(&mut self, req: CompletionRequest) -> Result<RoundOutcome> {
        let mut stream = self.provider.complete(req).await.context("provider request failed")?;
        let mut text = String::new();
        let mut by_index: std::collections::BTreeMap<u32, (String, String, String)> = std::collections::BTreeMap::new();

        loop {
            tokio::select! {
                _ = self.cancel_notify.notified() => {
                    return Ok(RoundOutcome::Cancelled(text));
                }
                next = stream.next() => {
                    match next {
                        None => break,
                        Some(Err(e)) => return Err(e),
                        Some(Ok(ResponseEvent::TextDelta(d))) => text.push_str(&d),
                        Some(Ok(ResponseEvent::ThinkingDelta(_))) => {}
                        Some(Ok(ResponseEvent::ToolCall { id, name, arguments, index })) => {
                            let slot = by_index.entry(index).or_insert_with(|| (String::new(), String::new(), String::new()));
                            if !id.is_empty() {
                                slot.0 = id;
                            }
                            if !name.is_empty() {
                                slot.1 = name;
                            }
                            slot.2.push_str(&arguments);
                        }
                        Some(Ok(ResponseEvent::Usage { input_tokens, output_tokens, .. })) => {
                            debug!(input_tokens, output_tokens, "round usage");
                        }
                        Some(Ok(ResponseEvent::Done)) => break,
                        Some(Ok(ResponseEvent::Error(e))) => anyhow::bail!("provider error: {e}"),
                    }
                }
            }
        }

        let calls: Vec<ToolCallRecord> = by_index
            .into_values()
            .filter_map(|(id, name, args)| {
                if name.is_empty() {
                    return None;
                }
                let id = if id.is_empty() { format!("call_{}", uuid::Uuid::new_v4()) } else { id };
                let input = serde_json::from_str(&args).unwrap_or_else(|_| serde_json::json!({}));
                Some(ToolCallRecord { id, name, input })
            })
            .collect();

        if calls.is_empty() {
            Ok(RoundOutcome::Final(text))
        } else {
            Ok(RoundOutcome::ToolCalls(text, calls))
        }
    }

    /// spec.md §4.6 step 6: retry transient provider errors with exponential
    /// backoff, and recover from an orphaned `tool_use` stream error by
    /// synthesizing results for tool calls that never got one.
    async fn run_round_with_retry(&mut self, build_req: impl Fn() -> CompletionRequest) -> Result<RoundOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.stream_round(build_req()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if is_orphan_tool_use_error(&e) => {
                    warn!(error = %e, "recovering orphaned tool_use ids before retrying");
                    self.recover_orphan_tool_calls();
                    if attempt >= MAX_RETRIES {
                        return Ok(RoundOutcome::Errored(e.to_string()));
                    }
                }
                Err(e) if attempt <= MAX_RETRIES && is_retryable(&e) => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient provider error");
                    let mut cancelled_during_backoff = false;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel_notify.notified() => { cancelled_during_backoff = true; }
                    }
                    if cancelled_during_backoff {
                        return Ok(RoundOutcome::Cancelled(String::new()));
                    }
                }
                Err(e) => return Ok(RoundOutcome::Errored(e.to_string())),
            }
        }
    }

    /// Walk back from the last assistant turn and synthesize an error Tool
    /// entry for every requested tool call that has no matching result yet,
    /// so the next `build_wire_messages` call produces a balanced transcript.
    fn recover_orphan_tool_calls(&mut self) {
        let last_assistant_calls: Vec<ToolCallRecord> = self
            .session
            .transcript
            .iter()
            .rev()
            .find_map(|e| match e {
                Entry::Assistant { tool_calls, .. } if !tool_calls.is_empty() => Some(tool_calls.clone()),
                _ => None,
            })
            .unwrap_or_default();

        for tc in last_assistant_calls {
            let has_result = self.session.transcript.iter().any(|e| match e {
                Entry::Tool { tool_call_id, .. } => tool_call_id == &tc.id,
                Entry::DiffReview { tool_call_id, .. } => tool_call_id == &tc.id,
                Entry::ShellReview { tool_call_id, .. } => tool_call_id == &tc.id,
                _ => false,
            });
            if !has_result {
                self.session.push(Entry::new_tool(
                    &tc.id,
                    &tc.name,
                    "interrupted before a result was recorded",
                    true,
                ));
            }
        }
    }

    /// Sequential, single-tool-at-a-time dispatch by category (spec.md §4.6
    /// step 8, §5's no-parallel-tool-calls scheduling model).
    async fn dispatch(&mut self, tc: &ToolCallRecord) -> Result<DispatchOutcome> {
        match classify(&tc.name) {
            ToolCategory::Write => self.dispatch_write(tc).await,
            ToolCategory::Shell => self.dispatch_shell(tc).await,
            ToolCategory::Other => self.dispatch_other(tc).await,
        }
    }

    async fn dispatch_other(&mut self, tc: &ToolCallRecord) -> Result<DispatchOutcome> {
        let call = ToolCall { id: tc.id.clone(), name: tc.name.clone(), args: tc.input.clone() };
        let out = self.registry.execute(&call).await;
        self.session.push(Entry::new_tool(&tc.id, &tc.name, out.content, out.is_error));
        Ok(DispatchOutcome::Completed)
    }

    /// Tools in this category only *prepare* a diff (spec.md §4.2/§4.8); the
    /// filesystem is touched only once a `diff_review` resolves to
    /// accept/always, via [`crate::apply::apply`].
    async fn dispatch_write(&mut self, tc: &ToolCallRecord) -> Result<DispatchOutcome> {
        let call = ToolCall { id: tc.id.clone(), name: tc.name.clone(), args: tc.input.clone() };
        let out = self.registry.execute(&call).await;
        if out.is_error {
            self.session.push(Entry::new_tool(&tc.id, &tc.name, out.content, true));
            return Ok(DispatchOutcome::Completed);
        }

        let parsed: serde_json::Value = match serde_json::from_str(&out.content) {
            Ok(v) => v,
            Err(e) => {
                self.session.push(Entry::new_tool(&tc.id, &tc.name, format!("malformed prepared edit: {e}"), true));
                return Ok(DispatchOutcome::Completed);
            }
        };
        let diffs_by_file: Vec<FileDiff> = serde_json::from_value(parsed["diffs_by_file"].clone()).unwrap_or_default();
        let apply_payload = parsed["apply_payload"].clone();
        let stats: EditStats = serde_json::from_value(parsed["stats"].clone()).unwrap_or_default();

        let entry_id = self.session.push(Entry::new_diff_review(&tc.id, diffs_by_file, apply_payload, stats));

        if self.storage.is_edits_auto_accept_enabled() {
            self.apply_write_decision(&entry_id, WriteDecision::Always).await?;
            return Ok(DispatchOutcome::Completed);
        }

        let GateHandle { gate, receiver } = open_write_gate(entry_id.clone());
        self.session.pending_review_id = Some(entry_id.clone());
        *self.pending_gate.lock().await = Some(gate);

        let decision = tokio::select! {
            d = receiver => d.unwrap_or(WriteDecision::Reject),
            _ = self.cancel_notify.notified() => WriteDecision::Reject,
        };
        self.apply_write_decision(&entry_id, decision).await?;
        Ok(DispatchOutcome::Completed)
    }

    async fn apply_write_decision(&mut self, entry_id: &str, decision: WriteDecision) -> Result<()> {
        self.session.pending_review_id = None;
        if decision == WriteDecision::Always {
            self.storage.enable_edits_auto_accept();
        }

        let apply_payload = match self.session.find(entry_id) {
            Some(Entry::DiffReview { apply_payload, .. }) => apply_payload.clone(),
            _ => anyhow::bail!("diff_review entry '{entry_id}' vanished before it could be resolved"),
        };

        let (status, applied, reason) = match decision {
            WriteDecision::Reject => (WriteReviewStatus::Rejected, None, None),
            WriteDecision::Accept | WriteDecision::Always => {
                let status = if decision == WriteDecision::Always { WriteReviewStatus::Always } else { WriteReviewStatus::Accepted };
                match crate::apply::apply(&self.repo_root, &apply_payload).await {
                    Ok(()) => (status, Some(true), None),
                    Err(e) => (status, Some(false), Some(e.to_string())),
                }
            }
        };

        if let Some(Entry::DiffReview { status: s, applied: a, reason: r, .. }) = self.session.find_mut(entry_id) {
            *s = status;
            *a = applied;
            *r = reason;
        }
        Ok(())
    }

    /// Shell commands never run ahead of approval: either storage/policy
    /// grants it automatically, or the call suspends on a `shell_review`
    /// gate (spec.md §4.3/§4.4).
    async fn dispatch_shell(&mut self, tc: &ToolCallRecord) -> Result<DispatchOutcome> {
        let command = tc.input.get("command").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if command.is_empty() {
            self.session.push(Entry::new_tool(&tc.id, &tc.name, "missing 'command' argument", true));
            return Ok(DispatchOutcome::Completed);
        }

        let entry_id = self.session.push(Entry::new_shell_review(&tc.id, command.clone()));

        if self.storage.is_command_allowed(&command) || self.storage.is_shell_auto_approve_enabled() {
            self.run_shell(&entry_id, &tc.id, &command, ShellReviewStatus::Auto).await?;
            return Ok(DispatchOutcome::Completed);
        }

        match self.tool_policy.decide(&command) {
            ApprovalPolicy::Deny => {
                self.deny_shell(&entry_id, &tc.id);
                Ok(DispatchOutcome::Completed)
            }
            ApprovalPolicy::Auto => {
                self.run_shell(&entry_id, &tc.id, &command, ShellReviewStatus::Auto).await?;
                Ok(DispatchOutcome::Completed)
            }
            ApprovalPolicy::Ask => {
                let GateHandle { gate, receiver } = open_shell_gate(entry_id.clone());
                self.session.pending_review_id = Some(entry_id.clone());
                *self.pending_gate.lock().await = Some(gate);

                let decision = tokio::select! {
                    d = receiver => d.unwrap_or(ShellDecision::Deny),
                    _ = self.cancel_notify.notified() => ShellDecision::Deny,
                };
                self.apply_shell_decision(&entry_id, &tc.id, &command, decision).await?;
                Ok(DispatchOutcome::Completed)
            }
        }
    }

    async fn apply_shell_decision(&mut self, entry_id: &str, tool_call_id: &str, command: &str, decision: ShellDecision) -> Result<()> {
        self.session.pending_review_id = None;
        match decision {
            ShellDecision::Deny => {
                self.deny_shell(entry_id, tool_call_id);
                Ok(())
            }
            ShellDecision::Accept => self.run_shell(entry_id, tool_call_id, command, ShellReviewStatus::Ran).await,
            ShellDecision::Always => {
                self.storage.allow_command(command);
                self.run_shell(entry_id, tool_call_id, command, ShellReviewStatus::Always).await
            }
        }
    }

    fn deny_shell(&mut self, entry_id: &str, _tool_call_id: &str) {
        if let Some(Entry::ShellReview { status, result, .. }) = self.session.find_mut(entry_id) {
            *status = ShellReviewStatus::Denied;
            *result = Some(ShellResult { output: String::new(), exit_code: -1, denied: true });
        }
    }

    async fn run_shell(&mut self, entry_id: &str, _tool_call_id: &str, command: &str, status: ShellReviewStatus) -> Result<()> {
        let timeout = 60;
        let result = self.shell.run(&self.repo_root.to_string_lossy(), command, timeout).await;
        let shell_result = match result {
            Ok(r) => ShellResult { output: r.output, exit_code: if r.timed_out { -1 } else { r.exit_code }, denied: false },
            Err(e) => ShellResult { output: format!("shell service error: {e}"), exit_code: -1, denied: false },
        };
        if let Some(Entry::ShellReview { status: s, result: r, .. }) = self.session.find_mut(entry_id) {
            *s = status;
            *r = Some(shell_result);
        }
        Ok(())
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = (std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.subsec_millis() as u64).unwrap_or(0))
        % JITTER_MS_RANGE;
    Duration::from_millis(base + jitter)
}

fn is_retryable(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    ["rate limit", "overloaded", "timed out", "timeout", "503", "529", "connection reset", "temporarily unavailable"]
        .iter()
        .any(|needle| msg.contains(needle))
}

fn is_orphan_tool_use_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("tool_use") && msg.contains("tool_result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use north_model::ScriptedMockProvider;
    use north_tools::{DeleteFileTool, EditFileTool, ReadFileTool, RunTerminalCommandTool, ShellCommandResult, ShellDispatcher, WriteTool};
    use tempfile::tempdir;

    struct FakeShell {
        result: ShellCommandResult,
    }

    #[async_trait::async_trait]
    impl ShellDispatcher for FakeShell {
        async fn run(&self, _repo_root: &str, _command: &str, _timeout_secs: u64) -> anyhow::Result<ShellCommandResult> {
            Ok(self.result.clone())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(WriteTool);
        reg.register(EditFileTool);
        reg.register(DeleteFileTool);
        let fake_shell: Arc<dyn ShellDispatcher> = Arc::new(FakeShell {
            result: ShellCommandResult { output: "ok".into(), exit_code: 0, timed_out: false },
        });
        reg.register(RunTerminalCommandTool::new(fake_shell, "/tmp"));
        Arc::new(reg)
    }

    fn orchestrator_with(provider: ScriptedMockProvider, repo_root: &std::path::Path) -> Orchestrator {
        let session = Session::new("scripted-mock-model", 1_000_000);
        let shell: Arc<dyn ShellDispatcher> =
            Arc::new(FakeShell { result: ShellCommandResult { output: "ok".into(), exit_code: 0, timed_out: false } });
        Orchestrator::new(
            session,
            registry(),
            Arc::new(provider),
            shell,
            &ToolsConfig::default(),
            AgentConfig::default(),
            repo_root,
            AgentMode::Agent,
        )
    }

    #[tokio::test]
    async fn plain_text_reply_finishes_without_pending_gate() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator_with(ScriptedMockProvider::always_text("hello there"), dir.path());
        orch.send_message("hi").await.unwrap();
        assert!(!orch.session.is_processing);
        assert!(!orch.session.has_pending_gate());
        assert!(orch.session.transcript.iter().any(|e| matches!(e, Entry::Assistant { text, .. } if text == "hello there")));
    }

    /// `dispatch_write`/`dispatch_shell` park the run loop on the gate's
    /// receiver, so the task driving `send_message` only resumes once a
    /// second, concurrently-scheduled task resolves it through the
    /// `OrchestratorHandle` — exactly how a real View (e.g. a WebSocket
    /// connection handler) must drive it. Tests exercising a gate therefore
    /// spawn `send_message` and poll `OrchestratorHandle::pending_review_id`
    /// rather than calling everything inline on one task.
    async fn wait_for_gate(handle: &OrchestratorHandle) -> String {
        loop {
            if let Some(id) = handle.pending_review_id().await {
                return id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn write_tool_call_suspends_at_diff_review_gate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let args = serde_json::json!({"path": "a.txt", "content": "hi"}).to_string();
        let provider = ScriptedMockProvider::tool_then_text("call-1", "write_file", args, "done");
        let mut orch = orchestrator_with(provider, dir.path());
        let handle = orch.handle();

        let task = tokio::spawn(async move {
            orch.send_message("write a file").await.unwrap();
            orch
        });

        let gate_id = wait_for_gate(&handle).await;
        assert!(!path.exists(), "write must not apply before the gate resolves");

        handle.resolve_write(&gate_id, WriteDecision::Accept).await.unwrap();
        let orch = task.await.unwrap();

        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
        assert!(!orch.session.has_pending_gate());
        assert!(!orch.session.is_processing);
    }

    #[tokio::test]
    async fn rejecting_a_write_leaves_disk_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let args = serde_json::json!({"path": "a.txt", "content": "hi"}).to_string();
        let provider = ScriptedMockProvider::tool_then_text("call-1", "write_file", args, "done");
        let mut orch = orchestrator_with(provider, dir.path());
        let handle = orch.handle();

        let task = tokio::spawn(async move {
            orch.send_message("write a file").await.unwrap();
        });

        let gate_id = wait_for_gate(&handle).await;
        handle.resolve_write(&gate_id, WriteDecision::Reject).await.unwrap();
        task.await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn shell_command_runs_after_accept_decision() {
        let dir = tempdir().unwrap();
        let args = serde_json::json!({"command": "echo hi"}).to_string();
        let provider = ScriptedMockProvider::tool_then_text("call-1", "run_terminal_command", args, "done");
        let mut orch = orchestrator_with(provider, dir.path());
        let handle = orch.handle();

        let task = tokio::spawn(async move {
            orch.send_message("run something").await.unwrap();
            orch
        });

        let gate_id = wait_for_gate(&handle).await;
        handle.resolve_shell(&gate_id, ShellDecision::Accept).await.unwrap();
        let orch = task.await.unwrap();

        assert!(orch.session.transcript.iter().any(|e| matches!(
            e,
            Entry::ShellReview { status: ShellReviewStatus::Ran, .. }
        )));
    }

    #[tokio::test]
    async fn sendmessage_after_stop_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator_with(ScriptedMockProvider::always_text("x"), dir.path());
        orch.handle().stop().await;
        orch.send_message("anything").await.unwrap();
        assert!(orch.session.transcript.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_dispatch_rejects_pending_write_gate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let args = serde_json::json!({"path": "a.txt", "content": "hi"}).to_string();
        let provider = ScriptedMockProvider::tool_then_text("call-1", "write_file", args, "done");
        let mut orch = orchestrator_with(provider, dir.path());
        let handle = orch.handle();

        let task = tokio::spawn(async move {
            orch.send_message("write a file").await.unwrap();
        });

        wait_for_gate(&handle).await;
        handle.cancel().await;

        // cancel() resolves the pending gate to its terminal-reject decision
        // directly; the in-flight dispatch_write call observes this via its
        // select! arm and never applies the write.
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancel_mid_stream_annotates_assistant_entry_and_returns_ok() {
        let dir = tempdir().unwrap();
        let session = Session::new("hanging-mock-model", 1_000_000);
        let shell: Arc<dyn ShellDispatcher> =
            Arc::new(FakeShell { result: ShellCommandResult { output: "ok".into(), exit_code: 0, timed_out: false } });
        let mut orch = Orchestrator::new(
            session,
            registry(),
            Arc::new(north_model::HangingMockProvider::new("partial reply")),
            shell,
            &ToolsConfig::default(),
            AgentConfig::default(),
            dir.path(),
            AgentMode::Agent,
        );
        let handle = orch.handle();

        let task = tokio::spawn(async move {
            let result = orch.send_message("hi").await;
            (orch, result)
        });

        // Give stream_round a chance to observe the first TextDelta before
        // cancelling, so the entry's accumulated text is non-empty.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.cancel().await;

        let (orch, result) = task.await.unwrap();
        assert!(result.is_ok(), "send_message must swallow a mid-stream cancel, not return Err");
        assert!(!orch.session.is_processing);

        let assistant_entries: Vec<&Entry> =
            orch.session.transcript.iter().filter(|e| matches!(e, Entry::Assistant { .. })).collect();
        assert_eq!(assistant_entries.len(), 1);
        match assistant_entries[0] {
            Entry::Assistant { text, is_streaming, .. } => {
                assert!(text.contains("partial reply"));
                assert!(text.ends_with("[Cancelled]"));
                assert!(!is_streaming);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn retryable_error_detects_rate_limit_and_5xx() {
        assert!(is_retryable(&anyhow::anyhow!("rate limit exceeded, try again")));
        assert!(is_retryable(&anyhow::anyhow!("upstream returned 503")));
        assert!(!is_retryable(&anyhow::anyhow!("invalid api key")));
    }

    #[test]
    fn orphan_tool_use_error_is_detected() {
        let e = anyhow::anyhow!("messages.3: `tool_use` ids were found without `tool_result` blocks immediately after them");
        assert!(is_orphan_tool_use_error(&e));
        assert!(!is_orphan_tool_use_error(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn backoff_grows_exponentially_with_attempt() {
        let d1 = backoff_delay(1).as_millis();
        let d2 = backoff_delay(2).as_millis();
        assert!(d2 >= d1 + RETRY_BASE_MS as u128, "attempt 2 delay should be roughly double attempt 1");
    }

    #[tokio::test]
    async fn leading_command_is_consumed_and_does_not_reach_the_provider() {
        let dir = tempdir().unwrap();
        let provider = ScriptedMockProvider::always_text("should not be called");
        let mut orch = orchestrator_with(provider, dir.path());

        orch.send_message("/model claude-opus").await.unwrap();

        assert_eq!(orch.session.current_model, "claude-opus");
        assert!(!orch.session.is_processing);
        assert!(orch
            .session
            .transcript
            .iter()
            .any(|e| matches!(e, Entry::CommandExecuted { name, .. } if name == "model")));
        assert!(orch.session.transcript.iter().all(|e| !matches!(e, Entry::Assistant { .. })));
    }

    #[tokio::test]
    async fn residual_text_after_a_command_still_reaches_the_provider() {
        let dir = tempdir().unwrap();
        let provider = ScriptedMockProvider::always_text("on it");
        let mut orch = orchestrator_with(provider, dir.path());

        orch.send_message("/trim 5\nplease fix the bug").await.unwrap();

        assert!(orch.session.transcript.iter().any(|e| matches!(e, Entry::User { text, .. } if text == "please fix the bug")));
        assert!(orch.session.transcript.iter().any(|e| matches!(e, Entry::Assistant { text, .. } if text == "on it")));
    }

    #[tokio::test]
    async fn exit_command_stops_the_session() {
        let dir = tempdir().unwrap();
        let provider = ScriptedMockProvider::always_text("unused");
        let mut orch = orchestrator_with(provider, dir.path());

        orch.send_message("/exit").await.unwrap();
        assert!(orch.session.stopped);

        orch.send_message("hello again").await.unwrap();
        assert!(orch.session.transcript.iter().all(|e| !matches!(e, Entry::User { text, .. } if text == "hello again")));
    }
}
