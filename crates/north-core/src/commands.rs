// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash commands and the Command Registry (spec.md §4.10).
//!
//! A leading `/name [args]` in a user message is parsed out of the text and
//! dispatched through [`CommandRegistry`] before anything reaches the
//! Provider; the command mutates session state directly via
//! [`CommandContext`] instead of producing a wire message. Consumed command
//! text never reaches the model — only the residual, non-command text (if
//! any) becomes the LLM-bound user message.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use north_model::ModelProvider;

use crate::compact::request_rolling_summary;
use crate::review::{open_command_gate, PendingGate};
use crate::session::{CommandReviewStatus, Entry, RollingSummary, Session};

/// Split leading `/name [args]` lines off the front of `input`.
///
/// Each leading line starting with `/` is one invocation; the first
/// non-command line (or end of input) ends the leading run. Everything from
/// that point on — trimmed — is the residual, LLM-bound text.
pub fn extract_leading_commands(input: &str) -> (Vec<(String, Vec<String>)>, String) {
    let lines: Vec<&str> = input.lines().collect();
    let mut commands = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx].trim();
        let Some(stripped) = line.strip_prefix('/') else { break };
        let mut parts = stripped.split_whitespace();
        let Some(name) = parts.next() else { break };
        commands.push((name.to_string(), parts.map(String::from).collect()));
        idx += 1;
    }
    let residual = lines[idx..].join("\n").trim().to_string();
    (commands, residual)
}

/// The surface a command implementation gets to mutate orchestrator state
/// and suspend for user input, exactly as named in spec.md §4.10.
pub struct CommandContext<'a> {
    pub session: &'a mut Session,
    pub provider: Arc<dyn ModelProvider>,
    pub pending_gate: Arc<Mutex<Option<PendingGate>>>,
    pub cancel_notify: Arc<Notify>,
    pub exit_requested: &'a mut bool,
}

impl<'a> CommandContext<'a> {
    pub fn set_model(&mut self, id: impl Into<String>) {
        self.session.current_model = id.into();
    }

    pub fn get_model(&self) -> &str {
        &self.session.current_model
    }

    /// Clears the transcript, rolling summary, and pending gate. Mirrors the
    /// fresh-`Session::new` state aside from model and context limit, which
    /// `/reset` leaves untouched.
    pub fn reset_chat(&mut self) {
        self.session.transcript.clear();
        self.session.rolling_summary = None;
        self.session.pending_review_id = None;
        self.session.context_used_tokens = 0;
    }

    pub fn set_rolling_summary(&mut self, summary: RollingSummary) {
        self.session.rolling_summary = Some(summary);
    }

    /// spec.md §4.5's summary request, run standalone: generates without
    /// assigning it to the session (the caller decides whether and when to
    /// call [`Self::set_rolling_summary`]).
    pub async fn generate_summary(&self) -> Result<Option<RollingSummary>> {
        let history_text = render_transcript(&self.session.transcript);
        request_rolling_summary(self.provider.as_ref(), &self.session.current_model, &history_text).await
    }

    pub fn trim_transcript(&mut self, keep_last: usize) {
        self.session.trim_to_last(keep_last);
    }

    /// Latches `stopped` so a subsequent `sendMessage` is a no-op (spec.md
    /// §4.9), matching a `/exit` command's intent without a distinct flag.
    pub fn request_exit(&mut self) {
        *self.exit_requested = true;
        self.session.stopped = true;
    }

    pub fn get_transcript(&self) -> &[Entry] {
        &self.session.transcript
    }

    /// Opens a `command_review` gate and suspends until the View resolves it
    /// (an option id) or cancellation/stop resolves it to `None`.
    pub async fn show_picker(&mut self, name: &str, prompt: &str, options: Vec<String>) -> Result<Option<String>> {
        let entry_id = self.session.push(Entry::new_command_review(name, prompt, options));
        self.session.pending_review_id = Some(entry_id.clone());
        let handle = open_command_gate(entry_id.clone());
        *self.pending_gate.lock().await = Some(handle.gate);

        let decision = tokio::select! {
            res = handle.receiver => res.unwrap_or(None),
            _ = self.cancel_notify.notified() => None,
        };

        self.session.pending_review_id = None;
        if let Some(Entry::CommandReview { status, selected, .. }) = self.session.find_mut(&entry_id) {
            *status = if decision.is_some() { CommandReviewStatus::Selected } else { CommandReviewStatus::Cancelled };
            *selected = decision.clone();
        }
        Ok(decision)
    }
}

fn render_transcript(transcript: &[Entry]) -> String {
    transcript
        .iter()
        .map(|e| match e {
            Entry::User { text, .. } => format!("User: {text}"),
            Entry::Assistant { text, .. } => format!("Assistant: {text}"),
            Entry::Tool { name, output, .. } => format!("Tool[{name}]: {output}"),
            Entry::DiffReview { tool_call_id, stats, .. } => {
                format!("Edit[{tool_call_id}]: {} files changed", stats.files_changed)
            }
            Entry::ShellReview { command, .. } => format!("Shell: {command}"),
            Entry::CommandReview { name, prompt, .. } => format!("Picker[{name}]: {prompt}"),
            Entry::CommandExecuted { name, args, output, .. } => {
                format!("Command /{name} {}: {output}", args.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One slash command.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String>;
}

/// `/model <id>` — set directly, or with no argument, present a picker over
/// the bundled model catalog (spec.md §4.10's `showPicker`).
pub struct ModelCommand;

#[async_trait]
impl Command for ModelCommand {
    fn name(&self) -> &str {
        "model"
    }

    async fn execute(&self, args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String> {
        if let Some(id) = args.into_iter().next() {
            ctx.set_model(id.clone());
            return Ok(format!("model set to {id}"));
        }
        let options: Vec<String> = north_model::catalog::static_catalog().into_iter().map(|m| m.id).collect();
        match ctx.show_picker("model", "Select a model", options).await? {
            Some(id) => {
                ctx.set_model(id.clone());
                Ok(format!("model set to {id}"))
            }
            None => Ok("model selection cancelled".to_string()),
        }
    }
}

/// `/reset` — clear the transcript, rolling summary, and gate bookkeeping.
pub struct ResetCommand;

#[async_trait]
impl Command for ResetCommand {
    fn name(&self) -> &str {
        "reset"
    }

    async fn execute(&self, _args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String> {
        ctx.reset_chat();
        Ok("chat reset".to_string())
    }
}

/// `/summarize` — generate a rolling summary and install it (spec.md §4.5).
pub struct SummarizeCommand;

#[async_trait]
impl Command for SummarizeCommand {
    fn name(&self) -> &str {
        "summarize"
    }

    async fn execute(&self, _args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String> {
        match ctx.generate_summary().await? {
            Some(summary) => {
                let goal = summary.goal.clone();
                ctx.set_rolling_summary(summary);
                Ok(format!("summary updated: {goal}"))
            }
            None => Ok("summary generation failed; transcript unchanged".to_string()),
        }
    }
}

/// `/trim <n>` — keep only the last `n` user/assistant turns.
pub struct TrimCommand;

#[async_trait]
impl Command for TrimCommand {
    fn name(&self) -> &str {
        "trim"
    }

    async fn execute(&self, args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String> {
        let keep_last: usize = args.first().and_then(|s| s.parse().ok()).unwrap_or(10);
        ctx.trim_transcript(keep_last);
        Ok(format!("trimmed to the last {keep_last} turns"))
    }
}

/// `/exit` — request session termination.
pub struct ExitCommand;

#[async_trait]
impl Command for ExitCommand {
    fn name(&self) -> &str {
        "exit"
    }

    async fn execute(&self, _args: Vec<String>, ctx: &mut CommandContext<'_>) -> Result<String> {
        ctx.request_exit();
        Ok("exit requested".to_string())
    }
}

/// Name-keyed lookup table of [`Command`] implementations.
pub struct CommandRegistry {
    commands: HashMap<String, Box<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self { commands: HashMap::new() }
    }

    pub fn register(&mut self, command: impl Command + 'static) {
        self.commands.insert(command.name().to_string(), Box::new(command));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands.get(name).map(|c| c.as_ref())
    }

    /// The registry with every concrete command this crate ships wired in.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(ModelCommand);
        reg.register(ResetCommand);
        reg.register(SummarizeCommand);
        reg.register(TrimCommand);
        reg.register(ExitCommand);
        reg
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_leading_commands_splits_command_and_residual() {
        let (cmds, residual) = extract_leading_commands("/model gpt-4o\n/trim 5\nplease fix the bug");
        assert_eq!(cmds, vec![("model".to_string(), vec!["gpt-4o".to_string()]), ("trim".to_string(), vec!["5".to_string()])]);
        assert_eq!(residual, "please fix the bug");
    }

    #[test]
    fn extract_leading_commands_handles_no_commands() {
        let (cmds, residual) = extract_leading_commands("just a plain message");
        assert!(cmds.is_empty());
        assert_eq!(residual, "just a plain message");
    }

    #[test]
    fn extract_leading_commands_handles_command_only() {
        let (cmds, residual) = extract_leading_commands("/reset");
        assert_eq!(cmds, vec![("reset".to_string(), vec![])]);
        assert_eq!(residual, "");
    }

    #[tokio::test]
    async fn reset_command_clears_transcript_and_summary() {
        let mut session = Session::new("m", 1000);
        session.push(Entry::new_user("hi"));
        session.rolling_summary = Some(RollingSummary::default());
        let mut exit_requested = false;
        let mut ctx = CommandContext {
            session: &mut session,
            provider: Arc::new(north_model::ScriptedMockProvider::always_text("unused")),
            pending_gate: Arc::new(Mutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
            exit_requested: &mut exit_requested,
        };
        let out = ResetCommand.execute(vec![], &mut ctx).await.unwrap();
        assert_eq!(out, "chat reset");
        assert!(session.transcript.is_empty());
        assert!(session.rolling_summary.is_none());
    }

    #[tokio::test]
    async fn exit_command_latches_stopped() {
        let mut session = Session::new("m", 1000);
        let mut exit_requested = false;
        let mut ctx = CommandContext {
            session: &mut session,
            provider: Arc::new(north_model::ScriptedMockProvider::always_text("unused")),
            pending_gate: Arc::new(Mutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
            exit_requested: &mut exit_requested,
        };
        ExitCommand.execute(vec![], &mut ctx).await.unwrap();
        assert!(exit_requested);
        assert!(session.stopped);
    }

    #[tokio::test]
    async fn model_command_with_arg_sets_model_directly() {
        let mut session = Session::new("m", 1000);
        let mut exit_requested = false;
        let mut ctx = CommandContext {
            session: &mut session,
            provider: Arc::new(north_model::ScriptedMockProvider::always_text("unused")),
            pending_gate: Arc::new(Mutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
            exit_requested: &mut exit_requested,
        };
        let out = ModelCommand.execute(vec!["claude-opus".to_string()], &mut ctx).await.unwrap();
        assert_eq!(out, "model set to claude-opus");
        assert_eq!(session.current_model, "claude-opus");
    }

    #[tokio::test]
    async fn trim_command_defaults_to_ten_when_no_arg_given() {
        let mut session = Session::new("m", 1000);
        for i in 0..20 {
            session.push(Entry::new_user(format!("u{i}")));
        }
        let mut exit_requested = false;
        let mut ctx = CommandContext {
            session: &mut session,
            provider: Arc::new(north_model::ScriptedMockProvider::always_text("unused")),
            pending_gate: Arc::new(Mutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
            exit_requested: &mut exit_requested,
        };
        let out = TrimCommand.execute(vec![], &mut ctx).await.unwrap();
        assert_eq!(out, "trimmed to the last 10 turns");
        assert_eq!(session.transcript.len(), 10);
    }

    #[tokio::test]
    async fn unknown_command_is_absent_from_registry() {
        let reg = CommandRegistry::with_builtins();
        assert!(reg.get("model").is_some());
        assert!(reg.get("not_a_real_command").is_none());
    }
}
