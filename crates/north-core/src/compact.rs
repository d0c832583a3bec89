// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token estimation and context compaction (spec.md §4.5).
//!
//! The estimator and the structured-summary compaction prompt are new —
//! the teacher's calibration-factor-adjusted heuristic and markdown-sectioned
//! compaction prompt don't match the spec's exact formula and five-field JSON
//! schema. [`smart_truncate`] and its line-budget helpers are kept verbatim:
//! per-tool-result truncation is a separate concern from prompt-token
//! estimation and compaction-triggering.
use anyhow::{Context, Result};
use futures::StreamExt;
use north_model::{
    CompletionRequest, ContentPart, Message, MessageContent, ModelProvider, ResponseEvent, Role,
    ToolResultContent,
};
use north_tools::OutputCategory;
use tokio::sync::Notify;
use tracing::warn;

use crate::session::{RollingSummary, Session};

/// Characters-per-token divisor used by `estimatePromptTokens` (spec.md §4.5).
pub const CHARS_PER_TOKEN: f32 = 3.5;
/// Fixed per-request overhead, in characters, added before dividing.
pub const OVERHEAD_CHARS: usize = 100;
/// Safety margin multiplier applied after the character/token division.
pub const SAFETY_MARGIN: f32 = 1.1;

/// `ceil((chars_of_system + chars_of_all_message_content + overhead_100) / 3.5 * 1.1)`.
///
/// Only embedded text fields are summed for structured content (images,
/// schemas, and other non-text fields are not counted).
pub fn estimate_prompt_tokens(system: &str, messages: &[Message]) -> usize {
    let mut chars = system.len();
    for m in messages {
        chars += embedded_text_chars(m);
    }
    let raw = (chars + OVERHEAD_CHARS) as f32 / CHARS_PER_TOKEN * SAFETY_MARGIN;
    raw.ceil() as usize
}

fn embedded_text_chars(m: &Message) -> usize {
    match &m.content {
        MessageContent::Text(t) => t.len(),
        MessageContent::ContentParts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                ContentPart::Image { .. } => 0,
            })
            .sum(),
        MessageContent::ToolCall { function, .. } => function.name.len() + function.arguments.len(),
        MessageContent::ToolResult { content, .. } => match content {
            ToolResultContent::Text(t) => t.len(),
            ToolResultContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    north_model::ToolContentPart::Text { text } => text.len(),
                    north_model::ToolContentPart::Image { .. } => 0,
                })
                .sum(),
        },
    }
}

const SUMMARY_SYSTEM_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Read the conversation below and respond with ONLY a single JSON object, no \
prose, no markdown fences, with exactly these fields:\n\
{\n  \"goal\": string,\n  \"decisions\": [string],\n  \"constraints\": [string],\n  \"openTasks\": [string],\n  \"importantFiles\": [string]\n}\n\
Be information-dense: preserve file paths, function names, and technical \
decisions. Every array may be empty but must be present.";

/// Outcome of one [`run_compaction`] attempt.
pub enum CompactionOutcome {
    /// The rolling summary was produced and the transcript trimmed.
    Compacted,
    /// The response didn't parse as a rolling summary; transcript untouched.
    Skipped,
    /// Cancelled mid-request; transcript untouched.
    Cancelled,
}

/// Run one compaction attempt (spec.md §4.5 steps 1-4).
///
/// Asks `provider` (no tools, summarizer system prompt, current model) for
/// the five-field rolling summary, parses it defensively, and on success
/// sets `session.rolling_summary` and trims the transcript to
/// `keep_recent` turns. On parse failure, the transcript is left intact and
/// this returns `Ok(Skipped)` — the caller proceeds with the un-compacted
/// transcript rather than failing the turn. `cancel_notify` races the
/// request the same way a regular model round does (spec.md line 287).
pub async fn run_compaction(
    session: &mut Session,
    provider: &dyn ModelProvider,
    history_text: &str,
    keep_recent: usize,
    cancel_notify: &Notify,
) -> Result<CompactionOutcome> {
    match request_rolling_summary_attempt(provider, &session.current_model, history_text, Some(cancel_notify)).await? {
        SummaryAttempt::Parsed(summary) => {
            session.rolling_summary = Some(summary);
            session.trim_to_last(keep_recent);
            Ok(CompactionOutcome::Compacted)
        }
        SummaryAttempt::Unparsed => Ok(CompactionOutcome::Skipped),
        SummaryAttempt::Cancelled => Ok(CompactionOutcome::Cancelled),
    }
}

/// Ask `provider` for a five-field rolling summary of `history_text` without
/// touching a [`Session`]. Used by the `/summarize` command (spec.md §4.10),
/// which sets the result separately from generating it; not cancellable,
/// since that command runs outside a turn's cooperative-cancellation scope.
pub async fn request_rolling_summary(
    provider: &dyn ModelProvider,
    model: &str,
    history_text: &str,
) -> Result<Option<RollingSummary>> {
    match request_rolling_summary_attempt(provider, model, history_text, None).await? {
        SummaryAttempt::Parsed(summary) => Ok(Some(summary)),
        SummaryAttempt::Unparsed | SummaryAttempt::Cancelled => Ok(None),
    }
}

enum SummaryAttempt {
    Parsed(RollingSummary),
    Unparsed,
    Cancelled,
}

async fn request_rolling_summary_attempt(
    provider: &dyn ModelProvider,
    model: &str,
    history_text: &str,
    cancel_notify: Option<&Notify>,
) -> Result<SummaryAttempt> {
    let req = CompletionRequest {
        messages: vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(history_text.to_string())],
        tools: vec![],
        stream: true,
        system_dynamic_suffix: None,
        model_override: Some(model.to_string()),
    };

    let mut stream = provider.complete(req).await.context("compaction request failed")?;
    let mut text = String::new();
    loop {
        let next = match cancel_notify {
            Some(notify) => {
                tokio::select! {
                    _ = notify.notified() => {
                        warn!("compaction cancelled mid-request; transcript left un-compacted");
                        return Ok(SummaryAttempt::Cancelled);
                    }
                    next = stream.next() => next,
                }
            }
            None => stream.next().await,
        };
        match next {
            None => break,
            Some(event) => match event.context("compaction stream error")? {
                ResponseEvent::TextDelta(d) => text.push_str(&d),
                ResponseEvent::Done | ResponseEvent::Usage { .. } => {}
                ResponseEvent::Error(e) => return Err(anyhow::anyhow!("compaction provider error: {e}")),
                ResponseEvent::ToolCall { .. } | ResponseEvent::ThinkingDelta(_) => {}
            },
        }
    }

    match parse_rolling_summary(&text) {
        Some(summary) => Ok(SummaryAttempt::Parsed(summary)),
        None => {
            warn!(response = %text, "compaction response did not parse as a rolling summary; skipping compaction");
            Ok(SummaryAttempt::Unparsed)
        }
    }
}

/// Defensive JSON parse of the compaction model's response. Tolerates a
/// response wrapped in a markdown code fence (models do this reliably even
/// when told not to).
fn parse_rolling_summary(text: &str) -> Option<RollingSummary> {
    let candidate = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(&candidate).ok()?;
    let goal = value.get("goal")?.as_str()?.to_string();
    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    };
    Some(RollingSummary {
        goal,
        decisions: strings("decisions"),
        constraints: strings("constraints"),
        open_tasks: strings("openTasks"),
        important_files: strings("importantFiles"),
    })
}

fn extract_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(trimmed)
        .trim();
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end < start {
        return None;
    }
    Some(stripped[start..=end].to_string())
}

/// Render a transcript-derived wire message list as plain text for inclusion
/// in the compaction prompt.
pub fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::ContentParts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => text.clone(),
                        ContentPart::Image { .. } => "[image]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => format!("[tool_result: {content}]"),
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output.  Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest relevance
///   first); the tail is not preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator,
///   preserving both the imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(content: &str, cap_chars: usize, max_head: usize, max_tail: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use north_model::ScriptedMockProvider;

    #[test]
    fn estimate_matches_spec_formula_on_plain_text() {
        let system = "abc"; // 3 chars
        let messages = vec![Message::user("defgh")]; // 5 chars
        let expected = ((3 + 5 + OVERHEAD_CHARS) as f32 / CHARS_PER_TOKEN * SAFETY_MARGIN).ceil() as usize;
        assert_eq!(estimate_prompt_tokens(system, &messages), expected);
    }

    #[test]
    fn estimate_ignores_image_bytes() {
        let with_image = vec![Message::user_with_parts(vec![
            ContentPart::text("hi"),
            ContentPart::image("data:image/png;base64,AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
        ])];
        let text_only = vec![Message::user("hi")];
        assert_eq!(estimate_prompt_tokens("", &with_image), estimate_prompt_tokens("", &text_only));
    }

    #[test]
    fn parse_rolling_summary_handles_bare_json() {
        let text = r#"{"goal":"ship x","decisions":["use y"],"constraints":[],"openTasks":["z"],"importantFiles":["a.rs"]}"#;
        let summary = parse_rolling_summary(text).unwrap();
        assert_eq!(summary.goal, "ship x");
        assert_eq!(summary.decisions, vec!["use y"]);
        assert_eq!(summary.open_tasks, vec!["z"]);
    }

    #[test]
    fn parse_rolling_summary_strips_markdown_fence() {
        let text = "```json\n{\"goal\":\"g\",\"decisions\":[],\"constraints\":[],\"openTasks\":[],\"importantFiles\":[]}\n```";
        assert!(parse_rolling_summary(text).is_some());
    }

    #[test]
    fn parse_rolling_summary_none_on_garbage() {
        assert!(parse_rolling_summary("not json at all").is_none());
    }

    #[test]
    fn parse_rolling_summary_none_on_missing_goal() {
        assert!(parse_rolling_summary(r#"{"decisions":[]}"#).is_none());
    }

    #[tokio::test]
    async fn run_compaction_sets_summary_and_trims_on_success() {
        let json = r#"{"goal":"test goal","decisions":[],"constraints":[],"openTasks":[],"importantFiles":[]}"#;
        let provider = ScriptedMockProvider::always_text(json);
        let mut session = Session::new("mock-model", 100_000);
        for i in 0..15 {
            session.push(crate::session::Entry::new_user(format!("u{i}")));
            session.push(crate::session::Entry::new_assistant(format!("a{i}"), vec![]));
        }
        let cancel_notify = Notify::new();
        let outcome = run_compaction(&mut session, &provider, "history", 2, &cancel_notify).await.unwrap();
        assert!(matches!(outcome, CompactionOutcome::Compacted));
        assert_eq!(session.rolling_summary.as_ref().unwrap().goal, "test goal");
    }

    #[tokio::test]
    async fn run_compaction_leaves_transcript_intact_on_parse_failure() {
        let provider = ScriptedMockProvider::always_text("not valid json");
        let mut session = Session::new("mock-model", 100_000);
        session.push(crate::session::Entry::new_user("hello"));
        let before = session.transcript.len();
        let cancel_notify = Notify::new();
        let outcome = run_compaction(&mut session, &provider, "history", 2, &cancel_notify).await.unwrap();
        assert!(matches!(outcome, CompactionOutcome::Skipped));
        assert!(session.rolling_summary.is_none());
        assert_eq!(session.transcript.len(), before);
    }
}
