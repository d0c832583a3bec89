// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Materialises provider wire messages from the transcript.
//!
//! The transcript is the sole source of truth (spec.md §4.7): this module
//! rebuilds the full message list from scratch every round rather than
//! incrementally maintaining one, so it is a pure function of its inputs and
//! trivially idempotent.

use north_model::{Message, ToolResultInput};

use crate::session::{CommandReviewStatus, Entry, RollingSummary, ShellReviewStatus, WriteReviewStatus};

/// Build the wire-message list for one provider round.
///
/// `external_context_blocks` are prepended as a synthetic user/assistant
/// acknowledgment pair (e.g. a git/CI status block); `rolling_summary`, if
/// present, is prepended the same way after them.
pub fn build_wire_messages(
    transcript: &[Entry],
    rolling_summary: Option<&RollingSummary>,
    external_context_blocks: &[String],
    build_tool_result_message: impl Fn(&[ToolResultInput]) -> Vec<Message>,
) -> Vec<Message> {
    let mut out = Vec::new();

    for block in external_context_blocks {
        out.push(Message::user(block.clone()));
        out.push(Message::assistant("Understood."));
    }

    if let Some(summary) = rolling_summary {
        out.push(Message::user(format!(
            "Here is a summary of the conversation so far:\n{}",
            render_summary(summary)
        )));
        out.push(Message::assistant("Understood, I will continue from this summary."));
    }

    let mut pending_results: Vec<ToolResultInput> = Vec::new();

    let flush = |out: &mut Vec<Message>, pending: &mut Vec<ToolResultInput>| {
        if !pending.is_empty() {
            out.extend(build_tool_result_message(pending));
            pending.clear();
        }
    };

    for entry in transcript {
        match entry {
            Entry::User { text, .. } => {
                flush(&mut out, &mut pending_results);
                out.push(Message::user(text.clone()));
            }
            Entry::Assistant { text, tool_calls, .. } => {
                flush(&mut out, &mut pending_results);
                if !text.is_empty() {
                    out.push(Message::assistant(text.clone()));
                }
                for tc in tool_calls {
                    out.push(Message::assistant_tool_call(
                        tc.id.clone(),
                        tc.name.clone(),
                        serde_json::to_string(&tc.input).unwrap_or_else(|_| "{}".to_string()),
                    ));
                }
            }
            Entry::Tool { tool_call_id, output, is_error, .. } => {
                pending_results.push(ToolResultInput {
                    tool_call_id: tool_call_id.clone(),
                    result: output.clone(),
                    is_error: *is_error,
                });
            }
            Entry::DiffReview { tool_call_id, status, applied, stats, reason, .. } => {
                if *status == WriteReviewStatus::Pending {
                    continue;
                }
                let result = match status {
                    WriteReviewStatus::Accepted | WriteReviewStatus::Always => {
                        if applied.unwrap_or(false) {
                            serde_json::json!({"ok": true, "applied": true, "stats": stats})
                        } else {
                            serde_json::json!({
                                "ok": true,
                                "applied": false,
                                "reason": reason.clone().unwrap_or_else(|| "apply failed".into()),
                            })
                        }
                    }
                    WriteReviewStatus::Rejected => {
                        serde_json::json!({"ok": true, "applied": false, "reason": "rejected by user"})
                    }
                    WriteReviewStatus::Pending => unreachable!(),
                };
                pending_results.push(ToolResultInput {
                    tool_call_id: tool_call_id.clone(),
                    result: result.to_string(),
                    is_error: false,
                });
            }
            Entry::ShellReview { tool_call_id, status, result, .. } => {
                if *status == ShellReviewStatus::Pending {
                    continue;
                }
                let (text, is_error) = match result {
                    Some(r) if r.denied => ("[exit -1]\ndenied by user".to_string(), true),
                    Some(r) if r.exit_code == 0 => (r.output.clone(), false),
                    Some(r) => (format!("[exit {}]\n{}", r.exit_code, r.output), true),
                    None => ("[no result recorded]".to_string(), true),
                };
                pending_results.push(ToolResultInput { tool_call_id: tool_call_id.clone(), result: text, is_error });
            }
            Entry::CommandReview { .. } | Entry::CommandExecuted { .. } => {
                // Slash-command bookkeeping never reaches the model.
            }
        }
    }

    flush(&mut out, &mut pending_results);
    out
}

fn render_summary(s: &RollingSummary) -> String {
    let mut out = format!("Goal: {}\n", s.goal);
    if !s.decisions.is_empty() {
        out.push_str(&format!("Decisions:\n{}\n", bullet(&s.decisions)));
    }
    if !s.constraints.is_empty() {
        out.push_str(&format!("Constraints:\n{}\n", bullet(&s.constraints)));
    }
    if !s.open_tasks.is_empty() {
        out.push_str(&format!("Open tasks:\n{}\n", bullet(&s.open_tasks)));
    }
    if !s.important_files.is_empty() {
        out.push_str(&format!("Important files:\n{}\n", bullet(&s.important_files)));
    }
    out
}

fn bullet(items: &[String]) -> String {
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

// Also also used by command_review: never sent; selected/cancelled are
// purely internal state for the run loop, not visible to the model.
#[allow(dead_code)]
fn _unused_command_review_status(_: CommandReviewStatus) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EditStats, Entry, ShellResult};

    fn default_builder(results: &[ToolResultInput]) -> Vec<Message> {
        results
            .iter()
            .map(|r| {
                let text = if r.is_error { format!("Error: {}", r.result) } else { r.result.clone() };
                Message::tool_result(r.tool_call_id.clone(), text)
            })
            .collect()
    }

    #[test]
    fn simple_user_assistant_round_trips() {
        let transcript = vec![Entry::new_user("hi"), Entry::new_assistant("hello", vec![])];
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].as_text(), Some("hi"));
        assert_eq!(msgs[1].as_text(), Some("hello"));
    }

    #[test]
    fn pending_review_entries_are_not_sent() {
        let transcript = vec![Entry::new_user("do it"), Entry::new_shell_review("tc1", "ls")];
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        // Only the user message — the pending shell review contributes nothing.
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn resolved_shell_review_becomes_tool_result() {
        let mut transcript = vec![Entry::new_shell_review("tc1", "ls")];
        if let Entry::ShellReview { status, result, .. } = &mut transcript[0] {
            *status = ShellReviewStatus::Ran;
            *result = Some(ShellResult { output: "a.txt".into(), exit_code: 0, denied: false });
        }
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn denied_shell_review_is_error_result() {
        let mut transcript = vec![Entry::new_shell_review("tc1", "rm -rf /")];
        if let Entry::ShellReview { status, result, .. } = &mut transcript[0] {
            *status = ShellReviewStatus::Denied;
            *result = Some(ShellResult { output: String::new(), exit_code: -1, denied: true });
        }
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn accepted_write_with_apply_failure_reports_reason() {
        let mut transcript =
            vec![Entry::new_diff_review("tc1", vec![], serde_json::json!({}), EditStats::default())];
        if let Entry::DiffReview { status, applied, reason, .. } = &mut transcript[0] {
            *status = WriteReviewStatus::Accepted;
            *applied = Some(false);
            *reason = Some("disk full".into());
        }
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn command_review_and_command_executed_are_never_sent() {
        let transcript = vec![
            Entry::new_command_review("model", "pick", vec!["a".into()]),
            Entry::new_command_executed("reset", vec![], "ok"),
        ];
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        assert!(msgs.is_empty());
    }

    #[test]
    fn rolling_summary_prepends_synthetic_pair() {
        let summary = RollingSummary { goal: "ship feature".into(), ..Default::default() };
        let transcript = vec![Entry::new_user("continue")];
        let msgs = build_wire_messages(&transcript, Some(&summary), &[], default_builder);
        assert_eq!(msgs.len(), 3);
        assert!(msgs[0].as_text().unwrap().contains("ship feature"));
    }

    #[test]
    fn building_twice_with_no_mutation_is_idempotent() {
        let transcript = vec![Entry::new_user("hi"), Entry::new_assistant("hello", vec![])];
        let a = build_wire_messages(&transcript, None, &[], default_builder);
        let b = build_wire_messages(&transcript, None, &[], default_builder);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.as_text(), y.as_text());
        }
    }

    #[test]
    fn tool_results_flush_before_next_user_turn() {
        let transcript = vec![
            Entry::new_user("read the file"),
            Entry::new_assistant("", vec![crate::session::ToolCallRecord {
                id: "tc1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "a.rs"}),
            }]),
            Entry::new_tool("tc1", "read_file", "contents", false),
            Entry::new_user("thanks"),
        ];
        let msgs = build_wire_messages(&transcript, None, &[], default_builder);
        // user, assistant-tool-call, tool-result, user
        assert_eq!(msgs.len(), 4);
    }
}
