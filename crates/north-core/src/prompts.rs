// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

use north_config::AgentMode;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content is placed in a *separate, uncached* system block so that
    /// the stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of the project context file (AGENTS.md / .north/context.md).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between CI runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the default Guidelines section. Sourced
    /// from `AgentConfig::system_prompt` when the user has not overridden the
    /// whole prompt.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    ///
    /// Used to build the *stable* (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines ──────────────────────────────────────────────────────────────

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - State what you changed and why; don't narrate every intermediate step."
    }

    pub fn tool_usage() -> &'static str {
        "- NEVER use `run_terminal_command` for file I/O — use `read_file`/`write_file`/`edit_file`/`grep`/`glob_file_search`.\n\
         - Prefer `edit_file` over `write_file` for modifying existing files (preserves surrounding context).\n\
         - Discovery workflow: `glob_file_search` to find files → `grep` to narrow → `read_file` with specific ranges for context.\n\
         - Batch independent `read_file` calls in the same turn when they don't depend on each other."
    }

    pub fn code_quality() -> &'static str {
        "- Make sure all the code you generate follows good separation of concerns and the existing style.\n\
         - NEVER create new files proactively unless explicitly requested or required by the task.\n\
         - Write tests alongside new functionality where the project already has a test suite.\n\
         - Preserve existing code structure and coding style patterns."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Break multi-step tasks into a short plan before acting, and follow it.\n\
         - Batch independent tool calls in parallel to reduce round trips."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before giving up.\n\
         - Always pass an absolute path as `repo_root`/`workdir` where a tool accepts one.\n\
         - NEVER skip git hooks or force-push without explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Workflow Efficiency\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for the given agent mode.
///
/// `ctx` carries optional project / CI / git context injected when running
/// against a real repo checkout.
pub fn system_prompt(mode: AgentMode, custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        // Even with a custom prompt, honour append if set.
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are North, a coding agent built for professional software engineering.\n\n\
         Operating Mode: `{mode}`\n\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = std::env::current_dir().unwrap().display()
    );

    let mode_instructions = match mode {
        AgentMode::Ask => {
            "You are in ask mode. You may read files, search the codebase, and run read-only \
             shell commands. Any edit or destructive shell command you propose still goes \
             through the normal review gate, but default to explaining and asking before \
             taking actions with side effects. Favor gathering the information needed to \
             answer the user's question or produce a plan over making changes immediately."
        }
        AgentMode::Agent => {
            "You are in agent mode. You can read and write files, run shell commands, and \
             search the codebase to accomplish the user's request directly. Work \
             systematically, verify your changes, and report your progress clearly.\n\
             Keep in mind the following:\n\
             - Maximize parallel tool calls when steps don't depend on each other.\n\
             - Finish the task the user asked for before ending your turn."
        }
    };

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\
             Project root directory: `{}`\n\
             - Use this absolute path for all file read/write operations.\n\
             - Prefer absolute paths over relative paths in every tool call.",
            root.display()
        )
    } else {
        String::new()
    };

    let git_section = if let Some(git) = ctx.git_context { format!("\n\n{git}") } else { String::new() };

    // Project context file (AGENTS.md / .north/context.md) — injected as a
    // labelled section so the model treats it as authoritative instructions.
    let context_file_section = if let Some(content) = ctx.project_context_file {
        format!("\n\n## Project Instructions\n\n{content}")
    } else {
        String::new()
    };

    let ci_section = if let Some(ci) = ctx.ci_context { format!("\n\n{ci}") } else { String::new() };

    let guidelines_section = build_guidelines_section();

    let append_section = if let Some(extra) = ctx.append { format!("\n\n{extra}") } else { String::new() };

    format!(
        "{agent_identity}\n\n\
         {mode_instructions}{project_section}{git_section}\
         {context_file_section}{ci_section}\n\n\
         {guidelines_section}\
         {append_section}",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }
    fn empty() -> PromptContext<'static> {
        PromptContext::default()
    }

    #[test]
    fn custom_prompt_is_returned_verbatim() {
        let prompt = system_prompt(AgentMode::Agent, Some("Custom instructions here."), empty());
        assert_eq!(prompt, "Custom instructions here.");
    }

    #[test]
    fn custom_prompt_honours_append() {
        let ctx = PromptContext { append: Some("Extra rule."), ..empty() };
        let prompt = system_prompt(AgentMode::Agent, Some("Base."), ctx);
        assert_eq!(prompt, "Base.\n\nExtra rule.");
    }

    #[test]
    fn ask_mode_mentions_ask() {
        let pr = system_prompt(AgentMode::Ask, None, empty());
        assert!(pr.contains("ask mode"));
    }

    #[test]
    fn agent_mode_mentions_agent() {
        let pr = system_prompt(AgentMode::Agent, None, empty());
        assert!(pr.contains("agent mode"));
    }

    #[test]
    fn both_modes_render_operating_mode_header() {
        for mode in [AgentMode::Ask, AgentMode::Agent] {
            let pr = system_prompt(mode, None, empty());
            assert!(pr.contains(&format!("Operating Mode: `{mode}`")));
        }
    }

    #[test]
    fn project_root_renders_as_absolute_path() {
        let root = p("/repo");
        let ctx = PromptContext { project_root: Some(&root), ..empty() };
        let pr = system_prompt(AgentMode::Agent, None, ctx);
        assert!(pr.contains("/repo"));
    }

    #[test]
    fn no_project_root_omits_section() {
        let pr = system_prompt(AgentMode::Agent, None, empty());
        assert!(!pr.contains("## Project Context"));
    }

    #[test]
    fn git_context_is_injected() {
        let ctx = PromptContext { git_context: Some("branch: main, dirty: 2 files"), ..empty() };
        let pr = system_prompt(AgentMode::Agent, None, ctx);
        assert!(pr.contains("branch: main"));
    }

    #[test]
    fn ci_context_is_injected() {
        let ctx = PromptContext { ci_context: Some("CI=true, actor=bot"), ..empty() };
        let pr = system_prompt(AgentMode::Agent, None, ctx);
        assert!(pr.contains("CI=true"));
    }

    #[test]
    fn project_context_file_gets_labelled_section() {
        let ctx = PromptContext { project_context_file: Some("Use 4-space indents."), ..empty() };
        let pr = system_prompt(AgentMode::Agent, None, ctx);
        assert!(pr.contains("## Project Instructions"));
        assert!(pr.contains("Use 4-space indents."));
    }

    #[test]
    fn guidelines_section_always_present() {
        let pr = system_prompt(AgentMode::Agent, None, empty());
        assert!(pr.contains("## Guidelines"));
        assert!(pr.contains("### Tool Usage Patterns"));
    }

    #[test]
    fn append_is_appended_after_guidelines() {
        let ctx = PromptContext { append: Some("Always run tests before finishing."), ..empty() };
        let pr = system_prompt(AgentMode::Agent, None, ctx);
        let guidelines_idx = pr.find("## Guidelines").unwrap();
        let append_idx = pr.find("Always run tests before finishing.").unwrap();
        assert!(append_idx > guidelines_idx);
    }

    #[test]
    fn stable_only_clears_volatile_fields() {
        let ctx = PromptContext {
            git_context: Some("branch: main"),
            ci_context: Some("CI=true"),
            project_context_file: Some("notes"),
            ..empty()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert!(stable.project_context_file.is_some());
    }

    #[test]
    fn dynamic_block_combines_git_and_ci() {
        let ctx = PromptContext { git_context: Some("branch: main"), ci_context: Some("CI=true"), ..empty() };
        let block = ctx.dynamic_block().unwrap();
        assert!(block.contains("branch: main"));
        assert!(block.contains("CI=true"));
    }

    #[test]
    fn dynamic_block_none_when_both_absent() {
        assert!(empty().dynamic_block().is_none());
    }
}
