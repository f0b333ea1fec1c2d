//! System prompt assembly.
//!
//! Rebuilt on every run from the workspace's instruction files, the channel
//! user table, a bounded tree listing, and the discovered skills.

use crate::store::LogEntry;
use crate::workspace::{Skill, discover_skills, read_capped, tree_listing};
use std::collections::BTreeMap;
use std::path::Path;

/// Character caps for included instruction files.
const MOTHER_CAP: usize = 3000;
const GLOBAL_MEMORY_CAP: usize = 1500;
const CHANNEL_MEMORY_CAP: usize = 1000;

const IDENTITY: &str = "\
You are Mother, an autonomous agent attached to this chat channel. You have \
a persistent workspace on disk and a set of tools (read, write, edit, bash, \
attach, delegate) that operate inside it. Work step by step, use tools when \
they help, and answer in plain chat prose. Keep durable notes in MEMORY.md \
files. If the conversation needs no visible reply, respond with exactly \
[SILENT].";

/// Everything the prompt renderer needs, pre-gathered.
pub struct PromptInputs<'a> {
    pub channel_id: &'a str,
    /// Workspace path as the tools see it.
    pub workspace: &'a Path,
    pub mother: Option<String>,
    pub global_memory: Option<String>,
    pub channel_memory: Option<String>,
    pub entries: &'a [LogEntry],
    pub tree: String,
    pub skills: Vec<Skill>,
}

/// Gather the inputs from disk, then render.
pub async fn build_system_prompt(
    host_workspace: &Path,
    sandbox_workspace: &Path,
    channel_id: &str,
    entries: &[LogEntry],
) -> String {
    let inputs = PromptInputs {
        channel_id,
        workspace: sandbox_workspace,
        mother: read_capped(&host_workspace.join("MOTHER.md"), MOTHER_CAP).await,
        global_memory: read_capped(&host_workspace.join("MEMORY.md"), GLOBAL_MEMORY_CAP).await,
        channel_memory: read_capped(
            &host_workspace.join(channel_id).join("MEMORY.md"),
            CHANNEL_MEMORY_CAP,
        )
        .await,
        entries,
        tree: tree_listing(host_workspace),
        skills: discover_skills(&host_workspace.join("skills")).await,
    };
    render(&inputs)
}

/// Render the prompt from gathered inputs. Pure, for tests.
pub fn render(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(IDENTITY);
    prompt.push_str("\n\n## Where you are\n");
    prompt.push_str(&format!(
        "Channel id: {}\nWorkspace: {}\nChannel directory: {}\n",
        inputs.channel_id,
        inputs.workspace.display(),
        inputs.workspace.join(inputs.channel_id).display(),
    ));

    if let Some(mother) = &inputs.mother {
        prompt.push_str("\n## MOTHER.md\n");
        prompt.push_str(mother);
        prompt.push('\n');
    }
    if let Some(memory) = &inputs.global_memory {
        prompt.push_str("\n## Global memory\n");
        prompt.push_str(memory);
        prompt.push('\n');
    }
    if let Some(memory) = &inputs.channel_memory {
        prompt.push_str("\n## Channel memory\n");
        prompt.push_str(memory);
        prompt.push('\n');
    }

    let users = user_table(inputs.entries);
    if !users.is_empty() {
        prompt.push_str("\n## Known users\n");
        prompt.push_str("id | handle | display name\n");
        for (id, (handle, display)) in &users {
            prompt.push_str(&format!(
                "{id} | {} | {}\n",
                handle.as_deref().unwrap_or("-"),
                display.as_deref().unwrap_or("-"),
            ));
        }
    }

    if !inputs.tree.is_empty() {
        prompt.push_str("\n## Workspace files\n");
        prompt.push_str(&inputs.tree);
        prompt.push('\n');
    }

    if !inputs.skills.is_empty() {
        prompt.push_str("\n## Skills\n");
        prompt.push_str(
            "Read the named SKILL.md under skills/ before using one of these:\n",
        );
        for skill in &inputs.skills {
            prompt.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
    }

    prompt
}

/// id → (handle, display name) for every non-bot author seen in the log.
fn user_table(
    entries: &[LogEntry],
) -> BTreeMap<String, (Option<String>, Option<String>)> {
    let mut users = BTreeMap::new();
    for entry in entries {
        if entry.is_bot {
            continue;
        }
        users.insert(
            entry.user.clone(),
            (entry.user_name.clone(), entry.display_name.clone()),
        );
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(user: &str, user_name: Option<&str>) -> LogEntry {
        LogEntry {
            date: Utc::now(),
            ts: "1".into(),
            user: user.into(),
            user_name: user_name.map(Into::into),
            display_name: None,
            text: "hi".into(),
            attachments: Vec::new(),
            is_bot: false,
        }
    }

    #[test]
    fn test_render_includes_sections() {
        let entries = vec![entry("42", Some("alice"))];
        let inputs = PromptInputs {
            channel_id: "c1",
            workspace: Path::new("/workspace"),
            mother: Some("Always be concise.".into()),
            global_memory: None,
            channel_memory: Some("Likes Rust.".into()),
            entries: &entries,
            tree: "MOTHER.md (10B)".into(),
            skills: vec![Skill {
                name: "summarize".into(),
                description: "Summarize documents".into(),
            }],
        };
        let prompt = render(&inputs);
        assert!(prompt.contains("Channel id: c1"));
        assert!(prompt.contains("## MOTHER.md"));
        assert!(prompt.contains("Always be concise."));
        assert!(!prompt.contains("## Global memory"));
        assert!(prompt.contains("Likes Rust."));
        assert!(prompt.contains("42 | alice | -"));
        assert!(prompt.contains("summarize: Summarize documents"));
        assert!(prompt.contains("[SILENT]"));
    }

    #[test]
    fn test_user_table_dedups_and_skips_bot() {
        let mut bot = entry("99", None);
        bot.is_bot = true;
        let entries = vec![entry("42", Some("alice")), entry("42", Some("alice")), bot];
        let users = user_table(&entries);
        assert_eq!(users.len(), 1);
        assert!(users.contains_key("42"));
    }
}
