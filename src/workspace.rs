//! Workspace bootstrap, tree listing, and skill discovery.

use crate::error::Result;
use anyhow::Context as _;
use std::path::Path;

/// Directory names and files excluded from the tree listing.
const TREE_EXCLUDES: &[&str] = &[
    "node_modules",
    "attachments",
    "log.jsonl",
    "context.jsonl",
    "last_prompt.jsonl",
];

/// Tree listing limits.
const TREE_MAX_DEPTH: usize = 4;
const TREE_MAX_ENTRIES: usize = 150;

/// Seed the workspace skeleton and template files on startup.
pub async fn bootstrap(workspace: &Path) -> Result<()> {
    for dir in ["events", "skills"] {
        tokio::fs::create_dir_all(workspace.join(dir))
            .await
            .with_context(|| format!("failed to create {dir}/"))?;
    }

    let templates: &[(&str, &str)] = &[
        (
            "MOTHER.md",
            "# MOTHER\n\nStanding instructions for the agent. Edit freely; the agent\nre-reads this file on every run.\n",
        ),
        ("MEMORY.md", "# Memory\n\nDurable notes the agent keeps across conversations.\n"),
        ("SYSTEM.md", "# System\n\nOperator notes about this deployment.\n"),
        ("REFERENCE.md", "# Reference\n\nLinks and material the agent may consult.\n"),
    ];
    for (name, contents) in templates {
        let path = workspace.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("failed to seed {name}"))?;
            tracing::info!(file = name, "seeded workspace template");
        }
    }
    Ok(())
}

/// Read a file capped at `max_chars`, tagging truncation.
pub async fn read_capped(path: &Path, max_chars: usize) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= max_chars {
        return Some(trimmed.to_string());
    }
    let capped: String = trimmed.chars().take(max_chars).collect();
    Some(format!("{capped}\n[truncated]"))
}

/// Human size: `B`, `K`, `M`.
fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / (1024 * 1024))
    }
}

/// Depth-4, 150-entry workspace tree with human sizes. Skips excluded
/// names and all dot-files.
pub fn tree_listing(root: &Path) -> String {
    let mut lines = Vec::new();
    let mut budget = TREE_MAX_ENTRIES;
    walk(root, 0, &mut lines, &mut budget);
    if budget == 0 {
        lines.push("... (listing capped)".to_string());
    }
    lines.join("\n")
}

fn walk(dir: &Path, depth: usize, lines: &mut Vec<String>, budget: &mut usize) {
    if depth >= TREE_MAX_DEPTH || *budget == 0 {
        return;
    }
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = read.flatten().collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if *budget == 0 {
            return;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || TREE_EXCLUDES.contains(&name.as_str()) {
            continue;
        }
        let indent = "  ".repeat(depth);
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            lines.push(format!("{indent}{name}/"));
            *budget -= 1;
            walk(&entry.path(), depth + 1, lines, budget);
        } else {
            lines.push(format!("{indent}{name} ({})", format_size(meta.len())));
            *budget -= 1;
        }
    }
}

/// A discovered skill, advertised in the system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
}

/// Discover `skills/<name>/SKILL.md` files and parse their YAML frontmatter
/// (`name`, `description`).
pub async fn discover_skills(skills_dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    let Ok(mut read) = tokio::fs::read_dir(skills_dir).await else {
        return skills;
    };
    while let Ok(Some(entry)) = read.next_entry().await {
        let path = entry.path().join("SKILL.md");
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let fallback = entry.file_name().to_string_lossy().into_owned();
        match parse_frontmatter(&text, &fallback) {
            Some(skill) => skills.push(skill),
            None => {
                tracing::warn!(path = %path.display(), "skill has no usable frontmatter, skipping");
            }
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Minimal frontmatter parse: a `---` fence with `name:` / `description:`.
fn parse_frontmatter(text: &str, fallback_name: &str) -> Option<Skill> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let mut name = None;
    let mut description = None;
    for line in rest[..end].lines() {
        if let Some(value) = line.strip_prefix("name:") {
            name = Some(value.trim().trim_matches('"').to_string());
        } else if let Some(value) = line.strip_prefix("description:") {
            description = Some(value.trim().trim_matches('"').to_string());
        }
    }
    let description = description?;
    Some(Skill {
        name: name.unwrap_or_else(|| fallback_name.to_string()),
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(12), "12B");
        assert_eq!(format_size(2048), "2K");
        assert_eq!(format_size(3 * 1024 * 1024), "3M");
    }

    #[test]
    fn test_tree_listing_skips_excluded_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("chan/attachments")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("chan/log.jsonl"), "x").unwrap();
        std::fs::write(dir.path().join("chan/notes.md"), "hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::write(dir.path().join("MOTHER.md"), "m").unwrap();

        let tree = tree_listing(dir.path());
        assert!(tree.contains("notes.md (5B)"));
        assert!(tree.contains("MOTHER.md"));
        assert!(!tree.contains("attachments"));
        assert!(!tree.contains("node_modules"));
        assert!(!tree.contains("log.jsonl"));
        assert!(!tree.contains(".hidden"));
    }

    #[test]
    fn test_tree_listing_respects_depth_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c/d/e")).unwrap();
        std::fs::write(dir.path().join("a/b/c/d/deep.txt"), "x").unwrap();
        let tree = tree_listing(dir.path());
        // depth 4 shows d/ but not its contents
        assert!(tree.contains("d/"));
        assert!(!tree.contains("deep.txt"));

        for i in 0..200 {
            std::fs::write(dir.path().join(format!("file{i:03}.txt")), "x").unwrap();
        }
        let tree = tree_listing(dir.path());
        assert!(tree.contains("listing capped"));
        assert!(tree.lines().count() <= TREE_MAX_ENTRIES + 1);
    }

    #[tokio::test]
    async fn test_discover_skills() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills/summarize");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            indoc! {r#"
                ---
                name: summarize
                description: Summarize long documents
                ---
                Body text.
            "#},
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("skills/broken")).unwrap();
        std::fs::write(dir.path().join("skills/broken/SKILL.md"), "no frontmatter").unwrap();

        let skills = discover_skills(&dir.path().join("skills")).await;
        assert_eq!(
            skills,
            vec![Skill {
                name: "summarize".to_string(),
                description: "Summarize long documents".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_once() {
        let dir = tempfile::tempdir().unwrap();
        bootstrap(dir.path()).await.unwrap();
        assert!(dir.path().join("events").is_dir());
        assert!(dir.path().join("MOTHER.md").is_file());

        std::fs::write(dir.path().join("MOTHER.md"), "customized").unwrap();
        bootstrap(dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("MOTHER.md")).unwrap(),
            "customized"
        );
    }

    #[tokio::test]
    async fn test_read_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.md");
        std::fs::write(&path, "abcdef").unwrap();
        assert_eq!(read_capped(&path, 10).await.unwrap(), "abcdef");
        let capped = read_capped(&path, 3).await.unwrap();
        assert!(capped.starts_with("abc"));
        assert!(capped.ends_with("[truncated]"));
        assert!(read_capped(&dir.path().join("missing"), 10).await.is_none());
    }
}
