//! Edit tool: exact find/replace with a diff-style change summary.

use crate::guard::PathGuard;
use crate::llm::ToolResult;
use crate::sandbox::Executor;
use crate::tools::Tool;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cap on emitted diff lines per side.
const MAX_DIFF_LINES: usize = 20;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditArgs {
    /// Path to edit (absolute, or relative to the workspace).
    pub path: String,
    /// Exact text to find.
    pub find: String,
    /// Replacement text.
    pub replace: String,
    /// Replace every occurrence instead of requiring exactly one.
    #[serde(default)]
    pub replace_all: bool,
    /// Short human caption shown in the chat UI.
    #[serde(default)]
    pub label: Option<String>,
}

pub struct EditTool {
    guard: Arc<PathGuard>,
    executor: Arc<Executor>,
}

impl EditTool {
    pub fn new(guard: Arc<PathGuard>, executor: Arc<Executor>) -> Self {
        Self { guard, executor }
    }
}

/// Unified-diff-style summary of the changed region: shared prefix/suffix
/// lines are elided, changed lines appear as `-`/`+`.
fn diff_summary(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut start = 0;
    while start < old_lines.len()
        && start < new_lines.len()
        && old_lines[start] == new_lines[start]
    {
        start += 1;
    }
    let mut old_end = old_lines.len();
    let mut new_end = new_lines.len();
    while old_end > start && new_end > start && old_lines[old_end - 1] == new_lines[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let mut summary = format!(
        "@@ -{},{} +{},{} @@\n",
        start + 1,
        old_end - start,
        start + 1,
        new_end - start
    );
    for line in old_lines[start..old_end].iter().take(MAX_DIFF_LINES) {
        summary.push_str(&format!("-{line}\n"));
    }
    if old_end - start > MAX_DIFF_LINES {
        summary.push_str("-...\n");
    }
    for line in new_lines[start..new_end].iter().take(MAX_DIFF_LINES) {
        summary.push_str(&format!("+{line}\n"));
    }
    if new_end - start > MAX_DIFF_LINES {
        summary.push_str("+...\n");
    }
    summary
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &'static str {
        "edit"
    }

    fn description(&self) -> &'static str {
        "Replace exact text in a file. Fails when the text is missing, or \
         ambiguous without replace_all."
    }

    fn parameters(&self) -> serde_json::Value {
        crate::tools::schema_of::<EditArgs>()
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> ToolResult {
        let args: EditArgs = match crate::tools::parse_args(args) {
            Ok(args) => args,
            Err(error) => return error,
        };
        if args.find.is_empty() {
            return ToolResult::error("find must not be empty");
        }

        let resolved = match self.guard.resolve(&args.path, self.executor.workspace_path()) {
            Ok(path) => path,
            Err(reason) => return ToolResult::error(reason),
        };

        let bytes = match self.executor.read_file(&resolved).await {
            Ok(bytes) => bytes,
            Err(error) => return ToolResult::error(error.to_string()),
        };
        let old = String::from_utf8_lossy(&bytes).into_owned();

        let occurrences = old.matches(&args.find).count();
        if occurrences == 0 {
            return ToolResult::error(format!(
                "'{}' not found in {}",
                preview(&args.find),
                resolved.display()
            ));
        }
        if occurrences > 1 && !args.replace_all {
            return ToolResult::error(format!(
                "'{}' occurs {occurrences} times in {}; pass replace_all to replace every occurrence",
                preview(&args.find),
                resolved.display()
            ));
        }

        let new = if args.replace_all {
            old.replace(&args.find, &args.replace)
        } else {
            old.replacen(&args.find, &args.replace, 1)
        };

        if let Err(error) = self.executor.write_file(&resolved, new.as_bytes()).await {
            return ToolResult::error(error.to_string());
        }

        ToolResult::text(format!(
            "Edited {} ({occurrences} replacement{}):\n{}",
            resolved.display(),
            if occurrences == 1 { "" } else { "s" },
            diff_summary(&old, &new)
        ))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 60;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn fixtures() -> (tempfile::TempDir, EditTool) {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(PathGuard::new(dir.path(), &[]));
        let executor = Arc::new(Executor::host(dir.path().to_path_buf()));
        (dir, EditTool::new(guard, executor))
    }

    #[tokio::test]
    async fn test_edit_single_occurrence() {
        let (dir, tool) = fixtures();
        let path = dir.path().join("MEMORY.md");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();

        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": path, "find": "beta", "replace": "delta"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.error, "{}", result.as_text());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "alpha\ndelta\ngamma\n");
        let summary = result.as_text();
        assert!(summary.contains("-beta"));
        assert!(summary.contains("+delta"));
    }

    #[tokio::test]
    async fn test_edit_missing_text_fails() {
        let (dir, tool) = fixtures();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "content").unwrap();

        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": path, "find": "absent", "replace": "x"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("not found"));
    }

    #[tokio::test]
    async fn test_edit_ambiguous_without_replace_all() {
        let (dir, tool) = fixtures();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "x y x").unwrap();

        let result = tool
            .execute(
                "t1",
                serde_json::json!({"path": path, "find": "x", "replace": "z"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.error);
        assert!(result.as_text().contains("2 times"));

        let result = tool
            .execute(
                "t2",
                serde_json::json!({"path": path, "find": "x", "replace": "z", "replace_all": true}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "z y z");
    }

    #[test]
    fn test_diff_summary_shape() {
        let old = indoc! {"
            one
            two
            three
        "};
        let new = indoc! {"
            one
            2
            three
        "};
        let summary = diff_summary(old, new);
        assert!(summary.starts_with("@@ -2,1 +2,1 @@"));
        assert!(summary.contains("-two\n"));
        assert!(summary.contains("+2\n"));
        assert!(!summary.contains("one"));
    }
}
