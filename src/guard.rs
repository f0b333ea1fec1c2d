//! Path-prefix and command-allow-list policy enforcement.
//!
//! Both guards sit in front of every tool that touches the filesystem or the
//! shell. Policy is initialized once at startup and read-only afterwards.
//! Denials are returned as values so callers can surface them to the model
//! as tool errors.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Lexically normalize a path: collapse `.` and `..` without touching the
/// filesystem, so the guard cannot be bypassed through unresolved symlinkish
/// spellings like `<ws>/../etc/passwd`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // `..` above the root stays at the root.
                    if out.as_os_str().is_empty() {
                        out.push(Component::RootDir.as_os_str());
                    }
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Allows file access only inside a fixed set of directory prefixes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    prefixes: Vec<PathBuf>,
}

impl PathGuard {
    /// Build a guard for a workspace. `/tmp` is always allowed; extra
    /// prefixes come from `ALLOWED_PATHS`.
    pub fn new(workspace_dir: &Path, extra_prefixes: &[PathBuf]) -> Self {
        let mut prefixes = vec![normalize_path(workspace_dir), PathBuf::from("/tmp")];
        for extra in extra_prefixes {
            prefixes.push(normalize_path(extra));
        }
        Self { prefixes }
    }

    /// Check a model-supplied path. Relative input resolves against `cwd`.
    /// Allowed iff the normalized resolution equals an allowed prefix or is
    /// a strict child of one (`<prefix>/...`); `/ws-evil` does not pass for
    /// prefix `/ws`.
    pub fn check(&self, input_path: &str, cwd: &Path) -> Verdict {
        match self.resolve(input_path, cwd) {
            Ok(_) => Verdict::allow(),
            Err(reason) => Verdict::deny(reason),
        }
    }

    /// Like [`check`](Self::check), but returns the normalized resolved path
    /// for the caller's I/O. Tools always operate on this resolution, never
    /// on the raw input.
    pub fn resolve(
        &self,
        input_path: &str,
        cwd: &Path,
    ) -> std::result::Result<PathBuf, String> {
        let raw = Path::new(input_path);
        let resolved = if raw.is_absolute() {
            normalize_path(raw)
        } else {
            normalize_path(&cwd.join(raw))
        };

        for prefix in &self.prefixes {
            if resolved == *prefix || resolved.starts_with(prefix) {
                // starts_with is component-wise, so /ws-evil never matches /ws
                return Ok(resolved);
            }
        }

        Err(format!(
            "Path denied: '{}' (resolves to '{}') is outside allowed directories",
            input_path,
            resolved.display()
        ))
    }

    /// The allowed prefixes, for the system prompt.
    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }
}

/// Programs allowed by default: file, text, dev, network, archive, package
/// and general utility commands. `sudo`, `dd`, service managers, and shell
/// re-invocations are deliberately absent.
const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // file
    "ls", "cat", "head", "tail", "stat", "file", "du", "df", "touch", "mkdir", "cp", "mv", "rm",
    "ln", "chmod", "basename", "dirname", "realpath", "readlink", "find", "tree",
    // text
    "grep", "egrep", "fgrep", "rg", "sed", "awk", "cut", "tr", "sort", "uniq", "wc", "diff",
    "patch", "jq", "xargs", "tee", "split", "paste", "comm", "column",
    // dev
    "git", "cargo", "rustc", "rustfmt", "python3", "python", "pip", "pip3", "node", "npm", "npx",
    "make", "gcc", "cc", "g++", "go", "gdb", "strings", "nm", "objdump",
    // network
    "curl", "wget", "ping", "host", "dig", "nslookup", "nc", "ssh", "scp", "rsync",
    // archive
    "tar", "gzip", "gunzip", "zip", "unzip", "xz", "unxz", "zstd", "bzip2", "bunzip2",
    // package
    "apt-get", "apt", "apt-cache", "dpkg", "pipx", "uv",
    // utility
    "env", "date", "sleep", "uname", "whoami", "id", "hostname", "which", "ps", "kill", "less",
    "more", "md5sum", "sha256sum", "base64", "seq", "yes", "true", "false", "printf", "echo",
];

/// Shell builtins, always implicitly allowed as segment heads. `exec`,
/// `eval`, `bash`, and `sh` are excluded on purpose.
const SHELL_BUILTINS: &[&str] = &[
    "cd", "echo", "printf", "export", "pwd", "set", "unset", "read", "test", "[", "true", "false",
    "exit", "return", "shift", "wait", "trap", "source", ".", "local", "declare", "typeset",
    "alias", "unalias", "hash", "command", "builtin", "let", "getopts", "pushd", "popd", "dirs",
    "umask", "ulimit", "times", "bg", "fg", "jobs", "disown", "enable", "help", "logout",
    "mapfile", "readarray", "compgen", "complete", "compopt", "coproc", "select", "shopt",
];

/// Additions and removals parsed from `ALLOWED_COMMANDS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOverrides {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Parse the `ALLOWED_COMMANDS` env string: comma-separated entries, `+cmd`
/// and bare `cmd` add, `-cmd` removes, whitespace trimmed.
pub fn parse_allowed_commands_env(value: &str) -> CommandOverrides {
    let mut overrides = CommandOverrides::default();
    for raw in value.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some(name) = entry.strip_prefix('-') {
            overrides.remove.push(name.trim().to_string());
        } else if let Some(name) = entry.strip_prefix('+') {
            overrides.add.push(name.trim().to_string());
        } else {
            overrides.add.push(entry.to_string());
        }
    }
    overrides
}

/// Allows shell commands whose every pipeline segment starts with an
/// allow-listed program or a shell builtin.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed: HashSet<String>,
    builtins: HashSet<String>,
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self::new(&CommandOverrides::default())
    }
}

impl CommandGuard {
    pub fn new(overrides: &CommandOverrides) -> Self {
        let mut allowed: HashSet<String> = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for name in &overrides.add {
            allowed.insert(name.clone());
        }
        for name in &overrides.remove {
            allowed.remove(name);
        }
        let builtins = SHELL_BUILTINS.iter().map(|s| s.to_string()).collect();
        Self { allowed, builtins }
    }

    /// Check a whole shell command string. Idempotent: re-checking an
    /// allowed string always allows it again.
    pub fn check(&self, command: &str) -> Verdict {
        if let Some(reason) = critical_pattern(command) {
            return Verdict::deny(reason);
        }

        for segment in split_segments(command) {
            let Some(program) = segment_program(&segment) else {
                continue;
            };
            if !self.allowed.contains(&program) && !self.builtins.contains(&program) {
                return Verdict::deny(format!(
                    "Command denied: '{program}' is not on the allowed commands list"
                ));
            }
        }

        Verdict::allow()
    }
}

/// Patterns rejected even when every program is allow-listed.
fn critical_pattern(command: &str) -> Option<String> {
    let compact: String = command.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains(":(){:|:&};:") {
        return Some("Command denied: fork bomb pattern".to_string());
    }

    for segment in split_segments(command) {
        let tokens: Vec<&str> = segment.split_whitespace().collect();
        if tokens.first().map(|t| base_name(t)) != Some("rm".to_string()) {
            continue;
        }
        let mut recursive = false;
        let mut force = false;
        let mut root_target = false;
        for token in &tokens[1..] {
            if let Some(flags) = token.strip_prefix('-') {
                recursive |= flags.contains('r') || flags.contains('R');
                force |= flags.contains('f');
            } else if *token == "/" || *token == "/*" {
                root_target = true;
            }
        }
        if recursive && force && root_target {
            return Some("Command denied: refusing to remove the filesystem root".to_string());
        }
    }
    None
}

/// Split a command on unquoted `;`, `|`, `||`, `&&`, honoring single and
/// double quotes and backslash escapes.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            '|' if !in_single && !in_double => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            '&' if !in_single && !in_double && chars.peek() == Some(&'&') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Extract the program name of one segment: strip leading whitespace and
/// opening `(`/`{`, skip `VAR=value` assignments, take the first token, and
/// drop any path prefix.
fn segment_program(segment: &str) -> Option<String> {
    let mut rest = segment.trim_start();
    while let Some(stripped) = rest.strip_prefix('(').or_else(|| rest.strip_prefix('{')) {
        rest = stripped.trim_start();
    }

    for token in rest.split_whitespace() {
        if is_assignment(token) {
            continue;
        }
        return Some(base_name(token));
    }
    None
}

fn is_assignment(token: &str) -> bool {
    let Some(eq) = token.find('=') else {
        return false;
    };
    let name = &token[..eq];
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

fn base_name(token: &str) -> String {
    token.rsplit('/').next().unwrap_or(token).to_string()
}
