//! Changelog drafts and changelog-file maintenance.
//!
//! A [`ChangelogGenerator`] turns the commits since the last tag into a
//! draft: a bump suggestion, a one-line justification and markdown. The
//! planner stages drafts under the state directory; the orchestrator later
//! prepends the staged markdown to the repository's changelog file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::process::{CancelToken, CommandOptions, run_command};
use crate::types::BumpKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRequest {
    pub repo: String,
    pub current_version: String,
    pub next_version: String,
    /// Commit subjects since the last tag, newest first.
    pub commits: Vec<String>,
}

impl ChangelogRequest {
    /// Prompt handed to external generators.
    pub fn prompt(&self) -> String {
        let mut out = format!(
            "Repository: {}\nCurrent version: {}\nTarget version: {}\n\nCommits since the last release:\n",
            self.repo, self.current_version, self.next_version
        );
        for subject in &self.commits {
            out.push_str("- ");
            out.push_str(subject);
            out.push('\n');
        }
        out.push_str(
            "\nRespond with JSON: {\"bump\": \"major|minor|patch\", \"justification\": \"...\", \"changelog\": \"<markdown>\"}\n",
        );
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogDraft {
    pub bump: BumpKind,
    pub justification: String,
    pub changelog: String,
}

pub trait ChangelogGenerator: Send + Sync {
    fn generate(&self, request: &ChangelogRequest, cancel: &CancelToken) -> Result<ChangelogDraft>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitKind {
    Breaking,
    Feature,
    Fix,
    Other,
}

fn classify(subject: &str) -> CommitKind {
    if subject.contains("BREAKING CHANGE") {
        return CommitKind::Breaking;
    }
    let Some((head, _)) = subject.split_once(':') else {
        return CommitKind::Other;
    };
    let head = head.trim();
    if head.ends_with('!') {
        return CommitKind::Breaking;
    }
    let kind = head.split('(').next().unwrap_or(head).trim().to_ascii_lowercase();
    match kind.as_str() {
        "feat" | "feature" => CommitKind::Feature,
        "fix" | "bugfix" => CommitKind::Fix,
        _ => CommitKind::Other,
    }
}

/// Bump implied by conventional-commit subjects: breaking → major,
/// `feat` → minor, anything else → patch.
pub fn suggest_bump<S: AsRef<str>>(subjects: &[S]) -> BumpKind {
    subjects
        .iter()
        .map(|s| match classify(s.as_ref()) {
            CommitKind::Breaking => BumpKind::Major,
            CommitKind::Feature => BumpKind::Minor,
            CommitKind::Fix | CommitKind::Other => BumpKind::Patch,
        })
        .max()
        .unwrap_or(BumpKind::Patch)
}

/// Built-in generator grouping conventional commits into sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitSummaryGenerator;

impl ChangelogGenerator for CommitSummaryGenerator {
    fn generate(&self, request: &ChangelogRequest, _cancel: &CancelToken) -> Result<ChangelogDraft> {
        let bump = suggest_bump(&request.commits);

        let sections = [
            (CommitKind::Breaking, "Breaking changes"),
            (CommitKind::Feature, "Features"),
            (CommitKind::Fix, "Fixes"),
            (CommitKind::Other, "Other changes"),
        ];
        let mut markdown = String::new();
        for (kind, title) in sections {
            let entries: Vec<&String> = request
                .commits
                .iter()
                .filter(|s| classify(s) == kind)
                .collect();
            if entries.is_empty() {
                continue;
            }
            if !markdown.is_empty() {
                markdown.push('\n');
            }
            markdown.push_str(&format!("### {title}\n\n"));
            for entry in entries {
                markdown.push_str(&format!("- {entry}\n"));
            }
        }
        if markdown.is_empty() {
            markdown.push_str("- Maintenance release.\n");
        }

        Ok(ChangelogDraft {
            bump,
            justification: format!(
                "{} commit(s) since {}; highest impact is {bump}",
                request.commits.len(),
                request.current_version
            ),
            changelog: markdown,
        })
    }
}

#[derive(Deserialize)]
struct RawDraft {
    bump: String,
    #[serde(default)]
    justification: String,
    changelog: String,
}

/// Parse a generator's reply. Chatter around the JSON object is ignored.
pub fn parse_draft(output: &str) -> Result<ChangelogDraft> {
    let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) else {
        bail!("generator output contains no JSON object");
    };
    if end < start {
        bail!("generator output contains no JSON object");
    }
    let raw: RawDraft =
        serde_json::from_str(&output[start..=end]).context("failed to parse generator JSON")?;
    let bump = raw
        .bump
        .parse::<BumpKind>()
        .map_err(|e| anyhow::anyhow!(e))
        .context("generator returned an invalid bump")?;
    Ok(ChangelogDraft {
        bump,
        justification: raw.justification,
        changelog: raw.changelog,
    })
}

/// External generator: the prompt goes to stdin, JSON comes back on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// From a `[program, args...]` list as written in the config file.
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("changelog command is empty");
        };
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ChangelogGenerator for CommandGenerator {
    fn generate(&self, request: &ChangelogRequest, cancel: &CancelToken) -> Result<ChangelogDraft> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let mut opts = CommandOptions::default()
            .stdin(request.prompt())
            .cancel(cancel.clone());
        if let Some(timeout) = self.timeout {
            opts = opts.timeout(timeout);
        }

        let out = run_command(&self.program, &args, &opts)
            .with_context(|| format!("failed to run changelog generator {}", self.program))?;
        if !out.success {
            bail!(
                "changelog generator {} failed for {}: {}",
                self.program,
                request.repo,
                out.combined_output().trim()
            );
        }
        parse_draft(&out.stdout)
            .with_context(|| format!("changelog generator {} for {}", self.program, request.repo))
    }
}

/// Where the planner keeps the draft for `repo`.
pub fn staging_path(state_dir: &Path, repo: &str) -> PathBuf {
    state_dir.join("changelogs").join(format!("{repo}.md"))
}

pub fn stage_draft(state_dir: &Path, repo: &str, markdown: &str) -> Result<PathBuf> {
    let path = staging_path(state_dir, repo);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, markdown)
        .with_context(|| format!("failed to write changelog draft {}", path.display()))?;
    Ok(path)
}

fn has_entry(content: &str, version: &str) -> bool {
    let heading = format!("## {version}");
    content.lines().map(str::trim_end).any(|line| {
        line == heading
            || line
                .strip_prefix(&heading)
                .is_some_and(|rest| rest.starts_with(' ') || rest.starts_with('\t'))
    })
}

/// Insert `## <version> - <date>` with `body` at the top of the changelog,
/// below a leading `# ` title if there is one.
///
/// Returns `false` (and leaves the file alone) when an entry for `version`
/// already exists.
pub fn prepend_entry(path: &Path, version: &str, date: NaiveDate, body: &str) -> Result<bool> {
    let existing = if path.exists() {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read changelog {}", path.display()))?
    } else {
        String::new()
    };
    if has_entry(&existing, version) {
        return Ok(false);
    }

    let entry = format!("## {version} - {}\n\n{}\n", date.format("%Y-%m-%d"), body.trim());
    let updated = match existing.split_once('\n') {
        Some((title, rest)) if title.starts_with("# ") => {
            format!("{title}\n\n{entry}\n{}", rest.trim_start_matches('\n'))
        }
        None if existing.starts_with("# ") => format!("{}\n\n{entry}", existing.trim_end()),
        _ if existing.trim().is_empty() => format!("# Changelog\n\n{entry}"),
        _ => format!("{entry}\n{existing}"),
    };

    fs::write(path, updated)
        .with_context(|| format!("failed to write changelog {}", path.display()))?;
    Ok(true)
}
