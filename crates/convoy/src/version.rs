//! Next-version computation.
//!
//! Three policies: semantic bumps for member repositories, release-candidate
//! prereleases derived from the next patch, and calendar versions for the
//! ecosystem parent. Everything here is pure; callers gather the git facts.

use chrono::NaiveDate;
use semver::{Prerelease, Version};

use crate::error::{ReleaseError, ReleaseResult};
use crate::types::{BumpKind, ReleaseType};

/// Literal that starts every release-candidate prerelease identifier.
pub const RC_IDENTIFIER: &str = "rc";

/// Tag prefix used for every version convoy writes.
pub const TAG_PREFIX: &str = "v";

/// An existing tag, as far as versioning is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTag {
    Semantic(Version),
    /// `vYYYY.MM.DD[.N]`, carried through untouched in a semantic context.
    Calendar(String),
}

/// Whether `tag` looks like `vYYYY.MM.DD` or `vYYYY.MM.DD.N`.
pub fn is_calendar_tag(tag: &str) -> bool {
    let body = tag.strip_prefix(TAG_PREFIX).unwrap_or(tag);
    let parts: Vec<&str> = body.split('.').collect();
    if !(3..=4).contains(&parts.len()) {
        return false;
    }
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().copied().all(all_digits)
}

pub fn parse_tag(tag: &str) -> ReleaseResult<ParsedTag> {
    let trimmed = tag.trim();
    if is_calendar_tag(trimmed) {
        return Ok(ParsedTag::Calendar(trimmed.to_string()));
    }
    let body = trimmed.strip_prefix(TAG_PREFIX).unwrap_or(trimmed);
    Version::parse(body)
        .map(ParsedTag::Semantic)
        .map_err(|e| ReleaseError::VersionCalculation(format!("invalid version tag '{tag}': {e}")))
}

pub fn format_tag(version: &Version) -> String {
    format!("{TAG_PREFIX}{version}")
}

/// Stable bump. A prerelease on the input is dropped and the numbers still
/// move, so the result always sorts strictly above `current`.
pub fn bump_semantic(current: &Version, bump: BumpKind) -> Version {
    let mut next = current.clone();
    match bump {
        BumpKind::Major => {
            next.major += 1;
            next.minor = 0;
            next.patch = 0;
        }
        BumpKind::Minor => {
            next.minor += 1;
            next.patch = 0;
        }
        BumpKind::Patch => next.patch += 1,
    }
    next.pre = Prerelease::EMPTY;
    next.build = semver::BuildMetadata::EMPTY;
    next
}

/// Release-candidate version for the commit `short_hash`.
///
/// A prerelease input keeps its base `major.minor.patch`; a stable input
/// moves to the next patch first. The identifier is `rc.<hash>`; a hash made
/// only of digits gets a `g` prefix so it stays a valid alphanumeric
/// identifier.
pub fn release_candidate(current: &Version, short_hash: &str) -> ReleaseResult<Version> {
    let mut base = Version::new(current.major, current.minor, current.patch);
    if current.pre.is_empty() {
        base.patch += 1;
    }

    let hash = short_hash.trim();
    if hash.is_empty() {
        return Err(ReleaseError::VersionCalculation(
            "release candidate needs a commit hash".to_string(),
        ));
    }
    let hash = if hash.bytes().all(|b| b.is_ascii_digit()) {
        format!("g{hash}")
    } else {
        hash.to_string()
    };

    base.pre = Prerelease::new(&format!("{RC_IDENTIFIER}.{hash}")).map_err(|e| {
        ReleaseError::VersionCalculation(format!("invalid prerelease for hash '{short_hash}': {e}"))
    })?;
    Ok(base)
}

/// Facts the semantic/RC policies need about one repository.
#[derive(Debug, Clone, Copy)]
pub struct VersionInputs<'a> {
    /// Latest tag, `None` when the repository was never tagged.
    pub current_tag: Option<&'a str>,
    pub bump: BumpKind,
    pub release_type: ReleaseType,
    pub short_hash: &'a str,
    pub commits_since_tag: u32,
    pub head_tagged: bool,
    /// Release even without new commits.
    pub force: bool,
}

/// The version string a repository would be tagged with, which equals
/// `current_tag` when nothing should be released.
pub fn next_version(inputs: &VersionInputs<'_>) -> ReleaseResult<String> {
    let current = match inputs.current_tag {
        None => Version::new(0, 0, 0),
        Some(tag) => match parse_tag(tag)? {
            ParsedTag::Semantic(v) => v,
            ParsedTag::Calendar(tag) => return Ok(tag),
        },
    };

    match inputs.release_type {
        ReleaseType::Full => {
            if inputs.commits_since_tag == 0 && inputs.head_tagged && !inputs.force {
                return Ok(current_label(inputs.current_tag, &current));
            }
            Ok(format_tag(&bump_semantic(&current, inputs.bump)))
        }
        ReleaseType::ReleaseCandidate => {
            Ok(format_tag(&release_candidate(&current, inputs.short_hash)?))
        }
    }
}

/// How an absent or present tag is shown as the current version.
pub fn current_label(tag: Option<&str>, parsed: &Version) -> String {
    match tag {
        Some(t) => t.trim().to_string(),
        None => format_tag(parsed),
    }
}

/// Calendar version of the ecosystem parent for `today`.
///
/// Returns `current` unchanged when nothing in the ecosystem changed. When a
/// tag for `today` already exists, `.1`, `.2`, … is appended past the highest
/// suffix in `existing_tags`.
pub fn next_calendar_version(
    current: Option<&str>,
    today: NaiveDate,
    existing_tags: &[String],
    any_changes: bool,
) -> Option<String> {
    if !any_changes {
        return current.map(str::to_string);
    }

    let base = format!("{TAG_PREFIX}{}", today.format("%Y.%m.%d"));
    let mut highest: Option<u32> = None;
    for tag in existing_tags.iter().map(|t| t.trim()) {
        if tag == base {
            highest = highest.max(Some(0));
        } else if let Some(suffix) = tag.strip_prefix(&base).and_then(|s| s.strip_prefix('.'))
            && let Ok(n) = suffix.parse::<u32>()
        {
            highest = highest.max(Some(n));
        }
    }

    Some(match highest {
        None => base,
        Some(n) => format!("{base}.{}", n + 1),
    })
}

/// Latest calendar tag, ordered by date and then suffix.
pub fn latest_calendar_tag(tags: &[String]) -> Option<String> {
    tags.iter()
        .filter(|t| is_calendar_tag(t))
        .max_by_key(|t| {
            t.trim_start_matches(TAG_PREFIX)
                .split('.')
                .map(|p| p.parse::<u32>().unwrap_or(0))
                .collect::<Vec<_>>()
        })
        .cloned()
}
