//! In-memory collaborators for unit and scenario tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};

use crate::ci::CiStatus;
use crate::git::VersionControl;
use crate::index::ModuleIndex;
use crate::process::CancelToken;

#[derive(Debug, Clone, Default)]
pub struct FakeRepo {
    pub porcelain: String,
    /// Local tags, oldest first.
    pub tags: Vec<String>,
    pub remote_tags: BTreeSet<String>,
    pub commits_since_tag: u32,
    pub subjects: Vec<String>,
    pub head_tagged: bool,
    pub short_hash: String,
    pub head_sha: String,
    pub remote_url: String,
    pub ahead: u32,
    pub behind: u32,
    pub branch: String,
    /// No tracking branch: ahead/behind always read `(0, 0)`, as git reports it.
    pub no_upstream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub dir: PathBuf,
    pub op: &'static str,
    pub arg: String,
}

/// Version control over a map of fake repositories, keyed by directory.
#[derive(Default)]
pub struct FakeVcs {
    repos: Mutex<BTreeMap<PathBuf, FakeRepo>>,
    writes: Mutex<Vec<WriteOp>>,
    failures: Mutex<Vec<(PathBuf, &'static str)>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repo(&self, dir: &Path, repo: FakeRepo) {
        self.repos.lock().expect("lock").insert(dir.to_path_buf(), repo);
    }

    pub fn repo(&self, dir: &Path) -> FakeRepo {
        self.repos.lock().expect("lock").get(dir).cloned().unwrap_or_default()
    }

    /// Make write `op` (`"push_tag"`, `"commit"`, ...) fail in `dir`.
    pub fn fail_on(&self, dir: &Path, op: &'static str) {
        self.failures.lock().expect("lock").push((dir.to_path_buf(), op));
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.writes.lock().expect("lock").clone()
    }

    pub fn writes_in(&self, dir: &Path) -> Vec<WriteOp> {
        self.writes().into_iter().filter(|w| w.dir == dir).collect()
    }

    fn read<T>(&self, dir: &Path, f: impl FnOnce(&FakeRepo) -> T) -> Result<T> {
        let repos = self.repos.lock().expect("lock");
        let repo = repos
            .get(dir)
            .ok_or_else(|| anyhow!("not a git repository: {}", dir.display()))?;
        Ok(f(repo))
    }

    fn write(&self, dir: &Path, op: &'static str, arg: &str, f: impl FnOnce(&mut FakeRepo)) -> Result<()> {
        if self
            .failures
            .lock()
            .expect("lock")
            .iter()
            .any(|(d, o)| d == dir && *o == op)
        {
            bail!("simulated {op} failure in {}", dir.display());
        }
        let mut repos = self.repos.lock().expect("lock");
        let repo = repos
            .get_mut(dir)
            .ok_or_else(|| anyhow!("not a git repository: {}", dir.display()))?;
        f(repo);
        self.writes.lock().expect("lock").push(WriteOp {
            dir: dir.to_path_buf(),
            op,
            arg: arg.to_string(),
        });
        Ok(())
    }
}

impl VersionControl for FakeVcs {
    fn status(&self, dir: &Path) -> Result<String> {
        self.read(dir, |r| r.porcelain.clone())
    }

    fn latest_tag(&self, dir: &Path, include_prerelease: bool) -> Result<Option<String>> {
        self.read(dir, |r| {
            r.tags
                .iter()
                .rev()
                .find(|t| include_prerelease || !t.contains('-'))
                .cloned()
        })
    }

    fn exact_tag(&self, dir: &Path) -> Result<Option<String>> {
        self.read(dir, |r| if r.head_tagged { r.tags.last().cloned() } else { None })
    }

    fn commit_count(&self, dir: &Path, _since: Option<&str>) -> Result<u32> {
        self.read(dir, |r| r.commits_since_tag)
    }

    fn log_subjects(&self, dir: &Path, _since: Option<&str>) -> Result<Vec<String>> {
        self.read(dir, |r| r.subjects.clone())
    }

    fn short_head(&self, dir: &Path) -> Result<String> {
        self.read(dir, |r| r.short_hash.clone())
    }

    fn tags(&self, dir: &Path, pattern: &str) -> Result<Vec<String>> {
        let prefix = pattern.trim_end_matches('*').to_string();
        self.read(dir, |r| r.tags.iter().filter(|t| t.starts_with(&prefix)).cloned().collect())
    }

    fn changed_files(&self, dir: &Path) -> Result<Vec<String>> {
        self.read(dir, |r| {
            r.porcelain
                .lines()
                .filter_map(|l| l.get(3..))
                .map(str::to_string)
                .collect()
        })
    }

    fn ahead_behind(&self, dir: &Path) -> Result<(u32, u32)> {
        self.read(dir, |r| if r.no_upstream { (0, 0) } else { (r.ahead, r.behind) })
    }

    fn local_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool> {
        self.read(dir, |r| r.tags.iter().any(|t| t == tag))
    }

    fn remote_tag_exists(&self, dir: &Path, tag: &str) -> Result<bool> {
        self.read(dir, |r| r.remote_tags.contains(tag))
    }

    fn remote_url(&self, dir: &Path) -> Result<String> {
        self.read(dir, |r| r.remote_url.clone())
    }

    fn head_sha(&self, dir: &Path) -> Result<String> {
        self.read(dir, |r| r.head_sha.clone())
    }

    fn add(&self, dir: &Path, paths: &[&str]) -> Result<()> {
        self.write(dir, "add", &paths.join(" "), |_| {})
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<()> {
        self.write(dir, "commit", message, |r| {
            r.commits_since_tag += 1;
            r.head_tagged = false;
            r.ahead += 1;
            r.porcelain.clear();
        })
    }

    fn create_tag(&self, dir: &Path, tag: &str, _message: &str) -> Result<()> {
        self.write(dir, "tag", tag, |r| {
            r.tags.push(tag.to_string());
            r.head_tagged = true;
        })
    }

    fn push(&self, dir: &Path) -> Result<()> {
        self.write(dir, "push", "", |r| r.ahead = 0)
    }

    fn push_tag(&self, dir: &Path, tag: &str) -> Result<()> {
        self.write(dir, "push_tag", tag, |r| {
            r.remote_tags.insert(tag.to_string());
        })
    }

    fn reset_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        self.write(dir, "reset_branch", branch, |r| r.branch = branch.to_string())
    }

    fn force_push_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        self.write(dir, "force_push", branch, |r| r.ahead = 0)
    }
}

/// CI that is always green, optionally red for chosen directories.
#[derive(Default)]
pub struct FakeCi {
    failing: Mutex<BTreeSet<PathBuf>>,
    waits: Mutex<Vec<(PathBuf, Option<String>)>>,
}

impl FakeCi {
    pub fn fail_for(&self, dir: &Path) {
        self.failing.lock().expect("lock").insert(dir.to_path_buf());
    }

    pub fn waits(&self) -> Vec<(PathBuf, Option<String>)> {
        self.waits.lock().expect("lock").clone()
    }

    fn check(&self, dir: &Path, version: Option<&str>) -> Result<()> {
        self.waits
            .lock()
            .expect("lock")
            .push((dir.to_path_buf(), version.map(str::to_string)));
        if self.failing.lock().expect("lock").contains(dir) {
            bail!("workflow failed for {}", dir.display());
        }
        Ok(())
    }
}

impl CiStatus for FakeCi {
    fn wait_for_ci_workflow(&self, dir: &Path, _cancel: &CancelToken) -> Result<()> {
        self.check(dir, None)
    }

    fn wait_for_release_workflow(&self, dir: &Path, version: &str, _cancel: &CancelToken) -> Result<()> {
        self.check(dir, Some(version))
    }
}

#[derive(Default)]
pub struct FakeIndex {
    requests: Mutex<Vec<String>>,
}

impl FakeIndex {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock").clone()
    }
}

impl ModuleIndex for FakeIndex {
    fn wait_for_module(&self, module_path: &str, version: &str, _cancel: &CancelToken) -> Result<()> {
        self.requests
            .lock()
            .expect("lock")
            .push(format!("{module_path}@{version}"));
        Ok(())
    }
}
