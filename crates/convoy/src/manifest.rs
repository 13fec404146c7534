//! Per-project-type manifest handling.
//!
//! The graph builder never looks inside a manifest itself. It asks the
//! registered [`ManifestHandler`]s, in order, whether a repository carries
//! their manifest file, and lets the first match parse it. Handlers also
//! rewrite a dependency's version during a release.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use toml_edit::{DocumentMut, Item, Value};

use crate::types::ProjectType;

/// What a manifest declares, as far as ordering is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Identifier other repositories use to depend on this one.
    pub module_path: Option<String>,
    /// Identifiers this repository depends on, in declaration order.
    pub dependencies: Vec<String>,
}

pub trait ManifestHandler: Send + Sync {
    fn project_type(&self) -> ProjectType;

    /// File name of the manifest, relative to the repository root.
    fn manifest_file(&self) -> &'static str;

    fn parse(&self, content: &str) -> Result<Manifest>;

    /// Point the dependency on `module` at `version`.
    ///
    /// `version` is a tag (`v1.2.3`). Returns `None` when the manifest does
    /// not mention `module` or already has that version.
    fn rewrite_dependency(&self, content: &str, module: &str, version: &str) -> Result<Option<String>>;

    /// Whether releases of this type show up in a package index that can be
    /// polled for availability.
    fn publishes_to_index(&self) -> bool;
}

/// Ordered set of handlers; the first whose manifest file exists wins.
pub struct ManifestHandlers {
    handlers: Vec<Box<dyn ManifestHandler>>,
}

impl Default for ManifestHandlers {
    fn default() -> Self {
        Self::new(vec![Box::new(GoModHandler), Box::new(CargoHandler)])
    }
}

impl ManifestHandlers {
    pub fn new(handlers: Vec<Box<dyn ManifestHandler>>) -> Self {
        Self { handlers }
    }

    /// Handler whose manifest file exists in `dir`, if any.
    pub fn detect(&self, dir: &Path) -> Option<&dyn ManifestHandler> {
        self.handlers
            .iter()
            .find(|h| dir.join(h.manifest_file()).is_file())
            .map(|h| h.as_ref())
    }

    pub fn for_type(&self, project_type: ProjectType) -> Option<&dyn ManifestHandler> {
        self.handlers
            .iter()
            .find(|h| h.project_type() == project_type)
            .map(|h| h.as_ref())
    }

    /// Read and parse the manifest in `dir`.
    ///
    /// A directory without any known manifest is [`ProjectType::Generic`]
    /// with no dependencies. A known manifest that fails to parse is an
    /// error; there is no falling back past a broken file.
    pub fn load(&self, dir: &Path) -> Result<(ProjectType, Manifest)> {
        let Some(handler) = self.detect(dir) else {
            return Ok((ProjectType::Generic, Manifest::default()));
        };
        let path = dir.join(handler.manifest_file());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest = handler
            .parse(&content)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        Ok((handler.project_type(), manifest))
    }

    /// Rewrite the manifest in `dir` on disk. Returns the manifest path when
    /// the file changed.
    pub fn rewrite_in_dir(
        &self,
        dir: &Path,
        project_type: ProjectType,
        module: &str,
        version: &str,
    ) -> Result<Option<PathBuf>> {
        let Some(handler) = self.for_type(project_type) else {
            return Ok(None);
        };
        let path = dir.join(handler.manifest_file());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        match handler.rewrite_dependency(&content, module, version)? {
            Some(updated) => {
                fs::write(&path, updated)
                    .with_context(|| format!("failed to write manifest {}", path.display()))?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    pub fn publishes_to_index(&self, project_type: ProjectType) -> bool {
        self.for_type(project_type)
            .is_some_and(|h| h.publishes_to_index())
    }
}

/// `go.mod`: `module` line plus single-line and block `require` directives.
pub struct GoModHandler;

impl ManifestHandler for GoModHandler {
    fn project_type(&self) -> ProjectType {
        ProjectType::Go
    }

    fn manifest_file(&self) -> &'static str {
        "go.mod"
    }

    fn parse(&self, content: &str) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        let mut in_require = false;

        for (idx, raw) in content.lines().enumerate() {
            let line = strip_go_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if in_require {
                if line == ")" {
                    in_require = false;
                    continue;
                }
                let (module, _) = parse_require_spec(line)
                    .with_context(|| format!("line {}: malformed require entry '{line}'", idx + 1))?;
                manifest.dependencies.push(module.to_string());
                continue;
            }

            let mut words = line.split_whitespace();
            match words.next() {
                Some("module") => {
                    let path = words
                        .next()
                        .with_context(|| format!("line {}: module directive without a path", idx + 1))?;
                    manifest.module_path = Some(path.trim_matches('"').to_string());
                }
                Some("require") => {
                    let rest = line["require".len()..].trim();
                    if rest == "(" {
                        in_require = true;
                    } else {
                        let (module, _) = parse_require_spec(rest).with_context(|| {
                            format!("line {}: malformed require directive '{line}'", idx + 1)
                        })?;
                        manifest.dependencies.push(module.to_string());
                    }
                }
                _ => {}
            }
        }

        if in_require {
            bail!("unterminated require block");
        }
        if manifest.module_path.is_none() {
            bail!("go.mod has no module directive");
        }
        Ok(manifest)
    }

    fn rewrite_dependency(&self, content: &str, module: &str, version: &str) -> Result<Option<String>> {
        let mut changed = false;
        let mut in_require = false;
        let mut out = String::with_capacity(content.len());

        for segment in content.split_inclusive('\n') {
            let (line, newline) = match segment.strip_suffix('\n') {
                Some(l) => (l, "\n"),
                None => (segment, ""),
            };
            let code = strip_go_comment(line).trim();

            let spec = if in_require {
                if code == ")" {
                    in_require = false;
                    None
                } else {
                    Some(code)
                }
            } else if let Some(rest) = code.strip_prefix("require") {
                let rest = rest.trim();
                if rest == "(" {
                    in_require = true;
                    None
                } else {
                    Some(rest)
                }
            } else {
                None
            };

            if let Some(spec) = spec
                && let Some((dep, current)) = parse_require_spec(spec)
                && dep == module
                && current != version
                && let Some(pos) = find_version_token(line, dep, current)
            {
                out.push_str(&line[..pos]);
                out.push_str(version);
                out.push_str(&line[pos + current.len()..]);
                out.push_str(newline);
                changed = true;
                continue;
            }

            out.push_str(segment);
        }

        Ok(changed.then_some(out))
    }

    fn publishes_to_index(&self) -> bool {
        true
    }
}

fn strip_go_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// `module/path v1.2.3` → (`module/path`, `v1.2.3`).
fn parse_require_spec(spec: &str) -> Option<(&str, &str)> {
    let mut words = spec.split_whitespace();
    let module = words.next()?.trim_matches('"');
    let version = words.next()?;
    if words.next().is_some() || !version.starts_with('v') {
        return None;
    }
    Some((module, version))
}

/// Byte offset of `version` following `module` on `line`.
fn find_version_token(line: &str, module: &str, version: &str) -> Option<usize> {
    let module_at = line.find(module)?;
    let after = module_at + module.len();
    line[after..].find(version).map(|off| after + off)
}

/// `Cargo.toml`: package name plus normal and build dependencies. Dev
/// dependencies may form cycles, so they are rewritten but never ordered on.
pub struct CargoHandler;

const CARGO_EDGE_TABLES: [&str; 2] = ["dependencies", "build-dependencies"];
const CARGO_DEP_TABLES: [&str; 3] = ["dependencies", "build-dependencies", "dev-dependencies"];

impl ManifestHandler for CargoHandler {
    fn project_type(&self) -> ProjectType {
        ProjectType::Cargo
    }

    fn manifest_file(&self) -> &'static str {
        "Cargo.toml"
    }

    fn parse(&self, content: &str) -> Result<Manifest> {
        let doc: DocumentMut = content.parse().context("invalid TOML")?;

        let module_path = doc
            .get("package")
            .and_then(|p| p.get("name"))
            .and_then(Item::as_str)
            .map(str::to_string);

        let mut dependencies = Vec::new();
        for table_name in CARGO_EDGE_TABLES {
            let Some(table) = doc.get(table_name).and_then(Item::as_table_like) else {
                continue;
            };
            for (key, item) in table.iter() {
                let name = cargo_dependency_name(key, item);
                if !dependencies.contains(&name) {
                    dependencies.push(name);
                }
            }
        }

        Ok(Manifest {
            module_path,
            dependencies,
        })
    }

    fn rewrite_dependency(&self, content: &str, module: &str, version: &str) -> Result<Option<String>> {
        let mut doc: DocumentMut = content.parse().context("invalid TOML")?;
        let bare = version.strip_prefix('v').unwrap_or(version);
        let mut changed = false;

        for table_name in CARGO_DEP_TABLES {
            let Some(table) = doc.get_mut(table_name).and_then(Item::as_table_like_mut) else {
                continue;
            };
            let keys: Vec<String> = table
                .iter()
                .filter(|(key, item)| cargo_dependency_name(key, item) == module)
                .map(|(key, _)| key.to_string())
                .collect();

            for key in keys {
                let Some(item) = table.get_mut(&key) else {
                    continue;
                };
                changed |= set_cargo_version(item, bare);
            }
        }

        Ok(changed.then(|| doc.to_string()))
    }

    fn publishes_to_index(&self) -> bool {
        false
    }
}

fn cargo_dependency_name(key: &str, item: &Item) -> String {
    item.as_table_like()
        .and_then(|t| t.get("package"))
        .and_then(Item::as_str)
        .unwrap_or(key)
        .to_string()
}

fn set_cargo_version(item: &mut Item, version: &str) -> bool {
    if let Some(current) = item.as_str() {
        if current == version {
            return false;
        }
        *item = Item::Value(Value::from(version));
        return true;
    }
    if let Some(table) = item.as_table_like_mut() {
        if table.get("version").and_then(Item::as_str) == Some(version) {
            return false;
        }
        if let Some(existing) = table.get_mut("version") {
            let decor = existing.as_value().map(|v| v.decor().clone());
            let mut value = Value::from(version);
            if let Some(decor) = decor {
                *value.decor_mut() = decor;
            }
            *existing = Item::Value(value);
        } else {
            table.insert("version", Item::Value(Value::from(version)));
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    const GO_MOD: &str = "module github.com/acme/app\n\ngo 1.22\n\nrequire github.com/acme/base v1.4.0\n\nrequire (\n\tgithub.com/acme/util v0.3.1 // indirect\n\tgolang.org/x/text v0.14.0\n)\n";

    #[test]
    fn go_mod_parses_module_and_requires() {
        let m = GoModHandler.parse(GO_MOD).expect("parse");
        assert_eq!(m.module_path.as_deref(), Some("github.com/acme/app"));
        assert_eq!(
            m.dependencies,
            vec!["github.com/acme/base", "github.com/acme/util", "golang.org/x/text"]
        );
    }

    #[test]
    fn go_mod_without_module_is_rejected() {
        let err = GoModHandler.parse("go 1.22\n").expect_err("must fail");
        assert!(err.to_string().contains("no module directive"));
    }

    #[test]
    fn go_mod_unterminated_block_is_rejected() {
        let err = GoModHandler
            .parse("module x\nrequire (\n\ta v1.0.0\n")
            .expect_err("must fail");
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn go_mod_rewrite_single_line_and_block() {
        let out = GoModHandler
            .rewrite_dependency(GO_MOD, "github.com/acme/base", "v1.5.0")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains("require github.com/acme/base v1.5.0\n"));

        let out = GoModHandler
            .rewrite_dependency(GO_MOD, "github.com/acme/util", "v0.4.0")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains("\tgithub.com/acme/util v0.4.0 // indirect\n"));
        assert!(out.contains("golang.org/x/text v0.14.0"));
    }

    #[test]
    fn go_mod_rewrite_is_none_when_unchanged_or_absent() {
        assert!(GoModHandler
            .rewrite_dependency(GO_MOD, "github.com/acme/base", "v1.4.0")
            .expect("rewrite")
            .is_none());
        assert!(GoModHandler
            .rewrite_dependency(GO_MOD, "github.com/acme/missing", "v9.0.0")
            .expect("rewrite")
            .is_none());
    }

    #[test]
    fn go_mod_rewrite_does_not_touch_prefix_modules() {
        let content = "module x\n\nrequire (\n\tgithub.com/acme/base-extra v1.0.0\n\tgithub.com/acme/base v1.0.0\n)\n";
        let out = GoModHandler
            .rewrite_dependency(content, "github.com/acme/base", "v1.1.0")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains("github.com/acme/base-extra v1.0.0"));
        assert!(out.contains("\tgithub.com/acme/base v1.1.0\n"));
    }

    const CARGO_TOML: &str = r#"[package]
name = "app"
version = "0.1.0"

[dependencies]
base = "1.4.0"
serde = { version = "1", features = ["derive"] }
renamed = { package = "util", version = "0.3.1" } # pinned

[dev-dependencies]
base = { path = "../base" }
"#;

    #[test]
    fn cargo_parses_package_and_renames() {
        let m = CargoHandler.parse(CARGO_TOML).expect("parse");
        assert_eq!(m.module_path.as_deref(), Some("app"));
        assert_eq!(m.dependencies, vec!["base", "serde", "util"]);
    }

    #[test]
    fn cargo_dev_dependencies_are_rewritten_but_not_edges() {
        let content = "[package]\nname = \"base\"\n\n[dev-dependencies]\napp = \"0.4.0\"\n";
        let m = CargoHandler.parse(content).expect("parse");
        assert!(m.dependencies.is_empty());

        let out = CargoHandler
            .rewrite_dependency(content, "app", "v0.4.1")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains(r#"app = "0.4.1""#));
    }

    #[test]
    fn cargo_rewrite_keeps_formatting_and_strips_prefix() {
        let out = CargoHandler
            .rewrite_dependency(CARGO_TOML, "util", "v0.4.0")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains(r#"renamed = { package = "util", version = "0.4.0" } # pinned"#));
        assert!(out.contains(r#"base = "1.4.0""#));
    }

    #[test]
    fn cargo_rewrite_updates_every_table() {
        let out = CargoHandler
            .rewrite_dependency(CARGO_TOML, "base", "v1.5.0")
            .expect("rewrite")
            .expect("changed");
        assert!(out.contains(r#"base = "1.5.0""#));
        assert!(out.contains(r#"path = "../base""#));
        assert!(out.contains(r#"version = "1.5.0""#));
    }

    #[test]
    fn cargo_invalid_toml_is_an_error() {
        assert!(CargoHandler.parse("[package\nname=").is_err());
    }

    #[test]
    fn load_falls_back_to_generic_without_manifest() {
        let td = tempdir().expect("tempdir");
        let (kind, manifest) = ManifestHandlers::default().load(td.path()).expect("load");
        assert_eq!(kind, ProjectType::Generic);
        assert_eq!(manifest, Manifest::default());
    }

    #[test]
    fn load_surfaces_broken_manifest() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("go.mod"), "require (\n").expect("write");
        let err = ManifestHandlers::default().load(td.path()).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to parse manifest"));
    }

    #[test]
    fn rewrite_in_dir_writes_only_on_change() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("go.mod"), GO_MOD).expect("write");
        let handlers = ManifestHandlers::default();

        let path = handlers
            .rewrite_in_dir(td.path(), ProjectType::Go, "github.com/acme/base", "v2.0.0")
            .expect("rewrite");
        assert_eq!(path, Some(td.path().join("go.mod")));
        let on_disk = fs::read_to_string(td.path().join("go.mod")).expect("read");
        assert!(on_disk.contains("github.com/acme/base v2.0.0"));

        let again = handlers
            .rewrite_in_dir(td.path(), ProjectType::Go, "github.com/acme/base", "v2.0.0")
            .expect("rewrite");
        assert_eq!(again, None);
    }

    #[test]
    fn only_go_publishes_to_index() {
        let handlers = ManifestHandlers::default();
        assert!(handlers.publishes_to_index(ProjectType::Go));
        assert!(!handlers.publishes_to_index(ProjectType::Cargo));
        assert!(!handlers.publishes_to_index(ProjectType::Generic));
    }
}
