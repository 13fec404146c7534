//! Intra-ecosystem dependency graph.
//!
//! Nodes are member repositories in discovery order. An edge `app -> base`
//! exists only when `app` declares a dependency whose identifier equals
//! `base`'s module path; dependencies outside the ecosystem are ignored.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ReleaseError, ReleaseResult};
use crate::manifest::ManifestHandlers;
use crate::types::ProjectType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryNode {
    pub name: String,
    pub dir: PathBuf,
    pub project_type: ProjectType,
    pub module_path: Option<String>,
    /// Identifiers as declared in the manifest, members or not.
    pub declared_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<RepositoryNode>,
    index: HashMap<String, usize>,
    /// `dependent -> dependencies`, member names only.
    upstream: BTreeMap<String, Vec<String>>,
    /// `dependency -> dependents`, member names only.
    downstream: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Scan `members` (directories, relative to `root` or absolute) and build
    /// the graph. Rejects cycles.
    pub fn build(root: &Path, members: &[PathBuf], handlers: &ManifestHandlers) -> ReleaseResult<Self> {
        let mut nodes = Vec::with_capacity(members.len());
        for member in members {
            let dir = if member.is_absolute() {
                member.clone()
            } else {
                root.join(member)
            };
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    ReleaseError::GraphBuild(format!("member path {} has no name", dir.display()))
                })?;
            let (project_type, manifest) = handlers
                .load(&dir)
                .map_err(|e| ReleaseError::GraphBuild(format!("{name}: {e:#}")))?;
            nodes.push(RepositoryNode {
                name,
                dir,
                project_type,
                module_path: manifest.module_path,
                declared_dependencies: manifest.dependencies,
            });
        }

        let graph = Self::from_nodes(nodes)?;
        if let Some(cycle) = graph.find_cycle() {
            return Err(ReleaseError::Cycle { cycle });
        }
        Ok(graph)
    }

    /// Assemble a graph from already-built nodes. Cycles are not rejected
    /// here; the leveler reports them.
    pub fn from_nodes(nodes: Vec<RepositoryNode>) -> ReleaseResult<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        let mut by_module: HashMap<&str, &str> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(ReleaseError::GraphBuild(format!(
                    "duplicate member name '{}'",
                    node.name
                )));
            }
            if let Some(module) = &node.module_path {
                by_module.insert(module.as_str(), node.name.as_str());
            }
        }

        let mut upstream: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut downstream: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &nodes {
            let deps = upstream.entry(node.name.clone()).or_default();
            for declared in &node.declared_dependencies {
                let Some(&target) = by_module.get(declared.as_str()) else {
                    continue;
                };
                if target == node.name || deps.iter().any(|d| d == target) {
                    continue;
                }
                deps.push(target.to_string());
                downstream
                    .entry(target.to_string())
                    .or_default()
                    .push(node.name.clone());
            }
        }

        Ok(Self {
            nodes,
            index,
            upstream,
            downstream,
        })
    }

    /// Nodes in discovery order.
    pub fn nodes(&self) -> &[RepositoryNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&RepositoryNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of `name` in discovery order.
    pub fn discovery_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Member repositories `name` depends on directly.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.upstream.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Member repositories depending on `name` directly.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.downstream.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every repository that depends on `name`, directly or not.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(cur) = stack.pop() {
            for dependent in self.dependents_of(cur) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen.remove(name);
        seen
    }

    /// A dependency cycle, as `[a, b, ..., a]`, if the graph has one.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            name: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(name, Mark::InProgress);
            stack.push(name);
            for dep in graph.dependencies_of(name) {
                match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::InProgress => {
                        let start = stack.iter().position(|n| *n == dep.as_str())?;
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks.insert(name, Mark::Done);
            None
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for node in &self.nodes {
            if marks.get(node.name.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, &node.name, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

/// Member directories below `root`: immediate subdirectories that carry a
/// `.git` entry, sorted by name.
pub fn discover_members(root: &Path) -> ReleaseResult<Vec<PathBuf>> {
    let entries = fs::read_dir(root).map_err(|e| {
        ReleaseError::GraphBuild(format!("failed to read ecosystem root {}: {e}", root.display()))
    })?;

    let mut members: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            ReleaseError::GraphBuild(format!("failed to read ecosystem root {}: {e}", root.display()))
        })?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && path.is_dir() && path.join(".git").exists() {
            members.push(path);
        }
    }
    members.sort();
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn node(name: &str, deps: &[&str]) -> RepositoryNode {
        RepositoryNode {
            name: name.to_string(),
            dir: PathBuf::from(name),
            project_type: ProjectType::Go,
            module_path: Some(format!("example.com/{name}")),
            declared_dependencies: deps.iter().map(|d| format!("example.com/{d}")).collect(),
        }
    }

    fn write_go_repo(root: &Path, name: &str, requires: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join(".git")).expect("mkdir");
        let mut content = format!("module example.com/{name}\n\ngo 1.22\n");
        for r in requires {
            content.push_str(&format!("require {r} v1.0.0\n"));
        }
        fs::write(dir.join("go.mod"), content).expect("write");
    }

    #[test]
    fn edges_only_between_members() {
        let graph = DependencyGraph::from_nodes(vec![
            node("base", &[]),
            RepositoryNode {
                declared_dependencies: vec![
                    "example.com/base".to_string(),
                    "github.com/external/lib".to_string(),
                ],
                ..node("app", &[])
            },
        ])
        .expect("graph");

        assert_eq!(graph.dependencies_of("app"), &["base".to_string()]);
        assert_eq!(graph.dependents_of("base"), &["app".to_string()]);
        assert!(graph.dependencies_of("base").is_empty());
    }

    #[test]
    fn transitive_dependents_follow_chains() {
        let graph = DependencyGraph::from_nodes(vec![
            node("base", &[]),
            node("mid", &["base"]),
            node("top", &["mid"]),
            node("other", &[]),
        ])
        .expect("graph");

        let deps = graph.transitive_dependents("base");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["mid", "top"]);
    }

    #[test]
    fn find_cycle_reports_path() {
        let graph = DependencyGraph::from_nodes(vec![
            node("a", &["b"]),
            node("b", &["c"]),
            node("c", &["a"]),
        ])
        .expect("graph");

        let cycle = graph.find_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = DependencyGraph::from_nodes(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert!(matches!(err, ReleaseError::GraphBuild(_)));
    }

    #[test]
    fn build_scans_manifests() {
        let td = tempdir().expect("tempdir");
        write_go_repo(td.path(), "base", &[]);
        write_go_repo(td.path(), "app", &["example.com/base", "golang.org/x/mod"]);
        fs::create_dir_all(td.path().join("docs/.git")).expect("mkdir");

        let members = discover_members(td.path()).expect("discover");
        let names: Vec<_> = members
            .iter()
            .map(|m| m.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["app", "base", "docs"]);

        let graph = DependencyGraph::build(td.path(), &members, &ManifestHandlers::default())
            .expect("graph");
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.node("docs").unwrap().project_type, ProjectType::Generic);
        assert_eq!(graph.dependencies_of("app"), &["base".to_string()]);
    }

    #[test]
    fn build_rejects_cycles() {
        let td = tempdir().expect("tempdir");
        write_go_repo(td.path(), "a", &["example.com/b"]);
        write_go_repo(td.path(), "b", &["example.com/a"]);

        let err = DependencyGraph::build(
            td.path(),
            &[PathBuf::from("a"), PathBuf::from("b")],
            &ManifestHandlers::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReleaseError::Cycle { .. }));
    }

    #[test]
    fn cargo_dev_dependency_cycle_is_allowed() {
        let td = tempdir().expect("tempdir");
        for (name, section, dep) in [("a", "dependencies", "b"), ("b", "dev-dependencies", "a")] {
            let dir = td.path().join(name);
            fs::create_dir_all(&dir).expect("mkdir");
            let toml = format!("[package]\nname = \"{name}\"\n\n[{section}]\n{dep} = \"1\"\n");
            fs::write(dir.join("Cargo.toml"), toml).expect("write");
        }

        let graph = DependencyGraph::build(
            td.path(),
            &[PathBuf::from("a"), PathBuf::from("b")],
            &ManifestHandlers::default(),
        )
        .expect("graph");
        assert_eq!(graph.dependencies_of("a"), &["b".to_string()]);
        assert!(graph.dependencies_of("b").is_empty());
    }

    #[test]
    fn build_reports_unparsable_manifest() {
        let td = tempdir().expect("tempdir");
        let dir = td.path().join("broken");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("Cargo.toml"), "[package\n").expect("write");

        let err = DependencyGraph::build(td.path(), &[PathBuf::from("broken")], &ManifestHandlers::default())
            .unwrap_err();
        assert!(matches!(err, ReleaseError::GraphBuild(_)));
        assert!(err.to_string().contains("broken"));
    }
}
