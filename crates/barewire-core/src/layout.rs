//! Nested `node_modules` layout computation.
//!
//! Given the root-level required packages and the dependency edges discovered
//! while crawling, computes the hoist-or-nest directory tree a package
//! manager would produce on disk: a dependency every requirer agrees on is
//! placed once at the top level; a conflicting version is nested directly
//! under its requirer. Walking upward from any package therefore always finds
//! a copy matching that package's own requirement.

use std::collections::BTreeMap;

/// Dependency edges discovered through actual imports:
/// `pkg -> version -> (depPkg -> depVersion)`.
pub type DependencyGraph = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// A `node_modules` directory: package name -> placed entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeModulesDirectory {
    pub packages: BTreeMap<String, NodeModulesEntry>,
}

/// One placed package and its nested directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeModulesEntry {
    pub version: String,
    pub node_modules: NodeModulesDirectory,
}

impl NodeModulesDirectory {
    /// All physical placements of `pkg@version`, as path prefixes like
    /// `"foo"` or `"parent/node_modules/foo"`.
    ///
    /// A conflicting version can be nested under several requirers, so the
    /// same package version may have multiple placements.
    #[must_use]
    pub fn placements(&self, pkg: &str, version: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_placements(None, pkg, version, &mut out);
        out
    }

    fn collect_placements(
        &self,
        prefix: Option<&str>,
        pkg: &str,
        version: &str,
        out: &mut Vec<String>,
    ) {
        for (name, entry) in &self.packages {
            let here = match prefix {
                Some(p) => format!("{p}/node_modules/{name}"),
                None => name.clone(),
            };
            if name == pkg && entry.version == version {
                out.push(here.clone());
            }
            entry
                .node_modules
                .collect_placements(Some(&here), pkg, version, out);
        }
    }

    fn dir_at(&self, chain: &[String]) -> &NodeModulesDirectory {
        let mut dir = self;
        for name in chain {
            dir = &dir.packages[name].node_modules;
        }
        dir
    }

    fn dir_at_mut(&mut self, chain: &[String]) -> &mut NodeModulesDirectory {
        let mut dir = self;
        for name in chain {
            dir = &mut dir.packages.get_mut(name).unwrap().node_modules;
        }
        dir
    }
}

/// Compute the nested layout for the given roots and discovered edges.
///
/// Root dependencies are pinned at the top level first, then each package's
/// edges are placed: hoisted to the root when the package is absent from the
/// requirer's resolution path, reused when present at the same version,
/// nested under the requirer when present at a conflicting version.
#[must_use]
pub fn layout(
    root_dependencies: &BTreeMap<String, String>,
    graph: &DependencyGraph,
) -> NodeModulesDirectory {
    let mut root = NodeModulesDirectory::default();
    for (pkg, version) in root_dependencies {
        root.packages.insert(
            pkg.clone(),
            NodeModulesEntry {
                version: version.clone(),
                node_modules: NodeModulesDirectory::default(),
            },
        );
    }
    for (pkg, version) in root_dependencies {
        place_dependencies(&mut root, &[pkg.clone()], pkg, version, graph);
    }
    root
}

/// Place every recorded edge of `pkg@version`, then recurse into the newly
/// created placements.
///
/// Two phases: all direct dependencies are placed before any of their own
/// edges are, so a sibling's conflicting copy is already visible on the path
/// when a subtree resolves the same name.
fn place_dependencies(
    root: &mut NodeModulesDirectory,
    chain: &[String],
    pkg: &str,
    version: &str,
    graph: &DependencyGraph,
) {
    let Some(deps) = graph.get(pkg).and_then(|by_version| by_version.get(version)) else {
        return;
    };
    let mut placed = Vec::new();
    for (dep, dep_version) in deps {
        if let Some(new_chain) = place(root, chain, dep, dep_version) {
            placed.push((new_chain, dep, dep_version));
        }
    }
    for (new_chain, dep, dep_version) in placed {
        place_dependencies(root, &new_chain, dep, dep_version, graph);
    }
}

/// Place one dependency relative to its requirer's chain (root -> requirer).
///
/// Walk-up resolution finds the *nearest* copy of a name, so the decision is
/// made at the first directory on the chain, deepest first, that contains
/// `dep`: matching version reuses it, conflicting version nests a copy under
/// the requirer. A name absent from the whole chain hoists to the root.
///
/// Returns the chain of a newly created placement, `None` when an existing
/// one was reused (its edges were already placed when it was created, which
/// also breaks cycles).
fn place(
    root: &mut NodeModulesDirectory,
    requirer_chain: &[String],
    dep: &str,
    dep_version: &str,
) -> Option<Vec<String>> {
    let target = 'decide: {
        for depth in (0..=requirer_chain.len()).rev() {
            let dir = root.dir_at(&requirer_chain[..depth]);
            if let Some(existing) = dir.packages.get(dep) {
                if existing.version == dep_version {
                    return None;
                }
                // The nearest copy shadows any farther match; nest under the
                // requirer so walk-up finds the required version first.
                break 'decide requirer_chain.to_vec();
            }
        }
        Vec::new()
    };

    let dir = root.dir_at_mut(&target);
    if dir.packages.contains_key(dep) {
        return None;
    }
    dir.packages.insert(
        dep.to_string(),
        NodeModulesEntry {
            version: dep_version.to_string(),
            node_modules: NodeModulesDirectory::default(),
        },
    );

    let mut new_chain = target;
    new_chain.push(dep.to_string());
    Some(new_chain)
}
