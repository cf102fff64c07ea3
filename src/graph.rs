//! Dependency graph construction: resolves a list of requested targets into
//! a DAG of [`Node`]s rooted at a synthetic root, choosing a concrete or
//! meta-rule for each node and recursively resolving its prerequisites.
//!
//! Cycle detection and rule-selection backtracking are memoised on
//! [`BuildGraph`]; the actual concurrent build walk lives in
//! [`crate::scheduler`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use indexmap::IndexMap;
use tracing::{debug, instrument, trace};

use crate::expand::{self, Vars};
use crate::ruleset::{Pattern, RuleSet};
use crate::world::World;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected involving '{0}'")]
    Cycle(String),
    #[error(transparent)]
    World(#[from] crate::world::WorldError),
}

/// `Status` per §3: a node's lifecycle is monotonic, `Ready -> Started ->
/// {NoOp, Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Started,
    NoOp,
    Done,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::NoOp | Status::Done | Status::Failed)
    }
}

/// The rule chosen to produce a node, recorded once per node (every
/// prerequisite edge of that node's parent shares this same choice, per the
/// data-model invariant — stored once here rather than duplicated onto each
/// `Edge`, which is the one place this implementation departs from a literal
/// per-edge `rule` field).
#[derive(Debug, Clone)]
pub struct ChosenRule {
    pub rule_idx: usize,
    pub stem: String,
    pub matches: Vec<String>,
}

/// One-shot completion state shared by a node's build task and any listeners
/// that attach before it finishes.
pub struct NodeState {
    pub status: Status,
    pub exists: bool,
    pub mtime: SystemTime,
}

pub struct Node {
    pub name: String,
    pub chosen: Option<ChosenRule>,
    /// Names of this node's prerequisite nodes, in declaration order.
    pub prereqs: Vec<String>,
    pub is_virtual: bool,
    pub rule_applications: AtomicUsize,
    pub state: Mutex<NodeState>,
    pub cond: Condvar,
}

impl Node {
    fn leaf(name: String, stat: crate::world::Stat) -> Node {
        Node {
            name,
            chosen: None,
            prereqs: Vec::new(),
            is_virtual: false,
            rule_applications: AtomicUsize::new(0),
            state: Mutex::new(NodeState {
                status: Status::Ready,
                exists: stat.exists,
                mtime: stat.mtime,
            }),
            cond: Condvar::new(),
        }
    }
}

/// The resolved DAG: a name-indexed node table plus the ruleset it was built
/// from. `root` is the synthetic node whose prerequisites are the
/// originally-requested targets (§4.E: "a graph with a synthetic root node
/// whose prerequisites are the user targets").
pub struct BuildGraph {
    pub ruleset: Arc<RuleSet>,
    pub nodes: Mutex<IndexMap<String, Arc<Node>>>,
    pub root: String,
    pub max_rule_cnt: usize,
}

pub struct GraphBuilder<'w> {
    ruleset: Arc<RuleSet>,
    world: &'w dyn World,
    max_rule_cnt: usize,
    nodes: Mutex<IndexMap<String, Arc<Node>>>,
    in_progress: Mutex<std::collections::HashSet<String>>,
    /// How many times each rule (by index) is currently applied along the
    /// DFS path being resolved — incremented on entering `try_rule`,
    /// decremented on leaving it (success, rejection, or error alike), so a
    /// rule that keeps matching deeper and deeper distinct names (e.g. a
    /// suffix rule whose own prereq pattern can match its own output) is
    /// bounded by `max_rule_cnt` instead of recursing unboundedly.
    rule_chain_counts: Mutex<std::collections::HashMap<usize, usize>>,
}

impl<'w> GraphBuilder<'w> {
    pub fn new(ruleset: Arc<RuleSet>, world: &'w dyn World, max_rule_cnt: usize) -> Self {
        GraphBuilder {
            ruleset,
            world,
            max_rule_cnt,
            nodes: Mutex::new(IndexMap::new()),
            in_progress: Mutex::new(std::collections::HashSet::new()),
            rule_chain_counts: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Build the synthetic root whose prerequisites are `targets`, resolving
    /// every node reachable from them.
    #[instrument(skip(self, targets))]
    pub fn build_root(mut self, targets: &[String]) -> Result<BuildGraph, GraphError> {
        for t in targets {
            self.resolve(t)?;
        }

        let root_name = String::new();
        let root = Node {
            name: root_name.clone(),
            chosen: None,
            prereqs: targets.to_vec(),
            is_virtual: true,
            rule_applications: AtomicUsize::new(0),
            state: Mutex::new(NodeState {
                status: Status::Ready,
                exists: false,
                mtime: SystemTime::UNIX_EPOCH,
            }),
            cond: Condvar::new(),
        };
        self.nodes
            .lock()
            .unwrap()
            .insert(root_name.clone(), Arc::new(root));

        Ok(BuildGraph {
            ruleset: self.ruleset,
            nodes: self.nodes,
            root: root_name,
            max_rule_cnt: self.max_rule_cnt,
        })
    }

    /// Resolve `name` into a node, memoised: returns the existing node if
    /// already resolved, detects in-progress cycles, otherwise picks a rule
    /// (literal lookup first, then backtracking meta-rule scan) or falls
    /// back to a filesystem/remote leaf.
    fn resolve(&self, name: &str) -> Result<Arc<Node>, GraphError> {
        if let Some(node) = self.nodes.lock().unwrap().get(name) {
            return Ok(node.clone());
        }
        if !self.in_progress.lock().unwrap().insert(name.to_string()) {
            return Err(GraphError::Cycle(name.to_string()));
        }

        let result = self.resolve_uncached(name);

        self.in_progress.lock().unwrap().remove(name);
        result
    }

    fn resolve_uncached(&self, name: &str) -> Result<Arc<Node>, GraphError> {
        if let Some(idxs) = self.ruleset.target_index.get(name) {
            for &idx in idxs {
                if let Some(node) = self.try_rule(name, idx, String::new(), Vec::new(), false)? {
                    return Ok(node);
                }
            }
        }

        for (idx, rule) in self.ruleset.meta_rules() {
            for pattern in &rule.targets {
                let Some(caps) = pattern.matches(name) else {
                    continue;
                };
                let stem = caps.first().copied().unwrap_or("").to_string();
                let matches = caps.iter().map(|s| s.to_string()).collect::<Vec<_>>();
                if let Some(node) = self.try_rule(name, idx, stem, matches, true)? {
                    return Ok(node);
                }
                // This candidate either had an unsatisfiable prereq or its
                // rule already hit maxRuleCnt along this path — try_rule
                // rejected it silently; backtrack to the next candidate.
            }
        }

        let stat = self.world.stat(name)?;
        if !stat.exists {
            debug!(name, "no rule found and target does not exist on the backing store");
        }
        let node = Arc::new(Node::leaf(name.to_string(), stat));
        self.nodes
            .lock()
            .unwrap()
            .insert(name.to_string(), node.clone());
        Ok(node)
    }

    /// Try building `name` from rule `idx` with a given stem/match capture.
    /// `backtrack` is set for meta-rule candidates: a prerequisite that can't
    /// itself be satisfied rejects the candidate so the caller can try the
    /// next one. Literal rules (`backtrack = false`) are used unconditionally
    /// once found, per the literal-lookup step having no alternative to fall
    /// back to.
    ///
    /// Rejects (returning `Ok(None)`, the same as an unsatisfiable prereq)
    /// without even trying the rule if applying `idx` here would push its
    /// application count past `max_rule_cnt` along the path currently being
    /// resolved; the caller backtracks to the next candidate exactly as it
    /// would for any other rejection.
    fn try_rule(
        &self,
        name: &str,
        idx: usize,
        stem: String,
        matches: Vec<String>,
        backtrack: bool,
    ) -> Result<Option<Arc<Node>>, GraphError> {
        if !self.enter_rule_application(idx) {
            trace!(name, rule = idx, "candidate rejected: maxRuleCnt exceeded along this path");
            return Ok(None);
        }
        let result = self.try_rule_inner(name, idx, stem, matches, backtrack);
        self.leave_rule_application(idx);
        result
    }

    /// Increment `idx`'s path-scoped application count, rejecting (returning
    /// `false`, leaving the count untouched) if that would exceed
    /// `max_rule_cnt`.
    fn enter_rule_application(&self, idx: usize) -> bool {
        let mut counts = self.rule_chain_counts.lock().unwrap();
        let current = *counts.get(&idx).unwrap_or(&0);
        if current >= self.max_rule_cnt {
            return false;
        }
        counts.insert(idx, current + 1);
        true
    }

    fn leave_rule_application(&self, idx: usize) {
        let mut counts = self.rule_chain_counts.lock().unwrap();
        if let Some(count) = counts.get_mut(&idx) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&idx);
            }
        }
    }

    fn try_rule_inner(
        &self,
        name: &str,
        idx: usize,
        stem: String,
        matches: Vec<String>,
        backtrack: bool,
    ) -> Result<Option<Arc<Node>>, GraphError> {
        let rule = &self.ruleset.rules[idx];

        let mut vars = self.ruleset.vars.clone();
        vars.insert("stem".to_string(), vec![stem.clone()]);
        for (i, m) in matches.iter().enumerate() {
            vars.insert(format!("stem{}", i + 1), vec![m.clone()]);
        }

        let mut prereq_names = Vec::new();
        for template in &rule.prereqs {
            let substituted = expand::expand_suffixes(template, &stem);
            match expand::expand_sigils(&substituted, &vars) {
                parts if parts.is_empty() => {}
                parts => prereq_names.extend(parts),
            }
        }

        for p in &prereq_names {
            let child = self.resolve(p)?;
            if backtrack {
                let satisfiable = child.chosen.is_some() || child.state.lock().unwrap().exists;
                if !satisfiable {
                    trace!(name, rule = idx, prereq = p.as_str(), "candidate rejected: unsatisfiable prereq");
                    return Ok(None);
                }
            }
        }

        let node = self.nodes.lock().unwrap().get(name).cloned();
        if let Some(node) = node {
            // Another thread (impossible in single-threaded graph building,
            // but kept for safety if this is ever parallelised) already
            // resolved this node while we were exploring.
            return Ok(Some(node));
        }

        // `try_rule` already bumped our entry in `rule_chain_counts` before
        // calling in here, so the current value is this rule's application
        // count along the path that produced this node.
        let applications = *self
            .rule_chain_counts
            .lock()
            .unwrap()
            .get(&idx)
            .unwrap_or(&0);

        let stat = self.world.stat(name)?;
        let node = Arc::new(Node {
            name: name.to_string(),
            chosen: Some(ChosenRule {
                rule_idx: idx,
                stem,
                matches,
            }),
            prereqs: prereq_names,
            is_virtual: rule.attribs.virtual_,
            rule_applications: AtomicUsize::new(applications),
            state: Mutex::new(NodeState {
                status: Status::Ready,
                exists: stat.exists,
                mtime: stat.mtime,
            }),
            cond: Condvar::new(),
        });

        self.nodes
            .lock()
            .unwrap()
            .insert(name.to_string(), node.clone());
        Ok(Some(node))
    }
}

impl BuildGraph {
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    pub fn rule(&self, idx: usize) -> &crate::ruleset::Rule {
        &self.ruleset.rules[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::world::{LocalWorld, World};

    struct NoIncludes;
    impl crate::parser::Includer for NoIncludes {
        fn run_command(&self, _c: &str, _v: &Vars) -> Result<String, crate::parser::ParseError> {
            Ok(String::new())
        }
        fn read_file(&self, _p: &str) -> Result<String, crate::parser::ParseError> {
            Ok(String::new())
        }
    }

    struct FakeWorld {
        existing: Vec<&'static str>,
    }
    impl World for FakeWorld {
        fn stat(&self, name: &str) -> Result<crate::world::Stat, crate::world::WorldError> {
            Ok(if self.existing.contains(&name) {
                crate::world::Stat {
                    exists: true,
                    mtime: SystemTime::now(),
                }
            } else {
                crate::world::Stat::missing()
            })
        }
        fn run_recipe(
            &self,
            _shell: &[String],
            _script: &str,
            _env: &Vars,
            _dir: &std::path::Path,
        ) -> Result<bool, crate::world::WorldError> {
            Ok(true)
        }
    }

    #[test]
    fn literal_rule_resolves_directly() {
        let rs = Arc::new(parse("a: b\n\techo hi\n", "mkfile", &NoIncludes).unwrap());
        let world = FakeWorld { existing: vec!["b"] };
        let graph = GraphBuilder::new(rs, &world, 1)
            .build_root(&["a".to_string()])
            .unwrap();
        let a = graph.node("a").unwrap();
        assert!(a.chosen.is_some());
        assert_eq!(a.prereqs, vec!["b".to_string()]);
        let b = graph.node("b").unwrap();
        assert!(b.chosen.is_none());
        assert!(b.state.lock().unwrap().exists);
    }

    #[test]
    fn meta_rule_resolves_via_suffix_pattern() {
        let rs = Arc::new(parse("%.o: %.c\n\tcc -c $prereq\n", "mkfile", &NoIncludes).unwrap());
        let world = FakeWorld {
            existing: vec!["main.c"],
        };
        let graph = GraphBuilder::new(rs, &world, 1)
            .build_root(&["main.o".to_string()])
            .unwrap();
        let node = graph.node("main.o").unwrap();
        let chosen = node.chosen.as_ref().unwrap();
        assert_eq!(chosen.stem, "main");
        assert_eq!(node.prereqs, vec!["main.c".to_string()]);
    }

    #[test]
    fn missing_leaf_is_still_a_node() {
        let rs = Arc::new(parse("a: b\n\techo hi\n", "mkfile", &NoIncludes).unwrap());
        let world = FakeWorld { existing: vec![] };
        let graph = GraphBuilder::new(rs, &world, 1)
            .build_root(&["a".to_string()])
            .unwrap();
        let b = graph.node("b").unwrap();
        assert!(!b.state.lock().unwrap().exists);
    }

    #[test]
    fn cycle_is_detected() {
        let rs = Arc::new(parse("a: b\n\techo a\nb: a\n\techo b\n", "mkfile", &NoIncludes).unwrap());
        let world = FakeWorld { existing: vec![] };
        let err = GraphBuilder::new(rs, &world, 1)
            .build_root(&["a".to_string()])
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }
}
