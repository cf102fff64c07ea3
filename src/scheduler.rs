//! Concurrent build scheduler (§4.F/§5): one task per node, synchronised
//! through each node's `Mutex<NodeState>` + `Condvar` and a handful of
//! process-wide resource guards (subprocess slot counter, exclusive lock,
//! output serialisation — the last lives in [`crate::report::Reporter`]).
//!
//! Grounded on `mk.go`'s `mkNode`/`mkNodePrereqs`/`reserveSubproc`/
//! `reserveExclusiveSubproc`, reworked onto `rayon::scope` instead of
//! goroutines-plus-channels, per-node completion via the graph's existing
//! `Mutex`+`Condvar` rather than a listener-channel list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::{debug, instrument, trace, warn};

use crate::expand::{self, Vars};
use crate::graph::{BuildGraph, Status};
use crate::report::Reporter;
use crate::world::World;

#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("one or more recipes failed")]
    RecipeFailed,
}

/// Everything the `-C/-n/-r/-a/-p/-l/-q` flags resolve into for the build
/// phase (§11: `BuildConfig` mirrors the teacher's `ExecConfig`).
pub struct BuildConfig {
    pub dry_run: bool,
    pub rebuild_all: bool,
    pub rebuild_targets: HashSet<String>,
    pub subprocs_allowed: usize,
    pub default_shell: Vec<String>,
    pub dir: PathBuf,
}

/// Process-wide resources shared by every node's build task (§5's "Shared
/// state" list, minus the per-node mutex which lives on `Node` itself).
struct BuildContext<'a> {
    graph: &'a BuildGraph,
    world: &'a dyn World,
    reporter: &'a dyn Reporter,
    config: &'a BuildConfig,
    subprocs_running: Mutex<usize>,
    subprocs_cond: Condvar,
    exclusive: Mutex<()>,
    /// Set once any recipe fails without `nonstop` (`E`); gates launching new
    /// (not yet started) builds, per §7.4: "the scheduler still finishes
    /// already-running tasks but launches no new ones after failure surfaces
    /// to root."
    aborting: AtomicBool,
}

/// Build every node reachable from `graph`'s root, returning `Ok(())` on a
/// fully successful (or no-op) run and `Err` if any recipe failed.
#[instrument(skip(graph, world, reporter, config))]
pub fn build(
    graph: &BuildGraph,
    world: &dyn World,
    reporter: &dyn Reporter,
    config: &BuildConfig,
) -> Result<(), BuildFailure> {
    let ctx = BuildContext {
        graph,
        world,
        reporter,
        config,
        subprocs_running: Mutex::new(0),
        subprocs_cond: Condvar::new(),
        exclusive: Mutex::new(()),
        aborting: AtomicBool::new(false),
    };

    let status = ensure_built(&ctx, &graph.root, true);
    if status == Status::Failed {
        Err(BuildFailure::RecipeFailed)
    } else {
        Ok(())
    }
}

/// Claim-and-build (or wait-for-completion) a single node by name. Mirrors
/// `mkNode`'s claim dance: the first caller to see `Ready`/`NoOp` flips the
/// node to `Started` and actually runs the algorithm; every other concurrent
/// caller waits on the condvar for a terminal status.
///
/// `Ready`/`NoOp` are both claimable (not just `Ready`): a node that
/// concluded `NoOp` because it wasn't `required` the first time around may
/// need a real build once a stale parent re-walks its prereqs with
/// `required=true` (§4.F step 6).
fn ensure_built(ctx: &BuildContext, name: &str, required: bool) -> Status {
    let node = ctx.graph.node(name).expect("resolved graph must contain every named node");

    let claimed = {
        let mut st = node.state.lock().unwrap();
        match st.status {
            Status::Ready | Status::NoOp => {
                st.status = Status::Started;
                true
            }
            _ => false,
        }
    };

    if !claimed {
        let mut st = node.state.lock().unwrap();
        while !st.status.is_terminal() {
            st = node.cond.wait(st).unwrap();
        }
        return st.status;
    }

    let result = run_claimed(ctx, name, required);

    {
        let mut st = node.state.lock().unwrap();
        st.status = result;
    }
    node.cond.notify_all();
    result
}

/// Build every prerequisite of `names` concurrently and wait for them all,
/// returning their terminal statuses (§4.F step 4 / `mkNodePrereqs`).
fn build_prereqs(ctx: &BuildContext, names: &[String], required: bool) -> Vec<Status> {
    if names.is_empty() {
        return Vec::new();
    }
    rayon::scope(|scope| {
        let (tx, rx) = std::sync::mpsc::channel();
        for name in names {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let status = ensure_built(ctx, name, required);
                let _ = tx.send(status);
            });
        }
        drop(tx);
        rx.iter().collect()
    })
}

/// Run the full per-node algorithm (§4.F steps 2-8) for a node this call won
/// the claim on.
fn run_claimed(ctx: &BuildContext, name: &str, required: bool) -> Status {
    let node = ctx.graph.node(name).expect("node must exist");
    let rule = node.chosen.as_ref().map(|c| (c, ctx.graph.rule(c.rule_idx)));

    // Step 2: terminal check. Only a genuine leaf — no prerequisites and no
    // chosen rule — can hit this. The synthetic root built from the command
    // line's target list also has no chosen rule, but it does have
    // prerequisites (the targets themselves), so it falls through to the
    // ordinary prereq-building logic below instead.
    if node.prereqs.is_empty() && rule.is_none() {
        let exists = node.state.lock().unwrap().exists;
        if !exists && !node.is_virtual {
            if required {
                ctx.reporter.error(&format!("don't know how to make '{name}'"));
                return Status::Failed;
            }
            debug!(name, "not required and has no rule; concluding NoOp");
        }
        return Status::NoOp;
    }

    let nonstop = rule.map_or(false, |(_, r)| r.attribs.nonstop);
    if ctx.aborting.load(Ordering::SeqCst) && !nonstop {
        trace!(name, "build aborting; skipping newly-discovered node");
        return Status::Failed;
    }

    // Step 4, first pass: a prereq only needs to be forced into existence if
    // this node is itself required and either it's virtual (always rebuilds)
    // or this node doesn't yet exist on the backing store.
    let prior_exists = node.state.lock().unwrap().exists;
    let first_pass_required = required && (node.is_virtual || !prior_exists);
    let first_results = build_prereqs(ctx, &node.prereqs, first_pass_required);
    if first_results.iter().any(|s| *s == Status::Failed) {
        if !nonstop {
            ctx.aborting.store(true, Ordering::SeqCst);
        }
        return Status::Failed;
    }

    // Step 5: timestamp evaluation. A remote probe failure (§7.6: fatal for
    // `http(s)://`, never for a plain path or `s3://`) aborts the build the
    // same way a failed prereq does.
    let stat = match ctx.world.stat(name) {
        Ok(stat) => stat,
        Err(e) => {
            ctx.reporter.error(&format!("{name}: {e}"));
            if !nonstop {
                ctx.aborting.store(true, Ordering::SeqCst);
            }
            return Status::Failed;
        }
    };
    {
        let mut st = node.state.lock().unwrap();
        st.exists = stat.exists;
        st.mtime = stat.mtime;
    }

    let mut stale = if node.is_virtual {
        true
    } else if !stat.exists && required {
        true
    } else if stat.exists || required {
        node.prereqs.iter().zip(first_results.iter()).any(|(p, status)| {
            let pn = ctx.graph.node(p).expect("prereq node must exist");
            let pst = pn.state.lock().unwrap();
            pst.mtime > stat.mtime || *status == Status::Done
        })
    } else {
        false
    };
    if ctx.config.rebuild_all || ctx.config.rebuild_targets.contains(name) {
        stale = true;
    }

    // Step 6: second pass, now that staleness is known — a prereq skipped
    // as not-required the first time may actually be needed to run the
    // recipe for real.
    if stale {
        let second_results = build_prereqs(ctx, &node.prereqs, true);
        if second_results.iter().any(|s| *s == Status::Failed) {
            if !nonstop {
                ctx.aborting.store(true, Ordering::SeqCst);
            }
            return Status::Failed;
        }
    }

    if !stale {
        return Status::NoOp;
    }

    // The synthetic root (and any other node with no chosen rule) has
    // nothing to run — its only job was to pull its prerequisites in.
    let Some((chosen, rule)) = rule else {
        return Status::Done;
    };

    if rule.recipe.is_empty() {
        return Status::Done;
    }

    if matches!(rule.attribs.comparator, crate::ruleset::Comparator::AltComparator(_)) {
        warn!(name, "rule has a 'P' (alternative comparator) attribute, which this scheduler does not consult");
    }

    run_recipe(ctx, name, chosen, rule)
}

/// Step 7: execute a stale node's recipe, honouring the exclusive-recipe and
/// subprocess-slot protocols of §5.
fn run_recipe(ctx: &BuildContext, name: &str, chosen: &crate::graph::ChosenRule, rule: &crate::ruleset::Rule) -> Status {
    let vars = recipe_vars(ctx, name, chosen, rule);
    let script = expand::expand_recipe_sigils(&rule.recipe, &vars);

    ctx.reporter.recipe(name, &script, rule.attribs.quiet);

    if ctx.config.dry_run {
        return Status::Done;
    }

    let _exclusive_guard = if rule.attribs.exclusive {
        Some(reserve_exclusive(ctx))
    } else {
        reserve_subproc(ctx);
        None
    };

    let shell = rule.shell.clone().unwrap_or_default();
    let result = ctx.world.run_recipe(&shell, &script, &vars, &ctx.config.dir);

    if _exclusive_guard.is_none() {
        release_subproc(ctx);
    }

    match result {
        Ok(true) => Status::Done,
        Ok(false) => {
            if rule.attribs.del_failed {
                let _ = std::fs::remove_file(name);
            }
            ctx.reporter.error(&format!("'{name}' failed"));
            Status::Failed
        }
        Err(e) => {
            ctx.reporter.error(&format!("'{name}': {e}"));
            Status::Failed
        }
    }
}

/// Build the recipe-local variable overlay: `target`, `stem`/`stemN` (for a
/// meta-rule match), `prereq`/`prereqN`, and `shell`, layered over the
/// ruleset's global vars (`recipe.go`'s `dorecipe`).
fn recipe_vars(ctx: &BuildContext, name: &str, chosen: &crate::graph::ChosenRule, rule: &crate::ruleset::Rule) -> Vars {
    let mut vars = ctx.graph.ruleset.vars.clone();
    vars.insert("target".to_string(), vec![name.to_string()]);

    if rule.is_meta {
        if rule.attribs.regex {
            for (i, m) in chosen.matches.iter().enumerate() {
                vars.insert(format!("stem{}", i + 1), vec![m.clone()]);
            }
        } else {
            vars.insert("stem".to_string(), vec![chosen.stem.clone()]);
        }
    }

    let node = ctx.graph.node(name).expect("node must exist");
    for (i, p) in node.prereqs.iter().enumerate() {
        vars.insert(format!("prereq{}", i + 1), vec![p.clone()]);
    }
    vars.insert("prereq".to_string(), node.prereqs.clone());

    let (head, tail) = if let Some(shell) = &rule.shell {
        (shell.first().cloned(), shell.get(1..).unwrap_or(&[]).to_vec())
    } else {
        (ctx.config.default_shell.first().cloned(), ctx.config.default_shell.get(1..).unwrap_or(&[]).to_vec())
    };
    let mut shell_var = Vec::with_capacity(1 + tail.len());
    shell_var.extend(head);
    shell_var.extend(tail);
    vars.insert("shell".to_string(), shell_var);

    vars
}

/// Block until a non-exclusive subprocess slot is free, then reserve one.
fn reserve_subproc(ctx: &BuildContext) {
    let mut running = ctx.subprocs_running.lock().unwrap();
    while *running >= ctx.config.subprocs_allowed.max(1) {
        running = ctx.subprocs_cond.wait(running).unwrap();
    }
    *running += 1;
}

fn release_subproc(ctx: &BuildContext) {
    let mut running = ctx.subprocs_running.lock().unwrap();
    *running -= 1;
    ctx.subprocs_cond.notify_all();
}

/// Acquire the exclusive lock, drain every currently-running subprocess, then
/// pin the counter at its cap for the duration so `reserve_subproc`'s own
/// "below cap" check can never hand out a slot to a concurrent recipe — this
/// is what actually keeps an `X`-attributed recipe from overlapping any
/// other, mirroring `reserveExclusiveSubproc` holding `subprocsRunning` at
/// `subprocsAllowed` until the exclusive recipe finishes.
fn reserve_exclusive<'a>(ctx: &'a BuildContext<'a>) -> ExclusiveGuard<'a> {
    let guard = ctx.exclusive.lock().unwrap();
    let mut running = ctx.subprocs_running.lock().unwrap();
    while *running > 0 {
        running = ctx.subprocs_cond.wait(running).unwrap();
    }
    *running = ctx.config.subprocs_allowed.max(1);
    drop(running);
    ExclusiveGuard { ctx, _guard: guard }
}

struct ExclusiveGuard<'a> {
    ctx: &'a BuildContext<'a>,
    _guard: std::sync::MutexGuard<'a, ()>,
}

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        *self.ctx.subprocs_running.lock().unwrap() = 0;
        self.ctx.subprocs_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::parser::{parse, Includer, ParseError};
    use crate::report::NoopReporter;
    use crate::world::{Stat, WorldError};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    struct NoIncludes;
    impl Includer for NoIncludes {
        fn run_command(&self, _c: &str, _v: &Vars) -> Result<String, ParseError> {
            Ok(String::new())
        }
        fn read_file(&self, _p: &str) -> Result<String, ParseError> {
            Ok(String::new())
        }
    }

    /// An in-memory world: files are either present (with a fixed mtime
    /// ordering given by insertion index) or absent; recipe execution is
    /// logged and always succeeds unless the target name is in `should_fail`.
    struct MockWorld {
        files: StdMutex<std::collections::HashMap<String, SystemTime>>,
        should_fail: Vec<&'static str>,
        ran: StdMutex<Vec<String>>,
    }

    impl MockWorld {
        fn new(existing: Vec<(&'static str, u64)>, should_fail: Vec<&'static str>) -> Self {
            let mut files = std::collections::HashMap::new();
            for (name, secs) in existing {
                files.insert(name.to_string(), SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs));
            }
            MockWorld {
                files: StdMutex::new(files),
                should_fail,
                ran: StdMutex::new(Vec::new()),
            }
        }
    }

    impl World for MockWorld {
        fn stat(&self, name: &str) -> Result<Stat, WorldError> {
            Ok(match self.files.lock().unwrap().get(name) {
                Some(mtime) => Stat { exists: true, mtime: *mtime },
                None => Stat::missing(),
            })
        }

        fn run_recipe(&self, _shell: &[String], _script: &str, _env: &Vars, _dir: &Path) -> Result<bool, WorldError> {
            self.ran.lock().unwrap().push(_script.to_string());
            if self.should_fail.iter().any(|f| _script.contains(f)) {
                return Ok(false);
            }
            let next_secs = self.files.lock().unwrap().len() as u64 + 100;
            self.files.lock().unwrap().insert(
                _script.split_whitespace().next_back().unwrap_or("out").to_string(),
                SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(next_secs),
            );
            Ok(true)
        }
    }

    fn base_config() -> BuildConfig {
        BuildConfig {
            dry_run: false,
            rebuild_all: false,
            rebuild_targets: HashSet::new(),
            subprocs_allowed: 4,
            default_shell: vec!["sh".to_string(), "-e".to_string()],
            dir: PathBuf::from("."),
        }
    }

    #[test]
    fn stale_target_builds_and_reaches_done() {
        let rs = std::sync::Arc::new(parse("a: b\n\ttouch a\n", "mkfile", &NoIncludes).unwrap());
        let world = MockWorld::new(vec![("b", 1)], vec![]);
        let graph = GraphBuilder::new(rs, &world, 1).build_root(&["a".to_string()]).unwrap();
        let config = base_config();
        let result = build(&graph, &world, &NoopReporter, &config);
        assert!(result.is_ok());
        assert_eq!(world.ran.lock().unwrap().len(), 1);
    }

    #[test]
    fn up_to_date_target_skips_recipe() {
        let rs = std::sync::Arc::new(parse("a: b\n\ttouch a\n", "mkfile", &NoIncludes).unwrap());
        let world = MockWorld::new(vec![("b", 1), ("a", 50)], vec![]);
        let graph = GraphBuilder::new(rs, &world, 1).build_root(&["a".to_string()]).unwrap();
        let config = base_config();
        build(&graph, &world, &NoopReporter, &config).unwrap();
        assert!(world.ran.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_recipe_propagates_as_build_failure() {
        let rs = std::sync::Arc::new(parse("a: b\n\ttouch a\n", "mkfile", &NoIncludes).unwrap());
        let world = MockWorld::new(vec![("b", 1)], vec!["touch a"]);
        let graph = GraphBuilder::new(rs, &world, 1).build_root(&["a".to_string()]).unwrap();
        let config = base_config();
        let result = build(&graph, &world, &NoopReporter, &config);
        assert!(matches!(result, Err(BuildFailure::RecipeFailed)));
    }

    #[test]
    fn rebuild_all_forces_recipe_even_when_up_to_date() {
        let rs = std::sync::Arc::new(parse("a: b\n\ttouch a\n", "mkfile", &NoIncludes).unwrap());
        let world = MockWorld::new(vec![("b", 1), ("a", 50)], vec![]);
        let graph = GraphBuilder::new(rs, &world, 1).build_root(&["a".to_string()]).unwrap();
        let mut config = base_config();
        config.rebuild_all = true;
        build(&graph, &world, &NoopReporter, &config).unwrap();
        assert_eq!(world.ran.lock().unwrap().len(), 1);
    }

    #[test]
    fn dry_run_does_not_execute_recipes() {
        let rs = std::sync::Arc::new(parse("a: b\n\ttouch a\n", "mkfile", &NoIncludes).unwrap());
        let world = MockWorld::new(vec![("b", 1)], vec![]);
        let graph = GraphBuilder::new(rs, &world, 1).build_root(&["a".to_string()]).unwrap();
        let mut config = base_config();
        config.dry_run = true;
        build(&graph, &world, &NoopReporter, &config).unwrap();
        assert!(world.ran.lock().unwrap().is_empty());
    }
}
