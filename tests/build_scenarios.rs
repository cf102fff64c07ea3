//! Integration tests driving the full parse → graph → scheduler pipeline
//! against a real temporary directory, covering the concrete scenarios of
//! §8 and a handful of cross-cutting properties that don't fit neatly into
//! any one module's unit tests.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use test_log::test;

use mk::expand::Vars;
use mk::graph::GraphBuilder;
use mk::parser::{parse, Includer, ParseError};
use mk::report::NoopReporter;
use mk::ruleset::RuleSet;
use mk::scheduler::{self, BuildConfig};
use mk::world::{IncluderAdapter, LocalWorld};

struct NoIncludes;
impl Includer for NoIncludes {
    fn run_command(&self, _command: &str, _vars: &Vars) -> Result<String, ParseError> {
        Ok(String::new())
    }
    fn read_file(&self, _path: &str) -> Result<String, ParseError> {
        Ok(String::new())
    }
}

fn run(dir: &std::path::Path, mkfile: &str, targets: &[&str], config: BuildConfig) -> Result<(), String> {
    let rs: Arc<RuleSet> = Arc::new(parse(mkfile, "mkfile", &NoIncludes).map_err(|e| e.to_string())?);
    let world = LocalWorld::new(vec!["sh".to_string(), "-e".to_string()], false);
    let targets: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
    let graph = GraphBuilder::new(rs, &world, 1)
        .build_root(&targets)
        .map_err(|e| e.to_string())?;
    let mut cfg = config;
    cfg.dir = dir.to_path_buf();
    scheduler::build(&graph, &world, &NoopReporter, &cfg).map_err(|e| e.to_string())
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

/// S6: `a` is rebuilt when stale, skipped once fresh, and rebuilt again
/// under `-a` even though nothing changed.
#[test]
fn s6_rebuild_then_noop_then_rebuild_all() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b"), "b").unwrap();
    let mkfile = "a: b\n\techo hi > a\n";

    run(dir.path(), mkfile, &["a"], base_config()).unwrap();
    assert!(dir.path().join("a").exists());
    let first_mtime = fs::metadata(dir.path().join("a")).unwrap().modified().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    run(dir.path(), mkfile, &["a"], base_config()).unwrap();
    let second_mtime = fs::metadata(dir.path().join("a")).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime, "up-to-date target must not be rewritten");

    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut cfg = base_config();
    cfg.rebuild_all = true;
    run(dir.path(), mkfile, &["a"], cfg).unwrap();
    let third_mtime = fs::metadata(dir.path().join("a")).unwrap().modified().unwrap();
    assert!(third_mtime > second_mtime, "-a must force a rebuild even when up to date");
}

/// A target with no rule and no backing file is a fatal, not silent, error.
#[test]
fn missing_rule_for_required_target_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let result = run(dir.path(), "a: b\n\techo hi\n", &["a"], base_config());
    assert!(result.is_err());
}

/// A virtual target always runs its recipe, even with no prerequisites and
/// no backing file.
#[test]
fn virtual_target_always_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let mkfile = "all:V:\n\ttouch done\n";
    run(dir.path(), mkfile, &["all"], base_config()).unwrap();
    assert!(dir.path().join("done").exists());

    fs::remove_file(dir.path().join("done")).unwrap();
    run(dir.path(), mkfile, &["all"], base_config()).unwrap();
    assert!(dir.path().join("done").exists(), "virtual targets rebuild unconditionally");
}

/// A suffix meta-rule applies at most `maxRuleCnt` times while resolving a
/// single target chain (`a.o` <- `a.c`, with no rule for `.c` itself, so the
/// chain terminates at the existing leaf).
#[test]
fn suffix_meta_rule_resolves_to_existing_leaf() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.c"), "int main(){}").unwrap();
    let mkfile = "%.o:%.c\n\ttouch $target\n";
    run(dir.path(), mkfile, &["a.o"], base_config()).unwrap();
    assert!(dir.path().join("a.o").exists());
}

/// `-n` (dry run) never touches the filesystem.
#[test]
fn dry_run_leaves_filesystem_untouched() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b"), "b").unwrap();
    let mut cfg = base_config();
    cfg.dry_run = true;
    run(dir.path(), "a: b\n\ttouch a\n", &["a"], cfg).unwrap();
    assert!(!dir.path().join("a").exists());
}

/// `-r` treats only the listed target as forced-stale; an unlisted sibling
/// that is already up to date is left alone.
#[test]
fn rebuild_flag_only_forces_listed_targets() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b"), "b").unwrap();
    let mkfile = "a: b\n\techo hi > a\nc: b\n\techo hi > c\n";
    run(dir.path(), mkfile, &["a", "c"], base_config()).unwrap();
    let c_mtime = fs::metadata(dir.path().join("c")).unwrap().modified().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut cfg = base_config();
    cfg.rebuild_targets.insert("a".to_string());
    run(dir.path(), mkfile, &["a", "c"], cfg).unwrap();

    let a_mtime_after = fs::metadata(dir.path().join("a")).unwrap().modified().unwrap();
    let c_mtime_after = fs::metadata(dir.path().join("c")).unwrap().modified().unwrap();
    assert_eq!(c_mtime, c_mtime_after, "c was not listed in -r and must stay untouched");
    assert!(a_mtime_after > c_mtime, "a was forced stale by -r and must have rebuilt");
}

/// Parsing wires a real `IncluderAdapter`-backed `<` include end to end.
#[test]
fn redir_include_pulls_in_rules_from_another_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("included.mk"), "a: b\n\techo hi > a\n").unwrap();
    fs::write(dir.path().join("b"), "b").unwrap();
    let world = LocalWorld::new(vec!["sh".to_string(), "-e".to_string()], false);
    let mkfile = format!("< {}\n", dir.path().join("included.mk").display());
    let rs = parse(&mkfile, "mkfile", &IncluderAdapter(&world)).unwrap();
    assert!(rs.target_index.contains_key("a"));
}
