use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mk::graph::GraphBuilder;
use mk::parser;
use mk::report::{ConsoleReporter, Reporter};
use mk::ruleset::RuleSet;
use mk::scheduler::{self, BuildConfig};
use mk::world::{IncluderAdapter, LocalWorld};

mod cli;

use cli::Args;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    std::process::exit(run(Args::parse()));
}

fn run(args: Args) -> i32 {
    if let Some(dir) = &args.chdir {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("mk: cannot chdir to {}: {e}", dir.display());
            return 1;
        }
    }

    let mkfile_path = args.mkfile.clone().unwrap_or_else(|| PathBuf::from("mkfile"));
    let source = match std::fs::read_to_string(&mkfile_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mk: cannot read {}: {e}", mkfile_path.display());
            return 1;
        }
    };

    let default_shell = match &args.shell {
        Some(s) => shlex::split(s).unwrap_or_else(|| vec![s.clone()]),
        None => vec!["sh".to_string(), "-e".to_string()],
    };
    let world = LocalWorld::new(default_shell.clone(), args.dont_drop_args);

    let mut rs = RuleSet::new();
    for (name, value) in std::env::vars() {
        rs.vars.insert(name, vec![value]);
    }
    let file_name = mkfile_path.display().to_string();
    if let Err(e) = parser::parse_into(&mut rs, &source, &file_name, &IncluderAdapter(&world)) {
        eprintln!("mk: {e}");
        return 1;
    }
    if args.quiet {
        for rule in &mut rs.rules {
            rule.attribs.quiet = true;
        }
    }

    let targets = if !args.targets.is_empty() {
        args.targets.clone()
    } else {
        match rs.first_nonmeta_rule() {
            Some(rule) => rule
                .targets
                .iter()
                .map(|p| p.source().to_string())
                .collect(),
            None => {
                println!("mk: nothing to mk");
                return 0;
            }
        }
    };

    let rebuild_targets: HashSet<String> = if args.rebuild {
        targets.iter().cloned().collect()
    } else {
        HashSet::new()
    };

    let max_rule_cnt = args.max_rule_cnt.unwrap_or(1);
    let jobs = args.jobs.unwrap_or_else(num_cpus::get);
    let dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let color = match args.color.as_deref() {
        Some("yes") => true,
        Some("no") => false,
        _ => console::Term::stdout().is_term(),
    };
    let reporter = ConsoleReporter::new(color);

    let ruleset = Arc::new(rs);
    let mut config = BuildConfig {
        dry_run: args.dry_run,
        rebuild_all: args.rebuild_all,
        rebuild_targets,
        subprocs_allowed: jobs.max(1),
        default_shell,
        dir,
    };

    if args.interactive {
        config.dry_run = true;
        let preview_graph = match GraphBuilder::new(ruleset.clone(), &world, max_rule_cnt).build_root(&targets) {
            Ok(g) => g,
            Err(e) => {
                eprintln!("mk: {e}");
                return 1;
            }
        };
        if scheduler::build(&preview_graph, &world, &reporter, &config).is_err() {
            return 1;
        }
        print!("Proceed? ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() || !answer.trim().eq_ignore_ascii_case("y") {
            return 0;
        }
        config.dry_run = args.dry_run;
    }

    let graph = match GraphBuilder::new(ruleset, &world, max_rule_cnt).build_root(&targets) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("mk: {e}");
            return 1;
        }
    };

    match scheduler::build(&graph, &world, &reporter, &config) {
        Ok(()) => 0,
        Err(e) => {
            reporter.error(&e.to_string());
            1
        }
    }
}
