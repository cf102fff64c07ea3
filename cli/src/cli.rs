use std::path::PathBuf;

/// Command-line surface (§6): flags map almost one-to-one onto the original
/// tool's getopt-style options.
#[derive(Debug, clap::Parser)]
#[clap(name = "mk", version, author)]
pub struct Args {
    /// Targets to build; if none are given, the first non-meta rule's
    /// targets are used
    pub targets: Vec<String>,

    /// Change to DIR before doing anything else
    #[clap(short = 'C', value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Read FILE instead of `mkfile`
    #[clap(short = 'f', value_name = "FILE")]
    pub mkfile: Option<PathBuf>,

    /// Dry run: print recipes, do not execute them
    #[clap(short = 'n')]
    pub dry_run: bool,

    /// Rebuild only the listed targets, treating them as out of date
    #[clap(short = 'r')]
    pub rebuild: bool,

    /// Rebuild all targets unconditionally
    #[clap(short = 'a')]
    pub rebuild_all: bool,

    /// Maximum number of recipes to run in parallel (default: host CPU count)
    #[clap(short = 'p', value_name = "N")]
    pub jobs: Option<usize>,

    /// Maximum number of times any one rule may be applied while resolving a
    /// single target (default: 1)
    #[clap(short = 'l', value_name = "N")]
    pub max_rule_cnt: Option<usize>,

    /// Print each recipe and ask for confirmation before running it
    #[clap(short = 'i')]
    pub interactive: bool,

    /// Quiet: do not print recipes before running them
    #[clap(short = 'q')]
    pub quiet: bool,

    /// Force colour on/off (default: on iff stdout is a terminal)
    #[clap(long = "color", value_name = "yes|no")]
    pub color: Option<String>,

    /// Default shell used to run recipes (default: `sh -e`)
    #[clap(long = "shell", value_name = "CMD")]
    pub shell: Option<String>,

    /// Do not drop shell arguments when no further arguments are present
    #[clap(short = 'F')]
    pub dont_drop_args: bool,
}
