//! User-facing output: recipe echoing, error/success/info messages. Kept
//! separate from `tracing` diagnostics (§11 of SPEC_FULL.md) — this is the
//! the output a user runs `mk` to see, not developer-facing logs.

use std::io::Write;
use std::sync::Mutex;

use console::{Style, Term};

/// Everything the scheduler needs to talk to the user. Implementations must
/// be safe to call from multiple build threads; a `Reporter` is expected to
/// serialise its own output internally (mirroring `mkMsgMutex` guarding every
/// `mkPrint*` call in the original).
pub trait Reporter: Send + Sync {
    /// Echo a recipe before running it (or in place of running it, for `-n`).
    fn recipe(&self, target: &str, body: &str, quiet: bool);
    /// A fatal or recipe-failure error.
    fn error(&self, msg: &str);
    /// An informational message (e.g. nothing-to-mk, interactive prompt).
    fn info(&self, msg: &str);
    /// A success message.
    fn success(&self, msg: &str);
}

/// Console reporter: colour when `color` is set, plain text otherwise.
/// Mirrors `mk.go`'s `mkPrintRecipe`/`mkPrintError`/`mkPrintMessage` and
/// `recipe.go`'s `printIndented`.
pub struct ConsoleReporter {
    color: bool,
    out: Mutex<Term>,
}

impl ConsoleReporter {
    pub fn new(color: bool) -> ConsoleReporter {
        ConsoleReporter {
            color,
            out: Mutex::new(Term::stdout()),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn recipe(&self, target: &str, body: &str, quiet: bool) {
        let mut out = self.out.lock().unwrap();
        let header = if self.color {
            format!("{} → ", Style::new().blue().bold().underlined().apply_to(target))
        } else {
            format!("{target}: ")
        };
        let _ = write!(out, "{header}");
        if quiet {
            let _ = writeln!(out, "{}", if self.color { "…" } else { "..." });
            return;
        }
        print_indented(&mut *out, body, header_width(target));
        if body.is_empty() {
            let _ = writeln!(out);
        }
    }

    fn error(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        let text = if self.color {
            Style::new().red().apply_to(format!("error: {msg}")).to_string()
        } else {
            format!("error: {msg}")
        };
        eprintln!("{text}");
    }

    fn info(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        if self.color {
            println!("{}", Style::new().blue().apply_to(msg));
        } else {
            println!("{msg}");
        }
    }

    fn success(&self, msg: &str) {
        let _guard = self.out.lock().unwrap();
        if self.color {
            println!("{}", Style::new().green().apply_to(msg));
        } else {
            println!("{msg}");
        }
    }
}

/// Width of a recipe's "target → " (or "target: ") header, used to align
/// continuation lines of a multi-line recipe body under it.
fn header_width(target: &str) -> usize {
    target.chars().count() + 3
}

/// Indent every line after the first by `indent` spaces, so a multi-line
/// recipe body lines up under its `target: ` header.
fn print_indented(out: &mut impl Write, body: &str, indent: usize) {
    let pad = " ".repeat(indent);
    for (i, line) in body.split_inclusive('\n').enumerate() {
        if i > 0 {
            let _ = write!(out, "{pad}");
        }
        let _ = write!(out, "{line}");
    }
}

/// Discards all output. Used for `-q` combined with tests and any context
/// that wants a silent build.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn recipe(&self, _target: &str, _body: &str, _quiet: bool) {}
    fn error(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn success(&self, _msg: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_indented_aligns_continuation_lines() {
        let mut buf = Vec::new();
        print_indented(&mut buf, "a\nb\nc", 4);
        assert_eq!(String::from_utf8(buf).unwrap(), "a\n    b\n    c");
    }

    #[test]
    fn header_width_accounts_for_arrow_padding() {
        assert_eq!(header_width("a.out"), 8);
    }
}
