//! The `World` abstraction: everything the scheduler and parser need from
//! outside the process — local filesystem stats, remote timestamp probes
//! (HTTP/S3), and subprocess execution. Swappable so tests can run the whole
//! pipeline against an in-memory filesystem instead of the real one.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::SystemTime;

use tracing::{debug, instrument};

use crate::expand::{ExpandError, Vars};
use crate::parser::ParseError;

/// A target's backing-store timestamp, as seen by the scheduler's staleness
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub exists: bool,
    pub mtime: SystemTime,
}

impl Stat {
    pub fn missing() -> Stat {
        Stat {
            exists: false,
            mtime: SystemTime::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write recipe stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("failed to wait on subprocess: {0}")]
    Wait(#[source] std::io::Error),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP HEAD probe of {url} failed: {source}")]
    RemoteProbe {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
}

/// Everything the scheduler needs from the outside world: timestamp probes
/// and recipe execution. One instance is shared (behind an `Arc`) by every
/// worker thread.
pub trait World: Send + Sync {
    /// Stat a target by name: a bare path, or an `http(s)://`/`s3://` URL.
    /// Per §7.6, a failed remote probe is only non-fatal for `s3://` (which
    /// degrades to "does not exist"); an `http(s)://` probe failure is
    /// returned as an error so the caller aborts the build.
    fn stat(&self, name: &str) -> Result<Stat, WorldError>;

    /// Run a recipe's shell script. `shell` is already resolved (head +
    /// trailing args, see [`resolve_shell`]); `dir` is the working directory
    /// (from `-C`). Returns whether the subprocess exited successfully.
    fn run_recipe(
        &self,
        shell: &[String],
        script: &str,
        env: &Vars,
        dir: &Path,
    ) -> Result<bool, WorldError>;
}

/// The real implementation: talks to the local filesystem, spawns real
/// subprocesses, and issues HTTP HEAD requests for remote targets.
pub struct LocalWorld {
    pub default_shell: Vec<String>,
    pub dont_drop_args: bool,
}

impl LocalWorld {
    pub fn new(default_shell: Vec<String>, dont_drop_args: bool) -> LocalWorld {
        LocalWorld {
            default_shell,
            dont_drop_args,
        }
    }
}

impl World for LocalWorld {
    #[instrument(skip(self))]
    fn stat(&self, name: &str) -> Result<Stat, WorldError> {
        if name.starts_with("http://") || name.starts_with("https://") {
            return probe_http(name);
        }
        if let Some(rest) = name.strip_prefix("s3://") {
            return Ok(probe_s3(rest));
        }
        Ok(match std::fs::metadata(name) {
            Ok(meta) => Stat {
                exists: true,
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            },
            Err(_) => Stat::missing(),
        })
    }

    fn run_recipe(
        &self,
        shell: &[String],
        script: &str,
        env: &Vars,
        dir: &Path,
    ) -> Result<bool, WorldError> {
        let shell = if shell.is_empty() {
            &self.default_shell
        } else {
            shell
        };
        let (program, args) = resolve_shell(shell, &[], self.dont_drop_args);
        debug!(?program, ?args, "spawning recipe shell");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (name, values) in env {
            cmd.env(name, values.join("\x01"));
        }

        let mut child = cmd.spawn().map_err(WorldError::Spawn)?;
        {
            use std::io::Write;
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            stdin.write_all(script.as_bytes()).map_err(WorldError::Stdin)?;
        }
        drop(child.stdin.take());
        let status = child.wait().map_err(WorldError::Wait)?;
        Ok(status.success())
    }
}

impl LocalWorld {
    /// Run a string through `sh -c` and capture stdout, used for both
    /// backquoted command substitution and `<|` pipe-includes.
    fn capture(&self, command: &str, vars: &Vars) -> Result<String, WorldError> {
        let (program, mut args) = resolve_shell(&["sh".to_string(), "-c".to_string()], &[], false);
        args.push(command.to_string());
        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null()).stderr(Stdio::inherit());
        for (name, values) in vars {
            cmd.env(name, values.join(" "));
        }
        let output = cmd.output().map_err(WorldError::Spawn)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn read_file(&self, path: &str) -> Result<String, WorldError> {
        std::fs::read_to_string(path).map_err(|source| WorldError::Io {
            path: path.to_string(),
            source,
        })
    }
}

/// Adapts [`LocalWorld`] to the expansion engine's backtick contract.
pub struct BacktickAdapter<'a>(pub &'a LocalWorld);

impl<'a> crate::expand::BacktickRunner for BacktickAdapter<'a> {
    fn run(&self, command: &str, vars: &Vars) -> Result<String, ExpandError> {
        self.0
            .capture(command, vars)
            .map_err(|e| ExpandError::BacktickFailed(e.to_string()))
    }
}

/// Adapts [`LocalWorld`] to the parser's include contract.
pub struct IncluderAdapter<'a>(pub &'a LocalWorld);

impl<'a> crate::parser::Includer for IncluderAdapter<'a> {
    fn run_command(&self, command: &str, vars: &Vars) -> Result<String, ParseError> {
        self.0.capture(command, vars).map_err(|e| ParseError::Include {
            file: "<|".to_string(),
            message: e.to_string(),
        })
    }

    fn read_file(&self, path: &str) -> Result<String, ParseError> {
        self.0.read_file(path).map_err(|e| ParseError::Include {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Given a shell command string split into `head :: tail` and extra args `A`,
/// the spawned command is `head` with arguments `tail ++ A`. When `tail` is
/// empty, `dont_drop_args` is unset, and `A` is empty, the command runs with
/// no arguments (mirroring `sh -c` with no script given).
pub fn resolve_shell(shell: &[String], extra: &[String], dont_drop_args: bool) -> (String, Vec<String>) {
    let head = shell.first().cloned().unwrap_or_else(|| "sh".to_string());
    let tail = shell.get(1..).unwrap_or(&[]);

    if tail.is_empty() && !dont_drop_args && extra.is_empty() {
        return (head, Vec::new());
    }

    let mut args = tail.to_vec();
    args.extend(extra.iter().cloned());
    (head, args)
}

/// Parse an RFC 1123/2822 `Last-Modified` header value.
fn parse_last_modified(v: &str) -> Option<SystemTime> {
    let dt = chrono::DateTime::parse_from_rfc2822(v).ok()?;
    let secs = dt.timestamp();
    if secs >= 0 {
        Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
    } else {
        Some(SystemTime::UNIX_EPOCH - std::time::Duration::from_secs((-secs) as u64))
    }
}

/// §7.6: an HTTP probe failure is fatal, unlike `probe_s3`'s degrade-to-
/// missing — a plain HEAD request that errors (connection refused, TLS
/// failure, non-2xx status) says nothing about whether the target exists,
/// so there's no safe default to fall back to.
fn probe_http(url: &str) -> Result<Stat, WorldError> {
    match ureq::head(url).call() {
        Ok(resp) => Ok(match resp.header("Last-Modified").and_then(parse_last_modified) {
            Some(mtime) => Stat {
                exists: true,
                mtime,
            },
            None => Stat::missing(),
        }),
        Err(e) => Err(WorldError::RemoteProbe {
            url: url.to_string(),
            source: Box::new(e),
        }),
    }
}

/// Simplified, unauthenticated `HeadObject` equivalent: a plain HTTP HEAD
/// against the bucket's virtual-hosted-style endpoint. No request signing —
/// only suitable for public buckets. A probe failure is treated as "does not
/// exist" per the remote-probe error taxonomy, not a fatal error.
fn probe_s3(rest: &str) -> Stat {
    let Some((bucket, key)) = rest.split_once('/') else {
        return Stat::missing();
    };
    let url = format!("https://{bucket}.s3.amazonaws.com/{key}");
    match ureq::head(&url).call() {
        Ok(resp) => match resp.header("Last-Modified").and_then(parse_last_modified) {
            Some(mtime) => Stat {
                exists: true,
                mtime,
            },
            None => Stat::missing(),
        },
        Err(_) => Stat::missing(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_shell_drops_args_when_bare() {
        let (prog, args) = resolve_shell(&["sh".into(), "-c".into()], &[], false);
        assert_eq!(prog, "sh");
        assert_eq!(args, vec!["-c".to_string()]);
    }

    #[test]
    fn resolve_shell_with_only_head_and_no_extra_drops_args() {
        let (prog, args) = resolve_shell(&["sh".into()], &[], false);
        assert_eq!(prog, "sh");
        assert!(args.is_empty());
    }

    #[test]
    fn resolve_shell_keeps_args_when_dont_drop_set() {
        let (_, args) = resolve_shell(&["sh".into()], &[], true);
        assert!(args.is_empty()); // tail is empty regardless; dont_drop only matters with extra args
    }

    #[test]
    fn resolve_shell_appends_extra_args() {
        let (prog, args) = resolve_shell(&["sh".into(), "-e".into()], &["foo".into()], false);
        assert_eq!(prog, "sh");
        assert_eq!(args, vec!["-e".to_string(), "foo".to_string()]);
    }
}
