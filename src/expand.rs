//! Variable expansion: quoting, escapes, `${...}` forms, name-list
//! substitution, and backquoted command substitution.
//!
//! Variables are ordered multi-valued word lists (an assignment's right-hand
//! side, after expansion, is the list of words it expanded to) rather than
//! plain strings; every operation here preserves that shape until a caller
//! explicitly flattens it (`expand_recipe_sigils` is the one place that does).

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

/// Variables are ordered, multi-valued word lists, keyed by name.
pub type Vars = IndexMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("backquoted command failed: {0}")]
    BacktickFailed(String),
    #[error("failed to spawn shell for backquoted command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes the contents of a backquoted `` `...` `` span and returns its
/// captured stdout. Implemented by [`crate::world::LocalWorld`]; tests may
/// supply a stub.
pub trait BacktickRunner {
    fn run(&self, command: &str, vars: &Vars) -> Result<String, ExpandError>;
}

/// Top-level word expansion. Returns one or more words: a variable reference
/// embedded in a word may split that word into several (see
/// [`expand_sigil`]'s doc for the splitting rule).
///
/// `backticks`: when `Some`, `` `cmd` `` spans are executed and their output
/// re-tokenized into words. When `None`, backquote spans are preserved
/// verbatim (this is also what happens for quotes/escapes that don't parse
/// cleanly — see SPEC_FULL.md §13 for the rationale).
pub fn expand(
    input: &str,
    vars: &Vars,
    backticks: Option<&dyn BacktickRunner>,
) -> Result<Vec<String>, ExpandError> {
    let mut parts = Vec::new();
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let Some(relj) = input[i..].find(['"', '\'', '`', '$', '\\']) else {
            expanded.push_str(&input[i..]);
            break;
        };
        let j = i + relj;
        expanded.push_str(&input[i..j]);
        let c = input[j..].chars().next().unwrap();
        let mut k = j + c.len_utf8();

        match c {
            '\\' => {
                let (out, off) = expand_escape(&input[k..]);
                expanded.push_str(&out);
                k += off;
            }
            '"' => {
                let (out, off) = expand_double_quoted(&input[k..], vars, backticks)?;
                expanded.push_str(&out);
                k += off;
            }
            '\'' => {
                let (out, off) = expand_single_quoted(&input[k..]);
                expanded.push_str(&out);
                k += off;
            }
            '`' => {
                if let Some(runner) = backticks {
                    let (outparts, off) = expand_back_quoted(&input[k..], vars, runner)?;
                    merge_multi(&mut parts, &mut expanded, outparts);
                    k += off;
                } else {
                    // Preserve verbatim: keep the backtick, resume right after it.
                    expanded.push('`');
                }
            }
            '$' => {
                let (outparts, off) = expand_sigil(&input[k..], vars);
                merge_multi(&mut parts, &mut expanded, outparts);
                k += off;
            }
            _ => unreachable!("find() only matches the listed sigils"),
        }

        i = k;
    }

    if !expanded.is_empty() {
        parts.push(expanded);
    }

    Ok(parts)
}

/// Splice a (possibly multi-valued) expansion into the word being built:
/// prefix attaches to the first value, suffix (everything accumulated so far
/// in the *next* iteration) attaches to the last.
fn merge_multi(parts: &mut Vec<String>, expanded: &mut String, outparts: Vec<String>) {
    if outparts.is_empty() {
        return;
    }
    let mut outparts = outparts;
    let last = outparts.pop().unwrap();
    if outparts.is_empty() {
        expanded.push_str(&last);
    } else {
        outparts[0] = format!("{expanded}{}", outparts[0]);
        parts.append(&mut outparts);
        *expanded = last;
    }
}

/// `$`-only expansion: quotes are inert, backquotes never execute.
pub fn expand_sigils(input: &str, vars: &Vars) -> Vec<String> {
    let mut parts = Vec::new();
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let Some(relj) = input[i..].find('$') else {
            expanded.push_str(&input[i..]);
            break;
        };
        expanded.push_str(&input[i..i + relj]);
        i += relj + 1;
        let (ex, k) = expand_sigil(&input[i..], vars);
        merge_multi(&mut parts, &mut expanded, ex);
        i += k;
    }

    if !expanded.is_empty() {
        parts.push(expanded);
    }
    parts
}

/// Recipe-time expansion: flattens everything to a single string, joining
/// multi-valued expansions with a single space. Quotes are inert; `\$` is a
/// literal `$`, other backslashes are preserved.
pub fn expand_recipe_sigils(input: &str, vars: &Vars) -> String {
    let mut expanded = String::new();
    let mut i = 0;

    while i < input.len() {
        let Some(relj) = input[i..].find(['$', '\\']) else {
            expanded.push_str(&input[i..]);
            break;
        };
        expanded.push_str(&input[i..i + relj]);
        i += relj;
        let c = input[i..].chars().next().unwrap();
        let w = c.len_utf8();
        if c == '$' {
            i += w;
            let (ex, k) = expand_sigil(&input[i..], vars);
            expanded.push_str(&ex.join(" "));
            i += k;
        } else {
            i += w;
            match input[i..].chars().next() {
                Some('$') => {
                    expanded.push('$');
                    i += 1;
                }
                Some(c2) => {
                    expanded.push('\\');
                    expanded.push(c2);
                    i += c2.len_utf8();
                }
                None => expanded.push('\\'),
            }
        }
    }

    expanded
}

/// Replace unescaped `%` with `stem`; `\%` becomes a literal `%`.
pub fn expand_suffixes(input: &str, stem: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'%') => {
                chars.next();
                out.push('%');
            }
            '\\' => out.push('\\'),
            '%' => out.push_str(stem),
            c => out.push(c),
        }
    }
    out
}

fn expand_escape(input: &str) -> (String, usize) {
    match input.chars().next() {
        Some(c @ (' ' | '\t')) => (c.to_string(), c.len_utf8()),
        Some('\n') => (String::new(), 1),
        Some(c) => (format!("\\{c}"), c.len_utf8()),
        None => (String::new(), 0),
    }
}

fn expand_single_quoted(input: &str) -> (String, usize) {
    match input.find('\'') {
        Some(j) => (input[..j].to_string(), j + 1),
        None => (input.to_string(), input.len()),
    }
}

fn expand_double_quoted(
    input: &str,
    vars: &Vars,
    backticks: Option<&dyn BacktickRunner>,
) -> Result<(String, usize), ExpandError> {
    let mut i = 0;
    loop {
        let Some(relj) = input[i..].find(['"', '\\']) else {
            return Ok((input.to_string(), input.len()));
        };
        let j = i + relj;
        let c = input[j..].chars().next().unwrap();
        i = j + c.len_utf8();

        if c == '"' {
            let parts = expand(&input[..j], vars, backticks)?;
            return Ok((parts.join(" "), i));
        }

        // c == '\\': skip the escaped character without interpreting it.
        match input[i..].chars().next() {
            Some(c2) => i += c2.len_utf8(),
            None => return Ok((input.to_string(), input.len())),
        }
    }
}

fn expand_back_quoted(
    input: &str,
    vars: &Vars,
    runner: &dyn BacktickRunner,
) -> Result<(Vec<String>, usize), ExpandError> {
    let Some(j) = input.find('`') else {
        return Ok((vec![input.to_string()], input.len()));
    };
    let output = runner.run(&input[..j], vars)?;
    let words = crate::lexer::lex_words(&output)
        .map_err(|e| ExpandError::BacktickFailed(e.to_string()))?;
    Ok((words, j + 1))
}

static NAMELIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([^:]+)\s*:\s*([^%]*)%([^=]*)\s*=\s*([^%]*)%([^%]*)\s*$").unwrap()
});

/// Expand something starting right after a `$`. Returns the expanded word
/// list and the number of bytes of `input` consumed.
///
/// A reference that yields `k` values splits the surrounding word: `k == 1`
/// stays a single word; `k > 1` produces `k` words, with the text before the
/// reference glued to the first and the text after glued to the last.
fn expand_sigil(input: &str, vars: &Vars) -> (Vec<String>, usize) {
    let Some(c) = input.chars().next() else {
        return (Vec::new(), 0);
    };
    let w = c.len_utf8();

    if c == '$' {
        return (vec!["$".to_string()], 2);
    }

    let (varname, offset) = if c == '{' {
        match input[w..].find('}') {
            Some(relj) => {
                let body = &input[w..w + relj];
                let offset = w + relj + 1;
                if let Some(values) = try_namelist(body, vars) {
                    return (values, offset);
                }
                (body.to_string(), offset)
            }
            None => return (vec![format!("${input}")], input.len()),
        }
    } else {
        let mut end = 0;
        for (idx, ch) in input.char_indices() {
            let ok = ch.is_ascii_alphabetic() || ch == '_' || (idx > 0 && ch.is_ascii_digit());
            if !ok {
                break;
            }
            end = idx + ch.len_utf8();
        }
        if end == 0 {
            return (vec![format!("${input}")], input.len());
        }
        (input[..end].to_string(), end)
    };

    if is_valid_var_name(&varname) {
        if let Some(values) = vars.get(&varname) {
            return (values.clone(), offset);
        }
        if let Ok(val) = std::env::var(&varname) {
            return (vec![val], offset);
        }
        return (vec![format!("${}", &input[..offset])], offset);
    }

    (vec![format!("${input}")], input.len())
}

/// Try the `${name:A%B=C%D}` name-list substitution form. Returns `None` if
/// `body` doesn't match the pattern (the caller then treats it as a plain
/// `${name}` reference).
fn try_namelist(body: &str, vars: &Vars) -> Option<Vec<String>> {
    let caps = NAMELIST_PATTERN.captures(body)?;
    let name = caps.get(1).unwrap().as_str();
    if !is_valid_var_name(name.trim()) {
        return None;
    }
    let name = name.trim();
    let a = caps.get(2).unwrap().as_str();
    let b = caps.get(3).unwrap().as_str();
    let c_part = caps.get(4).unwrap().as_str();
    let d = caps.get(5).unwrap().as_str();

    let values = vars.get(name)?;
    let pat = Regex::new(&format!("^{}(.*){}$", regex::escape(a), regex::escape(b))).ok()?;

    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if let Some(m) = pat.captures(value) {
            let stem = &m[1];
            let replacement = format!("{c_part}{stem}{d}");
            let expanded = expand(&replacement, vars, None)
                .expect("expand() without a backtick runner cannot fail");
            out.extend(expanded);
        } else {
            out.push(value.clone());
        }
    }
    Some(out)
}

fn is_valid_var_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
