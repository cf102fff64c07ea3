//! The mkfile parser: drives the lexer's token stream through the grammar
//! sketched in the external-interfaces section — assignments, rules,
//! includes — building up a [`RuleSet`].
//!
//! Targets, prerequisites, and assignment right-hand sides are run through
//! [`expand::expand`] with backticks allowed (via [`IncluderBacktick`]) as
//! each line is parsed; a `%` in a prerequisite template is left untouched
//! (`expand` never interprets it) for later stem substitution at graph-build
//! time.

use std::iter::Peekable;

use crate::expand::{self, Vars};
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use crate::ruleset::{AttribSet, Comparator, Pattern, Rule, RuleSet};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{file}:{line}: syntax error: expected {expected}, found {found}")]
    UnexpectedToken {
        file: String,
        line: usize,
        expected: String,
        found: String,
    },
    #[error("{file}:{line}: unknown attribute letter '{ch}'")]
    UnknownAttribute { file: String, line: usize, ch: char },
    #[error("{file}:{line}: 'P' and 'S' attributes are mutually exclusive")]
    ConflictingComparator { file: String, line: usize },
    #[error("{file}:{line}: invalid regex target pattern '{pattern}': {source}")]
    BadRegex {
        file: String,
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{file}:{line}: {source}")]
    Lex {
        file: String,
        line: usize,
        #[source]
        source: LexError,
    },
    #[error("{file}:{line}: expansion failed: {source}")]
    Expand {
        file: String,
        line: usize,
        #[source]
        source: expand::ExpandError,
    },
    #[error("{file}: include failed: {message}")]
    Include { file: String, message: String },
}

/// Executes `<|` pipe-includes and reads `<` redirect-includes. Implemented
/// by [`crate::world::LocalWorld`]; tests may supply a stub.
pub trait Includer {
    fn run_command(&self, command: &str, vars: &Vars) -> Result<String, ParseError>;
    fn read_file(&self, path: &str) -> Result<String, ParseError>;
}

/// Adapts an [`Includer`] to [`expand::BacktickRunner`] so target/prerequisite
/// and assignment expansion can run backquoted commands through the same
/// shell-capture path includes use (`allowBackticks=true` at parse time).
struct IncluderBacktick<'a>(&'a dyn Includer);

impl<'a> expand::BacktickRunner for IncluderBacktick<'a> {
    fn run(&self, command: &str, vars: &Vars) -> Result<String, expand::ExpandError> {
        self.0
            .run_command(command, vars)
            .map_err(|e| expand::ExpandError::BacktickFailed(e.to_string()))
    }
}

/// Parse `source` (attributed to `file` for error messages) into a fresh
/// [`RuleSet`].
pub fn parse(source: &str, file: &str, includer: &dyn Includer) -> Result<RuleSet, ParseError> {
    let mut rs = RuleSet::new();
    parse_into(&mut rs, source, file, includer)?;
    Ok(rs)
}

/// Parse `source` into an existing [`RuleSet`] — used both for the top-level
/// mkfile and for includes, which share the accumulating rule set and
/// variable map.
pub fn parse_into(
    rs: &mut RuleSet,
    source: &str,
    file: &str,
    includer: &dyn Includer,
) -> Result<(), ParseError> {
    let mut toks = Toks::new(source, file);

    loop {
        toks.skip_blank_lines()?;
        let Some(kind) = toks.peek_kind()? else { break };

        match kind {
            TokenKind::PipeInclude => {
                toks.bump()?;
                let words = toks.collect_words()?;
                toks.expect_newline_or_eof()?;
                let joined = words.join(" ");
                let expanded = expand_one_line(&joined, &rs.vars, &toks, includer)?;
                let output = includer.run_command(&expanded, &rs.vars)?;
                parse_into(rs, &output, &format!("<|{expanded}"), includer)?;
            }
            TokenKind::RedirInclude => {
                toks.bump()?;
                let words = toks.collect_words()?;
                toks.expect_newline_or_eof()?;
                let joined = words.join(" ");
                let path = expand_one_line(&joined, &rs.vars, &toks, includer)?;
                let content = includer.read_file(&path)?;
                parse_into(rs, &content, &path, includer)?;
            }
            TokenKind::Word(_) => parse_assignment_or_rule(rs, &mut toks, includer)?,
            other => {
                return Err(toks.unexpected(&format!("{other:?}"), "assignment, rule, or include"));
            }
        }
    }

    Ok(())
}

fn expand_one_line(text: &str, vars: &Vars, toks: &Toks, includer: &dyn Includer) -> Result<String, ParseError> {
    let backtick = IncluderBacktick(includer);
    let parts = expand::expand(text, vars, Some(&backtick)).map_err(|source| ParseError::Expand {
        file: toks.file.clone(),
        line: toks.line,
        source,
    })?;
    Ok(parts.join(" "))
}

fn parse_assignment_or_rule(
    rs: &mut RuleSet,
    toks: &mut Toks,
    includer: &dyn Includer,
) -> Result<(), ParseError> {
    let backtick = IncluderBacktick(includer);
    let first = toks.expect_word("a variable name or target")?;

    if toks.peek_is(&TokenKind::Assign)? {
        toks.bump()?;
        let rhs_words = toks.collect_words()?;
        toks.expect_newline_or_eof()?;
        let mut values = Vec::new();
        for w in &rhs_words {
            values.extend(
                expand::expand(w, &rs.vars, Some(&backtick)).map_err(|source| ParseError::Expand {
                    file: toks.file.clone(),
                    line: toks.line,
                    source,
                })?,
            );
        }
        rs.execute_assignment(first, values);
        return Ok(());
    }

    // Target list: `first` plus any further bare words up to the colon.
    let mut target_words = vec![first];
    target_words.extend(toks.collect_words()?);
    toks.expect(&TokenKind::Colon, ":")?;

    let segment1 = toks.collect_words()?;
    let (attr_words, prereq_words) = if toks.peek_is(&TokenKind::Colon)? {
        toks.bump()?;
        let prereqs = toks.collect_words()?;
        (segment1, prereqs)
    } else {
        (Vec::new(), segment1)
    };

    let line = toks.line;
    let mut attribs = AttribSet::default();
    if !attr_words.is_empty() {
        parse_attribs(&attr_words, &mut attribs, toks)?;
    }

    toks.expect_newline_or_eof()?;
    let recipe = toks.collect_recipe()?;

    let mut target_names = Vec::new();
    for w in &target_words {
        target_names.extend(
            expand::expand(w, &rs.vars, Some(&backtick)).map_err(|source| ParseError::Expand {
                file: toks.file.clone(),
                line,
                source,
            })?,
        );
    }

    let mut prereqs = Vec::new();
    for w in &prereq_words {
        prereqs.extend(
            expand::expand(w, &rs.vars, Some(&backtick)).map_err(|source| ParseError::Expand {
                file: toks.file.clone(),
                line,
                source,
            })?,
        );
    }

    let mut targets = Vec::with_capacity(target_names.len());
    for name in target_names {
        if attribs.regex {
            targets.push(Pattern::regex(&name).map_err(|source| ParseError::BadRegex {
                file: toks.file.clone(),
                line,
                pattern: name.clone(),
                source,
            })?);
        } else if unescaped_percent(&name) {
            targets.push(Pattern::suffix(&name));
        } else {
            targets.push(Pattern::literal(name));
        }
    }

    if targets.is_empty() {
        return Err(ParseError::UnexpectedToken {
            file: toks.file.clone(),
            line,
            expected: "at least one target".into(),
            found: "none".into(),
        });
    }

    let mut rule = Rule::new(targets, line);
    rule.attribs = attribs;
    rule.finalize_meta_flag();
    rule.prereqs = prereqs;
    rule.recipe = recipe.unwrap_or_default();
    if let Comparator::AltShell(ref s) = rule.attribs.comparator {
        rule.shell = Some(s.clone());
    }
    if let Comparator::AltComparator(ref s) = rule.attribs.comparator {
        rule.command = Some(s.clone());
    }

    rs.add(rule);
    Ok(())
}

fn unescaped_percent(s: &str) -> bool {
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == '%' {
            return true;
        }
    }
    false
}

/// `known letters set flags; P and S consume the remainder of the word plus
/// whitespace-adjacent words up to the closing ':' as their argument list`.
fn parse_attribs(words: &[String], attribs: &mut AttribSet, toks: &Toks) -> Result<(), ParseError> {
    let first = &words[0];
    let rest = &words[1..];

    let mut chars = first.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == 'P' || c == 'S' {
            let remainder = &first[idx + c.len_utf8()..];
            let mut args = Vec::new();
            if !remainder.is_empty() {
                args.push(remainder.to_string());
            }
            args.extend(rest.iter().cloned());

            let conflicts = matches!(
                (c, &attribs.comparator),
                ('P', Comparator::AltShell(_)) | ('S', Comparator::AltComparator(_))
            );
            if conflicts {
                return Err(ParseError::ConflictingComparator {
                    file: toks.file.clone(),
                    line: toks.line,
                });
            }
            attribs.comparator = if c == 'P' {
                Comparator::AltComparator(args)
            } else {
                Comparator::AltShell(args)
            };
            return Ok(());
        } else if !attribs.set_flag(c) {
            return Err(ParseError::UnknownAttribute {
                file: toks.file.clone(),
                line: toks.line,
                ch: c,
            });
        }
    }

    if !rest.is_empty() {
        return Err(ParseError::UnexpectedToken {
            file: toks.file.clone(),
            line: toks.line,
            expected: "':' (no 'P'/'S' argument expected)".into(),
            found: rest[0].clone(),
        });
    }
    Ok(())
}

/// Thin cursor over the lexer's token stream: buffers one token of lookahead
/// and tracks the line of the last token consumed, for error messages.
struct Toks<'a> {
    inner: Peekable<Lexer<'a>>,
    file: String,
    line: usize,
}

impl<'a> Toks<'a> {
    fn new(source: &'a str, file: &str) -> Self {
        Toks {
            inner: Lexer::new(source).peekable(),
            file: file.to_string(),
            line: 1,
        }
    }

    /// Clones the next token's kind out so callers never hold a borrow of
    /// `self` across a later `bump()`.
    fn peek_kind(&mut self) -> Result<Option<TokenKind>, ParseError> {
        match self.inner.peek() {
            Some(Ok(tok)) => Ok(Some(tok.kind.clone())),
            Some(Err(_)) => {
                // Force the real error out through `bump`.
                self.bump()?;
                unreachable!("bump() propagates the lex error before returning")
            }
            None => Ok(None),
        }
    }

    fn peek_is(&mut self, kind: &TokenKind) -> Result<bool, ParseError> {
        Ok(self.peek_kind()?.is_some_and(|k| &k == kind))
    }

    fn bump(&mut self) -> Result<Option<Token>, ParseError> {
        match self.inner.next() {
            Some(Ok(tok)) => {
                self.line = tok.pos.line;
                Ok(Some(tok))
            }
            Some(Err(source)) => Err(ParseError::Lex {
                file: self.file.clone(),
                line: self.line,
                source,
            }),
            None => Ok(None),
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParseError> {
        match self.bump()? {
            Some(tok) if &tok.kind == kind => Ok(tok),
            Some(tok) => Err(self.unexpected_tok(&tok, expected)),
            None => Err(ParseError::UnexpectedToken {
                file: self.file.clone(),
                line: self.line,
                expected: expected.into(),
                found: "end of input".into(),
            }),
        }
    }

    fn expect_word(&mut self, expected: &str) -> Result<String, ParseError> {
        match self.bump()? {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) => Ok(w),
            Some(tok) => Err(self.unexpected_tok(&tok, expected)),
            None => Err(ParseError::UnexpectedToken {
                file: self.file.clone(),
                line: self.line,
                expected: expected.into(),
                found: "end of input".into(),
            }),
        }
    }

    fn expect_newline_or_eof(&mut self) -> Result<(), ParseError> {
        match self.peek_kind()? {
            None => Ok(()),
            Some(TokenKind::Newline) => {
                self.bump()?;
                Ok(())
            }
            Some(_) => {
                let tok = self.bump()?.expect("peek_kind just returned Some");
                Err(self.unexpected_tok(&tok, "end of line"))
            }
        }
    }

    /// Consume bare `Word` tokens while they're next in the stream.
    fn collect_words(&mut self) -> Result<Vec<String>, ParseError> {
        let mut words = Vec::new();
        while matches!(self.peek_kind()?, Some(TokenKind::Word(_))) {
            let Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) = self.bump()?
            else {
                unreachable!("just peeked a Word token")
            };
            words.push(w);
        }
        Ok(words)
    }

    /// If a `Recipe` token is next, consume it and return its de-indented
    /// text; otherwise the rule has no recipe.
    fn collect_recipe(&mut self) -> Result<Option<String>, ParseError> {
        if !matches!(self.peek_kind()?, Some(TokenKind::Recipe { .. })) {
            return Ok(None);
        }
        let Some(Token {
            kind: TokenKind::Recipe { text, mincol },
            ..
        }) = self.bump()?
        else {
            unreachable!("just peeked a Recipe token")
        };
        Ok(Some(crate::lexer::strip_indentation(&text, mincol)))
    }

    /// Skip any run of blank `Newline` tokens between statements.
    fn skip_blank_lines(&mut self) -> Result<(), ParseError> {
        while self.peek_is(&TokenKind::Newline)? {
            self.bump()?;
        }
        Ok(())
    }

    fn unexpected(&self, found: &str, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            file: self.file.clone(),
            line: self.line,
            expected: expected.into(),
            found: found.into(),
        }
    }

    fn unexpected_tok(&self, tok: &Token, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            file: self.file.clone(),
            line: tok.pos.line,
            expected: expected.into(),
            found: tok.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoIncludes;
    impl Includer for NoIncludes {
        fn run_command(&self, _command: &str, _vars: &Vars) -> Result<String, ParseError> {
            Ok(String::new())
        }
        fn read_file(&self, _path: &str) -> Result<String, ParseError> {
            Ok(String::new())
        }
    }

    fn parse_ok(src: &str) -> RuleSet {
        parse(src, "mkfile", &NoIncludes).expect("parse should succeed")
    }

    #[test]
    fn parses_assignment() {
        let rs = parse_ok("CC=gcc\n");
        assert_eq!(rs.vars["CC"], vec!["gcc".to_string()]);
    }

    #[test]
    fn assignment_overrides_previous_value() {
        let rs = parse_ok("CC=gcc\nCC=clang\n");
        assert_eq!(rs.vars["CC"], vec!["clang".to_string()]);
    }

    #[test]
    fn parses_simple_rule_with_recipe() {
        let rs = parse_ok("a: b\n\techo hi\n");
        assert_eq!(rs.rules.len(), 1);
        let rule = &rs.rules[0];
        assert_eq!(rule.targets[0].source(), "a");
        assert_eq!(rule.prereqs, vec!["b".to_string()]);
        assert_eq!(rule.recipe, "echo hi\n");
        assert!(!rule.is_meta);
    }

    #[test]
    fn suffix_target_is_meta() {
        let rs = parse_ok("%.o: %.c\n\tcc -c $prereq\n");
        assert!(rs.rules[0].is_meta);
    }

    #[test]
    fn s7_alternative_shell_attribute() {
        let rs = parse_ok("somefile.txt:Scmp -s: a.csv\n\techo $target\n");
        let rule = &rs.rules[0];
        assert_eq!(rule.shell, Some(vec!["cmp".to_string(), "-s".to_string()]));
        assert_eq!(rule.attribs, AttribSet {
            comparator: Comparator::AltShell(vec!["cmp".into(), "-s".into()]),
            ..Default::default()
        });
    }

    #[test]
    fn every_attribute_letter_sets_its_flag() {
        for c in "DENnQRUVX".chars() {
            let src = format!("t:{c}: p\n\tc\n");
            let rs = parse_ok(&src);
            let a = &rs.rules[0].attribs;
            let expected = {
                let mut e = AttribSet::default();
                e.set_flag(c);
                e
            };
            assert_eq!(*a, expected, "attribute {c}");
        }
    }

    #[test]
    fn unknown_attribute_letter_is_an_error() {
        let err = parse("t:Z: p\n\tc\n", "mkfile", &NoIncludes).unwrap_err();
        assert!(matches!(err, ParseError::UnknownAttribute { .. }));
    }

    #[test]
    fn multiple_targets_share_one_rule() {
        let rs = parse_ok("a b: c\n\techo $target\n");
        assert_eq!(rs.rules[0].targets.len(), 2);
    }

    #[test]
    fn missing_colon_is_a_syntax_error() {
        let err = parse("a b c\n", "mkfile", &NoIncludes).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { .. }));
    }
}
