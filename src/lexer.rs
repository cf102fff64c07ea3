//! Mkfile lexer.
//!
//! Turns mkfile source text into a stream of [`Token`]s. The lexer is
//! line-aware: every token carries the line/column where it starts, and a
//! line that begins with a hard tab (directly after a rule header's newline)
//! is folded into a single [`TokenKind::Recipe`] token spanning all of its
//! contiguous indented continuation lines.
//!
//! Quoting, backquoting, and `${...}` forms are *not* interpreted here: they
//! are kept verbatim inside a [`TokenKind::Word`]'s text and resolved later by
//! [`crate::expand`]. The lexer only tracks enough quote/backquote nesting to
//! know where a word ends.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word(String),
    Assign,
    Colon,
    PipeInclude,
    RedirInclude,
    Newline,
    /// The de-indentation is performed by the caller (see
    /// [`strip_indentation`]); this variant carries the raw recipe text and
    /// the column of its first non-whitespace character.
    Recipe { text: String, mincol: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TokenKind::Word(w) => write!(f, "{w}"),
            TokenKind::Assign => write!(f, "="),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::PipeInclude => write!(f, "<|"),
            TokenKind::RedirInclude => write!(f, "<"),
            TokenKind::Newline => write!(f, "\\n"),
            TokenKind::Recipe { .. } => write!(f, "<recipe>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LexError {
    #[error("{}:{}: unterminated quote", .0.line, .0.col)]
    UnterminatedQuote(Pos),
    #[error("{}:{}: unterminated backquoted command", .0.line, .0.col)]
    UnterminatedBackquote(Pos),
    #[error("{}:{}: trailing backslash at end of input", .0.line, .0.col)]
    TrailingBackslash(Pos),
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    col: usize,
    /// True at the start of a physical line, used to recognize recipe blocks.
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            col: 1,
            at_line_start: true,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn current_pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
            self.at_line_start = true;
        } else {
            self.col += 1;
            self.at_line_start = false;
        }
        Some(c)
    }

    /// Skip plain (non-newline) whitespace between tokens.
    fn skip_spaces(&mut self) {
        while matches!(self.peek_char(), Some(' ') | Some('\t')) {
            self.bump();
        }
    }

    /// Line starting with a hard tab: fold in contiguous indented lines
    /// (blank lines are swallowed if indentation resumes afterwards).
    fn lex_recipe(&mut self) -> Token {
        let start = self.current_pos();
        let mincol = {
            let mut n = 0;
            while matches!(self.peek_at(n), Some(' ') | Some('\t')) {
                n += 1;
            }
            n
        };
        let mut text = String::new();

        loop {
            // consume one physical line, including its trailing newline
            while let Some(c) = self.peek_char() {
                if c == '\n' {
                    break;
                }
                text.push(c);
                self.bump();
            }
            if self.peek_char() == Some('\n') {
                text.push('\n');
                self.bump();
            } else {
                break; // EOF
            }

            // Decide whether the next line continues this recipe block.
            if self.line_is_indented() {
                continue;
            }
            if self.line_is_blank() && self.blank_then_indented() {
                continue;
            }
            break;
        }

        Token {
            kind: TokenKind::Recipe { text, mincol },
            pos: start,
        }
    }

    fn line_is_indented(&self) -> bool {
        matches!(self.peek_char(), Some(' ') | Some('\t'))
    }

    fn line_is_blank(&self) -> bool {
        matches!(self.peek_char(), Some('\n') | None)
    }

    /// Look past one blank line to see whether indentation resumes.
    fn blank_then_indented(&self) -> bool {
        let mut offset = 0;
        if self.peek_at(offset) != Some('\n') {
            return false;
        }
        offset += 1;
        matches!(self.peek_at(offset), Some(' ') | Some('\t'))
    }

    /// Scan a bare word, honoring quotes/backquotes/braces as opaque spans.
    fn lex_word(&mut self) -> Result<Token, LexError> {
        let start = self.current_pos();
        let mut text = String::new();

        loop {
            match self.peek_char() {
                None => break,
                Some(c) if c.is_whitespace() => break,
                Some(c) if matches!(c, '=' | ':') => break,
                Some('\'') => {
                    let quote_start = self.current_pos();
                    text.push(self.bump().unwrap());
                    loop {
                        match self.bump() {
                            Some('\'') => {
                                text.push('\'');
                                break;
                            }
                            Some(c) => text.push(c),
                            None => return Err(LexError::UnterminatedQuote(quote_start)),
                        }
                    }
                }
                Some('"') => {
                    let quote_start = self.current_pos();
                    text.push(self.bump().unwrap());
                    loop {
                        match self.peek_char() {
                            Some('"') => {
                                text.push(self.bump().unwrap());
                                break;
                            }
                            Some('\\') => {
                                text.push(self.bump().unwrap());
                                match self.bump() {
                                    Some(c) => text.push(c),
                                    None => return Err(LexError::UnterminatedQuote(quote_start)),
                                }
                            }
                            Some(c) => {
                                text.push(c);
                                self.bump();
                            }
                            None => return Err(LexError::UnterminatedQuote(quote_start)),
                        }
                    }
                }
                Some('`') => {
                    let bq_start = self.current_pos();
                    text.push(self.bump().unwrap());
                    loop {
                        match self.bump() {
                            Some('`') => {
                                text.push('`');
                                break;
                            }
                            Some(c) => text.push(c),
                            None => return Err(LexError::UnterminatedBackquote(bq_start)),
                        }
                    }
                }
                Some('\\') => {
                    let esc_start = self.current_pos();
                    text.push(self.bump().unwrap());
                    match self.bump() {
                        Some(c) => text.push(c),
                        None => return Err(LexError::TrailingBackslash(esc_start)),
                    }
                }
                Some('$') => {
                    text.push(self.bump().unwrap());
                    if self.peek_char() == Some('{') {
                        text.push(self.bump().unwrap());
                        loop {
                            match self.bump() {
                                Some('}') => {
                                    text.push('}');
                                    break;
                                }
                                Some(c) => text.push(c),
                                None => break, // unterminated ${..}; let expand() report verbatim
                            }
                        }
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }

        Ok(Token {
            kind: TokenKind::Word(text),
            pos: start,
        })
    }

    fn next_token(&mut self) -> Option<Result<Token, LexError>> {
        loop {
            self.skip_spaces();

            // `\` immediately followed by a newline, outside a word: a plain
            // line continuation. Swallow both and keep scanning this logical
            // line.
            if self.peek_char() == Some('\\') && self.peek_at(1) == Some('\n') {
                self.bump();
                self.bump();
                continue;
            }

            let pos = self.current_pos();
            return match self.peek_char() {
                None => None,
                Some('\n') => {
                    self.bump();
                    // A line beginning with a hard tab right after a header
                    // line starts a recipe block.
                    if self.peek_char() == Some('\t') {
                        Some(Ok(self.lex_recipe()))
                    } else {
                        Some(Ok(Token {
                            kind: TokenKind::Newline,
                            pos,
                        }))
                    }
                }
                Some('=') => {
                    self.bump();
                    Some(Ok(Token {
                        kind: TokenKind::Assign,
                        pos,
                    }))
                }
                Some(':') => {
                    self.bump();
                    Some(Ok(Token {
                        kind: TokenKind::Colon,
                        pos,
                    }))
                }
                Some('<') if self.peek_at(1) == Some('|') => {
                    self.bump();
                    self.bump();
                    Some(Ok(Token {
                        kind: TokenKind::PipeInclude,
                        pos,
                    }))
                }
                Some('<') => {
                    self.bump();
                    Some(Ok(Token {
                        kind: TokenKind::RedirInclude,
                        pos,
                    }))
                }
                Some(_) => Some(self.lex_word()),
            };
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

/// Split a string into whitespace-delimited words, honoring the same
/// quoting/escaping rules as [`Lexer::lex_word`]. Used to tokenize backquote
/// command output and shell command strings.
pub fn lex_words(s: &str) -> Result<Vec<String>, LexError> {
    let mut lexer = Lexer::new(s);
    let mut words = Vec::new();
    for tok in &mut lexer {
        match tok?.kind {
            TokenKind::Word(w) => words.push(w),
            _ => {} // punctuation/newlines are not meaningful for bare word-splitting
        }
    }
    Ok(words)
}

/// Strip up to `mincol` columns of leading whitespace (tabs and spaces count
/// equally) from every line of a recipe body.
pub fn strip_indentation(s: &str, mincol: usize) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.split_inclusive('\n') {
        let mut stripped = 0;
        let mut idx = 0;
        for c in line.chars() {
            if stripped >= mincol || !matches!(c, ' ' | '\t') {
                break;
            }
            stripped += 1;
            idx += c.len_utf8();
        }
        out.push_str(&line[idx..]);
    }
    out
}
