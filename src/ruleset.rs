//! The rule/target model: patterns, attributes, rules, and the set that
//! accumulates them while a mkfile (and its includes) are parsed.

use indexmap::IndexMap;
use regex::Regex;

use crate::expand::Vars;

/// A target name template.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    /// A suffix pattern `L%R`, compiled to `^L(.*)R$`.
    Suffix { source: String, re: Regex },
    /// A full regular expression, used when the owning rule has the `regex`
    /// attribute.
    Regex { source: String, re: Regex },
}

impl Pattern {
    pub fn source(&self) -> &str {
        match self {
            Pattern::Literal(s) => s,
            Pattern::Suffix { source, .. } => source,
            Pattern::Regex { source, .. } => source,
        }
    }

    /// A literal string with no `%` and no `regex` attribute in play.
    pub fn literal(s: impl Into<String>) -> Pattern {
        Pattern::Literal(s.into())
    }

    /// Compile a suffix pattern `L%R` (exactly one unescaped `%`) into `^L(.*)R$`.
    pub fn suffix(s: &str) -> Pattern {
        let idx = s.find('%').expect("suffix pattern must contain '%'");
        let (l, r) = (&s[..idx], &s[idx + 1..]);
        let re = Regex::new(&format!("^{}(.*){}$", regex::escape(l), regex::escape(r)))
            .expect("suffix pattern always compiles: both halves are regex-escaped");
        Pattern::Suffix {
            source: s.to_string(),
            re,
        }
    }

    pub fn regex(s: &str) -> Result<Pattern, regex::Error> {
        let anchored = if s.starts_with('^') {
            s.to_string()
        } else {
            format!("^{s}")
        };
        let anchored = if anchored.ends_with('$') {
            anchored
        } else {
            format!("{anchored}$")
        };
        let re = Regex::new(&anchored)?;
        Ok(Pattern::Regex {
            source: s.to_string(),
            re,
        })
    }

    /// Does this pattern contain a `%` (making the owning rule a meta-rule)?
    pub fn has_percent(&self) -> bool {
        matches!(self, Pattern::Suffix { .. })
    }

    /// Try to match `name`, returning the captures (stem as group 0 for a
    /// suffix pattern, every capture group for a regex pattern). Literal
    /// patterns match only exact equality and return no captures.
    pub fn matches<'t>(&self, name: &'t str) -> Option<Vec<&'t str>> {
        match self {
            Pattern::Literal(s) => (s == name).then(Vec::new),
            Pattern::Suffix { re, .. } | Pattern::Regex { re, .. } => {
                let caps = re.captures(name)?;
                Some(
                    caps.iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str()).unwrap_or(""))
                        .collect(),
                )
            }
        }
    }
}

/// An alternative up-to-date comparator (`P`) or shell (`S`) attribute
/// argument. The two are mutually exclusive on a single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparator {
    None,
    AltComparator(Vec<String>),
    AltShell(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttribSet {
    pub del_failed: bool,
    pub nonstop: bool,
    pub forced_timestamp: bool,
    pub nonvirtual: bool,
    pub quiet: bool,
    pub regex: bool,
    pub update: bool,
    pub virtual_: bool,
    pub exclusive: bool,
    pub comparator: Comparator,
}

impl AttribSet {
    /// Set the flag for one attribute letter. Returns `false` for an unknown
    /// letter (caller reports a parse error).
    pub fn set_flag(&mut self, c: char) -> bool {
        match c {
            'D' => self.del_failed = true,
            'E' => self.nonstop = true,
            'N' => self.forced_timestamp = true,
            'n' => self.nonvirtual = true,
            'Q' => self.quiet = true,
            'R' => self.regex = true,
            'U' => self.update = true,
            'V' => self.virtual_ = true,
            'X' => self.exclusive = true,
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub targets: Vec<Pattern>,
    pub attribs: AttribSet,
    /// Raw (unexpanded) prerequisite words; `%`/stem substitution and
    /// variable expansion happen when a concrete node is built from this
    /// rule, not here.
    pub prereqs: Vec<String>,
    pub recipe: String,
    /// Alternative shell from an `S` attribute, already word-split.
    pub shell: Option<Vec<String>>,
    /// Alternative comparator command from a `P` attribute, already
    /// word-split. Parsed but, per the up-to-date comparator open question,
    /// not consulted by the scheduler's staleness test.
    pub command: Option<Vec<String>>,
    pub is_meta: bool,
    pub line: usize,
}

impl Rule {
    pub fn new(targets: Vec<Pattern>, line: usize) -> Rule {
        let is_meta = targets.iter().any(Pattern::has_percent);
        Rule {
            targets,
            attribs: AttribSet::default(),
            prereqs: Vec::new(),
            recipe: String::new(),
            shell: None,
            command: None,
            is_meta,
            line,
        }
    }

    /// Recompute `is_meta` after the `regex` attribute may have been set
    /// (a rule with literal-looking targets but `R` set is still a meta-rule).
    pub fn finalize_meta_flag(&mut self) {
        if self.attribs.regex {
            self.is_meta = true;
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleSet {
    pub vars: Vars,
    pub rules: Vec<Rule>,
    /// Literal target name -> indices into `rules`, for O(1) lookup. Meta
    /// rules (pattern/regex targets) are not indexed here and require a
    /// linear scan in declaration order.
    pub target_index: IndexMap<String, Vec<usize>>,
}

impl RuleSet {
    pub fn new() -> RuleSet {
        RuleSet::default()
    }

    /// Append a rule, indexing its literal targets.
    pub fn add(&mut self, rule: Rule) {
        let idx = self.rules.len();
        for t in &rule.targets {
            if let Pattern::Literal(name) = t {
                self.target_index.entry(name.clone()).or_default().push(idx);
            }
        }
        self.rules.push(rule);
    }

    /// `name = value...`: assignment always supersedes whatever was there
    /// (including anything seeded from the process environment).
    pub fn execute_assignment(&mut self, name: String, values: Vec<String>) {
        self.vars.insert(name, values);
    }

    /// Meta-rules in declaration order, for the graph builder's backtracking
    /// scan.
    pub fn meta_rules(&self) -> impl Iterator<Item = (usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_meta)
    }

    /// The first rule whose targets are all literal (non-meta), used as the
    /// CLI's default-target fallback when none are given on the command line.
    pub fn first_nonmeta_rule(&self) -> Option<&Rule> {
        self.rules.iter().find(|r| !r.is_meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_pattern_captures_stem() {
        let p = Pattern::suffix("%.o");
        assert_eq!(p.matches("foo.o"), Some(vec!["foo"]));
        assert_eq!(p.matches("foo.c"), None);
    }

    #[test]
    fn literal_pattern_is_exact() {
        let p = Pattern::literal("a.out");
        assert_eq!(p.matches("a.out"), Some(vec![]));
        assert_eq!(p.matches("b.out"), None);
    }

    #[test]
    fn regex_pattern_captures_groups() {
        let p = Pattern::regex(r"(.*)\.tar\.(gz|bz2)").unwrap();
        assert_eq!(p.matches("x.tar.gz"), Some(vec!["x", "gz"]));
    }

    #[test]
    fn target_index_tracks_literal_rules_only() {
        let mut rs = RuleSet::new();
        rs.add(Rule::new(vec![Pattern::literal("a")], 1));
        rs.add(Rule::new(vec![Pattern::suffix("%.o")], 2));
        assert_eq!(rs.target_index.get("a"), Some(&vec![0]));
        assert_eq!(rs.meta_rules().count(), 1);
    }

    #[test]
    fn attribute_flags_set_independently() {
        let mut a = AttribSet::default();
        for c in "DENnQRUVX".chars() {
            assert!(a.set_flag(c), "{c} should be a known attribute letter");
        }
        assert!(a.del_failed && a.nonstop && a.forced_timestamp && a.nonvirtual);
        assert!(a.quiet && a.regex && a.update && a.virtual_ && a.exclusive);
        assert!(!AttribSet::default().set_flag('Z'));
    }

    #[test]
    fn assignment_supersedes_existing_value() {
        let mut rs = RuleSet::new();
        rs.vars.insert("CC".into(), vec!["cc".into()]);
        rs.execute_assignment("CC".into(), vec!["gcc".into()]);
        assert_eq!(rs.vars["CC"], vec!["gcc".to_string()]);
    }
}
