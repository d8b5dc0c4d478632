//! GBNF grammars for constrained sampling.
//!
//! [`Grammar::parse`] turns grammar text into rule tables; [`GrammarMatcher`]
//! tracks the set of possible pushdown stacks over the generated text and
//! answers "may this piece come next" / "may generation end here" queries for
//! the sampler.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("unexpected end of grammar text")]
    UnexpectedEof,

    #[error("unexpected character {found:?} at offset {pos}")]
    UnexpectedChar { pos: usize, found: char },

    #[error("rule {name:?} is referenced but never defined")]
    UnknownRule { name: String },

    #[error("grammar has no \"root\" rule")]
    MissingRoot,

    #[error("grammar text contains no rules")]
    Empty,
}

/// A set of character ranges, possibly negated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CharSet {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharSet {
    fn single(c: char) -> Self {
        Self {
            negated: false,
            ranges: vec![(c, c)],
        }
    }

    fn matches(&self, c: char) -> bool {
        let inside = self.ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
        inside != self.negated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sym {
    Terminal(CharSet),
    Ref(usize),
}

/// A parsed GBNF grammar: rule id -> alternates -> symbol sequence.
#[derive(Clone)]
pub struct Grammar {
    rules: Vec<Vec<Vec<Sym>>>,
    names: Vec<String>,
    root: usize,
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("rules", &self.rules.len())
            .field("root", &self.names[self.root])
            .finish()
    }
}

impl Grammar {
    /// Parse GBNF text. The grammar must define a `root` rule.
    pub fn parse(src: &str) -> Result<Self, GrammarError> {
        Parser::new(src).parse()
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    chars: Vec<char>,
    pos: usize,
    rules: Vec<Vec<Vec<Sym>>>,
    names: Vec<String>,
    defined: Vec<bool>,
    synthetic: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            rules: Vec::new(),
            names: Vec::new(),
            defined: Vec::new(),
            synthetic: 0,
        }
    }

    fn parse(mut self) -> Result<Grammar, GrammarError> {
        self.skip_space(true);
        while !self.eof() {
            let name = self.parse_ident()?;
            self.skip_space(false);
            self.expect_str("::=")?;
            self.skip_space(false);
            let id = self.rule_id(&name);
            let alts = self.parse_alternates(0)?;
            self.rules[id] = alts;
            self.defined[id] = true;
            self.skip_space(true);
        }

        if self.rules.is_empty() {
            return Err(GrammarError::Empty);
        }
        if let Some(id) = (0..self.names.len()).find(|&i| !self.defined[i]) {
            return Err(GrammarError::UnknownRule {
                name: self.names[id].clone(),
            });
        }
        let root = self
            .names
            .iter()
            .position(|n| n == "root")
            .ok_or(GrammarError::MissingRoot)?;

        Ok(Grammar {
            rules: self.rules,
            names: self.names,
            root,
        })
    }

    fn rule_id(&mut self, name: &str) -> usize {
        if let Some(id) = self.names.iter().position(|n| n == name) {
            return id;
        }
        self.names.push(name.to_owned());
        self.rules.push(Vec::new());
        self.defined.push(false);
        self.names.len() - 1
    }

    fn synthetic_rule(&mut self, alts: Vec<Vec<Sym>>) -> usize {
        self.synthetic += 1;
        let id = self.rule_id(&format!("__sub_{}", self.synthetic));
        self.rules[id] = alts;
        self.defined[id] = true;
        id
    }

    fn parse_alternates(&mut self, depth: usize) -> Result<Vec<Vec<Sym>>, GrammarError> {
        let mut alts = Vec::new();
        let mut seq: Vec<Sym> = Vec::new();

        loop {
            self.skip_inline_space();
            let Some(c) = self.peek() else {
                break;
            };
            match c {
                '\n' => {
                    if depth == 0 && self.at_rule_boundary() {
                        break;
                    }
                    self.pos += 1;
                }
                '|' => {
                    self.pos += 1;
                    alts.push(std::mem::take(&mut seq));
                }
                ')' => {
                    if depth > 0 {
                        break;
                    }
                    return Err(self.unexpected(c));
                }
                '"' => {
                    let syms = self.parse_literal()?;
                    self.apply_postfix(syms, &mut seq);
                }
                '[' => {
                    let set = self.parse_charset()?;
                    self.apply_postfix(vec![Sym::Terminal(set)], &mut seq);
                }
                '(' => {
                    self.pos += 1;
                    let inner = self.parse_alternates(depth + 1)?;
                    self.expect_char(')')?;
                    let id = self.synthetic_rule(inner);
                    self.apply_postfix(vec![Sym::Ref(id)], &mut seq);
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let name = self.parse_ident()?;
                    let id = self.rule_id(&name);
                    self.apply_postfix(vec![Sym::Ref(id)], &mut seq);
                }
                other => return Err(self.unexpected(other)),
            }
        }

        alts.push(seq);
        Ok(alts)
    }

    /// Attach a `*` / `+` / `?` operator (when present) to the symbol just
    /// parsed, then append it to the sequence. The operator binds to the whole
    /// symbol, so `"ab"*` repeats the full literal.
    fn apply_postfix(&mut self, syms: Vec<Sym>, seq: &mut Vec<Sym>) {
        let op = match self.peek() {
            Some(c @ ('*' | '+' | '?')) => {
                self.pos += 1;
                Some(c)
            }
            _ => None,
        };
        match op {
            None => seq.extend(syms),
            Some('?') => {
                let id = self.synthetic_rule(vec![syms, Vec::new()]);
                seq.push(Sym::Ref(id));
            }
            Some('*') => {
                // R ::= syms R | ε
                let id = self.synthetic_rule(Vec::new());
                let mut rec = syms;
                rec.push(Sym::Ref(id));
                self.rules[id] = vec![rec, Vec::new()];
                seq.push(Sym::Ref(id));
            }
            Some('+') => {
                // R ::= syms R | syms
                let id = self.synthetic_rule(Vec::new());
                let mut rec = syms.clone();
                rec.push(Sym::Ref(id));
                self.rules[id] = vec![rec, syms];
                seq.push(Sym::Ref(id));
            }
            Some(_) => unreachable!(),
        }
    }

    fn parse_literal(&mut self) -> Result<Vec<Sym>, GrammarError> {
        self.expect_char('"')?;
        let mut syms = Vec::new();
        loop {
            match self.next()? {
                '"' => break,
                '\\' => {
                    let c = self.parse_escape()?;
                    syms.push(Sym::Terminal(CharSet::single(c)));
                }
                c => syms.push(Sym::Terminal(CharSet::single(c))),
            }
        }
        Ok(syms)
    }

    fn parse_charset(&mut self) -> Result<CharSet, GrammarError> {
        self.expect_char('[')?;
        let negated = if self.peek() == Some('^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        loop {
            let lo = match self.next()? {
                ']' => break,
                '\\' => self.parse_escape()?,
                c => c,
            };
            // A `-` not followed by `]` makes this a range.
            if self.peek() == Some('-') && self.peek_at(1) != Some(']') {
                self.pos += 1;
                let hi = match self.next()? {
                    '\\' => self.parse_escape()?,
                    c => c,
                };
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        Ok(CharSet { negated, ranges })
    }

    fn parse_escape(&mut self) -> Result<char, GrammarError> {
        let c = self.next()?;
        Ok(match c {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'x' => self.parse_hex(2)?,
            'u' => self.parse_hex(4)?,
            other => other,
        })
    }

    fn parse_hex(&mut self, digits: usize) -> Result<char, GrammarError> {
        let mut value = 0u32;
        for _ in 0..digits {
            let c = self.next()?;
            let d = c.to_digit(16).ok_or_else(|| self.unexpected(c))?;
            value = value * 16 + d;
        }
        char::from_u32(value).ok_or(GrammarError::UnexpectedEof)
    }

    fn parse_ident(&mut self) -> Result<String, GrammarError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || (c == '-' && self.pos > start) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return match self.peek() {
                Some(c) => Err(self.unexpected(c)),
                None => Err(GrammarError::UnexpectedEof),
            };
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// At a newline at nesting depth 0: does a new `ident ::=` definition (or
    /// the end of input) follow?
    fn at_rule_boundary(&self) -> bool {
        let mut p = self.pos;
        while p < self.chars.len() {
            match self.chars[p] {
                ' ' | '\t' | '\r' | '\n' => p += 1,
                '#' => {
                    while p < self.chars.len() && self.chars[p] != '\n' {
                        p += 1;
                    }
                }
                _ => break,
            }
        }
        if p >= self.chars.len() {
            return true;
        }
        let start = p;
        while p < self.chars.len() {
            let c = self.chars[p];
            if c.is_ascii_alphanumeric() || c == '_' || (c == '-' && p > start) {
                p += 1;
            } else {
                break;
            }
        }
        if p == start {
            return false;
        }
        while p < self.chars.len() && (self.chars[p] == ' ' || self.chars[p] == '\t') {
            p += 1;
        }
        self.chars[p..].starts_with(&[':', ':', '='])
    }

    // ── low-level helpers ─────────────────────────────────────────────────────

    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn next(&mut self) -> Result<char, GrammarError> {
        let c = self.peek().ok_or(GrammarError::UnexpectedEof)?;
        self.pos += 1;
        Ok(c)
    }

    fn expect_char(&mut self, want: char) -> Result<(), GrammarError> {
        match self.next()? {
            c if c == want => Ok(()),
            c => {
                self.pos -= 1;
                Err(self.unexpected(c))
            }
        }
    }

    fn expect_str(&mut self, want: &str) -> Result<(), GrammarError> {
        for c in want.chars() {
            self.expect_char(c)?;
        }
        Ok(())
    }

    fn unexpected(&self, found: char) -> GrammarError {
        GrammarError::UnexpectedChar {
            pos: self.pos,
            found,
        }
    }

    /// Skip spaces, tabs and comments; with `newlines` also skip line breaks.
    fn skip_inline_space(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn skip_space(&mut self, newlines: bool) {
        loop {
            self.skip_inline_space();
            if newlines && self.peek() == Some('\n') {
                self.pos += 1;
            } else {
                break;
            }
        }
    }
}

// ── Matcher ───────────────────────────────────────────────────────────────────

/// Pushdown stacks are capped to keep pathological (e.g. left-recursive)
/// grammars from expanding without bound.
const MAX_EXPANSION_DEPTH: usize = 512;

type Stack = Vec<Sym>;

/// The live match state of one job's grammar over its generated text.
///
/// Holds every pushdown stack that could produce the text seen so far; a
/// character is admissible when at least one stack survives it.
#[derive(Debug, Clone)]
pub(crate) struct GrammarMatcher {
    grammar: Arc<Grammar>,
    stacks: Vec<Stack>,
}

impl GrammarMatcher {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let mut stacks = Vec::new();
        push_expanded(&grammar, vec![Sym::Ref(grammar.root)], &mut stacks, 0);
        Self { grammar, stacks }
    }

    /// Whether generation may stop here (some stack has been fully consumed).
    pub fn can_finish(&self) -> bool {
        self.stacks.iter().any(|s| s.is_empty())
    }

    /// Whether `text` is admissible as the next piece. The empty piece is
    /// trivially admissible.
    pub fn allows_text(&self, text: &str) -> bool {
        self.advanced(text).is_some()
    }

    /// Advance the match state over `text`. Returns `false` (leaving the
    /// state untouched) when the text is not admissible.
    pub fn accept_text(&mut self, text: &str) -> bool {
        match self.advanced(text) {
            Some(stacks) => {
                self.stacks = stacks;
                true
            }
            None => false,
        }
    }

    fn advanced(&self, text: &str) -> Option<Vec<Stack>> {
        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = advance_char(&self.grammar, &stacks, c);
            if stacks.is_empty() {
                return None;
            }
        }
        Some(stacks)
    }
}

fn advance_char(grammar: &Grammar, stacks: &[Stack], c: char) -> Vec<Stack> {
    let mut out = Vec::new();
    for stack in stacks {
        if let Some(Sym::Terminal(set)) = stack.last() {
            if set.matches(c) {
                let mut next = stack.clone();
                next.pop();
                push_expanded(grammar, next, &mut out, 0);
            }
        }
    }
    out
}

/// Resolve the top of `stack` down to a terminal (or empty stack), branching
/// on rule alternates, and collect the resulting stacks.
fn push_expanded(grammar: &Grammar, mut stack: Stack, out: &mut Vec<Stack>, depth: usize) {
    if depth >= MAX_EXPANSION_DEPTH {
        warn!("grammar expansion depth exceeded, dropping stack");
        return;
    }
    match stack.last() {
        None | Some(Sym::Terminal(_)) => {
            if !out.contains(&stack) {
                out.push(stack);
            }
        }
        Some(Sym::Ref(rule)) => {
            let rule = *rule;
            stack.pop();
            for alt in &grammar.rules[rule] {
                let mut next = stack.clone();
                next.extend(alt.iter().rev().cloned());
                push_expanded(grammar, next, out, depth + 1);
            }
        }
    }
}
