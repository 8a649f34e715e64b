//! Tokens and token-list helpers.
//!
//! Lines are flat `Vec<Token>` with end-of-line stripped; curly-brace
//! groups are folded into a single [`TokenKind::Grp`] token very early
//! so that everything downstream can skip over them in one step.

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where a token came from.  `parent` chains through macro expansions,
/// innermost use first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<SourceInfo>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// Control statement (`.byte`, `.macro`, ...).  `name` is the
    /// canonical lowercase spelling after alias resolution; `raw` is
    /// the spelling as written.
    Cs { name: String, raw: String },
    Op(String),
    Str(String),
    Num { value: i64, width: Option<u32> },
    /// A `{...}` group folded into one token.
    Grp(Vec<Token>),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LCurly,
    RCurly,
    Eol,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub source: Option<SourceInfo>,
}

/// `.bank` differs from ca65 and `.addr` assumes 16-bit addressing,
/// but both are close enough to alias.
pub const CS_ALIASES: &[(&str, &str)] = &[
    (".addr", ".word"),
    (".bank", ".bankbyte"),
    (".byt", ".byte"),
    (".def", ".defined"),
    (".endmac", ".endmacro"),
    (".endrep", ".endrepeat"),
    (".exitmac", ".exitmacro"),
    (".mac", ".macro"),
    (".undef", ".undefine"),
];

impl Token {
    pub fn new(kind: TokenKind) -> Token {
        Token { kind, source: None }
    }

    pub fn ident(name: impl Into<String>) -> Token {
        Token::new(TokenKind::Ident(name.into()))
    }

    /// Builds a control-statement token from a canonical name.
    pub fn cs(name: &str) -> Token {
        Token::new(TokenKind::Cs {
            name: name.to_string(),
            raw: name.to_string(),
        })
    }

    pub fn op(op: impl Into<String>) -> Token {
        Token::new(TokenKind::Op(op.into()))
    }

    pub fn num(value: i64) -> Token {
        Token::new(TokenKind::Num { value, width: None })
    }

    pub fn num_width(value: i64, width: u32) -> Token {
        Token::new(TokenKind::Num {
            value,
            width: Some(width),
        })
    }

    pub fn string(text: impl Into<String>) -> Token {
        Token::new(TokenKind::Str(text.into()))
    }

    pub fn grp(inner: Vec<Token>) -> Token {
        Token::new(TokenKind::Grp(inner))
    }

    pub fn with_source(mut self, source: Option<SourceInfo>) -> Token {
        self.source = source;
        self
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Ident(_))
    }

    pub fn ident_name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_cs(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Cs { name: n, .. } if n == name)
    }

    pub fn cs_name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Cs { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_op(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Op(o) if o == op)
    }

    pub fn op_str(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Op(o) => Some(o),
            _ => None,
        }
    }

    pub fn num_value(&self) -> Option<i64> {
        match self.kind {
            TokenKind::Num { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn str_value(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn grp_inner(&self) -> Option<&[Token]> {
        match &self.kind {
            TokenKind::Grp(inner) => Some(inner),
            _ => None,
        }
    }

    /// Register name check, case-insensitive.
    pub fn is_register(&self, reg: char) -> bool {
        matches!(self.ident_name(), Some(name)
            if name.len() == 1 && name.chars().next().unwrap().eq_ignore_ascii_case(&reg))
    }

    /// Structural equality: same kind and same payload.  Groups never
    /// compare equal; literal widths and raw spellings are ignored.
    pub fn eq_syntax(&self, other: &Token) -> bool {
        match (&self.kind, &other.kind) {
            (TokenKind::Grp(_), TokenKind::Grp(_)) => false,
            (TokenKind::Ident(a), TokenKind::Ident(b)) => a == b,
            (TokenKind::Cs { name: a, .. }, TokenKind::Cs { name: b, .. }) => a == b,
            (TokenKind::Op(a), TokenKind::Op(b)) => a == b,
            (TokenKind::Str(a), TokenKind::Str(b)) => a == b,
            (TokenKind::Num { value: a, .. }, TokenKind::Num { value: b, .. }) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    /// Pattern matching for define parameter lists: numbers and strings
    /// match by kind alone, groups match any group, everything else
    /// matches by spelling.
    pub fn matches(&self, other: &Token) -> bool {
        match (&self.kind, &other.kind) {
            (TokenKind::Num { .. }, TokenKind::Num { .. }) => true,
            (TokenKind::Str(_), TokenKind::Str(_)) => true,
            (TokenKind::Grp(_), TokenKind::Grp(_)) => true,
            _ => self.eq_syntax(other),
        }
    }

    pub fn name(&self) -> String {
        match &self.kind {
            TokenKind::Num { value, .. } => format!("NUM[${value:x}]"),
            TokenKind::Str(s) => format!("STR[${s}]"),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::Grp(_) | TokenKind::LCurly => "{".to_string(),
            TokenKind::RCurly => "}".to_string(),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::Eol => "EOL".to_string(),
            TokenKind::Eof => "EOF".to_string(),
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Cs { raw, .. } => raw.to_uppercase(),
            TokenKind::Op(op) => op.to_uppercase(),
        }
    }

    pub fn at(&self) -> String {
        at(self.source.as_ref())
    }

    pub fn name_at(&self) -> String {
        format!("{}{}", self.name(), self.at())
    }
}

/// Renders a source location as `\n  at file:line:column`, recursing
/// through macro-expansion parents.
pub fn at(source: Option<&SourceInfo>) -> String {
    let mut out = String::new();
    let mut cur = source;
    while let Some(s) = cur {
        out.push_str(&format!("\n  at {}:{}:{}", s.file, s.line, s.column));
        cur = s.parent.as_deref();
    }
    out
}

pub fn name_at(token: Option<&Token>) -> String {
    match token {
        Some(t) => t.name_at(),
        None => "at unknown".to_string(),
    }
}

pub fn expect_eol(token: Option<&Token>, what: &str) -> Result<()> {
    match token {
        Some(t) => Err(Error::Syntax(format!("Expected {what}: {}", t.name_at()))),
        None => Ok(()),
    }
}

/// Requires `token` to be syntactically equal to `want`.
pub fn expect(want: &Token, token: Option<&Token>, prev: Option<&Token>) -> Result<()> {
    match token {
        Some(t) if want.eq_syntax(t) => Ok(()),
        Some(t) => Err(Error::Syntax(format!(
            "Expected {}: {}",
            want.name(),
            t.name_at()
        ))),
        None => Err(match prev {
            Some(p) => Error::Syntax(format!("Expected {} after {}", want.name(), p.name_at())),
            None => Error::Syntax(format!("Expected {}", want.name())),
        }),
    }
}

pub fn expect_identifier(token: Option<&Token>, prev: Option<&Token>) -> Result<String> {
    expect_string_token(token, prev, "identifier", Token::ident_name)
}

pub fn expect_string(token: Option<&Token>, prev: Option<&Token>) -> Result<String> {
    expect_string_token(token, prev, "constant string", Token::str_value)
}

fn expect_string_token(
    token: Option<&Token>,
    prev: Option<&Token>,
    what: &str,
    get: impl Fn(&Token) -> Option<&str>,
) -> Result<String> {
    let Some(token) = token else {
        return Err(match prev {
            Some(prev) => Error::Syntax(format!("Expected {what} after {}", prev.name_at())),
            None => Error::Syntax(format!("Expected {what}")),
        });
    };
    match get(token) {
        Some(s) => Ok(s.to_string()),
        None => Err(Error::Syntax(format!(
            "Expected {what}: {}",
            token.name_at()
        ))),
    }
}

/// Extracts the identifiers from a comma-separated list.
pub fn idents_from_clist(list: &[Token]) -> Result<Vec<String>> {
    if list.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match list.get(i).map(|t| (t, t.ident_name())) {
            Some((_, Some(name))) => out.push(name.to_string()),
            Some((t, None)) => {
                return Err(Error::Syntax(format!(
                    "Expected identifier: {}",
                    t.name_at()
                )))
            }
            None => {
                let last = &list[list.len() - 1];
                return Err(Error::Syntax(format!(
                    "Expected identifier after {}",
                    last.name_at()
                )));
            }
        }
        match list.get(i + 1) {
            None => return Ok(out),
            Some(t) if t.is_op(",") => {}
            Some(t) => return Err(Error::Syntax(format!("Expected comma: {}", t.name_at()))),
        }
        i += 2;
    }
}

/// Finds the index of the paren or bracket balancing `tokens[i]`.
/// Only the same kind of grouping token counts toward the depth.
pub fn find_balanced(tokens: &[Token], i: usize) -> Option<usize> {
    let (open, close) = match tokens[i].kind {
        TokenKind::LParen => (TokenKind::LParen, TokenKind::RParen),
        TokenKind::LBracket => (TokenKind::LBracket, TokenKind::RBracket),
        _ => return None,
    };
    let mut depth = 1usize;
    for (j, t) in tokens.iter().enumerate().skip(i + 1) {
        if t.kind == open {
            depth += 1;
        } else if t.kind == close {
            depth -= 1;
            if depth == 0 {
                return Some(j);
            }
        }
    }
    None
}

/// Splits `tokens[start..end]` on commas not enclosed in parens.
/// Brackets and groups are opaque here; an empty range yields a single
/// empty argument.
pub fn parse_arg_list(tokens: &[Token], start: usize, end: usize) -> Result<Vec<Vec<Token>>> {
    let mut args = vec![Vec::new()];
    let mut parens = 0u32;
    for token in &tokens[start..end] {
        if parens == 0 && token.is_op(",") {
            args.push(Vec::new());
            continue;
        }
        match token.kind {
            TokenKind::LParen => parens += 1,
            TokenKind::RParen => {
                parens = parens.checked_sub(1).ok_or_else(|| {
                    Error::Syntax(format!("Unbalanced paren{}", token.at()))
                })?;
            }
            _ => {}
        }
        args.last_mut().unwrap().push(token.clone());
    }
    Ok(args)
}

/// Parses a `:key value... :key value...` attribute list starting at
/// `start`, as used by `.segment`.
pub fn parse_attr_list(tokens: &[Token], start: usize) -> Result<IndexMap<String, Vec<Token>>> {
    let mut out = IndexMap::new();
    if start >= tokens.len() {
        return Ok(out);
    }
    if !tokens[start].is_op(":") {
        return Err(Error::Syntax(format!(
            "Unexpected: {}",
            tokens[start].name_at()
        )));
    }
    let mut key: Option<String> = None;
    let mut val = Vec::new();
    for token in &tokens[start + 1..] {
        if token.is_op(":") {
            let k = key.take().ok_or_else(|| {
                Error::Syntax(format!("Missing key{}", token.at()))
            })?;
            out.insert(k, std::mem::take(&mut val));
        } else if key.is_none() {
            key = Some(expect_identifier(Some(token), None)?);
        } else {
            val.push(token.clone());
        }
    }
    match key {
        Some(k) => {
            out.insert(k, val);
        }
        None => {
            expect_identifier(None, tokens.last())?;
        }
    }
    Ok(out)
}

/// Finds the next top-level comma, or the end of the list.  Groups are
/// single tokens by now, so a comma inside braces does not count.
pub fn find_comma(tokens: &[Token], start: usize) -> usize {
    tokens
        .iter()
        .skip(start)
        .position(|t| t.is_op(","))
        .map(|i| start + i)
        .unwrap_or(tokens.len())
}

/// Token count with groups weighted as braces plus contents.
pub fn count(tokens: &[Token]) -> usize {
    tokens
        .iter()
        .map(|t| match &t.kind {
            TokenKind::Grp(inner) => 2 + count(inner),
            _ => 1,
        })
        .sum()
}

/// Re-renders tokens as source-ish text for diagnostics.
pub fn format(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| match &t.kind {
            TokenKind::Grp(inner) => format!("{{ {} }}", format(inner)),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::LCurly => "{".to_string(),
            TokenKind::LParen => "(".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::RCurly => "}".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::Eol => ".eol".to_string(),
            TokenKind::Eof => "EOF".to_string(),
            TokenKind::Num { value, .. } => {
                if *value < 256 {
                    format!("${value:02x}")
                } else {
                    format!("${value:04x}")
                }
            }
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Op(s) => s.clone(),
            TokenKind::Cs { name, .. } => name.clone(),
            TokenKind::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_syntax_compares_payloads() {
        assert!(Token::op(",").eq_syntax(&Token::op(",")));
        assert!(!Token::op(",").eq_syntax(&Token::op(":")));
        assert!(Token::num(3).eq_syntax(&Token::num(3)));
        assert!(!Token::num(3).eq_syntax(&Token::num(4)));
        assert!(!Token::grp(vec![]).eq_syntax(&Token::grp(vec![])));
        assert!(!Token::ident("x").eq_syntax(&Token::op("x")));
    }

    #[test]
    fn matches_ignores_literal_values() {
        assert!(Token::num(3).matches(&Token::num(99)));
        assert!(Token::string("a").matches(&Token::string("b")));
        assert!(Token::grp(vec![Token::num(1)]).matches(&Token::grp(vec![])));
        assert!(!Token::ident("a").matches(&Token::ident("b")));
    }

    #[test]
    fn clist_parses_and_rejects() {
        let list = vec![
            Token::ident("a"),
            Token::op(","),
            Token::ident("b"),
        ];
        assert_eq!(idents_from_clist(&list).unwrap(), vec!["a", "b"]);
        assert!(idents_from_clist(&[]).unwrap().is_empty());

        let trailing = vec![Token::ident("a"), Token::op(",")];
        let err = idents_from_clist(&trailing).unwrap_err();
        assert!(err.to_string().contains("Expected identifier after"));

        let bad_sep = vec![Token::ident("a"), Token::op(":"), Token::ident("b")];
        let err = idents_from_clist(&bad_sep).unwrap_err();
        assert!(err.to_string().contains("Expected comma"));
    }

    #[test]
    fn balanced_search_ignores_other_brackets() {
        let toks = vec![
            Token::new(TokenKind::LParen),
            Token::new(TokenKind::LBracket),
            Token::new(TokenKind::RParen),
            Token::new(TokenKind::RBracket),
        ];
        // The bracket does not contribute to paren depth.
        assert_eq!(find_balanced(&toks, 0), Some(2));
    }

    #[test]
    fn arg_list_splits_at_depth_zero() {
        let toks = vec![
            Token::num(1),
            Token::op(","),
            Token::new(TokenKind::LParen),
            Token::num(2),
            Token::op(","),
            Token::num(3),
            Token::new(TokenKind::RParen),
            Token::op(","),
            Token::num(4),
        ];
        let args = parse_arg_list(&toks, 0, toks.len()).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].len(), 1);
        assert_eq!(args[1].len(), 5);
        assert_eq!(args[2].len(), 1);
        // An empty range is one empty argument, not zero arguments.
        assert_eq!(parse_arg_list(&toks, 0, 0).unwrap().len(), 1);
    }

    #[test]
    fn counts_groups_as_braces_plus_inner() {
        let toks = vec![
            Token::num(1),
            Token::grp(vec![Token::num(2), Token::num(3)]),
        ];
        assert_eq!(count(&toks), 5);
    }

    #[test]
    fn attr_list_keys_and_values() {
        let toks = vec![
            Token::string("code"),
            Token::op(":"),
            Token::ident("bank"),
            Token::num(1),
            Token::op(":"),
            Token::ident("size"),
            Token::num(0x4000),
        ];
        let attrs = parse_attr_list(&toks, 1).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["bank"].len(), 1);
        assert_eq!(attrs["size"][0].num_value(), Some(0x4000));
    }

    #[test]
    fn source_chain_renders_innermost_first() {
        let parent = SourceInfo {
            file: "macros.s".into(),
            line: 4,
            column: 0,
            parent: None,
        };
        let child = SourceInfo {
            file: "input.s".into(),
            line: 1,
            column: 2,
            parent: Some(Box::new(parent)),
        };
        assert_eq!(
            at(Some(&child)),
            "\n  at input.s:1:2\n  at macros.s:4:0"
        );
    }
}
