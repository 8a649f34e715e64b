//! Source text scanner.
//!
//! Produces one logical line of tokens at a time.  `\` at end of line
//! continues the line, `;` starts a comment, and `{...}` groups are
//! folded into single group tokens before the line is returned.

use crate::token::{SourceInfo, Token, TokenKind, CS_ALIASES};
use crate::{Error, Result};

pub struct Tokenizer {
    file: String,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    /// Most recent lexeme, quoted in error messages.
    last: String,
}

impl Tokenizer {
    pub fn new(text: &str, file: &str) -> Tokenizer {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        Tokenizer {
            file: file.to_string(),
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 0,
            last: String::new(),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Returns the next non-empty line with curly groups folded, or
    /// `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<Vec<Token>>> {
        let mut tok = self.token()?;
        while matches!(tok.kind, TokenKind::Eol) {
            tok = self.token()?;
        }
        let mut stack: Vec<Vec<Token>> = vec![Vec::new()];
        let mut opens: Vec<Token> = Vec::new();
        while !matches!(tok.kind, TokenKind::Eol | TokenKind::Eof) {
            match tok.kind {
                TokenKind::LCurly => {
                    opens.push(tok);
                    stack.push(Vec::new());
                }
                TokenKind::RCurly => {
                    if opens.is_empty() {
                        return Err(Error::Syntax(format!(
                            "Missing open curly: {}",
                            tok.name_at()
                        )));
                    }
                    let inner = stack.pop().unwrap();
                    let open = opens.pop().unwrap();
                    stack.last_mut().unwrap().push(Token {
                        kind: TokenKind::Grp(inner),
                        source: open.source,
                    });
                }
                _ => stack.last_mut().unwrap().push(tok),
            }
            tok = self.token()?;
        }
        if let Some(open) = opens.pop() {
            return Err(Error::Syntax(format!(
                "Missing close curly: {}",
                open.name_at()
            )));
        }
        let line = stack.pop().unwrap();
        Ok(if line.is_empty() { None } else { Some(line) })
    }

    fn token(&mut self) -> Result<Token> {
        self.skip_space();
        if self.pos >= self.chars.len() {
            return Ok(Token::new(TokenKind::Eof));
        }
        let source = SourceInfo {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            parent: None,
        };
        match self.token_inner() {
            Ok(kind) => Ok(Token {
                kind,
                source: Some(source),
            }),
            Err(Error::Syntax(msg)) => {
                let near = if self.last.is_empty() {
                    String::new()
                } else {
                    format!(" near '{}'", self.last)
                };
                Err(Error::Syntax(format!(
                    "{msg}\n  at {}:{}:{}{near}",
                    source.file, source.line, source.column
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn skip_space(&mut self) {
        loop {
            match self.peek(0) {
                Some(' ' | '\t') => self.advance(1),
                Some(';') => {
                    while !matches!(self.peek(0), None | Some('\n')) {
                        self.advance(1);
                    }
                }
                Some('\\') if self.peek(1) == Some('\n') => self.advance(2),
                _ => return,
            }
        }
    }

    fn token_inner(&mut self) -> Result<TokenKind> {
        let c = self.peek(0).unwrap();
        match c {
            '\n' => {
                self.advance(1);
                Ok(TokenKind::Eol)
            }
            '@' => {
                let start = self.pos;
                while self.peek(0) == Some('@') {
                    self.advance(1);
                }
                self.eat_word_chars();
                Ok(TokenKind::Ident(self.lexeme(start)))
            }
            _ if is_word_start(c) => {
                let start = self.pos;
                self.eat_word_chars();
                self.eat_scoped_words();
                Ok(TokenKind::Ident(self.lexeme(start)))
            }
            ':' if self.peek(1) == Some(':') && self.peek(2).is_some_and(is_word_start) => {
                let start = self.pos;
                self.advance(2);
                self.eat_word_chars();
                self.eat_scoped_words();
                Ok(TokenKind::Ident(self.lexeme(start)))
            }
            '.' if self.peek(1).is_some_and(|c| c.is_ascii_alphabetic()) => {
                let start = self.pos;
                self.advance(2);
                while self.peek(0).is_some_and(|c| c.is_ascii_alphanumeric()) {
                    self.advance(1);
                }
                let raw = self.lexeme(start);
                let lower = raw.to_lowercase();
                let name = CS_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == lower)
                    .map(|(_, canon)| canon.to_string())
                    .unwrap_or(lower);
                Ok(TokenKind::Cs { name, raw })
            }
            ':' => {
                if let Some(ident) = self.try_anon_ref() {
                    return Ok(TokenKind::Ident(ident));
                }
                self.advance(1);
                self.last = ":".to_string();
                Ok(TokenKind::Op(":".to_string()))
            }
            '+' | '-' => {
                // A run of the same sign is one operator; a mixed run
                // splits at the first change.
                let start = self.pos;
                while self.peek(0) == Some(c) {
                    self.advance(1);
                }
                Ok(TokenKind::Op(self.lexeme(start)))
            }
            '&' | '|' => {
                let start = self.pos;
                self.advance(1);
                if self.peek(0) == Some(c) {
                    self.advance(1);
                }
                Ok(TokenKind::Op(self.lexeme(start)))
            }
            '<' => {
                let start = self.pos;
                self.advance(1);
                if matches!(self.peek(0), Some('<' | '=' | '>')) {
                    self.advance(1);
                }
                Ok(TokenKind::Op(self.lexeme(start)))
            }
            '>' => {
                let start = self.pos;
                self.advance(1);
                if matches!(self.peek(0), Some('>' | '=')) {
                    self.advance(1);
                }
                Ok(TokenKind::Op(self.lexeme(start)))
            }
            '#' | '*' | '/' | ',' | '=' | '~' | '!' | '^' => {
                self.advance(1);
                self.last = c.to_string();
                Ok(TokenKind::Op(c.to_string()))
            }
            '(' => self.bracket(TokenKind::LParen),
            ')' => self.bracket(TokenKind::RParen),
            '[' => self.bracket(TokenKind::LBracket),
            ']' => self.bracket(TokenKind::RBracket),
            '{' => self.bracket(TokenKind::LCurly),
            '}' => self.bracket(TokenKind::RCurly),
            '"' | '\'' => self.scan_str(c),
            '$' | '%' | '0'..='9' => self.scan_num(),
            _ => Err(Error::Syntax("Syntax error".to_string())),
        }
    }

    fn bracket(&mut self, kind: TokenKind) -> Result<TokenKind> {
        self.advance(1);
        Ok(kind)
    }

    /// `:` followed by an anonymous-label or rts reference: `:+3`,
    /// `:---`, `:<<rts`, `:>rts`, `:rts`.
    fn try_anon_ref(&mut self) -> Option<String> {
        let start = self.pos;
        let (line, column) = (self.line, self.column);
        self.advance(1);
        match self.peek(0) {
            Some('+' | '-') if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.advance(1);
                while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.advance(1);
                }
                return Some(self.lexeme(start));
            }
            Some('+' | '-') => {
                while matches!(self.peek(0), Some('+' | '-')) {
                    self.advance(1);
                }
                return Some(self.lexeme(start));
            }
            Some('<') => {
                while self.peek(0) == Some('<') {
                    self.advance(1);
                }
                if self.eat_str("rts") {
                    return Some(self.lexeme(start));
                }
            }
            Some('>') | Some('r') => {
                while self.peek(0) == Some('>') {
                    self.advance(1);
                }
                if self.eat_str("rts") {
                    return Some(self.lexeme(start));
                }
            }
            _ => {}
        }
        self.pos = start;
        self.line = line;
        self.column = column;
        None
    }

    fn scan_str(&mut self, quote: char) -> Result<TokenKind> {
        self.advance(1);
        let mut out = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(Error::Syntax(format!(
                        "EOF while looking for {quote}"
                    )))
                }
                Some(c) if c == quote => {
                    self.advance(1);
                    return Ok(TokenKind::Str(out));
                }
                Some('\\') => match self.peek(1) {
                    Some('u' | 'U') if self.hex_digits(2, 4).is_some() => {
                        let code = self.hex_digits(2, 4).unwrap();
                        let c = char::from_u32(code).ok_or_else(|| {
                            Error::Syntax(format!("Bad character escape: \\u{code:04x}"))
                        })?;
                        out.push(c);
                        self.advance(6);
                    }
                    Some('x' | 'X') if self.hex_digits(2, 2).is_some() => {
                        let code = self.hex_digits(2, 2).unwrap();
                        out.push(char::from_u32(code).unwrap());
                        self.advance(4);
                    }
                    Some(c) => {
                        // The escape simply unquotes: `\"` is a quote,
                        // `\n` is the letter n.
                        out.push(c);
                        self.advance(2);
                    }
                    None => {
                        out.push('\\');
                        self.advance(1);
                    }
                },
                Some(c) => {
                    out.push(c);
                    self.advance(1);
                }
            }
        }
    }

    /// Reads `count` hex digits starting `skip` chars ahead.
    fn hex_digits(&self, skip: usize, count: usize) -> Option<u32> {
        let mut value = 0u32;
        for i in 0..count {
            value = value * 16 + self.peek(skip + i)?.to_digit(16)?;
        }
        Some(value)
    }

    fn scan_num(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        if matches!(self.peek(0), Some('$' | '%')) {
            self.advance(1);
        }
        let digits = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance(1);
        }
        if self.pos == digits {
            return Err(Error::Syntax("Syntax error".to_string()));
        }
        let text = self.lexeme(start).replace('_', "");
        if let Some(hex) = text.strip_prefix('$') {
            let value = parse_radix(hex, 16)
                .ok_or_else(|| Error::Syntax(format!("Bad hex number: ${hex}")))?;
            Ok(TokenKind::Num {
                value,
                width: Some((hex.len() as u32).div_ceil(2)),
            })
        } else if let Some(bin) = text.strip_prefix('%') {
            let value = parse_radix(bin, 2)
                .ok_or_else(|| Error::Syntax(format!("Bad binary number: %{bin}")))?;
            Ok(TokenKind::Num {
                value,
                width: Some((bin.len() as u32).div_ceil(8)),
            })
        } else if text.starts_with('0') {
            let value = parse_radix(&text, 8)
                .ok_or_else(|| Error::Syntax(format!("Bad octal number: {text}")))?;
            Ok(TokenKind::Num { value, width: None })
        } else {
            let value = parse_radix(&text, 10)
                .ok_or_else(|| Error::Syntax(format!("Bad decimal number: {text}")))?;
            Ok(TokenKind::Num { value, width: None })
        }
    }

    fn eat_word_chars(&mut self) {
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance(1);
        }
    }

    /// Consumes subsequent `::word` path components.
    fn eat_scoped_words(&mut self) {
        while self.peek(0) == Some(':')
            && self.peek(1) == Some(':')
            && self.peek(2).is_some_and(is_word_start)
        {
            self.advance(2);
            self.eat_word_chars();
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if s.chars()
            .enumerate()
            .all(|(i, c)| self.peek(i) == Some(c))
        {
            self.advance(s.len());
            true
        } else {
            false
        }
    }

    fn lexeme(&mut self, start: usize) -> String {
        let s: String = self.chars[start..self.pos].iter().collect();
        self.last = s.clone();
        s
    }

    fn peek(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn advance(&mut self, n: usize) {
        for _ in 0..n {
            if let Some(&c) = self.chars.get(self.pos) {
                self.pos += 1;
                if c == '\n' {
                    self.line += 1;
                    self.column = 0;
                } else {
                    self.column += 1;
                }
            }
        }
    }
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn parse_radix(text: &str, radix: u32) -> Option<i64> {
    if text.is_empty() {
        return None;
    }
    // Stricter than from_str_radix: no sign, and octal/decimal digits
    // must actually be in range.
    if !text.chars().all(|c| c.to_digit(radix).is_some()) {
        return None;
    }
    i64::from_str_radix(text, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Vec<Token> {
        Tokenizer::new(text, "input.s")
            .next_line()
            .unwrap()
            .unwrap_or_default()
    }

    fn kinds(text: &str) -> Vec<TokenKind> {
        line(text).into_iter().map(|t| t.kind).collect()
    }

    fn err(text: &str) -> String {
        let mut t = Tokenizer::new(text, "input.s");
        loop {
            match t.next_line() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an error"),
                Err(e) => return e.to_string(),
            }
        }
    }

    #[test]
    fn instruction_line() {
        assert_eq!(
            kinds("  adc $1f"),
            vec![
                TokenKind::Ident("adc".into()),
                TokenKind::Num {
                    value: 0x1f,
                    width: Some(1)
                },
            ]
        );
    }

    #[test]
    fn number_bases_and_widths() {
        assert_eq!(
            kinds("$1234 %00000001 017 123 $12_34"),
            vec![
                TokenKind::Num { value: 0x1234, width: Some(2) },
                TokenKind::Num { value: 1, width: Some(1) },
                TokenKind::Num { value: 0o17, width: None },
                TokenKind::Num { value: 123, width: None },
                TokenKind::Num { value: 0x1234, width: Some(2) },
            ]
        );
        // Nine binary digits push the width to two bytes.
        assert_eq!(
            kinds("%101010101"),
            vec![TokenKind::Num { value: 0b101010101, width: Some(2) }]
        );
    }

    #[test]
    fn number_errors_carry_location() {
        let e = err("  adc $1g");
        assert!(e.contains("Bad hex number: $1g"), "{e}");
        assert!(e.contains("at input.s:1:6 near '$1g'"), "{e}");
        assert!(err("  12a").contains("Bad decimal number: 12a\n  at input.s:1:2"));
        assert!(err("  018").contains("Bad octal number: 018"));
        assert!(err("  %012").contains("Bad binary number: %012"));
        assert!(err("  `abc").contains("Syntax error\n  at input.s:1:2"));
        assert!(err(" .2").contains("Syntax error\n  at input.s:1:1"));
    }

    #[test]
    fn idents_cheap_locals_and_scope_paths() {
        assert_eq!(kinds("@foo"), vec![TokenKind::Ident("@foo".into())]);
        assert_eq!(kinds("@@"), vec![TokenKind::Ident("@@".into())]);
        assert_eq!(
            kinds("a::b::c ::global"),
            vec![
                TokenKind::Ident("a::b::c".into()),
                TokenKind::Ident("::global".into()),
            ]
        );
    }

    #[test]
    fn cs_tokens_lowercase_and_alias() {
        let toks = line(".BYT 1");
        assert!(toks[0].is_cs(".byte"));
        match &toks[0].kind {
            TokenKind::Cs { raw, .. } => assert_eq!(raw, ".BYT"),
            _ => panic!(),
        }
        assert!(line(".endrep")[0].is_cs(".endrepeat"));
        assert!(line(".addr 0")[0].is_cs(".word"));
    }

    #[test]
    fn anon_refs() {
        assert_eq!(kinds(":++"), vec![TokenKind::Ident(":++".into())]);
        assert_eq!(kinds(":-3"), vec![TokenKind::Ident(":-3".into())]);
        assert_eq!(kinds(":rts"), vec![TokenKind::Ident(":rts".into())]);
        assert_eq!(kinds(":>>rts"), vec![TokenKind::Ident(":>>rts".into())]);
        assert_eq!(kinds(":<rts"), vec![TokenKind::Ident(":<rts".into())]);
        // A bare colon stays an operator.
        assert_eq!(kinds(": lda"), vec![
            TokenKind::Op(":".into()),
            TokenKind::Ident("lda".into()),
        ]);
    }

    #[test]
    fn operators_longest_match() {
        assert_eq!(
            kinds("<< <= <> < >> >= > && & || | +++ --"),
            ["<<", "<=", "<>", "<", ">>", ">=", ">", "&&", "&", "||", "|", "+++", "--"]
                .iter()
                .map(|s| TokenKind::Op(s.to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(kinds(r#""abc""#), vec![TokenKind::Str("abc".into())]);
        assert_eq!(kinds(r#""a\"b""#), vec![TokenKind::Str("a\"b".into())]);
        // Escapes unquote rather than translate.
        assert_eq!(kinds(r#""a\nb""#), vec![TokenKind::Str("anb".into())]);
        assert_eq!(kinds(r#""\x41B""#), vec![TokenKind::Str("AB".into())]);
        assert_eq!(kinds("'sq'"), vec![TokenKind::Str("sq".into())]);
        assert!(err("\"abc").contains("EOF while looking for \""));
    }

    #[test]
    fn comments_and_continuations() {
        assert_eq!(kinds("lda ; comment"), vec![TokenKind::Ident("lda".into())]);
        let toks = kinds("lda \\\n #3");
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[1], TokenKind::Op("#".into()));
    }

    #[test]
    fn curly_groups_fold() {
        let toks = line("a {b {c} d} e");
        assert_eq!(toks.len(), 3);
        let inner = toks[1].grp_inner().unwrap();
        assert_eq!(inner.len(), 3);
        assert!(inner[1].grp_inner().is_some());
        assert!(err("a } b").contains("Missing open curly"));
        assert!(err("a { b").contains("Missing close curly"));
    }

    #[test]
    fn lines_split_and_skip_blanks() {
        let mut t = Tokenizer::new("one\n\n  ; nope\ntwo three\n", "input.s");
        assert_eq!(t.next_line().unwrap().unwrap().len(), 1);
        assert_eq!(t.next_line().unwrap().unwrap().len(), 2);
        assert!(t.next_line().unwrap().is_none());
    }

    #[test]
    fn source_positions() {
        let toks = line("  lda #$10");
        let s = toks[0].source.as_ref().unwrap();
        assert_eq!((s.line, s.column), (1, 2));
        let s = toks[1].source.as_ref().unwrap();
        assert_eq!((s.line, s.column), (1, 6));
    }
}
