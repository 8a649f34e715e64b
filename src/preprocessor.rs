//! Token-line rewriting between the token stream and the assembler.
//!
//! Lines are expanded (`.define` calls, inline functions like
//! `.tcount`), conditionals and `.repeat` blocks are resolved, macro
//! calls become stream frames, and labels are split off the front so
//! the assembler only ever sees one thing per line.
//!
//! Symbol questions (`.ifdef`, `.sprintf` with named constants, eager
//! assignment) go through the [`Env`] trait, implemented by the
//! assembler.

use std::collections::{HashMap, VecDeque};

use crate::expr::{self, Expr};
use crate::macros::{Define, Macro};
use crate::token::{self, Token, TokenKind};
use crate::tokenstream::TokenStream;
use crate::{Error, Result};

const MAX_STACK_DEPTH: usize = 100;

/// The assembler-side surface the preprocessor needs: symbol queries
/// for conditionals, constant evaluation for `.if`/`.sprintf`, and
/// eager application of assignment lines.
pub trait Env {
    fn defined_symbol(&self, name: &str) -> bool;
    fn constant_symbol(&self, name: &str) -> bool;
    fn referenced_symbol(&self, name: &str) -> bool;
    /// Value of a `sym` node, when it is known and constant.
    fn evaluate(&self, expr: &Expr) -> Option<i64>;
    fn assign_line(&mut self, line: &[Token]) -> Result<()>;
    fn set_line(&mut self, line: &[Token]) -> Result<()>;
}

enum MacroDef {
    Define(Define),
    Macro(Macro),
}

struct Repeat {
    /// Body lines, including the trailing `.endrepeat`.
    lines: Vec<Vec<Token>>,
    times: i64,
    counter: i64,
    var: Option<String>,
}

type Inline<'a> =
    fn(&mut Preprocessor<'a>, &Token, Vec<Vec<Token>>, &mut dyn Env) -> Result<Vec<Token>>;

pub struct Preprocessor<'a> {
    stream: TokenStream<'a>,
    macros: HashMap<String, MacroDef>,
    repeats: Vec<Repeat>,
    pending: VecDeque<Vec<Token>>,
    /// Uniquifies `.local` names across macro expansions.
    macro_id: usize,
}

impl<'a> Preprocessor<'a> {
    pub fn new(stream: TokenStream<'a>) -> Preprocessor<'a> {
        Preprocessor {
            stream,
            macros: HashMap::new(),
            repeats: Vec::new(),
            pending: VecDeque::new(),
            macro_id: 0,
        }
    }

    /// Next fully-expanded line for the assembler, or `None` at EOF.
    pub fn next(&mut self, env: &mut dyn Env) -> Result<Option<Vec<Token>>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            let Some(line) = self.read_line(env)? else {
                return Ok(None);
            };
            self.pump(line, env)?;
        }
    }

    fn read_line(&mut self, env: &mut dyn Env) -> Result<Option<Vec<Token>>> {
        let Some(mut line) = self.stream.next()? else {
            return Ok(None);
        };
        self.expand_line(&mut line, env)?;
        Ok(Some(line))
    }

    /// Splits labels off the front of an expanded line and routes the
    /// rest: directives run here, macro calls enter the stream, and
    /// everything else queues for the assembler.
    fn pump(&mut self, mut line: Vec<Token>, env: &mut dyn Env) -> Result<()> {
        while !line.is_empty() {
            match &line[0].kind {
                TokenKind::Ident(_) => {
                    if line.get(1).map_or(false, |t| t.is_op(":")) {
                        let rest = line.split_off(2);
                        self.pending.push_back(line);
                        line = rest;
                        continue;
                    }
                    if line.get(1).map_or(false, |t| t.is_op("=")) {
                        env.assign_line(&line)?;
                    } else if line.get(1).map_or(false, |t| t.is_cs(".set")) {
                        env.set_line(&line)?;
                    }
                    if !self.try_expand_macro(&line)? {
                        self.pending.push_back(line);
                    }
                    return Ok(());
                }
                TokenKind::Cs { .. } => {
                    if !self.try_run_directive(&line, env)? {
                        self.pending.push_back(line);
                    }
                    return Ok(());
                }
                TokenKind::Op(op) => {
                    if !op.is_empty() && op.chars().all(|c| c == '+' || c == '-') {
                        let mut label = vec![line[0].clone()];
                        if line.get(1).map_or(false, |t| t.is_op(":")) {
                            label.push(line[1].clone());
                            line.drain(..2);
                        } else {
                            label.push(Token::op(":"));
                            line.drain(..1);
                        }
                        self.pending.push_back(label);
                        continue;
                    }
                    if op == ":" {
                        let label = vec![line.remove(0)];
                        self.pending.push_back(label);
                        continue;
                    }
                    return Err(unexpected(&line));
                }
                _ => return Err(unexpected(&line)),
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////
    // expansion

    fn expand_line(&mut self, line: &mut Vec<Token>, env: &mut dyn Env) -> Result<()> {
        let mut pos = 0;
        let mut max_pos = 0;
        let mut depth = 0usize;
        while pos < line.len() {
            if pos > max_pos {
                max_pos = pos;
                depth = 0;
            } else {
                depth += 1;
                if depth > MAX_STACK_DEPTH {
                    return Err(Error::Syntax(format!(
                        "Maximum expansion depth reached: {}{}",
                        token::format(line),
                        token::at(line.first().and_then(|t| t.source.as_ref()))
                    )));
                }
            }
            pos = self.expand_token(line, pos, env)?;
        }
        Ok(())
    }

    /// Expands one token, returning the next position to look at.
    fn expand_token(
        &mut self,
        line: &mut Vec<Token>,
        pos: usize,
        env: &mut dyn Env,
    ) -> Result<usize> {
        match line[pos].kind.clone() {
            TokenKind::Ident(name) => {
                let overflow = match self.macros.get(&name) {
                    Some(MacroDef::Define(define)) => define.expand(line, pos),
                    _ => None,
                };
                if let Some(overflow) = overflow {
                    if !overflow.is_empty() {
                        self.stream.unshift(overflow)?;
                    }
                    // rescan: the expansion may contain more defines
                    return Ok(pos);
                }
            }
            TokenKind::Cs { name, .. } => return self.expand_directive(&name, line, pos, env),
            _ => {}
        }
        Ok(pos + 1)
    }

    fn expand_directive(
        &mut self,
        name: &str,
        line: &mut Vec<Token>,
        i: usize,
        env: &mut dyn Env,
    ) -> Result<usize> {
        match name {
            // keep the name from expanding out from under us
            ".define" | ".ifdef" | ".ifndef" | ".undefine" => Ok(skip_identifier(line, i)),
            ".skip" => self.skip(line, i, env),
            ".noexpand" => Ok(noexpand(line, i)),
            ".tcount" => self.parse_args(line, i, Some(1), env, Self::tcount),
            ".ident" => self.parse_args(line, i, Some(1), env, Self::ident),
            ".string" => self.parse_args(line, i, Some(1), env, Self::string),
            ".concat" => self.parse_args(line, i, None, env, Self::concat),
            ".sprintf" => self.parse_args(line, i, None, env, Self::sprintf),
            ".blank" => self.parse_args(line, i, Some(1), env, Self::blank),
            ".defined" | ".definedsymbol" => {
                self.parse_args(line, i, Some(1), env, Self::defined_symbol)
            }
            ".constantsymbol" => self.parse_args(line, i, Some(1), env, Self::constant_symbol),
            ".referencedsymbol" => {
                self.parse_args(line, i, Some(1), env, Self::referenced_symbol)
            }
            _ => Ok(i + 1),
        }
    }

    /// `.skip` removes itself and gives the token after the next one
    /// an early expansion step; for a group, one step inside it.
    fn skip(&mut self, line: &mut Vec<Token>, i: usize, env: &mut dyn Env) -> Result<usize> {
        line.remove(i);
        if let Some(TokenKind::Grp(inner)) = line.get_mut(i).map(|t| &mut t.kind) {
            let mut inner = std::mem::take(inner);
            if !inner.is_empty() {
                self.expand_token(&mut inner, 0, env)?;
            }
            if let Some(tok) = line.get_mut(i) {
                tok.kind = TokenKind::Grp(inner);
            }
        } else if i + 1 < line.len() {
            self.expand_token(line, i + 1, env)?;
        }
        Ok(i)
    }

    fn parse_args(
        &mut self,
        line: &mut Vec<Token>,
        i: usize,
        want: Option<usize>,
        env: &mut dyn Env,
        f: Inline<'a>,
    ) -> Result<usize> {
        let cs = line[i].clone();
        token::expect(&Token::new(TokenKind::LParen), line.get(i + 1), Some(&cs))?;
        let end = token::find_balanced(line, i + 1)
            .ok_or_else(|| Error::Syntax(format!("Unbalanced parens: {}", cs.name_at())))?;
        let mut args = Vec::new();
        for mut arg in token::parse_arg_list(line, i + 2, end)? {
            if arg.len() == 1 {
                if let TokenKind::Grp(inner) = &arg[0].kind {
                    arg = inner.clone();
                }
            }
            self.expand_line(&mut arg, env)?;
            args.push(arg);
        }
        if let Some(want) = want {
            if args.len() != want {
                return Err(Error::Syntax(format!(
                    "Expected {want} parameters: {}",
                    cs.name_at()
                )));
            }
        }
        let expansion = f(self, &cs, args, env)?;
        line.splice(i..=end, expansion);
        Ok(i)
    }

    fn tcount(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        _env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let count = token::count(&args[0]) as i64;
        Ok(vec![Token::num(count).with_source(cs.source.clone())])
    }

    fn ident(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        _env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let name = token::expect_string(args[0].first(), Some(cs))?;
        token::expect_eol(args[0].get(1), "a single token")?;
        Ok(vec![Token::ident(name).with_source(cs.source.clone())])
    }

    fn string(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        _env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let name = token::expect_identifier(args[0].first(), Some(cs))?;
        token::expect_eol(args[0].get(1), "a single token")?;
        Ok(vec![Token::string(name).with_source(cs.source.clone())])
    }

    fn concat(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        _env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let mut joined = String::new();
        for arg in &args {
            joined.push_str(&token::expect_string(arg.first(), Some(cs))?);
            token::expect_eol(arg.get(1), "a single string")?;
        }
        Ok(vec![Token::string(joined).with_source(cs.source.clone())])
    }

    fn blank(
        &mut self,
        _cs: &Token,
        args: Vec<Vec<Token>>,
        _env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        Ok(vec![Token::num(i64::from(args[0].is_empty()))])
    }

    fn defined_symbol(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let name = one_ident(&args[0], cs)?;
        Ok(vec![Token::num(i64::from(env.defined_symbol(&name)))])
    }

    fn constant_symbol(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let name = one_ident(&args[0], cs)?;
        Ok(vec![Token::num(i64::from(env.constant_symbol(&name)))])
    }

    fn referenced_symbol(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let name = one_ident(&args[0], cs)?;
        Ok(vec![Token::num(i64::from(env.referenced_symbol(&name)))])
    }

    fn sprintf(
        &mut self,
        cs: &Token,
        args: Vec<Vec<Token>>,
        env: &mut dyn Env,
    ) -> Result<Vec<Token>> {
        let fmt = token::expect_string(args.first().and_then(|a| a.first()), Some(cs))?;
        let chars: Vec<char> = fmt.chars().collect();
        let mut out = String::new();
        let mut arg_idx = 1;
        let mut i = 0;
        while i < chars.len() {
            if chars[i] != '%' {
                out.push(chars[i]);
                i += 1;
                continue;
            }
            i += 1;
            if chars.get(i) == Some(&'%') {
                out.push('%');
                i += 1;
                continue;
            }
            let left = chars.get(i) == Some(&'-');
            if left {
                i += 1;
            }
            let zero = chars.get(i) == Some(&'0');
            if zero {
                i += 1;
            }
            let mut width = 0usize;
            while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
                width = width * 10 + d as usize;
                i += 1;
            }
            let mut precision = None;
            if chars.get(i) == Some(&'.') {
                i += 1;
                let mut p = 0usize;
                let mut digits = false;
                while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
                    p = p * 10 + d as usize;
                    digits = true;
                    i += 1;
                }
                if !digits {
                    return Err(invalid_format(&fmt, cs));
                }
                precision = Some(p);
            }
            let conv = *chars.get(i).ok_or_else(|| invalid_format(&fmt, cs))?;
            i += 1;
            let arg = args
                .get(arg_idx)
                .ok_or_else(|| invalid_format(&fmt, cs))?;
            arg_idx += 1;
            let (rendered, numeric) = match conv {
                's' => {
                    let mut s = token::expect_string(arg.first(), Some(cs))?;
                    if let Some(p) = precision {
                        s = s.chars().take(p).collect();
                    }
                    (s, false)
                }
                'c' => {
                    let v = self.evaluate_const_tokens(arg, env)?;
                    let c = char::from_u32(v as u32).unwrap_or('\u{fffd}');
                    (c.to_string(), false)
                }
                'd' | 'i' => (self.evaluate_const_tokens(arg, env)?.to_string(), true),
                'u' => (
                    (self.evaluate_const_tokens(arg, env)? as u32).to_string(),
                    true,
                ),
                'o' => (
                    format!("{:o}", self.evaluate_const_tokens(arg, env)? as u32),
                    true,
                ),
                'x' => (
                    format!("{:x}", self.evaluate_const_tokens(arg, env)? as u32),
                    true,
                ),
                'X' => (
                    format!("{:X}", self.evaluate_const_tokens(arg, env)? as u32),
                    true,
                ),
                _ => return Err(invalid_format(&fmt, cs)),
            };
            out.push_str(&pad(rendered, width, left, zero && numeric));
        }
        Ok(vec![Token::string(out).with_source(cs.source.clone())])
    }

    ////////////////////////////////////////////////////////////////
    // run directives

    /// Handles a whole-line directive, or returns false to let it
    /// through to the assembler.
    fn try_run_directive(&mut self, line: &[Token], env: &mut dyn Env) -> Result<bool> {
        let Some(name) = line[0].cs_name() else {
            return Ok(false);
        };
        match name {
            ".define" => self.parse_define(line)?,
            ".undefine" => self.parse_undefine(line)?,
            ".else" | ".elseif" | ".endif" => return Err(bad_close(".if", &line[0])),
            ".endmacro" => return Err(bad_close(".macro", &line[0])),
            ".endrepeat" => self.parse_end_repeat(line)?,
            ".exitmacro" => {
                token::expect_eol(line.get(1), "end of line")?;
                self.stream.exit();
            }
            ".if" => {
                let cond = self.evaluate_const_tokens(&line[1..], env)? != 0;
                self.parse_if(cond, env)?;
            }
            ".ifdef" => {
                let cond = self.if_def(&line[1..], &line[0], env)?;
                self.parse_if(cond, env)?;
            }
            ".ifndef" => {
                let cond = !self.if_def(&line[1..], &line[0], env)?;
                self.parse_if(cond, env)?;
            }
            ".ifblank" => self.parse_if(line.len() == 1, env)?,
            ".ifnblank" => self.parse_if(line.len() > 1, env)?,
            ".ifref" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(env.referenced_symbol(&name), env)?;
            }
            ".ifnref" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(!env.referenced_symbol(&name), env)?;
            }
            ".ifsym" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(env.defined_symbol(&name), env)?;
            }
            ".ifnsym" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(!env.defined_symbol(&name), env)?;
            }
            ".ifconst" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(env.constant_symbol(&name), env)?;
            }
            ".ifnconst" => {
                let name = one_ident(&line[1..], &line[0])?;
                self.parse_if(!env.constant_symbol(&name), env)?;
            }
            // this is a 6502 assembler and nothing else
            ".ifp02" => self.parse_if(true, env)?,
            ".ifp4510" | ".ifp816" | ".ifpc02" | ".ifpdtv" | ".ifpsc02" => {
                self.parse_if(false, env)?
            }
            ".macro" => self.parse_macro(line)?,
            ".repeat" => self.parse_repeat(line, env)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn try_expand_macro(&mut self, line: &[Token]) -> Result<bool> {
        let Some(name) = line[0].ident_name() else {
            return Ok(false);
        };
        let expansion = match self.macros.get(name) {
            Some(MacroDef::Macro(mac)) => mac.expand(line, &mut self.macro_id)?,
            _ => return Ok(false),
        };
        // a fresh frame, so .exitmacro can abandon the rest
        self.stream.enter(None)?;
        self.stream.unshift(expansion)?;
        Ok(true)
    }

    fn parse_define(&mut self, line: &[Token]) -> Result<()> {
        let name = token::expect_identifier(line.get(1), line.first())?;
        let define = Define::define(line)?;
        match self.macros.get_mut(&name) {
            Some(MacroDef::Define(prev)) => prev.append(define),
            Some(MacroDef::Macro(_)) => {
                return Err(Error::Syntax(format!("Already defined: {name}")))
            }
            None => {
                self.macros.insert(name, MacroDef::Define(define));
            }
        }
        Ok(())
    }

    fn parse_undefine(&mut self, line: &[Token]) -> Result<()> {
        let name = token::expect_identifier(line.get(1), line.first())?;
        token::expect_eol(line.get(2), "end of line")?;
        if self.macros.remove(&name).is_none() {
            return Err(Error::Syntax(format!(
                "Not defined: {}",
                token::name_at(line.get(1))
            )));
        }
        Ok(())
    }

    fn parse_macro(&mut self, line: &[Token]) -> Result<()> {
        let name = token::expect_identifier(line.get(1), line.first())?;
        if self.macros.contains_key(&name) {
            return Err(Error::Syntax(format!("Already defined: {name}")));
        }
        let mut production = Vec::new();
        let mut depth = 1u32;
        loop {
            let Some(body) = self.stream.next()? else {
                return Err(Error::Syntax(format!("EOF looking for .endmacro: {name}")));
            };
            match body.first().and_then(Token::cs_name) {
                Some(".macro") => depth += 1,
                Some(".endmacro") => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            production.push(body);
        }
        let mac = Macro::define(line, production)?;
        self.macros.insert(name, MacroDef::Macro(mac));
        Ok(())
    }

    fn parse_repeat(&mut self, line: &[Token], env: &mut dyn Env) -> Result<()> {
        let (count, end) = expr::parse(line, 1)?;
        let times = self.evaluate_const(&count, env)?;
        let mut var = None;
        if end < line.len() {
            if !line[end].is_op(",") {
                return Err(Error::Syntax(format!(
                    "Expected comma: {}",
                    line[end].name_at()
                )));
            }
            var = Some(token::expect_identifier(line.get(end + 1), line.get(end))?);
            token::expect_eol(line.get(end + 2), "end of line")?;
        }
        let mut lines = Vec::new();
        let mut depth = 1u32;
        loop {
            let Some(body) = self.stream.next()? else {
                return Err(Error::Syntax("`.repeat` with no .endrep".to_string()));
            };
            let done = match body.first().and_then(Token::cs_name) {
                Some(".repeat") => {
                    depth += 1;
                    false
                }
                Some(".endrepeat") => {
                    depth -= 1;
                    depth == 0
                }
                _ => false,
            };
            lines.push(body);
            if done {
                break;
            }
        }
        let trailer = lines[lines.len() - 1].clone();
        self.repeats.push(Repeat {
            lines,
            times,
            counter: -1,
            var,
        });
        // the trailing .endrepeat drives each iteration
        self.parse_end_repeat(&trailer)
    }

    fn parse_end_repeat(&mut self, line: &[Token]) -> Result<()> {
        token::expect_eol(line.get(1), "end of line")?;
        let Some(mut top) = self.repeats.pop() else {
            return Err(Error::Syntax(format!(
                ".endrep with no .repeat{}",
                line[0].at()
            )));
        };
        top.counter += 1;
        if top.counter >= top.times {
            return Ok(());
        }
        let iteration: Vec<Vec<Token>> = top
            .lines
            .iter()
            .map(|body| {
                body.iter()
                    .map(|t| match (&t.kind, &top.var) {
                        (TokenKind::Ident(name), Some(var)) if name == var => {
                            Token::num(top.counter).with_source(t.source.clone())
                        }
                        _ => t.clone(),
                    })
                    .collect()
            })
            .collect();
        self.repeats.push(top);
        self.stream.unshift(iteration)
    }

    /// Collects one `.if`/`.elseif`/`.else`/`.endif` block from the
    /// stream and pushes back the lines of the branch that holds.
    fn parse_if(&mut self, mut cond: bool, env: &mut dyn Env) -> Result<()> {
        let mut depth = 1u32;
        let mut done = false;
        let mut kept = Vec::new();
        loop {
            let Some(line) = self.stream.next()? else {
                return Err(Error::Syntax("EOF looking for .endif".to_string()));
            };
            let front = line.first().and_then(Token::cs_name).map(str::to_string);
            if front.as_deref() == Some(".endif") {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            } else if front.as_deref().map_or(false, |n| n.starts_with(".if")) {
                depth += 1;
            } else if depth == 1 && !done {
                match front.as_deref() {
                    Some(".else") | Some(".elseif") if cond => {
                        cond = false;
                        done = true;
                        continue;
                    }
                    Some(".elseif") => {
                        let mut args = line[1..].to_vec();
                        self.expand_line(&mut args, env)?;
                        cond = self.evaluate_const_tokens(&args, env)? != 0;
                        continue;
                    }
                    Some(".else") => {
                        cond = true;
                        continue;
                    }
                    _ => {}
                }
            }
            if cond {
                kept.push(line);
            }
        }
        self.stream.unshift(kept)
    }

    fn if_def(&self, args: &[Token], cs: &Token, env: &mut dyn Env) -> Result<bool> {
        let name = one_ident(args, cs)?;
        Ok(self.macros.contains_key(&name) || env.defined_symbol(&name))
    }

    ////////////////////////////////////////////////////////////////
    // constant evaluation

    fn evaluate_const_tokens(&self, tokens: &[Token], env: &mut dyn Env) -> Result<i64> {
        let expr = expr::parse_only(tokens)?;
        self.evaluate_const(&expr, env)
    }

    /// Folds with defined symbols looked up through the environment;
    /// anything short of an absolute number is an error.
    fn evaluate_const(&self, expr: &Expr, env: &dyn Env) -> Result<i64> {
        let folded = fold_with_env(expr, env)?;
        folded.abs_value().ok_or_else(|| {
            Error::Eval(format!(
                "Expected a constant: {}{}",
                folded.op,
                token::at(folded.source.as_ref())
            ))
        })
    }
}

fn fold_with_env(expr: &Expr, env: &dyn Env) -> Result<Expr> {
    let mut e = expr.clone();
    e.args = e
        .args
        .iter()
        .map(|arg| fold_with_env(arg, env))
        .collect::<Result<Vec<_>>>()?;
    if e.op == "sym" {
        if let Some(sym) = e.sym.as_deref() {
            if env.defined_symbol(sym) {
                let num = env
                    .evaluate(&e)
                    .ok_or_else(|| Error::Symbol(format!("Symbol {sym} is undefined")))?;
                return Ok(Expr::num(num));
            }
        }
    }
    expr::evaluate(e)
}

/// `.noexpand` shields the following token (or a whole group, spliced
/// in unexpanded) from expansion.
fn noexpand(line: &mut Vec<Token>, i: usize) -> usize {
    match line.get(i + 1).map(|t| t.kind.clone()) {
        Some(TokenKind::Grp(inner)) => {
            let len = inner.len();
            line.splice(i..i + 2, inner);
            i + len
        }
        _ => {
            line.remove(i);
            i + 1
        }
    }
}

/// A bare identifier after `.define` and friends is the name being
/// talked about, not an expansion site.
fn skip_identifier(line: &[Token], i: usize) -> usize {
    if line.get(i + 1).map_or(false, Token::is_ident) {
        i + 2
    } else {
        i + 1
    }
}

fn one_ident(args: &[Token], cs: &Token) -> Result<String> {
    let name = token::expect_identifier(args.first(), Some(cs))?;
    token::expect_eol(args.get(1), "a single identifier")?;
    Ok(name)
}

fn unexpected(line: &[Token]) -> Error {
    Error::Syntax(format!("Unexpected: {}", token::name_at(line.first())))
}

fn bad_close(opener: &str, cs: &Token) -> Error {
    Error::Syntax(format!("{} with no {opener}{}", cs.name(), cs.at()))
}

fn invalid_format(fmt: &str, cs: &Token) -> Error {
    Error::Syntax(format!("Invalid format string \"{fmt}\": {}", cs.name_at()))
}

fn pad(s: String, width: usize, left: bool, zero: bool) -> String {
    let len = s.chars().count();
    if len >= width {
        return s;
    }
    let fill = width - len;
    if left {
        let mut out = s;
        out.extend(std::iter::repeat(' ').take(fill));
        return out;
    }
    if zero {
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", s.as_str()),
        };
        return format!("{sign}{}{digits}", "0".repeat(fill));
    }
    format!("{}{s}", " ".repeat(fill))
}
