//! The assembler state machine.
//!
//! Consumes preprocessed token lines and accumulates chunks of output
//! bytes.  Anything whose value depends on placement (labels in
//! relocatable chunks, imports, forward references) is emitted as
//! `0xff` placeholder bytes plus a [`Substitution`] for the linker.
//! Addressing modes are chosen once, speculatively, from whatever size
//! information is available at the time; they are never relaxed.
//!
//! Symbol references resolve against the current scope only.  A name
//! with no entry there becomes a forward symbol, filled in either by a
//! later definition in that scope or, at [`Assembler::module`] time,
//! by an ancestor scope's definition.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::cpu::{self, Addr};
use crate::expr::{self, Expr, Meta};
use crate::module::{Chunk, Module, Segment, Substitution, Symbol};
use crate::preprocessor::{Env, Preprocessor};
use crate::token::{self, SourceInfo, Token, TokenKind};
use crate::{Error, Result};

const DEFAULT_SEGMENT: &str = "code";

#[derive(Clone, Debug, Default)]
struct Sym {
    /// Spelling for diagnostics; anonymous labels store their
    /// reference spelling (`:+`, `:rts`).
    name: Option<String>,
    expr: Option<Expr>,
    export: bool,
    referenced: bool,
    /// Scope the symbol was created in.
    scope: usize,
    /// Whether an unresolved forward may fall back to ancestor scopes
    /// at module time.  Qualified and anonymous references may not.
    chain: bool,
    /// `.set` symbols are reassignable constants.
    mutable: bool,
}

#[derive(Debug, Default)]
struct Scope {
    parent: Option<usize>,
    proc: bool,
    /// Named child scopes, re-enterable by name.
    children: HashMap<String, usize>,
    /// name -> index into `Assembler::symbols`
    symbols: HashMap<String, usize>,
}

pub struct Assembler {
    symbols: Vec<Sym>,
    scopes: Vec<Scope>,
    scope: usize,
    /// Cheap locals, cleared at every non-cheap label.
    cheap: HashMap<String, usize>,

    anonymous_forward: VecDeque<usize>,
    anonymous_reverse: Vec<Expr>,
    relative_forward: HashMap<String, usize>,
    relative_reverse: HashMap<String, Expr>,
    rts_forward: VecDeque<usize>,
    rts_reverse: Vec<Expr>,

    chunks: Vec<Chunk>,
    /// Index of the chunk currently receiving bytes.
    chunk: Option<usize>,
    /// Pending org for the next chunk.
    org: Option<i64>,
    /// Pending name for the next chunk.
    chunk_name: Option<String>,

    /// Active candidate segments for new chunks.
    segments: Vec<String>,
    segment_stack: Vec<(Vec<String>, Option<usize>, Option<i64>)>,
    segment_data: IndexMap<String, Segment>,
    segment_prefix: String,
}

impl Default for Assembler {
    fn default() -> Assembler {
        Assembler::new()
    }
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            symbols: Vec::new(),
            scopes: vec![Scope::default()],
            scope: 0,
            cheap: HashMap::new(),
            anonymous_forward: VecDeque::new(),
            anonymous_reverse: Vec::new(),
            relative_forward: HashMap::new(),
            relative_reverse: HashMap::new(),
            rts_forward: VecDeque::new(),
            rts_reverse: Vec::new(),
            chunks: Vec::new(),
            chunk: None,
            org: None,
            chunk_name: None,
            segments: vec![DEFAULT_SEGMENT.to_string()],
            segment_stack: Vec::new(),
            segment_data: IndexMap::new(),
            segment_prefix: String::new(),
        }
    }

    /// Runs the whole preprocessed stream through the assembler.
    pub fn assemble(&mut self, pre: &mut Preprocessor<'_>) -> Result<()> {
        while let Some(line) = pre.next(self)? {
            self.line(&line)?;
        }
        Ok(())
    }

    /// Handles one preprocessed line.  Assignment lines were already
    /// applied by the preprocessor and are skipped here.
    pub fn line(&mut self, line: &[Token]) -> Result<()> {
        let Some(front) = line.first() else {
            return Ok(());
        };
        match &front.kind {
            TokenKind::Ident(name) => {
                if line.get(1).map_or(false, |t| t.is_op(":")) {
                    token::expect_eol(line.get(2), "end of line")?;
                    let name = name.clone();
                    self.label(&name, front.source.clone())
                } else if line.get(1).map_or(false, |t| t.is_op("="))
                    || line.get(1).map_or(false, |t| t.is_cs(".set"))
                {
                    Ok(())
                } else {
                    self.instruction(line)
                }
            }
            TokenKind::Cs { .. } => self.directive(line),
            TokenKind::Op(op) => {
                if op == ":" {
                    token::expect_eol(line.get(1), "end of line")?;
                    self.anonymous_label();
                    Ok(())
                } else if is_relative_spelling(op) {
                    token::expect_eol(line.get(2), "end of line")?;
                    self.relative_label(op);
                    Ok(())
                } else {
                    Err(Error::Syntax(format!("Unexpected: {}", front.name_at())))
                }
            }
            _ => Err(Error::Syntax(format!("Unexpected: {}", front.name_at()))),
        }
    }

    ////////////////////////////////////////////////////////////////
    // symbols and scopes

    /// Defines `name = value`, as from the command line.
    pub fn assign(&mut self, name: &str, value: i64) -> Result<()> {
        self.assign_expr(name, Expr::num(value))
    }

    fn assign_expr(&mut self, name: &str, expr: Expr) -> Result<()> {
        if name.starts_with('@') {
            return Err(Error::Symbol(format!(
                "Cheap locals may only be labels: {name}"
            )));
        }
        let resolved = self.resolve_expr(&expr)?;
        let idx = self.lookup_or_create(name)?;
        let sym = &mut self.symbols[idx];
        if sym.expr.is_some() {
            return Err(Error::Symbol(format!(
                "Redefining symbol {name}{}",
                token::at(resolved.source.as_ref())
            )));
        }
        sym.expr = Some(resolved);
        Ok(())
    }

    /// Defines or reassigns a `.set` symbol.  The value must be a
    /// constant; mutable symbols never travel in the module.
    pub fn set(&mut self, name: &str, value: i64) -> Result<()> {
        self.set_expr(name, Expr::num(value))
    }

    fn set_expr(&mut self, name: &str, expr: Expr) -> Result<()> {
        if name.starts_with('@') {
            return Err(Error::Symbol(format!(
                "Cheap locals may only be labels: {name}"
            )));
        }
        let resolved = self.resolve_expr(&expr)?;
        let Some(value) = resolved.abs_value() else {
            return Err(Error::Eval(format!(
                "Expected a constant: {name}{}",
                token::at(resolved.source.as_ref())
            )));
        };
        let idx = self.lookup_or_create(name)?;
        let sym = &mut self.symbols[idx];
        if sym.expr.is_some() && !sym.mutable {
            return Err(Error::Symbol(format!("Redefining symbol {name}")));
        }
        sym.expr = Some(Expr::num(value));
        sym.mutable = true;
        Ok(())
    }

    /// Binds `name` to the current program counter.
    pub fn label(&mut self, name: &str, source: Option<SourceInfo>) -> Result<()> {
        let mut pc = self.pc_expr();
        pc.source = source;
        if name.starts_with('@') {
            let idx = self.cheap_lookup_or_create(name);
            let sym = &mut self.symbols[idx];
            if sym.expr.is_some() {
                return Err(Error::Symbol(format!("Redefining symbol {name}")));
            }
            sym.expr = Some(pc);
            return Ok(());
        }
        // a real label ends the current cheap-local span
        self.flush_cheap()?;
        if let Some(i) = self.chunk {
            if self.chunks[i].data.is_empty() {
                self.chunks[i].name = Some(name.to_string());
            }
        }
        let idx = self.lookup_or_create(name)?;
        let sym = &mut self.symbols[idx];
        if sym.expr.is_some() {
            return Err(Error::Symbol(format!("Redefining symbol {name}")));
        }
        sym.expr = Some(pc);
        Ok(())
    }

    /// Declares `name` as provided by some other module.
    pub fn import(&mut self, name: &str) -> Result<()> {
        let idx = self.lookup_or_create(name)?;
        let sym = &mut self.symbols[idx];
        if sym.expr.is_some() {
            return Err(Error::Symbol(format!("Redefining symbol {name}")));
        }
        sym.expr = Some(Expr::import(name));
        Ok(())
    }

    /// Marks `name` for export; it may be defined before or after.
    pub fn export(&mut self, name: &str) -> Result<()> {
        let idx = self.lookup_or_create(name)?;
        self.symbols[idx].export = true;
        Ok(())
    }

    fn new_symbol(&mut self, name: Option<String>, chain: bool) -> usize {
        self.symbols.push(Sym {
            name,
            scope: self.scope,
            chain,
            ..Sym::default()
        });
        self.symbols.len() - 1
    }

    /// Finds or creates the symbol slot a name refers to.  Unqualified
    /// names use the current scope; `a::b` paths walk the scope tree,
    /// with a leading `::` rooting at the global scope.
    fn lookup_or_create(&mut self, name: &str) -> Result<usize> {
        if !name.contains("::") {
            if let Some(&idx) = self.scopes[self.scope].symbols.get(name) {
                return Ok(idx);
            }
            let idx = self.new_symbol(Some(name.to_string()), true);
            self.scopes[self.scope].symbols.insert(name.to_string(), idx);
            return Ok(idx);
        }
        let (scope, last) = self.resolve_scope_path(name)?;
        if let Some(&idx) = self.scopes[scope].symbols.get(&last) {
            return Ok(idx);
        }
        let idx = self.new_symbol(Some(name.to_string()), false);
        self.symbols[idx].scope = scope;
        self.scopes[scope].symbols.insert(last, idx);
        Ok(idx)
    }

    /// Walks a `::` path down the scope tree, returning the scope of
    /// the final component and the component itself.
    fn resolve_scope_path(&self, name: &str) -> Result<(usize, String)> {
        let mut parts = name.split("::").peekable();
        let mut scope;
        if name.starts_with("::") {
            parts.next(); // empty leading component
            scope = 0;
        } else {
            // the first component searches up the chain
            let first = parts.next().unwrap_or_default();
            let mut cur = Some(self.scope);
            scope = loop {
                let Some(s) = cur else {
                    return Err(Error::Symbol(format!("Could not resolve scope {first}")));
                };
                if let Some(&child) = self.scopes[s].children.get(first) {
                    break child;
                }
                cur = self.scopes[s].parent;
            };
        }
        let mut last = parts.next().unwrap_or_default().to_string();
        for part in parts {
            let Some(&child) = self.scopes[scope].children.get(&last) else {
                return Err(Error::Symbol(format!("Could not resolve scope {last}")));
            };
            scope = child;
            last = part.to_string();
        }
        Ok((scope, last))
    }

    fn cheap_lookup_or_create(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.cheap.get(name) {
            return idx;
        }
        let idx = self.new_symbol(Some(name.to_string()), false);
        self.cheap.insert(name.to_string(), idx);
        idx
    }

    fn flush_cheap(&mut self) -> Result<()> {
        for (name, &idx) in &self.cheap {
            if self.symbols[idx].expr.is_none() {
                return Err(Error::Symbol(format!(
                    "Cheap local label never defined: {name}"
                )));
            }
        }
        self.cheap.clear();
        Ok(())
    }

    /// Rewrites `sym` leaves to the working model and folds what it
    /// can: defined symbols inline a copy of their expression, while
    /// forwards and imports become flat-index references.
    fn resolve_expr(&mut self, expr: &Expr) -> Result<Expr> {
        let mut e = expr.clone();
        e.args = e
            .args
            .iter()
            .map(|a| self.resolve_expr(a))
            .collect::<Result<Vec<_>>>()?;
        if e.op == "sym" {
            if let Some(name) = e.sym.clone() {
                return self.resolve_name(&name, e.source);
            }
        }
        expr::evaluate(e)
    }

    fn resolve_name(&mut self, name: &str, source: Option<SourceInfo>) -> Result<Expr> {
        if name == "*" {
            let mut pc = self.pc_expr();
            pc.source = source;
            return expr::evaluate(pc);
        }
        if let Some(rest) = name.strip_prefix(':') {
            return self.resolve_anonymous(name, rest, source);
        }
        let idx = if name.starts_with('@') {
            self.cheap_lookup_or_create(name)
        } else {
            self.lookup_or_create(name)?
        };
        Ok(self.symbol_ref(idx, source))
    }

    fn symbol_ref(&mut self, idx: usize, source: Option<SourceInfo>) -> Expr {
        self.symbols[idx].referenced = true;
        match &self.symbols[idx].expr {
            Some(e) if e.op != "im" => e.clone(),
            _ => {
                // size hint from any shadowed definition up the chain
                let size = self.symbols[idx]
                    .name
                    .as_deref()
                    .and_then(|n| self.chain_size_hint(n));
                Expr {
                    op: "sym".to_string(),
                    num: Some(idx as i64),
                    meta: size.map(|s| Meta {
                        size: Some(s),
                        ..Meta::default()
                    }),
                    source,
                    ..Expr::default()
                }
            }
        }
    }

    fn chain_size_hint(&self, name: &str) -> Option<u32> {
        let mut cur = self.scopes[self.scope].parent;
        while let Some(s) = cur {
            if let Some(&idx) = self.scopes[s].symbols.get(name) {
                if let Some(e) = &self.symbols[idx].expr {
                    return e.size();
                }
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    /// `:`-prefixed references: `:+`/`:++`/`:+3` count forward
    /// anonymous labels, `:-`/`:-2` backward, and the `rts` flavors
    /// resolve against emitted `rts` instructions.
    fn resolve_anonymous(
        &mut self,
        spelling: &str,
        rest: &str,
        source: Option<SourceInfo>,
    ) -> Result<Expr> {
        if let Some(prefix) = rest.strip_suffix("rts") {
            let (forward, n) = match prefix {
                "" => (true, 1),
                _ if prefix.chars().all(|c| c == '>') => (true, prefix.len()),
                _ if prefix.chars().all(|c| c == '<') => (false, prefix.len()),
                _ => {
                    return Err(Error::Symbol(format!("Bad rts reference: {spelling}")));
                }
            };
            if forward {
                let idx = forward_slot(
                    &mut self.rts_forward,
                    &mut self.symbols,
                    self.scope,
                    n,
                    spelling,
                );
                self.symbols[idx].referenced = true;
                return Ok(index_ref(idx, source));
            }
            return match self.rts_reverse.len().checked_sub(n) {
                Some(i) => Ok(with_ref_source(self.rts_reverse[i].clone(), source)),
                None => Err(Error::Symbol(format!(
                    "Anonymous label not found: {spelling}"
                ))),
            };
        }
        let (sign, n) = parse_anon_count(rest)
            .ok_or_else(|| Error::Symbol(format!("Bad anonymous reference: {spelling}")))?;
        if sign {
            let idx = forward_slot(
                &mut self.anonymous_forward,
                &mut self.symbols,
                self.scope,
                n,
                spelling,
            );
            self.symbols[idx].referenced = true;
            Ok(index_ref(idx, source))
        } else {
            match self.anonymous_reverse.len().checked_sub(n) {
                Some(i) => Ok(with_ref_source(self.anonymous_reverse[i].clone(), source)),
                None => Err(Error::Symbol(format!(
                    "Anonymous label not found: {spelling}"
                ))),
            }
        }
    }

    /// A bare `+`/`-` run in an operand refers to the matching
    /// relative label by spelling.
    fn resolve_relative_ref(&mut self, spelling: &str, source: Option<SourceInfo>) -> Result<Expr> {
        if spelling.starts_with('+') {
            let idx = match self.relative_forward.get(spelling) {
                Some(&idx) => idx,
                None => {
                    let idx = self.new_symbol(Some(spelling.to_string()), false);
                    self.relative_forward.insert(spelling.to_string(), idx);
                    idx
                }
            };
            self.symbols[idx].referenced = true;
            Ok(index_ref(idx, source))
        } else {
            match self.relative_reverse.get(spelling) {
                Some(e) => Ok(with_ref_source(e.clone(), source)),
                None => Err(Error::Symbol(format!(
                    "Relative label not found: {spelling}"
                ))),
            }
        }
    }

    fn anonymous_label(&mut self) {
        let pc = self.pc_expr();
        if let Some(idx) = self.anonymous_forward.pop_front() {
            self.symbols[idx].expr = Some(pc.clone());
        }
        self.anonymous_reverse.push(pc);
    }

    fn relative_label(&mut self, spelling: &str) {
        let pc = self.pc_expr();
        if let Some(idx) = self.relative_forward.remove(spelling) {
            self.symbols[idx].expr = Some(pc.clone());
        }
        self.relative_reverse.insert(spelling.to_string(), pc);
    }

    fn rts_label(&mut self) {
        let pc = self.pc_expr();
        if let Some(idx) = self.rts_forward.pop_front() {
            self.symbols[idx].expr = Some(pc.clone());
        }
        self.rts_reverse.push(pc);
    }

    ////////////////////////////////////////////////////////////////
    // chunks and the program counter

    fn ensure_chunk(&mut self) -> usize {
        if let Some(i) = self.chunk {
            return i;
        }
        self.chunks.push(Chunk {
            name: Some(self.chunk_name.take().unwrap_or_else(|| "Code".to_string())),
            segments: self.segments.clone(),
            org: self.org,
            ..Chunk::default()
        });
        let i = self.chunks.len() - 1;
        self.chunk = Some(i);
        i
    }

    /// Program counter as an expression: relative to the open chunk,
    /// absolute once the chunk has an org.
    fn pc_expr(&mut self) -> Expr {
        let i = self.ensure_chunk();
        let chunk = &self.chunks[i];
        Expr {
            op: "num".to_string(),
            num: Some(chunk.data.len() as i64),
            meta: Some(Meta {
                rel: true,
                chunk: Some(i),
                org: chunk.org,
                ..Meta::default()
            }),
            ..Expr::default()
        }
    }

    /// Absolute program counter, when the current position is fixed.
    pub fn pc(&self) -> Option<i64> {
        match self.chunk {
            Some(i) => {
                let c = &self.chunks[i];
                c.org.map(|o| o + c.data.len() as i64)
            }
            None => self.org,
        }
    }

    /// Fixes the origin of subsequent output.  Writing straight past
    /// the end of the current chunk extends it instead of starting a
    /// new one.
    pub fn org(&mut self, addr: i64, name: Option<String>) {
        if name.is_none() {
            if let Some(i) = self.chunk {
                let c = &self.chunks[i];
                if c.org.map_or(false, |o| o + c.data.len() as i64 == addr) {
                    return;
                }
            }
        }
        self.chunk = None;
        self.org = Some(addr);
        self.chunk_name = name;
    }

    /// `* = expr` spelling of [`Assembler::org`].
    pub fn assign_pc(&mut self, addr: i64) {
        self.org(addr, None);
    }

    /// Makes subsequent output relocatable.
    pub fn reloc(&mut self, name: Option<String>) {
        self.chunk = None;
        self.org = None;
        self.chunk_name = name;
    }

    fn emit(&mut self, bytes: &[u8]) {
        let i = self.ensure_chunk();
        self.chunks[i].data.extend_from_slice(bytes);
    }

    fn emit_sub(&mut self, size: u32, expr: Expr) {
        let i = self.ensure_chunk();
        let offset = self.chunks[i].data.len();
        self.chunks[i]
            .data
            .extend(std::iter::repeat(0xff).take(size as usize));
        self.chunks[i].subs.push(Substitution { offset, size, expr });
    }

    /// Emits an operand value: directly when absolute, as placeholder
    /// bytes and a substitution otherwise.
    fn emit_value(&mut self, expr: Expr, size: u32) {
        match expr.abs_value() {
            Some(v) => {
                let bytes = [(v & 0xff) as u8, ((v >> 8) & 0xff) as u8];
                self.emit(&bytes[..size as usize]);
            }
            None => self.emit_sub(size, expr),
        }
    }

    ////////////////////////////////////////////////////////////////
    // segments

    pub fn segment(&mut self, names: &[&str]) {
        let names = names
            .iter()
            .map(|n| format!("{}{n}", self.segment_prefix))
            .collect();
        self.set_segments(names);
    }

    fn set_segments(&mut self, names: Vec<String>) {
        self.segments = names;
        self.chunk = None;
        self.org = None;
        self.chunk_name = None;
    }

    pub fn push_seg(&mut self, names: Option<Vec<String>>) {
        self.segment_stack
            .push((self.segments.clone(), self.chunk, self.org));
        if let Some(names) = names {
            self.set_segments(names);
        }
    }

    pub fn pop_seg(&mut self) -> Result<()> {
        let Some((segments, chunk, org)) = self.segment_stack.pop() else {
            return Err(Error::Syntax(".popseg without .pushseg".to_string()));
        };
        self.segments = segments;
        self.chunk = chunk;
        self.org = org;
        Ok(())
    }

    fn merge_segment(&mut self, seg: Segment) {
        let merged = match self.segment_data.get(&seg.name) {
            Some(prev) => Segment::merge(prev, &seg),
            None => seg,
        };
        self.segment_data.insert(merged.name.clone(), merged);
    }

    /// Donates `[PC, PC+size)` to the linker's free list for the
    /// active segment, and skips the program counter past it.
    pub fn free(&mut self, size: i64, source: Option<&SourceInfo>) -> Result<()> {
        let Some(pc) = self.pc() else {
            return Err(Error::Layout(format!(
                ".free requires a fixed address{}",
                token::at(source)
            )));
        };
        if self.segments.len() != 1 {
            return Err(Error::Layout(format!(
                ".free needs a single active segment{}",
                token::at(source)
            )));
        }
        let mut seg = Segment::new(&self.segments[0]);
        seg.free.push((pc, pc + size));
        self.merge_segment(seg);
        self.chunk = None;
        self.org = Some(pc + size);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////
    // directives

    fn directive(&mut self, line: &[Token]) -> Result<()> {
        let cs = &line[0];
        let Some(name) = cs.cs_name() else {
            return Err(Error::Syntax(format!("Unexpected: {}", cs.name_at())));
        };
        match name {
            ".org" => {
                let (expr, i) = expr::parse(line, 1)?;
                let addr = self.const_value(expr)?;
                let name = optional_name(line, i)?;
                self.org(addr, name);
                Ok(())
            }
            ".reloc" => {
                let name = match line.get(1) {
                    Some(t) => Some(token::expect_string(Some(t), Some(cs))?),
                    None => None,
                };
                token::expect_eol(line.get(2), "end of line")?;
                self.reloc(name);
                Ok(())
            }
            ".segment" => {
                let names = self.parse_segment_args(line)?;
                self.set_segments(names);
                Ok(())
            }
            ".pushseg" => {
                let names = if line.len() > 1 {
                    Some(self.parse_segment_args(line)?)
                } else {
                    None
                };
                self.push_seg(names);
                Ok(())
            }
            ".popseg" => {
                token::expect_eol(line.get(1), "end of line")?;
                self.pop_seg()
            }
            ".segmentprefix" => {
                self.segment_prefix = token::expect_string(line.get(1), Some(cs))?;
                token::expect_eol(line.get(2), "end of line")?;
                Ok(())
            }
            ".byte" => self.byte_line(line),
            ".word" => self.word_line(line),
            ".res" => {
                let (expr, i) = expr::parse(line, 1)?;
                let count = self.const_value(expr)?;
                let fill = if i < line.len() {
                    token::expect(&Token::op(","), line.get(i), Some(cs))?;
                    let (expr, j) = expr::parse(line, i + 1)?;
                    token::expect_eol(line.get(j), "end of line")?;
                    self.const_value(expr)?
                } else {
                    0
                };
                self.emit(&vec![(fill & 0xff) as u8; count.max(0) as usize]);
                Ok(())
            }
            ".free" => {
                let (expr, i) = expr::parse(line, 1)?;
                token::expect_eol(line.get(i), "end of line")?;
                let size = self.const_value(expr)?;
                self.free(size, cs.source.as_ref())
            }
            ".assert" => {
                let expr = expr::parse_only(&line[1..])?;
                let resolved = self.resolve_expr(&expr)?;
                match resolved.abs_value() {
                    Some(0) => Err(Error::Assertion(format!(
                        "Assertion failed{}",
                        cs.at()
                    ))),
                    Some(_) => Ok(()),
                    None => {
                        let i = self.ensure_chunk();
                        self.chunks[i].asserts.push(resolved);
                        Ok(())
                    }
                }
            }
            ".import" => {
                for name in ident_list(&line[1..])? {
                    self.import(&name)?;
                }
                Ok(())
            }
            ".export" => {
                for name in ident_list(&line[1..])? {
                    self.export(&name)?;
                }
                Ok(())
            }
            ".scope" => {
                let name = match line.get(1) {
                    Some(t) => Some(token::expect_identifier(Some(t), Some(cs))?),
                    None => None,
                };
                token::expect_eol(line.get(2), "end of line")?;
                self.enter_scope(name.as_deref(), false);
                Ok(())
            }
            ".endscope" => {
                token::expect_eol(line.get(1), "end of line")?;
                self.exit_scope(false, cs)
            }
            ".proc" => {
                let name = token::expect_identifier(line.get(1), Some(cs))?;
                token::expect_eol(line.get(2), "end of line")?;
                self.label(&name, cs.source.clone())?;
                self.enter_scope(Some(&name), true);
                Ok(())
            }
            ".endproc" => {
                token::expect_eol(line.get(1), "end of line")?;
                self.exit_scope(true, cs)
            }
            ".move" => {
                let (count_expr, i) = expr::parse(line, 1)?;
                let count = self.const_value(count_expr)?;
                token::expect(&Token::op(","), line.get(i), Some(cs))?;
                let addr = expr::parse_only(&line[i + 1..])?;
                let addr = self.resolve_expr(&addr)?;
                let source = addr.source.clone();
                self.emit_sub(
                    count.max(0) as u32,
                    Expr {
                        op: ".move".to_string(),
                        args: vec![addr],
                        num: Some(count),
                        source,
                        ..Expr::default()
                    },
                );
                Ok(())
            }
            ".error" => {
                let msg = token::expect_string(line.get(1), Some(cs))?;
                Err(Error::Syntax(format!("{msg}{}", cs.at())))
            }
            ".warning" => {
                let msg = token::expect_string(line.get(1), Some(cs))?;
                warn!("{msg}{}", cs.at());
                Ok(())
            }
            ".out" => {
                let msg = token::expect_string(line.get(1), Some(cs))?;
                info!("{msg}");
                Ok(())
            }
            _ => Err(Error::Syntax(format!(
                "Unknown directive: {}",
                cs.name_at()
            ))),
        }
    }

    /// `.segment "name" [:attr value ...][, "name" ...]`
    fn parse_segment_args(&mut self, line: &[Token]) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for arg in token::parse_arg_list(line, 1, line.len())? {
            let name = token::expect_string(arg.first(), line.first())?;
            let name = format!("{}{name}", self.segment_prefix);
            if arg.len() > 1 {
                let seg = self.segment_from_attrs(&name, &arg)?;
                self.merge_segment(seg);
            }
            names.push(name);
        }
        if names.is_empty() {
            return Err(Error::Syntax(format!(
                "Expected a segment name: {}",
                token::name_at(line.first())
            )));
        }
        Ok(names)
    }

    fn segment_from_attrs(&mut self, name: &str, arg: &[Token]) -> Result<Segment> {
        let mut seg = Segment::new(name);
        for (key, value) in token::parse_attr_list(arg, 1)? {
            if key == "default" {
                token::expect_eol(value.first(), "no attribute value")?;
                seg.default = true;
                continue;
            }
            let expr = expr::parse_only(&value)?;
            let num = self.const_value(expr)?;
            match key.as_str() {
                "bank" => seg.bank = Some(num),
                "size" => seg.size = Some(num),
                "offset" => seg.offset = Some(num),
                "memory" => seg.memory = Some(num),
                "addressing" => seg.addressing = Some(num),
                "fill" => seg.fill = Some(num),
                "out" => seg.out = Some(num != 0),
                _ => {
                    return Err(Error::Syntax(format!(
                        "Unknown segment attribute: {key}"
                    )))
                }
            }
        }
        Ok(seg)
    }

    fn byte_line(&mut self, line: &[Token]) -> Result<()> {
        for arg in token::parse_arg_list(line, 1, line.len())? {
            if let [Token {
                kind: TokenKind::Str(s),
                ..
            }] = arg.as_slice()
            {
                let bytes: Vec<u8> = s.chars().map(|c| (c as u32 & 0xff) as u8).collect();
                self.emit(&bytes);
                continue;
            }
            let expr = expr::parse_only(&arg)?;
            let resolved = self.resolve_expr(&expr)?;
            self.emit_value(resolved, 1);
        }
        Ok(())
    }

    fn word_line(&mut self, line: &[Token]) -> Result<()> {
        for arg in token::parse_arg_list(line, 1, line.len())? {
            let expr = expr::parse_only(&arg)?;
            let resolved = self.resolve_expr(&expr)?;
            self.emit_value(resolved, 2);
        }
        Ok(())
    }

    pub fn byte(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }

    pub fn word(&mut self, words: &[u16]) {
        for w in words {
            self.emit(&w.to_le_bytes());
        }
    }

    fn enter_scope(&mut self, name: Option<&str>, proc: bool) {
        let child = match name.and_then(|n| self.scopes[self.scope].children.get(n)) {
            Some(&c) => c,
            None => {
                self.scopes.push(Scope {
                    parent: Some(self.scope),
                    proc,
                    ..Scope::default()
                });
                let c = self.scopes.len() - 1;
                if let Some(n) = name {
                    self.scopes[self.scope].children.insert(n.to_string(), c);
                }
                c
            }
        };
        self.scope = child;
    }

    fn exit_scope(&mut self, proc: bool, cs: &Token) -> Result<()> {
        let opener = if proc { ".proc" } else { ".scope" };
        if self.scopes[self.scope].parent.is_none() || self.scopes[self.scope].proc != proc {
            return Err(Error::Syntax(format!(
                "{} without {opener}{}",
                cs.name(),
                cs.at()
            )));
        }
        self.scope = self.scopes[self.scope].parent.unwrap_or(0);
        Ok(())
    }

    fn const_value(&mut self, expr: Expr) -> Result<i64> {
        let resolved = self.resolve_expr(&expr)?;
        resolved.abs_value().ok_or_else(|| {
            Error::Eval(format!(
                "Expected a constant: {}{}",
                resolved.op,
                token::at(resolved.source.as_ref())
            ))
        })
    }

    ////////////////////////////////////////////////////////////////
    // instructions

    fn instruction(&mut self, line: &[Token]) -> Result<()> {
        let Some(name) = line[0].ident_name() else {
            return Err(Error::Syntax(format!("Unexpected: {}", line[0].name_at())));
        };
        let Some(row) = cpu::lookup(name) else {
            return Err(Error::Syntax(format!("Bad mnemonic: {}", line[0].name_at())));
        };
        let mnemonic = name.to_lowercase();
        let args = &line[1..];

        // implied / accumulator
        if args.is_empty() || (args.len() == 1 && args[0].is_register('a')) {
            let op = self.mode_opcode(row, Addr::IMP, &mnemonic, &line[0])?;
            if mnemonic == "rts" {
                self.rts_label();
            }
            self.emit(&[op]);
            return Ok(());
        }

        // immediate
        if args[0].is_op("#") {
            let expr = expr::parse_only(&args[1..])?;
            let resolved = self.resolve_expr(&expr)?;
            let op = self.mode_opcode(row, Addr::IMM, &mnemonic, &line[0])?;
            self.emit(&[op]);
            self.emit_value(resolved, 1);
            return Ok(());
        }

        // bare relative-label reference
        if args.len() == 1 {
            if let TokenKind::Op(op) = &args[0].kind {
                if is_relative_spelling(op) {
                    let op = op.clone();
                    let target = self.resolve_relative_ref(&op, args[0].source.clone())?;
                    return self.encode_operand(row, &mnemonic, None, target, None, &line[0]);
                }
            }
        }

        // indirect forms
        if matches!(args[0].kind, TokenKind::LParen) {
            return self.indirect(row, &mnemonic, args, &line[0]);
        }

        // optional width override
        let (force, rest) = if args.len() >= 2 && args[1].is_op(":") && args[0].is_register('z') {
            (Some(1), &args[2..])
        } else if args.len() >= 2 && args[1].is_op(":") && args[0].is_register('a') {
            (Some(2), &args[2..])
        } else {
            (None, args)
        };

        let (expr, i) = expr::parse(rest, 0)?;
        let target = self.resolve_expr(&expr)?;
        let index = if i < rest.len() {
            token::expect(&Token::op(","), rest.get(i), line.first())?;
            let reg = rest
                .get(i + 1)
                .ok_or_else(|| Error::Syntax(format!("Expected x or y{}", line[0].at())))?;
            token::expect_eol(rest.get(i + 2), "end of line")?;
            if reg.is_register('x') {
                Some('x')
            } else if reg.is_register('y') {
                Some('y')
            } else {
                return Err(Error::Syntax(format!("Bad operand: {}", reg.name_at())));
            }
        } else {
            None
        };
        self.encode_operand(row, &mnemonic, index, target, force, &line[0])
    }

    /// `(expr,x)`, `(expr),y`, and `(expr)` operands.
    fn indirect(
        &mut self,
        row: &'static [u8; 12],
        mnemonic: &str,
        args: &[Token],
        at: &Token,
    ) -> Result<()> {
        let close = token::find_balanced(args, 0)
            .ok_or_else(|| Error::Syntax(format!("No close paren: {}", args[0].name_at())))?;
        let inner = &args[1..close];
        let comma = token::find_comma(inner, 0);
        if comma < inner.len() {
            // (expr,x)
            let reg = inner
                .get(comma + 1)
                .ok_or_else(|| Error::Syntax(format!("Expected x{}", at.at())))?;
            if !reg.is_register('x') {
                return Err(Error::Syntax(format!("Bad operand: {}", reg.name_at())));
            }
            token::expect_eol(inner.get(comma + 2), "close paren")?;
            token::expect_eol(args.get(close + 1), "end of line")?;
            let expr = expr::parse_only(&inner[..comma])?;
            let target = self.resolve_expr(&expr)?;
            let op = self.mode_opcode(row, Addr::INX, mnemonic, at)?;
            self.emit(&[op]);
            self.emit_value(target, 1);
            return Ok(());
        }
        let expr = expr::parse_only(inner)?;
        let target = self.resolve_expr(&expr)?;
        if close == args.len() - 1 {
            // (expr)
            let op = self.mode_opcode(row, Addr::IND, mnemonic, at)?;
            self.emit(&[op]);
            self.emit_value(target, 2);
            return Ok(());
        }
        // (expr),y
        token::expect(&Token::op(","), args.get(close + 1), Some(at))?;
        let reg = args
            .get(close + 2)
            .ok_or_else(|| Error::Syntax(format!("Expected y{}", at.at())))?;
        if !reg.is_register('y') {
            return Err(Error::Syntax(format!("Bad operand: {}", reg.name_at())));
        }
        token::expect_eol(args.get(close + 3), "end of line")?;
        let op = self.mode_opcode(row, Addr::INY, mnemonic, at)?;
        self.emit(&[op]);
        self.emit_value(target, 1);
        Ok(())
    }

    /// Direct and indexed operands, including branches.
    fn encode_operand(
        &mut self,
        row: &'static [u8; 12],
        mnemonic: &str,
        index: Option<char>,
        target: Expr,
        force: Option<u32>,
        at: &Token,
    ) -> Result<()> {
        if index.is_none() && cpu::is_relative(row) {
            return self.branch(row, mnemonic, target, at);
        }
        let (zp, abs) = match index {
            None => (Addr::ZPG, Addr::ABS),
            Some('x') => (Addr::ZPX, Addr::ABX),
            _ => (Addr::ZPY, Addr::ABY),
        };
        // width follows the operand's size hint so that `$0023` stays
        // absolute; a narrow hint only helps when the mode exists
        let width = match force {
            Some(w) => w,
            None if target.size() == Some(1) && cpu::opcode(row, zp).is_some() => 1,
            None => 2,
        };
        let addr = if width == 1 { zp } else { abs };
        let op = self.mode_opcode(row, addr, mnemonic, at)?;
        self.emit(&[op]);
        self.emit_value(target, width);
        Ok(())
    }

    /// Branches encode a one-byte pc-relative displacement, deferred
    /// as `target - pc_after` when the target is not yet known.
    fn branch(
        &mut self,
        row: &'static [u8; 12],
        mnemonic: &str,
        target: Expr,
        at: &Token,
    ) -> Result<()> {
        let op = self.mode_opcode(row, Addr::REL, mnemonic, at)?;
        let mut after = self.pc_expr();
        after.num = after.num.map(|n| n + 2);
        let source = target.source.clone();
        let delta = expr::evaluate_deep(&Expr {
            op: "-".to_string(),
            args: vec![target, after],
            source,
            ..Expr::default()
        })?;
        self.emit(&[op]);
        match delta.abs_value() {
            Some(d) => {
                if !(-128..=127).contains(&d) {
                    return Err(Error::Layout(format!(
                        "Branch out of range ({d}): {mnemonic}{}",
                        at.at()
                    )));
                }
                self.emit(&[(d as i8) as u8]);
            }
            None => self.emit_sub(1, delta),
        }
        Ok(())
    }

    fn mode_opcode(
        &self,
        row: &'static [u8; 12],
        addr: Addr,
        mnemonic: &str,
        at: &Token,
    ) -> Result<u8> {
        cpu::opcode(row, addr).ok_or_else(|| {
            Error::Syntax(format!(
                "Bad address mode {} for {mnemonic}{}",
                mode_name(addr),
                at.at()
            ))
        })
    }

    ////////////////////////////////////////////////////////////////
    // module emission

    /// Closes out assembly and snapshots the module: forward symbols
    /// fall back to ancestor scopes, symbols that must travel get
    /// dense ids, and every index reference is renumbered.
    pub fn module(&mut self) -> Result<Module> {
        self.flush_cheap()?;
        // fill remaining forwards from ancestor scopes
        for idx in 0..self.symbols.len() {
            if self.symbols[idx].expr.is_some() {
                continue;
            }
            let filled = self.symbols[idx].chain.then(|| self.fill_from_chain(idx)).flatten();
            match filled {
                Some(parent) => {
                    self.symbols[idx].expr = Some(index_ref(parent, None));
                    self.symbols[parent].referenced = true;
                }
                None => {
                    let name = self.symbols[idx].name.clone().unwrap_or_default();
                    return Err(Error::Symbol(format!("Symbol never defined: {name}")));
                }
            }
        }
        // transitive closure of everything referenced across the
        // module boundary
        let mut needed = vec![false; self.symbols.len()];
        for (idx, sym) in self.symbols.iter().enumerate() {
            if sym.export {
                needed[idx] = true;
            }
        }
        let mut work: Vec<usize> = needed
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.then_some(i))
            .collect();
        for chunk in &self.chunks {
            for sub in &chunk.subs {
                mark_refs(&sub.expr, &mut needed, &mut work);
            }
            for assert in &chunk.asserts {
                mark_refs(assert, &mut needed, &mut work);
            }
        }
        while let Some(idx) = work.pop() {
            if let Some(e) = &self.symbols[idx].expr {
                let mut more = Vec::new();
                mark_refs(e, &mut needed, &mut more);
                work.extend(more);
            }
        }
        // dense ids in table order
        let mut ids = vec![None; self.symbols.len()];
        let mut next = 0;
        for (idx, keep) in needed.iter().enumerate() {
            if *keep {
                ids[idx] = Some(next);
                next += 1;
            }
        }
        let mut chunks = self.chunks.clone();
        for chunk in &mut chunks {
            for sub in &mut chunk.subs {
                renumber(&mut sub.expr, &ids)?;
            }
            for assert in &mut chunk.asserts {
                renumber(assert, &ids)?;
            }
        }
        let mut symbols = Vec::new();
        for (idx, sym) in self.symbols.iter().enumerate() {
            if !needed[idx] {
                continue;
            }
            let mut expr = sym.expr.clone();
            if let Some(e) = &mut expr {
                renumber(e, &ids)?;
            }
            symbols.push(Symbol {
                export: sym.export.then(|| sym.name.clone().unwrap_or_default()),
                expr,
            });
        }
        Ok(Module {
            name: None,
            chunks,
            symbols,
            segments: self.segment_data.values().cloned().collect(),
        })
    }

    fn fill_from_chain(&self, idx: usize) -> Option<usize> {
        let name = self.symbols[idx].name.as_deref()?;
        let mut cur = self.scopes[self.symbols[idx].scope].parent;
        while let Some(s) = cur {
            if let Some(&found) = self.scopes[s].symbols.get(name) {
                return Some(found);
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    ////////////////////////////////////////////////////////////////
    // environment queries

    /// Immutable chain lookup; never creates forward symbols.
    fn query(&self, name: &str) -> Option<usize> {
        if name.starts_with('@') {
            return self.cheap.get(name).copied();
        }
        if name.contains("::") {
            let (scope, last) = self.resolve_scope_path(name).ok()?;
            return self.scopes[scope].symbols.get(&last).copied();
        }
        let mut cur = Some(self.scope);
        while let Some(s) = cur {
            if let Some(&idx) = self.scopes[s].symbols.get(name) {
                return Some(idx);
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    /// Folds an expression to an absolute value using only what is
    /// known right now.
    fn resolve_const(&self, expr: &Expr, depth: usize) -> Option<Expr> {
        if depth > 64 {
            return None;
        }
        let mut e = expr.clone();
        e.args = e
            .args
            .iter()
            .map(|a| self.resolve_const(a, depth + 1))
            .collect::<Option<Vec<_>>>()?;
        if e.op == "sym" {
            let target = match (&e.sym, e.num) {
                (Some(name), _) => self.query(name)?,
                (None, Some(idx)) => idx as usize,
                _ => return None,
            };
            let inner = self.symbols.get(target)?.expr.as_ref()?;
            return self.resolve_const(inner, depth + 1);
        }
        expr::evaluate(e).ok()
    }
}

impl Env for Assembler {
    fn defined_symbol(&self, name: &str) -> bool {
        self.query(name)
            .map_or(false, |idx| self.symbols[idx].expr.is_some())
    }

    fn constant_symbol(&self, name: &str) -> bool {
        self.query(name)
            .and_then(|idx| self.symbols[idx].expr.as_ref())
            .and_then(|e| self.resolve_const(e, 0))
            .and_then(|e| e.abs_value())
            .is_some()
    }

    fn referenced_symbol(&self, name: &str) -> bool {
        self.query(name)
            .map_or(false, |idx| self.symbols[idx].referenced)
    }

    fn evaluate(&self, expr: &Expr) -> Option<i64> {
        self.resolve_const(expr, 0)?.abs_value()
    }

    fn assign_line(&mut self, line: &[Token]) -> Result<()> {
        let name = token::expect_identifier(line.first(), None)?;
        let expr = expr::parse_only(&line[2..])?;
        self.assign_expr(&name, expr)
    }

    fn set_line(&mut self, line: &[Token]) -> Result<()> {
        let name = token::expect_identifier(line.first(), None)?;
        let expr = expr::parse_only(&line[2..])?;
        self.set_expr(&name, expr)
    }
}

fn optional_name(line: &[Token], i: usize) -> Result<Option<String>> {
    if i >= line.len() {
        return Ok(None);
    }
    token::expect(&Token::op(","), line.get(i), line.first())?;
    let name = token::expect_string(line.get(i + 1), line.get(i))?;
    token::expect_eol(line.get(i + 2), "end of line")?;
    Ok(Some(name))
}

/// Comma-separated identifier lists, as in `.import a, b`.
fn ident_list(tokens: &[Token]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for arg in token::parse_arg_list(tokens, 0, tokens.len())? {
        names.push(token::expect_identifier(arg.first(), None)?);
        token::expect_eol(arg.get(1), "a single name")?;
    }
    Ok(names)
}

fn is_relative_spelling(op: &str) -> bool {
    !op.is_empty() && (op.chars().all(|c| c == '+') || op.chars().all(|c| c == '-'))
}

/// `+`/`-` runs and digit forms after a `:` prefix: `++` is
/// (true, 2), `-3` is (false, 3).
fn parse_anon_count(rest: &str) -> Option<(bool, usize)> {
    let mut chars = rest.chars();
    let first = chars.next()?;
    let forward = match first {
        '+' => true,
        '-' => false,
        _ => return None,
    };
    let tail: String = chars.collect();
    if tail.is_empty() {
        return Some((forward, 1));
    }
    if tail.chars().all(|c| c == first) {
        return Some((forward, tail.len() + 1));
    }
    tail.parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .map(|n| (forward, n))
}

/// Reference to a symbol by flat table index.
fn index_ref(idx: usize, source: Option<SourceInfo>) -> Expr {
    Expr {
        op: "sym".to_string(),
        num: Some(idx as i64),
        source,
        ..Expr::default()
    }
}

fn with_ref_source(mut expr: Expr, source: Option<SourceInfo>) -> Expr {
    if expr.source.is_none() {
        expr.source = source;
    }
    expr
}

fn forward_slot(
    queue: &mut VecDeque<usize>,
    symbols: &mut Vec<Sym>,
    scope: usize,
    n: usize,
    spelling: &str,
) -> usize {
    while queue.len() < n {
        symbols.push(Sym {
            name: Some(spelling.to_string()),
            scope,
            ..Sym::default()
        });
        queue.push_back(symbols.len() - 1);
    }
    queue[n - 1]
}

fn mode_name(addr: Addr) -> &'static str {
    const NAMES: [&str; 12] = [
        "imp", "imm", "zpg", "zpx", "zpy", "abs", "abx", "aby", "ind", "inx", "iny", "rel",
    ];
    NAMES[addr.0 as usize]
}

/// Marks flat-index references in an expression tree.
fn mark_refs(expr: &Expr, needed: &mut [bool], work: &mut Vec<usize>) {
    for arg in &expr.args {
        mark_refs(arg, needed, work);
    }
    if expr.op == "sym" && expr.sym.is_none() {
        if let Some(idx) = expr.num {
            let idx = idx as usize;
            if idx < needed.len() && !needed[idx] {
                needed[idx] = true;
                work.push(idx);
            }
        }
    }
}

/// Rewrites flat-index references to their dense module-file ids.
fn renumber(expr: &mut Expr, ids: &[Option<usize>]) -> Result<()> {
    for arg in &mut expr.args {
        renumber(arg, ids)?;
    }
    if expr.op == "sym" {
        if let Some(name) = &expr.sym {
            return Err(Error::Symbol(format!("Symbol never resolved: {name}")));
        }
        let idx = expr.num.unwrap_or(-1);
        let new = usize::try_from(idx)
            .ok()
            .and_then(|i| ids.get(i).copied())
            .flatten();
        match new {
            Some(n) => expr.num = Some(n as i64),
            None => {
                return Err(Error::Symbol(format!(
                    "Symbol reference escaped renumbering: {idx}"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::{assemble_source, SourceOptions};

    fn assemble(text: &str) -> Module {
        let host = MemHost::new();
        assemble_source(&host, text, "test.s", &SourceOptions::default()).unwrap()
    }

    fn assemble_err(text: &str) -> String {
        let host = MemHost::new();
        assemble_source(&host, text, "test.s", &SourceOptions::default())
            .unwrap_err()
            .to_string()
    }

    fn data(text: &str) -> Vec<u8> {
        let module = assemble(text);
        assert_eq!(module.chunks.len(), 1, "{module:?}");
        module.chunks[0].data.clone()
    }

    #[test]
    fn encodes_simple_instructions() {
        assert_eq!(data("lda #$03"), vec![0xa9, 0x03]);
        assert_eq!(data("rts"), vec![0x60]);
        assert_eq!(data("asl"), vec![0x0a]);
        assert_eq!(data("asl a"), vec![0x0a]);
        assert_eq!(data("lda ($24,x)"), vec![0xa1, 0x24]);
        assert_eq!(data("lda ($24),y"), vec![0xb1, 0x24]);
        assert_eq!(data("jmp ($1234)"), vec![0x6c, 0x34, 0x12]);
        assert_eq!(data("lda $12,x"), vec![0xb5, 0x12]);
        assert_eq!(data("ldx $12,y"), vec![0xb6, 0x12]);
        assert_eq!(data("lda $1234,y"), vec![0xb9, 0x34, 0x12]);
    }

    #[test]
    fn default_chunk_uses_the_code_segment() {
        let module = assemble("rts");
        assert_eq!(module.chunks[0].segments, vec!["code"]);
        assert_eq!(module.chunks[0].name.as_deref(), Some("Code"));
        assert_eq!(module.chunks[0].org, None);
    }

    #[test]
    fn known_small_operands_choose_zero_page() {
        assert_eq!(data("val = $23\nlda val"), vec![0xa5, 0x23]);
        assert_eq!(data("lda $0023"), vec![0xad, 0x23, 0x00]);
        assert_eq!(data("lda $323"), vec![0xad, 0x23, 0x03]);
        // auto-widen when the narrow mode does not exist
        assert_eq!(data("lda $12,y"), vec![0xb9, 0x12, 0x00]);
    }

    #[test]
    fn width_overrides_force_the_mode() {
        assert_eq!(data("lda a:$23"), vec![0xad, 0x23, 0x00]);
        assert_eq!(
            data("val = $23\nlda z:val,x"),
            vec![0xb5, 0x23]
        );
        let err = assemble_err("lda z:$12,y");
        assert!(err.contains("Bad address mode zpy for lda"), "{err}");
        let err = assemble_err("jmp z:$12");
        assert!(err.contains("Bad address mode zpg for jmp"), "{err}");
    }

    #[test]
    fn forward_reference_emits_placeholder_and_substitution() {
        let module = assemble("lda val\nval = $23");
        let chunk = &module.chunks[0];
        assert_eq!(chunk.data, vec![0xad, 0xff, 0xff]);
        assert_eq!(chunk.subs.len(), 1);
        assert_eq!(chunk.subs[0].offset, 1);
        assert_eq!(chunk.subs[0].size, 2);
        assert_eq!(chunk.subs[0].expr.op, "sym");
        let id = chunk.subs[0].expr.num.unwrap() as usize;
        assert_eq!(module.symbols[id].expr.as_ref().unwrap().num, Some(0x23));
    }

    #[test]
    fn forward_immediate_is_one_placeholder_byte() {
        let module = assemble("lda #foo\nfoo = 5");
        assert_eq!(module.chunks[0].data, vec![0xa9, 0xff]);
        assert_eq!(module.chunks[0].subs[0].size, 1);
    }

    #[test]
    fn backward_branches_fold_to_displacements() {
        assert_eq!(data("loop:\ndex\nbne loop"), vec![0xca, 0xd0, 0xfd]);
    }

    #[test]
    fn forward_branches_defer_a_delta() {
        let module = assemble("bne skip\nrts\nskip:\nrts");
        let chunk = &module.chunks[0];
        assert_eq!(chunk.data, vec![0xd0, 0xff, 0x60, 0x60]);
        let sub = &chunk.subs[0];
        assert_eq!((sub.offset, sub.size), (1, 1));
        assert_eq!(sub.expr.op, "-");
        // the target symbol resolved to offset 3 of this chunk
        let id = sub.expr.args[0].num.unwrap() as usize;
        let target = module.symbols[id].expr.as_ref().unwrap();
        assert_eq!(target.num, Some(3));
        assert!(target.meta.unwrap().rel);
    }

    #[test]
    fn branch_distance_is_checked_when_known() {
        let mut text = String::from("back:\n");
        for _ in 0..100 {
            text.push_str("nop\n");
        }
        text.push_str("bne back");
        let err = assemble_err(&text);
        assert!(err.contains("Branch out of range"), "{err}");
    }

    #[test]
    fn anonymous_labels_resolve_positionally() {
        assert_eq!(data(": lda #1\nbne :-"), vec![0xa9, 0x01, 0xd0, 0xfc]);
        let module = assemble("bne :+\nrts\n: rts");
        assert_eq!(module.chunks[0].data, vec![0xd0, 0xff, 0x60, 0x60]);
        assert_eq!(module.chunks[0].subs.len(), 1);
        let err = assemble_err("bne :-");
        assert!(err.contains("Anonymous label not found: :-"), "{err}");
        let err = assemble_err("bne :+");
        assert!(err.contains("Symbol never defined: :+"), "{err}");
    }

    #[test]
    fn rts_references_bind_to_emitted_rts() {
        assert_eq!(data("rts\nbne :<rts"), vec![0x60, 0xd0, 0xfd]);
        let module = assemble("jmp :rts\nrts");
        assert_eq!(module.chunks[0].data, vec![0x4c, 0xff, 0xff, 0x60]);
        let id = module.chunks[0].subs[0].expr.num.unwrap() as usize;
        assert_eq!(module.symbols[id].expr.as_ref().unwrap().num, Some(3));
        // :<<rts reaches past the nearest one
        assert_eq!(
            data("rts\nrts\nbne :<<rts"),
            vec![0x60, 0x60, 0xd0, 0xfc]
        );
    }

    #[test]
    fn relative_labels_match_by_spelling() {
        assert_eq!(data("- rts\nbne -"), vec![0x60, 0xd0, 0xfd]);
        let module = assemble("bne +\nrts\n+ rts");
        assert_eq!(module.chunks[0].data, vec![0xd0, 0xff, 0x60, 0x60]);
        // ++ and + are distinct labels
        let module = assemble("bne ++\nbne +\n+ rts\n++ rts");
        assert_eq!(module.chunks[0].data[4], 0x60);
        let err = assemble_err("bne -");
        assert!(err.contains("Relative label not found: -"), "{err}");
    }

    #[test]
    fn cheap_locals_live_between_labels() {
        let module = assemble(
            "first:\n@loop:\ndex\nbne @loop\nsecond:\n@loop:\niny\nbne @loop",
        );
        assert_eq!(
            module.chunks[0].data,
            vec![0xca, 0xd0, 0xfd, 0xc8, 0xd0, 0xfd]
        );
    }

    #[test]
    fn cheap_local_errors() {
        let err = assemble_err("lda @x\nnext:");
        assert!(err.contains("Cheap local label never defined: @x"), "{err}");
        let err = assemble_err("@x = 1");
        assert!(err.contains("Cheap locals may only be labels: @x"), "{err}");
        let err = assemble_err("lda @x");
        assert!(err.contains("Cheap local label never defined: @x"), "{err}");
    }

    #[test]
    fn redefinition_is_rejected() {
        assert!(assemble_err("foo = 1\nfoo = 2").contains("Redefining symbol foo"));
        assert!(assemble_err("foo:\nfoo:").contains("Redefining symbol foo"));
        // .set may be reassigned, = may not follow .set
        assert_eq!(data("foo .set 1\nfoo .set foo + 1\nlda #foo"), vec![0xa9, 0x02]);
    }

    #[test]
    fn scopes_nest_and_qualify() {
        assert_eq!(
            data(".scope a\nfoo = $12\n.endscope\nlda a::foo"),
            vec![0xa5, 0x12]
        );
        assert_eq!(
            data(".scope a\n.scope b\nfoo = 7\n.endscope\n.endscope\nlda #a::b::foo"),
            vec![0xa9, 0x07]
        );
        assert_eq!(
            data("foo = 3\n.scope a\nbar = ::foo\n.endscope\nlda #a::bar"),
            vec![0xa9, 0x03]
        );
        let err = assemble_err("lda b::x");
        assert!(err.contains("Could not resolve scope b"), "{err}");
    }

    #[test]
    fn inner_scopes_fall_back_to_ancestors_at_module_time() {
        // the reference stays open inside the scope and aliases the
        // outer definition when the module closes
        let module = assemble("foo = $12\n.scope a\nlda foo\n.endscope");
        assert_eq!(module.chunks[0].data, vec![0xa5, 0xff]);
        let id = module.chunks[0].subs[0].expr.num.unwrap() as usize;
        let alias = module.symbols[id].expr.as_ref().unwrap();
        assert_eq!(alias.op, "sym");
        let outer = alias.num.unwrap() as usize;
        assert_eq!(module.symbols[outer].expr.as_ref().unwrap().num, Some(0x12));
        // also works when the definition comes after the scope closes
        let module = assemble(".scope a\nlda foo\n.endscope\nfoo = $34");
        assert_eq!(module.chunks[0].data, vec![0xad, 0xff, 0xff]);
    }

    #[test]
    fn shadowing_prefers_the_local_definition() {
        assert_eq!(
            data("foo = $12\n.scope a\nlda foo\nfoo = $34\n.endscope"),
            vec![0xa5, 0xff]
        );
        let module = assemble("foo = $12\n.scope a\nlda foo\nfoo = $34\n.endscope");
        let id = module.chunks[0].subs[0].expr.num.unwrap() as usize;
        assert_eq!(module.symbols[id].expr.as_ref().unwrap().num, Some(0x34));
    }

    #[test]
    fn proc_defines_a_label_and_a_scope() {
        let module = assemble(".proc sub\nrts\n.endproc\njsr sub");
        let chunk = &module.chunks[0];
        assert_eq!(chunk.data, vec![0x60, 0x20, 0xff, 0xff]);
        let sub = &chunk.subs[0];
        assert_eq!((sub.offset, sub.size), (2, 2));
        // the label's relative value is inlined directly
        assert_eq!(sub.expr.op, "num");
        assert_eq!(sub.expr.num, Some(0));
        assert!(sub.expr.meta.unwrap().rel);
        let err = assemble_err(".scope a\n.endproc");
        assert!(err.contains("without .proc"), "{err}");
    }

    #[test]
    fn undefined_symbols_fail_at_module_time() {
        let err = assemble_err("lda nowhere");
        assert!(err.contains("Symbol never defined: nowhere"), "{err}");
    }

    #[test]
    fn org_extends_contiguously_and_splits_otherwise() {
        let module = assemble(".org $8000\nlda #1\n.org $8002\nrts");
        assert_eq!(module.chunks.len(), 1);
        assert_eq!(module.chunks[0].org, Some(0x8000));
        assert_eq!(module.chunks[0].data, vec![0xa9, 0x01, 0x60]);
        let module = assemble(".org $8000\nlda #1\n.org $9000\nrts");
        assert_eq!(module.chunks.len(), 2);
        assert_eq!(module.chunks[1].org, Some(0x9000));
    }

    #[test]
    fn labels_in_fixed_chunks_are_constants() {
        assert_eq!(
            data(".org $8000\nstart:\njmp start"),
            vec![0x4c, 0x00, 0x80]
        );
    }

    #[test]
    fn org_chunks_take_names() {
        let module = assemble(".org $fffa, \"Vectors\"\n.word $8000");
        assert_eq!(module.chunks[0].name.as_deref(), Some("Vectors"));
        // a label on a fresh chunk renames it
        let module = assemble("start:\nrts");
        assert_eq!(module.chunks[0].name.as_deref(), Some("start"));
    }

    #[test]
    fn reloc_reopens_relocatable_output() {
        let module = assemble(".org $8000\nrts\n.reloc\nrts");
        assert_eq!(module.chunks.len(), 2);
        assert_eq!(module.chunks[0].org, Some(0x8000));
        assert_eq!(module.chunks[1].org, None);
    }

    #[test]
    fn segment_switches_open_new_chunks() {
        let module = assemble("lda #1\n.segment \"data\"\n.byte 5");
        assert_eq!(module.chunks.len(), 2);
        assert_eq!(module.chunks[0].segments, vec!["code"]);
        assert_eq!(module.chunks[1].segments, vec!["data"]);
        assert_eq!(module.chunks[1].data, vec![5]);
    }

    #[test]
    fn segment_attrs_merge_into_the_table() {
        let module = assemble(
            ".segment \"hdr\" :size $10 :offset 0 :memory 0\n.byte 1\n\
             .segment \"hdr\" :fill $ff\n.byte 2",
        );
        let seg = module.segments.iter().find(|s| s.name == "hdr").unwrap();
        assert_eq!(seg.size, Some(0x10));
        assert_eq!(seg.offset, Some(0));
        assert_eq!(seg.memory, Some(0));
        assert_eq!(seg.fill, Some(0xff));
    }

    #[test]
    fn segment_lists_give_chunks_candidates() {
        let module = assemble(".segment \"a\", \"b\"\nrts");
        assert_eq!(module.chunks[0].segments, vec!["a", "b"]);
    }

    #[test]
    fn segment_prefix_applies_to_later_switches() {
        let module = assemble(".segmentprefix \"bank0_\"\n.segment \"code\"\nrts");
        assert_eq!(module.chunks[0].segments, vec!["bank0_code"]);
    }

    #[test]
    fn pushseg_and_popseg_keep_chunk_continuity() {
        let module = assemble(
            "lda #1\n.pushseg \"data\"\n.byte 5\n.popseg\nrts",
        );
        assert_eq!(module.chunks.len(), 2);
        assert_eq!(module.chunks[0].data, vec![0xa9, 0x01, 0x60]);
        assert_eq!(module.chunks[1].data, vec![5]);
        let err = assemble_err(".popseg");
        assert!(err.contains(".popseg without .pushseg"), "{err}");
    }

    #[test]
    fn free_records_a_range_and_skips_past_it() {
        let module = assemble(".org $9000\n.free $100\nrts");
        let seg = module.segments.iter().find(|s| s.name == "code").unwrap();
        assert_eq!(seg.free, vec![(0x9000, 0x9100)]);
        assert_eq!(module.chunks[0].org, Some(0x9100));
        let err = assemble_err(".free $10");
        assert!(err.contains(".free requires a fixed address"), "{err}");
    }

    #[test]
    fn byte_and_word_directives() {
        assert_eq!(data(".byte 1, 2, 3"), vec![1, 2, 3]);
        assert_eq!(data(".byte \"AB\", $43"), vec![0x41, 0x42, 0x43]);
        assert_eq!(data(".word $1234, $ab"), vec![0x34, 0x12, 0xab, 0x00]);
        assert_eq!(data(".byte 2 + 3 * 4"), vec![14]);
        // deferred bytes become substitutions
        let module = assemble(".byte low\nlow = 7");
        assert_eq!(module.chunks[0].subs[0].size, 1);
        assert_eq!(data(".res 3, $ea"), vec![0xea, 0xea, 0xea]);
        assert_eq!(data(".res 2"), vec![0, 0]);
    }

    #[test]
    fn asserts_check_now_or_defer() {
        assert_eq!(data(".assert 1 = 1\nrts"), vec![0x60]);
        let err = assemble_err(".assert 2 < 1");
        assert!(err.contains("Assertion failed"), "{err}");
        let module = assemble(".assert far = 1\nfar = 1");
        assert_eq!(module.chunks[0].asserts.len(), 1);
    }

    #[test]
    fn imports_and_exports_travel_in_the_symbol_table() {
        let module = assemble(".import outside\njsr outside");
        assert_eq!(module.chunks[0].data, vec![0x20, 0xff, 0xff]);
        let id = module.chunks[0].subs[0].expr.num.unwrap() as usize;
        let sym = &module.symbols[id];
        assert_eq!(sym.expr.as_ref().unwrap().op, "im");
        assert_eq!(sym.expr.as_ref().unwrap().sym.as_deref(), Some("outside"));
        let module = assemble(".export entry\nentry:\nrts");
        let exported = module
            .symbols
            .iter()
            .find(|s| s.export.as_deref() == Some("entry"))
            .unwrap();
        assert_eq!(exported.expr.as_ref().unwrap().num, Some(0));
    }

    #[test]
    fn local_constants_stay_out_of_the_module() {
        let module = assemble("val = $23\nlda val");
        assert!(module.symbols.is_empty(), "{:?}", module.symbols);
    }

    #[test]
    fn star_reads_the_program_counter() {
        assert_eq!(
            data(".org $8000\nlda #1\njmp *"),
            vec![0xa9, 0x01, 0x4c, 0x02, 0x80]
        );
        // pc arithmetic stays chunk-relative until placement
        let module = assemble("here = *\nrts");
        assert!(module.chunks[0].data == vec![0x60]);
    }

    #[test]
    fn move_copies_from_the_base_image() {
        let module = assemble(".move 3, $8000");
        let chunk = &module.chunks[0];
        assert_eq!(chunk.data, vec![0xff, 0xff, 0xff]);
        let sub = &chunk.subs[0];
        assert_eq!(sub.size, 3);
        assert_eq!(sub.expr.op, ".move");
        assert_eq!(sub.expr.num, Some(3));
        assert_eq!(sub.expr.args[0].num, Some(0x8000));
    }

    #[test]
    fn error_directive_raises_and_unknown_mnemonics_fail() {
        assert!(assemble_err(".error \"boom\"").contains("boom"));
        assert!(assemble_err("xyz #1").contains("Bad mnemonic: xyz"));
        assert!(assemble_err(".nonsense 1").contains("Unknown directive: .NONSENSE"));
    }

    #[test]
    fn set_symbols_never_reach_the_module() {
        let module = assemble("v .set 1\nv .set v + 1\nlda #v");
        assert_eq!(module.chunks[0].data, vec![0xa9, 0x02]);
        assert!(module.symbols.is_empty());
        let err = assemble_err("v .set q");
        assert!(err.contains("Expected a constant"), "{err}");
    }

    #[test]
    fn conditional_assembly_sees_symbols() {
        assert_eq!(
            data("flag = 1\n.if flag\nlda #1\n.else\nlda #2\n.endif"),
            vec![0xa9, 0x01]
        );
        assert_eq!(
            data(".ifdef flag\nlda #1\n.else\nlda #2\n.endif"),
            vec![0xa9, 0x02]
        );
        // .ifref reflects earlier operand references
        let module = assemble("lda used\n.ifref used\nused = $10\n.endif");
        assert_eq!(module.chunks[0].data, vec![0xad, 0xff, 0xff]);
        let id = module.chunks[0].subs[0].expr.num.unwrap() as usize;
        assert_eq!(module.symbols[id].expr.as_ref().unwrap().num, Some(0x10));
    }

    #[test]
    fn defines_on_the_command_line_seed_symbols() {
        let host = MemHost::new();
        let opts = SourceOptions {
            defines: vec![("DEBUG".to_string(), 1)],
            ..SourceOptions::default()
        };
        let module =
            assemble_source(&host, ".ifdef DEBUG\nlda #1\n.endif", "t.s", &opts).unwrap();
        assert_eq!(module.chunks[0].data, vec![0xa9, 0x01]);
    }
}
