//! The linker.
//!
//! Modules are read one at a time: their segment declarations merge
//! over the target preset, and their symbol tables and chunks are
//! rebased into one global table.  `link` then places every chunk
//! (fixed-org chunks where they ask, relocatable chunks first-fit into
//! the segments' free ranges), resolves the deferred expressions, and
//! patches each substitution into the output image.
//!
//! Placement is deterministic: modules place in the order they were
//! read and chunks in declaration order, and a relocatable chunk takes
//! the first free interval that fits in the first candidate segment
//! that has one.

use std::collections::HashMap;
use std::fmt::Write as _;

use indexmap::IndexMap;
use tracing::debug;

use crate::expr::{self, Expr};
use crate::ips;
use crate::module::{Chunk, Module, OverwriteMode, Segment, Substitution, Symbol};
use crate::target;
use crate::token;
use crate::{Error, Result};

/// Where a chunk ended up.
#[derive(Clone, Copy, Debug)]
struct Placement {
    /// Memory address of the first byte.
    org: i64,
    /// Bank of the segment the chunk landed in.
    bank: Option<i64>,
    /// File offset of the first byte, `None` when the segment is not
    /// written to the output.
    offset: Option<i64>,
}

pub struct Linker {
    segments: IndexMap<String, Segment>,
    symbols: Vec<Symbol>,
    /// Export name to global symbol index.  Later exports shadow.
    exports: HashMap<String, usize>,
    chunks: Vec<Chunk>,
    placements: Vec<Option<Placement>>,
    base: Vec<u8>,
    base_offset: usize,
}

impl Linker {
    /// Creates a linker laid out for a named target.  With no target
    /// the segment table starts empty; if it is still empty at link
    /// time a barebones cartridge layout is assumed.
    pub fn new(target_name: Option<&str>) -> Result<Linker> {
        let mut linker = Linker {
            segments: IndexMap::new(),
            symbols: Vec::new(),
            exports: HashMap::new(),
            chunks: Vec::new(),
            placements: Vec::new(),
            base: Vec::new(),
            base_offset: 0,
        };
        if let Some(name) = target_name {
            let segs = target::preset(name).ok_or_else(|| {
                Error::Layout(format!(
                    "Unknown target: {name} (expected one of {})",
                    target::names().join(", ")
                ))
            })?;
            linker.segments(segs);
        }
        Ok(linker)
    }

    /// Replaces the whole segment table, discarding any preset.
    pub fn segments(&mut self, segments: Vec<Segment>) {
        self.segments = segments.into_iter().map(|s| (s.name.clone(), s)).collect();
    }

    /// Supplies the image being patched over.  `offset` is the file
    /// offset of the first base byte.  `.move` reads from this image,
    /// and IPS output diffs against it.
    pub fn base(&mut self, data: &[u8], offset: usize) {
        self.base = data.to_vec();
        self.base_offset = offset;
    }

    /// Merges one module into the link.
    pub fn read(&mut self, module: Module) -> Result<()> {
        debug!(
            "reading module {} ({} chunks, {} symbols)",
            module.name.as_deref().unwrap_or("?"),
            module.chunks.len(),
            module.symbols.len()
        );
        let sym_base = self.symbols.len();
        let chunk_base = self.chunks.len();
        for seg in &module.segments {
            let merged = match self.segments.get(&seg.name) {
                Some(have) => Segment::merge(have, seg),
                None => seg.clone(),
            };
            self.segments.insert(seg.name.clone(), merged);
        }
        for (i, sym) in module.symbols.into_iter().enumerate() {
            if let Some(name) = &sym.export {
                self.exports.insert(name.clone(), sym_base + i);
            }
            self.symbols.push(Symbol {
                expr: sym.expr.map(|e| rebase(e, sym_base, chunk_base)),
                ..sym
            });
        }
        for mut chunk in module.chunks {
            for sub in &mut chunk.subs {
                sub.expr = rebase(std::mem::take(&mut sub.expr), sym_base, chunk_base);
            }
            chunk.asserts = chunk
                .asserts
                .into_iter()
                .map(|a| rebase(a, sym_base, chunk_base))
                .collect();
            self.chunks.push(chunk);
        }
        Ok(())
    }

    /// Places, resolves, and patches everything read so far.
    pub fn link(&mut self) -> Result<Output> {
        if self.segments.is_empty() {
            // nothing declared anywhere: assume a bare cartridge
            if let Some(segs) = target::preset("nes-nrom") {
                self.segments(segs);
            }
        }
        self.resolve_imports()?;
        self.place()?;
        self.resolve_symbols()?;
        self.patch()?;
        Ok(self.output())
    }

    /// Rewrites every import symbol into an alias for the matching
    /// export.
    fn resolve_imports(&mut self) -> Result<()> {
        for i in 0..self.symbols.len() {
            let (name, source) = match &self.symbols[i].expr {
                Some(e) if e.op == "im" => {
                    (e.sym.clone().unwrap_or_default(), e.source.clone())
                }
                _ => continue,
            };
            let Some(&target) = self.exports.get(&name) else {
                return Err(Error::Symbol(format!(
                    "Unable to resolve import: {name}{}",
                    token::at(source.as_ref())
                )));
            };
            self.symbols[i].expr = Some(Expr {
                op: "sym".to_string(),
                num: Some(target as i64),
                source,
                ..Expr::default()
            });
        }
        Ok(())
    }

    /// Segments a chunk may be placed in, falling back to the default
    /// segments when none of its named ones are in the table.
    fn candidate_names(&self, chunk: &Chunk) -> Vec<String> {
        let named: Vec<String> = chunk
            .segments
            .iter()
            .filter(|n| self.segments.contains_key(n.as_str()))
            .cloned()
            .collect();
        if !named.is_empty() {
            return named;
        }
        self.segments
            .values()
            .filter(|s| s.default)
            .map(|s| s.name.clone())
            .collect()
    }

    fn place(&mut self) -> Result<()> {
        self.placements = vec![None; self.chunks.len()];
        // fixed chunks go first so their ranges are carved out of the
        // free lists before anything relocatable is laid down
        let mut written: Vec<(i64, i64)> = Vec::new();
        for i in 0..self.chunks.len() {
            let Some(org) = self.chunks[i].org else { continue };
            let len = self.chunks[i].data.len() as i64;
            let label = chunk_label(&self.chunks[i], i);
            let names = self.candidate_names(&self.chunks[i]);
            if names.is_empty() {
                return Err(Error::Layout(format!(
                    "No segments match chunk {label}: {:?}",
                    self.chunks[i].segments
                )));
            }
            let covering = names
                .iter()
                .find(|n| {
                    let s = &self.segments[n.as_str()];
                    s.includes_org(org)
                        && org + len <= s.memory.unwrap_or(0) + s.size.unwrap_or(0)
                })
                .cloned();
            let Some(seg_name) = covering else {
                return Err(Error::Layout(format!(
                    "No segment covers ${org:04x}..${:04x} for chunk {label}",
                    org + len
                )));
            };
            let (bank, offset) = {
                let s = &self.segments[seg_name.as_str()];
                (s.bank, file_offset(s, org))
            };
            if let Some(offset) = offset {
                let range = (offset, offset + len);
                match self.chunks[i].overwrite() {
                    OverwriteMode::Forbid if overlaps(&written, range) => {
                        return Err(Error::Layout(format!(
                            "Overwrite of already-written data at ${org:04x}: chunk {label}"
                        )));
                    }
                    OverwriteMode::Require if !overlaps(&written, range) => {
                        return Err(Error::Layout(format!(
                            "Nothing to overwrite at ${org:04x}: chunk {label}"
                        )));
                    }
                    _ => {}
                }
                if len > 0 {
                    written.push(range);
                }
            }
            if let Some(s) = self.segments.get_mut(seg_name.as_str()) {
                carve(&mut s.free, org, org + len);
            }
            debug!("chunk {label} fixed at ${org:04x} in {seg_name}");
            self.placements[i] = Some(Placement { org, bank, offset });
        }
        for i in 0..self.chunks.len() {
            if self.chunks[i].org.is_some() {
                continue;
            }
            let len = self.chunks[i].data.len() as i64;
            let label = chunk_label(&self.chunks[i], i);
            let names = self.candidate_names(&self.chunks[i]);
            if names.is_empty() {
                return Err(Error::Layout(format!(
                    "No segments match chunk {label}: {:?}",
                    self.chunks[i].segments
                )));
            }
            let mut placed = None;
            'segs: for name in &names {
                for &(start, end) in &self.segments[name.as_str()].free {
                    if end - start >= len {
                        placed = Some((name.clone(), start));
                        break 'segs;
                    }
                }
            }
            let Some((seg_name, org)) = placed else {
                return Err(Error::Layout(format!(
                    "Out of space: chunk {label} ({len} bytes) does not fit in {}",
                    names.join(", ")
                )));
            };
            let (bank, offset) = {
                let s = &self.segments[seg_name.as_str()];
                (s.bank, file_offset(s, org))
            };
            if let Some(s) = self.segments.get_mut(seg_name.as_str()) {
                carve(&mut s.free, org, org + len);
            }
            debug!("chunk {label} placed at ${org:04x} in {seg_name}");
            self.placements[i] = Some(Placement { org, bank, offset });
        }
        Ok(())
    }

    /// Resolves every symbol down to an absolute value, in dependency
    /// order with cycle detection.
    fn resolve_symbols(&mut self) -> Result<()> {
        let mut memo: Vec<Option<Expr>> = vec![None; self.symbols.len()];
        let mut active = vec![false; self.symbols.len()];
        for i in 0..self.symbols.len() {
            self.symbol_value(i, &mut memo, &mut active)?;
        }
        for (sym, value) in self.symbols.iter_mut().zip(memo) {
            sym.expr = value;
        }
        Ok(())
    }

    fn symbol_value(
        &self,
        idx: usize,
        memo: &mut Vec<Option<Expr>>,
        active: &mut Vec<bool>,
    ) -> Result<Expr> {
        if idx >= self.symbols.len() {
            return Err(Error::Symbol(format!("Bad symbol reference: {idx}")));
        }
        if let Some(done) = &memo[idx] {
            return Ok(done.clone());
        }
        if active[idx] {
            return Err(Error::Symbol(format!(
                "Circular symbol definition: {}",
                self.symbol_label(idx)
            )));
        }
        let Some(expr) = self.symbols[idx].expr.clone() else {
            return Err(Error::Symbol(format!(
                "Undefined symbol: {}",
                self.symbol_label(idx)
            )));
        };
        active[idx] = true;
        let value = self.resolve_in(&expr, memo, active)?;
        active[idx] = false;
        if !value.is_abs() {
            return Err(Error::Symbol(format!(
                "Unable to resolve symbol {}{}",
                self.symbol_label(idx),
                token::at(expr.source.as_ref())
            )));
        }
        memo[idx] = Some(value.clone());
        Ok(value)
    }

    /// Evaluates an expression against the placed chunks, chasing
    /// symbol references through the global table.
    fn resolve_in(
        &self,
        expr: &Expr,
        memo: &mut Vec<Option<Expr>>,
        active: &mut Vec<bool>,
    ) -> Result<Expr> {
        match expr.op.as_str() {
            "sym" => {
                if let Some(name) = &expr.sym {
                    return Err(Error::Symbol(format!(
                        "Symbol never resolved: {name}{}",
                        token::at(expr.source.as_ref())
                    )));
                }
                let idx = usize::try_from(expr.num.unwrap_or(-1)).map_err(|_| {
                    Error::Symbol(format!("Bad symbol reference: {:?}", expr.num))
                })?;
                let mut value = self.symbol_value(idx, memo, active)?;
                if value.source.is_none() {
                    value.source = expr.source.clone();
                }
                Ok(value)
            }
            "im" => Err(Error::Symbol(format!(
                "Unable to resolve import: {}{}",
                expr.sym.as_deref().unwrap_or("?"),
                token::at(expr.source.as_ref())
            ))),
            _ => {
                let mut e = expr.clone();
                e.args = e
                    .args
                    .iter()
                    .map(|a| self.resolve_in(a, memo, active))
                    .collect::<Result<Vec<_>>>()?;
                if e.op == "num" {
                    self.fill_placement(&mut e);
                }
                expr::evaluate(e)
            }
        }
    }

    fn eval_link(&self, expr: &Expr) -> Result<Expr> {
        let mut memo = vec![None; self.symbols.len()];
        let mut active = vec![false; self.symbols.len()];
        self.resolve_in(expr, &mut memo, &mut active)
    }

    /// Copies a placed chunk's org, bank, and file offset onto a
    /// relative number so `evaluate` can collapse it.
    fn fill_placement(&self, e: &mut Expr) {
        let Some(meta) = &mut e.meta else { return };
        let Some(chunk) = meta.chunk else { return };
        let Some(Some(p)) = self.placements.get(chunk) else {
            return;
        };
        if meta.org.is_none() {
            meta.org = Some(p.org);
        }
        if meta.bank.is_none() {
            meta.bank = p.bank;
        }
        if meta.offset.is_none() {
            meta.offset = p.offset;
        }
    }

    /// Resolves every substitution and assertion, writing substitution
    /// values into the chunk data.
    fn patch(&mut self) -> Result<()> {
        for i in 0..self.chunks.len() {
            let label = chunk_label(&self.chunks[i], i);
            let mut writes: Vec<(usize, Vec<u8>)> = Vec::new();
            for sub in &self.chunks[i].subs {
                let at = token::at(sub.expr.source.as_ref());
                let end = sub.offset + sub.size as usize;
                if end > self.chunks[i].data.len() {
                    return Err(Error::Layout(format!(
                        "Substitution outside chunk {label}{at}"
                    )));
                }
                if sub.expr.op == ".move" {
                    writes.push((sub.offset, self.move_bytes(sub)?));
                    continue;
                }
                let value = self.eval_link(&sub.expr)?;
                let Some(num) = value.abs_value() else {
                    return Err(Error::Symbol(format!("Unresolved expression{at}")));
                };
                if !fits(num, sub.size) {
                    return Err(Error::Layout(format!(
                        "Value {num} does not fit in {} bytes{at}",
                        sub.size
                    )));
                }
                writes.push((sub.offset, le_bytes(num, sub.size)));
            }
            for (offset, bytes) in writes {
                self.chunks[i].data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }
            for assert in &self.chunks[i].asserts {
                let at = token::at(assert.source.as_ref());
                match self.eval_link(assert)?.abs_value() {
                    Some(0) => return Err(Error::Assertion(format!("Assertion failed{at}"))),
                    Some(_) => {}
                    None => return Err(Error::Symbol(format!("Unresolved expression{at}"))),
                }
            }
        }
        Ok(())
    }

    /// Bytes for a `.move` substitution: the source range out of the
    /// pre-patch base image, found through the segment table.
    fn move_bytes(&self, sub: &Substitution) -> Result<Vec<u8>> {
        let at = token::at(sub.expr.source.as_ref());
        let src = sub
            .expr
            .args
            .first()
            .ok_or_else(|| Error::Eval(format!("Move without a source{at}")))?;
        let Some(addr) = self.eval_link(src)?.abs_value() else {
            return Err(Error::Symbol(format!("Unresolved expression{at}")));
        };
        let len = sub.size as i64;
        let seg = self
            .segments
            .values()
            .find(|s| {
                s.includes_org(addr)
                    && addr + len <= s.memory.unwrap_or(0) + s.size.unwrap_or(0)
            })
            .ok_or_else(|| {
                Error::Layout(format!("Move source ${addr:04x} is not in any segment{at}"))
            })?;
        let Some(offset) = file_offset(seg, addr) else {
            return Err(Error::Layout(format!(
                "Move source segment {} has no file data{at}",
                seg.name
            )));
        };
        Ok((0..len).map(|k| self.base_byte(offset + k)).collect())
    }

    fn base_byte(&self, file: i64) -> u8 {
        let idx = file - self.base_offset as i64;
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.base.get(i).copied())
            .unwrap_or(0)
    }

    /// Assembles the final image: segment fill, then the base image,
    /// then each placed chunk.
    fn output(&self) -> Output {
        let mut data = Vec::new();
        for seg in self.segments.values() {
            if seg.out == Some(false) {
                continue;
            }
            let (Some(offset), Some(size), Some(fill)) = (seg.offset, seg.size, seg.fill)
            else {
                continue;
            };
            if offset < 0 || size <= 0 {
                continue;
            }
            let (start, end) = (offset as usize, (offset + size) as usize);
            if data.len() < end {
                data.resize(end, 0);
            }
            for b in &mut data[start..end] {
                *b = fill as u8;
            }
        }
        if !self.base.is_empty() {
            let end = self.base_offset + self.base.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[self.base_offset..end].copy_from_slice(&self.base);
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            let Some(Some(p)) = self.placements.get(i) else { continue };
            let Some(offset) = p.offset else { continue };
            if chunk.data.is_empty() {
                continue;
            }
            let (start, end) = (offset as usize, offset as usize + chunk.data.len());
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(&chunk.data);
        }
        let mut basis = vec![0; data.len()];
        if !self.base.is_empty() {
            basis[self.base_offset..self.base_offset + self.base.len()]
                .copy_from_slice(&self.base);
        }
        Output { base: basis, data }
    }

    /// Plain-text map of placed chunks and exported symbols, one
    /// record per line.  Only meaningful after `link`.
    pub fn debug_map(&self) -> String {
        let mut out = String::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let Some(Some(p)) = self.placements.get(i) else { continue };
            let _ = writeln!(
                out,
                "chunk {} ${:04x} ${:04x}",
                chunk_label(chunk, i),
                p.org,
                p.org + chunk.data.len() as i64
            );
        }
        let mut exports: Vec<_> = self.exports.iter().collect();
        exports.sort();
        for (name, &idx) in exports {
            let Some(expr) = self.symbols.get(idx).and_then(|s| s.expr.as_ref()) else {
                continue;
            };
            let Some(addr) = expr.abs_value() else { continue };
            let loc = expr
                .source
                .as_ref()
                .map(|s| format!(" {}:{}", s.file, s.line))
                .unwrap_or_default();
            let _ = writeln!(out, "sym {name} ${addr:04x}{loc}");
        }
        out
    }

    fn symbol_label(&self, idx: usize) -> String {
        self.symbols
            .get(idx)
            .and_then(|s| s.export.clone())
            .unwrap_or_else(|| format!("#{idx}"))
    }
}

/// A linked image, ready to write out or to diff against its base.
#[derive(Debug)]
pub struct Output {
    base: Vec<u8>,
    data: Vec<u8>,
}

impl Output {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the image over the front of `out`.
    pub fn apply(&self, out: &mut [u8]) {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Encodes the difference from the base image as an IPS patch.
    pub fn to_ips_patch(&self) -> Vec<u8> {
        ips::encode(&self.base, &self.data)
    }
}

/// Rewrites module-local symbol and chunk indexes into the linker's
/// global tables.
fn rebase(mut expr: Expr, sym_base: usize, chunk_base: usize) -> Expr {
    expr.args = expr
        .args
        .into_iter()
        .map(|a| rebase(a, sym_base, chunk_base))
        .collect();
    if expr.op == "sym" && expr.sym.is_none() {
        if let Some(num) = expr.num {
            expr.num = Some(num + sym_base as i64);
        }
    }
    if let Some(meta) = &mut expr.meta {
        if let Some(chunk) = meta.chunk {
            meta.chunk = Some(chunk + chunk_base);
        }
    }
    expr
}

fn file_offset(seg: &Segment, addr: i64) -> Option<i64> {
    if seg.out == Some(false) {
        return None;
    }
    match (seg.offset, seg.memory) {
        (Some(offset), Some(memory)) => {
            let file = offset + (addr - memory);
            (file >= 0).then_some(file)
        }
        _ => None,
    }
}

/// Removes `[lo, hi)` from a free list, splitting intervals as needed.
fn carve(free: &mut Vec<(i64, i64)>, lo: i64, hi: i64) {
    if lo >= hi {
        return;
    }
    let mut out = Vec::with_capacity(free.len() + 1);
    for &(a, b) in free.iter() {
        if hi <= a || b <= lo {
            out.push((a, b));
            continue;
        }
        if a < lo {
            out.push((a, lo));
        }
        if hi < b {
            out.push((hi, b));
        }
    }
    *free = out;
}

fn overlaps(ranges: &[(i64, i64)], (lo, hi): (i64, i64)) -> bool {
    ranges.iter().any(|&(a, b)| lo < b && a < hi)
}

fn chunk_label(chunk: &Chunk, idx: usize) -> String {
    chunk.name.clone().unwrap_or_else(|| format!("#{idx}"))
}

/// Whether `value` fits in `size` bytes, signed or unsigned.
fn fits(value: i64, size: u32) -> bool {
    if size == 0 || size >= 8 {
        return true;
    }
    let bits = 8 * size as i64;
    value >= -(1 << (bits - 1)) && value < (1 << bits)
}

fn le_bytes(value: i64, size: u32) -> Vec<u8> {
    (0..size).map(|k| (value >> (8 * k)) as u8).collect()
}
