//! Expression trees.
//!
//! Expressions are parsed with a shunting-yard loop and reduced node by
//! node.  A node that still depends on an unresolved symbol or on a
//! chunk placement passes through `evaluate` unchanged; callers retry
//! once more information is known (ultimately at link time).
//!
//! Number metadata rides along in [`Meta`]: a `rel` value is an offset
//! from the start of a chunk, and picks up `org`, `bank`, and `offset`
//! as the chunk gets placed.  `size` is the byte-width hint that drives
//! zero-page vs absolute operand selection.

use serde_derive::{Deserialize, Serialize};

use crate::token::{self, SourceInfo, Token, TokenKind};
use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Operator (`'+'`, `'.max'`, ...) or one of the leaf ops: `num`,
    /// `str`, `sym` (local symbol), `im` (import), `.move`.
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sym: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,
}

/// Extra information for `num` values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Whether the value is relative to the start of its chunk.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rel: bool,
    /// Chunk the value is defined in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    /// Org value of the chunk, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<i64>,
    /// Bank value of the chunk, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank: Option<i64>,
    /// File offset of the chunk, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// Byte-width hint for the number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl Expr {
    pub fn num(value: i64) -> Expr {
        Expr {
            op: "num".to_string(),
            num: Some(value),
            meta: Some(size_meta(value, None)),
            ..Expr::default()
        }
    }

    pub fn sym(name: &str) -> Expr {
        Expr {
            op: "sym".to_string(),
            sym: Some(name.to_string()),
            ..Expr::default()
        }
    }

    pub fn import(name: &str) -> Expr {
        Expr {
            op: "im".to_string(),
            sym: Some(name.to_string()),
            ..Expr::default()
        }
    }

    /// Absolute number, fully resolved.
    pub fn is_abs(&self) -> bool {
        self.op == "num" && !self.meta.map_or(false, |m| m.rel)
    }

    pub fn abs_value(&self) -> Option<i64> {
        if self.is_abs() {
            self.num
        } else {
            None
        }
    }

    pub fn size(&self) -> Option<u32> {
        self.meta.and_then(|m| m.size)
    }
}

/// Wraps an expression to take its low byte.
pub fn lo_byte(e: Expr) -> Expr {
    let source = e.source.clone();
    Expr {
        op: "<".to_string(),
        args: vec![e],
        source,
        ..Expr::default()
    }
}

/// Wraps an expression to take its high byte.
pub fn hi_byte(e: Expr) -> Expr {
    let source = e.source.clone();
    Expr {
        op: ">".to_string(),
        args: vec![e],
        source,
        ..Expr::default()
    }
}

pub fn identifier(expr: &Expr) -> Result<&str> {
    match (expr.op.as_str(), &expr.sym) {
        ("sym", Some(sym)) => Ok(sym),
        _ => Err(Error::Syntax(format!(
            "Expected identifier but got op: {}",
            expr.op
        ))),
    }
}

/// Strips source info from the whole tree, keeping meta.
pub fn strip(expr: &Expr) -> Expr {
    let mut out = expr.clone();
    out.source = None;
    out.args = out.args.iter().map(strip).collect();
    out
}

/// Collects symbol names in post-order.  Duplicates are kept: a symbol
/// that shows up twice is not invertible.
pub fn symbols(expr: &Expr) -> Vec<String> {
    fn collect(expr: &Expr, out: &mut Vec<String>) {
        for arg in &expr.args {
            collect(arg, out);
        }
        if expr.op == "sym" {
            if let Some(sym) = &expr.sym {
                out.push(sym.clone());
            }
        }
    }
    let mut out = Vec::new();
    collect(expr, &mut out);
    out
}

// precedence, associativity, arity
type OpMeta = (u8, i8, usize);

const BINARY: usize = 2;
const UNARY: usize = 1;

fn binop(name: &str) -> Option<OpMeta> {
    Some(match name {
        // multiplicative; bitwise and arithmetic cannot associate
        "*" | "/" => (5, 4, BINARY),
        ".mod" => (5, 3, BINARY),
        "&" => (5, 2, BINARY),
        "^" => (5, 1, BINARY),
        "<<" | ">>" => (5, 0, BINARY),
        // additive
        "+" | "-" => (4, 2, BINARY),
        "|" => (4, 1, BINARY),
        // comparisons cannot associate at all
        "<" | "<=" | ">" | ">=" | "=" | "<>" => (3, 0, BINARY),
        // logical; different kinds cannot associate
        "&&" => (2, 3, BINARY),
        ".xor" => (2, 2, BINARY),
        "||" => (2, 1, BINARY),
        _ => return None,
    })
}

fn prefixop(name: &str) -> Option<OpMeta> {
    Some(match name {
        "+" | "-" | "~" | "<" | ">" | "^" => (9, -1, UNARY),
        "!" => (2, -1, UNARY),
        _ => return None,
    })
}

/// Directive spellings for the symbolic operators.
fn name_map(name: &str) -> &str {
    match name {
        ".bitand" => "&",
        ".bitxor" => "^",
        ".bitor" => "|",
        ".shl" => "<<",
        ".shr" => ">>",
        ".and" => "&&",
        ".or" => "||",
        ".bitnot" => "~",
        ".lobyte" => "<",
        ".hibyte" => ">",
        ".bankbyte" => "^",
        ".not" => "!",
        _ => name,
    }
}

fn is_function(name: &str) -> bool {
    matches!(name, ".match" | ".xmatch" | ".max" | ".min")
}

// Returns >0 if top is faster, <0 if top is slower, and 0 if the two
// cannot mix without parens.
fn compare_op(top: OpMeta, next: OpMeta) -> i8 {
    if top.0 > next.0 {
        return 1;
    }
    if top.0 < next.0 {
        return -1;
    }
    if top.1 != next.1 {
        return 0;
    }
    top.1
}

/// Size hint for a number, preferring the written width of the literal
/// (`$0012` stays two bytes wide).
pub fn size_meta(num: i64, tok: Option<&Token>) -> Meta {
    if num < 256 {
        if let Some(Token {
            kind: TokenKind::Num { width: Some(w), .. },
            ..
        }) = tok
        {
            return Meta {
                size: Some(*w),
                ..Meta::default()
            };
        }
    }
    Meta {
        size: Some(if (0..256).contains(&num) { 1 } else { 2 }),
        ..Meta::default()
    }
}

/// Attaches a result-size hint to operators whose output width is
/// known from their argument widths.
fn fix_size(mut expr: Expr) -> Expr {
    fn known_max(args: &[Expr]) -> Option<u32> {
        args.iter()
            .map(Expr::size)
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .max()
    }
    let size = match name_map(&expr.op) {
        "<" | ">" | "!" | "<=" | ">=" | "=" | "<>" => Some(1),
        "^" if expr.args.len() == 1 => Some(1),
        "^" | "&" | "&&" | "|" | "||" | ".xor" | ".max" | ".min" => known_max(&expr.args),
        _ => None,
    };
    if let Some(size) = size {
        expr.meta.get_or_insert_with(Meta::default).size = Some(size);
    }
    expr
}

/// Parses a single expression that must occupy the whole slice.
pub fn parse_only(tokens: &[Token]) -> Result<Expr> {
    let (expr, i) = parse(tokens, 0)?;
    if i < tokens.len() {
        return Err(Error::Syntax(format!(
            "Garbage after expression: {}",
            token::name_at(tokens.get(i))
        )));
    }
    Ok(expr)
}

/// Shunting-yard parse starting at `start`.  Stops at a comma or at the
/// first token that cannot continue the expression, and returns the
/// expression along with the index of the first unconsumed token.
pub fn parse(tokens: &[Token], start: usize) -> Result<(Expr, usize)> {
    if start >= tokens.len() {
        return Err(Error::Syntax("No expression?".to_string()));
    }
    let mut ops: Vec<(&str, OpMeta)> = Vec::new();
    let mut exprs: Vec<Expr> = Vec::new();
    let mut val = true;
    let mut i = start;
    while i < tokens.len() {
        let front = &tokens[i];
        let opname: Option<(&str, bool)> = match &front.kind {
            TokenKind::Cs { name, .. } => Some((name.as_str(), true)),
            TokenKind::Op(s) => Some((s.as_str(), false)),
            _ => None,
        };
        if val {
            // looking for a value: literal, balanced parens, or prefix op
            match (&front.kind, opname) {
                (_, Some((name, cs))) => {
                    if let Some(prefix) = prefixop(name_map(name)) {
                        ops.push((name, prefix));
                    } else if cs {
                        if !is_function(name) {
                            return Err(Error::Syntax(format!(
                                "No such function: {}",
                                front.name_at()
                            )));
                        }
                        let next = tokens.get(i + 1);
                        if !matches!(next.map(|t| &t.kind), Some(TokenKind::LParen)) {
                            return Err(Error::Syntax(format!(
                                "Bad funcall: {}",
                                token::name_at(next.or(Some(front)))
                            )));
                        }
                        let close = token::find_balanced(tokens, i + 1).ok_or_else(|| {
                            Error::Syntax(format!("Never closed: {}", token::name_at(next)))
                        })?;
                        let mut args = Vec::new();
                        for arg in token::parse_arg_list(tokens, i + 2, close)? {
                            args.push(parse_only(&arg)?);
                        }
                        i = close;
                        exprs.push(fix_size(Expr {
                            op: name.to_string(),
                            args,
                            ..Expr::default()
                        }));
                        val = false;
                    } else if name == "*" {
                        exprs.push(Expr::sym("*"));
                        val = false;
                    } else {
                        return Err(Error::Syntax(format!(
                            "Unknown prefix operator: {}",
                            front.name_at()
                        )));
                    }
                }
                (TokenKind::LParen, _) => {
                    let close = token::find_balanced(tokens, i).ok_or_else(|| {
                        Error::Syntax(format!("No close paren: {}", front.name_at()))
                    })?;
                    exprs.push(parse_only(&tokens[i + 1..close])?);
                    i = close;
                    val = false;
                }
                (TokenKind::Ident(name), _) => {
                    exprs.push(Expr::sym(name));
                    val = false;
                }
                (TokenKind::Num { value, .. }, _) => {
                    exprs.push(Expr {
                        op: "num".to_string(),
                        num: Some(*value),
                        meta: Some(size_meta(*value, Some(front))),
                        ..Expr::default()
                    });
                    val = false;
                }
                (TokenKind::Str(s), _) => {
                    exprs.push(Expr {
                        op: "str".to_string(),
                        str: Some(s.clone()),
                        meta: Some(Meta {
                            size: Some(s.chars().count() as u32),
                            ..Meta::default()
                        }),
                        ..Expr::default()
                    });
                    val = false;
                }
                _ => {
                    return Err(Error::Syntax(format!(
                        "Bad expression token: {}",
                        front.name_at()
                    )))
                }
            }
        } else {
            // looking for an infix operator or the end
            if front.is_op(",") {
                break;
            }
            let Some((name, _)) = opname else { break };
            let Some(op) = binop(name_map(name)) else { break };
            // reduce anything to the left that binds faster
            loop {
                let Some(&(top_name, top_meta)) = ops.last() else {
                    break;
                };
                let cmp = compare_op(top_meta, op);
                if cmp < 0 {
                    break;
                }
                if cmp == 0 {
                    return Err(Error::Syntax(format!(
                        "Mixing {top_name} and {name} needs explicit parens.{}",
                        token::at(front.source.as_ref())
                    )));
                }
                ops.pop();
                apply_op(top_name, top_meta.2, &mut exprs, tokens.get(i))?;
            }
            ops.push((name, op));
            val = true;
        }
        i += 1;
    }
    while let Some((name, meta)) = ops.pop() {
        apply_op(name, meta.2, &mut exprs, tokens.get(i))?;
    }
    if exprs.len() != 1 {
        return Err(Error::Syntax(format!(
            "expression parse failed: nonunique result {}",
            token::name_at(tokens.get(start))
        )));
    }
    let mut expr = exprs.remove(0);
    if let Some(source) = &tokens[start].source {
        expr.source = Some(source.clone());
    }
    Ok((expr, i))
}

fn apply_op(op: &str, arity: usize, exprs: &mut Vec<Expr>, at: Option<&Token>) -> Result<()> {
    if exprs.len() < arity {
        return Err(Error::Syntax(format!(
            "shunting parse failed? {}",
            token::name_at(at)
        )));
    }
    let args = exprs.split_off(exprs.len() - arity);
    exprs.push(fix_size(Expr {
        op: op.to_string(),
        args,
        ..Expr::default()
    }));
    Ok(())
}

/// Evaluates the whole tree bottom-up.
pub fn evaluate_deep(expr: &Expr) -> Result<Expr> {
    let mut e = expr.clone();
    e.args = e
        .args
        .iter()
        .map(evaluate_deep)
        .collect::<Result<Vec<_>>>()?;
    evaluate(e)
}

/// Evaluates a single node whose arguments are already evaluated.
/// Returns the node unchanged when it cannot be reduced yet.
pub fn evaluate(expr: Expr) -> Result<Expr> {
    let op = name_map(&expr.op).to_string();
    match op.as_str() {
        ".move" | "im" | "sym" => return Ok(expr),
        "num" => {
            if let Some(meta) = expr.meta {
                if meta.rel {
                    if let Some(org) = meta.org {
                        // no longer relative; keep the chunk info
                        let mut m = meta;
                        m.rel = false;
                        return Ok(Expr {
                            op: "num".to_string(),
                            num: Some(expr.num.unwrap_or(0) + org),
                            meta: Some(m),
                            source: expr.source,
                            ..Expr::default()
                        });
                    }
                }
            }
            return Ok(expr);
        }
        ".max" => return fold_extreme(expr, true),
        ".min" => return fold_extreme(expr, false),
        _ => {}
    }

    if expr.args.len() == 1 {
        return match op.as_str() {
            "+" => Ok(expr.args.into_iter().next().unwrap_or_default()),
            "-" => Ok(unary(expr, |x| x.wrapping_neg())),
            "~" => Ok(unary(expr, |x| !js32(x))),
            "!" => Ok(unary(expr, |x| i64::from(x == 0))),
            "<" => Ok(unary(expr, |x| x & 0xff)),
            ">" => Ok(unary(expr, |x| (x >> 8) & 0xff)),
            "^" => match expr.args[0].meta.and_then(|m| m.bank) {
                Some(bank) => Ok(with_source(Expr::num(bank), expr.source)),
                None => Ok(expr),
            },
            _ => Err(Error::Eval(format!("Unknown unary operator: {op}"))),
        };
    }

    match op.as_str() {
        "str" => Ok(expr),
        // match checks that the types of both sides are the same
        ".match" => func2(expr, |a, b| {
            i64::from(
                (a.num.is_some() && b.num.is_some())
                    || (a.str.is_some() && b.str.is_some())
                    || (a.sym.is_some() && b.sym.is_some()),
            )
        }),
        // xmatch checks that the contents of both sides are the same
        ".xmatch" => func2(expr, |a, b| {
            i64::from(
                (a.num.is_some() && a.num == b.num)
                    || (a.str.is_some() && a.str == b.str)
                    || (a.sym.is_some() && a.sym == b.sym),
            )
        }),
        "+" => Ok(plus(expr)),
        "-" => Ok(minus(expr)),
        "*" => binary(expr, |a, b| Ok(a.wrapping_mul(b))),
        "/" => binary(expr, |a, b| {
            if b == 0 {
                return Err(Error::Eval("Division by zero".to_string()));
            }
            Ok(floor_div(a, b))
        }),
        ".mod" => binary(expr, |a, b| {
            if b == 0 {
                return Err(Error::Eval("Modulo by zero".to_string()));
            }
            Ok(a % b)
        }),
        "&" => binary(expr, |a, b| Ok(js32(a) & js32(b))),
        "|" => binary(expr, |a, b| Ok(js32(a) | js32(b))),
        "^" => binary(expr, |a, b| Ok(js32(a) ^ js32(b))),
        "<<" => binary(expr, |a, b| Ok(js32(js32(a) << ((b as u32) & 31)))),
        ">>" => binary(expr, |a, b| Ok(((a as u32) >> ((b as u32) & 31)) as i64)),
        "<" => binary(expr, |a, b| Ok(i64::from(a < b))),
        "<=" => binary(expr, |a, b| Ok(i64::from(a <= b))),
        ">" => binary(expr, |a, b| Ok(i64::from(a > b))),
        ">=" => binary(expr, |a, b| Ok(i64::from(a >= b))),
        "=" => binary(expr, |a, b| Ok(i64::from(a == b))),
        "<>" => binary(expr, |a, b| Ok(i64::from(a != b))),
        // the logical operators return an operand, not 0/1
        "&&" => binary(expr, |a, b| Ok(if a == 0 { a } else { b })),
        "||" => binary(expr, |a, b| Ok(if a != 0 { a } else { b })),
        ".xor" => binary(expr, |a, b| {
            Ok(if a == 0 && b != 0 {
                b
            } else if b == 0 && a != 0 {
                a
            } else {
                0
            })
        }),
        _ => Err(Error::Eval(format!("Unknown operator: {op}"))),
    }
}

/// JS-style bitwise operand: wrap to 32 bits and sign extend.
fn js32(x: i64) -> i64 {
    x as i32 as i64
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn with_source(mut expr: Expr, source: Option<SourceInfo>) -> Expr {
    if expr.source.is_none() {
        expr.source = source;
    }
    expr
}

fn unary(expr: Expr, f: impl Fn(i64) -> i64) -> Expr {
    let arg = &expr.args[0];
    if !arg.is_abs() {
        return expr;
    }
    let source = expr.source.clone();
    with_source(Expr::num(f(arg.num.unwrap_or(0))), source)
}

fn binary(expr: Expr, f: impl Fn(i64, i64) -> Result<i64>) -> Result<Expr> {
    if expr.args.len() != 2 {
        return Err(Error::Eval(format!(
            "Expected 2 arguments: {}{}",
            expr.op,
            token::at(expr.source.as_ref())
        )));
    }
    let (a, b) = (&expr.args[0], &expr.args[1]);
    if !a.is_abs() || !b.is_abs() {
        return Ok(expr);
    }
    let num = f(a.num.unwrap_or(0), b.num.unwrap_or(0)).map_err(|e| match e {
        Error::Eval(msg) => Error::Eval(format!("{msg}{}", token::at(expr.source.as_ref()))),
        e => e,
    })?;
    let source = expr.source.clone();
    Ok(with_source(Expr::num(num), source))
}

fn func2(expr: Expr, f: impl Fn(&Expr, &Expr) -> i64) -> Result<Expr> {
    if expr.args.len() != 2 {
        return Err(Error::Eval(format!(
            "Expected 2 parameters: {}{}",
            expr.op,
            token::at(expr.source.as_ref())
        )));
    }
    let num = f(&expr.args[0], &expr.args[1]);
    let source = expr.source.clone();
    Ok(with_source(Expr::num(num), source))
}

/// `.max`/`.min`: folds when every argument is absolute, or when all
/// are relative to the same chunk.  Anything mixed is deferred.
fn fold_extreme(mut expr: Expr, want_max: bool) -> Result<Expr> {
    if expr.args.is_empty() {
        return Err(Error::Eval(format!(
            "Expected at least 1 parameter: {}{}",
            expr.op,
            token::at(expr.source.as_ref())
        )));
    }
    let all_abs = expr.args.iter().all(Expr::is_abs);
    let all_rel_same_chunk = expr.args.iter().all(|a| {
        a.op == "num"
            && a.meta.map_or(false, |m| m.rel)
            && a.meta.and_then(|m| m.chunk) == expr.args[0].meta.and_then(|m| m.chunk)
    });
    if !all_abs && !all_rel_same_chunk {
        return Ok(expr);
    }
    let mut best = 0;
    for (i, arg) in expr.args.iter().enumerate().skip(1) {
        let v = arg.num.unwrap_or(0);
        let b = expr.args[best].num.unwrap_or(0);
        if (want_max && v > b) || (!want_max && v < b) {
            best = i;
        }
    }
    let source = expr.source.take();
    Ok(with_source(expr.args.swap_remove(best), source))
}

fn plus(expr: Expr) -> Expr {
    let (a, b) = (&expr.args[0], &expr.args[1]);
    if a.op != "num" || b.op != "num" {
        return expr;
    }
    let a_rel = a.meta.map_or(false, |m| m.rel);
    let b_rel = b.meta.map_or(false, |m| m.rel);
    if a_rel && b_rel {
        // adding two addresses is nonsense
        return expr;
    }
    let num = a.num.unwrap_or(0).wrapping_add(b.num.unwrap_or(0));
    let mut meta = if a_rel {
        a.meta
    } else if b_rel {
        b.meta
    } else {
        None
    };
    if !meta.map_or(false, |m| m.rel) && meta.and_then(|m| m.size).is_none() {
        meta.get_or_insert_with(Meta::default).size = size_meta(num, None).size;
    }
    Expr {
        op: "num".to_string(),
        num: Some(num),
        meta,
        source: expr.source,
        ..Expr::default()
    }
}

fn minus(expr: Expr) -> Expr {
    let (a, b) = (&expr.args[0], &expr.args[1]);
    if a.op != "num" || b.op != "num" {
        return expr;
    }
    let a_rel = a.meta.map_or(false, |m| m.rel);
    let b_rel = b.meta.map_or(false, |m| m.rel);
    let num = a.num.unwrap_or(0).wrapping_sub(b.num.unwrap_or(0));
    if b_rel {
        // rel - rel in the same chunk is a plain delta
        let same_chunk = a.meta.and_then(|m| m.chunk) == b.meta.and_then(|m| m.chunk);
        if a_rel && same_chunk {
            return Expr {
                op: "num".to_string(),
                num: Some(num),
                source: expr.source,
                ..Expr::default()
            };
        }
        return expr;
    }
    let mut meta = if a_rel { a.meta } else { None };
    if !meta.map_or(false, |m| m.rel) && meta.and_then(|m| m.size).is_none() {
        meta.get_or_insert_with(Meta::default).size = size_meta(num, None).size;
    }
    Expr {
        op: "num".to_string(),
        num: Some(num),
        meta,
        source: expr.source,
        ..Expr::default()
    }
}

/// Solves `expr == result` for `sym` when the expression has exactly
/// one non-constant side at each level.  Returns `None` when the
/// symbol cannot be recovered.
pub fn invert(expr: &Expr, sym: &str, result: i64) -> Option<i64> {
    let op = name_map(&expr.op);
    match op {
        "sym" => return (expr.sym.as_deref() == Some(sym)).then_some(result),
        ".move" | "im" | ".max" | ".min" | "num" | "str" => return None,
        _ => {}
    }

    if expr.args.len() == 1 {
        let arg = &expr.args[0];
        return match op {
            "+" => invert(arg, sym, result),
            "-" => invert(arg, sym, result.wrapping_neg()),
            "~" => invert(arg, sym, !js32(result)),
            // these are slightly lossy
            "!" => (result == 0 || result == 1).then(|| invert(arg, sym, result))?,
            "<" => (result == result & 0xff).then(|| invert(arg, sym, result))?,
            ">" => (result == result & 0xff).then(|| invert(arg, sym, result << 8))?,
            _ => None,
        };
    }

    if matches!(
        op,
        ".mod" | "&" | "|" | "<" | "<=" | ">" | ">=" | "=" | "<>" | "&&" | "||" | ".xor"
    ) {
        return None;
    }
    if expr.args.len() != 2 {
        return None;
    }
    // Only the (mostly) invertible operations remain.  Some care about
    // which side is constant.
    let left_e = evaluate(expr.args[0].clone()).ok()?;
    let right_e = evaluate(expr.args[1].clone()).ok()?;
    let left = left_e.abs_value();
    let right = right_e.abs_value();
    let (known, unknown) = match (left, right) {
        (Some(l), None) => (l, &right_e),
        (None, Some(r)) => (r, &left_e),
        _ => return None,
    };
    match op {
        "+" => invert(unknown, sym, result.wrapping_sub(known)),
        "-" => {
            if left.is_none() {
                invert(unknown, sym, result.wrapping_add(known))
            } else {
                invert(unknown, sym, known.wrapping_sub(result))
            }
        }
        "*" => {
            if known != 0 && result % known == 0 {
                invert(unknown, sym, result / known)
            } else {
                None
            }
        }
        "/" => {
            if left.is_none() {
                // result = x / known => x = result * known
                invert(unknown, sym, result.wrapping_mul(known))
            } else if result != 0 && known % result == 0 {
                // result = known / x => x = known / result, must go evenly
                invert(unknown, sym, known / result)
            } else {
                None
            }
        }
        "^" => invert(unknown, sym, js32(result ^ known)),
        "<<" => {
            // solve x << r = result; the shift must be the constant
            let r = (right? as u32) & 31;
            let back = ((result as u32) >> r) as i64;
            if js32(back << r) == result {
                invert(unknown, sym, back)
            } else {
                None
            }
        }
        ">>" => {
            // solve x >> r = result, zero-filling
            let r = (right? as u32) & 31;
            let restored = js32(result << r);
            if ((restored as u32) >> r) as i64 == result {
                invert(unknown, sym, restored)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Tokenizer;

    fn toks(text: &str) -> Vec<Token> {
        Tokenizer::new(text, "expr.s")
            .next_line()
            .unwrap()
            .unwrap()
    }

    fn eval(text: &str) -> i64 {
        let expr = parse_only(&toks(text)).unwrap();
        let out = evaluate_deep(&expr).unwrap();
        assert_eq!(out.op, "num", "{out:?}");
        out.num.unwrap()
    }

    fn eval_err(text: &str) -> String {
        let expr = parse_only(&toks(text)).unwrap();
        evaluate_deep(&expr).unwrap_err().to_string()
    }

    fn parse_err(text: &str) -> String {
        parse_only(&toks(text)).unwrap_err().to_string()
    }

    fn rel_num(num: i64, chunk: usize) -> Expr {
        Expr {
            op: "num".to_string(),
            num: Some(num),
            meta: Some(Meta {
                rel: true,
                chunk: Some(chunk),
                ..Meta::default()
            }),
            ..Expr::default()
        }
    }

    #[test]
    fn precedence_and_prefix() {
        assert_eq!(eval("1 + 2 * 3"), 7);
        assert_eq!(eval("2 * 3 + 1"), 7);
        assert_eq!(eval("-(3 + 4)"), -7);
        assert_eq!(eval("2 * -3"), -6);
        assert_eq!(eval("<$1234"), 0x34);
        assert_eq!(eval(">$1234"), 0x12);
        assert_eq!(eval("~0"), -1);
        assert_eq!(eval("!5"), 0);
        assert_eq!(eval("!0"), 1);
    }

    #[test]
    fn nonassociable_ops_demand_parens() {
        assert!(parse_err("1 << 2 >> 3").contains("Mixing << and >> needs explicit parens"));
        assert!(parse_err("1 < 2 < 3").contains("Mixing < and < needs explicit parens"));
        assert!(parse_err("2 * 3 .mod 2").contains("Mixing * and .mod needs explicit parens"));
        // same-kind arithmetic associates fine
        assert_eq!(eval("1 + 2 - 3"), 0);
        assert_eq!(eval("8 / 2 * 3"), 12);
        assert_eq!(eval("(1 << 2) >> 1"), 2);
    }

    #[test]
    fn directive_spellings() {
        assert_eq!(eval("3 .bitand 6"), 2);
        assert_eq!(eval("1 .shl 4"), 16);
        assert_eq!(eval(".lobyte $1234"), 0x34);
        assert_eq!(eval("1 .and 2"), 2);
        assert_eq!(eval("0 .or 5"), 5);
    }

    #[test]
    fn logical_ops_return_operands() {
        assert_eq!(eval("3 && 7"), 7);
        assert_eq!(eval("0 && 7"), 0);
        assert_eq!(eval("0 || 5"), 5);
        assert_eq!(eval("2 || 5"), 2);
        assert_eq!(eval("2 .xor 0"), 2);
        assert_eq!(eval("0 .xor 3"), 3);
        assert_eq!(eval("2 .xor 3"), 0);
    }

    #[test]
    fn division_flavors() {
        assert_eq!(eval("7 / 2"), 3);
        assert_eq!(eval("-7 / 2"), -4);
        assert_eq!(eval("-7 .mod 2"), -1);
        assert!(eval_err("1 / 0").contains("Division by zero"));
        assert!(eval_err("1 .mod 0").contains("Modulo by zero"));
    }

    #[test]
    fn shifts_use_32_bit_semantics() {
        assert_eq!(eval("1 << 33"), 2);
        assert_eq!(eval("4294967295 >> 4"), 0x0fff_ffff);
        assert_eq!(eval("$80000000 >> 1"), 0x4000_0000);
    }

    #[test]
    fn functions() {
        assert_eq!(eval(".max(1, 5, 3)"), 5);
        assert_eq!(eval(".min(4, 2, 9)"), 2);
        assert_eq!(eval(".max(7)"), 7);
        assert_eq!(eval(".match(1, 2)"), 1);
        assert_eq!(eval(".match(1, \"a\")"), 0);
        assert_eq!(eval(".xmatch(\"a\", \"a\")"), 1);
        assert_eq!(eval(".xmatch(\"a\", \"b\")"), 0);
        assert_eq!(eval(".xmatch(3, 3)"), 1);
        assert!(parse_err(".byteat(1)").contains("No such function: .BYTEAT"));
        assert!(parse_err(".max 1").contains("Bad funcall"));
        assert!(parse_err(".max(1").contains("Never closed"));
    }

    #[test]
    fn literal_width_forces_size() {
        let expr = parse_only(&toks("$0012")).unwrap();
        assert_eq!(expr.size(), Some(2));
        let expr = parse_only(&toks("$12")).unwrap();
        assert_eq!(expr.size(), Some(1));
        let expr = parse_only(&toks("300")).unwrap();
        assert_eq!(expr.size(), Some(2));
        // comparison results are single-byte
        let expr = parse_only(&toks("1000 < 2000")).unwrap();
        assert_eq!(expr.size(), Some(1));
    }

    #[test]
    fn star_is_a_symbol() {
        let expr = parse_only(&toks("* + 2")).unwrap();
        assert_eq!(expr.op, "+");
        assert_eq!(expr.args[0].op, "sym");
        assert_eq!(expr.args[0].sym.as_deref(), Some("*"));
        // unresolved symbols pass through evaluation
        let out = evaluate_deep(&expr).unwrap();
        assert_eq!(out.op, "+");
    }

    #[test]
    fn parse_stops_at_commas_and_flags_garbage() {
        let tokens = toks("1 + 2, 3");
        let (expr, i) = parse(&tokens, 0).unwrap();
        assert_eq!(evaluate_deep(&expr).unwrap().num, Some(3));
        assert!(tokens[i].is_op(","));
        assert!(parse_err("1 2").contains("Garbage after expression: NUM[$2]"));
        assert!(parse_only(&[]).unwrap_err().to_string().contains("No expression?"));
    }

    #[test]
    fn relative_arithmetic() {
        // rel + abs keeps the relative meta wholesale
        let e = Expr {
            op: "+".to_string(),
            args: vec![rel_num(5, 0), Expr::num(3)],
            ..Expr::default()
        };
        let out = evaluate(e).unwrap();
        assert_eq!(out.num, Some(8));
        assert!(out.meta.unwrap().rel);
        assert_eq!(out.meta.unwrap().chunk, Some(0));
        // rel - rel in the same chunk is a plain number
        let e = Expr {
            op: "-".to_string(),
            args: vec![rel_num(5, 0), rel_num(2, 0)],
            ..Expr::default()
        };
        let out = evaluate(e).unwrap();
        assert_eq!(out.num, Some(3));
        assert!(out.meta.is_none());
        // different chunks defer
        let e = Expr {
            op: "-".to_string(),
            args: vec![rel_num(5, 0), rel_num(2, 1)],
            ..Expr::default()
        };
        assert_eq!(evaluate(e).unwrap().op, "-");
        // an org'd relative number becomes absolute
        let mut r = rel_num(4, 0);
        r.meta.as_mut().unwrap().org = Some(0x8000);
        let out = evaluate(r).unwrap();
        assert_eq!(out.num, Some(0x8004));
        assert!(!out.meta.unwrap().rel);
        assert_eq!(out.meta.unwrap().chunk, Some(0));
    }

    #[test]
    fn symbol_collection_keeps_duplicates() {
        let expr = parse_only(&toks("x + y * x")).unwrap();
        assert_eq!(symbols(&expr), vec!["x", "y", "x"]);
    }

    #[test]
    fn inversion() {
        let solve = |text: &str, result: i64| {
            let expr = parse_only(&toks(text)).unwrap();
            invert(&expr, "x", result)
        };
        assert_eq!(solve("x + 3", 10), Some(7));
        assert_eq!(solve("10 - x", 4), Some(6));
        assert_eq!(solve("x - 4", 10), Some(14));
        assert_eq!(solve("x * 4", 12), Some(3));
        assert_eq!(solve("x * 4", 10), None);
        assert_eq!(solve("x / 2", 5), Some(10));
        assert_eq!(solve("6 / x", 2), Some(3));
        assert_eq!(solve("x << 2", 12), Some(3));
        assert_eq!(solve("x >> 2", 3), Some(12));
        assert_eq!(solve("~x", -8), Some(7));
        assert_eq!(solve("<x", 0x34), Some(0x34));
        assert_eq!(solve(">x", 0x12), Some(0x1200));
        assert_eq!(solve(">x", 0x1234), None);
        // two occurrences are not solvable
        assert_eq!(solve("x + x", 4), None);
        // non-invertible ops
        assert_eq!(solve("x & 3", 1), None);
        assert_eq!(solve("x .mod 3", 1), None);
    }
}
