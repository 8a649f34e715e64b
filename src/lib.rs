//! A 6502 cross-assembler and linker.
//!
//! Source text is tokenized ([`tokenizer`]), macro-expanded
//! ([`preprocessor`]), and assembled ([`asm`]) into relocatable
//! [`module`]s that serialize as JSON.  The [`link`] stage merges
//! modules, lays chunks out into segments, patches unresolved
//! expressions, and produces either a flat binary or an IPS patch.

use std::error;

use thiserror::Error as ThisError;

use crate::asm::Assembler;
use crate::host::Host;
use crate::module::Module;
use crate::preprocessor::Preprocessor;
use crate::tokenizer::Tokenizer;
use crate::tokenstream::TokenStream;

pub mod asm;
pub mod cpu;
pub mod expr;
pub mod host;
pub mod ips;
pub mod link;
pub mod macros;
pub mod module;
pub mod preprocessor;
pub mod target;
pub mod token;
pub mod tokenstream;
pub mod tokenizer;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed source text: tokenizer, parser, and preprocessor failures.
    #[error("{0}")]
    Syntax(String),

    /// Undefined, redefined, or unresolvable symbols and scopes.
    #[error("{0}")]
    Symbol(String),

    /// Expression evaluation failures.
    #[error("{0}")]
    Eval(String),

    /// Link-time layout failures: segment overflow, overwrite conflicts,
    /// and substitutions that do not fit their patch size.
    #[error("{0}")]
    Layout(String),

    /// A `.assert` that evaluated to zero at link time.
    #[error("{0}")]
    Assertion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Options shared by everything that turns source text into a module.
#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    /// Directories searched by `.include` and `.incbin`, in order.
    pub include_paths: Vec<String>,
    /// Symbols pre-defined on the command line, as if by `name = value`.
    pub defines: Vec<(String, i64)>,
}

/// Assembles one translation unit into a relocatable module.
pub fn assemble_source(
    host: &dyn Host,
    text: &str,
    name: &str,
    opts: &SourceOptions,
) -> Result<Module> {
    let mut asm = Assembler::new();
    for (sym, value) in &opts.defines {
        asm.assign(sym, *value)?;
    }
    let mut stream = TokenStream::new(host, opts.include_paths.clone());
    stream.enter(Some(Tokenizer::new(text, name)))?;
    let mut pre = Preprocessor::new(stream);
    asm.assemble(&mut pre)?;
    let mut module = asm.module()?;
    module.name = Some(name.to_string());
    Ok(module)
}

/// Interprets file text as either an already-assembled module or as
/// source code.  Modules are recognized by parsing as JSON; anything
/// else is assembled.
pub fn module_from_text(
    host: &dyn Host,
    text: &str,
    name: &str,
    opts: &SourceOptions,
) -> Result<Module> {
    if let Ok(module) = serde_json::from_str::<Module>(text) {
        return Ok(module);
    }
    assemble_source(host, text, name, opts)
}

/// Parses a `NAME[=value]` command-line define.  Values accept `$` hex
/// and `%` binary prefixes; a bare name defines the symbol as 1.
pub fn parse_defines(
    s: &str,
) -> std::result::Result<(String, i64), Box<dyn error::Error + Send + Sync + 'static>> {
    let (name, value) = match s.split_once('=') {
        Some((name, value)) => (name, value),
        None => return Ok((s.to_string(), 1)),
    };
    if name.is_empty() {
        return Err(format!("invalid SYMBOL=value: empty name in `{s}`").into());
    }
    let value = if let Some(hex) = value.strip_prefix('$') {
        i64::from_str_radix(hex, 16)?
    } else if let Some(bin) = value.strip_prefix('%') {
        i64::from_str_radix(bin, 2)?
    } else {
        value.parse()?
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_parse_bases() {
        assert_eq!(parse_defines("FOO=$10").unwrap(), ("FOO".into(), 16));
        assert_eq!(parse_defines("FOO=%101").unwrap(), ("FOO".into(), 5));
        assert_eq!(parse_defines("FOO=12").unwrap(), ("FOO".into(), 12));
        assert_eq!(parse_defines("FOO").unwrap(), ("FOO".into(), 1));
        assert!(parse_defines("=3").is_err());
        assert!(parse_defines("FOO=bar").is_err());
    }
}
