//! Object file model.
//!
//! A module is the unit the assembler produces and the linker consumes:
//! relocatable chunks of data with pending substitutions, a symbol
//! table, and any segment definitions the source declared.  Modules
//! serialize to JSON.

use serde_derive::{Deserialize, Serialize};

use crate::expr::Expr;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    /// Offset into the chunk to substitute the expression into.
    pub offset: usize,
    /// Number of bytes to substitute.
    pub size: u32,
    /// Expression to substitute.
    pub expr: Expr,
}

/// How overwriting previously-written fixed-position data is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteMode {
    Forbid,
    #[default]
    Allow,
    Require,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Human-readable identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Which segments this chunk may be located in.
    pub segments: Vec<String>,
    /// Absolute address of the start of the chunk, if not relocatable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<i64>,
    pub data: Vec<u8>,
    /// Substitutions to insert into the data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<Substitution>,
    /// Assertions within this chunk.  Each expression must be nonzero.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asserts: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<OverwriteMode>,
}

impl Chunk {
    pub fn overwrite(&self) -> OverwriteMode {
        self.overwrite.unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    /// Name to export this symbol as, for importing into other objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
    /// Value of the symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Name of the segment, as used in .segment directives.
    pub name: String,
    /// Bank for the segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank: Option<i64>,
    /// Segment size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Offset of the segment in the rom image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// Memory location of the segment in the CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    /// Address size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressing: Option<i64>,
    /// Value to fill unused space with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<i64>,
    /// Whether the segment is written to the output file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<bool>,
    /// Name of the segment that this one is placed inside.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,
    /// True if this is the segment to use when none is named.
    #[serde(default, skip_serializing_if = "std::ops::Not::not", rename = "default")]
    pub default: bool,
    /// Unallocated address ranges, half-open `[a, b)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub free: Vec<(i64, i64)>,
}

impl Segment {
    pub fn new(name: &str) -> Segment {
        Segment {
            name: name.to_string(),
            ..Segment::default()
        }
    }

    /// Overlays `b` on top of `a`: fields present in `b` win, free
    /// ranges concatenate.
    pub fn merge(a: &Segment, b: &Segment) -> Segment {
        let mut free = a.free.clone();
        free.extend_from_slice(&b.free);
        Segment {
            name: b.name.clone(),
            bank: b.bank.or(a.bank),
            size: b.size.or(a.size),
            offset: b.offset.or(a.offset),
            memory: b.memory.or(a.memory),
            addressing: b.addressing.or(a.addressing),
            fill: b.fill.or(a.fill),
            out: b.out.or(a.out),
            overlay: b.overlay.clone().or_else(|| a.overlay.clone()),
            default: a.default || b.default,
            free,
        }
    }

    pub fn includes_org(&self, addr: i64) -> bool {
        match (self.memory, self.size) {
            (Some(memory), Some(size)) => addr >= memory && addr < memory + size,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Filename if loaded from a file, otherwise a user-provided name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// All chunks, in a deterministic (indexable) order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
    /// All symbols, in a deterministic (indexable) order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<Symbol>,
    /// All segments.  Indexed by name, but order is preserved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlays_and_concatenates_free() {
        let a = Segment {
            name: "code".to_string(),
            size: Some(0x8000),
            memory: Some(0x8000),
            fill: Some(0xff),
            free: vec![(0x8000, 0x9000)],
            ..Segment::default()
        };
        let b = Segment {
            name: "code".to_string(),
            fill: Some(0x00),
            default: true,
            free: vec![(0xa000, 0xb000)],
            ..Segment::default()
        };
        let m = Segment::merge(&a, &b);
        assert_eq!(m.size, Some(0x8000));
        assert_eq!(m.fill, Some(0x00));
        assert!(m.default);
        assert_eq!(m.free, vec![(0x8000, 0x9000), (0xa000, 0xb000)]);
    }

    #[test]
    fn includes_org_needs_bounds() {
        let seg = Segment {
            name: "code".to_string(),
            memory: Some(0x8000),
            size: Some(0x2000),
            ..Segment::default()
        };
        assert!(seg.includes_org(0x8000));
        assert!(seg.includes_org(0x9fff));
        assert!(!seg.includes_org(0xa000));
        assert!(!seg.includes_org(0x7fff));
        assert!(!Segment::new("code").includes_org(0x8000));
    }

    #[test]
    fn module_json_shape() {
        let module = Module {
            name: Some("test.s".to_string()),
            chunks: vec![Chunk {
                segments: vec!["code".to_string()],
                org: Some(0x8000),
                data: vec![0xa9, 0x00],
                ..Chunk::default()
            }],
            ..Module::default()
        };
        let json = serde_json::to_string(&module).unwrap();
        assert!(json.contains("\"data\":[169,0]"), "{json}");
        assert!(!json.contains("subs"), "{json}");
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back, module);
        // a plain assembly line is not a module
        assert!(serde_json::from_str::<Module>("lda #3").is_err());
    }
}
