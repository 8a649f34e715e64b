//! Built-in linker layouts.
//!
//! A target names a segment table: where each segment sits in the
//! output file, where it is addressed in CPU memory, and which address
//! ranges are free for relocatable chunks.  Modules may still declare
//! or override segments on top of a preset.

use crate::module::Segment;

/// Looks up a preset segment table by name.
pub fn preset(name: &str) -> Option<Vec<Segment>> {
    match name {
        "sim" => Some(sim()),
        "nes-nrom" => Some(nes_nrom()),
        _ => None,
    }
}

/// Names of all built-in targets, for diagnostics.
pub fn names() -> &'static [&'static str] {
    &["sim", "nes-nrom"]
}

/// A flat layout for testing: one `code` segment mapped at `$200`.
fn sim() -> Vec<Segment> {
    vec![Segment {
        name: "code".to_string(),
        size: Some(0xfd00),
        offset: Some(0),
        memory: Some(0x200),
        default: true,
        free: vec![(0x200, 0xfd00)],
        ..Segment::default()
    }]
}

/// NES NROM cartridge: 16-byte iNES header, 32K PRG mapped at `$8000`,
/// 8K CHR appended after the PRG.
fn nes_nrom() -> Vec<Segment> {
    vec![
        Segment {
            name: "header".to_string(),
            size: Some(0x10),
            offset: Some(0),
            memory: Some(0),
            ..Segment::default()
        },
        Segment {
            name: "code".to_string(),
            size: Some(0x8000),
            offset: Some(0x10),
            memory: Some(0x8000),
            default: true,
            free: vec![(0x8000, 0x10000)],
            ..Segment::default()
        },
        Segment {
            name: "chr".to_string(),
            size: Some(0x2000),
            offset: Some(0x8010),
            memory: Some(0),
            ..Segment::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_by_name() {
        for name in names() {
            assert!(preset(name).is_some(), "{name}");
        }
        assert!(preset("c64").is_none());
    }

    #[test]
    fn sim_is_a_single_default_segment() {
        let segs = preset("sim").unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].name, "code");
        assert!(segs[0].default);
        assert!(segs[0].includes_org(0x200));
        assert!(!segs[0].includes_org(0x100));
        assert_eq!(segs[0].free, vec![(0x200, 0xfd00)]);
    }

    #[test]
    fn nes_nrom_lays_out_prg_then_chr() {
        let segs = preset("nes-nrom").unwrap();
        let code = segs.iter().find(|s| s.name == "code").unwrap();
        let chr = segs.iter().find(|s| s.name == "chr").unwrap();
        assert!(code.default);
        assert_eq!(code.offset, Some(0x10));
        assert_eq!(code.memory, Some(0x8000));
        assert_eq!(chr.offset, Some(0x8010));
        // prg ends exactly where chr begins in the file
        assert_eq!(
            code.offset.unwrap() + code.size.unwrap(),
            chr.offset.unwrap()
        );
    }
}
