//! 6502 instruction tables.

/// Addressing mode, used as a column index into [`MNEMONICS`] rows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Addr(pub u8);

#[rustfmt::skip]
impl Addr {
    pub const IMP: Self = Self(0);  //
    pub const IMM: Self = Self(1);  // #$00
    pub const ZPG: Self = Self(2);  // $00
    pub const ZPX: Self = Self(3);  // $00,X
    pub const ZPY: Self = Self(4);  // $00,Y
    pub const ABS: Self = Self(5);  // $0000
    pub const ABX: Self = Self(6);  // $0000,X
    pub const ABY: Self = Self(7);  // $0000,Y
    pub const IND: Self = Self(8);  // ($0000)
    pub const INX: Self = Self(9);  // ($00,X)
    pub const INY: Self = Self(10); // ($00),Y
    pub const REL: Self = Self(11); // ±$00
}

impl Addr {
    /// Bytes of operand that follow the opcode.
    pub fn operand_size(self) -> u32 {
        match self {
            Addr::IMP => 0,
            Addr::ABS | Addr::ABX | Addr::ABY | Addr::IND => 2,
            _ => 1,
        }
    }
}

const ____: u8 = 0x02; // $02 jams the CPU, so no official opcode uses it and it can stand in for a blank

#[rustfmt::skip]
const MNEMONICS: &[(Mne, &[u8; 12])] = &[
    //           imp   imm   zpg   zpx   zpy   abs   abx   aby   ind   inx   iny   rel
    (Mne::ADC, &[____, 0x69, 0x65, 0x75, ____, 0x6D, 0x7D, 0x79, ____, 0x61, 0x71, ____]),
    (Mne::AND, &[____, 0x29, 0x25, 0x35, ____, 0x2D, 0x3D, 0x39, ____, 0x21, 0x31, ____]),
    (Mne::ASL, &[0x0A, ____, 0x06, 0x16, ____, 0x0E, 0x1E, ____, ____, ____, ____, ____]),
    (Mne::BCC, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0x90]),
    (Mne::BCS, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0xB0]),
    (Mne::BEQ, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0xF0]),
    (Mne::BIT, &[____, ____, 0x24, ____, ____, 0x2C, ____, ____, ____, ____, ____, ____]),
    (Mne::BMI, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0x30]),
    (Mne::BNE, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0xD0]),
    (Mne::BPL, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0x10]),
    (Mne::BRK, &[0x00, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::BVC, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0x50]),
    (Mne::BVS, &[____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, 0x70]),
    (Mne::CLC, &[0x18, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::CLD, &[0xD8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::CLI, &[0x58, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::CLV, &[0xB8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::CMP, &[____, 0xC9, 0xC5, 0xD5, ____, 0xCD, 0xDD, 0xD9, ____, 0xC1, 0xD1, ____]),
    (Mne::CPX, &[____, 0xE0, 0xE4, ____, ____, 0xEC, ____, ____, ____, ____, ____, ____]),
    (Mne::CPY, &[____, 0xC0, 0xC4, ____, ____, 0xCC, ____, ____, ____, ____, ____, ____]),
    //           imp   imm   zpg   zpx   zpy   abs   abx   aby   ind   inx   iny   rel
    (Mne::DEC, &[____, ____, 0xC6, 0xD6, ____, 0xCE, 0xDE, ____, ____, ____, ____, ____]),
    (Mne::DEX, &[0xCA, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::DEY, &[0x88, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::EOR, &[____, 0x49, 0x45, 0x55, ____, 0x4D, 0x5D, 0x59, ____, 0x41, 0x51, ____]),
    (Mne::INC, &[____, ____, 0xE6, 0xF6, ____, 0xEE, 0xFE, ____, ____, ____, ____, ____]),
    (Mne::INX, &[0xE8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::INY, &[0xC8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::JMP, &[____, ____, ____, ____, ____, 0x4C, ____, ____, 0x6C, ____, ____, ____]),
    (Mne::JSR, &[____, ____, ____, ____, ____, 0x20, ____, ____, ____, ____, ____, ____]),
    (Mne::LDA, &[____, 0xA9, 0xA5, 0xB5, ____, 0xAD, 0xBD, 0xB9, ____, 0xA1, 0xB1, ____]),
    (Mne::LDX, &[____, 0xA2, 0xA6, ____, 0xB6, 0xAE, ____, 0xBE, ____, ____, ____, ____]),
    (Mne::LDY, &[____, 0xA0, 0xA4, 0xB4, ____, 0xAC, 0xBC, ____, ____, ____, ____, ____]),
    (Mne::LSR, &[0x4A, ____, 0x46, 0x56, ____, 0x4E, 0x5E, ____, ____, ____, ____, ____]),
    (Mne::NOP, &[0xEA, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::ORA, &[____, 0x09, 0x05, 0x15, ____, 0x0D, 0x1D, 0x19, ____, 0x01, 0x11, ____]),
    (Mne::PHA, &[0x48, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::PHP, &[0x08, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::PLA, &[0x68, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::PLP, &[0x28, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    //           imp   imm   zpg   zpx   zpy   abs   abx   aby   ind   inx   iny   rel
    (Mne::ROL, &[0x2A, ____, 0x26, 0x36, ____, 0x2E, 0x3E, ____, ____, ____, ____, ____]),
    (Mne::ROR, &[0x6A, ____, 0x66, 0x76, ____, 0x6E, 0x7E, ____, ____, ____, ____, ____]),
    (Mne::RTI, &[0x40, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::RTS, &[0x60, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::SBC, &[____, 0xE9, 0xE5, 0xF5, ____, 0xED, 0xFD, 0xF9, ____, 0xE1, 0xF1, ____]),
    (Mne::SEC, &[0x38, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::SED, &[0xF8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::SEI, &[0x78, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::STA, &[____, ____, 0x85, 0x95, ____, 0x8D, 0x9D, 0x99, ____, 0x81, 0x91, ____]),
    (Mne::STX, &[____, ____, 0x86, ____, 0x96, 0x8E, ____, ____, ____, ____, ____, ____]),
    (Mne::STY, &[____, ____, 0x84, 0x94, ____, 0x8C, ____, ____, ____, ____, ____, ____]),
    (Mne::TAX, &[0xAA, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::TAY, &[0xA8, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::TSX, &[0xBA, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::TXA, &[0x8A, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::TXS, &[0x9A, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
    (Mne::TYA, &[0x98, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____, ____]),
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mne(pub &'static str);

impl Mne {
    const ADC: Self = Self("ADC");
    const AND: Self = Self("AND");
    const ASL: Self = Self("ASL");
    const BCC: Self = Self("BCC");
    const BCS: Self = Self("BCS");
    const BEQ: Self = Self("BEQ");
    const BIT: Self = Self("BIT");
    const BMI: Self = Self("BMI");
    const BNE: Self = Self("BNE");
    const BPL: Self = Self("BPL");
    const BRK: Self = Self("BRK");
    const BVC: Self = Self("BVC");
    const BVS: Self = Self("BVS");
    const CLC: Self = Self("CLC");
    const CLD: Self = Self("CLD");
    const CLI: Self = Self("CLI");
    const CLV: Self = Self("CLV");
    const CMP: Self = Self("CMP");
    const CPX: Self = Self("CPX");
    const CPY: Self = Self("CPY");
    const DEC: Self = Self("DEC");
    const DEX: Self = Self("DEX");
    const DEY: Self = Self("DEY");
    const EOR: Self = Self("EOR");
    const INC: Self = Self("INC");
    const INX: Self = Self("INX");
    const INY: Self = Self("INY");
    const JMP: Self = Self("JMP");
    const JSR: Self = Self("JSR");
    const LDA: Self = Self("LDA");
    const LDX: Self = Self("LDX");
    const LDY: Self = Self("LDY");
    const LSR: Self = Self("LSR");
    const NOP: Self = Self("NOP");
    const ORA: Self = Self("ORA");
    const PHA: Self = Self("PHA");
    const PHP: Self = Self("PHP");
    const PLA: Self = Self("PLA");
    const PLP: Self = Self("PLP");
    const ROL: Self = Self("ROL");
    const ROR: Self = Self("ROR");
    const RTI: Self = Self("RTI");
    const RTS: Self = Self("RTS");
    const SBC: Self = Self("SBC");
    const SEC: Self = Self("SEC");
    const SED: Self = Self("SED");
    const SEI: Self = Self("SEI");
    const STA: Self = Self("STA");
    const STX: Self = Self("STX");
    const STY: Self = Self("STY");
    const TAX: Self = Self("TAX");
    const TAY: Self = Self("TAY");
    const TSX: Self = Self("TSX");
    const TXA: Self = Self("TXA");
    const TXS: Self = Self("TXS");
    const TYA: Self = Self("TYA");
}

/// Case-insensitive mnemonic lookup.
pub fn lookup(name: &str) -> Option<&'static [u8; 12]> {
    MNEMONICS
        .iter()
        .find(|mne| mne.0 .0.eq_ignore_ascii_case(name))
        .map(|mne| mne.1)
}

/// Picks the opcode for a mode out of a mnemonic row.
pub fn opcode(row: &[u8; 12], addr: Addr) -> Option<u8> {
    let op = row[addr.0 as usize];
    (op != ____).then_some(op)
}

/// Branch instructions take a one-byte pc-relative operand.
pub fn is_relative(row: &[u8; 12]) -> bool {
    opcode(row, Addr::REL).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup("lda").is_some());
        assert!(lookup("LDA").is_some());
        assert!(lookup("Lda").is_some());
        assert!(lookup("ldq").is_none());
    }

    #[test]
    fn opcode_selection() {
        let lda = lookup("lda").unwrap();
        assert_eq!(opcode(lda, Addr::IMM), Some(0xA9));
        assert_eq!(opcode(lda, Addr::ABS), Some(0xAD));
        assert_eq!(opcode(lda, Addr::IMP), None);
        let sta = lookup("sta").unwrap();
        assert_eq!(opcode(sta, Addr::IMM), None);
        assert_eq!(opcode(sta, Addr::INY), Some(0x91));
        let stx = lookup("stx").unwrap();
        assert_eq!(opcode(stx, Addr::ZPY), Some(0x96));
        let jmp = lookup("jmp").unwrap();
        assert_eq!(opcode(jmp, Addr::IND), Some(0x6C));
        let brk = lookup("brk").unwrap();
        assert_eq!(opcode(brk, Addr::IMP), Some(0x00));
    }

    #[test]
    fn branches_are_relative() {
        assert!(is_relative(lookup("bne").unwrap()));
        assert_eq!(opcode(lookup("bcc").unwrap(), Addr::REL), Some(0x90));
        assert!(!is_relative(lookup("jmp").unwrap()));
    }

    #[test]
    fn operand_sizes() {
        assert_eq!(Addr::IMP.operand_size(), 0);
        assert_eq!(Addr::IMM.operand_size(), 1);
        assert_eq!(Addr::ZPX.operand_size(), 1);
        assert_eq!(Addr::REL.operand_size(), 1);
        assert_eq!(Addr::ABS.operand_size(), 2);
        assert_eq!(Addr::IND.operand_size(), 2);
    }
}
