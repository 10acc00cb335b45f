use crate::cpu::register::{R16, R8};

#[cfg(test)]
#[path = "./encoding_test.rs"]
mod encoding_test;

/// operations the catalog can encode and the CPU can execute
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Op {
    Mov, Xchg, Lea,
    Push, Pop,
    Add, Sub, Cmp, Inc, Dec, Neg,
    Mul, Imul, Div, Idiv,
    And, Or, Xor, Test, Not,
    Rol, Ror, Rcl, Rcr, Shl, Shr, Sar,
    Movsb, Lodsb, Stosb, Cmpsb,
    Jmp, Call, Ret,
    Jz, Jnz, Jc, Jnc,
    Nop, Hlt, Clc, Stc, Cmc,
}

impl Op {
    /// mnemonic lookup, including the aliased condition names
    pub fn from_name(name: &str) -> Option<Op> {
        match name {
            "MOV" => Some(Op::Mov),
            "XCHG" => Some(Op::Xchg),
            "LEA" => Some(Op::Lea),
            "PUSH" => Some(Op::Push),
            "POP" => Some(Op::Pop),
            "ADD" => Some(Op::Add),
            "SUB" => Some(Op::Sub),
            "CMP" => Some(Op::Cmp),
            "INC" => Some(Op::Inc),
            "DEC" => Some(Op::Dec),
            "NEG" => Some(Op::Neg),
            "MUL" => Some(Op::Mul),
            "IMUL" => Some(Op::Imul),
            "DIV" => Some(Op::Div),
            "IDIV" => Some(Op::Idiv),
            "AND" => Some(Op::And),
            "OR" => Some(Op::Or),
            "XOR" => Some(Op::Xor),
            "TEST" => Some(Op::Test),
            "NOT" => Some(Op::Not),
            "ROL" => Some(Op::Rol),
            "ROR" => Some(Op::Ror),
            "RCL" => Some(Op::Rcl),
            "RCR" => Some(Op::Rcr),
            "SHL" | "SAL" => Some(Op::Shl),
            "SHR" => Some(Op::Shr),
            "SAR" => Some(Op::Sar),
            "MOVSB" => Some(Op::Movsb),
            "LODSB" => Some(Op::Lodsb),
            "STOSB" => Some(Op::Stosb),
            "CMPSB" => Some(Op::Cmpsb),
            "JMP" => Some(Op::Jmp),
            "CALL" => Some(Op::Call),
            "RET" => Some(Op::Ret),
            "JE" | "JZ" => Some(Op::Jz),
            "JNE" | "JNZ" => Some(Op::Jnz),
            "JC" => Some(Op::Jc),
            "JNC" => Some(Op::Jnc),
            "NOP" => Some(Op::Nop),
            "HLT" => Some(Op::Hlt),
            "CLC" => Some(Op::Clc),
            "STC" => Some(Op::Stc),
            "CMC" => Some(Op::Cmc),
            _ => None,
        }
    }
}

/// how an instruction's operands are laid out in machine code
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Encoding {
    /// bare opcode byte
    Plain,
    /// opcode + register index
    RegInOpcode,
    /// opcode + register index, then imm16 (the MOV reg,imm form)
    RegInOpcodeImm,
    /// opcode, then mod=11 ModR/M with reg=source, rm=destination
    ModRmRegReg,
    /// accumulator form: opcode, then imm16
    AccImm,
    /// 0x81 family: opcode, ModR/M with the group extension, imm16
    GroupImm(u8),
    /// 0xF7 family: opcode, ModR/M with the group extension
    GroupF7(u8),
    /// 0xF7/0 TEST: ModR/M then imm16
    GroupF7Imm(u8),
    /// 0xD1/0xD3 shift and rotate family
    GroupShift(u8),
    /// opcode, signed 8-bit displacement
    RelShort,
    /// opcode, signed 16-bit displacement
    RelNear,
    /// 0x8D with mod=0 rm=6: opcode, ModR/M, direct address
    LeaDirect,
}

/// operand pattern an instruction form accepts, most specific patterns
/// are matched before generic ones (see `candidate_forms`)
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Form {
    /// no operands
    Bare,
    /// one word register
    Reg,
    /// register, register
    RegReg,
    /// AX paired with any word register (XCHG fast form)
    AxReg,
    /// register, CL (shift count in CL)
    RegCl,
    /// register, literal 1 (shift by one)
    RegOne,
    /// register, immediate
    RegImm,
    /// AX, immediate
    AccImm,
    /// register, label or address literal
    RegAddr,
    /// one label or address literal (relative transfer target)
    Rel,
}

/// one encodable instruction form
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct InsnDesc {
    pub op: Op,
    pub form: Form,
    pub opcode: u8,
    pub size: u8,
    pub encoding: Encoding,
}

const fn desc(op: Op, form: Form, opcode: u8, size: u8, encoding: Encoding) -> InsnDesc {
    InsnDesc { op, form, opcode, size, encoding }
}

/// the shared instruction catalog. The assembler resolves descriptors from
/// it and the CPU's dispatch table is built from it, so the two sides
/// cannot disagree on opcodes or sizes.
pub static CATALOG: &[InsnDesc] = &[
    desc(Op::Mov, Form::RegReg, 0x89, 2, Encoding::ModRmRegReg),
    desc(Op::Mov, Form::RegImm, 0xB8, 3, Encoding::RegInOpcodeImm),
    desc(Op::Xchg, Form::AxReg, 0x90, 1, Encoding::RegInOpcode),
    desc(Op::Xchg, Form::RegReg, 0x87, 2, Encoding::ModRmRegReg),
    desc(Op::Lea, Form::RegAddr, 0x8D, 4, Encoding::LeaDirect),

    desc(Op::Push, Form::Reg, 0x50, 1, Encoding::RegInOpcode),
    desc(Op::Pop, Form::Reg, 0x58, 1, Encoding::RegInOpcode),

    desc(Op::Add, Form::RegReg, 0x01, 2, Encoding::ModRmRegReg),
    desc(Op::Add, Form::AccImm, 0x05, 3, Encoding::AccImm),
    desc(Op::Add, Form::RegImm, 0x81, 4, Encoding::GroupImm(0)),
    desc(Op::Sub, Form::RegReg, 0x29, 2, Encoding::ModRmRegReg),
    desc(Op::Sub, Form::AccImm, 0x2D, 3, Encoding::AccImm),
    desc(Op::Sub, Form::RegImm, 0x81, 4, Encoding::GroupImm(5)),
    desc(Op::Cmp, Form::RegReg, 0x39, 2, Encoding::ModRmRegReg),
    desc(Op::Cmp, Form::AccImm, 0x3D, 3, Encoding::AccImm),
    desc(Op::Cmp, Form::RegImm, 0x81, 4, Encoding::GroupImm(7)),
    desc(Op::Inc, Form::Reg, 0x40, 1, Encoding::RegInOpcode),
    desc(Op::Dec, Form::Reg, 0x48, 1, Encoding::RegInOpcode),

    desc(Op::And, Form::RegReg, 0x21, 2, Encoding::ModRmRegReg),
    desc(Op::And, Form::AccImm, 0x25, 3, Encoding::AccImm),
    desc(Op::And, Form::RegImm, 0x81, 4, Encoding::GroupImm(4)),
    desc(Op::Or, Form::RegReg, 0x09, 2, Encoding::ModRmRegReg),
    desc(Op::Or, Form::AccImm, 0x0D, 3, Encoding::AccImm),
    desc(Op::Or, Form::RegImm, 0x81, 4, Encoding::GroupImm(1)),
    desc(Op::Xor, Form::RegReg, 0x31, 2, Encoding::ModRmRegReg),
    desc(Op::Xor, Form::AccImm, 0x35, 3, Encoding::AccImm),
    desc(Op::Xor, Form::RegImm, 0x81, 4, Encoding::GroupImm(6)),
    desc(Op::Test, Form::RegReg, 0x85, 2, Encoding::ModRmRegReg),
    desc(Op::Test, Form::RegImm, 0xF7, 4, Encoding::GroupF7Imm(0)),

    desc(Op::Not, Form::Reg, 0xF7, 2, Encoding::GroupF7(2)),
    desc(Op::Neg, Form::Reg, 0xF7, 2, Encoding::GroupF7(3)),
    desc(Op::Mul, Form::Reg, 0xF7, 2, Encoding::GroupF7(4)),
    desc(Op::Imul, Form::Reg, 0xF7, 2, Encoding::GroupF7(5)),
    desc(Op::Div, Form::Reg, 0xF7, 2, Encoding::GroupF7(6)),
    desc(Op::Idiv, Form::Reg, 0xF7, 2, Encoding::GroupF7(7)),

    desc(Op::Rol, Form::RegOne, 0xD1, 2, Encoding::GroupShift(0)),
    desc(Op::Ror, Form::RegOne, 0xD1, 2, Encoding::GroupShift(1)),
    desc(Op::Rcl, Form::RegOne, 0xD1, 2, Encoding::GroupShift(2)),
    desc(Op::Rcr, Form::RegOne, 0xD1, 2, Encoding::GroupShift(3)),
    desc(Op::Shl, Form::RegOne, 0xD1, 2, Encoding::GroupShift(4)),
    desc(Op::Shr, Form::RegOne, 0xD1, 2, Encoding::GroupShift(5)),
    desc(Op::Sar, Form::RegOne, 0xD1, 2, Encoding::GroupShift(7)),
    desc(Op::Rol, Form::RegCl, 0xD3, 2, Encoding::GroupShift(0)),
    desc(Op::Ror, Form::RegCl, 0xD3, 2, Encoding::GroupShift(1)),
    desc(Op::Rcl, Form::RegCl, 0xD3, 2, Encoding::GroupShift(2)),
    desc(Op::Rcr, Form::RegCl, 0xD3, 2, Encoding::GroupShift(3)),
    desc(Op::Shl, Form::RegCl, 0xD3, 2, Encoding::GroupShift(4)),
    desc(Op::Shr, Form::RegCl, 0xD3, 2, Encoding::GroupShift(5)),
    desc(Op::Sar, Form::RegCl, 0xD3, 2, Encoding::GroupShift(7)),

    desc(Op::Movsb, Form::Bare, 0xA4, 1, Encoding::Plain),
    desc(Op::Cmpsb, Form::Bare, 0xA6, 1, Encoding::Plain),
    desc(Op::Stosb, Form::Bare, 0xAA, 1, Encoding::Plain),
    desc(Op::Lodsb, Form::Bare, 0xAC, 1, Encoding::Plain),

    desc(Op::Jmp, Form::Rel, 0xE9, 3, Encoding::RelNear),
    desc(Op::Call, Form::Rel, 0xE8, 3, Encoding::RelNear),
    desc(Op::Ret, Form::Bare, 0xC3, 1, Encoding::Plain),
    desc(Op::Jz, Form::Rel, 0x74, 2, Encoding::RelShort),
    desc(Op::Jnz, Form::Rel, 0x75, 2, Encoding::RelShort),
    desc(Op::Jc, Form::Rel, 0x72, 2, Encoding::RelShort),
    desc(Op::Jnc, Form::Rel, 0x73, 2, Encoding::RelShort),

    desc(Op::Nop, Form::Bare, 0x90, 1, Encoding::Plain),
    desc(Op::Hlt, Form::Bare, 0xF4, 1, Encoding::Plain),
    desc(Op::Clc, Form::Bare, 0xF8, 1, Encoding::Plain),
    desc(Op::Stc, Form::Bare, 0xF9, 1, Encoding::Plain),
    desc(Op::Cmc, Form::Bare, 0xF5, 1, Encoding::Plain),
];

/// a classified assembler operand
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Reg16(R16),
    Reg8(R8),
    Imm(i32),
    Label(String),
}

/// the forms an operand list can match, most specific first. `ADD AX, 2`
/// tries the accumulator row before the generic reg,imm row; `SHL AX, 1`
/// tries the shift-by-one row first.
pub fn candidate_forms(operands: &[Operand]) -> Vec<Form> {
    match operands {
        [] => vec![Form::Bare],
        [Operand::Reg16(_)] => vec![Form::Reg],
        [Operand::Imm(_)] | [Operand::Label(_)] => vec![Form::Rel],
        [Operand::Reg16(a), Operand::Reg16(b)] => {
            if *a == R16::AX || *b == R16::AX {
                vec![Form::AxReg, Form::RegReg]
            } else {
                vec![Form::RegReg]
            }
        }
        [Operand::Reg16(_), Operand::Reg8(R8::CL)] => vec![Form::RegCl],
        [Operand::Reg16(r), Operand::Imm(imm)] => {
            let mut forms = Vec::new();
            if *imm == 1 {
                forms.push(Form::RegOne);
            }
            if *r == R16::AX {
                forms.push(Form::AccImm);
            }
            forms.push(Form::RegImm);
            forms.push(Form::RegAddr);
            forms
        }
        [Operand::Reg16(_), Operand::Label(_)] => vec![Form::RegAddr],
        _ => Vec::new(),
    }
}

/// finds the catalog row for a mnemonic with the given operands
pub fn resolve(op: Op, operands: &[Operand]) -> Option<&'static InsnDesc> {
    for form in candidate_forms(operands) {
        if let Some(entry) = CATALOG.iter().find(|e| e.op == op && e.form == form) {
            return Some(entry);
        }
    }
    None
}

/// Instruction encoding layout for Mod/Reg/RM byte
#[derive(Debug)]
pub struct ModRegRm {
    /// "mod" is the correct name, but is a reserved keyword
    /// High 2 bits
    pub md: u8,

    /// mid 3 bits
    pub reg: u8,

    /// low 3 bits
    pub rm: u8,
}

impl ModRegRm {
    pub fn from_u8(b: u8) -> Self {
        ModRegRm {
            md: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }

    pub fn u8(&self) -> u8 {
        (self.md << 6) |  // high 2 bits
        (self.reg << 3) | // mid 3 bits
        self.rm           // low 3 bits
    }

    /// md 3 = register addressing
    pub fn rm_reg(rm: u8, reg: u8) -> u8 {
        ModRegRm { md: 3, reg, rm }.u8()
    }
}

/// what the opcode byte alone tells the executor
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DispatchEntry {
    /// a fully identified instruction; `base` recovers the register index
    /// for the reg-in-opcode encodings
    Single { op: Op, encoding: Encoding, base: u8 },
    /// a group opcode, sub-operation selected by the ModR/M reg field
    Group { opcode: u8 },
}

/// flat opcode dispatch table, derived from `CATALOG`
pub struct Dispatch {
    table: [Option<DispatchEntry>; 256],
}

impl Dispatch {
    pub fn from_catalog() -> Self {
        let mut table = [None; 256];

        // reg-in-opcode rows claim eight consecutive bytes
        for e in CATALOG {
            match e.encoding {
                Encoding::RegInOpcode | Encoding::RegInOpcodeImm => {
                    for r in 0..8u8 {
                        let b = e.opcode + r;
                        table[b as usize] = Some(DispatchEntry::Single {
                            op: e.op,
                            encoding: e.encoding,
                            base: e.opcode,
                        });
                    }
                }
                _ => {}
            }
        }

        // exact single-byte claims win over range claims (NOP sits at 0x90
        // inside the XCHG AX fast-form range)
        for e in CATALOG {
            match e.encoding {
                Encoding::RegInOpcode | Encoding::RegInOpcodeImm => {}
                Encoding::GroupImm(_)
                | Encoding::GroupF7(_)
                | Encoding::GroupF7Imm(_)
                | Encoding::GroupShift(_) => {
                    table[e.opcode as usize] = Some(DispatchEntry::Group { opcode: e.opcode });
                }
                _ => {
                    table[e.opcode as usize] = Some(DispatchEntry::Single {
                        op: e.op,
                        encoding: e.encoding,
                        base: e.opcode,
                    });
                }
            }
        }

        Dispatch { table }
    }

    pub fn entry(&self, opcode: u8) -> Option<DispatchEntry> {
        self.table[opcode as usize]
    }

    /// resolves a group sub-operation from the ModR/M reg field
    pub fn group_op(opcode: u8, ext: u8) -> Option<(Op, Encoding)> {
        CATALOG.iter().find_map(|e| {
            if e.opcode != opcode {
                return None;
            }
            match e.encoding {
                Encoding::GroupImm(g)
                | Encoding::GroupF7(g)
                | Encoding::GroupF7Imm(g)
                | Encoding::GroupShift(g) if g == ext => Some((e.op, e.encoding)),
                _ => None,
            }
        })
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::from_catalog()
    }
}
