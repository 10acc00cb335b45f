use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::asm::{lex, parse_line};
use crate::cpu::{resolve, Encoding, Form, InsnDesc, ModRegRm, Op, Operand, R16, R8};
use crate::hex::hex_bytes_separated;

#[cfg(test)]
#[path = "./assembler_test.rs"]
mod assembler_test;

/// assembly is all-or-nothing; the first error aborts the whole call
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AsmError {
    #[error("line {line}: unknown instruction {form}")]
    UnknownInstruction { line: usize, form: String },

    #[error("line {line}: bad label {label}")]
    BadLabel { line: usize, label: String },

    #[error("line {line}: duplicate label {label}")]
    DuplicateLabel { line: usize, label: String },

    #[error("line {line}: undefined label {label}")]
    UndefinedLabel { line: usize, label: String },

    #[error("Jump to {label} is too far")]
    JumpOutOfRange { label: String },

    #[error("line {line}: bad operand {operand}")]
    BadOperand { line: usize, operand: String },

    #[error("line {line}: shift count must be 1 or CL")]
    ShiftCount { line: usize },
}

/// the owned, immutable output of a successful assembly
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assembly {
    /// the byte stream the CPU consumes verbatim from CS:0000
    pub machine_code: Vec<u8>,
    /// label → offset from the start of the emitted code
    pub symbol_table: HashMap<String, u16>,
    /// space-separated uppercase hex rendering of `machine_code`
    pub hex_string: String,
}

/// a resolved statement carried from pass 1 to pass 2
struct Statement {
    line: usize,
    operands: Vec<Operand>,
    desc: &'static InsnDesc,
    offset: u16,
}

/// two passes over the parsed lines: pass 1 assigns offsets and records
/// labels, pass 2 emits bytes and resolves label displacements
pub fn assemble(source: &str) -> Result<Assembly, AsmError> {
    let lines = lex(source);

    // pass 1
    let mut symbols: HashMap<String, u16> = HashMap::new();
    let mut statements = Vec::new();
    let mut offset: u16 = 0;
    for line in &lines {
        let parsed = parse_line(line)?;
        if let Some(ref label) = parsed.label {
            if symbols.insert(label.clone(), offset).is_some() {
                return Err(AsmError::DuplicateLabel { line: parsed.number, label: label.clone() });
            }
        }
        let mnemonic = match parsed.mnemonic {
            Some(ref m) => m,
            None => continue,
        };
        let op = Op::from_name(&mnemonic).ok_or_else(|| AsmError::UnknownInstruction {
            line: parsed.number,
            form: mnemonic.clone(),
        })?;
        let operands = parsed
            .operands
            .iter()
            .map(|tok| classify_operand(tok, parsed.number))
            .collect::<Result<Vec<_>, _>>()?;
        let desc = match resolve(op, &operands) {
            Some(d) => d,
            None => return Err(resolve_failure(op, &mnemonic, &operands, parsed.number)),
        };
        statements.push(Statement {
            line: parsed.number,
            operands,
            desc,
            offset,
        });
        offset = offset.wrapping_add(u16::from(desc.size));
    }
    debug!(
        "pass 1: {} statements, {} labels, {} bytes",
        statements.len(),
        symbols.len(),
        offset
    );

    // pass 2
    let mut out: Vec<u8> = Vec::with_capacity(offset as usize);
    for stmt in &statements {
        emit(stmt, &symbols, &mut out)?;
    }
    debug!("pass 2: emitted {} bytes", out.len());

    let hex_string = hex_bytes_separated(&out, ' ');
    Ok(Assembly {
        machine_code: out,
        symbol_table: symbols,
        hex_string,
    })
}

fn emit(stmt: &Statement, symbols: &HashMap<String, u16>, out: &mut Vec<u8>) -> Result<(), AsmError> {
    let desc = stmt.desc;
    match desc.encoding {
        Encoding::Plain => out.push(desc.opcode),
        Encoding::RegInOpcode => {
            let r = match desc.form {
                // the fast form encodes the non-AX side
                Form::AxReg => match (&stmt.operands[0], &stmt.operands[1]) {
                    (Operand::Reg16(R16::AX), Operand::Reg16(other)) => *other,
                    (Operand::Reg16(other), _) => *other,
                    _ => unreachable!(),
                },
                _ => reg16_operand(&stmt.operands[0]),
            };
            out.push(desc.opcode + r.index() as u8);
        }
        Encoding::RegInOpcodeImm => {
            let r = reg16_operand(&stmt.operands[0]);
            out.push(desc.opcode + r.index() as u8);
            push_u16(out, imm_operand(&stmt.operands[1]));
        }
        Encoding::ModRmRegReg => {
            let dst = reg16_operand(&stmt.operands[0]);
            let src = reg16_operand(&stmt.operands[1]);
            out.push(desc.opcode);
            out.push(ModRegRm::rm_reg(dst.index() as u8, src.index() as u8));
        }
        Encoding::AccImm => {
            out.push(desc.opcode);
            push_u16(out, imm_operand(&stmt.operands[1]));
        }
        Encoding::GroupImm(ext) | Encoding::GroupF7Imm(ext) => {
            let dst = reg16_operand(&stmt.operands[0]);
            out.push(desc.opcode);
            out.push(ModRegRm::rm_reg(dst.index() as u8, ext));
            push_u16(out, imm_operand(&stmt.operands[1]));
        }
        Encoding::GroupF7(ext) | Encoding::GroupShift(ext) => {
            let dst = reg16_operand(&stmt.operands[0]);
            out.push(desc.opcode);
            out.push(ModRegRm::rm_reg(dst.index() as u8, ext));
        }
        Encoding::RelShort => {
            let (target, name) = transfer_target(&stmt.operands[0], symbols, stmt.line)?;
            let next = stmt.offset.wrapping_add(u16::from(desc.size));
            let disp = i32::from(target) - i32::from(next);
            if disp < -128 || disp > 127 {
                return Err(AsmError::JumpOutOfRange { label: name });
            }
            out.push(desc.opcode);
            out.push(disp as u8);
        }
        Encoding::RelNear => {
            let (target, _) = transfer_target(&stmt.operands[0], symbols, stmt.line)?;
            let next = stmt.offset.wrapping_add(u16::from(desc.size));
            out.push(desc.opcode);
            push_u16(out, target.wrapping_sub(next));
        }
        Encoding::LeaDirect => {
            let dst = reg16_operand(&stmt.operands[0]);
            let (addr, _) = transfer_target(&stmt.operands[1], symbols, stmt.line)?;
            out.push(desc.opcode);
            out.push(ModRegRm { md: 0, reg: dst.index() as u8, rm: 6 }.u8());
            push_u16(out, addr);
        }
    }
    Ok(())
}

fn push_u16(out: &mut Vec<u8>, val: u16) {
    out.push(val as u8);
    out.push((val >> 8) as u8);
}

fn reg16_operand(operand: &Operand) -> R16 {
    match operand {
        Operand::Reg16(r) => *r,
        _ => unreachable!("form resolution guarantees a word register"),
    }
}

fn imm_operand(operand: &Operand) -> u16 {
    match operand {
        Operand::Imm(v) => *v as u16,
        _ => unreachable!("form resolution guarantees an immediate"),
    }
}

/// resolves a jump/call/LEA target: a label from pass 1, or an absolute
/// numeric offset
fn transfer_target(
    operand: &Operand,
    symbols: &HashMap<String, u16>,
    line: usize,
) -> Result<(u16, String), AsmError> {
    match operand {
        Operand::Label(name) => match symbols.get(name) {
            Some(offset) => Ok((*offset, name.clone())),
            None => Err(AsmError::UndefinedLabel {
                line,
                label: name.clone(),
            }),
        },
        Operand::Imm(v) => Ok((*v as u16, format!("{}", v))),
        _ => unreachable!("form resolution guarantees a transfer target"),
    }
}

fn classify_operand(tok: &str, line: usize) -> Result<Operand, AsmError> {
    if let Some(r) = R16::from_name(tok) {
        return Ok(Operand::Reg16(r));
    }
    if let Some(r) = R8::from_name(tok) {
        return Ok(Operand::Reg8(r));
    }
    if let Some(v) = immediate(tok) {
        return Ok(Operand::Imm(v));
    }
    if is_label_name(tok) {
        return Ok(Operand::Label(tok.to_string()));
    }
    Err(AsmError::BadOperand {
        line,
        operand: tok.to_string(),
    })
}

/// a decimal integer (optionally signed) or hexadecimal 0xNNN literal
fn immediate(tok: &str) -> Option<i32> {
    let v = if let Some(hex) = tok.strip_prefix("0X") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        tok.parse::<i64>().ok()?
    };
    if v < -0x8000 || v > 0xFFFF {
        return None;
    }
    Some(v as i32)
}

fn is_label_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// distinguishes a bad shift count from a genuinely unknown form
fn resolve_failure(op: Op, mnemonic: &str, operands: &[Operand], line: usize) -> AsmError {
    match (op, operands) {
        (
            Op::Shl | Op::Shr | Op::Sar | Op::Rol | Op::Ror | Op::Rcl | Op::Rcr,
            [Operand::Reg16(_), Operand::Imm(n)],
        ) if *n != 1 => AsmError::ShiftCount { line },
        _ => AsmError::UnknownInstruction {
            line,
            form: form_key(mnemonic, operands),
        },
    }
}

/// the lookup key named in diagnostics: MNEMONIC, MNEMONIC_REG,
/// MNEMONIC_REG_REG or MNEMONIC_REG_IMM
fn form_key(mnemonic: &str, operands: &[Operand]) -> String {
    match operands {
        [Operand::Reg16(_)] | [Operand::Reg8(_)] => format!("{}_REG", mnemonic),
        [Operand::Reg16(_) | Operand::Reg8(_), Operand::Reg16(_) | Operand::Reg8(_)] => {
            format!("{}_REG_REG", mnemonic)
        }
        [Operand::Reg16(_) | Operand::Reg8(_), Operand::Imm(_)] => {
            format!("{}_REG_IMM", mnemonic)
        }
        _ => mnemonic.to_string(),
    }
}
