// these modules are re-exported as a single module

pub use self::encoding::*;
mod encoding;

pub use self::flag::*;
mod flag;

pub use self::register::*;
mod register;

use log::warn;
use thiserror::Error;

use crate::memory::{MemoryAddress, MMU};

#[cfg(test)]
#[path = "./cpu_test.rs"]
mod cpu_test;

/// fatal decode faults; stored in `CPU::last_error` so callers can tell
/// a fault halt from a HLT halt
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RuntimeError {
    #[error("invalid opcode {opcode:02X} at {cs:04X}:{ip:04X}")]
    InvalidOpcode { opcode: u8, cs: u16, ip: u16 },

    #[error("invalid group {opcode:02X} extension {ext} at {cs:04X}:{ip:04X}")]
    InvalidGroupExtension { opcode: u8, ext: u8, cs: u16, ip: u16 },
}

/// receives the vector number of a cpu-raised trap (vector 0: divide fault)
pub type InterruptHook = Box<dyn FnMut(u8)>;

/// a resolved ModR/M destination
enum RmOperand {
    Reg(R16),
    Mem(MemoryAddress),
}

pub struct CPU {
    pub regs: RegisterFile,
    pub mmu: MMU,
    pub halted: bool,
    pub last_error: Option<RuntimeError>,
    pub instruction_count: usize,
    dispatch: Dispatch,
    interrupt_hook: Option<InterruptHook>,
}

impl CPU {
    pub fn new() -> Self {
        let mut regs = RegisterFile::default();
        regs.set_r16(R16::SP, 0xFFFE);
        CPU {
            regs,
            mmu: MMU::new(),
            halted: false,
            last_error: None,
            instruction_count: 0,
            dispatch: Dispatch::from_catalog(),
            interrupt_hook: None,
        }
    }

    /// installs the trap observer (the UI collaborator's side channel)
    pub fn set_interrupt_hook(&mut self, hook: InterruptHook) {
        self.interrupt_hook = Some(hook);
    }

    /// copies a machine-code image to CS:0000
    pub fn load_code(&mut self, data: &[u8]) {
        let cs = self.get_sr(SR::CS);
        self.mmu.write(cs, 0, data);
    }

    pub fn get_r16(&self, r: R16) -> u16 {
        self.regs.get_r16(r)
    }

    pub fn set_r16(&mut self, r: R16, val: u16) {
        self.regs.set_r16(r, val);
    }

    pub fn get_r8(&self, r: R8) -> u8 {
        self.regs.get_r8(r)
    }

    pub fn set_r8(&mut self, r: R8, val: u8) {
        self.regs.set_r8(r, val);
    }

    pub fn get_sr(&self, r: SR) -> u16 {
        self.regs.get_sr(r)
    }

    pub fn set_sr(&mut self, r: SR, val: u16) {
        self.regs.set_sr(r, val);
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot::of(&self.regs)
    }

    pub fn flags_snapshot(&self) -> FlagsSnapshot {
        FlagsSnapshot::of(self.regs.flags)
    }

    /// a read-only memory view for callers between steps
    pub fn memory_at(&self, seg: u16, offset: u16, length: usize) -> Vec<u8> {
        self.mmu.read(seg, offset, length)
    }

    /// executes exactly one instruction; no-op while halted
    pub fn step(&mut self) {
        if self.halted {
            return;
        }
        let start_ip = self.regs.ip;
        let opcode = self.fetch_u8();
        match self.dispatch.entry(opcode) {
            Some(DispatchEntry::Single { op, encoding, base }) => {
                self.execute_single(op, encoding, opcode, base);
            }
            Some(DispatchEntry::Group { opcode: group }) => {
                self.execute_group(group, start_ip);
            }
            None => {
                let cs = self.get_sr(SR::CS);
                self.decode_fault(RuntimeError::InvalidOpcode { opcode, cs, ip: start_ip }, start_ip);
            }
        }
        if self.last_error.is_none() {
            self.instruction_count += 1;
        }
    }

    fn fetch_u8(&mut self) -> u8 {
        let cs = self.get_sr(SR::CS);
        let b = self.mmu.read_u8(cs, self.regs.ip);
        self.regs.ip = self.regs.ip.wrapping_add(1);
        b
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8();
        let hi = self.fetch_u8();
        u16::from(hi) << 8 | u16::from(lo)
    }

    fn fetch_modrm(&mut self) -> ModRegRm {
        let b = self.fetch_u8();
        ModRegRm::from_u8(b)
    }

    /// decode faults rewind IP to the faulting instruction and halt
    fn decode_fault(&mut self, err: RuntimeError, start_ip: u16) {
        warn!("{}", err);
        self.last_error = Some(err);
        self.halted = true;
        self.regs.ip = start_ip;
    }

    /// divide fault and division overflow: raise vector 0 on the hook and
    /// leave IP on the faulting instruction; execution continues
    fn divide_error(&mut self, start_ip: u16) {
        let cs = self.get_sr(SR::CS);
        warn!("divide fault at {:04X}:{:04X}", cs, start_ip);
        if let Some(hook) = &mut self.interrupt_hook {
            hook(0);
        }
        self.regs.ip = start_ip;
    }

    fn execute_single(&mut self, op: Op, encoding: Encoding, opcode: u8, base: u8) {
        match encoding {
            Encoding::Plain => self.execute_plain(op),
            Encoding::RegInOpcode => {
                let r = R16::from_index(opcode.wrapping_sub(base));
                self.execute_reg(op, r);
            }
            Encoding::RegInOpcodeImm => {
                let r = R16::from_index(opcode.wrapping_sub(base));
                let imm = self.fetch_u16();
                self.set_r16(r, imm);
            }
            Encoding::ModRmRegReg => self.execute_modrm_reg(op),
            Encoding::AccImm => {
                let imm = self.fetch_u16();
                let dst = self.get_r16(R16::AX);
                if let Some(res) = self.arith16(op, dst, imm) {
                    self.set_r16(R16::AX, res);
                }
            }
            Encoding::RelShort => {
                let disp = self.fetch_u8() as i8;
                let taken = match op {
                    Op::Jz => self.regs.flags.zero(),
                    Op::Jnz => !self.regs.flags.zero(),
                    Op::Jc => self.regs.flags.carry(),
                    Op::Jnc => !self.regs.flags.carry(),
                    _ => unreachable!(),
                };
                if taken {
                    self.regs.ip = self.regs.ip.wrapping_add(disp as i16 as u16);
                }
            }
            Encoding::RelNear => {
                let disp = self.fetch_u16();
                if op == Op::Call {
                    let ip = self.regs.ip;
                    self.push16(ip);
                }
                self.regs.ip = self.regs.ip.wrapping_add(disp);
            }
            Encoding::LeaDirect => self.execute_lea(),
            // group encodings never reach a Single dispatch entry
            _ => unreachable!("{:?} dispatched as single", encoding),
        }
    }

    fn execute_plain(&mut self, op: Op) {
        match op {
            Op::Nop => {}
            Op::Hlt => self.halted = true,
            Op::Clc => self.regs.flags.set_carry(false),
            Op::Stc => self.regs.flags.set_carry(true),
            Op::Cmc => {
                let c = self.regs.flags.carry();
                self.regs.flags.set_carry(!c);
            }
            Op::Ret => {
                self.regs.ip = self.pop16();
            }
            Op::Movsb => {
                let b = self.mmu.read_u8(self.get_sr(SR::DS), self.get_r16(R16::SI));
                self.mmu.write_u8(self.get_sr(SR::ES), self.get_r16(R16::DI), b);
                self.advance_si();
                self.advance_di();
            }
            Op::Lodsb => {
                let b = self.mmu.read_u8(self.get_sr(SR::DS), self.get_r16(R16::SI));
                self.set_r8(R8::AL, b);
                self.advance_si();
            }
            Op::Stosb => {
                let al = self.get_r8(R8::AL);
                self.mmu.write_u8(self.get_sr(SR::ES), self.get_r16(R16::DI), al);
                self.advance_di();
            }
            Op::Cmpsb => {
                let a = self.mmu.read_u8(self.get_sr(SR::DS), self.get_r16(R16::SI));
                let b = self.mmu.read_u8(self.get_sr(SR::ES), self.get_r16(R16::DI));
                self.cmp8(a, b);
                self.advance_si();
                self.advance_di();
            }
            _ => unreachable!("{:?} is not a plain op", op),
        }
    }

    fn execute_reg(&mut self, op: Op, r: R16) {
        match op {
            Op::Push => {
                let val = self.get_r16(r);
                self.push16(val);
            }
            Op::Pop => {
                let val = self.pop16();
                self.set_r16(r, val);
            }
            Op::Inc => {
                let val = self.get_r16(r);
                let res = self.inc16(val);
                self.set_r16(r, res);
            }
            Op::Dec => {
                let val = self.get_r16(r);
                let res = self.dec16(val);
                self.set_r16(r, res);
            }
            Op::Xchg => {
                let ax = self.get_r16(R16::AX);
                let other = self.get_r16(r);
                self.set_r16(R16::AX, other);
                self.set_r16(r, ax);
            }
            _ => unreachable!("{:?} is not a reg-in-opcode op", op),
        }
    }

    fn execute_modrm_reg(&mut self, op: Op) {
        let x = self.fetch_modrm();
        let dst = self.rm_operand(x.md, x.rm);
        let src = self.get_r16(R16::from_index(x.reg));
        match op {
            Op::Mov => self.write_rm16(&dst, src),
            Op::Xchg => {
                let tmp = self.read_rm16(&dst);
                self.write_rm16(&dst, src);
                self.set_r16(R16::from_index(x.reg), tmp);
            }
            _ => {
                let a = self.read_rm16(&dst);
                if let Some(res) = self.arith16(op, a, src) {
                    self.write_rm16(&dst, res);
                }
            }
        }
    }

    /// two-operand ALU dispatch; returns None when the result is discarded
    fn arith16(&mut self, op: Op, dst: u16, src: u16) -> Option<u16> {
        match op {
            Op::Add => Some(self.add16(dst, src)),
            Op::Sub => Some(self.sub16(dst, src)),
            Op::And => Some(self.and16(dst, src)),
            Op::Or => Some(self.or16(dst, src)),
            Op::Xor => Some(self.xor16(dst, src)),
            Op::Cmp => {
                self.sub16(dst, src);
                None
            }
            Op::Test => {
                self.and16(dst, src);
                None
            }
            _ => unreachable!("{:?} is not a two-operand alu op", op),
        }
    }

    fn execute_lea(&mut self) {
        let x = self.fetch_modrm();
        if x.md == 3 {
            // register operand carries no address; leave the destination alone
            return;
        }
        let (_, offset) = self.effective_address(x.md, x.rm);
        self.set_r16(R16::from_index(x.reg), offset);
    }

    fn execute_group(&mut self, group: u8, start_ip: u16) {
        let x = self.fetch_modrm();
        let (op, encoding) = match Dispatch::group_op(group, x.reg) {
            Some(found) => found,
            None => {
                let cs = self.get_sr(SR::CS);
                self.decode_fault(
                    RuntimeError::InvalidGroupExtension { opcode: group, ext: x.reg, cs, ip: start_ip },
                    start_ip,
                );
                return;
            }
        };
        let rm = self.rm_operand(x.md, x.rm);
        match encoding {
            Encoding::GroupImm(_) => {
                let imm = self.fetch_u16();
                let dst = self.read_rm16(&rm);
                if let Some(res) = self.arith16(op, dst, imm) {
                    self.write_rm16(&rm, res);
                }
            }
            Encoding::GroupF7Imm(_) => {
                let imm = self.fetch_u16();
                let dst = self.read_rm16(&rm);
                self.and16(dst, imm);
            }
            Encoding::GroupF7(_) => {
                let val = self.read_rm16(&rm);
                match op {
                    Op::Not => {
                        self.write_rm16(&rm, !val);
                    }
                    Op::Neg => {
                        let res = self.neg16(val);
                        self.write_rm16(&rm, res);
                    }
                    Op::Mul => self.mul16(val),
                    Op::Imul => self.imul16(val),
                    Op::Div => self.div16(val, start_ip),
                    Op::Idiv => self.idiv16(val, start_ip),
                    _ => unreachable!(),
                }
            }
            Encoding::GroupShift(_) => {
                let count = if group == 0xD1 { 1 } else { self.get_r8(R8::CL) };
                let val = self.read_rm16(&rm);
                let res = match op {
                    Op::Rol => self.rol16(val, count),
                    Op::Ror => self.ror16(val, count),
                    Op::Rcl => self.rcl16(val, count),
                    Op::Rcr => self.rcr16(val, count),
                    Op::Shl => self.shl16(val, count),
                    Op::Shr => self.shr16(val, count),
                    Op::Sar => self.sar16(val, count),
                    _ => unreachable!(),
                };
                self.write_rm16(&rm, res);
            }
            _ => unreachable!(),
        }
    }

    fn rm_operand(&mut self, md: u8, rm: u8) -> RmOperand {
        if md == 3 {
            return RmOperand::Reg(R16::from_index(rm));
        }
        let (seg, offset) = self.effective_address(md, rm);
        RmOperand::Mem(MemoryAddress::new(seg, offset))
    }

    fn read_rm16(&self, rm: &RmOperand) -> u16 {
        match rm {
            RmOperand::Reg(r) => self.get_r16(*r),
            RmOperand::Mem(addr) => self.mmu.read_u16(addr.segment, addr.offset),
        }
    }

    fn write_rm16(&mut self, rm: &RmOperand, val: u16) {
        match rm {
            RmOperand::Reg(r) => self.set_r16(*r, val),
            RmOperand::Mem(addr) => self.mmu.write_u16(addr.segment, addr.offset, val),
        }
    }

    /// the 16-bit effective address table. BP-based modes default to the
    /// stack segment; consumes displacement bytes from the stream
    fn effective_address(&mut self, md: u8, rm: u8) -> (u16, u16) {
        if md == 0 && rm == 6 {
            // direct 16-bit address
            let addr = self.fetch_u16();
            return (self.get_sr(SR::DS), addr);
        }
        let (base, seg) = match rm {
            0 => (self.get_r16(R16::BX).wrapping_add(self.get_r16(R16::SI)), SR::DS),
            1 => (self.get_r16(R16::BX).wrapping_add(self.get_r16(R16::DI)), SR::DS),
            2 => (self.get_r16(R16::BP).wrapping_add(self.get_r16(R16::SI)), SR::SS),
            3 => (self.get_r16(R16::BP).wrapping_add(self.get_r16(R16::DI)), SR::SS),
            4 => (self.get_r16(R16::SI), SR::DS),
            5 => (self.get_r16(R16::DI), SR::DS),
            6 => (self.get_r16(R16::BP), SR::SS),
            _ => (self.get_r16(R16::BX), SR::DS),
        };
        let disp = match md {
            0 => 0,
            1 => self.fetch_u8() as i8 as i16 as u16,
            _ => self.fetch_u16(),
        };
        (self.get_sr(seg), base.wrapping_add(disp))
    }

    /// SS:SP descending stack
    pub fn push16(&mut self, data: u16) {
        let sp = self.get_r16(R16::SP).wrapping_sub(2);
        self.set_r16(R16::SP, sp);
        let ss = self.get_sr(SR::SS);
        self.mmu.write_u16(ss, sp, data);
    }

    pub fn pop16(&mut self) -> u16 {
        let sp = self.get_r16(R16::SP);
        let ss = self.get_sr(SR::SS);
        let data = self.mmu.read_u16(ss, sp);
        self.set_r16(R16::SP, sp.wrapping_add(2));
        data
    }

    fn string_delta(&self) -> u16 {
        if self.regs.flags.direction() {
            0xFFFF
        } else {
            1
        }
    }

    fn advance_si(&mut self) {
        let d = self.string_delta();
        let si = self.get_r16(R16::SI).wrapping_add(d);
        self.set_r16(R16::SI, si);
    }

    fn advance_di(&mut self) {
        let d = self.string_delta();
        let di = self.get_r16(R16::DI).wrapping_add(d);
        self.set_r16(R16::DI, di);
    }
}

/// ALU operations; flag behavior follows the 8086 reference per operation
impl CPU {
    pub fn add16(&mut self, dst: u16, src: u16) -> u16 {
        let res = dst as usize + src as usize;
        self.regs.flags.set_carry_u16(res);
        self.regs.flags.set_adjust_of(res, src as usize, dst as usize);
        self.regs.flags.set_overflow_add_u16(res, src as usize, dst as usize);
        self.regs.flags.set_szp_u16(res);
        res as u16
    }

    pub fn sub16(&mut self, dst: u16, src: u16) -> u16 {
        let res = (dst as usize).wrapping_sub(src as usize);
        self.regs.flags.set_carry(dst < src);
        self.regs.flags.set_adjust_of(res, src as usize, dst as usize);
        self.regs.flags.set_overflow_sub_u16(res, src as usize, dst as usize);
        self.regs.flags.set_szp_u16(res);
        res as u16
    }

    /// SUB with a discarded result: CMP
    pub fn cmp16(&mut self, dst: u16, src: u16) {
        self.sub16(dst, src);
    }

    fn cmp8(&mut self, dst: u8, src: u8) {
        let res = (dst as usize).wrapping_sub(src as usize);
        self.regs.flags.set_carry(dst < src);
        self.regs.flags.set_adjust_of(res, src as usize, dst as usize);
        self.regs.flags.set_overflow_sub_u8(res, src as usize, dst as usize);
        self.regs.flags.set_szp_u8(res);
    }

    /// INC leaves CF alone
    pub fn inc16(&mut self, val: u16) -> u16 {
        let res = val as usize + 1;
        self.regs.flags.set_adjust_of(res, 1, val as usize);
        self.regs.flags.set_overflow(val == 0x7FFF);
        self.regs.flags.set_szp_u16(res);
        res as u16
    }

    /// DEC leaves CF alone
    pub fn dec16(&mut self, val: u16) -> u16 {
        let res = (val as usize).wrapping_sub(1);
        self.regs.flags.set_adjust(val & 0xF == 0);
        self.regs.flags.set_overflow(val == 0x8000);
        self.regs.flags.set_szp_u16(res);
        res as u16
    }

    pub fn neg16(&mut self, val: u16) -> u16 {
        let res = 0usize.wrapping_sub(val as usize);
        self.regs.flags.set_carry(val != 0);
        self.regs.flags.set_adjust(val & 0xF != 0);
        self.regs.flags.set_overflow(val == 0x8000);
        self.regs.flags.set_szp_u16(res);
        res as u16
    }

    /// AND/OR/XOR clear CF and OF and leave AF alone
    pub fn and16(&mut self, dst: u16, src: u16) -> u16 {
        let res = dst & src;
        self.regs.flags.set_carry(false);
        self.regs.flags.set_overflow(false);
        self.regs.flags.set_szp_u16(res as usize);
        res
    }

    pub fn or16(&mut self, dst: u16, src: u16) -> u16 {
        let res = dst | src;
        self.regs.flags.set_carry(false);
        self.regs.flags.set_overflow(false);
        self.regs.flags.set_szp_u16(res as usize);
        res
    }

    pub fn xor16(&mut self, dst: u16, src: u16) -> u16 {
        let res = dst ^ src;
        self.regs.flags.set_carry(false);
        self.regs.flags.set_overflow(false);
        self.regs.flags.set_szp_u16(res as usize);
        res
    }

    /// unsigned AX * operand into DX:AX; CF=OF flag a significant high word
    pub fn mul16(&mut self, val: u16) {
        let prod = u32::from(self.get_r16(R16::AX)) * u32::from(val);
        self.set_r16(R16::AX, prod as u16);
        self.set_r16(R16::DX, (prod >> 16) as u16);
        let high = (prod >> 16) != 0;
        self.regs.flags.set_carry(high);
        self.regs.flags.set_overflow(high);
    }

    /// signed product; CF=OF unless the result is the sign-extension of AX
    pub fn imul16(&mut self, val: u16) {
        let prod = i32::from(self.get_r16(R16::AX) as i16) * i32::from(val as i16);
        self.set_r16(R16::AX, prod as u16);
        self.set_r16(R16::DX, (prod >> 16) as u16);
        let fits = prod == i32::from(prod as i16);
        self.regs.flags.set_carry(!fits);
        self.regs.flags.set_overflow(!fits);
    }

    /// unsigned DX:AX / operand; divide-by-zero and quotient overflow raise
    /// vector 0 and leave the registers untouched
    pub fn div16(&mut self, val: u16, start_ip: u16) {
        if val == 0 {
            return self.divide_error(start_ip);
        }
        let dividend = u32::from(self.get_r16(R16::DX)) << 16 | u32::from(self.get_r16(R16::AX));
        let quotient = dividend / u32::from(val);
        if quotient > 0xFFFF {
            return self.divide_error(start_ip);
        }
        self.set_r16(R16::AX, quotient as u16);
        self.set_r16(R16::DX, (dividend % u32::from(val)) as u16);
    }

    /// signed division truncates toward zero
    pub fn idiv16(&mut self, val: u16, start_ip: u16) {
        let divisor = i32::from(val as i16);
        if divisor == 0 {
            return self.divide_error(start_ip);
        }
        let dividend = (u32::from(self.get_r16(R16::DX)) << 16
            | u32::from(self.get_r16(R16::AX))) as i32;
        let quotient = dividend / divisor;
        if quotient > 0x7FFF || quotient < -0x8000 {
            return self.divide_error(start_ip);
        }
        self.set_r16(R16::AX, quotient as u16);
        self.set_r16(R16::DX, (dividend % divisor) as u16);
    }

    /// shifts iterate; CF takes each bit shifted out, result flags settle
    /// after the loop. A zero count touches nothing
    pub fn shl16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            self.regs.flags.set_carry(val & 0x8000 != 0);
            val <<= 1;
        }
        self.regs.flags.set_szp_u16(val as usize);
        val
    }

    pub fn shr16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            self.regs.flags.set_carry(val & 1 != 0);
            val >>= 1;
        }
        self.regs.flags.set_szp_u16(val as usize);
        val
    }

    /// arithmetic right shift keeps bit 15
    pub fn sar16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            self.regs.flags.set_carry(val & 1 != 0);
            val = (val >> 1) | (val & 0x8000);
        }
        self.regs.flags.set_overflow(false);
        self.regs.flags.set_szp_u16(val as usize);
        val
    }

    /// rotates run outside the CF chain; CF holds the last wrapped bit
    pub fn rol16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            let bit = val >> 15;
            val = (val << 1) | bit;
            self.regs.flags.set_carry(bit != 0);
        }
        val
    }

    pub fn ror16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            let bit = val & 1;
            val = (val >> 1) | (bit << 15);
            self.regs.flags.set_carry(bit != 0);
        }
        val
    }

    /// 17-bit rotate through CF
    pub fn rcl16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            let out = val & 0x8000 != 0;
            val = (val << 1) | self.regs.flags.carry_val();
            self.regs.flags.set_carry(out);
        }
        val
    }

    pub fn rcr16(&mut self, mut val: u16, count: u8) -> u16 {
        if count == 0 {
            return val;
        }
        for _ in 0..count {
            let out = val & 1 != 0;
            val = (val >> 1) | (self.regs.flags.carry_val() << 15);
            self.regs.flags.set_carry(out);
        }
        val
    }
}

impl Default for CPU {
    fn default() -> Self {
        Self::new()
    }
}
