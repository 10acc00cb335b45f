use pretty_assertions::assert_eq;

use chalkbox::asm::{assemble, AsmError};
use chalkbox::cpu::{CATALOG, CPU, R16, SR};

fn run(source: &str) -> CPU {
    let asm = assemble(source).unwrap();
    let mut cpu = CPU::new();
    cpu.load_code(&asm.machine_code);
    for _ in 0..100_000 {
        if cpu.halted {
            return cpu;
        }
        cpu.step();
    }
    panic!("program never halted");
}

#[test]
fn can_run_mov_add_hlt() {
    let asm = assemble("MOV AX, 5\nADD AX, 2\nHLT").unwrap();
    assert_eq!("B8 05 00 05 02 00 F4", asm.hex_string);

    let cpu = run("MOV AX, 5\nADD AX, 2\nHLT");
    assert_eq!(0x0007, cpu.get_r16(R16::AX));
    assert_eq!(7, cpu.regs.ip);
    assert_eq!(true, cpu.halted);
    assert_eq!(None, cpu.last_error);
}

#[test]
fn can_run_dec_jnz_loop() {
    let asm = assemble("MOV CX, 3\nL1: DEC CX\nJNZ L1\nHLT").unwrap();
    let expected: Vec<u8> = vec![
        0xB9, 0x03, 0x00, // mov cx,0x3
        0x49,             // dec cx
        0x75, 0xFD,       // jnz -3
        0xF4,             // hlt
    ];
    assert_eq!(expected, asm.machine_code);

    let cpu = run("MOV CX, 3\nL1: DEC CX\nJNZ L1\nHLT");
    assert_eq!(0, cpu.get_r16(R16::CX));
    assert_eq!(true, cpu.regs.flags.zero());
    assert_eq!(7, cpu.regs.ip); // past the hlt
}

#[test]
fn can_run_wraparound_add() {
    let cpu = run("MOV AX, 0xFFFF\nADD AX, 1\nHLT");
    assert_eq!(0x0000, cpu.get_r16(R16::AX));
    assert_eq!(true, cpu.regs.flags.zero());
    assert_eq!(true, cpu.regs.flags.carry());
    assert_eq!(false, cpu.regs.flags.overflow());
    assert_eq!(true, cpu.regs.flags.adjust());
}

#[test]
fn can_run_div() {
    let cpu = run("MOV AX, 0x0010\nMOV DX, 0\nMOV BX, 2\nDIV BX\nHLT");
    assert_eq!(0x0008, cpu.get_r16(R16::AX));
    assert_eq!(0x0000, cpu.get_r16(R16::DX));
    assert_eq!(2, cpu.get_r16(R16::BX));
}

#[test]
fn short_jump_too_far_is_an_error() {
    let mut src = String::from("JZ FAR\n");
    for _ in 0..100 {
        src.push_str("NOP\nNOP\n");
    }
    src.push_str("FAR: HLT\n");
    let err = assemble(&src).unwrap_err();
    assert_eq!("Jump to FAR is too far", format!("{}", err));
    assert_eq!(AsmError::JumpOutOfRange { label: "FAR".to_string() }, err);
}

#[test]
fn can_run_push_pop_through_the_stack() {
    let asm = assemble("PUSH AX\nPOP BX\nHLT").unwrap();
    let mut cpu = CPU::new();
    cpu.load_code(&asm.machine_code);
    cpu.set_r16(R16::AX, 0xBEEF);
    let sp0 = cpu.get_r16(R16::SP);

    cpu.step(); // push
    let sp1 = cpu.get_r16(R16::SP);
    assert_eq!(sp0.wrapping_sub(2), sp1);
    let ss = cpu.get_sr(SR::SS);
    assert_eq!(vec![0xEF, 0xBE], cpu.memory_at(ss, sp1, 2));

    cpu.step(); // pop
    cpu.step(); // hlt
    assert_eq!(0xBEEF, cpu.get_r16(R16::BX));
    assert_eq!(sp0, cpu.get_r16(R16::SP));
    assert_eq!(true, cpu.halted);
}

/// every catalog row emits exactly `size` bytes and the cpu advances IP by
/// exactly `size` when executing them
#[test]
fn encoder_and_cpu_agree_on_sizes() {
    for entry in CATALOG {
        let source = sample_source(entry);
        let asm = assemble(&source)
            .unwrap_or_else(|e| panic!("cannot assemble {:?}: {}", entry, e));
        assert_eq!(
            entry.size as usize,
            asm.machine_code.len(),
            "encoded size for {:?}",
            entry
        );

        let mut cpu = CPU::new();
        cpu.load_code(&asm.machine_code);
        // avoid a taken branch or a divide fault skewing IP
        cpu.set_r16(R16::AX, 8);
        cpu.set_r16(R16::CX, 2);
        cpu.regs.flags.set_u16(0);
        // let RET "return" to the byte after itself
        let (ss, sp) = (cpu.get_sr(SR::SS), cpu.get_r16(R16::SP));
        cpu.mmu.write_u16(ss, sp, u16::from(entry.size));
        cpu.step();
        assert_eq!(None, cpu.last_error, "decode error for {:?}", entry);
        assert_eq!(
            u16::from(entry.size),
            cpu.regs.ip,
            "ip advance for {:?}",
            entry
        );
    }
}

/// a source line whose operands land on the given catalog row
fn sample_source(entry: &chalkbox::cpu::InsnDesc) -> String {
    use chalkbox::cpu::{Form, Op};
    let mnemonic = match entry.op {
        Op::Mov => "MOV",
        Op::Xchg => "XCHG",
        Op::Lea => "LEA",
        Op::Push => "PUSH",
        Op::Pop => "POP",
        Op::Add => "ADD",
        Op::Sub => "SUB",
        Op::Cmp => "CMP",
        Op::Inc => "INC",
        Op::Dec => "DEC",
        Op::Neg => "NEG",
        Op::Mul => "MUL",
        Op::Imul => "IMUL",
        Op::Div => "DIV",
        Op::Idiv => "IDIV",
        Op::And => "AND",
        Op::Or => "OR",
        Op::Xor => "XOR",
        Op::Test => "TEST",
        Op::Not => "NOT",
        Op::Rol => "ROL",
        Op::Ror => "ROR",
        Op::Rcl => "RCL",
        Op::Rcr => "RCR",
        Op::Shl => "SHL",
        Op::Shr => "SHR",
        Op::Sar => "SAR",
        Op::Movsb => "MOVSB",
        Op::Lodsb => "LODSB",
        Op::Stosb => "STOSB",
        Op::Cmpsb => "CMPSB",
        Op::Jmp => "JMP",
        Op::Call => "CALL",
        Op::Ret => "RET",
        Op::Jz => "JZ",
        Op::Jnz => "JNZ",
        Op::Jc => "JC",
        Op::Jnc => "JNC",
        Op::Nop => "NOP",
        Op::Hlt => "HLT",
        Op::Clc => "CLC",
        Op::Stc => "STC",
        Op::Cmc => "CMC",
    };
    match entry.form {
        Form::Bare => mnemonic.to_string(),
        Form::Reg => format!("{} CX", mnemonic),
        Form::RegReg => format!("{} BX, DX", mnemonic),
        Form::AxReg => format!("{} AX, DX", mnemonic),
        Form::RegCl => format!("{} BX, CL", mnemonic),
        Form::RegOne => format!("{} BX, 1", mnemonic),
        Form::RegImm => format!("{} BX, 2", mnemonic),
        Form::AccImm => format!("{} AX, 2", mnemonic),
        Form::RegAddr => format!("{} BX, 0", mnemonic),
        // a self-targeting branch still advances ip by the full size
        Form::Rel => format!("{} NEXT\nNEXT:", mnemonic),
    }
}

#[test]
fn machine_code_length_is_the_sum_of_sizes() {
    let asm = assemble("E: MOV AX, 1\nADD BX, 2\nMUL CX\nJMP E\nHLT").unwrap();
    assert_eq!(3 + 4 + 2 + 3 + 1, asm.machine_code.len());
}

#[test]
fn snapshots_reflect_machine_state() {
    let cpu = run("MOV AX, 0x1234\nMOV SI, 9\nSTC\nHLT");
    let regs = cpu.snapshot();
    assert_eq!(0x1234, regs.ax);
    assert_eq!(9, regs.si);
    assert_eq!(cpu.regs.ip, regs.ip);
    let flags = cpu.flags_snapshot();
    assert_eq!(true, flags.carry);
    assert_eq!(false, flags.zero);
}
