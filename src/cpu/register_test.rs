use crate::cpu::register::{RegisterFile, Register16, R16, R8};

#[test]
fn half_registers_alias_the_word() {
    let mut r = Register16::default();
    r.set_lo(0xCD);
    r.set_hi(0xAB);
    assert_eq!(0xABCD, r.val);
    assert_eq!(0xCD, r.lo_u8());
    assert_eq!(0xAB, r.hi_u8());
}

#[test]
fn byte_writes_touch_one_half_only() {
    let mut regs = RegisterFile::default();
    regs.set_r16(R16::AX, 0x1234);
    regs.set_r8(R8::AH, 0xFF);
    assert_eq!(0xFF34, regs.get_r16(R16::AX));
    regs.set_r8(R8::AL, 0x00);
    assert_eq!(0xFF00, regs.get_r16(R16::AX));
    // other registers are untouched
    assert_eq!(0, regs.get_r16(R16::BX));
}

#[test]
fn canonical_encoding_order() {
    assert_eq!(0, R16::AX.index());
    assert_eq!(1, R16::CX.index());
    assert_eq!(2, R16::DX.index());
    assert_eq!(3, R16::BX.index());
    assert_eq!(4, R16::SP.index());
    assert_eq!(7, R16::DI.index());
    assert_eq!(R16::BX, R16::from_index(3));
}

#[test]
fn register_names_resolve() {
    assert_eq!(Some(R16::SI), R16::from_name("SI"));
    assert_eq!(Some(R8::CL), R8::from_name("CL"));
    assert_eq!(None, R16::from_name("CL"));
    assert_eq!(None, R16::from_name("FOO"));
}
