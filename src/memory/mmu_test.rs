use crate::memory::{MemoryAddress, MMU};

#[test]
fn segment_offset_translation() {
    assert_eq!(0x10000, MemoryAddress::new(0x1000, 0x0000).value());
    assert_eq!(0x10FFF, MemoryAddress::new(0x1000, 0x0FFF).value());
    assert_eq!(0x00000, MemoryAddress::new(0xFFFF, 0x0010).value());
}

#[test]
fn aliased_segment_pairs_reach_same_byte() {
    // seg+1, off-16 addresses the same physical byte
    let mut mmu = MMU::new();
    mmu.write_u8(0x0100, 0x0020, 0x55);
    assert_eq!(0x55, mmu.read_u8(0x0101, 0x0010));
    assert_eq!(0x55, mmu.read_u8(0x0102, 0x0000));
}

#[test]
fn write_then_read_byte() {
    let mut mmu = MMU::new();
    for v in 0..=0xFF_u16 {
        mmu.write_u8(0x0600, v, v as u8);
    }
    for v in 0..=0xFF_u16 {
        assert_eq!(v as u8, mmu.read_u8(0x0600, v));
    }
}

#[test]
fn word_access_wraps_physical_space() {
    let mut mmu = MMU::new();
    // FFFF:0010 is physical 0xF_FFFF; the high byte of the word lands at 0
    mmu.write_u16(0xFFFF, 0x0010, 0xCAFE);
    assert_eq!(0xFE, mmu.read_u8(0xFFFF, 0x0010));
    assert_eq!(0xCA, mmu.read_u8(0x0000, 0x0000));
}
