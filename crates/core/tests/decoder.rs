use dosdis_core::dec::{Decoder, Flow, Operand};

fn decoder() -> Decoder {
    Decoder::new().expect("capstone init")
}

#[test]
fn sequential_mov_decodes_with_length_and_text() {
    let inst = decoder().decode_one(&[0xB8, 0x34, 0x12], 0).unwrap();
    assert_eq!(inst.len, 3);
    assert_eq!(inst.flow, Flow::Sequential);
    assert!(inst.text.starts_with("mov"));
}

#[test]
fn relative_branches_resolve_against_ip() {
    // jmp short +2 decoded at ip 0x100 lands at 0x104.
    let inst = decoder().decode_one(&[0xEB, 0x02], 0x100).unwrap();
    assert_eq!(inst.flow, Flow::NearJump(0x104));

    // jz +2 is conditional.
    let inst = decoder().decode_one(&[0x74, 0x02], 0x100).unwrap();
    assert_eq!(inst.flow, Flow::ConditionalJump(0x104));

    // call rel16 0 targets the following instruction.
    let inst = decoder().decode_one(&[0xE8, 0x00, 0x00], 0x100).unwrap();
    assert_eq!(inst.flow, Flow::NearCall(0x103));
}

#[test]
fn near_branch_targets_wrap_at_64k() {
    // jmp short -4 from ip 0 wraps to the top of the segment.
    let inst = decoder().decode_one(&[0xEB, 0xFC], 0).unwrap();
    assert_eq!(inst.flow, Flow::NearJump(0xFFFE));
}

#[test]
fn returns_and_halt_are_terminal() {
    for bytes in [&[0xC3u8][..], &[0xCB], &[0xCF], &[0xF4]] {
        let inst = decoder().decode_one(bytes, 0).unwrap();
        assert_eq!(inst.flow, Flow::Terminal, "bytes {bytes:02X?}");
    }
}

#[test]
fn loop_and_jcxz_are_conditional() {
    let inst = decoder().decode_one(&[0xE2, 0xFE], 0x10).unwrap();
    assert_eq!(inst.flow, Flow::ConditionalJump(0x10));
    let inst = decoder().decode_one(&[0xE3, 0x02], 0x10).unwrap();
    assert_eq!(inst.flow, Flow::ConditionalJump(0x14));
}

#[test]
fn far_call_folds_ptr16_16_operand() {
    let inst = decoder().decode_one(&[0x9A, 0x21, 0x43, 0x02, 0x00], 0).unwrap();
    assert_eq!(inst.len, 5);
    assert_eq!(inst.flow, Flow::FarCall(0x0002, 0x4321));
    assert_eq!(inst.ops.len(), 1);
    assert_eq!(inst.ops[0].op, Operand::FarPtr { frame: 0x0002, offset: 0x4321 });
}

#[test]
fn indirect_jump_through_register_is_indirect() {
    // jmp bx
    let inst = decoder().decode_one(&[0xFF, 0xE3], 0).unwrap();
    assert_eq!(inst.flow, Flow::IndirectJump);
    assert!(inst.is_cs_indexed_mem().is_none());
}

#[test]
fn cs_indexed_memory_jump_is_recognized() {
    // jmp word ptr cs:[bx+0x8]
    let inst = decoder().decode_one(&[0x2E, 0xFF, 0xA7, 0x08, 0x00], 0).unwrap();
    assert_eq!(inst.flow, Flow::IndirectJump);
    assert_eq!(inst.is_cs_indexed_mem(), Some(8));
}

#[test]
fn fixable_span_of_imm16_field() {
    let bytes = [0xB8, 0x34, 0x12]; // mov ax, 0x1234
    let inst = decoder().decode_one(&bytes, 0).unwrap();
    let spans = inst.fixable_spans(&bytes, 0);
    assert_eq!(spans.len(), 1);
    assert_eq!((spans[0].start, spans[0].end), (1, 3));
    // The span points back at the immediate operand.
    assert!(matches!(inst.ops[spans[0].op].op, Operand::Imm { value: 0x1234, .. }));
}

#[test]
fn fixable_span_of_relative_call_is_the_displacement_field() {
    // call rel16 0 at ip 0x20: capstone reports target 0x23, but the
    // encoded field holds the zero displacement.
    let bytes = [0xE8, 0x00, 0x00];
    let inst = decoder().decode_one(&bytes, 0x20).unwrap();
    let spans = inst.fixable_spans(&bytes, 0x20);
    assert_eq!(spans.len(), 1);
    assert_eq!((spans[0].start, spans[0].end), (1, 3));
}

#[test]
fn fixable_span_of_far_pointer_is_the_trailing_four_bytes() {
    let bytes = [0x9A, 0x00, 0x00, 0x02, 0x00];
    let inst = decoder().decode_one(&bytes, 0).unwrap();
    let spans = inst.fixable_spans(&bytes, 0);
    assert_eq!(spans.len(), 1);
    assert_eq!((spans[0].start, spans[0].end), (1, 5));
}

#[test]
fn rel8_branch_yields_no_fixable_span() {
    let bytes = [0xEB, 0x02];
    let inst = decoder().decode_one(&bytes, 0).unwrap();
    assert!(inst.fixable_spans(&bytes, 0).is_empty());
}

#[test]
fn lone_prefix_fails_to_decode() {
    assert!(decoder().decode_one(&[0x2E], 0).is_err());
}
