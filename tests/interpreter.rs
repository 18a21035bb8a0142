use std::sync::Arc;

use pvm::any::manager::SingleAnyManager;
use pvm::{
    AnyValue, ErrorKind, ExportedRoutine, FfiType, Instruction, OpCode, Outcome, Program,
    Runtime, RuntimeConfig, StaticRuntimeData, VectorDataPtr,
};

fn runtime(p: Program) -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(p, StaticRuntimeData::new(), RuntimeConfig::default()).unwrap()
}

fn global_vector(rt: &Runtime, offset: usize) -> Vec<i64> {
    let raw = rt.read_global::<u64>(offset).unwrap();
    let v = unsafe { VectorDataPtr::clone_from_raw(raw) };
    assert_eq!(v.element_size(), 8);
    v.to_vec::<i64>()
}

/// Holders of string constant `id` besides the runtime's own table.
fn string_holders(rt: &Runtime, id: usize) -> usize {
    // one reference for the table, one for the clone taken here
    rt.data().string_constant(id).unwrap().ref_count() - 2
}

// --- Integer faults ---

#[test]
fn add_past_max_traps_overflow() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, i64::MAX, 0);
    p.emit_op(OpCode::PushInt, 1, 0);
    let add = p.emit_op(OpCode::AddInt, 0, 0);
    let trap = runtime(p).run().unwrap_err();
    assert_eq!(trap.kind(), ErrorKind::Overflow);
    assert_eq!(trap.pc, add);
}

#[test]
fn min_times_minus_one_traps_overflow() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, i64::MIN, 0);
    p.emit_op(OpCode::PushInt, -1, 0);
    p.emit_op(OpCode::MulInt, 0, 0);
    assert_eq!(runtime(p).run().unwrap_err().kind(), ErrorKind::Overflow);
}

#[test]
fn mod_by_min_minus_one_traps_overflow() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, i64::MIN, 0);
    p.emit_op(OpCode::PushInt, -1, 0);
    p.emit_op(OpCode::ModInt, 0, 0);
    assert_eq!(runtime(p).run().unwrap_err().kind(), ErrorKind::Overflow);
}

// --- Break and resume ---

fn sum_program(pause: OpCode) -> Program {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, 1, 0);
    p.emit_op(pause, 0, 0);
    p.emit_op(OpCode::PushInt, 2, 0);
    p.emit_op(OpCode::AddInt, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);
    p
}

#[test]
fn break_then_resume_matches_straight_run() {
    let rt = runtime(sum_program(OpCode::Break));
    match rt.run() {
        Ok(Outcome::Breakpoint { pc, .. }) => assert_eq!(pc, 3),
        other => panic!("expected a breakpoint, got {other:?}"),
    }
    assert_eq!(rt.inspect(|i| i.is_suspended()), Some(true));
    assert_eq!(rt.inspect(|i| i.peek_int(0)), Some(1));
    let resumed = rt.resume();

    let straight = runtime(sum_program(OpCode::Nop)).run();
    assert_eq!(resumed, straight);
    assert_eq!(resumed, Ok(Outcome::Halted { code: 3 }));
    assert_eq!(rt.resume().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

// --- Frames and the display ---

#[test]
fn nested_routine_reads_parameter_and_outer_local() {
    let mut p = Program::new();
    // main: f(40)
    p.emit_op(OpCode::PushInt, 40, 0);
    p.emit_op(OpCode::PushParam, 0, 0);
    let call_f = p.emit_op(OpCode::Call, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);

    // f(x): local = x; g(); x's copy + 2 is left by g
    let f = p.emit_op(OpCode::Enter, 1, 8);
    p.emit_op(OpCode::PushLocalAddress, 0, 0);
    p.emit_op(OpCode::PushLocalAddress, -32, 0);
    p.emit_op(OpCode::LoadI64, 0, 0);
    p.emit_op(OpCode::StoreI64, 0, 0);
    let call_g = p.emit_op(OpCode::Call, 0, 0);
    p.emit_op(OpCode::Leave, 1, 0);
    p.emit_op(OpCode::Return, 8, 0);

    // g, nested in f: push f's local + 2
    let g = p.emit_op(OpCode::Enter, 2, 0);
    p.emit_op(OpCode::PushOuterAddress, 1, 0);
    p.emit_op(OpCode::LoadI64, 0, 0);
    p.emit_op(OpCode::PushInt, 2, 0);
    p.emit_op(OpCode::AddInt, 0, 0);
    p.emit_op(OpCode::Leave, 2, 0);
    p.emit_op(OpCode::Return, 0, 0);

    p.fixup_address(call_f, f).unwrap();
    p.fixup_address(call_g, g).unwrap();

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Halted { code: 42 }));
    // only the outermost return PC is left on the native stack
    assert_eq!(rt.inspect(|i| i.native_used()), Some(8));
    let display = rt.inspect(|i| i.display().to_vec()).unwrap();
    assert_eq!(display[0], rt.globals_base());
    assert!(display[1..].iter().all(|base| *base == 0));
}

#[test]
fn return_to_pc_zero_is_done() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, 5, 0);
    p.emit_op(OpCode::Return, 0, 0);
    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Done));
    assert_eq!(rt.inspect(|i| (i.peek_int(0), i.native_used())), Some((5, 0)));
}

#[test]
fn outer_address_without_frame_is_invalid() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushOuterAddress, 3, 0);
    assert_eq!(runtime(p).run().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn deep_recursion_overflows_native_stack() {
    let mut p = Program::new();
    let f = p.emit_op(OpCode::Enter, 1, 64);
    p.emit_op(OpCode::Call, f as i64, 0);
    let rt = Runtime::new(
        p,
        StaticRuntimeData::new(),
        RuntimeConfig { native_stack_size: 4096, ..RuntimeConfig::default() },
    )
    .unwrap();
    assert_eq!(rt.run().unwrap_err().kind(), ErrorKind::StackOverflow);
}

// --- Control flow ---

#[test]
fn indirect_call_and_conditional_jumps() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, 0, 0);
    let skip = p.emit_op(OpCode::JumpIfFalse, 0, 0);
    p.emit_op(OpCode::PushInt, 99, 0);
    p.emit_op(OpCode::Halt, 0, 0);
    let taken = p.emit_op(OpCode::PushInt, 0, 0);
    p.emit_op(OpCode::CallIndirect, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);

    // f: 7 unless the true branch is missed
    let f = p.emit_op(OpCode::PushInt, 1, 0);
    let seven = p.emit_op(OpCode::JumpIfTrue, 0, 0);
    p.emit_op(OpCode::PushInt, 100, 0);
    p.emit_op(OpCode::Return, 0, 0);
    let push_seven = p.emit_op(OpCode::PushInt, 7, 0);
    p.emit_op(OpCode::Return, 0, 0);

    p.fixup_address(skip, taken).unwrap();
    p.fixup_address(taken, f).unwrap();
    p.fixup_address(seven, push_seven).unwrap();
    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Halted { code: 7 }));
    assert_eq!(rt.inspect(|i| i.calc_depth()), Some(0));
}

// --- Memory ---

#[test]
fn narrow_loads_and_stores() {
    let mut p = Program::new();
    p.set_globals_size(16);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushInt, -1, 0);
    p.emit_op(OpCode::StoreI8, 0, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushInt, 0x1_2345, 0);
    p.emit_op(OpCode::StoreI16, 2, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushInt, -2, 0);
    p.emit_op(OpCode::StoreI32, 4, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit(Instruction::with_float(OpCode::PushFloat, 1.5));
    p.emit_op(OpCode::StoreF32, 8, 0);

    for (op, offset) in [
        (OpCode::LoadU8, 0),
        (OpCode::LoadI8, 0),
        (OpCode::LoadU16, 2),
        (OpCode::LoadU32, 4),
        (OpCode::LoadI32, 4),
        (OpCode::LoadF32, 8),
    ] {
        p.emit_op(OpCode::PushGlobalAddress, 0, 0);
        p.emit_op(op, offset, 0);
    }
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    let ints = rt.inspect(|i| (1..6).rev().map(|n| i.peek_int(n)).collect::<Vec<_>>()).unwrap();
    assert_eq!(ints, [255, -1, 0x2345, 0xffff_fffe, -2]);
    assert_eq!(rt.inspect(|i| i.peek_float(0)), Some(1.5));
    assert_eq!(rt.read_global::<u16>(2).unwrap(), 0x2345);
}

#[test]
fn heap_memory_bulk_copies_and_stack_alignment() {
    let mut p = Program::new();
    p.set_globals_size(8);
    // p = calloc(16); *p = 42
    p.emit_op(OpCode::PushInt, 16, 0);
    p.emit_op(OpCode::AllocMemory, 1, 0);
    p.emit_op(OpCode::Dup, 0, 0);
    p.emit_op(OpCode::PushInt, 42, 0);
    p.emit_op(OpCode::StoreI64, 0, 0);
    // g0 = *p
    p.emit_op(OpCode::Dup, 0, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::Swap, 0, 0);
    p.emit_op(OpCode::CopyBytes, 8, 0);
    // a copy of *p on the native stack, just above the return PC
    p.emit_op(OpCode::Dup, 0, 0);
    p.emit_op(OpCode::PushBytes, 8, 0);
    p.emit_op(OpCode::ReleaseMemory, 0, 0);

    p.emit_op(OpCode::AlignStack, 16, 0);
    p.emit_op(OpCode::Alloc, 8, 0);
    p.emit_op(OpCode::AlignStack, 16, 0);
    p.emit_op(OpCode::Release, 16, 0);
    p.emit_op(OpCode::PushLocalAddress, 8, 0);
    p.emit_op(OpCode::LoadI64, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Halted { code: 42 }));
    assert_eq!(rt.read_global::<i64>(0).unwrap(), 42);
    assert_eq!(rt.inspect(|i| i.native_used()), Some(16));
}

// --- Managed values ---

#[test]
fn stores_release_the_overwritten_reference() {
    let mut data = StaticRuntimeData::new();
    let first = data.add_string("first");
    let second = data.add_string("second");
    let mut p = Program::new();
    p.set_globals_size(24);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[1, 2]);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g8 shares g0's buffer, then g0 is replaced
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::StoreVector, 0, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[3]);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g16 = first, then second
    p.emit_op(OpCode::PushGlobalAddress, 16, 0);
    p.emit_op(OpCode::PushString, first as i64, 0);
    p.emit_op(OpCode::StoreAny, 0, 0);
    p.emit_op(OpCode::PushGlobalAddress, 16, 0);
    p.emit_op(OpCode::PushString, second as i64, 0);
    p.emit_op(OpCode::StoreAny, 0, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = Runtime::new(p, data, RuntimeConfig::default()).unwrap();
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    assert_eq!(global_vector(&rt, 0), [3]);
    assert_eq!(global_vector(&rt, 8), [1, 2]);
    let kept = unsafe { VectorDataPtr::clone_from_raw(rt.read_global(8).unwrap()) };
    assert_eq!(kept.ref_count(), 2);
    assert_eq!(string_holders(&rt, first), 0);
    assert_eq!(string_holders(&rt, second), 1);
}

#[test]
fn managed_copies_and_destruction() {
    let mut data = StaticRuntimeData::new();
    let any = data.add_manager(Arc::new(SingleAnyManager));
    let shared = data.add_string("shared");
    let mut p = Program::new();
    p.set_globals_size(16);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::InitRegion, any as i64, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushString, shared as i64, 0);
    p.emit_op(OpCode::StoreAny, 0, 0);
    // one copy on the native stack, one in g8
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushManaged, any as i64, 0);
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::CopyManaged, any as i64, 0);
    p.emit_op(OpCode::Break, 0, 0);
    p.emit_op(OpCode::PushLocalAddress, 8, 0);
    p.emit_op(OpCode::DestroyRegion, any as i64, 0);
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::DestroyRegion, any as i64, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = Runtime::new(p, data, RuntimeConfig::default()).unwrap();
    assert!(matches!(rt.run(), Ok(Outcome::Breakpoint { .. })));
    assert_eq!(string_holders(&rt, shared), 3);
    assert_eq!(rt.inspect(|i| i.native_used()), Some(16));

    assert_eq!(rt.resume(), Ok(Outcome::Stopped));
    assert_eq!(string_holders(&rt, shared), 1);
    let g8 = unsafe { AnyValue::clone_from_raw(rt.read_global(8).unwrap()) };
    assert!(!g8.has_value());
}

#[test]
fn vectors_of_strings_from_lvalue_and_count() {
    let mut data = StaticRuntimeData::new();
    let any = data.add_manager(Arc::new(SingleAnyManager));
    let word = data.add_string("word");
    let mut p = Program::new();
    p.set_globals_size(16);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::PushString, word as i64, 0);
    p.emit_op(OpCode::StoreAny, 0, 0);
    // g8 = [g0]
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::VecFromLvalue, 8, any as i64);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // three empty strings
    p.emit_op(OpCode::PushInt, 3, 0);
    p.emit_op(OpCode::VecNew, 8, any as i64);
    p.emit_op(OpCode::VecLength, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);

    let rt = Runtime::new(p, data, RuntimeConfig::default()).unwrap();
    assert_eq!(rt.run(), Ok(Outcome::Halted { code: 3 }));
    assert_eq!(string_holders(&rt, word), 2);
    let v = unsafe { VectorDataPtr::clone_from_raw(rt.read_global(8).unwrap()) };
    assert_eq!(v.len(), 1);
    assert!(v.manager().is_some());
    assert_eq!(unsafe { v.get::<u64>(0) }, rt.read_global::<u64>(0).unwrap());
}

// --- Vectors ---

fn push_combine_ints(p: &mut Program, values: &[i64]) {
    for v in values {
        p.emit_op(OpCode::PushInt, *v, 0);
        p.emit_op(OpCode::PushInt, 0, 0);
    }
    p.emit_op(OpCode::VecCombine, values.len() as i64, 8);
}

#[test]
fn vector_combine_broadcast_and_filter() {
    const I32: i64 = 4;
    const I64: i64 = 6;
    let mut p = Program::new();
    p.set_globals_size(24);

    // g0 = [5, 1, 2, 9]
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[5, 1, 2, 9]);
    p.emit_op(OpCode::StoreVector, 0, 0);

    // g8 = g0 * [10]
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::PushInt, 10, 0);
    p.emit_op(OpCode::VecFromScalar, I32, 0);
    p.emit_op(OpCode::VecArith, 2, I64 | I32 << 8);
    p.emit_op(OpCode::StoreVector, 0, 0);

    // g16 = g0 where g0 > 4
    p.emit_op(OpCode::PushGlobalAddress, 16, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::PushInt, 4, 0);
    p.emit_op(OpCode::VecFromScalar, I64, 0);
    p.emit_op(OpCode::VecCompare, 4, I64 | I64 << 8);
    p.emit_op(OpCode::VecFilter, 0, 0);
    p.emit_op(OpCode::StoreVector, 0, 0);

    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::VecLength, 0, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    assert_eq!(rt.inspect(|i| i.peek_int(0)), Some(4));
    assert_eq!(global_vector(&rt, 0), [5, 1, 2, 9]);
    assert_eq!(global_vector(&rt, 8), [50, 10, 20, 90]);
    assert_eq!(global_vector(&rt, 16), [5, 9]);
}

#[test]
fn vector_element_write_does_not_touch_shared_copy() {
    let mut p = Program::new();
    p.set_globals_size(16);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[1, 2, 3]);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g8 shares g0's buffer
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g8[1] = 20
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushInt, 1, 0);
    p.emit_op(OpCode::VecElement, 8, 0);
    p.emit_op(OpCode::PushInt, 20, 0);
    p.emit_op(OpCode::StoreI64, 0, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    assert_eq!(global_vector(&rt, 0), [1, 2, 3]);
    assert_eq!(global_vector(&rt, 8), [1, 20, 3]);
}

#[test]
fn vector_resize_then_gather() {
    const I32: i64 = 4;
    const I64: i64 = 6;
    let mut p = Program::new();
    p.set_globals_size(24);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[10, 20, 30]);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g16 = resize(g0, 5)
    p.emit_op(OpCode::PushGlobalAddress, 16, 0);
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    p.emit_op(OpCode::PushInt, 5, 0);
    p.emit_op(OpCode::VecResize, 8, -1);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g8 = g16[[3, 1]] with 32-bit indices
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::PushGlobalAddress, 16, 0);
    p.emit_op(OpCode::LoadVector, 0, 0);
    push_combine_ints(&mut p, &[3, 1]);
    p.emit_op(OpCode::VecConvert, I64, I32);
    p.emit_op(OpCode::VecGather, I32, 0);
    p.emit_op(OpCode::StoreVector, 0, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    assert_eq!(global_vector(&rt, 16), [10, 20, 30, 0, 0]);
    assert_eq!(global_vector(&rt, 8), [30, 10]);
    assert_eq!(global_vector(&rt, 0), [10, 20, 30]);
    let source = unsafe { VectorDataPtr::clone_from_raw(rt.read_global(0).unwrap()) };
    assert_eq!(source.ref_count(), 2);
}

#[test]
fn vector_convert_reverse_and_invert() {
    const I8: i64 = 0;
    const I32: i64 = 4;
    const I64: i64 = 6;
    let mut p = Program::new();
    p.set_globals_size(16);
    // g0 = i64(!reverse(i8([1, -2, 300])))
    p.emit_op(OpCode::PushGlobalAddress, 0, 0);
    push_combine_ints(&mut p, &[1, -2, 300]);
    p.emit_op(OpCode::VecConvert, I64, I8);
    p.emit_op(OpCode::VecReverse, 0, 0);
    p.emit_op(OpCode::VecInvert, 0, I8);
    p.emit_op(OpCode::VecConvert, I8, I64);
    p.emit_op(OpCode::StoreVector, 0, 0);
    // g8 = i64(not [0, 0, 0])
    p.emit_op(OpCode::PushGlobalAddress, 8, 0);
    p.emit_op(OpCode::VecZeroed, 4, 3);
    p.emit_op(OpCode::VecInvert, 1, I32);
    p.emit_op(OpCode::VecConvert, I32, I64);
    p.emit_op(OpCode::StoreVector, 0, 0);
    p.emit_op(OpCode::Stop, 0, 0);

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    // 300 truncates to 44 as an i8
    assert_eq!(global_vector(&rt, 0), [!44, !-2, !1]);
    assert_eq!(global_vector(&rt, 8), [1, 1, 1]);
}

#[test]
fn vector_range_check_traps() {
    let mut p = Program::new();
    push_combine_ints(&mut p, &[1, 4, 9]);
    p.emit_op(OpCode::PushInt, 6, 0);
    p.emit_op(OpCode::VecRangeCheck, 1, 5);
    let rt = runtime(p);
    let trap = rt.run().unwrap_err();
    assert_eq!(trap.kind(), ErrorKind::RangeCheck);
    assert!(trap.to_string().contains("element 2"), "{trap}");
}

// --- Program images ---

#[test]
fn program_image_runs_after_json_round_trip() {
    let mut p = Program::new();
    p.emit_op(OpCode::PushInt, 9, 0);
    p.emit(Instruction::with_float(OpCode::PushFloat, 0.5));
    p.emit_op(OpCode::FloatToInt, 0, 0);
    p.emit_op(OpCode::AddInt, 0, 0);
    p.emit_op(OpCode::Halt, 0, 0);
    let image = p.to_json().unwrap();
    let loaded = Program::from_json(&image).unwrap();
    assert_eq!(loaded.code(), p.code());
    assert_eq!(runtime(loaded).run(), Ok(Outcome::Halted { code: 9 }));
}

// --- Callbacks from other threads ---

#[test]
fn callback_from_spawned_thread_gets_its_own_interpreter() {
    let mut p = Program::new();
    p.emit_op(OpCode::Stop, 0, 0);
    let inc = p.emit_op(OpCode::PushInt, 1, 0);
    p.emit_op(OpCode::AddInt, 0, 0);
    p.emit_op(OpCode::Return, 0, 0);
    p.add_export(ExportedRoutine::new(inc, Some("inc"), vec![FfiType::Int64], FfiType::Int64));

    let rt = runtime(p);
    assert_eq!(rt.run(), Ok(Outcome::Stopped));
    assert_eq!(rt.interpreter_count(), 1);

    let code = rt.callback_by_name("inc").unwrap() as usize;
    let worker = Arc::clone(&rt);
    let answer = std::thread::spawn(move || {
        let inc: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(code) };
        let answer = inc(41);
        assert_eq!(worker.interpreter_count(), 2);
        answer
    })
    .join()
    .unwrap();
    assert_eq!(answer, 42);
    assert_eq!(rt.interpreter_count(), 2);
}
