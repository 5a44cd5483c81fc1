use proptest::prelude::*;
use wordjit::codegen::{AArch64, Arm32, CodeBuffer, X86_64};
use wordjit::{CodegenError, CompiledProgram, FunctionState, TargetArch, WordOffset};

fn check_backward_and_forward_agree<A: TargetArch>() {
    // Backward: label bound first, branch emitted later.
    let mut program = CompiledProgram::<A>::new();
    let mut session = program.session();
    session.begin_function("loop").expect("begin");
    let head = session.new_label().expect("head");
    let bound_at = session.bind_label(head).expect("bind");
    session.emit_nop().expect("nop");
    let backward = session.emit_branch(head).expect("backward branch");

    // Forward: branch emitted first, label bound at the same target later.
    let tail = session.new_label().expect("tail");
    let forward = session.emit_branch(tail).expect("forward branch");
    session.bind_label(tail).expect("bind tail");
    session.end_function().expect("end");
    drop(session);

    assert_eq!(
        A::branch_target(program.code(), backward).expect("decode"),
        bound_at
    );
    assert_eq!(
        A::branch_target(program.code(), forward).expect("decode"),
        forward + 1
    );

    // Patching either branch again directly gives the same words the
    // session produced.
    let mut repatched = CodeBuffer::new();
    repatched.emit_words(program.code().words()).expect("copy");
    A::patch_branch(&mut repatched, backward, bound_at).expect("patch backward");
    A::patch_branch(&mut repatched, forward, forward + 1).expect("patch forward");
    assert_eq!(repatched.words(), program.code().words());
}

#[test]
fn branches_decode_to_bound_label_in_either_order() {
    check_backward_and_forward_agree::<Arm32>();
    check_backward_and_forward_agree::<AArch64>();
    check_backward_and_forward_agree::<X86_64>();
}

fn check_unresolved_fixup_discards_function<A: TargetArch>() {
    let mut program = CompiledProgram::<A>::new();
    let mut session = program.session();
    session.begin_function("kept").expect("begin");
    session.emit_set_status(1).expect("status");
    session.end_function().expect("end");
    let kept_end = session.position();

    session.begin_function("broken").expect("begin");
    let dangling = session.new_label().expect("label");
    session.emit_branch(dangling).expect("branch");
    let err = session.end_function().expect_err("unresolved");
    assert_eq!(
        err,
        CodegenError::UnresolvedFixups {
            function: "broken".to_string(),
            count: 1,
        }
    );
    assert!(!session.is_open());
    assert_eq!(session.position(), kept_end);
    drop(session);

    assert_eq!(program.functions().len(), 1);
    assert_eq!(program.functions()[0].state, FunctionState::Finalized);
    assert!(program.find_function("broken").is_none());
    assert_eq!(program.code().position(), kept_end);
}

#[test]
fn failed_end_function_rewinds_buffer() {
    check_unresolved_fixup_discards_function::<Arm32>();
    check_unresolved_fixup_discards_function::<AArch64>();
    check_unresolved_fixup_discards_function::<X86_64>();
}

#[test]
fn dropping_a_session_discards_the_open_function() {
    let mut program = CompiledProgram::<AArch64>::new();
    {
        let mut session = program.session();
        session.begin_function("abandoned").expect("begin");
        session.emit_nop().expect("nop");
    }
    assert!(program.functions().is_empty());
    assert!(program.code().is_empty());
}

#[test]
fn only_one_function_can_be_open() {
    let mut program = CompiledProgram::<X86_64>::new();
    let mut session = program.session();
    session.begin_function("first").expect("begin");
    let err = session.begin_function("second").expect_err("already open");
    assert_eq!(err, CodegenError::FunctionAlreadyOpen("first".to_string()));
    assert!(session.is_open());
}

#[test]
fn emitting_without_a_function_fails() {
    let mut program = CompiledProgram::<Arm32>::new();
    let mut session = program.session();
    assert_eq!(session.emit_nop(), Err(CodegenError::NoOpenFunction));
    assert_eq!(session.end_function(), Err(CodegenError::NoOpenFunction));
    assert_eq!(session.mark_trap(), Err(CodegenError::NoOpenFunction));
}

#[test]
fn finalized_words_cannot_be_patched() {
    let mut program = CompiledProgram::<X86_64>::new();
    let mut session = program.session();
    session.begin_function("done").expect("begin");
    session.end_function().expect("end");
    let before = session.read_word(WordOffset::ZERO).expect("read");
    let next_start = session.position();

    assert_eq!(
        session.patch_word(WordOffset::ZERO, 0xDEAD_BEEF),
        Err(CodegenError::NoOpenFunction)
    );

    session.begin_function("next").expect("begin");
    assert_eq!(
        session.patch_word(WordOffset::ZERO, 0xDEAD_BEEF),
        Err(CodegenError::PatchOutsideFunction {
            offset: WordOffset::ZERO,
            start: next_start,
        })
    );
    assert!(!session.is_open());
    assert_eq!(session.read_word(WordOffset::ZERO).expect("read"), before);
    assert_eq!(session.position(), next_start);
    drop(session);
    assert_eq!(program.functions().len(), 1);
}

#[test]
fn patching_inside_the_open_function_is_allowed() {
    let mut program = CompiledProgram::<AArch64>::new();
    let mut session = program.session();
    session.begin_function("f").expect("begin");
    let at = session.emit_word(0).expect("word");
    session.patch_word(at, 0x1234).expect("patch");
    assert_eq!(session.read_word(at).expect("read"), 0x1234);
    assert!(session.is_open());
}

#[test]
fn fatal_errors_discard_the_open_function() {
    let mut program = CompiledProgram::<Arm32>::new();
    let mut session = program.session();
    session.begin_function("kept").expect("begin");
    session.end_function().expect("end");
    let kept_end = session.position();

    session.begin_function("f").expect("begin");
    session.emit_nop().expect("nop");
    let err = session
        .patch_word(WordOffset::new(999), 1)
        .expect_err("outside buffer");
    assert!(matches!(err, CodegenError::OffsetOutOfRange { .. }));
    assert!(err.is_fatal());
    assert!(!session.is_open());
    assert_eq!(session.position(), kept_end);
    assert_eq!(session.end_function(), Err(CodegenError::NoOpenFunction));
    drop(session);

    assert_eq!(program.functions().len(), 1);
    assert!(program.find_function("f").is_none());
}

#[test]
fn usage_errors_keep_the_function_open() {
    let mut program = CompiledProgram::<X86_64>::new();
    let mut session = program.session();
    session.begin_function("f").expect("begin");
    session.mark_trap().expect("trap");
    let err = session.mark_trap().expect_err("second trap");
    assert!(!err.is_fatal());
    assert!(session.is_open());
    session.end_function().expect("end");
}

#[test]
fn labels_bind_once() {
    let mut program = CompiledProgram::<X86_64>::new();
    let mut session = program.session();
    session.begin_function("f").expect("begin");
    let label = session.new_label().expect("label");
    session.bind_label(label).expect("bind");
    assert_eq!(
        session.bind_label(label),
        Err(CodegenError::LabelAlreadyBound(label))
    );
}

#[test]
fn trap_can_be_marked_once() {
    let mut program = CompiledProgram::<AArch64>::new();
    let mut session = program.session();
    session.begin_function("f").expect("begin");
    session.mark_trap().expect("trap");
    assert_eq!(
        session.mark_trap(),
        Err(CodegenError::TrapAlreadyMarked("f".to_string()))
    );
}

fn check_function_layout<A: TargetArch>() {
    let mut program = CompiledProgram::<A>::new();
    let id = {
        let mut session = program.session();
        session.begin_function("f").expect("begin");
        session.emit_helper_call(0x4000, 3).expect("call");
        session.emit_entry(9).expect("entry");
        session.end_function().expect("end")
    };
    let record = program.function(id).expect("record");
    assert_eq!(record.start, WordOffset::ZERO);
    assert_eq!(record.entry, WordOffset::new(A::SPEC.entry_prologue_size));
    let entry = record.secondary_entry(9).expect("secondary entry");
    assert_eq!(
        entry.prologue,
        record.entry + A::SPEC.call_site_size + A::SPEC.branch_size
    );
    assert_eq!(entry.resume, entry.prologue + A::SPEC.entry_prologue_size);
    assert!(record.is_dispatch_target(record.start));
    assert!(record.is_dispatch_target(entry.prologue));
    assert!(!record.is_dispatch_target(entry.resume));
    assert_eq!(record.end, entry.resume + A::SPEC.epilogue_size);
    assert_eq!(record.state, FunctionState::Finalized);
}

#[test]
fn function_records_describe_layout() {
    check_function_layout::<Arm32>();
    check_function_layout::<AArch64>();
    check_function_layout::<X86_64>();
}

#[test]
fn inline_jump_holds_word_distance() {
    let mut program = CompiledProgram::<AArch64>::new();
    let mut session = program.session();
    session.begin_function("f").expect("begin");
    let label = session.new_label().expect("label");
    let operand = session.emit_inline_jump(label).expect("inline");
    session.emit_nop().expect("nop");
    session.emit_nop().expect("nop");
    session.bind_label(label).expect("bind");
    assert_eq!(session.read_word(operand).expect("read"), 3);

    session.emit_nop().expect("nop");
    let back = session.emit_inline_jump(label).expect("inline back");
    assert_eq!(session.read_word(back).expect("read") as i32, -1);
}

proptest! {
    #[test]
    fn buffer_grows_without_losing_words(words in proptest::collection::vec(any::<u32>(), 1..600)) {
        let mut code = CodeBuffer::with_capacity(1).expect("capacity");
        for word in &words {
            code.emit_word(*word).expect("emit");
        }
        prop_assert_eq!(code.words(), words.as_slice());
        prop_assert_eq!(code.len_bytes(), words.len() * 4);
    }
}
