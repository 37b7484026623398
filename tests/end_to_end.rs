//! End-to-end bytecode scenarios executed against the `run_with_output`
//! entry point, exercising the loader, dispatch loop, natives, and GC
//! together the way a real bytecode image would.

mod support;

use support::*;

fn run(bytes: Vec<u8>) -> (i32, String) {
    let out = SharedBuffer::new();
    let code = uza_vm::run_with_output(bytes, Box::new(out.clone()));
    (code, out.contents_as_string())
}

#[test]
fn arithmetic_and_print() {
    let mut main = ChunkBuilder::new(0);
    let c2 = main.const_int(2);
    let c3 = main.const_int(3);
    let cprintln = main.const_str("println");
    main.op1(CONST_L, c2).op1(CONST_L, c3).op(ADD).op1(CALL_NATIVE, cprintln).op(EXITVM);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "5\n");
}

#[test]
fn string_concatenation() {
    let mut main = ChunkBuilder::new(0);
    let c1 = main.const_str("hello ");
    let c2 = main.const_str("world");
    let cprintln = main.const_str("println");
    main.op1(CONST_STR, c1).op1(CONST_STR, c2).op(ADD).op1(CALL_NATIVE, cprintln).op(EXITVM);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "hello world\n");
}

#[test]
fn globals_define_and_read() {
    let mut main = ChunkBuilder::new(0);
    let cx = main.const_str("x");
    let c10 = main.const_int(10);
    let c5 = main.const_int(5);
    let cprintln = main.const_str("println");
    main.op1(CONST_L, c10)
        .op1(DEFGLOBAL, cx)
        .op1(GETGLOBAL, cx)
        .op1(CONST_L, c5)
        .op(ADD)
        .op1(CALL_NATIVE, cprintln)
        .op(EXITVM);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "15\n");
}

#[test]
fn function_call() {
    let mut main = ChunkBuilder::new(0);
    let cname = main.const_str("sq");
    let carity = main.const_int(1);
    let cchunk_idx = main.const_int(1);
    let c7 = main.const_int(7);
    let cprintln = main.const_str("println");
    main.op1(CONST_STR, cname)
        .op1(CONST_L, carity)
        .op1(LFUNC, cchunk_idx)
        .op1(CONST_L, c7)
        .op1(CONST_STR, cname)
        .op(CALL)
        .op1(CALL_NATIVE, cprintln)
        .op(EXITVM);

    let mut sq = ChunkBuilder::new(1);
    sq.op1(GETLOCAL, 0).op1(GETLOCAL, 0).op(MUL).op(RETURN);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    image.push_chunk(sq);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "49\n");
}

#[test]
fn loop_counts_up() {
    let mut main = ChunkBuilder::new(1);
    let c0 = main.const_int(0);
    let c5 = main.const_int(5);
    let c1 = main.const_int(1);
    let cprintln = main.const_str("println");

    main.op1(CONST_L, c0).op1(DEFLOCAL, 0);
    let loop_start = main.here();
    main.op1(GETLOCAL, 0).op1(CONST_L, c5).op(LT);
    let jump_operand = main.op_jump_placeholder(JUMP_IF_FALSE);
    main.op(POP)
        .op1(GETLOCAL, 0)
        .op1(CALL_NATIVE, cprintln)
        .op(POP)
        .op1(GETLOCAL, 0)
        .op1(CONST_L, c1)
        .op(ADD)
        .op1(SETLOCAL, 0);
    let loop_operand = main.op_jump_placeholder(LOOP);
    let end = main.here();
    main.op(POP).op(EXITVM);

    main.patch_jump(jump_operand, end);
    main.patch_loop(loop_operand, loop_start);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "0\n1\n2\n3\n4\n");
}

#[test]
fn list_append_and_sort() {
    let mut main = ChunkBuilder::new(1);
    let c3 = main.const_int(3);
    let c1 = main.const_int(1);
    let c2 = main.const_int(2);
    let c_list = main.const_str("List");
    let c_append = main.const_str("append");
    let c_sort = main.const_str("sort");
    let c_println = main.const_str("println");

    main.op1(CALL_NATIVE, c_list)
        .op1(DEFLOCAL, 0)
        .op1(GETLOCAL, 0)
        .op1(CONST_L, c3)
        .op1(CALL_NATIVE, c_append)
        .op(POP)
        .op1(GETLOCAL, 0)
        .op1(CONST_L, c1)
        .op1(CALL_NATIVE, c_append)
        .op(POP)
        .op1(GETLOCAL, 0)
        .op1(CONST_L, c2)
        .op1(CALL_NATIVE, c_append)
        .op(POP)
        .op1(GETLOCAL, 0)
        .op(BOOLFALSE)
        .op1(CALL_NATIVE, c_sort)
        .op(POP)
        .op1(GETLOCAL, 0)
        .op1(CALL_NATIVE, c_println)
        .op(POP)
        .op(EXITVM);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, output) = run(image.build());
    assert_eq!(code, 0);
    assert_eq!(output, "[1, 2, 3]\n");
}

#[test]
fn two_hundred_fifty_five_constants_load_cleanly() {
    let mut main = ChunkBuilder::new(0);
    for i in 0..255i64 {
        main.const_int(i);
    }
    main.op(NIL).op(EXITVM);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    let (code, _) = run(image.build());
    assert_eq!(code, 0);
}

#[test]
fn unbounded_recursion_is_a_fatal_frame_overflow() {
    let mut main = ChunkBuilder::new(0);
    let cname = main.const_str("recur");
    let carity = main.const_int(0);
    let cchunk_idx = main.const_int(1);
    main.op1(CONST_STR, cname).op1(CONST_L, carity).op1(LFUNC, cchunk_idx).op1(CONST_STR, cname).op(CALL).op(EXITVM);

    let mut recur = ChunkBuilder::new(0);
    let cname2 = recur.const_str("recur");
    recur.op1(CONST_STR, cname2).op(CALL).op(RETURN);

    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    image.push_chunk(recur);
    let (code, _) = run(image.build());
    assert_eq!(code, 1, "recursion with no base case must terminate via a fatal FrameOverflow, not hang or panic");
}
