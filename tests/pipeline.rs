//! End-to-end checks: the direct interpreter and the optimized IR
//! interpreter must produce byte-identical output for the same program and
//! input.

use std::io::Cursor;

use bfkit::codegen::{self, Target};
use bfkit::interpreter::{run_direct, run_ir, Session};
use bfkit::{parse, trim, Tape};

const HELLO_WORLD: &str = "++++++++[>++++[>++>+++>+++>+<<<<-]>+>+>->>+[<]<-]\
                           >>.>---.+++++++..+++.>>.<-.<.+++.------.--------.>>+.>++.";

fn direct(source: &str, input: &[u8]) -> String {
    let trimmed = trim(source);
    let mut tape = Tape::new(65536);
    let mut input = Cursor::new(input.to_vec());
    let mut output = Vec::new();
    let mut session = Session::new(&mut input, &mut output);
    run_direct(trimmed.as_bytes(), &mut tape, &mut session).unwrap();
    String::from_utf8(output).unwrap()
}

fn optimized(source: &str, input: &[u8]) -> String {
    let ir = parse(source.as_bytes()).unwrap();
    let mut tape = Tape::new(65536);
    let mut input = Cursor::new(input.to_vec());
    let mut output = Vec::new();
    let mut session = Session::new(&mut input, &mut output);
    run_ir(&ir, &mut tape, &mut session).unwrap();
    String::from_utf8(output).unwrap()
}

#[test]
fn hello_world_prints_hello_world() {
    assert_eq!(direct(HELLO_WORLD, b""), "Hello World!\n\n");
}

#[test]
fn scenarios_agree_between_o0_and_o1() {
    let scenarios: &[(&str, &[u8], &str)] = &[
        (HELLO_WORLD, b"", "Hello World!\n\n"),
        (",+.", b"a", "b\n"),
        ("+++[>+++<-]>.", b"", "\t\n"),
        ("[-]+++.", b"", "\x03\n"),
        ("+>+>+>+>+[<]>.", b"", "\x01\n"),
        ("Hello world!", b"", "\n"),
    ];
    for &(source, input, expected) in scenarios {
        assert_eq!(direct(source, input), expected, "direct: {}", source);
        assert_eq!(optimized(source, input), expected, "ir: {}", source);
    }
}

#[test]
fn comment_only_source_compiles_to_empty_ir() {
    assert_eq!(parse(b"Hello world!").unwrap(), vec![]);
}

#[test]
fn minify_round_trips_through_the_parser() {
    let noisy = "read one: , then [ bump . and loop , ]";
    assert_eq!(
        parse(noisy.as_bytes()).unwrap(),
        parse(trim(noisy).as_bytes()).unwrap()
    );
}

#[test]
fn every_binary_target_emits_its_magic() {
    let ir = parse(b"+[>.<-]").unwrap();
    for (target, magic) in [
        (Target::ElfX86, &b"\x7fELF"[..]),
        (Target::ElfX64, &b"\x7fELF"[..]),
        (Target::ElfArmeabi, &b"\x7fELF"[..]),
        (Target::WinX86, &b"MZ"[..]),
        (Target::WinX64, &b"MZ"[..]),
    ] {
        let bytes = codegen::emit_to_vec(target, &ir, 65536);
        assert!(bytes.starts_with(magic), "target {}", target);
    }
}

#[test]
fn source_targets_emit_compilable_looking_text() {
    let ir = parse(b"+[>.<-]").unwrap();
    for target in [Target::C, Target::XbyakC] {
        let bytes = codegen::emit_to_vec(target, &ir, 65536);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("int\nmain(void)"), "target {}", target);
    }
}
