use crate::asm::lexer::lex;

#[test]
fn strips_comments_and_blanks() {
    let src = "\n; full line comment\n  mov ax, 1  ; trailing comment\n\n   \nhlt\n";
    let lines = lex(src);
    assert_eq!(2, lines.len());
    assert_eq!("MOV AX, 1", lines[0].text);
    assert_eq!(3, lines[0].number);
    assert_eq!("HLT", lines[1].text);
    assert_eq!(6, lines[1].number);
}

#[test]
fn uppercases_everything() {
    let lines = lex("loop1: dec cx");
    assert_eq!("LOOP1: DEC CX", lines[0].text);
}

#[test]
fn empty_source_lexes_to_nothing() {
    assert!(lex("").is_empty());
    assert!(lex("; only a comment").is_empty());
}
