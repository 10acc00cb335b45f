#[cfg(test)]
#[path = "./lexer_test.rs"]
mod lexer_test;

/// one surviving source line, upper-cased, with its 1-based origin
#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub number: usize,
    pub text: String,
}

/// strips `;` comments and blank lines, trims whitespace and upper-cases
/// the rest (8086 assembly is case-insensitive). Operand splitting is the
/// parser's job
pub fn lex(source: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    for (i, raw) in source.lines().enumerate() {
        let stripped = match raw.find(';') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let text = stripped.trim();
        if text.is_empty() {
            continue;
        }
        lines.push(Line {
            number: i + 1,
            text: text.to_uppercase(),
        });
    }
    lines
}
