use crate::asm::{AsmError, Line};

#[cfg(test)]
#[path = "./parser_test.rs"]
mod parser_test;

/// a parsed source line: optional label, optional instruction body.
/// Operands are raw upper-cased tokens at this stage
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceLine {
    pub number: usize,
    pub label: Option<String>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
}

/// splits `LABEL: MNEMONIC OP, OP` into its parts; label and body are both
/// optional
pub fn parse_line(line: &Line) -> Result<SourceLine, AsmError> {
    let mut out = SourceLine {
        number: line.number,
        ..Default::default()
    };
    let mut body = line.text.as_str();
    if let Some(pos) = body.find(':') {
        let label = body[..pos].trim();
        if !is_identifier(label) {
            return Err(AsmError::BadLabel {
                line: line.number,
                label: label.to_string(),
            });
        }
        out.label = Some(label.to_string());
        body = body[pos + 1..].trim();
    }
    if body.is_empty() {
        return Ok(out);
    }
    let (mnemonic, rest) = match body.find(char::is_whitespace) {
        Some(pos) => (&body[..pos], body[pos..].trim()),
        None => (body, ""),
    };
    out.mnemonic = Some(mnemonic.to_string());
    if !rest.is_empty() {
        for part in rest.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(AsmError::BadOperand {
                    line: line.number,
                    operand: rest.to_string(),
                });
            }
            out.operands.push(part.to_string());
        }
    }
    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
