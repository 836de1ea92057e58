//! Script-file parser.
//!
//! Test scripts are line-oriented: `a <id> <size>` allocates, `r <id> <size>` reallocates,
//! `f <id>` frees. Blank lines and `#` comments are skipped. The parser only builds the
//! operation list; running it is the job of [`super::run_script`].

use crate::err::{ScriptError, ScriptErrorKind};

/// One allocator operation replayed by the harness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Malloc { id: u32, size: usize },
    Realloc { id: u32, size: usize },
    Free { id: u32 },
}

fn parse_field<T: core::str::FromStr>(
    field: Option<&str>,
    line: usize,
) -> Result<T, ScriptError> {
    let text = field.ok_or(ScriptError {
        line,
        kind: ScriptErrorKind::BadField(String::from("<missing>")),
    })?;

    text.parse().map_err(|_| ScriptError {
        line,
        kind: ScriptErrorKind::BadField(String::from(text)),
    })
}

/// Parses a whole script. Stops at the first malformed line.
pub fn parse_script(source: &str) -> Result<Vec<Op>, ScriptError> {
    let mut ops = Vec::new();

    for (number, raw) in source.lines().enumerate() {
        let line = number + 1;
        let text = raw.trim();

        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let mut fields = text.split_whitespace();
        let opcode = fields.next().unwrap_or_default();

        let op = match opcode {
            "a" => Op::Malloc {
                id: parse_field(fields.next(), line)?,
                size: parse_field(fields.next(), line)?,
            },
            "r" => Op::Realloc {
                id: parse_field(fields.next(), line)?,
                size: parse_field(fields.next(), line)?,
            },
            "f" => Op::Free {
                id: parse_field(fields.next(), line)?,
            },
            other => {
                return Err(ScriptError {
                    line,
                    kind: ScriptErrorKind::UnknownOp(String::from(other)),
                })
            }
        };

        if fields.next().is_some() {
            return Err(ScriptError {
                line,
                kind: ScriptErrorKind::TrailingInput,
            });
        }

        ops.push(op);
    }

    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_opcodes() {
        let ops = parse_script("a 0 100\nr 0 250\nf 0\n").unwrap();
        assert_eq!(
            ops,
            vec![
                Op::Malloc { id: 0, size: 100 },
                Op::Realloc { id: 0, size: 250 },
                Op::Free { id: 0 },
            ]
        );
    }

    #[test]
    fn skips_blanks_and_comments() {
        let ops = parse_script("# heap trace\n\n  a 3 8\n   \nf 3\n").unwrap();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn reports_the_failing_line() {
        let err = parse_script("a 0 100\nx 1 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.kind, ScriptErrorKind::UnknownOp(String::from("x")));

        let err = parse_script("a zero 100\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.kind, ScriptErrorKind::BadField(String::from("zero")));

        let err = parse_script("f 1 extra\n").unwrap_err();
        assert_eq!(err.kind, ScriptErrorKind::TrailingInput);

        let err = parse_script("a 1\n").unwrap_err();
        assert_eq!(
            err.kind,
            ScriptErrorKind::BadField(String::from("<missing>"))
        );
    }
}
