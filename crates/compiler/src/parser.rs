//! The reader: source bytes to form trees.
//!
//! Forms are ordinary core values emitted into the VM's value space:
//! `(...)` and `[...]` read as tuples, `@[...]` as an array, `{...}` as a
//! struct, `@{...}` as a table, `@"..."` as a buffer, `'x` as the
//! two-element tuple `(quote x)` and `:name` as the symbol `name`.
//!
//! Errors carry a position and distinguish "the source ended mid-form"
//! (`unexpected_eos`), which is what lets a REPL keep reading lines until a
//! form closes.

use opal_core::error::OpalError;
use opal_core::value::Value;
use opal_core::vm::Vm;

#[derive(Debug)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    /// The source ended inside an unfinished form.
    pub unexpected_eos: bool,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize, column: usize) -> ParseError {
        ParseError {
            message: message.into(),
            line,
            column,
            unexpected_eos: false,
        }
    }

    fn eos(message: impl Into<String>, line: usize, column: usize) -> ParseError {
        ParseError {
            message: message.into(),
            line,
            column,
            unexpected_eos: true,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at line {}, column {}",
            self.message, self.line, self.column
        )
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for OpalError {
    fn from(e: ParseError) -> OpalError {
        OpalError::Parse {
            message: e.message,
            line: e.line,
            column: e.column,
        }
    }
}

/// Read every form in `source`.
pub fn parse_all(vm: &Vm, source: &str) -> Result<Vec<Value>, ParseError> {
    let mut parser = Parser {
        vm,
        bytes: source.as_bytes(),
        pos: 0,
        line: 1,
        column: 1,
    };
    let mut forms = Vec::new();
    loop {
        parser.skip_trivia();
        if parser.at_end() {
            return Ok(forms);
        }
        forms.push(parser.form()?);
    }
}

struct Parser<'a> {
    vm: &'a Vm,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
}

fn is_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace()
        || matches!(
            b,
            b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b'\'' | b'#' | b','
        )
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.line, self.column)
    }

    fn err_eos(&self, message: impl Into<String>) -> ParseError {
        ParseError::eos(message, self.line, self.column)
    }

    /// Skip whitespace, commas-as-whitespace and `#` line comments.
    fn skip_trivia(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || b == b',' {
                self.bump();
            } else if b == b'#' {
                while let Some(b) = self.bump() {
                    if b == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn form(&mut self) -> Result<Value, ParseError> {
        self.skip_trivia();
        let b = match self.peek() {
            Some(b) => b,
            None => return Err(self.err_eos("unexpected end of source")),
        };
        match b {
            b'(' => {
                self.bump();
                self.sequence(b')').map(|items| self.vm.tuple(items))
            }
            b'[' => {
                self.bump();
                self.sequence(b']').map(|items| self.vm.tuple(items))
            }
            b'{' => {
                self.bump();
                let items = self.sequence(b'}')?;
                if items.len() % 2 != 0 {
                    return Err(self.err("struct literal needs an even number of forms"));
                }
                Ok(self
                    .vm
                    .structure(items.chunks(2).map(|p| (p[0], p[1])).collect()))
            }
            b'@' => {
                self.bump();
                match self.peek() {
                    Some(b'[') => {
                        self.bump();
                        self.sequence(b']').map(|items| self.vm.array(items))
                    }
                    Some(b'{') => {
                        self.bump();
                        let items = self.sequence(b'}')?;
                        if items.len() % 2 != 0 {
                            return Err(self.err("table literal needs an even number of forms"));
                        }
                        let table = self.vm.new_table();
                        for pair in items.chunks(2) {
                            table.put(pair[0], pair[1]);
                        }
                        Ok(Value::Table(table))
                    }
                    Some(b'"') => {
                        self.bump();
                        let bytes = self.string_body()?;
                        Ok(self.vm.buffer(bytes))
                    }
                    _ => Err(self.err("expected [, { or \" after @")),
                }
            }
            b'"' => {
                self.bump();
                let bytes = self.string_body()?;
                Ok(self.vm.string(&bytes))
            }
            b'\'' => {
                self.bump();
                let quoted = self.form()?;
                let quote = self.vm.symbol(b"quote");
                Ok(self.vm.tuple(vec![quote, quoted]))
            }
            b')' | b']' | b'}' => Err(self.err(format!("unmatched {}", b as char))),
            b':' => {
                // Keyword syntax: `:name` reads as the self-evaluating form
                // `(quote name)`, so keywords survive compilation as plain
                // symbols.
                self.bump();
                let name = self.token();
                if name.is_empty() {
                    return Err(self.err("empty keyword"));
                }
                let quote = self.vm.symbol(b"quote");
                let sym = self.vm.symbol(&name);
                Ok(self.vm.tuple(vec![quote, sym]))
            }
            _ => self.atom(),
        }
    }

    /// Forms up to the closing delimiter.
    fn sequence(&mut self, close: u8) -> Result<Vec<Value>, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(self.err_eos(format!("missing closing {}", close as char)));
                }
                Some(b) if b == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(_) => items.push(self.form()?),
            }
        }
    }

    /// Body of a string or buffer literal, after the opening quote.
    fn string_body(&mut self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        loop {
            let b = match self.bump() {
                Some(b) => b,
                None => return Err(self.err_eos("unterminated string")),
            };
            match b {
                b'"' => return Ok(out),
                b'\\' => {
                    let escape = match self.bump() {
                        Some(e) => e,
                        None => return Err(self.err_eos("unterminated escape")),
                    };
                    match escape {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'f' => out.push(0x0C),
                        b'0' | b'z' => out.push(0),
                        b'e' => out.push(0x1B),
                        b'"' => out.push(b'"'),
                        b'\'' => out.push(b'\''),
                        b'\\' => out.push(b'\\'),
                        b'h' => {
                            let hi = self.hex_digit()?;
                            let lo = self.hex_digit()?;
                            out.push(hi << 4 | lo);
                        }
                        other => {
                            return Err(self.err(format!("bad escape \\{}", other as char)));
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn hex_digit(&mut self) -> Result<u8, ParseError> {
        match self.bump() {
            Some(b) => match (b as char).to_digit(16) {
                Some(d) => Ok(d as u8),
                None => Err(self.err(format!("bad hex digit {}", b as char))),
            },
            None => Err(self.err_eos("unterminated escape")),
        }
    }

    /// Raw token bytes up to the next delimiter.
    fn token(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.peek() {
            if is_delimiter(b) {
                break;
            }
            out.push(b);
            self.bump();
        }
        out
    }

    /// Atom: nil, booleans, numbers, or a symbol.
    fn atom(&mut self) -> Result<Value, ParseError> {
        let token = self.token();
        if token.is_empty() {
            return Err(self.err("empty token"));
        }
        let text = String::from_utf8_lossy(&token).into_owned();
        Ok(match text.as_str() {
            "nil" => Value::Nil,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(i) = text.parse::<i64>() {
                    Value::Int(i)
                } else if looks_numeric(&text) {
                    match text.parse::<f64>() {
                        Ok(f) => Value::Float(f),
                        Err(_) => {
                            return Err(self.err(format!("malformed number {}", text)));
                        }
                    }
                } else {
                    self.vm.symbol(&token)
                }
            }
        })
    }
}

/// A token that starts like a number must parse as one.
fn looks_numeric(text: &str) -> bool {
    let rest = text.strip_prefix(['+', '-']).unwrap_or(text);
    rest.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::value::TypeTag;

    fn one(vm: &Vm, src: &str) -> Value {
        let forms = parse_all(vm, src).expect("parse");
        assert_eq!(forms.len(), 1, "expected one form from {:?}", src);
        forms[0]
    }

    #[test]
    fn test_scalars() {
        let vm = Vm::new();
        assert_eq!(one(&vm, "nil"), Value::Nil);
        assert_eq!(one(&vm, "true"), Value::Bool(true));
        assert_eq!(one(&vm, "-42"), Value::Int(-42));
        assert_eq!(one(&vm, "1.5"), Value::Float(1.5));
        assert_eq!(one(&vm, "1e3"), Value::Float(1000.0));
        assert_eq!(one(&vm, "foo"), vm.symbol(b"foo"));
        // Keywords read as quoted symbols.
        assert_eq!(
            one(&vm, ":done"),
            vm.tuple(vec![vm.symbol(b"quote"), vm.symbol(b"done")])
        );
    }

    #[test]
    fn test_aggregate_literal_shapes() {
        let vm = Vm::new();
        assert_eq!(one(&vm, "(1 2 3)").tag(), TypeTag::Tuple);
        assert_eq!(one(&vm, "[1 2 3]").tag(), TypeTag::Tuple);
        assert_eq!(one(&vm, "@[1 2]").tag(), TypeTag::Array);
        assert_eq!(one(&vm, "{:a 1}").tag(), TypeTag::Struct);
        assert_eq!(one(&vm, "@{}").tag(), TypeTag::Table);
        assert_eq!(one(&vm, "@\"bytes\"").tag(), TypeTag::Buffer);
    }

    #[test]
    fn test_quote_expands_to_tuple() {
        let vm = Vm::new();
        let q = one(&vm, "'x");
        assert_eq!(q, vm.tuple(vec![vm.symbol(b"quote"), vm.symbol(b"x")]));
    }

    #[test]
    fn test_string_escapes() {
        let vm = Vm::new();
        let s = one(&vm, r#""a\nb\t\h41\z\e\"q\"""#);
        assert_eq!(s, vm.string(b"a\nb\tA\x00\x1b\"q\""));
    }

    #[test]
    fn test_comments_and_commas_are_trivia() {
        let vm = Vm::new();
        let forms = parse_all(&vm, "# leading\n(1, 2) # trailing\n3").unwrap();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0], vm.tuple(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(forms[1], Value::Int(3));
    }

    #[test]
    fn test_unexpected_eos_is_flagged() {
        let vm = Vm::new();
        let err = parse_all(&vm, "(+ 1").unwrap_err();
        assert!(err.unexpected_eos);
        let err = parse_all(&vm, "\"open").unwrap_err();
        assert!(err.unexpected_eos);
        let err = parse_all(&vm, "(]").unwrap_err();
        assert!(!err.unexpected_eos);
    }

    #[test]
    fn test_positions_are_reported() {
        let vm = Vm::new();
        let err = parse_all(&vm, "\n\n  (]").unwrap_err();
        assert_eq!(err.line, 3);
    }
}
