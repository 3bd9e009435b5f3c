//! Tokenizer and include preprocessor.
//!
//! [`SourceStream`] owns a stack of live buffers: the main source plus one
//! buffer per `#include` still being read. Tokens always come from the top
//! buffer; reaching its end pops back to the including file. All of this
//! state belongs to one compilation and is discarded with it.

use std::fs;
use std::ops::Range;
use std::rc::Rc;

use logos::Logos;

use crate::compiler::CompileError;

/// Include nesting deeper than this aborts compilation; it is almost
/// certainly an include cycle.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Classifies input the lexer rejects.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LexTrap {
    #[default]
    UnknownChar,
    MalformedNumber,
    UnterminatedString,
    BadDirective,
}

impl LexTrap {
    fn message(&self, slice: &str) -> String {
        match self {
            LexTrap::UnknownChar => format!("unknown character sequence '{slice}'"),
            LexTrap::MalformedNumber => format!("malformed number '{slice}'"),
            LexTrap::UnterminatedString => "unterminated string literal".to_string(),
            LexTrap::BadDirective => format!("unknown directive '{slice}', expected '#include'"),
        }
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexTrap)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r";[^\n]*", allow_greedy = true))]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    #[token("define")]
    Define,
    #[token("set")]
    Set,
    #[token("if")]
    If,
    #[token("begin")]
    Begin,
    #[token("list")]
    List,
    #[token("car")]
    Car,
    #[token("cdr")]
    Cdr,
    #[token("while")]
    While,
    #[token("lambda")]
    Lambda,
    #[token("native")]
    Native,
    #[token("#include")]
    Include,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("=")]
    Equal,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,

    #[regex(r"[+-]?[0-9]+", |lex| lex.slice().parse::<i64>().map_err(|_| LexTrap::MalformedNumber))]
    Int(i64),

    #[regex(r"[+-]?[0-9]+\.[0-9]*", |lex| lex.slice().parse::<f64>().map_err(|_| LexTrap::MalformedNumber))]
    Float(f64),

    #[regex(r#""[^"\n]*""#, |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Trap rules. A digit or sign running into letters or a second dot is a
    // malformed number, not two tokens; an unfinished string is rejected at
    // the line end; `#` starts nothing but `#include`. Each rule only fires
    // when no well-formed token covers the same text.
    #[regex(r"[+-]?[0-9]+(\.[0-9]*)?[A-Za-z_.][A-Za-z0-9_.]*", bad_number, priority = 1)]
    #[regex(r"[+-][A-Za-z_][A-Za-z0-9_]*", bad_number, priority = 1)]
    BadNumber,

    #[regex(r#""[^"\n]*"#, bad_string, priority = 1)]
    BadString,

    #[regex(r"#[A-Za-z]*", bad_directive, priority = 1)]
    BadDirective,
}

fn bad_number(_lex: &mut logos::Lexer<Token>) -> Result<(), LexTrap> {
    Err(LexTrap::MalformedNumber)
}

fn bad_string(_lex: &mut logos::Lexer<Token>) -> Result<(), LexTrap> {
    Err(LexTrap::UnterminatedString)
}

fn bad_directive(_lex: &mut logos::Lexer<Token>) -> Result<(), LexTrap> {
    Err(LexTrap::BadDirective)
}

/// A token plus where it came from, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub file: Rc<str>,
    pub line: u32,
}

struct Buffer {
    file: Rc<str>,
    text: String,
    offset: usize,
    line: u32,
}

/// Token source for one compilation: the active buffer stack.
pub struct SourceStream {
    buffers: Vec<Buffer>,
    last_position: (Rc<str>, u32),
}

impl SourceStream {
    pub fn new(source: &str, file: &str) -> Self {
        let file: Rc<str> = Rc::from(file);
        SourceStream {
            buffers: vec![Buffer {
                file: file.clone(),
                text: source.to_string(),
                offset: 0,
                line: 1,
            }],
            last_position: (file, 1),
        }
    }

    /// File and line of the current read position, for end-of-input errors.
    pub fn position(&self) -> (Rc<str>, u32) {
        match self.buffers.last() {
            Some(b) => (b.file.clone(), b.line),
            None => self.last_position.clone(),
        }
    }

    /// Next token across buffer boundaries. `Ok(None)` is the true end of
    /// input; `#include` never surfaces, it switches buffers instead.
    pub fn next(&mut self) -> Result<Option<SpannedToken>, CompileError> {
        loop {
            let directive;
            {
                let Some(buf) = self.buffers.last_mut() else {
                    return Ok(None);
                };
                match lex_one(buf) {
                    None => {
                        if let Some(done) = self.buffers.pop() {
                            self.last_position = (done.file, done.line);
                        }
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(t)) if t.token == Token::Include => directive = t,
                    Some(Ok(t)) => return Ok(Some(t)),
                }
            }
            self.push_include(directive)?;
        }
    }

    fn push_include(&mut self, directive: SpannedToken) -> Result<(), CompileError> {
        let include_err = |message: String| CompileError::Include {
            file: directive.file.to_string(),
            line: directive.line,
            message,
        };
        if self.buffers.len() >= MAX_INCLUDE_DEPTH {
            return Err(include_err(format!(
                "include depth exceeds {MAX_INCLUDE_DEPTH}, most likely an include cycle"
            )));
        }
        // the file name must follow in the same buffer
        let name = match self.buffers.last_mut().and_then(lex_one) {
            Some(Ok(SpannedToken { token: Token::Str(path), .. })) => path,
            Some(Err(e)) => return Err(e),
            _ => return Err(include_err("missing file name after #include".to_string())),
        };
        let text = read_utf16_file(&name).map_err(include_err)?;
        self.buffers.push(Buffer {
            file: Rc::from(name.as_str()),
            text,
            offset: 0,
            line: 1,
        });
        Ok(())
    }
}

fn lex_one(buf: &mut Buffer) -> Option<Result<SpannedToken, CompileError>> {
    let rest = &buf.text[buf.offset..];
    let mut lexer = Token::lexer(rest);
    let item = lexer.next()?;
    let span: Range<usize> = lexer.span();
    let line = buf.line + count_newlines(&rest[..span.start]);
    let result = match item {
        Ok(token) => Ok(SpannedToken {
            token,
            file: buf.file.clone(),
            line,
        }),
        Err(trap) => Err(CompileError::Lex {
            file: buf.file.to_string(),
            line,
            message: trap.message(&rest[span.clone()]),
        }),
    };
    buf.line += count_newlines(&rest[..span.end]);
    buf.offset += span.end;
    Some(result)
}

fn count_newlines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

/// Reads an include file, which must be UTF-16LE with a BOM.
pub fn read_utf16_file(path: &str) -> Result<String, String> {
    let bytes = fs::read(path).map_err(|e| format!("cannot read include file '{path}': {e}"))?;
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xFE {
        return Err(format!("include file '{path}' must be UTF-16LE with a BOM"));
    }
    let payload = &bytes[2..];
    if payload.len() % 2 != 0 {
        return Err(format!("include file '{path}' is truncated"));
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| format!("include file '{path}' is not valid UTF-16"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let mut stream = SourceStream::new(source, "test");
        let mut out = Vec::new();
        while let Some(t) = stream.next().unwrap() {
            out.push(t.token);
        }
        out
    }

    fn lex_error(source: &str) -> CompileError {
        let mut stream = SourceStream::new(source, "test");
        loop {
            match stream.next() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("lexed cleanly"),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn keywords_and_parens() {
        assert_eq!(
            tokens("(define x 5)"),
            vec![
                Token::LParen,
                Token::Define,
                Token::Ident("x".into()),
                Token::Int(5),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn keyword_prefix_degrades_to_identifier() {
        assert_eq!(tokens("definex"), vec![Token::Ident("definex".into())]);
        assert_eq!(tokens("carrot"), vec![Token::Ident("carrot".into())]);
    }

    #[test]
    fn signed_numbers_and_operators() {
        assert_eq!(
            tokens("(- -3 +4)"),
            vec![
                Token::LParen,
                Token::Minus,
                Token::Int(-3),
                Token::Int(4),
                Token::RParen,
            ]
        );
        assert_eq!(tokens("2.5"), vec![Token::Float(2.5)]);
        assert_eq!(tokens("3."), vec![Token::Float(3.0)]);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        for bad in ["12ab", "1.2.3", "-foo"] {
            let e = lex_error(bad);
            assert!(e.to_string().contains("malformed number"), "{bad}: {e}");
        }
    }

    #[test]
    fn strings_stop_at_line_end() {
        assert_eq!(tokens(r#""hello""#), vec![Token::Str("hello".into())]);
        let e = lex_error("\"oops\n\"");
        assert!(e.to_string().contains("unterminated string"));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(tokens("; a comment\n42 ; trailing"), vec![Token::Int(42)]);
    }

    #[test]
    fn lines_are_tracked() {
        let mut stream = SourceStream::new("1\n\n2", "test");
        assert_eq!(stream.next().unwrap().unwrap().line, 1);
        assert_eq!(stream.next().unwrap().unwrap().line, 3);
    }

    #[test]
    fn stray_hash_is_an_error() {
        let e = lex_error("#import");
        assert!(e.to_string().contains("expected '#include'"));
    }

    #[test]
    fn missing_include_name() {
        let e = lex_error("#include 5");
        assert!(matches!(e, CompileError::Include { .. }), "{e}");
    }

    #[test]
    fn include_missing_file_reports_path() {
        let e = lex_error("#include \"no_such_file.bl\"");
        assert!(e.to_string().contains("no_such_file.bl"));
    }
}
