//! Tokenizer for sandboxed module source.

use crate::ast::Position;
use crate::parser::{ParseError, ParseErrorCode, ParseResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
    /// A line terminator separates this token from the previous one.
    pub newline_before: bool,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(p) if *p == punct)
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(name) if name == keyword)
    }
}

// Longest first so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "=>", "&&", "||", "(", ")", "{", "}", "[", "]", ",",
    ";", ":", ".", "=", "+", "-", "*", "/", "!", "<", ">",
];

struct Cursor<'a> {
    chars: Vec<char>,
    index: usize,
    line: u32,
    column: u32,
    label: &'a str,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            // Columns count UTF-16 code units.
            self.column += ch.len_utf16() as u32;
        }
        Some(ch)
    }

    fn pos(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(offset, expected)| self.peek_at(offset) == Some(expected))
    }

    fn error(&self, code: ParseErrorCode, message: impl Into<String>, pos: Position) -> ParseError {
        ParseError::new(code, message, self.label, Some(pos))
    }
}

pub fn tokenize(text: &str, label: &str) -> ParseResult<Vec<Token>> {
    let mut cursor = Cursor {
        chars: text.chars().collect(),
        index: 0,
        line: 1,
        column: 1,
        label,
    };
    let mut tokens = Vec::new();
    let mut newline_before = false;

    loop {
        newline_before |= skip_trivia(&mut cursor)?;
        let pos = cursor.pos();
        let Some(ch) = cursor.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                pos,
                newline_before: true,
            });
            return Ok(tokens);
        };

        let kind = if ch.is_ascii_alphabetic() || ch == '_' || ch == '$' {
            let mut ident = String::new();
            while let Some(c) = cursor.peek() {
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    ident.push(c);
                    cursor.bump();
                } else {
                    break;
                }
            }
            TokenKind::Ident(ident)
        } else if ch.is_ascii_digit()
            || (ch == '.' && cursor.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            lex_number(&mut cursor, pos)?
        } else if ch == '\'' || ch == '"' {
            lex_string(&mut cursor, ch, pos)?
        } else if let Some(punct) = PUNCTUATORS.iter().find(|p| cursor.starts_with(p)) {
            for _ in 0..punct.len() {
                cursor.bump();
            }
            TokenKind::Punct(*punct)
        } else {
            return Err(cursor.error(
                ParseErrorCode::UnexpectedCharacter,
                format!("unexpected character '{ch}'"),
                pos,
            ));
        };

        tokens.push(Token {
            kind,
            pos,
            newline_before,
        });
        newline_before = false;
    }
}

/// Skip whitespace and comments; returns whether a newline was crossed.
fn skip_trivia(cursor: &mut Cursor<'_>) -> ParseResult<bool> {
    let mut saw_newline = false;
    loop {
        match cursor.peek() {
            Some('\n') => {
                saw_newline = true;
                cursor.bump();
            }
            Some(c) if c.is_whitespace() => {
                cursor.bump();
            }
            Some('/') if cursor.peek_at(1) == Some('/') => {
                while let Some(c) = cursor.peek() {
                    if c == '\n' {
                        break;
                    }
                    cursor.bump();
                }
            }
            Some('/') if cursor.peek_at(1) == Some('*') => {
                let start = cursor.pos();
                cursor.bump();
                cursor.bump();
                loop {
                    if cursor.starts_with("*/") {
                        cursor.bump();
                        cursor.bump();
                        break;
                    }
                    match cursor.bump() {
                        Some('\n') => saw_newline = true,
                        Some(_) => {}
                        None => {
                            return Err(cursor.error(
                                ParseErrorCode::UnterminatedComment,
                                "block comment is not terminated",
                                start,
                            ));
                        }
                    }
                }
            }
            _ => return Ok(saw_newline),
        }
    }
}

fn lex_number(cursor: &mut Cursor<'_>, pos: Position) -> ParseResult<TokenKind> {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if c.is_ascii_digit() || c == '.' || c == '_' {
            if c != '_' {
                text.push(c);
            }
            cursor.bump();
        } else {
            break;
        }
    }
    text.parse::<f64>().map(TokenKind::Number).map_err(|_| {
        cursor.error(
            ParseErrorCode::InvalidNumber,
            format!("invalid numeric literal '{text}'"),
            pos,
        )
    })
}

fn lex_string(cursor: &mut Cursor<'_>, quote: char, pos: Position) -> ParseResult<TokenKind> {
    cursor.bump();
    let mut value = String::new();
    loop {
        match cursor.bump() {
            Some(c) if c == quote => return Ok(TokenKind::Str(value)),
            Some('\\') => match cursor.bump() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some('0') => value.push('\0'),
                Some(other) => value.push(other),
                None => break,
            },
            Some('\n') | None => break,
            Some(c) => value.push(c),
        }
    }
    Err(cursor.error(
        ParseErrorCode::UnterminatedString,
        "string literal is not terminated",
        pos,
    ))
}
