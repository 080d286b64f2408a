//! Tokenizer for the built-in script language.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Sym(Sym),
    /// Statement separator: a newline outside brackets, or `;`.
    End,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sym {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    PlusAssign,
    MinusAssign,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut depth = 0usize;
    let mut i = 0;

    let push = |tokens: &mut Vec<Token>, tok: Tok, line: usize| tokens.push(Token { tok, line });

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    push(&mut tokens, Tok::End, line);
                }
                line += 1;
                i += 1;
            }
            ';' => {
                push(&mut tokens, Tok::End, line);
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(&chars, i, line)?;
                push(&mut tokens, Tok::Str(s), line);
                i = next;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let tok = if is_float {
                    text.parse::<f64>().map(Tok::Float).map_err(|_| {
                        ScriptError::syntax(format!("invalid number literal {}", text), line)
                    })?
                } else {
                    text.parse::<i64>().map(Tok::Int).map_err(|_| {
                        ScriptError::syntax(format!("integer literal {} out of range", text), line)
                    })?
                };
                push(&mut tokens, tok, line);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                push(&mut tokens, Tok::Ident(chars[start..i].iter().collect()), line);
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (sym, width) = match (c, next) {
                    ('+', Some('=')) => (Sym::PlusAssign, 2),
                    ('-', Some('=')) => (Sym::MinusAssign, 2),
                    ('/', Some('/')) => (Sym::SlashSlash, 2),
                    ('=', Some('=')) => (Sym::Eq, 2),
                    ('!', Some('=')) => (Sym::Ne, 2),
                    ('<', Some('=')) => (Sym::Le, 2),
                    ('>', Some('=')) => (Sym::Ge, 2),
                    ('(', _) => (Sym::LParen, 1),
                    (')', _) => (Sym::RParen, 1),
                    ('[', _) => (Sym::LBracket, 1),
                    (']', _) => (Sym::RBracket, 1),
                    ('{', _) => (Sym::LBrace, 1),
                    ('}', _) => (Sym::RBrace, 1),
                    (',', _) => (Sym::Comma, 1),
                    (':', _) => (Sym::Colon, 1),
                    ('.', _) => (Sym::Dot, 1),
                    ('=', _) => (Sym::Assign, 1),
                    ('+', _) => (Sym::Plus, 1),
                    ('-', _) => (Sym::Minus, 1),
                    ('*', _) => (Sym::Star, 1),
                    ('/', _) => (Sym::Slash, 1),
                    ('%', _) => (Sym::Percent, 1),
                    ('<', _) => (Sym::Lt, 1),
                    ('>', _) => (Sym::Gt, 1),
                    _ => {
                        return Err(ScriptError::syntax(
                            format!("unexpected character {:?}", c),
                            line,
                        ))
                    }
                };
                match sym {
                    Sym::LParen | Sym::LBracket | Sym::LBrace => depth += 1,
                    Sym::RParen | Sym::RBracket | Sym::RBrace => depth = depth.saturating_sub(1),
                    _ => {}
                }
                push(&mut tokens, Tok::Sym(sym), line);
                i += width;
            }
        }
    }
    push(&mut tokens, Tok::Eof, line);
    Ok(tokens)
}

/// Lex a quoted string starting at `start`; returns the text and the index
/// after the closing quote. Strings never span lines.
fn lex_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), ScriptError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| ScriptError::syntax("unterminated string literal", line))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => *other,
                });
                i += 2;
            }
            '\n' => {
                return Err(ScriptError::syntax("unterminated string literal", line));
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ScriptError::syntax("unterminated string literal", line))
}
