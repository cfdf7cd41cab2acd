use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::FeeEngineError;
use crate::FeeEngineResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    End,
}

/// A token plus the byte offset where it starts in the source expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

pub fn tokenize(expression: &str) -> FeeEngineResult<Vec<Token>> {
    let bytes = expression.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b',' => TokenKind::Comma,
            b'0'..=b'9' | b'.' => {
                let (number, next) = read_number(expression, i)?;
                tokens.push(Token {
                    kind: TokenKind::Number(number),
                    position: i,
                });
                i = next;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(expression[start..i].to_string()),
                    position: start,
                });
                continue;
            }
            _ => {
                let ch = expression[i..].chars().next().unwrap_or('?');
                return Err(FeeEngineError::FormulaSyntax {
                    position: i,
                    reason: format!("unexpected character '{ch}'"),
                });
            }
        };
        tokens.push(Token { kind, position: i });
        i += 1;
    }

    tokens.push(Token {
        kind: TokenKind::End,
        position: expression.len(),
    });
    Ok(tokens)
}

fn read_number(expression: &str, start: usize) -> FeeEngineResult<(Decimal, usize)> {
    let bytes = expression.as_bytes();
    let mut i = start;
    let mut seen_dot = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' | b'_' => i += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }

    let mut literal: String = expression[start..i].chars().filter(|c| *c != '_').collect();
    if literal == "." {
        return Err(FeeEngineError::FormulaSyntax {
            position: start,
            reason: "a number needs at least one digit".into(),
        });
    }
    // ".5" and "5." are accepted as 0.5 and 5
    if literal.starts_with('.') {
        literal.insert(0, '0');
    }
    if literal.ends_with('.') {
        literal.pop();
    }
    let value = Decimal::from_str(&literal).map_err(|e| FeeEngineError::FormulaSyntax {
        position: start,
        reason: format!("invalid number '{}': {e}", &expression[start..i]),
    })?;
    Ok((value, i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn kinds(expression: &str) -> Vec<TokenKind> {
        tokenize(expression)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_arithmetic() {
        assert_eq!(
            kinds("GC * (PMSP/ISP)"),
            vec![
                TokenKind::Ident("GC".into()),
                TokenKind::Star,
                TokenKind::LParen,
                TokenKind::Ident("PMSP".into()),
                TokenKind::Slash,
                TokenKind::Ident("ISP".into()),
                TokenKind::RParen,
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(
            kinds("1_000 + 0.015 + .5"),
            vec![
                TokenKind::Number(dec!(1000)),
                TokenKind::Plus,
                TokenKind::Number(dec!(0.015)),
                TokenKind::Plus,
                TokenKind::Number(dec!(0.5)),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_positions_are_byte_offsets() {
        let tokens = tokenize("NC  *  2").unwrap();
        let positions: Vec<usize> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 4, 7, 8]);
    }

    #[test]
    fn test_unknown_character_rejected() {
        let err = tokenize("GC % 2").unwrap_err();
        assert_eq!(
            err,
            FeeEngineError::FormulaSyntax {
                position: 3,
                reason: "unexpected character '%'".into(),
            }
        );
    }

    #[test]
    fn test_lone_dot_rejected() {
        assert!(tokenize("GC * .").is_err());
    }
}
