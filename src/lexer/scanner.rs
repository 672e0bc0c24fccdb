//! Scanner for Oryx source code.

use crate::error::LexError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// The scanner transforms source text into a stream of tokens.
///
/// Newlines are significant (statement separators) and are emitted as
/// tokens; the parser decides where they matter.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
        }
    }

    /// Scan all tokens from the source.
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.scan_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            // Collapse runs of newlines into one.
            if token.kind == TokenKind::Newline
                && matches!(tokens.last().map(|t: &Token| &t.kind), Some(TokenKind::Newline))
            {
                continue;
            }
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Scan the next token.
    pub fn scan_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments();
        self.mark_start();

        let Some((_, c)) = self.advance() else {
            return Ok(Token::eof(self.current_pos, self.line, self.column));
        };

        match c {
            '\n' => Ok(self.make_token(TokenKind::Newline)),
            '(' => Ok(self.make_token(TokenKind::LeftParen)),
            ')' => Ok(self.make_token(TokenKind::RightParen)),
            '{' => Ok(self.make_token(TokenKind::LeftBrace)),
            '}' => Ok(self.make_token(TokenKind::RightBrace)),
            '[' => Ok(self.make_token(TokenKind::LeftBracket)),
            ']' => Ok(self.make_token(TokenKind::RightBracket)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            ':' => Ok(self.make_token(TokenKind::Colon)),
            ';' => Ok(self.make_token(TokenKind::Semicolon)),
            '.' => Ok(self.make_token(TokenKind::Dot)),
            '?' => Ok(self.make_token(TokenKind::Question)),
            '|' => Ok(self.make_token(TokenKind::PipeBar)),
            '~' => Ok(self.make_token(TokenKind::Tilde)),
            '^' => Ok(self.make_token(TokenKind::Caret)),
            '&' => Ok(self.make_token(TokenKind::Amp)),
            '+' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::PlusEq))
                } else {
                    Ok(self.make_token(TokenKind::Plus))
                }
            }
            '-' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::MinusEq))
                } else {
                    Ok(self.make_token(TokenKind::Minus))
                }
            }
            '*' => {
                if self.match_char('*') {
                    Ok(self.make_token(TokenKind::StarStar))
                } else if self.match_char('=') {
                    Ok(self.make_token(TokenKind::StarEq))
                } else {
                    Ok(self.make_token(TokenKind::Star))
                }
            }
            '/' => {
                if self.match_char('/') {
                    Ok(self.make_token(TokenKind::SlashSlash))
                } else if self.match_char('=') {
                    Ok(self.make_token(TokenKind::SlashEq))
                } else {
                    Ok(self.make_token(TokenKind::Slash))
                }
            }
            '%' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::PercentEq))
                } else {
                    Ok(self.make_token(TokenKind::Percent))
                }
            }
            '=' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::EqEq))
                } else if self.match_char('>') {
                    Ok(self.make_token(TokenKind::FatArrow))
                } else {
                    Ok(self.make_token(TokenKind::Eq))
                }
            }
            '!' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::BangEq))
                } else {
                    Ok(self.make_token(TokenKind::Bang))
                }
            }
            '<' => {
                if self.match_char('<') {
                    Ok(self.make_token(TokenKind::Shl))
                } else if self.match_char('=') {
                    Ok(self.make_token(TokenKind::LtEq))
                } else {
                    Ok(self.make_token(TokenKind::Lt))
                }
            }
            '>' => {
                if self.match_char('>') {
                    Ok(self.make_token(TokenKind::Shr))
                } else if self.match_char('=') {
                    Ok(self.make_token(TokenKind::GtEq))
                } else {
                    Ok(self.make_token(TokenKind::Gt))
                }
            }
            '"' => self.scan_string(),
            '@' => self.scan_native(),
            c if c.is_ascii_digit() => self.scan_number(c),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c),
            c => Err(LexError::StrayChar {
                ch: c,
                span: self.current_span(),
            }),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '#' => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_string(&mut self) -> Result<Token, LexError> {
        let mut value = String::new();
        loop {
            let Some((_, c)) = self.advance() else {
                return Err(LexError::UnclosedString {
                    span: self.current_span(),
                });
            };
            match c {
                '"' => break,
                '\n' => {
                    return Err(LexError::UnclosedString {
                        span: self.current_span(),
                    })
                }
                '\\' => {
                    let Some((_, esc)) = self.advance() else {
                        return Err(LexError::UnclosedString {
                            span: self.current_span(),
                        });
                    };
                    match esc {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        '0' => value.push('\0'),
                        other => {
                            return Err(LexError::UnknownEscape {
                                ch: other,
                                span: self.current_span(),
                            })
                        }
                    }
                }
                other => value.push(other),
            }
        }
        Ok(self.make_token(TokenKind::Str(value)))
    }

    fn scan_native(&mut self) -> Result<Token, LexError> {
        let mut name = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(LexError::MissingNativeName {
                span: self.current_span(),
            });
        }
        Ok(self.make_token(TokenKind::Native(name)))
    }

    fn scan_number(&mut self, first: char) -> Result<Token, LexError> {
        let mut text = String::new();
        text.push(first);
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.advance();
            } else {
                break;
            }
        }

        // A fractional part only if the dot is followed by a digit, so
        // `1.abs()` stays a method call and `1:4` stays a range.
        let mut is_num = false;
        if let Some(&(_, '.')) = self.chars.peek() {
            let after_dot = self.peek_at(1);
            if matches!(after_dot, Some(c) if c.is_ascii_digit()) {
                is_num = true;
                text.push('.');
                self.advance();
                while let Some(&(_, c)) = self.chars.peek() {
                    if c.is_ascii_digit() || c == '_' {
                        if c != '_' {
                            text.push(c);
                        }
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }
        if let Some(&(_, 'e')) | Some(&(_, 'E')) = self.chars.peek() {
            if matches!(self.peek_at(1), Some(c) if c.is_ascii_digit() || c == '+' || c == '-') {
                is_num = true;
                text.push('e');
                self.advance();
                if let Some(&(_, c)) = self.chars.peek() {
                    if c == '+' || c == '-' {
                        text.push(c);
                        self.advance();
                    }
                }
                while let Some(&(_, c)) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if is_num {
            let value = text
                .parse::<f64>()
                .map_err(|_| LexError::MalformedNumber {
                    text: text.clone(),
                    span: self.current_span(),
                })?;
            Ok(self.make_token(TokenKind::Num(value)))
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| LexError::MalformedNumber {
                    text: text.clone(),
                    span: self.current_span(),
                })?;
            Ok(self.make_token(TokenKind::Int(value)))
        }
    }

    fn scan_identifier(&mut self, first: char) -> Result<Token, LexError> {
        let mut name = String::new();
        name.push(first);
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = TokenKind::keyword(&name).unwrap_or(TokenKind::Ident(name));
        Ok(self.make_token(kind))
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let next = self.chars.next();
        if let Some((pos, c)) = next {
            self.current_pos = pos + c.len_utf8();
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        next
    }

    fn match_char(&mut self, expected: char) -> bool {
        if let Some(&(_, c)) = self.chars.peek() {
            if c == expected {
                self.advance();
                return true;
            }
        }
        false
    }

    /// Peek `offset` characters past the cursor; `peek_at(0)` is the same
    /// character `peek` would yield.
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source[self.current_pos..].chars().nth(offset)
    }

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.current_span())
    }

    fn current_span(&self) -> Span {
        Span::new(
            self.start_pos,
            self.current_pos,
            self.start_line,
            self.start_column,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .expect("scan failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            kinds("1 + 2.5 * x"),
            vec![
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Num(2.5),
                TokenKind::Star,
                TokenKind::Ident("x".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_range_colon_is_not_a_float() {
        assert_eq!(
            kinds("1:4"),
            vec![
                TokenKind::Int(1),
                TokenKind::Colon,
                TokenKind::Int(4),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_native() {
        assert_eq!(
            kinds("let f = fn(a) @print(a)"),
            vec![
                TokenKind::Let,
                TokenKind::Ident("f".to_string()),
                TokenKind::Eq,
                TokenKind::Fn,
                TokenKind::LeftParen,
                TokenKind::Ident("a".to_string()),
                TokenKind::RightParen,
                TokenKind::Native("print".to_string()),
                TokenKind::LeftParen,
                TokenKind::Ident("a".to_string()),
                TokenKind::RightParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_newlines_collapse() {
        assert_eq!(
            kinds("1 # one\n\n\n2"),
            vec![
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![TokenKind::Str("a\nb".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(Scanner::new("\"abc").scan_tokens().is_err());
    }
}
