//! ECL lexer - tokenizes expression constraints
//!
//! Converts an ECL string into a stream of tokens. Whitespace is
//! insignificant everywhere; `|...|` terms and quoted strings keep their
//! content verbatim (minus escapes).

use crate::error::{Error, Result};
use crate::token::{Token, TokenType};

/// The ECL lexer
pub struct Lexer {
    chars: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    current_char: Option<char>,
}

impl Lexer {
    /// Create a new lexer for the given input
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();

        Self {
            chars,
            position: 0,
            line: 1,
            column: 1,
            current_char,
        }
    }

    /// Advance to the next character
    fn advance(&mut self) {
        if let Some(c) = self.current_char {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.position += 1;
        self.current_char = self.chars.get(self.position).copied();
    }

    /// Peek at the next character without advancing
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position + 1).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.position + 2).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.current_char {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn here(&self) -> (usize, usize, usize) {
        (self.position, self.line, self.column)
    }

    /// Produce the next token
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();

        let (position, line, column) = self.here();

        let Some(c) = self.current_char else {
            return Ok(Token::eof(position, line, column));
        };

        let simple = |lexer: &mut Self, token_type: TokenType, text: &str| {
            for _ in 0..text.chars().count() {
                lexer.advance();
            }
            Ok(Token::new(token_type, text.to_string(), position, line, column))
        };

        match c {
            '<' => match (self.peek(), self.peek2()) {
                (Some('<'), Some('!')) => simple(self, TokenType::DirectChildOrSelfOf, "<<!"),
                (Some('<'), _) => simple(self, TokenType::ChildOrSelfOf, "<<"),
                (Some('='), _) => simple(self, TokenType::LessThanOrEqual, "<="),
                (Some('!'), _) => simple(self, TokenType::DirectChildOf, "<!"),
                _ => simple(self, TokenType::ChildOf, "<"),
            },
            '>' => match (self.peek(), self.peek2()) {
                (Some('>'), Some('!')) => simple(self, TokenType::DirectParentOrSelfOf, ">>!"),
                (Some('>'), _) => simple(self, TokenType::ParentOrSelfOf, ">>"),
                (Some('='), _) => simple(self, TokenType::GreaterThanOrEqual, ">="),
                (Some('!'), _) => simple(self, TokenType::DirectParentOf, ">!"),
                _ => simple(self, TokenType::ParentOf, ">"),
            },
            '!' => match self.peek() {
                Some('=') => simple(self, TokenType::NotEqual, "!="),
                _ => Err(self.unexpected(c)),
            },
            '=' => simple(self, TokenType::Equal, "="),
            '^' => simple(self, TokenType::MemberOf, "^"),
            '*' => simple(self, TokenType::Wildcard, "*"),
            '(' => simple(self, TokenType::OpenParen, "("),
            ')' => simple(self, TokenType::CloseParen, ")"),
            '{' => simple(self, TokenType::OpenBrace, "{"),
            '}' => simple(self, TokenType::CloseBrace, "}"),
            '[' => simple(self, TokenType::OpenBracket, "["),
            ']' => simple(self, TokenType::CloseBracket, "]"),
            ',' => simple(self, TokenType::Comma, ","),
            ':' => simple(self, TokenType::Colon, ":"),
            '.' => match self.peek() {
                Some('.') => simple(self, TokenType::DotDot, ".."),
                _ => simple(self, TokenType::Dot, "."),
            },
            '|' => {
                let term = self.read_term()?;
                Ok(Token::new(TokenType::Term, term, position, line, column))
            }
            '\'' | '"' => {
                let text = self.read_string(c)?;
                Ok(Token::new(TokenType::Str, text, position, line, column))
            }
            '+' | '-' => {
                // signed numbers may carry a decimal point; unsigned digit
                // runs are SCTIDs, so '.' after them is the dotted operator
                let number = self.read_number(true)?;
                let token_type = if number.contains('.') {
                    TokenType::Decimal
                } else {
                    TokenType::Integer
                };
                Ok(Token::new(token_type, number, position, line, column))
            }
            c if c.is_ascii_digit() => {
                let number = self.read_number(false)?;
                Ok(Token::new(TokenType::Sctid, number, position, line, column))
            }
            c if c.is_ascii_alphabetic() => {
                let word = self.read_word();
                let token_type = match word.to_ascii_uppercase().as_str() {
                    "AND" => TokenType::And,
                    "OR" => TokenType::Or,
                    "MINUS" => TokenType::Minus,
                    "R" => TokenType::Reverse,
                    _ => {
                        return Err(Error::ParseError(format!(
                            "Unexpected word '{}' at line {}, column {}",
                            word, line, column
                        )))
                    }
                };
                Ok(Token::new(token_type, word, position, line, column))
            }
            _ => Err(self.unexpected(c)),
        }
    }

    fn unexpected(&self, c: char) -> Error {
        Error::ParseError(format!(
            "Unexpected character '{}' at line {}, column {}",
            c, self.line, self.column
        ))
    }

    /// Read a `|term|`; the delimiters are dropped, inner whitespace is kept.
    fn read_term(&mut self) -> Result<String> {
        let (_, line, column) = self.here();
        self.advance(); // skip opening '|'

        let mut value = String::new();
        while let Some(c) = self.current_char {
            if c == '|' {
                self.advance();
                return Ok(value.trim().to_string());
            }
            value.push(c);
            self.advance();
        }

        Err(Error::ParseError(format!(
            "Unterminated term starting at line {}, column {}",
            line, column
        )))
    }

    /// Read a quoted string with `\"` / `\'` / `\\` escapes.
    fn read_string(&mut self, quote: char) -> Result<String> {
        let (_, line, column) = self.here();
        self.advance(); // skip opening quote

        let mut value = String::new();
        while let Some(c) = self.current_char {
            if c == quote {
                self.advance();
                return Ok(value);
            }
            if c == '\\' {
                self.advance();
                match self.current_char {
                    Some('\\') => value.push('\\'),
                    Some('\'') => value.push('\''),
                    Some('"') => value.push('"'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                }
                self.advance();
                continue;
            }
            value.push(c);
            self.advance();
        }

        Err(Error::ParseError(format!(
            "Unterminated string starting at line {}, column {}",
            line, column
        )))
    }

    /// Read a (possibly signed, possibly decimal) number
    fn read_number(&mut self, allow_decimal: bool) -> Result<String> {
        let (_, line, column) = self.here();
        let mut value = String::new();

        if matches!(self.current_char, Some('+') | Some('-')) {
            value.push(self.current_char.unwrap());
            self.advance();
        }

        let mut digits = 0usize;
        while let Some(c) = self.current_char {
            if c.is_ascii_digit() {
                value.push(c);
                digits += 1;
                self.advance();
            } else if c == '.'
                && allow_decimal
                && !value.contains('.')
                && self.peek().is_some_and(|n| n.is_ascii_digit())
            {
                value.push('.');
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(Error::ParseError(format!(
                "Expected digits at line {}, column {}",
                line, column
            )));
        }

        Ok(value)
    }

    fn read_word(&mut self) -> String {
        let start = self.position;
        while let Some(c) = self.current_char {
            if c.is_ascii_alphabetic() {
                self.advance();
            } else {
                break;
            }
        }
        self.chars[start..self.position].iter().collect()
    }

    /// Tokenize the whole input
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.token_type == TokenType::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(input: &str) -> Vec<TokenType> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token_type)
            .collect()
    }

    #[test]
    fn lexes_constraint_operators_maximal_munch() {
        assert_eq!(
            types("< << <! <<! > >> >! >>!"),
            vec![
                TokenType::ChildOf,
                TokenType::ChildOrSelfOf,
                TokenType::DirectChildOf,
                TokenType::DirectChildOrSelfOf,
                TokenType::ParentOf,
                TokenType::ParentOrSelfOf,
                TokenType::DirectParentOf,
                TokenType::DirectParentOrSelfOf,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn lexes_comparison_operators() {
        assert_eq!(
            types("= != <= >="),
            vec![
                TokenType::Equal,
                TokenType::NotEqual,
                TokenType::LessThanOrEqual,
                TokenType::GreaterThanOrEqual,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn lexes_sctid_with_term() {
        let tokens = Lexer::new("404684003 |Clinical finding|").tokenize().unwrap();
        assert_eq!(tokens[0].token_type, TokenType::Sctid);
        assert_eq!(tokens[0].value, "404684003");
        assert_eq!(tokens[1].token_type, TokenType::Term);
        assert_eq!(tokens[1].value, "Clinical finding");
    }

    #[test]
    fn signed_numbers_are_not_sctids() {
        let tokens = Lexer::new("-5 +3 +2.5 42").tokenize().unwrap();
        assert_eq!(tokens[0].token_type, TokenType::Integer);
        assert_eq!(tokens[1].token_type, TokenType::Integer);
        assert_eq!(tokens[2].token_type, TokenType::Decimal);
        assert_eq!(tokens[3].token_type, TokenType::Sctid);
    }

    #[test]
    fn dotted_suffix_does_not_merge_into_number() {
        assert_eq!(
            types("123.456"),
            vec![TokenType::Sctid, TokenType::Dot, TokenType::Sctid, TokenType::Eof],
        );
    }

    #[test]
    fn cardinality_brackets_and_ranges() {
        assert_eq!(
            types("[1..*]"),
            vec![
                TokenType::OpenBracket,
                TokenType::Sctid,
                TokenType::DotDot,
                TokenType::Wildcard,
                TokenType::CloseBracket,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn strings_with_escapes() {
        let tokens = Lexer::new(r#""a \"quoted\" value""#).tokenize().unwrap();
        assert_eq!(tokens[0].token_type, TokenType::Str);
        assert_eq!(tokens[0].value, r#"a "quoted" value"#);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            types("AND or MINUS"),
            vec![TokenType::And, TokenType::Or, TokenType::Minus, TokenType::Eof],
        );
    }

    #[test]
    fn unterminated_term_reports_location() {
        let err = Lexer::new("404684003 |oops").tokenize().unwrap_err();
        assert!(err.to_string().contains("Unterminated term"));
        assert!(err.to_string().contains("column 11"));
    }

    #[test]
    fn unexpected_character_reports_location() {
        let err = Lexer::new("404684003 #").tokenize().unwrap_err();
        assert!(err.to_string().contains("Unexpected character '#'"));
    }
}
