//! UCUM term parser.
//!
//! Grammar (UCUM §2.2):
//!
//! ```text
//! main-term   := '/' term | term
//! term        := component ( ('.' | '/') component )*
//! component   := annotatable [annotation] | annotation | factor | '(' term ')'
//! annotatable := simple-unit [exponent]
//! simple-unit := [prefix] atom
//! exponent    := ['+' | '-'] digits
//! annotation  := '{' chars '}'
//! ```

use crate::ast::{Component, UnitExpr};
use crate::error::{Error, Result};
use crate::registry;

/// Parse a UCUM expression into its component product.
pub fn parse(input: &str) -> Result<UnitExpr> {
    if input.is_empty() {
        return Err(Error::Empty);
    }
    if !input.is_ascii() {
        return Err(Error::NonAscii);
    }
    if input.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(Error::ContainsWhitespace);
    }

    let bytes = input.as_bytes();
    let mut parser = Parser { bytes, pos: 0 };
    let expr = parser.parse_term()?;
    if parser.pos != bytes.len() {
        return Err(Error::Syntax {
            pos: parser.pos,
            message: "trailing input",
        });
    }
    Ok(expr)
}

/// Validate without keeping the parse.
pub fn validate(input: &str) -> Result<()> {
    parse(input).map(|_| ())
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_term(&mut self) -> Result<UnitExpr> {
        let mut components = Vec::new();

        // leading '/' divides unity: /min == 1/min
        let mut sign = if self.peek() == Some(b'/') {
            self.pos += 1;
            -1
        } else {
            1
        };

        loop {
            let (component, exponent) = self.parse_component()?;
            components.push((component, exponent * sign));

            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    sign = 1;
                }
                Some(b'/') => {
                    self.pos += 1;
                    sign = -1;
                }
                _ => break,
            }
        }

        Ok(UnitExpr { components })
    }

    fn parse_component(&mut self) -> Result<(Component, i32)> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_term()?;
                if self.peek() != Some(b')') {
                    return Err(Error::Syntax {
                        pos: self.pos,
                        message: "expected ')'",
                    });
                }
                self.pos += 1;
                let exponent = self.parse_exponent()?.unwrap_or(1);
                Ok((Component::Group(Box::new(inner)), exponent))
            }
            Some(b'{') => {
                let annotation = self.parse_annotation()?;
                Ok((Component::Annotation(annotation), 1))
            }
            Some(b) if b.is_ascii_digit() => {
                // a factor; `10*` and `10^` are atoms, so check those first
                if let Some((symbol, len)) = self.try_symbol() {
                    self.pos += len;
                    let exponent = self.parse_exponent()?.unwrap_or(1);
                    let annotation = self.try_annotation()?;
                    return Ok((self.symbol_component(symbol, annotation)?, exponent));
                }
                let start = self.pos;
                while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("ascii");
                let value: u64 = text.parse().map_err(|_| Error::Syntax {
                    pos: start,
                    message: "invalid integer factor",
                })?;
                let exponent = self.parse_exponent()?.unwrap_or(1);
                Ok((Component::Factor(value), exponent))
            }
            Some(_) => {
                let Some((symbol, len)) = self.try_symbol() else {
                    return Err(Error::Syntax {
                        pos: self.pos,
                        message: "expected unit symbol",
                    });
                };
                self.pos += len;
                let exponent = self.parse_exponent()?.unwrap_or(1);
                let annotation = self.try_annotation()?;
                Ok((self.symbol_component(symbol, annotation)?, exponent))
            }
            None => Err(Error::Syntax {
                pos: self.pos,
                message: "unexpected end of expression",
            }),
        }
    }

    fn symbol_component(
        &self,
        symbol: String,
        annotation: Option<String>,
    ) -> Result<Component> {
        let Some((prefix, atom)) = registry::resolve(&symbol) else {
            return Err(Error::UnknownUnit(symbol));
        };
        Ok(Component::Symbol {
            prefix: prefix.map(|p| p.symbol.to_string()).unwrap_or_default(),
            atom: atom.symbol.to_string(),
            annotation,
        })
    }

    /// Longest run of symbol characters that resolves in the registry.
    ///
    /// Symbol characters exclude the term operators `.` `/` `(` `)` `{` `}`
    /// and digits except where part of `10*`/`10^`; square-bracket atoms are
    /// consumed as a unit.
    fn try_symbol(&self) -> Option<(String, usize)> {
        let rest = &self.bytes[self.pos..];
        let mut len = 0;
        while len < rest.len() {
            match rest[len] {
                b'[' => {
                    // consume through the matching ']'
                    let close = rest[len..].iter().position(|&b| b == b']')?;
                    len += close + 1;
                }
                b'.' | b'/' | b'(' | b')' | b'{' | b'}' | b'+' | b'-' => break,
                b if b.is_ascii_digit() => {
                    // digits end a symbol except inside 10* / 10^
                    if len == 0 && (rest.starts_with(b"10*") || rest.starts_with(b"10^")) {
                        len = 3;
                    }
                    break;
                }
                _ => len += 1,
            }
        }
        // back off until the registry recognizes the run
        while len > 0 {
            let candidate = std::str::from_utf8(&rest[..len]).ok()?;
            if registry::resolve(candidate).is_some() {
                return Some((candidate.to_string(), len));
            }
            // annotations and exponents were already excluded; shrinking only
            // helps when a trailing char belongs to the next token
            len -= 1;
        }
        None
    }

    fn parse_exponent(&mut self) -> Result<Option<i32>> {
        let start = self.pos;
        let mut pos = self.pos;
        let negative = match self.bytes.get(pos) {
            Some(b'+') => {
                pos += 1;
                false
            }
            Some(b'-') => {
                pos += 1;
                true
            }
            _ => false,
        };
        let digits_start = pos;
        while matches!(self.bytes.get(pos), Some(b) if b.is_ascii_digit()) {
            pos += 1;
        }
        if pos == digits_start {
            // a sign with no digits is not an exponent
            return if digits_start > start {
                Err(Error::Syntax {
                    pos: start,
                    message: "expected digits after exponent sign",
                })
            } else {
                Ok(None)
            };
        }
        let text = std::str::from_utf8(&self.bytes[digits_start..pos]).expect("ascii");
        let mut value: i32 = text.parse().map_err(|_| Error::Syntax {
            pos: start,
            message: "exponent out of range",
        })?;
        if negative {
            value = -value;
        }
        self.pos = pos;
        Ok(Some(value))
    }

    fn try_annotation(&mut self) -> Result<Option<String>> {
        if self.peek() == Some(b'{') {
            Ok(Some(self.parse_annotation()?))
        } else {
            Ok(None)
        }
    }

    fn parse_annotation(&mut self) -> Result<String> {
        let start = self.pos;
        self.pos += 1; // '{'
        let rest = &self.bytes[self.pos..];
        let Some(close) = rest.iter().position(|&b| b == b'}') else {
            return Err(Error::Syntax {
                pos: start,
                message: "unterminated annotation",
            });
        };
        let text = std::str::from_utf8(&rest[..close]).expect("ascii").to_string();
        self.pos += close + 1;
        Ok(text)
    }
}
