//! ECL parser - converts expression constraint strings to AST
//!
//! Recursive descent over the token stream. Parsing is purely syntactic and
//! never queries the terminology; term and semantic validation are separate
//! phases (see [`crate::semantics`]).

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::Lexer;
use crate::token::{Token, TokenType};

const MAX_RECURSION_DEPTH: usize = 100;

/// Outcome of a fallible parse, for callers that want errors as data
/// rather than control flow.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub success: bool,
    pub ast: Option<EclNode>,
    pub errors: Vec<Error>,
}

/// Parse an expression constraint.
pub fn parse(input: &str) -> Result<EclNode> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        position: 0,
        recursion_depth: 0,
    };
    parser.parse()
}

/// Parse, collecting errors instead of failing.
pub fn check(input: &str) -> ParseOutcome {
    match parse(input) {
        Ok(ast) => ParseOutcome {
            success: true,
            ast: Some(ast),
            errors: Vec::new(),
        },
        Err(e) => ParseOutcome {
            success: false,
            ast: None,
            errors: vec![e],
        },
    }
}

/// Parser for expression constraints
struct Parser {
    tokens: Vec<Token>,
    position: usize,
    recursion_depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // the token vector always ends with Eof
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn current_is(&self, token_type: TokenType) -> bool {
        self.current().token_type == token_type
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, token_type: TokenType) -> Result<Token> {
        if self.current_is(token_type.clone()) {
            Ok(self.advance())
        } else {
            let token = self.current();
            Err(Error::ParseError(format!(
                "Expected {:?}, got {:?} at line {}, column {}",
                token_type, token.token_type, token.line, token.column
            )))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.recursion_depth += 1;
        if self.recursion_depth > MAX_RECURSION_DEPTH {
            return Err(Error::ParseError(format!(
                "Expression too deeply nested (max depth: {})",
                MAX_RECURSION_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.recursion_depth -= 1;
    }

    /// Parse the entire expression (top-level entry point)
    fn parse(&mut self) -> Result<EclNode> {
        let expression = self.parse_expression()?;

        if !self.current_is(TokenType::Eof) {
            let token = self.current();
            return Err(Error::ParseError(format!(
                "Unexpected token {:?} at line {}, column {}",
                token.token_type, token.line, token.column
            )));
        }

        Ok(expression)
    }

    /// Expression := SubExpr ( (AND|OR|MINUS) SubExpr )*
    ///
    /// Left-associative; runs of one operator collapse into a single n-ary
    /// node, so `a OR b OR c` has one Disjunction with three operands while
    /// `a AND b MINUS c` nests the conjunction inside the exclusion.
    fn parse_expression(&mut self) -> Result<EclNode> {
        self.enter()?;
        let mut node = self.parse_sub_expression()?;

        while let Some(operator) = self.compound_operator() {
            self.advance();
            let right = self.parse_sub_expression()?;

            node = match node {
                EclNode::CompoundExpressionConstraint {
                    operator: existing,
                    mut operands,
                } if existing == operator => {
                    operands.push(right);
                    EclNode::CompoundExpressionConstraint {
                        operator: existing,
                        operands,
                    }
                }
                left => EclNode::CompoundExpressionConstraint {
                    operator,
                    operands: vec![left, right],
                },
            };
        }

        self.leave();
        Ok(node)
    }

    fn compound_operator(&self) -> Option<CompoundOperator> {
        match self.current().token_type {
            TokenType::And => Some(CompoundOperator::Conjunction),
            TokenType::Or => Some(CompoundOperator::Disjunction),
            TokenType::Minus => Some(CompoundOperator::Exclusion),
            _ => None,
        }
    }

    /// SubExpr := [ConstraintOp] Focus [Refinement] [DottedSuffix]
    fn parse_sub_expression(&mut self) -> Result<EclNode> {
        self.enter()?;
        let mut node = self.parse_constrained_focus()?;

        if self.current_is(TokenType::Colon) {
            self.advance();
            let refinement = self.parse_refinement()?;
            node = EclNode::RefinedExpressionConstraint {
                subject: Box::new(node),
                refinement,
            };
        }

        if self.current_is(TokenType::Dot) {
            let mut attributes = Vec::new();
            while self.current_is(TokenType::Dot) {
                self.advance();
                attributes.push(self.parse_concept_reference()?);
            }
            node = EclNode::DottedExpressionConstraint {
                subject: Box::new(node),
                attributes,
            };
        }

        self.leave();
        Ok(node)
    }

    /// `[ConstraintOp] Focus` without refinement or dotted suffix
    fn parse_constrained_focus(&mut self) -> Result<EclNode> {
        let operator = self.constraint_operator();
        if operator.is_some() {
            self.advance();
        }

        let focus = self.parse_focus()?;

        Ok(match operator {
            Some(operator) => EclNode::SubExpressionConstraint {
                operator: Some(operator),
                focus: Box::new(focus),
            },
            None => focus,
        })
    }

    fn constraint_operator(&self) -> Option<ConstraintOperator> {
        match self.current().token_type {
            TokenType::ChildOf => Some(ConstraintOperator::ChildOf),
            TokenType::ChildOrSelfOf => Some(ConstraintOperator::ChildOrSelfOf),
            TokenType::DirectChildOf => Some(ConstraintOperator::DirectChildOf),
            TokenType::DirectChildOrSelfOf => Some(ConstraintOperator::DirectChildOrSelfOf),
            TokenType::ParentOf => Some(ConstraintOperator::ParentOf),
            TokenType::ParentOrSelfOf => Some(ConstraintOperator::ParentOrSelfOf),
            TokenType::DirectParentOf => Some(ConstraintOperator::DirectParentOf),
            TokenType::DirectParentOrSelfOf => Some(ConstraintOperator::DirectParentOrSelfOf),
            _ => None,
        }
    }

    /// Focus := SCTID [TERM] | WILDCARD | '^' SubExpr | '(' Expression ')'
    fn parse_focus(&mut self) -> Result<EclNode> {
        match self.current().token_type {
            TokenType::Sctid => Ok(EclNode::ConceptReference(self.parse_concept_reference()?)),
            TokenType::Wildcard => {
                self.advance();
                Ok(EclNode::Wildcard)
            }
            TokenType::MemberOf => {
                self.advance();
                let expression = self.parse_sub_expression()?;
                Ok(EclNode::MemberOf {
                    expression: Box::new(expression),
                })
            }
            TokenType::OpenParen => {
                self.advance();
                let expression = self.parse_expression()?;
                self.expect(TokenType::CloseParen)?;
                Ok(expression)
            }
            _ => {
                let token = self.current();
                Err(Error::ParseError(format!(
                    "Expected concept id, '*', '^' or '(' , got {:?} at line {}, column {}",
                    token.token_type, token.line, token.column
                )))
            }
        }
    }

    fn parse_concept_reference(&mut self) -> Result<ConceptReference> {
        let sctid = self.expect(TokenType::Sctid)?.value;
        let term = if self.current_is(TokenType::Term) {
            Some(self.advance().value)
        } else {
            None
        };
        Ok(ConceptReference { sctid, term })
    }

    /// Refinement := (AttrGroup | AttrSet) (',' (AttrGroup | AttrSet))*
    fn parse_refinement(&mut self) -> Result<Refinement> {
        let mut items = vec![self.parse_refinement_item()?];
        while self.current_is(TokenType::Comma) {
            self.advance();
            items.push(self.parse_refinement_item()?);
        }
        Ok(Refinement { items })
    }

    fn parse_refinement_item(&mut self) -> Result<RefinementItem> {
        let cardinality = self.parse_optional_cardinality()?;

        if self.current_is(TokenType::OpenBrace) {
            self.advance();
            let mut attributes = vec![self.parse_attribute(None)?];
            while self.current_is(TokenType::Comma) {
                self.advance();
                attributes.push(self.parse_attribute(None)?);
            }
            self.expect(TokenType::CloseBrace)?;
            Ok(RefinementItem::Group {
                cardinality,
                attributes,
            })
        } else {
            Ok(RefinementItem::Attribute(
                self.parse_attribute(cardinality)?,
            ))
        }
    }

    /// AttrExpr := [Cardinality] [R] SubExpr CompOp (SubExpr | Numeric | String)
    fn parse_attribute(&mut self, cardinality: Option<Cardinality>) -> Result<Attribute> {
        let cardinality = match cardinality {
            Some(c) => Some(c),
            None => self.parse_optional_cardinality()?,
        };

        let reverse = if self.current_is(TokenType::Reverse) {
            self.advance();
            true
        } else {
            false
        };

        let name = self.parse_constrained_focus()?;
        let op = self.parse_comparison_operator()?;
        let value = self.parse_attribute_value(op)?;

        Ok(Attribute {
            cardinality,
            reverse,
            name: Box::new(name),
            op,
            value,
        })
    }

    fn parse_comparison_operator(&mut self) -> Result<ComparisonOperator> {
        // '<' and '>' lex as constraint operators; in comparison position
        // they are orderings
        let op = match self.current().token_type {
            TokenType::Equal => ComparisonOperator::Equal,
            TokenType::NotEqual => ComparisonOperator::NotEqual,
            TokenType::ChildOf => ComparisonOperator::LessThan,
            TokenType::ParentOf => ComparisonOperator::GreaterThan,
            TokenType::LessThanOrEqual => ComparisonOperator::LessThanOrEqual,
            TokenType::GreaterThanOrEqual => ComparisonOperator::GreaterThanOrEqual,
            _ => {
                let token = self.current();
                return Err(Error::ParseError(format!(
                    "Expected comparison operator, got {:?} at line {}, column {}",
                    token.token_type, token.line, token.column
                )));
            }
        };
        self.advance();
        Ok(op)
    }

    fn parse_attribute_value(&mut self, op: ComparisonOperator) -> Result<AttributeValue> {
        let ordering = matches!(
            op,
            ComparisonOperator::LessThan
                | ComparisonOperator::GreaterThan
                | ComparisonOperator::LessThanOrEqual
                | ComparisonOperator::GreaterThanOrEqual
        );

        match self.current().token_type {
            TokenType::Integer => {
                let token = self.advance();
                let value = token.value.parse::<i64>().map_err(|_| {
                    Error::ParseError(format!("Invalid integer '{}'", token.value))
                })?;
                Ok(AttributeValue::Integer(value))
            }
            TokenType::Decimal => {
                let token = self.advance();
                let value = token.value.parse::<f64>().map_err(|_| {
                    Error::ParseError(format!("Invalid decimal '{}'", token.value))
                })?;
                Ok(AttributeValue::Decimal(value))
            }
            TokenType::Str => Ok(AttributeValue::Str(self.advance().value)),
            TokenType::Sctid if ordering => {
                // an unsigned number compared with an ordering operator is
                // numeric, not a concept id
                let token = self.advance();
                let value = token.value.parse::<i64>().map_err(|_| {
                    Error::ParseError(format!("Invalid integer '{}'", token.value))
                })?;
                Ok(AttributeValue::Integer(value))
            }
            _ => Ok(AttributeValue::Expression(Box::new(
                self.parse_sub_expression()?,
            ))),
        }
    }

    /// Cardinality := '[' (Int|'*') '..' (Int|'*') ']'
    fn parse_optional_cardinality(&mut self) -> Result<Option<Cardinality>> {
        if !self.current_is(TokenType::OpenBracket) {
            return Ok(None);
        }
        self.advance();

        let min = self.parse_cardinality_bound()?.unwrap_or(0);
        self.expect(TokenType::DotDot)?;
        let max = self.parse_cardinality_bound()?;
        self.expect(TokenType::CloseBracket)?;

        Ok(Some(Cardinality { min, max }))
    }

    fn parse_cardinality_bound(&mut self) -> Result<Option<u32>> {
        match self.current().token_type {
            TokenType::Wildcard => {
                self.advance();
                Ok(None)
            }
            TokenType::Sctid => {
                let token = self.advance();
                let value = token.value.parse::<u32>().map_err(|_| {
                    Error::ParseError(format!("Invalid cardinality bound '{}'", token.value))
                })?;
                Ok(Some(value))
            }
            _ => {
                let token = self.current();
                Err(Error::ParseError(format!(
                    "Expected cardinality bound, got {:?} at line {}, column {}",
                    token.token_type, token.line, token.column
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_concept_reference() {
        let ast = parse("404684003 |Clinical finding|").unwrap();
        assert_eq!(
            ast,
            EclNode::ConceptReference(ConceptReference {
                sctid: "404684003".into(),
                term: Some("Clinical finding".into()),
            })
        );
    }

    #[test]
    fn parses_descendant_or_self() {
        let ast = parse("<< 404684003 |Clinical finding|").unwrap();
        match ast {
            EclNode::SubExpressionConstraint { operator, focus } => {
                assert_eq!(operator, Some(ConstraintOperator::ChildOrSelfOf));
                match *focus {
                    EclNode::ConceptReference(reference) => {
                        assert_eq!(reference.sctid, "404684003");
                    }
                    other => panic!("unexpected focus {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_member_of() {
        let ast = parse("^ 700043003 |Example refset|").unwrap();
        assert!(matches!(ast, EclNode::MemberOf { .. }));
    }

    #[test]
    fn compound_runs_collapse_nary() {
        let ast = parse("19829001 OR 301867009 OR 312342009").unwrap();
        match ast {
            EclNode::CompoundExpressionConstraint { operator, operands } => {
                assert_eq!(operator, CompoundOperator::Disjunction);
                assert_eq!(operands.len(), 3);
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn mixed_compounds_nest_left_associatively() {
        let ast = parse("< 19829001 AND < 301867009 MINUS 312342009").unwrap();
        match ast {
            EclNode::CompoundExpressionConstraint { operator, operands } => {
                assert_eq!(operator, CompoundOperator::Exclusion);
                assert_eq!(operands.len(), 2);
                assert!(matches!(
                    operands[0],
                    EclNode::CompoundExpressionConstraint {
                        operator: CompoundOperator::Conjunction,
                        ..
                    }
                ));
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_refinement_with_attribute() {
        let ast = parse("< 19829001 : 116676008 = 79654002").unwrap();
        match ast {
            EclNode::RefinedExpressionConstraint { refinement, .. } => {
                assert_eq!(refinement.items.len(), 1);
                match &refinement.items[0] {
                    RefinementItem::Attribute(attribute) => {
                        assert_eq!(attribute.op, ComparisonOperator::Equal);
                        assert!(!attribute.reverse);
                        assert!(matches!(
                            attribute.value,
                            AttributeValue::Expression(_)
                        ));
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_attribute_group_with_cardinality_and_reverse() {
        let ast =
            parse("< 404684003 : [1..3] { 363698007 = << 39057004 }, [0..*] R 363698007 = 404684003")
                .unwrap();
        match ast {
            EclNode::RefinedExpressionConstraint { refinement, .. } => {
                assert_eq!(refinement.items.len(), 2);
                match &refinement.items[0] {
                    RefinementItem::Group {
                        cardinality,
                        attributes,
                    } => {
                        assert_eq!(cardinality.unwrap().min, 1);
                        assert_eq!(cardinality.unwrap().max, Some(3));
                        assert_eq!(attributes.len(), 1);
                    }
                    other => panic!("unexpected item {other:?}"),
                }
                match &refinement.items[1] {
                    RefinementItem::Attribute(attribute) => {
                        assert!(attribute.reverse);
                        assert_eq!(attribute.cardinality.unwrap().max, None);
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_numeric_and_string_values() {
        let ast = parse("< 373873005 : 1142139005 = +20").unwrap();
        match ast {
            EclNode::RefinedExpressionConstraint { refinement, .. } => {
                match &refinement.items[0] {
                    RefinementItem::Attribute(attribute) => {
                        assert_eq!(attribute.value, AttributeValue::Integer(20));
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }

        let ast = parse(r#"< 373873005 : 1142140007 = "mg""#).unwrap();
        match ast {
            EclNode::RefinedExpressionConstraint { refinement, .. } => {
                match &refinement.items[0] {
                    RefinementItem::Attribute(attribute) => {
                        assert_eq!(attribute.value, AttributeValue::Str("mg".into()));
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn ordering_comparison_takes_unsigned_numbers() {
        let ast = parse("< 373873005 : 1142139005 >= 20").unwrap();
        match ast {
            EclNode::RefinedExpressionConstraint { refinement, .. } => {
                match &refinement.items[0] {
                    RefinementItem::Attribute(attribute) => {
                        assert_eq!(attribute.op, ComparisonOperator::GreaterThanOrEqual);
                        assert_eq!(attribute.value, AttributeValue::Integer(20));
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_dotted_suffix() {
        let ast = parse("404684003 . 363698007 |Finding site| . 272741003").unwrap();
        match ast {
            EclNode::DottedExpressionConstraint { attributes, .. } => {
                assert_eq!(attributes.len(), 2);
                assert_eq!(attributes[0].sctid, "363698007");
                assert_eq!(attributes[0].term.as_deref(), Some("Finding site"));
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn parses_parenthesized_compound_as_focus() {
        let ast = parse("<< ( 19829001 OR 301867009 )").unwrap();
        match ast {
            EclNode::SubExpressionConstraint { operator, focus } => {
                assert_eq!(operator, Some(ConstraintOperator::ChildOrSelfOf));
                assert!(matches!(
                    *focus,
                    EclNode::CompoundExpressionConstraint { .. }
                ));
            }
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_tokens() {
        let err = parse("404684003 404684003").unwrap_err();
        assert!(err.to_string().contains("Unexpected token"));
    }

    #[test]
    fn rejects_missing_focus() {
        let err = parse("<<").unwrap_err();
        assert!(err.to_string().contains("Expected concept id"));
    }

    #[test]
    fn check_reports_errors_as_data() {
        let outcome = check("<<");
        assert!(!outcome.success);
        assert!(outcome.ast.is_none());
        assert_eq!(outcome.errors.len(), 1);

        let outcome = check("<< 404684003");
        assert!(outcome.success);
        assert!(outcome.ast.is_some());
    }
}
