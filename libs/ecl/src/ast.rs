//! Abstract Syntax Tree (AST) for expression constraints
//!
//! The AST mirrors the grammar directly, without semantic analysis:
//!
//! ```text
//! Expression       := SubExpr | CompoundExpr
//! CompoundExpr     := SubExpr ( (AND|OR|MINUS) SubExpr )+
//! SubExpr          := [ConstraintOp] Focus [Refinement] [DottedSuffix]
//! Focus            := SCTID [TERM] | WILDCARD | '^' SubExpr | '(' Expression ')'
//! Refinement       := ':' (AttrGroup | AttrSet)
//! AttrGroup        := '{' AttrSet (',' AttrSet)* '}'
//! AttrSet          := [Cardinality] [R] AttrExpr (',' AttrExpr)*
//! AttrExpr         := SubExpr CompOp (SubExpr | Numeric | String)
//! Cardinality      := '[' (Int|'*') '..' (Int|'*') ']'
//! DottedSuffix     := '.' SCTID [TERM] ('.' SCTID [TERM])*
//! ```

/// A reference to a single concept, optionally annotated with a `|term|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptReference {
    pub sctid: String,
    pub term: Option<String>,
}

/// AST node representing an expression constraint
#[derive(Debug, Clone, PartialEq)]
pub enum EclNode {
    /// A plain concept reference: `404684003 |Clinical finding|`
    ConceptReference(ConceptReference),

    /// `*`
    Wildcard,

    /// Member-of a reference set: `^ 700043003`
    MemberOf { expression: Box<EclNode> },

    /// `[op] focus`, e.g. `<< 404684003`
    SubExpressionConstraint {
        operator: Option<ConstraintOperator>,
        focus: Box<EclNode>,
    },

    /// `a AND b`, `a OR b`, `a MINUS b` (n-ary for runs of one operator)
    CompoundExpressionConstraint {
        operator: CompoundOperator,
        operands: Vec<EclNode>,
    },

    /// `subject : refinement`
    RefinedExpressionConstraint {
        subject: Box<EclNode>,
        refinement: Refinement,
    },

    /// `subject . attribute . attribute ...`
    DottedExpressionConstraint {
        subject: Box<EclNode>,
        attributes: Vec<ConceptReference>,
    },
}

/// Hierarchy operator in front of a focus concept.
///
/// "Child"/"parent" here are transitive; the `Direct` variants are the
/// single-step forms written with `!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOperator {
    ChildOf,              // <   descendants
    ChildOrSelfOf,        // <<  self + descendants
    DirectChildOf,        // <!  immediate children
    DirectChildOrSelfOf,  // <<! self + immediate children
    ParentOf,             // >   ancestors
    ParentOrSelfOf,       // >>  self + ancestors
    DirectParentOf,       // >!  immediate parents
    DirectParentOrSelfOf, // >>! self + immediate parents
}

/// Boolean combinator between sub-expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOperator {
    Conjunction, // AND
    Disjunction, // OR
    Exclusion,   // MINUS
}

/// The refinement attached to a refined expression constraint.
///
/// Items are conjunctive: a concept satisfies the refinement when it
/// satisfies every item.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub items: Vec<RefinementItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefinementItem {
    /// `{ attr, attr, ... }` - attributes that must hold within one
    /// relationship group
    Group {
        cardinality: Option<Cardinality>,
        attributes: Vec<Attribute>,
    },
    /// A bare attribute constraint
    Attribute(Attribute),
}

/// One attribute constraint: `[card] [R] name op value`
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub cardinality: Option<Cardinality>,
    pub reverse: bool,
    /// The attribute name constraint (usually a concept reference or a
    /// hierarchy expression over concept-model attributes)
    pub name: Box<EclNode>,
    pub op: ComparisonOperator,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,              // =
    NotEqual,           // !=
    LessThan,           // <
    GreaterThan,        // >
    LessThanOrEqual,    // <=
    GreaterThanOrEqual, // >=
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Another expression constraint
    Expression(Box<EclNode>),
    /// A signed integer literal
    Integer(i64),
    /// A signed decimal literal
    Decimal(f64),
    /// A quoted string literal
    Str(String),
}

/// `[min..max]`; `max == None` is the unbounded `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cardinality {
    pub min: u32,
    pub max: Option<u32>,
}

impl Cardinality {
    pub fn allows(&self, count: usize) -> bool {
        let count = count as u32;
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }
}

impl EclNode {
    /// Walk every concept reference in the tree, in source order.
    pub fn walk_concept_references<'a>(&'a self, f: &mut impl FnMut(&'a ConceptReference)) {
        match self {
            EclNode::ConceptReference(reference) => f(reference),
            EclNode::Wildcard => {}
            EclNode::MemberOf { expression } => expression.walk_concept_references(f),
            EclNode::SubExpressionConstraint { focus, .. } => focus.walk_concept_references(f),
            EclNode::CompoundExpressionConstraint { operands, .. } => {
                for operand in operands {
                    operand.walk_concept_references(f);
                }
            }
            EclNode::RefinedExpressionConstraint {
                subject,
                refinement,
            } => {
                subject.walk_concept_references(f);
                for item in &refinement.items {
                    let attributes = match item {
                        RefinementItem::Group { attributes, .. } => attributes,
                        RefinementItem::Attribute(attribute) => std::slice::from_ref(attribute),
                    };
                    for attribute in attributes {
                        attribute.name.walk_concept_references(f);
                        if let AttributeValue::Expression(value) = &attribute.value {
                            value.walk_concept_references(f);
                        }
                    }
                }
            }
            EclNode::DottedExpressionConstraint {
                subject,
                attributes,
            } => {
                subject.walk_concept_references(f);
                for attribute in attributes {
                    f(attribute);
                }
            }
        }
    }
}
