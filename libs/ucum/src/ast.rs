/// A parsed UCUM expression: an ordered product of components.
///
/// `1/min` parses to a leading integer factor and a `min` component with
/// exponent -1; `kg.m/s2` to three components with exponents 1, 1 and -2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitExpr {
    pub components: Vec<(Component, i32)>,
}

impl UnitExpr {
    /// The dimensionless unity expression (`1`).
    pub fn one() -> Self {
        Self {
            components: vec![],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Component {
    /// A unit symbol with an optional metric prefix split off, e.g.
    /// `("m", "g")` for `mg`. The prefix is empty for unprefixed symbols.
    Symbol {
        prefix: String,
        atom: String,
        /// `{...}` annotation attached to the symbol, without braces
        annotation: Option<String>,
    },
    /// A positive integer factor, e.g. the `10` in `10.L/min`.
    Factor(u64),
    /// A parenthesized subexpression.
    Group(Box<UnitExpr>),
    /// A bare annotation, which is unity: `{rbc}` counts as `1`.
    Annotation(String),
}
