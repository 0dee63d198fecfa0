//! Dimensional analysis and canonical forms.

use crate::ast::{Component, UnitExpr};
use crate::error::{Error, Result};
use crate::registry::{self, DIMS};

/// Exponent vector over the seven base units (m, s, g, rad, K, C, cd).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dimension(pub [i8; DIMS]);

const BASE_SYMBOLS: [&str; DIMS] = ["m", "s", "g", "rad", "K", "C", "cd"];

impl Dimension {
    pub fn is_dimensionless(&self) -> bool {
        self.0.iter().all(|&e| e == 0)
    }

    /// Canonical rendering: base symbols with non-zero exponents in fixed
    /// order, joined with `.`, e.g. `m.s-2` or `1` for dimensionless.
    pub fn canonical(&self) -> String {
        let mut parts = Vec::new();
        for (i, &e) in self.0.iter().enumerate() {
            match e {
                0 => {}
                1 => parts.push(BASE_SYMBOLS[i].to_string()),
                e => parts.push(format!("{}{}", BASE_SYMBOLS[i], e)),
            }
        }
        if parts.is_empty() {
            "1".to_string()
        } else {
            parts.join(".")
        }
    }
}

/// The result of analyzing a unit expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// magnitude of one unit in canonical base units
    pub factor: f64,
    pub dim: Dimension,
    /// true when the expression involved a special (non-linear) unit
    pub special: bool,
}

impl Analysis {
    /// Canonical form including the magnitude, e.g. `1000 g.m.s-2` for `kN`.
    pub fn canonical_with_factor(&self) -> String {
        format!("{} {}", self.factor, self.dim.canonical())
    }
}

/// Analyze a parsed expression into factor and dimension.
///
/// Special units (Cel, [degF]) are only valid alone with exponent 1; any
/// combination is rejected, matching their affine nature.
pub fn analyze(expr: &UnitExpr) -> Result<Analysis> {
    let special_alone = matches!(
        expr.components.as_slice(),
        [(Component::Symbol { prefix, atom, .. }, 1)]
            if prefix.is_empty() && registry::atom(atom).is_some_and(|a| a.special)
    );

    let mut factor = 1.0f64;
    let mut dim = [0i8; DIMS];

    for (component, exponent) in &expr.components {
        let (component_factor, component_dim) = match component {
            Component::Symbol { prefix, atom, .. } => {
                let atom_def = registry::atom(atom)
                    .ok_or_else(|| Error::UnknownUnit(atom.clone()))?;
                if atom_def.special && !special_alone {
                    return Err(Error::NonLinear(atom_def.symbol.to_string()));
                }
                let prefix_factor = if prefix.is_empty() {
                    1.0
                } else {
                    registry::prefix(prefix)
                        .ok_or_else(|| Error::UnknownUnit(prefix.clone()))?
                        .factor
                };
                (prefix_factor * atom_def.factor, atom_def.dim)
            }
            Component::Factor(v) => (*v as f64, [0; DIMS]),
            Component::Annotation(_) => (1.0, [0; DIMS]),
            Component::Group(inner) => {
                let analysis = analyze(inner)?;
                if analysis.special {
                    return Err(Error::NonLinear("grouped special unit".to_string()));
                }
                (analysis.factor, analysis.dim.0)
            }
        };

        factor *= component_factor.powi(*exponent);
        for i in 0..DIMS {
            dim[i] += component_dim[i] * (*exponent as i8);
        }
    }

    Ok(Analysis {
        factor,
        dim: Dimension(dim),
        special: special_alone,
    })
}

/// Two expressions are comparable when they share a dimension.
pub fn comparable(a: &str, b: &str) -> Result<bool> {
    let a = analyze(&crate::parser::parse(a)?)?;
    let b = analyze(&crate::parser::parse(b)?)?;
    Ok(a.dim == b.dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analysis(input: &str) -> Analysis {
        analyze(&parse(input).unwrap()).unwrap()
    }

    #[test]
    fn newton_canonicalizes_to_mass_length_per_time_squared() {
        let a = analysis("kN");
        assert_eq!(a.dim.canonical(), "m.s-2.g");
        assert!((a.factor - 1e6).abs() < 1e-6);
    }

    #[test]
    fn grams_are_mass() {
        assert_eq!(analysis("mg").dim.canonical(), "g");
        assert_eq!(analysis("[lb_av]").dim.canonical(), "g");
    }

    #[test]
    fn percent_is_dimensionless() {
        let a = analysis("%");
        assert!(a.dim.is_dimensionless());
        assert!((a.factor - 0.01).abs() < 1e-12);
    }

    #[test]
    fn grouped_denominator_matches_flat_form() {
        assert_eq!(analysis("kg/(m.s2)").dim, analysis("kg.m-1.s-2").dim);
    }

    #[test]
    fn comparability_is_dimension_equality() {
        assert!(comparable("mg/dL", "g/L").unwrap());
        assert!(comparable("[in_i]", "cm").unwrap());
        assert!(!comparable("mg", "mL").unwrap());
        assert!(comparable("mm[Hg]", "Pa").unwrap());
    }

    #[test]
    fn special_units_valid_alone_only() {
        assert!(analyze(&parse("Cel").unwrap()).unwrap().special);
        assert!(matches!(
            analyze(&parse("Cel/s").unwrap()),
            Err(Error::NonLinear(_))
        ));
        assert!(matches!(
            analyze(&parse("Cel2").unwrap()),
            Err(Error::NonLinear(_))
        ));
    }

    #[test]
    fn ten_star_with_exponent() {
        let a = analysis("10*3/uL");
        assert_eq!(a.dim.canonical(), "m-3");
    }
}
