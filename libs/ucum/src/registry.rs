//! Embedded essence slice: metric prefixes and the unit atoms the server
//! needs to validate clinical quantities.
//!
//! Dimensions are exponent vectors over the seven UCUM base units, in the
//! order (m, s, g, rad, K, C, cd).

use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const DIMS: usize = 7;

/// A metric prefix, e.g. `k` = 1e3.
#[derive(Debug, Clone, Copy)]
pub struct Prefix {
    pub symbol: &'static str,
    pub factor: f64,
}

/// A unit atom from the essence table.
#[derive(Debug, Clone, Copy)]
pub struct UnitAtom {
    pub symbol: &'static str,
    /// exponents over (m, s, g, rad, K, C, cd)
    pub dim: [i8; DIMS],
    /// magnitude relative to the canonical base-unit product
    pub factor: f64,
    /// whether a metric prefix may be attached
    pub metric: bool,
    /// special (non-linear) units such as Cel take no prefix arithmetic and
    /// cannot be combined or exponentiated
    pub special: bool,
}

pub static PREFIXES: &[Prefix] = &[
    Prefix { symbol: "Y", factor: 1e24 },
    Prefix { symbol: "Z", factor: 1e21 },
    Prefix { symbol: "E", factor: 1e18 },
    Prefix { symbol: "P", factor: 1e15 },
    Prefix { symbol: "T", factor: 1e12 },
    Prefix { symbol: "G", factor: 1e9 },
    Prefix { symbol: "M", factor: 1e6 },
    Prefix { symbol: "k", factor: 1e3 },
    Prefix { symbol: "h", factor: 1e2 },
    Prefix { symbol: "da", factor: 1e1 },
    Prefix { symbol: "d", factor: 1e-1 },
    Prefix { symbol: "c", factor: 1e-2 },
    Prefix { symbol: "m", factor: 1e-3 },
    Prefix { symbol: "u", factor: 1e-6 },
    Prefix { symbol: "n", factor: 1e-9 },
    Prefix { symbol: "p", factor: 1e-12 },
    Prefix { symbol: "f", factor: 1e-15 },
    Prefix { symbol: "a", factor: 1e-18 },
    Prefix { symbol: "z", factor: 1e-21 },
    Prefix { symbol: "y", factor: 1e-24 },
];

const M: [i8; DIMS] = [1, 0, 0, 0, 0, 0, 0];
const S: [i8; DIMS] = [0, 1, 0, 0, 0, 0, 0];
const G: [i8; DIMS] = [0, 0, 1, 0, 0, 0, 0];
const RAD: [i8; DIMS] = [0, 0, 0, 1, 0, 0, 0];
const K: [i8; DIMS] = [0, 0, 0, 0, 1, 0, 0];
const C: [i8; DIMS] = [0, 0, 0, 0, 0, 1, 0];
const CD: [i8; DIMS] = [0, 0, 0, 0, 0, 0, 1];
const ONE: [i8; DIMS] = [0, 0, 0, 0, 0, 0, 0];

macro_rules! atom {
    ($symbol:literal, $dim:expr, $factor:expr, metric) => {
        UnitAtom { symbol: $symbol, dim: $dim, factor: $factor, metric: true, special: false }
    };
    ($symbol:literal, $dim:expr, $factor:expr) => {
        UnitAtom { symbol: $symbol, dim: $dim, factor: $factor, metric: false, special: false }
    };
    ($symbol:literal, $dim:expr, $factor:expr, special) => {
        UnitAtom { symbol: $symbol, dim: $dim, factor: $factor, metric: false, special: true }
    };
}

pub static ATOMS: &[UnitAtom] = &[
    // base units
    atom!("m", M, 1.0, metric),
    atom!("s", S, 1.0, metric),
    atom!("g", G, 1.0, metric),
    atom!("rad", RAD, 1.0, metric),
    atom!("K", K, 1.0, metric),
    atom!("C", C, 1.0, metric),
    atom!("cd", CD, 1.0, metric),
    // dimensionless
    atom!("10*", ONE, 10.0),
    atom!("10^", ONE, 10.0),
    atom!("%", ONE, 0.01),
    atom!("[pi]", ONE, std::f64::consts::PI),
    atom!("[ppth]", ONE, 1e-3),
    atom!("[ppm]", ONE, 1e-6),
    atom!("[ppb]", ONE, 1e-9),
    // time
    atom!("min", S, 60.0),
    atom!("h", S, 3600.0),
    atom!("d", S, 86400.0),
    atom!("wk", S, 604800.0),
    atom!("mo", S, 2629800.0),
    atom!("a", S, 31557600.0),
    // SI derived (expressed over the base vector)
    atom!("Hz", [0, -1, 0, 0, 0, 0, 0], 1.0, metric),
    atom!("N", [1, -2, 1, 0, 0, 0, 0], 1000.0, metric),
    atom!("Pa", [-1, -2, 1, 0, 0, 0, 0], 1000.0, metric),
    atom!("J", [2, -2, 1, 0, 0, 0, 0], 1000.0, metric),
    atom!("W", [2, -3, 1, 0, 0, 0, 0], 1000.0, metric),
    atom!("A", [0, -1, 0, 0, 0, 1, 0], 1.0, metric),
    atom!("V", [2, -2, 1, 0, 0, -1, 0], 1000.0, metric),
    atom!("F", [-2, 2, -1, 0, 0, 2, 0], 0.001, metric),
    atom!("Ohm", [2, -1, 1, 0, 0, -2, 0], 1000.0, metric),
    atom!("S", [-2, 1, -1, 0, 0, 2, 0], 0.001, metric),
    atom!("Wb", [2, -1, 1, 0, 0, -1, 0], 1000.0, metric),
    atom!("T", [0, -1, 1, 0, 0, -1, 0], 1000.0, metric),
    atom!("lm", [0, 0, 0, 2, 0, 0, 1], 1.0, metric),
    atom!("lx", [-2, 0, 0, 2, 0, 0, 1], 1.0, metric),
    atom!("Bq", [0, -1, 0, 0, 0, 0, 0], 1.0, metric),
    atom!("Gy", [2, -2, 0, 0, 0, 0, 0], 1.0, metric),
    atom!("Sv", [2, -2, 0, 0, 0, 0, 0], 1.0, metric),
    atom!("sr", [0, 0, 0, 2, 0, 0, 0], 1.0, metric),
    // volume, mass, length conveniences
    atom!("L", [3, 0, 0, 0, 0, 0, 0], 1e-3, metric),
    atom!("l", [3, 0, 0, 0, 0, 0, 0], 1e-3, metric),
    atom!("ar", [2, 0, 0, 0, 0, 0, 0], 100.0, metric),
    atom!("t", G, 1e9, metric),
    atom!("u", G, 1.66053906660e-24, metric),
    atom!("eV", [2, -2, 1, 0, 0, 0, 0], 1.602176634e-16, metric),
    atom!("[in_i]", M, 0.0254),
    atom!("[ft_i]", M, 0.3048),
    atom!("[yd_i]", M, 0.9144),
    atom!("[mi_i]", M, 1609.344),
    atom!("[gal_us]", [3, 0, 0, 0, 0, 0, 0], 3.785411784e-3),
    atom!("[foz_us]", [3, 0, 0, 0, 0, 0, 0], 2.95735295625e-5),
    atom!("[lb_av]", G, 453.59237),
    atom!("[oz_av]", G, 28.349523125),
    // pressure
    atom!("bar", [-1, -2, 1, 0, 0, 0, 0], 1e8, metric),
    atom!("atm", [-1, -2, 1, 0, 0, 0, 0], 1.01325e8),
    atom!("mm[Hg]", [-1, -2, 1, 0, 0, 0, 0], 133322.387415),
    atom!("m[Hg]", [-1, -2, 1, 0, 0, 0, 0], 1.33322387415e8, metric),
    // chemistry / clinical
    atom!("mol", ONE, 6.02214076e23, metric),
    atom!("osm", ONE, 6.02214076e23, metric),
    atom!("eq", ONE, 6.02214076e23, metric),
    atom!("kat", [0, -1, 0, 0, 0, 0, 0], 6.02214076e23, metric),
    atom!("U", [0, -1, 0, 0, 0, 0, 0], 1.0036772e19, metric),
    atom!("[IU]", ONE, 1.0),
    atom!("[iU]", ONE, 1.0),
    atom!("g%", [-3, 0, 1, 0, 0, 0, 0], 1e4),
    atom!("[drp]", [3, 0, 0, 0, 0, 0, 0], 5e-8),
    // temperature
    atom!("Cel", K, 1.0, special),
    atom!("[degF]", K, 5.0 / 9.0, special),
    // angle
    atom!("deg", RAD, std::f64::consts::PI / 180.0),
    atom!("'", RAD, std::f64::consts::PI / 10800.0),
    atom!("''", RAD, std::f64::consts::PI / 648000.0),
    // information
    atom!("bit", ONE, 1.0, metric),
    atom!("By", ONE, 8.0, metric),
    atom!("Bd", [0, -1, 0, 0, 0, 0, 0], 1.0, metric),
];

static ATOM_INDEX: Lazy<HashMap<&'static str, &'static UnitAtom>> =
    Lazy::new(|| ATOMS.iter().map(|a| (a.symbol, a)).collect());

static PREFIX_INDEX: Lazy<HashMap<&'static str, &'static Prefix>> =
    Lazy::new(|| PREFIXES.iter().map(|p| (p.symbol, p)).collect());

pub fn atom(symbol: &str) -> Option<&'static UnitAtom> {
    ATOM_INDEX.get(symbol).copied()
}

pub fn prefix(symbol: &str) -> Option<&'static Prefix> {
    PREFIX_INDEX.get(symbol).copied()
}

/// Split a symbol into `(prefix, atom)`, preferring the bare atom over a
/// prefixed reading (`min` is minutes, not milli-`in`).
pub fn resolve(symbol: &str) -> Option<(Option<&'static Prefix>, &'static UnitAtom)> {
    if let Some(atom) = atom(symbol) {
        return Some((None, atom));
    }
    // try the longest prefix first so `da` wins over `d` in `daL`
    let mut candidates: Vec<&Prefix> = PREFIXES
        .iter()
        .filter(|p| symbol.starts_with(p.symbol) && symbol.len() > p.symbol.len())
        .collect();
    candidates.sort_by_key(|p| std::cmp::Reverse(p.symbol.len()));
    for p in candidates {
        if let Some(atom) = atom(&symbol[p.symbol.len()..]) {
            if atom.metric {
                return Some((Some(p), atom));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_atom_beats_prefixed_reading() {
        let (prefix, atom) = resolve("min").unwrap();
        assert!(prefix.is_none());
        assert_eq!(atom.symbol, "min");
    }

    #[test]
    fn prefix_resolution_takes_longest_prefix() {
        let (prefix, atom) = resolve("daL").unwrap();
        assert_eq!(prefix.unwrap().symbol, "da");
        assert_eq!(atom.symbol, "L");
    }

    #[test]
    fn non_metric_atoms_reject_prefixes() {
        assert!(resolve("k[in_i]").is_none());
        assert!(resolve("[in_i]").is_some());
    }
}
