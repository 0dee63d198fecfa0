use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A parsed BCP-47 language tag.
///
/// Structural parsing only: subtags are classified by shape (2-3 alpha
/// language, 4 alpha script, 2 alpha / 3 digit region), not checked against
/// the IANA registry. Grandfathered tags are not supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LanguageTag {
    pub language: String,
    pub script: Option<String>,
    pub region: Option<String>,
    pub variants: Vec<String>,
    /// `x-...` private use suffix, verbatim without the leading `x-`
    pub private_use: Option<String>,
}

impl LanguageTag {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Empty);
        }

        let mut parts = text.split('-').peekable();

        let language = match parts.next() {
            Some(lang)
                if (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                lang.to_ascii_lowercase()
            }
            // wildcard range, as in Accept-Language "*"
            Some("*") => "*".to_string(),
            Some(other) => return Err(Error::InvalidLanguage(other.to_string())),
            None => return Err(Error::Empty),
        };

        let mut tag = Self {
            language,
            script: None,
            region: None,
            variants: Vec::new(),
            private_use: None,
        };

        // extlang subtags (3 alpha, up to three) are accepted and ignored.
        for _ in 0..3 {
            match parts.peek() {
                Some(p) if p.len() == 3 && p.chars().all(|c| c.is_ascii_alphabetic()) => {
                    parts.next();
                }
                _ => break,
            }
        }

        while let Some(part) = parts.next() {
            if part.eq_ignore_ascii_case("x") {
                let rest: Vec<&str> = parts.collect();
                if rest.is_empty() {
                    return Err(Error::InvalidSubtag {
                        tag: text.to_string(),
                        subtag: "x".to_string(),
                    });
                }
                tag.private_use = Some(rest.join("-"));
                break;
            }

            let is_script = part.len() == 4
                && part.chars().all(|c| c.is_ascii_alphabetic())
                && tag.script.is_none()
                && tag.region.is_none()
                && tag.variants.is_empty();
            let is_region = (part.len() == 2 && part.chars().all(|c| c.is_ascii_alphabetic())
                || part.len() == 3 && part.chars().all(|c| c.is_ascii_digit()))
                && tag.region.is_none()
                && tag.variants.is_empty();
            let is_variant = (4..=8).contains(&part.len())
                && part.chars().all(|c| c.is_ascii_alphanumeric());

            if is_script {
                let mut script = part.to_ascii_lowercase();
                script[..1].make_ascii_uppercase();
                tag.script = Some(script);
            } else if is_region {
                tag.region = Some(part.to_ascii_uppercase());
            } else if is_variant {
                tag.variants.push(part.to_ascii_lowercase());
            } else {
                return Err(Error::InvalidSubtag {
                    tag: text.to_string(),
                    subtag: part.to_string(),
                });
            }
        }

        Ok(tag)
    }

    pub fn is_wildcard(&self) -> bool {
        self.language == "*"
    }

    /// Does a stored designation in `stored` satisfy a request for `self`?
    ///
    /// The primary language must agree; script and region are constrained
    /// only when both sides carry them. A request for `de` accepts `de-CH`;
    /// a request for `de-DE` does not accept `de-CH`.
    pub fn accepts(&self, stored: &LanguageTag) -> bool {
        if self.is_wildcard() {
            return true;
        }
        if self.language != stored.language {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.script, &stored.script) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.region, &stored.region) {
            if a != b {
                return false;
            }
        }
        true
    }

    /// Match quality against a stored tag, higher is better. `None` when the
    /// stored tag is not acceptable at all.
    ///
    /// Exact tag > language+region > language+script > bare language.
    fn match_quality(&self, stored: &LanguageTag) -> Option<u8> {
        if !self.accepts(stored) {
            return None;
        }
        if self.is_wildcard() {
            return Some(0);
        }
        let region_hit = self.region.is_some() && self.region == stored.region;
        let script_hit = self.script.is_some() && self.script == stored.script;
        Some(match (region_hit, script_hit) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        })
    }
}

impl FromStr for LanguageTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.language)?;
        if let Some(script) = &self.script {
            write!(f, "-{}", script)?;
        }
        if let Some(region) = &self.region {
            write!(f, "-{}", region)?;
        }
        for v in &self.variants {
            write!(f, "-{}", v)?;
        }
        if let Some(p) = &self.private_use {
            write!(f, "-x-{}", p)?;
        }
        Ok(())
    }
}

/// An ordered language preference list, as carried by `Accept-Language` or a
/// `displayLanguage` parameter.
///
/// Tags are kept in descending preference order (quality weight, then
/// position). Unparseable entries are dropped rather than failing the whole
/// header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Languages {
    tags: Vec<LanguageTag>,
}

impl Languages {
    pub fn new(tags: Vec<LanguageTag>) -> Self {
        Self { tags }
    }

    /// Parse an Accept-Language header value, e.g. `de-CH, de;q=0.8, en;q=0.5`.
    pub fn parse_accept_language(header: &str) -> Self {
        let mut weighted: Vec<(f32, usize, LanguageTag)> = Vec::new();
        for (position, entry) in header.split(',').enumerate() {
            let mut q = 1.0f32;
            let mut range = entry.trim();
            if let Some((r, params)) = range.split_once(';') {
                range = r.trim();
                for param in params.split(';') {
                    if let Some(value) = param.trim().strip_prefix("q=") {
                        q = value.trim().parse().unwrap_or(0.0);
                    }
                }
            }
            if let Ok(tag) = LanguageTag::parse(range) {
                if q > 0.0 {
                    weighted.push((q, position, tag));
                }
            }
        }
        weighted.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        Self {
            tags: weighted.into_iter().map(|(_, _, t)| t).collect(),
        }
    }

    /// Single-tag list; convenient for `displayLanguage` parameters.
    pub fn single(tag: &str) -> Result<Self> {
        Ok(Self {
            tags: vec![LanguageTag::parse(tag)?],
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[LanguageTag] {
        &self.tags
    }

    /// Is a designation in `stored` acceptable to any requested language?
    pub fn accepts(&self, stored: &LanguageTag) -> bool {
        self.tags.iter().any(|t| t.accepts(stored))
    }

    /// Like [`Languages::accepts`], for a raw tag string. Unparseable stored
    /// tags are never acceptable.
    pub fn accepts_str(&self, stored: &str) -> bool {
        LanguageTag::parse(stored)
            .map(|tag| self.accepts(&tag))
            .unwrap_or(false)
    }

    /// Pick the best candidate out of `(language, index)` pairs, where a lower
    /// requested-language rank beats a higher match quality within a rank.
    ///
    /// Returns the index of the winning candidate. Candidates with no
    /// acceptable language never win.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<usize>
    where
        I: IntoIterator<Item = (Option<&'a str>, usize)>,
    {
        let mut best: Option<(usize, u8, usize)> = None; // (requested rank, quality, index)
        for (stored, index) in candidates {
            let Some(stored) = stored else { continue };
            let Ok(stored) = LanguageTag::parse(stored) else {
                continue;
            };
            for (rank, requested) in self.tags.iter().enumerate() {
                if let Some(quality) = requested.match_quality(&stored) {
                    let better = match best {
                        None => true,
                        Some((best_rank, best_quality, _)) => {
                            rank < best_rank || (rank == best_rank && quality > best_quality)
                        }
                    };
                    if better {
                        best = Some((rank, quality, index));
                    }
                    break;
                }
            }
        }
        best.map(|(_, _, index)| index)
    }
}

impl FromStr for Languages {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self::parse_accept_language(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_tag() {
        let tag = LanguageTag::parse("zh-Hans-CN").unwrap();
        assert_eq!(tag.language, "zh");
        assert_eq!(tag.script.as_deref(), Some("Hans"));
        assert_eq!(tag.region.as_deref(), Some("CN"));
        assert_eq!(tag.to_string(), "zh-Hans-CN");
    }

    #[test]
    fn parses_private_use() {
        let tag = LanguageTag::parse("en-US-x-clinical").unwrap();
        assert_eq!(tag.private_use.as_deref(), Some("clinical"));
    }

    #[test]
    fn rejects_malformed_tags() {
        assert!(LanguageTag::parse("").is_err());
        assert!(LanguageTag::parse("toolong").is_err());
        assert!(LanguageTag::parse("de-!!").is_err());
    }

    #[test]
    fn region_gates_acceptance_both_ways_only_when_both_present() {
        let de_ch = LanguageTag::parse("de-CH").unwrap();
        let de_de = LanguageTag::parse("de-DE").unwrap();
        let de = LanguageTag::parse("de").unwrap();

        assert!(de_ch.accepts(&de_ch));
        assert!(!de_de.accepts(&de_ch));
        assert!(de.accepts(&de_ch));
        assert!(de_ch.accepts(&de));
    }

    #[test]
    fn accept_language_orders_by_quality() {
        let langs = Languages::parse_accept_language("en;q=0.5, de-CH, fr;q=0.9");
        let order: Vec<String> = langs.tags().iter().map(|t| t.to_string()).collect();
        assert_eq!(order, vec!["de-CH", "fr", "en"]);
    }

    #[test]
    fn accept_language_drops_zero_quality_and_junk() {
        let langs = Languages::parse_accept_language("de, nope!!, en;q=0");
        let order: Vec<String> = langs.tags().iter().map(|t| t.to_string()).collect();
        assert_eq!(order, vec!["de"]);
    }

    #[test]
    fn best_match_prefers_requested_rank_over_quality() {
        let langs = Languages::parse_accept_language("de-CH, es");
        // candidate 0: bare "de" (rank 0, quality 0), candidate 1: exact "es" (rank 1)
        let winner = langs.best_match(vec![(Some("de"), 0), (Some("es"), 1)]);
        assert_eq!(winner, Some(0));
    }

    #[test]
    fn best_match_prefers_region_hit_within_rank() {
        let langs = Languages::parse_accept_language("de-CH");
        let winner = langs.best_match(vec![(Some("de"), 0), (Some("de-CH"), 1)]);
        assert_eq!(winner, Some(1));
    }

    #[test]
    fn wildcard_accepts_anything() {
        let langs = Languages::parse_accept_language("*");
        assert!(langs.accepts_str("ja"));
        assert!(langs.accepts_str("pt-BR"));
    }
}
