//! Human-readable names for common language, region and script subtags.
//!
//! A deliberately small registry slice: terminology designations only need
//! names for the tags that actually occur in clinical data. Unknown subtags
//! fall back to the subtag itself at the call site (both lookups return
//! `None`).

static LANGUAGES: &[(&str, &str)] = &[
    ("ar", "Arabic"),
    ("bg", "Bulgarian"),
    ("bn", "Bengali"),
    ("cs", "Czech"),
    ("da", "Danish"),
    ("de", "German"),
    ("el", "Greek"),
    ("en", "English"),
    ("es", "Spanish"),
    ("et", "Estonian"),
    ("fa", "Persian"),
    ("fi", "Finnish"),
    ("fr", "French"),
    ("he", "Hebrew"),
    ("hi", "Hindi"),
    ("hr", "Croatian"),
    ("hu", "Hungarian"),
    ("id", "Indonesian"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("lt", "Lithuanian"),
    ("lv", "Latvian"),
    ("nl", "Dutch"),
    ("no", "Norwegian"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("ro", "Romanian"),
    ("ru", "Russian"),
    ("sk", "Slovak"),
    ("sl", "Slovenian"),
    ("sr", "Serbian"),
    ("sv", "Swedish"),
    ("th", "Thai"),
    ("tr", "Turkish"),
    ("uk", "Ukrainian"),
    ("ur", "Urdu"),
    ("vi", "Vietnamese"),
    ("zh", "Chinese"),
];

static REGIONS: &[(&str, &str)] = &[
    ("AR", "Argentina"),
    ("AT", "Austria"),
    ("AU", "Australia"),
    ("BE", "Belgium"),
    ("BR", "Brazil"),
    ("CA", "Canada"),
    ("CH", "Switzerland"),
    ("CN", "China"),
    ("DE", "Germany"),
    ("DK", "Denmark"),
    ("ES", "Spain"),
    ("FR", "France"),
    ("GB", "United Kingdom"),
    ("HK", "Hong Kong"),
    ("IE", "Ireland"),
    ("IN", "India"),
    ("IT", "Italy"),
    ("JP", "Japan"),
    ("KR", "South Korea"),
    ("MX", "Mexico"),
    ("NL", "Netherlands"),
    ("NO", "Norway"),
    ("NZ", "New Zealand"),
    ("PT", "Portugal"),
    ("RU", "Russia"),
    ("SE", "Sweden"),
    ("SG", "Singapore"),
    ("TW", "Taiwan"),
    ("US", "United States"),
];

static SCRIPTS: &[(&str, &str)] = &[
    ("Arab", "Arabic"),
    ("Cyrl", "Cyrillic"),
    ("Deva", "Devanagari"),
    ("Grek", "Greek"),
    ("Hans", "Simplified"),
    ("Hant", "Traditional"),
    ("Hebr", "Hebrew"),
    ("Jpan", "Japanese"),
    ("Kore", "Korean"),
    ("Latn", "Latin"),
];

pub fn language_name(subtag: &str) -> Option<&'static str> {
    LANGUAGES
        .binary_search_by_key(&subtag, |(code, _)| code)
        .ok()
        .map(|i| LANGUAGES[i].1)
}

pub fn region_name(subtag: &str) -> Option<&'static str> {
    REGIONS
        .binary_search_by_key(&subtag, |(code, _)| code)
        .ok()
        .map(|i| REGIONS[i].1)
}

pub fn script_name(subtag: &str) -> Option<&'static str> {
    SCRIPTS
        .binary_search_by_key(&subtag, |(code, _)| code)
        .ok()
        .map(|i| SCRIPTS[i].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_sorted_for_binary_search() {
        assert!(LANGUAGES.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(REGIONS.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(SCRIPTS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn known_subtags_resolve() {
        assert_eq!(language_name("de"), Some("German"));
        assert_eq!(region_name("CH"), Some("Switzerland"));
        assert_eq!(script_name("Hans"), Some("Simplified"));
        assert_eq!(language_name("xx"), None);
    }
}
