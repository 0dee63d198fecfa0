//! Code system providers.
//!
//! Every terminology backend implements [`CodeSystemProvider`], a uniform
//! capability surface over very different shapes: in-memory FHIR CodeSystems,
//! SQL-backed vocabularies, expression validators and remote services.
//! Concept handles are tagged so the worker can detect a handle that belongs
//! to a different provider without peeking inside it.

pub mod bcp47;
pub mod cpt;
pub mod fhir;
pub mod hgvs;
pub mod loinc;
pub mod ndc;
pub mod omop;
pub mod rxnorm;
pub mod snomed;
pub mod ucum;

use crate::error::{Error, Result};
use argentum_languages::Languages;
use argentum_models::{CodeSystemContentMode, Coding, Designation, FilterOperator};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of a subsumption test between two codes of one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsumptionOutcome {
    Equivalent,
    Subsumes,
    SubsumedBy,
    NotSubsumed,
}

impl SubsumptionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubsumptionOutcome::Equivalent => "equivalent",
            SubsumptionOutcome::Subsumes => "subsumes",
            SubsumptionOutcome::SubsumedBy => "subsumed-by",
            SubsumptionOutcome::NotSubsumed => "not-subsumed",
        }
    }
}

/// An opaque, provider-owned concept handle.
///
/// The tag identifies the owning provider family; `data` memoizes whatever
/// lookup state the provider wants to reuse on later calls with the same
/// handle. Handles are scoped to one operation and must not be shared across
/// requests.
#[derive(Clone)]
pub struct ConceptHandle {
    tag: &'static str,
    code: String,
    data: Arc<dyn Any + Send + Sync>,
}

impl ConceptHandle {
    pub fn new(tag: &'static str, code: impl Into<String>, data: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            tag,
            code: code.into(),
            data,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn data<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

impl std::fmt::Debug for ConceptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptHandle")
            .field("tag", &self.tag)
            .field("code", &self.code)
            .finish()
    }
}

/// Check a handle belongs to the provider with `tag` and downcast its data.
pub fn downcast_handle<'a, T: Send + Sync + 'static>(
    handle: &'a ConceptHandle,
    tag: &'static str,
) -> Result<&'a T> {
    if handle.tag != tag {
        return Err(Error::Validation(format!(
            "Foreign concept handle: expected a {} handle, got {}",
            tag, handle.tag
        )));
    }
    handle.data::<T>().ok_or_else(|| {
        Error::Internal(format!("corrupt {} concept handle for '{}'", tag, handle.code))
    })
}

/// Result of locating a code: a handle when it exists, a reason when not.
///
/// Unknown codes are reported, not thrown; transport and invariant failures
/// still surface as errors.
#[derive(Debug, Clone)]
pub enum Located {
    Found(ConceptHandle),
    NotFound { message: String },
}

impl Located {
    pub fn not_found(message: impl Into<String>) -> Self {
        Located::NotFound {
            message: message.into(),
        }
    }

    pub fn empty_code() -> Self {
        Located::not_found("Empty code")
    }

    pub fn context(self) -> Option<ConceptHandle> {
        match self {
            Located::Found(handle) => Some(handle),
            Located::NotFound { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Located::Found(_) => None,
            Located::NotFound { message } => Some(message),
        }
    }
}

/// A single-pass cursor over concept codes.
///
/// Cursors are materialized by the provider (array slice, query result) and
/// consumed once; they never regress past the end.
#[derive(Debug)]
pub struct ConceptCursor {
    codes: Vec<String>,
    position: usize,
}

impl ConceptCursor {
    pub fn new(codes: Vec<String>) -> Self {
        Self { codes, position: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn size(&self) -> u64 {
        self.codes.len() as u64
    }

    pub fn remaining(&self) -> usize {
        self.codes.len().saturating_sub(self.position)
    }

    pub fn next_code(&mut self) -> Option<String> {
        let code = self.codes.get(self.position).cloned()?;
        self.position += 1;
        Some(code)
    }
}

/// The designation set accumulated for one concept: its display, local
/// designations, and everything matching supplements contribute.
#[derive(Debug, Clone, Default)]
pub struct DesignationSet {
    items: Vec<Designation>,
}

impl DesignationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, language: Option<&str>, use_: Option<Coding>, value: impl Into<String>) {
        self.items.push(Designation::new(language, use_, value));
    }

    pub fn add_designation(&mut self, designation: Designation) {
        self.items.push(designation);
    }

    pub fn items(&self) -> &[Designation] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Best display for a language preference list. Registration order is
    /// the tie-break, so the concept's own display (added first) wins over a
    /// supplement's when both match equally well.
    pub fn best_value(&self, languages: &Languages) -> Option<&str> {
        if languages.is_empty() {
            return self.items.first().map(|d| d.value.as_str());
        }
        let candidates = self
            .items
            .iter()
            .enumerate()
            .map(|(index, d)| (d.language.as_deref(), index));
        languages
            .best_match(candidates)
            .map(|index| self.items[index].value.as_str())
    }

    /// Does any designation satisfy the language list?
    pub fn has_any_for(&self, languages: &Languages) -> bool {
        self.items.iter().any(|d| {
            d.language
                .as_deref()
                .map(|lang| languages.accepts_str(lang))
                .unwrap_or(false)
        })
    }
}

/// A concept-level property, carried as a `value[x]`-keyed object.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptProperty {
    pub code: String,
    pub value: JsonValue,
}

impl ConceptProperty {
    pub fn code_value(code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: serde_json::json!({ "valueCode": value.into() }),
        }
    }

    pub fn string(code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: serde_json::json!({ "valueString": value.into() }),
        }
    }

    pub fn boolean(code: impl Into<String>, value: bool) -> Self {
        Self {
            code: code.into(),
            value: serde_json::json!({ "valueBoolean": value }),
        }
    }

    pub fn integer(code: impl Into<String>, value: i64) -> Self {
        Self {
            code: code.into(),
            value: serde_json::json!({ "valueInteger": value }),
        }
    }

    pub fn decimal(code: impl Into<String>, value: f64) -> Self {
        Self {
            code: code.into(),
            value: serde_json::json!({ "valueDecimal": value }),
        }
    }
}

/// A materialized provider filter.
///
/// Closed filters are finite and enumerable; membership checks agree with
/// iteration by construction. Open filters decide membership per concept and
/// can neither iterate nor report a true size.
pub enum ConceptFilter {
    Closed {
        codes: Vec<String>,
        members: HashSet<String>,
    },
    Open {
        tag: &'static str,
        data: Arc<dyn Any + Send + Sync>,
    },
}

impl ConceptFilter {
    /// Build a closed filter, deduplicating while preserving provider order.
    pub fn closed(codes: Vec<String>) -> Self {
        let mut members = HashSet::with_capacity(codes.len());
        let mut unique = Vec::with_capacity(codes.len());
        for code in codes {
            if members.insert(code.clone()) {
                unique.push(code);
            }
        }
        ConceptFilter::Closed {
            codes: unique,
            members,
        }
    }

    pub fn open(tag: &'static str, data: Arc<dyn Any + Send + Sync>) -> Self {
        ConceptFilter::Open { tag, data }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConceptFilter::Closed { .. })
    }

    /// Enumerable size; open filters report 0.
    pub fn size(&self) -> u64 {
        match self {
            ConceptFilter::Closed { codes, .. } => codes.len() as u64,
            ConceptFilter::Open { .. } => 0,
        }
    }

    pub fn contains(&self, code: &str) -> Option<bool> {
        match self {
            ConceptFilter::Closed { members, .. } => Some(members.contains(code)),
            ConceptFilter::Open { .. } => None,
        }
    }

    /// Iterate a closed filter's codes in provider order.
    pub fn codes(&self) -> &[String] {
        match self {
            ConceptFilter::Closed { codes, .. } => codes,
            ConceptFilter::Open { .. } => &[],
        }
    }
}

impl std::fmt::Debug for ConceptFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConceptFilter::Closed { codes, .. } => {
                f.debug_struct("Closed").field("size", &codes.len()).finish()
            }
            ConceptFilter::Open { tag, .. } => f.debug_struct("Open").field("tag", tag).finish(),
        }
    }
}

/// The uniform capability surface of a code system backend.
#[async_trait]
pub trait CodeSystemProvider: Send + Sync {
    /// Canonical system URI
    fn system(&self) -> &str;

    fn version(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> String;

    /// Tag stamped onto this provider's concept handles
    fn handle_tag(&self) -> &'static str;

    /// Total number of concepts, when knowable
    async fn total_count(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn has_parents(&self) -> bool {
        false
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        CodeSystemContentMode::Complete
    }

    /// Does any concept carry a display acceptable to `languages`?
    async fn has_any_displays(&self, languages: &Languages) -> Result<bool>;

    /// Versioned URLs of the supplements active on this provider
    fn list_supplements(&self) -> Vec<String> {
        Vec::new()
    }

    /// Locate a code. Unknown codes are reported via [`Located::NotFound`],
    /// never thrown; the empty code reports "Empty code".
    async fn locate(&self, code: &str) -> Result<Located>;

    /// Code of a handle; fails on foreign handles.
    fn code(&self, context: &ConceptHandle) -> Result<String> {
        if context.tag() != self.handle_tag() {
            return Err(Error::Validation(format!(
                "Foreign concept handle: expected a {} handle, got {}",
                self.handle_tag(),
                context.tag()
            )));
        }
        Ok(context.code().to_string())
    }

    /// Base display of a concept
    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>>;

    /// Collect the full designation set: base display, local designations and
    /// matching supplement contributions.
    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()>;

    async fn is_abstract(&self, _context: &ConceptHandle) -> Result<bool> {
        Ok(false)
    }

    async fn is_inactive(&self, _context: &ConceptHandle) -> Result<bool> {
        Ok(false)
    }

    async fn is_deprecated(&self, _context: &ConceptHandle) -> Result<bool> {
        Ok(false)
    }

    async fn status(&self, _context: &ConceptHandle) -> Result<Option<String>> {
        Ok(None)
    }

    async fn item_weight(&self, _context: &ConceptHandle) -> Result<Option<f64>> {
        Ok(None)
    }

    async fn properties(&self, _context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        Ok(Vec::new())
    }

    async fn extensions(&self, _context: &ConceptHandle) -> Result<Vec<JsonValue>> {
        Ok(Vec::new())
    }

    /// Parent code, for providers with a single-parent view; null otherwise
    async fn parent(&self, _code: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Identity after normalization
    fn same_concept(&self, a: &str, b: &str) -> bool {
        a == b
    }

    /// Locate `code` as a descendant of `parent` (or the same concept unless
    /// `disallow_self`). Hierarchy-less providers report "does not have
    /// parents".
    async fn locate_is_a(&self, code: &str, parent: &str, disallow_self: bool) -> Result<Located> {
        let _ = (code, parent, disallow_self);
        Ok(Located::not_found(format!(
            "The CodeSystem {} does not have parents",
            self.system()
        )))
    }

    /// Subsumption between two codes; unknown codes fail.
    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome>;

    /// Cursor over root concepts (`None`) or the direct children of a handle.
    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor>;

    /// Cursor over every concept.
    async fn iterator_all(&self) -> Result<ConceptCursor>;

    /// Advance a cursor, locating the next concept. `None` at exhaustion.
    async fn next_context(&self, cursor: &mut ConceptCursor) -> Result<Option<ConceptHandle>> {
        let Some(code) = cursor.next_code() else {
            return Ok(None);
        };
        match self.locate(&code).await? {
            Located::Found(handle) => Ok(Some(handle)),
            Located::NotFound { message } => Err(Error::Internal(format!(
                "cursor produced unknown code '{}': {}",
                code, message
            ))),
        }
    }

    /// Can this provider execute `(property, op, value)`?
    fn does_filter(&self, _property: &str, _op: FilterOperator, _value: &str) -> bool {
        false
    }

    /// Materialize a filter. Must fail with "not supported" for inputs
    /// `does_filter` rejects.
    async fn prepare_filter(
        &self,
        property: &str,
        op: FilterOperator,
        value: &str,
    ) -> Result<ConceptFilter> {
        Err(Error::NotSupported(format!(
            "The filter ({} {} {}) is not supported for {}",
            property,
            op,
            value,
            self.system()
        )))
    }

    /// Membership + handle for a code against a filter.
    async fn filter_locate(&self, filter: &ConceptFilter, code: &str) -> Result<Located> {
        match filter.contains(code) {
            Some(true) => self.locate(code).await,
            Some(false) => Ok(Located::not_found(format!(
                "Code '{}' is not in the filtered set",
                code
            ))),
            None => {
                // open filter: locate then ask the provider
                match self.locate(code).await? {
                    Located::Found(handle) => {
                        if self.filter_check(filter, &handle).await? {
                            Ok(Located::Found(handle))
                        } else {
                            Ok(Located::not_found(format!(
                                "Code '{}' is not in the filtered set",
                                code
                            )))
                        }
                    }
                    not_found => Ok(not_found),
                }
            }
        }
    }

    /// Membership of an already-located concept.
    async fn filter_check(&self, filter: &ConceptFilter, context: &ConceptHandle) -> Result<bool> {
        match filter.contains(context.code()) {
            Some(result) => Ok(result),
            None => Err(Error::Internal(format!(
                "{} produced an open filter without a filter_check implementation",
                self.system()
            ))),
        }
    }
}

/// Registry of active providers, looked up by system URI and version.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn CodeSystemProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CodeSystemProvider>) {
        self.providers.push(provider);
    }

    /// Resolve a provider for a system, preferring an exact version match,
    /// then an unversioned request's latest registration.
    pub fn resolve(
        &self,
        system: &str,
        version: Option<&str>,
    ) -> Option<Arc<dyn CodeSystemProvider>> {
        let same_system = self.providers.iter().filter(|p| p.system() == system);
        match version {
            Some(version) => same_system
                .filter(|p| p.version() == Some(version))
                .last()
                .cloned(),
            None => self
                .providers
                .iter()
                .filter(|p| p.system() == system)
                .last()
                .cloned(),
        }
    }

    pub fn systems(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.system().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_filters_deduplicate_preserving_order() {
        let filter = ConceptFilter::closed(vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        assert!(filter.is_closed());
        assert_eq!(filter.size(), 2);
        assert_eq!(filter.codes(), &["b", "a"]);
        assert_eq!(filter.contains("a"), Some(true));
        assert_eq!(filter.contains("z"), Some(false));
    }

    #[test]
    fn cursor_is_single_pass_and_stops_at_end() {
        let mut cursor = ConceptCursor::new(vec!["x".into(), "y".into()]);
        assert_eq!(cursor.size(), 2);
        assert_eq!(cursor.next_code().as_deref(), Some("x"));
        assert_eq!(cursor.next_code().as_deref(), Some("y"));
        assert_eq!(cursor.next_code(), None);
        assert_eq!(cursor.next_code(), None);
    }

    #[test]
    fn designation_set_prefers_first_registration_on_ties() {
        let mut set = DesignationSet::new();
        set.add(Some("de"), None, "erste");
        set.add(Some("de"), None, "zweite");
        let languages = Languages::parse_accept_language("de");
        assert_eq!(set.best_value(&languages), Some("erste"));
    }

    #[test]
    fn designation_set_matches_regions() {
        let mut set = DesignationSet::new();
        set.add(Some("de-CH"), None, "Spital");
        set.add(Some("es"), None, "hospital");

        assert!(set.has_any_for(&Languages::parse_accept_language("de-CH")));
        assert!(!set.has_any_for(&Languages::parse_accept_language("de-DE")));
        assert!(set.has_any_for(&Languages::parse_accept_language("es")));
        assert!(!set.has_any_for(&Languages::parse_accept_language("zh-CN")));
    }
}
