//! UCUM provider.
//!
//! Expression-validator backed: a code is valid iff it parses against the
//! embedded essence table. The code space is unbounded (any product of
//! units is a code), so filters are open and iteration is refused. The
//! `canonical` filter matches units by dimension: `canonical = g` selects
//! every mass unit.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptFilter, ConceptHandle,
    ConceptProperty, DesignationSet, Located, SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_languages::Languages;
use argentum_models::{CodeSystemContentMode, FilterOperator};
use argentum_ucum as ucum;
use async_trait::async_trait;
use std::sync::Arc;

pub const TAG: &str = "ucum";
pub const SYSTEM: &str = "http://unitsofmeasure.org";

struct UcumConceptData {
    analysis: ucum::Analysis,
}

/// Open filter matching units of one dimension.
struct CanonicalFilterData {
    dim: ucum::Dimension,
}

#[derive(Default)]
pub struct UcumProvider;

impl UcumProvider {
    pub fn new() -> Self {
        Self
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a UcumConceptData> {
        downcast_handle(context, TAG)
    }

    /// Are two unit expressions comparable (same dimension)?
    pub fn comparable(&self, a: &str, b: &str) -> Result<bool> {
        ucum::comparable(a, b).map_err(|e| Error::Validation(e.to_string()))
    }
}

#[async_trait]
impl CodeSystemProvider for UcumProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some("2.1")
    }

    fn description(&self) -> String {
        "Unified Code for Units of Measure".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        CodeSystemContentMode::Complete
    }

    async fn has_any_displays(&self, languages: &Languages) -> Result<bool> {
        Ok(languages.accepts_str("en"))
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        let expression = match ucum::parse(code) {
            Ok(expression) => expression,
            Err(e) => {
                return Ok(Located::not_found(format!(
                    "'{}' is not a valid UCUM expression: {}",
                    code, e
                )))
            }
        };
        match ucum::analyze(&expression) {
            Ok(analysis) => Ok(Located::Found(ConceptHandle::new(
                TAG,
                code,
                Arc::new(UcumConceptData { analysis }),
            ))),
            Err(e) => Ok(Located::not_found(format!(
                "'{}' is not a valid UCUM expression: {}",
                code, e
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        // units have no narrative display; the code is its own presentation
        self.data(context)?;
        Ok(Some(context.code().to_string()))
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        self.data(context)?;
        out.add(Some("en"), None, context.code().to_string());
        Ok(())
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        Ok(vec![
            ConceptProperty::code_value("canonical", data.analysis.dim.canonical()),
            ConceptProperty::decimal("factor", data.analysis.factor),
        ])
    }

    fn same_concept(&self, a: &str, b: &str) -> bool {
        a == b
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.locate(code).await?.context().is_none() {
                return Err(Error::NotFound(format!(
                    "'{}' is not a valid UCUM expression",
                    code
                )));
            }
        }
        Ok(if a == b {
            SubsumptionOutcome::Equivalent
        } else {
            SubsumptionOutcome::NotSubsumed
        })
    }

    async fn iterator(&self, _context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "UCUM expressions cannot be enumerated".to_string(),
        ))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "UCUM expressions cannot be enumerated".to_string(),
        ))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        matches!((property, op), ("canonical", FilterOperator::Equal))
    }

    async fn prepare_filter(
        &self,
        property: &str,
        op: FilterOperator,
        value: &str,
    ) -> Result<ConceptFilter> {
        if !self.does_filter(property, op, value) {
            return Err(Error::NotSupported(format!(
                "The filter ({} {} {}) is not supported for {}",
                property, op, value, SYSTEM
            )));
        }
        let expression = ucum::parse(value)
            .map_err(|e| Error::Validation(format!("Invalid canonical unit '{}': {}", value, e)))?;
        let analysis = ucum::analyze(&expression)
            .map_err(|e| Error::Validation(format!("Invalid canonical unit '{}': {}", value, e)))?;
        Ok(ConceptFilter::open(
            TAG,
            Arc::new(CanonicalFilterData { dim: analysis.dim }),
        ))
    }

    async fn filter_check(&self, filter: &ConceptFilter, context: &ConceptHandle) -> Result<bool> {
        match filter {
            ConceptFilter::Closed { members, .. } => Ok(members.contains(context.code())),
            ConceptFilter::Open { data, .. } => {
                let Some(filter_data) = data.downcast_ref::<CanonicalFilterData>() else {
                    return Err(Error::Internal(
                        "foreign open filter passed to the UCUM provider".to_string(),
                    ));
                };
                Ok(self.data(context)?.analysis.dim == filter_data.dim)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locate_validates_expressions() {
        let provider = UcumProvider::new();
        assert!(provider.locate("mg/dL").await.unwrap().context().is_some());
        assert!(provider.locate("10*3/uL").await.unwrap().context().is_some());

        let invalid = provider.locate("xyzzy").await.unwrap();
        assert!(invalid.message().unwrap().contains("not a valid UCUM expression"));
        assert_eq!(provider.locate("").await.unwrap().message(), Some("Empty code"));
    }

    #[tokio::test]
    async fn properties_expose_canonical_form() {
        let provider = UcumProvider::new();
        let handle = provider.locate("kN").await.unwrap().context().unwrap();
        let properties = provider.properties(&handle).await.unwrap();
        assert!(properties
            .iter()
            .any(|p| p.code == "canonical" && p.value["valueCode"] == "m.s-2.g"));
    }

    #[tokio::test]
    async fn canonical_filter_matches_by_dimension() {
        let provider = UcumProvider::new();
        let filter = provider
            .prepare_filter("canonical", FilterOperator::Equal, "g")
            .await
            .unwrap();
        assert!(!filter.is_closed());
        assert_eq!(filter.size(), 0);

        let mg = provider.locate("mg").await.unwrap().context().unwrap();
        let pounds = provider.locate("[lb_av]").await.unwrap().context().unwrap();
        let ml = provider.locate("mL").await.unwrap().context().unwrap();
        assert!(provider.filter_check(&filter, &mg).await.unwrap());
        assert!(provider.filter_check(&filter, &pounds).await.unwrap());
        assert!(!provider.filter_check(&filter, &ml).await.unwrap());
    }

    #[tokio::test]
    async fn comparability() {
        let provider = UcumProvider::new();
        assert!(provider.comparable("mg/dL", "g/L").unwrap());
        assert!(!provider.comparable("mg", "s").unwrap());
        assert!(provider.comparable("mm[Hg]", "bar").unwrap());
    }

    #[tokio::test]
    async fn iteration_is_refused() {
        let provider = UcumProvider::new();
        assert!(matches!(
            provider.iterator_all().await.unwrap_err(),
            Error::NotSupported(_)
        ));
    }
}
