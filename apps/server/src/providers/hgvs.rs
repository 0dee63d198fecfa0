//! HGVS provider.
//!
//! Variant nomenclature is validated by a remote service; a code is a
//! concept exactly when the validator accepts it. Transport failures are
//! kept distinct from validation failures and are never cached as one. No
//! hierarchy, no iteration, no filters; subsumption is not meaningful.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptHandle, DesignationSet, Located,
    SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_languages::Languages;
use argentum_models::CodeSystemContentMode;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const TAG: &str = "hgvs";
pub const SYSTEM: &str = "http://varnomen.hgvs.org";

struct HgvsConceptData;

#[derive(Debug, Deserialize)]
struct ValidatorResponse {
    valid: bool,
    #[serde(default)]
    message: Option<String>,
}

pub struct HgvsProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HgvsProvider {
    /// `timeout` must stay below the operation time budget so a hung
    /// validator surfaces as a transport diagnostic, not a budget failure.
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HGVS client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl CodeSystemProvider for HgvsProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn description(&self) -> String {
        "HGVS variant nomenclature".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        CodeSystemContentMode::NotPresent
    }

    async fn has_any_displays(&self, _languages: &Languages) -> Result<bool> {
        Ok(false)
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("variant", code)])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HGVS validator unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "HGVS validator returned {}",
                response.status()
            )));
        }

        let verdict: ValidatorResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("HGVS validator response unreadable: {}", e)))?;

        if verdict.valid {
            Ok(Located::Found(ConceptHandle::new(
                TAG,
                code,
                Arc::new(HgvsConceptData),
            )))
        } else {
            Ok(Located::not_found(verdict.message.unwrap_or_else(|| {
                format!("'{}' is not a valid HGVS expression", code)
            })))
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        let _: &HgvsConceptData = downcast_handle(context, TAG)?;
        Ok(None)
    }

    async fn designations(
        &self,
        context: &ConceptHandle,
        _out: &mut DesignationSet,
    ) -> Result<()> {
        let _: &HgvsConceptData = downcast_handle(context, TAG)?;
        Ok(())
    }

    async fn subsumes_test(&self, _a: &str, _b: &str) -> Result<SubsumptionOutcome> {
        Err(Error::NotSupported(
            "Subsumption is not supported for HGVS".to_string(),
        ))
    }

    async fn iterator(&self, _context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "HGVS expressions cannot be enumerated".to_string(),
        ))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "HGVS expressions cannot be enumerated".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(endpoint: &str) -> HgvsProvider {
        HgvsProvider::new(endpoint.to_string(), Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn unreachable_validator_is_a_transport_error_not_a_rejection() {
        // nothing listens on this port
        let provider = provider("http://127.0.0.1:1/validate");
        let err = provider.locate("NM_000059.4:c.1114A>C").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn subsumption_is_not_supported() {
        let provider = provider("http://127.0.0.1:1/validate");
        let err = provider
            .subsumes_test("NM_000059.4:c.1114A>C", "NM_000059.4:c.1115A>C")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn empty_code_short_circuits_without_touching_the_network() {
        let provider = provider("http://127.0.0.1:1/validate");
        assert_eq!(provider.locate("").await.unwrap().message(), Some("Empty code"));
    }

    #[tokio::test]
    async fn iteration_and_filters_are_refused() {
        let provider = provider("http://127.0.0.1:1/validate");
        assert!(matches!(
            provider.iterator_all().await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(!provider.does_filter(
            "type",
            argentum_models::FilterOperator::Equal,
            "substitution"
        ));
    }
}
