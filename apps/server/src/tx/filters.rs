//! Filter preparation and execution.
//!
//! A [`PrepContext`] collects the filter clauses of one compose include (or
//! exclude) against one provider. `filter` validates and appends; `execute`
//! materializes every pending filter; composition within the clause is
//! conjunctive. Iteration picks the smallest closed filter as the driver and
//! checks candidates against the rest, which keeps membership and iteration
//! consistent by construction.

use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::providers::{CodeSystemProvider, ConceptFilter, ConceptHandle, Located};
use argentum_models::FilterOperator;
use std::sync::Arc;

pub struct PrepContext {
    provider: Arc<dyn CodeSystemProvider>,
    pending: Vec<(String, FilterOperator, String)>,
    executed: Vec<ConceptFilter>,
}

impl PrepContext {
    pub fn new(provider: Arc<dyn CodeSystemProvider>) -> Self {
        Self {
            provider,
            pending: Vec::new(),
            executed: Vec::new(),
        }
    }

    /// Append a filter clause. Unsupported combinations throw immediately,
    /// before any execution work happens.
    pub fn filter(&mut self, property: &str, op: FilterOperator, value: &str) -> Result<()> {
        if !self.provider.does_filter(property, op, value) {
            return Err(Error::NotSupported(format!(
                "The filter ({} {} {}) is not supported for {}",
                property,
                op,
                value,
                self.provider.system()
            )));
        }
        self.pending
            .push((property.to_string(), op, value.to_string()));
        Ok(())
    }

    /// Materialize every pending filter into a resolved result set.
    pub async fn execute(&mut self, context: &OperationContext) -> Result<()> {
        for (property, op, value) in std::mem::take(&mut self.pending) {
            context.dead_check("filter execution")?;
            let filter = self.provider.prepare_filter(&property, op, &value).await?;
            context.log(format!(
                "filter ({} {} {}) -> {} ({})",
                property,
                op,
                value,
                if filter.is_closed() { "closed" } else { "open" },
                filter.size()
            ));
            self.executed.push(filter);
        }
        Ok(())
    }

    pub fn filters(&self) -> &[ConceptFilter] {
        &self.executed
    }

    pub fn is_empty(&self) -> bool {
        self.executed.is_empty() && self.pending.is_empty()
    }

    /// True when any filter in scope is open.
    pub fn filters_not_closed(&self) -> bool {
        self.executed.iter().any(|f| !f.is_closed())
    }

    /// Locate a code against the conjunction of all executed filters.
    pub async fn locate(&self, code: &str) -> Result<Located> {
        let mut located: Option<Located> = None;
        for filter in &self.executed {
            match self.provider.filter_locate(filter, code).await? {
                Located::Found(handle) => located = Some(Located::Found(handle)),
                not_found => return Ok(not_found),
            }
        }
        match located {
            Some(located) => Ok(located),
            None => self.provider.locate(code).await,
        }
    }

    /// Membership of an already-located concept in every executed filter.
    pub async fn check(&self, handle: &ConceptHandle) -> Result<bool> {
        for filter in &self.executed {
            if !self.provider.filter_check(filter, handle).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Codes satisfying the whole conjunction, driven by the smallest closed
    /// filter. `None` when no closed filter can drive the iteration.
    pub async fn iterate(&self, context: &OperationContext) -> Result<Option<Vec<String>>> {
        let driver = self
            .executed
            .iter()
            .filter(|f| f.is_closed())
            .min_by_key(|f| f.size());
        let Some(driver) = driver else {
            return Ok(None);
        };

        let mut result = Vec::new();
        for (index, code) in driver.codes().iter().enumerate() {
            if index % 256 == 0 {
                context.dead_check("filter iteration")?;
            }
            let mut keep = true;
            for filter in &self.executed {
                if std::ptr::eq(filter, driver) {
                    continue;
                }
                match filter.contains(code) {
                    Some(member) => keep = member,
                    None => {
                        // open filter: needs the located concept
                        match self.provider.locate(code).await? {
                            Located::Found(handle) => {
                                keep = self.provider.filter_check(filter, &handle).await?;
                            }
                            Located::NotFound { .. } => keep = false,
                        }
                    }
                }
                if !keep {
                    break;
                }
            }
            if keep {
                result.push(code.clone());
            }
        }
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::{ExpansionCache, ResourceCache};
    use crate::providers::fhir::FhirCodeSystemProvider;
    use argentum_languages::Languages;
    use argentum_models::CodeSystem;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> OperationContext {
        OperationContext::new(
            "filters-test",
            Languages::default(),
            None,
            Arc::new(ResourceCache::new()),
            Arc::new(ExpansionCache::new(4, Duration::from_millis(0), 8)),
        )
    }

    fn provider() -> Arc<dyn CodeSystemProvider> {
        let resource: CodeSystem = serde_json::from_value(json!({
            "resourceType": "CodeSystem",
            "url": "http://example.org/cs",
            "status": "active",
            "content": "complete",
            "concept": [
                { "code": "a", "concept": [
                    { "code": "a1", "property": [ { "code": "color", "valueCode": "red" } ] },
                    { "code": "a2", "property": [ { "code": "color", "valueCode": "blue" } ] }
                ] },
                { "code": "b", "property": [ { "code": "color", "valueCode": "red" } ] }
            ]
        }))
        .unwrap();
        Arc::new(FhirCodeSystemProvider::new(resource, Vec::new()).unwrap())
    }

    #[tokio::test]
    async fn conjunction_of_filters_intersects() {
        let ctx = context();
        let mut prep = PrepContext::new(provider());
        prep.filter("concept", FilterOperator::IsA, "a").unwrap();
        prep.filter("color", FilterOperator::Equal, "red").unwrap();
        prep.execute(&ctx).await.unwrap();

        assert!(!prep.filters_not_closed());
        let codes = prep.iterate(&ctx).await.unwrap().unwrap();
        assert_eq!(codes, vec!["a1"]);

        // membership agrees with iteration
        let handle = provider().locate("a1").await.unwrap().context().unwrap();
        assert!(prep.check(&handle).await.unwrap());
        let outside = provider().locate("b").await.unwrap().context().unwrap();
        assert!(!prep.check(&outside).await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_filter_fails_at_append_time() {
        let mut prep = PrepContext::new(provider());
        let err = prep
            .filter("color", FilterOperator::Generalizes, "red")
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn locate_respects_every_filter() {
        let ctx = context();
        let mut prep = PrepContext::new(provider());
        prep.filter("color", FilterOperator::Equal, "red").unwrap();
        prep.execute(&ctx).await.unwrap();

        assert!(prep.locate("a1").await.unwrap().context().is_some());
        let rejected = prep.locate("a2").await.unwrap();
        assert!(rejected.message().unwrap().contains("not in the filtered set"));
    }
}
