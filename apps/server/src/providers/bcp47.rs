//! BCP-47 language-tag provider.
//!
//! A structural validator: any well-formed tag is a concept. Designation
//! generation composes the language name with region- and script-qualified
//! variants from the subtag registry slice. The tag space is unbounded, so
//! iteration is refused and the exists filters are open.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptFilter, ConceptHandle,
    DesignationSet, Located, SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_languages::{language_name, region_name, script_name, LanguageTag, Languages};
use argentum_models::{CodeSystemContentMode, FilterOperator};
use async_trait::async_trait;
use std::sync::Arc;

pub const TAG: &str = "bcp47";
pub const SYSTEM: &str = "urn:ietf:bcp:47";

struct Bcp47ConceptData {
    tag: LanguageTag,
}

/// Open filter: `language|script|region exists true/false`.
struct ExistsFilterData {
    subtag: Subtag,
    wanted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtag {
    Language,
    Script,
    Region,
}

#[derive(Default)]
pub struct Bcp47Provider;

impl Bcp47Provider {
    pub fn new() -> Self {
        Self
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a Bcp47ConceptData> {
        downcast_handle(context, TAG)
    }
}

#[async_trait]
impl CodeSystemProvider for Bcp47Provider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn description(&self) -> String {
        "IETF language tags (BCP 47)".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        CodeSystemContentMode::Complete
    }

    async fn has_any_displays(&self, languages: &Languages) -> Result<bool> {
        // subtag names come from the English registry slice
        Ok(languages.accepts_str("en"))
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        match LanguageTag::parse(code) {
            Ok(tag) if !tag.is_wildcard() => Ok(Located::Found(ConceptHandle::new(
                TAG,
                code,
                Arc::new(Bcp47ConceptData { tag }),
            ))),
            Ok(_) => Ok(Located::not_found(
                "'*' is a language range, not a language tag".to_string(),
            )),
            Err(e) => Ok(Located::not_found(format!(
                "'{}' is not a well-formed language tag: {}",
                code, e
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        let data = self.data(context)?;
        let mut set = DesignationSet::new();
        self.designations(context, &mut set).await?;
        Ok(set
            .items()
            .first()
            .map(|d| d.value.clone())
            .or_else(|| Some(data.tag.to_string())))
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        let tag = &self.data(context)?.tag;
        let Some(language) = language_name(&tag.language) else {
            return Ok(());
        };

        match (
            tag.region.as_deref().and_then(region_name),
            tag.script.as_deref().and_then(script_name),
        ) {
            (Some(region), Some(script)) => {
                out.add(Some("en"), None, format!("{} ({}, {})", language, script, region));
            }
            (Some(region), None) => {
                out.add(Some("en"), None, format!("{} ({})", language, region));
            }
            (None, Some(script)) => {
                out.add(Some("en"), None, format!("{} ({})", language, script));
            }
            (None, None) => {}
        }
        out.add(Some("en"), None, language);
        Ok(())
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.locate(code).await?.context().is_none() {
                return Err(Error::NotFound(format!(
                    "'{}' is not a well-formed language tag",
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
            "language tags cannot be enumerated".to_string(),
        ))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "language tags cannot be enumerated".to_string(),
        ))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, value: &str) -> bool {
        matches!(property, "language" | "script" | "region")
            && op == FilterOperator::Exists
            && (value == "true" || value == "false")
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
        let subtag = match property {
            "language" => Subtag::Language,
            "script" => Subtag::Script,
            "region" => Subtag::Region,
            _ => unreachable!("does_filter gated"),
        };
        Ok(ConceptFilter::open(
            TAG,
            Arc::new(ExistsFilterData {
                subtag,
                wanted: value == "true",
            }),
        ))
    }

    async fn filter_check(&self, filter: &ConceptFilter, context: &ConceptHandle) -> Result<bool> {
        match filter {
            ConceptFilter::Closed { members, .. } => Ok(members.contains(context.code())),
            ConceptFilter::Open { data, .. } => {
                let Some(filter_data) = data.downcast_ref::<ExistsFilterData>() else {
                    return Err(Error::Internal(
                        "foreign open filter passed to the BCP-47 provider".to_string(),
                    ));
                };
                let tag = &self.data(context)?.tag;
                let present = match filter_data.subtag {
                    Subtag::Language => !tag.language.is_empty(),
                    Subtag::Script => tag.script.is_some(),
                    Subtag::Region => tag.region.is_some(),
                };
                Ok(present == filter_data.wanted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn well_formed_tags_locate() {
        let provider = Bcp47Provider::new();
        assert!(provider.locate("de-CH").await.unwrap().context().is_some());
        assert!(provider.locate("zh-Hans-CN").await.unwrap().context().is_some());

        let bad = provider.locate("not a tag!").await.unwrap();
        assert!(bad.message().unwrap().contains("not a well-formed language tag"));
        assert_eq!(provider.locate("").await.unwrap().message(), Some("Empty code"));
    }

    #[tokio::test]
    async fn designations_qualify_by_region_and_script() {
        let provider = Bcp47Provider::new();

        let handle = provider.locate("de-CH").await.unwrap().context().unwrap();
        let mut set = DesignationSet::new();
        provider.designations(&handle, &mut set).await.unwrap();
        let values: Vec<&str> = set.items().iter().map(|d| d.value.as_str()).collect();
        assert_eq!(values, vec!["German (Switzerland)", "German"]);

        let handle = provider.locate("zh-Hans-CN").await.unwrap().context().unwrap();
        let mut set = DesignationSet::new();
        provider.designations(&handle, &mut set).await.unwrap();
        assert_eq!(set.items()[0].value, "Chinese (Simplified, China)");
    }

    #[tokio::test]
    async fn exists_filters_are_open() {
        let provider = Bcp47Provider::new();
        let filter = provider
            .prepare_filter("region", FilterOperator::Exists, "true")
            .await
            .unwrap();
        assert!(!filter.is_closed());

        let with_region = provider.locate("de-CH").await.unwrap().context().unwrap();
        let without_region = provider.locate("de").await.unwrap().context().unwrap();
        assert!(provider.filter_check(&filter, &with_region).await.unwrap());
        assert!(!provider.filter_check(&filter, &without_region).await.unwrap());

        let err = provider
            .prepare_filter("region", FilterOperator::Equal, "CH")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn iteration_is_refused() {
        let provider = Bcp47Provider::new();
        assert!(matches!(
            provider.iterator_all().await.unwrap_err(),
            Error::NotSupported(_)
        ));
    }
}
