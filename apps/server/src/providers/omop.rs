//! OMOP vocabulary provider.
//!
//! SQL-backed over the standard OMOP concept tables. Concepts are addressed
//! by OMOP concept id; domain, vocabulary and concept-class metadata surface
//! as properties, and "Maps to" relationship links power translation into
//! the source vocabularies. The full vocabulary is far too large to
//! enumerate, so iteration is refused and callers must filter.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptFilter, ConceptHandle,
    ConceptProperty, DesignationSet, Located, SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_languages::Languages;
use argentum_models::{CodeSystemContentMode, FilterOperator};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

pub const TAG: &str = "omop";
pub const SYSTEM: &str = "https://fhir-terminology.ohdsi.org";

struct OmopConceptData {
    name: Option<String>,
    domain: String,
    vocabulary: String,
    concept_class: String,
    standard: Option<String>,
    invalid: bool,
}

/// A "Maps to" link into a source vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct OmopMapping {
    pub vocabulary: String,
    pub code: String,
    pub name: Option<String>,
}

pub struct OmopProvider {
    pool: SqlitePool,
    version: String,
}

impl OmopProvider {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_info WHERE key = 'version'")
                .fetch_optional(&pool)
                .await?;
        Ok(Self {
            pool,
            version: version.unwrap_or_else(|| "??".to_string()),
        })
    }

    async fn fetch(&self, concept_id: &str) -> Result<Option<OmopConceptData>> {
        if !concept_id.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT concept_name, domain_id, vocabulary_id, concept_class_id,
                    standard_concept, invalid_reason
             FROM concept WHERE concept_id = ?",
        )
        .bind(concept_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| OmopConceptData {
            name: r.get("concept_name"),
            domain: r.get("domain_id"),
            vocabulary: r.get("vocabulary_id"),
            concept_class: r.get("concept_class_id"),
            standard: r.get("standard_concept"),
            invalid: r.get::<Option<String>, _>("invalid_reason").is_some(),
        }))
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a OmopConceptData> {
        downcast_handle(context, TAG)
    }

    /// "Maps to" targets of a concept, for translation into source
    /// vocabularies.
    pub async fn mappings(&self, concept_id: &str) -> Result<Vec<OmopMapping>> {
        let rows = sqlx::query(
            "SELECT c.vocabulary_id, c.concept_code, c.concept_name
             FROM concept_relationship r
             JOIN concept c ON c.concept_id = r.concept_id_2
             WHERE r.concept_id_1 = ? AND r.relationship_id = 'Maps to'
             ORDER BY c.vocabulary_id, c.concept_code",
        )
        .bind(concept_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| OmopMapping {
                vocabulary: row.get("vocabulary_id"),
                code: row.get("concept_code"),
                name: row.get("concept_name"),
            })
            .collect())
    }

    /// All concept ids of one domain; the building block for domain-derived
    /// ValueSets.
    pub async fn domain_members(&self, domain: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT concept_id FROM concept WHERE domain_id = ? ORDER BY concept_id",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|id| id.to_string()).collect())
    }
}

#[async_trait]
impl CodeSystemProvider for OmopProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "OMOP standardized vocabularies".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    async fn total_count(&self) -> Result<Option<u64>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concept")
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count as u64))
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
        match self.fetch(code).await? {
            Some(data) => Ok(Located::Found(ConceptHandle::new(TAG, code, Arc::new(data)))),
            None => Ok(Located::not_found(format!(
                "Unknown OMOP concept id '{}'",
                code
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(self.data(context)?.name.clone())
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        if let Some(name) = &self.data(context)?.name {
            out.add(Some("en"), None, name.clone());
        }
        Ok(())
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(self.data(context)?.invalid)
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        let mut properties = vec![
            ConceptProperty::code_value("domain", data.domain.clone()),
            ConceptProperty::code_value("vocabulary", data.vocabulary.clone()),
            ConceptProperty::code_value("concept-class", data.concept_class.clone()),
        ];
        if let Some(standard) = &data.standard {
            properties.push(ConceptProperty::code_value("standard-concept", standard.clone()));
        }
        for mapping in self.mappings(context.code()).await? {
            properties.push(ConceptProperty::string(
                "maps-to",
                format!("{}|{}", mapping.vocabulary, mapping.code),
            ));
        }
        Ok(properties)
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.fetch(code).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "Unknown OMOP concept id '{}'",
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
            "OMOP concepts cannot be iterated; apply a domain or vocabulary filter".to_string(),
        ))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        Err(Error::NotSupported(
            "OMOP concepts cannot be iterated; apply a domain or vocabulary filter".to_string(),
        ))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        matches!(
            (property, op),
            ("domain", FilterOperator::Equal | FilterOperator::In)
                | ("vocabulary", FilterOperator::Equal | FilterOperator::In)
                | ("concept-class", FilterOperator::Equal | FilterOperator::In)
                | ("standard-concept", FilterOperator::Equal)
        )
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

        let column = match property {
            "domain" => "domain_id",
            "vocabulary" => "vocabulary_id",
            "concept-class" => "concept_class_id",
            "standard-concept" => "standard_concept",
            _ => unreachable!("does_filter gated"),
        };

        let mut codes = Vec::new();
        for wanted in value.split(',').map(str::trim) {
            let query = format!(
                "SELECT concept_id FROM concept WHERE {} = ? ORDER BY concept_id",
                column
            );
            let ids: Vec<i64> = sqlx::query_scalar(&query)
                .bind(wanted)
                .fetch_all(&self.pool)
                .await?;
            codes.extend(ids.into_iter().map(|id| id.to_string()));
        }
        Ok(ConceptFilter::closed(codes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> OmopProvider {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE store_info (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE concept (concept_id INTEGER PRIMARY KEY, concept_name TEXT,
                 domain_id TEXT, vocabulary_id TEXT, concept_class_id TEXT,
                 standard_concept TEXT, concept_code TEXT, invalid_reason TEXT);
             CREATE TABLE concept_relationship (concept_id_1 INTEGER,
                 concept_id_2 INTEGER, relationship_id TEXT);",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::raw_sql(
            "INSERT INTO store_info VALUES ('version', 'v5.0 31-AUG-23');
             INSERT INTO concept VALUES
                 (312327, 'Acute myocardial infarction', 'Condition', 'SNOMED',
                  'Clinical Finding', 'S', '57054005', NULL),
                 (1112807, 'aspirin', 'Drug', 'RxNorm', 'Ingredient', 'S', '1191', NULL),
                 (44923712, 'Retired concept', 'Condition', 'SNOMED',
                  'Clinical Finding', NULL, '0', 'D');
             INSERT INTO concept_relationship VALUES
                 (312327, 312327, 'Maps to'),
                 (1112807, 1112807, 'Maps to');",
        )
        .execute(&pool)
        .await
        .unwrap();

        OmopProvider::open(pool).await.unwrap()
    }

    #[tokio::test]
    async fn locate_exposes_vocabulary_metadata() {
        let provider = fixture().await;
        let handle = provider.locate("312327").await.unwrap().context().unwrap();
        let properties = provider.properties(&handle).await.unwrap();
        assert!(properties.contains(&ConceptProperty::code_value("domain", "Condition")));
        assert!(properties.contains(&ConceptProperty::code_value("vocabulary", "SNOMED")));
        assert!(properties
            .iter()
            .any(|p| p.code == "maps-to" && p.value["valueString"] == "SNOMED|57054005"));

        assert!(provider.locate("1").await.unwrap().message().is_some());
        assert!(provider.locate("xyz").await.unwrap().message().is_some());
    }

    #[tokio::test]
    async fn invalid_concepts_are_inactive() {
        let provider = fixture().await;
        let handle = provider.locate("44923712").await.unwrap().context().unwrap();
        assert!(provider.is_inactive(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn domain_filter_and_domain_members() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter("domain", FilterOperator::Equal, "Condition")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["312327", "44923712"]);

        assert_eq!(
            provider.domain_members("Drug").await.unwrap(),
            vec!["1112807"]
        );
    }

    #[tokio::test]
    async fn iteration_is_refused() {
        let provider = fixture().await;
        assert!(matches!(
            provider.iterator_all().await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(matches!(
            provider.iterator(None).await.unwrap_err(),
            Error::NotSupported(_)
        ));
    }

    #[tokio::test]
    async fn translation_mappings() {
        let provider = fixture().await;
        let mappings = provider.mappings("1112807").await.unwrap();
        assert_eq!(
            mappings,
            vec![OmopMapping {
                vocabulary: "RxNorm".to_string(),
                code: "1191".to_string(),
                name: Some("aspirin".to_string()),
            }]
        );
    }
}
