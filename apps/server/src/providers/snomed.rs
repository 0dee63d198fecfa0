//! SNOMED CT provider.
//!
//! Backed by the importer-built SNOMED cache: concepts, descriptions, the
//! is-a transitive closure, reference-set membership, defining relationships
//! and the concept-model attribute tables. The ECL engine runs against this
//! provider through its [`argentum_ecl::SnomedStore`] implementation.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptFilter, ConceptHandle,
    ConceptProperty, DesignationSet, Located, SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_ecl::{self as ecl, EvalOptions, SnomedStore};
use argentum_languages::Languages;
use argentum_models::{CodeSystemContentMode, FilterOperator};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

pub const TAG: &str = "sct";
pub const SYSTEM: &str = "http://snomed.info/sct";

/// SNOMED CT root concept
const ROOT: &str = "138875005";
/// |Is a (attribute)|
const IS_A: &str = "116680003";
/// |Synonym| description type
const SYNONYM: &str = "900000000000013009";

struct SnomedConceptData {
    active: bool,
    module: String,
}

pub struct SnomedProvider {
    pool: SqlitePool,
    version: String,
    /// ECL wildcard cap from server config
    wildcard_cap: usize,
}

impl SnomedProvider {
    /// Open the provider over a prebuilt cache, reading the edition version
    /// from its metadata table.
    pub async fn open(pool: SqlitePool, wildcard_cap: usize) -> Result<Self> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_info WHERE key = 'version'")
                .fetch_optional(&pool)
                .await?;
        Ok(Self {
            pool,
            version: version
                .unwrap_or_else(|| "http://snomed.info/sct/900000000000207008".to_string()),
            wildcard_cap,
        })
    }

    async fn fetch_concept(&self, code: &str) -> Result<Option<(bool, String)>> {
        let row = sqlx::query("SELECT active, module_id FROM concepts WHERE id = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>("active") != 0, r.get("module_id"))))
    }

    /// Preferred synonym, falling back to any active description.
    async fn preferred_term(&self, code: &str) -> Result<Option<String>> {
        let preferred: Option<String> = sqlx::query_scalar(
            "SELECT term FROM descriptions
             WHERE concept_id = ? AND active = 1 AND type_id = ? AND preferred = 1
             ORDER BY lang, term LIMIT 1",
        )
        .bind(code)
        .bind(SYNONYM)
        .fetch_optional(&self.pool)
        .await?;
        if preferred.is_some() {
            return Ok(preferred);
        }
        Ok(sqlx::query_scalar(
            "SELECT term FROM descriptions
             WHERE concept_id = ? AND active = 1
             ORDER BY preferred DESC, lang, term LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a SnomedConceptData> {
        downcast_handle(context, TAG)
    }

    fn ecl_options(&self) -> EvalOptions {
        EvalOptions {
            wildcard_cap: self.wildcard_cap,
        }
    }

    async fn refset_member_codes(&self, refset: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT concept_id FROM refset_members
             WHERE refset_id = ? AND active = 1 ORDER BY concept_id",
        )
        .bind(refset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn self_and_descendant_codes(&self, code: &str) -> Result<Vec<String>> {
        let mut codes = vec![code.to_string()];
        codes.extend(
            sqlx::query_scalar::<_, String>(
                "SELECT descendant_id FROM closure WHERE ancestor_id = ? ORDER BY descendant_id",
            )
            .bind(code)
            .fetch_all(&self.pool)
            .await?,
        );
        Ok(codes)
    }
}

#[async_trait]
impl CodeSystemProvider for SnomedProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "SNOMED CT".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    async fn total_count(&self) -> Result<Option<u64>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concepts")
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count as u64))
    }

    fn has_parents(&self) -> bool {
        true
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        CodeSystemContentMode::Complete
    }

    async fn has_any_displays(&self, languages: &Languages) -> Result<bool> {
        let langs: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT lang FROM descriptions WHERE active = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(langs.iter().any(|lang| languages.accepts_str(lang)))
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        // expression-shaped codes (compositional grammar) are not resolved here
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Located::not_found(format!(
                "Code '{}' is not a valid SNOMED CT concept id",
                code
            )));
        }
        match self.fetch_concept(code).await? {
            Some((active, module)) => Ok(Located::Found(ConceptHandle::new(
                TAG,
                code,
                Arc::new(SnomedConceptData { active, module }),
            ))),
            None => Ok(Located::not_found(format!(
                "Unknown SNOMED CT concept '{}'",
                code
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        self.data(context)?;
        self.preferred_term(context.code()).await
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        self.data(context)?;
        let rows = sqlx::query(
            "SELECT term, lang, type_id FROM descriptions
             WHERE concept_id = ? AND active = 1 ORDER BY preferred DESC, type_id, lang, term",
        )
        .bind(context.code())
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let term: String = row.get("term");
            let lang: String = row.get("lang");
            let type_id: String = row.get("type_id");
            out.add(
                Some(&lang),
                Some(argentum_models::Coding::new(SYSTEM, type_id)),
                term,
            );
        }
        Ok(())
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(!self.data(context)?.active)
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        let mut properties = vec![
            ConceptProperty::code_value("moduleId", data.module.clone()),
            ConceptProperty::boolean("inactive", !data.active),
        ];
        let rows = sqlx::query(
            "SELECT type_id, target_id FROM relationships
             WHERE source_id = ? AND active = 1 ORDER BY type_id, target_id",
        )
        .bind(context.code())
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let type_id: String = row.get("type_id");
            let target: String = row.get("target_id");
            let name = if type_id == IS_A { "parent".to_string() } else { type_id };
            properties.push(ConceptProperty::code_value(name, target));
        }
        Ok(properties)
    }

    async fn parent(&self, code: &str) -> Result<Option<String>> {
        if self.fetch_concept(code).await?.is_none() {
            return Err(Error::NotFound(format!(
                "Unknown SNOMED CT concept '{}'",
                code
            )));
        }
        Ok(sqlx::query_scalar(
            "SELECT target_id FROM relationships
             WHERE source_id = ? AND type_id = ? AND active = 1
             ORDER BY target_id LIMIT 1",
        )
        .bind(code)
        .bind(IS_A)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn locate_is_a(&self, code: &str, parent: &str, disallow_self: bool) -> Result<Located> {
        let located = self.locate(code).await?;
        let Located::Found(handle) = located else {
            return Ok(located);
        };
        if code == parent {
            return if disallow_self {
                Ok(Located::not_found(format!(
                    "Concept '{}' is not a proper descendant of '{}'",
                    code, parent
                )))
            } else {
                Ok(Located::Found(handle))
            };
        }
        if SnomedStore::is_descendant_of(self, code, parent)
            .await
            .map_err(Error::from)?
        {
            Ok(Located::Found(handle))
        } else {
            Ok(Located::not_found(format!(
                "Concept '{}' is not a descendant of '{}'",
                code, parent
            )))
        }
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.fetch_concept(code).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "Unknown SNOMED CT concept '{}'",
                    code
                )));
            }
        }
        if a == b {
            return Ok(SubsumptionOutcome::Equivalent);
        }
        if SnomedStore::is_descendant_of(self, b, a).await.map_err(Error::from)? {
            return Ok(SubsumptionOutcome::Subsumes);
        }
        if SnomedStore::is_descendant_of(self, a, b).await.map_err(Error::from)? {
            return Ok(SubsumptionOutcome::SubsumedBy);
        }
        Ok(SubsumptionOutcome::NotSubsumed)
    }

    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        let codes = match context {
            None => vec![ROOT.to_string()],
            Some(handle) => {
                self.data(handle)?;
                sqlx::query_scalar::<_, String>(
                    "SELECT source_id FROM relationships
                     WHERE target_id = ? AND type_id = ? AND active = 1
                     ORDER BY source_id",
                )
                .bind(handle.code())
                .bind(IS_A)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(ConceptCursor::new(codes))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        let codes = sqlx::query_scalar::<_, String>("SELECT id FROM concepts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ConceptCursor::new(codes))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        matches!(
            (property, op),
            ("concept", FilterOperator::IsA)
                | ("concept", FilterOperator::DescendentOf)
                | ("concept", FilterOperator::In)
                | ("concept", FilterOperator::Equal)
                | ("expression", FilterOperator::Equal)
                | ("constraint", FilterOperator::Equal)
        )
    }

    async fn prepare_filter(
        &self,
        property: &str,
        op: FilterOperator,
        value: &str,
    ) -> Result<ConceptFilter> {
        match (property, op) {
            ("concept", FilterOperator::IsA) => Ok(ConceptFilter::closed(
                self.self_and_descendant_codes(value).await?,
            )),
            ("concept", FilterOperator::DescendentOf) => {
                let mut codes = self.self_and_descendant_codes(value).await?;
                codes.retain(|c| c != value);
                Ok(ConceptFilter::closed(codes))
            }
            ("concept", FilterOperator::In) => {
                // a single SCTID names a reference set; a comma list enumerates codes
                if value.contains(',') {
                    let mut codes = Vec::new();
                    for code in value.split(',').map(str::trim) {
                        if self.fetch_concept(code).await?.is_some() {
                            codes.push(code.to_string());
                        }
                    }
                    Ok(ConceptFilter::closed(codes))
                } else {
                    Ok(ConceptFilter::closed(self.refset_member_codes(value).await?))
                }
            }
            ("concept", FilterOperator::Equal) => {
                let codes = match self.fetch_concept(value).await? {
                    Some(_) => vec![value.to_string()],
                    None => Vec::new(),
                };
                Ok(ConceptFilter::closed(codes))
            }
            ("expression" | "constraint", FilterOperator::Equal) => {
                let ast = ecl::parse(value).map_err(Error::from)?;
                let codes = ecl::evaluate(&ast, self, &self.ecl_options())
                    .await
                    .map_err(Error::from)?;
                Ok(ConceptFilter::closed(codes))
            }
            _ => Err(Error::NotSupported(format!(
                "The filter ({} {} {}) is not supported for {}",
                property, op, value, SYSTEM
            ))),
        }
    }
}

fn store_error(e: sqlx::Error) -> ecl::Error {
    ecl::Error::Store(e.to_string())
}

#[async_trait]
impl SnomedStore for SnomedProvider {
    async fn concept_exists(&self, sctid: &str) -> ecl::Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concepts WHERE id = ?")
            .bind(sctid)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(count > 0)
    }

    async fn children_of(&self, sctid: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT source_id FROM relationships
             WHERE target_id = ? AND type_id = ? AND active = 1 ORDER BY source_id",
        )
        .bind(sctid)
        .bind(IS_A)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn parents_of(&self, sctid: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT target_id FROM relationships
             WHERE source_id = ? AND type_id = ? AND active = 1 ORDER BY target_id",
        )
        .bind(sctid)
        .bind(IS_A)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn descendants_of(&self, sctid: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT descendant_id FROM closure WHERE ancestor_id = ? ORDER BY descendant_id",
        )
        .bind(sctid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn ancestors_of(&self, sctid: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT ancestor_id FROM closure WHERE descendant_id = ? ORDER BY ancestor_id",
        )
        .bind(sctid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn is_descendant_of(&self, descendant: &str, ancestor: &str) -> ecl::Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM closure WHERE ancestor_id = ? AND descendant_id = ?",
        )
        .bind(ancestor)
        .bind(descendant)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(count > 0)
    }

    async fn refset_members(&self, refset: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT concept_id FROM refset_members
             WHERE refset_id = ? AND active = 1 ORDER BY concept_id",
        )
        .bind(refset)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn active_descriptions(&self, sctid: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT term FROM descriptions WHERE concept_id = ? AND active = 1 ORDER BY term",
        )
        .bind(sctid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn relationships_of(&self, sctid: &str) -> ecl::Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT type_id, target_id FROM relationships
             WHERE source_id = ? AND active = 1 AND type_id != ?
             ORDER BY type_id, target_id",
        )
        .bind(sctid)
        .bind(IS_A)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("type_id"), row.get("target_id")))
            .collect())
    }

    async fn concrete_values(&self, sctid: &str, attribute: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT value FROM concrete_values
             WHERE concept_id = ? AND attribute_id = ? ORDER BY value",
        )
        .bind(sctid)
        .bind(attribute)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn attribute_domains(&self, attribute: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT domain_id FROM attribute_domain WHERE attribute_id = ? ORDER BY domain_id",
        )
        .bind(attribute)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn attribute_ranges(&self, attribute: &str) -> ecl::Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT range_id FROM attribute_range WHERE attribute_id = ? ORDER BY range_id",
        )
        .bind(attribute)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn all_concepts(&self, cap: usize) -> ecl::Result<Option<Vec<String>>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM concepts")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        if count as usize > cap {
            return Ok(None);
        }
        sqlx::query_scalar("SELECT id FROM concepts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map(Some)
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an in-memory fixture mirroring the importer schema:
    /// a tiny finding hierarchy with one refset and one finding-site edge.
    async fn fixture() -> SnomedProvider {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE store_info (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE concepts (id TEXT PRIMARY KEY, active INTEGER, module_id TEXT);
             CREATE TABLE descriptions (concept_id TEXT, term TEXT, type_id TEXT,
                 lang TEXT, active INTEGER, preferred INTEGER);
             CREATE TABLE relationships (source_id TEXT, type_id TEXT, target_id TEXT,
                 rel_group INTEGER, active INTEGER);
             CREATE TABLE closure (ancestor_id TEXT, descendant_id TEXT);
             CREATE TABLE refset_members (refset_id TEXT, concept_id TEXT, active INTEGER);
             CREATE TABLE attribute_domain (attribute_id TEXT, domain_id TEXT);
             CREATE TABLE attribute_range (attribute_id TEXT, range_id TEXT);
             CREATE TABLE concrete_values (concept_id TEXT, attribute_id TEXT, value TEXT);",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::raw_sql(
            "INSERT INTO store_info VALUES ('version', 'http://snomed.info/sct/900000000000207008/version/20240301');
             INSERT INTO concepts VALUES
                 ('138875005', 1, 'core'), ('404684003', 1, 'core'),
                 ('22298006', 1, 'core'), ('57054005', 1, 'core'),
                 ('123037004', 1, 'core'), ('80891009', 1, 'core'),
                 ('95281009', 0, 'core'), ('363698007', 1, 'core');
             INSERT INTO descriptions VALUES
                 ('404684003', 'Clinical finding', '900000000000013009', 'en', 1, 1),
                 ('22298006', 'Myocardial infarction', '900000000000013009', 'en', 1, 1),
                 ('22298006', 'Herzinfarkt', '900000000000013009', 'de', 1, 0),
                 ('57054005', 'Acute myocardial infarction', '900000000000013009', 'en', 1, 1);
             INSERT INTO relationships VALUES
                 ('404684003', '116680003', '138875005', 0, 1),
                 ('123037004', '116680003', '138875005', 0, 1),
                 ('22298006', '116680003', '404684003', 0, 1),
                 ('57054005', '116680003', '22298006', 0, 1),
                 ('80891009', '116680003', '123037004', 0, 1),
                 ('22298006', '363698007', '80891009', 1, 1),
                 ('57054005', '363698007', '80891009', 1, 1);
             INSERT INTO closure VALUES
                 ('138875005', '404684003'), ('138875005', '123037004'),
                 ('138875005', '22298006'), ('138875005', '57054005'),
                 ('138875005', '80891009'),
                 ('404684003', '22298006'), ('404684003', '57054005'),
                 ('22298006', '57054005'),
                 ('123037004', '80891009');
             INSERT INTO refset_members VALUES ('700043003', '22298006', 1);",
        )
        .execute(&pool)
        .await
        .unwrap();

        SnomedProvider::open(pool, 1000).await.unwrap()
    }

    #[tokio::test]
    async fn locate_and_display() {
        let provider = fixture().await;
        assert!(provider.version().unwrap().contains("20240301"));

        let handle = provider.locate("22298006").await.unwrap().context().unwrap();
        assert_eq!(
            provider.display(&handle).await.unwrap().as_deref(),
            Some("Myocardial infarction")
        );

        let missing = provider.locate("999999999").await.unwrap();
        assert!(missing.message().unwrap().contains("Unknown SNOMED CT concept"));
        assert_eq!(provider.locate("").await.unwrap().message(), Some("Empty code"));
        let malformed = provider.locate("abc:def").await.unwrap();
        assert!(malformed.message().is_some());
    }

    #[tokio::test]
    async fn inactive_concepts_are_flagged() {
        let provider = fixture().await;
        let handle = provider.locate("95281009").await.unwrap().context().unwrap();
        assert!(provider.is_inactive(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn subsumption_uses_the_closure() {
        let provider = fixture().await;
        assert_eq!(
            provider.subsumes_test("404684003", "57054005").await.unwrap(),
            SubsumptionOutcome::Subsumes
        );
        assert_eq!(
            provider.subsumes_test("57054005", "404684003").await.unwrap(),
            SubsumptionOutcome::SubsumedBy
        );
        assert_eq!(
            provider.subsumes_test("22298006", "80891009").await.unwrap(),
            SubsumptionOutcome::NotSubsumed
        );
        assert!(provider.subsumes_test("22298006", "1").await.is_err());
    }

    #[tokio::test]
    async fn hierarchy_filters() {
        let provider = fixture().await;

        let filter = provider
            .prepare_filter("concept", FilterOperator::IsA, "404684003")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["404684003", "22298006", "57054005"]);

        let filter = provider
            .prepare_filter("concept", FilterOperator::In, "700043003")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["22298006"]);
    }

    #[tokio::test]
    async fn ecl_expression_filter() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter(
                "expression",
                FilterOperator::Equal,
                "<< 404684003 : 363698007 = << 123037004",
            )
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["22298006", "57054005"]);

        let err = provider
            .prepare_filter("expression", FilterOperator::Equal, "<<")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Expression(_)));
    }

    #[tokio::test]
    async fn iteration_roots_and_children() {
        let provider = fixture().await;
        let mut roots = provider.iterator(None).await.unwrap();
        assert_eq!(roots.next_code().as_deref(), Some(ROOT));

        let finding = provider.locate("404684003").await.unwrap().context().unwrap();
        let children = provider.iterator(Some(&finding)).await.unwrap();
        assert_eq!(children.size(), 1);
    }

    #[tokio::test]
    async fn designations_include_language_variants() {
        let provider = fixture().await;
        let handle = provider.locate("22298006").await.unwrap().context().unwrap();
        let mut set = DesignationSet::new();
        provider.designations(&handle, &mut set).await.unwrap();
        assert!(set
            .items()
            .iter()
            .any(|d| d.language.as_deref() == Some("de") && d.value == "Herzinfarkt"));
        assert!(provider
            .has_any_displays(&Languages::parse_accept_language("de"))
            .await
            .unwrap());
        assert!(!provider
            .has_any_displays(&Languages::parse_accept_language("fr"))
            .await
            .unwrap());
    }
}
