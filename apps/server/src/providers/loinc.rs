//! LOINC provider.
//!
//! SQL-backed. LOINC is flat at the code level but carries a multiaxial
//! hierarchy of LP parts, answer lists (LL codes), part-linked relationship
//! properties and a handful of scalar properties (CLASSTYPE is numeric).

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

pub const TAG: &str = "loinc";
pub const SYSTEM: &str = "http://loinc.org";

/// Scalar columns addressable as filter properties
const SCALAR_PROPERTIES: &[&str] = &["STATUS", "CLASS", "CLASSTYPE", "ORDER_OBS", "copyright"];

struct LoincConceptData {
    display: Option<String>,
    status: Option<String>,
}

pub struct LoincProvider {
    pool: SqlitePool,
    version: String,
}

impl LoincProvider {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_info WHERE key = 'version'")
                .fetch_optional(&pool)
                .await?;
        Ok(Self {
            pool,
            version: version.unwrap_or_else(|| "2.78".to_string()),
        })
    }

    async fn fetch(&self, code: &str) -> Result<Option<LoincConceptData>> {
        let row = sqlx::query("SELECT display, status FROM codes WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| LoincConceptData {
            display: r.get("display"),
            status: r.get("status"),
        }))
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a LoincConceptData> {
        downcast_handle(context, TAG)
    }

    async fn descendants(&self, ancestor: &str, include_self: bool) -> Result<Vec<String>> {
        let mut codes = Vec::new();
        if include_self {
            codes.push(ancestor.to_string());
        }
        codes.extend(
            sqlx::query_scalar::<_, String>(
                "SELECT descendant FROM closure WHERE ancestor = ? ORDER BY descendant",
            )
            .bind(ancestor)
            .fetch_all(&self.pool)
            .await?,
        );
        Ok(codes)
    }

    async fn in_closure(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM closure WHERE ancestor = ? AND descendant = ?",
        )
        .bind(ancestor)
        .bind(descendant)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl CodeSystemProvider for LoincProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "LOINC".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    async fn total_count(&self) -> Result<Option<u64>> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM codes")
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
        // distribution displays are English; linguistic variants live in the
        // designations table when the importer shipped them
        if languages.accepts_str("en") {
            return Ok(true);
        }
        let langs: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT lang FROM designations")
                .fetch_all(&self.pool)
                .await?;
        Ok(langs.iter().any(|lang| languages.accepts_str(lang)))
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        match self.fetch(code).await? {
            Some(data) => Ok(Located::Found(ConceptHandle::new(TAG, code, Arc::new(data)))),
            None => Ok(Located::not_found(format!(
                "Unknown LOINC code '{}'",
                code
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(self.data(context)?.display.clone())
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        let data = self.data(context)?;
        if let Some(display) = &data.display {
            out.add(Some("en"), None, display.clone());
        }
        let rows = sqlx::query(
            "SELECT lang, value FROM designations WHERE code = ? ORDER BY lang, value",
        )
        .bind(context.code())
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let lang: String = row.get("lang");
            let value: String = row.get("value");
            out.add(Some(&lang), None, value);
        }
        Ok(())
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(matches!(
            self.data(context)?.status.as_deref(),
            Some("DEPRECATED") | Some("DISCOURAGED")
        ))
    }

    async fn is_deprecated(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(self.data(context)?.status.as_deref() == Some("DEPRECATED"))
    }

    async fn status(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(self.data(context)?.status.clone())
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        let mut properties = Vec::new();
        if let Some(status) = &data.status {
            properties.push(ConceptProperty::code_value("STATUS", status.clone()));
        }
        let rows = sqlx::query(
            "SELECT property, value FROM properties WHERE code = ? ORDER BY property, value",
        )
        .bind(context.code())
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let property: String = row.get("property");
            let value: String = row.get("value");
            if property == "CLASSTYPE" {
                if let Ok(number) = value.parse::<i64>() {
                    properties.push(ConceptProperty::integer("CLASSTYPE", number));
                    continue;
                }
            }
            properties.push(ConceptProperty::code_value(property, value));
        }
        Ok(properties)
    }

    async fn parent(&self, code: &str) -> Result<Option<String>> {
        if self.fetch(code).await?.is_none() {
            return Err(Error::NotFound(format!("Unknown LOINC code '{}'", code)));
        }
        Ok(sqlx::query_scalar(
            "SELECT parent FROM hierarchy WHERE child = ? ORDER BY parent LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn locate_is_a(&self, code: &str, parent: &str, disallow_self: bool) -> Result<Located> {
        let located = self.locate(code).await?;
        let Located::Found(handle) = located else {
            return Ok(located);
        };
        if code == parent && !disallow_self {
            return Ok(Located::Found(handle));
        }
        if code != parent && self.in_closure(parent, code).await? {
            return Ok(Located::Found(handle));
        }
        Ok(Located::not_found(format!(
            "LOINC code '{}' is not a descendant of '{}'",
            code, parent
        )))
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.fetch(code).await?.is_none() {
                return Err(Error::NotFound(format!("Unknown LOINC code '{}'", code)));
            }
        }
        Ok(if a == b {
            SubsumptionOutcome::Equivalent
        } else if self.in_closure(a, b).await? {
            SubsumptionOutcome::Subsumes
        } else if self.in_closure(b, a).await? {
            SubsumptionOutcome::SubsumedBy
        } else {
            SubsumptionOutcome::NotSubsumed
        })
    }

    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        let codes = match context {
            None => {
                sqlx::query_scalar::<_, String>(
                    "SELECT code FROM codes
                     WHERE code NOT IN (SELECT child FROM hierarchy) ORDER BY code",
                )
                .fetch_all(&self.pool)
                .await?
            }
            Some(handle) => {
                self.data(handle)?;
                sqlx::query_scalar::<_, String>(
                    "SELECT child FROM hierarchy WHERE parent = ? ORDER BY child",
                )
                .bind(handle.code())
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(ConceptCursor::new(codes))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        let codes = sqlx::query_scalar::<_, String>("SELECT code FROM codes ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(ConceptCursor::new(codes))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        match (property, op) {
            ("LIST", FilterOperator::Equal) | ("LIST", FilterOperator::In) => true,
            ("parent", FilterOperator::Equal)
            | ("ancestor", FilterOperator::Equal)
            | ("parent", FilterOperator::In)
            | ("ancestor", FilterOperator::In) => true,
            (p, FilterOperator::Equal | FilterOperator::In | FilterOperator::Regex)
                if SCALAR_PROPERTIES.contains(&p) =>
            {
                true
            }
            // part-linked relationship properties (COMPONENT, SYSTEM, ...)
            (_, FilterOperator::Equal | FilterOperator::In) => true,
            _ => false,
        }
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

        match (property, op) {
            // answer lists keep their declared sequence
            ("LIST", FilterOperator::Equal) => Ok(ConceptFilter::closed(
                sqlx::query_scalar(
                    "SELECT code FROM lists WHERE list_id = ? ORDER BY sequence",
                )
                .bind(value)
                .fetch_all(&self.pool)
                .await?,
            )),
            ("LIST", FilterOperator::In) => {
                let mut codes = Vec::new();
                for list in value.split(',').map(str::trim) {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT code FROM lists WHERE list_id = ? ORDER BY sequence",
                        )
                        .bind(list)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            ("parent", _) => {
                let mut codes = Vec::new();
                for parent in value.split(',').map(str::trim) {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT child FROM hierarchy WHERE parent = ? ORDER BY child",
                        )
                        .bind(parent)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            ("ancestor", _) => {
                let mut codes = Vec::new();
                for ancestor in value.split(',').map(str::trim) {
                    codes.extend(self.descendants(ancestor, false).await?);
                }
                Ok(ConceptFilter::closed(codes))
            }
            ("STATUS" | "CLASS" | "ORDER_OBS" | "copyright", FilterOperator::Equal) => {
                let column = scalar_column(property);
                let query = format!(
                    "SELECT code FROM codes WHERE {} = ? ORDER BY code",
                    column
                );
                Ok(ConceptFilter::closed(
                    sqlx::query_scalar(&query).bind(value).fetch_all(&self.pool).await?,
                ))
            }
            ("CLASSTYPE", FilterOperator::Equal | FilterOperator::In) => {
                let mut codes = Vec::new();
                for class_type in value.split(',').map(str::trim) {
                    let number: i64 = class_type.parse().map_err(|_| {
                        Error::Validation(format!(
                            "CLASSTYPE filter value '{}' is not numeric",
                            class_type
                        ))
                    })?;
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT code FROM codes WHERE classtype = ? ORDER BY code",
                        )
                        .bind(number)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            (p, FilterOperator::Regex) if SCALAR_PROPERTIES.contains(&p) => {
                let regex = regex::Regex::new(value).map_err(|e| {
                    Error::Validation(format!("Invalid regex pattern '{}': {}", value, e))
                })?;
                let column = scalar_column(p);
                let query = format!("SELECT code, {} AS v FROM codes ORDER BY code", column);
                let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
                Ok(ConceptFilter::closed(
                    rows.into_iter()
                        .filter(|row| {
                            row.get::<Option<String>, _>("v")
                                .map(|v| regex.is_match(&v))
                                .unwrap_or(false)
                        })
                        .map(|row| row.get("code"))
                        .collect(),
                ))
            }
            (p, FilterOperator::In) if SCALAR_PROPERTIES.contains(&p) => {
                let column = scalar_column(p);
                let mut codes = Vec::new();
                for wanted in value.split(',').map(str::trim) {
                    let query = format!(
                        "SELECT code FROM codes WHERE {} = ? ORDER BY code",
                        column
                    );
                    codes.extend(
                        sqlx::query_scalar::<_, String>(&query)
                            .bind(wanted)
                            .fetch_all(&self.pool)
                            .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            // part-linked relationship property: match via the properties table
            (property, FilterOperator::Equal | FilterOperator::In) => {
                let mut codes = Vec::new();
                for wanted in value.split(',').map(str::trim) {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT code FROM properties
                             WHERE property = ? AND value = ? ORDER BY code",
                        )
                        .bind(property)
                        .bind(wanted)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            _ => unreachable!("does_filter gated"),
        }
    }
}

fn scalar_column(property: &str) -> &'static str {
    match property {
        "STATUS" => "status",
        "CLASS" => "class",
        "CLASSTYPE" => "classtype",
        "ORDER_OBS" => "order_obs",
        "copyright" => "copyright",
        _ => unreachable!("gated by SCALAR_PROPERTIES"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> LoincProvider {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE store_info (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE codes (code TEXT PRIMARY KEY, display TEXT, status TEXT,
                 class TEXT, classtype INTEGER, order_obs TEXT, copyright TEXT);
             CREATE TABLE properties (code TEXT, property TEXT, value TEXT);
             CREATE TABLE designations (code TEXT, lang TEXT, value TEXT);
             CREATE TABLE lists (list_id TEXT, code TEXT, sequence INTEGER);
             CREATE TABLE hierarchy (parent TEXT, child TEXT);
             CREATE TABLE closure (ancestor TEXT, descendant TEXT);",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::raw_sql(
            "INSERT INTO store_info VALUES ('version', '2.78');
             INSERT INTO codes VALUES
                 ('1963-8', 'Bicarbonate [Moles/volume] in Serum or Plasma', 'ACTIVE', 'CHEM', 1, 'Both', 'LOINC'),
                 ('2093-3', 'Cholesterol [Mass/volume] in Serum or Plasma', 'ACTIVE', 'CHEM', 1, 'Observation', 'LOINC'),
                 ('5932-9', 'Deprecated code', 'DEPRECATED', 'CHEM', 1, NULL, 'LOINC'),
                 ('LA6115-6', 'Positive', 'ACTIVE', 'ANSWER', 4, NULL, 'LOINC'),
                 ('LA6116-4', 'Negative', 'ACTIVE', 'ANSWER', 4, NULL, 'LOINC'),
                 ('LP7786-9', 'Chemistry', 'ACTIVE', 'PART', 2, NULL, 'LOINC');
             INSERT INTO properties VALUES
                 ('1963-8', 'COMPONENT', 'LP15275-1'),
                 ('1963-8', 'SYSTEM', 'LP7576-4'),
                 ('2093-3', 'COMPONENT', 'LP15945-9'),
                 ('2093-3', 'SYSTEM', 'LP7576-4');
             INSERT INTO designations VALUES ('1963-8', 'de', 'Bicarbonat in Serum oder Plasma');
             INSERT INTO lists VALUES ('LL360-9', 'LA6115-6', 2), ('LL360-9', 'LA6116-4', 1);
             INSERT INTO hierarchy VALUES ('LP7786-9', '1963-8'), ('LP7786-9', '2093-3');
             INSERT INTO closure VALUES ('LP7786-9', '1963-8'), ('LP7786-9', '2093-3');",
        )
        .execute(&pool)
        .await
        .unwrap();

        LoincProvider::open(pool).await.unwrap()
    }

    #[tokio::test]
    async fn locate_display_and_status() {
        let provider = fixture().await;
        let handle = provider.locate("1963-8").await.unwrap().context().unwrap();
        assert!(provider
            .display(&handle)
            .await
            .unwrap()
            .unwrap()
            .starts_with("Bicarbonate"));

        let deprecated = provider.locate("5932-9").await.unwrap().context().unwrap();
        assert!(provider.is_deprecated(&deprecated).await.unwrap());
        assert_eq!(provider.status(&deprecated).await.unwrap().as_deref(), Some("DEPRECATED"));

        assert!(provider.locate("0000-0").await.unwrap().message().is_some());
    }

    #[tokio::test]
    async fn list_filter_preserves_declared_order() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter("LIST", FilterOperator::Equal, "LL360-9")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["LA6116-4", "LA6115-6"]);
        assert_eq!(filter.size(), 2);
    }

    #[tokio::test]
    async fn relationship_and_scalar_filters() {
        let provider = fixture().await;

        let filter = provider
            .prepare_filter("COMPONENT", FilterOperator::Equal, "LP15275-1")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["1963-8"]);

        let filter = provider
            .prepare_filter("CLASSTYPE", FilterOperator::Equal, "4")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["LA6115-6", "LA6116-4"]);

        let err = provider
            .prepare_filter("CLASSTYPE", FilterOperator::Equal, "chem")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not numeric"));

        let filter = provider
            .prepare_filter("STATUS", FilterOperator::Equal, "DEPRECATED")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["5932-9"]);
    }

    #[tokio::test]
    async fn hierarchy_filters_and_subsumption() {
        let provider = fixture().await;

        let filter = provider
            .prepare_filter("ancestor", FilterOperator::Equal, "LP7786-9")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["1963-8", "2093-3"]);

        assert_eq!(
            provider.subsumes_test("LP7786-9", "1963-8").await.unwrap(),
            SubsumptionOutcome::Subsumes
        );
        assert_eq!(
            provider.subsumes_test("1963-8", "2093-3").await.unwrap(),
            SubsumptionOutcome::NotSubsumed
        );
        assert_eq!(provider.parent("1963-8").await.unwrap().as_deref(), Some("LP7786-9"));
    }

    #[tokio::test]
    async fn designations_carry_linguistic_variants() {
        let provider = fixture().await;
        let handle = provider.locate("1963-8").await.unwrap().context().unwrap();
        let mut set = DesignationSet::new();
        provider.designations(&handle, &mut set).await.unwrap();
        assert!(set.items().iter().any(|d| d.language.as_deref() == Some("de")));
        assert!(provider
            .has_any_displays(&Languages::parse_accept_language("de"))
            .await
            .unwrap());
    }
}
