//! RxNorm provider.
//!
//! SQL-backed, flat. Concepts are RXCUIs with atoms from source
//! vocabularies; filtering selects by term type, source vocabulary, semantic
//! type, relationship type, or stem-token text search. Every filter is
//! finite, so the closure guarantee holds for all of them. Archived concepts
//! surface as deprecated.

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

pub const TAG: &str = "rxnorm";
pub const SYSTEM: &str = "http://www.nlm.nih.gov/research/umls/rxnorm";

struct RxNormConceptData {
    display: Option<String>,
    tty: Option<String>,
    archived: bool,
}

pub struct RxNormProvider {
    pool: SqlitePool,
    version: String,
}

impl RxNormProvider {
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

    async fn fetch(&self, rxcui: &str) -> Result<Option<RxNormConceptData>> {
        let row = sqlx::query("SELECT display, tty, archived FROM concepts WHERE rxcui = ?")
            .bind(rxcui)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RxNormConceptData {
            display: r.get("display"),
            tty: r.get("tty"),
            archived: r.get::<i64, _>("archived") != 0,
        }))
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a RxNormConceptData> {
        downcast_handle(context, TAG)
    }

    /// Stem-token search: every whitespace-separated token must hit the
    /// precomputed stems of the concept.
    async fn search_stems(&self, text: &str) -> Result<Vec<String>> {
        let mut result: Option<Vec<String>> = None;
        for token in text.split_whitespace() {
            let stem = stem(token);
            if stem.is_empty() {
                continue;
            }
            let matches: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT rxcui FROM stems WHERE stem = ? ORDER BY rxcui",
            )
            .bind(&stem)
            .fetch_all(&self.pool)
            .await?;
            result = Some(match result {
                None => matches,
                Some(previous) => previous
                    .into_iter()
                    .filter(|rxcui| matches.contains(rxcui))
                    .collect(),
            });
        }
        Ok(result.unwrap_or_default())
    }
}

/// Cheap stemmer matching the importer: lowercase, strip non-alphanumerics,
/// drop a trailing 's'.
fn stem(token: &str) -> String {
    let mut stem: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if stem.len() > 3 && stem.ends_with('s') {
        stem.pop();
    }
    stem
}

#[async_trait]
impl CodeSystemProvider for RxNormProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "RxNorm".to_string()
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
                "Unknown RxNorm concept '{}'",
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
            "SELECT sab, tty, name FROM atoms WHERE rxcui = ? ORDER BY sab, tty, name",
        )
        .bind(context.code())
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let tty: String = row.get("tty");
            let name: String = row.get("name");
            out.add(
                Some("en"),
                Some(argentum_models::Coding::new(SYSTEM, tty)),
                name,
            );
        }
        Ok(())
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(self.data(context)?.archived)
    }

    async fn is_deprecated(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(self.data(context)?.archived)
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        let mut properties = Vec::new();
        if let Some(tty) = &data.tty {
            properties.push(ConceptProperty::code_value("TTY", tty.clone()));
        }
        let types: Vec<String> =
            sqlx::query_scalar("SELECT sty FROM sty WHERE rxcui = ? ORDER BY sty")
                .bind(context.code())
                .fetch_all(&self.pool)
                .await?;
        for sty in types {
            properties.push(ConceptProperty::string("STY", sty));
        }
        Ok(properties)
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.fetch(code).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "Unknown RxNorm concept '{}'",
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

    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        match context {
            // flat: every concept is a root
            None => self.iterator_all().await,
            Some(handle) => {
                self.data(handle)?;
                Ok(ConceptCursor::empty())
            }
        }
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        let codes = sqlx::query_scalar::<_, String>("SELECT rxcui FROM concepts ORDER BY rxcui")
            .fetch_all(&self.pool)
            .await?;
        Ok(ConceptCursor::new(codes))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        matches!(
            (property, op),
            ("TTY", FilterOperator::Equal | FilterOperator::In)
                | ("SAB", FilterOperator::Equal | FilterOperator::In)
                | ("STY", FilterOperator::Equal | FilterOperator::In)
                | ("REL", FilterOperator::Equal)
                | ("RELA", FilterOperator::Equal)
                | ("text", FilterOperator::Equal)
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

        let values: Vec<&str> = value.split(',').map(str::trim).collect();
        match property {
            "TTY" => {
                let mut codes = Vec::new();
                for tty in values {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT rxcui FROM concepts WHERE tty = ? ORDER BY rxcui",
                        )
                        .bind(tty)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            "SAB" => {
                let mut codes = Vec::new();
                for sab in values {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT DISTINCT rxcui FROM atoms WHERE sab = ? ORDER BY rxcui",
                        )
                        .bind(sab)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            "STY" => {
                let mut codes = Vec::new();
                for sty in values {
                    codes.extend(
                        sqlx::query_scalar::<_, String>(
                            "SELECT rxcui FROM sty WHERE sty = ? ORDER BY rxcui",
                        )
                        .bind(sty)
                        .fetch_all(&self.pool)
                        .await?,
                    );
                }
                Ok(ConceptFilter::closed(codes))
            }
            // value is `type` or `type|target-rxcui`
            "REL" | "RELA" => {
                let column = if property == "REL" { "rel" } else { "rela" };
                let (rel_type, target) = match value.split_once('|') {
                    Some((t, target)) => (t, Some(target)),
                    None => (value, None),
                };
                let codes = match target {
                    Some(target) => {
                        let query = format!(
                            "SELECT rxcui1 FROM relationships
                             WHERE {} = ? AND rxcui2 = ? ORDER BY rxcui1",
                            column
                        );
                        sqlx::query_scalar::<_, String>(&query)
                            .bind(rel_type)
                            .bind(target)
                            .fetch_all(&self.pool)
                            .await?
                    }
                    None => {
                        let query = format!(
                            "SELECT DISTINCT rxcui1 FROM relationships
                             WHERE {} = ? ORDER BY rxcui1",
                            column
                        );
                        sqlx::query_scalar::<_, String>(&query)
                            .bind(rel_type)
                            .fetch_all(&self.pool)
                            .await?
                    }
                };
                Ok(ConceptFilter::closed(codes))
            }
            "text" => Ok(ConceptFilter::closed(self.search_stems(value).await?)),
            _ => unreachable!("does_filter gated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> RxNormProvider {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE store_info (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE concepts (rxcui TEXT PRIMARY KEY, display TEXT, tty TEXT, archived INTEGER);
             CREATE TABLE atoms (rxcui TEXT, sab TEXT, tty TEXT, name TEXT);
             CREATE TABLE sty (rxcui TEXT, sty TEXT);
             CREATE TABLE relationships (rxcui1 TEXT, rel TEXT, rela TEXT, rxcui2 TEXT);
             CREATE TABLE stems (stem TEXT, rxcui TEXT);",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::raw_sql(
            "INSERT INTO store_info VALUES ('version', '03042024');
             INSERT INTO concepts VALUES
                 ('1191', 'aspirin', 'IN', 0),
                 ('243670', 'aspirin 81 MG Oral Tablet', 'SCD', 0),
                 ('7052', 'morphine', 'IN', 0),
                 ('104850', 'old concept', 'SCD', 1);
             INSERT INTO atoms VALUES
                 ('1191', 'RXNORM', 'IN', 'aspirin'),
                 ('1191', 'MTHSPL', 'SU', 'ASPIRIN'),
                 ('243670', 'RXNORM', 'SCD', 'aspirin 81 MG Oral Tablet');
             INSERT INTO sty VALUES
                 ('1191', 'Pharmacologic Substance'),
                 ('7052', 'Pharmacologic Substance');
             INSERT INTO relationships VALUES
                 ('243670', 'RO', 'has_ingredient', '1191');
             INSERT INTO stems VALUES
                 ('aspirin', '1191'), ('aspirin', '243670'),
                 ('oral', '243670'), ('tablet', '243670'), ('morphine', '7052');",
        )
        .execute(&pool)
        .await
        .unwrap();

        RxNormProvider::open(pool).await.unwrap()
    }

    #[tokio::test]
    async fn locate_and_archived_flags() {
        let provider = fixture().await;
        let aspirin = provider.locate("1191").await.unwrap().context().unwrap();
        assert_eq!(provider.display(&aspirin).await.unwrap().as_deref(), Some("aspirin"));
        assert!(!provider.is_deprecated(&aspirin).await.unwrap());

        let archived = provider.locate("104850").await.unwrap().context().unwrap();
        assert!(provider.is_deprecated(&archived).await.unwrap());
        assert!(provider.is_inactive(&archived).await.unwrap());

        assert!(provider.locate("999999").await.unwrap().message().is_some());
    }

    #[tokio::test]
    async fn tty_sab_and_sty_filters() {
        let provider = fixture().await;

        let filter = provider
            .prepare_filter("TTY", FilterOperator::Equal, "IN")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["1191", "7052"]);

        let filter = provider
            .prepare_filter("SAB", FilterOperator::Equal, "MTHSPL")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["1191"]);

        let filter = provider
            .prepare_filter("STY", FilterOperator::Equal, "Pharmacologic Substance")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["1191", "7052"]);
    }

    #[tokio::test]
    async fn relationship_filters() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter("RELA", FilterOperator::Equal, "has_ingredient|1191")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["243670"]);

        let filter = provider
            .prepare_filter("REL", FilterOperator::Equal, "RO")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["243670"]);
    }

    #[tokio::test]
    async fn stem_text_search_intersects_tokens() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter("text", FilterOperator::Equal, "Aspirin Tablets")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["243670"]);
    }

    #[tokio::test]
    async fn flat_subsumption() {
        let provider = fixture().await;
        assert_eq!(
            provider.subsumes_test("1191", "1191").await.unwrap(),
            SubsumptionOutcome::Equivalent
        );
        assert_eq!(
            provider.subsumes_test("1191", "7052").await.unwrap(),
            SubsumptionOutcome::NotSubsumed
        );
    }
}
