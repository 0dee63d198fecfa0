//! NDC (National Drug Code) provider.
//!
//! SQL-backed. Codes come in two shapes: 10-digit segmented
//! (`4-4-2` / `5-3-2` / `5-4-1`, plus the 11-digit segmented `6-3-2` /
//! `6-4-1` variants) and 11-digit unsegmented. `locate` normalizes either
//! shape to the 11-digit form, so both resolve to the same concept. Products
//! (labeler-product pairs) are distinct from packages.

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

pub const TAG: &str = "ndc";
pub const SYSTEM: &str = "http://hl7.org/fhir/sid/ndc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeShape {
    Product,
    TenDigit,
    ElevenDigit,
}

impl CodeShape {
    fn as_str(&self) -> &'static str {
        match self {
            CodeShape::Product => "product",
            CodeShape::TenDigit => "10-digit",
            CodeShape::ElevenDigit => "11-digit",
        }
    }
}

/// Normalize a package code to its 11-digit form.
///
/// Ten-digit segmented codes pad to 5-4-2; eleven-digit segmented codes just
/// lose their dashes. Returns the shape the input arrived in.
fn normalize_package(code: &str) -> Option<(String, CodeShape)> {
    if code.contains('-') {
        let segments: Vec<&str> = code.split('-').collect();
        if segments.len() != 3 || segments.iter().any(|s| !s.chars().all(|c| c.is_ascii_digit())) {
            return None;
        }
        let digits: usize = segments.iter().map(|s| s.len()).sum();
        match digits {
            10 => {
                // pad to 5-4-2
                let labeler = format!("{:0>5}", segments[0]);
                let product = format!("{:0>4}", segments[1]);
                let package = format!("{:0>2}", segments[2]);
                if labeler.len() != 5 || product.len() != 4 || package.len() != 2 {
                    return None;
                }
                Some((format!("{}{}{}", labeler, product, package), CodeShape::TenDigit))
            }
            11 => Some((segments.concat(), CodeShape::TenDigit)),
            _ => None,
        }
    } else {
        if code.len() == 11 && code.chars().all(|c| c.is_ascii_digit()) {
            Some((code.to_string(), CodeShape::ElevenDigit))
        } else {
            None
        }
    }
}

struct NdcConceptData {
    shape: CodeShape,
    description: Option<String>,
    active: bool,
    /// for packages: the owning product code
    product: Option<String>,
}

pub struct NdcProvider {
    pool: SqlitePool,
    version: String,
}

impl NdcProvider {
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

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a NdcConceptData> {
        downcast_handle(context, TAG)
    }
}

#[async_trait]
impl CodeSystemProvider for NdcProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "National Drug Codes".to_string()
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    async fn total_count(&self) -> Result<Option<u64>> {
        let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        let packages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM packages")
            .fetch_one(&self.pool)
            .await?;
        Ok(Some((products + packages) as u64))
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

        // two-segment codes are products
        if code.matches('-').count() == 1 {
            let row = sqlx::query("SELECT description, active FROM products WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
            return Ok(match row {
                Some(row) => Located::Found(ConceptHandle::new(
                    TAG,
                    code,
                    Arc::new(NdcConceptData {
                        shape: CodeShape::Product,
                        description: row.get("description"),
                        active: row.get::<i64, _>("active") != 0,
                        product: None,
                    }),
                )),
                None => Located::not_found(format!("Unknown NDC product '{}'", code)),
            });
        }

        let Some((normalized, shape)) = normalize_package(code) else {
            return Ok(Located::not_found(format!(
                "Code '{}' is not a valid NDC package code",
                code
            )));
        };

        let row = sqlx::query(
            "SELECT description, active, product_code FROM packages WHERE code11 = ?",
        )
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Located::Found(ConceptHandle::new(
                TAG,
                normalized,
                Arc::new(NdcConceptData {
                    shape,
                    description: row.get("description"),
                    active: row.get::<i64, _>("active") != 0,
                    product: row.get("product_code"),
                }),
            )),
            None => Located::not_found(format!("Unknown NDC package '{}'", code)),
        })
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(self.data(context)?.description.clone())
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        if let Some(description) = &self.data(context)?.description {
            out.add(Some("en"), None, description.clone());
        }
        Ok(())
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        Ok(!self.data(context)?.active)
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let data = self.data(context)?;
        let mut properties = vec![ConceptProperty::code_value("code-type", data.shape.as_str())];
        if let Some(product) = &data.product {
            properties.push(ConceptProperty::code_value("product", product.clone()));
        }
        Ok(properties)
    }

    fn same_concept(&self, a: &str, b: &str) -> bool {
        match (normalize_package(a), normalize_package(b)) {
            (Some((a, _)), Some((b, _))) => a == b,
            _ => a == b,
        }
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.locate(code).await?.context().is_none() {
                return Err(Error::NotFound(format!("Unknown NDC code '{}'", code)));
            }
        }
        Ok(if self.same_concept(a, b) {
            SubsumptionOutcome::Equivalent
        } else {
            SubsumptionOutcome::NotSubsumed
        })
    }

    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        match context {
            None => self.iterator_all().await,
            Some(handle) => {
                self.data(handle)?;
                Ok(ConceptCursor::empty())
            }
        }
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        let mut codes: Vec<String> =
            sqlx::query_scalar("SELECT code FROM products ORDER BY code")
                .fetch_all(&self.pool)
                .await?;
        codes.extend(
            sqlx::query_scalar::<_, String>("SELECT code11 FROM packages ORDER BY code11")
                .fetch_all(&self.pool)
                .await?,
        );
        Ok(ConceptCursor::new(codes))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        matches!((property, op), ("code-type", FilterOperator::Equal))
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

        match value {
            "product" => Ok(ConceptFilter::closed(
                sqlx::query_scalar("SELECT code FROM products ORDER BY code")
                    .fetch_all(&self.pool)
                    .await?,
            )),
            "10-digit" | "11-digit" => Ok(ConceptFilter::closed(
                sqlx::query_scalar("SELECT code11 FROM packages ORDER BY code11")
                    .fetch_all(&self.pool)
                    .await?,
            )),
            other => Err(Error::Validation(format!(
                "Unknown code-type '{}': expected product, 10-digit or 11-digit",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> NdcProvider {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE store_info (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE products (code TEXT PRIMARY KEY, description TEXT, active INTEGER);
             CREATE TABLE packages (code11 TEXT PRIMARY KEY, code10 TEXT,
                 product_code TEXT, description TEXT, active INTEGER);",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::raw_sql(
            "INSERT INTO store_info VALUES ('version', '20240401');
             INSERT INTO products VALUES ('0002-3227', 'Zyprexa 10mg Tablet', 1);
             INSERT INTO packages VALUES
                 ('00002322730', '0002-3227-30', '0002-3227', 'Zyprexa 10mg Tablet, 30 count bottle', 1),
                 ('00002322790', '0002-3227-90', '0002-3227', 'Zyprexa 10mg Tablet, 90 count bottle', 0);",
        )
        .execute(&pool)
        .await
        .unwrap();

        NdcProvider::open(pool).await.unwrap()
    }

    #[test]
    fn normalization_handles_all_segmented_shapes() {
        assert_eq!(
            normalize_package("0002-3227-30"),
            Some(("00002322730".to_string(), CodeShape::TenDigit))
        );
        assert_eq!(
            normalize_package("50090-3227-3"),
            Some(("50090322703".to_string(), CodeShape::TenDigit))
        );
        assert_eq!(
            normalize_package("123456-322-30"),
            Some(("12345632230".to_string(), CodeShape::TenDigit))
        );
        assert_eq!(
            normalize_package("00002322730"),
            Some(("00002322730".to_string(), CodeShape::ElevenDigit))
        );
        assert_eq!(normalize_package("0002-3227"), None);
        assert_eq!(normalize_package("abc"), None);
    }

    #[tokio::test]
    async fn segmented_and_unsegmented_forms_resolve_to_the_same_concept() {
        let provider = fixture().await;

        let dashed = provider.locate("0002-3227-30").await.unwrap().context().unwrap();
        let plain = provider.locate("00002322730").await.unwrap().context().unwrap();
        assert_eq!(dashed.code(), plain.code());
        assert!(provider.same_concept("0002-3227-30", "00002322730"));

        let properties = provider.properties(&dashed).await.unwrap();
        assert!(properties.contains(&ConceptProperty::code_value("code-type", "10-digit")));
        assert!(properties.contains(&ConceptProperty::code_value("product", "0002-3227")));

        let properties = provider.properties(&plain).await.unwrap();
        assert!(properties.contains(&ConceptProperty::code_value("code-type", "11-digit")));
    }

    #[tokio::test]
    async fn products_are_distinct_from_packages() {
        let provider = fixture().await;
        let product = provider.locate("0002-3227").await.unwrap().context().unwrap();
        let properties = provider.properties(&product).await.unwrap();
        assert!(properties.contains(&ConceptProperty::code_value("code-type", "product")));

        assert_eq!(
            provider.subsumes_test("0002-3227", "0002-3227-30").await.unwrap(),
            SubsumptionOutcome::NotSubsumed
        );
    }

    #[tokio::test]
    async fn inactive_packages_flagged() {
        let provider = fixture().await;
        let inactive = provider.locate("0002-3227-90").await.unwrap().context().unwrap();
        assert!(provider.is_inactive(&inactive).await.unwrap());
    }

    #[tokio::test]
    async fn code_type_filter() {
        let provider = fixture().await;
        let filter = provider
            .prepare_filter("code-type", FilterOperator::Equal, "product")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["0002-3227"]);

        let filter = provider
            .prepare_filter("code-type", FilterOperator::Equal, "11-digit")
            .await
            .unwrap();
        assert_eq!(filter.codes(), &["00002322730", "00002322790"]);

        let err = provider
            .prepare_filter("code-type", FilterOperator::Equal, "bogus")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn malformed_codes_report_not_found() {
        let provider = fixture().await;
        assert!(provider.locate("12-34").await.unwrap().message().is_some());
        assert!(provider.locate("123").await.unwrap().message().is_some());
        assert_eq!(provider.locate("").await.unwrap().message(), Some("Empty code"));
    }
}
