//! CPT provider.
//!
//! SQL-backed flat code set with **expression codes** of the form
//! `base:mod1[:mod2...]`. Expressions are validated structurally: every
//! modifier must exist, category-2-only modifiers require a category-2 base,
//! and the telemedicine modifier 95 requires a telemedicine-enabled base.
//! Valid expressions yield an expression-kind handle with an empty display.
//!
//! The `modified = true` filter is the one open filter in the system:
//! membership is decided by expression parsing, never by enumeration, so it
//! cannot iterate and reports size 0.

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

pub const TAG: &str = "cpt";
pub const SYSTEM: &str = "http://www.ama-assn.org/go/cpt";

const KINDS: &[&str] = &["code", "cat-2", "general", "physical-status", "hcpcs"];

#[derive(Debug)]
enum CptConceptData {
    Code {
        display: Option<String>,
        kind: String,
        is_modifier: bool,
    },
    /// `base:modifiers` expression; carries the parsed parts
    Expression { parts: Vec<String> },
}

/// Marker for the open `modified = true` filter.
struct ModifiedFilterData;

#[derive(Debug)]
struct CodeRow {
    display: Option<String>,
    kind: String,
    is_modifier: bool,
    telemedicine: bool,
}

pub struct CptProvider {
    pool: SqlitePool,
    version: String,
}

impl CptProvider {
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

    async fn fetch(&self, code: &str) -> Result<Option<CodeRow>> {
        let row = sqlx::query(
            "SELECT display, kind, modifier, telemedicine FROM codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CodeRow {
            display: r.get("display"),
            kind: r.get("kind"),
            is_modifier: r.get::<i64, _>("modifier") != 0,
            telemedicine: r.get::<i64, _>("telemedicine") != 0,
        }))
    }

    fn data<'a>(&self, context: &'a ConceptHandle) -> Result<&'a CptConceptData> {
        downcast_handle(context, TAG)
    }

    /// Parse and validate a `base:mod...` expression. Returns the located
    /// handle, or the reason the expression is invalid.
    async fn locate_expression(&self, code: &str) -> Result<Located> {
        let parts: Vec<&str> = code.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Ok(Located::not_found(format!(
                "Invalid CPT expression '{}': empty part",
                code
            )));
        }

        let base = parts[0];
        let Some(base_row) = self.fetch(base).await? else {
            return Ok(Located::not_found(format!(
                "Invalid CPT expression '{}': unknown base code '{}'",
                code, base
            )));
        };
        if base_row.is_modifier {
            return Ok(Located::not_found(format!(
                "Invalid CPT expression '{}': '{}' is a modifier, not a base code",
                code, base
            )));
        }

        for modifier in &parts[1..] {
            let Some(modifier_row) = self.fetch(modifier).await? else {
                return Ok(Located::not_found(format!(
                    "Invalid CPT expression '{}': unknown modifier '{}'",
                    code, modifier
                )));
            };
            if !modifier_row.is_modifier {
                return Ok(Located::not_found(format!(
                    "Invalid CPT expression '{}': '{}' is not a modifier",
                    code, modifier
                )));
            }
            if modifier_row.kind == "cat-2" && base_row.kind != "cat-2" {
                return Ok(Located::not_found(format!(
                    "Invalid CPT expression '{}': modifier '{}' is only valid on category 2 codes",
                    code, modifier
                )));
            }
            if *modifier == "95" && !base_row.telemedicine {
                return Ok(Located::not_found(format!(
                    "Invalid CPT expression '{}': code '{}' does not allow telemedicine",
                    code, base
                )));
            }
        }

        Ok(Located::Found(ConceptHandle::new(
            TAG,
            code,
            Arc::new(CptConceptData::Expression {
                parts: parts.iter().map(|p| p.to_string()).collect(),
            }),
        )))
    }
}

#[async_trait]
impl CodeSystemProvider for CptProvider {
    fn system(&self) -> &str {
        SYSTEM
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn description(&self) -> String {
        "CPT".to_string()
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

    fn content_mode(&self) -> CodeSystemContentMode {
        // distribution rules mean the store usually holds a licensed subset
        CodeSystemContentMode::Fragment
    }

    async fn has_any_displays(&self, languages: &Languages) -> Result<bool> {
        Ok(languages.accepts_str("en"))
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        if code.contains(':') {
            return self.locate_expression(code).await;
        }
        match self.fetch(code).await? {
            Some(row) => Ok(Located::Found(ConceptHandle::new(
                TAG,
                code,
                Arc::new(CptConceptData::Code {
                    display: row.display,
                    kind: row.kind,
                    is_modifier: row.is_modifier,
                }),
            ))),
            None => Ok(Located::not_found(format!("Unknown CPT code '{}'", code))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(match self.data(context)? {
            CptConceptData::Code { display, .. } => display.clone(),
            // expressions have no composed narrative
            CptConceptData::Expression { .. } => Some(String::new()),
        })
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        if let CptConceptData::Code {
            display: Some(display),
            ..
        } = self.data(context)?
        {
            out.add(Some("en"), None, display.clone());
        }
        Ok(())
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        Ok(match self.data(context)? {
            CptConceptData::Code { kind, is_modifier, .. } => vec![
                ConceptProperty::code_value("kind", kind.clone()),
                ConceptProperty::boolean("modifier", *is_modifier),
                ConceptProperty::boolean("modified", false),
            ],
            CptConceptData::Expression { parts } => {
                let mut properties = vec![
                    ConceptProperty::boolean("modified", true),
                    ConceptProperty::code_value("base", parts[0].clone()),
                ];
                for modifier in &parts[1..] {
                    properties.push(ConceptProperty::code_value("modifier", modifier.clone()));
                }
                properties
            }
        })
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        for code in [a, b] {
            if self.locate(code).await?.context().is_none() {
                return Err(Error::NotFound(format!("Unknown CPT code '{}'", code)));
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
            None => self.iterator_all().await,
            Some(handle) => {
                self.data(handle)?;
                Ok(ConceptCursor::empty())
            }
        }
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        let codes = sqlx::query_scalar::<_, String>("SELECT code FROM codes ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(ConceptCursor::new(codes))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, value: &str) -> bool {
        match (property, op) {
            ("modifier", FilterOperator::Equal) | ("modified", FilterOperator::Equal) => {
                value == "true" || value == "false"
            }
            ("kind", FilterOperator::Equal) => KINDS.contains(&value),
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

        match (property, value) {
            ("modifier", flag) => {
                let wanted = i64::from(flag == "true");
                Ok(ConceptFilter::closed(
                    sqlx::query_scalar(
                        "SELECT code FROM codes WHERE modifier = ? ORDER BY code",
                    )
                    .bind(wanted)
                    .fetch_all(&self.pool)
                    .await?,
                ))
            }
            // every stored code is unmodified
            ("modified", "false") => Ok(ConceptFilter::closed(
                sqlx::query_scalar("SELECT code FROM codes ORDER BY code")
                    .fetch_all(&self.pool)
                    .await?,
            )),
            // the set of modified expressions is unbounded: membership comes
            // from expression parsing, so the filter stays open
            ("modified", "true") => Ok(ConceptFilter::open(TAG, Arc::new(ModifiedFilterData))),
            ("kind", kind) => Ok(ConceptFilter::closed(
                sqlx::query_scalar("SELECT code FROM codes WHERE kind = ? ORDER BY code")
                    .bind(kind)
                    .fetch_all(&self.pool)
                    .await?,
            )),
            _ => unreachable!("does_filter gated"),
        }
    }

    async fn filter_check(&self, filter: &ConceptFilter, context: &ConceptHandle) -> Result<bool> {
        match filter {
            ConceptFilter::Closed { members, .. } => Ok(members.contains(context.code())),
            ConceptFilter::Open { data, .. } => {
                if data.downcast_ref::<ModifiedFilterData>().is_none() {
                    return Err(Error::Internal(
                        "foreign open filter passed to the CPT provider".to_string(),
                    ));
                }
                Ok(matches!(
                    self.data(context)?,
                    CptConceptData::Expression { .. }
                ))
            }
        }
    }
}
