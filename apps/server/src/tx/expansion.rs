//! ValueSet expansion pipeline.
//!
//! Interprets a compose section across providers: include clauses select by
//! explicit concept lists, provider filters, whole-system enumeration or
//! imported ValueSets; excludes subtract; the result is deduplicated,
//! deterministically ordered and paged. The operation context guards
//! recursion depth (circular imports) and the time budget at every provider
//! boundary.

use super::filters::PrepContext;
use super::worker::TxResources;
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::models::Parameters;
use crate::providers::{CodeSystemProvider, DesignationSet, Located};
use argentum_models::{
    Designation, ValueSet, ValueSetExpansion, ValueSetExpansionContains,
    ValueSetExpansionParameter, ValueSetInclude,
};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Normalized expansion parameters.
#[derive(Debug, Clone, Default)]
pub struct ExpansionParams {
    pub filter: Option<String>,
    pub offset: usize,
    pub count: usize,
    pub active_only: bool,
    pub include_designations: bool,
    /// permit an incomplete result instead of failing on open filters
    pub limited_expansion: bool,
    /// unknown codes in explicit concept lists are tolerated
    pub incomplete_ok: bool,
    /// version rules keyed by system
    pub versions: Vec<VersionRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRule {
    pub system: String,
    pub version: String,
    pub mode: VersionRuleMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRuleMode {
    /// a suggestion when the clause names no version
    Default,
    /// the clause version must agree
    Check,
    /// replaces the ambient version
    Override,
}

impl ExpansionParams {
    pub fn from_parameters(parameters: &Parameters, default_count: usize) -> Self {
        let mut versions = Vec::new();
        for (name, mode) in [
            ("system-version", VersionRuleMode::Default),
            ("check-system-version", VersionRuleMode::Check),
            ("force-system-version", VersionRuleMode::Override),
        ] {
            for value in parameters.get_strings(name) {
                if let Some((system, version)) = value.split_once('|') {
                    versions.push(VersionRule {
                        system: system.to_string(),
                        version: version.to_string(),
                        mode,
                    });
                }
            }
        }

        Self {
            filter: parameters.get_string("filter"),
            offset: parameters.get_integer("offset").unwrap_or(0).max(0) as usize,
            count: parameters
                .get_integer("count")
                .map(|c| c.max(0) as usize)
                .unwrap_or(default_count),
            active_only: parameters.get_bool("activeOnly").unwrap_or(false),
            include_designations: parameters.get_bool("includeDesignations").unwrap_or(false),
            limited_expansion: parameters.get_bool("limitedExpansion").unwrap_or(false),
            incomplete_ok: parameters.get_bool("incomplete-ok").unwrap_or(false),
            versions,
        }
    }

    /// Resolve the effective version for a clause against the rules.
    fn resolve_version(&self, system: &str, declared: Option<&str>) -> Result<Option<String>> {
        let mut effective = declared.map(|v| v.to_string());
        for rule in self.versions.iter().filter(|r| r.system == system) {
            match rule.mode {
                VersionRuleMode::Override => effective = Some(rule.version.clone()),
                VersionRuleMode::Default => {
                    if effective.is_none() {
                        effective = Some(rule.version.clone());
                    }
                }
                VersionRuleMode::Check => {
                    if let Some(declared) = &effective {
                        if declared != &rule.version {
                            return Err(Error::Conflict(format!(
                                "Version rule for {} requires {}, but {} was requested",
                                system, rule.version, declared
                            )));
                        }
                    } else {
                        effective = Some(rule.version.clone());
                    }
                }
            }
        }
        Ok(effective)
    }
}

#[derive(Debug, Clone)]
struct ExpandedConcept {
    system: String,
    version: Option<String>,
    code: String,
    display: Option<String>,
    inactive: bool,
    is_abstract: bool,
    designations: Vec<Designation>,
}

/// The outcome of an expansion: the expanded ValueSet plus closure state.
#[derive(Debug)]
pub struct ExpansionOutcome {
    pub valueset: serde_json::Value,
    pub all_closed: bool,
}

pub struct Expander<'a> {
    resources: &'a TxResources,
    context: &'a OperationContext,
    params: ExpansionParams,
}

impl<'a> Expander<'a> {
    pub fn new(
        resources: &'a TxResources,
        context: &'a OperationContext,
        params: ExpansionParams,
    ) -> Self {
        Self {
            resources,
            context,
            params,
        }
    }

    /// Expand a ValueSet into an expansion-bearing copy.
    pub async fn expand(&self, valueset: &ValueSet) -> Result<ExpansionOutcome> {
        let url = valueset
            .url
            .clone()
            .unwrap_or_else(|| format!("urn:uuid:{}", Uuid::new_v4()));
        self.context.enter_valueset(&url)?;
        let result = self.expand_guarded(valueset).await;
        self.context.leave_valueset(&url);
        result
    }

    /// Type-erased recursion point: imported ValueSets re-enter through a
    /// boxed future so the expansion future stays finitely sized.
    fn expand_boxed<'b>(
        &'b self,
        valueset: &'b ValueSet,
    ) -> BoxFuture<'b, Result<ExpansionOutcome>> {
        Box::pin(self.expand(valueset))
    }

    async fn expand_guarded(&self, valueset: &ValueSet) -> Result<ExpansionOutcome> {
        let mut concepts: Vec<ExpandedConcept> = Vec::new();
        let mut all_closed = true;

        let Some(compose) = &valueset.compose else {
            // an expansion-only ValueSet re-expands to itself
            if let Some(expansion) = &valueset.expansion {
                for contains in expansion.contains.as_deref().unwrap_or(&[]) {
                    if let (Some(system), Some(code)) = (&contains.system, &contains.code) {
                        concepts.push(ExpandedConcept {
                            system: system.clone(),
                            version: contains.version.clone(),
                            code: code.clone(),
                            display: contains.display.clone(),
                            inactive: contains.inactive.unwrap_or(false),
                            is_abstract: contains.is_abstract.unwrap_or(false),
                            designations: contains.designation.clone().unwrap_or_default(),
                        });
                    }
                }
            }
            return Ok(self.finish(valueset, concepts, true));
        };

        for include in &compose.include {
            self.context.dead_check("include clause")?;
            let closed = self
                .evaluate_clause(include, &mut concepts, false)
                .await?;
            all_closed = all_closed && closed;
        }

        if let Some(excludes) = &compose.exclude {
            let mut excluded: Vec<ExpandedConcept> = Vec::new();
            for exclude in excludes {
                self.context.dead_check("exclude clause")?;
                self.evaluate_clause(exclude, &mut excluded, true).await?;
            }
            let removal: HashSet<(String, String)> = excluded
                .into_iter()
                .map(|c| (c.system, c.code))
                .collect();
            concepts.retain(|c| !removal.contains(&(c.system.clone(), c.code.clone())));
        }

        if !all_closed && !self.params.limited_expansion {
            return Err(Error::TooCostly {
                message: format!(
                    "The ValueSet {} cannot be expanded: a filter is not closed",
                    valueset.url.as_deref().unwrap_or("(anonymous)")
                ),
                diagnostics: Some(self.context.trail()),
            });
        }

        Ok(self.finish(valueset, concepts, all_closed))
    }

    /// Evaluate one include/exclude clause into `into`. Returns whether the
    /// clause was closed.
    async fn evaluate_clause(
        &self,
        clause: &ValueSetInclude,
        into: &mut Vec<ExpandedConcept>,
        excluding: bool,
    ) -> Result<bool> {
        // membership sets of the imported ValueSets, to intersect with
        let mut import_sets: Vec<HashSet<(String, String)>> = Vec::new();
        for import in clause.value_set.as_deref().unwrap_or(&[]) {
            let imported = self.resources.resolve_valueset(self.context, import).await?;
            let outcome = self.expand_inner(&imported).await?;
            import_sets.push(outcome);
        }

        let mut closed = true;
        let mut clause_concepts: Vec<ExpandedConcept> = Vec::new();
        let mut sort_clause = false;

        if let Some(system) = &clause.system {
            let version = self
                .params
                .resolve_version(system, clause.version.as_deref())?;
            let provider = self
                .resources
                .resolve_provider(system, version.as_deref())?;

            if let Some(listed) = &clause.concept {
                for concept in listed {
                    self.context.dead_check("explicit concept list")?;
                    match provider.locate(&concept.code).await? {
                        Located::Found(handle) => {
                            let mut expanded = self
                                .build_concept(&provider, &handle, version.as_deref())
                                .await?;
                            if let Some(display) = &concept.display {
                                expanded.display = Some(display.clone());
                            }
                            clause_concepts.push(expanded);
                        }
                        Located::NotFound { message } => {
                            if !self.params.incomplete_ok && !excluding {
                                return Err(Error::Validation(format!(
                                    "Unable to expand: {}",
                                    message
                                )));
                            }
                        }
                    }
                }
            } else if clause.filter.as_ref().is_some_and(|f| !f.is_empty()) {
                let mut prep = PrepContext::new(provider.clone());
                for filter in clause.filter.as_deref().unwrap_or(&[]) {
                    prep.filter(&filter.property, filter.op, &filter.value)?;
                }
                prep.execute(self.context).await?;

                if prep.filters_not_closed() {
                    closed = false;
                }
                if let Some(codes) = prep.iterate(self.context).await? {
                    for (index, code) in codes.iter().enumerate() {
                        if index % 256 == 0 {
                            self.context.dead_check("filtered expansion")?;
                        }
                        if let Located::Found(handle) = provider.locate(code).await? {
                            clause_concepts.push(
                                self.build_concept(&provider, &handle, version.as_deref())
                                    .await?,
                            );
                        }
                    }
                }
            } else if import_sets.is_empty() || !excluding {
                // whole-system enumeration
                let mut cursor = provider.iterator_all().await?;
                let mut index = 0usize;
                while let Some(handle) = provider.next_context(&mut cursor).await? {
                    if index % 256 == 0 {
                        self.context.dead_check("system enumeration")?;
                    }
                    index += 1;
                    clause_concepts.push(
                        self.build_concept(&provider, &handle, version.as_deref())
                            .await?,
                    );
                }
                sort_clause = true;
            }

            // intersect with every imported ValueSet
            for import_set in &import_sets {
                clause_concepts
                    .retain(|c| import_set.contains(&(c.system.clone(), c.code.clone())));
            }

            // explicit concept lists and filter results keep their declared
            // (provider) order, which is deterministic per filter contract;
            // whole-system enumeration sorts by (system, code)
            if sort_clause {
                clause_concepts.sort_by(|a, b| {
                    (a.system.as_str(), a.code.as_str()).cmp(&(b.system.as_str(), b.code.as_str()))
                });
            }
        } else {
            // no system: the clause is the intersection of its imports
            let Some((first, rest)) = import_sets.split_first() else {
                return Err(Error::Validation(
                    "Include clause has neither a system nor a valueSet".to_string(),
                ));
            };
            let mut membership: Vec<(String, String)> = first.iter().cloned().collect();
            membership.sort();
            for (system, code) in membership {
                if rest.iter().all(|s| s.contains(&(system.clone(), code.clone()))) {
                    if let Ok(provider) = self.resources.resolve_provider(&system, None) {
                        if let Located::Found(handle) = provider.locate(&code).await? {
                            clause_concepts.push(self.build_concept(&provider, &handle, None).await?);
                            continue;
                        }
                    }
                    clause_concepts.push(ExpandedConcept {
                        system,
                        version: None,
                        code,
                        display: None,
                        inactive: false,
                        is_abstract: false,
                        designations: Vec::new(),
                    });
                }
            }
        }

        into.extend(clause_concepts);
        Ok(closed)
    }

    /// Recursively expand an imported ValueSet to its (system, code) set.
    async fn expand_inner(&self, valueset: &ValueSet) -> Result<HashSet<(String, String)>> {
        let inner_params = ExpansionParams {
            // paging and text filtering apply to the outer result only
            filter: None,
            offset: 0,
            count: usize::MAX,
            ..self.params.clone()
        };
        let expander = Expander::new(self.resources, self.context, inner_params);
        let outcome = expander.expand_boxed(valueset).await?;
        let mut membership = HashSet::new();
        if let Some(contains) = outcome
            .valueset
            .get("expansion")
            .and_then(|e| e.get("contains"))
            .and_then(|c| c.as_array())
        {
            for entry in contains {
                if let (Some(system), Some(code)) = (
                    entry.get("system").and_then(|v| v.as_str()),
                    entry.get("code").and_then(|v| v.as_str()),
                ) {
                    membership.insert((system.to_string(), code.to_string()));
                }
            }
        }
        Ok(membership)
    }

    async fn build_concept(
        &self,
        provider: &Arc<dyn CodeSystemProvider>,
        handle: &crate::providers::ConceptHandle,
        version: Option<&str>,
    ) -> Result<ExpandedConcept> {
        let mut designations = DesignationSet::new();
        provider.designations(handle, &mut designations).await?;

        let languages = self.context.display_languages();
        let display = designations
            .best_value(languages)
            .map(|s| s.to_string())
            .or(provider.display(handle).await?);

        Ok(ExpandedConcept {
            system: provider.system().to_string(),
            version: version
                .map(|v| v.to_string())
                .or_else(|| provider.version().map(|v| v.to_string())),
            code: handle.code().to_string(),
            display,
            inactive: provider.is_inactive(handle).await?,
            is_abstract: provider.is_abstract(handle).await?,
            designations: designations.items().to_vec(),
        })
    }

    /// Post-processing: dedup, order, text filter, activeOnly, paging.
    fn finish(
        &self,
        valueset: &ValueSet,
        mut concepts: Vec<ExpandedConcept>,
        all_closed: bool,
    ) -> ExpansionOutcome {
        if self.params.active_only {
            concepts.retain(|c| !c.inactive);
        }

        if let Some(text) = &self.params.filter {
            let needle = text.to_lowercase();
            concepts.retain(|c| {
                c.code.to_lowercase().contains(&needle)
                    || c.display
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
                    || c.designations
                        .iter()
                        .any(|d| d.value.to_lowercase().contains(&needle))
            });
        }

        // clauses arrive already ordered (declared order or sorted); dedup
        // on (system, code), first occurrence wins
        let mut seen = HashSet::new();
        concepts.retain(|c| seen.insert((c.system.clone(), c.code.clone())));

        let total = concepts.len() as i64;
        let page: Vec<ExpandedConcept> = concepts
            .into_iter()
            .skip(self.params.offset)
            .take(self.params.count)
            .collect();

        let contains: Vec<ValueSetExpansionContains> = page
            .into_iter()
            .map(|c| ValueSetExpansionContains {
                system: Some(c.system),
                version: c.version,
                code: Some(c.code),
                display: c.display,
                inactive: c.inactive.then_some(true),
                is_abstract: c.is_abstract.then_some(true),
                designation: (self.params.include_designations && !c.designations.is_empty())
                    .then_some(c.designations),
                contains: None,
            })
            .collect();

        let mut parameters = vec![];
        if let Some(filter) = &self.params.filter {
            parameters.push(parameter("filter", json!({ "valueString": filter })));
        }
        if self.params.offset > 0 {
            parameters.push(parameter("offset", json!({ "valueInteger": self.params.offset })));
        }
        if self.params.count != usize::MAX {
            parameters.push(parameter("count", json!({ "valueInteger": self.params.count })));
        }
        if self.params.active_only {
            parameters.push(parameter("activeOnly", json!({ "valueBoolean": true })));
        }

        let expansion = ValueSetExpansion {
            identifier: Some(format!("urn:uuid:{}", Uuid::new_v4())),
            timestamp: Utc::now().to_rfc3339(),
            total: all_closed.then_some(total),
            offset: (self.params.offset > 0).then_some(self.params.offset as i64),
            parameter: (!parameters.is_empty()).then_some(parameters),
            contains: Some(contains),
        };

        let mut out = valueset.clone();
        out.expansion = Some(expansion);
        ExpansionOutcome {
            valueset: serde_json::to_value(&out).expect("valueset serializes"),
            all_closed,
        }
    }
}

fn parameter(name: &str, value: serde_json::Value) -> ValueSetExpansionParameter {
    ValueSetExpansionParameter {
        name: name.to_string(),
        value,
    }
}
