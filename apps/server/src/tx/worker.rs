//! Per-operation worker.
//!
//! A worker is built for one request: it assembles the effective provider
//! registry (statically registered backends plus client-submitted
//! CodeSystems with their supplements), resolves the target resources, and
//! executes one of the five terminology operations.

use super::expansion::{Expander, ExpansionParams};
use crate::caches::expansion_cache_key;
use crate::config::OperationsConfig;
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::models::{Parameter, ParameterValue, Parameters};
use crate::providers::{
    fhir::FhirCodeSystemProvider, CodeSystemProvider, DesignationSet, Located, ProviderRegistry,
};
use crate::state::AppState;
use argentum_models::{
    CodeSystem, CodeSystemContentMode, ConceptMap, ValueSet,
};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// The resource universe of one request: providers, ValueSets and
/// ConceptMaps, combining server-registered content with everything the
/// client submitted.
pub struct TxResources {
    pub registry: ProviderRegistry,
    valuesets: HashMap<String, ValueSet>,
    concept_maps: Vec<ConceptMap>,
}

impl TxResources {
    /// Assemble the request universe. The active supplements of each
    /// CodeSystem provider are fixed here and do not change for the
    /// lifetime of the worker.
    pub fn assemble(state: &AppState, parameters: &Parameters) -> Result<(Self, Vec<JsonValue>)> {
        let mut additional: Vec<JsonValue> = parameters
            .get_resources("tx-resource")
            .into_iter()
            .cloned()
            .collect();
        if let Some(cache_id) = parameters.get_string("cache-id") {
            additional.extend(state.resource_cache.get(&cache_id));
        }

        let mut registry = state.registry.clone();
        let mut valuesets = state.store.valuesets();
        let mut concept_maps = state.store.concept_maps();

        let mut code_systems: Vec<CodeSystem> = Vec::new();
        let mut supplements: Vec<CodeSystem> = Vec::new();
        for resource in state
            .store
            .code_systems()
            .into_iter()
            .chain(additional.iter().filter_map(|r| {
                (r.get("resourceType").and_then(|t| t.as_str()) == Some("CodeSystem"))
                    .then(|| serde_json::from_value::<CodeSystem>(r.clone()).ok())
                    .flatten()
            }))
        {
            if resource.content == CodeSystemContentMode::Supplement {
                supplements.push(resource);
            } else {
                code_systems.push(resource);
            }
        }

        for resource in &additional {
            match resource.get("resourceType").and_then(|t| t.as_str()) {
                Some("ValueSet") => {
                    if let Ok(valueset) = serde_json::from_value::<ValueSet>(resource.clone()) {
                        if let Some(url) = &valueset.url {
                            valuesets.insert(url.clone(), valueset);
                        }
                    }
                }
                Some("ConceptMap") => {
                    if let Ok(map) = serde_json::from_value::<ConceptMap>(resource.clone()) {
                        concept_maps.push(map);
                    }
                }
                _ => {}
            }
        }

        for code_system in code_systems {
            let matching: Vec<CodeSystem> = supplements
                .iter()
                .filter(|s| s.supplements_system(&code_system.url))
                .cloned()
                .collect();
            let provider = FhirCodeSystemProvider::new(code_system, matching)?;
            registry.register(Arc::new(provider));
        }

        Ok((
            Self {
                registry,
                valuesets,
                concept_maps,
            },
            additional,
        ))
    }

    pub fn resolve_provider(
        &self,
        system: &str,
        version: Option<&str>,
    ) -> Result<Arc<dyn CodeSystemProvider>> {
        self.registry.resolve(system, version).ok_or_else(|| match version {
            Some(version) => Error::NotFound(format!(
                "No CodeSystem provider for '{}' version '{}'",
                system, version
            )),
            None => Error::NotFound(format!("No CodeSystem provider for '{}'", system)),
        })
    }

    pub async fn resolve_valueset(
        &self,
        context: &OperationContext,
        url: &str,
    ) -> Result<ValueSet> {
        context.dead_check("valueset resolution")?;
        let (base, version) = match url.split_once('|') {
            Some((base, version)) => (base, Some(version)),
            None => (url, None),
        };
        let valueset = self
            .valuesets
            .get(base)
            .ok_or_else(|| Error::NotFound(format!("ValueSet not found for url '{}'", url)))?;
        if let Some(version) = version {
            if valueset.version.as_deref() != Some(version) {
                return Err(Error::NotFound(format!(
                    "ValueSet not found for url '{}'",
                    url
                )));
            }
        }
        Ok(valueset.clone())
    }

    fn find_concept_map(
        &self,
        url: Option<&str>,
        version: Option<&str>,
        source_scope: Option<&str>,
        target_scope: Option<&str>,
        source_system: Option<&str>,
    ) -> Result<&ConceptMap> {
        if let Some(url) = url {
            return self
                .concept_maps
                .iter()
                .find(|m| {
                    m.url.as_deref() == Some(url)
                        && version.map_or(true, |v| m.version.as_deref() == Some(v))
                })
                .ok_or_else(|| {
                    Error::NotFound(format!("ConceptMap not found for url '{}'", url))
                });
        }

        self.concept_maps
            .iter()
            .find(|m| {
                let scope_ok = source_scope.map_or(true, |s| m.source_scope() == Some(s))
                    && target_scope.map_or(true, |t| m.target_scope() == Some(t));
                let system_ok = source_system.map_or(true, |system| {
                    m.group
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .any(|g| g.source.as_deref() == Some(system))
                });
                scope_ok && system_ok && (source_scope.is_some() || source_system.is_some())
            })
            .ok_or_else(|| {
                Error::NotFound("No ConceptMap matches the requested scopes".to_string())
            })
    }
}

/// One terminology operation execution.
pub struct Worker<'a> {
    resources: TxResources,
    additional: Vec<JsonValue>,
    context: &'a OperationContext,
    operations: OperationsConfig,
}

impl<'a> Worker<'a> {
    pub fn new(
        state: &AppState,
        context: &'a OperationContext,
        parameters: &Parameters,
    ) -> Result<Self> {
        let (resources, additional) = TxResources::assemble(state, parameters)?;
        Ok(Self {
            resources,
            additional,
            context,
            operations: state.config.operations.clone(),
        })
    }

    /// Resolve `system`/`code`/`version` from the parameter soup: explicit
    /// parameters first, then a `coding`.
    fn resolve_subject(
        &self,
        parameters: &Parameters,
    ) -> Result<(String, String, Option<String>)> {
        let version = parameters.get_string("version");
        if let (Some(system), Some(code)) =
            (parameters.get_string("system"), parameters.get_string("code"))
        {
            return Ok((system, code, version));
        }
        if let Some(coding) = parameters.get_coding("coding") {
            let system = coding
                .get("system")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Validation("coding.system is required".to_string()))?;
            let code = coding
                .get("code")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Validation("coding.code is required".to_string()))?;
            let version = coding
                .get("version")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
                .or(version);
            return Ok((system.to_string(), code.to_string(), version));
        }
        Err(Error::Validation(
            "Missing parameters: system+code or coding".to_string(),
        ))
    }

    // ----- $lookup ---------------------------------------------------------

    pub async fn lookup(&self, parameters: &Parameters) -> Result<Parameters> {
        let (system, code, version) = self.resolve_subject(parameters)?;
        let provider = self.resources.resolve_provider(&system, version.as_deref())?;
        self.context.dead_check("lookup")?;

        let handle = match provider.locate(&code).await? {
            Located::Found(handle) => handle,
            Located::NotFound { message } => return Err(Error::NotFound(message)),
        };

        let requested: Vec<String> = parameters.get_strings("property");
        let wants = |name: &str| {
            requested.is_empty()
                || requested.iter().any(|p| p == name)
                || requested.iter().any(|p| p == "*")
        };

        let mut out = Parameters::new();
        out.add_value_string("name".to_string(), provider.description());
        if let Some(version) = version.as_deref().or(provider.version()) {
            out.add_value_string("version".to_string(), version.to_string());
        }

        let mut designations = DesignationSet::new();
        provider.designations(&handle, &mut designations).await?;
        let display = designations
            .best_value(self.context.display_languages())
            .map(|s| s.to_string())
            .or(provider.display(&handle).await?)
            .unwrap_or_else(|| code.clone());
        out.add_value_string("display".to_string(), display);

        if provider.is_abstract(&handle).await? {
            out.add_value_boolean("abstract".to_string(), true);
        }

        for property in provider.properties(&handle).await? {
            if !wants(&property.code) {
                continue;
            }
            out.add_parts(
                "property".to_string(),
                vec![
                    value_part("code", json!({ "valueCode": property.code })),
                    value_part("value", property.value),
                ],
            );
        }

        if wants("parent") {
            if let Some(parent) = provider.parent(&code).await? {
                out.add_parts(
                    "property".to_string(),
                    vec![
                        value_part("code", json!({ "valueCode": "parent" })),
                        value_part("value", json!({ "valueCode": parent })),
                    ],
                );
            }
        }

        if wants("child") {
            if let Ok(mut cursor) = provider.iterator(Some(&handle)).await {
                while let Some(code) = cursor.next_code() {
                    out.add_parts(
                        "property".to_string(),
                        vec![
                            value_part("code", json!({ "valueCode": "child" })),
                            value_part("value", json!({ "valueCode": code })),
                        ],
                    );
                }
            }
        }

        if wants("designation") {
            for designation in designations.items() {
                let mut parts = Vec::new();
                if let Some(language) = &designation.language {
                    parts.push(value_part("language", json!({ "valueCode": language })));
                }
                if let Some(use_) = &designation.use_ {
                    parts.push(value_part(
                        "use",
                        json!({ "valueCoding": serde_json::to_value(use_)? }),
                    ));
                }
                parts.push(value_part("value", json!({ "valueString": designation.value })));
                out.add_parts("designation".to_string(), parts);
            }
        }

        Ok(out)
    }

    // ----- $validate-code --------------------------------------------------

    pub async fn validate_code(
        &self,
        parameters: &Parameters,
        valueset: Option<ValueSet>,
    ) -> Result<Parameters> {
        // codeableConcept: first coding that validates wins
        if let Some(concept) = parameters.get_value("codeableConcept").cloned() {
            let codings = concept
                .get("coding")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            let mut last: Option<Parameters> = None;
            for coding in codings {
                let mut inner = Parameters::new();
                inner.add_value_coding("coding".to_string(), coding);
                if let Some(display) = parameters.get_string("display") {
                    inner.add_value_string("display".to_string(), display);
                }
                let result = self.validate_one(&inner, valueset.clone()).await?;
                let ok = result.get_bool("result").unwrap_or(false);
                last = Some(result);
                if ok {
                    break;
                }
            }
            return last.ok_or_else(|| {
                Error::Validation("codeableConcept has no codings".to_string())
            });
        }

        self.validate_one(parameters, valueset).await
    }

    async fn validate_one(
        &self,
        parameters: &Parameters,
        valueset: Option<ValueSet>,
    ) -> Result<Parameters> {
        let (system, code, version) = match self.resolve_subject(parameters) {
            Ok(subject) => subject,
            Err(_) if valueset.is_some() => {
                // inferred system: a bare code against a single-system ValueSet
                let code = parameters.get_string("code").ok_or_else(|| {
                    Error::Validation("Missing parameters: system+code or coding".to_string())
                })?;
                let valueset = valueset.as_ref().unwrap();
                let systems: Vec<&str> = valueset
                    .compose
                    .as_ref()
                    .map(|c| {
                        c.include
                            .iter()
                            .filter_map(|i| i.system.as_deref())
                            .collect()
                    })
                    .unwrap_or_default();
                match systems.as_slice() {
                    [single] => (single.to_string(), code, None),
                    _ => {
                        return Err(Error::Validation(
                            "Cannot infer a system for the supplied code".to_string(),
                        ))
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let mut out = Parameters::new();
        let provider = match self.resources.resolve_provider(&system, version.as_deref()) {
            Ok(provider) => provider,
            Err(Error::NotFound(message)) => {
                out.add_value_boolean("result".to_string(), false);
                out.add_value_string("message".to_string(), message);
                return Ok(out);
            }
            Err(e) => return Err(e),
        };

        self.context.dead_check("validate-code")?;
        let located = provider.locate(&code).await?;
        let handle = match located {
            Located::Found(handle) => handle,
            Located::NotFound { message } => {
                out.add_value_boolean("result".to_string(), false);
                out.add_value_string("message".to_string(), message);
                return Ok(out);
            }
        };

        // ValueSet membership
        if let Some(valueset) = valueset {
            let params = ExpansionParams {
                count: usize::MAX,
                limited_expansion: true,
                ..Default::default()
            };
            let expander = Expander::new(&self.resources, self.context, params);
            let outcome = expander.expand(&valueset).await?;
            let member = outcome
                .valueset
                .get("expansion")
                .and_then(|e| e.get("contains"))
                .and_then(|c| c.as_array())
                .map(|entries| {
                    entries.iter().any(|entry| {
                        entry.get("system").and_then(|v| v.as_str()) == Some(system.as_str())
                            && entry.get("code").and_then(|v| v.as_str())
                                == Some(handle.code())
                    })
                })
                .unwrap_or(false);
            if !member {
                out.add_value_boolean("result".to_string(), false);
                out.add_value_string(
                    "message".to_string(),
                    format!(
                        "The code '{}' from system '{}' is not in the ValueSet {}",
                        code,
                        system,
                        valueset.url.as_deref().unwrap_or("(anonymous)")
                    ),
                );
                return Ok(out);
            }
        }

        // display validation
        let mut designations = DesignationSet::new();
        provider.designations(&handle, &mut designations).await?;
        let canonical_display = designations
            .best_value(self.context.display_languages())
            .map(|s| s.to_string())
            .or(provider.display(&handle).await?);

        if let Some(submitted) = parameters.get_string("display") {
            let acceptable = designations
                .items()
                .iter()
                .any(|d| d.value.eq_ignore_ascii_case(&submitted))
                || canonical_display
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case(&submitted));
            if !acceptable {
                out.add_value_boolean("result".to_string(), false);
                out.add_value_string(
                    "message".to_string(),
                    format!(
                        "The display '{}' is not valid for {}#{}; expected '{}'",
                        submitted,
                        system,
                        code,
                        canonical_display.as_deref().unwrap_or("")
                    ),
                );
                if let Some(display) = canonical_display {
                    out.add_value_string("display".to_string(), display);
                }
                return Ok(out);
            }
        }

        out.add_value_boolean("result".to_string(), true);
        out.add_value_code("code".to_string(), handle.code().to_string());
        out.add_value_uri("system".to_string(), system);
        if let Some(version) = version.as_deref().or(provider.version()) {
            out.add_value_string("version".to_string(), version.to_string());
        }
        if let Some(display) = canonical_display {
            out.add_value_string("display".to_string(), display);
        }
        if provider.is_inactive(&handle).await? {
            out.add_value_boolean("inactive".to_string(), true);
        }
        Ok(out)
    }

    // ----- $subsumes -------------------------------------------------------

    pub async fn subsumes(&self, parameters: &Parameters) -> Result<Parameters> {
        let system = parameters
            .get_string("system")
            .or_else(|| {
                parameters
                    .get_coding("codingA")
                    .and_then(|c| c.get("system").and_then(|s| s.as_str()).map(String::from))
            })
            .ok_or_else(|| Error::Validation("Missing parameter: system".to_string()))?;
        let version = parameters.get_string("version");

        let code_of = |name: &str, coding_name: &str| -> Option<String> {
            parameters.get_string(name).or_else(|| {
                parameters
                    .get_coding(coding_name)
                    .and_then(|c| c.get("code").and_then(|v| v.as_str()).map(String::from))
            })
        };
        let code_a = code_of("codeA", "codingA")
            .ok_or_else(|| Error::Validation("Missing parameter: codeA".to_string()))?;
        let code_b = code_of("codeB", "codingB")
            .ok_or_else(|| Error::Validation("Missing parameter: codeB".to_string()))?;

        if let Some(coding_b) = parameters.get_coding("codingB") {
            if let Some(other) = coding_b.get("system").and_then(|v| v.as_str()) {
                if other != system {
                    return Err(Error::Validation(
                        "codingA and codingB are from different systems".to_string(),
                    ));
                }
            }
        }

        let provider = self.resources.resolve_provider(&system, version.as_deref())?;
        self.context.dead_check("subsumes")?;
        let outcome = provider.subsumes_test(&code_a, &code_b).await?;

        let mut out = Parameters::new();
        out.add_value_code("outcome".to_string(), outcome.as_str().to_string());
        Ok(out)
    }

    // ----- $translate ------------------------------------------------------

    pub async fn translate(&self, parameters: &Parameters) -> Result<Parameters> {
        let (source_system, source_code) = self.resolve_translate_source(parameters)?;

        let map = self.resources.find_concept_map(
            parameters.get_string("url").as_deref(),
            parameters.get_string("conceptMapVersion").as_deref(),
            parameters.get_string("sourceScope").as_deref(),
            parameters.get_string("targetScope").as_deref(),
            Some(&source_system),
        )?;
        self.context.dead_check("translate")?;

        let target_system = parameters.get_string("targetSystem");

        let mut matches: Vec<(String, JsonValue)> = Vec::new();
        for group in map.group.as_deref().unwrap_or(&[]) {
            if group.source.as_deref() != Some(source_system.as_str()) {
                continue;
            }
            if let (Some(wanted), Some(actual)) = (target_system.as_deref(), group.target.as_deref())
            {
                if wanted != actual {
                    continue;
                }
            }
            for element in &group.element {
                if element.code.as_deref() != Some(source_code.as_str()) {
                    continue;
                }
                for target in element.target.as_deref().unwrap_or(&[]) {
                    let Some(code) = &target.code else { continue };
                    let mut coding = serde_json::Map::new();
                    if let Some(system) = &group.target {
                        coding.insert("system".to_string(), json!(system));
                    }
                    if let Some(version) = &group.target_version {
                        coding.insert("version".to_string(), json!(version));
                    }
                    coding.insert("code".to_string(), json!(code));
                    if let Some(display) = &target.display {
                        coding.insert("display".to_string(), json!(display));
                    }
                    matches.push((
                        target.relationship_code().to_string(),
                        JsonValue::Object(coding),
                    ));
                }
            }
        }

        let mut out = Parameters::new();
        let result = matches
            .iter()
            .any(|(relationship, _)| relationship != "not-related-to");
        out.add_value_boolean("result".to_string(), result);
        if matches.is_empty() {
            out.add_value_string(
                "message".to_string(),
                format!(
                    "No mapping found for '{}' in '{}'",
                    source_code,
                    map.url.as_deref().unwrap_or("(anonymous map)")
                ),
            );
        }
        for (relationship, concept) in matches {
            let mut parts = vec![
                value_part("relationship", json!({ "valueCode": relationship })),
                value_part("concept", json!({ "valueCoding": concept })),
            ];
            if let Some(url) = &map.url {
                parts.push(value_part("source", json!({ "valueUri": url })));
            }
            out.add_parts("match".to_string(), parts);
        }
        Ok(out)
    }

    fn resolve_translate_source(&self, parameters: &Parameters) -> Result<(String, String)> {
        if let Some(coding) = parameters.get_coding("sourceCoding") {
            let system = coding.get("system").and_then(|v| v.as_str());
            let code = coding.get("code").and_then(|v| v.as_str());
            if let (Some(system), Some(code)) = (system, code) {
                return Ok((system.to_string(), code.to_string()));
            }
        }
        if let Some(concept) = parameters.get_value("sourceCodeableConcept") {
            if let Some(coding) = concept
                .get("coding")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            {
                let system = coding.get("system").and_then(|v| v.as_str());
                let code = coding.get("code").and_then(|v| v.as_str());
                if let (Some(system), Some(code)) = (system, code) {
                    return Ok((system.to_string(), code.to_string()));
                }
            }
        }
        let system = parameters
            .get_string("sourceSystem")
            .or_else(|| parameters.get_string("system"));
        let code = parameters
            .get_string("sourceCode")
            .or_else(|| parameters.get_string("code"));
        match (system, code) {
            (Some(system), Some(code)) => Ok((system, code)),
            // a missing source is an invalid request, not a missing resource
            _ => Err(Error::Validation(
                "Missing source: provide sourceCoding, sourceCodeableConcept or sourceSystem+sourceCode"
                    .to_string(),
            )),
        }
    }

    // ----- $expand ---------------------------------------------------------

    pub async fn expand(&self, parameters: &Parameters, valueset: ValueSet) -> Result<JsonValue> {
        let params = ExpansionParams::from_parameters(
            parameters,
            self.operations.default_expansion_count,
        );

        let valueset_json = serde_json::to_value(&valueset)?;
        let cache_key = expansion_cache_key(&valueset_json, parameters, &self.additional);
        if let Some(cached) = self.context.expansion_cache.get(&cache_key) {
            self.context.log("expansion cache hit");
            return Ok(cached);
        }

        let started = std::time::Instant::now();
        let expander = Expander::new(&self.resources, self.context, params);
        let mut outcome = expander.expand(&valueset).await?;
        self.context.log(format!(
            "expanded {} in {}ms",
            valueset.url.as_deref().unwrap_or("(anonymous)"),
            started.elapsed().as_millis()
        ));

        // content-addressed identifier: equal inputs yield equal expansions
        if let Some(expansion) = outcome.valueset.get_mut("expansion") {
            expansion["identifier"] = json!(format!("urn:sha256:{}", cache_key));
        }

        self.context.expansion_cache.store(
            cache_key,
            outcome.valueset.clone(),
            started.elapsed(),
        );
        Ok(outcome.valueset)
    }

    /// Resolve the ValueSet subject of an operation: instance id, `url`
    /// parameter, or inline `valueSet` resource parameter.
    pub async fn subject_valueset(
        &self,
        parameters: &Parameters,
        instance: Option<&ValueSet>,
    ) -> Result<ValueSet> {
        if let Some(valueset) = instance {
            return Ok(valueset.clone());
        }
        if let Some(url) = parameters.get_string("url") {
            return self.resources.resolve_valueset(self.context, &url).await;
        }
        if let Some(resource) = parameters.get_resource("valueSet") {
            return Ok(serde_json::from_value(resource.clone())?);
        }
        Err(Error::Validation(
            "Missing ValueSet input: use instance invocation, parameter 'url', or parameter 'valueSet'"
                .to_string(),
        ))
    }
}

fn value_part(name: &str, value: JsonValue) -> Parameter {
    let map = value
        .as_object()
        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Parameter {
        name: name.to_string(),
        value: ParameterValue::Value(map),
    }
}
