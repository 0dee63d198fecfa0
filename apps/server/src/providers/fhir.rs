//! In-memory provider over a FHIR CodeSystem resource.
//!
//! Consumes a CodeSystem JSON resource (typically client-submitted or loaded
//! at startup), validates it, and indexes the concept tree for lookup,
//! hierarchy walks and filtering. Registered supplements contribute
//! designations and properties, never codes.

use super::{
    downcast_handle, CodeSystemProvider, ConceptCursor, ConceptFilter, ConceptHandle,
    ConceptProperty, DesignationSet, Located, SubsumptionOutcome,
};
use crate::error::{Error, Result};
use argentum_languages::Languages;
use argentum_models::{
    CodeSystem, CodeSystemConcept, CodeSystemContentMode, Designation, FilterOperator,
    PublicationStatus,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const TAG: &str = "fhir";

#[derive(Debug)]
struct ConceptNode {
    code: String,
    display: Option<String>,
    definition: Option<String>,
    designations: Vec<Designation>,
    properties: Vec<(String, serde_json::Value)>,
    parents: Vec<usize>,
    children: Vec<usize>,
}

struct FhirConceptData {
    index: usize,
}

/// Provider over one CodeSystem resource plus its active supplements.
#[derive(Debug)]
pub struct FhirCodeSystemProvider {
    resource: CodeSystem,
    nodes: Vec<ConceptNode>,
    /// normalized code -> node index
    index: HashMap<String, usize>,
    roots: Vec<usize>,
    /// preorder (document order) node indices
    preorder: Vec<usize>,
    supplements: Vec<CodeSystem>,
    /// per supplement: code -> flattened concept
    supplement_concepts: Vec<HashMap<String, CodeSystemConcept>>,
}

impl FhirCodeSystemProvider {
    pub fn new(resource: CodeSystem, supplements: Vec<CodeSystem>) -> Result<Self> {
        if resource.url.trim().is_empty() {
            return Err(Error::Validation(
                "Invalid CodeSystem: url is required".to_string(),
            ));
        }
        if resource.content == CodeSystemContentMode::Supplement {
            return Err(Error::Validation(
                "Invalid CodeSystem: a supplement cannot back a provider".to_string(),
            ));
        }

        let case_sensitive = resource.case_sensitive.unwrap_or(true);
        let mut nodes: Vec<ConceptNode> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut roots = Vec::new();
        let mut preorder = Vec::new();

        fn build(
            concepts: &[CodeSystemConcept],
            parent: Option<usize>,
            case_sensitive: bool,
            nodes: &mut Vec<ConceptNode>,
            index: &mut HashMap<String, usize>,
            roots: &mut Vec<usize>,
            preorder: &mut Vec<usize>,
        ) -> Result<()> {
            for concept in concepts {
                if concept.code.trim().is_empty() {
                    return Err(Error::Validation(
                        "Invalid CodeSystem: code is required".to_string(),
                    ));
                }
                let key = normalize(&concept.code, case_sensitive);
                if index.contains_key(&key) {
                    return Err(Error::Validation(format!(
                        "Invalid CodeSystem: duplicate code '{}'",
                        concept.code
                    )));
                }

                let node_index = nodes.len();
                nodes.push(ConceptNode {
                    code: concept.code.clone(),
                    display: concept.display.clone(),
                    definition: concept.definition.clone(),
                    designations: concept.designation.clone().unwrap_or_default(),
                    properties: concept
                        .property
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .map(|p| (p.code.clone(), p.value.clone()))
                        .collect(),
                    parents: parent.into_iter().collect(),
                    children: Vec::new(),
                });
                index.insert(key, node_index);
                preorder.push(node_index);
                match parent {
                    Some(parent_index) => nodes[parent_index].children.push(node_index),
                    None => roots.push(node_index),
                }

                if let Some(children) = &concept.concept {
                    build(children, Some(node_index), case_sensitive, nodes, index, roots, preorder)?;
                }
            }
            Ok(())
        }

        if let Some(concepts) = &resource.concept {
            build(
                concepts,
                None,
                case_sensitive,
                &mut nodes,
                &mut index,
                &mut roots,
                &mut preorder,
            )?;
        }

        let mut provider = Self {
            resource,
            nodes,
            index,
            roots,
            preorder,
            supplement_concepts: supplements
                .iter()
                .map(|supplement| {
                    let mut map = HashMap::new();
                    supplement.walk_concepts(|concept| {
                        map.insert(concept.code.clone(), concept.clone());
                    });
                    map
                })
                .collect(),
            supplements,
        };
        provider.link_declared_relations();
        Ok(provider)
    }

    /// Concept properties named `parent` / `child` declare relations beyond
    /// the nesting of the concept tree.
    fn link_declared_relations(&mut self) {
        let mut extra: Vec<(usize, usize)> = Vec::new(); // (parent, child)
        for (node_index, node) in self.nodes.iter().enumerate() {
            for (code, value) in &node.properties {
                let Some(target) = value
                    .get("valueCode")
                    .and_then(|v| v.as_str())
                    .and_then(|c| self.find(c))
                else {
                    continue;
                };
                match code.as_str() {
                    "parent" => extra.push((target, node_index)),
                    "child" => extra.push((node_index, target)),
                    _ => {}
                }
            }
        }
        for (parent, child) in extra {
            if !self.nodes[parent].children.contains(&child) {
                self.nodes[parent].children.push(child);
            }
            if !self.nodes[child].parents.contains(&parent) {
                self.nodes[child].parents.push(parent);
            }
            // a node with a declared parent is no longer a root
            self.roots.retain(|&root| root != child);
        }
    }

    fn case_sensitive(&self) -> bool {
        self.resource.case_sensitive.unwrap_or(true)
    }

    fn find(&self, code: &str) -> Option<usize> {
        self.index
            .get(&normalize(code, self.case_sensitive()))
            .copied()
    }

    fn node(&self, context: &ConceptHandle) -> Result<&ConceptNode> {
        let data: &FhirConceptData = downcast_handle(context, TAG)?;
        Ok(&self.nodes[data.index])
    }

    fn handle(&self, index: usize) -> ConceptHandle {
        ConceptHandle::new(
            TAG,
            self.nodes[index].code.clone(),
            Arc::new(FhirConceptData { index }),
        )
    }

    /// The resource's base language; displays without an explicit tag are in
    /// this language. FHIR's implicit default is English.
    fn base_language(&self) -> &str {
        self.resource.language.as_deref().unwrap_or("en")
    }

    /// `index` plus all transitive descendants, in preorder.
    fn self_and_descendants(&self, index: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            // reverse keeps document order on the stack
            for &child in self.nodes[current].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Proper-ancestor test over the (possibly multi-parent) DAG.
    fn is_ancestor(&self, ancestor: usize, descendant: usize) -> bool {
        let mut seen = HashSet::new();
        let mut stack = self.nodes[descendant].parents.clone();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.nodes[current].parents.iter().copied());
            }
        }
        false
    }

    /// Merged property list: the concept's own, then supplement-contributed.
    fn merged_properties(&self, node: &ConceptNode) -> Vec<(String, serde_json::Value)> {
        let mut merged = node.properties.clone();
        for concepts in &self.supplement_concepts {
            if let Some(concept) = concepts.get(&node.code) {
                for property in concept.property.as_deref().unwrap_or(&[]) {
                    merged.push((property.code.clone(), property.value.clone()));
                }
            }
        }
        merged
    }

    fn property_strings(&self, node: &ConceptNode, property: &str) -> Vec<String> {
        self.merged_properties(node)
            .iter()
            .filter(|(code, _)| code == property)
            .filter_map(|(_, value)| property_value_string(value))
            .collect()
    }

    fn codes(&self, indices: impl IntoIterator<Item = usize>) -> Vec<String> {
        indices
            .into_iter()
            .map(|i| self.nodes[i].code.clone())
            .collect()
    }
}

fn normalize(code: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        code.to_string()
    } else {
        code.to_lowercase()
    }
}

/// Render a `value[x]`-keyed object as a comparison string.
fn property_value_string(value: &serde_json::Value) -> Option<String> {
    let object = value.as_object()?;
    let (key, inner) = object.iter().find(|(k, _)| k.starts_with("value"))?;
    match inner {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Object(o) if key == "valueCoding" => o
            .get("code")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string()),
        _ => None,
    }
}

#[async_trait]
impl CodeSystemProvider for FhirCodeSystemProvider {
    fn system(&self) -> &str {
        &self.resource.url
    }

    fn version(&self) -> Option<&str> {
        self.resource.version.as_deref()
    }

    fn description(&self) -> String {
        self.resource
            .title
            .clone()
            .or_else(|| self.resource.name.clone())
            .unwrap_or_else(|| self.resource.url.clone())
    }

    fn handle_tag(&self) -> &'static str {
        TAG
    }

    async fn total_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.nodes.len() as u64))
    }

    fn has_parents(&self) -> bool {
        self.nodes.iter().any(|n| !n.parents.is_empty())
    }

    fn content_mode(&self) -> CodeSystemContentMode {
        self.resource.content
    }

    async fn has_any_displays(&self, languages: &Languages) -> Result<bool> {
        if languages.is_empty() {
            return Ok(true);
        }
        let base = self.base_language();
        if self.nodes.iter().any(|n| n.display.is_some()) && languages.accepts_str(base) {
            return Ok(true);
        }
        for node in &self.nodes {
            for designation in &node.designations {
                let language = designation.language.as_deref().unwrap_or(base);
                if languages.accepts_str(language) {
                    return Ok(true);
                }
            }
        }
        for (supplement, concepts) in self.supplements.iter().zip(&self.supplement_concepts) {
            let supplement_base = supplement.language.as_deref().unwrap_or("en");
            for concept in concepts.values() {
                if concept.display.is_some() && languages.accepts_str(supplement_base) {
                    return Ok(true);
                }
                for designation in concept.designation.as_deref().unwrap_or(&[]) {
                    let language = designation.language.as_deref().unwrap_or(supplement_base);
                    if languages.accepts_str(language) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn list_supplements(&self) -> Vec<String> {
        self.supplements.iter().map(|s| s.versioned_url()).collect()
    }

    async fn locate(&self, code: &str) -> Result<Located> {
        if code.is_empty() {
            return Ok(Located::empty_code());
        }
        match self.find(code) {
            Some(index) => Ok(Located::Found(self.handle(index))),
            None => Ok(Located::not_found(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                code, self.resource.url
            ))),
        }
    }

    async fn display(&self, context: &ConceptHandle) -> Result<Option<String>> {
        Ok(self.node(context)?.display.clone())
    }

    async fn designations(&self, context: &ConceptHandle, out: &mut DesignationSet) -> Result<()> {
        let node = self.node(context)?;
        let base = self.base_language();

        if let Some(display) = &node.display {
            out.add(Some(base), None, display.clone());
        }
        for designation in &node.designations {
            out.add_designation(Designation {
                language: designation
                    .language
                    .clone()
                    .or_else(|| Some(base.to_string())),
                use_: designation.use_.clone(),
                value: designation.value.clone(),
            });
        }

        for (supplement, concepts) in self.supplements.iter().zip(&self.supplement_concepts) {
            let Some(concept) = concepts.get(&node.code) else {
                continue;
            };
            let supplement_base = supplement.language.as_deref().unwrap_or("en");
            if let Some(display) = &concept.display {
                out.add(Some(supplement_base), None, display.clone());
            }
            for designation in concept.designation.as_deref().unwrap_or(&[]) {
                out.add_designation(Designation {
                    language: designation
                        .language
                        .clone()
                        .or_else(|| Some(supplement_base.to_string())),
                    use_: designation.use_.clone(),
                    value: designation.value.clone(),
                });
            }
        }
        Ok(())
    }

    async fn is_abstract(&self, context: &ConceptHandle) -> Result<bool> {
        let node = self.node(context)?;
        Ok(self
            .property_strings(node, "notSelectable")
            .iter()
            .any(|v| v == "true"))
    }

    async fn is_inactive(&self, context: &ConceptHandle) -> Result<bool> {
        let node = self.node(context)?;
        if self
            .property_strings(node, "inactive")
            .iter()
            .any(|v| v == "true")
        {
            return Ok(true);
        }
        Ok(self
            .property_strings(node, "status")
            .iter()
            .any(|v| v == "retired" || v == "inactive"))
    }

    async fn is_deprecated(&self, context: &ConceptHandle) -> Result<bool> {
        let node = self.node(context)?;
        Ok(self
            .property_strings(node, "status")
            .iter()
            .any(|v| v == "deprecated" || v == "retired")
            || self.resource.status == PublicationStatus::Retired)
    }

    async fn status(&self, context: &ConceptHandle) -> Result<Option<String>> {
        let node = self.node(context)?;
        Ok(self.property_strings(node, "status").into_iter().next())
    }

    async fn item_weight(&self, context: &ConceptHandle) -> Result<Option<f64>> {
        let node = self.node(context)?;
        Ok(self
            .merged_properties(node)
            .iter()
            .filter(|(code, _)| code == "itemWeight")
            .find_map(|(_, value)| value.get("valueDecimal").and_then(|v| v.as_f64())))
    }

    async fn properties(&self, context: &ConceptHandle) -> Result<Vec<ConceptProperty>> {
        let node = self.node(context)?;
        let mut properties: Vec<ConceptProperty> = self
            .merged_properties(node)
            .into_iter()
            .map(|(code, value)| ConceptProperty { code, value })
            .collect();
        if let Some(definition) = &node.definition {
            properties.push(ConceptProperty::string("definition", definition.clone()));
        }
        Ok(properties)
    }

    async fn parent(&self, code: &str) -> Result<Option<String>> {
        let Some(index) = self.find(code) else {
            return Err(Error::NotFound(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                code, self.resource.url
            )));
        };
        Ok(self.nodes[index]
            .parents
            .first()
            .map(|&parent| self.nodes[parent].code.clone()))
    }

    fn same_concept(&self, a: &str, b: &str) -> bool {
        normalize(a, self.case_sensitive()) == normalize(b, self.case_sensitive())
    }

    async fn locate_is_a(&self, code: &str, parent: &str, disallow_self: bool) -> Result<Located> {
        let Some(child_index) = self.find(code) else {
            return Ok(Located::not_found(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                code, self.resource.url
            )));
        };
        let Some(parent_index) = self.find(parent) else {
            return Ok(Located::not_found(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                parent, self.resource.url
            )));
        };

        if child_index == parent_index {
            return if disallow_self {
                Ok(Located::not_found(format!(
                    "Code '{}' is not a proper descendant of '{}'",
                    code, parent
                )))
            } else {
                Ok(Located::Found(self.handle(child_index)))
            };
        }

        if self.is_ancestor(parent_index, child_index) {
            Ok(Located::Found(self.handle(child_index)))
        } else {
            Ok(Located::not_found(format!(
                "Code '{}' is not a descendant of '{}'",
                code, parent
            )))
        }
    }

    async fn subsumes_test(&self, a: &str, b: &str) -> Result<SubsumptionOutcome> {
        let Some(index_a) = self.find(a) else {
            return Err(Error::NotFound(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                a, self.resource.url
            )));
        };
        let Some(index_b) = self.find(b) else {
            return Err(Error::NotFound(format!(
                "Unknown code '{}' in CodeSystem '{}'",
                b, self.resource.url
            )));
        };

        Ok(if index_a == index_b {
            SubsumptionOutcome::Equivalent
        } else if self.is_ancestor(index_a, index_b) {
            SubsumptionOutcome::Subsumes
        } else if self.is_ancestor(index_b, index_a) {
            SubsumptionOutcome::SubsumedBy
        } else {
            SubsumptionOutcome::NotSubsumed
        })
    }

    async fn iterator(&self, context: Option<&ConceptHandle>) -> Result<ConceptCursor> {
        let indices = match context {
            None => self.roots.clone(),
            Some(handle) => {
                let data: &FhirConceptData = downcast_handle(handle, TAG)?;
                self.nodes[data.index].children.clone()
            }
        };
        Ok(ConceptCursor::new(self.codes(indices)))
    }

    async fn iterator_all(&self) -> Result<ConceptCursor> {
        Ok(ConceptCursor::new(self.codes(self.preorder.clone())))
    }

    fn does_filter(&self, property: &str, op: FilterOperator, _value: &str) -> bool {
        match (property, op) {
            ("concept" | "code", FilterOperator::IsA)
            | ("concept" | "code", FilterOperator::IsNotA)
            | ("concept" | "code", FilterOperator::DescendentOf) => true,
            ("code", FilterOperator::Equal)
            | ("code", FilterOperator::In)
            | ("code", FilterOperator::Regex) => true,
            ("child", FilterOperator::Exists) => true,
            (_, FilterOperator::Equal)
            | (_, FilterOperator::In)
            | (_, FilterOperator::NotIn)
            | (_, FilterOperator::Regex) => true,
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
                property, op, value, self.resource.url
            )));
        }

        match (property, op) {
            ("concept" | "code", FilterOperator::IsA) => {
                let Some(root) = self.find(value) else {
                    return Ok(ConceptFilter::closed(Vec::new()));
                };
                Ok(ConceptFilter::closed(
                    self.codes(self.self_and_descendants(root)),
                ))
            }
            ("concept" | "code", FilterOperator::DescendentOf) => {
                let Some(root) = self.find(value) else {
                    return Ok(ConceptFilter::closed(Vec::new()));
                };
                let mut indices = self.self_and_descendants(root);
                indices.retain(|&i| i != root);
                Ok(ConceptFilter::closed(self.codes(indices)))
            }
            ("concept" | "code", FilterOperator::IsNotA) => {
                let excluded: HashSet<usize> = match self.find(value) {
                    Some(root) => self.self_and_descendants(root).into_iter().collect(),
                    None => HashSet::new(),
                };
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder.iter().copied().filter(|i| !excluded.contains(i)),
                )))
            }
            ("code", FilterOperator::Equal) => Ok(ConceptFilter::closed(
                self.find(value)
                    .map(|i| vec![self.nodes[i].code.clone()])
                    .unwrap_or_default(),
            )),
            ("code", FilterOperator::In) => Ok(ConceptFilter::closed(
                value
                    .split(',')
                    .map(str::trim)
                    .filter_map(|code| self.find(code))
                    .map(|i| self.nodes[i].code.clone())
                    .collect(),
            )),
            ("code", FilterOperator::Regex) => {
                let regex = regex::Regex::new(value).map_err(|e| {
                    Error::Validation(format!("Invalid regex pattern '{}': {}", value, e))
                })?;
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder
                        .iter()
                        .copied()
                        .filter(|&i| regex.is_match(&self.nodes[i].code)),
                )))
            }
            ("child", FilterOperator::Exists) => {
                let want_children = value == "true";
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder
                        .iter()
                        .copied()
                        .filter(|&i| self.nodes[i].children.is_empty() != want_children),
                )))
            }
            (property, FilterOperator::Equal) => Ok(ConceptFilter::closed(self.codes(
                self.preorder.iter().copied().filter(|&i| {
                    self.property_strings(&self.nodes[i], property)
                        .iter()
                        .any(|v| v == value)
                }),
            ))),
            (property, FilterOperator::In) => {
                let wanted: HashSet<&str> = value.split(',').map(str::trim).collect();
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder.iter().copied().filter(|&i| {
                        self.property_strings(&self.nodes[i], property)
                            .iter()
                            .any(|v| wanted.contains(v.as_str()))
                    }),
                )))
            }
            (property, FilterOperator::NotIn) => {
                let unwanted: HashSet<&str> = value.split(',').map(str::trim).collect();
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder.iter().copied().filter(|&i| {
                        !self
                            .property_strings(&self.nodes[i], property)
                            .iter()
                            .any(|v| unwanted.contains(v.as_str()))
                    }),
                )))
            }
            (property, FilterOperator::Regex) => {
                let regex = regex::Regex::new(value).map_err(|e| {
                    Error::Validation(format!("Invalid regex pattern '{}': {}", value, e))
                })?;
                Ok(ConceptFilter::closed(self.codes(
                    self.preorder.iter().copied().filter(|&i| {
                        self.property_strings(&self.nodes[i], property)
                            .iter()
                            .any(|v| regex.is_match(v))
                    }),
                )))
            }
            _ => unreachable!("does_filter gated"),
        }
    }
}
