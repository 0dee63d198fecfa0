//! Term and semantic validation of parsed expression constraints.
//!
//! Both phases are optional and independent of evaluation, so untrusted
//! input can be evaluated without paying for validation, and authoring
//! tools can validate without evaluating.

use crate::ast::*;
use crate::error::Result;
use crate::store::{SnomedStore, CONCEPT_MODEL_ATTRIBUTE};

/// Check every `|term|` annotation against the active descriptions of its
/// concept. Returns the accumulated problems; empty means valid.
pub async fn validate_terms(ast: &EclNode, store: &dyn SnomedStore) -> Result<Vec<String>> {
    let mut references = Vec::new();
    ast.walk_concept_references(&mut |reference| {
        if reference.term.is_some() {
            references.push(reference.clone());
        }
    });

    let mut errors = Vec::new();
    for reference in references {
        let term = reference.term.as_deref().unwrap_or_default();
        let descriptions = store.active_descriptions(&reference.sctid).await?;
        if descriptions.iter().any(|d| d.eq_ignore_ascii_case(term)) {
            continue;
        }
        let expected = descriptions
            .first()
            .map(|d| format!(" Expected term like '{}'.", d))
            .unwrap_or_default();
        errors.push(format!(
            "Term '{}' does not match any active description for concept {}.{}",
            term, reference.sctid, expected
        ));
    }
    Ok(errors)
}

/// Validate attribute usage: every attribute name must be a concept-model
/// attribute, focus concepts must be inside the attribute's declared domain,
/// and value concepts inside its declared range.
///
/// Checks are independent and all failures accumulate. Wildcard names,
/// focuses and values skip their respective checks.
pub async fn validate_semantics(ast: &EclNode, store: &dyn SnomedStore) -> Result<Vec<String>> {
    let mut errors = Vec::new();
    walk(ast, store, &mut errors).await?;
    Ok(errors)
}

fn walk<'a>(
    node: &'a EclNode,
    store: &'a dyn SnomedStore,
    errors: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match node {
            EclNode::ConceptReference(_) | EclNode::Wildcard => {}
            EclNode::MemberOf { expression } => walk(expression, store, errors).await?,
            EclNode::SubExpressionConstraint { focus, .. } => walk(focus, store, errors).await?,
            EclNode::CompoundExpressionConstraint { operands, .. } => {
                for operand in operands {
                    walk(operand, store, errors).await?;
                }
            }
            EclNode::DottedExpressionConstraint { subject, .. } => {
                walk(subject, store, errors).await?
            }
            EclNode::RefinedExpressionConstraint {
                subject,
                refinement,
            } => {
                walk(subject, store, errors).await?;

                let focus_ids = concept_ids(subject);
                for item in &refinement.items {
                    let attributes = match item {
                        RefinementItem::Group { attributes, .. } => attributes.as_slice(),
                        RefinementItem::Attribute(attribute) => std::slice::from_ref(attribute),
                    };
                    for attribute in attributes {
                        validate_attribute(attribute, &focus_ids, store, errors).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

async fn validate_attribute(
    attribute: &Attribute,
    focus_ids: &[String],
    store: &dyn SnomedStore,
    errors: &mut Vec<String>,
) -> Result<()> {
    let name_ids = concept_ids(&attribute.name);

    for name in &name_ids {
        // attribute type check: must live under the concept-model attribute root
        if !store.is_descendant_of(name, CONCEPT_MODEL_ATTRIBUTE).await? {
            errors.push(format!(
                "Concept {} is not a concept model attribute",
                name
            ));
            continue;
        }

        // domain check
        let domains = store.attribute_domains(name).await?;
        if !domains.is_empty() {
            for focus in focus_ids {
                let mut in_domain = false;
                for domain in &domains {
                    if focus == domain || store.is_descendant_of(focus, domain).await? {
                        in_domain = true;
                        break;
                    }
                }
                if !in_domain {
                    errors.push(format!(
                        "Concept {} is outside the domain of attribute {}",
                        focus, name
                    ));
                }
            }
        }

        // range check
        let ranges = store.attribute_ranges(name).await?;
        if !ranges.is_empty() {
            if let AttributeValue::Expression(value) = &attribute.value {
                for value_id in concept_ids(value) {
                    let mut in_range = false;
                    for range in &ranges {
                        if &value_id == range || store.is_descendant_of(&value_id, range).await? {
                            in_range = true;
                            break;
                        }
                    }
                    if !in_range {
                        errors.push(format!(
                            "Concept {} is outside the range of attribute {}",
                            value_id, name
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Concept ids mentioned directly by a node (wildcards contribute nothing).
fn concept_ids(node: &EclNode) -> Vec<String> {
    let mut ids = Vec::new();
    node.walk_concept_references(&mut |reference| ids.push(reference.sctid.clone()));
    ids
}
