//! Evaluation of expression constraints against a [`SnomedStore`].
//!
//! Evaluation is set-based: every node yields an ordered set of concept
//! ids. Ordering is deterministic (ascending id string) so expansions built
//! on top of the evaluator reproduce byte-identically.

use crate::ast::*;
use crate::error::{Error, Result};
use crate::store::SnomedStore;
use std::collections::BTreeSet;

/// Evaluation options
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Cap on wildcard materialization; exceeding it fails the evaluation
    /// rather than streaming an unbounded set.
    pub wildcard_cap: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self { wildcard_cap: 1000 }
    }
}

/// Evaluate a parsed expression constraint, yielding matching concept ids in
/// ascending order.
pub async fn evaluate(
    ast: &EclNode,
    store: &dyn SnomedStore,
    options: &EvalOptions,
) -> Result<Vec<String>> {
    let set = eval(ast, store, options).await?;
    Ok(set.into_iter().collect())
}

fn eval<'a>(
    node: &'a EclNode,
    store: &'a dyn SnomedStore,
    options: &'a EvalOptions,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<BTreeSet<String>>> + Send + 'a>> {
    Box::pin(async move {
        match node {
            EclNode::ConceptReference(reference) => {
                if !store.concept_exists(&reference.sctid).await? {
                    return Err(Error::EvaluationError(format!(
                        "Unknown concept {}",
                        reference.sctid
                    )));
                }
                Ok(BTreeSet::from([reference.sctid.clone()]))
            }

            EclNode::Wildcard => match store.all_concepts(options.wildcard_cap).await? {
                Some(all) => Ok(all.into_iter().collect()),
                None => Err(Error::TooManyResults(options.wildcard_cap)),
            },

            EclNode::MemberOf { expression } => {
                let refsets = eval(expression, store, options).await?;
                let mut members = BTreeSet::new();
                for refset in refsets {
                    members.extend(store.refset_members(&refset).await?);
                }
                Ok(members)
            }

            EclNode::SubExpressionConstraint { operator, focus } => {
                let focus_set = eval(focus, store, options).await?;
                let Some(operator) = operator else {
                    return Ok(focus_set);
                };
                apply_operator(*operator, focus_set, store).await
            }

            EclNode::CompoundExpressionConstraint { operator, operands } => {
                let mut iter = operands.iter();
                let first = iter
                    .next()
                    .ok_or_else(|| Error::EvaluationError("empty compound".into()))?;
                let mut set = eval(first, store, options).await?;
                for operand in iter {
                    let right = eval(operand, store, options).await?;
                    set = match operator {
                        CompoundOperator::Conjunction => {
                            set.intersection(&right).cloned().collect()
                        }
                        CompoundOperator::Disjunction => set.union(&right).cloned().collect(),
                        CompoundOperator::Exclusion => {
                            set.difference(&right).cloned().collect()
                        }
                    };
                }
                Ok(set)
            }

            EclNode::RefinedExpressionConstraint {
                subject,
                refinement,
            } => {
                let candidates = eval(subject, store, options).await?;
                let mut result = BTreeSet::new();
                'candidate: for candidate in candidates {
                    for item in &refinement.items {
                        if !satisfies_item(&candidate, item, store, options).await? {
                            continue 'candidate;
                        }
                    }
                    result.insert(candidate);
                }
                Ok(result)
            }

            EclNode::DottedExpressionConstraint {
                subject,
                attributes,
            } => {
                let mut current = eval(subject, store, options).await?;
                for attribute in attributes {
                    let mut projected = BTreeSet::new();
                    for concept in &current {
                        for (relationship, target) in store.relationships_of(concept).await? {
                            if relationship == attribute.sctid {
                                projected.insert(target);
                            }
                        }
                    }
                    current = projected;
                }
                Ok(current)
            }
        }
    })
}

async fn apply_operator(
    operator: ConstraintOperator,
    focus: BTreeSet<String>,
    store: &dyn SnomedStore,
) -> Result<BTreeSet<String>> {
    let include_self = matches!(
        operator,
        ConstraintOperator::ChildOrSelfOf
            | ConstraintOperator::DirectChildOrSelfOf
            | ConstraintOperator::ParentOrSelfOf
            | ConstraintOperator::DirectParentOrSelfOf
    );

    let mut result = BTreeSet::new();
    for concept in &focus {
        let related = match operator {
            ConstraintOperator::ChildOf | ConstraintOperator::ChildOrSelfOf => {
                store.descendants_of(concept).await?
            }
            ConstraintOperator::DirectChildOf | ConstraintOperator::DirectChildOrSelfOf => {
                store.children_of(concept).await?
            }
            ConstraintOperator::ParentOf | ConstraintOperator::ParentOrSelfOf => {
                store.ancestors_of(concept).await?
            }
            ConstraintOperator::DirectParentOf | ConstraintOperator::DirectParentOrSelfOf => {
                store.parents_of(concept).await?
            }
        };
        result.extend(related);
    }
    if include_self {
        result.extend(focus);
    }
    Ok(result)
}

async fn satisfies_item(
    candidate: &str,
    item: &RefinementItem,
    store: &dyn SnomedStore,
    options: &EvalOptions,
) -> Result<bool> {
    match item {
        RefinementItem::Attribute(attribute) => {
            satisfies_attribute(candidate, attribute, store, options).await
        }
        // relationship-group boundaries are not tracked by the store
        // surface; a group behaves as the conjunction of its attributes
        RefinementItem::Group { attributes, .. } => {
            for attribute in attributes {
                if !satisfies_attribute(candidate, attribute, store, options).await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

async fn satisfies_attribute(
    candidate: &str,
    attribute: &Attribute,
    store: &dyn SnomedStore,
    options: &EvalOptions,
) -> Result<bool> {
    // the attribute-name constraint resolves to the set of acceptable
    // relationship types; a bare wildcard accepts any type
    let name_set = match attribute.name.as_ref() {
        EclNode::Wildcard => None,
        name => Some(eval(name, store, options).await?),
    };

    if attribute.reverse {
        // R attr: the candidate must be the VALUE of the attribute on some
        // concept in the value set
        let AttributeValue::Expression(value) = &attribute.value else {
            return Err(Error::EvaluationError(
                "reverse attributes require a concept value".into(),
            ));
        };
        let sources = eval(value, store, options).await?;
        let mut count = 0usize;
        for source in &sources {
            for (relationship, target) in store.relationships_of(source).await? {
                let name_ok = name_set
                    .as_ref()
                    .map_or(true, |names| names.contains(&relationship));
                if name_ok && target == candidate {
                    count += 1;
                }
            }
        }
        return Ok(match &attribute.cardinality {
            Some(cardinality) => cardinality.allows(count),
            None => count > 0,
        });
    }

    match &attribute.value {
        AttributeValue::Expression(value) => {
            let value_set = eval(value, store, options).await?;
            let mut count = 0usize;
            for (relationship, target) in store.relationships_of(candidate).await? {
                let name_ok = name_set
                    .as_ref()
                    .map_or(true, |names| names.contains(&relationship));
                if name_ok && value_set.contains(&target) {
                    count += 1;
                }
            }
            let matched = match attribute.op {
                ComparisonOperator::Equal => count > 0,
                ComparisonOperator::NotEqual => {
                    // at least one relationship of the type exists with a
                    // value outside the set
                    let mut outside = false;
                    for (relationship, target) in store.relationships_of(candidate).await? {
                        let name_ok = name_set
                            .as_ref()
                            .map_or(true, |names| names.contains(&relationship));
                        if name_ok && !value_set.contains(&target) {
                            outside = true;
                            break;
                        }
                    }
                    outside
                }
                _ => {
                    return Err(Error::EvaluationError(
                        "ordering comparisons require a numeric value".into(),
                    ))
                }
            };
            Ok(match &attribute.cardinality {
                Some(cardinality) if attribute.op == ComparisonOperator::Equal => {
                    cardinality.allows(count)
                }
                _ => matched,
            })
        }

        AttributeValue::Integer(_) | AttributeValue::Decimal(_) | AttributeValue::Str(_) => {
            let Some(names) = &name_set else {
                return Err(Error::EvaluationError(
                    "concrete comparisons require a named attribute".into(),
                ));
            };
            for name in names {
                for concrete in store.concrete_values(candidate, name).await? {
                    if concrete_matches(&concrete, attribute.op, &attribute.value) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
    }
}

fn concrete_matches(stored: &str, op: ComparisonOperator, value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Str(expected) => match op {
            ComparisonOperator::Equal => stored == expected,
            ComparisonOperator::NotEqual => stored != expected,
            _ => false,
        },
        AttributeValue::Integer(expected) => {
            numeric_matches(stored, op, *expected as f64)
        }
        AttributeValue::Decimal(expected) => numeric_matches(stored, op, *expected),
        AttributeValue::Expression(_) => false,
    }
}

fn numeric_matches(stored: &str, op: ComparisonOperator, expected: f64) -> bool {
    let Ok(actual) = stored.parse::<f64>() else {
        return false;
    };
    match op {
        ComparisonOperator::Equal => actual == expected,
        ComparisonOperator::NotEqual => actual != expected,
        ComparisonOperator::LessThan => actual < expected,
        ComparisonOperator::GreaterThan => actual > expected,
        ComparisonOperator::LessThanOrEqual => actual <= expected,
        ComparisonOperator::GreaterThanOrEqual => actual >= expected,
    }
}
