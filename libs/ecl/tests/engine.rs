//! End-to-end tests for the ECL engine against an in-memory concept graph.

use argentum_ecl::{
    check, evaluate, parse, validate_semantics, validate_terms, ConstraintOperator, EclNode,
    Error, EvalOptions, Result, SnomedStore,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Small fixed concept graph:
///
/// ```text
/// 138875005 (root)
///   └─ 404684003 |Clinical finding|
///        ├─ 22298006 |Myocardial infarction|
///        │    └─ 57054005 |Acute myocardial infarction|
///        └─ 195967001 |Asthma|
///   └─ 123037004 |Body structure|
///        └─ 80891009 |Heart structure|
///   └─ 410662002 |Concept model attribute|
///        └─ 363698007 |Finding site|
/// ```
#[derive(Default)]
struct MemoryStore {
    parents: BTreeMap<&'static str, Vec<&'static str>>,
    descriptions: BTreeMap<&'static str, Vec<&'static str>>,
    relationships: BTreeMap<&'static str, Vec<(&'static str, &'static str)>>,
    refsets: BTreeMap<&'static str, Vec<&'static str>>,
}

fn store() -> MemoryStore {
    let mut s = MemoryStore::default();
    s.parents.insert("404684003", vec!["138875005"]);
    s.parents.insert("123037004", vec!["138875005"]);
    s.parents.insert("410662002", vec!["138875005"]);
    s.parents.insert("22298006", vec!["404684003"]);
    s.parents.insert("195967001", vec!["404684003"]);
    s.parents.insert("57054005", vec!["22298006"]);
    s.parents.insert("80891009", vec!["123037004"]);
    s.parents.insert("363698007", vec!["410662002"]);
    s.descriptions.insert("404684003", vec!["Clinical finding", "Clinical finding (finding)"]);
    s.descriptions.insert("22298006", vec!["Myocardial infarction"]);
    s.descriptions.insert("57054005", vec!["Acute myocardial infarction"]);
    s.relationships.insert("22298006", vec![("363698007", "80891009")]);
    s.relationships.insert("57054005", vec![("363698007", "80891009")]);
    s.refsets.insert("700043003", vec!["22298006", "195967001"]);
    s
}

impl MemoryStore {
    fn all(&self) -> BTreeSet<String> {
        let mut all: BTreeSet<String> = self.parents.keys().map(|k| k.to_string()).collect();
        all.insert("138875005".to_string());
        all
    }
}

#[async_trait]
impl SnomedStore for MemoryStore {
    async fn concept_exists(&self, sctid: &str) -> Result<bool> {
        Ok(self.all().contains(sctid))
    }

    async fn children_of(&self, sctid: &str) -> Result<Vec<String>> {
        Ok(self
            .parents
            .iter()
            .filter(|(_, parents)| parents.iter().any(|p| *p == sctid))
            .map(|(child, _)| child.to_string())
            .collect())
    }

    async fn parents_of(&self, sctid: &str) -> Result<Vec<String>> {
        Ok(self
            .parents
            .get(sctid)
            .map(|v| v.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default())
    }

    async fn descendants_of(&self, sctid: &str) -> Result<Vec<String>> {
        let mut result = Vec::new();
        let mut stack = self.children_of(sctid).await?;
        while let Some(concept) = stack.pop() {
            stack.extend(self.children_of(&concept).await?);
            result.push(concept);
        }
        Ok(result)
    }

    async fn ancestors_of(&self, sctid: &str) -> Result<Vec<String>> {
        let mut result = Vec::new();
        let mut stack = self.parents_of(sctid).await?;
        while let Some(concept) = stack.pop() {
            stack.extend(self.parents_of(&concept).await?);
            result.push(concept);
        }
        Ok(result)
    }

    async fn is_descendant_of(&self, descendant: &str, ancestor: &str) -> Result<bool> {
        Ok(self
            .ancestors_of(descendant)
            .await?
            .contains(&ancestor.to_string()))
    }

    async fn refset_members(&self, refset: &str) -> Result<Vec<String>> {
        Ok(self
            .refsets
            .get(refset)
            .map(|v| v.iter().map(|m| m.to_string()).collect())
            .unwrap_or_default())
    }

    async fn active_descriptions(&self, sctid: &str) -> Result<Vec<String>> {
        Ok(self
            .descriptions
            .get(sctid)
            .map(|v| v.iter().map(|d| d.to_string()).collect())
            .unwrap_or_default())
    }

    async fn relationships_of(&self, sctid: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .relationships
            .get(sctid)
            .map(|v| {
                v.iter()
                    .map(|(a, t)| (a.to_string(), t.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn concrete_values(&self, _sctid: &str, _attribute: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn attribute_domains(&self, attribute: &str) -> Result<Vec<String>> {
        Ok(match attribute {
            "363698007" => vec!["404684003".to_string()],
            _ => Vec::new(),
        })
    }

    async fn attribute_ranges(&self, attribute: &str) -> Result<Vec<String>> {
        Ok(match attribute {
            "363698007" => vec!["123037004".to_string()],
            _ => Vec::new(),
        })
    }

    async fn all_concepts(&self, cap: usize) -> Result<Option<Vec<String>>> {
        let all = self.all();
        if all.len() > cap {
            return Ok(None);
        }
        Ok(Some(all.into_iter().collect()))
    }
}

async fn eval(input: &str) -> Vec<String> {
    let store = store();
    let ast = parse(input).unwrap();
    evaluate(&ast, &store, &EvalOptions::default()).await.unwrap()
}

#[tokio::test]
async fn descendant_or_self_includes_focus() {
    let result = eval("<< 404684003 |Clinical finding|").await;
    assert_eq!(result, vec!["195967001", "22298006", "404684003", "57054005"]);
}

#[tokio::test]
async fn descendants_exclude_focus() {
    let result = eval("< 404684003").await;
    assert_eq!(result, vec!["195967001", "22298006", "57054005"]);
}

#[tokio::test]
async fn direct_children_are_single_step() {
    let result = eval("<! 404684003").await;
    assert_eq!(result, vec!["195967001", "22298006"]);
}

#[tokio::test]
async fn ancestors_and_parents() {
    assert_eq!(eval("> 57054005").await, vec!["138875005", "22298006", "404684003"]);
    assert_eq!(eval(">! 57054005").await, vec!["22298006"]);
    assert_eq!(
        eval(">> 57054005").await,
        vec!["138875005", "22298006", "404684003", "57054005"]
    );
}

#[tokio::test]
async fn member_of_reads_refset() {
    assert_eq!(eval("^ 700043003").await, vec!["195967001", "22298006"]);
}

#[tokio::test]
async fn boolean_composition() {
    assert_eq!(eval("<< 404684003 AND ^ 700043003").await, vec!["195967001", "22298006"]);
    assert_eq!(
        eval("<< 404684003 MINUS ^ 700043003").await,
        vec!["404684003", "57054005"]
    );
    assert_eq!(
        eval("195967001 OR 57054005").await,
        vec!["195967001", "57054005"]
    );
}

#[tokio::test]
async fn refinement_filters_by_attribute() {
    let result = eval("<< 404684003 : 363698007 = << 123037004").await;
    assert_eq!(result, vec!["22298006", "57054005"]);
}

#[tokio::test]
async fn refinement_with_wildcard_attribute_name() {
    let result = eval("<< 404684003 : * = 80891009").await;
    assert_eq!(result, vec!["22298006", "57054005"]);
}

#[tokio::test]
async fn dotted_projects_attribute_targets() {
    let result = eval("<< 22298006 . 363698007").await;
    assert_eq!(result, vec!["80891009"]);
}

#[tokio::test]
async fn wildcard_respects_cap() {
    let store = store();
    let ast = parse("*").unwrap();
    let err = evaluate(&ast, &store, &EvalOptions { wildcard_cap: 3 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooManyResults(3)));

    let all = evaluate(&ast, &store, &EvalOptions::default()).await.unwrap();
    assert_eq!(all.len(), 9);
}

#[tokio::test]
async fn unknown_concept_fails_evaluation() {
    let store = store();
    let ast = parse("999999999").unwrap();
    let err = evaluate(&ast, &store, &EvalOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown concept"));
}

#[tokio::test]
async fn term_validation_accepts_matching_and_rejects_wrong_terms() {
    let store = store();

    let ast = parse("<< 404684003 |Clinical finding|").unwrap();
    assert!(validate_terms(&ast, &store).await.unwrap().is_empty());

    let ast = parse("22298006 |Wrong term here|").unwrap();
    let errors = validate_terms(&ast, &store).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("does not match any active description for concept 22298006"));
    assert!(errors[0].contains("Expected term like 'Myocardial infarction'"));
}

#[tokio::test]
async fn semantic_validation_checks_attribute_type_domain_and_range() {
    let store = store();

    // valid: finding site on clinical findings with body-structure value
    let ast = parse("<< 404684003 : 363698007 = << 123037004").unwrap();
    assert!(validate_semantics(&ast, &store).await.unwrap().is_empty());

    // 22298006 is not a concept model attribute
    let ast = parse("<< 404684003 : 22298006 = 80891009").unwrap();
    let errors = validate_semantics(&ast, &store).await.unwrap();
    assert!(errors.iter().any(|e| e.contains("not a concept model attribute")));

    // body structures are outside the declared domain of finding site
    let ast = parse("<< 123037004 : 363698007 = 80891009").unwrap();
    let errors = validate_semantics(&ast, &store).await.unwrap();
    assert!(errors.iter().any(|e| e.contains("outside the domain")));

    // a clinical finding is outside the declared range of finding site
    let ast = parse("<< 404684003 : 363698007 = 195967001").unwrap();
    let errors = validate_semantics(&ast, &store).await.unwrap();
    assert!(errors.iter().any(|e| e.contains("outside the range")));
}

#[tokio::test]
async fn parse_outcome_shape_matches_scenarios() {
    let outcome = check("<< 404684003 |Clinical finding|");
    assert!(outcome.success);
    match outcome.ast.unwrap() {
        EclNode::SubExpressionConstraint { operator, .. } => {
            assert_eq!(operator, Some(ConstraintOperator::ChildOrSelfOf));
        }
        other => panic!("unexpected root {other:?}"),
    }

    let outcome = check("404684003 |");
    assert!(!outcome.success);
    assert!(!outcome.errors.is_empty());
}
