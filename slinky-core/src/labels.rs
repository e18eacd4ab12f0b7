//! Label selector evaluation.
//!
//! Mirrors apimachinery's selector semantics for the subset of operators a
//! `LabelSelector` can express: `matchLabels` entries are ANDed with every
//! `matchExpressions` requirement.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// True if the selector selects nothing in particular, i.e. it would match
/// every pod in the namespace. Empty selectors are refused by the controller
/// as a safety measure.
pub fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, BTreeMap::is_empty)
        && selector.match_expressions.as_ref().map_or(true, Vec::is_empty)
}

/// Evaluate the selector against a label set.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for requirement in expressions {
            if !requirement_matches(requirement, labels) {
                return false;
            }
        }
    }
    true
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|want| want == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|want| want == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        // Unknown operators match nothing rather than everything.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: operator.into(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_empty_selector_detection() {
        assert!(selector_is_empty(&LabelSelector::default()));
        let selector = LabelSelector {
            match_labels: Some(labels(&[("foo", "bar")])),
            ..Default::default()
        };
        assert!(!selector_is_empty(&selector));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("foo", "bar")])),
            ..Default::default()
        };
        assert!(selector_matches(&selector, &labels(&[("foo", "bar"), ("extra", "ok")])));
        assert!(!selector_matches(&selector, &labels(&[("foo", "baz")])));
        assert!(!selector_matches(&selector, &labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                requirement("tier", "In", &["worker", "compute"]),
                requirement("excluded", "DoesNotExist", &[]),
            ]),
            ..Default::default()
        };
        assert!(selector_matches(&selector, &labels(&[("tier", "worker")])));
        assert!(!selector_matches(&selector, &labels(&[("tier", "frontend")])));
        assert!(!selector_matches(
            &selector,
            &labels(&[("tier", "worker"), ("excluded", "yes")]),
        ));
    }

    #[test]
    fn test_unknown_operator_matches_nothing() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("foo", "GreaterThan", &["1"])]),
            ..Default::default()
        };
        assert!(!selector_matches(&selector, &labels(&[("foo", "2")])));
    }
}
