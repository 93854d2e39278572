//! Label selector algebra and the reverse-index key extraction the
//! controller uses to re-enqueue deployments on device events (spec.md
//! §4.1).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel reverse-index key under which a universal (empty) selector is
/// indexed, so it's still probed on every device add/remove (spec.md §4.1
/// edge case, §9 Open Question — this is the implementer-mandated fix, not a
/// guess).
pub const UNIVERSAL_SELECTOR_KEY: &str = "__all__";

/// Does `labels` satisfy `selector`? Supports match-labels (implicit `In`)
/// and `In`/`NotIn`/`Exists`/`DoesNotExist` match-expressions, all ANDed.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            if !matches_expression(expr, labels) {
                return false;
            }
        }
    }
    true
}

fn matches_expression(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values: BTreeSet<&str> = expr.values.as_deref().unwrap_or(&[]).iter().map(|s| s.as_str()).collect();
    match expr.operator.as_str() {
        "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v.as_str())),
        "NotIn" => !labels.get(&expr.key).is_some_and(|v| values.contains(v.as_str())),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}

/// Is this selector empty (matches every device)?
pub fn is_universal(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
        && selector.match_expressions.as_ref().is_none_or(|e| e.is_empty())
}

/// The set of label keys this selector is sensitive to, used to build the
/// controller's reverse field index. An empty/universal selector maps to
/// [`UNIVERSAL_SELECTOR_KEY`] instead of an empty set, so it's never
/// silently dropped from the index (spec.md §4.1 edge case).
pub fn index_keys(selector: &LabelSelector) -> BTreeSet<String> {
    if is_universal(selector) {
        return BTreeSet::from([UNIVERSAL_SELECTOR_KEY.to_string()]);
    }
    let mut keys = BTreeSet::new();
    if let Some(match_labels) = &selector.match_labels {
        keys.extend(match_labels.keys().cloned());
    }
    if let Some(exprs) = &selector.match_expressions {
        keys.extend(exprs.iter().map(|e| e.key.clone()));
    }
    keys
}

/// Reverse-index keys to probe for a device event: every label key the
/// device carries, plus the universal sentinel (always probed).
pub fn probe_keys_for_device(device_labels: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut keys: BTreeSet<String> = device_labels.keys().cloned().collect();
    keys.insert(UNIVERSAL_SELECTOR_KEY.to_string());
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn match_labels_all_must_match() {
        let selector = LabelSelector {
            match_labels: Some(
                [("role".to_string(), "tor".to_string())].into_iter().collect(),
            ),
            match_expressions: None,
        };
        assert!(matches(&selector, &labels(&[("role", "tor"), ("rack", "a1")])));
        assert!(!matches(&selector, &labels(&[("role", "leaf")])));
    }

    #[test]
    fn in_operator() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "role".into(),
                operator: "In".into(),
                values: Some(vec!["tor".into(), "leaf".into()]),
            }]),
        };
        assert!(matches(&selector, &labels(&[("role", "leaf")])));
        assert!(!matches(&selector, &labels(&[("role", "spine")])));
    }

    #[test]
    fn not_in_operator() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "role".into(),
                operator: "NotIn".into(),
                values: Some(vec!["spine".into()]),
            }]),
        };
        assert!(matches(&selector, &labels(&[("role", "tor")])));
        assert!(!matches(&selector, &labels(&[("role", "spine")])));
    }

    #[test]
    fn exists_and_does_not_exist() {
        let exists = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "rack".into(),
                operator: "Exists".into(),
                values: None,
            }]),
        };
        assert!(matches(&exists, &labels(&[("rack", "a1")])));
        assert!(!matches(&exists, &labels(&[])));

        let absent = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "rack".into(),
                operator: "DoesNotExist".into(),
                values: None,
            }]),
        };
        assert!(matches(&absent, &labels(&[])));
        assert!(!matches(&absent, &labels(&[("rack", "a1")])));
    }

    #[test]
    fn empty_selector_is_universal_and_matches_everything() {
        let selector = LabelSelector::default();
        assert!(is_universal(&selector));
        assert!(matches(&selector, &labels(&[])));
        assert!(matches(&selector, &labels(&[("role", "tor")])));
    }

    #[test]
    fn universal_selector_indexes_under_sentinel() {
        let selector = LabelSelector::default();
        let keys = index_keys(&selector);
        assert_eq!(keys, BTreeSet::from([UNIVERSAL_SELECTOR_KEY.to_string()]));
    }

    #[test]
    fn non_universal_selector_indexes_its_keys() {
        let selector = LabelSelector {
            match_labels: Some([("role".to_string(), "tor".to_string())].into_iter().collect()),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "rack".into(),
                operator: "Exists".into(),
                values: None,
            }]),
        };
        let keys = index_keys(&selector);
        assert_eq!(keys, BTreeSet::from(["role".to_string(), "rack".to_string()]));
    }

    #[test]
    fn probe_keys_always_include_sentinel() {
        let keys = probe_keys_for_device(&labels(&[("role", "tor")]));
        assert!(keys.contains(UNIVERSAL_SELECTOR_KEY));
        assert!(keys.contains("role"));
    }
}
