use nostr::{Event, Kind};

use crate::events::tags::{get_tag_value, get_tags};

/// NIP-32 default namespace for labels published without an `L`
/// declaration.
const UGC_NAMESPACE: &str = "ugc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub namespace: Option<String>,
    pub value: String,
}

impl Label {
    fn normalized(&self) -> String {
        format!(
            "{}/{}",
            self.namespace.as_deref().unwrap_or(UGC_NAMESPACE),
            self.value
        )
    }
}

/// Labels attached to an event, from itself and from label events that
/// reference it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveLabelSet {
    pub self_labels: Vec<Label>,
    pub external: Vec<Label>,
    pub topics: Vec<String>,
    /// `namespace/value` entries, self first, then external, then
    /// `t/value` topics; first occurrence wins.
    pub normalized: Vec<String>,
}

/// `L` tags declare namespaces; each `l` tag is associated with the
/// namespace it names when that namespace is declared on the same event.
fn labels_of(event: &Event) -> Vec<Label> {
    let namespaces: Vec<String> = get_tags(event, "L")
        .iter()
        .filter_map(|t| t.as_slice().get(1).cloned())
        .collect();
    let mut labels = Vec::new();
    for tag in get_tags(event, "l") {
        let slice = tag.as_slice();
        let Some(value) = slice.get(1) else {
            continue;
        };
        let namespace = slice
            .get(2)
            .filter(|ns| namespaces.contains(ns))
            .cloned();
        let label = Label {
            namespace,
            value: value.clone(),
        };
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

fn references_target(label_event: &Event, target: &Event) -> bool {
    let id = target.id.to_hex();
    ["e", "E"].into_iter().any(|name| {
        get_tags(label_event, name)
            .iter()
            .any(|t| t.as_slice().get(1).is_some_and(|v| *v == id))
    }) || get_tag_value(label_event, "a").is_some_and(|addr| {
        target
            .tags
            .identifier()
            .is_some_and(|d| addr.ends_with(&format!(":{d}")))
    })
}

/// Merges an event's own labels, external label events referencing it and
/// its topic tags into one effective set.
pub fn effective_labels(event: &Event, label_events: &[Event]) -> EffectiveLabelSet {
    let self_labels = labels_of(event);
    let mut external = Vec::new();
    for label_event in label_events {
        if !label_event.kind.eq(&Kind::Label) {
            continue;
        }
        if !references_target(label_event, event) {
            continue;
        }
        for label in labels_of(label_event) {
            if !external.contains(&label) {
                external.push(label);
            }
        }
    }
    let topics: Vec<String> = get_tags(event, "t")
        .iter()
        .filter_map(|t| t.as_slice().get(1).cloned())
        .collect();

    let mut normalized = Vec::new();
    for label in self_labels.iter().chain(external.iter()) {
        let entry = label.normalized();
        if !normalized.contains(&entry) {
            normalized.push(entry);
        }
    }
    for topic in &topics {
        let entry = format!("t/{topic}");
        if !normalized.contains(&entry) {
            normalized.push(entry);
        }
    }

    EffectiveLabelSet {
        self_labels,
        external,
        topics,
        normalized,
    }
}

#[cfg(test)]
mod tests {
    use test_utils::{generate_issue_event_with_labels, generate_label_event};

    use super::*;

    #[test]
    fn self_labels_pair_values_with_declared_namespaces() {
        let event = generate_issue_event_with_labels(
            &["org.example.workflow"],
            &[("bug", Some("org.example.workflow")), ("orphan", None)],
            &[],
        );
        let set = effective_labels(&event, &[]);
        assert_eq!(set.self_labels.len(), 2);
        assert_eq!(
            set.self_labels[0],
            Label {
                namespace: Some("org.example.workflow".to_string()),
                value: "bug".to_string(),
            }
        );
        assert_eq!(set.self_labels[1].namespace, None);
    }

    #[test]
    fn undeclared_namespace_marks_are_not_attached() {
        let event = generate_issue_event_with_labels(
            &["org.example.workflow"],
            &[("bug", Some("org.other.namespace"))],
            &[],
        );
        let set = effective_labels(&event, &[]);
        assert_eq!(set.self_labels[0].namespace, None);
    }

    #[test]
    fn external_label_events_must_reference_the_target() {
        let event = generate_issue_event_with_labels(&[], &[], &[]);
        let relevant = generate_label_event("priority", "high", Some(&event));
        let unrelated_target = generate_issue_event_with_labels(&[], &[], &[]);
        let unrelated = generate_label_event("priority", "low", Some(&unrelated_target));
        let set = effective_labels(&event, &[relevant, unrelated]);
        assert_eq!(
            set.external,
            vec![Label {
                namespace: Some("priority".to_string()),
                value: "high".to_string(),
            }]
        );
    }

    #[test]
    fn normalized_orders_self_then_external_then_topics() {
        let event = generate_issue_event_with_labels(
            &["kind"],
            &[("bug", Some("kind"))],
            &["rust", "parser"],
        );
        let external = generate_label_event("priority", "high", Some(&event));
        let set = effective_labels(&event, &[external]);
        assert_eq!(
            set.normalized,
            vec![
                "kind/bug".to_string(),
                "priority/high".to_string(),
                "t/rust".to_string(),
                "t/parser".to_string(),
            ]
        );
    }

    #[test]
    fn namespace_less_labels_normalize_under_ugc() {
        let event = generate_issue_event_with_labels(&[], &[("misc", None)], &[]);
        let set = effective_labels(&event, &[]);
        assert_eq!(set.normalized, vec!["ugc/misc".to_string()]);
    }

    #[test]
    fn duplicate_entries_collapse_keeping_first() {
        let event = generate_issue_event_with_labels(
            &["kind"],
            &[("bug", Some("kind"))],
            &[],
        );
        let a = generate_label_event("kind", "bug", Some(&event));
        let set = effective_labels(&event, &[a]);
        assert_eq!(set.normalized, vec!["kind/bug".to_string()]);
        assert_eq!(set.self_labels.len(), 1);
        assert_eq!(set.external.len(), 1);
    }
}
