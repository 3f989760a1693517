//! Root-cause interaction walk (§4.6): given an interaction tree and the
//! happiness grade that triggered investigation, finds the deepest
//! pre-order descendant carrying that same grade.

use serde_json::Value;

/// Pre-order DFS; returns the deepest node whose `HappinessGrade` equals
/// `grade`, preferring the first matching subtree in declared order.
pub fn root_cause<'a>(node: &'a Value, grade: &str) -> Option<&'a Value> {
    if node.get("HappinessGrade").and_then(|v| v.as_str()) != Some(grade) {
        return None;
    }
    for child in children(node) {
        if let Some(found) = root_cause(child, grade) {
            return Some(found);
        }
    }
    Some(node)
}

/// A node's children are its `Components` array when present (order as
/// declared), otherwise every object member that itself looks like an
/// interaction node (`HappinessGrade` and `TimeInteractionRecorded` both
/// present).
fn children(node: &Value) -> Vec<&Value> {
    if let Some(components) = node.get("Components").and_then(Value::as_array) {
        return components.iter().collect();
    }
    match node.as_object() {
        Some(obj) => obj
            .values()
            .filter(|v| v.get("HappinessGrade").is_some() && v.get("TimeInteractionRecorded").is_some())
            .collect(),
        None => Vec::new(),
    }
}

/// `OperationID`/`OperationId` detail property, read under either
/// capitalization (§4.6).
pub fn operation_id(node: &Value) -> Option<String> {
    node.get("OperationID")
        .or_else(|| node.get("OperationId"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn returns_root_when_it_has_no_matching_children() {
        let tree = json!({
            "HappinessGrade": "Unacceptable",
            "TimeInteractionRecorded": "2024-01-01T00:00:00Z",
            "OperationID": "root-op",
        });
        let found = root_cause(&tree, "Unacceptable").unwrap();
        assert_eq!(operation_id(found).as_deref(), Some("root-op"));
    }

    #[test]
    fn descends_into_components_in_declared_order() {
        let tree = json!({
            "HappinessGrade": "Unacceptable",
            "TimeInteractionRecorded": "t0",
            "OperationID": "root",
            "Components": [
                {
                    "HappinessGrade": "Unacceptable",
                    "TimeInteractionRecorded": "t1",
                    "OperationID": "child-1",
                },
                {
                    "HappinessGrade": "Neutral",
                    "TimeInteractionRecorded": "t1b",
                    "OperationID": "child-2",
                },
            ],
        });
        let found = root_cause(&tree, "Unacceptable").unwrap();
        assert_eq!(operation_id(found).as_deref(), Some("child-1"));
    }

    #[test]
    fn stops_descending_once_no_child_matches_the_grade() {
        let tree = json!({
            "HappinessGrade": "Unacceptable",
            "TimeInteractionRecorded": "t0",
            "OperationId": "root",
            "Components": [
                { "HappinessGrade": "Neutral", "TimeInteractionRecorded": "t1" },
            ],
        });
        let found = root_cause(&tree, "Unacceptable").unwrap();
        assert_eq!(operation_id(found).as_deref(), Some("root"));
    }

    #[test]
    fn falls_back_to_object_members_without_a_components_array() {
        let tree = json!({
            "HappinessGrade": "ReallyAnnoyed",
            "TimeInteractionRecorded": "t0",
            "OperationID": "root",
            "subStep": {
                "HappinessGrade": "ReallyAnnoyed",
                "TimeInteractionRecorded": "t1",
                "OperationID": "leaf",
            },
            "metadata": { "not": "an interaction node" },
        });
        let found = root_cause(&tree, "ReallyAnnoyed").unwrap();
        assert_eq!(operation_id(found).as_deref(), Some("leaf"));
    }
}
