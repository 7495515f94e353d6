//! Structural checks run before a resource is submitted

use serde_json::Value;
use std::fmt;

use super::Resource;

const BUNDLE_TYPES: &[&str] = &[
    "document",
    "message",
    "transaction",
    "transaction-response",
    "batch",
    "batch-response",
    "history",
    "searchset",
    "collection",
];

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Element path, e.g. `entry[2].resource.id`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.severity, self.path, self.message)
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

/// Check a resource; bundle entries are checked recursively
pub fn validate(resource: &Resource) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check_object(resource.value(), "", &mut issues);
    issues
}

fn is_valid_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

fn check_object(value: &Value, prefix: &str, issues: &mut Vec<ValidationIssue>) {
    let resource_type = match value.get("resourceType") {
        None => {
            issues.push(ValidationIssue::error(join(prefix, "resourceType"), "missing resourceType"));
            None
        },
        Some(Value::String(name)) if is_valid_type_name(name) => Some(name.as_str()),
        Some(other) => {
            issues.push(ValidationIssue::error(
                join(prefix, "resourceType"),
                format!("invalid resourceType {}", other),
            ));
            None
        },
    };

    match value.get("id") {
        None => {},
        Some(Value::String(id)) if is_valid_id(id) => {},
        Some(other) => issues.push(ValidationIssue::error(
            join(prefix, "id"),
            format!("invalid id {}", other),
        )),
    }

    if resource_type == Some("Bundle") {
        check_bundle(value, prefix, issues);
    }
}

fn check_bundle(value: &Value, prefix: &str, issues: &mut Vec<ValidationIssue>) {
    let bundle_type = value.get("type").and_then(Value::as_str);
    match bundle_type {
        None => issues.push(ValidationIssue::warning(join(prefix, "type"), "bundle has no type")),
        Some(t) if !BUNDLE_TYPES.contains(&t) => issues.push(ValidationIssue::warning(
            join(prefix, "type"),
            format!("unknown bundle type '{}'", t),
        )),
        Some(_) => {},
    }
    let needs_request = matches!(bundle_type, Some("transaction") | Some("batch"));

    let entries = match value.get("entry") {
        None => {
            issues.push(ValidationIssue::warning(join(prefix, "entry"), "bundle has no entries"));
            return;
        },
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            issues.push(ValidationIssue::error(join(prefix, "entry"), "entry must be an array"));
            return;
        },
    };

    for (i, entry) in entries.iter().enumerate() {
        let entry_path = join(prefix, &format!("entry[{}]", i));

        if needs_request && entry.get("request").is_none() {
            issues.push(ValidationIssue::error(
                join(&entry_path, "request"),
                "transaction entry has no request",
            ));
        }

        match entry.get("resource") {
            Some(resource) if resource.is_object() => {
                check_object(resource, &join(&entry_path, "resource"), issues);
            },
            Some(_) => issues.push(ValidationIssue::error(
                join(&entry_path, "resource"),
                "entry resource must be an object",
            )),
            None => {
                // DELETE requests legitimately carry no resource
                let is_delete = entry
                    .get("request")
                    .and_then(|r| r.get("method"))
                    .and_then(Value::as_str)
                    == Some("DELETE");
                if !is_delete {
                    issues.push(ValidationIssue::error(
                        join(&entry_path, "resource"),
                        "entry has no resource",
                    ));
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(value: Value) -> Vec<ValidationIssue> {
        validate(&Resource::from_value(value).unwrap())
    }

    #[test]
    fn test_valid_patient() {
        let issues = check(json!({"resourceType": "Patient", "id": "abc-123.x"}));
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn test_resource_type_errors() {
        assert!(has_errors(&check(json!({"id": "x"}))));
        assert!(has_errors(&check(json!({"resourceType": "patient"}))));
        assert!(has_errors(&check(json!({"resourceType": 7}))));
    }

    #[test]
    fn test_id_errors() {
        let issues = check(json!({"resourceType": "Patient", "id": "has space"}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "id");

        let long = "a".repeat(65);
        assert!(has_errors(&check(json!({"resourceType": "Patient", "id": long}))));
        assert!(has_errors(&check(json!({"resourceType": "Patient", "id": 12}))));
    }

    #[test]
    fn test_bundle_warnings_do_not_block() {
        let issues = check(json!({
            "resourceType": "Bundle",
            "type": "bag-of-things",
            "entry": [{"resource": {"resourceType": "Patient"}}]
        }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(!has_errors(&issues));
    }

    #[test]
    fn test_bundle_entry_errors_carry_paths() {
        let issues = check(json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"request": {"method": "POST", "url": "Patient"}, "resource": {"resourceType": "Patient", "id": "ok"}},
                {"request": {"method": "POST", "url": "Patient"}, "resource": {"id": "no-type"}},
                {"resource": {"resourceType": "Observation"}},
                {"request": {"method": "DELETE", "url": "Patient/1"}}
            ]
        }));

        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["entry[1].resource.resourceType", "entry[2].request"]);
        assert!(has_errors(&issues));
    }
}
