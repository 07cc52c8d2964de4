// libs/shared/database/src/filter.rs
use serde_json::Value;

/// Conjunctive document filter.
///
/// Renders to a PostgREST query string for the REST store and evaluates
/// in-process for the in-memory store, so the two backends agree on what
/// a subscription's result set contains.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(String, String),
    In(String, Vec<String>),
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl ToString) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value.to_string()));
        self
    }

    pub fn is_in(mut self, field: &str, values: &[&str]) -> Self {
        self.clauses.push(Clause::In(
            field.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// PostgREST-style query string, e.g. `receiver_id=eq.abc&status=in.(calling,connected)`.
    ///
    /// Values are percent-encoded; ids are opaque strings, so `&`, `=`
    /// and `,` must not leak into the query syntax.
    pub fn to_query_string(&self) -> String {
        self.clauses
            .iter()
            .map(|clause| match clause {
                Clause::Eq(field, value) => {
                    format!("{}=eq.{}", field, urlencoding::encode(value))
                }
                Clause::In(field, values) => format!(
                    "{}=in.({})",
                    field,
                    values
                        .iter()
                        .map(|v| urlencoding::encode(v))
                        .collect::<Vec<_>>()
                        .join(",")
                ),
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, value) => field_str(doc, field).as_deref() == Some(value),
            Clause::In(field, values) => field_str(doc, field)
                .map(|v| values.iter().any(|candidate| *candidate == v))
                .unwrap_or(false),
        })
    }
}

fn field_str(doc: &Value, field: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_string_rendering() {
        let filter = Filter::new()
            .eq("receiver_id", "user-1")
            .is_in("status", &["calling", "connected"]);
        assert_eq!(
            filter.to_query_string(),
            "receiver_id=eq.user-1&status=in.(calling,connected)"
        );
    }

    #[test]
    fn test_query_string_encodes_reserved_characters() {
        let filter = Filter::new()
            .eq("receiver_id", "user&1=x")
            .is_in("status", &["a,b"]);
        assert_eq!(
            filter.to_query_string(),
            "receiver_id=eq.user%261%3Dx&status=in.(a%2Cb)"
        );
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&json!({"anything": true})));
    }

    #[test]
    fn test_eq_and_in_matching() {
        let filter = Filter::new()
            .eq("receiver_id", "user-1")
            .is_in("status", &["calling", "connected"]);

        assert!(filter.matches(&json!({"receiver_id": "user-1", "status": "calling"})));
        assert!(filter.matches(&json!({"receiver_id": "user-1", "status": "connected"})));
        assert!(!filter.matches(&json!({"receiver_id": "user-1", "status": "ended"})));
        assert!(!filter.matches(&json!({"receiver_id": "user-2", "status": "calling"})));
        assert!(!filter.matches(&json!({"status": "calling"})));
    }

    #[test]
    fn test_null_field_never_matches() {
        let filter = Filter::new().eq("status", "calling");
        assert!(!filter.matches(&json!({"status": null})));
    }
}
