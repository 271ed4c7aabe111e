use serde_json::Value;

use crate::error::Error;

/// Where a matcher predicate is evaluated: inside the JSON metadata column or
/// against a base column of the stream table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Metadata,
    MessageProperty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    LowerThan,
    LowerThanEquals,
    In,
    NotIn,
    Regex,
}

impl Operator {
    /// Sql rendering for the comparison operators. `In`, `NotIn` and `Regex`
    /// need dialect specific treatment and are not plain infix operators.
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanEquals => ">=",
            Operator::LowerThan => "<",
            Operator::LowerThanEquals => "<=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Regex => "REGEX",
        }
    }
}

/// One predicate of a metadata matcher.
#[derive(Debug, Clone)]
pub struct MetadataMatch {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub field_type: FieldType,
}

/// A conjunction of predicates evaluated while loading events or enumerating
/// streams. An empty matcher imposes no filter.
#[derive(Debug, Clone, Default)]
pub struct MetadataMatcher {
    matches: Vec<MetadataMatch>,
}

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate on a metadata field.
    pub fn with(self, field: impl Into<String>, operator: Operator, value: Value) -> Result<Self, Error> {
        self.with_field_type(field, operator, value, FieldType::Metadata)
    }

    /// Adds a predicate on a base column of the stream table (`event_id`,
    /// `event_name`, `created_at` or `no`).
    pub fn with_message_property(
        self,
        field: impl Into<String>,
        operator: Operator,
        value: Value,
    ) -> Result<Self, Error> {
        self.with_field_type(field, operator, value, FieldType::MessageProperty)
    }

    pub fn with_field_type(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: Value,
        field_type: FieldType,
    ) -> Result<Self, Error> {
        validate_operator_value(operator, &value)?;
        self.matches.push(MetadataMatch {
            field: field.into(),
            operator,
            value,
            field_type,
        });
        Ok(self)
    }

    pub fn matches(&self) -> &[MetadataMatch] {
        &self.matches
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

fn validate_operator_value(operator: Operator, value: &Value) -> Result<(), Error> {
    match operator {
        Operator::Regex => {
            if !value.is_string() {
                return Err(Error::InvalidArgument(
                    "regex operator requires a string value".to_string(),
                ));
            }
        }
        Operator::In | Operator::NotIn => match value.as_array() {
            Some(values) if !values.is_empty() => {
                if values.iter().any(|v| v.is_array() || v.is_object() || v.is_null()) {
                    return Err(Error::InvalidArgument(
                        "in operators require an array of scalar values".to_string(),
                    ));
                }
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "in operators require a non-empty array value".to_string(),
                ));
            }
        },
        _ => {
            if value.is_array() || value.is_object() || value.is_null() {
                return Err(Error::InvalidArgument(
                    "comparison operators require a scalar value".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalar_operators_reject_arrays() {
        let result = MetadataMatcher::new().with("key", Operator::Equals, json!([1, 2]));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn in_operator_requires_a_non_empty_array() {
        assert!(MetadataMatcher::new().with("key", Operator::In, json!([])).is_err());
        assert!(MetadataMatcher::new().with("key", Operator::In, json!("a")).is_err());
        assert!(MetadataMatcher::new()
            .with("key", Operator::In, json!(["a", 1]))
            .is_ok());
    }

    #[test]
    fn regex_operator_requires_a_string() {
        assert!(MetadataMatcher::new().with("key", Operator::Regex, json!(1)).is_err());
        assert!(MetadataMatcher::new()
            .with("key", Operator::Regex, json!("^foo"))
            .is_ok());
    }

    #[test]
    fn matches_are_kept_in_insertion_order() {
        let matcher = MetadataMatcher::new()
            .with("a", Operator::Equals, json!(1))
            .unwrap()
            .with_message_property("no", Operator::GreaterThan, json!(5))
            .unwrap();

        let fields: Vec<&str> = matcher.matches().iter().map(|m| m.field.as_str()).collect();
        assert_eq!(fields, vec!["a", "no"]);
        assert_eq!(matcher.matches()[1].field_type, FieldType::MessageProperty);
    }
}
