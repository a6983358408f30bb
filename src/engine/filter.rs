use std::cmp::Ordering;

use crate::model::{DocumentKey, FieldPath, MutableDocument};
use crate::value::{canonical_id, compare, compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    /// Name used by the structured-query wire format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThanOrEqual => ">=",
            Operator::GreaterThan => ">",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }

        let other = document.field(&self.field);
        match self.op {
            Operator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            Operator::ArrayContainsAny => match (other.and_then(FirestoreValue::as_array), self.value.as_array()) {
                (Some(array), Some(needles)) => needles.values().iter().any(|needle| array.contains(needle)),
                _ => false,
            },
            Operator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            Operator::NotIn => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => {
                    !candidates.contains(&FirestoreValue::null())
                        && !other.is_null()
                        && !candidates.contains(other)
                }
                _ => false,
            },
            // Missing and null fields never match `!=`; types do not need to agree.
            Operator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
            _ => match other {
                Some(other) if compare::type_order(other) == compare::type_order(&self.value) => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            Operator::In | Operator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|array| {
                        array
                            .values()
                            .iter()
                            .filter_map(key_from_reference)
                            .any(|candidate| &candidate == key)
                    })
                    .unwrap_or(false);
                (self.op == Operator::In) == contained
            }
            _ => match key_from_reference(&self.value) {
                Some(filter_key) => self.op.matches_comparison(key.cmp(&filter_key)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.symbol(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

impl CompositeOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeOperator::And => "AND",
            CompositeOperator::Or => "OR",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    filters: Vec<Filter>,
    op: CompositeOperator,
}

impl CompositeFilter {
    pub fn new(filters: Vec<Filter>, op: CompositeOperator) -> Self {
        Self { filters, op }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    fn is_flat_conjunction(&self) -> bool {
        self.op == CompositeOperator::And
            && self
                .filters
                .iter()
                .all(|filter| matches!(filter, Filter::Field(_)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::And))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::Or))
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(document)),
            },
        }
    }

    /// Every field filter nested in this filter.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened)
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let nested: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                if composite.is_flat_conjunction() {
                    nested.join(",")
                } else {
                    format!("{}({})", composite.op.as_str().to_lowercase(), nested.join(","))
                }
            }
        }
    }
}

/// Parses the key of a reference value; accepts fully qualified names and bare paths.
pub(crate) fn key_from_reference(value: &FirestoreValue) -> Option<DocumentKey> {
    match value.kind() {
        ValueKind::Reference(name) => {
            let path = match name.find("/documents/") {
                Some(index) if name.starts_with("projects/") => &name[index + "/documents/".len()..],
                _ => name.as_str(),
            };
            DocumentKey::from_string(path).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::value::ObjectValue;

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in entries {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn filter(field: &str, op: Operator, value: FirestoreValue) -> Filter {
        Filter::field(FieldPath::from_dot_separated(field).unwrap(), op, value)
    }

    #[test]
    fn comparisons_require_matching_type_order() {
        let document = doc("rooms/a", &[("rank", 5.into())]);
        assert!(filter("rank", Operator::GreaterThan, 1.5.into()).matches(&document));
        assert!(!filter("rank", Operator::GreaterThan, "1".into()).matches(&document));
        assert!(filter("rank", Operator::NotEqual, "1".into()).matches(&document));
    }

    #[test]
    fn not_equal_skips_missing_and_null_fields() {
        let missing = doc("rooms/a", &[]);
        let null = doc("rooms/b", &[("rank", FirestoreValue::null())]);
        let f = filter("rank", Operator::NotEqual, 1.into());
        assert!(!f.matches(&missing));
        assert!(!f.matches(&null));
    }

    #[test]
    fn array_operators() {
        let document = doc(
            "rooms/a",
            &[("tags", FirestoreValue::from_array(vec!["x".into(), "y".into()]))],
        );
        assert!(filter("tags", Operator::ArrayContains, "x".into()).matches(&document));
        assert!(filter(
            "tags",
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "y".into()])
        )
        .matches(&document));
        assert!(!filter(
            "tags",
            Operator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_array(vec![
                "x".into(),
                "y".into()
            ])])
        )
        .matches(&document));
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let document = doc("rooms/b", &[]);
        let f = Filter::field(
            FieldPath::document_id(),
            Operator::GreaterThan,
            FirestoreValue::from_reference("projects/p/databases/(default)/documents/rooms/a"),
        );
        assert!(f.matches(&document));
    }

    #[test]
    fn composite_canonical_ids() {
        let a = filter("a", Operator::Equal, 1.into());
        let b = filter("b", Operator::LessThan, 2.into());
        assert_eq!(Filter::and(vec![a.clone(), b.clone()]).canonical_id(), "a==1,b<2");
        assert_eq!(Filter::or(vec![a, b]).canonical_id(), "or(a==1,b<2)");
    }
}
