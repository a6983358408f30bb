use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use crate::engine::filter::key_from_reference;
use crate::engine::{Filter, Target};
use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::value::{canonical_id, compare_values, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                // Documents without the field never match an ordered query.
                _ => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Cursor position: one value per order-by clause, prefix allowed.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match key_from_reference(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        self.position
            .iter()
            .map(canonical_id)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query as issued by a listener.
///
/// Two queries with the same [`Query::canonical_id`] share one target and one view.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for a collection (odd number of segments) or a single document (even).
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection reference. Collection references must have an odd number of segments, but {path} has {}",
                path.len()
            )));
        }
        Ok(Self::new(path))
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    /// Requires at least one explicit order-by.
    pub fn with_limit_to_last(mut self, limit: u32) -> FirestoreResult<Self> {
        if self.explicit_order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last() queries require specifying at least one order_by() clause",
            ));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        Ok(self)
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Same query restricted to the collection at `path`; used to run collection-group
    /// queries one parent at a time.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// Explicit orderings, then inequality fields not yet ordered, then `__name__` in the
    /// direction of the last ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let mut ordered_fields: BTreeSet<FieldPath> =
            order_by.iter().map(|o| o.field.clone()).collect();
        let last_direction = order_by
            .last()
            .map(|o| o.direction)
            .unwrap_or(Direction::Ascending);

        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op().is_inequality())
            .map(|filter| filter.field().clone())
            .collect();
        for field in inequality_fields {
            if !field.is_key_field() && ordered_fields.insert(field.clone()) {
                order_by.push(OrderBy::new(field, last_direction));
            }
        }

        if !order_by.iter().any(|o| o.field.is_key_field()) {
            order_by.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        order_by
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let doc_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Comparator for query results; total thanks to the trailing `__name__` ordering.
    pub fn comparator(&self) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering {
        let order_by = self.normalized_order_by();
        move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
    }

    /// Target sent to the backend. Limit-to-last queries flip every ordering and swap their
    /// cursors; the view restores the requested order locally.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let flipped = order_by
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.flipped()))
                    .collect();
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    self.end_at.clone(),
                    self.start_at.clone(),
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

pub(crate) fn canonical_order_by(order_by: &[OrderBy]) -> String {
    order_by
        .iter()
        .map(OrderBy::canonical_id)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Operator;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::value::ObjectValue;

    fn doc(path: &str, rank: Option<i64>) -> MutableDocument {
        let mut data = ObjectValue::empty();
        if let Some(rank) = rank {
            data.set(&FieldPath::from_dot_separated("rank").unwrap(), rank.into());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn rank() -> FieldPath {
        FieldPath::from_dot_separated("rank").unwrap()
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = Query::collection("rooms").unwrap();
        assert!(query.matches(&doc("rooms/a", None)));
        assert!(!query.matches(&doc("rooms/a/messages/m", None)));
        assert!(!query.matches(&doc("other/a", None)));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/m", None)));
        assert!(!query.matches(&doc("rooms/a", None)));
    }

    #[test]
    fn order_by_excludes_documents_missing_the_field() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(rank(), Direction::Ascending);
        assert!(!query.matches(&doc("rooms/a", None)));
        assert!(query.matches(&doc("rooms/b", Some(1))));
    }

    #[test]
    fn normalized_order_by_adds_inequality_and_key() {
        let query = Query::collection("rooms").unwrap().with_filter(Filter::field(
            rank(),
            Operator::GreaterThan,
            1.into(),
        ));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field(), &rank());
        assert!(order_by[1].field().is_key_field());
    }

    #[test]
    fn comparator_breaks_ties_by_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(rank(), Direction::Descending);
        let cmp = query.comparator();
        assert_eq!(cmp(&doc("rooms/a", Some(2)), &doc("rooms/b", Some(1))), Ordering::Less);
        assert_eq!(cmp(&doc("rooms/b", Some(1)), &doc("rooms/a", Some(1))), Ordering::Less);
    }

    #[test]
    fn bounds_filter_results() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(rank(), Direction::Ascending)
            .starting_at(Bound::new(vec![2.into()], true))
            .ending_at(Bound::new(vec![4.into()], false));
        assert!(!query.matches(&doc("rooms/a", Some(1))));
        assert!(query.matches(&doc("rooms/b", Some(2))));
        assert!(!query.matches(&doc("rooms/c", Some(4))));
    }

    #[test]
    fn limit_to_last_flips_target_orderings() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(rank(), Direction::Ascending)
            .with_limit_to_last(2)
            .unwrap();
        let target = query.to_target();
        assert!(target
            .order_by()
            .iter()
            .all(|o| o.direction() == Direction::Descending));
        assert_ne!(
            query.canonical_id(),
            Query::collection("rooms")
                .unwrap()
                .with_order_by(rank(), Direction::Ascending)
                .with_limit_to_first(2)
                .canonical_id()
        );
    }

    #[test]
    fn limit_to_last_requires_order_by() {
        assert!(Query::collection("rooms").unwrap().with_limit_to_last(1).is_err());
    }
}
