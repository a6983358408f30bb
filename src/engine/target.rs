use crate::engine::query::canonical_order_by;
use crate::engine::{Bound, Filter, OrderBy, Query};
use crate::model::{DocumentKey, ResourcePath};

/// What the backend is asked to listen to. Derived from a [`crate::engine::Query`]; several
/// queries can map to one target.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Single-document target, as used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Query::document(key).to_target()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(&canonical_order_by(&self.order_by));
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.inclusive() { "b:" } else { "a:" });
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.inclusive() { "a:" } else { "b:" });
            id.push_str(&end.canonical_id());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Direction, Operator};
    use crate::model::FieldPath;

    #[test]
    fn equivalent_queries_share_canonical_ids() {
        let rank = FieldPath::from_dot_separated("rank").unwrap();
        let explicit = Query::collection("rooms")
            .unwrap()
            .with_filter(Filter::field(rank.clone(), Operator::GreaterThan, 1.into()))
            .with_order_by(rank.clone(), Direction::Ascending);
        let implicit = Query::collection("rooms")
            .unwrap()
            .with_filter(Filter::field(rank, Operator::GreaterThan, 1.into()));
        assert_eq!(
            explicit.to_target().canonical_id(),
            implicit.to_target().canonical_id()
        );
        assert_eq!(
            implicit.to_target().canonical_id(),
            "rooms|f:rank>1|ob:rankasc,__name__asc"
        );
    }

    #[test]
    fn document_targets() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert!(Target::for_document(&key).is_document_target());
        assert!(!Query::collection("rooms").unwrap().to_target().is_document_target());
    }
}
