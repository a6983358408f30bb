use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::engine::{Bound, CompositeOperator, FieldFilter, Filter, Operator, OrderBy, Target};
use crate::remote::serializer::JsonProtoSerializer;
use crate::value::ValueKind;

/// `QueryTarget` for a non-document target: the parent resource plus its structured query.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let mut structured = JsonMap::new();

    let parent = match target.collection_group() {
        Some(group) => {
            structured.insert(
                "from".to_string(),
                json!([{ "collectionId": group, "allDescendants": true }]),
            );
            serializer.resource_name(target.path())
        }
        None => {
            let collection_id = target.path().last_segment().unwrap_or_default();
            structured.insert(
                "from".to_string(),
                json!([{ "collectionId": collection_id }]),
            );
            serializer.resource_name(&target.path().without_last())
        }
    };

    if !target.filters().is_empty() {
        let filter = if target.filters().len() == 1 {
            encode_filter(serializer, &target.filters()[0])
        } else {
            encode_filter(serializer, &Filter::and(target.filters().to_vec()))
        };
        structured.insert("where".to_string(), filter);
    }

    if !target.order_by().is_empty() {
        let orders: Vec<JsonValue> = target.order_by().iter().map(encode_order).collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }

    if let Some(start) = target.start_at() {
        structured.insert(
            "startAt".to_string(),
            encode_cursor(serializer, start, start.inclusive()),
        );
    }

    if let Some(end) = target.end_at() {
        structured.insert(
            "endAt".to_string(),
            encode_cursor(serializer, end, !end.inclusive()),
        );
    }

    json!({
        "parent": parent,
        "structuredQuery": JsonValue::Object(structured),
    })
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => encode_field_filter(serializer, field_filter),
        Filter::Composite(composite) if composite.filters().len() == 1 => {
            encode_filter(serializer, &composite.filters()[0])
        }
        Filter::Composite(composite) => {
            let op = match composite.op() {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            };
            let nested: Vec<JsonValue> = composite
                .filters()
                .iter()
                .map(|f| encode_filter(serializer, f))
                .collect();
            json!({ "compositeFilter": { "op": op, "filters": nested } })
        }
    }
}

/// Equality against null or NaN travels as a unary filter.
fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    let unary = match (filter.op(), filter.value().kind()) {
        (Operator::Equal, ValueKind::Null) => Some("IS_NULL"),
        (Operator::Equal, ValueKind::Double(d)) if d.is_nan() => Some("IS_NAN"),
        (Operator::NotEqual, ValueKind::Null) => Some("IS_NOT_NULL"),
        (Operator::NotEqual, ValueKind::Double(d)) if d.is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    match unary {
        Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
        None => json!({
            "fieldFilter": {
                "field": field,
                "op": filter.op().as_str(),
                "value": serializer.encode_value(filter.value())
            }
        }),
    }
}

fn encode_order(order: &OrderBy) -> JsonValue {
    json!({
        "field": { "fieldPath": order.field().canonical_string() },
        "direction": order.direction().as_str(),
    })
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, before: bool) -> JsonValue {
    json!({
        "values": bound
            .position()
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": before,
    })
}
