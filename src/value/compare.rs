//! Total ordering, equality and canonical ids for [`FirestoreValue`].
//!
//! Values of different types sort by type order:
//! null < boolean < number < timestamp < server timestamp < string < bytes < reference
//! < geo point < array < vector < map.
//! Integers and doubles share the number slot and compare numerically, with NaN below every
//! other number.

use std::cmp::Ordering;

use crate::value::{FirestoreValue, MapValue, ValueKind};

pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Vector(_) => 10,
        ValueKind::Map(_) => 11,
    }
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (
            ValueKind::ServerTimestamp {
                local_write_time: a,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: b,
                ..
            },
        ) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            compare_sequences(a.values(), b.values(), compare_values)
        }
        (ValueKind::Vector(a), ValueKind::Vector(b)) => a.len().cmp(&b.len()).then_with(|| {
            compare_sequences(a.as_slice(), b.as_slice(), |x, y| compare_doubles(*x, *y))
        }),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Deep equality. Unlike ordering, an integer never equals a double, NaN equals NaN, and
/// `0.0` differs from `-0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
        }
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
        (
            ValueKind::ServerTimestamp {
                local_write_time: a,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: b,
                ..
            },
        ) => a == b,
        (ValueKind::String(a), ValueKind::String(b)) => a == b,
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a == b,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a
                    .values()
                    .iter()
                    .zip(b.values())
                    .all(|(x, y)| values_equal(x, y))
        }
        (ValueKind::Vector(a), ValueKind::Vector(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(x, y)| (x.is_nan() && y.is_nan()) || x.to_bits() == y.to_bits())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().all(|(key, value)| {
                    b.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        _ => false,
    }
}

/// Stable textual form used to build canonical query and target ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical_id(value, &mut out);
    out
}

fn write_canonical_id(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
        ValueKind::Integer(value) => out.push_str(&value.to_string()),
        ValueKind::Double(value) => out.push_str(&format_double(*value)),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => out.push_str(&format!(
            "serverTimestamp({},{})",
            local_write_time.seconds, local_write_time.nanos
        )),
        ValueKind::String(value) => out.push_str(value),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(name) => out.push_str(reference_path(name)),
        ValueKind::GeoPoint(point) => out.push_str(&format!(
            "geo({},{})",
            format_double(point.latitude()),
            format_double(point.longitude())
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_id(element, out);
            }
            out.push(']');
        }
        ValueKind::Vector(values) => {
            out.push_str("vector([");
            let rendered: Vec<String> = values.iter().map(|v| format_double(*v)).collect();
            out.push_str(&rendered.join(","));
            out.push_str("])");
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical_id(element, out);
            }
            out.push('}');
        }
    }
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Strips the `projects/{p}/databases/{d}/documents/` prefix when present.
fn reference_path(name: &str) -> &str {
    match name.find("/documents/") {
        Some(index) => &name[index + "/documents/".len()..],
        None => name,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_sequences<T, F>(left: &[T], right: &[T], mut compare: F) -> Ordering
where
    F: FnMut(&T, &T) -> Ordering,
{
    for (l, r) in left.iter().zip(right.iter()) {
        match compare(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_entries = left.fields().iter();
    let mut right_entries = right.fields().iter();
    loop {
        match (left_entries.next(), right_entries.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("projects/p/databases/d/documents/a/b"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_vector(vec![1.0]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_values(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn numbers_compare_across_representations_but_are_not_equal() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&int, &double), Ordering::Equal);
        assert!(!values_equal(&int, &double));
        assert!(!values_equal(
            &FirestoreValue::from_double(0.0),
            &FirestoreValue::from_double(-0.0)
        ));
    }

    #[test]
    fn arrays_compare_element_wise_then_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        let bigger = FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert_eq!(compare_values(&long, &bigger), Ordering::Less);
    }

    #[test]
    fn canonical_ids_are_stable() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from_integer(2));
        map.insert("a".to_string(), FirestoreValue::from_double(1.0));
        let value = FirestoreValue::from_map(map);
        assert_eq!(canonical_id(&value), "{a:1.0,b:2}");
        assert_eq!(
            canonical_id(&FirestoreValue::from_reference(
                "projects/p/databases/d/documents/rooms/a"
            )),
            "rooms/a"
        );
    }
}
