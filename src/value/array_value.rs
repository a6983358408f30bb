use crate::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    /// Membership by Firestore value equality (`1` and `1.0` are distinct here).
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_uses_value_equality() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_double(f64::NAN),
        ]);
        assert!(array.contains(&FirestoreValue::from_integer(1)));
        assert!(array.contains(&FirestoreValue::from_double(f64::NAN)));
        assert!(!array.contains(&FirestoreValue::from_double(1.0)));
    }
}
