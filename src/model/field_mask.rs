use crate::model::FieldPath;

/// Sorted, de-duplicated set of field paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` is one of the mask's fields or nested under one.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_sorts_and_dedups() {
        let a = FieldPath::from_dot_separated("a").unwrap();
        let b = FieldPath::from_dot_separated("b").unwrap();
        let mask = FieldMask::new(vec![b.clone()]).union(vec![a.clone(), b.clone()]);
        assert_eq!(mask.fields(), &[a, b]);
    }
}
