use base64::{engine::general_purpose::STANDARD, Engine as _};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(value).map(Self)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_padded_base64() {
        let decoded = BytesValue::from_base64("AQID").unwrap();
        assert_eq!(decoded.as_slice(), &[1, 2, 3]);
        assert_eq!(BytesValue::new(vec![1, 2]).to_base64(), "AQI=");
    }

    #[test]
    fn orders_lexicographically() {
        assert!(BytesValue::new(vec![1, 2]) < BytesValue::new(vec![1, 3]));
        assert!(BytesValue::new(vec![1]) < BytesValue::new(vec![1, 0]));
    }
}
