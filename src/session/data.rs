use bytes::Bytes;

/// A value in a session's scratch storage or a registry's shared storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ScratchValue {
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Bytes),
}

impl From<i64> for ScratchValue {
    fn from(value: i64) -> Self {
        ScratchValue::Int(value)
    }
}

impl From<f64> for ScratchValue {
    fn from(value: f64) -> Self {
        ScratchValue::Float(value)
    }
}

impl From<&str> for ScratchValue {
    fn from(value: &str) -> Self {
        ScratchValue::Text(value.to_string())
    }
}

impl From<String> for ScratchValue {
    fn from(value: String) -> Self {
        ScratchValue::Text(value)
    }
}

impl From<Bytes> for ScratchValue {
    fn from(value: Bytes) -> Self {
        ScratchValue::Blob(value)
    }
}

impl ScratchValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScratchValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ScratchValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScratchValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            ScratchValue::Blob(value) => Some(value),
            _ => None,
        }
    }
}
