use bytes::Bytes;

/// Content type every log record travels with.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A log submission as received by the ingress.
///
/// The payload is expected to be a JSON object but is never parsed or
/// rewritten on its way to the sink. `Bytes` is immutable, so every clone
/// shares the same buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    payload: Bytes,
}

impl LogRecord {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
