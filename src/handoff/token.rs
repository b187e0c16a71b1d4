//! Opaque socket duplication token.

use bytes::Bytes;

/// OS-issued capability to rebuild an open socket in another process.
///
/// Opaque to everything except the platform backend that produced it. Valid
/// until consumed once by reconstruction in the target process.
#[derive(Clone, PartialEq, Eq)]
pub struct DuplicationToken(Bytes);

impl DuplicationToken {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for DuplicationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DuplicationToken({} bytes)", self.0.len())
    }
}

impl From<Bytes> for DuplicationToken {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}
