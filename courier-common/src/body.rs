use std::{io::Cursor, sync::Arc};

/// An immutable, cheaply cloneable message body.
///
/// The body is handed to many delivery backends within one transaction, each
/// of which may need to read it from the start. Cloning shares the
/// underlying allocation, and [`Body::reader`] hands out an independent
/// cursor per call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    data: Arc<[u8]>,
}

impl Body {
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// A fresh reader over the whole body.
    #[must_use]
    pub fn reader(&self) -> Cursor<Body> {
        Cursor::new(self.clone())
    }

    /// Replace the contents, used by body rewriters.
    pub fn replace(&mut self, data: impl Into<Arc<[u8]>>) {
        self.data = data.into();
    }
}

impl AsRef<[u8]> for Body {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<&[u8]> for Body {
    fn from(data: &[u8]) -> Self {
        Self { data: data.into() }
    }
}

impl From<&str> for Body {
    fn from(data: &str) -> Self {
        Self {
            data: data.as_bytes().into(),
        }
    }
}
