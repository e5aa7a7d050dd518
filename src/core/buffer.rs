use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("substr window {offset}+{len} escapes buffer of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Immutable byte view backed by shared, reference-counted storage.
///
/// Substrings created with [`Buffer::substr`] share the backing allocation;
/// the storage is released when the last view over it is dropped. A buffer
/// built with [`Buffer::from_static`] carries no backing and borrows the
/// static data directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub const fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
        }
    }

    /// Byte-wise view of the window.
    pub fn view(&self) -> &[u8] {
        &self.data
    }

    /// Sub-view sharing the same backing storage.
    pub fn substr(&self, offset: usize, len: usize) -> Result<Self, BufferError> {
        let end = offset.checked_add(len).ok_or(BufferError::OutOfRange {
            offset,
            len,
            size: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(BufferError::OutOfRange {
                offset,
                len,
                size: self.data.len(),
            });
        }
        Ok(Self {
            data: self.data.slice(offset..end),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The window interpreted as UTF-8, when it is valid UTF-8.
    pub fn as_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<String> for Buffer {
    fn from(data: String) -> Self {
        Self {
            data: data.into_bytes().into(),
        }
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        Self {
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.view() == other
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.view() == *other
    }
}

impl PartialEq<str> for Buffer {
    fn eq(&self, other: &str) -> bool {
        self.view() == other.as_bytes()
    }
}

impl PartialEq<&str> for Buffer {
    fn eq(&self, other: &&str) -> bool {
        self.view() == other.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substr_shares_backing() {
        let buf = Buffer::new(b"topic1_contents".to_vec());
        let topic = buf.substr(0, 6).unwrap();
        let rest = buf.substr(7, 8).unwrap();
        drop(buf);
        assert_eq!(topic, "topic1");
        assert_eq!(rest, "contents");
    }

    #[test]
    fn substr_rejects_escaping_window() {
        let buf = Buffer::from_static(b"abc");
        assert!(buf.substr(0, 3).is_ok());
        assert!(matches!(
            buf.substr(1, 3),
            Err(BufferError::OutOfRange { size: 3, .. })
        ));
        assert!(buf.substr(4, 0).is_err());
        assert!(buf.substr(usize::MAX, 2).is_err());
    }

    #[test]
    fn ordering_is_byte_wise() {
        let a = Buffer::from("abc");
        let b = Buffer::from("abd");
        assert!(a < b);
        assert_eq!(a, Buffer::from_static(b"abc"));
    }
}
