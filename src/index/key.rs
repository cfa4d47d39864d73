//! Index keys: per-class declarations, per-object values and the encoded
//! entries stored in the B-trees.

use crate::file::ObjAddr;

use super::error::{IndexError, IndexResult};

/// Encoded width of an object-address key
pub const ADDRESS_KEY_LENGTH: usize = 4;

/// What a key's bytes mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Bytes copied out of the object's fields
    Value,
    /// A direct reference to another object's first node
    ObjectAddress,
}

/// A class's declaration of one index
///
/// `index_no` 0 is the primary index (unique); higher numbers are secondary
/// indexes where duplicates are tie-broken by object address. A spec that
/// names a `related_class` makes the key a relational reference checked on
/// insert, update and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub index_no: u16,
    pub key_len: usize,
    pub related_class: Option<&'static str>,
    pub kind: KeyKind,
}

impl KeySpec {
    /// A fixed-length value key
    pub fn value(index_no: u16, key_len: usize) -> Self {
        Self {
            index_no,
            key_len,
            related_class: None,
            kind: KeyKind::Value,
        }
    }

    /// An object-address reference to `related_class`
    pub fn address(index_no: u16, related_class: &'static str) -> Self {
        Self {
            index_no,
            key_len: ADDRESS_KEY_LENGTH,
            related_class: Some(related_class),
            kind: KeyKind::ObjectAddress,
        }
    }

    /// Declare a value key as a copied foreign key of `related_class`
    pub fn with_related(mut self, related_class: &'static str) -> Self {
        self.related_class = Some(related_class);
        self
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.key_len == 0 {
            return Err(IndexError::ZeroLengthKey);
        }
        Ok(())
    }

    /// Encode an application-supplied value as a fixed-width key with no
    /// object address attached yet
    pub fn encode(&self, value: &KeyValue) -> Key {
        let mut bytes = vec![0u8; self.key_len];
        match value {
            KeyValue::Bytes(src) => {
                let n = src.len().min(self.key_len);
                bytes[..n].copy_from_slice(&src[..n]);
            }
            // big-endian so byte order equals numeric address order
            KeyValue::Addr(addr) => {
                let n = ADDRESS_KEY_LENGTH.min(self.key_len);
                bytes[..n].copy_from_slice(&addr.to_be_bytes()[..n]);
            }
        }
        Key { bytes, addr: 0 }
    }
}

/// A key value as the application hands it over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Bytes(Vec<u8>),
    Addr(ObjAddr),
}

impl KeyValue {
    pub fn from_str(s: &str) -> Self {
        KeyValue::Bytes(s.as_bytes().to_vec())
    }
}

/// An encoded index entry: fixed-width key bytes plus the address of the
/// object it points at. Ordering is `(bytes, addr)` lexicographic, so
/// secondary indexes hold duplicates tie-broken by object address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub bytes: Vec<u8>,
    pub addr: ObjAddr,
}

impl Key {
    pub fn new(bytes: Vec<u8>, addr: ObjAddr) -> Self {
        Self { bytes, addr }
    }

    /// A key is null-valued when every byte is zero
    pub fn is_null(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    pub fn with_addr(mut self, addr: ObjAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Parse one entry out of a tree node (`key_len` bytes + address)
    pub fn read(buf: &[u8], key_len: usize) -> Self {
        let bytes = buf[..key_len].to_vec();
        let addr = u32::from_le_bytes([
            buf[key_len],
            buf[key_len + 1],
            buf[key_len + 2],
            buf[key_len + 3],
        ]);
        Self { bytes, addr }
    }

    /// Write one entry into a tree node
    pub fn write(&self, buf: &mut [u8]) {
        let key_len = self.bytes.len();
        buf[..key_len].copy_from_slice(&self.bytes);
        buf[key_len..key_len + 4].copy_from_slice(&self.addr.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_bytes_then_addr() {
        let a = Key::new(vec![1, 2, 3], 9);
        let b = Key::new(vec![1, 2, 4], 1);
        let c = Key::new(vec![1, 2, 3], 10);

        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_null_key() {
        assert!(Key::new(vec![0; 8], 0).is_null());
        assert!(!Key::new(vec![0, 0, 1], 0).is_null());
    }

    #[test]
    fn test_encode_pads_and_truncates() {
        let spec = KeySpec::value(0, 4);
        let padded = spec.encode(&KeyValue::Bytes(vec![7, 8]));
        assert_eq!(padded.bytes, vec![7, 8, 0, 0]);

        let truncated = spec.encode(&KeyValue::Bytes(vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(truncated.bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_address_orders_numerically() {
        let spec = KeySpec::address(1, "Target");
        let low = spec.encode(&KeyValue::Addr(5));
        let high = spec.encode(&KeyValue::Addr(0x0100));
        assert!(low.bytes < high.bytes);
        assert!(spec.encode(&KeyValue::Addr(0)).is_null());
    }

    #[test]
    fn test_entry_round_trip() {
        let key = Key::new(vec![9, 8, 7, 6, 5], 0xDEAD);
        let mut buf = vec![0u8; 9];
        key.write(&mut buf);
        assert_eq!(Key::read(&buf, 5), key);
    }

    #[test]
    fn test_zero_length_key_rejected() {
        let spec = KeySpec::value(0, 0);
        assert!(matches!(spec.validate(), Err(IndexError::ZeroLengthKey)));
    }
}
