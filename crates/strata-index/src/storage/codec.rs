//! Tier page encoding.
//!
//! Page layout (all integers little-endian):
//! ```text
//! +----------------------+
//! | kind: u8             |  0 = inner, 1 = leaf
//! +----------------------+
//! | inner:               |
//! |   child_type: u8     |
//! |   count: u32         |
//! |   branches...        |  address: u64, has_pivot: u8, [fields]
//! +----------------------+
//! | leaf:                |
//! |   next: u64          |
//! |   count: u32         |
//! |   buckets...         |  has_fields: u8, [fields], len: u32, record
//! +----------------------+
//! ```
//! A field vector is `count: u16` followed by tagged values.

use crate::tier::{Branch, Bucket, ChildType, InnerTier, LeafTier, Tier, TierBody};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_common::{Address, FieldValue, FieldVector, Result, StrataError};

const KIND_INNER: u8 = 0;
const KIND_LEAF: u8 = 1;

/// Objects that can be stored in encoded pages.
pub trait Record: Sized {
    /// Appends the encoded object to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes an object from exactly the bytes `encode` produced.
    fn decode(bytes: Bytes) -> Option<Self>;
}

impl Record for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }

    fn decode(bytes: Bytes) -> Option<Self> {
        Some(i64::from_le_bytes(bytes.as_ref().try_into().ok()?))
    }
}

impl Record for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn decode(bytes: Bytes) -> Option<Self> {
        Some(u64::from_le_bytes(bytes.as_ref().try_into().ok()?))
    }
}

impl Record for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(bytes: Bytes) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl Record for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(bytes: Bytes) -> Option<Self> {
        Some(bytes)
    }
}

impl Record for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(bytes: Bytes) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

/// Serializes a tier to a page.
pub fn encode_tier<T: Record>(tier: &Tier<T>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    match tier.body() {
        TierBody::Inner(inner) => {
            buf.put_u8(KIND_INNER);
            buf.put_u8(inner.child_type.tag());
            buf.put_u32_le(inner.branches.len() as u32);
            for branch in &inner.branches {
                buf.put_u64_le(branch.address.as_u64());
                put_optional_fields(&mut buf, branch.pivot.as_ref());
            }
        }
        TierBody::Leaf(leaf) => {
            buf.put_u8(KIND_LEAF);
            buf.put_u64_le(leaf.next.as_u64());
            buf.put_u32_le(leaf.buckets.len() as u32);
            let mut record = BytesMut::new();
            for bucket in &leaf.buckets {
                put_optional_fields(&mut buf, bucket.fields.as_ref());
                record.clear();
                bucket.object.encode(&mut record);
                buf.put_u32_le(record.len() as u32);
                buf.put_slice(&record);
            }
        }
    }
    buf.freeze()
}

/// Deserializes a tier page written by [`encode_tier`].
pub fn decode_tier<T: Record>(address: Address, page: Bytes) -> Result<Tier<T>> {
    let mut reader = PageReader { address, page };
    let body = match reader.u8()? {
        KIND_INNER => {
            let tag = reader.u8()?;
            let child_type = ChildType::from_tag(tag)
                .ok_or_else(|| reader.corrupted(format!("unknown child type {}", tag)))?;
            let count = reader.u32()? as usize;
            let mut inner = InnerTier::new(child_type);
            inner.branches.reserve(count.min(reader.page.remaining()));
            for _ in 0..count {
                let child = Address(reader.u64()?);
                let pivot = reader.optional_fields()?;
                inner.branches.push(Branch {
                    address: child,
                    pivot,
                });
            }
            TierBody::Inner(inner)
        }
        KIND_LEAF => {
            let next = Address(reader.u64()?);
            let count = reader.u32()? as usize;
            let mut leaf = LeafTier::new();
            leaf.next = next;
            for _ in 0..count {
                let fields = reader.optional_fields()?;
                let len = reader.u32()? as usize;
                let bytes = reader.take(len)?;
                let object =
                    T::decode(bytes).ok_or_else(|| reader.corrupted("undecodable record"))?;
                leaf.buckets.push(Bucket { fields, object });
            }
            TierBody::Leaf(leaf)
        }
        kind => return Err(reader.corrupted(format!("unknown tier kind {}", kind))),
    };
    if reader.page.has_remaining() {
        return Err(reader.corrupted("trailing bytes"));
    }
    Ok(Tier::from_body(address, body))
}

fn put_optional_fields(buf: &mut BytesMut, fields: Option<&FieldVector>) {
    match fields {
        Some(fields) => {
            buf.put_u8(1);
            put_fields(buf, fields);
        }
        None => buf.put_u8(0),
    }
}

fn put_fields(buf: &mut BytesMut, fields: &FieldVector) {
    buf.put_u16_le(fields.len() as u16);
    for value in fields.values() {
        buf.put_u8(value.tag());
        match value {
            FieldValue::Null => {}
            FieldValue::Bool(value) => buf.put_u8(*value as u8),
            FieldValue::Int(value) => buf.put_i64_le(*value),
            FieldValue::UInt(value) => buf.put_u64_le(*value),
            FieldValue::Text(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
            FieldValue::Bytes(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
        }
    }
}

/// Bounds-checked cursor over a page.
struct PageReader {
    address: Address,
    page: Bytes,
}

impl PageReader {
    fn corrupted(&self, reason: impl Into<String>) -> StrataError {
        StrataError::TierCorrupted {
            address: self.address.as_u64(),
            reason: reason.into(),
        }
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.page.remaining() < len {
            return Err(self.corrupted(format!(
                "truncated page: need {} bytes, {} left",
                len,
                self.page.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.page.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.page.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.page.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.page.get_u64_le())
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        self.need(len)?;
        Ok(self.page.split_to(len))
    }

    fn optional_fields(&mut self) -> Result<Option<FieldVector>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.fields()?)),
            flag => Err(self.corrupted(format!("invalid field flag {}", flag))),
        }
    }

    fn fields(&mut self) -> Result<FieldVector> {
        let count = self.u16()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = match self.u8()? {
                0 => FieldValue::Null,
                1 => FieldValue::Bool(self.u8()? != 0),
                2 => FieldValue::Int(self.u64()? as i64),
                3 => FieldValue::UInt(self.u64()?),
                4 => {
                    let len = self.u32()? as usize;
                    let bytes = self.take(len)?;
                    let text = String::from_utf8(bytes.to_vec())
                        .map_err(|_| self.corrupted("invalid utf-8 in text field"))?;
                    FieldValue::Text(text)
                }
                5 => {
                    let len = self.u32()? as usize;
                    FieldValue::Bytes(self.take(len)?)
                }
                tag => return Err(self.corrupted(format!("unknown field tag {}", tag))),
            };
            values.push(value);
        }
        Ok(FieldVector::new(values))
    }
}
