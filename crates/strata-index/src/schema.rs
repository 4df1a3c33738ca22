//! Field extraction and bucket ordering.

use crate::tier::{Bucket, LeafTier};
use std::borrow::Cow;
use std::sync::Arc;
use strata_common::FieldVector;

/// Extracts the ordered key of a stored object.
pub trait FieldExtractor<T>: Send + Sync {
    fn extract(&self, object: &T) -> FieldVector;
}

impl<T, F> FieldExtractor<T> for F
where
    F: Fn(&T) -> FieldVector + Send + Sync,
{
    fn extract(&self, object: &T) -> FieldVector {
        self(object)
    }
}

/// Ordering context shared by a tree and its cursors.
///
/// With `cache_fields` on, every bucket keeps the vector extracted at
/// insert time. With it off, buckets store only the object and fields are
/// re-extracted on each comparison.
pub struct Schema<T> {
    extractor: Arc<dyn FieldExtractor<T>>,
    cache_fields: bool,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            extractor: Arc::clone(&self.extractor),
            cache_fields: self.cache_fields,
        }
    }
}

impl<T> Schema<T> {
    pub fn new(extractor: Arc<dyn FieldExtractor<T>>, cache_fields: bool) -> Self {
        Self {
            extractor,
            cache_fields,
        }
    }

    pub fn cache_fields(&self) -> bool {
        self.cache_fields
    }

    pub fn extract(&self, object: &T) -> FieldVector {
        self.extractor.extract(object)
    }

    /// Wraps an object whose fields were already extracted.
    pub fn bucket(&self, object: T, fields: FieldVector) -> Bucket<T> {
        Bucket {
            fields: self.cache_fields.then_some(fields),
            object,
        }
    }

    /// Returns the fields of a bucket, extracting them if not cached.
    pub fn fields<'a>(&self, bucket: &'a Bucket<T>) -> Cow<'a, FieldVector> {
        match &bucket.fields {
            Some(fields) => Cow::Borrowed(fields),
            None => Cow::Owned(self.extractor.extract(&bucket.object)),
        }
    }

    /// Index of the first bucket whose fields are not less than `fields`.
    pub fn lower_bound(&self, buckets: &[Bucket<T>], fields: &FieldVector) -> usize {
        buckets.partition_point(|bucket| &*self.fields(bucket) < fields)
    }

    /// Index of the first bucket whose fields are greater than `fields`.
    pub fn upper_bound(&self, buckets: &[Bucket<T>], fields: &FieldVector) -> usize {
        buckets.partition_point(|bucket| &*self.fields(bucket) <= fields)
    }

    pub fn first<'a>(&self, leaf: &'a LeafTier<T>) -> Option<Cow<'a, FieldVector>> {
        leaf.buckets.first().map(|bucket| self.fields(bucket))
    }

    pub fn last<'a>(&self, leaf: &'a LeafTier<T>) -> Option<Cow<'a, FieldVector>> {
        leaf.buckets.last().map(|bucket| self.fields(bucket))
    }

    /// Returns the key shared by every bucket, if the leaf holds a single key.
    pub fn uniform_key(&self, leaf: &LeafTier<T>) -> Option<FieldVector> {
        let first = self.first(leaf)?;
        let last = self.last(leaf)?;
        (first == last).then(|| first.into_owned())
    }

    /// Returns true if `next` continues the duplicate run ending `leaf`.
    ///
    /// Branch-referenced leaves always start above the previous leaf's last
    /// key, so a following leaf that starts on that key is an overflow leaf.
    pub fn continues_run(&self, leaf: &LeafTier<T>, next: &LeafTier<T>) -> bool {
        match (self.last(leaf), self.first(next)) {
            (Some(last), Some(first)) => last == first,
            _ => false,
        }
    }
}
