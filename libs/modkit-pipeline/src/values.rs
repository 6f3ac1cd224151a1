//! Per-call operation values.
//!
//! Policies exchange per-call context (custom headers, telemetry ids, poller
//! hints) through a map attached to each [`Request`](crate::Request) instead of
//! ambient state. Entries are keyed by a marker type implementing
//! [`OperationKey`], so two policies can both store a `String` without
//! colliding.
//!
//! ```ignore
//! struct TenantId;
//! impl OperationKey for TenantId {
//!     type Value = String;
//! }
//!
//! request.set_value::<TenantId>("t-42".to_owned());
//! assert_eq!(request.value::<TenantId>().map(String::as_str), Some("t-42"));
//! ```

/// Marker type naming one slot of [`OperationValues`].
pub trait OperationKey: 'static {
    /// Type stored under this key.
    ///
    /// Cloning a request clones the value. Store an `Arc` to share a handle
    /// between the original and its clones.
    type Value: Clone + Send + Sync + 'static;
}

struct Slot<K: OperationKey>(K::Value);

impl<K: OperationKey> Clone for Slot<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Type-keyed bag of per-call values.
#[derive(Clone, Default, Debug)]
pub struct OperationValues {
    inner: http::Extensions,
}

impl OperationValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `K`, returning the previous value if any.
    pub fn insert<K: OperationKey>(&mut self, value: K::Value) -> Option<K::Value> {
        self.inner.insert(Slot::<K>(value)).map(|slot| slot.0)
    }

    #[must_use]
    pub fn get<K: OperationKey>(&self) -> Option<&K::Value> {
        self.inner.get::<Slot<K>>().map(|slot| &slot.0)
    }

    pub fn get_mut<K: OperationKey>(&mut self) -> Option<&mut K::Value> {
        self.inner.get_mut::<Slot<K>>().map(|slot| &mut slot.0)
    }

    pub fn remove<K: OperationKey>(&mut self) -> Option<K::Value> {
        self.inner.remove::<Slot<K>>().map(|slot| slot.0)
    }

    #[must_use]
    pub fn contains<K: OperationKey>(&self) -> bool {
        self.get::<K>().is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
