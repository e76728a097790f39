//! A minimal, dependency-light metric registry.
//!
//! Every metric is reached through a [`Metric<T>`] handle obtained from a [`Registry`], and
//! every concrete timeseries within that metric is distinguished by its [`Attributes`] (a small
//! set of `key=value` labels). This mirrors how the rest of the workspace instruments itself:
//! register a named metric once at startup, then hand out cheap per-label recorders to whatever
//! code increments them.

#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use parking_lot::Mutex;
use std::{
    any::Any,
    collections::BTreeMap,
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

/// A set of `key=value` labels identifying one timeseries within a [`Metric`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        let mut attrs = Self::new();
        for (k, v) in pairs {
            attrs.insert(k, *v);
        }
        attrs
    }
}

/// A single counter that only ever increases.
#[derive(Debug, Default)]
pub struct U64Counter(AtomicU64);

impl U64Counter {
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up and down, used for point-in-time sizes like `total_size`.
#[derive(Debug, Default)]
pub struct U64Gauge(AtomicU64);

impl U64Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A named metric, parameterized over the kind of instrument it records (a [`U64Counter`], a
/// [`U64Gauge`], ...). Individual timeseries are created lazily per [`Attributes`] set.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    recorders: Arc<Mutex<BTreeMap<Attributes, Arc<T>>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            recorders: Arc::clone(&self.recorders),
        }
    }
}

impl<T> Metric<T>
where
    T: Default,
{
    /// Get (creating if necessary) the recorder for the given attribute set.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> Arc<T> {
        let attributes = attributes.into();
        let mut recorders = self.recorders.lock();
        Arc::clone(
            recorders
                .entry(attributes)
                .or_insert_with(|| Arc::new(T::default())),
        )
    }

    /// Look up the recorder for an attribute set that must already have been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<Arc<T>> {
        self.recorders.lock().get(attributes).map(Arc::clone)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A process-wide collection of named metrics.
///
/// `register_metric` is idempotent per `(name, T)` pair: calling it twice with the same name and
/// instrument type hands back handles to the same underlying timeseries map, which is what lets
/// unrelated parts of the codebase (e.g. the manager and a test harness) observe the same
/// counters.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_metric<T>(&self, name: &'static str, _description: &'static str) -> Metric<T>
    where
        T: Default + Send + Sync + 'static,
    {
        let mut instruments = self.instruments.lock();
        let entry = instruments.entry(name).or_insert_with(|| {
            Box::new(Metric::<T> {
                name,
                recorders: Arc::new(Mutex::new(BTreeMap::new())),
            })
        });
        entry
            .downcast_ref::<Metric<T>>()
            .expect("metric registered twice under the same name with a different instrument type")
            .clone()
    }

    pub fn get_instrument<T>(&self, name: &'static str) -> Option<Metric<T>>
    where
        T: Send + Sync + 'static,
    {
        self.instruments
            .lock()
            .get(name)
            .and_then(|b| b.downcast_ref::<Metric<T>>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_roundtrip() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> =
            registry.register_metric("qbuf_expired_total", "qbufs removed by the ticker");

        let by_timeout = metric.recorder(Attributes::from(&[("trigger", "idle")][..]));
        by_timeout.inc(1);
        by_timeout.inc(2);

        let same = registry
            .get_instrument::<U64Counter>("qbuf_expired_total")
            .unwrap();
        let observer = same
            .get_observer(&Attributes::from(&[("trigger", "idle")][..]))
            .unwrap();
        assert_eq!(observer.fetch(), 3);
    }

    #[test]
    fn unknown_attributes_absent() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("qbuf_total_size_bytes", "size");
        assert!(metric
            .get_observer(&Attributes::from(&[("shard", "0")][..]))
            .is_none());
    }
}
