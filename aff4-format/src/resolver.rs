//! The resolver: attribute store, object construction, per-URN locking and
//! the object caches.
//!
//! A `Resolver` is a cheap, cloneable handle to one session. Objects keep a
//! clone so they can reach their volume and backing store; cached objects
//! therefore keep the session alive until [`Resolver::flush`] empties the
//! caches.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::attrs;
use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::lock::{OpenOptions, UrnLock};
use crate::object::{Handle, Mode, Object, ObjectType};
use crate::store::{AttributeStore, PropertySet};
use crate::urn::Urn;
use crate::value::Value;

/// Builds an object of one type for `urn` from the resolver's attributes.
pub type Constructor = fn(&Resolver, &Urn, Mode) -> Result<Box<dyn Object>>;

/// Called after every effective `set`/`add`.
pub type Observer = Arc<dyn Fn(&Urn, &str, &Value) + Send + Sync>;

const MAX_LINK_DEPTH: usize = 32;

/// Bounded cache of idle objects.
///
/// Eviction is strictly oldest-inserted-first. Returning an object counts as
/// a fresh insertion; lookups do not refresh an entry. Callers relying on a
/// hot object staying cached must keep returning it.
struct ObjectCache {
    capacity: usize,
    entries: VecDeque<(Urn, Box<dyn Object>)>,
}

impl ObjectCache {
    fn new(capacity: usize) -> ObjectCache {
        ObjectCache {
            capacity,
            entries: VecDeque::new(),
        }
    }

    fn take(&mut self, urn: &Urn) -> Option<Box<dyn Object>> {
        let pos = self.entries.iter().position(|(u, _)| u == urn)?;
        self.entries.remove(pos).map(|(_, obj)| obj)
    }

    #[must_use]
    fn put(&mut self, urn: Urn, object: Box<dyn Object>) -> Vec<(Urn, Box<dyn Object>)> {
        let mut evicted = vec![];
        if let Some(old) = self.take(&urn) {
            evicted.push((urn.clone(), old));
        }
        self.entries.push_back((urn, object));
        while self.entries.len() > self.capacity {
            if let Some(entry) = self.entries.pop_front() {
                evicted.push(entry);
            }
        }
        evicted
    }

    fn drain(&mut self) -> Vec<(Urn, Box<dyn Object>)> {
        self.entries.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Inner {
    config: ResolverConfig,
    store: RwLock<AttributeStore>,
    locks: Mutex<HashMap<Urn, Arc<UrnLock>>>,
    read_cache: Mutex<ObjectCache>,
    write_cache: Mutex<ObjectCache>,
    registry: RwLock<HashMap<ObjectType, Constructor>>,
    observers: RwLock<Vec<Observer>>,
    /// Failures closing evicted writers, reported by the next `flush`.
    eviction_errors: Mutex<Vec<Error>>,
}

#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new(ResolverConfig::default())
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.inner.config)
            .field("read_cache", &self.inner.read_cache.lock().len())
            .field("write_cache", &self.inner.write_cache.lock().len())
            .finish()
    }
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Resolver {
        let registry = crate::default_registry();
        Resolver {
            inner: Arc::new(Inner {
                read_cache: Mutex::new(ObjectCache::new(config.read_cache_size)),
                write_cache: Mutex::new(ObjectCache::new(config.write_cache_size)),
                config,
                store: RwLock::new(AttributeStore::new()),
                locks: Mutex::new(HashMap::new()),
                registry: RwLock::new(registry),
                observers: RwLock::new(vec![]),
                eviction_errors: Mutex::new(vec![]),
            }),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.inner.config
    }

    /// Replace the constructor used for `object_type`.
    pub fn register(&self, object_type: ObjectType, constructor: Constructor) {
        self.inner.registry.write().insert(object_type, constructor);
    }

    pub fn observe<F>(&self, observer: F)
    where
        F: Fn(&Urn, &str, &Value) + Send + Sync + 'static,
    {
        self.inner.observers.write().push(Arc::new(observer));
    }

    fn notify(&self, urn: &Urn, attr: &str, value: &Value) {
        let observers = self.inner.observers.read().clone();
        for observer in observers.iter() {
            observer(urn, attr, value);
        }
    }

    // Attribute store

    pub fn set<V: Into<Value>>(&self, urn: &Urn, attr: &str, value: V) {
        let value = value.into();
        self.inner.store.write().set(urn, attr, value.clone());
        self.notify(urn, attr, &value);
    }

    pub fn add<V: Into<Value>>(&self, urn: &Urn, attr: &str, value: V) {
        let value = value.into();
        let added = self.inner.store.write().add(urn, attr, value.clone());
        if added {
            self.notify(urn, attr, &value);
        }
    }

    pub fn delete(&self, urn: &Urn, attr: &str) {
        self.inner.store.write().delete(urn, attr);
    }

    pub fn remove_value(&self, urn: &Urn, attr: &str, value: &Value) {
        self.inner.store.write().remove_value(urn, attr, value);
    }

    pub fn delete_subject(&self, urn: &Urn) {
        self.inner.store.write().delete_subject(urn);
    }

    pub fn resolve(&self, urn: &Urn, attr: &str) -> Option<Value> {
        self.inner.store.read().resolve(urn, attr).cloned()
    }

    pub fn resolve_list(&self, urn: &Urn, attr: &str) -> Vec<Value> {
        self.inner.store.read().resolve_list(urn, attr).to_vec()
    }

    pub fn resolve_u64(&self, urn: &Urn, attr: &str) -> Option<u64> {
        self.inner.store.read().resolve(urn, attr)?.as_u64()
    }

    pub fn resolve_urn(&self, urn: &Urn, attr: &str) -> Option<Urn> {
        self.inner.store.read().resolve(urn, attr)?.as_urn().cloned()
    }

    pub fn resolve_string(&self, urn: &Urn, attr: &str) -> Option<String> {
        self.inner
            .store
            .read()
            .resolve(urn, attr)?
            .as_str()
            .map(str::to_string)
    }

    pub fn resolve_bytes(&self, urn: &Urn, attr: &str) -> Option<Vec<u8>> {
        self.inner
            .store
            .read()
            .resolve(urn, attr)?
            .as_bytes()
            .map(<[u8]>::to_vec)
    }

    pub(crate) fn require_u64(&self, urn: &Urn, attr: &'static str) -> Result<u64> {
        self.resolve_u64(urn, attr).ok_or(Error::MissingAttribute {
            urn: urn.clone(),
            attr,
        })
    }

    pub(crate) fn require_urn(&self, urn: &Urn, attr: &'static str) -> Result<Urn> {
        self.resolve_urn(urn, attr).ok_or(Error::MissingAttribute {
            urn: urn.clone(),
            attr,
        })
    }

    pub fn properties(&self, urn: &Urn) -> Option<PropertySet> {
        self.inner.store.read().properties(urn).cloned()
    }

    pub fn has_subject(&self, urn: &Urn) -> bool {
        self.inner.store.read().contains(urn)
    }

    pub fn subjects_under(&self, base: &Urn) -> Vec<Urn> {
        self.inner.store.read().subjects_under(base)
    }

    /// Run `f` with shared access to the whole store.
    pub fn with_store<R, F: FnOnce(&AttributeStore) -> R>(&self, f: F) -> R {
        f(&self.inner.store.read())
    }

    // Object lifecycle

    /// Start building a new object of `object_type`.
    pub fn create(&self, object_type: ObjectType) -> Draft {
        Draft {
            resolver: self.clone(),
            object_type,
            urn: None,
            properties: PropertySet::new(),
        }
    }

    pub fn open(&self, urn: &Urn, mode: Mode) -> Result<Handle<dyn Object>> {
        self.open_with(urn, mode, &self.default_open_options())
    }

    pub fn open_as<T: Object>(&self, urn: &Urn, mode: Mode) -> Result<Handle<T>> {
        self.open(urn, mode)?.downcast::<T>()
    }

    pub fn open_as_with<T: Object>(
        &self,
        urn: &Urn,
        mode: Mode,
        options: &OpenOptions,
    ) -> Result<Handle<T>> {
        self.open_with(urn, mode, options)?.downcast::<T>()
    }

    /// Open `urn`, following links, waiting for its lock as `options` allow.
    pub fn open_with(
        &self,
        urn: &Urn,
        mode: Mode,
        options: &OpenOptions,
    ) -> Result<Handle<dyn Object>> {
        let urn = self.follow_links(urn)?;
        let lease = self
            .lock_for(&urn)
            .acquire(self.inner.config.detect_reentrancy, options)?;

        if let Some(mut object) = self.cache(mode).lock().take(&urn) {
            tracing::trace!(urn = %urn, ?mode, "object cache hit");
            // Writers keep their position; readers always start at 0.
            if mode == Mode::Read {
                if let Some(stream) = object.as_stream() {
                    stream.seek(SeekFrom::Start(0))?;
                }
            }
            return Ok(Handle::new(object, lease, self.clone()));
        }

        let object_type = self.object_type_of(&urn)?;
        let object = self.construct(object_type, &urn, mode)?;
        tracing::debug!(urn = %urn, ?mode, %object_type, "opened object");
        Ok(Handle::new(object, lease, self.clone()))
    }

    /// Release the handle's URN and keep the object for the next `open`.
    pub fn cache_return<T: ?Sized + Object>(&self, handle: Handle<T>) {
        let (object, lease) = match handle.into_parts() {
            Some(parts) => parts,
            None => return,
        };
        let object = object.into_object();
        let urn = object.urn().clone();
        let mode = object.mode();

        let evicted = self.cache(mode).lock().put(urn, object);
        drop(lease);

        for (urn, object) in evicted {
            self.evict(urn, object);
        }
    }

    /// Close every cached write-side object and empty both caches.
    ///
    /// Closing a writer may return further writers to the cache (a segment
    /// hands its volume back, a volume its backing store), so this repeats
    /// until the write cache stays empty. Every writer is closed even when
    /// some fail; the first failure is returned, including failures of
    /// writers evicted since the previous flush.
    pub fn flush(&self) -> Result<()> {
        let mut errors = std::mem::take(&mut *self.inner.eviction_errors.lock());
        loop {
            let writers = self.inner.write_cache.lock().drain();
            let readers = self.inner.read_cache.lock().drain();
            drop(readers);
            if writers.is_empty() {
                break;
            }

            for (urn, mut object) in writers {
                let lease = match self
                    .lock_for(&urn)
                    .acquire(false, &self.default_open_options())
                {
                    Ok(lease) => lease,
                    Err(err) => {
                        tracing::warn!(urn = %urn, error = %err, "could not lock cached writer");
                        errors.push(err);
                        continue;
                    }
                };
                if let Err(err) = object.close() {
                    tracing::warn!(urn = %urn, error = %err, "closing cached object failed");
                    errors.push(err);
                }
                drop(lease);
            }
        }
        errors.append(&mut self.inner.eviction_errors.lock());
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop any read-side cached instance of `urn`, e.g. after it was rewritten.
    pub(crate) fn invalidate(&self, urn: &Urn) {
        if self.inner.read_cache.lock().take(urn).is_some() {
            tracing::trace!(urn = %urn, "invalidated cached reader");
        }
    }

    /// Resolve the concrete type of `urn`: an explicit `aff4:type` attribute
    /// takes priority, then the URN scheme.
    pub fn object_type_of(&self, urn: &Urn) -> Result<ObjectType> {
        if let Some(tag) = self.resolve_string(urn, attrs::TYPE) {
            return ObjectType::from_tag(&tag).ok_or_else(|| Error::NotFound(urn.clone()));
        }
        match urn.scheme() {
            Some("file") => Ok(ObjectType::File),
            _ => Err(Error::NotFound(urn.clone())),
        }
    }

    fn follow_links(&self, urn: &Urn) -> Result<Urn> {
        let mut current = urn.clone();
        for _ in 0..MAX_LINK_DEPTH {
            if self.resolve_string(&current, attrs::TYPE).as_deref()
                != Some(ObjectType::Link.tag())
            {
                return Ok(current);
            }
            current = self.require_urn(&current, attrs::TARGET)?;
        }
        Err(Error::structural(format!(
            "link chain starting at {} is too deep or cyclic",
            urn
        )))
    }

    fn construct(&self, object_type: ObjectType, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let constructor = self
            .inner
            .registry
            .read()
            .get(&object_type)
            .copied()
            .ok_or_else(|| Error::NotFound(urn.clone()))?;
        constructor(self, urn, mode)
    }

    fn lock_for(&self, urn: &Urn) -> Arc<UrnLock> {
        self.inner
            .locks
            .lock()
            .entry(urn.clone())
            .or_insert_with(|| Arc::new(UrnLock::new(urn.clone())))
            .clone()
    }

    fn cache(&self, mode: Mode) -> &Mutex<ObjectCache> {
        match mode {
            Mode::Read => &self.inner.read_cache,
            Mode::Write => &self.inner.write_cache,
        }
    }

    fn default_open_options(&self) -> OpenOptions {
        OpenOptions {
            timeout: self.inner.config.lock_timeout,
            cancel: None,
        }
    }

    fn evict(&self, urn: Urn, mut object: Box<dyn Object>) {
        if object.mode() == Mode::Read {
            tracing::trace!(urn = %urn, "evicted cached reader");
            return;
        }

        tracing::debug!(urn = %urn, "evicting cached writer; closing it");
        let lease = match self
            .lock_for(&urn)
            .acquire(false, &self.default_open_options())
        {
            Ok(lease) => lease,
            Err(err) => {
                tracing::warn!(urn = %urn, error = %err, "could not lock evicted writer");
                self.inner.eviction_errors.lock().push(err);
                return;
            }
        };
        if let Err(err) = object.close() {
            tracing::warn!(urn = %urn, error = %err, "closing evicted writer failed");
            self.inner.eviction_errors.lock().push(err);
        }
        drop(lease);
    }
}

/// An object under construction: properties accumulate here and are
/// published to the resolver only by [`Draft::finish`].
#[derive(Debug)]
pub struct Draft {
    resolver: Resolver,
    object_type: ObjectType,
    urn: Option<Urn>,
    properties: PropertySet,
}

impl Draft {
    /// Bind the object to `urn` instead of a fresh random URN.
    pub fn urn(mut self, urn: Urn) -> Draft {
        self.urn = Some(urn);
        self
    }

    pub fn set<V: Into<Value>>(mut self, attr: &str, value: V) -> Draft {
        self.properties.set(attr, value.into());
        self
    }

    pub fn add<V: Into<Value>>(mut self, attr: &str, value: V) -> Draft {
        self.properties.add(attr, value.into());
        self
    }

    /// Lock the URN, publish the properties and construct the object in
    /// write mode.
    pub fn finish(self) -> Result<Handle<dyn Object>> {
        let Draft {
            resolver,
            object_type,
            urn,
            properties,
        } = self;
        let urn = urn.unwrap_or_else(Urn::random);

        let lease = resolver
            .lock_for(&urn)
            .acquire(resolver.config().detect_reentrancy, &resolver.default_open_options())?;

        if resolver.inner.write_cache.lock().take(&urn).is_some() {
            tracing::debug!(urn = %urn, "discarding cached writer replaced by a new object");
        }
        resolver.invalidate(&urn);

        resolver.set(&urn, attrs::TYPE, object_type.tag());
        for (attr, values) in properties.iter() {
            resolver.delete(&urn, attr);
            for value in values {
                resolver.add(&urn, attr, value.clone());
            }
        }

        let object = resolver.construct(object_type, &urn, Mode::Write)?;
        tracing::debug!(urn = %urn, %object_type, "created object");
        Ok(Handle::new(object, lease, resolver))
    }

    pub fn finish_as<T: Object>(self) -> Result<Handle<T>> {
        self.finish()?.downcast::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Dummy {
        urn: Urn,
        mode: Mode,
        closes: Arc<AtomicUsize>,
    }

    impl Object for Dummy {
        fn urn(&self) -> &Urn {
            &self.urn
        }

        fn object_type(&self) -> ObjectType {
            ObjectType::Link
        }

        fn mode(&self) -> Mode {
            self.mode
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.urn.as_str().ends_with("broken") {
                return Err(Error::structural(format!("{} cannot be written", self.urn)));
            }
            Ok(())
        }
    }

    fn dummy_resolver(config: ResolverConfig) -> Resolver {
        let resolver = Resolver::new(config);
        resolver.register(ObjectType::Segment, |_, urn, mode| {
            Ok(Box::new(Dummy {
                urn: urn.clone(),
                mode,
                closes: Arc::new(AtomicUsize::new(0)),
            }))
        });
        resolver
    }

    fn dummy_urn(resolver: &Resolver, name: &str) -> Urn {
        let urn = Urn::new(format!("aff4://{}", name));
        resolver.set(&urn, attrs::TYPE, ObjectType::Segment.tag());
        urn
    }

    #[test]
    fn open_unknown_urn_is_not_found() {
        let resolver = Resolver::default();
        let err = resolver
            .open(&Urn::new("aff4://nothing"), Mode::Read)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn observers_see_effective_mutations() {
        let resolver = Resolver::default();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            resolver.observe(move |_, attr, _| {
                if attr == attrs::SIZE {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let urn = Urn::new("aff4://x");
        resolver.set(&urn, attrs::SIZE, 1u64);
        resolver.add(&urn, attrs::SIZE, 2u64);
        resolver.add(&urn, attrs::SIZE, 2u64);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_return_reuses_instance() {
        let resolver = dummy_resolver(ResolverConfig::default());
        let urn = dummy_urn(&resolver, "cached");
        let handle = resolver.open_as::<Dummy>(&urn, Mode::Read).unwrap();
        let closes = handle.closes.clone();
        resolver.cache_return(handle);

        let handle = resolver.open_as::<Dummy>(&urn, Mode::Read).unwrap();
        assert!(Arc::ptr_eq(&closes, &handle.closes));
        resolver.cache_return(handle);
    }

    #[test]
    fn cache_evicts_oldest_inserted_first() {
        let config = ResolverConfig {
            write_cache_size: 2,
            ..ResolverConfig::default()
        };
        let resolver = dummy_resolver(config);
        let urns: Vec<_> = (0..3).map(|i| dummy_urn(&resolver, &format!("w{}", i))).collect();

        let mut counters = vec![];
        for urn in &urns {
            let handle = resolver.open_as::<Dummy>(urn, Mode::Write).unwrap();
            counters.push(handle.closes.clone());
            resolver.cache_return(handle);
        }
        assert_eq!(counters[0].load(Ordering::SeqCst), 1);
        assert_eq!(counters[1].load(Ordering::SeqCst), 0);
        assert_eq!(counters[2].load(Ordering::SeqCst), 0);

        resolver.flush().unwrap();
        assert_eq!(counters[1].load(Ordering::SeqCst), 1);
        assert_eq!(counters[2].load(Ordering::SeqCst), 1);
    }

    #[test]
    fn typed_open_of_wrong_type_fails_and_releases() {
        let resolver = dummy_resolver(ResolverConfig::default());
        let urn = dummy_urn(&resolver, "typed");
        let err = resolver
            .open_as::<crate::Segment>(&urn, Mode::Read)
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        let handle = resolver
            .open_with(&urn, Mode::Read, &OpenOptions::timeout(Duration::from_millis(200)))
            .unwrap();
        resolver.cache_return(handle);
    }

    #[test]
    fn links_resolve_to_their_target() {
        let resolver = dummy_resolver(ResolverConfig::default());
        let target = dummy_urn(&resolver, "target");
        let link = Urn::new("aff4://link");
        resolver.set(&link, attrs::TYPE, ObjectType::Link.tag());
        resolver.set(&link, attrs::TARGET, target.clone());

        let handle = resolver.open(&link, Mode::Read).unwrap();
        assert_eq!(handle.urn(), &target);
        resolver.cache_return(handle);
    }

    #[test]
    fn reopening_held_urn_on_same_thread_blocks() {
        let resolver = dummy_resolver(ResolverConfig::default());
        let urn = dummy_urn(&resolver, "held");
        let (tx, rx) = mpsc::channel();

        {
            let resolver = resolver.clone();
            std::thread::spawn(move || {
                let first = resolver.open(&urn, Mode::Read).unwrap();
                // Never returns: the same thread still holds `first`.
                let second = resolver.open(&urn, Mode::Read);
                let _ = tx.send(second.is_ok());
                drop(first);
            });
        }

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn reentrancy_detection_fails_fast() {
        let config = ResolverConfig {
            detect_reentrancy: true,
            ..ResolverConfig::default()
        };
        let resolver = dummy_resolver(config);
        let urn = dummy_urn(&resolver, "reentrant");
        let first = resolver.open(&urn, Mode::Read).unwrap();
        let err = resolver.open(&urn, Mode::Read).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyHazard(_)));
        resolver.cache_return(first);
    }

    #[test]
    fn failed_eviction_surfaces_at_flush() {
        let config = ResolverConfig {
            write_cache_size: 1,
            ..ResolverConfig::default()
        };
        let resolver = dummy_resolver(config);
        let broken = dummy_urn(&resolver, "broken");
        let fine = dummy_urn(&resolver, "fine");

        let handle = resolver.open_as::<Dummy>(&broken, Mode::Write).unwrap();
        let broken_closes = handle.closes.clone();
        resolver.cache_return(handle);
        let handle = resolver.open_as::<Dummy>(&fine, Mode::Write).unwrap();
        let fine_closes = handle.closes.clone();
        resolver.cache_return(handle);
        assert_eq!(broken_closes.load(Ordering::SeqCst), 1);

        assert!(matches!(resolver.flush(), Err(Error::Structural(_))));
        assert_eq!(fine_closes.load(Ordering::SeqCst), 1);
        resolver.flush().unwrap();
    }

    #[test]
    fn flush_closes_every_writer_despite_failures() {
        let resolver = dummy_resolver(ResolverConfig::default());
        let urns = [dummy_urn(&resolver, "a-broken"), dummy_urn(&resolver, "b")];
        let mut counters = vec![];
        for urn in &urns {
            let handle = resolver.open_as::<Dummy>(urn, Mode::Write).unwrap();
            counters.push(handle.closes.clone());
            resolver.cache_return(handle);
        }

        assert!(resolver.flush().is_err());
        for closes in &counters {
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn cached_reader_is_rewound_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abcdef").unwrap();
        let resolver = Resolver::default();
        let urn = Urn::from_path(&path).unwrap();

        let mut handle = resolver.open(&urn, Mode::Read).unwrap();
        let mut buf = [0u8; 4];
        handle.stream().unwrap().read_exact(&mut buf).unwrap();
        resolver.cache_return(handle);

        let mut handle = resolver.open(&urn, Mode::Read).unwrap();
        let mut all = vec![];
        handle.stream().unwrap().read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abcdef");
        resolver.cache_return(handle);
    }
}
