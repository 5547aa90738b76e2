//! Extension utilities: URI helpers and the typed tag table carried by
//! requests and calls.

use std::sync::Mutex;

use http::uri::Scheme;
use http::{Extensions, Uri};

/// Extension trait for `Uri` helpers.
pub(crate) trait UriExt {
    /// Returns true if the URI scheme is HTTPS.
    fn is_https(&self) -> bool;

    /// Returns the port of the URI, or the default port for the scheme
    /// if none is specified.
    fn port_or_default(&self) -> u16;
}

impl UriExt for Uri {
    #[inline]
    fn is_https(&self) -> bool {
        self.scheme() == Some(&Scheme::HTTPS)
    }

    fn port_or_default(&self) -> u16 {
        match Uri::port(self) {
            Some(p) => p.as_u16(),
            None if self.is_https() => 443u16,
            _ => 80u16,
        }
    }
}

/// A table of values keyed by their type, shared by a request and the
/// calls created from it.
///
/// Lookups clone the stored value; computing a missing value runs
/// without any lock held, so two racing computations may both run, but
/// only one result is stored and every caller observes that one.
#[derive(Debug, Default)]
pub struct TagMap {
    inner: Mutex<Extensions>,
}

impl TagMap {
    pub(crate) fn new() -> TagMap {
        TagMap::default()
    }

    /// Snapshot the current contents, e.g. for seeding a call from its
    /// request.
    pub(crate) fn snapshot(&self) -> TagMap {
        TagMap {
            inner: Mutex::new(self.lock().clone()),
        }
    }

    /// Look up the tag of type `T`.
    pub fn tag<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.lock().get::<T>().cloned()
    }

    /// Store a tag of type `T`, replacing any existing one.
    pub fn insert_tag<T>(&self, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.lock().insert(value);
    }

    /// Return the tag of type `T`, computing and storing it if absent.
    ///
    /// The computation runs outside the lock. When computations race,
    /// the first stored value wins and is returned to every caller.
    pub fn tag_or_compute<T, F>(&self, compute: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.tag::<T>() {
            return existing;
        }

        let computed = compute();

        let mut map = self.lock();
        match map.get::<T>() {
            Some(existing) => existing.clone(),
            None => {
                map.insert(computed.clone());
                computed
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Extensions> {
        self.inner.lock().expect("tag map poisoned")
    }
}
