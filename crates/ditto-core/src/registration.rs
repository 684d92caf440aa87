use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tracing::{debug, trace};

use crate::{
    classification::ClassificationKey,
    error::ClientError,
    selector::{Pointer, Selector},
};

type CancelCallback = Box<dyn FnOnce() + Send>;

/// What a registration listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Selector(Selector),
    Key(ClassificationKey),
    Never,
}

impl Route {
    pub fn matches_pointer(&self, pointer: &Pointer) -> bool {
        match self {
            Route::Selector(selector) => selector.matches(pointer),
            Route::Key(_) | Route::Never => false,
        }
    }

    pub fn matches_key(&self, key: &ClassificationKey) -> bool {
        match self {
            Route::Key(own) => own == key,
            Route::Selector(_) | Route::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Binds a route to a payload until cancelled.
pub struct Registration<T> {
    id: RegistrationId,
    route: RwLock<Route>,
    payload: RwLock<Option<T>>,
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelCallback>>,
}

impl<T: Clone> Registration<T> {
    fn new(id: RegistrationId, route: Route, payload: T, on_cancel: CancelCallback) -> Self {
        Self {
            id,
            route: RwLock::new(route),
            payload: RwLock::new(Some(payload)),
            cancelled: AtomicBool::new(false),
            on_cancel: Mutex::new(Some(on_cancel)),
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn route(&self) -> Route {
        read(&self.route).clone()
    }

    pub fn registered_object(&self) -> Option<T> {
        read(&self.payload).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn matches_pointer(&self, pointer: &Pointer) -> bool {
        read(&self.route).matches_pointer(pointer)
    }

    pub fn matches_key(&self, key: &ClassificationKey) -> bool {
        read(&self.route).matches_key(key)
    }

    /// Idempotent; the owner callback runs exactly once across all callers.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        *write(&self.route) = Route::Never;
        write(&self.payload).take();
        let callback = lock(&self.on_cancel).take();
        if let Some(callback) = callback {
            callback();
        }
        trace!(registration = %self.id, "registration cancelled");
    }
}

/// Caller side of a registration; does not keep it alive.
pub struct RegistrationHandle<T> {
    id: RegistrationId,
    inner: Weak<Registration<T>>,
}

impl<T> Clone for RegistrationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for RegistrationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<T: Clone> RegistrationHandle<T> {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(registration) = self.inner.upgrade() {
            registration.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|registration| !registration.is_cancelled())
    }

    /// The route, or the never-matching sentinel once cancelled.
    pub fn route(&self) -> Route {
        self.inner
            .upgrade()
            .map_or(Route::Never, |registration| registration.route())
    }

    pub fn registered_object(&self) -> Option<T> {
        self.inner
            .upgrade()
            .and_then(|registration| registration.registered_object())
    }
}

struct BusState<T> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<RegistrationId, Arc<Registration<T>>>>,
    named: Mutex<HashMap<String, RegistrationId>>,
}

/// Registry of live registrations, safe under concurrent register, cancel and
/// dispatch.
pub struct RegistrationBus<T> {
    state: Arc<BusState<T>>,
}

impl<T> Clone for RegistrationBus<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RegistrationBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> RegistrationBus<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState {
                next_id: AtomicU64::new(1),
                entries: RwLock::new(HashMap::new()),
                named: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register(
        &self,
        route: Route,
        payload: T,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> RegistrationHandle<T> {
        let id = RegistrationId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        let bus = Arc::downgrade(&self.state);
        let callback: CancelCallback = Box::new(move || {
            if let Some(bus) = bus.upgrade() {
                write(&bus.entries).remove(&id);
                lock(&bus.named).retain(|_, named| *named != id);
            }
            on_cancel();
        });

        let registration = Arc::new(Registration::new(id, route, payload, callback));
        let handle = RegistrationHandle {
            id,
            inner: Arc::downgrade(&registration),
        };
        write(&self.state.entries).insert(id, registration);
        trace!(registration = %id, "registered");
        handle
    }

    /// Register under a caller-chosen id that must be unique on this bus.
    pub fn register_named(
        &self,
        name: impl Into<String>,
        route: Route,
        payload: T,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Result<RegistrationHandle<T>, ClientError> {
        let name = name.into();
        let mut named = lock(&self.state.named);
        if named.contains_key(&name) {
            return Err(ClientError::duplicate_registration(&name));
        }
        let handle = self.register(route, payload, on_cancel);
        named.insert(name.clone(), handle.id());
        debug!(name = %name, registration = %handle.id(), "named registration added");
        Ok(handle)
    }

    /// Cancel a named registration. Returns whether it existed.
    pub fn deregister(&self, name: &str) -> bool {
        let Some(id) = lock(&self.state.named).remove(name) else {
            return false;
        };
        let registration = read(&self.state.entries).get(&id).cloned();
        match registration {
            Some(registration) => {
                registration.cancel();
                true
            }
            None => false,
        }
    }

    /// Live registrations whose route is this key, with their payloads.
    pub fn matching_key(&self, key: &ClassificationKey) -> Vec<(Arc<Registration<T>>, T)> {
        self.collect(|registration| registration.matches_key(key))
    }

    /// Live registrations whose selector matches this pointer.
    pub fn matching_pointer(&self, pointer: &Pointer) -> Vec<(Arc<Registration<T>>, T)> {
        self.collect(|registration| registration.matches_pointer(pointer))
    }

    pub fn len(&self) -> usize {
        read(&self.state.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every registration.
    pub fn clear(&self) {
        let all: Vec<_> = read(&self.state.entries).values().cloned().collect();
        for registration in all {
            registration.cancel();
        }
    }

    fn collect(
        &self,
        predicate: impl Fn(&Registration<T>) -> bool,
    ) -> Vec<(Arc<Registration<T>>, T)> {
        read(&self.state.entries)
            .values()
            .filter(|registration| predicate(registration))
            .filter_map(|registration| {
                registration
                    .registered_object()
                    .map(|payload| (Arc::clone(registration), payload))
            })
            .collect()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, thread};

    use super::*;
    use crate::error::DUPLICATE_REGISTRATION;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_is_idempotent_and_clears_route_and_payload() {
        let bus = RegistrationBus::new();
        let (cancelled, on_cancel) = counter();
        let handle = bus.register(
            Route::Selector(Selector::parse("/things/{thingId}")),
            "handler",
            on_cancel,
        );
        let registration = read(&bus.state.entries)
            .get(&handle.id())
            .cloned()
            .expect("registration should be stored");

        for _ in 0..3 {
            registration.cancel();
            handle.cancel();
        }

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(registration.route(), Route::Never);
        assert!(!registration.matches_pointer(&Pointer::root()));
        assert_eq!(registration.registered_object(), None);
        assert_eq!(handle.registered_object(), None);
        assert!(!handle.is_active());
        assert!(bus.is_empty());
    }

    #[test]
    fn concurrent_cancels_fire_callback_once() {
        let bus = RegistrationBus::new();
        let (cancelled, on_cancel) = counter();
        let handle = bus.register(Route::Key(ClassificationKey::literal("x")), 1_u8, on_cancel);
        let registration = read(&bus.state.entries)
            .get(&handle.id())
            .cloned()
            .expect("registration should be stored");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registration = Arc::clone(&registration);
                thread::spawn(move || registration.cancel())
            })
            .collect();
        for thread in threads {
            thread.join().expect("cancel thread should not panic");
        }

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn matches_keys_and_pointers_separately() {
        let bus = RegistrationBus::new();
        let key = ClassificationKey::correlation_id("c-1");
        bus.register(Route::Key(key.clone()), "by-key", || {});
        bus.register(
            Route::Selector(Selector::parse("/things/{thingId}")),
            "by-pointer",
            || {},
        );

        let by_key: Vec<_> = bus.matching_key(&key).into_iter().map(|(_, p)| p).collect();
        assert_eq!(by_key, ["by-key"]);

        let pointer = Pointer::parse("/things/ns:foo/attributes");
        let by_pointer: Vec<_> = bus
            .matching_pointer(&pointer)
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(by_pointer, ["by-pointer"]);
    }

    #[test]
    fn rejects_duplicate_named_registrations() {
        let bus = RegistrationBus::new();
        let route = Route::Selector(Selector::parse("/things"));
        bus.register_named("changes", route.clone(), 1_u8, || {})
            .expect("first registration should work");

        let err = bus
            .register_named("changes", route, 2_u8, || {})
            .expect_err("duplicate id should fail");
        assert_eq!(err.code, DUPLICATE_REGISTRATION);
    }

    #[test]
    fn deregister_reports_existence_and_frees_the_name() {
        let bus = RegistrationBus::new();
        let (cancelled, on_cancel) = counter();
        let route = Route::Selector(Selector::parse("/things"));
        bus.register_named("changes", route.clone(), 1_u8, on_cancel)
            .expect("registration should work");

        assert!(bus.deregister("changes"));
        assert!(!bus.deregister("changes"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        bus.register_named("changes", route, 2_u8, || {})
            .expect("id should be reusable after deregistration");
    }

    #[test]
    fn cancelling_a_named_handle_frees_the_name() {
        let bus = RegistrationBus::new();
        let route = Route::Selector(Selector::parse("/things"));
        let handle = bus
            .register_named("changes", route.clone(), 1_u8, || {})
            .expect("registration should work");
        handle.cancel();

        assert!(!bus.deregister("changes"));
        bus.register_named("changes", route, 2_u8, || {})
            .expect("id should be reusable after cancellation");
    }

    #[test]
    fn clear_cancels_everything() {
        let bus = RegistrationBus::new();
        let (cancelled, on_cancel) = counter();
        bus.register(Route::Key(ClassificationKey::literal("a")), 1_u8, on_cancel);
        bus.register(Route::Key(ClassificationKey::literal("b")), 2_u8, || {});

        bus.clear();

        assert!(bus.is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
