use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{error, trace};

use crate::{
    classification::ClassificationKey,
    error::{ClientError, ErrorCategory, SESSION_CLOSED},
    protocol::Inbound,
    registration::{Registration, RegistrationBus, RegistrationHandle, Route},
    selector::{Pointer, Selector},
};

/// User callback for classified inbound messages.
pub type Handler = Arc<dyn Fn(Inbound) + Send + Sync>;

type OnceSlot = Arc<Mutex<Option<oneshot::Sender<Inbound>>>>;

/// How a registration wants its messages.
#[derive(Clone)]
pub enum Subscriber {
    /// Completes a pending reply and cancels itself.
    Once(OnceSlot),
    /// Each delivery is its own task on the delivery executor.
    Concurrent(Handler),
    /// Deliveries are queued to one worker and run in arrival order.
    Sequential(mpsc::UnboundedSender<Inbound>),
}

/// Routes classified inbound messages to registrations on the delivery
/// executor so handlers never run on the transport reader.
#[derive(Clone)]
pub struct Dispatcher {
    bus: RegistrationBus<Subscriber>,
    delivery: Handle,
}

impl Dispatcher {
    pub fn new(delivery: Handle) -> Self {
        Self {
            bus: RegistrationBus::new(),
            delivery,
        }
    }

    pub fn bus(&self) -> &RegistrationBus<Subscriber> {
        &self.bus
    }

    /// Register a one-shot reply slot before the request goes out.
    pub fn expect_once(&self, key: ClassificationKey) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let slot: OnceSlot = Arc::new(Mutex::new(Some(tx)));
        let handle = self
            .bus
            .register(Route::Key(key.clone()), Subscriber::Once(slot), || {});
        PendingReply {
            key,
            handle,
            receiver: rx,
        }
    }

    /// Subscribe to a key; sequential keys get a dedicated ordered worker.
    pub fn subscribe(
        &self,
        key: ClassificationKey,
        handler: Handler,
    ) -> RegistrationHandle<Subscriber> {
        let (subscriber, on_cancel) = self.subscriber_for(key.must_be_sequential(), handler);
        self.bus.register(Route::Key(key), subscriber, on_cancel)
    }

    /// Register a change handler under a caller-chosen unique id.
    pub fn register(
        &self,
        id: impl Into<String>,
        selector: Selector,
        handler: Handler,
    ) -> Result<RegistrationHandle<Subscriber>, ClientError> {
        let (subscriber, on_cancel) = self.subscriber_for(false, handler);
        self.bus
            .register_named(id, Route::Selector(selector), subscriber, on_cancel)
    }

    pub fn deregister(&self, id: &str) -> bool {
        self.bus.deregister(id)
    }

    /// Deliver to every registration on `key`. Returns how many matched.
    pub fn dispatch_key(&self, key: &ClassificationKey, message: Inbound) -> usize {
        let matches = self.bus.matching_key(key);
        trace!(key = %key, matches = matches.len(), "dispatching by key");
        self.deliver(matches, message)
    }

    /// Deliver to every registration whose selector matches `pointer`.
    pub fn dispatch_pointer(&self, pointer: &Pointer, message: Inbound) -> usize {
        let matches = self.bus.matching_pointer(pointer);
        trace!(pointer = %pointer, matches = matches.len(), "dispatching by pointer");
        self.deliver(matches, message)
    }

    /// Drop every registration, failing pending replies.
    pub fn clear(&self) {
        self.bus.clear();
    }

    fn deliver(
        &self,
        matches: Vec<(Arc<Registration<Subscriber>>, Subscriber)>,
        message: Inbound,
    ) -> usize {
        let delivered = matches.len();
        for (registration, subscriber) in matches {
            match subscriber {
                Subscriber::Once(slot) => {
                    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(sender) = sender {
                        let _ = sender.send(message.clone());
                    }
                    registration.cancel();
                }
                Subscriber::Concurrent(handler) => {
                    let message = message.clone();
                    self.delivery.spawn(async move {
                        invoke(&handler, message);
                    });
                }
                Subscriber::Sequential(queue) => {
                    if queue.send(message.clone()).is_err() {
                        registration.cancel();
                    }
                }
            }
        }
        delivered
    }

    fn subscriber_for(
        &self,
        sequential: bool,
        handler: Handler,
    ) -> (Subscriber, Box<dyn FnOnce() + Send>) {
        if !sequential {
            return (Subscriber::Concurrent(handler), Box::new(|| {}));
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let worker = self.delivery.spawn(async move {
            while let Some(message) = rx.recv().await {
                invoke(&handler, message);
            }
        });
        (
            Subscriber::Sequential(tx),
            Box::new(move || worker.abort()),
        )
    }
}

/// Handler panics are logged and never reach the executor.
fn invoke(handler: &Handler, message: Inbound) {
    if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
        error!("message handler panicked");
    }
}

/// A registered one-shot reply. Dropping it removes the registration.
pub struct PendingReply {
    key: ClassificationKey,
    handle: RegistrationHandle<Subscriber>,
    receiver: oneshot::Receiver<Inbound>,
}

impl PendingReply {
    pub fn key(&self) -> &ClassificationKey {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<Inbound, ClientError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ClientError::new(
                ErrorCategory::Network,
                SESSION_CLOSED,
                format!("reply slot for {} was dropped", self.key),
            )),
            Err(_) => Err(ClientError::request_timeout(&self.key, timeout)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::REQUEST_TIMEOUT;

    fn control(text: &str) -> Inbound {
        Inbound::Control(text.to_owned())
    }

    #[tokio::test]
    async fn once_reply_is_delivered_once_and_removed() {
        let dispatcher = Dispatcher::new(Handle::current());
        let key = ClassificationKey::literal("START-SEND-EVENTS:ACK");
        let pending = dispatcher.expect_once(key.clone());

        assert_eq!(dispatcher.dispatch_key(&key, control("START-SEND-EVENTS:ACK")), 1);
        assert_eq!(dispatcher.dispatch_key(&key, control("START-SEND-EVENTS:ACK")), 0);

        let reply = pending
            .wait(Duration::from_secs(1))
            .await
            .expect("reply should arrive");
        assert_eq!(reply, control("START-SEND-EVENTS:ACK"));
        assert!(dispatcher.bus().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn once_reply_times_out_and_unregisters() {
        let dispatcher = Dispatcher::new(Handle::current());
        let key = ClassificationKey::correlation_id("c-1");
        let pending = dispatcher.expect_once(key.clone());

        let err = pending
            .wait(Duration::from_secs(5))
            .await
            .expect_err("nothing answers");
        assert_eq!(err.code, REQUEST_TIMEOUT);
        assert!(dispatcher.bus().is_empty());
        assert_eq!(dispatcher.dispatch_key(&key, control("late")), 0);
    }

    #[tokio::test]
    async fn sequential_subscription_preserves_order() {
        let dispatcher = Dispatcher::new(Handle::current());
        let key = ClassificationKey::search_subscription("s-1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(
            key.clone(),
            Arc::new(move |message: Inbound| {
                let _ = tx.send(message);
            }),
        );

        for n in 0..50 {
            dispatcher.dispatch_key(&key, control(&n.to_string()));
        }

        for n in 0..50 {
            let message = rx.recv().await.expect("message should be delivered");
            assert_eq!(message, control(&n.to_string()));
        }
    }

    #[tokio::test]
    async fn pointer_dispatch_reaches_matching_handlers_only() {
        let dispatcher = Dispatcher::new(Handle::current());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        dispatcher
            .register(
                "attributes",
                Selector::parse("/things/{thingId}/attributes"),
                Arc::new(move |message: Inbound| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(message);
                }),
            )
            .expect("registration should work");

        let miss = Pointer::parse("/things/ns:foo/features");
        let hit = Pointer::parse("/things/ns:foo/attributes/maker");
        assert_eq!(dispatcher.dispatch_pointer(&miss, control("miss")), 0);
        assert_eq!(dispatcher.dispatch_pointer(&hit, control("hit")), 1);

        let message = rx.recv().await.expect("handler should run");
        assert_eq!(message, control("hit"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(dispatcher.deregister("attributes"));
        assert_eq!(dispatcher.dispatch_pointer(&hit, control("hit")), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_worker() {
        let dispatcher = Dispatcher::new(Handle::current());
        let key = ClassificationKey::search_subscription("s-2");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(
            key.clone(),
            Arc::new(move |message: Inbound| {
                if message == Inbound::Control("boom".into()) {
                    panic!("handler failure");
                }
                let _ = tx.send(message);
            }),
        );

        dispatcher.dispatch_key(&key, control("boom"));
        dispatcher.dispatch_key(&key, control("after"));

        let message = rx.recv().await.expect("worker should survive the panic");
        assert_eq!(message, control("after"));
    }

    #[tokio::test]
    async fn clear_fails_pending_replies() {
        let dispatcher = Dispatcher::new(Handle::current());
        let pending = dispatcher.expect_once(ClassificationKey::correlation_id("c-2"));

        dispatcher.clear();

        let err = pending
            .wait(Duration::from_secs(1))
            .await
            .expect_err("cleared slot should fail");
        assert_eq!(err.code, SESSION_CLOSED);
    }
}
