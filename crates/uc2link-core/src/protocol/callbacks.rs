//! Callback dispatch
//!
//! Subscriptions pair a [`MessageMatcher`] with a callback. The processor
//! loop hands every `qid`-tagged message to [`Dispatcher::dispatch`], which
//! invokes each matching callback in registration order. A failing or
//! panicking callback is reported and skipped; the rest still run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::{Message, SessionEvent, SessionObserver};

/// Callback invoked with a matching message
pub type Callback = Box<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Decides whether a subscription wants a message
pub trait MessageMatcher: Send + Sync {
    /// True if the callback should run for `message`
    fn matches(&self, message: &Message) -> bool;

    /// Short label used when reporting callback failures
    fn describe(&self) -> String;
}

/// Matches messages that contain a given top-level key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasKey(pub String);

impl HasKey {
    /// Matcher for messages containing `key`
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl MessageMatcher for HasKey {
    fn matches(&self, message: &Message) -> bool {
        message.contains_key(&self.0)
    }

    fn describe(&self) -> String {
        self.0.clone()
    }
}

/// Matches messages accepted by an arbitrary predicate
pub struct Predicate<F> {
    label: String,
    predicate: F,
}

impl<F> Predicate<F>
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    /// Matcher accepting messages for which `predicate` holds
    pub fn new(label: impl Into<String>, predicate: F) -> Self {
        Self {
            label: label.into(),
            predicate,
        }
    }
}

impl<F> MessageMatcher for Predicate<F>
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn matches(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Handle returned by [`Dispatcher::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    matcher: Box<dyn MessageMatcher>,
    callback: Callback,
}

/// Ordered set of subscriptions
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Dispatcher without subscriptions
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription; it runs after all earlier ones
    pub fn register<M, F>(&self, matcher: M, callback: F) -> SubscriptionId
    where
        M: MessageMatcher + 'static,
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Subscription {
                id,
                matcher: Box::new(matcher),
                callback: Box::new(callback),
            }));
        id
    }

    /// Remove a subscription; false if it was not registered
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching callback, returning how many succeeded
    pub fn dispatch(&self, message: &Message, observer: &dyn SessionObserver) -> usize {
        // Callbacks run without the lock held so they may (un)register
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut succeeded = 0;
        for sub in subs.iter().filter(|s| s.matcher.matches(message)) {
            let error = match panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(message))) {
                Ok(Ok(())) => {
                    succeeded += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => panic_message(payload.as_ref()),
            };
            observer.record_event(&SessionEvent::CallbackFailed {
                key: sub.matcher.describe(),
                error,
            });
        }
        succeeded
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
