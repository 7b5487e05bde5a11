//! Publish/subscribe for device output.
//!
//! The dispatcher publishes every inbound line as an [`Event`]. Anyone can
//! [`EventBus::subscribe`] with a [`Matcher`] and get a [`Flag`] set and/or a
//! callback invoked on match. Subscriptions are one-shot unless marked
//! persistent.
//!
//! ```rust
//! use dutbench::events::{EventBus, EventKind, Event, Flag, Matcher, Subscription};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let ready = Arc::new(Flag::default());
//! bus.subscribe(
//!     Subscription::new(EventKind::LineReceived, Matcher::parse("regex:^ready").unwrap())
//!         .with_source(1)
//!         .with_flag(Arc::clone(&ready)),
//! );
//! bus.publish(&Event::line(1, "ready to go"));
//! assert!(ready.is_set());
//! ```

use {
    crate::error::Result,
    log::trace,
    parking_lot::{Condvar, Mutex},
    regex::Regex,
    std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    },
};

/// Prefix selecting a regular expression instead of a substring.
pub const REGEX_PREFIX: &str = "regex:";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A device printed a line.
    LineReceived,
    /// A device's connection died.
    DeviceLost,
}

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// 1-based index of the originating device.
    pub source: Option<usize>,
    /// Line text (or loss reason).
    pub line: String,
}

impl Event {
    /// A received line from device `source`.
    pub fn line(source: usize, line: impl Into<String>) -> Self {
        Self {
            kind: EventKind::LineReceived,
            source: Some(source),
            line: line.into(),
        }
    }
}

/// Literal substring or compiled pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches lines containing the text.
    Literal(String),
    /// Matches lines the regular expression finds a match in.
    Pattern(Regex),
}

impl Matcher {
    /// Parse `regex:<pattern>` into a pattern, anything else into a literal.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(match text.strip_prefix(REGEX_PREFIX) {
            Some(pattern) => Self::Pattern(Regex::new(pattern)?),
            None => Self::Literal(text.to_string()),
        })
    }

    /// Match `line`, returning capture groups (empty for literals).
    pub fn find(&self, line: &str) -> Option<Vec<Option<String>>> {
        match self {
            Self::Literal(text) => line.contains(text.as_str()).then(Vec::new),
            Self::Pattern(re) => re.captures(line).map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect()
            }),
        }
    }
}

/// A successful match handed to callbacks.
#[derive(Debug, Clone)]
pub struct EventMatch {
    /// Device that produced the line.
    pub source: Option<usize>,
    /// Matched line.
    pub line: String,
    /// Capture groups of a pattern matcher.
    pub groups: Vec<Option<String>>,
}

/// A settable flag that threads can wait on.
#[derive(Debug, Default)]
pub struct Flag {
    set: Mutex<bool>,
    changed: Condvar,
}

impl Flag {
    /// Set the flag and wake all waiters.
    pub fn set(&self) {
        *self.set.lock() = true;
        self.changed.notify_all();
    }

    /// Reset the flag.
    pub fn clear(&self) {
        *self.set.lock() = false;
    }

    /// Current state.
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Wait until set or `timeout` passes; returns the final state.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self
                .changed
                .wait_until(&mut set, deadline)
                .timed_out()
            {
                break;
            }
        }
        *set
    }
}

/// Callback invoked with a match.
pub type MatchCallback = Arc<dyn Fn(&EventMatch) + Send + Sync>;

/// Identifies a subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A subscription request.
pub struct Subscription {
    kind: EventKind,
    matcher: Matcher,
    source: Option<usize>,
    flag: Option<Arc<Flag>>,
    callback: Option<MatchCallback>,
    persistent: bool,
}

impl Subscription {
    /// Subscribe to `kind` events matching `matcher` from any device.
    pub fn new(kind: EventKind, matcher: Matcher) -> Self {
        Self {
            kind,
            matcher,
            source: None,
            flag: None,
            callback: None,
            persistent: false,
        }
    }

    /// Only consider events from device `index`.
    #[must_use]
    pub fn with_source(mut self, index: usize) -> Self {
        self.source = Some(index);
        self
    }

    /// Set `flag` on match.
    #[must_use]
    pub fn with_flag(mut self, flag: Arc<Flag>) -> Self {
        self.flag = Some(flag);
        self
    }

    /// Invoke `callback` on match.
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EventMatch) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Keep the subscription after its first match.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    fn evaluate(&self, event: &Event) -> Option<EventMatch> {
        if self.kind != event.kind {
            return None;
        }
        if self.source.is_some() && self.source != event.source {
            return None;
        }
        self.matcher.find(&event.line).map(|groups| EventMatch {
            source: event.source,
            line: event.line.clone(),
            groups,
        })
    }
}

/// Per-run event bus.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<(SubscriptionId, Subscription)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; evaluated after all earlier ones.
    pub fn subscribe(&self, subscription: Subscription) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push((id, subscription));
        id
    }

    /// Remove a subscription. Returns `false` if it already fired or was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// `true` when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate `event` against every subscription in registration order.
    ///
    /// Flags and callbacks run after the bus lock is released, so a callback
    /// may subscribe again.
    pub fn publish(&self, event: &Event) {
        let mut fired = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            subs.retain(|(_, sub)| match sub.evaluate(event) {
                Some(found) => {
                    fired.push((sub.flag.clone(), sub.callback.clone(), found));
                    sub.persistent
                },
                None => true,
            });
        }
        for (flag, callback, found) in fired {
            trace!("event match on {:?}: {}", found.source, found.line);
            if let Some(flag) = flag {
                flag.set();
            }
            if let Some(callback) = callback {
                callback(&found);
            }
        }
    }

    /// Block until a matching event arrives or `timeout` passes.
    pub fn wait_for(
        &self,
        kind: EventKind,
        matcher: Matcher,
        source: Option<usize>,
        timeout: Duration,
    ) -> Option<EventMatch> {
        let flag = Arc::new(Flag::default());
        let slot: Arc<Mutex<Option<EventMatch>>> = Arc::new(Mutex::new(None));
        let (store, notify) = (Arc::clone(&slot), Arc::clone(&flag));
        let mut subscription = Subscription::new(kind, matcher).with_callback(move |found| {
            *store.lock() = Some(found.clone());
            notify.set();
        });
        if let Some(index) = source {
            subscription = subscription.with_source(index);
        }
        let id = self.subscribe(subscription);
        if !flag.wait(timeout) {
            self.unsubscribe(id);
        }
        slot.lock().take()
    }
}
