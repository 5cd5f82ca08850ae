use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use slotmap::{new_key_type, SlotMap};

use crate::iface::Protocol;
use crate::model::{Key, Record};
use crate::timer::{Instant, TimeEventQueue, TimerHandle, WheelTimeEventQueue};

new_key_type! {
    pub struct SubscriptionId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionEvent {
    New,
    Remove,
    Change,
}

/// Which interfaces a subscription cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceFilter {
    Any,
    Index(i32),
}

impl InterfaceFilter {
    pub fn matches(&self, index: i32) -> bool {
        matches!(self, InterfaceFilter::Any) || *self == InterfaceFilter::Index(index)
    }
}

/// Which protocol family a subscription cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFilter {
    Any,
    V4,
    V6,
}

impl ProtocolFilter {
    pub fn matches(&self, protocol: Protocol) -> bool {
        match (self, protocol) {
            (ProtocolFilter::Any, _) => true,
            (ProtocolFilter::V4, Protocol::V4) => true,
            (ProtocolFilter::V6, Protocol::V6) => true,
            _ => false,
        }
    }
}

/// Receives record events for a subscription. A production responder
/// forwards these to whatever client API asked for the subscription (a
/// D-Bus signal, an internal channel, and so on).
pub trait SubscriptionCallback: Send + Sync {
    fn on_event(&self, record: &Record, interface_index: i32, protocol: Protocol, event: SubscriptionEvent);
}

/// Issues the re-query a subscription needs on creation and on every
/// back-off tick. Lets the subscription engine stay agnostic of how many
/// interfaces/schedulers an embedding responder runs.
pub trait QueryDispatch {
    fn post_query(&mut self, interface: InterfaceFilter, protocol: ProtocolFilter, key: &Key);
}

/// Walks every interface's cache for entries matching a freshly created
/// subscription, to deliver the initial batch of `New` events.
pub trait CacheWalker {
    fn walk_matching(
        &self,
        interface: InterfaceFilter,
        protocol: ProtocolFilter,
        key: &Key,
        visit: &mut dyn FnMut(i32, Protocol, Arc<Record>),
    );
}

struct SubscriptionEntry {
    key: Arc<Key>,
    interface: InterfaceFilter,
    protocol: ProtocolFilter,
    callback: Arc<dyn SubscriptionCallback>,
    /// Number of re-queries issued so far, including the implicit first one
    /// at creation. Doubles the back-off delay only while this is `<= 8`,
    /// matching the source's `n_query++ <= 8` exactly: the 9th re-query is
    /// the first to reuse the prior interval rather than the 8th.
    n_query: u32,
    delay: Duration,
    timer: Option<TimerHandle>,
}

/// Tracks live subscriptions and their back-off timers, and dispatches
/// incoming record events to whichever subscriptions match.
pub struct SubscriptionRegistry {
    entries: SlotMap<SubscriptionId, SubscriptionEntry>,
    by_key: HashMap<Arc<Key>, Vec<SubscriptionId>>,
    timers: WheelTimeEventQueue<SubscriptionId>,
}

const INITIAL_DELAY: Duration = Duration::from_secs(1);

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self { entries: SlotMap::with_key(), by_key: HashMap::new(), timers: WheelTimeEventQueue::new() }
    }

    /// Creates a subscription: posts an immediate query for `key`, arms the
    /// back-off timer, and delivers `New` events for every cache entry
    /// already matching `key`.
    pub fn subscribe(
        &mut self,
        dispatch: &mut dyn QueryDispatch,
        walker: &dyn CacheWalker,
        key: Arc<Key>,
        interface: InterfaceFilter,
        protocol: ProtocolFilter,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> SubscriptionId {
        dispatch.post_query(interface, protocol, &key);

        let id = self.entries.insert(SubscriptionEntry {
            key: key.clone(),
            interface,
            protocol,
            callback: callback.clone(),
            n_query: 1,
            delay: INITIAL_DELAY,
            timer: None,
        });
        let handle = self.timers.add(Instant::now() + INITIAL_DELAY, id);
        self.entries[id].timer = Some(handle);

        self.by_key.entry(key.clone()).or_default().push(id);

        walker.walk_matching(interface, protocol, &key, &mut |idx, proto, record| {
            callback.on_event(record.as_ref(), idx, proto, SubscriptionEvent::New);
        });

        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(entry) = self.entries.remove(id) else { return };
        if let Some(h) = entry.timer {
            self.timers.remove(h);
        }
        if let Some(ids) = self.by_key.get_mut(&entry.key) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
    }

    /// Waits for the next back-off timer to elapse and re-issues its query.
    /// Returns `false` once no subscription is pending.
    pub async fn tick(&mut self, dispatch: &mut dyn QueryDispatch) -> bool {
        let Some(id) = self.timers.next().await else { return false };
        self.fire(id, dispatch);
        true
    }

    fn fire(&mut self, id: SubscriptionId, dispatch: &mut dyn QueryDispatch) {
        let Some(entry) = self.entries.get_mut(id) else { return };
        dispatch.post_query(entry.interface, entry.protocol, &entry.key);

        if entry.n_query <= 8 {
            entry.delay *= 2;
        }
        entry.n_query += 1;

        let next = Instant::now() + entry.delay;
        match entry.timer {
            Some(h) => self.timers.update(h, next),
            None => entry.timer = Some(self.timers.add(next, id)),
        }
    }

    /// Dispatches `event` for `record` to every subscription whose key and
    /// interface/protocol filters match.
    pub fn notify(&self, interface_index: i32, protocol: Protocol, record: &Record, event: SubscriptionEvent) {
        let Some(ids) = self.by_key.get(&record.key) else { return };
        for &id in ids {
            let Some(entry) = self.entries.get(id) else { continue };
            if entry.interface.matches(interface_index) && entry.protocol.matches(protocol) {
                entry.callback.on_event(record, interface_index, protocol, event);
            }
        }
    }

    pub fn is_subscribed(&self, key: &Key) -> bool {
        self.by_key.get(key).map_or(false, |ids| !ids.is_empty())
    }

    /// Like `subscribe`, but returns an RAII `SubscriptionHandle` that calls
    /// `unsubscribe` for the caller when dropped, rather than a bare
    /// `SubscriptionId` the caller must remember to release. Requires the
    /// registry to be held behind the `Rc<RefCell<_>>` every single-threaded
    /// embedder already needs for shared ownership.
    pub fn subscribe_handle(
        registry: &Rc<RefCell<SubscriptionRegistry>>,
        dispatch: &mut dyn QueryDispatch,
        walker: &dyn CacheWalker,
        key: Arc<Key>,
        interface: InterfaceFilter,
        protocol: ProtocolFilter,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> SubscriptionHandle {
        let id = registry.borrow_mut().subscribe(dispatch, walker, key, interface, protocol, callback);
        SubscriptionHandle { registry: registry.clone(), id }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle returned by `SubscriptionRegistry::subscribe_handle`: calls
/// `unsubscribe` on drop so a caller can't forget to release a subscription.
pub struct SubscriptionHandle {
    registry: Rc<RefCell<SubscriptionRegistry>>,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.registry.borrow_mut().unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsClass, RecordType};
    use bytes::Bytes;
    use std::sync::Mutex;

    struct RecordingDispatch {
        queries: Vec<(InterfaceFilter, ProtocolFilter)>,
    }

    impl QueryDispatch for RecordingDispatch {
        fn post_query(&mut self, interface: InterfaceFilter, protocol: ProtocolFilter, _key: &Key) {
            self.queries.push((interface, protocol));
        }
    }

    struct EmptyWalker;
    impl CacheWalker for EmptyWalker {
        fn walk_matching(
            &self,
            _interface: InterfaceFilter,
            _protocol: ProtocolFilter,
            _key: &Key,
            _visit: &mut dyn FnMut(i32, Protocol, Arc<Record>),
        ) {
        }
    }

    struct RecordingCallback {
        events: Mutex<Vec<SubscriptionEvent>>,
    }
    impl SubscriptionCallback for RecordingCallback {
        fn on_event(&self, _record: &Record, _interface_index: i32, _protocol: Protocol, event: SubscriptionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn key() -> Arc<Key> {
        Arc::new(Key::new("printer.local", DnsClass::In, RecordType::Ptr))
    }

    #[test]
    fn subscribe_posts_immediate_query() {
        let mut registry = SubscriptionRegistry::new();
        let mut dispatch = RecordingDispatch { queries: Vec::new() };
        let callback = Arc::new(RecordingCallback { events: Mutex::new(Vec::new()) });

        registry.subscribe(&mut dispatch, &EmptyWalker, key(), InterfaceFilter::Any, ProtocolFilter::Any, callback);

        assert_eq!(dispatch.queries.len(), 1);
    }

    #[test]
    fn is_subscribed_tracks_key_presence() {
        let mut registry = SubscriptionRegistry::new();
        let mut dispatch = RecordingDispatch { queries: Vec::new() };
        let callback = Arc::new(RecordingCallback { events: Mutex::new(Vec::new()) });

        assert!(!registry.is_subscribed(&key()));
        let id =
            registry.subscribe(&mut dispatch, &EmptyWalker, key(), InterfaceFilter::Any, ProtocolFilter::Any, callback);
        assert!(registry.is_subscribed(&key()));

        registry.unsubscribe(id);
        assert!(!registry.is_subscribed(&key()));
    }

    #[test]
    fn notify_respects_interface_filter() {
        let mut registry = SubscriptionRegistry::new();
        let mut dispatch = RecordingDispatch { queries: Vec::new() };
        let callback = Arc::new(RecordingCallback { events: Mutex::new(Vec::new()) });

        registry.subscribe(
            &mut dispatch,
            &EmptyWalker,
            key(),
            InterfaceFilter::Index(1),
            ProtocolFilter::Any,
            callback.clone(),
        );

        let record = Record::new(key(), 120, Bytes::from_static(b"\x04host\x00"));
        registry.notify(2, Protocol::V4, &record, SubscriptionEvent::New);
        assert!(callback.events.lock().unwrap().is_empty());

        registry.notify(1, Protocol::V4, &record, SubscriptionEvent::New);
        assert_eq!(callback.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_a_subscription_handle_unsubscribes() {
        let registry = Rc::new(RefCell::new(SubscriptionRegistry::new()));
        let mut dispatch = RecordingDispatch { queries: Vec::new() };
        let callback = Arc::new(RecordingCallback { events: Mutex::new(Vec::new()) });

        let handle = SubscriptionRegistry::subscribe_handle(
            &registry,
            &mut dispatch,
            &EmptyWalker,
            key(),
            InterfaceFilter::Any,
            ProtocolFilter::Any,
            callback,
        );
        assert!(registry.borrow().is_subscribed(&key()));

        drop(handle);
        assert!(!registry.borrow().is_subscribed(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_doubles_for_eight_ticks_then_holds() {
        let mut registry = SubscriptionRegistry::new();
        let mut dispatch = RecordingDispatch { queries: Vec::new() };
        let callback = Arc::new(RecordingCallback { events: Mutex::new(Vec::new()) });

        registry.subscribe(&mut dispatch, &EmptyWalker, key(), InterfaceFilter::Any, ProtocolFilter::Any, callback);
        // the immediate post_query on subscribe already counts as one entry
        assert_eq!(dispatch.queries.len(), 1);

        // delay doubles 1,2,4,...,256 across the first eight re-queries (n_query
        // reaches 9 only after the eighth fire), then holds at 256.
        let deltas = [1u64, 2, 4, 8, 16, 32, 64, 128, 256, 256];
        for (i, &delta) in deltas.iter().enumerate() {
            tokio::time::advance(Duration::from_secs(delta)).await;
            registry.tick(&mut dispatch).await;
            assert_eq!(dispatch.queries.len(), i + 2, "re-query #{} did not fire on schedule", i + 1);
        }
    }
}
