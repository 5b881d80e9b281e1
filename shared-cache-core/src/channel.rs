//! Channels: per-worker mailboxes stored in one blob per channel, drained by
//! scheduler-driven listeners.
//!
//! A channel `K` lives at `channel_prefix + K` as a map of worker id to
//! [`Mailbox`]. Every read-modify-write of that blob runs in a blocking
//! executor section keyed on the storage key. Messages published before
//! any mailbox exists wait in the default bucket until the first listener
//! is created, which hands the backlog to every mailbox present at that
//! moment.

use dashmap::mapref::entry::Entry as MapEntry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::SharedCache;
use crate::config::DeliveryMode;
use crate::error::{CacheError, Result};
use crate::scheduler::{Task, TaskHandle};

/// Key of the set of process ids owning signal-driven listeners
pub const SIGNAL_REGISTRY_KEY: &str = "#ChannelPidList#";

/// Called with `(channel, worker, message)` for each delivered message
pub type ListenerCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// One worker's slot in a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    /// Scheduler task of the listening worker, if one is listening
    #[serde(default)]
    pub listener: Option<u64>,
    /// Pending messages, oldest first
    #[serde(default)]
    pub queue: VecDeque<String>,
}

type ChannelBlob = BTreeMap<String, Mailbox>;

impl SharedCache {
    /// Storage key of a channel
    pub fn channel_key(&self, channel: &str) -> String {
        format!("{}{}", self.inner.config.channel_prefix, channel)
    }

    fn load_channel(&self, storage_key: &str) -> Result<ChannelBlob> {
        match self.inner.store.fetch(storage_key) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ChannelBlob::new()),
        }
    }

    fn save_channel(&self, storage_key: &str, blob: &ChannelBlob) -> Result<()> {
        if blob.is_empty() {
            self.inner.store.delete(&[storage_key]);
        } else {
            self.inner
                .store
                .store(storage_key, &serde_json::to_string(blob)?, None);
        }
        Ok(())
    }

    fn with_channel<T>(
        &self,
        channel: &str,
        method: &str,
        params: serde_json::Value,
        update: impl FnOnce(&mut ChannelBlob) -> Result<(T, bool)>,
    ) -> Result<Option<T>> {
        let storage_key = self.channel_key(channel);
        self.inner
            .executor
            .run_exclusive(&storage_key, method, params, true, || {
                let mut blob = self.load_channel(&storage_key)?;
                let (result, dirty) = update(&mut blob)?;
                if dirty {
                    self.save_channel(&storage_key, &blob)?;
                }
                Ok(result)
            })
    }

    fn signal_mode(&self) -> bool {
        self.inner.config.delivery_mode == DeliveryMode::Signal
    }

    fn update_signal_registry(&self, register: bool) -> Result<()> {
        let pid = self.inner.scheduler.process_id();
        let store = &self.inner.store;
        let method = if register { "register" } else { "deregister" };

        self.inner.executor.run_exclusive(
            SIGNAL_REGISTRY_KEY,
            method,
            json!([pid]),
            true,
            || {
                let mut pids: BTreeSet<u32> = match store.fetch(SIGNAL_REGISTRY_KEY) {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => BTreeSet::new(),
                };
                let changed = if register {
                    pids.insert(pid)
                } else {
                    pids.remove(&pid)
                };
                if changed {
                    if pids.is_empty() {
                        store.delete(&[SIGNAL_REGISTRY_KEY]);
                    } else {
                        store.store(SIGNAL_REGISTRY_KEY, &serde_json::to_string(&pids)?, None);
                    }
                    debug!(pid, register, "signal registry updated");
                }
                Ok(())
            },
        )?;
        Ok(())
    }

    /// Process ids currently registered for signal delivery
    pub fn signal_registry(&self) -> Result<BTreeSet<u32>> {
        self.ensure_backend()?;
        match self.inner.store.fetch(SIGNAL_REGISTRY_KEY) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn signal_listeners(&self) -> Result<()> {
        for pid in self.signal_registry()? {
            if !self.inner.scheduler.send_signal(pid) {
                debug!(pid, "signal not delivered");
            }
        }
        Ok(())
    }

    /// Publishes `message` on `channel`.
    ///
    /// With no mailbox yet the message is kept only when `store` is set: in
    /// `worker`'s mailbox if given, else in the default bucket. Otherwise it
    /// goes to `worker`, or to every mailbox when `worker` is `None`, each
    /// time only if `store` is set or that mailbox has a listener.
    ///
    /// `false` if the channel lock could not be taken within the fuse.
    pub fn publish(
        &self,
        channel: &str,
        message: &str,
        store: bool,
        worker: Option<&str>,
    ) -> Result<bool> {
        self.ensure_backend()?;
        let default_bucket = self.inner.config.default_bucket.as_str();

        let appended = self.with_channel(
            channel,
            "publish",
            json!([channel, store, worker]),
            |blob| {
                let mut appended = 0usize;
                if blob.is_empty() {
                    if store {
                        let bucket = worker.unwrap_or(default_bucket);
                        blob.entry(bucket.to_string())
                            .or_default()
                            .queue
                            .push_back(message.to_string());
                        appended += 1;
                    }
                } else if let Some(worker) = worker {
                    let listening = blob.get(worker).is_some_and(|m| m.listener.is_some());
                    if store || listening {
                        blob.entry(worker.to_string())
                            .or_default()
                            .queue
                            .push_back(message.to_string());
                        appended += 1;
                    }
                } else {
                    for mailbox in blob.values_mut() {
                        if store || mailbox.listener.is_some() {
                            mailbox.queue.push_back(message.to_string());
                            appended += 1;
                        }
                    }
                }
                Ok((appended, appended > 0))
            },
        )?;

        let Some(appended) = appended else {
            return Ok(false);
        };
        debug!(channel, ?worker, appended, "message published");

        if self.signal_mode() {
            self.signal_listeners()?;
        }
        Ok(true)
    }

    /// Starts delivering `worker`'s messages on `channel` to `callback`.
    ///
    /// Messages already queued for the worker are kept. A pending default
    /// backlog is moved to the front of every mailbox and the default bucket
    /// is removed.
    ///
    /// Returns the scheduler handle, or `None` if the channel lock could not
    /// be taken within the fuse.
    ///
    /// # Errors
    ///
    /// [`CacheError::ListenerExists`] if this cache already listens on
    /// `(channel, worker)`.
    pub fn create_listener(
        &self,
        channel: &str,
        worker: &str,
        callback: impl Fn(&str, &str, &str) + Send + Sync + 'static,
    ) -> Result<Option<TaskHandle>> {
        self.ensure_backend()?;
        let registry_key = (channel.to_string(), worker.to_string());
        match self.inner.listeners.entry(registry_key.clone()) {
            MapEntry::Occupied(_) => {
                return Err(CacheError::ListenerExists {
                    channel: channel.to_string(),
                    worker: worker.to_string(),
                });
            }
            MapEntry::Vacant(slot) => {
                slot.insert(None);
            }
        }

        let signal = self.signal_mode();
        let task = self.listener_task(channel, worker, Arc::new(callback), signal);
        let default_bucket = self.inner.config.default_bucket.clone();
        let mut scheduled = None;

        let created = self.with_channel(
            channel,
            "create_listener",
            json!([channel, worker]),
            |blob| {
                if signal {
                    self.update_signal_registry(true)?;
                }
                let handle = if signal {
                    self.inner.scheduler.on_signal(task)
                } else {
                    self.inner
                        .scheduler
                        .schedule(task, self.inner.config.listener_interval)
                };
                scheduled = Some(handle);

                blob.entry(worker.to_string()).or_default().listener = Some(handle.0);

                if let Some(backlog) = blob.remove(&default_bucket) {
                    if !backlog.queue.is_empty() {
                        debug!(channel, messages = backlog.queue.len(), "default backlog handed out");
                        for mailbox in blob.values_mut() {
                            let mut queue = backlog.queue.clone();
                            queue.append(&mut mailbox.queue);
                            mailbox.queue = queue;
                        }
                    }
                }

                let pending = blob.get(worker).map_or(0, |m| m.queue.len());
                Ok(((handle, pending), true))
            },
        );

        let created = match created {
            Ok(created) => created,
            Err(err) => {
                if let Some(handle) = scheduled {
                    self.inner.scheduler.cancel(handle);
                }
                self.release_reservation(&registry_key);
                return Err(err);
            }
        };
        let Some((handle, pending)) = created else {
            self.release_reservation(&registry_key);
            warn!(channel, worker, "listener not created: channel lock timed out");
            return Ok(None);
        };
        self.inner.listeners.insert(registry_key, Some(handle));
        debug!(channel, worker, task = handle.0, signal, "listener created");

        // Nothing will signal messages that were queued before we listened
        if signal && pending > 0 {
            self.inner
                .scheduler
                .send_signal(self.inner.scheduler.process_id());
        }
        Ok(Some(handle))
    }

    fn release_reservation(&self, registry_key: &(String, String)) {
        self.inner
            .listeners
            .remove_if(registry_key, |_, handle| handle.is_none());
    }

    fn listener_task(
        &self,
        channel: &str,
        worker: &str,
        callback: ListenerCallback,
        drain: bool,
    ) -> Task {
        let weak = self.downgrade();
        let channel = channel.to_string();
        let worker = worker.to_string();

        Arc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let cache = SharedCache::from_inner(inner);
            if let Err(err) = cache.deliver(&channel, &worker, callback.as_ref(), drain) {
                warn!(channel = %channel, worker = %worker, error = %err, "listener tick failed");
            }
        })
    }

    /// Pops the oldest message of `worker` (all of them when `drain`) and
    /// hands each to `callback` inside the channel section
    fn deliver(
        &self,
        channel: &str,
        worker: &str,
        callback: &(dyn Fn(&str, &str, &str) + Send + Sync),
        drain: bool,
    ) -> Result<usize> {
        self.ensure_backend()?;
        let delivered = self.with_channel(
            channel,
            "listener",
            json!([channel, worker]),
            |blob| {
                let Some(mailbox) = blob.get_mut(worker) else {
                    return Ok((0, false));
                };
                let mut delivered = 0;
                while let Some(message) = mailbox.queue.pop_front() {
                    callback(channel, worker, &message);
                    delivered += 1;
                    if !drain {
                        break;
                    }
                }
                Ok((delivered, delivered > 0))
            },
        )?;
        Ok(delivered.unwrap_or(0))
    }

    /// Stops this cache's listener for `(channel, worker)`.
    ///
    /// Queued messages stay for a future listener unless `purge` is set, in
    /// which case the worker's mailbox is deleted. A mailbox whose listener
    /// belongs to another process is left alone. Returns whether a local
    /// listener was removed.
    pub fn remove_listener(&self, channel: &str, worker: &str, purge: bool) -> Result<bool> {
        self.ensure_backend()?;
        let handle = self
            .inner
            .listeners
            .remove_if(&(channel.to_string(), worker.to_string()), |_, handle| {
                handle.is_some()
            })
            .and_then(|(_, handle)| handle);

        if let Some(handle) = handle {
            self.inner.scheduler.cancel(handle);
        }

        self.with_channel(
            channel,
            "remove_listener",
            json!([channel, worker, purge]),
            |blob| {
                let Some(listener) = blob.get(worker).map(|m| m.listener) else {
                    return Ok(((), false));
                };
                let ours = handle.is_some_and(|h| listener == Some(h.0));

                if purge {
                    if listener.is_some() && !ours {
                        warn!(channel, worker, "mailbox not purged: listened to by another process");
                        return Ok(((), false));
                    }
                    blob.remove(worker);
                    return Ok(((), true));
                }
                match blob.get_mut(worker) {
                    Some(mailbox) if ours => {
                        mailbox.listener = None;
                        Ok(((), true))
                    }
                    _ => Ok(((), false)),
                }
            },
        )?;

        if handle.is_some() && self.signal_mode() && self.inner.listeners.is_empty() {
            self.update_signal_registry(false)?;
        }
        debug!(channel, worker, purge, removed = handle.is_some(), "listener removed");
        Ok(handle.is_some())
    }

    /// Snapshot of a channel's mailboxes
    pub fn get_channel(&self, channel: &str) -> Result<BTreeMap<String, Mailbox>> {
        self.ensure_backend()?;
        self.load_channel(&self.channel_key(channel))
    }

    /// Removes every listener created through this cache. Queued messages
    /// are kept.
    pub fn shutdown(&self) -> Result<()> {
        let active: Vec<(String, String)> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.value().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        for (channel, worker) in active {
            self.remove_listener(&channel, &worker, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{cache_on, test_config};
    use crate::scheduler::{SignalBus, TokioScheduler};
    use crate::store::tests::create_test_store;
    use crate::store::SharedStore;
    use crate::{CacheConfig, MemoryStore};
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    type Inbox = Arc<Mutex<Vec<(String, String)>>>;

    fn recorder() -> (Inbox, impl Fn(&str, &str, &str) + Send + Sync + 'static) {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let callback = move |_channel: &str, worker: &str, message: &str| {
            sink.lock()
                .unwrap()
                .push((worker.to_string(), message.to_string()));
        };
        (inbox, callback)
    }

    fn messages(inbox: &Inbox) -> Vec<String> {
        inbox.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    #[test]
    fn test_backlog_delivered_in_order() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        for message in ["m1", "m2", "m3"] {
            assert!(cache.publish("jobs", message, true, None).unwrap());
        }
        assert_eq!(cache.get_channel("jobs").unwrap()["--default--"].queue.len(), 3);

        let (inbox, callback) = recorder();
        let handle = cache.create_listener("jobs", "w1", callback).unwrap().unwrap();
        assert_eq!(scheduler.interval_of(handle), Some(Duration::from_millis(1)));

        let snapshot = cache.get_channel("jobs").unwrap();
        assert!(!snapshot.contains_key("--default--"));
        assert_eq!(snapshot["w1"].listener, Some(handle.0));

        for _ in 0..4 {
            scheduler.tick();
        }
        assert_eq!(messages(&inbox), vec!["m1", "m2", "m3"]);
        assert!(cache.get_channel("jobs").unwrap()["w1"].queue.is_empty());
        assert!(cache.lock_info().unwrap().is_empty());
    }

    #[test]
    fn test_default_backlog_fans_out_once() {
        let store = create_test_store();
        let (worker_a, sched_a) = cache_on(&store, 1, test_config());
        let (worker_b, sched_b) = cache_on(&store, 2, test_config());
        let (worker_c, sched_c) = cache_on(&store, 3, test_config());

        worker_a.publish("news", "early", true, None).unwrap();
        // Gives worker b a mailbox while the backlog is still pending
        worker_a.publish("news", "for-b", true, Some("b")).unwrap();

        let (inbox_a, cb_a) = recorder();
        let (inbox_b, cb_b) = recorder();
        let (inbox_c, cb_c) = recorder();
        worker_a.create_listener("news", "a", cb_a).unwrap().unwrap();
        worker_b.create_listener("news", "b", cb_b).unwrap().unwrap();

        for _ in 0..3 {
            sched_a.tick();
            sched_b.tick();
        }
        assert_eq!(messages(&inbox_a), vec!["early"]);
        assert_eq!(messages(&inbox_b), vec!["early", "for-b"]);

        worker_c.create_listener("news", "c", cb_c).unwrap().unwrap();
        sched_c.tick();
        assert!(messages(&inbox_c).is_empty());

        // Later fan-out reaches every listener
        worker_a.publish("news", "late", false, None).unwrap();
        sched_a.tick();
        sched_b.tick();
        sched_c.tick();
        assert_eq!(messages(&inbox_c), vec!["late"]);
        assert_eq!(messages(&inbox_a).last().unwrap(), "late");
    }

    #[test]
    fn test_duplicate_listener_is_an_error() {
        let (cache, _) = cache_on(&create_test_store(), 1, test_config());
        cache.create_listener("ch", "w1", |_, _, _| {}).unwrap();

        let err = cache.create_listener("ch", "w1", |_, _, _| {}).unwrap_err();
        assert!(matches!(err, CacheError::ListenerExists { .. }));

        // Other workers on the same channel are fine
        assert!(cache.create_listener("ch", "w2", |_, _, _| {}).unwrap().is_some());
    }

    #[test]
    fn test_default_backlog_goes_to_first_listener_only() {
        let store = create_test_store();
        let (worker_a, sched_a) = cache_on(&store, 1, test_config());
        let (worker_b, sched_b) = cache_on(&store, 2, test_config());
        worker_a.publish("news", "early", true, None).unwrap();

        let (inbox_a, cb_a) = recorder();
        let (inbox_b, cb_b) = recorder();
        worker_a.create_listener("news", "a", cb_a).unwrap().unwrap();
        worker_b.create_listener("news", "b", cb_b).unwrap().unwrap();

        for _ in 0..2 {
            sched_a.tick();
            sched_b.tick();
        }
        // b had no mailbox when a took the backlog
        assert_eq!(messages(&inbox_a), vec!["early"]);
        assert!(messages(&inbox_b).is_empty());
        assert!(!worker_b.get_channel("news").unwrap().contains_key("--default--"));
    }

    #[test]
    fn test_concurrent_create_listener_registers_once() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.create_listener("ch", "w1", |_, _, _| {})
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .collect();

        let created = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(CacheError::ListenerExists { .. })))
            .count();
        assert_eq!((created, rejected), (1, 7));
        assert_eq!(scheduler.len(), 1);

        assert!(cache.remove_listener("ch", "w1", false).unwrap());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_timed_out_create_listener_frees_the_slot() {
        let store = create_test_store();
        let config = test_config().with_fuse(Duration::from_millis(20));
        let (cache, scheduler) = cache_on(&store, 1, config);
        // Someone else holds the channel lock
        assert!(store.try_create("#lock##Channel#ch", "{}", None));

        assert!(cache.create_listener("ch", "w1", |_, _, _| {}).unwrap().is_none());
        assert!(scheduler.is_empty());

        // The fuse cleared the stale lock and the slot is free again
        assert!(cache.create_listener("ch", "w1", |_, _, _| {}).unwrap().is_some());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_remove_listener_leaves_other_process_listener() {
        let store = create_test_store();
        let (owner, sched_owner) = cache_on(&store, 1, test_config());
        let (other, _) = cache_on(&store, 2, test_config());
        let (inbox, callback) = recorder();
        let handle = owner.create_listener("ch", "w1", callback).unwrap().unwrap();

        assert!(!other.remove_listener("ch", "w1", false).unwrap());
        assert_eq!(owner.get_channel("ch").unwrap()["w1"].listener, Some(handle.0));
        assert!(!other.remove_listener("ch", "w1", true).unwrap());
        assert!(owner.get_channel("ch").unwrap().contains_key("w1"));

        // Unstored messages still reach the live listener
        other.publish("ch", "live", false, None).unwrap();
        sched_owner.tick();
        assert_eq!(messages(&inbox), vec!["live"]);
    }

    #[test]
    fn test_unstored_publish_without_listener_is_dropped() {
        let (cache, _) = cache_on(&create_test_store(), 1, test_config());

        assert!(cache.publish("ch", "lost", false, None).unwrap());
        assert!(cache.get_channel("ch").unwrap().is_empty());
    }

    #[test]
    fn test_publish_to_named_worker() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        let (inbox, callback) = recorder();
        cache.create_listener("ch", "w1", callback).unwrap();
        cache.create_listener("ch", "w2", |_, _, _| {}).unwrap();

        cache.publish("ch", "direct", false, Some("w1")).unwrap();
        let snapshot = cache.get_channel("ch").unwrap();
        assert_eq!(snapshot["w1"].queue, ["direct"]);
        assert!(snapshot["w2"].queue.is_empty());

        scheduler.tick();
        assert_eq!(inbox.lock().unwrap()[0], ("w1".to_string(), "direct".to_string()));
    }

    #[test]
    fn test_remove_listener_keeps_queue_until_purged() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        cache.create_listener("ch", "w1", |_, _, _| {}).unwrap();
        cache.publish("ch", "kept", true, None).unwrap();

        assert!(cache.remove_listener("ch", "w1", false).unwrap());
        assert!(scheduler.is_empty());
        let mailbox = &cache.get_channel("ch").unwrap()["w1"];
        assert_eq!(mailbox.listener, None);
        assert_eq!(mailbox.queue, ["kept"]);

        // Not listening: unstored messages skip the mailbox
        cache.publish("ch", "skipped", false, None).unwrap();
        assert_eq!(cache.get_channel("ch").unwrap()["w1"].queue.len(), 1);

        // A new listener picks up where the old one stopped
        let (inbox, callback) = recorder();
        cache.create_listener("ch", "w1", callback).unwrap();
        scheduler.tick();
        assert_eq!(messages(&inbox), vec!["kept"]);

        assert!(cache.remove_listener("ch", "w1", true).unwrap());
        assert!(cache.get_channel("ch").unwrap().is_empty());
        assert!(!cache.remove_listener("ch", "w1", false).unwrap());
    }

    #[test]
    fn test_shutdown_cancels_all_listeners() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        cache.create_listener("a", "w", |_, _, _| {}).unwrap();
        cache.create_listener("b", "w", |_, _, _| {}).unwrap();
        assert_eq!(scheduler.len(), 2);

        cache.shutdown().unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(cache.get_channel("a").unwrap()["w"].listener, None);
    }

    #[test]
    fn test_signal_mode_drains_on_wake() {
        let config = test_config().with_delivery_mode(DeliveryMode::Signal);
        let (cache, scheduler) = cache_on(&create_test_store(), 7, config);
        let (inbox, callback) = recorder();

        let handle = cache.create_listener("ch", "w", callback).unwrap().unwrap();
        assert_eq!(scheduler.interval_of(handle), None);
        assert_eq!(cache.signal_registry().unwrap(), BTreeSet::from([7]));

        for message in ["s1", "s2", "s3"] {
            cache.publish("ch", message, true, None).unwrap();
        }
        assert_eq!(scheduler.sent_signals(), vec![7, 7, 7]);
        // Timer ticks do nothing in signal mode
        assert_eq!(scheduler.tick(), 0);

        assert_eq!(scheduler.deliver_signals(), 3);
        assert_eq!(messages(&inbox), vec!["s1", "s2", "s3"]);

        cache.remove_listener("ch", "w", false).unwrap();
        assert!(cache.signal_registry().unwrap().is_empty());
    }

    #[test]
    fn test_signal_mode_wakes_for_existing_backlog() {
        let config = test_config().with_delivery_mode(DeliveryMode::Signal);
        let (cache, scheduler) = cache_on(&create_test_store(), 7, config);
        cache.publish("ch", "queued", true, None).unwrap();

        let (inbox, callback) = recorder();
        cache.create_listener("ch", "w", callback).unwrap();
        scheduler.deliver_signals();

        assert_eq!(messages(&inbox), vec!["queued"]);
    }

    #[test]
    fn test_listener_does_not_outlive_cache() {
        let (cache, scheduler) = cache_on(&create_test_store(), 1, test_config());
        cache.publish("ch", "m", true, None).unwrap();
        let (inbox, callback) = recorder();
        cache.create_listener("ch", "w", callback).unwrap();

        drop(cache);
        scheduler.tick();
        assert!(messages(&inbox).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_listener_on_tokio() {
        let store = MemoryStore::new();
        let config = CacheConfig::default().with_listener_interval(Duration::from_millis(5));
        let cache = SharedCache::new(
            Arc::new(store.clone()),
            Arc::new(TokioScheduler::new()),
            config,
        );

        let (inbox, callback) = recorder();
        cache.create_listener("ch", "w", callback).unwrap();
        for i in 0..5 {
            cache.publish("ch", &format!("t{}", i), true, None).unwrap();
        }

        for _ in 0..200 {
            if inbox.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(messages(&inbox), vec!["t0", "t1", "t2", "t3", "t4"]);
        cache.shutdown().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_signal_between_workers_on_tokio() {
        let store = MemoryStore::new();
        let bus = Arc::new(SignalBus::new());
        let config = CacheConfig::default().with_delivery_mode(DeliveryMode::Signal);

        let publisher = SharedCache::new(
            Arc::new(store.clone()),
            Arc::new(TokioScheduler::with_bus(100, bus.clone())),
            config.clone(),
        );
        let subscriber = SharedCache::new(
            Arc::new(store.clone()),
            Arc::new(TokioScheduler::with_bus(200, bus)),
            config,
        );

        let (inbox, callback) = recorder();
        subscriber.create_listener("events", "w", callback).unwrap();
        publisher.publish("events", "ping", true, None).unwrap();
        publisher.publish("events", "pong", true, None).unwrap();

        for _ in 0..200 {
            if inbox.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(messages(&inbox), vec!["ping", "pong"]);
        subscriber.shutdown().unwrap();
    }

    #[test]
    fn test_mailbox_wire_format() {
        let (cache, _) = cache_on(&create_test_store(), 1, test_config());
        cache.publish("ch", "hello", true, Some("w")).unwrap();

        let raw = cache.get("#Channel#ch").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"w": {"listener": null, "queue": ["hello"]}}));
    }

    #[test]
    fn test_cache_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + Clone>() {}
        assert_send_sync::<SharedCache>();
    }
}
