//! The authoritative document.
//!
//! A document is a set of named maps (`name -> key -> JSON value`). Writes go
//! through [`Document::transact`]; when the outermost transaction returns,
//! the net effect on every touched key is computed and delivered to that
//! map's observers as one batch.
//!
//! A key written and then restored to its original value inside one
//! transaction produces no change at all.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use parking_lot::ReentrantMutex;
use serde_json::Value;
use tracing::debug;

use crate::change::{ChangeAction, KeyChange};
use crate::{DocumentError, DocumentResult};

type MapEntries = BTreeMap<String, Value>;
type Observer = Arc<dyn Fn(&[KeyChange]) + Send + Sync>;

#[derive(Default)]
struct DocState {
    maps: HashMap<String, MapEntries>,
    destroyed: bool,
    /// Write log of the transaction currently open on the owning thread.
    open: Option<TxnLog>,
}

/// Touched keys in first-touch order, with their value before the transaction.
#[derive(Default)]
struct TxnLog {
    touched: Vec<(String, String, Option<Value>)>,
    seen: HashSet<(String, String)>,
}

impl TxnLog {
    fn record(&mut self, maps: &HashMap<String, MapEntries>, map: &str, key: &str) {
        let slot = (map.to_string(), key.to_string());
        if self.seen.contains(&slot) {
            return;
        }
        let before = maps.get(map).and_then(|m| m.get(key)).cloned();
        self.seen.insert(slot.clone());
        self.touched.push((slot.0, slot.1, before));
    }

    /// Net change per touched key, grouped by map in first-touch order.
    fn into_changes(self, maps: &HashMap<String, MapEntries>) -> Vec<(String, Vec<KeyChange>)> {
        let mut grouped: Vec<(String, Vec<KeyChange>)> = Vec::new();

        for (map, key, before) in self.touched {
            let after = maps.get(&map).and_then(|m| m.get(&key));
            let action = match (before.as_ref(), after) {
                (None, Some(_)) => ChangeAction::Add,
                (Some(old), Some(new)) if old != new => ChangeAction::Update,
                (Some(_), None) => ChangeAction::Delete,
                _ => continue,
            };
            let change = KeyChange {
                key,
                action,
                value: after.cloned(),
            };
            match grouped.iter_mut().find(|(name, _)| *name == map) {
                Some((_, list)) => list.push(change),
                None => grouped.push((map, vec![change])),
            }
        }

        grouped
    }
}

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    by_map: HashMap<String, Vec<(u64, Observer)>>,
}

struct DocumentInner {
    id: String,
    /// Held from the start of a transaction until its observers have run,
    /// so notifications leave in commit order. Reentrant: the owning thread
    /// may read, nest a transaction, or write from an observer.
    state: ReentrantMutex<RefCell<DocState>>,
    observers: Mutex<ObserverRegistry>,
}

/// Shared handle to one workspace's authoritative document.
///
/// Cloning is cheap; every clone refers to the same document.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Closes the outermost transaction's log, even when `f` unwinds.
struct OpenTxn<'a> {
    state: &'a RefCell<DocState>,
    outermost: bool,
}

impl OpenTxn<'_> {
    fn commit(self) -> Vec<(String, Vec<KeyChange>)> {
        if !self.outermost {
            return Vec::new();
        }
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        state
            .open
            .take()
            .map(|log| log.into_changes(&state.maps))
            .unwrap_or_default()
    }
}

impl Drop for OpenTxn<'_> {
    fn drop(&mut self) {
        if self.outermost {
            self.state.borrow_mut().open = None;
        }
    }
}

impl Document {
    /// Creates an empty document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                id: id.into(),
                state: ReentrantMutex::new(RefCell::new(DocState::default())),
                observers: Mutex::new(ObserverRegistry::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Runs `f` inside a transaction and notifies observers after commit.
    ///
    /// Called while a transaction is already open on this thread (from `f`,
    /// or from anything `f` calls), `f` joins that transaction and nothing
    /// is notified until the outermost one returns. Transactions from other
    /// threads wait, and their observers run after this one's.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> DocumentResult<R> {
        let guard = self.inner.state.lock();
        let open = {
            let mut state = guard.borrow_mut();
            if state.destroyed {
                return Err(DocumentError::Destroyed(self.inner.id.clone()));
            }
            let outermost = state.open.is_none();
            if outermost {
                state.open = Some(TxnLog::default());
            }
            OpenTxn {
                state: &*guard,
                outermost,
            }
        };

        let result = f(&mut Transaction { state: &*guard });
        let changes = open.commit();
        self.notify(changes);
        Ok(result)
    }

    /// Returns a handle on the named map, creating it if needed.
    pub fn get_or_create_map(&self, name: &str) -> MapRef {
        {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            if !state.destroyed {
                state.maps.entry(name.to_string()).or_default();
            }
        }
        MapRef {
            doc: self.clone(),
            name: name.to_string(),
        }
    }

    /// Reads one value outside of a transaction.
    pub fn get(&self, map: &str, key: &str) -> Option<Value> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.maps.get(map).and_then(|m| m.get(key)).cloned()
    }

    /// Reads every entry of a map, ordered by key.
    pub fn entries(&self, map: &str) -> Vec<(String, Value)> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state
            .maps
            .get(map)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Names of all maps that exist in the document.
    pub fn map_names(&self) -> Vec<String> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        let mut names: Vec<String> = state.maps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers `handler` for committed changes to `map`.
    ///
    /// The handler runs synchronously on the committing thread. It may read
    /// or write the document again; its own writes commit and notify before
    /// it returns. Dropping the returned [`Subscription`] removes the handler.
    pub fn observe<F>(&self, map: &str, handler: F) -> Subscription
    where
        F: Fn(&[KeyChange]) + Send + Sync + 'static,
    {
        let mut registry = self.inner.observers.lock().expect("lock poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_map
            .entry(map.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            doc: Arc::downgrade(&self.inner),
            map: map.to_string(),
            id,
            active: true,
        }
    }

    /// Number of handlers currently observing `map`.
    pub fn observer_count(&self, map: &str) -> usize {
        let registry = self.inner.observers.lock().expect("lock poisoned");
        registry.by_map.get(map).map(Vec::len).unwrap_or(0)
    }

    /// Releases the document's data and observers.
    ///
    /// Later transactions fail with [`DocumentError::Destroyed`]. Idempotent.
    pub fn destroy(&self) {
        {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.maps.clear();
        }
        self.inner
            .observers
            .lock()
            .expect("lock poisoned")
            .by_map
            .clear();
        debug!(document = %self.inner.id, "document destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().borrow().destroyed
    }

    fn notify(&self, changes: Vec<(String, Vec<KeyChange>)>) {
        for (map, changes) in changes {
            let observers: Vec<Observer> = {
                let registry = self.inner.observers.lock().expect("lock poisoned");
                registry
                    .by_map
                    .get(&map)
                    .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
                    .unwrap_or_default()
            };
            for observer in observers {
                observer(&changes);
            }
        }
    }
}

/// An open write transaction.
///
/// Borrows of the document state last for one call, so `f` may call back
/// into the document between them.
pub struct Transaction<'a> {
    state: &'a RefCell<DocState>,
}

impl<'a> Transaction<'a> {
    /// Runs `f` as part of this transaction. Nothing commits until the
    /// outermost transaction returns.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Transaction<'a>) -> R) -> R {
        f(self)
    }

    pub fn get(&self, map: &str, key: &str) -> Option<Value> {
        self.state
            .borrow()
            .maps
            .get(map)
            .and_then(|m| m.get(key))
            .cloned()
    }

    pub fn contains(&self, map: &str, key: &str) -> bool {
        self.state
            .borrow()
            .maps
            .get(map)
            .is_some_and(|m| m.contains_key(key))
    }

    /// Writes `value` under `key`. Writing an identical value is a no-op.
    pub fn set(&mut self, map: &str, key: &str, value: Value) {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        if let Some(log) = state.open.as_mut() {
            log.record(&state.maps, map, key);
        }
        state
            .maps
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Removes `key`, returning whether it existed.
    pub fn delete(&mut self, map: &str, key: &str) -> bool {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        if !state.maps.get(map).is_some_and(|m| m.contains_key(key)) {
            return false;
        }
        if let Some(log) = state.open.as_mut() {
            log.record(&state.maps, map, key);
        }
        if let Some(entries) = state.maps.get_mut(map) {
            entries.remove(key);
        }
        true
    }

    pub fn keys(&self, map: &str) -> Vec<String> {
        self.state
            .borrow()
            .maps
            .get(map)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self, map: &str) -> Vec<(String, Value)> {
        self.state
            .borrow()
            .maps
            .get(map)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Removes every key of `map`, returning how many were removed.
    pub fn clear(&mut self, map: &str) -> usize {
        let keys = self.keys(map);
        for key in &keys {
            self.delete(map, key);
        }
        keys.len()
    }
}

/// Convenience handle on one named map; each call is its own transaction.
#[derive(Clone, Debug)]
pub struct MapRef {
    doc: Document,
    name: String,
}

impl MapRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.doc.get(&self.name, key)
    }

    pub fn set(&self, key: &str, value: Value) -> DocumentResult<()> {
        self.doc.transact(|txn| txn.set(&self.name, key, value))
    }

    pub fn delete(&self, key: &str) -> DocumentResult<bool> {
        self.doc.transact(|txn| txn.delete(&self.name, key))
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.doc.entries(&self.name)
    }

    pub fn clear(&self) -> DocumentResult<usize> {
        self.doc.transact(|txn| txn.clear(&self.name))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[KeyChange]) + Send + Sync + 'static,
    {
        self.doc.observe(&self.name, handler)
    }
}

/// Keeps an observer registered until dropped or unsubscribed.
pub struct Subscription {
    doc: Weak<DocumentInner>,
    map: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Removes the observer now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.doc.upgrade() {
            let mut registry = inner.observers.lock().expect("lock poisoned");
            if let Some(list) = registry.by_map.get_mut(&self.map) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("map", &self.map)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recorder(doc: &Document, map: &str) -> (Arc<StdMutex<Vec<Vec<KeyChange>>>>, Subscription) {
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let sub = doc.observe(map, move |changes| {
            sink.lock().unwrap().push(changes.to_vec());
        });
        (batches, sub)
    }

    #[test]
    fn transaction_batches_changes_into_one_notification() {
        let doc = Document::new("doc");
        let (batches, _sub) = recorder(&doc, "notes");

        doc.transact(|txn| {
            txn.set("notes", "a", json!({ "id": "a" }));
            txn.set("notes", "b", json!({ "id": "b" }));
            txn.set("notes", "a", json!({ "id": "a", "title": "x" }));
        })
        .unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].action, ChangeAction::Add);
        assert_eq!(batches[0][0].value, Some(json!({ "id": "a", "title": "x" })));
    }

    #[test]
    fn update_and_delete_are_classified_against_pre_transaction_state() {
        let doc = Document::new("doc");
        let map = doc.get_or_create_map("notes");
        map.set("a", json!(1)).unwrap();
        map.set("b", json!(2)).unwrap();

        let (batches, _sub) = recorder(&doc, "notes");
        doc.transact(|txn| {
            txn.set("notes", "a", json!(10));
            txn.delete("notes", "b");
        })
        .unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches[0][0].action, ChangeAction::Update);
        assert_eq!(batches[0][1].action, ChangeAction::Delete);
        assert_eq!(batches[0][1].value, None);
    }

    #[test]
    fn identical_write_produces_no_change() {
        let doc = Document::new("doc");
        let map = doc.get_or_create_map("notes");
        map.set("a", json!({ "v": 1 })).unwrap();

        let (batches, _sub) = recorder(&doc, "notes");
        map.set("a", json!({ "v": 1 })).unwrap();

        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn add_then_delete_in_one_transaction_is_invisible() {
        let doc = Document::new("doc");
        let (batches, _sub) = recorder(&doc, "notes");

        doc.transact(|txn| {
            txn.set("notes", "tmp", json!(1));
            txn.delete("notes", "tmp");
        })
        .unwrap();

        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn nested_transaction_commits_once() {
        let doc = Document::new("doc");
        let (batches, _sub) = recorder(&doc, "notes");

        doc.transact(|outer| {
            outer.set("notes", "a", json!(1));
            outer.transact(|inner| {
                inner.set("notes", "b", json!(2));
            });
            assert!(outer.contains("notes", "b"));
        })
        .unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn document_transact_inside_a_transaction_joins_it() {
        let doc = Document::new("doc");
        let (batches, _sub) = recorder(&doc, "notes");

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = doc.clone();
        std::thread::spawn(move || {
            let inner = worker.clone();
            let result = worker.transact(|txn| {
                txn.set("notes", "a", json!(1));
                inner
                    .transact(|nested| {
                        assert_eq!(nested.get("notes", "a"), Some(json!(1)));
                        nested.set("notes", "b", json!(2));
                    })
                    .unwrap();
                txn.contains("notes", "b")
            });
            done_tx.send(result).unwrap();
        });

        let saw_nested_write = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("nested transact did not return")
            .unwrap();
        assert!(saw_nested_write);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn concurrent_commits_are_observed_in_commit_order() {
        let doc = Document::new("doc");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = doc.observe("counter", move |changes| {
            for change in changes {
                sink.lock().unwrap().push(change.value.clone());
            }
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let doc = doc.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        doc.transact(|txn| {
                            let next = txn
                                .get("counter", "n")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0)
                                + 1;
                            txn.set("counter", "n", json!(next));
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        let expected: Vec<Option<Value>> = (1..=200u64).map(|n| Some(json!(n))).collect();
        assert_eq!(*seen, expected);
        assert_eq!(doc.get("counter", "n"), Some(json!(200)));
    }

    #[test]
    fn observers_can_write_back_without_deadlock() {
        let doc = Document::new("doc");
        let echo = doc.clone();
        let _sub = doc.observe("source", move |changes| {
            for change in changes {
                echo.transact(|txn| txn.set("echo", &change.key, json!(true)))
                    .unwrap();
            }
        });

        doc.get_or_create_map("source").set("k", json!(1)).unwrap();
        assert_eq!(doc.get("echo", "k"), Some(json!(true)));
    }

    #[test]
    fn clear_reports_one_delete_per_key() {
        let doc = Document::new("doc");
        let map = doc.get_or_create_map("notes");
        for key in ["a", "b", "c"] {
            map.set(key, json!(key)).unwrap();
        }

        let (batches, _sub) = recorder(&doc, "notes");
        assert_eq!(map.clear().unwrap(), 3);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|c| c.action == ChangeAction::Delete));
        assert!(map.is_empty());
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let doc = Document::new("doc");
        let (batches, sub) = recorder(&doc, "notes");
        assert_eq!(doc.observer_count("notes"), 1);

        drop(sub);
        assert_eq!(doc.observer_count("notes"), 0);

        doc.get_or_create_map("notes").set("a", json!(1)).unwrap();
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn destroyed_document_rejects_transactions() {
        let doc = Document::new("doc");
        let (_batches, _sub) = recorder(&doc, "notes");
        doc.get_or_create_map("notes").set("a", json!(1)).unwrap();

        doc.destroy();
        doc.destroy();

        assert!(doc.is_destroyed());
        assert_eq!(doc.observer_count("notes"), 0);
        assert!(doc.entries("notes").is_empty());
        let result = doc.transact(|txn| txn.set("notes", "b", json!(2)));
        assert!(matches!(result, Err(DocumentError::Destroyed(id)) if id == "doc"));
    }
}
