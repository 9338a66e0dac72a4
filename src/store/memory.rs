use super::{
    needs_assignment, ClientRecord, Direction, InFlightRecord, SessionStore, StoreError,
    StoreResult, Subscriber, SubscriptionRecord,
};
use crate::mqtt::{Message, MessageId, SubscriptionKey, Will};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

type ClientKey = (String, String);

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientKey, ClientRecord>,
    wills: HashMap<ClientKey, Will>,
    subscriptions: HashMap<SubscriptionKey, SubscriptionRecord>,
    in_flight: HashMap<ClientKey, BTreeMap<(Direction, u16), InFlightRecord>>,
    next_message_id: HashMap<ClientKey, u16>,
    client_seq: u64,
}

/// In-process store implementing the full persistence contract.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

fn client_key(partition: &str, client_id: &str) -> ClientKey {
    (partition.to_string(), client_id.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn in_flight_count(&self, partition: &str, client_id: &str) -> usize {
        self.inner
            .lock()
            .in_flight
            .get(&client_key(partition, client_id))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> StoreResult<T>) -> StoreResult<T> {
        self.check()?;
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    fn allocate_id(
        inner: &mut Inner,
        key: &ClientKey,
        direction: Direction,
    ) -> StoreResult<u16> {
        let used = inner.in_flight.get(key);
        let cursor = inner.next_message_id.entry(key.clone()).or_insert(0);
        for _ in 0..u16::MAX {
            *cursor = if *cursor == u16::MAX { 1 } else { *cursor + 1 };
            let candidate = *cursor;
            let taken = used
                .map(|records| records.contains_key(&(direction, candidate)))
                .unwrap_or(false);
            if !taken {
                return Ok(candidate);
            }
        }
        Err(StoreError::Exhausted {
            partition: key.0.clone(),
            client_id: key.1.clone(),
        })
    }
}

impl SessionStore for MemoryStore {
    fn get_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<ClientRecord>>> {
        Box::pin(async move {
            self.with(|inner| {
                Ok(inner
                    .clients
                    .get(&client_key(partition, client_id))
                    .cloned())
            })
        })
    }

    fn save_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.clients.insert(
                    client_key(&record.partition, &record.client_id),
                    record.clone(),
                );
                Ok(())
            })
        })
    }

    fn remove_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.clients.remove(&client_key(partition, client_id));
                Ok(())
            })
        })
    }

    fn get_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Will>>> {
        Box::pin(async move {
            self.with(|inner| Ok(inner.wills.get(&client_key(partition, client_id)).cloned()))
        })
    }

    fn save_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        will: &'a Will,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner
                    .wills
                    .insert(client_key(partition, client_id), will.clone());
                Ok(())
            })
        })
    }

    fn remove_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.wills.remove(&client_key(partition, client_id));
                Ok(())
            })
        })
    }

    fn get_subscription<'a>(
        &'a self,
        key: &'a SubscriptionKey,
    ) -> BoxFuture<'a, StoreResult<Option<SubscriptionRecord>>> {
        Box::pin(async move { self.with(|inner| Ok(inner.subscriptions.get(key).cloned())) })
    }

    fn save_subscription<'a>(
        &'a self,
        record: &'a SubscriptionRecord,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner
                    .subscriptions
                    .insert(record.key.clone(), record.clone());
                Ok(())
            })
        })
    }

    fn remove_subscription<'a>(
        &'a self,
        key: &'a SubscriptionKey,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.subscriptions.remove(key);
                Ok(())
            })
        })
    }

    fn distribute_publish<'a>(
        &'a self,
        candidates: &'a [SubscriptionKey],
        _publish: &'a Message,
    ) -> BoxStream<'a, StoreResult<Subscriber>> {
        let found = self.with(|inner| {
            let mut out = Vec::new();
            for key in candidates {
                if let Some(record) = inner.subscriptions.get(key) {
                    out.extend(record.clients.iter().map(|client_id| Subscriber {
                        key: key.clone(),
                        client_id: client_id.clone(),
                    }));
                }
            }
            Ok(out)
        });
        match found {
            Ok(subscribers) => stream::iter(subscribers.into_iter().map(Ok)).boxed(),
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
        }
    }

    fn get_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<Option<InFlightRecord>>> {
        Box::pin(async move {
            self.with(|inner| {
                Ok(inner
                    .in_flight
                    .get(&client_key(partition, client_id))
                    .and_then(|records| records.get(&(direction, message_id)))
                    .cloned())
            })
        })
    }

    fn save_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        mut record: InFlightRecord,
    ) -> BoxFuture<'a, StoreResult<u16>> {
        Box::pin(async move {
            self.with(|inner| {
                let key = client_key(partition, client_id);
                let id = if needs_assignment(record.message.header.message_id) {
                    let id = Self::allocate_id(inner, &key, record.direction)?;
                    record.message.header.message_id = Some(MessageId::Packet(id));
                    id
                } else {
                    record.message_id().ok_or_else(|| {
                        StoreError::Corrupt(format!("in-flight record for {client_id} has no id"))
                    })?
                };
                inner
                    .in_flight
                    .entry(key)
                    .or_default()
                    .insert((record.direction, id), record);
                Ok(id)
            })
        })
    }

    fn remove_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with(|inner| {
                let key = client_key(partition, client_id);
                if let Some(records) = inner.in_flight.get_mut(&key) {
                    records.remove(&(direction, message_id));
                    if records.is_empty() {
                        inner.in_flight.remove(&key);
                    }
                }
                Ok(())
            })
        })
    }

    fn get_all_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxStream<'a, StoreResult<InFlightRecord>> {
        let found = self.with(|inner| {
            Ok(inner
                .in_flight
                .get(&client_key(partition, client_id))
                .map(|records| records.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default())
        });
        match found {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
        }
    }

    fn next_client_id(&self) -> BoxFuture<'_, StoreResult<String>> {
        Box::pin(async move {
            self.with(|inner| {
                inner.client_seq += 1;
                Ok(format!("{:08x}", inner.client_seq))
            })
        })
    }
}
