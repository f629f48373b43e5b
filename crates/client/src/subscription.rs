//! Subscription table and inbound delivery.
//!
//! Subscriptions are keyed by `(pattern, share)`. Subscribing again with the
//! same key updates the options in place. The table survives connection
//! loss and `stop`; its content is replayed on every successful connect
//! before the client reports `Started`.
//!
//! A record changes only as far as the wire allows. A record created by a
//! subscribe disappears again once every subscribe for its key has failed
//! and none ever succeeded. A failed update restores the options it
//! replaced. An unsubscribe keeps the record, marked as leaving, until the
//! service confirms it, so a failed unsubscribe can be retried.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tracing::{debug, trace, warn};

use crate::{
    client::Inner,
    connection::WireOp,
    dispatcher::SubscribeCallback,
    error::{ClientError, Result},
    message::{
        InboundMessage, MessageHandler, Qos, SubscribeOptions, SubscriptionInfo,
        UnsubscribeOptions,
    },
    state::LifecycleState,
    transport::WireSubscription,
    validate,
};

type Key = (String, Option<String>);

/// Options of one subscription as last requested.
#[derive(Clone)]
struct Settings {
    qos: Qos,
    credit: u32,
    ttl: u32,
    auto_confirm: bool,
    handler: Option<MessageHandler>,
}

struct Record {
    settings: Settings,

    /// Some subscribe for this key has succeeded on the wire.
    established: bool,

    /// Subscribes for this key still waiting for their wire result.
    pending: usize,

    /// Id of the most recent operation on this key.
    last_op: u64,

    /// An unsubscribe is on its way.
    leaving: bool,
    delivered: u64,
    confirmed: u64,
}

impl Record {
    fn new(settings: Settings) -> Self {
        Record {
            settings,
            established: false,
            pending: 0,
            last_op: 0,
            leaving: false,
            delivered: 0,
            confirmed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Subscribe,
    Unsubscribe,
}

/// What a subscribe replaced, put back if it fails.
struct Previous {
    settings: Settings,
    leaving: bool,
}

/// A subscribe or unsubscribe waiting for its wire result.
pub(crate) struct PendingOp {
    id: u64,
    kind: OpKind,
    key: Key,
    previous: Option<Previous>,
    callback: Option<SubscribeCallback>,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    records: BTreeMap<Key, Record>,
    pending: HashMap<u64, PendingOp>,
    next_op: u64,
}

impl SubscriptionTable {
    fn next_id(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    /// Creates or updates the record for `key`.
    fn begin_subscribe(
        &mut self,
        key: Key,
        settings: Settings,
        callback: Option<SubscribeCallback>,
    ) -> (u64, WireSubscription) {
        let id = self.next_id();
        let created = !self.records.contains_key(&key);
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| Record::new(settings.clone()));
        let previous = (!created).then(|| Previous {
            settings: mem::replace(&mut record.settings, settings),
            leaving: mem::replace(&mut record.leaving, false),
        });
        record.pending += 1;
        record.last_op = id;
        let subscription = wire(&key.0, &key.1, record);

        self.pending.insert(
            id,
            PendingOp {
                id,
                kind: OpKind::Subscribe,
                key,
                previous,
                callback,
            },
        );
        (id, subscription)
    }

    /// Marks the record for `key` as leaving. `None` when there is nothing
    /// to unsubscribe from.
    fn begin_unsubscribe(&mut self, key: Key, callback: Option<SubscribeCallback>) -> Option<u64> {
        let id = self.next_id();
        let record = self.records.get_mut(&key).filter(|record| !record.leaving)?;
        record.leaving = true;
        record.last_op = id;
        self.pending.insert(
            id,
            PendingOp {
                id,
                kind: OpKind::Unsubscribe,
                key,
                previous: None,
                callback,
            },
        );
        Some(id)
    }

    /// Applies the wire result of `op` to its record.
    fn finish(&mut self, op: &mut PendingOp, result: &Result<()>) {
        let Some(record) = self.records.get_mut(&op.key) else {
            return;
        };
        match (op.kind, result) {
            (OpKind::Subscribe, Ok(())) => {
                record.pending = record.pending.saturating_sub(1);
                record.established = true;
            }
            (OpKind::Subscribe, Err(_)) => {
                record.pending = record.pending.saturating_sub(1);
                if !record.established && record.pending == 0 {
                    self.records.remove(&op.key);
                } else if record.last_op == op.id {
                    if let Some(previous) = op.previous.take() {
                        record.settings = previous.settings;
                        record.leaving = previous.leaving;
                    }
                }
            }
            (OpKind::Unsubscribe, Ok(())) => {
                if record.leaving {
                    self.records.remove(&op.key);
                }
            }
            (OpKind::Unsubscribe, Err(_)) => record.leaving = false,
        }
    }

    /// Removes every pending operation, oldest first.
    pub(crate) fn take_pending(&mut self) -> Vec<PendingOp> {
        let mut ops: Vec<PendingOp> = self.pending.drain().map(|(_, op)| op).collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Wire form of every stored subscription, for replay.
    pub(crate) fn wire_subscriptions(&self) -> Vec<WireSubscription> {
        self.active()
            .map(|((pattern, share), record)| wire(pattern, share, record))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.active()
            .map(|((pattern, share), record)| SubscriptionInfo {
                pattern: pattern.clone(),
                share: share.clone(),
                qos: record.settings.qos,
                credit: record.settings.credit,
                ttl: record.settings.ttl,
                auto_confirm: record.settings.auto_confirm,
                delivered: record.delivered,
                confirmed: record.confirmed,
            })
            .collect()
    }

    fn active(&self) -> impl Iterator<Item = (&Key, &Record)> {
        self.records.iter().filter(|(_, record)| !record.leaving)
    }
}

fn wire(pattern: &str, share: &Option<String>, record: &Record) -> WireSubscription {
    WireSubscription {
        pattern: pattern.to_string(),
        share: share.clone(),
        qos: record.settings.qos,
        credit: record.settings.credit,
        ttl: record.settings.ttl,
    }
}

/// Handle used by [`InboundMessage::confirm`] to acknowledge one delivery.
#[derive(Clone)]
pub(crate) struct Confirmation {
    inner: Weak<Inner>,
    generation: u64,
    key: Key,
    tag: u64,
    done: Arc<AtomicBool>,
}

impl Confirmation {
    pub(crate) fn confirm(&self) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let inner = self
            .inner
            .upgrade()
            .ok_or(ClientError::Stopped(LifecycleState::Stopped))?;
        inner.confirm_delivery(self)?;
        self.done.store(true, Ordering::Release);
        Ok(())
    }
}

impl Inner {
    pub(crate) fn subscribe(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: SubscribeOptions,
        callback: Option<SubscribeCallback>,
    ) -> Result<()> {
        validate::topic_pattern(pattern)?;
        let share = validate::share(share)?;
        let ttl = options.ttl.map(validate::ttl).transpose()?.unwrap_or(0);

        let mut guard = self.core();
        let core = &mut *guard;
        core.ensure_started()?;

        let settings = Settings {
            qos: options.qos,
            credit: options.credit,
            ttl,
            auto_confirm: options.auto_confirm,
            handler: options.handler,
        };
        let key = (pattern.to_string(), share.clone());
        let (id, subscription) = core.subscriptions.begin_subscribe(key, settings, callback);
        debug!(client_id = %self.id, "Subscribing to '{}' (share {:?}, {})", pattern, share, options.qos);
        core.submit(WireOp::Subscribe { id, subscription });
        Ok(())
    }

    pub(crate) fn unsubscribe(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: UnsubscribeOptions,
        callback: Option<SubscribeCallback>,
    ) -> Result<()> {
        validate::topic_pattern(pattern)?;
        let share = validate::share(share)?;
        if let Some(ttl) = options.ttl {
            validate::unsubscribe_ttl(ttl)?;
        }

        let mut guard = self.core();
        let core = &mut *guard;
        core.ensure_started()?;

        let key = (pattern.to_string(), share.clone());
        let Some(id) = core.subscriptions.begin_unsubscribe(key, callback) else {
            return Err(ClientError::Unsubscribed {
                pattern: pattern.to_string(),
                share,
            });
        };
        debug!(client_id = %self.id, "Unsubscribing from '{}' (share {:?})", pattern, share);
        core.submit(WireOp::Unsubscribe {
            id,
            pattern: pattern.to_string(),
            share,
        });
        Ok(())
    }

    /// Wire result of a subscribe or unsubscribe.
    ///
    /// Results from a connection that is no longer live are ignored: the
    /// operation stays pending and is settled by the next connect or by
    /// `stop`.
    pub(crate) fn complete_op(&self, generation: u64, id: u64, result: Result<()>) {
        let mut guard = self.core();
        let core = &mut *guard;
        if !core.is_live(generation) {
            return;
        }
        if let Some(op) = core.subscriptions.pending.remove(&id) {
            self.settle_op(&mut core.subscriptions, op, result);
        }
    }

    /// Fires the completion of an operation taken out of the pending set.
    pub(crate) fn settle_op(&self, table: &mut SubscriptionTable, mut op: PendingOp, result: Result<()>) {
        if let Err(err) = &result {
            warn!(
                client_id = %self.id,
                "{:?} of '{}' failed: {}",
                op.kind,
                op.key.0,
                err
            );
        }
        table.finish(&mut op, &result);
        if let Some(callback) = op.callback {
            let (pattern, share) = op.key;
            let label = match op.kind {
                OpKind::Subscribe => "subscribe",
                OpKind::Unsubscribe => "unsubscribe",
            };
            self.dispatcher.post(label, move |client| {
                callback(client, result, &pattern, share.as_deref())
            });
        }
    }

    /// Routes one inbound message to its subscription's handler.
    pub(crate) fn deliver(self: &Arc<Self>, generation: u64, mut message: InboundMessage) {
        let (handler, auto_confirm, tag) = {
            let mut guard = self.core();
            let core = &mut *guard;
            if !core.is_live(generation) {
                return;
            }
            let Some(record) = core.subscriptions.records.get_mut(&message.key()) else {
                warn!(
                    client_id = %self.id,
                    "Dropping message on '{}': no subscription for '{}'",
                    message.topic(),
                    message.pattern()
                );
                if let Some(tag) = message.tag() {
                    core.submit(WireOp::Confirm { tag });
                }
                return;
            };
            record.delivered += 1;
            let handler = record
                .settings
                .handler
                .clone()
                .or_else(|| self.hooks.on_message.clone());
            let tag = message.tag().filter(|_| message.qos() == Qos::AtLeastOnce);
            (handler, record.settings.auto_confirm, tag)
        };

        let confirmation = tag.map(|tag| Confirmation {
            inner: Arc::downgrade(self),
            generation,
            key: message.key(),
            tag,
            done: Arc::new(AtomicBool::new(false)),
        });
        if let (Some(confirmation), false) = (&confirmation, auto_confirm) {
            message.attach_confirmation(confirmation.clone());
        }

        trace!(client_id = %self.id, "Delivering message on '{}'", message.topic());
        self.dispatcher.post_for(generation, "message", move |client| {
            match handler {
                Some(handler) => handler(client, &message),
                None => warn!("No message handler for '{}', message dropped", message.topic()),
            }
            if let (Some(confirmation), true) = (confirmation, auto_confirm) {
                if let Err(err) = confirmation.confirm() {
                    debug!("Automatic confirm failed: {}", err);
                }
            }
        });
    }

    fn confirm_delivery(&self, confirmation: &Confirmation) -> Result<()> {
        let mut guard = self.core();
        let core = &mut *guard;
        if !core.is_live(confirmation.generation) {
            return Err(ClientError::Stopped(core.state));
        }
        if let Some(record) = core.subscriptions.records.get_mut(&confirmation.key) {
            record.confirmed += 1;
        }
        core.submit(WireOp::Confirm {
            tag: confirmation.tag,
        });
        Ok(())
    }

    pub(crate) fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.core().subscriptions.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use crate::{
        message::{Qos, SendOptions, SubscribeOptions, UnsubscribeOptions},
        state::LifecycleState,
        testing::{harness, harness_with, recv},
        ClientError,
    };

    #[tokio::test]
    async fn test_subscribe_unsubscribe_echo() {
        let (client, _transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        let sub_tx = tx.clone();
        client
            .subscribe_with("/foo/+", Some("workers"), SubscribeOptions::default(), move |_, result, pattern, share| {
                let _ = sub_tx.send((result, pattern.to_string(), share.map(str::to_string)));
            })
            .unwrap();
        let echo = recv(&rx).await;
        assert_eq!(echo, (Ok(()), "/foo/+".to_string(), Some("workers".to_string())));
        assert_eq!(client.subscriptions().len(), 1);

        client
            .unsubscribe_with("/foo/+", Some("workers"), UnsubscribeOptions::default(), move |_, result, pattern, share| {
                let _ = tx.send((result, pattern.to_string(), share.map(str::to_string)));
            })
            .unwrap();
        let echo = recv(&rx).await;
        assert_eq!(echo, (Ok(()), "/foo/+".to_string(), Some("workers".to_string())));
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_pattern() {
        let (client, _transport, events) = harness(|config| config);
        events.start(&client).await;

        assert_eq!(
            client.unsubscribe("/never", None, UnsubscribeOptions::default()),
            Err(ClientError::Unsubscribed {
                pattern: "/never".into(),
                share: None
            })
        );
        client
            .subscribe("/foo", Some("a"), SubscribeOptions::default())
            .unwrap();
        assert!(matches!(
            client.unsubscribe("/foo", Some("b"), UnsubscribeOptions::default()),
            Err(ClientError::Unsubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn test_operations_require_started() {
        let (client, _transport, _events) = harness(|config| config);
        assert_eq!(
            client.subscribe("/foo", None, SubscribeOptions::default()),
            Err(ClientError::Stopped(LifecycleState::Stopped))
        );
        assert_eq!(
            client.unsubscribe("/foo", None, UnsubscribeOptions::default()),
            Err(ClientError::Stopped(LifecycleState::Stopped))
        );
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let (client, _transport, events) = harness(|config| config);
        events.start(&client).await;

        assert!(matches!(
            client.subscribe("", None, SubscribeOptions::default()),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.subscribe("/foo", Some("bad:share"), SubscribeOptions::default()),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(client
            .subscribe("/foo", Some("1234"), SubscribeOptions::default())
            .is_ok());
        for ttl in [-1.0, 0.5, f64::NAN, f64::INFINITY, 4_294_967_296.0] {
            assert!(matches!(
                client.subscribe("/foo", None, SubscribeOptions::default().with_ttl(ttl)),
                Err(ClientError::Range(_))
            ));
        }
        assert!(client
            .subscribe("/zero", None, SubscribeOptions::default().with_ttl(0.0))
            .is_ok());
        assert!(matches!(
            client.unsubscribe("/zero", None, UnsubscribeOptions { ttl: Some(10.0) }),
            Err(ClientError::Range(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_updates_options() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        for options in [
            SubscribeOptions::default(),
            SubscribeOptions::at_least_once().with_credit(10),
        ] {
            let tx = tx.clone();
            client
                .subscribe_with("/foo", None, options, move |_, result, _, _| {
                    let _ = tx.send(result);
                })
                .unwrap();
        }
        assert!(recv(&rx).await.is_ok());
        assert!(recv(&rx).await.is_ok());

        let subscriptions = client.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].qos, Qos::AtLeastOnce);
        assert_eq!(subscriptions[0].credit, 10);

        let handle = transport.live_connections()[0];
        assert_eq!(transport.subscriptions(handle).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_removes_record() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;
        transport.fail_next_subscribes(1);

        let (tx, rx) = mpsc::channel();
        client
            .subscribe_with("/foo", None, SubscribeOptions::default(), move |_, result, _, _| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert!(matches!(recv(&rx).await, Err(ClientError::Network(_))));
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_subscribe_keeps_record_of_later_one() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;
        transport.fail_next_subscribes(1);

        let (tx, rx) = mpsc::channel();
        let (msg_tx, msg_rx) = mpsc::channel();
        for (index, options) in [
            SubscribeOptions::default(),
            SubscribeOptions::default().with_handler(move |_, message| {
                let _ = msg_tx.send(message.topic().to_string());
            }),
        ]
        .into_iter()
        .enumerate()
        {
            let tx = tx.clone();
            client
                .subscribe_with("/foo", None, options, move |_, result, _, _| {
                    let _ = tx.send((index, result));
                })
                .unwrap();
        }
        assert!(matches!(recv(&rx).await, (0, Err(ClientError::Network(_)))));
        assert_eq!(recv(&rx).await, (1, Ok(())));
        assert_eq!(client.subscriptions().len(), 1);

        assert_eq!(transport.publish("/foo", "hi", Qos::AtMostOnce), 1);
        assert_eq!(recv(&msg_rx).await, "/foo");
    }

    #[tokio::test]
    async fn test_failed_update_restores_options() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        client
            .subscribe_with("/foo", None, SubscribeOptions::at_least_once().with_credit(10), move |_, result, _, _| {
                let _ = first.send(result);
            })
            .unwrap();
        assert!(recv(&rx).await.is_ok());

        transport.fail_next_subscribes(1);
        client
            .subscribe_with("/foo", None, SubscribeOptions::default().with_credit(5), move |_, result, _, _| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert!(recv(&rx).await.is_err());

        let subscriptions = client.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].qos, Qos::AtLeastOnce);
        assert_eq!(subscriptions[0].credit, 10);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_can_be_retried() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;

        let (msg_tx, msg_rx) = mpsc::channel();
        let options = SubscribeOptions::default().with_handler(move |_, message| {
            let _ = msg_tx.send(message.topic().to_string());
        });
        client.subscribe("/foo", None, options).unwrap();
        events.wait_for_subscriptions(&transport, 1).await;

        transport.fail_next_unsubscribes(1);
        let (tx, rx) = mpsc::channel();
        let failed = tx.clone();
        client
            .unsubscribe_with("/foo", None, UnsubscribeOptions::default(), move |_, result, _, _| {
                let _ = failed.send(result);
            })
            .unwrap();
        assert!(matches!(recv(&rx).await, Err(ClientError::Network(_))));
        assert_eq!(client.subscriptions().len(), 1);

        transport.publish("/foo", "still here", Qos::AtMostOnce);
        assert_eq!(recv(&msg_rx).await, "/foo");

        client
            .unsubscribe_with("/foo", None, UnsubscribeOptions::default(), move |_, result, _, _| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert!(recv(&rx).await.is_ok());
        assert!(client.subscriptions().is_empty());
        let handle = transport.live_connections()[0];
        assert!(transport.subscriptions(handle).is_empty());
    }

    #[tokio::test]
    async fn test_second_unsubscribe_while_leaving() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;
        client.subscribe("/foo", None, SubscribeOptions::default()).unwrap();
        events.wait_for_subscriptions(&transport, 1).await;

        client.unsubscribe("/foo", None, UnsubscribeOptions::default()).unwrap();
        assert!(matches!(
            client.unsubscribe("/foo", None, UnsubscribeOptions::default()),
            Err(ClientError::Unsubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_handler_for_subscriptions_without_one() {
        let (tx, rx) = mpsc::channel();
        let default_tx = tx.clone();
        let (client, transport, events) = harness_with(
            |config| config,
            move |builder| {
                builder.on_message(move |_, message| {
                    let text = message.payload().as_text().map(str::to_string);
                    let _ = default_tx.send(("default", text));
                })
            },
        );
        events.start(&client).await;

        let own = SubscribeOptions::default().with_handler(move |_, message| {
            let text = message.payload().as_text().map(str::to_string);
            let _ = tx.send(("own", text));
        });
        let (done_tx, done_rx) = mpsc::channel();
        for (pattern, options) in [("/own", own), ("/other", SubscribeOptions::default())] {
            let done_tx = done_tx.clone();
            client
                .subscribe_with(pattern, None, options, move |_, result, _, _| {
                    let _ = done_tx.send(result);
                })
                .unwrap();
        }
        assert!(recv(&done_rx).await.is_ok());
        assert!(recv(&done_rx).await.is_ok());

        transport.publish("/own", "hello", Qos::AtMostOnce);
        transport.publish("/other", "world", Qos::AtMostOnce);
        assert_eq!(recv(&rx).await, ("own", Some("hello".to_string())));
        assert_eq!(recv(&rx).await, ("default", Some("world".to_string())));

        let delivered: Vec<_> = client
            .subscriptions()
            .into_iter()
            .map(|info| (info.pattern, info.delivered))
            .collect();
        assert_eq!(
            delivered,
            vec![("/other".to_string(), 1), ("/own".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_manual_confirm() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        let options = SubscribeOptions::at_least_once()
            .with_auto_confirm(false)
            .with_handler(move |_, message| {
                let _ = tx.send(message.clone());
            });
        client.subscribe("/t", None, options).unwrap();
        events.wait_for_subscriptions(&transport, 1).await;

        let (sent_tx, sent_rx) = mpsc::channel();
        client
            .send_with("/t", "x", SendOptions::at_least_once(), move |_, result, _| {
                let _ = sent_tx.send(result);
            })
            .unwrap();

        let message = recv(&rx).await;
        assert!(message.needs_confirmation());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent_rx.try_recv().is_err());

        message.confirm().unwrap();
        message.confirm().unwrap();
        assert!(recv(&sent_rx).await.is_ok());
        assert_eq!(client.subscriptions()[0].confirmed, 1);
    }
}
