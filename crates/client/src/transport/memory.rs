//! In-process loopback broker.
//!
//! `MemoryTransport` behaves like a small message service living inside the
//! process. Every client connected to the same instance can exchange
//! messages with every other one, including itself.
//!
//! Routing follows the usual rules: each matching plain subscription gets a
//! copy; each share group gets one copy, handed to its members in
//! round-robin order. At-least-once sends are acknowledged only once every
//! receiver that got an at-least-once copy has confirmed it, so a sender
//! observes its acknowledgement after the subscriber's receive callback.
//!
//! Fault injection hooks let tests script failures: failing or rejected
//! connects, severed links, and acknowledgements that are held back until
//! released.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

use super::{
    topic_matches, ConnectRequest, ConnectionHandle, DeliveryAck, DeliveryToken, LinkStatus,
    Transport, TransportError, WireMessage, WireSubscription,
};
use crate::message::{InboundMessage, Payload, Qos};

/// Loopback broker shared by any number of clients.
#[derive(Default)]
pub struct MemoryTransport {
    broker: Mutex<Broker>,
}

#[derive(Default)]
struct Broker {
    next_handle: u64,
    next_tag: u64,
    next_group: u64,
    links: HashMap<ConnectionHandle, Link>,
    groups: HashMap<u64, AckGroup>,
    held: VecDeque<u64>,
    share_cursors: HashMap<(String, String), usize>,
    failing_connects: u32,
    rejection: Option<String>,
    failing_subscribes: u32,
    failing_unsubscribes: u32,
    hold_acks: bool,
    connect_attempts: u64,
}

struct Link {
    client_id: String,
    subscriptions: Vec<WireSubscription>,
    inbox: Option<mpsc::UnboundedSender<InboundMessage>>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    status: LinkStatus,
    /// Delivery tag -> acknowledgement group awaiting this link's confirm.
    unconfirmed: HashMap<u64, u64>,
}

/// Acknowledgement of one at-least-once send, waiting on receivers.
struct AckGroup {
    sender: Option<ConnectionHandle>,
    remaining: usize,
    ack: Option<DeliveryAck>,
}

struct Delivery {
    handle: ConnectionHandle,
    pattern: String,
    share: Option<String>,
    qos: Qos,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` connect attempts fail with a transient error.
    pub fn fail_next_connects(&self, count: u32) {
        self.broker().failing_connects = count;
    }

    /// Makes every connect attempt fail with a permanent rejection, or
    /// clears the rejection when `reason` is `None`.
    pub fn reject_connects(&self, reason: Option<&str>) {
        self.broker().rejection = reason.map(str::to_string);
    }

    /// Makes the next `count` wire subscribe requests fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.broker().failing_subscribes = count;
    }

    /// Makes the next `count` wire unsubscribe requests fail.
    pub fn fail_next_unsubscribes(&self, count: u32) {
        self.broker().failing_unsubscribes = count;
    }

    /// Holds back at-least-once acknowledgements until released.
    pub fn hold_acknowledgements(&self, hold: bool) {
        self.broker().hold_acks = hold;
    }

    /// Releases every held acknowledgement in the order they were produced.
    ///
    /// Returns how many were released.
    pub fn release_acknowledgements(&self) -> usize {
        let acks: Vec<DeliveryAck> = {
            let mut broker = self.broker();
            let held: Vec<u64> = broker.held.drain(..).collect();
            held.into_iter()
                .filter_map(|group| broker.groups.remove(&group).and_then(|g| g.ack))
                .collect()
        };
        let count = acks.len();
        acks.into_iter().for_each(DeliveryAck::confirm);
        count
    }

    /// Releases only the most recently held acknowledgement.
    pub fn release_latest_acknowledgement(&self) -> bool {
        let ack = {
            let mut broker = self.broker();
            broker
                .held
                .pop_back()
                .and_then(|group| broker.groups.remove(&group))
                .and_then(|group| group.ack)
        };
        match ack {
            Some(ack) => {
                ack.confirm();
                true
            }
            None => false,
        }
    }

    /// Number of acknowledgements currently held back.
    pub fn held_acknowledgements(&self) -> usize {
        self.broker().held.len()
    }

    /// Drops a live link as if the network failed.
    pub fn sever(&self, handle: ConnectionHandle) {
        let released = self.broker().close_link(handle, severed());
        released.into_iter().for_each(DeliveryAck::confirm);
    }

    /// Drops every live link.
    pub fn sever_all(&self) {
        let released: Vec<DeliveryAck> = {
            let mut broker = self.broker();
            broker
                .live_handles()
                .into_iter()
                .flat_map(|handle| broker.close_link(handle, severed()))
                .collect()
        };
        released.into_iter().for_each(DeliveryAck::confirm);
    }

    /// Total connect attempts seen, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.broker().connect_attempts
    }

    /// Handles of links that are currently connected.
    pub fn live_connections(&self) -> Vec<ConnectionHandle> {
        self.broker().live_handles()
    }

    /// Client id a link was opened with.
    pub fn client_id(&self, handle: ConnectionHandle) -> Option<String> {
        self.broker().links.get(&handle).map(|link| link.client_id.clone())
    }

    /// Wire subscriptions registered on a link.
    pub fn subscriptions(&self, handle: ConnectionHandle) -> Vec<WireSubscription> {
        self.broker()
            .links
            .get(&handle)
            .map(|link| link.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Publishes a message from outside any client. Returns the number of
    /// subscriptions it was delivered to.
    pub fn publish(&self, topic: &str, payload: impl Into<Payload>, qos: Qos) -> usize {
        let message = WireMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            ttl: None,
        };
        let mut broker = self.broker();
        let deliveries = broker.route(&message);
        let count = deliveries.len();
        broker.deliver(&message, deliveries, None);
        count
    }
}

fn severed() -> LinkStatus {
    LinkStatus::Error(TransportError::Closed("connection severed".into()))
}

impl Broker {
    fn live_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.status == LinkStatus::Connected)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    fn live_link(&mut self, handle: ConnectionHandle) -> Result<&mut Link, TransportError> {
        match self.links.get_mut(&handle) {
            Some(link) if link.status == LinkStatus::Connected => Ok(link),
            Some(_) => Err(TransportError::Closed(format!("{handle} is closed"))),
            None => Err(TransportError::UnknownHandle(handle)),
        }
    }

    /// Finds every receiver of a message: one per matching plain
    /// subscription and one per matching share group.
    fn route(&mut self, message: &WireMessage) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let mut groups: HashMap<(String, String), Vec<(ConnectionHandle, Qos)>> = HashMap::new();

        for handle in self.live_handles() {
            let Some(link) = self.links.get(&handle) else {
                continue;
            };
            for subscription in &link.subscriptions {
                if !topic_matches(&subscription.pattern, &message.topic) {
                    continue;
                }
                match &subscription.share {
                    Some(share) => groups
                        .entry((subscription.pattern.clone(), share.clone()))
                        .or_default()
                        .push((handle, subscription.qos)),
                    None => deliveries.push(Delivery {
                        handle,
                        pattern: subscription.pattern.clone(),
                        share: None,
                        qos: subscription.qos,
                    }),
                }
            }
        }

        let mut keys: Vec<_> = groups.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(members) = groups.get(&key) else {
                continue;
            };
            let cursor = self.share_cursors.entry(key.clone()).or_insert(0);
            let (handle, qos) = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            deliveries.push(Delivery {
                handle,
                pattern: key.0,
                share: Some(key.1),
                qos,
            });
        }
        deliveries
    }

    /// Pushes a routed message into receiver inboxes. Returns the number of
    /// at-least-once copies that must be confirmed before `group` settles.
    fn deliver(&mut self, message: &WireMessage, deliveries: Vec<Delivery>, group: Option<u64>) -> usize {
        let mut awaiting = 0;
        for delivery in deliveries {
            let tracked = message.qos == Qos::AtLeastOnce && delivery.qos == Qos::AtLeastOnce;
            let qos = if tracked { Qos::AtLeastOnce } else { Qos::AtMostOnce };
            let mut inbound = InboundMessage::new(
                message.topic.clone(),
                message.payload.clone(),
                delivery.pattern,
                delivery.share,
                qos,
            );
            if tracked {
                self.next_tag += 1;
                inbound = inbound.with_tag(self.next_tag);
            }
            let tag = self.next_tag;
            let Some(link) = self.links.get_mut(&delivery.handle) else {
                continue;
            };
            let Some(inbox) = &link.inbox else {
                continue;
            };
            if inbox.send(inbound).is_err() {
                continue;
            }
            if tracked {
                if let Some(group) = group {
                    link.unconfirmed.insert(tag, group);
                    awaiting += 1;
                }
            }
        }
        awaiting
    }

    /// Settles an acknowledgement group, or parks it while acks are held.
    fn settle(&mut self, group_id: u64) -> Option<DeliveryAck> {
        if self.hold_acks {
            self.held.push_back(group_id);
            return None;
        }
        self.groups.remove(&group_id).and_then(|group| group.ack)
    }

    fn confirm_tag(&mut self, group_id: u64) -> Option<DeliveryAck> {
        let done = match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.remaining = group.remaining.saturating_sub(1);
                group.remaining == 0
            }
            None => false,
        };
        if done {
            self.settle(group_id)
        } else {
            None
        }
    }

    fn close_link(&mut self, handle: ConnectionHandle, status: LinkStatus) -> Vec<DeliveryAck> {
        let Some(link) = self.links.get_mut(&handle) else {
            return Vec::new();
        };
        link.status = status;
        link.inbox = None;
        link.subscriptions.clear();
        let pending: Vec<u64> = link.unconfirmed.drain().map(|(_, group)| group).collect();

        // Copies that will never be confirmed no longer hold the sender back.
        let released: Vec<DeliveryAck> = pending
            .into_iter()
            .filter_map(|group| self.confirm_tag(group))
            .collect();

        // Acknowledgements owed to the closed link are abandoned.
        let orphaned: Vec<u64> = self
            .groups
            .iter()
            .filter(|(_, group)| group.sender == Some(handle))
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            self.groups.remove(&id);
            self.held.retain(|held| *held != id);
        }
        released
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, TransportError> {
        let mut broker = self.broker();
        broker.connect_attempts += 1;

        if let Some(reason) = &broker.rejection {
            return Err(TransportError::Rejected(reason.clone()));
        }
        if broker.failing_connects > 0 {
            broker.failing_connects -= 1;
            return Err(TransportError::Connect(format!(
                "{} is unreachable",
                request.service
            )));
        }

        broker.next_handle += 1;
        let handle = ConnectionHandle::new(broker.next_handle);
        let (tx, rx) = mpsc::unbounded_channel();
        broker.links.insert(
            handle,
            Link {
                client_id: request.client_id.clone(),
                subscriptions: Vec::new(),
                inbox: Some(tx),
                receiver: Arc::new(AsyncMutex::new(rx)),
                status: LinkStatus::Connected,
                unconfirmed: HashMap::new(),
            },
        );
        debug!("Memory link {} opened for client {}", handle, request.client_id);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) {
        let released = {
            let mut broker = self.broker();
            let released = broker.close_link(handle, LinkStatus::Disconnected);
            broker.links.remove(&handle);
            released
        };
        released.into_iter().for_each(DeliveryAck::confirm);
        debug!("Memory link {} closed", handle);
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        subscription: &WireSubscription,
    ) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if broker.failing_subscribes > 0 {
            broker.failing_subscribes -= 1;
            return Err(TransportError::Operation(format!(
                "subscribe to '{}' refused",
                subscription.pattern
            )));
        }
        let link = broker.live_link(handle)?;
        link.subscriptions.retain(|existing| {
            !(existing.pattern == subscription.pattern && existing.share == subscription.share)
        });
        link.subscriptions.push(subscription.clone());
        trace!("{} subscribed to '{}'", handle, subscription.pattern);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        pattern: &str,
        share: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if broker.failing_unsubscribes > 0 {
            broker.failing_unsubscribes -= 1;
            return Err(TransportError::Operation(format!(
                "unsubscribe from '{pattern}' refused"
            )));
        }
        let link = broker.live_link(handle)?;
        link.subscriptions
            .retain(|existing| !(existing.pattern == pattern && existing.share.as_deref() == share));
        trace!("{} unsubscribed from '{}'", handle, pattern);
        Ok(())
    }

    async fn send(
        &self,
        handle: ConnectionHandle,
        message: &WireMessage,
    ) -> Result<DeliveryToken, TransportError> {
        let (token, ack) = {
            let mut broker = self.broker();
            broker.live_link(handle)?;
            let deliveries = broker.route(message);

            if message.qos == Qos::AtMostOnce {
                broker.deliver(message, deliveries, None);
                return Ok(DeliveryToken::settled());
            }

            broker.next_group += 1;
            let group_id = broker.next_group;
            let (ack, token) = DeliveryToken::pending();
            broker.groups.insert(
                group_id,
                AckGroup {
                    sender: Some(handle),
                    remaining: 0,
                    ack: Some(ack),
                },
            );
            let awaiting = broker.deliver(message, deliveries, Some(group_id));
            let ack = if awaiting > 0 {
                if let Some(group) = broker.groups.get_mut(&group_id) {
                    group.remaining = awaiting;
                }
                None
            } else {
                broker.settle(group_id)
            };
            (token, ack)
        };
        if let Some(ack) = ack {
            ack.confirm();
        }
        Ok(token)
    }

    async fn poll_received(&self, handle: ConnectionHandle) -> Option<InboundMessage> {
        let receiver = {
            let broker = self.broker();
            broker.links.get(&handle)?.receiver.clone()
        };
        let mut receiver = receiver.lock().await;
        receiver.recv().await
    }

    fn status(&self, handle: ConnectionHandle) -> LinkStatus {
        self.broker()
            .links
            .get(&handle)
            .map(|link| link.status.clone())
            .unwrap_or(LinkStatus::Disconnected)
    }

    async fn confirm(&self, handle: ConnectionHandle, tag: u64) -> Result<(), TransportError> {
        let ack = {
            let mut broker = self.broker();
            let link = broker.live_link(handle)?;
            match link.unconfirmed.remove(&tag) {
                Some(group) => broker.confirm_tag(group),
                None => None,
            }
        };
        if let Some(ack) = ack {
            ack.confirm();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{SecurityOptions, ServiceAddress};

    fn request(id: &str) -> ConnectRequest {
        ConnectRequest {
            client_id: id.to_string(),
            service: "amqp://localhost".parse::<ServiceAddress>().unwrap(),
            security: SecurityOptions::default(),
        }
    }

    fn subscription(pattern: &str, share: Option<&str>, qos: Qos) -> WireSubscription {
        WireSubscription {
            pattern: pattern.to_string(),
            share: share.map(str::to_string),
            qos,
            credit: 1024,
            ttl: 0,
        }
    }

    fn message(topic: &str, payload: &str, qos: Qos) -> WireMessage {
        WireMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            ttl: None,
        }
    }

    async fn next(transport: &MemoryTransport, handle: ConnectionHandle) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(1), transport.poll_received(handle))
            .await
            .expect("timed out waiting for message")
            .expect("link closed")
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(2);

        assert!(matches!(
            transport.connect(request("a")).await,
            Err(TransportError::Connect(_))
        ));
        assert!(transport.connect(request("a")).await.is_err());
        let handle = transport.connect(request("a")).await.unwrap();

        assert_eq!(transport.connect_attempts(), 3);
        assert_eq!(transport.status(handle), LinkStatus::Connected);
        assert_eq!(transport.client_id(handle).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let transport = MemoryTransport::new();
        transport.reject_connects(Some("bad credentials"));
        let err = transport.connect(request("a")).await.unwrap_err();
        assert!(err.is_fatal());

        transport.reject_connects(None);
        assert!(transport.connect(request("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_loopback_delivery_with_wildcards() {
        let transport = MemoryTransport::new();
        let handle = transport.connect(request("a")).await.unwrap();
        transport
            .subscribe(handle, &subscription("/foo/+", None, Qos::AtMostOnce))
            .await
            .unwrap();

        transport
            .send(handle, &message("/foo/bar", "hello", Qos::AtMostOnce))
            .await
            .unwrap()
            .confirmed()
            .await
            .unwrap();

        let received = next(&transport, handle).await;
        assert_eq!(received.topic(), "/foo/bar");
        assert_eq!(received.pattern(), "/foo/+");
        assert_eq!(received.payload().as_text(), Some("hello"));
        assert_eq!(received.tag(), None);
    }

    #[tokio::test]
    async fn test_share_group_round_robin() {
        let transport = MemoryTransport::new();
        let first = transport.connect(request("a")).await.unwrap();
        let second = transport.connect(request("b")).await.unwrap();
        for handle in [first, second] {
            transport
                .subscribe(handle, &subscription("jobs", Some("workers"), Qos::AtMostOnce))
                .await
                .unwrap();
        }

        assert_eq!(transport.publish("jobs", "1", Qos::AtMostOnce), 1);
        assert_eq!(transport.publish("jobs", "2", Qos::AtMostOnce), 1);

        let a = next(&transport, first).await;
        let b = next(&transport, second).await;
        assert_eq!(a.share(), Some("workers"));
        assert_eq!(a.payload().as_text(), Some("1"));
        assert_eq!(b.payload().as_text(), Some("2"));
    }

    #[tokio::test]
    async fn test_at_least_once_waits_for_receiver_confirm() {
        let transport = MemoryTransport::new();
        let handle = transport.connect(request("a")).await.unwrap();
        transport
            .subscribe(handle, &subscription("/t", None, Qos::AtLeastOnce))
            .await
            .unwrap();

        let token = transport
            .send(handle, &message("/t", "x", Qos::AtLeastOnce))
            .await
            .unwrap();
        let received = next(&transport, handle).await;
        let tag = received.tag().expect("tracked delivery has a tag");

        let waiter = tokio::spawn(token.confirmed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        transport.confirm(handle, tag).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_held_acknowledgements_release_in_order() {
        let transport = MemoryTransport::new();
        let handle = transport.connect(request("a")).await.unwrap();
        transport.hold_acknowledgements(true);

        let first = transport
            .send(handle, &message("/t", "1", Qos::AtLeastOnce))
            .await
            .unwrap();
        let second = transport
            .send(handle, &message("/t", "2", Qos::AtLeastOnce))
            .await
            .unwrap();
        assert_eq!(transport.held_acknowledgements(), 2);

        assert!(transport.release_latest_acknowledgement());
        assert!(second.confirmed().await.is_ok());
        assert_eq!(transport.release_acknowledgements(), 1);
        assert!(first.confirmed().await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_closes_link_and_fails_pending_acks() {
        let transport = MemoryTransport::new();
        let handle = transport.connect(request("a")).await.unwrap();
        transport.hold_acknowledgements(true);
        let token = transport
            .send(handle, &message("/t", "1", Qos::AtLeastOnce))
            .await
            .unwrap();

        transport.sever(handle);

        assert!(transport.poll_received(handle).await.is_none());
        assert!(matches!(transport.status(handle), LinkStatus::Error(_)));
        assert!(matches!(token.confirmed().await, Err(TransportError::Closed(_))));
        assert!(transport.live_connections().is_empty());
        assert!(transport
            .send(handle, &message("/t", "2", Qos::AtMostOnce))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let transport = MemoryTransport::new();
        let handle = transport.connect(request("a")).await.unwrap();
        transport
            .subscribe(handle, &subscription("/t", None, Qos::AtMostOnce))
            .await
            .unwrap();
        transport.unsubscribe(handle, "/t", None).await.unwrap();

        assert!(transport.subscriptions(handle).is_empty());
        assert_eq!(transport.publish("/t", "x", Qos::AtMostOnce), 0);
    }
}
