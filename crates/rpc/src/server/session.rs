//! Server-side state for one client.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use eloquent_transport::Binding;
use eloquent_wire::{
    EndpointKind, EndpointMessage, ErrorKind, HostAddress, SessionBody, SessionMessage,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Deliver, ObjectAdapter, SubscriberKey};
use crate::channel::MessageChannel;
use crate::error::{Error, Result};
use crate::serializer::{CallInfo, Serializer};
use crate::settings::Settings;

/// Sent to the hub when a session ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Termination {
    pub client: HostAddress,
    pub session_id: u64,
}

type Outgoing = (SessionMessage, EndpointMessage);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    object_id: String,
    connection_id: i32,
    event: String,
}

/// One connected client: reverse event channel, liveness and subscriptions.
pub(crate) struct Session {
    id: u64,
    client: HostAddress,
    local: HostAddress,
    serializer: Arc<dyn Serializer>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    heartbeat_lost: AtomicU32,
    max_heartbeat_lost: u32,
    connections: Mutex<HashSet<(String, i32)>>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Weak<ObjectAdapter>>>,
    terminated: AtomicBool,
    terminations: mpsc::UnboundedSender<Termination>,
    cancel: CancellationToken,
}

/// Everything a session needs from the server that opens it.
pub(crate) struct SessionParams<'a> {
    pub id: u64,
    pub client: HostAddress,
    pub local: HostAddress,
    pub binding: &'a dyn Binding,
    pub settings: &'a Settings,
    pub serializer: Arc<dyn Serializer>,
    pub terminations: mpsc::UnboundedSender<Termination>,
    pub cancel: CancellationToken,
}

impl Session {
    /// Connect the reverse channel to the client and start the session's tasks.
    pub async fn open(params: SessionParams<'_>) -> Result<Arc<Self>> {
        let settings = params.settings;
        let stream = timeout(settings.send_timeout, params.binding.connect(&params.client))
            .await
            .map_err(|_| Error::Timeout(settings.send_timeout))??;
        let channel = MessageChannel::new(stream, settings.max_frame_size);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: params.id,
            client: params.client,
            local: params.local,
            serializer: params.serializer,
            outgoing,
            heartbeat_lost: AtomicU32::new(0),
            max_heartbeat_lost: settings.max_heartbeat_lost,
            connections: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            terminations: params.terminations,
            cancel: params.cancel,
        });

        tokio::spawn(write_loop(
            channel,
            outgoing_rx,
            session.cancel.clone(),
            Arc::downgrade(&session),
        ));
        if let Some(period) = settings.heartbeat_interval() {
            tokio::spawn(monitor_heartbeats(
                Arc::downgrade(&session),
                period,
                session.cancel.clone(),
            ));
        }

        info!("Session opened for {}", session.client);
        Ok(session)
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn client(&self) -> &HostAddress {
        &self.client
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// A heartbeat arrived.
    pub fn heartbeat(&self) {
        self.heartbeat_lost.store(0, Ordering::SeqCst);
    }

    /// A heartbeat period passed. Returns whether the client is now considered lost.
    pub fn heartbeat_missed(&self) -> bool {
        self.heartbeat_lost.fetch_add(1, Ordering::SeqCst) + 1 > self.max_heartbeat_lost
    }

    pub fn connect(&self, object_id: &str, connection_id: i32) {
        self.connections
            .lock()
            .insert((object_id.to_string(), connection_id));
        debug!("{} connected to {} as {}", self.client, object_id, connection_id);
    }

    /// Whether the client announced `connection_id` to `object_id` and has not closed it.
    pub fn is_connected(&self, object_id: &str, connection_id: i32) -> bool {
        self.connections
            .lock()
            .contains(&(object_id.to_string(), connection_id))
    }

    /// Close a logical connection and drop its subscriptions.
    pub fn disconnect(&self, object_id: &str, connection_id: i32) {
        self.connections
            .lock()
            .remove(&(object_id.to_string(), connection_id));
        let dropped = self.take_subscriptions(|key| {
            key.object_id == object_id && key.connection_id == connection_id
        });
        self.detach(dropped);
        debug!("{} disconnected {} from {}", self.client, connection_id, object_id);
    }

    /// Start forwarding `event` of `adapter` to this client.
    pub fn subscribe(
        &self,
        adapter: &Arc<ObjectAdapter>,
        connection_id: i32,
        event: &str,
    ) -> std::result::Result<(), ErrorKind> {
        let object_id = adapter.object_id().to_string();
        let deliver = self.deliver_to(object_id.clone(), connection_id);
        adapter.subscribe(event, self.subscriber_key(connection_id), deliver)?;

        self.subscriptions.lock().insert(
            SubscriptionKey {
                object_id,
                connection_id,
                event: event.to_string(),
            },
            Arc::downgrade(adapter),
        );
        Ok(())
    }

    /// Stop forwarding `event`. Unknown subscriptions are ignored.
    pub fn unsubscribe(
        &self,
        adapter: Option<&Arc<ObjectAdapter>>,
        object_id: &str,
        connection_id: i32,
        event: &str,
    ) {
        self.subscriptions.lock().remove(&SubscriptionKey {
            object_id: object_id.to_string(),
            connection_id,
            event: event.to_string(),
        });
        if let Some(adapter) = adapter {
            adapter.unsubscribe(event, &self.subscriber_key(connection_id));
        }
    }

    /// Forget everything about an object that is no longer hosted.
    pub fn drop_object(&self, object_id: &str) {
        self.connections.lock().retain(|(id, _)| id != object_id);
        let dropped = self.take_subscriptions(|key| key.object_id == object_id);
        if !dropped.is_empty() {
            debug!(
                "Dropped {} subscriptions of {} to removed object {}",
                dropped.len(),
                self.client,
                object_id
            );
        }
    }

    /// Ask the hub to remove this session. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.terminations.send(Termination {
                client: self.client.clone(),
                session_id: self.id,
            });
        }
    }

    /// Stop the session's tasks and detach every subscription.
    pub fn dispose(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.connections.lock().clear();
        let dropped = self.take_subscriptions(|_| true);
        self.detach(dropped);
        info!("Session for {} disposed", self.client);
    }

    fn subscriber_key(&self, connection_id: i32) -> SubscriberKey {
        SubscriberKey {
            client: self.client.clone(),
            connection_id,
        }
    }

    fn deliver_to(&self, object_id: String, connection_id: i32) -> Deliver {
        let outgoing = self.outgoing.clone();
        let serializer = self.serializer.clone();
        let local = self.local.clone();
        Arc::new(move |call: CallInfo| match serializer.serialize_call(&call) {
            Ok(payload) => {
                let marker = SessionMessage::new(local.clone(), SessionBody::Event);
                let endpoint = EndpointMessage::new(
                    EndpointKind::Event,
                    object_id.clone(),
                    connection_id,
                    payload,
                );
                // Closed once the session is disposed
                let _ = outgoing.send((marker, endpoint));
            }
            Err(e) => warn!("Could not encode event {}: {}", call.operation_name, e),
        })
    }

    fn take_subscriptions(
        &self,
        matches: impl Fn(&SubscriptionKey) -> bool,
    ) -> Vec<(SubscriptionKey, Weak<ObjectAdapter>)> {
        let mut subscriptions = self.subscriptions.lock();
        let keys: Vec<SubscriptionKey> = subscriptions
            .keys()
            .filter(|key| matches(key))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| subscriptions.remove_entry(&key))
            .collect()
    }

    fn detach(&self, subscriptions: Vec<(SubscriptionKey, Weak<ObjectAdapter>)>) {
        for (key, adapter) in subscriptions {
            if let Some(adapter) = adapter.upgrade() {
                adapter.unsubscribe(&key.event, &self.subscriber_key(key.connection_id));
            }
        }
    }
}

async fn write_loop(
    mut channel: MessageChannel,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
    session: Weak<Session>,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some((marker, endpoint)) = next else {
            break;
        };
        if let Err(e) = channel.send_pair(&marker, &endpoint).await {
            warn!("Event delivery failed: {}", e);
            if let Some(session) = session.upgrade() {
                session.terminate();
            }
            break;
        }
    }
    let _ = channel.close().await;
}

async fn monitor_heartbeats(session: Weak<Session>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if session.heartbeat_missed() {
                    warn!("Session for {} lost its heartbeat", session.client());
                    session.terminate();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eloquent_transport::MemoryBinding;

    async fn open(
        settings: &Settings,
        client: &HostAddress,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Termination>) {
        let (terminations, terminations_rx) = mpsc::unbounded_channel();
        let session = Session::open(SessionParams {
            id: 1,
            client: client.clone(),
            local: HostAddress::new("session-server", 1),
            binding: &MemoryBinding::new(),
            settings,
            serializer: Arc::new(crate::CborSerializer::new()),
            terminations,
            cancel: CancellationToken::new(),
        })
        .await
        .unwrap();
        (session, terminations_rx)
    }

    #[tokio::test]
    async fn test_missed_heartbeats_count_up_to_limit() {
        let binding = MemoryBinding::new();
        let client = HostAddress::new("session-client", 0);
        let listener = binding.listen(&client).await.unwrap();
        let settings = Settings::default().with_heartbeat_ms(0).with_max_heartbeat_lost(2);
        let (session, _rx) = open(&settings, listener.local_address()).await;

        assert!(!session.heartbeat_missed());
        assert!(!session.heartbeat_missed());
        session.heartbeat();
        assert!(!session.heartbeat_missed());
        assert!(!session.heartbeat_missed());
        assert!(session.heartbeat_missed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_is_terminated() {
        let binding = MemoryBinding::new();
        let listener = binding
            .listen(&HostAddress::new("session-silent", 0))
            .await
            .unwrap();
        let settings = Settings::default()
            .with_heartbeat_ms(100)
            .with_max_heartbeat_lost(3);
        let (session, mut terminations) = open(&settings, listener.local_address()).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(terminations.try_recv().is_err());

        let termination = terminations.recv().await.unwrap();
        assert_eq!(&termination.client, listener.local_address());
        assert_eq!(termination.session_id, 1);
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let binding = MemoryBinding::new();
        let listener = binding
            .listen(&HostAddress::new("session-term", 0))
            .await
            .unwrap();
        let (session, mut terminations) =
            open(&Settings::default(), listener.local_address()).await;

        session.terminate();
        session.terminate();
        assert!(terminations.recv().await.is_some());
        assert!(terminations.try_recv().is_err());
        session.dispose();
    }
}
