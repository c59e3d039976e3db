//! Long-poll bus backend
//!
//! Serves `/topic`, `/data` and `/systemTopic` channels over Bayeux.
//! Clients are pooled by (instance URL, access token): every subscription
//! with the same credential shares one handshake and one connect loop.
//!
//! Each pooled client is a task owning its Bayeux session. Subscriptions
//! talk to it through a command channel, so all session state has a single
//! writer. The pool counts references; the client disconnects and exits
//! when its last subscription is released.

pub mod message;
pub mod transport;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use streamgate_core::error::excerpt;
use streamgate_core::{
    BackendRequest, Credential, GatewayError, PoolKey, Result, StreamBackend, StreamItem,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use message::{BayeuxMessage, Reconnect, META_CONNECT, META_HANDSHAKE, META_SUBSCRIBE};
pub use transport::{BayeuxTransport, HttpTransportFactory, TransportFactory};

enum Command {
    Subscribe {
        subscription_id: String,
        channel: String,
        replay: i64,
        events: mpsc::Sender<StreamItem>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Shutdown,
}

/// Handle to one pooled Bayeux session
pub struct PooledClient {
    key: PoolKey,
    commands: mpsc::UnboundedSender<Command>,
    refs: AtomicUsize,
}

impl PooledClient {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::upstream("long-poll client has shut down"))
    }

    fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn references(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Reference-counted map of pooled clients
pub struct CometdPool {
    factory: Arc<dyn TransportFactory>,
    clients: Mutex<HashMap<PoolKey, Arc<PooledClient>>>,
}

impl CometdPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<PoolKey, Arc<PooledClient>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reference to the client for this credential, starting one if needed
    pub fn acquire(&self, credential: &Credential) -> Result<Arc<PooledClient>> {
        let key = credential.pool_key();
        let mut clients = self.clients();

        if let Some(client) = clients.get(&key) {
            if !client.is_closed() {
                let refs = client.refs.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(pool_key = ?key, refs, "Reusing pooled long-poll client");
                return Ok(Arc::clone(client));
            }
        }

        let transport = self.factory.create(credential)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let client = Arc::new(PooledClient {
            key: key.clone(),
            commands,
            refs: AtomicUsize::new(1),
        });
        tokio::spawn(BusSession::new(key.clone(), transport, rx).run());
        clients.insert(key.clone(), Arc::clone(&client));
        info!(pool_key = ?key, "Started pooled long-poll client");
        Ok(client)
    }

    /// Drop a reference; the last one tears the client down
    pub fn release(&self, client: &Arc<PooledClient>) {
        let mut clients = self.clients();
        let remaining = client.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 {
            return;
        }

        if clients
            .get(&client.key)
            .is_some_and(|pooled| Arc::ptr_eq(pooled, client))
        {
            clients.remove(&client.key);
        }
        let _ = client.send(Command::Shutdown);
        info!(pool_key = ?client.key, "Released pooled long-poll client");
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`StreamBackend`] for the long-poll bus
pub struct CometdBackend {
    pool: Arc<CometdPool>,
    queue_depth: usize,
}

impl CometdBackend {
    pub fn new(pool: Arc<CometdPool>, queue_depth: usize) -> Self {
        Self { pool, queue_depth }
    }
}

impl StreamBackend for CometdBackend {
    fn open(&self, request: BackendRequest) -> Result<mpsc::Receiver<StreamItem>> {
        let client = self.pool.acquire(&request.credential)?;
        let (events, rx) = mpsc::channel(self.queue_depth);

        let subscribed = client.send(Command::Subscribe {
            subscription_id: request.subscription_id.clone(),
            channel: request.route.name.clone(),
            replay: request.replay.bayeux_value(),
            events,
        });
        if let Err(error) = subscribed {
            self.pool.release(&client);
            return Err(error);
        }

        let pool = Arc::clone(&self.pool);
        let cancel = request.cancel;
        let subscription_id = request.subscription_id;
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = client.send(Command::Unsubscribe { subscription_id });
            pool.release(&client);
        });

        Ok(rx)
    }
}

struct ChannelState {
    /// Replay position to resubscribe from: the last id seen, else the
    /// original marker
    replay: i64,
    subscribers: HashMap<String, mpsc::Sender<StreamItem>>,
}

/// The task behind one [`PooledClient`]
struct BusSession {
    key: PoolKey,
    transport: Arc<dyn BayeuxTransport>,
    commands: mpsc::UnboundedReceiver<Command>,
    client_id: Option<String>,
    interval: Duration,
    channels: HashMap<String, ChannelState>,
}

type Poll = BoxFuture<'static, Result<Vec<BayeuxMessage>>>;

impl BusSession {
    fn new(
        key: PoolKey,
        transport: Arc<dyn BayeuxTransport>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            key,
            transport,
            commands,
            client_id: None,
            interval: Duration::ZERO,
            channels: HashMap::new(),
        }
    }

    async fn run(mut self) {
        let error = match self.serve().await {
            Ok(()) => GatewayError::upstream("long-poll client closed"),
            Err(error) => {
                warn!(pool_key = ?self.key, %error, "Long-poll session failed");
                self.fail_all(&error);
                error
            }
        };

        // Subscriptions that raced with the shutdown still get an answer
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Subscribe { events, .. } = command {
                let _ = events.send(StreamItem::Failed(error.clone())).await;
            }
        }
        debug!(pool_key = ?self.key, "Long-poll session exited");
    }

    async fn serve(&mut self) -> Result<()> {
        self.handshake().await?;
        let mut poll = self.next_poll(Duration::ZERO)?;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { subscription_id, channel, replay, events }) => {
                        self.subscribe(subscription_id, channel, replay, events).await;
                    }
                    Some(Command::Unsubscribe { subscription_id }) => {
                        self.unsubscribe(&subscription_id).await;
                    }
                    Some(Command::Shutdown) | None => {
                        self.disconnect().await;
                        return Ok(());
                    }
                },
                replies = &mut poll => {
                    let delay = self.handle_connect(replies?).await?;
                    poll = self.next_poll(delay)?;
                }
            }
        }
    }

    fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| GatewayError::upstream("long-poll session has no client id"))
    }

    fn next_poll(&self, delay: Duration) -> Result<Poll> {
        let connect = BayeuxMessage::connect(self.client_id()?);
        let transport = Arc::clone(&self.transport);
        Ok(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            transport.exchange(vec![connect]).await
        }
        .boxed())
    }

    async fn handshake(&mut self) -> Result<()> {
        let replies = self.transport.exchange(vec![BayeuxMessage::handshake()]).await?;
        let reply = replies
            .into_iter()
            .find(|m| m.channel == META_HANDSHAKE)
            .ok_or_else(|| GatewayError::upstream("handshake reply missing"))?;
        if !reply.is_successful() {
            return Err(GatewayError::upstream(format!(
                "Bayeux handshake failed: {}",
                excerpt(&reply.failure_reason())
            )));
        }
        if let Some(interval) = reply.advice.as_ref().and_then(|a| a.interval) {
            self.interval = Duration::from_millis(interval);
        }
        let client_id = reply
            .client_id
            .ok_or_else(|| GatewayError::upstream("handshake reply without clientId"))?;
        info!(pool_key = ?self.key, %client_id, "Bayeux handshake complete");
        self.client_id = Some(client_id);
        Ok(())
    }

    async fn send_subscribe(&self, channel: &str, replay: i64) -> Result<()> {
        let message = BayeuxMessage::subscribe(self.client_id()?, channel, replay);
        let replies = self.transport.exchange(vec![message]).await?;
        let reply = replies
            .iter()
            .find(|m| m.channel == META_SUBSCRIBE)
            .ok_or_else(|| GatewayError::upstream("subscribe reply missing"))?;
        if !reply.is_successful() {
            return Err(GatewayError::upstream(format!(
                "subscribe to {channel} failed: {}",
                excerpt(&reply.failure_reason())
            )));
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        subscription_id: String,
        channel: String,
        replay: i64,
        events: mpsc::Sender<StreamItem>,
    ) {
        if let Some(state) = self.channels.get_mut(&channel) {
            debug!(%subscription_id, %channel, "Joined existing channel subscription");
            state.subscribers.insert(subscription_id, events);
            return;
        }

        match self.send_subscribe(&channel, replay).await {
            Ok(()) => {
                info!(%subscription_id, %channel, replay, "Subscribed on long-poll bus");
                self.channels.insert(
                    channel,
                    ChannelState {
                        replay,
                        subscribers: HashMap::from([(subscription_id, events)]),
                    },
                );
            }
            Err(error) => {
                warn!(%subscription_id, %channel, %error, "Long-poll subscribe rejected");
                let _ = events.send(StreamItem::Failed(error)).await;
            }
        }
    }

    /// Drop one subscriber and hand back its sender; the channel is
    /// unsubscribed on the bus when it was the last one
    async fn unsubscribe(&mut self, subscription_id: &str) -> Option<mpsc::Sender<StreamItem>> {
        let (channel, events) = self.channels.iter_mut().find_map(|(channel, state)| {
            state
                .subscribers
                .remove(subscription_id)
                .map(|events| (channel.clone(), events))
        })?;

        let now_empty = self
            .channels
            .get(&channel)
            .is_some_and(|state| state.subscribers.is_empty());
        if !now_empty {
            return Some(events);
        }

        self.channels.remove(&channel);
        if let Ok(client_id) = self.client_id() {
            let message = BayeuxMessage::unsubscribe(client_id, &channel);
            match self.transport.exchange(vec![message]).await {
                Ok(_) => info!(%channel, "Unsubscribed on long-poll bus"),
                Err(error) => warn!(%channel, %error, "Long-poll unsubscribe failed"),
            }
        }
        Some(events)
    }

    async fn disconnect(&mut self) {
        let Ok(client_id) = self.client_id() else {
            return;
        };
        let message = BayeuxMessage::disconnect(client_id);
        if let Err(error) = self.transport.exchange(vec![message]).await {
            debug!(%error, "Bayeux disconnect failed");
        }
        self.client_id = None;
    }

    /// Process one connect reply batch and decide when to poll next
    async fn handle_connect(&mut self, replies: Vec<BayeuxMessage>) -> Result<Duration> {
        let mut reconnect = None;
        let mut failure = None;

        for message in replies {
            if message.channel == META_CONNECT {
                if let Some(advice) = &message.advice {
                    if let Some(interval) = advice.interval {
                        self.interval = Duration::from_millis(interval);
                    }
                    reconnect = advice.reconnect;
                }
                if !message.is_successful() {
                    failure = Some(message.failure_reason());
                }
            } else if message.is_meta() {
                debug!(channel = %message.channel, "Ignoring meta reply in connect batch");
            } else {
                self.deliver(message).await;
            }
        }

        match (reconnect, failure) {
            (Some(Reconnect::None), reason) => Err(GatewayError::upstream(format!(
                "server ended the long-poll session: {}",
                reason.unwrap_or_else(|| "reconnect advice is none".to_string())
            ))),
            (Some(Reconnect::Handshake), reason) | (None, reason @ Some(_)) => {
                warn!(pool_key = ?self.key, ?reason, "Re-handshaking long-poll session");
                self.handshake().await?;
                self.resubscribe_all().await;
                Ok(self.interval)
            }
            _ => Ok(self.interval),
        }
    }

    /// Fan an event out without waiting on any one subscriber; a subscriber
    /// whose queue is full is failed and dropped
    async fn deliver(&mut self, message: BayeuxMessage) {
        let Some(state) = self.channels.get_mut(&message.channel) else {
            debug!(channel = %message.channel, "Event for channel with no subscribers");
            return;
        };
        if let Some(replay_id) = message.replay_id() {
            state.replay = replay_id;
        }

        let channel = message.channel.clone();
        let event = message.into_stream_event();
        let mut lagging = Vec::new();
        for (subscription_id, events) in &state.subscribers {
            if let Err(TrySendError::Full(_)) = events.try_send(StreamItem::Event(event.clone())) {
                lagging.push(subscription_id.clone());
            }
        }

        for subscription_id in lagging {
            warn!(%subscription_id, %channel, "Subscriber fell behind the long-poll bus");
            if let Some(events) = self.unsubscribe(&subscription_id).await {
                notify(
                    events,
                    StreamItem::Failed(GatewayError::upstream(format!(
                        "event queue for {channel} overflowed"
                    ))),
                );
            }
        }
    }

    /// After a new handshake every channel is subscribed again from where it left off
    async fn resubscribe_all(&mut self) {
        let channels: Vec<(String, i64)> = self
            .channels
            .iter()
            .map(|(channel, state)| (channel.clone(), state.replay))
            .collect();

        for (channel, replay) in channels {
            if let Err(error) = self.send_subscribe(&channel, replay).await {
                warn!(%channel, %error, "Resubscribe failed");
                if let Some(state) = self.channels.remove(&channel) {
                    for events in state.subscribers.into_values() {
                        notify(events, StreamItem::Failed(error.clone()));
                    }
                }
            }
        }
    }

    fn fail_all(&mut self, error: &GatewayError) {
        for (_, state) in self.channels.drain() {
            for events in state.subscribers.into_values() {
                notify(events, StreamItem::Failed(error.clone()));
            }
        }
    }
}

/// Queue a terminal item behind whatever the subscriber has not read yet,
/// without holding up the bus
fn notify(events: mpsc::Sender<StreamItem>, item: StreamItem) {
    tokio::spawn(async move {
        let _ = events.send(item).await;
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::message::{META_DISCONNECT, META_UNSUBSCRIBE};
    use super::*;
    use crate::pubsub::tests::credential;
    use async_trait::async_trait;
    use serde_json::json;
    use streamgate_core::credential::CredentialParams;
    use streamgate_core::{select_protocol, ReplayMarker};
    use tokio_util::sync::CancellationToken;

    /// Scripted Bayeux server: handshake and subscribe succeed, connects
    /// return whatever the test queues
    pub struct FakeBus {
        pub sent: Mutex<Vec<BayeuxMessage>>,
        pub handshakes: AtomicUsize,
        deliveries: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<BayeuxMessage>>>>,
        reject: Option<String>,
    }

    impl FakeBus {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<Vec<BayeuxMessage>>>) {
            Self::build(None)
        }

        fn rejecting(channel: &str) -> (Arc<Self>, mpsc::UnboundedSender<Result<Vec<BayeuxMessage>>>) {
            Self::build(Some(channel.to_string()))
        }

        fn build(reject: Option<String>) -> (Arc<Self>, mpsc::UnboundedSender<Result<Vec<BayeuxMessage>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let bus = Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                handshakes: AtomicUsize::new(0),
                deliveries: tokio::sync::Mutex::new(rx),
                reject,
            });
            (bus, tx)
        }

        pub fn sent_on(&self, channel: &str) -> Vec<BayeuxMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.channel == channel)
                .cloned()
                .collect()
        }
    }

    fn reply(channel: &str, successful: bool) -> BayeuxMessage {
        BayeuxMessage {
            channel: channel.to_string(),
            successful: Some(successful),
            ..Default::default()
        }
    }

    pub fn connect_ok() -> BayeuxMessage {
        reply(META_CONNECT, true)
    }

    pub fn data(channel: &str, replay_id: i64, name: &str) -> BayeuxMessage {
        BayeuxMessage {
            channel: channel.to_string(),
            data: Some(json!({
                "event": {"replayId": replay_id},
                "sobject": {"Name": name}
            })),
            ..Default::default()
        }
    }

    #[async_trait]
    impl BayeuxTransport for FakeBus {
        async fn exchange(&self, messages: Vec<BayeuxMessage>) -> Result<Vec<BayeuxMessage>> {
            self.sent.lock().unwrap().extend(messages.iter().cloned());
            let message = &messages[0];
            match message.channel.as_str() {
                META_HANDSHAKE => {
                    let n = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut ok = reply(META_HANDSHAKE, true);
                    ok.client_id = Some(format!("client-{n}"));
                    Ok(vec![ok])
                }
                META_SUBSCRIBE => {
                    let rejected = self.reject.as_deref() == message.subscription.as_deref();
                    let mut ack = reply(META_SUBSCRIBE, !rejected);
                    if rejected {
                        ack.error = Some("403:denied:channel not allowed".to_string());
                    }
                    Ok(vec![ack])
                }
                META_CONNECT => {
                    let mut deliveries = self.deliveries.lock().await;
                    match deliveries.recv().await {
                        Some(batch) => batch,
                        None => std::future::pending().await,
                    }
                }
                other => Ok(vec![reply(other, true)]),
            }
        }
    }

    pub struct FakeFactory {
        pub bus: Arc<FakeBus>,
        pub created: AtomicUsize,
    }

    impl TransportFactory for FakeFactory {
        fn create(&self, _credential: &Credential) -> Result<Arc<dyn BayeuxTransport>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.bus.clone())
        }
    }

    pub fn fake_pool(bus: Arc<FakeBus>) -> (Arc<CometdPool>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory {
            bus,
            created: AtomicUsize::new(0),
        });
        (Arc::new(CometdPool::new(factory.clone())), factory)
    }

    fn request(channel: &str, id: &str, replay: ReplayMarker) -> BackendRequest {
        BackendRequest {
            subscription_id: id.to_string(),
            route: select_protocol(channel).unwrap(),
            credential: credential(),
            replay,
            cancel: CancellationToken::new(),
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_item(rx: &mut mpsc::Receiver<StreamItem>) -> StreamItem {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_same_credential_shares_one_client() {
        let (bus, _deliveries) = FakeBus::new();
        let (pool, factory) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool.clone(), 16);

        let _a = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        let _b = backend
            .open(request("/topic/ContactUpdates", "b", ReplayMarker::Earliest))
            .unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;
        assert_eq!(bus.handshakes.load(Ordering::SeqCst), 1);

        let subscribes = bus.sent_on(META_SUBSCRIBE);
        assert_eq!(
            subscribes[0].ext,
            Some(json!({"replay": {"/topic/AccountUpdates": -1}}))
        );
        assert_eq!(
            subscribes[1].ext,
            Some(json!({"replay": {"/topic/ContactUpdates": -2}}))
        );
    }

    #[tokio::test]
    async fn test_different_tokens_get_separate_clients() {
        let (bus, _deliveries) = FakeBus::new();
        let (pool, factory) = fake_pool(bus);
        let backend = CometdBackend::new(pool.clone(), 16);

        let _a = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        let mut other = request("AccountUpdates", "b", ReplayMarker::Latest);
        other.credential = Credential::from_params(CredentialParams {
            access_token: "00D5g000004ABCD!AQ4AnotherSession".to_string(),
            instance_url: "https://acme.my.salesforce.com".to_string(),
        })
        .unwrap();
        let _b = backend.open(other).unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_fan_out_to_channel_subscribers() {
        let (bus, deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 16);

        let mut accounts = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        let mut contacts = backend
            .open(request("ContactUpdates", "b", ReplayMarker::Latest))
            .unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;

        deliveries
            .send(Ok(vec![
                connect_ok(),
                data("/topic/AccountUpdates", 11, "Acme"),
                data("/topic/ContactUpdates", 12, "Ada"),
            ]))
            .unwrap();

        match next_item(&mut accounts).await {
            StreamItem::Event(event) => {
                assert_eq!(event.channel, "/topic/AccountUpdates");
                assert_eq!(event.payload["Name"], json!("Acme"));
                assert_eq!(event.replay_id, json!(11));
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_item(&mut contacts).await {
            StreamItem::Event(event) => assert_eq!(event.payload["Name"], json!("Ada")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_others() {
        let (bus, deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 1);

        let mut stalled = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        let mut contacts = backend
            .open(request("ContactUpdates", "b", ReplayMarker::Latest))
            .unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;

        deliveries
            .send(Ok(vec![
                connect_ok(),
                data("/topic/AccountUpdates", 1, "Acme"),
                data("/topic/AccountUpdates", 2, "Globex"),
                data("/topic/ContactUpdates", 3, "Ada"),
            ]))
            .unwrap();

        match next_item(&mut contacts).await {
            StreamItem::Event(event) => assert_eq!(event.replay_id, json!(3)),
            other => panic!("unexpected {other:?}"),
        }
        eventually(|| bus.sent_on(META_UNSUBSCRIBE).len() == 1).await;
        assert_eq!(
            bus.sent_on(META_UNSUBSCRIBE)[0].subscription.as_deref(),
            Some("/topic/AccountUpdates")
        );

        match next_item(&mut stalled).await {
            StreamItem::Event(event) => assert_eq!(event.replay_id, json!(1)),
            other => panic!("unexpected {other:?}"),
        }
        match next_item(&mut stalled).await {
            StreamItem::Failed(error) => assert!(error.to_string().contains("overflowed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_release_unsubscribes_and_disconnects() {
        let (bus, _deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool.clone(), 16);

        let first = request("AccountUpdates", "a", ReplayMarker::Latest);
        let second = request("AccountUpdates", "b", ReplayMarker::Latest);
        let (first_cancel, second_cancel) = (first.cancel.clone(), second.cancel.clone());
        let _a = backend.open(first).unwrap();
        let _b = backend.open(second).unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 1).await;

        first_cancel.cancel();
        eventually(|| {
            pool.clients()
                .values()
                .next()
                .is_some_and(|client| client.references() == 1)
        })
        .await;
        assert!(bus.sent_on(META_UNSUBSCRIBE).is_empty());
        assert_eq!(pool.len(), 1);

        second_cancel.cancel();
        eventually(|| bus.sent_on(META_DISCONNECT).len() == 1).await;
        assert_eq!(bus.sent_on(META_UNSUBSCRIBE).len(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_advice_resubscribes_from_last_replay() {
        let (bus, deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 16);

        let mut rx = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 1).await;

        deliveries
            .send(Ok(vec![connect_ok(), data("/topic/AccountUpdates", 41, "Acme")]))
            .unwrap();
        assert!(matches!(next_item(&mut rx).await, StreamItem::Event(_)));

        let mut expired = reply(META_CONNECT, false);
        expired.error = Some("403::Unknown client".to_string());
        expired.advice = Some(message::Advice {
            reconnect: Some(Reconnect::Handshake),
            interval: Some(0),
            timeout: None,
        });
        deliveries.send(Ok(vec![expired])).unwrap();

        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;
        assert_eq!(bus.handshakes.load(Ordering::SeqCst), 2);
        let resubscribe = &bus.sent_on(META_SUBSCRIBE)[1];
        assert_eq!(resubscribe.client_id.as_deref(), Some("client-2"));
        assert_eq!(
            resubscribe.ext,
            Some(json!({"replay": {"/topic/AccountUpdates": 41}}))
        );
    }

    #[tokio::test]
    async fn test_reconnect_none_fails_every_subscriber() {
        let (bus, deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 16);

        let mut a = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        let mut b = backend
            .open(request("/data/AccountChangeEvent", "b", ReplayMarker::Latest))
            .unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;

        let mut gone = reply(META_CONNECT, false);
        gone.advice = Some(message::Advice {
            reconnect: Some(Reconnect::None),
            ..Default::default()
        });
        deliveries.send(Ok(vec![gone])).unwrap();

        assert!(matches!(next_item(&mut a).await, StreamItem::Failed(_)));
        assert!(matches!(next_item(&mut b).await, StreamItem::Failed(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_fails_subscribers() {
        let (bus, deliveries) = FakeBus::new();
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 16);

        let mut rx = backend
            .open(request("AccountUpdates", "a", ReplayMarker::Latest))
            .unwrap();
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 1).await;

        deliveries
            .send(Err(GatewayError::upstream("connection reset")))
            .unwrap();
        match next_item(&mut rx).await {
            StreamItem::Failed(error) => assert!(error.to_string().contains("connection reset")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_subscribe_fails_only_that_subscription() {
        let (bus, _deliveries) = FakeBus::rejecting("/topic/Forbidden");
        let (pool, _) = fake_pool(bus.clone());
        let backend = CometdBackend::new(pool, 16);

        let mut denied = backend
            .open(request("Forbidden", "a", ReplayMarker::Latest))
            .unwrap();
        let _allowed = backend
            .open(request("AccountUpdates", "b", ReplayMarker::Latest))
            .unwrap();

        match next_item(&mut denied).await {
            StreamItem::Failed(error) => assert!(error.to_string().contains("denied")),
            other => panic!("unexpected {other:?}"),
        }
        eventually(|| bus.sent_on(META_SUBSCRIBE).len() == 2).await;
        assert!(bus.sent_on(META_DISCONNECT).is_empty());
    }
}
