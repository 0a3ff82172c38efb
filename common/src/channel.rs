//! Publish/subscribe channel over a Redis broker.
//!
//! Publishing goes through [`RedisPublisher`], which keeps an offline queue
//! while the broker is unreachable and drains it at a fixed rate once the
//! connection comes back.  Subscriptions run on their own thread and hand
//! every message to a callback; callers keep that callback down to
//! "decode and enqueue".
//!
//! [`MemoryBus`] is an in-process stand-in with the same surface, used to
//! drive the capture agent without a broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, TlsFiles};

/// How often the subscriber wakes up to look at the shutdown flag.
const SUBSCRIBER_POLL: Duration = Duration::from_secs(1);
/// Delay between subscriber reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot connect to broker at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("cannot read TLS material {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("subscription failed: {source}")]
    Subscribe {
        #[source]
        source: redis::RedisError,
    },
    #[error("channel closed")]
    Closed,
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Anything that can publish a payload to a topic.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError>;

    /// Send whatever was held back while the broker was unreachable.
    /// Returns how many messages went out.  Called from idle loops.
    fn flush(&mut self) -> usize {
        0
    }
}

/// Connection parameters, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub tls: Option<TlsFiles>,
    pub offline_queue_depth: usize,
    pub drain_hz: u32,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.broker_url.clone(),
            tls: config.tls.clone(),
            offline_queue_depth: config.offline_queue_depth,
            drain_hz: config.drain_hz,
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
        }
    }

    fn drain_interval(&self) -> Duration {
        Duration::from_secs(1) / self.drain_hz.max(1)
    }

    /// Build a client, attaching mutual-TLS material when configured.
    fn client(&self) -> Result<redis::Client, ChannelError> {
        let connect_err = |source| ChannelError::Connect {
            url: self.url.clone(),
            source,
        };
        match &self.tls {
            None => redis::Client::open(self.url.as_str()).map_err(connect_err),
            Some(tls) => {
                install_crypto_provider();
                let read = |path: &std::path::Path| {
                    std::fs::read(path).map_err(|source| ChannelError::Tls {
                        path: path.display().to_string(),
                        source,
                    })
                };
                let certs = redis::TlsCertificates {
                    client_tls: Some(redis::ClientTlsConfig {
                        client_cert: read(&tls.client_cert)?,
                        client_key: read(&tls.client_key)?,
                    }),
                    root_cert: Some(read(&tls.root_ca)?),
                };
                redis::Client::build_with_tls(self.url.as_str(), certs).map_err(connect_err)
            }
        }
    }

    fn connect(&self, client: &redis::Client) -> Result<redis::Connection, ChannelError> {
        let conn = client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(|source| ChannelError::Connect {
                url: self.url.clone(),
                source,
            })?;
        // Timeouts are best-effort; a connection without them still works.
        let _ = conn.set_read_timeout(Some(self.operation_timeout));
        let _ = conn.set_write_timeout(Some(self.operation_timeout));
        Ok(conn)
    }
}

/// rustls needs a process-wide crypto provider before any TLS client is
/// built.  Installing twice is harmless.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

// ── offline queue ────────────────────────────────────────────────────────

/// Messages waiting for the broker to come back.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    items: VecDeque<(String, Vec<u8>)>,
    /// Zero means unbounded.
    depth: usize,
}

impl OfflineQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            items: VecDeque::new(),
            depth,
        }
    }

    /// Queue a message.  When full, the oldest message is dropped and
    /// returned.
    pub fn push(&mut self, topic: &str, payload: &[u8]) -> Option<(String, Vec<u8>)> {
        let dropped = if self.depth > 0 && self.items.len() >= self.depth {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back((topic.to_string(), payload.to_vec()));
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Send queued messages in order, pausing `interval` between sends.
    /// Stops at the first failure and keeps that message at the front.
    pub fn drain<F>(&mut self, interval: Duration, mut send: F) -> Result<usize, ChannelError>
    where
        F: FnMut(&str, &[u8]) -> Result<(), ChannelError>,
    {
        let mut sent = 0;
        while let Some((topic, payload)) = self.items.pop_front() {
            if let Err(e) = send(&topic, &payload) {
                self.items.push_front((topic, payload));
                return Err(e);
            }
            sent += 1;
            if !self.items.is_empty() && !interval.is_zero() {
                std::thread::sleep(interval);
            }
        }
        Ok(sent)
    }
}

// ── publisher ────────────────────────────────────────────────────────────

/// One broker connection that may drop and come back.
pub trait Link {
    /// Make sure a connection is up.  `false` means the broker is unreachable.
    fn ensure_connected(&mut self) -> bool;

    /// Send one message.  An error leaves the link disconnected.
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError>;
}

/// A Redis connection, re-established on demand.
pub struct RedisLink {
    settings: BrokerSettings,
    client: redis::Client,
    conn: Option<redis::Connection>,
    next_attempt: Option<Instant>,
}

impl RedisLink {
    /// Connect to the broker.  Failure here is a startup failure.
    pub fn connect(settings: BrokerSettings) -> Result<Self, ChannelError> {
        let client = settings.client()?;
        let conn = settings.connect(&client)?;
        info!("Connected to broker at {}", settings.url);
        Ok(Self {
            settings,
            client,
            conn: Some(conn),
            next_attempt: None,
        })
    }
}

impl Link for RedisLink {
    fn ensure_connected(&mut self) -> bool {
        if self.conn.is_some() {
            return true;
        }
        if self.next_attempt.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        match self.settings.connect(&self.client) {
            Ok(conn) => {
                info!("Reconnected to broker at {}", self.settings.url);
                self.conn = Some(conn);
                self.next_attempt = None;
                true
            }
            Err(e) => {
                debug!("Broker still unreachable: {e}");
                self.next_attempt = Some(Instant::now() + RECONNECT_DELAY);
                false
            }
        }
    }

    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ChannelError::Closed);
        };
        let sent = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query::<i64>(conn)
            .map_err(|source| ChannelError::Publish {
                topic: topic.to_string(),
                source,
            });
        match sent {
            Ok(receivers) => {
                debug!("Published {} bytes to {topic} ({receivers} receiver(s))", payload.len());
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                Err(e)
            }
        }
    }
}

/// Publisher that queues messages while its link is down and drains them,
/// in order, once it is back.
pub struct QueuedPublisher<L: Link> {
    link: L,
    offline: OfflineQueue,
    drain_interval: Duration,
}

/// The publisher both endpoints use.
pub type RedisPublisher = QueuedPublisher<RedisLink>;

impl QueuedPublisher<RedisLink> {
    /// Connect to the broker.  Failure here is a startup failure.
    pub fn connect(settings: BrokerSettings) -> Result<Self, ChannelError> {
        let depth = settings.offline_queue_depth;
        let interval = settings.drain_interval();
        Ok(Self::new(RedisLink::connect(settings)?, depth, interval))
    }
}

impl<L: Link> QueuedPublisher<L> {
    pub fn new(link: L, offline_queue_depth: usize, drain_interval: Duration) -> Self {
        Self {
            link,
            offline: OfflineQueue::new(offline_queue_depth),
            drain_interval,
        }
    }

    /// Number of messages waiting in the offline queue.
    pub fn pending(&self) -> usize {
        self.offline.len()
    }

    fn queue(&mut self, topic: &str, payload: &[u8]) {
        if let Some((dropped, _)) = self.offline.push(topic, payload) {
            warn!("Offline queue full – dropped oldest message for {dropped}");
        }
        warn!(
            "Broker unreachable – queued message for {topic} ({} waiting)",
            self.offline.len()
        );
    }
}

impl<L: Link> Publish for QueuedPublisher<L> {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError> {
        self.flush();
        // Queued messages go first.
        if !self.offline.is_empty() || !self.link.ensure_connected() {
            self.queue(topic, payload);
            return Ok(());
        }
        if let Err(e) = self.link.send(topic, payload) {
            warn!("{e}");
            self.queue(topic, payload);
        }
        Ok(())
    }

    fn flush(&mut self) -> usize {
        if self.offline.is_empty() || !self.link.ensure_connected() {
            return 0;
        }
        let link = &mut self.link;
        match self.offline.drain(self.drain_interval, |t, p| link.send(t, p)) {
            Ok(n) => {
                info!("Drained {n} queued message(s)");
                n
            }
            Err(e) => {
                warn!("Drain interrupted: {e}");
                0
            }
        }
    }
}

// ── Redis subscriber ─────────────────────────────────────────────────────

/// Subscribe to `topics` and run `on_message` for every delivery on a
/// dedicated thread.
///
/// Returns once the broker has confirmed the subscription, so nothing
/// published afterwards is missed.  An unreachable broker is reported to
/// the caller; later connection losses are retried until `shutdown` is set.
pub fn subscribe<F>(
    settings: &BrokerSettings,
    topics: Vec<String>,
    shutdown: &'static AtomicBool,
    mut on_message: F,
) -> Result<JoinHandle<()>, ChannelError>
where
    F: FnMut(Delivery) + Send + 'static,
{
    let client = settings.client()?;
    let first = settings.connect(&client)?;
    let settings = settings.clone();
    info!("Subscribing to {:?} at {}", topics, settings.url);

    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let handle = std::thread::Builder::new()
        .name("broker-subscriber".into())
        .spawn(move || {
            let mut ready = Some(ready_tx);
            let mut conn = Some(first);
            while !shutdown.load(Ordering::Relaxed) {
                let mut active = match conn.take() {
                    Some(c) => c,
                    None => match settings.connect(&client) {
                        Ok(c) => {
                            info!("Subscriber reconnected to {}", settings.url);
                            c
                        }
                        Err(e) => {
                            warn!("{e}");
                            std::thread::sleep(RECONNECT_DELAY);
                            continue;
                        }
                    },
                };
                match pump(&mut active, &topics, shutdown, &mut ready, &mut on_message) {
                    Ok(()) => break,
                    Err(source) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(ChannelError::Subscribe { source }));
                            return;
                        }
                        warn!("Subscription lost: {source}");
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
            debug!("Subscriber thread finished");
        })
        .map_err(|_| ChannelError::Closed)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            handle.join().ok();
            Err(e)
        }
        // Shutdown came before the first subscription.
        Err(_) => {
            handle.join().ok();
            Err(ChannelError::Closed)
        }
    }
}

/// Receive messages until shutdown (`Ok`) or a connection error (`Err`).
/// `ready` is signalled once the subscription is in place.
fn pump<F>(
    conn: &mut redis::Connection,
    topics: &[String],
    shutdown: &AtomicBool,
    ready: &mut Option<SyncSender<Result<(), ChannelError>>>,
    on_message: &mut F,
) -> redis::RedisResult<()>
where
    F: FnMut(Delivery),
{
    let mut pubsub = conn.as_pubsub();
    for topic in topics {
        pubsub.subscribe(topic.as_str())?;
    }
    pubsub.set_read_timeout(Some(SUBSCRIBER_POLL))?;
    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        match pubsub.get_message() {
            Ok(msg) => on_message(Delivery {
                topic: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            }),
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        }
    }
}

// ── in-process bus ───────────────────────────────────────────────────────

#[derive(Default)]
struct BusInner {
    log: Vec<Delivery>,
    subscribers: Vec<(Vec<String>, Sender<Delivery>)>,
    closed: bool,
}

/// In-process broker: records every publish and fans it out to
/// subscribers of the matching topic.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topics: &[&str]) -> Receiver<Delivery> {
        let (tx, rx) = mpsc::channel();
        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.lock().subscribers.push((topics, tx));
        rx
    }

    /// Every payload published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .log
            .iter()
            .filter(|d| d.topic == topic)
            .map(|d| d.payload.clone())
            .collect()
    }

    /// Total number of publishes across all topics.
    pub fn publish_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Simulate a broker outage: later publishes fail.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Publish for MemoryBus {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChannelError::Closed);
        }
        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        inner
            .subscribers
            .retain(|(topics, tx)| !topics.contains(&delivery.topic) || tx.send(delivery.clone()).is_ok());
        inner.log.push(delivery);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;

    #[test]
    fn test_offline_queue_bounded_drops_oldest() {
        let mut q = OfflineQueue::new(2);
        assert!(q.push("a", b"1").is_none());
        assert!(q.push("a", b"2").is_none());
        let dropped = q.push("a", b"3").unwrap();
        assert_eq!(dropped.1, b"1".to_vec());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_offline_queue_unbounded() {
        let mut q = OfflineQueue::new(0);
        for i in 0..1000u32 {
            assert!(q.push("t", &i.to_be_bytes()).is_none());
        }
        assert_eq!(q.len(), 1000);
    }

    #[test]
    fn test_offline_queue_drain_stops_on_failure() {
        let mut q = OfflineQueue::new(0);
        q.push("t", b"1");
        q.push("t", b"2");
        q.push("t", b"3");

        let mut sent = Vec::new();
        let result = q.drain(Duration::ZERO, |_, p| {
            if p == b"2" {
                return Err(ChannelError::Closed);
            }
            sent.push(p.to_vec());
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(sent, vec![b"1".to_vec()]);
        // The failed message stays at the front.
        assert_eq!(q.len(), 2);

        let drained = q.drain(Duration::ZERO, |_, _| Ok(())).unwrap();
        assert_eq!(drained, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_memory_bus_fanout() {
        let mut bus = MemoryBus::new();
        let previews = bus.subscribe(&["preview"]);
        let all = bus.subscribe(&["preview", "ack"]);

        bus.publish("preview", b"p").unwrap();
        bus.publish("ack", b"a").unwrap();

        assert_eq!(previews.try_recv().unwrap().payload, b"p".to_vec());
        assert!(previews.try_recv().is_err());
        assert_eq!(all.try_iter().count(), 2);
        assert_eq!(bus.published("ack"), vec![b"a".to_vec()]);
        assert_eq!(bus.publish_count(), 2);

        bus.close();
        assert!(matches!(bus.publish("ack", b"x"), Err(ChannelError::Closed)));
    }

    #[derive(Default)]
    struct FakeLink {
        up: bool,
        sent: Vec<(String, Vec<u8>)>,
    }

    impl Link for FakeLink {
        fn ensure_connected(&mut self) -> bool {
            self.up
        }

        fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), ChannelError> {
            if !self.up {
                return Err(ChannelError::Closed);
            }
            self.sent.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn payloads(link: &FakeLink) -> Vec<Vec<u8>> {
        link.sent.iter().map(|(_, p)| p.clone()).collect()
    }

    #[test]
    fn test_publisher_drains_queue_once_link_returns() {
        let mut publisher = QueuedPublisher::new(FakeLink::default(), 0, Duration::ZERO);
        publisher.publish("snap/keys", b"ack").unwrap();
        publisher.publish("trigger/thumbnail", b"preview").unwrap();
        assert_eq!(publisher.pending(), 2);
        assert!(publisher.link.sent.is_empty());

        // Still down: nothing to do.
        assert_eq!(publisher.flush(), 0);
        assert_eq!(publisher.pending(), 2);

        // Back up: an idle flush sends everything without a new publish.
        publisher.link.up = true;
        assert_eq!(publisher.flush(), 2);
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publisher.link.sent[0].0, "snap/keys");
        assert_eq!(payloads(&publisher.link), vec![b"ack".to_vec(), b"preview".to_vec()]);
    }

    #[test]
    fn test_publisher_keeps_order_behind_queue() {
        let mut publisher = QueuedPublisher::new(FakeLink::default(), 0, Duration::ZERO);
        publisher.publish("t", b"1").unwrap();
        publisher.link.up = true;
        publisher.publish("t", b"2").unwrap();
        assert_eq!(payloads(&publisher.link), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(publisher.pending(), 0);
    }

    #[test]
    fn test_publisher_bounded_queue_keeps_newest() {
        let mut publisher = QueuedPublisher::new(FakeLink::default(), 1, Duration::ZERO);
        publisher.publish("t", b"1").unwrap();
        publisher.publish("t", b"2").unwrap();
        assert_eq!(publisher.pending(), 1);
        publisher.link.up = true;
        assert_eq!(publisher.flush(), 1);
        assert_eq!(payloads(&publisher.link), vec![b"2".to_vec()]);
    }

    fn settings(url: String) -> BrokerSettings {
        BrokerSettings {
            url,
            tls: None,
            offline_queue_depth: 0,
            drain_hz: 2,
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_tls_connect_failure_is_an_error() {
        use std::net::TcpListener;

        // Accepts and hangs up, so the TLS handshake fails.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                drop(stream);
            }
        });

        let testdata = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata");
        let mut settings = settings(format!("rediss://localhost:{port}"));
        settings.tls = Some(TlsFiles {
            root_ca: testdata.join("ca.pem"),
            client_cert: testdata.join("client.pem"),
            client_key: testdata.join("client.key"),
        });

        let result = std::panic::catch_unwind(|| RedisPublisher::connect(settings).is_err());
        assert!(matches!(result, Ok(true)));
    }

    /// Tiny RESP responder: confirms SUBSCRIBE and follows it with one
    /// message on each channel; answers everything else with `+OK`.
    fn fake_broker(message: &'static [u8]) -> (u16, Arc<Mutex<Vec<String>>>) {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let log = server_log.clone();
                std::thread::spawn(move || serve_resp(stream, &log, message));
            }
        });
        (port, log)
    }

    fn serve_resp(stream: std::net::TcpStream, log: &Mutex<Vec<String>>, message: &[u8]) {
        use std::io::{BufReader, Write};

        let Ok(read_half) = stream.try_clone() else {
            return;
        };
        let mut reader = BufReader::new(read_half);
        let mut out = stream;
        while let Some(args) = read_command(&mut reader) {
            let name = args[0].to_ascii_uppercase();
            log.lock().unwrap().push(name.clone());
            let mut reply = Vec::new();
            match name.as_str() {
                "SUBSCRIBE" => {
                    for ch in &args[1..] {
                        reply.extend(
                            format!("*3\r\n$9\r\nsubscribe\r\n${}\r\n{ch}\r\n:1\r\n", ch.len())
                                .into_bytes(),
                        );
                        reply.extend(
                            format!(
                                "*3\r\n$7\r\nmessage\r\n${}\r\n{ch}\r\n${}\r\n",
                                ch.len(),
                                message.len()
                            )
                            .into_bytes(),
                        );
                        reply.extend_from_slice(message);
                        reply.extend_from_slice(b"\r\n");
                    }
                }
                "UNSUBSCRIBE" => reply.extend_from_slice(b"*3\r\n$11\r\nunsubscribe\r\n$-1\r\n:0\r\n"),
                "PUNSUBSCRIBE" => reply.extend_from_slice(b"*3\r\n$12\r\npunsubscribe\r\n$-1\r\n:0\r\n"),
                _ => reply.extend_from_slice(b"+OK\r\n"),
            }
            if out.write_all(&reply).is_err() {
                return;
            }
        }
    }

    fn read_command(reader: &mut impl std::io::BufRead) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).ok()?;
            buf.truncate(len);
            args.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Some(args)
    }

    #[test]
    fn test_subscribe_is_active_when_it_returns() {
        static STOP: AtomicBool = AtomicBool::new(false);

        let (port, log) = fake_broker(b"hello");
        let (tx, rx) = mpsc::channel();
        let handle = subscribe(
            &settings(format!("redis://127.0.0.1:{port}")),
            vec!["trigger/thumbnail".to_string()],
            &STOP,
            move |d| {
                let _ = tx.send(d);
            },
        )
        .unwrap();

        // The broker saw SUBSCRIBE before the caller got control back.
        assert!(log.lock().unwrap().iter().any(|c| c == "SUBSCRIBE"));

        let delivery = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivery.topic, "trigger/thumbnail");
        assert_eq!(delivery.payload, b"hello".to_vec());

        STOP.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
