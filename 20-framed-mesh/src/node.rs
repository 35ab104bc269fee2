//! A node ties the transport pieces to an evaluator.
//!
//! Every connection, accepted or dialed, reports into one event loop. The
//! loop evaluates each inbound payload and routes the result according to
//! the node's [`Routing`]. Local input enters through a [`NodeHandle`], which
//! is cheap to clone and safe to use from any thread.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use clap::ValueEnum;
use tokio::{
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    acceptor::Acceptor,
    connection::{Connection, ConnectionEvent, ConnectionId, ConnectionOptions},
    connector::{Backoff, Connector},
    endpoint::Endpoint,
    error::{CloseReason, EvalError, SubmitError, TransportError},
    evaluator::{Evaluator, NetworkSink},
    registry::{DEFAULT_HISTORY_CAPACITY, Registry},
};

const NOTIFICATION_CAPACITY: usize = 256;

/// Which sockets a node owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listens and broadcasts to everyone who connects.
    Server { listen: Endpoint },
    /// Dials a single upstream peer.
    Client { remote: Endpoint },
    /// Listens and dials an upstream peer.
    Peer { listen: Endpoint, remote: Endpoint },
}

impl Role {
    pub fn listen(&self) -> Option<Endpoint> {
        match *self {
            Role::Server { listen } | Role::Peer { listen, .. } => Some(listen),
            Role::Client { .. } => None,
        }
    }

    pub fn remote(&self) -> Option<Endpoint> {
        match *self {
            Role::Client { remote } | Role::Peer { remote, .. } => Some(remote),
            Role::Server { .. } => None,
        }
    }

    pub fn default_routing(&self) -> Routing {
        match self {
            Role::Server { .. } | Role::Peer { .. } => Routing::Broadcast,
            Role::Client { .. } => Routing::Reply,
        }
    }
}

/// Where the result of evaluating a network payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Routing {
    /// Delivered to the whole group and recorded in history.
    Broadcast,
    /// Written back to the connection the payload came from.
    Reply,
    /// Kept local; only subscribers see it.
    Local,
}

/// What to do when evaluating a network payload fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ErrorPolicy {
    /// Route `error: <message>` as if it were the result.
    #[default]
    Reply,
    /// Log the failure and send nothing.
    Drop,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub history_capacity: usize,
    pub connection: ConnectionOptions,
    pub backoff: Backoff,
    /// Overrides the role's default routing.
    pub routing: Option<Routing>,
    pub on_eval_error: ErrorPolicy,
}

impl NodeConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            connection: ConnectionOptions::default(),
            backoff: Backoff::default(),
            routing: None,
            on_eval_error: ErrorPolicy::default(),
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn routing(&self) -> Routing {
        self.routing.unwrap_or_else(|| self.role.default_routing())
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Accepted,
    Dialed,
}

/// What subscribers observe about a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected {
        id: ConnectionId,
        peer: SocketAddr,
        origin: Origin,
    },
    /// A payload arrived and was evaluated.
    Received {
        id: ConnectionId,
        payload: Bytes,
        result: Result<String, EvalError>,
    },
    Disconnected {
        id: ConnectionId,
        peer: SocketAddr,
        reason: CloseReason,
    },
}

pub struct Node {
    shared: Arc<Shared>,
    acceptor: Option<Acceptor>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Node {
    /// Binds the listening socket, if the role has one. Nothing is accepted
    /// or dialed until [`Node::run_until`] is polled.
    pub async fn start<E>(config: NodeConfig, evaluator: E) -> Result<Self, TransportError>
    where
        E: Evaluator,
    {
        let acceptor = match config.role.listen() {
            Some(endpoint) => Some(Acceptor::bind(endpoint).await?),
            None => None,
        };
        let local_addr = acceptor.as_ref().map(Acceptor::local_addr).transpose()?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Arc::new(Shared {
            registry: Registry::new(config.history_capacity)
                .with_max_frame_len(config.connection.max_frame_len),
            config,
            evaluator: Box::new(evaluator),
            local_addr,
            upstream: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events_tx,
            notifications,
        });

        Ok(Self {
            shared,
            acceptor,
            events,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Address the acceptor is bound to. `None` for client nodes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Accepts, dials and processes traffic until `shutdown` resolves, then
    /// closes every connection.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Node {
            shared,
            acceptor,
            mut events,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        // Sockets are admitted by this loop, so a connection is in the
        // registry before any of its messages are handled.
        let (admit_tx, mut admissions) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        if let Some(acceptor) = acceptor {
            let admit_tx = admit_tx.clone();
            let stop = stopped(stop_rx.clone());
            tasks.spawn(acceptor.run_until(stop, move |stream, peer| {
                debug!(%peer, "accepted connection");
                let _ = admit_tx.send((stream, Origin::Accepted));
            }));
        }

        if let Some(remote) = shared.config.role.remote() {
            let connector = Connector::new(remote).with_backoff(shared.config.backoff);
            let stop = stopped(stop_rx.clone());
            tasks.spawn(async move {
                select! {
                    _ = stop => {}
                    dialed = connector.dial() => match dialed {
                        Ok(stream) => {
                            let _ = admit_tx.send((stream, Origin::Dialed));
                        }
                        Err(err) => warn!(error = %err, "giving up on upstream"),
                    },
                }
            });
        }

        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => break,
                Some((stream, origin)) = admissions.recv() => shared.admit(stream, origin),
                event = events.recv() => match event {
                    Some(event) => shared.handle_event(event),
                    None => break,
                },
            }
        }

        info!("node shutting down");
        stop_tx.send_replace(true);
        shared.registry.close_all();
        while tasks.join_next().await.is_some() {}
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

struct Shared {
    config: NodeConfig,
    evaluator: Box<dyn Evaluator>,
    local_addr: Option<SocketAddr>,
    registry: Registry,
    upstream: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    notifications: broadcast::Sender<NodeEvent>,
}

impl Shared {
    fn admit(&self, stream: TcpStream, origin: Origin) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let options = self.config.connection;
        let connection = match Connection::spawn(id, stream, options, self.events_tx.clone()) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = ?err, "failed to set up connection");
                return;
            }
        };
        let peer = connection.peer_addr();

        if origin == Origin::Dialed {
            *self.upstream() = Some(connection.clone());
        }
        let replayed = self.registry.join(connection);
        info!(id, %peer, ?origin, replayed, "peer connected");
        self.notify(NodeEvent::Connected { id, peer, origin });
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { id, payload } => self.on_message(id, payload),
            ConnectionEvent::Closed { id, peer, reason } => self.on_closed(id, peer, reason),
        }
    }

    fn on_message(&self, id: ConnectionId, payload: Bytes) {
        let result = match std::str::from_utf8(&payload) {
            Ok(input) => self.evaluator.evaluate(input, self),
            Err(_) => Err(EvalError::new("payload is not valid UTF-8")),
        };
        debug!(id, len = payload.len(), ok = result.is_ok(), "evaluated payload");
        self.notify(NodeEvent::Received {
            id,
            payload,
            result: result.clone(),
        });

        let output = match result {
            Ok(output) => output,
            Err(err) => match self.config.on_eval_error {
                ErrorPolicy::Reply => format!("error: {err}"),
                ErrorPolicy::Drop => {
                    warn!(id, error = %err, "dropping failed evaluation");
                    return;
                }
            },
        };

        let routed = match self.config.routing() {
            Routing::Broadcast => self
                .registry
                .deliver(&output)
                .map(|_| ())
                .map_err(TransportError::from),
            Routing::Reply => match self.registry.get(id) {
                Some(connection) => connection.write(&output),
                None => Err(TransportError::Closed),
            },
            Routing::Local => Ok(()),
        };
        if let Err(err) = routed {
            debug!(id, error = %err, "result not routed");
        }
    }

    /// Runs once per connection, whether or not a delivery already pruned
    /// it from the group.
    fn on_closed(&self, id: ConnectionId, peer: SocketAddr, reason: CloseReason) {
        self.registry.leave(id);
        {
            let mut upstream = self.upstream();
            if upstream.as_ref().is_some_and(|up| up.id() == id) {
                *upstream = None;
            }
        }
        info!(id, %peer, %reason, "peer disconnected");
        self.notify(NodeEvent::Disconnected { id, peer, reason });
    }

    fn notify(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.notifications.send(event);
    }

    fn upstream(&self) -> MutexGuard<'_, Option<Connection>> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkSink for Shared {
    fn write(&self, text: &str) -> Result<(), TransportError> {
        let upstream = self.upstream().clone();
        match upstream {
            Some(connection) => connection.write(text),
            None => Err(TransportError::NotConnected),
        }
    }

    fn broadcast(&self, text: &str) -> Result<usize, TransportError> {
        Ok(self.registry.deliver(text)?)
    }
}

/// Thread-safe entry point into a node for local input and observation.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
}

impl NodeHandle {
    /// Evaluates `input` with this node as the sink, without routing the
    /// result anywhere.
    pub fn evaluate(&self, input: &str) -> Result<String, EvalError> {
        self.shared.evaluator.evaluate(input, self.shared.as_ref())
    }

    /// Evaluates `input` and sends the result the way operator input goes:
    /// upstream on a client, to the whole group otherwise. A failed
    /// evaluation sends nothing.
    pub fn submit(&self, input: &str) -> Result<String, SubmitError> {
        let output = self.evaluate(input)?;
        match self.shared.config.role {
            Role::Client { .. } => self.write(&output)?,
            Role::Server { .. } | Role::Peer { .. } => {
                self.deliver(&output)?;
            }
        }
        Ok(output)
    }

    /// Broadcasts a raw payload to the group. Returns the number of members
    /// it was queued on.
    pub fn deliver(&self, payload: &str) -> Result<usize, TransportError> {
        self.shared.broadcast(payload)
    }

    /// Writes a raw payload to the upstream peer.
    pub fn write(&self, payload: &str) -> Result<(), TransportError> {
        self.shared.write(payload)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.notifications.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn history(&self) -> Vec<Bytes> {
        self.shared.registry.history()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn role(&self) -> Role {
        self.shared.config.role
    }
}

impl NetworkSink for NodeHandle {
    fn write(&self, text: &str) -> Result<(), TransportError> {
        self.shared.write(text)
    }

    fn broadcast(&self, text: &str) -> Result<usize, TransportError> {
        self.shared.broadcast(text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::timeout};

    use super::*;
    use crate::{
        evaluator::{Calculator, Echo},
        frame::{DEFAULT_MAX_FRAME_LEN, Frame, read_frame, write_frame},
    };

    fn loopback() -> Endpoint {
        "127.0.0.1:0".parse().expect("endpoint")
    }

    struct Running {
        handle: NodeHandle,
        addr: Option<SocketAddr>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    }

    impl Running {
        async fn stop(self) {
            let _ = self.stop.send(());
            timeout(Duration::from_secs(2), self.task)
                .await
                .expect("node stops before timeout")
                .expect("node task");
        }
    }

    async fn run(config: NodeConfig, evaluator: impl Evaluator) -> Running {
        let node = Node::start(config, evaluator).await.expect("start node");
        let handle = node.handle();
        let addr = node.local_addr();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(node.run_until(async move {
            let _ = stop_rx.await;
        }));
        Running {
            handle,
            addr,
            stop,
            task,
        }
    }

    async fn next_payload(stream: &mut TcpStream) -> Bytes {
        timeout(Duration::from_secs(2), read_frame(stream, DEFAULT_MAX_FRAME_LEN))
            .await
            .expect("frame before timeout")
            .expect("read frame")
            .expect("frame")
            .payload()
    }

    async fn send(stream: &mut TcpStream, payload: &str) {
        let frame = Frame::encode(payload.as_bytes()).expect("encode");
        write_frame(stream, &frame).await.expect("write frame");
    }

    async fn next_event(events: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event before timeout")
            .expect("event")
    }

    async fn connected(events: &mut broadcast::Receiver<NodeEvent>) -> ConnectionId {
        match next_event(events).await {
            NodeEvent::Connected { id, .. } => id,
            other => panic!("expected a connection, got {other:?}"),
        }
    }

    #[test]
    fn routing_defaults_follow_the_role() {
        let server = NodeConfig::new(Role::Server { listen: loopback() });
        let client = NodeConfig::new(Role::Client { remote: loopback() });
        assert_eq!(server.routing(), Routing::Broadcast);
        assert_eq!(client.routing(), Routing::Reply);
        assert_eq!(client.with_routing(Routing::Local).routing(), Routing::Local);
    }

    #[tokio::test]
    async fn server_broadcasts_evaluated_results() {
        let node = run(NodeConfig::new(Role::Server { listen: loopback() }), Calculator).await;
        let addr = node.addr.expect("server addr");
        let mut events = node.handle.subscribe();

        let mut one = TcpStream::connect(addr).await.expect("dial one");
        connected(&mut events).await;
        let mut two = TcpStream::connect(addr).await.expect("dial two");
        connected(&mut events).await;

        send(&mut one, "(+ 1 2)").await;
        assert_eq!(next_payload(&mut one).await, "3");
        assert_eq!(next_payload(&mut two).await, "3");
        assert_eq!(node.handle.history(), vec!["3"]);

        node.stop().await;
    }

    #[tokio::test]
    async fn failed_evaluation_replies_with_the_error() {
        let config =
            NodeConfig::new(Role::Server { listen: loopback() }).with_routing(Routing::Reply);
        let node = run(config, Calculator).await;
        let mut events = node.handle.subscribe();

        let mut stream = TcpStream::connect(node.addr.expect("addr")).await.expect("dial");
        connected(&mut events).await;

        send(&mut stream, "(/ 1 0)").await;
        assert_eq!(next_payload(&mut stream).await, "error: division by zero");
        assert!(node.handle.history().is_empty());

        node.stop().await;
    }

    #[tokio::test]
    async fn dropped_errors_send_nothing() {
        let mut config =
            NodeConfig::new(Role::Server { listen: loopback() }).with_routing(Routing::Reply);
        config.on_eval_error = ErrorPolicy::Drop;
        let node = run(config, Calculator).await;
        let mut events = node.handle.subscribe();

        let mut stream = TcpStream::connect(node.addr.expect("addr")).await.expect("dial");
        connected(&mut events).await;

        send(&mut stream, "(oops)").await;
        send(&mut stream, "(+ 2 2)").await;
        assert_eq!(next_payload(&mut stream).await, "4");

        node.stop().await;
    }

    #[tokio::test]
    async fn non_utf8_payloads_are_evaluation_errors() {
        let node = run(NodeConfig::new(Role::Server { listen: loopback() }), Echo).await;
        let mut events = node.handle.subscribe();

        let mut stream = TcpStream::connect(node.addr.expect("addr")).await.expect("dial");
        let id = connected(&mut events).await;

        let frame = Frame::encode(&[0xff, 0xfe]).expect("encode");
        write_frame(&mut stream, &frame).await.expect("write");

        match next_event(&mut events).await {
            NodeEvent::Received {
                id: from, result, ..
            } => {
                assert_eq!(from, id);
                assert!(result.is_err());
            }
            other => panic!("expected a received payload, got {other:?}"),
        }

        node.stop().await;
    }

    #[tokio::test]
    async fn disconnects_are_reported_once_and_leave_the_group() {
        let node = run(NodeConfig::new(Role::Server { listen: loopback() }), Echo).await;
        let mut events = node.handle.subscribe();

        let stream = TcpStream::connect(node.addr.expect("addr")).await.expect("dial");
        let id = connected(&mut events).await;
        assert_eq!(node.handle.connection_count(), 1);

        drop(stream);
        match next_event(&mut events).await {
            NodeEvent::Disconnected { id: gone, reason, .. } => {
                assert_eq!(gone, id);
                assert_eq!(reason, CloseReason::PeerClosed);
            }
            other => panic!("expected a disconnect, got {other:?}"),
        }
        assert_eq!(node.handle.connection_count(), 0);

        node.stop().await;
    }

    #[tokio::test]
    async fn client_without_upstream_cannot_write() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let remote: Endpoint = listener.local_addr().expect("addr").into();
        drop(listener);

        let mut config = NodeConfig::new(Role::Client { remote });
        config.backoff = Backoff::immediate().with_max_attempts(1);
        let node = run(config, Echo).await;

        assert!(node.handle.local_addr().is_none());
        assert!(matches!(
            node.handle.submit("hello"),
            Err(SubmitError::Transport(TransportError::NotConnected))
        ));
        assert!(matches!(node.handle.submit("(+"), Err(SubmitError::Eval(_))));

        node.stop().await;
    }

    #[tokio::test]
    async fn evaluate_does_not_route() {
        let node = run(NodeConfig::new(Role::Server { listen: loopback() }), Calculator).await;
        assert_eq!(node.handle.evaluate("(* 6 7)"), Ok("42".to_string()));
        assert!(node.handle.history().is_empty());
        node.stop().await;
    }
}
