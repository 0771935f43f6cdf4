//! Client and server exchanging frames over the in-process substrate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reactivesocket_aeron::prelude::*;
use reactivesocket_aeron::substrate::{FragmentHeader, udp_channel};
use reactivesocket_aeron::transport::{EstablishRequest, EstablishResponse, decode, encode};
use tokio::sync::mpsc;

#[derive(Default)]
struct EchoHandler {
    connections: Mutex<Vec<Arc<DuplexConnection>>>,
    failures: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ConnectionHandler for EchoHandler {
    fn on_connection(&self, connection: Arc<DuplexConnection>) {
        let reply = Arc::downgrade(&connection);
        connection
            .register(move |frame: &[u8]| {
                if let Some(connection) = reply.upgrade() {
                    let _ = connection.send(frame);
                }
            })
            .unwrap();
        self.connections.lock().push(connection);
    }

    fn on_handshake_failed(&self, _: SessionId, _: &HandshakeError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _: SessionId) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Channel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closes: Arc<AtomicUsize>,
}

impl FrameConsumer for Channel {
    fn on_frame(&self, frame: &[u8]) {
        let _ = self.tx.send(frame.to_vec());
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    driver: MemoryDriver,
    handler: Arc<EchoHandler>,
    server: TransportServer,
    client: TransportClient,
    peer: SocketAddr,
}

fn fixture(base_port: u16, server: ServerConfigBuilder) -> Fixture {
    let driver = MemoryDriver::with_mtu(64);
    let peer: SocketAddr = format!("127.0.0.1:{base_port}").parse().unwrap();
    let handler = Arc::new(EchoHandler::default());
    let server = TransportServer::bind(
        Arc::new(driver.clone()),
        server.listen_addr(peer).build(),
        handler.clone(),
    )
    .unwrap();

    let client_config = ClientConfigBuilder::new()
        .response_addr(format!("127.0.0.1:{}", base_port + 1).parse().unwrap())
        .establish_retry(10, Duration::from_millis(20))
        .connect_timeout(Duration::from_secs(5))
        .build();
    let client = TransportClient::new(Arc::new(driver.clone()), client_config).unwrap();

    Fixture {
        driver,
        handler,
        server,
        client,
        peer,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_echo_requests() {
    let f = fixture(40100, ServerConfigBuilder::new());
    let connection = f.client.connect(f.peer).await.unwrap();
    assert!(connection.is_open());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    connection
        .register(Channel {
            tx,
            closes: closes.clone(),
        })
        .unwrap();

    // Sizes cross the 64-byte MTU so replies arrive fragmented.
    let requests: Vec<Vec<u8>> = (0..130u32)
        .map(|i| {
            let mut request = format!("request-{i}:").into_bytes();
            request.resize(request.len() + (i as usize % 7) * 40, b'x');
            request
        })
        .collect();
    for request in &requests {
        connection.send(request).unwrap();
    }

    for expected in &requests {
        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, expected);
    }

    assert_eq!(f.server.connection_count(), 1);
    assert_eq!(f.handler.connections.lock().len(), 1);

    // Connecting again reuses the open connection.
    let again = f.client.connect(f.peer).await.unwrap();
    assert!(Arc::ptr_eq(&connection, &again));

    assert!(f.client.close(f.peer));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| f.server.connection_count() == 0).await);
    assert_eq!(f.handler.disconnects.load(Ordering::SeqCst), 1);

    f.client.shutdown();
    f.server.shutdown();
}

#[tokio::test]
async fn test_image_loss_closes_both_ends() {
    let f = fixture(40110, ServerConfigBuilder::new());
    let connection = f.client.connect(f.peer).await.unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    connection
        .register(Channel {
            tx,
            closes: closes.clone(),
        })
        .unwrap();

    let client_session = connection.local_session().unwrap();
    assert!(f.driver.close_image(client_session));

    assert!(wait_until(|| f.server.connection_count() == 0).await);
    assert!(wait_until(|| f.client.connection_count() == 0).await);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        connection.send(b"late"),
        Err(ConnectionError::NotConnected)
    ));
    assert_eq!(f.handler.disconnects.load(Ordering::SeqCst), 1);

    f.client.shutdown();
    f.server.shutdown();
}

#[tokio::test]
async fn test_handshake_failure_then_recovery() {
    let server = ServerConfigBuilder::new()
        .ack_retry(3, Duration::from_millis(1))
        .offer_retries(2);
    let f = fixture(40120, server);

    // Enough backpressure to exhaust every acknowledgement attempt once.
    f.driver.inject_offer_failures(
        f.client.response_channel(),
        f.client.config().client_stream_id,
        OfferError::BackPressured,
        6,
    );

    let connection = f.client.connect(f.peer).await.unwrap();
    assert!(connection.is_open());
    assert_eq!(f.handler.failures.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| f.server.connection_count() == 1).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    connection
        .register(Channel {
            tx,
            closes: Arc::new(AtomicUsize::new(0)),
        })
        .unwrap();
    connection.send(b"after recovery").unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"after recovery");

    f.client.shutdown();
    f.server.shutdown();
}

struct Ignore;

impl ImageListener for Ignore {
    fn on_available_image(&self, _: &ImageInfo) {}
    fn on_unavailable_image(&self, _: &ImageInfo) {}
}

#[tokio::test]
async fn test_repeated_establish_is_idempotent() {
    let driver = MemoryDriver::new();
    let handler = Arc::new(EchoHandler::default());
    let listen: SocketAddr = "127.0.0.1:40130".parse().unwrap();
    let server = TransportServer::bind(
        Arc::new(driver.clone()),
        ServerConfigBuilder::new().listen_addr(listen).build(),
        handler.clone(),
    )
    .unwrap();

    let response = udp_channel("127.0.0.1:40131".parse().unwrap());
    let acks = driver
        .add_subscription(&response, CLIENT_STREAM_ID, Arc::new(Ignore))
        .unwrap();
    let publication = driver
        .add_publication(server.listen_channel(), SERVER_STREAM_ID)
        .unwrap();

    let request = EstablishRequest::new(response.clone()).encode();
    for sequence in 0..3 {
        let bytes = encode(MessageKind::EstablishConnection, sequence, &request);
        publication.offer(&bytes).unwrap();
    }

    let mut acked = Vec::new();
    let mut sources = Vec::new();
    let received = wait_until(|| {
        acks.poll(
            &mut |fragment: &[u8], header: &FragmentHeader| {
                let envelope = decode(fragment).unwrap();
                assert_eq!(envelope.kind, MessageKind::EstablishConnectionResponse);
                acked.push(EstablishResponse::decode(envelope.payload).unwrap().session_id);
                sources.push(header.session_id);
            },
            16,
        )
        .unwrap();
        acked.len() >= 3
    })
    .await;

    assert!(received);
    assert!(acked.iter().all(|&s| s == publication.session_id()));
    assert!(sources.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(handler.connections.lock().len(), 1);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(
        server.registry().state(publication.session_id()),
        Some(HandshakeState::Established)
    );

    server.shutdown();
}

fn bind_echo(driver: &MemoryDriver, listen: SocketAddr) -> (TransportServer, Arc<EchoHandler>) {
    let handler = Arc::new(EchoHandler::default());
    let server = TransportServer::bind(
        Arc::new(driver.clone()),
        ServerConfigBuilder::new().listen_addr(listen).build(),
        handler.clone(),
    )
    .unwrap();
    (server, handler)
}

async fn echo_once(connection: &DuplexConnection, request: &[u8]) -> Vec<u8> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = connection
        .register(Channel {
            tx,
            closes: Arc::new(AtomicUsize::new(0)),
        })
        .unwrap();
    connection.send(request).unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    connection.unregister(&handle);
    reply
}

#[tokio::test]
async fn test_connections_to_distinct_peers() {
    let driver = MemoryDriver::new();
    let a: SocketAddr = "127.0.0.1:40140".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:40141".parse().unwrap();
    let (server_a, _) = bind_echo(&driver, a);
    let (server_b, _) = bind_echo(&driver, b);

    let client = TransportClient::new(
        Arc::new(driver.clone()),
        ClientConfigBuilder::new()
            .response_addr("127.0.0.1:40142".parse().unwrap())
            .establish_retry(10, Duration::from_millis(20))
            .connect_timeout(Duration::from_secs(5))
            .build(),
    )
    .unwrap();

    let (to_a, to_b) = tokio::join!(client.connect(a), client.connect(b));
    let (to_a, to_b) = (to_a.unwrap(), to_b.unwrap());
    assert!(!Arc::ptr_eq(&to_a, &to_b));
    assert_eq!(client.connection_count(), 2);

    assert_eq!(echo_once(&to_a, b"A:x").await, b"A:x");
    assert_eq!(echo_once(&to_b, b"B:y").await, b"B:y");

    assert!(client.close(a));
    assert_eq!(to_a.state(), ConnectionState::Closed);
    assert!(to_b.is_open());
    assert_eq!(client.connection_count(), 1);
    assert!(client.connection(a).is_none());
    assert!(Arc::ptr_eq(&client.connection(b).unwrap(), &to_b));
    assert_eq!(echo_once(&to_b, b"B:z").await, b"B:z");
    assert!(wait_until(|| server_a.connection_count() == 0).await);
    assert_eq!(server_b.connection_count(), 1);

    client.shutdown();
    server_a.shutdown();
    server_b.shutdown();
}
