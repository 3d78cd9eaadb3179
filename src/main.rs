//! tidewire - loopback demo
//!
//! Runs a server and a client endpoint over TCP on localhost and exchanges a
//! small and a chunked request.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidewire_protocol::Packet;
use tidewire_session::{Config, ConnectionKey, Endpoint, SessionError, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const ECHO: u16 = 1;
const MAX_PAYLOAD: usize = 16 * 1024;

/// Queues frames to per-connection writer tasks.
#[derive(Default)]
struct TcpTransport {
    writers: Mutex<HashMap<ConnectionKey, mpsc::UnboundedSender<Bytes>>>,
}

impl Transport for TcpTransport {
    fn send_frame(&self, conn: ConnectionKey, frame: Bytes) -> Result<(), SessionError> {
        let writers = self.writers.lock();
        let tx = writers
            .get(&conn)
            .ok_or(SessionError::ConnectionClosed(conn))?;
        tx.send(frame).map_err(|_| SessionError::ConnectionClosed(conn))
    }

    fn max_payload_size(&self, _conn: ConnectionKey) -> usize {
        MAX_PAYLOAD
    }
}

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Pumps one socket through `endpoint` until either side closes.
fn serve(
    stream: TcpStream,
    endpoint: Arc<Endpoint>,
    transport: Arc<TcpTransport>,
) -> ConnectionKey {
    let conn = ConnectionKey(NEXT_CONN.fetch_add(1, Ordering::Relaxed));
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    transport.writers.lock().insert(conn, tx);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                tracing::warn!("write to {} failed: {}", conn, e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = endpoint.deliver_bytes(conn, &buf[..n]) {
                        tracing::warn!("receive on {} failed: {}", conn, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("read from {} failed: {}", conn, e);
                    break;
                }
            }
        }
        transport.writers.lock().remove(&conn);
        endpoint.on_disconnect(conn);
        tracing::debug!("{} closed", conn);
    });

    conn
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TIDEWIRE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            if std::env::var("TIDEWIRE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting tidewire loopback demo");
    tracing::info!("  Compression: {:?}", config.codec.compression);
    tracing::info!("  Request timeout: {:?}", config.requests.timeout());
    tracing::info!("  Reassembly idle timeout: {:?}", config.reassembly.idle_timeout());

    let server_transport = Arc::new(TcpTransport::default());
    let server = Arc::new(Endpoint::new(config.clone(), server_transport.clone())?);
    let server_sweeper = server.start_sweeper();

    let weak = Arc::downgrade(&server);
    server.dispatcher().register(
        ECHO,
        Arc::new(move |conn: ConnectionKey, packet: &Packet| {
            let Some(server) = weak.upgrade() else {
                return;
            };
            if let Err(e) = server.respond(conn, packet, packet.payload()) {
                tracing::warn!("echo reply to {} failed: {}", conn, e);
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tracing::info!("  Listening on {}", addr);
    {
        let server = Arc::clone(&server);
        let transport = Arc::clone(&server_transport);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn = serve(stream, Arc::clone(&server), Arc::clone(&transport));
                        tracing::info!("Accepted {} as {}", peer, conn);
                    }
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    let client_transport = Arc::new(TcpTransport::default());
    let client = Arc::new(Endpoint::new(config, client_transport.clone())?);
    let stream = TcpStream::connect(addr).await?;
    let conn = serve(stream, Arc::clone(&client), client_transport);

    let small = client
        .request_default(conn, ECHO, b"hello tidewire")?
        .wait()
        .await
        .into_response()
        .ok_or("small echo got no response")?;
    tracing::info!("Small echo: {:?}", String::from_utf8_lossy(small.payload()));
    drop(small);

    let large: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
    let echoed = client
        .request_default(conn, ECHO, &large)?
        .wait()
        .await
        .into_response()
        .ok_or("large echo got no response")?;
    if echoed.payload() != &large[..] {
        return Err("large echo mismatch".into());
    }
    tracing::info!("Large echo: {} bytes intact", echoed.len());
    drop(echoed);

    let stats = client.stats();
    tracing::info!(
        "Client: {} frames sent, {} packets received, {} requests completed",
        stats.frames_sent,
        stats.packets_received,
        stats.requests.completed
    );
    let stats = server.stats();
    tracing::info!(
        "Server: {} frames sent, {} packets received, {} messages reassembled",
        stats.frames_sent,
        stats.packets_received,
        stats.reassembly.completed
    );

    if let Some(sweeper) = server_sweeper {
        sweeper.stop().await;
    }
    tracing::info!("Done");
    Ok(())
}
