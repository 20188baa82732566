use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::codec::FrameCodec;
use crate::service::{EngineConfig, Shutdown, WireError, WireResult};
use crate::session::{Handler, Session, SessionParts, SessionRegistry};
use crate::transport::tls;

/// A TCP listener that turns accepted connections into [`Session`]s.
///
/// Accepts with exponential backoff on transient errors, bounds concurrently
/// open connections with a semaphore, and survives individual connection
/// failures. With secure transport enabled, the TLS handshake runs before the
/// session opens; the engine only ever sees the decrypted stream.
pub struct Server {
    config: EngineConfig,
    handler: Arc<dyn Handler>,
    codec: Option<Arc<dyn FrameCodec>>,
    pool: BufferPool,
    registry: Arc<SessionRegistry>,
    tls: Mutex<Option<TlsAcceptor>>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Server {
    pub fn new(
        config: EngineConfig,
        handler: Arc<dyn Handler>,
        codec: Option<Arc<dyn FrameCodec>>,
    ) -> Server {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let pool = BufferPool::new(&config.buffer_pool);
        let limit_connections = Arc::new(Semaphore::new(config.network.max_connections.max(1)));
        Server {
            config,
            handler,
            codec,
            pool,
            registry: SessionRegistry::new(),
            tls: Mutex::new(None),
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(Some(shutdown_complete_rx)),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn buffer_pool(&self) -> BufferPool {
        self.pool.clone()
    }

    /// Switch accepted connections to TLS, loading the PEM certificate chain
    /// and private key from disk.
    pub fn enable_secure_transport(&self, cert: &Path, key: &Path) -> WireResult<()> {
        *self.tls.lock() = Some(tls::acceptor(cert, key)?);
        Ok(())
    }

    /// Bind the configured address and serve until [`Server::stop`].
    pub async fn run(&self) -> WireResult<()> {
        let addr = format!("{}:{}", self.config.network.ip, self.config.network.port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> WireResult<()> {
        info!("listening on {}", listener.local_addr()?);

        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = tokio::select! {
                result = self.accept(&listener) => result?,
                _ = shutdown.recv() => {
                    debug!("listener exit accept loop after shutdown signal");
                    return Ok(());
                }
            };

            debug!("accept new connection");
            self.spawn_connection(socket, permit);
        }
    }

    /// Stop accepting, close every live session and wait for the
    /// per-connection tasks to wind down.
    pub async fn stop(&self) {
        let _ = self.notify_shutdown.send(());
        for session in self.registry.sessions() {
            session.close(true).await;
        }

        self.shutdown_complete_tx.lock().take();
        let receiver = self.shutdown_complete_rx.lock().take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
        }
    }

    fn spawn_connection(&self, socket: TcpStream, permit: OwnedSemaphorePermit) {
        let tls = self.tls.lock().clone();
        let session = Session::new(SessionParts {
            handler: self.handler.clone(),
            codec: self.codec.clone(),
            pool: self.pool.clone(),
            registry: Some(self.registry.clone()),
            config: self.config.session.clone(),
            read_buffer_size: self.config.network.read_buffer_size,
        });
        let shutdown_complete = self.shutdown_complete_tx.lock().clone();

        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete;
            let local_addr = socket.local_addr().ok();
            let peer_addr = socket.peer_addr().ok();
            // subscribe before opening so a close during on_connect is not missed
            let closed = session.subscribe_close();

            match tls {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => {
                        let (reader, writer) = tokio::io::split(stream);
                        session
                            .open(Box::new(reader), Box::new(writer), local_addr, peer_addr)
                            .await;
                    }
                    Err(err) => {
                        warn!("tls handshake failed: {}", err);
                        drop(permit);
                        return;
                    }
                },
                None => {
                    let (reader, writer) = socket.into_split();
                    session
                        .open(Box::new(reader), Box::new(writer), local_addr, peer_addr)
                        .await;
                }
            }

            // hold the connection permit until the session is gone
            let mut done = Shutdown::new(closed);
            done.recv().await;
            drop(permit);
        });
    }

    async fn accept(&self, listener: &TcpListener) -> WireResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(WireError::Accept(format!(
                            "accept tcp listener error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
