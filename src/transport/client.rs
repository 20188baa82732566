use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::{self, Duration};
use tokio_rustls::TlsConnector;

use crate::buffer::BufferPool;
use crate::codec::FrameCodec;
use crate::service::{EngineConfig, WireError, WireResult};
use crate::session::{
    BoxedReader, BoxedWriter, Handler, IoDirection, Session, SessionParts, SessionRegistry,
};
use crate::transport::tls;

/// A TCP dialer producing [`Session`]s with the same pipeline as the server
/// side. Holds its own registry and buffer pool.
pub struct Client {
    config: EngineConfig,
    handler: Arc<dyn Handler>,
    codec: Option<Arc<dyn FrameCodec>>,
    pool: BufferPool,
    registry: Arc<SessionRegistry>,
    tls: Mutex<Option<(TlsConnector, String)>>,
}

impl Client {
    pub fn new(
        config: EngineConfig,
        handler: Arc<dyn Handler>,
        codec: Option<Arc<dyn FrameCodec>>,
    ) -> Client {
        let pool = BufferPool::new(&config.buffer_pool);
        Client {
            config,
            handler,
            codec,
            pool,
            registry: SessionRegistry::new(),
            tls: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// The dialer's most recent surviving session, for the common
    /// single-connection case.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.registry.first_session()
    }

    /// Verify the server against the given PEM CA bundle and present
    /// `server_name` during the handshake.
    pub fn enable_secure_transport(&self, ca: &Path, server_name: &str) -> WireResult<()> {
        *self.tls.lock() = Some((tls::connector(ca)?, server_name.to_string()));
        Ok(())
    }

    /// Dial `host:port` and open a session on the connection.
    ///
    /// With a configured connect timeout, an attempt that overruns it is
    /// aborted mid-handshake and reported to the handler as a connect error
    /// with code 0. Other connect failures are reported with the platform
    /// code before the error is returned.
    pub async fn connect(&self, host: &str, port: u16) -> WireResult<Arc<Session>> {
        let session = Session::new(SessionParts {
            handler: self.handler.clone(),
            codec: self.codec.clone(),
            pool: self.pool.clone(),
            registry: Some(self.registry.clone()),
            config: self.config.session.clone(),
            read_buffer_size: self.config.network.read_buffer_size,
        });

        let tls = self.tls.lock().clone();
        let timeout_ms = self.config.network.connect_timeout_ms;
        let host = host.to_string();

        let attempt = async move {
            let socket = TcpStream::connect((host.as_str(), port)).await?;
            let local_addr = socket.local_addr().ok();
            let peer_addr = socket.peer_addr().ok();
            match tls {
                Some((connector, server_name)) => {
                    let name = ServerName::try_from(server_name.clone()).map_err(|_| {
                        WireError::Tls(format!("invalid server name: {}", server_name))
                    })?;
                    let stream = connector.connect(name, socket).await?;
                    let (reader, writer) = tokio::io::split(stream);
                    Ok::<(BoxedReader, BoxedWriter, _, _), WireError>((
                        Box::new(reader),
                        Box::new(writer),
                        local_addr,
                        peer_addr,
                    ))
                }
                None => {
                    let (reader, writer) = socket.into_split();
                    Ok::<(BoxedReader, BoxedWriter, _, _), WireError>((
                        Box::new(reader),
                        Box::new(writer),
                        local_addr,
                        peer_addr,
                    ))
                }
            }
        };

        let outcome = if timeout_ms > 0 {
            match time::timeout(Duration::from_millis(timeout_ms), attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // code 0 marks a connect timeout
                    session
                        .emit_error(IoDirection::Connect, 0, "connect attempt timed out")
                        .await;
                    return Err(WireError::ConnectTimeout);
                }
            }
        } else {
            attempt.await
        };

        match outcome {
            Ok((reader, writer, local_addr, peer_addr)) => {
                session.open(reader, writer, local_addr, peer_addr).await;
                Ok(session)
            }
            Err(err) => {
                let code = match &err {
                    WireError::Io(io_err) => io_err.raw_os_error().unwrap_or(-1),
                    _ => -1,
                };
                session
                    .emit_error(IoDirection::Connect, code, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// Close every session this dialer opened.
    pub async fn disconnect(&self) {
        for session in self.registry.sessions() {
            session.close(true).await;
        }
    }
}
