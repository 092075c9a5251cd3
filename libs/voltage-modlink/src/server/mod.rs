//! Responder side: serve decoded requests from a handler
//!
//! [`serve_stream`] runs one request/response loop over any byte stream (an
//! accepted TCP socket or an opened serial port). [`ModbusTcpServer`] accepts
//! TCP peers and runs one loop per peer.

mod handler;
mod proxy;
mod store;

pub use handler::{DeviceHandler, RequestHandler, WriteNotification};
pub use proxy::ProxyHandler;
pub use store::RegisterStore;

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::ModbusProtocol;
use crate::constants::READ_BUFFER_SIZE;
use crate::error::ModbusResult;

/// Answer requests arriving on `stream` until the peer closes it or `cancel` fires
///
/// Frames failing checksum or header checks are dropped without a reply, as a
/// bus device would.
pub async fn serve_stream<S>(
    mut stream: S,
    protocol: Arc<dyn ModbusProtocol>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
) -> ModbusResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut pending = BytesMut::with_capacity(protocol.max_adu_len());
    let mut chunk = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read(&mut chunk) => read?,
        };
        if n == 0 {
            debug!("Peer closed the stream");
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        if !protocol.check_request_complete(&pending) {
            if pending.len() > protocol.max_adu_len() {
                warn!(
                    "{} request exceeds {}B without completing, discarded",
                    protocol.name(),
                    protocol.max_adu_len()
                );
                pending.clear();
            }
            continue;
        }

        let frame = pending.split().freeze();
        trace!(hex_data = %hex::encode(&frame), "{} request", protocol.name());
        let (header, request) = match protocol.deserialize_request(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{} request dropped: {e}", protocol.name());
                continue;
            },
        };

        debug!(
            "{} request unit={} FC={:02X}",
            protocol.name(),
            header.unit_id,
            request.function_code()
        );
        let Some(response) = handler.handle(header.unit_id, request).await else {
            continue;
        };
        let adu = protocol.serialize_response(header, &response);
        stream.write_all(&adu).await?;
        stream.flush().await?;
    }
}

/// Modbus front end listening on a TCP port
pub struct ModbusTcpServer {
    listener: TcpListener,
    protocol: Arc<dyn ModbusProtocol>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
}

impl ModbusTcpServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        protocol: Arc<dyn ModbusProtocol>,
        handler: Arc<dyn RequestHandler>,
    ) -> ModbusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            protocol,
            handler,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and every peer
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> ModbusResult<()> {
        info!(
            "{} server listening on {}",
            self.protocol.name(),
            self.local_addr()?
        );
        let mut peers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(_) = peers.join_next(), if !peers.is_empty() => {},
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        },
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("{peer}: set_nodelay: {e}");
                    }
                    info!("Peer connected: {peer}");

                    let protocol = self.protocol.clone();
                    let handler = self.handler.clone();
                    let cancel = self.cancel.child_token();
                    peers.spawn(async move {
                        if let Err(e) = serve_stream(stream, protocol, handler, cancel).await {
                            warn!("{peer}: {e}");
                        }
                        info!("Peer disconnected: {peer}");
                    });
                },
            }
        }

        peers.shutdown().await;
        info!("{} server stopped", self.protocol.name());
        Ok(())
    }
}
