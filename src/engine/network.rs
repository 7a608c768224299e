use anyhow::{anyhow, Result};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::replication::Envelope;
use crate::engine::EngineEvent;

pub const ALPN: &[u8] = b"blastgrid/replication/0";

/// Largest frame accepted from the wire. A full 13x13 snapshot is a few KiB.
const MAX_FRAME_LEN: usize = 1 << 20;

pub struct NetworkManager {
    pub endpoint: Endpoint,
}

impl NetworkManager {
    pub async fn new() -> Result<Self> {
        // Bind to a random port and start listening for replication peers
        let endpoint = Endpoint::builder()
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await?;
        Ok(Self { endpoint })
    }

    pub fn local_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Background task to accept incoming peers. Each accepted connection gets
    /// a host-opened bidirectional stream, handed to the tick loop as a
    /// `PeerLink`; a `PeerLeft` follows once the connection closes.
    pub(crate) async fn start_accept_loop(
        endpoint: Endpoint,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Result<()> {
        while let Some(incoming) = endpoint.accept().await {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let conn = match incoming.accept() {
                    Ok(connecting) => match connecting.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "peer handshake failed");
                            return;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "refused incoming connection");
                        return;
                    }
                };
                let peer = conn.remote_id();
                // Host opens, peer accepts.
                let send = match conn.open_bi().await {
                    Ok((send, _recv)) => send,
                    Err(e) => {
                        warn!(%peer, error = %e, "could not open replication stream");
                        return;
                    }
                };
                info!(%peer, "peer connected");
                let link = PeerLink {
                    id: peer,
                    conn: conn.clone(),
                    send,
                };
                if event_tx.send(EngineEvent::PeerJoined(link)).await.is_err() {
                    return;
                }

                let reason = conn.closed().await;
                debug!(%peer, %reason, "peer connection closed");
                let _ = event_tx.send(EngineEvent::PeerLeft(peer)).await;
            });
        }
        Ok(())
    }

    /// Client: dials the host and waits for it to open the replication stream.
    pub async fn connect(&self, host: EndpointId) -> Result<(Connection, RecvStream)> {
        info!(%host, "connecting to host");
        let conn = self.endpoint.connect(host, ALPN).await?;
        let (_send, recv) = conn.accept_bi().await?;
        info!(%host, "replication stream established");
        Ok((conn, recv))
    }
}

/// Host side of one peer: the outgoing half of its replication stream.
pub struct PeerLink {
    pub id: EndpointId,
    conn: Connection,
    send: SendStream,
}

impl PeerLink {
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        write_frame(&mut self.send, envelope).await
    }

    /// Best-effort abort of the underlying QUIC connection
    pub fn close(self) {
        let _ = self.conn.close(0u32.into(), b"abort");
    }
}

/// Writes one envelope as a big-endian `u32` length followed by its postcard
/// bytes.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = envelope.to_bytes()?;
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next framed envelope. `None` means the stream ended cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Envelope::from_bytes(&buf)?))
}
