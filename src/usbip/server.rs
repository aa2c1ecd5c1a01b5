use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::protocol::*;
use super::{Direction, Urb, UrbCompletion, UrbId, UsbIpDevice, UsbIpError, MAX_TRANSFER_LEN};

type ReplyTx = mpsc::UnboundedSender<Vec<u8>>;

pub struct UsbIpServer {
    devices: Vec<Arc<dyn UsbIpDevice>>,
    next_connection: AtomicU32,
}

impl UsbIpServer {
    pub fn new(devices: Vec<Arc<dyn UsbIpDevice>>) -> Self {
        Self {
            devices,
            next_connection: AtomicU32::new(1),
        }
    }

    /// Binds the loopback interface only.
    pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
    }

    /// Accepts connections until the listener fails. Each connection runs on
    /// its own task; a failed connection never stops the listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), UsbIpError> {
        tracing::info!(addr = ?listener.local_addr()?, "USB/IP server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            if !peer.ip().is_loopback() {
                tracing::warn!(%peer, "Rejecting non-local USB/IP connection");
                continue;
            }
            tracing::info!(%peer, "USB/IP connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                match server.handle_connection(stream).await {
                    Ok(()) => tracing::info!(%peer, "USB/IP connection closed"),
                    Err(e) => tracing::warn!(%peer, "USB/IP connection aborted: {e}"),
                }
            });
        }
    }

    /// Serves one connection until the peer disconnects or a protocol error
    /// occurs. Replies go through a single writer task so each one reaches
    /// the socket whole, in completion order.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), UsbIpError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                if let Err(e) = writer.write_all(&reply).await {
                    tracing::debug!("USB/IP write error: {e}");
                    break;
                }
                tracing::trace!(len = reply.len(), "USB/IP tx");
            }
            let _ = writer.shutdown().await;
        });

        self.control_phase(connection, &mut reader, &reply_tx).await
    }

    fn find(&self, bus_id: &str) -> Option<Arc<dyn UsbIpDevice>> {
        self.devices.iter().find(|d| d.bus_id() == bus_id).cloned()
    }

    async fn control_phase<R>(
        &self,
        connection: u32,
        reader: &mut R,
        reply_tx: &ReplyTx,
    ) -> Result<(), UsbIpError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut raw = [0u8; OP_HEADER_LEN];
            if !read_or_eof(reader, &mut raw).await? {
                return Ok(());
            }
            let header = OpHeader::decode(&raw);
            tracing::debug!(
                version = format!("{:#06x}", header.version),
                command = format!("{:#06x}", header.command),
                "USB/IP control request"
            );

            match header.command {
                OP_REQ_DEVLIST => {
                    let summaries: Vec<_> = self.devices.iter().map(|d| d.summary()).collect();
                    send(reply_tx, encode_devlist(&summaries))?;
                }
                OP_REQ_IMPORT => {
                    let mut raw_bus_id = [0u8; BUS_ID_LEN];
                    reader.read_exact(&mut raw_bus_id).await?;
                    let bus_id = parse_bus_id(&raw_bus_id);
                    match self.find(&bus_id) {
                        Some(device) => {
                            tracing::info!(bus_id, connection, "Device imported");
                            let mut reply = OpHeader::reply(OP_REP_IMPORT, ST_OK).encode().to_vec();
                            reply.extend_from_slice(&device.summary().encode_header());
                            send(reply_tx, reply)?;
                            let result = self.command_phase(connection, reader, &device, reply_tx).await;
                            device.detach(connection);
                            return result;
                        }
                        None => {
                            tracing::warn!(bus_id, "Import of unknown bus id");
                            send(reply_tx, OpHeader::reply(OP_REP_IMPORT, ST_NA).encode().to_vec())?;
                        }
                    }
                }
                other => tracing::warn!(command = format!("{other:#06x}"), "Unknown control command"),
            }
        }
    }

    async fn command_phase<R>(
        &self,
        connection: u32,
        reader: &mut R,
        device: &Arc<dyn UsbIpDevice>,
        reply_tx: &ReplyTx,
    ) -> Result<(), UsbIpError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut raw_header = [0u8; MESSAGE_HEADER_LEN];
            if !read_or_eof(reader, &mut raw_header).await? {
                return Ok(());
            }
            let header = MessageHeader::decode(&raw_header);
            let mut raw_body = [0u8; MESSAGE_BODY_LEN];
            reader.read_exact(&mut raw_body).await?;

            match header.command {
                USBIP_CMD_SUBMIT => {
                    let body = SubmitBody::decode(&raw_body);
                    let direction = if header.direction == USBIP_DIR_IN {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    tracing::trace!(
                        seq = header.seq,
                        endpoint = header.endpoint,
                        ?direction,
                        len = body.transfer_len,
                        "CMD_SUBMIT"
                    );

                    let mut data = Vec::new();
                    if direction == Direction::Out && body.transfer_len > 0 {
                        if body.transfer_len > MAX_TRANSFER_LEN {
                            return Err(UsbIpError::TransferTooLarge(body.transfer_len));
                        }
                        data = vec![0u8; body.transfer_len as usize];
                        reader.read_exact(&mut data).await?;
                    }

                    let urb = Urb {
                        id: UrbId {
                            connection,
                            seq: header.seq,
                        },
                        endpoint: header.endpoint,
                        direction,
                        setup: body.setup,
                        transfer_len: body.transfer_len,
                        data,
                    };
                    let completion = UrbCompletion::new(connection, header, body.transfer_len, reply_tx.clone());
                    device.submit(urb, completion)?;
                }
                USBIP_CMD_UNLINK => {
                    let unlink_seq = decode_unlink_seq(&raw_body);
                    let victim = UrbId {
                        connection,
                        seq: unlink_seq,
                    };
                    let status = if device.unlink(victim) {
                        -ECONNRESET
                    } else {
                        -ENOENT
                    };
                    tracing::debug!(seq = header.seq, unlink_seq, status, "CMD_UNLINK");
                    send(reply_tx, encode_ret_unlink(&header, status))?;
                }
                other => return Err(UsbIpError::UnknownCommand(other)),
            }
        }
    }
}

fn send(reply_tx: &ReplyTx, reply: Vec<u8>) -> Result<(), UsbIpError> {
    reply_tx.send(reply).map_err(|_| UsbIpError::WriterClosed)
}

/// Fills `buf`, or returns false once the peer has closed the stream.
async fn read_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<bool, UsbIpError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
