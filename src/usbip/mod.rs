//! USB/IP server exporting devices to the local vhci driver.

pub mod protocol;
pub mod server;

pub use server::UsbIpServer;

use tokio::sync::mpsc;

use crate::usb::UsbError;
use protocol::{encode_ret_submit, DeviceSummary, MessageHeader, USBIP_DIR_IN};

/// Largest OUT transfer buffer accepted from the host.
pub const MAX_TRANSFER_LEN: u32 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum UsbIpError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("USB: {0}")]
    Usb(#[from] UsbError),
    #[error("Unknown command {0:#x}")]
    UnknownCommand(u32),
    #[error("Transfer buffer of {0} bytes is too large")]
    TransferTooLarge(u32),
    #[error("Connection writer closed")]
    WriterClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// A URB's sequence number only identifies it within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbId {
    pub connection: u32,
    pub seq: u32,
}

/// One submitted USB request block.
#[derive(Debug, Clone)]
pub struct Urb {
    pub id: UrbId,
    pub endpoint: u32,
    pub direction: Direction,
    pub setup: [u8; 8],
    pub transfer_len: u32,
    /// Host data for OUT transfers, empty for IN.
    pub data: Vec<u8>,
}

/// Sends the `RET_SUBMIT` for one URB on its connection.
#[derive(Debug)]
pub struct UrbCompletion {
    connection: u32,
    request: MessageHeader,
    transfer_len: u32,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl UrbCompletion {
    pub(crate) fn new(
        connection: u32,
        request: MessageHeader,
        transfer_len: u32,
        reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            connection,
            request,
            transfer_len,
            reply_tx,
        }
    }

    pub fn id(&self) -> UrbId {
        UrbId {
            connection: self.connection,
            seq: self.request.seq,
        }
    }

    /// IN data is truncated to the transfer length; OUT replies carry no data.
    pub fn finish(self, mut data: Vec<u8>) {
        let reply = if self.request.direction == USBIP_DIR_IN {
            data.truncate(self.transfer_len as usize);
            encode_ret_submit(&self.request, data.len() as u32, &data)
        } else {
            encode_ret_submit(&self.request, self.transfer_len, &[])
        };
        if self.reply_tx.send(reply).is_err() {
            tracing::debug!(seq = self.request.seq, "Connection closed before URB completed");
        }
    }
}

/// A device the server can export.
pub trait UsbIpDevice: Send + Sync {
    fn bus_id(&self) -> &str;
    fn summary(&self) -> DeviceSummary;
    /// Must finish `completion` eventually unless the URB gets unlinked.
    /// An error closes the connection.
    fn submit(&self, urb: Urb, completion: UrbCompletion) -> Result<(), UsbError>;
    /// Cancels a pending URB. Returns false if it already completed or is unknown.
    fn unlink(&self, id: UrbId) -> bool;
    /// Drops every URB still pending on a connection that has ended.
    fn detach(&self, connection: u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{USBIP_CMD_SUBMIT, USBIP_DIR_OUT};

    fn completion(direction: u32, transfer_len: u32) -> (UrbCompletion, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let header = MessageHeader {
            command: USBIP_CMD_SUBMIT,
            seq: 1,
            devid: 0,
            direction,
            endpoint: 1,
        };
        (UrbCompletion::new(1, header, transfer_len, tx), rx)
    }

    #[test]
    fn test_in_completion_truncates() {
        let (completion, mut rx) = completion(USBIP_DIR_IN, 4);
        completion.finish(vec![9; 10]);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.len(), 48 + 4);
        assert_eq!(&reply[24..28], &[0, 0, 0, 4]);
    }

    #[test]
    fn test_out_completion_has_no_data() {
        let (completion, mut rx) = completion(USBIP_DIR_OUT, 64);
        completion.finish(vec![1, 2, 3]);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.len(), 48);
        assert_eq!(&reply[24..28], &[0, 0, 0, 64]);
    }
}
