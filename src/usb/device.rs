use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::descriptors::{self, DESCRIPTOR_HID_REPORT, FIDO_HID_REPORT_DESCRIPTOR};
use super::*;
use crate::config::IN_URB_TIMEOUT_MS;
use crate::ctaphid::types::{Report, PACKET_SIZE};
use crate::request_buffer::RequestBuffer;
use crate::usbip::protocol::{DeviceSummary, InterfaceSummary};
use crate::usbip::{Direction, Urb, UrbCompletion, UrbId, UsbIpDevice};

pub const BUS_ID: &str = "2-2";

/// The FIDO HID key as seen over USB/IP. OUT reports feed the CTAPHID loop;
/// IN URBs are matched with its output through the request buffer.
pub struct FidoUsbDevice {
    incoming_tx: mpsc::UnboundedSender<Report>,
    buffer: Arc<RequestBuffer<UrbId>>,
}

impl FidoUsbDevice {
    /// Spawns the task moving CTAPHID responses into the request buffer.
    /// Must be called inside a tokio runtime.
    pub fn start(
        incoming_tx: mpsc::UnboundedSender<Report>,
        mut outgoing_rx: mpsc::UnboundedReceiver<Vec<Report>>,
    ) -> Self {
        let buffer = Arc::new(RequestBuffer::new());
        let responses = buffer.clone();
        tokio::spawn(async move {
            while let Some(packets) = outgoing_rx.recv().await {
                // packets of one response stay contiguous in the buffer
                for packet in packets {
                    responses.respond(packet.to_vec());
                }
            }
            tracing::debug!("CTAPHID output closed");
        });
        Self {
            incoming_tx,
            buffer,
        }
    }

    pub fn request_buffer(&self) -> &Arc<RequestBuffer<UrbId>> {
        &self.buffer
    }

    fn control(&self, setup: &SetupPacket) -> Result<Vec<u8>, UsbError> {
        tracing::debug!(
            recipient = setup.recipient(),
            request = format!("{:#04x}", setup.request),
            value = format!("{:#06x}", setup.value),
            length = setup.length,
            "USB control request"
        );
        match (setup.recipient(), setup.request) {
            (RECIPIENT_DEVICE, REQUEST_GET_DESCRIPTOR) => {
                descriptors::descriptor(setup.descriptor_type(), setup.descriptor_index())
            }
            (RECIPIENT_DEVICE, REQUEST_SET_CONFIGURATION) => Ok(vec![]),
            (RECIPIENT_DEVICE, REQUEST_GET_STATUS) => Ok(vec![0x01]),
            (RECIPIENT_INTERFACE, HID_REQUEST_SET_IDLE | HID_REQUEST_SET_PROTOCOL) => Ok(vec![]),
            (RECIPIENT_INTERFACE, HID_REQUEST_GET_DESCRIPTOR)
                if setup.descriptor_type() == DESCRIPTOR_HID_REPORT =>
            {
                Ok(FIDO_HID_REPORT_DESCRIPTOR.to_vec())
            }
            (recipient, request) => Err(UsbError::UnsupportedRequest { recipient, request }),
        }
    }

    fn interrupt_out(&self, data: &[u8]) {
        let mut report = [0u8; PACKET_SIZE];
        let len = data.len().min(PACKET_SIZE);
        report[..len].copy_from_slice(&data[..len]);
        tracing::trace!(len = data.len(), "HID rx");
        if self.incoming_tx.send(report).is_err() {
            tracing::error!("CTAPHID loop is gone, dropping report");
        }
    }

    /// Completes with the next CTAPHID packet, or empty once the IN timeout
    /// expires. An unlinked URB is never completed.
    fn interrupt_in(&self, completion: UrbCompletion) {
        let id = completion.id();
        let seq = id.seq;
        let (tx, mut rx) = oneshot::channel::<Vec<u8>>();
        self.buffer.request(
            id,
            Box::new(move |data| {
                let _ = tx.send(data);
            }),
        );

        let buffer = self.buffer.clone();
        tokio::spawn(async move {
            let data = match timeout(Duration::from_millis(IN_URB_TIMEOUT_MS), &mut rx).await {
                Ok(Ok(data)) => data,
                Ok(Err(_)) => {
                    tracing::debug!(seq, "IN URB unlinked");
                    return;
                }
                Err(_) if buffer.cancel(&id) => Vec::new(),
                // a response raced the timeout
                Err(_) => match rx.await {
                    Ok(data) => data,
                    Err(_) => return,
                },
            };
            tracing::trace!(seq, len = data.len(), "HID tx");
            completion.finish(data);
        });
    }
}

impl UsbIpDevice for FidoUsbDevice {
    fn bus_id(&self) -> &str {
        BUS_ID
    }

    fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            path: "/device/0".into(),
            bus_id: BUS_ID.into(),
            busnum: 2,
            devnum: 2,
            speed: 2,
            vendor_id: 0,
            product_id: 0,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 0,
            num_configurations: 1,
            interfaces: vec![InterfaceSummary {
                class: descriptors::INTERFACE_CLASS_HID,
                subclass: 0,
                protocol: 0,
            }],
        }
    }

    fn submit(&self, urb: Urb, completion: UrbCompletion) -> Result<(), UsbError> {
        match (urb.endpoint, urb.direction) {
            (ENDPOINT_CONTROL, _) => {
                let response = self.control(&SetupPacket::parse(&urb.setup))?;
                completion.finish(response);
            }
            (ENDPOINT_OUT, Direction::Out) => {
                self.interrupt_out(&urb.data);
                completion.finish(vec![]);
            }
            (ENDPOINT_IN, Direction::In) => self.interrupt_in(completion),
            (endpoint, _) => return Err(UsbError::InvalidEndpoint(endpoint)),
        }
        Ok(())
    }

    fn unlink(&self, id: UrbId) -> bool {
        self.buffer.cancel(&id)
    }

    fn detach(&self, connection: u32) {
        let dropped = self.buffer.cancel_where(|id| id.connection == connection);
        if dropped > 0 {
            tracing::debug!(connection, dropped, "Dropped IN URBs of closed connection");
        }
    }
}
