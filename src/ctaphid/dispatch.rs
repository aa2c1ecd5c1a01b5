use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{
    channel::{ChannelManager, CommandState, Message},
    packet::{encode_error, encode_keepalive, encode_response, parse_packet, Packet},
    types::*,
    CtapHandler, CtapHidError,
};
use crate::config::KEEPALIVE_INTERVAL_MS;
use crate::ctap2::Ctap2Error;

/// Reads HID OUT reports and emits whole responses; every element sent on
/// `outgoing_tx` is one response and its packets must stay contiguous.
pub async fn run_ctaphid_loop<H: CtapHandler + 'static>(
    mut incoming_rx: mpsc::UnboundedReceiver<Report>,
    outgoing_tx: mpsc::UnboundedSender<Vec<Report>>,
    handler: Arc<H>,
) {
    let mut manager = ChannelManager::new();
    tracing::info!("CTAPHID loop running");

    while let Some(report) = incoming_rx.recv().await {
        let packets = process_report(&mut manager, &report, &handler, &outgoing_tx);
        if !packets.is_empty() && outgoing_tx.send(packets).is_err() {
            tracing::error!("Outgoing channel closed");
            return;
        }
    }
    tracing::info!("CTAPHID loop exiting (incoming channel closed)");
}

fn process_report<H: CtapHandler + 'static>(
    manager: &mut ChannelManager,
    report: &Report,
    handler: &Arc<H>,
    outgoing_tx: &mpsc::UnboundedSender<Vec<Report>>,
) -> Vec<Report> {
    let packet = parse_packet(report);
    let cid = packet.cid();

    let result = match packet {
        Packet::Init(init) => {
            tracing::debug!(
                cid = format!("{:#010x}", init.cid),
                cmd = format!("{:#04x}", init.cmd),
                bcnt = init.bcnt,
                "INIT packet"
            );
            manager.feed_init(init.cid, init.cmd, init.bcnt, init.data)
        }
        Packet::Cont(cont) => {
            tracing::trace!(cid = format!("{:#010x}", cont.cid), seq = cont.seq, "CONT packet");
            manager.feed_cont(cont.cid, cont.seq, cont.data)
        }
    };

    match result {
        Ok(Some(msg)) => dispatch_message(manager, msg, handler, outgoing_tx),
        Ok(None) => vec![],
        Err(e) => {
            tracing::warn!(cid = format!("{cid:#010x}"), "Rejected packet: {e}");
            vec![encode_error(cid, e.code())]
        }
    }
}

fn dispatch_message<H: CtapHandler + 'static>(
    manager: &mut ChannelManager,
    msg: Message,
    handler: &Arc<H>,
    outgoing_tx: &mpsc::UnboundedSender<Vec<Report>>,
) -> Vec<Report> {
    if msg.cid == BROADCAST_CID {
        return match msg.cmd {
            CMD_INIT => handle_init(manager, msg),
            CMD_PING => handle_ping(msg),
            cmd => reject(msg.cid, CtapHidError::InvalidCommand(cmd)),
        };
    }

    match msg.cmd {
        CMD_INIT => handle_init(manager, msg),
        CMD_PING => handle_ping(msg),
        CMD_WINK => {
            tracing::debug!(cid = format!("{:#010x}", msg.cid), "WINK");
            encode_response(msg.cid, CMD_WINK, &[])
        }
        CMD_MSG | CMD_CBOR => {
            let state = manager.begin_execution(msg.cid);
            spawn_command(msg, state, handler.clone(), outgoing_tx.clone());
            vec![]
        }
        cmd => reject(msg.cid, CtapHidError::InvalidCommand(cmd)),
    }
}

fn reject(cid: u32, e: CtapHidError) -> Vec<Report> {
    tracing::warn!(cid = format!("{cid:#010x}"), "{e}");
    vec![encode_error(cid, e.code())]
}

/// On the broadcast channel allocates a new channel; elsewhere resynchronizes
/// the channel and answers with its own id.
fn handle_init(manager: &mut ChannelManager, msg: Message) -> Vec<Report> {
    if msg.payload.len() != INIT_NONCE_SIZE {
        return reject(msg.cid, CtapHidError::InvalidLength(msg.payload.len()));
    }

    let cid = if msg.cid == BROADCAST_CID {
        let cid = manager.allocate_cid();
        tracing::info!(cid = format!("{cid:#010x}"), "Allocated new channel");
        cid
    } else {
        tracing::debug!(cid = format!("{:#010x}", msg.cid), "Channel resync");
        msg.cid
    };

    let mut response = [0u8; INIT_RESPONSE_SIZE];
    response[0..8].copy_from_slice(&msg.payload[0..8]);
    response[8..12].copy_from_slice(&cid.to_be_bytes());
    response[12] = CTAPHID_PROTOCOL_VERSION;
    response[13] = DEVICE_VERSION_MAJOR;
    response[14] = DEVICE_VERSION_MINOR;
    response[15] = DEVICE_VERSION_BUILD;
    response[16] = DEVICE_CAPABILITIES;

    encode_response(msg.cid, CMD_INIT, &response)
}

fn handle_ping(msg: Message) -> Vec<Report> {
    tracing::debug!(
        cid = format!("{:#010x}", msg.cid),
        len = msg.payload.len(),
        "PING"
    );
    encode_response(msg.cid, CMD_PING, &msg.payload)
}

/// Runs the command off the framing loop so other channels, and CANCEL on
/// this one, keep being processed.
fn spawn_command<H: CtapHandler + 'static>(
    msg: Message,
    state: Arc<CommandState>,
    handler: Arc<H>,
    outgoing_tx: mpsc::UnboundedSender<Vec<Report>>,
) {
    tokio::spawn(async move {
        let Message { cid, cmd, payload } = msg;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let keepalive = (cmd == CMD_CBOR)
            .then(|| tokio::spawn(send_keepalives(cid, outgoing_tx.clone(), stop_rx)));

        let result = tokio::task::spawn_blocking(move || match cmd {
            CMD_CBOR => handler.handle_cbor(&payload),
            _ => handler.handle_msg(&payload),
        })
        .await;

        let _ = stop_tx.send(());
        if let Some(keepalive) = keepalive {
            let _ = keepalive.await;
        }

        let packets = match result {
            Ok(_) if cmd == CMD_CBOR && state.is_cancelled() => {
                tracing::info!(cid = format!("{cid:#010x}"), "Command cancelled by host");
                encode_response(cid, CMD_CBOR, &[Ctap2Error::KeepaliveCancel.status_byte()])
            }
            Ok(response) => encode_response(cid, cmd, &response),
            Err(e) => {
                tracing::error!(cid = format!("{cid:#010x}"), "Command panicked: {e}");
                vec![encode_error(cid, ERR_OTHER)]
            }
        };
        state.mark_done();
        if outgoing_tx.send(packets).is_err() {
            tracing::warn!(cid = format!("{cid:#010x}"), "Response dropped, outgoing channel closed");
        }
    });
}

async fn send_keepalives(
    cid: u32,
    outgoing_tx: mpsc::UnboundedSender<Vec<Report>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let period = Duration::from_millis(KEEPALIVE_INTERVAL_MS);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let keepalive = encode_keepalive(cid, KEEPALIVE_STATUS_UPNEEDED);
                if outgoing_tx.send(vec![keepalive]).is_err() {
                    break;
                }
            }
            _ = &mut stop_rx => break,
        }
    }
}
