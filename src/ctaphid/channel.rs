use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::transaction::{Transaction, TransactionState};
use super::{types::*, CtapHidError};
use crate::config::{MAX_CHANNELS, MAX_MESSAGE_SIZE};

/// Shared between the framing loop and a running command.
#[derive(Debug, Default)]
pub struct CommandState {
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl CommandState {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct Channel {
    transaction: Option<Transaction>,
    executing: Option<Arc<CommandState>>,
    last_used: u64,
}

impl Channel {
    pub fn is_busy(&self) -> bool {
        self.executing.as_ref().is_some_and(|state| !state.is_done())
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn is_idle(&self) -> bool {
        !self.is_busy()
            && self
                .transaction
                .as_ref()
                .map_or(true, |t| t.state() != TransactionState::InProgress)
    }
}

pub struct Message {
    pub cid: u32,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

pub struct ChannelManager {
    channels: HashMap<u32, Channel>,
    next_cid: u32,
    clock: u64,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(BROADCAST_CID, Channel::default());
        Self {
            channels,
            next_cid: 1,
            clock: 0,
        }
    }

    /// Ids are handed out in increasing order starting at 1. Once
    /// `MAX_CHANNELS` are allocated the least recently used idle channel is
    /// dropped; its id then answers INVALID_CHANNEL.
    pub fn allocate_cid(&mut self) -> u32 {
        if self.allocated() >= MAX_CHANNELS {
            self.evict_idle();
        }
        loop {
            let cid = self.next_cid;
            self.next_cid = match self.next_cid.wrapping_add(1) {
                BROADCAST_CID | RESERVED_CID => 1,
                next => next,
            };
            if !self.channels.contains_key(&cid) {
                let channel = Channel {
                    last_used: self.tick(),
                    ..Channel::default()
                };
                self.channels.insert(cid, channel);
                return cid;
            }
        }
    }

    /// Allocated channels, not counting broadcast.
    pub fn allocated(&self) -> usize {
        self.channels.len() - 1
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_idle(&mut self) {
        let oldest = self
            .channels
            .iter()
            .filter(|(cid, channel)| **cid != BROADCAST_CID && channel.is_idle())
            .min_by_key(|(_, channel)| channel.last_used)
            .map(|(&cid, _)| cid);
        if let Some(cid) = oldest {
            self.channels.remove(&cid);
            tracing::debug!(cid = format!("{cid:#010x}"), "Evicted idle channel");
        }
    }

    pub fn get(&self, cid: u32) -> Option<&Channel> {
        self.channels.get(&cid)
    }

    /// Looks up a channel for incoming traffic and marks it used.
    fn channel_mut(&mut self, cid: u32) -> Result<&mut Channel, CtapHidError> {
        if cid == RESERVED_CID {
            return Err(CtapHidError::InvalidChannel(cid));
        }
        let now = self.tick();
        let channel = self
            .channels
            .get_mut(&cid)
            .ok_or(CtapHidError::InvalidChannel(cid))?;
        channel.last_used = now;
        Ok(channel)
    }

    /// Drops the channel's partial request and flags its running command.
    pub fn cancel(&mut self, cid: u32) {
        if let Some(channel) = self.channels.get_mut(&cid) {
            if let Some(transaction) = channel.transaction.as_mut() {
                transaction.cancel();
            }
            if let Some(state) = &channel.executing {
                state.cancel();
            }
        }
    }

    /// Registers a command as running on `cid` until its state is marked done.
    pub fn begin_execution(&mut self, cid: u32) -> Arc<CommandState> {
        let state = Arc::new(CommandState::default());
        if let Some(channel) = self.channels.get_mut(&cid) {
            channel.executing = Some(state.clone());
        }
        state
    }

    pub fn feed_init(
        &mut self,
        cid: u32,
        cmd: u8,
        bcnt: u16,
        data: Vec<u8>,
    ) -> Result<Option<Message>, CtapHidError> {
        if cmd == CMD_CANCEL {
            self.channel_mut(cid)?;
            self.cancel(cid);
            return Ok(None);
        }

        let channel = self.channel_mut(cid)?;
        if channel.is_busy() {
            return Err(CtapHidError::ChannelBusy);
        }
        let receiving = channel
            .transaction
            .as_ref()
            .is_some_and(|t| t.state() == TransactionState::InProgress);
        if receiving && cmd != CMD_INIT {
            channel.transaction = None;
            return Err(CtapHidError::Interrupted);
        }
        if (bcnt as usize) > MAX_MESSAGE_SIZE {
            channel.transaction = None;
            return Err(CtapHidError::InvalidLength(bcnt as usize));
        }

        let mut transaction = Transaction::new(cid, cmd, bcnt as usize, &data);
        let message = if transaction.is_complete() {
            Some(Message {
                cid,
                cmd,
                payload: transaction.take_payload(),
            })
        } else {
            None
        };
        channel.transaction = Some(transaction);
        Ok(message)
    }

    pub fn feed_cont(
        &mut self,
        cid: u32,
        seq: u8,
        data: Vec<u8>,
    ) -> Result<Option<Message>, CtapHidError> {
        let channel = self.channel_mut(cid)?;
        let transaction = channel
            .transaction
            .as_mut()
            .ok_or(CtapHidError::UnexpectedCont)?;
        if transaction.state() == TransactionState::Cancelled {
            return Ok(None);
        }

        transaction.add_continuation(seq, &data)?;
        if !transaction.is_complete() {
            return Ok(None);
        }
        Ok(Some(Message {
            cid,
            cmd: transaction.cmd,
            payload: transaction.take_payload(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic_from_one() {
        let mut manager = ChannelManager::new();
        assert_eq!(manager.allocate_cid(), 1);
        assert_eq!(manager.allocate_cid(), 2);
        assert_eq!(manager.allocate_cid(), 3);
    }

    #[test]
    fn test_feed_init_rejects_oversized_bcnt() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();

        let res = manager.feed_init(
            cid,
            CMD_CBOR,
            (MAX_MESSAGE_SIZE as u16) + 1,
            vec![0u8; INIT_DATA_SIZE],
        );

        assert!(matches!(res, Err(CtapHidError::InvalidLength(_))));
    }

    #[test]
    fn test_feed_init_accepts_max_sized_bcnt() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();

        let res = manager.feed_init(
            cid,
            CMD_CBOR,
            MAX_MESSAGE_SIZE as u16,
            vec![0u8; INIT_DATA_SIZE],
        );

        assert!(matches!(res, Ok(None)));
    }

    #[test]
    fn test_unknown_and_reserved_channels() {
        let mut manager = ChannelManager::new();
        assert!(matches!(
            manager.feed_init(42, CMD_PING, 0, vec![]),
            Err(CtapHidError::InvalidChannel(42))
        ));
        assert!(matches!(
            manager.feed_cont(RESERVED_CID, 0, vec![]),
            Err(CtapHidError::InvalidChannel(0))
        ));
    }

    #[test]
    fn test_multi_packet_message() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();
        assert!(manager
            .feed_init(cid, CMD_PING, 100, vec![1; INIT_DATA_SIZE])
            .unwrap()
            .is_none());
        let msg = manager
            .feed_cont(cid, 0, vec![2; CONT_DATA_SIZE])
            .unwrap()
            .unwrap();
        assert_eq!(msg.cmd, CMD_PING);
        assert_eq!(msg.payload.len(), 100);
        assert_eq!(msg.payload[57], 2);

        // the finished transaction rejects stray fragments
        assert!(matches!(
            manager.feed_cont(cid, 1, vec![0; CONT_DATA_SIZE]),
            Err(CtapHidError::AlreadyComplete)
        ));
    }

    #[test]
    fn test_cont_without_transaction() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();
        assert!(matches!(
            manager.feed_cont(cid, 0, vec![0; CONT_DATA_SIZE]),
            Err(CtapHidError::UnexpectedCont)
        ));
    }

    #[test]
    fn test_init_interrupting_transaction() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();
        manager
            .feed_init(cid, CMD_CBOR, 100, vec![0; INIT_DATA_SIZE])
            .unwrap();
        assert!(matches!(
            manager.feed_init(cid, CMD_PING, 1, vec![0]),
            Err(CtapHidError::Interrupted)
        ));
        // the channel is usable again afterwards
        assert!(manager.feed_init(cid, CMD_PING, 1, vec![0]).unwrap().is_some());
    }

    #[test]
    fn test_cancel_discards_transaction_silently() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();
        manager
            .feed_init(cid, CMD_CBOR, 100, vec![0; INIT_DATA_SIZE])
            .unwrap();
        assert!(manager.feed_init(cid, CMD_CANCEL, 0, vec![]).unwrap().is_none());
        assert!(manager.feed_cont(cid, 0, vec![0; CONT_DATA_SIZE]).unwrap().is_none());
        assert!(manager.feed_init(cid, CMD_PING, 1, vec![7]).unwrap().is_some());
    }

    #[test]
    fn test_busy_channel_until_done() {
        let mut manager = ChannelManager::new();
        let cid = manager.allocate_cid();
        let state = manager.begin_execution(cid);
        assert!(matches!(
            manager.feed_init(cid, CMD_CBOR, 1, vec![4]),
            Err(CtapHidError::ChannelBusy)
        ));

        assert!(manager.feed_init(cid, CMD_CANCEL, 0, vec![]).unwrap().is_none());
        assert!(state.is_cancelled());

        state.mark_done();
        assert!(manager.feed_init(cid, CMD_CBOR, 1, vec![4]).unwrap().is_some());
    }

    #[test]
    fn test_table_is_capped_by_evicting_least_recently_used() {
        let mut manager = ChannelManager::new();
        let cids: Vec<u32> = (0..MAX_CHANNELS).map(|_| manager.allocate_cid()).collect();
        // the first channel stays in use
        assert!(manager.feed_init(cids[0], CMD_PING, 1, vec![1]).unwrap().is_some());

        let next = manager.allocate_cid();
        assert_eq!(next, MAX_CHANNELS as u32 + 1);
        assert_eq!(manager.allocated(), MAX_CHANNELS);
        assert!(manager.get(cids[0]).is_some());
        assert!(manager.get(cids[1]).is_none());
        assert!(matches!(
            manager.feed_init(cids[1], CMD_PING, 1, vec![1]),
            Err(CtapHidError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_busy_and_receiving_channels_are_not_evicted() {
        let mut manager = ChannelManager::new();
        let cids: Vec<u32> = (0..MAX_CHANNELS).map(|_| manager.allocate_cid()).collect();
        let _running = manager.begin_execution(cids[0]);
        manager
            .feed_init(cids[1], CMD_CBOR, 100, vec![0; INIT_DATA_SIZE])
            .unwrap();

        for _ in 0..MAX_CHANNELS {
            manager.allocate_cid();
        }
        assert_eq!(manager.allocated(), MAX_CHANNELS);
        assert!(manager.get(cids[0]).is_some());
        assert!(manager.get(cids[1]).is_some());
    }
}
