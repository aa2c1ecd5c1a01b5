use std::time::{Duration, Instant};

use super::CtapHidError;
use crate::config::TRANSACTION_TIMEOUT_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InProgress,
    Done,
    Error(u8),
    Cancelled,
}

/// Reassembles one fragmented request on a channel.
#[derive(Debug)]
pub struct Transaction {
    pub cid: u32,
    pub cmd: u8,
    pub declared_len: usize,
    next_seq: u8,
    payload: Vec<u8>,
    state: TransactionState,
    deadline: Instant,
}

impl Transaction {
    pub fn new(cid: u32, cmd: u8, declared_len: usize, data: &[u8]) -> Self {
        let mut transaction = Self {
            cid,
            cmd,
            declared_len,
            next_seq: 0,
            payload: Vec::with_capacity(declared_len),
            state: TransactionState::InProgress,
            deadline: Instant::now() + Duration::from_secs(TRANSACTION_TIMEOUT_SECS),
        };
        transaction.append(data);
        transaction
    }

    fn append(&mut self, data: &[u8]) {
        let room = self.declared_len - self.payload.len();
        self.payload.extend_from_slice(&data[..data.len().min(room)]);
        if self.payload.len() == self.declared_len {
            self.state = TransactionState::Done;
        }
    }

    pub fn add_continuation(&mut self, seq: u8, data: &[u8]) -> Result<(), CtapHidError> {
        match self.state {
            TransactionState::InProgress => {}
            TransactionState::Done => return Err(CtapHidError::AlreadyComplete),
            TransactionState::Error(_) | TransactionState::Cancelled => {
                return Err(CtapHidError::UnexpectedCont)
            }
        }
        if Instant::now() > self.deadline {
            let err = CtapHidError::Timeout;
            self.state = TransactionState::Error(err.code());
            return Err(err);
        }
        if seq != self.next_seq {
            let err = CtapHidError::InvalidSeq {
                expected: self.next_seq,
                got: seq,
            };
            self.state = TransactionState::Error(err.code());
            return Err(err);
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        self.append(data);
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.state = TransactionState::Cancelled;
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransactionState::Done
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Moves the reassembled payload out, leaving the transaction in place so
    /// stray fragments can still be recognised.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    #[cfg(test)]
    pub(crate) fn expire(&mut self) {
        self.deadline = Instant::now() - Duration::from_millis(1);
    }
}
