//! Matches interrupt IN requests from the host with packets the authenticator
//! produces. Either side may arrive first; both are served FIFO.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

pub type ResponseCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

struct Queues<K> {
    waiting: VecDeque<(K, ResponseCallback)>,
    responses: VecDeque<Vec<u8>>,
}

/// Parked requests are keyed by `K` so they can be cancelled individually.
pub struct RequestBuffer<K> {
    queues: Mutex<Queues<K>>,
}

impl<K> Default for RequestBuffer<K> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Queues {
                waiting: VecDeque::new(),
                responses: VecDeque::new(),
            }),
        }
    }
}

impl<K: PartialEq> RequestBuffer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers the oldest buffered response to `callback`, or parks it under `id`.
    pub fn request(&self, id: K, callback: ResponseCallback) {
        let response = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            match queues.responses.pop_front() {
                Some(response) => response,
                None => {
                    queues.waiting.push_back((id, callback));
                    return;
                }
            }
        };
        callback(response);
    }

    /// Drops the parked callback for `id`. Returns false if it already fired or never existed.
    pub fn cancel(&self, id: &K) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match queues.waiting.iter().position(|(waiting, _)| waiting == id) {
            Some(index) => {
                queues.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops every parked callback whose id matches. Returns how many were dropped.
    pub fn cancel_where(&self, mut matches: impl FnMut(&K) -> bool) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queues.waiting.len();
        queues.waiting.retain(|(id, _)| !matches(id));
        before - queues.waiting.len()
    }

    /// Hands `data` to the oldest parked callback, or buffers it.
    pub fn respond(&self, data: Vec<u8>) {
        let waiter = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            match queues.waiting.pop_front() {
                Some((_, callback)) => callback,
                None => {
                    queues.responses.push_back(data);
                    return;
                }
            }
        };
        waiter(data);
    }

    pub fn pending_requests(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .len()
    }

    pub fn buffered_responses(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responses
            .len()
    }
}

impl<K: PartialEq> std::fmt::Debug for RequestBuffer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuffer")
            .field("pending_requests", &self.pending_requests())
            .field("buffered_responses", &self.buffered_responses())
            .finish()
    }
}
