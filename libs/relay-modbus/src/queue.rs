//! Single-in-flight request queue
//!
//! Modbus-TCP allows pipelining, but cheap I/O modules frequently mis-handle
//! it, so at most one request is on the wire at a time. Requests are sent in
//! strict FIFO order; the next one is released only when the current one is
//! resolved by its matching response, by the protocol timeout, or by a
//! connection reset.
//!
//! The queue is sans-IO: it decides *what* goes on the wire and hands the
//! request back to the session, which performs the send.

use std::collections::VecDeque;
use tracing::debug;

use crate::codec::{FunctionCode, Request};
use crate::frame::Frame;

/// Request currently awaiting its response
#[derive(Debug)]
pub struct PendingRequest<C> {
    pub request: Request,
    /// Identifies this particular send for protocol-timeout matching
    pub ticket: u64,
    /// Caller continuation, resolved with the response
    pub context: C,
}

impl<C> PendingRequest<C> {
    pub fn transaction_id(&self) -> u16 {
        self.request.transaction_id
    }

    pub fn function(&self) -> FunctionCode {
        self.request.function
    }

    pub fn expected_count(&self) -> u16 {
        self.request.expected_count()
    }
}

/// Outcome of dispatching one received frame
#[derive(Debug)]
pub enum Dispatch<C> {
    /// Frame carries the pending transaction id; the slot is now free
    Matched(PendingRequest<C>, Frame),
    /// Frame carries a different transaction id; the stream is desynchronised
    Mismatch { expected: u16, received: u16 },
    /// Frame arrived while nothing was pending
    Unsolicited { received: u16 },
}

/// FIFO request queue holding at most one in-flight request
#[derive(Debug)]
pub struct TransactionQueue<C> {
    pending: Option<PendingRequest<C>>,
    waiting: VecDeque<(Request, C)>,
    next_ticket: u64,
}

impl<C> Default for TransactionQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TransactionQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: None,
            waiting: VecDeque::new(),
            next_ticket: 1,
        }
    }

    /// Queue a request behind any earlier ones
    pub fn enqueue(&mut self, request: Request, context: C) {
        debug!(
            "Queue {} tid={:#06X} (waiting={}, in_flight={})",
            request.function,
            request.transaction_id,
            self.waiting.len(),
            self.pending.is_some()
        );
        self.waiting.push_back((request, context));
    }

    /// Promote the oldest waiting request into the in-flight slot.
    ///
    /// Returns the request to put on the wire together with its ticket, or
    /// `None` while a request is already in flight or nothing is waiting.
    pub fn start_next(&mut self) -> Option<(Request, u64)> {
        if self.pending.is_some() {
            return None;
        }
        let (request, context) = self.waiting.pop_front()?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending = Some(PendingRequest {
            request,
            ticket,
            context,
        });
        Some((request, ticket))
    }

    /// Match a received frame against the in-flight request
    pub fn dispatch(&mut self, frame: Frame) -> Dispatch<C> {
        let received = frame.transaction_id();
        match self.pending.take() {
            Some(pending) if pending.transaction_id() == received => {
                Dispatch::Matched(pending, frame)
            },
            Some(pending) => {
                let expected = pending.transaction_id();
                // Still pending: the connection drop (or protocol timeout)
                // clears it
                self.pending = Some(pending);
                debug!(
                    "Mismatched TID detected: tid={:#06X}, expected={:#06X}",
                    received, expected
                );
                Dispatch::Mismatch { expected, received }
            },
            None => {
                debug!("Unsolicited frame: tid={:#06X}", received);
                Dispatch::Unsolicited { received }
            },
        }
    }

    /// Protocol timeout for `ticket` fired.
    ///
    /// Returns the timed-out request if `ticket` is still the one in flight;
    /// a timeout that lost the race against its response returns `None`.
    pub fn timeout_elapsed(&mut self, ticket: u64) -> Option<PendingRequest<C>> {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => self.pending.take(),
            _ => None,
        }
    }

    /// Drop everything; returns the contexts of all discarded requests,
    /// in-flight first
    pub fn clear(&mut self) -> Vec<C> {
        let mut dropped = Vec::with_capacity(self.len());
        if let Some(pending) = self.pending.take() {
            dropped.push(pending.context);
        }
        dropped.extend(self.waiting.drain(..).map(|(_, context)| context));
        if !dropped.is_empty() {
            debug!("Queue cleared: {} request(s) dropped", dropped.len());
        }
        dropped
    }

    pub fn pending(&self) -> Option<&PendingRequest<C>> {
        self.pending.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Requests waiting behind the in-flight one
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Total requests held, in flight plus waiting
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.pending.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
