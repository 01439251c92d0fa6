//! Outstanding-send tracking. Every send builds a [`SendTicket`] holding
//! the wire slices; tickets that cannot complete synchronously queue in the
//! per-socket [`SendTracker`] and are flushed by writable completions.

use crate::support::{NetResult, SendStatus};
use crate::sync::{Event, MemoryAccountant};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Completion state shared between a queued ticket and the sender that
/// waits on it.
pub struct TicketCompletion {
    event: Event,
    status: Mutex<Option<SendStatus>>,
}

impl TicketCompletion {
    fn new() -> Arc<TicketCompletion> {
        Arc::new(TicketCompletion {
            event: Event::manual(false),
            status: Mutex::new(None),
        })
    }

    fn complete(&self, status: SendStatus) {
        let mut slot = self.status.lock().unwrap();
        if slot.is_none() {
            *slot = Some(status);
        }
        self.event.set();
    }

    /// Waits for the send to finish; `None` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<SendStatus> {
        if self.event.wait(timeout) {
            *self.status.lock().unwrap()
        } else {
            None
        }
    }

    pub fn status(&self) -> Option<SendStatus> {
        *self.status.lock().unwrap()
    }
}

/// One outstanding send: an ordered list of owned wire slices plus write
/// progress. Flavors: raw (1 slice), prefix (length + payload), postfix
/// (payload + terminator).
pub struct SendTicket {
    slices: Vec<Vec<u8>>,
    slice_index: usize,
    offset: usize,
    accounted: usize,
    target: Option<SocketAddr>,
    completion: Arc<TicketCompletion>,
}

impl SendTicket {
    pub fn raw(payload: Vec<u8>) -> SendTicket {
        SendTicket::from_slices(vec![payload])
    }

    pub fn prefix(prefix: Vec<u8>, payload: Vec<u8>) -> SendTicket {
        SendTicket::from_slices(vec![prefix, payload])
    }

    pub fn postfix(payload: Vec<u8>, postfix: Vec<u8>) -> SendTicket {
        SendTicket::from_slices(vec![payload, postfix])
    }

    fn from_slices(slices: Vec<Vec<u8>>) -> SendTicket {
        SendTicket {
            slices,
            slice_index: 0,
            offset: 0,
            accounted: 0,
            target: None,
            completion: TicketCompletion::new(),
        }
    }

    /// Datagram destination; `None` on connected streams.
    pub fn with_target(mut self, target: SocketAddr) -> SendTicket {
        self.target = Some(target);
        self
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn completion(&self) -> Arc<TicketCompletion> {
        self.completion.clone()
    }

    /// Pushes as much of the ticket as the sink will take. Returns
    /// `Ok(true)` when the ticket is fully written, `Ok(false)` when the
    /// sink would block.
    fn write_step<F>(&mut self, sink: &mut F) -> io::Result<bool>
    where
        F: FnMut(&[u8], Option<SocketAddr>) -> io::Result<usize>,
    {
        while self.slice_index < self.slices.len() {
            let slice = &self.slices[self.slice_index];
            if self.offset == slice.len() {
                self.slice_index += 1;
                self.offset = 0;
                continue;
            }

            match sink(&slice[self.offset..], self.target) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.offset += written,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

/// Per-socket set of in-flight sends with memory accounting.
///
/// Sends on one socket serialize through the tracker lock and complete in
/// FIFO order. A writable completion that finds nothing queued is a no-op,
/// which makes spurious completions harmless.
pub struct SendTracker {
    queue: Mutex<VecDeque<SendTicket>>,
    empty: Event,
    accountant: Arc<MemoryAccountant>,
}

impl SendTracker {
    pub fn new(accountant: Arc<MemoryAccountant>) -> SendTracker {
        SendTracker {
            queue: Mutex::new(VecDeque::new()),
            empty: Event::manual(true),
            accountant,
        }
    }

    #[inline]
    pub fn accountant(&self) -> &Arc<MemoryAccountant> {
        &self.accountant
    }

    pub fn outstanding(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Admits a ticket and pushes as much of it as possible. `charge`
    /// applies the accountant (asynchronous sends only); a refused charge
    /// propagates and the ticket is never queued.
    ///
    /// Returns `Completed` when everything went out synchronously and
    /// `InProgress` when the remainder is queued behind the writable
    /// completion. I/O failures complete the ticket as `FailedKill` and
    /// propagate the error.
    pub fn send<F>(
        &self,
        mut ticket: SendTicket,
        charge: bool,
        sink: &mut F,
    ) -> NetResult<SendStatus>
    where
        F: FnMut(&[u8], Option<SocketAddr>) -> io::Result<usize>,
    {
        let mut queue = self.queue.lock().unwrap();

        if charge {
            let bytes = ticket.total_len();
            self.accountant.increase(bytes)?;
            ticket.accounted = bytes;
        }

        // Earlier tickets keep the wire; writing now would reorder.
        if !queue.is_empty() {
            queue.push_back(ticket);
            self.empty.reset();
            return Ok(SendStatus::InProgress);
        }

        match ticket.write_step(sink) {
            Ok(true) => {
                self.accountant.decrease(ticket.accounted);
                ticket.completion.complete(SendStatus::Completed);
                Ok(SendStatus::Completed)
            }
            Ok(false) => {
                queue.push_back(ticket);
                self.empty.reset();
                Ok(SendStatus::InProgress)
            }
            Err(err) => {
                self.accountant.decrease(ticket.accounted);
                ticket.completion.complete(SendStatus::FailedKill);
                Err(err.into())
            }
        }
    }

    /// Flushes queued tickets in order until the sink blocks or empties.
    /// Called from the writable completion.
    pub fn flush<F>(&self, sink: &mut F) -> NetResult<()>
    where
        F: FnMut(&[u8], Option<SocketAddr>) -> io::Result<usize>,
    {
        let mut queue = self.queue.lock().unwrap();

        while let Some(ticket) = queue.front_mut() {
            match ticket.write_step(sink) {
                Ok(true) => {
                    let ticket = queue.pop_front().unwrap();
                    self.accountant.decrease(ticket.accounted);
                    ticket.completion.complete(SendStatus::Completed);
                }
                Ok(false) => return Ok(()),
                Err(err) => {
                    let ticket = queue.pop_front().unwrap();
                    self.accountant.decrease(ticket.accounted);
                    ticket.completion.complete(SendStatus::FailedKill);
                    return Err(err.into());
                }
            }
        }

        self.empty.set();
        Ok(())
    }

    /// Waits until every queued ticket has completed; false on timeout.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        self.empty.wait(timeout)
    }

    /// Completes every queued ticket with `status` and releases charges.
    /// Used when the socket closes with the completion core stopped.
    pub fn abandon(&self, status: SendStatus) {
        let mut queue = self.queue.lock().unwrap();
        while let Some(ticket) = queue.pop_front() {
            self.accountant.decrease(ticket.accounted);
            ticket.completion.complete(status);
        }
        self.empty.set();
    }
}
