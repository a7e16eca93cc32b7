//! Synchronization primitives driving the benchmark lifecycle.
//!
//! A [Signal] is a one-shot broadcast, once its [Trigger] fires every current
//! and future waiter observes it. A [CompletionBarrier] blocks its owner until
//! every participant has acknowledged a phase transition.

use std::convert::Infallible;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::{Error, Result};

/// Create a broadcast signal and the single trigger able to fire it.
pub fn signal() -> (Trigger, Signal) {
    let (sender, receiver) = flume::bounded(0);

    (Trigger(sender), Signal(receiver))
}

#[derive(Debug)]
/// Privileged, single use side of a [Signal].
///
/// Firing consumes the trigger, dropping an unfired trigger fires it too, so a
/// signal is released exactly once whatever path its owner takes.
pub struct Trigger(Sender<Infallible>);

impl Trigger {
    /// Release every waiter of the paired [Signal].
    pub fn fire(self) {
        drop(self)
    }
}

#[derive(Debug, Clone)]
/// Waiting side of a broadcast, cheap to clone.
pub struct Signal(Receiver<Infallible>);

impl Signal {
    /// Block until the signal fires.
    pub fn wait(&self) {
        // Nothing can be sent over an Infallible channel, recv only returns on disconnect.
        let _ = self.0.recv();
    }

    /// Block until the signal fires or `timeout` elapses, returns true if it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.0.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Returns true once the signal fired, never blocks.
    pub fn is_fired(&self) -> bool {
        self.0.is_disconnected()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Infallible> {
        &self.0
    }
}

#[derive(Debug)]
/// Counting rendezvous for one phase transition.
pub struct CompletionBarrier {
    sender: Sender<()>,
    receiver: Receiver<()>,
    expected: usize,
}

#[derive(Debug)]
/// A participant's single acknowledgement of a [CompletionBarrier].
pub struct Ack(Sender<()>);

impl Ack {
    /// Acknowledge the barrier, consuming this participant.
    pub fn ack(self) {
        // The owner may have given up waiting already.
        let _ = self.0.send(());
    }
}

impl CompletionBarrier {
    /// Create a barrier with no participants.
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        CompletionBarrier {
            sender,
            receiver,
            expected: 0,
        }
    }

    /// Register one more participant.
    pub fn participant(&mut self) -> Ack {
        self.expected += 1;

        Ack(self.sender.clone())
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Block until every participant acknowledged.
    ///
    /// Fails if a participant dropped its [Ack] without acknowledging.
    pub fn wait(self) -> Result<()> {
        let CompletionBarrier {
            sender,
            receiver,
            expected,
        } = self;
        drop(sender);

        for arrived in 0..expected {
            if receiver.recv().is_err() {
                return Err(Error::BarrierBroken { arrived, expected });
            }
        }

        Ok(())
    }
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
