//! Instrumentation applied around every payload operation of a [`Communicator`].
//!
//! Before an operation reaches the channel, the communicator:
//!
//! 0. rejects the call if the communicator has been closed,
//! 1. short-circuits payload operations when the own party is alone in the world,
//! 2. records one round and the communicated elements if verbosity is enabled,
//! 3. starts a timer whose elapsed time is added to the statistics once the call returns.
//!
//! With verbosity disabled, only the single-party check remains.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{communicator::Communicator, error::Error, payload::Payload};

/// Whether communicators record communication statistics, shared by the whole process.
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enables or disables the recording of communication statistics for the whole process.
pub fn set_verbosity(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

/// Whether communication statistics are currently recorded.
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// The operations that pass through the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Point-to-point send.
    Send,
    /// Point-to-point receive.
    Recv,
    /// Scatter from one source.
    Scatter,
    /// Gather at one destination.
    Gather,
    /// Gather at every party.
    AllGather,
    /// Reduction at one destination.
    Reduce,
    /// Reduction at every party.
    AllReduce,
    /// Broadcast from one source.
    Broadcast,
    /// Rendezvous of all parties.
    Barrier,
}

impl OpKind {
    /// Whether the operation carries a payload and is therefore a no-op for a single party.
    pub fn takes_payload(self) -> bool {
        !matches!(self, OpKind::Barrier)
    }
}

/// The payload of an operation, borrowed for element counting.
#[derive(Debug)]
pub(crate) enum Volume<'a, T> {
    /// No payload.
    Empty,
    /// A single payload.
    One(&'a T),
    /// Several payloads moved in one round.
    Batch(&'a [T]),
    /// The per-party values of a scatter, or a size hint where they are unknown.
    Scatter { values: &'a [T], size: Option<usize> },
}

/// Describes one operation to the instrumentation.
#[derive(Debug)]
pub(crate) struct OpDescriptor<'a, T> {
    pub(crate) kind: OpKind,
    pub(crate) volume: Volume<'a, T>,
    pub(crate) is_async: bool,
}

impl<'a, T: Payload> OpDescriptor<'a, T> {
    pub(crate) fn new(kind: OpKind, volume: Volume<'a, T>) -> Self {
        Self {
            kind,
            volume,
            is_async: false,
        }
    }

    /// Marks the operation as issued in the background, so that only the issuance is timed.
    pub(crate) fn issued(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// The number of elements accounted for this operation.
    fn logged_elements(&self, world_size: usize) -> usize {
        if self.kind == OpKind::Barrier {
            return 0;
        }
        match &self.volume {
            Volume::Empty => 0,
            Volume::One(value) => value.num_elements(),
            Volume::Batch(values) => values.iter().map(Payload::num_elements).sum(),
            Volume::Scatter { values, size } => {
                let per_party = values
                    .first()
                    .map(Payload::num_elements)
                    .or(*size)
                    .unwrap_or(0);
                per_party * (world_size - 1)
            }
        }
    }
}

impl OpDescriptor<'static, ()> {
    pub(crate) fn barrier() -> Self {
        Self::new(OpKind::Barrier, Volume::Empty)
    }
}

/// The decision of the instrumentation for one operation.
#[derive(Debug)]
pub(crate) enum Intercept {
    /// The own party is alone, the operation returns its input without touching the channel.
    SingleParty,
    /// The operation must be executed, timed if a start time is present.
    Proceed(Option<Instant>),
}

impl Communicator {
    /// Applies the single-party shortcut and records the pre-call statistics of `op`.
    ///
    /// Fails with [`Error::NotInitialized`] on a closed communicator, before anything is recorded.
    pub(crate) fn intercept<T: Payload>(
        &self,
        op: OpDescriptor<'_, T>,
    ) -> Result<Intercept, Error> {
        self.ensure_open()?;
        let world_size = self.party.world_size;
        if world_size < 2 && op.kind.takes_payload() {
            return Ok(Intercept::SingleParty);
        }
        if !is_verbose() {
            return Ok(Intercept::Proceed(None));
        }
        if world_size >= 2 {
            let elements = op.logged_elements(world_size);
            trace!(
                rank = self.party.rank,
                op = ?op.kind,
                is_async = op.is_async,
                elements,
                "logging communication"
            );
            self.stats_mut().record_round(elements as u64);
        }
        Ok(Intercept::Proceed(Some(Instant::now())))
    }

    /// Adds the time since `started` to the statistics.
    pub(crate) fn record_elapsed(&self, started: Option<Instant>) {
        if let Some(started) = started {
            self.record_time(started.elapsed());
        }
    }

    fn record_time(&self, elapsed: Duration) {
        self.stats_mut().record_time(elapsed);
    }
}
