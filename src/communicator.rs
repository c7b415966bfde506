//! The communicator: point-to-point, collective and object-level communication between the
//! parties of a secure multi-party computation.
//!
//! Every payload operation passes through the instrumentation in [`crate::instrument`] before it
//! reaches the channel. When the own party is the only one, payload operations return their
//! input without communicating, e.g. `all_gather(x)` returns `[x]` and `all_reduce(x)` returns
//! `x`.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use rand_chacha::ChaCha20Rng;
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    channel::{Channel, DynChannel},
    config::CommunicatorOptions,
    error::{Error, Violation},
    generators::{self, Device, GeneratorRegistry},
    instrument::{self, Intercept, OpDescriptor, OpKind, Volume},
    payload::{Payload, ReduceOp, Reducible},
    stats::{CommStats, StatsTracker},
};

pub(crate) mod collectives;
mod pending;

use collectives::{FrameKind, Party};
pub use collectives::REDUCE_ROOT;
pub use pending::PendingOp;

type SharedChannel = Arc<tokio::sync::Mutex<Option<Box<dyn DynChannel>>>>;

/// The communication endpoint of one party.
///
/// Operations on the same communicator are executed in the order in which they are issued. All
/// parties must issue the same sequence of collective operations.
pub struct Communicator {
    pub(crate) party: Party,
    name: RwLock<String>,
    channel: SharedChannel,
    closed: AtomicBool,
    stats: Mutex<StatsTracker>,
    generators: Mutex<GeneratorRegistry>,
}

impl Communicator {
    /// Creates the communicator of the party described by `options`, communicating over `channel`.
    ///
    /// Sets the process-wide verbosity if the options specify it.
    pub fn new<C>(options: CommunicatorOptions, channel: C) -> Result<Self, Error>
    where
        C: Channel + Send + 'static,
        C::SendError: Send,
        C::RecvError: Send,
    {
        options.validate()?;
        if let Some(verbose) = options.verbose {
            instrument::set_verbosity(verbose);
        }
        let name = options.party_name();
        debug!(
            rank = options.rank,
            world_size = options.world_size,
            %name,
            "created communicator"
        );
        let channel: Box<dyn DynChannel> = Box::new(channel);
        Ok(Self {
            party: Party {
                rank: options.rank,
                world_size: options.world_size,
            },
            name: RwLock::new(name),
            channel: Arc::new(tokio::sync::Mutex::new(Some(channel))),
            closed: AtomicBool::new(false),
            stats: Mutex::new(StatsTracker::new(options.bytes_per_element)),
            generators: Mutex::new(GeneratorRegistry::new()),
        })
    }

    /// The rank of the own party.
    pub fn get_rank(&self) -> usize {
        self.party.rank
    }

    /// The number of parties.
    pub fn get_world_size(&self) -> usize {
        self.party.world_size
    }

    /// The name of the own party.
    pub fn get_name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Renames the own party. Other parties are not informed.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Releases the channel and drops all generators.
    ///
    /// Every later operation on this communicator fails with [`Error::NotInitialized`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.channel.lock().await.take();
        self.generators_mut().clear();
        if channel.is_some() {
            debug!(rank = self.party.rank, "closed communicator");
        }
    }

    /// Whether [`Communicator::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::NotInitialized`] once the communicator has been closed.
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Sends `value` to party `dst`.
    pub async fn send<T: Payload>(&self, value: &T, dst: usize) -> Result<(), Error> {
        let descriptor = OpDescriptor::new(OpKind::Send, Volume::One(value));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(()),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result =
            collectives::send_frame(channel, self.party, dst, FrameKind::Payload, value).await;
        self.record_elapsed(started);
        Ok(result?)
    }

    /// Receives a payload from party `src` (or from any party if `None`) into `buf`.
    ///
    /// Returns the rank of the sender. The received payload must have as many elements as `buf`.
    pub async fn recv<T: Payload>(&self, buf: &mut T, src: Option<usize>) -> Result<usize, Error> {
        let descriptor = OpDescriptor::new(OpKind::Recv, Volume::One(&*buf));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(self.party.rank),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let received = match src {
            Some(src) => collectives::recv_frame(channel, self.party, src, FrameKind::Payload)
                .await
                .map(|value| (src, value)),
            None => collectives::recv_frame_any(channel, self.party, FrameKind::Payload).await,
        };
        self.record_elapsed(started);
        let (from, value): (usize, T) = received?;
        if value.num_elements() != buf.num_elements() {
            return Err(Violation::LengthMismatch {
                expected: buf.num_elements(),
                actual: value.num_elements(),
            }
            .into());
        }
        *buf = value;
        Ok(from)
    }

    /// Distributes `values[p]` from party `src` to every party `p`.
    ///
    /// Only `src` needs to provide values, exactly one per party. The others may pass an empty
    /// vector and the number of elements they expect as `size`, which is used for statistics.
    pub async fn scatter<T: Payload>(
        &self,
        values: Vec<T>,
        src: usize,
        size: Option<usize>,
    ) -> Result<T, Error> {
        let volume = Volume::Scatter {
            values: &values,
            size,
        };
        let descriptor = OpDescriptor::new(OpKind::Scatter, volume);
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return single_party_scatter(values),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::scatter(channel, self.party, values, src).await;
        self.record_elapsed(started);
        result
    }

    /// Collects the values of all parties at party `dst`, ordered by rank.
    ///
    /// Returns `None` at every other party.
    pub async fn gather<T: Payload>(&self, value: T, dst: usize) -> Result<Option<Vec<T>>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Gather, Volume::One(&value));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(Some(vec![value])),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::gather(channel, self.party, value, dst).await;
        self.record_elapsed(started);
        result
    }

    /// Collects the values of all parties at every party, ordered by rank.
    pub async fn all_gather<T: Payload>(&self, value: T) -> Result<Vec<T>, Error> {
        let op = OpDescriptor::new(OpKind::AllGather, Volume::One(&value));
        let started = match self.intercept(op)? {
            Intercept::SingleParty => return Ok(vec![value]),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::all_gather(channel, self.party, value).await;
        self.record_elapsed(started);
        result
    }

    /// Reduces the values of all parties with `op` at party [`REDUCE_ROOT`].
    ///
    /// Returns `None` at every other party.
    pub async fn reduce<T: Reducible>(&self, value: T, op: ReduceOp) -> Result<Option<T>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Reduce, Volume::One(&value));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(Some(value)),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::reduce(channel, self.party, value, op).await;
        self.record_elapsed(started);
        result
    }

    /// Reduces the values of all parties with `op` and delivers the result to every party.
    pub async fn all_reduce<T: Reducible>(&self, value: T, op: ReduceOp) -> Result<T, Error> {
        let descriptor = OpDescriptor::new(OpKind::AllReduce, Volume::One(&value));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(value),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::all_reduce(channel, self.party, value, op).await;
        self.record_elapsed(started);
        result
    }

    /// Replicates the value of party `src` at every party. The values of other parties are
    /// ignored.
    pub async fn broadcast<T: Payload>(&self, value: T, src: usize) -> Result<T, Error> {
        let descriptor = OpDescriptor::new(OpKind::Broadcast, Volume::One(&value));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(value),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result =
            collectives::broadcast(channel, self.party, FrameKind::Payload, Some(value), src).await;
        self.record_elapsed(started);
        result
    }

    /// Blocks until every party has entered the barrier.
    pub async fn barrier(&self) -> Result<(), Error> {
        let started = match self.intercept(OpDescriptor::barrier())? {
            Intercept::SingleParty => return Ok(()),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::barrier(channel, self.party).await;
        self.record_elapsed(started);
        result
    }

    /// Broadcasts a batch of payloads from party `src` in a single round.
    pub async fn broadcast_batch<T: Payload>(
        &self,
        values: Vec<T>,
        src: usize,
    ) -> Result<Vec<T>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Broadcast, Volume::Batch(&values));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(values),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result =
            collectives::broadcast(channel, self.party, FrameKind::Payload, Some(values), src)
                .await;
        self.record_elapsed(started);
        result
    }

    /// Reduces a batch of payloads item by item at party [`REDUCE_ROOT`] in a single round.
    pub async fn reduce_batch<T: Reducible>(
        &self,
        values: Vec<T>,
        op: ReduceOp,
    ) -> Result<Option<Vec<T>>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Reduce, Volume::Batch(&values));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(Some(values)),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::reduce_batch(channel, self.party, values, op).await;
        self.record_elapsed(started);
        result
    }

    /// Reduces a batch of payloads item by item at every party in a single round.
    pub async fn all_reduce_batch<T: Reducible>(
        &self,
        values: Vec<T>,
        op: ReduceOp,
    ) -> Result<Vec<T>, Error> {
        let descriptor = OpDescriptor::new(OpKind::AllReduce, Volume::Batch(&values));
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(values),
            Intercept::Proceed(started) => started,
        };
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let result = collectives::all_reduce_batch(channel, self.party, values, op).await;
        self.record_elapsed(started);
        result
    }

    /// Issues [`Communicator::scatter`] in the background.
    pub async fn scatter_async<T: Payload>(
        &self,
        values: Vec<T>,
        src: usize,
        size: Option<usize>,
    ) -> Result<PendingOp<T>, Error> {
        let volume = Volume::Scatter {
            values: &values,
            size,
        };
        let descriptor = OpDescriptor::new(OpKind::Scatter, volume).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return single_party_scatter(values).map(PendingOp::ready),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::scatter(channel, party, values, src).await
        });
        Ok(self.issued(started, task))
    }

    /// Issues [`Communicator::gather`] in the background.
    pub async fn gather_async<T: Payload>(
        &self,
        value: T,
        dst: usize,
    ) -> Result<PendingOp<Option<Vec<T>>>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Gather, Volume::One(&value)).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(PendingOp::ready(Some(vec![value]))),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::gather(channel, party, value, dst).await
        });
        Ok(self.issued(started, task))
    }

    /// Issues [`Communicator::all_gather`] in the background.
    pub async fn all_gather_async<T: Payload>(&self, value: T) -> Result<PendingOp<Vec<T>>, Error> {
        let descriptor = OpDescriptor::new(OpKind::AllGather, Volume::One(&value)).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(PendingOp::ready(vec![value])),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::all_gather(channel, party, value).await
        });
        Ok(self.issued(started, task))
    }

    /// Issues [`Communicator::reduce`] in the background.
    pub async fn reduce_async<T: Reducible>(
        &self,
        value: T,
        op: ReduceOp,
    ) -> Result<PendingOp<Option<T>>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Reduce, Volume::One(&value)).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(PendingOp::ready(Some(value))),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::reduce(channel, party, value, op).await
        });
        Ok(self.issued(started, task))
    }

    /// Issues [`Communicator::all_reduce`] in the background.
    pub async fn all_reduce_async<T: Reducible>(
        &self,
        value: T,
        op: ReduceOp,
    ) -> Result<PendingOp<T>, Error> {
        let descriptor = OpDescriptor::new(OpKind::AllReduce, Volume::One(&value)).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(PendingOp::ready(value)),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::all_reduce(channel, party, value, op).await
        });
        Ok(self.issued(started, task))
    }

    /// Issues [`Communicator::broadcast`] in the background.
    pub async fn broadcast_async<T: Payload>(
        &self,
        value: T,
        src: usize,
    ) -> Result<PendingOp<T>, Error> {
        let descriptor = OpDescriptor::new(OpKind::Broadcast, Volume::One(&value)).issued();
        let started = match self.intercept(descriptor)? {
            Intercept::SingleParty => return Ok(PendingOp::ready(value)),
            Intercept::Proceed(started) => started,
        };
        let mut guard = Arc::clone(&self.channel).lock_owned().await;
        let party = self.party;
        let task = tokio::spawn(async move {
            let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
            collectives::broadcast(channel, party, FrameKind::Payload, Some(value), src).await
        });
        Ok(self.issued(started, task))
    }

    /// Sends an arbitrary serializable object to party `dst`. Not recorded in the statistics.
    pub async fn send_obj<T: Serialize + Sync>(&self, obj: &T, dst: usize) -> Result<(), Error> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        collectives::send_frame(channel, self.party, dst, FrameKind::Object, obj).await?;
        Ok(())
    }

    /// Receives an object sent with [`Communicator::send_obj`] by party `src`.
    pub async fn recv_obj<T: DeserializeOwned>(&self, src: usize) -> Result<T, Error> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        Ok(collectives::recv_frame(channel, self.party, src, FrameKind::Object).await?)
    }

    /// Replicates the object of party `src` at every party. Not recorded in the statistics.
    ///
    /// Only `src` needs to provide an object.
    pub async fn broadcast_obj<T>(&self, obj: Option<T>, src: usize) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.ensure_open()?;
        if self.party.world_size < 2 {
            return obj.ok_or_else(|| Violation::MissingObject { src }.into());
        }
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        collectives::broadcast(channel, self.party, FrameKind::Object, obj, src).await
    }

    /// The communication statistics recorded since creation or the last reset.
    pub fn stats(&self) -> CommStats {
        self.stats_mut().snapshot()
    }

    /// Zeroes the communication statistics.
    pub fn reset_stats(&self) {
        self.stats_mut().reset();
    }

    /// Logs the communication statistics and returns them as text.
    pub fn report_stats(&self) -> String {
        self.stats_mut().report()
    }

    /// Agrees on fresh generator seeds with the neighbouring parties and provisions both slots on
    /// `device`.
    ///
    /// Must be called by all parties at the same point of their communication.
    pub async fn setup_generators(&self, device: Device) -> Result<(), Error> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_deref_mut().ok_or(Error::NotInitialized)?;
        let seeds = generators::agree_pairwise_seeds(channel, self.party).await?;
        drop(guard);
        let mut registry = self.generators_mut();
        for (slot, seed) in seeds.into_iter().enumerate() {
            registry.provision(slot, device, seed)?;
        }
        debug!(rank = self.party.rank, %device, "provisioned generators");
        Ok(())
    }

    /// Runs `f` with the generator of `slot` on `device` (the CPU if `None`).
    pub fn with_generator<R>(
        &self,
        slot: usize,
        device: Option<Device>,
        f: impl FnOnce(&mut ChaCha20Rng) -> R,
    ) -> Result<R, Error> {
        let mut registry = self.generators_mut();
        let generator = registry.get_generator(slot, device)?;
        Ok(f(generator))
    }

    /// The generator registry of this party.
    pub fn generators(&self) -> MutexGuard<'_, GeneratorRegistry> {
        self.generators_mut()
    }

    fn generators_mut(&self) -> MutexGuard<'_, GeneratorRegistry> {
        self.generators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats_mut(&self) -> MutexGuard<'_, StatsTracker> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the issuance of a background operation.
    fn issued<R>(
        &self,
        started: Option<Instant>,
        task: JoinHandle<Result<R, Error>>,
    ) -> PendingOp<R> {
        self.record_elapsed(started);
        PendingOp::running(task)
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.party.rank)
            .field("world_size", &self.party.world_size)
            .field("name", &self.get_name())
            .finish_non_exhaustive()
    }
}

/// A single party keeps the one value destined for itself.
fn single_party_scatter<T>(mut values: Vec<T>) -> Result<T, Error> {
    let actual = values.len();
    match values.pop() {
        Some(value) if actual == 1 => Ok(value),
        _ => Err(Violation::ScatterLength {
            expected: 1,
            actual,
        }
        .into()),
    }
}
