//! Collective operations built from point-to-point messages.
//!
//! Every message is a frame: a one-byte tag naming its kind followed by the bincode encoding of
//! the value. Frames never cross the public API, the format may change at any time.

use serde::{Serialize, de::DeserializeOwned};
use tracing::trace;

use crate::{
    channel::DynChannel,
    error::{CommunicationError, Error, Violation},
    payload::{self, ReduceOp, Reducible},
};

/// The rank that receives the result of `reduce`.
pub const REDUCE_ROOT: usize = 0;

/// The rank that coordinates a barrier.
const BARRIER_ROOT: usize = 0;

/// A value that can be sent in a frame.
pub(crate) trait Wire: Serialize + DeserializeOwned + Send + Sync {}

impl<T: Serialize + DeserializeOwned + Send + Sync> Wire for T {}

/// Rank and world size of the own party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Party {
    pub(crate) rank: usize,
    pub(crate) world_size: usize,
}

impl Party {
    /// All other parties in rank order.
    fn peers(self) -> impl Iterator<Item = usize> {
        let rank = self.rank;
        (0..self.world_size).filter(move |p| *p != rank)
    }

    /// Fails unless `party` is an existing party other than the own one.
    pub(crate) fn check_peer(self, party: usize) -> Result<(), CommunicationError> {
        if party == self.rank || party >= self.world_size {
            Err(CommunicationError::InvalidRank {
                party,
                rank: self.rank,
                world_size: self.world_size,
            })
        } else {
            Ok(())
        }
    }
}

/// The kind of a frame, written as its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    Payload = 1,
    Object = 2,
    Barrier = 3,
}

impl FrameKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameKind::Payload),
            2 => Some(FrameKind::Object),
            3 => Some(FrameKind::Barrier),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FrameKind::Payload => "payload",
            FrameKind::Object => "object",
            FrameKind::Barrier => "barrier",
        }
    }
}

fn encode<T: Serialize + ?Sized>(kind: FrameKind, value: &T) -> Result<Vec<u8>, CommunicationError> {
    let mut msg = vec![kind as u8];
    bincode::serialize_into(&mut msg, value)?;
    Ok(msg)
}

fn decode<T: DeserializeOwned>(
    party: usize,
    expected: FrameKind,
    msg: &[u8],
) -> Result<T, CommunicationError> {
    let Some((&tag, body)) = msg.split_first() else {
        return Err(CommunicationError::UnexpectedFrame {
            party,
            expected: expected.name(),
            actual: "empty",
        });
    };
    match FrameKind::from_tag(tag) {
        Some(kind) if kind == expected => Ok(bincode::deserialize(body)?),
        Some(kind) => Err(CommunicationError::UnexpectedFrame {
            party,
            expected: expected.name(),
            actual: kind.name(),
        }),
        None => Err(CommunicationError::UnexpectedFrame {
            party,
            expected: expected.name(),
            actual: "unknown",
        }),
    }
}

/// Serializes `value` and sends it to party `to`.
pub(crate) async fn send_frame<T: Serialize + Sync + ?Sized>(
    channel: &mut dyn DynChannel,
    party: Party,
    to: usize,
    kind: FrameKind,
    value: &T,
) -> Result<(), CommunicationError> {
    party.check_peer(to)?;
    let msg = encode(kind, value)?;
    trace!(from = party.rank, to, kind = kind.name(), bytes = msg.len(), "sending frame");
    channel.send_bytes_to(to, msg).await
}

/// Receives a frame of the given kind from party `from`.
pub(crate) async fn recv_frame<T: DeserializeOwned>(
    channel: &mut dyn DynChannel,
    party: Party,
    from: usize,
    kind: FrameKind,
) -> Result<T, CommunicationError> {
    party.check_peer(from)?;
    let msg = channel.recv_bytes_from(from).await?;
    trace!(from, to = party.rank, kind = kind.name(), bytes = msg.len(), "received frame");
    decode(from, kind, &msg)
}

/// Receives a frame of the given kind from whichever party sends first.
pub(crate) async fn recv_frame_any<T: DeserializeOwned>(
    channel: &mut dyn DynChannel,
    party: Party,
    kind: FrameKind,
) -> Result<(usize, T), CommunicationError> {
    let (from, msg) = channel.recv_bytes_from_any().await?;
    party.check_peer(from)?;
    trace!(from, to = party.rank, kind = kind.name(), bytes = msg.len(), "received frame");
    Ok((from, decode(from, kind, &msg)?))
}

/// Sends `values[p]` to every party `p`, keeping `values[src]` for the source itself.
pub(crate) async fn scatter<T: Wire>(
    channel: &mut dyn DynChannel,
    party: Party,
    values: Vec<T>,
    src: usize,
) -> Result<T, Error> {
    if party.rank != src {
        return Ok(recv_frame(channel, party, src, FrameKind::Payload).await?);
    }
    let violation = Violation::ScatterLength {
        expected: party.world_size,
        actual: values.len(),
    };
    if values.len() != party.world_size {
        return Err(violation.into());
    }
    let mut own = None;
    for (p, value) in values.into_iter().enumerate() {
        if p == src {
            own = Some(value);
        } else {
            send_frame(channel, party, p, FrameKind::Payload, &value).await?;
        }
    }
    own.ok_or_else(|| violation.into())
}

/// Collects the values of all parties at `dst`, ordered by rank.
pub(crate) async fn gather<T: Wire>(
    channel: &mut dyn DynChannel,
    party: Party,
    value: T,
    dst: usize,
) -> Result<Option<Vec<T>>, Error> {
    if party.rank != dst {
        send_frame(channel, party, dst, FrameKind::Payload, &value).await?;
        return Ok(None);
    }
    let mut gathered = Vec::with_capacity(party.world_size);
    for p in 0..dst {
        gathered.push(recv_frame(channel, party, p, FrameKind::Payload).await?);
    }
    gathered.push(value);
    for p in (dst + 1)..party.world_size {
        gathered.push(recv_frame(channel, party, p, FrameKind::Payload).await?);
    }
    Ok(Some(gathered))
}

/// Collects the values of all parties at every party, ordered by rank.
pub(crate) async fn all_gather<T: Wire>(
    channel: &mut dyn DynChannel,
    party: Party,
    value: T,
) -> Result<Vec<T>, Error> {
    for p in party.peers() {
        send_frame(channel, party, p, FrameKind::Payload, &value).await?;
    }
    let mut gathered = Vec::with_capacity(party.world_size);
    for p in 0..party.rank {
        gathered.push(recv_frame(channel, party, p, FrameKind::Payload).await?);
    }
    gathered.push(value);
    for p in (party.rank + 1)..party.world_size {
        gathered.push(recv_frame(channel, party, p, FrameKind::Payload).await?);
    }
    Ok(gathered)
}

/// Replicates the value of `src` at every party.
///
/// Only the source needs to provide a value, everyone else's is ignored.
pub(crate) async fn broadcast<T: Wire>(
    channel: &mut dyn DynChannel,
    party: Party,
    kind: FrameKind,
    value: Option<T>,
    src: usize,
) -> Result<T, Error> {
    if party.rank != src {
        return Ok(recv_frame(channel, party, src, kind).await?);
    }
    let value = value.ok_or(Violation::MissingObject { src })?;
    for p in party.peers() {
        send_frame(channel, party, p, kind, &value).await?;
    }
    Ok(value)
}

/// Reduces the values of all parties at [`REDUCE_ROOT`].
pub(crate) async fn reduce<T: Reducible>(
    channel: &mut dyn DynChannel,
    party: Party,
    value: T,
    op: ReduceOp,
) -> Result<Option<T>, Error> {
    match gather(channel, party, value, REDUCE_ROOT).await? {
        Some(contributions) => payload::fold(contributions, op),
        None => Ok(None),
    }
}

/// Reduces the values of all parties at every party.
pub(crate) async fn all_reduce<T: Reducible>(
    channel: &mut dyn DynChannel,
    party: Party,
    value: T,
    op: ReduceOp,
) -> Result<T, Error> {
    let contributions = all_gather(channel, party, value).await?;
    let world_size = party.world_size;
    payload::fold(contributions, op)?.ok_or_else(|| {
        Violation::LengthMismatch {
            expected: world_size,
            actual: 0,
        }
        .into()
    })
}

/// Reduces batches item by item at [`REDUCE_ROOT`].
pub(crate) async fn reduce_batch<T: Reducible>(
    channel: &mut dyn DynChannel,
    party: Party,
    values: Vec<T>,
    op: ReduceOp,
) -> Result<Option<Vec<T>>, Error> {
    match gather(channel, party, values, REDUCE_ROOT).await? {
        Some(batches) => Ok(Some(payload::fold_batches(batches, op)?)),
        None => Ok(None),
    }
}

/// Reduces batches item by item at every party.
pub(crate) async fn all_reduce_batch<T: Reducible>(
    channel: &mut dyn DynChannel,
    party: Party,
    values: Vec<T>,
    op: ReduceOp,
) -> Result<Vec<T>, Error> {
    let batches = all_gather(channel, party, values).await?;
    payload::fold_batches(batches, op)
}

/// Blocks until every party has entered the barrier.
pub(crate) async fn barrier(channel: &mut dyn DynChannel, party: Party) -> Result<(), Error> {
    if party.world_size < 2 {
        return Ok(());
    }
    if party.rank == BARRIER_ROOT {
        for p in party.peers() {
            recv_frame::<()>(channel, party, p, FrameKind::Barrier).await?;
        }
        for p in party.peers() {
            send_frame(channel, party, p, FrameKind::Barrier, &()).await?;
        }
    } else {
        send_frame(channel, party, BARRIER_ROOT, FrameKind::Barrier, &()).await?;
        recv_frame::<()>(channel, party, BARRIER_ROOT, FrameKind::Barrier).await?;
    }
    Ok(())
}
