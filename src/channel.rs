//! A communication channel used to send/receive messages to/from other parties.
//!
//! [`Channel`] is the seam between the communicator and a concrete transport. Any
//! implementation can be plugged into [`crate::Communicator::new`] or
//! [`crate::global::initialize`]. [`SimpleChannel`] connects parties running in the same
//! process and is mostly useful for simulations and tests.

use std::{fmt, future::Future, time::Duration};

use futures::future::{BoxFuture, select_all};
use tokio::{
    sync::mpsc::{Receiver, Sender, channel, error::SendError},
    time::timeout,
};
use tracing::trace;

use crate::error::CommunicationError;

/// A communication channel used to send/receive messages to/from other parties.
///
/// Implementations must deliver the messages between two parties in the order in which they
/// were sent, and `send_bytes_to` must not wait for the other party to receive the message.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a message from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &mut self,
        party: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;

    /// Awaits a message from whichever party sends first, returning the sender and message.
    fn recv_bytes_from_any(
        &mut self,
    ) -> impl Future<Output = Result<(usize, Vec<u8>), Self::RecvError>> + Send;
}

/// Object-safe view of a [`Channel`], so that communicators are not generic over their
/// transport.
pub(crate) trait DynChannel: Send {
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), CommunicationError>>;

    fn recv_bytes_from(&mut self, party: usize) -> BoxFuture<'_, Result<Vec<u8>, CommunicationError>>;

    fn recv_bytes_from_any(&mut self) -> BoxFuture<'_, Result<(usize, Vec<u8>), CommunicationError>>;
}

impl<C> DynChannel for C
where
    C: Channel + Send + 'static,
    C::SendError: Send,
    C::RecvError: Send,
{
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), CommunicationError>> {
        Box::pin(async move {
            Channel::send_bytes_to(self, party, msg)
                .await
                .map_err(|e| CommunicationError::Send {
                    party,
                    reason: format!("{e:?}"),
                })
        })
    }

    fn recv_bytes_from(&mut self, party: usize) -> BoxFuture<'_, Result<Vec<u8>, CommunicationError>> {
        Box::pin(async move {
            Channel::recv_bytes_from(self, party)
                .await
                .map_err(|e| CommunicationError::Recv {
                    party: Some(party),
                    reason: format!("{e:?}"),
                })
        })
    }

    fn recv_bytes_from_any(&mut self) -> BoxFuture<'_, Result<(usize, Vec<u8>), CommunicationError>> {
        Box::pin(async move {
            Channel::recv_bytes_from_any(self)
                .await
                .map_err(|e| CommunicationError::Recv {
                    party: None,
                    reason: format!("{e:?}"),
                })
        })
    }
}

/// Messages larger than this are split into several chunks.
const CHUNK_SIZE: usize = 100 * 1024 * 1024;

/// How long a [`SimpleChannel`] waits for a message before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A simple asynchronous channel using [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Receiver<Vec<u8>>>>,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels = vec![];
        for _ in 0..parties {
            let mut s = vec![];
            let mut r = vec![];
            for _ in 0..parties {
                s.push(None);
                r.push(None);
            }
            channels.push(SimpleChannel { s, r });
        }
        for a in 0..parties {
            for b in (a + 1)..parties {
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].s[a] = Some(send_b_to_a);
                channels[a].r[b] = Some(recv_b_to_a);
                channels[b].r[a] = Some(recv_a_to_b);
            }
        }
        channels
    }

    /// Receives the remaining chunks of a message whose first chunk came from party `p`.
    async fn recv_chunks(
        &mut self,
        p: usize,
        mut msg: Vec<u8>,
        mut complete: bool,
    ) -> Result<Vec<u8>, AsyncRecvError> {
        while !complete {
            let receiver = self.r.get_mut(p).and_then(Option::as_mut);
            let Some(receiver) = receiver else {
                return Err(AsyncRecvError::NoSuchParty(p));
            };
            let chunk = match timeout(RECV_TIMEOUT, receiver.recv()).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(AsyncRecvError::Closed),
                Err(_) => return Err(AsyncRecvError::TimeoutElapsed),
            };
            complete = append_chunk(&mut msg, &chunk)?;
        }
        Ok(msg)
    }
}

/// Appends the body of `chunk` to `msg`, returning whether it was the last chunk.
fn append_chunk(msg: &mut Vec<u8>, chunk: &[u8]) -> Result<bool, AsyncRecvError> {
    if chunk.len() < 8 {
        return Err(AsyncRecvError::MalformedChunk);
    }
    let i = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    let length = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
    msg.extend(&chunk[8..]);
    Ok(i + 1 >= length)
}

#[derive(Debug)]
/// The error raised by `recv` calls of a [`SimpleChannel`].
pub enum AsyncRecvError {
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
    /// There is no channel to the given party.
    NoSuchParty(usize),
    /// A chunk was too short to contain its header.
    MalformedChunk,
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncSendError {
    /// The receiving half of the channel has been dropped.
    Closed(SendError<Vec<u8>>),
    /// There is no channel to the given party.
    NoSuchParty(usize),
}

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: usize, msg: Vec<u8>) -> Result<(), AsyncSendError> {
        let Some(sender) = self.s.get(p).and_then(Option::as_ref) else {
            return Err(AsyncSendError::NoSuchParty(p));
        };
        let mut chunks: Vec<_> = msg.chunks(CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let length = chunks.len();
        trace!(party = p, bytes = msg.len(), chunks = length, "sending msg");
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut msg = Vec::with_capacity(2 * 4 + chunk.len());
            msg.extend((i as u32).to_be_bytes());
            msg.extend((length as u32).to_be_bytes());
            msg.extend(chunk);
            sender.send(msg).await.map_err(AsyncSendError::Closed)?;
        }
        Ok(())
    }

    async fn recv_bytes_from(&mut self, p: usize) -> Result<Vec<u8>, AsyncRecvError> {
        self.recv_chunks(p, vec![], false).await
    }

    async fn recv_bytes_from_any(&mut self) -> Result<(usize, Vec<u8>), AsyncRecvError> {
        let mut closed = vec![false; self.r.len()];
        let (p, chunk) = loop {
            let pending: Vec<_> = self
                .r
                .iter_mut()
                .enumerate()
                .filter(|(p, _)| !closed[*p])
                .filter_map(|(p, r)| r.as_mut().map(|r| Box::pin(async move { (p, r.recv().await) })))
                .collect();
            if pending.is_empty() {
                return Err(AsyncRecvError::Closed);
            }
            match timeout(RECV_TIMEOUT, select_all(pending)).await {
                Ok(((p, Some(chunk)), _, _)) => break (p, chunk),
                // peers that left are skipped as long as another one may still send
                Ok(((p, None), _, _)) => closed[p] = true,
                Err(_) => return Err(AsyncRecvError::TimeoutElapsed),
            }
        };
        let mut msg = vec![];
        let complete = append_chunk(&mut msg, &chunk)?;
        let msg = self.recv_chunks(p, msg, complete).await?;
        Ok((p, msg))
    }
}
