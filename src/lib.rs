//! A communicator for secure multi-party computation (MPC).
//!
//! Secret-sharing protocols need a handful of communication primitives between a fixed set of
//! parties: point-to-point messages, collectives such as broadcast and reduction, barriers, and
//! pseudo-random generators whose seeds are shared between neighbouring parties. This crate
//! provides them on top of any transport implementing [`channel::Channel`], and measures how many
//! rounds, bytes and seconds a protocol spends communicating.
//!
//! ## Main Components
//!
//! * [`Communicator`]: The communication endpoint of one party.
//! * [`channel`]: The transport seam, with the in-process [`channel::SimpleChannel`].
//! * [`instrument`]: Process-wide switch for recording communication statistics.
//! * [`generators`]: Generators shared with the next and the previous party.
//! * [`global`]: A process-wide communicator for code that cannot pass one around.
//!
//! ## Example
//!
//! ```no_run
//! use partycomm::{Communicator, CommunicatorOptions, ReduceOp, channel::SimpleChannel};
//!
//! # async fn example() -> Result<(), partycomm::Error> {
//! let mut channels = SimpleChannel::channels(3);
//! // Every party runs this with its own rank and channel.
//! let rank = 0;
//! let options = CommunicatorOptions::new(rank, 3).with_verbosity(true);
//! let comm = Communicator::new(options, channels.remove(0))?;
//!
//! let total = comm.all_reduce(vec![1u64, 2, 3], ReduceOp::Sum).await?;
//! println!("{total:?}");
//! comm.report_stats();
//! # Ok(())
//! # }
//! ```
//!
//! ## Single-party mode
//!
//! With a world size of 1, every payload operation returns its input without communicating and
//! nothing is recorded in the statistics. Barriers still run, and succeed immediately.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod config;
pub mod error;
pub mod generators;
pub mod global;
pub mod instrument;
pub mod payload;
pub mod stats;

mod communicator;

pub use communicator::{Communicator, PendingOp, REDUCE_ROOT};
pub use config::CommunicatorOptions;
pub use error::{CommunicationError, Error, InitializationError, Violation};
pub use generators::{Device, GeneratorRegistry};
pub use instrument::{is_verbose, set_verbosity};
pub use payload::{Element, Payload, ReduceOp, Reducible};
pub use stats::{BYTES_PER_ELEMENT, CommStats, StatsTracker};
