//! Pseudo-random generators shared between neighbouring parties.
//!
//! Secret-sharing protocols use generators whose seeds are known to exactly two parties to
//! produce correlated randomness without communication. Every party holds two of them per
//! device class: slot 0 is shared with the next party (`rank + 1`), slot 1 with the previous
//! party (`rank - 1`), both modulo the world size.

use std::{fmt, str::FromStr};

use rand::{SeedableRng, random};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    channel::DynChannel,
    communicator::collectives::{FrameKind, Party, recv_frame, send_frame},
    error::{CommunicationError, Error, Violation},
};

/// The number of generator slots per device class.
pub const NUM_SLOTS: usize = 2;

/// A seed for one generator.
pub type Seed = [u8; 32];

/// The class of device a generator produces randomness for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// General-purpose processors.
    #[default]
    Cpu,
    /// Accelerators such as GPUs.
    Accelerator,
}

impl Device {
    const COUNT: usize = 2;

    fn index(self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Accelerator => 1,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator => f.write_str("accelerator"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let class = s.split(':').next().unwrap_or_default();
        match class.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "accelerator" | "cuda" | "gpu" => Ok(Device::Accelerator),
            _ => Err(Violation::UnknownDevice(s.to_string()).into()),
        }
    }
}

/// Generators indexed by device class and slot.
pub struct GeneratorRegistry {
    table: [[Option<ChaCha20Rng>; NUM_SLOTS]; Device::COUNT],
}

impl GeneratorRegistry {
    /// Creates a registry without any provisioned generator.
    pub fn new() -> Self {
        Self {
            table: [const { [const { None }; NUM_SLOTS] }; Device::COUNT],
        }
    }

    /// Seeds the generator for `slot` on `device`, replacing any previous generator.
    pub fn provision(&mut self, slot: usize, device: Device, seed: Seed) -> Result<(), Error> {
        check_slot(slot)?;
        self.table[device.index()][slot] = Some(ChaCha20Rng::from_seed(seed));
        Ok(())
    }

    /// Whether the generator for `slot` on `device` has been provisioned.
    pub fn is_provisioned(&self, slot: usize, device: Device) -> bool {
        slot < NUM_SLOTS && self.table[device.index()][slot].is_some()
    }

    /// Returns the generator for `slot` on `device` (the CPU if `None`).
    ///
    /// Fails with [`Error::OutOfRange`] unless `slot` is 0 or 1, and with
    /// [`Error::GeneratorNotInitialized`] if the generator was never provisioned.
    pub fn get_generator(
        &mut self,
        slot: usize,
        device: Option<Device>,
    ) -> Result<&mut ChaCha20Rng, Error> {
        check_slot(slot)?;
        let device = device.unwrap_or_default();
        self.table[device.index()][slot]
            .as_mut()
            .ok_or(Error::GeneratorNotInitialized { slot, device })
    }

    /// Drops all generators.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for device in [Device::Cpu, Device::Accelerator] {
            for slot in 0..NUM_SLOTS {
                if self.is_provisioned(slot, device) {
                    list.entry(&(device, slot));
                }
            }
        }
        list.finish()
    }
}

fn check_slot(slot: usize) -> Result<(), Error> {
    if slot < NUM_SLOTS {
        Ok(())
    } else {
        Err(Error::OutOfRange { slot })
    }
}

/// A BLAKE3 commitment to a seed contribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
struct Commitment([u8; 32]);

/// Commits to a contribution, binding it to the rank of the committing party.
///
/// This is not a general-purpose commitment scheme, the input value is assumed to have high entropy.
fn commit(contribution: &Seed, rank: usize) -> Commitment {
    let mut hasher = blake3::Hasher::new();
    hasher.update(contribution);
    hasher.update(&(rank as u64).to_be_bytes());
    Commitment(hasher.finalize().into())
}

fn open_commitment(commitment: &Commitment, contribution: &Seed, rank: usize) -> bool {
    commit(contribution, rank) == *commitment
}

/// Agrees on one seed with the next and one with the previous party by two-party coin tossing.
///
/// Returns the seeds indexed by slot. Both partners of a pair contribute 32 random bytes and
/// commit to them before opening, so neither can bias the seed.
pub(crate) async fn agree_pairwise_seeds(
    channel: &mut dyn DynChannel,
    party: Party,
) -> Result<[Seed; NUM_SLOTS], Error> {
    let Party { rank, world_size } = party;
    if world_size < 2 {
        return Ok([random(), random()]);
    }
    let peers = [(rank + 1) % world_size, (rank + world_size - 1) % world_size];
    let own: [Seed; NUM_SLOTS] = [random(), random()];

    // Step 1) Commit to the own contributions, first towards the next, then the previous party.
    for slot in 0..NUM_SLOTS {
        let commitment = commit(&own[slot], rank);
        send_frame(channel, party, peers[slot], FrameKind::Object, &commitment).await?;
    }

    // Step 2) Receive the partners' commitments. A party's first message is meant for its next
    // party, so we read from the previous party first. With two parties both peers coincide
    // and this order pairs up the slots correctly.
    let mut commitments = [Commitment([0; 32]); NUM_SLOTS];
    for slot in [1, 0] {
        commitments[slot] = recv_frame(channel, party, peers[slot], FrameKind::Object).await?;
    }

    // Step 3) Open the own contributions.
    for slot in 0..NUM_SLOTS {
        send_frame(channel, party, peers[slot], FrameKind::Object, &own[slot]).await?;
    }

    // Step 4) Verify the openings and combine both contributions of each pair.
    let mut seeds = [[0; 32]; NUM_SLOTS];
    for slot in [1, 0] {
        let opening: Seed = recv_frame(channel, party, peers[slot], FrameKind::Object).await?;
        if !open_commitment(&commitments[slot], &opening, peers[slot]) {
            return Err(CommunicationError::InconsistentSeed { party: peers[slot] }.into());
        }
        seeds[slot] = std::array::from_fn(|i| own[slot][i] ^ opening[i]);
    }
    debug!(rank, next = peers[0], prev = peers[1], "agreed on pairwise generator seeds");
    Ok(seeds)
}
