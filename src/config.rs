//! Options for constructing a communicator.

use serde::{Deserialize, Serialize};

use crate::{error::InitializationError, stats::BYTES_PER_ELEMENT};

/// Options describing the own party and the world it belongs to.
///
/// The options are typically deserialized from a configuration file or assembled from
/// environment variables by the caller. They are only validated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorOptions {
    /// The rank of the own party, between `0..world_size`.
    pub rank: usize,
    /// The total number of parties.
    pub world_size: usize,
    /// The name of the own party, defaults to `rank{rank}`.
    pub name: Option<String>,
    /// The width of a payload element in bytes, used for byte accounting.
    pub bytes_per_element: u64,
    /// Sets the process-wide verbosity when present.
    pub verbose: Option<bool>,
}

impl CommunicatorOptions {
    /// Options for party `rank` in a world of `world_size` parties.
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size,
            ..Default::default()
        }
    }

    /// Sets the party name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the process-wide verbosity when the communicator is constructed.
    pub fn with_verbosity(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    /// Checks that the options describe a valid party.
    pub fn validate(&self) -> Result<(), InitializationError> {
        if self.world_size == 0 {
            return Err(InitializationError::EmptyWorld);
        }
        if self.rank >= self.world_size {
            return Err(InitializationError::RankOutOfRange {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        if self.bytes_per_element == 0 {
            return Err(InitializationError::ZeroElementWidth);
        }
        Ok(())
    }

    /// The configured name or the default name derived from the rank.
    pub(crate) fn party_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("rank{}", self.rank))
    }
}

impl Default for CommunicatorOptions {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            name: None,
            bytes_per_element: BYTES_PER_ELEMENT,
            verbose: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_single_party() {
        let options = CommunicatorOptions::default();
        assert_eq!(options.validate(), Ok(()));
        assert_eq!(options.party_name(), "rank0");
    }

    #[test]
    fn rejects_invalid_worlds() {
        assert_eq!(
            CommunicatorOptions::new(0, 0).validate(),
            Err(InitializationError::EmptyWorld)
        );
        assert_eq!(
            CommunicatorOptions::new(3, 3).validate(),
            Err(InitializationError::RankOutOfRange {
                rank: 3,
                world_size: 3
            })
        );
        let options = CommunicatorOptions {
            bytes_per_element: 0,
            ..CommunicatorOptions::new(0, 2)
        };
        assert_eq!(options.validate(), Err(InitializationError::ZeroElementWidth));
    }

    #[test]
    fn explicit_name_wins() {
        let options = CommunicatorOptions::new(1, 2).with_name("alice");
        assert_eq!(options.party_name(), "alice");
    }
}
