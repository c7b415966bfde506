//! The process-wide communicator.
//!
//! Code that cannot thread a [`Communicator`] through its call graph can use the one installed
//! here. It is installed once with [`initialize`], looked up with [`get`] and removed with
//! [`shutdown`], after which a new one may be installed.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::{
    channel::Channel,
    communicator::Communicator,
    config::CommunicatorOptions,
    error::{Error, Violation},
};

/// A shared reference to the process-wide communicator.
pub type Handle = Arc<Communicator>;

static COMMUNICATOR: RwLock<Option<Handle>> = RwLock::new(None);

/// Whether a process-wide communicator is installed.
pub fn is_initialized() -> bool {
    COMMUNICATOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Returns the process-wide communicator.
///
/// Fails with [`Error::NotInitialized`] unless [`initialize`] has been called.
pub fn get() -> Result<Handle, Error> {
    COMMUNICATOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::NotInitialized)
}

/// Creates the communicator of the party described by `options` and installs it for the whole
/// process.
///
/// Fails with [`Violation::AlreadyInitialized`] if a communicator is already installed, leaving
/// it untouched.
pub fn initialize<C>(options: CommunicatorOptions, channel: C) -> Result<Handle, Error>
where
    C: Channel + Send + 'static,
    C::SendError: Send,
    C::RecvError: Send,
{
    let mut installed = COMMUNICATOR.write().unwrap_or_else(PoisonError::into_inner);
    if installed.is_some() {
        return Err(Violation::AlreadyInitialized.into());
    }
    let communicator = Arc::new(Communicator::new(options, channel)?);
    info!(
        rank = communicator.get_rank(),
        world_size = communicator.get_world_size(),
        "initialized communicator"
    );
    *installed = Some(Arc::clone(&communicator));
    Ok(communicator)
}

/// Uninstalls the process-wide communicator and closes it.
///
/// Handles obtained earlier stay valid, but all of their operations fail from now on.
pub async fn shutdown() -> Result<(), Error> {
    let communicator = COMMUNICATOR
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(Error::NotInitialized)?;
    communicator.close().await;
    info!(rank = communicator.get_rank(), "shut down communicator");
    Ok(())
}
