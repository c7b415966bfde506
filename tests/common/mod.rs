#![allow(dead_code)]

use std::{future::Future, sync::Arc};

use partycomm::{Communicator, CommunicatorOptions, Error, channel::SimpleChannel};
use tracing_subscriber::EnvFilter;

/// Installs a subscriber once, so that `RUST_LOG=partycomm=trace` shows the frames.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Creates the communicators of `n` parties connected by a [`SimpleChannel`] mesh.
pub fn communicators(n: usize) -> Vec<Arc<Communicator>> {
    init_tracing();
    SimpleChannel::channels(n)
        .into_iter()
        .enumerate()
        .map(|(rank, channel)| {
            let options = CommunicatorOptions::new(rank, n);
            Arc::new(Communicator::new(options, channel).expect("valid options"))
        })
        .collect()
}

/// Runs `party` concurrently for every communicator and returns the results ordered by rank.
pub async fn run_on<F, Fut, R>(comms: &[Arc<Communicator>], party: F) -> Vec<R>
where
    F: Fn(Arc<Communicator>) -> Fut,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = comms
        .iter()
        .map(|comm| tokio::spawn(party(Arc::clone(comm))))
        .collect();
    let mut results = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.await.expect("party panicked") {
            Ok(result) => results.push(result),
            Err(e) => panic!("party {rank} failed: {e}"),
        }
    }
    results
}

/// Creates `n` parties and runs `party` for each of them.
pub async fn run_parties<F, Fut, R>(n: usize, party: F) -> Vec<R>
where
    F: Fn(Arc<Communicator>) -> Fut,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
    R: Send + 'static,
{
    run_on(&communicators(n), party).await
}
