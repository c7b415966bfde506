use tokio::task::JoinHandle;

use crate::error::{CommunicationError, Error};

/// A handle to an operation issued in the background by one of the `*_async` methods.
///
/// The operation keeps exclusive access to the channel until it completes, so later operations
/// of the same communicator are executed after it. Its result must be retrieved with
/// [`PendingOp::wait`].
#[derive(Debug)]
#[must_use = "background operations must be awaited with `wait`"]
pub struct PendingOp<T> {
    state: State<T>,
}

#[derive(Debug)]
enum State<T> {
    Ready(T),
    Running(JoinHandle<Result<T, Error>>),
}

impl<T> PendingOp<T> {
    pub(crate) fn ready(value: T) -> Self {
        Self {
            state: State::Ready(value),
        }
    }

    pub(crate) fn running(task: JoinHandle<Result<T, Error>>) -> Self {
        Self {
            state: State::Running(task),
        }
    }

    /// Whether the operation has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Ready(_) => true,
            State::Running(task) => task.is_finished(),
        }
    }

    /// Waits for the operation to complete and returns its result.
    pub async fn wait(self) -> Result<T, Error> {
        match self.state {
            State::Ready(value) => Ok(value),
            State::Running(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(CommunicationError::Task(e.to_string()).into()),
            },
        }
    }
}
