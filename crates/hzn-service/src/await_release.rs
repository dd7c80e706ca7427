//! Bounded waiting on external state change.
//!
//! [`await_first`] races a change stream against a deadline and resolves with
//! the first item the caller accepts. Dropping the returned future cancels
//! both the timer and the pending stream poll; the stream itself stays with
//! the caller.

use std::time::Duration;

use futures::{Stream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The first accepted item.
    Matched(T),
    TimedOut,
    /// The stream ended before an item was accepted.
    Closed,
}

/// Wait at most `deadline` for an item of `stream` for which `accept` returns
/// true. Rejected items are discarded. The first stream error ends the wait.
pub async fn await_first<S, T, E, P>(
    stream: &mut S,
    deadline: Duration,
    mut accept: P,
) -> Result<WaitOutcome<T>, E>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    P: FnMut(&T) -> bool,
{
    let wait = async {
        while let Some(item) = stream.next().await {
            let item = item?;
            if accept(&item) {
                return Ok(WaitOutcome::Matched(item));
            }
        }
        Ok::<WaitOutcome<T>, E>(WaitOutcome::Closed)
    };
    match tokio::time::timeout(deadline, wait).await {
        Ok(outcome) => outcome,
        Err(_) => Ok(WaitOutcome::TimedOut),
    }
}
