//! First-success race over two spawned tasks.
//!
//! The losing task is detached rather than aborted: it keeps running and its
//! side effects (for example a store write) still happen.

use tokio::task::{JoinError, JoinHandle};

/// Why one side of a race produced no value.
#[derive(Debug)]
pub(crate) enum Branch<E> {
    Rejected(E),
    Aborted(String),
}

/// Both sides of a race failed.
#[derive(Debug)]
pub(crate) struct BothFailed<A, B> {
    pub(crate) left: Branch<A>,
    pub(crate) right: Branch<B>,
}

fn settle<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<T, Branch<E>> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Branch::Rejected(err)),
        Err(err) => Err(Branch::Aborted(err.to_string())),
    }
}

/// Resolve with whichever task succeeds first.
///
/// A failing task does not decide the race while the other one may still
/// succeed; only when both fail is the pair of failures returned.
pub(crate) async fn first_success<T, A, B>(
    mut left: JoinHandle<Result<T, A>>,
    mut right: JoinHandle<Result<T, B>>,
) -> Result<T, BothFailed<A, B>> {
    tokio::select! {
        joined = &mut left => match settle(joined) {
            Ok(value) => Ok(value),
            Err(left) => settle(right.await).map_err(|right| BothFailed { left, right }),
        },
        joined = &mut right => match settle(joined) {
            Ok(value) => Ok(value),
            Err(right) => settle(left.await).map_err(|left| BothFailed { left, right }),
        },
    }
}
