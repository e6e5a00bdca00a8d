//! Forward-only state machine runner.
//!
//! An [`Operation`] is a dense list of states indexed from zero. The
//! [`Sequencer`] enters them in order, one at a time, until a state
//! completes or fails the run or the last state hands over with
//! [`Step::Next`]. Each run reports exactly one outcome.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::CancelToken;

/// What a state handler wants to happen next.
#[derive(Debug)]
pub enum Step {
    /// Advance to the following state; after the last one the run completes.
    Next,
    /// Finish the run successfully, skipping any remaining states.
    Complete,
    /// Abort the run.
    Fail(Error),
}

impl From<Result<()>> for Step {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Step::Next,
            Err(err) => Step::Fail(err),
        }
    }
}

/// A logical device operation expressed as ordered states.
#[allow(async_fn_in_trait)]
pub trait Operation {
    type State: TryFrom<u8> + Copy + Debug;
    type Context;

    const NAME: &'static str;
    const NUM_STATES: u8;

    async fn run_state(&mut self, state: Self::State, ctx: &mut Self::Context) -> Step;
}

/// Runs operations, at most one at a time.
///
/// Clones share the same run slot.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    running: Arc<AtomicBool>,
}

/// Holds the run slot; releases it when dropped, including when the run
/// future is dropped mid-state.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the run slot. Fails without waiting if a run is active.
    pub fn try_begin(&self, name: &str) -> Result<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ProtocolState(format!("cannot start {name}: another operation is running")))?;
        Ok(RunGuard {
            running: Arc::clone(&self.running),
        })
    }

    /// Run `op` to its terminal outcome and hand that outcome to
    /// `completion` exactly once before returning it.
    pub async fn run<O, F>(&self, op: &mut O, ctx: &mut O::Context, cancel: &CancelToken, completion: F) -> Result<()>
    where
        O: Operation,
        F: FnOnce(&Result<()>),
    {
        let result = match self.try_begin(O::NAME) {
            Ok(_guard) => Self::drive(op, ctx, cancel).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => info!(operation = O::NAME, "Operation complete"),
            Err(err) => warn!(operation = O::NAME, kind = %err.kind(), "Operation failed: {}", err),
        }
        completion(&result);
        result
    }

    /// [`run`](Self::run) without a completion callback.
    pub async fn execute<O: Operation>(&self, op: &mut O, ctx: &mut O::Context, cancel: &CancelToken) -> Result<()> {
        self.run(op, ctx, cancel, |_| {}).await
    }

    async fn drive<O: Operation>(op: &mut O, ctx: &mut O::Context, cancel: &CancelToken) -> Result<()> {
        for index in 0..O::NUM_STATES {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let state = O::State::try_from(index)
                .map_err(|_| Error::ProtocolState(format!("{} has no state {index}", O::NAME)))?;

            debug!(operation = O::NAME, state = ?state, "Entering state");
            match op.run_state(state, ctx).await {
                Step::Next => {}
                Step::Complete => return Ok(()),
                Step::Fail(err) => return Err(err),
            }
        }
        Ok(())
    }
}
