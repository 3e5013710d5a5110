//! Frame executor: the per-frame compute/rasterizer hand-off.
//!
//! Each frame walks `Idle -> Acquired -> Dispatched -> Released -> Idle`:
//!
//! 1. Wait for the rasterizer to finish with the shared buffers, then acquire
//!    them into compute. Failure skips the frame; ownership is unchanged.
//! 2. Dispatch the kernel over exactly `particle_count` work items. Failure is
//!    reported but release is still attempted.
//! 3. Drain the queue, release the shared buffers, drain again. Failure drops
//!    the frame: the buffers stay `InTransition` and must not be drawn. The
//!    next frame drains the queue and retries the release before anything else.
//! 4. Back to `Idle`; the caller may draw.
//!
//! Every step blocks. A frame either completes or ends at `Idle` with all
//! objects still valid.

use tracing::{debug, error, warn};

use crate::backend::{ComputeBackend, RasterSession};
use crate::binder::KernelHandle;
use crate::buffers::Ownership;
use crate::context::ComputeContext;
use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Ownership hand-off on the context
// ---------------------------------------------------------------------------

impl<B: ComputeBackend> ComputeContext<B> {
    /// Acquire every live interop buffer into compute ownership.
    ///
    /// Requires all of them to be rasterizer-owned. The queue is drained
    /// after the acquire so the transfer is complete on return.
    pub fn acquire_shared(&mut self) -> Result<(), ProtocolError> {
        let queue = self.queue()?;
        let handles = self.buffers.interop();
        self.buffers
            .transition_from(&handles, Ownership::Rasterizer, Ownership::InTransition)?;
        let mems = self.buffers.interop_mems(&handles);

        if !mems.is_empty() {
            if let Err(status) = self.backend.enqueue_acquire_shared(queue, &mems) {
                self.buffers.transition(&handles, Ownership::Rasterizer)?;
                return Err(ProtocolError::AcquireFailed(status));
            }
        }

        if let Err(status) = self.backend.finish(queue) {
            // The acquire may have landed. Hand the buffers straight back; if
            // that fails too they stay in transition for the next frame.
            let restored = mems.is_empty()
                || (self.backend.enqueue_release_shared(queue, &mems).is_ok()
                    && self.backend.finish(queue).is_ok());
            if restored {
                self.buffers.transition(&handles, Ownership::Rasterizer)?;
            }
            return Err(ProtocolError::AcquireFailed(status));
        }

        self.buffers.transition(&handles, Ownership::Compute)
    }

    /// Return every interop buffer to the rasterizer.
    ///
    /// Requires all of them to be compute-owned. Drains the queue before the
    /// release and again after it. Any backend failure leaves the buffers
    /// `InTransition`.
    pub fn release_shared(&mut self) -> Result<(), ProtocolError> {
        let queue = self.queue()?;
        let handles = self.buffers.interop();
        self.buffers
            .transition_from(&handles, Ownership::Compute, Ownership::InTransition)?;
        let mems = self.buffers.interop_mems(&handles);

        self.backend.finish(queue).map_err(ProtocolError::ReleaseFailed)?;
        if !mems.is_empty() {
            self.backend
                .enqueue_release_shared(queue, &mems)
                .map_err(ProtocolError::ReleaseFailed)?;
        }
        self.backend.finish(queue).map_err(ProtocolError::ReleaseFailed)?;

        self.buffers.transition(&handles, Ownership::Rasterizer)
    }

    /// Resolve buffers left mid-hand-off by an earlier frame.
    ///
    /// Drains the queue fully, then retries the release. Returns how many
    /// buffers were recovered.
    pub fn resolve_stranded(&mut self) -> Result<usize, ProtocolError> {
        let stranded = self.buffers.stranded();
        if stranded.is_empty() {
            return Ok(0);
        }
        warn!(buffers = stranded.len(), "resolving stranded shared-buffer ownership");

        let queue = self.queue()?;
        let mems = self.buffers.interop_mems(&stranded);
        self.backend.finish(queue).map_err(ProtocolError::ReleaseFailed)?;
        self.backend
            .enqueue_release_shared(queue, &mems)
            .map_err(ProtocolError::ReleaseFailed)?;
        self.backend.finish(queue).map_err(ProtocolError::ReleaseFailed)?;

        self.buffers.transition(&stranded, Ownership::Rasterizer)?;
        Ok(stranded.len())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Protocol state within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    Idle,
    Acquired,
    Dispatched,
    Released,
}

/// How a frame ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Kernel ran and the buffers are back with the rasterizer.
    Completed,
    /// No update this frame; buffers are safe to draw.
    Skipped(ProtocolError),
    /// Ownership is unresolved; buffers must not be drawn.
    Dropped(ProtocolError),
}

/// Result of one [`FrameExecutor::run_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// Zero-based frame number.
    pub frame: u64,
    pub outcome: FrameOutcome,
    /// Every state visited, starting and ending at `Idle`.
    pub states: Vec<FrameState>,
    renderable: bool,
}

impl FrameReport {
    /// True when every interop buffer is owned by the rasterizer.
    pub fn renderable(&self) -> bool {
        self.renderable
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == FrameOutcome::Completed
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        match &self.outcome {
            FrameOutcome::Completed => None,
            FrameOutcome::Skipped(e) | FrameOutcome::Dropped(e) => Some(e),
        }
    }
}

/// Fixed-step simulation clock, advanced once per successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimClock {
    dt: f32,
    steps: u64,
    elapsed: f64,
}

impl SimClock {
    pub fn new(dt: f32) -> Self {
        Self { dt, steps: 0, elapsed: 0.0 }
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Simulated seconds.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    fn advance(&mut self) {
        self.steps += 1;
        self.elapsed += self.dt as f64;
    }
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub attempted: u64,
    pub completed: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub dispatch_failures: u64,
    /// Failed frames since the last completed one.
    pub consecutive_failures: u32,
}

impl FrameStats {
    fn record(&mut self, outcome: &FrameOutcome) {
        self.attempted += 1;
        match outcome {
            FrameOutcome::Completed => {
                self.completed += 1;
                self.consecutive_failures = 0;
                return;
            }
            FrameOutcome::Skipped(e) => {
                self.skipped += 1;
                if matches!(e, ProtocolError::DispatchFailed(_)) {
                    self.dispatch_failures += 1;
                }
            }
            FrameOutcome::Dropped(_) => self.dropped += 1,
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Failure reporting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePolicy {
    /// Consecutive failed frames before failures are logged at error level.
    pub escalation_threshold: u32,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self { escalation_threshold: 120 }
    }
}

/// Drives one kernel through the per-frame protocol.
#[derive(Debug, Clone)]
pub struct FrameExecutor {
    kernel: KernelHandle,
    global: usize,
    clock: SimClock,
    stats: FrameStats,
    policy: FramePolicy,
    state: FrameState,
    frame: u64,
}

impl FrameExecutor {
    /// `particle_count` is the dispatch size: one work item per particle.
    pub fn new(kernel: KernelHandle, particle_count: usize, dt: f32) -> Self {
        Self {
            kernel,
            global: particle_count,
            clock: SimClock::new(dt),
            stats: FrameStats::default(),
            policy: FramePolicy::default(),
            state: FrameState::Idle,
            frame: 0,
        }
    }

    pub fn with_policy(mut self, policy: FramePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn policy(&self) -> &FramePolicy {
        &self.policy
    }

    pub fn particle_count(&self) -> usize {
        self.global
    }

    /// Run one full frame.
    pub fn run_frame<B, R>(&mut self, ctx: &mut ComputeContext<B>, raster: &mut R) -> FrameReport
    where
        B: ComputeBackend,
        R: RasterSession + ?Sized,
    {
        let frame = self.frame;
        self.frame += 1;
        let mut states = vec![FrameState::Idle];
        self.state = FrameState::Idle;

        let outcome = self.walk(ctx, raster, &mut states);

        self.state = FrameState::Idle;
        if states.last() != Some(&FrameState::Idle) {
            states.push(FrameState::Idle);
        }
        self.stats.record(&outcome);
        self.log_outcome(frame, &outcome);

        FrameReport {
            frame,
            outcome,
            states,
            renderable: ctx.buffers().renderable(),
        }
    }

    fn walk<B, R>(&mut self, ctx: &mut ComputeContext<B>, raster: &mut R, states: &mut Vec<FrameState>) -> FrameOutcome
    where
        B: ComputeBackend,
        R: RasterSession + ?Sized,
    {
        if let Err(e) = ctx.resolve_stranded() {
            return FrameOutcome::Dropped(e);
        }
        if let Some(slot) = ctx.first_unbound(self.kernel) {
            return FrameOutcome::Skipped(ProtocolError::UnboundArgument { slot });
        }

        // Idle -> Acquired
        raster.finish();
        if let Err(e) = ctx.acquire_shared() {
            return if ctx.buffers().renderable() {
                FrameOutcome::Skipped(e)
            } else {
                FrameOutcome::Dropped(e)
            };
        }
        self.enter(FrameState::Acquired, states);

        // Acquired -> Dispatched
        let dispatch = ctx.dispatch(self.kernel, self.global);
        if dispatch.is_ok() {
            // The particles have moved even if the release below fails.
            self.clock.advance();
        }
        self.enter(FrameState::Dispatched, states);

        // Dispatched -> Released
        if let Err(e) = ctx.release_shared() {
            return FrameOutcome::Dropped(e);
        }
        self.enter(FrameState::Released, states);
        self.enter(FrameState::Idle, states);

        match dispatch {
            Ok(()) => FrameOutcome::Completed,
            Err(e) => FrameOutcome::Skipped(e),
        }
    }

    fn enter(&mut self, next: FrameState, states: &mut Vec<FrameState>) {
        debug!(frame = self.frame - 1, from = ?self.state, to = ?next, "frame transition");
        self.state = next;
        states.push(next);
    }

    fn log_outcome(&self, frame: u64, outcome: &FrameOutcome) {
        let (kind, err) = match outcome {
            FrameOutcome::Completed => return,
            FrameOutcome::Skipped(e) => ("skipped", e),
            FrameOutcome::Dropped(e) => ("dropped", e),
        };
        let consecutive = self.stats.consecutive_failures;
        if consecutive >= self.policy.escalation_threshold {
            error!(frame, consecutive, "frame {kind}: {err}");
        } else {
            warn!(frame, consecutive, "frame {kind}: {err}");
        }
    }
}
