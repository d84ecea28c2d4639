//! Blocking Operation Coordinator
//!
//! Turns "send a command, the board answers some time later with one report"
//! into a single awaited call. Every resource (a stepper axis, the board's
//! query channel) owns a [`ResourceSlot`]: a one-permit semaphore. A
//! [`PendingOperation`] holds that permit together with the one-shot receiver
//! for the expected completion report.
//!
//! ## Lifecycle
//!
//! ```text
//! begin() -> slot acquired, completion registered
//!         -> caller issues commands
//! wait()  -> report     : permit released when the operation is dropped
//!         -> Timeout    : permit stays held by a detached task until the
//!                         late report arrives or the session shuts down
//!         -> Aborted    : session shut down, permit released
//! ```
//!
//! The firmware cannot cancel a motion, so a timed-out slot is never handed
//! to a new caller before the real completion arrives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::protocol::{FrameKind, Report};
use crate::session::Session;

/// What to do when a resource slot is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail immediately with `Busy`
    #[default]
    Reject,
    /// Wait for the slot, up to the operation timeout, then fail with `Busy`
    Wait,
}

/// Mutual-exclusion unit for one resource.
#[derive(Debug, Clone)]
pub struct ResourceSlot {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
}

impl ResourceSlot {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Resource name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while an operation (possibly a timed-out one) owns the slot.
    pub fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// Creates slots and runs blocking operations against one session.
#[derive(Clone)]
pub struct Coordinator {
    session: Session,
    policy: BusyPolicy,
    timeout: Duration,
}

impl Coordinator {
    /// New coordinator with the given busy policy and completion timeout.
    pub fn new(session: Session, policy: BusyPolicy, timeout: Duration) -> Self {
        Self {
            session,
            policy,
            timeout,
        }
    }

    /// Busy policy in effect.
    pub fn policy(&self) -> BusyPolicy {
        self.policy
    }

    /// Completion timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a slot whose lifetime is bound to the session.
    pub fn slot(&self, name: &str) -> ResourceSlot {
        let slot = ResourceSlot::new(name);
        self.session.track_slot(slot.semaphore.clone());
        slot
    }

    /// Acquire `slot` and arm a one-shot for the next `(kind, channel)` report.
    ///
    /// The operation timeout runs from this call: time spent waiting for the
    /// slot under [`BusyPolicy::Wait`] is deducted from the completion wait.
    pub async fn begin(
        &self,
        slot: &ResourceSlot,
        kind: FrameKind,
        channel: u8,
    ) -> ControllerResult<PendingOperation> {
        let deadline = Instant::now() + self.timeout;
        let permit = match self.policy {
            BusyPolicy::Reject => slot
                .semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    TryAcquireError::Closed => ControllerError::Aborted(slot.name().to_string()),
                    TryAcquireError::NoPermits => ControllerError::Busy(slot.name().to_string()),
                })?,
            BusyPolicy::Wait => {
                match tokio::time::timeout_at(deadline, slot.semaphore.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(ControllerError::Aborted(slot.name().to_string())),
                    Err(_) => return Err(ControllerError::Busy(slot.name().to_string())),
                }
            }
        };

        let completion = self.session.register_once(kind, channel);
        debug!(resource = slot.name(), ?kind, channel, "operation started");

        Ok(PendingOperation {
            resource: slot.name.clone(),
            timeout: self.timeout,
            deadline,
            permit: Some(permit),
            completion: Some(completion),
        })
    }

    /// Acquire `slot`, run `command_fn`, and wait for the completion report.
    ///
    /// A failing `command_fn` releases the slot immediately: nothing reached
    /// the board that could still answer.
    pub async fn run_blocking<F, Fut>(
        &self,
        slot: &ResourceSlot,
        kind: FrameKind,
        channel: u8,
        command_fn: F,
    ) -> ControllerResult<Report>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = ControllerResult<()>>,
    {
        let mut op = self.begin(slot, kind, channel).await?;
        if let Err(e) = command_fn(self.session.clone()).await {
            op.abandon();
            return Err(e);
        }
        op.wait().await
    }
}

/// An in-flight operation owning its resource slot.
///
/// Dropping it releases the slot, unless the completion is still
/// outstanding after a timeout; then the slot is held until that report
/// arrives.
#[derive(Debug)]
pub struct PendingOperation {
    resource: Arc<str>,
    timeout: Duration,
    deadline: Instant,
    permit: Option<OwnedSemaphorePermit>,
    completion: Option<oneshot::Receiver<Report>>,
}

impl PendingOperation {
    /// Resource this operation holds.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Wait for the completion report.
    pub async fn wait(&mut self) -> ControllerResult<Report> {
        let completion = self
            .completion
            .as_mut()
            .ok_or_else(|| ControllerError::Aborted(self.resource.to_string()))?;

        match tokio::time::timeout_at(self.deadline, completion).await {
            Ok(Ok(report)) => {
                self.completion = None;
                debug!(resource = %self.resource, "operation completed");
                Ok(report)
            }
            Ok(Err(_)) => {
                self.completion = None;
                Err(ControllerError::Aborted(self.resource.to_string()))
            }
            Err(_) => {
                warn!(resource = %self.resource, timeout = ?self.timeout, "completion not received in time");
                Err(ControllerError::Timeout {
                    resource: self.resource.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Give up on the completion and release the slot now.
    pub fn abandon(mut self) {
        self.completion = None;
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        let (Some(completion), Some(permit)) = (self.completion.take(), self.permit.take()) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let resource = self.resource.clone();
        info!(resource = %resource, "holding slot until late completion arrives");
        runtime.spawn(async move {
            let late = completion.await;
            drop(permit);
            debug!(resource = %resource, delivered = late.is_ok(), "slot released after late completion");
        });
    }
}
