use std::sync::Arc;

use anyhow::bail;
use tokio::sync::watch;
use tracing::info;


/// The router's lifecycle. Phases only ever move forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Phase {
    Running,
    /// no new work is accepted, queued work is still delivered
    Draining,
    /// everything stops, whatever is still queued is reported back as failed
    Dead,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownMode {
    /// deliver queued messages to connected peers (within the grace period) before stopping
    Drain,
    /// report every queued message as failed right away
    FailAll,
}

/// Shared view of the router's lifecycle phase and suspension state. All long-running tasks
///  hold a clone and use it to find out when to stop, or to park while the router is suspended.
#[derive(Clone, Debug)]
pub struct ShutdownContext {
    phase: Arc<watch::Sender<Phase>>,
    suspended: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownContext {
    pub fn new() -> ShutdownContext {
        let (phase, _) = watch::channel(Phase::Running);
        let (suspended, _) = watch::channel(false);
        ShutdownContext {
            phase: Arc::new(phase),
            suspended: Arc::new(suspended),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_terminating(&self) -> bool {
        self.phase() != Phase::Running
    }

    /// Moves the lifecycle forward to `new_phase`. Returns false if the current phase is already
    ///  at or past `new_phase`. Leaving [Phase::Running] lifts a suspension so that parked tasks
    ///  can observe the shutdown.
    pub fn set_phase(&self, new_phase: Phase) -> bool {
        let changed = self.phase.send_if_modified(|phase| {
            if new_phase > *phase {
                *phase = new_phase;
                true
            }
            else {
                false
            }
        });

        if changed {
            info!("router phase is now {:?}", new_phase);
            self.suspended.send_replace(false);
        }
        changed
    }

    /// Completes when the lifecycle reached (or passed) `phase`
    pub async fn wait_for(&self, phase: Phase) {
        let mut receiver = self.phase.subscribe();
        // the sender is owned by self, so the channel can not be closed while we wait
        let _ = receiver.wait_for(|p| *p >= phase).await;
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    pub fn suspend(&self) -> anyhow::Result<()> {
        if self.is_terminating() {
            bail!("cannot suspend while {:?}", self.phase());
        }
        let changed = self.suspended.send_if_modified(|suspended| {
            let was_suspended = *suspended;
            *suspended = true;
            !was_suspended
        });
        if !changed {
            bail!("already suspended");
        }
        info!("suspended");
        Ok(())
    }

    pub fn resume(&self) -> anyhow::Result<()> {
        if self.is_terminating() {
            bail!("cannot resume while {:?}", self.phase());
        }
        let changed = self.suspended.send_if_modified(|suspended| {
            let was_suspended = *suspended;
            *suspended = false;
            was_suspended
        });
        if !changed {
            bail!("not suspended");
        }
        info!("resumed");
        Ok(())
    }

    /// Parks the caller for as long as the router is suspended
    pub async fn wait_while_suspended(&self) {
        let mut receiver = self.suspended.subscribe();
        let _ = receiver.wait_for(|suspended| !*suspended).await;
    }
}
