//! Escalation: acquiring and releasing the virtual IP through helper
//! processes.
//!
//! The helpers run as child processes so a crash inside a site script can
//! never take the watchdog down, and so the commands can carry whatever
//! privileges the OS requires.

use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// How long to wait for the opposite helper to exit before spawning anyway.
pub const HELPER_EXIT_WAIT_SECS: u64 = 5;

/// Escalation configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The virtual IP the coordinator owns. May be empty.
    pub delegate_ip: String,
    /// Shell command acquiring the VIP (and running any site script).
    /// `{ip}` is replaced with the delegate IP.
    pub acquire_command: Option<String>,
    /// Shell command releasing the VIP.
    pub release_command: Option<String>,
}

/// Tracks the escalation helpers and the VIP ownership flags.
#[derive(Debug, Default)]
pub struct EscalationManager {
    config: Config,
    escalation: Option<Child>,
    de_escalation: Option<Child>,
    /// The local node went through escalation and did not resign yet.
    pub escalated: bool,
    /// The local node believes it holds the virtual IP.
    pub holding_vip: bool,
}

impl EscalationManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Acquire the VIP. Waits for a still-running de-escalation helper for
    /// a bounded time, then proceeds regardless.
    pub fn escalate(&mut self) {
        if self.escalated {
            return;
        }

        if wait_for_exit(&mut self.de_escalation, HELPER_EXIT_WAIT_SECS) {
            warn!(target: "wd", "de-escalation helper did not exit in time, escalating anyway");
        }

        match self.spawn(self.config.acquire_command.as_deref()) {
            Some(child) => {
                info!(target: "wd", "escalation helper started with pid {}", child.id());
                self.escalation = Some(child);
            }
            None => info!(target: "wd", "no escalation command configured"),
        }

        self.escalated = true;
        if !self.config.delegate_ip.is_empty() {
            self.holding_vip = true;
        }
    }

    /// Release the VIP. The mirror image of [`EscalationManager::escalate`].
    pub fn de_escalate(&mut self) {
        if !self.escalated {
            return;
        }

        if wait_for_exit(&mut self.escalation, HELPER_EXIT_WAIT_SECS) {
            warn!(target: "wd", "escalation helper did not exit in time, de-escalating anyway");
        }

        match self.spawn(self.config.release_command.as_deref()) {
            Some(child) => {
                info!(target: "wd", "de-escalation helper started with pid {}", child.id());
                self.de_escalation = Some(child);
            }
            None => info!(target: "wd", "no de-escalation command configured"),
        }

        self.escalated = false;
        self.holding_vip = false;
    }

    /// Re-run the acquire helper. Used when the VIP silently vanished from
    /// the interface while we are still the coordinator.
    pub fn reacquire(&mut self) {
        if !self.escalated {
            return;
        }
        warn!(target: "wd", "virtual IP is missing, re-running the acquire helper");

        if let Some(child) = self.spawn(self.config.acquire_command.as_deref()) {
            self.escalation = Some(child);
        }
    }

    /// Reap finished helpers. Called once per loop tick.
    pub fn reap(&mut self) {
        for slot in [&mut self.escalation, &mut self.de_escalation] {
            if let Some(child) = slot {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(target: "wd", "escalation helper {} exited with {}", child.id(), status);
                        *slot = None;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: "wd", "failed to reap escalation helper: {}", err);
                        *slot = None;
                    }
                }
            }
        }
    }

    fn spawn(&self, command: Option<&str>) -> Option<Child> {
        let command = command?.replace("{ip}", &self.config.delegate_ip);

        match Command::new("sh").arg("-c").arg(&command).spawn() {
            Ok(child) => Some(child),
            Err(err) => {
                warn!(target: "wd", "failed to start escalation helper: {}", err);
                None
            }
        }
    }
}

/// Wait for a helper to exit, polling once per second up to `secs`.
/// Returns `true` if it is still running afterwards.
fn wait_for_exit(slot: &mut Option<Child>, secs: u64) -> bool {
    let Some(child) = slot else {
        return false;
    };

    for _ in 0..secs {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => {
                *slot = None;
                return false;
            }
            Ok(None) => thread::sleep(Duration::from_secs(1)),
        }
    }
    matches!(child.try_wait(), Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalate_sets_the_flags() {
        let mut mgr = EscalationManager::new(Config {
            delegate_ip: "10.0.0.100".into(),
            acquire_command: Some("true".into()),
            release_command: Some("true".into()),
        });

        mgr.escalate();
        assert!(mgr.escalated);
        assert!(mgr.holding_vip);

        // Idempotent while escalated.
        mgr.escalate();
        assert!(mgr.escalated);

        mgr.de_escalate();
        assert!(!mgr.escalated);
        assert!(!mgr.holding_vip);
    }

    #[test]
    fn empty_delegate_ip_never_claims_the_vip() {
        let mut mgr = EscalationManager::new(Config::default());

        mgr.escalate();
        assert!(mgr.escalated);
        assert!(!mgr.holding_vip);
    }
}
