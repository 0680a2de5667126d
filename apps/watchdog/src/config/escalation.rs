use serde::Deserialize;

use pgward_watchdog::fsm::escalation;

/// Virtual IP escalation.
#[derive(Deserialize, Clone, Default)]
pub struct EscalationConfig {
    /// The virtual IP owned by the cluster coordinator. Empty disables VIP
    /// handling; the commands below still run.
    #[serde(default)]
    pub delegate_ip: String,

    /// Shell command acquiring the VIP; `{ip}` expands to the delegate IP.
    #[serde(default)]
    pub acquire_command: Option<String>,

    /// Shell command releasing the VIP.
    #[serde(default)]
    pub release_command: Option<String>,
}

impl EscalationConfig {
    pub fn to_escalation_config(&self) -> escalation::Config {
        escalation::Config {
            delegate_ip: self.delegate_ip.clone(),
            acquire_command: self.acquire_command.clone(),
            release_command: self.release_command.clone(),
        }
    }
}
