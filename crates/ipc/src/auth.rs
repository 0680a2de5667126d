//! IPC client authentication.

use pgward_types::ipc::{IpcCommandType, IpcCredentials};

/// The error string sent back on any authentication failure. Stable: the
/// middleware's CLI tools match on it.
pub const AUTH_FAILED: &str = "authentication failed: invalid KEY";

/// Authenticate one IPC request.
///
/// Internal-only commands demand the process shared key. Everything else
/// passes with the shared key, with the configured auth key, or freely when
/// no auth key is configured.
pub fn authenticate(
    ty: IpcCommandType,
    credentials: &IpcCredentials,
    shared_key: u32,
    auth_key: Option<&str>,
) -> Result<(), &'static str> {
    let has_shared = credentials.shared_key == Some(shared_key);

    if ty.is_internal_only() {
        return if has_shared { Ok(()) } else { Err(AUTH_FAILED) };
    }

    let Some(auth_key) = auth_key else {
        return Ok(());
    };
    if has_shared || credentials.auth_key.as_deref() == Some(auth_key) {
        Ok(())
    } else {
        Err(AUTH_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(shared: Option<u32>, auth: Option<&str>) -> IpcCredentials {
        IpcCredentials {
            shared_key: shared,
            auth_key: auth.map(|s| s.to_string()),
        }
    }

    #[test]
    fn internal_commands_demand_the_shared_key() {
        let ty = IpcCommandType::FailoverCommand;

        assert!(authenticate(ty, &credentials(Some(7), None), 7, None).is_ok());
        assert!(authenticate(ty, &credentials(Some(8), None), 7, None).is_err());
        // The configured auth key is not enough for internal commands.
        assert!(authenticate(ty, &credentials(None, Some("key")), 7, Some("key")).is_err());
    }

    #[test]
    fn external_commands_accept_either_key() {
        let ty = IpcCommandType::GetNodesList;

        assert!(authenticate(ty, &credentials(Some(7), None), 7, Some("key")).is_ok());
        assert!(authenticate(ty, &credentials(None, Some("key")), 7, Some("key")).is_ok());
        assert!(authenticate(ty, &credentials(None, Some("bad")), 7, Some("key")).is_err());
    }

    #[test]
    fn external_commands_are_open_without_an_auth_key() {
        let ty = IpcCommandType::GetNodesList;

        assert!(authenticate(ty, &credentials(None, None), 7, None).is_ok());
    }

    /// An external client submitting a failover with no credentials while
    /// an auth key is configured must be turned away.
    #[test]
    fn unauthenticated_failover_is_rejected() {
        let err = authenticate(
            IpcCommandType::FailoverCommand,
            &credentials(None, None),
            7,
            Some("key"),
        )
        .unwrap_err();

        assert_eq!(err, AUTH_FAILED);
    }
}
