//! Watchdog handles are created from the client by users of the library,
//! to communicate with the running state machine.

use async_trait::async_trait;

use pgward_types::consensus::FailoverKind;
use pgward_types::ipc::{
    FailoverPhase, IpcResponse, NodeStatus, NodesListResponse, RuntimeValue, RuntimeVariable,
};
use pgward_types::messages::RecoveryPhase;
use pgward_types::node::NodeId;

use crate::client::Error;

/// A handle for communicating with the watchdog state machine.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Submit a backend failover request to the consensus engine.
    async fn failover(
        &self,
        kind: FailoverKind,
        node_ids: Vec<i32>,
        flags: u8,
    ) -> Result<IpcResponse, Error>;

    /// Replicate an online-recovery phase change across the cluster.
    async fn online_recovery(
        &self,
        phase: RecoveryPhase,
        node_id: i32,
    ) -> Result<IpcResponse, Error>;

    /// Enumerate all watchdog nodes.
    async fn nodes_list(&self) -> Result<NodesListResponse, Error>;

    /// Read one runtime variable.
    async fn runtime_variable(&self, name: RuntimeVariable) -> Result<RuntimeValue, Error>;

    /// Inject a node liveness change from the lifecheck.
    async fn node_status_change(&self, node_id: NodeId, status: NodeStatus) -> Result<(), Error>;

    /// Signal the start or end of a failover executing locally.
    async fn failover_indication(
        &self,
        phase: FailoverPhase,
        primary_quarantined: bool,
    ) -> Result<(), Error>;

    /// Fetch the coordinator's cluster view.
    async fn master_data(&self) -> Result<IpcResponse, Error>;

    /// Inform the cluster we are going down and release the VIP.
    async fn shutdown(&self) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn failover(
            &self,
            kind: FailoverKind,
            node_ids: Vec<i32>,
            flags: u8,
        ) -> Result<IpcResponse, Error>;
        async fn online_recovery(
            &self,
            phase: RecoveryPhase,
            node_id: i32,
        ) -> Result<IpcResponse, Error>;
        async fn nodes_list(&self) -> Result<NodesListResponse, Error>;
        async fn runtime_variable(&self, name: RuntimeVariable) -> Result<RuntimeValue, Error>;
        async fn node_status_change(&self, node_id: NodeId, status: NodeStatus) -> Result<(), Error>;
        async fn failover_indication(
            &self,
            phase: FailoverPhase,
            primary_quarantined: bool,
        ) -> Result<(), Error>;
        async fn master_data(&self) -> Result<IpcResponse, Error>;
        async fn shutdown(&self) -> Result<(), Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_handle_constructs() {
        let mut _mock = MockHandle::new();
    }
}
