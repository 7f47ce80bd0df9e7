//! Forward orchestration over one or more tunnels

use playctl_proto::{ForwardingSpec, PortForward};
use playctl_transport::TransportError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::group::{GroupPolicy, TaskGroup};
use crate::tunnel::{Tunnel, TunnelAuthenticator, TunnelError};

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Starts tunnels and fans specs out over them
#[derive(Debug, Clone)]
pub struct ForwardOrchestrator {
    authenticator: Arc<TunnelAuthenticator>,
}

impl ForwardOrchestrator {
    pub fn new(authenticator: Arc<TunnelAuthenticator>) -> Self {
        Self { authenticator }
    }

    pub fn authenticator(&self) -> &Arc<TunnelAuthenticator> {
        &self.authenticator
    }

    /// One tunnel to `machine`, every spec forwarded concurrently.
    /// The first forward to fail ends all of them.
    pub async fn forward(
        &self,
        cancel: &CancellationToken,
        play_id: &str,
        machine: &str,
        specs: Vec<ForwardingSpec>,
    ) -> Result<(), TunnelError> {
        let tunnel = self
            .authenticator
            .start_tunnel(cancel, play_id, machine)
            .await?;
        forward_all(cancel, Arc::new(tunnel), specs).await
    }

    /// Fetch the play's persisted forwards and restore them
    pub async fn restore_play(
        &self,
        cancel: &CancellationToken,
        play_id: &str,
    ) -> Result<oneshot::Receiver<Result<(), TunnelError>>, TunnelError> {
        let forwards = self
            .authenticator
            .api()
            .list_port_forwards(play_id)
            .await
            .map_err(TunnelError::ListForwards)?;
        Ok(self.restore(cancel, play_id, forwards))
    }

    /// Restore persisted forwards in the background, one tunnel per machine.
    ///
    /// The receiver yields the first machine error as soon as it happens
    /// while the other machines keep forwarding, or `Ok(())` once every
    /// machine group has ended without one.
    pub fn restore(
        &self,
        cancel: &CancellationToken,
        play_id: &str,
        forwards: Vec<PortForward>,
    ) -> oneshot::Receiver<Result<(), TunnelError>> {
        let by_machine = group_by_machine(forwards);
        let (result_tx, result_rx) = oneshot::channel();

        let mut machines: TaskGroup<TunnelError> = TaskGroup::new(GroupPolicy::BestEffort, cancel);
        for (machine, specs) in by_machine {
            let authenticator = self.authenticator.clone();
            let token = machines.token();
            let play_id = play_id.to_string();

            machines.spawn(async move {
                info!(play_id = %play_id, machine = %machine, forwards = specs.len(), "Restoring forwards");
                let result = match authenticator.start_tunnel(&token, &play_id, &machine).await {
                    Ok(tunnel) => forward_all(&token, Arc::new(tunnel), specs).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!(play_id = %play_id, machine = %machine, "Restored forwards failed: {}", e);
                }
                result
            });
        }

        tokio::spawn(async move {
            let mut result_tx = Some(result_tx);
            while let Some(outcome) = machines.join_next().await {
                if let Err(e) = outcome {
                    match result_tx.take() {
                        Some(tx) => {
                            if tx.send(Err(e)).is_err() {
                                debug!("Restore result receiver dropped");
                            }
                        }
                        None => debug!("Suppressed restore error: {}", e),
                    }
                }
            }
            if let Some(tx) = result_tx {
                if tx.send(Ok(())).is_err() {
                    debug!("Restore result receiver dropped");
                }
            }
        });

        result_rx
    }
}

/// Forward every spec over `tunnel` under a fail-fast group.
///
/// Setup failures end the group; errors reported on the forwards' shared
/// channel are logged and tolerated.
pub async fn forward_all(
    cancel: &CancellationToken,
    tunnel: Arc<Tunnel>,
    specs: Vec<ForwardingSpec>,
) -> Result<(), TunnelError> {
    let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
    let logger = tokio::spawn(log_forward_errors(
        err_rx,
        tunnel.play_id().to_string(),
        tunnel.machine().to_string(),
    ));

    let mut group: TaskGroup<TunnelError> = TaskGroup::new(GroupPolicy::FailFast, cancel);
    for spec in specs {
        let tunnel = tunnel.clone();
        let token = group.token();
        let err_tx = err_tx.clone();
        group.spawn(async move { tunnel.forward(token, &spec, err_tx).await });
    }
    drop(err_tx);

    let result = group.wait().await;
    // Every sender is gone once the group ends
    let _ = logger.await;
    result
}

async fn log_forward_errors(
    mut errors: mpsc::Receiver<TransportError>,
    play_id: String,
    machine: String,
) {
    while let Some(err) = errors.recv().await {
        warn!(play_id = %play_id, machine = %machine, "Forward error: {}", err);
    }
}

/// Local forwards grouped by machine; others are skipped
fn group_by_machine(forwards: Vec<PortForward>) -> BTreeMap<String, Vec<ForwardingSpec>> {
    let mut by_machine: BTreeMap<String, Vec<ForwardingSpec>> = BTreeMap::new();
    for forward in forwards {
        if !forward.is_local() {
            warn!(
                machine = %forward.machine,
                kind = %forward.kind,
                "Skipping port forward of unsupported kind"
            );
            continue;
        }
        by_machine
            .entry(forward.machine.clone())
            .or_default()
            .push(forward.to_spec());
    }
    by_machine
}
