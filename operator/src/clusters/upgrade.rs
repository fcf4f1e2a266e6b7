use coral_types::*;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use std::time::Duration;

use coral_common::wait::poll_until;

use super::actions::State;
use super::status;
use crate::db::admin::{OperationalMode, partition_keyspaces};
use crate::naming::{self, reasons};
use crate::platform::pod_is_ready;
use crate::util::Error;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug)]
pub struct UpgradeConfig {
    /// Cadence for waits internal to a cycle.
    pub poll_interval: Duration,
    /// Hard per-cycle deadline for those waits.
    pub validation_timeout: Duration,
}

pub fn upgrade_config(cluster: &Cluster) -> Result<UpgradeConfig, Error> {
    let spec = cluster.spec.generic_upgrade.clone().unwrap_or_default();
    let poll_interval = match spec.poll_interval.as_deref() {
        Some(s) => parse_duration::parse(s)?,
        None => DEFAULT_POLL_INTERVAL,
    };
    let validation_timeout = match spec.validation_timeout.as_deref() {
        Some(s) => parse_duration::parse(s)?,
        None => DEFAULT_VALIDATION_TIMEOUT,
    };
    Ok(UpgradeConfig {
        poll_interval,
        validation_timeout,
    })
}

/// Entry point for the version-upgrade action. Enters the multi-phase
/// procedure for a major/minor bump, or performs a plain image update for
/// a patch-level one. One call performs at most one observable
/// transition; the status write re-triggers the reconciler, keeping each
/// step crash-safe.
pub async fn execute(cluster: &Cluster, state: &State) -> Result<(), Error> {
    match cluster.upgrade_status() {
        None => begin(cluster, state).await,
        Some(up) => step(cluster, up.clone(), state).await,
    }
}

async fn begin(cluster: &Cluster, state: &State) -> Result<(), Error> {
    let to = cluster.spec.version.clone();
    let from = cluster
        .status
        .as_ref()
        .map(|s| s.racks.values())
        .into_iter()
        .flatten()
        .map(|r| r.version.clone())
        .find(|v| !v.is_empty() && *v != to);
    let Some(from) = from else {
        // Already satisfied; the planner decided on a stale view.
        return Ok(());
    };

    let (from_mm, to_mm) = match (naming::major_minor(&from), naming::major_minor(&to)) {
        (Ok(f), Ok(t)) => (f, t),
        (Err(e), _) | (_, Err(e)) => return fatal_misconfig(cluster, state, &e).await,
    };

    if from_mm == to_mm {
        return patch_upgrade(cluster, state, &from, &to).await;
    }

    let upgrade = UpgradeStatus {
        state: UpgradeState::BeginUpgrade,
        node_state: None,
        current_rack: String::new(),
        current_node: 0,
        from_version: from.clone(),
        to_version: to.clone(),
        system_snapshot_tag: String::new(),
        data_snapshot_tag: String::new(),
        system_keyspaces: Vec::new(),
        all_keyspaces: Vec::new(),
    };
    persist(cluster, state, Some(upgrade)).await?;
    state
        .events
        .publish(
            cluster,
            EventType::Normal,
            reasons::UPGRADE_STARTED,
            format!("Upgrading cluster from {} to {}", from, to),
        )
        .await;
    Ok(())
}

/// Same major.minor: bump the image and let the platform cycle the pods
/// on its own. No snapshots, no maintenance windows.
async fn patch_upgrade(
    cluster: &Cluster,
    state: &State,
    from: &str,
    to: &str,
) -> Result<(), Error> {
    let namespace = namespace(cluster)?;
    let desired = naming::image_for(&cluster.spec.repository, to);
    let mut changed = false;
    for rack in &cluster.spec.datacenter.racks {
        let sts_name = naming::statefulset_name(cluster, rack);
        let Some(sts) = state.platform.get_statefulset(&namespace, &sts_name).await? else {
            continue;
        };
        if status::statefulset_image(&sts).as_deref() == Some(desired.as_str()) {
            continue;
        }
        state
            .platform
            .set_statefulset_image(&namespace, &sts_name, naming::CONTAINER_NAME, &desired)
            .await?;
        state
            .platform
            .set_rolling_update_partition(&namespace, &sts_name, 0)
            .await?;
        changed = true;
    }
    if changed {
        state
            .events
            .publish(
                cluster,
                EventType::Normal,
                reasons::UPGRADE_STARTED,
                format!("Rolling restart from {} to {}", from, to),
            )
            .await;
    }
    Ok(())
}

async fn step(cluster: &Cluster, mut up: UpgradeStatus, state: &State) -> Result<(), Error> {
    let cfg = upgrade_config(cluster)?;
    match up.state {
        UpgradeState::BeginUpgrade => {
            let hosts = live_hosts(cluster)?;
            let first = hosts
                .first()
                .ok_or_else(|| Error::UserInput("cluster has no live members".to_string()))?;
            let keyspaces = state.admin.keyspaces(first).await?;
            let (system, all) = partition_keyspaces(&keyspaces);
            up.system_keyspaces = system;
            up.all_keyspaces = all;
            let (system_tag, data_tag) = snapshot_tags();
            up.system_snapshot_tag = system_tag;
            up.data_snapshot_tag = data_tag;
            up.state = UpgradeState::ValidateSchemaAgreement;
            persist(cluster, state, Some(up)).await
        }
        UpgradeState::ValidateSchemaAgreement => {
            let session = (state.sessions)(live_hosts(cluster)?);
            let agreed = poll_until(
                &state.cancel,
                cfg.poll_interval,
                cfg.validation_timeout,
                move || {
                    let session = session.clone();
                    async move { session.schema_agreement().await.unwrap_or(false) }
                },
            )
            .await
            .map_err(|_| Error::Cancelled)?;
            if !agreed {
                let note = format!(
                    "schema agreement not reached within {:?}",
                    cfg.validation_timeout
                );
                state
                    .events
                    .publish(cluster, EventType::Warning, reasons::UPGRADE_FAILED, note.clone())
                    .await;
                // Leave the upgrade status untouched; the next trigger
                // validates again.
                let mut status = cluster.status.clone().unwrap_or_default();
                status.message = Some(note);
                return state.platform.update_cluster_status(cluster, status).await;
            }
            up.state = UpgradeState::SystemSnapshot;
            persist(cluster, state, Some(up)).await
        }
        UpgradeState::SystemSnapshot => {
            for host in live_hosts(cluster)? {
                for keyspace in &up.system_keyspaces {
                    state
                        .admin
                        .take_snapshot(&host, keyspace, &up.system_snapshot_tag)
                        .await?;
                }
            }
            match first_cursor(cluster) {
                Some((rack, ordinal)) => {
                    up.current_rack = rack;
                    up.current_node = ordinal;
                    up.node_state = Some(NodeUpgradeState::PreNode);
                    up.state = UpgradeState::PerNodeLoop;
                }
                None => up.state = UpgradeState::ClearSystemSnapshot,
            }
            persist(cluster, state, Some(up)).await
        }
        UpgradeState::PerNodeLoop => node_step(cluster, up, state, &cfg).await,
        UpgradeState::ClearSystemSnapshot => {
            for host in live_hosts(cluster)? {
                state
                    .admin
                    .delete_snapshot(&host, &up.system_snapshot_tag)
                    .await?;
            }
            up.state = UpgradeState::Done;
            persist(cluster, state, Some(up)).await
        }
        UpgradeState::Done => {
            let note = format!(
                "Upgraded cluster from {} to {}",
                up.from_version, up.to_version
            );
            persist(cluster, state, None).await?;
            state
                .events
                .publish(cluster, EventType::Normal, reasons::UPGRADE_FINISHED, note)
                .await;
            Ok(())
        }
    }
}

async fn node_step(
    cluster: &Cluster,
    mut up: UpgradeStatus,
    state: &State,
    cfg: &UpgradeConfig,
) -> Result<(), Error> {
    let namespace = namespace(cluster)?;
    let rack_name = up.current_rack.clone();
    let ordinal = up.current_node;
    let member = naming::member_name(cluster, &rack_name, ordinal);
    let host = naming::member_host(&member, &namespace);

    match up.node_state.unwrap_or(NodeUpgradeState::PreNode) {
        NodeUpgradeState::PreNode => {
            let rack = cluster
                .rack_spec(&rack_name)
                .ok_or_else(|| Error::UserInput(format!("rack '{}' vanished mid-upgrade", rack_name)))?;
            let sts_name = naming::statefulset_name(cluster, rack);
            let sts = state
                .platform
                .get_statefulset(&namespace, &sts_name)
                .await?
                .ok_or_else(|| Error::UserInput(format!("workload '{}' missing", sts_name)))?;
            let desired = naming::image_for(&cluster.spec.repository, &up.to_version);
            if status::statefulset_image(&sts).as_deref() != Some(desired.as_str()) {
                state
                    .platform
                    .set_statefulset_image(&namespace, &sts_name, naming::CONTAINER_NAME, &desired)
                    .await?;
            }
            // Only the pod this machine deletes may come back with the
            // new template.
            state
                .platform
                .set_rolling_update_partition(&namespace, &sts_name, ordinal)
                .await?;
            advance(cluster, state, up, NodeUpgradeState::EnterMaintenance).await
        }
        NodeUpgradeState::EnterMaintenance => {
            state
                .platform
                .set_service_label(
                    &namespace,
                    &member,
                    naming::NODE_MAINTENANCE_LABEL,
                    Some(""),
                )
                .await?;
            advance(cluster, state, up, NodeUpgradeState::Drain).await
        }
        NodeUpgradeState::Drain => {
            let mode = state.admin.operation_mode(&host).await?;
            if mode != OperationalMode::Drained {
                state.admin.drain(&host).await?;
                let admin = state.admin.clone();
                let probe_host = host.clone();
                let drained = poll_until(
                    &state.cancel,
                    cfg.poll_interval,
                    cfg.validation_timeout,
                    move || {
                        let admin = admin.clone();
                        let host = probe_host.clone();
                        async move {
                            matches!(
                                admin.operation_mode(&host).await,
                                Ok(OperationalMode::Drained)
                            )
                        }
                    },
                )
                .await
                .map_err(|_| Error::Cancelled)?;
                if !drained {
                    // Stay in Drain; the next cycle observes the mode and
                    // short-circuits instead of draining again.
                    return Ok(());
                }
            }
            advance(cluster, state, up, NodeUpgradeState::DataSnapshot).await
        }
        NodeUpgradeState::DataSnapshot => {
            for keyspace in &up.all_keyspaces {
                state
                    .admin
                    .take_snapshot(&host, keyspace, &up.data_snapshot_tag)
                    .await?;
            }
            advance(cluster, state, up, NodeUpgradeState::ExitMaintenance).await
        }
        NodeUpgradeState::ExitMaintenance => {
            state
                .platform
                .set_service_label(&namespace, &member, naming::NODE_MAINTENANCE_LABEL, None)
                .await?;
            advance(cluster, state, up, NodeUpgradeState::DeletePod).await
        }
        NodeUpgradeState::DeletePod => {
            state.platform.delete_pod(&namespace, &member).await?;
            advance(cluster, state, up, NodeUpgradeState::AwaitReady).await
        }
        NodeUpgradeState::AwaitReady => {
            let platform = state.platform.clone();
            let admin = state.admin.clone();
            let probe_ns = namespace.clone();
            let probe_member = member.clone();
            let probe_host = host.clone();
            let ready = poll_until(
                &state.cancel,
                cfg.poll_interval,
                cfg.validation_timeout,
                move || {
                    let platform = platform.clone();
                    let admin = admin.clone();
                    let ns = probe_ns.clone();
                    let member = probe_member.clone();
                    let host = probe_host.clone();
                    async move {
                        let pod = match platform.get_pod(&ns, &member).await {
                            Ok(Some(pod)) => pod,
                            _ => return false,
                        };
                        pod_is_ready(&pod)
                            && matches!(
                                admin.operation_mode(&host).await,
                                Ok(OperationalMode::Normal)
                            )
                    }
                },
            )
            .await
            .map_err(|_| Error::Cancelled)?;
            if !ready {
                // Replacement is still coming up; resume here next cycle.
                return Ok(());
            }
            advance(cluster, state, up, NodeUpgradeState::ClearDataSnapshot).await
        }
        NodeUpgradeState::ClearDataSnapshot => {
            state
                .admin
                .delete_snapshot(&host, &up.data_snapshot_tag)
                .await?;
            advance(cluster, state, up, NodeUpgradeState::PostNode).await
        }
        NodeUpgradeState::PostNode => {
            match next_cursor(cluster, &rack_name, ordinal) {
                Some((rack, node)) => {
                    up.current_rack = rack;
                    up.current_node = node;
                    up.node_state = Some(NodeUpgradeState::PreNode);
                }
                None => {
                    up.state = UpgradeState::ClearSystemSnapshot;
                    up.node_state = None;
                }
            }
            persist(cluster, state, Some(up)).await
        }
    }
}

async fn advance(
    cluster: &Cluster,
    state: &State,
    mut up: UpgradeStatus,
    next: NodeUpgradeState,
) -> Result<(), Error> {
    up.node_state = Some(next);
    persist(cluster, state, Some(up)).await
}

async fn persist(
    cluster: &Cluster,
    state: &State,
    upgrade: Option<UpgradeStatus>,
) -> Result<(), Error> {
    let mut status = cluster.status.clone().unwrap_or_default();
    status.upgrade = upgrade;
    state.platform.update_cluster_status(cluster, status).await
}

async fn fatal_misconfig(cluster: &Cluster, state: &State, error: &Error) -> Result<(), Error> {
    let note = format!("cannot upgrade: {}", error);
    state
        .events
        .publish(cluster, EventType::Warning, reasons::UPGRADE_FAILED, note.clone())
        .await;
    let mut status = cluster.status.clone().unwrap_or_default();
    status.message = Some(note);
    state.platform.update_cluster_status(cluster, status).await
}

fn namespace(cluster: &Cluster) -> Result<String, Error> {
    cluster
        .namespace()
        .ok_or_else(|| Error::UserInput("Cluster is missing metadata.namespace".to_string()))
}

fn members_of(cluster: &Cluster, rack_name: &str) -> i32 {
    cluster
        .rack_status(rack_name)
        .map(|s| s.members)
        .or_else(|| cluster.rack_spec(rack_name).map(|r| r.members))
        .unwrap_or(0)
}

/// Admin endpoints of every member recorded in the status, in declared
/// rack order.
fn live_hosts(cluster: &Cluster) -> Result<Vec<String>, Error> {
    let namespace = namespace(cluster)?;
    let mut hosts = Vec::new();
    for rack in &cluster.spec.datacenter.racks {
        for ordinal in 0..members_of(cluster, &rack.name) {
            let member = naming::member_name(cluster, &rack.name, ordinal);
            hosts.push(naming::member_host(&member, &namespace));
        }
    }
    Ok(hosts)
}

/// Highest ordinal of the first non-empty rack.
fn first_cursor(cluster: &Cluster) -> Option<(String, i32)> {
    cluster
        .spec
        .datacenter
        .racks
        .iter()
        .find(|rack| members_of(cluster, &rack.name) > 0)
        .map(|rack| (rack.name.clone(), members_of(cluster, &rack.name) - 1))
}

/// Ordinals walk downward within a rack; racks advance in declared order.
fn next_cursor(cluster: &Cluster, rack_name: &str, ordinal: i32) -> Option<(String, i32)> {
    if ordinal > 0 {
        return Some((rack_name.to_string(), ordinal - 1));
    }
    let racks = &cluster.spec.datacenter.racks;
    let position = racks.iter().position(|r| r.name == rack_name)?;
    racks
        .iter()
        .skip(position + 1)
        .find(|rack| members_of(cluster, &rack.name) > 0)
        .map(|rack| (rack.name.clone(), members_of(cluster, &rack.name) - 1))
}

fn snapshot_tags() -> (String, String) {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    let short = &id[..8];
    (
        format!("upgrade-system-{}-{}", stamp, short),
        format!("upgrade-data-{}-{}", stamp, short),
    )
}
