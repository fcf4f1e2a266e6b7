use coral_types::*;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt, api::ObjectMeta, runtime::events::EventType};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use coral_common::{annotations, wait::poll_until};

use super::{OperatorConfig, upgrade};
use crate::db::{
    admin::{AdminApi, OperationalMode},
    session::SessionFactory,
};
use crate::events::EventSink;
use crate::naming::{self, reasons};
use crate::platform::PlatformClient;
use crate::util::{self, ACTION_WAIT_BUDGET, Error};

/// Everything an action needs to mutate the world. Constructed once per
/// controller; tests substitute in-memory fakes.
pub struct State {
    pub platform: Arc<dyn PlatformClient>,
    pub admin: Arc<dyn AdminApi>,
    pub sessions: SessionFactory,
    pub events: Arc<dyn EventSink>,
    pub config: OperatorConfig,
    pub cancel: CancellationToken,
}

/// One atomic lifecycle step, decided by the planner. Executing an
/// already-satisfied action is a no-op.
#[derive(Debug, PartialEq, Clone)]
pub enum ClusterAction {
    CreateRack { rack: String },
    ScaleUpRack { rack: String },
    ScaleDownRack { rack: String },
    UpgradeVersion,
}

impl ClusterAction {
    pub fn to_str(&self) -> &str {
        match self {
            ClusterAction::CreateRack { .. } => "CreateRack",
            ClusterAction::ScaleUpRack { .. } => "ScaleUpRack",
            ClusterAction::ScaleDownRack { .. } => "ScaleDownRack",
            ClusterAction::UpgradeVersion => "UpgradeVersion",
        }
    }
}

pub async fn execute(
    action: &ClusterAction,
    cluster: &Cluster,
    state: &State,
) -> Result<(), Error> {
    match action {
        ClusterAction::CreateRack { rack } => create_rack(cluster, rack, state).await,
        ClusterAction::ScaleUpRack { rack } => scale_up(cluster, rack, state).await,
        ClusterAction::ScaleDownRack { rack } => scale_down(cluster, rack, state).await,
        ClusterAction::UpgradeVersion => upgrade::execute(cluster, state).await,
    }
}

fn instance_namespace(cluster: &Cluster) -> Result<String, Error> {
    cluster
        .namespace()
        .ok_or_else(|| Error::UserInput("Cluster is missing metadata.namespace".to_string()))
}

fn rack_spec<'a>(cluster: &'a Cluster, rack_name: &str) -> Result<&'a RackSpec, Error> {
    cluster
        .rack_spec(rack_name)
        .ok_or_else(|| Error::UserInput(format!("rack '{}' not declared in spec", rack_name)))
}

/// The workload backing a rack: stable per-member identity, zero replicas
/// at creation (the planner grows it one member at a time), and a
/// partitioned rolling-update strategy so the upgrade machine controls
/// which pods pick up a new template.
pub fn rack_statefulset(
    cluster: &Cluster,
    rack: &RackSpec,
    config: &OperatorConfig,
) -> Result<k8s_openapi::api::apps::v1::StatefulSet, Error> {
    let name = naming::statefulset_name(cluster, rack);
    let namespace = instance_namespace(cluster)?;
    let labels = naming::rack_labels(cluster, &rack.name);
    let image = naming::image_for(&cluster.spec.repository, &cluster.spec.version);
    let capacity = rack.storage.capacity.as_deref().unwrap_or("10Gi");

    let sts = serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": {
                (annotations::CREATED_BY): util::MANAGER_NAME,
                (annotations::SPEC_HASH): util::hash_spec(rack),
            },
            "ownerReferences": [cluster.controller_owner_ref(&()).unwrap()],
        },
        "spec": {
            "replicas": 0,
            "serviceName": naming::headless_service_name(cluster),
            "podManagementPolicy": "OrderedReady",
            "selector": { "matchLabels": labels },
            "updateStrategy": {
                "type": "RollingUpdate",
                "rollingUpdate": { "partition": 0 },
            },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "nodeSelector": rack.placement.node_selector,
                    "containers": [
                        {
                            "name": naming::CONTAINER_NAME,
                            "image": image,
                            "ports": [
                                { "name": "cql", "containerPort": naming::CQL_PORT },
                                { "name": "inter-node", "containerPort": naming::INTER_NODE_PORT },
                                { "name": "admin", "containerPort": i32::from(config.admin_port) },
                            ],
                            "volumeMounts": [
                                { "name": "data", "mountPath": "/var/lib/coral" },
                            ],
                        },
                        {
                            "name": naming::SIDECAR_CONTAINER_NAME,
                            "image": config.operator_image,
                            "args": ["sidecar"],
                        },
                    ],
                },
            },
            "volumeClaimTemplates": [
                {
                    "metadata": { "name": "data" },
                    "spec": {
                        "accessModes": ["ReadWriteOnce"],
                        "storageClassName": rack.storage.storage_class_name,
                        "resources": { "requests": { "storage": capacity } },
                    },
                },
            ],
        },
    }))?;
    Ok(sts)
}

async fn create_rack(cluster: &Cluster, rack_name: &str, state: &State) -> Result<(), Error> {
    let rack = rack_spec(cluster, rack_name)?;
    let namespace = instance_namespace(cluster)?;
    let sts = rack_statefulset(cluster, rack, &state.config)?;
    state.platform.create_statefulset(&namespace, &sts).await?;

    // The rack exists from now on: record an empty status entry so the
    // planner moves on to growing it.
    let mut status = cluster.status.clone().unwrap_or_default();
    status.racks.entry(rack_name.to_string()).or_insert(RackStatus {
        version: cluster.spec.version.clone(),
        members: 0,
        ready_members: 0,
        conditions: Vec::new(),
    });
    state.platform.update_cluster_status(cluster, status).await?;

    state
        .events
        .publish(
            cluster,
            EventType::Normal,
            reasons::RACK_CREATED,
            format!("Created rack '{}'", rack_name),
        )
        .await;
    Ok(())
}

async fn scale_up(cluster: &Cluster, rack_name: &str, state: &State) -> Result<(), Error> {
    let rack = rack_spec(cluster, rack_name)?;
    let namespace = instance_namespace(cluster)?;
    let sts_name = naming::statefulset_name(cluster, rack);
    let sts = state
        .platform
        .get_statefulset(&namespace, &sts_name)
        .await?
        .ok_or_else(|| Error::UserInput(format!("workload '{}' missing", sts_name)))?;

    let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if current >= rack.members {
        return Ok(());
    }
    state
        .platform
        .set_statefulset_replicas(&namespace, &sts_name, current + 1)
        .await?;

    // A leaving marker surviving a completed scale-down must not divert
    // the planner forever.
    if cluster
        .rack_status(rack_name)
        .is_some_and(|s| s.condition_is_true(RackConditionType::MemberLeaving))
    {
        set_member_leaving(cluster, state, rack_name, ConditionStatus::False).await?;
    }

    state
        .events
        .publish(
            cluster,
            EventType::Normal,
            reasons::RACK_SCALED,
            format!(
                "Scaling rack '{}' up to {} members",
                rack_name,
                current + 1
            ),
        )
        .await;
    Ok(())
}

/// Removes the highest-ordinal member: mark it leaving, have the database
/// stream its data away, then shrink the workload. Every step observes
/// the world first, so a cycle interrupted anywhere resumes cleanly.
async fn scale_down(cluster: &Cluster, rack_name: &str, state: &State) -> Result<(), Error> {
    let rack = rack_spec(cluster, rack_name)?;
    let namespace = instance_namespace(cluster)?;
    let sts_name = naming::statefulset_name(cluster, rack);
    let sts = state
        .platform
        .get_statefulset(&namespace, &sts_name)
        .await?
        .ok_or_else(|| Error::UserInput(format!("workload '{}' missing", sts_name)))?;

    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let leaving = cluster
        .rack_status(rack_name)
        .is_some_and(|s| s.condition_is_true(RackConditionType::MemberLeaving));

    if replicas <= rack.members {
        // The decrement already happened; only the marker is left over.
        if leaving {
            set_member_leaving(cluster, state, rack_name, ConditionStatus::False).await?;
        }
        return Ok(());
    }

    let ordinal = replicas - 1;
    if !leaving {
        set_member_leaving(cluster, state, rack_name, ConditionStatus::True).await?;
    }

    let member = naming::member_name(cluster, rack_name, ordinal);
    let host = naming::member_host(&member, &namespace);
    let mode = state.admin.operation_mode(&host).await?;
    match mode {
        OperationalMode::Normal => state.admin.decommission(&host).await?,
        OperationalMode::Leaving | OperationalMode::Decommissioned => {}
        other => {
            return Err(Error::Admin(format!(
                "member '{}' in unexpected mode {} during scale-down",
                member, other
            )));
        }
    }

    if mode != OperationalMode::Decommissioned {
        let cfg = upgrade::upgrade_config(cluster)?;
        let admin = state.admin.clone();
        let probe_host = host.clone();
        let done = poll_until(&state.cancel, cfg.poll_interval, ACTION_WAIT_BUDGET, move || {
            let admin = admin.clone();
            let host = probe_host.clone();
            async move {
                matches!(
                    admin.operation_mode(&host).await,
                    Ok(OperationalMode::Decommissioned)
                )
            }
        })
        .await
        .map_err(|_| Error::Cancelled)?;
        if !done {
            // Leaving marker stays set; the next trigger resumes here.
            return Ok(());
        }
    }

    state
        .platform
        .set_statefulset_replicas(&namespace, &sts_name, ordinal)
        .await?;
    set_member_leaving(cluster, state, rack_name, ConditionStatus::False).await?;

    state
        .events
        .publish(
            cluster,
            EventType::Normal,
            reasons::RACK_SCALED,
            format!(
                "Scaled rack '{}' down to {} members",
                rack_name, ordinal
            ),
        )
        .await;
    Ok(())
}

async fn set_member_leaving(
    cluster: &Cluster,
    state: &State,
    rack_name: &str,
    value: ConditionStatus,
) -> Result<(), Error> {
    let mut status = cluster.status.clone().unwrap_or_default();
    status
        .racks
        .entry(rack_name.to_string())
        .or_default()
        .set_condition(RackConditionType::MemberLeaving, value);
    state.platform.update_cluster_status(cluster, status).await
}

/// The cluster-wide DNS handle enumerating member endpoints.
pub fn headless_service(cluster: &Cluster) -> Result<Service, Error> {
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    let namespace = instance_namespace(cluster)?;
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(naming::headless_service_name(cluster)),
            namespace: Some(namespace),
            labels: Some(naming::cluster_labels(cluster)),
            annotations: Some(
                [(
                    annotations::CREATED_BY.to_string(),
                    util::MANAGER_NAME.to_string(),
                )]
                .into(),
            ),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(naming::cluster_labels(cluster)),
            ports: Some(vec![ServicePort {
                name: Some("cql".to_string()),
                port: naming::CQL_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// The per-member identity object. Its labels drive side-effects (the
/// maintenance label diverts traffic); its selector pins the single pod
/// with the matching ordinal.
pub fn member_service(cluster: &Cluster, rack_name: &str, ordinal: i32) -> Result<Service, Error> {
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    let namespace = instance_namespace(cluster)?;
    let member = naming::member_name(cluster, rack_name, ordinal);
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(member.clone()),
            namespace: Some(namespace),
            labels: Some(naming::member_labels(cluster, rack_name, ordinal)),
            annotations: Some(
                [(
                    annotations::CREATED_BY.to_string(),
                    util::MANAGER_NAME.to_string(),
                )]
                .into(),
            ),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some([(naming::POD_NAME_LABEL.to_string(), member)].into()),
            ports: Some(vec![ServicePort {
                name: Some("cql".to_string()),
                port: naming::CQL_PORT,
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::{planner, status, testing::*};
    use k8s_openapi::api::apps::v1::StatefulSet;
    use std::collections::BTreeMap;

    fn observed_map(fx: &Fixture, cluster: &Cluster) -> BTreeMap<String, StatefulSet> {
        let world = fx.platform.world.lock().unwrap();
        let mut observed = BTreeMap::new();
        for rack in &cluster.spec.datacenter.racks {
            let sts_name = naming::statefulset_name(cluster, rack);
            if let Some(sts) = world.statefulsets.get(&sts_name) {
                observed.insert(rack.name.clone(), sts.clone());
            }
        }
        observed
    }

    fn mark_all_ready(fx: &Fixture) {
        let mut world = fx.platform.world.lock().unwrap();
        for sts in world.statefulsets.values_mut() {
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            let status = sts.status.get_or_insert_with(Default::default);
            status.ready_replicas = Some(replicas);
            status.observed_generation = sts.metadata.generation;
        }
    }

    #[tokio::test]
    async fn create_rack_materializes_workload_and_status_entry() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        cluster.status.as_mut().unwrap().racks.clear();

        execute(
            &ClusterAction::CreateRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        let world = fx.platform.world.lock().unwrap();
        let sts = world.statefulsets.get("prod-a").unwrap();
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(0));
        assert_eq!(
            status::statefulset_image(sts).as_deref(),
            Some("coraldb/coral:4.2.0")
        );
        drop(world);

        let entry = fx.platform.last_status().unwrap().racks["a"].clone();
        assert_eq!(entry.members, 0);
        assert_eq!(entry.ready_members, 0);
        assert_eq!(entry.version, "4.2.0");
        assert!(fx.events.reasons().contains(&"RackCreated".to_string()));
    }

    #[tokio::test]
    async fn single_rack_create_and_grow_sequence() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        cluster.status.as_mut().unwrap().racks.clear();

        let mut seen = Vec::new();
        for _ in 0..10 {
            let observed = observed_map(&fx, &cluster);
            cluster.status = Some(status::computed_status(&cluster, &observed));
            let Some(action) = planner::next_action(&cluster) else {
                break;
            };
            seen.push(action.to_str().to_string());
            execute(&action, &cluster, &fx.state).await.unwrap();
            if let Some(st) = fx.platform.last_status() {
                cluster.status = Some(st);
            }
            mark_all_ready(&fx);
        }

        assert_eq!(
            seen,
            vec!["CreateRack", "ScaleUpRack", "ScaleUpRack", "ScaleUpRack"]
        );
        assert_eq!(fx.platform.replicas("prod-a"), 3);
    }

    #[tokio::test]
    async fn scale_up_is_noop_at_declared_count() {
        let fx = fixture(&[]);
        let cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        seed_rack(&fx, &cluster, "a", 3, "4.2.0");

        execute(
            &ClusterAction::ScaleUpRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        assert_eq!(fx.platform.replicas("prod-a"), 3);
        assert!(fx.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn scale_up_clears_stale_leaving_marker() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        cluster
            .status
            .as_mut()
            .unwrap()
            .racks
            .get_mut("a")
            .unwrap()
            .set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        seed_rack(&fx, &cluster, "a", 1, "4.2.0");

        execute(
            &ClusterAction::ScaleUpRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        assert_eq!(fx.platform.replicas("prod-a"), 2);
        let last = fx.platform.last_status().unwrap();
        assert!(!last.racks["a"].condition_is_true(RackConditionType::MemberLeaving));
    }

    #[tokio::test]
    async fn scale_down_decommissions_highest_ordinal() {
        let fx = fixture(&[]);
        let cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        seed_rack(&fx, &cluster, "a", 5, "4.2.0");

        execute(
            &ClusterAction::ScaleDownRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        let decommissions = fx.admin.world.lock().unwrap().decommissions.clone();
        assert_eq!(decommissions, vec!["prod-a-4.default.svc".to_string()]);
        assert_eq!(fx.platform.replicas("prod-a"), 4);

        // The leaving marker was raised before the decommission and
        // cleared after the decrement.
        let history = fx.platform.world.lock().unwrap().status_history.clone();
        assert!(history.iter().any(|s| {
            s.racks
                .get("a")
                .is_some_and(|r| r.condition_is_true(RackConditionType::MemberLeaving))
        }));
        let last = history.last().unwrap();
        assert!(!last.racks["a"].condition_is_true(RackConditionType::MemberLeaving));
        assert!(fx.events.reasons().contains(&"RackScaled".to_string()));
    }

    #[tokio::test]
    async fn scale_down_from_five_to_three_removes_one_member_per_cycle() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        seed_rack(&fx, &cluster, "a", 5, "4.2.0");

        for expected in [4, 3] {
            let action = ClusterAction::ScaleDownRack {
                rack: "a".to_string(),
            };
            execute(&action, &cluster, &fx.state).await.unwrap();
            assert_eq!(fx.platform.replicas("prod-a"), expected);
            if let Some(st) = fx.platform.last_status() {
                cluster.status = Some(st);
            }
        }

        let decommissions = fx.admin.world.lock().unwrap().decommissions.clone();
        assert_eq!(
            decommissions,
            vec![
                "prod-a-4.default.svc".to_string(),
                "prod-a-3.default.svc".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn scale_down_resumes_without_reissuing_decommission() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        cluster
            .status
            .as_mut()
            .unwrap()
            .racks
            .get_mut("a")
            .unwrap()
            .set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        seed_rack(&fx, &cluster, "a", 5, "4.2.0");
        fx.admin
            .set_mode("prod-a-4.default.svc", OperationalMode::Decommissioned);

        execute(
            &ClusterAction::ScaleDownRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        assert!(fx.admin.world.lock().unwrap().decommissions.is_empty());
        assert_eq!(fx.platform.replicas("prod-a"), 4);
        let last = fx.platform.last_status().unwrap();
        assert!(!last.racks["a"].condition_is_true(RackConditionType::MemberLeaving));
    }

    #[tokio::test]
    async fn scale_down_with_only_marker_left_clears_it() {
        let fx = fixture(&[]);
        let mut cluster = test_cluster("4.2.0", "4.2.0", &[("a", 3)]);
        cluster
            .status
            .as_mut()
            .unwrap()
            .racks
            .get_mut("a")
            .unwrap()
            .set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        seed_rack(&fx, &cluster, "a", 3, "4.2.0");

        execute(
            &ClusterAction::ScaleDownRack {
                rack: "a".to_string(),
            },
            &cluster,
            &fx.state,
        )
        .await
        .unwrap();

        assert!(fx.admin.world.lock().unwrap().decommissions.is_empty());
        assert_eq!(fx.platform.replicas("prod-a"), 3);
        let last = fx.platform.last_status().unwrap();
        assert!(!last.racks["a"].condition_is_true(RackConditionType::MemberLeaving));
    }
}
