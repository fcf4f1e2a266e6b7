//! In-memory fakes of the platform facade, the admin API, and the CQL
//! session, shared by the action and upgrade tests.

use async_trait::async_trait;
use coral_types::*;
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetStatus,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{Container, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec, Service};
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use std::collections::BTreeMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

use super::OperatorConfig;
use super::actions::State;
use crate::db::admin::{AdminApi, OperationalMode};
use crate::db::session::{SchemaSession, SessionFactory};
use crate::events::EventSink;
use crate::naming;
use crate::platform::PlatformClient;
use crate::util::Error;

#[derive(Default)]
pub struct FakeWorld {
    pub statefulsets: BTreeMap<String, StatefulSet>,
    pub services: BTreeMap<String, Service>,
    pub pods: BTreeMap<String, Pod>,
    pub status_history: Vec<ClusterStatus>,
    pub deleted_pods: Vec<String>,
    pub deleted_services: Vec<String>,
    pub label_history: Vec<(String, String, Option<String>)>,
    pub partition_history: Vec<(String, i32)>,
}

#[derive(Default)]
pub struct FakePlatform {
    pub world: Mutex<FakeWorld>,
}

impl FakePlatform {
    pub fn last_status(&self) -> Option<ClusterStatus> {
        self.world.lock().unwrap().status_history.last().cloned()
    }

    pub fn service_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.world
            .lock()
            .unwrap()
            .services
            .get(name)
            .and_then(|s| s.metadata.labels.clone())
            .unwrap_or_default()
    }

    pub fn replicas(&self, sts_name: &str) -> i32 {
        self.world
            .lock()
            .unwrap()
            .statefulsets
            .get(sts_name)
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.replicas)
            .unwrap_or(0)
    }

    pub fn insert_ready_pod(&self, name: &str) {
        self.world
            .lock()
            .unwrap()
            .pods
            .insert(name.to_string(), ready_pod(name));
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').all(|pair| match pair.split_once('=') {
        Some((k, v)) => labels.get(k).map(|x| x == v).unwrap_or(false),
        None => false,
    })
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn get_statefulset(&self, _ns: &str, name: &str) -> Result<Option<StatefulSet>, Error> {
        Ok(self.world.lock().unwrap().statefulsets.get(name).cloned())
    }

    async fn create_statefulset(&self, _ns: &str, sts: &StatefulSet) -> Result<(), Error> {
        let name = sts.metadata.name.clone().unwrap();
        let mut world = self.world.lock().unwrap();
        world.statefulsets.entry(name).or_insert_with(|| sts.clone());
        Ok(())
    }

    async fn set_statefulset_replicas(
        &self,
        _ns: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        let sts = world
            .statefulsets
            .get_mut(name)
            .ok_or_else(|| Error::UserInput(format!("no such workload '{}'", name)))?;
        sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        Ok(())
    }

    async fn set_statefulset_image(
        &self,
        _ns: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        let sts = world
            .statefulsets
            .get_mut(name)
            .ok_or_else(|| Error::UserInput(format!("no such workload '{}'", name)))?;
        let containers = &mut sts
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default)
            .containers;
        match containers.iter_mut().find(|c| c.name == container) {
            Some(c) => c.image = Some(image.to_string()),
            None => containers.push(Container {
                name: container.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }),
        }
        Ok(())
    }

    async fn set_rolling_update_partition(
        &self,
        _ns: &str,
        name: &str,
        partition: i32,
    ) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world.partition_history.push((name.to_string(), partition));
        let sts = world
            .statefulsets
            .get_mut(name)
            .ok_or_else(|| Error::UserInput(format!("no such workload '{}'", name)))?;
        sts.spec.get_or_insert_with(Default::default).update_strategy =
            Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(partition),
                    ..Default::default()
                }),
            });
        Ok(())
    }

    async fn get_service(&self, _ns: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.world.lock().unwrap().services.get(name).cloned())
    }

    async fn list_services(&self, _ns: &str, selector: &str) -> Result<Vec<Service>, Error> {
        Ok(self
            .world
            .lock()
            .unwrap()
            .services
            .values()
            .filter(|s| {
                selector_matches(
                    selector,
                    s.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
                )
            })
            .cloned()
            .collect())
    }

    async fn apply_service(&self, _ns: &str, service: &Service) -> Result<(), Error> {
        let name = service.metadata.name.clone().unwrap();
        let mut world = self.world.lock().unwrap();
        match world.services.get_mut(&name) {
            Some(existing) => {
                // Merge semantics: converge identity labels, keep the rest.
                let labels = existing
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default);
                for (k, v) in service.metadata.labels.clone().unwrap_or_default() {
                    labels.insert(k, v);
                }
            }
            None => {
                world.services.insert(name, service.clone());
            }
        }
        Ok(())
    }

    async fn delete_service(&self, _ns: &str, name: &str) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world.services.remove(name);
        world.deleted_services.push(name.to_string());
        Ok(())
    }

    async fn set_service_label(
        &self,
        _ns: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world
            .label_history
            .push((name.to_string(), key.to_string(), value.map(String::from)));
        let service = world
            .services
            .get_mut(name)
            .ok_or_else(|| Error::UserInput(format!("no such service '{}'", name)))?;
        let labels = service
            .metadata
            .labels
            .get_or_insert_with(Default::default);
        match value {
            Some(v) => {
                labels.insert(key.to_string(), v.to_string());
            }
            None => {
                labels.remove(key);
            }
        }
        Ok(())
    }

    async fn get_pod(&self, _ns: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.world.lock().unwrap().pods.get(name).cloned())
    }

    async fn delete_pod(&self, _ns: &str, name: &str) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world.pods.remove(name);
        world.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn update_cluster_status(
        &self,
        _instance: &Cluster,
        status: ClusterStatus,
    ) -> Result<(), Error> {
        self.world.lock().unwrap().status_history.push(status);
        Ok(())
    }
}

#[derive(Default)]
pub struct AdminWorld {
    pub modes: BTreeMap<String, OperationalMode>,
    pub drains: Vec<String>,
    pub decommissions: Vec<String>,
    pub keyspaces: Vec<String>,
    /// Live snapshots: (host, keyspace, tag).
    pub snapshots: Vec<(String, String, String)>,
    /// Every take_snapshot call ever made.
    pub snapshot_history: Vec<(String, String, String)>,
}

pub struct FakeAdmin {
    pub world: Mutex<AdminWorld>,
    /// Draining completes instantly when set.
    pub drain_completes: bool,
    /// Decommission completes instantly when set.
    pub decommission_completes: bool,
}

impl FakeAdmin {
    pub fn new(keyspaces: &[&str]) -> Arc<FakeAdmin> {
        Arc::new(FakeAdmin {
            world: Mutex::new(AdminWorld {
                keyspaces: keyspaces.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            drain_completes: true,
            decommission_completes: true,
        })
    }

    pub fn set_mode(&self, host: &str, mode: OperationalMode) {
        self.world
            .lock()
            .unwrap()
            .modes
            .insert(host.to_string(), mode);
    }

    pub fn drain_count(&self, host: &str) -> usize {
        self.world
            .lock()
            .unwrap()
            .drains
            .iter()
            .filter(|h| h.as_str() == host)
            .count()
    }

    pub fn live_snapshots(&self) -> Vec<(String, String, String)> {
        self.world.lock().unwrap().snapshots.clone()
    }
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn operation_mode(&self, host: &str) -> Result<OperationalMode, Error> {
        Ok(self
            .world
            .lock()
            .unwrap()
            .modes
            .get(host)
            .copied()
            .unwrap_or(OperationalMode::Normal))
    }

    async fn drain(&self, host: &str) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world.drains.push(host.to_string());
        if self.drain_completes {
            world
                .modes
                .insert(host.to_string(), OperationalMode::Drained);
        }
        Ok(())
    }

    async fn decommission(&self, host: &str) -> Result<(), Error> {
        let mut world = self.world.lock().unwrap();
        world.decommissions.push(host.to_string());
        if self.decommission_completes {
            world
                .modes
                .insert(host.to_string(), OperationalMode::Decommissioned);
        }
        Ok(())
    }

    async fn keyspaces(&self, _host: &str) -> Result<Vec<String>, Error> {
        Ok(self.world.lock().unwrap().keyspaces.clone())
    }

    async fn take_snapshot(&self, host: &str, keyspace: &str, tag: &str) -> Result<(), Error> {
        let entry = (host.to_string(), keyspace.to_string(), tag.to_string());
        let mut world = self.world.lock().unwrap();
        world.snapshot_history.push(entry.clone());
        if !world.snapshots.contains(&entry) {
            world.snapshots.push(entry);
        }
        Ok(())
    }

    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), Error> {
        self.world
            .lock()
            .unwrap()
            .snapshots
            .retain(|(h, _, t)| !(h == host && t == tag));
        Ok(())
    }
}

pub struct FakeSession {
    pub agreed: Arc<AtomicBool>,
}

#[async_trait]
impl SchemaSession for FakeSession {
    async fn schema_agreement(&self) -> Result<bool, Error> {
        Ok(self.agreed.load(Ordering::SeqCst))
    }
}

pub fn fake_session_factory(agreed: Arc<AtomicBool>) -> SessionFactory {
    Arc::new(move |_hosts| {
        Arc::new(FakeSession {
            agreed: agreed.clone(),
        }) as Arc<dyn SchemaSession>
    })
}

#[derive(Default)]
pub struct FakeEvents {
    /// (reason, note, is_warning)
    pub published: Mutex<Vec<(String, String, bool)>>,
}

impl FakeEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn publish(&self, _cluster: &Cluster, event_type: EventType, reason: &str, note: String) {
        self.published.lock().unwrap().push((
            reason.to_string(),
            note,
            matches!(event_type, EventType::Warning),
        ));
    }
}

pub struct Fixture {
    pub platform: Arc<FakePlatform>,
    pub admin: Arc<FakeAdmin>,
    pub events: Arc<FakeEvents>,
    pub agreed: Arc<AtomicBool>,
    pub state: State,
}

pub fn fixture(keyspaces: &[&str]) -> Fixture {
    let platform = Arc::new(FakePlatform::default());
    let admin = FakeAdmin::new(keyspaces);
    let events = Arc::new(FakeEvents::default());
    let agreed = Arc::new(AtomicBool::new(true));
    let state = State {
        platform: platform.clone(),
        admin: admin.clone(),
        sessions: fake_session_factory(agreed.clone()),
        events: events.clone(),
        config: OperatorConfig {
            namespace: "default".to_string(),
            operator_image: "coraldb/coral-operator:latest".to_string(),
            admin_port: 10000,
        },
        cancel: CancellationToken::new(),
    };
    Fixture {
        platform,
        admin,
        events,
        agreed,
        state,
    }
}

pub fn ready_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn test_cluster(
    spec_version: &str,
    observed_version: &str,
    racks: &[(&str, i32)],
) -> Cluster {
    let mut status_racks = BTreeMap::new();
    for (name, members) in racks {
        status_racks.insert(
            name.to_string(),
            RackStatus {
                version: observed_version.to_string(),
                members: *members,
                ready_members: *members,
                conditions: Vec::new(),
            },
        );
    }
    Cluster {
        metadata: ObjectMeta {
            name: Some("prod".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("6f1cbf3f-1234-4bcd-9c8e-000000000001".to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            version: spec_version.to_string(),
            repository: "coraldb/coral".to_string(),
            datacenter: DatacenterSpec {
                name: "dc1".to_string(),
                racks: racks
                    .iter()
                    .map(|(name, members)| RackSpec {
                        name: name.to_string(),
                        members: *members,
                        ..Default::default()
                    })
                    .collect(),
            },
            generic_upgrade: Some(GenericUpgradeSpec {
                poll_interval: Some("1ms".to_string()),
                validation_timeout: Some("50ms".to_string()),
            }),
        },
        status: Some(ClusterStatus {
            racks: status_racks,
            upgrade: None,
            message: None,
            last_updated: None,
        }),
    }
}

/// Materializes a rack in the fake world: workload at the given replica
/// count and image version, one identity service and one ready pod per
/// member, admin mode Normal.
pub fn seed_rack(fx: &Fixture, cluster: &Cluster, rack_name: &str, replicas: i32, version: &str) {
    let rack = cluster.rack_spec(rack_name).unwrap();
    let sts_name = naming::statefulset_name(cluster, rack);
    let labels = naming::rack_labels(cluster, rack_name);
    let sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(sts_name.clone()),
            namespace: Some("default".to_string()),
            labels: Some(labels.clone()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: naming::CONTAINER_NAME.to_string(),
                        image: Some(naming::image_for("coraldb/coral", version)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            observed_generation: Some(1),
            ready_replicas: Some(replicas),
            ..Default::default()
        }),
    };
    let mut world = fx.platform.world.lock().unwrap();
    world.statefulsets.insert(sts_name, sts);
    for ordinal in 0..replicas {
        let member = naming::member_name(cluster, rack_name, ordinal);
        world.services.insert(
            member.clone(),
            Service {
                metadata: ObjectMeta {
                    name: Some(member.clone()),
                    namespace: Some("default".to_string()),
                    labels: Some(naming::member_labels(cluster, rack_name, ordinal)),
                    ..Default::default()
                },
                spec: None,
                status: None,
            },
        );
        world.pods.insert(member.clone(), ready_pod(&member));
    }
}
