use coral_types::{Cluster, ClusterStatus, RackStatus};
use k8s_openapi::api::apps::v1::StatefulSet;
use std::collections::BTreeMap;

use crate::naming;

/// A workload whose status generation lags its spec generation has not
/// been observed by its controller yet; deciding on it would act on stale
/// data.
pub fn statefulset_is_stale(sts: &StatefulSet) -> bool {
    let Some(generation) = sts.metadata.generation else {
        return false;
    };
    match sts.status.as_ref().and_then(|s| s.observed_generation) {
        Some(observed) => observed < generation,
        None => true,
    }
}

/// Image of the database container on the workload's pod template.
pub fn statefulset_image(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == naming::CONTAINER_NAME)?
        .image
        .clone()
}

/// Observed rack state derived from its backing workload. Conditions are
/// owned by the actions and carried over verbatim.
pub fn rack_status_from(sts: &StatefulSet, prev: Option<&RackStatus>) -> RackStatus {
    let members = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let ready_members = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        .min(members);
    let version = statefulset_image(sts)
        .and_then(|image| naming::version_from_image(&image).ok())
        .or_else(|| prev.map(|p| p.version.clone()))
        .unwrap_or_default();
    RackStatus {
        version,
        members,
        ready_members,
        conditions: prev.map(|p| p.conditions.clone()).unwrap_or_default(),
    }
}

/// Recompute the per-rack view of the status from the observed workloads.
/// Racks without a workload keep their previous entry (a freshly created
/// rack has one before its StatefulSet reports anything); racks dropped
/// from the spec lose theirs.
pub fn computed_status(
    cluster: &Cluster,
    observed: &BTreeMap<String, StatefulSet>,
) -> ClusterStatus {
    let mut status = cluster.status.clone().unwrap_or_default();
    let mut racks = BTreeMap::new();
    for rack in &cluster.spec.datacenter.racks {
        let prev = status.racks.get(&rack.name);
        let entry = match observed.get(&rack.name) {
            Some(sts) => Some(rack_status_from(sts, prev)),
            None => prev.cloned(),
        };
        if let Some(entry) = entry {
            racks.insert(rack.name.clone(), entry);
        }
    }
    status.racks = racks;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_types::{ConditionStatus, RackConditionType};
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn sts(replicas: i32, ready: i32, image: &str, generation: i64, observed: i64) -> StatefulSet {
        let mut sts = StatefulSet::default();
        sts.metadata.generation = Some(generation);
        sts.spec = Some(StatefulSetSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: naming::CONTAINER_NAME.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        sts.status = Some(StatefulSetStatus {
            ready_replicas: Some(ready),
            observed_generation: Some(observed),
            ..Default::default()
        });
        sts
    }

    #[test]
    fn staleness_compares_generations() {
        assert!(statefulset_is_stale(&sts(1, 1, "coraldb/coral:4.2.0", 3, 2)));
        assert!(!statefulset_is_stale(&sts(1, 1, "coraldb/coral:4.2.0", 3, 3)));
        assert!(!statefulset_is_stale(&sts(1, 1, "coraldb/coral:4.2.0", 2, 3)));
    }

    #[test]
    fn ready_members_never_exceed_members() {
        let status = rack_status_from(&sts(2, 5, "coraldb/coral:4.2.0", 1, 1), None);
        assert_eq!(status.members, 2);
        assert_eq!(status.ready_members, 2);
    }

    #[test]
    fn version_comes_from_observed_image() {
        let status = rack_status_from(&sts(3, 3, "coraldb/coral:5.2.0", 1, 1), None);
        assert_eq!(status.version, "5.2.0");
    }

    #[test]
    fn conditions_carry_over_from_previous_status() {
        let mut prev = RackStatus::default();
        prev.set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        let status = rack_status_from(&sts(3, 3, "coraldb/coral:4.2.0", 1, 1), Some(&prev));
        assert!(status.condition_is_true(RackConditionType::MemberLeaving));
    }
}
