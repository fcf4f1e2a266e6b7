use coral_types::{Cluster, RackConditionType};

use super::actions::ClusterAction;

/// Ordered, deterministic choice of the single next lifecycle step.
/// Rule order is a correctness property:
///
/// 1. racks missing a status entry are created first, so the cluster can
///    always make forward progress from a partial state;
/// 2. an interrupted scale-down is resumed before anything else touches
///    the cluster (at most one member may be leaving at a time);
/// 3. an in-flight upgrade is resumed next: mid-protocol a node in
///    maintenance or awaiting replacement legitimately breaks readiness,
///    and because this rule precedes the scale rules no scaling can run
///    while an upgrade is recorded;
/// 4. every remaining rule requires all racks to be fully ready;
/// 5–6. scale before upgrading;
/// 7. a version divergence starts an upgrade.
///
/// Ties break in declared rack order.
pub fn next_action(cluster: &Cluster) -> Option<ClusterAction> {
    let racks = &cluster.spec.datacenter.racks;

    for rack in racks {
        if cluster.rack_status(&rack.name).is_none() {
            return Some(ClusterAction::CreateRack {
                rack: rack.name.clone(),
            });
        }
    }

    for rack in racks {
        if let Some(status) = cluster.rack_status(&rack.name)
            && status.condition_is_true(RackConditionType::MemberLeaving)
        {
            return Some(ClusterAction::ScaleDownRack {
                rack: rack.name.clone(),
            });
        }
    }

    if cluster.upgrade_status().is_some() {
        return Some(ClusterAction::UpgradeVersion);
    }

    for rack in racks {
        let status = cluster.rack_status(&rack.name)?;
        if status.members != status.ready_members {
            return None;
        }
    }

    for rack in racks {
        if let Some(status) = cluster.rack_status(&rack.name)
            && rack.members < status.members
        {
            return Some(ClusterAction::ScaleDownRack {
                rack: rack.name.clone(),
            });
        }
    }

    for rack in racks {
        if let Some(status) = cluster.rack_status(&rack.name)
            && rack.members > status.members
        {
            return Some(ClusterAction::ScaleUpRack {
                rack: rack.name.clone(),
            });
        }
    }

    for rack in racks {
        if let Some(status) = cluster.rack_status(&rack.name)
            && !status.version.is_empty()
            && status.version != cluster.spec.version
        {
            return Some(ClusterAction::UpgradeVersion);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_types::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn rack_spec(name: &str, members: i32) -> RackSpec {
        RackSpec {
            name: name.to_string(),
            members,
            ..Default::default()
        }
    }

    fn rack_status(members: i32, ready: i32, version: &str) -> RackStatus {
        RackStatus {
            version: version.to_string(),
            members,
            ready_members: ready,
            conditions: Vec::new(),
        }
    }

    fn cluster(version: &str, racks: Vec<RackSpec>, statuses: Vec<(&str, RackStatus)>) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("prod".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                version: version.to_string(),
                repository: "coraldb/coral".to_string(),
                datacenter: DatacenterSpec {
                    name: "dc1".to_string(),
                    racks,
                },
                generic_upgrade: None,
            },
            status: Some(ClusterStatus {
                racks: statuses
                    .into_iter()
                    .map(|(name, status)| (name.to_string(), status))
                    .collect::<BTreeMap<_, _>>(),
                upgrade: None,
                message: None,
                last_updated: None,
            }),
        }
    }

    fn upgrade_in_flight(state: UpgradeState) -> UpgradeStatus {
        UpgradeStatus {
            state,
            node_state: None,
            current_rack: String::new(),
            current_node: 0,
            from_version: "4.2.0".to_string(),
            to_version: "5.2.0".to_string(),
            system_snapshot_tag: String::new(),
            data_snapshot_tag: String::new(),
            system_keyspaces: Vec::new(),
            all_keyspaces: Vec::new(),
        }
    }

    #[test]
    fn missing_rack_is_created_in_declared_order() {
        let c = cluster(
            "4.2.0",
            vec![rack_spec("a", 3), rack_spec("b", 3)],
            vec![("b", rack_status(3, 3, "4.2.0"))],
        );
        assert_eq!(
            next_action(&c),
            Some(ClusterAction::CreateRack {
                rack: "a".to_string()
            })
        );
    }

    #[test]
    fn converged_cluster_needs_nothing() {
        let c = cluster(
            "4.2.0",
            vec![rack_spec("a", 3)],
            vec![("a", rack_status(3, 3, "4.2.0"))],
        );
        assert_eq!(next_action(&c), None);
    }

    #[test]
    fn member_leaving_resumes_before_scale_up() {
        // Declared members exceed observed ones, but an interrupted
        // scale-down wins.
        let mut leaving = rack_status(5, 5, "4.2.0");
        leaving.set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        let c = cluster("4.2.0", vec![rack_spec("a", 6)], vec![("a", leaving)]);
        assert_eq!(
            next_action(&c),
            Some(ClusterAction::ScaleDownRack {
                rack: "a".to_string()
            })
        );
    }

    #[test]
    fn readiness_gate_blocks_post_gate_rules() {
        let c = cluster(
            "5.2.0",
            vec![rack_spec("a", 5)],
            vec![("a", rack_status(3, 2, "4.2.0"))],
        );
        // Scale-up and upgrade both apply, but the rack is not ready.
        assert_eq!(next_action(&c), None);
    }

    #[test]
    fn readiness_gate_does_not_block_rack_creation() {
        let c = cluster(
            "4.2.0",
            vec![rack_spec("a", 3), rack_spec("b", 3)],
            vec![("a", rack_status(3, 1, "4.2.0"))],
        );
        assert_eq!(
            next_action(&c),
            Some(ClusterAction::CreateRack {
                rack: "b".to_string()
            })
        );
    }

    #[test]
    fn scale_down_picked_before_scale_up() {
        let c = cluster(
            "4.2.0",
            vec![rack_spec("a", 2), rack_spec("b", 4)],
            vec![
                ("a", rack_status(3, 3, "4.2.0")),
                ("b", rack_status(3, 3, "4.2.0")),
            ],
        );
        assert_eq!(
            next_action(&c),
            Some(ClusterAction::ScaleDownRack {
                rack: "a".to_string()
            })
        );
    }

    #[test]
    fn scale_up_when_under_declared_count() {
        let c = cluster(
            "4.2.0",
            vec![rack_spec("a", 3)],
            vec![("a", rack_status(1, 1, "4.2.0"))],
        );
        assert_eq!(
            next_action(&c),
            Some(ClusterAction::ScaleUpRack {
                rack: "a".to_string()
            })
        );
    }

    #[test]
    fn version_divergence_starts_upgrade_once_ready() {
        let c = cluster(
            "5.2.0",
            vec![rack_spec("a", 3)],
            vec![("a", rack_status(3, 3, "4.2.0"))],
        );
        assert_eq!(next_action(&c), Some(ClusterAction::UpgradeVersion));
    }

    #[test]
    fn in_flight_upgrade_resumes_even_when_not_ready() {
        let mut c = cluster(
            "5.2.0",
            vec![rack_spec("a", 3)],
            // One pod is down mid-protocol.
            vec![("a", rack_status(3, 2, "4.2.0"))],
        );
        c.status.as_mut().unwrap().upgrade = Some(upgrade_in_flight(UpgradeState::PerNodeLoop));
        assert_eq!(next_action(&c), Some(ClusterAction::UpgradeVersion));
    }

    #[test]
    fn upgrade_excludes_scaling() {
        // Members changed mid-upgrade: the upgrade still wins.
        let mut c = cluster(
            "5.2.0",
            vec![rack_spec("a", 5)],
            vec![("a", rack_status(3, 3, "4.2.0"))],
        );
        c.status.as_mut().unwrap().upgrade =
            Some(upgrade_in_flight(UpgradeState::ValidateSchemaAgreement));
        assert_eq!(next_action(&c), Some(ClusterAction::UpgradeVersion));

        c.spec.datacenter.racks[0].members = 1;
        assert_eq!(next_action(&c), Some(ClusterAction::UpgradeVersion));
    }

    #[test]
    fn rack_without_observed_version_does_not_trigger_upgrade() {
        let c = cluster(
            "5.2.0",
            vec![rack_spec("a", 0)],
            vec![("a", rack_status(0, 0, ""))],
        );
        assert_eq!(next_action(&c), None);
    }
}
