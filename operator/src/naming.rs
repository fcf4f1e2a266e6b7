use const_format::concatcp;
use coral_types::{Cluster, RackSpec};
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::util::Error;

/// Label namespace for operator-owned objects.
pub const LABEL_PREFIX: &str = "db.coral.io/";

pub const CLUSTER_NAME_LABEL: &str = concatcp!(LABEL_PREFIX, "cluster-name");
pub const RACK_NAME_LABEL: &str = concatcp!(LABEL_PREFIX, "rack-name");
pub const ORDINAL_LABEL: &str = concatcp!(LABEL_PREFIX, "ordinal");

/// Present (with an empty value) on a member Service while the node is in
/// maintenance mode; traffic is diverted away from labeled members.
pub const NODE_MAINTENANCE_LABEL: &str = concatcp!(LABEL_PREFIX, "node-maintenance");

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_NAME: &str = "coral";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "coral-operator";

/// Label the StatefulSet controller stamps on each pod; member Services
/// select a single pod through it.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Name of the database container inside member pods.
pub const CONTAINER_NAME: &str = "coral";

/// Name of the operator-managed sidecar container.
pub const SIDECAR_CONTAINER_NAME: &str = "coral-sidecar";

pub const CQL_PORT: i32 = 9042;
pub const INTER_NODE_PORT: i32 = 7000;

/// Warning/normal event reasons, fixed set.
pub mod reasons {
    pub const SYNC_FAILED: &str = "SyncFailed";
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    pub const UPGRADE_FINISHED: &str = "UpgradeFinished";
    pub const RACK_CREATED: &str = "RackCreated";
    pub const RACK_SCALED: &str = "RackScaled";
}

pub fn statefulset_name(cluster: &Cluster, rack: &RackSpec) -> String {
    format!("{}-{}", cluster.name_any(), rack.name)
}

pub fn member_name(cluster: &Cluster, rack_name: &str, ordinal: i32) -> String {
    format!("{}-{}-{}", cluster.name_any(), rack_name, ordinal)
}

pub fn headless_service_name(cluster: &Cluster) -> String {
    format!("{}-client", cluster.name_any())
}

/// Stable DNS name of a member inside the cluster network.
pub fn member_host(member: &str, namespace: &str) -> String {
    format!("{}.{}.svc", member, namespace)
}

pub fn cluster_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    labels
}

pub fn rack_labels(cluster: &Cluster, rack_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(RACK_NAME_LABEL.to_string(), rack_name.to_string());
    labels
}

pub fn member_labels(cluster: &Cluster, rack_name: &str, ordinal: i32) -> BTreeMap<String, String> {
    let mut labels = rack_labels(cluster, rack_name);
    labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());
    labels
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn cluster_selector(cluster: &Cluster) -> String {
    selector_string(&cluster_labels(cluster))
}

pub fn rack_selector(cluster: &Cluster, rack_name: &str) -> String {
    selector_string(&rack_labels(cluster, rack_name))
}

pub fn image_for(repository: &str, version: &str) -> String {
    format!("{}:{}", repository, version)
}

/// Extracts the version tag from a container image reference.
/// `registry:5000/coraldb/coral:5.2.0` → `5.2.0`.
pub fn version_from_image(image: &str) -> Result<String, Error> {
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() && !tag.contains('/') => Ok(tag.to_string()),
        _ => Err(Error::UserInput(format!(
            "image '{}' has no version tag",
            image
        ))),
    }
}

/// Leading `major.minor` pair of a version string; the tail (patch,
/// pre-release) is ignored. Unparseable versions are a user error.
pub fn major_minor(version: &str) -> Result<(u64, u64), Error> {
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| Error::UserInput(format!("unparseable version '{}'", version)))?;
    let minor = parts
        .next()
        .map(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().map_err(|_| {
                Error::UserInput(format!("unparseable version '{}'", version))
            })
        })
        .transpose()?
        .unwrap_or(0);
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_types::ClusterSpec;
    use kube::api::ObjectMeta;

    fn cluster(name: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn member_names_are_ordinal_indexed() {
        let c = cluster("prod");
        assert_eq!(member_name(&c, "us-east-1a", 2), "prod-us-east-1a-2");
        assert_eq!(headless_service_name(&c), "prod-client");
        assert_eq!(
            member_host("prod-us-east-1a-2", "default"),
            "prod-us-east-1a-2.default.svc"
        );
    }

    #[test]
    fn selectors_cover_identity_labels() {
        let c = cluster("prod");
        let selector = rack_selector(&c, "a");
        assert!(selector.contains("db.coral.io/cluster-name=prod"));
        assert!(selector.contains("db.coral.io/rack-name=a"));
        assert!(selector.contains("app.kubernetes.io/name=coral"));
    }

    #[test]
    fn version_parses_from_image_tail() {
        assert_eq!(version_from_image("coraldb/coral:5.2.0").unwrap(), "5.2.0");
        assert_eq!(
            version_from_image("registry:5000/coraldb/coral:4.2.1").unwrap(),
            "4.2.1"
        );
        assert!(version_from_image("coraldb/coral").is_err());
        assert!(version_from_image("registry:5000/coraldb/coral").is_err());
    }

    #[test]
    fn major_minor_ignores_patch_and_prerelease() {
        assert_eq!(major_minor("4.2.0").unwrap(), (4, 2));
        assert_eq!(major_minor("5.2.0-rc1").unwrap(), (5, 2));
        assert_eq!(major_minor("5").unwrap(), (5, 0));
        assert!(major_minor("latest").is_err());
    }
}
