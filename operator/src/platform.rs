use async_trait::async_trait;
use coral_types::{Cluster, ClusterStatus};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, Service},
};
use kube::{
    Api, Client,
    api::{ListParams, Patch, PatchParams},
};
use std::sync::Arc;

use crate::util::{Error, MANAGER_NAME, patch::patch_status};

/// Typed access to the platform objects the operator owns. Everything the
/// reconciler and the actions touch goes through this facade so tests can
/// substitute an in-memory world. Mutations rely on the API server's
/// resource-version concurrency control; a conflict surfaces as a
/// transient error and the next trigger re-reads.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>, Error>;
    async fn create_statefulset(&self, ns: &str, sts: &StatefulSet) -> Result<(), Error>;
    async fn set_statefulset_replicas(&self, ns: &str, name: &str, replicas: i32)
    -> Result<(), Error>;
    async fn set_statefulset_image(
        &self,
        ns: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<(), Error>;
    async fn set_rolling_update_partition(
        &self,
        ns: &str,
        name: &str,
        partition: i32,
    ) -> Result<(), Error>;

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, Error>;
    async fn list_services(&self, ns: &str, selector: &str) -> Result<Vec<Service>, Error>;
    async fn apply_service(&self, ns: &str, service: &Service) -> Result<(), Error>;
    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), Error>;
    /// `None` removes the label.
    async fn set_service_label(
        &self,
        ns: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), Error>;

    async fn get_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>, Error>;
    async fn delete_pod(&self, ns: &str, name: &str) -> Result<(), Error>;

    async fn update_cluster_status(
        &self,
        instance: &Cluster,
        status: ClusterStatus,
    ) -> Result<(), Error>;
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| {
            cs.iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Arc<dyn PlatformClient> {
        Arc::new(KubePlatform { client })
    }

    fn statefulsets(&self, ns: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn services(&self, ns: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn pods(&self, ns: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl PlatformClient for KubePlatform {
    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>, Error> {
        match self.statefulsets(ns).get(name).await {
            Ok(sts) => Ok(Some(sts)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_statefulset(&self, ns: &str, sts: &StatefulSet) -> Result<(), Error> {
        match self.statefulsets(ns).create(&Default::default(), sts).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_statefulset_replicas(
        &self,
        ns: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.statefulsets(ns)
            .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn set_statefulset_image(
        &self,
        ns: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{ "name": container, "image": image }],
                    },
                },
            },
        });
        self.statefulsets(ns)
            .patch(
                name,
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Strategic(patch),
            )
            .await?;
        Ok(())
    }

    async fn set_rolling_update_partition(
        &self,
        ns: &str,
        name: &str,
        partition: i32,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": {
                "updateStrategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": { "partition": partition },
                },
            },
        });
        self.statefulsets(ns)
            .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, Error> {
        match self.services(ns).get(name).await {
            Ok(service) => Ok(Some(service)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_services(&self, ns: &str, selector: &str) -> Result<Vec<Service>, Error> {
        let list = self
            .services(ns)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn apply_service(&self, ns: &str, service: &Service) -> Result<(), Error> {
        match self.services(ns).create(&Default::default(), service).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // The service exists; converge the identity labels and the
                // selector without clobbering labels owned by other steps
                // (notably the maintenance label).
                let name = service
                    .metadata
                    .name
                    .as_deref()
                    .ok_or_else(|| Error::UserInput("service missing name".to_string()))?;
                let patch = serde_json::json!({
                    "metadata": { "labels": service.metadata.labels },
                    "spec": { "selector": service.spec.as_ref().and_then(|s| s.selector.clone()) },
                });
                self.services(ns)
                    .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), Error> {
        match self.services(ns).delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_service_label(
        &self,
        ns: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), Error> {
        // A null value in a merge patch removes the key.
        let patch = serde_json::json!({ "metadata": { "labels": { (key): value } } });
        self.services(ns)
            .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>, Error> {
        match self.pods(ns).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, ns: &str, name: &str) -> Result<(), Error> {
        match self.pods(ns).delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_cluster_status(
        &self,
        instance: &Cluster,
        status: ClusterStatus,
    ) -> Result<(), Error> {
        patch_status(self.client.clone(), instance, move |s: &mut ClusterStatus| {
            *s = status;
        })
        .await?;
        Ok(())
    }
}
