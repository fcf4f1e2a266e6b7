use coral_types::Cluster;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/db.coral.io_clusters.yaml",
        serde_yaml::to_string(&Cluster::crd()).unwrap(),
    )
    .unwrap();
}
