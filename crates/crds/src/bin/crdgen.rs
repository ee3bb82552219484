//! Prints the CRD manifests for this workspace as multi-document YAML.
//!
//! Run with `cargo run -p crds --bin crdgen > deploy/crds.yaml` to refresh the
//! manifests checked into the deployment directory.

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = vec![
        serde_yaml::to_string(&crds::NodeNetworkConfig::crd())?,
        serde_yaml::to_string(&crds::ClusterSubnetState::crd())?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}
