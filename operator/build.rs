use gsorch_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/gsorch.dev_gameserver_crd.yaml",
        serde_yaml::to_string(&GameServer::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/gsorch.dev_gameserverset_crd.yaml",
        serde_yaml::to_string(&GameServerSet::crd()).unwrap(),
    )
    .unwrap();
}
