//! Template realization: set template -> game server, game server -> pod.

use super::OperatorConfig;
use crate::util::Error;
use gsorch_types::*;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Pod, PodAffinity,
    PodAffinityTerm, PodSpec, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{Resource, ResourceExt};

/// Volume masking the service-account token path so the game-server container
/// cannot reach the cluster API.
const NO_API_ACCESS_VOLUME: &str = "no-api-access";

/// Realizes a set's template into a fresh game server. The API server picks
/// the final name from `generateName`.
pub fn new_game_server(set: &GameServerSet, hash: &str) -> GameServer {
    let template = &set.spec.template;
    let mut gs = GameServer::new("", template.spec.clone());
    gs.metadata = template.metadata.clone().unwrap_or_default();
    gs.metadata.name = None;
    gs.metadata.generate_name = Some(format!("{}-", set.name_any()));
    gs.metadata.namespace = set.namespace();

    let labels = gs.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(ROLE_LABEL.to_owned(), GAME_SERVER_ROLE.to_owned());
    labels.insert(GAME_SERVER_SET_LABEL.to_owned(), set.name_any());
    labels.insert(GAME_SERVER_HASH_LABEL.to_owned(), hash.to_owned());

    gs.metadata.owner_references = set.controller_owner_ref(&()).map(|r| vec![r]);

    apply_defaults(&mut gs);
    gs
}

/// Fills in every defaulted field. Applying this to an already-defaulted
/// server is a fixed point.
pub fn apply_defaults(gs: &mut GameServer) {
    gs.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(GROUP_VERSION_ANNOTATION.to_owned(), API_VERSION.to_owned());

    let finalizers = gs.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_owned());
    }

    let host_network = gs
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false);
    if host_network {
        for port in gs.spec.ports.iter_mut().flatten() {
            port.port_policy.get_or_insert(PortPolicy::Dynamic);
            port.protocol.get_or_insert_with(|| "UDP".to_owned());
        }
    }

    gs.spec.scheduling.get_or_insert(SchedulingStrategy::MostAllocated);

    let sidecar = gs.spec.sidecar.get_or_insert_with(Default::default);
    sidecar
        .log_level
        .get_or_insert_with(|| DEFAULT_SIDECAR_LOG_LEVEL.to_owned());
    sidecar.grpc_port.get_or_insert(DEFAULT_SIDECAR_GRPC_PORT);
    sidecar.http_port.get_or_insert(DEFAULT_SIDECAR_HTTP_PORT);

    gs.status
        .get_or_insert_with(Default::default)
        .state
        .get_or_insert(GameServerState::Starting);
}

fn find_container<'a>(spec: &'a mut PodSpec, name: &str) -> Result<&'a mut Container, Error> {
    spec.containers
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::MissingContainer(name.to_owned()))
}

/// Builds the pod backing a game server from its pod template.
pub fn build_pod(gs: &GameServer, config: &OperatorConfig) -> Result<Pod, Error> {
    let template = gs.spec.template.clone();

    let mut metadata = template.metadata.unwrap_or_default();
    metadata.generate_name = None;
    metadata.resource_version = None;
    metadata.uid = None;
    metadata.name = Some(gs.name_any());
    metadata.namespace = gs.namespace();

    let labels = metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in gs.labels() {
        labels.insert(k.clone(), v.clone());
    }
    labels.insert(ROLE_LABEL.to_owned(), GAME_SERVER_ROLE.to_owned());
    labels.insert(GAME_SERVER_POD_LABEL.to_owned(), gs.name_any());

    let annotations = metadata.annotations.get_or_insert_with(Default::default);
    for (k, v) in gs.annotations() {
        annotations.insert(k.clone(), v.clone());
    }
    annotations.insert(GROUP_VERSION_ANNOTATION.to_owned(), API_VERSION.to_owned());

    metadata.owner_references = gs.controller_owner_ref(&()).map(|r| vec![r]);

    let mut spec = template.spec.unwrap_or_default();

    if spec.host_network.unwrap_or(false) {
        let server = find_container(&mut spec, GAME_SERVER_CONTAINER)?;
        let mut ports = server.ports.take().unwrap_or_default();
        for port in gs.spec.ports.iter().flatten() {
            if let Some(container_port) = port.container_port {
                ports.push(ContainerPort {
                    container_port,
                    host_port: port.host_port,
                    protocol: port.protocol.clone(),
                    ..Default::default()
                });
            } else if let (Some(container_range), Some(host_range)) =
                (&port.container_port_range, &port.host_port_range)
            {
                for container_port in container_range.min_port..=container_range.max_port {
                    ports.push(ContainerPort {
                        container_port,
                        host_port: Some(
                            host_range.min_port + (container_port - container_range.min_port),
                        ),
                        protocol: port.protocol.clone(),
                        ..Default::default()
                    });
                }
            }
        }
        server.ports = Some(ports);
    } else {
        // The container must exist even when no port surgery happens.
        find_container(&mut spec, GAME_SERVER_CONTAINER)?;
    }

    let sidecar = gs.spec.sidecar.clone().unwrap_or_default();
    let grpc_port = sidecar.grpc_port.unwrap_or(DEFAULT_SIDECAR_GRPC_PORT);
    let http_port = sidecar.http_port.unwrap_or(DEFAULT_SIDECAR_HTTP_PORT);
    spec.containers.push(Container {
        name: SIDECAR_CONTAINER.to_owned(),
        image: Some(config.sidecar_image.clone()),
        args: Some(vec![
            format!(
                "--log-level={}",
                sidecar.log_level.as_deref().unwrap_or(DEFAULT_SIDECAR_LOG_LEVEL)
            ),
            format!("--grpc-port={}", grpc_port),
            format!("--http-port={}", http_port),
        ]),
        ports: Some(vec![
            ContainerPort {
                container_port: grpc_port,
                ..Default::default()
            },
            ContainerPort {
                container_port: http_port,
                ..Default::default()
            },
        ]),
        ..Default::default()
    });

    if spec.service_account_name.as_deref().unwrap_or("").is_empty() {
        spec.service_account_name = Some(config.sidecar_service_account.clone());
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: NO_API_ACCESS_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        find_container(&mut spec, GAME_SERVER_CONTAINER)?
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: NO_API_ACCESS_VOLUME.to_owned(),
                mount_path: SERVICE_ACCOUNT_SECRET_PATH.to_owned(),
                ..Default::default()
            });
    }

    if gs.spec.scheduling == Some(SchedulingStrategy::MostAllocated) {
        inject_packing_affinity(&mut spec);
    }

    for container in spec
        .containers
        .iter_mut()
        .filter(|c| c.name != SIDECAR_CONTAINER)
    {
        upsert_env_value(container, SDK_GRPC_PORT_ENV, &grpc_port.to_string());
        upsert_env_value(container, SDK_HTTP_PORT_ENV, &http_port.to_string());
    }

    Ok(Pod {
        metadata,
        spec: Some(spec),
        status: None,
    })
}

/// Prefer landing next to other game servers on the same node so that whole
/// nodes free up under scale-in.
fn inject_packing_affinity(spec: &mut PodSpec) {
    spec.affinity
        .get_or_insert_with(Affinity::default)
        .pod_affinity
        .get_or_insert_with(PodAffinity::default)
        .preferred_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(WeightedPodAffinityTerm {
            weight: 100,
            pod_affinity_term: PodAffinityTerm {
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_owned(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(
                        [(ROLE_LABEL.to_owned(), GAME_SERVER_ROLE.to_owned())].into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            },
        });
}

fn upsert_env_value(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(var) => {
            var.value = Some(value.to_owned());
            var.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_owned(),
            value: Some(value.to_owned()),
            ..Default::default()
        }),
    }
}

/// Copies image, resources, and env from a template container into a live
/// one. Env entries are upserted by name; everything else on the target is
/// left alone.
pub fn copy_game_server_container(target: &mut Container, source: &Container) {
    target.image = source.image.clone();
    target.resources = source.resources.clone();
    let env = target.env.get_or_insert_with(Vec::new);
    for var in source.env.iter().flatten() {
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => env.push(var.clone()),
        }
    }
}

/// In-place update of a running pod from its game server's template: only the
/// game-server container changes.
pub fn update_pod_spec(gs: &GameServer, pod: &mut Pod) -> Result<(), Error> {
    let source = gs
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == GAME_SERVER_CONTAINER))
        .ok_or_else(|| Error::MissingContainer(GAME_SERVER_CONTAINER.to_owned()))?;
    let pod_spec = pod
        .spec
        .as_mut()
        .ok_or_else(|| Error::MissingContainer(GAME_SERVER_CONTAINER.to_owned()))?;
    let target = find_container(pod_spec, GAME_SERVER_CONTAINER)?;
    copy_game_server_container(target, source);
    Ok(())
}
