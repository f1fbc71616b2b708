//! [ContainerPlatform] backed by the Docker Engine API.

use super::{Container, ContainerPlatform, ContainerSpec, ExecOutput, NetworkHandle};
use crate::Error;
use bollard::{
    exec::{StartExecOptions, StartExecResults},
    models::{
        ContainerCreateBody, ExecConfig, HostConfig, NetworkCreateRequest, PortBinding,
        RestartPolicy, RestartPolicyNameEnum,
    },
    query_parameters::{
        CreateContainerOptionsBuilder, InspectContainerOptions, RemoveContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder, WaitContainerOptions,
    },
    Docker as Client,
};
use futures::StreamExt;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
};
use tracing::{debug, info, warn};

/// Docker Engine client.
#[derive(Clone)]
pub struct Docker {
    client: Client,
}

impl Docker {
    /// Connects to the local Docker daemon (socket or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, Error> {
        let client = Client::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Resolves the host address of every published port.
    async fn resolve_ports(&self, id: &str) -> Result<BTreeMap<u16, String>, Error> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let mut ports = BTreeMap::new();
        let bindings = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();
        for (key, bindings) in bindings {
            let Some(port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
                continue;
            };
            let Some(binding) = bindings.unwrap_or_default().into_iter().next() else {
                continue;
            };
            let Some(host_port) = binding.host_port.filter(|p| !p.is_empty()) else {
                continue;
            };
            let host_ip = match binding.host_ip.as_deref() {
                None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1".to_string(),
                Some(ip) => ip.to_string(),
            };
            ports.insert(port, format!("{host_ip}:{host_port}"));
        }
        Ok(ports)
    }

    /// Removes a container and its anonymous volumes, running or not.
    async fn force_remove(&self, id: &str) -> Result<(), Error> {
        let remove = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();
        match self.client.remove_container(id, Some(remove)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Returns `result`, awaiting `reclaim` first if it failed.
///
/// The error of `result` is kept when `reclaim` fails too.
async fn or_reclaim<T, F, Fut>(result: Result<T, Error>, reclaim: F) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    if result.is_err() {
        if let Err(err) = reclaim().await {
            warn!(error = %err, "failed to reclaim container");
        }
    }
    result
}

/// Exit code of a finished exec.
fn exit_code(code: Option<i64>, container: &Container) -> Result<i64, Error> {
    code.ok_or_else(|| Error::UnexpectedResponse {
        endpoint: "exec/json".to_string(),
        reason: format!("no exit code for exec in {}", container.name),
    })
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl ContainerPlatform for Docker {
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, Error> {
        let response = self
            .client
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        if response.id.is_empty() {
            return Err(Error::UnexpectedResponse {
                endpoint: "networks/create".to_string(),
                reason: format!("no id returned for network {name}"),
            });
        }
        info!(network = name, id = response.id.as_str(), "created network");
        Ok(NetworkHandle {
            id: response.id,
            name: name.to_string(),
        })
    }

    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), Error> {
        match self.client.remove_network(&network.id).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn start(&self, spec: ContainerSpec) -> Result<Container, Error> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|port| {
                (
                    format!("{}/tcp", port.container),
                    Some(vec![PortBinding {
                        host_ip: Some(String::new()),
                        host_port: Some(port.host.map(|p| p.to_string()).unwrap_or_default()),
                    }]),
                )
            })
            .collect();
        let exposed_ports = spec
            .ports
            .iter()
            .map(|port| (format!("{}/tcp", port.container), HashMap::new()))
            .collect();

        // Never restart a crashed container
        let host_config = HostConfig {
            binds: Some(spec.mounts.clone()),
            network_mode: spec.network.clone(),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.reference()),
            cmd: Some(spec.cmd.clone()),
            entrypoint: spec.entrypoint.clone(),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let id = self.client.create_container(Some(options), body).await?.id;

        // A container that was created but never reported is removed here
        let launched: Result<BTreeMap<u16, String>, Error> = async {
            self.client
                .start_container(&id, None::<StartContainerOptions>)
                .await?;
            self.resolve_ports(&id).await
        }
        .await;
        let ports = or_reclaim(launched, || self.force_remove(&id)).await?;
        info!(
            name = spec.name.as_str(),
            id = id.as_str(),
            image = spec.image.reference().as_str(),
            kind = spec.kind.as_str(),
            "started container"
        );
        Ok(Container {
            id,
            name: spec.name,
            ports,
        })
    }

    async fn remove(&self, container: &Container) -> Result<(), Error> {
        // Give the node ten seconds to flush state before it is killed
        let stop = StopContainerOptionsBuilder::default().t(10).build();
        match self.client.stop_container(&container.id, Some(stop)).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(err) => return Err(err.into()),
        }
        let remove = RemoveContainerOptionsBuilder::default().build();
        self.client
            .remove_container(&container.id, Some(remove))
            .await?;
        info!(name = container.name.as_str(), "removed container");
        Ok(())
    }

    async fn purge(&self, container: &Container) -> Result<(), Error> {
        self.force_remove(&container.id).await?;
        info!(name = container.name.as_str(), "purged container");
        Ok(())
    }

    async fn wait(&self, container: &Container) -> Result<i64, Error> {
        let mut stream = Box::pin(
            self.client
                .wait_container(&container.id, None::<WaitContainerOptions>),
        );
        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // A non-zero exit is reported as an error carrying the exit code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(Error::UnexpectedResponse {
                    endpoint: "containers/wait".to_string(),
                    reason: format!("no exit status for {}", container.name),
                })
            }
        };
        debug!(name = container.name.as_str(), code, "container exited");
        Ok(code)
    }

    async fn exec(&self, container: &Container, cmd: Vec<String>) -> Result<ExecOutput, Error> {
        debug!(name = container.name.as_str(), cmd = %cmd.join(" "), "executing");
        let exec = self
            .client
            .create_exec(
                &container.id,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some("root".to_string()),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        output.exit_code = exit_code(inspect.exit_code, container)?;
        Ok(output)
    }
}
