//! Container lifecycle adapter.
//!
//! The suite only needs a handful of container operations: start a container from an image with
//! mounts, ports, and environment; remove it; purge short-lived containers; and execute a command
//! inside a running container. [ContainerPlatform] captures exactly that surface.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future, time::Duration};

pub mod docker;

/// Label recording which chain a container belongs to.
pub const CHAIN_LABEL: &str = "e2e.chain";

/// Label recording the role a container plays in the run.
pub const KIND_LABEL: &str = "e2e.kind";

/// Label recording the validator index of a validator container.
pub const INDEX_LABEL: &str = "e2e.index";

/// Repository and tag of a container image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub repository: String,
    pub tag: String,
}

impl Image {
    pub fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Fully qualified reference (`repository:tag`).
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// What a container is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Init,
    Validator,
    Relayer,
    StateSync,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Init => "init",
            Kind::Validator => "validator",
            Kind::Relayer => "relayer",
            Kind::StateSync => "state-sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "init" => Some(Kind::Init),
            "validator" => Some(Kind::Validator),
            "relayer" => Some(Kind::Relayer),
            "state-sync" => Some(Kind::StateSync),
            _ => None,
        }
    }
}

/// A port exposed by a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub container: u16,
    /// Host port to bind to (`None` lets the platform pick one).
    pub host: Option<u16>,
}

/// Everything needed to create and start a container.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: Image,
    pub kind: Kind,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub user: Option<String>,
    pub env: Vec<String>,
    /// Bind mounts in `host:container` form.
    pub mounts: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub labels: BTreeMap<String, String>,
    /// Virtual network to attach to.
    pub network: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: Image, kind: Kind) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(KIND_LABEL.to_string(), kind.as_str().to_string());
        Self {
            name: name.into(),
            image,
            kind,
            cmd: Vec::new(),
            entrypoint: None,
            user: None,
            env: Vec::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            labels,
            network: None,
        }
    }

    pub fn cmd<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn mount(mut self, host: &str, container: &str) -> Self {
        self.mounts.push(format!("{host}:{container}"));
        self
    }

    pub fn port(mut self, container: u16, host: Option<u16>) -> Self {
        self.ports.push(PortSpec { container, host });
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn network(mut self, network: Option<&NetworkHandle>) -> Self {
        self.network = network.map(|n| n.id.clone());
        self
    }
}

/// A started container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    /// Name without the leading slash (also its host name on the virtual network).
    pub name: String,
    /// Host address (`ip:port`) for each exposed container port.
    pub ports: BTreeMap<u16, String>,
}

impl Container {
    /// Host address bound to `port`.
    pub fn host_addr(&self, port: u16) -> Result<&str, Error> {
        self.ports
            .get(&port)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingPort {
                container: self.name.clone(),
                port,
            })
    }
}

/// A virtual network containers attach to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
}

/// Result of a command executed inside a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Converts a non-zero exit code into [Error::ExecFailed].
    pub fn check(self, container: &Container, command: &[String]) -> Result<Self, Error> {
        if self.exit_code == 0 {
            return Ok(self);
        }
        Err(Error::ExecFailed {
            container: container.name.clone(),
            command: command.join(" "),
            exit_code: self.exit_code,
            output: if self.stderr.is_empty() {
                self.stdout
            } else {
                self.stderr
            },
        })
    }
}

/// Fails with [Error::Timeout] if `operation` does not complete within `limit`.
///
/// Exec and wait calls block on the container, so every caller bounds them with this.
pub async fn bounded<T>(
    condition: &str,
    limit: Duration,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            condition: condition.to_string(),
            last: format!("no result after {}s", limit.as_secs()),
        }),
    }
}

/// Interface to the platform that runs containers.
///
/// Implementations must never restart a container that exits: a crash has to surface as a
/// failed condition rather than be masked by the platform.
pub trait ContainerPlatform: Clone + Send + Sync + 'static {
    /// Creates a virtual network containers can attach to.
    fn create_network(&self, name: &str)
        -> impl Future<Output = Result<NetworkHandle, Error>> + Send;

    /// Removes a virtual network.
    fn remove_network(&self, network: &NetworkHandle)
        -> impl Future<Output = Result<(), Error>> + Send;

    /// Creates and starts a container.
    fn start(&self, spec: ContainerSpec) -> impl Future<Output = Result<Container, Error>> + Send;

    /// Stops and deletes a container.
    fn remove(&self, container: &Container) -> impl Future<Output = Result<(), Error>> + Send;

    /// Force-deletes a container and its anonymous volumes.
    ///
    /// Succeeds if the container is already gone.
    fn purge(&self, container: &Container) -> impl Future<Output = Result<(), Error>> + Send;

    /// Waits for a container to exit and returns its exit code.
    fn wait(&self, container: &Container) -> impl Future<Output = Result<i64, Error>> + Send;

    /// Executes a command inside a running container and collects its output.
    fn exec(
        &self,
        container: &Container,
        cmd: Vec<String>,
    ) -> impl Future<Output = Result<ExecOutput, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let network = NetworkHandle {
            id: "net-id".into(),
            name: "e2e-net".into(),
        };
        let spec = ContainerSpec::new("chain-a-val-0", Image::new("ledger", "v1"), Kind::Validator)
            .cmd(["start"])
            .user("root:root")
            .env("KEY", "value")
            .mount("/tmp/config", "/home/.daemon")
            .port(26657, None)
            .label(CHAIN_LABEL, "chain-a")
            .network(Some(&network));
        assert_eq!(spec.cmd, vec!["start".to_string()]);
        assert_eq!(spec.env, vec!["KEY=value".to_string()]);
        assert_eq!(spec.mounts, vec!["/tmp/config:/home/.daemon".to_string()]);
        assert_eq!(spec.labels[KIND_LABEL], "validator");
        assert_eq!(spec.labels[CHAIN_LABEL], "chain-a");
        assert_eq!(spec.network.as_deref(), Some("net-id"));
        assert_eq!(spec.image.reference(), "ledger:v1");
    }

    #[test]
    fn test_exec_output_check() {
        let container = Container {
            id: "1".into(),
            name: "relayer".into(),
            ports: BTreeMap::new(),
        };
        let cmd = vec!["hermes".to_string(), "create".to_string()];
        let ok = ExecOutput {
            exit_code: 0,
            stdout: "done".into(),
            stderr: String::new(),
        };
        assert_eq!(ok.clone().check(&container, &cmd).unwrap(), ok);

        let failed = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "no such channel".into(),
        };
        match failed.check(&container, &cmd).unwrap_err() {
            Error::ExecFailed {
                command,
                exit_code,
                output,
                ..
            } => {
                assert_eq!(command, "hermes create");
                assert_eq!(exit_code, 2);
                assert_eq!(output, "no such channel");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded() {
        let limit = Duration::from_secs(30);
        let value = bounded("quick", limit, async { Ok::<_, Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let start = tokio::time::Instant::now();
        let err = bounded("relayer to exit", limit, std::future::pending::<Result<(), Error>>())
            .await
            .unwrap_err();
        match err {
            Error::Timeout { condition, .. } => assert_eq!(condition, "relayer to exit"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() >= limit);
    }

    #[test]
    fn test_missing_port() {
        let container = Container {
            id: "1".into(),
            name: "val".into(),
            ports: BTreeMap::from([(26657, "127.0.0.1:49153".to_string())]),
        };
        assert_eq!(container.host_addr(26657).unwrap(), "127.0.0.1:49153");
        assert!(matches!(
            container.host_addr(3031),
            Err(Error::MissingPort { port: 3031, .. })
        ));
    }
}
