//! Container runtime access
//!
//! Everything the verifier needs from docker/podman:
//! - Image presence and removal
//! - Running a container attached, with an identifier file
//! - Inspect, exec and process listing by container id
//! - Stopping containers

mod cli;

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub use cli::CliRuntime;

pub use crate::process::ExecOutput;

/// Parameters for starting a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Image to run
    pub image: String,
    /// File the runtime writes the container id into
    pub cid_file: PathBuf,
    /// Container ports to publish on random host ports
    pub publish: Vec<u16>,
    /// Environment variables for the container
    pub env: Vec<(String, String)>,
}

/// State of a container as reported by inspect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub ip: Option<IpAddr>,
}

/// A row of the container's process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: String,
    pub user: String,
    pub command: String,
}

/// Operations on the container runtime, keyed by identifier strings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether an image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Run a container attached until it exits; returns its exit code
    async fn run(&self, spec: &RunSpec) -> Result<i32>;

    /// Inspect a container; `None` if the runtime does not know it
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    /// Execute a command inside a running container
    async fn exec(
        &self,
        container_id: &str,
        user: Option<String>,
        argv: Vec<String>,
    ) -> Result<ExecOutput>;

    /// List the processes running in a container
    async fn top(&self, container_id: &str) -> Result<Vec<ProcessEntry>>;

    /// Stop a container
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove an image
    async fn remove_image(&self, image: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    id: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    networks: std::collections::BTreeMap<String, InspectEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

/// Parse `inspect` JSON output (an array with one document per container)
pub fn parse_inspect(json: &str) -> Result<Option<ContainerInfo>> {
    let documents: Vec<InspectDocument> = serde_json::from_str(json)?;

    Ok(documents.into_iter().next().map(|doc| {
        // Default bridge address first, then any attached network
        let ip = std::iter::once(doc.network_settings.ip_address.as_str())
            .chain(
                doc.network_settings
                    .networks
                    .values()
                    .map(|n| n.ip_address.as_str()),
            )
            .find_map(|addr| addr.parse::<IpAddr>().ok());

        ContainerInfo {
            id: doc.id,
            running: doc.state.running,
            ip,
        }
    }))
}

/// Parse the table printed by `top`.
///
/// The command column is last and may contain spaces, so everything after
/// the preceding columns belongs to it.
pub fn parse_top(output: &str) -> Vec<ProcessEntry> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());

    let header: Vec<String> = match lines.next() {
        Some(h) => h.split_whitespace().map(|c| c.to_uppercase()).collect(),
        None => return vec![],
    };

    let column = |names: &[&str]| header.iter().position(|c| names.contains(&c.as_str()));
    let pid_col = column(&["PID"]);
    let user_col = column(&["UID", "USER"]);
    let leading = header.len().saturating_sub(1);

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() <= leading {
                return None;
            }

            let field = |idx: Option<usize>| {
                idx.and_then(|i| fields.get(i))
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            };

            Some(ProcessEntry {
                pid: field(pid_col),
                user: field(user_col),
                command: fields[leading..].join(" "),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_docker_top() {
        let output = "\
UID                 PID                 PPID                C                   STIME               TTY                 TIME                CMD
1001                4242                4220                0                   10:01               ?                   00:00:00            nginx: master process /usr/local/openresty/nginx/sbin/nginx -c /opt/app/conf/nginx.conf
1001                4301                4242                0                   10:01               ?                   00:00:00            nginx: worker process
";
        let entries = parse_top(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, "4242");
        assert_eq!(entries[0].user, "1001");
        assert_eq!(
            entries[0].command,
            "nginx: master process /usr/local/openresty/nginx/sbin/nginx -c /opt/app/conf/nginx.conf"
        );
        assert_eq!(entries[1].command, "nginx: worker process");
    }

    #[test]
    fn test_parse_podman_top() {
        let output = "\
USER        PID         PPID        %CPU        ELAPSED         TTY         TIME        COMMAND
default     1           0           0.000       5.123s          ?           0s          nginx: master process
";
        let entries = parse_top(output);
        assert_eq!(
            entries,
            vec![ProcessEntry {
                pid: "1".to_string(),
                user: "default".to_string(),
                command: "nginx: master process".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_top_empty() {
        assert!(parse_top("").is_empty());
        assert!(parse_top("UID PID CMD\n").is_empty());
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"[{
            "Id": "abc123",
            "State": {"Running": true, "Status": "running"},
            "NetworkSettings": {"IPAddress": "", "Networks": {"bridge": {"IPAddress": "172.17.0.5"}}}
        }]"#;

        let info = parse_inspect(json).unwrap().unwrap();
        assert_eq!(info.id, "abc123");
        assert!(info.running);
        assert_eq!(info.ip, Some("172.17.0.5".parse().unwrap()));
    }

    #[test]
    fn test_parse_inspect_empty_array() {
        assert_eq!(parse_inspect("[]").unwrap(), None);
    }
}
