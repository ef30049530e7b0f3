//! kubemod helm: translate Kubernetes connection options into the Helm
//! environment and run the `helm` binary.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::Path;

use kubemod_core::{Error, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

pub const GENERATED_CLUSTER: &str = "generated-cluster";
pub const GENERATED_CONTEXT: &str = "generated-context";

/// Helm binary from `KUBEMOD_HELM_BIN`, defaulting to `helm` on `PATH`.
pub fn helm_binary() -> String {
    std::env::var("KUBEMOD_HELM_BIN").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "helm".to_string())
}

/// Connection options shared with the other modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConnection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Path to an existing kubeconfig.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default = "default_validate_certs")]
    pub validate_certs: bool,
}

fn default_validate_certs() -> bool {
    true
}

impl Default for KubeConnection {
    fn default() -> Self {
        Self { host: None, api_key: None, context: None, namespace: None, kubeconfig: None, ca_cert: None, validate_certs: true }
    }
}

impl KubeConnection {
    fn needs_generated_kubeconfig(&self) -> bool {
        self.host.is_some() && (self.ca_cert.is_some() || !self.validate_certs)
    }
}

#[derive(Serialize)]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster<'a>>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
}

#[derive(Serialize)]
struct NamedCluster<'a> {
    name: &'static str,
    cluster: ClusterEntry<'a>,
}

#[derive(Serialize)]
struct ClusterEntry<'a> {
    server: &'a str,
    #[serde(rename = "certificate-authority", skip_serializing_if = "Option::is_none")]
    certificate_authority: Option<&'a str>,
    #[serde(rename = "insecure-skip-tls-verify", skip_serializing_if = "Option::is_none")]
    insecure_skip_tls_verify: Option<bool>,
}

#[derive(Serialize)]
struct NamedContext {
    name: &'static str,
    context: ContextEntry,
}

#[derive(Serialize)]
struct ContextEntry {
    cluster: &'static str,
}

fn write_kubeconfig(server: &str, conn: &KubeConnection) -> Result<NamedTempFile> {
    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: GENERATED_CLUSTER,
            cluster: ClusterEntry {
                server,
                certificate_authority: conn.ca_cert.as_deref(),
                insecure_skip_tls_verify: (!conn.validate_certs).then_some(true),
            },
        }],
        contexts: vec![NamedContext { name: GENERATED_CONTEXT, context: ContextEntry { cluster: GENERATED_CLUSTER } }],
        current_context: GENERATED_CONTEXT,
    };
    let yaml = serde_yaml::to_string(&config).map_err(|e| Error::InvalidDefinition(format!("rendering kubeconfig: {}", e)))?;
    let mut file = tempfile::Builder::new().prefix("kubemod-helm-").suffix(".kubeconfig").tempfile()?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Environment for one Helm invocation.
///
/// Owns the generated kubeconfig, if any; the file is removed when this value
/// is dropped.
#[derive(Debug)]
pub struct HelmEnv {
    vars: Vec<(String, String)>,
    kubeconfig: Option<NamedTempFile>,
}

impl HelmEnv {
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn generated_kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_ref().map(|f| f.path())
    }
}

/// Map connection options onto `HELM_*` and `KUBECONFIG` variables.
pub fn prepare_env(conn: &KubeConnection) -> Result<HelmEnv> {
    let mut vars = Vec::new();
    let pairs = [
        ("HELM_KUBECONTEXT", &conn.context),
        ("HELM_NAMESPACE", &conn.namespace),
        ("HELM_KUBETOKEN", &conn.api_key),
        ("HELM_KUBEAPISERVER", &conn.host),
    ];
    for (key, value) in pairs {
        if let Some(v) = value {
            vars.push((key.to_string(), v.clone()));
        }
    }

    let kubeconfig = match conn.host.as_deref() {
        Some(server) if conn.needs_generated_kubeconfig() => {
            let file = write_kubeconfig(server, conn)?;
            debug!(path = %file.path().display(), "generated kubeconfig");
            vars.push(("KUBECONFIG".to_string(), file.path().display().to_string()));
            Some(file)
        }
        _ => {
            if let Some(path) = &conn.kubeconfig {
                vars.push(("KUBECONFIG".to_string(), path.clone()));
            }
            None
        }
    };
    Ok(HelmEnv { vars, kubeconfig })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

/// Run `binary args..` with the connection environment.
///
/// A non-zero exit becomes [`Error::HelmFailed`] carrying the captured output.
pub async fn run_helm(binary: &str, args: &[String], conn: &KubeConnection) -> Result<HelmOutput> {
    let env = prepare_env(conn)?;
    let command = std::iter::once(binary).chain(args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ");
    counter!("helm_runs", 1u64);
    info!(command = %command, "running helm");

    let output = Command::new(binary).args(args).envs(env.vars().iter().map(|(k, v)| (k.as_str(), v.as_str()))).output().await?;
    drop(env);

    let rc = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        debug!(rc, stderr = %stderr, "helm failed");
        return Err(Error::HelmFailed { command, rc, stdout, stderr });
    }
    Ok(HelmOutput { rc, stdout, stderr, command })
}
