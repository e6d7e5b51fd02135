//! Kubernetes client construction

use std::path::Path;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Create a client from an explicit kubeconfig, or fall back to the
/// in-cluster service account / `~/.kube/config`
pub async fn connect(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let Some(path) = kubeconfig else {
        return kube::Client::try_default()
            .await
            .context("Failed to create Kubernetes client. Is the agent running in-cluster?");
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig file: {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| {
            format!(
                "Failed to create config from kubeconfig: {}",
                path.display()
            )
        })?;

    kube::Client::try_from(config).context("Failed to create Kubernetes client from kubeconfig")
}

/// Field selector restricting a pod watch to one node
pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={}", node_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_field_selector() {
        assert_eq!(node_field_selector("worker-1"), "spec.nodeName=worker-1");
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_an_error() {
        let result = connect(Some(Path::new("/nonexistent/podtail/kubeconfig"))).await;
        let Err(error) = result else {
            panic!("expected a missing kubeconfig to fail");
        };
        assert!(format!("{:#}", error).contains("Failed to read kubeconfig file"));
    }
}
