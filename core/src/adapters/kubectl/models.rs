//! kubectl JSON response models.

use serde::Deserialize;

use crate::ports::PodRef;

/// Phase of a pod able to serve tunnels.
pub const RUNNING_PHASE: &str = "Running";

/// Response structure for `kubectl get pods -o json`.
#[derive(Debug, Deserialize)]
pub struct PodListResponse {
    #[serde(default)]
    pub items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
pub struct PodItem {
    pub metadata: PodMetadata,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Deserialize)]
pub struct PodMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "deletionTimestamp")]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
}

impl PodItem {
    fn is_running(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self.status.phase.as_deref() == Some(RUNNING_PHASE)
    }
}

impl PodListResponse {
    /// The first running pod that is not being deleted.
    pub fn into_running_pod(self) -> Option<PodRef> {
        self.items
            .into_iter()
            .find(PodItem::is_running)
            .map(|item| PodRef {
                name: item.metadata.name,
                namespace: item.metadata.namespace,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PODS: &str = r#"{
        "apiVersion": "v1",
        "items": [
            {
                "metadata": {"name": "app-old", "namespace": "dev", "deletionTimestamp": "2024-01-01T00:00:00Z"},
                "status": {"phase": "Running"}
            },
            {
                "metadata": {"name": "app-pending", "namespace": "dev"},
                "status": {"phase": "Pending"}
            },
            {
                "metadata": {"name": "app-7f9c", "namespace": "dev"},
                "status": {"phase": "Running"}
            }
        ],
        "kind": "List"
    }"#;

    #[test]
    fn test_running_pod_selection() {
        let response: PodListResponse = serde_json::from_str(PODS).unwrap();
        let pod = response.into_running_pod().unwrap();
        assert_eq!(pod.name, "app-7f9c");
        assert_eq!(pod.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn test_empty_list_has_no_pod() {
        let response: PodListResponse = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(response.into_running_pod().is_none());
    }
}
