use crate::clients::{check_response, http_client, ClientError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const FIELD_MANAGER: &str = "deployflow";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub image: String,
    pub replicas: i32,
    pub port: i32,
    /// Secret whose keys are exposed as environment variables.
    pub env_secret: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkServiceSpec {
    pub namespace: String,
    pub name: String,
    pub port: i32,
    pub target_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressSpec {
    pub namespace: String,
    pub name: String,
    pub hosts: Vec<String>,
    pub service_name: String,
    pub service_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub desired: i32,
    pub ready: i32,
    pub available: i32,
}

impl WorkloadStatus {
    pub fn is_available(&self) -> bool {
        self.available >= self.desired
    }
}

/// Container orchestrator capability. Deletes of absent objects succeed.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClientError>;
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClientError>;

    async fn upsert_secret(&self, spec: &SecretSpec) -> Result<(), ClientError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    /// `None` when the workload does not exist yet.
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>, ClientError>;
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ClientError>;
    async fn update_workload(&self, spec: &WorkloadSpec) -> Result<(), ClientError>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn upsert_service(&self, spec: &NetworkServiceSpec) -> Result<(), ClientError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn upsert_ingress(&self, spec: &IngressSpec) -> Result<(), ClientError>;
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClientError>;
}

// ----------------------------
// Manifests
// ----------------------------

pub(crate) fn namespace_manifest(namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": namespace }
    })
}

pub(crate) fn secret_manifest(spec: &SecretSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": spec.name, "namespace": spec.namespace },
        "type": "Opaque",
        "stringData": spec.data,
    })
}

pub(crate) fn workload_manifest(spec: &WorkloadSpec) -> Value {
    let mut labels = spec.labels.clone();
    labels.insert("app".to_string(), spec.name.clone());

    let mut container = json!({
        "name": spec.name,
        "image": spec.image,
        "ports": [{ "containerPort": spec.port }],
        "env": [{ "name": "PORT", "value": spec.port.to_string() }],
        "readinessProbe": {
            "tcpSocket": { "port": spec.port },
            "initialDelaySeconds": 5,
            "periodSeconds": 5
        }
    });
    if let Some(secret) = &spec.env_secret {
        container["envFrom"] = json!([{ "secretRef": { "name": secret } }]);
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": { "app": spec.name } },
            "template": {
                "metadata": { "labels": labels },
                "spec": { "containers": [container] }
            }
        }
    })
}

pub(crate) fn service_manifest(spec: &NetworkServiceSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": spec.name, "namespace": spec.namespace },
        "spec": {
            "selector": { "app": spec.name },
            "ports": [{ "port": spec.port, "targetPort": spec.target_port, "protocol": "TCP" }]
        }
    })
}

pub(crate) fn ingress_manifest(spec: &IngressSpec) -> Value {
    let rules: Vec<Value> = spec
        .hosts
        .iter()
        .map(|host| {
            json!({
                "host": host,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": spec.service_name,
                                "port": { "number": spec.service_port }
                            }
                        }
                    }]
                }
            })
        })
        .collect();

    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "annotations": { "cert-manager.io/cluster-issuer": "letsencrypt" }
        },
        "spec": {
            "tls": [{ "hosts": spec.hosts, "secretName": format!("{}-tls", spec.name) }],
            "rules": rules
        }
    })
}

pub(crate) fn status_from_deployment(body: &Value) -> WorkloadStatus {
    let int = |v: &Value| v.as_i64().unwrap_or(0) as i32;
    WorkloadStatus {
        desired: int(&body["spec"]["replicas"]),
        ready: int(&body["status"]["readyReplicas"]),
        available: int(&body["status"]["availableReplicas"]),
    }
}

// ----------------------------
// Kubernetes REST adapter
// ----------------------------

/// Talks to the Kubernetes API server directly with a bearer token, using
/// server-side apply for every upsert.
pub struct KubeRest {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl KubeRest {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: http_client(Duration::from_secs(30))?,
        })
    }

    fn core(&self, namespace: &str, kind: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/{kind}/{name}",
            self.base_url
        )
    }

    fn apps(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
            self.base_url
        )
    }

    fn ingress(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/apis/networking.k8s.io/v1/namespaces/{namespace}/ingresses/{name}",
            self.base_url
        )
    }

    async fn apply(&self, url: String, manifest: &Value) -> Result<(), ClientError> {
        let resp = self
            .http
            .patch(url)
            .query(&[("fieldManager", FIELD_MANAGER), ("force", "true")])
            .bearer_auth(&self.token)
            .header("Content-Type", "application/apply-patch+yaml")
            .body(manifest.to_string())
            .send()
            .await?;
        check_response("orchestrator", resp).await?;
        Ok(())
    }

    async fn delete(&self, url: String) -> Result<(), ClientError> {
        let resp = self.http.delete(&url).bearer_auth(&self.token).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%url, "already deleted");
            return Ok(());
        }
        check_response("orchestrator", resp).await?;
        Ok(())
    }

    async fn get(&self, url: String) -> Result<Option<Value>, ClientError> {
        let resp = self.http.get(&url).bearer_auth(&self.token).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_response("orchestrator", resp).await?;
        Ok(Some(resp.json::<Value>().await?))
    }
}

#[async_trait]
impl Orchestrator for KubeRest {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/namespaces/{namespace}", self.base_url);
        self.apply(url, &namespace_manifest(namespace)).await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClientError> {
        self.delete(format!("{}/api/v1/namespaces/{namespace}", self.base_url))
            .await
    }

    async fn upsert_secret(&self, spec: &SecretSpec) -> Result<(), ClientError> {
        let url = self.core(&spec.namespace, "secrets", &spec.name);
        self.apply(url, &secret_manifest(spec)).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.delete(self.core(namespace, "secrets", name)).await
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>, ClientError> {
        Ok(self
            .get(self.apps(namespace, name))
            .await?
            .map(|body| status_from_deployment(&body)))
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(format!(
                "{}/apis/apps/v1/namespaces/{}/deployments",
                self.base_url, spec.namespace
            ))
            .bearer_auth(&self.token)
            .json(&workload_manifest(spec))
            .send()
            .await?;
        check_response("orchestrator", resp).await?;
        Ok(())
    }

    async fn update_workload(&self, spec: &WorkloadSpec) -> Result<(), ClientError> {
        let url = self.apps(&spec.namespace, &spec.name);
        self.apply(url, &workload_manifest(spec)).await
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.delete(self.apps(namespace, name)).await
    }

    async fn upsert_service(&self, spec: &NetworkServiceSpec) -> Result<(), ClientError> {
        let url = self.core(&spec.namespace, "services", &spec.name);
        self.apply(url, &service_manifest(spec)).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.delete(self.core(namespace, "services", name)).await
    }

    async fn upsert_ingress(&self, spec: &IngressSpec) -> Result<(), ClientError> {
        let url = self.ingress(&spec.namespace, &spec.name);
        self.apply(url, &ingress_manifest(spec)).await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.delete(self.ingress(namespace, name)).await
    }

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClientError> {
        self.get_workload(namespace, name)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("deployment {namespace}/{name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_manifest_wires_env_secret_and_port() {
        let spec = WorkloadSpec {
            namespace: "proj-1".into(),
            name: "api".into(),
            image: "registry/api:api-abc".into(),
            replicas: 2,
            port: 8080,
            env_secret: Some("api-env".into()),
            labels: BTreeMap::new(),
        };
        let m = workload_manifest(&spec);
        let container = &m["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(m["spec"]["replicas"], 2);
        assert_eq!(container["image"], "registry/api:api-abc");
        assert_eq!(container["ports"][0]["containerPort"], 8080);
        assert_eq!(container["envFrom"][0]["secretRef"]["name"], "api-env");
        assert_eq!(m["spec"]["selector"]["matchLabels"]["app"], "api");
    }

    #[test]
    fn ingress_has_one_rule_per_host() {
        let spec = IngressSpec {
            namespace: "proj-1".into(),
            name: "api".into(),
            hosts: vec!["api.example.app".into(), "www.acme.com".into()],
            service_name: "api".into(),
            service_port: 80,
        };
        let m = ingress_manifest(&spec);
        assert_eq!(m["spec"]["rules"].as_array().map(Vec::len), Some(2));
        assert_eq!(m["spec"]["rules"][1]["host"], "www.acme.com");
    }

    #[test]
    fn status_reads_replica_counts() {
        let body = json!({
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 2, "availableReplicas": 2 }
        });
        let st = status_from_deployment(&body);
        assert_eq!(st, WorkloadStatus { desired: 3, ready: 2, available: 2 });
        assert!(!st.is_available());

        let fresh = status_from_deployment(&json!({ "spec": { "replicas": 1 } }));
        assert_eq!(fresh.available, 0);
    }
}
