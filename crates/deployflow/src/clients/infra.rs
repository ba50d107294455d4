use crate::clients::{check_response, http_client, ClientError};
use crate::jobs::retry::{next_delay, RetryConfig};
use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub tags: Vec<String>,
    /// Cloud-init script run on first boot.
    pub user_data: String,
}

/// Inbound allow-list for one TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicyRequest {
    pub name: String,
    pub port: u16,
    pub source_cidrs: Vec<String>,
    /// Instances carrying this tag are covered by the policy.
    pub target_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub status: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

impl InstanceState {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Infrastructure provider capability (compute, block storage, firewalls,
/// DNS). Deletes of absent resources succeed.
#[async_trait]
pub trait InfraApi: Send + Sync {
    async fn create_volume(&self, name: &str, size_gb: i32, region: &str)
        -> Result<String, ClientError>;
    async fn delete_volume(&self, volume_id: &str) -> Result<(), ClientError>;
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError>;
    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError>;

    async fn create_security_policy(
        &self,
        req: &SecurityPolicyRequest,
    ) -> Result<String, ClientError>;
    async fn delete_security_policy(&self, policy_id: &str) -> Result<(), ClientError>;

    async fn create_instance(&self, req: &InstanceRequest) -> Result<String, ClientError>;
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceState, ClientError>;
    async fn stop_instance(&self, instance_id: &str) -> Result<(), ClientError>;
    async fn delete_instance(&self, instance_id: &str) -> Result<(), ClientError>;

    /// Creates an A record `name.zone -> ip` and returns the record id.
    async fn create_dns_record(&self, zone: &str, name: &str, ip: &str)
        -> Result<String, ClientError>;
    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<(), ClientError>;

    /// Polls until the instance is `active` or `timeout` elapses.
    async fn wait_for_instance(
        &self,
        instance_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<InstanceState, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.get_instance(instance_id).await?;
            if state.is_active() {
                return Ok(state);
            }
            if Instant::now() + poll_interval > deadline {
                return Err(ClientError::Timeout(format!(
                    "instance {instance_id} still {} after {}s",
                    state.status,
                    timeout.as_secs()
                )));
            }
            debug!(instance_id, status = %state.status, "waiting for instance");
            sleep(poll_interval).await;
        }
    }
}

// ----------------------------
// Retry decorator
// ----------------------------

/// Retries transient failures of every call with exponential backoff.
/// Permanent errors and exhausted retries propagate unchanged.
pub struct RetryingInfra<T> {
    inner: T,
    max_retries: u32,
    backoff: RetryConfig,
}

impl<T: InfraApi> RetryingInfra<T> {
    pub fn new(inner: T, max_retries: u32, backoff: RetryConfig) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn retrying<R, F, Fut>(&self, op: &'static str, mut call: F) -> Result<R, ClientError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<R, ClientError>> + Send,
        R: Send,
    {
        let mut retries = 0u32;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    let delay = {
                        let mut rng = StdRng::from_entropy();
                        next_delay(retries as i32, &self.backoff, &mut rng)
                    };
                    warn!(
                        op,
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "infra call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: InfraApi> InfraApi for RetryingInfra<T> {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: i32,
        region: &str,
    ) -> Result<String, ClientError> {
        self.retrying("create_volume", || self.inner.create_volume(name, size_gb, region))
            .await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ClientError> {
        self.retrying("delete_volume", || self.inner.delete_volume(volume_id))
            .await
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError> {
        self.retrying("attach_volume", || {
            self.inner.attach_volume(volume_id, instance_id, region)
        })
        .await
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError> {
        self.retrying("detach_volume", || {
            self.inner.detach_volume(volume_id, instance_id, region)
        })
        .await
    }

    async fn create_security_policy(
        &self,
        req: &SecurityPolicyRequest,
    ) -> Result<String, ClientError> {
        self.retrying("create_security_policy", || {
            self.inner.create_security_policy(req)
        })
        .await
    }

    async fn delete_security_policy(&self, policy_id: &str) -> Result<(), ClientError> {
        self.retrying("delete_security_policy", || {
            self.inner.delete_security_policy(policy_id)
        })
        .await
    }

    async fn create_instance(&self, req: &InstanceRequest) -> Result<String, ClientError> {
        self.retrying("create_instance", || self.inner.create_instance(req))
            .await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceState, ClientError> {
        self.retrying("get_instance", || self.inner.get_instance(instance_id))
            .await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.retrying("stop_instance", || self.inner.stop_instance(instance_id))
            .await
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.retrying("delete_instance", || self.inner.delete_instance(instance_id))
            .await
    }

    async fn create_dns_record(
        &self,
        zone: &str,
        name: &str,
        ip: &str,
    ) -> Result<String, ClientError> {
        self.retrying("create_dns_record", || {
            self.inner.create_dns_record(zone, name, ip)
        })
        .await
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<(), ClientError> {
        self.retrying("delete_dns_record", || {
            self.inner.delete_dns_record(zone, record_id)
        })
        .await
    }
}

// ----------------------------
// Cloud REST adapter
// ----------------------------

/// Client for a DigitalOcean-style `/v2` API.
pub struct CloudRest {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl CloudRest {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: http_client(Duration::from_secs(30))?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let resp = check_response("infra", resp).await?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(path, "already deleted");
            return Ok(());
        }
        check_response("infra", resp).await?;
        Ok(())
    }

    async fn volume_action(
        &self,
        kind: &str,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError> {
        self.post(
            &format!("volumes/{volume_id}/actions"),
            &json!({
                "type": kind,
                "droplet_id": numeric_id(instance_id)?,
                "region": region,
            }),
        )
        .await?;
        Ok(())
    }
}

/// Provider ids come back as numbers or strings depending on the resource.
pub(crate) fn id_at(body: &Value, object: &str) -> Result<String, ClientError> {
    match &body[object]["id"] {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ClientError::Invalid(format!("response has no {object}.id"))),
    }
}

fn numeric_id(id: &str) -> Result<i64, ClientError> {
    id.parse()
        .map_err(|_| ClientError::Invalid(format!("expected a numeric instance id, got {id}")))
}

pub(crate) fn instance_state(body: &Value) -> InstanceState {
    let droplet = &body["droplet"];
    let ip_of = |kind: &str| {
        droplet["networks"]["v4"]
            .as_array()
            .and_then(|nets| nets.iter().find(|n| n["type"] == kind))
            .and_then(|n| n["ip_address"].as_str())
            .map(str::to_string)
    };
    InstanceState {
        status: droplet["status"].as_str().unwrap_or("unknown").to_string(),
        private_ip: ip_of("private"),
        public_ip: ip_of("public"),
    }
}

#[async_trait]
impl InfraApi for CloudRest {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: i32,
        region: &str,
    ) -> Result<String, ClientError> {
        let body = self
            .post(
                "volumes",
                &json!({
                    "name": name,
                    "size_gigabytes": size_gb,
                    "region": region,
                    "filesystem_type": "ext4",
                }),
            )
            .await?;
        id_at(&body, "volume")
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("volumes/{volume_id}")).await
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError> {
        self.volume_action("attach", volume_id, instance_id, region)
            .await
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        region: &str,
    ) -> Result<(), ClientError> {
        match self
            .volume_action("detach", volume_id, instance_id, region)
            .await
        {
            Err(ClientError::Status { status: 404, .. }) => Ok(()),
            other => other,
        }
    }

    async fn create_security_policy(
        &self,
        req: &SecurityPolicyRequest,
    ) -> Result<String, ClientError> {
        let body = self
            .post(
                "firewalls",
                &json!({
                    "name": req.name,
                    "inbound_rules": [{
                        "protocol": "tcp",
                        "ports": req.port.to_string(),
                        "sources": { "addresses": req.source_cidrs }
                    }],
                    "outbound_rules": [
                        { "protocol": "tcp", "ports": "all",
                          "destinations": { "addresses": ["0.0.0.0/0", "::/0"] } },
                        { "protocol": "udp", "ports": "all",
                          "destinations": { "addresses": ["0.0.0.0/0", "::/0"] } }
                    ],
                    "tags": [req.target_tag],
                }),
            )
            .await?;
        id_at(&body, "firewall")
    }

    async fn delete_security_policy(&self, policy_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("firewalls/{policy_id}")).await
    }

    async fn create_instance(&self, req: &InstanceRequest) -> Result<String, ClientError> {
        let body = self
            .post(
                "droplets",
                &json!({
                    "name": req.name,
                    "region": req.region,
                    "size": req.size,
                    "image": req.image,
                    "tags": req.tags,
                    "user_data": req.user_data,
                    "monitoring": true,
                }),
            )
            .await?;
        id_at(&body, "droplet")
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceState, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("droplets/{instance_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("instance {instance_id}")));
        }
        let resp = check_response("infra", resp).await?;
        Ok(instance_state(&resp.json::<Value>().await?))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        match self
            .post(
                &format!("droplets/{instance_id}/actions"),
                &json!({ "type": "shutdown" }),
            )
            .await
        {
            Err(ClientError::Status { status: 404, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("droplets/{instance_id}")).await
    }

    async fn create_dns_record(
        &self,
        zone: &str,
        name: &str,
        ip: &str,
    ) -> Result<String, ClientError> {
        let body = self
            .post(
                &format!("domains/{zone}/records"),
                &json!({ "type": "A", "name": name, "data": ip, "ttl": 300 }),
            )
            .await?;
        id_at(&body, "domain_record")
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("domains/{zone}/records/{record_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `get_instance` with the given error until `failures` runs out.
    struct Flaky {
        failures: AtomicU32,
        status: u16,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                status,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl InfraApi for Flaky {
        async fn create_volume(&self, _: &str, _: i32, _: &str) -> Result<String, ClientError> {
            unimplemented!()
        }
        async fn delete_volume(&self, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn attach_volume(&self, _: &str, _: &str, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn detach_volume(&self, _: &str, _: &str, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn create_security_policy(
            &self,
            _: &SecurityPolicyRequest,
        ) -> Result<String, ClientError> {
            unimplemented!()
        }
        async fn delete_security_policy(&self, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn create_instance(&self, _: &InstanceRequest) -> Result<String, ClientError> {
            unimplemented!()
        }
        async fn get_instance(&self, _: &str) -> Result<InstanceState, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ClientError::status("infra", self.status, "nope"));
            }
            Ok(InstanceState {
                status: "active".into(),
                private_ip: Some("10.0.0.5".into()),
                public_ip: None,
            })
        }
        async fn stop_instance(&self, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn delete_instance(&self, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
        async fn create_dns_record(&self, _: &str, _: &str, _: &str) -> Result<String, ClientError> {
            unimplemented!()
        }
        async fn delete_dns_record(&self, _: &str, _: &str) -> Result<(), ClientError> {
            unimplemented!()
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig::fixed(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let infra = RetryingInfra::new(Flaky::new(2, 503), 3, fast());
        let state = infra.get_instance("42").await.unwrap();
        assert!(state.is_active());
        assert_eq!(infra.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let infra = RetryingInfra::new(Flaky::new(10, 429), 2, fast());
        let err = infra.get_instance("42").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(infra.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let infra = RetryingInfra::new(Flaky::new(1, 422), 5, fast());
        let err = infra.get_instance("42").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(infra.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_droplet_networks() {
        let body = json!({
            "droplet": {
                "status": "active",
                "networks": { "v4": [
                    { "ip_address": "203.0.113.7", "type": "public" },
                    { "ip_address": "10.10.0.3", "type": "private" }
                ]}
            }
        });
        let st = instance_state(&body);
        assert!(st.is_active());
        assert_eq!(st.private_ip.as_deref(), Some("10.10.0.3"));
        assert_eq!(st.public_ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn ids_may_be_numbers_or_strings() {
        assert_eq!(id_at(&json!({"droplet": {"id": 42}}), "droplet").unwrap(), "42");
        assert_eq!(
            id_at(&json!({"volume": {"id": "vol-1"}}), "volume").unwrap(),
            "vol-1"
        );
        assert!(id_at(&json!({}), "firewall").is_err());
    }
}
