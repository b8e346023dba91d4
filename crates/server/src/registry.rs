//! The set of dispatch targets built from configuration at startup.
//!
//! A target is either a flat endpoint or one standin of a virtual deployment
//! inside an endpoint. Targets are held in declared configuration order;
//! that order is the dispatcher's selection priority. All target state is
//! immutable after startup except `blocked_until_ms`.

use aogate_core::config::{Config, MockResponseConfig};
use aogate_core::error::GatewayError;
use aogate_core::slip::now_ms;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum TargetKind {
    Endpoint,
    VirtualDeploymentStandin {
        virtual_deployment: String,
        standin: String,
    },
    /// Synthetic target that answers from configuration instead of a backend.
    Mock {
        body: serde_json::Value,
        ms_to_wait_before_return: Option<u64>,
    },
}

pub struct Target {
    pub name: String,
    pub endpoint_name: String,
    pub kind: TargetKind,
    pub base_url: String,
    pub backend_key: Option<String>,
    pub non_streaming_fraction: f64,
    blocked_until_ms: AtomicI64,
    pub http: reqwest::Client,
}

impl Target {
    fn new(
        name: String,
        endpoint_name: String,
        kind: TargetKind,
        base_url: String,
        backend_key: Option<String>,
        non_streaming_fraction: Option<f64>,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name,
            endpoint_name,
            kind,
            base_url,
            backend_key,
            non_streaming_fraction: non_streaming_fraction.unwrap_or(1.0),
            blocked_until_ms: AtomicI64::new(0),
            http,
        })
    }

    pub fn is_blocked(&self, now_ms: i64) -> bool {
        self.blocked_until_ms.load(Ordering::Relaxed) > now_ms
    }

    /// Block this target for `wait_ms` after a backend-signalled throttle.
    /// Concurrent throttles may race to write near-identical values, which
    /// is harmless.
    pub fn block_for_ms(&self, wait_ms: i64) {
        self.blocked_until_ms
            .store(now_ms() + wait_ms, Ordering::Relaxed);
    }

    /// Non-streaming admission: streaming requests always pass; a
    /// non-streaming request is admitted with probability
    /// `non_streaming_fraction`, leaving the rest of the target's capacity
    /// to streaming traffic.
    pub fn passes_non_streaming_filter(&self, is_non_streaming: bool) -> bool {
        if !is_non_streaming {
            return true;
        }
        if self.non_streaming_fraction >= 1.0 {
            return true;
        }
        if self.non_streaming_fraction <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.non_streaming_fraction
    }
}

pub struct EndpointRegistry {
    targets: Vec<Arc<Target>>,
}

impl EndpointRegistry {
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        if let Some(mock) = &config.aoai.mock_response {
            return Ok(Self {
                targets: vec![Arc::new(Self::mock_target(mock)?)],
            });
        }

        let mut targets = Vec::new();
        for endpoint in &config.aoai.endpoints {
            match &endpoint.virtual_deployments {
                Some(virtual_deployments) => {
                    for virtual_deployment in virtual_deployments {
                        for standin in &virtual_deployment.standins {
                            targets.push(Arc::new(Target::new(
                                format!(
                                    "{}@{}@{}",
                                    standin.name, virtual_deployment.name, endpoint.name
                                ),
                                endpoint.name.clone(),
                                TargetKind::VirtualDeploymentStandin {
                                    virtual_deployment: virtual_deployment.name.clone(),
                                    standin: standin.name.clone(),
                                },
                                endpoint.url.clone(),
                                endpoint.key.clone(),
                                standin.non_streaming_fraction,
                            )?));
                        }
                    }
                }
                None => {
                    targets.push(Arc::new(Target::new(
                        endpoint.name.clone(),
                        endpoint.name.clone(),
                        TargetKind::Endpoint,
                        endpoint.url.clone(),
                        endpoint.key.clone(),
                        endpoint.non_streaming_fraction,
                    )?));
                }
            }
        }
        Ok(Self { targets })
    }

    fn mock_target(mock: &MockResponseConfig) -> Result<Target, GatewayError> {
        Target::new(
            "mock".to_string(),
            "mock".to_string(),
            TargetKind::Mock {
                body: mock.json.clone(),
                ms_to_wait_before_return: mock.ms_to_wait_before_return,
            },
            String::new(),
            None,
            None,
        )
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        Config::from_yaml(yaml).unwrap()
    }

    #[test]
    fn flat_endpoints_expand_in_declared_order() {
        let registry = EndpointRegistry::from_config(&config(
            r#"
aoai:
  endpoints:
    - name: first
      url: https://first.openai.azure.com/
      key: k1
      non_streaming_fraction: 0.5
    - name: second
      url: https://second.openai.azure.com/
      key: k2
"#,
        ))
        .unwrap();

        let names: Vec<&str> = registry.targets().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(registry.targets()[0].non_streaming_fraction, 0.5);
        assert_eq!(registry.targets()[1].non_streaming_fraction, 1.0);
        assert_eq!(registry.targets()[0].backend_key.as_deref(), Some("k1"));
    }

    #[test]
    fn virtual_deployments_expand_one_target_per_standin() {
        let registry = EndpointRegistry::from_config(&config(
            r#"
aoai:
  endpoints:
    - name: e1
      url: https://e1.openai.azure.com/
      key: k1
      virtual_deployments:
        - name: gpt-4
          standins:
            - name: gpt-4-a
              non_streaming_fraction: 0.3
            - name: gpt-4-b
        - name: gpt-35
          standins:
            - name: gpt-35-real
"#,
        ))
        .unwrap();

        let names: Vec<&str> = registry.targets().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-4-a@gpt-4@e1", "gpt-4-b@gpt-4@e1", "gpt-35-real@gpt-35@e1"]);
        match &registry.targets()[0].kind {
            TargetKind::VirtualDeploymentStandin {
                virtual_deployment,
                standin,
            } => {
                assert_eq!(virtual_deployment, "gpt-4");
                assert_eq!(standin, "gpt-4-a");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn mock_response_replaces_all_endpoints() {
        let registry = EndpointRegistry::from_config(&config(
            r#"
aoai:
  endpoints:
    - name: ignored
      url: https://ignored.openai.azure.com/
  mock_response:
    json: {"choices": []}
"#,
        ))
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.targets()[0].kind, TargetKind::Mock { .. }));
    }

    #[test]
    fn blocked_until_gates_by_time() {
        let registry = EndpointRegistry::from_config(&config(
            r#"
aoai:
  endpoints:
    - name: e1
      url: https://e1.openai.azure.com/
"#,
        ))
        .unwrap();
        let target = &registry.targets()[0];
        let now = now_ms();
        assert!(!target.is_blocked(now));
        target.block_for_ms(2_000);
        assert!(target.is_blocked(now_ms()));
        assert!(!target.is_blocked(now + 10_000));
    }

    #[test]
    fn admission_filter_edge_fractions_are_deterministic() {
        let registry = EndpointRegistry::from_config(&config(
            r#"
aoai:
  endpoints:
    - name: never
      url: https://never.openai.azure.com/
      non_streaming_fraction: 0
    - name: always
      url: https://always.openai.azure.com/
"#,
        ))
        .unwrap();
        let never = &registry.targets()[0];
        let always = &registry.targets()[1];

        // Streaming requests always pass.
        assert!(never.passes_non_streaming_filter(false));
        assert!(always.passes_non_streaming_filter(false));

        // Non-streaming requests: 0 rejects, 1 admits, every time.
        for _ in 0..50 {
            assert!(!never.passes_non_streaming_filter(true));
            assert!(always.passes_non_streaming_filter(true));
        }
    }
}
