//! Ephemeral Kubernetes pod launcher.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use tracing::{info, warn};
use uuid::Uuid;

use adaptrun_core::{AdaptationContext, ResourceBounds};

use crate::config::{MountSettings, PodSettings};

use super::{LaunchError, LaunchOutcome, Launcher};

/// Maximum creation attempts for one request.
const CREATE_ATTEMPTS: usize = 5;

/// Pause between a failed attempt and the next.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Bound on a single creation call.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

const SOURCE_PVC: &str = "adaptation-source-pvc";
const TARGET_PVC: &str = "adaptation-target-pvc";
const PROCESSING_CONFIG_MAP: &str = "request-processing-config";
const PROCESSING_CONFIG_MOUNT: &str = "/app/config";
const PULL_SECRET: &str = "regcred";

/// Creates one single-shot pod per request and hands the rest of the
/// pipeline off to it: the pod publishes its own reply using the broker
/// parameters injected into its environment, and the dispatcher never polls
/// it.
///
/// Every attempt submits a descriptor with a freshly generated name, so a
/// half-created pod can never collide with a retried one. The flip side is
/// that a creation which failed only on the client side (timeout) while
/// succeeding server-side can leave two live pods for one request; the
/// bounded-retry policy accepts that risk.
pub struct PodLauncher {
    pods: Api<Pod>,
    template: PodTemplate,
}

impl PodLauncher {
    /// Build the launcher, validating the configured resource quantities up
    /// front. Malformed quantities are a configuration error, not a
    /// transient one, so this refuses to construct rather than failing per
    /// request.
    pub fn new(
        client: kube::Client,
        pod: &PodSettings,
        mounts: &MountSettings,
        resources: &ResourceBounds,
    ) -> Result<Self, LaunchError> {
        for quantity in [
            &resources.cpu_request,
            &resources.cpu_limit,
            &resources.memory_request,
            &resources.memory_limit,
        ] {
            if !is_valid_quantity(quantity) {
                return Err(LaunchError::InvalidQuantity(quantity.clone()));
            }
        }

        let template = PodTemplate {
            namespace: pod.namespace.clone(),
            image: pod.image.clone(),
            input_mount: mounts.input.clone(),
            output_mount: mounts.output.clone(),
        };

        Ok(Self {
            pods: Api::namespaced(client, &pod.namespace),
            template,
        })
    }
}

#[async_trait]
impl Launcher for PodLauncher {
    async fn run(&self, ctx: &AdaptationContext) -> Result<LaunchOutcome, LaunchError> {
        let created = with_bounded_retry(CREATE_ATTEMPTS, RETRY_DELAY, |attempt| {
            let pod = self.template.build(ctx);
            async move {
                let params = PostParams::default();
                let create = self.pods.create(&params, &pod);
                match tokio::time::timeout(ATTEMPT_TIMEOUT, create).await {
                    Ok(Ok(created)) => Ok(created),
                    Ok(Err(e)) => {
                        warn!(
                            request_id = %ctx.request_id,
                            attempt,
                            error = %e,
                            "pod creation attempt failed"
                        );
                        Err(e.to_string())
                    }
                    Err(_) => {
                        warn!(
                            request_id = %ctx.request_id,
                            attempt,
                            "pod creation attempt timed out"
                        );
                        Err(format!("attempt timed out after {ATTEMPT_TIMEOUT:?}"))
                    }
                }
            }
        })
        .await
        .map_err(|(attempts, last_error)| LaunchError::Creation {
            attempts,
            last_error,
        })?;

        info!(
            request_id = %ctx.request_id,
            pod = created.metadata.name.as_deref().unwrap_or("<unnamed>"),
            "created execution pod; reply is now owned by the pod"
        );

        Ok(LaunchOutcome::handed_off())
    }
}

/// Everything needed to stamp out one pod descriptor.
struct PodTemplate {
    namespace: String,
    image: String,
    input_mount: String,
    output_mount: String,
}

impl PodTemplate {
    /// Build a descriptor with a freshly generated unique name.
    fn build(&self, ctx: &AdaptationContext) -> Pod {
        let env = ctx
            .env_bindings()
            .into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect();

        let limits = BTreeMap::from([
            ("cpu".to_string(), Quantity(ctx.resources.cpu_limit.clone())),
            (
                "memory".to_string(),
                Quantity(ctx.resources.memory_limit.clone()),
            ),
        ]);
        let requests = BTreeMap::from([
            (
                "cpu".to_string(),
                Quantity(ctx.resources.cpu_request.clone()),
            ),
            (
                "memory".to_string(),
                Quantity(ctx.resources.memory_request.clone()),
            ),
        ]);

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("adapt-{}", Uuid::new_v4())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                image_pull_secrets: Some(vec![LocalObjectReference {
                    name: PULL_SECRET.to_string(),
                }]),
                volumes: Some(vec![
                    Volume {
                        name: "sourcedir".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: SOURCE_PVC.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "targetdir".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: TARGET_PVC.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: PROCESSING_CONFIG_MAP.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: PROCESSING_CONFIG_MAP.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                containers: vec![Container {
                    name: "adapt".to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    env: Some(env),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "sourcedir".to_string(),
                            mount_path: self.input_mount.clone(),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "targetdir".to_string(),
                            mount_path: self.output_mount.clone(),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: PROCESSING_CONFIG_MAP.to_string(),
                            mount_path: PROCESSING_CONFIG_MOUNT.to_string(),
                            ..Default::default()
                        },
                    ]),
                    resources: Some(ResourceRequirements {
                        limits: Some(limits),
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Retry `op` up to `attempts` times, sleeping `delay` between failed
/// attempts and stopping on the first success. Returns the final attempt
/// count alongside the last error on exhaustion.
async fn with_bounded_retry<T, E, F, Fut>(
    attempts: usize,
    delay: Duration,
    mut op: F,
) -> Result<T, (usize, E)>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(_) if attempt < attempts => {
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((attempt, e)),
        }
    }
}

/// Accepts the plain-decimal subset of Kubernetes quantities: digits with an
/// optional fraction and an optional binary or decimal suffix.
fn is_valid_quantity(value: &str) -> bool {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
    ];

    let number = SUFFIXES
        .iter()
        .find_map(|s| value.strip_suffix(s))
        .unwrap_or(value);

    !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit() || c == '.')
        && number.parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptrun_core::{BrokerEndpoints, ContextSettings, RequestId};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> AdaptationContext {
        AdaptationContext::for_request(
            RequestId::new("abc123"),
            "http://store/in/abc123",
            false,
            "reply-queue",
            &ContextSettings {
                scratch_root: PathBuf::from("/tmp/adaptrun"),
                processing_timeout: "00:10:00".into(),
                broker: BrokerEndpoints {
                    request_queue_host: "rabbit".into(),
                    request_queue_port: "5672".into(),
                    archive_queue_host: "rabbit".into(),
                    archive_queue_port: "5672".into(),
                    event_queue_host: "rabbit".into(),
                    event_queue_port: "5672".into(),
                    user: "guest".into(),
                    password: "guest".into(),
                },
                resources: ResourceBounds {
                    cpu_request: "250m".into(),
                    cpu_limit: "1".into(),
                    memory_request: "256Mi".into(),
                    memory_limit: "1Gi".into(),
                },
            },
        )
    }

    fn template() -> PodTemplate {
        PodTemplate {
            namespace: "adaptation".into(),
            image: "registry/adapt:latest".into(),
            input_mount: "/input".into(),
            output_mount: "/output".into(),
        }
    }

    #[test]
    fn test_every_descriptor_gets_a_fresh_name() {
        let t = template();
        let c = ctx();
        let first = t.build(&c).metadata.name.unwrap();
        let second = t.build(&c).metadata.name.unwrap();

        assert!(first.starts_with("adapt-"));
        assert!(second.starts_with("adapt-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_descriptor_is_single_shot_and_fully_bound() {
        let pod = template().build(&ctx());
        let spec = pod.spec.unwrap();

        assert_eq!(pod.metadata.namespace.as_deref(), Some("adaptation"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.image_pull_secrets.unwrap()[0].name,
            PULL_SECRET.to_string()
        );

        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry/adapt:latest"));

        let env = container.env.as_ref().unwrap();
        let get = |k: &str| {
            env.iter()
                .find(|e| e.name == k)
                .and_then(|e| e.value.as_deref())
        };
        assert_eq!(get("FileId"), Some("abc123"));
        assert_eq!(get("GenerateReport"), Some("false"));
        assert_eq!(get("ReplyTo"), Some("reply-queue"));
        assert_eq!(get("MessageBrokerUser"), Some("guest"));

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/input"));
        assert!(mounts.iter().any(|m| m.mount_path == "/output"));
        assert!(mounts.iter().any(|m| m.mount_path == PROCESSING_CONFIG_MOUNT));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["cpu"],
            Quantity("1".into())
        );
        assert_eq!(
            resources.requests.as_ref().unwrap()["memory"],
            Quantity("256Mi".into())
        );
    }

    #[test]
    fn test_quantity_validation() {
        for ok in ["500m", "1", "1.5", "256Mi", "1Gi", "2k"] {
            assert!(is_valid_quantity(ok), "{ok} should be accepted");
        }
        for bad in ["", "Gi", "abc", "12xyz", "-1"] {
            assert!(!is_valid_quantity(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_retry_policy_matches_creation_budget() {
        assert_eq!(CREATE_ATTEMPTS, 5);
        assert_eq!(RETRY_DELAY, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_stops_on_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, (usize, &str)> =
            with_bounded_retry(5, Duration::from_millis(1), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        Ok(42)
                    } else {
                        Err("boom")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, (usize, &str)> =
            with_bounded_retry(5, Duration::from_millis(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;

        let (attempts, last) = result.unwrap_err();
        assert_eq!(attempts, 5);
        assert_eq!(last, "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
