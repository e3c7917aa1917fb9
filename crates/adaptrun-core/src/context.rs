//! The correlation context threaded through one adaptation request.

use crate::RequestId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Broker connection parameters injected into every execution unit so it can
/// publish its own messages downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoints {
    /// Hostname of the adaptation request queue.
    pub request_queue_host: String,

    /// Port of the adaptation request queue.
    pub request_queue_port: String,

    /// Hostname of the archive adaptation request queue.
    pub archive_queue_host: String,

    /// Port of the archive adaptation request queue.
    pub archive_queue_port: String,

    /// Hostname of the transaction event queue.
    pub event_queue_host: String,

    /// Port of the transaction event queue.
    pub event_queue_port: String,

    /// Broker username.
    pub user: String,

    /// Broker password.
    pub password: String,
}

/// CPU/memory request and limit quantities for an execution unit, kept as the
/// quantity strings they arrive as in configuration (e.g. "500m", "1Gi").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBounds {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

/// Process-wide values a context is derived from; shared by all requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSettings {
    /// Process-private root under which per-request scratch paths live.
    pub scratch_root: PathBuf,

    /// Timeout the execution unit self-enforces; passed through verbatim.
    pub processing_timeout: String,

    /// Downstream broker endpoints injected into the execution unit.
    pub broker: BrokerEndpoints,

    /// Resource bounds for the execution unit.
    pub resources: ResourceBounds,
}

/// Per-request state threaded through download, execution, upload and reply.
///
/// Scratch paths are derived deterministically from the request identifier,
/// so two concurrently in-flight requests can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationContext {
    /// Unique request identifier; immutable once assigned.
    pub request_id: RequestId,

    /// Presigned URL locating the source artifact.
    pub source_url: String,

    /// Local path the source artifact is downloaded to.
    pub input_path: PathBuf,

    /// Local path the execution unit writes its output to.
    pub output_path: PathBuf,

    /// Whether the execution unit should produce a report.
    pub generate_report: bool,

    /// Reply destination captured from the inbound delivery; preserved
    /// unchanged through to the outbound reply.
    pub reply_to: String,

    /// Timeout the execution unit self-enforces.
    pub processing_timeout: String,

    /// Downstream broker endpoints for the execution unit.
    pub broker: BrokerEndpoints,

    /// Resource bounds for the execution unit.
    pub resources: ResourceBounds,
}

impl AdaptationContext {
    /// Build the context for one validated request.
    pub fn for_request(
        request_id: RequestId,
        source_url: impl Into<String>,
        generate_report: bool,
        reply_to: impl Into<String>,
        settings: &ContextSettings,
    ) -> Self {
        let input_path = settings.scratch_root.join("input").join(request_id.as_str());
        let output_path = settings.scratch_root.join("output").join(request_id.as_str());

        Self {
            request_id,
            source_url: source_url.into(),
            input_path,
            output_path,
            generate_report,
            reply_to: reply_to.into(),
            processing_timeout: settings.processing_timeout.clone(),
            broker: settings.broker.clone(),
            resources: settings.resources.clone(),
        }
    }

    /// The full environment contract injected into every execution unit,
    /// local subprocess or remote pod alike.
    pub fn env_bindings(&self) -> Vec<(String, String)> {
        let flag = if self.generate_report { "true" } else { "false" };

        let pairs: [(&str, String); 14] = [
            ("FileId", self.request_id.as_str().to_string()),
            ("InputPath", self.input_path.to_string_lossy().into_owned()),
            ("OutputPath", self.output_path.to_string_lossy().into_owned()),
            ("GenerateReport", flag.to_string()),
            ("ReplyTo", self.reply_to.clone()),
            ("ProcessingTimeoutDuration", self.processing_timeout.clone()),
            (
                "AdaptationRequestQueueHostname",
                self.broker.request_queue_host.clone(),
            ),
            (
                "AdaptationRequestQueuePort",
                self.broker.request_queue_port.clone(),
            ),
            (
                "ArchiveAdaptationRequestQueueHostname",
                self.broker.archive_queue_host.clone(),
            ),
            (
                "ArchiveAdaptationRequestQueuePort",
                self.broker.archive_queue_port.clone(),
            ),
            (
                "TransactionEventQueueHostname",
                self.broker.event_queue_host.clone(),
            ),
            (
                "TransactionEventQueuePort",
                self.broker.event_queue_port.clone(),
            ),
            ("MessageBrokerUser", self.broker.user.clone()),
            ("MessageBrokerPassword", self.broker.password.clone()),
        ];

        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
