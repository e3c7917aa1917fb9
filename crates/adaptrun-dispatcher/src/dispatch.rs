//! Dispatcher core: validate, materialize, launch, report back.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use adaptrun_core::{headers, AdaptationContext, ContextSettings, RequestId};

use crate::launcher::{LaunchError, Launcher};
use crate::reply::{ReplyError, ReplySink};
use crate::transfer::{ArtifactTransfer, TransferError, OUTPUT_URL_TTL};

/// One inbound unit of work, already decoded from the broker's delivery
/// envelope: a header map plus the reply destination.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub headers: BTreeMap<String, String>,
    pub reply_to: String,
}

/// Errors for a single request. None of these escape the consume loop as
/// anything but log output; one bad request never stops intake.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("reply publish failed: {0}")]
    Reply(#[from] ReplyError),
}

/// Drives one delivery end-to-end: validation, download, execution, upload,
/// reply, scratch cleanup.
///
/// All collaborators are constructed by the caller and shared across
/// concurrently handled requests. No state is kept between requests, and no
/// deduplication is performed: with the broker's at-least-once delivery, a
/// redelivered message re-runs the full pipeline.
pub struct Dispatcher {
    store: Arc<dyn ArtifactTransfer>,
    launcher: Arc<dyn Launcher>,
    replies: Arc<dyn ReplySink>,
    settings: ContextSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ArtifactTransfer>,
        launcher: Arc<dyn Launcher>,
        replies: Arc<dyn ReplySink>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            store,
            launcher,
            replies,
            settings,
        }
    }

    /// Handle one delivery. Rejecting an invalid delivery performs no side
    /// effects; every valid delivery has its scratch paths cleaned up on
    /// every exit path, success or failure.
    pub async fn handle(&self, delivery: InboundDelivery) -> Result<(), DispatchError> {
        let (request_id, source_url, generate_report) = validate(&delivery)?;

        info!(request_id = %request_id, "received adaptation request");

        let ctx = AdaptationContext::for_request(
            request_id,
            source_url,
            generate_report,
            delivery.reply_to.clone(),
            &self.settings,
        );

        let outcome = self.process(&ctx, &delivery).await;
        cleanup_scratch(&ctx).await;
        outcome
    }

    async fn process(
        &self,
        ctx: &AdaptationContext,
        delivery: &InboundDelivery,
    ) -> Result<(), DispatchError> {
        self.store.fetch(&ctx.source_url, &ctx.input_path).await?;

        let outcome = self.launcher.run(ctx).await?;

        if outcome.handed_off {
            info!(
                request_id = %ctx.request_id,
                "execution unit created; it will report back itself"
            );
            return Ok(());
        }

        let output_url = self.store.publish(&ctx.output_path, OUTPUT_URL_TTL).await?;

        let mut reply_headers = delivery.headers.clone();
        reply_headers.insert(headers::OUTPUT_URL.to_string(), output_url);

        self.replies
            .publish(&ctx.reply_to, &reply_headers, b"")
            .await?;

        info!(
            request_id = %ctx.request_id,
            reply_to = %ctx.reply_to,
            "adaptation request completed"
        );
        Ok(())
    }
}

fn validate(delivery: &InboundDelivery) -> Result<(RequestId, String, bool), DispatchError> {
    let file_id = delivery
        .headers
        .get(headers::FILE_ID)
        .filter(|v| !v.is_empty())
        .ok_or(DispatchError::MissingHeader(headers::FILE_ID))?;

    let source_url = delivery
        .headers
        .get(headers::SOURCE_URL)
        .filter(|v| !v.is_empty())
        .ok_or(DispatchError::MissingHeader(headers::SOURCE_URL))?;

    let generate_report = delivery
        .headers
        .get(headers::GENERATE_REPORT)
        .map(|v| v == "true")
        .unwrap_or(false);

    Ok((
        RequestId::new(file_id.clone()),
        source_url.clone(),
        generate_report,
    ))
}

/// Remove the per-request scratch files. Missing files are fine (the request
/// may have failed before creating them); anything else is logged and
/// swallowed so cleanup never masks the request's own outcome.
async fn cleanup_scratch(ctx: &AdaptationContext) {
    for path in [&ctx.input_path, &ctx.output_path] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    request_id = %ctx.request_id,
                    path = %path.display(),
                    error = %e,
                    "failed to remove scratch file"
                );
            }
        }
    }
}
