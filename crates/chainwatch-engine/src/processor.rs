//! Inbound frame pipeline: classify → normalize → dedup → dispatch.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use chainwatch_core::address::short;
use chainwatch_core::dedup::SignatureWindow;
use chainwatch_core::dispatcher::EventDispatcher;
use chainwatch_core::normalizer::MessageNormalizer;
use chainwatch_core::protocol::{parse_frame, InboundFrame};

/// Processes provider frames in arrival order.
pub struct FrameProcessor {
    normalizer: MessageNormalizer,
    dispatcher: EventDispatcher,
    seen: Mutex<SignatureWindow>,
}

impl FrameProcessor {
    /// `dedup_window` bounds how many (wallet, signature) pairs are remembered.
    pub fn new(
        normalizer: MessageNormalizer,
        dispatcher: EventDispatcher,
        dedup_window: usize,
    ) -> Self {
        Self {
            normalizer,
            dispatcher,
            seen: Mutex::new(SignatureWindow::new(dedup_window)),
        }
    }

    /// Handle one text frame. Returns how many records were handed to the
    /// dispatcher; malformed frames are logged and count as zero.
    pub async fn process_frame(&self, text: &str) -> usize {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "dropping unparseable frame");
                return 0;
            }
        };

        match frame {
            InboundFrame::Transactions(items) => {
                let mut dispatched = 0;
                for raw in items {
                    dispatched += self.process_transaction(raw).await;
                }
                dispatched
            }
            InboundFrame::Ack { action, addresses } => {
                tracing::debug!(?action, count = addresses.len(), "provider acknowledged");
                0
            }
            InboundFrame::Pong => 0,
            InboundFrame::ProviderError(message) => {
                tracing::warn!(%message, "provider reported an error");
                0
            }
        }
    }

    async fn process_transaction(&self, raw: Value) -> usize {
        let records = match self.normalizer.normalize(raw).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed transaction payload");
                return 0;
            }
        };

        let mut dispatched = 0;
        for record in records {
            let fresh = self
                .seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(&record.wallet, &record.signature);
            if !fresh {
                tracing::debug!(
                    wallet = %short(&record.wallet),
                    signature = %record.signature,
                    "duplicate signature suppressed"
                );
                continue;
            }
            self.dispatcher.dispatch(record);
            dispatched += 1;
        }
        dispatched
    }

    /// Drain `frames` until every sender is gone.
    pub async fn run(&self, mut frames: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = frames.recv().await {
            self.process_frame(&text).await;
        }
        tracing::debug!("frame channel closed, processor stopping");
    }
}
