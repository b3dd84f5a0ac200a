#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use durapix::client::Client;
use durapix::pipeline::{pipeline_activities, pipeline_orchestrations, ImagePayload, ImageTransforms, WatermarkSink};
use durapix::providers::HistoryStore;
use durapix::runtime::{Runtime, RuntimeOptions};
use durapix::ActivityError;

/// Deterministic stand-in transforms: each step appends a tag to the bytes so
/// tests can assert exactly which steps ran and in what order.
pub struct TagTransforms;

fn tag(image: &ImagePayload, suffix: &[u8]) -> ImagePayload {
    let mut bytes = image.bytes.clone();
    bytes.extend_from_slice(suffix);
    ImagePayload::new(image.mime.clone(), bytes)
}

impl ImageTransforms for TagTransforms {
    fn resize(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(tag(image, b"|r"))
    }

    fn grayscale(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(tag(image, b"|g"))
    }

    fn watermark(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(tag(image, b"|w"))
    }
}

/// Sink that records persisted side outputs in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub saved: Mutex<Vec<(String, ImagePayload)>>,
}

#[async_trait]
impl WatermarkSink for RecordingSink {
    async fn persist(&self, instance: &str, image: &ImagePayload) -> std::io::Result<()> {
        self.saved.lock().await.push((instance.to_string(), image.clone()));
        Ok(())
    }
}

/// Sink whose persist always fails, for the best-effort side-output tests.
pub struct FailingSink;

#[async_trait]
impl WatermarkSink for FailingSink {
    async fn persist(&self, _instance: &str, _image: &ImagePayload) -> std::io::Result<()> {
        Err(std::io::Error::other("sink unavailable"))
    }
}

pub fn sample_image_uri() -> String {
    ImagePayload::new("image/png", b"px".to_vec()).to_data_uri()
}

/// Runtime with the full pipeline registered over the given store and sink.
pub async fn start_pipeline_runtime(
    store: Arc<dyn HistoryStore>,
    sink: Arc<dyn WatermarkSink>,
    options: RuntimeOptions,
) -> (Arc<Runtime>, Client) {
    let activities = Arc::new(pipeline_activities(Arc::new(TagTransforms), sink));
    let runtime = Runtime::start_with_options(store, activities, pipeline_orchestrations(), options).await;
    let client = Client::new(runtime.clone());
    (runtime, client)
}

/// Fast test options: tight retry backoff and status polling.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        retry_backoff_ms: 1,
        poll_interval_ms: 2,
        ..RuntimeOptions::default()
    }
}
