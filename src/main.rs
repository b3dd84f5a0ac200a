use std::sync::Arc;
use std::time::Duration;

use durapix::client::Client;
use durapix::pipeline::{
    pipeline_activities, pipeline_orchestrations, FsWatermarkSink, ImagePayload, ImageTransforms, IMAGE_PIPELINE,
};
use durapix::providers::fs::FsHistoryStore;
use durapix::runtime::{OrchestrationStatus, Runtime};
use durapix::ActivityError;

/// Demo transforms that stamp each step into the byte stream instead of doing
/// real image processing.
struct StampTransforms;

fn stamp(bytes: &[u8], tag: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.extend_from_slice(tag);
    out
}

impl ImageTransforms for StampTransforms {
    fn resize(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(ImagePayload::new(image.mime.clone(), stamp(&image.bytes, b"|resized")))
    }

    fn grayscale(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(ImagePayload::new(image.mime.clone(), stamp(&image.bytes, b"|grayscaled")))
    }

    fn watermark(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError> {
        Ok(ImagePayload::new(image.mime.clone(), stamp(&image.bytes, b"|watermarked")))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(FsHistoryStore::new("./data/history", false));
    let activities = Arc::new(pipeline_activities(
        Arc::new(StampTransforms),
        Arc::new(FsWatermarkSink::new("./data/watermarked")),
    ));
    let runtime = Runtime::start_with_store(store, activities, pipeline_orchestrations()).await;
    let client = Client::new(runtime.clone());

    let input = ImagePayload::new("image/png", b"demo-image".to_vec()).to_data_uri();
    let instance = client.start(IMAGE_PIPELINE, input).await?;
    println!("started pipeline instance {instance}");

    match client.wait(&instance, Duration::from_secs(10)).await? {
        OrchestrationStatus::Completed { output } => {
            let image = ImagePayload::from_data_uri(&output)?;
            println!("pipeline output: {}", String::from_utf8_lossy(&image.bytes));
        }
        other => println!("pipeline did not complete: {other:?}"),
    }

    runtime.shutdown().await;
    Ok(())
}
