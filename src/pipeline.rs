//! Image pipeline built on the orchestration core: resize, then grayscale,
//! then watermark, with images carried through history as data URIs.
//!
//! Payloads stay strings end to end so the history log is self-contained;
//! handlers decode at the edge and re-encode their output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

use crate::runtime::registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};
use crate::{ActivityError, OrchestrationContext};

pub const RESIZE_IMAGE: &str = "resizeImage";
pub const GRAY_SCALE: &str = "grayScale";
pub const WATER_MARK: &str = "waterMark";
pub const IMAGE_PIPELINE: &str = "ImagePipeline";

/// A decoded image payload: media type plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self, ActivityError> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| ActivityError::invalid_encoding("payload is not a data URI"))?;
        let (mime, encoded) = rest
            .split_once(";base64,")
            .ok_or_else(|| ActivityError::invalid_encoding("data URI is not base64-encoded"))?;
        if mime.is_empty() {
            return Err(ActivityError::invalid_encoding("data URI has an empty media type"));
        }
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ActivityError::invalid_encoding(format!("invalid base64 payload: {e}")))?;
        Ok(Self {
            mime: mime.to_string(),
            bytes,
        })
    }

    /// Encode back into a `data:` URI.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

/// Image operations plugged into the pipeline activities.
///
/// Implementations run on worker tasks and must be safe to call more than
/// once for the same step; redelivery after a crash re-runs the transform.
pub trait ImageTransforms: Send + Sync {
    fn resize(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError>;
    fn grayscale(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError>;
    fn watermark(&self, image: &ImagePayload) -> Result<ImagePayload, ActivityError>;
}

/// Destination for the watermarked side output.
#[async_trait]
pub trait WatermarkSink: Send + Sync {
    async fn persist(&self, instance: &str, image: &ImagePayload) -> std::io::Result<()>;
}

/// Writes watermarked images under a directory, one file per instance, with
/// an extension derived from the media type.
pub struct FsWatermarkSink {
    dir: PathBuf,
}

impl FsWatermarkSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn file_path(&self, instance: &str, mime: &str) -> PathBuf {
        let ext = mime.rsplit('/').next().unwrap_or("bin");
        self.dir.join(format!("{instance}-watermarked.{ext}"))
    }
}

#[async_trait]
impl WatermarkSink for FsWatermarkSink {
    async fn persist(&self, instance: &str, image: &ImagePayload) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.file_path(instance, &image.mime);
        tokio::fs::write(&path, &image.bytes).await?;
        info!(instance, path = %path.display(), "persisted watermarked image");
        Ok(())
    }
}

fn apply(
    transform: impl Fn(&ImagePayload) -> Result<ImagePayload, ActivityError>,
    input: &str,
) -> Result<String, ActivityError> {
    let image = ImagePayload::from_data_uri(input)?;
    Ok(transform(&image)?.to_data_uri())
}

/// Build the activity registry for the pipeline.
pub fn pipeline_activities(
    transforms: Arc<dyn ImageTransforms>,
    sink: Arc<dyn WatermarkSink>,
) -> ActivityRegistry {
    let resize = transforms.clone();
    let gray = transforms.clone();
    let mark = transforms;
    ActivityRegistry::builder()
        .register(RESIZE_IMAGE, move |_ctx: ActivityContext, input: String| {
            let t = resize.clone();
            async move { apply(|img| t.resize(img), &input) }
        })
        .register(GRAY_SCALE, move |_ctx: ActivityContext, input: String| {
            let t = gray.clone();
            async move { apply(|img| t.grayscale(img), &input) }
        })
        .register(WATER_MARK, move |ctx: ActivityContext, input: String| {
            let t = mark.clone();
            let sink = sink.clone();
            async move {
                let image = ImagePayload::from_data_uri(&input)?;
                let marked = t.watermark(&image)?;
                // Side output only. A sink failure is logged and the step
                // still succeeds; the durable result is the returned URI.
                if let Err(e) = sink.persist(&ctx.instance, &marked).await {
                    warn!(instance = %ctx.instance, error = %e, "watermark sink failed");
                }
                Ok(marked.to_data_uri())
            }
        })
        .build()
}

/// The pipeline orchestration: three sequential activities over the same
/// image. Returns the grayscale (pre-watermark) output; the watermarked
/// version goes to the sink.
pub async fn image_pipeline(ctx: OrchestrationContext, input: String) -> Result<String, ActivityError> {
    let resized = ctx.schedule_activity(RESIZE_IMAGE, input).await?;
    let grayscaled = ctx.schedule_activity(GRAY_SCALE, resized).await?;
    let _watermarked = ctx.schedule_activity(WATER_MARK, grayscaled.clone()).await?;
    Ok(grayscaled)
}

/// Build the orchestration registry for the pipeline.
pub fn pipeline_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(IMAGE_PIPELINE, image_pipeline)
        .build()
}
