//! Built-in engine commands.

pub mod camera;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use observatory::{CommandContext, CommandHandler, CommandRegistry, HandlerError, HandlerOutput};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::EngineArgs;
use camera::{CaptureDevice, CommandCamera, NoCamera};
use store::{MeasurementRecord, MeasurementStore, SqliteStore, StoreError};

pub const PING: &str = "ping";
pub const CAPTURE_PHOTO: &str = "capture_photo";
pub const SAVE_MEASUREMENT: &str = "save_measurement";

/// Build the registry for the engine process from its settings.
pub fn build_registry(args: &EngineArgs) -> Result<CommandRegistry, StoreError> {
    let camera: Arc<dyn CaptureDevice> = match args.capture_command.as_deref() {
        Some(command_line) => Arc::new(CommandCamera::new(command_line)),
        None => {
            tracing::warn!("No capture command configured, capture_photo will fail");
            Arc::new(NoCamera)
        }
    };
    let store = SqliteStore::open(args.store_path())?;
    tracing::info!(path = %store.path().display(), "Measurement store opened");

    let registry = CommandRegistry::builder()
        .register_fn(PING, ping)
        .register(
            CAPTURE_PHOTO,
            CapturePhoto {
                camera,
                asset_dir: args.asset_dir.clone(),
                frame_interval: args.frame_interval,
                warmup: args.warmup,
            },
        )
        .register(
            SAVE_MEASUREMENT,
            SaveMeasurement {
                store: Arc::new(store),
                room_id: args.room_id.clone(),
            },
        )
        .build();
    Ok(registry)
}

async fn ping(_payload: Value) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::ok(json!("pong")))
}

/// Payloads that may be `null` fall back to their defaults.
fn payload_or_default<T>(payload: Value) -> Result<T, HandlerError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if payload.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_value(payload)?)
    }
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    #[serde(default = "one")]
    count: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self { count: one() }
    }
}

fn one() -> u32 {
    1
}

pub struct CapturePhoto {
    pub camera: Arc<dyn CaptureDevice>,
    pub asset_dir: PathBuf,
    pub frame_interval: Duration,
    pub warmup: Duration,
}

#[async_trait]
impl CommandHandler for CapturePhoto {
    async fn handle(
        &self,
        payload: Value,
        context: CommandContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let request: CaptureRequest = payload_or_default(payload)?;
        if request.count == 0 {
            return Err(HandlerError::invalid_payload("count must be at least 1"));
        }

        let prefix = context.timestamp;
        tracing::info!(count = request.count, %prefix, "Starting photo capture");

        // Let the sensor adjust to the light before the first frame.
        tokio::time::sleep(self.warmup).await;

        let mut assets = Vec::with_capacity(request.count as usize);
        for i in 0..request.count {
            if i > 0 {
                tokio::time::sleep(self.frame_interval).await;
            }
            let path = self.asset_dir.join(format!("{prefix}-photo_{i}.jpg"));
            let asset = self
                .camera
                .capture(&path)
                .await
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            tracing::debug!(path = %asset.path.display(), "Photo taken");
            assets.push(asset.path.to_string_lossy().into_owned());
        }

        let message = format!("captured {} photo(s)", assets.len());
        Ok(HandlerOutput::new(json!(assets), message))
    }
}

#[derive(Debug, Deserialize)]
struct MeasurementInput {
    kind: String,
    value: f64,
    #[serde(default)]
    unit: Option<String>,
}

pub struct SaveMeasurement {
    pub store: Arc<dyn MeasurementStore>,
    pub room_id: String,
}

#[async_trait]
impl CommandHandler for SaveMeasurement {
    async fn handle(
        &self,
        payload: Value,
        _context: CommandContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let input: MeasurementInput = serde_json::from_value(payload)?;
        let record = MeasurementRecord {
            room_id: self.room_id.clone(),
            kind: input.kind,
            value: input.value,
            unit: input.unit,
            recorded_at: chrono::Utc::now(),
        };

        self.store
            .save(&record)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        tracing::info!(kind = %record.kind, value = record.value, "Measurement saved");
        Ok(HandlerOutput::new(serde_json::to_value(&record)?, "saved"))
    }
}
