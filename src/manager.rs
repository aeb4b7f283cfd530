// Top-level pipeline manager: exactly two supervised streams (mic /
// speaker A, system / speaker B) with independent failure domains and one
// shared transcript callback.

use anyhow::{bail, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::asr;
use crate::config::{Settings, StreamConfig};
use crate::supervisor::{StreamSupervisor, TextCallback};
use crate::worker::StatusSnapshot;

pub struct DualPipelineManager {
    settings: Settings,
    on_text: TextCallback,
    mic: Mutex<Option<StreamSupervisor>>,
    system: Mutex<Option<StreamSupervisor>>,
}

impl DualPipelineManager {
    /// Fails fast when the transcription credential is missing; nothing
    /// is allowed to start without it.
    pub fn new(settings: Settings, on_text: TextCallback) -> Result<Self> {
        let key = std::env::var(asr::API_KEY_ENV).unwrap_or_default();
        if key.trim().is_empty() {
            bail!("{} is not set in the environment", asr::API_KEY_ENV);
        }

        Ok(Self {
            settings,
            on_text,
            mic: Mutex::new(None),
            system: Mutex::new(None),
        })
    }

    /// Start both streams. Each side starts independently; one stream
    /// failing to start never prevents the other from running.
    pub async fn start(&self, mic_device: &str, system_device: &str) -> Result<()> {
        self.stop().await;

        info!(
            "starting dual pipeline: mic={} system={}",
            mic_device, system_device
        );

        let mut mic_config = StreamConfig::mic(mic_device);
        mic_config.paced_send = self.settings.paced_send;
        let mut system_config = StreamConfig::system(system_device);
        system_config.paced_send = self.settings.paced_send;

        let mic = StreamSupervisor::new(mic_config, self.settings.clone(), self.on_text.clone());
        let system = StreamSupervisor::new(
            system_config,
            self.settings.clone(),
            self.on_text.clone(),
        );

        let mic_result = mic.start().await;
        let system_result = system.start().await;

        *self.mic.lock().await = Some(mic);
        *self.system.lock().await = Some(system);

        mic_result?;
        system_result?;
        Ok(())
    }

    /// Stop both streams, independently. Never fails; stopping a stream
    /// that was never started is a no-op.
    pub async fn stop(&self) {
        if let Some(mic) = self.mic.lock().await.as_ref() {
            mic.stop().await;
        }
        if let Some(system) = self.system.lock().await.as_ref() {
            system.stop().await;
        }
    }

    /// Merged status view keyed by stream label. Both keys are always
    /// present with a complete shape, even before the first start.
    pub async fn status(&self) -> HashMap<String, StatusSnapshot> {
        let mut out = HashMap::new();

        let mic = self.mic.lock().await;
        out.insert(
            "mic".to_string(),
            mic.as_ref()
                .map(|s| s.latest())
                .unwrap_or_default(),
        );

        let system = self.system.lock().await;
        out.insert(
            "system".to_string(),
            system
                .as_ref()
                .map(|s| s.latest())
                .unwrap_or_default(),
        );

        out
    }
}
