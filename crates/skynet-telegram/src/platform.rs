//! Telegram implementation of `skynet_agent::normalize::PlatformClient` —
//! the one concrete binding of the normalizer's platform seam.

use std::sync::Arc;

use async_trait::async_trait;
use skynet_agent::normalize::{NormalizeError, PlatformClient, Transcript};
use skynet_agent::tools::ToolFileOutput;
use skynet_agent::{BlobCache, FilesClient};
use skynet_core::config::PricingConfig;
use skynet_core::money::Money;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ThreadId};
use tracing::warn;

use crate::stt::{self, TranscriptionBackend};

pub struct TelegramPlatformClient {
    bot: Bot,
    files: FilesClient,
    blobs: Arc<BlobCache>,
    stt_backend: TranscriptionBackend,
    pricing: PricingConfig,
}

impl TelegramPlatformClient {
    pub fn new(
        bot: Bot,
        files: FilesClient,
        blobs: Arc<BlobCache>,
        stt_backend: TranscriptionBackend,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            bot,
            files,
            blobs,
            stt_backend,
            pricing,
        }
    }
}

#[async_trait]
impl PlatformClient for TelegramPlatformClient {
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, NormalizeError> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| NormalizeError::DownloadFailed(e.to_string()))?;

        let mut buf: Vec<u8> = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .map_err(|e| NormalizeError::DownloadFailed(e.to_string()))?;

        Ok(buf)
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, NormalizeError> {
        let transcribed = stt::transcribe(&self.stt_backend, audio)
            .await
            .map_err(NormalizeError::TranscriptionFailed)?;

        let minutes = transcribed.seconds as f64 / 60.0;
        let cost = Money::from_micros(
            (self.pricing.whisper_cost_per_minute.micros() as f64 * minutes).round() as i64,
        );

        Ok(Transcript {
            text: transcribed.text,
            seconds: transcribed.seconds,
            language: transcribed.language,
            cost,
        })
    }

    async fn upload_to_llm_files(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, NormalizeError> {
        self.files
            .upload(bytes, mime_type)
            .await
            .map_err(|e| NormalizeError::UploadFailed(e.to_string()))
    }

    async fn cache_blob(&self, key: &str, bytes: &[u8]) {
        self.blobs.insert(key, bytes);
    }
}

impl TelegramPlatformClient {
    /// Deliver a tool-generated file to the chat: `send_photo` for images
    /// (renders inline), `send_document` for everything else.
    pub async fn send_file(
        &self,
        chat_id: ChatId,
        thread_id: Option<ThreadId>,
        file: &ToolFileOutput,
    ) {
        let input = InputFile::memory(file.bytes.clone()).file_name(file.filename.clone());

        let result = if file.mime_type.starts_with("image/") {
            let mut req = self.bot.send_photo(chat_id, input);
            if let Some(thread_id) = thread_id {
                req = req.message_thread_id(thread_id);
            }
            req.await.map(|_| ())
        } else {
            let mut req = self.bot.send_document(chat_id, input);
            if let Some(thread_id) = thread_id {
                req = req.message_thread_id(thread_id);
            }
            req.await.map(|_| ())
        };

        if let Err(e) = result {
            warn!(error = %e, filename = %file.filename, "Telegram: failed to deliver file");
        }
    }
}
