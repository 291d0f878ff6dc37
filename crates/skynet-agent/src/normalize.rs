use async_trait::async_trait;
use skynet_core::money::Money;
use skynet_memory::{FileKind, ForwardOrigin, QuoteContext};
use thiserror::Error;

/// The downstream-ready output of normalizing one platform event. Carries
/// every blocking I/O result a consumer would otherwise need — downloads,
/// transcriptions, uploads — already resolved.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub chat_id: String,
    pub platform_message_id: i64,
    pub sender_id: String,
    pub sender_display: String,
    pub text: String,
    pub transcript: Option<Transcript>,
    pub files: Vec<ProcessedFile>,
    pub reply: Option<IncomingReplyRef>,
    pub forward: Option<ForwardOrigin>,
    pub quote: Option<QuoteContext>,
    pub is_group_chat: bool,
    pub topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub seconds: f32,
    pub language: Option<String>,
    pub cost: Money,
}

#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub platform_file_id: String,
    pub llm_file_id: String,
    pub mime_type: String,
    pub kind: FileKind,
    /// Key under which the raw bytes were mirrored into the short-TTL blob
    /// cache, so a tool (`transcribe_audio`, sandboxed execution) can read
    /// them without re-downloading.
    pub cache_key: String,
}

#[derive(Debug, Clone)]
pub struct IncomingReplyRef {
    pub snippet: String,
    pub sender_display: String,
}

/// A photo candidate at one resolution; the normalizer picks the largest.
#[derive(Debug, Clone)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub enum MediaKind {
    Text,
    Voice { file_id: String },
    VideoNote { file_id: String },
    Audio { file_id: String },
    Video { file_id: String },
    Photo { sizes: Vec<PhotoSize> },
    Document { file_id: String },
}

/// Platform event shape, decoupled from any one platform SDK. A platform
/// crate (e.g. Telegram) maps its own update type into this before handing
/// it to the normalizer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: String,
    pub platform_message_id: i64,
    pub sender_id: Option<String>,
    pub sender_display: Option<String>,
    pub text: String,
    pub mime_type: Option<String>,
    pub media: MediaKind,
    pub reply_to: Option<IncomingReplyRef>,
    pub forward_origin: Option<ForwardOrigin>,
    pub quote: Option<QuoteContext>,
    pub is_group_chat: bool,
    pub topic: Option<String>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message has no sender")]
    InvalidMessage,
    #[error("failed to download attachment: {0}")]
    DownloadFailed(String),
    #[error("speech-to-text failed: {0}")]
    TranscriptionFailed(String),
    #[error("failed to upload file: {0}")]
    UploadFailed(String),
}

/// Everything the normalizer needs from the hosting platform — blocking I/O
/// is confined here so `normalize` itself stays a pure orchestration step.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, NormalizeError>;
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, NormalizeError>;
    async fn upload_to_llm_files(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, NormalizeError>;
    /// Mirror raw bytes into the short-TTL blob cache under `key`.
    async fn cache_blob(&self, key: &str, bytes: &[u8]);
}

fn derive_kind_from_mime(mime: &str) -> FileKind {
    if mime.starts_with("image/") {
        FileKind::Image
    } else if mime.starts_with("audio/") {
        FileKind::Audio
    } else if mime.starts_with("video/") {
        FileKind::Video
    } else if mime == "application/pdf" {
        FileKind::Pdf
    } else {
        FileKind::Document
    }
}

pub struct Normalizer<'a> {
    client: &'a dyn PlatformClient,
}

impl<'a> Normalizer<'a> {
    pub fn new(client: &'a dyn PlatformClient) -> Self {
        Self { client }
    }

    /// Download, cache, and upload one file-bearing attachment; returns the
    /// `ProcessedFile` entry for it.
    async fn download_cache_upload(
        &self,
        file_id: &str,
        mime_type: &str,
        kind: FileKind,
    ) -> Result<ProcessedFile, NormalizeError> {
        let bytes = self
            .client
            .download_file(file_id)
            .await
            .map_err(|e| NormalizeError::DownloadFailed(e.to_string()))?;
        self.client.cache_blob(file_id, &bytes).await;
        let llm_file_id = self
            .client
            .upload_to_llm_files(&bytes, mime_type)
            .await
            .map_err(|e| NormalizeError::UploadFailed(e.to_string()))?;
        Ok(ProcessedFile {
            platform_file_id: file_id.to_string(),
            llm_file_id,
            mime_type: mime_type.to_string(),
            kind,
            cache_key: file_id.to_string(),
        })
    }

    /// Normalize one platform event into a `ProcessedMessage`. On any
    /// failure the caller should reject the platform event outright — no
    /// partial state is written here.
    pub async fn normalize(
        &self,
        msg: IncomingMessage,
    ) -> Result<ProcessedMessage, NormalizeError> {
        let sender_id = msg.sender_id.clone().ok_or(NormalizeError::InvalidMessage)?;
        let sender_display = msg.sender_display.clone().unwrap_or_else(|| sender_id.clone());

        let mut files = Vec::new();
        let mut transcript = None;

        match &msg.media {
            MediaKind::Text => {}

            MediaKind::Voice { file_id } | MediaKind::VideoNote { file_id } => {
                let bytes = self
                    .client
                    .download_file(file_id)
                    .await
                    .map_err(|e| NormalizeError::DownloadFailed(e.to_string()))?;
                self.client.cache_blob(file_id, &bytes).await;
                let t = self
                    .client
                    .transcribe(&bytes)
                    .await
                    .map_err(|e| NormalizeError::TranscriptionFailed(e.to_string()))?;
                transcript = Some(t);
            }

            MediaKind::Audio { file_id } => {
                let mime = msg.mime_type.as_deref().unwrap_or("audio/ogg");
                files.push(
                    self.download_cache_upload(file_id, mime, FileKind::Audio)
                        .await?,
                );
            }

            MediaKind::Video { file_id } => {
                let mime = msg.mime_type.as_deref().unwrap_or("video/mp4");
                files.push(
                    self.download_cache_upload(file_id, mime, FileKind::Video)
                        .await?,
                );
            }

            MediaKind::Photo { sizes } => {
                let largest = sizes
                    .iter()
                    .max_by_key(|s| s.width as u64 * s.height as u64)
                    .ok_or(NormalizeError::InvalidMessage)?;
                let mime = msg.mime_type.as_deref().unwrap_or("image/jpeg");
                files.push(
                    self.download_cache_upload(&largest.file_id, mime, FileKind::Image)
                        .await?,
                );
            }

            MediaKind::Document { file_id } => {
                let mime = msg.mime_type.as_deref().unwrap_or("application/octet-stream");
                let kind = derive_kind_from_mime(mime);
                files.push(self.download_cache_upload(file_id, mime, kind).await?);
            }
        }

        Ok(ProcessedMessage {
            chat_id: msg.chat_id,
            platform_message_id: msg.platform_message_id,
            sender_id,
            sender_display,
            text: msg.text,
            transcript,
            files,
            reply: msg.reply_to,
            forward: msg.forward_origin,
            quote: msg.quote,
            is_group_chat: msg.is_group_chat,
            topic: msg.topic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeClient {
        cached: Mutex<Vec<String>>,
        fail_transcribe: bool,
    }

    #[async_trait]
    impl PlatformClient for FakeClient {
        async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, NormalizeError> {
            Ok(format!("bytes-for-{file_id}").into_bytes())
        }

        async fn transcribe(&self, _audio: &[u8]) -> Result<Transcript, NormalizeError> {
            if self.fail_transcribe {
                return Err(NormalizeError::TranscriptionFailed("asr down".into()));
            }
            Ok(Transcript {
                text: "hello there".into(),
                seconds: 2.5,
                language: Some("en".into()),
                cost: Money::ZERO,
            })
        }

        async fn upload_to_llm_files(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
        ) -> Result<String, NormalizeError> {
            Ok("llm-file-1".into())
        }

        async fn cache_blob(&self, key: &str, _bytes: &[u8]) {
            self.cached.lock().unwrap().push(key.to_string());
        }
    }

    fn base_msg(media: MediaKind) -> IncomingMessage {
        IncomingMessage {
            chat_id: "c1".into(),
            platform_message_id: 1,
            sender_id: Some("u1".into()),
            sender_display: Some("Alice".into()),
            text: String::new(),
            mime_type: None,
            media,
            reply_to: None,
            forward_origin: None,
            quote: None,
            is_group_chat: false,
            topic: None,
        }
    }

    #[tokio::test]
    async fn text_message_passes_through_untouched() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: false,
        };
        let mut msg = base_msg(MediaKind::Text);
        msg.text = "hi".into();
        let out = Normalizer::new(&client).normalize(msg).await.unwrap();
        assert_eq!(out.text, "hi");
        assert!(out.files.is_empty());
        assert!(out.transcript.is_none());
    }

    #[tokio::test]
    async fn voice_message_produces_transcript_and_caches_bytes() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: false,
        };
        let msg = base_msg(MediaKind::Voice {
            file_id: "v1".into(),
        });
        let out = Normalizer::new(&client).normalize(msg).await.unwrap();
        assert_eq!(out.transcript.unwrap().text, "hello there");
        assert_eq!(client.cached.lock().unwrap().as_slice(), ["v1"]);
    }

    #[tokio::test]
    async fn transcription_failure_surfaces_as_transcription_failed() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: true,
        };
        let msg = base_msg(MediaKind::Voice {
            file_id: "v1".into(),
        });
        let err = Normalizer::new(&client).normalize(msg).await.unwrap_err();
        assert!(matches!(err, NormalizeError::TranscriptionFailed(_)));
    }

    #[tokio::test]
    async fn photo_picks_largest_size() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: false,
        };
        let msg = base_msg(MediaKind::Photo {
            sizes: vec![
                PhotoSize { file_id: "small".into(), width: 90, height: 90 },
                PhotoSize { file_id: "big".into(), width: 800, height: 600 },
            ],
        });
        let out = Normalizer::new(&client).normalize(msg).await.unwrap();
        assert_eq!(out.files[0].platform_file_id, "big");
        assert_eq!(out.files[0].kind, FileKind::Image);
    }

    #[tokio::test]
    async fn document_derives_kind_from_mime() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: false,
        };
        let mut msg = base_msg(MediaKind::Document {
            file_id: "d1".into(),
        });
        msg.mime_type = Some("application/pdf".into());
        let out = Normalizer::new(&client).normalize(msg).await.unwrap();
        assert_eq!(out.files[0].kind, FileKind::Pdf);
    }

    #[tokio::test]
    async fn missing_sender_is_invalid_message() {
        let client = FakeClient {
            cached: Mutex::new(Vec::new()),
            fail_transcribe: false,
        };
        let mut msg = base_msg(MediaKind::Text);
        msg.sender_id = None;
        let err = Normalizer::new(&client).normalize(msg).await.unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidMessage));
    }
}
