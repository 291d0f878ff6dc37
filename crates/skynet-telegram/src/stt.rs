//! Speech-to-text backend for Telegram voice messages and video notes.
//!
//! Selected via `[stt]` in config:
//! - `"none"` — disabled (default); voice messages fail to normalize
//! - `"openai_whisper"` — OpenAI Whisper API (`api_key` required)
//! - `"whisper_cpp"` — local whisper.cpp subprocess (`whisper` in PATH)

use serde::Deserialize;

/// Transcription backend selection.
pub enum TranscriptionBackend {
    None,
    OpenAiWhisper { api_key: String, base_url: String },
    WhisperCpp,
}

impl TranscriptionBackend {
    pub fn from_config(cfg: &skynet_core::config::SttConfig) -> Self {
        match cfg.provider.to_lowercase().as_str() {
            "openai_whisper" | "openai" | "whisper_api" => match &cfg.api_key {
                Some(api_key) => Self::OpenAiWhisper {
                    api_key: api_key.clone(),
                    base_url: cfg.base_url.clone(),
                },
                None => Self::None,
            },
            "whisper_cpp" | "whisper" | "local" => Self::WhisperCpp,
            _ => Self::None,
        }
    }
}

/// Result of a successful transcription: text plus duration and detected
/// language, when the backend reports them.
pub struct TranscribedAudio {
    pub text: String,
    pub seconds: f32,
    pub language: Option<String>,
}

/// Transcribe audio bytes (OGG/OPUS for Telegram voice messages) using the
/// configured backend.
pub async fn transcribe(
    backend: &TranscriptionBackend,
    audio_bytes: &[u8],
) -> Result<TranscribedAudio, String> {
    match backend {
        TranscriptionBackend::None => {
            Err("voice transcription not configured: set [stt] provider and api_key".to_string())
        }
        TranscriptionBackend::OpenAiWhisper { api_key, base_url } => {
            transcribe_openai(api_key, base_url, audio_bytes).await
        }
        TranscriptionBackend::WhisperCpp => transcribe_whisper_cpp(audio_bytes).await,
    }
}

#[derive(Deserialize)]
struct WhisperVerboseResponse {
    text: String,
    #[serde(default)]
    duration: Option<f32>,
    #[serde(default)]
    language: Option<String>,
}

async fn transcribe_openai(
    api_key: &str,
    base_url: &str,
    audio_bytes: &[u8],
) -> Result<TranscribedAudio, String> {
    let part = reqwest::multipart::Part::bytes(audio_bytes.to_vec())
        .file_name("audio.ogg")
        .mime_str("audio/ogg")
        .map_err(|e| e.to_string())?;

    let form = reqwest::multipart::Form::new()
        .text("model", "whisper-1")
        .text("response_format", "verbose_json")
        .part("file", part);

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base_url}/v1/audio/transcriptions"))
        .header("Authorization", format!("Bearer {api_key}"))
        .multipart(form)
        .send()
        .await
        .map_err(|e| format!("Whisper API request failed: {e}"))?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("Whisper API error: {body}"));
    }

    let parsed: WhisperVerboseResponse =
        resp.json().await.map_err(|e| format!("Whisper API response: {e}"))?;

    Ok(TranscribedAudio {
        text: parsed.text.trim().to_string(),
        seconds: parsed.duration.unwrap_or(0.0),
        language: parsed.language,
    })
}

async fn transcribe_whisper_cpp(audio_bytes: &[u8]) -> Result<TranscribedAudio, String> {
    use tokio::process::Command;

    let pid = std::process::id();
    let tmp_input = format!("/tmp/skynet_whisper_{pid}.ogg");

    tokio::fs::write(&tmp_input, audio_bytes)
        .await
        .map_err(|e| format!("failed to write temp audio: {e}"))?;

    let output = Command::new("whisper")
        .args([
            "--model",
            "base",
            "--output-format",
            "txt",
            "--output-dir",
            "/tmp",
            &tmp_input,
        ])
        .output()
        .await
        .map_err(|e| format!("whisper.cpp not found or failed to execute: {e}"));

    let _ = tokio::fs::remove_file(&tmp_input).await;
    let output = output?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("whisper.cpp failed: {stderr}"));
    }

    let txt_output = format!("/tmp/skynet_whisper_{pid}.txt");
    let text = tokio::fs::read_to_string(&txt_output)
        .await
        .map_err(|e| format!("failed to read whisper output: {e}"))?;
    let _ = tokio::fs::remove_file(&txt_output).await;

    Ok(TranscribedAudio {
        text: text.trim().to_string(),
        seconds: 0.0,
        language: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_none_when_provider_unset() {
        let cfg = skynet_core::config::SttConfig {
            provider: "none".to_string(),
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
        };
        assert!(matches!(
            TranscriptionBackend::from_config(&cfg),
            TranscriptionBackend::None
        ));
    }

    #[test]
    fn from_config_falls_back_to_none_without_api_key() {
        let cfg = skynet_core::config::SttConfig {
            provider: "openai_whisper".to_string(),
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
        };
        assert!(matches!(
            TranscriptionBackend::from_config(&cfg),
            TranscriptionBackend::None
        ));
    }

    #[tokio::test]
    async fn none_backend_errors() {
        let err = transcribe(&TranscriptionBackend::None, b"audio")
            .await
            .unwrap_err();
        assert!(err.contains("not configured"));
    }
}
