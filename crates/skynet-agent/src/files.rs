//! Anthropic Files API client — uploads attachment bytes once so later turns
//! reference them by `file_id` instead of re-sending base64 content blocks.

use serde::Deserialize;

use crate::provider::ProviderError;

const FILES_BETA: &str = "files-api-2025-04-14";

pub struct FilesClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    is_oauth: bool,
}

impl FilesClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        let is_oauth = api_key.starts_with("sk-ant-oat01-");
        Self {
            client: reqwest::Client::new(),
            is_oauth,
            api_key,
            base_url,
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }

    /// Upload raw bytes, returning the `file_id` the Messages API accepts in
    /// a `{"type": "file", "file_id": ...}` content block.
    pub async fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name("upload")
            .mime_str(mime_type)
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/v1/files", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", "2023-06-01")
            .header("anthropic-beta", FILES_BETA)
            .multipart(form);

        let resp = self.apply_auth(builder).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let parsed: UploadResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parsed.id)
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}
