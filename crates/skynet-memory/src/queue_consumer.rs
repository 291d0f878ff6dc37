//! [`skynet_queue::QueueConsumer`] implementations for the envelope kinds
//! this crate owns: `Message` (turn persistence) and `File` (upload binding
//! persistence), per the ownership convention documented on `Flusher`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skynet_queue::{EnvelopeKind, FlushOutcome, QueueConsumer, WriteEnvelope};

use crate::files::FileStore;
use crate::thread::ThreadCache;
use crate::types::{FileKind, NewMessage};

/// Drains `Message` envelopes into [`ThreadCache::append_message`].
///
/// The message's own row id is never needed by the enqueuing caller — by
/// the time an assistant turn is queued, nothing else in that request reads
/// it back — so this can run fully asynchronously.
pub struct MessageConsumer {
    threads: Arc<ThreadCache>,
}

impl MessageConsumer {
    pub fn new(threads: Arc<ThreadCache>) -> Self {
        Self { threads }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for MessageConsumer {
    async fn apply_batch(&self, _kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome {
        let mut succeeded = 0;
        let mut failed = Vec::new();
        for env in batch {
            match serde_json::from_value::<NewMessage>(env.payload.clone()) {
                Ok(msg) => match self.threads.append_message(msg) {
                    Ok(_) => succeeded += 1,
                    Err(e) => {
                        tracing::warn!("queued message write failed: {e}");
                        failed.push(env);
                    }
                },
                Err(e) => {
                    tracing::warn!("queued message envelope is malformed, dropping: {e}");
                }
            }
        }
        FlushOutcome { succeeded, failed }
    }
}

/// Payload for a queued `File` envelope: everything [`FileStore::register`]
/// needs, plus the LLM-files-API handle when it is already known at enqueue
/// time (normalization always uploads before registering, so it usually is).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFile {
    pub platform_file_id: String,
    pub mime_type: String,
    pub kind: FileKind,
    pub message_id: Option<i64>,
    pub ttl_secs: i64,
    pub llm_file_id: Option<String>,
}

/// Drains `File` envelopes into [`FileStore::register`] (+ `mark_uploaded`
/// when `llm_file_id` is already known).
pub struct FileConsumer {
    files: Arc<FileStore>,
}

impl FileConsumer {
    pub fn new(files: Arc<FileStore>) -> Self {
        Self { files }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for FileConsumer {
    async fn apply_batch(&self, _kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome {
        let mut succeeded = 0;
        let mut failed = Vec::new();
        for env in batch {
            match serde_json::from_value::<QueuedFile>(env.payload.clone()) {
                Ok(qf) => {
                    let registered = self.files.register(
                        &qf.platform_file_id,
                        &qf.mime_type,
                        qf.kind,
                        qf.message_id,
                        qf.ttl_secs,
                    );
                    match registered {
                        Ok(file) => {
                            let mark_ok = match &qf.llm_file_id {
                                Some(llm_id) => self.files.mark_uploaded(file.id, llm_id).is_ok(),
                                None => true,
                            };
                            if mark_ok {
                                succeeded += 1;
                            } else {
                                failed.push(env);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("queued file write failed: {e}");
                            failed.push(env);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("queued file envelope is malformed, dropping: {e}");
                }
            }
        }
        FlushOutcome { succeeded, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageRole, ThreadKey};
    use rusqlite::Connection;

    fn open_threads() -> Arc<ThreadCache> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(ThreadCache::new(conn))
    }

    fn open_files() -> Arc<FileStore> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(FileStore::new(conn))
    }

    #[tokio::test]
    async fn message_consumer_applies_queued_turn() {
        let threads = open_threads();
        let thread = threads.get_or_create_thread(&ThreadKey::new("c1", "u1", None)).unwrap();
        let consumer = MessageConsumer::new(threads.clone());

        let msg = NewMessage {
            chat_id: "c1".into(),
            platform_message_id: 1,
            thread_id: thread.id,
            role: MessageRole::Assistant,
            text: "hi".into(),
            content_blob: None,
            sender_display: None,
            reply: None,
            forward: None,
            quote: None,
            has_attachments: false,
            model_used: Some("test-model".into()),
            tokens_in: 10,
            tokens_out: 5,
            cost: skynet_core::money::Money::ZERO,
        };
        let env = WriteEnvelope {
            id: 1,
            kind: EnvelopeKind::Message,
            payload: serde_json::to_value(&msg).unwrap(),
            enqueued_at: "now".into(),
            attempts: 0,
            retry_after: None,
        };

        let outcome = consumer.apply_batch(EnvelopeKind::Message, vec![env]).await;
        assert_eq!(outcome.succeeded, 1);
        assert!(outcome.failed.is_empty());

        let history = threads.get_recent_messages(thread.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hi");
    }

    #[tokio::test]
    async fn file_consumer_registers_and_marks_uploaded() {
        let files = open_files();
        let consumer = FileConsumer::new(files.clone());

        let qf = QueuedFile {
            platform_file_id: "tg-1".into(),
            mime_type: "image/png".into(),
            kind: FileKind::Image,
            message_id: Some(1),
            ttl_secs: 3600,
            llm_file_id: Some("files-api-9".into()),
        };
        let env = WriteEnvelope {
            id: 1,
            kind: EnvelopeKind::File,
            payload: serde_json::to_value(&qf).unwrap(),
            enqueued_at: "now".into(),
            attempts: 0,
            retry_after: None,
        };

        let outcome = consumer.apply_batch(EnvelopeKind::File, vec![env]).await;
        assert_eq!(outcome.succeeded, 1);

        let registered = files.for_message(1).unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].llm_file_id.as_deref(), Some("files-api-9"));
    }
}
