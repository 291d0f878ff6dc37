use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use skynet_memory::FileKind;

/// How often the background refresh loop re-sends the platform action.
/// Matches the teacher's Telegram typing-indicator refresh cadence, since
/// most platform "presence" primitives expire on the same ~5s window.
pub const ACTION_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// A phase of work the bot wants to signal to the user. Priority determines
/// which phase wins when more than one scope is open at once — a file
/// transfer in progress should outrank a generic "thinking" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Searching,
    Generating,
    Processing,
    Downloading,
    Uploading,
}

impl Phase {
    fn priority(&self) -> u8 {
        match self {
            Phase::Searching => 0,
            Phase::Generating => 1,
            Phase::Processing => 2,
            Phase::Downloading => 3,
            Phase::Uploading => 4,
        }
    }
}

/// The resolved platform action a `ChatActionSink` is asked to send.
/// Platform-neutral; each platform resolver maps this to its own enum
/// (e.g. Telegram's `ChatAction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Typing,
    UploadingPhoto,
    UploadingVideo,
    UploadingAudio,
    UploadingDocument,
    FindingLocation,
}

/// Maps a (phase, optional file-type hint) pair to the platform action to
/// display. File-type hints only matter for `Uploading`/`Downloading`.
fn resolve(phase: Phase, file_hint: Option<FileKind>) -> ActionKind {
    match phase {
        Phase::Uploading | Phase::Downloading => match file_hint {
            Some(FileKind::Image) => ActionKind::UploadingPhoto,
            Some(FileKind::Video) => ActionKind::UploadingVideo,
            Some(FileKind::Audio) => ActionKind::UploadingAudio,
            Some(FileKind::Pdf) | Some(FileKind::Document) | None => ActionKind::UploadingDocument,
        },
        Phase::Searching => ActionKind::FindingLocation,
        Phase::Generating | Phase::Processing => ActionKind::Typing,
    }
}

/// Platform-specific sink that actually sends the resolved action.
#[async_trait]
pub trait ChatActionSink: Send + Sync {
    async fn send_action(&self, action: ActionKind);
}

/// Opaque handle returned by `push_scope`; hand back to `pop_scope` to
/// retire that scope, regardless of push order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

struct Scope {
    id: ScopeId,
    phase: Phase,
    file_hint: Option<FileKind>,
}

struct Inner {
    scopes: Vec<Scope>,
    next_id: u64,
}

/// Owns the scope stack for one (chat, topic) and the background task that
/// keeps refreshing whatever phase currently wins.
pub struct ChatActionManager {
    inner: Mutex<Inner>,
    sink: Arc<dyn ChatActionSink>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatActionManager {
    pub fn new(sink: Arc<dyn ChatActionSink>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                scopes: Vec::new(),
                next_id: 0,
            }),
            sink,
            refresh_task: Mutex::new(None),
        })
    }

    /// Push a new active phase. Returns an id to retire it later.
    pub fn push_scope(self: &Arc<Self>, phase: Phase, file_hint: Option<FileKind>) -> ScopeId {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = ScopeId(inner.next_id);
            inner.next_id += 1;
            inner.scopes.push(Scope { id, phase, file_hint });
            id
        };
        self.ensure_refresh_task_running();
        self.send_current_now();
        id
    }

    /// Remove the scope with `id`, if present. Safe to call out of push order.
    pub fn pop_scope(&self, id: ScopeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.scopes.retain(|s| s.id != id);
        if inner.scopes.is_empty() {
            drop(inner);
            self.stop_refresh_task();
        }
    }

    fn current_action(&self) -> Option<ActionKind> {
        let inner = self.inner.lock().unwrap();
        inner
            .scopes
            .iter()
            .max_by_key(|s| s.phase.priority())
            .map(|s| resolve(s.phase, s.file_hint))
    }

    fn send_current_now(self: &Arc<Self>) {
        if let Some(action) = self.current_action() {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                sink.send_action(action).await;
            });
        }
    }

    fn ensure_refresh_task_running(self: &Arc<Self>) {
        let mut task = self.refresh_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let weak_self = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(ACTION_REFRESH_INTERVAL).await;
                let Some(this) = weak_self.upgrade() else {
                    return;
                };
                match this.current_action() {
                    Some(action) => this.sink.send_action(action).await,
                    None => return,
                }
            }
        }));
    }

    fn stop_refresh_task(&self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for ChatActionManager {
    fn drop(&mut self) {
        self.stop_refresh_task();
    }
}

type RegistryKey = (String, Option<String>);

static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Weak<ChatActionManager>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<RegistryKey, Weak<ChatActionManager>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch or create the manager for `(chat, topic)`. Managers are
/// weak-referenced process-wide — once every `Arc` held by a caller drops,
/// the entry is replaced rather than resurrected on next lookup.
pub fn get_or_create(
    chat_id: &str,
    topic: Option<&str>,
    make_sink: impl FnOnce() -> Arc<dyn ChatActionSink>,
) -> Arc<ChatActionManager> {
    let key = (chat_id.to_string(), topic.map(|t| t.to_string()));
    let mut reg = registry().lock().unwrap();
    if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let manager = ChatActionManager::new(make_sink());
    reg.insert(key, Arc::downgrade(&manager));
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        count: Arc<AtomicUsize>,
        last: Mutex<Option<ActionKind>>,
    }

    #[async_trait]
    impl ChatActionSink for CountingSink {
        async fn send_action(&self, action: ActionKind) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(action);
        }
    }

    #[test]
    fn uploading_with_image_hint_resolves_to_upload_photo() {
        assert_eq!(
            resolve(Phase::Uploading, Some(FileKind::Image)),
            ActionKind::UploadingPhoto
        );
    }

    #[test]
    fn generating_resolves_to_typing_regardless_of_hint() {
        assert_eq!(resolve(Phase::Generating, None), ActionKind::Typing);
    }

    #[tokio::test]
    async fn higher_priority_scope_wins_resolution() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CountingSink {
            count: count.clone(),
            last: Mutex::new(None),
        });
        let manager = ChatActionManager::new(sink.clone());

        let gen_id = manager.push_scope(Phase::Generating, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.push_scope(Phase::Uploading, Some(FileKind::Video));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*sink.last.lock().unwrap(), Some(ActionKind::UploadingVideo));

        manager.pop_scope(gen_id);
    }

    #[test]
    fn pop_scope_is_out_of_order_safe() {
        let sink = Arc::new(CountingSink {
            count: Arc::new(AtomicUsize::new(0)),
            last: Mutex::new(None),
        });
        let manager = ChatActionManager::new(sink);
        let a = manager.push_scope(Phase::Searching, None);
        let b = manager.push_scope(Phase::Processing, None);
        manager.pop_scope(a);
        assert_eq!(manager.current_action(), Some(ActionKind::Typing));
        manager.pop_scope(b);
        assert_eq!(manager.current_action(), None);
    }
}
