//! Text-buffer models and the editor-widget seam.
//!
//! The session layer does not render anything. It owns the mutable
//! [`TextModel`]s that back open files (one per session, registered in the
//! host's [`ModelRegistry`]) and talks to the visible editor through the
//! [`EditorWidget`] trait: model swapping, view-state capture/restore, and
//! cursor/selection/scroll event registration. [`HeadlessWidget`] is the
//! crate's reference implementation and the test double.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::CursorPosition;

// ───────────────────────────────────────────────────────────────────
// Listener handles
// ───────────────────────────────────────────────────────────────────

/// Disposable guard for a registered callback.
///
/// Dropping the handle (or calling [`dispose`](Self::dispose)) unregisters
/// the callback. Handles are how the session manager tears down the listener
/// set of the previously active file in one sweep.
pub struct ListenerHandle {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    /// A handle that does nothing on drop.
    pub fn noop() -> Self {
        Self { unregister: None }
    }

    /// Unregister eagerly instead of waiting for drop.
    pub fn dispose(mut self) {
        if let Some(f) = self.unregister.take() {
            f();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister.take() {
            f();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Text models
// ───────────────────────────────────────────────────────────────────

type ModelCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A mutable in-memory text buffer backing one open file.
///
/// Seeded from the shared document's text at session-open and kept in sync
/// by the session's binding for as long as the session lives.
pub struct TextModel {
    file_id: String,
    language: String,
    value: RwLock<String>,
    version: AtomicU64,
    disposed: AtomicBool,
    listeners: Arc<Mutex<HashMap<u64, ModelCallback>>>,
    next_listener: AtomicU64,
}

impl TextModel {
    pub fn new(file_id: &str, initial: &str, language: &str) -> Arc<Self> {
        Arc::new(Self {
            file_id: file_id.to_string(),
            language: language.to_string(),
            value: RwLock::new(initial.to_string()),
            version: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn get_value(&self) -> String {
        self.value.read().unwrap().clone()
    }

    /// Replace the buffer contents, firing change listeners.
    ///
    /// No-ops when the text is unchanged or the model was disposed; returns
    /// whether the value actually changed.
    pub fn set_value(&self, text: &str) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            log::trace!("set_value on disposed model {}", self.file_id);
            return false;
        }
        {
            let mut value = self.value.write().unwrap();
            if *value == text {
                return false;
            }
            *value = text.to_string();
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        let callbacks: Vec<ModelCallback> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb(text);
        }
        true
    }

    /// Monotonic change counter, starting at 1.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mark the model disposed and drop its listeners.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.listeners.lock().unwrap().clear();
    }

    /// Register a change listener called with the new value.
    pub fn on_change(&self, cb: impl Fn(&str) + Send + Sync + 'static) -> ListenerHandle {
        if self.disposed.load(Ordering::SeqCst) {
            return ListenerHandle::noop();
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(id, Arc::new(cb));
        let listeners = Arc::clone(&self.listeners);
        ListenerHandle::new(move || {
            listeners.lock().unwrap().remove(&id);
        })
    }
}

/// The widget host's named model table.
///
/// Models persist across soft-close so a reopened tab reuses its buffer;
/// the session registry force-syncs a reused model to the shared document's
/// current text.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<TextModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live (non-disposed) model for `file_id`, if one is registered.
    pub fn get(&self, file_id: &str) -> Option<Arc<TextModel>> {
        self.models
            .read()
            .unwrap()
            .get(file_id)
            .filter(|m| !m.is_disposed())
            .cloned()
    }

    /// Reuse the live model for `file_id` or create one seeded with `initial`.
    pub fn get_or_create(&self, file_id: &str, initial: &str, language: &str) -> Arc<TextModel> {
        if let Some(model) = self.get(file_id) {
            return model;
        }
        let model = TextModel::new(file_id, initial, language);
        self.models
            .write()
            .unwrap()
            .insert(file_id.to_string(), Arc::clone(&model));
        model
    }

    /// Dispose and drop the model for `file_id`.
    pub fn remove(&self, file_id: &str) {
        if let Some(model) = self.models.write().unwrap().remove(file_id) {
            model.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().unwrap().is_empty()
    }
}

/// Map a file path to an editor language id by extension.
pub fn language_for_path(path: &str) -> &'static str {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "java" => "java",
        "json" => "json",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "sh" => "shell",
        _ => "plaintext",
    }
}

// ───────────────────────────────────────────────────────────────────
// View state and the widget trait
// ───────────────────────────────────────────────────────────────────

/// A selection range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

impl Default for Selection {
    fn default() -> Self {
        let origin = CursorPosition { line: 0, column: 0 };
        Self {
            start: origin,
            end: origin,
        }
    }
}

/// Everything the widget needs to restore "where the user was" in a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorViewState {
    pub cursor: CursorPosition,
    pub selection: Selection,
    pub scroll_top: f64,
    pub scroll_left: f64,
    /// Opaque widget-internal state (folded regions etc.), if the widget
    /// produces any.
    pub internal: Option<Vec<u8>>,
}

impl Default for EditorViewState {
    fn default() -> Self {
        Self {
            cursor: CursorPosition { line: 0, column: 0 },
            selection: Selection::default(),
            scroll_top: 0.0,
            scroll_left: 0.0,
            internal: None,
        }
    }
}

/// The consumed editor-widget collaborator.
///
/// One instance is the visible editor; more may exist for split views. The
/// session layer never assumes anything about rendering — only model
/// ownership, view-state introspection, and event registration.
pub trait EditorWidget: Send + Sync {
    /// Stable identity for set membership in a binding.
    fn id(&self) -> Uuid;

    /// The model currently loaded in this widget, if any.
    fn model(&self) -> Option<Arc<TextModel>>;

    /// Swap the loaded model.
    fn set_model(&self, model: Arc<TextModel>);

    /// Capture the current view state.
    fn view_state(&self) -> EditorViewState;

    /// Restore a previously captured view state.
    fn restore_view_state(&self, state: &EditorViewState);

    fn on_cursor_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle;
    fn on_selection_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle;
    fn on_scroll_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle;
}

type WidgetCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct WidgetListeners {
    cursor: HashMap<u64, WidgetCallback>,
    selection: HashMap<u64, WidgetCallback>,
    scroll: HashMap<u64, WidgetCallback>,
}

/// Reference [`EditorWidget`] with no rendering attached.
///
/// Used by the integration tests and by embedders that need a background
/// widget (e.g. pre-warming a file before it becomes visible).
pub struct HeadlessWidget {
    id: Uuid,
    model: RwLock<Option<Arc<TextModel>>>,
    view: RwLock<EditorViewState>,
    listeners: Arc<Mutex<WidgetListeners>>,
    next_listener: AtomicU64,
}

impl HeadlessWidget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            model: RwLock::new(None),
            view: RwLock::new(EditorViewState::default()),
            listeners: Arc::new(Mutex::new(WidgetListeners::default())),
            next_listener: AtomicU64::new(0),
        })
    }

    /// Move the cursor, firing cursor-change listeners.
    pub fn move_cursor(&self, line: u32, column: u32) {
        self.view.write().unwrap().cursor = CursorPosition { line, column };
        self.fire(|l| l.cursor.values().cloned().collect());
    }

    /// Scroll the viewport, firing scroll-change listeners.
    pub fn scroll_to(&self, top: f64, left: f64) {
        {
            let mut view = self.view.write().unwrap();
            view.scroll_top = top;
            view.scroll_left = left;
        }
        self.fire(|l| l.scroll.values().cloned().collect());
    }

    /// Change the selection, firing selection-change listeners.
    pub fn select(&self, selection: Selection) {
        self.view.write().unwrap().selection = selection;
        self.fire(|l| l.selection.values().cloned().collect());
    }

    fn fire(&self, pick: impl Fn(&WidgetListeners) -> Vec<WidgetCallback>) {
        let callbacks = pick(&self.listeners.lock().unwrap());
        for cb in callbacks {
            cb();
        }
    }

    fn register(
        &self,
        cb: Box<dyn Fn() + Send + Sync>,
        insert: impl Fn(&mut WidgetListeners, u64, WidgetCallback),
        remove: impl Fn(&mut WidgetListeners, u64) + Send + 'static,
    ) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        insert(&mut self.listeners.lock().unwrap(), id, Arc::from(cb));
        let listeners = Arc::clone(&self.listeners);
        ListenerHandle::new(move || {
            remove(&mut listeners.lock().unwrap(), id);
        })
    }
}

impl EditorWidget for HeadlessWidget {
    fn id(&self) -> Uuid {
        self.id
    }

    fn model(&self) -> Option<Arc<TextModel>> {
        self.model.read().unwrap().clone()
    }

    fn set_model(&self, model: Arc<TextModel>) {
        *self.model.write().unwrap() = Some(model);
    }

    fn view_state(&self) -> EditorViewState {
        self.view.read().unwrap().clone()
    }

    fn restore_view_state(&self, state: &EditorViewState) {
        *self.view.write().unwrap() = state.clone();
    }

    fn on_cursor_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle {
        self.register(
            cb,
            |l, id, cb| {
                l.cursor.insert(id, cb);
            },
            |l, id| {
                l.cursor.remove(&id);
            },
        )
    }

    fn on_selection_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle {
        self.register(
            cb,
            |l, id, cb| {
                l.selection.insert(id, cb);
            },
            |l, id| {
                l.selection.remove(&id);
            },
        )
    }

    fn on_scroll_change(&self, cb: Box<dyn Fn() + Send + Sync>) -> ListenerHandle {
        self.register(
            cb,
            |l, id, cb| {
                l.scroll.insert(id, cb);
            },
            |l, id| {
                l.scroll.remove(&id);
            },
        )
    }
}
