//! Active-file reconciliation for the visible editor widget.
//!
//! Only one file is actively edited at a time even though several are open
//! as tabs. [`EditorSessionManager`] is the single authority reconciling
//! "the visible widget" with "the active file's session": on every
//! active-file change it tears down the previous file's listeners, saves
//! its view state, swaps the widget onto the new session's model, attaches
//! it to the binding, updates the awareness active-file field, and restores
//! the saved view state once the model swap has settled.
//!
//! Attachment failures here are swallowed, not thrown — by the time a model
//! turns out to be disposed the user has already navigated somewhere else,
//! and the transition that superseded this one owns the widget now.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::editor::{EditorWidget, ListenerHandle};
use crate::session::SessionRegistry;
use crate::storage::ViewStateStore;

/// Delay between attaching a widget and restoring its saved view state,
/// letting the model swap settle first.
pub const RESTORE_SETTLE: Duration = Duration::from_millis(50);

struct ManagerState {
    active_file: Option<String>,
    widget: Option<Arc<dyn EditorWidget>>,
    /// Listener handles for the currently active file, dropped wholesale at
    /// the next transition.
    listeners: Vec<ListenerHandle>,
}

/// Reconciles the visible widget with the active file's session.
pub struct EditorSessionManager {
    registry: Arc<SessionRegistry>,
    store: Arc<ViewStateStore>,
    restore_delay: Duration,
    state: Mutex<ManagerState>,
}

impl EditorSessionManager {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<ViewStateStore>) -> Arc<Self> {
        Self::with_restore_delay(registry, store, RESTORE_SETTLE)
    }

    pub fn with_restore_delay(
        registry: Arc<SessionRegistry>,
        store: Arc<ViewStateStore>,
        restore_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            restore_delay,
            state: Mutex::new(ManagerState {
                active_file: None,
                widget: None,
                listeners: Vec::new(),
            }),
        })
    }

    pub fn active_file(&self) -> Option<String> {
        self.state.lock().unwrap().active_file.clone()
    }

    /// Drive the active-file transition.
    ///
    /// `file_id: None` or `widget: None` parks the manager idle after
    /// saving the previous file's view state. A missing session for the new
    /// file is a legitimate transient (its open has not completed yet) and
    /// stops the transition without error; the UI re-invokes once the
    /// session lands.
    pub fn set_active_file(
        &self,
        project_id: &str,
        file_id: Option<&str>,
        widget: Option<Arc<dyn EditorWidget>>,
    ) {
        // Previous file's listeners go first, in one sweep.
        let (previous_file, previous_widget) = {
            let mut state = self.state.lock().unwrap();
            state.listeners.clear();
            (state.active_file.take(), state.widget.take())
        };

        // Save the old view state and detach the widget from the old
        // session, but only on an actual file change.
        if let (Some(old_file), Some(old_widget)) = (&previous_file, &previous_widget) {
            if file_id != Some(old_file.as_str()) {
                let view = old_widget.view_state();
                if let Err(e) = self.store.save(project_id, old_file, &view) {
                    log::warn!("failed to save view state for {old_file}: {e}");
                }
                self.registry
                    .disconnect_editor_from_session(old_file, old_widget.id());
            }
        }

        let (Some(file_id), Some(widget)) = (file_id, widget) else {
            return; // idle
        };

        {
            let mut state = self.state.lock().unwrap();
            state.active_file = Some(file_id.to_string());
            state.widget = Some(Arc::clone(&widget));
        }

        let Some(record) = self.registry.session(file_id) else {
            // Session still opening — the next transition picks it up.
            log::trace!("no session yet for {file_id}, deferring attach");
            return;
        };

        // Swap the session's model in, guarding against it having been
        // disposed concurrently. That is a non-fatal abort, not an error.
        let needs_swap = match widget.model() {
            Some(current) => !Arc::ptr_eq(&current, &record.model),
            None => true,
        };
        if needs_swap {
            if record.model.is_disposed() {
                log::warn!("model for {file_id} disposed mid-switch, aborting attach");
                return;
            }
            widget.set_model(Arc::clone(&record.model));
        }

        self.registry
            .connect_editor_to_session(file_id, Arc::clone(&widget));

        // Peers see which file this client is viewing.
        record
            .connection
            .awareness()
            .set_active_file(Some(file_id.to_string()));

        // Restore the saved view state after the swap settles, unless yet
        // another switch replaced the model in the meantime.
        {
            let store = Arc::clone(&self.store);
            let expected_model = Arc::clone(&record.model);
            let restore_widget = Arc::clone(&widget);
            let project = project_id.to_string();
            let file = file_id.to_string();
            let delay = self.restore_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let still_expected = restore_widget
                    .model()
                    .map(|m| Arc::ptr_eq(&m, &expected_model))
                    .unwrap_or(false);
                if !still_expected {
                    return;
                }
                match store.load(&project, &file) {
                    Ok(Some(saved)) => restore_widget.restore_view_state(&saved.view),
                    Ok(None) => {}
                    Err(e) => log::warn!("failed to load view state for {file}: {e}"),
                }
            });
        }

        // Fresh listeners keep the view state current until the next
        // transition tears them down.
        let save: Arc<dyn Fn() + Send + Sync> = {
            let store = Arc::clone(&self.store);
            let save_widget = Arc::clone(&widget);
            let project = project_id.to_string();
            let file = file_id.to_string();
            Arc::new(move || {
                let view = save_widget.view_state();
                if let Err(e) = store.save(&project, &file, &view) {
                    log::warn!("failed to save view state for {file}: {e}");
                }
            })
        };
        let on_cursor = Arc::clone(&save);
        let on_selection = Arc::clone(&save);
        let on_scroll = save;
        let listeners = vec![
            widget.on_cursor_change(Box::new(move || (*on_cursor)())),
            widget.on_selection_change(Box::new(move || (*on_selection)())),
            widget.on_scroll_change(Box::new(move || (*on_scroll)())),
        ];
        self.state.lock().unwrap().listeners = listeners;
    }

    /// Park the manager idle, saving the active file's view state.
    pub fn detach(&self, project_id: &str) {
        self.set_active_file(project_id, None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::UserInfo;
    use crate::editor::{HeadlessWidget, ModelRegistry};
    use crate::pool::{DocPool, PoolConfig};
    use crate::session::SessionMetadata;
    use crate::storage::ViewStateConfig;

    fn test_user() -> UserInfo {
        UserInfo {
            name: "Alice".into(),
            color: "ff8800".into(),
            email: "alice@example.com".into(),
        }
    }

    fn metadata(id: &str) -> SessionMetadata {
        SessionMetadata {
            id: id.into(),
            filepath: format!("src/{id}.rs"),
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        manager: Arc<EditorSessionManager>,
        store: Arc<ViewStateStore>,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        let registry = SessionRegistry::new(pool, Arc::new(ModelRegistry::new()));
        let store =
            Arc::new(ViewStateStore::open(ViewStateConfig::for_testing(dir.path())).unwrap());
        let manager = EditorSessionManager::with_restore_delay(
            Arc::clone(&registry),
            Arc::clone(&store),
            Duration::from_millis(10),
        );
        for file in ["f1", "f2"] {
            registry
                .open_session("p1", &metadata(file), &test_user())
                .await
                .unwrap();
        }
        Fixture {
            registry,
            manager,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_activation_attaches_widget_and_model() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));

        let record = fx.registry.session("f1").unwrap();
        assert!(Arc::ptr_eq(&widget.model().unwrap(), &record.model));
        let binding = record.binding.expect("binding constructed on attach");
        assert!(binding.has_editor(widget.id()));
        assert_eq!(fx.manager.active_file().as_deref(), Some("f1"));

        // Peers see the active file.
        let awareness = record.connection.awareness();
        assert_eq!(
            awareness.local_state().unwrap().active_file.as_deref(),
            Some("f1")
        );
    }

    #[tokio::test]
    async fn test_switch_saves_and_restores_view_state() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        widget.scroll_to(42.0, 0.0);

        fx.manager.set_active_file("p1", Some("f2"), Some(widget.clone()));
        assert_eq!(
            fx.store.load("p1", "f1").unwrap().unwrap().view.scroll_top,
            42.0
        );
        widget.scroll_to(7.0, 0.0);

        // Back to f1: scroll position comes back after the settle delay.
        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(widget.view_state().scroll_top, 42.0);
    }

    #[tokio::test]
    async fn test_listeners_resave_view_state() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();
        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));

        widget.move_cursor(5, 2);
        let saved = fx.store.load("p1", "f1").unwrap().unwrap();
        assert_eq!(saved.view.cursor.line, 5);
        assert_eq!(saved.view.cursor.column, 2);

        widget.scroll_to(13.0, 0.0);
        let saved = fx.store.load("p1", "f1").unwrap().unwrap();
        assert_eq!(saved.view.scroll_top, 13.0);
    }

    #[tokio::test]
    async fn test_listeners_torn_down_on_transition() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        fx.manager.set_active_file("p1", Some("f2"), Some(widget.clone()));

        // Cursor movement now saves under f2, leaving f1's record alone.
        widget.move_cursor(9, 9);
        assert_eq!(fx.store.load("p1", "f2").unwrap().unwrap().view.cursor.line, 9);
        let f1_saved = fx.store.load("p1", "f1").unwrap().unwrap();
        assert_ne!(f1_saved.view.cursor.line, 9);
    }

    #[tokio::test]
    async fn test_missing_session_is_transient_not_error() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager
            .set_active_file("p1", Some("not-open"), Some(widget.clone()));
        assert!(widget.model().is_none());
        // The manager still tracks the intent.
        assert_eq!(fx.manager.active_file().as_deref(), Some("not-open"));
    }

    #[tokio::test]
    async fn test_disposed_model_aborts_softly() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.registry.session("f1").unwrap().model.dispose();
        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        assert!(widget.model().is_none()); // aborted, not panicked
    }

    #[tokio::test]
    async fn test_detach_parks_idle() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        fx.manager.detach("p1");
        assert!(fx.manager.active_file().is_none());
    }

    #[tokio::test]
    async fn test_detach_detaches_widget_from_binding() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        let binding = fx.registry.session("f1").unwrap().binding.unwrap();
        assert_eq!(binding.editor_count(), 1);

        fx.manager.detach("p1");
        assert_eq!(binding.editor_count(), 0);
        assert!(!binding.is_destroyed()); // background sync continues
    }

    #[tokio::test]
    async fn test_stale_restore_skipped_after_further_switch() {
        let fx = setup().await;
        let widget = HeadlessWidget::new();

        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        widget.scroll_to(42.0, 0.0);

        // Switch to f2 and immediately back: the f2 restore fires after the
        // widget already moved on and must not clobber f1's state.
        fx.manager.set_active_file("p1", Some("f2"), Some(widget.clone()));
        fx.manager.set_active_file("p1", Some("f1"), Some(widget.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(widget.view_state().scroll_top, 42.0);
    }
}
