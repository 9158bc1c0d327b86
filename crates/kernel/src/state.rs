//! Kernel root — constructs every service once for a workspace and owns
//! them for the life of the process. No module-level singletons; everything
//! is passed by reference from here.

use std::sync::Arc;

use orchard_domain::config::Config;
use orchard_domain::event::StoredEvent;
use orchard_domain::ui::UiEvent;
use orchard_domain::Result;
use orchard_store::{AuditLog, ConversationLog, EventLog, Logs, ProjectionStore};
use orchard_tools::{ToolExecutor, ToolRegistry};

use crate::cancel::CancelMap;
use crate::conversation::ConversationManager;
use crate::manager::RuntimeManager;
use crate::output::OutputHandler;
use crate::projection::TaskProjection;
use crate::runtime::RuntimeDeps;
use crate::service::TaskService;
use crate::subtask::{CreateSubtasksTool, ListSubtaskTool, SubtaskPorts};
use crate::ui::UiBus;

pub struct Kernel {
    pub config: Arc<Config>,
    pub events: Arc<EventLog>,
    pub conversations: Arc<ConversationLog>,
    pub audit: Arc<AuditLog>,
    pub snapshots: Arc<ProjectionStore>,
    pub projection: Arc<TaskProjection>,
    pub service: Arc<TaskService>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub conversation: Arc<ConversationManager>,
    pub handler: Arc<OutputHandler>,
    pub cancel_map: Arc<CancelMap>,
    pub manager: Arc<RuntimeManager>,
    pub ui: UiBus,
    audit_forwarder: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    /// Open a workspace: load the logs, replay the projection, and wire the
    /// services together. Agents are registered afterwards; call
    /// [`Kernel::start`] to begin processing events.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let logs = Logs::open(&config.workspace.data_dir)?;

        let projection = Arc::new(TaskProjection::new());
        projection.replay(&logs.events);

        let service = Arc::new(TaskService::new(logs.events.clone(), projection.clone()));

        let registry = Arc::new(ToolRegistry::new());
        let executor = Arc::new(ToolExecutor::new(registry.clone(), logs.audit.clone()));
        let conversation = Arc::new(ConversationManager::new(
            logs.conversations.clone(),
            executor.clone(),
        ));

        let ui = UiBus::new();
        let handler = Arc::new(OutputHandler::new(
            conversation.clone(),
            executor.clone(),
            ui.clone(),
            config.clone(),
        ));

        let cancel_map = Arc::new(CancelMap::new());
        let deps = Arc::new(RuntimeDeps {
            config: config.clone(),
            events: logs.events.clone(),
            projection: projection.clone(),
            service: service.clone(),
            conversation: conversation.clone(),
            handler: handler.clone(),
            registry: registry.clone(),
            cancel_map: cancel_map.clone(),
            ui: ui.clone(),
        });
        let manager = Arc::new(RuntimeManager::new(deps));

        let kernel = Arc::new(Self {
            config,
            events: logs.events,
            conversations: logs.conversations,
            audit: logs.audit,
            snapshots: logs.snapshots,
            projection,
            service,
            registry,
            executor,
            conversation,
            handler,
            cancel_map,
            manager,
            ui,
            audit_forwarder: parking_lot::Mutex::new(None),
        });

        kernel.register_subtask_tools()?;
        Ok(kernel)
    }

    fn register_subtask_tools(self: &Arc<Self>) -> Result<()> {
        let ports = Arc::new(SubtaskPorts {
            config: self.config.clone(),
            events: self.events.clone(),
            conversations: self.conversations.clone(),
            projection: self.projection.clone(),
            service: self.service.clone(),
            cancel_map: self.cancel_map.clone(),
            manager: Arc::downgrade(&self.manager),
        });
        self.registry
            .register(Arc::new(CreateSubtasksTool::new(ports.clone())))?;
        self.registry
            .register(Arc::new(ListSubtaskTool::new(ports)))?;
        Ok(())
    }

    /// Start the runtime fan-out and the audit→UI forwarder.
    pub fn start(self: &Arc<Self>) {
        self.manager.start();

        let mut forwarder = self.audit_forwarder.lock();
        if forwarder.is_none() {
            let mut rx = self.audit.subscribe();
            let ui = self.ui.clone();
            *forwarder = Some(tokio::spawn(async move {
                while let Some(entry) = rx.recv().await {
                    ui.send(UiEvent::AuditEntry {
                        entry: (*entry).clone(),
                    });
                }
            }));
        }
    }

    /// Stop processing, persist the projection snapshot.
    pub fn shutdown(&self) {
        self.manager.stop();
        if let Some(handle) = self.audit_forwarder.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.projection.save_snapshot(&self.snapshots) {
            tracing::warn!(error = %e, "failed to save projection snapshot");
        }
    }

    // ── Subscription ports ──────────────────────────────────────────

    /// `events$` — every domain event, in append order, from now on.
    pub fn subscribe_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<Arc<StoredEvent>> {
        self.events.subscribe()
    }

    /// `ui$` — hot UI events; slow consumers lag and lose.
    pub fn subscribe_ui(&self) -> tokio::sync::broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }
}
