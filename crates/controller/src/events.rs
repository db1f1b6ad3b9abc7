//! Domain events collected while a mutation runs and dispatched to the
//! registered handlers once its transaction committed.

use std::sync::{Arc, Mutex, RwLock};

use common::api::ConfigStatus;
use futures_util::future::BoxFuture;
use metrics::counter;
use tracing::{info, warn};
use uuid::Uuid;

/// What caused a config's compiled output to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedAction {
    /// Local config, context or backend edit.
    ConfigChanged,
    /// Content of an attached template changed.
    RelatedTemplateChanged,
    /// Templates were attached or detached.
    TemplatesChanged,
}

impl ModifiedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifiedAction::ConfigChanged => "config_changed",
            ModifiedAction::RelatedTemplateChanged => "related_template_changed",
            ModifiedAction::TemplatesChanged => "m2m_templates_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    StatusChanged {
        config_id: Uuid,
        device_id: Uuid,
        previous_status: ConfigStatus,
        status: ConfigStatus,
    },
    ConfigModified {
        config_id: Uuid,
        device_id: Uuid,
        previous_status: ConfigStatus,
        action: ModifiedAction,
    },
    BackendChanged {
        config_id: Uuid,
        device_id: Uuid,
        old_backend: String,
        new_backend: String,
    },
    VpnServerModified {
        vpn_id: Uuid,
    },
    DeviceRegistered {
        device_id: Uuid,
        is_new: bool,
    },
    ChecksumRequested {
        device_id: Uuid,
    },
    ConfigDownloadRequested {
        device_id: Uuid,
    },
    VpnChecksumRequested {
        vpn_id: Uuid,
    },
    VpnConfigDownloadRequested {
        vpn_id: Uuid,
    },
}

impl ConfigEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigEvent::StatusChanged { .. } => "config_status_changed",
            ConfigEvent::ConfigModified { .. } => "config_modified",
            ConfigEvent::BackendChanged { .. } => "config_backend_changed",
            ConfigEvent::VpnServerModified { .. } => "vpn_server_modified",
            ConfigEvent::DeviceRegistered { .. } => "device_registered",
            ConfigEvent::ChecksumRequested { .. } => "checksum_requested",
            ConfigEvent::ConfigDownloadRequested { .. } => "config_download_requested",
            ConfigEvent::VpnChecksumRequested { .. } => "vpn_checksum_requested",
            ConfigEvent::VpnConfigDownloadRequested { .. } => "vpn_config_download_requested",
        }
    }
}

/// Receiver of dispatched events.
pub trait EventHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, event: &'a ConfigEvent) -> BoxFuture<'a, crate::Result<()>>;
}

/// Logs every event and counts it per kind.
pub struct TracingEventHandler;

impl EventHandler for TracingEventHandler {
    fn handle<'a>(&'a self, event: &'a ConfigEvent) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            counter!("devconf_events_total", "event" => event.name()).increment(1);
            match event {
                ConfigEvent::StatusChanged {
                    config_id,
                    previous_status,
                    status,
                    ..
                } => info!(%config_id, %previous_status, %status, "config status changed"),
                ConfigEvent::ConfigModified {
                    config_id,
                    previous_status,
                    action,
                    ..
                } => info!(
                    %config_id,
                    %previous_status,
                    action = action.as_str(),
                    "config modified"
                ),
                ConfigEvent::BackendChanged {
                    config_id,
                    old_backend,
                    new_backend,
                    ..
                } => info!(%config_id, old_backend, new_backend, "config backend changed"),
                ConfigEvent::DeviceRegistered { device_id, is_new } => {
                    info!(%device_id, is_new, "device registered")
                }
                other => tracing::debug!(event = other.name(), ?other, "config event"),
            }
            Ok(())
        })
    }
}

/// Keeps dispatched events in memory.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<Vec<ConfigEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ConfigEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventHandler for MemoryEventLog {
    fn handle<'a>(&'a self, event: &'a ConfigEvent) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            self.events
                .lock()
                .map_err(|_| anyhow::anyhow!("event log mutex poisoned"))?
                .push(event.clone());
            Ok(())
        })
    }
}

/// Events gathered during one mutation.
#[derive(Debug, Default)]
pub struct PendingEvents(Vec<ConfigEvent>);

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ConfigEvent) {
        self.0.push(event);
    }

    pub fn extend(&mut self, other: PendingEvents) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[ConfigEvent] {
        &self.0
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Arc<dyn EventHandler>) -> Self {
        let bus = Self::new();
        bus.subscribe(handler);
        bus
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    /// Deliver events in order; a failing handler is logged and skipped.
    pub async fn dispatch(&self, events: PendingEvents) {
        if events.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .map(|handlers| handlers.clone())
            .unwrap_or_default();
        for event in &events.0 {
            for handler in &handlers {
                if let Err(err) = handler.handle(event).await {
                    warn!(?err, event = event.name(), "event handler failed");
                }
            }
        }
    }

    pub async fn emit(&self, event: ConfigEvent) {
        let mut pending = PendingEvents::new();
        pending.push(event);
        self.dispatch(pending).await;
    }
}
