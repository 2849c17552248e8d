//! Dynamic set of stream supervisors keyed by id.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broadcast::Broadcaster;
use crate::error::RegistryError;
use crate::ingest::Locator;
use crate::supervisor::{
    Collaborators, StreamConfig, StreamState, StreamSupervisor, SupervisorSettings,
};

/// Request to add a stream.
#[derive(Clone, Debug, Default)]
pub struct NewStream {
    pub locator: String,
    /// Defaults to `Camera <n>`.
    pub name: Option<String>,
}

impl NewStream {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            name: None,
        }
    }

    pub fn named(locator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            name: Some(name.into()),
        }
    }
}

struct Table {
    next_id: u64,
    streams: Vec<Arc<StreamSupervisor>>,
}

pub struct StreamRegistry {
    deps: Collaborators,
    settings: SupervisorSettings,
    table: Mutex<Table>,
}

impl StreamRegistry {
    pub fn new(deps: Collaborators, settings: SupervisorSettings) -> Self {
        Self {
            deps,
            settings,
            table: Mutex::new(Table {
                next_id: 1,
                streams: Vec::new(),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.deps.broadcaster
    }

    /// Validate, assign an id, and start a supervisor for `request`.
    pub fn add_stream(&self, request: NewStream) -> Result<String, RegistryError> {
        let locator = Locator::parse(&request.locator)?;

        let mut table = self.table();
        let n = table.next_id;
        table.next_id += 1;

        let name = request
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Camera {}", n));
        let config = StreamConfig {
            id: format!("cam_{}", n),
            locator,
            name,
        };
        let supervisor = Arc::new(StreamSupervisor::new(
            config.clone(),
            self.settings.clone(),
            self.deps.clone(),
        ));
        supervisor.start()?;
        table.streams.push(supervisor);

        log::info!(
            "added stream {}: {} ({})",
            config.id,
            config.name,
            config.locator
        );
        Ok(config.id)
    }

    /// Remove and stop a stream. The stop wait happens outside the table lock.
    pub fn remove_stream(&self, id: &str) -> Result<(), RegistryError> {
        let supervisor = {
            let mut table = self.table();
            let index = table
                .streams
                .iter()
                .position(|s| s.id() == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            table.streams.remove(index)
        };
        supervisor.stop();
        log::info!("removed stream {}", id);
        Ok(())
    }

    /// Snapshots of every stream in insertion order.
    pub fn list_streams(&self) -> Vec<StreamState> {
        self.supervisors().iter().map(|s| s.snapshot()).collect()
    }

    pub fn stream(&self, id: &str) -> Result<StreamState, RegistryError> {
        Ok(self.find(id)?.snapshot())
    }

    /// Broadcast the stream's last frame again. False when none was captured yet.
    pub fn request_frame(&self, id: &str) -> Result<bool, RegistryError> {
        Ok(self.find(id)?.republish_last_frame())
    }

    /// Stop and remove every stream.
    pub fn shutdown(&self) {
        let drained = std::mem::take(&mut self.table().streams);
        if drained.is_empty() {
            return;
        }
        log::info!("stopping {} streams", drained.len());
        for supervisor in drained {
            supervisor.stop();
        }
    }

    fn find(&self, id: &str) -> Result<Arc<StreamSupervisor>, RegistryError> {
        self.table()
            .streams
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn supervisors(&self) -> Vec<Arc<StreamSupervisor>> {
        self.table().streams.clone()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
