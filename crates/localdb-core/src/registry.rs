//! Authoritative in-memory map of installed engine instances.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use localdb_store::{Database, DatabaseInstance, EngineType, InstanceStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    events::{EventHub, Notification},
    CoreError,
};

/// Durable backing for registry records.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    async fn load_all(&self) -> Result<Vec<DatabaseInstance>>;
    async fn save(&self, instance: &DatabaseInstance) -> Result<()>;
    async fn remove(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
impl InstanceStore for Database {
    async fn load_all(&self) -> Result<Vec<DatabaseInstance>> {
        self.load_instances().await
    }

    async fn save(&self, instance: &DatabaseInstance) -> Result<()> {
        self.upsert_instance(instance).await
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.delete_instance(id).await.map(|_| ())
    }
}

/// Non-durable store for tests and throwaway managers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<Uuid, DatabaseInstance>>,
}

impl MemoryStore {
    pub fn with_instances(instances: impl IntoIterator<Item = DatabaseInstance>) -> Self {
        Self {
            rows: Mutex::new(instances.into_iter().map(|i| (i.id, i)).collect()),
        }
    }

    pub fn snapshot(&self) -> Vec<DatabaseInstance> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<DatabaseInstance>> {
        Ok(self.snapshot())
    }

    async fn save(&self, instance: &DatabaseInstance) -> Result<()> {
        self.rows.lock().insert(instance.id, instance.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.rows.lock().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<Uuid, DatabaseInstance>,
    busy: HashSet<Uuid>,
}

/// Lock-guarded instance map. Mutations apply in memory under the write lock
/// and are persisted afterwards, one at a time, from the latest snapshot.
pub struct InstanceRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn InstanceStore>,
    persist_lock: AsyncMutex<()>,
    events: EventHub,
}

impl InstanceRegistry {
    /// Loads persisted records. Corrupted or contradictory state fails the
    /// load instead of being discarded.
    pub async fn load(store: Arc<dyn InstanceStore>, events: EventHub) -> Result<Self, CoreError> {
        let records = store.load_all().await.map_err(CoreError::Storage)?;
        let mut instances = HashMap::with_capacity(records.len());
        let mut seen = HashSet::new();
        for record in records {
            check_pid_coupling(&record)?;
            if !seen.insert(record.engine_type) {
                return Err(CoreError::InvariantViolation(format!(
                    "persisted state holds two instances of {}",
                    record.engine_type
                )));
            }
            instances.insert(record.id, record);
        }
        debug!(count = instances.len(), "instance registry loaded");

        Ok(Self {
            state: RwLock::new(RegistryState {
                instances,
                busy: HashSet::new(),
            }),
            store,
            persist_lock: AsyncMutex::new(()),
            events,
        })
    }

    /// Snapshot of every instance ordered by creation time.
    pub fn list(&self) -> Vec<DatabaseInstance> {
        let mut instances: Vec<_> = self.state.read().instances.values().cloned().collect();
        instances.sort_by_key(|instance| instance.created_at);
        instances
    }

    pub fn get(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        self.state
            .read()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))
    }

    pub fn get_by_type(&self, engine: EngineType) -> Option<DatabaseInstance> {
        self.state
            .read()
            .instances
            .values()
            .find(|instance| instance.engine_type == engine)
            .cloned()
    }

    /// Inserts a new record or replaces the record with the same id.
    pub async fn upsert(&self, mut record: DatabaseInstance) -> Result<DatabaseInstance, CoreError> {
        check_pid_coupling(&record)?;
        let previous = {
            let mut state = self.state.write();
            if let Some(other) = state
                .instances
                .values()
                .find(|other| other.engine_type == record.engine_type && other.id != record.id)
            {
                return Err(CoreError::Conflict(format!(
                    "{} is already installed as instance {}",
                    record.engine_type, other.id
                )));
            }
            if let Some(existing) = state.instances.get(&record.id) {
                if existing.engine_type != record.engine_type {
                    return Err(CoreError::InvariantViolation(format!(
                        "instance {} cannot change engine type from {} to {}",
                        record.id, existing.engine_type, record.engine_type
                    )));
                }
                record.created_at = existing.created_at;
            }
            record.updated_at = Utc::now();
            state.instances.insert(record.id, record.clone())
        };
        self.persist(record.id, previous).await?;
        Ok(record)
    }

    pub async fn remove(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let removed = self
            .state
            .write()
            .instances
            .remove(&id)
            .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))?;
        self.persist(id, Some(removed.clone())).await?;
        Ok(removed)
    }

    /// Sets status and pid together. A pid must accompany `Running` and only
    /// `Running`; `NotInstalled` is never assigned to a record.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        pid: Option<u32>,
    ) -> Result<DatabaseInstance, CoreError> {
        self.transition(id, None, status, pid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))
    }

    /// Like [`set_status`](Self::set_status) but only applies while the
    /// record still carries `expected_pid`. Returns `None` when the record
    /// moved on in the meantime.
    pub async fn set_status_if(
        &self,
        id: Uuid,
        expected_pid: Option<u32>,
        status: InstanceStatus,
        pid: Option<u32>,
    ) -> Result<Option<DatabaseInstance>, CoreError> {
        self.transition(id, Some(expected_pid), status, pid).await
    }

    async fn transition(
        &self,
        id: Uuid,
        expected_pid: Option<Option<u32>>,
        status: InstanceStatus,
        pid: Option<u32>,
    ) -> Result<Option<DatabaseInstance>, CoreError> {
        let valid = match status {
            InstanceStatus::Running => pid.is_some(),
            InstanceStatus::Stopped => pid.is_none(),
            InstanceStatus::NotInstalled => false,
        };
        if !valid {
            let err = CoreError::InvariantViolation(format!(
                "cannot set instance {id} to {status} with pid {pid:?}"
            ));
            error!(instance_id = %id, error = %err, "rejected status transition");
            return Err(err);
        }

        let (previous, updated) = {
            let mut state = self.state.write();
            let Some(record) = state.instances.get_mut(&id) else {
                return match expected_pid {
                    Some(_) => Ok(None),
                    None => Err(CoreError::NotFound(format!("instance {id}"))),
                };
            };
            if let Some(expected) = expected_pid {
                if record.pid != expected {
                    return Ok(None);
                }
            }
            if record.status == status && record.pid == pid {
                return Ok(Some(record.clone()));
            }
            let previous = record.clone();
            record.status = status;
            record.pid = pid;
            record.updated_at = Utc::now();
            (previous, record.clone())
        };
        self.persist(id, Some(previous)).await?;
        Ok(Some(updated))
    }

    pub async fn set_auto_start(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<DatabaseInstance, CoreError> {
        let (previous, updated) = {
            let mut state = self.state.write();
            let record = state
                .instances
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))?;
            if record.auto_start == enabled {
                return Ok(record.clone());
            }
            let previous = record.clone();
            record.auto_start = enabled;
            record.updated_at = Utc::now();
            (previous, record.clone())
        };
        self.persist(id, Some(previous)).await?;
        Ok(updated)
    }

    /// Marks the instance as having a lifecycle operation in flight. The
    /// claim is released when the guard drops; a second claim on the same
    /// instance is a conflict.
    pub fn claim(&self, id: Uuid) -> Result<OperationGuard<'_>, CoreError> {
        let mut state = self.state.write();
        if !state.instances.contains_key(&id) {
            return Err(CoreError::NotFound(format!("instance {id}")));
        }
        if !state.busy.insert(id) {
            return Err(CoreError::Conflict(format!(
                "an operation is already in progress for instance {id}"
            )));
        }
        Ok(OperationGuard { registry: self, id })
    }

    /// Publishes the current instance list to subscribers.
    pub fn notify(&self) {
        self.events
            .publish(Notification::InstancesUpdated(self.list()));
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Writes the current state of `id` to the store. When the write fails
    /// the in-memory record reverts to `previous`, unless another mutation
    /// replaced it in the meantime.
    async fn persist(
        &self,
        id: Uuid,
        previous: Option<DatabaseInstance>,
    ) -> Result<(), CoreError> {
        let _serialized = self.persist_lock.lock().await;
        let current = self.state.read().instances.get(&id).cloned();
        let result = match current.as_ref() {
            Some(record) => self.store.save(record).await,
            None => self.store.remove(id).await,
        };
        let Err(err) = result else {
            return Ok(());
        };

        error!(instance_id = %id, error = %format!("{err:#}"), "failed to persist instance");
        let mut state = self.state.write();
        if state.instances.get(&id) == current.as_ref() {
            match previous {
                Some(record) => {
                    state.instances.insert(id, record);
                }
                None => {
                    state.instances.remove(&id);
                }
            }
        }
        Err(CoreError::Storage(err))
    }
}

/// Releases an in-flight claim on drop.
pub struct OperationGuard<'a> {
    registry: &'a InstanceRegistry,
    id: Uuid,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.registry.state.write().busy.remove(&self.id);
    }
}

fn check_pid_coupling(record: &DatabaseInstance) -> Result<(), CoreError> {
    let valid = match record.status {
        InstanceStatus::Running => record.pid.is_some(),
        InstanceStatus::Stopped => record.pid.is_none(),
        InstanceStatus::NotInstalled => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvariantViolation(format!(
            "instance {} has status {} with pid {:?}",
            record.id, record.status, record.pid
        )))
    }
}
