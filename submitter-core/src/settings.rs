//! Operational settings: maintenance gate and explicit merge of partial updates.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use submitter_types::{Settings, SettingsUpdate};

use crate::error::SettingsError;

/// Read-only view of the flags the core consults at admission time
pub trait SettingsGate: Send + Sync {
    fn is_maintenance_mode(&self) -> bool;
}

/// Persistent home of the settings record
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, SettingsError>;
    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Apply a partial update over the current settings.
///
/// - `maintenance_mode`: overwritten only when present
/// - `paused_since`: overwritten only when present; an explicit null clears it
pub fn merge(current: &Settings, update: &SettingsUpdate) -> Settings {
    Settings {
        maintenance_mode: update.maintenance_mode.unwrap_or(current.maintenance_mode),
        paused_since: match update.paused_since {
            Some(value) => value,
            None => current.paused_since,
        },
    }
}

/// Settings kept in process memory only
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.settings.read().clone())
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        *self.settings.write() = settings.clone();
        Ok(())
    }
}

/// Cached settings in front of a store. Reads hit the cache; updates go
/// through the store first and are serialized, so concurrent partial
/// updates never overwrite each other.
pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    cached: RwLock<Settings>,
    /// Held across load, merge and save
    updating: Mutex<()>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>) -> Result<Self, SettingsError> {
        let cached = store.load()?;
        if cached.maintenance_mode {
            log::warn!("[SETTINGS] Starting with maintenance mode enabled");
        }
        Ok(Self {
            store,
            cached: RwLock::new(cached),
            updating: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemorySettingsStore::default()),
            cached: RwLock::new(Settings::default()),
            updating: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Settings {
        self.cached.read().clone()
    }

    /// Merge `update` over the stored settings, persist, and refresh the cache
    pub fn apply(&self, update: &SettingsUpdate) -> Result<Settings, SettingsError> {
        let _updating = self.updating.lock();
        let current = self.store.load()?;
        let merged = merge(&current, update);
        self.store.save(&merged)?;

        if current.maintenance_mode != merged.maintenance_mode {
            if merged.maintenance_mode {
                log::warn!("[SETTINGS] Maintenance mode enabled; new jobs will be refused");
            } else {
                log::warn!("[SETTINGS] Maintenance mode disabled; accepting jobs again");
            }
        }

        *self.cached.write() = merged.clone();
        Ok(merged)
    }

    pub fn set_maintenance_mode(&self, enabled: bool) -> Result<Settings, SettingsError> {
        self.apply(&SettingsUpdate {
            maintenance_mode: Some(enabled),
            ..SettingsUpdate::default()
        })
    }
}

impl SettingsGate for SettingsService {
    fn is_maintenance_mode(&self) -> bool {
        self.cached.read().maintenance_mode
    }
}
