//! Servant registry: identity to servant, plus per-category defaults.
//!
//! Every operation takes the registry lock first and then checks the adapter
//! state, so nothing can be added to or found in a destroyed adapter. Removed
//! servants are handed back to the caller and dropped after both locks are
//! released, which lets a servant's `Drop` call back into its own adapter.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::adapter::StateCell;
use crate::error::{MiddlewareError, Result};
use crate::servant::Servant;

/// Contents of the registry, taken out wholesale at cleanup.
#[derive(Default)]
pub(crate) struct ServantMaps {
    servants: HashMap<String, Arc<dyn Servant>>,
    defaults: HashMap<String, Arc<dyn Servant>>,
}

impl ServantMaps {
    pub(crate) fn len(&self) -> usize {
        self.servants.len() + self.defaults.len()
    }
}

pub(crate) struct ServantRegistry {
    adapter: String,
    maps: RwLock<ServantMaps>,
}

impl ServantRegistry {
    pub(crate) fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            maps: RwLock::new(ServantMaps::default()),
        }
    }

    // Servant destructors never run while these guards are held, so a
    // poisoned lock still protects consistent maps.
    fn read(&self) -> RwLockReadGuard<'_, ServantMaps> {
        self.maps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServantMaps> {
        self.maps.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, state: &StateCell, id: &str, servant: Arc<dyn Servant>) -> Result<()> {
        let mut maps = self.write();
        state.ensure_usable("add()")?;
        if id.is_empty() {
            return Err(MiddlewareError::invalid_argument(format!(
                "add(): invalid empty id (adapter: {})",
                self.adapter
            )));
        }
        if maps.servants.contains_key(id) {
            return Err(MiddlewareError::AlreadyInUse {
                message: format!(
                    "add(): cannot add id \"{}\": id already in use (adapter: {})",
                    id, self.adapter
                ),
            });
        }
        maps.servants.insert(id.to_string(), servant);
        Ok(())
    }

    pub(crate) fn remove(&self, state: &StateCell, id: &str) -> Result<Arc<dyn Servant>> {
        let mut maps = self.write();
        state.ensure_usable("remove()")?;
        maps.servants.remove(id).ok_or_else(|| MiddlewareError::NotFound {
            message: format!(
                "remove(): cannot remove id \"{}\": id not present (adapter: {})",
                id, self.adapter
            ),
        })
    }

    pub(crate) fn find(&self, state: &StateCell, id: &str) -> Result<Option<Arc<dyn Servant>>> {
        let maps = self.read();
        state.ensure_usable("find()")?;
        Ok(maps.servants.get(id).cloned())
    }

    pub(crate) fn add_default(&self, state: &StateCell, category: &str, servant: Arc<dyn Servant>) -> Result<()> {
        let mut maps = self.write();
        state.ensure_usable("add_default()")?;
        if maps.defaults.contains_key(category) {
            return Err(MiddlewareError::AlreadyInUse {
                message: format!(
                    "add_default(): cannot add category \"{}\": category already in use (adapter: {})",
                    category, self.adapter
                ),
            });
        }
        maps.defaults.insert(category.to_string(), servant);
        Ok(())
    }

    pub(crate) fn remove_default(&self, state: &StateCell, category: &str) -> Result<Arc<dyn Servant>> {
        let mut maps = self.write();
        state.ensure_usable("remove_default()")?;
        maps.defaults.remove(category).ok_or_else(|| MiddlewareError::NotFound {
            message: format!(
                "remove_default(): cannot remove category \"{}\": category not present (adapter: {})",
                category, self.adapter
            ),
        })
    }

    pub(crate) fn find_default(&self, state: &StateCell, category: &str) -> Result<Option<Arc<dyn Servant>>> {
        let maps = self.read();
        state.ensure_usable("find_default()")?;
        Ok(maps.defaults.get(category).cloned())
    }

    /// Look up by identity, falling back to the category's default servant.
    pub(crate) fn find_servant(
        &self,
        state: &StateCell,
        id: &str,
        category: &str,
    ) -> Result<Option<Arc<dyn Servant>>> {
        let maps = self.read();
        state.ensure_usable("find_servant()")?;
        Ok(maps
            .servants
            .get(id)
            .or_else(|| maps.defaults.get(category))
            .cloned())
    }

    pub(crate) fn has_defaults(&self) -> bool {
        !self.read().defaults.is_empty()
    }

    /// Empty the registry. The caller drops the result outside the lock.
    pub(crate) fn take_all(&self) -> ServantMaps {
        std::mem::take(&mut *self.write())
    }
}
