//! Extension registry and the lifecycle contract extensions implement.

pub mod endpoint;
pub mod server_ext;
pub mod table;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::event_bus::BoxFuture;

/// Hooked into a [`crate::server::Server`]'s start/shutdown lifecycle.
/// Invoked in registration order.
pub trait ServerListener: Send + Sync {
    fn on_initialized<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Register-by-type store. A later extension may [`ExtensionRegistry::get`]
/// an earlier one; duplicate registration of the same type is a
/// configuration error.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> Result<(), RegistryError> {
        let id = TypeId::of::<T>();
        if self.extensions.contains_key(&id) {
            return Err(RegistryError::Duplicate(std::any::type_name::<T>().to_owned()));
        }
        self.extensions.insert(id, value);
        Ok(())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions.get(&TypeId::of::<T>()).and_then(|value| value.clone().downcast::<T>().ok())
    }
}
