//! Static brick-kind registry (spec.md §9: "register brick kinds at compile
//! time through a builder/registry pattern keyed by name" — no `dlopen`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::brick::{Brick, BrickInstance};
use crate::error::KfsError;

pub type Constructor =
    fn(&ini::Properties, &str, Vec<BrickInstance>) -> Result<Arc<dyn Brick>, KfsError>;

pub struct BrickRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl BrickRegistry {
    pub fn new() -> Self {
        BrickRegistry {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, ctor: Constructor) {
        self.constructors.insert(kind, ctor);
    }

    pub fn construct(
        &self,
        kind: &str,
        section: &ini::Properties,
        name: &str,
        subvolumes: Vec<BrickInstance>,
    ) -> Result<Arc<dyn Brick>, KfsError> {
        let ctor = self
            .constructors
            .get(kind)
            .ok_or_else(|| KfsError::UnsupportedKind(kind.to_string()))?;
        ctor(section, name, subvolumes)
    }
}

impl Default for BrickRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry wired with every brick kind this crate ships.
pub fn default_registry() -> BrickRegistry {
    let mut registry = BrickRegistry::new();
    registry.register("pass", crate::bricks::passthrough::init);
    registry.register("posix", crate::bricks::posix::init);
    registry.register("tcp", crate::bricks::tcp::init);
    registry.register("cache", crate::bricks::cache::init);
    registry.register("mirror", crate::bricks::mirror::init);
    registry
}
