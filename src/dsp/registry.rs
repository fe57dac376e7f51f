//! Plugin registry for managing machine types.
//!
//! The registry provides a central catalog of available machine types,
//! enabling the engine to instantiate plugins by their ID.

use std::collections::HashMap;

use super::plugin::{MachineInfo, Plugin, PluginContext, PluginError, PluginType};
use crate::engine::error::{EngineError, EngineResult};

/// Factory function type for creating plugin instances.
///
/// Returns a boxed trait object for type erasure.
pub type PluginFactory = fn(&PluginContext) -> Result<Box<dyn Plugin>, PluginError>;

/// Central registry of available machine types.
///
/// # Example
///
/// ```ignore
/// let mut registry = PluginRegistry::new();
/// registry.register::<SineOscillator>()?;
/// registry.register::<LiveOut>()?;
///
/// // Later, create instances by ID
/// let osc = registry.create("osc.sine", &context)?;
/// ```
pub struct PluginRegistry {
    /// Map of type ID to factory function.
    factories: HashMap<&'static str, PluginFactory>,
    /// Type information in registration order, for listing.
    infos: Vec<MachineInfo>,
}

impl PluginRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            infos: Vec::new(),
        }
    }

    /// Registers a plugin type.
    ///
    /// Registering the same ID twice is a sanity violation.
    pub fn register<P: PluginType>(&mut self) -> EngineResult<()> {
        let info = P::descriptor();
        let id = info.id;

        if self.factories.contains_key(id) {
            return Err(EngineError::sanity(format!(
                "Machine type '{}' is already registered",
                id
            )));
        }

        self.factories.insert(id, create_plugin::<P>);
        self.infos.push(info);
        Ok(())
    }

    /// Creates a new instance of a plugin by its type ID.
    pub fn create(&self, id: &str, context: &PluginContext) -> EngineResult<Box<dyn Plugin>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| EngineError::unknown("machine type", id))?;
        factory(context).map_err(|e| match e {
            PluginError::InitFailed(message) => EngineError::ResourceExhausted(format!(
                "{}: {}",
                context.instance_name, message
            )),
            PluginError::Failed(message) => EngineError::Plugin {
                machine: context.instance_name.clone(),
                message,
            },
        })
    }

    /// Information about a registered type.
    pub fn info(&self, id: &str) -> Option<&MachineInfo> {
        self.infos.iter().find(|info| info.id == id)
    }

    /// Returns all registered types in registration order.
    pub fn list(&self) -> &[MachineInfo] {
        &self.infos
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Checks if a type with the given ID is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_plugin<P: PluginType>(context: &PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
    P::init(context).map(|p| Box::new(p) as Box<dyn Plugin>)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dsp::controller::{ControllerDefinition, ControllerSlot};
    use crate::dsp::math::MathTables;
    use crate::dsp::plugin::MachineCategory;
    use crate::dsp::port::{InputDescriptor, OutputDescriptor};
    use crate::dsp::services::Services;
    use crate::dsp::signal::builtin_defaults;
    use crate::engine::handle::HostHandle;
    use crate::engine::ErrorKind;

    struct Silence {
        info: MachineInfo,
    }

    impl Plugin for Silence {
        fn info(&self) -> &MachineInfo {
            &self.info
        }

        fn inputs(&self) -> &[InputDescriptor] {
            &[]
        }

        fn outputs(&self) -> &[OutputDescriptor] {
            &[]
        }

        fn controllers(&self) -> &[ControllerDefinition] {
            &[]
        }

        fn controller_slot(&mut self, _name: &str) -> Option<ControllerSlot<'_>> {
            None
        }

        fn reset(&mut self) {}

        fn execute(&mut self, _services: &mut Services<'_>) -> Result<(), PluginError> {
            Ok(())
        }
    }

    impl PluginType for Silence {
        fn descriptor() -> MachineInfo {
            MachineInfo::new("test.silence", "Silence", MachineCategory::Source, "Nothing")
        }

        fn init(_context: &PluginContext) -> Result<Self, PluginError> {
            Ok(Self {
                info: Self::descriptor(),
            })
        }
    }

    struct Broken;

    impl Plugin for Broken {
        fn info(&self) -> &MachineInfo {
            unreachable!()
        }

        fn inputs(&self) -> &[InputDescriptor] {
            &[]
        }

        fn outputs(&self) -> &[OutputDescriptor] {
            &[]
        }

        fn controllers(&self) -> &[ControllerDefinition] {
            &[]
        }

        fn controller_slot(&mut self, _name: &str) -> Option<ControllerSlot<'_>> {
            None
        }

        fn reset(&mut self) {}

        fn execute(&mut self, _services: &mut Services<'_>) -> Result<(), PluginError> {
            Ok(())
        }
    }

    impl PluginType for Broken {
        fn descriptor() -> MachineInfo {
            MachineInfo::new("test.broken", "Broken", MachineCategory::Effect, "Never loads")
        }

        fn init(_context: &PluginContext) -> Result<Self, PluginError> {
            Err(PluginError::InitFailed("out of voices".into()))
        }
    }

    fn context(name: &str) -> PluginContext {
        PluginContext {
            instance_name: name.to_string(),
            defaults: builtin_defaults(),
            math: Arc::new(MathTables::new()),
            host: HostHandle::detached(),
        }
    }

    #[test]
    fn test_registry_creation() {
        let registry = PluginRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = PluginRegistry::new();
        registry.register::<Silence>().unwrap();
        registry.register::<Broken>().unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("test.silence"));
        assert_eq!(registry.list()[1].id, "test.broken");
        assert_eq!(registry.info("test.silence").unwrap().base_name, "Silence");

        let plugin = registry.create("test.silence", &context("m#0:Silence")).unwrap();
        assert_eq!(plugin.info().id, "test.silence");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register::<Silence>().unwrap();
        let err = registry.register::<Silence>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SanityViolation);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_unknown_type() {
        let registry = PluginRegistry::new();
        let err = registry.create("unknown.type", &context("x")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownName);
    }

    #[test]
    fn test_init_failure_is_resource_exhausted() {
        let mut registry = PluginRegistry::new();
        registry.register::<Broken>().unwrap();
        let err = registry.create("test.broken", &context("m#0:Broken")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("out of voices"));
    }
}
