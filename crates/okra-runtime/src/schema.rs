//! Schema and service-package data model (§3).
//!
//! The schema is consulted only for method names and input/output type
//! labels; type bodies are opaque at runtime, since guest-side marshalling
//! has already reduced them to JSON by the time a request reaches the actor.

use std::{collections::HashMap, sync::Arc};

use crate::{
    actor_id::ActorId,
    engine::CompiledModule,
    error::{ConfigError, Error, Result},
};

#[derive(Clone, Debug)]
pub struct ObjectType {
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct EnumType {
    pub name: String,
    pub variants: Vec<String>,
}

/// `{InputTypeName, OutputTypeName}` for one method of a service.
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub input_type: String,
    pub output_type: String,
}

impl MethodDescriptor {
    #[must_use]
    pub fn requires_input(&self) -> bool {
        !self.input_type.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ServiceDef {
    pub name: String,
    pub methods: HashMap<String, MethodDescriptor>,
}

#[derive(Clone, Debug, Default)]
pub struct SchemaMetadata {
    pub namespace: String,
    pub api_version: String,
    pub service_label: String,
}

/// Parsed schema. Only the first service block names the runtime endpoint
/// (see [`ServicePackage::from_parts`]); type bodies beyond name/enum
/// variants are not interpreted by the runtime.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub objects: Vec<ObjectType>,
    pub enums: Vec<EnumType>,
    pub services: Vec<ServiceDef>,
    pub metadata: SchemaMetadata,
}

impl Schema {
    #[must_use]
    pub fn first_service(&self) -> Option<&ServiceDef> {
        self.services.first()
    }
}

/// Tuple `{CompiledModule, Schema, Config, serviceName, methodIndex}` (§3).
pub struct ServicePackage {
    pub module: Arc<CompiledModule>,
    pub schema: Schema,
    pub service_name: String,
    method_index: HashMap<String, MethodDescriptor>,
}

impl ServicePackage {
    /// Rejected if the schema declares zero services; the first service
    /// block's methods populate the method index.
    pub fn new(module: Arc<CompiledModule>, schema: Schema) -> Result<Self> {
        let service = schema
            .first_service()
            .ok_or(Error::Configuration(ConfigError::EmptySchema))?
            .clone();

        Ok(Self {
            module,
            service_name: service.name,
            method_index: service.methods,
            schema,
        })
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.method_index.get(name)
    }

    #[must_use]
    pub fn actor_id(&self) -> ActorId {
        ActorId::new(
            &self.schema.metadata.namespace,
            &self.service_name,
            &self.schema.metadata.api_version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::trivial_compiled_module;

    fn schema_with(namespace: &str, service: &str, version: &str) -> Schema {
        let mut methods = HashMap::new();
        methods.insert(
            "add".to_string(),
            MethodDescriptor {
                input_type: "AddInput".to_string(),
                output_type: "AddResponse".to_string(),
            },
        );
        Schema {
            objects: vec![],
            enums: vec![],
            services: vec![ServiceDef {
                name: service.to_string(),
                methods,
            }],
            metadata: SchemaMetadata {
                namespace: namespace.to_string(),
                api_version: version.to_string(),
                service_label: service.to_string(),
            },
        }
    }

    #[test]
    fn empty_schema_is_rejected() {
        let module = Arc::new(trivial_compiled_module());
        let err = ServicePackage::new(module, Schema::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::EmptySchema)
        ));
    }

    #[test]
    fn actor_id_uses_defaults() {
        let module = Arc::new(trivial_compiled_module());
        let package = ServicePackage::new(module, schema_with("", "MyService", "")).unwrap();
        assert_eq!(package.actor_id().as_str(), "default.MyService.v1");
    }

    #[test]
    fn method_lookup() {
        let module = Arc::new(trivial_compiled_module());
        let package =
            ServicePackage::new(module, schema_with("prod", "MyService", "v2")).unwrap();
        assert!(package.method("add").unwrap().requires_input());
        assert!(package.method("subtract").is_none());
    }
}
