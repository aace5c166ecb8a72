//! Type registry seam: resolves type names to definitions and validates
//! instance properties against them.

use crate::error::{CohortError, Result};
use crate::instance::{InstanceProperties, InstanceType, PropertyCategory};
use std::collections::{BTreeMap, HashMap};

/// Kind of instance a type definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    /// Entity type.
    Entity,
    /// Relationship type.
    Relationship,
    /// Classification type.
    Classification,
}

/// A shared type definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Type GUID.
    pub guid: String,
    /// Type name.
    pub name: String,
    /// What kind of instance this type describes.
    pub category: TypeCategory,
    /// Declared properties and their categories.
    pub properties: BTreeMap<String, PropertyCategory>,
    /// Entity types a classification may attach to; empty means any.
    pub valid_entity_types: Vec<String>,
}

impl TypeDef {
    fn new(guid: &str, name: &str, category: TypeCategory) -> Self {
        Self {
            guid: guid.to_string(),
            name: name.to_string(),
            category,
            properties: BTreeMap::new(),
            valid_entity_types: Vec::new(),
        }
    }

    /// Entity type definition.
    pub fn entity(guid: &str, name: &str) -> Self {
        Self::new(guid, name, TypeCategory::Entity)
    }

    /// Relationship type definition.
    pub fn relationship(guid: &str, name: &str) -> Self {
        Self::new(guid, name, TypeCategory::Relationship)
    }

    /// Classification type definition.
    pub fn classification(guid: &str, name: &str) -> Self {
        Self::new(guid, name, TypeCategory::Classification)
    }

    /// Declare a property.
    pub fn with_property(mut self, name: &str, category: PropertyCategory) -> Self {
        self.properties.insert(name.to_string(), category);
        self
    }

    /// Restrict a classification to the given entity type.
    pub fn valid_for(mut self, entity_type: &str) -> Self {
        self.valid_entity_types.push(entity_type.to_string());
        self
    }

    /// The instance type reference for instances of this definition.
    pub fn instance_type(&self) -> InstanceType {
        InstanceType {
            type_guid: self.guid.clone(),
            type_name: self.name.clone(),
        }
    }

    /// True if this classification may be attached to `entity_type`.
    pub fn applies_to(&self, entity_type: &str) -> bool {
        self.valid_entity_types.is_empty() || self.valid_entity_types.iter().any(|t| t == entity_type)
    }

    /// Check that every property is declared with the matching category.
    pub fn validate_properties(
        &self,
        operation: &'static str,
        properties: &InstanceProperties,
    ) -> Result<()> {
        for (name, value) in properties.iter() {
            match self.properties.get(name) {
                None => {
                    return Err(CohortError::invalid(
                        operation,
                        format!("property {} is not defined for type {}", name, self.name),
                    ))
                }
                Some(expected) if *expected != value.category() => {
                    return Err(CohortError::invalid(
                        operation,
                        format!(
                            "property {} of type {} expects {:?}, got {:?}",
                            name,
                            self.name,
                            expected,
                            value.category()
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Resolves type names and GUIDs to definitions. Local and non-blocking.
pub trait TypeRegistry: Send + Sync {
    /// Look up a definition by name.
    fn type_by_name(&self, name: &str) -> Option<TypeDef>;

    /// Look up a definition by GUID.
    fn type_by_guid(&self, guid: &str) -> Option<TypeDef>;

    /// Resolve a name to a definition of the expected category.
    fn resolve(
        &self,
        operation: &'static str,
        name: &str,
        category: TypeCategory,
    ) -> Result<TypeDef> {
        match self.type_by_name(name) {
            Some(def) if def.category == category => Ok(def),
            Some(def) => Err(CohortError::invalid(
                operation,
                format!("type {} is a {:?}, expected {:?}", name, def.category, category),
            )),
            None => Err(CohortError::not_found(operation, "type", name)),
        }
    }
}

/// In-memory type registry, filled before the member starts.
#[derive(Debug, Default)]
pub struct InMemoryTypeRegistry {
    by_name: HashMap<String, TypeDef>,
    by_guid: HashMap<String, String>,
}

impl InMemoryTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, replacing any with the same name.
    pub fn register(&mut self, def: TypeDef) {
        self.by_guid.insert(def.guid.clone(), def.name.clone());
        self.by_name.insert(def.name.clone(), def);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, def: TypeDef) -> Self {
        self.register(def);
        self
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True if no definitions are registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl TypeRegistry for InMemoryTypeRegistry {
    fn type_by_name(&self, name: &str) -> Option<TypeDef> {
        self.by_name.get(name).cloned()
    }

    fn type_by_guid(&self, guid: &str) -> Option<TypeDef> {
        self.by_guid
            .get(guid)
            .and_then(|name| self.by_name.get(name))
            .cloned()
    }
}
