//! Interface catalog
//!
//! Maps interface identities to their descriptors and resolves a global
//! method number to the declaring interface by walking the inheritance
//! chain.
//!
//! ## Example
//!
//! ```
//! use reflect::{Catalog, InterfaceDescriptor, MethodSignature, TypeSpec};
//!
//! let mut catalog = Catalog::new();
//! catalog
//!     .register(
//!         InterfaceDescriptor::new("Counter", "Interface")
//!             .method(MethodSignature::new("increment").returns(TypeSpec::I32)),
//!     )
//!     .unwrap();
//!
//! let resolved = catalog.resolve("Counter", 3).unwrap();
//! assert_eq!(resolved.interface, "Counter");
//! assert_eq!(resolved.signature.name, "increment");
//! ```

use crate::types::{Direction, InterfaceDescriptor, MethodSignature, Parameter, TypeSpec};
use std::collections::BTreeMap;
use thiserror::Error;

/// Identity of the root interface every interface derives from
pub const ROOT_INTERFACE: &str = "Interface";

/// Methods declared by the root interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMethod {
    QueryInterface,
    AddRef,
    Release,
}

impl RootMethod {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(RootMethod::QueryInterface),
            1 => Some(RootMethod::AddRef),
            2 => Some(RootMethod::Release),
            _ => None,
        }
    }
}

/// Catalog errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    #[error("Interface already registered: {0}")]
    DuplicateInterface(String),

    #[error("Interface {interface} names unknown parent {parent}")]
    UnknownParent { interface: String, parent: String },

    #[error("Interface {interface} has no method {method}")]
    NoSuchMethod { interface: String, method: u32 },

    #[error("Invalid signature {interface}::{method}: {reason}")]
    InvalidSignature {
        interface: String,
        method: String,
        reason: String,
    },

    #[error("Malformed catalog: {0}")]
    Malformed(String),
}

/// A method number resolved against an interface chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    /// Interface the call was made through
    pub target: String,
    /// Interface that declares the method
    pub interface: String,
    /// Method number as seen by the caller
    pub number: u32,
    /// Index within the declaring interface
    pub local_index: u32,
    pub signature: MethodSignature,
}

impl ResolvedMethod {
    /// Returns the root method, if the declaring interface is the root
    pub fn root_method(&self) -> Option<RootMethod> {
        if self.interface == ROOT_INTERFACE {
            RootMethod::from_index(self.local_index)
        } else {
            None
        }
    }
}

/// The reflected interface catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    interfaces: BTreeMap<String, InterfaceDescriptor>,
}

impl Catalog {
    /// Creates a catalog holding only the root interface
    pub fn new() -> Self {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(ROOT_INTERFACE.to_string(), root_interface());
        Self { interfaces }
    }

    /// Registers an interface
    ///
    /// The parent must already be registered, so a chain can never dangle.
    pub fn register(&mut self, descriptor: InterfaceDescriptor) -> Result<(), CatalogError> {
        if self.interfaces.contains_key(&descriptor.name) {
            return Err(CatalogError::DuplicateInterface(descriptor.name));
        }
        let parent = match &descriptor.parent {
            Some(parent) => parent,
            None => {
                return Err(CatalogError::UnknownParent {
                    interface: descriptor.name.clone(),
                    parent: String::new(),
                })
            }
        };
        if !self.interfaces.contains_key(parent) {
            return Err(CatalogError::UnknownParent {
                interface: descriptor.name.clone(),
                parent: parent.clone(),
            });
        }
        for method in &descriptor.methods {
            validate_signature(&descriptor.name, method)?;
        }
        self.interfaces.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Loads a JSON array of interface descriptors, in order
    ///
    /// Returns the number of interfaces registered.
    pub fn load_json(&mut self, json: &str) -> Result<usize, CatalogError> {
        let descriptors: Vec<InterfaceDescriptor> =
            serde_json::from_str(json).map_err(|e| CatalogError::Malformed(e.to_string()))?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(count)
    }

    pub fn get(&self, iid: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.get(iid)
    }

    pub fn contains(&self, iid: &str) -> bool {
        self.interfaces.contains_key(iid)
    }

    /// Number of methods declared by the parents of `iid`
    pub fn inherited_method_count(&self, iid: &str) -> Result<u32, CatalogError> {
        let descriptor = self.lookup(iid)?;
        match &descriptor.parent {
            Some(parent) => self.total_method_count(parent),
            None => Ok(0),
        }
    }

    /// Number of methods reachable through `iid`, inherited ones included
    pub fn total_method_count(&self, iid: &str) -> Result<u32, CatalogError> {
        let mut total = 0u32;
        let mut current = Some(iid);
        while let Some(name) = current {
            let descriptor = self.lookup(name)?;
            total += descriptor.methods.len() as u32;
            current = descriptor.parent.as_deref();
        }
        Ok(total)
    }

    /// Resolves a method number against `iid`
    ///
    /// Walks up the chain until the method number falls inside the range
    /// declared by one interface.
    pub fn resolve(&self, iid: &str, number: u32) -> Result<ResolvedMethod, CatalogError> {
        if self.total_method_count(iid)? <= number {
            return Err(CatalogError::NoSuchMethod {
                interface: iid.to_string(),
                method: number,
            });
        }
        let mut current = self.lookup(iid)?;
        loop {
            let base = self.inherited_method_count(&current.name)?;
            if base <= number {
                let local_index = number - base;
                let signature = current
                    .methods
                    .get(local_index as usize)
                    .cloned()
                    .ok_or_else(|| CatalogError::NoSuchMethod {
                        interface: iid.to_string(),
                        method: number,
                    })?;
                return Ok(ResolvedMethod {
                    target: iid.to_string(),
                    interface: current.name.clone(),
                    number,
                    local_index,
                    signature,
                });
            }
            let parent = current
                .parent
                .as_deref()
                .ok_or_else(|| CatalogError::UnknownInterface(current.name.clone()))?;
            current = self.lookup(parent)?;
        }
    }

    /// Finds the global method number of a method by name
    pub fn method_number(&self, iid: &str, name: &str) -> Result<u32, CatalogError> {
        let mut current = Some(iid);
        while let Some(interface) = current {
            let descriptor = self.lookup(interface)?;
            if let Some(index) = descriptor.methods.iter().position(|m| m.name == name) {
                return Ok(self.inherited_method_count(interface)? + index as u32);
            }
            current = descriptor.parent.as_deref();
        }
        Err(CatalogError::UnknownInterface(format!("{}::{}", iid, name)))
    }

    /// Returns true if `iid` is `ancestor` or derives from it
    pub fn is_derived_from(&self, iid: &str, ancestor: &str) -> bool {
        let mut current = Some(iid);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.interfaces.get(name).and_then(|d| d.parent.as_deref());
        }
        false
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    fn lookup(&self, iid: &str) -> Result<&InterfaceDescriptor, CatalogError> {
        self.interfaces
            .get(iid)
            .ok_or_else(|| CatalogError::UnknownInterface(iid.to_string()))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn root_interface() -> InterfaceDescriptor {
    InterfaceDescriptor {
        name: ROOT_INTERFACE.to_string(),
        parent: None,
        methods: vec![
            MethodSignature::new("queryInterface")
                .param("iid", TypeSpec::String)
                .returns(TypeSpec::interface(ROOT_INTERFACE))
                .returns_iid_is(0),
            MethodSignature::new("addRef").returns(TypeSpec::U32),
            MethodSignature::new("release").returns(TypeSpec::U32),
        ],
    }
}

fn validate_signature(interface: &str, method: &MethodSignature) -> Result<(), CatalogError> {
    let invalid = |reason: &str| CatalogError::InvalidSignature {
        interface: interface.to_string(),
        method: method.name.clone(),
        reason: reason.to_string(),
    };

    for param in &method.params {
        validate_type(&param.ty).map_err(|reason| invalid(reason))?;
        if param.ty == TypeSpec::Void {
            return Err(invalid("void parameter"));
        }
        if param.direction != Direction::In && !param.ty.is_buffer() {
            return Err(invalid("only buffers can be output parameters"));
        }
        if let Some(index) = param.iid_is {
            if !param.ty.is_interface() {
                return Err(invalid("iid_is on a non-interface parameter"));
            }
            check_string_param(&method.params, index).map_err(|reason| invalid(reason))?;
        }
    }
    validate_type(&method.returns).map_err(|reason| invalid(reason))?;
    if let Some(index) = method.returns_iid_is {
        if !method.returns.is_interface() {
            return Err(invalid("returns_iid_is on a non-interface return"));
        }
        check_string_param(&method.params, index).map_err(|reason| invalid(reason))?;
    }
    Ok(())
}

fn validate_type(ty: &TypeSpec) -> Result<(), &'static str> {
    match ty {
        TypeSpec::Sequence { element } | TypeSpec::Array { element, .. } => {
            if element.is_scalar() {
                Ok(())
            } else {
                Err("buffer elements must be scalars")
            }
        }
        _ => Ok(()),
    }
}

fn check_string_param(params: &[Parameter], index: usize) -> Result<(), &'static str> {
    match params.get(index) {
        Some(param) if param.ty == TypeSpec::String => Ok(()),
        _ => Err("iid_is must name a string parameter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> InterfaceDescriptor {
        InterfaceDescriptor::new("Counter", ROOT_INTERFACE)
            .method(MethodSignature::new("increment").returns(TypeSpec::I32))
            .method(MethodSignature::new("get").returns(TypeSpec::I32))
    }

    #[test]
    fn test_root_methods_resolve() {
        let catalog = Catalog::new();
        let resolved = catalog.resolve(ROOT_INTERFACE, 1).unwrap();
        assert_eq!(resolved.root_method(), Some(RootMethod::AddRef));
        assert!(catalog.resolve(ROOT_INTERFACE, 3).is_err());
    }

    #[test]
    fn test_resolution_walks_inheritance() {
        let mut catalog = Catalog::new();
        catalog.register(counter()).unwrap();
        catalog
            .register(
                InterfaceDescriptor::new("ResettableCounter", "Counter")
                    .method(MethodSignature::new("reset")),
            )
            .unwrap();

        assert_eq!(catalog.total_method_count("ResettableCounter").unwrap(), 6);

        let release = catalog.resolve("ResettableCounter", 2).unwrap();
        assert_eq!(release.interface, ROOT_INTERFACE);
        assert_eq!(release.root_method(), Some(RootMethod::Release));

        let get = catalog.resolve("ResettableCounter", 4).unwrap();
        assert_eq!(get.interface, "Counter");
        assert_eq!(get.local_index, 1);

        let reset = catalog.resolve("ResettableCounter", 5).unwrap();
        assert_eq!(reset.interface, "ResettableCounter");
        assert_eq!(reset.target, "ResettableCounter");

        assert!(matches!(
            catalog.resolve("ResettableCounter", 6),
            Err(CatalogError::NoSuchMethod { method: 6, .. })
        ));
    }

    #[test]
    fn test_register_rejects_unknown_parent() {
        let mut catalog = Catalog::new();
        let result = catalog.register(InterfaceDescriptor::new("Orphan", "Missing"));
        assert!(matches!(result, Err(CatalogError::UnknownParent { .. })));
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut catalog = Catalog::new();
        catalog.register(counter()).unwrap();
        assert_eq!(
            catalog.register(counter()),
            Err(CatalogError::DuplicateInterface("Counter".to_string()))
        );
    }

    #[test]
    fn test_register_rejects_bad_iid_is() {
        let mut catalog = Catalog::new();
        let bad = InterfaceDescriptor::new("Factory", ROOT_INTERFACE).method(
            MethodSignature::new("create")
                .param("size", TypeSpec::U32)
                .returns(TypeSpec::interface(ROOT_INTERFACE))
                .returns_iid_is(0),
        );
        assert!(matches!(
            catalog.register(bad),
            Err(CatalogError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_load_json() {
        let mut catalog = Catalog::new();
        let json = r#"[
            {"name": "Greeter", "parent": "Interface", "methods": [
                {"name": "greet", "params": [{"name": "who", "type": {"kind": "string"}}],
                 "returns": {"kind": "string"}}
            ]}
        ]"#;
        assert_eq!(catalog.load_json(json).unwrap(), 1);
        assert_eq!(catalog.method_number("Greeter", "greet").unwrap(), 3);
        assert_eq!(catalog.method_number("Greeter", "release").unwrap(), 2);
        assert!(catalog.is_derived_from("Greeter", ROOT_INTERFACE));
        assert!(!catalog.is_derived_from(ROOT_INTERFACE, "Greeter"));
    }

    #[test]
    fn test_load_json_malformed() {
        let mut catalog = Catalog::new();
        assert!(matches!(
            catalog.load_json("{not json"),
            Err(CatalogError::Malformed(_))
        ));
    }
}
