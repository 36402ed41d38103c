//! Interface metadata model
//!
//! The types in this module mirror what an interface compiler would emit for
//! each interface: ordered methods, parameter directions and types, return
//! type and parent interface.

use serde::{Deserialize, Serialize};

/// The reflected type of a parameter or return value
///
/// Scalars occupy one argument word. Strings, arrays and interface pointers
/// are passed as a pointer word; sequences as a pointer word followed by an
/// element count; "any" values as a tag word followed by a payload word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeSpec {
    Void,
    Bool,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// NUL-terminated string
    String,
    /// Counted buffer of scalar elements
    Sequence { element: Box<TypeSpec> },
    /// Fixed-length buffer of scalar elements
    Array { element: Box<TypeSpec>, length: u32 },
    /// Interface pointer of the named interface
    Interface { iid: String },
    /// Variant value
    Any,
}

impl TypeSpec {
    /// Builds a sequence type
    pub fn sequence(element: TypeSpec) -> Self {
        TypeSpec::Sequence {
            element: Box::new(element),
        }
    }

    /// Builds a fixed-length array type
    pub fn array(element: TypeSpec, length: u32) -> Self {
        TypeSpec::Array {
            element: Box::new(element),
            length,
        }
    }

    /// Builds an interface pointer type
    pub fn interface(iid: &str) -> Self {
        TypeSpec::Interface {
            iid: iid.to_string(),
        }
    }

    /// Returns true for types carried entirely in one word
    pub fn is_scalar(&self) -> bool {
        self.scalar_size().is_some()
    }

    /// Size in bytes of a scalar type, `None` otherwise
    pub fn scalar_size(&self) -> Option<usize> {
        match self {
            TypeSpec::Bool | TypeSpec::U8 => Some(1),
            TypeSpec::I16 | TypeSpec::U16 => Some(2),
            TypeSpec::I32 | TypeSpec::U32 | TypeSpec::F32 => Some(4),
            TypeSpec::I64 | TypeSpec::U64 | TypeSpec::F64 => Some(8),
            _ => None,
        }
    }

    /// Returns true for types that reference caller memory
    pub fn is_buffer(&self) -> bool {
        matches!(self, TypeSpec::Sequence { .. } | TypeSpec::Array { .. })
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, TypeSpec::Interface { .. })
    }

    /// Element size of a sequence or array
    pub fn element_size(&self) -> Option<usize> {
        match self {
            TypeSpec::Sequence { element } | TypeSpec::Array { element, .. } => {
                element.scalar_size()
            }
            _ => None,
        }
    }

    /// Number of argument words this type occupies
    pub fn word_count(&self) -> usize {
        match self {
            TypeSpec::Void => 0,
            TypeSpec::Sequence { .. } | TypeSpec::Any => 2,
            _ => 1,
        }
    }

    /// Number of hidden leading words a method returning this type receives
    ///
    /// String and "any" returns get an output buffer and its length; sequence
    /// returns get a buffer and an element count; arrays get a buffer only.
    pub fn hidden_return_words(&self) -> usize {
        match self {
            TypeSpec::String | TypeSpec::Any | TypeSpec::Sequence { .. } => 2,
            TypeSpec::Array { .. } => 1,
            _ => 0,
        }
    }
}

/// Parameter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeSpec,
    #[serde(default)]
    pub direction: Direction,
    /// Index of a string parameter naming the interface of this pointer
    #[serde(default)]
    pub iid_is: Option<usize>,
}

impl Parameter {
    pub fn new(name: &str, ty: TypeSpec) -> Self {
        Self {
            name: name.to_string(),
            ty,
            direction: Direction::In,
            iid_is: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_iid_is(mut self, index: usize) -> Self {
        self.iid_is = Some(index);
        self
    }
}

/// One method of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Parameter>,
    #[serde(default = "void_type")]
    pub returns: TypeSpec,
    /// Index of a string parameter naming the interface of the returned pointer
    #[serde(default)]
    pub returns_iid_is: Option<usize>,
}

fn void_type() -> TypeSpec {
    TypeSpec::Void
}

impl MethodSignature {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            returns: TypeSpec::Void,
            returns_iid_is: None,
        }
    }

    pub fn param(mut self, name: &str, ty: TypeSpec) -> Self {
        self.params.push(Parameter::new(name, ty));
        self
    }

    pub fn with_param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ty: TypeSpec) -> Self {
        self.returns = ty;
        self
    }

    pub fn returns_iid_is(mut self, index: usize) -> Self {
        self.returns_iid_is = Some(index);
        self
    }

    /// Number of argument words after the hidden return words
    pub fn argument_words(&self) -> usize {
        self.params.iter().map(|p| p.ty.word_count()).sum()
    }
}

/// One interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Interface identity
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub methods: Vec<MethodSignature>,
}

impl InterfaceDescriptor {
    /// Creates an interface that extends `parent`
    pub fn new(name: &str, parent: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: Some(parent.to_string()),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }
}
