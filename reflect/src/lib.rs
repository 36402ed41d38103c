//! # Reflected Interfaces
//!
//! This crate describes the interfaces that can be invoked across a
//! protection boundary.
//!
//! ## Philosophy
//!
//! - **Metadata drives dispatch**: The kernel never hard-codes a calling
//!   convention per method. It reads the method signature and marshals from it.
//! - **Single inheritance**: Every interface except the root names exactly one
//!   parent. Method numbers are global across the chain, parents first.
//! - **Closed wire values**: Arguments travel as a tagged [`Value`], matched by
//!   pattern, never as untyped memory.
//!
//! ## Architecture
//!
//! - [`TypeSpec`], [`Parameter`], [`MethodSignature`], [`InterfaceDescriptor`]:
//!   the metadata model (serde serializable, loadable from JSON)
//! - [`Catalog`]: interface identity to descriptor, method resolution
//! - [`Value`]: the wire representation of an argument or result

pub mod catalog;
pub mod types;
pub mod value;

pub use catalog::{Catalog, CatalogError, ResolvedMethod, RootMethod, ROOT_INTERFACE};
pub use types::{Direction, InterfaceDescriptor, MethodSignature, Parameter, TypeSpec};
pub use value::{AnyTag, Value};
