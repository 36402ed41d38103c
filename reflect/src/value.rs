//! Wire values
//!
//! A [`Value`] is one decoded argument or result. The object payload is
//! generic so the kernel can carry its own reference type without this crate
//! knowing about it.

use crate::types::TypeSpec;

/// A decoded argument or result
#[derive(Debug, Clone, PartialEq)]
pub enum Value<O> {
    Void,
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    /// Contents of a sequence or array, raw element bytes
    Bytes(Vec<u8>),
    /// Interface pointer, `None` for a null pointer
    Object(Option<O>),
    /// Variant value
    Any(Box<Value<O>>),
}

/// Tag word carried ahead of an "any" payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum AnyTag {
    Void = 0,
    Bool = 1,
    U8 = 2,
    I16 = 3,
    U16 = 4,
    I32 = 5,
    U32 = 6,
    I64 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
    Str = 11,
    Object = 12,
}

impl AnyTag {
    pub fn from_word(word: u64) -> Option<Self> {
        Some(match word {
            0 => AnyTag::Void,
            1 => AnyTag::Bool,
            2 => AnyTag::U8,
            3 => AnyTag::I16,
            4 => AnyTag::U16,
            5 => AnyTag::I32,
            6 => AnyTag::U32,
            7 => AnyTag::I64,
            8 => AnyTag::U64,
            9 => AnyTag::F32,
            10 => AnyTag::F64,
            11 => AnyTag::Str,
            12 => AnyTag::Object,
            _ => return None,
        })
    }

    pub fn as_word(self) -> u64 {
        self as u64
    }

    /// The scalar type a tag stands for, `None` for strings and objects
    pub fn scalar_type(self) -> Option<TypeSpec> {
        Some(match self {
            AnyTag::Void => TypeSpec::Void,
            AnyTag::Bool => TypeSpec::Bool,
            AnyTag::U8 => TypeSpec::U8,
            AnyTag::I16 => TypeSpec::I16,
            AnyTag::U16 => TypeSpec::U16,
            AnyTag::I32 => TypeSpec::I32,
            AnyTag::U32 => TypeSpec::U32,
            AnyTag::I64 => TypeSpec::I64,
            AnyTag::U64 => TypeSpec::U64,
            AnyTag::F32 => TypeSpec::F32,
            AnyTag::F64 => TypeSpec::F64,
            AnyTag::Str | AnyTag::Object => return None,
        })
    }
}

impl<O> Value<O> {
    /// Decodes a scalar from one argument word
    ///
    /// Narrow types take the low bits of the word. Returns `None` for
    /// types that are not carried in a single word by value.
    pub fn from_word(ty: &TypeSpec, word: u64) -> Option<Self> {
        Some(match ty {
            TypeSpec::Void => Value::Void,
            TypeSpec::Bool => Value::Bool(word & 0xff != 0),
            TypeSpec::U8 => Value::U8(word as u8),
            TypeSpec::I16 => Value::I16(word as u16 as i16),
            TypeSpec::U16 => Value::U16(word as u16),
            TypeSpec::I32 => Value::I32(word as u32 as i32),
            TypeSpec::U32 => Value::U32(word as u32),
            TypeSpec::I64 => Value::I64(word as i64),
            TypeSpec::U64 => Value::U64(word),
            TypeSpec::F32 => Value::F32(f32::from_bits(word as u32)),
            TypeSpec::F64 => Value::F64(f64::from_bits(word)),
            _ => return None,
        })
    }

    /// Encodes a scalar into one result word
    ///
    /// Signed values are sign extended. Returns `None` for non-scalars.
    pub fn to_word(&self) -> Option<u64> {
        Some(match self {
            Value::Void => 0,
            Value::Bool(v) => *v as u64,
            Value::U8(v) => *v as u64,
            Value::I16(v) => *v as i64 as u64,
            Value::U16(v) => *v as u64,
            Value::I32(v) => *v as i64 as u64,
            Value::U32(v) => *v as u64,
            Value::I64(v) => *v as u64,
            Value::U64(v) => *v,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            _ => return None,
        })
    }

    /// Tag of this value when carried inside an "any"
    pub fn any_tag(&self) -> Option<AnyTag> {
        Some(match self {
            Value::Void => AnyTag::Void,
            Value::Bool(_) => AnyTag::Bool,
            Value::U8(_) => AnyTag::U8,
            Value::I16(_) => AnyTag::I16,
            Value::U16(_) => AnyTag::U16,
            Value::I32(_) => AnyTag::I32,
            Value::U32(_) => AnyTag::U32,
            Value::I64(_) => AnyTag::I64,
            Value::U64(_) => AnyTag::U64,
            Value::F32(_) => AnyTag::F32,
            Value::F64(_) => AnyTag::F64,
            Value::Str(_) => AnyTag::Str,
            Value::Object(_) => AnyTag::Object,
            Value::Bytes(_) | Value::Any(_) => return None,
        })
    }

    /// Checks that the value has the shape of `ty`
    pub fn matches(&self, ty: &TypeSpec) -> bool {
        matches!(
            (self, ty),
            (Value::Void, TypeSpec::Void)
                | (Value::Bool(_), TypeSpec::Bool)
                | (Value::U8(_), TypeSpec::U8)
                | (Value::I16(_), TypeSpec::I16)
                | (Value::U16(_), TypeSpec::U16)
                | (Value::I32(_), TypeSpec::I32)
                | (Value::U32(_), TypeSpec::U32)
                | (Value::I64(_), TypeSpec::I64)
                | (Value::U64(_), TypeSpec::U64)
                | (Value::F32(_), TypeSpec::F32)
                | (Value::F64(_), TypeSpec::F64)
                | (Value::Str(_), TypeSpec::String)
                | (Value::Bytes(_), TypeSpec::Sequence { .. })
                | (Value::Bytes(_), TypeSpec::Array { .. })
                | (Value::Object(_), TypeSpec::Interface { .. })
                | (Value::Any(_), TypeSpec::Any)
        )
    }

    /// Integer view of a scalar, zero extended
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(v) => Some(*v as u64),
            Value::U8(v) => Some(*v as u64),
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            Value::I16(v) => Some(*v as u16 as u64),
            Value::I32(v) => Some(*v as u32 as u64),
            Value::I64(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// Integer view of a scalar, sign extended
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::U8(v) => Some(*v as i64),
            Value::U16(v) => Some(*v as i64),
            Value::U32(v) => Some(*v as i64),
            Value::U64(v) => Some(*v as i64),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Option<O>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Moves the object out of an interface value
    pub fn into_object(self) -> Option<O> {
        match self {
            Value::Object(o) => o,
            Value::Any(inner) => inner.into_object(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type V = Value<u32>;

    #[test]
    fn test_scalar_words() {
        let v = V::from_word(&TypeSpec::I32, 0xffff_ffff).unwrap();
        assert_eq!(v, Value::I32(-1));
        assert_eq!(v.to_word(), Some(u64::MAX));

        let b = V::from_word(&TypeSpec::Bool, 0x100).unwrap();
        assert_eq!(b, Value::Bool(false));

        let f = V::from_word(&TypeSpec::F64, 1.5f64.to_bits()).unwrap();
        assert_eq!(f, Value::F64(1.5));

        assert!(V::from_word(&TypeSpec::String, 0).is_none());
    }

    #[test]
    fn test_matches() {
        assert!(V::Str("x".into()).matches(&TypeSpec::String));
        assert!(V::Bytes(vec![1]).matches(&TypeSpec::sequence(TypeSpec::U8)));
        assert!(V::Object(None).matches(&TypeSpec::interface("Counter")));
        assert!(!V::U32(1).matches(&TypeSpec::I32));
    }

    #[test]
    fn test_any_tags() {
        assert_eq!(V::I64(4).any_tag(), Some(AnyTag::I64));
        assert_eq!(AnyTag::from_word(11), Some(AnyTag::Str));
        assert_eq!(AnyTag::from_word(13), None);
        assert_eq!(AnyTag::U16.scalar_type(), Some(TypeSpec::U16));
        assert_eq!(AnyTag::Object.scalar_type(), None);
    }

    #[test]
    fn test_into_object() {
        assert_eq!(V::Object(Some(7)).into_object(), Some(7));
        assert_eq!(V::Any(Box::new(V::Object(Some(3)))).into_object(), Some(3));
        assert_eq!(V::U32(7).into_object(), None);
    }
}
