//! Represent structured PV values, as exchanged with a remote PV store.
//!
//! A structured PV is a tree. Interior nodes are named structures, and leaves are
//! either a single scalar or a homogeneous array of scalars. Structures can also be
//! repeated as an array of structures. This module models the four node kinds as
//! [`PvField`]:
//! - [`PvField::Scalar`] ([`ScalarValue`])
//! - [`PvField::ScalarArray`] ([`ScalarArray`])
//! - [`PvField::Structure`] ([`PvStructure`])
//! - [`PvField::StructureArray`] ([`Vec<PvStructure>`])
//!
//! Scalars can be any of the fixed-width integer or floating point types enumerated in
//! [`ScalarType`], or strings. Numeric values can be converted between the numeric
//! types as long as the value is representable in the target type, and are parsed out
//! of string leaves on request.
//!
//! Individual leaves of a tree are addressed by [`FieldPath`], a sequence of field and
//! element indices. A path is only meaningful for trees of the same shape as the one
//! it was created from.
//!
use std::{fmt, str::FromStr};

use num::NumCast;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The scalar element types a PV leaf (or a local signal) can have
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    #[serde(rename = "uint8", alias = "u8")]
    U8,
    #[serde(rename = "int8", alias = "i8")]
    I8,
    #[serde(rename = "uint16", alias = "u16")]
    U16,
    #[serde(rename = "int16", alias = "i16")]
    I16,
    #[serde(rename = "uint32", alias = "u32")]
    U32,
    #[serde(rename = "int32", alias = "i32")]
    I32,
    #[serde(rename = "uint64", alias = "u64")]
    U64,
    #[serde(rename = "int64", alias = "i64")]
    I64,
    #[serde(rename = "float32", alias = "f32")]
    F32,
    #[serde(rename = "float64", alias = "f64")]
    F64,
    #[serde(rename = "string")]
    String,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::U8 => "uint8",
            ScalarType::I8 => "int8",
            ScalarType::U16 => "uint16",
            ScalarType::I16 => "int16",
            ScalarType::U32 => "uint32",
            ScalarType::I32 => "int32",
            ScalarType::U64 => "uint64",
            ScalarType::I64 => "int64",
            ScalarType::F32 => "float32",
            ScalarType::F64 => "float64",
            ScalarType::String => "string",
        }
    }
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ScalarType::String)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "uint8" | "u8" => ScalarType::U8,
            "int8" | "i8" => ScalarType::I8,
            "uint16" | "u16" => ScalarType::U16,
            "int16" | "i16" => ScalarType::I16,
            "uint32" | "u32" => ScalarType::U32,
            "int32" | "i32" => ScalarType::I32,
            "uint64" | "u64" => ScalarType::U64,
            "int64" | "i64" => ScalarType::I64,
            "float32" | "f32" => ScalarType::F32,
            "float64" | "f64" => ScalarType::F64,
            "string" => ScalarType::String,
            _ => return Err(()),
        })
    }
}

/// Expand an expression once for the Rust type matching a numeric [`ScalarType`].
///
/// `$T` is bound as a type alias inside `$body`. [`ScalarType::String`] evaluates
/// `$otherwise` instead.
macro_rules! with_numeric_type {
    ($scalar_type:expr, $T:ident => $body:expr, $otherwise:expr) => {
        match $scalar_type {
            $crate::pvdata::ScalarType::U8 => {
                type $T = u8;
                $body
            }
            $crate::pvdata::ScalarType::I8 => {
                type $T = i8;
                $body
            }
            $crate::pvdata::ScalarType::U16 => {
                type $T = u16;
                $body
            }
            $crate::pvdata::ScalarType::I16 => {
                type $T = i16;
                $body
            }
            $crate::pvdata::ScalarType::U32 => {
                type $T = u32;
                $body
            }
            $crate::pvdata::ScalarType::I32 => {
                type $T = i32;
                $body
            }
            $crate::pvdata::ScalarType::U64 => {
                type $T = u64;
                $body
            }
            $crate::pvdata::ScalarType::I64 => {
                type $T = i64;
                $body
            }
            $crate::pvdata::ScalarType::F32 => {
                type $T = f32;
                $body
            }
            $crate::pvdata::ScalarType::F64 => {
                type $T = f64;
                $body
            }
            $crate::pvdata::ScalarType::String => $otherwise,
        }
    };
}
pub(crate) use with_numeric_type;

/// A fixed-width numeric type that can be moved between PV leaves and signal memory
pub trait PvNumeric:
    Copy + Default + PartialEq + NumCast + FromStr + fmt::Display + fmt::Debug + Send + Sync + 'static
{
    const SCALAR_TYPE: ScalarType;

    /// Widen to the 64-bit slot representation used by signal memory
    fn to_raw(self) -> u64;
    /// Recover a value from its 64-bit slot representation
    fn from_raw(raw: u64) -> Self;
}

macro_rules! impl_pv_numeric_integer {
    ($t:ty, $variant:ident) => {
        impl PvNumeric for $t {
            const SCALAR_TYPE: ScalarType = ScalarType::$variant;
            fn to_raw(self) -> u64 {
                self as u64
            }
            fn from_raw(raw: u64) -> Self {
                raw as $t
            }
        }
    };
}
impl_pv_numeric_integer!(u8, U8);
impl_pv_numeric_integer!(i8, I8);
impl_pv_numeric_integer!(u16, U16);
impl_pv_numeric_integer!(i16, I16);
impl_pv_numeric_integer!(u32, U32);
impl_pv_numeric_integer!(i32, I32);
impl_pv_numeric_integer!(u64, U64);
impl_pv_numeric_integer!(i64, I64);

impl PvNumeric for f32 {
    const SCALAR_TYPE: ScalarType = ScalarType::F32;
    fn to_raw(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_raw(raw: u64) -> Self {
        f32::from_bits(raw as u32)
    }
}

impl PvNumeric for f64 {
    const SCALAR_TYPE: ScalarType = ScalarType::F64;
    fn to_raw(self) -> u64 {
        self.to_bits()
    }
    fn from_raw(raw: u64) -> Self {
        f64::from_bits(raw)
    }
}

/// A value could not be represented in the requested scalar type
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("cannot represent {from} value as {to}")]
pub struct ConvertError {
    pub from: ScalarType,
    pub to: ScalarType,
}

/// A single scalar leaf value
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl ScalarValue {
    /// The zero value of a given scalar type
    pub fn default_for(scalar_type: ScalarType) -> Self {
        match scalar_type {
            ScalarType::U8 => ScalarValue::U8(0),
            ScalarType::I8 => ScalarValue::I8(0),
            ScalarType::U16 => ScalarValue::U16(0),
            ScalarType::I16 => ScalarValue::I16(0),
            ScalarType::U32 => ScalarValue::U32(0),
            ScalarType::I32 => ScalarValue::I32(0),
            ScalarType::U64 => ScalarValue::U64(0),
            ScalarType::I64 => ScalarValue::I64(0),
            ScalarType::F32 => ScalarValue::F32(0.0),
            ScalarType::F64 => ScalarValue::F64(0.0),
            ScalarType::String => ScalarValue::String(String::new()),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::U8(_) => ScalarType::U8,
            ScalarValue::I8(_) => ScalarType::I8,
            ScalarValue::U16(_) => ScalarType::U16,
            ScalarValue::I16(_) => ScalarType::I16,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U64(_) => ScalarType::U64,
            ScalarValue::I64(_) => ScalarType::I64,
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
            ScalarValue::String(_) => ScalarType::String,
        }
    }

    /// Read the value as a numeric type, converting if necessary
    ///
    /// Fails if the value is out of range of the target type, or is a string that
    /// does not parse as one.
    pub fn to<T: PvNumeric>(&self) -> Result<T, ConvertError> {
        let converted: Option<T> = match self {
            ScalarValue::U8(v) => NumCast::from(*v),
            ScalarValue::I8(v) => NumCast::from(*v),
            ScalarValue::U16(v) => NumCast::from(*v),
            ScalarValue::I16(v) => NumCast::from(*v),
            ScalarValue::U32(v) => NumCast::from(*v),
            ScalarValue::I32(v) => NumCast::from(*v),
            ScalarValue::U64(v) => NumCast::from(*v),
            ScalarValue::I64(v) => NumCast::from(*v),
            ScalarValue::F32(v) => NumCast::from(*v),
            ScalarValue::F64(v) => NumCast::from(*v),
            ScalarValue::String(s) => s.trim().parse().ok(),
        };
        converted.ok_or(ConvertError {
            from: self.scalar_type(),
            to: T::SCALAR_TYPE,
        })
    }

    /// Overwrite the value in place, keeping the existing scalar type
    pub fn assign<T: PvNumeric>(&mut self, value: T) -> Result<(), ConvertError> {
        let error = ConvertError {
            from: T::SCALAR_TYPE,
            to: self.scalar_type(),
        };
        match self {
            ScalarValue::U8(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::I8(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::U16(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::I16(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::U32(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::I32(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::U64(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::I64(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::F32(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::F64(slot) => *slot = NumCast::from(value).ok_or(error)?,
            ScalarValue::String(slot) => *slot = value.to_string(),
        }
        Ok(())
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::U8(v) => write!(f, "{v}"),
            ScalarValue::I8(v) => write!(f, "{v}"),
            ScalarValue::U16(v) => write!(f, "{v}"),
            ScalarValue::I16(v) => write!(f, "{v}"),
            ScalarValue::U32(v) => write!(f, "{v}"),
            ScalarValue::I32(v) => write!(f, "{v}"),
            ScalarValue::U64(v) => write!(f, "{v}"),
            ScalarValue::I64(v) => write!(f, "{v}"),
            ScalarValue::F32(v) => write!(f, "{v}"),
            ScalarValue::F64(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

/// A homogeneous array leaf
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarArray {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    String(Vec<String>),
}

/// Utility function so that we don't have to repeat the map iter conversion
fn try_convert_vec<T, U>(from: &[T], error: ConvertError) -> Result<Vec<U>, ConvertError>
where
    T: Copy + NumCast,
    U: NumCast,
{
    from.iter()
        .map(|n| NumCast::from(*n).ok_or(error))
        .collect()
}

/// Convert as many items as fit into `out`, returning the number written
fn try_convert_into<T, U>(
    from: &[T],
    out: &mut [U],
    error: ConvertError,
) -> Result<usize, ConvertError>
where
    T: Copy + NumCast,
    U: NumCast,
{
    let count = from.len().min(out.len());
    for (slot, value) in out.iter_mut().zip(from) {
        *slot = NumCast::from(*value).ok_or(error)?;
    }
    Ok(count)
}

impl ScalarArray {
    /// An array of `count` zero values of the given type
    pub fn zeroed(scalar_type: ScalarType, count: usize) -> Self {
        match scalar_type {
            ScalarType::U8 => ScalarArray::U8(vec![0; count]),
            ScalarType::I8 => ScalarArray::I8(vec![0; count]),
            ScalarType::U16 => ScalarArray::U16(vec![0; count]),
            ScalarType::I16 => ScalarArray::I16(vec![0; count]),
            ScalarType::U32 => ScalarArray::U32(vec![0; count]),
            ScalarType::I32 => ScalarArray::I32(vec![0; count]),
            ScalarType::U64 => ScalarArray::U64(vec![0; count]),
            ScalarType::I64 => ScalarArray::I64(vec![0; count]),
            ScalarType::F32 => ScalarArray::F32(vec![0.0; count]),
            ScalarType::F64 => ScalarArray::F64(vec![0.0; count]),
            ScalarType::String => ScalarArray::String(vec![String::new(); count]),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarArray::U8(_) => ScalarType::U8,
            ScalarArray::I8(_) => ScalarType::I8,
            ScalarArray::U16(_) => ScalarType::U16,
            ScalarArray::I16(_) => ScalarType::I16,
            ScalarArray::U32(_) => ScalarType::U32,
            ScalarArray::I32(_) => ScalarType::I32,
            ScalarArray::U64(_) => ScalarType::U64,
            ScalarArray::I64(_) => ScalarType::I64,
            ScalarArray::F32(_) => ScalarType::F32,
            ScalarArray::F64(_) => ScalarType::F64,
            ScalarArray::String(_) => ScalarType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScalarArray::U8(v) => v.len(),
            ScalarArray::I8(v) => v.len(),
            ScalarArray::U16(v) => v.len(),
            ScalarArray::I16(v) => v.len(),
            ScalarArray::U32(v) => v.len(),
            ScalarArray::I32(v) => v.len(),
            ScalarArray::U64(v) => v.len(),
            ScalarArray::I64(v) => v.len(),
            ScalarArray::F32(v) => v.len(),
            ScalarArray::F64(v) => v.len(),
            ScalarArray::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy items into `out`, converting to `T`
    ///
    /// Copies at most `out.len()` items and returns the number copied. Slots past the
    /// end of a shorter array are left untouched.
    pub fn copy_to<T: PvNumeric>(&self, out: &mut [T]) -> Result<usize, ConvertError> {
        let error = ConvertError {
            from: self.scalar_type(),
            to: T::SCALAR_TYPE,
        };
        match self {
            ScalarArray::U8(v) => try_convert_into(v, out, error),
            ScalarArray::I8(v) => try_convert_into(v, out, error),
            ScalarArray::U16(v) => try_convert_into(v, out, error),
            ScalarArray::I16(v) => try_convert_into(v, out, error),
            ScalarArray::U32(v) => try_convert_into(v, out, error),
            ScalarArray::I32(v) => try_convert_into(v, out, error),
            ScalarArray::U64(v) => try_convert_into(v, out, error),
            ScalarArray::I64(v) => try_convert_into(v, out, error),
            ScalarArray::F32(v) => try_convert_into(v, out, error),
            ScalarArray::F64(v) => try_convert_into(v, out, error),
            ScalarArray::String(v) => {
                let count = v.len().min(out.len());
                for (slot, s) in out.iter_mut().zip(v) {
                    *slot = s.trim().parse().map_err(|_| error)?;
                }
                Ok(count)
            }
        }
    }

    /// Read the whole array as `T`
    pub fn to_vec<T: PvNumeric>(&self) -> Result<Vec<T>, ConvertError> {
        let mut out = vec![T::default(); self.len()];
        self.copy_to(&mut out)?;
        Ok(out)
    }

    /// Replace the contents with `values`, keeping the existing element type
    pub fn assign<T: PvNumeric>(&mut self, values: &[T]) -> Result<(), ConvertError> {
        let error = ConvertError {
            from: T::SCALAR_TYPE,
            to: self.scalar_type(),
        };
        match self {
            ScalarArray::U8(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::I8(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::U16(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::I16(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::U32(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::I32(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::U64(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::I64(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::F32(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::F64(items) => *items = try_convert_vec(values, error)?,
            ScalarArray::String(items) => *items = values.iter().map(|v| v.to_string()).collect(),
        }
        Ok(())
    }
}

impl fmt::Display for ScalarArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|v| format!("{v}"))
                .collect::<Vec<String>>()
                .join(" ")
        }
        let joined = match self {
            ScalarArray::U8(v) => join(v),
            ScalarArray::I8(v) => join(v),
            ScalarArray::U16(v) => join(v),
            ScalarArray::I16(v) => join(v),
            ScalarArray::U32(v) => join(v),
            ScalarArray::I32(v) => join(v),
            ScalarArray::U64(v) => join(v),
            ScalarArray::I64(v) => join(v),
            ScalarArray::F32(v) => join(v),
            ScalarArray::F64(v) => join(v),
            ScalarArray::String(v) => join(v),
        };
        write!(f, "[{joined}]")
    }
}

/// The four kinds of node a PV value tree can contain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    ScalarArray,
    Structure,
    StructureArray,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldKind::Scalar => "scalar",
            FieldKind::ScalarArray => "scalar array",
            FieldKind::Structure => "structure",
            FieldKind::StructureArray => "structure array",
        })
    }
}

/// A node in a PV value tree
#[derive(Clone, Debug, PartialEq)]
pub enum PvField {
    Scalar(ScalarValue),
    ScalarArray(ScalarArray),
    Structure(PvStructure),
    StructureArray(Vec<PvStructure>),
}

impl PvField {
    pub fn kind(&self) -> FieldKind {
        match self {
            PvField::Scalar(_) => FieldKind::Scalar,
            PvField::ScalarArray(_) => FieldKind::ScalarArray,
            PvField::Structure(_) => FieldKind::Structure,
            PvField::StructureArray(_) => FieldKind::StructureArray,
        }
    }

    /// Is this a leaf (scalar or scalar array) node?
    pub fn is_leaf(&self) -> bool {
        matches!(self, PvField::Scalar(_) | PvField::ScalarArray(_))
    }

    /// Do two fields have the same kind, element type and (recursively) members?
    ///
    /// Array lengths are not part of the shape.
    pub fn same_shape(&self, other: &PvField) -> bool {
        match (self, other) {
            (PvField::Scalar(a), PvField::Scalar(b)) => a.scalar_type() == b.scalar_type(),
            (PvField::ScalarArray(a), PvField::ScalarArray(b)) => {
                a.scalar_type() == b.scalar_type()
            }
            (PvField::Structure(a), PvField::Structure(b)) => a.same_shape(b),
            (PvField::StructureArray(a), PvField::StructureArray(b)) => {
                a.iter().zip(b).all(|(x, y)| x.same_shape(y))
            }
            _ => false,
        }
    }
}

/// One step of a [`FieldPath`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Index of a member in a structure
    Field(usize),
    /// Index of an element in a structure array
    Element(usize),
}

/// Address of a node inside a [`PvStructure`], relative to the root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<PathStep>);

impl FieldPath {
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }
    /// A new path, one step deeper than this one
    pub fn child(&self, step: PathStep) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        FieldPath(steps)
    }
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }
}

/// Attempted to create a path through a node that is not a structure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' already exists and is not a structure")]
pub struct PathConflict(pub String);

/// A named, ordered collection of fields
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PvStructure {
    type_id: String,
    fields: Vec<(String, PvField)>,
}

impl PvStructure {
    pub fn new(type_id: impl Into<String>) -> Self {
        PvStructure {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style version of [`PvStructure::insert`]
    pub fn with(mut self, name: &str, value: impl Into<PvField>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add a member, or replace the value of an existing member with the same name
    pub fn insert(&mut self, name: &str, value: impl Into<PvField>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over the (name, field) members in order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &PvField)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn field(&self, name: &str) -> Option<&PvField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut PvField> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    /// Look up a node by dot-separated member names, e.g. `value.NodeA.Element1`
    ///
    /// Structure array elements cannot be addressed this way.
    pub fn lookup(&self, dotted: &str) -> Option<&PvField> {
        let mut parts = dotted.split('.');
        let mut field = self.field(parts.next()?)?;
        for part in parts {
            let PvField::Structure(inner) = field else {
                return None;
            };
            field = inner.field(part)?;
        }
        Some(field)
    }

    /// Insert a node at a dot-separated location, creating intermediate structures
    pub fn insert_path(
        &mut self,
        dotted: &str,
        value: impl Into<PvField>,
    ) -> Result<(), PathConflict> {
        match dotted.split_once('.') {
            None => {
                self.insert(dotted, value);
                Ok(())
            }
            Some((head, rest)) => {
                if self.field(head).is_none() {
                    self.insert(head, PvStructure::default());
                }
                match self.field_mut(head) {
                    Some(PvField::Structure(inner)) => inner.insert_path(rest, value),
                    _ => Err(PathConflict(head.to_string())),
                }
            }
        }
    }

    /// Fetch the node a [`FieldPath`] points to
    pub fn get(&self, path: &FieldPath) -> Option<&PvField> {
        fn get_in<'a>(structure: &'a PvStructure, steps: &[PathStep]) -> Option<&'a PvField> {
            let (step, rest) = steps.split_first()?;
            let PathStep::Field(index) = step else {
                return None;
            };
            let field = &structure.fields.get(*index)?.1;
            match (field, rest.split_first()) {
                (_, None) => Some(field),
                (PvField::Structure(inner), Some(_)) => get_in(inner, rest),
                (PvField::StructureArray(elements), Some((PathStep::Element(e), rest))) => {
                    get_in(elements.get(*e)?, rest)
                }
                _ => None,
            }
        }
        get_in(self, path.steps())
    }

    /// Fetch a mutable reference to the node a [`FieldPath`] points to
    pub fn get_mut(&mut self, path: &FieldPath) -> Option<&mut PvField> {
        fn get_in<'a>(
            structure: &'a mut PvStructure,
            steps: &[PathStep],
        ) -> Option<&'a mut PvField> {
            let (step, rest) = steps.split_first()?;
            let PathStep::Field(index) = step else {
                return None;
            };
            let field = &mut structure.fields.get_mut(*index)?.1;
            match (field, rest.split_first()) {
                (field, None) => Some(field),
                (PvField::Structure(inner), Some(_)) => get_in(inner, rest),
                (PvField::StructureArray(elements), Some((PathStep::Element(e), rest))) => {
                    get_in(elements.get_mut(*e)?, rest)
                }
                _ => None,
            }
        }
        get_in(self, path.steps())
    }

    /// Do both structures have the same members, in the same order, of the same shape?
    pub fn same_shape(&self, other: &PvStructure) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|((na, a), (nb, b))| na == nb && a.same_shape(b))
    }
}

/// Implement From<datatype> for a specific scalar kind
macro_rules! impl_field_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for ScalarValue {
            fn from(value: $typ) -> Self {
                ScalarValue::$variant(value)
            }
        }
        impl From<Vec<$typ>> for ScalarArray {
            fn from(value: Vec<$typ>) -> Self {
                ScalarArray::$variant(value)
            }
        }
        impl From<$typ> for PvField {
            fn from(value: $typ) -> Self {
                PvField::Scalar(ScalarValue::$variant(value))
            }
        }
        impl From<Vec<$typ>> for PvField {
            fn from(value: Vec<$typ>) -> Self {
                PvField::ScalarArray(ScalarArray::$variant(value))
            }
        }
    };
}
impl_field_conversions_between!(U8, u8);
impl_field_conversions_between!(I8, i8);
impl_field_conversions_between!(U16, u16);
impl_field_conversions_between!(I16, i16);
impl_field_conversions_between!(U32, u32);
impl_field_conversions_between!(I32, i32);
impl_field_conversions_between!(U64, u64);
impl_field_conversions_between!(I64, i64);
impl_field_conversions_between!(F32, f32);
impl_field_conversions_between!(F64, f64);
impl_field_conversions_between!(String, String);

impl From<&str> for PvField {
    fn from(value: &str) -> Self {
        PvField::Scalar(ScalarValue::String(value.to_string()))
    }
}
impl From<ScalarValue> for PvField {
    fn from(value: ScalarValue) -> Self {
        PvField::Scalar(value)
    }
}
impl From<ScalarArray> for PvField {
    fn from(value: ScalarArray) -> Self {
        PvField::ScalarArray(value)
    }
}
impl From<PvStructure> for PvField {
    fn from(value: PvStructure) -> Self {
        PvField::Structure(value)
    }
}
impl From<Vec<PvStructure>> for PvField {
    fn from(value: Vec<PvStructure>) -> Self {
        PvField::StructureArray(value)
    }
}
