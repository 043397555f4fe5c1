//! Heap snapshot of the compiling process.
//!
//! Objects are identified by their process address. The serializer only
//! ever reads through [`HeapView`]; [`HeapImage`] is the in-memory snapshot
//! produced by the textual front end and by tests.

use std::collections::BTreeMap;
use std::fmt;

/// Process address of a heap object.
pub type Address = u64;

/// Primitive scalar kinds with a fixed-size bit representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    Float64,
    Bool,
    Char,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 8] = [
        ScalarKind::Int8,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::UInt8,
        ScalarKind::Float64,
        ScalarKind::Bool,
        ScalarKind::Char,
    ];

    /// Numeric tag passed to the runtime reconstruction primitives.
    pub fn code(self) -> i64 {
        match self {
            ScalarKind::Int8 => 1,
            ScalarKind::Int16 => 2,
            ScalarKind::Int32 => 3,
            ScalarKind::Int64 => 4,
            ScalarKind::UInt8 => 5,
            ScalarKind::Float64 => 6,
            ScalarKind::Bool => 7,
            ScalarKind::Char => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        ScalarKind::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Storage size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Int8 | ScalarKind::UInt8 | ScalarKind::Bool => 1,
            ScalarKind::Int16 => 2,
            ScalarKind::Int32 | ScalarKind::Char => 4,
            ScalarKind::Int64 | ScalarKind::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Int8 => "i8",
            ScalarKind::Int16 => "i16",
            ScalarKind::Int32 => "i32",
            ScalarKind::Int64 => "i64",
            ScalarKind::UInt8 => "u8",
            ScalarKind::Float64 => "f64",
            ScalarKind::Bool => "bool",
            ScalarKind::Char => "char",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ScalarKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// A primitive value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    Float64(f64),
    Bool(bool),
    Char(char),
}

impl Scalar {
    pub fn kind(self) -> ScalarKind {
        match self {
            Scalar::Int8(_) => ScalarKind::Int8,
            Scalar::Int16(_) => ScalarKind::Int16,
            Scalar::Int32(_) => ScalarKind::Int32,
            Scalar::Int64(_) => ScalarKind::Int64,
            Scalar::UInt8(_) => ScalarKind::UInt8,
            Scalar::Float64(_) => ScalarKind::Float64,
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Char(_) => ScalarKind::Char,
        }
    }

    /// Raw bits, zero-extended to 64 bits.
    pub fn to_bits(self) -> u64 {
        match self {
            Scalar::Int8(v) => v as u8 as u64,
            Scalar::Int16(v) => v as u16 as u64,
            Scalar::Int32(v) => v as u32 as u64,
            Scalar::Int64(v) => v as u64,
            Scalar::UInt8(v) => v as u64,
            Scalar::Float64(v) => v.to_bits(),
            Scalar::Bool(v) => v as u64,
            Scalar::Char(v) => v as u64,
        }
    }

    /// Inverse of [`Scalar::to_bits`]. Returns `None` for an invalid `char`.
    pub fn from_bits(kind: ScalarKind, bits: u64) -> Option<Scalar> {
        Some(match kind {
            ScalarKind::Int8 => Scalar::Int8(bits as u8 as i8),
            ScalarKind::Int16 => Scalar::Int16(bits as u16 as i16),
            ScalarKind::Int32 => Scalar::Int32(bits as u32 as i32),
            ScalarKind::Int64 => Scalar::Int64(bits as i64),
            ScalarKind::UInt8 => Scalar::UInt8(bits as u8),
            ScalarKind::Float64 => Scalar::Float64(f64::from_bits(bits)),
            ScalarKind::Bool => Scalar::Bool(bits & 1 != 0),
            ScalarKind::Char => Scalar::Char(char::from_u32(bits as u32)?),
        })
    }

    /// Little-endian element bytes, `kind().size()` long.
    pub fn to_le_bytes(self) -> Vec<u8> {
        self.to_bits().to_le_bytes()[..self.kind().size()].to_vec()
    }

    /// Bitwise equality, so NaN payloads and signed zeros compare exactly.
    pub fn bit_eq(self, other: Scalar) -> bool {
        self.kind() == other.kind() && self.to_bits() == other.to_bits()
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int8(v) => write!(f, "i8 {v}"),
            Scalar::Int16(v) => write!(f, "i16 {v}"),
            Scalar::Int32(v) => write!(f, "i32 {v}"),
            Scalar::Int64(v) => write!(f, "i64 {v}"),
            Scalar::UInt8(v) => write!(f, "u8 {v}"),
            Scalar::Float64(v) => write!(f, "f64 {v:?}"),
            Scalar::Bool(v) => write!(f, "bool {v}"),
            Scalar::Char(v) => write!(f, "char {:#x}", *v as u32),
        }
    }
}

/// Process-wide singletons provided by the runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SingletonKind {
    Nothing,
    EmptyTuple,
    EmptyString,
    Missing,
}

impl SingletonKind {
    pub const ALL: [SingletonKind; 4] = [
        SingletonKind::Nothing,
        SingletonKind::EmptyTuple,
        SingletonKind::EmptyString,
        SingletonKind::Missing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SingletonKind::Nothing => "nothing",
            SingletonKind::EmptyTuple => "empty_tuple",
            SingletonKind::EmptyString => "empty_string",
            SingletonKind::Missing => "missing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SingletonKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// Tag identifying a registered extension encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionKind(pub u32);

/// One field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Scalar(Scalar),
    /// Reference to another object; `None` is an undefined reference.
    Ref(Option<Address>),
}

/// A heap object as seen by the serializer.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapValue {
    /// A boxed primitive.
    Scalar(Scalar),
    /// Immutable UTF-8 text.
    Text(String),
    /// Array of primitive elements stored inline.
    RawArray {
        elem: ScalarKind,
        dims: Vec<u64>,
        /// Little-endian element bytes, `product(dims) * elem.size()` long.
        data: Vec<u8>,
    },
    /// Array of references; `None` entries are unassigned.
    BoxedArray {
        elem_type: Option<Address>,
        dims: Vec<u64>,
        elements: Vec<Option<Address>>,
    },
    /// Fixed-layout record; `ty` points at its type descriptor.
    Record {
        ty: Option<Address>,
        fields: Vec<Field>,
    },
    TypeDescriptor {
        name: String,
        params: Vec<Address>,
    },
    /// Interned symbol.
    Symbol(String),
    Singleton(SingletonKind),
    /// An object the serializer has no encoding for (tasks, pointers into
    /// foreign memory, ...).
    Opaque { type_name: String },
    /// Object whose encoding is supplied by a registered encoder.
    Extension {
        kind: ExtensionKind,
        payload: Vec<u8>,
        children: Vec<Address>,
    },
}

impl HeapValue {
    /// Human-readable variant name for diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            HeapValue::Scalar(s) => s.kind().name().to_string(),
            HeapValue::Text(_) => "text".into(),
            HeapValue::RawArray { elem, .. } => format!("array<{}>", elem.name()),
            HeapValue::BoxedArray { .. } => "array<ref>".into(),
            HeapValue::Record { .. } => "record".into(),
            HeapValue::TypeDescriptor { name, .. } => format!("type {name}"),
            HeapValue::Symbol(_) => "symbol".into(),
            HeapValue::Singleton(kind) => kind.name().into(),
            HeapValue::Opaque { type_name } => type_name.clone(),
            HeapValue::Extension { kind, .. } => format!("extension#{}", kind.0),
        }
    }
}

/// Read access to the compiling process's heap.
pub trait HeapView {
    fn object(&self, address: Address) -> Option<&HeapValue>;

    fn contains(&self, address: Address) -> bool {
        self.object(address).is_some()
    }
}

/// An ordered in-memory heap snapshot.
#[derive(Debug, Clone, Default)]
pub struct HeapImage {
    objects: BTreeMap<Address, HeapValue>,
}

impl HeapImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, value: HeapValue) {
        self.objects.insert(address, value);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &HeapValue)> {
        self.objects.iter().map(|(&addr, value)| (addr, value))
    }

    /// Merge another snapshot; existing addresses keep their value.
    pub fn merge(&mut self, other: HeapImage) {
        for (address, value) in other.objects {
            self.objects.entry(address).or_insert(value);
        }
    }
}

impl HeapView for HeapImage {
    fn object(&self, address: Address) -> Option<&HeapValue> {
        self.objects.get(&address)
    }
}
