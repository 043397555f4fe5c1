//! Runtime library ABI.
//!
//! Every routine takes 64-bit integers or pointers. The compiler only needs
//! names and signatures; [`crate::runtime::machine`] provides a reference
//! implementation for tests.

use crate::frontend::SingletonKind;
use crate::ir::Type;

/// Routines of the freestanding runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Routine {
    /// `rt_throw(ptr exception) -> !`
    Throw,
    /// `rt_alloc(i64 size) -> ptr`
    Alloc,
    /// `rt_report_oom(i64 size)`
    ReportOom,
    /// `rt_box(i64 kind, i64 bits) -> ptr`
    Box,
    /// `rt_text_view(ptr data, i64 len) -> ptr`
    TextView,
    /// `rt_adopt_array(ptr data, i64 elem_kind, ptr dims, i64 ndims) -> ptr`
    AdoptArray,
    /// `rt_new_array(ptr elem_type, ptr dims, i64 ndims) -> ptr`
    NewArray,
    /// `rt_array_set(ptr array, i64 index, ptr value)`
    ArraySet,
    /// `rt_new_record(ptr desc, ptr image, i64 nfields, i64 refmask) -> ptr`
    NewRecord,
    /// `rt_record_set(ptr record, i64 field, ptr value)`
    RecordSet,
    /// `rt_new_descriptor(ptr name, i64 len, i64 nparams) -> ptr`
    NewDescriptor,
    /// `rt_descriptor_set_param(ptr desc, i64 index, ptr param)`
    DescriptorSetParam,
    /// `rt_intern_symbol(ptr name, i64 len) -> ptr`
    InternSymbol,
}

impl Routine {
    pub const ALL: [Routine; 13] = [
        Routine::Throw,
        Routine::Alloc,
        Routine::ReportOom,
        Routine::Box,
        Routine::TextView,
        Routine::AdoptArray,
        Routine::NewArray,
        Routine::ArraySet,
        Routine::NewRecord,
        Routine::RecordSet,
        Routine::NewDescriptor,
        Routine::DescriptorSetParam,
        Routine::InternSymbol,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Routine::Throw => "rt_throw",
            Routine::Alloc => "rt_alloc",
            Routine::ReportOom => "rt_report_oom",
            Routine::Box => "rt_box",
            Routine::TextView => "rt_text_view",
            Routine::AdoptArray => "rt_adopt_array",
            Routine::NewArray => "rt_new_array",
            Routine::ArraySet => "rt_array_set",
            Routine::NewRecord => "rt_new_record",
            Routine::RecordSet => "rt_record_set",
            Routine::NewDescriptor => "rt_new_descriptor",
            Routine::DescriptorSetParam => "rt_descriptor_set_param",
            Routine::InternSymbol => "rt_intern_symbol",
        }
    }

    pub fn from_name(name: &str) -> Option<Routine> {
        Routine::ALL.into_iter().find(|r| r.name() == name)
    }

    pub fn params(self) -> &'static [Type] {
        const P: Type = Type::PTR;
        const I: Type = Type::I64;
        match self {
            Routine::Throw => &[P],
            Routine::Alloc | Routine::ReportOom => &[I],
            Routine::Box => &[I, I],
            Routine::TextView | Routine::InternSymbol => &[P, I],
            Routine::AdoptArray => &[P, I, P, I],
            Routine::NewArray => &[P, P, I],
            Routine::ArraySet | Routine::RecordSet | Routine::DescriptorSetParam => &[P, I, P],
            Routine::NewRecord => &[P, P, I, I],
            Routine::NewDescriptor => &[P, I, I],
        }
    }

    pub fn ret(self) -> Type {
        match self {
            Routine::Throw
            | Routine::ReportOom
            | Routine::ArraySet
            | Routine::RecordSet
            | Routine::DescriptorSetParam => Type::Void,
            _ => Type::PTR,
        }
    }
}

/// Runtime global holding a singleton object.
pub fn singleton_global(kind: SingletonKind) -> &'static str {
    match kind {
        SingletonKind::Nothing => "rt_nothing",
        SingletonKind::EmptyTuple => "rt_empty_tuple",
        SingletonKind::EmptyString => "rt_empty_string",
        SingletonKind::Missing => "rt_missing",
    }
}

/// Runtime routines that generated code never calls directly but the
/// relocation pass may bind through aliases.
pub const TASK_STATE: &str = "rt_task_state";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for routine in Routine::ALL {
            assert_eq!(Routine::from_name(routine.name()), Some(routine));
            assert!(routine.name().starts_with("rt_"));
        }
    }

    #[test]
    fn singletons_have_distinct_globals() {
        let names: std::collections::BTreeSet<_> =
            SingletonKind::ALL.iter().map(|&k| singleton_global(k)).collect();
        assert_eq!(names.len(), SingletonKind::ALL.len());
    }
}
