// This module implements the object serializer. Given the address of a heap object baked into
// the IR, it produces (a) bytes appended to the read-only blob and (b) an ordered list of
// runtime calls that rebuild the object at load time, returning an expression that evaluates
// to the rebuilt object. Dispatch is type-directed over the closed set of HeapValue variants;
// extension variants go through the EncoderRegistry. Every object identity is memoized, so a
// second reference to the same address reuses the first construction. Records and boxed
// arrays are registered in the memo as soon as their empty shell exists; their reference
// fields and elements are queued on an explicit stack and filled in after the shell, which
// makes self-references and cycles work and keeps long object chains off the call stack.
// Type descriptors must be complete before they can be constructed, so a cycle through a
// descriptor's parameters is reported as an unsupported construct.

//! Object serializer.

pub mod context;
pub mod registry;

pub use context::{Blob, BlobWrite, Expr, InitStmt, LocalId, Memo, SerializeContext, BLOB_ALIGN};
pub use registry::{EncoderRegistry, ExtensionEncoder, ExtensionObject};

use crate::core::error::{CompileError, CompileResult, Location};
use crate::fixup::BlobRef;
use crate::frontend::{Address, Field, HeapValue, HeapView};
use crate::runtime::abi::Routine;

/// One edge of the object graph walked from the current root.
struct Step {
    parent: Option<usize>,
    label: String,
}

/// A reference slot of an already constructed shell, filled once its target
/// has been serialized.
struct Deferred {
    routine: Routine,
    container: Expr,
    index: usize,
    target: Address,
    step: usize,
}

/// Type-directed, memoizing heap object serializer.
pub struct Serializer<'a> {
    heap: &'a dyn HeapView,
    encoders: &'a EncoderRegistry,
    ctx: SerializeContext,
    /// Edges walked from the current root; `at` is the edge being serialized.
    trail: Vec<Step>,
    at: Option<usize>,
    pending: Vec<Deferred>,
    location: Location,
}

impl<'a> Serializer<'a> {
    pub fn new(heap: &'a dyn HeapView, encoders: &'a EncoderRegistry) -> Self {
        Self {
            heap,
            encoders,
            ctx: SerializeContext::new(),
            trail: Vec::new(),
            at: None,
            pending: Vec::new(),
            location: Location::default(),
        }
    }

    /// Use site reported in errors for the next root.
    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    /// Serialize the object at `address` as a root reference from the IR.
    pub fn serialize(&mut self, address: Address) -> CompileResult<Expr> {
        self.trail.clear();
        self.pending.clear();
        self.at = Some(self.step(None, format!("{address:#x}")));
        let expr = self.serialize_address(address)?;

        while let Some(deferred) = self.pending.pop() {
            self.at = Some(deferred.step);
            let value = self.serialize_address(deferred.target)?;
            self.emit_void(
                deferred.routine,
                vec![deferred.container, Expr::Int(deferred.index as i64), value],
            );
        }
        self.at = None;
        Ok(expr)
    }

    /// Serialize a child object; `label` names the edge in error paths.
    ///
    /// The returned expression is usable right away. Reference fields of
    /// records and arrays reached through it are filled in before the root's
    /// [`serialize`](Self::serialize) returns.
    pub fn serialize_child(&mut self, label: impl Into<String>, address: Address) -> CompileResult<Expr> {
        let parent = self.at;
        self.at = Some(self.step(parent, label.into()));
        let expr = self.serialize_address(address);
        self.at = parent;
        expr
    }

    /// Memoize `address` early so references reached while serializing its
    /// children resolve to `expr`.
    pub fn register(&mut self, address: Address, expr: Expr) {
        self.ctx.set_memo(address, Memo::Done(expr));
    }

    pub fn heap(&self) -> &'a dyn HeapView {
        self.heap
    }

    pub fn blob_mut(&mut self) -> &mut Blob {
        &mut self.ctx.blob
    }

    pub fn context(&self) -> &SerializeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SerializeContext {
        &mut self.ctx
    }

    pub fn into_context(self) -> SerializeContext {
        self.ctx
    }

    /// How the relocation table describes the object at `address`.
    pub fn payload_of(&self, address: Address) -> BlobRef {
        if let Some(offset) = self.ctx.payload_offset(address) {
            return BlobRef::Offset(offset);
        }
        match self.ctx.memo(address) {
            Some(Memo::Done(Expr::Local(local))) => BlobRef::Expr(
                self.ctx
                    .defining_stmt(local)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            ),
            Some(Memo::Done(expr)) => BlobRef::Expr(expr.to_string()),
            _ => BlobRef::Expr(String::new()),
        }
    }

    fn step(&mut self, parent: Option<usize>, label: String) -> usize {
        self.trail.push(Step { parent, label });
        self.trail.len() - 1
    }

    /// Queue `container[index] = target`. Children are popped in field order.
    fn defer(&mut self, routine: Routine, container: Expr, children: Vec<(usize, Address, String)>) {
        let parent = self.at;
        for (index, target, label) in children.into_iter().rev() {
            let step = self.step(parent, label);
            self.pending.push(Deferred {
                routine,
                container,
                index,
                target,
                step,
            });
        }
    }

    fn path(&self) -> String {
        let mut labels = Vec::new();
        let mut at = self.at;
        while let Some(index) = at {
            labels.push(self.trail[index].label.as_str());
            at = self.trail[index].parent;
        }
        labels.reverse();
        labels.join(" -> ")
    }

    fn unsupported(&self, what: impl Into<String>) -> CompileError {
        CompileError::unsupported(
            format!("{} (path: {})", what.into(), self.path()),
            self.location.clone(),
        )
    }

    fn serialize_address(&mut self, address: Address) -> CompileResult<Expr> {
        match self.ctx.memo(address) {
            Some(Memo::Done(expr)) => return Ok(expr),
            Some(Memo::InProgress) => {
                return Err(self.unsupported(format!(
                    "reference cycle through type descriptor at {address:#x}"
                )))
            }
            None => {}
        }

        let heap = self.heap;
        let value = heap
            .object(address)
            .ok_or_else(|| self.unsupported(format!("dangling reference to {address:#x}")))?;

        self.ctx.set_memo(address, Memo::InProgress);
        let expr = self.serialize_value(address, value)?;
        self.ctx.set_memo(address, Memo::Done(expr));
        Ok(expr)
    }

    fn emit(&mut self, routine: Routine, args: Vec<Expr>) -> CompileResult<Expr> {
        self.ctx
            .emit(routine, args)
            .ok_or_else(|| self.unsupported(format!("{} has no result", routine.name())))
    }

    fn emit_void(&mut self, routine: Routine, args: Vec<Expr>) {
        self.ctx.emit(routine, args);
    }

    fn serialize_value(&mut self, address: Address, value: &'a HeapValue) -> CompileResult<Expr> {
        log::trace!("serialize {address:#x}: {}", value.type_name());
        match value {
            HeapValue::Scalar(scalar) => self.emit(
                Routine::Box,
                vec![
                    Expr::Int(scalar.kind().code()),
                    Expr::Int(scalar.to_bits() as i64),
                ],
            ),

            HeapValue::Text(text) => {
                let offset = self.ctx.blob.write_bytes(text.as_bytes());
                self.ctx.note_payload(address, offset);
                self.emit(
                    Routine::TextView,
                    vec![Expr::Blob(offset), Expr::Int(text.len() as i64)],
                )
            }

            HeapValue::RawArray { elem, dims, data } => {
                let data_offset = self.ctx.blob.write_bytes(data);
                self.ctx.note_payload(address, data_offset);
                let dims_offset = self.ctx.blob.write_words(dims);
                self.emit(
                    Routine::AdoptArray,
                    vec![
                        Expr::Blob(data_offset),
                        Expr::Int(elem.code()),
                        Expr::Blob(dims_offset),
                        Expr::Int(dims.len() as i64),
                    ],
                )
            }

            HeapValue::BoxedArray {
                elem_type,
                dims,
                elements,
            } => {
                let elem_type = match elem_type {
                    Some(ty) => self.serialize_child("element type", *ty)?,
                    None => Expr::Null,
                };
                let dims_offset = self.ctx.blob.write_words(dims);
                self.ctx.note_payload(address, dims_offset);
                let array = self.emit(
                    Routine::NewArray,
                    vec![elem_type, Expr::Blob(dims_offset), Expr::Int(dims.len() as i64)],
                )?;
                self.register(address, array);
                // Unassigned entries stay unassigned in the rebuilt array.
                let children = elements
                    .iter()
                    .enumerate()
                    .filter_map(|(index, &element)| {
                        element.map(|target| (index, target, format!("element {index}")))
                    })
                    .collect();
                self.defer(Routine::ArraySet, array, children);
                Ok(array)
            }

            HeapValue::Record { ty, fields } => {
                if fields.len() > 64 {
                    return Err(self.unsupported(format!(
                        "record with {} fields (at most 64)",
                        fields.len()
                    )));
                }
                let desc = match ty {
                    Some(ty) => self.serialize_child("type", *ty)?,
                    None => Expr::Null,
                };
                let mut image = Vec::with_capacity(fields.len());
                let mut refmask = 0u64;
                for (index, field) in fields.iter().enumerate() {
                    match field {
                        Field::Scalar(scalar) => image.push(scalar.to_bits()),
                        Field::Ref(_) => {
                            image.push(0);
                            refmask |= 1 << index;
                        }
                    }
                }
                let image_offset = self.ctx.blob.write_words(&image);
                self.ctx.note_payload(address, image_offset);
                let record = self.emit(
                    Routine::NewRecord,
                    vec![
                        desc,
                        Expr::Blob(image_offset),
                        Expr::Int(fields.len() as i64),
                        Expr::Int(refmask as i64),
                    ],
                )?;
                self.register(address, record);
                let children = fields
                    .iter()
                    .enumerate()
                    .filter_map(|(index, field)| match field {
                        Field::Ref(Some(target)) => Some((index, *target, format!("field {index}"))),
                        _ => None,
                    })
                    .collect();
                self.defer(Routine::RecordSet, record, children);
                Ok(record)
            }

            HeapValue::TypeDescriptor { name, params } => {
                let mut param_exprs = Vec::with_capacity(params.len());
                for (index, param) in params.iter().enumerate() {
                    param_exprs.push(self.serialize_child(format!("param {index}"), *param)?);
                }
                let offset = self.ctx.blob.write_bytes(name.as_bytes());
                self.ctx.note_payload(address, offset);
                let desc = self.emit(
                    Routine::NewDescriptor,
                    vec![
                        Expr::Blob(offset),
                        Expr::Int(name.len() as i64),
                        Expr::Int(params.len() as i64),
                    ],
                )?;
                for (index, param) in param_exprs.into_iter().enumerate() {
                    self.emit_void(
                        Routine::DescriptorSetParam,
                        vec![desc, Expr::Int(index as i64), param],
                    );
                }
                Ok(desc)
            }

            HeapValue::Symbol(name) => {
                let offset = self.ctx.blob.write_bytes(name.as_bytes());
                self.ctx.note_payload(address, offset);
                self.emit(
                    Routine::InternSymbol,
                    vec![Expr::Blob(offset), Expr::Int(name.len() as i64)],
                )
            }

            HeapValue::Singleton(kind) => Ok(Expr::Singleton(*kind)),

            HeapValue::Opaque { type_name } => Err(self.unsupported(format!(
                "cannot serialize object of type {type_name}"
            ))),

            HeapValue::Extension {
                kind,
                payload,
                children,
            } => {
                let encoders = self.encoders;
                let encoder = encoders.get(*kind).ok_or_else(|| {
                    self.unsupported(format!("no encoder registered for extension kind {}", kind.0))
                })?;
                encoder.encode(
                    self,
                    ExtensionObject {
                        address,
                        kind: *kind,
                        payload,
                        children,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{ExtensionKind, HeapImage, Scalar, ScalarKind, SingletonKind};
    use crate::ir::Type;

    fn serialize_one(heap: &HeapImage, root: Address) -> CompileResult<(Expr, SerializeContext)> {
        let registry = EncoderRegistry::new();
        let mut ser = Serializer::new(heap, &registry);
        let expr = ser.serialize(root)?;
        Ok((expr, ser.into_context()))
    }

    #[test]
    fn record_image_then_aligned_text() {
        let mut heap = HeapImage::new();
        heap.insert(0x2000, HeapValue::Text("hi".into()));
        heap.insert(
            0x1000,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Scalar(Scalar::Int64(1)), Field::Ref(Some(0x2000))],
            },
        );
        let (root, ctx) = serialize_one(&heap, 0x1000).unwrap();
        assert_eq!(root, Expr::Local(LocalId(0)));

        let blob = ctx.blob.as_bytes();
        assert_eq!(&blob[0..8], &1u64.to_le_bytes());
        assert_eq!(&blob[8..16], &0u64.to_le_bytes());
        assert_eq!(&blob[16..18], b"hi");

        let text: Vec<String> = ctx.stmts().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "%t0 = rt_new_record(null, blob+0, 2, 2)",
                "%t1 = rt_text_view(blob+16, 2)",
                "rt_record_set(%t0, 1, %t1)",
            ]
        );
    }

    #[test]
    fn self_reference_resolves_to_the_record() {
        let mut heap = HeapImage::new();
        heap.insert(
            0x1000,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(0x1000))],
            },
        );
        let (_, ctx) = serialize_one(&heap, 0x1000).unwrap();
        assert_eq!(ctx.stmts()[1].to_string(), "rt_record_set(%t0, 0, %t0)");
    }

    #[test]
    fn shared_objects_are_serialized_once() {
        let mut heap = HeapImage::new();
        heap.insert(
            0x3000,
            HeapValue::RawArray {
                elem: ScalarKind::Int64,
                dims: vec![2],
                data: [7u64.to_le_bytes(), 9u64.to_le_bytes()].concat(),
            },
        );
        heap.insert(
            0x1000,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(0x3000)), Field::Ref(Some(0x3000))],
            },
        );
        let (_, ctx) = serialize_one(&heap, 0x1000).unwrap();
        let adopts = ctx
            .stmts()
            .iter()
            .filter(|s| s.routine == Routine::AdoptArray.name())
            .count();
        assert_eq!(adopts, 1);
        assert_eq!(ctx.stmts()[2].args[2], Expr::Local(LocalId(1)));
        assert_eq!(ctx.stmts()[3].args[2], Expr::Local(LocalId(1)));
    }

    #[test]
    fn long_record_chains_do_not_recurse() {
        let mut heap = HeapImage::new();
        let length = 50_000u64;
        for n in 0..length {
            let next = if n + 1 < length { Some(0x1_0000 + (n + 1) * 0x10) } else { None };
            heap.insert(
                0x1_0000 + n * 0x10,
                HeapValue::Record {
                    ty: None,
                    fields: vec![Field::Scalar(Scalar::Int64(n as i64)), Field::Ref(next)],
                },
            );
        }
        let (root, ctx) = serialize_one(&heap, 0x1_0000).unwrap();
        assert_eq!(root, Expr::Local(LocalId(0)));
        let records = ctx
            .stmts()
            .iter()
            .filter(|s| s.routine == Routine::NewRecord.name())
            .count();
        let links = ctx
            .stmts()
            .iter()
            .filter(|s| s.routine == Routine::RecordSet.name())
            .count();
        assert_eq!(records, length as usize);
        assert_eq!(links, length as usize - 1);
    }

    #[test]
    fn error_path_follows_deferred_fields() {
        let mut heap = HeapImage::new();
        heap.insert(0x40, HeapValue::Opaque { type_name: "Task".into() });
        heap.insert(
            0x30,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(None), Field::Ref(Some(0x40))],
            },
        );
        heap.insert(
            0x20,
            HeapValue::Record {
                ty: None,
                fields: vec![Field::Ref(Some(0x30))],
            },
        );
        let err = serialize_one(&heap, 0x20).unwrap_err();
        assert!(err.to_string().contains("0x20 -> field 0 -> field 1"), "{err}");
    }

    #[test]
    fn descriptor_cycle_is_rejected() {
        let mut heap = HeapImage::new();
        heap.insert(
            0x10,
            HeapValue::TypeDescriptor {
                name: "A".into(),
                params: vec![0x20],
            },
        );
        heap.insert(
            0x20,
            HeapValue::TypeDescriptor {
                name: "B".into(),
                params: vec![0x10],
            },
        );
        let err = serialize_one(&heap, 0x10).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cycle"), "{text}");
        assert!(text.contains("0x10 -> param 0 -> param 0"), "{text}");
    }

    #[test]
    fn opaque_objects_name_their_type_and_path() {
        let mut heap = HeapImage::new();
        heap.insert(0x40, HeapValue::Opaque { type_name: "Task".into() });
        heap.insert(
            0x50,
            HeapValue::BoxedArray {
                elem_type: None,
                dims: vec![2],
                elements: vec![None, Some(0x40)],
            },
        );
        let err = serialize_one(&heap, 0x50).unwrap_err();
        match err {
            CompileError::UnsupportedConstruct { what, .. } => {
                assert!(what.contains("Task"));
                assert!(what.contains("element 1"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn singletons_are_never_serialized() {
        let mut heap = HeapImage::new();
        heap.insert(0x60, HeapValue::Singleton(SingletonKind::Missing));
        let (expr, ctx) = serialize_one(&heap, 0x60).unwrap();
        assert_eq!(expr, Expr::Singleton(SingletonKind::Missing));
        assert!(ctx.stmts().is_empty());
        assert!(ctx.blob.is_empty());
    }

    struct TaggedBytes;

    impl ExtensionEncoder for TaggedBytes {
        fn name(&self) -> &str {
            "tagged-bytes"
        }

        fn encode(&self, ser: &mut Serializer<'_>, object: ExtensionObject<'_>) -> CompileResult<Expr> {
            let offset = ser.blob_mut().write_bytes(object.payload);
            let made = ser
                .context_mut()
                .emit_named(
                    "ext_new",
                    vec![Type::PTR, Type::I64],
                    Type::PTR,
                    vec![Expr::Blob(offset), Expr::Int(object.payload.len() as i64)],
                )
                .unwrap();
            ser.register(object.address, made);
            for (index, &child) in object.children.iter().enumerate() {
                let value = ser.serialize_child(format!("child {index}"), child)?;
                ser.context_mut().emit_named(
                    "ext_set",
                    vec![Type::PTR, Type::PTR],
                    Type::Void,
                    vec![made, value],
                );
            }
            Ok(made)
        }
    }

    #[test]
    fn extensions_dispatch_by_registered_kind() {
        let mut heap = HeapImage::new();
        heap.insert(
            0x70,
            HeapValue::Extension {
                kind: ExtensionKind(9),
                payload: vec![1, 2, 3],
                children: vec![0x70],
            },
        );

        let empty = EncoderRegistry::new();
        let err = Serializer::new(&heap, &empty).serialize(0x70).unwrap_err();
        assert!(err.to_string().contains("extension kind 9"));

        let mut registry = EncoderRegistry::new();
        registry.register(ExtensionKind(9), Box::new(TaggedBytes));
        let mut ser = Serializer::new(&heap, &registry);
        let expr = ser.serialize(0x70).unwrap();
        let stmts = ser.context().stmts();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].args, vec![expr, expr]);
    }
}
