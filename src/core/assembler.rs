// This module writes relocatable ELF x86-64 objects with the object crate. ElfAssembler
// receives the machine code of every compiled function and the module's globals, places them
// in .text, .rodata, .data.rel.ro, .data and .bss, and turns every code fixup and data
// relocation into an ELF relocation against the referenced symbol. Symbols are created in two
// phases: every function and global first gets a SymbolId, so that forward references
// resolve, and definitions are attached afterwards. Internal definitions become local
// symbols, external definitions global ones, and declarations stay undefined for the
// runtime library or the host program to provide.

//! ELF object emission.

use object::write::{Object, Relocation, SectionId, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use crate::core::error::{CompileError, CompileResult, Location};
use crate::ir::{FuncId, GlobalKind, Linkage, Module, Operand};
use crate::x64::{EncodedFunction, FixupKind, FixupTarget};

/// Alignment of function entry points.
const FUNCTION_ALIGN: u64 = 16;

/// Builds one relocatable object from a compiled module.
pub struct ElfAssembler<'m> {
    module: &'m Module,
    object: Object<'static>,
    func_symbols: Vec<SymbolId>,
    global_symbols: Vec<SymbolId>,
}

fn scope(linkage: Linkage) -> SymbolScope {
    match linkage {
        Linkage::Internal => SymbolScope::Compilation,
        Linkage::External => SymbolScope::Dynamic,
    }
}

impl<'m> ElfAssembler<'m> {
    /// Create the object and a symbol for every function and global.
    pub fn new(module: &'m Module) -> Self {
        let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        object.add_file_symbol(module.name.as_bytes().to_vec());

        let func_symbols = module
            .functions
            .iter()
            .map(|function| {
                let defined = !function.is_declaration();
                object.add_symbol(Symbol {
                    name: function.name.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind: if defined { SymbolKind::Text } else { SymbolKind::Unknown },
                    scope: if defined { scope(function.linkage) } else { SymbolScope::Unknown },
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                })
            })
            .collect();
        let global_symbols = module
            .globals
            .iter()
            .map(|global| {
                let defined = !global.is_extern();
                object.add_symbol(Symbol {
                    name: global.name.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind: if defined { SymbolKind::Data } else { SymbolKind::Unknown },
                    scope: if defined { scope(global.linkage) } else { SymbolScope::Unknown },
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                })
            })
            .collect();

        Self {
            module,
            object,
            func_symbols,
            global_symbols,
        }
    }

    fn symbol_for(&self, target: FixupTarget) -> SymbolId {
        match target {
            FixupTarget::Func(f) => self.func_symbols[f.index()],
            FixupTarget::Global(g) => self.global_symbols[g.index()],
        }
    }

    /// Place a function's code in `.text` and relocate its fixups.
    pub fn define_function(&mut self, func: FuncId, encoded: &EncodedFunction) -> CompileResult<()> {
        let text = self.object.section_id(StandardSection::Text);
        let symbol = self.func_symbols[func.index()];
        let base = self
            .object
            .add_symbol_data(symbol, text, &encoded.code, FUNCTION_ALIGN);

        for fixup in &encoded.fixups {
            let (kind, encoding) = match fixup.kind {
                FixupKind::Call => (RelocationKind::PltRelative, RelocationEncoding::X86Branch),
                FixupKind::PcRelative => (RelocationKind::Relative, RelocationEncoding::Generic),
                FixupKind::GotPcRelative => (RelocationKind::GotRelative, RelocationEncoding::Generic),
            };
            self.object.add_relocation(
                text,
                Relocation {
                    offset: base + fixup.offset,
                    symbol: self.symbol_for(fixup.target),
                    // The displacement is relative to the end of the 4-byte field.
                    addend: -4,
                    flags: RelocationFlags::Generic {
                        kind,
                        encoding,
                        size: 32,
                    },
                },
            )?;
        }
        Ok(())
    }

    /// Place every defined global in its section.
    pub fn define_globals(&mut self) -> CompileResult<()> {
        let module = self.module;
        for (idx, global) in module.globals.iter().enumerate() {
            let symbol = self.global_symbols[idx];
            let align = u64::from(global.align.max(1));
            match &global.kind {
                GlobalKind::Extern => {}
                GlobalKind::Zeroed { size } => {
                    let bss = self.object.section_id(StandardSection::UninitializedData);
                    self.object.add_symbol_bss(symbol, bss, *size, align);
                }
                GlobalKind::Data {
                    bytes,
                    readonly,
                    relocs,
                } => {
                    let section = self.data_section(*readonly, !relocs.is_empty());
                    let base = self.object.add_symbol_data(symbol, section, bytes, align);
                    for reloc in relocs {
                        let target = match reloc.target {
                            Operand::Func(f) => FixupTarget::Func(f),
                            Operand::Global(g) => FixupTarget::Global(g),
                            other => {
                                return Err(CompileError::malformed(
                                    format!("data relocation against {other:?}"),
                                    Location::default(),
                                ))
                            }
                        };
                        if reloc.offset + 8 > bytes.len() as u64 {
                            return Err(CompileError::malformed(
                                format!("relocation at {} outside of @{}", reloc.offset, global.name),
                                Location::default(),
                            ));
                        }
                        self.object.add_relocation(
                            section,
                            Relocation {
                                offset: base + reloc.offset,
                                symbol: self.symbol_for(target),
                                addend: reloc.addend,
                                flags: RelocationFlags::Generic {
                                    kind: RelocationKind::Absolute,
                                    encoding: RelocationEncoding::Generic,
                                    size: 64,
                                },
                            },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn data_section(&mut self, readonly: bool, relocated: bool) -> SectionId {
        let standard = match (readonly, relocated) {
            (true, false) => StandardSection::ReadOnlyData,
            (true, true) => StandardSection::ReadOnlyDataWithRel,
            (false, _) => StandardSection::Data,
        };
        self.object.section_id(standard)
    }

    /// Serialize the object file.
    pub fn finish(self) -> CompileResult<Vec<u8>> {
        Ok(self.object.write()?)
    }

    /// Emit a complete object for `module` from its compiled functions.
    pub fn emit(module: &'m Module, compiled: &[(FuncId, EncodedFunction)]) -> CompileResult<Vec<u8>> {
        let mut assembler = Self::new(module);
        for (func, encoded) in compiled {
            assembler.define_function(*func, encoded)?;
        }
        assembler.define_globals()?;
        let bytes = assembler.finish()?;
        log::debug!(
            "object: {} functions, {} globals, {} bytes",
            compiled.len(),
            module.globals.len(),
            bytes.len()
        );
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use object::{Object as _, ObjectSection, ObjectSymbol, RelocationTarget};

    fn ret_only() -> EncodedFunction {
        EncodedFunction {
            code: vec![0xC3],
            fixups: Vec::new(),
        }
    }

    #[test]
    fn simple_object() {
        let module = parse_module("define @foo() -> void {\nentry:\n    ret\n}\n").unwrap();
        let bytes = ElfAssembler::emit(&module, &[(FuncId(0), ret_only())]).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert!(file.section_by_name(".text").is_some());
        let foo = file.symbol_by_name("foo").unwrap();
        assert!(foo.is_global());
        assert_eq!(foo.size(), 1);
    }

    #[test]
    fn sections_and_relocations() {
        let module = parse_module(
            r#"
declare @rt_alloc(i64) -> ptr
global internal @buf : zeroed 24
global internal @table : rodata x"00000000000000000000000000000000" reloc(8, @rt_alloc)
global internal @name : rodata x"6869"
define @main() -> void {
entry:
    ret
}
"#,
        )
        .unwrap();
        let code = EncodedFunction {
            code: vec![0xE8, 0, 0, 0, 0, 0xC3],
            fixups: vec![crate::x64::CodeFixup {
                offset: 1,
                target: FixupTarget::Func(FuncId(0)),
                kind: FixupKind::Call,
            }],
        };
        let bytes = ElfAssembler::emit(&module, &[(FuncId(1), code)]).unwrap();
        let file = object::File::parse(&*bytes).unwrap();

        let bss = file.section_by_name(".bss").unwrap();
        assert_eq!(bss.size(), 24);
        assert!(file.section_by_name(".data.rel.ro").is_some());
        assert_eq!(file.section_by_name(".rodata").unwrap().data().unwrap(), b"hi");

        let text = file.section_by_name(".text").unwrap();
        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 1);
        let (offset, reloc) = &relocs[0];
        assert_eq!(*offset, 1);
        assert_eq!(reloc.addend(), -4);
        let RelocationTarget::Symbol(index) = reloc.target() else {
            panic!("relocation without a symbol");
        };
        let target = file.symbol_by_index(index).unwrap();
        assert_eq!(target.name().unwrap(), "rt_alloc");
        assert!(target.is_undefined());

        let table = file.section_by_name(".data.rel.ro").unwrap();
        let (offset, reloc) = table.relocations().next().unwrap();
        assert_eq!(offset, 8);
        assert_eq!(reloc.size(), 64);
    }
}
