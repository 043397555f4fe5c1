//! Front end over IR text files.
//!
//! Besides plain IR, a source may contain front-end directives, one per line:
//!
//! ```text
//! symbol 0x7f0000001000 "gc_pool_alloc" "gc.c":120 library
//! heap 0x7f0000100000 = text "hi"
//! heap 0x7f0000100040 = record 0x7f0000100080 (i64 1, ref 0x7f0000100000, ref _)
//! heap 0x7f0000100080 = type "Pair" ()
//! heap 0x7f00001000c0 = rawarray f64 [2] (1.5, -2)
//! heap 0x7f0000100100 = boxedarray _ [3] (0x7f0000100000, _, 0x7f0000100000)
//! heap 0x7f0000100140 = scalar i32 -7
//! heap 0x7f0000100180 = symbol "name"
//! heap 0x7f00001001c0 = singleton nothing
//! heap 0x7f0000100200 = opaque "Task"
//! heap 0x7f0000100240 = extension 3 x"0102" (0x7f0000100000)
//! ```
//!
//! Directive lines are blanked out before the IR parser runs, so parse
//! errors keep their original line numbers. The first source holds the
//! entry module; the others are candidate subroutine modules. Directives
//! from every source are merged.

use super::heap::{Address, ExtensionKind, Field, HeapImage, HeapValue, HeapView, Scalar, ScalarKind, SingletonKind};
use super::oracle::{AddressOracle, SymbolDescriptor, SymbolMap};
use super::{EntrySignature, Frontend};
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{parse_module, Cursor, Module};

#[derive(Debug, Default)]
pub struct TextualFrontend {
    modules: Vec<Module>,
    heap: HeapImage,
    symbols: SymbolMap,
}

impl TextualFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and add one source. `name` names the module if the text has no
    /// `module` line.
    pub fn add_source(&mut self, name: &str, text: &str) -> CompileResult<()> {
        let mut ir_text = String::with_capacity(text.len());
        for line in text.split('\n') {
            let trimmed = line.trim_start();
            let directive = starts_with_word(trimmed, "heap") || starts_with_word(trimmed, "symbol");
            if directive {
                let offset = line.len() - trimmed.len() + line.as_ptr() as usize - text.as_ptr() as usize;
                self.parse_directive(text, offset)?;
            } else {
                ir_text.push_str(line);
            }
            ir_text.push('\n');
        }

        let mut module = parse_module(&ir_text)?;
        if module.name.is_empty() {
            module.name = name.to_string();
        }
        log::debug!(
            "textual frontend: source '{}' -> module '{}' ({} functions)",
            name,
            module.name,
            module.functions.len()
        );
        self.modules.push(module);
        Ok(())
    }

    pub fn heap_image(&self) -> &HeapImage {
        &self.heap
    }

    pub fn heap_image_mut(&mut self) -> &mut HeapImage {
        &mut self.heap
    }

    pub fn symbol_map_mut(&mut self) -> &mut SymbolMap {
        &mut self.symbols
    }

    fn parse_directive(&mut self, text: &str, offset: usize) -> CompileResult<()> {
        let mut cur = Cursor::at(text, offset);
        if cur.try_keyword("symbol") {
            let address = cur.read_u64()?;
            let symbol = cur.read_string()?;
            let (file, line) = if cur.peek_char() == Some('"') {
                let file = cur.read_string()?;
                cur.expect(':')?;
                (file, cur.read_u64()? as u32)
            } else {
                (String::new(), 0)
            };
            let known_library = cur.try_keyword("library");
            cur.expect_line_end()?;
            self.symbols.insert(
                address,
                SymbolDescriptor {
                    symbol,
                    file,
                    line,
                    known_library,
                },
            );
        } else {
            cur.expect_keyword("heap")?;
            let address = cur.read_u64()?;
            cur.expect('=')?;
            let value = parse_heap_value(&mut cur)?;
            cur.expect_line_end()?;
            self.heap.insert(address, value);
        }
        Ok(())
    }
}

fn starts_with_word(line: &str, word: &str) -> bool {
    line.strip_prefix(word)
        .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_whitespace()))
}

fn parse_heap_value(cur: &mut Cursor<'_>) -> CompileResult<HeapValue> {
    let kind = cur.read_identifier()?;
    let value = match kind {
        "scalar" => {
            let kind_name = cur.read_identifier()?;
            let kind = ScalarKind::from_name(kind_name)
                .ok_or_else(|| cur.error(format!("Unknown scalar kind '{kind_name}'")))?;
            HeapValue::Scalar(parse_scalar(cur, kind)?)
        }
        "text" => HeapValue::Text(cur.read_string()?),
        "rawarray" => {
            let kind_name = cur.read_identifier()?;
            let elem = ScalarKind::from_name(kind_name)
                .ok_or_else(|| cur.error(format!("Unknown element kind '{kind_name}'")))?;
            let dims = parse_dims(cur)?;
            let data = if cur.peek_char() == Some('x') {
                cur.read_hex_bytes()?
            } else {
                let mut data = Vec::new();
                parse_list(cur, |cur| {
                    data.extend(parse_scalar(cur, elem)?.to_le_bytes());
                    Ok(())
                })?;
                data
            };
            let expected = dims.iter().product::<u64>() as usize * elem.size();
            if data.len() != expected {
                return Err(cur.error(format!(
                    "Array payload has {} bytes, dimensions need {expected}",
                    data.len()
                )));
            }
            HeapValue::RawArray { elem, dims, data }
        }
        "boxedarray" => {
            let elem_type = parse_optional_address(cur)?;
            let dims = parse_dims(cur)?;
            let mut elements = Vec::new();
            parse_list(cur, |cur| {
                elements.push(parse_optional_address(cur)?);
                Ok(())
            })?;
            if elements.len() as u64 != dims.iter().product::<u64>() {
                return Err(cur.error("Element count does not match dimensions"));
            }
            HeapValue::BoxedArray {
                elem_type,
                dims,
                elements,
            }
        }
        "record" => {
            let ty = parse_optional_address(cur)?;
            let mut fields = Vec::new();
            parse_list(cur, |cur| {
                if cur.try_keyword("ref") {
                    fields.push(Field::Ref(parse_optional_address(cur)?));
                } else {
                    let kind_name = cur.read_identifier()?;
                    let kind = ScalarKind::from_name(kind_name)
                        .ok_or_else(|| cur.error(format!("Unknown field kind '{kind_name}'")))?;
                    fields.push(Field::Scalar(parse_scalar(cur, kind)?));
                }
                Ok(())
            })?;
            HeapValue::Record { ty, fields }
        }
        "type" => {
            let name = cur.read_string()?;
            let mut params = Vec::new();
            parse_list(cur, |cur| {
                params.push(cur.read_u64()?);
                Ok(())
            })?;
            HeapValue::TypeDescriptor { name, params }
        }
        "symbol" => HeapValue::Symbol(cur.read_string()?),
        "singleton" => {
            let name = cur.read_identifier()?;
            HeapValue::Singleton(
                SingletonKind::from_name(name)
                    .ok_or_else(|| cur.error(format!("Unknown singleton '{name}'")))?,
            )
        }
        "opaque" => HeapValue::Opaque {
            type_name: cur.read_string()?,
        },
        "extension" => {
            let kind = ExtensionKind(cur.read_u64()? as u32);
            let payload = cur.read_hex_bytes()?;
            let mut children = Vec::new();
            if cur.peek_char() == Some('(') {
                parse_list(cur, |cur| {
                    children.push(cur.read_u64()?);
                    Ok(())
                })?;
            }
            HeapValue::Extension {
                kind,
                payload,
                children,
            }
        }
        other => return Err(cur.error(format!("Unknown heap value kind '{other}'"))),
    };
    Ok(value)
}

fn parse_scalar(cur: &mut Cursor<'_>, kind: ScalarKind) -> CompileResult<Scalar> {
    let token = cur.read_token()?;
    let cur: &Cursor<'_> = cur;
    let bad = |cur: &Cursor<'_>| cur.error(format!("Invalid {} literal '{token}'", kind.name()));
    let int = |cur: &Cursor<'_>| -> CompileResult<i128> {
        let (negative, digits) = match token.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let magnitude = match digits.strip_prefix("0x") {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => digits.parse::<i128>(),
        }
        .map_err(|_| bad(cur))?;
        Ok(if negative { -magnitude } else { magnitude })
    };
    let scalar = match kind {
        ScalarKind::Int8 => Scalar::Int8(i8::try_from(int(cur)?).map_err(|_| bad(cur))?),
        ScalarKind::Int16 => Scalar::Int16(i16::try_from(int(cur)?).map_err(|_| bad(cur))?),
        ScalarKind::Int32 => Scalar::Int32(i32::try_from(int(cur)?).map_err(|_| bad(cur))?),
        ScalarKind::Int64 => Scalar::Int64(i64::try_from(int(cur)?).map_err(|_| bad(cur))?),
        ScalarKind::UInt8 => Scalar::UInt8(u8::try_from(int(cur)?).map_err(|_| bad(cur))?),
        ScalarKind::Float64 => Scalar::Float64(match token.strip_prefix("bits:") {
            Some(bits) => f64::from_bits(
                u64::from_str_radix(bits.trim_start_matches("0x"), 16).map_err(|_| bad(cur))?,
            ),
            None => token.parse::<f64>().map_err(|_| bad(cur))?,
        }),
        ScalarKind::Bool => Scalar::Bool(match token {
            "true" => true,
            "false" => false,
            _ => return Err(bad(cur)),
        }),
        ScalarKind::Char => {
            let code = u32::try_from(int(cur)?).map_err(|_| bad(cur))?;
            Scalar::Char(char::from_u32(code).ok_or_else(|| bad(cur))?)
        }
    };
    Ok(scalar)
}

fn parse_optional_address(cur: &mut Cursor<'_>) -> CompileResult<Option<Address>> {
    if cur.peek_char() == Some('_') {
        cur.read_identifier()?;
        return Ok(None);
    }
    Ok(Some(cur.read_u64()?))
}

fn parse_dims(cur: &mut Cursor<'_>) -> CompileResult<Vec<u64>> {
    cur.expect('[')?;
    let mut dims = Vec::new();
    if !cur.try_read(']') {
        loop {
            dims.push(cur.read_u64()?);
            if cur.try_read(']') {
                break;
            }
            cur.expect(',')?;
        }
    }
    Ok(dims)
}

/// `( item, item, ... )`
fn parse_list<'a, F>(cur: &mut Cursor<'a>, mut item: F) -> CompileResult<()>
where
    F: FnMut(&mut Cursor<'a>) -> CompileResult<()>,
{
    cur.expect('(')?;
    if cur.try_read(')') {
        return Ok(());
    }
    loop {
        item(cur)?;
        if cur.try_read(')') {
            return Ok(());
        }
        cur.expect(',')?;
    }
}

impl Frontend for TextualFrontend {
    fn entry_module(&self, signature: &EntrySignature) -> CompileResult<Module> {
        let module = self.modules.first().ok_or_else(|| CompileError::Frontend {
            reason: format!("no source provided for entry '{}'", signature.name),
        })?;
        Ok(module.clone())
    }

    fn subroutine_modules(&self, functions: &[String]) -> CompileResult<Vec<Module>> {
        let found = self
            .modules
            .iter()
            .skip(1)
            .filter(|module| {
                functions.iter().any(|name| {
                    module
                        .function_by_name(name)
                        .is_some_and(|id| !module.func(id).is_declaration())
                })
            })
            .cloned()
            .collect();
        Ok(found)
    }

    fn heap(&self) -> &dyn HeapView {
        &self.heap
    }

    fn oracle(&self) -> &dyn AddressOracle {
        &self.symbols
    }
}
