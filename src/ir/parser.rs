//! Textual IR parser.
//!
//! Top-level items are parsed first so that functions and globals can be
//! referenced before they appear; function bodies are parsed in a second
//! phase once every `@name` is known. Inside a body, results may be used
//! before their defining line (loops), so each body is pre-scanned for
//! labels and result names.

use super::*;
use crate::core::error::{CompileError, CompileResult};
use std::collections::HashMap;

/// Parse one module from its textual form.
pub fn parse_module(text: &str) -> CompileResult<Module> {
    ModuleParser::new(text).parse()
}

/// Byte cursor with the lexical primitives shared by the IR parser and the
/// front-end directive parser.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    pub fn at(text: &'a str, pos: usize) -> Self {
        Self { text, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.text.as_bytes().get(self.pos + offset).copied()
    }

    /// Skip blanks and `;` comments. Newlines are only skipped when asked.
    pub fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.peek() {
            if ch == b';' {
                while let Some(ch) = self.peek() {
                    if ch == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else if ch == b'\n' {
                if !skip_newlines {
                    break;
                }
                self.pos += 1;
            } else if ch.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// True when only blanks or a comment remain on the current line.
    pub fn at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.peek(), None | Some(b'\n'))
    }

    pub fn expect_line_end(&mut self) -> CompileResult<()> {
        if !self.at_line_end() {
            return Err(self.error(format!(
                "Expected end of line but found '{}'",
                self.rest_of_line().trim()
            )));
        }
        Ok(())
    }

    pub fn peek_char(&mut self) -> Option<char> {
        self.skip_whitespace(false);
        self.peek().map(char::from)
    }

    pub fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.peek() == Some(ch as u8) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, ch: char) -> CompileResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!(
                "Expected '{}' but found {:?}",
                ch,
                self.peek().map(char::from)
            )));
        }
        Ok(())
    }

    /// Consume `keyword` if it appears next as a whole word.
    pub fn try_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace(false);
        let rest = &self.text[self.pos..];
        if !rest.starts_with(keyword) {
            return false;
        }
        let boundary = rest[keyword.len()..]
            .bytes()
            .next()
            .map_or(true, |b| !is_ident_byte(b));
        if boundary {
            self.pos += keyword.len();
        }
        boundary
    }

    pub fn expect_keyword(&mut self, keyword: &str) -> CompileResult<()> {
        if !self.try_keyword(keyword) {
            return Err(self.error(format!("Expected '{keyword}'")));
        }
        Ok(())
    }

    /// Identifiers may contain `.` and `$` and may start with a digit so that
    /// numbered values (`%3`) and dotted intrinsics (`@gc.safepoint`) parse.
    pub fn read_identifier(&mut self) -> CompileResult<&'a str> {
        self.skip_whitespace(false);
        let start = self.pos;
        while self.peek().is_some_and(is_ident_byte) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error(format!(
                "Expected identifier but found {:?}",
                self.peek().map(char::from)
            )));
        }
        Ok(&self.text[start..self.pos])
    }

    /// Signed decimal or `0x` hexadecimal. Hex literals are read as u64 and
    /// reinterpreted, so full 64-bit addresses round-trip.
    pub fn read_int(&mut self) -> CompileResult<i64> {
        self.skip_whitespace(false);
        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }
        let magnitude = self.read_u64()?;
        Ok(if negative {
            (magnitude as i64).wrapping_neg()
        } else {
            magnitude as i64
        })
    }

    pub fn read_u64(&mut self) -> CompileResult<u64> {
        self.skip_whitespace(false);
        let is_hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X'));
        if is_hex {
            self.pos += 2;
        }
        let start = self.pos;
        while self.peek().is_some_and(|b| {
            if is_hex {
                b.is_ascii_hexdigit() || b == b'_'
            } else {
                b.is_ascii_digit() || b == b'_'
            }
        }) {
            self.pos += 1;
        }
        let digits: String = self.text[start..self.pos]
            .chars()
            .filter(|&c| c != '_')
            .collect();
        if digits.is_empty() {
            return Err(self.error("Expected number"));
        }
        let radix = if is_hex { 16 } else { 10 };
        u64::from_str_radix(&digits, radix)
            .map_err(|e| self.error(format!("Invalid number '{digits}': {e}")))
    }

    /// A double-quoted string with `\"`, `\\`, `\n`, `\t` and `\xHH` escapes.
    pub fn read_string(&mut self) -> CompileResult<String> {
        self.expect('"')?;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("Unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        Some(b'\\') => out.push(b'\\'),
                        Some(b'"') => out.push(b'"'),
                        Some(b'x') => {
                            let hex = self
                                .text
                                .get(self.pos + 1..self.pos + 3)
                                .ok_or_else(|| self.error("Truncated \\x escape"))?;
                            let byte = u8::from_str_radix(hex, 16)
                                .map_err(|_| self.error("Invalid \\x escape"))?;
                            out.push(byte);
                            self.pos += 2;
                        }
                        _ => return Err(self.error("Unknown escape sequence")),
                    }
                    self.pos += 1;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out).map_err(|_| self.error("String is not valid UTF-8"))
    }

    /// A byte string written as `x"0a1b..."`.
    pub fn read_hex_bytes(&mut self) -> CompileResult<Vec<u8>> {
        self.skip_whitespace(false);
        if !(self.peek() == Some(b'x') && self.peek_at(1) == Some(b'"')) {
            return Err(self.error("Expected hex byte string x\"...\""));
        }
        self.pos += 2;
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
            self.pos += 1;
        }
        let digits = &self.text[start..self.pos];
        self.expect('"')?;
        if digits.len() % 2 != 0 {
            return Err(self.error("Odd number of hex digits"));
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map_err(|_| self.error("Invalid hex digit"))
            })
            .collect()
    }

    /// A run of bytes up to whitespace or punctuation, for literals the
    /// caller parses itself (floats, keywords).
    pub fn read_token(&mut self) -> CompileResult<&'a str> {
        self.skip_whitespace(false);
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !b.is_ascii_whitespace() && !matches!(b, b',' | b'(' | b')' | b'[' | b']' | b';'))
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("Expected token"));
        }
        Ok(&self.text[start..self.pos])
    }

    pub fn read_type(&mut self) -> CompileResult<Type> {
        let word = self.read_identifier()?;
        let ty = match word {
            "void" => Type::Void,
            "f64" => Type::F64,
            "ptr" => {
                if self.peek() == Some(b'(') {
                    self.pos += 1;
                    let space = self.read_u64()?;
                    self.expect(')')?;
                    Type::Ptr(space as u32)
                } else {
                    Type::PTR
                }
            }
            _ => match word.strip_prefix('i').map(str::parse::<u8>) {
                Some(Ok(bits)) if matches!(bits, 1 | 8 | 16 | 32 | 64) => Type::Int(bits),
                _ => return Err(self.error(format!("Unknown type '{word}'"))),
            },
        };
        Ok(ty)
    }

    pub fn rest_of_line(&self) -> &'a str {
        let rest = &self.text[self.pos..];
        rest.split('\n').next().unwrap_or("")
    }

    /// Build a parse error pointing at the current position.
    pub fn error(&self, message: impl Into<String>) -> CompileError {
        let consumed = &self.text[..self.pos.min(self.text.len())];
        let line = consumed.bytes().filter(|&b| b == b'\n').count() + 1;
        let column = consumed.len() - consumed.rfind('\n').map_or(0, |i| i + 1) + 1;
        CompileError::Parse {
            line,
            column,
            message: message.into(),
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'$')
}

struct PendingReloc<'a> {
    global: GlobalId,
    offset: u64,
    target: &'a str,
    addend: i64,
    pos: usize,
}

/// Names visible inside one function body.
#[derive(Default)]
struct Scope<'a> {
    values: HashMap<&'a str, InstId>,
    blocks: HashMap<&'a str, BlockId>,
}

struct ModuleParser<'a> {
    text: &'a str,
    cur: Cursor<'a>,
    module: Module,
    bodies: Vec<(FuncId, usize)>,
    relocs: Vec<PendingReloc<'a>>,
}

impl<'a> ModuleParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            cur: Cursor::new(text),
            module: Module::new(""),
            bodies: Vec::new(),
            relocs: Vec::new(),
        }
    }

    fn parse(mut self) -> CompileResult<Module> {
        loop {
            self.cur.skip_whitespace(true);
            if self.cur.is_eof() {
                break;
            }
            self.parse_top_level()?;
        }

        self.resolve_data_relocs()?;

        for (func, pos) in std::mem::take(&mut self.bodies) {
            self.parse_body(func, pos)?;
        }

        log::trace!(
            "parsed module '{}': {} functions, {} globals, {} constants",
            self.module.name,
            self.module.functions.len(),
            self.module.globals.len(),
            self.module.consts.len()
        );
        Ok(self.module)
    }

    fn parse_top_level(&mut self) -> CompileResult<()> {
        if self.cur.try_keyword("module") {
            self.module.name = self.cur.read_string()?;
        } else if self.cur.try_keyword("declare") {
            let function = self.parse_signature(false)?;
            if self.module.function_by_name(&function.name).is_none() {
                self.module.add_function(function);
            }
        } else if self.cur.try_keyword("define") {
            let function = self.parse_signature(true)?;
            let id = match self.module.function_by_name(&function.name) {
                Some(id) if self.module.func(id).is_declaration() && !self.has_body(id) => {
                    *self.module.func_mut(id) = function;
                    id
                }
                Some(_) => {
                    return Err(self
                        .cur
                        .error(format!("Redefinition of @{}", function.name)))
                }
                None => self.module.add_function(function),
            };
            self.cur.expect('{')?;
            self.bodies.push((id, self.cur.pos()));
            self.skip_body()?;
        } else if self.cur.try_keyword("global") {
            self.parse_global()?;
        } else if self.cur.try_keyword("extern") {
            self.cur.expect_keyword("global")?;
            self.cur.expect('@')?;
            let name = self.cur.read_identifier()?;
            if self.module.global_by_name(name).is_none() {
                self.module.add_global(Global::external(name));
            }
        } else {
            return Err(self.cur.error(format!(
                "Expected top-level item but found '{}'",
                self.cur.rest_of_line().trim()
            )));
        }
        self.cur.expect_line_end()
    }

    fn has_body(&self, id: FuncId) -> bool {
        self.bodies.iter().any(|&(f, _)| f == id)
    }

    fn parse_linkage(&mut self) -> Linkage {
        if self.cur.try_keyword("internal") {
            Linkage::Internal
        } else {
            self.cur.try_keyword("external");
            Linkage::External
        }
    }

    /// `[internal] @name(ty [%p], ...) -> ret [attrs]`
    fn parse_signature(&mut self, is_definition: bool) -> CompileResult<Function> {
        let linkage = self.parse_linkage();
        self.cur.expect('@')?;
        let name = self.cur.read_identifier()?;
        self.cur.expect('(')?;
        let mut params = Vec::new();
        if !self.cur.try_read(')') {
            loop {
                let ty = self.cur.read_type()?;
                let pname = if self.cur.try_read('%') {
                    self.cur.read_identifier()?.to_string()
                } else {
                    format!("arg{}", params.len())
                };
                params.push(Param { name: pname, ty });
                if self.cur.try_read(')') {
                    break;
                }
                self.cur.expect(',')?;
            }
        }
        self.cur.expect('-')?;
        self.cur.expect('>')?;
        let ret = self.cur.read_type()?;

        let mut function = Function::new(name, params, ret);
        function.linkage = linkage;
        if self.cur.try_read('[') {
            loop {
                match self.cur.read_identifier()? {
                    "wrapper" => function.attrs.dispatch_wrapper = true,
                    "noinline" => function.attrs.noinline = true,
                    "generated" => function.attrs.generated = true,
                    other => {
                        return Err(self.cur.error(format!("Unknown function attribute '{other}'")))
                    }
                }
                if self.cur.try_read(']') {
                    break;
                }
                self.cur.expect(',')?;
            }
        }
        if !is_definition && self.cur.peek_char() == Some('{') {
            return Err(self.cur.error("Declarations cannot have a body"));
        }
        Ok(function)
    }

    fn skip_body(&mut self) -> CompileResult<()> {
        let bytes = self.text.as_bytes();
        let mut pos = self.cur.pos();
        let mut in_string = false;
        let mut in_comment = false;
        while pos < bytes.len() {
            let b = bytes[pos];
            if in_comment {
                in_comment = b != b'\n';
            } else if in_string {
                if b == b'\\' {
                    pos += 1;
                } else if b == b'"' {
                    in_string = false;
                }
            } else if b == b'"' {
                in_string = true;
            } else if b == b';' {
                in_comment = true;
            } else if b == b'}' {
                self.cur = Cursor::at(self.text, pos + 1);
                return Ok(());
            }
            pos += 1;
        }
        Err(self.cur.error("Unterminated function body"))
    }

    /// `[internal] @name : zeroed N | data x".." [reloc(..)]* | rodata x".." [align N]`
    fn parse_global(&mut self) -> CompileResult<()> {
        let linkage = self.parse_linkage();
        self.cur.expect('@')?;
        let name = self.cur.read_identifier()?;
        if self.module.global_by_name(name).is_some_and(|g| !self.module.global(g).is_extern()) {
            return Err(self.cur.error(format!("Redefinition of global @{name}")));
        }
        self.cur.expect(':')?;
        let kind_word = self.cur.read_identifier()?;
        let mut pending = Vec::new();
        let kind = match kind_word {
            "zeroed" => GlobalKind::Zeroed {
                size: self.cur.read_u64()?,
            },
            "data" | "rodata" => {
                let bytes = self.cur.read_hex_bytes()?;
                while self.cur.try_keyword("reloc") {
                    let pos = self.cur.pos();
                    self.cur.expect('(')?;
                    let offset = self.cur.read_u64()?;
                    self.cur.expect(',')?;
                    self.cur.expect('@')?;
                    let target = self.cur.read_identifier()?;
                    let addend = if self.cur.try_read(',') {
                        self.cur.read_int()?
                    } else {
                        0
                    };
                    self.cur.expect(')')?;
                    pending.push((offset, target, addend, pos));
                }
                GlobalKind::Data {
                    bytes,
                    readonly: kind_word == "rodata",
                    relocs: Vec::new(),
                }
            }
            other => return Err(self.cur.error(format!("Unknown global kind '{other}'"))),
        };
        let align = if self.cur.try_keyword("align") {
            self.cur.read_u64()? as u32
        } else {
            8
        };
        let global = Global {
            name: name.to_string(),
            linkage,
            kind,
            align,
        };
        let id = match self.module.global_by_name(name) {
            Some(id) => {
                self.module.globals[id.index()] = global;
                id
            }
            None => self.module.add_global(global),
        };
        for (offset, target, addend, pos) in pending {
            self.relocs.push(PendingReloc {
                global: id,
                offset,
                target,
                addend,
                pos,
            });
        }
        Ok(())
    }

    fn resolve_data_relocs(&mut self) -> CompileResult<()> {
        for reloc in std::mem::take(&mut self.relocs) {
            let target = self
                .symbol_operand(reloc.target)
                .ok_or_else(|| {
                    Cursor::at(self.text, reloc.pos)
                        .error(format!("Unknown symbol @{}", reloc.target))
                })?;
            if let GlobalKind::Data { relocs, .. } = &mut self.module.globals[reloc.global.index()].kind {
                relocs.push(DataReloc {
                    offset: reloc.offset,
                    target,
                    addend: reloc.addend,
                });
            }
        }
        Ok(())
    }

    fn symbol_operand(&self, name: &str) -> Option<Operand> {
        self.module
            .function_by_name(name)
            .map(Operand::Func)
            .or_else(|| self.module.global_by_name(name).map(Operand::Global))
    }

    /// Pre-scan a body: block labels in order and the instruction index each
    /// `%name =` line will receive.
    fn prescan_body(&self, pos: usize) -> Scope<'a> {
        let mut scope = Scope::default();
        let mut index = 0u32;
        let mut blocks = 0u32;
        for raw in self.text[pos..].split('\n') {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if line.starts_with('}') {
                break;
            }
            let ident_len = line.bytes().take_while(|&b| is_ident_byte(b)).count();
            if ident_len > 0 && line[ident_len..].starts_with(':') {
                scope.blocks.insert(&line[..ident_len], BlockId(blocks));
                blocks += 1;
                continue;
            }
            if let Some(rest) = line.strip_prefix('%') {
                let len = rest.bytes().take_while(|&b| is_ident_byte(b)).count();
                if rest[len..].trim_start().starts_with('=') {
                    scope.values.insert(&rest[..len], InstId(index));
                }
            }
            index += 1;
        }
        scope
    }

    fn parse_body(&mut self, func: FuncId, pos: usize) -> CompileResult<()> {
        let scope = self.prescan_body(pos);
        let mut function = std::mem::replace(
            self.module.func_mut(func),
            Function::new("", Vec::new(), Type::Void),
        );
        let param_names: Vec<String> = function.params.iter().map(|p| p.name.clone()).collect();

        let mut labels: Vec<(&'a str, BlockId)> =
            scope.blocks.iter().map(|(&n, &b)| (n, b)).collect();
        labels.sort_by_key(|&(_, b)| b);
        for (name, _) in &labels {
            function.add_block(*name);
        }

        self.cur = Cursor::at(self.text, pos);
        let mut current: Option<BlockId> = None;
        loop {
            self.cur.skip_whitespace(true);
            if self.cur.is_eof() {
                return Err(self.cur.error("Unterminated function body"));
            }
            if self.cur.try_read('}') {
                break;
            }
            let line = self.cur.rest_of_line();
            let ident_len = line.bytes().take_while(|&b| is_ident_byte(b)).count();
            if ident_len > 0 && line[ident_len..].starts_with(':') {
                let name = self.cur.read_identifier()?;
                self.cur.expect(':')?;
                current = scope.blocks.get(name).copied();
                self.cur.expect_line_end()?;
                continue;
            }
            let block = current.ok_or_else(|| self.cur.error("Instruction outside of a block"))?;
            let inst = self.parse_inst(&scope, &param_names, &function)?;
            let id = function.push_inst(inst);
            function.blocks[block.index()].insts.push(id);
            self.cur.expect_line_end()?;
        }

        if function.blocks.is_empty() {
            return Err(self
                .cur
                .error(format!("Function @{} has an empty body", function.name)));
        }
        *self.module.func_mut(func) = function;
        Ok(())
    }

    fn parse_inst(
        &mut self,
        scope: &Scope<'a>,
        params: &[String],
        function: &Function,
    ) -> CompileResult<Inst> {
        let name = if self.cur.try_read('%') {
            let name = self.cur.read_identifier()?;
            self.cur.expect('=')?;
            Some(name.to_string())
        } else {
            None
        };

        let opcode = self.cur.read_identifier()?;
        let (ty, kind) = if let Some(op) = BinOp::from_name(opcode) {
            let ty = self.cur.read_type()?;
            let lhs = self.parse_operand(scope, params)?;
            self.cur.expect(',')?;
            let rhs = self.parse_operand(scope, params)?;
            (ty, InstKind::Binary { op, lhs, rhs })
        } else if let Some(op) = CastOp::from_name(opcode) {
            let from = self.cur.read_type()?;
            let value = self.parse_operand(scope, params)?;
            self.cur.expect_keyword("to")?;
            let ty = self.cur.read_type()?;
            (ty, InstKind::Cast { op, from, value })
        } else {
            match opcode {
                "icmp" => {
                    let pred_name = self.cur.read_identifier()?;
                    let pred = IntPredicate::from_name(pred_name).ok_or_else(|| {
                        self.cur.error(format!("Unknown icmp predicate '{pred_name}'"))
                    })?;
                    let ty = self.cur.read_type()?;
                    let lhs = self.parse_operand(scope, params)?;
                    self.cur.expect(',')?;
                    let rhs = self.parse_operand(scope, params)?;
                    (Type::I1, InstKind::ICmp { pred, ty, lhs, rhs })
                }
                "load" => {
                    let ty = self.cur.read_type()?;
                    self.cur.expect(',')?;
                    let ptr = self.parse_operand(scope, params)?;
                    (ty, InstKind::Load { ptr })
                }
                "store" => {
                    let ty = self.cur.read_type()?;
                    let value = self.parse_operand(scope, params)?;
                    self.cur.expect(',')?;
                    let ptr = self.parse_operand(scope, params)?;
                    (Type::Void, InstKind::Store { ty, value, ptr })
                }
                "gep" => {
                    let ty = self.cur.read_type()?;
                    let base = self.parse_operand(scope, params)?;
                    self.cur.expect(',')?;
                    let offset = self.parse_operand(scope, params)?;
                    (ty, InstKind::Gep { base, offset })
                }
                "alloca" => {
                    let size = self.cur.read_u64()? as u32;
                    (Type::PTR, InstKind::Alloca { size })
                }
                "call" => {
                    let ty = self.cur.read_type()?;
                    let callee = self.parse_operand(scope, params)?;
                    self.cur.expect('(')?;
                    let mut args = Vec::new();
                    if !self.cur.try_read(')') {
                        loop {
                            let arg_ty = self.cur.read_type()?;
                            args.push((arg_ty, self.parse_operand(scope, params)?));
                            if self.cur.try_read(')') {
                                break;
                            }
                            self.cur.expect(',')?;
                        }
                    }
                    (ty, InstKind::Call { callee, args })
                }
                "ret" => {
                    let value = if self.cur.at_line_end()
                        || self.cur.peek_char() == Some('!')
                        || self.cur.try_keyword("void")
                    {
                        None
                    } else {
                        Some(self.parse_operand(scope, params)?)
                    };
                    (Type::Void, InstKind::Ret { value })
                }
                "br" => {
                    let target = self.parse_block_ref(scope)?;
                    (Type::Void, InstKind::Br { target })
                }
                "condbr" => {
                    let cond = self.parse_operand(scope, params)?;
                    self.cur.expect(',')?;
                    let then_block = self.parse_block_ref(scope)?;
                    self.cur.expect(',')?;
                    let else_block = self.parse_block_ref(scope)?;
                    (
                        Type::Void,
                        InstKind::CondBr {
                            cond,
                            then_block,
                            else_block,
                        },
                    )
                }
                "unreachable" => (Type::Void, InstKind::Unreachable),
                other => return Err(self.cur.error(format!("Unknown instruction '{other}'"))),
            }
        };

        if name.is_some() && ty.is_void() {
            return Err(self.cur.error(format!(
                "Instruction '{opcode}' in @{} produces no value",
                function.name
            )));
        }

        let loc = if self.cur.try_read('!') {
            self.cur.expect_keyword("loc")?;
            self.cur.expect('(')?;
            let file = self.cur.read_string()?;
            self.cur.expect(',')?;
            let line = self.cur.read_u64()? as u32;
            self.cur.expect(')')?;
            Some(SourceLoc { file, line })
        } else {
            None
        };

        Ok(Inst {
            name,
            ty,
            kind,
            loc,
        })
    }

    fn parse_block_ref(&mut self, scope: &Scope<'a>) -> CompileResult<BlockId> {
        self.cur.expect('^')?;
        let name = self.cur.read_identifier()?;
        scope
            .blocks
            .get(name)
            .copied()
            .ok_or_else(|| self.cur.error(format!("Unknown block ^{name}")))
    }

    fn parse_operand(&mut self, scope: &Scope<'a>, params: &[String]) -> CompileResult<Operand> {
        match self.cur.peek_char() {
            Some('%') => {
                self.cur.expect('%')?;
                let name = self.cur.read_identifier()?;
                if let Some(idx) = params.iter().position(|p| p == name) {
                    return Ok(Operand::Arg(idx as u32));
                }
                scope
                    .values
                    .get(name)
                    .map(|&id| Operand::Value(id))
                    .ok_or_else(|| self.cur.error(format!("Unknown value %{name}")))
            }
            Some('@') => {
                self.cur.expect('@')?;
                let name = self.cur.read_identifier()?;
                self.symbol_operand(name)
                    .ok_or_else(|| self.cur.error(format!("Unknown symbol @{name}")))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(Operand::Int(self.cur.read_int()?)),
            Some(_) => {
                let word = self.cur.read_identifier()?;
                match word {
                    "null" => Ok(Operand::Null),
                    "undef" => Ok(Operand::Undef),
                    "true" => Ok(Operand::Int(1)),
                    "false" => Ok(Operand::Int(0)),
                    _ => self.parse_const_expr(word, scope, params),
                }
            }
            None => Err(self.cur.error("Expected operand")),
        }
    }

    /// `op(operand, ...)`; `addrspacecast(x, N)` carries its target space.
    fn parse_const_expr(
        &mut self,
        word: &str,
        scope: &Scope<'a>,
        params: &[String],
    ) -> CompileResult<Operand> {
        self.cur.expect('(')?;
        let mut operands = Vec::new();
        if !self.cur.try_read(')') {
            loop {
                operands.push(self.parse_operand(scope, params)?);
                if self.cur.try_read(')') {
                    break;
                }
                self.cur.expect(',')?;
            }
        }
        let arity_error = |cur: &Cursor<'_>| cur.error(format!("Wrong operand count for {word}"));
        let op = match word {
            "inttoptr" => ConstOp::IntToPtr,
            "ptrtoint" => ConstOp::PtrToInt,
            "bitcast" => ConstOp::BitCast,
            "gep" => {
                if operands.len() != 2 {
                    return Err(arity_error(&self.cur));
                }
                ConstOp::Gep
            }
            "addrspacecast" => match operands.pop() {
                Some(Operand::Int(space)) if operands.len() == 1 => ConstOp::AddrSpaceCast(space as u32),
                _ => return Err(arity_error(&self.cur)),
            },
            other => ConstOp::Other(other.to_string()),
        };
        if matches!(op, ConstOp::IntToPtr | ConstOp::PtrToInt | ConstOp::BitCast) && operands.len() != 1 {
            return Err(arity_error(&self.cur));
        }
        Ok(Operand::Const(
            self.module.intern_const(ConstExpr::new(op, operands)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_with_loop() {
        let module = parse_module(
            r#"
module "loop"
define @count(i64 %n) -> i64 {
entry:
    br ^head
head:
    %i = add i64 %i, 1      ; forward self-reference is fine
    %c = icmp slt i64 %i, %n
    condbr %c, ^head, ^exit
exit:
    ret %i
}
"#,
        )
        .unwrap();
        assert_eq!(module.name, "loop");
        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 3);
        assert_eq!(f.blocks[1].insts.len(), 3);
        assert_eq!(
            f.insts[1].kind,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Operand::Value(InstId(1)),
                rhs: Operand::Int(1)
            }
        );
    }

    #[test]
    fn parses_constant_expression_chains() {
        let module = parse_module(
            r#"
define @f() -> void {
entry:
    call void addrspacecast(bitcast(inttoptr(0x7f0000001000)), 11)() !loc("f.jl", 3)
    ret void
}
"#,
        )
        .unwrap();
        assert_eq!(module.consts.len(), 3);
        let call = &module.functions[0].insts[0];
        assert_eq!(call.loc.as_ref().map(|l| l.line), Some(3));
        let InstKind::Call { callee, .. } = &call.kind else {
            panic!("expected call");
        };
        let top = module.consts.get(callee.as_const().unwrap());
        assert_eq!(top.op, ConstOp::AddrSpaceCast(11));
    }

    #[test]
    fn forward_references_to_functions_and_globals() {
        let module = parse_module(
            r#"
define @main() -> ptr {
entry:
    call void @helper()
    ret @table
}
define internal @helper() -> void [noinline] {
entry:
    ret
}
global internal @table : rodata x"0000000000000000" reloc(0, @helper)
"#,
        )
        .unwrap();
        assert_eq!(module.functions[1].linkage, Linkage::Internal);
        assert!(module.functions[1].attrs.noinline);
        let GlobalKind::Data { relocs, readonly, .. } = &module.globals[0].kind else {
            panic!("expected data");
        };
        assert!(*readonly);
        assert_eq!(relocs[0].target, Operand::Func(FuncId(1)));
    }

    #[test]
    fn reports_line_and_column() {
        let err = parse_module("define @f() -> void {\nentry:\n    frobnicate\n}\n").unwrap_err();
        match err {
            CompileError::Parse { line, message, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("frobnicate"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unknown_const_opcode_is_kept_for_later_rejection() {
        let module = parse_module(
            "define @f() -> ptr {\nentry:\n    ret select(1, null, null)\n}\n",
        )
        .unwrap();
        let (_, expr) = module.consts.iter().next().unwrap();
        assert_eq!(expr.op, ConstOp::Other("select".into()));
    }
}
