//! Text assembler for the bytecode the interpreter and translator consume.
//!
//! ```text
//! .data
//!     const limit 10
//!     string greeting "hi"
//! .code
//! .local counter
//!     ldc 0
//!     stloc counter
//! .label top
//!     ldloc counter
//!     ldc limit
//!     clt
//!     brfalse done
//!     ...
//!     br top
//! .label done
//!     ret
//! ```
//!
//! Comments start with `#` or `//` outside string literals.

use std::collections::HashMap;

use crate::vm::{OpCode, Program, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    DuplicateLabel(String),
    UnknownLabel(String),
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssemblerError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
        }
    }
}

impl std::error::Error for AssemblerError {}

/// Builds bytecode instruction by instruction, patching label references
/// when the program is finished.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    constants: Vec<Value>,
    interned: HashMap<ConstKey, u32>,
    labels: HashMap<String, u32>,
    label_refs: Vec<(usize, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Bool(bool),
    String(String),
}

impl From<&Value> for ConstKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(value) => ConstKey::Int(*value),
            Value::Float(value) => ConstKey::Float(value.to_bits()),
            Value::Bool(value) => ConstKey::Bool(*value),
            Value::String(value) => ConstKey::String(value.clone()),
        }
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn label(&mut self, name: &str) -> Result<(), AssemblerError> {
        if self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name.to_string(), self.position());
        Ok(())
    }

    /// Interns `value` and returns its constant index.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        let key = ConstKey::from(&value);
        if let Some(index) = self.interned.get(&key) {
            return *index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        self.interned.insert(key, index);
        index
    }

    pub fn push_const(&mut self, value: Value) -> u32 {
        let index = self.add_constant(value);
        self.ldc(index);
        index
    }

    pub fn op(&mut self, opcode: OpCode) {
        self.code.push(opcode as u8);
    }

    pub fn ldc(&mut self, index: u32) {
        self.op(OpCode::Ldc);
        self.code.extend_from_slice(&index.to_le_bytes());
    }

    pub fn ldloc(&mut self, index: u8) {
        self.op(OpCode::Ldloc);
        self.code.push(index);
    }

    pub fn stloc(&mut self, index: u8) {
        self.op(OpCode::Stloc);
        self.code.push(index);
    }

    pub fn call(&mut self, index: u16, argc: u8) {
        self.op(OpCode::Call);
        self.code.extend_from_slice(&index.to_le_bytes());
        self.code.push(argc);
    }

    pub fn br(&mut self, label: &str) {
        self.branch(OpCode::Br, label);
    }

    pub fn brfalse(&mut self, label: &str) {
        self.branch(OpCode::Brfalse, label);
    }

    fn branch(&mut self, opcode: OpCode, label: &str) {
        self.op(opcode);
        self.label_refs.push((self.code.len(), label.to_string()));
        self.code.extend_from_slice(&[0; 4]);
    }

    pub fn finish_program(mut self) -> Result<Program, AssemblerError> {
        for (at, label) in &self.label_refs {
            let target = self
                .labels
                .get(label)
                .ok_or_else(|| AssemblerError::UnknownLabel(label.clone()))?;
            self.code[*at..*at + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(Program::new(self.constants, self.code))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for AsmParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "line {}: {}", self.line, self.message)
        }
    }
}

impl std::error::Error for AsmParseError {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Data,
    Code,
}

/// Tokens of one source line, with the line number for errors.
struct Line<'a> {
    number: usize,
    text: &'a str,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Line<'a> {
    fn new(number: usize, text: &'a str) -> Self {
        Self {
            number,
            text,
            tokens: text.split_whitespace(),
        }
    }

    fn error(&self, message: impl Into<String>) -> AsmParseError {
        AsmParseError {
            line: self.number,
            message: message.into(),
        }
    }

    fn token(&mut self, what: &str) -> Result<&'a str, AsmParseError> {
        match self.tokens.next() {
            Some(token) => Ok(token),
            None => Err(self.error(format!("missing {what}"))),
        }
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, AsmParseError> {
        let token = self.token(what)?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {what} '{token}'")))
    }

    /// Everything after the first `n` tokens, untokenized.
    fn rest_after(&self, n: usize) -> &'a str {
        let mut rest = self.text.trim_start();
        for _ in 0..n {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            rest = rest[end..].trim_start();
        }
        rest.trim_end()
    }

    fn finish(mut self) -> Result<(), AsmParseError> {
        match self.tokens.next() {
            Some(extra) => Err(self.error(format!("unexpected token '{extra}'"))),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Symbols {
    consts: HashMap<String, u32>,
    locals: HashMap<String, u8>,
    next_local: u8,
}

impl Symbols {
    fn define_const(
        &mut self,
        line: &Line<'_>,
        name: &str,
        index: u32,
    ) -> Result<(), AsmParseError> {
        if self.consts.insert(name.to_string(), index).is_some() {
            return Err(line.error(format!("duplicate const '{name}'")));
        }
        Ok(())
    }

    fn local(&self, line: &Line<'_>, token: &str) -> Result<u8, AsmParseError> {
        if let Ok(index) = token.parse::<u8>() {
            return Ok(index);
        }
        self.locals
            .get(token)
            .copied()
            .ok_or_else(|| line.error(format!("unknown local '{token}'")))
    }
}

pub fn assemble(source: &str) -> Result<Program, AsmParseError> {
    let mut assembler = Assembler::new();
    let mut symbols = Symbols::default();
    let mut section = Section::Code;

    for (index, raw) in source.lines().enumerate() {
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        let mut line = Line::new(index + 1, text);
        if text.ends_with(':') {
            return Err(line.error("labels are declared with '.label NAME'"));
        }

        if let Some(directive) = text.strip_prefix('.') {
            let directive = directive
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            line.token("directive")?;
            match directive.as_str() {
                "data" => section = Section::Data,
                "code" => section = Section::Code,
                "label" => {
                    if section != Section::Code {
                        return Err(line.error("labels are only valid in the code section"));
                    }
                    let name = line.token("label name")?;
                    assembler
                        .label(name)
                        .map_err(|err| line.error(err.to_string()))?;
                }
                "const" => {
                    define_constant(&mut assembler, &mut symbols, &mut line, false)?;
                    continue;
                }
                "local" => {
                    let name = line.token("local name")?;
                    if symbols.locals.contains_key(name) {
                        return Err(line.error(format!("duplicate local '{name}'")));
                    }
                    let slot = match line.tokens.next() {
                        Some(token) => token
                            .parse::<u8>()
                            .map_err(|_| line.error(format!("invalid local index '{token}'")))?,
                        None => {
                            let slot = symbols.next_local;
                            symbols.next_local = slot
                                .checked_add(1)
                                .ok_or_else(|| line.error("too many locals"))?;
                            slot
                        }
                    };
                    symbols.locals.insert(name.to_string(), slot);
                }
                other => return Err(line.error(format!("unknown directive '.{other}'"))),
            }
            line.finish()?;
            continue;
        }

        let mnemonic = line.token("opcode")?.to_ascii_lowercase();
        if section == Section::Data {
            match mnemonic.as_str() {
                "const" => define_constant(&mut assembler, &mut symbols, &mut line, false)?,
                "string" => define_constant(&mut assembler, &mut symbols, &mut line, true)?,
                other => {
                    return Err(line.error(format!("unexpected '{other}' in data section")));
                }
            }
            continue;
        }

        let opcode = OpCode::parse_mnemonic(&mnemonic)
            .ok_or_else(|| line.error(format!("unknown opcode '{mnemonic}'")))?;
        match opcode {
            OpCode::Ldc => {
                let operand = line.rest_after(1);
                if operand.is_empty() {
                    return Err(line.error("missing ldc operand"));
                }
                match symbols.consts.get(operand) {
                    Some(index) => assembler.ldc(*index),
                    None => {
                        assembler.push_const(parse_literal(&line, operand)?);
                    }
                }
                continue;
            }
            OpCode::Br | OpCode::Brfalse => {
                let target = line.token("branch target")?;
                if target.parse::<u32>().is_ok() {
                    return Err(line.error("branch targets must be labels"));
                }
                if opcode == OpCode::Br {
                    assembler.br(target);
                } else {
                    assembler.brfalse(target);
                }
            }
            OpCode::Ldloc | OpCode::Stloc => {
                let token = line.token("local")?;
                let slot = symbols.local(&line, token)?;
                if opcode == OpCode::Ldloc {
                    assembler.ldloc(slot);
                } else {
                    assembler.stloc(slot);
                }
            }
            OpCode::Call => {
                let function = line.number::<u16>("function index")?;
                let argc = line.number::<u8>("argument count")?;
                assembler.call(function, argc);
            }
            simple => assembler.op(simple),
        }
        line.finish()?;
    }

    assembler.finish_program().map_err(|err| AsmParseError {
        line: 0,
        message: err.to_string(),
    })
}

fn define_constant(
    assembler: &mut Assembler,
    symbols: &mut Symbols,
    line: &mut Line<'_>,
    string_only: bool,
) -> Result<(), AsmParseError> {
    let name = line.token("const name")?;
    let literal = line.rest_after(2);
    if literal.is_empty() {
        return Err(line.error("missing const value"));
    }
    let value = if string_only {
        Value::String(parse_string(line, literal)?)
    } else {
        parse_literal(line, literal)?
    };
    let index = assembler.add_constant(value);
    symbols.define_const(line, name, index)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '#' => return &line[..index],
            '/' if line[index..].starts_with("//") => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_literal(line: &Line<'_>, token: &str) -> Result<Value, AsmParseError> {
    if token.starts_with('"') {
        return parse_string(line, token).map(Value::String);
    }
    if token.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if token.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if let Ok(value) = token.parse::<i64>() {
        return Ok(Value::Int(value));
    }
    token
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| line.error(format!("invalid literal '{token}'")))
}

fn parse_string(line: &Line<'_>, token: &str) -> Result<String, AsmParseError> {
    let Some(body) = token.strip_prefix('"') else {
        return Err(line.error("string literal must start with '\"'"));
    };
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((index, ch)) = chars.next() {
        match ch {
            '"' => {
                if !body[index + 1..].trim().is_empty() {
                    return Err(line.error("unexpected characters after string literal"));
                }
                return Ok(out);
            }
            '\\' => {
                let escaped = match chars.next().map(|(_, ch)| ch) {
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some('t') => '\t',
                    Some('0') => '\0',
                    Some('\\') => '\\',
                    Some('"') => '"',
                    Some(other) => return Err(line.error(format!("invalid escape '\\{other}'"))),
                    None => break,
                };
                out.push(escaped);
            }
            other => out.push(other),
        }
    }
    Err(line.error("unterminated string literal"))
}
