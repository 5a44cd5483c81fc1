use std::marker::PhantomData;

use serde::Serialize;
use tracing::{debug, trace};

pub mod backend;
pub mod buffer;

pub use backend::{AArch64, ArchSpec, Arm32, HostArch, TargetArch, X86_64, flush_instruction_cache};
pub use buffer::{CodeBuffer, WORD_BYTES};

/// Position inside a code buffer, counted in 4-byte words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WordOffset(u32);

impl WordOffset {
    pub const ZERO: WordOffset = WordOffset(0);

    pub const fn new(words: u32) -> Self {
        Self(words)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn byte_offset(self) -> usize {
        self.index() * WORD_BYTES
    }

    pub fn from_index(index: usize) -> CodegenResult<Self> {
        u32::try_from(index)
            .map(Self)
            .map_err(|_| CodegenError::BufferFull)
    }

    pub fn from_byte_offset(bytes: usize) -> CodegenResult<Self> {
        if bytes % WORD_BYTES != 0 {
            return Err(CodegenError::MisalignedAddress(bytes));
        }
        Self::from_index(bytes / WORD_BYTES)
    }

    pub fn checked_add(self, words: u32) -> Option<Self> {
        self.0.checked_add(words).map(Self)
    }

    pub fn checked_sub(self, words: u32) -> Option<Self> {
        self.0.checked_sub(words).map(Self)
    }
}

impl std::ops::Add<u32> for WordOffset {
    type Output = WordOffset;

    fn add(self, words: u32) -> WordOffset {
        WordOffset(self.0 + words)
    }
}

impl std::fmt::Display for WordOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    OffsetOutOfRange {
        offset: WordOffset,
        len_words: usize,
    },
    MisalignedAddress(usize),
    AddressOutOfRange(u64),
    OutOfMemory {
        requested_words: usize,
    },
    BufferFull,
    PatchOutsideFunction {
        offset: WordOffset,
        start: WordOffset,
    },
    NoOpenFunction,
    FunctionAlreadyOpen(String),
    UnresolvedFixups {
        function: String,
        count: usize,
    },
    LabelAlreadyBound(Label),
    UnknownLabel(Label),
    BranchOutOfRange {
        at: WordOffset,
        target: WordOffset,
    },
    NotABranch {
        at: WordOffset,
        word: u32,
    },
    SequenceSize {
        sequence: &'static str,
        expected: u32,
        emitted: u32,
    },
    TrapAlreadyMarked(String),
    InvalidEntry(WordOffset),
    ForeignTarget(&'static str),
    InvalidFunctionState {
        function: String,
        from: FunctionState,
        to: FunctionState,
    },
    EmptyProgram,
    Platform(String),
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::OffsetOutOfRange { offset, len_words } => {
                write!(f, "word offset {offset} outside buffer of {len_words} words")
            }
            CodegenError::MisalignedAddress(bytes) => {
                write!(f, "byte offset {bytes} is not word aligned")
            }
            CodegenError::AddressOutOfRange(address) => {
                write!(f, "address 0x{address:X} cannot be encoded for this target")
            }
            CodegenError::OutOfMemory { requested_words } => {
                write!(f, "out of memory growing code buffer to {requested_words} words")
            }
            CodegenError::BufferFull => write!(f, "code buffer exceeds the addressable word range"),
            CodegenError::PatchOutsideFunction { offset, start } => {
                write!(f, "patch at {offset} is before the open function at {start}")
            }
            CodegenError::NoOpenFunction => write!(f, "no function is being generated"),
            CodegenError::FunctionAlreadyOpen(name) => {
                write!(f, "function '{name}' is still being generated")
            }
            CodegenError::UnresolvedFixups { function, count } => {
                write!(f, "function '{function}' ended with {count} unresolved jump(s)")
            }
            CodegenError::LabelAlreadyBound(label) => write!(f, "label {label} bound twice"),
            CodegenError::UnknownLabel(label) => {
                write!(f, "label {label} does not belong to the open function")
            }
            CodegenError::BranchOutOfRange { at, target } => {
                write!(f, "branch at {at} cannot reach {target}")
            }
            CodegenError::NotABranch { at, word } => {
                write!(f, "word 0x{word:08X} at {at} is not a patchable branch")
            }
            CodegenError::SequenceSize {
                sequence,
                expected,
                emitted,
            } => write!(
                f,
                "{sequence} must be {expected} words, backend emitted {emitted}"
            ),
            CodegenError::TrapAlreadyMarked(name) => {
                write!(f, "function '{name}' already has a trap stub")
            }
            CodegenError::InvalidEntry(offset) => {
                write!(f, "{offset} is not an entry point of a compiled function")
            }
            CodegenError::ForeignTarget(arch) => {
                write!(f, "cannot run {arch} code on this host")
            }
            CodegenError::InvalidFunctionState { function, from, to } => write!(
                f,
                "function '{function}' cannot move from {from:?} to {to:?}"
            ),
            CodegenError::EmptyProgram => write!(f, "program has no finalized functions"),
            CodegenError::Platform(message) => write!(f, "platform error: {message}"),
        }
    }
}

impl std::error::Error for CodegenError {}

impl CodegenError {
    /// Errors that leave the open function's words unusable. A session
    /// discards the function when one of these is returned.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodegenError::OffsetOutOfRange { .. }
                | CodegenError::AddressOutOfRange(_)
                | CodegenError::OutOfMemory { .. }
                | CodegenError::BufferFull
                | CodegenError::PatchOutsideFunction { .. }
                | CodegenError::BranchOutOfRange { .. }
                | CodegenError::NotABranch { .. }
                | CodegenError::SequenceSize { .. }
        )
    }
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// Jump target inside the function currently being generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label {
    generation: u32,
    index: u32,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}.{}", self.generation, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FunctionId(usize);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionState {
    Empty,
    Emitting,
    Finalized,
    Dispatchable,
}

/// Prologue placed inside a function body so execution can resume there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SecondaryEntry {
    pub key: u32,
    /// First word of the prologue; this is what gets dispatched to.
    pub prologue: WordOffset,
    /// First word after the prologue.
    pub resume: WordOffset,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionRecord {
    pub name: String,
    pub start: WordOffset,
    /// `start` plus the prologue size.
    pub entry: WordOffset,
    pub end: WordOffset,
    pub trap: Option<WordOffset>,
    pub entries: Vec<SecondaryEntry>,
    pub state: FunctionState,
}

impl FunctionRecord {
    fn new(name: String, start: WordOffset) -> Self {
        Self {
            name,
            start,
            entry: start,
            end: start,
            trap: None,
            entries: Vec::new(),
            state: FunctionState::Empty,
        }
    }

    pub fn contains(&self, at: WordOffset) -> bool {
        self.start <= at && at < self.end
    }

    pub fn secondary_entry(&self, key: u32) -> Option<&SecondaryEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn is_dispatch_target(&self, at: WordOffset) -> bool {
        at == self.start || self.entries.iter().any(|entry| entry.prologue == at)
    }

    pub(crate) fn advance(&mut self, to: FunctionState) -> CodegenResult<()> {
        let allowed = matches!(
            (self.state, to),
            (FunctionState::Empty, FunctionState::Emitting)
                | (FunctionState::Emitting, FunctionState::Finalized)
                | (FunctionState::Finalized, FunctionState::Dispatchable)
        );
        if !allowed {
            return Err(CodegenError::InvalidFunctionState {
                function: self.name.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Word listing of a program, for dumps and tooling.
#[derive(Clone, Debug, Serialize)]
pub struct CodeListing {
    pub arch: &'static str,
    pub words: Vec<u32>,
    pub functions: Vec<FunctionRecord>,
}

impl CodeListing {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for CodeListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "arch {} ({} words)", self.arch, self.words.len())?;
        for function in &self.functions {
            writeln!(
                f,
                "fn {} start={} entry={} end={} state={:?}",
                function.name, function.start, function.entry, function.end, function.state
            )?;
            for (index, word) in self
                .words
                .iter()
                .enumerate()
                .take(function.end.index())
                .skip(function.start.index())
            {
                let at = WordOffset::new(index as u32);
                let mut marks = Vec::new();
                if at == function.entry {
                    marks.push("entry".to_string());
                }
                if function.trap == Some(at) {
                    marks.push("trap".to_string());
                }
                for entry in function.entries.iter().filter(|entry| entry.prologue == at) {
                    marks.push(format!("resume#{}", entry.key));
                }
                if marks.is_empty() {
                    writeln!(f, "  {index:6}: {word:08X}")?;
                } else {
                    writeln!(f, "  {index:6}: {word:08X}  ; {}", marks.join(" "))?;
                }
            }
        }
        Ok(())
    }
}

/// Code and function records produced for one backend.
pub struct CompiledProgram<A: TargetArch = HostArch> {
    pub(crate) code: CodeBuffer,
    pub(crate) functions: Vec<FunctionRecord>,
    _arch: PhantomData<A>,
}

impl<A: TargetArch> Default for CompiledProgram<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: TargetArch> CompiledProgram<A> {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::new(),
            functions: Vec::new(),
            _arch: PhantomData,
        }
    }

    pub fn with_capacity(words: usize) -> CodegenResult<Self> {
        Ok(Self {
            code: CodeBuffer::with_capacity(words)?,
            functions: Vec::new(),
            _arch: PhantomData,
        })
    }

    /// Opens a generation session. The session holds the program
    /// exclusively, so at most one function is ever under construction.
    pub fn session(&mut self) -> CodegenSession<'_, A> {
        CodegenSession {
            program: self,
            arch: A::default(),
            open: None,
            generation: 0,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    pub fn functions(&self) -> &[FunctionRecord] {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.functions.get(id.0)
    }

    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|function| function.name == name)
            .map(FunctionId)
    }

    pub fn listing(&self) -> CodeListing {
        CodeListing {
            arch: A::SPEC.name,
            words: self.code.words().to_vec(),
            functions: self.functions.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FixupKind {
    /// Machine branch word, patched through the backend.
    Branch,
    /// Raw signed distance from the operand word to its target.
    InlineOperand,
}

#[derive(Clone, Copy, Debug)]
struct Fixup {
    at: WordOffset,
    label: Label,
    kind: FixupKind,
}

struct OpenFunction {
    id: FunctionId,
    generation: u32,
    exit: Label,
}

/// Per-pass code generation state: the open function, its labels and
/// pending fixups, and the backend's register bookkeeping.
///
/// Dropping a session while a function is open discards that function.
pub struct CodegenSession<'p, A: TargetArch> {
    program: &'p mut CompiledProgram<A>,
    arch: A,
    open: Option<OpenFunction>,
    /// Bumped by every `begin_function`, so labels never outlive the
    /// function they were made for, even when its id is reused.
    generation: u32,
    labels: Vec<Option<WordOffset>>,
    fixups: Vec<Fixup>,
}

impl<A: TargetArch> CodegenSession<'_, A> {
    pub fn begin_function(&mut self, name: impl Into<String>) -> CodegenResult<FunctionId> {
        let name = name.into();
        if let Some(open) = &self.open {
            let current = self.program.functions[open.id.0].name.clone();
            debug!(requested = %name, open = %current, "function already open");
            return Err(CodegenError::FunctionAlreadyOpen(current));
        }

        self.labels.clear();
        self.fixups.clear();
        self.arch.reset();

        let start = self.program.code.position();
        let id = FunctionId(self.program.functions.len());
        self.program
            .functions
            .push(FunctionRecord::new(name, start));
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let exit = Label {
            generation,
            index: 0,
        };
        self.labels.push(None);
        self.open = Some(OpenFunction {
            id,
            generation,
            exit,
        });

        let prologue = self.emit_fixed(
            "prologue",
            A::SPEC.entry_prologue_size,
            |arch, code| arch.emit_prologue(code),
        );
        if let Err(err) = prologue {
            self.flush_state();
            return Err(err);
        }

        let record = &mut self.program.functions[id.0];
        record.entry = start + A::SPEC.entry_prologue_size;
        if let Err(err) = record.advance(FunctionState::Emitting) {
            self.flush_state();
            return Err(err);
        }
        debug!(function = %record.name, start = %start, arch = A::SPEC.name, "begin function");
        Ok(id)
    }

    pub fn end_function(&mut self) -> CodegenResult<FunctionId> {
        let Some(open) = self.open.as_ref() else {
            return Err(CodegenError::NoOpenFunction);
        };
        let id = open.id;
        let exit = open.exit;
        match self.finish_open(exit) {
            Ok(()) => {
                self.open = None;
                self.labels.clear();
                self.fixups.clear();
                self.arch.reset();
                let record = &self.program.functions[id.0];
                debug!(
                    function = %record.name,
                    words = record.end.get() - record.start.get(),
                    "end function"
                );
                Ok(id)
            }
            Err(err) => {
                debug!(error = %err, "discarding function");
                self.flush_state();
                Err(err)
            }
        }
    }

    fn finish_open(&mut self, exit: Label) -> CodegenResult<()> {
        if self.label_offset(exit).is_none() {
            self.bind_label(exit)?;
        }
        self.emit_fixed("epilogue", A::SPEC.epilogue_size, |arch, code| {
            arch.emit_epilogue(code)
        })?;
        self.arch.finish_function(&mut self.program.code)?;

        let id = self.open_id()?;
        let record = &mut self.program.functions[id.0];
        if !self.fixups.is_empty() {
            return Err(CodegenError::UnresolvedFixups {
                function: record.name.clone(),
                count: self.fixups.len(),
            });
        }
        record.end = self.program.code.position();
        record.advance(FunctionState::Finalized)
    }

    /// Drops every per-function assumption. An open function is discarded
    /// and the buffer rewound to where it started.
    pub fn flush_state(&mut self) {
        if let Some(open) = self.open.take() {
            if let Some(record) = self.program.functions.get(open.id.0) {
                let start = record.start;
                self.program.code.truncate(start);
            }
            self.program.functions.truncate(open.id.0);
        }
        self.labels.clear();
        self.fixups.clear();
        self.arch.reset();
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn position(&self) -> WordOffset {
        self.program.code.position()
    }

    pub fn emit_word(&mut self, word: u32) -> CodegenResult<WordOffset> {
        self.open_id()?;
        let result = self.program.code.emit_word(word);
        self.discard_on_fatal(result)
    }

    pub fn read_word(&self, at: WordOffset) -> CodegenResult<u32> {
        self.program.code.read_word(at)
    }

    /// Overwrites a word of the open function. Words of finalized
    /// functions are never touched.
    pub fn patch_word(&mut self, at: WordOffset, word: u32) -> CodegenResult<()> {
        let id = self.open_id()?;
        let start = self.program.functions[id.0].start;
        let result = if at < start {
            Err(CodegenError::PatchOutsideFunction { offset: at, start })
        } else {
            self.program.code.patch_word(at, word)
        };
        self.discard_on_fatal(result)
    }

    pub fn new_label(&mut self) -> CodegenResult<Label> {
        let generation = self.open_generation()?;
        let label = Label {
            generation,
            index: self.labels.len() as u32,
        };
        self.labels.push(None);
        Ok(label)
    }

    /// Label bound right before the epilogue by `end_function`. Branching
    /// there returns from the function with the current status.
    pub fn exit_label(&self) -> CodegenResult<Label> {
        self.open
            .as_ref()
            .map(|open| open.exit)
            .ok_or(CodegenError::NoOpenFunction)
    }

    pub fn label_offset(&self, label: Label) -> Option<WordOffset> {
        self.slot(label).ok().and_then(|slot| self.labels[slot])
    }

    /// Binds `label` to the current position and resolves every jump
    /// already waiting on it.
    pub fn bind_label(&mut self, label: Label) -> CodegenResult<WordOffset> {
        let slot = self.slot(label)?;
        if self.labels[slot].is_some() {
            return Err(CodegenError::LabelAlreadyBound(label));
        }
        let target = self.program.code.position();
        self.labels[slot] = Some(target);

        let mut pending = Vec::new();
        self.fixups.retain(|fixup| {
            if fixup.label == label {
                pending.push(*fixup);
                false
            } else {
                true
            }
        });
        for fixup in pending {
            let resolved = self.resolve(fixup, target);
            self.discard_on_fatal(resolved)?;
        }
        trace!(%label, %target, "bind label");
        Ok(target)
    }

    pub fn emit_branch(&mut self, label: Label) -> CodegenResult<WordOffset> {
        self.slot(label)?;
        let at = self.emit_fixed("branch", A::SPEC.branch_size, |arch, code| {
            arch.emit_branch(code)
        })?;
        self.jump_to(at, label, FixupKind::Branch)
    }

    /// Branches to `label` when the status register is non-zero.
    pub fn emit_status_check(&mut self, label: Label) -> CodegenResult<WordOffset> {
        self.slot(label)?;
        let at = self.emit_fixed("status check", A::SPEC.status_check_size, |arch, code| {
            arch.emit_status_check(code)
        })?;
        self.jump_to(at, label, FixupKind::Branch)
    }

    /// Emits a data word holding the distance to `label`, to be read back
    /// at run time through the pc resolver.
    pub fn emit_inline_jump(&mut self, label: Label) -> CodegenResult<WordOffset> {
        self.slot(label)?;
        let at = self.emit_word(0)?;
        self.jump_to(at, label, FixupKind::InlineOperand)
    }

    /// Emits a call to `helper(ctx, arg, return_address)` and returns the
    /// offset the pc resolver maps the helper's return address back to.
    pub fn emit_helper_call(&mut self, helper: u64, arg: u32) -> CodegenResult<WordOffset> {
        self.emit_fixed("helper call", A::SPEC.call_site_size, |arch, code| {
            arch.emit_helper_call(code, helper, arg)
        })
    }

    pub fn emit_jump_dispatch(&mut self) -> CodegenResult<WordOffset> {
        self.emit_fixed("jump dispatch", A::SPEC.jump_epilogue_size, |arch, code| {
            arch.emit_jump_dispatch(code)
        })
    }

    pub fn emit_set_status(&mut self, status: u8) -> CodegenResult<WordOffset> {
        self.open_id()?;
        let result = self.arch.emit_set_status(&mut self.program.code, status);
        self.discard_on_fatal(result)
    }

    pub fn emit_nop(&mut self) -> CodegenResult<WordOffset> {
        self.open_id()?;
        let result = self.arch.emit_nop(&mut self.program.code);
        self.discard_on_fatal(result)
    }

    /// Emits a secondary entry keyed by `key`: a full prologue that normal
    /// control flow branches over. Returns the resume offset after it.
    pub fn emit_entry(&mut self, key: u32) -> CodegenResult<WordOffset> {
        let skip = self.new_label()?;
        self.emit_branch(skip)?;
        let prologue = self.position();
        self.emit_fixed("prologue", A::SPEC.entry_prologue_size, |arch, code| {
            arch.emit_prologue(code)
        })?;
        let resume = self.bind_label(skip)?;
        let id = self.open_id()?;
        self.program.functions[id.0].entries.push(SecondaryEntry {
            key,
            prologue,
            resume,
        });
        trace!(key, %prologue, "secondary entry");
        Ok(resume)
    }

    /// Records the current position as the function's trap stub, the
    /// address helpers jump to after reporting an error.
    pub fn mark_trap(&mut self) -> CodegenResult<WordOffset> {
        let id = self.open_id()?;
        let at = self.program.code.position();
        let record = &mut self.program.functions[id.0];
        if record.trap.is_some() {
            return Err(CodegenError::TrapAlreadyMarked(record.name.clone()));
        }
        record.trap = Some(at);
        Ok(at)
    }

    fn jump_to(
        &mut self,
        at: WordOffset,
        label: Label,
        kind: FixupKind,
    ) -> CodegenResult<WordOffset> {
        let fixup = Fixup { at, label, kind };
        match self.label_offset(label) {
            Some(target) => {
                let resolved = self.resolve(fixup, target);
                self.discard_on_fatal(resolved)?;
            }
            None => self.fixups.push(fixup),
        }
        Ok(at)
    }

    fn resolve(&mut self, fixup: Fixup, target: WordOffset) -> CodegenResult<()> {
        match fixup.kind {
            FixupKind::Branch => A::patch_branch(&mut self.program.code, fixup.at, target),
            FixupKind::InlineOperand => {
                let distance = i64::from(target.get()) - i64::from(fixup.at.get());
                let distance = i32::try_from(distance).map_err(|_| {
                    CodegenError::BranchOutOfRange {
                        at: fixup.at,
                        target,
                    }
                })?;
                self.program.code.patch_word(fixup.at, distance as u32)
            }
        }
    }

    fn emit_fixed<T>(
        &mut self,
        sequence: &'static str,
        expected: u32,
        emit: impl FnOnce(&mut A, &mut CodeBuffer) -> CodegenResult<T>,
    ) -> CodegenResult<T> {
        self.open_id()?;
        let before = self.program.code.position();
        let result = emit(&mut self.arch, &mut self.program.code).and_then(|at| {
            let emitted = self.program.code.position().get() - before.get();
            if emitted != expected {
                return Err(CodegenError::SequenceSize {
                    sequence,
                    expected,
                    emitted,
                });
            }
            Ok(at)
        });
        self.discard_on_fatal(result)
    }

    fn discard_on_fatal<T>(&mut self, result: CodegenResult<T>) -> CodegenResult<T> {
        if let Err(err) = &result
            && err.is_fatal()
            && self.open.is_some()
        {
            debug!(error = %err, "discarding function");
            self.flush_state();
        }
        result
    }

    fn open_id(&self) -> CodegenResult<FunctionId> {
        self.open
            .as_ref()
            .map(|open| open.id)
            .ok_or(CodegenError::NoOpenFunction)
    }

    fn open_generation(&self) -> CodegenResult<u32> {
        self.open
            .as_ref()
            .map(|open| open.generation)
            .ok_or(CodegenError::NoOpenFunction)
    }

    fn slot(&self, label: Label) -> CodegenResult<usize> {
        let generation = self.open_generation()?;
        let slot = label.index as usize;
        if label.generation != generation || slot >= self.labels.len() {
            return Err(CodegenError::UnknownLabel(label));
        }
        Ok(slot)
    }
}

impl<A: TargetArch> Drop for CodegenSession<'_, A> {
    fn drop(&mut self) {
        if self.open.is_some() {
            self.flush_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_offset_byte_conversions() {
        assert_eq!(WordOffset::new(3).byte_offset(), 12);
        assert_eq!(WordOffset::from_byte_offset(12).expect("aligned"), WordOffset::new(3));
        assert_eq!(
            WordOffset::from_byte_offset(13),
            Err(CodegenError::MisalignedAddress(13))
        );
    }

    #[test]
    fn state_machine_rejects_skipped_transitions() {
        let mut record = FunctionRecord::new("f".to_string(), WordOffset::ZERO);
        let err = record
            .advance(FunctionState::Finalized)
            .expect_err("empty cannot finalize");
        assert!(matches!(err, CodegenError::InvalidFunctionState { .. }));
        record.advance(FunctionState::Emitting).expect("emitting");
        record.advance(FunctionState::Finalized).expect("finalized");
        record.advance(FunctionState::Dispatchable).expect("dispatchable");
        assert!(record.advance(FunctionState::Emitting).is_err());
    }

    #[test]
    fn labels_from_a_previous_function_are_rejected() {
        let mut program = CompiledProgram::<AArch64>::new();
        let mut session = program.session();
        session.begin_function("first").expect("begin");
        let stale = session.new_label().expect("label");
        session.bind_label(stale).expect("bind");
        session.end_function().expect("end");

        session.begin_function("second").expect("begin");
        let err = session.emit_branch(stale).expect_err("stale label");
        assert_eq!(err, CodegenError::UnknownLabel(stale));
    }

    #[test]
    fn labels_from_a_discarded_function_are_rejected() {
        let mut program = CompiledProgram::<X86_64>::new();
        let mut session = program.session();
        session.begin_function("dropped").expect("begin");
        let stale = session.new_label().expect("label");
        session.flush_state();

        let id = session.begin_function("next").expect("begin");
        assert_eq!(id, FunctionId(0));
        let fresh = session.new_label().expect("label");
        assert_ne!(stale, fresh);
        assert_eq!(
            session.bind_label(stale),
            Err(CodegenError::UnknownLabel(stale))
        );
        session.bind_label(fresh).expect("bind");
    }

    #[test]
    fn listing_marks_entry_and_trap() {
        let mut program = CompiledProgram::<Arm32>::new();
        {
            let mut session = program.session();
            session.begin_function("main").expect("begin");
            session.mark_trap().expect("trap");
            session.emit_set_status(2).expect("status");
            session.end_function().expect("end");
        }
        let text = program.listing().to_string();
        assert!(text.contains("fn main start=@0 entry=@4"));
        assert!(text.contains("; entry trap"));
        let json = program.listing().to_json().expect("json");
        assert!(json.contains("\"state\": \"finalized\""));
    }
}
