use std::ffi::c_void;
use std::marker::PhantomData;

use tracing::debug;

use crate::codegen::{
    CodeListing, CodegenError, CodegenResult, CompiledProgram, FunctionId, FunctionRecord,
    FunctionState, HostArch, TargetArch, WORD_BYTES, WordOffset,
};

pub mod memory;
pub mod pc;

pub use memory::ExecutableMemory;
pub use pc::PcResolver;

/// Signature every compiled function is entered through: the interpreter
/// context goes in, a status comes out.
pub type CompiledEntry = unsafe extern "C" fn(*mut c_void) -> i32;

impl<A: TargetArch> CompiledProgram<A> {
    /// Copies the finalized functions into executable memory.
    pub fn freeze(self) -> CodegenResult<FrozenProgram<A>> {
        if self.functions.is_empty() {
            return Err(CodegenError::EmptyProgram);
        }
        let mut functions = self.functions;
        for function in &mut functions {
            function.advance(FunctionState::Dispatchable)?;
        }
        let len_words = self.code.position().get();
        let memory = ExecutableMemory::from_code::<A>(&self.code.to_bytes())?;
        debug!(
            arch = A::SPEC.name,
            functions = functions.len(),
            words = len_words,
            base = ?memory.as_ptr(),
            "froze program"
        );
        Ok(FrozenProgram {
            memory,
            functions,
            len_words,
            _arch: PhantomData,
        })
    }
}

/// Program whose code lives in executable memory and can be dispatched.
pub struct FrozenProgram<A: TargetArch = HostArch> {
    memory: ExecutableMemory,
    functions: Vec<FunctionRecord>,
    len_words: u32,
    _arch: PhantomData<A>,
}

impl<A: TargetArch> std::fmt::Debug for FrozenProgram<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenProgram")
            .field("arch", &A::SPEC.name)
            .field("base", &self.memory.as_ptr())
            .field("len_words", &self.len_words)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl<A: TargetArch> FrozenProgram<A> {
    pub fn base(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    pub fn len_words(&self) -> u32 {
        self.len_words
    }

    pub fn functions(&self) -> &[FunctionRecord] {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.functions.get(id.index())
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn function_at(&self, at: WordOffset) -> Option<&FunctionRecord> {
        self.functions.iter().find(|function| function.contains(at))
    }

    pub fn read_word(&self, at: WordOffset) -> CodegenResult<u32> {
        let address = self.address_of(at)?;
        // In bounds and aligned, and the mapping stays readable.
        Ok(unsafe { std::ptr::read(address as *const u32) })
    }

    pub fn address_of(&self, at: WordOffset) -> CodegenResult<*const u8> {
        if at.get() >= self.len_words {
            return Err(CodegenError::OffsetOutOfRange {
                offset: at,
                len_words: self.len_words as usize,
            });
        }
        Ok(self.memory.as_ptr().wrapping_add(at.byte_offset()))
    }

    pub fn offset_of_address(&self, address: *const u8) -> CodegenResult<WordOffset> {
        if !self.memory.contains(address) {
            return Err(CodegenError::AddressOutOfRange(address as usize as u64));
        }
        WordOffset::from_byte_offset(address as usize - self.memory.as_ptr() as usize)
    }

    pub fn resolver(&self) -> PcResolver<'_, A> {
        PcResolver::new(self)
    }

    pub fn listing(&self) -> CodeListing {
        let words = (0..self.len_words)
            .map(|index| self.read_word(WordOffset::new(index)).unwrap_or_default())
            .collect();
        CodeListing {
            arch: A::SPEC.name,
            words,
            functions: self.functions.clone(),
        }
    }

    pub fn entry_point(&self, id: FunctionId) -> CodegenResult<EntryPoint<'_>> {
        let function = self
            .function(id)
            .ok_or(CodegenError::InvalidEntry(WordOffset::ZERO))?;
        self.entry_at(function.start)
    }

    /// Entry point of the secondary prologue registered under `key`.
    pub fn resume_point(&self, id: FunctionId, key: u32) -> CodegenResult<EntryPoint<'_>> {
        let function = self
            .function(id)
            .ok_or(CodegenError::InvalidEntry(WordOffset::ZERO))?;
        let entry = function
            .secondary_entry(key)
            .ok_or(CodegenError::InvalidEntry(function.start))?;
        self.entry_at(entry.prologue)
    }

    /// Typed handle for the prologue at `at`. Refuses anything that is not
    /// the raw start of a function or of one of its secondary entries.
    pub fn entry_at(&self, at: WordOffset) -> CodegenResult<EntryPoint<'_>> {
        if !A::IS_HOST {
            return Err(CodegenError::ForeignTarget(A::SPEC.name));
        }
        let function = self
            .function_at(at)
            .filter(|function| function.is_dispatch_target(at))
            .ok_or(CodegenError::InvalidEntry(at))?;
        if function.state != FunctionState::Dispatchable {
            return Err(CodegenError::InvalidFunctionState {
                function: function.name.clone(),
                from: function.state,
                to: FunctionState::Dispatchable,
            });
        }
        let address = self.address_of(at)?;
        if address as usize % WORD_BYTES != 0 {
            return Err(CodegenError::MisalignedAddress(address as usize));
        }
        // The address is the first word of an emitted prologue for the
        // host backend, which follows the `CompiledEntry` ABI.
        let entry = unsafe { std::mem::transmute::<*const u8, CompiledEntry>(address) };
        Ok(EntryPoint {
            entry,
            offset: at,
            _memory: PhantomData,
        })
    }

    /// Runs the compiled code at `entry` with `ctx` as its only argument
    /// and returns the status it produced.
    ///
    /// # Safety
    ///
    /// `ctx` must be whatever the helpers embedded in this program expect
    /// to receive, and those helpers must still be valid functions.
    pub unsafe fn call_compiled(&self, entry: WordOffset, ctx: *mut c_void) -> CodegenResult<i32> {
        let entry = self.entry_at(entry)?;
        Ok(unsafe { entry.call(ctx) })
    }
}

/// Callable entry into a frozen program, borrowed from its memory.
#[derive(Clone, Copy)]
pub struct EntryPoint<'m> {
    entry: CompiledEntry,
    offset: WordOffset,
    _memory: PhantomData<&'m ExecutableMemory>,
}

impl EntryPoint<'_> {
    pub fn offset(&self) -> WordOffset {
        self.offset
    }

    pub fn address(&self) -> *const u8 {
        self.entry as *const u8
    }

    /// # Safety
    ///
    /// See [`FrozenProgram::call_compiled`].
    pub unsafe fn call(&self, ctx: *mut c_void) -> i32 {
        unsafe { (self.entry)(ctx) }
    }
}

impl std::fmt::Debug for EntryPoint<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("offset", &self.offset)
            .field("address", &self.address())
            .finish()
    }
}
