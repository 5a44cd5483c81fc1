use crate::codegen::{CodegenError, CodegenResult, TargetArch, flush_instruction_cache};

/// Mapped region holding finalized machine code.
///
/// The region is written while mapped read/write, then re-protected
/// read/execute and flushed from the instruction cache. It is never
/// written again, which is what makes sharing it across threads sound.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

// The mapping is immutable after `from_code` returns.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    pub fn from_code<A: TargetArch>(code: &[u8]) -> CodegenResult<Self> {
        let len = code.len();
        if len == 0 {
            return Err(CodegenError::Platform(
                "cannot create executable region for empty code".to_string(),
            ));
        }
        let ptr = alloc_executable_region(len)?;
        let memory = Self { ptr, len };
        write_machine_code(ptr, code)?;
        finalize_executable_region(ptr, len)?;
        flush_instruction_cache::<A>(ptr, len);
        Ok(memory)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, address: *const u8) -> bool {
        let start = self.ptr as usize;
        let address = address as usize;
        address >= start && address < start + self.len
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Err(err) = free_executable_region(self.ptr, self.len) {
            tracing::warn!(error = %err, "failed to release executable memory");
        }
    }
}

/// Invalidates the instruction cache for `len` bytes at `start`.
#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
pub(crate) fn clear_icache(start: *const u8, len: usize) {
    #[cfg(target_os = "macos")]
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, len);
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(len) as *mut libc::c_char,
        );
    }

    #[cfg(target_os = "windows")]
    {
        use windows_sys::Win32::System::{
            Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
        };
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), start as *const _, len);
        }
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    let _ = (start, len);
}

fn write_machine_code(ptr: *mut u8, code: &[u8]) -> CodegenResult<()> {
    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(target_os = "macos"))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }

    Ok(())
}

#[cfg(target_os = "windows")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> CodegenResult<()> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(CodegenError::Platform(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(CodegenError::Platform(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> CodegenResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(CodegenError::Platform(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> CodegenResult<()> {
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> CodegenResult<()> {
    Ok(())
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> CodegenResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(CodegenError::Platform(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> CodegenResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CodegenError::Platform(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> CodegenResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CodegenError::Platform(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_executable_region(_len: usize) -> CodegenResult<*mut u8> {
    Err(CodegenError::Platform(
        "executable memory allocation not implemented for this platform".to_string(),
    ))
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> CodegenResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(CodegenError::Platform(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> CodegenResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(CodegenError::Platform(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> CodegenResult<()> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(
    unix,
    not(target_os = "macos"),
    any(target_arch = "aarch64", target_arch = "arm")
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
