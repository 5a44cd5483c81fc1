use std::cell::RefCell;
use std::ffi::c_void;

use super::{StepOutcome, Vm, VmError};
use crate::jit::{STATUS_CONTINUE, STATUS_ERROR, STATUS_HALTED, STATUS_YIELDED};

thread_local! {
    static JIT_BRIDGE_ERROR: RefCell<Option<VmError>> = const { RefCell::new(None) };
}

pub(super) fn clear_bridge_error() {
    JIT_BRIDGE_ERROR.with(|slot| {
        slot.borrow_mut().take();
    });
}

pub(super) fn take_bridge_error() -> Option<VmError> {
    JIT_BRIDGE_ERROR.with(|slot| slot.borrow_mut().take())
}

fn set_bridge_error(err: VmError) {
    JIT_BRIDGE_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(err);
    });
}

/// Helper called by compiled code for every straight-line opcode.
pub(crate) extern "C" fn jit_op_bridge(
    ctx: *mut c_void,
    opcode: u32,
    return_address: *const u8,
) -> i32 {
    // `ctx` is the `*mut Vm` handed to `call_compiled` by `Vm::run_native`.
    let vm = unsafe { &mut *(ctx as *mut Vm) };
    match vm.execute_native_op(opcode, return_address) {
        Ok(StepOutcome::Continue) => STATUS_CONTINUE,
        Ok(StepOutcome::Halted) => STATUS_HALTED,
        Ok(StepOutcome::Yielded) => STATUS_YIELDED,
        Err(err) => {
            set_bridge_error(err);
            STATUS_ERROR
        }
    }
}

/// Helper called by compiled code for conditional branches. Returns the
/// native address execution continues at: the inline jump target, the
/// fallthrough past it, or the trap stub on error.
pub(crate) extern "C" fn jit_branch_bridge(
    ctx: *mut c_void,
    opcode: u32,
    return_address: *const u8,
) -> *const u8 {
    let vm = unsafe { &mut *(ctx as *mut Vm) };
    match vm.execute_native_branch(opcode, return_address) {
        Ok(address) => address,
        Err(err) => {
            set_bridge_error(err);
            match vm.native_trap_address(return_address) {
                Ok(trap) => trap,
                Err(err) => {
                    // There is no address compiled code can safely jump to.
                    tracing::error!(error = %err, "return address outside compiled code");
                    std::process::abort()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_error_slot_is_taken_once() {
        clear_bridge_error();
        set_bridge_error(VmError::DivisionByZero);
        assert!(matches!(take_bridge_error(), Some(VmError::DivisionByZero)));
        assert!(take_bridge_error().is_none());
    }
}
