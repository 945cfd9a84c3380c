//! Contract-violation reporting.
//!
//! Misusing the library (for example mutating a table whose iterator lock
//! is still held by a leaked iterator, or configuring an out-of-range load
//! factor) is a bug in the calling program, not a recoverable condition.
//! Such violations invoke an installable printer and then terminate the
//! process. Tests install a hook that panics so the paths can be observed
//! with `catch_unwind`.

use core::mem;
use core::ptr;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering;

use cfg_if::cfg_if;

static HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install a printer to be called with the violation message before the
/// process terminates.
///
/// The hook may diverge (e.g. panic); if it returns, the process is
/// aborted. The message is not newline terminated.
pub fn set_fatal_hook(hook: fn(&str)) {
    HOOK.store(hook as *mut (), Ordering::Relaxed);
}

/// Report a contract violation and terminate.
pub(crate) fn fatal(msg: &str) -> ! {
    let hook = HOOK.load(Ordering::Relaxed);
    if hook.is_null() {
        #[cfg(feature = "std")]
        eprintln!("fatal rh-hash error: {msg}");
    } else {
        // SAFETY: the pointer was stored by `set_fatal_hook` and is always
        // a valid `fn(&str)`.
        let hook: fn(&str) = unsafe { mem::transmute(hook) };
        hook(msg);
    }

    cfg_if! {
        if #[cfg(feature = "std")] {
            std::process::abort();
        } else {
            panic!("fatal rh-hash error: {}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panicking_hook(msg: &str) {
        panic!("hook: {msg}");
    }

    #[test]
    fn hook_runs_before_termination() {
        set_fatal_hook(panicking_hook);
        let err = std::panic::catch_unwind(|| fatal("boom")).unwrap_err();
        let msg = err.downcast_ref::<alloc::string::String>().unwrap();
        assert!(msg.contains("boom"));
    }
}
