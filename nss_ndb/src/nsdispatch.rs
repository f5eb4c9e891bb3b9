//! Registration with the BSD `nsdispatch(3)` switch.
//!
//! The method table and its `va_list` unpacking live in `csrc/nsdispatch.c`
//! (built by `build.rs`); this module only exports the entry point the
//! dispatcher looks up after loading the shared object.

use std::ffi::{c_char, c_uint};

/// `ns_mtab` from `<nsswitch.h>`; only ever handled by pointer.
#[repr(C)]
pub struct NsMtab {
    _private: [u8; 0],
}

pub type UnregisterFn = unsafe extern "C" fn(*mut NsMtab, c_uint);

extern "C" {
    fn ndb_nsdispatch_methods(len: *mut c_uint) -> *mut NsMtab;
}

#[no_mangle]
pub unsafe extern "C" fn nss_module_register(
    _source: *const c_char,
    mtabsize: *mut c_uint,
    unregister: *mut Option<UnregisterFn>,
) -> *mut NsMtab {
    if mtabsize.is_null() {
        return std::ptr::null_mut();
    }
    if !unregister.is_null() {
        // The table is static; there is nothing to release.
        unsafe { *unregister = None };
    }
    unsafe { ndb_nsdispatch_methods(mtabsize) }
}
