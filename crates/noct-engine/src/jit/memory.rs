//! Code memory
//!
//! W^X-safe mapping for the JIT code region: map, unmap, and the
//! writable/executable transitions, with the instruction-cache flush the
//! target ISA requires. Platforms with hard W^X get their native escape
//! hatches: Apple maps with `MAP_JIT` and toggles the per-thread write
//! protection; NetBSD/FreeBSD declare the maximum protection up front.

#![allow(unused_variables)]

/// Map a region for generated code, initially writable.
#[cfg(unix)]
pub(crate) fn map_region(size: usize) -> Option<*mut u8> {
    unsafe {
        #[cfg(target_vendor = "apple")]
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        );
        #[cfg(all(target_os = "freebsd", not(target_vendor = "apple")))]
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            // PROT_MAX(m) is (m) << 16 on FreeBSD.
            libc::PROT_READ
                | libc::PROT_WRITE
                | libc::PROT_EXEC
                | ((libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) << 16),
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );
        #[cfg(not(any(target_vendor = "apple", target_os = "freebsd")))]
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return None;
        }
        #[cfg(target_vendor = "apple")]
        libc::pthread_jit_write_protect_np(0);
        std::ptr::write_bytes(ptr as *mut u8, 0, size);
        Some(ptr as *mut u8)
    }
}

/// Unmap a code region.
#[cfg(unix)]
pub(crate) fn unmap_region(base: *mut u8, size: usize) {
    unsafe {
        libc::munmap(base as *mut libc::c_void, size);
    }
}

/// Make the region readable and writable, not executable.
#[cfg(unix)]
pub(crate) fn make_writable(base: *mut u8, size: usize) {
    unsafe {
        #[cfg(target_vendor = "apple")]
        {
            libc::pthread_jit_write_protect_np(0);
        }
        #[cfg(not(target_vendor = "apple"))]
        {
            libc::mprotect(
                base as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            );
        }
    }
}

/// Make the region readable and executable, not writable, flushing the
/// instruction cache over the range.
#[cfg(unix)]
pub(crate) fn make_executable(base: *mut u8, size: usize) {
    unsafe {
        #[cfg(target_vendor = "apple")]
        {
            libc::pthread_jit_write_protect_np(1);
        }
        #[cfg(not(target_vendor = "apple"))]
        {
            libc::mprotect(
                base as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            );
        }
        flush_icache(base, size);
    }
}

#[cfg(unix)]
unsafe fn flush_icache(base: *mut u8, size: usize) {
    // x86 keeps data and instruction views coherent; other ISAs need the
    // explicit flush.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        extern "C" {
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }
        __clear_cache(
            base as *mut core::ffi::c_char,
            base.add(size) as *mut core::ffi::c_char,
        );
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let _ = (base, size);
    }
}

// Non-unix hosts have no code-memory backend; emission is disabled and
// execution stays on the interpreter.

#[cfg(not(unix))]
pub(crate) fn map_region(_size: usize) -> Option<*mut u8> {
    None
}

#[cfg(not(unix))]
pub(crate) fn unmap_region(_base: *mut u8, _size: usize) {}

#[cfg(not(unix))]
pub(crate) fn make_writable(_base: *mut u8, _size: usize) {}

#[cfg(not(unix))]
pub(crate) fn make_executable(_base: *mut u8, _size: usize) {}
