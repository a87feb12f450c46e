use std::io;
use std::ptr;

use crate::error::Error;

/// A page-aligned memory region that goes writable → executable → called.
///
/// The region is never writable and executable at the same time: it is
/// mapped read-write, filled by [`write`](ExecutableRegion::write), flipped
/// to read-execute by [`finalize`](ExecutableRegion::finalize), and only
/// then may [`call`](ExecutableRegion::call) run it. Unmapped on drop.
pub struct ExecutableRegion {
    ptr: *mut u8,
    capacity: usize,
    len: usize,
    executable: bool,
}

impl ExecutableRegion {
    pub fn reserve(size: usize) -> Result<ExecutableRegion, Error> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let capacity = crate::codegen::align_up(size.max(1), page.max(1));

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::io("<executable region>")(io::Error::last_os_error()));
        }

        Ok(ExecutableRegion {
            ptr: ptr as *mut u8,
            capacity,
            len: 0,
            executable: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let need = self.len + bytes.len();
        if need > self.capacity {
            return Err(Error::AssemblerCapacity {
                need,
                capacity: self.capacity,
            });
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.len), bytes.len());
        }
        self.len = need;
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), Error> {
        let rc = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(Error::io("<executable region>")(io::Error::last_os_error()));
        }
        self.executable = true;
        Ok(())
    }

    /// Runs the emitted code with the tape head pointer as its argument.
    ///
    /// # Safety
    ///
    /// The region must contain a complete function for the host ABI and
    /// `finalize` must have succeeded.
    pub unsafe fn call(&self, tape: *mut u8) {
        debug_assert!(self.executable);
        let entry: extern "C" fn(*mut u8) = std::mem::transmute(self.ptr);
        entry(tape);
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_past_capacity_is_reported() {
        let mut region = ExecutableRegion::reserve(16).unwrap();
        let big = vec![0x90u8; region.capacity() + 1];
        let err = region.write(&big).unwrap_err();
        assert!(matches!(err, Error::AssemblerCapacity { .. }));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn round_trip_through_executable_memory() {
        // mov byte [rdi], 42; ret
        let code = [0xc6u8, 0x07, 0x2a, 0xc3];
        let mut region = ExecutableRegion::reserve(code.len()).unwrap();
        region.write(&code).unwrap();
        region.finalize().unwrap();
        let mut cell = 0u8;
        unsafe { region.call(&mut cell) };
        assert_eq!(cell, 42);
    }
}
