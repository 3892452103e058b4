//! Named POSIX shared-memory segments.

use std::io;

#[cfg(unix)]
pub use self::unix::ShmSegment;

#[cfg(not(unix))]
pub use self::unsupported::ShmSegment;

/// Map a user-facing segment name to the OS name (`/name`).
pub fn os_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn invalid_name(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid shared memory name: {name:?}"),
    )
}

#[cfg(unix)]
mod unix {
    use std::ffi::CString;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::ptr::NonNull;

    use tracing::debug;

    use super::{invalid_name, os_name};

    const SHM_MODE: libc::mode_t = 0o600;

    /// A mapped shared-memory segment.
    ///
    /// The creator is the owner and is the only party that unlinks the name.
    /// Dropping a segment unmaps it but never unlinks.
    #[derive(Debug)]
    pub struct ShmSegment {
        name: String,
        c_name: CString,
        ptr: NonNull<u8>,
        len: usize,
        owner: bool,
    }

    // SAFETY: the mapping is process-wide memory; all access goes through raw
    // pointers whose synchronization is the caller's responsibility.
    unsafe impl Send for ShmSegment {}
    unsafe impl Sync for ShmSegment {}

    impl ShmSegment {
        /// Exclusively create and map a segment of `len` bytes.
        ///
        /// Fails with `AlreadyExists` when the name is taken.
        pub fn create(name: &str, len: usize) -> io::Result<Self> {
            if len == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "shared memory length must be non-zero",
                ));
            }
            let c_name = CString::new(os_name(name)).map_err(|_| invalid_name(name))?;
            let size = libc::off_t::try_from(len).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "shared memory length too large")
            })?;

            // SAFETY: c_name is a valid NUL-terminated string.
            let raw = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    SHM_MODE as libc::c_uint,
                )
            };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: shm_open succeeded, the descriptor is ours.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: fd is a valid shared memory descriptor.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: c_name is valid; we created this name above.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }

            match map(&fd, len) {
                Ok(ptr) => {
                    debug!(name, len, "created shared memory segment");
                    Ok(Self {
                        name: name.to_string(),
                        c_name,
                        ptr,
                        len,
                        owner: true,
                    })
                }
                Err(err) => {
                    // SAFETY: c_name is valid; we created this name above.
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                    Err(err)
                }
            }
        }

        /// Map an existing segment without taking ownership.
        pub fn open(name: &str) -> io::Result<Self> {
            let c_name = CString::new(os_name(name)).map_err(|_| invalid_name(name))?;

            // SAFETY: c_name is a valid NUL-terminated string.
            let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: shm_open succeeded, the descriptor is ours.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: zeroed stat is a valid out-parameter; fd is valid.
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let len = usize::try_from(stat.st_size).unwrap_or(0);
            if len == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "shared memory segment is empty",
                ));
            }

            let ptr = map(&fd, len)?;
            debug!(name, len, "attached shared memory segment");
            Ok(Self {
                name: name.to_string(),
                c_name,
                ptr,
                len,
                owner: false,
            })
        }

        /// Remove a segment name regardless of ownership.
        pub fn unlink_name(name: &str) -> io::Result<()> {
            let c_name = CString::new(os_name(name)).map_err(|_| invalid_name(name))?;
            // SAFETY: c_name is a valid NUL-terminated string.
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Unlink the name if this handle owns it. Missing names are ignored.
        pub fn unlink(&mut self) -> io::Result<()> {
            if !self.owner {
                return Ok(());
            }
            self.owner = false;
            // SAFETY: c_name is a valid NUL-terminated string.
            if unsafe { libc::shm_unlink(self.c_name.as_ptr()) } < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err);
                }
            }
            debug!(name = %self.name, "unlinked shared memory segment");
            Ok(())
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn is_owner(&self) -> bool {
            self.owner
        }

        /// Base of the mapping. Valid for `len()` bytes while `self` lives.
        pub fn as_ptr(&self) -> *mut u8 {
            self.ptr.as_ptr()
        }
    }

    impl Drop for ShmSegment {
        fn drop(&mut self) {
            // SAFETY: ptr/len describe a mapping created by `map` and not yet unmapped.
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }

    fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: fd is a valid descriptor sized to at least `len` bytes.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }
}

#[cfg(not(unix))]
mod unsupported {
    use std::io;

    /// Shared memory is only implemented on Unix platforms.
    #[derive(Debug)]
    pub struct ShmSegment {
        _private: (),
    }

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "shared memory rings require a unix platform",
        )
    }

    impl ShmSegment {
        pub fn create(_name: &str, _len: usize) -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn open(_name: &str) -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn unlink_name(_name: &str) -> io::Result<()> {
            Err(unsupported())
        }

        pub fn unlink(&mut self) -> io::Result<()> {
            Err(unsupported())
        }

        pub fn name(&self) -> &str {
            ""
        }

        pub fn len(&self) -> usize {
            0
        }

        pub fn is_empty(&self) -> bool {
            true
        }

        pub fn is_owner(&self) -> bool {
            false
        }

        pub fn as_ptr(&self) -> *mut u8 {
            std::ptr::null_mut()
        }
    }
}
