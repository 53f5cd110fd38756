//! Socket buffer tuning (§6: "Socket buffers are ≥256 KiB; default 1 MiB").
//!
//! The standard library exposes no portable knob for `SO_RCVBUF`/`SO_SNDBUF`,
//! so this goes through the raw syscall on unix, mirroring how the rest of
//! this workspace reaches for `libc` when it needs a socket option std
//! doesn't surface.

/// Minimum socket buffer size the transport contract requires.
pub const MIN_SOCKET_BUFFER_BYTES: usize = 256 * 1024;
/// Default socket buffer size applied on bind.
pub const DEFAULT_SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

#[cfg(unix)]
mod imp {
	use std::os::fd::AsRawFd;

	pub fn set_recv_buffer_size<S: AsRawFd>(socket: &S, bytes: usize) -> std::io::Result<()> {
		set_opt(socket, libc::SO_RCVBUF, bytes)
	}

	pub fn set_send_buffer_size<S: AsRawFd>(socket: &S, bytes: usize) -> std::io::Result<()> {
		set_opt(socket, libc::SO_SNDBUF, bytes)
	}

	fn set_opt<S: AsRawFd>(socket: &S, opt: libc::c_int, bytes: usize) -> std::io::Result<()> {
		let val = bytes as libc::c_int;

		let result = unsafe {
			libc::setsockopt(
				socket.as_raw_fd(),
				libc::SOL_SOCKET,
				opt,
				&val as *const _ as *const libc::c_void,
				std::mem::size_of::<libc::c_int>() as libc::socklen_t,
			)
		};

		if result == -1 {
			Err(std::io::Error::last_os_error())
		} else {
			Ok(())
		}
	}
}

#[cfg(not(unix))]
mod imp {
	/// Non-unix platforms keep the OS default; the contract's minimum is advisory there.
	pub fn set_recv_buffer_size<S>(_socket: &S, _bytes: usize) -> std::io::Result<()> {
		Ok(())
	}

	pub fn set_send_buffer_size<S>(_socket: &S, _bytes: usize) -> std::io::Result<()> {
		Ok(())
	}
}

pub use imp::{set_recv_buffer_size, set_send_buffer_size};
