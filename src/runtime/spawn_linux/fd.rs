// SPDX-License-Identifier: MIT

//! Construct file descriptors for passing between the parent and child processes.

use std::os::fd::{OwnedFd, RawFd};

use nix::{
    libc,
    sys::socket::{AddressFamily, SockFlag, SockType, socketpair},
};

use crate::runtime::spawn::FdSet;

/// Create a connected pair of bidirectional stream sockets.
///
/// Both ends are close-on-exec; an end only reaches a child through an
/// [`FdSet`] entry.
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
}

/// The descriptors a child inherits, captured before the fork.
///
/// Owns the parent's copies; dropping this closes them, which must happen
/// once the child has started.
pub struct ForkedFd {
    pairs: Vec<(RawFd, RawFd)>,
    floor: RawFd,
    _owned: FdSet,
}

impl ForkedFd {
    pub fn new(config: FdSet) -> Self {
        let pairs = config.raw_pairs();
        let floor = pairs.iter().map(|(_, index)| *index).max().unwrap_or(2) + 1;
        ForkedFd {
            pairs,
            floor,
            _owned: config,
        }
    }

    /// Called by the child process after fork, to install the descriptors.
    ///
    /// This runs between fork and exec, so it only makes async-signal-safe
    /// calls and does not allocate.
    pub fn child_after_fork(&mut self) -> std::io::Result<()> {
        // A source sitting on some other entry's index would be clobbered by
        // that entry's dup2, so move those out of the way first.
        for i in 0..self.pairs.len() {
            let (source, index) = self.pairs[i];
            if source != index && self.pairs.iter().any(|(_, other)| *other == source) {
                let moved = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, self.floor) };
                if moved < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                self.pairs[i].0 = moved;
            }
        }
        for (source, index) in self.pairs.iter().copied() {
            if source == index {
                // dup2 onto itself leaves close-on-exec set.
                let flags = unsafe { libc::fcntl(index, libc::F_GETFD) };
                if flags < 0
                    || unsafe { libc::fcntl(index, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
            } else if unsafe { libc::dup2(source, index) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn socket_pair_is_connected_both_ways() {
        let (a, b) = socket_pair().expect("socketpair failed");
        let mut a = UnixStream::from(a);
        let mut b = UnixStream::from(b);

        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn socket_pair_ends_are_close_on_exec() {
        let (a, b) = socket_pair().expect("socketpair failed");
        for fd in [&a, &b] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert!(flags >= 0);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn floor_sits_above_every_index() {
        let (a, b) = socket_pair().expect("socketpair failed");
        let forked = ForkedFd::new(FdSet::new().inherit(3, a).inherit(7, b));
        assert_eq!(forked.floor, 8);
        assert_eq!(forked.pairs.len(), 2);
    }
}
