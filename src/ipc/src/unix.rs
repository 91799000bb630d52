//! Framed messages and descriptor passing on Unix stream sockets.
//!
//! All calls wait for the whole frame (`MSG_WAITALL` semantics); a peer that closes mid-frame
//! yields [`Error::Disconnected`].
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use crate::{Error, MAX_SEND_FDS};

fn send_all(fd: RawFd, mut buf: &[u8]) -> Result<(), Error> {
    while !buf.is_empty() {
        match socket::send(fd, buf, MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(Error::Disconnected),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn recv_all(fd: RawFd, mut buf: &mut [u8]) -> Result<(), Error> {
    while !buf.is_empty() {
        match socket::recv(fd, buf, MsgFlags::MSG_WAITALL) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => buf = &mut buf[n..],
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Err(Error::Disconnected),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writes one whole frame.
pub fn send_frame<S: AsRawFd>(sock: &S, bytes: &[u8]) -> Result<(), Error> {
    send_all(sock.as_raw_fd(), bytes)
}

/// Reads exactly `buf.len()` bytes.
pub fn recv_frame<S: AsRawFd>(sock: &S, buf: &mut [u8]) -> Result<(), Error> {
    recv_all(sock.as_raw_fd(), buf)
}

/// Writes one whole frame with `fds` attached to its first byte.
pub fn send_frame_with_fds<S: AsRawFd>(sock: &S, bytes: &[u8], fds: &[RawFd]) -> Result<(), Error> {
    if fds.is_empty() {
        return send_frame(sock, bytes);
    }
    let fd = sock.as_raw_fd();
    let iov = [IoSlice::new(bytes)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let sent = loop {
        match sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(Error::Disconnected),
            Err(e) => return Err(e.into()),
        }
    };
    send_all(fd, &bytes[sent..])
}

/// Reads one whole frame that carries exactly `expected` descriptors.
///
/// Descriptors are owned as soon as they are received, so they are closed again on any error,
/// including a count mismatch.
pub fn recv_frame_with_fds<S: AsRawFd>(
    sock: &S,
    buf: &mut [u8],
    expected: usize,
) -> Result<Vec<OwnedFd>, Error> {
    let fds = recv_frame_and_fds(sock, buf)?;
    if fds.len() != expected {
        tracing::debug!(
            "frame carried {} descriptor(s), expected {}",
            fds.len(),
            expected
        );
        return Err(Error::FdCount {
            expected,
            received: fds.len(),
        });
    }
    Ok(fds)
}

/// Reads one whole frame together with whatever descriptors, at most [`MAX_SEND_FDS`], came
/// attached to it.
pub fn recv_frame_and_fds<S: AsRawFd>(sock: &S, buf: &mut [u8]) -> Result<Vec<OwnedFd>, Error> {
    let fd = sock.as_raw_fd();
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_SEND_FDS]);
    let mut fds = Vec::new();
    let (received, truncated) = {
        let mut iov = [IoSliceMut::new(buf)];
        let msg = loop {
            match recvmsg::<UnixAddr>(
                fd,
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => break msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(Error::Disconnected),
                Err(e) => return Err(e.into()),
            }
        };
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: the kernel just installed these descriptors in our table.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC))
    };
    if received == 0 && !buf.is_empty() {
        return Err(Error::Disconnected);
    }
    if truncated {
        // the kernel dropped what did not fit
        tracing::debug!(
            "MSG_CTRUNC on fd {}: kept {} descriptor(s)",
            fd,
            fds.len()
        );
        return Err(Error::FdCount {
            expected: MAX_SEND_FDS,
            received: fds.len(),
        });
    }
    recv_all(fd, &mut buf[received..])?;
    Ok(fds)
}

/// Returns whether at least one byte is waiting on the socket, without blocking.
///
/// A peer that has shut down its write side yields [`Error::Disconnected`].
pub fn has_pending<S: AsRawFd>(sock: &S) -> Result<bool, Error> {
    let mut probe = [0u8; 1];
    loop {
        match socket::recv(
            sock.as_raw_fd(),
            &mut probe,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(_) => return Ok(true),
            Err(Errno::EAGAIN) => return Ok(false),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Err(Error::Disconnected),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::net::UnixStream;

    use crate::SharedRegion;

    #[test]
    fn frame_with_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let r1 = SharedRegion::create("fd-1", 4096).unwrap();
        let r2 = SharedRegion::create("fd-2", 8192).unwrap();
        r1.write_word(0, 1).unwrap();
        r2.write_word(0, 2).unwrap();

        let payload = [7u8; 100];
        send_frame_with_fds(&a, &payload, &[r1.fd(), r2.fd()]).unwrap();

        let mut buf = [0u8; 100];
        let fds = recv_frame_with_fds(&b, &mut buf, 2).unwrap();
        assert_eq!(buf, payload);
        assert_eq!(fds.len(), 2);

        let mut fds = fds.into_iter();
        let peer1 = SharedRegion::open("fd-1", File::from(fds.next().unwrap()), 4096).unwrap();
        let peer2 = SharedRegion::open("fd-2", File::from(fds.next().unwrap()), 8192).unwrap();
        assert_eq!(peer1.read_word(0).unwrap(), 1);
        assert_eq!(peer2.read_word(0).unwrap(), 2);
    }

    #[test]
    fn fd_count_mismatch() {
        let (a, b) = UnixStream::pair().unwrap();
        let r = SharedRegion::create("fd-mismatch", 4096).unwrap();
        send_frame_with_fds(&a, &[1u8; 16], &[r.fd()]).unwrap();
        let mut buf = [0u8; 16];
        let err = recv_frame_with_fds(&b, &mut buf, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::FdCount {
                expected: 2,
                received: 1
            }
        ));
    }

    #[test]
    fn frame_without_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(&a, &[9u8; 32]).unwrap();
        let mut buf = [0u8; 32];
        let fds = recv_frame_and_fds(&b, &mut buf).unwrap();
        assert!(fds.is_empty());
        assert_eq!(buf, [9u8; 32]);
    }

    #[test]
    fn pending_and_disconnect() {
        let (a, b) = UnixStream::pair().unwrap();
        assert!(!has_pending(&b).unwrap());
        send_frame(&a, &[1, 2, 3]).unwrap();
        assert!(has_pending(&b).unwrap());
        let mut buf = [0u8; 3];
        recv_frame(&b, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        drop(a);
        assert!(matches!(has_pending(&b), Err(Error::Disconnected)));
        assert!(matches!(recv_frame(&b, &mut buf), Err(Error::Disconnected)));
    }
}
