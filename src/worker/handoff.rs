//! Connection-ownership transfer between worker processes.
//!
//! A handoff is one `sendmsg` on the target identity's routing socket: the
//! connection descriptor rides as SCM_RIGHTS ancillary data, the in-band
//! payload is a 4-byte length followed by the bytes already consumed from
//! the connection. The routing socket pair is persistent, so the length
//! header is what tells the receiver where the prefix ends.
//!
//! Once the message is sent the sender must drop its copy of the
//! connection; ownership has moved.

use crate::error::{BroodError, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on the consumed-prefix bytes a handoff may carry. Identity
/// sniffing only ever reads the front of a request, so anything larger is a
/// protocol violation, not a big request.
pub const MAX_PREFIX_LEN: usize = 64 * 1024;

/// Forward `conn`'s descriptor plus its consumed prefix to the process
/// reading the other end of `channel`.
pub fn send_handoff(channel: &UnixStream, conn: &TcpStream, prefix: &[u8]) -> Result<()> {
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(BroodError::Handoff(format!(
            "prefix of {} bytes exceeds the {} byte limit",
            prefix.len(),
            MAX_PREFIX_LEN
        )));
    }

    let header = (prefix.len() as u32).to_be_bytes();
    let fds = [conn.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&header), IoSlice::new(prefix)];

    let sent = loop {
        match sendmsg::<UnixAddr>(
            channel.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        ) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(BroodError::Handoff(format!("sendmsg: {}", e)));
            }
        }
    };

    // Short send: the descriptor went with the first segment, finish the
    // rest of the payload in-band.
    let total = header.len() + prefix.len();
    if sent < total {
        let mut rest = Vec::with_capacity(total - sent);
        if sent < header.len() {
            rest.extend_from_slice(&header[sent..]);
            rest.extend_from_slice(prefix);
        } else {
            rest.extend_from_slice(&prefix[sent - header.len()..]);
        }
        let mut writer = channel;
        writer
            .write_all(&rest)
            .map_err(|e| BroodError::Handoff(format!("prefix write: {}", e)))?;
    }

    Ok(())
}

/// Receive one handoff from `channel`: the reconstructed stream and the
/// exact prefix the sender consumed before forwarding.
pub fn recv_handoff(channel: &UnixStream) -> Result<(TcpStream, Vec<u8>)> {
    let (bytes, fd, mut payload) = recv_one(channel, MsgFlags::empty())?;

    if bytes == 0 && fd.is_none() {
        return Err(BroodError::Handoff("routing socket closed".to_string()));
    }
    let fd = fd.ok_or_else(|| {
        BroodError::Handoff("no descriptor in ancillary data".to_string())
    })?;

    // The header may itself arrive short; complete it in-band.
    while payload.len() < 4 {
        let mut byte = [0u8; 1];
        let mut reader = channel;
        reader
            .read_exact(&mut byte)
            .map_err(|e| BroodError::Handoff(format!("header read: {}", e)))?;
        payload.push(byte[0]);
    }

    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if len > MAX_PREFIX_LEN {
        return Err(BroodError::Handoff(format!(
            "declared prefix of {} bytes exceeds the {} byte limit",
            len, MAX_PREFIX_LEN
        )));
    }

    let mut prefix = payload.split_off(4);
    if prefix.len() > len {
        return Err(BroodError::Handoff(format!(
            "prefix overrun: got {} bytes, declared {}",
            prefix.len(),
            len
        )));
    }
    if prefix.len() < len {
        let start = prefix.len();
        prefix.resize(len, 0);
        let mut reader = channel;
        reader
            .read_exact(&mut prefix[start..])
            .map_err(|e| BroodError::Handoff(format!("prefix read: {}", e)))?;
    }

    Ok((TcpStream::from(fd), prefix))
}

/// Drain and discard queued handoffs during shutdown so that no forwarding
/// peer is left blocked on its send. Returns how many were dropped.
pub fn drain_rejected(channel: &UnixStream) -> usize {
    let mut dropped = 0;
    loop {
        match recv_one(channel, MsgFlags::MSG_DONTWAIT) {
            Ok((0, None, _)) => break,
            Ok((_, fd, payload)) => {
                // Consume the rest of the prefix so the stream stays in
                // sync, then let the descriptor close.
                if payload.len() >= 4 {
                    let len = u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) as usize;
                    let got = payload.len() - 4;
                    if len <= MAX_PREFIX_LEN && got < len {
                        let mut sink = vec![0u8; len - got];
                        let mut reader = channel;
                        let _ = reader.read_exact(&mut sink);
                    }
                }
                drop(fd);
                dropped += 1;
                tracing::warn!("dropped forwarded connection during shutdown");
            }
            Err(_) => break,
        }
    }
    dropped
}

/// One recvmsg carrying at most one descriptor. Returns
/// (bytes, descriptor, payload); EAGAIN under MSG_DONTWAIT maps to
/// (0, None, empty).
fn recv_one(
    channel: &UnixStream,
    flags: MsgFlags,
) -> Result<(usize, Option<OwnedFd>, Vec<u8>)> {
    let mut buf = vec![0u8; 4 + MAX_PREFIX_LEN];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        match recvmsg::<UnixAddr>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            flags,
        ) {
            Ok(msg) => {
                let mut fd = None;
                for cmsg in msg
                    .cmsgs()
                    .map_err(|e| BroodError::Handoff(format!("cmsgs: {}", e)))?
                {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        for (i, raw) in raw_fds.into_iter().enumerate() {
                            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                            if i == 0 && fd.is_none() {
                                fd = Some(owned);
                            }
                            // Extra descriptors close on drop.
                        }
                    }
                }
                let bytes = msg.bytes;
                return Ok((bytes, fd, buf[..bytes].to_vec()));
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) if flags.contains(MsgFlags::MSG_DONTWAIT) => {
                return Ok((0, None, Vec::new()));
            }
            Err(e) => {
                return Err(BroodError::Handoff(format!("recvmsg: {}", e)));
            }
        }
    }
}
