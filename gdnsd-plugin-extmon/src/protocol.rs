// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Wire format for the handshake between the daemon and its privileged
//! monitoring helper. The handshake tokens and the 16-bit big-endian
//! command count are fixed; the command-frame and result-frame layouts
//! are private to this pair of binaries, so parent and helper share this
//! module to stay in lockstep.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const HELO: &[u8] = b"HELO";
pub const HELO_ACK: &[u8] = b"HELO_ACK";
pub const CMDS_PREFIX: &[u8] = b"CMDS:";
pub const CMDS_ACK: &[u8] = b"CMDS_ACK";
pub const CMD_ACK: &[u8] = b"CMD_ACK";
pub const END_CMDS: &[u8] = b"END_CMDS";
pub const END_CMDS_ACK: &[u8] = b"END_CMDS_ACK";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("helper pipe closed (EOF)")]
    Eof,
    #[error("i/o error talking to helper: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake mismatch: expected {expected:?}, got {got:?}")]
    Handshake { expected: Vec<u8>, got: Vec<u8> },
    #[error("monitor index {0} out of range")]
    IndexOutOfRange(u32),
}

/// One command frame: a monitor's service parameters, with `%%ITEM%%`
/// already substituted into each arg.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub idx: u32,
    pub timeout: u32,
    pub interval: u32,
    pub args: Vec<String>,
    pub desc: String,
}

async fn write_len_prefixed<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    Ok(())
}

async fn read_len_prefixed<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let len = r.read_u32().await.map_err(map_eof)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await.map_err(map_eof)?;
    Ok(buf)
}

fn map_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Eof
    } else {
        ProtocolError::Io(e)
    }
}

/// Writes one self-delimited command frame: fixed fields, then each arg
/// and the description, each length-prefixed.
pub async fn write_command<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    frame: &CommandFrame,
) -> Result<(), ProtocolError> {
    w.write_u32(frame.idx).await?;
    w.write_u32(frame.timeout).await?;
    w.write_u32(frame.interval).await?;
    w.write_u32(frame.args.len() as u32).await?;
    for arg in &frame.args {
        write_len_prefixed(w, arg.as_bytes()).await?;
    }
    write_len_prefixed(w, frame.desc.as_bytes()).await?;
    Ok(())
}

pub async fn read_command<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<CommandFrame, ProtocolError> {
    let idx = r.read_u32().await.map_err(map_eof)?;
    let timeout = r.read_u32().await.map_err(map_eof)?;
    let interval = r.read_u32().await.map_err(map_eof)?;
    let num_args = r.read_u32().await.map_err(map_eof)?;
    let mut args = Vec::with_capacity(num_args as usize);
    for _ in 0..num_args {
        let bytes = read_len_prefixed(r).await?;
        args.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    let desc_bytes = read_len_prefixed(r).await?;
    let desc = String::from_utf8_lossy(&desc_bytes).into_owned();
    Ok(CommandFrame {
        idx,
        timeout,
        interval,
        args,
        desc,
    })
}

/// Encodes a result: monitor index in the low 31 bits, failed flag in bit
/// 31.
pub fn encode_result(idx: u32, failed: bool) -> u32 {
    debug_assert!(idx < (1 << 31));
    if failed {
        idx | (1 << 31)
    } else {
        idx
    }
}

pub fn decode_result(word: u32) -> (u32, bool) {
    (word & !(1 << 31), word & (1 << 31) != 0)
}

pub async fn write_result<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    idx: u32,
    failed: bool,
) -> Result<(), ProtocolError> {
    w.write_u32(encode_result(idx, failed)).await?;
    Ok(())
}

/// Reads one 4-byte result frame. Returns `Ok(None)` on a clean EOF, which
/// a total helper failure looks like on the wire; callers map that to the
/// configured failure action rather than treating it as an error here.
pub async fn read_result<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<(u32, bool)>, ProtocolError> {
    let mut buf = [0u8; 4];
    match r.read_exact(&mut buf).await {
        Ok(()) => Ok(Some(decode_result(u32::from_be_bytes(buf)))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

async fn expect_token<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
    expected: &[u8],
) -> Result<(), ProtocolError> {
    let mut buf = vec![0u8; expected.len()];
    r.read_exact(&mut buf).await.map_err(map_eof)?;
    if buf != expected {
        return Err(ProtocolError::Handshake {
            expected: expected.to_vec(),
            got: buf,
        });
    }
    Ok(())
}

/// Parent (daemon) side of the handshake: HELO, then the command count.
pub async fn parent_handshake<W, R>(
    w: &mut W,
    r: &mut R,
    num_monitors: u16,
) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    w.write_all(HELO).await?;
    expect_token(r, HELO_ACK).await?;

    w.write_all(CMDS_PREFIX).await?;
    w.write_u16(num_monitors).await?;
    expect_token(r, CMDS_ACK).await?;

    Ok(())
}

pub async fn parent_send_command<W, R>(
    w: &mut W,
    r: &mut R,
    frame: &CommandFrame,
) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    write_command(w, frame).await?;
    expect_token(r, CMD_ACK).await
}

pub async fn parent_finish_commands<W, R>(w: &mut W, r: &mut R) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    w.write_all(END_CMDS).await?;
    expect_token(r, END_CMDS_ACK).await
}

/// Child (helper) side of the handshake.
pub async fn child_handshake<R, W>(r: &mut R, w: &mut W) -> Result<u16, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    expect_token(r, HELO).await?;
    w.write_all(HELO_ACK).await?;

    expect_token(r, CMDS_PREFIX).await?;
    let count = r.read_u16().await.map_err(map_eof)?;
    w.write_all(CMDS_ACK).await?;

    Ok(count)
}

pub async fn child_recv_command<R, W>(r: &mut R, w: &mut W) -> Result<CommandFrame, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = read_command(r).await?;
    w.write_all(CMD_ACK).await?;
    Ok(frame)
}

pub async fn child_finish_commands<R, W>(r: &mut R, w: &mut W) -> Result<(), ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    expect_token(r, END_CMDS).await?;
    w.write_all(END_CMDS_ACK).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn full_handshake_and_one_command() {
        let (mut parent_w, mut child_r) = duplex(4096);
        let (mut child_w, mut parent_r) = duplex(4096);

        let parent = tokio::spawn(async move {
            parent_handshake(&mut parent_w, &mut parent_r, 1).await.unwrap();
            let frame = CommandFrame {
                idx: 0,
                timeout: 2,
                interval: 5,
                args: vec!["/bin/true".to_string(), "host1".to_string()],
                desc: "m".to_string(),
            };
            parent_send_command(&mut parent_w, &mut parent_r, &frame).await.unwrap();
            parent_finish_commands(&mut parent_w, &mut parent_r).await.unwrap();
            write_result(&mut parent_w, 0, false).await.unwrap();
        });

        let child = tokio::spawn(async move {
            let count = child_handshake(&mut child_r, &mut child_w).await.unwrap();
            assert_eq!(count, 1);
            let frame = child_recv_command(&mut child_r, &mut child_w).await.unwrap();
            assert_eq!(frame.args, vec!["/bin/true", "host1"]);
            child_finish_commands(&mut child_r, &mut child_w).await.unwrap();
        });

        parent.await.unwrap();
        child.await.unwrap();
    }

    #[test]
    fn result_roundtrip() {
        let w = encode_result(12345, true);
        assert_eq!(decode_result(w), (12345, true));
        let w2 = encode_result(7, false);
        assert_eq!(decode_result(w2), (7, false));
    }
}
