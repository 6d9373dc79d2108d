//! Async length-prefixed frame codec over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`. This is one
//! stable choice among many that satisfy the chunk-boundary-preserving,
//! self-delimiting contract; decoding a truncated or oversized frame is a
//! `wire.malformed` condition surfaced as [`io::ErrorKind::InvalidData`].

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Sends a postcard-serialized message with a 4-byte BE length prefix.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Receives and deserializes a length-prefixed postcard message.
///
/// Fails with `InvalidData` ("wire.malformed") on a truncated frame, an
/// oversized length prefix, or a payload that doesn't decode as `T`.
pub async fn recv<T: for<'de> Deserialize<'de>>(r: &mut (impl AsyncRead + Unpin)) -> io::Result<T> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes(hdr);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecInputFrame, ExecRequest, ExecStreamResponse};

    #[tokio::test]
    async fn roundtrip_exec_request() {
        let req = ExecRequest {
            command: vec!["echo".into(), "hello".into()],
            tty: true,
            entropy_seed: None,
            env: Some(vec!["PATH=/usr/bin".into()]),
            cwd: Some("/tmp".into()),
        };

        let (mut c, mut s) = tokio::io::duplex(4096);
        send(&mut c, &req).await.unwrap();
        let got: ExecRequest = recv(&mut s).await.unwrap();
        assert_eq!(got.command, vec!["echo", "hello"]);
        assert!(got.tty);
        assert_eq!(got.cwd.as_deref(), Some("/tmp"));
    }

    #[tokio::test]
    async fn roundtrip_input_frames() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        send(&mut c, &ExecInputFrame::Stdin(b"hi".to_vec()))
            .await
            .unwrap();
        send(&mut c, &ExecInputFrame::Resize { cols: 80, rows: 24 })
            .await
            .unwrap();
        send(&mut c, &ExecInputFrame::Signal(2)).await.unwrap();
        send(&mut c, &ExecInputFrame::Eof).await.unwrap();

        let m: ExecInputFrame = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecInputFrame::Stdin(d) if d == b"hi"));
        let m: ExecInputFrame = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecInputFrame::Resize { cols: 80, rows: 24 }));
        let m: ExecInputFrame = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecInputFrame::Signal(2)));
        let m: ExecInputFrame = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecInputFrame::Eof));
    }

    #[tokio::test]
    async fn exit_is_terminal_and_ordered() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        send(&mut c, &ExecStreamResponse::Stdout(b"hello\n".to_vec()))
            .await
            .unwrap();
        send(
            &mut c,
            &ExecStreamResponse::Exit {
                exit_code: 0,
                message: String::new(),
            },
        )
        .await
        .unwrap();

        let m: ExecStreamResponse = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecStreamResponse::Stdout(d) if d == b"hello\n"));
        let m: ExecStreamResponse = recv(&mut s).await.unwrap();
        assert!(matches!(m, ExecStreamResponse::Exit { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(32u32 * 1024 * 1024).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let mut cursor = io::Cursor::new(buf);
        let result: io::Result<ExecRequest> = recv(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_truncated_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]); // shorter than declared length
        let mut cursor = io::Cursor::new(buf);
        let result: io::Result<ExecRequest> = recv(&mut cursor).await;
        assert!(result.is_err());
    }

}
