use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Largest plaintext carried by a single sealed record.
pub const MAX_PAYLOAD: usize = 0x3fff;

const SUBKEY_INFO: &[u8] = b"acp stream subkey";

/// Authenticated encryption over any byte stream, keyed by the pre-shared
/// key from the config.
///
/// Each direction starts with a random salt from which a direction
/// subkey is derived with HKDF-SHA256. After the salt, the stream is a
/// sequence of records `[u16 BE ciphertext length][ciphertext]`, sealed
/// with ChaCha20-Poly1305 under a counter nonce. A tag mismatch surfaces
/// as an `InvalidData` read error and poisons the stream.
pub struct EncryptedStream<S> {
    inner: S,
    psk: Vec<u8>,

    // write half: wbuf holds wire bytes not yet accepted by `inner`
    // (the salt header first, then one sealed record at a time)
    seal: ChaCha20Poly1305,
    seal_nonce: u64,
    wbuf: Vec<u8>,
    wpos: usize,

    // read half: rbuf accumulates exactly the bytes the current phase
    // needs; plain holds opened payload not yet handed to the caller
    open: Option<ChaCha20Poly1305>,
    open_nonce: u64,
    rphase: ReadPhase,
    rbuf: Vec<u8>,
    rfill: usize,
    plain: Vec<u8>,
    ppos: usize,
}

#[derive(Clone, Copy, Debug)]
enum ReadPhase {
    Salt,
    Len,
    Record(usize),
}

fn subkey(psk: &[u8], salt: &[u8]) -> ChaCha20Poly1305 {
    let hk = Hkdf::<Sha256>::new(Some(salt), psk);
    let mut key = [0u8; 32];
    hk.expand(SUBKEY_INFO, &mut key)
        .expect("32 bytes is a valid length for HKDF");
    ChaCha20Poly1305::new((&key).into())
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce)
}

impl<S> EncryptedStream<S> {
    pub fn new(inner: S, psk: &[u8]) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        EncryptedStream {
            inner,
            psk: psk.to_vec(),
            seal: subkey(psk, &salt),
            seal_nonce: 0,
            wbuf: salt.to_vec(),
            wpos: 0,
            open: None,
            open_nonce: 0,
            rphase: ReadPhase::Salt,
            rbuf: vec![0u8; SALT_LEN],
            rfill: 0,
            plain: Vec::new(),
            ppos: 0,
        }
    }

    fn set_read_phase(&mut self, phase: ReadPhase) {
        let need = match phase {
            ReadPhase::Salt => SALT_LEN,
            ReadPhase::Len => 2,
            ReadPhase::Record(n) => n,
        };
        self.rphase = phase;
        self.rbuf.clear();
        self.rbuf.resize(need, 0);
        self.rfill = 0;
    }
}

impl<S: AsyncWrite + Unpin> EncryptedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wpos < self.wbuf.len() {
            let me = &mut *self;
            match Pin::new(&mut me.inner).poll_write(cx, &me.wbuf[me.wpos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => me.wpos += n,
            }
        }
        self.wbuf.clear();
        self.wpos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EncryptedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // the previous record (or the salt header) goes out first
        match self.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PAYLOAD);
        let me = &mut *self;
        let ciphertext = match me.seal.encrypt(&nonce_for(me.seal_nonce), &buf[..n]) {
            Ok(ct) => ct,
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "failed to seal record",
                )))
            }
        };
        me.seal_nonce += 1;
        me.wbuf
            .extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        me.wbuf.extend_from_slice(&ciphertext);
        // the record is buffered; the next write/flush pushes it out
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for EncryptedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let me = &mut *self;
            if me.ppos < me.plain.len() {
                let n = out.remaining().min(me.plain.len() - me.ppos);
                out.put_slice(&me.plain[me.ppos..me.ppos + n]);
                me.ppos += n;
                return Poll::Ready(Ok(()));
            }

            // pull exactly the wire bytes the current phase needs
            while me.rfill < me.rbuf.len() {
                let mut rb = ReadBuf::new(&mut me.rbuf[me.rfill..]);
                match Pin::new(&mut me.inner).poll_read(cx, &mut rb) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let got = rb.filled().len();
                        if got == 0 {
                            // EOF is clean only on a record boundary
                            let at_boundary = me.rfill == 0
                                && matches!(me.rphase, ReadPhase::Salt | ReadPhase::Len);
                            return if at_boundary {
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                            };
                        }
                        me.rfill += got;
                    }
                }
            }

            match me.rphase {
                ReadPhase::Salt => {
                    me.open = Some(subkey(&me.psk, &me.rbuf));
                    me.set_read_phase(ReadPhase::Len);
                }
                ReadPhase::Len => {
                    let n = u16::from_be_bytes([me.rbuf[0], me.rbuf[1]]) as usize;
                    if n < TAG_LEN || n > MAX_PAYLOAD + TAG_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "record length out of range",
                        )));
                    }
                    me.set_read_phase(ReadPhase::Record(n));
                }
                ReadPhase::Record(_) => {
                    let cipher = me.open.as_ref().expect("salt is read before any record");
                    match cipher.decrypt(&nonce_for(me.open_nonce), me.rbuf.as_slice()) {
                        Ok(payload) => {
                            me.open_nonce += 1;
                            me.plain = payload;
                            me.ppos = 0;
                        }
                        Err(_) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream authentication failed",
                            )))
                        }
                    }
                    me.set_read_phase(ReadPhase::Len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PSK: &[u8] = &[7u8; 32];

    #[tokio::test]
    async fn test_roundtrip() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut writer = EncryptedStream::new(a, PSK);
        let mut reader = EncryptedStream::new(b, PSK);

        // spans several records, incl. one larger than MAX_PAYLOAD
        let mut payload = vec![0u8; MAX_PAYLOAD * 2 + 123];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let expect = payload.clone();
        let send = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        send.await.unwrap();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = EncryptedStream::new(a, PSK);
        let mut reader = EncryptedStream::new(b, PSK);
        // flush pushes the salt header out even with no payload
        writer.flush().await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = EncryptedStream::new(a, PSK);
        let mut reader = EncryptedStream::new(b, &[8u8; 32]);

        let send = tokio::spawn(async move {
            writer.write_all(b"secret payload").await.unwrap();
            writer.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        let err = reader.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_record_fails() {
        // capture the raw wire bytes first
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut writer = EncryptedStream::new(a, PSK);
        writer.write_all(b"bytes worth protecting").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();

        // flip one bit inside the sealed record (past salt and length)
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let (mut c, d) = tokio::io::duplex(64 * 1024);
        let mut reader = EncryptedStream::new(d, PSK);
        c.write_all(&wire).await.unwrap();
        c.shutdown().await.unwrap();
        drop(c);

        let mut got = Vec::new();
        let err = reader.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "stream authentication failed");
    }

    #[tokio::test]
    async fn test_truncated_stream_fails() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut writer = EncryptedStream::new(a, PSK);
        writer.write_all(b"cut off mid-record").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        wire.truncate(wire.len() - 3);

        let (mut c, d) = tokio::io::duplex(64 * 1024);
        let mut reader = EncryptedStream::new(d, PSK);
        c.write_all(&wire).await.unwrap();
        c.shutdown().await.unwrap();
        drop(c);

        let mut got = Vec::new();
        let err = reader.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
