//! Demultiplexing of the compiler's stdout pipe.
//!
//! The compiler interleaves two streams on stdout, each record prefixed
//! by a little-endian signed 32-bit length. A positive length announces
//! analyzer output; a negative length announces a request for the file
//! server. Order is preserved within each stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, FramedRead};

use futures::StreamExt;

/// One record from the compiler's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Analyzer(Bytes),
    FsRequest(Bytes),
}

/// Decoder for the signed length-prefix framing.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = size.unsigned_abs() as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let data = src.split_to(len).freeze();
        Ok(Some(if size < 0 {
            Frame::FsRequest(data)
        } else {
            Frame::Analyzer(data)
        }))
    }
}

/// Byte streams produced by [`demultiplex`]. Both ends see EOF once the
/// compiler closes its stdout.
pub struct MultiplexPipes {
    pub analyzer: DuplexStream,
    pub fs_requests: DuplexStream,
}

const PIPE_CAPACITY: usize = 64 * 1024;

/// Splits `stdout` into the analyzer stream and the FS-request stream.
/// The forwarding task stops on EOF or on the first malformed frame.
pub fn demultiplex<R>(stdout: R) -> MultiplexPipes
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (analyzer_write, analyzer_read) = tokio::io::duplex(PIPE_CAPACITY);
    let (fs_write, fs_read) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(dispatch(stdout, analyzer_write, fs_write));

    MultiplexPipes {
        analyzer: analyzer_read,
        fs_requests: fs_read,
    }
}

async fn dispatch<R>(stdout: R, mut analyzer: DuplexStream, mut fs: DuplexStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(stdout, FrameCodec);
    while let Some(frame) = frames.next().await {
        let res = match frame {
            Ok(Frame::Analyzer(data)) => analyzer.write_all(&data).await,
            Ok(Frame::FsRequest(data)) => fs.write_all(&data).await,
            Err(e) => {
                tracing::debug!("error while reading from the compiler: {e}");
                break;
            }
        };
        if let Err(e) = res {
            // A closed receiver ends the whole dispatch; the compiler is
            // going away anyway.
            tracing::debug!("error while forwarding compiler output: {e}");
            break;
        }
    }
    // Dropping the writers signals EOF to both readers.
}
