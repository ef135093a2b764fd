//! Chunked byte transfer between partitions and files.

pub mod progress;

pub use progress::{format_bytes, format_duration, format_speed, TransferMeter};

use std::io::{self, Read, Write};

/// Default transfer chunk size (1 MiB).
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Copy `reader` into `writer` in fixed-size chunks until the reader is
/// exhausted. Returns the number of bytes copied.
pub fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, chunk_size: usize) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }

    Ok(total)
}
