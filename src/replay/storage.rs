//! Replay Storage
//!
//! Lines go to disk either plain or gzip-compressed (chosen by a `.gz`
//! suffix). When a key is configured the writer folds every line into an
//! HMAC and appends `{"signature": ...}` as the final line on finish.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::core::hash::Signer;
use crate::replay::format::SignatureLine;
use crate::replay::ReplayError;

/// Whether `path` selects gzip storage.
pub fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn as_write(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w as &mut dyn Write,
            Sink::Gzip(w) => w as &mut dyn Write,
        }
    }

    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_all()
    }
}

/// Append-only line writer.
pub struct LineWriter {
    sink: Sink,
    signer: Option<Signer>,
}

impl LineWriter {
    /// Create (truncating) `path`.
    pub fn create(path: &Path, key: Option<&[u8]>) -> Result<Self, ReplayError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = BufWriter::new(File::create(path)?);
        let sink = if is_compressed(path) {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };
        Ok(Self {
            sink,
            signer: key.map(Signer::new),
        })
    }

    /// Write one line; `line` must not contain a newline.
    pub fn write_line(&mut self, line: &str) -> Result<(), ReplayError> {
        let out = self.sink.as_write();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        if let Some(signer) = self.signer.as_mut() {
            signer.update(line.as_bytes());
            signer.update(b"\n");
        }
        Ok(())
    }

    /// Append the signature trailer (if signing) and flush to disk.
    pub fn finish(mut self) -> Result<(), ReplayError> {
        if let Some(signer) = self.signer.take() {
            let trailer = serde_json::to_string(&SignatureLine {
                signature: signer.finalize_hex(),
            })?;
            let out = self.sink.as_write();
            out.write_all(trailer.as_bytes())?;
            out.write_all(b"\n")?;
        }
        self.sink.finish()?;
        Ok(())
    }
}

/// Read every non-empty line of a plain or gzip replay.
pub fn read_lines(path: &Path) -> Result<Vec<String>, ReplayError> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_compressed(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut lines = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Strip and check the signature trailer.
///
/// Without a key, or without a trailer, the lines pass through
/// unauthenticated. With both, any mismatch rejects the whole file.
pub fn verify_lines(mut lines: Vec<String>, key: Option<&[u8]>) -> Result<Vec<String>, ReplayError> {
    let trailer = lines
        .last()
        .and_then(|last| serde_json::from_str::<SignatureLine>(last).ok());
    let Some(trailer) = trailer else {
        return Ok(lines);
    };
    lines.pop();

    if let Some(key) = key {
        let mut signer = Signer::new(key);
        for line in &lines {
            signer.update(line.as_bytes());
            signer.update(b"\n");
        }
        if !signer.verify_hex(&trailer.signature) {
            warn!("replay signature mismatch");
            return Err(ReplayError::Verification);
        }
    }
    Ok(lines)
}
