use std::io::{Read as _, Write as _};

use flate2::{
    Compression,
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 11;
const BROTLI_WINDOW: u32 = 22;

/// `Content-Encoding` tokens understood by the inventory. Anything else is
/// stored and replayed byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl ContentEncoding {
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" | "compress" => Self::Gzip,
            "deflate" => Self::Deflate,
            "br" => Self::Brotli,
            _ => Self::Identity,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{operation} `{token}` content: {source}")]
pub struct EncodingError {
    operation: &'static str,
    token: String,
    #[source]
    source: std::io::Error,
}

pub fn compress(token: &str, bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let wrap = |source| EncodingError {
        operation: "compress",
        token: token.to_owned(),
        source,
    };
    match ContentEncoding::from_token(token) {
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bytes).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        ContentEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bytes).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        ContentEncoding::Brotli => {
            let mut writer = brotli::CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_WINDOW,
            );
            writer.write_all(bytes).map_err(wrap)?;
            Ok(writer.into_inner())
        }
        ContentEncoding::Identity => Ok(bytes.to_vec()),
    }
}

pub fn decompress(token: &str, bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let wrap = |source| EncodingError {
        operation: "decompress",
        token: token.to_owned(),
        source,
    };
    let mut out = Vec::new();
    match ContentEncoding::from_token(token) {
        ContentEncoding::Gzip => {
            GzDecoder::new(bytes).read_to_end(&mut out).map_err(wrap)?;
        }
        ContentEncoding::Deflate => {
            ZlibDecoder::new(bytes).read_to_end(&mut out).map_err(wrap)?;
        }
        ContentEncoding::Brotli => {
            brotli::Decompressor::new(bytes, BROTLI_BUFFER_SIZE)
                .read_to_end(&mut out)
                .map_err(wrap)?;
        }
        ContentEncoding::Identity => out.extend_from_slice(bytes),
    }
    Ok(out)
}
