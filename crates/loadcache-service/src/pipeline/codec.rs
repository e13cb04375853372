use std::io;

use bytes::Bytes;

use super::{DataSource, EncodeStrategy};
use crate::caching::{FetchError, Writer};
use crate::engine::Options;

/// The result of decoding fetched data.
pub type Decoded<R> = Result<R, FetchError>;

/// Turns fetched bytes into resources.
pub trait ResourceDecoder<R>: Send + Sync {
    /// Whether data of the given class can be decoded.
    fn handles(&self, data_class: &str) -> bool;

    /// Decodes `data`.
    ///
    /// Data read from the resource disk cache was produced by [`encode`](Self::encode).
    fn decode(&self, data: Bytes, data_source: DataSource, options: &Options) -> Decoded<R>;

    /// Serializes a decoded resource for the disk cache.
    fn encode(&self, _resource: &R) -> Option<Bytes> {
        None
    }

    fn encode_strategy(&self) -> EncodeStrategy {
        EncodeStrategy::None
    }
}

/// Writes fetched data to a disk cache entry.
pub trait Encoder: Send + Sync {
    fn encode(&self, data: &Bytes, file: &mut dyn io::Write, options: &Options) -> io::Result<()>;
}

/// Writes data unmodified.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesEncoder;

impl Encoder for BytesEncoder {
    fn encode(&self, data: &Bytes, file: &mut dyn io::Write, _options: &Options) -> io::Result<()> {
        file.write_all(data)
    }
}

/// A disk cache [`Writer`] pairing data with the [`Encoder`] that writes it.
pub struct DataCacheWriter<'a> {
    encoder: &'a dyn Encoder,
    data: &'a Bytes,
    options: &'a Options,
}

impl<'a> DataCacheWriter<'a> {
    pub fn new(encoder: &'a dyn Encoder, data: &'a Bytes, options: &'a Options) -> Self {
        Self {
            encoder,
            data,
            options,
        }
    }
}

impl Writer for DataCacheWriter<'_> {
    fn write(&mut self, file: &mut dyn io::Write) -> io::Result<()> {
        self.encoder.encode(self.data, file, self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl Encoder for Uppercase {
        fn encode(
            &self,
            data: &Bytes,
            file: &mut dyn io::Write,
            options: &Options,
        ) -> io::Result<()> {
            if options.contains_key("fail") {
                return Err(io::ErrorKind::InvalidData.into());
            }
            file.write_all(&data.to_ascii_uppercase())
        }
    }

    #[test]
    fn test_writer_uses_encoder() {
        let data = Bytes::from_static(b"meow");
        let mut options = Options::new();

        let mut out = Vec::new();
        DataCacheWriter::new(&Uppercase, &data, &options)
            .write(&mut out)
            .unwrap();
        assert_eq!(out, b"MEOW");

        let mut out = Vec::new();
        DataCacheWriter::new(&BytesEncoder, &data, &options)
            .write(&mut out)
            .unwrap();
        assert_eq!(out, b"meow");

        options.insert("fail".into(), "1".into());
        let result = DataCacheWriter::new(&Uppercase, &data, &options).write(&mut Vec::new());
        assert!(result.is_err());
    }
}
