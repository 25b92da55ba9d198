use std::any::Any;

use crate::error::{Error, Result};

use super::message::MessagePtr;

/// Streams the serialized form of one message into writer-sized
/// chunks.
pub trait Serializer: Send {
    /// Produces up to `out.len()` bytes; returns how many were
    /// written. Zero with [`is_finished`] false means "try again with
    /// more room".
    ///
    /// [`is_finished`]: Serializer::is_finished
    fn write_some(&mut self, out: &mut [u8]) -> Result<usize>;

    fn is_finished(&self) -> bool;
}

/// Collects the serialized form of one message from reader-sized
/// chunks.
pub trait Deserializer: Send {
    fn read_some(&mut self, input: &[u8]) -> Result<usize>;

    /// Builds the message once the final chunk was fed; also yields
    /// the protocol type id for dispatch.
    fn finish(self: Box<Self>) -> Result<(MessagePtr, u64)>;
}

/// The user-visible serialization seam: turns message objects into
/// byte streams and back. Injected once per service through the
/// configuration.
pub trait Protocol: Send + Sync + 'static {
    fn serializer(&self, message: &(dyn Any + Send)) -> Result<Box<dyn Serializer>>;

    fn deserializer(&self) -> Box<dyn Deserializer>;
}

/// Minimal protocol shipping raw byte vectors (`Vec<u8>` messages,
/// type id 1). Enough for transport-level exercises; applications
/// plug their own codecs through [`Protocol`].
pub struct BytesProtocol;

pub const BYTES_TYPE_ID: u64 = 1;

struct BytesSerializer {
    data: Vec<u8>,
    offset: usize,
}

impl Serializer for BytesSerializer {
    fn write_some(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = (self.data.len() - self.offset).min(out.len());
        out[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn is_finished(&self) -> bool {
        self.offset == self.data.len()
    }
}

struct BytesDeserializer {
    data: Vec<u8>,
}

impl Deserializer for BytesDeserializer {
    fn read_some(&mut self, input: &[u8]) -> Result<usize> {
        self.data.extend_from_slice(input);
        Ok(input.len())
    }

    fn finish(self: Box<Self>) -> Result<(MessagePtr, u64)> {
        Ok((Box::new(self.data), BYTES_TYPE_ID))
    }
}

impl Protocol for BytesProtocol {
    fn serializer(&self, message: &(dyn Any + Send)) -> Result<Box<dyn Serializer>> {
        let data = message
            .downcast_ref::<Vec<u8>>()
            .ok_or(Error::InvalidConfiguration("message type unknown to protocol"))?;
        Ok(Box::new(BytesSerializer {
            data: data.clone(),
            offset: 0,
        }))
    }

    fn deserializer(&self) -> Box<dyn Deserializer> {
        Box::new(BytesDeserializer { data: Vec::new() })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_roundtrip_in_chunks() {
        let proto = BytesProtocol;
        let message: Vec<u8> = (0u8..200).collect();
        let mut ser = proto.serializer(&message as &(dyn Any + Send)).unwrap();

        let mut de = proto.deserializer();
        let mut chunk = [0u8; 64];
        while !ser.is_finished() {
            let n = ser.write_some(&mut chunk).unwrap();
            de.read_some(&chunk[..n]).unwrap();
        }

        let (ptr, type_id) = de.finish().unwrap();
        assert_eq!(type_id, BYTES_TYPE_ID);
        assert_eq!(ptr.downcast_ref::<Vec<u8>>().unwrap(), &message);
    }
}
