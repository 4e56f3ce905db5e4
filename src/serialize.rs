//! Tensor byte-stream format. All header fields and element data are
//! big-endian:
//!
//! ```text
//! bytes 0..4   magic number 0x00075321
//! bytes 4..8   element type tag (0..4)
//! bytes 8..12  rank
//! rank * 8     shape, one u64 per axis
//! rest         element data, row-major
//! ```

use std::io::{Read, Write};

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
use crate::tensor::Data;
use crate::types::{shape_size, FType};

const MAGIC_NUMBER: u32 = 0x0007_5321;

impl Graph {
    /// Serializes the node's materialized value; unexecuted nodes are
    /// executed and synced first.
    pub fn serialize(&mut self, node: NodeId) -> FlintResult<Vec<u8>> {
        let data = self.host_data(node)?;
        let shape = self.shape(node).to_vec();
        let ftype = self.ftype(node);
        let mut out =
            Vec::with_capacity(12 + shape.len() * 8 + data.len() * ftype.byte_size());
        out.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
        out.extend_from_slice(&(ftype as u32).to_be_bytes());
        out.extend_from_slice(&(shape.len() as u32).to_be_bytes());
        for &dim in &shape {
            out.extend_from_slice(&(dim as u64).to_be_bytes());
        }
        match data.as_ref() {
            Data::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            Data::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            Data::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
            Data::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        }
        Ok(out)
    }

    /// Reconstructs a store node from a serialized tensor.
    pub fn deserialize(&mut self, bytes: &[u8]) -> FlintResult<NodeId> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let magic = cursor.u32()?;
        if magic != MAGIC_NUMBER {
            return Err(FlintError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "tensor header carries an unknown magic number",
            )));
        }
        let ftype = FType::from_tag(cursor.u32()?)?;
        let rank = cursor.u32()? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            shape.push(cursor.u64()? as usize);
        }
        let count = shape_size(&shape);
        let data = match ftype {
            FType::I32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(i32::from_be_bytes(cursor.take::<4>()?));
                }
                Data::I32(v)
            }
            FType::I64 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(i64::from_be_bytes(cursor.take::<8>()?));
                }
                Data::I64(v)
            }
            FType::F32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(f32::from_be_bytes(cursor.take::<4>()?));
                }
                Data::F32(v)
            }
            FType::F64 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(f64::from_be_bytes(cursor.take::<8>()?));
                }
                Data::F64(v)
            }
        };
        self.store_data(data, shape)
    }

    pub fn write_tensor<W: Write>(&mut self, node: NodeId, writer: &mut W) -> FlintResult<()> {
        let bytes = self.serialize(node)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    pub fn read_tensor<R: Read>(&mut self, reader: &mut R) -> FlintResult<NodeId> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.deserialize(&bytes)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&mut self) -> FlintResult<[u8; N]> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            FlintError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serialized tensor is truncated",
            ))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u32(&mut self) -> FlintResult<u32> {
        Ok(u32::from_be_bytes(self.take::<4>()?))
    }

    fn u64(&mut self) -> FlintResult<u64> {
        Ok(u64::from_be_bytes(self.take::<8>()?))
    }
}
