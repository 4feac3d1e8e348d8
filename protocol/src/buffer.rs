//! Binary cursor over a received payload
//!
//! Every protocol definition and the reassembly helpers read through [`Buffer`].
//! Reads never return partial data: asking for more bytes than remain fails with
//! [`QueryError::BufferUnderrun`] and leaves the cursor untouched.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{QueryError, Result};

/// Byte order used for multi-byte numeric reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Width of the length prefix in front of a pascal string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    U8,
    U16,
    U32,
}

impl LengthPrefix {
    /// Number of bytes the prefix occupies
    pub fn width(self) -> usize {
        match self {
            LengthPrefix::U8 => 1,
            LengthPrefix::U16 => 2,
            LengthPrefix::U32 => 4,
        }
    }

    /// Encodes `data` with this prefix, the inverse of [`Buffer::read_pascal_string`]
    pub fn encode(
        self,
        data: &[u8],
        includes_prefix: bool,
        endian: Endian,
    ) -> Result<Vec<u8>> {
        let length = data.len() + if includes_prefix { self.width() } else { 0 };
        let mut out = vec![0u8; self.width()];

        let too_long = || QueryError::malformed(format!("{} bytes do not fit a {:?} prefix", length, self));
        match (self, endian) {
            (LengthPrefix::U8, _) => out[0] = u8::try_from(length).map_err(|_| too_long())?,
            (LengthPrefix::U16, Endian::Little) => {
                LittleEndian::write_u16(&mut out, u16::try_from(length).map_err(|_| too_long())?)
            }
            (LengthPrefix::U16, Endian::Big) => {
                BigEndian::write_u16(&mut out, u16::try_from(length).map_err(|_| too_long())?)
            }
            (LengthPrefix::U32, Endian::Little) => {
                LittleEndian::write_u32(&mut out, u32::try_from(length).map_err(|_| too_long())?)
            }
            (LengthPrefix::U32, Endian::Big) => {
                BigEndian::write_u32(&mut out, u32::try_from(length).map_err(|_| too_long())?)
            }
        }

        out.extend_from_slice(data);
        Ok(out)
    }
}

/// Owned byte sequence plus a read cursor
///
/// The cursor always stays within `[0, len]`. Definitions that mix byte orders
/// build one buffer per order rather than flipping it mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    endian: Endian,
}

impl Buffer {
    /// Creates a little-endian buffer
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_endian(data, Endian::Little)
    }

    pub fn with_endian(data: impl Into<Vec<u8>>, endian: Endian) -> Self {
        Self {
            data: data.into(),
            position: 0,
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the cursor and the end
    pub fn remaining_length(&self) -> usize {
        self.data.len() - self.position
    }

    /// Unread bytes, without advancing
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// Consumes the buffer, returning the unread bytes
    pub fn into_remaining(mut self) -> Vec<u8> {
        self.data.split_off(self.position)
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let remaining = self.remaining_length();
        if n > remaining {
            return Err(QueryError::BufferUnderrun {
                requested: n,
                remaining,
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..start + n])
    }

    /// Reads exactly `n` raw bytes
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        self.take(n).map(<[u8]>::to_vec)
    }

    /// Peeks at the next `n` bytes without moving the cursor
    pub fn look_ahead(&self, n: usize) -> Result<&[u8]> {
        let remaining = self.remaining_length();
        if n > remaining {
            return Err(QueryError::BufferUnderrun {
                requested: n,
                remaining,
            });
        }
        Ok(&self.data[self.position..self.position + n])
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Removes and returns the final byte, shrinking the readable window by one
    ///
    /// Used to validate packet footers before parsing the body.
    pub fn read_last(&mut self) -> Result<u8> {
        match self.data.last() {
            Some(&last) if self.remaining_length() > 0 => {
                self.data.pop();
                Ok(last)
            }
            _ => Err(QueryError::BufferUnderrun {
                requested: 1,
                remaining: 0,
            }),
        }
    }

    /// Reads up to and including `delimiter`, returning the bytes before it
    ///
    /// Fails without consuming anything when the delimiter never shows up.
    pub fn read_bytes_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        let rest = self.remaining();
        let Some(offset) = rest.iter().position(|b| *b == delimiter) else {
            return Err(QueryError::BufferUnderrun {
                requested: rest.len() + 1,
                remaining: rest.len(),
            });
        };
        let value = rest[..offset].to_vec();
        self.position += offset + 1;
        Ok(value)
    }

    /// NUL-terminated string, decoded lossily
    pub fn read_string(&mut self) -> Result<String> {
        self.read_string_until(0)
    }

    pub fn read_string_until(&mut self, delimiter: u8) -> Result<String> {
        let bytes = self.read_bytes_until(delimiter)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads a length-prefixed string
    ///
    /// When `includes_prefix` is set the declared length counts the prefix
    /// bytes themselves. The cursor is restored if the body is truncated.
    pub fn read_pascal_string(
        &mut self,
        prefix: LengthPrefix,
        includes_prefix: bool,
    ) -> Result<Vec<u8>> {
        let start = self.position;
        let declared = match prefix {
            LengthPrefix::U8 => self.read_u8()? as usize,
            LengthPrefix::U16 => self.read_u16()? as usize,
            LengthPrefix::U32 => self.read_u32()? as usize,
        };
        let length = if includes_prefix {
            match declared.checked_sub(prefix.width()) {
                Some(length) => length,
                None => {
                    self.position = start;
                    return Err(QueryError::malformed(format!(
                        "pascal length {} is shorter than its own prefix",
                        declared
                    )));
                }
            }
        } else {
            declared
        };

        match self.read(length) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.position = start;
                Err(err)
            }
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let endian = self.endian;
        let bytes = self.take(2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(bytes),
            Endian::Big => BigEndian::read_u16(bytes),
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let endian = self.endian;
        let bytes = self.take(2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_i16(bytes),
            Endian::Big => BigEndian::read_i16(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let endian = self.endian;
        let bytes = self.take(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let endian = self.endian;
        let bytes = self.take(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_i32(bytes),
            Endian::Big => BigEndian::read_i32(bytes),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let endian = self.endian;
        let bytes = self.take(8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u64(bytes),
            Endian::Big => BigEndian::read_u64(bytes),
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let endian = self.endian;
        let bytes = self.take(8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_i64(bytes),
            Endian::Big => BigEndian::read_i64(bytes),
        })
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let endian = self.endian;
        let bytes = self.take(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_f32(bytes),
            Endian::Big => BigEndian::read_f32(bytes),
        })
    }
}
