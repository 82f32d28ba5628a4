//! Primitive encoders of binary data,
//! in either little endian or big endian.

use byteordered::{ByteOrdered, Endianness};
use std::io::Write;

type Result<T> = std::io::Result<T>;

/// Interface for encoding primitive binary values to a data sink.
pub trait BasicEncode {
    /// Retrieve the sink's endianness.
    fn endianness(&self) -> Endianness;

    /// Encode an unsigned short value to the given sink.
    fn encode_us<S>(&self, to: S, value: u16) -> Result<()>
    where
        S: Write;

    /// Encode an unsigned long value to the given sink.
    fn encode_ul<S>(&self, to: S, value: u32) -> Result<()>
    where
        S: Write;

    /// Encode an unsigned very long value to the given sink.
    fn encode_uv<S>(&self, to: S, value: u64) -> Result<()>
    where
        S: Write;

    /// Encode a signed short value to the given sink.
    fn encode_ss<S>(&self, to: S, value: i16) -> Result<()>
    where
        S: Write;

    /// Encode a signed long value to the given sink.
    fn encode_sl<S>(&self, to: S, value: i32) -> Result<()>
    where
        S: Write;

    /// Encode a signed very long value to the given sink.
    fn encode_sv<S>(&self, to: S, value: i64) -> Result<()>
    where
        S: Write;

    /// Encode a single precision float value to the given sink.
    fn encode_fl<S>(&self, to: S, value: f32) -> Result<()>
    where
        S: Write;

    /// Encode a double precision float value to the given sink.
    fn encode_fd<S>(&self, to: S, value: f64) -> Result<()>
    where
        S: Write;

    /// Encode a tag to the given sink: group then element,
    /// both in the sink's byte order.
    fn encode_tag<S>(&self, mut to: S, group: u16, element: u16) -> Result<()>
    where
        S: Write,
    {
        self.encode_us(&mut to, group)?;
        self.encode_us(&mut to, element)
    }
}

/// A basic encoder of primitive elements in little endian.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LittleEndianBasicEncoder;

impl BasicEncode for LittleEndianBasicEncoder {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn encode_us<S>(&self, to: S, value: u16) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_u16(value)
    }

    fn encode_ul<S>(&self, to: S, value: u32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_u32(value)
    }

    fn encode_uv<S>(&self, to: S, value: u64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_u64(value)
    }

    fn encode_ss<S>(&self, to: S, value: i16) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_i16(value)
    }

    fn encode_sl<S>(&self, to: S, value: i32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_i32(value)
    }

    fn encode_sv<S>(&self, to: S, value: i64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_i64(value)
    }

    fn encode_fl<S>(&self, to: S, value: f32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_f32(value)
    }

    fn encode_fd<S>(&self, to: S, value: f64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::le(to).write_f64(value)
    }
}

/// A basic encoder of primitive elements in big endian.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BigEndianBasicEncoder;

impl BasicEncode for BigEndianBasicEncoder {
    fn endianness(&self) -> Endianness {
        Endianness::Big
    }

    fn encode_us<S>(&self, to: S, value: u16) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_u16(value)
    }

    fn encode_ul<S>(&self, to: S, value: u32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_u32(value)
    }

    fn encode_uv<S>(&self, to: S, value: u64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_u64(value)
    }

    fn encode_ss<S>(&self, to: S, value: i16) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_i16(value)
    }

    fn encode_sl<S>(&self, to: S, value: i32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_i32(value)
    }

    fn encode_sv<S>(&self, to: S, value: i64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_i64(value)
    }

    fn encode_fl<S>(&self, to: S, value: f32) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_f32(value)
    }

    fn encode_fd<S>(&self, to: S, value: f64) -> Result<()>
    where
        S: Write,
    {
        ByteOrdered::be(to).write_f64(value)
    }
}

/// A basic encoder with support for both little endian and big endian
/// encoding, decided at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum BasicEncoder {
    /// Encode in little endian
    LE(LittleEndianBasicEncoder),
    /// Encode in big endian
    BE(BigEndianBasicEncoder),
}

impl BasicEncoder {
    /// Create a basic encoder for the given byte order.
    pub fn new(endianness: Endianness) -> Self {
        match endianness {
            Endianness::Little => BasicEncoder::LE(LittleEndianBasicEncoder),
            Endianness::Big => BasicEncoder::BE(BigEndianBasicEncoder),
        }
    }
}

impl From<Endianness> for BasicEncoder {
    fn from(endianness: Endianness) -> Self {
        BasicEncoder::new(endianness)
    }
}

macro_rules! for_both {
    ($s: expr, |$e: ident| $f: expr) => {
        match $s {
            BasicEncoder::LE($e) => $f,
            BasicEncoder::BE($e) => $f,
        }
    };
}

impl BasicEncode for BasicEncoder {
    fn endianness(&self) -> Endianness {
        match self {
            BasicEncoder::LE(_) => Endianness::Little,
            BasicEncoder::BE(_) => Endianness::Big,
        }
    }

    fn encode_us<S>(&self, to: S, value: u16) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_us(to, value))
    }

    fn encode_ul<S>(&self, to: S, value: u32) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_ul(to, value))
    }

    fn encode_uv<S>(&self, to: S, value: u64) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_uv(to, value))
    }

    fn encode_ss<S>(&self, to: S, value: i16) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_ss(to, value))
    }

    fn encode_sl<S>(&self, to: S, value: i32) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_sl(to, value))
    }

    fn encode_sv<S>(&self, to: S, value: i64) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_sv(to, value))
    }

    fn encode_fl<S>(&self, to: S, value: f32) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_fl(to, value))
    }

    fn encode_fd<S>(&self, to: S, value: f64) -> Result<()>
    where
        S: Write,
    {
        for_both!(self, |e| e.encode_fd(to, value))
    }
}
