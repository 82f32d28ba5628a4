//! P-Data value writer abstraction.
//!
//! Writing a large data set through a [`PDataWriter`] splits it
//! into P-DATA PDUs bounded by the peer's maximum PDU length,
//! without materializing the whole message in memory.

use std::io::Write;

use crate::pdu::PDU_HEADER_SIZE;

/// Set up the P-Data PDU header for sending.
fn setup_pdata_header(buffer: &mut Vec<u8>, is_last: bool) {
    let data_len = (buffer.len() - 12) as u32;

    // full PDU length (minus PDU type and reserved byte)
    let pdu_len = data_len + 4 + 2;
    let pdu_len_bytes = pdu_len.to_be_bytes();

    buffer[2] = pdu_len_bytes[0];
    buffer[3] = pdu_len_bytes[1];
    buffer[4] = pdu_len_bytes[2];
    buffer[5] = pdu_len_bytes[3];

    // presentation data length (data + context id + control header)
    let pdv_data_len = data_len + 2;
    let data_len_bytes = pdv_data_len.to_be_bytes();

    buffer[6] = data_len_bytes[0];
    buffer[7] = data_len_bytes[1];
    buffer[8] = data_len_bytes[2];
    buffer[9] = data_len_bytes[3];

    // message control header
    buffer[11] = if is_last { 0x02 } else { 0x00 };
}

/// A P-Data value writer.
///
/// Using this as a [standard writer](std::io::Write) will
/// automatically split the incoming bytes into separate PDUs
/// if they do not fit in a single one.
/// [`finish`](PDataWriter::finish) (or dropping the writer)
/// sends the pending fragment with the last-fragment flag set.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length
    /// property admitted by the peer.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let max_data_len = calculate_max_data_len_single(max_pdu_length);
        let mut buffer = Vec::with_capacity((max_data_len + PDU_HEADER_SIZE) as usize);
        // initial buffer set up: full PDU length and presentation data
        // length are patched in just before each dispatch
        buffer.extend([
            // PDU type + reserved byte
            0x04,
            0x00,
            // full PDU length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation data length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation context id
            presentation_context_id,
            // message control header, unknown at this point
            0xFF,
        ]);

        PDataWriter {
            stream,
            max_data_len,
            buffer,
        }
    }

    /// Declare the end of the data set,
    /// sending the pending PDU with the last-fragment flag.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()?;
        self.stream.flush()?;
        Ok(())
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            setup_pdata_header(&mut self.buffer, true);
            self.stream.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Send the accumulated PDU as a non-final fragment
    /// and reset the buffer for the next one.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= 12);
        setup_pdata_header(&mut self.buffer, false);
        self.stream.write_all(&self.buffer)?;

        // reset PDU buffer, keeping the header stub
        self.buffer.truncate(12);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            // accumulate into the buffer
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill up the buffer and dispatch the PDU
            let k = total_len - self.buffer.len();
            self.buffer.extend(&buf[..k]);
            self.dispatch_pdu()?;
            Ok(k)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // no-op: fragments are only dispatched when full or finished
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// the pending PDU is sent as the last fragment.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// Determine the maximum PDV data payload
/// when a single PDV is sent per PDU.
fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    // PDV item length (4 bytes), context id (1 byte),
    // message control header (1 byte)
    pdu_len - 4 - 1 - 1
}

#[cfg(test)]
mod tests {
    use super::PDataWriter;
    use crate::pdu::reader::read_pdu;
    use crate::pdu::{Pdu, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
    use std::io::{Cursor, Write};

    #[test]
    fn write_pdata_and_finish() {
        let my_data = vec![0x55u8; 192];

        let mut pdu_stream = Vec::new();
        {
            let writer = PDataWriter::new(&mut pdu_stream, 1, MINIMUM_PDU_SIZE);
            let mut writer = writer;
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = Cursor::new(&pdu_stream);
        match read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, false).unwrap() {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].presentation_context_id, 1);
                assert!(data[0].is_last);
                assert_eq!(data[0].data, my_data);
            }
            pdu => panic!("unexpected PDU: {:?}", pdu),
        }
        assert_eq!(cursor.position(), pdu_stream.len() as u64);
    }

    #[test]
    fn write_large_pdata_and_finish() {
        // does not fit in one PDU of the minimum size
        let my_data = vec![0x88u8; MINIMUM_PDU_SIZE as usize + 128];

        let mut pdu_stream = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut pdu_stream, 5, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = Cursor::new(&pdu_stream);
        let mut collected = Vec::new();
        let mut pdu_count = 0;
        loop {
            match read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, false) {
                Ok(Pdu::PData { data }) => {
                    pdu_count += 1;
                    assert_eq!(data.len(), 1);
                    assert_eq!(data[0].presentation_context_id, 5);
                    let expect_last = cursor.position() == pdu_stream.len() as u64;
                    assert_eq!(data[0].is_last, expect_last);
                    collected.extend_from_slice(&data[0].data);
                }
                Ok(pdu) => panic!("unexpected PDU: {:?}", pdu),
                Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(pdu_count, 2);
        assert_eq!(collected, my_data);
    }
}
