//! The buffered command queue the tap driver talks through.
//!
//! The transport batches opcode bytes and delivers them to the device on
//! [`flush`](CommandBuffer::flush), or before any [`read`](CommandBuffer::read)
//! so request and reply stay ordered. The tap driver never looks inside
//! the device; everything it does is appending opcode bytes here and
//! taking reply bytes back out.

use std::io;

use crate::mpsse;

pub trait CommandBuffer {
    /// Enqueues raw opcode bytes for the device.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Blocks until `out.len()` reply bytes are available. Queued writes
    /// are delivered first.
    fn read(&mut self, out: &mut [u8]) -> io::Result<()>;

    /// Delivers queued writes without waiting for a reply.
    fn flush(&mut self) -> io::Result<()>;

    /// Combined data shift on the dedicated serial pins: clocks `ticks`
    /// bits, sending from `dout` and/or capturing into `din` (LSB first
    /// within each byte). Used for native-mode transfers of whole words.
    ///
    /// Full bytes go out as one byte-mode command, the remainder as one
    /// bit-mode command. The device returns partial bytes left-aligned;
    /// they are shifted down here so `din` is contiguous LSB-first.
    fn shift(&mut self, dout: Option<&[u8]>, din: Option<&mut [u8]>, ticks: usize) -> io::Result<()> {
        debug_assert!(dout.is_some() || din.is_some());
        if ticks == 0 {
            return Ok(());
        }

        let mut opcode = mpsse::LSB;
        if dout.is_some() {
            opcode |= mpsse::DO_WRITE | mpsse::WRITE_NEG;
        }
        if din.is_some() {
            opcode |= mpsse::DO_READ;
        }

        let full_bytes = ticks / 8;
        let rem_bits = ticks % 8;
        debug_assert!(dout.map_or(true, |d| d.len() * 8 >= ticks));

        let mut cmd = Vec::with_capacity(6 + full_bytes);
        if full_bytes > 0 {
            let len = (full_bytes - 1) as u16;
            cmd.push(opcode);
            cmd.push(len as u8);
            cmd.push((len >> 8) as u8);
            if let Some(dout) = dout {
                cmd.extend_from_slice(&dout[..full_bytes]);
            }
        }
        if rem_bits > 0 {
            cmd.push(opcode | mpsse::BITMODE);
            cmd.push((rem_bits - 1) as u8);
            if let Some(dout) = dout {
                cmd.push(dout[full_bytes]);
            }
        }
        self.write(&cmd)?;

        if let Some(din) = din {
            let reply_len = full_bytes + (rem_bits > 0) as usize;
            debug_assert!(din.len() >= reply_len);
            self.read(&mut din[..reply_len])?;
            if rem_bits > 0 {
                din[full_bytes] >>= 8 - rem_bits;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LineSim;

    #[test]
    fn shift_splits_into_byte_and_bit_commands() {
        let mut sim = LineSim::native();
        sim.dbus_ddr = mpsse::PIN_DO; // host drives
        sim.shift(Some(&[0xa5, 0x01]), None, 11).unwrap();

        let bits: Vec<bool> = sim.line.iter().copied().collect();
        let mut expected = vec![true, false, true, false, false, true, false, true];
        expected.extend([true, false, false]);
        assert_eq!(bits, expected);

        // release the line and clock the same bits back in; the partial
        // reply byte comes back contiguous LSB-first
        sim.dbus_ddr = 0;
        let mut din = [0u8; 2];
        sim.shift(None, Some(&mut din), 11).unwrap();
        assert_eq!(din, [0xa5, 0x01]);
    }

    #[test]
    fn zero_tick_shift_is_a_no_op() {
        let mut sim = LineSim::native();
        sim.shift(Some(&[0xff]), None, 0).unwrap();
        assert_eq!(sim.bytes_written, 0);
    }
}
