//! Test double for the command buffer: interprets the emitted MPSSE
//! opcode stream against a simulated half-duplex line.
//!
//! The target side is modeled as a shift-register echo: every bit the
//! host clocks out while driving is captured, and handed back bit for
//! bit once the host releases the line. The one turnaround cycle after a
//! release carries no data, as on the real wire. Tests can also inspect
//! or edit the captured bits directly.

use std::collections::VecDeque;
use std::io;

use crate::buffer::CommandBuffer;
use crate::mpsse;

#[derive(Debug)]
pub struct LineSim {
    /// dbus direction bit that means "host drives SWDIO".
    drive_mask: u8,
    /// Mask of the sampled pin in pin-bank-read replies.
    sample_pin: u8,

    pub dbus_data: u8,
    pub dbus_ddr: u8,
    pub cbus_data: u8,
    pub cbus_ddr: u8,

    /// Bits captured from the host, echoed back on reads.
    pub line: VecDeque<bool>,
    replies: VecDeque<u8>,
    pending: Vec<u8>,
    /// Turnaround cycles still owed; these clocks consume no echo bit.
    ta_gap: usize,

    pub turnarounds: usize,
    pub bytes_written: usize,
    pub flushes: usize,
    pub data_shifts: usize,
    /// Parsed TMS-shift commands as (length byte, payload).
    pub tms_shifts: Vec<(u8, u8)>,
    pub divisor: Option<u16>,
}

impl LineSim {
    /// Line on the dedicated data pins; host drives while DO is an
    /// output.
    pub fn native() -> Self {
        Self::new(mpsse::PIN_DO, 0)
    }

    /// Line shared with the TMS/CS pad, read back through `sample_pin`.
    pub fn manual(sample_pin: u8) -> Self {
        Self::new(mpsse::PIN_CS, sample_pin)
    }

    fn new(drive_mask: u8, sample_pin: u8) -> Self {
        Self {
            drive_mask,
            sample_pin,
            dbus_data: 0,
            dbus_ddr: 0,
            cbus_data: 0,
            cbus_ddr: 0,
            line: VecDeque::new(),
            replies: VecDeque::new(),
            pending: Vec::new(),
            ta_gap: 0,
            turnarounds: 0,
            bytes_written: 0,
            flushes: 0,
            data_shifts: 0,
            tms_shifts: Vec::new(),
            divisor: None,
        }
    }

    fn driving(&self) -> bool {
        self.dbus_ddr & self.drive_mask != 0
    }

    /// A clock cycle with the host driving `bit`.
    fn clock_out(&mut self, bit: bool) {
        if self.driving() {
            self.line.push_back(bit);
        } else {
            self.consume_cycle();
        }
    }

    /// A clock cycle with the host listening or idling.
    fn consume_cycle(&mut self) {
        if self.ta_gap > 0 {
            self.ta_gap -= 1;
        } else {
            self.line.pop_front();
        }
    }

    fn clock_in(&mut self) -> bool {
        assert!(!self.driving(), "host sampled the line while driving it");
        if self.ta_gap > 0 {
            self.ta_gap -= 1;
            return false;
        }
        self.line.pop_front().unwrap_or(false)
    }

    fn set_bits_low(&mut self, data: u8, ddr: u8) {
        let was_driving = self.driving();
        self.dbus_data = data;
        self.dbus_ddr = ddr;
        if was_driving != self.driving() {
            self.turnarounds += 1;
            self.ta_gap = if self.driving() { 0 } else { 1 };
        }
    }

    fn process(&mut self) {
        let mut i = 0;
        loop {
            let Some(&op) = self.pending.get(i) else { break };
            let rest = self.pending.len() - i;
            match op {
                mpsse::SET_BITS_LOW => {
                    if rest < 3 {
                        break;
                    }
                    let (data, ddr) = (self.pending[i + 1], self.pending[i + 2]);
                    self.set_bits_low(data, ddr);
                    i += 3;
                }
                mpsse::SET_BITS_HIGH => {
                    if rest < 3 {
                        break;
                    }
                    self.cbus_data = self.pending[i + 1];
                    self.cbus_ddr = self.pending[i + 2];
                    i += 3;
                }
                mpsse::GET_BITS_LOW => {
                    // sample before the next clock edge
                    let bit = self.line.front().copied().unwrap_or(false);
                    let mut reply = self.dbus_data & !self.sample_pin;
                    if bit {
                        reply |= self.sample_pin;
                    }
                    self.replies.push_back(reply);
                    i += 1;
                }
                mpsse::GET_BITS_HIGH => {
                    self.replies.push_back(self.cbus_data);
                    i += 1;
                }
                mpsse::TCK_DIVISOR => {
                    if rest < 3 {
                        break;
                    }
                    self.divisor =
                        Some(u16::from_le_bytes([self.pending[i + 1], self.pending[i + 2]]));
                    i += 3;
                }
                mpsse::LOOPBACK_END | mpsse::SEND_IMMEDIATE => {
                    i += 1;
                }
                _ if op & mpsse::WRITE_TMS != 0 => {
                    if rest < 3 {
                        break;
                    }
                    let (len, payload) = (self.pending[i + 1], self.pending[i + 2]);
                    self.tms_shifts.push((len, payload));
                    for bit in 0..=len {
                        self.clock_out(payload >> bit & 1 != 0);
                    }
                    i += 3;
                }
                _ if op & (mpsse::DO_WRITE | mpsse::DO_READ) != 0 => {
                    let Some(n) = self.data_shift(op, i) else {
                        break;
                    };
                    self.data_shifts += 1;
                    i += n;
                }
                _ => panic!("unhandled MPSSE opcode {op:#04x}"),
            }
        }
        self.pending.drain(..i);
    }

    /// One data-shift command starting at `at`; returns the consumed
    /// byte count, or None if the command is not complete yet.
    fn data_shift(&mut self, op: u8, at: usize) -> Option<usize> {
        let writes = op & mpsse::DO_WRITE != 0;
        let reads = op & mpsse::DO_READ != 0;
        if op & mpsse::BITMODE != 0 {
            let header = if writes { 3 } else { 2 };
            if self.pending.len() - at < header {
                return None;
            }
            let bits = self.pending[at + 1] as usize + 1;
            let payload = if writes { self.pending[at + 2] } else { 0 };
            let mut reply = 0u8;
            for bit in 0..bits {
                if writes {
                    self.clock_out(payload >> bit & 1 != 0);
                }
                if reads && self.clock_in() {
                    // received bits pile up from the top of the byte
                    reply |= 1 << (8 - bits + bit);
                }
            }
            if reads {
                self.replies.push_back(reply);
            }
            Some(header)
        } else {
            if self.pending.len() - at < 3 {
                return None;
            }
            let nbytes = u16::from_le_bytes([self.pending[at + 1], self.pending[at + 2]]) as usize + 1;
            let header = if writes { 3 + nbytes } else { 3 };
            if self.pending.len() - at < header {
                return None;
            }
            for byte in 0..nbytes {
                let payload = if writes { self.pending[at + 3 + byte] } else { 0 };
                let mut reply = 0u8;
                for bit in 0..8 {
                    if writes {
                        self.clock_out(payload >> bit & 1 != 0);
                    }
                    if reads && self.clock_in() {
                        reply |= 1 << bit;
                    }
                }
                if reads {
                    self.replies.push_back(reply);
                }
            }
            Some(header)
        }
    }
}

impl CommandBuffer for LineSim {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes_written += bytes.len();
        self.pending.extend_from_slice(bytes);
        self.process();
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) -> io::Result<()> {
        for slot in out.iter_mut() {
            *slot = self
                .replies
                .pop_front()
                .expect("read past the end of the simulated reply stream");
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
