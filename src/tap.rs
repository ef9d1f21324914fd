//! The SWD tap driver: turnaround state machine and bit/word shift engine.
//!
//! SWD is a half-duplex protocol on a single data line. The tap tracks
//! who is driving that line and emits the one-clock turnaround the
//! protocol requires whenever the direction actually changes. On top of
//! that sit the shift primitives the request layer is built from: single
//! bits, words of up to 32 bits, and words with a trailing even-parity
//! bit.
//!
//! Two command encodings exist, picked once at init from the cable
//! profile. Cables whose SWDIO reaches the dedicated serial pins shift
//! whole words per command; cables where SWDIO shares the TMS/CS pad
//! fall back to per-bit pin toggling.

use bitvec::prelude::*;
use std::io;
use tracing::{debug, trace};

use crate::buffer::CommandBuffer;
use crate::cable::CableProfile;
use crate::mpsse;

/// Who currently drives the SWDIO line.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// The host drives the line.
    Drive,
    /// The host has released the line; the target drives it while the
    /// host only clocks and samples.
    Float,
}

/// How the attached bridge realizes bit transfers. Fixed after init.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ShiftMode {
    /// SWDIO maps to the dedicated DO/DI pins; the engine shifts whole
    /// words per command.
    Native,
    /// SWDIO shares the TMS/CS pad; every transfer toggles the pad
    /// direction and shifts through the 7-bit TMS command.
    Manual,
}

#[derive(Debug, thiserror::Error)]
pub enum TapError {
    /// The cable description carries neither the native direction
    /// patches nor a usable shared-pin assignment.
    #[error("cable description cannot realize SWD")]
    UnsupportedCable,
    /// Transport failure, propagated unchanged. The tap never retries;
    /// retry policy belongs to the layer that knows transaction
    /// boundaries.
    #[error("transport I/O failed")]
    Io(#[from] io::Error),
}

/// An initialized SWD tap over some command buffer.
///
/// All state lives in the instance; independent taps (for example over a
/// simulated transport) do not affect each other. Operations take `&mut
/// self` and must be called sequentially, matching the serial nature of
/// the wire itself.
#[derive(Debug)]
pub struct SwdTap<B> {
    buffer: B,
    cable: CableProfile,
    mode: ShiftMode,
    dir: Direction,
}

impl<B: CommandBuffer> SwdTap<B> {
    /// Checks the cable can do SWD at all, picks the shift mode,
    /// programs clock divisor and initial pin directions, and leaves the
    /// host driving the line. The configuration is flushed to the device
    /// before this returns.
    pub fn new(buffer: B, cable: CableProfile) -> Result<Self, TapError> {
        let native = !cable.swd_read.is_empty() && !cable.swd_write.is_empty();
        if !native
            && (cable.bitbang_tms_in_port_cmd == 0
                || cable.bitbang_tms_in_pin == 0
                || cable.bitbang_swd_dbus_read_data == 0)
        {
            return Err(TapError::UnsupportedCable);
        }

        let mode = if native {
            ShiftMode::Native
        } else {
            ShiftMode::Manual
        };
        let mut tap = Self {
            buffer,
            cable,
            mode,
            dir: Direction::Drive,
        };

        let mut init = [0u8; 9];
        init[0] = mpsse::TCK_DIVISOR;
        init[1] = 0x01;
        init[2] = 0x00;
        init[3] = mpsse::SET_BITS_LOW;
        match mode {
            ShiftMode::Native => {
                debug!("using native MPSSE shifts for SWD");
                // DO floats until the first turnaround takes the line
                tap.cable.dbus_ddr &= !mpsse::PIN_DO;
                init[4] = tap.cable.dbus_data;
                init[5] = tap.cable.dbus_ddr;
            }
            ShiftMode::Manual => {
                debug!("using per-pin MPSSE shifts for SWD");
                init[4] = tap.cable.dbus_data | mpsse::SWD_IO_MASK;
                init[5] = tap.cable.dbus_ddr & !mpsse::SWD_DATA_MASK;
            }
        }
        init[6] = mpsse::SET_BITS_HIGH;
        init[7] = tap.cable.cbus_data;
        init[8] = tap.cable.cbus_ddr;
        tap.buffer.write(&init)?;

        match mode {
            ShiftMode::Native => {
                tap.dir = Direction::Float;
                tap.turnaround(Direction::Drive)?;
            }
            ShiftMode::Manual => {
                // the init command above already set the pad directions
                // for driving
                tap.dir = Direction::Drive;
            }
        }
        tap.buffer.flush()?;
        Ok(tap)
    }

    /// Current line direction.
    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    /// Changes the line direction, emitting commands only on an actual
    /// transition. The protocol wants exactly one clock of settling time
    /// per turnaround; more would desynchronize the target, fewer would
    /// let host and target fight over the line.
    fn turnaround(&mut self, dir: Direction) -> io::Result<()> {
        if dir == self.dir {
            return Ok(());
        }
        trace!("turnaround {:?} -> {:?}", self.dir, dir);
        self.dir = dir;
        match self.mode {
            ShiftMode::Native => self.turnaround_native(dir),
            ShiftMode::Manual => self.turnaround_manual(dir),
        }
    }

    /// Native turnaround. The line must be released before the target
    /// may drive it, but retaken only after the clock has let the target
    /// finish, so the pin-bank write goes before the settling clock when
    /// floating and after it when retaking.
    fn turnaround_native(&mut self, dir: Direction) -> io::Result<()> {
        if dir == Direction::Float {
            self.cable.apply(self.cable.swd_read);
            let cmd = [
                mpsse::SET_BITS_LOW,
                self.cable.dbus_data,
                self.cable.dbus_ddr & !mpsse::PIN_DO,
                mpsse::SET_BITS_HIGH,
                self.cable.cbus_data,
                self.cable.cbus_ddr,
            ];
            self.buffer.write(&cmd)?;
        }
        // one clock cycle for the line to settle
        self.buffer.write(&[mpsse::DATA_SHIFT_OUT, 0, 0])?;
        if dir == Direction::Drive {
            self.cable.apply(self.cable.swd_write);
            let cmd = [
                mpsse::SET_BITS_LOW,
                self.cable.dbus_data,
                self.cable.dbus_ddr | mpsse::PIN_DO,
                mpsse::SET_BITS_HIGH,
                self.cable.cbus_data,
                self.cable.cbus_ddr,
            ];
            self.buffer.write(&cmd)?;
        }
        Ok(())
    }

    /// Shared-pin turnaround. The settling clock runs on the TMS command
    /// because SWDIO lives on that pad here.
    fn turnaround_manual(&mut self, dir: Direction) -> io::Result<()> {
        let mut cmd = [0u8; 6];
        let mut n = 0;
        if dir == Direction::Float {
            cmd[n] = mpsse::SET_BITS_LOW;
            cmd[n + 1] = if self.cable.bitbang_swd_dbus_read_data != 0 {
                self.cable.bitbang_swd_dbus_read_data
            } else {
                self.cable.dbus_data
            };
            cmd[n + 2] = self.cable.dbus_ddr & !mpsse::SWD_IO_MASK;
            n += 3;
        }
        // one clock cycle
        cmd[n] = mpsse::TMS_SHIFT;
        cmd[n + 1] = 0;
        cmd[n + 2] = 0;
        n += 3;
        if dir == Direction::Drive {
            cmd[n] = mpsse::SET_BITS_LOW;
            cmd[n + 1] = self.cable.dbus_data | mpsse::SWD_IO_MASK;
            cmd[n + 2] = self.cable.dbus_ddr & !mpsse::SWD_DATA_MASK;
            n += 3;
        }
        self.buffer.write(&cmd[..n])
    }

    /// Clocks one bit in from the target.
    pub fn bit_in(&mut self) -> Result<bool, TapError> {
        self.turnaround(Direction::Float)?;
        let mut reply = [0u8; 1];
        match self.mode {
            ShiftMode::Native => {
                self.buffer.write(&[mpsse::DATA_SHIFT_IN, 0])?;
                self.buffer.read(&mut reply)?;
                Ok(reply[0] & 0x80 != 0)
            }
            ShiftMode::Manual => {
                self.buffer.write(&[
                    self.cable.bitbang_tms_in_port_cmd,
                    mpsse::TMS_SHIFT,
                    0,
                    0,
                ])?;
                self.buffer.read(&mut reply)?;
                Ok(reply[0] & self.cable.bitbang_tms_in_pin != 0)
            }
        }
    }

    /// Clocks one bit out to the target.
    pub fn bit_out(&mut self, val: bool) -> Result<(), TapError> {
        self.turnaround(Direction::Drive)?;
        let opcode = match self.mode {
            ShiftMode::Native => mpsse::DATA_SHIFT_OUT,
            ShiftMode::Manual => mpsse::TMS_SHIFT,
        };
        self.buffer.write(&[opcode, 0, val as u8])?;
        Ok(())
    }

    /// Clocks `ticks` bits in, LSB first. Emits nothing for zero ticks.
    pub fn seq_in(&mut self, ticks: usize) -> Result<u32, TapError> {
        assert!(ticks <= 32);
        if ticks == 0 {
            return Ok(0);
        }
        self.turnaround(Direction::Float)?;
        let word = match self.mode {
            ShiftMode::Native => self.seq_in_native(ticks)?,
            ShiftMode::Manual => self.seq_in_manual(ticks)?,
        };
        trace!("seq_in({ticks}) -> {word:#010x}");
        Ok(word)
    }

    fn seq_in_native(&mut self, ticks: usize) -> io::Result<u32> {
        let mut reply = [0u8; 4];
        let n = ticks.div_ceil(8);
        self.buffer.shift(None, Some(&mut reply[..n]), ticks)?;
        Ok(reply.view_bits::<Lsb0>()[..ticks].load_le::<u32>())
    }

    fn seq_in_manual(&mut self, ticks: usize) -> io::Result<u32> {
        // one sample plus one clock per bit; the shared-pin shift opcode
        // cannot batch reads
        let cmd = [
            self.cable.bitbang_tms_in_port_cmd,
            mpsse::TMS_SHIFT,
            0,
            0,
        ];
        for _ in 0..ticks {
            self.buffer.write(&cmd)?;
        }
        let mut reply = [0u8; 32];
        self.buffer.read(&mut reply[..ticks])?;
        let mut word = 0u32;
        for (i, byte) in reply[..ticks].iter().enumerate() {
            if byte & self.cable.bitbang_tms_in_pin != 0 {
                word |= 1 << i;
            }
        }
        Ok(word)
    }

    /// Clocks a full 32-bit word plus its parity bit in: 33 bit
    /// positions on the wire. The flag is true when the received parity
    /// matches the word; a mismatch is data corruption the caller has to
    /// act on, typically by retrying the whole transaction.
    pub fn seq_in_parity(&mut self) -> Result<(u32, bool), TapError> {
        self.turnaround(Direction::Float)?;
        let (word, parity) = match self.mode {
            ShiftMode::Native => {
                let mut reply = [0u8; 5];
                self.buffer.shift(None, Some(&mut reply), 33)?;
                let word = reply[..4].view_bits::<Lsb0>().load_le::<u32>();
                (word, reply[4] & 1 != 0)
            }
            ShiftMode::Manual => {
                let cmd = [
                    self.cable.bitbang_tms_in_port_cmd,
                    mpsse::TMS_SHIFT,
                    0,
                    0,
                ];
                for _ in 0..33 {
                    self.buffer.write(&cmd)?;
                }
                let mut reply = [0u8; 33];
                self.buffer.read(&mut reply)?;
                let mut word = 0u32;
                for (i, byte) in reply[..32].iter().enumerate() {
                    if byte & self.cable.bitbang_tms_in_pin != 0 {
                        word |= 1 << i;
                    }
                }
                (word, reply[32] & self.cable.bitbang_tms_in_pin != 0)
            }
        };
        let ok = (word.count_ones() & 1 == 1) == parity;
        trace!("seq_in_parity -> {word:#010x}, parity ok: {ok}");
        Ok((word, ok))
    }

    /// Clocks the low `ticks` bits of `word` out, LSB first. Emits
    /// nothing for zero ticks.
    pub fn seq_out(&mut self, word: u32, ticks: usize) -> Result<(), TapError> {
        assert!(ticks <= 32);
        if ticks == 0 {
            return Ok(());
        }
        trace!("seq_out({word:#010x}, {ticks})");
        self.turnaround(Direction::Drive)?;
        match self.mode {
            ShiftMode::Native => self.seq_out_native(word, ticks)?,
            ShiftMode::Manual => self.seq_out_manual(word, ticks)?,
        }
        Ok(())
    }

    fn seq_out_native(&mut self, word: u32, ticks: usize) -> io::Result<()> {
        self.buffer.shift(Some(&word.to_le_bytes()), None, ticks)
    }

    fn seq_out_manual(&mut self, mut word: u32, mut ticks: usize) -> io::Result<()> {
        // the TMS shift carries at most 7 payload bits per command
        let mut cmd = Vec::with_capacity(15);
        while ticks > 0 {
            let chunk = ticks.min(7);
            cmd.push(mpsse::TMS_SHIFT);
            cmd.push((chunk - 1) as u8);
            cmd.push((word & 0x7f) as u8);
            word >>= 7;
            ticks -= chunk;
        }
        self.buffer.write(&cmd)
    }

    /// Like [`seq_out`](Self::seq_out) with one trailing parity bit.
    /// Parity is the XOR of all 32 bits of `word` regardless of `ticks`,
    /// and goes on the wire exactly once.
    pub fn seq_out_parity(&mut self, word: u32, ticks: usize) -> Result<(), TapError> {
        assert!(ticks <= 32);
        let parity = word.count_ones() & 1 == 1;
        trace!("seq_out_parity({word:#010x}, {ticks}), parity {}", parity as u8);
        self.turnaround(Direction::Drive)?;
        match self.mode {
            ShiftMode::Native => {
                // data and parity travel in one shift of ticks + 1 bits
                let masked = if ticks == 32 {
                    word
                } else {
                    word & ((1u32 << ticks) - 1)
                };
                let mut out = [0u8; 5];
                out[..4].copy_from_slice(&masked.to_le_bytes());
                out[ticks / 8] |= (parity as u8) << (ticks % 8);
                self.buffer.shift(Some(&out), None, ticks + 1)?;
            }
            ShiftMode::Manual => {
                self.seq_out_manual(word, ticks)?;
                self.buffer.write(&[mpsse::TMS_SHIFT, 0, parity as u8])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LineSim;

    fn native_tap() -> SwdTap<LineSim> {
        SwdTap::new(LineSim::native(), CableProfile::buffered_swd()).unwrap()
    }

    fn manual_tap() -> SwdTap<LineSim> {
        SwdTap::new(LineSim::manual(mpsse::PIN_CS), CableProfile::resistor_swd()).unwrap()
    }

    #[test]
    fn native_cable_selects_native_shifts() {
        let tap = native_tap();
        let sim = tap.buffer();
        // config command, then exactly one turnaround (with its settle
        // clock) to take the line
        assert_eq!(sim.turnarounds, 1);
        assert_eq!(sim.data_shifts, 1);
        assert_eq!(sim.divisor, Some(1));
        assert_eq!(sim.flushes, 1);
        assert_eq!(tap.direction(), Direction::Drive);
    }

    #[test]
    fn manual_cable_starts_driving_without_a_turnaround() {
        let tap = manual_tap();
        let sim = tap.buffer();
        // pin directions come from the config command alone
        assert!(sim.tms_shifts.is_empty());
        assert_eq!(sim.data_shifts, 0);
        assert_eq!(sim.flushes, 1);
        assert_eq!(tap.direction(), Direction::Drive);
    }

    #[test]
    fn bare_cable_is_rejected() {
        let err = SwdTap::new(LineSim::native(), CableProfile::default()).unwrap_err();
        assert!(matches!(err, TapError::UnsupportedCable));
    }

    #[test]
    fn partial_manual_cable_is_rejected() {
        let mut cable = CableProfile::resistor_swd();
        cable.bitbang_swd_dbus_read_data = 0;
        let err = SwdTap::new(LineSim::manual(mpsse::PIN_CS), cable).unwrap_err();
        assert!(matches!(err, TapError::UnsupportedCable));
    }

    #[test]
    fn repeated_reads_share_one_turnaround() {
        let mut tap = native_tap();
        let before = tap.buffer().turnarounds;
        tap.bit_in().unwrap();
        tap.bit_in().unwrap();
        assert_eq!(tap.buffer().turnarounds, before + 1);
    }

    #[test]
    fn alternating_bits_turn_around_every_time() {
        let mut tap = native_tap();
        let before = tap.buffer().turnarounds;
        tap.bit_in().unwrap();
        tap.bit_out(true).unwrap();
        tap.bit_in().unwrap();
        assert_eq!(tap.buffer().turnarounds, before + 3);
    }

    #[test]
    fn single_bits_loop_back() {
        let mut tap = native_tap();
        tap.bit_out(true).unwrap();
        tap.bit_out(false).unwrap();
        tap.bit_out(true).unwrap();
        assert!(tap.bit_in().unwrap());
        assert!(!tap.bit_in().unwrap());
        assert!(tap.bit_in().unwrap());
    }

    #[test]
    fn manual_bit_in_samples_the_shared_pin() {
        let mut tap = manual_tap();
        tap.buffer_mut().line.extend([true, false, true]);
        assert!(tap.bit_in().unwrap());
        assert!(!tap.bit_in().unwrap());
        assert!(tap.bit_in().unwrap());
    }

    #[test]
    fn words_loop_back_at_every_width_native() {
        let mut tap = native_tap();
        for ticks in 1..=32 {
            let mask = if ticks == 32 { !0 } else { (1u32 << ticks) - 1 };
            tap.seq_out(0xdead_beef, ticks).unwrap();
            assert_eq!(
                tap.seq_in(ticks).unwrap(),
                0xdead_beef & mask,
                "ticks {ticks}"
            );
        }
    }

    #[test]
    fn words_loop_back_at_every_width_manual() {
        let mut tap = manual_tap();
        for ticks in 1..=32 {
            let mask = if ticks == 32 { !0 } else { (1u32 << ticks) - 1 };
            tap.seq_out(0x96a5_c33c, ticks).unwrap();
            assert_eq!(
                tap.seq_in(ticks).unwrap(),
                0x96a5_c33c & mask,
                "ticks {ticks}"
            );
        }
    }

    #[test]
    fn parity_word_loops_back_native() {
        let mut tap = native_tap();
        tap.seq_out_parity(0xdead_beef, 32).unwrap();
        assert_eq!(tap.buffer().line.len(), 33);
        let (word, parity_ok) = tap.seq_in_parity().unwrap();
        assert_eq!(word, 0xdead_beef);
        assert!(parity_ok);
    }

    #[test]
    fn parity_word_loops_back_manual() {
        let mut tap = manual_tap();
        tap.seq_out_parity(0xcafe_f00d, 32).unwrap();
        assert_eq!(tap.buffer().line.len(), 33);
        let (word, parity_ok) = tap.seq_in_parity().unwrap();
        assert_eq!(word, 0xcafe_f00d);
        assert!(parity_ok);
    }

    #[test]
    fn flipped_data_bit_fails_parity() {
        let mut tap = native_tap();
        tap.seq_out_parity(0xdead_beef, 32).unwrap();
        let flipped = !tap.buffer().line[7];
        tap.buffer_mut().line[7] = flipped;
        let (_, parity_ok) = tap.seq_in_parity().unwrap();
        assert!(!parity_ok);
    }

    #[test]
    fn flipped_parity_bit_fails_parity() {
        let mut tap = native_tap();
        tap.seq_out_parity(0xdead_beef, 32).unwrap();
        let flipped = !tap.buffer().line[32];
        tap.buffer_mut().line[32] = flipped;
        let (word, parity_ok) = tap.seq_in_parity().unwrap();
        assert_eq!(word, 0xdead_beef);
        assert!(!parity_ok);
    }

    #[test]
    fn zero_ticks_emit_nothing() {
        let mut tap = native_tap();
        let before = tap.buffer().bytes_written;
        assert_eq!(tap.seq_in(0).unwrap(), 0);
        tap.seq_out(0x1234, 0).unwrap();
        assert_eq!(tap.buffer().bytes_written, before);
    }

    #[test]
    fn manual_output_chunks_into_seven_bit_groups() {
        let mut tap = manual_tap();
        tap.seq_out(0x2ab, 10).unwrap();
        assert_eq!(tap.buffer().tms_shifts, vec![(6, 0x2b), (2, 0x05)]);
    }

    #[test]
    fn parity_covers_all_word_bits_regardless_of_ticks() {
        let mut tap = native_tap();
        // bit 31 contributes to parity even when only one data bit goes
        // out, and the parity bit follows the data directly
        tap.seq_out_parity(0x8000_0001, 1).unwrap();
        let line: Vec<bool> = tap.buffer().line.iter().copied().collect();
        assert_eq!(line, vec![true, false]);
    }
}
