//! Bit-banged 1-Wire bus master on top of [`embedded-hal`](embedded_hal).
//!
//! The bus line is any open-drain capable pin implementing both
//! [`OutputPin`] and [`InputPin`]: `set_low` drives the line low,
//! `set_high` releases it to the pull-up, `is_high`/`is_low` sample it.
//! All slot timing is busy-waited through a caller-supplied [`DelayNs`];
//! a slot that gets interrupted mid-wait desynchronizes the slaves for
//! the remainder of the transaction, so callers must serialize access
//! to the bus and keep preemption away from each transaction.
//!
//! ```no_run
//! # use onewire_master::{OneWire, DeviceSearch};
//! # fn example<P, D>(pin: P, mut delay: D) -> Result<(), onewire_master::Error<P::Error>>
//! # where P: embedded_hal::digital::InputPin + embedded_hal::digital::OutputPin,
//! #       D: embedded_hal::delay::DelayNs {
//! let mut wire = OneWire::new(pin);
//! let mut search = DeviceSearch::new();
//! while let Some(device) = wire.search_next(&mut search, &mut delay)? {
//!     // address it later with wire.match_rom(&device, &mut delay)
//!     let _family = device.family_code();
//! }
//! # Ok(())
//! # }
//! ```

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod crc;
mod search;

use byteorder::{ByteOrder, LittleEndian};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

pub use search::DeviceSearch;

/// Reset pulse: line held low before listening for presence.
const RESET_PULSE_US: u32 = 480;
/// Settling time between releasing the reset pulse and sampling presence.
const RESET_SETTLE_US: u32 = 60;
/// Remainder of the reset slot after the presence sample.
const RESET_RECOVERY_US: u32 = 240;

/// Start-of-slot marker for a write slot.
const WRITE_SLOT_START_US: u32 = 10;
/// Time the line is held at the bit value within a write slot.
const WRITE_SLOT_LEVEL_US: u32 = 70;
/// Release time before the next slot may start.
const WRITE_SLOT_RECOVERY_US: u32 = 2;

/// Start-of-slot marker for a read slot.
const READ_SLOT_START_US: u32 = 2;
/// Window in which the slave settles its output before the master samples.
const READ_SLOT_SETTLE_US: u32 = 15;
/// Remainder of the read slot after the sample.
const READ_SLOT_RECOVERY_US: u32 = 50;

/// The generic ROM addressing commands understood by every 1-Wire slave.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Read the 8-byte ROM of the only slave on the bus.
    ReadRom = 0x33,
    /// Address the one slave whose ROM matches the 8 bytes that follow.
    MatchRom = 0x55,
    /// Address all slaves at once, without transmitting a ROM.
    SkipRom = 0xCC,
    /// Start one pass of the collision-resolving device search.
    SearchRom = 0xF0,
}

/// Errors of the protocol engine, generic over the pin error `E`.
#[derive(Debug, PartialEq, Eq)]
pub enum Error<E> {
    /// The line did not return to the idle (high) level before a reset,
    /// which usually means a short or a missing pull-up.
    WireNotHigh,
    /// A reset pulse received no presence pulse; the requested command
    /// was not transmitted.
    NoDevicePresent,
    /// A search read slot returned bit and complement both high, meaning
    /// no slave responded mid-pass.
    UnexpectedResponse,
    /// A discovered ROM failed its CRC-8 check: `CrcMismatch(computed, stored)`.
    CrcMismatch(u8, u8),
    /// The underlying pin reported an error.
    PinError(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::PinError(e)
    }
}

#[cfg(all(feature = "defmt", not(feature = "defmt-debug2format")))]
impl<E> defmt::Format for Error<E> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::WireNotHigh => defmt::write!(fmt, "WireNotHigh"),
            Error::NoDevicePresent => defmt::write!(fmt, "NoDevicePresent"),
            Error::UnexpectedResponse => defmt::write!(fmt, "UnexpectedResponse"),
            Error::CrcMismatch(computed, stored) => {
                defmt::write!(fmt, "CrcMismatch(computed: {=u8:x}, stored: {=u8:x})", *computed, *stored);
            }
            Error::PinError(_) => defmt::write!(fmt, "PinError"),
        }
    }
}

#[cfg(all(feature = "defmt", feature = "defmt-debug2format"))]
impl<E: core::fmt::Debug> defmt::Format for Error<E> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::WireNotHigh => defmt::write!(fmt, "WireNotHigh"),
            Error::NoDevicePresent => defmt::write!(fmt, "NoDevicePresent"),
            Error::UnexpectedResponse => defmt::write!(fmt, "UnexpectedResponse"),
            Error::CrcMismatch(computed, stored) => {
                defmt::write!(fmt, "CrcMismatch(computed: {=u8:x}, stored: {=u8:x})", *computed, *stored);
            }
            Error::PinError(e) => defmt::write!(fmt, "PinError({})", defmt::Debug2Format(e)),
        }
    }
}

/// A 64-bit ROM identifier, as laid out on the wire.
///
/// Byte 0 carries the family code, bytes 1..=6 the 48-bit serial number
/// unique per physical chip, byte 7 the CRC-8 over the first seven bytes.
/// Values read from a genuine device satisfy [`crc_valid`](Device::crc_valid);
/// the transport does not enforce this on its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Device {
    pub address: [u8; 8],
}

impl Device {
    /// The device-family code (e.g. 0x10 for the DS1820).
    #[must_use]
    pub const fn family_code(&self) -> u8 {
        self.address[0]
    }

    /// The 48-bit serial number, bytes 1..=6 of the ROM.
    #[must_use]
    pub fn serial(&self) -> &[u8] {
        &self.address[1..7]
    }

    /// The stored CRC-8 byte.
    #[must_use]
    pub const fn crc(&self) -> u8 {
        self.address[7]
    }

    /// Whether the stored CRC matches the CRC-8 of bytes 0..=6.
    #[must_use]
    pub fn crc_valid(&self) -> bool {
        crc::compute(&self.address[..7]) == self.address[7]
    }

    /// The ROM as a little-endian integer (bit 0 is the LSB of the
    /// family code, as transmitted first on the wire).
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        LittleEndian::read_u64(&self.address)
    }
}

impl From<u64> for Device {
    fn from(value: u64) -> Self {
        let mut address = [0_u8; 8];
        LittleEndian::write_u64(&mut address, value);
        Device { address }
    }
}

impl core::fmt::Display for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}", self.address[0])?;
        for byte in &self.address[1..] {
            write!(f, ":{byte:02x}")?;
        }
        Ok(())
    }
}

/// A 1-Wire bus master owning its bus line.
///
/// One value per physical bus; the engine assumes exclusive access for
/// the duration of each transaction. The line idles released (high).
pub struct OneWire<P> {
    pin: P,
}

impl<P> OneWire<P> {
    /// Wraps the bus line. `&mut pin` works as well as an owned pin.
    pub const fn new(pin: P) -> OneWire<P> {
        OneWire { pin }
    }

    /// Releases the bus line back to the caller.
    pub fn into_inner(self) -> P {
        self.pin
    }
}

impl<P> OneWire<P>
where
    P: OutputPin + InputPin,
{
    /// Sends a reset pulse and listens for a presence pulse.
    ///
    /// Returns `Ok(true)` when at least one slave pulled the line low,
    /// `Ok(false)` when the bus is idle but empty, and
    /// `Err(Error::WireNotHigh)` when the line never reached the idle
    /// level beforehand. Every transaction must start here.
    pub fn reset(&mut self, delay: &mut impl DelayNs) -> Result<bool, Error<P::Error>> {
        self.ensure_wire_high(delay)?;
        self.pin.set_low()?;
        delay.delay_us(RESET_PULSE_US);
        self.pin.set_high()?;
        delay.delay_us(RESET_SETTLE_US);
        let present = self.pin.is_low()?;
        delay.delay_us(RESET_RECOVERY_US);
        Ok(present)
    }

    fn ensure_wire_high(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        for _ in 0..125 {
            if self.pin.is_high()? {
                return Ok(());
            }
            delay.delay_us(2);
        }
        Err(Error::WireNotHigh)
    }

    /// Transmits a single bit, leaving the line released afterwards.
    pub fn write_bit(&mut self, bit: bool, delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        self.pin.set_low()?;
        delay.delay_us(WRITE_SLOT_START_US);
        if bit {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        delay.delay_us(WRITE_SLOT_LEVEL_US);
        self.pin.set_high()?;
        delay.delay_us(WRITE_SLOT_RECOVERY_US);
        Ok(())
    }

    /// Reads a single bit driven by a slave.
    pub fn read_bit(&mut self, delay: &mut impl DelayNs) -> Result<bool, Error<P::Error>> {
        self.pin.set_low()?;
        delay.delay_us(READ_SLOT_START_US);
        self.pin.set_high()?;
        delay.delay_us(READ_SLOT_SETTLE_US);
        let bit = self.pin.is_high()?;
        delay.delay_us(READ_SLOT_RECOVERY_US);
        Ok(bit)
    }

    /// Transmits a byte, least significant bit first.
    pub fn write_byte(&mut self, mut byte: u8, delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        for _ in 0..8 {
            self.write_bit(byte & 0x01 == 0x01, delay)?;
            byte >>= 1;
        }
        Ok(())
    }

    /// Reads a byte, least significant bit first.
    pub fn read_byte(&mut self, delay: &mut impl DelayNs) -> Result<u8, Error<P::Error>> {
        let mut byte = 0_u8;
        for _ in 0..8 {
            byte >>= 1;
            if self.read_bit(delay)? {
                byte |= 0x80;
            }
        }
        Ok(byte)
    }

    /// Transmits a run of bytes.
    pub fn write_bytes(&mut self, bytes: &[u8], delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        for &byte in bytes {
            self.write_byte(byte, delay)?;
        }
        Ok(())
    }

    /// Fills `dst` with bytes read from the bus.
    pub fn read_bytes(&mut self, dst: &mut [u8], delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        for slot in dst.iter_mut() {
            *slot = self.read_byte(delay)?;
        }
        Ok(())
    }

    /// Reads the ROM of the only slave on the bus (command 0x33).
    ///
    /// Valid only with exactly one slave present; with several, every
    /// slave answers at once and the result is garbage the hardware
    /// cannot flag. The returned value is not CRC-checked, see
    /// [`Device::crc_valid`].
    pub fn read_rom(&mut self, delay: &mut impl DelayNs) -> Result<Device, Error<P::Error>> {
        if !self.reset(delay)? {
            return Err(Error::NoDevicePresent);
        }
        self.write_byte(Command::ReadRom as u8, delay)?;
        let mut address = [0_u8; 8];
        self.read_bytes(&mut address, delay)?;
        Ok(Device { address })
    }

    /// Addresses one slave by its ROM (command 0x55).
    ///
    /// Only the matching slave stays active for the next command; all
    /// others wait for the next reset.
    pub fn match_rom(&mut self, device: &Device, delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        if !self.reset(delay)? {
            return Err(Error::NoDevicePresent);
        }
        self.write_byte(Command::MatchRom as u8, delay)?;
        self.write_bytes(&device.address, delay)
    }

    /// Addresses every slave at once (command 0xCC).
    ///
    /// Valid with a single slave, or when the following command is an
    /// intentional broadcast.
    pub fn skip_rom(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<P::Error>> {
        if !self.reset(delay)? {
            return Err(Error::NoDevicePresent);
        }
        self.write_byte(Command::SkipRom as u8, delay)
    }
}
