//! A simulated 1-Wire line for driving the master against protocol-exact
//! fake slaves, without hardware.
//!
//! The pin and the delay share one bus state: waits advance a virtual
//! clock, and pin edges are classified by how long the master held the
//! line low (reset pulse, 0-slot, 1-slot or read slot). On a read slot
//! the slaves place the wired-AND of their outputs on the line for the
//! settling window, which is where the master samples.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use onewire_master::{Device, crc};

/// Presence pulse window relative to the release of the reset pulse.
const PRESENCE_FROM_NS: u64 = 15_000;
const PRESENCE_UNTIL_NS: u64 = 75_000;

/// How long a slave holds its output after the start of a read slot.
const READ_HOLD_NS: u64 = 45_000;

/// Builds a ROM with a valid CRC byte from family code and serial.
pub fn device(family: u8, serial: [u8; 6]) -> Device {
    let mut address = [0_u8; 8];
    address[0] = family;
    address[1..7].copy_from_slice(&serial);
    address[7] = crc::compute(&address[..7]);
    Device { address }
}

pub struct SimBus {
    inner: Rc<RefCell<Bus>>,
}

impl SimBus {
    /// A bus populated with the given slaves.
    pub fn new(devices: &[Device]) -> SimBus {
        SimBus {
            inner: Rc::new(RefCell::new(Bus {
                slaves: devices
                    .iter()
                    .map(|device| Slave {
                        rom: device.address,
                        selected: true,
                    })
                    .collect(),
                ..Bus::default()
            })),
        }
    }

    /// A slave-less line that echoes written bits back on read slots.
    pub fn loopback() -> SimBus {
        SimBus {
            inner: Rc::new(RefCell::new(Bus {
                mode: Mode::Loopback(VecDeque::new()),
                ..Bus::default()
            })),
        }
    }

    pub fn pin(&self) -> SimPin {
        SimPin {
            inner: Rc::clone(&self.inner),
        }
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay {
            inner: Rc::clone(&self.inner),
        }
    }

    /// The slaves still addressed by the last ROM command.
    pub fn selected(&self) -> Vec<Device> {
        self.inner
            .borrow()
            .slaves
            .iter()
            .filter(|slave| slave.selected)
            .map(|slave| Device { address: slave.rom })
            .collect()
    }

    /// Number of non-reset slots (bit writes and read slots) seen so far.
    pub fn data_slots(&self) -> u64 {
        self.inner.borrow().slots
    }

    /// Shorts the line to ground: the master never sees it high again.
    pub fn short_to_ground(&self) {
        self.inner.borrow_mut().stuck_low = true;
    }

    /// Slaves keep answering resets but stop driving data slots, as if
    /// they lost power mid-transaction.
    pub fn silence_slaves(&self) {
        self.inner.borrow_mut().silenced = true;
    }
}

pub struct SimPin {
    inner: Rc<RefCell<Bus>>,
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.inner.borrow_mut().drive_low();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.inner.borrow_mut().release();
        Ok(())
    }
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.inner.borrow().sample())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.inner.borrow().sample())
    }
}

pub struct SimDelay {
    inner: Rc<RefCell<Bus>>,
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.inner.borrow_mut().now += u64::from(ns);
    }
}

struct Slave {
    rom: [u8; 8],
    selected: bool,
}

#[derive(Default)]
enum Mode {
    #[default]
    Idle,
    /// Accumulating the ROM command byte that follows a reset.
    Command {
        byte: u8,
        bits: u8,
    },
    /// Streaming the ROM of the selected slaves out, bit `index` next.
    ReadRom {
        index: u8,
    },
    /// Comparing an incoming ROM against each slave, bit `index` next.
    MatchRom {
        index: u8,
    },
    /// Search ROM: bit, complement, then the master's direction echo.
    Search {
        index: u8,
        phase: Phase,
    },
    /// Written bits are queued and replayed on read slots.
    Loopback(VecDeque<bool>),
}

enum Phase {
    Bit,
    Complement,
    Direction,
}

#[derive(Default)]
struct Bus {
    now: u64,
    master_low: bool,
    low_since: u64,
    /// Window in which slaves hold the presence pulse low.
    presence: Option<(u64, u64)>,
    /// Slave output of the current read slot: value and hold window.
    read_slot: Option<(bool, u64, u64)>,
    slaves: Vec<Slave>,
    mode: Mode,
    slots: u64,
    /// Line shorted to ground.
    stuck_low: bool,
    /// Slaves answer presence but no longer drive data slots.
    silenced: bool,
}

impl Bus {
    fn drive_low(&mut self) {
        if !self.master_low {
            self.master_low = true;
            self.low_since = self.now;
        }
    }

    fn release(&mut self) {
        if !self.master_low {
            return;
        }
        self.master_low = false;
        let held_us = (self.now - self.low_since) / 1_000;
        if held_us >= 240 {
            self.on_reset();
        } else if held_us >= 60 {
            self.on_bit_written(false);
        } else if held_us >= 5 {
            self.on_bit_written(true);
        } else {
            self.on_read_slot();
        }
    }

    fn on_reset(&mut self) {
        if let Mode::Loopback(_) = self.mode {
            return;
        }
        for slave in &mut self.slaves {
            slave.selected = true;
        }
        self.mode = Mode::Command { byte: 0, bits: 0 };
        self.presence = if self.slaves.is_empty() {
            None
        } else {
            Some((self.now + PRESENCE_FROM_NS, self.now + PRESENCE_UNTIL_NS))
        };
    }

    fn on_bit_written(&mut self, bit: bool) {
        self.slots += 1;
        let mode = std::mem::take(&mut self.mode);
        self.mode = match mode {
            Mode::Loopback(mut queue) => {
                queue.push_back(bit);
                Mode::Loopback(queue)
            }
            Mode::Command { mut byte, bits } => {
                if bit {
                    byte |= 1 << bits;
                }
                if bits == 7 {
                    command_mode(byte)
                } else {
                    Mode::Command {
                        byte,
                        bits: bits + 1,
                    }
                }
            }
            Mode::MatchRom { index } => {
                self.deselect_mismatches(index, bit);
                if index == 63 {
                    Mode::Idle
                } else {
                    Mode::MatchRom { index: index + 1 }
                }
            }
            Mode::Search {
                index,
                phase: Phase::Direction,
            } => {
                self.deselect_mismatches(index, bit);
                if index == 63 {
                    Mode::Idle
                } else {
                    Mode::Search {
                        index: index + 1,
                        phase: Phase::Bit,
                    }
                }
            }
            other => other,
        };
    }

    fn on_read_slot(&mut self) {
        self.slots += 1;
        let mode = std::mem::take(&mut self.mode);
        let (value, next) = match mode {
            Mode::Loopback(mut queue) => {
                let value = queue.pop_front().unwrap_or(true);
                (value, Mode::Loopback(queue))
            }
            Mode::ReadRom { index } => {
                let value = self.wired_and(|rom| rom_bit(rom, index));
                let next = if index == 63 {
                    Mode::Idle
                } else {
                    Mode::ReadRom { index: index + 1 }
                };
                (value, next)
            }
            Mode::Search {
                index,
                phase: Phase::Bit,
            } => (
                self.wired_and(|rom| rom_bit(rom, index)),
                Mode::Search {
                    index,
                    phase: Phase::Complement,
                },
            ),
            Mode::Search {
                index,
                phase: Phase::Complement,
            } => (
                self.wired_and(|rom| !rom_bit(rom, index)),
                Mode::Search {
                    index,
                    phase: Phase::Direction,
                },
            ),
            other => (true, other),
        };
        self.mode = next;
        self.read_slot = Some((value, self.low_since, self.low_since + READ_HOLD_NS));
    }

    fn deselect_mismatches(&mut self, index: u8, bit: bool) {
        for slave in &mut self.slaves {
            if slave.selected && rom_bit(&slave.rom, index) != bit {
                slave.selected = false;
            }
        }
    }

    /// Open-drain bus: the line carries the AND of every participating
    /// slave's output. Nobody driving reads as pulled-up high.
    fn wired_and(&self, output: impl Fn(&[u8; 8]) -> bool) -> bool {
        if self.silenced {
            // Nobody drives, the pull-up wins on both reads of a slot.
            return true;
        }
        self.slaves
            .iter()
            .filter(|slave| slave.selected)
            .all(|slave| output(&slave.rom))
    }

    fn sample(&self) -> bool {
        if self.stuck_low || self.master_low {
            return false;
        }
        if let Some((from, until)) = self.presence {
            if self.now >= from && self.now <= until {
                return false;
            }
        }
        if let Some((value, from, until)) = self.read_slot {
            if self.now >= from && self.now <= until && !value {
                return false;
            }
        }
        true
    }
}

fn command_mode(byte: u8) -> Mode {
    match byte {
        0x33 => Mode::ReadRom { index: 0 },
        0x55 => Mode::MatchRom { index: 0 },
        0xF0 => Mode::Search {
            index: 0,
            phase: Phase::Bit,
        },
        // Skip ROM leaves every slave selected for what follows.
        _ => Mode::Idle,
    }
}

fn rom_bit(rom: &[u8; 8], position: u8) -> bool {
    rom[usize::from(position / 8)] & (1 << (position % 8)) != 0
}
