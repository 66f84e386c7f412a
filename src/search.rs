//! Device discovery: the Search ROM (0xF0) collision-resolution walk
//! over the binary tree of 64-bit ROM identifiers present on the bus.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::{Command, Device, Error, OneWire, crc};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// Bus settle time after a completed enumeration.
const SEARCH_SETTLE_MS: u32 = 10;

/// One bit per ROM bit position; a set bit means the search has forced
/// that position to 1 on the current branch of the identifier tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CollisionMap([u8; 8]);

impl CollisionMap {
    fn is_set(&self, position: u8) -> bool {
        self.0[usize::from(position / 8)] & (1 << (position % 8)) != 0
    }

    fn set(&mut self, position: u8) {
        self.0[usize::from(position / 8)] |= 1 << (position % 8);
    }

    /// Clears every bit at a position strictly greater than `position`,
    /// so the positions below the newly taken 1-branch restart their own
    /// branch search.
    fn clear_after(&mut self, position: u8) {
        let next = position + 1;
        let byte = usize::from(next / 8);
        if byte >= 8 {
            return;
        }
        self.0[byte] &= (1 << (next % 8)) - 1;
        for rest in &mut self.0[byte + 1..] {
            *rest = 0;
        }
    }
}

/// Resumable state of one discovery session.
///
/// Create it once, then feed it to [`OneWire::search_next`] until that
/// returns `Ok(None)`. The state is cheap and holds no bus resources, so
/// an exhausted session is simply dropped. The engine itself never stops
/// retrying a faulty bus that keeps reporting collisions; callers that
/// need a bound put a cap on their `search_next` loop.
#[derive(Debug, Default, Clone)]
pub struct DeviceSearch {
    collisions: CollisionMap,
    finished: bool,
}

impl DeviceSearch {
    /// Starts a fresh session with an all-zero collision map.
    #[must_use]
    pub fn new() -> DeviceSearch {
        DeviceSearch::default()
    }

    /// Whether the last branch of the identifier tree has been visited.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<P> OneWire<P>
where
    P: OutputPin + InputPin,
{
    /// Runs one discovery pass and returns the next identifier, or
    /// `Ok(None)` once the bus is exhausted (or empty: a reset without a
    /// presence pulse ends the session before any bit is exchanged).
    ///
    /// Each pass walks all 64 bit positions. Per position the master
    /// reads the bit and its complement, both driven by every slave
    /// still participating:
    ///
    /// * `(1,0)` / `(0,1)` — all participants agree, the bit is forced;
    /// * `(0,0)` — collision; take the 1-branch if this position was
    ///   already forced on an earlier pass, otherwise take 0 and note
    ///   the position as the branch point to flip next pass;
    /// * `(1,1)` — nobody answered, [`Error::UnexpectedResponse`].
    ///
    /// The chosen bit is echoed back, which deselects every slave that
    /// disagrees. A completed pass therefore names exactly one device.
    /// Its CRC is verified before the session state advances, so a
    /// [`Error::CrcMismatch`] can be retried by calling again.
    pub fn search_next(
        &mut self,
        search: &mut DeviceSearch,
        delay: &mut impl DelayNs,
    ) -> Result<Option<Device>, Error<P::Error>> {
        if search.finished {
            return Ok(None);
        }
        if !self.reset(delay)? {
            search.finished = true;
            return Ok(None);
        }
        self.write_byte(Command::SearchRom as u8, delay)?;

        let mut address = [0_u8; 8];
        let mut unresolved = None;
        for position in 0..64_u8 {
            let bit = self.read_bit(delay)?;
            let complement = self.read_bit(delay)?;
            let chosen = match (bit, complement) {
                (true, true) => return Err(Error::UnexpectedResponse),
                (true, false) => true,
                (false, true) => false,
                (false, false) => {
                    if search.collisions.is_set(position) {
                        // This branch point is exhausted on the 1 side.
                        true
                    } else {
                        unresolved = Some(position);
                        false
                    }
                }
            };
            self.write_bit(chosen, delay)?;
            if chosen {
                address[usize::from(position / 8)] |= 1 << (position % 8);
            }
        }

        let computed = crc::compute(&address[..7]);
        if computed != address[7] {
            return Err(Error::CrcMismatch(computed, address[7]));
        }

        // The latest unresolved collision is the branch to flip on the
        // next pass; everything past it starts over. No collision left
        // means this was the last leaf of the tree.
        match unresolved {
            Some(position) => {
                search.collisions.set(position);
                search.collisions.clear_after(position);
            }
            None => search.finished = true,
        }
        Ok(Some(Device { address }))
    }

    /// Enumerates every device on the bus (command 0xF0).
    ///
    /// The returned order is determined by the identifier bit tree
    /// (0-branches first, LSB of the family code outward), so repeated
    /// runs over an unchanged bus yield the same sequence. An empty bus
    /// yields an empty set.
    #[cfg(feature = "alloc")]
    pub fn search_rom(&mut self, delay: &mut impl DelayNs) -> Result<Vec<Device>, Error<P::Error>> {
        let mut devices = Vec::new();
        let mut search = DeviceSearch::new();
        while let Some(device) = self.search_next(&mut search, delay)? {
            devices.push(device);
        }
        delay.delay_ms(SEARCH_SETTLE_MS);
        Ok(devices)
    }

    /// Same traversal as [`search_rom`](OneWire::search_rom), retaining
    /// nothing but the number of devices found.
    pub fn count_devices(&mut self, delay: &mut impl DelayNs) -> Result<usize, Error<P::Error>> {
        let mut count = 0;
        let mut search = DeviceSearch::new();
        while self.search_next(&mut search, delay)?.is_some() {
            count += 1;
        }
        delay.delay_ms(SEARCH_SETTLE_MS);
        Ok(count)
    }
}
