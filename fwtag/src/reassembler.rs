//! Chunk reassembly.
//!
//! The parser receives the image in arbitrarily sized chunks. Fixed-size
//! units (tag headers, descriptors, key material) are read with [`pull`],
//! which either serves the whole unit or stashes the partial remainder in a
//! small carry buffer until the next chunk arrives. Variable-length payload
//! runs are drained with [`take`], which never stalls.
//!
//! Both entry points run an `intake` hook over every byte exactly once, at
//! the moment it leaves the caller's chunk. The parser uses the hook to
//! keep its running CRC, digest and cipher in wire order even when a unit
//! is reassembled across chunks.
//!
//! [`pull`]: Reassembler::pull
//! [`take`]: Reassembler::take

use crate::error::Error;

/// Outcome of one handler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// The unit was consumed and the state machine may advance.
    Parsed,
    /// Not enough bytes in this chunk; the remainder was stashed and the
    /// parser must return to the caller for more input.
    Starved,
}

/// Carry buffer sized for the largest indivisible unit the parser reads
/// (a 64-byte key or signature half).
pub(crate) const CARRY_CAPACITY: usize = 64;

pub(crate) struct Reassembler {
    carry: heapless::Vec<u8, CARRY_CAPACITY>,
}

impl Reassembler {
    pub const fn new() -> Self {
        Reassembler {
            carry: heapless::Vec::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// All-or-nothing read of `out.len()` bytes. On starvation the whole
    /// remaining chunk is moved into the carry buffer and `input` is left
    /// empty.
    pub fn pull(
        &mut self,
        input: &mut &[u8],
        out: &mut [u8],
        mut intake: impl FnMut(&mut [u8]),
    ) -> Result<Control, Error> {
        let available = self.carry.len() + input.len();
        if available < out.len() {
            // A unit that cannot be reassembled across chunks is a hard
            // limit of this parser, not a transient condition.
            if out.len() > CARRY_CAPACITY {
                return Err(Error::BufferOverflow);
            }
            let stashed = self.carry.len();
            self.carry
                .extend_from_slice(input)
                .map_err(|_| Error::BufferOverflow)?;
            intake(&mut self.carry[stashed..]);
            *input = &[];
            return Ok(Control::Starved);
        }

        let from_carry = self.carry.len().min(out.len());
        out[..from_carry].copy_from_slice(&self.carry[..from_carry]);
        let carry_rest = self.carry.len() - from_carry;
        self.carry.copy_within(from_carry.., 0);
        self.carry.truncate(carry_rest);

        let from_input = out.len() - from_carry;
        out[from_carry..].copy_from_slice(&input[..from_input]);
        intake(&mut out[from_carry..]);
        *input = &input[from_input..];
        Ok(Control::Parsed)
    }

    /// Drains up to `max` bytes into `scratch`, carry buffer first. Returns
    /// the number of bytes written, which is zero only when both the carry
    /// buffer and the chunk are exhausted.
    pub fn take(
        &mut self,
        input: &mut &[u8],
        scratch: &mut [u8],
        max: usize,
        mut intake: impl FnMut(&mut [u8]),
    ) -> usize {
        let want = max.min(scratch.len());
        let from_carry = self.carry.len().min(want);
        scratch[..from_carry].copy_from_slice(&self.carry[..from_carry]);
        let carry_rest = self.carry.len() - from_carry;
        self.carry.copy_within(from_carry.., 0);
        self.carry.truncate(carry_rest);

        let from_input = (want - from_carry).min(input.len());
        scratch[from_carry..from_carry + from_input].copy_from_slice(&input[..from_input]);
        intake(&mut scratch[from_carry..from_carry + from_input]);
        *input = &input[from_input..];
        from_carry + from_input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_serves_from_a_single_chunk() {
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[1, 2, 3, 4, 5];
        let mut out = [0u8; 4];
        assert_eq!(r.pull(&mut input, &mut out, |_| {}), Ok(Control::Parsed));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(input, &[5]);
    }

    #[test]
    fn pull_reassembles_across_chunks() {
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[1, 2];
        let mut out = [0u8; 4];
        assert_eq!(r.pull(&mut input, &mut out, |_| {}), Ok(Control::Starved));
        assert!(input.is_empty());
        assert_eq!(r.buffered(), 2);

        let mut input: &[u8] = &[3, 4, 5];
        assert_eq!(r.pull(&mut input, &mut out, |_| {}), Ok(Control::Parsed));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(input, &[5]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn pull_rejects_units_larger_than_the_carry_buffer() {
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[0; 10];
        let mut out = [0u8; CARRY_CAPACITY + 1];
        assert_eq!(
            r.pull(&mut input, &mut out, |_| {}),
            Err(Error::BufferOverflow)
        );
    }

    #[test]
    fn oversized_pull_is_served_when_fully_available() {
        let mut r = Reassembler::new();
        let data: [u8; 100] = core::array::from_fn(|i| i as u8);
        let mut input: &[u8] = &data;
        let mut out = [0u8; 100];
        assert_eq!(r.pull(&mut input, &mut out, |_| {}), Ok(Control::Parsed));
        assert_eq!(out, data);
    }

    #[test]
    fn intake_sees_every_byte_once_in_wire_order() {
        let mut seen = Vec::new();
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[1, 2];
        let mut out = [0u8; 4];
        let intake = |seen: &mut Vec<u8>, bytes: &mut [u8]| seen.extend_from_slice(bytes);
        r.pull(&mut input, &mut out, |b| intake(&mut seen, b)).unwrap();
        let mut input: &[u8] = &[3, 4, 5, 6];
        r.pull(&mut input, &mut out, |b| intake(&mut seen, b)).unwrap();
        let mut scratch = [0u8; 4];
        let n = r.take(&mut input, &mut scratch, 4, |b| intake(&mut seen, b));
        assert_eq!(n, 2);
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn intake_may_transform_bytes_in_place() {
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[1, 2];
        let mut out = [0u8; 4];
        let invert = |bytes: &mut [u8]| bytes.iter_mut().for_each(|b| *b = !*b);
        r.pull(&mut input, &mut out, invert).unwrap();
        let mut input: &[u8] = &[3, 4];
        r.pull(&mut input, &mut out, invert).unwrap();
        assert_eq!(out, [!1, !2, !3, !4]);
    }

    #[test]
    fn take_drains_carry_before_input() {
        let mut r = Reassembler::new();
        let mut input: &[u8] = &[1, 2, 3];
        let mut out = [0u8; 8];
        assert_eq!(r.pull(&mut input, &mut out, |_| {}), Ok(Control::Starved));

        let mut input: &[u8] = &[4, 5, 6, 7];
        let mut scratch = [0u8; 16];
        let n = r.take(&mut input, &mut scratch, 5, |_| {});
        assert_eq!(&scratch[..n], &[1, 2, 3, 4, 5]);
        assert_eq!(input, &[6, 7]);
    }
}
