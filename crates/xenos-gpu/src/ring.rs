//! Dword reader over guest command buffers, with ring wraparound.

use crate::guest_memory::GuestMemory;

pub struct RingReader<'a> {
    mem: &'a GuestMemory,
    base: u32,
    size_dwords: u32,
    read_index: u32,
    remaining: u32,
}

impl<'a> RingReader<'a> {
    /// Reader over a circular ring of `size_dwords`, starting at `read_index`
    /// with `remaining` dwords available before the write pointer.
    pub fn ring(
        mem: &'a GuestMemory,
        base: u32,
        size_dwords: u32,
        read_index: u32,
        remaining: u32,
    ) -> RingReader<'a> {
        RingReader {
            mem,
            base,
            size_dwords,
            read_index: read_index % size_dwords.max(1),
            remaining,
        }
    }

    /// Reader over a linear span (indirect buffers, trace playback).
    pub fn linear(mem: &'a GuestMemory, base: u32, count_dwords: u32) -> RingReader<'a> {
        RingReader {
            mem,
            base,
            size_dwords: count_dwords,
            read_index: 0,
            remaining: count_dwords,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Current guest address of the read pointer.
    pub fn address(&self) -> u32 {
        self.base + self.read_index * 4
    }

    /// Reads one dword; reads past the available span yield zero so that
    /// malformed packet counts cannot run off the buffer.
    pub fn read(&mut self) -> u32 {
        if self.remaining == 0 {
            return 0;
        }
        let value = self.mem.read_u32(self.address());
        self.advance(1);
        value
    }

    pub fn peek(&self) -> u32 {
        self.mem.read_u32(self.address())
    }

    pub fn advance(&mut self, dwords: u32) {
        let dwords = dwords.min(self.remaining);
        self.remaining -= dwords;
        self.read_index = (self.read_index + dwords) % self.size_dwords.max(1);
    }

    /// Reads `count` dwords into a vector (packet payload capture).
    pub fn read_many(&mut self, count: u32) -> Vec<u32> {
        let count = count.min(self.remaining);
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.read());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_reader_wraps_at_the_buffer_end() {
        let mem = GuestMemory::new();
        for i in 0..8u32 {
            mem.write_u32(0x100 + i * 4, 0xA0 + i);
        }
        // 8-dword ring starting 2 dwords before the end.
        let mut ring = RingReader::ring(&mem, 0x100, 8, 6, 4);
        assert_eq!(ring.read(), 0xA6);
        assert_eq!(ring.read(), 0xA7);
        assert_eq!(ring.read(), 0xA0);
        assert_eq!(ring.read(), 0xA1);
        assert_eq!(ring.remaining(), 0);
    }

    #[test]
    fn linear_reader_reads_in_order() {
        let mem = GuestMemory::new();
        mem.write_u32(0x40, 7);
        mem.write_u32(0x44, 9);
        let mut reader = RingReader::linear(&mem, 0x40, 2);
        assert_eq!(reader.read_many(2), vec![7, 9]);
    }
}
