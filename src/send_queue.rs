// This file is part of qnet-arbiter.

//! Per-connection outbound frame queue (component C4).

use crate::codec::{self, Message};
use std::collections::VecDeque;
use std::io::{self, Write};

/// Returned by `SendQueue::push` when either cap would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

struct Entry {
    bytes: Vec<u8>,
    cursor: usize,
}

/// Bounded, ordered queue of outbound frames for one client connection.
///
/// The loop's `set_events` should inject `WRITE` interest whenever `!is_empty()`; flushing
/// happens head-first until `Entry::cursor` reaches the end, then the entry is popped.
pub struct SendQueue {
    entries: VecDeque<Entry>,
    total_bytes: usize,
    max_buffers: usize,
    max_bytes: usize,
}

impl SendQueue {
    pub fn new(max_buffers: usize, max_bytes: usize) -> SendQueue {
        SendQueue {
            entries: VecDeque::new(),
            total_bytes: 0,
            max_buffers,
            max_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_message(&mut self, message: &Message) -> Result<(), Full> {
        self.push_bytes(message.encode())
    }

    pub fn push_bytes(&mut self, bytes: Vec<u8>) -> Result<(), Full> {
        if self.entries.len() + 1 > self.max_buffers || self.total_bytes + bytes.len() > self.max_bytes {
            return Err(Full);
        }
        self.total_bytes += bytes.len();
        self.entries.push_back(Entry { bytes, cursor: 0 });
        Ok(())
    }

    /// Drain as much of the head entry as the writer accepts without blocking. Keeps draining
    /// subsequent entries within the same call as long as each completes fully, matching the
    /// readiness loop's "flush the head entry until COMPLETE, then remove it" rule applied
    /// repeatedly for one writable event.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        while let Some(entry) = self.entries.front_mut() {
            let done = codec::write_partial(writer, &entry.bytes, &mut entry.cursor)?;
            if !done {
                return Ok(());
            }
            let entry = self.entries.pop_front().expect("front_mut just matched Some");
            self.total_bytes -= entry.bytes.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageType;
    use std::io::Cursor;

    #[test]
    fn push_respects_buffer_cap() {
        let mut queue = SendQueue::new(1, 4096);
        queue.push_bytes(vec![1]).unwrap();
        assert_eq!(queue.push_bytes(vec![2]), Err(Full));
    }

    #[test]
    fn push_respects_byte_cap() {
        let mut queue = SendQueue::new(8, 4);
        assert_eq!(queue.push_bytes(vec![0; 8]), Err(Full));
    }

    #[test]
    fn flush_drains_in_order() {
        let mut queue = SendQueue::new(8, 4096);
        let msg1 = Message::new(MessageType::EchoReply);
        let msg2 = Message::new(MessageType::PreinitReply);
        queue.push_message(&msg1).unwrap();
        queue.push_message(&msg2).unwrap();

        let mut out = Cursor::new(Vec::new());
        queue.flush(&mut out).unwrap();
        assert!(queue.is_empty());

        let written = out.into_inner();
        let expected_len = msg1.encode().len() + msg2.encode().len();
        assert_eq!(written.len(), expected_len);
    }
}
