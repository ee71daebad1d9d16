//! Reassembly of fragmented payloads across BEGIN/MIDDLE/END frames.

use crate::driver::FragmentHeader;
use crate::observability::{events, fields};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::warn;

const COMPONENT: &str = "fragment_assembler";

/// Rebuilds contiguous payloads from flagged fragments, keyed by session id
/// so interleaved sessions on a shared subscription reassemble independently.
///
/// Fragments of one session arrive in order (transport contract); an orphan
/// MIDDLE or END without a pending BEGIN is dropped with a warning, as is a
/// partial message abandoned by a fresh BEGIN.
pub(crate) struct FragmentAssembler {
    pending: HashMap<i32, BytesMut>,
}

impl FragmentAssembler {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Feeds one fragment; returns the completed payload when this fragment
    /// carried the END marker of an uninterrupted sequence.
    pub(crate) fn on_fragment(&mut self, header: FragmentHeader, data: &[u8]) -> Option<Bytes> {
        if header.is_begin() && header.is_end() {
            return Some(Bytes::copy_from_slice(data));
        }

        let session_id = header.session_id;
        if header.is_begin() {
            if let Some(abandoned) = self
                .pending
                .insert(session_id, BytesMut::from(data))
            {
                warn!(
                    event = events::SUB_ORPHAN_FRAGMENT,
                    component = COMPONENT,
                    session_id = fields::format_session_id(session_id).as_str(),
                    dropped_bytes = abandoned.len(),
                    "new message began before previous one completed"
                );
            }
            return None;
        }

        let Some(buffer) = self.pending.get_mut(&session_id) else {
            warn!(
                event = events::SUB_ORPHAN_FRAGMENT,
                component = COMPONENT,
                session_id = fields::format_session_id(session_id).as_str(),
                dropped_bytes = data.len(),
                "fragment without a pending message"
            );
            return None;
        };
        buffer.extend_from_slice(data);

        if header.is_end() {
            let assembled = self.pending.remove(&session_id)?;
            return Some(assembled.freeze());
        }
        None
    }

    /// Discards any partial message for a session whose image went away.
    pub(crate) fn abandon_session(&mut self, session_id: i32) {
        self.pending.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::FragmentAssembler;
    use crate::driver::{frame_flags, FragmentHeader};
    use bytes::Bytes;

    fn header(session_id: i32, flags: u8) -> FragmentHeader {
        FragmentHeader {
            session_id,
            stream_id: 1,
            flags,
        }
    }

    #[test]
    fn unfragmented_payload_passes_through() {
        let mut assembler = FragmentAssembler::new();

        let assembled = assembler.on_fragment(header(7, frame_flags::UNFRAGMENTED), b"Hello");

        assert_eq!(assembled, Some(Bytes::from_static(b"Hello")));
    }

    #[test]
    fn begin_middle_end_reassembles_in_order() {
        let mut assembler = FragmentAssembler::new();

        assert_eq!(assembler.on_fragment(header(7, frame_flags::BEGIN), b"ab"), None);
        assert_eq!(assembler.on_fragment(header(7, 0), b"cd"), None);
        let assembled = assembler.on_fragment(header(7, frame_flags::END), b"ef");

        assert_eq!(assembled, Some(Bytes::from_static(b"abcdef")));
    }

    #[test]
    fn sessions_reassemble_independently_while_interleaved() {
        let mut assembler = FragmentAssembler::new();

        assembler.on_fragment(header(1, frame_flags::BEGIN), b"1a");
        assembler.on_fragment(header(2, frame_flags::BEGIN), b"2a");
        let first = assembler.on_fragment(header(1, frame_flags::END), b"1b");
        let second = assembler.on_fragment(header(2, frame_flags::END), b"2b");

        assert_eq!(first, Some(Bytes::from_static(b"1a1b")));
        assert_eq!(second, Some(Bytes::from_static(b"2a2b")));
    }

    #[test]
    fn orphan_fragments_are_dropped() {
        let mut assembler = FragmentAssembler::new();

        assert_eq!(assembler.on_fragment(header(9, 0), b"mid"), None);
        assert_eq!(assembler.on_fragment(header(9, frame_flags::END), b"end"), None);
    }

    #[test]
    fn fresh_begin_abandons_partial_message() {
        let mut assembler = FragmentAssembler::new();

        assembler.on_fragment(header(3, frame_flags::BEGIN), b"stale");
        assembler.on_fragment(header(3, frame_flags::BEGIN), b"fresh");
        let assembled = assembler.on_fragment(header(3, frame_flags::END), b"-end");

        assert_eq!(assembled, Some(Bytes::from_static(b"fresh-end")));
    }

    #[test]
    fn abandon_session_discards_partial_state() {
        let mut assembler = FragmentAssembler::new();

        assembler.on_fragment(header(4, frame_flags::BEGIN), b"partial");
        assembler.abandon_session(4);

        assert_eq!(assembler.on_fragment(header(4, frame_flags::END), b"tail"), None);
    }
}
