//! Line reassembly.
//!
//! Feeds deliver newline-delimited text over TCP, and reads return arbitrary slices of that stream. The reassembler
//! buffers bytes across reads and yields a candidate line only once it holds exactly [`FIELD_COUNT`] fields.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Number of comma-separated fields in a complete BaseStation message.
pub const FIELD_COUNT: usize = 22;

/// Default upper bound, in bytes, on a carried fragment.
///
/// Real BaseStation lines are well under 200 bytes, so anything approaching this is corrupt input.
pub const DEFAULT_MAX_FRAGMENT_LEN: usize = 1024;

const LINE_DELIMITER: u8 = b'\n';
const FIELD_DELIMITER: u8 = b',';

/// A complete candidate protocol line.
///
/// The line never contains the line delimiter, and always splits into exactly [`FIELD_COUNT`] fields. Whether those
/// fields hold legal values is for the parser to decide.
#[derive(Clone, Eq, PartialEq)]
pub struct RawLine(Bytes);

impl RawLine {
    /// Returns the raw bytes of the line.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for RawLine {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RawLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RawLine").field(&String::from_utf8_lossy(&self.0)).finish()
    }
}

/// A unit of output from the reassembler.
#[derive(Debug, Eq, PartialEq)]
pub enum Frame {
    /// A complete candidate line.
    Line(RawLine),

    /// A fragment dropped because it grew past the configured ceiling.
    ///
    /// Each dropped fragment is reported once, when its terminating newline arrives.
    Discarded {
        /// Number of bytes dropped, excluding the newline.
        len: usize,
    },
}

/// Reassembles newline-delimited BaseStation lines from arbitrarily chunked input.
///
/// A newline-terminated line that does not hold exactly [`FIELD_COUNT`] fields is not dropped. It is carried, without
/// its newline, and prefixed onto the bytes that follow, on the assumption that it is a truncated message whose
/// remainder is still in flight. Carried bytes are bounded by `max_fragment_len`: once a fragment (carried bytes plus
/// the line being accumulated) exceeds the ceiling, it is discarded along with everything up to and including the next
/// newline, and the whole discard is reported as a single [`Frame::Discarded`].
///
/// The lines produced depend only on the concatenated input, never on how it was split into chunks.
#[derive(Debug)]
pub struct LineReassembler {
    unscanned: BytesMut,
    carried: BytesMut,
    skipping: bool,
    skipped: usize,
    max_fragment_len: usize,
}

impl LineReassembler {
    /// Creates a new `LineReassembler` with the given fragment ceiling, in bytes.
    pub fn new(max_fragment_len: usize) -> Self {
        Self {
            unscanned: BytesMut::new(),
            carried: BytesMut::new(),
            skipping: false,
            skipped: 0,
            max_fragment_len,
        }
    }

    /// Returns the number of bytes held that have not yet been emitted as a line.
    pub fn pending_len(&self) -> usize {
        self.carried.len() + self.unscanned.len()
    }

    /// Appends a chunk of bytes read from the feed.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.unscanned.extend_from_slice(chunk);
    }

    /// Drops all buffered bytes, returning how many were dropped.
    ///
    /// Bytes of an oversized fragment that was already being skipped count as dropped here, since that fragment will
    /// never see its newline. Used when the underlying connection is recycled, so bytes from two different connections
    /// are never spliced into one line.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending_len() + self.skipped;
        self.unscanned.clear();
        self.carried.clear();
        self.skipping = false;
        self.skipped = 0;
        dropped
    }

    /// Returns an iterator over all frames that can be produced from the bytes buffered so far.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { inner: self }
    }

    /// Extracts the next frame, if one can be produced from the bytes buffered so far.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(idx) = memchr::memchr(LINE_DELIMITER, &self.unscanned) else {
                self.check_unterminated();
                return None;
            };

            let mut line = self.unscanned.split_to(idx + 1);
            line.truncate(idx);

            if self.skipping {
                // End of a fragment that was already dropped.
                let len = self.skipped + line.len();
                self.skipping = false;
                self.skipped = 0;
                return Some(Frame::Discarded { len });
            }

            let candidate = if self.carried.is_empty() {
                line
            } else {
                self.carried.extend_from_slice(&line);
                self.carried.split()
            };

            if candidate.len() > self.max_fragment_len {
                return Some(Frame::Discarded { len: candidate.len() });
            }

            let fields = field_count(&candidate);
            if fields == FIELD_COUNT {
                return Some(Frame::Line(RawLine(candidate.freeze())));
            }

            trace!(fields, len = candidate.len(), "Carrying incomplete line.");
            self.carried = candidate;
        }
    }

    fn check_unterminated(&mut self) {
        if self.skipping {
            self.skipped += self.unscanned.len();
            self.unscanned.clear();
            return;
        }

        let pending = self.pending_len();
        if pending > self.max_fragment_len {
            trace!(len = pending, "Skipping oversized fragment until the next newline.");
            self.unscanned.clear();
            self.carried.clear();
            self.skipping = true;
            self.skipped = pending;
        }
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENT_LEN)
    }
}

/// Iterator over the frames available in a [`LineReassembler`].
pub struct Frames<'a> {
    inner: &'a mut LineReassembler,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_frame()
    }
}

fn field_count(line: &[u8]) -> usize {
    memchr::memchr_iter(FIELD_DELIMITER, line).count() + 1
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const POSITION_LINE: &str =
        "MSG,3,1,1,4840D6,1,2023/01/01,12:00:00.000,2023/01/01,12:00:00.000,,38000,,,51.47123,-0.45123,,,,,,0";
    const VELOCITY_LINE: &str =
        "MSG,4,1,1,A1B2C3,1,2023/01/01,12:00:01.000,2023/01/01,12:00:01.000,,,450,270,,,-64,,,,,0";

    fn lines_of(reassembler: &mut LineReassembler) -> Vec<String> {
        reassembler
            .frames()
            .filter_map(|frame| match frame {
                Frame::Line(line) => Some(String::from_utf8_lossy(line.as_bytes()).into_owned()),
                Frame::Discarded { .. } => None,
            })
            .collect()
    }

    #[test]
    fn single_complete_line() {
        let mut reassembler = LineReassembler::default();
        reassembler.extend(format!("{}\n", POSITION_LINE).as_bytes());

        assert_eq!(lines_of(&mut reassembler), vec![POSITION_LINE.to_string()]);
        assert_eq!(reassembler.pending_len(), 0);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut reassembler = LineReassembler::default();
        reassembler.extend(format!("{}\n{}\n", POSITION_LINE, VELOCITY_LINE).as_bytes());

        assert_eq!(
            lines_of(&mut reassembler),
            vec![POSITION_LINE.to_string(), VELOCITY_LINE.to_string()]
        );
    }

    #[test]
    fn line_split_mid_field() {
        let mut reassembler = LineReassembler::default();
        let (head, tail) = VELOCITY_LINE.split_at("MSG,4,1,1,A1".len());

        reassembler.extend(head.as_bytes());
        assert!(lines_of(&mut reassembler).is_empty());
        assert_eq!(reassembler.pending_len(), head.len());

        reassembler.extend(format!("{}\n", tail).as_bytes());
        assert_eq!(lines_of(&mut reassembler), vec![VELOCITY_LINE.to_string()]);
    }

    #[test]
    fn short_line_is_carried_onto_next_bytes() {
        let mut reassembler = LineReassembler::default();
        let (head, tail) = VELOCITY_LINE.split_at("MSG,4,1,1,A1".len());

        // A stray newline splits the message: the first half is carried rather than dropped, and completed by the rest.
        reassembler.extend(format!("{}\n", head).as_bytes());
        assert!(lines_of(&mut reassembler).is_empty());
        assert_eq!(reassembler.pending_len(), head.len());

        reassembler.extend(format!("{}\n", tail).as_bytes());
        assert_eq!(lines_of(&mut reassembler), vec![VELOCITY_LINE.to_string()]);
    }

    #[test]
    fn wrong_field_count_never_emitted_directly() {
        let mut reassembler = LineReassembler::default();
        reassembler.extend(b"MSG,8,1,1\n");
        assert!(lines_of(&mut reassembler).is_empty());

        let too_long = format!("{},extra\n", POSITION_LINE);
        let mut reassembler = LineReassembler::default();
        reassembler.extend(too_long.as_bytes());
        assert!(lines_of(&mut reassembler).is_empty());
        assert_eq!(reassembler.pending_len(), too_long.len() - 1);
    }

    #[test]
    fn oversized_fragment_is_discarded_and_stream_recovers() {
        let mut reassembler = LineReassembler::new(100);
        let garbage = "x,".repeat(60);
        reassembler.extend(format!("{}\n{}\n", garbage, VELOCITY_LINE).as_bytes());

        let frames = reassembler.frames().collect::<Vec<_>>();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Discarded { len: garbage.len() });
        assert!(matches!(&frames[1], Frame::Line(line) if line.as_bytes() == VELOCITY_LINE.as_bytes()));
    }

    #[test]
    fn carried_fragments_grow_until_ceiling() {
        let mut reassembler = LineReassembler::new(200);

        // Each short line is carried and concatenated onto the next, so three of them exceed the ceiling.
        let short = "MSG,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30";
        for _ in 0..2 {
            reassembler.extend(format!("{}\n", short).as_bytes());
            assert_eq!(reassembler.next_frame(), None);
        }

        reassembler.extend(format!("{}\n", short).as_bytes());
        assert_eq!(reassembler.next_frame(), Some(Frame::Discarded { len: short.len() * 3 }));
        assert_eq!(reassembler.pending_len(), 0);

        reassembler.extend(format!("{}\n", POSITION_LINE).as_bytes());
        assert_eq!(lines_of(&mut reassembler), vec![POSITION_LINE.to_string()]);
    }

    #[test]
    fn unterminated_fragment_past_ceiling_is_reported_once() {
        let mut reassembler = LineReassembler::new(32);
        reassembler.extend(&[b'z'; 40]);
        assert_eq!(reassembler.next_frame(), None);
        assert_eq!(reassembler.pending_len(), 0);

        reassembler.extend(&[b'z'; 10]);
        assert_eq!(reassembler.next_frame(), None);

        reassembler.extend(b"zzzz\n");
        assert_eq!(reassembler.next_frame(), Some(Frame::Discarded { len: 54 }));
        assert_eq!(reassembler.next_frame(), None);

        reassembler.extend(format!("{}\n", ",".repeat(FIELD_COUNT - 1)).as_bytes());
        assert_eq!(lines_of(&mut reassembler).len(), 1);
    }

    #[test]
    fn oversized_fragment_ending_exactly_at_newline() {
        let mut reassembler = LineReassembler::new(32);
        reassembler.extend(&[b'z'; 40]);
        assert_eq!(reassembler.next_frame(), None);

        reassembler.extend(format!("\n{}\n", POSITION_LINE).as_bytes());
        let frames = reassembler.frames().collect::<Vec<_>>();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Discarded { len: 40 });
        assert!(matches!(&frames[1], Frame::Line(line) if line.as_bytes() == POSITION_LINE.as_bytes()));
    }

    #[test]
    fn reset_while_skipping_counts_skipped_bytes() {
        let mut reassembler = LineReassembler::new(32);
        reassembler.extend(&[b'z'; 40]);
        assert_eq!(reassembler.next_frame(), None);
        reassembler.extend(&[b'z'; 6]);
        assert_eq!(reassembler.next_frame(), None);

        assert_eq!(reassembler.reset(), 46);
        assert_eq!(reassembler.reset(), 0);

        reassembler.extend(format!("{}\n", POSITION_LINE).as_bytes());
        assert_eq!(lines_of(&mut reassembler), vec![POSITION_LINE.to_string()]);
    }

    #[test]
    fn reset_drops_pending_bytes() {
        let mut reassembler = LineReassembler::default();
        reassembler.extend(b"MSG,3,1\nMSG,3");
        assert_eq!(reassembler.next_frame(), None);

        assert_eq!(reassembler.reset(), "MSG,3,1".len() + "MSG,3".len());
        assert_eq!(reassembler.pending_len(), 0);

        reassembler.extend(format!("{}\n", POSITION_LINE).as_bytes());
        assert_eq!(lines_of(&mut reassembler), vec![POSITION_LINE.to_string()]);
    }

    fn arb_line() -> impl Strategy<Value = String> {
        prop_oneof![
            // Well-formed lines.
            3 => proptest::collection::vec("[A-Z0-9:./ -]{0,6}", FIELD_COUNT).prop_map(|fields| fields.join(",")),
            // Short or long lines that will be carried.
            1 => proptest::collection::vec("[A-Z0-9]{0,4}", 1..30).prop_map(|fields| fields.join(",")),
        ]
    }

    proptest! {
        #[test]
        fn property_test_chunking_invariance(
            lines in proptest::collection::vec(arb_line(), 0..24),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..16),
        ) {
            let stream = lines.iter().map(|line| format!("{}\n", line)).collect::<String>();
            let stream = stream.as_bytes();

            let mut whole = LineReassembler::default();
            whole.extend(stream);
            let expected = lines_of(&mut whole);

            let mut offsets = cuts.iter().map(|idx| idx.index(stream.len() + 1)).collect::<Vec<_>>();
            offsets.push(0);
            offsets.push(stream.len());
            offsets.sort_unstable();
            offsets.dedup();

            let mut chunked = LineReassembler::default();
            let mut actual = Vec::new();
            for window in offsets.windows(2) {
                chunked.extend(&stream[window[0]..window[1]]);
                actual.extend(lines_of(&mut chunked));
            }

            prop_assert_eq!(expected, actual);
        }
    }
}
