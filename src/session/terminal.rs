//! Line discipline for a raw, non-canonical channel
//!
//! The client's terminal is in raw mode once it has a PTY, so every keystroke
//! arrives as-is and nothing is echoed locally. Bytes are first decoded into
//! keys from a small alphabet, then applied to a line editor:
//!
//! | key                         | buffer                 | echo            |
//! |-----------------------------|------------------------|-----------------|
//! | printable character         | append (up to the cap) | the character   |
//! | backspace (DEL, BS, ESC[3~) | drop last character    | `BS SP BS`      |
//! | cursor up/down/right/left   | unchanged              | nothing         |
//! | other control or escape     | unchanged              | nothing         |
//! | terminator (CR, LF, CR LF)  | emit trimmed, reset    | `CR LF`         |
//!
//! Backspace on an empty buffer does nothing and echoes nothing. The erase
//! echo is one column wide, so a double-width character leaves half a glyph
//! behind on the client's screen; the buffer itself is still correct.

use bytes::{Buf, BytesMut};
use std::time::Duration;
use tracing::trace;

use super::{ChannelIo, SessionError};

/// Characters kept per line; anything typed past this is dropped without echo
pub const MAX_LINE_CHARS: usize = 8192;

/// Longest escape sequence we wait for before discarding it
const MAX_ESCAPE_LEN: usize = 32;

const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;
const BS: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Backspace,
    CursorUp,
    CursorDown,
    CursorRight,
    CursorLeft,
    Enter,
    Ignored,
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Key(Key, usize),
    /// CR and LF are told apart so that CR LF completes a single line
    CarriageReturn,
    LineFeed,
    Incomplete,
    Invalid(usize),
}

fn scan(buf: &[u8]) -> Scan {
    let Some(&first) = buf.first() else {
        return Scan::Incomplete;
    };

    match first {
        b'\r' => Scan::CarriageReturn,
        b'\n' => Scan::LineFeed,
        DEL | BS => Scan::Key(Key::Backspace, 1),
        ESC => scan_escape(buf),
        b'\t' => Scan::Key(Key::Char('\t'), 1),
        0x00..=0x1f => Scan::Key(Key::Ignored, 1),
        0x20..=0x7e => Scan::Key(Key::Char(first as char), 1),
        _ => scan_utf8(buf),
    }
}

fn scan_escape(buf: &[u8]) -> Scan {
    match buf.get(1) {
        None => Scan::Incomplete,
        Some(b'[') => scan_csi(buf),
        // SS3 form, sent by terminals in application cursor mode
        Some(b'O') => match buf.get(2) {
            None => Scan::Incomplete,
            Some(b'A') => Scan::Key(Key::CursorUp, 3),
            Some(b'B') => Scan::Key(Key::CursorDown, 3),
            Some(b'C') => Scan::Key(Key::CursorRight, 3),
            Some(b'D') => Scan::Key(Key::CursorLeft, 3),
            Some(_) => Scan::Key(Key::Ignored, 3),
        },
        // Meta prefix: drop the ESC, the next byte is decoded on its own
        Some(_) => Scan::Key(Key::Ignored, 1),
    }
}

fn scan_csi(buf: &[u8]) -> Scan {
    for (i, &byte) in buf.iter().enumerate().skip(2) {
        if (0x40..=0x7e).contains(&byte) {
            let key = match (&buf[2..i], byte) {
                (b"", b'A') => Key::CursorUp,
                (b"", b'B') => Key::CursorDown,
                (b"", b'C') => Key::CursorRight,
                (b"", b'D') => Key::CursorLeft,
                (b"3", b'~') => Key::Backspace,
                _ => Key::Ignored,
            };
            return Scan::Key(key, i + 1);
        }
        if !(0x20..=0x3f).contains(&byte) || i >= MAX_ESCAPE_LEN {
            // Malformed or runaway sequence: discard what we have so far
            return Scan::Key(Key::Ignored, i);
        }
    }
    Scan::Incomplete
}

fn scan_utf8(buf: &[u8]) -> Scan {
    let window = &buf[..buf.len().min(4)];
    let valid = match std::str::from_utf8(window) {
        Ok(s) => s,
        Err(e) if e.valid_up_to() > 0 => match std::str::from_utf8(&window[..e.valid_up_to()]) {
            Ok(s) => s,
            Err(_) => return Scan::Invalid(1),
        },
        Err(e) => {
            return match e.error_len() {
                None => Scan::Incomplete,
                Some(len) => Scan::Invalid(len),
            }
        }
    };

    match valid.chars().next() {
        // C1 controls are as meaningless here as C0 ones
        Some(ch) if ch.is_control() => Scan::Key(Key::Ignored, ch.len_utf8()),
        Some(ch) => Scan::Key(Key::Char(ch), ch.len_utf8()),
        None => Scan::Incomplete,
    }
}

/// Turns raw bytes into keys, consuming them from the front of a buffer.
#[derive(Debug, Default)]
pub struct KeyDecoder {
    after_cr: bool,
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next key from `pending`.
    ///
    /// Returns `Ok(None)` when the buffer is empty or ends in the middle of a
    /// sequence; those bytes stay in place until more input arrives.
    pub fn next_key(&mut self, pending: &mut BytesMut) -> Result<Option<Key>, SessionError> {
        let (key, used) = match scan(pending) {
            Scan::Key(key, used) => (key, used),
            Scan::CarriageReturn => (Key::Enter, 1),
            Scan::LineFeed if self.after_cr => (Key::Ignored, 1),
            Scan::LineFeed => (Key::Enter, 1),
            Scan::Incomplete => return Ok(None),
            Scan::Invalid(len) => {
                return Err(SessionError::Decode(hex::encode(&pending[..len])));
            }
        };

        self.after_cr = pending.first() == Some(&b'\r');
        pending.advance(used);
        Ok(Some(key))
    }
}

/// The in-progress command buffer.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    chars: usize,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one key, appending whatever must be echoed to `echo`.
    /// Returns the finished line when the key is a terminator.
    pub fn apply(&mut self, key: Key, echo: &mut Vec<u8>) -> Option<String> {
        match key {
            Key::Char(ch) => {
                if self.chars < MAX_LINE_CHARS {
                    self.buffer.push(ch);
                    self.chars += 1;
                    let mut utf8 = [0u8; 4];
                    echo.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                }
                None
            }
            Key::Backspace => {
                if self.buffer.pop().is_some() {
                    self.chars -= 1;
                    echo.extend_from_slice(b"\x08 \x08");
                }
                None
            }
            Key::Enter => {
                echo.extend_from_slice(b"\r\n");
                self.chars = 0;
                let line = std::mem::take(&mut self.buffer);
                Some(line.trim().to_string())
            }
            Key::CursorUp | Key::CursorDown | Key::CursorRight | Key::CursorLeft | Key::Ignored => {
                None
            }
        }
    }
}

/// Assembles command lines from a channel, echoing as a terminal would.
#[derive(Debug)]
pub struct LineReader {
    decoder: KeyDecoder,
    editor: LineEditor,
    pending: BytesMut,
    read_timeout: Duration,
}

impl LineReader {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            decoder: KeyDecoder::new(),
            editor: LineEditor::new(),
            pending: BytesMut::with_capacity(1024),
            read_timeout,
        }
    }

    /// Read until a terminator completes a line.
    ///
    /// Input left over after the terminator is kept for the next call. A read
    /// that times out or finds the channel closed ends the line with an error.
    pub async fn read_line<C>(&mut self, channel: &mut C) -> Result<String, SessionError>
    where
        C: ChannelIo + ?Sized,
    {
        let mut echo = Vec::new();
        loop {
            while let Some(key) = self.decoder.next_key(&mut self.pending)? {
                if let Some(line) = self.editor.apply(key, &mut echo) {
                    channel.send(&echo).await?;
                    return Ok(line);
                }
            }

            if !echo.is_empty() {
                channel.send(&echo).await?;
                echo.clear();
            }

            let chunk = match tokio::time::timeout(self.read_timeout, channel.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err(SessionError::ChannelClosed),
                Err(_) => return Err(SessionError::ReadTimeout(self.read_timeout)),
            };
            trace!(received = ?String::from_utf8_lossy(&chunk), "Raw input");
            self.pending.extend_from_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedChannel;

    fn decode_all(input: &[u8]) -> Vec<Key> {
        let mut decoder = KeyDecoder::new();
        let mut pending = BytesMut::from(input);
        let mut keys = Vec::new();
        while let Some(key) = decoder.next_key(&mut pending).unwrap() {
            keys.push(key);
        }
        keys
    }

    fn edit(input: &[u8]) -> (Vec<String>, Vec<u8>, String) {
        let mut editor = LineEditor::new();
        let mut echo = Vec::new();
        let mut lines = Vec::new();
        for key in decode_all(input) {
            if let Some(line) = editor.apply(key, &mut echo) {
                lines.push(line);
            }
        }
        (lines, echo, editor.buffer.clone())
    }

    #[test]
    fn decodes_cursor_keys_in_both_forms() {
        assert_eq!(
            decode_all(b"\x1b[A\x1b[B\x1b[C\x1b[D\x1bOA\x1bOD"),
            vec![
                Key::CursorUp,
                Key::CursorDown,
                Key::CursorRight,
                Key::CursorLeft,
                Key::CursorUp,
                Key::CursorLeft,
            ]
        );
    }

    #[test]
    fn decodes_backspace_variants() {
        assert_eq!(
            decode_all(b"\x7f\x08\x1b[3~"),
            vec![Key::Backspace, Key::Backspace, Key::Backspace]
        );
    }

    #[test]
    fn crlf_is_a_single_terminator() {
        assert_eq!(decode_all(b"a\r\nb\n"), vec![
            Key::Char('a'),
            Key::Enter,
            Key::Ignored,
            Key::Char('b'),
            Key::Enter,
        ]);
    }

    #[test]
    fn unknown_escape_sequences_are_ignored() {
        // ctrl-right, F5, alt-x
        let keys = decode_all(b"\x1b[1;5C\x1b[15~\x1bx");
        assert_eq!(keys, vec![Key::Ignored, Key::Ignored, Key::Ignored, Key::Char('x')]);
    }

    #[test]
    fn incomplete_sequence_waits_for_more_input() {
        let mut decoder = KeyDecoder::new();
        let mut pending = BytesMut::from(&b"\x1b["[..]);
        assert_eq!(decoder.next_key(&mut pending).unwrap(), None);
        assert_eq!(pending.len(), 2);

        pending.extend_from_slice(b"A");
        assert_eq!(decoder.next_key(&mut pending).unwrap(), Some(Key::CursorUp));
        assert!(pending.is_empty());
    }

    #[test]
    fn runaway_escape_is_discarded() {
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b'1').take(64));
        input.push(b'A');
        let keys = decode_all(&input);
        assert_eq!(keys[0], Key::Ignored);
        assert!(keys[1..].iter().all(|k| matches!(k, Key::Char('1') | Key::Char('A'))));
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let bytes = "é".as_bytes();
        let mut decoder = KeyDecoder::new();
        let mut pending = BytesMut::from(&bytes[..1]);
        assert_eq!(decoder.next_key(&mut pending).unwrap(), None);
        pending.extend_from_slice(&bytes[1..]);
        assert_eq!(decoder.next_key(&mut pending).unwrap(), Some(Key::Char('é')));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let mut decoder = KeyDecoder::new();
        let mut pending = BytesMut::from(&b"\xff\xfe"[..]);
        match decoder.next_key(&mut pending) {
            Err(SessionError::Decode(bytes)) => assert_eq!(bytes, "ff"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn control_sequences_never_reach_the_line() {
        let (lines, echo, _) = edit(b"l\x1b[As\x1b[B \x1b[C-\x1b[Dla\x1bOB\r");
        assert_eq!(lines, vec!["ls -la".to_string()]);
        assert!(!echo.contains(&ESC));
        assert_eq!(echo, b"ls -la\r\n");
    }

    #[test]
    fn backspace_erases_last_character() {
        let (lines, echo, _) = edit(b"lsx\x7f\r");
        assert_eq!(lines, vec!["ls".to_string()]);
        assert_eq!(echo, b"lsx\x08 \x08\r\n");
    }

    #[test]
    fn backspace_removes_a_whole_wide_character() {
        let mut input = "ls日".as_bytes().to_vec();
        input.push(0x7f);
        let (_, echo, pending) = edit(&input);
        assert_eq!(pending, "ls");
        assert!(echo.ends_with(b"\x08 \x08"));
        assert_eq!(echo.iter().filter(|&&b| b == 0x08).count(), 2);
    }

    #[test]
    fn backspace_on_empty_line_is_silent() {
        let (lines, echo, _) = edit(b"\x7f\x7fpwd\r");
        assert_eq!(lines, vec!["pwd".to_string()]);
        assert_eq!(echo, b"pwd\r\n");
    }

    #[test]
    fn lines_are_trimmed() {
        let (lines, _, _) = edit(b"   uname -a  \t\r");
        assert_eq!(lines, vec!["uname -a".to_string()]);
    }

    #[test]
    fn no_line_without_terminator() {
        let (lines, echo, buffered) = edit(b"wget http://203.0.113.9/x");
        assert!(lines.is_empty());
        assert_eq!(buffered, "wget http://203.0.113.9/x");
        assert_eq!(echo, b"wget http://203.0.113.9/x");
    }

    #[test]
    fn overlong_lines_are_capped() {
        let mut input = vec![b'a'; MAX_LINE_CHARS + 100];
        input.push(b'\r');
        let (lines, echo, _) = edit(&input);
        assert_eq!(lines[0].len(), MAX_LINE_CHARS);
        assert_eq!(echo.len(), MAX_LINE_CHARS + 2);
    }

    #[tokio::test]
    async fn reader_keeps_input_after_terminator() {
        let mut channel = ScriptedChannel::new(vec![b"ls\rpw".to_vec(), b"d\r".to_vec()]);
        let mut reader = LineReader::new(Duration::from_secs(10));

        assert_eq!(reader.read_line(&mut channel).await.unwrap(), "ls");
        assert_eq!(reader.read_line(&mut channel).await.unwrap(), "pwd");
        assert_eq!(channel.output(), b"ls\r\npwd\r\n");
    }

    #[tokio::test]
    async fn reader_reports_closed_channel() {
        let mut channel = ScriptedChannel::new(vec![b"ls".to_vec()]);
        let mut reader = LineReader::new(Duration::from_secs(10));

        match reader.read_line(&mut channel).await {
            Err(SessionError::ChannelClosed) => {}
            other => panic!("expected closed channel, got {:?}", other),
        }
        // The partial line was echoed but never completed
        assert_eq!(channel.output(), b"ls");
    }

    #[tokio::test(start_paused = true)]
    async fn reader_times_out_on_silent_peer() {
        let mut channel = ScriptedChannel::new(vec![b"who".to_vec()]).hang_when_drained();
        let mut reader = LineReader::new(Duration::from_secs(10));

        match reader.read_line(&mut channel).await {
            Err(SessionError::ReadTimeout(limit)) => assert_eq!(limit, Duration::from_secs(10)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reader_accepts_empty_chunks() {
        let mut channel = ScriptedChannel::new(vec![Vec::new(), b"id\r".to_vec()]);
        let mut reader = LineReader::new(Duration::from_secs(10));
        assert_eq!(reader.read_line(&mut channel).await.unwrap(), "id");
    }
}
