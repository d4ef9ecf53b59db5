//! Byte-level tokenizer
//!
//! Classifies the bytes of a [`ByteBuffer`] into lexical tokens. Text and
//! number runs are maximal and may cross segment boundaries; such tokens
//! own a copy of their bytes, all others borrow from the segment.
//!
//! The tokenizer never fails. Anything it does not recognise becomes a
//! single byte `Other` token and is left for the grammar to reject.

use super::buffer::ByteBuffer;
use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Token classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// End of input
    None,
    /// A run of ASCII letters or bytes >= 0x80
    Text,
    /// A run of ASCII digits
    Number,
    /// A single whitespace byte
    Space,
    /// The two byte CRLF sequence
    NewLine,
    /// Any other single byte
    Other,
}

/// A classified view over part of the input
#[derive(Debug, Clone)]
pub struct Token<'a> {
    kind: TokenKind,
    bytes: Cow<'a, [u8]>,
}

impl<'a> Token<'a> {
    /// The end-of-input marker
    pub const NONE: Token<'static> = Token {
        kind: TokenKind::None,
        bytes: Cow::Borrowed(&[]),
    };

    pub fn new(kind: TokenKind, bytes: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Token text, lossily decoded
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn is_none(&self) -> bool {
        self.kind == TokenKind::None
    }

    /// Whether this is a text token equal to `text`, ignoring ASCII case
    pub fn is_text(&self, text: &str) -> bool {
        self.kind == TokenKind::Text && self.bytes.eq_ignore_ascii_case(text.as_bytes())
    }

    /// Whether this is the single byte `Other` token `ch`
    pub fn is_char(&self, ch: u8) -> bool {
        self.kind == TokenKind::Other && self.bytes.as_ref() == [ch]
    }

    /// First byte of the token, if any
    pub fn first_byte(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    pub fn into_owned(self) -> Token<'static> {
        Token {
            kind: self.kind,
            bytes: Cow::Owned(self.bytes.into_owned()),
        }
    }
}

impl PartialEq for Token<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.bytes.eq_ignore_ascii_case(&other.bytes)
    }
}

impl Eq for Token<'_> {}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::None => write!(f, "[END]"),
            TokenKind::NewLine => write!(f, "[CRLF]"),
            _ => write!(f, "{}", self.text()),
        }
    }
}

pub fn is_text(b: u8) -> bool {
    b.is_ascii_alphabetic() || b >= 0x80
}

pub fn is_number(b: u8) -> bool {
    b.is_ascii_digit()
}

pub fn is_white_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | LF | 0x0b | 0x0c | CR)
}

/// Lazy token stream over a byte buffer.
///
/// Yields exactly one `None` token at the end of input, then stops.
pub struct Tokenizer<'a> {
    segments: &'a [Bytes],
    segment: usize,
    offset: usize,
    finished: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(buffer: &'a ByteBuffer) -> Self {
        let mut tokenizer = Self {
            segments: buffer.segments(),
            segment: 0,
            offset: 0,
            finished: false,
        };
        tokenizer.skip_exhausted();
        tokenizer
    }

    fn skip_exhausted(&mut self) {
        while self.segment < self.segments.len() && self.offset >= self.segments[self.segment].len()
        {
            self.segment += 1;
            self.offset = 0;
        }
    }

    fn peek_at(&self, mut lookahead: usize) -> Option<u8> {
        let mut segment = self.segment;
        let mut offset = self.offset;
        while segment < self.segments.len() {
            let remaining = self.segments[segment].len() - offset;
            if lookahead < remaining {
                return Some(self.segments[segment][offset + lookahead]);
            }
            lookahead -= remaining;
            segment += 1;
            offset = 0;
        }
        None
    }

    fn advance(&mut self) {
        self.offset += 1;
        self.skip_exhausted();
    }

    /// Slice `len` bytes starting at a cursor position, borrowing when they
    /// sit inside a single segment.
    fn slice(&self, segment: usize, offset: usize, len: usize) -> Cow<'a, [u8]> {
        let segments: &'a [Bytes] = self.segments;
        let first: &'a [u8] = &segments[segment][..];
        if offset + len <= first.len() {
            return Cow::Borrowed(&first[offset..offset + len]);
        }

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&first[offset..]);
        for next in &segments[segment + 1..] {
            let wanted = len - out.len();
            if wanted == 0 {
                break;
            }
            out.extend_from_slice(&next[..wanted.min(next.len())]);
        }
        Cow::Owned(out)
    }

    fn take_run(&mut self, class: fn(u8) -> bool) -> Cow<'a, [u8]> {
        let (segment, offset) = (self.segment, self.offset);
        let mut len = 0;
        while let Some(b) = self.peek_at(0) {
            if !class(b) {
                break;
            }
            len += 1;
            self.advance();
        }
        self.slice(segment, offset, len)
    }

    fn take_bytes(&mut self, len: usize) -> Cow<'a, [u8]> {
        let (segment, offset) = (self.segment, self.offset);
        for _ in 0..len {
            self.advance();
        }
        self.slice(segment, offset, len)
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let Some(b) = self.peek_at(0) else {
            self.finished = true;
            return Some(Token::NONE);
        };

        let token = if is_text(b) {
            Token::new(TokenKind::Text, self.take_run(is_text))
        } else if is_number(b) {
            Token::new(TokenKind::Number, self.take_run(is_number))
        } else if b == CR && self.peek_at(1) == Some(LF) {
            Token::new(TokenKind::NewLine, self.take_bytes(2))
        } else if is_white_space(b) {
            // A CR without its LF lands here too.
            Token::new(TokenKind::Space, self.take_bytes(1))
        } else {
            Token::new(TokenKind::Other, self.take_bytes(1))
        };

        Some(token)
    }
}

/// Tokenize a whole buffer, including the trailing `None` token.
pub fn tokenize(buffer: &ByteBuffer) -> Vec<Token<'_>> {
    Tokenizer::new(buffer).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token<'_>]) -> Vec<TokenKind> {
        tokens.iter().map(Token::kind).collect()
    }

    fn owned(tokens: Vec<Token<'_>>) -> Vec<Token<'static>> {
        tokens.into_iter().map(Token::into_owned).collect()
    }

    #[test]
    fn test_text_then_number() {
        let buffer = ByteBuffer::from(&b"abc123"[..]);
        let tokens = tokenize(&buffer);
        assert_eq!(
            tokens,
            vec![
                Token::new(TokenKind::Text, &b"abc"[..]),
                Token::new(TokenKind::Number, &b"123"[..]),
                Token::NONE,
            ]
        );
    }

    #[test]
    fn test_single_space_and_other() {
        let space = ByteBuffer::from(&b" "[..]);
        assert_eq!(kinds(&tokenize(&space)), vec![TokenKind::Space, TokenKind::None]);

        let plus = ByteBuffer::from(&b"+"[..]);
        let tokens = tokenize(&plus);
        assert_eq!(tokens, vec![Token::new(TokenKind::Other, &b"+"[..]), Token::NONE]);
    }

    #[test]
    fn test_crlf_is_one_newline() {
        let buffer = ByteBuffer::from(&b"a\r\nb"[..]);
        let tokens = tokenize(&buffer);
        assert_eq!(
            kinds(&tokens),
            vec![TokenKind::Text, TokenKind::NewLine, TokenKind::Text, TokenKind::None]
        );
        assert_eq!(tokens[1].len(), 2);
    }

    // Lenient handling: a CR that does not start a CRLF is treated as
    // whitespace rather than rejected. Kept for compatibility only.
    #[test]
    fn test_lone_cr_and_lf_degrade_to_space() {
        let buffer = ByteBuffer::from(&b"a\rb\nc\r"[..]);
        let tokens = tokenize(&buffer);
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Text,
                TokenKind::Space,
                TokenKind::Text,
                TokenKind::Space,
                TokenKind::Text,
                TokenKind::Space,
                TokenKind::None,
            ]
        );
        assert_eq!(tokens[1].bytes(), b"\r");
        assert_eq!(tokens[3].bytes(), b"\n");
    }

    #[test]
    fn test_case_insensitive_equality() {
        let a = Token::new(TokenKind::Text, &b"MAIL"[..]);
        let b = Token::new(TokenKind::Text, &b"mail"[..]);
        assert_eq!(a, b);
        assert!(a.is_text("Mail"));
        assert!(!Token::new(TokenKind::Other, &b"M"[..]).is_text("M"));
    }

    #[test]
    fn test_utf8_bytes_are_text() {
        let buffer = ByteBuffer::from("josé".as_bytes().to_vec());
        let tokens = tokenize(&buffer);
        assert_eq!(kinds(&tokens), vec![TokenKind::Text, TokenKind::None]);
        assert_eq!(tokens[0].text(), "josé");
    }

    #[test]
    fn test_segment_boundary_invariance() {
        let input: &'static [u8] = b"MAIL FROM:<user123@example.com> SIZE=1024\r\nab\rcd\r\n";
        let whole = owned(tokenize(&ByteBuffer::from(input)));

        for chunk in 1..input.len() {
            let buffer = ByteBuffer::from_segments(
                input.chunks(chunk).map(|c| Bytes::copy_from_slice(c)),
            );
            assert_eq!(owned(tokenize(&buffer)), whole, "chunk size {chunk}");
        }

        for split in 1..input.len() {
            let buffer = ByteBuffer::from_segments([
                Bytes::from_static(&input[..split]),
                Bytes::from_static(&input[split..]),
            ]);
            assert_eq!(owned(tokenize(&buffer)), whole, "split at {split}");
        }
    }

    #[test]
    fn test_run_spanning_segments_is_one_token() {
        let buffer = ByteBuffer::from_segments([
            Bytes::from_static(b"exa"),
            Bytes::from_static(b"mp"),
            Bytes::from_static(b"le42"),
        ]);
        let tokens = tokenize(&buffer);
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].bytes(), b"example");
        assert_eq!(tokens[1].bytes(), b"42");
    }

    #[test]
    fn test_restartable() {
        let buffer = ByteBuffer::from(&b"HELO x"[..]);
        let first: Vec<_> = owned(Tokenizer::new(&buffer).collect());
        let second: Vec<_> = owned(Tokenizer::new(&buffer).collect());
        assert_eq!(first, second);
        assert_eq!(Tokenizer::new(&buffer).count(), 4);
    }
}
