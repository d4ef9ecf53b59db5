//! Cursor over a materialized token sequence
//!
//! Grammar productions wrap each alternative in a checkpoint. A failed
//! alternative rolls the cursor back; a successful one simply keeps the
//! advanced position.

use super::buffer::ByteBuffer;
use super::tokenizer::{Token, TokenKind, Tokenizer};

/// A saved cursor position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// Token cursor with backtracking
#[derive(Debug, Clone)]
pub struct TokenEnumerator<'a> {
    tokens: Vec<Token<'a>>,
    index: usize,
}

impl<'a> TokenEnumerator<'a> {
    /// Create a cursor, appending the end marker if the sequence lacks one.
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.last().is_none_or(|t| !t.is_none()) {
            tokens.push(Token::NONE);
        }
        Self { tokens, index: 0 }
    }

    /// Tokenize a buffer and place the cursor at its first token
    pub fn from_buffer(buffer: &'a ByteBuffer) -> Self {
        Self::new(Tokenizer::new(buffer).collect())
    }

    fn last(&self) -> usize {
        self.tokens.len() - 1
    }

    /// The current token
    pub fn peek(&self) -> &Token<'a> {
        self.peek_at(0)
    }

    /// The token `depth` places ahead of the cursor, or the end marker
    pub fn peek_at(&self, depth: usize) -> &Token<'a> {
        let index = (self.index + depth).min(self.last());
        &self.tokens[index]
    }

    /// Return the current token and advance. The cursor never moves past the end marker.
    pub fn take(&mut self) -> Token<'a> {
        let token = self.tokens[self.index].clone();
        if self.index < self.last() {
            self.index += 1;
        }
        token
    }

    /// Skip every consecutive token of `kind`, returning how many were skipped
    pub fn skip(&mut self, kind: TokenKind) -> usize {
        self.skip_while(|t| t.kind() == kind)
    }

    /// Skip tokens while `predicate` holds
    pub fn skip_while(&mut self, predicate: impl Fn(&Token<'a>) -> bool) -> usize {
        let mut skipped = 0;
        while !self.peek().is_none() && predicate(self.peek()) {
            self.take();
            skipped += 1;
        }
        skipped
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.index)
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.index = checkpoint.0;
    }

    /// Run a production, rolling back if it yields nothing
    pub fn try_make<T>(&mut self, production: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        let checkpoint = self.checkpoint();
        let made = production(self);
        if made.is_none() {
            self.rollback(checkpoint);
        }
        made
    }

    /// Like [`try_make`](Self::try_make) for productions that only match
    pub fn try_match(&mut self, production: impl FnOnce(&mut Self) -> bool) -> bool {
        self.try_make(|t| production(t).then_some(())).is_some()
    }

    /// Concatenated text of the tokens consumed since `checkpoint`
    pub fn text_since(&self, checkpoint: Checkpoint) -> String {
        let mut bytes = Vec::new();
        for token in &self.tokens[checkpoint.0..self.index] {
            bytes.extend_from_slice(token.bytes());
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Whether every token up to the end marker has been consumed
    pub fn is_exhausted(&self) -> bool {
        self.peek().is_none()
    }
}
