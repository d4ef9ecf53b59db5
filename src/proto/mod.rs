//! SMTP protocol engine
//!
//! Bytes flow bottom-up: [`stream`] delimits lines and DATA blocks,
//! [`tokenizer`] classifies them, [`tokens`] gives the grammar a
//! backtracking cursor, [`parser`] recognizes commands and
//! [`state_machine`] decides which commands are legal when.

pub mod buffer;
pub mod command;
pub mod parser;
pub mod response;
pub mod state_machine;
pub mod stream;
pub mod tokenizer;
pub mod tokens;

pub use buffer::ByteBuffer;
pub use command::{
    AuthenticationMethod, EsmtpParameters, Mailbox, ProxyCommand, ProxyProtocol, SmtpCommand,
};
pub use parser::ParseResult;
pub use response::{SmtpReplyCode, SmtpResponse};
pub use state_machine::{SmtpState, SmtpStateMachine, StateMachineOptions};
pub use stream::{AsyncStream, BoxedStream, Delimited, SmtpStream};
pub use tokenizer::{Token, TokenKind, Tokenizer};
pub use tokens::{Checkpoint, TokenEnumerator};
