//! Recursive-descent parser for SMTP commands
//!
//! Leaf productions follow RFC 5321 §4.1.2 and return `Option`, rolling the
//! cursor back when they do not match. Command entry points return the
//! command or the reply to send back to the client.
//!
//! ```text
//! Reverse-path   = Path / "<>"
//! Forward-path   = Path / "<Postmaster>"
//! Path           = "<" [ A-d-l ":" ] Mailbox ">"
//! A-d-l          = At-domain *( "," At-domain )
//! At-domain      = "@" Domain
//! Mailbox        = Local-part "@" ( Domain / address-literal )
//! Local-part     = Dot-string / Quoted-string
//! Domain         = sub-domain *("." sub-domain)
//! address-literal  = "[" ( IPv4-address-literal / IPv6-address-literal ) "]"
//! Mail-parameters  = esmtp-param *(SP esmtp-param)
//! ```

use super::command::{
    AuthenticationMethod, EsmtpParameters, Mailbox, ProxyCommand, ProxyProtocol, SmtpCommand,
};
use super::response::{SmtpReplyCode, SmtpResponse};
use super::tokenizer::{Token, TokenKind};
use super::tokens::TokenEnumerator;
use std::net::{IpAddr, SocketAddr};

/// Outcome of parsing one command line
pub type ParseResult = Result<SmtpCommand, SmtpResponse>;

const ATEXT_SPECIALS: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

fn syntax_error(message: &'static str) -> SmtpResponse {
    SmtpResponse::new(SmtpReplyCode::SyntaxError, message)
}

fn is_text_or_number(token: &Token<'_>) -> bool {
    matches!(token.kind(), TokenKind::Text | TokenKind::Number)
}

// ---------------------------------------------------------------------------
// Lexical helpers
// ---------------------------------------------------------------------------

/// Match a case-insensitive literal made of letters and digits. The literal
/// may span several tokens (`TCP4` is a text token then a number token) but
/// must end on a token boundary.
pub fn try_make_literal(tokens: &mut TokenEnumerator<'_>, literal: &str) -> bool {
    let expected = literal.as_bytes();
    tokens.try_match(|t| {
        let mut matched = 0;
        while matched < expected.len() {
            let token = t.peek();
            if !is_text_or_number(token) {
                return false;
            }
            let end = matched + token.len();
            if end > expected.len() || !token.bytes().eq_ignore_ascii_case(&expected[matched..end])
            {
                return false;
            }
            matched = end;
            t.take();
        }
        true
    })
}

/// Match a single punctuation byte
pub fn try_make_char(tokens: &mut TokenEnumerator<'_>, ch: u8) -> bool {
    if tokens.peek().is_char(ch) {
        tokens.take();
        true
    } else {
        false
    }
}

/// Optional trailing whitespace, then end of input
pub fn try_make_end(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.try_match(|t| {
        t.skip(TokenKind::Space);
        if t.peek().kind() == TokenKind::NewLine {
            t.take();
        }
        t.is_exhausted()
    })
}

fn require_space(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.skip(TokenKind::Space) > 0
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn try_make_bare(
    tokens: &mut TokenEnumerator<'_>,
    keyword: &str,
    command: SmtpCommand,
) -> ParseResult {
    if !try_make_literal(tokens, keyword) {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !try_make_end(tokens) {
        return Err(SmtpResponse::new(
            SmtpReplyCode::SyntaxError,
            format!("{keyword} takes no arguments"),
        ));
    }
    Ok(command)
}

/// `QUIT CRLF`
pub fn try_make_quit(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_bare(tokens, "QUIT", SmtpCommand::Quit)
}

/// `RSET CRLF`
pub fn try_make_rset(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_bare(tokens, "RSET", SmtpCommand::Rset)
}

/// `DATA CRLF`
pub fn try_make_data(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_bare(tokens, "DATA", SmtpCommand::Data)
}

/// `STARTTLS CRLF`
pub fn try_make_start_tls(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_bare(tokens, "STARTTLS", SmtpCommand::StartTls)
}

/// `NOOP [ SP String ] CRLF`; the argument is ignored
pub fn try_make_noop(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    if !try_make_literal(tokens, "NOOP") {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if try_make_end(tokens) || require_space(tokens) {
        return Ok(SmtpCommand::Noop);
    }
    Err(syntax_error("NOOP argument must be separated by a space"))
}

fn try_make_greeting(
    tokens: &mut TokenEnumerator<'_>,
    keyword: &str,
) -> Result<String, SmtpResponse> {
    if !try_make_literal(tokens, keyword) {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !require_space(tokens) {
        return Err(syntax_error("domain name or address literal expected"));
    }

    // HELO is only meant to take a domain, but clients do send address
    // literals here and there is no harm in accepting them.
    let domain = try_make_domain(tokens)
        .or_else(|| try_make_address_literal(tokens))
        .ok_or_else(|| syntax_error("domain name or address literal expected"))?;

    if !try_make_end(tokens) {
        return Err(syntax_error("unexpected characters after the domain"));
    }
    Ok(domain)
}

/// `HELO SP ( Domain / address-literal ) CRLF`
pub fn try_make_helo(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_greeting(tokens, "HELO").map(|domain| SmtpCommand::Helo { domain })
}

/// `EHLO SP ( Domain / address-literal ) CRLF`
pub fn try_make_ehlo(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_greeting(tokens, "EHLO").map(|domain| SmtpCommand::Ehlo { domain })
}

/// `SP keyword ":"`, tolerating whitespace around the colon
fn try_make_path_prefix(tokens: &mut TokenEnumerator<'_>, keyword: &str) -> bool {
    tokens.try_match(|t| {
        require_space(t) && try_make_literal(t, keyword) && {
            t.skip(TokenKind::Space);
            try_make_char(t, b':')
        } && {
            t.skip(TokenKind::Space);
            true
        }
    })
}

fn try_make_trailing_parameters(
    tokens: &mut TokenEnumerator<'_>,
) -> Result<EsmtpParameters, SmtpResponse> {
    if try_make_end(tokens) {
        return Ok(EsmtpParameters::new());
    }
    if !require_space(tokens) {
        return Err(syntax_error("unexpected characters after the address"));
    }
    let parameters =
        try_make_mail_parameters(tokens).ok_or_else(|| syntax_error("invalid ESMTP parameters"))?;
    if !try_make_end(tokens) {
        return Err(syntax_error("invalid ESMTP parameters"));
    }
    Ok(parameters)
}

/// `MAIL FROM:Reverse-path [SP Mail-parameters] CRLF`
pub fn try_make_mail(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    if !try_make_literal(tokens, "MAIL") {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !try_make_path_prefix(tokens, "FROM") {
        return Err(syntax_error("missing the FROM:"));
    }
    let from = try_make_reverse_path(tokens).ok_or_else(|| {
        syntax_error("must be a valid mailbox address, e.g. <user@example.com> or <>")
    })?;
    let parameters = try_make_trailing_parameters(tokens)?;
    Ok(SmtpCommand::Mail { from, parameters })
}

/// `RCPT TO:Forward-path [SP Rcpt-parameters] CRLF`
pub fn try_make_rcpt(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    if !try_make_literal(tokens, "RCPT") {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !try_make_path_prefix(tokens, "TO") {
        return Err(syntax_error("missing the TO:"));
    }
    let to = try_make_forward_path(tokens)
        .ok_or_else(|| syntax_error("must be a valid mailbox address, e.g. <user@example.com>"))?;
    let parameters = try_make_trailing_parameters(tokens)?;
    Ok(SmtpCommand::Rcpt { to, parameters })
}

/// `AUTH SP mechanism [SP initial-response] CRLF`
pub fn try_make_auth(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    if !try_make_literal(tokens, "AUTH") {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !require_space(tokens) {
        return Err(syntax_error("authentication mechanism expected"));
    }

    let method = if try_make_literal(tokens, "PLAIN") {
        AuthenticationMethod::Plain
    } else if try_make_literal(tokens, "LOGIN") {
        AuthenticationMethod::Login
    } else {
        return Err(syntax_error("unsupported authentication mechanism"));
    };

    if try_make_end(tokens) {
        return Ok(SmtpCommand::Auth {
            method,
            initial_response: None,
        });
    }

    if !require_space(tokens) {
        return Err(syntax_error("authentication mechanism expected"));
    }
    // A lone "=" is an explicitly empty initial response (RFC 4954).
    let initial_response = if try_make_char(tokens, b'=') {
        String::new()
    } else {
        try_make_base64(tokens).ok_or_else(|| syntax_error("invalid initial response"))?
    };
    if !try_make_end(tokens) {
        return Err(syntax_error("invalid initial response"));
    }

    Ok(SmtpCommand::Auth {
        method,
        initial_response: Some(initial_response),
    })
}

/// HAProxy v1 header:
/// `PROXY SP ( "TCP4" / "TCP6" ) SP src SP dst SP sport SP dport CRLF`
/// or `PROXY SP "UNKNOWN" *anything CRLF`
pub fn try_make_proxy(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    if !try_make_literal(tokens, "PROXY") {
        return Err(SmtpResponse::SYNTAX_ERROR);
    }
    if !require_space(tokens) {
        return Err(syntax_error("proxy protocol family expected"));
    }

    if try_make_literal(tokens, "UNKNOWN") {
        return Ok(SmtpCommand::Proxy(ProxyCommand {
            protocol: ProxyProtocol::Unknown,
            source: None,
            destination: None,
        }));
    }

    let (protocol, address): (ProxyProtocol, fn(&mut TokenEnumerator<'_>) -> Option<String>) =
        if try_make_literal(tokens, "TCP4") {
            (ProxyProtocol::Tcp4, try_make_ipv4_address_literal)
        } else if try_make_literal(tokens, "TCP6") {
            (ProxyProtocol::Tcp6, try_make_ipv6_address)
        } else {
            return Err(syntax_error("expected TCP4, TCP6 or UNKNOWN"));
        };

    let source = try_make_proxy_address(tokens, address)?;
    let destination = try_make_proxy_address(tokens, address)?;
    let source_port = try_make_proxy_port(tokens)?;
    let destination_port = try_make_proxy_port(tokens)?;

    if !try_make_end(tokens) {
        return Err(malformed_proxy_header());
    }

    Ok(SmtpCommand::Proxy(ProxyCommand {
        protocol,
        source: Some(SocketAddr::new(source, source_port)),
        destination: Some(SocketAddr::new(destination, destination_port)),
    }))
}

fn malformed_proxy_header() -> SmtpResponse {
    syntax_error("malformed proxy header")
}

fn try_make_proxy_address(
    tokens: &mut TokenEnumerator<'_>,
    address: fn(&mut TokenEnumerator<'_>) -> Option<String>,
) -> Result<IpAddr, SmtpResponse> {
    if !require_space(tokens) {
        return Err(malformed_proxy_header());
    }
    address(tokens)
        .and_then(|text| text.parse::<IpAddr>().ok())
        .ok_or_else(malformed_proxy_header)
}

fn try_make_proxy_port(tokens: &mut TokenEnumerator<'_>) -> Result<u16, SmtpResponse> {
    if !require_space(tokens) {
        return Err(malformed_proxy_header());
    }
    tokens
        .try_make(|t| {
            let token = t.take();
            if token.kind() != TokenKind::Number || token.len() > 5 {
                return None;
            }
            token.text().parse().ok()
        })
        .ok_or_else(malformed_proxy_header)
}

// ---------------------------------------------------------------------------
// Paths and mailboxes
// ---------------------------------------------------------------------------

/// `Path / "<>"`. Whitespace between the brackets also means the null path.
pub fn try_make_reverse_path(tokens: &mut TokenEnumerator<'_>) -> Option<Mailbox> {
    if let Some(mailbox) = try_make_path(tokens) {
        return Some(mailbox);
    }
    tokens.try_make(|t| {
        if !try_make_char(t, b'<') {
            return None;
        }
        t.skip(TokenKind::Space);
        try_make_char(t, b'>').then(Mailbox::empty)
    })
}

/// `Path / "<Postmaster>"`
pub fn try_make_forward_path(tokens: &mut TokenEnumerator<'_>) -> Option<Mailbox> {
    if let Some(mailbox) = try_make_path(tokens) {
        return Some(mailbox);
    }
    tokens.try_make(|t| {
        (try_make_char(t, b'<') && try_make_literal(t, "Postmaster") && try_make_char(t, b'>'))
            .then(Mailbox::postmaster)
    })
}

/// `"<" [ A-d-l ":" ] Mailbox ">"`; the source route is parsed and dropped
pub fn try_make_path(tokens: &mut TokenEnumerator<'_>) -> Option<Mailbox> {
    tokens.try_make(|t| {
        if !try_make_char(t, b'<') {
            return None;
        }
        t.try_match(|t| try_make_at_domain_list(t).is_some() && try_make_char(t, b':'));
        let mailbox = try_make_mailbox(t)?;
        try_make_char(t, b'>').then_some(mailbox)
    })
}

/// `At-domain *( "," At-domain )`
pub fn try_make_at_domain_list(tokens: &mut TokenEnumerator<'_>) -> Option<Vec<String>> {
    tokens.try_make(|t| {
        let mut domains = vec![try_make_at_domain(t)?];
        while let Some(domain) = t.try_make(|t| {
            if !try_make_char(t, b',') {
                return None;
            }
            try_make_at_domain(t)
        }) {
            domains.push(domain);
        }
        Some(domains)
    })
}

/// `"@" Domain`
pub fn try_make_at_domain(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        if !try_make_char(t, b'@') {
            return None;
        }
        try_make_domain(t)
    })
}

/// `Local-part "@" ( Domain / address-literal )`
pub fn try_make_mailbox(tokens: &mut TokenEnumerator<'_>) -> Option<Mailbox> {
    tokens.try_make(|t| {
        let user = try_make_local_part(t)?;
        if !try_make_char(t, b'@') {
            return None;
        }
        let host = try_make_domain(t).or_else(|| try_make_address_literal(t))?;
        Some(Mailbox { user, host })
    })
}

/// `Dot-string / Quoted-string`
pub fn try_make_local_part(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    try_make_dot_string(tokens).or_else(|| try_make_quoted_string(tokens))
}

fn is_atext(token: &Token<'_>) -> bool {
    match token.kind() {
        TokenKind::Text | TokenKind::Number => true,
        TokenKind::Other => token
            .first_byte()
            .is_some_and(|b| ATEXT_SPECIALS.contains(&b)),
        _ => false,
    }
}

/// `1*atext`
pub fn try_make_atom(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    let start = tokens.checkpoint();
    if tokens.skip_while(is_atext) == 0 {
        return None;
    }
    Some(tokens.text_since(start))
}

/// `Atom *("." Atom)`
pub fn try_make_dot_string(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        try_make_atom(t)?;
        while t.try_match(|t| try_make_char(t, b'.') && try_make_atom(t).is_some()) {}
        Some(t.text_since(start))
    })
}

fn is_qtext(token: &Token<'_>) -> bool {
    match token.kind() {
        TokenKind::Text | TokenKind::Number => true,
        TokenKind::Space => token.bytes() == b" ",
        TokenKind::Other => token
            .first_byte()
            .is_some_and(|b| matches!(b, 33 | 35..=91 | 93..=126)),
        _ => false,
    }
}

fn is_quoted_pair_char(token: &Token<'_>) -> bool {
    match token.kind() {
        TokenKind::Text | TokenKind::Number => token.bytes().is_ascii(),
        TokenKind::Space => token.bytes() == b" ",
        TokenKind::Other => token.first_byte().is_some_and(|b| (32..=126).contains(&b)),
        _ => false,
    }
}

/// `DQUOTE *( qtextSMTP / "\" %d32-126 ) DQUOTE`, returned with its quotes
pub fn try_make_quoted_string(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        if !try_make_char(t, b'"') {
            return None;
        }
        loop {
            if try_make_char(t, b'"') {
                return Some(t.text_since(start));
            }
            if try_make_char(t, b'\\') {
                if !is_quoted_pair_char(t.peek()) {
                    return None;
                }
            } else if !is_qtext(t.peek()) {
                return None;
            }
            t.take();
        }
    })
}

// ---------------------------------------------------------------------------
// Domains and address literals
// ---------------------------------------------------------------------------

/// `sub-domain *("." sub-domain)`
pub fn try_make_domain(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        try_make_subdomain(t)?;
        while t.try_match(|t| try_make_char(t, b'.') && try_make_subdomain(t).is_some()) {}
        Some(t.text_since(start))
    })
}

/// `Let-dig [Ldh-str]`: letters, digits and inner hyphens
pub fn try_make_subdomain(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        if !is_text_or_number(t.peek()) {
            return None;
        }
        let start = t.checkpoint();
        t.skip_while(|token| is_text_or_number(token) || token.is_char(b'-'));
        let text = t.text_since(start);
        (!text.ends_with('-')).then_some(text)
    })
}

/// `"[" ( IPv4-address-literal / IPv6-address-literal ) "]"`, returned with brackets
pub fn try_make_address_literal(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        if !try_make_char(t, b'[') {
            return None;
        }
        if try_make_ipv4_address_literal(t).is_none() && try_make_ipv6_address_literal(t).is_none()
        {
            return None;
        }
        try_make_char(t, b']').then(|| t.text_since(start))
    })
}

fn try_make_snum(tokens: &mut TokenEnumerator<'_>) -> Option<u8> {
    tokens.try_make(|t| {
        let token = t.take();
        if token.kind() != TokenKind::Number || token.len() > 3 {
            return None;
        }
        token.text().parse::<u8>().ok()
    })
}

/// `Snum 3("." Snum)`
pub fn try_make_ipv4_address_literal(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        try_make_snum(t)?;
        for _ in 0..3 {
            if !try_make_char(t, b'.') {
                return None;
            }
            try_make_snum(t)?;
        }
        Some(t.text_since(start))
    })
}

/// `"IPv6:" IPv6-addr`
pub fn try_make_ipv6_address_literal(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        if !try_make_literal(t, "IPv6") || !try_make_char(t, b':') {
            return None;
        }
        try_make_ipv6_address(t)?;
        Some(t.text_since(start))
    })
}

/// 1 to 4 hex digits, possibly spread over text and number tokens
fn h16(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.try_match(|t| {
        let mut digits = 0;
        while is_text_or_number(t.peek()) {
            let token = t.peek();
            if !token.bytes().iter().all(u8::is_ascii_hexdigit) {
                return false;
            }
            digits += token.len();
            if digits > 4 {
                return false;
            }
            t.take();
        }
        digits > 0
    })
}

/// `h16 ":"`, never consuming the first half of a `::`
fn h16_colon(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.try_match(|t| h16(t) && try_make_char(t, b':') && !t.peek().is_char(b':'))
}

fn h16_colons(tokens: &mut TokenEnumerator<'_>, count: usize) -> bool {
    tokens.try_match(|t| (0..count).all(|_| h16_colon(t)))
}

fn double_colon(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.try_match(|t| try_make_char(t, b':') && try_make_char(t, b':'))
}

/// `( h16 ":" h16 ) / IPv4address`
fn ls32(tokens: &mut TokenEnumerator<'_>) -> bool {
    tokens.try_match(|t| h16(t) && try_make_char(t, b':') && h16(t) && !t.peek().is_char(b'.'))
        || try_make_ipv4_address_literal(tokens).is_some()
}

/// The optional `[ *n( h16 ":" ) h16 ]` ahead of a `::`. Always succeeds.
fn h16_prefix(tokens: &mut TokenEnumerator<'_>, max_repeats: usize) -> bool {
    tokens.try_match(|t| {
        if !h16(t) {
            return false;
        }
        let mut repeats = 0;
        while repeats < max_repeats && t.try_match(|t| try_make_char(t, b':') && h16(t)) {
            repeats += 1;
        }
        true
    });
    true
}

fn ipv6_form1(t: &mut TokenEnumerator<'_>) -> bool {
    h16_colons(t, 6) && ls32(t)
}

fn ipv6_form2(t: &mut TokenEnumerator<'_>) -> bool {
    double_colon(t) && h16_colons(t, 5) && ls32(t)
}

fn ipv6_form3(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 0) && double_colon(t) && h16_colons(t, 4) && ls32(t)
}

fn ipv6_form4(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 1) && double_colon(t) && h16_colons(t, 3) && ls32(t)
}

fn ipv6_form5(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 2) && double_colon(t) && h16_colons(t, 2) && ls32(t)
}

fn ipv6_form6(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 3) && double_colon(t) && h16_colon(t) && ls32(t)
}

fn ipv6_form7(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 4) && double_colon(t) && ls32(t)
}

fn ipv6_form8(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 5) && double_colon(t) && h16(t)
}

fn ipv6_form9(t: &mut TokenEnumerator<'_>) -> bool {
    h16_prefix(t, 6) && double_colon(t)
}

fn is_ipv6_boundary(token: &Token<'_>) -> bool {
    !is_text_or_number(token) && !token.is_char(b':') && !token.is_char(b'.')
}

/// An IPv6 address in any of the RFC 4291 §2.2 text forms, tried in order
pub fn try_make_ipv6_address(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    let forms: [fn(&mut TokenEnumerator<'_>) -> bool; 9] = [
        ipv6_form1, ipv6_form2, ipv6_form3, ipv6_form4, ipv6_form5, ipv6_form6, ipv6_form7,
        ipv6_form8, ipv6_form9,
    ];

    let start = tokens.checkpoint();
    for form in forms {
        if tokens.try_match(|t| form(t) && is_ipv6_boundary(t.peek())) {
            return Some(tokens.text_since(start));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// ESMTP parameters and Base64
// ---------------------------------------------------------------------------

/// `esmtp-param *(SP esmtp-param)`
pub fn try_make_mail_parameters(tokens: &mut TokenEnumerator<'_>) -> Option<EsmtpParameters> {
    tokens.try_make(|t| {
        let mut parameters = EsmtpParameters::new();
        let (keyword, value) = try_make_esmtp_parameter(t)?;
        parameters.insert(keyword, value);

        while let Some((keyword, value)) = t.try_make(|t| {
            if !require_space(t) {
                return None;
            }
            try_make_esmtp_parameter(t)
        }) {
            parameters.insert(keyword, value);
        }
        Some(parameters)
    })
}

/// `esmtp-keyword ["=" esmtp-value]`; the keyword is upper-cased
pub fn try_make_esmtp_parameter(tokens: &mut TokenEnumerator<'_>) -> Option<(String, String)> {
    tokens.try_make(|t| {
        let keyword = try_make_esmtp_keyword(t)?;
        let value = if try_make_char(t, b'=') {
            try_make_esmtp_value(t)?
        } else {
            String::new()
        };
        Some((keyword.to_ascii_uppercase(), value))
    })
}

/// `(ALPHA / DIGIT) *(ALPHA / DIGIT / "-")`
fn try_make_esmtp_keyword(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    if !is_text_or_number(tokens.peek()) {
        return None;
    }
    let start = tokens.checkpoint();
    tokens.skip_while(|token| is_text_or_number(token) || token.is_char(b'-'));
    Some(tokens.text_since(start))
}

/// `1*(%d33-60 / %d62-126)`
fn try_make_esmtp_value(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    let start = tokens.checkpoint();
    let taken = tokens.skip_while(|token| match token.kind() {
        TokenKind::Text | TokenKind::Number => true,
        TokenKind::Other => token
            .first_byte()
            .is_some_and(|b| matches!(b, 33..=60 | 62..=126)),
        _ => false,
    });
    (taken > 0).then(|| tokens.text_since(start))
}

/// Base64 text whose length is a multiple of 4, followed by a line end,
/// a space or the end of input
pub fn try_make_base64(tokens: &mut TokenEnumerator<'_>) -> Option<String> {
    tokens.try_make(|t| {
        let start = t.checkpoint();
        let taken = t.skip_while(|token| {
            (is_text_or_number(token) && token.bytes().is_ascii())
                || token.is_char(b'+')
                || token.is_char(b'/')
        });
        if taken == 0 {
            return None;
        }
        let mut padding = 0;
        while padding < 2 && try_make_char(t, b'=') {
            padding += 1;
        }

        let text = t.text_since(start);
        if text.len() % 4 != 0 {
            return None;
        }
        matches!(
            t.peek().kind(),
            TokenKind::NewLine | TokenKind::Space | TokenKind::None
        )
        .then_some(text)
    })
}
