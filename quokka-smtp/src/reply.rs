//! SMTP replies.
//!
//! Every reply carries an RFC 3463 enhanced status code in its text, which
//! is why `ENHANCEDSTATUSCODES` is advertised in EHLO.

use std::fmt;

pub const GENERIC_OK: &str = "2.0.0 Requested mail action okay, completed";
pub const BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
pub const SYNTAX_ERROR: &str = "5.5.4 Syntax error in parameters or arguments";
pub const AUTHENTICATION_REQUIRED: &str = "5.7.0 Authentication required";

/// A numeric reply with zero or more text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, line: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![line.into()],
        }
    }

    pub fn multiline<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// A reply without text, e.g. the `334 ` SASL challenge.
    pub fn bare(code: u16) -> Self {
        Self {
            code,
            lines: Vec::new(),
        }
    }

    /// Wire encoding, including the trailing CRLF.
    pub fn encode(&self) -> String {
        let Some((last, rest)) = self.lines.split_last() else {
            return format!("{} \r\n", self.code);
        };

        let mut out = String::new();
        for line in rest {
            out.push_str(&format!("{}-{}\r\n", self.code, line));
        }
        out.push_str(&format!("{} {}\r\n", self.code, last));
        out
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn service_ready(domain: &str) -> Self {
        Self::new(220, format!("{domain} ESMTP service ready"))
    }

    pub fn closing(domain: &str) -> Self {
        Self::new(
            221,
            format!("2.0.0 {domain} service closing transmission channel"),
        )
    }

    pub fn ok() -> Self {
        Self::new(250, GENERIC_OK)
    }

    pub fn sender_ok() -> Self {
        Self::new(250, "2.1.0 Requested mail action okay, completed")
    }

    pub fn recipient_ok() -> Self {
        Self::new(250, "2.1.5 Requested mail action okay, completed")
    }

    pub fn message_accepted() -> Self {
        Self::new(250, "2.6.0 Message accepted for delivery")
    }

    pub fn start_mail_input() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn ready_to_start_tls() -> Self {
        Self::new(220, "2.0.0 Ready to start TLS")
    }

    pub fn authentication_succeeded() -> Self {
        Self::new(235, "2.7.0 Authentication succeeded")
    }

    pub fn timeout(domain: &str) -> Self {
        Self::new(
            421,
            format!("4.4.2 {domain} Timeout exceeded, closing connection"),
        )
    }

    pub fn shutting_down(domain: &str) -> Self {
        Self::new(
            421,
            format!("4.3.2 {domain} Service shutting down, closing connection"),
        )
    }

    pub fn tls_not_available() -> Self {
        Self::new(454, "4.7.0 TLS not available due to temporary reason")
    }

    pub fn command_unrecognized() -> Self {
        Self::new(500, "5.5.2 Syntax error, command unrecognized")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "5.5.6 Line too long")
    }

    pub fn syntax_error() -> Self {
        Self::new(501, SYNTAX_ERROR)
    }

    pub fn cannot_decode_response() -> Self {
        Self::new(501, "5.5.2 Cannot decode response")
    }

    pub fn authentication_cancelled() -> Self {
        Self::new(501, "5.7.0 Authentication cancelled")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, BAD_SEQUENCE)
    }

    pub fn unrecognized_mechanism() -> Self {
        Self::new(504, "5.5.4 Unrecognized authentication mechanism")
    }

    pub fn authentication_required() -> Self {
        Self::new(530, AUTHENTICATION_REQUIRED)
    }

    pub fn starttls_first() -> Self {
        Self::new(530, "5.7.0 Must issue a STARTTLS command first")
    }

    pub fn invalid_credentials() -> Self {
        Self::new(535, "5.7.8 Authentication credentials invalid")
    }

    pub fn message_too_big() -> Self {
        Self::new(552, "5.3.4 Message size exceeds fixed maximum message size")
    }

    pub fn local_error() -> Self {
        Self::new(451, "4.3.0 Requested action aborted: local error in processing")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}
