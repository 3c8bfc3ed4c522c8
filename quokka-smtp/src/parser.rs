//! Parsers for SMTP command lines.
//!
//! Verbs are matched case-insensitively. Arguments keep their original case,
//! except for the SASL mechanism name which is upper-cased.

use thiserror::Error;

/// Errors produced while parsing a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("parser: mail command is invalid")]
    MailCommandInvalid,

    #[error("parser: recipient command is invalid")]
    RecipientCommandInvalid,

    #[error("parser: auth command is invalid")]
    AuthCommandInvalid,
}

/// A command line split into its verb and the remaining text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    /// Upper-cased verb, e.g. `EHLO`.
    pub verb: String,
    /// Everything after the first space, untouched.
    pub args: &'a str,
}

impl<'a> Command<'a> {
    /// Splits a command line at the first space.
    pub fn split(line: &'a str) -> Self {
        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
        Self {
            verb: verb.to_ascii_uppercase(),
            args,
        }
    }
}

/// `MAIL FROM:<reverse-path> [parameters]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailCommand {
    pub reverse_path: String,
    pub parameters: Vec<String>,
}

impl MailCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (path, parameters) =
            path_and_parameters(line, "MAIL FROM:").ok_or(ParseError::MailCommandInvalid)?;
        Ok(Self {
            reverse_path: path,
            parameters,
        })
    }

    /// Declared message size from the `SIZE=` parameter (RFC 1870).
    pub fn declared_size(&self) -> Option<u64> {
        parse_size_parameter(&self.parameters)
    }
}

/// `RCPT TO:<forward-path> [parameters]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientCommand {
    pub forward_path: String,
    pub parameters: Vec<String>,
}

impl RecipientCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (path, parameters) =
            path_and_parameters(line, "RCPT TO:").ok_or(ParseError::RecipientCommandInvalid)?;
        Ok(Self {
            forward_path: path,
            parameters,
        })
    }
}

/// `AUTH <mechanism> [initial-response]` (RFC 4954).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub mechanism: String,
    /// Base64 initial response as sent; `=` stands for an empty response.
    pub initial_response: Option<String>,
}

impl AuthCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let rest = strip_prefix_ignore_case(line, "AUTH").ok_or(ParseError::AuthCommandInvalid)?;
        let mut args = rest.trim_matches(' ').split(' ');

        let mechanism = match args.next() {
            Some(m) if !m.is_empty() => m.to_ascii_uppercase(),
            _ => return Err(ParseError::AuthCommandInvalid),
        };

        Ok(Self {
            mechanism,
            initial_response: args.next().map(str::to_string),
        })
    }
}

/// Returns the value of a `SIZE=n` parameter, if present and numeric.
pub fn parse_size_parameter(parameters: &[String]) -> Option<u64> {
    parameters.iter().find_map(|p| {
        let (key, value) = p.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn path_and_parameters(line: &str, prefix: &str) -> Option<(String, Vec<String>)> {
    let rest = strip_prefix_ignore_case(line, prefix)?;
    let mut args = rest.trim_matches(' ').split(' ');

    let path = args.next().filter(|p| !p.is_empty())?;
    let parameters = args
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    Some((path.to_string(), parameters))
}
