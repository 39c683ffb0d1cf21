//! Queue name parsing and validation.
//!
//! A client-supplied name is either plain (`orders`) or a fanout child
//! (`orders+audit`): writes to `orders` are broadcast to every child.
//! The characters `.`, `/` and `~` are forbidden so that a queue name is
//! always a safe journal filename (`~` is reserved for rewrite temp files).

use crate::core::error::BrokerError;

const FORBIDDEN: &[char] = &['.', '/', '~'];

/// A validated queue name, borrowed from the caller's string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueName<'a> {
    raw: &'a str,
    master: &'a str,
    tag: Option<&'a str>,
}

impl<'a> QueueName<'a> {
    /// The full physical name (what goes on disk and in the registry).
    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    /// The master segment; equal to `as_str()` for plain names.
    pub fn master(&self) -> &'a str {
        self.master
    }

    /// `Some(tag)` when this is a fanout child (`master+tag`). The tag may
    /// be empty, denoting the master's own reader.
    pub fn tag(&self) -> Option<&'a str> {
        self.tag
    }

    pub fn is_fanout_child(&self) -> bool {
        self.tag.is_some()
    }
}

/// Parses and validates a client-supplied queue name.
///
/// Consults no registry state; callers combine the result with alias and
/// registry lookups.
pub fn resolve(name: &str) -> Result<QueueName<'_>, BrokerError> {
    let illegal = || BrokerError::IllegalName(name.to_string());

    if name.is_empty() || name.contains(FORBIDDEN) {
        return Err(illegal());
    }

    match name.split_once('+') {
        Some((master, tag)) => {
            if master.is_empty() || tag.contains('+') {
                return Err(illegal());
            }
            Ok(QueueName {
                raw: name,
                master,
                tag: Some(tag),
            })
        }
        None => Ok(QueueName {
            raw: name,
            master: name,
            tag: None,
        }),
    }
}

/// Whether a directory entry can be a recoverable queue name. Rewrite temp
/// files (`name~`) and foreign files are skipped at load time.
pub fn is_loadable(name: &str) -> bool {
    resolve(name).is_ok()
}
