//! Maps transport errors onto [`FailureKind`].
//!
//! The transport reports failures as a chain of wrapped errors. The classifier
//! walks that chain looking for the first cause it recognizes: an OS-level
//! `io::Error`, a protocol-level `hyper::Error`, or the connector's DNS
//! failure. Anything else is `Other`.

use std::error::Error as StdError;
use std::io;

use crate::error::FailureKind;

pub fn classify(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        return FailureKind::Timeout;
    }
    classify_chain(err)
}

/// The innermost OS-level error in the chain, if any.
pub fn os_cause(err: &reqwest::Error) -> Option<&io::Error> {
    chain(err)
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .last()
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |cause: &&'a (dyn StdError + 'static)| {
        (*cause).source()
    })
}

pub(crate) fn classify_chain(err: &(dyn StdError + 'static)) -> FailureKind {
    for cause in chain(err) {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io(io.kind()) {
                return kind;
            }
        }
        if let Some(hyper) = cause.downcast_ref::<hyper::Error>() {
            if hyper.is_incomplete_message() || hyper.is_closed() {
                return FailureKind::Reset;
            }
            if hyper.is_timeout() {
                return FailureKind::Timeout;
            }
        }
        // hyper-util's connector reports resolver failures with this prefix
        if cause.to_string().starts_with("dns error") {
            return FailureKind::Dns;
        }
    }
    FailureKind::Other
}

fn classify_io(kind: io::ErrorKind) -> Option<FailureKind> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some(FailureKind::Refused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => Some(FailureKind::Reset),
        io::ErrorKind::TimedOut => Some(FailureKind::Timeout),
        _ => None,
    }
}
