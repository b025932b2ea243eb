//! Authorization gate consulted before a downstream telegram is forwarded.
//!
//! Rule evaluation, credentials and key exchange live outside this crate;
//! the core only consumes a per-peer classification and applies the pure
//! accept/reject decision below. Denials are acknowledged on the wire (so
//! the peer stops resending) but never reach the fan-out queue.

use std::net::SocketAddr;

use crate::frame::{LData, TelegramService};

/// Security classification of a peer, as decided by the external rule engine
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessClass {
    /// Nothing is forwarded
    Deny,
    /// Only group-value reads are forwarded
    ReadOnly,
    /// Only group-value writes and responses are forwarded
    WriteOnly,
    /// Everything is forwarded
    Allow,
}

/// Decide whether a telegram from a peer with the given classification may
/// be admitted to the queue
///
/// Physically addressed telegrams and non-group services need full access;
/// a value response counts as a write since it places a value on the bus.
pub fn permits(class: AccessClass, frame: &LData) -> bool {
    match class {
        AccessClass::Allow => true,
        AccessClass::Deny => false,
        AccessClass::ReadOnly => frame.is_group() && frame.service() == TelegramService::Read,
        AccessClass::WriteOnly => {
            frame.is_group()
                && matches!(
                    frame.service(),
                    TelegramService::Write | TelegramService::Response
                )
        }
    }
}

/// Maps a peer endpoint to its security classification
///
/// Implemented by the external security subsystem; the default grants
/// everything, matching a gateway with no access rules configured.
pub trait Authorize: Send + Sync {
    /// Classify the peer at `remote`
    fn classify(&self, remote: SocketAddr) -> AccessClass;
}

/// Grants every peer full access
#[derive(Debug, Default, Copy, Clone)]
pub struct AllowAll;

impl Authorize for AllowAll {
    fn classify(&self, _remote: SocketAddr) -> AccessClass {
        AccessClass::Allow
    }
}
