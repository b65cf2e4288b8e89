//! Redirection replies (`MOVED` / `ASK`).
//!
//! Format: `MOVED <slot> <host>:<port>` and `ASK <slot> <host>:<port>`.
//! The host may be a hostname or empty, in which case the node that sent the
//! redirect is meant.

use ckv_common::ServerError;

use crate::config::NodeAddress;

/// Where a node told us to go instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot ownership changed for good; refresh the map.
    Moved { slot: u16, addr: NodeAddress },
    /// Slot is migrating; retry this one request at `addr` after `ASKING`.
    Ask { slot: u16, addr: NodeAddress },
}

impl Redirect {
    pub fn addr(&self) -> &NodeAddress {
        match self {
            Redirect::Moved { addr, .. } | Redirect::Ask { addr, .. } => addr,
        }
    }

    pub fn slot(&self) -> u16 {
        match self {
            Redirect::Moved { slot, .. } | Redirect::Ask { slot, .. } => *slot,
        }
    }
}

/// Parses a redirect out of an error reply. Returns `None` for any other
/// error, including malformed redirects.
pub fn parse_redirect(err: &ServerError, current: &NodeAddress) -> Option<Redirect> {
    let mut parts = err.message().split_whitespace();
    let kind = parts.next()?;
    let slot = parts.next()?.parse::<u16>().ok()?;
    let addr = NodeAddress::parse(parts.next()?, &current.host)?;

    match kind {
        "MOVED" => Some(Redirect::Moved { slot, addr }),
        "ASK" => Some(Redirect::Ask { slot, addr }),
        _ => None,
    }
}
