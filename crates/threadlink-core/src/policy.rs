//! Relay access policy
//!
//! One decision function used for both directions, so a thread blocked
//! inbound is blocked outbound too. The binding is the only per-thread
//! source of truth.

use crate::types::{RoutingFlags, ThreadBinding};

/// Decide whether a message on `binding` may be relayed.
///
/// The global relay flag overrides every per-binding setting. Otherwise the
/// binding must be allowed, `sender_id` must not be denied, and a non-empty
/// allow list must contain it.
pub fn allowed(binding: &ThreadBinding, global_relay: bool, sender_id: Option<&str>) -> bool {
    if global_relay {
        return true;
    }
    flags_allow(&binding.routing_flags, sender_id)
}

fn flags_allow(flags: &RoutingFlags, sender_id: Option<&str>) -> bool {
    if !flags.allow {
        return false;
    }
    let Some(sender) = sender_id else {
        return flags.allow_list.is_empty();
    };
    if flags.deny_list.contains(sender) {
        return false;
    }
    flags.allow_list.is_empty() || flags.allow_list.contains(sender)
}
