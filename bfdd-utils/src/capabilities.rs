//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use capctl::caps::{Cap, CapState};
use tracing::error;

// Network capabilities the socket setup paths are allowed to use.
const NET_CAPS: [Cap; 2] = [Cap::NET_ADMIN, Cap::NET_RAW];

/// Runs the provided closure with the network capabilities raised.
///
/// The hosting process is expected to keep these capabilities in its
/// permitted set while normally running with a cleared effective set; they
/// are raised only around socket setup and dropped again before returning.
/// Capabilities missing from the permitted set are skipped, so an
/// unprivileged process simply runs the closure as-is.
pub fn raise_net<F, R>(cb: F) -> R
where
    F: FnOnce() -> R,
{
    let mut caps = match CapState::get_current() {
        Ok(caps) => caps,
        Err(error) => {
            error!("failed to read current capabilities: {}", error);
            return cb();
        }
    };

    // Raise the available network capabilities.
    let raised: Vec<_> = NET_CAPS
        .into_iter()
        .filter(|cap| caps.permitted.has(*cap) && !caps.effective.has(*cap))
        .collect();
    if !raised.is_empty() {
        for cap in &raised {
            caps.effective.add(*cap);
        }
        if let Err(error) = caps.set_current() {
            error!("failed to update current capabilities: {}", error);
        }
    }

    // Run closure.
    let ret = cb();

    // Drop the raised capabilities again.
    if !raised.is_empty() {
        for cap in &raised {
            caps.effective.drop(*cap);
        }
        if let Err(error) = caps.set_current() {
            error!("failed to update current capabilities: {}", error);
        }
    }

    // Return the closure's return value.
    ret
}
