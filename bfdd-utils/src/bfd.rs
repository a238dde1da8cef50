//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// BFD session state.
//
// The numeric values are the on-the-wire encoding (RFC 5880, Section 4.1)
// and also the state byte of the records written to the event sink.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    AdminDown = 0,
    Down = 1,
    Init = 2,
    Up = 3,
}
