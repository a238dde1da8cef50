//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cell::RefCell;

use bytes::BytesMut;

// Scratch buffer shared by the encode paths. The event loop is single
// threaded, so a thread-local is enough to make reuse safe.
thread_local!(
    pub static TLS_BUF: RefCell<BytesMut> =
        RefCell::new(BytesMut::with_capacity(65536))
);
