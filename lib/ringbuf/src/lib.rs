// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for the update drivers
//!
//! Every driver in this workspace records what it does into a static ring
//! buffer of small `Copy` events instead of formatting log lines. The buffer
//! lives in RAM, where a debugger or a post-mortem dump can read it back.
//!
//! ## Constraints
//!
//! The payload type must implement both `Copy` and `PartialEq`. The latter is
//! used to coalesce repeated events: recording the same payload from the same
//! source line as the most recent entry bumps that entry's `count` rather than
//! consuming a new slot.
//!
//! If you use the variants of the macros that leave the name of the buffer
//! implicit, you can only have one per module.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     Erase { addr: u32 },
//!     EraseFailed { addr: u32 },
//! }
//!
//! ringbuf!(Trace, 32, Trace::None);
//!
//! ringbuf_entry!(Trace::Erase { addr });
//! ```
//!
//! A name can be given when more than one buffer is wanted:
//!
//! ```ignore
//! ringbuf!(SWAP_RINGBUF, Trace, 64, Trace::None);
//! ringbuf_entry!(SWAP_RINGBUF, Trace::Erase { addr });
//! ```
//!
//! ## Reading a ring buffer
//!
//! With symbols loaded, GDB prints a buffer directly, e.g.
//! `print drv_ota_flash::__RINGBUF`. The `last` field names the most recent
//! slot; `generation` tells a freshly-written slot from a stale one after the
//! buffer has wrapped. On the host, [`Ringbuf::iter`] walks the live entries
//! from oldest to newest.
//!
//! ## Locking
//!
//! The buffer sits behind a spin mutex. On the target nothing ever contends
//! for it (drivers are single threaded and do not record from interrupt
//! handlers); on the host it keeps parallel test threads from tearing entries.

#![cfg_attr(not(test), no_std)]

/// Re-export the lock so that code generated by the macros is guaranteed to
/// be able to find it.
pub use spin::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The actual type of `NAME` will be `Mutex<Ringbuf<T, N>>`.
///
/// If you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Mutex<$crate::Ringbuf<$t, $n>> =
            $crate::Mutex::new($crate::Ringbuf::new($init));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`; without a name it defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before taking the lock, so a payload
        // expression that itself records an entry cannot deadlock.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(
            &mut *$crate::Mutex::lock(buf),
            line!() as u16,
            p,
        );
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single slot. `count` is zero for a slot that has never been written.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. Normally declared through
/// [`ringbuf!`] rather than by hand.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // An empty buffer is treated as if `last` were out of range, which
        // lands the first entry in slot 0 without a special case.
        let last = self.last.unwrap_or(usize::MAX);

        // `get_mut` also covers a corrupted `last`; we just start over at 0.
        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Compare rather than take a remainder: most of our targets have no
        // hardware divide, and this also turns usize::MAX into 0.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Zero-sized buffer.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|ndx| self.buffer.get(ndx))
    }

    /// Walks every written entry, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(ndx) if ndx < N => ndx + 1,
            _ => 0,
        };
        (0..N)
            .map(move |i| {
                let ndx = start + i;
                &self.buffer[if ndx >= N { ndx - N } else { ndx }]
            })
            .filter(|ent| ent.count != 0)
    }
}
