// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-worker scratch state.
//!
//! Codec writers, compression buffers and field-group scratch are kept in
//! `thread_local!` cells: the first use on a worker thread builds the
//! instance, later uses on the same thread reuse it without locking. A nested
//! borrow of the same cell falls back to a throw-away instance.

use std::cell::RefCell;
use std::thread::LocalKey;

use tracing::trace;

pub fn with_scratch<T, R>(
    key: &'static LocalKey<RefCell<T>>,
    make: impl FnOnce() -> T,
    f: impl FnOnce(&mut T) -> R,
) -> R
where
    T: 'static,
{
    key.with(|cell| match cell.try_borrow_mut() {
        Ok(mut scratch) => f(&mut scratch),
        Err(_) => {
            trace!(
                "scratch {} already borrowed on this thread, using a temporary one",
                std::any::type_name::<T>()
            );
            let mut scratch = make();
            f(&mut scratch)
        }
    })
}
