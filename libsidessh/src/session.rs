// Copyright 2023 Google LLC
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

//! Per-endpoint session bookkeeping: outgoing sequence numbers and the
//! bounded cache of recently seen inbound message ids.

use std::{
    collections::{HashSet, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
};

use uuid::Uuid;

use crate::consts;

/// Monotonic counter for an endpoint's outgoing `seq` values.
///
/// Starts at zero; `next()` hands out 1, 2, 3, ... and is safe to call
/// from multiple producer threads sharing one endpoint.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    value: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter { value: AtomicU64::new(0) }
    }

    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A bounded ordered set of recently observed message ids with FIFO
/// eviction. `mark` returns true only the first time an id is seen
/// among the last `capacity` distinct ids.
///
/// Callers hold the session lock while touching this, so there is no
/// internal locking.
#[derive(Debug)]
pub struct SeenMessageCache {
    capacity: usize,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenMessageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SeenMessageCache {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an id, reporting whether it was newly seen.
    pub fn mark(&mut self, msg_id: Uuid) -> bool {
        if self.seen.contains(&msg_id) {
            return false;
        }

        self.seen.insert(msg_id);
        self.order.push_back(msg_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenMessageCache {
    fn default() -> Self {
        SeenMessageCache::new(consts::SEEN_CACHE_CAPACITY)
    }
}

/// The mutable state one endpoint keeps for one logical session.
///
/// Created on connect and dropped on disconnect, so both the sequence
/// counter and the dedup cache reset with each new session.
#[derive(Debug)]
pub struct EndpointState {
    pub session_id: Uuid,
    pub outgoing_seq: SequenceCounter,
    pub incoming_seen: SeenMessageCache,
}

impl EndpointState {
    pub fn new(session_id: Uuid) -> Self {
        EndpointState {
            session_id,
            outgoing_seq: SequenceCounter::new(),
            incoming_seen: SeenMessageCache::default(),
        }
    }
}
