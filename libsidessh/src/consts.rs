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

use std::time;

use uuid::Uuid;

/// How many recently seen msg_ids each endpoint remembers for
/// deduplication before evicting the oldest.
pub const SEEN_CACHE_CAPACITY: usize = 4096;

/// Session id used for diag_ping frames emitted while no session is
/// active. Clients filter on their own session id, so the reserved id
/// only ever shows up in diagnostics.
pub const DIAG_IDLE_SESSION_ID: Uuid = Uuid::nil();

pub const DEFAULT_BRANCH_C2S: &str = "gitssh-c2s";
pub const DEFAULT_BRANCH_S2C: &str = "gitssh-s2c";

pub const DEFAULT_DRIVE_LOG_C2S: &str = "gitssh2-c2s.log";
pub const DEFAULT_DRIVE_LOG_S2C: &str = "gitssh2-s2c.log";

/// How long the sync worker sleeps at most between timer checks, so a
/// stop request is always observed promptly.
pub const SYNC_TICK_CAP: time::Duration = time::Duration::from_millis(100);
