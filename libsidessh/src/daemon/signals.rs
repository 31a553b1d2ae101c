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

use std::sync::{atomic::AtomicBool, Arc};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag};
use tracing::info;

/// Arrange for termination signals to raise the shared stop flag so
/// the serve loop can wind down gracefully. A second signal while the
/// flag is already up exits immediately, so a user mashing ^C is
/// never stuck waiting on a graceful shutdown.
pub fn register_shutdown(stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    info!("registering shutdown signal handlers");
    for sig in TERM_SIGNALS {
        // Two handlers per signal: the conditional shutdown only fires
        // once `stop` is already true, i.e. on the second delivery,
        // and the plain flag registration is what raises `stop` on the
        // first one. Registering them in the other order would make a
        // single signal both raise the flag and immediately exit.
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&stop))
            .context("registering conditional shutdown")?;
        flag::register(*sig, Arc::clone(&stop)).context("registering stop flag")?;
    }
    Ok(())
}
