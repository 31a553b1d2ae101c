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

//! Background transport sync worker.
//!
//! One thread per endpoint keeps the transport's view of the medium
//! moving: periodic `fetch_inbound` and `push_outbound` calls on
//! independent timers. The worker never touches session state, only
//! the shared transport behind its lock, so the session loop and the
//! worker can only ever race on that lock.

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{consts, transport::SharedTransport};

pub struct SyncWorker {
    stop_tx: crossbeam_channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyncWorker {
    /// Start the fetch/push loop on its own thread. Errors from
    /// either operation are logged and the loop keeps going; the
    /// session layer owns failure policy.
    pub fn spawn(
        name: &str,
        transport: SharedTransport,
        fetch_interval: Duration,
        push_interval: Duration,
    ) -> SyncWorker {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_name = format!("sidessh-sync-{name}");
        let label = String::from(name);

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                run_sync_loop(&label, transport, fetch_interval, push_interval, stop_rx)
            })
            .expect("spawning sync worker thread");

        SyncWorker { stop_tx, handle: Some(handle) }
    }

    /// Signal the loop to stop and join it. The transport must not be
    /// discarded until this returns.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_sync_loop(
    label: &str,
    transport: SharedTransport,
    fetch_interval: Duration,
    push_interval: Duration,
    stop_rx: crossbeam_channel::Receiver<()>,
) {
    info!("sync worker {label} started");
    let fetch_interval = fetch_interval.max(Duration::from_millis(20));
    let push_interval = push_interval.max(Duration::from_millis(20));

    let mut next_fetch = Instant::now();
    let mut next_push = Instant::now();

    loop {
        let now = Instant::now();

        if now >= next_fetch {
            if let Err(e) = transport.lock().unwrap().fetch_inbound() {
                warn!("sync worker {label}: fetch failed: {e}");
            }
            next_fetch = now + fetch_interval;
        }
        if now >= next_push {
            if let Err(e) = transport.lock().unwrap().push_outbound() {
                warn!("sync worker {label}: push failed: {e}");
            }
            next_push = now + push_interval;
        }

        let wait = next_fetch
            .min(next_push)
            .saturating_duration_since(Instant::now())
            .min(consts::SYNC_TICK_CAP);
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
    }
    info!("sync worker {label} stopped");
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use sidessh_protocol::Message;
    use uuid::Uuid;

    use crate::transport::{shared, TransportBackend, TransportError};

    use super::*;

    struct CountingTransport {
        fetches: Arc<AtomicUsize>,
        pushes: Arc<AtomicUsize>,
        fail_pushes: bool,
    }

    impl TransportBackend for CountingTransport {
        fn name(&self) -> String {
            String::from("counting")
        }

        fn snapshot_inbound_cursor(&mut self) -> Option<String> {
            None
        }

        fn read_inbound_messages(
            &mut self,
            _cursor: Option<&str>,
        ) -> Result<(Vec<Message>, Option<String>), TransportError> {
            Ok((Vec::new(), None))
        }

        fn fetch_inbound(&mut self) -> Result<(), TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn write_outbound_message(
            &mut self,
            message: &Message,
        ) -> Result<Uuid, TransportError> {
            Ok(message.msg_id)
        }

        fn push_outbound(&mut self) -> Result<(), TransportError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail_pushes {
                Err(TransportError::Medium(String::from("injected")))
            } else {
                Ok(())
            }
        }

        fn close(&mut self) {}
    }

    #[test]
    fn worker_drives_both_timers_and_stops() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let pushes = Arc::new(AtomicUsize::new(0));
        let transport = shared(Box::new(CountingTransport {
            fetches: fetches.clone(),
            pushes: pushes.clone(),
            fail_pushes: false,
        }));

        let worker = SyncWorker::spawn(
            "test",
            transport,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        thread::sleep(Duration::from_millis(200));
        worker.stop();

        let fetched = fetches.load(Ordering::SeqCst);
        let pushed = pushes.load(Ordering::SeqCst);
        assert!(fetched >= 2, "fetches: {fetched}");
        assert!(pushed >= 2, "pushes: {pushed}");

        // No further work after stop.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fetches.load(Ordering::SeqCst), fetched);
    }

    #[test]
    fn push_failures_do_not_kill_the_loop() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let pushes = Arc::new(AtomicUsize::new(0));
        let transport = shared(Box::new(CountingTransport {
            fetches: fetches.clone(),
            pushes: pushes.clone(),
            fail_pushes: true,
        }));

        let worker = SyncWorker::spawn(
            "flaky",
            transport,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        thread::sleep(Duration::from_millis(150));
        worker.stop();

        assert!(pushes.load(Ordering::SeqCst) >= 2);
        assert!(fetches.load(Ordering::SeqCst) >= 2);
    }
}
