//! Incremental suite discovery.
//!
//! Discovery runs as a child of the primary master and interleaves with
//! dispatch: suites already known from history start running while the walk
//! is still finding the rest. Each discovered suite travels over a fresh
//! connection as a `NEW SUITE` message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, warn};

use crate::framework::TestFramework;
use crate::protocol::{Endpoint, MasterClient, RunToken};

/// Discovery process entry point.
///
/// Walks every candidate file and reports each suite it finds. A `SIGINT`
/// from the master (sent once a whitelist is fully satisfied) sets a flag
/// that is checked between suites, so winding down early is cheap. Exits 0
/// on completion or interrupt, non-zero only on enumeration failure.
pub async fn discovery_main(
    endpoint: Endpoint,
    token: RunToken,
    framework: Arc<dyn TestFramework>,
) -> i32 {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            match signal(SignalKind::interrupt()) {
                Ok(mut interrupt) => {
                    interrupt.recv().await;
                    stop.store(true, Ordering::SeqCst);
                }
                Err(e) => warn!("Failed to install INT handler: {}", e),
            }
        });
    }

    let client = MasterClient::new(endpoint, token);
    let files = match framework.suite_files().await {
        Ok(files) => files,
        Err(e) => {
            error!("Suite file enumeration failed: {}", e);
            return 1;
        }
    };

    'files: for file in files {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let suites = match framework.suites_in_file(&file).await {
            Ok(suites) => suites,
            Err(e) => {
                error!("Failed to enumerate suites in {}: {}", file.display(), e);
                return 1;
            }
        };
        for suite in suites {
            if stop.load(Ordering::SeqCst) {
                break 'files;
            }
            if let Err(e) = client.new_suite(&suite.id).await {
                debug!("Master gone, stopping discovery: {}", e);
                break 'files;
            }
        }
    }
    0
}

/// The master's handle on a running discovery child.
pub struct DiscoveryChild {
    child: Child,
}

impl DiscoveryChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking exit check; reaps the child once it has exited.
    pub fn poll(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask the child to wind down gracefully.
    pub fn interrupt(&self) {
        if let Some(pid) = self.child.id() {
            debug!("Interrupting discovery pid {}", pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Hard-kill and reap, for abort paths.
    pub async fn shutdown(mut self) {
        if let Some(pid) = self.child.id() {
            debug!("Killing discovery pid {}", pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        self.child.wait().await.ok();
    }
}
