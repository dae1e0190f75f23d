// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Poll workers: one task per configured upstream print server.
//
// Each worker prefers the subscription/notification protocol and only
// re-enumerates the server's shared printers when something changed or the
// subscription is unavailable.  Quiet cycles re-assert the previously seen
// printers so their lease deadlines stay fresh.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use spoolwatch_core::config::PollTarget;

use crate::cups::{IppService, NotifyPoll, PolledPrinter};
use crate::daemon::DaemonEvent;

/// Connect probe timeout; a dead server must not stall the cycle.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct PollWorker {
    service: IppService,
    server: String,
    interval: u64,
    can_subscribe: bool,
    subscription_id: Option<i32>,
    sequence_number: i32,
    known: Vec<PolledPrinter>,
    tx: mpsc::Sender<DaemonEvent>,
}

/// Spawn a worker for one `BrowsePoll` target.
pub fn spawn_poller(
    target: PollTarget,
    interval: u64,
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker = PollWorker {
            service: IppService::new(&target.server, target.port, target.version),
            server: target.server,
            interval,
            can_subscribe: true,
            subscription_id: None,
            sequence_number: 0,
            known: Vec::new(),
            tx,
        };
        info!(server = %worker.server, interval, "browse polling");

        loop {
            if worker.cycle().await.is_err() {
                // Daemon loop is gone.
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(worker.interval)) => {}
            }
        }

        if let Some(id) = worker.subscription_id {
            worker.service.cancel_subscription(id).await;
        }
        debug!(server = %worker.server, "poll worker stopped");
    })
}

impl PollWorker {
    /// One poll cycle.  `Err` only when the daemon loop has gone away.
    async fn cycle(&mut self) -> Result<(), ()> {
        debug!(server = %self.server, "browse polling");

        if !self.connect_probe().await {
            warn!(server = %self.server, "failed to connect, will retry");
            return Ok(());
        }

        let mut get_printers = false;
        if self.can_subscribe {
            match self.subscription_id {
                None => {
                    self.create_subscription().await;
                    get_printers = true;
                }
                Some(id) => match self
                    .service
                    .get_notifications(id, self.sequence_number)
                    .await
                {
                    NotifyPoll::Quiet => {
                        debug!(server = %self.server, "no printer events");
                    }
                    NotifyPoll::Events { last_seq } => {
                        debug!(server = %self.server, last_seq, "printer events seen");
                        self.sequence_number = last_seq;
                        get_printers = true;
                    }
                    NotifyPoll::Expired => {
                        debug!(server = %self.server, "subscription lease expired");
                        self.create_subscription().await;
                        get_printers = true;
                    }
                    NotifyPoll::Failed => {
                        self.can_subscribe = false;
                        self.service.cancel_subscription(id).await;
                        self.subscription_id = None;
                        self.sequence_number = 0;
                        get_printers = true;
                    }
                },
            }
        } else {
            get_printers = true;
        }

        if get_printers {
            match self.service.get_shared_printers().await {
                Ok(printers) => {
                    self.known = printers.clone();
                    self.send(printers, true).await?;
                }
                Err(err) => {
                    warn!(server = %self.server, %err, "CUPS-Get-Printers failed");
                }
            }
        } else if !self.known.is_empty() {
            // Keepalive: refresh the lease deadlines of everything we
            // already know about.
            self.send(self.known.clone(), false).await?;
        }

        Ok(())
    }

    async fn create_subscription(&mut self) {
        match self.service.create_subscription(self.interval).await {
            Ok(id) => {
                self.subscription_id = Some(id);
                self.sequence_number = 0;
            }
            Err(err) => {
                debug!(server = %self.server, %err, "server does not support subscriptions");
                self.can_subscribe = false;
                self.subscription_id = None;
            }
        }
    }

    async fn connect_probe(&self) -> bool {
        let addr = format!("{}:{}", self.service.host(), self.service.port());
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    async fn send(&self, printers: Vec<PolledPrinter>, fresh: bool) -> Result<(), ()> {
        self.tx
            .send(DaemonEvent::PolledPrinters {
                server: self.server.clone(),
                printers,
                fresh,
            })
            .await
            .map_err(|_| ())
    }
}
