// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Snapshot of the queues currently defined in the local print service.
//
// When the service supports event subscriptions the view only re-enumerates
// after a printer event (or an expired lease); otherwise every refresh is a
// full enumeration.  While the reconciler is creating or deleting queues
// the view is inhibited so the daemon's own mutations are not mis-read as
// external configuration.

use std::collections::HashMap;

use tracing::{debug, warn};

use spoolwatch_core::error::Result;

use crate::cups::{IppService, LocalPrinter, NotifyPoll};

#[derive(Debug, Clone, Copy)]
enum Subscription {
    /// Not yet attempted.
    Untried,
    /// Active pull subscription.
    Active { id: i32, last_seq: i32 },
    /// The service rejected subscriptions; always enumerate.
    Unsupported,
}

/// The local printer view, keyed by lower-cased queue name.
#[derive(Debug)]
pub struct LocalPrinterView {
    printers: HashMap<String, LocalPrinter>,
    inhibit: bool,
    subscription: Subscription,
    /// notify-time-interval requested on the subscription.
    interval: u64,
}

impl LocalPrinterView {
    pub fn new(interval: u64) -> Self {
        Self {
            printers: HashMap::new(),
            inhibit: false,
            subscription: Subscription::Untried,
            interval,
        }
    }

    /// Suppress refreshes while the daemon mutates queues itself.
    pub fn set_inhibit(&mut self, inhibit: bool) {
        self.inhibit = inhibit;
    }

    pub fn get(&self, name: &str) -> Option<&LocalPrinter> {
        self.printers.get(&name.to_ascii_lowercase())
    }

    /// Any queue (ours or foreign) already using this device URI.
    pub fn find_by_uri(&self, uri: &str) -> Option<&LocalPrinter> {
        self.printers.values().find(|p| p.device_uri == uri)
    }

    /// Queues carrying the owner sentinel.
    pub fn daemon_controlled(&self) -> impl Iterator<Item = &LocalPrinter> {
        self.printers.values().filter(|p| p.daemon_controlled)
    }

    /// Replace the snapshot wholesale (also the test seam).
    pub fn replace(&mut self, printers: Vec<LocalPrinter>) {
        self.printers = printers
            .into_iter()
            .map(|p| (p.name.to_ascii_lowercase(), p))
            .collect();
    }

    /// Refresh the view, enumerating only when necessary.
    pub async fn refresh(&mut self, service: &IppService) -> Result<()> {
        if self.inhibit {
            return Ok(());
        }

        let enumerate = match self.subscription {
            Subscription::Untried => {
                match service.create_subscription(self.interval).await {
                    Ok(id) => {
                        self.subscription = Subscription::Active { id, last_seq: 0 };
                    }
                    Err(err) => {
                        debug!(%err, "local print service refused subscription");
                        self.subscription = Subscription::Unsupported;
                    }
                }
                true
            }
            Subscription::Active { id, last_seq } => {
                match service.get_notifications(id, last_seq).await {
                    NotifyPoll::Quiet => false,
                    NotifyPoll::Events { last_seq } => {
                        self.subscription = Subscription::Active { id, last_seq };
                        true
                    }
                    NotifyPoll::Expired => {
                        debug!("local subscription lease expired, recreating");
                        match service.create_subscription(self.interval).await {
                            Ok(id) => {
                                self.subscription = Subscription::Active { id, last_seq: 0 };
                            }
                            Err(err) => {
                                warn!(%err, "could not recreate local subscription");
                                self.subscription = Subscription::Unsupported;
                            }
                        }
                        true
                    }
                    NotifyPoll::Failed => {
                        service.cancel_subscription(id).await;
                        self.subscription = Subscription::Unsupported;
                        true
                    }
                }
            }
            Subscription::Unsupported => true,
        };

        if enumerate {
            self.replace(service.get_local_printers().await?);
        }
        Ok(())
    }

    /// Drop the subscription on shutdown.
    pub async fn shutdown(&mut self, service: &IppService) {
        if let Subscription::Active { id, .. } = self.subscription {
            service.cancel_subscription(id).await;
        }
        self.subscription = Subscription::Untried;
    }
}
