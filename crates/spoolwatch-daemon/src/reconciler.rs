// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The reconciler: drives every catalogue entry's state machine toward the
// local print service.
//
// One pass walks the catalogue in order and acts on each entry whose
// deadline has passed: create or update the local queue, retire it, or
// drop the entry.  Failures reschedule the entry rather than losing it;
// queues holding jobs or serving as the user's default are never removed
// until they no longer do.

use tracing::{debug, info, warn};

use crate::catalogue::{timeout, Catalogue, DescriptionSource, PrinterStatus};
use crate::clock::offset;
use crate::cups::{QueueOps, QueueSpec};
use crate::daemon::Daemon;

/// Outcome of one pass, for auto-shutdown bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub removed_any: bool,
}

impl Daemon {
    /// Run one reconcile pass and re-arm the timer.
    pub(crate) async fn reconcile_pass(&mut self) {
        debug!("processing printer list");
        // Our own queue mutations must not be mis-read as external
        // configuration changes.
        self.view.set_inhibit(true);
        let outcome = reconcile_catalogue(
            &mut self.catalogue,
            &self.cups,
            self.clock.now(),
            self.config.browse_timeout,
        )
        .await;
        self.view.set_inhibit(false);

        if outcome.removed_any {
            self.note_catalogue_shrunk();
        }
        self.rearm_reconciler();
    }
}

/// Walk the catalogue once.  Entries are scanned by cursor; removal
/// happens at the cursor so iteration stays valid.
pub async fn reconcile_catalogue<Q: QueueOps>(
    catalogue: &mut Catalogue,
    queues: &Q,
    now: u64,
    browse_timeout: u64,
) -> PassOutcome {
    let mut outcome = PassOutcome::default();
    let mut index = 0;

    while index < catalogue.len() {
        let entry = match catalogue.get_mut(index) {
            Some(entry) => entry,
            None => break,
        };

        // A stale leftover from a previous session that was never
        // re-confirmed is retired in the same pass.
        if entry.status == PrinterStatus::Unconfirmed {
            if !entry.due(now) {
                index += 1;
                continue;
            }
            info!(name = %entry.name, "no remote printer re-confirmed this queue, removing");
            entry.status = PrinterStatus::Disappeared;
            entry.deadline = Some(offset(now, timeout::IMMEDIATELY));
        }

        match entry.status {
            PrinterStatus::Disappeared => {
                if !entry.due(now) {
                    index += 1;
                    continue;
                }
                if entry.duplicate {
                    // Standby records never own a queue; just drop them.
                    debug!(name = %entry.name, host = %entry.host, "removing standby entry");
                    catalogue.remove(index);
                    outcome.removed_any = true;
                    continue;
                }

                match retire_queue(queues, &entry.name).await {
                    Retire::Retry(reason) => {
                        debug!(name = %entry.name, reason, "queue removal deferred");
                        entry.deadline = Some(offset(now, timeout::RETRY));
                        index += 1;
                    }
                    Retire::Removed => {
                        info!(name = %entry.name, "removed queue and entry");
                        catalogue.remove(index);
                        outcome.removed_any = true;
                    }
                }
            }

            PrinterStatus::ToBeCreated | PrinterStatus::BrowsePacketReceived => {
                if entry.duplicate {
                    entry.deadline = None;
                    index += 1;
                    continue;
                }
                if !entry.due(now) {
                    index += 1;
                    continue;
                }

                debug!(name = %entry.name, uri = %entry.uri, "creating/updating queue");
                let artefact = match &entry.description {
                    DescriptionSource::Raw => None,
                    DescriptionSource::DescriptionFile(path)
                    | DescriptionSource::InterfaceScript(path) => Some(path.to_path_buf()),
                };
                let spec = QueueSpec {
                    name: &entry.name,
                    device_uri: &entry.uri,
                    info: &entry.service_name,
                    location: &entry.host,
                    artefact: artefact.as_deref(),
                };

                match queues.create_queue(&spec).await {
                    Err(err) => {
                        warn!(name = %entry.name, %err, "unable to create queue");
                        entry.deadline = Some(offset(now, timeout::RETRY));
                    }
                    Ok(()) => {
                        // The artefact has served its purpose; dropping the
                        // temp path deletes the file.
                        entry.description = DescriptionSource::Raw;
                        if entry.status == PrinterStatus::BrowsePacketReceived {
                            entry.status = PrinterStatus::Disappeared;
                            entry.deadline = Some(now + browse_timeout);
                            debug!(
                                name = %entry.name,
                                browse_timeout,
                                "queue on lease, awaiting re-assertion"
                            );
                        } else {
                            entry.status = PrinterStatus::Confirmed;
                            entry.deadline = None;
                        }
                    }
                }
                index += 1;
            }

            // Steady state.
            PrinterStatus::Confirmed | PrinterStatus::Unconfirmed => {
                index += 1;
            }
        }
    }

    outcome
}

enum Retire {
    /// Deletion deferred; try again after `RETRY`.
    Retry(&'static str),
    /// Queue gone (or never ours to delete); drop the entry.
    Removed,
}

/// Delete a local queue, unless user intent says otherwise.
async fn retire_queue<Q: QueueOps>(queues: &Q, name: &str) -> Retire {
    // A queue with jobs keeps running until they drain.
    match queues.active_jobs(name).await {
        Err(_) => return Retire::Retry("print service unreachable"),
        Ok(jobs) if jobs > 0 => return Retire::Retry("queue still has jobs"),
        Ok(_) => {}
    }

    // The user's default printer is preserved indefinitely.
    if let Ok(Some(default)) = queues.default_printer().await {
        if default.eq_ignore_ascii_case(name) {
            return Retire::Retry("queue is the system default");
        }
    }

    match queues.delete_queue(name).await {
        Ok(()) => Retire::Removed,
        Err(_) => Retire::Retry("delete request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    use crate::catalogue::{NextWake, RemotePrinterEntry};
    use spoolwatch_core::error::{Result, SpoolwatchError};

    #[derive(Default)]
    struct MockQueues {
        jobs: HashMap<String, usize>,
        default: Option<String>,
        unreachable: bool,
        fail_create: bool,
        created: RefCell<Vec<String>>,
        deleted: RefCell<Vec<String>>,
    }

    impl QueueOps for MockQueues {
        async fn active_jobs(&self, queue: &str) -> Result<usize> {
            if self.unreachable {
                return Err(SpoolwatchError::PrintService("unreachable".into()));
            }
            Ok(self.jobs.get(queue).copied().unwrap_or(0))
        }

        async fn default_printer(&self) -> Result<Option<String>> {
            Ok(self.default.clone())
        }

        async fn create_queue(&self, spec: &QueueSpec<'_>) -> Result<()> {
            if self.fail_create {
                return Err(SpoolwatchError::IppRequest("add-modify failed".into()));
            }
            self.created
                .borrow_mut()
                .push(format!("{}={}", spec.name, spec.device_uri));
            Ok(())
        }

        async fn delete_queue(&self, queue: &str) -> Result<()> {
            self.deleted.borrow_mut().push(queue.to_string());
            Ok(())
        }
    }

    fn entry(name: &str, status: PrinterStatus, deadline: Option<u64>) -> RemotePrinterEntry {
        RemotePrinterEntry {
            name: name.into(),
            uri: format!("ipp://host:631/printers/{name}"),
            host: "host".into(),
            service_name: String::new(),
            service_type: String::new(),
            service_domain: String::new(),
            status,
            deadline,
            duplicate: false,
            description: DescriptionSource::Raw,
        }
    }

    #[tokio::test]
    async fn creates_queue_and_confirms() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::ToBeCreated, Some(0)));
        let queues = MockQueues::default();

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        let e = cat.get(0).unwrap();
        assert_eq!(e.status, PrinterStatus::Confirmed);
        assert_eq!(e.deadline, None);
        assert_eq!(
            queues.created.borrow().as_slice(),
            ["laser=ipp://host:631/printers/laser"]
        );
    }

    #[tokio::test]
    async fn browse_packet_queue_goes_on_lease() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::BrowsePacketReceived, Some(0)));
        let queues = MockQueues::default();

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        let e = cat.get(0).unwrap();
        assert_eq!(e.status, PrinterStatus::Disappeared);
        assert_eq!(e.deadline, Some(310));
        assert_eq!(queues.created.borrow().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_schedules_retry() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::ToBeCreated, Some(0)));
        let queues = MockQueues {
            fail_create: true,
            ..Default::default()
        };

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        let e = cat.get(0).unwrap();
        assert_eq!(e.status, PrinterStatus::ToBeCreated);
        assert_eq!(e.deadline, Some(20));
    }

    #[tokio::test]
    async fn duplicates_never_touch_the_print_service() {
        let mut cat = Catalogue::new();
        let mut standby = entry("laser", PrinterStatus::ToBeCreated, Some(0));
        standby.duplicate = true;
        cat.insert(standby);
        let mut gone = entry("laser", PrinterStatus::Disappeared, Some(0));
        gone.duplicate = true;
        gone.host = "other".into();
        cat.insert(gone);
        let queues = MockQueues::default();

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        assert!(queues.created.borrow().is_empty());
        assert!(queues.deleted.borrow().is_empty());
        // The to-be-created standby is parked, the disappeared one is gone.
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.get(0).unwrap().deadline, None);
    }

    #[tokio::test]
    async fn active_jobs_defer_removal_then_removed() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::Disappeared, Some(0)));
        let mut queues = MockQueues::default();
        queues.jobs.insert("laser".into(), 1);

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.get(0).unwrap().deadline, Some(20));
        assert!(queues.deleted.borrow().is_empty());

        // Jobs drained; next due pass deletes the queue and the entry.
        queues.jobs.clear();
        reconcile_catalogue(&mut cat, &queues, 20, 300).await;
        assert!(cat.is_empty());
        assert_eq!(queues.deleted.borrow().as_slice(), ["laser"]);
    }

    #[tokio::test]
    async fn default_printer_is_preserved() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::Disappeared, Some(0)));
        let queues = MockQueues {
            default: Some("Laser".into()),
            ..Default::default()
        };

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        assert_eq!(cat.len(), 1);
        assert_eq!(cat.get(0).unwrap().deadline, Some(20));
        assert!(queues.deleted.borrow().is_empty());
    }

    #[tokio::test]
    async fn unreachable_service_retries() {
        let mut cat = Catalogue::new();
        cat.insert(entry("laser", PrinterStatus::Disappeared, Some(0)));
        let queues = MockQueues {
            unreachable: true,
            ..Default::default()
        };

        let outcome = reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        assert!(!outcome.removed_any);
        assert_eq!(cat.get(0).unwrap().deadline, Some(20));
    }

    #[tokio::test]
    async fn unconfirmed_falls_through_to_removal() {
        let mut cat = Catalogue::new();
        cat.insert(entry("stale", PrinterStatus::Unconfirmed, Some(5)));
        let queues = MockQueues::default();

        let outcome = reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        assert!(outcome.removed_any);
        assert!(cat.is_empty());
        assert_eq!(queues.deleted.borrow().as_slice(), ["stale"]);
    }

    #[tokio::test]
    async fn pass_leaves_no_past_deadline() {
        // After a pass every remaining deadline is in the future, or the
        // catalogue is all steady state.
        let mut cat = Catalogue::new();
        cat.insert(entry("a", PrinterStatus::ToBeCreated, Some(0)));
        cat.insert(entry("b", PrinterStatus::Disappeared, Some(5)));
        let mut queues = MockQueues::default();
        queues.jobs.insert("b".into(), 2);

        let now = 10;
        reconcile_catalogue(&mut cat, &queues, now, 300).await;

        match cat.next_wake(now) {
            NextWake::Idle => {}
            NextWake::At(at) => assert!(at > now),
            NextWake::Immediate => panic!("pass left a past deadline"),
        }
    }

    #[tokio::test]
    async fn not_yet_due_entries_untouched() {
        let mut cat = Catalogue::new();
        cat.insert(entry("later", PrinterStatus::ToBeCreated, Some(100)));
        let queues = MockQueues::default();

        reconcile_catalogue(&mut cat, &queues, 10, 300).await;

        assert_eq!(cat.get(0).unwrap().status, PrinterStatus::ToBeCreated);
        assert!(queues.created.borrow().is_empty());
    }
}
