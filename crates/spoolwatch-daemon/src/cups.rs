// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP client for the local print service and for polled remote servers.
//
// Every RPC the daemon performs goes through `IppService`: queue CRUD,
// job listing, default-printer query, and the subscription/notification
// protocol used both by the local printer view and by the poll workers.
// The reconciler talks to the `QueueOps` seam so its state machine can be
// exercised against a mock in tests.

use std::path::Path;
use std::time::Duration;

use ipp::prelude::*;
use tracing::{debug, warn};

use spoolwatch_core::error::{Result, SpoolwatchError};

/// Option name stamped on every queue the daemon creates.  Queues without
/// it are externally owned and are never deleted.
pub const OWNER_SENTINEL: &str = "spoolwatch";

/// The sentinel as it appears among a queue's printer attributes.
pub const OWNER_OPTION: &str = "spoolwatch-default";

/// Events subscribed to on local and polled print services.
pub const PRINTER_EVENTS: [&str; 6] = [
    "printer-added",
    "printer-changed",
    "printer-config-changed",
    "printer-modified",
    "printer-deleted",
    "printer-state-changed",
];

/// CUPS printer-type bits used in Get-Printers filtering and browse
/// packets.
pub mod printer_type {
    pub const REMOTE: u32 = 0x0002;
    pub const IMPLICIT: u32 = 0x1_0000;
    pub const DELETE: u32 = 0x10_0000;
    pub const NOT_SHARED: u32 = 0x20_0000;
}

/// Request timeout for every RPC; remote servers must not stall the loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One queue as seen in the local print service.
#[derive(Debug, Clone)]
pub struct LocalPrinter {
    pub name: String,
    pub device_uri: String,
    /// Whether the owner sentinel identifies this daemon as creator.
    pub daemon_controlled: bool,
}

/// One shared printer as reported by a polled print server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledPrinter {
    pub uri: String,
    pub info: String,
}

/// Everything ADD_MODIFY needs for one queue.
#[derive(Debug)]
pub struct QueueSpec<'a> {
    pub name: &'a str,
    pub device_uri: &'a str,
    /// Shown as printer-info (the discovery service name).
    pub info: &'a str,
    /// Shown as printer-location (the remote host).
    pub location: &'a str,
    /// Description file or interface script to attach, if any.
    pub artefact: Option<&'a Path>,
}

/// Outcome of a Get-Notifications poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPoll {
    /// Subscription lease expired (`client-error-not-found`).
    Expired,
    /// Request failed; subscription should be cancelled.
    Failed,
    /// No printer events since the last sequence number.
    Quiet,
    /// Printer events seen; highest sequence number observed.
    Events { last_seq: i32 },
}

/// Operations the reconciler performs against the local print service.
#[allow(async_fn_in_trait)]
pub trait QueueOps {
    async fn active_jobs(&self, queue: &str) -> Result<usize>;
    async fn default_printer(&self) -> Result<Option<String>>;
    async fn create_queue(&self, spec: &QueueSpec<'_>) -> Result<()>;
    async fn delete_queue(&self, queue: &str) -> Result<()>;
}

/// IPP endpoint for one print service (local or polled).
#[derive(Debug, Clone)]
pub struct IppService {
    host: String,
    port: u16,
    /// Pinned request version, or `None` for the client default.
    version: Option<(u8, u8)>,
    user: String,
}

impl IppService {
    pub fn new(host: &str, port: u16, version: Option<(u8, u8)>) -> Self {
        Self {
            host: host.to_string(),
            port,
            version,
            user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
        }
    }

    /// The local print service.
    pub fn local() -> Self {
        Self::new("localhost", 631, None)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn endpoint(&self, path: &str) -> Result<Uri> {
        let uri = format!("http://{}:{}{}", self.host, self.port, path);
        uri.parse()
            .map_err(|err| SpoolwatchError::IppRequest(format!("invalid URI '{uri}': {err}")))
    }

    /// Queue URI used in printer-uri operation attributes.
    fn queue_uri(&self, queue: &str) -> String {
        format!("ipp://{}:{}/printers/{}", self.host, self.port, queue)
    }

    fn new_request(&self, operation: Operation, uri: &str) -> Result<IppRequestResponse> {
        let parsed: Uri = uri
            .parse()
            .map_err(|err| SpoolwatchError::IppRequest(format!("invalid URI '{uri}': {err}")))?;
        let version = match self.version {
            Some((1, 0)) => IppVersion::v1_0(),
            Some((2, 0)) => IppVersion::v2_0(),
            Some((2, 1)) => IppVersion::v2_1(),
            Some((2, 2)) => IppVersion::v2_2(),
            _ => IppVersion::v1_1(),
        };
        let mut request = IppRequestResponse::new(version, operation, Some(parsed));
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requesting-user-name",
                IppValue::NameWithoutLanguage(self.user.clone()),
            ),
        );
        Ok(request)
    }

    async fn send(&self, path: &str, request: IppRequestResponse) -> Result<IppRequestResponse> {
        let client = AsyncIppClient::builder(self.endpoint(path)?)
            .request_timeout(REQUEST_TIMEOUT)
            .ignore_tls_errors(true)
            .build();
        client
            .send(request)
            .await
            .map_err(|err| SpoolwatchError::PrintService(format!("{}:{}: {err}", self.host, self.port)))
    }

    /// Send and require a successful status code.
    async fn send_checked(
        &self,
        path: &str,
        request: IppRequestResponse,
    ) -> Result<IppRequestResponse> {
        let response = self.send(path, request).await?;
        let status = response.header().status_code();
        if !status.is_success() {
            return Err(SpoolwatchError::IppRequest(format!(
                "{}:{} returned {status:?}",
                self.host, self.port
            )));
        }
        Ok(response)
    }

    // -- queue enumeration ---------------------------------------------------

    /// All queues defined by this print service, with the owner sentinel.
    pub async fn get_local_printers(&self) -> Result<Vec<LocalPrinter>> {
        let mut request = self.new_request(
            Operation::CupsGetPrinters,
            &format!("ipp://{}:{}/", self.host, self.port),
        )?;
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requested-attributes",
                IppValue::Array(vec![
                    IppValue::Keyword("printer-name".into()),
                    IppValue::Keyword("device-uri".into()),
                    IppValue::Keyword(OWNER_OPTION.into()),
                ]),
            ),
        );

        let response = self.send_checked("/", request).await?;
        let mut printers = Vec::new();
        for group in response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
        {
            let attrs = group.attributes();
            let Some(name) = attrs.get("printer-name").map(|a| a.value().to_string()) else {
                continue;
            };
            let device_uri = attrs
                .get("device-uri")
                .map(|a| a.value().to_string())
                .unwrap_or_default();
            let daemon_controlled = attrs
                .get(OWNER_OPTION)
                .map(|a| {
                    let value = a.value().to_string();
                    value.eq_ignore_ascii_case("true")
                        || value.eq_ignore_ascii_case("yes")
                        || value.eq_ignore_ascii_case("on")
                })
                .unwrap_or(false);
            printers.push(LocalPrinter {
                name,
                device_uri,
                daemon_controlled,
            });
        }
        debug!(count = printers.len(), host = %self.host, "enumerated queues");
        Ok(printers)
    }

    /// Shared printers on a polled server, excluding remote, implicit and
    /// unshared entries.
    pub async fn get_shared_printers(&self) -> Result<Vec<PolledPrinter>> {
        let mut request = self.new_request(
            Operation::CupsGetPrinters,
            &format!("ipp://{}:{}/", self.host, self.port),
        )?;
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requested-attributes",
                IppValue::Array(vec![
                    IppValue::Keyword("printer-uri-supported".into()),
                    IppValue::Keyword("printer-info".into()),
                ]),
            ),
        );
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "printer-type-mask",
                IppValue::Enum(
                    (printer_type::REMOTE | printer_type::IMPLICIT | printer_type::NOT_SHARED)
                        as i32,
                ),
            ),
        );
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("printer-type", IppValue::Enum(0)),
        );

        let response = self.send_checked("/", request).await?;
        let mut printers = Vec::new();
        for group in response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
        {
            let attrs = group.attributes();
            let Some(uri) = attrs
                .get("printer-uri-supported")
                .map(|a| a.value().to_string())
            else {
                continue;
            };
            let info = attrs
                .get("printer-info")
                .map(|a| a.value().to_string())
                .unwrap_or_default();
            printers.push(PolledPrinter { uri, info });
        }
        Ok(printers)
    }

    /// Full printer attributes for the broadcaster.
    pub async fn get_printers_for_broadcast(&self) -> Result<IppRequestResponse> {
        let mut request = self.new_request(
            Operation::CupsGetPrinters,
            &format!("ipp://{}:{}/", self.host, self.port),
        )?;
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requested-attributes",
                IppValue::Array(vec![
                    IppValue::Keyword("printer-type".into()),
                    IppValue::Keyword("printer-state".into()),
                    IppValue::Keyword("printer-uri-supported".into()),
                    IppValue::Keyword("printer-info".into()),
                    IppValue::Keyword("printer-location".into()),
                    IppValue::Keyword("printer-make-and-model".into()),
                    IppValue::Keyword("auth-info-required".into()),
                    IppValue::Keyword("printer-uuid".into()),
                    IppValue::Keyword("job-template".into()),
                ]),
            ),
        );
        self.send_checked("/", request).await
    }

    // -- direct printer probing ----------------------------------------------

    /// Get-Printer-Attributes against a network printer's device URI.
    pub async fn probe_printer(device_uri: &str) -> Result<IppRequestResponse> {
        let uri: Uri = device_uri.parse().map_err(|err| {
            SpoolwatchError::IppRequest(format!("invalid device URI '{device_uri}': {err}"))
        })?;
        let operation = IppOperationBuilder::get_printer_attributes(uri.clone()).build();
        let client = AsyncIppClient::builder(uri)
            .request_timeout(REQUEST_TIMEOUT)
            .ignore_tls_errors(true)
            .build();
        let response = client
            .send(operation)
            .await
            .map_err(|err| SpoolwatchError::IppRequest(format!("{device_uri}: {err}")))?;
        if !response.header().status_code().is_success() {
            return Err(SpoolwatchError::IppRequest(format!(
                "{device_uri} returned {:?}",
                response.header().status_code()
            )));
        }
        Ok(response)
    }

    // -- subscriptions -------------------------------------------------------

    /// Create a pull subscription for printer events; returns its id.
    pub async fn create_subscription(&self, interval: u64) -> Result<i32> {
        let mut request = self.new_request(
            Operation::CreatePrinterSubscriptions,
            &format!("ipp://{}:{}/", self.host, self.port),
        )?;
        let subscription = DelimiterTag::SubscriptionAttributes;
        request.attributes_mut().add(
            subscription,
            IppAttribute::new("notify-pull-method", IppValue::Keyword("ippget".into())),
        );
        request.attributes_mut().add(
            subscription,
            IppAttribute::new("notify-charset", IppValue::Charset("utf-8".into())),
        );
        request.attributes_mut().add(
            subscription,
            IppAttribute::new(
                "notify-events",
                IppValue::Array(
                    PRINTER_EVENTS
                        .iter()
                        .map(|event| IppValue::Keyword((*event).into()))
                        .collect(),
                ),
            ),
        );
        request.attributes_mut().add(
            subscription,
            IppAttribute::new("notify-time-interval", IppValue::Integer(interval as i32)),
        );

        let response = self.send_checked("/", request).await?;
        for group in response
            .attributes()
            .groups_of(DelimiterTag::SubscriptionAttributes)
        {
            if let Some(attr) = group.attributes().get("notify-subscription-id") {
                if let IppValue::Integer(id) = attr.value() {
                    debug!(host = %self.host, id, "created printer subscription");
                    return Ok(*id);
                }
            }
        }
        Err(SpoolwatchError::IppRequest(format!(
            "{}:{} returned no subscription id",
            self.host, self.port
        )))
    }

    /// Check the subscription for new printer events.
    pub async fn get_notifications(&self, subscription_id: i32, last_seq: i32) -> NotifyPoll {
        let mut request = match self.new_request(
            Operation::GetNotifications,
            &format!("ipp://{}:{}/", self.host, self.port),
        ) {
            Ok(request) => request,
            Err(_) => return NotifyPoll::Failed,
        };
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-ids", IppValue::Integer(subscription_id)),
        );
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-sequence-numbers", IppValue::Integer(last_seq + 1)),
        );

        let response = match self.send("/", request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(host = %self.host, %err, "Get-Notifications failed");
                return NotifyPoll::Failed;
            }
        };

        let status = response.header().status_code();
        if status == StatusCode::ClientErrorNotFound {
            return NotifyPoll::Expired;
        }
        if !status.is_success() {
            return NotifyPoll::Failed;
        }

        let mut seen = false;
        let mut max_seq = last_seq;
        for group in response
            .attributes()
            .groups_of(DelimiterTag::EventNotificationAttributes)
        {
            seen = true;
            if let Some(attr) = group.attributes().get("notify-sequence-number") {
                if let IppValue::Integer(seq) = attr.value() {
                    max_seq = max_seq.max(*seq);
                }
            }
        }
        if seen {
            NotifyPoll::Events { last_seq: max_seq }
        } else {
            NotifyPoll::Quiet
        }
    }

    /// Best-effort subscription cancellation.
    pub async fn cancel_subscription(&self, subscription_id: i32) {
        let request = match self.new_request(
            Operation::CancelSubscription,
            &format!("ipp://{}:{}/", self.host, self.port),
        ) {
            Ok(mut request) => {
                request.attributes_mut().add(
                    DelimiterTag::OperationAttributes,
                    IppAttribute::new(
                        "notify-subscription-id",
                        IppValue::Integer(subscription_id),
                    ),
                );
                request
            }
            Err(_) => return,
        };
        if let Err(err) = self.send("/", request).await {
            warn!(host = %self.host, %err, "Cancel-Subscription failed");
        }
    }
}

impl QueueOps for IppService {
    /// Count of not-completed jobs on a queue.  An error is surfaced so
    /// the caller retries rather than deleting a queue that may have jobs.
    async fn active_jobs(&self, queue: &str) -> Result<usize> {
        let mut request = self.new_request(Operation::GetJobs, &self.queue_uri(queue))?;
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("which-jobs", IppValue::Keyword("not-completed".into())),
        );
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requested-attributes",
                IppValue::Array(vec![IppValue::Keyword("job-id".into())]),
            ),
        );
        let response = self.send_checked("/", request).await?;
        Ok(response
            .attributes()
            .groups_of(DelimiterTag::JobAttributes)
            .count())
    }

    /// The user's default printer, or `None` when there is none or the
    /// query fails softly.
    async fn default_printer(&self) -> Result<Option<String>> {
        let mut request = self.new_request(
            Operation::CupsGetDefault,
            &format!("ipp://{}:{}/", self.host, self.port),
        )?;
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(
                "requested-attributes",
                IppValue::Array(vec![IppValue::Keyword("printer-name".into())]),
            ),
        );
        let response = match self.send("/", request).await {
            Ok(response) => response,
            Err(_) => return Ok(None),
        };
        if !response.header().status_code().is_success() {
            return Ok(None);
        }
        let name = response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .next()
            .and_then(|group| group.attributes().get("printer-name"))
            .map(|attr| attr.value().to_string());
        Ok(name)
    }

    /// Create or modify a queue: enabled, accepting, unshared, stamped
    /// with the owner sentinel.
    async fn create_queue(&self, spec: &QueueSpec<'_>) -> Result<()> {
        let mut request =
            self.new_request(Operation::CupsAddModifyPrinter, &self.queue_uri(spec.name))?;

        let printer = DelimiterTag::PrinterAttributes;
        // 3 = idle
        request.attributes_mut().add(
            printer,
            IppAttribute::new("printer-state", IppValue::Enum(3)),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new("printer-is-accepting-jobs", IppValue::Boolean(true)),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new("device-uri", IppValue::Uri(spec.device_uri.into())),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new(OWNER_OPTION, IppValue::NameWithoutLanguage("true".into())),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new("printer-is-shared", IppValue::Boolean(false)),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new(
                "printer-info",
                IppValue::TextWithoutLanguage(spec.info.into()),
            ),
        );
        request.attributes_mut().add(
            printer,
            IppAttribute::new(
                "printer-location",
                IppValue::TextWithoutLanguage(spec.location.into()),
            ),
        );

        if let Some(path) = spec.artefact {
            let bytes = std::fs::read(path)?;
            *request.payload_mut() = IppPayload::new(std::io::Cursor::new(bytes));
        }

        self.send_checked("/admin/", request).await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let request = self.new_request(Operation::CupsDeletePrinter, &self.queue_uri(queue))?;
        let response = self.send("/admin/", request).await?;
        let status = response.header().status_code();
        // A queue that is already gone is not an error worth retrying.
        if !status.is_success() && status != StatusCode::ClientErrorNotFound {
            return Err(SpoolwatchError::IppRequest(format!(
                "{}:{} returned {status:?}",
                self.host, self.port
            )));
        }
        Ok(())
    }
}
