use crate::{
    config::{self, BatteryStatus, CbgPosition, PumpOptions},
    protocol::{
        codec::{HidPacketCodec, HidReport},
        error::ProtocolError,
        packet::{
            ascii, remote, ControlPacket, MedtronicPacket, Opcode, OutboundPacket, PaddingPacket,
            PagePartition, PumpIdentity, HID_PACKET_SIZE, MAGIC_HEADER, MEDTRONIC_PACKET_START,
        },
    },
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::{SinkExt, StreamExt};
use medlink_sdk::{
    checksum::{crc16_ccitt, sum_lsb},
    retry_fixed, AmountSegment, BgUnits, CarbUnits, RetryPolicy, ScheduleSegment, TargetSegment,
};
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

const PART_SIZE: usize = 256;
const HISTORY_PAGE_CRC_AT: usize = 1022;
const ISIG_PAGE_CRC_AT: usize = 2044;

/// Timing and retry configuration for a Contour Next Link session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pump serial and the message header derived from it.
    pub identity: PumpIdentity,
    /// Retries for single command/response exchanges.
    pub point_policy: RetryPolicy,
    /// Retries for a single history page.
    pub history_policy: RetryPolicy,
    /// Reply timeout for simple commands.
    pub command_timeout: Duration,
    /// Reply timeout for each part of a bulk page read.
    pub page_timeout: Duration,
    /// How long a flush drains the link.
    pub flush_window: Duration,
}

impl SessionConfig {
    pub fn new(identity: PumpIdentity, point_policy: RetryPolicy, history_policy: RetryPolicy) -> Self {
        Self {
            identity,
            point_policy,
            history_policy,
            command_timeout: Duration::from_secs(5),
            page_timeout: Duration::from_secs(20),
            flush_window: Duration::from_millis(1_000),
        }
    }
}

/// How [`MedtronicSession::get_message`] decides a reply is complete.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Finish as soon as the link answers with ENQ.
    pub wait_for_enq: bool,
    /// Index of this reply within a multi-reply exchange.
    pub reply_nr: usize,
    /// Fail when the first report carries a non-zero NAK code.
    pub check_nak: bool,
    pub timeout: Duration,
}

/// Reply bytes assembled from one or more HID reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyMessage {
    pub bytes: Vec<u8>,
    pub last_packet_size: usize,
    /// Set when the pump returned the records inside the first reply.
    pub results_in_reply: bool,
}

impl ReplyMessage {
    fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        self.last_packet_size = data.len();
    }

    /// First byte of the link reply.
    pub fn record_type(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// First byte of the pump message.
    pub fn pump_record_type(&self) -> Option<u8> {
        self.bytes.get(MEDTRONIC_PACKET_START).copied()
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(MEDTRONIC_PACKET_START..).unwrap_or(&[])
    }
}

/// A page as assembled from its parts, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub bytes: Vec<u8>,
    pub nak: bool,
}

/// One history, CBG or ISIG page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub number: u32,
    pub bytes: Vec<u8>,
    pub valid: bool,
    pub nak: bool,
}

impl HistoryPage {
    /// A page is valid when it is not zero padding and its CRC-16 matches.
    pub fn validate(op: Opcode, number: u32, raw: RawPage) -> Self {
        let valid = if raw.bytes.iter().all(|b| *b == 0) {
            false
        } else {
            let (calculated, stored) = if op == Opcode::ReadIsigHistory {
                (
                    crc16_ccitt(raw.bytes.get(..ISIG_PAGE_CRC_AT).unwrap_or(&[]), 0xFFFF, 0),
                    ((config::byte_at(&raw.bytes, ISIG_PAGE_CRC_AT) as u16) << 8)
                        + config::byte_at(&raw.bytes, ISIG_PAGE_CRC_AT + 2) as u16,
                )
            } else {
                (
                    crc16_ccitt(raw.bytes.get(..HISTORY_PAGE_CRC_AT).unwrap_or(&[]), 0xFFFF, 0),
                    config::be_u16_at(&raw.bytes, HISTORY_PAGE_CRC_AT),
                )
            };
            if calculated != stored {
                debug!(number, calculated, stored, "page checksum mismatch");
            }
            calculated == stored
        };
        Self {
            number,
            bytes: raw.bytes,
            valid,
            nak: raw.nak,
        }
    }
}

/// Page selector parameter and part count for a page read.
fn page_request(op: Opcode, number: u32) -> (Vec<u8>, PagePartition) {
    let parameter = if op == Opcode::ReadHistory {
        vec![0x01, number as u8]
    } else {
        let mut p = vec![0x04];
        p.extend_from_slice(&number.to_be_bytes());
        p
    };
    let partition = if op == Opcode::ReadIsigHistory {
        PagePartition::Eight
    } else {
        PagePartition::Four
    };
    (parameter, partition)
}

/// One attempt of a page read; `fatal` stops the retry loop.
struct Attempt {
    error: ProtocolError,
    fatal: bool,
}

impl Attempt {
    fn retry(error: ProtocolError) -> Self {
        Self { error, fatal: false }
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

/// Command/response session with a Medtronic pump behind a Contour Next Link.
///
/// Implementations provide report-level I/O; the handshake, configuration
/// reads and paged history transfer are shared default methods.
#[async_trait]
pub trait MedtronicSession: Send + Sync {
    fn config(&self) -> &SessionConfig;

    /// Bulk history transfers use different end-of-reply rules.
    fn set_fetching_history(&self, fetching: bool);

    async fn send(&self, packet: OutboundPacket) -> Result<(), ProtocolError>;

    /// Read reports into `message` until the reply is complete.
    async fn get_message(
        &self,
        message: &mut ReplyMessage,
        opts: ReadOptions,
    ) -> Result<(), ProtocolError>;

    /// Drain and discard inbound reports for the flush window.
    async fn flush(&self);

    async fn close(&self) -> Result<(), ProtocolError>;

    /// Send `packet` and collect `how_many` replies into one message.
    async fn command_response(
        &self,
        packet: OutboundPacket,
        wait_for_enq: bool,
        how_many: usize,
        check_nak: bool,
    ) -> Result<ReplyMessage, ProtocolError> {
        self.send(packet).await?;
        let mut message = ReplyMessage::default();
        for reply_nr in 0..how_many {
            let opts = ReadOptions {
                wait_for_enq,
                reply_nr,
                check_nak,
                timeout: self.config().command_timeout,
            };
            self.get_message(&mut message, opts).await?;
        }
        Ok(message)
    }

    async fn one_record(
        &self,
        packet: OutboundPacket,
        wait_for_enq: bool,
        check_nak: bool,
    ) -> Result<ReplyMessage, ProtocolError> {
        self.records(packet, wait_for_enq, 1, check_nak).await
    }

    async fn three_records(&self, packet: OutboundPacket) -> Result<ReplyMessage, ProtocolError> {
        self.records(packet, false, 3, true).await
    }

    /// Retried exchange; every attempt waits one interval before sending.
    async fn records(
        &self,
        packet: OutboundPacket,
        wait_for_enq: bool,
        how_many: usize,
        check_nak: bool,
    ) -> Result<ReplyMessage, ProtocolError> {
        let policy = self.config().point_policy;
        retry_fixed(
            &policy,
            "medtronic.command",
            |_| {
                let packet = packet.clone();
                async move {
                    tokio::time::sleep(policy.interval()).await;
                    self.command_response(packet, wait_for_enq, how_many, check_nak)
                        .await
                }
            },
            |_| false,
        )
        .await
    }

    /// Put the link into remote mode and open the connection to the pump.
    async fn handshake(&self) -> Result<(), ProtocolError> {
        // leave remote command mode if the link is still in it
        self.one_record(ControlPacket::byte(ascii::EOT).into(), true, false)
            .await?;

        let reply = self
            .one_record(ControlPacket::byte(ascii::NAK).into(), false, false)
            .await?;
        if reply.record_type() != Some(ascii::EOT) {
            return Err(ProtocolError::UnexpectedReply("Expected EOT.".into()));
        }

        let steps = [
            ("ENQ", ControlPacket::byte(ascii::ENQ)),
            ("WRITE", ControlPacket::new(&remote::WRITE)),
            ("QUERY", ControlPacket::new(&remote::QUERY)),
            ("MAGIC", ControlPacket::new(&remote::MAGIC)),
        ];
        for (name, packet) in steps {
            let reply = self.one_record(packet.into(), false, false).await?;
            if reply.record_type() != Some(ascii::ACK) {
                return Err(ProtocolError::UnexpectedReply(format!(
                    "Expected ACK during connect:{name}"
                )));
            }
        }

        let open = MedtronicPacket::open_connection();
        let echo = open.body(&self.config().identity);
        let reply = self.one_record(open.into(), false, false).await?;
        if reply.bytes != echo {
            return Err(ProtocolError::UnexpectedReply(
                "Could not open connection to pump. Please try again.".into(),
            ));
        }
        debug!("connection to pump open");
        Ok(())
    }

    /// Single configuration read; returns the pump message payload.
    async fn query(&self, op: Opcode) -> Result<Vec<u8>, ProtocolError> {
        let reply = self
            .one_record(MedtronicPacket::command(op).into(), false, true)
            .await?;
        Ok(reply.payload().to_vec())
    }

    async fn read_model(&self) -> Result<String, ProtocolError> {
        let payload = self.query(Opcode::ReadModel).await?;
        Ok(config::parse_model(&payload))
    }

    async fn read_profile(&self, op: Opcode) -> Result<Vec<ScheduleSegment>, ProtocolError> {
        let reply = self
            .three_records(MedtronicPacket::multipart(op, PagePartition::Three).into())
            .await?;
        Ok(config::parse_profile(reply.payload()))
    }

    async fn read_bg_targets(
        &self,
    ) -> Result<(Option<BgUnits>, Vec<TargetSegment>), ProtocolError> {
        let payload = self.query(Opcode::ReadBgTargets).await?;
        let units = config::bg_units(config::byte_at(&payload, 0));
        Ok((units, config::bg_targets(&payload, units)))
    }

    async fn read_carb_ratios(
        &self,
    ) -> Result<(Option<CarbUnits>, Vec<AmountSegment>), ProtocolError> {
        let payload = self.query(Opcode::ReadCarbRatios).await?;
        let units = config::carb_units(config::byte_at(&payload, 0));
        Ok((units, config::carb_ratios(&payload, units)))
    }

    async fn read_wizard_enabled(&self) -> Result<bool, ProtocolError> {
        let payload = self.query(Opcode::ReadWizardEnabled).await?;
        Ok(config::byte_at(&payload, 0) != 0)
    }

    /// Raw sensitivities; decoding needs the BG units read separately.
    async fn read_insulin_sensitivities(&self) -> Result<Vec<u8>, ProtocolError> {
        self.query(Opcode::ReadInsulinSensitivities).await
    }

    async fn read_settings(&self) -> Result<PumpOptions, ProtocolError> {
        let payload = self.query(Opcode::ReadSettings).await?;
        Ok(PumpOptions::parse(&payload))
    }

    async fn write_cbg_timestamp(&self) -> Result<bool, ProtocolError> {
        let payload = self.query(Opcode::WriteCbgTimestamp).await?;
        Ok(config::byte_at(&payload, 0) == ascii::ACK)
    }

    async fn read_current_page(&self) -> Result<u32, ProtocolError> {
        let payload = self.query(Opcode::ReadCurrentPage).await?;
        Ok(config::be_u32_at(&payload, 0))
    }

    async fn read_current_cbg_page(&self) -> Result<CbgPosition, ProtocolError> {
        let payload = self.query(Opcode::ReadCurrentCbgPage).await?;
        Ok(CbgPosition::parse(&payload))
    }

    async fn read_rtc(&self) -> Result<Option<NaiveDateTime>, ProtocolError> {
        let payload = self.query(Opcode::ReadTime).await?;
        Ok(config::parse_rtc(&payload))
    }

    async fn read_battery(&self) -> Result<BatteryStatus, ProtocolError> {
        let payload = self.query(Opcode::ReadBatteryStatus).await?;
        Ok(BatteryStatus::parse(&payload))
    }

    /// Request one page and collect its parts.
    async fn get_records(
        &self,
        op: Opcode,
        parameter: Vec<u8>,
        partition: PagePartition,
    ) -> Result<RawPage, ProtocolError> {
        self.send(MedtronicPacket::page_request(op, parameter.clone(), partition).into())
            .await?;
        self.send(PaddingPacket::new(op, parameter).into()).await?;

        let how_many = partition.parts();
        let mut page = vec![0u8; PART_SIZE * how_many];
        let (mut count, mut length, mut nak) = (0usize, 0usize, false);
        let opts = ReadOptions {
            wait_for_enq: false,
            reply_nr: 0,
            check_nak: true,
            timeout: self.config().page_timeout,
        };

        loop {
            let mut reply = ReplyMessage::default();
            self.get_message(&mut reply, opts).await?;

            if reply.results_in_reply && reply.bytes.starts_with(&[0x00, 0x00]) {
                debug!("empty history page with zero header");
                return Err(ProtocolError::communication());
            }

            let message = reply.payload();
            if message.is_empty() {
                debug!("no data in message");
                return Err(ProtocolError::communication());
            }
            if message.len() == 2 && message[0] == ascii::NAK {
                debug!(op = ?op, "nak received");
                nak = true;
            } else {
                let end = (length + message.len()).min(page.len());
                page[length..end].copy_from_slice(&message[..end - length]);
                length = end;

                let mut masked = reply.bytes.clone();
                masked[32] = 0;
                let calculated = sum_lsb(&masked);
                if calculated != reply.bytes[32] {
                    debug!(calculated, stored = reply.bytes[32], "invalid message checksum");
                    // CGM pages are covered by the page CRC
                    if op != Opcode::ReadCbgHistory && op != Opcode::ReadIsigHistory {
                        return Err(ProtocolError::ChecksumMismatch(
                            "Invalid checksum. Please try again.".into(),
                        ));
                    }
                }
            }

            count += 1;
            if reply.last_packet_size < 49 || count == how_many {
                break;
            }
        }

        if !nak && count < how_many {
            debug!(count, how_many, "fewer parts than expected");
            return Err(ProtocolError::FewerPackets);
        }
        trace!(count, "parts read");
        Ok(RawPage { bytes: page, nak })
    }

    /// Read and validate one page, retrying per the history policy. A
    /// timeout while requesting the page aborts without retrying.
    async fn read_page(&self, op: Opcode, number: u32) -> Result<HistoryPage, ProtocolError> {
        let policy = self.config().history_policy;
        retry_fixed(
            &policy,
            "medtronic.page",
            |_| async move {
                let ack = self
                    .one_record(MedtronicPacket::command(op).into(), true, true)
                    .await
                    .map_err(|error| Attempt {
                        fatal: error.is_timeout(),
                        error,
                    })?;
                match ack.pump_record_type() {
                    None => {
                        return Err(Attempt::retry(ProtocolError::UnexpectedReply(
                            "First byte of payload is empty".into(),
                        )))
                    }
                    Some(ascii::ACK) => {}
                    Some(other) => {
                        debug!(other, "expected ACK before page transfer");
                        self.flush().await;
                        return Err(Attempt::retry(ProtocolError::UnexpectedReply(
                            "Unexpected packet received".into(),
                        )));
                    }
                }

                let (parameter, partition) = page_request(op, number);
                let raw = match self.get_records(op, parameter, partition).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.flush().await;
                        return Err(Attempt::retry(e));
                    }
                };
                let page = HistoryPage::validate(op, number, raw);
                if !page.valid {
                    self.flush().await;
                }
                Ok(page)
            },
            |attempt: &Attempt| attempt.fatal,
        )
        .await
        .map_err(|attempt| attempt.error)
    }

    /// Read `count` pages ending at `current`, or pages `0..count` when no
    /// current page is given. `on_page` receives the number of pages read.
    async fn read_history_pages(
        &self,
        op: Opcode,
        count: u32,
        current: Option<u32>,
        on_page: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<Vec<HistoryPage>, ProtocolError> {
        let start = current.map(|c| (c + 1).saturating_sub(count)).unwrap_or(0);
        debug!(op = ?op, start, end = start + count, "reading pages");
        let mut pages = Vec::with_capacity(count as usize);
        for number in start..start + count {
            pages.push(self.read_page(op, number).await?);
            on_page(pages.len() as u32);
        }
        Ok(pages)
    }

    /// Re-read every page that is neither valid nor NAKed.
    async fn retry_invalid_pages(
        &self,
        op: Opcode,
        pages: Vec<HistoryPage>,
    ) -> Result<Vec<HistoryPage>, ProtocolError> {
        let mut out = Vec::with_capacity(pages.len());
        for page in pages {
            if page.valid || page.nak {
                out.push(page);
            } else {
                debug!(number = page.number, "re-reading page");
                out.push(self.read_page(op, page.number).await?);
            }
        }
        Ok(out)
    }
}

/// Session over any byte transport carrying 64-byte HID reports.
#[derive(Debug)]
pub struct MedtronicSessionImpl<T> {
    pub framed: tokio::sync::Mutex<Framed<T, HidPacketCodec>>,
    pub config: SessionConfig,
    fetching_history: AtomicBool,
}

impl<T> MedtronicSessionImpl<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(io: T, config: SessionConfig) -> Self {
        Self {
            framed: tokio::sync::Mutex::new(Framed::new(
                io,
                HidPacketCodec::new(config.identity.clone()),
            )),
            config,
            fetching_history: AtomicBool::new(false),
        }
    }

    /// Whether `report` completes the reply being assembled in `message`.
    fn is_complete(
        &self,
        report: &HidReport,
        message: &mut ReplyMessage,
        opts: &ReadOptions,
    ) -> Result<bool, ProtocolError> {
        let fetching = self.fetching_history.load(Ordering::Relaxed);
        let payload_length = report.payload_length(self.config.identity.serial_bytes());

        if message.bytes.len() >= MEDTRONIC_PACKET_START {
            if payload_length == Some(1) && message.pump_record_type() == Some(ascii::ACK) {
                return Ok(true);
            }
            if fetching {
                if payload_length.is_some_and(|len| (1..256).contains(&len)) {
                    message.results_in_reply = true;
                    return Ok(true);
                }
                if message.last_packet_size < HID_PACKET_SIZE - 4 {
                    return Ok(true);
                }
            }
        }

        if !report.has_magic() {
            return Err(ProtocolError::InvalidPacket(
                "Invalid USB packet received.".into(),
            ));
        }

        let short = report.size() < HID_PACKET_SIZE - 4;
        let done = if opts.wait_for_enq {
            report.first_byte() == ascii::ENQ
        } else if fetching {
            short
        } else {
            short
                || matches!(report.first_byte(), ascii::ENQ | ascii::EOT | ascii::ACK)
                || matches!(report.frame_type(), Some(ascii::ETX | ascii::ETB))
        };
        Ok(done)
    }
}

#[async_trait]
impl<T> MedtronicSession for MedtronicSessionImpl<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn set_fetching_history(&self, fetching: bool) {
        self.fetching_history.store(fetching, Ordering::Relaxed);
    }

    async fn send(&self, packet: OutboundPacket) -> Result<(), ProtocolError> {
        let mut framed = self.framed.lock().await;
        framed.send(packet).await.map_err(ProtocolError::Io)
    }

    async fn get_message(
        &self,
        message: &mut ReplyMessage,
        opts: ReadOptions,
    ) -> Result<(), ProtocolError> {
        let mut framed = self.framed.lock().await;
        let deadline = tokio::time::Instant::now() + opts.timeout;
        let mut first = true;
        loop {
            let report = match tokio::time::timeout_at(deadline, framed.next()).await {
                Ok(Some(Ok(report))) => report,
                Ok(Some(Err(e))) => return Err(ProtocolError::Io(e)),
                Ok(None) => return Err(ProtocolError::Transport("Connection closed".into())),
                Err(_) => return Err(ProtocolError::Timeout(opts.timeout)),
            };

            if opts.check_nak && first && report.nak_code() != 0 {
                return Err(ProtocolError::Nak(format!(
                    "Non-zero NAK byte: {:#04x}",
                    report.nak_code()
                )));
            }

            // later replies repeat the link header in their first report
            let mut discard = MAGIC_HEADER.len();
            if opts.reply_nr > 0 && first {
                discard += MEDTRONIC_PACKET_START;
            }
            first = false;
            message.push(report.data(discard));

            if self.is_complete(&report, message, &opts)? {
                return Ok(());
            }
        }
    }

    async fn flush(&self) {
        let mut framed = self.framed.lock().await;
        let deadline = tokio::time::Instant::now() + self.config.flush_window;
        loop {
            match tokio::time::timeout_at(deadline, framed.next()).await {
                Ok(Some(Ok(report))) => trace!(size = report.size(), "flushing"),
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "flush read failed");
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        let mut framed = self.framed.lock().await;
        framed.close().await.map_err(ProtocolError::Io)
    }
}
