//! Event stream reconstruction.
//!
//! The builders emit drafts per record type; the simulator walks them in time
//! order and resolves what only the sequence can tell: how long each basal
//! ran, what a temp or suspended basal suppressed, which bolus a wizard
//! triggered, and when an alarm or rewind stopped delivery.

use chrono::{Duration, Timelike};
use medlink_sdk::{
    codes, Agent, AlarmType, Annotation, Bolus, CarbUnits, DeliveryType, DeviceEvent,
    DeviceEventKind, Display, BloodGlucoseDisplay, DraftBasal, DraftEvent, DraftWizard,
    DriverError, DriverResult, Event, EventMeta, PumpSettings, PumpStatus, ScheduleSegment, Smbg,
    SmbgSubType, StatusEvent, StatusReason, SuppressedBasal, TzoUtil, WizardInputs, ClockSource,
    MS_PER_DAY, MS_PER_MINUTE,
};
use tracing::{debug, warn};

const SOURCE: &str = "medtronic";
const OFF_SCHEDULE_RATE: &str = "medtronic/basal/off-schedule-rate";

/// Wizard and bolus records of one delivery are at most this far apart.
const WIZARD_BOLUS_WINDOW_MS: i64 = 30_000;
const DUPLICATE_SMBG_WINDOW_MS: i64 = 15 * MS_PER_MINUTE;
/// Pumps ship with their clock in 2012 or earlier; such dates are unset clocks.
const LAST_UNSET_CLOCK_YEAR: i32 = 2012;
/// "Battery out limit exceeded"
const ALARM_BATTERY_OUT: u64 = 3;

/// Identity stamped onto settings events, plus the offsets used for
/// fabricated basals.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub manufacturers: Vec<String>,
    pub model: String,
    pub serial_number: String,
    pub tzo: TzoUtil,
}

#[derive(Debug)]
pub struct MedtronicSimulator {
    config: SimulatorConfig,
    events: Vec<Event>,
    last_basal_pos: Option<usize>,
    curr_basal: Option<DraftBasal>,
    prev_basal: Option<DraftBasal>,
    curr_wizard: Option<DraftWizard>,
    curr_smbg: Option<Smbg>,
    curr_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    curr_settings: Option<PumpSettings>,
    suspending: Option<DeviceEvent>,
    resuming: Option<DeviceEvent>,
    curr_status: Option<DeviceEvent>,
}

/// Scan window over one calendar day of the active schedule.
struct Window {
    start: i64,
    end: i64,
    before_midnight: i64,
}

fn split_from_schedule(suppressed: &SuppressedBasal) -> bool {
    suppressed.annotations.contains(codes::FABRICATED_FROM_SCHEDULE)
        || suppressed
            .suppressed
            .as_ref()
            .is_some_and(|inner| inner.annotations.contains(codes::FABRICATED_FROM_SCHEDULE))
}

fn cause(event: &DeviceEvent) -> &'static str {
    match &event.kind {
        DeviceEventKind::Alarm(alarm) => match alarm.alarm_type {
            AlarmType::NoDelivery => "no_delivery",
            AlarmType::NoPower => "no_power",
            AlarmType::AutoOff => "auto_off",
            AlarmType::LowInsulin => "low_insulin",
            AlarmType::LowPower => "low_power",
            AlarmType::Other => "other",
        },
        kind => kind.sub_type(),
    }
}

fn cap_at_expected(basal: &mut DraftBasal) {
    if let (Some(duration), Some(expected)) = (basal.duration, basal.expected_duration) {
        if duration > expected {
            basal.meta.annotate(codes::UNKNOWN_DURATION);
            basal.duration = Some(expected);
        }
    }
}

/// Milliseconds since local midnight, unrounded.
fn local_ms_from_midnight(meta: &EventMeta) -> i64 {
    let local = meta.time + Duration::minutes(meta.timezone_offset as i64);
    local.num_seconds_from_midnight() as i64 * 1000 + (local.nanosecond() / 1_000_000) as i64
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Close the last basal of the stream from the schedule it should follow.
fn final_scheduled_basal(basal: &mut DraftBasal, schedule: &[ScheduleSegment]) {
    let ms = local_ms_from_midnight(&basal.meta);
    let segment = schedule.iter().rposition(|s| s.start <= ms);
    match segment {
        Some(i) if basal.rate.map(round3) == Some(schedule[i].rate) => {
            basal.meta.annotate(codes::FINAL_BASAL_FABRICATED);
            let end = schedule.get(i + 1).map_or(MS_PER_DAY, |next| next.start);
            basal.duration = Some(end - ms);
        }
        Some(_) => {
            basal.duration = Some(0);
            basal.meta.annotate(OFF_SCHEDULE_RATE);
            basal.meta.annotate(codes::UNKNOWN_DURATION);
        }
        None => {
            basal.duration = Some(0);
            basal.meta.annotate(codes::UNKNOWN_DURATION);
        }
    }
}

impl MedtronicSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            events: Vec::new(),
            last_basal_pos: None,
            curr_basal: None,
            prev_basal: None,
            curr_wizard: None,
            curr_smbg: None,
            curr_timestamp: None,
            curr_settings: None,
            suspending: None,
            resuming: None,
            curr_status: None,
        }
    }

    /// Feed one draft. Drafts must arrive in time order.
    pub fn simulate(&mut self, draft: DraftEvent) -> DriverResult<()> {
        match draft {
            DraftEvent::Basal(basal) => self.basal(basal),
            DraftEvent::Bolus(bolus) => self.bolus(bolus),
            DraftEvent::Wizard(wizard) => self.wizard(wizard),
            DraftEvent::Smbg(smbg) => self.smbg(smbg),
            DraftEvent::Cbg(cbg) => self.simple(Event::Cbg(cbg)),
            DraftEvent::PumpSettings(settings) => self.pump_settings(settings),
            DraftEvent::DeviceEvent(event) => match &event.kind {
                DeviceEventKind::Status(_) => self.status(event),
                DeviceEventKind::Alarm(_) => self.alarm(event),
                DeviceEventKind::Prime(_) => self.prime(event),
                DeviceEventKind::ReservoirChange(_) => self.rewind(event),
                DeviceEventKind::TimeChange(_) => self.time_change(event),
                DeviceEventKind::Calibration(_) => self.simple(Event::DeviceEvent(event)),
            },
        }
    }

    /// Simulate every draft, close what is still open and return the
    /// uploadable stream.
    pub fn run(
        mut self,
        drafts: impl IntoIterator<Item = DraftEvent>,
    ) -> DriverResult<Vec<Event>> {
        for draft in drafts {
            self.simulate(draft)?;
        }
        self.finalize();
        Ok(self.get_events())
    }

    fn ensure_timestamp(&mut self, time: chrono::DateTime<chrono::Utc>) -> DriverResult<()> {
        if let Some(current) = self.curr_timestamp {
            if current > time {
                return Err(DriverError::SimulationError(format!(
                    "Timestamps must be in order. Current timestamp was {current}, but got {time}"
                )));
            }
        }
        self.curr_timestamp = Some(time);
        Ok(())
    }

    fn simple(&mut self, event: Event) -> DriverResult<()> {
        self.ensure_timestamp(event.time())?;
        self.events.push(event);
        Ok(())
    }

    /// Truncate and emit a finished basal, returning the truncated draft.
    fn push_basal(&mut self, mut basal: DraftBasal) -> DraftBasal {
        basal.truncate_duration(SOURCE);
        self.push_closed(basal.clone());
        basal
    }

    fn push_closed(&mut self, basal: DraftBasal) {
        self.last_basal_pos = Some(self.events.len());
        self.events.push(Event::Basal(basal.done()));
    }

    fn active_schedule(&self) -> Option<(String, Vec<ScheduleSegment>)> {
        self.curr_settings.as_ref().map(|s| {
            (
                s.settings.active_schedule.clone(),
                s.settings.active_segments().to_vec(),
            )
        })
    }

    /// Split the current temp or suspended basal wherever the schedule it
    /// suppresses changed rate. Returns whether a split happened.
    fn check_for_schedule_changes(&mut self, cancelled: Option<&EventMeta>) -> bool {
        let Some((name, schedule)) = self.active_schedule() else {
            return false;
        };
        let Some(curr) = self.curr_basal.as_ref() else {
            return false;
        };
        if curr.is(DeliveryType::Scheduled) {
            return false;
        }

        let start = curr.meta.ms_in_current_day();
        let end = start + curr.duration.unwrap_or(0);
        let mut changed = false;

        if end >= MS_PER_DAY {
            let mut before = Window {
                start,
                end: MS_PER_DAY,
                before_midnight: 0,
            };
            changed |= self.scan_schedule(&name, &schedule, cancelled, &mut before);

            // the split above may have replaced the current basal
            if let Some(curr) = self.curr_basal.as_ref() {
                let start = curr.meta.ms_in_current_day();
                let end = start + curr.duration.unwrap_or(0);
                let mut after = Window {
                    start: 0,
                    end: end - MS_PER_DAY,
                    before_midnight: MS_PER_DAY - start,
                };
                changed |= self.scan_schedule(&name, &schedule, cancelled, &mut after);
            }
        } else {
            let mut window = Window {
                start,
                end,
                before_midnight: 0,
            };
            changed |= self.scan_schedule(&name, &schedule, cancelled, &mut window);
        }
        changed
    }

    fn scan_schedule(
        &mut self,
        name: &str,
        schedule: &[ScheduleSegment],
        cancelled: Option<&EventMeta>,
        window: &mut Window,
    ) -> bool {
        let mut changed = false;

        for segment in schedule {
            let Some(curr) = self.curr_basal.as_ref() else {
                break;
            };

            if let Some(cancel) = cancelled {
                // cancelled before midnight, now looking after it
                if curr.meta.device_time.date() == cancel.device_time.date()
                    && window.before_midnight > 0
                {
                    break;
                }
                if cancel.ms_in_current_day() <= segment.start {
                    break;
                }
            }

            let rate_differs = curr.suppressed.as_ref().is_some_and(|s| {
                (s.delivery_type == DeliveryType::Scheduled && s.rate != Some(segment.rate))
                    || s.suppressed.as_ref().is_some_and(|inner| {
                        inner.delivery_type == DeliveryType::Scheduled
                            && inner.rate != Some(segment.rate)
                    })
            });

            if !(window.start <= segment.start && window.end > segment.start && rate_differs) {
                continue;
            }
            let adjusted = window.before_midnight + segment.start - window.start;
            if adjusted <= 0 {
                continue;
            }

            let Some(mut closing) = self.curr_basal.take() else {
                break;
            };
            window.before_midnight = 0;
            let old_duration = closing.duration.unwrap_or(0);
            closing.duration = Some(adjusted);
            closing.meta.set_payload("duration", old_duration);

            let mut fabricated = SuppressedBasal::scheduled(segment.rate, Some(name.to_string()));
            fabricated
                .annotations
                .add(Annotation::new(codes::FABRICATED_FROM_SCHEDULE));

            let mut meta = EventMeta::new(
                closing.meta.device_time_plus(adjusted),
                closing.meta.device_id.clone(),
            );
            meta.index = closing.meta.index;
            self.config.tzo.fill_in(&mut meta);

            let mut next = if closing.is(DeliveryType::Temp) {
                let mut temp = DraftBasal::temp(meta);
                match closing.percent {
                    Some(percent) => {
                        temp.rate = Some(segment.rate * percent);
                        temp.percent = Some(percent);
                    }
                    None => temp.rate = closing.rate,
                }
                temp
            } else {
                DraftBasal::suspend(meta)
            };
            next.duration = Some(old_duration - adjusted);
            next.suppressed = match &closing.suppressed {
                Some(outer) if outer.suppressed.is_some() => {
                    let mut nested = outer.clone();
                    nested.suppressed = Some(Box::new(fabricated));
                    Some(nested)
                }
                _ => Some(fabricated),
            };
            debug!(
                device_time = %next.meta.device_time,
                rate = segment.rate,
                "schedule changed during {:?} basal",
                closing.delivery_type
            );

            self.push_closed(closing.clone());
            self.prev_basal = Some(closing);

            window.start = next.meta.ms_in_current_day();
            window.end = window.start + next.duration.unwrap_or(0);
            self.curr_basal = Some(next);
            changed = true;
        }

        changed
    }

    /// Close the running basal at the alarm or rewind that stopped delivery
    /// and start a fabricated suspended basal there.
    fn apply_suspension(
        &mut self,
        event: &DraftBasal,
        mut suspending: DeviceEvent,
        resuming: Option<DeviceEvent>,
    ) {
        let mut resumed_basal = None;
        let duration = self
            .curr_basal
            .as_ref()
            .map_or(0, |curr| curr.meta.ms_until(&suspending.meta));

        if duration > 0 {
            if let Some(curr) = self.curr_basal.as_mut() {
                curr.duration = Some(duration);
            }
            self.check_for_schedule_changes(None);
            if resuming.is_some() {
                resumed_basal = self.curr_basal.clone();
            }

            if let Some(curr) = self.curr_basal.take() {
                let closed = self.push_basal(curr);

                let resume_meta = resuming.as_ref().map_or(&event.meta, |r| &r.meta);
                let suspended_duration = suspending.meta.ms_until(resume_meta);

                let mut meta = EventMeta::new(
                    suspending.meta.device_time,
                    suspending.meta.device_id.clone(),
                );
                meta.take_clock_from(&suspending.meta);
                meta.index = suspending.meta.index;
                let mut suspended = DraftBasal::suspend(meta);
                suspended.duration = Some(suspended_duration);
                let mut suppressed = SuppressedBasal::new(closed.delivery_type, closed.rate);
                suppressed.suppressed = closed.suppressed.clone().map(Box::new);
                suspended.suppressed = Some(suppressed);

                let mut status_meta =
                    EventMeta::new(suspended.meta.device_time, event.meta.device_id.clone());
                status_meta.take_clock_from(&suspended.meta);
                status_meta.set_payload("cause", cause(&suspending));
                status_meta.annotate(codes::STATUS_FABRICATED);
                let status = DeviceEvent::new(
                    status_meta,
                    DeviceEventKind::Status(StatusEvent {
                        status: PumpStatus::Suspended,
                        reason: StatusReason {
                            suspended: Agent::Automatic,
                            resumed: if resuming.is_some() {
                                Agent::Automatic
                            } else {
                                Agent::Manual
                            },
                        },
                        duration: suspended_duration,
                        resume_index: None,
                    }),
                );
                suspending.attach_status(status);

                self.prev_basal = Some(closed);
                self.curr_basal = Some(suspended);
            }
        }
        self.events.push(Event::DeviceEvent(suspending));

        if let (Some(resuming), Some(mut resumed)) = (resuming, resumed_basal) {
            self.check_for_schedule_changes(None);
            if let Some(suspended) = self.curr_basal.take() {
                self.prev_basal = Some(self.push_basal(suspended));
            }
            resumed.meta.take_clock_from(&resuming.meta);
            resumed.duration = Some(resuming.meta.ms_until(&event.meta));
            self.curr_basal = Some(resumed);
        }
    }

    pub fn basal(&mut self, mut event: DraftBasal) -> DriverResult<()> {
        self.ensure_timestamp(event.meta.time)?;
        // a temp already split at a schedule change keeps its own suppressed rate
        let split = event.suppressed.as_ref().is_some_and(split_from_schedule);

        if event.is(DeliveryType::Temp) && !split {
            if let Some((name, schedule)) = self.active_schedule() {
                let start = event.meta.ms_in_current_day();
                let rate = schedule
                    .iter()
                    .filter(|s| start >= s.start)
                    .last()
                    .map(|s| s.rate)
                    .filter(|rate| *rate != 0.0);
                if let Some(rate) = rate {
                    event.suppressed = Some(SuppressedBasal::scheduled(rate, Some(name)));
                }
            }
        }

        let mut closed = None;
        if self.curr_basal.is_some() {
            if let Some(suspending) = self.suspending.take() {
                let resuming = self.resuming.take();
                self.apply_suspension(&event, suspending, resuming);
            }

            if let Some(curr) = self.curr_basal.as_mut() {
                if curr.duration.is_none() {
                    curr.duration = Some(curr.meta.ms_until(&event.meta));
                }
            }

            if event.is(DeliveryType::Temp) {
                if event.duration == Some(0) {
                    if event
                        .meta
                        .annotations
                        .first()
                        .is_some_and(|a| a.code == codes::UNKNOWN_DURATION)
                    {
                        debug!(time = %event.meta.time, "temp basal has unknown duration");
                    } else {
                        // zero duration temp record: the running temp was cancelled
                        self.check_for_schedule_changes(Some(&event.meta));
                        if let Some(mut curr) = self.curr_basal.take() {
                            if curr.duration != Some(0) {
                                curr.expected_duration = curr.duration;
                            }
                            curr.duration = Some(curr.meta.ms_until(&event.meta));
                            self.prev_basal = Some(self.push_basal(curr));
                        }
                        return Ok(());
                    }
                }

                if self
                    .curr_basal
                    .as_ref()
                    .is_some_and(|c| c.is(DeliveryType::Temp))
                {
                    self.check_for_schedule_changes(Some(&event.meta));
                    if let Some(curr) = self.curr_basal.as_mut() {
                        if curr.duration != Some(0) {
                            curr.expected_duration = curr.duration;
                        }
                        curr.duration = Some(curr.meta.ms_until(&event.meta));
                        cap_at_expected(curr);
                        if !split {
                            event.suppressed = curr.suppressed.clone();
                        }
                    }
                }

                if let Some(curr) = self
                    .curr_basal
                    .as_ref()
                    .filter(|c| c.is(DeliveryType::Scheduled) && !split)
                {
                    event.suppressed = Some(curr.as_suppressed());
                }

                if event.rate.is_none() {
                    let Some(percent) = event.percent else {
                        return Err(DriverError::SimulationError(
                            "Temp basal without rate or percent".into(),
                        ));
                    };
                    event.rate = event
                        .suppressed
                        .as_ref()
                        .and_then(|s| s.rate)
                        .map(|rate| rate * percent);
                }
            }

            let suspends_delivery = event.is(DeliveryType::Suspend)
                && self
                    .curr_basal
                    .as_ref()
                    .is_some_and(|c| !c.is(DeliveryType::Suspend));
            if suspends_delivery && self.suspend_during(&mut event) {
                return Ok(());
            }

            self.check_for_schedule_changes(None);
            if let Some(curr) = self.curr_basal.take() {
                closed = Some(self.push_basal(curr));
            }
        }

        if event.is(DeliveryType::Scheduled) {
            if event.schedule_name.is_none() {
                event.schedule_name = self
                    .curr_settings
                    .as_ref()
                    .map(|s| s.settings.active_schedule.clone());
            }
            self.check_temp_gap(closed.as_ref(), &event.meta);
        }

        if event.is(DeliveryType::Temp) && event.rate.is_none() {
            if let Some(percent) = event.percent {
                let suppressed_rate = event.suppressed.as_ref().and_then(|s| s.rate);
                if let Some(rate) = suppressed_rate {
                    event.rate = Some(rate * percent);
                } else if let Some((_, schedule)) = self.active_schedule() {
                    let start = event.meta.ms_in_current_day();
                    event.rate = schedule
                        .iter()
                        .filter(|s| start >= s.start)
                        .last()
                        .map(|s| s.rate * percent);
                } else {
                    debug!(time = %event.meta.time, "cannot determine rate of percent temp basal");
                    return Ok(());
                }
            }
        }

        self.prev_basal = closed;
        self.curr_basal = Some(event);
        Ok(())
    }

    /// A suspend while a basal runs. Returns true when the temp basal it
    /// interrupted was restarted on resume, which completes the step.
    fn suspend_during(&mut self, event: &mut DraftBasal) -> bool {
        self.check_for_schedule_changes(Some(&event.meta));
        let Some(curr) = self.curr_basal.as_mut() else {
            return false;
        };

        let mut suppressed = SuppressedBasal::new(curr.delivery_type, curr.rate);
        suppressed.schedule_name = curr.schedule_name.clone();
        if !curr.is(DeliveryType::Temp) {
            event.suppressed = Some(suppressed);
            return false;
        }

        // suspended basal nests the temp, which nests the schedule
        suppressed.suppressed = curr.suppressed.clone().map(Box::new);
        event.suppressed = Some(suppressed);

        let mut resume_basal = None;
        if let Some((status_meta, status)) = self
            .curr_status
            .as_ref()
            .and_then(|s| s.as_status().map(|st| (&s.meta, st)))
        {
            if status.duration > 0 {
                let temp_to_resume = curr.meta.ms_until(status_meta) + status.duration;
                let still_active = curr.duration.is_some_and(|d| d > temp_to_resume);
                if still_active && status_meta.index == event.meta.index {
                    event.duration = Some(status.duration);
                    let mut restarted = curr.clone();
                    restarted.meta.time = status_meta.time + Duration::milliseconds(status.duration);
                    restarted.meta.device_time = status_meta.device_time_plus(status.duration);
                    restarted.meta.index = status.resume_index;
                    restarted.duration = None;
                    resume_basal = Some(restarted);
                }
            }
        }

        if curr.duration.is_some() {
            curr.expected_duration = curr.duration;
            curr.duration = Some(curr.meta.ms_until(&event.meta));
            cap_at_expected(curr);
        }

        let Some(mut restarted) = resume_basal else {
            return false;
        };

        if let Some(temp) = self.curr_basal.take() {
            self.prev_basal = Some(self.push_basal(temp));
        }
        self.curr_basal = Some(event.clone());
        if self.check_for_schedule_changes(None) {
            restarted.suppressed = self
                .curr_basal
                .as_ref()
                .and_then(|c| c.suppressed.as_ref())
                .and_then(|s| s.suppressed.as_deref().cloned());
        }
        if let Some(suspended) = self.curr_basal.take() {
            self.prev_basal = Some(self.push_basal(suspended));
        }
        self.curr_basal = Some(restarted);
        true
    }

    /// Temp basals end one second before the scheduled basal that follows.
    /// That second is filled in; any other gap makes the temp's end uncertain.
    fn check_temp_gap(&mut self, closed: Option<&DraftBasal>, next: &EventMeta) {
        let temp = match closed {
            Some(basal) => Some(basal).filter(|b| b.is(DeliveryType::Temp)),
            None => self.prev_basal.as_ref().filter(|b| {
                b.is(DeliveryType::Temp) && b.expected_duration.is_some_and(|e| e > 0)
            }),
        };
        let Some(temp) = temp.cloned() else {
            return;
        };

        let duration = temp.duration.unwrap_or(0);
        let gap = (next.time - (temp.meta.time + Duration::milliseconds(duration))).num_milliseconds();
        if gap == 0 {
            return;
        }
        if gap == 1000 {
            let mut meta = EventMeta::new(temp.meta.device_time_plus(duration), temp.meta.device_id.clone());
            meta.index = temp.meta.index;
            self.config.tzo.fill_in(&mut meta);
            meta.annotate(codes::ONE_SECOND_GAP);
            let mut filler = DraftBasal::temp(meta);
            filler.duration = Some(1000);
            filler.rate = temp.rate;
            filler.suppressed = temp.suppressed.clone();
            self.events.push(Event::Basal(filler.done()));
        } else {
            debug!(time = %next.time, "unexpected gap before scheduled basal");
            if let Some(Event::Basal(last)) = self.last_basal_pos.and_then(|i| self.events.get_mut(i)) {
                last.meta.annotate(codes::UNKNOWN_DURATION);
            }
        }
    }

    pub fn bolus(&mut self, mut event: Bolus) -> DriverResult<()> {
        self.ensure_timestamp(event.meta.time)?;
        let Some(mut wizard) = self.curr_wizard.take() else {
            self.events.push(Event::Bolus(event));
            return Ok(());
        };

        let since_wizard = (event.meta.device_time - wizard.meta.device_time).num_milliseconds();
        if (0..WIZARD_BOLUS_WINDOW_MS).contains(&since_wizard) {
            // the wizard's own IOB is zero when no BG was entered
            wizard.inputs.insulin_on_board = event.iob;
            event.meta.index = None;
            event.iob = None;
            self.check_for_exchanges(&mut wizard.inputs);
            self.events.push(Event::Wizard(wizard.finish(event)));
        } else {
            debug!(device_time = %wizard.meta.device_time, "no matching bolus for wizard");
            self.events.push(Event::Bolus(event));
        }
        Ok(())
    }

    pub fn wizard(&mut self, mut event: DraftWizard) -> DriverResult<()> {
        if let Some(bolus) = event.bolus.take() {
            self.events.push(Event::Wizard(event.finish(bolus)));
            return Ok(());
        }
        if let Some(pending) = self.curr_wizard.take() {
            self.push_wizard_with_zero_bolus(pending);
        }
        self.curr_wizard = Some(event);
        Ok(())
    }

    fn check_for_exchanges(&self, inputs: &mut WizardInputs) {
        let exchanges = self
            .curr_settings
            .as_ref()
            .is_some_and(|s| s.settings.units.carb == Some(CarbUnits::Exchanges));
        if exchanges {
            inputs.carb_input = (inputs.carb_input / 10.0 * 15.0).round();
            inputs.insulin_carb_ratio = (15.0 / (inputs.insulin_carb_ratio / 100.0)).round();
        }
    }

    /// Wizard without a bolus record: the user accepted a 0U bolus.
    fn push_wizard_with_zero_bolus(&mut self, mut wizard: DraftWizard) {
        self.check_for_exchanges(&mut wizard.inputs);
        let mut meta = EventMeta::new(wizard.meta.device_time, wizard.meta.device_id.clone());
        meta.take_clock_from(&wizard.meta);
        let mut bolus = Bolus::normal(meta, 0.0);
        bolus.expected_normal = Some(0.0);
        self.events.push(Event::Wizard(wizard.finish(bolus)));
    }

    pub fn smbg(&mut self, event: Smbg) -> DriverResult<()> {
        if let Some(curr) = self.curr_smbg.as_ref().filter(|c| c.value == event.value) {
            let duplicate = curr.meta.ms_until(&event.meta) < DUPLICATE_SMBG_WINDOW_MS
                && event.sub_type == Some(SmbgSubType::Manual)
                && curr.sub_type == Some(SmbgSubType::Linked);
            if duplicate {
                debug!(value = event.value, time = %event.meta.time, "dropping duplicate manual smbg");
                return Ok(());
            }
        }
        self.simple(Event::Smbg(event.clone()))?;
        self.curr_smbg = Some(event);
        Ok(())
    }

    pub fn pump_settings(&mut self, mut event: PumpSettings) -> DriverResult<()> {
        event.manufacturers = self.config.manufacturers.clone();
        event.model = Some(self.config.model.clone());
        event.serial_number = Some(self.config.serial_number.clone());
        event.display = Some(Display {
            blood_glucose: BloodGlucoseDisplay {
                units: event.settings.units.bg,
            },
        });

        // point-in-time values carry forward until they change
        if let Some(curr) = &self.curr_settings {
            let (bolus, basal) = (&curr.settings.bolus, &curr.settings.basal);
            let next = &mut event.settings;
            if next.bolus.amount_maximum.is_none() {
                next.bolus.amount_maximum = bolus.amount_maximum.clone();
            }
            if next.bolus.extended.is_none() {
                next.bolus.extended = bolus.extended;
            }
            if next.basal.rate_maximum.is_none() {
                next.basal.rate_maximum = basal.rate_maximum.clone();
            }
            if next.basal.temporary.is_none() {
                next.basal.temporary = basal.temporary.clone();
            }
        }

        self.simple(Event::PumpSettings(event.clone()))?;
        self.curr_settings = Some(event);
        Ok(())
    }

    fn status(&mut self, event: DeviceEvent) -> DriverResult<()> {
        self.simple(Event::DeviceEvent(event.clone()))?;
        self.curr_status = Some(event);
        Ok(())
    }

    fn set_suspending(&mut self, event: DeviceEvent) -> DriverResult<()> {
        if self
            .curr_basal
            .as_ref()
            .is_some_and(|b| !b.is(DeliveryType::Suspend))
        {
            self.suspending = Some(event);
            Ok(())
        } else {
            self.simple(Event::DeviceEvent(event))
        }
    }

    fn alarm(&mut self, event: DeviceEvent) -> DriverResult<()> {
        let alarm_type = match &event.kind {
            DeviceEventKind::Alarm(alarm) => alarm.alarm_type,
            _ => return self.simple(Event::DeviceEvent(event)),
        };

        if matches!(alarm_type, AlarmType::NoDelivery | AlarmType::AutoOff) && self.suspending.is_none() {
            // emitted with its status once the resume tells how long it lasted
            return self.set_suspending(event);
        }

        let battery_out = alarm_type == AlarmType::Other
            && event
                .meta
                .payload_value("alarm_id")
                .and_then(|v| v.as_u64())
                == Some(ALARM_BATTERY_OUT);
        if battery_out {
            let schedule = self.active_schedule().map(|(_, s)| s);
            if let Some(curr) = self.curr_basal.as_mut() {
                debug!(time = %event.meta.time, basal = %curr.meta.time, "battery out too long");
                curr.meta.annotate(codes::UNKNOWN_DURATION);

                if let Some(schedule) = schedule.filter(|_| curr.is(DeliveryType::Scheduled)) {
                    // no longer than its scheduled segment
                    let start = curr.meta.ms_in_current_day();
                    for (i, segment) in schedule.iter().enumerate() {
                        if start >= segment.start && curr.rate == Some(segment.rate) {
                            if let Some(next) = schedule.get(i + 1) {
                                curr.duration = Some(next.start - segment.start);
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.simple(Event::DeviceEvent(event))
    }

    fn prime(&mut self, event: DeviceEvent) -> DriverResult<()> {
        if self.suspending.is_some() {
            self.resuming = Some(event.clone());
        }
        self.simple(Event::DeviceEvent(event))
    }

    fn rewind(&mut self, event: DeviceEvent) -> DriverResult<()> {
        if self.suspending.is_none() {
            self.set_suspending(event)
        } else {
            self.simple(Event::DeviceEvent(event))
        }
    }

    /// A pump clock change during a temp basal splits it, since schedule
    /// segments follow the clock.
    fn time_change(&mut self, event: DeviceEvent) -> DriverResult<()> {
        let pump_clock = event
            .as_time_change()
            .is_some_and(|tc| tc.source == ClockSource::Pump);
        let in_temp = self
            .curr_basal
            .as_ref()
            .is_some_and(|b| b.is(DeliveryType::Temp));

        if pump_clock && in_temp {
            if let Some(curr) = self.curr_basal.as_mut() {
                curr.duration = Some(curr.meta.ms_until(&event.meta));
            }
            self.check_for_schedule_changes(None);
            if let Some(curr) = self.curr_basal.take() {
                let closed = self.push_basal(curr);

                let mut meta = EventMeta::new(event.meta.device_time, event.meta.device_id.clone());
                meta.take_clock_from(&event.meta);
                meta.index = event.meta.index.map(|i| i + 1);
                meta.annotate(codes::TIME_CHANGE_SPLIT);
                let mut split = DraftBasal::temp(meta);
                split.rate = closed.rate;
                split.suppressed = closed.suppressed.clone();

                self.prev_basal = Some(closed);
                self.curr_basal = Some(split);
            }
        }
        self.simple(Event::DeviceEvent(event))
    }

    /// Close the basal and wizard still open at the end of the stream.
    pub fn finalize(&mut self) {
        if let Some(mut curr) = self.curr_basal.take() {
            match self.curr_settings.as_ref().filter(|_| curr.is(DeliveryType::Scheduled)) {
                Some(settings) => {
                    curr.schedule_name = Some(settings.settings.active_schedule.clone());
                    if curr.duration.is_none() {
                        final_scheduled_basal(&mut curr, settings.settings.active_segments());
                    }
                    self.push_closed(curr);
                }
                None => {
                    self.push_basal(curr);
                }
            }
        }

        if let Some(wizard) = self.curr_wizard.take() {
            self.push_wizard_with_zero_bolus(wizard);
        }
    }

    /// The simulated stream without unset-clock dates and empty deliveries,
    /// ordered by time.
    pub fn get_events(self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .into_iter()
            .filter(|event| {
                use chrono::Datelike;
                if event.time().year() <= LAST_UNSET_CLOCK_YEAR {
                    debug!(time = %event.time(), kind = event.type_name(), "dropping event with unset clock");
                    return false;
                }
                match event {
                    Event::Bolus(bolus) => !bolus.is_empty_delivery(),
                    Event::Wizard(wizard) => {
                        !(wizard.bolus.is_empty_delivery() && wizard.inputs.carb_input == 0.0)
                    }
                    _ => true,
                }
            })
            .collect();
        events.sort_by_key(|e| e.time());

        for event in events.iter_mut() {
            event.meta_mut().index = None;
        }
        if events.is_empty() {
            warn!("simulation produced no events");
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use medlink_sdk::{BgUnits, BolusSubType, Recommended, SettingsSnapshot, TargetRange};
    use std::collections::BTreeMap;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 11, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn meta(dt: NaiveDateTime, index: u64) -> EventMeta {
        EventMeta::new(dt, "MedT-554-123456").with_index(index)
    }

    fn simulator() -> MedtronicSimulator {
        MedtronicSimulator::new(SimulatorConfig {
            manufacturers: vec!["Medtronic".into()],
            model: "554".into(),
            serial_number: "123456".into(),
            tzo: TzoUtil::fixed(0),
        })
    }

    fn settings(dt: NaiveDateTime, schedule: Vec<ScheduleSegment>) -> DraftEvent {
        DraftEvent::PumpSettings(PumpSettings::new(
            meta(dt, 0),
            SettingsSnapshot {
                active_schedule: "standard".into(),
                basal_schedules: BTreeMap::from([("standard".to_string(), schedule)]),
                ..Default::default()
            },
        ))
    }

    fn temp(dt: NaiveDateTime, rate: f64, duration: i64, index: u64) -> DraftEvent {
        let mut basal = DraftBasal::temp(meta(dt, index));
        basal.rate = Some(rate);
        basal.duration = Some(duration);
        DraftEvent::Basal(basal)
    }

    fn scheduled(dt: NaiveDateTime, rate: f64, index: u64) -> DraftEvent {
        DraftEvent::Basal(DraftBasal::scheduled(meta(dt, index), rate, None))
    }

    fn basals(events: &[Event]) -> Vec<&medlink_sdk::Basal> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Basal(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    fn inputs(carb_input: f64) -> WizardInputs {
        WizardInputs {
            recommended: Recommended {
                carb: 0.0,
                correction: 0.0,
                net: 0.0,
            },
            carb_input,
            bg_input: None,
            insulin_carb_ratio: 10.0,
            insulin_sensitivity: 50.0,
            bg_target: TargetRange {
                low: 100.0,
                high: 120.0,
            },
            units: BgUnits::MgDl,
            carb_units: CarbUnits::Grams,
            insulin_on_board: None,
        }
    }

    const HOUR: i64 = 60 * MS_PER_MINUTE;

    #[test]
    fn temp_basal_is_split_at_midnight_schedule_change() {
        let schedule = vec![
            ScheduleSegment { start: 0, rate: 0.5 },
            ScheduleSegment { start: 12 * HOUR, rate: 1.0 },
        ];
        let events = simulator()
            .run([
                settings(at(14, 22, 0, 0), schedule),
                temp(at(14, 23, 0, 0), 2.0, 2 * HOUR, 1),
                scheduled(at(15, 1, 0, 0), 0.5, 2),
            ])
            .unwrap();

        let basals = basals(&events);
        assert_eq!(basals.len(), 3);

        assert_eq!(basals[0].duration, HOUR);
        assert_eq!(basals[0].suppressed.as_ref().unwrap().rate, Some(1.0));
        assert_eq!(
            basals[0].meta.payload_value("duration"),
            Some(&serde_json::Value::from(2 * HOUR))
        );

        assert_eq!(basals[1].meta.device_time, at(15, 0, 0, 0));
        assert_eq!(basals[1].rate, Some(2.0));
        assert_eq!(basals[1].duration, HOUR);
        let suppressed = basals[1].suppressed.as_ref().unwrap();
        assert_eq!(suppressed.rate, Some(0.5));
        assert!(suppressed.annotations.contains(codes::FABRICATED_FROM_SCHEDULE));

        assert_eq!(basals[2].delivery_type, DeliveryType::Scheduled);
        assert_eq!(basals[2].duration, 11 * HOUR);
        assert!(basals[2].meta.is_annotated(codes::FINAL_BASAL_FABRICATED));
    }

    #[test]
    fn cancelled_temp_fills_one_second_gap() {
        let schedule = vec![ScheduleSegment { start: 0, rate: 0.8 }];
        let events = simulator()
            .run([
                settings(at(14, 9, 0, 0), schedule),
                scheduled(at(14, 9, 30, 0), 0.8, 1),
                temp(at(14, 10, 0, 0), 1.5, 30 * MS_PER_MINUTE, 2),
                temp(at(14, 10, 10, 0), 0.0, 0, 3),
                scheduled(at(14, 10, 10, 1), 0.8, 4),
            ])
            .unwrap();

        let basals = basals(&events);
        let cancelled = basals[1];
        assert_eq!(cancelled.duration, 10 * MS_PER_MINUTE);
        assert_eq!(cancelled.expected_duration, Some(30 * MS_PER_MINUTE));
        assert_eq!(
            cancelled.suppressed.as_ref().unwrap().delivery_type,
            DeliveryType::Scheduled
        );

        let filler = basals[2];
        assert_eq!(filler.duration, 1000);
        assert!(filler.meta.is_annotated(codes::ONE_SECOND_GAP));
        assert_eq!(filler.meta.device_time, at(14, 10, 10, 0));
    }

    #[test]
    fn no_delivery_alarm_fabricates_suspension() {
        let alarm = DeviceEvent::new(
            meta(at(14, 9, 0, 0), 2),
            DeviceEventKind::Alarm(medlink_sdk::AlarmEvent {
                alarm_type: AlarmType::NoDelivery,
                status: None,
            }),
        );
        let events = simulator()
            .run([
                scheduled(at(14, 8, 0, 0), 0.8, 1),
                DraftEvent::DeviceEvent(alarm),
                scheduled(at(14, 10, 0, 0), 0.8, 3),
            ])
            .unwrap();

        let basals = basals(&events);
        assert_eq!(basals[0].duration, HOUR);
        assert_eq!(basals[1].delivery_type, DeliveryType::Suspend);
        assert_eq!(basals[1].duration, HOUR);
        assert_eq!(basals[1].suppressed.as_ref().unwrap().rate, Some(0.8));

        let alarm = events
            .iter()
            .find_map(|e| match e {
                Event::DeviceEvent(d) => match &d.kind {
                    DeviceEventKind::Alarm(a) => Some(a),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        let status = alarm.status.as_ref().unwrap();
        assert!(status.meta.is_annotated(codes::STATUS_FABRICATED));
        assert_eq!(
            status.meta.payload_value("cause"),
            Some(&serde_json::Value::from("no_delivery"))
        );
        let status = status.as_status().unwrap();
        assert_eq!(status.duration, HOUR);
        assert_eq!(status.reason.resumed, Agent::Manual);
    }

    #[test]
    fn wizard_takes_bolus_within_thirty_seconds() {
        let mut bolus = Bolus::normal(meta(at(14, 12, 0, 5), 11), 3.0);
        bolus.iob = Some(1.5);
        let events = simulator()
            .run([
                DraftEvent::Wizard(DraftWizard::new(meta(at(14, 12, 0, 0), 10), inputs(45.0))),
                DraftEvent::Bolus(bolus),
            ])
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Wizard(w) => {
                assert_eq!(w.inputs.insulin_on_board, Some(1.5));
                assert_eq!(w.bolus.normal, Some(3.0));
                assert_eq!(w.bolus.sub_type, BolusSubType::Normal);
                assert_eq!(w.bolus.meta.index, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unanswered_wizards_get_zero_bolus() {
        let events = simulator()
            .run([
                DraftEvent::Wizard(DraftWizard::new(meta(at(14, 12, 0, 0), 1), inputs(30.0))),
                DraftEvent::Wizard(DraftWizard::new(meta(at(14, 13, 0, 0), 2), inputs(0.0))),
            ])
            .unwrap();
        // the carb-free one is dropped
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Wizard(w) => {
                assert_eq!(w.inputs.carb_input, 30.0);
                assert_eq!(w.bolus.normal, Some(0.0));
                assert_eq!(w.bolus.expected_normal, Some(0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exchanges_are_converted() {
        let mut settings = PumpSettings::new(meta(at(14, 11, 0, 0), 0), SettingsSnapshot::default());
        settings.settings.units.carb = Some(CarbUnits::Exchanges);
        let mut wizard_inputs = inputs(20.0);
        wizard_inputs.insulin_carb_ratio = 150.0;
        let events = simulator()
            .run([
                DraftEvent::PumpSettings(settings),
                DraftEvent::Wizard(DraftWizard::new(meta(at(14, 12, 0, 0), 1), wizard_inputs)),
                DraftEvent::Bolus(Bolus::normal(meta(at(14, 12, 0, 0), 2), 2.0)),
            ])
            .unwrap();
        match &events[1] {
            Event::Wizard(w) => {
                assert_eq!(w.inputs.carb_input, 30.0);
                assert_eq!(w.inputs.insulin_carb_ratio, 10.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manual_copy_of_linked_reading_is_dropped() {
        let linked = Smbg {
            meta: meta(at(14, 7, 0, 0), 1),
            sub_type: Some(SmbgSubType::Linked),
            value: 120.0,
            units: BgUnits::MgDl,
        };
        let manual = Smbg {
            meta: meta(at(14, 7, 5, 0), 2),
            sub_type: Some(SmbgSubType::Manual),
            ..linked.clone()
        };
        let events = simulator()
            .run([DraftEvent::Smbg(linked), DraftEvent::Smbg(manual)])
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn unset_clock_years_are_dropped() {
        let old = NaiveDate::from_ymd_opt(2012, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let events = simulator()
            .run([
                DraftEvent::Bolus(Bolus::normal(meta(old, 1), 1.0)),
                DraftEvent::Bolus(Bolus::normal(meta(at(14, 8, 0, 0), 2), 1.0)),
            ])
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta().device_time, at(14, 8, 0, 0));
    }

    #[test]
    fn last_day_before_2012_is_an_unset_clock() {
        let old = NaiveDate::from_ymd_opt(2011, 12, 31)
            .unwrap()
            .and_hms_opt(23, 0, 0)
            .unwrap();
        let events = simulator()
            .run([
                DraftEvent::Bolus(Bolus::normal(meta(old, 1), 1.0)),
                DraftEvent::Bolus(Bolus::normal(meta(at(14, 8, 0, 0), 2), 1.0)),
            ])
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events.iter().all(|e| e.meta().device_time != old));
    }

    #[test]
    fn out_of_order_input_fails() {
        let mut sim = simulator();
        sim.simulate(scheduled(at(14, 8, 0, 0), 0.8, 1)).unwrap();
        let err = sim.simulate(scheduled(at(14, 7, 0, 0), 0.8, 2)).unwrap_err();
        assert!(matches!(err, DriverError::SimulationError(_)));
    }

    #[test]
    fn second_pass_is_stable() {
        let first = simulator()
            .run([
                scheduled(at(14, 1, 0, 0), 0.8, 1),
                DraftEvent::Bolus(Bolus::normal(meta(at(14, 2, 0, 0), 2), 1.2)),
                scheduled(at(14, 3, 0, 0), 1.0, 3),
            ])
            .unwrap();
        let second = simulator()
            .run(first.iter().cloned().map(DraftEvent::from))
            .unwrap();
        assert_eq!(first, second);

        let basals = basals(&first);
        assert_eq!(basals[0].duration, 2 * HOUR);
        assert_eq!(basals[1].duration, 0);
        assert!(basals[1].meta.is_annotated(codes::UNKNOWN_DURATION));
    }

    #[test]
    fn second_pass_keeps_midnight_split() {
        let schedule = vec![
            ScheduleSegment { start: 0, rate: 0.5 },
            ScheduleSegment { start: 12 * HOUR, rate: 1.0 },
        ];
        let first = simulator()
            .run([
                settings(at(14, 22, 0, 0), schedule),
                temp(at(14, 23, 0, 0), 2.0, 2 * HOUR, 1),
                scheduled(at(15, 1, 0, 0), 0.5, 2),
            ])
            .unwrap();
        let second = simulator()
            .run(first.iter().cloned().map(DraftEvent::from))
            .unwrap();

        let shape = |events: &[Event]| -> Vec<(NaiveDateTime, i64, Option<f64>)> {
            basals(events)
                .into_iter()
                .map(|b| {
                    (
                        b.meta.device_time,
                        b.duration,
                        b.suppressed.as_ref().and_then(|s| s.rate),
                    )
                })
                .collect()
        };
        assert_eq!(
            shape(&first),
            vec![
                (at(14, 23, 0, 0), HOUR, Some(1.0)),
                (at(15, 0, 0, 0), HOUR, Some(0.5)),
                (at(15, 1, 0, 0), 11 * HOUR, None),
            ]
        );
        assert_eq!(shape(&second), shape(&first));
        assert!(basals(&second).iter().all(|b| b.duration > 0));
    }

    #[test]
    fn split_at_segment_start_is_skipped() {
        let schedule = vec![
            ScheduleSegment { start: 0, rate: 0.5 },
            ScheduleSegment { start: 10 * HOUR, rate: 1.0 },
        ];
        // suppressed rate is stale but the temp starts exactly on the boundary
        let events = simulator()
            .run([
                settings(at(14, 8, 0, 0), schedule),
                scheduled(at(14, 9, 0, 0), 0.5, 1),
                temp(at(14, 10, 0, 0), 2.0, HOUR, 2),
                scheduled(at(14, 11, 0, 0), 1.0, 3),
            ])
            .unwrap();
        let basals = basals(&events);
        assert!(basals.iter().all(|b| b.duration > 0));
        assert_eq!(
            basals.iter().filter(|b| b.delivery_type == DeliveryType::Temp).count(),
            1
        );
    }
}
