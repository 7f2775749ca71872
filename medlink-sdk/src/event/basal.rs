use super::{codes, EventMeta, MS_PER_DAY};
use serde::{Deserialize, Serialize};

const FIVE_DAYS_MS: i64 = 5 * MS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    Scheduled,
    Temp,
    Suspend,
}

/// Delivery overridden by a temp or suspended basal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressedBasal {
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "super::Annotations::is_empty")]
    pub annotations: super::Annotations,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Box<SuppressedBasal>>,
}

impl SuppressedBasal {
    pub fn new(delivery_type: DeliveryType, rate: Option<f64>) -> Self {
        Self {
            delivery_type,
            rate,
            schedule_name: None,
            annotations: Default::default(),
            suppressed: None,
        }
    }

    pub fn scheduled(rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            schedule_name,
            ..Self::new(DeliveryType::Scheduled, Some(rate))
        }
    }

    /// Number of nested levels including this one.
    pub fn depth(&self) -> usize {
        1 + self.suppressed.as_ref().map_or(0, |s| s.depth())
    }

    /// The innermost suppressed delivery.
    pub fn innermost(&self) -> &SuppressedBasal {
        match &self.suppressed {
            Some(inner) => inner.innermost(),
            None => self,
        }
    }
}

/// Basal whose end is not known yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftBasal {
    pub meta: EventMeta,
    pub delivery_type: DeliveryType,
    pub rate: Option<f64>,
    pub percent: Option<f64>,
    pub duration: Option<i64>,
    pub expected_duration: Option<i64>,
    pub schedule_name: Option<String>,
    pub suppressed: Option<SuppressedBasal>,
}

impl DraftBasal {
    fn open(meta: EventMeta, delivery_type: DeliveryType) -> Self {
        Self {
            meta,
            delivery_type,
            rate: None,
            percent: None,
            duration: None,
            expected_duration: None,
            schedule_name: None,
            suppressed: None,
        }
    }

    pub fn scheduled(meta: EventMeta, rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            rate: Some(rate),
            schedule_name,
            ..Self::open(meta, DeliveryType::Scheduled)
        }
    }

    pub fn temp(meta: EventMeta) -> Self {
        Self::open(meta, DeliveryType::Temp)
    }

    pub fn suspend(meta: EventMeta) -> Self {
        Self::open(meta, DeliveryType::Suspend)
    }

    pub fn is(&self, delivery_type: DeliveryType) -> bool {
        self.delivery_type == delivery_type
    }

    /// This basal seen as the suppressed delivery of whatever replaces it.
    pub fn as_suppressed(&self) -> SuppressedBasal {
        SuppressedBasal {
            schedule_name: self.schedule_name.clone(),
            ..SuppressedBasal::new(self.delivery_type, self.rate)
        }
    }

    /// Cap flat-rate basals at five days and give undetermined ones a zero
    /// duration, annotating either case.
    pub fn truncate_duration(&mut self, source: &str) {
        match self.duration {
            Some(d) if d > FIVE_DAYS_MS => {
                self.duration = Some(FIVE_DAYS_MS);
                self.meta.annotate(&format!("{source}/basal/flat-rate"));
            }
            Some(_) => {}
            None => {
                self.duration = Some(0);
                self.meta.annotate(codes::UNKNOWN_DURATION);
            }
        }
    }

    /// Close the basal, applying the duration rules of [`truncate_duration`].
    ///
    /// [`truncate_duration`]: DraftBasal::truncate_duration
    pub fn close(mut self, source: &str) -> Basal {
        self.truncate_duration(source);
        self.done()
    }

    /// Close without truncation. An unset duration becomes zero.
    pub fn done(self) -> Basal {
        Basal {
            meta: self.meta,
            delivery_type: self.delivery_type,
            rate: self.rate,
            percent: self.percent,
            duration: self.duration.unwrap_or(0),
            expected_duration: self.expected_duration,
            schedule_name: self.schedule_name,
            suppressed: self.suppressed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Basal {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<SuppressedBasal>,
}

impl From<Basal> for DraftBasal {
    fn from(b: Basal) -> Self {
        Self {
            meta: b.meta,
            delivery_type: b.delivery_type,
            rate: b.rate,
            percent: b.percent,
            duration: Some(b.duration),
            expected_duration: b.expected_duration,
            schedule_name: b.schedule_name,
            suppressed: b.suppressed,
        }
    }
}
