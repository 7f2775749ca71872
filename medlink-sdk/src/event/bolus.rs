use super::{BgUnits, CarbUnits, EventMeta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusSubType {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "square")]
    Square,
    #[serde(rename = "dual/square")]
    Dual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bolus {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub sub_type: BolusSubType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    /// Insulin on board reported with the bolus; moved to the wizard.
    #[serde(skip)]
    pub iob: Option<f64>,
}

impl Bolus {
    pub fn new(meta: EventMeta, sub_type: BolusSubType) -> Self {
        Self {
            meta,
            sub_type,
            normal: None,
            expected_normal: None,
            extended: None,
            expected_extended: None,
            duration: None,
            expected_duration: None,
            iob: None,
        }
    }

    pub fn normal(meta: EventMeta, amount: f64) -> Self {
        Self {
            normal: Some(amount),
            ..Self::new(meta, BolusSubType::Normal)
        }
    }

    /// Zero-volume normal bolus that was never cancelled.
    pub fn is_empty_delivery(&self) -> bool {
        self.normal == Some(0.0) && !self.expected_normal.is_some_and(|e| e != 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Recommended {
    pub carb: f64,
    pub correction: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetRange {
    pub low: f64,
    pub high: f64,
}

/// Fields logged by the bolus calculator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardInputs {
    pub recommended: Recommended,
    pub carb_input: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    pub insulin_carb_ratio: f64,
    pub insulin_sensitivity: f64,
    pub bg_target: TargetRange,
    pub units: BgUnits,
    pub carb_units: CarbUnits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
}

/// Wizard record waiting for the bolus it triggered.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftWizard {
    pub meta: EventMeta,
    pub inputs: WizardInputs,
    /// Already paired bolus, present when a finalized wizard is reopened.
    pub bolus: Option<Bolus>,
}

impl DraftWizard {
    pub fn new(meta: EventMeta, inputs: WizardInputs) -> Self {
        Self {
            meta,
            inputs,
            bolus: None,
        }
    }

    pub fn finish(self, bolus: Bolus) -> Wizard {
        Wizard {
            meta: self.meta,
            inputs: self.inputs,
            bolus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wizard {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub inputs: WizardInputs,
    pub bolus: Bolus,
}

impl From<Wizard> for DraftWizard {
    fn from(w: Wizard) -> Self {
        Self {
            meta: w.meta,
            inputs: w.inputs,
            bolus: Some(w.bolus),
        }
    }
}
