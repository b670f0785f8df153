//! Domain models exchanged with the REST API.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An entity type kept in the offline cache and synced by [`crate::SyncEngine`].
pub trait SyncEntity: Serialize + DeserializeOwned + Send + Sync {
    /// Collection name, used both as the URL segment and the cache key.
    const ENTITY_TYPE: &'static str;
}

/// Clinician profile returned at login.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub surname: String,
    #[serde(default)]
    pub email: String,
}

impl User {
    /// "Name Surname", skipping whichever part is empty.
    pub fn full_name(&self) -> String {
        [self.name.trim(), self.surname.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Patient row shown on the dashboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_number: String,
    pub submission_date: String,
    pub status: String,
}

/// Pre-operative intake survey.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SurveyData {
    pub patient_code: String,
    pub birth_date: String,
    pub gender: String,
    pub referral_type: String,
    #[serde(rename = "referralPIN")]
    pub referral_pin: String,
    /// kg
    pub weight: i32,
    /// cm
    pub height: i32,
    pub consider_surgery: bool,
    pub diseases: Vec<String>,
    pub additional_diseases: Vec<String>,
    pub contraindications: Vec<String>,
    pub other_diseases: String,
    pub max_weight: i32,
    pub obesity_years: i32,
    pub previous_treatments: Vec<String>,
    pub chronic_medication: bool,
    pub medication_details: String,
    pub physical_activity: bool,
    pub healthy_eating: bool,
    pub processed_food: bool,
    pub compulsive_eating: i32,
    pub alcohol_consumption: bool,
    pub smoking: bool,
    pub suicidal_thoughts: bool,
    pub psychiatrist_support: bool,
    pub psychiatric_diagnosis: String,
    pub psychologist_support: bool,
    pub family_diseases: Vec<String>,
    pub abdomen_surgeries: bool,
    pub surgeries_details: String,
    pub specialist_clinic: bool,
    pub clinic_type: String,
    pub bmi: f64,
    pub status: String,
    pub date: String,
    pub submission_date: String,
}

impl SurveyData {
    /// BMI from the recorded weight and height.
    pub fn computed_bmi(&self) -> f64 {
        crate::bmi::calculate(self.weight, self.height)
    }
}

impl SyncEntity for SurveyData {
    const ENTITY_TYPE: &'static str = "surveys";
}

/// Predicted weight after surgery, in kg.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub one_month: f64,
    pub three_months: f64,
    pub six_months: f64,
}
