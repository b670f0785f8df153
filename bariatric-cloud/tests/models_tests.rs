use bariatric_cloud::bmi::{self, BmiCategory};
use bariatric_cloud::{Patient, Prediction, SurveyData, SyncEntity, User};
use pretty_assertions::assert_eq;
use serde_json::json;

// --- BMI ---

#[test]
fn bmi_from_kg_and_cm() {
    assert!((bmi::calculate(70, 175) - 22.857).abs() < 0.001);
    assert_eq!(bmi::format(bmi::calculate(70, 175)), "22.9");
}

#[test]
fn bmi_is_zero_without_height() {
    assert_eq!(bmi::calculate(70, 0), 0.0);
    assert_eq!(bmi::calculate(70, -5), 0.0);
}

#[test]
fn bmi_category_band_edges() {
    assert_eq!(BmiCategory::from_bmi(18.4), BmiCategory::Underweight);
    assert_eq!(BmiCategory::from_bmi(18.5), BmiCategory::Normal);
    assert_eq!(BmiCategory::from_bmi(25.0), BmiCategory::Overweight);
    assert_eq!(BmiCategory::from_bmi(30.0), BmiCategory::ObesityClassI);
    assert_eq!(BmiCategory::from_bmi(35.0), BmiCategory::ObesityClassII);
    assert_eq!(BmiCategory::from_bmi(40.0), BmiCategory::ObesityClassIII);
    assert_eq!(BmiCategory::ObesityClassIII.to_string(), "Obesity class III");
}

// --- Models ---

#[test]
fn user_full_name_skips_missing_parts() {
    let user: User = serde_json::from_value(json!({ "id": 3, "name": "Jan", "email": "jan@clinic.example" })).unwrap();
    assert_eq!(user.full_name(), "Jan");

    let user = User {
        surname: "Nowak".into(),
        ..user
    };
    assert_eq!(user.full_name(), "Jan Nowak");
}

#[test]
fn patient_uses_snake_case_wire_names() {
    let patient: Patient = serde_json::from_value(json!({
        "patient_number": "P-100",
        "submission_date": "2026-02-11",
        "status": "pending"
    }))
    .unwrap();
    assert_eq!(patient.patient_number, "P-100");
}

#[test]
fn survey_uses_camel_case_wire_names() {
    let survey: SurveyData = serde_json::from_value(json!({
        "patientCode": "P-100",
        "referralPIN": "1234",
        "weight": 150,
        "height": 175,
        "considerSurgery": true,
        "diseases": ["diabetes"]
    }))
    .unwrap();

    assert_eq!(survey.referral_pin, "1234");
    assert!(survey.consider_surgery);
    assert_eq!(survey.diseases, vec!["diabetes".to_string()]);
    assert_eq!(BmiCategory::from_bmi(survey.computed_bmi()), BmiCategory::ObesityClassIII);
    assert_eq!(SurveyData::ENTITY_TYPE, "surveys");

    let value = serde_json::to_value(&survey).unwrap();
    assert_eq!(value["referralPIN"], "1234");
    assert_eq!(value["patientCode"], "P-100");
}

#[test]
fn prediction_wire_format() {
    let prediction: Prediction =
        serde_json::from_value(json!({ "one_month": 140.0, "three_months": 128.5, "six_months": 117.0 })).unwrap();
    assert_eq!(prediction.three_months, 128.5);
}
