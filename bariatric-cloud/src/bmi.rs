//! Body mass index helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// WHO adult BMI bands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BmiCategory {
    Underweight,
    Normal,
    Overweight,
    ObesityClassI,
    ObesityClassII,
    ObesityClassIII,
}

impl BmiCategory {
    pub fn from_bmi(bmi: f64) -> Self {
        if bmi < 18.5 {
            BmiCategory::Underweight
        } else if bmi < 25.0 {
            BmiCategory::Normal
        } else if bmi < 30.0 {
            BmiCategory::Overweight
        } else if bmi < 35.0 {
            BmiCategory::ObesityClassI
        } else if bmi < 40.0 {
            BmiCategory::ObesityClassII
        } else {
            BmiCategory::ObesityClassIII
        }
    }
}

impl fmt::Display for BmiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BmiCategory::Underweight => "Underweight",
            BmiCategory::Normal => "Normal weight",
            BmiCategory::Overweight => "Overweight",
            BmiCategory::ObesityClassI => "Obesity class I",
            BmiCategory::ObesityClassII => "Obesity class II",
            BmiCategory::ObesityClassIII => "Obesity class III",
        };
        f.write_str(label)
    }
}

/// BMI = kg / m². Returns 0 when the height is not positive.
pub fn calculate(weight_kg: i32, height_cm: i32) -> f64 {
    if height_cm <= 0 {
        return 0.0;
    }
    let meters = f64::from(height_cm) / 100.0;
    f64::from(weight_kg) / (meters * meters)
}

/// One decimal place, as shown on patient cards.
pub fn format(bmi: f64) -> String {
    format!("{bmi:.1}")
}
