use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::FlatDraft;

/// A field-level validation failure, surfaced inline next to the offending
/// field by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub birth_date: Option<NaiveDate>,
}

const PASSWORD_SPECIALS: &str = "!@#$%^&*";

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\S+@\S+\.\S+$").expect("static regex"))
}

pub fn validate_email(email: &str) -> bool {
    email_regex().is_match(email)
}

/// At least 6 characters, one uppercase letter, one digit, one of `!@#$%^&*`,
/// and nothing outside the alphanumeric + special alphabet.
pub fn validate_password(password: &str) -> bool {
    password.chars().count() >= 6
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| PASSWORD_SPECIALS.contains(c))
        && password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || PASSWORD_SPECIALS.contains(c))
}

/// Calendar age at `on`: the year difference, minus one if the birthday has
/// not yet occurred that year.
pub fn age_on(birth_date: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - birth_date.year();
    if (on.month(), on.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    age
}

pub fn age_today(birth_date: NaiveDate) -> i32 {
    age_on(birth_date, Utc::now().date_naive())
}

/// Field checks for a registration form. Email uniqueness is a backend query
/// and lives in the session store, not here.
pub fn validate_registration(reg: &Registration) -> Result<(), ValidationError> {
    if reg.first_name.trim().len() < 2 {
        return Err(ValidationError::new(
            "first_name",
            "First name must be at least 2 characters long",
        ));
    }
    if reg.last_name.trim().len() < 2 {
        return Err(ValidationError::new(
            "last_name",
            "Last name must be at least 2 characters long",
        ));
    }
    if !validate_email(&reg.email) {
        return Err(ValidationError::new("email", "Invalid email format"));
    }
    if !validate_password(&reg.password) {
        return Err(ValidationError::new(
            "password",
            "Password must be at least 6 characters long, contain one uppercase \
             letter, one number, and one special character",
        ));
    }
    let Some(birth_date) = reg.birth_date else {
        return Err(ValidationError::new("birth_date", "Birth date is required"));
    };
    let age = age_today(birth_date);
    if !(18..=120).contains(&age) {
        return Err(ValidationError::new(
            "birth_date",
            "Age must be between 18 and 120 years",
        ));
    }
    Ok(())
}

pub fn validate_flat(draft: &FlatDraft) -> Result<(), ValidationError> {
    if draft.name.trim().is_empty() {
        return Err(ValidationError::new("name", "Name is required"));
    }
    if draft.city.trim().is_empty() {
        return Err(ValidationError::new("city", "City is required"));
    }
    if draft.street_name.trim().is_empty() {
        return Err(ValidationError::new("street_name", "Street name is required"));
    }
    if draft.street_number == 0 {
        return Err(ValidationError::new("street_number", "Street number is required"));
    }
    if draft.area_size <= 0.0 {
        return Err(ValidationError::new("area_size", "Area size must be greater than 0"));
    }
    if draft.rent_price <= 0.0 {
        return Err(ValidationError::new("rent_price", "Rent price must be greater than 0"));
    }
    let current_year = Utc::now().year();
    if draft.year_built < 1800 || draft.year_built > current_year {
        return Err(ValidationError::new("year_built", "Please enter a valid year"));
    }
    Ok(())
}
