//! Entity validators
//!
//! Each validator returns every problem it finds as a field to message map;
//! an empty map means the input is acceptable. [`ensure_valid`] turns a
//! non-empty map into [`Error::ValidationFailed`].

use crate::dispatch::SendCampaignParams;
use mailflock_common::types::EmailAddress;
use mailflock_common::{Error, FieldErrors, Result};
use mailflock_storage::{
    CreateCampaign, CreateSegment, CreateSubscriber, Metadata, UpdateCampaign, UpdateSubscriber,
};

/// Longest name accepted for campaigns, segments and subscribers
pub const MAX_NAME_LEN: usize = 191;

pub fn ensure_valid(errors: FieldErrors) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::ValidationFailed(errors))
    }
}

fn check_name(errors: &mut FieldErrors, field: &str, value: &str, required: bool) {
    let value = value.trim();
    if required && value.is_empty() {
        errors.insert(field.to_string(), format!("The {} field is required.", field));
    } else if value.chars().count() > MAX_NAME_LEN {
        errors.insert(
            field.to_string(),
            format!("The {} must be at most {} characters.", field, MAX_NAME_LEN),
        );
    }
}

pub fn validate_subscriber(input: &CreateSubscriber) -> FieldErrors {
    let mut errors = FieldErrors::new();
    check_name(&mut errors, "name", &input.name, false);

    if input.email.trim().is_empty() {
        errors.insert("email".to_string(), "The email field is required.".to_string());
    } else if EmailAddress::parse(input.email.trim()).is_none() {
        errors.insert("email".to_string(), "The email is invalid.".to_string());
    }

    check_metadata(&mut errors, &input.metadata);
    errors
}

/// The email of a subscriber cannot change, so only name and metadata are checked
pub fn validate_subscriber_update(input: &UpdateSubscriber) -> FieldErrors {
    let mut errors = FieldErrors::new();
    check_name(&mut errors, "name", &input.name, false);
    check_metadata(&mut errors, &input.metadata);
    errors
}

fn check_metadata(errors: &mut FieldErrors, metadata: &Metadata) {
    if metadata.keys().any(|k| k.trim().is_empty()) {
        errors.insert(
            "metadata".to_string(),
            "Metadata keys must not be empty.".to_string(),
        );
    }
}

pub fn validate_segment(input: &CreateSegment) -> FieldErrors {
    validate_segment_name(&input.name)
}

pub fn validate_segment_name(name: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    check_name(&mut errors, "name", name, true);
    errors
}

pub fn validate_campaign(input: &CreateCampaign) -> FieldErrors {
    check_campaign(&input.name, &input.template_name)
}

pub fn validate_campaign_update(input: &UpdateCampaign) -> FieldErrors {
    check_campaign(&input.name, &input.template_name)
}

fn check_campaign(name: &str, template_name: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    check_name(&mut errors, "name", name, true);
    if template_name.trim().is_empty() {
        errors.insert(
            "template_name".to_string(),
            "The template_name field is required.".to_string(),
        );
    }
    errors
}

pub fn validate_send_params(params: &SendCampaignParams) -> FieldErrors {
    let mut errors = FieldErrors::new();

    if params.segment_ids.is_empty() {
        errors.insert(
            "segment_ids".to_string(),
            "At least one segment is required.".to_string(),
        );
    } else if params.segment_ids.iter().any(|id| *id <= 0) {
        errors.insert(
            "segment_ids".to_string(),
            "Segment ids must be positive.".to_string(),
        );
    }

    if params.source.trim().is_empty() {
        errors.insert("source".to_string(), "The source field is required.".to_string());
    } else if source_address(&params.source).is_none() {
        errors.insert(
            "source".to_string(),
            "The source must be an email address, optionally as \"Name <address>\".".to_string(),
        );
    }

    if params.user_uuid.trim().is_empty() {
        errors.insert("user_uuid".to_string(), "The user_uuid field is required.".to_string());
    }

    if let Some(keys) = &params.ses_keys {
        if keys.access_key.is_empty() || keys.secret_key.is_empty() || keys.region.is_empty() {
            errors.insert(
                "ses_keys".to_string(),
                "Access key, secret key and region are all required.".to_string(),
            );
        }
    }
    errors
}

/// Address part of `addr` or `Display Name <addr>`
fn source_address(source: &str) -> Option<EmailAddress> {
    let source = source.trim();
    match (source.rfind('<'), source.strip_suffix('>')) {
        (Some(open), Some(inner)) => EmailAddress::parse(&inner[open + 1..]),
        (None, None) => EmailAddress::parse(source),
        _ => None,
    }
}
