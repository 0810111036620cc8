use crate::domain::{PaymentStatus, Topic};
use std::str::FromStr;
use strum::IntoEnumIterator;

pub(super) fn parse_topic(topic: &str) -> Option<Topic> {
    Topic::from_str(topic.trim()).ok()
}

pub(super) fn allowed_topics() -> Vec<String> {
    Topic::iter().map(|t| t.to_string()).collect()
}

pub(super) fn parse_payment_status(status: &str) -> Option<PaymentStatus> {
    PaymentStatus::from_str(status.trim()).ok()
}
