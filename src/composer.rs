//! Alert message template

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::location::LocationFix;

/// Name used when no user name is configured
pub const FALLBACK_NAME: &str = "Someone";

pub const APP_IDENTIFICATION_LINE: &str =
    "This message was automatically sent by Surkshit Emergency Alert System.";

pub const UNAVAILABLE_LOCATION_LINE: &str = "📍 Location: Unable to determine exact location";

pub const EMERGENCY_SERVICES_FOOTER: &str =
    "Please contact emergency services if needed: 911 (US), 112 (EU), 100 (India)";

/// A rendered alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub text: String,
    pub generated_at: DateTime<Utc>,
}

/// Renders the alert text; output depends only on the inputs
#[derive(Debug, Clone, Default)]
pub struct MessageComposer;

impl MessageComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose<Tz>(&self, name: Option<&str>, fix: Option<&LocationFix>, now: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_NAME);

        let mut text = String::from("🚨 EMERGENCY ALERT 🚨\n\n");
        text.push_str(&format!("{} needs immediate help!\n\n", name));
        text.push_str(APP_IDENTIFICATION_LINE);
        text.push_str("\n\n");

        match fix {
            Some(fix) => {
                text.push_str(&format!("📍 Location: {}\n", fix.maps_link()));
                text.push_str(&format!("Coordinates: {}\n", fix.coordinates()));
                if let Some(meters) = fix.accuracy_meters() {
                    text.push_str(&format!("Accuracy: ±{}m\n", meters));
                }
            }
            None => {
                text.push_str(UNAVAILABLE_LOCATION_LINE);
                text.push('\n');
            }
        }

        text.push_str(&format!("\n⏰ Time: {}\n", format_timestamp(now)));
        text.push('\n');
        text.push_str(EMERGENCY_SERVICES_FOOTER);

        text
    }

    /// Compose and stamp with the generation time
    pub fn compose_message<Tz>(
        &self,
        name: Option<&str>,
        fix: Option<&LocationFix>,
        now: &DateTime<Tz>,
    ) -> ComposedMessage
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        ComposedMessage {
            text: self.compose(name, fix, now),
            generated_at: now.with_timezone(&Utc),
        }
    }
}

/// en-US style local timestamp, e.g. `3/14/2025, 9:05:07 PM`
pub fn format_timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string()
}
