use chrono::{DateTime, Utc};

/// Human label for how long ago `then` was, relative to `now`.
///
/// Buckets include their lower bound: 60 seconds is "1m ago", 60 minutes is
/// "1h ago", 24 hours is "1d ago", and from 7 days on the absolute date is
/// shown. Timestamps in the future read as "Just now".
pub fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(then);

    let minutes = elapsed.num_minutes();
    if elapsed.num_seconds() < 60 {
        return "Just now".to_string();
    }
    if minutes < 60 {
        return format!("{}m ago", minutes);
    }

    let hours = elapsed.num_hours();
    if hours < 24 {
        return format!("{}h ago", hours);
    }

    let days = elapsed.num_days();
    if days < 7 {
        return format!("{}d ago", days);
    }

    then.format("%b %-d, %Y").to_string()
}
