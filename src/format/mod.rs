use chrono::{DateTime, Utc};

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1}T", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

pub fn human_time(at: Option<DateTime<Utc>>, default: &str) -> String {
    let Some(at) = at else {
        return default.to_string();
    };

    let diff = Utc::now().signed_duration_since(at);
    let plural = |n: i64| if n > 1 { "s" } else { "" };

    if diff.num_days() > 0 {
        format!("{} day{} ago", diff.num_days(), plural(diff.num_days()))
    } else if diff.num_hours() > 0 {
        format!("{} hour{} ago", diff.num_hours(), plural(diff.num_hours()))
    } else if diff.num_minutes() > 0 {
        format!("{} minute{} ago", diff.num_minutes(), plural(diff.num_minutes()))
    } else {
        "just now".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(64 * 1024 * 1024), "64.0M");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5G");
    }

    #[test]
    fn test_human_time() {
        assert_eq!(human_time(None, "never"), "never");
        assert_eq!(human_time(Some(Utc::now()), "never"), "just now");
        let earlier = Utc::now() - chrono::Duration::hours(3);
        assert_eq!(human_time(Some(earlier), "never"), "3 hours ago");
    }
}
