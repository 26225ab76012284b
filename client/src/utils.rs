use uuid::Uuid;

/// Format seconds as M:SS (minutes are not wrapped into hours)
pub fn format_time(seconds: f64) -> String {
    let total_secs = if seconds.is_finite() {
        seconds.max(0.0) as u64
    } else {
        0
    };
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Parse a user-entered timestamp such as `5:30`, `1:02:03` or `90`
pub fn parse_timestamp(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for (index, part) in parts.iter().enumerate() {
        let value: u64 = part.trim().parse().ok()?;
        // every field after the first is a base-60 digit
        if index > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total as f64)
}

pub fn current_unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

const GUEST_COLORS: &[&str] = &[
    "#94a3b8", "#f472b6", "#34d399", "#60a5fa", "#fbbf24", "#a78bfa", "#f87171", "#2dd4bf",
];
pub const HOST_COLOR: &str = "#8b5cf6";

/// Pick a stable colour tag for a participant id
pub fn color_for(id: &str) -> &'static str {
    let sum: usize = id.bytes().map(usize::from).sum();
    GUEST_COLORS[sum % GUEST_COLORS.len()]
}

/// Random `NNN-NNN` room code
pub fn generate_room_code() -> String {
    let raw = (Uuid::new_v4().as_u128() % 1_000_000) as u32;
    format!("{:03}-{:03}", raw / 1000, raw % 1000)
}

pub fn default_display_name() -> String {
    let suffix = (Uuid::new_v4().as_u128() % 1000) as u32;
    format!("Guest-{suffix}")
}
