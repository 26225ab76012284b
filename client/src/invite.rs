use url::Url;
use urlencoding::encode;

const INVITE_SCHEME: &str = "watchparty";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub room_code: String,
}

pub fn build_invite_url(room_code: &str) -> String {
    format!("{INVITE_SCHEME}://join?room={}", encode(room_code))
}

/// Accepts full invite links, web links carrying `?room=`, a bare query
/// (`room=123-456`) or just the code.
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with(&format!("{INVITE_SCHEME}://"))
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else if trimmed.contains('=') {
        format!("{INVITE_SCHEME}://join?{trimmed}")
    } else {
        return is_room_code(trimmed).then(|| InviteLink {
            room_code: trimmed.to_string(),
        });
    };

    let url = Url::parse(&normalized).ok()?;
    // query_pairs already percent-decodes
    let room_code = url
        .query_pairs()
        .find(|(key, _)| key == "room")
        .map(|(_, value)| value.trim().to_string())
        .filter(|code| !code.is_empty())?;
    Some(InviteLink { room_code })
}

fn is_room_code(candidate: &str) -> bool {
    candidate.len() <= 32
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
