// Outgoing message texts

/// Escape for HTML element content
pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Escape for a double-quoted HTML attribute
pub fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;").replace('\'', "&#x27;")
}

/// Caption under a delivered video: a link back to the source and the sender.
pub fn video_caption(url: &str, source_name: &str, sender_label: &str) -> String {
    format!(
        "<a href=\"{}\">Video link ({})</a>\nFrom {}",
        escape_attr(url),
        escape_text(source_name),
        escape_text(sender_label)
    )
}

pub const FAILURE_TEXT: &str = "Could not download the video";
