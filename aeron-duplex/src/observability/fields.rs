//! Canonical structured field keys and value-format helpers.

pub const DEFAULT_LOOP_THREAD: &str = "unknown-thread";

/// Session ids are logged in hex, matching the driver's own tooling.
pub fn format_session_id(session_id: i32) -> String {
    format!("{session_id:x}")
}

pub fn format_channel(channel: &crate::channel_uri::ChannelUri) -> String {
    channel.to_string()
}

pub fn thread_name_or_default(thread_name: Option<&str>) -> String {
    thread_name.unwrap_or(DEFAULT_LOOP_THREAD).to_string()
}

pub fn current_thread_name_or_default() -> String {
    thread_name_or_default(std::thread::current().name())
}

#[cfg(test)]
mod tests {
    use super::{format_session_id, thread_name_or_default, DEFAULT_LOOP_THREAD};

    #[test]
    fn session_ids_render_in_hex() {
        assert_eq!(format_session_id(0x2a), "2a");
        assert_eq!(format_session_id(-1), "ffffffff");
    }

    #[test]
    fn thread_name_falls_back_when_absent() {
        assert_eq!(thread_name_or_default(None), DEFAULT_LOOP_THREAD);
        assert_eq!(thread_name_or_default(Some("aeron-loop-0")), "aeron-loop-0");
    }
}
