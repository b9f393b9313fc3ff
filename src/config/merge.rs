use super::schema::Config;

/// Environment overrides, applied last.
///
/// `WEFT_EAGER_THRESHOLD`, `WEFT_DECREMENT_CHANNEL_CAPACITY`, and
/// `WEFT_ACTIVE_MESSAGE_ID` override the corresponding fields;
/// `WEFT_LOG` overrides the logging filter.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(value) = env_usize("WEFT_EAGER_THRESHOLD") {
        config.eager_threshold = value;
    }
    if let Some(value) = env_usize("WEFT_DECREMENT_CHANNEL_CAPACITY") {
        config.decrement_channel_capacity = value;
    }
    if let Some(value) = env_u32("WEFT_ACTIVE_MESSAGE_ID") {
        config.active_message_id = value;
    }
    if let Ok(filter) = std::env::var("WEFT_LOG") {
        if !filter.is_empty() {
            config.logging.filter = Some(filter);
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    parse_env(key)
}

fn env_u32(key: &str) -> Option<u32> {
    parse_env(key)
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparsable environment override");
            None
        }
    }
}
