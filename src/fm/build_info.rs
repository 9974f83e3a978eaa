use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("FLEETMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("FLEETMASTER_BUILD_TIME").unwrap_or("unknown")
}

pub fn git_rev() -> &'static str {
    option_env!("FLEETMASTER_GIT_REV").unwrap_or("unknown")
}

/// Render the stamped build time as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    let Some(secs) = raw.strip_prefix("epoch:").and_then(|s| s.trim().parse::<i64>().ok()) else {
        return raw.to_string();
    };
    match chrono::Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => raw.to_string(),
    }
}

pub fn banner() -> String {
    format!(
        "fleetmaster {} (rev {}, built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        git_rev(),
        build_host(),
        format_build_time(build_time_raw())
    )
}
